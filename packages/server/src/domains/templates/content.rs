//! Channel-shaped rendered content.

use serde::{Deserialize, Serialize};

/// What the renderer hands to a channel sender. One variant per channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum Content {
    Email {
        subject: String,
        html_body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_body: Option<String>,
    },
    Sms {
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    Whatsapp {
        template_name: String,
        language: String,
        body: String,
    },
    Push {
        title: String,
        body: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_url: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_serializes_with_channel_tag() {
        let content = Content::Sms {
            body: "hello".to_string(),
            sender_id: None,
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["channel"], "sms");
        assert_eq!(json["body"], "hello");
        assert!(json.get("sender_id").is_none());
    }
}
