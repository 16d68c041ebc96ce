//! Template rendering for pipeline jobs.
//!
//! Template authoring lives upstream; this module only resolves a template
//! version and substitutes `{{variable}}` placeholders from the contact's
//! fields and attributes into channel-shaped content.

pub mod content;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::domains::contacts::Contact;
use crate::domains::pipeline::models::Channel;

pub use content::Content;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template version {0} not found")]
    NotFound(Uuid),

    #[error("job has no template version")]
    Missing,

    #[error("template render failed: {0}")]
    Render(String),
}

/// Narrow interface onto the upstream template service.
#[async_trait]
pub trait TemplateService: Send + Sync {
    async fn render_for_pipeline(
        &self,
        template_version_id: Option<Uuid>,
        contact: &Contact,
        channel: Channel,
    ) -> Result<Content, TemplateError>;
}

/// A persisted template version row.
#[derive(FromRow, Debug, Clone)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    /// Channel extras: whatsapp template name/language, push image and
    /// action urls, sms sender id.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

pub struct PgTemplateService {
    pool: PgPool,
}

impl PgTemplateService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateService for PgTemplateService {
    async fn render_for_pipeline(
        &self,
        template_version_id: Option<Uuid>,
        contact: &Contact,
        channel: Channel,
    ) -> Result<Content, TemplateError> {
        let version_id = template_version_id.ok_or(TemplateError::Missing)?;

        let version = sqlx::query_as::<_, TemplateVersion>(
            "SELECT * FROM template_versions WHERE id = $1",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TemplateError::Render(e.to_string()))?
        .ok_or(TemplateError::NotFound(version_id))?;

        render_version(&version, contact, channel)
    }
}

/// Render a resolved version for a contact into channel-shaped content.
pub fn render_version(
    version: &TemplateVersion,
    contact: &Contact,
    channel: Channel,
) -> Result<Content, TemplateError> {
    let body = substitute(&version.body, contact);
    let subject = version
        .subject
        .as_deref()
        .map(|s| substitute(s, contact))
        .unwrap_or_default();
    let meta = |key: &str| {
        version
            .metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    match channel {
        Channel::Email => Ok(Content::Email {
            subject,
            html_body: body,
            text_body: None,
        }),
        Channel::Sms => Ok(Content::Sms {
            body,
            sender_id: meta("sender_id"),
        }),
        Channel::Whatsapp => {
            let template_name = meta("template_name")
                .ok_or_else(|| TemplateError::Render("whatsapp template_name missing".into()))?;
            Ok(Content::Whatsapp {
                template_name,
                language: meta("language").unwrap_or_else(|| "en".to_string()),
                body,
            })
        }
        Channel::Push => Ok(Content::Push {
            title: if subject.is_empty() {
                meta("title").unwrap_or_default()
            } else {
                subject
            },
            body,
            image_url: meta("image_url"),
            action_url: meta("action_url"),
        }),
    }
}

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder regex is valid");
}

/// Replace `{{variable}}` placeholders with the contact's fields and
/// attributes. Unknown placeholders render as empty strings.
pub fn substitute(template: &str, contact: &Contact) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match key {
                "full_name" => contact.full_name.clone().unwrap_or_default(),
                "email" => contact.email.clone().unwrap_or_default(),
                "phone" => contact.phone.clone().unwrap_or_default(),
                _ => contact.attribute(key).unwrap_or_default().to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: Some("ada@example.com".to_string()),
            phone: None,
            full_name: Some("Ada".to_string()),
            attributes: serde_json::json!({"company": "Analytical Engines"}),
            unsubscribed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn version(channel: Channel, subject: Option<&str>, body: &str) -> TemplateVersion {
        TemplateVersion {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel,
            subject: subject.map(str::to_string),
            body: body.to_string(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn substitutes_fields_and_attributes() {
        let rendered = substitute("Hi {{full_name}} from {{company}}!", &contact());
        assert_eq!(rendered, "Hi Ada from Analytical Engines!");
    }

    #[test]
    fn unknown_placeholders_render_empty() {
        let rendered = substitute("Hi {{nickname}}!", &contact());
        assert_eq!(rendered, "Hi !");
    }

    #[test]
    fn renders_email_content() {
        let v = version(Channel::Email, Some("Welcome {{full_name}}"), "<p>Hello {{full_name}}</p>");
        let content = render_version(&v, &contact(), Channel::Email).unwrap();
        match content {
            Content::Email {
                subject, html_body, ..
            } => {
                assert_eq!(subject, "Welcome Ada");
                assert_eq!(html_body, "<p>Hello Ada</p>");
            }
            other => panic!("expected email content, got {other:?}"),
        }
    }

    #[test]
    fn whatsapp_requires_template_name() {
        let v = version(Channel::Whatsapp, None, "hola");
        let err = render_version(&v, &contact(), Channel::Whatsapp).unwrap_err();
        assert!(matches!(err, TemplateError::Render(_)));
    }
}
