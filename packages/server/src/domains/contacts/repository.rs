//! Narrow interface onto the upstream contact service.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{Contact, NewTimelineEvent};

#[async_trait]
pub trait ContactRepository: Send + Sync {
    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Contact>>;

    /// Append a timeline entry. Callers on the webhook path treat failures
    /// as best-effort.
    async fn create_timeline_event(&self, event: NewTimelineEvent) -> Result<()>;

    /// Revoke messaging consent (spam report / unsubscribe).
    async fn revoke_consent(&self, tenant_id: Uuid, contact_id: Uuid) -> Result<()>;
}

pub struct PgContactRepository {
    pool: PgPool,
}

impl PgContactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContactRepository for PgContactRepository {
    async fn find_by_id(&self, tenant_id: Uuid, id: Uuid) -> Result<Option<Contact>> {
        let contact = sqlx::query_as::<_, Contact>(
            "SELECT * FROM contacts WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contact)
    }

    async fn create_timeline_event(&self, event: NewTimelineEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contact_timeline_events (id, tenant_id, contact_id, kind, data, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event.tenant_id)
        .bind(event.contact_id)
        .bind(event.kind)
        .bind(&event.data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_consent(&self, tenant_id: Uuid, contact_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE contacts
            SET unsubscribed = TRUE,
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(contact_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
