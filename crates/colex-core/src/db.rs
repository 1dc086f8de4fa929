use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use postgres_types::Json;
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use tracing::info;

use crate::store::{CaseStore, Conversation, ConversationStore, NewMessage, StoredMessage};
use crate::types::{CaseState, Role};

const SCHEMA: &str = include_str!("../schema.sql");

/// Postgres-backed case and conversation storage. Each call checks out a
/// pooled connection for just that statement, so a crash mid-pipeline keeps
/// every step saved before it.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self> {
        let pg_config: tokio_postgres::Config =
            database_url.parse().context("invalid DATABASE_URL")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager).max_size(16).build()?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("database schema up to date");
        Ok(())
    }
}

fn row_to_conversation(row: &Row) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        session_id: row.try_get("session_id")?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
    })
}

fn row_to_message(row: &Row) -> Result<StoredMessage> {
    let role: String = row.try_get("role")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: Role::parse(&role).with_context(|| format!("unknown role '{role}' in messages"))?,
        content: row.try_get("content")?,
        tool_name: row.try_get("tool_name")?,
        tool_call_id: row.try_get("tool_call_id")?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
    })
}

/// The JSONB column is read as a plain value so a row written by an older
/// layout surfaces as an error naming the session.
fn decode_state(session_id: &str, value: Value) -> Result<CaseState> {
    serde_json::from_value(value)
        .with_context(|| format!("stored state for session '{session_id}' does not decode"))
}

fn row_to_state(row: &Row) -> Result<CaseState> {
    let session_id: String = row.try_get("session_id")?;
    let Json(value) = row.try_get::<_, Json<Value>>("state")?;
    decode_state(&session_id, value)
}

#[async_trait]
impl CaseStore for PgStore {
    async fn get(&self, session_id: &str) -> Result<Option<CaseState>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT session_id, state FROM case_states WHERE session_id = $1",
                &[&session_id],
            )
            .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    async fn put(&self, state: &CaseState) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO case_states (session_id, state, created_at, updated_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (session_id)
                 DO UPDATE SET state = EXCLUDED.state, updated_at = EXCLUDED.updated_at",
                &[&state.session_id, &Json(state), &state.created_at, &state.updated_at],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute("DELETE FROM case_states WHERE session_id = $1", &[&session_id])
            .await?;
        Ok(n > 0)
    }

    async fn list(&self) -> Result<Vec<CaseState>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT session_id, state FROM case_states ORDER BY updated_at DESC",
                &[],
            )
            .await?;
        rows.iter().map(row_to_state).collect()
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn create(
        &self,
        user_id: &str,
        title: &str,
        session_id: Option<&str>,
    ) -> Result<Conversation> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO conversations (user_id, title, session_id)
                 VALUES ($1, $2, $3)
                 RETURNING id, user_id, title, session_id, created_at, updated_at",
                &[&user_id, &title, &session_id],
            )
            .await?;
        row_to_conversation(&row)
    }

    async fn get(&self, id: i64, user_id: &str) -> Result<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, user_id, title, session_id, created_at, updated_at
                 FROM conversations WHERE id = $1 AND user_id = $2",
                &[&id, &user_id],
            )
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, user_id, title, session_id, created_at, updated_at
                 FROM conversations WHERE user_id = $1
                 ORDER BY updated_at DESC, id DESC",
                &[&user_id],
            )
            .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    async fn rename(&self, id: i64, user_id: &str, title: &str) -> Result<Option<Conversation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE conversations SET title = $3, updated_at = now()
                 WHERE id = $1 AND user_id = $2
                 RETURNING id, user_id, title, session_id, created_at, updated_at",
                &[&id, &user_id, &title],
            )
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn delete(&self, id: i64, user_id: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let n = client
            .execute(
                "DELETE FROM conversations WHERE id = $1 AND user_id = $2",
                &[&id, &user_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn append(&self, conversation_id: i64, messages: &[NewMessage]) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        for m in messages {
            tx.execute(
                "INSERT INTO messages (conversation_id, role, content, tool_name, tool_call_id)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &conversation_id,
                    &m.role.as_str(),
                    &m.content,
                    &m.tool_name,
                    &m.tool_call_id,
                ],
            )
            .await?;
        }
        tx.execute(
            "UPDATE conversations SET updated_at = now() WHERE id = $1",
            &[&conversation_id],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, conversation_id, role, content, tool_name, tool_call_id, created_at
                 FROM messages WHERE conversation_id = $1 ORDER BY id",
                &[&conversation_id],
            )
            .await?;
        rows.iter().map(row_to_message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_state_is_an_error_not_a_panic() {
        let mut value = serde_json::to_value(CaseState::new("old-1", "X v. Y", "text", None)).unwrap();
        assert!(decode_state("old-1", value.clone()).is_ok());

        value.as_object_mut().unwrap().remove("analysis_stage");
        let err = decode_state("old-1", value).unwrap_err();
        assert!(format!("{err:#}").contains("old-1"));
    }
}
