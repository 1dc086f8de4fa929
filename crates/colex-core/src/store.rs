use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::types::{CaseState, Role};

// ── Case state ───────────────────────────────────────────────────────────

/// Persistence for per-session analysis state. The orchestrator is the only
/// writer.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<CaseState>>;
    async fn put(&self, state: &CaseState) -> Result<()>;
    /// Returns whether a state existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;
    async fn list(&self) -> Result<Vec<CaseState>>;
}

#[derive(Default)]
pub struct MemoryCaseStore {
    states: RwLock<HashMap<String, CaseState>>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn get(&self, session_id: &str) -> Result<Option<CaseState>> {
        Ok(self.states.read().await.get(session_id).cloned())
    }

    async fn put(&self, state: &CaseState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.states.write().await.remove(session_id).is_some())
    }

    async fn list(&self) -> Result<Vec<CaseState>> {
        let mut all: Vec<CaseState> = self.states.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}

/// One async mutex per session so runs on the same session serialise while
/// different sessions proceed in parallel.
#[derive(Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            Arc::clone(map.entry(session_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the entry for `session_id` unless a caller still holds or waits
    /// on it. Callers release their guard first.
    pub async fn forget(&self, session_id: &str) {
        let mut map = self.locks.lock().await;
        if map.get(session_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(session_id);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

// ── Conversations ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    /// Analysis session this conversation discusses, if any.
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
        }
    }
}

/// Conversations are owned by a user; lookups by another user behave as if
/// the conversation did not exist.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(
        &self,
        user_id: &str,
        title: &str,
        session_id: Option<&str>,
    ) -> Result<Conversation>;
    async fn get(&self, id: i64, user_id: &str) -> Result<Option<Conversation>>;
    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>>;
    async fn rename(&self, id: i64, user_id: &str, title: &str) -> Result<Option<Conversation>>;
    async fn delete(&self, id: i64, user_id: &str) -> Result<bool>;
    async fn append(&self, conversation_id: i64, messages: &[NewMessage]) -> Result<()>;
    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>>;
}

#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: RwLock<HashMap<i64, Conversation>>,
    messages: RwLock<HashMap<i64, Vec<StoredMessage>>>,
    next_conversation: AtomicI64,
    next_message: AtomicI64,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create(
        &self,
        user_id: &str,
        title: &str,
        session_id: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conv = Conversation {
            id: self.next_conversation.fetch_add(1, Ordering::Relaxed) + 1,
            user_id: user_id.to_string(),
            title: title.to_string(),
            session_id: session_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.conversations.write().await.insert(conv.id, conv.clone());
        Ok(conv)
    }

    async fn get(&self, id: i64, user_id: &str) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .read()
            .await
            .get(&id)
            .filter(|c| c.user_id == user_id)
            .cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let mut out: Vec<Conversation> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn rename(&self, id: i64, user_id: &str, title: &str) -> Result<Option<Conversation>> {
        let mut convs = self.conversations.write().await;
        let Some(conv) = convs.get_mut(&id).filter(|c| c.user_id == user_id) else {
            return Ok(None);
        };
        conv.title = title.to_string();
        conv.updated_at = Utc::now();
        Ok(Some(conv.clone()))
    }

    async fn delete(&self, id: i64, user_id: &str) -> Result<bool> {
        let mut convs = self.conversations.write().await;
        if !convs.get(&id).is_some_and(|c| c.user_id == user_id) {
            return Ok(false);
        }
        convs.remove(&id);
        self.messages.write().await.remove(&id);
        Ok(true)
    }

    async fn append(&self, conversation_id: i64, messages: &[NewMessage]) -> Result<()> {
        let now = Utc::now();
        let mut all = self.messages.write().await;
        let rows = all.entry(conversation_id).or_default();
        for m in messages {
            rows.push(StoredMessage {
                id: self.next_message.fetch_add(1, Ordering::Relaxed) + 1,
                conversation_id,
                role: m.role,
                content: m.content.clone(),
                tool_name: m.tool_name.clone(),
                tool_call_id: m.tool_call_id.clone(),
                created_at: now,
            });
        }
        drop(all);
        if let Some(conv) = self.conversations.write().await.get_mut(&conversation_id) {
            conv.updated_at = now;
        }
        Ok(())
    }

    async fn messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
