//! Settings and conversation persistence.
//!
//! Handlers only see the traits; `MemoryStore` is the embedded implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreResult, ScopeError};
use crate::model::{Conversation, ConversationDetail, Role, StoredMessage};

/// Well-known setting keys.
pub const SETTING_API_KEY: &str = "openai-key";
pub const SETTING_SELECTED_MODEL: &str = "selected-model";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> CoreResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> CoreResult<()>;
    async fn delete_setting(&self, key: &str) -> CoreResult<()>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> CoreResult<Conversation>;
    /// Most recently updated first.
    async fn list_conversations(&self) -> CoreResult<Vec<Conversation>>;
    async fn get_conversation(&self, id: &str) -> CoreResult<Option<ConversationDetail>>;
    async fn rename_conversation(&self, id: &str, title: &str) -> CoreResult<()>;
    /// Deletes the conversation and its messages. Unknown ids are not an error.
    async fn delete_conversation(&self, id: &str) -> CoreResult<()>;
    async fn add_message(&self, conversation_id: &str, role: Role, content: &str) -> CoreResult<StoredMessage>;
}

#[derive(Debug, Default)]
struct Tables {
    settings: HashMap<String, String>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<StoredMessage>>,
}

/// In-process store. Access is serialised behind one lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> CoreResult<Option<String>> {
        Ok(self.tables.read().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> CoreResult<()> {
        self.tables.write().await.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_setting(&self, key: &str) -> CoreResult<()> {
        self.tables.write().await.settings.remove(key);
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(&self, title: &str) -> CoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut t = self.tables.write().await;
        t.conversations.insert(conversation.id.clone(), conversation.clone());
        t.messages.insert(conversation.id.clone(), Vec::new());
        Ok(conversation)
    }

    async fn list_conversations(&self) -> CoreResult<Vec<Conversation>> {
        let t = self.tables.read().await;
        let mut all: Vec<Conversation> = t.conversations.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<ConversationDetail>> {
        let t = self.tables.read().await;
        Ok(t.conversations.get(id).map(|c| ConversationDetail {
            conversation: c.clone(),
            messages: t.messages.get(id).cloned().unwrap_or_default(),
        }))
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> CoreResult<()> {
        let mut t = self.tables.write().await;
        let c = t
            .conversations
            .get_mut(id)
            .ok_or_else(|| ScopeError::NotFound(format!("conversation {id}")))?;
        c.title = title.to_string();
        c.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> CoreResult<()> {
        let mut t = self.tables.write().await;
        t.conversations.remove(id);
        t.messages.remove(id);
        Ok(())
    }

    async fn add_message(&self, conversation_id: &str, role: Role, content: &str) -> CoreResult<StoredMessage> {
        if role == Role::System {
            return Err(ScopeError::Validation("role must be user or assistant".into()));
        }
        let mut t = self.tables.write().await;
        let now = Utc::now();
        let c = t
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ScopeError::NotFound(format!("conversation {conversation_id}")))?;
        c.updated_at = now;
        let message = StoredMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        };
        t.messages.entry(conversation_id.to_string()).or_default().push(message.clone());
        Ok(message)
    }
}
