//! Per-agent inboxes used for leader notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::state::{Layout, Schema, Store};
use crate::util::{blocking, validate_name};
use crate::{tlog_debug, Result};

/// Sender name for messages generated by the coordinator itself.
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub from: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl InboxMessage {
    pub fn new(from: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.to_string(),
            text: text.to_string(),
            timestamp: Utc::now(),
            read: false,
        }
    }
}

impl Schema for InboxMessage {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.from.is_empty() {
            return Err("message sender must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    store: Store,
    layout: Layout,
}

impl Mailbox {
    pub fn new(store: Store, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Append a message to `to`'s inbox, creating it if needed.
    pub async fn deliver(
        &self,
        team: &str,
        to: &AgentId,
        from: &str,
        text: &str,
    ) -> Result<InboxMessage> {
        validate_name("Team", team)?;
        validate_name("Agent", to.as_str())?;
        let store = self.store;
        let lock = self.layout.inboxes_lock(team);
        let path = self.layout.inbox_file(team, to);
        let message = InboxMessage::new(from, text);

        let delivered = blocking(move || {
            store.locked_upsert(&lock, &path, Vec::new, |inbox: &mut Vec<InboxMessage>| {
                inbox.push(message.clone());
                Ok(message)
            })
        })
        .await?;
        tlog_debug!("Delivered message {} to {}/{}", delivered.id, team, to);
        Ok(delivered)
    }

    /// Every message in `agent`'s inbox, oldest first.
    pub async fn read_inbox(&self, team: &str, agent: &AgentId) -> Result<Vec<InboxMessage>> {
        validate_name("Team", team)?;
        validate_name("Agent", agent.as_str())?;
        let store = self.store;
        let path = self.layout.inbox_file(team, agent);
        blocking(move || Ok(store.read_optional(&path)?.unwrap_or_default())).await
    }

    pub async fn unread(&self, team: &str, agent: &AgentId) -> Result<Vec<InboxMessage>> {
        let inbox = self.read_inbox(team, agent).await?;
        Ok(inbox.into_iter().filter(|m| !m.read).collect())
    }

    /// Mark everything read and return how many messages changed.
    pub async fn mark_all_read(&self, team: &str, agent: &AgentId) -> Result<usize> {
        validate_name("Team", team)?;
        validate_name("Agent", agent.as_str())?;
        let store = self.store;
        let lock = self.layout.inboxes_lock(team);
        let path = self.layout.inbox_file(team, agent);
        blocking(move || {
            store.locked_upsert(&lock, &path, Vec::new, |inbox: &mut Vec<InboxMessage>| {
                let mut changed = 0;
                for message in inbox.iter_mut().filter(|m| !m.read) {
                    message.read = true;
                    changed += 1;
                }
                Ok(changed)
            })
        })
        .await
    }
}
