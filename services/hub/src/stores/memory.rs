//! In-memory store implementations.
//!
//! Tests seed these directly; the binary also wires them as the backing
//! layer when no external store integration is configured.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use banter_protocol::{DirectMessage, SnowflakeId, UserProfile};

use super::{DirectMessageStore, MembershipStore, StoreError, UserDirectory};

/// Membership tables held in process memory.
#[derive(Default)]
pub struct MemoryMembership {
    servers: RwLock<HashMap<SnowflakeId, HashSet<SnowflakeId>>>,
    conversations: RwLock<HashMap<SnowflakeId, (SnowflakeId, SnowflakeId)>>,
}

impl MemoryMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn grant_server_member(&self, server: SnowflakeId, user: SnowflakeId) {
        self.servers
            .write()
            .expect("membership table poisoned")
            .entry(server)
            .or_default()
            .insert(user);
    }

    pub fn set_conversation(&self, conversation: SnowflakeId, a: SnowflakeId, b: SnowflakeId) {
        self.conversations
            .write()
            .expect("conversation table poisoned")
            .insert(conversation, (a, b));
    }
}

#[async_trait]
impl MembershipStore for MemoryMembership {
    async fn is_server_member(
        &self,
        user: SnowflakeId,
        server: SnowflakeId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .servers
            .read()
            .expect("membership table poisoned")
            .get(&server)
            .is_some_and(|members| members.contains(&user)))
    }

    async fn is_conversation_participant(
        &self,
        user: SnowflakeId,
        conversation: SnowflakeId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .conversations
            .read()
            .expect("conversation table poisoned")
            .get(&conversation)
            .is_some_and(|(a, b)| *a == user || *b == user))
    }
}

/// User directory over a plain map.
#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<SnowflakeId, UserProfile>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, profile: UserProfile) {
        self.users
            .write()
            .expect("user table poisoned")
            .insert(profile.id, profile);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn users_batch(
        &self,
        ids: &[SnowflakeId],
    ) -> Result<HashMap<SnowflakeId, UserProfile>, StoreError> {
        let users = self.users.read().expect("user table poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| users.get(id).map(|profile| (*id, profile.clone())))
            .collect())
    }
}

/// Direct messages appended to a vector, inspectable by tests.
#[derive(Default)]
pub struct MemoryDirectMessageStore {
    messages: RwLock<Vec<DirectMessage>>,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryDirectMessageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<DirectMessage> {
        self.messages.read().expect("message log poisoned").clone()
    }

    /// Make subsequent writes fail, for persist-failure tests.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl DirectMessageStore for MemoryDirectMessageStore {
    async fn create(&self, message: &DirectMessage) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(StoreError::Backend("writes disabled".to_owned()));
        }
        self.messages
            .write()
            .expect("message log poisoned")
            .push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_answers_for_servers_and_conversations() {
        let membership = MemoryMembership::new();
        membership.grant_server_member(SnowflakeId(42), SnowflakeId(1001));
        membership.set_conversation(SnowflakeId(7), SnowflakeId(1001), SnowflakeId(1002));

        assert!(membership
            .is_server_member(SnowflakeId(1001), SnowflakeId(42))
            .await
            .expect("lookup"));
        assert!(!membership
            .is_server_member(SnowflakeId(1002), SnowflakeId(42))
            .await
            .expect("lookup"));
        assert!(membership
            .is_conversation_participant(SnowflakeId(1002), SnowflakeId(7))
            .await
            .expect("lookup"));
        assert!(!membership
            .is_conversation_participant(SnowflakeId(1003), SnowflakeId(7))
            .await
            .expect("lookup"));
    }

    #[tokio::test]
    async fn users_batch_returns_only_known_ids() {
        let directory = MemoryUserDirectory::new();
        directory.insert(UserProfile {
            id: SnowflakeId(1001),
            name: "ada".to_owned(),
        });

        let profiles = directory
            .users_batch(&[SnowflakeId(1001), SnowflakeId(9999)])
            .await
            .expect("batch lookup");
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[&SnowflakeId(1001)].name, "ada");
    }

    #[tokio::test]
    async fn direct_message_store_records_and_can_fail() {
        let store = MemoryDirectMessageStore::new();
        let message = DirectMessage {
            id: SnowflakeId(1),
            content: "hey".to_owned(),
            file_url: None,
            user_id: SnowflakeId(1001),
            conversation_id: SnowflakeId(7),
        };
        store.create(&message).await.expect("write enabled");
        assert_eq!(store.messages().len(), 1);

        store.fail_writes(true);
        assert!(store.create(&message).await.is_err());
        assert_eq!(store.messages().len(), 1);
    }
}
