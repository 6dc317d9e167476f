//! External-collaborator seams: membership authorization, the user
//! directory, and direct-message persistence.
//!
//! The hub only ever asks boolean questions and issues writes; everything
//! behind these traits (SQL, document store, cache topology) belongs to
//! other services. [`redis_cache`] provides the read-through cache layer,
//! [`memory`] the in-process implementations used by tests and single-node
//! deployments.

pub mod memory;
pub mod redis_cache;
pub mod singleflight;

use std::collections::HashMap;

use async_trait::async_trait;

use banter_protocol::{DirectMessage, SnowflakeId, UserProfile};

/// Error from a backing store or its cache. Cloneable so a deduplicated
/// lookup can hand one failure to every caller that shared the flight.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Membership oracle: may this user enter that room?
///
/// Callers treat any error as "deny"; authorization must not leak across
/// backend failures.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// True iff the user is a member of the server.
    async fn is_server_member(
        &self,
        user: SnowflakeId,
        server: SnowflakeId,
    ) -> Result<bool, StoreError>;

    /// True iff the user is one of the two conversation participants.
    async fn is_conversation_participant(
        &self,
        user: SnowflakeId,
        conversation: SnowflakeId,
    ) -> Result<bool, StoreError>;
}

/// Display-name resolution for typing broadcasts. Ids that cannot be
/// resolved are simply absent from the result.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn users_batch(
        &self,
        ids: &[SnowflakeId],
    ) -> Result<HashMap<SnowflakeId, UserProfile>, StoreError>;
}

/// Direct-message persistence. DMs skip the durable log and are written
/// inline before broadcast; a failed write means no broadcast.
#[async_trait]
pub trait DirectMessageStore: Send + Sync {
    async fn create(&self, message: &DirectMessage) -> Result<(), StoreError>;
}
