//! Persistence contract.
//!
//! The engine never talks to a database directly. Everything durable goes
//! through [`Storage`], and every call is bounded by a timeout so a stalled
//! backend degrades into a failed action instead of a stuck connection.

pub mod memory;

pub use memory::{MemoryStorage, PasswordHasher};

use crate::identity::Identity;
use crate::message::{Envelope, Scope};
use crate::room::Room;
use async_trait::async_trait;
use parlor_protocol::MessageView;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Email is already registered")]
    EmailTaken,

    #[error("Name is already taken")]
    NameTaken,

    #[error("Room already exists: {0}")]
    RoomExists(String),

    #[error("Storage timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Profile submitted by a registering user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password: String,
    pub avatar_url: Option<String>,
}

/// Partial update of a room's persisted state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomStatePatch {
    pub is_open: Option<bool>,
    pub user_count: Option<usize>,
}

impl RoomStatePatch {
    /// Patch that only sets the open flag.
    #[must_use]
    pub fn open(is_open: bool) -> Self {
        Self {
            is_open: Some(is_open),
            user_count: None,
        }
    }

    /// Patch that only sets the member count.
    #[must_use]
    pub fn user_count(count: usize) -> Self {
        Self {
            is_open: None,
            user_count: Some(count),
        }
    }
}

/// Audited presence transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceAction {
    Login,
    Logout,
}

/// Durable backend for accounts, rooms, messages and presence audit.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Check credentials. `None` covers both an unknown email and a wrong
    /// password.
    async fn validate_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, StorageError>;

    /// Create an account. The email and name checks are atomic with the insert.
    async fn create_account(&self, account: NewAccount) -> Result<Identity, StorageError>;

    /// Persist a group or room message.
    async fn persist_message(&self, envelope: &Envelope) -> Result<(), StorageError>;

    /// The most recent `limit` messages of a scope, oldest first.
    async fn recent_messages(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<MessageView>, StorageError>;

    async fn persist_room(&self, room: &Room) -> Result<(), StorageError>;

    async fn update_room_state(
        &self,
        room_id: &str,
        patch: RoomStatePatch,
    ) -> Result<(), StorageError>;

    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError>;

    /// Every persisted room, used to rebuild the directory at startup.
    async fn list_rooms(&self) -> Result<Vec<Room>, StorageError>;

    /// Append a login or logout record to the audit trail.
    async fn record_presence(
        &self,
        identity: &Identity,
        action: PresenceAction,
    ) -> Result<(), StorageError>;
}

/// Await a storage call, failing with [`StorageError::Timeout`] after `limit`.
///
/// # Errors
///
/// Returns the call's own error, or a timeout.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StorageError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StorageError>(())
        };

        assert_eq!(
            bounded(Duration::from_secs(1), slow).await,
            Err(StorageError::Timeout(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn test_bounded_passes_through() {
        let fast = async { Err::<(), _>(StorageError::NameTaken) };
        assert_eq!(
            bounded(Duration::from_secs(1), fast).await,
            Err(StorageError::NameTaken)
        );
    }

    #[test]
    fn test_patch_helpers() {
        assert_eq!(RoomStatePatch::open(false).is_open, Some(false));
        assert_eq!(RoomStatePatch::user_count(3).user_count, Some(3));
        assert!(RoomStatePatch::user_count(3).is_open.is_none());
    }
}
