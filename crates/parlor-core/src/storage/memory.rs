//! In-memory [`Storage`] backend.
//!
//! Holds accounts, rooms, message history and the presence audit trail in
//! process memory. Passwords are stored as Argon2id PHC strings.

use super::{NewAccount, PresenceAction, RoomStatePatch, Storage, StorageError};
use crate::identity::Identity;
use crate::message::{generate_id, now_millis, Envelope, Scope};
use crate::room::Room;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use parlor_protocol::MessageView;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Messages kept per scope before the oldest are dropped.
const DEFAULT_SCOPE_CAPACITY: usize = 1000;

/// Argon2id password hashing and verification.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl PasswordHasher {
    /// Create a hasher with the default Argon2id cost.
    #[must_use]
    pub fn new() -> Self {
        Self {
            params: Params::default(),
        }
    }

    /// Create a hasher with explicit cost parameters.
    #[must_use]
    pub fn with_params(params: Params) -> Self {
        Self { params }
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a plaintext password with a random salt.
    ///
    /// # Errors
    ///
    /// Returns an error if hashing fails.
    pub fn hash_password(&self, password: &str) -> Result<String, StorageError> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| StorageError::Unavailable(format!("Password hashing failed: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verify a plaintext password against a stored hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hash is malformed.
    pub fn verify_password(&self, password: &str, hash: &str) -> Result<bool, StorageError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| StorageError::Unavailable(format!("Invalid password hash: {e}")))?;

        match self.argon2().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(StorageError::Unavailable(format!(
                "Password verification failed: {e}"
            ))),
        }
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct Account {
    identity: Identity,
    password_hash: String,
}

/// One row of the presence audit trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: String,
    pub action: PresenceAction,
    pub at: u64,
}

#[derive(Debug, Default)]
struct State {
    /// Accounts keyed by email.
    accounts: HashMap<String, Account>,
    messages: HashMap<String, VecDeque<MessageView>>,
    rooms: HashMap<String, Room>,
    audit: Vec<PresenceRecord>,
}

/// Process-local storage.
#[derive(Debug)]
pub struct MemoryStorage {
    state: Mutex<State>,
    hasher: PasswordHasher,
    scope_capacity: usize,
    offline: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_hasher(PasswordHasher::new())
    }

    /// Create an empty store with a specific password hasher.
    #[must_use]
    pub fn with_hasher(hasher: PasswordHasher) -> Self {
        Self {
            state: Mutex::new(State::default()),
            hasher,
            scope_capacity: DEFAULT_SCOPE_CAPACITY,
            offline: AtomicBool::new(false),
        }
    }

    /// Set how many messages are kept per scope.
    #[must_use]
    pub fn scope_capacity(mut self, capacity: usize) -> Self {
        self.scope_capacity = capacity.max(1);
        self
    }

    /// Simulate an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("storage offline".to_string()));
        }
        Ok(())
    }

    /// Snapshot of the presence audit trail.
    pub async fn audit_log(&self) -> Vec<PresenceRecord> {
        self.state.lock().await.audit.clone()
    }

    /// Snapshot of a persisted room.
    pub async fn room(&self, room_id: &str) -> Option<Room> {
        self.state.lock().await.rooms.get(room_id).cloned()
    }

    /// Number of stored messages across all scopes.
    pub async fn message_count(&self) -> usize {
        self.state
            .lock()
            .await
            .messages
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn validate_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, StorageError> {
        self.ensure_online()?;

        let account = self.state.lock().await.accounts.get(email).cloned();
        let Some(account) = account else {
            return Ok(None);
        };

        if self.hasher.verify_password(password, &account.password_hash)? {
            Ok(Some(account.identity))
        } else {
            Ok(None)
        }
    }

    async fn create_account(&self, account: NewAccount) -> Result<Identity, StorageError> {
        self.ensure_online()?;

        // Hash outside the lock; the uniqueness checks below are what must be atomic
        let password_hash = self.hasher.hash_password(&account.password)?;

        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.email) {
            return Err(StorageError::EmailTaken);
        }
        if state
            .accounts
            .values()
            .any(|a| a.identity.name == account.name)
        {
            return Err(StorageError::NameTaken);
        }

        let identity = Identity {
            user_id: generate_id("user"),
            name: account.name,
            email: account.email.clone(),
            avatar_url: account.avatar_url,
        };
        state.accounts.insert(
            account.email,
            Account {
                identity: identity.clone(),
                password_hash,
            },
        );

        debug!(user = %identity.user_id, "Account created");
        Ok(identity)
    }

    async fn persist_message(&self, envelope: &Envelope) -> Result<(), StorageError> {
        self.ensure_online()?;

        let Some(scope) = envelope.recipient.scope() else {
            warn!("Refusing to persist a direct message");
            return Ok(());
        };

        let mut state = self.state.lock().await;
        let history = state.messages.entry(scope.id().to_string()).or_default();
        history.push_back(envelope.to_view());
        while history.len() > self.scope_capacity {
            history.pop_front();
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        scope: &Scope,
        limit: usize,
    ) -> Result<Vec<MessageView>, StorageError> {
        self.ensure_online()?;

        let state = self.state.lock().await;
        let Some(history) = state.messages.get(scope.id()) else {
            return Ok(Vec::new());
        };

        let skip = history.len().saturating_sub(limit);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn persist_room(&self, room: &Room) -> Result<(), StorageError> {
        self.ensure_online()?;

        let mut state = self.state.lock().await;
        if state.rooms.contains_key(&room.id) {
            return Err(StorageError::RoomExists(room.id.clone()));
        }
        state.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn update_room_state(
        &self,
        room_id: &str,
        patch: RoomStatePatch,
    ) -> Result<(), StorageError> {
        self.ensure_online()?;

        let mut state = self.state.lock().await;
        // Updating a room that was deleted concurrently is not an error
        if let Some(room) = state.rooms.get_mut(room_id) {
            if let Some(is_open) = patch.is_open {
                room.is_open = is_open;
            }
            if let Some(count) = patch.user_count {
                room.current_users = count;
            }
        }
        Ok(())
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StorageError> {
        self.ensure_online()?;

        let mut state = self.state.lock().await;
        state.rooms.remove(room_id);
        state.messages.remove(room_id);
        Ok(())
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StorageError> {
        self.ensure_online()?;
        Ok(self.state.lock().await.rooms.values().cloned().collect())
    }

    async fn record_presence(
        &self,
        identity: &Identity,
        action: PresenceAction,
    ) -> Result<(), StorageError> {
        self.ensure_online()?;

        self.state.lock().await.audit.push(PresenceRecord {
            user_id: identity.user_id.clone(),
            action,
            at: now_millis(),
        });
        Ok(())
    }
}
