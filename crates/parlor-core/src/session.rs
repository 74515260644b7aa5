//! Session registry for Parlor.
//!
//! The registry is the single source of truth for who is online and which
//! room each connection occupies. Room membership counts are always derived
//! from it.

use crate::identity::{Identity, PeerInfo, UserId};
use crate::message::now_millis;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parlor_protocol::{DeviceClass, SenderView, UserView};
use thiserror::Error;
use tracing::{debug, warn};

/// A connection identifier, unique for the life of one connection.
pub type ConnectionId = String;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The user already has a live session.
    #[error("User already has a live session: {0}")]
    DuplicateSession(UserId),

    /// The connection already carries a session.
    #[error("Connection already has a session: {0}")]
    DuplicateConnection(ConnectionId),

    /// No session exists for the connection.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

/// The live binding between one connection and one authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
    pub ip: String,
    pub device: DeviceClass,
    /// `None` means the global group.
    pub current_room: Option<String>,
    pub joined_at: u64,
}

impl Session {
    /// Create a session in the global group.
    #[must_use]
    pub fn new(connection_id: impl Into<ConnectionId>, identity: &Identity, peer: &PeerInfo) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: identity.user_id.clone(),
            name: identity.name.clone(),
            avatar_url: identity.avatar_url.clone(),
            ip: peer.ip.clone(),
            device: peer.device,
            current_room: None,
            joined_at: now_millis(),
        }
    }

    /// Check if the session occupies the given room.
    #[must_use]
    pub fn is_in(&self, room_id: &str) -> bool {
        self.current_room.as_deref() == Some(room_id)
    }

    /// Public view of this session.
    #[must_use]
    pub fn to_view(&self) -> UserView {
        UserView {
            id: self.user_id.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            ip: self.ip.clone(),
            device_type: self.device,
            room_id: self.current_room.clone(),
            time: self.joined_at,
        }
    }

    /// Sender snapshot for message envelopes.
    #[must_use]
    pub fn sender_view(&self) -> SenderView {
        SenderView {
            id: self.user_id.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            ip: self.ip.clone(),
            device_type: self.device,
        }
    }
}

/// Shared registry of all live sessions.
///
/// Sessions are indexed by connection, with a secondary index by user. Login
/// admission goes through the user index entry so that two concurrent logins
/// for the same user cannot both succeed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    /// Sessions indexed by connection ID.
    sessions: DashMap<ConnectionId, Session>,
    /// User ID -> connection ID of the user's most recent session.
    by_user: DashMap<UserId, ConnectionId>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a freshly authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateSession`] if the user is already online.
    pub fn register(
        &self,
        connection_id: &str,
        identity: &Identity,
        peer: &PeerInfo,
    ) -> Result<Session, SessionError> {
        match self.by_user.entry(identity.user_id.clone()) {
            Entry::Occupied(_) => Err(SessionError::DuplicateSession(identity.user_id.clone())),
            Entry::Vacant(slot) => {
                if self.sessions.contains_key(connection_id) {
                    return Err(SessionError::DuplicateConnection(connection_id.to_string()));
                }

                let session = Session::new(connection_id, identity, peer);
                self.sessions
                    .insert(connection_id.to_string(), session.clone());
                slot.insert(connection_id.to_string());

                debug!(connection = %connection_id, user = %identity.user_id, "Session registered");
                Ok(session)
            }
        }
    }

    /// Reinstate a session from a previously issued token.
    ///
    /// Unlike [`register`](Self::register) this does not check for an existing
    /// live session of the same user, so two sessions may coexist. The user
    /// index moves to the new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection already carries a session.
    pub fn reinstate(
        &self,
        connection_id: &str,
        identity: &Identity,
        peer: &PeerInfo,
    ) -> Result<Session, SessionError> {
        if self.sessions.contains_key(connection_id) {
            return Err(SessionError::DuplicateConnection(connection_id.to_string()));
        }

        let session = Session::new(connection_id, identity, peer);
        self.sessions
            .insert(connection_id.to_string(), session.clone());
        let previous = self
            .by_user
            .insert(identity.user_id.clone(), connection_id.to_string());

        if let Some(previous) = previous {
            warn!(
                connection = %connection_id,
                previous = %previous,
                user = %identity.user_id,
                "Session reinstated while another session is live"
            );
        }

        Ok(session)
    }

    /// Look up the session of a connection.
    #[must_use]
    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<Session> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    /// Look up the most recent session of a user.
    #[must_use]
    pub fn lookup_by_user(&self, user_id: &str) -> Option<Session> {
        let connection_id = self.by_user.get(user_id)?.value().clone();
        self.lookup_by_connection(&connection_id)
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn list_all(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Connection IDs of all live sessions.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// Sessions currently in a room.
    #[must_use]
    pub fn members_of(&self, room_id: &str) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.is_in(room_id))
            .map(|s| s.value().clone())
            .collect()
    }

    /// Number of sessions currently in a room.
    #[must_use]
    pub fn count_in(&self, room_id: &str) -> usize {
        self.sessions.iter().filter(|s| s.is_in(room_id)).count()
    }

    /// Move a session to a room (`None` for the global group).
    ///
    /// Returns the room the session was in before.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::UnknownConnection`] if no session exists.
    pub fn update_room(
        &self,
        connection_id: &str,
        room_id: Option<&str>,
    ) -> Result<Option<String>, SessionError> {
        let mut session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| SessionError::UnknownConnection(connection_id.to_string()))?;

        let previous = std::mem::replace(&mut session.current_room, room_id.map(str::to_string));
        Ok(previous)
    }

    /// Move every session in a room back to the global group.
    ///
    /// Returns the evicted sessions as they were before eviction.
    pub fn evict_room(&self, room_id: &str) -> Vec<Session> {
        let mut evicted = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.is_in(room_id) {
                evicted.push(session.clone());
                session.current_room = None;
            }
        }

        debug!(room = %room_id, evicted = evicted.len(), "Evicted room members");
        evicted
    }

    /// Remove the session of a connection.
    ///
    /// Returns `None` if the connection never authenticated.
    pub fn remove(&self, connection_id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(connection_id)?;

        // Only drop the user index if it still points at this connection
        self.by_user
            .remove_if(&session.user_id, |_, conn| conn == connection_id);

        debug!(connection = %connection_id, user = %session.user_id, "Session removed");
        Some(session)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no live sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            name: format!("name-{user_id}"),
            email: format!("{user_id}@example.com"),
            avatar_url: None,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let session = registry
            .register("conn-1", &identity("u1"), &PeerInfo::default())
            .unwrap();

        assert_eq!(session.user_id, "u1");
        assert!(session.current_room.is_none());
        assert_eq!(registry.lookup_by_connection("conn-1"), Some(session.clone()));
        assert_eq!(registry.lookup_by_user("u1"), Some(session));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_second_session_for_user() {
        let registry = SessionRegistry::new();
        registry
            .register("conn-1", &identity("u1"), &PeerInfo::default())
            .unwrap();

        assert_eq!(
            registry.register("conn-2", &identity("u1"), &PeerInfo::default()),
            Err(SessionError::DuplicateSession("u1".to_string()))
        );
        assert!(registry.lookup_by_connection("conn-2").is_none());
    }

    #[test]
    fn test_reinstate_allows_two_sessions() {
        let registry = SessionRegistry::new();
        registry
            .register("conn-1", &identity("u1"), &PeerInfo::default())
            .unwrap();
        registry
            .reinstate("conn-2", &identity("u1"), &PeerInfo::default())
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup_by_user("u1").unwrap().connection_id, "conn-2");

        // Removing the stale connection keeps the index on the newer one
        registry.remove("conn-1");
        assert_eq!(registry.lookup_by_user("u1").unwrap().connection_id, "conn-2");
    }

    #[test]
    fn test_update_room_and_counts() {
        let registry = SessionRegistry::new();
        registry
            .register("conn-1", &identity("u1"), &PeerInfo::default())
            .unwrap();
        registry
            .register("conn-2", &identity("u2"), &PeerInfo::default())
            .unwrap();

        assert_eq!(registry.update_room("conn-1", Some("tech")), Ok(None));
        assert_eq!(registry.count_in("tech"), 1);
        assert_eq!(
            registry.update_room("conn-1", Some("music")),
            Ok(Some("tech".to_string()))
        );
        assert_eq!(registry.count_in("tech"), 0);
        assert_eq!(registry.members_of("music").len(), 1);

        assert_eq!(
            registry.update_room("conn-9", None),
            Err(SessionError::UnknownConnection("conn-9".to_string()))
        );
    }

    #[test]
    fn test_evict_room() {
        let registry = SessionRegistry::new();
        for (conn, user) in [("conn-1", "u1"), ("conn-2", "u2"), ("conn-3", "u3")] {
            registry
                .register(conn, &identity(user), &PeerInfo::default())
                .unwrap();
        }
        registry.update_room("conn-1", Some("tech")).unwrap();
        registry.update_room("conn-2", Some("tech")).unwrap();

        let evicted = registry.evict_room("tech");
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|s| s.is_in("tech")));
        assert_eq!(registry.count_in("tech"), 0);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.remove("conn-1").is_none());
    }

    #[test]
    fn test_concurrent_register_same_user() {
        let registry = std::sync::Arc::new(SessionRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .register(&format!("conn-{i}"), &identity("u1"), &PeerInfo::default())
                        .is_ok()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1);
        assert_eq!(registry.len(), 1);
    }
}
