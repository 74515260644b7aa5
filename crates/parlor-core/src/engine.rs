//! Presence and routing engine for Parlor.
//!
//! The engine validates inbound events against the session registry and the
//! room directory, applies state transitions, persists through [`Storage`],
//! and pushes outbound events through the [`Outbox`].
//!
//! Locking rules:
//!
//! - A room's directory entry is taken before any registry shard, never the
//!   other way around.
//! - A connection's entry is taken before the registry during activation.
//! - No map guard is held across an `.await`.

use crate::auth::{TokenError, TokenIssuer};
use crate::identity::{Identity, PeerInfo};
use crate::media::{MediaError, MediaStore};
use crate::message::{generate_id, Envelope, Recipient, Scope};
use crate::outbox::{OutboundReceiver, Outbox};
use crate::room::{Room, RoomDirectory, RoomError};
use crate::session::{ConnectionId, Session, SessionError, SessionRegistry};
use crate::storage::{self, NewAccount, PresenceAction, RoomStatePatch, Storage, StorageError};
use dashmap::DashMap;
use parlor_protocol::{
    ClientEvent, ContentType, MessageView, ServerEvent, SystemAction, Target, TargetKind,
    GLOBAL_GROUP_ID,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Times a count projection is recomputed when membership keeps moving.
const COUNT_SYNC_ATTEMPTS: usize = 3;

/// Errors reported back to the connection that triggered them.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("User is already online")]
    AlreadyOnline,

    #[error("Email is already registered")]
    EmailTaken,

    #[error("Name is already taken")]
    NameTaken,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Room is closed: {0}")]
    RoomClosed(String),

    #[error("Room is full: {0}")]
    RoomFull(String),

    #[error("Only the room owner can do that")]
    NotOwner,

    #[error("Room capacity must be at least 1")]
    InvalidCapacity,

    #[error("Room already exists: {0}")]
    RoomExists(String),

    #[error("{0}")]
    InvalidRoomName(&'static str),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Token(#[from] TokenError),
}

impl ChatError {
    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::InvalidCredentials => "invalid_credentials",
            ChatError::AlreadyOnline => "already_online",
            ChatError::EmailTaken => "email_taken",
            ChatError::NameTaken => "name_taken",
            ChatError::RoomNotFound(_) => "room_not_found",
            ChatError::RoomClosed(_) => "room_closed",
            ChatError::RoomFull(_) => "room_full",
            ChatError::NotOwner => "not_owner",
            ChatError::InvalidCapacity => "invalid_capacity",
            ChatError::RoomExists(_) => "room_exists",
            ChatError::InvalidRoomName(_) => "invalid_room_name",
            ChatError::UnknownConnection(_) => "unknown_connection",
            ChatError::NotAuthenticated => "not_authenticated",
            ChatError::InvalidToken => "invalid_token",
            ChatError::StorageUnavailable(_) => "storage_unavailable",
            ChatError::Media(_) => "media",
            ChatError::Token(_) => "token",
        }
    }
}

impl From<StorageError> for ChatError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EmailTaken => ChatError::EmailTaken,
            StorageError::NameTaken => ChatError::NameTaken,
            StorageError::RoomExists(id) => ChatError::RoomExists(id),
            other => ChatError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<SessionError> for ChatError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::DuplicateSession(_) | SessionError::DuplicateConnection(_) => {
                ChatError::AlreadyOnline
            }
            SessionError::UnknownConnection(id) => ChatError::UnknownConnection(id),
        }
    }
}

impl From<RoomError> for ChatError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::NotFound(id) => ChatError::RoomNotFound(id),
            RoomError::NotOwner => ChatError::NotOwner,
            RoomError::InvalidCapacity => ChatError::InvalidCapacity,
            RoomError::Exists(id) => ChatError::RoomExists(id),
            RoomError::InvalidName(reason) => ChatError::InvalidRoomName(reason),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages replayed on login and room join.
    pub history_limit: usize,
    /// Capacity of rooms created without one.
    pub default_max_users: u32,
    /// Upper bound on every storage call.
    pub storage_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            default_max_users: 50,
            storage_timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Anonymous,
    Authenticating,
    Active,
    Disconnected,
}

/// What the gateway should do after an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// A room creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRoom {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub max_users: Option<i64>,
}

#[derive(Debug)]
struct Connection {
    state: ConnectionState,
    peer: PeerInfo,
}

/// How an identity reached the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Credentials or registration: duplicate-checked, audited, history sent.
    Fresh,
    /// Token reconnect: skips the duplicate check.
    Reconnect,
}

/// Engine statistics.
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub connections: usize,
    pub sessions: usize,
    pub open_rooms: usize,
}

/// The presence and routing engine.
pub struct Engine {
    connections: DashMap<ConnectionId, Connection>,
    sessions: SessionRegistry,
    rooms: RoomDirectory,
    outbox: Outbox,
    storage: Arc<dyn Storage>,
    tokens: Arc<dyn TokenIssuer>,
    media: Arc<dyn MediaStore>,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with empty registry and directory.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        tokens: Arc<dyn TokenIssuer>,
        media: Arc<dyn MediaStore>,
        config: EngineConfig,
    ) -> Self {
        info!("Creating engine with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            sessions: SessionRegistry::new(),
            rooms: RoomDirectory::new(),
            outbox: Outbox::new(),
            storage,
            tokens,
            media,
            config,
        }
    }

    /// Rebuild the room directory from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot list rooms.
    pub async fn restore_rooms(&self) -> Result<usize, ChatError> {
        let rooms = self.bounded(self.storage.list_rooms()).await?;
        Ok(self.rooms.load(rooms))
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            connections: self.connections.len(),
            sessions: self.sessions.len(),
            open_rooms: self.rooms.open_count(),
        }
    }

    /// State of a connection. Unknown connections count as disconnected.
    #[must_use]
    pub fn connection_state(&self, connection_id: &str) -> ConnectionState {
        self.connections
            .get(connection_id)
            .map_or(ConnectionState::Disconnected, |c| c.state)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        storage::bounded(self.config.storage_timeout, call).await
    }

    // ---- connection lifecycle ----

    /// Accept a new, anonymous connection.
    ///
    /// Returns the queue the gateway drains into the socket.
    pub fn connect(&self, connection_id: &str, peer: PeerInfo) -> OutboundReceiver {
        self.connections.insert(
            connection_id.to_string(),
            Connection {
                state: ConnectionState::Anonymous,
                peer,
            },
        );
        debug!(connection = %connection_id, "Connection accepted");
        self.outbox.attach(connection_id)
    }

    fn begin_authentication(&self, connection_id: &str) -> Result<(), ChatError> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| ChatError::UnknownConnection(connection_id.to_string()))?;

        match connection.state {
            ConnectionState::Anonymous => {
                connection.state = ConnectionState::Authenticating;
                Ok(())
            }
            _ => Err(ChatError::AlreadyOnline),
        }
    }

    fn abort_authentication(&self, connection_id: &str) {
        if let Some(mut connection) = self.connections.get_mut(connection_id) {
            if connection.state == ConnectionState::Authenticating {
                connection.state = ConnectionState::Anonymous;
            }
        }
    }

    /// Bind an identity to the connection.
    ///
    /// Runs under the connection's entry so a concurrent disconnect either
    /// happens before (and activation fails) or after (and sees the session).
    fn activate(
        &self,
        connection_id: &str,
        identity: &Identity,
        admission: Admission,
    ) -> Result<Session, ChatError> {
        let mut connection = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| ChatError::UnknownConnection(connection_id.to_string()))?;

        let registered = match admission {
            Admission::Fresh => self.sessions.register(connection_id, identity, &connection.peer),
            Admission::Reconnect => self.sessions.reinstate(connection_id, identity, &connection.peer),
        };

        match registered {
            Ok(session) => {
                connection.state = ConnectionState::Active;
                Ok(session)
            }
            Err(err) => {
                connection.state = ConnectionState::Anonymous;
                Err(err.into())
            }
        }
    }

    async fn admit(
        &self,
        connection_id: &str,
        identity: Identity,
        admission: Admission,
    ) -> Result<Session, ChatError> {
        let token = match self.tokens.issue(&identity) {
            Ok(token) => token,
            Err(err) => {
                self.abort_authentication(connection_id);
                return Err(err.into());
            }
        };

        let session = self.activate(connection_id, &identity, admission)?;
        let user = session.to_view();

        if admission == Admission::Fresh {
            if let Err(err) = self
                .bounded(self.storage.record_presence(&identity, PresenceAction::Login))
                .await
            {
                warn!(connection = %connection_id, error = %err, "Failed to record login");
            }
        }

        let online_users = self.sessions.list_all().iter().map(Session::to_view).collect();
        self.outbox.send_to(
            connection_id,
            ServerEvent::LoginSuccess {
                user: user.clone(),
                token,
                online_users,
            },
        );

        self.outbox.broadcast(
            self.active_except(connection_id),
            ServerEvent::System {
                user,
                action: SystemAction::Join,
            },
        );

        if admission == Admission::Fresh {
            match self.history(&Scope::Group).await {
                Ok(messages) => {
                    self.outbox.send_to(
                        connection_id,
                        ServerEvent::HistoryMessage {
                            scope_id: GLOBAL_GROUP_ID.to_string(),
                            messages,
                        },
                    );
                }
                Err(err) => {
                    warn!(connection = %connection_id, error = %err, "Failed to load group history");
                }
            }
        }

        debug!(connection = %connection_id, user = %session.user_id, ?admission, "Session active");
        Ok(session)
    }

    /// Authenticate with email and password.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials`, `AlreadyOnline`, or a storage failure.
    pub async fn login(
        &self,
        connection_id: &str,
        email: &str,
        password: &str,
    ) -> Result<Session, ChatError> {
        self.begin_authentication(connection_id)?;

        let identity = match self
            .bounded(self.storage.validate_credentials(email, password))
            .await
        {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                self.abort_authentication(connection_id);
                return Err(ChatError::InvalidCredentials);
            }
            Err(err) => {
                self.abort_authentication(connection_id);
                return Err(err.into());
            }
        };

        self.admit(connection_id, identity, Admission::Fresh).await
    }

    /// Create an account and log in with it.
    ///
    /// # Errors
    ///
    /// Returns `EmailTaken`, `NameTaken`, or a storage failure.
    pub async fn register(
        &self,
        connection_id: &str,
        account: NewAccount,
    ) -> Result<Session, ChatError> {
        self.begin_authentication(connection_id)?;

        let identity = match self.bounded(self.storage.create_account(account)).await {
            Ok(identity) => identity,
            Err(err) => {
                self.abort_authentication(connection_id);
                return Err(err.into());
            }
        };

        self.admit(connection_id, identity, Admission::Fresh).await
    }

    /// Resume a session from a previously issued token.
    ///
    /// This path does not check for an existing live session of the same
    /// user, so a reconnect may leave two sessions for one user.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` if the token does not verify.
    pub async fn reconnect(&self, connection_id: &str, token: &str) -> Result<Session, ChatError> {
        let identity = self.tokens.verify(token).ok_or(ChatError::InvalidToken)?;
        self.begin_authentication(connection_id)?;
        self.admit(connection_id, identity, Admission::Reconnect).await
    }

    /// Tear down a connection.
    ///
    /// Anonymous connections vanish silently. Active ones leave their room,
    /// are announced as logged out, and are audited.
    pub async fn disconnect(&self, connection_id: &str, reason: Option<&str>) {
        // Removing the connection first makes any in-flight activation fail
        if self.connections.remove(connection_id).is_none() {
            return;
        }
        self.outbox.detach(connection_id);

        let Some(session) = self.sessions.remove(connection_id) else {
            debug!(connection = %connection_id, ?reason, "Anonymous connection closed");
            return;
        };

        if let Some(room_id) = session.current_room.as_deref() {
            self.depart(&session, room_id).await;
            self.broadcast_rooms_updated();
        }

        self.outbox.broadcast(
            self.sessions.connection_ids(),
            ServerEvent::System {
                user: session.to_view(),
                action: SystemAction::Logout,
            },
        );

        let identity = Identity {
            user_id: session.user_id.clone(),
            name: session.name.clone(),
            email: String::new(),
            avatar_url: session.avatar_url.clone(),
        };
        if let Err(err) = self
            .bounded(self.storage.record_presence(&identity, PresenceAction::Logout))
            .await
        {
            warn!(connection = %connection_id, error = %err, "Failed to record logout");
        }

        debug!(connection = %connection_id, user = %session.user_id, ?reason, "Session closed");
    }

    // ---- messaging ----

    fn active_session(&self, connection_id: &str) -> Result<Session, ChatError> {
        self.sessions
            .lookup_by_connection(connection_id)
            .ok_or(ChatError::NotAuthenticated)
    }

    fn active_except<'a>(&'a self, connection_id: &'a str) -> impl Iterator<Item = ConnectionId> + 'a {
        self.sessions
            .connection_ids()
            .into_iter()
            .filter(move |id| id != connection_id)
    }

    /// Replace inline image payloads with a stored reference.
    async fn prepare_content(
        &self,
        content: String,
        content_type: ContentType,
    ) -> Result<String, ChatError> {
        match content_type {
            ContentType::Text => Ok(content),
            ContentType::Image => Ok(self.media.store_image(&content).await?),
        }
    }

    async fn history(&self, scope: &Scope) -> Result<Vec<MessageView>, StorageError> {
        self.bounded(self.storage.recent_messages(scope, self.config.history_limit))
            .await
    }

    /// Send a direct, group, or room message.
    ///
    /// Group and room messages are persisted before anyone sees them.
    /// Direct messages are delivered only and never stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is not logged in, the room is not
    /// usable, or persistence fails.
    pub async fn send_message(
        &self,
        connection_id: &str,
        to: Target,
        content: String,
        content_type: ContentType,
    ) -> Result<(), ChatError> {
        let sender = self.active_session(connection_id)?;

        match to.kind {
            TargetKind::User => {
                let target = self
                    .sessions
                    .lookup_by_user(&to.id)
                    .or_else(|| {
                        to.room_id
                            .as_deref()
                            .and_then(|conn| self.sessions.lookup_by_connection(conn))
                    })
                    .filter(|target| target.connection_id != connection_id);

                let Some(target) = target else {
                    debug!(connection = %connection_id, to = %to.id, "Direct recipient offline");
                    return Ok(());
                };

                let content = self.prepare_content(content, content_type).await?;
                let envelope = Envelope::new(
                    &sender,
                    Recipient::Direct {
                        user_id: target.user_id,
                        name: target.name,
                        connection_id: target.connection_id,
                    },
                    content,
                    content_type,
                );
                if let Recipient::Direct { connection_id, .. } = &envelope.recipient {
                    self.outbox.send_to(
                        connection_id,
                        ServerEvent::Message {
                            to: envelope.recipient.to_target(),
                            from: envelope.sender,
                            content: envelope.content,
                            content_type,
                        },
                    );
                }
            }
            TargetKind::Group => {
                let content = self.prepare_content(content, content_type).await?;
                let envelope = Envelope::new(&sender, Recipient::Group, content, content_type);
                self.bounded(self.storage.persist_message(&envelope)).await?;

                self.outbox.broadcast(
                    self.active_except(connection_id),
                    ServerEvent::Message {
                        from: envelope.sender,
                        to,
                        content: envelope.content,
                        content_type,
                    },
                );
            }
            TargetKind::Room => {
                let envelope = self
                    .persist_room_message(&sender, &to.id, content, content_type)
                    .await?;
                self.outbox.broadcast(
                    self.room_peers(&to.id, connection_id),
                    ServerEvent::Message {
                        from: envelope.sender,
                        to,
                        content: envelope.content,
                        content_type,
                    },
                );
            }
        }

        trace!(connection = %connection_id, kind = ?content_type, "Message routed");
        Ok(())
    }

    /// Broadcast a message to everyone else in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is unknown or closed, or persistence fails.
    pub async fn send_room_message(
        &self,
        connection_id: &str,
        room_id: &str,
        content: String,
        content_type: ContentType,
    ) -> Result<(), ChatError> {
        let sender = self.active_session(connection_id)?;
        let envelope = self
            .persist_room_message(&sender, room_id, content, content_type)
            .await?;

        self.outbox.broadcast(
            self.room_peers(room_id, connection_id),
            ServerEvent::RoomMessage {
                from: envelope.sender,
                room_id: room_id.to_string(),
                content: envelope.content,
                content_type,
            },
        );
        Ok(())
    }

    async fn persist_room_message(
        &self,
        sender: &Session,
        room_id: &str,
        content: String,
        content_type: ContentType,
    ) -> Result<Envelope, ChatError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))?;
        if !room.is_open {
            return Err(ChatError::RoomClosed(room_id.to_string()));
        }

        let content = self.prepare_content(content, content_type).await?;
        let envelope = Envelope::new(
            sender,
            Recipient::Room(room_id.to_string()),
            content,
            content_type,
        );
        self.bounded(self.storage.persist_message(&envelope)).await?;
        Ok(envelope)
    }

    fn room_peers(&self, room_id: &str, connection_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .members_of(room_id)
            .into_iter()
            .map(|s| s.connection_id)
            .filter(|id| id != connection_id)
            .collect()
    }

    // ---- rooms ----

    fn broadcast_rooms_updated(&self) {
        self.outbox.broadcast(
            self.sessions.connection_ids(),
            ServerEvent::RoomsUpdated {
                rooms: self.rooms.open_views(),
            },
        );
    }

    /// Recompute a room's member count and persist it.
    ///
    /// If membership moved while the write was in flight, the count is
    /// recomputed again so the persisted value does not stay stale.
    async fn sync_user_count(&self, room_id: &str) {
        for _ in 0..COUNT_SYNC_ATTEMPTS {
            let count = self.sessions.count_in(room_id);
            if !self.rooms.set_user_count(room_id, count) {
                return;
            }

            if let Err(err) = self
                .bounded(
                    self.storage
                        .update_room_state(room_id, RoomStatePatch::user_count(count)),
                )
                .await
            {
                warn!(room = %room_id, error = %err, "Failed to persist member count");
                return;
            }

            if self.sessions.count_in(room_id) == count {
                return;
            }
        }
        warn!(room = %room_id, "Member count still moving, giving up");
    }

    /// Announce that `session` left `room_id` and resync the room.
    ///
    /// The room listing is left to the caller, so a room switch sends one.
    async fn depart(&self, session: &Session, room_id: &str) {
        let remaining = self.room_peers(room_id, &session.connection_id);
        self.outbox.broadcast(
            remaining,
            ServerEvent::UserLeftRoom {
                user: session.to_view(),
                room_id: room_id.to_string(),
            },
        );
        self.sync_user_count(room_id).await;
    }

    /// Create a room owned by the caller. The caller is not moved into it.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is invalid, the id is taken, or
    /// persistence fails.
    pub async fn create_room(&self, connection_id: &str, request: NewRoom) -> Result<Room, ChatError> {
        let owner = self.active_session(connection_id)?;

        let max_users = request
            .max_users
            .unwrap_or_else(|| i64::from(self.config.default_max_users));
        let max_users = u32::try_from(max_users).map_err(|_| ChatError::InvalidCapacity)?;

        let id = request
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| generate_id("room"));

        let room = Room::new(
            id,
            request.name.trim(),
            request.description.unwrap_or_default(),
            owner.user_id.clone(),
            owner.name.clone(),
            max_users,
        );
        self.rooms.check_new(&room)?;

        self.bounded(self.storage.persist_room(&room)).await?;
        let room = self.rooms.create(room)?;

        info!(room = %room.id, owner = %owner.user_id, "Room created");
        self.outbox.send_to(
            connection_id,
            ServerEvent::RoomCreated {
                room: room.to_view(),
            },
        );
        self.broadcast_rooms_updated();
        Ok(room)
    }

    /// Move the caller into a room, leaving any other room first.
    ///
    /// # Errors
    ///
    /// Returns `RoomNotFound`, `RoomClosed`, `RoomFull`, or a storage failure.
    pub async fn join_room(&self, connection_id: &str, room_id: &str) -> Result<(), ChatError> {
        let session = self.active_session(connection_id)?;

        // Cheap rejection before any storage call; rechecked under the guard
        match self.rooms.get(room_id) {
            None => return Err(ChatError::RoomNotFound(room_id.to_string())),
            Some(room) if !room.is_open => {
                return Err(ChatError::RoomClosed(room_id.to_string()))
            }
            Some(_) => {}
        }

        // Load history first so a storage failure leaves membership untouched
        let messages = self.history(&Scope::Room(room_id.to_string())).await?;

        if session.is_in(room_id) {
            self.outbox.send_to(
                connection_id,
                ServerEvent::RoomHistory {
                    room_id: room_id.to_string(),
                    messages,
                },
            );
            return Ok(());
        }

        let previous = self
            .rooms
            .with_room_mut(room_id, |room| {
                if !room.is_open {
                    return Err(ChatError::RoomClosed(room_id.to_string()));
                }
                let occupants = self.sessions.count_in(room_id);
                if occupants >= room.max_users as usize {
                    return Err(ChatError::RoomFull(room_id.to_string()));
                }
                let previous = self.sessions.update_room(connection_id, Some(room_id))?;
                room.current_users = occupants + 1;
                Ok(previous)
            })
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))??;

        if let Some(previous) = previous.as_deref() {
            let mut left = session.clone();
            left.current_room = Some(previous.to_string());
            self.depart(&left, previous).await;
        }

        self.sync_user_count(room_id).await;

        self.outbox.send_to(
            connection_id,
            ServerEvent::RoomHistory {
                room_id: room_id.to_string(),
                messages,
            },
        );

        let mut joined = session;
        joined.current_room = Some(room_id.to_string());
        self.outbox.broadcast(
            self.room_peers(room_id, connection_id),
            ServerEvent::UserJoinedRoom {
                user: joined.to_view(),
                room_id: room_id.to_string(),
            },
        );
        self.broadcast_rooms_updated();

        debug!(connection = %connection_id, room = %room_id, "Joined room");
        Ok(())
    }

    /// Move the caller back to the global group. Ignored unless the caller
    /// is in `room_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not logged in.
    pub async fn leave_room(&self, connection_id: &str, room_id: &str) -> Result<(), ChatError> {
        let session = self.active_session(connection_id)?;
        if !session.is_in(room_id) {
            trace!(connection = %connection_id, room = %room_id, "Leave ignored, not in room");
            return Ok(());
        }

        self.sessions.update_room(connection_id, None)?;
        self.depart(&session, room_id).await;
        self.broadcast_rooms_updated();

        debug!(connection = %connection_id, room = %room_id, "Left room");
        Ok(())
    }

    fn evict(&self, room_id: &str) -> usize {
        let evicted = self.sessions.evict_room(room_id);
        for session in &evicted {
            self.outbox.send_to(
                &session.connection_id,
                ServerEvent::RoomClosed {
                    room_id: room_id.to_string(),
                },
            );
        }
        evicted.len()
    }

    /// Close a room and evict everyone in it.
    ///
    /// # Errors
    ///
    /// Returns `RoomNotFound`, `NotOwner`, or a storage failure.
    pub async fn close_room(&self, connection_id: &str, room_id: &str) -> Result<(), ChatError> {
        let session = self.active_session(connection_id)?;
        self.rooms.check_owner(room_id, &session.user_id)?;

        self.bounded(self.storage.update_room_state(
            room_id,
            RoomStatePatch {
                is_open: Some(false),
                user_count: Some(0),
            },
        ))
        .await?;

        // Once closed no join can pass, so eviction after the guard is final
        self.rooms.close(room_id, &session.user_id)?;
        let evicted = self.evict(room_id);

        self.sync_user_count(room_id).await;
        self.broadcast_rooms_updated();

        info!(room = %room_id, evicted, "Room closed");
        Ok(())
    }

    /// Delete a room permanently, evicting everyone in it.
    ///
    /// # Errors
    ///
    /// Returns `RoomNotFound`, `NotOwner`, or a storage failure.
    pub async fn delete_room(&self, connection_id: &str, room_id: &str) -> Result<(), ChatError> {
        let session = self.active_session(connection_id)?;
        self.rooms.check_owner(room_id, &session.user_id)?;

        self.bounded(self.storage.delete_room(room_id)).await?;

        self.rooms.remove(room_id);
        let evicted = self.evict(room_id);
        self.broadcast_rooms_updated();

        info!(room = %room_id, evicted, "Room deleted");
        Ok(())
    }

    /// Reply with the open room listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not logged in.
    pub fn list_rooms(&self, connection_id: &str) -> Result<(), ChatError> {
        self.active_session(connection_id)?;
        self.outbox.send_to(
            connection_id,
            ServerEvent::RoomsList {
                rooms: self.rooms.open_views(),
            },
        );
        Ok(())
    }

    /// Reply with the users currently in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not logged in or the room is unknown.
    pub fn list_room_users(&self, connection_id: &str, room_id: &str) -> Result<(), ChatError> {
        self.active_session(connection_id)?;
        if !self.rooms.contains(room_id) {
            return Err(ChatError::RoomNotFound(room_id.to_string()));
        }

        let users = self
            .sessions
            .members_of(room_id)
            .iter()
            .map(Session::to_view)
            .collect();
        self.outbox.send_to(
            connection_id,
            ServerEvent::RoomUsersList {
                room_id: room_id.to_string(),
                users,
            },
        );
        Ok(())
    }

    // ---- dispatch ----

    /// Handle one inbound event.
    ///
    /// Failures are reported to the connection on the event's own failure
    /// event (or `error`) before being returned, so the caller only needs to
    /// log or count them.
    ///
    /// # Errors
    ///
    /// Returns the error that was reported to the connection.
    pub async fn handle(&self, connection_id: &str, event: ClientEvent) -> Result<Flow, ChatError> {
        let name = event.name();
        let report = failure_event(&event);
        trace!(connection = %connection_id, event = name, "Handling event");

        let result = match event {
            ClientEvent::Login { email, password } => {
                self.login(connection_id, &email, &password).await.map(drop)
            }
            ClientEvent::Register {
                name,
                email,
                password,
                avatar_url,
            } => {
                let account = NewAccount {
                    name,
                    email,
                    password,
                    avatar_url,
                };
                self.register(connection_id, account).await.map(drop)
            }
            ClientEvent::Message {
                to,
                content,
                content_type,
                ..
            } => {
                self.send_message(connection_id, to, content, content_type)
                    .await
            }
            ClientEvent::RoomMessage {
                room_id,
                content,
                content_type,
                ..
            } => {
                self.send_room_message(connection_id, &room_id, content, content_type)
                    .await
            }
            ClientEvent::CreateRoom {
                id,
                name,
                description,
                max_users,
            } => {
                let request = NewRoom {
                    id,
                    name,
                    description,
                    max_users,
                };
                self.create_room(connection_id, request).await.map(drop)
            }
            ClientEvent::JoinRoom { room_id } => self.join_room(connection_id, &room_id).await,
            ClientEvent::LeaveRoom { room_id } => self.leave_room(connection_id, &room_id).await,
            ClientEvent::CloseRoom { room_id } => self.close_room(connection_id, &room_id).await,
            ClientEvent::DeleteRoom { room_id } => self.delete_room(connection_id, &room_id).await,
            ClientEvent::GetRooms {} => self.list_rooms(connection_id),
            ClientEvent::GetRoomUsers { room_id } => self.list_room_users(connection_id, &room_id),
            ClientEvent::Disconnect { reason } => {
                debug!(connection = %connection_id, ?reason, "Client requested disconnect");
                return Ok(Flow::Disconnect);
            }
        };

        match result {
            Ok(()) => Ok(Flow::Continue),
            Err(err) => {
                debug!(connection = %connection_id, event = name, error = %err, "Event rejected");
                if let Some(report) = report {
                    self.outbox.send_to(connection_id, report(err.to_string()));
                }
                Err(err)
            }
        }
    }
}

/// The failure event an inbound event reports on. `leave-room` has none.
fn failure_event(event: &ClientEvent) -> Option<fn(String) -> ServerEvent> {
    let report: fn(String) -> ServerEvent = match event {
        ClientEvent::Login { .. } => |reason| ServerEvent::LoginFail { reason },
        ClientEvent::Register { .. } => |reason| ServerEvent::RegisterFail { reason },
        ClientEvent::CreateRoom { .. } => |reason| ServerEvent::RoomCreateFailed { reason },
        ClientEvent::JoinRoom { .. } => |reason| ServerEvent::JoinRoomFailed { reason },
        ClientEvent::CloseRoom { .. } | ClientEvent::DeleteRoom { .. } => {
            |reason| ServerEvent::CloseRoomFailed { reason }
        }
        ClientEvent::LeaveRoom { .. } | ClientEvent::Disconnect { .. } => return None,
        ClientEvent::Message { .. }
        | ClientEvent::RoomMessage { .. }
        | ClientEvent::GetRooms {}
        | ClientEvent::GetRoomUsers { .. } => |reason| ServerEvent::Error { reason },
    };
    Some(report)
}
