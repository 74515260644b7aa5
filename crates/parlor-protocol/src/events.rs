//! Event types for the Parlor protocol.
//!
//! Events are the fundamental unit of communication. Each one is an
//! adjacently tagged envelope: `{"event": "join-room", "data": {"roomId": "tech"}}`.

use crate::model::{ContentType, MessageView, RoomView, SenderView, Target, UserView};
use serde::{Deserialize, Serialize};

/// Presence action carried by a `system` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemAction {
    /// A user came online.
    Join,
    /// A user went offline.
    Logout,
}

/// An event sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Authenticate with email and password.
    #[serde(rename = "login")]
    Login { email: String, password: String },

    /// Create an account and log in.
    #[serde(rename = "register")]
    Register {
        name: String,
        email: String,
        password: String,
        #[serde(rename = "avatarUrl", default)]
        avatar_url: Option<String>,
    },

    /// Direct or global-group message.
    #[serde(rename = "message")]
    Message {
        /// Client-claimed sender. The server always uses the session instead.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<serde_json::Value>,
        to: Target,
        content: String,
        #[serde(rename = "type", default)]
        content_type: ContentType,
    },

    /// Message broadcast to a room.
    #[serde(rename = "room-message")]
    RoomMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<serde_json::Value>,
        #[serde(rename = "roomId")]
        room_id: String,
        content: String,
        #[serde(rename = "type", default)]
        content_type: ContentType,
    },

    /// Create a room owned by the caller.
    #[serde(rename = "create-room")]
    CreateRoom {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        max_users: Option<i64>,
    },

    /// Move into a room.
    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Move back to the global group.
    #[serde(rename = "leave-room")]
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Close a room (owner only).
    #[serde(rename = "close-room")]
    CloseRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Delete a room permanently (owner only).
    #[serde(rename = "delete-room")]
    DeleteRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Request the open room listing.
    #[serde(rename = "get-rooms")]
    GetRooms {},

    /// Request the users currently in a room.
    #[serde(rename = "get-room-users")]
    GetRoomUsers {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Client-initiated disconnect.
    #[serde(rename = "disconnect")]
    Disconnect {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Login { .. } => "login",
            ClientEvent::Register { .. } => "register",
            ClientEvent::Message { .. } => "message",
            ClientEvent::RoomMessage { .. } => "room-message",
            ClientEvent::CreateRoom { .. } => "create-room",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::CloseRoom { .. } => "close-room",
            ClientEvent::DeleteRoom { .. } => "delete-room",
            ClientEvent::GetRooms {} => "get-rooms",
            ClientEvent::GetRoomUsers { .. } => "get-room-users",
            ClientEvent::Disconnect { .. } => "disconnect",
        }
    }

    /// Create a login event.
    #[must_use]
    pub fn login(email: impl Into<String>, password: impl Into<String>) -> Self {
        ClientEvent::Login {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Create a text message event.
    #[must_use]
    pub fn text(to: Target, content: impl Into<String>) -> Self {
        ClientEvent::Message {
            from: None,
            to,
            content: content.into(),
            content_type: ContentType::Text,
        }
    }
}

/// An event sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "loginSuccess")]
    LoginSuccess {
        user: UserView,
        token: String,
        #[serde(rename = "onlineUsers")]
        online_users: Vec<UserView>,
    },

    #[serde(rename = "loginFail")]
    LoginFail { reason: String },

    #[serde(rename = "registerFail")]
    RegisterFail { reason: String },

    /// Presence change of another user.
    #[serde(rename = "system")]
    System { user: UserView, action: SystemAction },

    /// Recent messages of a scope, oldest first.
    #[serde(rename = "history-message")]
    HistoryMessage {
        #[serde(rename = "scopeId")]
        scope_id: String,
        messages: Vec<MessageView>,
    },

    #[serde(rename = "message")]
    Message {
        from: SenderView,
        to: Target,
        content: String,
        #[serde(rename = "type")]
        content_type: ContentType,
    },

    #[serde(rename = "room-message")]
    RoomMessage {
        from: SenderView,
        #[serde(rename = "roomId")]
        room_id: String,
        content: String,
        #[serde(rename = "type")]
        content_type: ContentType,
    },

    #[serde(rename = "room-created")]
    RoomCreated { room: RoomView },

    #[serde(rename = "room-create-failed")]
    RoomCreateFailed { reason: String },

    #[serde(rename = "room-history")]
    RoomHistory {
        #[serde(rename = "roomId")]
        room_id: String,
        messages: Vec<MessageView>,
    },

    #[serde(rename = "user-joined-room")]
    UserJoinedRoom {
        user: UserView,
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "user-left-room")]
    UserLeftRoom {
        user: UserView,
        #[serde(rename = "roomId")]
        room_id: String,
    },

    /// Pushed to every active connection after a room change.
    #[serde(rename = "rooms-updated")]
    RoomsUpdated { rooms: Vec<RoomView> },

    /// Reply to `get-rooms`.
    #[serde(rename = "rooms-list")]
    RoomsList { rooms: Vec<RoomView> },

    #[serde(rename = "room-users-list")]
    RoomUsersList {
        #[serde(rename = "roomId")]
        room_id: String,
        users: Vec<UserView>,
    },

    /// Server-initiated eviction from a room.
    #[serde(rename = "room-closed")]
    RoomClosed {
        #[serde(rename = "roomId")]
        room_id: String,
    },

    #[serde(rename = "join-room-failed")]
    JoinRoomFailed { reason: String },

    #[serde(rename = "close-room-failed")]
    CloseRoomFailed { reason: String },

    /// Failure of an event that has no dedicated failure event.
    #[serde(rename = "error")]
    Error { reason: String },
}

impl ServerEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::LoginSuccess { .. } => "loginSuccess",
            ServerEvent::LoginFail { .. } => "loginFail",
            ServerEvent::RegisterFail { .. } => "registerFail",
            ServerEvent::System { .. } => "system",
            ServerEvent::HistoryMessage { .. } => "history-message",
            ServerEvent::Message { .. } => "message",
            ServerEvent::RoomMessage { .. } => "room-message",
            ServerEvent::RoomCreated { .. } => "room-created",
            ServerEvent::RoomCreateFailed { .. } => "room-create-failed",
            ServerEvent::RoomHistory { .. } => "room-history",
            ServerEvent::UserJoinedRoom { .. } => "user-joined-room",
            ServerEvent::UserLeftRoom { .. } => "user-left-room",
            ServerEvent::RoomsUpdated { .. } => "rooms-updated",
            ServerEvent::RoomsList { .. } => "rooms-list",
            ServerEvent::RoomUsersList { .. } => "room-users-list",
            ServerEvent::RoomClosed { .. } => "room-closed",
            ServerEvent::JoinRoomFailed { .. } => "join-room-failed",
            ServerEvent::CloseRoomFailed { .. } => "close-room-failed",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Create an error event.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        ServerEvent::Error {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TargetKind;
    use serde_json::json;

    #[test]
    fn test_client_event_names_match_wire_tag() {
        let events = vec![
            ClientEvent::login("a@example.com", "pw"),
            ClientEvent::JoinRoom {
                room_id: "tech".to_string(),
            },
            ClientEvent::GetRooms {},
            ClientEvent::Disconnect { reason: None },
        ];

        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["event"], event.name());
        }
    }

    #[test]
    fn test_decode_create_room_optional_fields() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "create-room",
            "data": {"name": "Tech", "max_users": 5}
        }))
        .unwrap();

        assert_eq!(
            event,
            ClientEvent::CreateRoom {
                id: None,
                name: "Tech".to_string(),
                description: None,
                max_users: Some(5),
            }
        );
    }

    #[test]
    fn test_decode_message_ignores_claimed_sender() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "message",
            "data": {
                "from": {"id": "spoofed"},
                "to": {"type": "group", "id": "group_001", "name": "group"},
                "content": "hi",
                "type": "text"
            }
        }))
        .unwrap();

        match event {
            ClientEvent::Message { to, content, .. } => {
                assert_eq!(to.kind, TargetKind::Group);
                assert_eq!(content, "hi");
            }
            other => panic!("Expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::RoomClosed {
            room_id: "tech".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"event": "room-closed", "data": {"roomId": "tech"}}));
        assert_eq!(event.name(), "room-closed");
    }

    #[test]
    fn test_system_action_wire_names() {
        assert_eq!(
            serde_json::to_value(SystemAction::Logout).unwrap(),
            json!("logout")
        );
    }
}
