//! Shared wire types carried inside events.
//!
//! Field names follow the JSON shapes browser clients already consume, so
//! users and messages use camelCase while rooms keep their snake_case columns.

use serde::{Deserialize, Serialize};

/// Scope identifier of the global group every authenticated user belongs to.
pub const GLOBAL_GROUP_ID: &str = "group_001";

/// Coarse device classification derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    #[default]
    Pc,
}

impl DeviceClass {
    /// Lowercase name as it appears on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Pc => "pc",
        }
    }
}

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
}

/// Recipient kind of a `message` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// A single user (direct message).
    User,
    /// The global group.
    Group,
    /// A room broadcast.
    Room,
}

/// Recipient of a `message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Recipient kind.
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// User id, room id, or [`GLOBAL_GROUP_ID`].
    pub id: String,
    /// Display name of the recipient.
    #[serde(default)]
    pub name: String,
    /// Connection-scoped channel of a direct partner.
    #[serde(rename = "roomId", default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

impl Target {
    /// Target the global group.
    #[must_use]
    pub fn group() -> Self {
        Self {
            kind: TargetKind::Group,
            id: GLOBAL_GROUP_ID.to_string(),
            name: "group".to_string(),
            room_id: None,
        }
    }

    /// Target a single user.
    #[must_use]
    pub fn user(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::User,
            id: user_id.into(),
            name: name.into(),
            room_id: None,
        }
    }

    /// Target a room.
    #[must_use]
    pub fn room(room_id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Room,
            id: room_id.into(),
            name: "room".to_string(),
            room_id: None,
        }
    }
}

/// An online user as seen by other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub ip: String,
    pub device_type: DeviceClass,
    /// Current room, `None` while in the global group.
    #[serde(default)]
    pub room_id: Option<String>,
    /// Login time in epoch milliseconds.
    pub time: u64,
}

/// Sender snapshot attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderView {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub ip: String,
    pub device_type: DeviceClass,
}

/// A stored message as replayed in history events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageView {
    pub from: SenderView,
    pub to: Target,
    pub content: String,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub time: u64,
}

/// Public room listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub owner_id: String,
    pub owner_name: String,
    pub is_open: bool,
    pub max_users: u32,
    pub current_users: usize,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_view_field_names() {
        let user = UserView {
            id: "u-1".to_string(),
            name: "Alice".to_string(),
            avatar_url: None,
            ip: "10.0.0.1".to_string(),
            device_type: DeviceClass::Phone,
            room_id: Some("tech".to_string()),
            time: 42,
        };

        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["deviceType"], "phone");
        assert_eq!(value["roomId"], "tech");
        assert!(value.get("avatarUrl").is_some());
    }

    #[test]
    fn test_target_defaults() {
        let target: Target = serde_json::from_str(r#"{"type":"group","id":"group_001"}"#).unwrap();
        assert_eq!(target.kind, TargetKind::Group);
        assert!(target.name.is_empty());
        assert!(target.room_id.is_none());
    }

    #[test]
    fn test_content_type_wire_names() {
        assert_eq!(serde_json::to_string(&ContentType::Image).unwrap(), "\"image\"");
        assert_eq!(ContentType::default(), ContentType::Text);
    }
}
