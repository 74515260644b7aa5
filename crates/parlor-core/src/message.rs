//! Message envelopes and identifiers.
//!
//! An [`Envelope`] is built once per send, handed to storage, and dropped
//! after routing. The sender is a snapshot, not a live session reference.

use crate::identity::UserId;
use crate::session::Session;
use parlor_protocol::{ContentType, MessageView, SenderView, Target, GLOBAL_GROUP_ID};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a unique prefixed identifier such as `conn_18c2f0a91b3e`.
#[must_use]
pub fn generate_id(prefix: &str) -> String {
    // Combine timestamp with atomic counter for guaranteed uniqueness
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{:x}{:04x}", prefix, timestamp, counter & 0xffff)
}

/// A history scope: the global group or one room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Group,
    Room(String),
}

impl Scope {
    /// Scope identifier used on the wire and as the storage key.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Scope::Group => GLOBAL_GROUP_ID,
            Scope::Room(room_id) => room_id,
        }
    }
}

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// One user, reached through their current connection.
    Direct {
        user_id: UserId,
        name: String,
        connection_id: String,
    },
    /// Every active connection.
    Group,
    /// Every connection in a room.
    Room(String),
}

impl Recipient {
    /// The history scope this message belongs to, if any.
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        match self {
            Recipient::Direct { .. } => None,
            Recipient::Group => Some(Scope::Group),
            Recipient::Room(room_id) => Some(Scope::Room(room_id.clone())),
        }
    }

    /// Wire form of this recipient.
    #[must_use]
    pub fn to_target(&self) -> Target {
        match self {
            Recipient::Direct {
                user_id,
                name,
                connection_id,
            } => Target {
                room_id: Some(connection_id.clone()),
                ..Target::user(user_id.clone(), name.clone())
            },
            Recipient::Group => Target::group(),
            Recipient::Room(room_id) => Target::room(room_id.clone()),
        }
    }
}

/// A message plus its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Sender captured at send time.
    pub sender: SenderView,
    pub recipient: Recipient,
    /// Text, or a media reference for images. Never raw image bytes.
    pub content: String,
    pub content_type: ContentType,
    pub sent_at: u64,
}

impl Envelope {
    /// Create a new envelope stamped with the current time.
    #[must_use]
    pub fn new(
        sender: &Session,
        recipient: Recipient,
        content: impl Into<String>,
        content_type: ContentType,
    ) -> Self {
        Self {
            sender: sender.sender_view(),
            recipient,
            content: content.into(),
            content_type,
            sent_at: now_millis(),
        }
    }

    /// History form of this envelope.
    #[must_use]
    pub fn to_view(&self) -> MessageView {
        MessageView {
            from: self.sender.clone(),
            to: self.recipient.to_target(),
            content: self.content.clone(),
            content_type: self.content_type,
            time: self.sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parlor_protocol::TargetKind;

    #[test]
    fn test_unique_ids() {
        let id1 = generate_id("room");
        let id2 = generate_id("room");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("room_"));
    }

    #[test]
    fn test_scope_ids() {
        assert_eq!(Scope::Group.id(), GLOBAL_GROUP_ID);
        assert_eq!(Scope::Room("tech".to_string()).id(), "tech");
    }

    #[test]
    fn test_recipient_targets() {
        assert_eq!(Recipient::Group.to_target().kind, TargetKind::Group);
        assert_eq!(
            Recipient::Room("tech".to_string()).scope(),
            Some(Scope::Room("tech".to_string()))
        );

        let direct = Recipient::Direct {
            user_id: "u-2".to_string(),
            name: "bob".to_string(),
            connection_id: "conn_2".to_string(),
        };
        assert!(direct.scope().is_none());
        let target = direct.to_target();
        assert_eq!(target.kind, TargetKind::User);
        assert_eq!(target.name, "bob");
        assert_eq!(target.room_id.as_deref(), Some("conn_2"));
    }
}
