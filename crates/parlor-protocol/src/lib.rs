//! # parlor-protocol
//!
//! Wire protocol definitions for the Parlor chat server.
//!
//! Every frame exchanged over a connection is an event envelope of the form
//! `{"event": "<name>", "data": {...}}`. Event names are part of the public
//! contract and are kept stable.
//!
//! ## Event Families
//!
//! - `login` / `register` - Authentication
//! - `message` / `room-message` - Chat traffic
//! - `create-room` / `join-room` / `leave-room` / `close-room` - Room lifecycle
//! - `system` / `rooms-updated` - Server pushed presence and listings
//!
//! ## Example
//!
//! ```rust
//! use parlor_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::JoinRoom { room_id: "tech".to_string() };
//!
//! // Text frames carry JSON
//! let text = codec::encode_text(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_text(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod model;

pub use codec::{decode, decode_text, encode, encode_text, ProtocolError};
pub use events::{ClientEvent, ServerEvent, SystemAction};
pub use model::{
    ContentType, DeviceClass, MessageView, RoomView, SenderView, Target, TargetKind, UserView,
    GLOBAL_GROUP_ID,
};
