//! Authenticated identities and connection peer metadata.

use parlor_protocol::DeviceClass;
use serde::{Deserialize, Serialize};

/// A stable user identifier (distinct from any connection id).
pub type UserId = String;

/// User-agent fragments that mark a phone-class device.
const PHONE_MARKERS: &[&str] = &[
    "ipad",
    "iphone os",
    "midp",
    "rv:1.2.3.4",
    "ucweb",
    "android",
    "windows ce",
    "windows mobile",
];

/// An authenticated account as returned by storage or decoded from a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub name: String,
    pub email: String,
    pub avatar_url: Option<String>,
}

/// Transport-level facts about a connection, captured once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub ip: String,
    pub device: DeviceClass,
}

impl PeerInfo {
    /// Create peer info from already-resolved values.
    #[must_use]
    pub fn new(ip: impl Into<String>, device: DeviceClass) -> Self {
        Self {
            ip: ip.into(),
            device,
        }
    }

    /// Resolve peer info from handshake metadata.
    ///
    /// `forwarded_for` wins over the socket address when a proxy set it.
    #[must_use]
    pub fn from_handshake(
        socket_ip: &str,
        forwarded_for: Option<&str>,
        user_agent: Option<&str>,
    ) -> Self {
        Self {
            ip: client_ip(socket_ip, forwarded_for),
            device: user_agent.map(classify_device).unwrap_or_default(),
        }
    }
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self::new("127.0.0.1", DeviceClass::Pc)
    }
}

/// Classify a user agent as phone or pc.
#[must_use]
pub fn classify_device(user_agent: &str) -> DeviceClass {
    let agent = user_agent.to_ascii_lowercase();
    if PHONE_MARKERS.iter().any(|marker| agent.contains(marker)) {
        DeviceClass::Phone
    } else {
        DeviceClass::Pc
    }
}

/// Pick the client address, preferring a proxy-supplied one.
#[must_use]
pub fn client_ip(socket_ip: &str, forwarded_for: Option<&str>) -> String {
    match forwarded_for.map(str::trim).filter(|v| !v.is_empty()) {
        Some(forwarded) => forwarded.to_string(),
        None => socket_ip.trim_start_matches("::ffff:").to_string(),
    }
}
