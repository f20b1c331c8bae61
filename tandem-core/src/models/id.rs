use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for peer identifiers
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Room ID type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Peer ID type
///
/// Identifies one signaling connection (the socket id the server relays under).
/// Ordering is plain lexicographic byte order of the underlying string; the
/// negotiation role of a pair is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// User ID type (application-level identity, distinct from the connection id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Addressing for a remote party in call-lifecycle commands
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerDescriptor {
    pub socket_id: PeerId,
    pub user_id: UserId,
}

impl PeerDescriptor {
    pub fn new(socket_id: impl Into<PeerId>, user_id: impl Into<UserId>) -> Self {
        Self {
            socket_id: socket_id.into(),
            user_id: user_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_peer_ids_are_unique() {
        let a = PeerId::new();
        let b = PeerId::new();

        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_peer_id_ordering_is_lexicographic() {
        assert!(PeerId::from("bob") > PeerId::from("alice"));
        assert!(PeerId::from("Zed") < PeerId::from("alice"));
        assert!(PeerId::from("u10") < PeerId::from("u9"));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&RoomId::from("lobby")).unwrap();
        assert_eq!(json, "\"lobby\"");

        let peer = PeerDescriptor::new("sock-1", "carol");
        let json = serde_json::to_value(&peer).unwrap();
        assert_eq!(json["socketId"], "sock-1");
        assert_eq!(json["userId"], "carol");
    }
}
