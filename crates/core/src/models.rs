use std::borrow::Cow;
use std::fmt;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Opaque identifier for one live socket.
///
/// Always in `1..=i32::MAX` so it round-trips through the C ABI's `int`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Largest handle value that still fits a positive C `int`.
    pub const MAX: u32 = i32::MAX as u32;

    /// Wrap a raw value, rejecting zero and anything above [`Handle::MAX`].
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 || raw > Self::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Convert a raw C `int`; negative and zero values are never handles.
    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().and_then(Self::new)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn as_raw(self) -> i32 {
        // Constructors guarantee the value fits.
        self.0 as i32
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role a socket plays on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Publisher,
    Subscriber,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketKind::Publisher => f.write_str("PUB"),
            SocketKind::Subscriber => f.write_str("SUB"),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A topic-tagged payload. Both parts are opaque bytes and may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Topic as text, replacing invalid UTF-8.
    pub fn topic_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.topic)
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Whether the topic starts with `prefix`. The empty prefix matches everything.
    pub fn matches_prefix(&self, prefix: &[u8]) -> bool {
        self.topic.starts_with(prefix)
    }

    /// Size of the message once encoded with the delimited wire format.
    pub fn encoded_len(&self) -> usize {
        self.topic.len() + 1 + self.payload.len()
    }
}

/// Outcome of one broadcast from a publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Peers connected when the write pass started (after the accept drain).
    pub peers: usize,
    /// Peers that took the whole encoded message.
    pub delivered: usize,
    /// Peers whose socket buffer was full; the message is lost for them.
    pub skipped: usize,
    /// Peers dropped because the write failed.
    pub evicted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_bounds() {
        assert!(Handle::new(0).is_none());
        assert_eq!(Handle::new(1).map(Handle::get), Some(1));
        assert!(Handle::new(Handle::MAX).is_some());
        assert!(Handle::new(Handle::MAX + 1).is_none());
        assert!(Handle::from_raw(-1).is_none());
        assert_eq!(Handle::from_raw(7).map(Handle::as_raw), Some(7));
    }

    #[test]
    fn test_message_prefix_match() {
        let msg = Message::new("tick.EURUSD", "{}");
        assert!(msg.matches_prefix(b""));
        assert!(msg.matches_prefix(b"tick."));
        assert!(!msg.matches_prefix(b"bar."));
        assert_eq!(msg.topic_str(), "tick.EURUSD");
        assert_eq!(msg.encoded_len(), 14);
    }

    #[test]
    fn test_socket_kind_display() {
        assert_eq!(SocketKind::Publisher.to_string(), "PUB");
        assert_eq!(SocketKind::Subscriber.to_string(), "SUB");
    }
}
