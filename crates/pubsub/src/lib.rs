//! Socket-based publish/subscribe bridge.
//!
//! A [`Manager`] hands out integer [`Handle`]s for publisher and subscriber
//! sockets. Publishers broadcast every message to whichever subscribers are
//! connected at send time; subscribers receive with a bounded wait. Delivery
//! is best-effort TCP: nothing is buffered, retried or acknowledged.

pub mod manager;
pub mod publisher;
pub mod subscriber;
pub mod table;

pub use manager::{version, Manager};
pub use publisher::PublisherSocket;
pub use subscriber::SubscriberSocket;
pub use table::{HandleTable, SocketEntry};

pub use mtbridge_core::{
    Address, BridgeConfig, BridgeError, Closeable, Framing, Handle, Message, SendReport,
    SocketKind,
};
