use std::collections::HashMap;
use std::sync::Arc;

use mtbridge_core::*;

use crate::publisher::PublisherSocket;
use crate::subscriber::SubscriberSocket;

/// A live socket in the table.
#[derive(Debug, Clone)]
pub enum SocketEntry {
    Publisher(Arc<PublisherSocket>),
    Subscriber(Arc<SubscriberSocket>),
}

impl SocketEntry {
    pub fn as_closeable(&self) -> &dyn Closeable {
        match self {
            SocketEntry::Publisher(p) => p.as_ref(),
            SocketEntry::Subscriber(s) => s.as_ref(),
        }
    }

    pub fn kind(&self) -> SocketKind {
        self.as_closeable().kind()
    }

    pub fn close(&self) {
        self.as_closeable().close()
    }
}

/// Maps handles to sockets and issues new handles.
///
/// Handles only ever increase, so a closed handle can never resolve to a
/// newer socket. Entries are `Arc`s so callers can clone one out and do I/O
/// without holding whatever lock guards the table.
#[derive(Debug)]
pub struct HandleTable {
    next: u32,
    entries: HashMap<Handle, SocketEntry>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: 1,
            entries: HashMap::new(),
        }
    }

    /// Register `entry` under a fresh handle.
    pub fn insert(&mut self, entry: SocketEntry) -> Result<Handle, BridgeError> {
        let handle = Handle::new(self.next).ok_or(BridgeError::HandlesExhausted)?;
        self.next += 1;
        self.entries.insert(handle, entry);
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<SocketEntry> {
        self.entries.get(&handle).cloned()
    }

    /// Look up a live publisher.
    pub fn publisher(&self, handle: Handle) -> Result<Arc<PublisherSocket>, BridgeError> {
        match self.entries.get(&handle) {
            Some(SocketEntry::Publisher(p)) => Ok(Arc::clone(p)),
            Some(SocketEntry::Subscriber(_)) => {
                Err(BridgeError::invalid_handle(handle.get(), "not a publisher socket"))
            }
            None => Err(unknown(handle)),
        }
    }

    /// Look up a live subscriber.
    pub fn subscriber(&self, handle: Handle) -> Result<Arc<SubscriberSocket>, BridgeError> {
        match self.entries.get(&handle) {
            Some(SocketEntry::Subscriber(s)) => Ok(Arc::clone(s)),
            Some(SocketEntry::Publisher(_)) => {
                Err(BridgeError::invalid_handle(handle.get(), "not a subscriber socket"))
            }
            None => Err(unknown(handle)),
        }
    }

    pub fn remove(&mut self, handle: Handle) -> Result<SocketEntry, BridgeError> {
        self.entries.remove(&handle).ok_or_else(|| unknown(handle))
    }

    /// Empty the table, returning every entry in handle order.
    pub fn drain(&mut self) -> Vec<(Handle, SocketEntry)> {
        let mut drained: Vec<_> = self.entries.drain().collect();
        drained.sort_by_key(|(handle, _)| *handle);
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unknown(handle: Handle) -> BridgeError {
    BridgeError::invalid_handle(handle.get(), "unknown or closed")
}
