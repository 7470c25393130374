use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mtbridge_core::*;
use tracing::{debug, info, trace};

use crate::publisher::PublisherSocket;
use crate::subscriber::SubscriberSocket;
use crate::table::{HandleTable, SocketEntry};

/// Version string reported to callers.
pub fn version() -> &'static str {
    VERSION
}

#[derive(Debug, Default)]
struct ManagerState {
    initialized: bool,
    table: HandleTable,
}

/// Entry point for every bridge operation.
///
/// All methods take `&self` and are safe to call from several threads. The
/// handle table lock is only held to look sockets up or register them; socket
/// I/O happens outside it, so independent handles never wait on each other.
///
/// `last_error` is a single best-effort slot: concurrent callers may
/// overwrite each other's detail.
#[derive(Debug)]
pub struct Manager {
    config: BridgeConfig,
    state: Mutex<ManagerState>,
    last_error: Mutex<String>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Manager {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ManagerState::default()),
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Make the manager ready for socket creation. Calling it again while
    /// initialized is a no-op.
    pub fn init(&self) -> Result<(), BridgeError> {
        let result = self.config.validate().map(|()| {
            let mut state = self.lock_state();
            if state.initialized {
                debug!("Bridge already initialized");
                return;
            }
            state.initialized = true;
            info!(
                version = VERSION,
                framing = ?self.config.framing,
                topic_filtering = self.config.topic_filtering,
                "Bridge initialized"
            );
        });
        self.record(result)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().initialized
    }

    /// Close every socket and return to the uninitialized state.
    ///
    /// Handles keep counting up across a later `init`.
    pub fn terminate(&self) {
        let (was_initialized, drained) = {
            let mut state = self.lock_state();
            let was = std::mem::replace(&mut state.initialized, false);
            (was, state.table.drain())
        };

        for (handle, entry) in &drained {
            trace!(%handle, kind = %entry.kind(), "Closing on terminate");
            entry.close();
        }
        if was_initialized || !drained.is_empty() {
            info!(closed = drained.len(), "Bridge terminated");
        }
    }

    /// Bind a publisher on `address` (`tcp://*:5556`, `tcp://127.0.0.1:0`, ...).
    pub fn create_publisher(&self, address: &str) -> Result<Handle, BridgeError> {
        let result = self.ensure_initialized().and_then(|()| {
            let address = Address::parse(address)?;
            let socket = PublisherSocket::bind(address, &self.config)?;
            self.register(SocketEntry::Publisher(Arc::new(socket)))
        });
        self.record(result)
    }

    /// Connect a subscriber to `address` (`tcp://localhost:5556`, ...).
    pub fn create_subscriber(&self, address: &str) -> Result<Handle, BridgeError> {
        let result = self.ensure_initialized().and_then(|()| {
            let address = Address::parse(address)?;
            let socket = SubscriberSocket::connect(address, &self.config)?;
            self.register(SocketEntry::Subscriber(Arc::new(socket)))
        });
        self.record(result)
    }

    /// Record a topic prefix on a subscriber. Only filters when the manager
    /// was configured with `topic_filtering`.
    pub fn subscribe(&self, handle: Handle, prefix: &[u8]) -> Result<(), BridgeError> {
        let result = self
            .lookup(|table| table.subscriber(handle))
            .map(|subscriber| subscriber.subscribe(prefix));
        self.record(result)
    }

    pub fn unsubscribe(&self, handle: Handle, prefix: &[u8]) -> Result<(), BridgeError> {
        let result = self
            .lookup(|table| table.subscriber(handle))
            .map(|subscriber| subscriber.unsubscribe(prefix));
        self.record(result)
    }

    /// Broadcast a message from a publisher. Succeeds with no subscribers.
    pub fn send(
        &self,
        handle: Handle,
        topic: &[u8],
        payload: &[u8],
    ) -> Result<SendReport, BridgeError> {
        let result = self
            .lookup(|table| table.publisher(handle))
            .and_then(|publisher| publisher.send(&Message::new(topic, payload)));
        self.record(result)
    }

    /// Topic prefixes recorded on a subscriber, in subscription order.
    pub fn subscriptions(&self, handle: Handle) -> Result<Vec<Vec<u8>>, BridgeError> {
        let result = self
            .lookup(|table| table.subscriber(handle))
            .map(|subscriber| subscriber.subscriptions());
        self.record(result)
    }

    /// Wait up to `timeout` for the next message on a subscriber.
    pub fn receive(&self, handle: Handle, timeout: Duration) -> Result<Message, BridgeError> {
        let result = self
            .lookup(|table| table.subscriber(handle))
            .and_then(|subscriber| subscriber.receive(timeout));
        self.record(result)
    }

    /// Whether a receive on the subscriber would make progress within `timeout`.
    pub fn poll(&self, handle: Handle, timeout: Duration) -> Result<bool, BridgeError> {
        let result = self
            .lookup(|table| table.subscriber(handle))
            .and_then(|subscriber| subscriber.poll(timeout));
        self.record(result)
    }

    /// Close one socket. Closing the same handle twice fails.
    pub fn close(&self, handle: Handle) -> Result<(), BridgeError> {
        let result = self.lookup(|table| table.remove(handle)).map(|entry| {
            entry.close();
            debug!(%handle, kind = %entry.kind(), "Handle closed");
        });
        self.record(result)
    }

    /// Subscribers currently attached to a publisher.
    pub fn peer_count(&self, handle: Handle) -> Result<usize, BridgeError> {
        let result = self
            .lookup(|table| table.publisher(handle))
            .map(|publisher| publisher.peer_count());
        self.record(result)
    }

    /// Address a publisher is actually listening on.
    pub fn local_addr(&self, handle: Handle) -> Result<SocketAddr, BridgeError> {
        let result = self
            .lookup(|table| table.publisher(handle))
            .map(|publisher| publisher.local_addr());
        self.record(result)
    }

    pub fn kind(&self, handle: Handle) -> Result<SocketKind, BridgeError> {
        let result = self.lookup(|table| {
            table
                .get(handle)
                .map(|entry| entry.kind())
                .ok_or_else(|| BridgeError::invalid_handle(handle.get(), "unknown or closed"))
        });
        self.record(result)
    }

    /// Number of live sockets.
    pub fn socket_count(&self) -> usize {
        self.lock_state().table.len()
    }

    /// Description of the most recent failure, empty if none.
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store a failure detected before reaching the manager, such as a caller
    /// passing a handle value that can never be valid.
    pub fn set_last_error(&self, err: &BridgeError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err.to_string();
    }

    pub fn version(&self) -> &'static str {
        version()
    }

    fn ensure_initialized(&self) -> Result<(), BridgeError> {
        if self.lock_state().initialized {
            Ok(())
        } else {
            Err(BridgeError::NotInitialized)
        }
    }

    /// Run `f` against the table while holding the lock for just that call.
    fn lookup<T>(
        &self,
        f: impl FnOnce(&mut HandleTable) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let mut state = self.lock_state();
        if !state.initialized {
            return Err(BridgeError::NotInitialized);
        }
        f(&mut state.table)
    }

    /// Insert a freshly created socket. A terminate racing the creation, or
    /// an exhausted handle space, closes the socket instead.
    fn register(&self, entry: SocketEntry) -> Result<Handle, BridgeError> {
        let kind = entry.kind();
        let result = self.lookup(|table| table.insert(entry.clone()));
        match &result {
            Ok(handle) => {
                info!(%handle, %kind, address = %entry.as_closeable().address(), "Socket registered")
            }
            Err(_) => entry.close(),
        }
        result
    }

    fn record<T>(&self, result: Result<T, BridgeError>) -> Result<T, BridgeError> {
        if let Err(err) = &result {
            if err.is_expected() {
                trace!(error = %err, "Expected outcome");
            } else {
                debug!(error = %err, "Bridge operation failed");
                self.set_last_error(err);
            }
        }
        result
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "tcp://127.0.0.1:0";

    fn ready() -> Manager {
        let manager = Manager::default();
        manager.init().unwrap();
        manager
    }

    #[test]
    fn test_init_is_idempotent() {
        let manager = Manager::default();
        assert!(!manager.is_initialized());
        manager.init().unwrap();
        manager.init().unwrap();
        assert!(manager.is_initialized());
    }

    #[test]
    fn test_invalid_config_fails_init() {
        let manager = Manager::new(BridgeConfig {
            recv_buffer_size: 0,
            ..BridgeConfig::default()
        });
        assert!(matches!(manager.init(), Err(BridgeError::Config(_))));
        assert!(!manager.is_initialized());
        assert!(manager.last_error().contains("recv_buffer_size"));
    }

    #[test]
    fn test_operations_before_init() {
        let manager = Manager::default();
        assert_eq!(
            manager.create_publisher(LOCAL).unwrap_err(),
            BridgeError::NotInitialized
        );
        let h = Handle::new(1).unwrap();
        assert_eq!(manager.close(h).unwrap_err(), BridgeError::NotInitialized);
        assert_eq!(manager.last_error(), "Bridge not initialized");
    }

    #[test]
    fn test_handles_are_monotonic() {
        let manager = ready();
        let handles: Vec<_> = (0..4)
            .map(|_| manager.create_publisher(LOCAL).unwrap())
            .collect();
        assert!(handles.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(manager.socket_count(), 4);
    }

    #[test]
    fn test_double_close_fails() {
        let manager = ready();
        let h = manager.create_publisher(LOCAL).unwrap();
        manager.close(h).unwrap();
        assert!(matches!(
            manager.close(h),
            Err(BridgeError::InvalidHandle { .. })
        ));
        assert!(manager.last_error().starts_with("Invalid handle"));
    }

    #[test]
    fn test_send_without_subscribers_succeeds() {
        let manager = ready();
        let h = manager.create_publisher(LOCAL).unwrap();
        let report = manager.send(h, b"t", b"m").unwrap();
        assert_eq!(report.peers, 0);
        assert_eq!(manager.peer_count(h).unwrap(), 0);
    }

    #[test]
    fn test_wrong_kind_is_invalid_handle() {
        let manager = ready();
        let publisher = manager.create_publisher(LOCAL).unwrap();
        assert!(matches!(
            manager.receive(publisher, Duration::ZERO),
            Err(BridgeError::InvalidHandle { reason: "not a subscriber socket", .. })
        ));
        assert!(matches!(
            manager.subscribe(publisher, b""),
            Err(BridgeError::InvalidHandle { .. })
        ));

        let port = manager.local_addr(publisher).unwrap().port();
        let subscriber = manager
            .create_subscriber(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();
        assert!(matches!(
            manager.send(subscriber, b"t", b"m"),
            Err(BridgeError::InvalidHandle { reason: "not a publisher socket", .. })
        ));
        assert_eq!(manager.kind(subscriber).unwrap(), SocketKind::Subscriber);
    }

    #[test]
    fn test_subscriptions_round_trip_through_handle() {
        let manager = ready();
        let publisher = manager.create_publisher(LOCAL).unwrap();
        let port = manager.local_addr(publisher).unwrap().port();
        let subscriber = manager
            .create_subscriber(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();

        manager.subscribe(subscriber, b"tick.").unwrap();
        manager.subscribe(subscriber, b"bar.").unwrap();
        manager.unsubscribe(subscriber, b"tick.").unwrap();
        assert_eq!(manager.subscriptions(subscriber).unwrap(), vec![b"bar.".to_vec()]);
    }

    #[test]
    fn test_failed_creation_allocates_no_handle() {
        let manager = ready();
        assert!(matches!(
            manager.create_publisher("tcp://nowhere"),
            Err(BridgeError::AddressParse { .. })
        ));
        assert!(matches!(
            manager.create_subscriber("tcp://*:5556"),
            Err(BridgeError::AddressParse { .. })
        ));
        assert_eq!(manager.socket_count(), 0);

        let h = manager.create_publisher(LOCAL).unwrap();
        assert_eq!(h.get(), 1);
    }

    #[test]
    fn test_bind_failure_reports_address() {
        let manager = ready();
        let first = manager.create_publisher(LOCAL).unwrap();
        let port = manager.local_addr(first).unwrap().port();
        let taken = format!("tcp://127.0.0.1:{port}");

        assert!(matches!(
            manager.create_publisher(&taken),
            Err(BridgeError::BindFailed { .. })
        ));
        assert!(manager
            .last_error()
            .starts_with(&format!("Failed to bind to address: {taken}")));
        assert_eq!(manager.socket_count(), 1);
    }

    #[test]
    fn test_timeout_does_not_overwrite_last_error() {
        let manager = ready();
        let publisher = manager.create_publisher(LOCAL).unwrap();
        let port = manager.local_addr(publisher).unwrap().port();
        let subscriber = manager
            .create_subscriber(&format!("tcp://127.0.0.1:{port}"))
            .unwrap();

        let _ = manager.close(Handle::new(999).unwrap());
        let before = manager.last_error();
        assert_eq!(
            manager.receive(subscriber, Duration::ZERO).unwrap_err(),
            BridgeError::Timeout
        );
        assert_eq!(manager.last_error(), before);
    }

    #[test]
    fn test_terminate_and_reinit() {
        let manager = ready();
        let first = manager.create_publisher(LOCAL).unwrap();
        manager.create_publisher(LOCAL).unwrap();

        manager.terminate();
        manager.terminate();
        assert!(!manager.is_initialized());
        assert_eq!(manager.socket_count(), 0);

        manager.init().unwrap();
        let next = manager.create_publisher(LOCAL).unwrap();
        assert!(next > first);
        assert!(matches!(
            manager.close(first),
            Err(BridgeError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_terminate_with_no_sockets() {
        let manager = Manager::default();
        manager.terminate();
        manager.init().unwrap();
        manager.terminate();
        assert_eq!(manager.socket_count(), 0);
    }

    #[test]
    fn test_version() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
        assert_eq!(Manager::default().version(), version());
    }
}
