use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mtbridge_core::*;
use tracing::{debug, info, trace};

/// Longest single blocking read. Waits beyond this, up to an unbounded
/// `Duration::MAX`, are made of several reads.
const MAX_READ_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Read buffer plus whatever the decoder has not handed out yet.
#[derive(Debug)]
struct Inbox {
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

/// An endpoint connected to one publisher.
///
/// Subscriptions are recorded but only filter when the manager was configured
/// with `topic_filtering`; otherwise every broadcast is delivered and callers
/// filter on the topic themselves.
#[derive(Debug)]
pub struct SubscriberSocket {
    address: Address,
    stream: TcpStream,
    topic_filtering: bool,
    inbox: Mutex<Inbox>,
    prefixes: Mutex<Vec<Vec<u8>>>,
    /// Set when a zero-wait read could not switch the socket back to blocking.
    left_nonblocking: AtomicBool,
    closed: AtomicBool,
}

impl SubscriberSocket {
    /// Connect to `address`, trying each resolved address within the
    /// configured connect timeout.
    pub fn connect(address: Address, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let timeout = config.connect_timeout();
        let mut last_error = None;
        for addr in address.connect_addrs()? {
            match Self::open(addr, timeout, config.nodelay) {
                Ok(stream) => {
                    info!(address = %address, peer = %addr, "Subscriber connected");
                    return Ok(Self {
                        address,
                        stream,
                        topic_filtering: config.topic_filtering,
                        inbox: Mutex::new(Inbox {
                            decoder: FrameDecoder::new(config.framing, config.max_frame_size),
                            buf: vec![0u8; config.recv_buffer_size],
                        }),
                        prefixes: Mutex::new(Vec::new()),
                        left_nonblocking: AtomicBool::new(false),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    debug!(address = %address, target = %addr, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(BridgeError::ConnectFailed {
            address: address.to_string(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable addresses".to_string()),
        })
    }

    fn open(addr: SocketAddr, timeout: Duration, nodelay: bool) -> io::Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        if nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }

    /// Record a topic prefix. The empty prefix means "everything".
    pub fn subscribe(&self, prefix: &[u8]) {
        let mut prefixes = self.lock_prefixes();
        if !prefixes.iter().any(|p| p == prefix) {
            prefixes.push(prefix.to_vec());
        }
        if self.topic_filtering {
            debug!(address = %self.address, topic = %String::from_utf8_lossy(prefix), "Subscribed");
        } else {
            debug!(
                address = %self.address,
                topic = %String::from_utf8_lossy(prefix),
                "Subscription recorded; topic filtering is off so every message is delivered"
            );
        }
    }

    /// Forget a topic prefix. Unknown prefixes are ignored.
    pub fn unsubscribe(&self, prefix: &[u8]) {
        self.lock_prefixes().retain(|p| p != prefix);
    }

    pub fn subscriptions(&self) -> Vec<Vec<u8>> {
        self.lock_prefixes().clone()
    }

    /// Wait up to `timeout` for the next message.
    ///
    /// A zero timeout makes exactly one non-blocking attempt. Messages that
    /// fail the topic filter are dropped and the wait continues until the
    /// deadline. A timeout too large to add to the clock waits indefinitely.
    pub fn receive(&self, timeout: Duration) -> Result<Message, BridgeError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut guard = self.lock_inbox();
        let inbox = &mut *guard;
        let mut has_read = false;

        loop {
            while let Some(message) = inbox.decoder.next_message() {
                if self.accepts(&message) {
                    trace!(address = %self.address, topic = %message.topic_str(), bytes = message.payload.len(), "Received");
                    return Ok(message);
                }
                trace!(address = %self.address, topic = %message.topic_str(), "Dropped unsubscribed topic");
            }

            if self.is_closed() {
                return Err(BridgeError::ConnectionClosed);
            }

            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => MAX_READ_WAIT,
            };
            // Filtered-out traffic must not stretch the wait past the deadline.
            if has_read && remaining.is_zero() {
                return Err(BridgeError::Timeout);
            }

            has_read = true;
            let n = match self.with_wait(remaining, |mut stream| stream.read(&mut inbox.buf)) {
                Ok(0) => return Err(BridgeError::ConnectionClosed),
                Ok(n) => n,
                Err(e) => match self.classify(e) {
                    BridgeError::Timeout if deadline.is_none() => continue,
                    err => return Err(err),
                },
            };

            if n == inbox.buf.len() && inbox.decoder.framing() == Framing::Delimited {
                debug!(address = %self.address, bytes = n, "Receive filled the buffer; message may be truncated");
            }
            if let Err(err) = inbox.decoder.push(&inbox.buf[..n]) {
                // The stream cannot be resynchronised after a bad frame.
                self.close();
                return Err(err);
            }
        }
    }

    /// Whether a receive would make progress within `timeout`: a message is
    /// buffered, bytes are waiting, or the publisher hung up.
    pub fn poll(&self, timeout: Duration) -> Result<bool, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ConnectionClosed);
        }
        if self.lock_inbox().decoder.has_message() {
            return Ok(true);
        }

        let mut probe = [0u8; 1];
        match self.with_wait(timeout, |stream| stream.peek(&mut probe)) {
            Ok(_) => Ok(true),
            Err(e) => match self.classify(e) {
                BridgeError::Timeout => Ok(false),
                other => Err(other),
            },
        }
    }

    /// Run one socket operation, blocking at most `wait`.
    fn with_wait<T>(
        &self,
        wait: Duration,
        op: impl FnOnce(&TcpStream) -> io::Result<T>,
    ) -> io::Result<T> {
        if wait.is_zero() {
            self.stream.set_nonblocking(true)?;
            let result = op(&self.stream);
            // Bytes `op` consumed must still reach the caller.
            if let Err(e) = self.stream.set_nonblocking(false) {
                debug!(address = %self.address, error = %e, "Failed to restore blocking mode");
                self.left_nonblocking.store(true, Ordering::SeqCst);
            }
            result
        } else {
            if self.left_nonblocking.load(Ordering::SeqCst) {
                self.stream.set_nonblocking(false)?;
                self.left_nonblocking.store(false, Ordering::SeqCst);
            }
            self.stream.set_read_timeout(Some(wait.min(MAX_READ_WAIT)))?;
            op(&self.stream)
        }
    }

    fn classify(&self, e: io::Error) -> BridgeError {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                BridgeError::Timeout
            }
            _ => {
                debug!(address = %self.address, error = %e, "Subscriber connection broken");
                BridgeError::ConnectionClosed
            }
        }
    }

    fn accepts(&self, message: &Message) -> bool {
        !self.topic_filtering
            || self
                .lock_prefixes()
                .iter()
                .any(|prefix| message.matches_prefix(prefix))
    }

    fn lock_inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_prefixes(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.prefixes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Closeable for SubscriberSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Subscriber
    }

    fn address(&self) -> &Address {
        &self.address
    }

    /// Shuts the connection down, which also wakes a receive blocked in
    /// another thread.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(address = %self.address, error = %e, "Shutdown failed");
            }
        }
        info!(address = %self.address, "Subscriber closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
