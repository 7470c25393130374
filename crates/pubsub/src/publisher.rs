use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use mtbridge_core::*;
use tracing::{debug, info, trace, warn};

/// One accepted subscriber connection.
#[derive(Debug)]
struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Peer {
    /// One non-blocking write. `Ok(true)` means the whole frame went out,
    /// `Ok(false)` means the peer missed this message but stays connected.
    fn write_frame(&self, frame: &[u8], framing: Framing) -> Result<bool, BridgeError> {
        match (&self.stream).write(frame) {
            Ok(n) if n == frame.len() => Ok(true),
            Ok(0) => Err(BridgeError::SendFailed(format!(
                "{} accepted no bytes",
                self.addr
            ))),
            Ok(n) => match framing {
                Framing::Delimited => {
                    trace!(peer = %self.addr, written = n, len = frame.len(), "Partial write");
                    Ok(false)
                }
                Framing::LengthPrefixed => Err(BridgeError::SendFailed(format!(
                    "partial write of {}/{} bytes to {} breaks framing",
                    n,
                    frame.len(),
                    self.addr
                ))),
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) => Err(BridgeError::SendFailed(format!("{}: {}", self.addr, e))),
        }
    }
}

/// Listener plus connected peers. Only touched under the publisher's lock.
#[derive(Debug)]
struct PublisherState {
    listener: Option<TcpListener>,
    peers: Vec<Peer>,
}

/// A bound, listening endpoint that broadcasts to every connected subscriber.
///
/// New subscribers are only discovered when [`PublisherSocket::send`] drains
/// the accept backlog, so a subscriber's first message is the first send after
/// it connected.
#[derive(Debug)]
pub struct PublisherSocket {
    address: Address,
    local_addr: SocketAddr,
    framing: Framing,
    max_frame_size: usize,
    nodelay: bool,
    state: Mutex<PublisherState>,
    closed: AtomicBool,
}

impl PublisherSocket {
    /// Bind and listen on `address`. Nothing is left open on failure.
    pub fn bind(address: Address, config: &BridgeConfig) -> Result<Self, BridgeError> {
        let mut last_error = None;
        for addr in address.bind_addrs()? {
            match Self::listen_on(addr) {
                Ok((listener, local_addr)) => {
                    info!(address = %address, %local_addr, "Publisher listening");
                    return Ok(Self {
                        address,
                        local_addr,
                        framing: config.framing,
                        max_frame_size: config.max_frame_size,
                        nodelay: config.nodelay,
                        state: Mutex::new(PublisherState {
                            listener: Some(listener),
                            peers: Vec::new(),
                        }),
                        closed: AtomicBool::new(false),
                    });
                }
                Err(e) => {
                    debug!(address = %address, target = %addr, error = %e, "Bind attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(BridgeError::BindFailed {
            address: address.to_string(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable addresses".to_string()),
        })
    }

    fn listen_on(addr: SocketAddr) -> io::Result<(TcpListener, SocketAddr)> {
        // The standard library enables SO_REUSEADDR on Unix listeners.
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok((listener, local_addr))
    }

    /// The address the listener actually bound, with the real port when
    /// port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribers accepted so far that have not been evicted.
    pub fn peer_count(&self) -> usize {
        self.lock_state().peers.len()
    }

    /// Broadcast `message` to every connected subscriber.
    ///
    /// Succeeds with zero subscribers. Peers whose socket buffer is full miss
    /// the message; peers whose write fails are closed and dropped.
    pub fn send(&self, message: &Message) -> Result<SendReport, BridgeError> {
        if self.framing == Framing::LengthPrefixed && message.encoded_len() > self.max_frame_size {
            return Err(BridgeError::Protocol(format!(
                "message of {} bytes exceeds the {} byte frame limit",
                message.encoded_len(),
                self.max_frame_size
            )));
        }
        let frame = self.framing.encode(message);

        let mut guard = self.lock_state();
        let state = &mut *guard;
        let listener = state.listener.as_ref().ok_or(BridgeError::ConnectionClosed)?;

        self.accept_pending(listener, &mut state.peers);

        let mut report = SendReport {
            peers: state.peers.len(),
            ..SendReport::default()
        };
        state.peers.retain(|peer| match peer.write_frame(&frame, self.framing) {
            Ok(true) => {
                report.delivered += 1;
                true
            }
            Ok(false) => {
                report.skipped += 1;
                true
            }
            Err(err) => {
                warn!(publisher = %self.address, peer = %peer.addr, error = %err, "Evicting subscriber");
                report.evicted += 1;
                false
            }
        });

        trace!(
            publisher = %self.address,
            topic = %message.topic_str(),
            bytes = frame.len(),
            peers = report.peers,
            delivered = report.delivered,
            "Broadcast"
        );
        Ok(report)
    }

    /// Accept until the backlog would block.
    fn accept_pending(&self, listener: &TcpListener, peers: &mut Vec<Peer>) {
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.configure_peer(&stream) {
                        warn!(publisher = %self.address, peer = %addr, error = %e, "Dropping unconfigurable subscriber");
                        continue;
                    }
                    debug!(publisher = %self.address, peer = %addr, "Subscriber connected");
                    peers.push(Peer { stream, addr });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(publisher = %self.address, error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn configure_peer(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Closeable for PublisherSocket {
    fn kind(&self) -> SocketKind {
        SocketKind::Publisher
    }

    fn address(&self) -> &Address {
        &self.address
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.lock_state();
        let peers = state.peers.len();
        state.listener = None;
        state.peers.clear();
        info!(address = %self.address, peers, "Publisher closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn bind_local(config: &BridgeConfig) -> PublisherSocket {
        PublisherSocket::bind(Address::parse("tcp://127.0.0.1:0").unwrap(), config).unwrap()
    }

    #[test]
    fn test_send_without_subscribers() {
        let publisher = bind_local(&BridgeConfig::default());
        let report = publisher.send(&Message::new("t", "m")).unwrap();
        assert_eq!(report, SendReport::default());
        assert_ne!(publisher.local_addr().port(), 0);
    }

    #[test]
    fn test_bind_conflict_fails() {
        let config = BridgeConfig::default();
        let first = bind_local(&config);
        let taken = format!("tcp://127.0.0.1:{}", first.local_addr().port());
        let err = PublisherSocket::bind(Address::parse(&taken).unwrap(), &config).unwrap_err();
        assert!(matches!(err, BridgeError::BindFailed { .. }));
    }

    #[test]
    fn test_accepts_and_writes_to_raw_peer() {
        let publisher = bind_local(&BridgeConfig::default());
        let mut client = TcpStream::connect(publisher.local_addr()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut report = SendReport::default();
        while report.delivered == 0 && Instant::now() < deadline {
            report = publisher.send(&Message::new("quote", "1.0845")).unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(report.delivered, 1);
        assert_eq!(publisher.peer_count(), 1);

        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"quote\x001.0845");
    }

    #[test]
    fn test_oversized_length_prefixed_message_rejected() {
        let config = BridgeConfig {
            framing: Framing::LengthPrefixed,
            max_frame_size: 16,
            ..BridgeConfig::default()
        };
        let publisher = bind_local(&config);
        let err = publisher.send(&Message::new("t", vec![0u8; 32])).unwrap_err();
        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[test]
    fn test_closed_publisher_refuses_send() {
        let publisher = bind_local(&BridgeConfig::default());
        publisher.close();
        publisher.close();
        assert!(publisher.is_closed());
        assert_eq!(
            publisher.send(&Message::new("t", "m")).unwrap_err(),
            BridgeError::ConnectionClosed
        );
    }
}
