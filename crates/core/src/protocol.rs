use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::models::Message;
use crate::traits::BridgeError;

/// Separates the topic from the payload on the wire.
pub const TOPIC_SEPARATOR: u8 = 0x00;

/// Bytes read per receive. Delimited messages longer than this are truncated.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 4096;

/// Size of the big-endian length prefix used by [`Framing::LengthPrefixed`].
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest frame a length-prefixed decoder accepts by default.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// How message boundaries are represented on a TCP stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// `topic NUL payload`, one write per message, one read per message.
    /// Compatible with existing terminal-side consumers.
    #[default]
    Delimited,
    /// The delimited body behind a 4-byte big-endian length.
    LengthPrefixed,
}

impl Framing {
    /// Bytes to write to a peer for `message`.
    pub fn encode(self, message: &Message) -> Vec<u8> {
        let body = encode(&message.topic, &message.payload);
        match self {
            Framing::Delimited => body,
            Framing::LengthPrefixed => frame_message(&body),
        }
    }
}

/// Serialize a topic and payload into the delimited wire format.
pub fn encode(topic: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(topic.len() + 1 + payload.len());
    buf.extend_from_slice(topic);
    buf.push(TOPIC_SEPARATOR);
    buf.extend_from_slice(payload);
    buf
}

/// Parse one delimited message.
///
/// Everything before the first NUL is the topic. Without a NUL the whole
/// buffer is the payload and the topic is empty.
pub fn decode(buf: &[u8]) -> Message {
    match buf.iter().position(|&b| b == TOPIC_SEPARATOR) {
        Some(pos) => Message::new(&buf[..pos], &buf[pos + 1..]),
        None => Message::new(Vec::new(), buf),
    }
}

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(LENGTH_PREFIX_LEN + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Turns the chunks a subscriber reads into whole messages.
///
/// In delimited framing every chunk is one message. In length-prefixed
/// framing chunks are buffered until full frames are available, and a single
/// chunk may yield several messages.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_frame_size: usize,
    partial: Vec<u8>,
    ready: VecDeque<Message>,
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size,
            partial: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Feed bytes read from the socket.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), BridgeError> {
        match self.framing {
            Framing::Delimited => {
                self.ready.push_back(decode(chunk));
                Ok(())
            }
            Framing::LengthPrefixed => {
                self.partial.extend_from_slice(chunk);
                self.split_frames()
            }
        }
    }

    /// Next complete message, oldest first.
    pub fn next_message(&mut self) -> Option<Message> {
        self.ready.pop_front()
    }

    pub fn has_message(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Bytes of an incomplete frame still waiting for the rest.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    fn split_frames(&mut self) -> Result<(), BridgeError> {
        let mut offset = 0;
        while self.partial.len() - offset >= LENGTH_PREFIX_LEN {
            let mut prefix = [0u8; LENGTH_PREFIX_LEN];
            prefix.copy_from_slice(&self.partial[offset..offset + LENGTH_PREFIX_LEN]);
            let len = u32::from_be_bytes(prefix) as usize;
            if len > self.max_frame_size {
                return Err(BridgeError::Protocol(format!(
                    "frame of {} bytes exceeds the {} byte limit",
                    len, self.max_frame_size
                )));
            }

            let start = offset + LENGTH_PREFIX_LEN;
            let end = start + len;
            if self.partial.len() < end {
                break;
            }
            self.ready.push_back(decode(&self.partial[start..end]));
            offset = end;
        }
        self.partial.drain(..offset);
        Ok(())
    }
}
