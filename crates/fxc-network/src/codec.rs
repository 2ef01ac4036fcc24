//! Incremental message framing.
//!
//! A [`MessageFramer`] reassembles exactly one wire message from arbitrary
//! byte chunks. Callers loop over a chunk, feeding it to the current framer
//! and starting a new one whenever the previous one completes, so a single
//! read may yield several messages or end in the middle of a header.

use crate::protocol::{MessageHeader, HEADER_SIZE};
use crate::{NetworkError, NetworkResult};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::time::Instant;

/// How far ahead of the bytes received so far the payload buffer may grow.
const PAYLOAD_PREALLOC: usize = 256 * 1024;

/// One in-progress wire message.
pub struct MessageFramer {
    magic: [u8; 4],
    max_size: usize,

    header_buf: [u8; HEADER_SIZE],
    header_pos: usize,
    header: Option<MessageHeader>,

    payload: Vec<u8>,
    hasher: Sha256,
    payload_hash: Option<[u8; 32]>,
}

impl MessageFramer {
    /// Create a framer expecting `magic` and rejecting payloads over `max_size`.
    pub fn new(magic: [u8; 4], max_size: usize) -> Self {
        Self {
            magic,
            max_size,
            header_buf: [0u8; HEADER_SIZE],
            header_pos: 0,
            header: None,
            payload: Vec::new(),
            hasher: Sha256::new(),
            payload_hash: None,
        }
    }

    /// Whether the header has been parsed and payload bytes are expected.
    pub fn in_payload(&self) -> bool {
        self.header.is_some()
    }

    /// Parsed header, once complete.
    pub fn header(&self) -> Option<&MessageHeader> {
        self.header.as_ref()
    }

    /// Feed bytes to whichever part of the message is still missing.
    pub fn feed(&mut self, bytes: &[u8]) -> NetworkResult<usize> {
        if self.in_payload() {
            Ok(self.feed_payload(bytes))
        } else {
            self.feed_header(bytes)
        }
    }

    /// Copy bytes into the header buffer, parsing it once full.
    ///
    /// A malformed header or a declared length above the maximum is fatal for
    /// the connection.
    pub fn feed_header(&mut self, bytes: &[u8]) -> NetworkResult<usize> {
        let remaining = HEADER_SIZE - self.header_pos;
        let copy = remaining.min(bytes.len());
        self.header_buf[self.header_pos..self.header_pos + copy].copy_from_slice(&bytes[..copy]);
        self.header_pos += copy;

        if self.header_pos < HEADER_SIZE {
            return Ok(copy);
        }

        let header = MessageHeader::decode(&self.header_buf, self.magic)?;
        let size = header.payload_len as usize;
        if size > self.max_size {
            return Err(NetworkError::MessageTooLarge {
                size,
                max: self.max_size,
            });
        }
        self.header = Some(header);
        Ok(copy)
    }

    /// Copy bytes into the payload buffer.
    ///
    /// Consumes at most the bytes still missing from the declared length.
    pub fn feed_payload(&mut self, bytes: &[u8]) -> usize {
        let total = match &self.header {
            Some(header) => header.payload_len as usize,
            None => return 0,
        };
        let pos = self.payload.len();
        let copy = (total - pos).min(bytes.len());
        if copy == 0 {
            return 0;
        }

        let needed = pos + copy;
        if self.payload.capacity() < needed {
            let target = total.min(needed + PAYLOAD_PREALLOC);
            self.payload.reserve_exact(target - pos);
        }
        self.payload.extend_from_slice(&bytes[..copy]);
        self.hasher.update(&bytes[..copy]);
        copy
    }

    /// Whether header and the full declared payload have arrived.
    pub fn is_complete(&self) -> bool {
        match &self.header {
            Some(header) => self.payload.len() == header.payload_len as usize,
            None => false,
        }
    }

    /// Double SHA256 of the payload, computed once on first call.
    pub fn payload_hash(&mut self) -> Option<[u8; 32]> {
        if !self.is_complete() {
            return None;
        }
        if self.payload_hash.is_none() {
            let first = self.hasher.clone().finalize();
            self.payload_hash = Some(Sha256::digest(first).into());
        }
        self.payload_hash
    }

    /// Whether the payload matches the header checksum.
    pub fn checksum_ok(&mut self) -> bool {
        let expected = match &self.header {
            Some(header) => header.checksum,
            None => return false,
        };
        match self.payload_hash() {
            Some(hash) => hash[..4] == expected,
            None => false,
        }
    }

    /// Bytes buffered so far, header included.
    pub fn buffered_len(&self) -> usize {
        self.header_pos + self.payload.len()
    }

    /// Turn a complete framer into a message for the processor.
    pub fn into_message(mut self, received: Instant) -> Option<ReceivedMessage> {
        if !self.is_complete() {
            return None;
        }
        let checksum_ok = self.checksum_ok();
        let header = self.header?;
        let msg_type = header.msg_type()?.to_string();
        Some(ReceivedMessage {
            raw_size: HEADER_SIZE + self.payload.len(),
            msg_type,
            header,
            payload: Bytes::from(self.payload),
            checksum_ok,
            received,
        })
    }
}

impl std::fmt::Debug for MessageFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFramer")
            .field("header_pos", &self.header_pos)
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A complete message waiting for the processor.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Message type with padding stripped.
    pub msg_type: String,
    /// Parsed header.
    pub header: MessageHeader,
    /// Payload bytes.
    pub payload: Bytes,
    /// Whether the payload matched the header checksum.
    pub checksum_ok: bool,
    /// Header plus payload size.
    pub raw_size: usize,
    /// When the last byte arrived.
    pub received: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{hash256, serialize_message};

    const MAGIC: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

    fn feed_all(framer: &mut MessageFramer, mut bytes: &[u8]) -> NetworkResult<()> {
        while !bytes.is_empty() && !framer.is_complete() {
            let n = framer.feed(bytes)?;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    #[test]
    fn test_single_chunk() {
        let payload = b"hello world".to_vec();
        let wire = serialize_message(MAGIC, "tx", &payload).unwrap();

        let mut framer = MessageFramer::new(MAGIC, 1024);
        feed_all(&mut framer, &wire).unwrap();

        assert!(framer.is_complete());
        assert!(framer.checksum_ok());
        assert_eq!(framer.payload_hash(), Some(hash256(&payload)));

        let msg = framer.into_message(Instant::now()).unwrap();
        assert_eq!(msg.msg_type, "tx");
        assert_eq!(&msg.payload[..], &payload[..]);
        assert_eq!(msg.raw_size, HEADER_SIZE + payload.len());
    }

    #[test]
    fn test_chunks_5_10_17() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let wire = serialize_message(MAGIC, "ping", &payload).unwrap();
        assert_eq!(wire.len(), 32);

        let mut framer = MessageFramer::new(MAGIC, 1024);
        let mut offset = 0;
        let mut states = Vec::new();
        for size in [5usize, 10, 17] {
            feed_all(&mut framer, &wire[offset..offset + size]).unwrap();
            offset += size;
            states.push(framer.is_complete());
        }

        assert_eq!(states, vec![false, false, true]);
        let msg = framer.into_message(Instant::now()).unwrap();
        assert_eq!(&msg.payload[..], &payload[..]);
        assert!(msg.checksum_ok);
    }

    #[test]
    fn test_empty_slices_change_nothing() {
        let payload = [9u8; 16];
        let wire = serialize_message(MAGIC, "pong", &payload).unwrap();
        let mut framer = MessageFramer::new(MAGIC, 1024);

        // Before, inside and right after the header, then inside the payload.
        for (start, end) in [(0, 0), (0, 10), (10, 10), (10, 24), (24, 24), (24, 30), (30, 30), (30, 40)] {
            if start == end {
                assert_eq!(framer.feed(&[]).unwrap(), 0);
                assert!(!framer.is_complete());
            } else {
                feed_all(&mut framer, &wire[start..end]).unwrap();
            }
        }
        assert!(framer.in_payload());
        assert_eq!(framer.buffered_len(), HEADER_SIZE + 16);
        assert!(framer.is_complete());
        assert_eq!(framer.feed(&[]).unwrap(), 0);

        let msg = framer.into_message(Instant::now()).unwrap();
        assert_eq!(&msg.payload[..], &payload[..]);
        assert!(msg.checksum_ok);
    }

    #[test]
    fn test_zero_length_payload_completes_with_header() {
        let wire = serialize_message(MAGIC, "verack", &[]).unwrap();
        let mut framer = MessageFramer::new(MAGIC, 1024);
        let consumed = framer.feed(&wire).unwrap();
        assert_eq!(consumed, HEADER_SIZE);
        assert!(framer.is_complete());
        assert!(framer.checksum_ok());
    }

    #[test]
    fn test_oversize_rejected_at_header() {
        let payload = vec![0u8; 100];
        let wire = serialize_message(MAGIC, "block", &payload).unwrap();
        let mut framer = MessageFramer::new(MAGIC, 99);

        // Feeding only the header is enough to fail.
        let err = framer.feed(&wire[..HEADER_SIZE]).unwrap_err();
        assert!(matches!(err, NetworkError::MessageTooLarge { size: 100, max: 99 }));
        assert!(!framer.in_payload());
    }

    #[test]
    fn test_stops_at_message_boundary() {
        let mut wire = serialize_message(MAGIC, "ping", &[9u8; 8]).unwrap().to_vec();
        let second = serialize_message(MAGIC, "pong", &[7u8; 8]).unwrap();
        wire.extend_from_slice(&second);

        let mut framer = MessageFramer::new(MAGIC, 1024);
        let mut consumed = framer.feed(&wire).unwrap();
        consumed += framer.feed(&wire[consumed..]).unwrap();
        assert!(framer.is_complete());
        assert_eq!(consumed, 32);

        // Nothing more is taken once complete.
        assert_eq!(framer.feed(&wire[consumed..]).unwrap(), 0);
    }

    #[test]
    fn test_bad_checksum_is_reported_not_fatal() {
        let mut wire = serialize_message(MAGIC, "ping", &[1u8; 8]).unwrap();
        wire[HEADER_SIZE] ^= 0xff;

        let mut framer = MessageFramer::new(MAGIC, 1024);
        feed_all(&mut framer, &wire).unwrap();
        assert!(framer.is_complete());
        assert!(!framer.checksum_ok());
    }

    #[test]
    fn test_prealloc_bounded_by_declared_length() {
        let payload = vec![0xabu8; 1000];
        let wire = serialize_message(MAGIC, "tx", &payload).unwrap();
        let mut framer = MessageFramer::new(MAGIC, 1 << 20);
        framer.feed(&wire[..HEADER_SIZE]).unwrap();
        framer.feed(&wire[HEADER_SIZE..HEADER_SIZE + 10]).unwrap();
        assert!(framer.payload.capacity() >= 10);
        assert!(framer.payload.capacity() <= 1000);
    }
}
