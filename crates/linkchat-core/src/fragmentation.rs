//! Message chunking and reassembly
//!
//! The cipher seals at most [`MAX_PLAINTEXT_LEN`] bytes per frame, so longer messages
//! are split before encryption. Each chunk carries a small header inside the sealed
//! plaintext, which keeps chunk metadata confidential and authenticated.
//!
//! ## Chunk Format
//!
//! - MessageID: 4 bytes (u32, big-endian)
//! - Index: 2 bytes (u16, big-endian, 0-based)
//! - Total: 2 bytes (u16, big-endian)
//! - Data: remaining bytes, at most [`MAX_CHUNK_PAYLOAD`]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::crypto::MAX_PLAINTEXT_LEN;
use crate::errors::ReassemblyError;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the chunk header in bytes
pub const CHUNK_HEADER_LEN: usize = 8;

/// Largest slice of message text a single chunk carries
pub const MAX_CHUNK_PAYLOAD: usize = MAX_PLAINTEXT_LEN - CHUNK_HEADER_LEN;

/// Upper bound on chunks per message
pub const MAX_CHUNKS_PER_MESSAGE: usize = u16::MAX as usize;

// ----------------------------------------------------------------------------
// Chunk Header
// ----------------------------------------------------------------------------

/// Header prepended to every chunk before it is sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub message_id: u32,
    pub index: u16,
    pub total: u16,
}

impl ChunkHeader {
    pub fn new(message_id: u32, index: u16, total: u16) -> Self {
        Self {
            message_id,
            index,
            total,
        }
    }

    /// Validate fragment header
    pub fn validate(&self) -> Result<(), ReassemblyError> {
        if self.total == 0 || self.index >= self.total {
            return Err(ReassemblyError::InvalidHeader {
                index: self.index,
                total: self.total,
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[..4].copy_from_slice(&self.message_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.index.to_be_bytes());
        out[6..].copy_from_slice(&self.total.to_be_bytes());
        out
    }

    /// Split a decrypted chunk into its header and data
    pub fn decode(chunk: &[u8]) -> Result<(Self, &[u8]), ReassemblyError> {
        if chunk.len() < CHUNK_HEADER_LEN {
            return Err(ReassemblyError::ChunkTooShort { size: chunk.len() });
        }
        let header = Self {
            message_id: u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            index: u16::from_be_bytes([chunk[4], chunk[5]]),
            total: u16::from_be_bytes([chunk[6], chunk[7]]),
        };
        header.validate()?;
        Ok((header, &chunk[CHUNK_HEADER_LEN..]))
    }
}

// ----------------------------------------------------------------------------
// Chunker
// ----------------------------------------------------------------------------

/// Split message text into header-prefixed chunks, each small enough to seal
///
/// Empty text still produces one (empty) chunk so the peer sees the message.
pub fn split_message(message_id: u32, text: &[u8]) -> Result<Vec<Vec<u8>>, ReassemblyError> {
    let total = text.len().div_ceil(MAX_CHUNK_PAYLOAD).max(1);
    if total > MAX_CHUNKS_PER_MESSAGE {
        return Err(ReassemblyError::MessageTooLarge {
            size: text.len(),
            max_chunks: MAX_CHUNKS_PER_MESSAGE,
        });
    }

    let mut chunks = Vec::with_capacity(total);
    for index in 0..total {
        let start = index * MAX_CHUNK_PAYLOAD;
        let end = (start + MAX_CHUNK_PAYLOAD).min(text.len());
        let header = ChunkHeader::new(message_id, index as u16, total as u16);

        let mut chunk = Vec::with_capacity(CHUNK_HEADER_LEN + end - start);
        chunk.extend_from_slice(&header.encode());
        chunk.extend_from_slice(&text[start..end]);
        chunks.push(chunk);
    }
    Ok(chunks)
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

/// A message whose chunks are still arriving
#[derive(Debug)]
struct PendingMessage {
    total: u16,
    chunks: HashMap<u16, Vec<u8>>,
    first_seen: Instant,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn assemble(mut self) -> Vec<u8> {
        let mut assembled = Vec::new();
        for index in 0..self.total {
            if let Some(data) = self.chunks.remove(&index) {
                assembled.extend_from_slice(&data);
            }
        }
        assembled
    }
}

/// Collects decrypted chunks and yields complete messages
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<u32, PendingMessage>,
    recently_completed: VecDeque<u32>,
    timeout: Duration,
    max_pending: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_pending: usize) -> Self {
        Self {
            pending: HashMap::new(),
            recently_completed: VecDeque::new(),
            timeout,
            max_pending: max_pending.max(1),
        }
    }

    /// Number of partially received messages
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accept one decrypted chunk, returning the message text once all chunks are in
    pub fn accept(&mut self, chunk: &[u8]) -> Result<Option<String>, ReassemblyError> {
        self.accept_at(chunk, Instant::now())
    }

    /// `accept` with an explicit clock reading
    pub fn accept_at(
        &mut self,
        chunk: &[u8],
        now: Instant,
    ) -> Result<Option<String>, ReassemblyError> {
        let (header, data) = ChunkHeader::decode(chunk)?;
        self.expire(now);

        if self.recently_completed.contains(&header.message_id) {
            debug!("Ignoring late chunk of completed message {:08x}", header.message_id);
            return Ok(None);
        }

        if !self.pending.contains_key(&header.message_id) {
            while self.pending.len() >= self.max_pending {
                self.evict_oldest();
            }
            self.pending.insert(
                header.message_id,
                PendingMessage {
                    total: header.total,
                    chunks: HashMap::new(),
                    first_seen: now,
                },
            );
        }

        let Some(pending) = self.pending.get_mut(&header.message_id) else {
            return Ok(None);
        };

        if pending.total != header.total {
            return Err(ReassemblyError::TotalMismatch {
                message_id: header.message_id,
                expected: pending.total,
                actual: header.total,
            });
        }

        if pending.chunks.contains_key(&header.index) {
            debug!(
                "Ignoring duplicate chunk {} of message {:08x}",
                header.index, header.message_id
            );
            return Ok(None);
        }
        pending.chunks.insert(header.index, data.to_vec());

        if !pending.is_complete() {
            return Ok(None);
        }

        let Some(complete) = self.pending.remove(&header.message_id) else {
            return Ok(None);
        };
        self.remember_completed(header.message_id);

        String::from_utf8(complete.assemble())
            .map(Some)
            .map_err(|_| ReassemblyError::InvalidUtf8)
    }

    /// Drop partial messages older than the reassembly timeout
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.pending.retain(|message_id, pending| {
            let alive = now.saturating_duration_since(pending.first_seen) < timeout;
            if !alive {
                warn!(
                    "Dropping incomplete message {:08x} ({}/{} chunks)",
                    message_id,
                    pending.chunks.len(),
                    pending.total
                );
            }
            alive
        });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, pending)| pending.first_seen)
            .map(|(message_id, _)| *message_id);
        if let Some(message_id) = oldest {
            warn!("Evicting incomplete message {:08x}", message_id);
            self.pending.remove(&message_id);
        }
    }

    fn remember_completed(&mut self, message_id: u32) {
        if self.recently_completed.len() >= self.max_pending * 4 {
            self.recently_completed.pop_front();
        }
        self.recently_completed.push_back(message_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
