//! Chunked id allocation over durable sequences.
//!
//! Ids are reserved from a named storage sequence in chunks, so most calls
//! never touch storage. The chunk grows while reservations follow each
//! other quickly and shrinks again when demand is light:
//!
//! ```text
//! reservation within ramp window      -> multiplier * 2 (capped)
//! reservation after 4 ramp windows    -> multiplier / 2 (at least 1)
//! chunk = max(id_chunk_size * multiplier, ids still needed)
//! ```
//!
//! Storage serializes reservations across processes; a local mutex
//! serializes them within one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use revkb_storage::StorageBackend;
use tracing::debug;

use crate::config::KbConfig;
use crate::error::{CoreError, CoreResult};

/// Sequence that numbers revisions.
pub const REVISION_SEQUENCE: &str = "revision";

/// Sequence that numbers new objects.
pub const OBJECT_ID_SEQUENCE: &str = "object_id";

#[derive(Debug)]
struct Chunk {
    next: u64,
    end: u64,
    multiplier: u64,
    last_reservation: Option<Instant>,
}

/// Hands out unique, increasing ids from one durable sequence.
#[derive(Debug)]
pub struct SequenceAllocator {
    name: String,
    backend: Arc<dyn StorageBackend>,
    chunk_size: u64,
    max_multiplier: u64,
    ramp_window: Duration,
    chunk: Mutex<Chunk>,
    reservations: AtomicU64,
}

impl SequenceAllocator {
    /// Creates an allocator over sequence `name`.
    pub fn new(name: impl Into<String>, backend: Arc<dyn StorageBackend>, config: &KbConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            chunk_size: config.id_chunk_size.max(1),
            max_multiplier: config.id_max_multiplier.max(1),
            ramp_window: config.id_ramp_window,
            chunk: Mutex::new(Chunk {
                next: 0,
                end: 0,
                multiplier: 1,
                last_reservation: None,
            }),
            reservations: AtomicU64::new(0),
        }
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next id.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if a chunk cannot be reserved.
    pub fn next_id(&self) -> CoreResult<u64> {
        let mut chunk = self.chunk.lock();
        if chunk.next == chunk.end {
            self.reserve(&mut chunk, 1)?;
        }
        let id = chunk.next;
        chunk.next += 1;
        Ok(id)
    }

    /// `count` ids in increasing order. Either all are handed out or none.
    ///
    /// # Errors
    ///
    /// `AllocationFailure` if a chunk cannot be reserved.
    pub fn next_ids(&self, count: usize) -> CoreResult<Vec<u64>> {
        let mut chunk = self.chunk.lock();
        let available = chunk.end - chunk.next;
        let wanted = count as u64;
        if available < wanted {
            let first_left = chunk.next;
            let left = available;
            self.reserve(&mut chunk, wanted - left)?;
            // The ids left over from the old chunk are handed out first.
            let mut ids: Vec<u64> = (first_left..first_left + left).collect();
            let rest = wanted - left;
            ids.extend(chunk.next..chunk.next + rest);
            chunk.next += rest;
            return Ok(ids);
        }
        let ids = (chunk.next..chunk.next + wanted).collect();
        chunk.next += wanted;
        Ok(ids)
    }

    /// Ids reserved but not handed out yet.
    pub fn remaining(&self) -> u64 {
        let chunk = self.chunk.lock();
        chunk.end - chunk.next
    }

    /// Number of storage reservations made so far.
    pub fn reservations(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Current chunk multiplier.
    pub fn multiplier(&self) -> u64 {
        self.chunk.lock().multiplier
    }

    fn reserve(&self, chunk: &mut Chunk, needed: u64) -> CoreResult<()> {
        let now = Instant::now();
        if let Some(last) = chunk.last_reservation {
            let elapsed = now.duration_since(last);
            if elapsed < self.ramp_window {
                chunk.multiplier = (chunk.multiplier * 2).min(self.max_multiplier);
            } else if elapsed > self.ramp_window * 4 {
                chunk.multiplier = (chunk.multiplier / 2).max(1);
            }
        }
        let size = (self.chunk_size * chunk.multiplier).max(needed);
        let first = self
            .backend
            .reserve_sequence(&self.name, size)
            .map_err(|source| CoreError::AllocationFailure {
                sequence: self.name.clone(),
                source,
            })?;
        chunk.next = first;
        chunk.end = first + size;
        chunk.last_reservation = Some(now);
        self.reservations.fetch_add(1, Ordering::Relaxed);
        debug!(sequence = %self.name, first, size, multiplier = chunk.multiplier, "reserved id chunk");
        Ok(())
    }
}
