//! Reassembly ledger: in-flight multi-packet messages.
//!
//! A message is keyed by (origin, message id). Its START packet
//! registers a partial message holding chunk 1; DATA packets fill
//! positions 2.. in any order. The DATA with the contiguous flag clear
//! fixes the last position, and the message completes once every
//! position up to it is filled.
//!
//! A DATA packet can be processed before its START even though the
//! sender transmitted START first. Such a packet parks on the key's
//! coordination slot until the START registers, the optional wait
//! deadline passes, or the ledger is cleared.
//!
//! Completed keys are remembered for a retention window so a late START
//! cannot reopen them. Expired entries are ignored on lookup and removed
//! in bulk by `expiry_loop`, never on the completion path.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use dgbus_core::config::ReassemblyConfig;

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Identity of one logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub origin: SocketAddr,
    pub message_id: Uuid,
}

impl ReassemblyKey {
    pub fn new(origin: SocketAddr, message_id: Uuid) -> Self {
        Self { origin, message_id }
    }
}

impl fmt::Display for ReassemblyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.message_id)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("duplicate START for {0}")]
    ConflictingStart(ReassemblyKey),

    #[error("{0} already completed")]
    AlreadyCompleted(ReassemblyKey),

    #[error("no START for {key} within {waited:?}")]
    MissingStart { key: ReassemblyKey, waited: Duration },

    #[error("chunk {seq} of {key} received twice")]
    DuplicateChunk { key: ReassemblyKey, seq: u16 },

    #[error("chunk sequence {seq} is not valid for {key}")]
    InvalidSequence { key: ReassemblyKey, seq: u16 },

    #[error("reassembly of {0} abandoned by shutdown")]
    Abandoned(ReassemblyKey),
}

// ── Partial messages ──────────────────────────────────────────────────────────

/// Output of a completed reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub topic: String,
    pub payload: Bytes,
    pub chunks: usize,
}

impl Assembled {
    /// A message that fit in its START packet.
    pub fn single(topic: String, payload: Bytes) -> Self {
        Self {
            topic,
            payload,
            chunks: 1,
        }
    }
}

enum Rejection {
    Duplicate,
    OutOfRange,
}

struct PartialMessage {
    topic: String,
    /// Index `seq - 1` holds chunk `seq`. Index 0 is the START chunk.
    chunks: Vec<Option<Bytes>>,
    filled: usize,
    total_size: usize,
    /// Sequence number of the terminal DATA, once seen.
    terminal: Option<u16>,
    finished: bool,
}

impl PartialMessage {
    fn new(topic: String, first: Bytes) -> Self {
        let total_size = first.len();
        Self {
            topic,
            chunks: vec![Some(first)],
            filled: 1,
            total_size,
            terminal: None,
            finished: false,
        }
    }

    fn insert(&mut self, seq: u16, chunk: Bytes, terminal: bool) -> Result<(), Rejection> {
        // Position 1 belongs to START.
        if seq < 2 {
            return Err(Rejection::OutOfRange);
        }
        if let Some(last) = self.terminal {
            if seq > last || (terminal && seq != last) {
                return Err(Rejection::OutOfRange);
            }
        }
        let idx = usize::from(seq - 1);
        if terminal && self.chunks.len() > idx + 1 {
            // Something already sits beyond the claimed end.
            return Err(Rejection::OutOfRange);
        }
        if self.chunks.len() <= idx {
            self.chunks.resize(idx + 1, None);
        }
        let slot = &mut self.chunks[idx];
        if slot.is_some() {
            return Err(Rejection::Duplicate);
        }
        self.total_size += chunk.len();
        *slot = Some(chunk);
        self.filled += 1;
        if terminal {
            self.terminal = Some(seq);
        }
        Ok(())
    }

    fn is_complete(&self) -> bool {
        matches!(self.terminal, Some(last) if self.filled == usize::from(last))
    }

    fn assemble(&mut self) -> Assembled {
        let mut payload = BytesMut::with_capacity(self.total_size);
        let chunks = self.chunks.len();
        for chunk in self.chunks.drain(..).flatten() {
            payload.extend_from_slice(&chunk);
        }
        Assembled {
            topic: std::mem::take(&mut self.topic),
            payload: payload.freeze(),
            chunks,
        }
    }
}

type SharedPartial = Arc<Mutex<PartialMessage>>;

// ── Ledger ────────────────────────────────────────────────────────────────────

pub struct ReassemblyLedger {
    partials: DashMap<ReassemblyKey, SharedPartial>,
    slots: DashMap<ReassemblyKey, Arc<Notify>>,
    /// Recently completed keys and when they completed.
    completed: DashMap<ReassemblyKey, Instant>,
    start_timeout: Option<Duration>,
    retention: Duration,
    /// Bumped by `clear`; waiters that see it move give up.
    generation: AtomicU64,
}

impl ReassemblyLedger {
    pub fn new(start_timeout: Option<Duration>, retention: Duration) -> Self {
        Self {
            partials: DashMap::new(),
            slots: DashMap::new(),
            completed: DashMap::new(),
            start_timeout,
            retention,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &ReassemblyConfig) -> Self {
        Self::new(config.start_timeout(), config.completed_retention())
    }

    /// Register the START of a multi-packet message.
    ///
    /// The first START for a key wins; later ones are rejected and their
    /// chunk dropped. Any DATA packets parked on the key are woken.
    pub fn on_start(
        &self,
        key: ReassemblyKey,
        topic: String,
        first_chunk: Bytes,
    ) -> Result<(), LedgerError> {
        match self.partials.entry(key) {
            Entry::Occupied(_) => return Err(LedgerError::ConflictingStart(key)),
            Entry::Vacant(vacant) => {
                // Checked under the shard lock: completion records the key
                // here before it removes the partial.
                if self.recently_completed(&key) {
                    return Err(LedgerError::AlreadyCompleted(key));
                }
                vacant.insert(Arc::new(Mutex::new(PartialMessage::new(topic, first_chunk))));
            }
        }
        tracing::trace!(key = %key, "START registered");
        self.wake(&key);
        Ok(())
    }

    /// Place a DATA chunk at position `seq`.
    ///
    /// Returns the assembled message to exactly one caller: the one whose
    /// chunk completed it. Waits for the START if it has not registered.
    pub async fn on_data(
        &self,
        key: ReassemblyKey,
        seq: u16,
        chunk: Bytes,
        terminal: bool,
    ) -> Result<Option<Assembled>, LedgerError> {
        let partial = self.await_partial(&key).await?;

        let assembled = {
            let mut message = partial.lock().await;
            if message.finished {
                return Err(LedgerError::AlreadyCompleted(key));
            }
            message.insert(seq, chunk, terminal).map_err(|r| match r {
                Rejection::Duplicate => LedgerError::DuplicateChunk { key, seq },
                Rejection::OutOfRange => LedgerError::InvalidSequence { key, seq },
            })?;
            if !message.is_complete() {
                return Ok(None);
            }
            message.finished = true;
            message.assemble()
        };

        self.completed.insert(key, Instant::now());
        self.partials.remove_if(&key, |_, v| Arc::ptr_eq(v, &partial));
        self.wake(&key);

        tracing::trace!(key = %key, chunks = assembled.chunks, "message reassembled");
        Ok(Some(assembled))
    }

    /// Abandon everything in flight. Parked DATA packets return
    /// `LedgerError::Abandoned`. Returns the number of partial messages dropped.
    pub fn clear(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let abandoned = self.partials.len();
        self.partials.clear();
        for slot in self.slots.iter() {
            slot.value().notify_waiters();
        }
        self.slots.clear();
        self.completed.clear();
        abandoned
    }

    /// Partial messages awaiting more chunks.
    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    /// Keys with DATA packets parked waiting for a START.
    pub fn pending_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, key: &ReassemblyKey) -> bool {
        self.partials.contains_key(key)
    }

    /// Completed keys still held, expired or not.
    pub fn retained(&self) -> usize {
        self.completed.len()
    }

    /// Interval `expiry_loop` wakes at: the retention window, capped at a second.
    pub fn prune_interval(&self) -> Duration {
        self.retention.clamp(Duration::from_millis(10), Duration::from_secs(1))
    }

    /// Drop completed keys older than the retention window. Returns how many went.
    pub fn prune_completed(&self) -> usize {
        let before = self.completed.len();
        let retention = self.retention;
        self.completed.retain(|_, at| at.elapsed() < retention);
        before.saturating_sub(self.completed.len())
    }

    fn recently_completed(&self, key: &ReassemblyKey) -> bool {
        self.completed
            .get(key)
            .is_some_and(|at| at.elapsed() < self.retention)
    }

    fn lookup(&self, key: &ReassemblyKey) -> Result<Option<SharedPartial>, LedgerError> {
        if let Some(partial) = self.partials.get(key) {
            return Ok(Some(partial.value().clone()));
        }
        if self.recently_completed(key) {
            return Err(LedgerError::AlreadyCompleted(*key));
        }
        Ok(None)
    }

    async fn await_partial(&self, key: &ReassemblyKey) -> Result<SharedPartial, LedgerError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let started = tokio::time::Instant::now();
        let deadline = self.start_timeout.map(|t| started + t);

        loop {
            if let Some(partial) = self.lookup(key)? {
                return Ok(partial);
            }

            let slot = self
                .slots
                .entry(*key)
                .or_insert_with(|| Arc::new(Notify::new()))
                .value()
                .clone();
            let notified = slot.notified();
            tokio::pin!(notified);
            // Enabled before the re-check, so a START registering in
            // between still wakes us.
            notified.as_mut().enable();

            match self.lookup(key) {
                Ok(None) => {}
                Ok(Some(partial)) => {
                    self.release_slot(key, &slot);
                    return Ok(partial);
                }
                Err(e) => {
                    self.release_slot(key, &slot);
                    return Err(e);
                }
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                self.release_slot(key, &slot);
                return Err(LedgerError::Abandoned(*key));
            }

            tracing::trace!(key = %key, "DATA waiting for START");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.release_slot(key, &slot);
                        return Err(LedgerError::MissingStart {
                            key: *key,
                            waited: started.elapsed(),
                        });
                    }
                }
                None => notified.await,
            }

            if self.generation.load(Ordering::SeqCst) != generation {
                return Err(LedgerError::Abandoned(*key));
            }
        }
    }

    /// Wake everything parked on `key` and drop its slot.
    fn wake(&self, key: &ReassemblyKey) {
        if let Some((_, slot)) = self.slots.remove(key) {
            slot.notify_waiters();
        }
    }

    /// Drop a slot nobody else is parked on.
    fn release_slot(&self, key: &ReassemblyKey, slot: &Arc<Notify>) {
        // One reference in the map, one held by the caller.
        self.slots
            .remove_if(key, |_, s| Arc::ptr_eq(s, slot) && Arc::strong_count(s) <= 2);
    }

}

/// Remove completed keys that have outlived the retention window.
///
/// Runs forever. Cancel by aborting the task.
pub async fn expiry_loop(ledger: Arc<ReassemblyLedger>) {
    let mut interval = tokio::time::interval(ledger.prune_interval());
    loop {
        interval.tick().await;
        let removed = ledger.prune_completed();
        if removed > 0 {
            tracing::debug!(removed, "expired completed message ids");
        }
    }
}

impl Default for ReassemblyLedger {
    fn default() -> Self {
        Self::from_config(&ReassemblyConfig::default())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
