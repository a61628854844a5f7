//! Tuner slot allocation
//!
//! The pool is fixed-size: one slot per concurrent stream, sized by
//! `tuner_count`. Media servers retry aggressively while tuning, so a
//! retry from the same client for the same channel reuses its existing
//! slot instead of burning a second one; the superseded session's release
//! becomes a no-op via a per-slot generation counter.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::http::HeaderMap;

/// Error types for slot acquisition
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TunerError {
    #[error("all tuners in use")]
    AllTunersInUse,
}

/// One occupied slot
#[derive(Debug, Clone)]
struct Slot {
    channel_id: String,
    client_key: String,
    opened_at: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Option<Slot>>,
    next_generation: u64,
}

/// Fixed-capacity tuner pool
#[derive(Debug)]
pub struct TunerPool {
    state: Mutex<PoolState>,
    capacity: usize,
}

impl TunerPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                slots: vec![None; capacity],
                next_generation: 0,
            }),
            capacity,
        })
    }

    /// Acquire a slot for `(channel_id, client_key)`
    ///
    /// An existing slot for the same pair is reused (its generation bumps,
    /// so the superseded holder's release is ignored). Otherwise the first
    /// free slot is taken; a full pool yields `ErrAllTunersInUse`.
    pub fn acquire(
        self: &Arc<Self>,
        channel_id: &str,
        client_key: &str,
    ) -> Result<SlotGuard, TunerError> {
        let mut state = self.state.lock().expect("tuner pool poisoned");
        state.next_generation += 1;
        let generation = state.next_generation;

        // Same client re-tuning the same channel: take over its slot
        if let Some(index) = state.slots.iter().position(|s| {
            s.as_ref()
                .map(|s| s.channel_id == channel_id && s.client_key == client_key)
                .unwrap_or(false)
        }) {
            state.slots[index] = Some(Slot {
                channel_id: channel_id.to_string(),
                client_key: client_key.to_string(),
                opened_at: Instant::now(),
                generation,
            });
            tracing::debug!(index, channel_id, "tuner slot reused");
            return Ok(SlotGuard {
                pool: self.clone(),
                index,
                generation,
            });
        }

        let Some(index) = state.slots.iter().position(Option::is_none) else {
            return Err(TunerError::AllTunersInUse);
        };
        state.slots[index] = Some(Slot {
            channel_id: channel_id.to_string(),
            client_key: client_key.to_string(),
            opened_at: Instant::now(),
            generation,
        });
        tracing::debug!(index, channel_id, "tuner slot acquired");
        Ok(SlotGuard {
            pool: self.clone(),
            index,
            generation,
        })
    }

    fn release(&self, index: usize, generation: u64) {
        let mut state = self.state.lock().expect("tuner pool poisoned");
        if let Some(slot) = &state.slots[index] {
            if slot.generation == generation {
                let held = slot.opened_at.elapsed();
                state.slots[index] = None;
                tracing::debug!(index, held_secs = held.as_secs(), "tuner slot released");
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        let state = self.state.lock().expect("tuner pool poisoned");
        state.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// RAII handle on an acquired slot; dropping it releases the slot
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<TunerPool>,
    index: usize,
    generation: u64,
}

impl SlotGuard {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.index, self.generation);
    }
}

/// Derive the slot-reuse key for a client request
///
/// Header order: `X-Plex-Session-Identifier`, then
/// `X-Plex-Client-Identifier`, then `X-Plex-Device-Name`; the peer address
/// is the fallback when a client sends none of them.
pub fn client_key(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    for name in [
        "x-plex-session-identifier",
        "x-plex-client-identifier",
        "x-plex-device-name",
    ] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.map(|ip| ip.to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}
