//! The startup gate
//!
//! Media servers open the stream and wait for usable bytes before they
//! instantiate their packager; garbage or silence in the first seconds
//! kills the session with "consumer not found". The gate holds back
//! upstream bytes until enough have accumulated (optionally until a
//! keyframe and audio unit are seen), while ticking out valid keepalive
//! packets so the socket stays alive and the packager has a sync pattern,
//! or a full program map, to chew on.
//!
//! The gate itself is synchronous state; the session loop drives the
//! clock and the keepalive timer around it.

use super::mpegts;
use crate::config::{Config, GateTimeoutPolicy};
use std::time::Duration;

/// Gate parameters, lifted out of [`Config`]
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub timeout: Duration,
    pub require_good_start: bool,
    pub null_ts_keepalive: bool,
    pub null_tick: Duration,
    pub program_keepalive: bool,
    pub program_tick: Duration,
    pub timeout_policy: GateTimeoutPolicy,
    pub bootstrap: bool,
    pub bootstrap_seconds: u32,
}

impl GateConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_bytes: config.startup_min_bytes,
            max_bytes: config.startup_max_bytes,
            timeout: Duration::from_millis(config.startup_timeout_ms),
            require_good_start: config.require_good_start,
            null_ts_keepalive: config.null_ts_keepalive,
            null_tick: Duration::from_millis(config.null_ts_keepalive_ms),
            program_keepalive: config.program_keepalive,
            program_tick: Duration::from_millis(config.program_keepalive_ms),
            timeout_policy: config.startup_timeout_policy,
            bootstrap: config.bootstrap_ts,
            bootstrap_seconds: config.bootstrap_ts_seconds,
        }
    }

    /// The active keepalive tick, program keepalive taking precedence
    pub fn keepalive_tick(&self) -> Option<Duration> {
        if self.program_keepalive {
            Some(self.program_tick)
        } else if self.null_ts_keepalive {
            Some(self.null_tick)
        } else {
            None
        }
    }
}

/// Accumulates upstream bytes until the gate releases
#[derive(Debug)]
pub struct StartupGate {
    config: GateConfig,
    buffer: Vec<u8>,
    keepalive_continuity: u8,
    satisfied: bool,
}

impl StartupGate {
    pub fn new(config: GateConfig) -> Self {
        let capacity = config.min_bytes.min(1 << 20);
        Self {
            config,
            buffer: Vec::with_capacity(capacity),
            keepalive_continuity: 0,
            satisfied: false,
        }
    }

    /// Accumulate an upstream chunk; returns true once the gate is satisfied
    ///
    /// No byte is ever dropped: everything pushed before satisfaction is
    /// flushed to the client, in order, when the gate releases.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if !self.satisfied {
            self.buffer.extend_from_slice(chunk);
            self.evaluate();
        }
        self.satisfied
    }

    fn evaluate(&mut self) {
        if self.buffer.len() >= self.config.max_bytes {
            // Upper bound reached: release regardless of content
            self.satisfied = true;
            return;
        }
        if self.buffer.len() < self.config.min_bytes {
            return;
        }
        if self.config.require_good_start {
            let inspection = mpegts::inspect_ts(&self.buffer);
            if !inspection.good_start() {
                return;
            }
        }
        self.satisfied = true;
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drain the held bytes for flushing to the client
    pub fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// The next keepalive burst, or `None` when keepalive is disabled
    ///
    /// Program keepalive (PAT + PMT) wins over null-TS when both are on:
    /// it is the stronger signal, letting the packager instantiate before
    /// any video arrives.
    pub fn keepalive_burst(&mut self) -> Option<Vec<u8>> {
        if self.config.program_keepalive {
            let burst = mpegts::program_keepalive(self.keepalive_continuity);
            self.keepalive_continuity = (self.keepalive_continuity + 1) & 0x0F;
            Some(burst)
        } else if self.config.null_ts_keepalive {
            Some(mpegts::null_packet().to_vec())
        } else {
            None
        }
    }

    /// The bootstrap stream for the timeout path, when enabled
    pub fn bootstrap(&self) -> Option<Vec<u8>> {
        self.config
            .bootstrap
            .then(|| mpegts::bootstrap_ts(self.config.bootstrap_seconds))
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_config(min: usize, max: usize, good_start: bool) -> GateConfig {
        GateConfig {
            min_bytes: min,
            max_bytes: max,
            timeout: Duration::from_secs(10),
            require_good_start: good_start,
            null_ts_keepalive: true,
            null_tick: Duration::from_millis(100),
            program_keepalive: false,
            program_tick: Duration::from_millis(100),
            timeout_policy: GateTimeoutPolicy::Stream,
            bootstrap: true,
            bootstrap_seconds: 1,
        }
    }

    #[test]
    fn test_gate_releases_at_min_bytes() {
        let mut gate = StartupGate::new(gate_config(1000, 10_000, false));
        assert!(!gate.push(&[0u8; 500]));
        assert!(!gate.is_satisfied());
        assert!(gate.push(&[0u8; 500]));
        assert!(gate.is_satisfied());
    }

    #[test]
    fn test_gate_holds_all_bytes_in_order() {
        let mut gate = StartupGate::new(gate_config(4, 100, false));
        gate.push(&[1, 2]);
        gate.push(&[3, 4, 5]);
        assert_eq!(gate.take_buffer(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_good_start_requires_idr_and_aac() {
        let mut gate = StartupGate::new(gate_config(100, 1 << 20, true));
        // Plenty of bytes, but null packets carry no media
        let mut nulls = Vec::new();
        for _ in 0..10 {
            nulls.extend_from_slice(&mpegts::null_packet());
        }
        assert!(!gate.push(&nulls));

        // The bootstrap stream contains both an IDR and AAC
        let media = mpegts::bootstrap_ts(1);
        assert!(gate.push(&media));
    }

    #[test]
    fn test_max_bytes_forces_release() {
        let mut gate = StartupGate::new(gate_config(100, 2000, true));
        // Unrecognisable bytes, but the upper bound fires
        assert!(gate.push(&vec![0xABu8; 2000]));
    }

    #[test]
    fn test_push_after_satisfaction_is_ignored() {
        let mut gate = StartupGate::new(gate_config(10, 100, false));
        assert!(gate.push(&[0u8; 10]));
        let held = gate.buffered_len();
        gate.push(&[0u8; 50]);
        assert_eq!(gate.buffered_len(), held);
    }

    #[test]
    fn test_null_keepalive_burst() {
        let mut gate = StartupGate::new(gate_config(10, 100, false));
        let burst = gate.keepalive_burst().unwrap();
        assert_eq!(burst.len(), mpegts::TS_PACKET_SIZE);
        assert_eq!(burst[0], mpegts::TS_SYNC_BYTE);
    }

    #[test]
    fn test_program_keepalive_increments_continuity() {
        let mut config = gate_config(10, 100, false);
        config.program_keepalive = true;
        let mut gate = StartupGate::new(config);

        let first = gate.keepalive_burst().unwrap();
        let second = gate.keepalive_burst().unwrap();
        assert_eq!(first.len(), 2 * mpegts::TS_PACKET_SIZE);
        assert_eq!(first[3] & 0x0F, 0);
        assert_eq!(second[3] & 0x0F, 1);
    }

    #[test]
    fn test_keepalive_disabled() {
        let mut config = gate_config(10, 100, false);
        config.null_ts_keepalive = false;
        config.program_keepalive = false;
        let mut gate = StartupGate::new(config);
        assert!(gate.keepalive_burst().is_none());
        assert!(gate.config().keepalive_tick().is_none());
    }

    #[test]
    fn test_keepalive_tick_prefers_program() {
        let mut config = gate_config(10, 100, false);
        config.program_keepalive = true;
        config.program_tick = Duration::from_millis(500);
        config.null_tick = Duration::from_millis(100);
        assert_eq!(config.keepalive_tick(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_bootstrap_respects_flag() {
        let mut config = gate_config(10, 100, false);
        config.bootstrap = false;
        let gate = StartupGate::new(config);
        assert!(gate.bootstrap().is_none());

        let gate = StartupGate::new(gate_config(10, 100, false));
        assert!(gate.bootstrap().is_some());
    }
}
