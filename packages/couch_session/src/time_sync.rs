//! Server time estimation.
//!
//! One round-trip probe against the host clock, assuming symmetric latency:
//!
//! ```text
//! client                     host
//!   |--- TimeProbe (t0) ------>|
//!   |<-- TimeReply (ts) -------|   (client receives at t1)
//!
//!   rtt    = t1 - t0
//!   offset = ts + rtt / 2 - t1
//! ```

use std::cell::Cell;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy)]
struct PendingProbe {
    id: u64,
    sent_at: i64,
}

/// Result of a completed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingMeasurement {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

pub struct TimeSyncService {
    requested: bool,
    clock: Arc<dyn Clock>,
    offset: Option<i64>,
    pending: Option<PendingProbe>,
    next_probe_id: u64,
    /// Highest time handed out so far; `server_time` never goes below it.
    last_served: Cell<i64>,
}

impl TimeSyncService {
    pub fn new(requested: bool, clock: Arc<dyn Clock>) -> Self {
        Self {
            requested,
            clock,
            offset: None,
            pending: None,
            next_probe_id: 0,
            last_served: Cell::new(i64::MIN),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested
    }

    pub fn is_synchronized(&self) -> bool {
        self.offset.is_some()
    }

    pub fn has_pending_probe(&self) -> bool {
        self.pending.is_some()
    }

    pub fn local_now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Start a probe. Returns the probe id to send, or `None` when sync was
    /// not requested. A newer probe supersedes an unanswered one.
    pub fn begin_probe(&mut self) -> Option<u64> {
        if !self.requested {
            return None;
        }
        self.next_probe_id += 1;
        let probe = PendingProbe {
            id: self.next_probe_id,
            sent_at: self.clock.now_millis(),
        };
        self.pending = Some(probe);
        Some(probe.id)
    }

    /// Apply a probe reply. Replies that do not match the outstanding probe
    /// are ignored.
    pub fn complete_probe(&mut self, probe_id: u64, server_time: i64) -> Option<TimingMeasurement> {
        let probe = match self.pending {
            Some(probe) if probe.id == probe_id => probe,
            _ => {
                warn!(probe_id, "ignoring unexpected time probe reply");
                return None;
            }
        };
        self.pending = None;

        let received_at = self.clock.now_millis();
        let rtt_ms = received_at.saturating_sub(probe.sent_at).max(0);
        // Host timestamps are untrusted; saturate instead of overflowing.
        let offset_ms = server_time
            .saturating_add(rtt_ms / 2)
            .saturating_sub(received_at);
        debug!(offset_ms, rtt_ms, "time sync measurement");

        self.offset = Some(offset_ms);
        Some(TimingMeasurement { offset_ms, rtt_ms })
    }

    /// Drop any in-flight probe without surfacing a result.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    fn check_requested(&self) -> Result<()> {
        if self.requested {
            Ok(())
        } else {
            Err(SessionError::Configuration(
                "server time requires synchronize_time = true".to_string(),
            ))
        }
    }

    pub fn offset(&self) -> Result<i64> {
        self.check_requested()?;
        self.offset
            .ok_or(SessionError::NotReady("time sync has not completed"))
    }

    /// `local_now + offset`, clamped so successive calls never decrease.
    pub fn server_time(&self) -> Result<i64> {
        let offset = self.offset()?;
        let time = self
            .clock
            .now_millis()
            .saturating_add(offset)
            .max(self.last_served.get());
        self.last_served.set(time);
        Ok(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service(requested: bool) -> (TimeSyncService, ManualClock) {
        let clock = ManualClock::new(1_000);
        (TimeSyncService::new(requested, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn offset_compensates_half_rtt() {
        let (mut sync, clock) = service(true);
        let id = sync.begin_probe().unwrap();
        clock.advance(100);

        let m = sync.complete_probe(id, 5_050).unwrap();
        assert_eq!(m, TimingMeasurement { offset_ms: 4_000, rtt_ms: 100 });
        assert_eq!(sync.server_time().unwrap(), 5_100);
    }

    #[test]
    fn not_ready_before_probe_completes() {
        let (mut sync, _clock) = service(true);
        assert!(matches!(sync.server_time(), Err(SessionError::NotReady(_))));
        sync.begin_probe();
        assert!(matches!(sync.offset(), Err(SessionError::NotReady(_))));
    }

    #[test]
    fn not_requested_is_configuration_error() {
        let (mut sync, _clock) = service(false);
        assert!(sync.begin_probe().is_none());
        assert!(matches!(
            sync.server_time(),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn stale_reply_is_ignored() {
        let (mut sync, _clock) = service(true);
        let first = sync.begin_probe().unwrap();
        let second = sync.begin_probe().unwrap();
        assert!(sync.complete_probe(first, 9_999).is_none());
        assert!(sync.has_pending_probe());
        assert!(sync.complete_probe(second, 2_000).is_some());
    }

    #[test]
    fn cancelled_probe_never_surfaces() {
        let (mut sync, _clock) = service(true);
        let id = sync.begin_probe().unwrap();
        sync.cancel();
        assert!(sync.complete_probe(id, 2_000).is_none());
        assert!(!sync.is_synchronized());
    }

    #[test]
    fn extreme_host_timestamps_saturate() {
        let (mut sync, clock) = service(true);
        let id = sync.begin_probe().unwrap();
        let m = sync.complete_probe(id, i64::MAX).unwrap();
        assert_eq!(m.offset_ms, i64::MAX - 1_000);
        assert_eq!(sync.server_time().unwrap(), i64::MAX);

        clock.advance(10);
        assert_eq!(sync.server_time().unwrap(), i64::MAX);

        let id = sync.begin_probe().unwrap();
        let m = sync.complete_probe(id, i64::MIN).unwrap();
        assert_eq!(m.offset_ms, i64::MIN);
        assert_eq!(sync.server_time().unwrap(), i64::MAX);
    }

    #[test]
    fn server_time_never_regresses_after_resync() {
        let (mut sync, clock) = service(true);
        let id = sync.begin_probe().unwrap();
        sync.complete_probe(id, 11_000).unwrap();
        let before = sync.server_time().unwrap();
        assert_eq!(before, 11_000);

        // Second estimate puts the host 500ms further behind.
        let id = sync.begin_probe().unwrap();
        sync.complete_probe(id, 10_500).unwrap();
        assert_eq!(sync.server_time().unwrap(), before);

        clock.advance(600);
        assert_eq!(sync.server_time().unwrap(), 11_100);
    }
}
