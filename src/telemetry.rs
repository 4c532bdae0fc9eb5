//! Lock-free diagnostic counters, readable from any thread while the
//! scheduler runs on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    bytes_received: AtomicU64,
    frames_distributed: AtomicU64,
    content_none_received: AtomicU64,
    protocol_errors: AtomicU64,
    re_requests: AtomicU64,
    commands_abandoned: AtomicU64,
}

/// Cheaply cloneable handle onto the scheduler's running counters.
#[derive(Debug, Clone, Default)]
pub struct Telemetry(Arc<Counters>);

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.0.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_frames_distributed(&self) {
        self.0.frames_distributed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_content_none(&self) {
        self.0.content_none_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_protocol_errors(&self) {
        self.0.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_re_requests(&self) {
        self.0.re_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commands_abandoned(&self) {
        self.0.commands_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            bytes_received: self.0.bytes_received.load(Ordering::Relaxed),
            frames_distributed: self.0.frames_distributed.load(Ordering::Relaxed),
            content_none_received: self.0.content_none_received.load(Ordering::Relaxed),
            protocol_errors: self.0.protocol_errors.load(Ordering::Relaxed),
            re_requests: self.0.re_requests.load(Ordering::Relaxed),
            commands_abandoned: self.0.commands_abandoned.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub bytes_received: u64,
    pub frames_distributed: u64,
    pub content_none_received: u64,
    pub protocol_errors: u64,
    pub re_requests: u64,
    pub commands_abandoned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let t = Telemetry::new();
        t.add_bytes_received(10);
        t.inc_frames_distributed();
        t.inc_frames_distributed();
        t.inc_protocol_errors();

        let snap = t.snapshot();
        assert_eq!(snap.bytes_received, 10);
        assert_eq!(snap.frames_distributed, 2);
        assert_eq!(snap.protocol_errors, 1);
        assert_eq!(snap.content_none_received, 0);
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let t1 = Telemetry::new();
        let t2 = t1.clone();
        t1.inc_re_requests();
        assert_eq!(t2.snapshot().re_requests, 1);
    }
}
