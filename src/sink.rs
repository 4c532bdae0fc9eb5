//! Destinations for decoded content: log lines and process-tree snapshots.
//!
//! Grounded on the channel-backed forwarding in
//! `examples/other_examples/1c4fb28c_mrene-minidsp-rs__minidsp-src-transport-multiplexer.rs.rs`,
//! which hands decoded frames off via `std::sync::mpsc` rather than calling
//! back into arbitrary user code on the hot path.

use std::sync::mpsc::{Receiver, Sender, TryRecvError, TryIter};

/// Where decoded `Log` and `Proc` content goes. Called from the
/// scheduler's own thread — implementations must not block.
pub trait ContentSink: Send + Sync {
    /// A `Log` frame, or a synthesized offline notice.
    fn log(&self, text: &str);

    /// A `Proc` frame's raw payload, delivered on every admitted
    /// frame (not just changed ones) — callers wanting change
    /// notification should use [`crate::engine::EngineHandle::content_proc_changed`].
    fn proc_snapshot(&self, payload: &[u8]);
}

/// A [`ContentSink`] that forwards everything over two `mpsc` channels,
/// for callers who want to poll or block on a receiver rather than
/// implement the trait.
#[derive(Debug)]
pub struct ChannelSink {
    log_tx: Sender<String>,
    proc_tx: Sender<Vec<u8>>,
}

/// The receiving half of a [`ChannelSink`].
#[derive(Debug)]
pub struct ChannelSinkReceiver {
    pub log_rx: Receiver<String>,
    pub proc_rx: Receiver<Vec<u8>>,
}

impl ChannelSink {
    pub fn new() -> (Self, ChannelSinkReceiver) {
        let (log_tx, log_rx) = std::sync::mpsc::channel();
        let (proc_tx, proc_rx) = std::sync::mpsc::channel();
        (Self { log_tx, proc_tx }, ChannelSinkReceiver { log_rx, proc_rx })
    }
}

impl ContentSink for ChannelSink {
    fn log(&self, text: &str) {
        // A disconnected receiver means the caller dropped it; the
        // scheduler keeps running regardless.
        let _ = self.log_tx.send(text.to_string());
    }

    fn proc_snapshot(&self, payload: &[u8]) {
        let _ = self.proc_tx.send(payload.to_vec());
    }
}

impl ChannelSinkReceiver {
    /// Drains all currently-buffered log lines without blocking.
    pub fn drain_logs(&self) -> TryIter<'_, String> {
        self.log_rx.try_iter()
    }

    /// Returns the most recent process-tree snapshot, discarding any
    /// older ones still buffered.
    pub fn latest_proc(&self) -> Option<Vec<u8>> {
        let mut latest = None;
        loop {
            match self.proc_rx.try_recv() {
                Ok(payload) => latest = Some(payload),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sink_forwards_log_and_proc() {
        let (sink, rx) = ChannelSink::new();
        sink.log("hello");
        sink.proc_snapshot(b"tree");

        let logs: Vec<String> = rx.drain_logs().collect();
        assert_eq!(logs, vec!["hello".to_string()]);
        assert_eq!(rx.latest_proc(), Some(b"tree".to_vec()));
    }

    #[test]
    fn latest_proc_discards_superseded_snapshots() {
        let (sink, rx) = ChannelSink::new();
        sink.proc_snapshot(b"old");
        sink.proc_snapshot(b"new");
        assert_eq!(rx.latest_proc(), Some(b"new".to_vec()));
        assert_eq!(rx.latest_proc(), None);
    }
}
