//! Byte-level SWT state machine: [`FrameDecoder`], its [`FragmentStore`],
//! and the [`ProcRateFilter`] the scheduler injects for process-tree
//! throttling.

use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::config::FRAGMENT_MAX_BYTES;
use crate::wire::{self, ContentClass, Frame};

/// Result of feeding one byte to [`FrameDecoder::feed`].
///
/// `ContentNone` is kept distinct from `Frame` (rather than a `Frame` with
/// an empty payload) so the scheduler can bump its none-received counter
/// without allocating, matching spec.md §3's "for `None` payload is empty."
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// No frame completed by this byte.
    Idle,
    /// A frame was completed.
    Frame(Frame),
    /// A bare keep-alive/ack was completed.
    ContentNone,
    /// An illegal byte was seen mid-fragment; the fragment was dropped.
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    ContentWait,
    DataReceive,
}

#[derive(Debug)]
struct CurrentFrame {
    content_id: ContentClass,
    unsolicited: bool,
    /// Set when the process-tree rate filter rejected this frame; bytes are
    /// still consumed through end/abort to stay in sync, but no frame is
    /// emitted and nothing is appended to the fragment store.
    ignore: bool,
}

/// Per-content-class reassembly buffer, a fixed 4-slot array rather than a
/// hash map (Design Note: avoid a map keyed by byte id). Each slot is a
/// `BytesMut`, matching the teacher's read-buffer type in
/// `examples/MazinLab-jpe/src/transport/connection.rs`.
#[derive(Debug, Default)]
struct FragmentStore {
    slots: [BytesMut; ContentClass::COUNT],
}

impl FragmentStore {
    fn begin(&mut self, cc: ContentClass) {
        self.slots[cc.slot()].clear();
    }

    fn append(&mut self, cc: ContentClass, byte: u8) {
        let slot = &mut self.slots[cc.slot()];
        if slot.len() < FRAGMENT_MAX_BYTES {
            slot.extend_from_slice(&[byte]);
        }
        // else: silently discarded — FragmentOverflow is not an error.
    }

    fn take(&mut self, cc: ContentClass) -> Vec<u8> {
        std::mem::take(&mut self.slots[cc.slot()]).to_vec()
    }

    fn clear(&mut self, cc: ContentClass) {
        self.slots[cc.slot()].clear();
    }
}

/// Throttles `Proc` frame acceptance to at most once per `refresh_rate_ms`.
///
/// Purely time-driven and owned by the scheduler, then passed into
/// [`FrameDecoder::feed`] — the decoder itself has no clock, per spec.md
/// §4.1's invariant that it is "purely a function of the byte stream."
#[derive(Debug)]
pub struct ProcRateFilter {
    refresh_rate_ms: u32,
    last_accepted: Option<Instant>,
}

impl ProcRateFilter {
    pub fn new(refresh_rate_ms: u32) -> Self {
        Self {
            refresh_rate_ms,
            last_accepted: None,
        }
    }

    pub fn set_refresh_rate_ms(&mut self, refresh_rate_ms: u32) {
        self.refresh_rate_ms = refresh_rate_ms;
    }

    /// Returns `true` (and records `now`) iff enough time has elapsed since
    /// the last accepted `Proc` frame.
    pub fn admit(&mut self, now: Instant) -> bool {
        let admit = match self.last_accepted {
            None => true,
            Some(last) => now.duration_since(last) >= Duration::from_millis(u64::from(self.refresh_rate_ms)),
        };
        if admit {
            self.last_accepted = Some(now);
        }
        admit
    }
}

/// The SWT byte-level state machine. One instance per link; `feed` is
/// called once per inbound byte.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
    fragments: FragmentStore,
    prev_byte: u8,
    current: Option<CurrentFrame>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ContentWait,
            fragments: FragmentStore::default(),
            prev_byte: 0,
            current: None,
        }
    }

    /// Resets to `ContentWait`, dropping any in-progress fragment. Used
    /// when the scheduler re-initializes the link.
    pub fn reset(&mut self) {
        self.state = DecoderState::ContentWait;
        if let Some(cur) = self.current.take() {
            self.fragments.clear(cur.content_id);
        }
        self.prev_byte = 0;
    }

    /// Feeds one inbound byte through the state machine.
    pub fn feed(&mut self, byte: u8, rate_filter: &mut ProcRateFilter, now: Instant) -> DecodeOutcome {
        let prev = self.prev_byte;
        self.prev_byte = byte;

        match self.state {
            DecoderState::ContentWait => self.content_wait(byte, prev, rate_filter, now),
            DecoderState::DataReceive => self.data_receive(byte),
        }
    }

    fn content_wait(
        &mut self,
        byte: u8,
        prev: u8,
        rate_filter: &mut ProcRateFilter,
        now: Instant,
    ) -> DecodeOutcome {
        if byte == ContentClass::None as u8 {
            return DecodeOutcome::ContentNone;
        }

        let Ok(cc) = ContentClass::try_from(byte) else {
            // Any other byte while waiting for content is ignored.
            return DecodeOutcome::Idle;
        };

        let unsolicited = prev == wire::FLOW_TARGET_TO_SCHED;
        let ignore = cc == ContentClass::Proc && !rate_filter.admit(now);

        self.fragments.begin(cc);
        self.current = Some(CurrentFrame {
            content_id: cc,
            unsolicited,
            ignore,
        });
        self.state = DecoderState::DataReceive;
        DecodeOutcome::Idle
    }

    fn data_receive(&mut self, byte: u8) -> DecodeOutcome {
        if byte == wire::ID_CONTENT_CUT {
            self.drop_current();
            self.state = DecoderState::ContentWait;
            return DecodeOutcome::Idle;
        }

        if byte == wire::ID_CONTENT_END {
            let outcome = self.finish_current();
            self.state = DecoderState::ContentWait;
            return outcome;
        }

        if byte == 0x00 {
            return DecodeOutcome::Idle;
        }

        if wire::is_payload_byte(byte) {
            if let Some(cur) = &self.current {
                if !cur.ignore {
                    self.fragments.append(cur.content_id, byte);
                }
            }
            return DecodeOutcome::Idle;
        }

        self.drop_current();
        self.state = DecoderState::ContentWait;
        DecodeOutcome::ProtocolError
    }

    fn finish_current(&mut self) -> DecodeOutcome {
        let Some(cur) = self.current.take() else {
            return DecodeOutcome::Idle;
        };
        if cur.ignore {
            self.fragments.clear(cur.content_id);
            return DecodeOutcome::Idle;
        }
        let payload = self.fragments.take(cur.content_id);
        DecodeOutcome::Frame(Frame {
            content_id: cur.content_id,
            payload,
            unsolicited: cur.unsolicited,
        })
    }

    fn drop_current(&mut self) {
        if let Some(cur) = self.current.take() {
            self.fragments.clear(cur.content_id);
        }
    }
}
