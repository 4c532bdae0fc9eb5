//! Priority command queue and response list.
//!
//! Two independent `Mutex`-guarded collections, never locked together,
//! matching spec.md §5's concurrency rule. Grounded on the
//! `Arc<Mutex<VecDeque<_>>>` shape of minidsp's `Multiplexer`
//! (`examples/other_examples/1c4fb28c_mrene-minidsp-rs__minidsp-src-transport-multiplexer.rs.rs`),
//! adapted from a single FIFO to three priority FIFOs plus a separate
//! response list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::{LOW_PRIO_GATE_CYCLES, QUEUE_DEPTH_MAX, RESPONSE_RETENTION};

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Command priority. `SysHigh` is never populated by
/// [`CommandQueue::enqueue`] in this crate (the handshake writes its
/// frame directly, bypassing the queue entirely) — see SPEC_FULL.md's
/// Design Note resolution #2: kept as a distinct, currently-untenanted
/// tier rather than folded away, matching the original's unused
/// `PrioSysHigh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    SysHigh,
    User,
    SysLow,
}

/// A queued command awaiting transmission.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub id: u32,
    pub priority: Priority,
    pub text: String,
    pub enqueued_at: Instant,
}

/// A completed (or abandoned) command's outcome.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub id: u32,
    pub text: Option<String>,
    completed_at: Instant,
}

impl CommandResponse {
    fn ok(id: u32, text: String, now: Instant) -> Self {
        Self {
            id,
            text: Some(text),
            completed_at: now,
        }
    }

    fn abandoned(id: u32, now: Instant) -> Self {
        Self {
            id,
            text: None,
            completed_at: now,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.completed_at) >= RESPONSE_RETENTION
    }
}

/// The single command currently in flight on the wire, if any.
#[derive(Debug, Clone)]
struct InFlight {
    id: u32,
    attempts: u8,
}

#[derive(Debug, Default)]
struct Fifos {
    sys_high: VecDeque<CommandRequest>,
    user: VecDeque<CommandRequest>,
    sys_low: VecDeque<CommandRequest>,
}

impl Fifos {
    fn queue_for(&mut self, priority: Priority) -> &mut VecDeque<CommandRequest> {
        match priority {
            Priority::SysHigh => &mut self.sys_high,
            Priority::User => &mut self.user,
            Priority::SysLow => &mut self.sys_low,
        }
    }
}

/// Thread-safe priority command queue and response list.
///
/// At most one command is ever in flight. `take_next` enforces both
/// priority order (`SysHigh` > `User` > `SysLow`) and the low-priority
/// gate: after a `SysLow` command is issued, the next
/// [`crate::config::LOW_PRIO_GATE_CYCLES`] calls to `take_next` will not
/// return another `SysLow` command even if one is queued, so a burst of
/// background commands cannot starve user-issued ones.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    fifos: Arc<Mutex<Fifos>>,
    responses: Arc<Mutex<Vec<CommandResponse>>>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    low_prio_gate: Arc<Mutex<u8>>,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            fifos: Arc::new(Mutex::new(Fifos::default())),
            responses: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new(None)),
            low_prio_gate: Arc::new(Mutex::new(0)),
        }
    }

    /// Enqueues a command, returning its id. Fails if the target priority's
    /// own FIFO, or the response list, is already at [`QUEUE_DEPTH_MAX`].
    pub fn enqueue(&self, priority: Priority, text: impl Into<String>) -> Option<u32> {
        if self.responses.lock().unwrap().len() >= QUEUE_DEPTH_MAX {
            return None;
        }
        let mut fifos = self.fifos.lock().unwrap();
        if fifos.queue_for(priority).len() >= QUEUE_DEPTH_MAX {
            return None;
        }
        let id = next_id();
        fifos.queue_for(priority).push_back(CommandRequest {
            id,
            priority,
            text: text.into(),
            enqueued_at: Instant::now(),
        });
        Some(id)
    }

    /// Pops the next command to send, observing priority order and the
    /// low-priority gate. Returns `None` if nothing is eligible, or if a
    /// command is already in flight.
    pub fn take_next(&self) -> Option<CommandRequest> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.is_some() {
            return None;
        }

        let mut fifos = self.fifos.lock().unwrap();
        let mut gate = self.low_prio_gate.lock().unwrap();

        let req = if let Some(req) = fifos.sys_high.pop_front() {
            Some(req)
        } else if let Some(req) = fifos.user.pop_front() {
            Some(req)
        } else if *gate == 0 {
            fifos.sys_low.pop_front()
        } else {
            None
        };

        let req = req?;
        if req.priority == Priority::SysLow {
            *gate = LOW_PRIO_GATE_CYCLES;
        }
        *in_flight = Some(InFlight {
            id: req.id,
            attempts: 1,
        });
        Some(req)
    }

    /// Advances the low-priority gate counter by one poll cycle. Called
    /// once per scheduler tick regardless of whether a command was sent.
    pub fn tick_gate(&self) {
        let mut gate = self.low_prio_gate.lock().unwrap();
        if *gate > 0 {
            *gate -= 1;
        }
    }

    /// True iff the in-flight command's re-request budget has not yet
    /// been exhausted; increments the attempt counter as a side effect.
    pub fn reattempt_in_flight(&self) -> bool {
        let mut in_flight = self.in_flight.lock().unwrap();
        match in_flight.as_mut() {
            Some(f) if f.attempts < crate::config::REREQUEST_BUDGET => {
                f.attempts += 1;
                true
            }
            _ => false,
        }
    }

    /// Completes the in-flight command with a response, moving it to the
    /// response list.
    pub fn complete_in_flight(&self, text: String, now: Instant) -> Option<u32> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let f = in_flight.take()?;
        self.responses
            .lock()
            .unwrap()
            .push(CommandResponse::ok(f.id, text, now));
        Some(f.id)
    }

    /// Abandons the in-flight command (re-request budget exhausted or
    /// link went offline), recording a response with no text.
    pub fn abandon_in_flight(&self, now: Instant) -> Option<u32> {
        let mut in_flight = self.in_flight.lock().unwrap();
        let f = in_flight.take()?;
        self.responses
            .lock()
            .unwrap()
            .push(CommandResponse::abandoned(f.id, now));
        Some(f.id)
    }

    /// True iff a command is currently in flight.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.lock().unwrap().is_some()
    }

    /// Takes and removes the response for `id`, if present.
    pub fn response_take(&self, id: u32) -> Option<CommandResponse> {
        let mut responses = self.responses.lock().unwrap();
        let idx = responses.iter().position(|r| r.id == id)?;
        Some(responses.remove(idx))
    }

    /// Drops responses older than [`RESPONSE_RETENTION`] that were never
    /// collected by the caller.
    pub fn expire_responses(&self, now: Instant) {
        self.responses.lock().unwrap().retain(|r| !r.is_expired(now));
    }

    /// Clears all three priority FIFOs, the response list, the in-flight
    /// slot, and the low-priority gate. Called once a fresh handshake
    /// succeeds, matching spec.md §4.4's `TargetInitDoneWait` transition
    /// ("mark target online, clear queues, clear in-flight").
    pub fn reset(&self) {
        let mut fifos = self.fifos.lock().unwrap();
        fifos.sys_high.clear();
        fifos.user.clear();
        fifos.sys_low.clear();
        drop(fifos);
        self.responses.lock().unwrap().clear();
        *self.in_flight.lock().unwrap() = None;
        *self.low_prio_gate.lock().unwrap() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn priority_order_is_respected() {
        let q = CommandQueue::new();
        q.enqueue(Priority::SysLow, "low");
        q.enqueue(Priority::User, "user");
        q.enqueue(Priority::SysHigh, "high");

        let next = q.take_next().unwrap();
        assert_eq!(next.text, "high");
        q.abandon_in_flight(Instant::now());

        let next = q.take_next().unwrap();
        assert_eq!(next.text, "user");
    }

    #[test]
    fn at_most_one_in_flight() {
        let q = CommandQueue::new();
        q.enqueue(Priority::User, "a");
        q.enqueue(Priority::User, "b");

        assert!(q.take_next().is_some());
        assert!(q.take_next().is_none());
    }

    #[test]
    fn low_prio_gate_skips_cycles_after_syslow_issuance() {
        let q = CommandQueue::new();
        q.enqueue(Priority::SysLow, "bg1");
        q.enqueue(Priority::SysLow, "bg2");

        let first = q.take_next().unwrap();
        assert_eq!(first.text, "bg1");
        q.abandon_in_flight(Instant::now());

        for _ in 0..LOW_PRIO_GATE_CYCLES {
            assert!(q.take_next().is_none());
            q.tick_gate();
        }

        let second = q.take_next().unwrap();
        assert_eq!(second.text, "bg2");
    }

    #[test]
    fn queue_depth_is_bounded() {
        let q = CommandQueue::new();
        for i in 0..QUEUE_DEPTH_MAX {
            assert!(q.enqueue(Priority::User, format!("cmd{i}")).is_some());
        }
        assert!(q.enqueue(Priority::User, "overflow").is_none());
    }

    #[test]
    fn response_round_trips_and_expires() {
        let q = CommandQueue::new();
        let id = q.enqueue(Priority::User, "ping").unwrap();
        q.take_next().unwrap();

        let now = Instant::now();
        q.complete_in_flight("pong".to_string(), now);

        let resp = q.response_take(id).unwrap();
        assert_eq!(resp.text.as_deref(), Some("pong"));
        assert!(q.response_take(id).is_none());

        let id2 = q.enqueue(Priority::User, "ping2").unwrap();
        q.take_next().unwrap();
        q.complete_in_flight("pong2".to_string(), now);
        q.expire_responses(now + RESPONSE_RETENTION + Duration::from_millis(1));
        assert!(q.response_take(id2).is_none());
    }

    #[test]
    fn reattempt_budget_is_exhausted_after_four_tries() {
        let q = CommandQueue::new();
        q.enqueue(Priority::User, "cmd");
        q.take_next().unwrap();

        // One attempt already counted by take_next; three more allowed.
        assert!(q.reattempt_in_flight());
        assert!(q.reattempt_in_flight());
        assert!(q.reattempt_in_flight());
        assert!(!q.reattempt_in_flight());
    }

    #[test]
    fn enqueued_at_is_recorded_at_enqueue_time() {
        let q = CommandQueue::new();
        let before = Instant::now();
        q.enqueue(Priority::User, "cmd");
        let after = Instant::now();

        let req = q.take_next().unwrap();
        assert!(req.enqueued_at >= before && req.enqueued_at <= after);
    }
}
