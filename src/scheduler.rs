//! The outer cooperative state machine: owns the link, decoder, and
//! command queue, and is driven by repeated calls to [`Scheduler::tick`]
//! from a single dedicated thread.
//!
//! State names and transitions are grounded on
//! `examples/original_source/src/SingleWireScheduling.cpp`'s top-level
//! switch (`Start`, `UartInit`, `DevUartInit`, `TargetInit`,
//! `TargetInitDoneWait`, `Main`, `DataRequest`, `TargetRespWait`,
//! `CtrlManual`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{Config, RESPONSE_WINDOW};
use crate::decoder::{DecodeOutcome, FrameDecoder, ProcRateFilter};
use crate::link::Link;
use crate::queue::{CommandQueue, Priority};
use crate::sink::ContentSink;
use crate::telemetry::Telemetry;
use crate::wire::{encode, ContentClass};

const OFFLINE_NOTICE: &str = "\r\n[Target is offline]\r\n";
const HANDSHAKE_ACK: &str = "Debug mode 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    UartInit,
    DevUartInit,
    TargetInit,
    TargetInitDoneWait,
    Main,
    DataRequest,
    TargetRespWait,
    CtrlManual,
}

/// What a single [`Scheduler::tick`] call did, mainly useful to tests and
/// to the engine's idle-backoff loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// State unchanged, no frame processed.
    Idle,
    /// A frame was decoded and handed to the sink.
    FrameDistributed,
    /// The outer state changed.
    Transitioned,
    /// A non-blocking read or write failed.
    LinkError,
}

/// Shared flags and latches readable from [`crate::engine::EngineHandle`]
/// without touching the scheduler itself.
#[derive(Debug, Clone)]
pub(crate) struct SharedStatus {
    pub link_online: Arc<AtomicBool>,
    pub target_online: Arc<AtomicBool>,
    pub proc_changed: Arc<AtomicBool>,
    pub proc_snapshot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl SharedStatus {
    pub(crate) fn new() -> Self {
        Self {
            link_online: Arc::new(AtomicBool::new(false)),
            target_online: Arc::new(AtomicBool::new(false)),
            proc_changed: Arc::new(AtomicBool::new(false)),
            proc_snapshot: Arc::new(Mutex::new(None)),
        }
    }
}

pub struct Scheduler<L: Link> {
    link: L,
    decoder: FrameDecoder,
    rate_filter: ProcRateFilter,
    queue: CommandQueue,
    sink: Arc<dyn ContentSink>,
    config: Config,
    telemetry: Telemetry,
    status: SharedStatus,

    state: State,
    deadline: Option<Instant>,
    last_proc_payload: Option<Vec<u8>>,
    read_buf: [u8; 256],
}

impl<L: Link> Scheduler<L> {
    pub fn new(
        link: L,
        config: Config,
        queue: CommandQueue,
        sink: Arc<dyn ContentSink>,
        telemetry: Telemetry,
    ) -> Self {
        let rate_filter = ProcRateFilter::new(config.refresh_rate_ms());
        Self {
            link,
            decoder: FrameDecoder::new(),
            rate_filter,
            queue,
            sink,
            config,
            telemetry,
            status: SharedStatus::new(),
            state: State::Start,
            deadline: None,
            last_proc_payload: None,
            read_buf: [0u8; 256],
        }
    }

    pub(crate) fn shared_status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Updates the process-tree rate limit in place, e.g. from a live
    /// config change.
    pub fn set_refresh_rate_ms(&mut self, refresh_rate_ms: u32) {
        self.rate_filter.set_refresh_rate_ms(refresh_rate_ms);
    }

    /// Runs one cooperative slice of work: at most one read, one write,
    /// and one state transition. Never blocks.
    pub fn tick(&mut self) -> TickOutcome {
        self.tick_at(Instant::now())
    }

    /// As [`Scheduler::tick`], but with an explicit clock — used by tests
    /// so deadline arithmetic is deterministic.
    pub fn tick_at(&mut self, now: Instant) -> TickOutcome {
        let state_before = self.state;
        let mut outcome = self.drain_inbound(now);

        if self.state != state_before {
            // Distributing an inbound frame already produced this tick's
            // state transition (e.g. a handshake ack resolving
            // `TargetInitDoneWait`, or a reply resolving `TargetRespWait`).
            // Don't also run the new state's own step this tick — spec.md
            // §5: "one invocation does at most one state transition ...
            // then yields."
            return outcome;
        }

        let transitioned = match self.state {
            State::Start => self.tick_start(),
            State::UartInit => self.tick_uart_init(now),
            State::DevUartInit => self.tick_dev_uart_init(),
            State::TargetInit => self.tick_target_init(now),
            State::TargetInitDoneWait => self.tick_target_init_done_wait(now),
            State::Main => self.tick_main(now),
            State::DataRequest => self.tick_data_request(now),
            State::TargetRespWait => self.tick_target_resp_wait(now),
            State::CtrlManual => self.tick_ctrl_manual(),
        };

        if transitioned && outcome == TickOutcome::Idle {
            outcome = TickOutcome::Transitioned;
        }
        outcome
    }

    /// Transitions to `state`, additionally marking the target offline
    /// first if `state` is `UartInit` or `TargetInit` — spec.md §8's
    /// invariant is that `target_online` is true "iff ... no subsequent
    /// `TargetInit` transition has occurred", which in practice covers
    /// both the direct `TargetRespWait` timeout path and a link I/O
    /// failure that restarts from `UartInit`. `mark_target_offline` is a
    /// no-op once `target_online` is already false, so this is safe to
    /// call on every restart regardless of which caller triggered it.
    fn enter(&mut self, state: State) {
        debug!("scheduler: {:?} -> {:?}", self.state, state);
        if matches!(state, State::UartInit | State::TargetInit) {
            self.mark_target_offline();
        }
        self.state = state;
    }

    fn drain_inbound(&mut self, now: Instant) -> TickOutcome {
        let n = match self.link.read(&mut self.read_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("link read failed: {e}");
                self.status.link_online.store(false, Ordering::Relaxed);
                self.enter(State::UartInit);
                return TickOutcome::LinkError;
            }
        };
        if n == 0 {
            return TickOutcome::Idle;
        }
        self.status.link_online.store(true, Ordering::Relaxed);
        self.telemetry.add_bytes_received(n as u64);

        let mut outcome = TickOutcome::Idle;
        for i in 0..n {
            let byte = self.read_buf[i];
            match self.decoder.feed(byte, &mut self.rate_filter, now) {
                DecodeOutcome::Idle => {}
                DecodeOutcome::ContentNone => {
                    self.telemetry.inc_content_none();
                    self.on_none_received(now);
                    outcome = TickOutcome::FrameDistributed;
                }
                DecodeOutcome::Frame(frame) => {
                    self.telemetry.inc_frames_distributed();
                    self.distribute(frame, now);
                    outcome = TickOutcome::FrameDistributed;
                }
                DecodeOutcome::ProtocolError => {
                    self.telemetry.inc_protocol_errors();
                    warn!("protocol error decoding inbound stream");
                }
            }
        }
        outcome
    }

    fn distribute(&mut self, frame: crate::wire::Frame, now: Instant) {
        // During the handshake wait, only a `Cmd` frame is meaningful (it
        // may be the handshake ack, checked in `on_cmd_response`); any other
        // content class is discarded rather than distributed, per spec.md
        // §4.4 `TargetInitDoneWait`'s "any other frame is discarded" and
        // §3's snapshot lifecycle ("created ... after target online").
        if self.state == State::TargetInitDoneWait && frame.content_id != ContentClass::Cmd {
            return;
        }
        match frame.content_id {
            ContentClass::Proc => {
                let changed = self.last_proc_payload.as_deref() != Some(frame.payload.as_slice());
                if changed {
                    self.status.proc_changed.store(true, Ordering::Relaxed);
                }
                self.last_proc_payload = Some(frame.payload.clone());
                *self.status.proc_snapshot.lock().unwrap() = Some(frame.payload.clone());
                self.sink.proc_snapshot(&frame.payload);
                self.resolve_wait(Some(frame.content_id), now);
            }
            ContentClass::Log => {
                if let Ok(text) = String::from_utf8(frame.payload.clone()) {
                    self.sink.log(&text);
                }
                self.resolve_wait(Some(frame.content_id), now);
            }
            ContentClass::Cmd => {
                if let Ok(text) = String::from_utf8(frame.payload.clone()) {
                    self.on_cmd_response(text, now);
                } else {
                    self.resolve_wait(Some(frame.content_id), now);
                }
            }
            ContentClass::None => unreachable!("None frames never reach distribute"),
        }
    }

    fn on_none_received(&mut self, now: Instant) {
        self.resolve_wait(None, now);
    }

    fn on_cmd_response(&mut self, text: String, now: Instant) {
        if self.state == State::TargetInitDoneWait {
            if text == HANDSHAKE_ACK {
                info!("target handshake acknowledged");
                self.queue.reset();
                self.status.target_online.store(true, Ordering::Relaxed);
                self.enter(State::Main);
            }
            // Any other frame during the handshake wait is discarded; the
            // response window keeps counting down toward a re-request.
            return;
        }
        self.mark_target_online();
        if self.queue.has_in_flight() {
            self.queue.complete_in_flight(text, now);
            self.resolve_wait(Some(ContentClass::Cmd), now);
        } else {
            // Unsolicited command-channel output; treat as log-like.
            self.sink.log(&text);
        }
    }

    /// Leaves `TargetRespWait` for `Main` once a matching reply has
    /// arrived. If a command is in flight and the frame doesn't match
    /// (anything but `Cmd`), this counts against the command's re-request
    /// budget and sends another poll immediately, without waiting out the
    /// rest of the response window.
    fn resolve_wait(&mut self, received: Option<ContentClass>, now: Instant) {
        if self.state != State::TargetRespWait {
            return;
        }
        let waiting_on_command = self.queue.has_in_flight();
        match received {
            Some(ContentClass::Cmd) => {
                self.deadline = None;
                self.enter(State::Main);
            }
            _ if !waiting_on_command => {
                self.deadline = None;
                self.enter(State::Main);
            }
            _ => self.reattempt_or_abandon_command(now),
        }
    }

    /// Shared by an immediate frame mismatch and (not used for the blanket
    /// silence timeout, which re-inits instead) re-request bookkeeping:
    /// resend the poll if the in-flight command's budget allows it,
    /// otherwise abandon it and return to `Main`.
    fn reattempt_or_abandon_command(&mut self, now: Instant) {
        if self.queue.reattempt_in_flight() {
            let poll = encode::poll();
            if let Err(e) = self.link.write_all(&poll) {
                warn!("re-request poll failed: {e}");
                self.queue.abandon_in_flight(now);
                self.telemetry.inc_commands_abandoned();
                self.status.link_online.store(false, Ordering::Relaxed);
                self.enter(State::UartInit);
                return;
            }
            self.telemetry.inc_re_requests();
            self.deadline = Some(now + RESPONSE_WINDOW);
        } else {
            self.queue.abandon_in_flight(now);
            self.telemetry.inc_commands_abandoned();
            self.deadline = None;
            self.enter(State::Main);
        }
    }

    fn mark_target_online(&mut self) {
        if !self.status.target_online.swap(true, Ordering::Relaxed) {
            info!("target online");
        }
    }

    /// On the online->offline transition, appends the offline sentinel to
    /// the held process-tree snapshot (not the log) exactly once, per
    /// spec.md §3/§4.4's snapshot lifecycle — the next accepted `Proc`
    /// payload replaces the snapshot wholly and implicitly clears it.
    fn mark_target_offline(&mut self) {
        if self.status.target_online.swap(false, Ordering::Relaxed) {
            warn!("target offline");
            let mut snapshot = self.last_proc_payload.take().unwrap_or_default();
            snapshot.extend_from_slice(OFFLINE_NOTICE.as_bytes());
            self.last_proc_payload = Some(snapshot.clone());
            *self.status.proc_snapshot.lock().unwrap() = Some(snapshot.clone());
            self.status.proc_changed.store(true, Ordering::Relaxed);
            self.sink.proc_snapshot(&snapshot);
        }
    }

    fn tick_start(&mut self) -> bool {
        self.enter(State::UartInit);
        true
    }

    fn tick_uart_init(&mut self, now: Instant) -> bool {
        self.decoder.reset();
        if self.queue.abandon_in_flight(now).is_some() {
            self.telemetry.inc_commands_abandoned();
        }
        self.enter(State::DevUartInit);
        true
    }

    fn tick_dev_uart_init(&mut self) -> bool {
        // The link is already open (opened by the builder before the
        // scheduler was constructed); this state's job is to confirm
        // it's readable before committing to the handshake.
        match self.link.read(&mut [0u8; 0]) {
            Ok(_) => {
                self.status.link_online.store(true, Ordering::Relaxed);
                self.enter(State::TargetInit);
                true
            }
            Err(e) => {
                warn!("link not ready: {e}");
                false
            }
        }
    }

    fn tick_target_init(&mut self, now: Instant) -> bool {
        if self.config.manual_control() {
            self.enter(State::CtrlManual);
            return true;
        }
        let frame = encode::cmd_frame(self.config.init_code());
        if let Err(e) = self.link.write_all(&frame) {
            warn!("handshake write failed: {e}");
            self.status.link_online.store(false, Ordering::Relaxed);
            self.enter(State::UartInit);
            return true;
        }
        self.deadline = Some(now + RESPONSE_WINDOW);
        self.enter(State::TargetInitDoneWait);
        true
    }

    fn tick_target_init_done_wait(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            self.enter(State::TargetInit);
            return true;
        };
        if now < deadline {
            return false;
        }
        // No budget here: the target may simply not have powered on yet,
        // so the handshake is retried indefinitely until it answers.
        self.telemetry.inc_re_requests();
        self.enter(State::TargetInit);
        true
    }

    fn tick_main(&mut self, now: Instant) -> bool {
        if self.config.manual_control() {
            self.enter(State::CtrlManual);
            return true;
        }
        self.queue.expire_responses(now);
        self.queue.tick_gate();
        self.enter(State::DataRequest);
        true
    }

    fn tick_data_request(&mut self, now: Instant) -> bool {
        if let Some(req) = self.queue.take_next() {
            let frame = encode::cmd_frame(&req.text);
            if let Err(e) = self.link.write_all(&frame) {
                warn!("command write failed: {e}");
                self.queue.abandon_in_flight(now);
                self.telemetry.inc_commands_abandoned();
                self.status.link_online.store(false, Ordering::Relaxed);
                self.enter(State::UartInit);
                return true;
            }
            self.deadline = Some(now + RESPONSE_WINDOW);
            self.enter(State::TargetRespWait);
            return true;
        }

        if self.config.monitoring() {
            let poll = encode::poll();
            if let Err(e) = self.link.write_all(&poll) {
                warn!("poll write failed: {e}");
                self.status.link_online.store(false, Ordering::Relaxed);
                self.enter(State::UartInit);
                return true;
            }
            self.deadline = Some(now + RESPONSE_WINDOW);
            self.enter(State::TargetRespWait);
            return true;
        }

        // Nothing to send and monitoring disabled: stay fully idle.
        self.enter(State::Main);
        true
    }

    fn tick_target_resp_wait(&mut self, now: Instant) -> bool {
        let Some(deadline) = self.deadline else {
            self.enter(State::Main);
            return true;
        };
        if now < deadline {
            return false;
        }

        // The full response window elapsed with no frame at all (not even
        // a mismatched one) — the link itself is presumed dead and the
        // scheduler re-initializes the target from scratch, matching
        // spec.md §4.4's blanket "On timeout (330 ms) -> TargetInit."
        // Per-frame mismatches are handled immediately in `resolve_wait`
        // and never reach this branch.
        if self.queue.abandon_in_flight(now).is_some() {
            self.telemetry.inc_commands_abandoned();
        }
        self.deadline = None;
        self.enter(State::TargetInit);
        true
    }

    fn tick_ctrl_manual(&mut self) -> bool {
        if !self.config.manual_control() {
            self.enter(State::Main);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::link::LoopbackLink;
    use crate::sink::ChannelSink;
    use std::sync::Arc;
    use std::time::Duration;

    fn new_scheduler(config: Config) -> (Scheduler<LoopbackLink>, Arc<crate::sink::ChannelSinkReceiver>) {
        let (sink, rx) = ChannelSink::new();
        let scheduler = Scheduler::new(
            LoopbackLink::new(),
            config,
            CommandQueue::new(),
            Arc::new(sink),
            Telemetry::new(),
        );
        (scheduler, Arc::new(rx))
    }

    #[test]
    fn boots_through_init_states_to_main_on_handshake_ack() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let status = scheduler.shared_status();
        let now = Instant::now();

        // Start -> UartInit -> DevUartInit -> TargetInit -> TargetInitDoneWait
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::TargetInitDoneWait);

        // Target replies with the literal handshake acknowledgement.
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);

        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);
        assert!(status.target_online.load(Ordering::Relaxed));
    }

    #[test]
    fn non_matching_cmd_frame_during_handshake_is_discarded() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let status = scheduler.shared_status();
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::TargetInitDoneWait);

        // An echo of the init command itself is not the handshake ack.
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(crate::config::DEFAULT_INIT_CODE.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);

        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::TargetInitDoneWait);
        assert!(!status.target_online.load(Ordering::Relaxed));

        // The real ack still completes the handshake afterward.
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);
        assert!(status.target_online.load(Ordering::Relaxed));
    }

    #[test]
    fn handshake_timeout_reissues_target_init_indefinitely() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let status = scheduler.shared_status();
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::TargetInitDoneWait);

        let mut now = now;
        // With the target silent forever, the handshake keeps retrying
        // (TargetInit -> TargetInitDoneWait -> timeout -> TargetInit ...)
        // rather than ever giving up; run many cycles and confirm it never
        // reaches Main nor marks the target online.
        for _ in 0..20 {
            now += RESPONSE_WINDOW + Duration::from_millis(1);
            scheduler.tick_at(now);
            scheduler.tick_at(now);
            assert_ne!(scheduler.state, State::Main);
        }
        assert!(!status.target_online.load(Ordering::Relaxed));

        // The target finally answers; the very next tick reads the reply
        // and completes the handshake in one step.
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);
        assert!(status.target_online.load(Ordering::Relaxed));
    }

    #[test]
    fn command_mismatch_reattempts_without_waiting_for_full_timeout_then_abandons() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);

        let id = scheduler.queue.enqueue(Priority::User, "q").unwrap();
        scheduler.tick_at(now); // Main -> DataRequest
        scheduler.tick_at(now); // DataRequest sends the command -> TargetRespWait
        assert_eq!(scheduler.state, State::TargetRespWait);

        // Four Log frames in a row, none of them the Cmd reply, none of
        // them waiting out the 330ms window individually.
        for _ in 0..4 {
            let log_frame = [ContentClass::Log as u8, b'x', 0x17];
            scheduler.link.push_inbound(&log_frame);
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::Main);
        assert_eq!(scheduler.queue.response_take(id).map(|r| r.text), Some(None));
    }

    #[test]
    fn manual_control_parks_in_ctrl_manual_before_any_handshake() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback").with_manual_control(true));
        let now = Instant::now();
        // Start -> UartInit -> DevUartInit -> TargetInit -> CtrlManual.
        // With manual_control set from the start, TargetInit never writes
        // the handshake frame at all.
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::CtrlManual);
        assert!(scheduler.link.outbound.is_empty());
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::CtrlManual);

        // Clearing the flag releases it back into the normal handshake path.
        scheduler.config.set_manual_control(false);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::TargetInit);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::TargetInitDoneWait);

        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);

        // Re-engaging manual_control from Main parks it again.
        scheduler.config.set_manual_control(true);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::CtrlManual);
    }

    #[test]
    fn monitoring_disabled_and_empty_queue_stays_idle_in_main() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback").with_monitoring(false));
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        let mut frame = vec![ContentClass::Cmd as u8];
        frame.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        frame.push(0x17);
        scheduler.link.push_inbound(&frame);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);

        let outbound_at_main = scheduler.link.outbound.len();
        scheduler.tick_at(now);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);
        assert_eq!(scheduler.link.outbound.len(), outbound_at_main);
    }

    #[test]
    fn target_offline_appends_sentinel_to_snapshot_not_log() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let status = scheduler.shared_status();
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        let mut ack = vec![ContentClass::Cmd as u8];
        ack.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        ack.push(0x17);
        scheduler.link.push_inbound(&ack);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);

        let mut proc_frame = vec![ContentClass::Proc as u8];
        proc_frame.extend_from_slice(b"S");
        proc_frame.push(0x17);
        scheduler.link.push_inbound(&proc_frame);
        scheduler.tick_at(now);
        assert!(status.proc_changed.swap(false, Ordering::Relaxed));
        assert_eq!(
            status.proc_snapshot.lock().unwrap().as_deref(),
            Some(b"S".as_slice())
        );

        // Drive the scheduler into Main -> DataRequest -> TargetRespWait,
        // then let the response window elapse with total silence.
        let mut now = now;
        scheduler.tick_at(now); // Main -> DataRequest
        scheduler.tick_at(now); // DataRequest -> TargetRespWait
        assert_eq!(scheduler.state, State::TargetRespWait);
        now += RESPONSE_WINDOW + Duration::from_millis(1);
        scheduler.tick_at(now);

        assert!(!status.target_online.load(Ordering::Relaxed));
        assert!(status.proc_changed.swap(false, Ordering::Relaxed));
        let expected = b"S\r\n[Target is offline]\r\n".to_vec();
        assert_eq!(status.proc_snapshot.lock().unwrap().as_deref(), Some(expected.as_slice()));

        // A fresh Proc payload after reconnecting replaces the snapshot
        // wholly, clearing the suffix. Send the handshake ack only after
        // the scheduler has actually issued its own handshake command,
        // same ordering the other handshake tests rely on.
        assert_eq!(scheduler.state, State::TargetInit);
        scheduler.tick_at(now); // TargetInit -> TargetInitDoneWait, sends handshake
        assert_eq!(scheduler.state, State::TargetInitDoneWait);
        let mut ack = vec![ContentClass::Cmd as u8];
        ack.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        ack.push(0x17);
        scheduler.link.push_inbound(&ack);
        scheduler.tick_at(now); // reads ack -> Main
        assert_eq!(scheduler.state, State::Main);

        // Past the default 500ms rate-filter window since the first
        // accepted Proc, so the next one is admitted rather than throttled.
        now += Duration::from_millis(500);
        let mut proc_frame = vec![ContentClass::Proc as u8];
        proc_frame.extend_from_slice(b"S2");
        proc_frame.push(0x17);
        scheduler.link.push_inbound(&proc_frame);
        scheduler.tick_at(now);
        assert_eq!(
            status.proc_snapshot.lock().unwrap().as_deref(),
            Some(b"S2".as_slice())
        );
    }

    #[test]
    fn main_expires_stale_responses_so_queue_full_recovers() {
        let (mut scheduler, _rx) = new_scheduler(Config::new("loopback"));
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        let mut ack = vec![ContentClass::Cmd as u8];
        ack.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        ack.push(0x17);
        scheduler.link.push_inbound(&ack);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);

        // Fill the response list to capacity with completed-but-unread
        // responses, all timestamped `now`.
        for i in 0..crate::config::QUEUE_DEPTH_MAX {
            let id = scheduler.queue.enqueue(Priority::User, format!("cmd{i}")).unwrap();
            scheduler.queue.take_next().unwrap();
            scheduler.queue.complete_in_flight(format!("resp{i}"), now);
            let _ = id;
        }
        assert!(scheduler.queue.enqueue(Priority::User, "overflow").is_none());

        // Once the response retention window has elapsed, the next `Main`
        // tick must evict them, matching spec.md §4.4 ("Expire stale
        // responses") and §7's `DequeueTimeout` policy -- otherwise unread
        // responses would block `command_send` forever.
        let later = now + crate::config::RESPONSE_RETENTION + Duration::from_millis(1);
        scheduler.tick_at(later); // Main -> DataRequest, expiring responses first
        assert!(scheduler.queue.enqueue(Priority::User, "fits-now").is_some());
    }

    #[test]
    fn proc_and_log_frames_are_discarded_before_handshake_completes() {
        let (mut scheduler, rx) = new_scheduler(Config::new("loopback"));
        let status = scheduler.shared_status();
        let now = Instant::now();
        for _ in 0..4 {
            scheduler.tick_at(now);
        }
        assert_eq!(scheduler.state, State::TargetInitDoneWait);

        // A Proc/Log frame arriving before the handshake ack must not
        // populate the snapshot, latch `proc_changed`, or reach the sink --
        // spec.md §4.4 "any other frame is discarded" and §3's snapshot
        // lifecycle ("created on first Proc frame after target online").
        let mut proc_frame = vec![ContentClass::Proc as u8];
        proc_frame.extend_from_slice(b"premature");
        proc_frame.push(0x17);
        scheduler.link.push_inbound(&proc_frame);
        scheduler.tick_at(now);

        let mut log_frame = vec![ContentClass::Log as u8];
        log_frame.extend_from_slice(b"too-early");
        log_frame.push(0x17);
        scheduler.link.push_inbound(&log_frame);
        scheduler.tick_at(now);

        assert_eq!(scheduler.state, State::TargetInitDoneWait);
        assert!(!status.proc_changed.load(Ordering::Relaxed));
        assert!(status.proc_snapshot.lock().unwrap().is_none());
        assert!(rx.latest_proc().is_none());
        assert!(rx.drain_logs().next().is_none());

        // The real handshake ack still completes normally afterward.
        let mut ack = vec![ContentClass::Cmd as u8];
        ack.extend_from_slice(HANDSHAKE_ACK.as_bytes());
        ack.push(0x17);
        scheduler.link.push_inbound(&ack);
        scheduler.tick_at(now);
        assert_eq!(scheduler.state, State::Main);
        assert!(status.target_online.load(Ordering::Relaxed));
    }
}
