//! Runtime configuration for the gateway engine.

use std::ops::RangeInclusive;
use std::time::Duration;

/// Valid range for [`Config::refresh_rate_ms`], per spec.
pub const REFRESH_RATE_BOUNDS_MS: RangeInclusive<u32> = 10..=20_000;

/// Default process-tree rate-limit window.
pub const DEFAULT_REFRESH_RATE_MS: u32 = 500;

/// Default target handshake command.
pub const DEFAULT_INIT_CODE: &str = "aaaaa";

/// Maximum pending commands per priority FIFO, and maximum entries in the
/// response list, before `QueueFull` is returned.
pub const QUEUE_DEPTH_MAX: usize = 40;

/// Response window for a single poll cycle (handshake wait and per-tick
/// target-response wait both use this).
pub const RESPONSE_WINDOW: Duration = Duration::from_millis(330);

/// How long a completed response may sit unread before it is evicted.
pub const RESPONSE_RETENTION: Duration = Duration::from_millis(5500);

/// Re-request attempts allowed after a non-matching frame before a
/// command is abandoned.
pub const REREQUEST_BUDGET: u8 = 4;

/// Poll cycles to skip between consecutive `SysLow` command issuances.
pub const LOW_PRIO_GATE_CYCLES: u8 = 4;

/// Maximum bytes retained per fragment before silent truncation.
pub const FRAGMENT_MAX_BYTES: usize = 4096;

/// Gateway configuration.
///
/// `device` has no default and must be supplied; every other field has a
/// spec-mandated default and is clamped to its valid bound on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    device: String,
    init_code: String,
    refresh_rate_ms: u32,
    monitoring: bool,
    manual_control: bool,
}

impl Config {
    /// Starts a configuration for the given serial device path, with all
    /// other fields at their spec defaults.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            init_code: DEFAULT_INIT_CODE.to_string(),
            refresh_rate_ms: DEFAULT_REFRESH_RATE_MS,
            monitoring: true,
            manual_control: false,
        }
    }

    /// Overrides the target handshake command (default `"aaaaa"`).
    pub fn with_init_code(mut self, init_code: impl Into<String>) -> Self {
        self.init_code = init_code.into();
        self
    }

    /// Overrides the process-tree rate-limit window, clamped to
    /// [`REFRESH_RATE_BOUNDS_MS`].
    pub fn with_refresh_rate_ms(mut self, refresh_rate_ms: u32) -> Self {
        self.refresh_rate_ms = refresh_rate_ms.clamp(
            *REFRESH_RATE_BOUNDS_MS.start(),
            *REFRESH_RATE_BOUNDS_MS.end(),
        );
        self
    }

    /// Sets whether the scheduler polls the target absent an outstanding
    /// command (default `true`).
    pub fn with_monitoring(mut self, monitoring: bool) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Sets whether the scheduler should pause in `CtrlManual` (default
    /// `false`).
    pub fn with_manual_control(mut self, manual_control: bool) -> Self {
        self.manual_control = manual_control;
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn init_code(&self) -> &str {
        &self.init_code
    }

    pub fn refresh_rate_ms(&self) -> u32 {
        self.refresh_rate_ms
    }

    pub fn monitoring(&self) -> bool {
        self.monitoring
    }

    pub fn manual_control(&self) -> bool {
        self.manual_control
    }

    pub fn set_monitoring(&mut self, monitoring: bool) {
        self.monitoring = monitoring;
    }

    pub fn set_manual_control(&mut self, manual_control: bool) {
        self.manual_control = manual_control;
    }
}
