//! Single-wire transport (SWT) byte protocol: constants, content classes,
//! and the decoded `Frame` type.

/// Host→target flow marker sent immediately before a command frame.
pub const FLOW_SCHED_TO_TARGET: u8 = 0x0B;
/// Host→target poll: request the target's next content frame.
pub const FLOW_TARGET_TO_SCHED: u8 = 0x0C;
/// Content id for a host→target command frame.
pub const ID_CONTENT_SC_TO_TA_CMD: u8 = 0x1A;
/// Command-text terminator (host→target only).
pub const CMD_TERMINATOR: u8 = 0x00;
/// End-of-frame sentinel (both directions).
pub const ID_CONTENT_END: u8 = 0x17;
/// Abort-in-frame sentinel (target→host).
pub const ID_CONTENT_CUT: u8 = 0x0F;

/// Printable-payload restricted-set extras (beyond ASCII 0x20..=0x7E).
pub const PAYLOAD_EXTRA_BYTES: [u8; 4] = [0x1B, 0x09, 0x0D, 0x0A];

/// True iff `b` is allowed inside a frame payload: printable ASCII plus
/// ESC, TAB, CR, LF.
pub fn is_payload_byte(b: u8) -> bool {
    (0x20..=0x7E).contains(&b) || PAYLOAD_EXTRA_BYTES.contains(&b)
}

/// The four content classes the target may emit, keyed by wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentClass {
    Proc = 0x11,
    Log = 0x12,
    Cmd = 0x13,
    None = 0x15,
}

impl ContentClass {
    /// Index into a 4-slot fixed array, stable across all variants.
    pub fn slot(self) -> usize {
        match self {
            ContentClass::Proc => 0,
            ContentClass::Log => 1,
            ContentClass::Cmd => 2,
            ContentClass::None => 3,
        }
    }

    pub const COUNT: usize = 4;
}

impl TryFrom<u8> for ContentClass {
    type Error = ();

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0x11 => Ok(ContentClass::Proc),
            0x12 => Ok(ContentClass::Log),
            0x13 => Ok(ContentClass::Cmd),
            0x15 => Ok(ContentClass::None),
            _ => Err(()),
        }
    }
}

/// A fully decoded content frame.
///
/// `payload` is empty for [`ContentClass::None`]; `unsolicited` is true
/// iff the content id byte arrived immediately after a poll byte with no
/// command outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub content_id: ContentClass,
    pub payload: Vec<u8>,
    pub unsolicited: bool,
}

/// Outbound frame encoding.
pub mod encode {
    use super::*;

    /// One-byte poll: `0x0C`.
    pub fn poll() -> [u8; 1] {
        [FLOW_TARGET_TO_SCHED]
    }

    /// Command frame: `0x0B 0x1A <text...> 0x00 0x17`.
    pub fn cmd_frame(text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() + 4);
        out.push(FLOW_SCHED_TO_TARGET);
        out.push(ID_CONTENT_SC_TO_TA_CMD);
        out.extend_from_slice(text.as_bytes());
        out.push(CMD_TERMINATOR);
        out.push(ID_CONTENT_END);
        out
    }
}
