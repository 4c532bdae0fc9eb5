//! Fuzz target: `FrameDecoder::feed`
//!
//! Drives arbitrary byte sequences into the streaming frame decoder and
//! asserts that it never panics, never yields an oversized or
//! restricted-alphabet-violating payload, and recovers cleanly after a
//! `reset()`.
//!
//! cargo fuzz run fuzz_frame_decoder

#![no_main]

use std::time::Instant;

use codeorb::config::FRAGMENT_MAX_BYTES;
use codeorb::decoder::{DecodeOutcome, FrameDecoder, ProcRateFilter};
use codeorb::wire::is_payload_byte;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = FrameDecoder::new();
    let mut rate_filter = ProcRateFilter::new(500);
    let now = Instant::now();

    for &byte in data {
        if let DecodeOutcome::Frame(frame) = decoder.feed(byte, &mut rate_filter, now) {
            assert!(
                frame.payload.len() <= FRAGMENT_MAX_BYTES,
                "payload exceeds fragment cap"
            );
            assert!(
                frame.payload.iter().all(|&b| is_payload_byte(b)),
                "payload contains a byte outside the restricted alphabet"
            );
        }
    }

    // After a reset the decoder must accept bytes cleanly again.
    decoder.reset();
    for &byte in data {
        let _ = decoder.feed(byte, &mut rate_filter, now);
    }
});
