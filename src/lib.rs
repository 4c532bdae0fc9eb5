//! Single-wire transport (SWT) protocol engine and scheduler for the
//! CodeOrb debug gateway.
//!
//! A single half-duplex serial line carries three multiplexed content
//! classes to and from a target device: a periodically-refreshed process
//! tree snapshot, free-form log text, and command/response text. This
//! crate owns the byte-level framing ([`decoder`]), the priority command
//! queue ([`queue`]), and the cooperative state machine that interleaves
//! polling and command dispatch on the wire ([`scheduler`]), exposing all
//! of it through a small thread-safe handle ([`engine::EngineHandle`]).
//!
//! # Example
//! Opens a connection to the target over a local serial device and sends
//! a command.
//!
//! ```no_run
//! use codeorb::{Config, EngineBuilder};
//!
//! # fn example() -> codeorb::error::GatewayResult<()> {
//! let engine = EngineBuilder::new(Config::new("/dev/ttyUSB0"))
//!     .with_serial("/dev/ttyUSB0")
//!     .build()?;
//! let handle = engine.handle();
//! let id = handle.command_send("status").expect("queue has room");
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod link;
pub mod queue;
pub mod scheduler;
pub mod sink;
pub mod telemetry;
pub mod wire;

pub use builder::EngineBuilder;
pub use config::Config;
pub use engine::{Engine, EngineHandle};
pub use error::{Error, GatewayResult};
