//! Construction-time and public-API error surface.
//!
//! Per-tick internal control flow never uses this type — see
//! [`crate::link::LinkStatus`] and [`crate::decoder::DecodeOutcome`] for the
//! sum types the scheduler branches on instead.

use thiserror::Error;

/// Errors surfaced to a caller constructing or driving an [`crate::engine::Engine`].
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to open link: {0}")]
    LinkOpenFailed(String),
    #[error("command queue or response list full")]
    QueueFull,
    #[error("{0}")]
    InvalidParams(String),
}

pub type GatewayResult<T> = std::result::Result<T, Error>;
