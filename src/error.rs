use std::io;

use thiserror::Error;

/// Error kinds surfaced by the host.
///
/// `Load` and `Symbol` are fatal for the session; everything else is
/// per-call and leaves the session usable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open core library: {0}")]
    Load(String),

    #[error("core is missing required symbol `{0}`")]
    Symbol(&'static str),

    #[error("core rejected the game image")]
    Rom,

    #[error("state error: {0}")]
    State(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("bridge queue is full")]
    BridgeFull,

    #[error("frame exceeds maximum reallocation")]
    Geometry,

    #[error("audio output unavailable: {0}")]
    Audio(String),

    #[error("another core session is already active")]
    AlreadyActive,

    #[error("no game is loaded")]
    NotLoaded,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
