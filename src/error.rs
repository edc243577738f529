//! Error kinds shared across the router, session, and client envelope builder.

use thiserror::Error;

/// Named failure kinds from the error-handling design (see SPEC_FULL.md §7).
///
/// Framing/validation errors are handled at the session boundary: callers
/// match on the variant to decide whether to drop a frame or tear the
/// connection down. Nothing in this crate panics on attacker-controlled
/// input.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("replay detected: counter {counter} <= stored {stored}")]
    ReplayDetected { counter: u64, stored: u64 },

    #[error("unknown sender, refresh client list")]
    UnknownSender,

    #[error("decryption failed for all wrapped keys")]
    DecryptionFailed,

    #[error("transport closed")]
    TransportClosed,

    #[error("neighbour unreachable: {0}")]
    NeighbourUnreachable(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
