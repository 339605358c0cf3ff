//! Error types for transport and configuration operations.

use thiserror::Error;

/// Errors surfaced by the transports and the configuration layer.
///
/// Transient "no frame yet" conditions are *not* errors — those are
/// `Option::None` returns on the polling APIs. This enum covers the cases a
/// caller has to handle explicitly (bad endpoint, segment unavailable, ...).
#[derive(Debug, Error)]
pub enum CalderaError {
    /// Underlying I/O failure (mapping, binding, connecting).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The segment exists but does not look like one of ours.
    #[error("segment '{name}' has invalid magic {magic:#010x}")]
    BadMagic { name: String, magic: u32 },

    /// The segment was produced by an incompatible layout version.
    #[error("segment '{name}' has unsupported version {version}")]
    BadVersion { name: String, version: u32 },

    /// The segment is smaller than the capacity the reader asked for.
    #[error("segment capacity too small: have {available} bytes per buffer, need {requested}")]
    CapacityTooSmall { available: usize, requested: usize },

    /// Endpoint string is not a supported scheme.
    #[error("invalid endpoint '{0}': only unix:<path> is supported")]
    InvalidEndpoint(String),

    /// Connect attempts exhausted the caller-supplied timeout.
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
}
