use thiserror::Error;

/// Errors surfaced by builds, queries, and storage round-trips.
///
/// Per-point conditions (out-of-bounds, overflow) are tracked as counters on
/// the owning file's [`PointStats`](crate::PointStats) and do not fail a
/// build; [`Error::Overflow`] is only returned by the single-point insertion
/// path so callers can count it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("endpoint i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("point not placed by maximum depth")]
    Overflow,
}

pub type Result<T> = std::result::Result<T, Error>;
