use thiserror::Error;

/// Primary error type for ForestDoc storage operations.
///
/// Follows the one-enum-per-engine pattern: structured variants for the
/// recoverable cases, detail strings only where the on-disk input (not the
/// caller) is at fault.
#[derive(Error, Debug)]
pub enum ForestError {
    // === Corruption ===
    /// A serialized revision tree is malformed.
    #[error("corrupt revision data: {detail}")]
    CorruptRevisionData { detail: String },

    // === Value encoding ===
    /// NaN has no representation in the tagged value format.
    #[error("can't write NaN")]
    NanNotSupported,

    /// A container frame was closed after writing the wrong number of items.
    #[error("mismatched count: declared {declared}, wrote {written}")]
    MismatchedCount { declared: u64, written: u64 },

    /// The encoder output grew past the range shared-string references can
    /// address.
    #[error("output too large for shared string references")]
    OutputTooLarge,

    // === I/O (collaborators) ===
    /// File I/O error surfaced from a storage collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForestError {
    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::CorruptRevisionData {
            detail: detail.into(),
        }
    }

    /// Whether this error indicates damaged persistent data, as opposed to
    /// caller misuse.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptRevisionData { .. })
    }
}

/// Result type alias using `ForestError`.
pub type Result<T> = std::result::Result<T, ForestError>;
