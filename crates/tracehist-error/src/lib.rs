use thiserror::Error;

/// Primary error type for tracehist operations.
///
/// Structured variants for the common failure cases, with enough context to
/// diagnose a problem without re-running the construction. Lookup and type
/// errors are recoverable at the call site (skip the offending event);
/// structural and I/O errors terminate the construction.
#[derive(Error, Debug)]
pub enum HistoryError {
    // === Attribute namespace ===
    /// An attribute path or quark lookup failed.
    #[error("attribute not found: {path}")]
    AttributeNotFound { path: String },

    /// A quark is outside the range of known attributes.
    #[error("quark {quark} out of range (have {count} attributes)")]
    QuarkOutOfRange { quark: u32, count: usize },

    /// An attribute path contained an empty segment.
    #[error("malformed attribute path: empty segment")]
    EmptyPathSegment,

    // === Time domain ===
    /// A query or insertion time falls outside the valid bounds.
    #[error("time {time} outside valid range [{start}, {end}]")]
    TimeRange { time: i64, start: i64, end: i64 },

    /// An interval would be constructed with start > end.
    #[error("invalid interval: start {start} > end {end}")]
    InvalidInterval { start: i64, end: i64 },

    // === Value discipline ===
    /// A state value's type conflicts with the type previously observed for
    /// the same attribute.
    #[error("value type mismatch on quark {quark}: got {actual}, expected {expected}")]
    StateValueType {
        quark: u32,
        expected: &'static str,
        actual: &'static str,
    },

    // === Lifecycle ===
    /// An operation was attempted after the state system was disposed.
    #[error("state system has been disposed")]
    Disposed,

    /// The tree is closed and no longer accepts insertions.
    #[error("history tree is closed")]
    TreeClosed,

    /// A mutator was called on a node that has already been sealed.
    #[error("node {seq} is sealed")]
    NodeSealed { seq: u32 },

    // === Persisted file ===
    /// Reopening a file built by a different state provider version.
    #[error("provider version mismatch: file has {actual}, expected {expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// The history file is structurally invalid.
    #[error("history file is corrupt: {detail}")]
    Corrupt { detail: String },

    /// Fewer bytes than expected were read from the file.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Misc ===
    /// Operation is not supported by this component (e.g. adding attributes
    /// through a partial state system).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// A query was cancelled through its cancellation token.
    #[error("query cancelled")]
    Cancelled,

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corrupt-file error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Whether the construction/query loop can skip the offending operation
    /// and keep going. Structural and I/O errors are never recoverable.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AttributeNotFound { .. }
                | Self::QuarkOutOfRange { .. }
                | Self::EmptyPathSegment
                | Self::TimeRange { .. }
                | Self::StateValueType { .. }
        )
    }

    /// Whether this error, raised while reopening a persisted tree, means the
    /// caller should discard the file and rebuild from scratch.
    pub const fn is_reopen_fatal(&self) -> bool {
        matches!(
            self,
            Self::VersionMismatch { .. } | Self::Corrupt { .. } | Self::ShortRead { .. }
        )
    }
}

/// Result type alias using `HistoryError`.
pub type Result<T> = std::result::Result<T, HistoryError>;
