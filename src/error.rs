//! Core error type
//!
//! Only lifecycle, capacity and snapshot problems are reported as errors.
//! Guest memory access failures are logged and handled locally.

/// Errors surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Translation cache storage could not be allocated
    Initialization(String),
    /// The instruction buffer has no room for the requested block
    BufferExhausted { requested: usize, available: usize },
    /// Every translation table slot holds a valid entry
    TableFull,
    /// The translation cache has not been initialized
    NotInitialized,
    /// A save-state buffer is shorter than the fixed layout
    StateBufferTooSmall { needed: usize, got: usize },
    /// Compressed snapshot encode/decode failure
    Snapshot(String),
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            CoreError::BufferExhausted { requested, available } => write!(
                f,
                "Instruction buffer exhausted: {} bytes requested, {} available",
                requested, available
            ),
            CoreError::TableFull => write!(f, "Translation table full"),
            CoreError::NotInitialized => write!(f, "Translation cache not initialized"),
            CoreError::StateBufferTooSmall { needed, got } => {
                write!(f, "State buffer too small: need {} bytes, got {}", needed, got)
            }
            CoreError::Snapshot(msg) => write!(f, "Snapshot error: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}
