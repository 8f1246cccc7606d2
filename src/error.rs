//! Error types for vellum-writer.

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the body writer and copy engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Output sink failure. Propagated to the caller, no retry.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Zstd compression failed while emitting a container or stream payload.
    #[error("compression failed: {0}")]
    Compression(std::io::Error),

    /// An xref slot was addressed that has no target node.
    #[error("xref slot {0} has no target object")]
    EmptySlot(u32),

    /// A node's content was used after it had been released by a flush.
    #[error("object content already released")]
    ContentReleased,
}
