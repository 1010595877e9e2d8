use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NnError>;

/// Errors surfaced by tensors, layers and the evaluator.
///
/// Deserialization failure is deliberately not represented here: the
/// deserializers return `None` so callers can fall back to "layer not
/// recognized" instead of aborting the whole load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NnError {
    /// A shape constructor received a non-positive dimension.
    #[error("tensor dimensions must be strictly positive, got {entities} x {channels} x {height} x {width}")]
    InvalidShape {
        entities: usize,
        channels: usize,
        height: usize,
        width: usize,
    },

    /// A buffer or tensor does not match the shape required by an operation.
    #[error("shape mismatch: expected {expected} values, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// A layer hyperparameter was zero or otherwise unusable at construction.
    #[error("invalid configuration: unusable value for {field}")]
    InvalidConfiguration { field: &'static str },

    /// Backward or ComputeGradient was invoked without a matching Forward,
    /// or with a batch size different from the cached one.
    /// `cached == 0` means no forward pass has been recorded at all.
    #[error("stale layer state: cached batch of {cached} entities, called with {got}")]
    StaleState { cached: usize, got: usize },

    /// The accelerator backend failed to allocate a resource. Fatal for the
    /// current pass; never retried by the core.
    #[error("backend resource exhaustion: {backend}: {message}")]
    BackendResourceExhaustion {
        backend: &'static str,
        message: String,
    },
}
