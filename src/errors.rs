use crate::backend::interface::BackendError;
use crate::registry::ManagedId;

/// Errors surfaced by the broker API.
///
/// Input validation (color parsing, stop positions, path state) is raised
/// here before a call ever reaches the native module; failures reported by
/// the module itself are wrapped with the operation name and the managed
/// reference they happened on.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("no native backend is loaded")]
    BackendUnavailable,

    #[error("backend does not export entry point `{0}`")]
    FeatureUnavailable(&'static str),

    #[error("backend failed to allocate resource: {0}")]
    BackendAllocationFailed(String),

    #[error("unknown or released handle {0}")]
    InvalidHandle(ManagedId),

    #[error("operation on disposed resource {0}")]
    UseAfterDispose(ManagedId),

    #[error("path has no current point")]
    NoCurrentPoint,

    #[error("invalid color `{0}`, expected #RRGGBB")]
    InvalidColor(String),

    #[error("gradient stop position {0} is outside [0, 1]")]
    InvalidStopPosition(f64),

    #[error("invalid blend mode tag {0}")]
    InvalidBlendMode(i32),

    #[error("layer `{0}` already exists")]
    DuplicateLayerName(String),

    #[error("no layer named `{0}`")]
    UnknownLayer(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("backend call `{op}` failed on {reference}: {source}")]
    Backend {
        op: &'static str,
        reference: ManagedId,
        source: BackendError,
    },
}

impl CanvasError {
    /// Wraps a backend failure for operation `op` on `reference`. The
    /// availability and encode cases keep their own taxonomy slots so
    /// callers can match on them regardless of which call tripped them.
    pub(crate) fn from_backend(op: &'static str, reference: ManagedId, err: BackendError) -> Self {
        match err {
            BackendError::Unavailable => CanvasError::BackendUnavailable,
            BackendError::MissingEntryPoint(name) => CanvasError::FeatureUnavailable(name),
            BackendError::Encode(msg) => CanvasError::EncodeFailed(msg),
            other => CanvasError::Backend {
                op,
                reference,
                source: other,
            },
        }
    }
}
