use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, InversionError>;

/// Everything that can go wrong while loading models or inverting images.
#[derive(Debug, Error)]
pub enum InversionError {
    /// A required input (image list, model directory) is missing.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A generator, perceptual or encoder network could not be loaded or is not attached.
    #[error("model `{model}` unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    /// A latent estimate or declared layout does not fit the expected slot shapes.
    #[error("latent shape mismatch at {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// Loss or latent values became non-finite during optimization.
    #[error("numerical divergence at step {step}: {detail}")]
    NumericalDivergence { step: usize, detail: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid target image: {0}")]
    InvalidTarget(String),

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InversionError {
    /// Shorthand for a [`InversionError::ShapeMismatch`].
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Shorthand for a [`InversionError::ModelUnavailable`].
    pub fn model_unavailable(model: impl Into<String>, reason: impl ToString) -> Self {
        Self::ModelUnavailable {
            model: model.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must stop the whole batch.
    ///
    /// Per-image problems (divergence, unreadable or malformed images) only
    /// fail the current image; everything else is shared by every image and
    /// aborts immediately.
    pub fn aborts_batch(&self) -> bool {
        !matches!(
            self,
            Self::NumericalDivergence { .. }
                | Self::InvalidTarget(_)
                | Self::TensorData(_)
                | Self::Image(_)
        )
    }
}
