use thiserror::Error;

use super::NodeValue;

/// Fatal conditions raised by the encoder. Functions in this crate return
/// `anyhow::Result`; callers that need to branch on the failure kind can
/// `downcast_ref::<EncoderError>()` the error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncoderError {
    #[error("shape mismatch in {context}: expected width {expected}, found {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("index {index} out of range for container of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("training diverged at epoch {epoch}, batch {batch}: loss = {loss}")]
    NumericDivergence {
        epoch: usize,
        batch: usize,
        loss: NodeValue,
    },

    #[error("invalid network shape: {0}")]
    InvalidShape(String),

    #[error("invalid table: {0}")]
    InvalidTable(String),
}

impl EncoderError {
    pub fn shape_mismatch(context: &'static str, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            actual,
        }
    }

    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape(reason.into())
    }

    pub fn invalid_table(reason: impl Into<String>) -> Self {
        Self::InvalidTable(reason.into())
    }
}
