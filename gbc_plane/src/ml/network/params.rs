use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ml::{EncoderError, NodeValue};

use super::linear::{Linear, LinearIter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Weights,
    Bias,
}

impl ParameterKind {
    pub fn all() -> [ParameterKind; 2] {
        [ParameterKind::Weights, ParameterKind::Bias]
    }
}

/// Identifies one parameter matrix of a network by stage position and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterKey {
    stage: usize,
    kind: ParameterKind,
}

impl ParameterKey {
    pub const fn new(stage: usize, kind: ParameterKind) -> Self {
        Self { stage, kind }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn kind(&self) -> ParameterKind {
        self.kind
    }
}

impl std::fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage {} {:?}", self.stage, self.kind)
    }
}

/// A parameter matrix plus the gradients queued against it since the last
/// optimizer step. Gradients are never serialized, and equality only looks
/// at the values.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainableLinear {
    value: Linear,
    #[serde(skip)]
    gradients: Option<Linear>,
}

impl TrainableLinear {
    pub fn value(&self) -> &Linear {
        &self.value
    }

    /// Replaces the value, which must keep its shape.
    pub fn set_value(&mut self, value: Linear) -> Result<()> {
        self.assert_same_shape(&value, "parameter update")?;
        self.value = value;
        Ok(())
    }

    pub fn iter(&self) -> LinearIter<impl Iterator<Item = NodeValue> + '_> {
        self.value.iter()
    }

    pub fn stride(&self) -> usize {
        self.value.stride()
    }

    pub fn count(&self) -> usize {
        self.value.count()
    }

    /// Sums `gradients` into the pending gradients.
    pub fn queue_gradients(&mut self, gradients: Linear) -> Result<()> {
        self.assert_same_shape(&gradients, "queued gradients")?;

        self.gradients = Some(match self.gradients.take() {
            Some(existing) => existing.iter().add(gradients.iter()).collect(),
            None => gradients,
        });
        Ok(())
    }

    pub fn gradients(&self) -> Option<&Linear> {
        self.gradients.as_ref()
    }

    pub fn take_gradients(&mut self) -> Option<Linear> {
        self.gradients.take()
    }

    fn assert_same_shape(&self, other: &Linear, context: &'static str) -> Result<()> {
        let same_shape = other.stride() == self.value.stride()
            && other.count() == self.value.count()
            && other.values().len() == self.value.values().len();

        if !same_shape {
            Err(EncoderError::shape_mismatch(
                context,
                self.value.values().len(),
                other.values().len(),
            ))?;
        }
        Ok(())
    }
}

impl PartialEq for TrainableLinear {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

// a clone starts with no pending gradients
impl Clone for TrainableLinear {
    fn clone(&self) -> Self {
        self.value.clone().into()
    }
}

impl From<Linear> for TrainableLinear {
    fn from(value: Linear) -> Self {
        Self {
            value,
            gradients: None,
        }
    }
}
