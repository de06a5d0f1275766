use std::ops::{Deref, DerefMut};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ml::{EncoderError, RngStrategy, RNG};

#[cfg(not(feature = "short_floats"))]
pub type NodeValue = f64;

#[cfg(feature = "short_floats")]
pub type NodeValue = f32;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }

    pub fn assert_length_equals(&self, expected: usize, context: &'static str) -> Result<()> {
        if self.len() == expected {
            Ok(())
        } else {
            Err(EncoderError::shape_mismatch(context, expected, self.len()).into())
        }
    }

    pub fn multiply_iter<'a>(&'a self, rhs: &'a Self) -> impl Iterator<Item = NodeValue> + 'a {
        assert_eq!(self.len(), rhs.len());
        self.iter().zip(rhs.iter()).map(|(x, y)| x * y)
    }

    pub fn ave(&self) -> NodeValue {
        if !self.is_empty() {
            self.iter().sum::<NodeValue>() / self.len() as NodeValue
        } else {
            0.0
        }
    }

    pub fn msd_error(&self, expected_outputs: &LayerValues) -> Result<LayerValues> {
        expected_outputs.assert_length_equals(self.len(), "mean squared error targets")?;
        Ok(self
            .iter()
            .zip(expected_outputs.iter())
            .map(|(actual, expected)| (actual - expected).powi(2))
            .collect())
    }

    pub fn msd_error_d(&self, expected_outputs: &LayerValues) -> Result<LayerValues> {
        expected_outputs.assert_length_equals(self.len(), "mean squared error targets")?;
        Ok(self
            .iter()
            .zip(expected_outputs.iter())
            .map(|(actual, expected)| (actual - expected) * 2.0)
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    Zero,
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for weights and bias alike
    FanInUniform,
    /// scaled standard normal
    Kaiming,
}

impl Default for LayerInitStrategy {
    fn default() -> Self {
        Self::FanInUniform
    }
}

impl LayerInitStrategy {
    pub fn apply<'a>(
        &self,
        weights: impl Iterator<Item = &'a mut NodeValue>,
        bias: impl Iterator<Item = &'a mut NodeValue>,
        inputs_count: usize,
        rng: &RngStrategy,
    ) {
        use LayerInitStrategy::*;

        let fan_in = inputs_count.max(1) as NodeValue;
        match self {
            Zero => {
                for value in weights.chain(bias) {
                    *value = 0.0;
                }
            }
            FanInUniform => {
                let bound = fan_in.powf(-0.5);
                for value in weights.chain(bias) {
                    *value = Self::full_rand(rng) * bound;
                }
            }
            Kaiming => {
                let scale_factor = fan_in.powf(-0.5) * 5.0 / 3.0;
                for value in weights.chain(bias) {
                    *value = Self::rand_normal(0.0, 1.0, rng) * scale_factor;
                }
            }
        }
    }

    fn full_rand(rng: &dyn RNG) -> NodeValue {
        (rng.rand() * 2.0) - 1.0
    }

    fn rand_normal(mu: NodeValue, sigma: NodeValue, rng: &dyn RNG) -> NodeValue {
        let pi = std::f64::consts::PI as NodeValue;
        // shift to (0, 1] so ln never sees zero
        let u1 = 1.0 - rng.rand();
        let u2 = rng.rand();
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * pi * u2).cos();
        mu + sigma * z0
    }
}
