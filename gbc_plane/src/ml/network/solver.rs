use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::ml::{EncoderError, NodeValue};

use super::{linear::Linear, params::ParameterKey};

/// Gradient step split in two phases. `propose` computes the next value and
/// optimizer state without touching either, and `commit` stores the state and
/// hands back the value. A caller can propose for every parameter, inspect the
/// results, and commit all or none of them.
pub trait Optimizer {
    type State;

    fn propose(
        &self,
        key: ParameterKey,
        value: &Linear,
        gradients: &Linear,
    ) -> Result<ParameterUpdate<Self::State>>;

    fn commit(&mut self, update: ParameterUpdate<Self::State>) -> Linear;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate<S> {
    key: ParameterKey,
    value: Linear,
    state: S,
}

impl<S> ParameterUpdate<S> {
    pub fn key(&self) -> ParameterKey {
        self.key
    }

    pub fn value(&self) -> &Linear {
        &self.value
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

/// First and second moment estimates for one parameter matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamMoments {
    momentum: Linear,
    rms: Linear,
    step: i32,
}

impl AdamMoments {
    pub fn momentum(&self) -> &Linear {
        &self.momentum
    }

    pub fn rms(&self) -> &Linear {
        &self.rms
    }

    pub fn step(&self) -> i32 {
        self.step
    }
}

/// Bias-corrected Adam. Moments are kept per [`ParameterKey`] for the
/// lifetime of the optimizer.
#[derive(Debug, Clone)]
pub struct AdamOptimizer {
    eta: NodeValue,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
    moments: HashMap<ParameterKey, AdamMoments>,
}

impl AdamOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self {
            eta: learn_rate,
            beta: (0.9, 0.999),
            epsilon: 1e-8,
            moments: HashMap::new(),
        }
    }

    pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
        self.beta = (beta1, beta2);
        self
    }

    pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn learn_rate(&self) -> NodeValue {
        self.eta
    }

    pub fn moments(&self, key: &ParameterKey) -> Option<&AdamMoments> {
        self.moments.get(key)
    }

    pub fn tracked_parameters(&self) -> usize {
        self.moments.len()
    }
}

impl Optimizer for AdamOptimizer {
    type State = AdamMoments;

    fn propose(
        &self,
        key: ParameterKey,
        value: &Linear,
        gradients: &Linear,
    ) -> Result<ParameterUpdate<AdamMoments>> {
        if gradients.stride() != value.stride()
            || gradients.count() != value.count()
            || gradients.values().len() != value.values().len()
        {
            Err(EncoderError::shape_mismatch(
                "optimizer gradients",
                value.values().len(),
                gradients.values().len(),
            ))?;
        }

        let (beta1, beta2) = self.beta;
        let (mut momentum, mut rms, step) = match self.moments.get(&key) {
            Some(previous) => (
                previous.momentum.clone(),
                previous.rms.clone(),
                previous.step + 1,
            ),
            None => (
                Linear::with_dimensions(value),
                Linear::with_dimensions(value),
                1,
            ),
        };

        let momentum_correction = 1.0 / (1.0 - beta1.powi(step));
        let rms_correction = 1.0 / (1.0 - beta2.powi(step));
        let mut next = value.clone();

        let moments = momentum.values_mut().iter_mut().zip(rms.values_mut());
        let values = next.values_mut().iter_mut().zip(moments);
        for ((x, (m, v)), &g) in values.zip(gradients.values()) {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;

            let m_hat = *m * momentum_correction;
            let v_hat = *v * rms_correction;
            *x -= self.eta * m_hat / (v_hat.sqrt() + self.epsilon);
        }

        Ok(ParameterUpdate {
            key,
            value: next,
            state: AdamMoments {
                momentum,
                rms,
                step,
            },
        })
    }

    fn commit(&mut self, update: ParameterUpdate<AdamMoments>) -> Linear {
        let ParameterUpdate { key, value, state } = update;
        if self.moments.insert(key, state).is_none() {
            debug!("Tracking Adam moments for {key}");
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::ml::{
        network::tests::helpers::{assert_optimisation_converges, new_linear},
        params::ParameterKind,
        ComputeBackend,
    };

    use super::*;

    const BACKEND: ComputeBackend = ComputeBackend::Serial;
    const WEIGHTS: ParameterKey = ParameterKey::new(0, ParameterKind::Weights);

    #[test]
    fn adam_can_optimise_linear() {
        let batch_count = 12;
        let input_dimension = 48;
        let output_dimension = 8;

        let iters = 100;
        let optimizer = RefCell::new(AdamOptimizer::new(0.1));

        assert_optimisation_converges(
            &move |rng| {
                let weights = new_linear(output_dimension, input_dimension, &rng);
                let inputs = new_linear(batch_count, input_dimension, &rng);
                let target = new_linear(batch_count, output_dimension, &rng);
                (weights, inputs, target)
            },
            &move |weights, inputs| inputs.matrix_product_rhs_transposed(weights, BACKEND),
            &move |weights, inputs, dloss| {
                let dweights = dloss.matrix_product_lhs_transposed(inputs, BACKEND);
                let dinputs = dloss.matrix_product(weights, BACKEND);

                let mut optimizer = optimizer.borrow_mut();
                let update = optimizer.propose(WEIGHTS, weights, &dweights).unwrap();
                *weights = optimizer.commit(update);
                dinputs
            },
            iters,
        );
    }

    #[test]
    fn adam_first_step_moves_by_learn_rate() {
        let target = Linear::with_value(1, 2, 1.0);
        let grads: Linear = "0.5 -3.0".parse().unwrap();
        let mut optimizer = AdamOptimizer::new(0.01);

        let update = optimizer.propose(WEIGHTS, &target, &grads).unwrap();
        let moved = optimizer.commit(update);

        // bias-corrected first step is eta * sign(g)
        assert!((moved.values()[0] - 0.99).abs() < 1e-6);
        assert!((moved.values()[1] - 1.01).abs() < 1e-6);
        assert_eq!(1, optimizer.moments(&WEIGHTS).unwrap().step());
    }

    #[test]
    fn proposing_leaves_moments_untouched_until_commit() {
        let target = Linear::with_value(1, 2, 1.0);
        let grads = Linear::with_value(1, 2, 0.5);
        let mut optimizer = AdamOptimizer::new(0.01);

        let first = optimizer.propose(WEIGHTS, &target, &grads).unwrap();
        let again = optimizer.propose(WEIGHTS, &target, &grads).unwrap();
        assert_eq!(first, again);
        assert_eq!(0, optimizer.tracked_parameters());

        let moved = optimizer.commit(first);
        let second = optimizer.propose(WEIGHTS, &moved, &grads).unwrap();

        let moments = optimizer.moments(&WEIGHTS).unwrap();
        assert_eq!(1, moments.step());
        assert!((moments.momentum().values()[0] - 0.05).abs() < 1e-9);
        assert_ne!(&moved, second.value());
    }

    #[test]
    fn moments_are_kept_per_stage_and_kind() {
        let target = Linear::with_value(1, 2, 1.0);
        let grads = Linear::with_value(1, 2, 0.5);
        let mut optimizer = AdamOptimizer::new(0.01);

        for stage in 0..150 {
            for kind in ParameterKind::all() {
                let key = ParameterKey::new(stage, kind);
                let update = optimizer.propose(key, &target, &grads).unwrap();
                optimizer.commit(update);
            }
        }

        assert_eq!(300, optimizer.tracked_parameters());
        let bias = ParameterKey::new(149, ParameterKind::Bias);
        assert_eq!(1, optimizer.moments(&bias).unwrap().step());
    }

    #[test]
    fn non_finite_gradients_produce_a_non_finite_proposal() {
        let target = Linear::with_value(1, 2, 1.0);
        let grads = Linear::with_value(1, 2, NodeValue::NAN);
        let optimizer = AdamOptimizer::new(0.01);

        let update = optimizer.propose(WEIGHTS, &target, &grads).unwrap();

        assert!(!update.is_finite());
        assert_eq!(0, optimizer.tracked_parameters());
    }

    #[test]
    fn mismatched_gradients_are_rejected() {
        let target = Linear::with_value(2, 2, 1.0);
        let optimizer = AdamOptimizer::new(0.01);

        let err = optimizer
            .propose(WEIGHTS, &target, &Linear::new(1, 2))
            .unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch("optimizer gradients", 4, 2)),
            err.downcast_ref::<EncoderError>()
        );
    }
}
