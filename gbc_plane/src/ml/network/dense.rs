use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::ml::{
    layer::LayerInitStrategy, ComputeBackend, EncoderError, NetworkActivationMode, RngStrategy,
};

use super::{
    linear::Linear,
    params::{ParameterKey, ParameterKind, TrainableLinear},
    solver::{Optimizer, ParameterUpdate},
};

/// One affine stage, `outputs = activation(inputs * weights + bias)`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: TrainableLinear,
    bias: TrainableLinear,
    activation: Option<NetworkActivationMode>,
    inputs_count: usize,
    outputs_count: usize,
    #[serde(skip, default)]
    backend: ComputeBackend,
}

impl Dense {
    pub fn new(
        inputs_count: usize,
        outputs_count: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let mut weights = Linear::new(inputs_count, outputs_count);
        weights.initialize_as_layer(strategy, inputs_count, rng);

        let mut bias = Linear::new(1, outputs_count);
        bias.initialize_as_layer_bias(strategy, inputs_count, rng);

        Self {
            weights: weights.into(),
            bias: bias.into(),
            activation: None,
            inputs_count,
            outputs_count,
            backend: ComputeBackend::Serial,
        }
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        if inputs.stride() != self.inputs_count {
            Err(EncoderError::shape_mismatch(
                "dense stage input",
                self.inputs_count,
                inputs.stride(),
            ))?;
        }
        let mut weighted_inputs = self.compute_weighted_inputs(inputs);

        if let Some(activation) = &self.activation {
            weighted_inputs.rows_iter_mut().for_each(|row| {
                let activation_row = activation.apply(&(&*row).into());
                row.copy_from_slice(&activation_row)
            });
        }

        Ok(weighted_inputs)
    }

    fn compute_weighted_inputs(&self, inputs: &Linear) -> Linear {
        // -> output = inputs * weights
        let output = inputs.matrix_product(self.weights.value(), self.backend);

        let bias = self.bias.iter().stack(inputs.count());
        output.iter().add(bias).collect()
    }

    /// Queues weight and bias gradients and returns the gradients with respect
    /// to `inputs`.
    pub fn backward(&mut self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        if inputs.stride() != self.inputs_count {
            Err(EncoderError::shape_mismatch(
                "dense stage input",
                self.inputs_count,
                inputs.stride(),
            ))?;
        }
        if output_gradients.stride() != self.outputs_count
            || output_gradients.count() != inputs.count()
        {
            Err(EncoderError::shape_mismatch(
                "dense stage output gradients",
                inputs.count() * self.outputs_count,
                output_gradients.count() * output_gradients.stride(),
            ))?;
        }

        let weighted_inputs_gradients = match &self.activation {
            Some(activation) => {
                let mut weighted_inputs = self.compute_weighted_inputs(inputs);
                weighted_inputs
                    .rows_iter_mut()
                    .zip(output_gradients.rows_iter())
                    .for_each(|(x, grads)| {
                        let output_gradients = grads.into();
                        let activated_inputs = activation.apply(&(&*x).into());
                        activation
                            .derivative(&activated_inputs)
                            .multiply_iter(&output_gradients)
                            .zip(x.iter_mut())
                            .for_each(|(grad, x)| *x = grad)
                    });
                weighted_inputs
            }
            None => output_gradients.clone(),
        };

        let bias_gradients = weighted_inputs_gradients.iter_transpose().flatten_sum();

        // -> output = inputs * weights
        // -> weights_gradients = inputs.T * weighted_inputs_gradients
        let weights_gradients =
            inputs.matrix_product_lhs_transposed(&weighted_inputs_gradients, self.backend);

        self.weights.queue_gradients(weights_gradients)?;
        self.bias.queue_gradients(bias_gradients.transpose())?;

        // -> input_gradients = weighted_inputs_gradients * weights.T
        let input_gradients = weighted_inputs_gradients
            .matrix_product_rhs_transposed(self.weights.value(), self.backend);

        Ok(input_gradients)
    }

    pub fn set_activation(&mut self, activation: NetworkActivationMode) {
        self.activation = Some(activation);
    }

    pub fn set_backend(&mut self, backend: ComputeBackend) {
        self.backend = backend;
    }

    /// Drains the queued gradients into one proposed update per parameter.
    /// Nothing is applied until [`Dense::commit_update`].
    pub fn propose_updates<O: Optimizer>(
        &mut self,
        stage: usize,
        optimizer: &O,
    ) -> Result<Vec<ParameterUpdate<O::State>>> {
        let mut updates = vec![];
        for kind in ParameterKind::all() {
            let param = self.parameter_mut(kind);
            if let Some(gradients) = param.take_gradients() {
                let key = ParameterKey::new(stage, kind);
                updates.push(optimizer.propose(key, param.value(), &gradients)?);
            }
        }
        Ok(updates)
    }

    pub fn commit_update<O: Optimizer>(
        &mut self,
        update: ParameterUpdate<O::State>,
        optimizer: &mut O,
    ) -> Result<()> {
        let kind = update.key().kind();
        let value = optimizer.commit(update);
        self.parameter_mut(kind).set_value(value)
    }

    pub fn parameter(&self, kind: ParameterKind) -> &TrainableLinear {
        match kind {
            ParameterKind::Weights => &self.weights,
            ParameterKind::Bias => &self.bias,
        }
    }

    pub fn parameter_mut(&mut self, kind: ParameterKind) -> &mut TrainableLinear {
        match kind {
            ParameterKind::Weights => &mut self.weights,
            ParameterKind::Bias => &mut self.bias,
        }
    }

    pub fn activation(&self) -> Option<NetworkActivationMode> {
        self.activation
    }

    pub fn weights(&self) -> &Linear {
        self.weights.value()
    }

    pub fn bias(&self) -> &Linear {
        self.bias.value()
    }

    pub fn inputs_count(&self) -> usize {
        self.inputs_count
    }

    pub fn outputs_count(&self) -> usize {
        self.outputs_count
    }

    pub fn parameter_count(&self) -> usize {
        (self.inputs_count + 1) * self.outputs_count
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::ml::{
        network::tests::helpers::{
            assert_input_gradients, assert_optimisation_converges, new_linear,
        },
        solver::AdamOptimizer,
    };

    use super::*;

    #[test]
    fn dense_can_minimise() {
        let seq_len = 4;
        let embed_dim = 8;
        let output_dim = 12;
        let strategy = LayerInitStrategy::Kaiming;

        let learn_rate = 0.01;
        let total_iterations = 25;
        let optimizer = RefCell::new(AdamOptimizer::new(learn_rate));

        assert_optimisation_converges(
            &move |rng| {
                let dense = Dense::new(embed_dim, output_dim, &strategy, &rng);
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, output_dim, &rng);
                (dense, inputs, target)
            },
            &move |dense, inputs| dense.forward(inputs).unwrap(),
            &move |dense, inputs, dloss| {
                let grads = dense.backward(inputs, &dloss).unwrap();

                *inputs = inputs.iter().apply_gradients(grads.iter(), learn_rate);

                let mut optimizer = optimizer.borrow_mut();
                for update in dense.propose_updates(0, &*optimizer).unwrap() {
                    dense.commit_update(update, &mut *optimizer).unwrap();
                }
                grads
            },
            total_iterations,
        );
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_simple_feed_forward() {
        computed_dloss_dinput_delta(|_| (), LayerInitStrategy::Kaiming);
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_relu_feed_forward() {
        computed_dloss_dinput_delta(
            |dense| dense.set_activation(NetworkActivationMode::RelU),
            LayerInitStrategy::Kaiming,
        );
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_tanh_feed_forward() {
        computed_dloss_dinput_delta(
            |dense| dense.set_activation(NetworkActivationMode::Tanh),
            LayerInitStrategy::Kaiming,
        );
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_sigmoid_feed_forward() {
        computed_dloss_dinput_delta(
            |dense| dense.set_activation(NetworkActivationMode::Sigmoid),
            LayerInitStrategy::Kaiming,
        );
    }

    #[test]
    fn dense_rejects_mismatched_input_width() {
        let rng = RngStrategy::testable(12345);
        let dense = Dense::new(4, 2, &LayerInitStrategy::default(), &rng);

        let err = dense.forward(&Linear::new(3, 5)).unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch("dense stage input", 4, 5)),
            err.downcast_ref::<EncoderError>()
        );
    }

    #[test]
    fn empty_batch_queues_zero_gradients_of_full_shape() {
        let rng = RngStrategy::testable(12345);
        let mut dense = Dense::new(4, 3, &LayerInitStrategy::default(), &rng);
        dense.set_activation(NetworkActivationMode::RelU);

        let input_gradients = dense
            .backward(&Linear::new(0, 4), &Linear::new(0, 3))
            .unwrap();

        assert_eq!(0, input_gradients.count());
        assert_eq!(
            Some(&Linear::new(1, 3)),
            dense.parameter(ParameterKind::Bias).gradients()
        );
        assert_eq!(
            Some(&Linear::new(4, 3)),
            dense.parameter(ParameterKind::Weights).gradients()
        );
    }

    #[test]
    fn dense_threadpool_backend_matches_serial() {
        let rng = RngStrategy::testable(12345);
        let mut dense = Dense::new(16, 8, &LayerInitStrategy::default(), &rng);
        dense.set_activation(NetworkActivationMode::RelU);
        let inputs = new_linear(9, 16, &rng);

        let serial = dense.forward(&inputs).unwrap();
        dense.set_backend(ComputeBackend::ThreadPool);
        let threaded = dense.forward(&inputs).unwrap();

        assert_eq!(serial, threaded);
    }

    fn computed_dloss_dinput_delta(
        configure_fn: impl Fn(&mut Dense),
        strategy: LayerInitStrategy,
    ) {
        let seq_len = 4;
        let embed_dim = 8;
        let output_dim = 12;

        assert_input_gradients(
            &move |rng| {
                let mut dense = Dense::new(embed_dim, output_dim, &strategy, &rng);
                configure_fn(&mut dense);
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, output_dim, &rng);
                (dense, inputs, target)
            },
            &move |dense, inputs| dense.forward(inputs).unwrap(),
            &move |dense, inputs, dloss| dense.backward(inputs, &dloss).unwrap(),
        );
    }
}
