use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{
    dataset::{Batch, BatchSource},
    linear::Linear,
    solver::{AdamOptimizer, Optimizer},
    BottleneckNetwork, EncoderError, LayerValues, NodeValue,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    epochs: usize,
    learn_rate: NodeValue,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            learn_rate: 0.01,
            beta: (0.9, 0.999),
            epsilon: 1e-8,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_learn_rate(mut self, learn_rate: NodeValue) -> Self {
        self.learn_rate = learn_rate;
        self
    }

    pub fn with_beta(mut self, beta1: NodeValue, beta2: NodeValue) -> Self {
        self.beta = (beta1, beta2);
        self
    }

    pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    pub fn learn_rate(&self) -> NodeValue {
        self.learn_rate
    }

    pub fn beta(&self) -> (NodeValue, NodeValue) {
        self.beta
    }

    pub fn epsilon(&self) -> NodeValue {
        self.epsilon
    }
}

/// Loss reported at the end of each epoch, which is the loss of that epoch's
/// final batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    epoch_losses: Vec<NodeValue>,
}

impl TrainingHistory {
    pub fn epoch_losses(&self) -> &[NodeValue] {
        &self.epoch_losses
    }

    pub fn first_loss(&self) -> Option<NodeValue> {
        self.epoch_losses.first().copied()
    }

    pub fn final_loss(&self) -> Option<NodeValue> {
        self.epoch_losses.last().copied()
    }

    pub fn len(&self) -> usize {
        self.epoch_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epoch_losses.is_empty()
    }
}

/// Outcome of one batch. A diverged batch leaves the network untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
enum BatchStep {
    Applied(NodeValue),
    Diverged(NodeValue),
}

/// Mini-batch gradient descent over a bottleneck network with Adam updates
/// and a mean squared error objective.
#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainerConfig,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn train<S: BatchSource>(
        network: BottleneckNetwork,
        source: &S,
        epochs: usize,
        learn_rate: NodeValue,
    ) -> Result<(BottleneckNetwork, TrainingHistory)> {
        let config = TrainerConfig::new()
            .with_epochs(epochs)
            .with_learn_rate(learn_rate);

        Self::new(config).train_with(network, source)
    }

    pub fn train_with<S: BatchSource>(
        &self,
        mut network: BottleneckNetwork,
        source: &S,
    ) -> Result<(BottleneckNetwork, TrainingHistory)> {
        let history = self.fit(&mut network, source)?;
        Ok((network, history))
    }

    /// Trains the network in place. Optimizer moment estimates live only for
    /// the duration of this call.
    #[instrument(level = "info", name = "train", skip_all, fields(epochs = self.config.epochs))]
    pub fn fit<S: BatchSource>(
        &self,
        network: &mut BottleneckNetwork,
        source: &S,
    ) -> Result<TrainingHistory> {
        let learn_rate = self.config.learn_rate;
        if !learn_rate.is_finite() || learn_rate <= 0.0 {
            return Err(anyhow!("learn rate must be positive, found {learn_rate}"));
        }

        let mut optimizer = self.new_optimizer();
        let mut history = TrainingHistory::default();

        for epoch in 1..=self.config.epochs {
            let batches = source.batches()?;
            let mut loss = 0.0;

            for (batch_idx, batch) in batches.iter().enumerate() {
                match Self::train_batch(network, batch, &mut optimizer)? {
                    BatchStep::Applied(batch_loss) => loss = batch_loss,
                    BatchStep::Diverged(loss) => Err(EncoderError::NumericDivergence {
                        epoch,
                        batch: batch_idx + 1,
                        loss,
                    })?,
                }
            }

            info!("epoch = {epoch}, loss = {loss}");
            history.epoch_losses.push(loss);
        }

        info!("Training complete");
        Ok(history)
    }

    fn new_optimizer(&self) -> AdamOptimizer {
        let (beta1, beta2) = self.config.beta;
        AdamOptimizer::new(self.config.learn_rate)
            .with_beta(beta1, beta2)
            .with_epsilon(self.config.epsilon)
    }

    /// Runs one forward, backward and optimizer step. The batch diverges
    /// without touching any parameter if its loss or any proposed parameter
    /// value is non-finite.
    #[instrument(level = "debug", name = "train_batch", skip_all, fields(len = batch.len()))]
    fn train_batch<O: Optimizer>(
        network: &mut BottleneckNetwork,
        batch: &Batch,
        optimizer: &mut O,
    ) -> Result<BatchStep> {
        let pass = network.forward_training(batch.inputs())?;
        let (loss, output_gradients) = mse_loss(pass.outputs(), batch.targets())?;
        debug!("batch loss = {loss}");

        if !loss.is_finite() {
            return Ok(BatchStep::Diverged(loss));
        }

        network.backward(&pass, &output_gradients)?;
        match network.apply_gradients(optimizer)? {
            true => Ok(BatchStep::Applied(loss)),
            false => Ok(BatchStep::Diverged(loss)),
        }
    }
}

/// Mean squared error over every row and output dimension, together with its
/// gradient `2 (y - t) / (n * d)` with respect to the outputs.
pub fn mse_loss(outputs: &Linear, targets: &Linear) -> Result<(NodeValue, Linear)> {
    if targets.stride() != outputs.stride() {
        Err(EncoderError::shape_mismatch(
            "target width",
            outputs.stride(),
            targets.stride(),
        ))?;
    }
    if targets.count() != outputs.count() {
        Err(EncoderError::shape_mismatch(
            "target rows",
            outputs.count(),
            targets.count(),
        ))?;
    }

    let row_count = outputs.count().max(1) as NodeValue;
    let scale = 1.0 / (row_count * outputs.stride() as NodeValue);
    let mut loss = 0.0;
    let mut gradients = Vec::with_capacity(outputs.count() * outputs.stride());

    for (y, t) in outputs.rows_iter().zip(targets.rows_iter()) {
        let (y, t) = (LayerValues::from(y), LayerValues::from(t));
        loss += y.msd_error(&t)?.ave() / row_count;
        gradients.extend(y.msd_error_d(&t)?.iter().map(|x| x * scale));
    }

    let gradients = Linear::from_iter(outputs.stride(), gradients.into_iter())?;
    Ok((loss, gradients))
}
