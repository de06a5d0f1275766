use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use dense::Dense;
use layer::LayerInitStrategy;
use linear::Linear;
use solver::Optimizer;

pub use layer::{LayerValues, NodeValue};

use super::{ComputeBackend, EncoderError, ExecutionContext};

pub mod dense;
pub mod layer;
pub mod linear;
pub mod params;
pub mod solver;

/// Number of GBC connectivity measurements per subject.
pub const GBC_FEATURE_COUNT: usize = 718;
/// Number of PANSS symptom-scale scores per subject.
pub const PANSS_TARGET_COUNT: usize = 30;

/// Input width followed by the output width of every stage, in order.
///
/// Widths must shrink strictly from the inputs down to the bottleneck, which
/// is the unique narrowest stage, and at least one stage must follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkShape {
    inputs_count: usize,
    stage_widths: Vec<usize>,
    activation_mode: NetworkActivationMode,
    #[serde(default)]
    init_strategy: LayerInitStrategy,
}

impl NetworkShape {
    pub fn new(
        inputs_count: usize,
        stage_widths: Vec<usize>,
        activation_mode: NetworkActivationMode,
    ) -> Result<Self> {
        let shape = Self {
            inputs_count,
            stage_widths,
            activation_mode,
            init_strategy: LayerInitStrategy::default(),
        };
        shape.validate()?;
        Ok(shape)
    }

    fn validate(&self) -> Result<()> {
        if self.inputs_count == 0 || self.stage_widths.iter().any(|&x| x == 0) {
            Err(EncoderError::invalid_shape("all widths must be non-zero"))?;
        }
        let bottleneck_index = self
            .find_bottleneck()
            .ok_or_else(|| EncoderError::invalid_shape("network must have at least one stage"))?;
        let bottleneck_width = self.stage_widths[bottleneck_index];

        let encoder_widths = [self.inputs_count]
            .into_iter()
            .chain(self.stage_widths[..=bottleneck_index].iter().copied())
            .collect::<Vec<_>>();
        if encoder_widths.windows(2).any(|pair| pair[1] >= pair[0]) {
            Err(EncoderError::invalid_shape(format!(
                "widths must strictly decrease down to the bottleneck: {}",
                self.desc_pretty()
            )))?;
        }

        let decoder_widths = &self.stage_widths[bottleneck_index + 1..];
        if decoder_widths.is_empty() {
            Err(EncoderError::invalid_shape(
                "bottleneck must be followed by at least one stage",
            ))?;
        }
        if decoder_widths.iter().any(|&x| x <= bottleneck_width) {
            Err(EncoderError::invalid_shape(format!(
                "bottleneck width {bottleneck_width} must be the unique narrowest stage: {}",
                self.desc_pretty()
            )))?;
        }
        Ok(())
    }

    fn find_bottleneck(&self) -> Option<usize> {
        self.stage_widths
            .iter()
            .enumerate()
            .min_by_key(|&(_, &width)| width)
            .map(|(idx, _)| idx)
    }

    pub fn with_init_strategy(mut self, init_strategy: LayerInitStrategy) -> Self {
        self.init_strategy = init_strategy;
        self
    }

    /// `(inputs, outputs)` width of every stage, in order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        [self.inputs_count]
            .into_iter()
            .chain(self.stage_widths.iter().copied())
            .zip(self.stage_widths.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.stage_widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stage_widths.is_empty()
    }

    pub fn inputs_count(&self) -> usize {
        self.inputs_count
    }

    pub fn outputs_count(&self) -> usize {
        self.stage_widths.last().copied().unwrap_or(self.inputs_count)
    }

    pub fn bottleneck_index(&self) -> usize {
        self.find_bottleneck().unwrap_or_default()
    }

    pub fn bottleneck_width(&self) -> usize {
        self.stage_widths
            .get(self.bottleneck_index())
            .copied()
            .unwrap_or(self.inputs_count)
    }

    pub fn stage_widths(&self) -> &[usize] {
        &self.stage_widths
    }

    pub fn activation_mode(&self) -> NetworkActivationMode {
        self.activation_mode
    }

    pub fn init_strategy(&self) -> &LayerInitStrategy {
        &self.init_strategy
    }

    pub fn desc_pretty(&self) -> String {
        let mut widths = [self.inputs_count]
            .into_iter()
            .chain(self.stage_widths.iter().copied());

        itertools::Itertools::join(&mut widths, " -> ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottleneckVariant {
    Shallow2D,
    Shallow3D,
    Deep2D,
    Deep3D,
}

impl BottleneckVariant {
    pub fn all() -> [Self; 4] {
        use BottleneckVariant::*;
        [Shallow2D, Shallow3D, Deep2D, Deep3D]
    }

    pub fn bottleneck_width(&self) -> usize {
        match self {
            Self::Shallow2D | Self::Deep2D => 2,
            Self::Shallow3D | Self::Deep3D => 3,
        }
    }

    pub fn is_deep(&self) -> bool {
        matches!(self, Self::Deep2D | Self::Deep3D)
    }

    pub fn stage_widths(&self, outputs_count: usize) -> Vec<usize> {
        let bottleneck = self.bottleneck_width();
        if self.is_deep() {
            vec![256, 64, bottleneck, 64, 256, outputs_count]
        } else {
            vec![128, bottleneck, 128, outputs_count]
        }
    }

    pub fn shape(
        &self,
        inputs_count: usize,
        outputs_count: usize,
        activation_mode: NetworkActivationMode,
    ) -> Result<NetworkShape> {
        NetworkShape::new(
            inputs_count,
            self.stage_widths(outputs_count),
            activation_mode,
        )
    }

    /// 718 GBC features to 30 PANSS targets with ReLU after every stage.
    pub fn gbc_shape(&self) -> Result<NetworkShape> {
        self.shape(
            GBC_FEATURE_COUNT,
            PANSS_TARGET_COUNT,
            NetworkActivationMode::default(),
        )
    }
}

impl std::fmt::Display for BottleneckVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BottleneckVariant::Shallow2D => "shallow2d",
            BottleneckVariant::Shallow3D => "shallow3d",
            BottleneckVariant::Deep2D => "deep2d",
            BottleneckVariant::Deep3D => "deep3d",
        };
        write!(f, "{name}")
    }
}

impl FromStr for BottleneckVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use BottleneckVariant::*;
        let mut s = s.to_uppercase();
        s.retain(char::is_alphanumeric);
        match s.as_str() {
            "SHALLOW2D" => Ok(Shallow2D),
            "SHALLOW3D" => Ok(Shallow3D),
            "DEEP2D" => Ok(Deep2D),
            "DEEP3D" => Ok(Deep3D),
            _ => Err(anyhow!("Could not match bottleneck variant type")),
        }
    }
}

/// Stage inputs recorded during a training forward pass, consumed by
/// [`BottleneckNetwork::backward`].
#[derive(Debug, Clone)]
pub struct ForwardPass {
    stage_inputs: Vec<Linear>,
    outputs: Linear,
}

impl ForwardPass {
    pub fn outputs(&self) -> &Linear {
        &self.outputs
    }

    pub fn stage_inputs(&self) -> &[Linear] {
        &self.stage_inputs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckNetwork {
    stages: Vec<Dense>,
    shape: NetworkShape,
}

impl BottleneckNetwork {
    pub fn new(shape: NetworkShape, context: &ExecutionContext) -> Self {
        let rng = context.rng();
        let stages = shape
            .iter()
            .map(|(inputs_count, outputs_count)| {
                let mut stage =
                    Dense::new(inputs_count, outputs_count, shape.init_strategy(), rng);
                stage.set_activation(shape.activation_mode());
                stage.set_backend(context.backend());
                stage
            })
            .collect();

        debug!(
            "Created bottleneck network with shape {} ({:?})",
            shape.desc_pretty(),
            shape.activation_mode()
        );
        Self { stages, shape }
    }

    pub fn from_variant(variant: BottleneckVariant, context: &ExecutionContext) -> Result<Self> {
        Ok(Self::new(variant.gbc_shape()?, context))
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_stages(inputs, self.stages.len())
    }

    pub fn forward_row(&self, inputs: LayerValues) -> Result<LayerValues> {
        inputs.assert_length_equals(self.input_width(), "network input")?;
        let outputs = self.forward(&Linear::from_values(&[inputs])?)?;
        outputs.as_single_stride()
    }

    pub fn predict(&self, inputs: &Linear) -> Result<Linear> {
        self.forward(inputs)
    }

    pub fn predict_row(&self, inputs: LayerValues) -> Result<LayerValues> {
        self.forward_row(inputs)
    }

    /// Runs the stages up to and including the bottleneck.
    pub fn embed(&self, inputs: &Linear) -> Result<Linear> {
        self.forward_stages(inputs, self.bottleneck_index() + 1)
    }

    pub fn embed_row(&self, inputs: LayerValues) -> Result<LayerValues> {
        inputs.assert_length_equals(self.input_width(), "network input")?;
        let outputs = self.embed(&Linear::from_values(&[inputs])?)?;
        outputs.as_single_stride()
    }

    pub fn generate_embedding<R: AsRef<[NodeValue]>>(
        &self,
        inputs: &[R],
    ) -> Result<Vec<Vec<NodeValue>>> {
        super::embeddings::generate_embedding(self, inputs)
    }

    fn forward_stages(&self, inputs: &Linear, stage_count: usize) -> Result<Linear> {
        self.assert_input_width(inputs)?;
        let mut outputs = inputs.clone();
        for stage in self.stages.iter().take(stage_count) {
            outputs = stage.forward(&outputs)?;
        }
        Ok(outputs)
    }

    pub fn forward_training(&self, inputs: &Linear) -> Result<ForwardPass> {
        self.assert_input_width(inputs)?;
        let mut stage_inputs = Vec::with_capacity(self.stages.len());
        let mut outputs = inputs.clone();

        for stage in &self.stages {
            let next = stage.forward(&outputs)?;
            stage_inputs.push(outputs);
            outputs = next;
        }

        Ok(ForwardPass {
            stage_inputs,
            outputs,
        })
    }

    /// Queues parameter gradients on every stage and returns the gradients
    /// with respect to the network inputs.
    pub fn backward(&mut self, pass: &ForwardPass, output_gradients: &Linear) -> Result<Linear> {
        if output_gradients.stride() != self.output_width() {
            Err(EncoderError::shape_mismatch(
                "output gradients",
                self.output_width(),
                output_gradients.stride(),
            ))?;
        }
        if pass.stage_inputs.len() != self.stages.len() {
            Err(anyhow!(
                "forward pass recorded {} stages, network has {}",
                pass.stage_inputs.len(),
                self.stages.len()
            ))?;
        }

        let mut gradients = output_gradients.clone();
        for (stage, inputs) in self.stages.iter_mut().zip(&pass.stage_inputs).rev() {
            gradients = stage.backward(inputs, &gradients)?;
        }
        Ok(gradients)
    }

    /// Applies the queued gradients of every stage as one update.
    ///
    /// Returns `false` when any proposed value is non-finite, in which case no
    /// stage and no optimizer state is changed. Queued gradients are consumed
    /// either way.
    pub fn apply_gradients<O: Optimizer>(&mut self, optimizer: &mut O) -> Result<bool> {
        let mut updates = vec![];
        for (idx, stage) in self.stages.iter_mut().enumerate() {
            updates.extend(stage.propose_updates(idx, &*optimizer)?);
        }

        if let Some(update) = updates.iter().find(|update| !update.is_finite()) {
            debug!("Discarding batch update, {} is non-finite", update.key());
            return Ok(false);
        }

        for update in updates {
            let idx = update.key().stage();
            let stage = self
                .stages
                .get_mut(idx)
                .with_context(|| format!("invalid stage index = {idx}"))?;
            stage.commit_update(update, optimizer)?;
        }
        Ok(true)
    }

    fn assert_input_width(&self, inputs: &Linear) -> Result<()> {
        if inputs.stride() != self.input_width() {
            Err(EncoderError::shape_mismatch(
                "network input",
                self.input_width(),
                inputs.stride(),
            ))?;
        }
        Ok(())
    }

    pub fn set_backend(&mut self, backend: ComputeBackend) {
        self.stages
            .iter_mut()
            .for_each(|stage| stage.set_backend(backend));
    }

    pub fn shape(&self) -> &NetworkShape {
        &self.shape
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, idx: usize) -> Result<&Dense> {
        self.stages
            .get(idx)
            .with_context(|| format!("invalid stage index = {idx}"))
    }

    pub fn stage_mut(&mut self, idx: usize) -> Result<&mut Dense> {
        self.stages
            .get_mut(idx)
            .with_context(|| format!("invalid stage index = {idx}"))
    }

    pub fn bottleneck_index(&self) -> usize {
        self.shape.bottleneck_index()
    }

    pub fn bottleneck_width(&self) -> usize {
        self.shape.bottleneck_width()
    }

    pub fn input_width(&self) -> usize {
        self.shape.inputs_count()
    }

    pub fn output_width(&self) -> usize {
        self.shape.outputs_count()
    }

    pub fn parameter_count(&self) -> usize {
        self.stages.iter().map(|x| x.parameter_count()).sum()
    }

    pub fn desc_pretty(&self) -> String {
        self.shape.desc_pretty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkActivationMode {
    Linear,
    Sigmoid,
    Tanh,
    RelU,
}

impl std::fmt::Display for NetworkActivationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(&self).map_err(|_| std::fmt::Error)?;
        let json = json.trim_matches('"');
        write!(f, "{}", json)
    }
}

impl FromStr for NetworkActivationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        use NetworkActivationMode::*;
        let mut s = s.to_uppercase();
        s.retain(char::is_alphabetic);
        match s.as_str() {
            "LINEAR" => Ok(Linear),
            "SIGMOID" => Ok(Sigmoid),
            "TANH" => Ok(Tanh),
            "RELU" => Ok(RelU),
            _ => Err(anyhow!("Could not match activation mode type")),
        }
    }
}

impl NetworkActivationMode {
    pub fn apply(&self, output: &LayerValues) -> LayerValues {
        match self {
            NetworkActivationMode::Linear => output.clone(),
            NetworkActivationMode::Sigmoid => {
                LayerValues::new(output.iter().map(|x| 1.0 / (1.0 + (-x).exp())).collect())
            }
            NetworkActivationMode::Tanh => {
                LayerValues::new(output.iter().map(|x| x.tanh()).collect())
            }
            NetworkActivationMode::RelU => {
                // NaN passes through so divergence stays visible
                LayerValues::new(output.iter().map(|&x| if x < 0.0 { 0.0 } else { x }).collect())
            }
        }
    }

    /// Derivative expressed in terms of the activated outputs.
    pub fn derivative(&self, activation: &LayerValues) -> LayerValues {
        match self {
            NetworkActivationMode::Linear => activation.iter().map(|_| 1.0).collect(),
            NetworkActivationMode::Sigmoid => {
                activation.iter().map(|x| x * (1.0 - x)).collect()
            }
            NetworkActivationMode::Tanh => activation.iter().map(|x| 1.0 - x.powi(2)).collect(),
            NetworkActivationMode::RelU => activation
                .iter()
                .map(|&x| if x == 0.0 { 0.0 } else { 1.0 })
                .collect(),
        }
    }
}

impl Default for NetworkActivationMode {
    fn default() -> Self {
        Self::RelU
    }
}
