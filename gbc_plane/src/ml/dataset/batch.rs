use anyhow::{anyhow, Result};
use itertools::Itertools;

use crate::ml::{linear::Linear, EncoderError, RngStrategy, ShuffleRng};

use super::{Record, SampleSet};

#[derive(Debug, Clone)]
pub enum BatchSamplingStrategy {
    /// every record in one batch, in record order
    None,
    Sequential(usize),
    /// re-shuffled on every call to [`BatchSource::batches`]
    Shuffle(usize, RngStrategy),
}

/// Mini-batch of stacked input rows and their target rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    inputs: Linear,
    targets: Linear,
}

impl Batch {
    pub fn new(inputs: Linear, targets: Linear) -> Result<Self> {
        if inputs.count() == 0 {
            return Err(anyhow!("batch must contain at least one row"));
        }
        if inputs.count() != targets.count() {
            Err(EncoderError::shape_mismatch(
                "batch targets",
                inputs.count(),
                targets.count(),
            ))?;
        }
        Ok(Self { inputs, targets })
    }

    pub fn from_records(records: &[&Record]) -> Result<Self> {
        let inputs = records.iter().map(|x| x.inputs().as_slice()).collect_vec();
        let targets = records.iter().map(|x| x.targets().as_slice()).collect_vec();

        Self::new(Linear::from_rows(&inputs)?, Linear::from_rows(&targets)?)
    }

    pub fn inputs(&self) -> &Linear {
        &self.inputs
    }

    pub fn targets(&self) -> &Linear {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.inputs.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Supplies the mini-batches for one epoch. Called once per epoch.
pub trait BatchSource {
    fn batches(&self) -> Result<Vec<Batch>>;
}

impl BatchSource for Vec<Batch> {
    fn batches(&self) -> Result<Vec<Batch>> {
        Ok(self.clone())
    }
}

impl<T: BatchSource + ?Sized> BatchSource for &T {
    fn batches(&self) -> Result<Vec<Batch>> {
        (**self).batches()
    }
}

/// Splits a sample set into mini-batches. The final batch holds whatever
/// records remain and may be smaller than the batch size.
pub struct DataLoader<'a> {
    samples: &'a SampleSet,
    strategy: BatchSamplingStrategy,
}

impl<'a> DataLoader<'a> {
    pub fn new(samples: &'a SampleSet, strategy: BatchSamplingStrategy) -> Self {
        Self { samples, strategy }
    }

    pub fn shuffled(samples: &'a SampleSet, batch_size: usize, rng: &RngStrategy) -> Self {
        Self::new(
            samples,
            BatchSamplingStrategy::Shuffle(batch_size, rng.clone()),
        )
    }

    pub fn sequential(samples: &'a SampleSet, batch_size: usize) -> Self {
        Self::new(samples, BatchSamplingStrategy::Sequential(batch_size))
    }

    pub fn samples(&self) -> &SampleSet {
        self.samples
    }

    pub fn batch_count(&self) -> usize {
        match self.batch_size() {
            0 => 0,
            batch_size => (self.samples.len() + batch_size - 1) / batch_size,
        }
    }

    fn batch_size(&self) -> usize {
        match &self.strategy {
            BatchSamplingStrategy::None => self.samples.len(),
            BatchSamplingStrategy::Sequential(batch_size)
            | BatchSamplingStrategy::Shuffle(batch_size, _) => *batch_size,
        }
    }
}

impl<'a> BatchSource for DataLoader<'a> {
    fn batches(&self) -> Result<Vec<Batch>> {
        if self.samples.is_empty() {
            return Ok(vec![]);
        }

        let batch_size = self.batch_size();
        if batch_size == 0 {
            return Err(anyhow!("batch size must be non-zero"));
        }

        let mut records = self.samples.iter().collect_vec();
        if let BatchSamplingStrategy::Shuffle(_, rng) = &self.strategy {
            rng.shuffle_vec(&mut records);
        }

        records
            .chunks(batch_size)
            .map(Batch::from_records)
            .collect()
    }
}
