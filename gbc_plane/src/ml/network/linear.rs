use std::iter;

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{
    layer::LayerInitStrategy, ComputeBackend, EncoderError, LayerValues, NodeValue, RngStrategy,
};

/// Row-major matrix of `count` rows by `stride` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    inner: LayerValues,
    stride: usize,
    count: usize,
}

impl Linear {
    pub fn new(count: usize, stride: usize) -> Self {
        Self::with_value(count, stride, 0.0)
    }

    pub fn with_dimensions(other: &Self) -> Self {
        Self::with_value(other.count, other.stride, 0.0)
    }

    pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
        Self {
            inner: LayerValues::new(vec![value; count * stride]),
            stride,
            count,
        }
    }

    pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
        if stride == 0 {
            Err(anyhow!("linear stride must be non-zero"))?;
        }
        let inner: LayerValues = values.collect();
        let count = inner.len() / stride;

        if inner.len() != stride * count {
            Err(anyhow!("mismatched values length/stride"))?;
        }

        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    /// Stacks rows into a matrix; every row must share the first row's width.
    pub fn from_rows<R: AsRef<[NodeValue]>>(rows: &[R]) -> Result<Self> {
        let stride = rows.first().context("no rows provided")?.as_ref().len();
        if let Some(row) = rows.iter().find(|row| row.as_ref().len() != stride) {
            Err(EncoderError::shape_mismatch(
                "batch row",
                stride,
                row.as_ref().len(),
            ))?;
        }
        let flattened = rows.iter().flat_map(|row| row.as_ref().iter().copied());
        Linear::from_iter(stride, flattened)
    }

    pub fn from_values(values: &[LayerValues]) -> Result<Self> {
        let rows = values.iter().map(|x| x.as_slice()).collect_vec();
        Self::from_rows(&rows)
    }

    pub fn initialize_as_layer(
        &mut self,
        strategy: &LayerInitStrategy,
        fan_in: usize,
        rng: &RngStrategy,
    ) {
        strategy.apply(self.inner.iter_mut(), iter::empty(), fan_in, rng);
    }

    pub fn initialize_as_layer_bias(
        &mut self,
        strategy: &LayerInitStrategy,
        fan_in: usize,
        rng: &RngStrategy,
    ) {
        strategy.apply(iter::empty(), self.inner.iter_mut(), fan_in, rng);
    }

    pub fn iter(&self) -> LinearIter<impl Iterator<Item = NodeValue> + '_> {
        LinearIter {
            inner: self.inner.iter().copied(),
            stride: self.stride,
            count: self.count,
        }
    }

    pub fn iter_transpose(&self) -> LinearIter<impl Iterator<Item = NodeValue> + '_> {
        let stride = self.stride;
        let count = self.count;

        let transposed = (0..self.inner.len()).map(move |idx| {
            let (col, row) = (idx % count, idx / count);
            self.inner[row + col * stride]
        });
        LinearIter {
            inner: transposed,
            stride: count,
            count: stride,
        }
    }

    pub fn transpose(&self) -> Linear {
        self.iter_transpose().collect()
    }

    /// returns (Self * Rhs)
    pub fn matrix_product(&self, rhs: &Linear, backend: ComputeBackend) -> Linear {
        assert_eq!(self.stride, rhs.count, "mismatched dimensions");
        let (m, k, n) = (self.count, self.stride, rhs.stride);

        Linear {
            inner: LayerValues::new(kernel::mat_mul(&self.inner, &rhs.inner, m, k, n, backend)),
            stride: n,
            count: m,
        }
    }

    /// returns (Self * Rhs.T)
    pub fn matrix_product_rhs_transposed(&self, rhs: &Linear, backend: ComputeBackend) -> Linear {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        self.matrix_product(&rhs.transpose(), backend)
    }

    /// returns (Self.T * Rhs)
    pub fn matrix_product_lhs_transposed(&self, rhs: &Linear, backend: ComputeBackend) -> Linear {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        self.transpose().matrix_product(rhs, backend)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_finite(&self) -> bool {
        self.inner.iter().all(|x| x.is_finite())
    }

    pub fn to_rows(&self) -> Vec<Vec<NodeValue>> {
        self.rows_iter().map(|row| row.to_vec()).collect()
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
        self.inner.chunks_exact(self.stride.max(1)).take(self.count)
    }

    pub fn rows_iter_mut(&mut self) -> impl Iterator<Item = &mut [NodeValue]> {
        let count = self.count;
        self.inner.chunks_exact_mut(self.stride.max(1)).take(count)
    }

    pub fn values(&self) -> &[NodeValue] {
        &self.inner
    }

    pub fn values_mut(&mut self) -> &mut [NodeValue] {
        &mut self.inner
    }

    pub fn values_iter(&self) -> impl Iterator<Item = NodeValue> + '_ {
        self.inner.iter().copied()
    }

    pub fn as_scalar(&self) -> Result<NodeValue> {
        if self.inner.len() == 1 {
            Ok(self.inner[0])
        } else {
            Err(anyhow!(
                "can not read value of shape = [{}, {}] as scalar",
                self.count,
                self.stride
            ))
        }
    }

    pub fn as_single_stride(&self) -> Result<LayerValues> {
        if self.count == 1 {
            Ok(self.inner[..self.stride].into())
        } else {
            Err(anyhow!(
                "can not read shape = [{}, {}] as single stride",
                self.count,
                self.stride
            ))
        }
    }

    pub fn to_sum(&self) -> NodeValue {
        self.inner.iter().sum()
    }
}

impl std::fmt::Display for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.rows_iter()
            .fold(&mut f.debug_list(), |list, row| list.entry(&row))
            .finish()
    }
}

impl std::str::FromStr for Linear {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lines = s
            .lines()
            .filter_map(|x| Some(x.trim()).filter(|x| !x.is_empty()))
            .collect_vec();

        let count = lines.len();
        let elements: Result<Vec<NodeValue>, _> = lines
            .into_iter()
            .flat_map(|line| line.split_whitespace().map(|x| x.parse::<NodeValue>()))
            .collect();

        let elements = elements.context("invalid numerical found")?;
        let stride = elements.len() / count.max(1);

        if stride * count == elements.len() {
            Linear::from_iter(stride, elements.into_iter())
        } else {
            Err(anyhow!("mismatch row length found"))
        }
    }
}

#[must_use = "linear iterators are lazy and do nothing unless consumed"]
pub struct LinearIter<I> {
    inner: I,
    stride: usize,
    count: usize,
}

impl<I> LinearIter<I>
where
    I: Iterator<Item = NodeValue>,
{
    /// returns underlying data stride dimension size (or 'width')
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// returns underlying data count dimension size (or 'height')
    pub fn count(&self) -> usize {
        self.count
    }
    /// point-wise addition
    pub fn add(
        self,
        other: LinearIter<impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<impl Iterator<Item = NodeValue>> {
        self.assert_same_shape(&other);
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x + y),
            stride: self.stride,
            count: self.count,
        }
    }
    /// point-wise subtraction
    pub fn sub(
        self,
        rhs: LinearIter<impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<impl Iterator<Item = NodeValue>> {
        self.assert_same_shape(&rhs);
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(|(x, y)| x - y),
            stride: self.stride,
            count: self.count,
        }
    }
    /// point-wise multiplication by scalar constant
    pub fn multiply_scalar(self, rhs: NodeValue) -> LinearIter<impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x * rhs),
            stride: self.stride,
            count: self.count,
        }
    }
    /// point-wise raise to the power of scalar constant
    pub fn powf_scalar(self, n: NodeValue) -> LinearIter<impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x.powf(n)),
            stride: self.stride,
            count: self.count,
        }
    }
    /// point-wise absolute value
    pub fn abs(self) -> LinearIter<impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(|x| x.abs()),
            stride: self.stride,
            count: self.count,
        }
    }
    /// point-wise rounding to a number of decimal places
    pub fn round(self, decimals: u32) -> LinearIter<impl Iterator<Item = NodeValue>> {
        let scale = (10.0 as NodeValue).powi(decimals as i32);
        LinearIter {
            inner: self.inner.map(move |x| (x * scale).round() / scale),
            stride: self.stride,
            count: self.count,
        }
    }
    /// plain gradient descent step, `self - gradients * learn_rate`
    pub fn apply_gradients(
        self,
        gradients: LinearIter<impl Iterator<Item = NodeValue>>,
        learn_rate: NodeValue,
    ) -> Linear {
        self.sub(gradients.multiply_scalar(learn_rate)).collect()
    }
    /// extends count dimension by duplicating row values
    /// Note: count dimension must be equal to 1
    pub fn stack(self, count: usize) -> LinearIter<impl Iterator<Item = NodeValue>> {
        assert_eq!(self.count, 1, "can only stack when count dimension = 1");
        let row = self.inner.collect_vec();
        LinearIter {
            inner: iter::repeat(row).take(count).flatten(),
            stride: self.stride,
            count,
        }
    }
    /// sums each row into a single column
    pub fn flatten_sum(self) -> Linear {
        let stride = self.stride;
        self.flatten_with(|row| row.take(stride).sum())
    }
    /// averages each row into a single column
    pub fn flatten_mean(self) -> Linear {
        let stride = self.stride;
        let scale = 1.0 / stride.max(1) as NodeValue;
        self.flatten_with(move |row| row.take(stride).sum::<NodeValue>() * scale)
    }
    fn flatten_with<F>(self, reduce: F) -> Linear
    where
        F: Fn(&mut I) -> NodeValue,
    {
        // one value per row, even for zero-width rows
        let mut inner = self.inner;
        Linear {
            inner: (0..self.count).map(|_| reduce(&mut inner)).collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn collect(self) -> Linear {
        Linear {
            inner: self.inner.collect(),
            stride: self.stride,
            count: self.count,
        }
    }
    fn assert_same_shape<J>(&self, other: &LinearIter<J>) {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
    }
}

mod kernel {
    use crate::ml::{ComputeBackend, NodeValue};

    /// `a` is (m x k), `b` is (k x n), both row-major; returns (m x n).
    pub fn mat_mul(
        a: &[NodeValue],
        b: &[NodeValue],
        m: usize,
        k: usize,
        n: usize,
        backend: ComputeBackend,
    ) -> Vec<NodeValue> {
        let mut c = vec![0.0; m * n];
        if k == 0 || n == 0 {
            return c;
        }

        let row_product = |(c_row, a_row): (&mut [NodeValue], &[NodeValue])| {
            for (&a, b_row) in a_row.iter().zip(b.chunks_exact(n)) {
                for (c, &b) in c_row.iter_mut().zip(b_row.iter()) {
                    *c += a * b;
                }
            }
        };

        match backend {
            #[cfg(feature = "threadpool")]
            ComputeBackend::ThreadPool => {
                use rayon::prelude::*;
                c.par_chunks_exact_mut(n)
                    .zip(a.par_chunks_exact(k))
                    .for_each(row_product);
            }
            _ => c
                .chunks_exact_mut(n)
                .zip(a.chunks_exact(k))
                .for_each(row_product),
        }

        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_multiply_matrices() {
        let a: Linear = "1 2 3
                         4 5 6"
            .parse()
            .unwrap();
        let b: Linear = "1 0
                         0 1
                         1 1"
        .parse()
        .unwrap();

        let c = a.matrix_product(&b, ComputeBackend::Serial);
        let expected: Linear = "4 5
                                10 11"
            .parse()
            .unwrap();

        assert_eq!(expected, c);
    }

    #[test]
    fn transposed_products_agree_with_explicit_transpose() {
        let rng = RngStrategy::testable(12345);
        let mut a = Linear::new(5, 7);
        let mut b = Linear::new(3, 7);
        a.initialize_as_layer(&LayerInitStrategy::Kaiming, 7, &rng);
        b.initialize_as_layer(&LayerInitStrategy::Kaiming, 7, &rng);

        let backend = ComputeBackend::Serial;
        assert_eq!(
            a.matrix_product(&b.transpose(), backend),
            a.matrix_product_rhs_transposed(&b, backend)
        );

        let mut c = Linear::new(5, 2);
        c.initialize_as_layer(&LayerInitStrategy::Kaiming, 5, &rng);
        assert_eq!(
            a.transpose().matrix_product(&c, backend),
            a.matrix_product_lhs_transposed(&c, backend)
        );
    }

    #[test]
    fn threadpool_backend_matches_serial_bitwise() {
        let rng = RngStrategy::testable(12345);
        let mut a = Linear::new(33, 718);
        let mut b = Linear::new(718, 128);
        a.initialize_as_layer(&LayerInitStrategy::Kaiming, 718, &rng);
        b.initialize_as_layer(&LayerInitStrategy::Kaiming, 718, &rng);

        let serial = a.matrix_product(&b, ComputeBackend::Serial);
        let threaded = a.matrix_product(&b, ComputeBackend::ThreadPool);

        assert_eq!(serial, threaded);
    }

    #[test]
    fn from_rows_rejects_ragged_rows() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        let err = Linear::from_rows(&rows).unwrap_err();

        assert_eq!(
            Some(&EncoderError::shape_mismatch("batch row", 2, 1)),
            err.downcast_ref::<EncoderError>()
        );
    }

    #[test]
    fn stack_and_flatten_are_inverse_shapes() {
        let bias: Linear = "1 2 3".parse().unwrap();
        let stacked = bias.iter().stack(4).collect();

        assert_eq!(4, stacked.count());
        assert_eq!(3, stacked.stride());

        let column_sums = stacked.iter_transpose().flatten_sum();
        let expected: Linear = "4
                                8
                                12"
        .parse()
        .unwrap();
        assert_eq!(expected, column_sums);
    }

    #[test]
    fn column_sums_of_zero_rows_keep_one_value_per_column() {
        let empty = Linear::new(0, 3);

        let column_sums = empty.iter_transpose().flatten_sum();
        assert_eq!((3, 1), (column_sums.count(), column_sums.stride()));
        assert_eq!(vec![0.0; 3], column_sums.values());

        let column_means = empty.iter_transpose().flatten_mean();
        assert_eq!(3, column_means.values().len());
    }
}
