use anyhow::Result;
use tracing::debug;

use super::{linear::Linear, BottleneckNetwork, EncoderError, NodeValue};

/// Maps raw feature rows to their bottleneck coordinates, one output row per
/// input row. Targets are not needed and the network is left untouched.
pub fn generate_embedding<R: AsRef<[NodeValue]>>(
    network: &BottleneckNetwork,
    inputs: &[R],
) -> Result<Vec<Vec<NodeValue>>> {
    if inputs.is_empty() {
        return Ok(vec![]);
    }

    let width = network.input_width();
    if let Some(row) = inputs.iter().find(|row| row.as_ref().len() != width) {
        Err(EncoderError::shape_mismatch(
            "network input",
            width,
            row.as_ref().len(),
        ))?;
    }

    let inputs = Linear::from_rows(inputs)?;
    let embedding = network.embed(&inputs)?;
    debug!(
        "Generated embedding of {} rows with width {}",
        embedding.count(),
        embedding.stride()
    );

    Ok(embedding.to_rows())
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use crate::ml::{
        BottleneckVariant, EncoderError, ExecutionContext, RngStrategy, GBC_FEATURE_COUNT, RNG,
    };

    use super::*;

    fn random_rows(count: usize, width: usize, rng: &RngStrategy) -> Vec<Vec<NodeValue>> {
        (0..count)
            .map(|_| (0..width).map(|_| rng.rand()).collect())
            .collect()
    }

    #[test]
    fn embedding_has_one_row_per_input_at_bottleneck_width() {
        let context = ExecutionContext::testable(12345);
        let inputs = random_rows(7, GBC_FEATURE_COUNT, context.rng());

        for variant in BottleneckVariant::all() {
            let network = BottleneckNetwork::from_variant(variant, &context).unwrap();
            let embedding = generate_embedding(&network, &inputs).unwrap();

            assert_eq!(7, embedding.len());
            assert!(embedding
                .iter()
                .all(|row| row.len() == variant.bottleneck_width()));
        }
    }

    #[test]
    fn embedding_is_repeatable_and_leaves_network_unchanged() {
        let context = ExecutionContext::testable(12345);
        let network = BottleneckNetwork::from_variant(BottleneckVariant::Deep3D, &context).unwrap();
        let before = network.clone();
        let inputs = random_rows(4, GBC_FEATURE_COUNT, context.rng());

        let first = network.generate_embedding(&inputs).unwrap();
        let second = network.generate_embedding(&inputs).unwrap();

        assert_eq!(first, second);
        assert_eq!(before, network);
    }

    #[test]
    fn embedding_matches_row_wise_embed() {
        let context = ExecutionContext::testable(12345);
        let network =
            BottleneckNetwork::from_variant(BottleneckVariant::Shallow2D, &context).unwrap();
        let inputs = random_rows(3, GBC_FEATURE_COUNT, context.rng());

        let embedding = generate_embedding(&network, &inputs).unwrap();

        for (row, expected) in inputs.iter().zip(&embedding) {
            let actual = network.embed_row(row.as_slice().into()).unwrap();
            assert_eq!(expected, &actual.to_vec());
        }
    }

    #[test]
    fn empty_input_gives_empty_embedding() {
        let context = ExecutionContext::testable(12345);
        let network =
            BottleneckNetwork::from_variant(BottleneckVariant::Shallow3D, &context).unwrap();
        let inputs: Vec<Vec<NodeValue>> = vec![];

        assert!(generate_embedding(&network, &inputs).unwrap().is_empty());
    }

    #[test]
    fn wrong_input_width_is_rejected() {
        let context = ExecutionContext::testable(12345);
        let network =
            BottleneckNetwork::from_variant(BottleneckVariant::Shallow2D, &context).unwrap();
        let inputs = vec![vec![0.5; 10]];

        let err = generate_embedding(&network, &inputs).unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch(
                "network input",
                GBC_FEATURE_COUNT,
                10
            )),
            err.downcast_ref::<EncoderError>()
        );
    }

    #[test]
    fn zero_width_row_is_reported_as_input_mismatch() {
        let context = ExecutionContext::testable(12345);
        let network =
            BottleneckNetwork::from_variant(BottleneckVariant::Deep2D, &context).unwrap();
        let mut inputs = random_rows(2, GBC_FEATURE_COUNT, context.rng());
        inputs.push(vec![]);

        let err = generate_embedding(&network, &inputs).unwrap_err();
        assert_eq!(
            Some(&EncoderError::shape_mismatch(
                "network input",
                GBC_FEATURE_COUNT,
                0
            )),
            err.downcast_ref::<EncoderError>()
        );
    }
}
