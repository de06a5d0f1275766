use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, metadata::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use plane::ml::{
    dataset::{DataLoader, DataTable, SampleSet, TableSelector},
    trainer::Trainer,
    BottleneckNetwork, BottleneckVariant, ComputeBackend, ExecutionContext, NodeValue,
    RngStrategy, GBC_FEATURE_COUNT, PANSS_TARGET_COUNT,
};

use config::{Cli, Command, TrainEncoderConfig};

mod config;

fn main() -> Result<()> {
    configure_logging()?;
    let cli = Cli::parse();

    match cli.command() {
        Command::TrainEncoder(config) => train_encoder(&config),
        Command::DescribeShapes => describe_shapes(),
    }
}

fn train_encoder(config: &TrainEncoderConfig) -> Result<()> {
    let config_json = serde_json::to_string_pretty(config)?;
    info!("Encoder training config: {}", config_json);

    let table = DataTable::from_csv_path(&config.input)?;
    let ids = table.column(&config.id_column)?;

    let selector = TableSelector::new(config.drop_columns.clone(), config.target_pattern.as_str());
    let samples = SampleSet::from_table(&table, &selector)?;
    if samples.input_width() != GBC_FEATURE_COUNT || samples.target_width() != PANSS_TARGET_COUNT {
        warn!(
            "Table has {} inputs and {} targets, GBC layout expects {} and {}",
            samples.input_width(),
            samples.target_width(),
            GBC_FEATURE_COUNT,
            PANSS_TARGET_COUNT
        );
    }

    let backend = if config.threads {
        ComputeBackend::ThreadPool
    } else {
        ComputeBackend::Serial
    };
    if config.threads && ComputeBackend::available() != ComputeBackend::ThreadPool {
        warn!("Thread pool backend not compiled in, running serially");
    }
    let context = ExecutionContext::new(RngStrategy::from_seed(config.seed), backend);

    let shape = config.variant.shape(
        samples.input_width(),
        samples.target_width(),
        config.activation_mode,
    )?;
    let network = BottleneckNetwork::new(shape, &context);
    info!(
        "Built {} network: [ {} ] with {} parameters on {} backend",
        config.variant,
        network.desc_pretty(),
        network.parameter_count(),
        context.backend()
    );

    let loader = DataLoader::shuffled(&samples, config.batch_size, context.rng());
    let (network, history) = Trainer::train(network, &loader, config.epochs, config.train_rate)?;
    if let Some(loss) = history.final_loss() {
        info!("Final epoch loss = {loss}");
    }

    let embedding = network.generate_embedding(&samples.inputs())?;
    let width = network.bottleneck_width();

    match &config.output {
        Some(path) => {
            let writer = csv::Writer::from_path(path)
                .with_context(|| format!("failed to create output file '{path}'"))?;
            write_embedding(writer, &config.id_column, &ids, &embedding, width)?;
            info!("Embedding CSV written to disk: {path}");
        }
        None => {
            let writer = csv::Writer::from_writer(io::stdout().lock());
            write_embedding(writer, &config.id_column, &ids, &embedding, width)?;
        }
    }

    Ok(())
}

fn describe_shapes() -> Result<()> {
    for variant in BottleneckVariant::all() {
        let network = BottleneckNetwork::new(variant.gbc_shape()?, &ExecutionContext::default());
        println!(
            "{variant}: {} ({} parameters)",
            network.desc_pretty(),
            network.parameter_count()
        );
    }
    Ok(())
}

fn write_embedding<W: io::Write>(
    mut writer: csv::Writer<W>,
    id_column: &str,
    ids: &[&str],
    embedding: &[Vec<NodeValue>],
    width: usize,
) -> Result<()> {
    let header =
        std::iter::once(id_column.to_string()).chain((0..width).map(|i| format!("dim_{i}")));
    writer.write_record(header)?;

    for (id, row) in ids.iter().zip(embedding) {
        let record = std::iter::once(id.to_string()).chain(row.iter().map(|x| x.to_string()));
        writer.write_record(record)?;
    }

    writer.flush()?;
    Ok(())
}

fn configure_logging() -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_csv_has_id_and_dim_columns() {
        let mut buffer = vec![];
        let ids = vec!["s01", "s02"];
        let embedding = vec![vec![0.5, 0.0], vec![1.25, 2.0]];

        write_embedding(
            csv::Writer::from_writer(&mut buffer),
            "id",
            &ids,
            &embedding,
            2,
        )
        .unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert_eq!("id,dim_0,dim_1\ns01,0.5,0\ns02,1.25,2\n", text);
    }

    #[test]
    fn empty_embedding_still_writes_header() {
        let mut buffer = vec![];

        write_embedding(csv::Writer::from_writer(&mut buffer), "subject", &[], &[], 3).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert_eq!("subject,dim_0,dim_1,dim_2\n", text);
    }
}
