use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use plane::ml::{BottleneckVariant, NetworkActivationMode, NodeValue};

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct TrainEncoderConfig {
    #[arg(short = 'i', long)]
    pub input: String,

    #[arg(short = 'v', long, default_value_t = BottleneckVariant::Shallow2D)]
    pub variant: BottleneckVariant,

    #[arg(short = 'c', long, default_value_t = 10)]
    pub epochs: usize,

    #[arg(short = 'b', long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(short = 'r', long, default_value_t = 0.01)]
    pub train_rate: NodeValue,

    #[arg(short = 'm', long, default_value_t = NetworkActivationMode::RelU)]
    pub activation_mode: NetworkActivationMode,

    #[arg(short = 's', long, default_value = None)]
    #[serde(default)]
    pub seed: Option<u32>,

    #[arg(short = 'p', long, default_value = "PANSS")]
    pub target_pattern: String,

    #[arg(short = 'd', long, value_delimiter = ',', default_value = "Group,id")]
    pub drop_columns: Vec<String>,

    #[arg(short = 'I', long, default_value = "id")]
    pub id_column: String,

    #[arg(short = 'o', long, default_value = None)]
    #[serde(default)]
    pub output: Option<String>,

    #[arg(short = 't', long, default_value_t = false)]
    #[serde(default)]
    pub threads: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "embed", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    #[command(name = "train", arg_required_else_help = true)]
    TrainEncoder(TrainEncoderConfig),

    /// Print the stage layout of every bottleneck variant
    #[command(name = "shapes")]
    DescribeShapes,
}
