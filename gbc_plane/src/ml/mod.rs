pub mod cell;
pub mod context;
pub mod dataset;
pub mod embeddings;
mod error;
mod network;
mod random;
pub mod trainer;

pub use context::{ComputeBackend, ExecutionContext};
pub use error::EncoderError;
pub use network::*;
pub use random::*;
