use serde::{Deserialize, Serialize};

use super::RngStrategy;

/// Where the matrix products of a forward/backward pass run.
///
/// `ThreadPool` splits products by output row only, so every reduction is
/// summed in the same order as `Serial` and the two backends agree bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeBackend {
    Serial,
    ThreadPool,
}

impl ComputeBackend {
    /// The fastest backend compiled into this build.
    pub fn available() -> Self {
        if cfg!(feature = "threadpool") {
            Self::ThreadPool
        } else {
            Self::Serial
        }
    }
}

impl Default for ComputeBackend {
    fn default() -> Self {
        Self::available()
    }
}

impl std::fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeBackend::Serial => write!(f, "serial"),
            ComputeBackend::ThreadPool => write!(f, "threadpool"),
        }
    }
}

/// Per-run execution state, created once and handed to the network and
/// trainer explicitly.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    rng: RngStrategy,
    backend: ComputeBackend,
}

impl ExecutionContext {
    pub fn new(rng: RngStrategy, backend: ComputeBackend) -> Self {
        Self { rng, backend }
    }

    pub fn testable(seed: u32) -> Self {
        Self::new(RngStrategy::testable(seed), ComputeBackend::Serial)
    }

    pub fn with_backend(self, backend: ComputeBackend) -> Self {
        Self { backend, ..self }
    }

    pub fn rng(&self) -> &RngStrategy {
        &self.rng
    }

    pub fn backend(&self) -> ComputeBackend {
        self.backend
    }
}
