pub mod backend;
pub mod host;
pub mod kernels;
pub mod orchestrator;
pub mod parse_gate;
pub mod vcs;

pub use backend::{Backend, BackendConfig, CliBackend};
pub use kernels::{KernelRegistry, StageKernel};
pub use orchestrator::{ConvergenceGuards, Orchestrator};
