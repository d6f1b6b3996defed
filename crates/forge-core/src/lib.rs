pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod finalize;
pub mod prompt;
pub mod protocol;
pub mod review;
pub mod transitions;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
pub use config::WorkflowConfig;
pub use transitions::TransitionTable;
pub use types::*;
