//! Processing pipeline
//!
//! Stages are registered by name, initialised once against the resolved
//! configuration, then composed into an immutable chain that every task
//! of every transaction runs through.

mod chain;
mod gateway;
mod registry;
mod result;
mod stage;
mod task;

pub use chain::{Chain, ReplyPolicy};
pub use gateway::Gateway;
pub use registry::{
    Extensions, InitializedRegistry, PipelineError, StageContext, StageFactory, StageRegistry,
};
pub use result::{FailureKind, Reply, StageError, StageResult, TaskResult, Verdict};
pub use stage::{Next, Processor};
pub use task::Task;
