//! Stage capability and chain continuation

use super::result::{StageError, StageResult, Verdict};
use super::task::Task;
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A composable unit of the chain.
///
/// A stage wraps everything after it: it can act before delegating to
/// `next`, act on the inner verdict afterwards, or return a reject without
/// delegating at all.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Registered stage name
    fn name(&self) -> &str;

    /// Handle one task for one envelope
    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult;

    /// Release resources when the gateway shuts down
    async fn shutdown(&self) -> Result<(), StageError> {
        Ok(())
    }
}

/// The remainder of the chain after the current stage
pub struct Next<'a> {
    stages: &'a [Arc<dyn Processor>],
    cancel: &'a CancellationToken,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Processor>], cancel: &'a CancellationToken) -> Self {
        Self { stages, cancel }
    }

    /// Run the inner chain. The end of the chain passes through.
    pub async fn run(self, envelope: &mut Envelope, task: Task) -> StageResult {
        if self.cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next::new(rest, self.cancel);
                stage.process(envelope, task, next).await
            }
            None => Ok(Verdict::PassThrough),
        }
    }

    /// Run the inner chain and merge its verdict with `own`
    pub async fn delegate(self, envelope: &mut Envelope, task: Task, own: Verdict) -> StageResult {
        if own.is_reject() {
            return Ok(own);
        }
        let inner = self.run(envelope, task).await?;
        Ok(own.most_restrictive(inner))
    }

    /// Stages left after this point
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}
