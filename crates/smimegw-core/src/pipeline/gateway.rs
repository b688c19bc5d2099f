//! Gateway facade invoked by the mail server

use super::chain::Chain;
use super::registry::{PipelineError, StageRegistry};
use super::result::{FailureKind, TaskResult};
use super::task::Task;
use crate::envelope::Envelope;
use smimegw_common::Config;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the chain and the bounded worker pool.
///
/// The mail server calls [`Gateway::run_task`] once per lifecycle event of
/// each transaction; transactions are independent and may run concurrently.
pub struct Gateway {
    chain: Chain,
    workers: Arc<Semaphore>,
    worker_count: usize,
    next_id: AtomicU64,
    deadline: Option<Duration>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Validate configuration, run initializers and build the configured chain
    pub fn start(config: &Config, registry: StageRegistry) -> Result<Self, PipelineError> {
        let initialized = registry.initialize(config)?;
        let chain = initialized.build_configured()?;

        let worker_count = config.backend.save_workers_size;
        let deadline = match config.backend.transaction_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        info!(
            chain = %chain.names().join("|"),
            workers = worker_count,
            "Gateway started"
        );

        Ok(Self {
            chain,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            next_id: AtomicU64::new(1),
            deadline,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Allocate the next transaction id
    pub fn next_transaction_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start a new, empty transaction
    pub fn new_envelope(&self) -> Envelope {
        Envelope::new(self.next_transaction_id())
    }

    /// Run one task for one envelope
    pub async fn run_task(&self, envelope: &mut Envelope, task: Task) -> TaskResult {
        self.run_task_with_cancel(envelope, task, &CancellationToken::new())
            .await
    }

    /// Run one task; `cancel` abandons it at the next stage boundary
    pub async fn run_task_with_cancel(
        &self,
        envelope: &mut Envelope,
        task: Task,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let replies = self.chain.reply_policy();

        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(envelope_id = envelope.id(), task = %task, "Gateway is shut down");
                return TaskResult::failed(
                    FailureKind::Transient,
                    replies.reply_for(FailureKind::Transient),
                );
            }
        };

        // Caller cancellation is honoured at stage boundaries; shutdown abandons the run
        let run = async {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    TaskResult::failed(FailureKind::Cancelled, replies.reply_for(FailureKind::Cancelled))
                }
                result = self.chain.run_with_cancel(envelope, task, cancel) => result,
            }
        };

        match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(task = %task, deadline_secs = deadline.as_secs(), "Task exceeded deadline");
                    TaskResult::failed(
                        FailureKind::DeadlineExceeded,
                        replies.reply_for(FailureKind::DeadlineExceeded),
                    )
                }
            },
            None => run.await,
        }
    }

    /// Stop accepting work, cancel in-flight runs and shut the stages down
    pub async fn shutdown(&self) {
        info!("Shutting down gateway");
        self.workers.close();
        self.shutdown.cancel();
        if let Err(e) = self.chain.shutdown().await {
            warn!(error = %e, "Gateway shutdown finished with errors");
        }
    }
}
