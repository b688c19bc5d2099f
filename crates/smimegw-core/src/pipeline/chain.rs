//! Immutable stage chain

use super::result::{FailureKind, Reply, StageError, TaskResult};
use super::stage::{Next, Processor};
use super::task::Task;
use crate::envelope::Envelope;
use smimegw_common::config::SmimeConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Maps stage errors to wire replies. Internal detail never reaches the reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPolicy {
    pub no_matching_recipient_code: u16,
    pub decryption_failure_code: u16,
}

impl Default for ReplyPolicy {
    fn default() -> Self {
        Self::from_config(&SmimeConfig::default())
    }
}

impl ReplyPolicy {
    pub fn from_config(config: &SmimeConfig) -> Self {
        Self {
            no_matching_recipient_code: config.no_matching_recipient_code,
            decryption_failure_code: config.decryption_failure_code,
        }
    }

    pub fn reply_for(&self, kind: FailureKind) -> Reply {
        match kind {
            FailureKind::NoMatchingRecipient => {
                let code = self.no_matching_recipient_code;
                Reply::new(
                    code,
                    Some(&format!("{}.7.1", code / 100)),
                    "No applicable recipient key for encrypted message",
                )
            }
            FailureKind::DecryptionIntegrity => {
                let code = self.decryption_failure_code;
                Reply::new(
                    code,
                    Some(&format!("{}.7.5", code / 100)),
                    "Encrypted message could not be decrypted",
                )
            }
            FailureKind::KeyLoad | FailureKind::Transient => {
                Reply::new(451, Some("4.3.0"), "Temporary server error, try again later")
            }
            FailureKind::Cancelled | FailureKind::DeadlineExceeded => {
                Reply::new(451, Some("4.4.2"), "Processing aborted, try again later")
            }
            FailureKind::Internal => Reply::new(554, Some("5.3.0"), "Internal server error"),
        }
    }
}

/// An ordered composition of stages, fixed once built
#[derive(Clone)]
pub struct Chain {
    stages: Arc<[Arc<dyn Processor>]>,
    names: Arc<[String]>,
    replies: ReplyPolicy,
}

impl Chain {
    pub(crate) fn new(stages: Vec<Arc<dyn Processor>>, names: Vec<String>, replies: ReplyPolicy) -> Self {
        Self {
            stages: stages.into(),
            names: names.into(),
            replies,
        }
    }

    /// Stage names, outermost first
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn reply_policy(&self) -> &ReplyPolicy {
        &self.replies
    }

    /// Run one task through the chain
    pub async fn run(&self, envelope: &mut Envelope, task: Task) -> TaskResult {
        self.run_with_cancel(envelope, task, &CancellationToken::new())
            .await
    }

    /// Run one task, abandoning it at the next stage boundary once `cancel` fires
    pub async fn run_with_cancel(
        &self,
        envelope: &mut Envelope,
        task: Task,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let next = Next::new(&self.stages, cancel);

        match next.run(envelope, task).await {
            Ok(verdict) => {
                debug!(envelope_id = envelope.id(), task = %task, verdict = ?verdict, "Chain completed");
                TaskResult::from_verdict(verdict)
            }
            Err(err) => {
                let kind = err.kind();
                match kind {
                    FailureKind::Internal => {
                        error!(envelope_id = envelope.id(), task = %task, error = %err, "Stage failed")
                    }
                    FailureKind::Cancelled => {
                        debug!(envelope_id = envelope.id(), task = %task, "Chain run cancelled")
                    }
                    _ => warn!(envelope_id = envelope.id(), task = %task, error = %err, "Stage rejected task"),
                }
                TaskResult::failed(kind, self.replies.reply_for(kind))
            }
        }
    }

    /// Shut every stage down, innermost first
    pub async fn shutdown(&self) -> Result<(), StageError> {
        let mut first_error = None;
        for stage in self.stages.iter().rev() {
            if let Err(e) = stage.shutdown().await {
                warn!(stage = stage.name(), error = %e, "Stage shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("stages", &self.names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Next, StageResult, Verdict};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Records entry and exit, optionally acting on SaveMail
    struct Probe {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        action: Action,
    }

    #[derive(Clone)]
    enum Action {
        Delegate,
        Accept,
        Reject,
        Fail(FailureKind),
    }

    #[async_trait]
    impl Processor for Probe {
        fn name(&self) -> &str {
            self.name
        }

        async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let result = match (&self.action, task) {
                (Action::Reject, Task::SaveMail) => {
                    Ok(Verdict::Reject(Reply::new(550, None, self.name)))
                }
                (Action::Accept, Task::SaveMail) => {
                    let own = Verdict::Accept(Some(Reply::new(250, None, self.name)));
                    next.delegate(envelope, task, own).await
                }
                (Action::Fail(kind), Task::SaveMail) => Err(match kind {
                    FailureKind::Internal => StageError::Internal("secret detail".to_string()),
                    _ => StageError::Transient("secret detail".to_string()),
                }),
                _ => next.run(envelope, task).await,
            };
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            result
        }
    }

    fn build_chain(actions: &[(&'static str, Action)]) -> (Chain, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Processor>> = actions
            .iter()
            .map(|(name, action)| {
                Arc::new(Probe {
                    name: *name,
                    log: log.clone(),
                    action: action.clone(),
                }) as Arc<dyn Processor>
            })
            .collect();
        let names = actions.iter().map(|(n, _)| n.to_string()).collect();
        (Chain::new(stages, names, ReplyPolicy::default()), log)
    }

    #[tokio::test]
    async fn test_stages_run_outer_to_inner() {
        let (chain, log) = build_chain(&[("a", Action::Delegate), ("b", Action::Delegate)]);
        let mut envelope = Envelope::new(1);

        let result = chain.run(&mut envelope, Task::SaveMail).await;
        assert!(result.is_accepted());
        assert_eq!(result.reply(), Reply::ok());
        assert_eq!(*log.lock().unwrap(), vec!["enter a", "enter b", "exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_reject_halts_chain() {
        let (chain, log) = build_chain(&[
            ("a", Action::Accept),
            ("b", Action::Reject),
            ("c", Action::Delegate),
        ]);
        let mut envelope = Envelope::new(1);

        let result = chain.run(&mut envelope, Task::SaveMail).await;
        assert_eq!(result.verdict, Verdict::Reject(Reply::new(550, None, "b")));
        assert_eq!(result.failure, None);
        assert_eq!(*log.lock().unwrap(), vec!["enter a", "enter b", "exit b", "exit a"]);
    }

    #[tokio::test]
    async fn test_accept_is_kept_when_inner_passes() {
        let (chain, _) = build_chain(&[("a", Action::Accept), ("b", Action::Delegate)]);
        let mut envelope = Envelope::new(1);

        let result = chain.run(&mut envelope, Task::SaveMail).await;
        assert_eq!(result.reply(), Reply::new(250, None, "a"));
    }

    #[tokio::test]
    async fn test_other_tasks_pass_through() {
        let (chain, log) = build_chain(&[("a", Action::Reject)]);
        let mut envelope = Envelope::new(1);

        let result = chain.run(&mut envelope, Task::ValidateRecipient).await;
        assert_eq!(result.verdict, Verdict::PassThrough);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stage_errors_become_generic_replies() {
        let (chain, log) = build_chain(&[("a", Action::Delegate), ("b", Action::Fail(FailureKind::Transient))]);
        let mut envelope = Envelope::new(1);

        let result = chain.run(&mut envelope, Task::SaveMail).await;
        assert_eq!(result.failure, Some(FailureKind::Transient));
        let reply = result.reply();
        assert_eq!(reply.code, 451);
        assert!(!reply.message.contains("secret"));
        // The outer stage still unwinds normally
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("exit a"));

        let (chain, _) = build_chain(&[("a", Action::Fail(FailureKind::Internal))]);
        let result = chain.run(&mut envelope, Task::SaveMail).await;
        assert_eq!(result.reply().code, 554);
        assert!(!result.reply().message.contains("secret"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let (chain, log) = build_chain(&[("a", Action::Delegate)]);
        let mut envelope = Envelope::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = chain.run_with_cancel(&mut envelope, Task::SaveMail, &cancel).await;
        assert_eq!(result.failure, Some(FailureKind::Cancelled));
        assert!(result.reply().is_transient());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_reply_policy_codes() {
        let policy = ReplyPolicy {
            no_matching_recipient_code: 450,
            decryption_failure_code: 554,
        };
        let reply = policy.reply_for(FailureKind::NoMatchingRecipient);
        assert_eq!(reply.code, 450);
        assert_eq!(reply.enhanced.as_deref(), Some("4.7.1"));
        assert_ne!(
            policy.reply_for(FailureKind::NoMatchingRecipient),
            policy.reply_for(FailureKind::DecryptionIntegrity)
        );
    }
}
