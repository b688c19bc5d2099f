//! Debugger stage: logs what passes through

use crate::envelope::Envelope;
use crate::pipeline::{Next, Processor, StageResult, Task};
use async_trait::async_trait;
use tracing::{debug, info};

pub struct Debugger {
    log_received_mails: bool,
}

impl Debugger {
    pub fn new(log_received_mails: bool) -> Self {
        Self { log_received_mails }
    }
}

#[async_trait]
impl Processor for Debugger {
    fn name(&self) -> &str {
        super::DEBUGGER
    }

    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
        let from = envelope.from().map(|f| f.to_string()).unwrap_or_default();
        let recipients: Vec<String> = envelope.recipients().iter().map(|r| r.to_string()).collect();

        debug!(
            envelope_id = envelope.id(),
            task = %task,
            from = %from,
            recipients = ?recipients,
            "Debugger saw task"
        );

        if self.log_received_mails && task == Task::SaveMail {
            info!(
                envelope_id = envelope.id(),
                from = %from,
                recipients = ?recipients,
                headers = %String::from_utf8_lossy(&envelope.headers().to_bytes()),
                body_bytes = envelope.body().len(),
                "Received mail"
            );
        }

        let verdict = next.run(envelope, task).await;
        debug!(envelope_id = envelope.id(), task = %task, ok = verdict.is_ok(), "Debugger saw result");
        verdict
    }
}
