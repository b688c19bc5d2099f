//! Header stage: trace headers for accepted mail

use super::Hasher;
use crate::envelope::Envelope;
use crate::pipeline::{Next, Processor, StageResult, Task};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

/// Adds `Delivered-To` and `Received` once the inner stages accepted the
/// message, so the trace id can come from `Hasher` further in.
pub struct Header {
    hostname: String,
}

impl Header {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
        }
    }

    fn received(&self, envelope: &Envelope) -> String {
        let helo = envelope.helo().unwrap_or("unknown");
        let ip = envelope.remote_ip().unwrap_or("unknown");
        let id = Hasher::recorded(envelope)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:016x}", envelope.id()));
        format!(
            "from {} ({} [{}]) by {} with SMTP id {}@{}; {}",
            helo,
            helo,
            ip,
            self.hostname,
            id,
            self.hostname,
            Utc::now().to_rfc2822()
        )
    }
}

#[async_trait]
impl Processor for Header {
    fn name(&self) -> &str {
        super::HEADER
    }

    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
        if task != Task::SaveMail {
            return next.run(envelope, task).await;
        }

        let verdict = next.run(envelope, task).await?;
        if verdict.is_reject() {
            return Ok(verdict);
        }

        let received = self.received(envelope);
        envelope.headers_mut().prepend("Received", &received);
        if let Some(rcpt) = envelope.recipients().first().map(|r| r.to_string()) {
            envelope.headers_mut().prepend("Delivered-To", &rcpt);
        }
        debug!(envelope_id = envelope.id(), "Added trace headers");

        Ok(verdict)
    }
}
