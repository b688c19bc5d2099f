//! Hasher stage: a stable per-message hash for trace ids

use crate::envelope::Envelope;
use crate::pipeline::{Next, Processor, StageResult, Task};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};

pub struct Hasher;

impl Hasher {
    pub fn new() -> Self {
        Self
    }

    /// SHA-256 over sender, recipients, subject and transaction id
    pub fn hash(envelope: &Envelope) -> String {
        let mut hasher = Sha256::new();
        if let Some(from) = envelope.from() {
            hasher.update(from.to_string().as_bytes());
        }
        hasher.update(b"\0");
        for rcpt in envelope.recipients() {
            hasher.update(rcpt.identity().as_bytes());
            hasher.update(b"\0");
        }
        if let Some(subject) = envelope.headers().get("Subject") {
            hasher.update(subject.as_bytes());
        }
        hasher.update(envelope.id().to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// Hash recorded for this envelope, if the stage ran
    pub fn recorded(envelope: &Envelope) -> Option<&str> {
        envelope
            .metadata(super::HASHER)
            .and_then(|m| m.get("hash"))
            .and_then(|h| h.as_str())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for Hasher {
    fn name(&self) -> &str {
        super::HASHER
    }

    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
        if task == Task::SaveMail {
            let hash = Self::hash(envelope);
            envelope.set_metadata(self.name(), json!({ "hash": hash }));
        }
        next.run(envelope, task).await
    }
}
