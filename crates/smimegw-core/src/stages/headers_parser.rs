//! HeadersParser stage: extracts the common headers into metadata

use crate::envelope::Envelope;
use crate::pipeline::{Next, Processor, StageResult, Task};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

pub struct HeadersParser;

impl HeadersParser {
    pub fn new() -> Self {
        Self
    }

    fn parse(envelope: &Envelope) -> Option<serde_json::Value> {
        let mut raw = envelope.headers().to_bytes();
        raw.extend_from_slice(b"\r\n");

        let parsed = mail_parser::MessageParser::default().parse(&raw[..])?;

        let from = parsed
            .from()
            .and_then(|a| a.first())
            .and_then(|a| a.address())
            .map(|s| s.to_string());

        Some(json!({
            "subject": parsed.subject(),
            "message_id": parsed.message_id(),
            "from": from,
            "date": parsed.date().map(|d| d.to_rfc3339()),
            "header_count": envelope.headers().len(),
        }))
    }
}

impl Default for HeadersParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for HeadersParser {
    fn name(&self) -> &str {
        super::HEADERS_PARSER
    }

    async fn process(&self, envelope: &mut Envelope, task: Task, next: Next<'_>) -> StageResult {
        if task == Task::SaveMail {
            match Self::parse(envelope) {
                Some(headers) => {
                    debug!(envelope_id = envelope.id(), "Parsed message headers");
                    envelope.set_metadata(self.name(), headers);
                }
                None => warn!(envelope_id = envelope.id(), "Could not parse message headers"),
            }
        }

        next.run(envelope, task).await
    }
}
