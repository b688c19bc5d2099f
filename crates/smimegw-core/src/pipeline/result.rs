//! Stage verdicts and the replies they turn into

use crate::smime::KeyLoadError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SMTP-shaped reply handed back to the mail server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub code: u16,
    pub enhanced: Option<String>,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, enhanced: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced: enhanced.map(str::to_string),
            message: message.into(),
        }
    }

    /// `250 2.0.0 OK`
    pub fn ok() -> Self {
        Self::new(250, Some("2.0.0"), "OK")
    }

    /// 4xx: the sender should retry
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// 5xx: the sender should give up
    pub fn is_permanent(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.enhanced {
            Some(enhanced) => write!(f, "{} {} {}", self.code, enhanced, self.message),
            None => write!(f, "{} {}", self.code, self.message),
        }
    }
}

/// Outcome of one stage, or of a whole chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Accept, optionally with an informational reply
    Accept(Option<Reply>),
    /// Reject; no further stage runs for this task
    Reject(Reply),
    /// No opinion; defer to the rest of the chain
    PassThrough,
}

impl Verdict {
    fn rank(&self) -> u8 {
        match self {
            Verdict::PassThrough => 0,
            Verdict::Accept(_) => 1,
            Verdict::Reject(_) => 2,
        }
    }

    /// Combine a stage's own verdict with its inner chain's.
    ///
    /// Reject beats Accept beats PassThrough; on a tie the inner verdict wins.
    pub fn most_restrictive(self, inner: Verdict) -> Verdict {
        if self.rank() > inner.rank() {
            self
        } else {
            inner
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject(_))
    }
}

/// Why a task failed, as seen by local logs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoMatchingRecipient,
    DecryptionIntegrity,
    KeyLoad,
    Transient,
    Cancelled,
    DeadlineExceeded,
    Internal,
}

/// Errors a stage may return instead of a verdict
#[derive(Debug, Error)]
pub enum StageError {
    #[error("no recipient key can decrypt this message (recipients: {})", .recipients.join(", "))]
    NoMatchingRecipient { recipients: Vec<String> },

    #[error("decryption failed: {0}")]
    DecryptionIntegrity(String),

    #[error("key load failed: {0}")]
    KeyLoad(#[from] KeyLoadError),

    #[error("transient stage failure: {0}")]
    Transient(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StageError::NoMatchingRecipient { .. } => FailureKind::NoMatchingRecipient,
            StageError::DecryptionIntegrity(_) => FailureKind::DecryptionIntegrity,
            StageError::KeyLoad(_) => FailureKind::KeyLoad,
            StageError::Transient(_) | StageError::Other(_) => FailureKind::Transient,
            StageError::Cancelled => FailureKind::Cancelled,
            StageError::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Result type returned by stages
pub type StageResult = Result<Verdict, StageError>;

/// What the mail server receives for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub verdict: Verdict,
    pub failure: Option<FailureKind>,
}

impl TaskResult {
    pub fn from_verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, reply: Reply) -> Self {
        Self {
            verdict: Verdict::Reject(reply),
            failure: Some(kind),
        }
    }

    pub fn is_accepted(&self) -> bool {
        !self.verdict.is_reject()
    }

    /// Reply to put on the wire
    pub fn reply(&self) -> Reply {
        match &self.verdict {
            Verdict::Accept(Some(reply)) | Verdict::Reject(reply) => reply.clone(),
            Verdict::Accept(None) | Verdict::PassThrough => Reply::ok(),
        }
    }
}
