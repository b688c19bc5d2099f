//! Lifecycle tasks

use serde::{Deserialize, Serialize};

/// Lifecycle event the pipeline is invoked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// A RCPT TO was received
    ValidateRecipient,
    /// DATA completed; the message is to be processed and handed on
    SaveMail,
    /// The connection is going away
    Close,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Task::ValidateRecipient => "validate_recipient",
            Task::SaveMail => "save_mail",
            Task::Close => "close",
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
