//! smimegw core - mail processing pipeline and S/MIME decryption
//!
//! The mail server hands every transaction to a [`Gateway`], which runs it
//! through an ordered chain of stages built from `backend.save_process`.
//! The `Decrypt` stage replaces S/MIME enveloped bodies with their plaintext
//! using the recipients' private keys.

pub mod envelope;
pub mod pipeline;
pub mod smime;
pub mod stages;

pub use envelope::{Envelope, HeaderBlock};
pub use pipeline::{
    Chain, FailureKind, Gateway, Next, PipelineError, Processor, Reply, StageError, StageRegistry,
    StageResult, Task, TaskResult, Verdict,
};
pub use smime::{DirectoryKeySource, KeyLoadError, KeyMaterial, KeySource, KeyStore, MemoryKeySource};
