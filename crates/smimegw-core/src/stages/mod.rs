//! Built-in stages
//!
//! `HeadersParser`, `Header`, `Hasher` and `Debugger` are the stock stages a
//! `save_process` string usually names; `Decrypt` (alias `SmimeExtract`)
//! is the S/MIME decryption stage.

mod debugger;
mod decrypt;
mod header;
mod hasher;
mod headers_parser;

pub use debugger::Debugger;
pub use decrypt::Decrypt;
pub use header::Header;
pub use hasher::Hasher;
pub use headers_parser::HeadersParser;

use crate::pipeline::{Extensions, PipelineError, Processor, StageRegistry};
use crate::smime::KeyStore;
use smimegw_common::{Config, Error};
use std::sync::Arc;
use tracing::info;

pub const HEADERS_PARSER: &str = "HeadersParser";
pub const HEADER: &str = "Header";
pub const HASHER: &str = "Hasher";
pub const DEBUGGER: &str = "Debugger";
pub const DECRYPT: &str = "Decrypt";
pub const SMIME_EXTRACT: &str = "SmimeExtract";

impl StageRegistry {
    /// Registry holding every built-in stage. `Decrypt` opens its key store
    /// from `backend.decryption_key_path`.
    pub fn with_builtins() -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        register_builtins(&mut registry, None)?;
        Ok(registry)
    }

    /// Registry holding every built-in stage, with `Decrypt` using `keys`
    pub fn with_key_store(keys: Arc<KeyStore>) -> Result<Self, PipelineError> {
        let mut registry = Self::new();
        register_builtins(&mut registry, Some(keys))?;
        Ok(registry)
    }
}

/// Register the built-in stages and the key store initializer
pub fn register_builtins(registry: &mut StageRegistry, keys: Option<Arc<KeyStore>>) -> Result<(), PipelineError> {
    registry.register(HEADERS_PARSER, |_| Ok(Arc::new(HeadersParser::new()) as Arc<dyn Processor>))?;
    registry.register(HEADER, |ctx| {
        Ok(Arc::new(Header::new(&ctx.config.backend.primary_mail_host)) as Arc<dyn Processor>)
    })?;
    registry.register(HASHER, |_| Ok(Arc::new(Hasher::new()) as Arc<dyn Processor>))?;
    registry.register(DEBUGGER, |ctx| {
        Ok(Arc::new(Debugger::new(ctx.config.backend.log_received_mails)) as Arc<dyn Processor>)
    })?;

    for name in [DECRYPT, SMIME_EXTRACT] {
        registry.register(name, move |ctx| {
            let keys = ctx
                .extensions
                .get::<Arc<KeyStore>>()
                .cloned()
                .ok_or_else(|| PipelineError::StageNotInitialized(name.to_string()))?;
            Ok(Arc::new(Decrypt::new(name, keys, &ctx.config.smime)) as Arc<dyn Processor>)
        })?;

        let keys = keys.clone();
        registry.add_stage_initializer(name, move |config, extensions| open_key_store(config, extensions, keys));
    }

    Ok(())
}

/// Put the key store into the extensions, once, however many decrypt aliases are configured
fn open_key_store(
    config: &Config,
    extensions: &mut Extensions,
    keys: Option<Arc<KeyStore>>,
) -> Result<(), PipelineError> {
    if extensions.contains::<Arc<KeyStore>>() {
        return Ok(());
    }

    let store = match keys {
        Some(store) => store,
        None => {
            let path = config.backend.decryption_key_path.as_ref().ok_or_else(|| {
                Error::Config("backend.decryption_key_path is required by the Decrypt stage".to_string())
            })?;
            let store = KeyStore::open_directory(path).map_err(|e| PipelineError::Initializer(e.to_string()))?;
            info!(path = %path.display(), "Opened decryption key directory");
            Arc::new(store)
        }
    };

    extensions.insert(store);
    Ok(())
}
