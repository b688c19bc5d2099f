//! Stage registry and one-time initialisation

use super::chain::{Chain, ReplyPolicy};
use super::stage::Processor;
use smimegw_common::Config;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Startup errors. Any of these keeps the gateway from accepting mail.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage already registered: {0}")]
    DuplicateStage(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage {0} is not initialized")]
    StageNotInitialized(String),

    #[error("Chain names no stages")]
    EmptyChain,

    #[error("Initializer failed: {0}")]
    Initializer(String),

    #[error(transparent)]
    Config(#[from] smimegw_common::Error),
}

/// Typed values produced by initializers for stage factories
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Store a value, returning the one it replaced
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// What a stage factory sees when it builds its stage
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub extensions: &'a Extensions,
}

/// Builds one stage instance
pub type StageFactory =
    Arc<dyn Fn(&StageContext<'_>) -> Result<Arc<dyn Processor>, PipelineError> + Send + Sync>;

type Initializer = Box<dyn FnOnce(&Config, &mut Extensions) -> Result<(), PipelineError> + Send>;

struct RegisteredStage {
    name: String,
    factory: StageFactory,
}

struct QueuedInitializer {
    /// Owning stage key; `None` runs for every chain
    stage: Option<String>,
    init: Initializer,
}

fn stage_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Process-scoped stage registry
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<String, RegisteredStage>,
    initializers: Vec<QueuedInitializer>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage factory under a case-insensitive name
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<(), PipelineError>
    where
        F: Fn(&StageContext<'_>) -> Result<Arc<dyn Processor>, PipelineError> + Send + Sync + 'static,
    {
        self.register_factory(name, Arc::new(factory))
    }

    /// Register an already shared factory (used for aliases)
    pub fn register_factory(&mut self, name: &str, factory: StageFactory) -> Result<(), PipelineError> {
        let key = stage_key(name);
        if key.is_empty() || key.contains('|') {
            return Err(PipelineError::Initializer(format!(
                "invalid stage name {:?}",
                name
            )));
        }
        if self.stages.contains_key(&key) {
            return Err(PipelineError::DuplicateStage(name.to_string()));
        }

        debug!(stage = %name, "Registered stage");
        self.stages.insert(
            key,
            RegisteredStage {
                name: name.trim().to_string(),
                factory,
            },
        );
        Ok(())
    }

    /// Queue an initializer that runs for every chain
    pub fn add_initializer<F>(&mut self, init: F)
    where
        F: FnOnce(&Config, &mut Extensions) -> Result<(), PipelineError> + Send + 'static,
    {
        self.initializers.push(QueuedInitializer {
            stage: None,
            init: Box::new(init),
        });
    }

    /// Queue an initializer that runs only when `stage` is part of the chain.
    ///
    /// Stages with an initializer can't be built unless it ran.
    pub fn add_stage_initializer<F>(&mut self, stage: &str, init: F)
    where
        F: FnOnce(&Config, &mut Extensions) -> Result<(), PipelineError> + Send + 'static,
    {
        self.initializers.push(QueuedInitializer {
            stage: Some(stage_key(stage)),
            init: Box::new(init),
        });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(&stage_key(name))
    }

    /// Run the queued initializers once, in registration order.
    ///
    /// Unknown names in `backend.save_process` fail here, before any
    /// initializer has run.
    pub fn initialize(self, config: &Config) -> Result<InitializedRegistry, PipelineError> {
        config.validate()?;

        let mut selected = HashSet::new();
        for name in config.backend.stage_names() {
            let key = stage_key(&name);
            if !self.stages.contains_key(&key) {
                return Err(PipelineError::UnknownStage(name));
            }
            selected.insert(key);
        }

        let mut extensions = Extensions::default();
        let mut pending: HashSet<String> = HashSet::new();
        let mut ran = 0usize;

        for queued in self.initializers {
            match queued.stage {
                Some(stage) if !selected.contains(&stage) => {
                    pending.insert(stage);
                }
                _ => {
                    (queued.init)(config, &mut extensions)?;
                    ran += 1;
                }
            }
        }

        info!(initializers = ran, stages = self.stages.len(), "Stage registry initialized");

        Ok(InitializedRegistry {
            stages: self.stages,
            uninitialized: pending,
            config: Arc::new(config.clone()),
            extensions,
        })
    }
}

/// A registry whose initializers have completed; the only way to build chains
pub struct InitializedRegistry {
    stages: HashMap<String, RegisteredStage>,
    uninitialized: HashSet<String>,
    config: Arc<Config>,
    extensions: Extensions,
}

impl InitializedRegistry {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Build the chain named by `backend.save_process`
    pub fn build_configured(&self) -> Result<Chain, PipelineError> {
        self.build(&self.config.backend.save_process)
    }

    /// Build a chain from a pipe-delimited list, outermost stage first
    pub fn build(&self, process: &str) -> Result<Chain, PipelineError> {
        let names: Vec<&str> = process
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            return Err(PipelineError::EmptyChain);
        }

        let ctx = StageContext {
            config: &self.config,
            extensions: &self.extensions,
        };

        let mut stages = Vec::with_capacity(names.len());
        let mut stage_names = Vec::with_capacity(names.len());
        for name in names {
            let key = stage_key(name);
            let registered = self
                .stages
                .get(&key)
                .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))?;
            if self.uninitialized.contains(&key) {
                return Err(PipelineError::StageNotInitialized(registered.name.clone()));
            }
            stages.push((registered.factory)(&ctx)?);
            stage_names.push(registered.name.clone());
        }

        Ok(Chain::new(
            stages,
            stage_names,
            ReplyPolicy::from_config(&self.config.smime),
        ))
    }
}
