//! Step discovery & metadata (spec §4.4.1) and the declarative capability
//! sets that replace the source's parameter-name reflection (spec §9:
//! "declarative step descriptors ... an enum set ... and a type-erased
//! invoke closure").

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::model::DEFAULT_PRIORITY;

use super::context::StepContext;
use super::yields::{StepHandle, Yield};

/// The values a step's signature may ask the runtime to inject (spec §4.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Response,
    Request,
    Previous,
    Accumulated,
    Aux,
    Text,
    Json,
    Page,
    LocalFile,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error("unknown continuation: {0}")]
    UnknownContinuation(String),

    #[error("step {step} declares unsupported capability {capability:?} for this request kind")]
    UnsupportedCapability { step: String, capability: Capability },

    #[error(transparent)]
    Parse(#[from] crate::parser::ParseError),

    #[error("scraper-authoring error in step {step}: {message}")]
    Authoring { step: String, message: String },
}

type InvokeFn = dyn Fn(&StepContext) -> Result<Vec<Yield>, StepError> + Send + Sync;

/// A registered step: its metadata (spec §4.4.1) plus the type-erased
/// closure the Step Runtime calls with a prepared [`StepContext`].
#[derive(Clone)]
pub struct StepDescriptor {
    pub name: String,
    pub priority: i64,
    pub encoding: String,
    pub capabilities: HashSet<Capability>,
    pub auto_await_timeout_ms: Option<u64>,
    invoke: Arc<InvokeFn>,
}

impl StepDescriptor {
    pub fn handle(&self) -> StepHandle {
        StepHandle {
            name: self.name.clone(),
            default_priority: self.priority,
        }
    }
}

/// Builder for registering a step (spec §9: "explicit registration builder").
pub struct StepBuilder {
    name: String,
    priority: i64,
    encoding: String,
    capabilities: HashSet<Capability>,
    auto_await_timeout_ms: Option<u64>,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            encoding: "utf-8".into(),
            capabilities: HashSet::new(),
            auto_await_timeout_ms: None,
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn needs(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn auto_await_timeout_ms(mut self, ms: u64) -> Self {
        self.auto_await_timeout_ms = Some(ms);
        self
    }

    pub fn build(
        self,
        invoke: impl Fn(&StepContext) -> Result<Vec<Yield>, StepError> + Send + Sync + 'static,
    ) -> StepDescriptor {
        StepDescriptor {
            name: self.name,
            priority: self.priority,
            encoding: self.encoding,
            capabilities: self.capabilities,
            auto_await_timeout_ms: self.auto_await_timeout_ms,
            invoke: Arc::new(invoke),
        }
    }
}

/// The set of registered steps a scraping program provides (spec §4.4.1).
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepDescriptor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: StepDescriptor) {
        self.steps.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    pub fn handle_for(&self, name: &str) -> Result<StepHandle, StepError> {
        self.get(name)
            .map(|d| d.handle())
            .ok_or_else(|| StepError::UnknownContinuation(name.to_string()))
    }

    pub fn invoke(&self, name: &str, ctx: &StepContext) -> Result<Vec<Yield>, StepError> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| StepError::UnknownContinuation(name.to_string()))?;
        (descriptor.invoke)(ctx)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_look_up_by_name() {
        let mut registry = StepRegistry::new();
        registry.register(
            StepBuilder::new("parse")
                .priority(5)
                .needs(Capability::Response)
                .build(|_ctx| Ok(vec![])),
        );
        let descriptor = registry.get("parse").unwrap();
        assert_eq!(descriptor.priority, 5);
        assert!(descriptor.capabilities.contains(&Capability::Response));
    }

    #[test]
    fn unknown_continuation_is_an_error() {
        let registry = StepRegistry::new();
        assert!(matches!(
            registry.handle_for("nope"),
            Err(StepError::UnknownContinuation(_))
        ));
    }
}
