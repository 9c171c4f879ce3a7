//! Pipeline and worker execution contexts, and the handler registry.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use super::WindowBasedOperatorHandler;
use crate::operator::{Emitter, OperatorError};

/// Identifier of an operator handler within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub u64);

impl HandlerId {
    /// Creates a new handler identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Operator handlers of a pipeline, keyed by id.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<FxHashMap<HandlerId, Arc<WindowBasedOperatorHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own id, returning any handler it
    /// replaced.
    pub fn register(
        &self,
        handler: Arc<WindowBasedOperatorHandler>,
    ) -> Option<Arc<WindowBasedOperatorHandler>> {
        self.handlers.write().insert(handler.id(), handler)
    }

    /// Looks up a handler.
    #[must_use]
    pub fn get(&self, id: HandlerId) -> Option<Arc<WindowBasedOperatorHandler>> {
        self.handlers.read().get(&id).cloned()
    }

    /// Removes a handler.
    pub fn remove(&self, id: HandlerId) -> Option<Arc<WindowBasedOperatorHandler>> {
        self.handlers.write().remove(&id)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered handler ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<HandlerId> {
        let mut ids: Vec<_> = self.handlers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.ids())
            .finish()
    }
}

/// Execution context shared by all workers of one pipeline.
pub struct PipelineContext {
    num_worker_threads: usize,
    emitter: Arc<dyn Emitter>,
    registry: HandlerRegistry,
}

impl PipelineContext {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> PipelineContextBuilder {
        PipelineContextBuilder::default()
    }

    /// Number of worker threads executing the pipeline.
    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.num_worker_threads
    }

    /// Downstream emitter.
    #[must_use]
    pub fn emitter(&self) -> &dyn Emitter {
        self.emitter.as_ref()
    }

    /// Handler registry.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Looks up a registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::UnknownHandler`] if no handler has the id.
    pub fn handler(&self, id: HandlerId) -> Result<Arc<WindowBasedOperatorHandler>, OperatorError> {
        self.registry.get(id).ok_or(OperatorError::UnknownHandler(id))
    }

    /// Context of one worker thread.
    #[must_use]
    pub fn worker(&self, worker_id: usize) -> WorkerContext<'_> {
        WorkerContext {
            worker_id,
            pipeline: self,
        }
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("num_worker_threads", &self.num_worker_threads)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PipelineContext`].
#[derive(Default)]
pub struct PipelineContextBuilder {
    num_worker_threads: Option<usize>,
    emitter: Option<Arc<dyn Emitter>>,
    handlers: Vec<Arc<WindowBasedOperatorHandler>>,
}

impl PipelineContextBuilder {
    /// Sets the number of worker threads (default: 1).
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.num_worker_threads = Some(threads);
        self
    }

    /// Sets the downstream emitter.
    #[must_use]
    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Registers a handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<WindowBasedOperatorHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if no emitter is set, the
    /// worker count is zero, or two handlers share an id.
    pub fn build(self) -> Result<PipelineContext, OperatorError> {
        let num_worker_threads = self.num_worker_threads.unwrap_or(1);
        if num_worker_threads == 0 {
            return Err(OperatorError::InvalidConfig(
                "pipeline needs at least one worker thread".to_string(),
            ));
        }
        let emitter = self
            .emitter
            .ok_or_else(|| OperatorError::InvalidConfig("pipeline needs an emitter".to_string()))?;

        let registry = HandlerRegistry::new();
        for handler in self.handlers {
            let id = handler.id();
            if registry.register(handler).is_some() {
                return Err(OperatorError::InvalidConfig(format!(
                    "{id} registered more than once"
                )));
            }
        }

        Ok(PipelineContext {
            num_worker_threads,
            emitter,
            registry,
        })
    }
}

/// Execution context of one worker thread.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    worker_id: usize,
    pipeline: &'a PipelineContext,
}

impl<'a> WorkerContext<'a> {
    /// Worker thread id; selects the slice partition the worker writes to.
    #[must_use]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Pipeline the worker belongs to.
    #[must_use]
    pub fn pipeline(&self) -> &'a PipelineContext {
        self.pipeline
    }

    /// Looks up a registered handler.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::UnknownHandler`] if no handler has the id.
    pub fn handler(&self, id: HandlerId) -> Result<Arc<WindowBasedOperatorHandler>, OperatorError> {
        self.pipeline.handler(id)
    }
}
