use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use crate::{
    completion::CompletionHandle,
    config::{BindingConfig, EngineConfig},
    dispatch::{self, Dispatcher},
    error::{Error, Result},
    lane::Lanes,
    processor::{Processor, ProcessorChain},
    registry::{BindingMap, BindingRegistry},
    request::{PendingRequest, QueryRequest, UnitOfWork},
    resolver::Resolver,
    scheduler::Scheduler,
    stats::{Stats, StatsSnapshot},
};

/// Builder for a [`QueryServer`].
pub struct QueryServerBuilder<T> {
    config: EngineConfig,
    templates: Option<BindingMap>,
    chain: ProcessorChain<T>,
}

impl<T> Default for QueryServerBuilder<T> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            templates: None,
            chain: ProcessorChain::default(),
        }
    }
}

impl<T> Debug for QueryServerBuilder<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryServerBuilder")
            .field("config", &self.config)
            .field("templates", &self.templates)
            .field("chain", &self.chain)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> QueryServerBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Binding templates. Views with no template get an action of their
    /// own.
    pub fn templates(mut self, templates: impl Into<BindingConfig>) -> Self {
        self.templates = Some(templates.into().bindings);
        self
    }

    /// Append a processor to the chain. Processors run in the order they
    /// were added.
    pub fn processor(mut self, processor: impl Processor<T> + 'static) -> Self {
        self.chain.push(processor);
        self
    }

    /// Build the server and start its hand-off thread. Fails if the
    /// templates given are empty, or if the thread can't be started.
    pub fn build(self) -> Result<QueryServer<T>> {
        let registry = Arc::new(BindingRegistry::new());
        if let Some(templates) = self.templates {
            registry.init_templates(templates)?;
        }

        let stats = Arc::new(Stats::default());
        let config = self.config;

        let dispatch_lanes = config
            .offload_dispatch
            .then(|| Lanes::new("dispatch", config.dispatch_lane()));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            self.chain,
            Lanes::new("send-result", config.completion_lane()),
            dispatch_lanes,
            Arc::clone(&stats),
        ));
        let handoff = dispatch::spawn_handoff(dispatcher)?;

        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            Lanes::new("executor", config.execution_lane()),
            handoff,
            config.debounce(),
            Arc::clone(&stats),
        );

        tracing::debug!(?config, "query server started");

        Ok(QueryServer {
            resolver: Resolver::new(registry, config.wait_queue_capacity),
            scheduler,
            stats,
            config,
        })
    }
}

/// The entry point: registers requests and hands back completion handles.
///
/// Requests for views bound to the same action are answered by a shared,
/// debounced execution of that action. Dropping the server stops its
/// background threads once their queued work is done.
pub struct QueryServer<T> {
    config: EngineConfig,
    resolver: Resolver<T>,
    scheduler: Scheduler<T>,
    stats: Arc<Stats>,
}

impl<T> Debug for QueryServer<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryServer")
            .field("config", &self.config)
            .field("registry", self.resolver.registry())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> QueryServer<T> {
    pub fn builder() -> QueryServerBuilder<T> {
        QueryServerBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BindingRegistry<T>> {
        self.resolver.registry()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of per-action execution lanes created so far.
    pub fn execution_lanes(&self) -> usize {
        self.scheduler.lane_count()
    }

    /// Register `request` and return a handle to its eventual outcome.
    ///
    /// Fails only if the request is malformed: it has no submission time,
    /// or it doesn't have exactly one of a function or a supplier. Every
    /// other failure is delivered through the handle. Never blocks, except
    /// for a request with no view code, which is executed on the spot.
    pub fn register_request(&self, request: QueryRequest<T>) -> Result<CompletionHandle<T>> {
        if request.submitted_at.is_none() {
            return Err(Error::InvalidRequest("no submission time"));
        }
        let work = request.unit_of_work()?;

        let view_code = request.view_code.clone();
        let param = request.param.clone();
        let (pending, handle) = PendingRequest::register(request, self.config.default_timeout());

        if view_code.is_empty() {
            tracing::error!("request has no view code, executing without coalescing");
            self.execute_now(&pending, &work);
            return Ok(handle);
        }

        let action = match self.resolver.resolve_or_create_action(&view_code, param.as_deref()) {
            Some(action) => action,
            None => {
                tracing::warn!(view = %view_code, "no action for view, executing without coalescing");
                self.execute_now(&pending, &work);
                return Ok(handle);
            }
        };

        let queue = self.resolver.queue_for_view(&view_code, param.as_deref());
        if let Err(rejected) = queue.offer(pending) {
            tracing::warn!(view = queue.view_key(), "wait queue full, rejecting request");
            rejected.cell().fail(Error::EnqueueFailed {
                view: queue.view_key().to_owned(),
            });
            return Ok(handle);
        }

        tracing::trace!(view = queue.view_key(), action = %action, "request queued");
        self.scheduler.submit(&action, work);
        Ok(handle)
    }

    fn execute_now(&self, pending: &PendingRequest<T>, work: &UnitOfWork<T>) {
        self.stats.fallback_execution();

        match work.run() {
            Ok(value) => {
                pending.cell().fulfill(value);
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::error!(view = pending.view_key(), error = %message, "execution failed");
                pending.cell().fail(Error::Execution {
                    action: pending.view_key().to_owned(),
                    message,
                });
            }
        }
    }
}
