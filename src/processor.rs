//! Post-processing of results before they reach a particular request.
//!
//! A [`ProcessorChain`] is an ordered list of [`Processor`]s. Each processor
//! belongs to a [`Category`], and a request only sees the processors whose
//! category it accepts. Processors can share an expensive per-category
//! context (a visibility rule set, a user directory snapshot) across every
//! request answered by one result: the context is built on first use within
//! a [`DispatchCycle`] and dropped when that cycle ends. Cycles are owned by
//! the dispatch that created them, so concurrent dispatches never share a
//! context.

use std::{
    any::Any,
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Debug, Display, Formatter},
};

use thiserror::Error;

use crate::{error, request::PendingRequest};

/// The kind of post-processing a processor performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(Cow<'static, str>);

impl Category {
    /// Visibility filtering.
    pub const FILTER: Category = Category(Cow::Borrowed("FILTER"));
    /// Per-user enrichment.
    pub const USER_INFO: Category = Category(Cow::Borrowed("USER_INFO"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Category(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a processor declined to transform a result. The result is passed on
/// unchanged either way.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The processor can't handle this result, or its cached context has a
    /// different type than it expects.
    #[error("processor is not compatible with this result")]
    Incompatible,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A post-processor for results of type `T`.
pub trait Processor<T>: Send + Sync {
    /// Context shared by every request processed within one dispatch cycle.
    type Context: Send + 'static;

    fn category(&self) -> Category;

    /// Build this category's context. Called at most once per cycle.
    fn init_context(&self) -> Self::Context;

    fn apply(
        &self,
        context: &Self::Context,
        request: &PendingRequest<T>,
        result: &T,
    ) -> Result<T, ProcessError>;
}

/// Per-dispatch cache of initialized processor contexts, keyed by category.
#[derive(Default)]
pub struct DispatchCycle {
    contexts: HashMap<Category, Box<dyn Any + Send>>,
}

impl Debug for DispatchCycle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.contexts.keys()).finish()
    }
}

impl DispatchCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contexts initialized so far in this cycle.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drop every cached context.
    pub fn clear_context(&mut self) {
        self.contexts.clear();
    }
}

trait ErasedProcessor<T>: Send + Sync {
    fn category(&self) -> Category;

    fn apply_in(
        &self,
        cycle: &mut DispatchCycle,
        request: &PendingRequest<T>,
        result: &T,
    ) -> Result<T, ProcessError>;
}

impl<T, P: Processor<T>> ErasedProcessor<T> for P {
    fn category(&self) -> Category {
        <P as Processor<T>>::category(self)
    }

    fn apply_in(
        &self,
        cycle: &mut DispatchCycle,
        request: &PendingRequest<T>,
        result: &T,
    ) -> Result<T, ProcessError> {
        let context = cycle
            .contexts
            .entry(<P as Processor<T>>::category(self))
            .or_insert_with(|| Box::new(<P as Processor<T>>::init_context(self)) as Box<dyn Any + Send>);

        let context = context
            .downcast_ref::<P::Context>()
            .ok_or(ProcessError::Incompatible)?;

        self.apply(context, request, result)
    }
}

/// An ordered list of processors.
pub struct ProcessorChain<T> {
    processors: Vec<Box<dyn ErasedProcessor<T>>>,
}

impl<T> Default for ProcessorChain<T> {
    fn default() -> Self {
        Self {
            processors: Vec::new(),
        }
    }
}

impl<T> Debug for ProcessorChain<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.processors.iter().map(|processor| processor.category()))
            .finish()
    }
}

impl<T: 'static> ProcessorChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a processor. Processors run in the order they were added.
    pub fn push(&mut self, processor: impl Processor<T> + 'static) {
        self.processors.push(Box::new(processor));
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run `result` through every processor `request` accepts. A processor
    /// that fails or panics is logged and skipped.
    pub fn process(&self, cycle: &mut DispatchCycle, request: &PendingRequest<T>, result: T) -> T {
        let mut result = result;

        for processor in &self.processors {
            let category = processor.category();
            if !request.accepts(&category) {
                continue;
            }

            match error::catch_panic(|| processor.apply_in(cycle, request, &result)) {
                Ok(Ok(processed)) => result = processed,
                Ok(Err(err)) => tracing::warn!(
                    %category,
                    view = request.view_key(),
                    %err,
                    "processor failed, passing result through"
                ),
                Err(message) => {
                    // The context may be half-built.
                    cycle.contexts.remove(&category);
                    tracing::error!(
                        %category,
                        view = request.view_key(),
                        panic = %message,
                        "processor panicked, passing result through"
                    );
                }
            }
        }

        result
    }
}
