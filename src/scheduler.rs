//! Debounced, coalesced execution of actions.
//!
//! Every action gets its own single-worker execution lane with room for two
//! pending runs. When more triggers arrive the oldest pending run is
//! dropped, so a burst of requests collapses into at most one run in flight
//! plus one waiting. Each run sleeps for the debounce window, then checks
//! whether any bound view still has a request submitted before now, and
//! only then executes.

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::Sender;

use crate::{
    error::Error,
    lane::{Lanes, Submitted},
    registry::BindingRegistry,
    request::UnitOfWork,
    stats::Stats,
};

/// The result of one action execution, tagged with when the execution
/// started. Only requests submitted at or before `started_at` may receive it.
pub struct ResultEnvelope<T> {
    started_at: Instant,
    action_key: String,
    result: Result<T, Error>,
}

impl<T> ResultEnvelope<T> {
    pub fn new(started_at: Instant, action_key: impl Into<String>, result: Result<T, Error>) -> Self {
        Self {
            started_at,
            action_key: action_key.into(),
            result,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn action_key(&self) -> &str {
        &self.action_key
    }

    pub fn result(&self) -> &Result<T, Error> {
        &self.result
    }
}

impl<T: Debug> Debug for ResultEnvelope<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultEnvelope")
            .field("started_at", &self.started_at)
            .field("action_key", &self.action_key)
            .field("result", &self.result)
            .finish()
    }
}

/// Whether any view bound to `action` has a request that was submitted at
/// or before `now` and can still receive a result.
pub(crate) fn has_unprocessed_work<T: Clone>(
    registry: &BindingRegistry<T>,
    action: &str,
    now: Instant,
) -> bool {
    let views = match registry.views_for_action(action) {
        Some(views) => views,
        None => return false,
    };

    views.iter().any(|view| {
        registry
            .queue(view)
            .and_then(|queue| queue.earliest_unresolved())
            // A head with no submission time still needs dispatch to fail it.
            .map_or(false, |submitted_at| submitted_at.map_or(true, |at| at <= now))
    })
}

pub(crate) struct Scheduler<T> {
    registry: Arc<BindingRegistry<T>>,
    lanes: Lanes,
    handoff: Sender<ResultEnvelope<T>>,
    debounce: Duration,
    stats: Arc<Stats>,
}

impl<T> Debug for Scheduler<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("lanes", &self.lanes)
            .field("debounce", &self.debounce)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Scheduler<T> {
    pub(crate) fn new(
        registry: Arc<BindingRegistry<T>>,
        lanes: Lanes,
        handoff: Sender<ResultEnvelope<T>>,
        debounce: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            registry,
            lanes,
            handoff,
            debounce,
            stats,
        }
    }

    /// Number of execution lanes created so far, one per action ever
    /// submitted.
    pub(crate) fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Schedule a run of `action`. Never blocks.
    pub(crate) fn submit(&self, action: &str, work: UnitOfWork<T>) {
        let registry = Arc::clone(&self.registry);
        let handoff = self.handoff.clone();
        let stats = Arc::clone(&self.stats);
        let debounce = self.debounce;
        let action_key = action.to_owned();

        let submitted = self.lanes.get(action).execute(Box::new(move || {
            if !debounce.is_zero() {
                thread::sleep(debounce);
            }

            let now = Instant::now();
            if !has_unprocessed_work(&registry, &action_key, now) {
                tracing::debug!(action = %action_key, "no waiting requests, skipping execution");
                stats.execution_skipped();
                return;
            }

            tracing::trace!(action = %action_key, "executing");
            stats.execution_run();
            let result = work.run().map_err(|err| {
                let message = format!("{err:#}");
                tracing::error!(action = %action_key, error = %message, "execution failed");
                stats.execution_failed();
                Error::Execution {
                    action: action_key.clone(),
                    message,
                }
            });

            let envelope = ResultEnvelope::new(now, action_key, result);
            if handoff.send(envelope).is_err() {
                tracing::debug!("hand-off channel closed, dropping result");
            }
        }));

        if submitted == Submitted::DiscardedOldest {
            tracing::trace!(action, "coalesced with a pending execution");
        }
    }
}
