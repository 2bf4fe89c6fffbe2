//! Fan-out of execution results to waiting requests.

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
    thread,
};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

use crate::{
    error::Error,
    lane::Lanes,
    processor::{DispatchCycle, ProcessorChain},
    queue::Head,
    registry::BindingRegistry,
    request::PendingRequest,
    scheduler::ResultEnvelope,
    stats::Stats,
};

/// Name of the thread that drains the hand-off channel.
pub const HANDOFF_THREAD: &str = "pollcoalesce-handoff";

pub(crate) struct Dispatcher<T> {
    registry: Arc<BindingRegistry<T>>,
    chain: ProcessorChain<T>,
    // Serializes extraction from the wait queues across concurrent
    // dispatches, so a request is only ever taken by one of them.
    extraction: Mutex<()>,
    completion_lanes: Lanes,
    dispatch_lanes: Option<Lanes>,
    stats: Arc<Stats>,
}

impl<T> Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("chain", &self.chain)
            .field("completion_lanes", &self.completion_lanes)
            .field("dispatch_lanes", &self.dispatch_lanes)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Dispatcher<T> {
    pub(crate) fn new(
        registry: Arc<BindingRegistry<T>>,
        chain: ProcessorChain<T>,
        completion_lanes: Lanes,
        dispatch_lanes: Option<Lanes>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            registry,
            chain,
            extraction: Mutex::new(()),
            completion_lanes,
            dispatch_lanes,
            stats,
        }
    }

    /// Take every request eligible for `envelope` off its view's queue,
    /// post-process the result for each one, and schedule its completion.
    /// Returns the number of requests taken off the queues.
    pub(crate) fn dispatch(&self, envelope: ResultEnvelope<T>) -> usize {
        let action = envelope.action_key();
        let views = match self.registry.views_for_action(action) {
            Some(views) if !views.is_empty() => views,
            _ => {
                tracing::error!(action, "orphaned result: no views bound to action");
                self.stats.envelope_orphaned();
                return 0;
            }
        };

        let mut taken = 0;
        let mut ready: Vec<(&str, Vec<PendingRequest<T>>)> = Vec::new();

        {
            let _extraction = self.extraction.lock();

            for view in views.iter() {
                let queue = match self.registry.queue(view) {
                    Some(queue) => queue,
                    None => continue,
                };

                let mut eligible = Vec::new();
                for _ in 0..queue.len() {
                    match queue.take_eligible(envelope.started_at()) {
                        Head::Empty | Head::Later => break,
                        Head::Eligible(request) => {
                            eligible.push(request);
                            taken += 1;
                        }
                        Head::Malformed(request) => {
                            tracing::warn!(view = %view, "request without submission time");
                            request.cell().fail(Error::MissingSubmissionTime {
                                view: view.clone(),
                            });
                            taken += 1;
                        }
                    }
                }

                if !eligible.is_empty() {
                    ready.push((view.as_str(), eligible));
                }
            }
        }

        let mut cycle = DispatchCycle::new();
        for (view, requests) in ready {
            let lane = self.completion_lanes.get(view);
            tracing::trace!(action, view, count = requests.len(), "fanning out result");

            for request in requests {
                let job: Box<dyn FnOnce() + Send> = match envelope.result() {
                    Ok(result) => {
                        if request.cell().is_resolved() {
                            continue;
                        }

                        let value = self.chain.process(&mut cycle, &request, result.clone());
                        Box::new(move || {
                            if !request.cell().fulfill(value) {
                                tracing::trace!(view = request.view_key(), "request already resolved");
                            }
                        })
                    }
                    Err(error) => {
                        let error = error.clone();
                        Box::new(move || {
                            request.cell().fail(error);
                        })
                    }
                };

                lane.execute(job);
            }
        }
        cycle.clear_context();

        self.stats.envelope_dispatched();
        self.stats.requests_completed(taken);
        taken
    }

    /// Dispatch `envelope` on the calling thread, or hand it to the action's
    /// dispatch lane if dispatch is offloaded.
    pub(crate) fn forward(self: &Arc<Self>, envelope: ResultEnvelope<T>) {
        match self.dispatch_lanes {
            None => {
                self.dispatch(envelope);
            }
            Some(ref lanes) => {
                let lane = lanes.get(envelope.action_key());
                let dispatcher = Arc::clone(self);
                lane.execute(Box::new(move || {
                    dispatcher.dispatch(envelope);
                }));
            }
        }
    }
}

/// Start the hand-off consumer. Envelopes sent on the returned channel are
/// forwarded to `dispatcher` one at a time, in arrival order. The thread
/// exits once every sender is dropped.
pub(crate) fn spawn_handoff<T: Clone + Send + Sync + 'static>(
    dispatcher: Arc<Dispatcher<T>>,
) -> Result<Sender<ResultEnvelope<T>>, Error> {
    let (sender, receiver): (_, Receiver<ResultEnvelope<T>>) = channel::unbounded();

    thread::Builder::new()
        .name(HANDOFF_THREAD.to_owned())
        .spawn(move || {
            for envelope in receiver {
                dispatcher.forward(envelope);
            }
            tracing::debug!("hand-off channel closed");
        })
        .map_err(|err| Error::Spawn {
            thread: HANDOFF_THREAD.to_owned(),
            message: err.to_string(),
        })?;

    Ok(sender)
}
