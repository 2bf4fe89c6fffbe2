//! pollcoalesce answers many concurrent long-poll requests for slowly
//! changing data with as few backend queries as possible. Clients register a
//! request against a *view* (an output channel, such as a flight list
//! screen); the engine maps the view to a shared *action* (the backend query
//! that can answer it), runs that action at most as often as it's needed,
//! and fans the single result out to every request still waiting on a view
//! bound to it.
//!
//! The one guarantee that matters: a request is never answered with data
//! that was computed before the request was submitted.
//!
//! ## Overview
//!
//! Bindings between actions and views come from a set of templates supplied
//! at startup. A template maps an action code to the view codes it can
//! answer:
//!
//! ```text
//! QUERY_FLIGHT => { FLIGHT_LIST, FLIGHT_BOARD }
//! ```
//!
//! Requests can carry a parameter, which specializes both sides: a request
//! for `FLIGHT_LIST` with parameter `42` waits on view key `FLIGHT_LIST::42`,
//! which is answered by action key `QUERY_FLIGHT::42` together with
//! `FLIGHT_BOARD::42`. A view with no template is bound to an action of its
//! own, named `Q_` followed by the view key. Bindings are created the first
//! time a view is requested and are never removed.
//!
//! Create a [`QueryServer`] with the templates, then register requests. Each
//! request carries the work that computes its result, either as a function
//! of its parameter or as a plain supplier:
//!
//! ```
//! use std::collections::{BTreeMap, BTreeSet};
//! use pollcoalesce::{Completion, QueryRequest, QueryServer};
//!
//! let templates = BTreeMap::from([(
//!     "QUERY_FLIGHT".to_owned(),
//!     BTreeSet::from(["FLIGHT_LIST".to_owned()]),
//! )]);
//!
//! let server = QueryServer::<Vec<String>>::builder()
//!     .templates(templates)
//!     .build()
//!     .unwrap();
//!
//! let handle = server
//!     .register_request(
//!         QueryRequest::new("FLIGHT_LIST")
//!             .supplier(|| Ok(vec!["1".to_owned(), "2".to_owned()])),
//!     )
//!     .unwrap();
//!
//! assert_eq!(
//!     handle.wait(),
//!     Completion::Fulfilled(vec!["1".to_owned(), "2".to_owned()]),
//! );
//! ```
//!
//! [`register_request`] never blocks. It returns a [`CompletionHandle`],
//! which is a [`Future`](std::future::Future) that resolves with the
//! request's [`Completion`]: the result, an error, or (once the request's
//! timeout has passed) its timeout value. Transports that aren't async can
//! call [`CompletionHandle::wait`] instead.
//!
//! ## Execution
//!
//! Each action has a dedicated execution lane: one worker thread with room
//! for two pending runs. Registering a request triggers a run; when the lane
//! is full the oldest pending run is dropped, so a burst of requests
//! collapses into at most one run in progress and one waiting.
//!
//! A run first sleeps for the debounce window (10ms by default), which gives
//! requests arriving close together a chance to share it. It then notes the
//! current time and checks whether any bound view has a request submitted at
//! or before that moment. If not, the run is skipped. Otherwise the action is
//! executed and its result, stamped with the start time, is handed to the
//! dispatcher.
//!
//! The dispatcher takes every request submitted at or before the start time
//! off each bound view's queue, runs the result through the
//! [`ProcessorChain`] for that request, and completes it on the view's
//! completion lane. Requests submitted after the start time stay queued for
//! the next run, which their own registration already triggered.
//!
//! ## Post-processing
//!
//! A [`Processor`] transforms the shared result for one particular request,
//! for instance to filter it by what the request's user may see. Requests opt
//! in to processors by [`Category`]. Processors can build an expensive
//! context once per dispatch and reuse it for every request that dispatch
//! answers; see [`DispatchCycle`].
//!
//! ## Failures
//!
//! If an action fails, every request it would have answered completes with
//! [`Error::Execution`]. Requests are never retried; a request that isn't
//! answered before its timeout expires with its timeout value.
//!
//! [`register_request`]: QueryServer::register_request

mod completion;
mod config;
mod dispatch;
mod error;
pub mod key;
mod lane;
mod processor;
mod queue;
mod registry;
mod request;
mod resolver;
mod scheduler;
mod server;
mod stats;
mod wakerset;

pub use completion::{Completion, CompletionHandle};
pub use config::{BindingConfig, EngineConfig};
pub use dispatch::HANDOFF_THREAD;
pub use error::{Error, Result};
pub use processor::{Category, DispatchCycle, ProcessError, Processor, ProcessorChain};
pub use queue::WaitQueue;
pub use registry::{BindingMap, BindingRegistry};
pub use request::{PendingRequest, QueryRequest, DEFAULT_TIMEOUT};
pub use resolver::Resolver;
pub use scheduler::ResultEnvelope;
pub use server::{QueryServer, QueryServerBuilder};
pub use stats::StatsSnapshot;
