//! Engine configuration.
//!
//! Both types deserialize from any serde format. Every field has a default,
//! so a partial document only overrides what it names. Durations are given
//! in milliseconds.

use std::{num::NonZeroUsize, thread, time::Duration};

use serde::Deserialize;

use crate::{
    lane::{LaneSpec, OverflowPolicy},
    registry::BindingMap,
};

/// Tuning knobs for a [`QueryServer`](crate::QueryServer).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an execution lane waits before checking for work, so that
    /// requests arriving close together share one execution.
    pub debounce_ms: u64,

    /// Timeout for requests that don't set their own.
    pub default_timeout_ms: u64,

    /// Queue depth of each per-action execution lane.
    pub execution_queue: usize,

    /// Hand results to a per-action dispatch lane instead of dispatching
    /// them on the hand-off thread.
    pub offload_dispatch: bool,
    pub dispatch_workers: usize,
    pub dispatch_queue: usize,

    pub completion_queue: usize,
    /// Upper bound on workers per completion lane. Defaults to the number of
    /// CPUs.
    pub completion_max_workers: usize,
    /// Idle time after which completion workers beyond the first exit.
    pub completion_keep_alive_ms: u64,

    /// Capacity of each wait queue. Unbounded if unset.
    pub wait_queue_capacity: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 10,
            default_timeout_ms: 5000,
            execution_queue: 2,
            offload_dispatch: false,
            dispatch_workers: 3,
            dispatch_queue: 2,
            completion_queue: 20,
            completion_max_workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            completion_keep_alive_ms: 30_000,
            wait_queue_capacity: None,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub(crate) fn execution_lane(&self) -> LaneSpec {
        LaneSpec {
            capacity: self.execution_queue,
            core_workers: 1,
            max_workers: 1,
            keep_alive: None,
            policy: OverflowPolicy::DiscardOldest,
        }
    }

    pub(crate) fn dispatch_lane(&self) -> LaneSpec {
        LaneSpec {
            capacity: self.dispatch_queue,
            core_workers: self.dispatch_workers,
            max_workers: self.dispatch_workers,
            keep_alive: None,
            policy: OverflowPolicy::DiscardOldest,
        }
    }

    pub(crate) fn completion_lane(&self) -> LaneSpec {
        LaneSpec {
            capacity: self.completion_queue,
            core_workers: 1,
            max_workers: self.completion_max_workers.max(1),
            keep_alive: Some(Duration::from_millis(self.completion_keep_alive_ms)),
            policy: OverflowPolicy::CallerRuns,
        }
    }
}

/// The binding templates: template action code → the view codes it answers.
///
/// ```
/// use pollcoalesce::BindingConfig;
///
/// let config: BindingConfig = serde_json::from_str(r#"{
///     "bindings": { "QUERY_FLIGHT": ["FLIGHT_LIST", "FLIGHT_BOARD"] }
/// }"#).unwrap();
///
/// assert_eq!(config.bindings["QUERY_FLIGHT"].len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BindingConfig {
    #[serde(default)]
    pub bindings: BindingMap,
}

impl From<BindingMap> for BindingConfig {
    fn from(bindings: BindingMap) -> Self {
        Self { bindings }
    }
}
