use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one engine.
#[derive(Debug, Default)]
pub struct Stats {
    executions_run: AtomicU64,
    executions_skipped: AtomicU64,
    executions_failed: AtomicU64,
    envelopes_dispatched: AtomicU64,
    envelopes_orphaned: AtomicU64,
    requests_completed: AtomicU64,
    fallback_executions: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Actions executed by the scheduler, failed ones included.
    pub executions_run: u64,
    /// Scheduled executions that found no request waiting.
    pub executions_skipped: u64,
    pub executions_failed: u64,
    pub envelopes_dispatched: u64,
    /// Results whose action had no bound views.
    pub envelopes_orphaned: u64,
    /// Requests taken off a wait queue by dispatch.
    pub requests_completed: u64,
    /// Requests executed on the caller's thread without coalescing.
    pub fallback_executions: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Stats {
    pub(crate) fn execution_run(&self) {
        bump(&self.executions_run, 1)
    }

    pub(crate) fn execution_skipped(&self) {
        bump(&self.executions_skipped, 1)
    }

    pub(crate) fn execution_failed(&self) {
        bump(&self.executions_failed, 1)
    }

    pub(crate) fn envelope_dispatched(&self) {
        bump(&self.envelopes_dispatched, 1)
    }

    pub(crate) fn envelope_orphaned(&self) {
        bump(&self.envelopes_orphaned, 1)
    }

    pub(crate) fn requests_completed(&self, count: usize) {
        bump(&self.requests_completed, count as u64)
    }

    pub(crate) fn fallback_execution(&self) {
        bump(&self.fallback_executions, 1)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executions_run: self.executions_run.load(Ordering::Relaxed),
            executions_skipped: self.executions_skipped.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            envelopes_dispatched: self.envelopes_dispatched.load(Ordering::Relaxed),
            envelopes_orphaned: self.envelopes_orphaned.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            fallback_executions: self.fallback_executions.load(Ordering::Relaxed),
        }
    }
}
