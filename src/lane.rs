//! Bounded worker lanes.
//!
//! A lane is a small thread pool with a bounded job queue and a policy for
//! what happens when the queue is full. Lanes are created lazily, one per
//! action or view key, and live as long as the engine that owns them.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use dashmap::DashMap;

use crate::error;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// What a lane does with a job when its queue is full and it can't add a
/// worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued job to make room for the new one.
    DiscardOldest,
    /// Run the job on the submitting thread.
    CallerRuns,
}

/// Sizing and overflow behavior of a lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSpec {
    pub capacity: usize,
    /// Workers started with the lane. They never retire.
    pub core_workers: usize,
    /// Upper bound on workers. Workers past the core are only started when
    /// the queue is full.
    pub max_workers: usize,
    /// How long a worker past the core may sit idle before it exits.
    pub keep_alive: Option<Duration>,
    pub policy: OverflowPolicy,
}

/// How a job submitted to a lane was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submitted {
    Queued,
    /// The queue was full; a new worker was started with this job.
    Spawned,
    /// The queue was full; the oldest queued job was dropped.
    DiscardedOldest,
    /// The queue was full; the job already ran on the caller's thread.
    RanOnCaller,
}

pub(crate) struct Lane {
    name: String,
    spec: LaneSpec,
    sender: Sender<Job>,
    // Kept so the submitter can evict the oldest job under DiscardOldest.
    receiver: Receiver<Job>,
    workers: Arc<AtomicUsize>,
    spawned: AtomicUsize,
}

impl Debug for Lane {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lane")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("queued", &self.queued())
            .field("workers", &self.workers())
            .finish()
    }
}

impl Lane {
    pub(crate) fn new(name: impl Into<String>, spec: LaneSpec) -> Self {
        let name: String = name.into();
        let (sender, receiver) = channel::bounded(spec.capacity.max(1));
        let lane = Self {
            // Keys carry request params; thread names can't hold NUL.
            name: name.replace('\0', "_"),
            spec,
            sender,
            receiver,
            workers: Arc::new(AtomicUsize::new(0)),
            spawned: AtomicUsize::new(0),
        };

        for _ in 0..lane.spec.core_workers.max(1) {
            lane.workers.fetch_add(1, Ordering::SeqCst);
            lane.spawn(None);
        }

        tracing::debug!(lane = %lane.name, spec = ?lane.spec, "lane.create");
        lane
    }

    pub(crate) fn workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub(crate) fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Start a worker. The caller must already have counted it in
    /// `self.workers`.
    fn spawn(&self, first: Option<Job>) {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        let receiver = self.receiver.clone();
        let workers = Arc::clone(&self.workers);
        let core = self.spec.core_workers.max(1);
        let keep_alive = self.spec.keep_alive;

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, index))
            .spawn(move || work(receiver, workers, core, keep_alive, first));

        match spawned {
            Ok(..) => tracing::trace!(lane = %self.name, index, "lane.spawn"),
            Err(err) => {
                self.workers.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(lane = %self.name, %err, "failed to start lane worker");
            }
        }
    }

    /// Start a worker past the core for `job`, if the lane has room for one.
    fn grow(&self, job: Job) -> Result<(), Job> {
        let mut current = self.workers.load(Ordering::SeqCst);
        loop {
            if current >= self.spec.max_workers {
                return Err(job);
            }

            match self.workers.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(..) => break,
                Err(actual) => current = actual,
            }
        }

        self.spawn(Some(job));
        Ok(())
    }

    pub(crate) fn execute(&self, job: Job) -> Submitted {
        let job = match self.sender.try_send(job) {
            Ok(()) => return Submitted::Queued,
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job,
        };

        let job = match self.grow(job) {
            Ok(()) => return Submitted::Spawned,
            Err(job) => job,
        };

        match self.spec.policy {
            OverflowPolicy::CallerRuns => {
                tracing::trace!(lane = %self.name, "lane full, running job on caller");
                run(job);
                Submitted::RanOnCaller
            }
            OverflowPolicy::DiscardOldest => {
                let mut job = job;
                loop {
                    if self.receiver.try_recv().is_ok() {
                        tracing::debug!(lane = %self.name, "lane full, discarded oldest job");
                    }

                    match self.sender.try_send(job) {
                        Ok(()) => return Submitted::DiscardedOldest,
                        Err(TrySendError::Full(rejected)) => job = rejected,
                        Err(TrySendError::Disconnected(..)) => return Submitted::DiscardedOldest,
                    }
                }
            }
        }
    }
}

// Retire a worker if the lane has more than its core. Returns true if the
// caller should exit.
fn retire(workers: &AtomicUsize, core: usize) -> bool {
    let mut current = workers.load(Ordering::SeqCst);
    loop {
        if current <= core {
            return false;
        }

        match workers.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(..) => return true,
            Err(actual) => current = actual,
        }
    }
}

fn run(job: Job) {
    if let Err(message) = error::catch_panic(job) {
        tracing::error!(panic = %message, "lane job panicked");
    }
}

fn work(
    receiver: Receiver<Job>,
    workers: Arc<AtomicUsize>,
    core: usize,
    keep_alive: Option<Duration>,
    first: Option<Job>,
) {
    if let Some(job) = first {
        run(job);
    }

    loop {
        let job = match keep_alive {
            Some(idle) => match receiver.recv_timeout(idle) {
                Ok(job) => job,
                Err(RecvTimeoutError::Timeout) if retire(&workers, core) => return,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match receiver.recv() {
                Ok(job) => job,
                Err(..) => break,
            },
        };

        run(job);
    }

    // The lane itself is gone.
    workers.fetch_sub(1, Ordering::SeqCst);
}

/// Lanes of one kind, keyed by action or view key.
pub(crate) struct Lanes {
    suffix: &'static str,
    spec: LaneSpec,
    lanes: DashMap<String, Arc<Lane>>,
}

impl Debug for Lanes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lanes")
            .field("suffix", &self.suffix)
            .field("spec", &self.spec)
            .field("lanes", &self.len())
            .finish()
    }
}

impl Lanes {
    pub(crate) fn new(suffix: &'static str, spec: LaneSpec) -> Self {
        Self {
            suffix,
            spec,
            lanes: DashMap::new(),
        }
    }

    /// The lane for `key`, created on first use.
    pub(crate) fn get(&self, key: &str) -> Arc<Lane> {
        if let Some(lane) = self.lanes.get(key) {
            return Arc::clone(lane.value());
        }

        let lane = self.lanes.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Lane::new(format!("{}-{}", key, self.suffix), self.spec.clone()))
        });
        Arc::clone(lane.value())
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::{atomic::AtomicBool, Barrier};

    fn spec(capacity: usize, max_workers: usize, policy: OverflowPolicy) -> LaneSpec {
        LaneSpec {
            capacity,
            core_workers: 1,
            max_workers,
            keep_alive: None,
            policy,
        }
    }

    #[test]
    fn discard_oldest_keeps_newest_jobs() {
        let lane = Lane::new("test-discard", spec(2, 1, OverflowPolicy::DiscardOldest));

        // Park the only worker so the queue fills up.
        let gate = Arc::new(Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        assert_eq!(lane.execute(Box::new(move || { worker_gate.wait(); })), Submitted::Queued);
        while lane.queued() > 0 {
            thread::yield_now();
        }

        let (done, results) = bounded(8);
        for i in 0..4 {
            let done = done.clone();
            lane.execute(Box::new(move || done.send(i).unwrap()));
        }

        gate.wait();
        let mut seen: Vec<i32> = (0..2).map(|_| results.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, [2, 3]);
        assert!(results.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn caller_runs_when_saturated() {
        let lane = Lane::new("test-caller", spec(1, 1, OverflowPolicy::CallerRuns));

        let gate = Arc::new(Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        lane.execute(Box::new(move || { worker_gate.wait(); }));
        while lane.queued() > 0 {
            thread::yield_now();
        }

        lane.execute(Box::new(|| {}));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let submitted = lane.execute(Box::new(move || flag.store(true, Ordering::SeqCst)));

        assert_eq!(submitted, Submitted::RanOnCaller);
        assert!(ran.load(Ordering::SeqCst));
        gate.wait();
    }

    #[test]
    fn nul_in_name_still_runs_jobs() {
        let lane = Lane::new("VIEW::a\0b-send-result", spec(4, 1, OverflowPolicy::DiscardOldest));
        assert_eq!(lane.workers(), 1);

        let (done, results) = bounded(1);
        lane.execute(Box::new(move || done.send(()).unwrap()));
        assert!(results.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn worker_survives_a_panicking_job() {
        let lane = Lane::new("test-panic", spec(4, 1, OverflowPolicy::DiscardOldest));

        let (done, results) = bounded(2);
        lane.execute(Box::new(|| panic!("job failed")));
        for i in 0..2 {
            let done = done.clone();
            lane.execute(Box::new(move || done.send(i).unwrap()));
        }

        let seen: Vec<i32> = (0..2)
            .map(|_| results.recv_timeout(Duration::from_secs(1)).unwrap())
            .collect();
        assert_eq!(seen, [0, 1]);
        assert_eq!(lane.workers(), 1);
    }

    #[test]
    fn caller_survives_a_panicking_job() {
        let lane = Lane::new("test-caller-panic", spec(1, 1, OverflowPolicy::CallerRuns));

        let gate = Arc::new(Barrier::new(2));
        let worker_gate = Arc::clone(&gate);
        lane.execute(Box::new(move || { worker_gate.wait(); }));
        while lane.queued() > 0 {
            thread::yield_now();
        }
        lane.execute(Box::new(|| {}));

        let submitted = lane.execute(Box::new(|| panic!("caller job failed")));
        assert_eq!(submitted, Submitted::RanOnCaller);
        gate.wait();
    }

    #[test]
    fn lanes_are_created_once_per_key() {
        let lanes = Lanes::new("executor", spec(2, 1, OverflowPolicy::DiscardOldest));

        let first = lanes.get("Q_VIEW::a\0b");
        let second = lanes.get("Q_VIEW::a\0b");
        lanes.get("Q_OTHER");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(lanes.len(), 2);
    }

    #[test]
    fn grows_past_core_when_full() {
        let lane = Lane::new("test-grow", spec(1, 2, OverflowPolicy::CallerRuns));

        let gate = Arc::new(Barrier::new(3));
        let first = Arc::clone(&gate);
        lane.execute(Box::new(move || { first.wait(); }));
        while lane.queued() > 0 {
            thread::yield_now();
        }
        lane.execute(Box::new(|| {}));

        let second = Arc::clone(&gate);
        assert_eq!(lane.execute(Box::new(move || { second.wait(); })), Submitted::Spawned);
        assert_eq!(lane.workers(), 2);
        gate.wait();
    }
}
