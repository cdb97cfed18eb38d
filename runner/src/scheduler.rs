use crate::lifecycle::{LifecycleError, ThreadManager, ThreadWorker, WorkerControl};
use crossbeam_channel::{unbounded, Receiver, Sender};
use itertools::Itertools;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};


pub const DEFAULT_MAX_WORKERS: usize = 1000;
pub const DEFAULT_BACKLOG: usize = 10000;

/// Category that is never held back by its backlog
pub const PRIORITY_CATEGORY: i32 = 0;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("At least one executor is required")]
    NoExecutors,
    #[error("Scheduler was already launched")]
    AlreadyLaunched,
    #[error("Scheduler has {0} jobs in flight but no executors were launched")]
    NotLaunched(usize),
    #[error("Scheduler is shutting down")]
    Halted,
    #[error("Queue {category} needs room for at least one running job")]
    InvalidQueue { category: i32 },
    #[error("Scheduler thread failed")]
    Lifecycle(#[from] LifecycleError),
}

/// A unit of work for the scheduler
pub trait Job: Send + 'static {
    fn category(&self) -> i32;
    fn run(self: Box<Self>);
}

/// Job built from a closure
pub struct FnJob<F> {
    category: i32,
    body: F,
}

impl<F> FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    pub fn new(category: i32, body: F) -> Self {
        Self { category, body }
    }
}

impl<F> Job for FnJob<F>
where
    F: FnOnce() + Send + 'static,
{
    fn category(&self) -> i32 {
        self.category
    }

    fn run(self: Box<Self>) {
        (self.body)()
    }
}

struct Queue {
    max_workers: usize,
    backlog: usize,
    running: usize,
    pending: VecDeque<Box<dyn Job>>,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            backlog: DEFAULT_BACKLOG,
            running: 0,
            pending: VecDeque::new(),
        }
    }
}

#[derive(Default)]
struct Queues {
    queues: BTreeMap<i32, Queue>,
    /// pending plus running jobs
    in_flight: usize,
    halted: bool,
}

impl Queues {
    /// Longest backlog among the categories under their cap, lowest id on ties
    fn choose_next(&self) -> Option<i32> {
        let mut best: Option<(i32, usize)> = None;

        for (category, queue) in &self.queues {
            if queue.pending.is_empty() || queue.running >= queue.max_workers {
                continue;
            }
            if best.map_or(true, |(_, longest)| queue.pending.len() > longest) {
                best = Some((*category, queue.pending.len()));
            }
        }

        best.map(|(category, _)| category)
    }
}

#[derive(Default)]
struct IdleExecutors {
    executors: Vec<usize>,
    halted: bool,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Queues>,
    changed: Condvar,
    idle: Mutex<IdleExecutors>,
    idle_changed: Condvar,
}

impl Shared {
    fn finished(&self, category: i32) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.queues.get_mut(&category) {
            queue.running = queue.running.saturating_sub(1);
        }
        queues.in_flight = queues.in_flight.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Back on the idle list before the job stops counting, so a flush
    /// never sees an empty scheduler with a busy executor
    fn executor_done(&self, index: usize, category: i32) {
        self.idle.lock().executors.push(index);
        self.idle_changed.notify_one();
        self.finished(category);
    }

    fn halt(&self) {
        self.queues.lock().halted = true;
        self.changed.notify_all();
        self.idle.lock().halted = true;
        self.idle_changed.notify_all();
    }
}

enum Task {
    Run(Box<dyn Job>),
    Halt,
}

struct Runtime {
    manager: ThreadManager,
    executors: Vec<Sender<Task>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub category: i32,
    pub running: usize,
    pub max_workers: usize,
    pub pending: usize,
    pub backlog: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub queues: Vec<QueueStatus>,
    pub idle_executors: usize,
    pub in_flight: usize,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in flight, {} idle executors | {}",
            self.in_flight,
            self.idle_executors,
            self.queues
                .iter()
                .map(|queue| format!(
                    "[{}] {}/{} running, {}/{} pending",
                    queue.category, queue.running, queue.max_workers, queue.pending, queue.backlog
                ))
                .join(" ")
        )
    }
}

/// Multi-queue scheduler: one dispatcher thread feeding a fixed pool of
/// executor threads, with per-category concurrency caps and backlogs.
pub struct JobQueue {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
    verbose: u8,
    pin_cores: bool,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("status", &self.status())
            .field("launched", &self.runtime.lock().is_some())
            .finish()
    }
}

impl JobQueue {
    pub fn new(verbose: u8) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            runtime: Mutex::new(None),
            verbose,
            pin_cores: false,
        }
    }

    /// pin executor `i` to core `i % cores` when launched
    pub fn with_pinning(mut self, pin_cores: bool) -> Self {
        self.pin_cores = pin_cores;
        self
    }

    /// Declare (or reconfigure) the limits of a category
    pub fn set_queue(
        &self,
        category: i32,
        max_workers: usize,
        backlog: usize,
    ) -> Result<(), SchedulerError> {
        if max_workers == 0 {
            return Err(SchedulerError::InvalidQueue { category });
        }

        let mut queues = self.shared.queues.lock();
        let queue = queues.queues.entry(category).or_default();
        queue.max_workers = max_workers;
        queue.backlog = backlog;
        self.shared.changed.notify_all();

        debug!(category, max_workers, backlog, "Configured queue");
        Ok(())
    }

    /// Append a job to its category, blocking while that category's backlog is full
    pub fn add(&self, job: impl Job) -> Result<(), SchedulerError> {
        let job: Box<dyn Job> = Box::new(job);
        let category = job.category();

        let mut queues = self.shared.queues.lock();
        loop {
            if queues.halted {
                return Err(SchedulerError::Halted);
            }

            let queue = queues.queues.entry(category).or_default();
            if category == PRIORITY_CATEGORY || queue.pending.len() < queue.backlog {
                break;
            }

            trace!(category, "Backlog full, waiting for room");
            self.shared.changed.wait(&mut queues);
        }

        queues.queues.entry(category).or_default().pending.push_back(job);
        queues.in_flight += 1;
        self.shared.changed.notify_all();

        Ok(())
    }

    /// start the dispatcher and `executors` executor threads
    #[instrument(skip(self), level = "debug")]
    pub fn launch(&self, executors: usize) -> Result<(), SchedulerError> {
        if executors == 0 {
            return Err(SchedulerError::NoExecutors);
        }

        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(SchedulerError::AlreadyLaunched);
        }

        let cores = affinity::get_core_num().max(1);
        let mut manager = ThreadManager::new();
        let mut senders = Vec::with_capacity(executors);

        for index in 0..executors {
            let (tx, rx) = unbounded();
            senders.push(tx);
            self.shared.idle.lock().executors.push(index);

            let core = self.pin_cores.then_some(index % cores);
            manager.add_thread(ThreadWorker::named(
                index + 1,
                format!("executor-{index}"),
                executor_loop(self.shared.clone(), index, rx, core),
            ))?;
        }

        manager.add_thread(ThreadWorker::named(
            0,
            "dispatcher",
            dispatcher_loop(self.shared.clone(), senders.clone(), self.verbose),
        ))?;
        manager.launch_all()?;

        info!(executors, "Launched scheduler");
        *runtime = Some(Runtime {
            manager,
            executors: senders,
        });

        Ok(())
    }

    /// Block until no job is pending or running and every executor is idle
    #[instrument(skip(self), level = "debug")]
    pub fn flush(&self) -> Result<(), SchedulerError> {
        let launched = self.runtime.lock().is_some();

        let mut queues = self.shared.queues.lock();
        if !launched && queues.in_flight > 0 {
            return Err(SchedulerError::NotLaunched(queues.in_flight));
        }
        while queues.in_flight > 0 {
            self.shared.changed.wait(&mut queues);
        }

        Ok(())
    }

    /// Flush, then stop and join every scheduler thread
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        let Some(mut runtime) = self.runtime.lock().take() else {
            return Ok(());
        };

        {
            let mut queues = self.shared.queues.lock();
            while queues.in_flight > 0 {
                self.shared.changed.wait(&mut queues);
            }
        }

        self.shared.halt();
        for executor in &runtime.executors {
            // a closed channel means the executor already left
            let _ = executor.send(Task::Halt);
        }
        runtime.manager.request_stop_all();
        runtime.manager.await_threads_completion()?;

        debug!("Scheduler shut down");
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let queues = self.shared.queues.lock();
        let idle_executors = self.shared.idle.lock().executors.len();

        SchedulerStatus {
            queues: queues
                .queues
                .iter()
                .map(|(category, queue)| QueueStatus {
                    category: *category,
                    running: queue.running,
                    max_workers: queue.max_workers,
                    pending: queue.pending.len(),
                    backlog: queue.backlog,
                })
                .collect(),
            idle_executors,
            in_flight: queues.in_flight,
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            error!(error = ?error, "Failed to shut down scheduler");
        }
    }
}

fn dispatcher_loop(
    shared: Arc<Shared>,
    executors: Vec<Sender<Task>>,
    verbose: u8,
) -> impl FnMut(&WorkerControl) + Send + 'static {
    move |_control: &WorkerControl| loop {
        let job = {
            let mut queues = shared.queues.lock();
            let category = loop {
                if queues.halted {
                    return;
                }
                if let Some(category) = queues.choose_next() {
                    break category;
                }
                shared.changed.wait(&mut queues);
            };

            let Some(queue) = queues.queues.get_mut(&category) else {
                continue;
            };
            let Some(job) = queue.pending.pop_front() else {
                continue;
            };
            queue.running += 1;
            // room in the backlog for blocked submitters
            shared.changed.notify_all();
            job
        };

        let executor = {
            let mut idle = shared.idle.lock();
            loop {
                if idle.halted {
                    return;
                }
                if let Some(executor) = idle.executors.pop() {
                    break executor;
                }
                shared.idle_changed.wait(&mut idle);
            }
        };

        let category = job.category();
        trace!(category, executor, "Dispatching job");
        if executors[executor].send(Task::Run(job)).is_err() {
            error!(executor, "Executor is gone, dropping job");
            shared.finished(category);
        }

        if verbose > 1 {
            let queues = shared.queues.lock();
            info!(
                "Queues: {}",
                queues
                    .queues
                    .iter()
                    .map(|(category, queue)| format!(
                        "[{category}] {} running {} pending",
                        queue.running,
                        queue.pending.len()
                    ))
                    .join(" ")
            );
        }
    }
}

fn executor_loop(
    shared: Arc<Shared>,
    index: usize,
    tasks: Receiver<Task>,
    core: Option<usize>,
) -> impl FnMut(&WorkerControl) + Send + 'static {
    move |_control: &WorkerControl| {
        if let Some(core) = core {
            if let Err(error) = affinity::set_thread_affinity([core]) {
                warn!(error = ?error, executor = index, core, "Failed to pin executor");
            }
        }

        while let Ok(Task::Run(job)) = tasks.recv() {
            let category = job.category();
            if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
                error!(executor = index, category, "Job panicked");
            }

            shared.executor_done(index, category);
        }

        trace!(executor = index, "Executor leaving");
    }
}
