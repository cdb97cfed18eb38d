use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

#[cfg(test)]
mod lifecycle_test;

/// Run state of a single worker thread
#[derive(Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    Running = 1,
    RunLocal = 2,
    PauseRequested = 3,
    Paused = 4,
    StopRequested = 5,
    /// thread abandoned after a failed kill, its resources are unaccounted for
    Indeterminate = 6,
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Cannot {operation} worker {id} while it is {state:?}")]
    InvalidState {
        id: usize,
        operation: &'static str,
        state: RunState,
    },
    #[error("Worker {0} has no job to run")]
    NoJob(usize),
    #[error("Worker {0} is already registered")]
    DuplicateWorker(usize),
    #[error("Worker {0} is not registered")]
    UnknownWorker(usize),
    #[error("Worker {0} thread has already exited")]
    Exited(usize),
    #[error("Worker {0} stopped before reaching a pause point")]
    StoppedDuringPause(usize),
    #[error("Worker {0} thread panicked")]
    Panicked(usize),
    #[error("Worker {0} was abandoned and is in an indeterminate state")]
    Indeterminate(usize),
    #[error("Failed to spawn worker thread")]
    Spawn(#[from] std::io::Error),
}

/// Result of a forced stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// worker was not running
    NotRunning,
    /// thread exited within the timeout and was joined
    Joined,
    /// thread did not exit and was detached
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseAck {
    Paused,
    Stopped,
    Exited,
}

#[derive(Debug)]
struct Shared {
    id: usize,
    state: Mutex<RunState>,
    // only written while holding `state`
    exited: AtomicBool,
    ack_tx: Sender<PauseAck>,
    ack_rx: Receiver<PauseAck>,
    resume_tx: Sender<()>,
    resume_rx: Receiver<()>,
}

/// Handle given to the running job for cooperating with its owner
#[derive(Debug, Clone)]
pub struct WorkerControl {
    shared: Arc<Shared>,
}

impl WorkerControl {
    fn new(id: usize) -> Self {
        let (ack_tx, ack_rx) = unbounded();
        let (resume_tx, resume_rx) = unbounded();

        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(RunState::Idle),
                exited: AtomicBool::new(false),
                ack_tx,
                ack_rx,
                resume_tx,
                resume_rx,
            }),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.shared.id
    }

    pub fn state(&self) -> RunState {
        *self.shared.state.lock()
    }

    pub fn should_stop(&self) -> bool {
        self.state() == RunState::StopRequested
    }

    /// Safe point for the job loop: parks here while a pause is in effect.
    /// Returns false once a stop was requested.
    pub fn check_pause(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            match *state {
                RunState::PauseRequested => *state = RunState::Paused,
                RunState::StopRequested => return false,
                _ => return true,
            }
        }

        trace!(worker = self.shared.id, "Worker paused");
        // the ack receiver lives as long as `shared`, sending cannot fail
        let _ = self.shared.ack_tx.send(PauseAck::Paused);
        let _ = self.shared.resume_rx.recv();
        trace!(worker = self.shared.id, "Worker resumed");

        !self.should_stop()
    }

    fn set(&self, state: RunState) {
        *self.shared.state.lock() = state;
    }

    fn invalid(&self, operation: &'static str, state: RunState) -> LifecycleError {
        if state == RunState::Indeterminate {
            LifecycleError::Indeterminate(self.shared.id)
        } else {
            LifecycleError::InvalidState {
                id: self.shared.id,
                operation,
                state,
            }
        }
    }
}

/// The task loop executed by a worker
pub trait ThreadJob: Send + 'static {
    fn run(&mut self, control: &WorkerControl);
}

impl<F> ThreadJob for F
where
    F: FnMut(&WorkerControl) + Send + 'static,
{
    fn run(&mut self, control: &WorkerControl) {
        self(control)
    }
}

/// posts the exit bookkeeping when the thread leaves its job, also on panic
struct ExitNotice {
    control: WorkerControl,
    reaper: Option<Sender<usize>>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        {
            let state = self.control.shared.state.lock();
            self.control.shared.exited.store(true, Ordering::SeqCst);
            if *state == RunState::PauseRequested {
                let _ = self.control.shared.ack_tx.send(PauseAck::Exited);
            }
        }

        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.send(self.control.shared.id);
        }
    }
}

/// A single thread running a `ThreadJob`, with an explicit lifecycle
pub struct ThreadWorker {
    control: WorkerControl,
    name: String,
    job: Option<Box<dyn ThreadJob>>,
    handle: Option<JoinHandle<Box<dyn ThreadJob>>>,
    done: Option<Receiver<()>>,
    reaper: Option<Sender<usize>>,
}

impl fmt::Debug for ThreadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadWorker")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("state", &self.state())
            .field("launched", &self.handle.is_some())
            .finish()
    }
}

impl ThreadWorker {
    pub fn new(id: usize, job: impl ThreadJob) -> Self {
        Self::named(id, format!("worker-{id}"), job)
    }

    pub fn named(id: usize, name: impl Into<String>, job: impl ThreadJob) -> Self {
        Self {
            control: WorkerControl::new(id),
            name: name.into(),
            job: Some(Box::new(job)),
            handle: None,
            done: None,
            reaper: None,
        }
    }

    pub fn id(&self) -> usize {
        self.control.worker_id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn control(&self) -> &WorkerControl {
        &self.control
    }

    /// true while the worker thread has not exited
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// start the job loop in a new thread
    pub fn launch(&mut self) -> Result<(), LifecycleError> {
        {
            let mut state = self.control.shared.state.lock();
            if *state != RunState::Idle || self.handle.is_some() {
                return Err(self.control.invalid("launch", *state));
            }
            if self.job.is_none() {
                return Err(LifecycleError::NoJob(self.id()));
            }
            *state = RunState::Running;
            self.control.shared.exited.store(false, Ordering::SeqCst);
        }

        let mut job = self.job.take().ok_or(LifecycleError::NoJob(self.id()))?;
        let control = self.control.clone();
        let reaper = self.reaper.clone();
        let (done_tx, done_rx) = bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // dropped on exit, which disconnects `done`
                let _done = done_tx;
                let _notice = ExitNotice {
                    control: control.clone(),
                    reaper,
                };

                job.run(&control);
                job
            });

        match spawned {
            Ok(handle) => {
                debug!(worker = self.id(), name = self.name, "Launched worker thread");
                self.handle = Some(handle);
                self.done = Some(done_rx);
                Ok(())
            }
            Err(error) => {
                error!(error = ?error, worker = self.id(), "Failed to spawn worker thread");
                self.control.set(RunState::Idle);
                Err(error.into())
            }
        }
    }

    /// run the job loop synchronously in the calling thread
    pub fn run_here(&mut self) -> Result<(), LifecycleError> {
        {
            let mut state = self.control.shared.state.lock();
            if *state != RunState::Idle || self.handle.is_some() {
                return Err(self.control.invalid("run_here", *state));
            }
            if self.job.is_none() {
                return Err(LifecycleError::NoJob(self.id()));
            }
            *state = RunState::RunLocal;
        }

        let mut job = self.job.take().ok_or(LifecycleError::NoJob(self.id()))?;
        job.run(&self.control);
        self.job = Some(job);
        self.control.set(RunState::Idle);

        Ok(())
    }

    /// Ask the thread to pause and block until it has parked at a safe point
    pub fn pause(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.control.shared.state.lock();
            if *state != RunState::Running {
                return Err(self.control.invalid("pause", *state));
            }
            if self.control.shared.exited.load(Ordering::SeqCst) {
                return Err(LifecycleError::Exited(self.id()));
            }
            *state = RunState::PauseRequested;
        }

        match self.control.shared.ack_rx.recv() {
            Ok(PauseAck::Paused) => Ok(()),
            Ok(PauseAck::Stopped) | Ok(PauseAck::Exited) | Err(_) => {
                Err(LifecycleError::StoppedDuringPause(self.id()))
            }
        }
    }

    /// release a paused thread, without waiting for it to resume
    pub fn unpause(&self) -> Result<(), LifecycleError> {
        let mut state = self.control.shared.state.lock();
        if *state != RunState::Paused {
            return Err(self.control.invalid("unpause", *state));
        }

        *state = RunState::Running;
        let _ = self.control.shared.resume_tx.send(());
        Ok(())
    }

    /// fire-and-forget stop request
    pub fn request_stop(&self) -> Result<(), LifecycleError> {
        let mut state = self.control.shared.state.lock();
        match *state {
            RunState::Idle | RunState::StopRequested => {}
            RunState::Running | RunState::RunLocal => *state = RunState::StopRequested,
            RunState::PauseRequested => {
                *state = RunState::StopRequested;
                let _ = self.control.shared.ack_tx.send(PauseAck::Stopped);
            }
            RunState::Paused => {
                *state = RunState::StopRequested;
                let _ = self.control.shared.resume_tx.send(());
            }
            RunState::Indeterminate => return Err(LifecycleError::Indeterminate(self.id())),
        }

        Ok(())
    }

    /// wait for the thread to exit on its own and reclaim its job
    pub fn join(&mut self) -> Result<(), LifecycleError> {
        let Some(handle) = self.handle.take() else {
            return match self.state() {
                RunState::Indeterminate => Err(LifecycleError::Indeterminate(self.id())),
                _ => Ok(()),
            };
        };
        self.done = None;

        let joined = handle.join();
        self.control.set(RunState::Idle);

        match joined {
            Ok(job) => {
                self.job = Some(job);
                debug!(worker = self.id(), "Joined worker thread");
                Ok(())
            }
            Err(_) => {
                error!(worker = self.id(), "Worker thread panicked");
                Err(LifecycleError::Panicked(self.id()))
            }
        }
    }

    /// request stop and block until the thread has exited
    pub fn finish_mythread(&mut self, unlaunched_ok: bool) -> Result<(), LifecycleError> {
        if self.handle.is_none() {
            let state = self.state();
            return if state == RunState::Idle && unlaunched_ok {
                Ok(())
            } else {
                Err(self.control.invalid("finish", state))
            };
        }

        self.request_stop()?;
        self.join()
    }

    /// Stop with a bounded wait; a thread still alive after `timeout` is
    /// detached and the worker is left `Indeterminate`.
    pub fn kill_mythread(&mut self, timeout: Duration) -> Result<KillOutcome, LifecycleError> {
        if self.handle.is_none() {
            return match self.state() {
                RunState::Indeterminate => Err(LifecycleError::Indeterminate(self.id())),
                _ => Ok(KillOutcome::NotRunning),
            };
        }

        self.request_stop()?;

        let exited = match self.done.as_ref() {
            Some(done) => !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)),
            None => true,
        };

        if exited {
            self.join()?;
            return Ok(KillOutcome::Joined);
        }

        warn!(
            worker = self.id(),
            timeout = ?timeout,
            "Worker did not stop in time, abandoning its thread"
        );
        self.handle = None;
        self.done = None;
        self.control.set(RunState::Indeterminate);

        Ok(KillOutcome::Abandoned)
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(error) = self.finish_mythread(true) {
                error!(error = ?error, worker = self.id(), "Failed to finish worker on drop");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub name: String,
    pub state: RunState,
    pub running: bool,
}

/// Owns a set of workers and reaps them as they finish
#[derive(Debug)]
pub struct ThreadManager {
    workers: BTreeMap<usize, ThreadWorker>,
    running: BTreeSet<usize>,
    reap_tx: Sender<usize>,
    reap_rx: Receiver<usize>,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        let (reap_tx, reap_rx) = unbounded();

        Self {
            workers: BTreeMap::new(),
            running: BTreeSet::new(),
            reap_tx,
            reap_rx,
        }
    }

    pub fn add_thread(&mut self, mut worker: ThreadWorker) -> Result<usize, LifecycleError> {
        let id = worker.id();
        if self.workers.contains_key(&id) {
            return Err(LifecycleError::DuplicateWorker(id));
        }

        worker.reaper = Some(self.reap_tx.clone());
        self.workers.insert(id, worker);
        Ok(id)
    }

    /// next unused worker id
    pub fn next_id(&self) -> usize {
        self.workers.keys().next_back().map_or(0, |id| id + 1)
    }

    pub fn launch(&mut self, id: usize) -> Result<(), LifecycleError> {
        let worker = self
            .workers
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownWorker(id))?;

        worker.launch()?;
        self.running.insert(id);
        Ok(())
    }

    /// launch every idle worker that still holds its job
    pub fn launch_all(&mut self) -> Result<(), LifecycleError> {
        let ids: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.state() == RunState::Idle && worker.job.is_some())
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            self.launch(id)?;
        }

        Ok(())
    }

    pub fn request_stop_all(&self) {
        for worker in self.workers.values() {
            if let Err(error) = worker.request_stop() {
                warn!(error = ?error, worker = worker.id(), "Failed to request stop");
            }
        }
    }

    /// Kill worker `id`. An abandoned worker no longer counts as running.
    pub fn kill(&mut self, id: usize, timeout: Duration) -> Result<KillOutcome, LifecycleError> {
        let worker = self
            .workers
            .get_mut(&id)
            .ok_or(LifecycleError::UnknownWorker(id))?;

        let outcome = worker.kill_mythread(timeout)?;
        self.running.remove(&id);
        Ok(outcome)
    }

    /// number of launched workers not yet reaped
    pub fn remaining(&self) -> usize {
        self.running
            .iter()
            .filter(|id| !self.is_abandoned(**id))
            .count()
    }

    fn is_abandoned(&self, id: usize) -> bool {
        self.workers
            .get(&id)
            .map_or(true, |worker| worker.state() == RunState::Indeterminate)
    }

    // workers killed through `worker_mut` never send a notice we can wait for
    fn forget_abandoned(&mut self) {
        let abandoned: Vec<usize> = self
            .running
            .iter()
            .copied()
            .filter(|id| self.is_abandoned(*id))
            .collect();

        for id in abandoned {
            debug!(worker = id, "Forgetting abandoned worker");
            self.running.remove(&id);
        }
    }

    /// Block until every launched worker has exited, joining each as its
    /// completion notice arrives. Returns the first join failure.
    pub fn await_threads_completion(&mut self) -> Result<(), LifecycleError> {
        let mut first_error = None;
        self.forget_abandoned();

        while !self.running.is_empty() {
            // the manager holds a sender, so this only ends by a notice
            let Ok(id) = self.reap_rx.recv() else { break };
            if !self.running.remove(&id) {
                trace!(worker = id, "Ignoring stale completion notice");
                continue;
            }

            if let Some(worker) = self.workers.get_mut(&id) {
                if let Err(error) = worker.join() {
                    first_error.get_or_insert(error);
                }
            }
            debug!(worker = id, remaining = self.running.len(), "Reaped worker");
        }

        first_error.map_or(Ok(()), Err)
    }

    pub fn worker(&self, id: usize) -> Option<&ThreadWorker> {
        self.workers.get(&id)
    }

    pub fn worker_mut(&mut self, id: usize) -> Option<&mut ThreadWorker> {
        self.workers.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn status(&self) -> Vec<WorkerStatus> {
        self.workers
            .values()
            .map(|worker| WorkerStatus {
                id: worker.id(),
                name: worker.name.clone(),
                state: worker.state(),
                running: worker.is_running(),
            })
            .collect()
    }
}
