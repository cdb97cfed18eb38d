pub mod accumulate;
pub mod disk;
pub mod host;
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;
pub mod ranks;
pub mod registry;
pub mod spawn;


pub use accumulate::{launch_accumulate, Accumulate, AccumulateComm};
pub use disk::{DiskBackend, DiskMailbox};
pub use host::WorkerHost;
pub use local::LocalBackend;
#[cfg(feature = "mpi")]
pub use self::mpi::MpiWorld;
pub use ranks::{Communicator, LocalRank, LocalWorld, RankBackend, Topology};
pub use registry::{class_hash, WorkerRegistry};
pub use spawn::SpawnBackend;

use crate::{
    lifecycle::LifecycleError,
    pool::{Pool, PoolError, Pooled},
    state::{StateError, StateStore},
    wire::{
        Channel, Decode, Encode, TxBuffer, WireError, WireRead, WireReadExt, WireWrite,
        WireWriteExt,
    },
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fmt, mem,
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Backend-specific worker identity
pub type Wid = i32;

/// Identity of the top-level controller on every backend
pub const CONTROLLER: Wid = 0;

pub type SharedComm = Arc<Mutex<dyn JobComm>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    State,
    Resource,
    Job,
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Worker class {0:#018x} is not registered")]
    UnregisteredWorker(u64),
    #[error("Worker class {0:?} is already registered or collides with another name")]
    DuplicateWorker(String),
    #[error("Transport failure")]
    Wire(#[from] WireError),
    #[error("Checkpoint store failure")]
    State(#[from] StateError),
    #[error("Buffer pool failure")]
    Pool(#[from] PoolError),
    #[error("Worker thread failure")]
    Lifecycle(#[from] LifecycleError),
    #[error("No worker can be allocated and no job is outstanding")]
    AllocationDeadlock,
    #[error("Worker {wid} failed with exit code {code:?}")]
    WorkerFailed { wid: Wid, code: Option<i32> },
    #[error("Failed to start worker process")]
    Spawn(#[from] std::io::Error),
    #[error("Job result was harvested more often than jobs were started")]
    HarvestedTwice,
    #[error("No outstanding job on worker {0}")]
    UnknownJob(Wid),
    #[error("Job failed: {0}")]
    Job(String),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnregisteredWorker(_) | Self::DuplicateWorker(_) => ErrorKind::Configuration,
            Self::Wire(_) => ErrorKind::Transport,
            Self::State(_) | Self::Lifecycle(_) | Self::HarvestedTwice | Self::UnknownJob(_) => {
                ErrorKind::State
            }
            Self::Pool(_) | Self::AllocationDeadlock | Self::Spawn(_) => ErrorKind::Resource,
            Self::WorkerFailed { .. } | Self::Job(_) => ErrorKind::Job,
        }
    }

    /// whether the run cannot meaningfully continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Configuration | ErrorKind::Transport | ErrorKind::Resource
        )
    }
}

/// One unit of work as shipped to a worker
#[derive(Clone, Default)]
pub struct JobSpec {
    pub uid: i32,
    pub wid: Wid,
    /// hashed worker class name, 0 stops the worker
    pub wclass: u64,
    pub n0: u64,
    pub n1: u64,
    /// submission-side payload hooks, never sent
    pub comm: Option<SharedComm>,
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("uid", &self.uid)
            .field("wid", &self.wid)
            .field("wclass", &format_args!("{:#018x}", self.wclass))
            .field("range", &(self.n0..self.n1))
            .field("comm", &self.comm.is_some())
            .finish()
    }
}

impl JobSpec {
    pub fn new(wclass: u64, uid: i32, n0: u64, n1: u64) -> Self {
        Self {
            uid,
            wid: 0,
            wclass,
            n0,
            n1,
            comm: None,
        }
    }

    pub fn with_comm(mut self, comm: SharedComm) -> Self {
        self.comm = Some(comm);
        self
    }

    /// shutdown sentinel
    pub fn stop() -> Self {
        Self::default()
    }

    pub fn is_stop(&self) -> bool {
        self.wclass == 0
    }
}

impl Encode for JobSpec {
    fn encode<W: WireWrite + ?Sized>(&self, w: &mut W) -> Result<(), WireError> {
        w.transaction(|w| {
            w.send(&self.uid)?;
            w.send(&self.wid)?;
            w.send(&self.wclass)?;
            w.send(&self.n0)?;
            w.send(&self.n1)
        })
    }
}

impl Decode for JobSpec {
    fn decode<R: WireRead + ?Sized>(r: &mut R) -> Result<Self, WireError> {
        Ok(Self {
            uid: r.receive()?,
            wid: r.receive()?,
            wclass: r.receive()?,
            n0: r.receive()?,
            n1: r.receive()?,
            comm: None,
        })
    }
}

/// Split `0..n_items` into `n_split` contiguous jobs sharing one comm
pub fn split_jobs(
    comm: Option<SharedComm>,
    n_split: u64,
    n_items: u64,
    wclass: u64,
    uid: i32,
) -> Vec<JobSpec> {
    let n_split = n_split.max(1);

    (0..n_split)
        .map(|index| JobSpec {
            uid: uid + index as i32,
            wid: 0,
            wclass,
            n0: n_items * index / n_split,
            n1: n_items * (index + 1) / n_split,
            comm: comm.clone(),
        })
        .collect()
}

/// Submission-side payload hooks
pub trait JobComm: Send {
    /// write the job's input after its spec
    fn start_job(&mut self, spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError>;
    /// read back the job's output once it finished
    fn end_job(&mut self, spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError>;
}

/// Worker-side payload entry point
pub trait JobWorker: Send {
    fn run(
        &mut self,
        spec: &JobSpec,
        io: &mut dyn Channel,
        state: &mut StateStore,
    ) -> Result<(), ControlError>;
}

/// What an in-process backend needs to execute a job itself
pub struct WorkerContext<'a> {
    pub host: &'a mut WorkerHost,
    pub state: &'a mut StateStore,
}

/// Transport primitives a job-control backend provides
pub trait Backend {
    /// backend startup, returns this process's own identity
    fn init(&mut self, state: &mut StateStore) -> Result<Wid, ControlError>;
    fn send_raw(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError>;
    fn receive_raw(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError>;
    /// a free worker, if any; never blocks
    fn alloc_worker(&mut self) -> Result<Option<Wid>, ControlError>;
    fn is_running(&mut self, wid: Wid, ctx: &mut WorkerContext<'_>)
        -> Result<bool, ControlError>;
    fn clear_in(&mut self, src: Wid) -> Result<(), ControlError>;
    fn clear_out(&mut self, dest: Wid) -> Result<(), ControlError>;
    /// worker side: tell `dest` the current job is complete
    fn signal_done(&mut self, _dest: Wid) -> Result<(), ControlError> {
        Ok(())
    }
    fn release(&mut self, wid: Wid);
    /// number of workers jobs can run on concurrently
    fn capacity(&self) -> usize;
    /// whether workers serve more than one job
    fn persistent_workers(&self) -> bool;
    /// persistent workers waiting for a stop sentinel
    fn workers(&self) -> Vec<Wid>;
    fn finish(&mut self, state: &mut StateStore) -> Result<(), ControlError>;
}

/// Byte channel to one peer over a backend
struct PeerChannel<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    peer: Wid,
    tx: TxBuffer,
    buffer: Pooled<Vec<u8>>,
}

impl<'a, B: Backend + ?Sized> PeerChannel<'a, B> {
    fn new(backend: &'a mut B, buffers: &Pool<Vec<u8>>, peer: Wid) -> Result<Self, PoolError> {
        let mut buffer = buffers.checkout()?;
        let tx = TxBuffer::with_buffer(mem::take(&mut *buffer));

        Ok(Self {
            backend,
            peer,
            tx,
            buffer,
        })
    }
}

impl<'a, B: Backend + ?Sized> WireWrite for PeerChannel<'a, B> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        let backend = &mut *self.backend;
        let peer = self.peer;
        self.tx.write(bytes, |bytes| backend.send_raw(peer, bytes))
    }

    fn start_transaction(&mut self) {
        self.tx.begin();
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        let backend = &mut *self.backend;
        let peer = self.peer;
        self.tx.end(|bytes| backend.send_raw(peer, bytes))
    }
}

impl<'a, B: Backend + ?Sized> WireRead for PeerChannel<'a, B> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        self.backend.receive_raw(self.peer, buf)
    }
}

impl<'a, B: Backend + ?Sized> Drop for PeerChannel<'a, B> {
    fn drop(&mut self) {
        *self.buffer = mem::take(&mut self.tx).into_inner();
    }
}

/// Job submission and tracking over one backend
pub struct MultiJobControl<B: Backend> {
    backend: B,
    host: WorkerHost,
    state: StateStore,
    jobs: BTreeMap<Wid, JobSpec>,
    buffers: Pool<Vec<u8>>,
    poll_interval: Duration,
    chunks: Option<u64>,
    rank: Option<Wid>,
}

impl<B: Backend> fmt::Debug for MultiJobControl<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiJobControl")
            .field("rank", &self.rank)
            .field("outstanding", &self.jobs.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<B: Backend> MultiJobControl<B> {
    pub fn new(backend: B, registry: Arc<WorkerRegistry>, state: StateStore) -> Self {
        let host = WorkerHost::new(registry, backend.persistent_workers());

        Self {
            backend,
            host,
            state,
            jobs: BTreeMap::new(),
            buffers: Pool::new(16, 256),
            poll_interval: Duration::from_millis(10),
            chunks: None,
            rank: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// split ranges into `chunks` jobs instead of one per worker
    pub fn with_chunks(mut self, chunks: u64) -> Self {
        self.chunks = Some(chunks).filter(|chunks| *chunks > 0);
        self
    }

    /// start the backend, returning this process's identity
    pub fn init(&mut self) -> Result<Wid, ControlError> {
        let rank = self.backend.init(&mut self.state)?;
        self.rank = Some(rank);

        debug!(rank, capacity = self.backend.capacity(), "Job control initialized");
        Ok(rank)
    }

    pub fn rank(&self) -> Option<Wid> {
        self.rank
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// checkpoint store for job bodies
    pub fn state(&mut self) -> &mut StateStore {
        &mut self.state
    }

    /// number of jobs a range should be split into
    pub fn n_chunk(&self) -> u64 {
        self.chunks
            .unwrap_or_else(|| self.backend.capacity().max(1) as u64)
    }

    /// outstanding job ids
    pub fn outstanding(&self) -> Vec<Wid> {
        self.jobs.keys().copied().collect()
    }

    /// Send `spec` to a newly allocated worker, blocking until one is free
    #[instrument(skip(self), level = "debug")]
    pub fn submit_job(&mut self, mut spec: JobSpec) -> Result<Wid, ControlError> {
        let wid = self.allocate()?;
        spec.wid = wid;

        let sent = {
            let mut io = PeerChannel::new(&mut self.backend, &self.buffers, wid)?;
            io.start_transaction();
            let result = io.send(&spec).map_err(ControlError::from).and_then(|_| {
                match &spec.comm {
                    Some(comm) => comm.lock().start_job(&spec, &mut io),
                    None => Ok(()),
                }
            });

            match result {
                Ok(()) => io.end_transaction().map_err(ControlError::from),
                Err(error) => {
                    // the worker never sees a partial job
                    let dropped = io.tx.discard();
                    debug!(wid, uid = spec.uid, dropped, "Discarded unsent job");
                    Err(error)
                }
            }
        };

        if let Err(error) = sent {
            if let Err(cleanup) = self.backend.clear_out(wid) {
                warn!(wid, error = %cleanup, "Failed to clear outbound channel");
            }
            self.backend.release(wid);
            return Err(error);
        }

        trace!(wid, uid = spec.uid, "Submitted job");
        self.jobs.insert(wid, spec);
        Ok(wid)
    }

    fn allocate(&mut self) -> Result<Wid, ControlError> {
        loop {
            if let Some(wid) = self.backend.alloc_worker()? {
                return Ok(wid);
            }
            if self.jobs.is_empty() {
                warn!("No worker available with nothing outstanding");
                return Err(ControlError::AllocationDeadlock);
            }

            if self.check_jobs()? == self.jobs.len() {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Probe `wid`; the first call after it finished harvests its result
    pub fn is_running(&mut self, wid: Wid) -> Result<bool, ControlError> {
        if !self.jobs.contains_key(&wid) {
            return Ok(false);
        }

        let mut ctx = WorkerContext {
            host: &mut self.host,
            state: &mut self.state,
        };
        match self.backend.is_running(wid, &mut ctx) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(error) => {
                self.jobs.remove(&wid);
                self.backend.release(wid);
                return Err(error);
            }
        }

        // removed before harvesting so a result is never read twice
        let spec = self.jobs.remove(&wid).ok_or(ControlError::UnknownJob(wid))?;
        let harvested = match &spec.comm {
            Some(comm) => {
                let mut io = PeerChannel::new(&mut self.backend, &self.buffers, wid)?;
                let result = comm.lock().end_job(&spec, &mut io);
                result
            }
            None => Ok(()),
        };

        let cleared = self
            .backend
            .clear_in(wid)
            .and_then(|_| self.backend.clear_out(wid));
        self.backend.release(wid);
        trace!(wid, uid = spec.uid, "Harvested job");

        harvested.and(cleared).map(|_| false)
    }

    /// poll every outstanding job once, returning how many still run
    pub fn check_jobs(&mut self) -> Result<usize, ControlError> {
        let mut running = 0;
        for wid in self.outstanding() {
            if self.is_running(wid)? {
                running += 1;
            }
        }

        Ok(running)
    }

    /// Block until every outstanding job was harvested
    pub fn wait_complete(&mut self) -> Result<(), ControlError> {
        let mut backoff = self.poll_interval;
        while self.check_jobs()? > 0 {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(self.poll_interval * 8);
        }

        Ok(())
    }

    /// Block until the jobs on `ids` were harvested
    pub fn wait_for(&mut self, ids: &[Wid]) -> Result<(), ControlError> {
        let mut backoff = self.poll_interval;
        loop {
            let mut running = false;
            for wid in ids {
                running |= self.is_running(*wid)?;
            }
            if !running {
                return Ok(());
            }

            thread::sleep(backoff);
            backoff = (backoff * 2).min(self.poll_interval * 8);
        }
    }

    /// Worker side: serve jobs sent by `controller` until told to stop, or
    /// after a single job on one-shot backends. Returns the number served.
    #[instrument(skip(self), level = "debug")]
    pub fn run_worker(&mut self, controller: Wid) -> Result<usize, ControlError> {
        let mut served = 0;

        loop {
            let spec = {
                let mut io = PeerChannel::new(&mut self.backend, &self.buffers, controller)?;
                self.host.serve(&mut io, &mut self.state)?
            };
            let Some(spec) = spec else {
                debug!(served, "Received stop sentinel");
                break;
            };

            served += 1;
            self.backend.clear_in(controller)?;
            self.backend.signal_done(controller)?;
            trace!(uid = spec.uid, wclass = spec.wclass, "Served job");

            if !self.backend.persistent_workers() {
                break;
            }
        }

        Ok(served)
    }

    /// Controller side: harvest everything, stop persistent workers and
    /// close the backend
    pub fn shutdown_workers(&mut self) -> Result<(), ControlError> {
        self.wait_complete()?;

        if self.backend.persistent_workers() {
            for wid in self.backend.workers() {
                let mut io = PeerChannel::new(&mut self.backend, &self.buffers, wid)?;
                io.send(&JobSpec::stop())?;
            }
        }

        self.finish()?;
        info!("Workers shut down");
        Ok(())
    }

    /// close the backend, persisting worker state where supported
    pub fn finish(&mut self) -> Result<(), ControlError> {
        self.backend.finish(&mut self.state)
    }
}
