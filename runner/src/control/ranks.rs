use super::{Backend, ControlError, JobSpec, MultiJobControl, Wid, WorkerContext};
use crate::{
    state::StateStore,
    wire::{MemReader, MemWriter, WireError, WireReadExt, WireWrite, WireWriteExt},
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    env, mem,
    sync::Arc,
    thread,
};
use tracing::{debug, info, instrument, trace, warn};

/// tag carrying job specs, payloads and results
pub const DATA_TAG: i32 = 2;
/// out-of-band tag announcing a finished job
pub const DONE_TAG: i32 = 3;

/// Point-to-point message passing between numbered ranks
pub trait Communicator {
    fn rank(&self) -> Wid;
    fn size(&self) -> Wid;
    fn send(&self, dest: Wid, tag: i32, data: &[u8]) -> Result<(), WireError>;
    /// blocking receive of the next whole message
    fn receive(&self, src: Wid, tag: i32) -> Result<Vec<u8>, WireError>;
    /// whether a message from `src` with `tag` is waiting
    fn probe(&self, src: Wid, tag: i32) -> Result<bool, WireError>;

    fn processor_name(&self) -> String {
        nix::unistd::gethostname()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| String::from("unknown"))
    }
}

type Mailboxes = HashMap<(Wid, Wid, i32), VecDeque<Vec<u8>>>;

#[derive(Default)]
struct WorldInner {
    mailboxes: Mutex<Mailboxes>,
    arrived: Condvar,
}

/// Ranks living as threads of one process
pub struct LocalWorld;

impl LocalWorld {
    /// one communicator per rank, all connected to each other
    #[allow(clippy::new_ret_no_self)]
    pub fn new(size: usize) -> Vec<LocalRank> {
        let inner = Arc::new(WorldInner::default());

        (0..size as Wid)
            .map(|rank| LocalRank {
                rank,
                size: size as Wid,
                inner: inner.clone(),
            })
            .collect()
    }
}

pub struct LocalRank {
    rank: Wid,
    size: Wid,
    inner: Arc<WorldInner>,
}

impl LocalRank {
    fn check(&self, peer: Wid) -> Result<(), WireError> {
        if peer < 0 || peer >= self.size {
            return Err(WireError::Unavailable(peer));
        }
        Ok(())
    }
}

impl Communicator for LocalRank {
    fn rank(&self) -> Wid {
        self.rank
    }

    fn size(&self) -> Wid {
        self.size
    }

    fn send(&self, dest: Wid, tag: i32, data: &[u8]) -> Result<(), WireError> {
        self.check(dest)?;

        self.inner
            .mailboxes
            .lock()
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(data.to_vec());
        self.inner.arrived.notify_all();
        Ok(())
    }

    fn receive(&self, src: Wid, tag: i32) -> Result<Vec<u8>, WireError> {
        self.check(src)?;

        let mut mailboxes = self.inner.mailboxes.lock();
        loop {
            if let Some(message) = mailboxes
                .get_mut(&(src, self.rank, tag))
                .and_then(VecDeque::pop_front)
            {
                return Ok(message);
            }
            self.inner.arrived.wait(&mut mailboxes);
        }
    }

    fn probe(&self, src: Wid, tag: i32) -> Result<bool, WireError> {
        self.check(src)?;

        Ok(self
            .inner
            .mailboxes
            .lock()
            .get(&(src, self.rank, tag))
            .map_or(false, |queue| !queue.is_empty()))
    }
}

/// Position of one rank in the flat or two-level distribution tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub rank: Wid,
    pub size: Wid,
    pub cores_per_node: Wid,
    pub parent: Option<Wid>,
    pub children: Vec<Wid>,
}

impl Topology {
    /// Flat when every rank fits on one node. Otherwise rank 0 feeds one
    /// controller per node (rank 1 on the first node, the first rank of every
    /// other node), which feeds the remaining ranks of its node.
    pub fn compute(rank: Wid, size: Wid, cores_per_node: Wid) -> Self {
        let cores = cores_per_node.max(1);
        let (parent, children) = if size <= cores {
            if rank == 0 {
                (None, (1..size).collect())
            } else {
                (Some(0), Vec::new())
            }
        } else {
            let node_controller = |node: Wid| if node == 0 { 1 } else { node * cores };
            let node = rank / cores;
            let node_end = ((node + 1) * cores).min(size);

            if rank == 0 {
                let nodes = (size + cores - 1) / cores;
                let mut controllers: Vec<Wid> = (0..nodes).map(node_controller).collect();
                controllers.dedup();
                (None, controllers)
            } else if rank == node_controller(node) {
                (Some(0), (rank + 1..node_end).collect())
            } else {
                (Some(node_controller(node)), Vec::new())
            }
        };

        Self {
            rank,
            size,
            cores_per_node: cores,
            parent,
            children,
        }
    }

    /// cores per node from `SLURM_CPUS_ON_NODE`, defaulting to 1
    pub fn from_env(rank: Wid, size: Wid) -> Self {
        let cores = env::var("SLURM_CPUS_ON_NODE")
            .ok()
            .and_then(|cores| cores.trim().parse().ok())
            .unwrap_or(1);

        Self::compute(rank, size, cores)
    }

    /// a rank both receiving from a parent and feeding children
    pub fn is_relay(&self) -> bool {
        self.parent.is_some() && !self.children.is_empty()
    }
}

/// Prefix `body` with the rank it is meant for or comes from
fn frame(rank: Wid, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut writer = MemWriter::new();
    writer.send(&rank)?;
    writer.write_bytes(body)?;
    Ok(writer.into_inner())
}

fn unframe(message: &[u8]) -> Result<(Wid, &[u8]), WireError> {
    let rank: Wid = MemReader::new(message).receive()?;
    Ok((rank, &message[mem::size_of::<Wid>()..]))
}

/// Backend over a `Communicator`. Jobs are addressed to the ranks that run
/// them; on the top rank of a two-level tree, traffic for ranks behind a node
/// controller is framed with the target rank and sent through it.
pub struct RankBackend<C: Communicator> {
    comm: C,
    topology: Topology,
    /// ranks that run jobs, in allocation order
    leaves: Vec<Wid>,
    /// leaf -> node controller carrying its traffic
    routes: HashMap<Wid, Wid>,
    relays: BTreeSet<Wid>,
    /// message currently being read per source
    inbox: HashMap<Wid, (Vec<u8>, usize)>,
    /// whole messages received ahead of being read
    pending: HashMap<Wid, VecDeque<Vec<u8>>>,
    /// routed leaves whose done notice already arrived
    done: BTreeSet<Wid>,
    busy: BTreeSet<Wid>,
}

impl<C: Communicator> RankBackend<C> {
    pub fn new(comm: C, topology: Topology) -> Self {
        let mut leaves = Vec::new();
        let mut routes = HashMap::new();
        let mut relays = BTreeSet::new();

        for &child in &topology.children {
            let below = if topology.parent.is_none() {
                Topology::compute(child, topology.size, topology.cores_per_node).children
            } else {
                Vec::new()
            };

            if below.is_empty() {
                leaves.push(child);
            } else {
                relays.insert(child);
                for leaf in below {
                    routes.insert(leaf, child);
                    leaves.push(leaf);
                }
            }
        }

        Self {
            comm,
            topology,
            leaves,
            routes,
            relays,
            inbox: HashMap::new(),
            pending: HashMap::new(),
            done: BTreeSet::new(),
            busy: BTreeSet::new(),
        }
    }

    /// flat topology, every other rank works for rank 0
    pub fn flat(comm: C) -> Self {
        let size = comm.size();
        let topology = Topology::compute(comm.rank(), size, size);
        Self::new(comm, topology)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn communicator(&self) -> &C {
        &self.comm
    }

    /// ranks jobs are allocated to
    pub fn leaves(&self) -> &[Wid] {
        &self.leaves
    }

    /// Take every message waiting from node controller `via` and sort it
    /// by the leaf it came from
    fn pump(&mut self, via: Wid) -> Result<(), WireError> {
        while self.comm.probe(via, DATA_TAG)? {
            let message = self.comm.receive(via, DATA_TAG)?;
            let (leaf, body) = unframe(&message)?;
            self.pending.entry(leaf).or_default().push_back(body.to_vec());
        }
        while self.comm.probe(via, DONE_TAG)? {
            let message = self.comm.receive(via, DONE_TAG)?;
            let (leaf, _) = unframe(&message)?;
            self.done.insert(leaf);
        }

        Ok(())
    }

    /// next whole message from `src`, blocking until one arrives
    fn next_message(&mut self, src: Wid) -> Result<Vec<u8>, WireError> {
        loop {
            if let Some(message) = self.pending.get_mut(&src).and_then(VecDeque::pop_front) {
                return Ok(message);
            }

            match self.routes.get(&src).copied() {
                Some(via) => {
                    let message = self.comm.receive(via, DATA_TAG)?;
                    let (leaf, body) = unframe(&message)?;
                    self.pending.entry(leaf).or_default().push_back(body.to_vec());
                }
                None => return self.comm.receive(src, DATA_TAG),
            }
        }
    }
}

impl<C: Communicator> Backend for RankBackend<C> {
    fn init(&mut self, _state: &mut StateStore) -> Result<Wid, ControlError> {
        info!(
            rank = self.comm.rank(),
            size = self.comm.size(),
            host = %self.comm.processor_name(),
            parent = ?self.topology.parent,
            children = self.topology.children.len(),
            leaves = self.leaves.len(),
            "Rank joined"
        );
        Ok(self.comm.rank())
    }

    fn send_raw(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError> {
        if self.relays.contains(&dest) {
            return self.comm.send(dest, DATA_TAG, &frame(dest, bytes)?);
        }

        match self.routes.get(&dest) {
            Some(&via) => self.comm.send(via, DATA_TAG, &frame(dest, bytes)?),
            None => self.comm.send(dest, DATA_TAG, bytes),
        }
    }

    /// reads are served from the current message of `src`, and may not
    /// cross into the next one
    fn receive_raw(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError> {
        let (message, position) = match self.inbox.remove(&src) {
            Some(current) => current,
            None => (self.next_message(src)?, 0),
        };

        let remaining = message.len() - position;
        if buf.len() > remaining {
            return Err(WireError::Boundary {
                wanted: buf.len(),
                remaining,
            });
        }

        buf.copy_from_slice(&message[position..position + buf.len()]);
        let position = position + buf.len();
        if position < message.len() {
            self.inbox.insert(src, (message, position));
        }

        Ok(())
    }

    fn alloc_worker(&mut self) -> Result<Option<Wid>, ControlError> {
        let free = self
            .leaves
            .iter()
            .copied()
            .find(|wid| !self.busy.contains(wid));
        if let Some(wid) = free {
            self.busy.insert(wid);
        }

        Ok(free)
    }

    /// Results are received as soon as they are announced, so a sender
    /// blocked until its message is matched never waits on the done notice.
    /// The done notice is consumed once seen.
    fn is_running(&mut self, wid: Wid, _ctx: &mut WorkerContext<'_>) -> Result<bool, ControlError> {
        if let Some(via) = self.routes.get(&wid).copied() {
            self.pump(via)?;
            return Ok(!self.done.remove(&wid));
        }

        while self.comm.probe(wid, DATA_TAG)? {
            let message = self.comm.receive(wid, DATA_TAG)?;
            self.pending.entry(wid).or_default().push_back(message);
        }
        if !self.comm.probe(wid, DONE_TAG)? {
            return Ok(true);
        }

        self.comm.receive(wid, DONE_TAG)?;
        Ok(false)
    }

    fn clear_in(&mut self, src: Wid) -> Result<(), ControlError> {
        self.inbox.remove(&src);
        self.pending.remove(&src);
        Ok(())
    }

    fn clear_out(&mut self, _dest: Wid) -> Result<(), ControlError> {
        Ok(())
    }

    fn signal_done(&mut self, dest: Wid) -> Result<(), ControlError> {
        Ok(self.comm.send(dest, DONE_TAG, &[])?)
    }

    fn release(&mut self, wid: Wid) {
        self.busy.remove(&wid);
        self.done.remove(&wid);
    }

    /// every leaf this rank feeds, directly or through a node controller
    fn capacity(&self) -> usize {
        self.leaves.len()
    }

    fn persistent_workers(&self) -> bool {
        true
    }

    fn workers(&self) -> Vec<Wid> {
        self.topology.children.clone()
    }

    fn finish(&mut self, _state: &mut StateStore) -> Result<(), ControlError> {
        debug!(rank = self.comm.rank(), "Rank finished");
        Ok(())
    }
}

impl<C: Communicator> MultiJobControl<RankBackend<C>> {
    /// Middle tier of a two-level tree. Jobs from the parent are framed with
    /// the child that runs them and go straight on to it; results and done
    /// notices go back up framed with the child they came from, as they
    /// arrive. Returns the number of jobs relayed once the parent sent the
    /// stop sentinel and every child finished.
    #[instrument(skip(self), level = "debug")]
    pub fn relay(&mut self) -> Result<usize, ControlError> {
        let topology = self.backend.topology.clone();
        let Some(parent) = topology.parent else {
            return Ok(0);
        };
        if topology.children.is_empty() {
            return self.run_worker(parent);
        }

        let comm = &self.backend.comm;
        let mut busy: BTreeSet<Wid> = BTreeSet::new();
        let mut relayed = 0;
        let mut stopping = false;

        loop {
            let mut progressed = false;

            while !stopping && comm.probe(parent, DATA_TAG)? {
                let message = comm.receive(parent, DATA_TAG)?;
                let (child, body) = unframe(&message)?;
                progressed = true;

                if child == topology.rank {
                    let spec: JobSpec = MemReader::new(body).receive()?;
                    if spec.is_stop() {
                        stopping = true;
                    } else {
                        warn!(uid = spec.uid, "Job addressed to a node controller, dropped");
                    }
                } else if topology.children.contains(&child) {
                    trace!(child, "Relaying job");
                    comm.send(child, DATA_TAG, body)?;
                    busy.insert(child);
                } else {
                    warn!(child, "Message for a rank outside this node, dropped");
                }
            }

            for child in busy.clone() {
                while comm.probe(child, DATA_TAG)? {
                    let result = comm.receive(child, DATA_TAG)?;
                    comm.send(parent, DATA_TAG, &frame(child, &result)?)?;
                    progressed = true;
                }
                if comm.probe(child, DONE_TAG)? {
                    comm.receive(child, DONE_TAG)?;
                    while comm.probe(child, DATA_TAG)? {
                        let result = comm.receive(child, DATA_TAG)?;
                        comm.send(parent, DATA_TAG, &frame(child, &result)?)?;
                    }
                    comm.send(parent, DONE_TAG, &frame(child, &[])?)?;
                    busy.remove(&child);
                    relayed += 1;
                    progressed = true;
                }
            }

            if stopping && busy.is_empty() {
                let mut stop = MemWriter::new();
                stop.send(&JobSpec::stop())?;
                for child in &topology.children {
                    comm.send(*child, DATA_TAG, stop.as_slice())?;
                }
                break;
            }
            if !progressed {
                thread::sleep(self.poll_interval);
            }
        }

        debug!(relayed, "Relay stopped");
        Ok(relayed)
    }
}
