use super::{Backend, ControlError, Wid, WorkerContext, CONTROLLER};
use crate::{
    state::StateStore,
    wire::{FileWriter, WireError, WireWrite},
};
use globset::{Glob, GlobSetBuilder};
use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File},
    io::{ErrorKind, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, trace, warn};

/// Append-only per-peer, per-direction file mailboxes in one directory
#[derive(Debug)]
pub struct DiskMailbox {
    dir: PathBuf,
    rank: Wid,
    cursors: HashMap<Wid, u64>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl DiskMailbox {
    pub fn new(dir: impl Into<PathBuf>, rank: Wid) -> Self {
        Self {
            dir: dir.into(),
            rank,
            cursors: HashMap::new(),
            poll_interval: Duration::from_millis(5),
            timeout: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// give up on a read after `timeout` without enough data
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn rank(&self) -> Wid {
        self.rank
    }

    pub fn buffer_path(&self, src: Wid, dst: Wid) -> PathBuf {
        self.dir.join(format!("CommBuffer_{src}_to_{dst}.dat"))
    }

    pub fn done_path(&self, src: Wid, dst: Wid) -> PathBuf {
        self.dir.join(format!("CommDone_{src}_to_{dst}.flag"))
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(StateStore::file_name(&self.rank.to_string()))
    }

    /// append `bytes` to the mailbox of `dest`
    pub fn send(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError> {
        let mut writer = FileWriter::append(self.buffer_path(self.rank, dest))?;
        writer.write_bytes(bytes)
    }

    /// Poll the mailbox from `src` until `buf` can be filled
    pub fn receive(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError> {
        let path = self.buffer_path(src, self.rank);
        let cursor = self.cursors.get(&src).copied().unwrap_or(0);
        let wanted = cursor + buf.len() as u64;
        let start = Instant::now();

        loop {
            let size = match fs::metadata(&path) {
                Ok(metadata) => metadata.len(),
                Err(error) if error.kind() == ErrorKind::NotFound => 0,
                Err(error) => return Err(error.into()),
            };

            if size >= wanted {
                let mut file = File::open(&path)?;
                file.seek(SeekFrom::Start(cursor))?;
                file.read_exact(buf)?;
                self.cursors.insert(src, wanted);
                return Ok(());
            }

            if self.timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                warn!(src, size, wanted, "Mailbox read timed out");
                return Err(WireError::Timeout(src));
            }
            thread::sleep(self.poll_interval);
        }
    }

    /// drop everything received from `src`
    pub fn clear_in(&mut self, src: Wid) -> Result<(), WireError> {
        self.cursors.remove(&src);
        remove_if_present(&self.buffer_path(src, self.rank))?;
        remove_if_present(&self.done_path(src, self.rank))?;
        Ok(())
    }

    /// drop everything sent to `dest` and not yet consumed
    pub fn clear_out(&mut self, dest: Wid) -> Result<(), WireError> {
        remove_if_present(&self.buffer_path(self.rank, dest))?;
        Ok(())
    }

    pub fn signal_done(&mut self, dest: Wid) -> Result<(), WireError> {
        File::create(self.done_path(self.rank, dest))?;
        Ok(())
    }

    /// consume the done flag from `src`, if it is set
    pub fn take_done(&mut self, src: Wid) -> Result<bool, WireError> {
        remove_if_present(&self.done_path(src, self.rank))
    }

    /// Remove mailboxes, flags and snapshots left over from an earlier run
    pub fn cleanup(&self) -> Result<usize, WireError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in ["CommBuffer_*.dat", "CommDone_*.flag", "SavedState_*.dat"] {
            let glob = Glob::new(pattern)
                .map_err(|error| WireError::Invalid(format!("bad cleanup pattern: {error}")))?;
            builder.add(glob);
        }
        let stale = builder
            .build()
            .map_err(|error| WireError::Invalid(format!("bad cleanup patterns: {error}")))?;

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if stale.is_match(entry.file_name()) && remove_if_present(&entry.path())? {
                removed += 1;
            }
        }

        debug!(dir = ?self.dir, removed, "Removed stale mailbox files");
        Ok(removed)
    }
}

fn remove_if_present(path: &Path) -> Result<bool, WireError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

/// Disk mailbox backend with externally launched workers `1..=n`
#[derive(Debug)]
pub struct DiskBackend {
    mailbox: DiskMailbox,
    workers: usize,
    busy: BTreeSet<Wid>,
    persistent: bool,
}

impl DiskBackend {
    /// controller side, serving `workers` externally started worker ranks
    pub fn controller(dir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            mailbox: DiskMailbox::new(dir, CONTROLLER),
            workers,
            busy: BTreeSet::new(),
            persistent: true,
        }
    }

    /// worker side for rank `rank`
    pub fn worker(dir: impl Into<PathBuf>, rank: Wid) -> Self {
        Self {
            mailbox: DiskMailbox::new(dir, rank),
            workers: 0,
            busy: BTreeSet::new(),
            persistent: true,
        }
    }

    /// worker exiting after its first job
    pub fn one_shot(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn with_mailbox(mut self, configure: impl FnOnce(DiskMailbox) -> DiskMailbox) -> Self {
        self.mailbox = configure(self.mailbox);
        self
    }

    pub fn mailbox(&self) -> &DiskMailbox {
        &self.mailbox
    }

    pub(super) fn is_controller(&self) -> bool {
        self.mailbox.rank() == CONTROLLER
    }
}

impl Backend for DiskBackend {
    fn init(&mut self, state: &mut StateStore) -> Result<Wid, ControlError> {
        fs::create_dir_all(self.mailbox.dir()).map_err(WireError::from)?;

        if self.is_controller() {
            self.mailbox.cleanup()?;
        } else {
            let loaded = state.load_snapshot(&self.mailbox.snapshot_path())?;
            trace!(rank = self.mailbox.rank(), loaded, "Restored worker state");
        }

        Ok(self.mailbox.rank())
    }

    fn send_raw(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError> {
        self.mailbox.send(dest, bytes)
    }

    fn receive_raw(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError> {
        self.mailbox.receive(src, buf)
    }

    fn alloc_worker(&mut self) -> Result<Option<Wid>, ControlError> {
        let free = (1..=self.workers as Wid).find(|wid| !self.busy.contains(wid));
        if let Some(wid) = free {
            self.busy.insert(wid);
        }

        Ok(free)
    }

    fn is_running(&mut self, wid: Wid, _ctx: &mut WorkerContext<'_>) -> Result<bool, ControlError> {
        Ok(!self.mailbox.take_done(wid)?)
    }

    fn clear_in(&mut self, src: Wid) -> Result<(), ControlError> {
        Ok(self.mailbox.clear_in(src)?)
    }

    fn clear_out(&mut self, dest: Wid) -> Result<(), ControlError> {
        Ok(self.mailbox.clear_out(dest)?)
    }

    fn signal_done(&mut self, dest: Wid) -> Result<(), ControlError> {
        Ok(self.mailbox.signal_done(dest)?)
    }

    fn release(&mut self, wid: Wid) {
        self.busy.remove(&wid);
    }

    fn capacity(&self) -> usize {
        self.workers
    }

    fn persistent_workers(&self) -> bool {
        self.persistent
    }

    fn workers(&self) -> Vec<Wid> {
        (1..=self.workers as Wid).collect()
    }

    fn finish(&mut self, state: &mut StateStore) -> Result<(), ControlError> {
        if !self.is_controller() {
            state.save_snapshot(&self.mailbox.snapshot_path())?;
        }
        Ok(())
    }
}
