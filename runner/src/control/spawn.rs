use super::{Backend, ControlError, DiskBackend, DiskMailbox, Wid, WorkerContext};
use crate::{state::StateStore, wire::WireError};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    collections::BTreeMap,
    mem,
    path::PathBuf,
    process::{Child, Command},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

/// Disk mailbox backend launching one worker process per job as
/// `<program> <args> -N <rank> --mailbox <dir>`
#[derive(Debug)]
pub struct SpawnBackend {
    disk: DiskBackend,
    program: PathBuf,
    args: Vec<String>,
    max_workers: usize,
    children: BTreeMap<Wid, Child>,
    grace: Duration,
}

impl SpawnBackend {
    pub fn new(dir: impl Into<PathBuf>, program: impl Into<PathBuf>, max_workers: usize) -> Self {
        Self {
            disk: DiskBackend::controller(dir, 0),
            program: program.into(),
            args: Vec::new(),
            max_workers: max_workers.max(1),
            children: BTreeMap::new(),
            grace: Duration::from_secs(5),
        }
    }

    /// extra arguments passed before the rank
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// time a worker gets to exit on shutdown before it is signalled
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_mailbox_timeout(mut self, timeout: Option<Duration>) -> Self {
        let dir = self.disk.mailbox().dir().to_path_buf();
        let disk = mem::replace(&mut self.disk, DiskBackend::controller(dir, 0));
        self.disk = disk.with_mailbox(|mailbox| mailbox.with_timeout(timeout));
        self
    }

    pub fn mailbox(&self) -> &DiskMailbox {
        self.disk.mailbox()
    }

    /// number of live worker processes
    pub fn live(&self) -> usize {
        self.children.len()
    }

    fn spawn(&mut self, wid: Wid) -> Result<(), ControlError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg("-N")
            .arg(wid.to_string())
            .arg("--mailbox")
            .arg(self.disk.mailbox().dir())
            .spawn()
            .map_err(|error| {
                error!(error = ?error, program = ?self.program, "Failed to spawn worker");
                error
            })?;

        debug!(wid, pid = child.id(), "Spawned worker process");
        self.children.insert(wid, child);
        Ok(())
    }

    fn stop_child(wid: Wid, mut child: Child, grace: Duration) {
        match child.wait_timeout(grace) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(error) => warn!(error = ?error, wid, "Failed to wait for worker"),
        }

        warn!(wid, "Worker still running, sending SIGTERM");
        if let Err(error) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
            warn!(error = ?error, wid, "Failed to signal worker");
        }
        if let Ok(Some(_)) = child.wait_timeout(grace) {
            return;
        }

        error!(wid, "Killing unresponsive worker");
        if let Err(error) = child.kill().and_then(|_| child.wait().map(|_| ())) {
            error!(error = ?error, wid, "Failed to kill worker");
        }
    }
}

impl Backend for SpawnBackend {
    fn init(&mut self, state: &mut StateStore) -> Result<Wid, ControlError> {
        info!(
            program = ?self.program,
            max_workers = self.max_workers,
            "Starting process spawning backend"
        );
        self.disk.init(state)
    }

    fn send_raw(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError> {
        self.disk.send_raw(dest, bytes)
    }

    fn receive_raw(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError> {
        self.disk.receive_raw(src, buf)
    }

    fn alloc_worker(&mut self) -> Result<Option<Wid>, ControlError> {
        let Some(wid) = (1..=self.max_workers as Wid).find(|wid| !self.children.contains_key(wid))
        else {
            return Ok(None);
        };

        // leftovers of the previous process on this slot
        self.disk.clear_in(wid)?;
        self.disk.clear_out(wid)?;
        self.spawn(wid)?;
        Ok(Some(wid))
    }

    /// reaps the worker process once it exited
    fn is_running(&mut self, wid: Wid, _ctx: &mut WorkerContext<'_>) -> Result<bool, ControlError> {
        let Some(child) = self.children.get_mut(&wid) else {
            return Ok(false);
        };
        let Some(status) = child.try_wait()? else {
            return Ok(true);
        };

        self.children.remove(&wid);
        if status.success() {
            Ok(false)
        } else {
            error!(wid, code = ?status.code(), "Worker process failed");
            Err(ControlError::WorkerFailed {
                wid,
                code: status.code(),
            })
        }
    }

    fn clear_in(&mut self, src: Wid) -> Result<(), ControlError> {
        self.disk.clear_in(src)
    }

    fn clear_out(&mut self, dest: Wid) -> Result<(), ControlError> {
        self.disk.clear_out(dest)
    }

    fn release(&mut self, wid: Wid) {
        if let Some(child) = self.children.remove(&wid) {
            Self::stop_child(wid, child, self.grace);
        }
    }

    fn capacity(&self) -> usize {
        self.max_workers
    }

    fn persistent_workers(&self) -> bool {
        false
    }

    fn workers(&self) -> Vec<Wid> {
        Vec::new()
    }

    fn finish(&mut self, state: &mut StateStore) -> Result<(), ControlError> {
        let grace = self.grace;
        for (wid, child) in mem::take(&mut self.children) {
            Self::stop_child(wid, child, grace);
        }

        self.disk.finish(state)
    }
}

impl Drop for SpawnBackend {
    fn drop(&mut self) {
        let grace = self.grace;
        for (wid, child) in mem::take(&mut self.children) {
            Self::stop_child(wid, child, grace);
        }
    }
}
