use super::{Backend, ControlError, Wid, WorkerContext, CONTROLLER};
use crate::{
    state::StateStore,
    wire::{DequeChannel, WireError, WireRead, WireWrite},
};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

/// One worker's view of its two mailboxes
struct Duplex<'a> {
    inbound: &'a mut DequeChannel,
    outbound: &'a mut DequeChannel,
}

impl WireRead for Duplex<'_> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), WireError> {
        self.inbound.read_bytes(buf)
    }
}

impl WireWrite for Duplex<'_> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.outbound.write_bytes(bytes)
    }

    fn start_transaction(&mut self) {
        self.outbound.start_transaction();
    }

    fn end_transaction(&mut self) -> Result<(), WireError> {
        self.outbound.end_transaction()
    }
}

#[derive(Default)]
struct Slot {
    /// controller to worker
    inbound: DequeChannel,
    /// worker to controller
    outbound: DequeChannel,
}

/// Runs every job inside the controller process the first time it is polled
#[derive(Default)]
pub struct LocalBackend {
    slots: usize,
    busy: BTreeSet<Wid>,
    mailboxes: HashMap<Wid, Slot>,
}

impl LocalBackend {
    /// backend with `slots` worker identities, `1..=slots`
    pub fn new(slots: usize) -> Self {
        Self {
            slots: slots.max(1),
            ..Self::default()
        }
    }
}

impl Backend for LocalBackend {
    fn init(&mut self, _state: &mut StateStore) -> Result<Wid, ControlError> {
        Ok(CONTROLLER)
    }

    fn send_raw(&mut self, dest: Wid, bytes: &[u8]) -> Result<(), WireError> {
        self.mailboxes
            .entry(dest)
            .or_default()
            .inbound
            .write_bytes(bytes)
    }

    fn receive_raw(&mut self, src: Wid, buf: &mut [u8]) -> Result<(), WireError> {
        match self.mailboxes.get_mut(&src) {
            Some(slot) => slot.outbound.read_bytes(buf),
            None => Err(WireError::Unavailable(src)),
        }
    }

    fn alloc_worker(&mut self) -> Result<Option<Wid>, ControlError> {
        let free = (1..=self.slots as Wid).find(|wid| !self.busy.contains(wid));
        if let Some(wid) = free {
            self.busy.insert(wid);
        }

        Ok(free)
    }

    /// runs the pending job to completion, so it never reports running
    fn is_running(
        &mut self,
        wid: Wid,
        ctx: &mut WorkerContext<'_>,
    ) -> Result<bool, ControlError> {
        let slot = self.mailboxes.entry(wid).or_default();
        if slot.inbound.is_empty() {
            return Ok(false);
        }

        let mut io = Duplex {
            inbound: &mut slot.inbound,
            outbound: &mut slot.outbound,
        };
        let spec = ctx.host.serve(&mut io, ctx.state)?;
        trace!(wid, served = spec.is_some(), "Ran job in process");

        Ok(false)
    }

    fn clear_in(&mut self, src: Wid) -> Result<(), ControlError> {
        if let Some(slot) = self.mailboxes.get_mut(&src) {
            slot.outbound.clear();
        }
        Ok(())
    }

    fn clear_out(&mut self, dest: Wid) -> Result<(), ControlError> {
        if let Some(slot) = self.mailboxes.get_mut(&dest) {
            slot.inbound.clear();
        }
        Ok(())
    }

    fn release(&mut self, wid: Wid) {
        self.busy.remove(&wid);
    }

    fn capacity(&self) -> usize {
        self.slots
    }

    fn persistent_workers(&self) -> bool {
        true
    }

    fn workers(&self) -> Vec<Wid> {
        Vec::new()
    }

    fn finish(&mut self, _state: &mut StateStore) -> Result<(), ControlError> {
        self.mailboxes.clear();
        Ok(())
    }
}
