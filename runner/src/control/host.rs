use super::{ControlError, JobSpec, JobWorker, WorkerRegistry};
use crate::{
    state::StateStore,
    wire::{Channel, WireReadExt},
};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, trace};

/// Worker-side job execution shared by every backend
pub struct WorkerHost {
    registry: Arc<WorkerRegistry>,
    cache: HashMap<u64, Box<dyn JobWorker>>,
    persistent: bool,
}

impl WorkerHost {
    /// `persistent` keeps constructed workers around for later jobs of the same class
    pub fn new(registry: Arc<WorkerRegistry>, persistent: bool) -> Self {
        Self {
            registry,
            cache: HashMap::new(),
            persistent,
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Receive one spec from `io` and run it. The worker's output is written
    /// as a single transaction. Returns `None` for the stop sentinel.
    pub fn serve(
        &mut self,
        io: &mut dyn Channel,
        state: &mut StateStore,
    ) -> Result<Option<JobSpec>, ControlError> {
        let spec: JobSpec = io.receive()?;
        if spec.is_stop() {
            return Ok(None);
        }

        let mut worker = match self.cache.remove(&spec.wclass) {
            Some(worker) => worker,
            None => self.registry.construct(spec.wclass).map_err(|error| {
                error!(wclass = spec.wclass, uid = spec.uid, "Unregistered worker class");
                error
            })?,
        };
        trace!(
            uid = spec.uid,
            class = self.registry.name_of(spec.wclass),
            "Running job"
        );

        io.start_transaction();
        let result = worker.run(&spec, io, state);
        let closed = io.end_transaction();

        if self.persistent {
            self.cache.insert(spec.wclass, worker);
        }

        result?;
        closed?;
        Ok(Some(spec))
    }
}
