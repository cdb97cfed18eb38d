use super::{Communicator, Wid};
use crate::wire::WireError;
use mpi::{
    environment::{self, Universe},
    point_to_point::{Destination, Source},
    topology::{Communicator as _, SimpleCommunicator},
};
use tracing::debug;

/// MPI world communicator, finalized when dropped
pub struct MpiWorld {
    world: SimpleCommunicator,
    // keeps MPI initialized
    _universe: Universe,
}

impl MpiWorld {
    /// initialize MPI, `None` if it already was
    pub fn init() -> Option<Self> {
        let universe = mpi::initialize()?;
        let world = universe.world();
        debug!(rank = world.rank(), size = world.size(), "MPI initialized");

        Some(Self {
            world,
            _universe: universe,
        })
    }
}

impl Communicator for MpiWorld {
    fn rank(&self) -> Wid {
        self.world.rank()
    }

    fn size(&self) -> Wid {
        self.world.size()
    }

    fn send(&self, dest: Wid, tag: i32, data: &[u8]) -> Result<(), WireError> {
        if dest < 0 || dest >= self.size() {
            return Err(WireError::Unavailable(dest));
        }

        self.world.process_at_rank(dest).send_with_tag(data, tag);
        Ok(())
    }

    fn receive(&self, src: Wid, tag: i32) -> Result<Vec<u8>, WireError> {
        if src < 0 || src >= self.size() {
            return Err(WireError::Unavailable(src));
        }

        let (message, _status) = self.world.process_at_rank(src).receive_vec_with_tag::<u8>(tag);
        Ok(message)
    }

    fn probe(&self, src: Wid, tag: i32) -> Result<bool, WireError> {
        Ok(self
            .world
            .process_at_rank(src)
            .immediate_probe_with_tag(tag)
            .is_some())
    }

    fn processor_name(&self) -> String {
        environment::processor_name().unwrap_or_else(|_| String::from("unknown"))
    }
}
