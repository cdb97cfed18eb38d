use super::{ControlError, JobWorker};
use itertools::Itertools;
use std::{collections::HashMap, fmt};
use tracing::debug;

type WorkerFactory = Box<dyn Fn() -> Box<dyn JobWorker> + Send + Sync>;

/// FNV-1a 64 of a worker class name; 0 is reserved for the stop sentinel
pub const fn class_hash(name: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let bytes = name.as_bytes();
    let mut hash = OFFSET;
    let mut index = 0;
    while index < bytes.len() {
        hash ^= bytes[index] as u64;
        hash = hash.wrapping_mul(PRIME);
        index += 1;
    }

    if hash == 0 {
        1
    } else {
        hash
    }
}

/// Maps worker class names to constructors
#[derive(Default)]
pub struct WorkerRegistry {
    factories: HashMap<u64, (String, WorkerFactory)>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// register `factory` under `name`, returning the class hash
    pub fn register<F>(&mut self, name: &str, factory: F) -> Result<u64, ControlError>
    where
        F: Fn() -> Box<dyn JobWorker> + Send + Sync + 'static,
    {
        let wclass = class_hash(name);
        if self.factories.contains_key(&wclass) {
            return Err(ControlError::DuplicateWorker(name.to_owned()));
        }

        debug!(name, wclass, "Registered worker class");
        self.factories
            .insert(wclass, (name.to_owned(), Box::new(factory)));
        Ok(wclass)
    }

    pub fn construct(&self, wclass: u64) -> Result<Box<dyn JobWorker>, ControlError> {
        self.factories
            .get(&wclass)
            .map(|(_, factory)| factory())
            .ok_or(ControlError::UnregisteredWorker(wclass))
    }

    pub fn name_of(&self, wclass: u64) -> Option<&str> {
        self.factories.get(&wclass).map(|(name, _)| name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&class_hash(name))
    }

    /// registered names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.factories
            .values()
            .map(|(name, _)| name.as_str())
            .sorted()
            .collect()
    }
}
