use crate::wire::{
    Decode, Encode, FileReader, FileWriter, MemReader, MemWriter, WireError, WireReadExt,
    WireWrite, WireWriteExt,
};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[cfg(test)]
mod state_test;

pub const DEFAULT_MAX_RESIDENT: usize = 1000;
pub const DEFAULT_STALE_WINDOW: u64 = 500;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("No saved state for key {0:?}")]
    Unavailable(String),
    #[error("State key {0:?} already holds a different value")]
    AlreadyClaimed(String),
    #[error("Invalid state key {0:?}")]
    InvalidKey(String),
    #[error("Failed to access state file")]
    Io(#[from] std::io::Error),
    #[error("Failed to (de)serialize state")]
    Wire(#[from] WireError),
}

/// Hash-keyed checkpoint store with an optional on-disk mirror
#[derive(Debug)]
pub struct StateStore {
    dir: Option<PathBuf>,
    data: HashMap<String, Vec<u8>>,
    last_request: HashMap<String, u64>,
    counter: u64,
    max_resident: usize,
    stale_window: u64,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StateStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self::with_limits(dir, DEFAULT_MAX_RESIDENT, DEFAULT_STALE_WINDOW)
    }

    pub fn with_limits(dir: Option<PathBuf>, max_resident: usize, stale_window: u64) -> Self {
        Self {
            dir,
            data: HashMap::new(),
            last_request: HashMap::new(),
            counter: 0,
            max_resident,
            stale_window,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// number of resident entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// mirror file for `key`
    pub fn file_name(key: &str) -> String {
        format!("SavedState_{key}.dat")
    }

    fn validate(key: &str) -> Result<(), StateError> {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(StateError::InvalidKey(key.to_owned()));
        }
        Ok(())
    }

    fn stamp(&mut self, key: &str) {
        self.counter += 1;
        self.last_request.insert(key.to_owned(), self.counter);
    }

    fn mirror_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(Self::file_name(key)))
    }

    /// Make `key` resident if it exists anywhere, reporting whether it does
    pub fn check_state(&mut self, key: &str) -> Result<bool, StateError> {
        Self::validate(key)?;
        self.stamp(key);

        if self.data.contains_key(key) {
            return Ok(true);
        }

        let Some(path) = self.mirror_path(key) else {
            return Ok(false);
        };
        match fs::read(&path) {
            Ok(bytes) => {
                trace!(key, path = ?path, "Loaded state from disk");
                self.data.insert(key.to_owned(), bytes);
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// raw encoded value of `key`
    pub fn get_bytes(&mut self, key: &str) -> Result<&[u8], StateError> {
        if !self.check_state(key)? {
            return Err(StateError::Unavailable(key.to_owned()));
        }

        self.data
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| StateError::Unavailable(key.to_owned()))
    }

    pub fn get_state<T: Decode>(&mut self, key: &str) -> Result<T, StateError> {
        let mut reader = MemReader::new(self.get_bytes(key)?);
        Ok(reader.receive()?)
    }

    /// Store `value` under `key`, mirroring it to disk when a directory is set
    pub fn push_state<T: Encode + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), StateError> {
        Self::validate(key)?;

        let mut writer = MemWriter::new();
        writer.send(value)?;
        let bytes = writer.into_inner();

        if self.check_state(key)? {
            return match self.data.get(key) {
                Some(held) if *held == bytes => Ok(()),
                _ => Err(StateError::AlreadyClaimed(key.to_owned())),
            };
        }

        if let Some(path) = self.mirror_path(key) {
            write_atomic(&path, &bytes)?;
        }
        self.data.insert(key.to_owned(), bytes);
        self.evict(key);

        Ok(())
    }

    /// Forget `key` in memory and on disk
    pub fn clear_state(&mut self, key: &str) -> Result<(), StateError> {
        Self::validate(key)?;

        self.data.remove(key);
        self.last_request.remove(key);
        if let Some(path) = self.mirror_path(key) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }

    /// drop stale entries once too many are resident, keeping `keep`
    fn evict(&mut self, keep: &str) {
        if self.data.len() <= self.max_resident {
            return;
        }

        let counter = self.counter;
        let window = self.stale_window;
        let last_request = &self.last_request;
        let before = self.data.len();

        self.data.retain(|key, _| {
            key == keep
                || last_request
                    .get(key)
                    .map_or(false, |stamp| counter - stamp < window)
        });
        let evicted: Vec<String> = self
            .last_request
            .keys()
            .filter(|key| !self.data.contains_key(*key))
            .cloned()
            .collect();
        for key in evicted {
            self.last_request.remove(&key);
        }

        debug!(evicted = before - self.data.len(), resident = self.data.len(), "Evicted stale state");
    }

    /// Write every resident entry to `path` as one map
    pub fn save_snapshot(&self, path: &Path) -> Result<(), StateError> {
        let snapshot: BTreeMap<&str, &[u8]> = self
            .data
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_slice()))
            .collect();

        let mut writer = MemWriter::new();
        writer.send(&snapshot.len())?;
        for (key, value) in snapshot {
            writer.send(key)?;
            writer.send(value)?;
        }
        write_atomic(path, writer.as_slice())?;

        debug!(path = ?path, entries = self.data.len(), "Saved state snapshot");
        Ok(())
    }

    /// Merge a snapshot written by `save_snapshot`; a missing file loads nothing
    pub fn load_snapshot(&mut self, path: &Path) -> Result<usize, StateError> {
        let Some(mut reader) = FileReader::open_existing(path)? else {
            return Ok(0);
        };

        let snapshot: BTreeMap<String, Vec<u8>> = reader.receive()?;
        let loaded = snapshot.len();
        for (key, value) in snapshot {
            if self.data.insert(key.clone(), value).is_some() {
                warn!(key = %key, "Snapshot replaced resident state");
            }
            self.stamp(&key);
        }

        debug!(path = ?path, entries = loaded, "Loaded state snapshot");
        Ok(loaded)
    }
}

/// write to `<path>_tmp` then rename over `path`
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push("_tmp");
    let tmp = PathBuf::from(tmp);

    let mut writer = FileWriter::create(&tmp)?;
    writer.write_bytes(bytes)?;
    drop(writer);
    fs::rename(&tmp, path)?;

    Ok(())
}
