use crate::{
    scheduler::{DEFAULT_BACKLOG, DEFAULT_MAX_WORKERS},
    state::{StateStore, DEFAULT_MAX_RESIDENT, DEFAULT_STALE_WINDOW},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap, fs::File, io::Error, os::unix::fs::MetadataExt, path::Path,
    path::PathBuf, time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(test)]
mod config_test;

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Config file could not be parsed: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config contains errors, see the log for details")]
    Invalid,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // 0 warn, 1 info, 2 debug, 3 and up trace
    #[serde(default)]
    pub verbose: u8,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub state: StateConfig,
    // scheduler queues by category
    #[serde(default)]
    pub queues: BTreeMap<i32, QueueConfig>,
    #[serde(default)]
    pub executors: ExecutorConfig,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            backend: BackendConfig::default(),
            state: StateConfig::default(),
            queues: BTreeMap::new(),
            executors: ExecutorConfig::default(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// Where jobs run
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum BackendConfig {
    /// in the controller process, one job at a time
    Local {
        #[serde(default = "default_workers")]
        workers: usize,
    },
    /// on the scheduler's executor threads
    Threads,
    /// externally started workers polling a mailbox directory
    Disk {
        mailbox: PathBuf,
        workers: usize,
        timeout_ms: Option<u64>,
    },
    /// one worker process per job, started by the controller
    Spawn {
        mailbox: PathBuf,
        #[serde(default = "default_workers")]
        workers: usize,
        // defaults to the running executable
        program: Option<PathBuf>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_grace")]
        grace_ms: u64,
    },
    /// message passing ranks
    Ranks {
        #[serde(default = "default_workers")]
        size: usize,
        cores_per_node: Option<usize>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Local {
            workers: default_workers(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    // disk mirror of the checkpoint store
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,
    #[serde(default = "default_stale_window")]
    pub stale_window: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_resident: DEFAULT_MAX_RESIDENT,
            stale_window: DEFAULT_STALE_WINDOW,
        }
    }
}

impl StateConfig {
    pub fn store(&self) -> StateStore {
        StateStore::with_limits(self.dir.clone(), self.max_resident, self.stale_window)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_backlog")]
    pub backlog: usize,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default = "default_workers")]
    pub count: usize,
    // pin executor threads to cores
    #[serde(default)]
    pub pin: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            count: default_workers(),
            pin: false,
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|error| {
            error!(error = ?error, path = ?path, "Failed to open config");
            ConfigErrors::FileNotFound(path.to_path_buf())
        })?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Log every problem in the config, returns true if any was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms is 0, workers will be polled in a busy loop");
        }

        if self.executors.count == 0 {
            error!("executors.count must be at least 1");
            contains_error = true;
        }

        for (category, queue) in self.queues.iter() {
            if queue.max_workers == 0 {
                error!("queues.{category}.max_workers cannot be 0, the queue would never run");
                contains_error = true;
            }
            if *category == 0 && queue.backlog != default_backlog() {
                warn!("queues.0.backlog is ignored, category 0 is never held back");
            }
        }

        if self.state.stale_window == 0 {
            error!("state.stale_window cannot be 0, every entry would be evicted immediately");
            contains_error = true;
        }
        if let Some(dir) = &self.state.dir {
            if dir.exists() && !dir.is_dir() {
                error!(
                    "state.dir ({}) exists but is not a directory",
                    dir.to_string_lossy()
                );
                contains_error = true;
            }
        }

        match &self.backend {
            BackendConfig::Local { workers } if *workers == 0 => {
                error!("backend.workers must be at least 1");
                contains_error = true;
            }
            BackendConfig::Disk { workers, .. } if *workers == 0 => {
                error!("backend.workers must be at least 1, no job could ever be placed");
                contains_error = true;
            }
            BackendConfig::Spawn {
                workers, program, ..
            } => {
                if *workers == 0 {
                    error!("backend.workers must be at least 1");
                    contains_error = true;
                }
                if let Some(program) = program {
                    match check_executable(program) {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(
                                "backend.program {} is not executable",
                                program.to_string_lossy()
                            );
                            contains_error = true;
                        }
                        Err(e) => {
                            error!(
                                "Failed to determine if backend.program ({}) is an executable: {e}",
                                program.to_string_lossy()
                            );
                            contains_error = true;
                        }
                    }
                }
            }
            BackendConfig::Ranks { size, .. } if *size < 2 => {
                error!("backend.size must be at least 2, rank 0 only distributes work");
                contains_error = true;
            }
            _ => {}
        }

        if contains_error {
            warn!(
                "Configured queues: {}",
                self.queues.keys().map(|category| category.to_string()).join(", ")
            );
        }

        contains_error
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_workers() -> usize {
    4
}

fn default_grace() -> u64 {
    5000
}

fn default_max_resident() -> usize {
    DEFAULT_MAX_RESIDENT
}

fn default_stale_window() -> u64 {
    DEFAULT_STALE_WINDOW
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_backlog() -> usize {
    DEFAULT_BACKLOG
}
