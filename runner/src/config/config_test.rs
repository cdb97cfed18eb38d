use super::{check_executable, BackendConfig, QueueConfig, RunnerConfig};
use crate::scheduler::{DEFAULT_BACKLOG, DEFAULT_MAX_WORKERS};
use std::{fs, io::Write, os::unix::fs::PermissionsExt, path::PathBuf};

#[test]
pub fn empty_config_uses_defaults() {
    let config: RunnerConfig = serde_yaml::from_str("{}").unwrap();

    assert_eq!(config.verbose, 0);
    assert_eq!(config.backend, BackendConfig::Local { workers: 4 });
    assert_eq!(config.state.max_resident, 1000);
    assert_eq!(config.state.stale_window, 500);
    assert!(config.queues.is_empty());
    assert_eq!(config.executors.count, 4);
    assert!(!config.executors.pin);
    assert_eq!(config.poll_interval_ms, 10);
    assert!(!config.preflight_checks());
}

#[test]
pub fn full_config_parses() {
    let yaml = r#"
verbose: 2
backend:
  kind: spawn
  mailbox: /tmp/multijob
  workers: 3
  args: ["--persistent"]
state:
  dir: /tmp/multijob-state
  stale_window: 50
queues:
  0: {}
  1:
    max_workers: 2
    backlog: 8
executors:
  count: 6
  pin: true
poll_interval_ms: 1
"#;
    let config: RunnerConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(config.verbose, 2);
    assert_eq!(
        config.backend,
        BackendConfig::Spawn {
            mailbox: PathBuf::from("/tmp/multijob"),
            workers: 3,
            program: None,
            args: vec![String::from("--persistent")],
            grace_ms: 5000,
        }
    );
    assert_eq!(config.state.dir, Some(PathBuf::from("/tmp/multijob-state")));
    assert_eq!(config.state.max_resident, 1000);
    assert_eq!(config.state.stale_window, 50);
    assert_eq!(
        config.queues[&0],
        QueueConfig {
            max_workers: DEFAULT_MAX_WORKERS,
            backlog: DEFAULT_BACKLOG
        }
    );
    assert_eq!(
        config.queues[&1],
        QueueConfig {
            max_workers: 2,
            backlog: 8
        }
    );
    assert_eq!(config.executors.count, 6);
    assert!(config.executors.pin);
    assert_eq!(config.poll_interval().as_millis(), 1);
}

#[test]
pub fn unknown_fields_are_rejected() {
    assert!(serde_yaml::from_str::<RunnerConfig>("workers: 3").is_err());
    assert!(serde_yaml::from_str::<RunnerConfig>("backend:\n  kind: carrier-pigeon").is_err());
    assert!(serde_yaml::from_str::<RunnerConfig>("state:\n  path: /tmp").is_err());
}

#[test]
pub fn ranks_backend_parses() {
    let config: RunnerConfig =
        serde_yaml::from_str("backend:\n  kind: ranks\n  size: 5\n  cores_per_node: 2").unwrap();

    assert_eq!(
        config.backend,
        BackendConfig::Ranks {
            size: 5,
            cores_per_node: Some(2)
        }
    );
}

#[test]
pub fn preflight_flags_unusable_settings() {
    let mut config = RunnerConfig::default();
    config.queues.insert(
        3,
        QueueConfig {
            max_workers: 0,
            backlog: 1,
        },
    );
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.backend = BackendConfig::Ranks {
        size: 1,
        cores_per_node: None,
    };
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.executors.count = 0;
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.backend = BackendConfig::Threads;
    assert!(!config.preflight_checks());
}

#[test]
pub fn spawn_program_must_be_executable() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("worker.sh");
    let mut file = fs::File::create(&program).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    drop(file);

    fs::set_permissions(&program, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(!check_executable(&program).unwrap());

    let mut config = RunnerConfig::default();
    config.backend = BackendConfig::Spawn {
        mailbox: dir.path().to_path_buf(),
        workers: 1,
        program: Some(program.clone()),
        args: Vec::new(),
        grace_ms: 10,
    };
    assert!(config.preflight_checks());

    fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
    assert!(check_executable(&program).unwrap());
    assert!(!config.preflight_checks());

    assert!(check_executable(&dir.path().join("missing")).is_err());
}

#[test]
pub fn missing_config_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    assert!(RunnerConfig::load(&dir.path().join("absent.yaml")).is_err());

    let path = dir.path().join("config.yaml");
    fs::write(&path, "backend:\n  kind: threads\nexecutors:\n  count: 2\n").unwrap();
    let config = RunnerConfig::load(&path).unwrap();
    assert_eq!(config.backend, BackendConfig::Threads);
    assert_eq!(config.executors.count, 2);
}
