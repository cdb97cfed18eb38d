use multijob::{
    builtin::{self, RangeHistogram, ECHO, NAP, RANGE_HISTOGRAM},
    control::{
        class_hash, launch_accumulate, ControlError, JobComm, JobSpec, MultiJobControl,
        SharedComm, SpawnBackend,
    },
    state::StateStore,
    wire::{Channel, WireReadExt, WireWriteExt},
};
use parking_lot::Mutex;
use std::{fs, path::Path, process::Command, sync::Arc, time::Duration};

fn spawn_control(dir: &Path, max_workers: usize) -> MultiJobControl<SpawnBackend> {
    let backend = SpawnBackend::new(dir, env!("CARGO_BIN_EXE_multijob"), max_workers)
        .with_grace(Duration::from_secs(2))
        .with_mailbox_timeout(Some(Duration::from_secs(30)));
    let mut control = MultiJobControl::new(
        backend,
        Arc::new(builtin::registry().unwrap()),
        StateStore::default(),
    )
    .with_poll_interval(Duration::from_millis(5));
    control.init().unwrap();
    control
}

#[derive(Default)]
struct Naps {
    millis: u64,
    finished: Vec<i32>,
}

impl JobComm for Naps {
    fn start_job(&mut self, _spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        io.send(&self.millis)?;
        Ok(())
    }

    fn end_job(&mut self, _spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        self.finished.push(io.receive()?);
        Ok(())
    }
}

#[derive(Default)]
struct Echoes {
    replies: Vec<String>,
}

impl JobComm for Echoes {
    fn start_job(&mut self, spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        io.send(&format!("hello from job {}", spec.uid))?;
        Ok(())
    }

    fn end_job(&mut self, _spec: &JobSpec, io: &mut dyn Channel) -> Result<(), ControlError> {
        self.replies.push(io.receive()?);
        Ok(())
    }
}

#[test]
pub fn spawned_workers_echo() {
    let dir = tempfile::tempdir().unwrap();
    let mut control = spawn_control(dir.path(), 2);

    let echoes = Arc::new(Mutex::new(Echoes::default()));
    let comm: SharedComm = echoes.clone();
    for uid in 0..3 {
        control
            .submit_job(JobSpec::new(class_hash(ECHO), uid, 0, 0).with_comm(comm.clone()))
            .unwrap();
    }
    control.wait_complete().unwrap();
    control.shutdown_workers().unwrap();

    let mut replies = echoes.lock().replies.clone();
    replies.sort();
    assert_eq!(
        replies,
        vec![
            "hello from job 0".to_string(),
            "hello from job 1".to_string(),
            "hello from job 2".to_string()
        ]
    );
    assert_eq!(control.backend().live(), 0);
}

#[test]
pub fn spawned_workers_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let mut control = spawn_control(dir.path(), 3);

    let total: Option<Vec<u64>> =
        launch_accumulate(&mut control, class_hash(RANGE_HISTOGRAM), 3000, 10u64).unwrap();
    control.shutdown_workers().unwrap();

    assert_eq!(total, Some(RangeHistogram::fill(0, 3000, 10)));
}

#[test]
pub fn unregistered_class_fails_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut control = spawn_control(dir.path(), 1);

    control
        .submit_job(JobSpec::new(class_hash("NoSuchWorker"), 0, 0, 0))
        .unwrap();

    match control.wait_complete() {
        Err(ControlError::WorkerFailed { wid, code }) => {
            assert_eq!(wid, 1);
            assert_eq!(code, Some(1));
        }
        other => panic!("expected a failed worker, got {other:?}"),
    }
    assert!(control.outstanding().is_empty());
}

#[test]
pub fn allocation_waits_for_a_free_slot() {
    let dir = tempfile::tempdir().unwrap();
    let mut control = spawn_control(dir.path(), 1);

    let naps = Arc::new(Mutex::new(Naps {
        millis: 50,
        finished: Vec::new(),
    }));
    let comm: SharedComm = naps.clone();
    for uid in 0..3 {
        control
            .submit_job(JobSpec::new(class_hash(NAP), uid, 0, 0).with_comm(comm.clone()))
            .unwrap();
        assert_eq!(control.backend().live(), 1);
        assert_eq!(control.outstanding().len(), 1);
    }
    control.wait_complete().unwrap();
    control.shutdown_workers().unwrap();

    // one slot means jobs finish in submission order
    assert_eq!(naps.lock().finished, vec![0, 1, 2]);
}

#[test]
pub fn spawned_workers_share_the_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state");
    fs::create_dir(&state).unwrap();
    let config = dir.path().join("runner.yaml");
    fs::write(
        &config,
        format!(
            "backend:\n  kind: spawn\n  mailbox: {}\n  workers: 2\nstate:\n  dir: {}\npoll_interval_ms: 5\n",
            dir.path().join("mailbox").display(),
            state.display()
        ),
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_multijob"))
        .arg("--config")
        .arg(&config)
        .args(["--items", "3000"])
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    assert!(state.join("SavedState_histogram_0_1500_10.dat").is_file());
    assert!(state.join("SavedState_histogram_1500_3000_10.dat").is_file());
}
