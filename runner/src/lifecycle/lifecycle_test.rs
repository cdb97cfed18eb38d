use super::{KillOutcome, LifecycleError, RunState, ThreadManager, ThreadWorker, WorkerControl};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

/// job spinning through safe points until told to stop
fn spinner(counter: Arc<AtomicUsize>) -> impl FnMut(&WorkerControl) + Send + 'static {
    move |control: &WorkerControl| {
        while control.check_pause() {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[test]
pub fn launch_and_finish() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut worker = ThreadWorker::new(1, spinner(counter.clone()));

    assert_eq!(worker.state(), RunState::Idle);
    worker.launch().unwrap();
    assert_eq!(worker.state(), RunState::Running);

    thread::sleep(Duration::from_millis(20));
    worker.finish_mythread(false).unwrap();

    assert_eq!(worker.state(), RunState::Idle);
    assert!(counter.load(Ordering::SeqCst) > 0);
    assert!(!worker.is_running());
}

#[test]
pub fn double_launch_is_rejected() {
    let mut worker = ThreadWorker::new(2, spinner(Arc::new(AtomicUsize::new(0))));
    worker.launch().unwrap();

    assert!(matches!(
        worker.launch(),
        Err(LifecycleError::InvalidState {
            operation: "launch",
            state: RunState::Running,
            ..
        })
    ));

    worker.finish_mythread(false).unwrap();
}

#[test]
pub fn worker_can_be_relaunched_after_finish() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut worker = ThreadWorker::new(3, spinner(counter));

    for _ in 0..2 {
        worker.launch().unwrap();
        worker.finish_mythread(false).unwrap();
        assert_eq!(worker.state(), RunState::Idle);
    }
}

#[test]
pub fn pause_blocks_until_paused() {
    let counter = Arc::new(AtomicUsize::new(0));
    let mut worker = ThreadWorker::new(4, spinner(counter.clone()));
    worker.launch().unwrap();

    worker.pause().unwrap();
    assert_eq!(worker.state(), RunState::Paused);

    // no progress while paused
    let frozen = counter.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::SeqCst), frozen);

    worker.unpause().unwrap();
    assert_eq!(worker.state(), RunState::Running);
    thread::sleep(Duration::from_millis(20));
    assert!(counter.load(Ordering::SeqCst) > frozen);

    worker.finish_mythread(false).unwrap();
}

#[test]
pub fn pause_and_unpause_require_matching_states() {
    let mut worker = ThreadWorker::new(5, spinner(Arc::new(AtomicUsize::new(0))));

    assert!(matches!(
        worker.pause(),
        Err(LifecycleError::InvalidState {
            operation: "pause",
            state: RunState::Idle,
            ..
        })
    ));

    worker.launch().unwrap();
    assert!(matches!(
        worker.unpause(),
        Err(LifecycleError::InvalidState {
            operation: "unpause",
            state: RunState::Running,
            ..
        })
    ));

    worker.finish_mythread(false).unwrap();
}

#[test]
pub fn stop_releases_a_paused_worker() {
    let mut worker = ThreadWorker::new(6, spinner(Arc::new(AtomicUsize::new(0))));
    worker.launch().unwrap();
    worker.pause().unwrap();

    worker.request_stop().unwrap();
    assert_eq!(worker.state(), RunState::StopRequested);

    worker.join().unwrap();
    assert_eq!(worker.state(), RunState::Idle);
}

#[test]
pub fn pause_of_exited_thread_fails() {
    let mut worker = ThreadWorker::new(7, |_: &WorkerControl| {});
    worker.launch().unwrap();
    while worker.is_running() {
        thread::sleep(Duration::from_millis(1));
    }

    assert!(matches!(worker.pause(), Err(LifecycleError::Exited(7))));
    worker.join().unwrap();
}

#[test]
pub fn run_here_runs_in_caller_thread() {
    let caller = thread::current().id();
    let seen = Arc::new(parking_lot::Mutex::new(None));
    let seen_in_job = seen.clone();

    let mut worker = ThreadWorker::new(8, move |control: &WorkerControl| {
        assert_eq!(control.state(), RunState::RunLocal);
        *seen_in_job.lock() = Some(thread::current().id());
    });

    worker.run_here().unwrap();
    assert_eq!(*seen.lock(), Some(caller));
    assert_eq!(worker.state(), RunState::Idle);
}

#[test]
pub fn finish_of_unlaunched_worker() {
    let mut worker = ThreadWorker::new(9, |_: &WorkerControl| {});

    assert!(worker.finish_mythread(true).is_ok());
    assert!(matches!(
        worker.finish_mythread(false),
        Err(LifecycleError::InvalidState {
            operation: "finish",
            ..
        })
    ));
}

#[test]
pub fn kill_joins_cooperative_thread() {
    let mut worker = ThreadWorker::new(10, spinner(Arc::new(AtomicUsize::new(0))));
    worker.launch().unwrap();

    assert_eq!(
        worker.kill_mythread(Duration::from_secs(5)).unwrap(),
        KillOutcome::Joined
    );
    assert_eq!(worker.state(), RunState::Idle);
    assert_eq!(
        worker.kill_mythread(Duration::from_secs(5)).unwrap(),
        KillOutcome::NotRunning
    );
}

#[test]
pub fn kill_abandons_stuck_thread() {
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
    let mut worker = ThreadWorker::new(11, move |_: &WorkerControl| {
        // ignores stop requests until released
        let _ = release_rx.recv();
    });
    worker.launch().unwrap();

    assert_eq!(
        worker.kill_mythread(Duration::from_millis(20)).unwrap(),
        KillOutcome::Abandoned
    );
    assert_eq!(worker.state(), RunState::Indeterminate);
    assert!(matches!(
        worker.launch(),
        Err(LifecycleError::Indeterminate(11))
    ));
    assert!(matches!(
        worker.request_stop(),
        Err(LifecycleError::Indeterminate(11))
    ));

    release_tx.send(()).unwrap();
}

#[test]
pub fn panicking_job_is_reported() {
    let mut worker = ThreadWorker::new(12, |_: &WorkerControl| panic!("job failure"));
    worker.launch().unwrap();

    assert!(matches!(worker.join(), Err(LifecycleError::Panicked(12))));
    assert_eq!(worker.state(), RunState::Idle);
}

#[test]
pub fn manager_awaits_all_threads() {
    let finished = Arc::new(AtomicUsize::new(0));
    let mut manager = ThreadManager::new();

    for id in 0..4 {
        let finished = finished.clone();
        manager
            .add_thread(ThreadWorker::new(id, move |_: &WorkerControl| {
                thread::sleep(Duration::from_millis(5 * id as u64));
                finished.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
    }
    assert!(matches!(
        manager.add_thread(ThreadWorker::new(0, |_: &WorkerControl| {})),
        Err(LifecycleError::DuplicateWorker(0))
    ));

    manager.launch_all().unwrap();
    manager.await_threads_completion().unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 4);
    assert_eq!(manager.remaining(), 0);
    assert!(manager
        .status()
        .iter()
        .all(|status| status.state == RunState::Idle && !status.running));
}

#[test]
pub fn manager_stops_long_running_threads() {
    let mut manager = ThreadManager::new();
    for id in 0..3 {
        manager
            .add_thread(ThreadWorker::new(id, spinner(Arc::new(AtomicUsize::new(0)))))
            .unwrap();
    }
    assert_eq!(manager.next_id(), 3);

    manager.launch_all().unwrap();
    assert_eq!(manager.remaining(), 3);

    manager.request_stop_all();
    manager.await_threads_completion().unwrap();
    assert_eq!(manager.remaining(), 0);
}

#[test]
pub fn manager_forgets_abandoned_threads() {
    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(2);
    let mut manager = ThreadManager::new();
    for id in 0..2 {
        let release_rx = release_rx.clone();
        manager
            .add_thread(ThreadWorker::new(id, move |_: &WorkerControl| {
                let _ = release_rx.recv();
            }))
            .unwrap();
    }
    manager
        .add_thread(ThreadWorker::new(2, spinner(Arc::new(AtomicUsize::new(0)))))
        .unwrap();
    manager.launch_all().unwrap();
    assert_eq!(manager.remaining(), 3);

    assert_eq!(
        manager.kill(0, Duration::from_millis(20)).unwrap(),
        KillOutcome::Abandoned
    );
    assert_eq!(
        manager
            .worker_mut(1)
            .unwrap()
            .kill_mythread(Duration::from_millis(20))
            .unwrap(),
        KillOutcome::Abandoned
    );
    assert_eq!(manager.remaining(), 1);

    manager.request_stop_all();
    manager.await_threads_completion().unwrap();
    assert_eq!(manager.remaining(), 0);
    assert_eq!(manager.worker(0).unwrap().state(), RunState::Indeterminate);

    release_tx.send(()).unwrap();
    release_tx.send(()).unwrap();
}
