use clap::Parser;
use itertools::Itertools;
use multijob::{
    builtin::{self, RangeHistogram, RANGE_HISTOGRAM},
    config::{BackendConfig, ConfigErrors, RunnerConfig},
    control::{
        class_hash, launch_accumulate, split_jobs, Accumulate, Backend, Communicator, ControlError,
        DiskBackend, LocalBackend, LocalWorld, MultiJobControl, RankBackend, SpawnBackend,
        Topology, Wid, WorkerRegistry, CONTROLLER,
    },
    scheduler::{FnJob, JobQueue, SchedulerError},
};
use parking_lot::Mutex;
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};
use tracing_unwrap::ResultExt;

const BINS: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "multijob")]
#[command(version)]
#[command(about = "Split a range of work over threads, processes or ranks and combine the results")]
struct Args {
    /// YAML config file, defaults apply when omitted
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Run as worker <RANK>, serving jobs from the mailbox directory
    #[arg(short = 'N', long = "rank", requires = "mailbox")]
    rank: Option<Wid>,

    /// Mailbox directory shared with the controller
    #[arg(long)]
    mailbox: Option<PathBuf>,

    /// Keep serving jobs until the controller sends a stop
    #[arg(long)]
    persistent: bool,

    /// Increase log verbosity, may be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of jobs to split the range into, 0 means one per worker
    #[arg(long, default_value_t = 0)]
    jobs: u64,

    /// Size of the range to histogram
    #[arg(long, default_value_t = 100_000)]
    items: u64,
}

type LogFilter = reload::Handle<EnvFilter, Registry>;

fn log_filter(verbose: u8) -> EnvFilter {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Log to stderr at the command line's verbosity, the config may raise it later
fn init_logging(verbose: u8) -> LogFilter {
    let (filter, handle) = reload::Layer::new(log_filter(verbose));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    handle
}

fn load_config(args: &Args) -> Result<RunnerConfig, ConfigErrors> {
    let config = match &args.config {
        Some(path) => RunnerConfig::load(path)?,
        None => RunnerConfig::default(),
    };

    if config.preflight_checks() {
        return Err(ConfigErrors::Invalid);
    }
    Ok(config)
}

/// Serve jobs from the controller until told to stop, or for one job
fn serve(
    config: &RunnerConfig,
    mailbox: PathBuf,
    rank: Wid,
    persistent: bool,
) -> Result<usize, ControlError> {
    let backend = DiskBackend::worker(mailbox, rank);
    let backend = if persistent {
        backend
    } else {
        backend.one_shot()
    };

    let mut control = MultiJobControl::new(
        backend,
        Arc::new(builtin::registry()?),
        config.state.store(),
    )
    .with_poll_interval(config.poll_interval());
    control.init()?;

    let served = control.run_worker(CONTROLLER);
    let finished = control.finish();
    let served = served?;
    finished?;

    info!(rank, served, "Worker done");
    Ok(served)
}

/// Histogram the range over `control`, releasing its workers whatever happens
fn accumulate<B: Backend>(
    mut control: MultiJobControl<B>,
    items: u64,
) -> Result<Option<Vec<u64>>, ControlError> {
    control.init()?;

    let total = launch_accumulate(
        &mut control,
        class_hash(RANGE_HISTOGRAM),
        items,
        BINS as u64,
    );
    let shutdown = control.shutdown_workers();
    let total = total?;
    shutdown?;

    Ok(total)
}

/// Histogram the range on the scheduler's executors
fn accumulate_threads(
    config: &RunnerConfig,
    items: u64,
    jobs: u64,
) -> Result<Option<Vec<u64>>, SchedulerError> {
    let queue = JobQueue::new(config.verbose).with_pinning(config.executors.pin);
    for (category, settings) in config.queues.iter() {
        queue.set_queue(*category, settings.max_workers, settings.backlog)?;
    }
    queue.launch(config.executors.count)?;

    // lowest configured category, or the first regular one
    let category = config
        .queues
        .keys()
        .copied()
        .find(|category| *category > 0)
        .unwrap_or(1);
    let jobs = if jobs == 0 {
        config.executors.count as u64
    } else {
        jobs
    };

    let total: Arc<Mutex<Option<Vec<u64>>>> = Arc::new(Mutex::new(None));
    for spec in split_jobs(None, jobs, items, class_hash(RANGE_HISTOGRAM), 0) {
        let total = total.clone();
        queue.add(FnJob::new(category, move || {
            let partial = RangeHistogram::fill(spec.n0, spec.n1, BINS);
            let mut total = total.lock();
            match total.as_mut() {
                Some(total) => total.accumulate(partial),
                None => *total = Some(partial),
            }
        }))?;
    }

    info!(status = %queue.status(), "All jobs queued");
    queue.shutdown()?;

    Ok(Arc::try_unwrap(total).unwrap_or_log().into_inner())
}

/// Histogram the range over in-process ranks, one thread per non-root rank
fn accumulate_ranks(
    config: &RunnerConfig,
    registry: Arc<WorkerRegistry>,
    size: usize,
    cores_per_node: Option<usize>,
    jobs: u64,
    items: u64,
) -> Result<Option<Vec<u64>>, ControlError> {
    let cores = cores_per_node.map_or(size as Wid, |cores| cores as Wid);
    let mut ranks = LocalWorld::new(size).into_iter();
    let Some(root) = ranks.next() else {
        return Ok(None);
    };

    let others: Vec<_> = ranks
        .map(|comm| {
            let registry = registry.clone();
            let store = config.state.store();
            let poll_interval = config.poll_interval();
            thread::spawn(move || -> Result<usize, ControlError> {
                let topology = Topology::compute(comm.rank(), size as Wid, cores);
                let relay = topology.is_relay();
                let parent = topology.parent.unwrap_or(CONTROLLER);

                let mut control =
                    MultiJobControl::new(RankBackend::new(comm, topology), registry, store)
                        .with_poll_interval(poll_interval);
                control.init()?;
                if relay {
                    control.relay()
                } else {
                    control.run_worker(parent)
                }
            })
        })
        .collect();

    let topology = Topology::compute(CONTROLLER, size as Wid, cores);
    let control = MultiJobControl::new(
        RankBackend::new(root, topology),
        registry,
        config.state.store(),
    )
    .with_poll_interval(config.poll_interval())
    .with_chunks(jobs);
    let total = accumulate(control, items);

    for (rank, handle) in others.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(served)) => info!(rank = rank + 1, served, "Rank done"),
            Ok(Err(e)) => error!(rank = rank + 1, error = %e, "Rank failed"),
            Err(_) => error!(rank = rank + 1, "Rank panicked"),
        }
    }

    total
}

#[cfg(feature = "mpi")]
fn accumulate_mpi(
    config: &RunnerConfig,
    registry: Arc<WorkerRegistry>,
    jobs: u64,
    items: u64,
) -> Option<Result<Option<Vec<u64>>, ControlError>> {
    use multijob::control::MpiWorld;

    let world = MpiWorld::init()?;
    if world.size() < 2 {
        return None;
    }

    let topology = Topology::from_env(world.rank(), world.size());
    let relay = topology.is_relay();
    let parent = topology.parent;
    let control = MultiJobControl::new(
        RankBackend::new(world, topology),
        registry,
        config.state.store(),
    )
    .with_poll_interval(config.poll_interval())
    .with_chunks(jobs);

    Some(match parent {
        None => accumulate(control, items),
        Some(parent) => {
            let mut control = control;
            control
                .init()
                .and_then(|_| {
                    if relay {
                        control.relay()
                    } else {
                        control.run_worker(parent)
                    }
                })
                .map(|_| None)
        }
    })
}

fn run_controller(
    config: &RunnerConfig,
    config_path: Option<&Path>,
    jobs: u64,
    items: u64,
) -> Result<Option<Vec<u64>>, ControlError> {
    let registry = Arc::new(builtin::registry()?);
    let poll_interval = config.poll_interval();

    match &config.backend {
        BackendConfig::Local { workers } => accumulate(
            MultiJobControl::new(LocalBackend::new(*workers), registry, config.state.store())
                .with_poll_interval(poll_interval)
                .with_chunks(jobs),
            items,
        ),
        BackendConfig::Threads => accumulate_threads(config, items, jobs)
            .map_err(|e| ControlError::Job(e.to_string())),
        BackendConfig::Disk {
            mailbox,
            workers,
            timeout_ms,
        } => {
            let timeout = timeout_ms.map(Duration::from_millis);
            accumulate(
                MultiJobControl::new(
                    DiskBackend::controller(mailbox, *workers)
                        .with_mailbox(|mailbox| mailbox.with_timeout(timeout)),
                    registry,
                    config.state.store(),
                )
                .with_poll_interval(poll_interval)
                .with_chunks(jobs),
                items,
            )
        }
        BackendConfig::Spawn {
            mailbox,
            workers,
            program,
            args,
            grace_ms,
        } => {
            let program = match program {
                Some(program) => program.clone(),
                None => std::env::current_exe()?,
            };
            let mut args = args.clone();
            // workers need the same state directory and poll interval
            if let Some(path) = config_path {
                args.push("--config".to_owned());
                args.push(path.to_string_lossy().into_owned());
            }
            if config.verbose > 0 {
                args.push(format!("-{}", "v".repeat(config.verbose as usize)));
            }

            accumulate(
                MultiJobControl::new(
                    SpawnBackend::new(mailbox, program, *workers)
                        .with_args(args)
                        .with_grace(Duration::from_millis(*grace_ms)),
                    registry,
                    config.state.store(),
                )
                .with_poll_interval(poll_interval)
                .with_chunks(jobs),
                items,
            )
        }
        BackendConfig::Ranks {
            size,
            cores_per_node,
        } => {
            #[cfg(feature = "mpi")]
            if let Some(result) = accumulate_mpi(config, registry.clone(), jobs, items) {
                return result;
            }

            accumulate_ranks(config, registry, *size, *cores_per_node, jobs, items)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let logging = init_logging(args.verbose);

    let mut config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = ?args.config, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };
    if config.verbose > args.verbose {
        if let Err(e) = logging.reload(log_filter(config.verbose)) {
            warn!(error = %e, "Failed to raise log verbosity");
        }
    }
    config.verbose = config.verbose.max(args.verbose);

    if let (Some(rank), Some(mailbox)) = (args.rank, args.mailbox.clone()) {
        return match serve(&config, mailbox, rank, args.persistent) {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!(rank, error = %e, kind = ?e.kind(), "Worker failed");
                ExitCode::FAILURE
            }
        };
    }

    match run_controller(&config, args.config.as_deref(), args.jobs, args.items) {
        Ok(Some(histogram)) => {
            info!(total = histogram.iter().sum::<u64>(), "Accumulation complete");
            println!(
                "{}",
                histogram
                    .iter()
                    .enumerate()
                    .map(|(bin, count)| format!("bin {bin}: {count}"))
                    .join("\n")
            );
            ExitCode::SUCCESS
        }
        Ok(None) => {
            warn!("No jobs were run");
            ExitCode::SUCCESS
        }
        Err(e) if e.is_fatal() => {
            error!(error = %e, kind = ?e.kind(), "Run aborted");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "Run failed");
            ExitCode::from(2)
        }
    }
}
