mod config;
mod job;
mod lock;
mod runtime_dir;
mod signals;
mod status;

use clap::Parser;
use config::{LockrunConfig, Overrides, Settings};
use job::{JobOptions, JobSpec};
use signals::{Router, SignalSet};
use status::{StatusTracker, SupervisorState};
use std::path::PathBuf;
use std::sync::Arc;

/// Run a long-lived command under an exclusive lock: one instance per
/// identity, signals forwarded to the running job (or queued for the next
/// one), and the job's exit status passed through.
#[derive(Parser, Debug)]
#[command(name = "lockrun", version, about)]
pub struct Cli {
    /// Job file (TOML) listing jobs and cleanup steps
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Lock identity (default: job file stem, else the program name)
    #[arg(short, long)]
    identity: Option<String>,

    /// Directory holding lock files
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Write a JSON status report here on every state change
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Don't suspend the supervisor when the job is stopped
    #[arg(long)]
    no_mirror_stop: bool,

    /// Print resolved settings and exit without taking the lock
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (lock probes, signal state)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Command to run after any jobs from the job file
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "lockrun=debug"
    } else if quiet {
        "lockrun=warn"
    } else {
        "lockrun=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn load_settings(cli: &Cli) -> Result<Settings, config::ConfigError> {
    let file_config = match &cli.config {
        Some(path) => LockrunConfig::load(path)?,
        None => LockrunConfig::default(),
    };
    file_config.resolve(Overrides {
        config_path: cli.config.clone(),
        identity: cli.identity.clone(),
        lock_dir: cli.lock_dir.clone(),
        status_file: cli.status_file.clone(),
        no_mirror_stop: cli.no_mirror_stop,
        command: cli.command.clone(),
    })
}

fn print_settings(settings: &Settings) {
    println!("identity:    {}", settings.identity);
    println!("lock file:   {}", settings.lock_path.display());
    match &settings.status_file {
        Some(path) => println!("status file: {}", path.display()),
        None => println!("status file: (none)"),
    }
    println!("mirror stop: {}", settings.mirror_stop);
    for (i, job) in settings.jobs.iter().enumerate() {
        println!("job {}:       {job}", i + 1);
    }
    for step in &settings.cleanup {
        println!("cleanup:     {} (skip if handled: {})", step.job, step.skip_if_handled);
    }
}

/// Run one supervised job and record its outcome.
async fn run_job(
    router: &Arc<Router>,
    settings: &Settings,
    tracker: &mut StatusTracker,
    spec: &JobSpec,
    state: SupervisorState,
) -> i32 {
    let options = JobOptions {
        mirror_stop: settings.mirror_stop,
        env: job::supervisor_env(
            &settings.identity,
            router.pending(),
            router.handled(),
            tracker.last_exit_status(),
        ),
    };

    tracker.set_command(Some(spec.to_string()));
    tracker.update(state);

    let code = match job::run(router, spec, &options).await {
        Ok(exit) => exit.code(),
        Err(e) => {
            tracing::error!(command = %spec, error = %e, "lost track of job");
            1
        }
    };

    tracker.set_command(None);
    code
}

/// Acquire the lock, run every job, run cleanup, release. Returns the exit
/// status for the process.
async fn supervise(router: Arc<Router>, settings: Settings) -> i32 {
    let mut tracker = StatusTracker::new(
        settings.status_file.clone(),
        Arc::clone(&router),
        &settings.identity,
    );
    tracker.update(SupervisorState::Starting);

    tracker.update(SupervisorState::WaitingForLock);
    let mut handle = match lock::acquire(&router, &settings.identity, &settings.lock_path).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(identity = %settings.identity, error = %e, "could not take lock");
            tracker.set_exit_status(e.exit_code());
            tracker.update(SupervisorState::Finished);
            return e.exit_code();
        }
    };

    let mut status = 0;
    for spec in &settings.jobs {
        status = run_job(&router, &settings, &mut tracker, spec, SupervisorState::Running).await;
        tracker.set_exit_status(status);
        if status != 0 {
            tracing::warn!(command = %spec, status, "job failed, skipping remaining jobs");
            break;
        }
        if router.handled().intersects(SignalSet::termination()) {
            tracing::warn!(handled = %router.handled(), "termination requested, skipping remaining jobs");
            break;
        }
    }

    for step in &settings.cleanup {
        let handled = router.handled();
        if handled.intersects(step.skip_if_handled) {
            tracing::info!(command = %step.job, handled = %handled, "skipping cleanup step");
            continue;
        }
        let code = run_job(&router, &settings, &mut tracker, &step.job, SupervisorState::Cleanup).await;
        if code != 0 {
            tracing::warn!(command = %step.job, status = code, "cleanup step failed");
        }
    }

    handle.release();
    tracker.update(SupervisorState::Finished);
    tracing::info!(
        identity = %handle.identity(),
        lock = %handle.path().display(),
        status,
        pending = %router.pending(),
        handled = %router.handled(),
        "done"
    );
    status
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    // Handlers go in before anything else so no signal is missed.
    let router = Arc::new(Router::new());
    if let Err(e) = signals::listen(Arc::clone(&router)) {
        tracing::error!(error = %e, "failed to install signal handlers");
        std::process::exit(1);
    }

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(2);
        }
    };

    if cli.dry_run {
        print_settings(&settings);
        return;
    }

    let status = supervise(router, settings).await;
    // Exit right away: an abandoned lock wait may still be parked on a
    // blocking thread, and runtime shutdown would wait for it.
    std::process::exit(status);
}
