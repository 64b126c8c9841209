/// Single job lifecycle: spawn the command in its own process group, make it
/// the router's signal target, wait for it to end, report its exit status.
use crate::signals::{Router, SignalKind, SignalSet, SignalTarget};
use nix::errno::Errno;
use nix::sys::signal::{killpg, raise, signal, SigHandler, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;

/// Shell convention for "command not found".
pub const EXIT_NOT_FOUND: i32 = 127;
/// Shell convention for "found but cannot execute".
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// A command to run: program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl JobSpec {
    /// Build from a full command line. `None` if it is empty.
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl std::fmt::Display for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Per-run knobs.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Stop the supervisor itself whenever the job is stopped.
    pub mirror_stop: bool,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

/// How a job ended.
#[derive(Debug)]
pub enum JobExit {
    Exited(i32),
    /// Raw signal number, realtime signals included.
    Signaled(i32),
    /// The command could not be started at all.
    SpawnFailed { code: i32, source: std::io::Error },
}

impl JobExit {
    /// Exit status as a shell would report it: the code itself, or 128 + N
    /// for a job killed by signal N.
    fn from_status(status: ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => JobExit::Signaled(signal),
            None => JobExit::Exited(status.code().unwrap_or(1)),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            JobExit::Exited(code) => *code,
            JobExit::Signaled(signal) => 128 + *signal,
            JobExit::SpawnFailed { code, .. } => *code,
        }
    }
}

/// Errors while waiting on a job that was spawned successfully.
#[derive(Debug)]
pub enum JobError {
    Wait { pid: i32, source: Errno },
    Reap { pid: i32, source: std::io::Error },
    Join { source: tokio::task::JoinError },
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Wait { pid, source } => write!(f, "failed to wait for job {pid}: {source}"),
            JobError::Reap { pid, source } => write!(f, "failed to reap job {pid}: {source}"),
            JobError::Join { source } => write!(f, "job wait task failed: {source}"),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Wait { source, .. } => Some(source),
            JobError::Reap { source, .. } => Some(source),
            JobError::Join { source } => Some(source),
        }
    }
}

/// Signals routed to a job go to its whole process group.
///
/// The leader is not reaped until after deregistration, so its pid (and
/// therefore the group id) cannot be reused while this target is active.
struct JobTarget {
    pgid: Pid,
    program: String,
}

impl SignalTarget for JobTarget {
    fn describe(&self) -> String {
        format!("job {} ({})", self.pgid, self.program)
    }

    fn deliver(&self, kind: SignalKind) -> std::io::Result<()> {
        killpg(self.pgid, kind.signal()).map_err(std::io::Error::from)
    }
}

/// Environment exported to every job so scripts can branch on the
/// supervisor's signal state.
pub fn supervisor_env(
    identity: &str,
    pending: SignalSet,
    handled: SignalSet,
    last_status: Option<i32>,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("LOCKRUN_IDENTITY".to_string(), identity.to_string()),
        ("LOCKRUN_PENDING".to_string(), pending.to_string()),
        ("LOCKRUN_HANDLED".to_string(), handled.to_string()),
    ];
    if let Some(status) = last_status {
        env.push(("LOCKRUN_LAST_STATUS".to_string(), status.to_string()));
    }
    env
}

/// Jobs start with default dispositions for every monitored signal, even if
/// the supervisor was started with some of them ignored.
fn reset_monitored_signals() -> std::io::Result<()> {
    for kind in SignalKind::ALL {
        // SAFETY: installing SIG_DFL does not involve a handler function.
        unsafe { signal(kind.signal(), SigHandler::SigDfl) }?;
    }
    Ok(())
}

fn spawn_failure_code(e: &std::io::Error) -> i32 {
    if e.kind() == std::io::ErrorKind::NotFound {
        EXIT_NOT_FOUND
    } else {
        EXIT_CANNOT_EXECUTE
    }
}

/// Run one job to completion.
///
/// Pending signals are flushed into the job as soon as it is registered, so
/// anything received between spawn and registration still reaches it.
pub async fn run(
    router: &Arc<Router>,
    spec: &JobSpec,
    options: &JobOptions,
) -> Result<JobExit, JobError> {
    tracing::info!(command = %spec, "running job");

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(options.env.iter().map(|(k, v)| (k, v)))
        .process_group(0);
    // SAFETY: runs in the forked child before exec and only calls
    // sigaction(2), which is async-signal-safe.
    unsafe {
        command.pre_exec(reset_monitored_signals);
    }

    let child = command.spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            let code = spawn_failure_code(&e);
            tracing::error!(command = %spec, error = %e, status = code, "cannot execute job");
            return Ok(JobExit::SpawnFailed { code, source: e });
        }
    };

    let pid = Pid::from_raw(child.id() as i32);

    router.register(Arc::new(JobTarget {
        pgid: pid,
        program: spec.program.clone(),
    }));
    tracing::debug!(pid = pid.as_raw(), "job registered");

    let wait_router = Arc::clone(router);
    let mirror_stop = options.mirror_stop;
    let exit = tokio::task::spawn_blocking(move || wait_for_exit(&wait_router, child, mirror_stop))
        .await
        .map_err(|source| {
            router.deregister();
            JobError::Join { source }
        })??;

    match &exit {
        JobExit::Signaled(signal) => {
            let name = Signal::try_from(*signal).map_or("realtime", |s| s.as_str());
            tracing::info!(pid = pid.as_raw(), signal = *signal, name, status = exit.code(), "job killed by signal")
        }
        _ => tracing::info!(pid = pid.as_raw(), status = exit.code(), "job exited"),
    }
    Ok(exit)
}

/// Block until the job terminates, mirroring any stop along the way.
///
/// `WNOWAIT` leaves the child a zombie while we look at its state; it is only
/// reaped, through `child`, after the router has let go of it.
fn wait_for_exit(router: &Router, mut child: Child, mirror_stop: bool) -> Result<JobExit, JobError> {
    let pid = Pid::from_raw(child.id() as i32);
    let observe = WaitPidFlag::WEXITED | WaitPidFlag::WSTOPPED | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(pid), observe) {
            Ok(WaitStatus::Stopped(_, signal)) => {
                // Consume the stop report so the next wait blocks again;
                // WEXITED is left out so this can never reap.
                if let Err(e) = waitid(Id::Pid(pid), WaitPidFlag::WSTOPPED | WaitPidFlag::WNOHANG) {
                    tracing::warn!(pid = pid.as_raw(), error = %e, "failed to consume job stop report");
                }
                tracing::info!(pid = pid.as_raw(), signal = %signal, "job stopped");
                if mirror_stop {
                    tracing::info!("suspending supervisor until continued");
                    if let Err(e) = raise(Signal::SIGSTOP) {
                        tracing::warn!(error = %e, "failed to suspend supervisor");
                    }
                    tracing::info!("supervisor resumed");
                }
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
            // The job ended on a signal nix has no name for (realtime);
            // the raw status comes from reaping below.
            Err(Errno::EINVAL) => break,
            Ok(other) => tracing::debug!(?other, "ignoring job state change"),
            Err(Errno::EINTR) => {}
            Err(source) => {
                router.deregister();
                return Err(JobError::Wait {
                    pid: pid.as_raw(),
                    source,
                });
            }
        }
    }

    router.deregister();
    let status = child.wait().map_err(|source| JobError::Reap {
        pid: pid.as_raw(),
        source,
    })?;
    Ok(JobExit::from_status(status))
}
