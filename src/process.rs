use crate::log::{self, LogLimits};
use crate::paths::Paths;
use crate::reactor::Event;
use crate::site::MirrorSite;
use crate::state_files::{format_datetime, minute_format};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;

/// Environment variable telling a plugin where the control socket lives.
pub const CONTROL_SOCKET_ENV: &str = "MIRRORS_CONTROL_SOCKET";

/// How long the log copier may keep draining after the child is reaped.
/// Grandchildren that inherited the pipe must not hold up exit delivery.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    SpawnFailed {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode plugin arguments: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("failed to set up output pipe: {0}")]
    Pipe(std::io::Error),
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
}

// ---------------------------------------------------------------------------
// Run mode and argument payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Init,
    Update,
    Maintain,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Init => write!(f, "init"),
            RunMode::Update => write!(f, "update"),
            RunMode::Maintain => write!(f, "maintain"),
        }
    }
}

/// Daemon-wide values every plugin run receives.
#[derive(Debug, Clone)]
pub struct RunEnv {
    pub country: String,
    pub location: String,
    pub paths: Paths,
    pub log_limits: LogLimits,
}

/// The single JSON object passed as `argv[1]` to a plugin executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginArgs {
    pub id: String,
    pub config: serde_json::Value,
    #[serde(rename = "state-directory")]
    pub state_directory: PathBuf,
    #[serde(rename = "log-directory")]
    pub log_directory: PathBuf,
    #[serde(rename = "debug-flag")]
    pub debug_flag: String,
    pub country: String,
    pub location: String,
    #[serde(rename = "run-mode")]
    pub run_mode: RunMode,
    /// Only present for `run-mode = update`.
    #[serde(
        rename = "sched-datetime",
        with = "minute_format",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sched_datetime: Option<NaiveDateTime>,
    /// `storage-<name>` entries, one per configured storage backend.
    #[serde(flatten)]
    pub storage: BTreeMap<String, serde_json::Value>,
}

impl PluginArgs {
    pub fn new(
        site: &MirrorSite,
        mode: RunMode,
        env: &RunEnv,
        scheduled: Option<NaiveDateTime>,
    ) -> Self {
        Self {
            id: site.id.clone(),
            config: site.config.clone(),
            state_directory: env.paths.plugin_state_dir(&site.id),
            log_directory: env.paths.plugin_log_dir(&site.id),
            debug_flag: String::new(),
            country: env.country.clone(),
            location: env.location.clone(),
            run_mode: mode,
            sched_datetime: match mode {
                RunMode::Update => scheduled,
                _ => None,
            },
            storage: site
                .storage
                .iter()
                .map(|(name, params)| (format!("storage-{name}"), params.clone()))
                .collect(),
        }
    }

    /// Parameters for storage backend `name`, if configured.
    pub fn storage(&self, name: &str) -> Option<&serde_json::Value> {
        self.storage.get(&format!("storage-{name}"))
    }
}

// ---------------------------------------------------------------------------
// Spawn request / exit outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub site: String,
    pub mode: RunMode,
    pub program: PathBuf,
    pub args: PluginArgs,
    pub log_path: PathBuf,
    pub log_limits: LogLimits,
    pub control_socket: PathBuf,
}

impl SpawnRequest {
    pub fn new(site: &MirrorSite, mode: RunMode, program: PathBuf, args: PluginArgs, env: &RunEnv) -> Self {
        Self {
            site: site.id.clone(),
            mode,
            program,
            args,
            log_path: env.paths.site_log(&site.id),
            log_limits: env.log_limits,
            control_socket: env.paths.control_socket(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
    /// The wait itself failed; treated as a crash.
    Unknown,
}

impl ExitOutcome {
    pub fn success(self) -> bool {
        self == ExitOutcome::Code(0)
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Code(code),
            (None, Some(sig)) => ExitOutcome::Signal(sig),
            (None, None) => ExitOutcome::Unknown,
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "code {code}"),
            ExitOutcome::Signal(sig) => write!(f, "signal {sig}"),
            ExitOutcome::Unknown => write!(f, "unknown status"),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Start a plugin with `[program, json-args]`, stdout and stderr merged into
/// one pipe that is copied into the site's rotating log. A task reaps the
/// child and posts `Event::ChildReaped` right away, then waits for the log to
/// drain before posting `Event::ChildExited`.
pub fn spawn_plugin(
    request: SpawnRequest,
    events: UnboundedSender<Event>,
) -> Result<u32, ProcessError> {
    let payload = serde_json::to_string(&request.args)?;

    for dir in [&request.args.log_directory, &request.args.state_directory] {
        std::fs::create_dir_all(dir).map_err(|source| ProcessError::SpawnFailed {
            program: request.program.clone(),
            source,
        })?;
    }

    let (read_end, write_end) =
        nix::unistd::pipe().map_err(|e| ProcessError::Pipe(std::io::Error::from(e)))?;
    let stderr_end = write_end.try_clone().map_err(ProcessError::Pipe)?;
    let receiver =
        tokio::net::unix::pipe::Receiver::from_owned_fd(read_end).map_err(ProcessError::Pipe)?;

    let mut cmd = Command::new(&request.program);
    cmd.arg(&payload)
        .env(CONTROL_SOCKET_ENV, &request.control_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end));

    let spawned = cmd.spawn();
    // The command still owns our copies of the write end; EOF only arrives
    // once they are closed.
    drop(cmd);
    let mut child = spawned.map_err(|source| ProcessError::SpawnFailed {
        program: request.program.clone(),
        source,
    })?;

    let Some(pid) = child.id() else {
        return Err(ProcessError::SpawnFailed {
            program: request.program,
            source: std::io::Error::other("child exited before its pid was read"),
        });
    };

    let banner = format!(
        "=== {} {} {} (pid {pid}) ===",
        format_datetime(chrono::Local::now().naive_local()),
        request.site,
        request.mode,
    );
    let log_path = request.log_path;
    let limits = request.log_limits;
    let site = request.site;

    tokio::spawn(async move {
        let mut copier = tokio::spawn(async move {
            log::copy_to_rotating_log(receiver, &log_path, limits, Some(banner)).await
        });

        let outcome = match child.wait().await {
            Ok(status) => ExitOutcome::from_status(status),
            Err(e) => {
                warn!(site = %site, pid, error = %e, "failed to wait for plugin");
                ExitOutcome::Unknown
            }
        };
        let _ = events.send(Event::ChildReaped {
            site: site.clone(),
            pid,
        });

        match tokio::time::timeout(LOG_DRAIN_GRACE, &mut copier).await {
            Ok(Ok(Ok(bytes))) => debug!(site = %site, pid, bytes, "plugin log drained"),
            Ok(Ok(Err(e))) => warn!(site = %site, pid, error = %e, "plugin log copy failed"),
            Ok(Err(e)) => warn!(site = %site, pid, error = %e, "plugin log task failed"),
            Err(_) => {
                copier.abort();
                warn!(site = %site, pid, "plugin output still open after exit, log truncated");
            }
        }

        let _ = events.send(Event::ChildExited { site, pid, outcome });
    });

    Ok(pid)
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    let target = nix::unistd::Pid::from_raw(pid as i32);
    nix::sys::signal::kill(target, signal).map_err(|source| ProcessError::Signal { pid, source })
}

/// Ask the child to stop. Best effort: the run only ends when its exit
/// event arrives.
pub fn terminate(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

pub fn force_kill(pid: u32) -> Result<(), ProcessError> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
