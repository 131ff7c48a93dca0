//! The plugin side of the process contract.
//!
//! A plugin executable written in Rust parses its `argv[1]` payload with
//! [`parse_args`], connects a [`ControlClient`] to the socket named by
//! `MIRRORS_CONTROL_SOCKET`, and talks to the daemon only through the
//! [`PluginApi`] capabilities of its run mode.

use crate::control::{self, ControlMessage, ProtocolError};
use crate::process::{CONTROL_SOCKET_ENV, RunMode};
use chrono::NaiveDateTime;
use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

pub use crate::process::PluginArgs;

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("expected a single JSON argument")]
    MissingArgs,
    #[error("invalid plugin arguments: {0}")]
    BadArgs(#[from] serde_json::Error),
    #[error("{} is not set", CONTROL_SOCKET_ENV)]
    NoControlSocket,
    #[error("control socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(u8),
    #[error("hold-for must be positive")]
    ZeroHoldFor,
    #[error("{kind} reports are not accepted in {mode} mode")]
    Refused { kind: &'static str, mode: RunMode },
}

/// Parse the payload from an argv iterator (program name first).
pub fn parse_args(mut argv: impl Iterator<Item = String>) -> Result<PluginArgs, PluginError> {
    let _program = argv.next();
    let payload = argv.next().ok_or(PluginError::MissingArgs)?;
    if argv.next().is_some() {
        return Err(PluginError::MissingArgs);
    }
    Ok(serde_json::from_str(&payload)?)
}

/// Writes length-prefixed control frames to the daemon.
#[derive(Debug)]
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn connect(path: &Path) -> io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Connect to the socket the daemon advertised in the environment.
    pub fn from_env() -> Result<Self, PluginError> {
        let path = std::env::var_os(CONTROL_SOCKET_ENV).ok_or(PluginError::NoControlSocket)?;
        Ok(Self::connect(Path::new(&path))?)
    }

    pub fn send(&mut self, message: &ControlMessage) -> Result<(), PluginError> {
        let frame = control::encode_frame(message)?;
        self.stream.write_all(&frame)?;
        Ok(())
    }
}

/// What a running plugin may ask of, and report to, the daemon.
pub trait PluginApi {
    fn args(&self) -> &PluginArgs;

    fn country(&self) -> &str {
        &self.args().country
    }

    fn location(&self) -> &str {
        &self.args().location
    }

    fn state_dir(&self) -> &Path {
        &self.args().state_directory
    }

    fn log_dir(&self) -> &Path {
        &self.args().log_directory
    }

    /// The `data-directory` parameter of storage backend `storage`.
    fn data_dir(&self, storage: &str) -> Option<PathBuf> {
        self.args()
            .storage(storage)?
            .get("data-directory")?
            .as_str()
            .map(PathBuf::from)
    }

    /// The scheduled time of the update being performed.
    fn sched_datetime(&self) -> Option<NaiveDateTime> {
        self.args().sched_datetime
    }

    fn progress_changed(&mut self, progress: u8) -> Result<(), PluginError>;

    fn error_occurred(&mut self, exc_info: serde_json::Value) -> Result<(), PluginError>;

    fn error_occurred_and_hold_for(
        &mut self,
        seconds: u64,
        exc_info: serde_json::Value,
    ) -> Result<(), PluginError>;
}

/// [`PluginApi`] backed by a control socket connection. The allowed reports
/// follow the run mode in the payload.
#[derive(Debug)]
pub struct PluginContext {
    args: PluginArgs,
    client: ControlClient,
}

impl PluginContext {
    pub fn new(args: PluginArgs, client: ControlClient) -> Self {
        Self { args, client }
    }

    /// Build from the process's own argv and environment.
    pub fn from_env() -> Result<Self, PluginError> {
        let args = parse_args(std::env::args())?;
        Ok(Self::new(args, ControlClient::from_env()?))
    }

    pub fn run_mode(&self) -> RunMode {
        self.args.run_mode
    }

    fn refuse_in_maintain(&self, kind: &'static str) -> Result<(), PluginError> {
        match self.args.run_mode {
            RunMode::Maintain => Err(PluginError::Refused {
                kind,
                mode: RunMode::Maintain,
            }),
            RunMode::Init | RunMode::Update => Ok(()),
        }
    }
}

impl PluginApi for PluginContext {
    fn args(&self) -> &PluginArgs {
        &self.args
    }

    fn progress_changed(&mut self, progress: u8) -> Result<(), PluginError> {
        self.refuse_in_maintain("progress")?;
        if progress > 100 {
            return Err(PluginError::ProgressOutOfRange(progress));
        }
        self.client.send(&ControlMessage::Progress(progress))
    }

    fn error_occurred(&mut self, exc_info: serde_json::Value) -> Result<(), PluginError> {
        self.client.send(&ControlMessage::Error { exc_info })
    }

    fn error_occurred_and_hold_for(
        &mut self,
        seconds: u64,
        exc_info: serde_json::Value,
    ) -> Result<(), PluginError> {
        self.refuse_in_maintain("error-and-hold-for")?;
        if seconds == 0 {
            return Err(PluginError::ZeroHoldFor);
        }
        self.client
            .send(&ControlMessage::ErrorAndHoldFor { seconds, exc_info })
    }
}
