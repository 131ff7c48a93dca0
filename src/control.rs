//! Plugin to daemon reporting channel.
//!
//! Frames are a 4-byte big-endian length followed by that many bytes of JSON.
//! A peer is identified by the OS pid behind its socket, which must belong to
//! a running plugin; anyone else is disconnected before a frame is read.

use crate::reactor::Event;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("connection closed in the middle of a frame")]
    Truncated,
    #[error("malformed control message: {0}")]
    Malformed(String),
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(i64),
    #[error("hold-for seconds must be greater than 0, got {0}")]
    InvalidHoldFor(i64),
    #[error("peer pid unavailable")]
    NoPeerPid,
    #[error("daemon event loop has stopped")]
    LoopClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The wire shape, before range checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", content = "data", rename_all = "kebab-case")]
enum WireMessage {
    Progress {
        progress: i64,
    },
    Error {
        exc_info: serde_json::Value,
    },
    ErrorAndHoldFor {
        seconds: i64,
        exc_info: serde_json::Value,
    },
}

/// A validated report from a running plugin.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Progress(u8),
    Error {
        exc_info: serde_json::Value,
    },
    ErrorAndHoldFor {
        seconds: u64,
        exc_info: serde_json::Value,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Progress(_) => "progress",
            ControlMessage::Error { .. } => "error",
            ControlMessage::ErrorAndHoldFor { .. } => "error-and-hold-for",
        }
    }

    fn to_wire(&self) -> WireMessage {
        match self {
            ControlMessage::Progress(p) => WireMessage::Progress {
                progress: i64::from(*p),
            },
            ControlMessage::Error { exc_info } => WireMessage::Error {
                exc_info: exc_info.clone(),
            },
            ControlMessage::ErrorAndHoldFor { seconds, exc_info } => WireMessage::ErrorAndHoldFor {
                seconds: i64::try_from(*seconds).unwrap_or(i64::MAX),
                exc_info: exc_info.clone(),
            },
        }
    }
}

pub fn decode_message(payload: &[u8]) -> Result<ControlMessage, ProtocolError> {
    let wire: WireMessage =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    match wire {
        WireMessage::Progress { progress } => u8::try_from(progress)
            .ok()
            .filter(|p| *p <= 100)
            .map(ControlMessage::Progress)
            .ok_or(ProtocolError::ProgressOutOfRange(progress)),
        WireMessage::Error { exc_info } => Ok(ControlMessage::Error { exc_info }),
        WireMessage::ErrorAndHoldFor { seconds, exc_info } => {
            if seconds <= 0 {
                return Err(ProtocolError::InvalidHoldFor(seconds));
            }
            Ok(ControlMessage::ErrorAndHoldFor {
                seconds: seconds as u64,
                exc_info,
            })
        }
    }
}

pub fn encode_frame(message: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let body =
        serde_json::to_vec(&message.to_wire()).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Next frame body, or `None` on a clean EOF between frames.
pub async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(Some(body))
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// The bound control socket and its accept task.
pub struct ControlChannel {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl ControlChannel {
    /// Bind `path` (replacing a stale socket file) and start accepting peers.
    pub fn bind(path: &Path, events: mpsc::UnboundedSender<Event>) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        let task = tokio::spawn(accept_loop(listener, events));
        Ok(Self {
            path: path.to_path_buf(),
            task,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting and remove the socket file. Connections already being
    /// served end when their peer hangs up or the loop goes away.
    pub fn close(self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove control socket");
        }
    }
}

async fn accept_loop(listener: UnixListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "control socket accept failed");
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(stream, events).await {
                debug!(error = %e, "control connection closed");
            }
        });
    }
}

async fn serve_peer(
    mut stream: UnixStream,
    events: mpsc::UnboundedSender<Event>,
) -> Result<(), ProtocolError> {
    let pid = stream
        .peer_cred()?
        .pid()
        .and_then(|p| u32::try_from(p).ok())
        .ok_or(ProtocolError::NoPeerPid)?;

    let (reply, answer) = oneshot::channel();
    events
        .send(Event::PeerConnected { pid, reply })
        .map_err(|_| ProtocolError::LoopClosed)?;
    let Some(site) = answer.await.ok().flatten() else {
        // Rejection is logged by the loop.
        return Ok(());
    };
    debug!(site = %site, pid, "control peer accepted");

    while let Some(body) = read_frame(&mut stream).await? {
        match decode_message(&body) {
            Ok(message) => events
                .send(Event::Control { pid, message })
                .map_err(|_| ProtocolError::LoopClosed)?,
            Err(e) => warn!(site = %site, pid, error = %e, "rejected control message"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
