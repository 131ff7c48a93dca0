use crate::config::Config;
use crate::control::ControlChannel;
use crate::coordinator::{CoordinatorHandle, UpdateCoordinator};
use crate::log::LogLimits;
use crate::paths::Paths;
use crate::pid::PidFile;
use crate::process::RunEnv;
use crate::protocol::{self, Request, Response};
use crate::reactor::{Event, TokioReactor};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// How long to keep collecting exits after the kill timeout sends SIGKILL.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Install the daemon's subscriber: `RUST_LOG` or `info`, formatted to
/// stderr. A second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

pub async fn run(paths: Paths, config: Config) -> color_eyre::Result<()> {
    fs::create_dir_all(paths.data_dir())?;
    let _pid_file = PidFile::acquire(&paths)?;

    let socket_path = paths.socket_file();
    remove_socket(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)?;

    let kill_timeout = Duration::from_millis(config.main.kill_timeout_ms());
    let env = RunEnv {
        country: config.main.country.clone(),
        location: config.main.location.clone(),
        paths: paths.clone(),
        log_limits: LogLimits {
            max_bytes: config.main.log_file_size(),
            keep: config.main.log_file_count(),
        },
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut coordinator =
        UpdateCoordinator::new(TokioReactor::new(events_tx.clone()), env, config.sites);
    coordinator.attach_channel(ControlChannel::bind(&paths.control_socket(), events_tx.clone())?);
    coordinator.start();
    info!(
        pid = std::process::id(),
        data_dir = %paths.data_dir().display(),
        "daemon started"
    );

    let handle = CoordinatorHandle::new(events_tx);
    let result = event_loop(&mut coordinator, &mut events, &listener, &handle).await;

    drain(&mut coordinator, &mut events, kill_timeout).await;
    coordinator.dispose();
    if let Err(e) = remove_socket(&socket_path) {
        warn!(path = %socket_path.display(), error = %e, "failed to remove status socket");
    }
    info!("daemon stopped");

    result
}

/// Remove a socket file left behind by this or an earlier daemon. A missing
/// file is fine.
fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn event_loop(
    coordinator: &mut UpdateCoordinator<TokioReactor>,
    events: &mut mpsc::UnboundedReceiver<Event>,
    listener: &UnixListener,
    handle: &CoordinatorHandle,
) -> color_eyre::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                if coordinator.handle_event(event).is_break() {
                    info!("shutdown requested");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handle).await {
                                warn!(error = %e, "status connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "status accept failed"),
                }
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return Ok(());
            }
        }
    }
}

/// Terminate live plugins and keep serving events until they have all
/// exited, escalating to SIGKILL once `kill_timeout` runs out.
async fn drain(
    coordinator: &mut UpdateCoordinator<TokioReactor>,
    events: &mut mpsc::UnboundedReceiver<Event>,
    kill_timeout: Duration,
) {
    let live = coordinator.begin_shutdown();
    if live == 0 {
        return;
    }
    info!(live, "waiting for plugins to exit");

    let mut deadline = tokio::time::Instant::now() + kill_timeout;
    let mut killed = false;
    while coordinator.live_processes() > 0 {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                let _ = coordinator.handle_event(event);
            }
            Ok(None) => break,
            Err(_) if killed => {
                warn!(
                    live = coordinator.live_processes(),
                    "plugins did not report exit after SIGKILL"
                );
                break;
            }
            Err(_) => {
                warn!(
                    live = coordinator.live_processes(),
                    "kill timeout elapsed, sending SIGKILL"
                );
                coordinator.force_kill_all();
                killed = true;
                deadline = tokio::time::Instant::now() + REAP_GRACE;
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: CoordinatorHandle) -> color_eyre::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();
    buf_reader.read_line(&mut line).await?;

    if line.is_empty() {
        return Ok(());
    }

    let response = match protocol::decode_request(&line) {
        Ok(request) => dispatch(request, &handle).await,
        Err(e) => Response::Error {
            message: format!("bad request: {e}"),
        },
    };
    let encoded = protocol::encode_response(&response)?;
    writer.write_all(&encoded).await?;
    writer.shutdown().await?;

    Ok(())
}

async fn dispatch(request: Request, handle: &CoordinatorHandle) -> Response {
    match request {
        Request::Status { id } => match handle.statuses(id).await {
            Ok(sites) => Response::Sites { sites },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },
        Request::Kill => match handle.shutdown() {
            Ok(()) => Response::Success {
                message: Some("daemon shutting down".to_string()),
            },
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        },
    }
}
