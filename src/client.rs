use crate::paths::Paths;
use crate::pid;
use crate::protocol::{self, Request, Response};
use color_eyre::eyre::{Context, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const CONNECT_RETRIES: u32 = 10;
const CONNECT_DELAY: Duration = Duration::from_millis(200);

/// Send one request to the running daemon and wait for its answer. The
/// daemon is never started on demand; `mirrors daemon` does that.
pub fn send_request(paths: &Paths, request: &Request) -> color_eyre::Result<Response> {
    if pid::running_daemon(paths)?.is_none() {
        bail!("daemon is not running (start it with `mirrors daemon`)");
    }
    let mut stream = connect_with_retry(paths, CONNECT_RETRIES, CONNECT_DELAY)?;

    let encoded = protocol::encode_request(request)?;
    stream.write_all(&encoded)?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .context("failed to read daemon response")?;
    if line.is_empty() {
        bail!("daemon closed the connection without answering");
    }

    Ok(protocol::decode_response(&line)?)
}

// The pid file is written before the socket is bound, so a freshly started
// daemon may briefly refuse connections.
fn connect_with_retry(
    paths: &Paths,
    retries: u32,
    delay: Duration,
) -> color_eyre::Result<UnixStream> {
    let socket = paths.socket_file();
    let mut attempt = 0;
    loop {
        match UnixStream::connect(&socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 >= retries => {
                bail!("failed to connect to daemon after {retries} attempts: {e}");
            }
            Err(_) => {
                attempt += 1;
                std::thread::sleep(delay);
            }
        }
    }
}
