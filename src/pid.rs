use crate::paths::Paths;
use nix::sys::signal;
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Ownership of the daemon's pid file. Removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record this process as the running daemon. Fails if another live
    /// daemon already owns the data directory.
    pub fn acquire(paths: &Paths) -> io::Result<Self> {
        if let Some(pid) = running_daemon(paths)? {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("daemon is already running (pid {pid})"),
            ));
        }
        let path = paths.pid_file();
        fs::write(&path, std::process::id().to_string())?;
        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn read_pid_file(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Pid of the live daemon, if any. A pid file naming a dead process is
/// removed.
pub fn running_daemon(paths: &Paths) -> io::Result<Option<u32>> {
    let Some(pid) = read_pid_file(paths) else {
        return Ok(None);
    };

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => Ok(Some(pid)),
        Err(nix::errno::Errno::ESRCH) => {
            let _ = fs::remove_file(paths.pid_file());
            Ok(None)
        }
        // Exists, owned by someone else.
        Err(nix::errno::Errno::EPERM) => Ok(Some(pid)),
        Err(e) => Err(io::Error::other(e)),
    }
}
