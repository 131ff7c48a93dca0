use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// 10 MB rotation threshold
pub const LOG_ROTATION_SIZE: u64 = 10 * 1024 * 1024;

/// Keep up to 3 rotated files (.1, .2, .3)
pub const LOG_ROTATION_KEEP: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    pub max_bytes: u64,
    pub keep: u32,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            max_bytes: LOG_ROTATION_SIZE,
            keep: LOG_ROTATION_KEEP,
        }
    }
}

// ---------------------------------------------------------------------------
// tail_file: read last N lines from a file
// ---------------------------------------------------------------------------

pub fn tail_file(path: &Path, n: usize) -> io::Result<Vec<String>> {
    use std::io::{Read, Seek};

    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Walk backwards in chunks until N+1 newlines are behind us.
    const CHUNK: usize = 8192;
    let mut newlines: usize = 0;
    let mut pos = len;
    let mut start_offset: u64 = 0;

    'outer: while pos > 0 {
        let read_start = pos.saturating_sub(CHUNK as u64);
        let to_read = (pos - read_start) as usize;
        let mut buf = vec![0u8; to_read];
        file.seek(io::SeekFrom::Start(read_start))?;
        file.read_exact(&mut buf)?;

        for (i, &b) in buf.iter().enumerate().rev() {
            if b == b'\n' {
                newlines += 1;
                if newlines > n {
                    start_offset = read_start + (i as u64) + 1;
                    break 'outer;
                }
            }
        }
        pos = read_start;
    }

    file.seek(io::SeekFrom::Start(start_offset))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;

    // Plugin output is not guaranteed to be UTF-8.
    let mut lines: Vec<String> = String::from_utf8_lossy(&tail)
        .lines()
        .map(String::from)
        .collect();
    lines.truncate(n);
    Ok(lines)
}

// ---------------------------------------------------------------------------
// rotate_log: shift rotated files and rename current to .1
// ---------------------------------------------------------------------------

pub async fn rotate_log(path: &Path, max_rotations: u32) -> io::Result<()> {
    if max_rotations == 0 {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await?;
        }
        return Ok(());
    }

    let oldest = rotated_path(path, max_rotations);
    if tokio::fs::try_exists(&oldest).await.unwrap_or(false) {
        tokio::fs::remove_file(&oldest).await?;
    }

    // Shift .2 -> .3, .1 -> .2, etc.
    for i in (1..max_rotations).rev() {
        let from = rotated_path(path, i);
        let to = rotated_path(path, i + 1);
        if tokio::fs::try_exists(&from).await.unwrap_or(false) {
            tokio::fs::rename(&from, &to).await?;
        }
    }

    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        tokio::fs::rename(path, rotated_path(path, 1)).await?;
    }

    Ok(())
}

pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(format!(".{n}"));
    p.into()
}

// ---------------------------------------------------------------------------
// copy_to_rotating_log: drain a plugin's merged stdout/stderr into the
// site log until EOF
// ---------------------------------------------------------------------------

/// Appends everything read from `reader` to `log_path`, rotating whenever the
/// file reaches `limits.max_bytes`. Output is copied in fixed-size blocks and
/// split at the limit, so a plugin that never prints a newline still cannot
/// grow the file past it. `banner` is written first so consecutive runs are
/// easy to tell apart. Returns the number of bytes copied from the reader.
pub async fn copy_to_rotating_log(
    mut reader: impl AsyncRead + Unpin,
    log_path: &Path,
    limits: LogLimits,
    banner: Option<String>,
) -> io::Result<u64> {
    if let Some(dir) = log_path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut log = RotatingFile::open(log_path, limits).await?;
    if let Some(banner) = banner {
        log.write(format!("{banner}\n").as_bytes()).await?;
    }

    let mut block = vec![0u8; COPY_BLOCK];
    let mut copied: u64 = 0;
    loop {
        let n = reader.read(&mut block).await?;
        if n == 0 {
            break; // EOF: every writer end is closed, the child is gone
        }
        copied += n as u64;
        log.write(&block[..n]).await?;
    }

    log.file.flush().await?;
    Ok(copied)
}

const COPY_BLOCK: usize = 8192;

struct RotatingFile<'a> {
    path: &'a Path,
    limits: LogLimits,
    file: tokio::fs::File,
    len: u64,
}

impl<'a> RotatingFile<'a> {
    async fn open(path: &'a Path, limits: LogLimits) -> io::Result<Self> {
        let file = open_append(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            limits,
            file,
            len,
        })
    }

    async fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        let max = self.limits.max_bytes.max(1);
        while !data.is_empty() {
            if self.len >= max {
                self.rotate().await?;
            }
            let room = usize::try_from(max - self.len).unwrap_or(usize::MAX);
            let (head, rest) = data.split_at(data.len().min(room));
            self.file.write_all(head).await?;
            self.len += head.len() as u64;
            data = rest;
        }
        Ok(())
    }

    async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        rotate_log(self.path, self.limits.keep).await?;
        self.file = open_append(self.path).await?;
        self.len = 0;
        Ok(())
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
