//! Durable per-site facts kept in the site's master directory.
//!
//! `INITIALIZED` exists once an initializer run has succeeded.
//! `LAST_UPDATE_DATETIME` holds the scheduled time of the most recent
//! successful update as `YYYY-MM-DD HH:MM`.

use chrono::NaiveDateTime;
use std::io;
use std::path::{Path, PathBuf};

pub const INITIALIZED_FILE: &str = "INITIALIZED";
pub const LAST_UPDATE_FILE: &str = "LAST_UPDATE_DATETIME";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: malformed timestamp `{content}`")]
    Malformed { path: PathBuf, content: String },
}

#[derive(Debug, Clone)]
pub struct StateFiles {
    initialized: PathBuf,
    last_update: PathBuf,
}

impl StateFiles {
    pub fn new(master_dir: &Path) -> Self {
        Self {
            initialized: master_dir.join(INITIALIZED_FILE),
            last_update: master_dir.join(LAST_UPDATE_FILE),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.exists()
    }

    pub fn set_initialized(&self) -> Result<(), PersistenceError> {
        ensure_parent(&self.initialized)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.initialized)
            .map(drop)
            .map_err(|source| PersistenceError::Io {
                path: self.initialized.clone(),
                source,
            })
    }

    /// `Ok(None)` when no update has ever succeeded.
    pub fn read_last_update(&self) -> Result<Option<NaiveDateTime>, PersistenceError> {
        let content = match std::fs::read_to_string(&self.last_update) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.last_update.clone(),
                    source,
                });
            }
        };
        NaiveDateTime::parse_from_str(content.trim(), DATETIME_FORMAT)
            .map(Some)
            .map_err(|_| PersistenceError::Malformed {
                path: self.last_update.clone(),
                content,
            })
    }

    /// Written via a temp file and rename so a crash never leaves a
    /// truncated timestamp behind.
    pub fn write_last_update(&self, scheduled: NaiveDateTime) -> Result<(), PersistenceError> {
        ensure_parent(&self.last_update)?;
        let mut tmp = self.last_update.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| PersistenceError::Io { path, source }
        };
        std::fs::write(&tmp, format_datetime(scheduled)).map_err(io_err(&tmp))?;
        std::fs::rename(&tmp, &self.last_update).map_err(io_err(&self.last_update))
    }
}

pub fn format_datetime(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Serde adapter for optional timestamps in the minute format used on disk
/// and on the wire.
pub mod minute_format {
    use super::DATETIME_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.format(DATETIME_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| {
            NaiveDateTime::parse_from_str(&s, DATETIME_FORMAT).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

fn ensure_parent(path: &Path) -> Result<(), PersistenceError> {
    match path.parent() {
        Some(dir) => std::fs::create_dir_all(dir).map_err(|source| PersistenceError::Io {
            path: dir.to_path_buf(),
            source,
        }),
        None => Ok(()),
    }
}
