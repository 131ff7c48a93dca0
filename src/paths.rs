use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var("MIRRORS_DATA_DIR") {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::data_dir() else {
            bail!("could not determine data directory");
        };
        Ok(Self {
            data_dir: base.join("mirrors"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("mirrors.pid")
    }

    /// Socket answering status queries and `kill`.
    pub fn socket_file(&self) -> PathBuf {
        self.data_dir.join("mirrors.sock")
    }

    /// Socket plugins connect to for progress and error reports.
    pub fn control_socket(&self) -> PathBuf {
        self.data_dir.join("control.sock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Rotating capture of a site's plugin stdout/stderr.
    pub fn site_log(&self, site: &str) -> PathBuf {
        self.log_dir().join(format!("{site}.log"))
    }

    /// Directory handed to the plugin as `log-directory`.
    pub fn plugin_log_dir(&self, site: &str) -> PathBuf {
        self.log_dir().join(site)
    }

    /// Directory handed to the plugin as `state-directory`.
    pub fn plugin_state_dir(&self, site: &str) -> PathBuf {
        self.data_dir.join("state").join(site)
    }

    pub fn default_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mirrors").join("mirrors.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Paths {
        Paths::with_base(PathBuf::from("/tmp/mirrors-test"))
    }

    #[test]
    fn test_pid_and_sockets_under_data_dir() {
        let paths = paths();
        assert!(paths.pid_file().starts_with(paths.data_dir()));
        assert!(paths.pid_file().ends_with("mirrors.pid"));
        assert!(paths.socket_file().ends_with("mirrors.sock"));
        assert!(paths.control_socket().ends_with("control.sock"));
        assert_ne!(paths.socket_file(), paths.control_socket());
    }

    #[test]
    fn test_site_log_includes_id() {
        let paths = paths();
        assert!(paths.site_log("gentoo").ends_with("logs/gentoo.log"));
        assert!(paths.plugin_log_dir("gentoo").ends_with("logs/gentoo"));
    }

    #[test]
    fn test_plugin_state_dir_per_site() {
        let paths = paths();
        let dir = paths.plugin_state_dir("debian");
        assert!(dir.starts_with(paths.data_dir()));
        assert!(dir.ends_with("state/debian"));
    }

    #[test]
    fn test_default_config_file_name() {
        if let Some(path) = Paths::default_config_file() {
            assert!(path.ends_with("mirrors/mirrors.toml"));
        }
    }
}
