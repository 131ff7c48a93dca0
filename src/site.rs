use crate::scheduler::{self, Interval, ScheduleError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Interval,
    Cron,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleKind::Interval => write!(f, "interval"),
            ScheduleKind::Cron => write!(f, "cron"),
        }
    }
}

/// A configured mirror site. Immutable once loaded; the coordinator owns it
/// and every other component only borrows it.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSite {
    pub id: String,
    pub master_dir: PathBuf,
    pub initializer: Option<PathBuf>,
    pub updater: Option<PathBuf>,
    pub maintainer: Option<PathBuf>,
    pub sched_type: ScheduleKind,
    pub sched_expr: String,
    /// Opaque plugin configuration, passed through as `config`.
    pub config: serde_json::Value,
    /// Per-storage-backend parameters, passed through as `storage-<name>`.
    pub storage: BTreeMap<String, serde_json::Value>,
}

impl MirrorSite {
    pub fn master_dir(&self) -> &Path {
        &self.master_dir
    }

    /// A site without an initializer starts directly in `Idle`.
    pub fn needs_initializer(&self) -> bool {
        self.initializer.is_some()
    }

    /// Parse the schedule expression without registering it.
    pub fn validate_schedule(&self) -> Result<(), ScheduleError> {
        match self.sched_type {
            ScheduleKind::Interval => Interval::parse(&self.sched_expr).map(|_| ()),
            ScheduleKind::Cron => scheduler::parse_cron_expression(&self.sched_expr).map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(sched_type: ScheduleKind, sched_expr: &str) -> MirrorSite {
        MirrorSite {
            id: "alpine".to_string(),
            master_dir: PathBuf::from("/srv/mirrors/alpine"),
            initializer: None,
            updater: Some(PathBuf::from("/usr/lib/mirrors/rsync")),
            maintainer: None,
            sched_type,
            sched_expr: sched_expr.to_string(),
            config: serde_json::Value::Null,
            storage: BTreeMap::new(),
        }
    }

    #[test]
    fn test_validate_interval() {
        assert!(site(ScheduleKind::Interval, "2h").validate_schedule().is_ok());
        assert!(site(ScheduleKind::Interval, "2 fortnights").validate_schedule().is_err());
    }

    #[test]
    fn test_validate_cron() {
        assert!(site(ScheduleKind::Cron, "0 */4 * * *").validate_schedule().is_ok());
        assert!(site(ScheduleKind::Cron, "every day").validate_schedule().is_err());
    }

    #[test]
    fn test_needs_initializer() {
        let mut s = site(ScheduleKind::Interval, "1h");
        assert!(!s.needs_initializer());
        s.initializer = Some(PathBuf::from("/usr/lib/mirrors/init"));
        assert!(s.needs_initializer());
    }

    #[test]
    fn test_schedule_kind_display() {
        assert_eq!(ScheduleKind::Interval.to_string(), "interval");
        assert_eq!(ScheduleKind::Cron.to_string(), "cron");
    }
}
