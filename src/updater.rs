//! Per-site lifecycle: initialize once, then update on schedule, with an
//! optional long-running maintainer while the site is idle.
//!
//! A site runs at most one plugin process at a time. A scheduled update that
//! lands while the maintainer is running stops the maintainer and starts
//! once it has exited.

use crate::control::ControlMessage;
use crate::process::{ExitOutcome, PluginArgs, ProcessError, RunEnv, RunMode, SpawnRequest};
use crate::reactor::{Reactor, TimerId, TimerKind};
use crate::scheduler::{JobScheduler, ScheduleError};
use crate::site::{MirrorSite, ScheduleKind};
use crate::state_files::{PersistenceError, StateFiles, format_datetime, minute_format};
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Backoff before re-initializing, restarting a maintainer, or retrying
/// after a failed spawn, unless the plugin asked for something else.
pub const RESTART_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Init,
    Initializing,
    InitFailed,
    Idle,
    Updating,
    UpdateFailed,
    /// Persisted state could not be read. The site is listed but never runs.
    Disabled,
}

impl UpdateState {
    pub fn is_initialized(self) -> bool {
        !matches!(
            self,
            UpdateState::Init | UpdateState::Initializing | UpdateState::InitFailed
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateState::Init => write!(f, "init"),
            UpdateState::Initializing => write!(f, "initializing"),
            UpdateState::InitFailed => write!(f, "init_failed"),
            UpdateState::Idle => write!(f, "idle"),
            UpdateState::Updating => write!(f, "updating"),
            UpdateState::UpdateFailed => write!(f, "update_failed"),
            UpdateState::Disabled => write!(f, "disabled"),
        }
    }
}

/// What the status query reports for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub id: String,
    pub initialized: bool,
    pub update_status: UpdateState,
    #[serde(with = "minute_format", default)]
    pub last_update_time: Option<NaiveDateTime>,
    /// Only while initializing or updating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_progress: Option<u8>,
    /// Why a disabled site is not running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A control message that does not fit the site's current run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("no running process has pid {0}")]
    UnknownPeer(u32),
    #[error("pid {0} is not the site's current process")]
    StalePid(u32),
    #[error("{kind} message not accepted from a {mode} run")]
    OutOfPhase { kind: &'static str, mode: RunMode },
    #[error("progress went backwards from {current} to {reported}")]
    RegressiveProgress { current: u8, reported: u8 },
    #[error("an error is already recorded for this run")]
    DuplicateError,
}

/// Site-local failures handed back to the coordinator for logging. The
/// state machine has already taken its failure transition when one of these
/// is returned.
#[derive(Debug, thiserror::Error)]
pub enum UpdaterError {
    #[error("site {site}: {mode} failed to start: {source}")]
    Spawn {
        site: String,
        mode: RunMode,
        #[source]
        source: ProcessError,
    },
    #[error("site {site}: {source}")]
    Persistence {
        site: String,
        #[source]
        source: PersistenceError,
    },
    #[error("site {site}: cannot schedule updates: {source}")]
    Schedule {
        site: String,
        #[source]
        source: ScheduleError,
    },
}

/// Borrowed collaborators for one dispatch.
pub struct UpdaterCx<'a> {
    pub reactor: &'a mut dyn Reactor,
    pub scheduler: &'a mut JobScheduler,
    pub env: &'a RunEnv,
}

#[derive(Debug)]
struct RunningProcess {
    pid: u32,
    mode: RunMode,
    progress: u8,
    error: Option<serde_json::Value>,
    hold_for: Option<u64>,
    /// Scheduled time of an update run.
    scheduled: Option<NaiveDateTime>,
    /// Waited on but the exit not yet delivered. The pid may be reused.
    reaped: bool,
}

impl RunningProcess {
    fn new(pid: u32, mode: RunMode, scheduled: Option<NaiveDateTime>) -> Self {
        Self {
            pid,
            mode,
            progress: 0,
            error: None,
            hold_for: None,
            scheduled,
            reaped: false,
        }
    }
}

#[derive(Debug)]
pub struct SiteUpdater {
    site: Arc<MirrorSite>,
    files: StateFiles,
    state: UpdateState,
    last_update: Option<NaiveDateTime>,
    process: Option<RunningProcess>,
    retry_timer: Option<TimerId>,
    maintainer_timer: Option<TimerId>,
    /// Update that fired while the maintainer was still running.
    deferred_update: Option<NaiveDateTime>,
    /// Hold-for from the last failed run, reused as spawn-failure backoff.
    carried_hold_for: Option<u64>,
    stopping: bool,
    disabled: Option<String>,
}

impl SiteUpdater {
    /// A site whose last update time cannot be read starts out `Disabled`.
    pub fn new(site: Arc<MirrorSite>) -> Self {
        let files = StateFiles::new(site.master_dir());
        let needs_init = site.needs_initializer() && !files.is_initialized();
        let (state, last_update, disabled) = if needs_init {
            (UpdateState::Init, None, None)
        } else {
            match files.read_last_update() {
                Ok(last_update) => (UpdateState::Idle, last_update, None),
                Err(e) => {
                    error!(site = %site.id, error = %e, "cannot load site state, site disabled");
                    (UpdateState::Disabled, None, Some(e.to_string()))
                }
            }
        };
        Self {
            site,
            files,
            state,
            last_update,
            process: None,
            retry_timer: None,
            maintainer_timer: None,
            deferred_update: None,
            carried_hold_for: None,
            stopping: false,
            disabled,
        }
    }

    pub fn id(&self) -> &str {
        &self.site.id
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// Pid of the current process while it has not been reaped yet.
    pub fn live_pid(&self) -> Option<u32> {
        self.process.as_ref().filter(|p| !p.reaped).map(|p| p.pid)
    }

    pub fn status(&self) -> SiteStatus {
        let progress = match self.state {
            UpdateState::Initializing | UpdateState::Updating => {
                self.process.as_ref().map(|p| p.progress)
            }
            _ => None,
        };
        SiteStatus {
            id: self.site.id.clone(),
            initialized: self.state.is_initialized(),
            update_status: self.state,
            last_update_time: self.last_update,
            update_progress: progress,
            error: self.disabled.clone(),
        }
    }

    /// Startup trigger: initialize, or go straight to scheduling.
    pub fn start(&mut self, cx: &mut UpdaterCx<'_>) -> Result<(), UpdaterError> {
        match self.state {
            UpdateState::Init => self.start_init(cx),
            UpdateState::Idle => self.post_init(cx),
            UpdateState::Disabled => {
                warn!(site = %self.site.id, "site disabled, not scheduling updates");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Initialization
    // -----------------------------------------------------------------------

    fn start_init(&mut self, cx: &mut UpdaterCx<'_>) -> Result<(), UpdaterError> {
        debug_assert!(matches!(
            self.state,
            UpdateState::Init | UpdateState::InitFailed
        ));
        let Some(program) = self.site.initializer.clone() else {
            return self.post_init(cx);
        };

        match self.spawn(cx, RunMode::Init, program, None) {
            Ok(pid) => {
                self.state = UpdateState::Initializing;
                self.process = Some(RunningProcess::new(pid, RunMode::Init, None));
                info!(site = %self.site.id, pid, "initialization started");
                Ok(())
            }
            Err(source) => {
                self.state = UpdateState::InitFailed;
                let backoff = self.spawn_backoff();
                self.arm_retry(cx, backoff);
                Err(UpdaterError::Spawn {
                    site: self.site.id.clone(),
                    mode: RunMode::Init,
                    source,
                })
            }
        }
    }

    fn finish_init(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        run: RunningProcess,
        outcome: ExitOutcome,
    ) -> Result<(), UpdaterError> {
        if outcome.success() {
            if let Err(source) = self.files.set_initialized() {
                self.state = UpdateState::InitFailed;
                self.arm_retry(cx, RESTART_INTERVAL);
                return Err(UpdaterError::Persistence {
                    site: self.site.id.clone(),
                    source,
                });
            }
            self.state = UpdateState::Idle;
            self.carried_hold_for = None;
            info!(site = %self.site.id, "initialization finished");
            return self.post_init(cx);
        }

        self.state = UpdateState::InitFailed;
        self.carried_hold_for = run.hold_for;
        let backoff = run
            .hold_for
            .map(Duration::from_secs)
            .unwrap_or(RESTART_INTERVAL);
        error!(
            site = %self.site.id,
            %outcome,
            exc_info = ?run.error,
            retry_in = backoff.as_secs(),
            "initialization failed"
        );
        self.arm_retry(cx, backoff);
        Ok(())
    }

    fn arm_retry(&mut self, cx: &mut UpdaterCx<'_>, delay: Duration) {
        if self.stopping {
            return;
        }
        if let Some(old) = self.retry_timer.take() {
            cx.reactor.cancel_timer(old);
        }
        let kind = TimerKind::RetryInit(self.site.id.clone());
        self.retry_timer = Some(cx.reactor.arm_timer(delay, kind));
    }

    /// Register the update job and start the maintainer.
    fn post_init(&mut self, cx: &mut UpdaterCx<'_>) -> Result<(), UpdaterError> {
        if self.stopping {
            return Ok(());
        }
        let scheduled = self.register_job(cx);
        self.ensure_maintainer(cx);
        scheduled
    }

    fn register_job(&mut self, cx: &mut UpdaterCx<'_>) -> Result<(), UpdaterError> {
        if self.site.updater.is_none() || cx.scheduler.contains(&self.site.id) {
            return Ok(());
        }
        let now = cx.reactor.now();
        let added = match self.site.sched_type {
            ScheduleKind::Interval => {
                cx.scheduler
                    .add_interval_job(&self.site.id, &self.site.sched_expr, now)
            }
            ScheduleKind::Cron => cx
                .scheduler
                .add_cron_job(&self.site.id, &self.site.sched_expr, now),
        };
        match added {
            Ok(()) => {
                debug!(
                    site = %self.site.id,
                    next = ?cx.scheduler.next_fire(&self.site.id),
                    "update job registered"
                );
                Ok(())
            }
            Err(source) => Err(UpdaterError::Schedule {
                site: self.site.id.clone(),
                source,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Scheduler entry point. `scheduled` is the deadline the job fired on.
    pub fn fire_update(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        scheduled: NaiveDateTime,
    ) -> Result<(), UpdaterError> {
        let when = format_datetime(scheduled);
        match self.state {
            UpdateState::Updating => {
                info!(site = %self.site.id, scheduled = %when, "update ignored, last update not finished");
                Ok(())
            }
            UpdateState::Init | UpdateState::Initializing | UpdateState::InitFailed => {
                warn!(site = %self.site.id, scheduled = %when, "update ignored, site not initialized");
                Ok(())
            }
            UpdateState::Disabled => {
                warn!(site = %self.site.id, scheduled = %when, "update ignored, site disabled");
                Ok(())
            }
            UpdateState::Idle | UpdateState::UpdateFailed => {
                if let Some(run) = &self.process {
                    if self.deferred_update.is_some() {
                        info!(site = %self.site.id, scheduled = %when, "update ignored, one is already waiting for the maintainer");
                        return Ok(());
                    }
                    info!(site = %self.site.id, pid = run.pid, scheduled = %when, "stopping maintainer for update");
                    self.deferred_update = Some(scheduled);
                    cx.reactor.terminate(run.pid);
                    return Ok(());
                }
                self.start_update(cx, scheduled)
            }
        }
    }

    fn start_update(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        scheduled: NaiveDateTime,
    ) -> Result<(), UpdaterError> {
        if let Some(timer) = self.maintainer_timer.take() {
            cx.reactor.cancel_timer(timer);
        }
        let Some(program) = self.site.updater.clone() else {
            return Ok(());
        };

        match self.spawn(cx, RunMode::Update, program, Some(scheduled)) {
            Ok(pid) => {
                self.state = UpdateState::Updating;
                self.process = Some(RunningProcess::new(pid, RunMode::Update, Some(scheduled)));
                info!(site = %self.site.id, pid, scheduled = %format_datetime(scheduled), "update started");
                Ok(())
            }
            Err(source) => {
                self.state = UpdateState::UpdateFailed;
                let backoff = self.spawn_backoff();
                self.hold_job(cx, backoff);
                Err(UpdaterError::Spawn {
                    site: self.site.id.clone(),
                    mode: RunMode::Update,
                    source,
                })
            }
        }
    }

    fn finish_update(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        run: RunningProcess,
        outcome: ExitOutcome,
    ) -> Result<(), UpdaterError> {
        if outcome.success() {
            let Some(scheduled) = run.scheduled else {
                self.state = UpdateState::UpdateFailed;
                return Ok(());
            };
            if let Err(source) = self.files.write_last_update(scheduled) {
                self.state = UpdateState::UpdateFailed;
                return Err(UpdaterError::Persistence {
                    site: self.site.id.clone(),
                    source,
                });
            }
            self.last_update = Some(scheduled);
            self.state = UpdateState::Idle;
            self.carried_hold_for = None;
            info!(site = %self.site.id, scheduled = %format_datetime(scheduled), "update finished");
            self.ensure_maintainer(cx);
            return Ok(());
        }

        self.state = UpdateState::UpdateFailed;
        self.carried_hold_for = run.hold_for;
        error!(
            site = %self.site.id,
            %outcome,
            exc_info = ?run.error,
            hold_for = ?run.hold_for,
            "update failed"
        );
        if let Some(seconds) = run.hold_for {
            self.hold_job(cx, Duration::from_secs(seconds));
        }
        Ok(())
    }

    /// Keep the update job from firing for `delay`.
    fn hold_job(&mut self, cx: &mut UpdaterCx<'_>, delay: Duration) {
        let now = cx.reactor.now();
        let Some(until) = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
        else {
            return;
        };
        if let Err(e) = cx.scheduler.pause_job(&self.site.id, until) {
            debug!(site = %self.site.id, error = %e, "no job to pause");
        }
    }

    fn spawn_backoff(&self) -> Duration {
        self.carried_hold_for
            .map(Duration::from_secs)
            .unwrap_or(RESTART_INTERVAL)
    }

    // -----------------------------------------------------------------------
    // Maintainer
    // -----------------------------------------------------------------------

    fn ensure_maintainer(&mut self, cx: &mut UpdaterCx<'_>) {
        if self.stopping
            || self.state != UpdateState::Idle
            || self.process.is_some()
            || self.maintainer_timer.is_some()
        {
            return;
        }
        let Some(program) = self.site.maintainer.clone() else {
            return;
        };

        match self.spawn(cx, RunMode::Maintain, program, None) {
            Ok(pid) => {
                self.process = Some(RunningProcess::new(pid, RunMode::Maintain, None));
                info!(site = %self.site.id, pid, "maintainer started");
            }
            Err(e) => {
                error!(
                    site = %self.site.id,
                    error = %e,
                    retry_in = RESTART_INTERVAL.as_secs(),
                    "maintainer failed to start"
                );
                self.arm_maintainer_restart(cx);
            }
        }
    }

    fn finish_maintain(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        run: RunningProcess,
        outcome: ExitOutcome,
    ) -> Result<(), UpdaterError> {
        if let Some(scheduled) = self.deferred_update.take()
            && !self.stopping
        {
            info!(site = %self.site.id, %outcome, "maintainer stopped, starting deferred update");
            return self.start_update(cx, scheduled);
        }
        if self.stopping {
            info!(site = %self.site.id, %outcome, "maintainer stopped");
            return Ok(());
        }
        warn!(
            site = %self.site.id,
            %outcome,
            exc_info = ?run.error,
            restart_in = RESTART_INTERVAL.as_secs(),
            "maintainer exited"
        );
        self.arm_maintainer_restart(cx);
        Ok(())
    }

    fn arm_maintainer_restart(&mut self, cx: &mut UpdaterCx<'_>) {
        if self.stopping || self.maintainer_timer.is_some() {
            return;
        }
        let kind = TimerKind::RestartMaintainer(self.site.id.clone());
        self.maintainer_timer = Some(cx.reactor.arm_timer(RESTART_INTERVAL, kind));
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn on_exit(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        pid: u32,
        outcome: ExitOutcome,
    ) -> Result<(), UpdaterError> {
        if self.pid() != Some(pid) {
            debug!(site = %self.site.id, pid, "ignoring exit of a process no longer tracked");
            return Ok(());
        }
        let Some(run) = self.process.take() else {
            return Ok(());
        };
        match run.mode {
            RunMode::Init => self.finish_init(cx, run, outcome),
            RunMode::Update => self.finish_update(cx, run, outcome),
            RunMode::Maintain => self.finish_maintain(cx, run, outcome),
        }
    }

    /// The current process was waited on; its exit follows once the log has
    /// drained. Nothing may signal the pid after this.
    pub fn on_reaped(&mut self, pid: u32) {
        match self.process.as_mut() {
            Some(run) if run.pid == pid => {
                debug!(site = %self.site.id, pid, "plugin reaped");
                run.reaped = true;
            }
            _ => debug!(site = %self.site.id, pid, "ignoring reap of a process no longer tracked"),
        }
    }

    pub fn on_timer(
        &mut self,
        cx: &mut UpdaterCx<'_>,
        id: TimerId,
        kind: &TimerKind,
    ) -> Result<(), UpdaterError> {
        match kind {
            TimerKind::RetryInit(_) if self.retry_timer == Some(id) => {
                self.retry_timer = None;
                if self.state == UpdateState::InitFailed && !self.stopping {
                    info!(site = %self.site.id, "retrying initialization");
                    return self.start_init(cx);
                }
                Ok(())
            }
            TimerKind::RestartMaintainer(_) if self.maintainer_timer == Some(id) => {
                self.maintainer_timer = None;
                self.ensure_maintainer(cx);
                Ok(())
            }
            _ => {
                debug!(site = %self.site.id, id, ?kind, "ignoring stale timer");
                Ok(())
            }
        }
    }

    /// Apply a report from the process with `pid`. Rejections leave every
    /// field untouched.
    pub fn on_control(&mut self, pid: u32, message: ControlMessage) -> Result<(), ProtocolViolation> {
        let site = self.site.id.clone();
        let Some(run) = self.process.as_mut() else {
            return Err(ProtocolViolation::StalePid(pid));
        };
        if run.pid != pid {
            return Err(ProtocolViolation::StalePid(pid));
        }

        let kind = message.kind();
        let accepted = match (&message, run.mode) {
            (ControlMessage::Progress(_), RunMode::Init | RunMode::Update) => true,
            (ControlMessage::Error { .. }, _) => true,
            (ControlMessage::ErrorAndHoldFor { .. }, RunMode::Init | RunMode::Update) => true,
            _ => false,
        };
        if !accepted {
            return Err(ProtocolViolation::OutOfPhase {
                kind,
                mode: run.mode,
            });
        }

        match message {
            ControlMessage::Progress(reported) => {
                if reported < run.progress {
                    return Err(ProtocolViolation::RegressiveProgress {
                        current: run.progress,
                        reported,
                    });
                }
                if reported > run.progress {
                    run.progress = reported;
                    info!(site = %site, mode = %run.mode, progress = reported, "progress");
                }
            }
            ControlMessage::Error { exc_info } => {
                if run.error.is_some() {
                    return Err(ProtocolViolation::DuplicateError);
                }
                run.error = Some(exc_info);
            }
            ControlMessage::ErrorAndHoldFor { seconds, exc_info } => {
                if run.error.is_some() {
                    return Err(ProtocolViolation::DuplicateError);
                }
                run.error = Some(exc_info);
                run.hold_for = Some(seconds);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop starting new work, cancel timers and ask the live process to
    /// exit. Returns whether a process is still running.
    pub fn stop(&mut self, cx: &mut UpdaterCx<'_>) -> bool {
        self.stopping = true;
        self.deferred_update = None;
        for timer in [self.retry_timer.take(), self.maintainer_timer.take()]
            .into_iter()
            .flatten()
        {
            cx.reactor.cancel_timer(timer);
        }
        match &self.process {
            Some(run) if run.reaped => {
                debug!(site = %self.site.id, pid = run.pid, "already exited, waiting for log");
                true
            }
            Some(run) => {
                info!(site = %self.site.id, pid = run.pid, mode = %run.mode, "stopping");
                cx.reactor.terminate(run.pid);
                true
            }
            None => false,
        }
    }

    pub fn force_kill(&mut self, cx: &mut UpdaterCx<'_>) {
        if let Some(run) = self.process.as_ref().filter(|run| !run.reaped) {
            warn!(site = %self.site.id, pid = run.pid, "did not stop in time, killing");
            cx.reactor.force_kill(run.pid);
        }
    }

    // -----------------------------------------------------------------------

    fn spawn(
        &self,
        cx: &mut UpdaterCx<'_>,
        mode: RunMode,
        program: std::path::PathBuf,
        scheduled: Option<NaiveDateTime>,
    ) -> Result<u32, ProcessError> {
        let args = PluginArgs::new(&self.site, mode, cx.env, scheduled);
        let request = SpawnRequest::new(&self.site, mode, program, args, cx.env);
        cx.reactor.spawn(request)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogLimits;
    use crate::paths::Paths;
    use crate::reactor::FakeReactor;
    use crate::state_files::{INITIALIZED_FILE, LAST_UPDATE_FILE};
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn site(master: &Path, init: bool, maint: bool) -> Arc<MirrorSite> {
        Arc::new(MirrorSite {
            id: "debian".to_string(),
            master_dir: master.to_path_buf(),
            initializer: init.then(|| PathBuf::from("/opt/debian-init")),
            updater: Some(PathBuf::from("/opt/debian-update")),
            maintainer: maint.then(|| PathBuf::from("/opt/debian-maint")),
            sched_type: ScheduleKind::Interval,
            sched_expr: "1h".to_string(),
            config: json!({}),
            storage: BTreeMap::new(),
        })
    }

    struct Harness {
        reactor: FakeReactor,
        scheduler: JobScheduler,
        env: RunEnv,
        updater: SiteUpdater,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(init: bool, maint: bool) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self::in_dir(dir, init, maint)
        }

        fn in_dir(dir: tempfile::TempDir, init: bool, maint: bool) -> Self {
            let updater = SiteUpdater::new(site(dir.path(), init, maint));
            Self {
                reactor: FakeReactor::new(t0()),
                scheduler: JobScheduler::new(),
                env: RunEnv {
                    country: "CN".to_string(),
                    location: String::new(),
                    paths: Paths::with_base(dir.path().join("run")),
                    log_limits: LogLimits::default(),
                },
                updater,
                dir,
            }
        }

        fn master(&self) -> &Path {
            self.dir.path()
        }

        fn with<T>(&mut self, f: impl FnOnce(&mut SiteUpdater, &mut UpdaterCx<'_>) -> T) -> T {
            let mut cx = UpdaterCx {
                reactor: &mut self.reactor,
                scheduler: &mut self.scheduler,
                env: &self.env,
            };
            f(&mut self.updater, &mut cx)
        }

        fn start(&mut self) -> Result<(), UpdaterError> {
            self.with(|u, cx| u.start(cx))
        }

        fn exit(&mut self, code: i32) -> Result<(), UpdaterError> {
            let pid = self.updater.pid().unwrap();
            self.with(|u, cx| u.on_exit(cx, pid, ExitOutcome::Code(code)))
        }

        fn fire(&mut self, at: NaiveDateTime) -> Result<(), UpdaterError> {
            self.with(|u, cx| u.fire_update(cx, at))
        }

        fn control(&mut self, message: ControlMessage) -> Result<(), ProtocolViolation> {
            let pid = self.updater.pid().unwrap();
            self.updater.on_control(pid, message)
        }

        /// Fire whatever timer is due next at or before `until`.
        fn run_timer(&mut self, until: NaiveDateTime) -> bool {
            let Some((id, kind)) = self.reactor.pop_due(until) else {
                return false;
            };
            self.with(|u, cx| u.on_timer(cx, id, &kind)).unwrap();
            true
        }

        fn last_mode(&self) -> RunMode {
            self.reactor.spawned.last().unwrap().1.mode
        }
    }

    fn hours(h: i64) -> NaiveDateTime {
        t0() + TimeDelta::hours(h)
    }

    #[test]
    fn test_initial_state_without_initializer_is_idle() {
        let mut h = Harness::new(false, false);
        assert_eq!(h.updater.state(), UpdateState::Idle);
        h.start().unwrap();
        assert!(h.reactor.spawned.is_empty());
        assert_eq!(h.scheduler.next_fire("debian"), Some(hours(1)));
    }

    #[test]
    fn test_initial_state_with_marker_is_idle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INITIALIZED_FILE), "").unwrap();
        std::fs::write(dir.path().join(LAST_UPDATE_FILE), "2024-01-09 23:00").unwrap();
        let h = Harness::in_dir(dir, true, false);
        assert_eq!(h.updater.state(), UpdateState::Idle);
        assert_eq!(
            h.updater.status().last_update_time,
            Some(t0() - TimeDelta::hours(9))
        );
    }

    #[test]
    fn test_init_success_persists_marker_and_schedules() {
        let mut h = Harness::new(true, false);
        assert_eq!(h.updater.state(), UpdateState::Init);
        assert!(!h.updater.status().initialized);

        h.start().unwrap();
        assert_eq!(h.updater.state(), UpdateState::Initializing);
        assert_eq!(h.last_mode(), RunMode::Init);
        assert!(!h.scheduler.contains("debian"));

        h.control(ControlMessage::Progress(30)).unwrap();
        assert_eq!(h.updater.status().update_progress, Some(30));

        h.exit(0).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Idle);
        assert!(h.master().join(INITIALIZED_FILE).exists());
        assert!(h.scheduler.contains("debian"));
        assert_eq!(h.updater.status().update_progress, None);
        assert!(h.updater.status().initialized);
    }

    #[test]
    fn test_init_failure_retries_after_default_backoff() {
        let mut h = Harness::new(true, false);
        h.start().unwrap();
        h.exit(1).unwrap();
        assert_eq!(h.updater.state(), UpdateState::InitFailed);
        let retry = TimerKind::RetryInit("debian".to_string());
        assert_eq!(h.reactor.armed(&retry), Some(t0() + TimeDelta::seconds(60)));

        assert!(h.run_timer(hours(1)));
        assert_eq!(h.updater.state(), UpdateState::Initializing);
        assert_eq!(h.reactor.spawned.len(), 2);
    }

    #[test]
    fn test_init_failure_uses_hold_for() {
        let mut h = Harness::new(true, false);
        h.start().unwrap();
        h.control(ControlMessage::ErrorAndHoldFor {
            seconds: 600,
            exc_info: json!("upstream down"),
        })
        .unwrap();
        h.exit(2).unwrap();
        let retry = TimerKind::RetryInit("debian".to_string());
        assert_eq!(h.reactor.armed(&retry), Some(t0() + TimeDelta::seconds(600)));
    }

    #[test]
    fn test_init_spawn_failure_goes_straight_to_failed() {
        let mut h = Harness::new(true, false);
        h.reactor.fail_spawns = true;
        let err = h.start().unwrap_err();
        assert!(matches!(err, UpdaterError::Spawn { mode: RunMode::Init, .. }));
        assert_eq!(h.updater.state(), UpdateState::InitFailed);
        assert!(h.updater.pid().is_none());
        let retry = TimerKind::RetryInit("debian".to_string());
        assert_eq!(h.reactor.armed(&retry), Some(t0() + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_spawn_failure_backoff_carries_previous_hold_for() {
        let mut h = Harness::new(true, false);
        h.start().unwrap();
        h.control(ControlMessage::ErrorAndHoldFor {
            seconds: 300,
            exc_info: json!(null),
        })
        .unwrap();
        h.exit(1).unwrap();

        h.reactor.fail_spawns = true;
        assert!(h.run_timer(hours(1)));
        assert_eq!(h.updater.state(), UpdateState::InitFailed);
        let retry = TimerKind::RetryInit("debian".to_string());
        // armed at t0+300s with another 300s
        assert_eq!(h.reactor.armed(&retry), Some(t0() + TimeDelta::seconds(600)));
    }

    #[test]
    fn test_update_success_persists_scheduled_time() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.reactor.now = hours(1) + TimeDelta::seconds(3);
        h.fire(hours(1)).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Updating);
        let (_, request) = h.reactor.spawned.last().unwrap();
        assert_eq!(request.args.sched_datetime, Some(hours(1)));

        h.control(ControlMessage::Progress(50)).unwrap();
        h.reactor.now = hours(1) + TimeDelta::minutes(42);
        h.exit(0).unwrap();

        assert_eq!(h.updater.state(), UpdateState::Idle);
        let written = std::fs::read_to_string(h.master().join(LAST_UPDATE_FILE)).unwrap();
        assert_eq!(written, "2024-01-10 09:00");
        assert_eq!(h.updater.status().last_update_time, Some(hours(1)));
    }

    #[test]
    fn test_update_while_updating_is_ignored() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        h.fire(hours(2)).unwrap();
        assert_eq!(h.reactor.spawned.len(), 1);
        assert_eq!(h.updater.state(), UpdateState::Updating);
    }

    #[test]
    fn test_update_failure_without_hold_for_waits_for_next_fire() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        let job_next = h.scheduler.next_fire("debian");
        h.fire(hours(1)).unwrap();
        h.exit(1).unwrap();
        assert_eq!(h.updater.state(), UpdateState::UpdateFailed);
        assert_eq!(h.scheduler.next_fire("debian"), job_next);

        // UpdateFailed accepts the next trigger
        h.fire(hours(2)).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Updating);
    }

    #[test]
    fn test_update_failure_with_hold_for_pauses_job() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.reactor.now = hours(1);
        h.fire(hours(1)).unwrap();
        h.control(ControlMessage::ErrorAndHoldFor {
            seconds: 3 * 3600,
            exc_info: json!("quota"),
        })
        .unwrap();
        h.exit(1).unwrap();
        assert_eq!(h.updater.state(), UpdateState::UpdateFailed);
        // job itself still sits at t0+1h (not yet advanced by the scheduler);
        // the pause lifts it to the first grid point at or after t0+4h
        assert_eq!(h.scheduler.next_fire("debian"), Some(hours(4)));
    }

    #[test]
    fn test_update_spawn_failure() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.reactor.fail_spawns = true;
        let err = h.fire(hours(1)).unwrap_err();
        assert!(matches!(err, UpdaterError::Spawn { mode: RunMode::Update, .. }));
        assert_eq!(h.updater.state(), UpdateState::UpdateFailed);
        assert!(h.updater.pid().is_none());
    }

    #[test]
    fn test_update_persistence_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = Harness::in_dir(dir, false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        // a directory where the timestamp file should go
        std::fs::create_dir_all(h.master().join(LAST_UPDATE_FILE)).unwrap();
        let err = h.exit(0).unwrap_err();
        assert!(matches!(err, UpdaterError::Persistence { .. }));
        assert_eq!(h.updater.state(), UpdateState::UpdateFailed);
        assert_eq!(h.updater.status().last_update_time, None);
    }

    #[test]
    fn test_progress_monotonic() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        h.control(ControlMessage::Progress(40)).unwrap();
        h.control(ControlMessage::Progress(40)).unwrap();
        assert_eq!(
            h.control(ControlMessage::Progress(39)).unwrap_err(),
            ProtocolViolation::RegressiveProgress {
                current: 40,
                reported: 39
            }
        );
        assert_eq!(h.updater.status().update_progress, Some(40));
        h.control(ControlMessage::Progress(100)).unwrap();
        assert_eq!(h.updater.status().update_progress, Some(100));
    }

    #[test]
    fn test_second_error_record_rejected() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        h.control(ControlMessage::Error { exc_info: json!(1) }).unwrap();
        assert_eq!(
            h.control(ControlMessage::ErrorAndHoldFor {
                seconds: 5,
                exc_info: json!(2)
            })
            .unwrap_err(),
            ProtocolViolation::DuplicateError
        );
        // the rejected hold-for must not leak into the failure path
        h.exit(1).unwrap();
        assert_eq!(h.scheduler.next_fire("debian"), Some(hours(1)));
    }

    #[test]
    fn test_stale_pid_rejected() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        assert_eq!(
            h.updater.on_control(4242, ControlMessage::Progress(1)),
            Err(ProtocolViolation::StalePid(4242))
        );
        h.fire(hours(1)).unwrap();
        assert_eq!(
            h.updater.on_control(4242, ControlMessage::Progress(1)),
            Err(ProtocolViolation::StalePid(4242))
        );
    }

    #[test]
    fn test_maintainer_lifecycle() {
        let mut h = Harness::new(false, true);
        h.start().unwrap();
        assert_eq!(h.last_mode(), RunMode::Maintain);
        assert_eq!(h.updater.state(), UpdateState::Idle);

        // maintainer may report errors but not progress or hold-for
        assert!(matches!(
            h.control(ControlMessage::Progress(5)).unwrap_err(),
            ProtocolViolation::OutOfPhase { mode: RunMode::Maintain, .. }
        ));
        assert!(matches!(
            h.control(ControlMessage::ErrorAndHoldFor { seconds: 1, exc_info: json!(0) })
                .unwrap_err(),
            ProtocolViolation::OutOfPhase { .. }
        ));
        h.control(ControlMessage::Error { exc_info: json!("disk") }).unwrap();
        assert_eq!(h.updater.status().update_progress, None);

        // crash: restarted after the fixed backoff
        h.exit(1).unwrap();
        assert!(h.updater.pid().is_none());
        let restart = TimerKind::RestartMaintainer("debian".to_string());
        assert_eq!(h.reactor.armed(&restart), Some(t0() + TimeDelta::seconds(60)));
        assert!(h.run_timer(t0() + TimeDelta::minutes(2)));
        assert_eq!(h.reactor.spawned.len(), 2);
        assert_eq!(h.last_mode(), RunMode::Maintain);
    }

    #[test]
    fn test_update_defers_until_maintainer_exits() {
        let mut h = Harness::new(false, true);
        h.start().unwrap();
        let maint_pid = h.updater.pid().unwrap();

        h.fire(hours(1)).unwrap();
        assert_eq!(h.reactor.terminated, vec![maint_pid]);
        assert_eq!(h.updater.state(), UpdateState::Idle);
        assert_eq!(h.reactor.spawned.len(), 1);

        // a second fire while waiting is dropped
        h.fire(hours(2)).unwrap();
        assert_eq!(h.reactor.terminated.len(), 1);

        h.with(|u, cx| u.on_exit(cx, maint_pid, ExitOutcome::Signal(15)))
            .unwrap();
        assert_eq!(h.updater.state(), UpdateState::Updating);
        assert_eq!(h.last_mode(), RunMode::Update);
        let (_, request) = h.reactor.spawned.last().unwrap();
        assert_eq!(request.args.sched_datetime, Some(hours(1)));

        // the maintainer comes back once the update is done
        h.exit(0).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Idle);
        assert_eq!(h.last_mode(), RunMode::Maintain);
        assert_eq!(h.reactor.spawned.len(), 3);
    }

    #[test]
    fn test_stale_exit_ignored() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        h.with(|u, cx| u.on_exit(cx, 1, ExitOutcome::Code(0))).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Updating);
    }

    #[test]
    fn test_stop_terminates_and_suppresses_followups() {
        let mut h = Harness::new(true, true);
        h.start().unwrap();
        let pid = h.updater.pid().unwrap();
        assert!(h.with(|u, cx| u.stop(cx)));
        assert_eq!(h.reactor.terminated, vec![pid]);

        h.exit(1).unwrap();
        assert_eq!(h.updater.state(), UpdateState::InitFailed);
        assert!(h.reactor.timers.is_empty());
        assert!(!h.with(|u, cx| u.stop(cx)));
    }

    #[test]
    fn test_reaped_process_is_never_signalled() {
        let mut h = Harness::new(false, false);
        h.start().unwrap();
        h.fire(hours(1)).unwrap();
        let pid = h.updater.pid().unwrap();

        h.updater.on_reaped(pid + 1);
        assert_eq!(h.updater.live_pid(), Some(pid));

        h.updater.on_reaped(pid);
        assert_eq!(h.updater.live_pid(), None);
        assert_eq!(h.updater.pid(), Some(pid));

        // still waiting on the exit, but the pid may already belong to someone else
        assert!(h.with(|u, cx| u.stop(cx)));
        h.with(|u, cx| u.force_kill(cx));
        assert!(h.reactor.terminated.is_empty());
        assert!(h.reactor.killed.is_empty());

        // reports sent before the exit still land
        h.control(ControlMessage::Progress(40)).unwrap();
        h.exit(0).unwrap();
        assert_eq!(h.updater.state(), UpdateState::Idle);
    }

    #[test]
    fn test_status_serializes() {
        let status = SiteStatus {
            id: "debian".to_string(),
            initialized: true,
            update_status: UpdateState::Updating,
            last_update_time: Some(hours(1)),
            update_progress: Some(12),
            error: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["update_status"], "updating");
        assert_eq!(value["last_update_time"], "2024-01-10 09:00");
        assert_eq!(value["update_progress"], 12);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_unreadable_last_update_disables_site() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LAST_UPDATE_FILE), "yesterday").unwrap();
        let mut h = Harness::in_dir(dir, false, true);
        h.start().unwrap();

        let status = h.updater.status();
        assert_eq!(status.update_status, UpdateState::Disabled);
        assert!(status.initialized);
        assert_eq!(status.last_update_time, None);
        assert!(status.error.unwrap().contains("yesterday"), "reason names the bad value");
        assert!(h.reactor.spawned.is_empty());
        assert_eq!(h.scheduler.len(), 0);

        h.fire(hours(1)).unwrap();
        assert!(h.reactor.spawned.is_empty());
        assert!(!h.with(|u, cx| u.stop(cx)));
    }
}
