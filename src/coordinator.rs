use crate::control::{ControlChannel, ControlMessage};
use crate::process::{ExitOutcome, RunEnv};
use crate::reactor::{Event, Reactor, TimerId, TimerKind};
use crate::scheduler::{JobScheduler, ScheduleError};
use crate::site::MirrorSite;
use crate::updater::{ProtocolViolation, SiteStatus, SiteUpdater, UpdaterCx};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown mirror site: {0}")]
    UnknownSite(String),
    #[error("daemon is not running")]
    Closed,
}

/// Read-only requests answered on the loop.
#[derive(Debug)]
pub enum Query {
    /// All sites, or just `id`.
    Status {
        id: Option<String>,
        reply: oneshot::Sender<Result<Vec<SiteStatus>, QueryError>>,
    },
}

/// Owns every site's state machine plus the shared scheduler and control
/// channel. All mutation happens through [`UpdateCoordinator::handle_event`]
/// on the loop.
pub struct UpdateCoordinator<R: Reactor> {
    reactor: R,
    scheduler: JobScheduler,
    env: RunEnv,
    updaters: Vec<SiteUpdater>,
    index: HashMap<String, usize>,
    /// Timer backing the scheduler's current deadline.
    deadline: Option<(TimerId, NaiveDateTime)>,
    channel: Option<ControlChannel>,
    shutting_down: bool,
}

impl<R: Reactor> UpdateCoordinator<R> {
    pub fn new(reactor: R, env: RunEnv, sites: Vec<MirrorSite>) -> Self {
        let mut updaters = Vec::with_capacity(sites.len());
        let mut index = HashMap::new();
        for site in sites {
            index.insert(site.id.clone(), updaters.len());
            updaters.push(SiteUpdater::new(Arc::new(site)));
        }
        Self {
            reactor,
            scheduler: JobScheduler::new(),
            env,
            updaters,
            index,
            deadline: None,
            channel: None,
            shutting_down: false,
        }
    }

    pub fn attach_channel(&mut self, channel: ControlChannel) {
        self.channel = Some(channel);
    }

    /// Kick off initialization runs and register update jobs, in site order.
    pub fn start(&mut self) {
        for idx in 0..self.updaters.len() {
            let result = self.with_updater(idx, |u, cx| u.start(cx));
            if let Err(e) = result {
                error!(error = %e, "site startup failed");
            }
        }
        self.sync_deadline();
        info!(
            sites = self.updaters.len(),
            jobs = self.scheduler.len(),
            "coordinator started"
        );
    }

    pub fn handle_event(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::ChildReaped { site, pid } => {
                if let Some(&idx) = self.index.get(&site) {
                    self.updaters[idx].on_reaped(pid);
                }
            }
            Event::ChildExited { site, pid, outcome } => self.on_child_exit(&site, pid, outcome),
            Event::PeerConnected { pid, reply } => {
                let site = self.site_for_pid(pid).map(str::to_string);
                if site.is_none() {
                    warn!(error = %ProtocolViolation::UnknownPeer(pid), "rejected control peer");
                }
                let _ = reply.send(site);
            }
            Event::Control { pid, message } => self.on_control(pid, message),
            Event::Timer { id, kind } => self.on_timer(id, kind),
            Event::Query(Query::Status { id, reply }) => {
                let _ = reply.send(self.statuses(id.as_deref()));
            }
            Event::Shutdown => return ControlFlow::Break(()),
        }
        self.sync_deadline();
        ControlFlow::Continue(())
    }

    // -----------------------------------------------------------------------
    // Status query interface
    // -----------------------------------------------------------------------

    pub fn is_mirror_site_initialized(&self, id: &str) -> Result<bool, QueryError> {
        Ok(self.updater(id)?.state().is_initialized())
    }

    pub fn mirror_site_update_state(&self, id: &str) -> Result<SiteStatus, QueryError> {
        Ok(self.updater(id)?.status())
    }

    pub fn statuses(&self, id: Option<&str>) -> Result<Vec<SiteStatus>, QueryError> {
        match id {
            Some(id) => Ok(vec![self.mirror_site_update_state(id)?]),
            None => Ok(self.updaters.iter().map(SiteUpdater::status).collect()),
        }
    }

    pub fn next_deadline(&self) -> Option<NaiveDateTime> {
        self.scheduler.next_deadline()
    }

    /// Stop scheduling updates for one site.
    pub fn remove_site_job(&mut self, id: &str) -> Result<(), ScheduleError> {
        self.scheduler.remove_job(id)?;
        self.sync_deadline();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Ask every live plugin to stop and stop starting new ones. Returns the
    /// number of processes still running.
    pub fn begin_shutdown(&mut self) -> usize {
        self.shutting_down = true;
        let mut live = 0;
        for idx in 0..self.updaters.len() {
            if self.with_updater(idx, |u, cx| u.stop(cx)) {
                live += 1;
            }
        }
        live
    }

    pub fn live_processes(&self) -> usize {
        self.updaters.iter().filter(|u| u.pid().is_some()).count()
    }

    pub fn force_kill_all(&mut self) {
        for idx in 0..self.updaters.len() {
            self.with_updater(idx, |u, cx| u.force_kill(cx));
        }
    }

    /// Drop all jobs and timers and close the control socket.
    pub fn dispose(&mut self) {
        self.scheduler.dispose();
        if let Some((timer, _)) = self.deadline.take() {
            self.reactor.cancel_timer(timer);
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn on_child_exit(&mut self, site: &str, pid: u32, outcome: ExitOutcome) {
        let Some(&idx) = self.index.get(site) else {
            warn!(site, pid, "exit reported for unknown site");
            return;
        };
        if let Err(e) = self.with_updater(idx, |u, cx| u.on_exit(cx, pid, outcome)) {
            error!(error = %e, "run completion failed");
        }
    }

    fn on_control(&mut self, pid: u32, message: ControlMessage) {
        let Some(idx) = self.updaters.iter().position(|u| u.pid() == Some(pid)) else {
            warn!(kind = message.kind(), error = %ProtocolViolation::UnknownPeer(pid), "rejected control message");
            return;
        };
        let updater = &mut self.updaters[idx];
        let kind = message.kind();
        if let Err(e) = updater.on_control(pid, message) {
            warn!(site = %updater.id(), pid, kind, error = %e, "rejected control message");
        }
    }

    fn on_timer(&mut self, id: TimerId, kind: TimerKind) {
        match &kind {
            TimerKind::Deadline => {
                if self.deadline.map(|(t, _)| t) != Some(id) {
                    debug!(id, "ignoring stale deadline timer");
                    return;
                }
                self.deadline = None;
                self.dispatch_due();
            }
            TimerKind::RetryInit(site) | TimerKind::RestartMaintainer(site) => {
                let Some(&idx) = self.index.get(site) else {
                    return;
                };
                if let Err(e) = self.with_updater(idx, |u, cx| u.on_timer(cx, id, &kind)) {
                    error!(error = %e, "timer handling failed");
                }
            }
        }
    }

    fn dispatch_due(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = self.reactor.now();
        for firing in self.scheduler.take_due(now) {
            let Some(&idx) = self.index.get(&firing.job_id) else {
                continue;
            };
            if let Err(e) = self.with_updater(idx, |u, cx| u.fire_update(cx, firing.scheduled)) {
                error!(error = %e, "scheduled update failed");
            }
        }
    }

    /// Keep exactly one timer armed for the scheduler's deadline.
    fn sync_deadline(&mut self) {
        let wanted = if self.shutting_down {
            None
        } else {
            self.scheduler.next_deadline()
        };
        if self.deadline.map(|(_, at)| at) == wanted {
            return;
        }
        if let Some((timer, _)) = self.deadline.take() {
            self.reactor.cancel_timer(timer);
        }
        if let Some(at) = wanted {
            let delay = (at - self.reactor.now()).to_std().unwrap_or_default();
            let timer = self.reactor.arm_timer(delay, TimerKind::Deadline);
            self.deadline = Some((timer, at));
        }
    }

    fn site_for_pid(&self, pid: u32) -> Option<&str> {
        self.updaters
            .iter()
            .find(|u| u.live_pid() == Some(pid))
            .map(SiteUpdater::id)
    }

    fn updater(&self, id: &str) -> Result<&SiteUpdater, QueryError> {
        self.index
            .get(id)
            .map(|&idx| &self.updaters[idx])
            .ok_or_else(|| QueryError::UnknownSite(id.to_string()))
    }

    fn with_updater<T>(
        &mut self,
        idx: usize,
        f: impl FnOnce(&mut SiteUpdater, &mut UpdaterCx<'_>) -> T,
    ) -> T {
        let mut cx = UpdaterCx {
            reactor: &mut self.reactor,
            scheduler: &mut self.scheduler,
            env: &self.env,
        };
        f(&mut self.updaters[idx], &mut cx)
    }

    #[cfg(test)]
    pub(crate) fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to the status query interface from outside the
/// loop.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl CoordinatorHandle {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }

    pub async fn statuses(&self, id: Option<String>) -> Result<Vec<SiteStatus>, QueryError> {
        let (reply, answer) = oneshot::channel();
        self.events
            .send(Event::Query(Query::Status { id, reply }))
            .map_err(|_| QueryError::Closed)?;
        answer.await.map_err(|_| QueryError::Closed)?
    }

    pub async fn is_mirror_site_initialized(&self, id: &str) -> Result<bool, QueryError> {
        let status = self.mirror_site_update_state(id).await?;
        Ok(status.initialized)
    }

    pub async fn mirror_site_update_state(&self, id: &str) -> Result<SiteStatus, QueryError> {
        self.statuses(Some(id.to_string()))
            .await?
            .pop()
            .ok_or_else(|| QueryError::UnknownSite(id.to_string()))
    }

    pub fn shutdown(&self) -> Result<(), QueryError> {
        self.events
            .send(Event::Shutdown)
            .map_err(|_| QueryError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
