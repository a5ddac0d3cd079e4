//! Ingestion supervisor
//!
//! Owns the table of running jobs, one per base series. Clients subscribe
//! and unsubscribe; whitelisted series are pinned and never reaped. A
//! background reaper stops idle on-demand jobs and restarts dead pinned
//! ones.
//!
//! # Locking
//!
//! The job table sits behind one async mutex. Decisions (capacity, reaping,
//! crash bookkeeping) are made under it; stopping jobs (cancel + await) and
//! any other await happen after it is released. Job tasks report crashes
//! over a channel which is drained under the same lock, so a crash never
//! calls back into the supervisor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::ids::SeriesId;
use uuid::Uuid;

use crate::config::{ConfigError, FeedSettings, IngestSettings};
use crate::guardrail::{GuardrailConfig, GuardrailSnapshot, LoopGuardrail};
use crate::pipeline::IngestPipeline;
use crate::policy::{plan_capacity, plan_reaper, CapacityDecision, JobView, ReaperPlan};
use crate::registry::{IngestContext, IngestLoop, SeriesRouter, SourceError, SourceRegistry};
use crate::runner::{run_job, CrashReceiver, CrashSender, JobRun, RunOutcome};

/// Refcount of a whitelist-pinned job.
pub const PINNED_REFCOUNT: i64 = -1;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("supervisor is closed")]
    Closed,
}

/// Read-only view of one job for debugging endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub series_id: SeriesId,
    pub job_id: Uuid,
    pub source: String,
    pub refcount: i64,
    pub pinned: bool,
    pub alive: bool,
    pub uptime_ms: u64,
    pub idle_for_ms: Option<u64>,
    pub crash_count: u32,
    pub last_crash_ago_ms: Option<u64>,
    pub last_error: Option<String>,
    pub guardrail: GuardrailSnapshot,
}

struct Job {
    series_id: SeriesId,
    job_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<RunOutcome>,
    source: String,
    refcount: i64,
    idle_since: Option<Instant>,
    started_at: Instant,
    crash_count: u32,
    last_crash_at: Option<Instant>,
    last_error: Option<String>,
    guardrail: Arc<LoopGuardrail>,
}

impl Job {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    fn view(&self) -> JobView {
        JobView {
            series_id: self.series_id.clone(),
            refcount: self.refcount,
            idle_since: self.idle_since,
            alive: self.is_alive(),
        }
    }

    /// Cancel and wait for the task to finish.
    async fn stop(self) {
        self.cancel.cancel();
        self.join().await;
    }

    async fn join(self) {
        match self.handle.await {
            Ok(outcome) => debug!(series = %self.series_id, job_id = %self.job_id, ?outcome, "Job stopped"),
            Err(e) => error!(series = %self.series_id, job_id = %self.job_id, error = %e, "Job task failed"),
        }
    }
}

/// State handed from a replaced job to its successor.
struct CarryOver {
    refcount: i64,
    guardrail: Arc<LoopGuardrail>,
    crash_count: u32,
    last_crash_at: Option<Instant>,
    last_error: Option<String>,
}

impl CarryOver {
    fn fresh(refcount: i64, config: &GuardrailConfig) -> Self {
        Self {
            refcount,
            guardrail: Arc::new(LoopGuardrail::new(config.clone())),
            crash_count: 0,
            last_crash_at: None,
            last_error: None,
        }
    }

    fn from_job(job: Job, refcount: i64) -> Self {
        Self {
            refcount,
            guardrail: job.guardrail,
            crash_count: job.crash_count,
            last_crash_at: job.last_crash_at,
            last_error: job.last_error,
        }
    }
}

struct Reaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct State {
    jobs: HashMap<SeriesId, Job>,
    crash_rx: CrashReceiver,
    reaper: Option<Reaper>,
    closed: bool,
}

impl State {
    /// Apply pending crash notices to their jobs.
    fn absorb_crashes(&mut self) {
        while let Ok(notice) = self.crash_rx.try_recv() {
            match self.jobs.get_mut(&notice.series_id) {
                Some(job) if job.job_id == notice.job_id => {
                    job.crash_count += 1;
                    job.last_crash_at = Some(notice.at);
                    job.last_error = Some(notice.error);
                }
                _ => debug!(
                    series = %notice.series_id,
                    job_id = %notice.job_id,
                    "Ignoring crash notice for replaced job"
                ),
            }
        }
    }

    fn views(&self) -> Vec<JobView> {
        self.jobs.values().map(Job::view).collect()
    }
}

struct Inner {
    settings: IngestSettings,
    feed: Arc<FeedSettings>,
    registry: SourceRegistry,
    router: SeriesRouter,
    pipeline: Arc<IngestPipeline>,
    /// Routed whitelist; empty when whitelist ingestion is disabled.
    pinned: HashSet<SeriesId>,
    crash_tx: CrashSender,
    state: Mutex<State>,
}

/// Cheaply cloneable handle to the supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        settings: IngestSettings,
        registry: SourceRegistry,
        pipeline: Arc<IngestPipeline>,
    ) -> Result<Self, SupervisorError> {
        settings.validate()?;
        let router = SeriesRouter::from_settings(&settings.feed);
        let pinned = if settings.enable_whitelist {
            settings.whitelist.iter().map(|s| router.route(s)).collect()
        } else {
            HashSet::new()
        };
        let (crash_tx, crash_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                feed: Arc::new(settings.feed.clone()),
                settings,
                registry,
                router,
                pipeline,
                pinned,
                crash_tx,
                state: Mutex::new(State {
                    jobs: HashMap::new(),
                    crash_rx,
                    reaper: None,
                    closed: false,
                }),
            }),
        })
    }

    pub fn router(&self) -> &SeriesRouter {
        &self.inner.router
    }

    /// Whether the series (after routing) is pinned by the whitelist.
    pub fn is_pinned(&self, series_id: &SeriesId) -> bool {
        self.inner.pinned.contains(&self.inner.router.route(series_id))
    }

    pub async fn job_count(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }

    fn spawn_job(&self, series_id: SeriesId, ingest: Arc<dyn IngestLoop>, carry: CarryOver) -> Job {
        let job_id = Uuid::now_v7();
        let cancel = CancellationToken::new();
        let ctx = IngestContext {
            series_id: series_id.clone(),
            job_id,
            pipeline: self.inner.pipeline.clone(),
            settings: self.inner.feed.clone(),
            derived: self.inner.router.derived_timeframes(&series_id),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(run_job(JobRun {
            series_id: series_id.clone(),
            job_id,
            cancel: cancel.clone(),
            guardrail: Some(carry.guardrail.clone()),
            ingest,
            ctx,
            crash_tx: self.inner.crash_tx.clone(),
        }));
        info!(
            series = %series_id,
            %job_id,
            refcount = carry.refcount,
            crash_count = carry.crash_count,
            "Ingestion job started"
        );

        Job {
            source: series_id.exchange().to_string(),
            series_id,
            job_id,
            cancel,
            handle,
            refcount: carry.refcount,
            idle_since: None,
            started_at: Instant::now(),
            crash_count: carry.crash_count,
            last_crash_at: carry.last_crash_at,
            last_error: carry.last_error,
            guardrail: carry.guardrail,
        }
    }

    /// Register interest in a series.
    ///
    /// `Ok(false)` means the subscription was not accepted (capacity full or
    /// the series' guardrail is cooling down).
    pub async fn subscribe(&self, series_id: &SeriesId) -> Result<bool, SupervisorError> {
        let series_id = self.inner.router.route(series_id);
        if self.is_pinned(&series_id) {
            return Ok(true);
        }
        let ingest = self.inner.registry.resolve(series_id.exchange())?;
        let now = Instant::now();

        let victim = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(SupervisorError::Closed);
            }
            state.absorb_crashes();

            let mut stale = None;
            if let Some(job) = state.jobs.get_mut(&series_id) {
                if job.is_alive() {
                    job.refcount += 1;
                    job.idle_since = None;
                    debug!(series = %series_id, refcount = job.refcount, "Subscribed to running job");
                    return Ok(true);
                }
                let cooldown = job.guardrail.before_attempt_at(now);
                if !cooldown.is_zero() {
                    info!(
                        series = %series_id,
                        cooldown_ms = cooldown.as_millis() as u64,
                        "Subscription refused, job cooling down"
                    );
                    return Ok(false);
                }
                stale = state.jobs.remove(&series_id);
            }

            let views = state.views();
            let victim = match plan_capacity(
                &views,
                self.inner.settings.max_jobs,
                |s| self.inner.pinned.contains(s),
                now,
            ) {
                CapacityDecision::Accept => None,
                CapacityDecision::Evict(victim_id) => {
                    info!(series = %series_id, victim = %victim_id, "Evicting idle job for capacity");
                    state.jobs.remove(&victim_id)
                }
                CapacityDecision::Reject => {
                    warn!(
                        series = %series_id,
                        max_jobs = self.inner.settings.max_jobs,
                        "Subscription refused, at capacity"
                    );
                    if let Some(stale) = stale {
                        state.jobs.insert(series_id, stale);
                    }
                    return Ok(false);
                }
            };

            let carry = match stale {
                Some(stale) => CarryOver::from_job(stale, 1),
                None => CarryOver::fresh(1, &self.inner.settings.guardrail),
            };
            let job = self.spawn_job(series_id.clone(), ingest, carry);
            state.jobs.insert(series_id, job);
            victim
        };

        if let Some(victim) = victim {
            victim.stop().await;
        }
        Ok(true)
    }

    /// Drop interest in a series. Unknown and pinned series are ignored.
    pub async fn unsubscribe(&self, series_id: &SeriesId) {
        let series_id = self.inner.router.route(series_id);
        if self.is_pinned(&series_id) {
            return;
        }
        let mut state = self.inner.state.lock().await;
        state.absorb_crashes();
        let Some(job) = state.jobs.get_mut(&series_id) else {
            return;
        };
        if job.refcount > 0 {
            job.refcount -= 1;
            if job.refcount == 0 {
                job.idle_since = Some(Instant::now());
                debug!(series = %series_id, job_id = %job.job_id, "Job idle");
            }
        }
    }

    /// Start one pinned job per whitelisted series. Returns how many jobs
    /// were started; running on-demand jobs are promoted in place.
    pub async fn start_whitelist(&self) -> Result<usize, SupervisorError> {
        if !self.inner.settings.enable_whitelist {
            return Ok(0);
        }
        let mut targets: Vec<SeriesId> = self.inner.pinned.iter().cloned().collect();
        targets.sort();
        let resolved = targets
            .into_iter()
            .map(|s| {
                let ingest = self.inner.registry.resolve(s.exchange())?;
                Ok((s, ingest))
            })
            .collect::<Result<Vec<_>, SourceError>>()?;

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(SupervisorError::Closed);
        }
        state.absorb_crashes();

        let mut started = 0;
        for (series_id, ingest) in resolved {
            if let Some(job) = state.jobs.get_mut(&series_id) {
                if job.is_alive() {
                    job.refcount = PINNED_REFCOUNT;
                    job.idle_since = None;
                    continue;
                }
            }
            let carry = match state.jobs.remove(&series_id) {
                Some(stale) => CarryOver::from_job(stale, PINNED_REFCOUNT),
                None => CarryOver::fresh(PINNED_REFCOUNT, &self.inner.settings.guardrail),
            };
            let job = self.spawn_job(series_id.clone(), ingest, carry);
            state.jobs.insert(series_id, job);
            started += 1;
        }
        info!(started, pinned = self.inner.pinned.len(), "Whitelist jobs started");
        Ok(started)
    }

    /// Start the background reaper. Calling it again is a no-op.
    pub async fn start_reaper(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed || state.reaper.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reaper_loop(
            Arc::downgrade(&self.inner),
            cancel.clone(),
            self.inner.settings.reaper_tick(),
        ));
        state.reaper = Some(Reaper { cancel, handle });
        debug!(tick_ms = self.inner.settings.reaper_tick_ms, "Reaper started");
    }

    /// One reaper pass: drop idle and dead on-demand jobs, restart dead
    /// pinned ones.
    pub async fn reap_once(&self) -> ReaperPlan {
        let now = Instant::now();
        let (plan, stopped, restarts) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return ReaperPlan::default();
            }
            state.absorb_crashes();
            let plan = plan_reaper(
                &state.views(),
                now,
                self.inner.settings.idle_ttl(),
                |s| self.inner.pinned.contains(s),
            );

            let mut stopped = Vec::new();
            for series_id in &plan.drop {
                if let Some(job) = state.jobs.remove(series_id) {
                    info!(
                        series = %series_id,
                        job_id = %job.job_id,
                        alive = job.is_alive(),
                        "Reaping job"
                    );
                    stopped.push(job);
                }
            }
            for series_id in &plan.stop {
                if let Some(job) = state.jobs.get(series_id) {
                    job.cancel.cancel();
                }
            }
            let restarts: Vec<(SeriesId, Uuid)> = plan
                .restart
                .iter()
                .filter_map(|s| state.jobs.get(s).map(|job| (s.clone(), job.job_id)))
                .collect();
            (plan, stopped, restarts)
        };

        for job in stopped {
            job.stop().await;
        }
        for (series_id, job_id) in restarts {
            self.restart(&series_id, job_id).await;
        }
        plan
    }

    /// Replace a dead job, carrying its refcount and guardrail forward.
    /// Skipped when the entry was replaced, came back alive, or is cooling
    /// down.
    async fn restart(&self, series_id: &SeriesId, expected: Uuid) {
        let ingest = match self.inner.registry.resolve(series_id.exchange()) {
            Ok(ingest) => ingest,
            Err(e) => {
                error!(series = %series_id, error = %e, "Cannot restart job");
                return;
            }
        };

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        let Some(job) = state.jobs.get(series_id) else {
            return;
        };
        if job.job_id != expected || job.is_alive() {
            debug!(series = %series_id, "Restart superseded");
            return;
        }
        let cooldown = job.guardrail.before_attempt_at(Instant::now());
        if !cooldown.is_zero() {
            debug!(
                series = %series_id,
                cooldown_ms = cooldown.as_millis() as u64,
                "Restart deferred, job cooling down"
            );
            return;
        }

        let Some(stale) = state.jobs.remove(series_id) else {
            return;
        };
        let refcount = stale.refcount;
        let job = self.spawn_job(series_id.clone(), ingest, CarryOver::from_job(stale, refcount));
        info!(series = %series_id, previous = %expected, job_id = %job.job_id, "Job restarted");
        state.jobs.insert(series_id.clone(), job);
    }

    /// Stop every job and the reaper. Safe to call more than once.
    pub async fn close(&self) {
        let (jobs, reaper) = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            let jobs: Vec<Job> = state.jobs.drain().map(|(_, job)| job).collect();
            (jobs, state.reaper.take())
        };

        if let Some(reaper) = reaper {
            reaper.cancel.cancel();
            if let Err(e) = reaper.handle.await {
                error!(error = %e, "Reaper task failed");
            }
        }
        for job in &jobs {
            job.cancel.cancel();
        }
        let count = jobs.len();
        for job in jobs {
            job.join().await;
        }
        info!(jobs = count, "Supervisor closed");
    }

    /// Snapshot of every job, ordered by series.
    pub async fn debug_snapshot(&self) -> Vec<JobSnapshot> {
        let now = Instant::now();
        let state = self.inner.state.lock().await;
        let mut out: Vec<JobSnapshot> = state
            .jobs
            .values()
            .map(|job| JobSnapshot {
                series_id: job.series_id.clone(),
                job_id: job.job_id,
                source: job.source.clone(),
                refcount: job.refcount,
                pinned: self.inner.pinned.contains(&job.series_id),
                alive: job.is_alive(),
                uptime_ms: millis(now.saturating_duration_since(job.started_at)),
                idle_for_ms: job.idle_since.map(|t| millis(now.saturating_duration_since(t))),
                crash_count: job.crash_count,
                last_crash_ago_ms: job
                    .last_crash_at
                    .map(|t| millis(now.saturating_duration_since(t))),
                last_error: job.last_error.clone(),
                guardrail: job.guardrail.snapshot_at(now),
            })
            .collect();
        out.sort_by(|a, b| a.series_id.cmp(&b.series_id));
        out
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

async fn reaper_loop(inner: Weak<Inner>, cancel: CancellationToken, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let plan = Supervisor { inner }.reap_once().await;
        if !plan.is_empty() {
            debug!(
                stopped = plan.stop.len(),
                restarted = plan.restart.len(),
                "Reaper tick"
            );
        }
    }
    debug!("Reaper stopped");
}
