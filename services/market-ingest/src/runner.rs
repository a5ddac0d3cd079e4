//! Supervised execution of one ingestion loop run
//!
//! A job task runs its loop exactly once. On failure it reports a
//! [`JobCrashed`] message to the supervisor, waits out the guardrail backoff
//! and exits; restarting is left to the supervisor's reaper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use types::ids::SeriesId;
use uuid::Uuid;

use crate::guardrail::LoopGuardrail;
use crate::registry::{IngestContext, IngestLoop};

/// How long a cancelled loop may keep running to drain its buffer.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Crash notice sent from a job task to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCrashed {
    pub series_id: SeriesId,
    pub job_id: Uuid,
    pub error: String,
    pub at: Instant,
}

pub type CrashSender = mpsc::UnboundedSender<JobCrashed>;
pub type CrashReceiver = mpsc::UnboundedReceiver<JobCrashed>;

/// Everything a job task needs.
pub struct JobRun {
    pub series_id: SeriesId,
    pub job_id: Uuid,
    pub cancel: CancellationToken,
    pub guardrail: Option<Arc<LoopGuardrail>>,
    pub ingest: Arc<dyn IngestLoop>,
    pub ctx: IngestContext,
    pub crash_tx: CrashSender,
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Crashed,
}

pub async fn run_job(run: JobRun) -> RunOutcome {
    let JobRun {
        series_id,
        job_id,
        cancel,
        guardrail,
        ingest,
        ctx,
        crash_tx,
    } = run;

    let mut running = ingest.run(ctx);
    let result = tokio::select! {
        result = &mut running => Some(result),
        _ = cancel.cancelled() => match tokio::time::timeout(CANCEL_GRACE, &mut running).await {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(
                    series = %series_id,
                    %job_id,
                    grace_ms = CANCEL_GRACE.as_millis() as u64,
                    "Loop ignored cancellation, dropping it"
                );
                None
            }
        },
    };

    let err = match result {
        Some(Ok(())) if !cancel.is_cancelled() => {
            if let Some(g) = &guardrail {
                g.on_success();
            }
            info!(series = %series_id, %job_id, "Job loop returned");
            return RunOutcome::Completed;
        }
        Some(Err(err)) if !cancel.is_cancelled() => err,
        result => {
            if let Some(Err(err)) = result {
                warn!(series = %series_id, %job_id, error = %err, "Loop failed while cancelling");
            }
            if let Some(g) = &guardrail {
                g.on_success();
            }
            debug!(series = %series_id, %job_id, "Job cancelled");
            return RunOutcome::Cancelled;
        }
    };

    let at = Instant::now();
    warn!(series = %series_id, %job_id, error = %err, "Job crashed");
    let notice = JobCrashed {
        series_id: series_id.clone(),
        job_id,
        error: err.to_string(),
        at,
    };
    if crash_tx.send(notice).is_err() {
        debug!(series = %series_id, %job_id, "Supervisor gone; crash not reported");
    }

    if let Some(g) = &guardrail {
        let wait = g.on_failure_at(at);
        debug!(
            series = %series_id,
            %job_id,
            wait_ms = wait.as_millis() as u64,
            "Backing off after crash"
        );
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    RunOutcome::Crashed
}
