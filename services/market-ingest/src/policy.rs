//! Capacity and reaper decisions
//!
//! Pure functions over a read-only view of the job table. The supervisor
//! builds the views under its lock, asks for a plan, and carries the plan out
//! after releasing it.

use std::time::Duration;

use tokio::time::Instant;
use types::ids::SeriesId;

/// Read-only view of one job, as seen by the policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobView {
    pub series_id: SeriesId,
    /// Subscriber count; negative for whitelist-pinned jobs.
    pub refcount: i64,
    /// When the refcount last dropped to zero.
    pub idle_since: Option<Instant>,
    /// Whether the job's task is still running.
    pub alive: bool,
}

/// Outcome of capacity planning for a new on-demand job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityDecision {
    /// Room available; start the job.
    Accept,
    /// Start the job after stopping the given idle job.
    Evict(SeriesId),
    /// Table is full of busy jobs.
    Reject,
}

/// Decide whether an on-demand job may start now.
///
/// Pinned jobs never count against `max_jobs` and are never evicted. A
/// `max_jobs` of zero disables the limit.
pub fn plan_capacity(
    jobs: &[JobView],
    max_jobs: usize,
    is_pinned: impl Fn(&SeriesId) -> bool,
    now: Instant,
) -> CapacityDecision {
    if max_jobs == 0 {
        return CapacityDecision::Accept;
    }

    let unpinned: Vec<&JobView> = jobs.iter().filter(|j| !is_pinned(&j.series_id)).collect();
    if unpinned.len() < max_jobs {
        return CapacityDecision::Accept;
    }

    unpinned
        .into_iter()
        .filter(|j| j.refcount == 0)
        .min_by_key(|j| j.idle_since.unwrap_or(now))
        .map(|victim| CapacityDecision::Evict(victim.series_id.clone()))
        .unwrap_or(CapacityDecision::Reject)
}

/// Jobs the reaper wants to act on during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaperPlan {
    /// Jobs whose tasks must be cancelled and awaited.
    pub stop: Vec<SeriesId>,
    /// Table entries to remove.
    pub drop: Vec<SeriesId>,
    /// Pinned jobs whose tasks died and must be started again.
    pub restart: Vec<SeriesId>,
}

impl ReaperPlan {
    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.drop.is_empty() && self.restart.is_empty()
    }
}

/// Decide which idle or dead jobs to stop, drop or restart.
///
/// Pinned jobs are never stopped for idleness, but a dead pinned job is
/// always scheduled for restart.
pub fn plan_reaper(
    jobs: &[JobView],
    now: Instant,
    idle_ttl: Duration,
    is_pinned: impl Fn(&SeriesId) -> bool,
) -> ReaperPlan {
    let mut plan = ReaperPlan::default();
    for job in jobs {
        let pinned = is_pinned(&job.series_id);
        if !job.alive {
            if pinned {
                plan.restart.push(job.series_id.clone());
            } else {
                plan.stop.push(job.series_id.clone());
                plan.drop.push(job.series_id.clone());
            }
            continue;
        }
        if pinned || job.refcount != 0 {
            continue;
        }
        let idle_for = job
            .idle_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        if idle_for > idle_ttl {
            plan.stop.push(job.series_id.clone());
            plan.drop.push(job.series_id.clone());
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(symbol: &str) -> SeriesId {
        SeriesId::parse(&format!("binance:spot:{symbol}:1m")).unwrap()
    }

    fn job(symbol: &str, refcount: i64, idle_since: Option<Instant>, alive: bool) -> JobView {
        JobView {
            series_id: sid(symbol),
            refcount,
            idle_since,
            alive,
        }
    }

    // Far enough ahead that subtracting test offsets never underflows.
    fn clock() -> Instant {
        Instant::now() + Duration::from_secs(7200)
    }

    fn none_pinned(_: &SeriesId) -> bool {
        false
    }

    #[test]
    fn test_accept_below_capacity() {
        let now = clock();
        let jobs = vec![job("A/USDT", 1, None, true)];
        assert_eq!(
            plan_capacity(&jobs, 2, none_pinned, now),
            CapacityDecision::Accept
        );
    }

    #[test]
    fn test_reject_when_all_busy() {
        let now = clock();
        let jobs = vec![job("A/USDT", 1, None, true), job("B/USDT", 3, None, true)];
        assert_eq!(
            plan_capacity(&jobs, 2, none_pinned, now),
            CapacityDecision::Reject
        );
    }

    #[test]
    fn test_evicts_longest_idle() {
        let now = clock();
        let jobs = vec![
            job("A/USDT", 0, Some(now - Duration::from_secs(5)), true),
            job("B/USDT", 0, Some(now - Duration::from_secs(30)), true),
            job("C/USDT", 2, None, true),
        ];
        assert_eq!(
            plan_capacity(&jobs, 3, none_pinned, now),
            CapacityDecision::Evict(sid("B/USDT"))
        );
    }

    #[test]
    fn test_pinned_jobs_do_not_count_and_are_never_victims() {
        let now = clock();
        let pinned = sid("P/USDT");
        let is_pinned = |s: &SeriesId| *s == pinned;
        let jobs = vec![
            job("P/USDT", -1, Some(now - Duration::from_secs(100)), true),
            job("A/USDT", 1, None, true),
        ];
        assert_eq!(
            plan_capacity(&jobs, 2, is_pinned, now),
            CapacityDecision::Accept
        );
        assert_eq!(
            plan_capacity(&jobs, 1, is_pinned, now),
            CapacityDecision::Reject
        );
    }

    #[test]
    fn test_zero_max_jobs_is_unlimited() {
        let now = clock();
        let jobs = vec![job("A/USDT", 1, None, true)];
        assert_eq!(
            plan_capacity(&jobs, 0, none_pinned, now),
            CapacityDecision::Accept
        );
    }

    #[test]
    fn test_reaper_restarts_dead_pinned() {
        let now = clock();
        let pinned = sid("P/USDT");
        let jobs = vec![job("P/USDT", -1, None, false)];
        let plan = plan_reaper(&jobs, now, Duration::from_secs(60), |s| *s == pinned);
        assert_eq!(plan.restart, vec![sid("P/USDT")]);
        assert!(plan.stop.is_empty());
        assert!(plan.drop.is_empty());
    }

    #[test]
    fn test_reaper_never_stops_idle_pinned() {
        let now = clock();
        let pinned = sid("P/USDT");
        let jobs = vec![job(
            "P/USDT",
            0,
            Some(now - Duration::from_secs(3600)),
            true,
        )];
        let plan = plan_reaper(&jobs, now, Duration::from_secs(60), |s| *s == pinned);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_reaper_drops_dead_unpinned() {
        let now = clock();
        let jobs = vec![job("A/USDT", 2, None, false)];
        let plan = plan_reaper(&jobs, now, Duration::from_secs(60), none_pinned);
        assert_eq!(plan.stop, vec![sid("A/USDT")]);
        assert_eq!(plan.drop, vec![sid("A/USDT")]);
        assert!(plan.restart.is_empty());
    }

    #[test]
    fn test_reaper_stops_idle_past_ttl() {
        let now = clock();
        let jobs = vec![
            job("OLD/USDT", 0, Some(now - Duration::from_secs(120)), true),
            job("NEW/USDT", 0, Some(now - Duration::from_secs(10)), true),
            job("BUSY/USDT", 1, None, true),
        ];
        let plan = plan_reaper(&jobs, now, Duration::from_secs(60), none_pinned);
        assert_eq!(plan.stop, vec![sid("OLD/USDT")]);
        assert_eq!(plan.drop, vec![sid("OLD/USDT")]);
    }
}
