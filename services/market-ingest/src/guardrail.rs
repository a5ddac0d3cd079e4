//! Crash-loop guardrail for ingestion jobs
//!
//! Per-series circuit breaker. Each loop failure is recorded with a
//! timestamp; reaching `crash_budget` failures inside `budget_window` opens
//! the circuit for `open_cooldown`. Between failures the job waits an
//! exponential backoff clamped to `[backoff_initial, backoff_max]`.
//!
//! The guardrail is shared (`Arc`) between the job task and the supervisor,
//! so all state sits behind an internal mutex that is never held across an
//! await.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

/// Guardrail tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Failures within the window that trip the circuit.
    pub crash_budget: u32,
    pub budget_window_ms: u64,
    pub open_cooldown_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            crash_budget: 5,
            budget_window_ms: 60_000,
            open_cooldown_ms: 120_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

impl GuardrailConfig {
    fn budget_window(&self) -> Duration {
        Duration::from_millis(self.budget_window_ms)
    }

    fn open_cooldown(&self) -> Duration {
        Duration::from_millis(self.open_cooldown_ms)
    }

    fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms.min(self.backoff_max_ms))
    }

    fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailState {
    /// Normal operation, attempts are allowed.
    Closed,
    /// Tripped: attempts are refused until the cooldown expires.
    Open { until: Instant },
}

#[derive(Debug)]
struct Inner {
    state: GuardrailState,
    crashes: VecDeque<Instant>,
    next_backoff: Duration,
}

/// Serializable view used by debug dumps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardrailSnapshot {
    pub open: bool,
    pub crashes_in_window: usize,
    pub next_backoff_ms: u64,
    pub cooldown_remaining_ms: u64,
}

#[derive(Debug)]
pub struct LoopGuardrail {
    config: GuardrailConfig,
    inner: Mutex<Inner>,
}

impl LoopGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        let next_backoff = config.backoff_initial();
        Self {
            config,
            inner: Mutex::new(Inner {
                state: GuardrailState::Closed,
                crashes: VecDeque::new(),
                next_backoff,
            }),
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned guardrail only means a panic mid-update of plain data.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remaining cooldown before a new attempt may start (zero when closed).
    pub fn before_attempt(&self) -> Duration {
        self.before_attempt_at(Instant::now())
    }

    pub fn before_attempt_at(&self, now: Instant) -> Duration {
        let mut inner = self.lock();
        match inner.state {
            GuardrailState::Closed => Duration::ZERO,
            GuardrailState::Open { until } => {
                if now >= until {
                    inner.state = GuardrailState::Closed;
                    Duration::ZERO
                } else {
                    until - now
                }
            }
        }
    }

    /// Record a loop failure and return how long to wait before retrying.
    pub fn on_failure(&self) -> Duration {
        self.on_failure_at(Instant::now())
    }

    pub fn on_failure_at(&self, now: Instant) -> Duration {
        let mut inner = self.lock();
        let window = self.config.budget_window();
        while inner
            .crashes
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > window)
        {
            inner.crashes.pop_front();
        }
        inner.crashes.push_back(now);

        if inner.crashes.len() >= self.config.crash_budget.max(1) as usize {
            let cooldown = self.config.open_cooldown();
            warn!(
                crashes = inner.crashes.len(),
                window_ms = self.config.budget_window_ms,
                cooldown_ms = self.config.open_cooldown_ms,
                "Crash budget exhausted, opening circuit"
            );
            inner.state = GuardrailState::Open {
                until: now + cooldown,
            };
            inner.crashes.clear();
            inner.next_backoff = self.config.backoff_initial();
            return cooldown;
        }

        let wait = inner.next_backoff;
        inner.next_backoff = (wait * 2).clamp(self.config.backoff_initial(), self.config.backoff_max());
        wait
    }

    /// Record an observed success; resets the backoff.
    pub fn on_success(&self) {
        self.lock().next_backoff = self.config.backoff_initial();
    }

    pub fn state(&self) -> GuardrailState {
        self.lock().state
    }

    pub fn is_open_at(&self, now: Instant) -> bool {
        !self.before_attempt_at(now).is_zero()
    }

    /// Read-only view; an expired open circuit reports as closed without
    /// being transitioned.
    pub fn snapshot_at(&self, now: Instant) -> GuardrailSnapshot {
        let inner = self.lock();
        let cooldown = match inner.state {
            GuardrailState::Open { until } => until.saturating_duration_since(now),
            GuardrailState::Closed => Duration::ZERO,
        };
        GuardrailSnapshot {
            open: !cooldown.is_zero(),
            crashes_in_window: inner.crashes.len(),
            next_backoff_ms: inner.next_backoff.as_millis() as u64,
            cooldown_remaining_ms: cooldown.as_millis() as u64,
        }
    }
}

impl Default for LoopGuardrail {
    fn default() -> Self {
        Self::new(GuardrailConfig::default())
    }
}
