//! Per-job timeout budgets and the heartbeat-extended deadline clock.
//!
//! A render or synthesis job has no useful fixed timeout: a one-page memo
//! finishes in seconds, a full audiobook chapter legitimately runs for
//! hours. The policy here sizes an initial budget from the job's input
//! size, then lets a heartbeat ticker push the deadline ahead of the job
//! while the worker stays alive, up to an absolute ceiling that is honored
//! unconditionally.
//!
//! Two rules make the behaviour predictable:
//!
//! * the current deadline is **monotonically non-decreasing**: a tick either
//!   extends it or leaves it alone, never pulls it closer;
//! * once elapsed time reaches `absolute_maximum` the clock reports
//!   [`Tick::CeilingReached`] and stops extending, so the pending call
//!   settles exactly once even if ticks keep arriving.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Externally configurable timeout surface consumed by the RPC gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Flat budget every long-running job starts from. Default: 120s.
    pub base: Duration,

    /// Additional budget per unit of input (KiB of payload, character of
    /// synthesis text). Default: 100ms.
    ///
    /// With the defaults, a 50 000-unit job gets 50 000 × 0.1s + 120s
    /// = 5 120s of initial budget.
    pub per_unit_cost: Duration,

    /// Lower clamp on the initial budget. Default: 30s.
    pub minimum: Duration,

    /// Upper clamp on the initial budget. Default: 5h.
    ///
    /// This caps the *starting* deadline only; heartbeat extensions may
    /// carry a live job well past it, up to `absolute_maximum`.
    pub maximum: Duration,

    /// Hard ceiling on total job runtime. Default: 24h.
    pub absolute_maximum: Duration,

    /// How often the heartbeat ticker fires for long-running jobs.
    /// Default: 30s.
    pub heartbeat_interval: Duration,

    /// A tick extends the deadline only when it is this close. Default: 120s.
    ///
    /// Ticks far from the deadline are no-ops, so the deadline creeps
    /// forward just ahead of a live job instead of jumping to the ceiling
    /// at the first tick.
    pub extension_window: Duration,

    /// Fixed budget for short administrative jobs (ping, release).
    /// Default: 10s. These never get a heartbeat.
    pub admin_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(120),
            per_unit_cost: Duration::from_millis(100),
            minimum: Duration::from_secs(30),
            maximum: Duration::from_secs(18_000),
            absolute_maximum: Duration::from_secs(86_400),
            heartbeat_interval: Duration::from_secs(30),
            extension_window: Duration::from_secs(120),
            admin_timeout: Duration::from_secs(10),
        }
    }
}

impl TimeoutPolicy {
    /// Initial budget for a job costing `units`, clamped to
    /// `minimum..=maximum`.
    pub fn budget_for(&self, units: u64) -> Duration {
        let cost_ms = self.per_unit_cost.as_millis().saturating_mul(units as u128);
        let total_ms = self.base.as_millis().saturating_add(cost_ms);
        let clamped = total_ms.clamp(self.minimum.as_millis(), self.maximum.as_millis());
        Duration::from_millis(clamped as u64)
    }

    /// Check the policy is internally coherent.
    pub fn validate(&self) -> Result<(), String> {
        if self.minimum > self.maximum {
            return Err(format!(
                "timeout minimum ({:?}) exceeds maximum ({:?})",
                self.minimum, self.maximum
            ));
        }
        if self.maximum > self.absolute_maximum {
            return Err(format!(
                "timeout maximum ({:?}) exceeds absolute ceiling ({:?})",
                self.maximum, self.absolute_maximum
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat interval must be non-zero".to_string());
        }
        if self.extension_window.is_zero() {
            return Err("extension window must be non-zero".to_string());
        }
        if self.admin_timeout.is_zero() {
            return Err("admin timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// What one heartbeat tick did to the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The deadline moved forward.
    Extended,
    /// The deadline was far enough away; nothing changed.
    Unchanged,
    /// Elapsed time reached the absolute ceiling. The clock will never
    /// extend again; the caller must settle the job.
    CeilingReached,
}

/// The mutable deadline for one in-flight call.
///
/// Owned by exactly one call; independent calls own independent clocks,
/// so a timeout on one never disturbs another.
#[derive(Debug)]
pub struct DeadlineClock {
    started: Instant,
    deadline: Instant,
    ceiling: Instant,
}

impl DeadlineClock {
    pub fn new(budget: Duration, absolute_maximum: Duration) -> Self {
        let started = Instant::now();
        let ceiling = started + absolute_maximum;
        DeadlineClock {
            started,
            // budget never exceeds the ceiling by construction, but a
            // hand-built policy could violate that; clamp here too
            deadline: (started + budget).min(ceiling),
            ceiling,
        }
    }

    /// The instant the pending call should give up at, as of now.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the current deadline sits at the absolute ceiling.
    pub fn at_ceiling(&self) -> bool {
        self.deadline >= self.ceiling
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// One heartbeat: extend the deadline by `window` when it is within
    /// `window` of firing, bounded by the ceiling.
    pub fn tick(&mut self, window: Duration) -> Tick {
        let now = Instant::now();
        if now >= self.ceiling {
            return Tick::CeilingReached;
        }
        if self.deadline.saturating_duration_since(now) > window {
            return Tick::Unchanged;
        }
        let extended = (self.deadline + window).min(self.ceiling);
        if extended > self.deadline {
            self.deadline = extended;
            Tick::Extended
        } else {
            Tick::Unchanged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_scales_with_units() {
        let policy = TimeoutPolicy::default();
        // 50 000 units at 100ms each on top of the 120s base
        assert_eq!(policy.budget_for(50_000), Duration::from_secs(5_120));
        assert_eq!(policy.budget_for(0), Duration::from_secs(120));
    }

    #[test]
    fn budget_clamps_to_min_and_max() {
        let policy = TimeoutPolicy {
            base: Duration::from_secs(1),
            minimum: Duration::from_secs(30),
            maximum: Duration::from_secs(100),
            ..TimeoutPolicy::default()
        };
        assert_eq!(policy.budget_for(0), Duration::from_secs(30));
        assert_eq!(policy.budget_for(10_000_000), Duration::from_secs(100));
    }

    #[test]
    fn incoherent_policies_rejected() {
        let policy = TimeoutPolicy {
            minimum: Duration::from_secs(100),
            maximum: Duration::from_secs(10),
            ..TimeoutPolicy::default()
        };
        assert!(policy.validate().is_err());

        let policy = TimeoutPolicy {
            maximum: Duration::from_secs(100_000_000),
            ..TimeoutPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_extends_only_near_the_deadline() {
        let mut clock = DeadlineClock::new(Duration::from_secs(1_000), Duration::from_secs(5_000));

        // far away: no-op
        assert_eq!(clock.tick(Duration::from_secs(120)), Tick::Unchanged);

        tokio::time::advance(Duration::from_secs(900)).await;
        let before = clock.deadline();
        assert_eq!(clock.tick(Duration::from_secs(120)), Tick::Extended);
        assert_eq!(clock.deadline(), before + Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_never_decreases_and_stops_at_ceiling() {
        let window = Duration::from_secs(120);
        let mut clock = DeadlineClock::new(Duration::from_secs(100), Duration::from_secs(300));

        let mut last = clock.deadline();
        loop {
            tokio::time::advance(Duration::from_secs(30)).await;
            match clock.tick(window) {
                Tick::CeilingReached => break,
                _ => {
                    assert!(clock.deadline() >= last, "deadline moved backwards");
                    last = clock.deadline();
                }
            }
        }
        assert!(clock.elapsed() >= Duration::from_secs(300));
        // ticks after the ceiling keep reporting the same terminal state
        assert_eq!(clock.tick(window), Tick::CeilingReached);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_is_bounded_by_ceiling() {
        let mut clock = DeadlineClock::new(Duration::from_secs(100), Duration::from_secs(150));
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.tick(Duration::from_secs(120)), Tick::Extended);
        assert!(clock.at_ceiling());

        // a second near-deadline tick has nothing left to extend
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(clock.tick(Duration::from_secs(120)), Tick::Unchanged);
    }
}
