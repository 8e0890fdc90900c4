//! # Respawn policy for supervised services.
//!
//! [`RespawnPolicy`] bounds how aggressively a crashed service is brought
//! back: a minimum [`cooldown`](RespawnPolicy::cooldown) between attempts,
//! and a [`limit`](RespawnPolicy::limit) of exits within a sliding
//! [`window`](RespawnPolicy::window). Exceeding the limit parks the record
//! in `crashed` until the window elapses or its gate toggles.
//!
//! [`RespawnState`] is the per-record counter; it lives on the service
//! record and is consulted only from `step_all` and the reaper.
//!
//! # Example
//! ```
//! use std::time::{Duration, Instant};
//! use initvisor::{RespawnPolicy, RespawnState};
//!
//! let policy = RespawnPolicy::default();
//! let mut state = RespawnState::default();
//!
//! let now = Instant::now();
//! for _ in 0..policy.limit {
//!     state.register_exit(&policy, now);
//! }
//! assert!(state.exhausted(&policy, now));
//! assert!(!state.exhausted(&policy, now + policy.window));
//! ```

use std::time::{Duration, Instant};

/// Bounds on automatic restarts of a `service` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RespawnPolicy {
    /// Exits tolerated within [`window`](Self::window) before parking.
    pub limit: u32,
    /// Sliding window over which exits are counted.
    pub window: Duration,
    /// Minimum interval between a crash and the next start attempt.
    pub cooldown: Duration,
}

impl Default for RespawnPolicy {
    /// 10 exits in 30 seconds, 1 second cooldown between attempts.
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(1),
        }
    }
}

/// Per-record exit counter over the policy window.
///
/// The counter resets whenever a full window passes without an exit, so a
/// service that settles down regains its full respawn budget.
#[derive(Clone, Copy, Debug, Default)]
pub struct RespawnState {
    count: u32,
    window_start: Option<Instant>,
}

impl RespawnState {
    /// Records one exit at `now`, opening a new window if the previous one
    /// has elapsed. Returns the count within the current window.
    pub fn register_exit(&mut self, policy: &RespawnPolicy, now: Instant) -> u32 {
        match self.window_start {
            Some(start) if now.duration_since(start) < policy.window => {
                self.count = self.count.saturating_add(1);
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }
        self.count
    }

    /// True while the exit count has hit the limit and the window has not
    /// yet elapsed. An exhausted record stays parked in `crashed`.
    pub fn exhausted(&self, policy: &RespawnPolicy, now: Instant) -> bool {
        match self.window_start {
            Some(start) => {
                self.count >= policy.limit && now.duration_since(start) < policy.window
            }
            None => false,
        }
    }

    /// Clears the counter. Called when the gate toggles, which grants the
    /// record a fresh budget.
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }

    /// Exits recorded in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RespawnPolicy {
        RespawnPolicy {
            limit: 3,
            window: Duration::from_secs(10),
            cooldown: Duration::from_millis(500),
        }
    }

    #[test]
    fn counter_increases_within_window() {
        let p = policy();
        let mut s = RespawnState::default();
        let t0 = Instant::now();

        assert_eq!(s.register_exit(&p, t0), 1);
        assert_eq!(s.register_exit(&p, t0 + Duration::from_secs(1)), 2);
        assert_eq!(s.register_exit(&p, t0 + Duration::from_secs(2)), 3);
        assert!(s.exhausted(&p, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn window_elapse_resets_budget() {
        let p = policy();
        let mut s = RespawnState::default();
        let t0 = Instant::now();

        for i in 0..p.limit {
            s.register_exit(&p, t0 + Duration::from_secs(i as u64));
        }
        assert!(s.exhausted(&p, t0 + Duration::from_secs(3)));

        // Once the window passes the record is no longer parked, and the
        // next exit opens a fresh window.
        let later = t0 + p.window + Duration::from_secs(1);
        assert!(!s.exhausted(&p, later));
        assert_eq!(s.register_exit(&p, later), 1);
    }

    #[test]
    fn gate_toggle_reset() {
        let p = policy();
        let mut s = RespawnState::default();
        let t0 = Instant::now();

        for _ in 0..p.limit {
            s.register_exit(&p, t0);
        }
        s.reset();
        assert!(!s.exhausted(&p, t0));
        assert_eq!(s.count(), 0);
    }
}
