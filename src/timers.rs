//! # Monotonic one-shot timers for the supervisor loop.
//!
//! The loop owns a single [`Timers`] wheel; handlers arm deadlines (kill
//! grace, respawn cooldown, pidfile appearance, crash-window expiry) and
//! the loop sleeps until [`Timers::next_deadline`]. Timers are never
//! cancelled: a fired timer is validated against current record state by
//! the supervisor, so a stale one is a no-op.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::svc::Ident;

/// Deferred work item, validated against record state when it fires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// Stop grace expired; escalate SIGTERM to SIGKILL.
    KillTimeout(Ident),
    /// Respawn cooldown elapsed; the record may leave `crashed`.
    RespawnDue(Ident),
    /// Respawn window elapsed; a parked record regains its budget.
    CrashWindowOver(Ident),
    /// A forking service ran too long without its pidfile appearing.
    PidfileTimeout(Ident),
    /// Generic deferred `step_all`, used to break up long work.
    Step,
}

#[derive(PartialEq, Eq)]
struct Entry {
    at: Instant,
    seq: u64,
    ev: TimerEvent,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending deadlines.
#[derive(Default)]
pub struct Timers {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `ev` to fire `delay` from now.
    pub fn arm(&mut self, delay: Duration, ev: TimerEvent) {
        self.arm_at(Instant::now() + delay, ev);
    }

    pub fn arm_at(&mut self, at: Instant, ev: TimerEvent) {
        self.seq += 1;
        self.heap.push(Reverse(Entry {
            at,
            seq: self.seq,
            ev,
        }));
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Pops every event due at `now`, in arm order for equal deadlines.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while let Some(Reverse(e)) = self.heap.peek() {
            if e.at > now {
                break;
            }
            due.push(self.heap.pop().unwrap().0.ev);
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
