//! Timer registry owned by the conversation session.
//!
//! One entry per [`TimerKind`]; arming a kind that is already armed replaces
//! it. The driver sleeps until [`TimerRegistry::next_deadline`] and then hands
//! due entries back to the session one at a time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Every timer the conversation session can arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Quiet window after the last transcript event
    Silence,
    /// Budget for dialog plus synthesis
    ResponseTimeout,
    /// Liveness net: forces the session back to Idle
    HardTimeout,
    /// Liveness net: clears a stuck processing flag
    ProcessingWatchdog,
    /// Next playback poll
    PlaybackPoll,
    /// Settle delay before listening resumes in continuous mode
    ResumeListening,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    deadline: Instant,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    entries: HashMap<TimerKind, Entry>,
    seq: u64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` to fire `after` from `now`, replacing any previous deadline
    pub fn arm(&mut self, kind: TimerKind, now: Instant, after: Duration) {
        self.seq += 1;
        self.entries.insert(
            kind,
            Entry {
                deadline: now + after,
                seq: self.seq,
            },
        );
    }

    /// Returns true if the timer was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.entries.remove(&kind).is_some()
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        self.entries.get(&kind).map(|e| e.deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove and return the earliest entry due at `now`. Ties go to the
    /// entry armed first.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| (e.deadline, e.seq))
            .map(|(kind, _)| *kind)?;
        self.entries.remove(&kind);
        Some(kind)
    }
}
