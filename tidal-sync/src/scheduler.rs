//! Retry scheduling for failed fetches

use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use priority_queue::PriorityQueue;

use tidal_index::Socid;

/// Exponential backoff per SOCID, soonest retry first
pub struct RetrySchedule {
    base_delay: Duration,
    max_delay: Duration,
    due: PriorityQueue<Socid, Reverse<Instant>>,
    failures: HashMap<Socid, u32>,
}

impl RetrySchedule {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            due: PriorityQueue::new(),
            failures: HashMap::new(),
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(failures - 1);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Count a failure and return how long the entry must wait
    pub fn record_failure(&mut self, socid: Socid, now: Instant) -> Duration {
        let failures = self.failures.entry(socid).or_insert(0);
        *failures = failures.saturating_add(1);
        let count = *failures;
        let delay = self.backoff(count);
        self.due.push(socid, Reverse(now + delay));
        delay
    }

    pub fn is_due(&self, socid: &Socid, now: Instant) -> bool {
        match self.due.get_priority(socid) {
            Some(Reverse(at)) => *at <= now,
            None => true,
        }
    }

    pub fn failures(&self, socid: &Socid) -> u32 {
        self.failures.get(socid).copied().unwrap_or(0)
    }

    /// The entry is being attempted again; keep its failure count only
    pub fn dispatched(&mut self, socid: &Socid) {
        self.due.remove(socid);
    }

    /// Forget a SOCID after success or removal from the queue
    pub fn clear(&mut self, socid: &Socid) {
        self.due.remove(socid);
        self.failures.remove(socid);
    }

    /// Earliest instant at which some entry becomes due
    pub fn next_due(&self) -> Option<Instant> {
        self.due.peek().map(|(_, Reverse(at))| *at)
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }
}
