// Numan Thabit 2025
// sched/gap.rs - spacing of join slots with geometric backoff

/// Decides when the next unallocated slot is due.
#[derive(Debug, Clone)]
pub struct JoinGap {
    min: u16,
    max: u16,
    backoff_rounds: u16,
    gap: u16,
    since_last: u16,
    quiet_rounds: u16,
}

impl JoinGap {
    pub fn new(min: u16, max: u16, backoff_rounds: u16) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            backoff_rounds: backoff_rounds.max(1),
            gap: min,
            since_last: 0,
            quiet_rounds: 0,
        }
    }

    /// Advances one slot. Returns true when this slot should be left for joins.
    pub fn tick(&mut self) -> bool {
        self.since_last += 1;
        if self.since_last < self.gap {
            return false;
        }
        self.since_last = 0;
        self.quiet_rounds += 1;
        if self.quiet_rounds >= self.backoff_rounds {
            self.quiet_rounds = 0;
            self.gap = self.gap.saturating_mul(2).min(self.max);
        }
        true
    }

    /// A join was heard: go back to fast onboarding.
    pub fn new_node_heard(&mut self) {
        self.gap = self.min;
        self.quiet_rounds = 0;
        self.since_last = self.since_last.min(self.min - 1);
    }

    pub fn gap(&self) -> u16 {
        self.gap
    }
}
