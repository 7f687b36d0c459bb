//! Per-queue dispatch rate budget.

use std::collections::VecDeque;

use tokio::time::Instant;

/// Sliding one-second window admitting at most `limit` dispatches.
///
/// `None` limit means unmetered. The window tracks the instants of
/// admitted dispatches and drops those older than one second, so bursts
/// after an idle stretch are still bounded by `limit`.
#[derive(Debug)]
pub struct RateBudget {
    limit: Option<u32>,
    admitted: VecDeque<Instant>,
}

impl RateBudget {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            admitted: VecDeque::new(),
        }
    }

    pub fn unmetered() -> Self {
        Self::new(None)
    }

    /// Admit one dispatch at `now` if the window allows it.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        let Some(limit) = self.limit else {
            return true;
        };

        self.expire(now);

        if self.admitted.len() < limit as usize {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    /// How many more dispatches the current window admits.
    pub fn remaining(&mut self, now: Instant) -> Option<u32> {
        let limit = self.limit?;
        self.expire(now);
        Some(limit.saturating_sub(self.admitted.len() as u32))
    }

    /// Drop admissions that have left the one-second window.
    fn expire(&mut self, now: Instant) {
        // checked_sub: the process may be younger than the window.
        let Some(window_start) = now.checked_sub(std::time::Duration::from_secs(1)) else {
            return;
        };
        while matches!(self.admitted.front(), Some(&t) if t <= window_start) {
            self.admitted.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_per_second() {
        let mut budget = RateBudget::new(Some(3));
        let now = Instant::now();
        assert!(budget.try_admit(now));
        assert!(budget.try_admit(now));
        assert!(budget.try_admit(now));
        assert!(!budget.try_admit(now));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let mut budget = RateBudget::new(Some(2));
        let start = Instant::now();
        assert!(budget.try_admit(start));
        assert!(budget.try_admit(start));
        assert!(!budget.try_admit(start + Duration::from_millis(500)));
        // Both admissions fall out of the window after a second.
        assert!(budget.try_admit(start + Duration::from_millis(1_001)));
    }

    #[tokio::test(start_paused = true)]
    async fn unmetered_always_admits() {
        let mut budget = RateBudget::unmetered();
        let now = Instant::now();
        for _ in 0..10_000 {
            assert!(budget.try_admit(now));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let mut budget = RateBudget::new(Some(2));
        let now = Instant::now();
        assert_eq!(budget.remaining(now), Some(2));
        budget.try_admit(now);
        assert_eq!(budget.remaining(now), Some(1));
    }
}
