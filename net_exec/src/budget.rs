//! Time-budget accounting for dispatch-mode activations.

use std::time::Duration;
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct BudgetConfig {
    /// How long a dispatch activation may keep polling.
    pub limit: Duration,
    /// Elapsed time past which a warning is logged. Exceeding the watchdog
    /// is a rescheduling condition, not a hang.
    pub watchdog_threshold: Duration,
    /// Grant one budget extension before forcing a yield.
    pub try_extend: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: Duration::from_micros(100),
            watchdog_threshold: Duration::from_millis(10),
            try_extend: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BudgetStatus {
    Ok,
    Exhausted,
}

pub(crate) struct Budget<'a> {
    config: &'a BudgetConfig,
    start: Instant,
    limit: Duration,
    extended: bool,
    warned: bool,
}

impl<'a> Budget<'a> {
    pub fn start(config: &'a BudgetConfig) -> Self {
        Self {
            config,
            start: Instant::now(),
            limit: config.limit,
            extended: false,
            warned: false,
        }
    }

    pub fn check(&mut self) -> BudgetStatus {
        let elapsed = self.start.elapsed();
        if elapsed >= self.config.watchdog_threshold && !self.warned {
            self.warned = true;
            tracing::warn!(
                elapsed_us = elapsed.as_micros() as u64,
                "dispatch activation exceeded watchdog threshold"
            );
        }
        if elapsed < self.limit {
            return BudgetStatus::Ok;
        }
        if self.config.try_extend && !self.extended {
            self.extended = true;
            self.limit += self.config.limit;
            return BudgetStatus::Ok;
        }
        BudgetStatus::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_exhausts_immediately() {
        let config = BudgetConfig {
            limit: Duration::ZERO,
            ..Default::default()
        };
        let mut budget = Budget::start(&config);
        assert_eq!(budget.check(), BudgetStatus::Exhausted);
    }

    #[test]
    fn extension_is_granted_once() {
        let config = BudgetConfig {
            limit: Duration::ZERO,
            try_extend: true,
            ..Default::default()
        };
        let mut budget = Budget::start(&config);
        assert_eq!(budget.check(), BudgetStatus::Ok);
        assert_eq!(budget.check(), BudgetStatus::Exhausted);
    }
}
