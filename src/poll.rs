//! Explicit bounded polling.
//!
//! Every wait in the worker is a [`PollBudget`]: a time budget plus a
//! probe interval. A zero budget means exactly one probe. Budgets use
//! tokio time, so they collapse instantly under paused test time.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::capability::{Region, ScreenDriver, Template};

/// A bounded retry policy: probe immediately, then every `interval`
/// until `budget` is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub budget: Duration,
    pub interval: Duration,
}

impl PollBudget {
    pub const fn new(budget: Duration, interval: Duration) -> Self {
        Self { budget, interval }
    }

    pub fn from_ms(budget_ms: u64, interval_ms: u64) -> Self {
        Self {
            budget: Duration::from_millis(budget_ms),
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// A single-probe budget.
    pub const fn once() -> Self {
        Self {
            budget: Duration::ZERO,
            interval: Duration::from_millis(1),
        }
    }

    /// Run `probe` until it yields a value or the budget runs out.
    pub async fn run<T, F, Fut>(&self, mut probe: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let deadline = Instant::now() + self.budget;
        loop {
            if let Some(value) = probe().await {
                return Some(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            sleep((deadline - now).min(self.interval)).await;
        }
    }
}

/// Locate a template within a bounded budget.
pub async fn locate_within(
    screen: &dyn ScreenDriver,
    template: Template,
    budget: PollBudget,
) -> Option<Region> {
    budget.run(|| screen.locate(template)).await
}
