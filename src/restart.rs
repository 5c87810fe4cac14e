//! Periodic soft-restart coordination.
//!
//! One coordinator serves both scheduling policies. It only answers
//! due-checks at safe checkpoints (between attempts, after any detail
//! view is closed) and runs the full teardown/relaunch procedure when a
//! restart is due. Whether the measured downtime counts against the
//! active task's timer is the scheduling mode's decision, injected at
//! construction as a [`DowntimePolicy`].

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::capability::{ProcessControl, ScreenDriver, Template};
use crate::config::AppConfig;
use crate::error::{FatalError, Result};
use crate::poll::{locate_within, PollBudget};
use crate::readiness::ReadinessGate;

/// Whether restart downtime counts against the active task's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DowntimePolicy {
    /// Subtract downtime from the segment's accumulated time
    /// (round-robin segments).
    ExcludeFromTimer,
    /// Let downtime elapse against the window like any other wall time
    /// (time-of-day windows).
    CountAgainstTimer,
}

/// Tracks the periodic-restart deadline and executes restarts.
pub struct RestartCoordinator {
    screen: Arc<dyn ScreenDriver>,
    process: Arc<dyn ProcessControl>,
    config: Arc<AppConfig>,
    gate: ReadinessGate,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    policy: DowntimePolicy,
}

impl RestartCoordinator {
    /// `interval_min <= 0` disables restarts entirely.
    pub fn new(
        interval_min: i64,
        screen: Arc<dyn ScreenDriver>,
        process: Arc<dyn ProcessControl>,
        config: Arc<AppConfig>,
        policy: DowntimePolicy,
    ) -> Self {
        let gate = ReadinessGate::new(screen.clone(), process.clone(), config.clone());
        Self {
            screen,
            process,
            config,
            gate,
            interval: (interval_min > 0).then(|| Duration::from_secs(interval_min as u64 * 60)),
            next_due: None,
            policy,
        }
    }

    pub fn enabled(&self) -> bool {
        self.interval.is_some()
    }

    pub fn policy(&self) -> DowntimePolicy {
        self.policy
    }

    /// Due-check, called only at safe checkpoints. The deadline is armed
    /// lazily on the first check, so the first interval is measured from
    /// scheduling start.
    pub fn is_due(&mut self) -> bool {
        let Some(interval) = self.interval else {
            return false;
        };
        match self.next_due {
            None => {
                self.next_due = Some(Instant::now() + interval);
                false
            }
            Some(due) => Instant::now() >= due,
        }
    }

    /// Execute the restart: graceful in-game exit (falling back to
    /// forceful process termination), relaunch, re-arm the deadline.
    /// Returns the measured downtime. The caller must have closed any
    /// open detail view first, so no uncommitted purchase state exists.
    pub async fn restart(&mut self) -> Result<Duration> {
        let started = Instant::now();
        info!("Restart interval reached, restarting the target");

        if !self.graceful_exit().await {
            warn!("Graceful exit path not available, terminating the process");
            if let Err(e) = self.process.terminate().await {
                warn!(error = %e, "Forceful termination reported an error");
            }
        }

        if let Err(e) = self.gate.ensure_ready().await {
            return Err(FatalError::RestartFailure(e.to_string()));
        }

        let interval = self.interval.unwrap_or(Duration::from_secs(60));
        self.next_due = Some(Instant::now() + interval);

        let downtime = started.elapsed();
        info!(downtime_ms = downtime.as_millis() as u64, "Restart complete");
        Ok(downtime)
    }

    /// Template-driven exit: home, settings, exit, exit-confirm, each
    /// with its settle wait. Returns whether the confirm step was
    /// reached; anything less leaves the process for the forceful path.
    async fn graceful_exit(&self) -> bool {
        let budget = PollBudget::from_ms(1000, 200);
        let step_settle = Duration::from_secs(self.config.timing.restart_step_settle_secs);

        for template in [
            Template::HomeButton,
            Template::SettingsButton,
            Template::ExitButton,
        ] {
            if let Some(button) = locate_within(self.screen.as_ref(), template, budget).await {
                self.screen.click(button.center()).await;
            }
            sleep(step_settle).await;
        }

        let Some(confirm) =
            locate_within(self.screen.as_ref(), Template::ExitConfirmButton, budget).await
        else {
            return false;
        };
        self.screen.click(confirm.center()).await;
        // Full exit to desktop takes a while
        sleep(Duration::from_secs(
            self.config.timing.restart_exit_settle_secs,
        ))
        .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Region;
    use crate::test_util::{FakeProcess, ScriptedScreen};

    fn coordinator(
        interval_min: i64,
        screen: Arc<ScriptedScreen>,
        process: Arc<FakeProcess>,
    ) -> RestartCoordinator {
        let mut config = AppConfig::default();
        config.game.exe_path = "C:/game/launcher.exe".to_string();
        config.game.launch_click_delay_secs = 0;
        RestartCoordinator::new(
            interval_min,
            screen,
            process,
            Arc::new(config),
            DowntimePolicy::ExcludeFromTimer,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_when_interval_nonpositive() {
        let mut coordinator = coordinator(0, Arc::new(ScriptedScreen::new()), Arc::new(FakeProcess::new()));
        assert!(!coordinator.enabled());
        assert!(!coordinator.is_due());
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert!(!coordinator.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_arms_lazily() {
        let mut coordinator = coordinator(30, Arc::new(ScriptedScreen::new()), Arc::new(FakeProcess::new()));

        // First check arms the deadline instead of firing
        assert!(!coordinator.is_due());
        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(!coordinator.is_due());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(coordinator.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_restart_measures_downtime_and_rearms() {
        let screen = Arc::new(ScriptedScreen::new());
        for (template, region) in [
            (Template::HomeButton, Region::new(10, 10, 20, 20)),
            (Template::SettingsButton, Region::new(40, 10, 20, 20)),
            (Template::ExitButton, Region::new(70, 10, 20, 20)),
            (Template::ExitConfirmButton, Region::new(100, 10, 20, 20)),
        ] {
            screen.show(template, region);
        }
        // Relaunch fast path: the target is back on the home screen
        screen.show(Template::HomeIndicator, Region::new(0, 0, 10, 10));
        let process = Arc::new(FakeProcess::new());
        let mut coordinator = coordinator(30, screen.clone(), process.clone());

        assert!(!coordinator.is_due());
        let downtime = coordinator.restart().await.unwrap();

        // Three step settles plus the exit settle dominate the downtime
        assert!(downtime >= Duration::from_secs(3 * 5 + 30));
        assert_eq!(process.termination_count(), 0);
        // Deadline re-armed
        assert!(!coordinator.is_due());
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert!(coordinator.is_due());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forceful_fallback_when_exit_path_missing() {
        let screen = Arc::new(ScriptedScreen::new());
        screen.show(Template::HomeIndicator, Region::new(0, 0, 10, 10));
        let process = Arc::new(FakeProcess::new());
        let mut coordinator = coordinator(30, screen.clone(), process.clone());

        let result = coordinator.restart().await;
        assert!(result.is_ok());
        assert_eq!(process.termination_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_failure_is_fatal() {
        // No indicators ever appear and nothing is configured to launch
        let screen = Arc::new(ScriptedScreen::new());
        let process = Arc::new(FakeProcess::new());
        let config = Arc::new(AppConfig::default());
        let mut coordinator = RestartCoordinator::new(
            30,
            screen,
            process,
            config,
            DowntimePolicy::CountAgainstTimer,
        );

        match coordinator.restart().await {
            Err(FatalError::RestartFailure(_)) => {}
            other => panic!("expected RestartFailure, got {other:?}"),
        }
    }
}
