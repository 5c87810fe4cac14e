//! Startup gate: guarantees the market is interactable before scheduling.
//!
//! Also re-used by restart recovery, which runs the same launch procedure
//! after tearing the target down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::capability::{ProcessControl, ScreenDriver, Template};
use crate::config::AppConfig;
use crate::error::{FatalError, Result};
use crate::poll::{locate_within, PollBudget};

/// Fast-path indicator probe budget.
const FAST_PATH_BUDGET: PollBudget = PollBudget::new(
    Duration::from_millis(400),
    Duration::from_millis(100),
);

/// Poll cadence while waiting for startup to complete.
const STARTUP_POLL: Duration = Duration::from_millis(300);

/// Gate that blocks scheduling until the target is interactable.
pub struct ReadinessGate {
    screen: Arc<dyn ScreenDriver>,
    process: Arc<dyn ProcessControl>,
    config: Arc<AppConfig>,
}

impl ReadinessGate {
    pub fn new(
        screen: Arc<dyn ScreenDriver>,
        process: Arc<dyn ProcessControl>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            screen,
            process,
            config,
        }
    }

    /// Ensure the target is up and the market is reachable.
    ///
    /// Fast path: a home or market indicator already on screen means the
    /// target is running. Otherwise the launch procedure runs with a
    /// bounded startup budget. Fatal results must abort all scheduling.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.indicator_visible(FAST_PATH_BUDGET).await {
            debug!("Home/market indicator already present, skipping launch");
            return Ok(());
        }
        self.launch().await
    }

    /// Run the launch procedure: validate config, spawn, click the launch
    /// button once, wait for an indicator.
    pub async fn launch(&self) -> Result<()> {
        let game = &self.config.game;

        if game.exe_path.trim().is_empty() {
            return Err(FatalError::ConfigInvalid(
                "launcher executable path not configured".to_string(),
            ));
        }
        if !self.template_configured(Template::LaunchButton) {
            return Err(FatalError::ConfigInvalid(
                "launch button template not configured".to_string(),
            ));
        }
        if !self.template_configured(Template::HomeIndicator)
            && !self.template_configured(Template::MarketIndicator)
        {
            return Err(FatalError::ConfigInvalid(
                "no home/market indicator template configured".to_string(),
            ));
        }

        self.process
            .spawn(&game.exe_path, &game.launch_args, None)
            .await
            .map_err(|e| FatalError::ConfigInvalid(format!("failed to spawn launcher: {e}")))?;
        info!(exe = %game.exe_path, "Launcher started, waiting for the target");

        let startup_timeout = Duration::from_secs(game.startup_timeout_secs);
        let deadline = Instant::now() + startup_timeout;
        let mut launch_clicked = false;

        while Instant::now() < deadline {
            if !launch_clicked {
                if let Some(button) = self.screen.locate(Template::LaunchButton).await {
                    // Let the launcher finish preparing before the single
                    // click; clicking early drops the press on some builds.
                    let delay = Duration::from_secs(game.launch_click_delay_secs);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    self.screen.click(button.center()).await;
                    launch_clicked = true;
                    info!("Launch button clicked");
                    continue;
                }
            }

            if self.indicator_once().await {
                info!("Target ready, market reachable");
                return Ok(());
            }

            sleep(STARTUP_POLL).await;
        }

        warn!(timeout = ?startup_timeout, "Target never became ready");
        Err(FatalError::StartupTimeout(startup_timeout))
    }

    fn template_configured(&self, template: Template) -> bool {
        self.config
            .template(template.key())
            .map(|t| !t.path.is_empty())
            .unwrap_or(false)
    }

    async fn indicator_visible(&self, budget: PollBudget) -> bool {
        locate_within(self.screen.as_ref(), Template::HomeIndicator, budget)
            .await
            .is_some()
            || locate_within(self.screen.as_ref(), Template::MarketIndicator, budget)
                .await
                .is_some()
    }

    async fn indicator_once(&self) -> bool {
        self.screen.locate(Template::HomeIndicator).await.is_some()
            || self.screen.locate(Template::MarketIndicator).await.is_some()
    }
}
