//! Market interaction: search context, detail views, purchase attempts.
//!
//! The [`Market`] owns every piece of cached navigation state (result-card
//! coordinates, detail-view button positions, a deliberately-open detail
//! view) and exposes the two operations the schedulers drive:
//! [`Market::ensure_search_context`] and [`Market::purchase_cycle`].
//!
//! ```text
//! ensure_search_context          purchase_cycle (one attempt)
//!   obstacles -> navigate          recovery -> (search) -> detail
//!   -> search -> cache card        -> price -> quantity -> submit
//! ```

mod cycle;
mod price;

pub use cycle::{decide_quantity, AttemptResult, Outcome, QuantityDecision};
pub use price::{allowed_max, compute_price_region, parse_price_text, PriceAnchor};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info};

use crate::capability::{OcrService, Point, Region, ScreenDriver, Template};
use crate::config::AppConfig;
use crate::poll::{locate_within, PollBudget};
use crate::registry::ResolvedTask;

/// Detail-view controls cached on first entry for a goods entry.
#[derive(Debug, Clone, Copy)]
pub struct DetailButtons {
    pub buy: Region,
    pub close: Region,
    pub max: Option<Region>,
}

/// Market navigation plus the single-attempt purchase state machine.
pub struct Market {
    screen: Arc<dyn ScreenDriver>,
    config: Arc<AppConfig>,
    ocr: OcrService,
    /// Result-card coordinates per goods id.
    card_cache: HashMap<String, Region>,
    /// First-detail-entry button cache per goods id.
    detail_buttons: HashMap<String, DetailButtons>,
    /// Goods id of a detail view we deliberately left open after a
    /// restock purchase; the next attempt for the same goods jumps
    /// straight to the price read.
    open_detail_for: Option<String>,
}

impl Market {
    pub fn new(screen: Arc<dyn ScreenDriver>, config: Arc<AppConfig>, ocr: OcrService) -> Self {
        Self {
            screen,
            config,
            ocr,
            card_cache: HashMap::new(),
            detail_buttons: HashMap::new(),
            open_detail_for: None,
        }
    }

    pub(crate) fn config(&self) -> &AppConfig {
        &self.config
    }

    pub(crate) fn screen(&self) -> &dyn ScreenDriver {
        self.screen.as_ref()
    }

    pub(crate) fn ocr(&self) -> &OcrService {
        &self.ocr
    }

    fn step_delay(&self) -> Duration {
        Duration::from_millis(self.config.timing.step_delay_ms)
    }

    fn button_budget(&self) -> PollBudget {
        PollBudget::from_ms(400, 100)
    }

    /// Drop cached coordinates (for one goods entry, or all of them) and
    /// forget any deliberately-open detail. Called after restarts and on
    /// pause, when the screen may have changed arbitrarily.
    pub fn invalidate(&mut self, goods_id: Option<&str>) {
        match goods_id {
            Some(id) => {
                self.card_cache.remove(id);
            }
            None => self.card_cache.clear(),
        }
        self.open_detail_for = None;
    }

    /// Whether a detail view is deliberately being held open.
    pub fn holding_detail(&self) -> bool {
        self.open_detail_for.is_some()
    }

    /// Close a deliberately-open detail view, if any. Safe checkpoint
    /// helper for the restart coordinator: after this returns there is no
    /// uncommitted purchase state on screen.
    pub async fn close_held_detail(&mut self) {
        if let Some(goods_id) = self.open_detail_for.take() {
            self.close_detail(&goods_id).await;
        }
    }

    // ------------------------------------------------------------------
    // Search context (market navigation)
    // ------------------------------------------------------------------

    /// Navigate to the market, run the search, and cache the result-card
    /// coordinates for the task's goods. Returns false when the context
    /// could not be established; the caller decides whether to retry.
    pub async fn ensure_search_context(&mut self, task: &ResolvedTask) -> bool {
        self.handle_obstacles().await;
        self.open_detail_for = None;

        let indicator_budget = PollBudget::from_ms(400, 100);
        let nav_budget = PollBudget::from_ms(self.config.timing.search_locate_ms, 200);

        let in_home =
            locate_within(self.screen(), Template::HomeIndicator, indicator_budget).await;
        let in_market = if in_home.is_none() {
            locate_within(self.screen(), Template::MarketIndicator, indicator_budget).await
        } else {
            None
        };

        if in_home.is_some() {
            // Home: straight into the market.
            let Some(market) =
                locate_within(self.screen(), Template::MarketButton, nav_budget).await
            else {
                info!(item = %task.display_name(), "Market button not found");
                return false;
            };
            self.screen.click(market.center()).await;
        } else if in_market.is_some() {
            // Market with unknown search state: reset through home first.
            let Some(home) = locate_within(self.screen(), Template::HomeButton, nav_budget).await
            else {
                info!(item = %task.display_name(), "Home button not found for reset");
                return false;
            };
            self.screen.click(home.center()).await;
            sleep(self.step_delay()).await;
            let Some(market) =
                locate_within(self.screen(), Template::MarketButton, nav_budget).await
            else {
                info!(item = %task.display_name(), "Market button not found after reset");
                return false;
            };
            self.screen.click(market.center()).await;
        } else {
            info!(
                item = %task.display_name(),
                "Cannot classify the current screen (no home/market indicator)"
            );
            return false;
        }
        sleep(self.step_delay()).await;

        if !self.submit_search(&task.keyword).await {
            info!(item = %task.display_name(), "Search submission failed");
            return false;
        }
        sleep(Duration::from_millis(self.config.timing.list_refresh_ms)).await;

        let match_budget = PollBudget::from_ms(self.config.timing.goods_match_ms, 100);
        let confidence = self.goods_confidence();
        let image_path = task.goods.image_path.clone();
        let card = match_budget
            .run(|| self.screen.locate_image(&image_path, confidence))
            .await;

        match card {
            Some(region) => {
                self.card_cache.insert(task.goods.id.clone(), region);
                debug!(item = %task.display_name(), "Search context established");
                true
            }
            None => {
                info!(item = %task.display_name(), "Goods card not matched in result list");
                false
            }
        }
    }

    fn goods_confidence(&self) -> f32 {
        0.80
    }

    async fn submit_search(&self, keyword: &str) -> bool {
        let input_budget = PollBudget::from_ms(self.config.timing.search_locate_ms, 200);
        let Some(input) = locate_within(self.screen(), Template::SearchInput, input_budget).await
        else {
            return false;
        };
        self.screen.click(input.center()).await;
        sleep(self.step_delay()).await;
        self.screen.type_text(keyword, true).await;
        sleep(self.step_delay()).await;

        let Some(button) = locate_within(
            self.screen(),
            Template::SearchButton,
            PollBudget::from_ms(1000, 200),
        )
        .await
        else {
            return false;
        };
        self.screen.click(button.center()).await;
        true
    }

    /// Clear blocking leftovers: a stray open detail view, or a lingering
    /// success overlay.
    async fn handle_obstacles(&self) {
        let buy = self.screen.locate(Template::BuyButton).await;
        let close = self.screen.locate(Template::CloseButton).await;
        if let (Some(_), Some(close)) = (buy, close) {
            self.screen.click(close.center()).await;
            sleep(self.step_delay()).await;
            return;
        }

        if self.screen.locate(Template::BuyOk).await.is_some() {
            self.click_screen_center().await;
            if let Some(close) =
                locate_within(self.screen(), Template::CloseButton, PollBudget::from_ms(500, 100))
                    .await
            {
                self.screen.click(close.center()).await;
                sleep(self.step_delay()).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Detail view
    // ------------------------------------------------------------------

    /// Open the task's detail view: cached card coordinates first, then a
    /// fresh image match, then exactly one recovery re-search.
    pub(crate) async fn open_detail(&mut self, task: &ResolvedTask) -> bool {
        let goods_id = task.goods.id.clone();

        if let Some(card) = self.card_cache.get(&goods_id).copied() {
            self.screen.click(card.center()).await;
            if self.detail_confirmed().await {
                return true;
            }
            // Cached coordinates went stale
            self.card_cache.remove(&goods_id);
        }

        if self.match_and_open(task).await {
            return true;
        }

        // One recovery re-search, one more try
        if self.ensure_search_context(task).await && self.match_and_open(task).await {
            return true;
        }
        false
    }

    async fn match_and_open(&mut self, task: &ResolvedTask) -> bool {
        let confidence = self.goods_confidence();
        if let Some(card) = self
            .screen
            .locate_image(&task.goods.image_path, confidence)
            .await
        {
            self.card_cache.insert(task.goods.id.clone(), card);
            self.screen.click(card.center()).await;
            if self.detail_confirmed().await {
                return true;
            }
        }
        false
    }

    /// A detail view is confirmed when both the submit and close controls
    /// are visible.
    async fn detail_confirmed(&self) -> bool {
        let verify = PollBudget::from_ms(self.config.timing.detail_verify_ms, 50);
        let buy = locate_within(self.screen(), Template::BuyButton, verify).await;
        if buy.is_none() {
            return false;
        }
        locate_within(self.screen(), Template::CloseButton, verify)
            .await
            .is_some()
    }

    /// Cache the detail-view buttons on the first entry for this goods.
    pub(crate) async fn cache_detail_buttons(&mut self, task: &ResolvedTask) {
        if self.detail_buttons.contains_key(&task.goods.id) {
            return;
        }
        let budget = self.button_budget();
        let (Some(buy), Some(close)) = (
            locate_within(self.screen(), Template::BuyButton, budget).await,
            locate_within(self.screen(), Template::CloseButton, budget).await,
        ) else {
            return;
        };

        let max = if matches!(task.policy, crate::registry::QuantityPolicy::MaxControl { .. }) {
            locate_within(self.screen(), Template::MaxButton, PollBudget::from_ms(300, 100)).await
        } else {
            None
        };

        self.detail_buttons
            .insert(task.goods.id.clone(), DetailButtons { buy, close, max });
    }

    pub(crate) fn cached_buttons(&self, goods_id: &str) -> Option<&DetailButtons> {
        self.detail_buttons.get(goods_id)
    }

    /// Detail-view button lookup: cache first, template match fallback.
    pub(crate) async fn detail_button(&self, goods_id: &str, template: Template) -> Option<Region> {
        if let Some(buttons) = self.detail_buttons.get(goods_id) {
            let cached = match template {
                Template::BuyButton => Some(buttons.buy),
                Template::CloseButton => Some(buttons.close),
                Template::MaxButton => buttons.max,
                _ => None,
            };
            if cached.is_some() {
                return cached;
            }
        }
        locate_within(self.screen(), template, self.button_budget()).await
    }

    /// Close the detail view (cached coordinates preferred). Returns
    /// whether a close click was performed.
    pub(crate) async fn close_detail(&mut self, goods_id: &str) -> bool {
        self.open_detail_for = None;
        if let Some(close) = self.detail_button(goods_id, Template::CloseButton).await {
            self.screen.click(close.center()).await;
            sleep(self.step_delay()).await;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_detail_held(&mut self, goods_id: &str) {
        self.open_detail_for = Some(goods_id.to_string());
    }

    pub(crate) fn detail_held_for(&self, goods_id: &str) -> bool {
        self.open_detail_for.as_deref() == Some(goods_id)
    }

    pub(crate) fn cached_card(&self, goods_id: &str) -> Option<Region> {
        self.card_cache.get(goods_id).copied()
    }

    pub(crate) fn cache_card(&mut self, goods_id: &str, region: Region) {
        self.card_cache.insert(goods_id.to_string(), region);
    }

    pub(crate) fn drop_card(&mut self, goods_id: &str) {
        self.card_cache.remove(goods_id);
    }

    // ------------------------------------------------------------------
    // Overlay handling
    // ------------------------------------------------------------------

    async fn click_screen_center(&self) {
        let (w, h) = self.screen.screen_size().await;
        self.screen
            .click(Point {
                x: w as i32 / 2,
                y: h as i32 / 2,
            })
            .await;
        sleep(Duration::from_millis(10)).await;
    }

    /// Dismiss the success overlay: park the cursor in the safe corner,
    /// click through the overlay, park again.
    pub(crate) async fn dismiss_success_overlay(&self) {
        let (w, _) = self.screen.screen_size().await;
        let corner = Point {
            x: (w as i32 - 5).max(0),
            y: 5,
        };
        self.screen.move_to(corner).await;
        self.click_screen_center().await;
        self.screen.move_to(corner).await;
    }
}
