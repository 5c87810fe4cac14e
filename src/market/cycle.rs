//! The single-attempt purchase state machine.
//!
//! One invocation = at most one submit: recovery check, optional search,
//! detail entry, price read, quantity decision, submit, outcome
//! classification. Recoverable misses yield a zero-quantity result; only
//! a backend-fatal OCR failure escapes as an error.

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::capability::Template;
use crate::config::TaskDefinition;
use crate::error::Result;
use crate::poll::PollBudget;
use crate::registry::{QuantityPolicy, ResolvedTask};

use super::{allowed_max, Market};

/// Outcome of one purchase attempt.
///
/// `proceed` is false only for unrecoverable conditions that must end the
/// current segment/window immediately; every normal miss keeps it true.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptResult {
    pub quantity: u32,
    pub proceed: bool,
}

impl AttemptResult {
    /// A zero-quantity attempt that keeps the segment going.
    pub fn zero() -> Self {
        Self {
            quantity: 0,
            proceed: true,
        }
    }

    pub fn purchased(quantity: u32) -> Self {
        Self {
            quantity,
            proceed: true,
        }
    }
}

/// Submit outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
}

/// How one attempt should drive the quantity controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantityDecision {
    pub quantity: u32,
    /// Price hit the restock trigger.
    pub restock: bool,
    /// Drive the maximum-quantity control instead of typing.
    pub use_max_control: bool,
}

/// Decide the attempt quantity.
///
/// Restock branch iff `restock_price > 0` and the unit price is at or
/// below it (boundary inclusive); it draws from the goods' quantity
/// policy. The normal branch draws from the task's `default_quantity`.
/// Both clamp to `max_per_order` and, when `target_total > 0`, to the
/// non-negative remainder. `None` means nothing left to buy.
pub fn decide_quantity(
    def: &TaskDefinition,
    policy: QuantityPolicy,
    unit_price: i64,
    purchased: i64,
) -> Option<QuantityDecision> {
    let restock = def.restock_price > 0 && unit_price <= def.restock_price;
    let base = if restock {
        policy.amount()
    } else {
        def.default_quantity
    };

    let mut quantity = i64::from(base.min(def.max_per_order));
    if def.target_total > 0 {
        let remain = (def.target_total - purchased).max(0);
        quantity = quantity.min(remain);
    }
    if quantity < 1 {
        return None;
    }
    let quantity = quantity as u32;

    let use_max_control = restock
        && matches!(policy, QuantityPolicy::MaxControl { cap } if cap == quantity);

    Some(QuantityDecision {
        quantity,
        restock,
        use_max_control,
    })
}

impl Market {
    /// Run one purchase attempt for `task`.
    ///
    /// `purchased` is the task's committed total so far; `skip_search`
    /// reuses the established search context. The detail view is always
    /// closed before returning except after a restock-branch success,
    /// which deliberately keeps it open so the next attempt can jump
    /// straight back to the price read.
    pub async fn purchase_cycle(
        &mut self,
        task: &ResolvedTask,
        purchased: i64,
        skip_search: bool,
    ) -> Result<AttemptResult> {
        let goods_id = task.goods.id.clone();
        let chained = self.detail_held_for(&goods_id);

        if !chained {
            let force_search = self.recover_stray_detail(task).await;

            if !skip_search || force_search {
                if !self.ensure_search_context(task).await {
                    info!(item = %task.display_name(), "Search context unavailable, attempt skipped");
                    return Ok(AttemptResult::zero());
                }
            }

            if !self.open_detail(task).await {
                info!(item = %task.display_name(), "Item not found, attempt skipped");
                return Ok(AttemptResult::zero());
            }
            self.cache_detail_buttons(task).await;
        }
        // Consumed; re-established only by a restock success below.
        self.mark_detail_released();

        let unit_price = match self.read_unit_price(task).await? {
            Some(price) => price,
            None => {
                self.close_detail(&goods_id).await;
                return Ok(AttemptResult::zero());
            }
        };

        if let Some(allowed) = allowed_max(task.def.price_threshold, task.def.price_premium_pct) {
            if unit_price > allowed {
                debug!(
                    item = %task.display_name(),
                    unit_price,
                    allowed,
                    "Price above allowance, closing detail"
                );
                self.close_detail(&goods_id).await;
                return Ok(AttemptResult::zero());
            }
        }

        let decision = match decide_quantity(&task.def, task.policy, unit_price, purchased) {
            Some(decision) => decision,
            None => {
                debug!(item = %task.display_name(), "Nothing left to buy, closing detail");
                self.close_detail(&goods_id).await;
                return Ok(AttemptResult::zero());
            }
        };
        debug!(
            item = %task.display_name(),
            unit_price,
            quantity = decision.quantity,
            restock = decision.restock,
            "Quantity decided"
        );

        if !self.drive_quantity(&goods_id, &decision).await {
            self.close_detail(&goods_id).await;
            return Ok(AttemptResult::zero());
        }

        let Some(buy) = self.detail_button(&goods_id, Template::BuyButton).await else {
            info!(item = %task.display_name(), "Submit control missing, closing detail");
            self.close_detail(&goods_id).await;
            return Ok(AttemptResult::zero());
        };
        self.screen().click(buy.center()).await;

        match self.classify_outcome().await {
            Outcome::Success => {
                self.dismiss_success_overlay().await;
                if decision.restock && unit_price <= task.def.restock_price {
                    // Keep the detail open for rapid restock chaining.
                    self.mark_detail_held(&goods_id);
                } else {
                    self.close_detail(&goods_id).await;
                }
                info!(
                    item = %task.display_name(),
                    quantity = decision.quantity,
                    unit_price,
                    "Purchase succeeded"
                );
                Ok(AttemptResult::purchased(decision.quantity))
            }
            Outcome::Failure => {
                warn!(item = %task.display_name(), unit_price, "Purchase failed");
                self.close_detail(&goods_id).await;
                Ok(AttemptResult::zero())
            }
            Outcome::Unknown => {
                warn!(item = %task.display_name(), "Purchase outcome unknown");
                self.close_detail(&goods_id).await;
                Ok(AttemptResult::zero())
            }
        }
    }

    /// Recovery check: a detail view left behind by a previous run blocks
    /// everything else. Close it and refresh the card coordinates; when
    /// the card cannot be re-located the caller must re-search.
    async fn recover_stray_detail(&mut self, task: &ResolvedTask) -> bool {
        let buy = self.screen().locate(Template::BuyButton).await;
        let close = self.screen().locate(Template::CloseButton).await;
        let (Some(_), Some(close)) = (buy, close) else {
            return false;
        };

        debug!(item = %task.display_name(), "Stray detail view open, closing");
        self.screen().click(close.center()).await;
        sleep(self.step_delay()).await;

        match self
            .screen()
            .locate_image(&task.goods.image_path, self.goods_confidence())
            .await
        {
            Some(card) => {
                self.cache_card(&task.goods.id, card);
                false
            }
            None => {
                self.drop_card(&task.goods.id);
                true
            }
        }
    }

    /// Drive the quantity controls for this decision. Quantity 1 needs no
    /// input; the max control covers a full-cap restock; anything else is
    /// typed into the quantity input.
    async fn drive_quantity(&self, goods_id: &str, decision: &QuantityDecision) -> bool {
        if decision.use_max_control {
            let Some(max) = self.detail_button(goods_id, Template::MaxButton).await else {
                info!("Maximum-quantity control missing");
                return false;
            };
            self.screen().click(max.center()).await;
            sleep(self.step_delay()).await;
            return true;
        }

        if decision.quantity > 1 {
            let Some(input) = crate::poll::locate_within(
                self.screen(),
                Template::QuantityInput,
                PollBudget::from_ms(300, 100),
            )
            .await
            else {
                info!("Quantity input missing");
                return false;
            };
            self.screen().click(input.center()).await;
            sleep(self.step_delay()).await;
            self.screen()
                .type_text(&decision.quantity.to_string(), true)
                .await;
            sleep(self.step_delay()).await;
        }
        true
    }

    /// Poll for a success/failure marker within the outcome budget, then
    /// run exactly one grace re-check before giving up as unknown.
    async fn classify_outcome(&self) -> Outcome {
        let budget = PollBudget::from_ms(
            self.config().timing.outcome_budget_ms,
            self.config().timing.outcome_interval_ms,
        );

        let hit = budget
            .run(|| async {
                if self.screen().locate(Template::BuyOk).await.is_some() {
                    return Some(Outcome::Success);
                }
                if self.screen().locate(Template::BuyFail).await.is_some() {
                    return Some(Outcome::Failure);
                }
                None
            })
            .await;
        if let Some(outcome) = hit {
            return outcome;
        }

        sleep(std::time::Duration::from_millis(
            self.config().timing.outcome_grace_ms,
        ))
        .await;
        if self.screen().locate(Template::BuyOk).await.is_some() {
            Outcome::Success
        } else if self.screen().locate(Template::BuyFail).await.is_some() {
            Outcome::Failure
        } else {
            Outcome::Unknown
        }
    }

    fn mark_detail_released(&mut self) {
        self.open_detail_for = None;
    }
}
