//! Unit-price extraction from the detail view.
//!
//! One OCR read per attempt: an anchor control is located (cached submit
//! button, else the currency icon), a price region is derived from its
//! geometry, captured, recognized, and normalized. Only a backend-fatal
//! OCR error escapes; everything else degrades to "no price this attempt".

use tracing::{debug, info, warn};

use crate::capability::{Region, Template};
use crate::config::PriceAreaConfig;
use crate::error::{FatalError, OcrError, Result};
use crate::poll::{locate_within, PollBudget};
use crate::registry::ResolvedTask;

use super::Market;

/// Where the price region hangs off.
#[derive(Debug, Clone, Copy)]
pub enum PriceAnchor {
    /// Submit control: the average-price rows sit directly above it.
    Submit(Region),
    /// Currency icon: the price digits sit directly to its right.
    CurrencyIcon(Region),
}

/// Derive the price region from an anchor, clamped to the screen.
///
/// Submit anchor: a block of `cfg.height` rows ending
/// `cfg.distance_from_anchor` above the control, `cfg.width` columns wide
/// (0 = the anchor's width); exchangeable goods push the block up by the
/// configured extra offset. Currency anchor: `cfg.width` columns to the
/// right of the icon at the icon's own height.
pub fn compute_price_region(
    anchor: PriceAnchor,
    screen: (u32, u32),
    cfg: &PriceAreaConfig,
    exchangeable: bool,
) -> Option<Region> {
    let (sw, sh) = (screen.0 as i32, screen.1 as i32);
    if sw < 2 || sh < 2 {
        return None;
    }

    let (left, top, width, height) = match anchor {
        PriceAnchor::Submit(region) => {
            let mut distance = cfg.distance_from_anchor;
            if exchangeable {
                distance += cfg.exchangeable_extra_offset;
            }
            let bottom = region.top - distance;
            let top = bottom - cfg.height as i32;
            let width = if cfg.width > 0 { cfg.width } else { region.width };
            (region.left, top, width as i32, cfg.height as i32)
        }
        PriceAnchor::CurrencyIcon(region) => {
            let left = region.left + region.width as i32;
            let width = if cfg.width > 0 { cfg.width as i32 } else { 220 };
            (left, region.top, width, region.height as i32)
        }
    };

    let top = top.clamp(0, sh - 2);
    let left = left.clamp(0, sw - 2);
    let height = height.min(sh - 1 - top);
    let width = width.min(sw - left);
    if height < 1 || width < 1 {
        return None;
    }

    Some(Region::new(left, top, width as u32, height as u32))
}

/// Normalize OCR output to an integer price.
///
/// Accepts thousands separators and a K/M magnitude suffix
/// ("1.2K" -> 1200). Returns the first number found; `None` when no
/// digits survive.
pub fn parse_price_text(text: &str) -> Option<i64> {
    let cleaned: String = text
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    let bytes = cleaned.as_bytes();

    let start = bytes.iter().position(|b| b.is_ascii_digit())?;
    let mut end = start;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }

    let value: f64 = cleaned[start..end].parse().ok()?;
    let value = match bytes.get(end) {
        Some(b'K') => value * 1_000.0,
        Some(b'M') => value * 1_000_000.0,
        _ => value,
    };

    Some(value.round() as i64)
}

/// Allowed price ceiling: `floor(threshold * (1 + premium/100))`.
/// `None` when the threshold check is disabled.
pub fn allowed_max(price_threshold: i64, premium_pct: f64) -> Option<i64> {
    if price_threshold <= 0 {
        return None;
    }
    let factor = 1.0 + premium_pct.max(0.0) / 100.0;
    Some((price_threshold as f64 * factor).floor() as i64)
}

impl Market {
    /// Read the unit price from the open detail view.
    ///
    /// `Ok(None)` covers every recoverable miss (no anchor, capture
    /// failure, service error, unparsable or implausible value); only a
    /// backend-fatal OCR failure becomes an `Err`.
    pub(crate) async fn read_unit_price(&self, task: &ResolvedTask) -> Result<Option<i64>> {
        let anchor = match self.price_anchor(task).await {
            Some(anchor) => anchor,
            None => {
                info!(item = %task.display_name(), "No price anchor found in detail view");
                return Ok(None);
            }
        };

        let screen_size = self.screen().screen_size().await;
        let region = match compute_price_region(
            anchor,
            screen_size,
            &self.config().price_area,
            task.goods.exchangeable,
        ) {
            Some(region) => region,
            None => {
                info!(item = %task.display_name(), "Price region degenerate, skipping read");
                return Ok(None);
            }
        };

        let image = match self.screen().capture(region).await {
            Some(image) => image,
            None => {
                info!(item = %task.display_name(), "Price region capture failed");
                return Ok(None);
            }
        };

        let text = match self.ocr().read_text(&image).await {
            Ok(text) => text,
            Err(OcrError::Fatal(message)) => {
                return Err(FatalError::ServiceFatal(message));
            }
            Err(OcrError::Service(message)) => {
                warn!(item = %task.display_name(), error = %message, "OCR service error");
                return Ok(None);
            }
        };

        let value = match parse_price_text(&text) {
            Some(value) if value > 0 => value,
            _ => {
                info!(
                    item = %task.display_name(),
                    raw = %text.chars().take(64).collect::<String>(),
                    "Unit price not readable"
                );
                return Ok(None);
            }
        };

        // A reading far below the configured price base is a misread, not
        // a bargain; drop it rather than buy on it.
        let floor_base = if task.def.price_threshold > 0 {
            task.def.price_threshold
        } else {
            task.def.restock_price
        };
        if floor_base > 0 && value < (floor_base / 2).max(1) {
            info!(
                item = %task.display_name(),
                value,
                floor = (floor_base / 2).max(1),
                "Unit price below plausibility floor, discarded"
            );
            return Ok(None);
        }

        debug!(item = %task.display_name(), unit_price = value, "Unit price read");
        Ok(Some(value))
    }

    async fn price_anchor(&self, task: &ResolvedTask) -> Option<PriceAnchor> {
        if let Some(buttons) = self.cached_buttons(&task.goods.id) {
            return Some(PriceAnchor::Submit(buttons.buy));
        }
        if let Some(buy) = locate_within(
            self.screen(),
            Template::BuyButton,
            PollBudget::from_ms(300, 100),
        )
        .await
        {
            return Some(PriceAnchor::Submit(buy));
        }
        locate_within(
            self.screen(),
            Template::CurrencyIcon,
            PollBudget::from_ms(300, 100),
        )
        .await
        .map(PriceAnchor::CurrencyIcon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::OcrService;
    use crate::config::AppConfig;
    use crate::registry::{QuantityPolicy, ResolvedTask};
    use crate::test_util::{ScriptedOcr, ScriptedScreen};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_parse_plain_and_separators() {
        assert_eq!(parse_price_text("1234"), Some(1234));
        assert_eq!(parse_price_text("1,250"), Some(1250));
        assert_eq!(parse_price_text("  987  "), Some(987));
    }

    #[test]
    fn test_parse_magnitude_suffixes() {
        assert_eq!(parse_price_text("1.2K"), Some(1200));
        assert_eq!(parse_price_text("2k"), Some(2000));
        assert_eq!(parse_price_text("1.5M"), Some(1_500_000));
        assert_eq!(parse_price_text("3.25 K"), Some(3250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_price_text(""), None);
        assert_eq!(parse_price_text("no digits"), None);
        assert_eq!(parse_price_text("---"), None);
    }

    #[test]
    fn test_parse_takes_first_number() {
        assert_eq!(parse_price_text("avg 150 total 750"), Some(150));
    }

    #[test]
    fn test_allowed_max_floor_semantics() {
        assert_eq!(allowed_max(200, 0.0), Some(200));
        assert_eq!(allowed_max(200, 10.0), Some(220));
        // floor, not round: 3 * 1.334 = 4.002
        assert_eq!(allowed_max(3, 33.4), Some(4));
        assert_eq!(allowed_max(1000, 2.55), Some(1025));
        // negative premium is clamped to zero allowance
        assert_eq!(allowed_max(200, -50.0), Some(200));
        assert_eq!(allowed_max(0, 25.0), None);
        assert_eq!(allowed_max(-5, 25.0), None);
    }

    #[test]
    fn test_price_region_above_submit_anchor() {
        let cfg = crate::config::PriceAreaConfig::default();
        let anchor = Region::new(800, 600, 120, 40);
        let region =
            compute_price_region(PriceAnchor::Submit(anchor), (1920, 1080), &cfg, false).unwrap();

        assert_eq!(region.left, 800);
        assert_eq!(region.width, 120);
        assert_eq!(region.height, 45);
        // ends distance_from_anchor above the control
        assert_eq!(region.top, 600 - 5 - 45);
    }

    #[test]
    fn test_price_region_exchangeable_offset() {
        let cfg = crate::config::PriceAreaConfig::default();
        let anchor = Region::new(800, 600, 120, 40);
        let plain =
            compute_price_region(PriceAnchor::Submit(anchor), (1920, 1080), &cfg, false).unwrap();
        let shifted =
            compute_price_region(PriceAnchor::Submit(anchor), (1920, 1080), &cfg, true).unwrap();

        assert_eq!(plain.top - shifted.top, 30);
    }

    #[test]
    fn test_price_region_right_of_currency_icon() {
        let cfg = crate::config::PriceAreaConfig {
            width: 220,
            ..Default::default()
        };
        let icon = Region::new(500, 300, 24, 24);
        let region =
            compute_price_region(PriceAnchor::CurrencyIcon(icon), (1920, 1080), &cfg, false)
                .unwrap();

        assert_eq!(region.left, 524);
        assert_eq!(region.top, 300);
        assert_eq!(region.width, 220);
        assert_eq!(region.height, 24);
    }

    #[test]
    fn test_price_region_clamped_to_screen() {
        let cfg = crate::config::PriceAreaConfig::default();
        // Anchor hugging the right edge: the region narrows instead of
        // spilling off screen
        let anchor = Region::new(1900, 600, 120, 40);
        let region =
            compute_price_region(PriceAnchor::Submit(anchor), (1920, 1080), &cfg, false).unwrap();
        assert!(region.left + region.width as i32 <= 1920);

        // A degenerate screen yields nothing to read
        assert!(compute_price_region(PriceAnchor::Submit(anchor), (1, 1), &cfg, false).is_none());
    }

    fn task_with_prices(threshold: i64, restock: i64) -> ResolvedTask {
        let mut def: crate::config::TaskDefinition = serde_json::from_str("{}").unwrap();
        def.item_id = "g-1".to_string();
        def.price_threshold = threshold;
        def.restock_price = restock;
        ResolvedTask {
            def,
            goods: crate::config::GoodsEntry {
                id: "g-1".to_string(),
                name: "item".to_string(),
                ..Default::default()
            },
            keyword: "item".to_string(),
            policy: QuantityPolicy::FixedManual { value: 5 },
        }
    }

    fn market_with_ocr(screen: Arc<ScriptedScreen>, ocr: ScriptedOcr) -> Market {
        Market::new(
            screen,
            Arc::new(AppConfig::default()),
            OcrService::new(Box::new(ocr), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_read_unit_price_happy_path() {
        let screen = Arc::new(ScriptedScreen::new());
        screen.show(Template::BuyButton, Region::new(800, 600, 120, 40));
        let market = market_with_ocr(screen.clone(), ScriptedOcr::reading("195"));

        let value = market.read_unit_price(&task_with_prices(200, 0)).await.unwrap();
        assert_eq!(value, Some(195));
        // One OCR read per attempt: exactly one region was captured
        assert_eq!(screen.captures.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_unit_price_fatal_propagates() {
        let screen = Arc::new(ScriptedScreen::new());
        screen.show(Template::BuyButton, Region::new(800, 600, 120, 40));
        let market = market_with_ocr(
            screen,
            ScriptedOcr::new(vec![Err(OcrError::Fatal("backend gone".into()))]),
        );

        match market.read_unit_price(&task_with_prices(200, 0)).await {
            Err(FatalError::ServiceFatal(_)) => {}
            other => panic!("expected ServiceFatal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_unit_price_service_error_recoverable() {
        let screen = Arc::new(ScriptedScreen::new());
        screen.show(Template::BuyButton, Region::new(800, 600, 120, 40));
        let market = market_with_ocr(
            screen,
            ScriptedOcr::new(vec![Err(OcrError::Service("timeout".into()))]),
        );

        let value = market.read_unit_price(&task_with_prices(200, 0)).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_read_unit_price_plausibility_floor() {
        let screen = Arc::new(ScriptedScreen::new());
        screen.show(Template::BuyButton, Region::new(800, 600, 120, 40));
        // 80 < 200/2: a misread, not a bargain
        let market = market_with_ocr(screen, ScriptedOcr::reading("80"));

        let value = market.read_unit_price(&task_with_prices(200, 0)).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_read_unit_price_no_anchor() {
        let screen = Arc::new(ScriptedScreen::new());
        let market = market_with_ocr(screen, ScriptedOcr::reading("195"));

        let value = market.read_unit_price(&task_with_prices(200, 0)).await.unwrap();
        assert_eq!(value, None);
    }
}
