//! Configuration for the purchase runner.
//!
//! Three documents are loaded once per run and are read-only afterwards:
//!
//! - [`AppConfig`]: environment-level settings (game launch, visual
//!   templates, price region geometry, OCR service, timing knobs).
//! - [`TasksConfig`]: scheduling mode plus the task list.
//! - the goods catalog ([`GoodsEntry`] list) resolved by the registry.
//!
//! Missing fields fall back to defaults field-by-field, so a partial file
//! on disk behaves like a deep merge over the built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Scheduling policy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Fixed-duration rotation over the task queue.
    Round,
    /// Time-of-day window matching.
    Time,
}

impl Default for SchedulerMode {
    fn default() -> Self {
        SchedulerMode::Time
    }
}

/// One visual template reference: an image on disk plus a match confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCfg {
    /// Path to the template image.
    pub path: String,
    /// Match confidence threshold.
    #[serde(default = "default_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    0.85
}

/// Game process launch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    /// Launcher executable path.
    #[serde(default)]
    pub exe_path: String,
    /// Extra launcher arguments (space separated).
    #[serde(default)]
    pub launch_args: String,
    /// Delay between the launch button appearing and the single click on
    /// it, letting the launcher finish preparing resources.
    #[serde(default = "default_launch_click_delay_secs")]
    pub launch_click_delay_secs: u64,
    /// Overall budget for reaching an interactable market after spawn.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_launch_click_delay_secs() -> u64 {
    20
}
fn default_startup_timeout_secs() -> u64 {
    120
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            exe_path: String::new(),
            launch_args: String::new(),
            launch_click_delay_secs: default_launch_click_delay_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

/// Geometry of the unit-price region, derived from a visual anchor.
///
/// The region sits above the anchor (submit button or currency icon):
/// `width` columns starting at the anchor's left edge (0 = anchor width),
/// `height` rows ending `distance_from_anchor` above the anchor's top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAreaConfig {
    #[serde(default = "default_price_distance")]
    pub distance_from_anchor: i32,
    #[serde(default = "default_price_height")]
    pub height: u32,
    /// Region width; 0 uses the anchor's own width.
    #[serde(default)]
    pub width: u32,
    /// Extra vertical offset applied for exchangeable goods, whose detail
    /// layout inserts an exchange row under the price.
    #[serde(default = "default_exchangeable_offset")]
    pub exchangeable_extra_offset: i32,
}

fn default_price_distance() -> i32 {
    5
}
fn default_price_height() -> u32 {
    45
}
fn default_exchangeable_offset() -> i32 {
    30
}

impl Default for PriceAreaConfig {
    fn default() -> Self {
        Self {
            distance_from_anchor: default_price_distance(),
            height: default_price_height(),
            width: 0,
            exchangeable_extra_offset: default_exchangeable_offset(),
        }
    }
}

/// OCR service settings (Umi-style HTTP endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Primary engine name.
    #[serde(default = "default_ocr_engine")]
    pub engine: String,
    /// HTTP base URL of the OCR service.
    #[serde(default = "default_ocr_url")]
    pub base_url: String,
    /// Per-call timeout; a stalled backend must not hang the worker.
    #[serde(default = "default_ocr_timeout_ms")]
    pub timeout_ms: u64,
    /// Engine options forwarded verbatim (e.g. {"data.format": "text"}).
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_ocr_engine() -> String {
    "umi".to_string()
}
fn default_ocr_url() -> String {
    "http://127.0.0.1:1224".to_string()
}
fn default_ocr_timeout_ms() -> u64 {
    2500
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            engine: default_ocr_engine(),
            base_url: default_ocr_url(),
            timeout_ms: default_ocr_timeout_ms(),
            options: serde_json::Value::Null,
        }
    }
}

/// Quantity-policy resolution settings.
///
/// Goods whose `big_category` appears in `max_control_categories` expose a
/// maximum-quantity control in their detail view and resolve to the
/// max-control policy; everything else gets the fixed manual-entry value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityConfig {
    #[serde(default = "default_max_control_categories")]
    pub max_control_categories: Vec<String>,
    #[serde(default = "default_max_control_cap")]
    pub max_control_cap: u32,
    #[serde(default = "default_fixed_manual_value")]
    pub fixed_manual_value: u32,
}

fn default_max_control_categories() -> Vec<String> {
    vec!["ammo".to_string()]
}
fn default_max_control_cap() -> u32 {
    120
}
fn default_fixed_manual_value() -> u32 {
    5
}

impl Default for QuantityConfig {
    fn default() -> Self {
        Self {
            max_control_categories: default_max_control_categories(),
            max_control_cap: default_max_control_cap(),
            fixed_manual_value: default_fixed_manual_value(),
        }
    }
}

/// Timing knobs for bounded waits and polling cadences.
///
/// Each value parameterizes exactly one bounded operation; nothing in the
/// worker sleeps for an amount not named here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Settle time after a click or keystroke burst.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Wait for the search result list to refresh after submitting.
    #[serde(default = "default_list_refresh_ms")]
    pub list_refresh_ms: u64,
    /// Budget for a detail view to confirm (submit+close visible).
    #[serde(default = "default_detail_verify_ms")]
    pub detail_verify_ms: u64,
    /// Budget for locating search-page controls.
    #[serde(default = "default_search_locate_ms")]
    pub search_locate_ms: u64,
    /// Budget for matching a goods image in the result list.
    #[serde(default = "default_goods_match_ms")]
    pub goods_match_ms: u64,
    /// Outcome classification poll budget after clicking submit.
    #[serde(default = "default_outcome_budget_ms")]
    pub outcome_budget_ms: u64,
    /// Poll interval inside the outcome window.
    #[serde(default = "default_outcome_interval_ms")]
    pub outcome_interval_ms: u64,
    /// Delay before the single grace re-check when no marker appeared.
    #[serde(default = "default_outcome_grace_ms")]
    pub outcome_grace_ms: u64,
    /// Idle poll when no task is runnable / no window matches.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Poll cadence while paused.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    /// Gap between consecutive purchase attempts.
    #[serde(default = "default_attempt_gap_ms")]
    pub attempt_gap_ms: u64,
    /// Settle time after each step of the graceful exit path.
    #[serde(default = "default_restart_step_settle_secs")]
    pub restart_step_settle_secs: u64,
    /// Settle time for the process to fully exit before relaunch.
    #[serde(default = "default_restart_exit_settle_secs")]
    pub restart_exit_settle_secs: u64,
}

fn default_step_delay_ms() -> u64 {
    20
}
fn default_list_refresh_ms() -> u64 {
    100
}
fn default_detail_verify_ms() -> u64 {
    250
}
fn default_search_locate_ms() -> u64 {
    2000
}
fn default_goods_match_ms() -> u64 {
    2500
}
fn default_outcome_budget_ms() -> u64 {
    600
}
fn default_outcome_interval_ms() -> u64 {
    40
}
fn default_outcome_grace_ms() -> u64 {
    150
}
fn default_idle_poll_ms() -> u64 {
    1200
}
fn default_pause_poll_ms() -> u64 {
    200
}
fn default_attempt_gap_ms() -> u64 {
    20
}
fn default_restart_step_settle_secs() -> u64 {
    5
}
fn default_restart_exit_settle_secs() -> u64 {
    30
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            list_refresh_ms: default_list_refresh_ms(),
            detail_verify_ms: default_detail_verify_ms(),
            search_locate_ms: default_search_locate_ms(),
            goods_match_ms: default_goods_match_ms(),
            outcome_budget_ms: default_outcome_budget_ms(),
            outcome_interval_ms: default_outcome_interval_ms(),
            outcome_grace_ms: default_outcome_grace_ms(),
            idle_poll_ms: default_idle_poll_ms(),
            pause_poll_ms: default_pause_poll_ms(),
            attempt_gap_ms: default_attempt_gap_ms(),
            restart_step_settle_secs: default_restart_step_settle_secs(),
            restart_exit_settle_secs: default_restart_exit_settle_secs(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Environment-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default = "default_templates")]
    pub templates: HashMap<String, TemplateCfg>,
    #[serde(default)]
    pub price_area: PriceAreaConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub quantity: QuantityConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_templates() -> HashMap<String, TemplateCfg> {
    let entries: &[(&str, &str, f32)] = &[
        ("home_indicator", "images/home_indicator.png", 0.85),
        ("market_indicator", "images/market_indicator.png", 0.85),
        ("btn_launch", "images/btn_launch.png", 0.85),
        ("btn_home", "images/btn_home.png", 0.85),
        ("btn_market", "images/btn_market.png", 0.85),
        ("input_search", "images/input_search.png", 0.85),
        ("btn_search", "images/btn_search.png", 0.85),
        ("btn_buy", "images/btn_buy.png", 0.88),
        ("btn_close", "images/btn_close.png", 0.85),
        ("btn_max", "images/btn_max.png", 0.85),
        ("input_quantity", "images/input_quantity.png", 0.85),
        ("buy_ok", "images/buy_ok.png", 0.90),
        ("buy_fail", "images/buy_fail.png", 0.88),
        ("btn_settings", "images/btn_settings.png", 0.85),
        ("btn_exit", "images/btn_exit.png", 0.85),
        ("btn_exit_confirm", "images/btn_exit_confirm.png", 0.85),
        ("currency_icon", "images/currency_icon.png", 0.85),
    ];
    entries
        .iter()
        .map(|(key, path, confidence)| {
            (
                key.to_string(),
                TemplateCfg {
                    path: path.to_string(),
                    confidence: *confidence,
                },
            )
        })
        .collect()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game: GameConfig::default(),
            templates: default_templates(),
            price_area: PriceAreaConfig::default(),
            ocr: OcrConfig::default(),
            quantity: QuantityConfig::default(),
            timing: TimingConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config at {:?}", path.as_ref()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config at {:?}", path.as_ref()))
    }

    /// Default config location under the platform config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autobuyer")
            .join("config.json")
    }

    /// Look up a template entry by key.
    pub fn template(&self, key: &str) -> Option<&TemplateCfg> {
        self.templates.get(key)
    }
}

/// One purchase task as configured. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub id: String,
    /// Goods catalog reference.
    #[serde(default)]
    pub item_id: String,
    /// Display name; last resort of the search-keyword fallback chain.
    #[serde(default)]
    pub item_name: String,
    /// Queue priority; ties resolve by declaration order.
    #[serde(default)]
    pub order: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Normal-branch price ceiling; 0 disables the check.
    #[serde(default)]
    pub price_threshold: i64,
    /// Percentage allowance on top of the threshold.
    #[serde(default)]
    pub price_premium_pct: f64,
    /// Restock trigger price; 0 disables the restock branch.
    #[serde(default)]
    pub restock_price: i64,
    /// Total purchase goal; <=0 means unlimited.
    #[serde(default)]
    pub target_total: i64,
    /// Per-order quantity ceiling.
    #[serde(default = "default_max_per_order")]
    pub max_per_order: u32,
    /// Normal-branch quantity per attempt.
    #[serde(default = "default_quantity_per_attempt")]
    pub default_quantity: u32,
    /// Round-robin segment length.
    #[serde(default = "default_duration_min")]
    pub duration_min: u32,
    /// Window start "HH:MM"; empty = unbounded.
    #[serde(default)]
    pub time_start: String,
    /// Window end "HH:MM"; empty = unbounded, end < start crosses midnight.
    #[serde(default)]
    pub time_end: String,
}

fn default_enabled() -> bool {
    true
}
fn default_max_per_order() -> u32 {
    120
}
fn default_quantity_per_attempt() -> u32 {
    1
}
fn default_duration_min() -> u32 {
    10
}

/// The task document: mode selector, restart cadence, task list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub mode: SchedulerMode,
    /// Periodic soft-restart interval; <=0 disables restarts.
    #[serde(default)]
    pub restart_every_min: i64,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

impl TasksConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read tasks at {:?}", path.as_ref()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse tasks at {:?}", path.as_ref()))
    }
}

/// One goods catalog entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GoodsEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Preferred search keyword.
    #[serde(default)]
    pub search_name: String,
    /// Detail-entry visual reference used to match the result card.
    #[serde(default)]
    pub image_path: String,
    /// Category tag driving quantity-policy resolution.
    #[serde(default)]
    pub big_category: String,
    #[serde(default)]
    pub sub_category: String,
    /// Exchangeable goods render an extra row under the price.
    #[serde(default)]
    pub exchangeable: bool,
}

/// Load the goods catalog from a JSON array file.
pub fn load_goods<P: AsRef<Path>>(path: P) -> Result<Vec<GoodsEntry>> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read goods at {:?}", path.as_ref()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse goods at {:?}", path.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_app_config_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.game.startup_timeout_secs, 120);
        assert_eq!(config.price_area.distance_from_anchor, 5);
        assert_eq!(config.price_area.height, 45);
        assert_eq!(config.quantity.max_control_cap, 120);
        assert_eq!(config.quantity.fixed_manual_value, 5);
        assert_eq!(config.timing.outcome_budget_ms, 600);
        assert!(config.template("btn_buy").is_some());
        assert!((config.template("btn_buy").unwrap().confidence - 0.88).abs() < 1e-6);
    }

    #[test]
    fn test_partial_config_takes_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"game": {"exe_path": "C:/launcher.exe"}}"#).unwrap();
        assert_eq!(config.game.exe_path, "C:/launcher.exe");
        assert_eq!(config.game.launch_click_delay_secs, 20);
        assert_eq!(config.ocr.base_url, "http://127.0.0.1:1224");
        assert!(config.template("market_indicator").is_some());
    }

    #[test]
    fn test_task_definition_defaults() {
        let task: TaskDefinition = serde_json::from_str(r#"{"item_id": "g-1"}"#).unwrap();
        assert!(task.enabled);
        assert_eq!(task.max_per_order, 120);
        assert_eq!(task.default_quantity, 1);
        assert_eq!(task.duration_min, 10);
        assert_eq!(task.target_total, 0);
    }

    #[test]
    fn test_tasks_config_mode_parsing() {
        let tasks: TasksConfig = serde_json::from_str(r#"{"mode": "round"}"#).unwrap();
        assert_eq!(tasks.mode, SchedulerMode::Round);
        let tasks: TasksConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(tasks.mode, SchedulerMode::Time);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mode": "round", "restart_every_min": 30, "tasks": [{{"item_id": "g-1", "order": 2}}]}}"#
        )
        .unwrap();

        let tasks = TasksConfig::load(file.path()).unwrap();
        assert_eq!(tasks.mode, SchedulerMode::Round);
        assert_eq!(tasks.restart_every_min, 30);
        assert_eq!(tasks.tasks.len(), 1);
        assert_eq!(tasks.tasks[0].order, 2);
    }

    #[test]
    fn test_load_goods_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "g-1", "name": "5.56 rounds", "search_name": "5.56", "big_category": "ammo"}}]"#
        )
        .unwrap();

        let goods = load_goods(file.path()).unwrap();
        assert_eq!(goods.len(), 1);
        assert_eq!(goods[0].big_category, "ammo");
        assert!(!goods[0].exchangeable);
    }
}
