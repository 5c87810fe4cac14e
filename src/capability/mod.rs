//! Capability seams toward the external target.
//!
//! The runner never talks to the screen, the OCR service, or the game
//! process directly; it goes through the traits defined here. The vision
//! backend (template matching, screenshots) and input injection live in
//! the embedding application; this crate ships an HTTP OCR client and a
//! process launcher because both are plain protocol plumbing.

mod ocr;
mod process;
mod screen;

pub use ocr::{OcrEngine, OcrService, UmiHttpOcr};
pub use process::{LauncherProcess, ProcessControl};
pub use screen::ScreenDriver;

use serde::{Deserialize, Serialize};

/// A screen coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// An on-screen axis-aligned box (left, top, width, height).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Center point, where clicks land.
    pub fn center(&self) -> Point {
        Point {
            x: self.left + self.width as i32 / 2,
            y: self.top + self.height as i32 / 2,
        }
    }
}

/// The closed set of visual references the runner navigates by.
///
/// Each variant maps to one entry in the `templates` table of
/// [`crate::config::AppConfig`]; per-goods detail-entry images are looked
/// up by path instead and are not part of this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// Home screen is on top.
    HomeIndicator,
    /// Market screen is on top and interactable.
    MarketIndicator,
    /// Launcher's start button.
    LaunchButton,
    HomeButton,
    MarketButton,
    SearchInput,
    SearchButton,
    /// Detail-view submit (buy) control.
    BuyButton,
    /// Detail-view close control.
    CloseButton,
    /// Maximum-quantity control, present for some categories only.
    MaxButton,
    QuantityInput,
    /// Purchase success marker.
    BuyOk,
    /// Purchase failure marker.
    BuyFail,
    SettingsButton,
    ExitButton,
    ExitConfirmButton,
    /// Price-row currency icon, fallback anchor for the price region.
    CurrencyIcon,
}

impl Template {
    /// Config key for this template.
    pub fn key(&self) -> &'static str {
        match self {
            Self::HomeIndicator => "home_indicator",
            Self::MarketIndicator => "market_indicator",
            Self::LaunchButton => "btn_launch",
            Self::HomeButton => "btn_home",
            Self::MarketButton => "btn_market",
            Self::SearchInput => "input_search",
            Self::SearchButton => "btn_search",
            Self::BuyButton => "btn_buy",
            Self::CloseButton => "btn_close",
            Self::MaxButton => "btn_max",
            Self::QuantityInput => "input_quantity",
            Self::BuyOk => "buy_ok",
            Self::BuyFail => "buy_fail",
            Self::SettingsButton => "btn_settings",
            Self::ExitButton => "btn_exit",
            Self::ExitConfirmButton => "btn_exit_confirm",
            Self::CurrencyIcon => "currency_icon",
        }
    }
}
