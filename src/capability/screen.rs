//! Screen interaction seam.
//!
//! Implemented by the embedding application on top of its template
//! matcher and input injector. All methods are single-pass; bounded
//! retry lives in [`crate::poll`] so every wait is an explicit policy.

use async_trait::async_trait;

use super::{Point, Region, Template};

/// Visual locate / input capability.
#[async_trait]
pub trait ScreenDriver: Send + Sync {
    /// One template-match pass. `None` when not visible or the template
    /// is not configured.
    async fn locate(&self, template: Template) -> Option<Region>;

    /// One match pass against an arbitrary image file (goods cards).
    async fn locate_image(&self, path: &str, confidence: f32) -> Option<Region>;

    /// Click at a point.
    async fn click(&self, point: Point);

    /// Type into the focused control, optionally clearing it first.
    async fn type_text(&self, text: &str, clear_first: bool);

    /// Move the cursor without clicking (parking it out of the way).
    async fn move_to(&self, point: Point);

    /// Capture a region as encoded image bytes (PNG) for OCR.
    async fn capture(&self, region: Region) -> Option<Vec<u8>>;

    /// Full screen dimensions.
    async fn screen_size(&self) -> (u32, u32);
}
