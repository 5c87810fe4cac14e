//! Scripted capability fakes shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::capability::{OcrEngine, Point, ProcessControl, Region, ScreenDriver, Template};
use crate::error::OcrError;

/// A screen driver driven by per-template scripts.
///
/// `locate` first drains any queued one-shot responses for the template,
/// then falls back to the steady-state visibility map. Clicks, typed text
/// and captures are recorded for assertions.
#[derive(Default)]
pub struct ScriptedScreen {
    queued: Mutex<HashMap<Template, VecDeque<Option<Region>>>>,
    visible: Mutex<HashMap<Template, Region>>,
    images: Mutex<HashMap<String, Region>>,
    pub clicks: Mutex<Vec<Point>>,
    pub typed: Mutex<Vec<String>>,
    pub captures: Mutex<Vec<Region>>,
}

impl ScriptedScreen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a template as steadily visible at `region`.
    pub fn show(&self, template: Template, region: Region) {
        self.visible.lock().unwrap().insert(template, region);
    }

    /// Queue one-shot locate responses consumed before the steady state.
    pub fn queue(&self, template: Template, responses: Vec<Option<Region>>) {
        self.queued
            .lock()
            .unwrap()
            .entry(template)
            .or_default()
            .extend(responses);
    }

    /// Register a goods-image match.
    pub fn set_image(&self, path: &str, region: Region) {
        self.images.lock().unwrap().insert(path.to_string(), region);
    }

    pub fn click_count(&self) -> usize {
        self.clicks.lock().unwrap().len()
    }

    pub fn clicks_at(&self, point: Point) -> usize {
        self.clicks.lock().unwrap().iter().filter(|p| **p == point).count()
    }
}

#[async_trait]
impl ScreenDriver for ScriptedScreen {
    async fn locate(&self, template: Template) -> Option<Region> {
        if let Some(queue) = self.queued.lock().unwrap().get_mut(&template) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        self.visible.lock().unwrap().get(&template).copied()
    }

    async fn locate_image(&self, path: &str, _confidence: f32) -> Option<Region> {
        self.images.lock().unwrap().get(path).copied()
    }

    async fn click(&self, point: Point) {
        self.clicks.lock().unwrap().push(point);
    }

    async fn type_text(&self, text: &str, _clear_first: bool) {
        self.typed.lock().unwrap().push(text.to_string());
    }

    async fn move_to(&self, _point: Point) {}

    async fn capture(&self, region: Region) -> Option<Vec<u8>> {
        self.captures.lock().unwrap().push(region);
        Some(vec![0u8; 8])
    }

    async fn screen_size(&self) -> (u32, u32) {
        (1920, 1080)
    }
}

/// An OCR engine returning queued results, then repeating the last one.
pub struct ScriptedOcr {
    results: Mutex<VecDeque<Result<String, OcrError>>>,
    last: Mutex<Option<String>>,
}

impl ScriptedOcr {
    pub fn new(results: Vec<Result<String, OcrError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            last: Mutex::new(None),
        }
    }

    pub fn reading(text: &str) -> Self {
        Self::new(vec![Ok(text.to_string())])
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize(&self, _image_png: &[u8]) -> Result<String, OcrError> {
        let next = self.results.lock().unwrap().pop_front();
        match next {
            Some(Ok(text)) => {
                *self.last.lock().unwrap() = Some(text.clone());
                Ok(text)
            }
            Some(Err(e)) => Err(e),
            None => Ok(self.last.lock().unwrap().clone().unwrap_or_default()),
        }
    }
}

/// Process control that records spawn/terminate calls.
#[derive(Default)]
pub struct FakeProcess {
    pub spawns: Mutex<Vec<(String, String)>>,
    pub terminations: Mutex<usize>,
    pub fail_spawn: bool,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn termination_count(&self) -> usize {
        *self.terminations.lock().unwrap()
    }
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn spawn(&self, path: &str, args: &str, _cwd: Option<&Path>) -> anyhow::Result<()> {
        if self.fail_spawn {
            anyhow::bail!("spawn refused");
        }
        self.spawns
            .lock()
            .unwrap()
            .push((path.to_string(), args.to_string()));
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        *self.terminations.lock().unwrap() += 1;
        Ok(())
    }
}
