use crate::core::geo::LngLat;
use crate::tiles::selector::Selector;
use serde::{Deserialize, Serialize};

/// Size of the map viewport in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewportSize {
    pub width: f64,
    pub height: f64,
}

impl ViewportSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        !(self.width > 0.0 && self.height > 0.0)
    }
}

impl Default for ViewportSize {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Camera state pushed by the map widget on every move.
///
/// `zoom` is the continuous map zoom; the pyramid level is derived from it and
/// clamped to the pyramid's maximum zoom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraUpdate {
    pub center: LngLat,
    pub zoom: f64,
    pub viewport: ViewportSize,
    /// Replaces the current selector when present
    #[serde(default)]
    pub selector: Option<Selector>,
}

impl CameraUpdate {
    pub fn new(center: LngLat, zoom: f64, viewport: ViewportSize) -> Self {
        Self {
            center,
            zoom,
            viewport,
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }
}
