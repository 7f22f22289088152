//! # notesync-core — replicated note content
//!
//! Holds the CRDT side of a collaborative note: one [`SharedDocument`] per
//! note with four independently mergeable containers, the adapters that map
//! editor values onto those containers, and the page-structure domain that
//! orders a note's sub-pages.
//!
//! ```text
//! editor value ──► ModeSyncAdapter::sync_to_local ──► SharedDocument (txn + origin)
//!                                                          │
//!                                               observe_updates (delta bytes)
//!                                                          │
//! editor value ◄── AdapterCallbacks::on_content_change ◄───┘ (remote origins only)
//! ```
//!
//! Networking lives in `notesync-collab`; nothing here suspends.

pub mod adapter;
pub mod document;
pub mod origin;
pub mod pages;

pub use adapter::{
    AdapterCallbacks, ContentMode, FrameAdapter, FrameMode, ModeSyncAdapter, ObserverHandle,
    StrokeAdapter, StrokeMode, TextAdapter, TextMode,
};
pub use document::{ContainerHandle, ContainerName, Containers, DocumentError, SharedDocument};
pub use origin::{LocalOrigin, TxnOrigin};
pub use pages::{PageIdsDiff, PageStructure};

use serde::{Deserialize, Serialize};

/// Editing mode of a note; one adapter exists per mode.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EditingMode {
    Word,
    Ppt,
    Handwrite,
}

/// Viewport or recorded page size in page-relative units.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct PageDimensions {
    pub width: f64,
    pub height: f64,
}

impl PageDimensions {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    fn scale_from(&self, base_width: Option<f64>, base_height: Option<f64>) -> (f64, f64) {
        let bw = base_width.filter(|w| *w > 0.0).unwrap_or(self.width);
        let bh = base_height.filter(|h| *h > 0.0).unwrap_or(self.height);
        (self.width / bw, self.height / bh)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Text,
    Image,
    Graph,
    Video,
    Table,
    Shape,
}

/// A slide-like frame. Stored as one JSON record per element of the
/// `frames` array; the whole list is replaced on every local write.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub z_index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub locked: bool,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_height: Option<f64>,
}

impl Frame {
    pub fn new(id: impl Into<String>, kind: FrameType, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            x,
            y,
            width,
            height,
            z_index: 0,
            content: None,
            url: None,
            locked: false,
            created_at: 0,
            base_width: None,
            base_height: None,
        }
    }

    /// Record the page size this frame's geometry was authored against.
    pub fn with_base(mut self, base: PageDimensions) -> Self {
        self.base_width = Some(base.width);
        self.base_height = Some(base.height);
        self
    }

    /// Geometry mapped from the recorded base page size onto `viewport`.
    pub fn rescaled(&self, viewport: PageDimensions) -> Frame {
        let (sx, sy) = viewport.scale_from(self.base_width, self.base_height);
        Frame {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
            ..self.clone()
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StrokePoint {
    pub x: f64,
    pub y: f64,
    pub pressure: f64,
    pub color: String,
    pub width: f64,
    pub timestamp: u64,
}

/// A freehand ink stroke, replaced wholesale like [`Frame`].
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stroke {
    pub id: String,
    pub points: Vec<StrokePoint>,
    pub color: String,
    pub width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_height: Option<f64>,
}

impl Stroke {
    pub fn new(id: impl Into<String>, color: impl Into<String>, width: f64) -> Self {
        Self {
            id: id.into(),
            points: Vec::new(),
            color: color.into(),
            width,
            base_width: None,
            base_height: None,
        }
    }

    pub fn with_base(mut self, base: PageDimensions) -> Self {
        self.base_width = Some(base.width);
        self.base_height = Some(base.height);
        self
    }

    /// Points mapped from the recorded base page size onto `viewport`.
    pub fn rescaled(&self, viewport: PageDimensions) -> Stroke {
        let (sx, sy) = viewport.scale_from(self.base_width, self.base_height);
        Stroke {
            points: self
                .points
                .iter()
                .map(|p| StrokePoint { x: p.x * sx, y: p.y * sy, ..p.clone() })
                .collect(),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_json_uses_camel_case() {
        let frame = Frame::new("f1", FrameType::Text, 1.0, 2.0, 3.0, 4.0)
            .with_base(PageDimensions::new(1280.0, 720.0));
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        assert!(json.contains("\"zIndex\":0"));
        assert!(json.contains("\"baseWidth\":1280.0"));
        assert!(!json.contains("url"));

        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_frame_rescaled_to_viewport() {
        let frame = Frame::new("f1", FrameType::Shape, 100.0, 50.0, 200.0, 100.0)
            .with_base(PageDimensions::new(1000.0, 500.0));
        let scaled = frame.rescaled(PageDimensions::new(500.0, 1000.0));
        assert_eq!(scaled.x, 50.0);
        assert_eq!(scaled.y, 100.0);
        assert_eq!(scaled.width, 100.0);
        assert_eq!(scaled.height, 200.0);
        assert_eq!(scaled.id, "f1");
    }

    #[test]
    fn test_rescale_without_base_is_identity() {
        let frame = Frame::new("f1", FrameType::Image, 10.0, 20.0, 30.0, 40.0);
        assert_eq!(frame.rescaled(PageDimensions::new(640.0, 480.0)), frame);
    }

    #[test]
    fn test_stroke_rescaled_scales_points_only() {
        let mut stroke = Stroke::new("s1", "#000", 2.0).with_base(PageDimensions::new(100.0, 100.0));
        stroke.points.push(StrokePoint {
            x: 10.0,
            y: 20.0,
            pressure: 0.5,
            color: "#000".into(),
            width: 2.0,
            timestamp: 7,
        });
        let scaled = stroke.rescaled(PageDimensions::new(200.0, 50.0));
        assert_eq!(scaled.points[0].x, 20.0);
        assert_eq!(scaled.points[0].y, 10.0);
        assert_eq!(scaled.points[0].width, 2.0);
        assert_eq!(scaled.width, 2.0);
    }

    #[test]
    fn test_editing_mode_serde() {
        assert_eq!(serde_json::to_string(&EditingMode::Handwrite).unwrap(), "\"handwrite\"");
    }
}
