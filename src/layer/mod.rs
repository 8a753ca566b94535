//! Video layers
//!
//! A layer couples a playback state machine (`LayerPlayback`, which owns
//! the input source and its sync clock) with display preparation
//! (`LayerDisplay`, which applies the per-layer transforms) under a set of
//! `LayerProperties`.

pub mod display;
pub mod playback;
pub mod processor;

pub use display::{LayerDisplay, PreparedFrame};
pub use playback::LayerPlayback;
pub use processor::{CpuImageProcessor, GpuImageProcessor, TRANSFORM_EPSILON};

use serde::{Deserialize, Serialize};

/// Crop rectangle in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// How a layer blends over the layers below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
}

/// Display properties of one layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerProperties {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// 0.0 (transparent) to 1.0 (opaque)
    pub opacity: f32,
    pub z_order: i32,
    pub visible: bool,
    pub scale_x: f32,
    pub scale_y: f32,
    pub rotation_degrees: f32,
    pub crop: Option<CropRect>,
    /// Half-width crop with an adjustable horizontal pan
    pub panorama_enabled: bool,
    pub pan_offset: i32,
    pub blend_mode: BlendMode,
}

impl Default for LayerProperties {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            opacity: 1.0,
            z_order: 0,
            visible: true,
            scale_x: 1.0,
            scale_y: 1.0,
            rotation_degrees: 0.0,
            crop: None,
            panorama_enabled: false,
            pan_offset: 0,
            blend_mode: BlendMode::Normal,
        }
    }
}
