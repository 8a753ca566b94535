//! Engine configuration
//!
//! Persistent settings for the composer, stored as JSON under the platform
//! config directory. Everything has a default so a missing or partial file
//! still yields a runnable engine.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::layer::LayerProperties;
use crate::media::{DecodeOptions, HardwarePreference};
use crate::sync::mtc::MidiClockConvert;

/// One configured layer: which cue it belongs to, what it plays and how it
/// is displayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Cue identifier; also the key for async load/cancel.
    pub cue_id: String,
    /// File path or stream URL.
    pub path: String,
    /// Follow the MTC clock (false = manual transport control).
    pub follow_sync: bool,
    pub properties: LayerProperties,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            cue_id: String::new(),
            path: String::new(),
            follow_sync: true,
            properties: LayerProperties::default(),
        }
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // === Decoding ===
    /// Hardware decode backend selection.
    pub hardware_decoder: HardwarePreference,

    /// Skip the packet-scan frame index (timestamp seeks only).
    pub want_noindex: bool,

    /// Allow block-coded sources to upload straight to GPU textures.
    pub direct_gpu_upload: bool,

    /// How long a live source waits for its first frame at open (ms).
    pub live_initial_wait_ms: u64,

    // === Timing ===
    /// Project frame rate the engine ticks at.
    pub project_fps: f64,

    /// Format timecode strings as drop-frame.
    pub want_dropframes: bool,

    // === MIDI sync ===
    /// MIDI driver name ("midir", "None").
    pub midi_driver: String,

    /// MIDI port id; "-1" autodetects.
    pub midi_port: String,

    /// How MTC timecode maps onto the project rate.
    pub midi_clk_convert: MidiClockConvert,

    /// Quarter-frame jitter smoothing + stuck-transport reset.
    pub midi_clock_adjust: bool,

    // === Logging ===
    pub verbose: bool,

    // === Layers ===
    pub layers: Vec<LayerConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hardware_decoder: HardwarePreference::Auto,
            want_noindex: false,
            direct_gpu_upload: true,
            live_initial_wait_ms: 2000,
            project_fps: 25.0,
            want_dropframes: false,
            midi_driver: "midir".to_string(),
            midi_port: "-1".to_string(),
            midi_clk_convert: MidiClockConvert::UseMtcFps,
            midi_clock_adjust: false,
            verbose: false,
            layers: Vec::new(),
        }
    }
}

impl Settings {
    /// Default config file location.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stagecomposer")
            .join("config.json")
    }

    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    /// The slice of settings the media stack consumes.
    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            hardware: self.hardware_decoder,
            no_index: self.want_noindex,
            direct_gpu_upload: self.direct_gpu_upload,
            live_initial_wait_ms: self.live_initial_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.hardware_decoder, HardwarePreference::Auto);
        assert_eq!(settings.project_fps, 25.0);
        assert_eq!(settings.midi_port, "-1");
        assert_eq!(settings.midi_clk_convert, MidiClockConvert::UseMtcFps);
        assert!(settings.layers.is_empty());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"project_fps": 30.0, "hardware_decoder": "software"}"#)
                .unwrap();
        assert_eq!(settings.project_fps, 30.0);
        assert_eq!(settings.hardware_decoder, HardwarePreference::SoftwareOnly);
        // Everything else defaulted
        assert_eq!(settings.midi_driver, "midir");
    }

    #[test]
    fn round_trips_through_json() {
        let mut settings = Settings::default();
        settings.layers.push(LayerConfig {
            cue_id: "cue-7".into(),
            path: "/media/show/opening.mov".into(),
            follow_sync: true,
            properties: LayerProperties {
                z_order: 3,
                opacity: 0.5,
                ..Default::default()
            },
        });

        let text = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(back.layers.len(), 1);
        assert_eq!(back.layers[0].cue_id, "cue-7");
        assert_eq!(back.layers[0].properties.z_order, 3);
    }
}
