//! Engine
//!
//! The single-threaded per-tick loop tying the subsystems together:
//! poll completed loads, update every layer from its sync clock, prepare
//! each layer's display frame and hand the visible set to the compositor.
//! All GPU work happens on this thread; file opens run on the loader
//! worker, decode on the per-source queue threads.

pub mod config;

pub use config::{LayerConfig, Settings};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::MediaResult;
use crate::layer::{LayerDisplay, LayerPlayback, LayerProperties, PreparedFrame};
use crate::media::gpu::GpuContext;
use crate::media::{AsyncVideoLoader, FrameInfo, InputSource};
use crate::sync::{MidiSyncSource, SyncSource};

/// One visible layer as handed to the compositor, ascending z-order.
pub struct ComposedLayer<'a> {
    pub cue_id: &'a str,
    pub frame: PreparedFrame<'a>,
    pub properties: &'a LayerProperties,
    /// Source description, for aspect correction.
    pub info: FrameInfo,
}

/// The external renderer. Owns shaders, vertex state and the projection
/// homography; the engine only delivers frames, properties and flags.
pub trait Compositor {
    fn compose(&mut self, layers: &[ComposedLayer<'_>]) -> MediaResult<()>;
}

/// Discards every frame; stands in for a renderer in headless runs and
/// tests.
#[derive(Debug, Default)]
pub struct NullCompositor {
    pub frames_composed: u64,
    pub layers_seen: u64,
}

impl Compositor for NullCompositor {
    fn compose(&mut self, layers: &[ComposedLayer<'_>]) -> MediaResult<()> {
        self.frames_composed += 1;
        self.layers_seen += layers.len() as u64;
        Ok(())
    }
}

/// A video layer: playback state, display preparation and properties.
pub struct Layer {
    pub cue_id: String,
    pub properties: LayerProperties,
    pub playback: LayerPlayback,
    pub display: LayerDisplay,
}

type AttachQueue = Arc<Mutex<Vec<(String, Box<dyn InputSource>)>>>;

pub struct Engine {
    settings: Settings,
    gpu: Option<Arc<GpuContext>>,
    loader: AsyncVideoLoader,
    layers: Vec<Layer>,
    /// Sources completed by the loader, waiting to be attached on the
    /// next tick.
    completed_sources: AttachQueue,
}

impl Engine {
    /// Build an engine from settings, creating the GPU context (falling
    /// back to CPU-only operation when none is available) and queueing
    /// loads for every configured layer.
    pub fn new(settings: Settings) -> Self {
        let gpu = match GpuContext::new() {
            Ok(gpu) => Some(gpu),
            Err(e) => {
                log::warn!("Engine: no GPU context ({e}); block-coded and zero-copy paths off");
                None
            }
        };
        Self::with_gpu(settings, gpu)
    }

    pub fn with_gpu(settings: Settings, gpu: Option<Arc<GpuContext>>) -> Self {
        let loader = AsyncVideoLoader::new(settings.decode_options(), gpu.clone());

        let mut engine = Self {
            settings: settings.clone(),
            gpu,
            loader,
            layers: Vec::new(),
            completed_sources: Arc::new(Mutex::new(Vec::new())),
        };

        for layer_config in &settings.layers {
            engine.add_layer(layer_config.clone());
        }
        engine
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn gpu(&self) -> Option<&Arc<GpuContext>> {
        self.gpu.as_ref()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Layer] {
        &mut self.layers
    }

    pub fn layer_mut(&mut self, cue_id: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.cue_id == cue_id)
    }

    /// Add a layer and queue its media for async loading.
    pub fn add_layer(&mut self, layer_config: LayerConfig) {
        let mut playback = LayerPlayback::new(self.gpu.clone());
        playback.set_follow_sync(layer_config.follow_sync);
        if layer_config.follow_sync {
            playback.set_sync(self.build_sync());
        }

        let layer = Layer {
            cue_id: layer_config.cue_id.clone(),
            properties: layer_config.properties.clone(),
            playback,
            display: LayerDisplay::new(),
        };
        self.layers.push(layer);

        if !layer_config.path.is_empty() {
            self.request_media(&layer_config.cue_id, &layer_config.path);
        }
    }

    /// Kick off (or replace) a layer's media through the loader.
    pub fn request_media(&self, cue_id: &str, path: &str) {
        let completed = self.completed_sources.clone();
        self.loader.request(
            cue_id,
            path,
            Box::new(move |cue, path, source, success| {
                match source {
                    Some(source) if success => {
                        completed.lock().push((cue.to_string(), source));
                    }
                    _ => {
                        log::warn!("Engine: load of '{path}' for cue {cue} failed");
                    }
                }
            }),
        );
    }

    pub fn cancel_media(&self, cue_id: &str) {
        self.loader.cancel(cue_id);
    }

    /// One MTC sync source per layer, configured from settings. Every
    /// layer polls the same MIDI port; the driver serializes access.
    fn build_sync(&self) -> Option<Box<dyn SyncSource>> {
        if self.settings.midi_driver.eq_ignore_ascii_case("none") {
            return None;
        }

        let mut sync = MidiSyncSource::new();
        if !sync.choose_driver(&self.settings.midi_driver) {
            log::warn!(
                "Engine: MIDI driver '{}' unavailable, layer will not follow timecode",
                self.settings.midi_driver
            );
            return None;
        }
        sync.set_framerate(self.settings.project_fps);
        sync.set_clock_adjustment(self.settings.midi_clock_adjust);
        sync.set_clock_convert(self.settings.midi_clk_convert);

        if let Err(e) = sync.connect(&self.settings.midi_port) {
            // Keep the source; it acts as a null clock until reconnected
            log::warn!(
                "Engine: MIDI port '{}' not available ({e}); continuing without timecode",
                self.settings.midi_port
            );
        }
        Some(Box::new(sync))
    }

    /// Attach sources completed by the loader since the last tick.
    fn attach_completed_sources(&mut self) {
        let mut completed = self.completed_sources.lock();
        for (cue_id, source) in completed.drain(..) {
            match self.layers.iter_mut().find(|l| l.cue_id == cue_id) {
                Some(layer) => {
                    log::info!("Engine: attaching loaded source to cue {cue_id}");
                    layer.playback.set_input(source);
                }
                None => {
                    log::warn!("Engine: no layer for completed cue {cue_id}, dropping source");
                }
            }
        }
    }

    /// One display cycle.
    pub fn tick(&mut self, compositor: &mut dyn Compositor) -> MediaResult<()> {
        self.loader.poll_completed();
        self.attach_completed_sources();

        // Compositor wants ascending z-order; sort is stable so equal z
        // keeps insertion order
        self.layers.sort_by_key(|l| l.properties.z_order);

        for layer in self.layers.iter_mut() {
            layer.playback.update();
        }

        let mut composed: Vec<ComposedLayer<'_>> = Vec::with_capacity(self.layers.len());
        for layer in self.layers.iter_mut() {
            let Layer {
                cue_id,
                properties,
                playback,
                display,
            } = layer;

            if !properties.visible || !playback.is_ready() {
                continue;
            }

            let info = playback.frame_info();
            let (on_gpu, cpu_frame, gpu_frame) = playback.frame_buffers();
            match display.prepare(cpu_frame, gpu_frame, on_gpu, properties) {
                Ok(frame) => composed.push(ComposedLayer {
                    cue_id: cue_id.as_str(),
                    frame,
                    properties,
                    info,
                }),
                // A layer with no frame yet just stays off screen
                Err(crate::error::MediaError::NotReady) => {}
                Err(e) => {
                    log::debug!("Engine: prepare failed for cue {cue_id}: {e}");
                }
            }
        }

        compositor.compose(&composed)
    }

    /// Run the tick loop at the project rate until `running` turns false.
    pub fn run(
        &mut self,
        compositor: &mut dyn Compositor,
        running: &std::sync::atomic::AtomicBool,
    ) {
        let frame_duration = Duration::from_secs_f64(1.0 / self.settings.project_fps.max(1.0));
        log::info!(
            "Engine: running at {:.3} fps with {} layer(s)",
            self.settings.project_fps,
            self.layers.len()
        );

        while running.load(std::sync::atomic::Ordering::SeqCst) {
            let started = Instant::now();

            if let Err(e) = self.tick(compositor) {
                // Per-tick failures never stop the show
                log::warn!("Engine: tick failed: {e}");
            }

            let elapsed = started.elapsed();
            if elapsed < frame_duration {
                std::thread::sleep(frame_duration - elapsed);
            }
        }
        log::info!("Engine: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_without_gpu(settings: Settings) -> Engine {
        Engine::with_gpu(settings, None)
    }

    #[test]
    fn empty_engine_ticks() {
        let mut engine = engine_without_gpu(Settings::default());
        let mut compositor = NullCompositor::default();
        engine.tick(&mut compositor).unwrap();
        assert_eq!(compositor.frames_composed, 1);
        assert_eq!(compositor.layers_seen, 0);
    }

    #[test]
    fn layers_sort_by_z_order() {
        let mut settings = Settings::default();
        settings.midi_driver = "none".into();
        for (cue, z) in [("back", 5), ("front", 10), ("middle", 7)] {
            settings.layers.push(LayerConfig {
                cue_id: cue.into(),
                path: String::new(),
                follow_sync: false,
                properties: LayerProperties {
                    z_order: z,
                    ..Default::default()
                },
            });
        }

        let mut engine = engine_without_gpu(settings);
        let mut compositor = NullCompositor::default();
        engine.tick(&mut compositor).unwrap();

        let order: Vec<&str> = engine.layers().iter().map(|l| l.cue_id.as_str()).collect();
        assert_eq!(order, vec!["back", "middle", "front"]);
    }

    #[test]
    fn layer_lookup_by_cue() {
        let mut settings = Settings::default();
        settings.midi_driver = "none".into();
        settings.layers.push(LayerConfig {
            cue_id: "cue-1".into(),
            ..Default::default()
        });

        let mut engine = engine_without_gpu(settings);
        assert!(engine.layer_mut("cue-1").is_some());
        assert!(engine.layer_mut("cue-404").is_none());
    }
}
