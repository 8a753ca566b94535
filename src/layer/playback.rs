//! Layer playback state machine
//!
//! Owns the layer's input source, its (optional) sync source and the two
//! frame buffers (host and GPU). On every engine tick `update` transforms
//! the sync clock's frame index through the layer's time scale and offset,
//! clamps it to the media duration and drives the decoder.
//!
//! Rolling/log/clamp state is per layer (instance fields, deliberately not
//! shared): each layer tracks its own transport independently.

use std::sync::Arc;

use crate::error::{MediaError, MediaResult};
use crate::media::gpu::GpuContext;
use crate::media::{DecodeBackend, FrameBuffer, FrameInfo, GpuTextureFrame, InputSource};
use crate::sync::mtc::frame_to_smpte_string;
use crate::sync::SyncSource;

pub struct LayerPlayback {
    input: Option<Box<dyn InputSource>>,
    sync: Option<Box<dyn SyncSource>>,
    gpu: Option<Arc<GpuContext>>,

    cpu_buffer: FrameBuffer,
    gpu_buffer: GpuTextureFrame,
    frame_on_gpu: bool,

    current_frame: i64,
    last_sync_frame: i64,
    time_offset: i64,
    time_scale: f64,
    playing: bool,
    follow_sync: bool,

    // Per-layer transport bookkeeping
    was_rolling: bool,
    last_logged_frame: i64,
    debug_counter: u64,
    logged_exceeded_duration: bool,
}

impl Default for LayerPlayback {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LayerPlayback {
    pub fn new(gpu: Option<Arc<GpuContext>>) -> Self {
        Self {
            input: None,
            sync: None,
            gpu,
            cpu_buffer: FrameBuffer::new(),
            gpu_buffer: GpuTextureFrame::new(),
            frame_on_gpu: false,
            current_frame: -1,
            last_sync_frame: -1,
            time_offset: 0,
            time_scale: 1.0,
            playing: false,
            follow_sync: true,
            was_rolling: false,
            last_logged_frame: -1,
            debug_counter: 0,
            logged_exceeded_duration: false,
        }
    }

    /// Attach a new input source, replacing (and closing) any previous one.
    pub fn set_input(&mut self, input: Box<dyn InputSource>) {
        self.pause();
        self.input = Some(input);
        self.current_frame = -1;
        self.last_sync_frame = -1;
        self.frame_on_gpu = false;
        self.logged_exceeded_duration = false;
    }

    pub fn clear_input(&mut self) {
        self.pause();
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        self.current_frame = -1;
        self.last_sync_frame = -1;
        self.frame_on_gpu = false;
    }

    pub fn set_sync(&mut self, sync: Option<Box<dyn SyncSource>>) {
        self.sync = sync;
        self.last_sync_frame = -1;
    }

    pub fn sync_mut(&mut self) -> Option<&mut Box<dyn SyncSource>> {
        self.sync.as_mut()
    }

    pub fn play(&mut self) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.playing = true;
        true
    }

    pub fn pause(&mut self) {
        self.playing = false;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_ready(&self) -> bool {
        self.input.as_ref().map(|i| i.is_ready()).unwrap_or(false)
    }

    pub fn set_time_offset(&mut self, offset: i64) {
        self.time_offset = offset;
    }

    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    pub fn set_time_scale(&mut self, scale: f64) {
        self.time_scale = scale;
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    pub fn set_follow_sync(&mut self, follow: bool) {
        self.follow_sync = follow;
    }

    pub fn current_frame(&self) -> i64 {
        self.current_frame
    }

    pub fn frame_info(&self) -> FrameInfo {
        self.input
            .as_ref()
            .map(|i| i.frame_info())
            .unwrap_or_default()
    }

    /// Manual position change (also used as the retry path when a load
    /// fails mid-sync).
    pub fn seek(&mut self, frame_index: i64) -> bool {
        let Some(input) = self.input.as_mut() else {
            return false;
        };
        match input.seek(frame_index) {
            Ok(()) => {
                self.current_frame = frame_index;
                self.last_sync_frame = -1;
                true
            }
            Err(e) => {
                log::warn!("LayerPlayback: seek to {frame_index} failed: {e}");
                false
            }
        }
    }

    /// Reverse playback direction, keeping the currently shown frame on
    /// screen at the moment of reversal: the offset is rebased around the
    /// sync position that produced the current frame.
    pub fn reverse(&mut self) {
        if self.current_frame >= 0 && self.time_scale.abs() > f64::EPSILON {
            let sync_position =
                ((self.current_frame - self.time_offset) as f64 / self.time_scale).round();
            self.time_scale = -self.time_scale;
            self.time_offset =
                self.current_frame - (sync_position * self.time_scale).floor() as i64;
        } else {
            self.time_scale = -self.time_scale;
        }
    }

    /// Per-tick update: poll the sync source and load whatever frame it
    /// demands. Without a connected sync source the layer is under manual
    /// control and nothing happens here.
    pub fn update(&mut self) {
        if !self.is_ready() {
            return;
        }
        if self.sync.as_ref().map(|s| s.is_connected()).unwrap_or(false) {
            self.update_from_sync();
        }
    }

    fn update_from_sync(&mut self) {
        if !self.follow_sync {
            return;
        }

        let (sync_frame, rolling) = match self.sync.as_mut() {
            Some(sync) => sync.poll_frame(),
            None => return,
        };

        self.debug_counter += 1;
        if self.debug_counter % 60 == 0 {
            log::trace!("LayerPlayback: sync frame {sync_frame}, rolling {rolling}");
        }

        if rolling && !self.was_rolling {
            log::info!("LayerPlayback: transport rolling, playback starting (frame {sync_frame})");
            self.was_rolling = true;
        } else if !rolling && self.was_rolling {
            log::info!("LayerPlayback: transport stopped");
            self.was_rolling = false;
        }

        // Auto-play: any timecode (rolling or parked position) starts the
        // layer; losing both pauses it.
        if (rolling || sync_frame >= 0) && !self.playing {
            self.playing = true;
        }
        if sync_frame < 0 && !rolling && self.playing {
            self.playing = false;
        }

        if sync_frame >= 0 {
            self.log_timecode(sync_frame, rolling);

            let mut adjusted =
                (sync_frame as f64 * self.time_scale).floor() as i64 + self.time_offset;

            // Clamp to the media duration; log the first overrun only
            let total_frames = self.frame_info().total_frames;
            if total_frames > 0 {
                if adjusted >= total_frames {
                    if !self.logged_exceeded_duration {
                        log::info!(
                            "LayerPlayback: frame {adjusted} exceeds media duration \
                             ({total_frames}), clamping to {}",
                            total_frames - 1
                        );
                        self.logged_exceeded_duration = true;
                    }
                    adjusted = total_frames - 1;
                } else {
                    if adjusted < 0 {
                        adjusted = 0;
                    }
                    self.logged_exceeded_duration = false;
                }
            } else if adjusted < 0 {
                adjusted = 0;
            }

            if adjusted != self.last_sync_frame {
                if self.load_frame(adjusted).is_ok() {
                    self.current_frame = adjusted;
                    self.last_sync_frame = adjusted;
                } else {
                    // Retry once via an explicit seek; helps keyframe-heavy
                    // codecs recover from a bad demuxer position
                    log::warn!("LayerPlayback: load of frame {adjusted} failed, retrying via seek");
                    let sought = self
                        .input
                        .as_mut()
                        .map(|i| i.seek(adjusted).is_ok())
                        .unwrap_or(false);
                    if sought && self.load_frame(adjusted).is_ok() {
                        self.current_frame = adjusted;
                        self.last_sync_frame = adjusted;
                    } else {
                        log::warn!("LayerPlayback: frame {adjusted} unavailable even after seek");
                    }
                }
            }
        } else if self.current_frame < 0 {
            // No timecode yet: show frame 0 so the layer is visible while
            // waiting. last_sync_frame stays -1 so the first real sync
            // still triggers a load.
            if self.load_frame(0).is_ok() {
                self.current_frame = 0;
                log::info!("LayerPlayback: loaded frame 0 while waiting for timecode");
            }
        }
    }

    fn log_timecode(&mut self, sync_frame: i64, rolling: bool) {
        let should_log = if rolling {
            self.last_logged_frame < 0 || (sync_frame - self.last_logged_frame).abs() >= 30
        } else {
            self.last_logged_frame != sync_frame
        };
        if !should_log {
            return;
        }

        let info = self.frame_info();
        if info.framerate > 0.0 {
            log::info!(
                "LayerPlayback: {} (frame {sync_frame}, {})",
                frame_to_smpte_string(sync_frame, info.framerate, false),
                if rolling { "rolling" } else { "stopped" }
            );
        }
        self.last_logged_frame = sync_frame;
    }

    /// Route a frame load to the right decode path.
    fn load_frame(&mut self, frame_index: i64) -> MediaResult<()> {
        let input = self.input.as_mut().ok_or(MediaError::NotReady)?;
        if !input.is_ready() {
            return Err(MediaError::NotReady);
        }

        // Block-coded sources upload compressed blocks straight to the GPU
        if input.optimal_backend() == DecodeBackend::BlockDirect && input.supports_direct_gpu() {
            input.read_frame_to_texture(frame_index, &mut self.gpu_buffer)?;
            self.frame_on_gpu = true;
            return Ok(());
        }

        // Hardware sources try the GPU-resident path first, then fall back
        // to a host read
        if input.optimal_backend() == DecodeBackend::GpuHardware && self.gpu.is_some() {
            match input.read_frame_to_texture(frame_index, &mut self.gpu_buffer) {
                Ok(()) => {
                    self.frame_on_gpu = true;
                    return Ok(());
                }
                Err(e) => {
                    log::debug!(
                        "LayerPlayback: GPU read of frame {frame_index} failed ({e}), \
                         using host path"
                    );
                }
            }
        }

        input.read_frame(frame_index, &mut self.cpu_buffer)?;
        self.frame_on_gpu = false;
        Ok(())
    }

    /// The most recently loaded frame: `(on_gpu, host buffer, gpu frame)`.
    pub fn frame_buffers(&self) -> (bool, &FrameBuffer, &GpuTextureFrame) {
        (self.frame_on_gpu, &self.cpu_buffer, &self.gpu_buffer)
    }

    /// Whether the layer reached (or passed) the end of its media.
    pub fn check_playback_end(&self) -> bool {
        if self.current_frame < 0 {
            return false;
        }
        let total_frames = self.frame_info().total_frames;
        total_frames > 0 && self.current_frame >= total_frames
    }

    pub fn is_block_codec(&self) -> bool {
        self.input
            .as_ref()
            .map(|i| i.detect_codec().is_block_coded())
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn clamp_latched(&self) -> bool {
        self.logged_exceeded_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{CodecKind, PixelFormat};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Input source that records every read and always succeeds.
    struct FakeInput {
        total_frames: i64,
        reads: Arc<AtomicI64>,
        last_read: Arc<AtomicI64>,
    }

    impl FakeInput {
        fn new(total_frames: i64) -> (Self, Arc<AtomicI64>, Arc<AtomicI64>) {
            let reads = Arc::new(AtomicI64::new(0));
            let last_read = Arc::new(AtomicI64::new(-1));
            (
                Self {
                    total_frames,
                    reads: reads.clone(),
                    last_read: last_read.clone(),
                },
                reads,
                last_read,
            )
        }
    }

    impl InputSource for FakeInput {
        fn open(&mut self, _source: &str) -> MediaResult<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn is_ready(&self) -> bool {
            true
        }
        fn read_frame(&mut self, frame_index: i64, buffer: &mut FrameBuffer) -> MediaResult<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.last_read.store(frame_index, Ordering::SeqCst);
            buffer.allocate(self.frame_info());
            Ok(())
        }
        fn seek(&mut self, _frame_index: i64) -> MediaResult<()> {
            Ok(())
        }
        fn frame_info(&self) -> FrameInfo {
            FrameInfo {
                width: 64,
                height: 36,
                pixel_aspect: 16.0 / 9.0,
                framerate: 25.0,
                framerate_q: (25, 1),
                total_frames: self.total_frames,
                duration_seconds: self.total_frames as f64 / 25.0,
                pixel_format: PixelFormat::Bgra32,
            }
        }
        fn current_frame(&self) -> i64 {
            self.last_read.load(Ordering::SeqCst)
        }
        fn detect_codec(&self) -> CodecKind {
            CodecKind::Other
        }
        fn optimal_backend(&self) -> DecodeBackend {
            DecodeBackend::CpuSoftware
        }
    }

    /// Sync source fed from a script of (frame, rolling) polls.
    struct ScriptedSync {
        script: Vec<(i64, bool)>,
        cursor: usize,
    }

    impl ScriptedSync {
        fn new(script: Vec<(i64, bool)>) -> Self {
            Self { script, cursor: 0 }
        }
    }

    impl SyncSource for ScriptedSync {
        fn connect(&mut self, _param: &str) -> MediaResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn poll_frame(&mut self) -> (i64, bool) {
            let at = self.cursor.min(self.script.len().saturating_sub(1));
            self.cursor += 1;
            self.script.get(at).copied().unwrap_or((-1, false))
        }
        fn current_frame(&self) -> i64 {
            -1
        }
        fn framerate(&self) -> f64 {
            25.0
        }
        fn name(&self) -> &'static str {
            "Scripted"
        }
    }

    fn layer_with(
        total_frames: i64,
        script: Vec<(i64, bool)>,
    ) -> (LayerPlayback, Arc<AtomicI64>, Arc<AtomicI64>) {
        let (input, reads, last_read) = FakeInput::new(total_frames);
        let mut layer = LayerPlayback::new(None);
        layer.set_input(Box::new(input));
        layer.set_sync(Some(Box::new(ScriptedSync::new(script))));
        (layer, reads, last_read)
    }

    #[test]
    fn clamp_at_end_of_media_loads_last_frame_once_logged() {
        // 100-frame source; sync runs past the end
        let (mut layer, _reads, last_read) = layer_with(100, vec![(120, true), (150, true)]);

        layer.update();
        assert_eq!(layer.current_frame(), 99);
        assert_eq!(last_read.load(Ordering::SeqCst), 99);
        assert!(layer.clamp_latched());

        layer.update();
        assert_eq!(layer.current_frame(), 99);
        // Still latched: no second log, no re-load churn
        assert!(layer.clamp_latched());
    }

    #[test]
    fn clamp_resets_once_back_in_range() {
        let (mut layer, _, _) = layer_with(100, vec![(150, true), (50, true)]);
        layer.update();
        assert!(layer.clamp_latched());
        layer.update();
        assert!(!layer.clamp_latched());
        assert_eq!(layer.current_frame(), 50);
    }

    #[test]
    fn negative_adjusted_frames_clamp_to_zero() {
        let (mut layer, _, _) = layer_with(100, vec![(10, true)]);
        layer.set_time_offset(-50);
        layer.update();
        assert_eq!(layer.current_frame(), 0);
    }

    #[test]
    fn reverse_preserves_displayed_frame() {
        // Sync at 100, then reverse; the same sync value must keep showing
        // the same frame, and advancing sync must now step backwards
        let (mut layer, _, _) = layer_with(1000, vec![(100, true), (100, true), (101, true)]);

        layer.update();
        assert_eq!(layer.current_frame(), 100);

        layer.reverse();
        layer.update();
        assert_eq!(layer.current_frame(), 100);

        layer.update();
        assert_eq!(layer.current_frame(), 99);
    }

    #[test]
    fn auto_play_on_first_timecode() {
        let (mut layer, _, _) = layer_with(100, vec![(-1, false), (10, true)]);
        assert!(!layer.is_playing());

        layer.update();
        // Placeholder frame 0 while waiting, not playing yet from sync -1
        assert_eq!(layer.current_frame(), 0);

        layer.update();
        assert!(layer.is_playing());
        assert_eq!(layer.current_frame(), 10);
    }

    #[test]
    fn placeholder_keeps_last_sync_frame_unset() {
        let (mut layer, reads, last_read) = layer_with(100, vec![(-1, false), (-1, false), (0, true)]);

        layer.update();
        layer.update();
        // Placeholder loaded exactly once
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(last_read.load(Ordering::SeqCst), 0);

        // First real sync at frame 0 still triggers a load
        layer.update();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn losing_timecode_pauses() {
        let (mut layer, _, _) = layer_with(100, vec![(5, true), (-1, false)]);
        layer.update();
        assert!(layer.is_playing());
        layer.update();
        assert!(!layer.is_playing());
    }

    #[test]
    fn unchanged_sync_frame_does_not_reload() {
        let (mut layer, reads, _) = layer_with(100, vec![(7, true), (7, true), (7, true)]);
        layer.update();
        layer.update();
        layer.update();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn follow_sync_disabled_ignores_clock() {
        let (mut layer, reads, _) = layer_with(100, vec![(42, true)]);
        layer.set_follow_sync(false);
        layer.update();
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(layer.current_frame(), -1);
    }

    #[test]
    fn time_scale_and_offset_shape_the_request() {
        let (mut layer, _, last_read) = layer_with(1000, vec![(10, true)]);
        layer.set_time_scale(2.0);
        layer.set_time_offset(5);
        layer.update();
        // floor(10 * 2.0) + 5
        assert_eq!(last_read.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn playback_end_detection() {
        let (mut layer, _, _) = layer_with(100, vec![(99, true)]);
        layer.update();
        assert!(!layer.check_playback_end());

        let (mut layer, _, _) = layer_with(100, vec![(150, true)]);
        layer.update();
        // Clamped to 99, which is the last frame, not past it
        assert!(!layer.check_playback_end());
    }
}
