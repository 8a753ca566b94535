//! End-to-end layer playback scenarios against the public API: a scripted
//! sync clock drives a recording input source through the playback state
//! machine and display preparation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use stagecomposer::error::MediaResult;
use stagecomposer::layer::{LayerDisplay, LayerPlayback, LayerProperties, PreparedFrame};
use stagecomposer::media::{
    CodecKind, DecodeBackend, FrameBuffer, FrameInfo, InputSource, PixelFormat,
};
use stagecomposer::sync::SyncSource;

/// Input source that succeeds instantly and records what was asked of it.
struct RecordingInput {
    total_frames: i64,
    last_read: Arc<AtomicI64>,
    reads: Arc<AtomicI64>,
}

impl RecordingInput {
    fn new(total_frames: i64) -> (Self, Arc<AtomicI64>, Arc<AtomicI64>) {
        let last_read = Arc::new(AtomicI64::new(-1));
        let reads = Arc::new(AtomicI64::new(0));
        (
            Self {
                total_frames,
                last_read: last_read.clone(),
                reads: reads.clone(),
            },
            last_read,
            reads,
        )
    }

    fn info(&self) -> FrameInfo {
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
}

impl InputSource for RecordingInput {
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
        buffer.allocate(self.info());
        Ok(())
    }
    fn seek(&mut self, _frame_index: i64) -> MediaResult<()> {
        Ok(())
    }
    fn frame_info(&self) -> FrameInfo {
        self.info()
    }
    fn current_frame(&self) -> i64 {
        self.last_read.load(Ordering::SeqCst)
    }
    fn detect_codec(&self) -> CodecKind {
        CodecKind::H264
    }
    fn optimal_backend(&self) -> DecodeBackend {
        DecodeBackend::CpuSoftware
    }
}

/// Sync clock fed from a fixed script of (frame, rolling) answers; repeats
/// the last entry once exhausted.
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
    let (input, last_read, reads) = RecordingInput::new(total_frames);
    let mut layer = LayerPlayback::new(None);
    layer.set_input(Box::new(input));
    layer.set_sync(Some(Box::new(ScriptedSync::new(script))));
    (layer, last_read, reads)
}

#[test]
fn sync_past_end_of_media_clamps_to_last_frame() {
    // 100-frame, 25 fps source; sync feeds 120 then 150
    let (mut layer, last_read, _) = layer_with(100, vec![(120, true), (150, true)]);

    layer.update();
    assert_eq!(layer.current_frame(), 99);
    assert_eq!(last_read.load(Ordering::SeqCst), 99);

    layer.update();
    assert_eq!(layer.current_frame(), 99);
}

#[test]
fn reverse_at_mid_file_steps_backward() {
    // current_frame=100, scale 1.0, offset 0, sync at 100
    let (mut layer, _, _) = layer_with(1000, vec![(100, true), (101, true)]);
    layer.update();
    assert_eq!(layer.current_frame(), 100);

    layer.reverse();

    // Next tick with sync=101 must produce 99, not 101
    layer.update();
    assert_eq!(layer.current_frame(), 99);
}

#[test]
fn timecode_arrival_starts_playback_automatically() {
    let (mut layer, _, _) = layer_with(100, vec![(-1, false), (0, true), (1, true)]);
    assert!(!layer.is_playing());

    layer.update(); // no timecode yet: placeholder frame
    assert_eq!(layer.current_frame(), 0);
    assert!(!layer.is_playing());

    layer.update();
    assert!(layer.is_playing());

    layer.update();
    assert_eq!(layer.current_frame(), 1);
}

#[test]
fn stable_sync_frame_loads_once() {
    let (mut layer, _, reads) = layer_with(100, vec![(12, true); 5]);
    for _ in 0..5 {
        layer.update();
    }
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(layer.current_frame(), 12);
}

#[test]
fn prepared_frame_passes_through_unchanged_without_transforms() {
    let (mut layer, _, _) = layer_with(100, vec![(3, true)]);
    layer.update();

    let (on_gpu, cpu_frame, gpu_frame) = layer.frame_buffers();
    assert!(!on_gpu);
    assert!(cpu_frame.is_valid());

    let mut display = LayerDisplay::new();
    let properties = LayerProperties::default();
    match display
        .prepare(cpu_frame, gpu_frame, on_gpu, &properties)
        .unwrap()
    {
        PreparedFrame::Cpu {
            buffer,
            transforms_baked,
        } => {
            // Zero copy: the very same buffer the decoder filled
            assert!(std::ptr::eq(buffer, cpu_frame));
            assert!(transforms_baked);
        }
        _ => panic!("expected a CPU frame"),
    }
}

#[test]
fn transforms_produce_a_processed_frame() {
    let (mut layer, _, _) = layer_with(100, vec![(3, true)]);
    layer.update();

    let (on_gpu, cpu_frame, gpu_frame) = layer.frame_buffers();
    let mut display = LayerDisplay::new();
    let properties = LayerProperties {
        rotation_degrees: 90.0,
        ..Default::default()
    };

    match display
        .prepare(cpu_frame, gpu_frame, on_gpu, &properties)
        .unwrap()
    {
        PreparedFrame::Cpu { buffer, .. } => {
            assert!(!std::ptr::eq(buffer, cpu_frame));
            // 64x36 rotated a quarter turn
            assert_eq!(buffer.info().width, 36);
            assert_eq!(buffer.info().height, 64);
        }
        _ => panic!("expected a CPU frame"),
    }
}

#[test]
fn manual_control_without_sync() {
    let (input, last_read, _) = RecordingInput::new(100);
    let mut layer = LayerPlayback::new(None);
    layer.set_input(Box::new(input));

    // No sync source: update is inert, seek is explicit
    layer.update();
    assert_eq!(layer.current_frame(), -1);

    assert!(layer.seek(42));
    assert_eq!(layer.current_frame(), 42);
    // Seek repositions but does not decode
    assert_eq!(last_read.load(Ordering::SeqCst), -1);
}

#[test]
fn time_offset_shifts_the_mapping() {
    let (mut layer, last_read, _) = layer_with(1000, vec![(10, true)]);
    layer.set_time_offset(100);
    layer.update();
    assert_eq!(last_read.load(Ordering::SeqCst), 110);
}
