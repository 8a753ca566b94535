//! Media Pipeline
//!
//! Frame types, the polymorphic input-source trait and the source factory.
//!
//! Sources come in four flavors:
//! - `FileInput`: software demux + decode with a per-frame seek index
//! - `HardwareFileInput`: hardware-accelerated decode behind an async
//!   pre-buffering queue, with an optional zero-copy GPU import path
//! - `HapInput`: Hap block-texture files, compressed blocks uploaded
//!   directly to the GPU
//! - `LiveInput`: network streams drained by a capture thread

use std::sync::Arc;
use std::sync::Once;

use crate::error::{MediaError, MediaResult};

pub mod block;
pub mod file;
pub mod gpu;
pub mod hardware;
pub mod live;
pub mod loader;
pub mod queue;

#[cfg(target_os = "linux")]
pub mod dmabuf;

pub use block::HapInput;
pub use file::FileInput;
pub use gpu::{BlockVariant, GpuContext, GpuTextureFrame, PlaneLayout};
pub use hardware::{HardwareAccel, HardwareFileInput, HwDeviceContext};
pub use live::LiveInput;
pub use loader::AsyncVideoLoader;
pub use queue::AsyncDecodeQueue;

use ffmpeg_next as ffmpeg;

/// One-time FFmpeg global initialization.
///
/// EAGAIN chatter from decoders is normal during seeks, so the log level is
/// clamped to errors.
static FFMPEG_INIT: Once = Once::new();

pub(crate) fn ensure_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        let _ = ffmpeg::init();
        unsafe {
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_ERROR as i32);
        }
    });
}

/// Pixel format of a decoded host frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar
    Yuv420p,
    /// Packed RGB, 3 bytes per pixel
    Rgb24,
    /// Packed RGBA, 4 bytes per pixel
    Rgba32,
    /// Packed BGRA, 4 bytes per pixel (the renderer's native layout)
    #[default]
    Bgra32,
    /// Packed YUV 4:2:2
    Uyvy422,
    /// Semi-planar Y + interleaved UV
    Nv12,
    /// Opaque hardware surface; pixels live on the GPU
    HwSurface,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats; 1 for the luma plane of planar
    /// formats; 0 for opaque hardware surfaces.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Yuv420p | PixelFormat::Nv12 => 1,
            PixelFormat::Uyvy422 => 2,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => 4,
            PixelFormat::HwSurface => 0,
        }
    }

    /// Total buffer size for a frame of this format, honoring `stride` for
    /// the (first) plane.
    pub fn buffer_size(self, stride: usize, height: usize) -> usize {
        match self {
            // Planar 4:2:0: full-res luma plus two quarter-res chroma planes
            PixelFormat::Yuv420p | PixelFormat::Nv12 => stride * height * 3 / 2,
            _ => stride * height,
        }
    }
}

/// Codec identity as reported by the container probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Other,
    H264,
    Hevc,
    Vp9,
    Av1,
    /// Hap, RGB DXT1 blocks
    Hap,
    /// Hap Q, scaled-YCoCg DXT5 blocks
    HapQ,
    /// Hap Alpha, RGBA DXT5 blocks
    HapAlpha,
    /// Hap Q Alpha, dual texture: YCoCg DXT5 + RGTC1 alpha
    HapQAlpha,
    /// Hap R, BC7 blocks
    HapR,
}

impl CodecKind {
    pub fn is_block_coded(self) -> bool {
        matches!(
            self,
            CodecKind::Hap
                | CodecKind::HapQ
                | CodecKind::HapAlpha
                | CodecKind::HapQAlpha
                | CodecKind::HapR
        )
    }
}

/// Preferred decode path for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeBackend {
    CpuSoftware,
    GpuHardware,
    BlockDirect,
}

/// Immutable per-open description of a video stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_aspect: f64,
    pub framerate: f64,
    /// Frame rate as a rational (num, den); (0, 0) when unknown.
    pub framerate_q: (i32, i32),
    pub total_frames: i64,
    pub duration_seconds: f64,
    pub pixel_format: PixelFormat,
}

impl FrameInfo {
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Host-memory frame buffer.
///
/// Owns a contiguous pixel allocation sized by `FrameInfo` plus stride.
/// Reallocation happens only on `allocate` and only when width, height or
/// format actually changed.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
    info: FrameInfo,
    stride: usize,
    valid: bool,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or re-allocate) for `info`. Keeps the existing allocation
    /// when the geometry and format are unchanged.
    pub fn allocate(&mut self, info: FrameInfo) -> bool {
        if !info.is_valid() || info.pixel_format == PixelFormat::HwSurface {
            return false;
        }

        let stride = info.width as usize * info.pixel_format.bytes_per_pixel();
        let size = info.pixel_format.buffer_size(stride, info.height as usize);

        let unchanged = self.valid
            && self.info.width == info.width
            && self.info.height == info.height
            && self.info.pixel_format == info.pixel_format;

        if !unchanged {
            self.data.clear();
            self.data.resize(size, 0);
            self.stride = stride;
        }
        self.info = info;
        self.valid = true;

        debug_assert!(self.data.len() >= self.stride * info.height as usize);
        true
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Options threaded from the engine configuration into source construction.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub hardware: HardwarePreference,
    /// Skip the packet-scan index; seek by timestamp instead.
    pub no_index: bool,
    /// Allow block-coded sources to upload straight to GPU textures.
    pub direct_gpu_upload: bool,
    /// How long `LiveInput::open` blocks waiting for the first frame.
    pub live_initial_wait_ms: u64,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            hardware: HardwarePreference::Auto,
            no_index: false,
            direct_gpu_upload: true,
            live_initial_wait_ms: 2000,
        }
    }
}

/// Which hardware decode backend to use, if any.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HardwarePreference {
    #[default]
    Auto,
    #[serde(rename = "software")]
    SoftwareOnly,
    Vaapi,
    Cuda,
    Qsv,
}

/// Polymorphic decoder. Produces frames on demand by frame index.
///
/// `read_frame_to_texture` is an optional capability; sources that decode to
/// host memory keep the default. GPU-side reads are main-thread only.
pub trait InputSource: Send {
    fn open(&mut self, source: &str) -> MediaResult<()>;
    fn close(&mut self);
    fn is_ready(&self) -> bool;

    /// Decode frame `frame_index` into `buffer` (allocating it as needed).
    fn read_frame(&mut self, frame_index: i64, buffer: &mut FrameBuffer) -> MediaResult<()>;

    /// Decode frame `frame_index` directly into a GPU texture.
    fn read_frame_to_texture(
        &mut self,
        _frame_index: i64,
        _texture: &mut GpuTextureFrame,
    ) -> MediaResult<()> {
        Err(MediaError::InvalidArgument(
            "source does not support direct GPU reads".into(),
        ))
    }

    fn seek(&mut self, frame_index: i64) -> MediaResult<()>;
    fn frame_info(&self) -> FrameInfo;
    fn current_frame(&self) -> i64;
    fn detect_codec(&self) -> CodecKind;

    fn supports_direct_gpu(&self) -> bool {
        false
    }

    fn optimal_backend(&self) -> DecodeBackend;
}

/// Build the right input source for `path`.
///
/// Probe order: Hap (cheap container check) first for local movie files,
/// then hardware-accelerated file decode, then plain software decode.
/// Anything with a URL scheme is treated as a live stream.
pub fn open_source(
    path: &str,
    options: &DecodeOptions,
    gpu: Option<Arc<GpuContext>>,
) -> MediaResult<Box<dyn InputSource>> {
    ensure_ffmpeg();

    if path.contains("://") {
        let mut live = LiveInput::new(options.live_initial_wait_ms);
        live.open(path)?;
        return Ok(Box::new(live));
    }

    let ext = path
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if ext == "mov" || ext == "mp4" || ext == "avi" {
        let mut hap = HapInput::new(gpu.clone(), options.direct_gpu_upload);
        match hap.open(path) {
            Ok(()) => {
                log::info!("open_source: using Hap block decoder for {}", path);
                return Ok(Box::new(hap));
            }
            // Not a Hap file; fall through to the generic decoders
            Err(MediaError::InvalidArgument(_)) => {}
            Err(MediaError::DecodeFatal(e)) => return Err(MediaError::DecodeFatal(e)),
            Err(_) => {}
        }
    }

    if options.hardware != HardwarePreference::SoftwareOnly {
        if let Some(gpu) = gpu.clone() {
            let mut hw = HardwareFileInput::new(gpu, options.hardware);
            match hw.open(path) {
                Ok(()) => return Ok(Box::new(hw)),
                Err(MediaError::HardwareUnavailable(e)) => {
                    log::info!(
                        "open_source: hardware decode unavailable for {} ({}), using software",
                        path,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    let mut file = FileInput::new(options.no_index);
    file.open(path)?;
    Ok(Box::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(w: u32, h: u32, fmt: PixelFormat) -> FrameInfo {
        FrameInfo {
            width: w,
            height: h,
            pixel_aspect: 1.0,
            framerate: 25.0,
            framerate_q: (25, 1),
            total_frames: 100,
            duration_seconds: 4.0,
            pixel_format: fmt,
        }
    }

    #[test]
    fn frame_buffer_allocates_stride_times_height() {
        let mut buf = FrameBuffer::new();
        assert!(!buf.is_valid());
        assert!(buf.allocate(info(640, 360, PixelFormat::Bgra32)));
        assert!(buf.is_valid());
        assert_eq!(buf.stride(), 640 * 4);
        assert!(buf.size() >= buf.stride() * 360);
    }

    #[test]
    fn frame_buffer_reallocates_only_on_change() {
        let mut buf = FrameBuffer::new();
        assert!(buf.allocate(info(640, 360, PixelFormat::Bgra32)));
        buf.data_mut()[0] = 0xAB;

        // Same geometry: contents survive
        assert!(buf.allocate(info(640, 360, PixelFormat::Bgra32)));
        assert_eq!(buf.data()[0], 0xAB);

        // New geometry: fresh zeroed allocation
        assert!(buf.allocate(info(320, 180, PixelFormat::Bgra32)));
        assert_eq!(buf.data()[0], 0);
        assert_eq!(buf.size(), 320 * 4 * 180);
    }

    #[test]
    fn frame_buffer_rejects_hw_surface_and_zero_size() {
        let mut buf = FrameBuffer::new();
        assert!(!buf.allocate(info(0, 0, PixelFormat::Bgra32)));
        assert!(!buf.allocate(info(640, 360, PixelFormat::HwSurface)));
        assert!(!buf.is_valid());
    }

    #[test]
    fn planar_formats_size_to_one_and_a_half_planes() {
        let mut buf = FrameBuffer::new();
        assert!(buf.allocate(info(640, 360, PixelFormat::Yuv420p)));
        assert_eq!(buf.size(), 640 * 360 * 3 / 2);
    }

    #[test]
    fn codec_kind_block_coded() {
        assert!(CodecKind::Hap.is_block_coded());
        assert!(CodecKind::HapQAlpha.is_block_coded());
        assert!(!CodecKind::H264.is_block_coded());
    }
}
