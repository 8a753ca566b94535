//! Hardware-accelerated file input
//!
//! Backend detection (VAAPI/CUDA/QSV), the shared hardware device context
//! and the `HardwareFileInput` source. Decode itself runs on the async
//! queue's producer thread; this module maps the resulting frames either
//! down to host memory (rescaler path) or straight into GPU textures
//! (DMA-BUF zero-copy path on Linux).
//!
//! Decoder selection:
//! - QSV and CUDA use dedicated wrapper decoders found by name
//!   (`h264_qsv`, `hevc_cuvid`, ...)
//! - VAAPI uses the standard decoder with an attached device context; the
//!   decoder's hardware configurations are probed first to confirm the
//!   device type is actually supported

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg::util::frame;
use parking_lot::Mutex;

use crate::error::{MediaError, MediaResult};
use crate::media::gpu::GpuContext;
use crate::media::queue::AsyncDecodeQueue;
use crate::media::{
    ensure_ffmpeg, CodecKind, DecodeBackend, FrameBuffer, FrameInfo, GpuTextureFrame,
    HardwarePreference, InputSource, PixelFormat,
};

#[cfg(target_os = "linux")]
use crate::media::dmabuf::DmabufImporter;

/// How long a frame read waits on the decode queue before reusing the
/// closest earlier frame.
const FRAME_WAIT: Duration = Duration::from_millis(40);

/// Detected hardware decode backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwBackend {
    Vaapi,
    Cuda,
    Qsv,
}

impl HwBackend {
    pub fn name(self) -> &'static str {
        match self {
            HwBackend::Vaapi => "VAAPI",
            HwBackend::Cuda => "CUDA",
            HwBackend::Qsv => "QSV",
        }
    }

    fn device_type(self) -> ffmpeg::ffi::AVHWDeviceType {
        match self {
            HwBackend::Vaapi => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
            HwBackend::Cuda => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
            HwBackend::Qsv => ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_QSV,
        }
    }
}

/// Owning reference to an FFmpeg hardware device context.
///
/// The underlying AVBufferRef is reference counted; decoders take their own
/// reference, this wrapper drops the creating one.
pub struct HwDeviceContext {
    ptr: *mut ffmpeg::ffi::AVBufferRef,
}

// AVBufferRef refcounting is thread safe; the payload (the device context)
// is only used through FFmpeg calls that serialize internally.
unsafe impl Send for HwDeviceContext {}
unsafe impl Sync for HwDeviceContext {}

impl HwDeviceContext {
    pub fn create(device_type: ffmpeg::ffi::AVHWDeviceType) -> MediaResult<Self> {
        ensure_ffmpeg();
        let mut ptr: *mut ffmpeg::ffi::AVBufferRef = std::ptr::null_mut();
        let ret = unsafe {
            ffmpeg::ffi::av_hwdevice_ctx_create(
                &mut ptr,
                device_type,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ptr.is_null() {
            return Err(MediaError::HardwareUnavailable(format!(
                "device context creation failed ({ret})"
            )));
        }
        Ok(Self { ptr })
    }

    pub fn as_ptr(&self) -> *mut ffmpeg::ffi::AVBufferRef {
        self.ptr
    }
}

impl Drop for HwDeviceContext {
    fn drop(&mut self) {
        unsafe {
            ffmpeg::ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

/// Hardware configuration handed to the decode queue.
pub struct HwSetup {
    pub device: Arc<HwDeviceContext>,
    /// Wrapper decoder name for backends with dedicated decoders; `None`
    /// selects the hwaccel-via-standard-decoder method.
    pub wrapper_decoder: Option<String>,
}

/// Shared device cache: all hardware sources borrow one context per
/// backend; the last holder dropping its Arc releases the device.
static SHARED_DEVICE: Mutex<Option<(HwBackend, Weak<HwDeviceContext>)>> = Mutex::new(None);

static DETECTED: OnceLock<Option<HwBackend>> = OnceLock::new();

/// Hardware decoder detection and codec mapping.
pub struct HardwareAccel;

impl HardwareAccel {
    /// Probe for the best available backend, once per process.
    /// Order of preference: VAAPI (zero-copy interop) > CUDA > QSV.
    pub fn detect() -> Option<HwBackend> {
        *DETECTED.get_or_init(|| {
            ensure_ffmpeg();
            for backend in [HwBackend::Vaapi, HwBackend::Cuda, HwBackend::Qsv] {
                match HwDeviceContext::create(backend.device_type()) {
                    Ok(_) => {
                        log::info!("HardwareAccel: detected {}", backend.name());
                        return Some(backend);
                    }
                    Err(e) => {
                        log::debug!("HardwareAccel: {} probe failed: {e}", backend.name());
                    }
                }
            }
            log::info!("HardwareAccel: no hardware decoder detected, using software");
            None
        })
    }

    /// Resolve the configured preference to a concrete backend.
    pub fn resolve(preference: HardwarePreference) -> Option<HwBackend> {
        match preference {
            HardwarePreference::SoftwareOnly => None,
            HardwarePreference::Auto => Self::detect(),
            HardwarePreference::Vaapi => Some(HwBackend::Vaapi),
            HardwarePreference::Cuda => Some(HwBackend::Cuda),
            HardwarePreference::Qsv => Some(HwBackend::Qsv),
        }
    }

    /// Shared device context for `backend`; created on first use, reused
    /// while any source holds it.
    pub fn shared_device(backend: HwBackend) -> MediaResult<Arc<HwDeviceContext>> {
        let mut guard = SHARED_DEVICE.lock();
        if let Some((cached, weak)) = guard.as_ref() {
            if *cached == backend {
                if let Some(device) = weak.upgrade() {
                    return Ok(device);
                }
            }
        }
        let device = Arc::new(HwDeviceContext::create(backend.device_type())?);
        *guard = Some((backend, Arc::downgrade(&device)));
        Ok(device)
    }

    /// Dedicated wrapper decoder name, if the backend uses one.
    pub fn wrapper_decoder_name(backend: HwBackend, codec: CodecKind) -> Option<String> {
        let base = match codec {
            CodecKind::H264 => "h264",
            CodecKind::Hevc => "hevc",
            CodecKind::Vp9 => "vp9",
            CodecKind::Av1 => "av1",
            _ => return None,
        };
        match backend {
            HwBackend::Qsv => Some(format!("{base}_qsv")),
            HwBackend::Cuda => Some(format!("{base}_cuvid")),
            HwBackend::Vaapi => None,
        }
    }

    /// Whether the standard decoder for `codec` supports hwaccel through a
    /// device context of the backend's type.
    pub fn supports_hwaccel(backend: HwBackend, codec_id: ffmpeg::codec::Id) -> bool {
        ensure_ffmpeg();
        unsafe {
            let codec = ffmpeg::ffi::avcodec_find_decoder(codec_id.into());
            if codec.is_null() {
                return false;
            }
            let wanted = backend.device_type();
            let mut i = 0;
            loop {
                let config = ffmpeg::ffi::avcodec_get_hw_config(codec, i);
                if config.is_null() {
                    return false;
                }
                if (*config).device_type == wanted
                    && ((*config).methods
                        & ffmpeg::ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as i32)
                        != 0
                {
                    return true;
                }
                i += 1;
            }
        }
    }
}

/// File input decoding through a hardware backend, with an async decode
/// queue between the codec and the engine tick.
pub struct HardwareFileInput {
    gpu: Arc<GpuContext>,
    queue: AsyncDecodeQueue,
    backend: Option<HwBackend>,
    preference: HardwarePreference,
    #[cfg(target_os = "linux")]
    importer: Option<DmabufImporter>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    scaler_src: (u32, u32, ffmpeg::format::Pixel),
    info: FrameInfo,
    current_frame: i64,
    ready: bool,
    import_failed_logged: bool,
}

// Scaler and queue handles are only used from the owning thread; the queue
// internally synchronizes with its producer.
unsafe impl Send for HardwareFileInput {}

impl HardwareFileInput {
    pub fn new(gpu: Arc<GpuContext>, preference: HardwarePreference) -> Self {
        Self {
            gpu,
            queue: AsyncDecodeQueue::new(),
            backend: None,
            preference,
            #[cfg(target_os = "linux")]
            importer: None,
            scaler: None,
            scaler_src: (0, 0, ffmpeg::format::Pixel::None),
            info: FrameInfo::default(),
            current_frame: -1,
            ready: false,
            import_failed_logged: false,
        }
    }

    fn is_hw_frame(decoded: &frame::Video) -> bool {
        matches!(
            decoded.format(),
            ffmpeg::format::Pixel::VAAPI
                | ffmpeg::format::Pixel::CUDA
                | ffmpeg::format::Pixel::QSV
        )
    }

    /// Copy a hardware surface down to host memory.
    fn transfer_to_host(decoded: &frame::Video) -> MediaResult<frame::Video> {
        let mut sw = frame::Video::empty();
        let ret = unsafe {
            ffmpeg::ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), decoded.as_ptr(), 0)
        };
        if ret < 0 {
            return Err(MediaError::DecodeTransient(format!(
                "hardware frame download failed ({ret})"
            )));
        }
        unsafe {
            ffmpeg::ffi::av_frame_copy_props(sw.as_mut_ptr(), decoded.as_ptr());
        }
        Ok(sw)
    }

    fn convert_to_buffer(
        &mut self,
        decoded: &frame::Video,
        buffer: &mut FrameBuffer,
    ) -> MediaResult<()> {
        let (w, h, fmt) = (decoded.width(), decoded.height(), decoded.format());

        if self.scaler.is_none() || self.scaler_src != (w, h, fmt) {
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    fmt,
                    w,
                    h,
                    ffmpeg::format::Pixel::BGRA,
                    w,
                    h,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| MediaError::DecodeFatal(format!("rescaler init failed: {e}")))?,
            );
            self.scaler_src = (w, h, fmt);
        }

        let Some(scaler) = self.scaler.as_mut() else {
            return Err(MediaError::NotReady);
        };
        let mut bgra = frame::Video::empty();
        scaler
            .run(decoded, &mut bgra)
            .map_err(|e| MediaError::DecodeTransient(format!("rescale failed: {e}")))?;

        let mut out_info = self.info;
        out_info.width = w;
        out_info.height = h;
        out_info.pixel_format = PixelFormat::Bgra32;
        if !buffer.allocate(out_info) {
            return Err(MediaError::InvalidArgument("buffer allocation failed".into()));
        }

        let src_stride = bgra.stride(0);
        let dst_stride = buffer.stride();
        let row_bytes = dst_stride.min(src_stride);
        let src = bgra.data(0);
        let dst = buffer.data_mut();
        for row in 0..h as usize {
            let s = row * src_stride;
            let d = row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
        Ok(())
    }

    /// Upload a host NV12 frame into a multi-plane texture set.
    fn upload_nv12(
        &mut self,
        decoded: &frame::Video,
        texture: &mut GpuTextureFrame,
    ) -> MediaResult<()> {
        let mut info = self.info;
        info.width = decoded.width();
        info.height = decoded.height();
        info.pixel_format = PixelFormat::Nv12;

        if !texture.is_valid()
            || texture.layout() != crate::media::PlaneLayout::Nv12
            || texture.info().width != info.width
            || texture.info().height != info.height
        {
            texture.allocate_multiplane(&self.gpu, info, crate::media::PlaneLayout::Nv12)?;
        }

        texture.upload_multiplane(
            &self.gpu,
            decoded.data(0),
            decoded.data(1),
            &[],
            [
                decoded.stride(0) as u32,
                decoded.stride(1) as u32,
                0,
            ],
        )
    }
}

impl InputSource for HardwareFileInput {
    fn open(&mut self, source: &str) -> MediaResult<()> {
        self.close();
        ensure_ffmpeg();

        let backend = HardwareAccel::resolve(self.preference).ok_or_else(|| {
            MediaError::HardwareUnavailable("no hardware backend available".into())
        })?;

        // Cheap container probe for the codec id before committing to a
        // decoder choice
        let codec_kind = {
            let ictx = ffmpeg::format::input(&source)
                .map_err(|e| MediaError::DecodeFatal(format!("open {source} failed: {e}")))?;
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| MediaError::DecodeFatal(format!("no video stream in {source}")))?;
            let codec_id: ffmpeg::codec::Id =
                unsafe { (*stream.parameters().as_ptr()).codec_id }.into();

            let kind = crate::media::file::FileInput::codec_kind_of(codec_id);
            if HardwareAccel::wrapper_decoder_name(backend, kind).is_none()
                && !HardwareAccel::supports_hwaccel(backend, codec_id)
            {
                return Err(MediaError::HardwareUnavailable(format!(
                    "{} does not accelerate this codec",
                    backend.name()
                )));
            }
            kind
        };

        let device = HardwareAccel::shared_device(backend)?;
        let wrapper = HardwareAccel::wrapper_decoder_name(backend, codec_kind);
        self.queue.open(
            source,
            Some(HwSetup {
                device,
                wrapper_decoder: wrapper,
            }),
        )?;

        if !self.queue.is_hardware() {
            // The producer fell back to software internally; the queue is
            // still useful (decode off the real-time thread)
            log::info!(
                "HardwareFileInput: {} running with software decode behind the queue",
                source
            );
        }

        #[cfg(target_os = "linux")]
        {
            if backend == HwBackend::Vaapi && self.queue.is_hardware() {
                match DmabufImporter::new(self.gpu.clone()) {
                    Ok(importer) => self.importer = Some(importer),
                    Err(e) => {
                        log::info!(
                            "HardwareFileInput: zero-copy import unavailable ({e}), \
                             using copy-back path"
                        );
                    }
                }
            }
        }

        self.backend = Some(backend);
        self.info = self.queue.frame_info();
        self.current_frame = -1;
        self.ready = true;
        Ok(())
    }

    fn close(&mut self) {
        self.queue.close();
        self.scaler = None;
        self.backend = None;
        #[cfg(target_os = "linux")]
        {
            self.importer = None;
        }
        self.info = FrameInfo::default();
        self.current_frame = -1;
        self.ready = false;
        self.import_failed_logged = false;
    }

    fn is_ready(&self) -> bool {
        self.ready && self.queue.is_ready()
    }

    fn read_frame(&mut self, frame_index: i64, buffer: &mut FrameBuffer) -> MediaResult<()> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }

        let queued = self
            .queue
            .get_frame(frame_index, FRAME_WAIT)
            .ok_or_else(|| MediaError::DecodeTransient(format!("frame {frame_index} not ready")))?;

        if Self::is_hw_frame(&queued.frame) {
            let sw = Self::transfer_to_host(&queued.frame)?;
            self.convert_to_buffer(&sw, buffer)?;
        } else {
            self.convert_to_buffer(&queued.frame, buffer)?;
        }
        self.current_frame = frame_index;
        Ok(())
    }

    fn read_frame_to_texture(
        &mut self,
        frame_index: i64,
        texture: &mut GpuTextureFrame,
    ) -> MediaResult<()> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }

        let queued = self
            .queue
            .get_frame(frame_index, FRAME_WAIT)
            .ok_or_else(|| MediaError::DecodeTransient(format!("frame {frame_index} not ready")))?;

        #[cfg(target_os = "linux")]
        if Self::is_hw_frame(&queued.frame) {
            if let Some(importer) = self.importer.as_mut() {
                let mut info = self.info;
                info.pixel_format = PixelFormat::HwSurface;
                match importer.import_frame(&queued.frame, &info) {
                    Ok((tex_y, tex_uv)) => {
                        let mut nv12_info = info;
                        nv12_info.pixel_format = PixelFormat::Nv12;
                        texture.set_external_nv12(tex_y, tex_uv, nv12_info);
                        self.current_frame = frame_index;
                        return Ok(());
                    }
                    Err(e) => {
                        if !self.import_failed_logged {
                            log::warn!(
                                "HardwareFileInput: zero-copy import failed ({e}), \
                                 falling back to copy-back"
                            );
                            self.import_failed_logged = true;
                        }
                    }
                }
            }
        }

        // Copy-back: download (if needed) and upload NV12 planes
        let host = if Self::is_hw_frame(&queued.frame) {
            Self::transfer_to_host(&queued.frame)?
        } else {
            queued.frame
        };

        if host.format() == ffmpeg::format::Pixel::NV12 {
            self.upload_nv12(&host, texture)?;
            self.current_frame = frame_index;
            return Ok(());
        }

        Err(MediaError::DecodeTransient(format!(
            "no GPU upload path for {:?}",
            host.format()
        )))
    }

    fn seek(&mut self, frame_index: i64) -> MediaResult<()> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }
        if frame_index < 0 {
            return Err(MediaError::InvalidArgument(format!(
                "negative frame {frame_index}"
            )));
        }
        self.queue.seek(frame_index);
        self.current_frame = frame_index;
        Ok(())
    }

    fn frame_info(&self) -> FrameInfo {
        self.info
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn detect_codec(&self) -> CodecKind {
        self.queue.codec_kind()
    }

    fn supports_direct_gpu(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.importer.is_some()
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }

    fn optimal_backend(&self) -> DecodeBackend {
        if self.queue.is_hardware() {
            DecodeBackend::GpuHardware
        } else {
            DecodeBackend::CpuSoftware
        }
    }
}

impl Drop for HardwareFileInput {
    fn drop(&mut self) {
        self.close();
    }
}
