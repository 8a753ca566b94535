//! Live network input
//!
//! Opens a stream URL (RTSP/UDP/HTTP/...) and drains it on an internal
//! capture thread into a latest-frame slot. Live sources have no timeline:
//! `seek` succeeds as a no-op and every read returns the most recent
//! frame.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg::util::frame;
use parking_lot::{Condvar, Mutex};

use crate::error::{MediaError, MediaResult};
use crate::media::{
    ensure_ffmpeg, CodecKind, DecodeBackend, FrameBuffer, FrameInfo, InputSource, PixelFormat,
};

/// Format reported while no packet has arrived yet.
fn default_live_info() -> FrameInfo {
    FrameInfo {
        width: 640,
        height: 360,
        pixel_aspect: 640.0 / 360.0,
        framerate: 25.0,
        framerate_q: (25, 1),
        total_frames: 0,
        duration_seconds: 0.0,
        pixel_format: PixelFormat::Bgra32,
    }
}

struct LiveShared {
    latest: Mutex<Option<FrameBuffer>>,
    info: Mutex<FrameInfo>,
    frames_received: AtomicI64,
    stop: AtomicBool,
    first_frame: Condvar,
}

pub struct LiveInput {
    initial_wait: Duration,
    shared: Arc<LiveShared>,
    worker: Option<JoinHandle<()>>,
    ready: bool,
    url: String,
    current_frame: i64,
}

impl LiveInput {
    pub fn new(initial_wait_ms: u64) -> Self {
        Self {
            initial_wait: Duration::from_millis(initial_wait_ms),
            shared: Arc::new(LiveShared {
                latest: Mutex::new(None),
                info: Mutex::new(default_live_info()),
                frames_received: AtomicI64::new(0),
                stop: AtomicBool::new(false),
                first_frame: Condvar::new(),
            }),
            worker: None,
            ready: false,
            url: String::new(),
            current_frame: -1,
        }
    }

    /// Capture loop: open, decode, convert, publish. Runs until stopped;
    /// all FFmpeg state lives and dies on this thread.
    fn capture_loop(shared: Arc<LiveShared>, url: String) {
        ensure_ffmpeg();

        let mut ictx = match ffmpeg::format::input(&url) {
            Ok(ictx) => ictx,
            Err(e) => {
                log::warn!("LiveInput: open {url} failed: {e}");
                return;
            }
        };

        let (stream_index, parameters) = match ictx.streams().best(ffmpeg::media::Type::Video) {
            Some(stream) => (stream.index(), stream.parameters()),
            None => {
                log::warn!("LiveInput: no video stream in {url}");
                return;
            }
        };

        let mut decoder = match ffmpeg::codec::context::Context::from_parameters(parameters)
            .and_then(|ctx| ctx.decoder().video())
        {
            Ok(decoder) => decoder,
            Err(e) => {
                log::warn!("LiveInput: decoder open failed for {url}: {e}");
                return;
            }
        };

        let mut scaler: Option<ffmpeg::software::scaling::Context> = None;
        let mut scaler_src = (0u32, 0u32, ffmpeg::format::Pixel::None);
        let mut packet = ffmpeg::Packet::empty();
        let mut decoded = frame::Video::empty();

        log::info!("LiveInput: capture thread running for {url}");

        while !shared.stop.load(Ordering::SeqCst) {
            match packet.read(&mut ictx) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    log::info!("LiveInput: stream {url} ended");
                    break;
                }
                Err(e) => {
                    log::debug!("LiveInput: read error on {url}: {e}");
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
            }

            if packet.stream() != stream_index {
                continue;
            }
            if decoder.send_packet(&packet).is_err() {
                continue;
            }

            while decoder.receive_frame(&mut decoded).is_ok() {
                let (w, h, fmt) = (decoded.width(), decoded.height(), decoded.format());

                if scaler.is_none() || scaler_src != (w, h, fmt) {
                    scaler = ffmpeg::software::scaling::Context::get(
                        fmt,
                        w,
                        h,
                        ffmpeg::format::Pixel::BGRA,
                        w,
                        h,
                        ffmpeg::software::scaling::Flags::BILINEAR,
                    )
                    .ok();
                    scaler_src = (w, h, fmt);
                }
                let Some(scaler) = scaler.as_mut() else {
                    continue;
                };

                let mut bgra = frame::Video::empty();
                if scaler.run(&decoded, &mut bgra).is_err() {
                    continue;
                }

                let mut info = *shared.info.lock();
                info.width = w;
                info.height = h;
                info.pixel_aspect = if h > 0 { w as f64 / h as f64 } else { 1.0 };
                info.pixel_format = PixelFormat::Bgra32;

                let mut buffer = FrameBuffer::new();
                if !buffer.allocate(info) {
                    continue;
                }
                let src_stride = bgra.stride(0);
                let dst_stride = buffer.stride();
                let row_bytes = dst_stride.min(src_stride);
                let src = bgra.data(0);
                let dst = buffer.data_mut();
                for row in 0..h as usize {
                    dst[row * dst_stride..row * dst_stride + row_bytes]
                        .copy_from_slice(&src[row * src_stride..row * src_stride + row_bytes]);
                }

                *shared.info.lock() = info;
                *shared.latest.lock() = Some(buffer);
                shared.frames_received.fetch_add(1, Ordering::SeqCst);
                shared.first_frame.notify_all();
            }
        }

        log::info!("LiveInput: capture thread for {url} exiting");
    }
}

impl InputSource for LiveInput {
    fn open(&mut self, source: &str) -> MediaResult<()> {
        self.close();
        self.url = source.to_string();
        self.shared.stop.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let url = self.url.clone();
        self.worker = Some(
            std::thread::Builder::new()
                .name("live-capture".into())
                .spawn(move || LiveInput::capture_loop(shared, url))
                .map_err(|e| MediaError::DecodeFatal(format!("capture thread spawn: {e}")))?,
        );

        // Wait briefly for the first frame; if none arrives the source
        // still reports ready with default format.
        let deadline = Instant::now() + self.initial_wait;
        let mut latest = self.shared.latest.lock();
        while latest.is_none() && Instant::now() < deadline {
            self.shared
                .first_frame
                .wait_for(&mut latest, Duration::from_millis(20));
        }
        if latest.is_none() {
            log::info!(
                "LiveInput: no frame from {} within {:?}, continuing with defaults",
                source,
                self.initial_wait
            );
        }
        drop(latest);

        self.ready = true;
        self.current_frame = -1;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.stop.store(true, Ordering::SeqCst);
            let _ = worker.join();
        }
        *self.shared.latest.lock() = None;
        *self.shared.info.lock() = default_live_info();
        self.shared.frames_received.store(0, Ordering::SeqCst);
        self.ready = false;
        self.current_frame = -1;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn read_frame(&mut self, frame_index: i64, buffer: &mut FrameBuffer) -> MediaResult<()> {
        if !self.ready {
            return Err(MediaError::NotReady);
        }

        let latest = self.shared.latest.lock();
        let frame = latest
            .as_ref()
            .ok_or_else(|| MediaError::DecodeTransient("no live frame received yet".into()))?;

        if !buffer.allocate(*frame.info()) {
            return Err(MediaError::InvalidArgument("buffer allocation failed".into()));
        }
        buffer.data_mut().copy_from_slice(frame.data());
        self.current_frame = frame_index.max(0);
        Ok(())
    }

    fn seek(&mut self, _frame_index: i64) -> MediaResult<()> {
        // Live sources have no timeline; a seek is accepted and ignored
        Ok(())
    }

    fn frame_info(&self) -> FrameInfo {
        *self.shared.info.lock()
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn detect_codec(&self) -> CodecKind {
        CodecKind::Other
    }

    fn optimal_backend(&self) -> DecodeBackend {
        DecodeBackend::CpuSoftware
    }
}

impl Drop for LiveInput {
    fn drop(&mut self) {
        self.close();
    }
}
