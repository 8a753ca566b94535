//! Async decode queue
//!
//! One producer thread per open source, pre-buffering a small window of
//! decoded frames ahead of a moving target index. The main thread asks for
//! frames by number and gets them without blocking on the decoder; for
//! hardware sources the queue decouples slow GPU decode from display
//! timing.
//!
//! Queue invariants: entries sorted by frame index, no duplicates, at most
//! `MAX_QUEUE_SIZE` entries, frames older than `target - 2` evicted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg_next as ffmpeg;
use ffmpeg::util::frame;
use parking_lot::{Condvar, Mutex};

use crate::error::{MediaError, MediaResult};
use crate::media::file::FileInput;
use crate::media::hardware::{HwDeviceContext, HwSetup};
use crate::media::{ensure_ffmpeg, CodecKind, FrameInfo};

/// Pre-buffer window. Small and bounded so the producer can neither race
/// ahead unboundedly nor hold more than a handful of surfaces.
pub const MAX_QUEUE_SIZE: usize = 8;

/// A decoded frame handed out by the queue. The payload is a refcounted
/// AVFrame clone: cheap, zero pixel copies, and valid for as long as the
/// caller keeps it regardless of later queue activity.
pub struct QueueFrame {
    pub index: i64,
    pub frame: frame::Video,
}

struct QueuedFrame {
    index: i64,
    frame: frame::Video,
    ready: bool,
}

// Queue entries are only touched under the queue mutex; the AVFrame inside
// is never accessed concurrently.
unsafe impl Send for QueuedFrame {}

struct QueueShared {
    queue: Mutex<VecDeque<QueuedFrame>>,
    cond: Condvar,
    stop: AtomicBool,
    target: AtomicI64,
    seek_requested: AtomicBool,
    seek_target: AtomicI64,
    last_decoded: AtomicI64,
}

/// Decoder half of the queue, driven by the producer thread.
pub(crate) trait FrameProducer: Send {
    /// Demuxer-level seek; decoder flushed.
    fn seek(&mut self, frame_index: i64) -> MediaResult<()>;

    /// Decode one frame; returns the PTS-derived frame index when the
    /// stream carries usable timestamps.
    fn decode_next(&mut self) -> MediaResult<(Option<i64>, frame::Video)>;
}

pub struct AsyncDecodeQueue {
    shared: Arc<QueueShared>,
    worker: Option<JoinHandle<()>>,
    info: FrameInfo,
    codec_kind: CodecKind,
    hardware: bool,
    ready: bool,
}

impl Default for AsyncDecodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncDecodeQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
                target: AtomicI64::new(0),
                seek_requested: AtomicBool::new(false),
                seek_target: AtomicI64::new(0),
                last_decoded: AtomicI64::new(-1),
            }),
            worker: None,
            info: FrameInfo::default(),
            codec_kind: CodecKind::Other,
            hardware: false,
            ready: false,
        }
    }

    /// Open `filename` and start the decode thread. A hardware device
    /// context switches the producer to hardware surfaces.
    pub fn open(&mut self, filename: &str, hw: Option<HwSetup>) -> MediaResult<()> {
        self.close();
        ensure_ffmpeg();

        let producer = FfmpegQueueProducer::open(filename, hw)?;
        self.info = producer.info;
        self.codec_kind = producer.codec_kind;
        self.hardware = producer.hardware;
        self.spawn_worker(Box::new(producer));

        log::info!(
            "AsyncDecodeQueue: opened {} ({}x{} @ {:.3} fps, {} decode)",
            filename,
            self.info.width,
            self.info.height,
            self.info.framerate,
            if self.hardware { "hardware" } else { "software" }
        );
        Ok(())
    }

    /// Start the queue over an arbitrary producer (used by unit tests).
    pub(crate) fn open_with_producer(&mut self, producer: Box<dyn FrameProducer>, info: FrameInfo) {
        self.close();
        self.info = info;
        self.spawn_worker(producer);
    }

    fn spawn_worker(&mut self, mut producer: Box<dyn FrameProducer>) {
        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.target.store(0, Ordering::SeqCst);
        self.shared.last_decoded.store(-1, Ordering::SeqCst);
        self.shared.seek_requested.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        self.worker = Some(
            std::thread::Builder::new()
                .name("decode-queue".into())
                .spawn(move || Self::producer_loop(&shared, producer.as_mut()))
                .expect("spawn decode thread"),
        );
        self.ready = true;
    }

    fn producer_loop(shared: &QueueShared, producer: &mut dyn FrameProducer) {
        log::debug!("AsyncDecodeQueue: decode thread started");

        while !shared.stop.load(Ordering::SeqCst) {
            if shared.seek_requested.swap(false, Ordering::SeqCst) {
                let seek_to = shared.seek_target.load(Ordering::SeqCst);
                if let Err(e) = producer.seek(seek_to) {
                    log::warn!("AsyncDecodeQueue: seek to {} failed: {}", seek_to, e);
                }
                shared.last_decoded.store(seek_to - 1, Ordering::SeqCst);
            }

            let target = shared.target.load(Ordering::SeqCst);
            let (queue_len, newest) = {
                let queue = shared.queue.lock();
                (queue.len(), queue.back().map(|f| f.index).unwrap_or(-1))
            };

            let should_decode = queue_len < MAX_QUEUE_SIZE
                && (newest < 0 || newest < target + MAX_QUEUE_SIZE as i64);

            if should_decode && !shared.stop.load(Ordering::SeqCst) {
                match producer.decode_next() {
                    Ok((pts_index, decoded)) => {
                        let index = pts_index
                            .unwrap_or_else(|| shared.last_decoded.load(Ordering::SeqCst) + 1);
                        Self::insert_sorted(shared, index, decoded);
                        shared.last_decoded.store(index, Ordering::SeqCst);
                        shared.cond.notify_all();
                    }
                    Err(e) => {
                        log::trace!("AsyncDecodeQueue: decode stalled: {}", e);
                        let mut queue = shared.queue.lock();
                        shared
                            .cond
                            .wait_for(&mut queue, Duration::from_millis(10));
                    }
                }
            } else {
                let mut queue = shared.queue.lock();
                shared.cond.wait_for(&mut queue, Duration::from_millis(5));
            }

            // Evict frames that fell behind the consumer
            {
                let current = shared.target.load(Ordering::SeqCst);
                let mut queue = shared.queue.lock();
                while queue
                    .front()
                    .map(|f| f.index < current - 2)
                    .unwrap_or(false)
                {
                    queue.pop_front();
                }
            }
        }

        log::debug!("AsyncDecodeQueue: decode thread stopped");
    }

    fn insert_sorted(shared: &QueueShared, index: i64, decoded: frame::Video) {
        let mut queue = shared.queue.lock();

        // A frame decoded before a pending seek must not land after the
        // seek cleared the queue; the flag is checked under the queue lock
        // so the clear and this insert cannot interleave.
        if shared.seek_requested.load(Ordering::SeqCst) {
            return;
        }

        // Duplicate indices would break the ordering guarantees; keep the
        // existing entry.
        if queue.iter().any(|f| f.index == index) {
            return;
        }

        let entry = QueuedFrame {
            index,
            frame: decoded,
            ready: true,
        };
        let at = queue.iter().position(|f| f.index > index);
        match at {
            Some(pos) => queue.insert(pos, entry),
            None => queue.push_back(entry),
        }
    }

    /// Stop the decode thread, join it and drain the queue.
    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.cond.notify_all();
            let _ = worker.join();
        }
        self.shared.queue.lock().clear();
        self.ready = false;
    }

    /// Request frame `frame_index`.
    ///
    /// Returns immediately when queued; otherwise waits up to `max_wait`
    /// while nudging the producer, then falls back to the closest earlier
    /// ready frame.
    pub fn get_frame(&self, frame_index: i64, max_wait: Duration) -> Option<QueueFrame> {
        self.shared.target.store(frame_index, Ordering::SeqCst);

        let mut queue = self.shared.queue.lock();
        if let Some(found) = Self::find_exact(&queue, frame_index) {
            return Some(found);
        }

        if !max_wait.is_zero() {
            let deadline = Instant::now() + max_wait;
            while Instant::now() < deadline {
                self.shared.cond.notify_all();
                self.shared
                    .cond
                    .wait_for(&mut queue, Duration::from_millis(1));
                if let Some(found) = Self::find_exact(&queue, frame_index) {
                    return Some(found);
                }
            }
        }

        // Closest earlier frame still beats a dropped tick
        queue
            .iter()
            .filter(|f| f.ready && f.index <= frame_index)
            .max_by_key(|f| f.index)
            .map(|f| QueueFrame {
                index: f.index,
                frame: f.frame.clone(),
            })
    }

    fn find_exact(queue: &VecDeque<QueuedFrame>, frame_index: i64) -> Option<QueueFrame> {
        queue
            .iter()
            .find(|f| f.index == frame_index && f.ready)
            .map(|f| QueueFrame {
                index: f.index,
                frame: f.frame.clone(),
            })
    }

    /// Flush the queue and restart decode at `frame_index`.
    ///
    /// The queue is cleared synchronously here, so once `seek` returns no
    /// pre-seek frame can be observed by `get_frame`.
    pub fn seek(&self, frame_index: i64) {
        // Target is published before the request flag so a producer that
        // consumes the flag early still seeks to the right place; flag set
        // and queue clear share the lock so no stale frame can slip in
        // between them.
        let mut queue = self.shared.queue.lock();
        self.shared.seek_target.store(frame_index, Ordering::SeqCst);
        self.shared.seek_requested.store(true, Ordering::SeqCst);
        queue.clear();
        drop(queue);

        self.shared.target.store(frame_index, Ordering::SeqCst);
        self.shared.last_decoded.store(-1, Ordering::SeqCst);
        self.shared.cond.notify_all();
    }

    pub fn has_frame(&self, frame_index: i64) -> bool {
        self.shared
            .queue
            .lock()
            .iter()
            .any(|f| f.index == frame_index && f.ready)
    }

    /// Move the pre-buffer target without requesting a frame.
    pub fn set_target_frame(&self, frame_index: i64) {
        self.shared.target.store(frame_index, Ordering::SeqCst);
        self.shared.cond.notify_one();
    }

    pub fn queue_size(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn oldest_frame(&self) -> i64 {
        self.shared
            .queue
            .lock()
            .front()
            .map(|f| f.index)
            .unwrap_or(-1)
    }

    pub fn newest_frame(&self) -> i64 {
        self.shared
            .queue
            .lock()
            .back()
            .map(|f| f.index)
            .unwrap_or(-1)
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_hardware(&self) -> bool {
        self.hardware
    }

    pub fn frame_info(&self) -> FrameInfo {
        self.info
    }

    pub fn codec_kind(&self) -> CodecKind {
        self.codec_kind
    }
}

impl Drop for AsyncDecodeQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// FFmpeg-backed producer: demuxer + (optionally hardware) decoder.
struct FfmpegQueueProducer {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    stream_index: usize,
    time_base: ffmpeg::ffi::AVRational,
    framerate_q: (i32, i32),
    info: FrameInfo,
    codec_kind: CodecKind,
    hardware: bool,
    // Keeps the shared device alive for the decoder's lifetime
    _device: Option<Arc<HwDeviceContext>>,
}

// Exclusively owned by the decode thread after open(); never shared.
unsafe impl Send for FfmpegQueueProducer {}

impl FfmpegQueueProducer {
    fn open(filename: &str, hw: Option<HwSetup>) -> MediaResult<Self> {
        let ictx = ffmpeg::format::input(&filename)
            .map_err(|e| MediaError::DecodeFatal(format!("open {filename} failed: {e}")))?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| MediaError::DecodeFatal(format!("no video stream in {filename}")))?;
        let stream_index = stream.index();
        let tb = stream.time_base();
        let parameters = stream.parameters();
        let codec_kind =
            FileInput::codec_kind_of(unsafe { (*parameters.as_ptr()).codec_id }.into());

        let mut hardware = false;
        let mut device = None;

        let decoder = match &hw {
            Some(HwSetup {
                wrapper_decoder: Some(name),
                device: dev,
            }) => {
                // Dedicated wrapper decoder (QSV / CUVID)
                match Self::open_wrapper_decoder(&parameters, name, dev) {
                    Ok(d) => {
                        hardware = true;
                        device = Some(dev.clone());
                        d
                    }
                    Err(e) => {
                        log::warn!(
                            "AsyncDecodeQueue: {name} failed ({e}), falling back to software"
                        );
                        Self::open_software_decoder(&parameters)?
                    }
                }
            }
            Some(HwSetup {
                wrapper_decoder: None,
                device: dev,
            }) => {
                // hwaccel via the standard decoder + hw_device_ctx
                match Self::open_hwaccel_decoder(&parameters, dev) {
                    Ok(d) => {
                        hardware = true;
                        device = Some(dev.clone());
                        d
                    }
                    Err(e) => {
                        log::warn!(
                            "AsyncDecodeQueue: hwaccel open failed ({e}), falling back to software"
                        );
                        Self::open_software_decoder(&parameters)?
                    }
                }
            }
            None => Self::open_software_decoder(&parameters)?,
        };

        let info = FileInput::probe_info(&ictx, stream_index, decoder.width(), decoder.height());

        Ok(Self {
            ictx,
            decoder,
            stream_index,
            time_base: ffmpeg::ffi::AVRational {
                num: tb.numerator(),
                den: tb.denominator(),
            },
            framerate_q: info.framerate_q,
            info,
            codec_kind,
            hardware,
            _device: device,
        })
    }

    fn open_software_decoder(
        parameters: &ffmpeg::codec::Parameters,
    ) -> MediaResult<ffmpeg::decoder::Video> {
        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters.clone())
            .map_err(|e| MediaError::DecodeFatal(format!("codec parameters: {e}")))?;
        context.set_threading(ffmpeg::threading::Config {
            kind: ffmpeg::threading::Type::Frame,
            count: 4,
            ..Default::default()
        });
        context
            .decoder()
            .video()
            .map_err(|e| MediaError::DecodeFatal(format!("software codec open failed: {e}")))
    }

    fn open_hwaccel_decoder(
        parameters: &ffmpeg::codec::Parameters,
        device: &Arc<HwDeviceContext>,
    ) -> MediaResult<ffmpeg::decoder::Video> {
        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters.clone())
            .map_err(|e| MediaError::DecodeFatal(format!("codec parameters: {e}")))?;

        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).hw_device_ctx = ffmpeg::ffi::av_buffer_ref(device.as_ptr());
            if (*raw).hw_device_ctx.is_null() {
                return Err(MediaError::HardwareUnavailable(
                    "could not reference hardware device context".into(),
                ));
            }
        }

        context
            .decoder()
            .video()
            .map_err(|e| MediaError::HardwareUnavailable(format!("hwaccel open failed: {e}")))
    }

    fn open_wrapper_decoder(
        parameters: &ffmpeg::codec::Parameters,
        name: &str,
        device: &Arc<HwDeviceContext>,
    ) -> MediaResult<ffmpeg::decoder::Video> {
        let codec = ffmpeg::decoder::find_by_name(name)
            .ok_or_else(|| MediaError::HardwareUnavailable(format!("no decoder named {name}")))?;

        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters.clone())
            .map_err(|e| MediaError::DecodeFatal(format!("codec parameters: {e}")))?;

        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).hw_device_ctx = ffmpeg::ffi::av_buffer_ref(device.as_ptr());
        }

        context
            .decoder()
            .open_as(codec)
            .map_err(|e| MediaError::HardwareUnavailable(format!("{name} open failed: {e}")))?
            .video()
            .map_err(|e| MediaError::HardwareUnavailable(format!("{name} is not video: {e}")))
    }
}

impl FrameProducer for FfmpegQueueProducer {
    fn seek(&mut self, frame_index: i64) -> MediaResult<()> {
        let (num, den) = self.framerate_q;
        let timestamp = if num > 0 {
            unsafe {
                ffmpeg::ffi::av_rescale_q(
                    frame_index,
                    ffmpeg::ffi::AVRational { num: den, den: num },
                    self.time_base,
                )
            }
        } else {
            0
        };

        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.ictx.as_mut_ptr(),
                self.stream_index as i32,
                timestamp,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(MediaError::DecodeFatal(format!(
                "seek to frame {frame_index} failed ({ret})"
            )));
        }
        self.decoder.flush();
        Ok(())
    }

    fn decode_next(&mut self) -> MediaResult<(Option<i64>, frame::Video)> {
        let mut decoded = frame::Video::empty();
        let mut packet = ffmpeg::Packet::empty();
        let mut attempts = 100;

        loop {
            if attempts == 0 {
                return Err(MediaError::DecodeTransient(
                    "no frame within packet limit".into(),
                ));
            }
            attempts -= 1;

            match self.decoder.receive_frame(&mut decoded) {
                Ok(()) => break,
                Err(ffmpeg::Error::Other {
                    errno: ffmpeg::util::error::EAGAIN,
                }) => {}
                Err(ffmpeg::Error::Eof) => {
                    return Err(MediaError::DecodeTransient("end of stream".into()))
                }
                Err(e) => {
                    return Err(MediaError::DecodeTransient(format!("receive_frame: {e}")))
                }
            }

            match packet.read(&mut self.ictx) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    let _ = self.decoder.send_eof();
                    continue;
                }
                Err(e) => return Err(MediaError::DecodeTransient(format!("read packet: {e}"))),
            }

            if packet.stream() != self.stream_index {
                continue;
            }
            if let Err(e) = self.decoder.send_packet(&packet) {
                log::trace!("AsyncDecodeQueue: send_packet: {e}");
            }
        }

        let index = decoded.timestamp().or(decoded.pts()).map(|pts| {
            let seconds = pts as f64 * self.time_base.num as f64 / self.time_base.den as f64;
            (seconds * self.info.framerate + 0.5) as i64
        });

        Ok((index, decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthetic 25 fps producer: instant seeks, tiny decode delay, frames
    /// carry their index so tests can verify exactness.
    struct StubProducer {
        next: i64,
        decode_delay: Duration,
    }

    impl StubProducer {
        fn new() -> Self {
            Self {
                next: 0,
                decode_delay: Duration::from_micros(200),
            }
        }
    }

    impl FrameProducer for StubProducer {
        fn seek(&mut self, frame_index: i64) -> MediaResult<()> {
            self.next = frame_index;
            Ok(())
        }

        fn decode_next(&mut self) -> MediaResult<(Option<i64>, frame::Video)> {
            std::thread::sleep(self.decode_delay);
            let index = self.next;
            self.next += 1;
            let frame = frame::Video::new(ffmpeg::format::Pixel::RGBA, 16, 16);
            Ok((Some(index), frame))
        }
    }

    fn test_info() -> FrameInfo {
        FrameInfo {
            width: 16,
            height: 16,
            pixel_aspect: 1.0,
            framerate: 25.0,
            framerate_q: (25, 1),
            total_frames: 100_000,
            duration_seconds: 4000.0,
            pixel_format: crate::media::PixelFormat::Bgra32,
        }
    }

    fn open_stub() -> AsyncDecodeQueue {
        ensure_ffmpeg();
        let mut queue = AsyncDecodeQueue::new();
        queue.open_with_producer(Box::new(StubProducer::new()), test_info());
        queue
    }

    #[test]
    fn get_frame_waits_for_exact_index() {
        let queue = open_stub();
        let got = queue
            .get_frame(5, Duration::from_millis(500))
            .expect("frame 5 should arrive");
        assert_eq!(got.index, 5);
        queue.get_frame(5, Duration::ZERO);
    }

    #[test]
    fn queue_stays_sorted_unique_and_bounded() {
        let queue = open_stub();
        let _ = queue.get_frame(0, Duration::from_millis(300));

        // Let the producer fill its window, then check the invariants
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(2));
            let guard = queue.shared.queue.lock();
            assert!(guard.len() <= MAX_QUEUE_SIZE);
            for pair in guard.as_slices().0.windows(2) {
                assert!(pair[0].index < pair[1].index);
            }
        }
    }

    #[test]
    fn seek_is_atomic_wrt_get_frame() {
        let queue = open_stub();
        let _ = queue.get_frame(0, Duration::from_millis(300));

        queue.seek(1000);

        // Immediately after seek returns, nothing older than the target
        // (minus the eviction margin) may be visible.
        assert!(queue.get_frame(500, Duration::ZERO).is_none());

        let got = queue
            .get_frame(1000, Duration::from_millis(500))
            .expect("seek target should decode");
        assert_eq!(got.index, 1000);
        assert!(queue.queue_size() <= MAX_QUEUE_SIZE);
        assert!(queue.oldest_frame() >= 998);
    }

    #[test]
    fn eviction_tracks_target() {
        let queue = open_stub();
        let _ = queue.get_frame(0, Duration::from_millis(300));

        // Move the target forward; old frames must be trimmed
        let _ = queue.get_frame(20, Duration::from_millis(500));
        std::thread::sleep(Duration::from_millis(20));
        assert!(queue.oldest_frame() >= 18);
    }

    #[test]
    fn closest_earlier_fallback() {
        let queue = open_stub();
        let _ = queue.get_frame(10, Duration::from_millis(500));

        // Ask for a frame far ahead without waiting: the best earlier
        // ready frame comes back instead.
        let got = queue.get_frame(10_000, Duration::ZERO);
        if let Some(frame) = got {
            assert!(frame.index <= 10_000);
        }
    }

    #[test]
    fn close_joins_and_drains() {
        let mut queue = open_stub();
        let _ = queue.get_frame(3, Duration::from_millis(300));
        queue.close();
        assert_eq!(queue.queue_size(), 0);
        assert!(!queue.is_ready());
    }
}
