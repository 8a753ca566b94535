//! Software file input
//!
//! Demuxer + software decoder with an optional per-frame seek index. The
//! index is built by scanning the file's packets once at open; it records,
//! per frame, the packet timestamps/positions and those of the governing
//! keyframe, enabling exact byte-position seeks. Without the index a
//! timestamp-based seek path is used (sufficient for keyframe-sparse
//! files).
//!
//! Decoded frames are converted to the renderer's BGRA layout through a
//! rescaler that is built lazily and reused while the source geometry is
//! stable.

use ffmpeg_next as ffmpeg;

use ffmpeg::software::scaling;
use ffmpeg::util::frame;

use crate::error::{MediaError, MediaResult};
use crate::media::{
    ensure_ffmpeg, CodecKind, DecodeBackend, FrameBuffer, FrameInfo, InputSource, PixelFormat,
};

/// How many consecutive non-video/error events the decode loop tolerates
/// before giving up on a frame.
const DECODE_BAILOUT: i32 = 20;

/// Per-frame seek index entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameIndexEntry {
    pub pkt_pts: i64,
    pub pkt_pos: i64,
    pub frame_pts: i64,
    /// Timestamp of the governing keyframe (GOP head).
    pub seek_pts: i64,
    /// Byte position of the governing keyframe.
    pub seek_pos: i64,
    pub keyframe: bool,
}

/// Scan all packets of `stream_index` once, recording each frame's packet
/// timestamps/positions and those of its governing keyframe, then rewind.
pub(crate) fn scan_packet_index(
    ictx: &mut ffmpeg::format::context::Input,
    stream_index: usize,
) -> MediaResult<Vec<FrameIndexEntry>> {
    let mut index = Vec::new();
    let mut last_key_pts = -1i64;
    let mut last_key_pos = -1i64;

    for (stream, packet) in ictx.packets() {
        if stream.index() != stream_index {
            continue;
        }

        let ts = match packet.pts().or(packet.dts()) {
            Some(t) => t,
            None => continue,
        };
        let pos = packet.position() as i64;

        if packet.is_key() || last_key_pts < 0 {
            last_key_pts = ts;
            last_key_pos = pos;
        }

        index.push(FrameIndexEntry {
            pkt_pts: packet.pts().unwrap_or(ts),
            pkt_pos: pos,
            frame_pts: ts,
            seek_pts: last_key_pts,
            seek_pos: last_key_pos,
            keyframe: packet.is_key(),
        });
    }

    // Packet order is decode order; presentation order can differ with
    // B-frames. Sorting by timestamp gives index position == display frame
    // number.
    index.sort_by_key(|e| e.frame_pts);

    unsafe {
        let ret = ffmpeg::ffi::av_seek_frame(
            ictx.as_mut_ptr(),
            stream_index as i32,
            0,
            ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
        );
        if ret < 0 {
            return Err(MediaError::DecodeFatal(format!(
                "rewind after index scan failed ({ret})"
            )));
        }
    }

    Ok(index)
}

pub struct FileInput {
    ictx: Option<ffmpeg::format::context::Input>,
    decoder: Option<ffmpeg::decoder::Video>,
    stream_index: usize,
    time_base: ffmpeg::ffi::AVRational,
    scaler: Option<scaling::Context>,
    scaler_src: (u32, u32, ffmpeg::format::Pixel),
    index: Vec<FrameIndexEntry>,
    no_index: bool,
    byte_seek: bool,
    last_decoded_pts: i64,
    last_decoded_frame: i64,
    info: FrameInfo,
    codec_kind: CodecKind,
    current_frame: i64,
    ready: bool,
    path: String,
}

// The FFmpeg contexts are only ever touched by the thread currently owning
// this value; the loader builds it on its worker and hands it to the engine
// thread, never sharing it.
unsafe impl Send for FileInput {}

impl FileInput {
    pub fn new(no_index: bool) -> Self {
        Self {
            ictx: None,
            decoder: None,
            stream_index: 0,
            time_base: ffmpeg::ffi::AVRational { num: 1, den: 1 },
            scaler: None,
            scaler_src: (0, 0, ffmpeg::format::Pixel::None),
            index: Vec::new(),
            no_index,
            byte_seek: true,
            last_decoded_pts: -1,
            last_decoded_frame: -1,
            info: FrameInfo::default(),
            codec_kind: CodecKind::Other,
            current_frame: -1,
            ready: false,
            path: String::new(),
        }
    }

    pub(crate) fn codec_kind_of(id: ffmpeg::codec::Id) -> CodecKind {
        match id {
            ffmpeg::codec::Id::H264 => CodecKind::H264,
            ffmpeg::codec::Id::HEVC => CodecKind::Hevc,
            ffmpeg::codec::Id::VP9 => CodecKind::Vp9,
            ffmpeg::codec::Id::AV1 => CodecKind::Av1,
            ffmpeg::codec::Id::HAP => CodecKind::Hap,
            _ => CodecKind::Other,
        }
    }

    /// Stream properties shared by all file-backed inputs.
    pub(crate) fn probe_info(
        ictx: &ffmpeg::format::context::Input,
        stream_index: usize,
        width: u32,
        height: u32,
    ) -> FrameInfo {
        let stream = ictx
            .streams()
            .nth(stream_index)
            .expect("stream probed at open");

        let rate = stream.avg_frame_rate();
        let rate = if rate.numerator() > 0 && rate.denominator() > 0 {
            rate
        } else {
            stream.rate()
        };
        let (framerate, framerate_q) = if rate.numerator() > 0 && rate.denominator() > 0 {
            (
                rate.numerator() as f64 / rate.denominator() as f64,
                (rate.numerator(), rate.denominator()),
            )
        } else {
            (25.0, (25, 1))
        };

        let duration_seconds = if ictx.duration() > 0 {
            ictx.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE)
        } else {
            0.0
        };

        let total_frames = if stream.frames() > 0 {
            stream.frames()
        } else if duration_seconds > 0.0 {
            (duration_seconds * framerate) as i64
        } else {
            0
        };

        FrameInfo {
            width,
            height,
            pixel_aspect: if height > 0 {
                width as f64 / height as f64
            } else {
                0.0
            },
            framerate,
            framerate_q,
            total_frames,
            duration_seconds,
            pixel_format: PixelFormat::Bgra32,
        }
    }

    /// Scan every video packet once, recording per-frame seek targets.
    fn build_index(&mut self) -> MediaResult<()> {
        let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;
        self.index = scan_packet_index(ictx, self.stream_index)?;
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }

        log::info!(
            "FileInput: indexed {} frames for {}",
            self.index.len(),
            self.path
        );
        Ok(())
    }

    /// Presentation timestamp the decode loop should run to for `frame`.
    fn target_pts(&self, frame: i64) -> i64 {
        if let Some(entry) = self.index.get(frame as usize) {
            return entry.frame_pts;
        }
        // No index: derive from the frame rate
        let (num, den) = self.info.framerate_q;
        if num <= 0 {
            return 0;
        }
        unsafe {
            ffmpeg::ffi::av_rescale_q(
                frame,
                ffmpeg::ffi::AVRational { num: den, den: num },
                self.time_base,
            )
        }
    }

    fn seek_by_timestamp(&mut self, frame: i64) -> MediaResult<()> {
        if self.info.framerate <= 0.0 {
            return Err(MediaError::DecodeFatal("unknown frame rate".into()));
        }
        let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;

        let target_seconds = frame as f64 / self.info.framerate;
        let target = (target_seconds * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;

        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                ictx.as_mut_ptr(),
                -1,
                target,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        if ret < 0 {
            return Err(MediaError::DecodeFatal(format!(
                "timestamp seek to frame {frame} failed ({ret})"
            )));
        }

        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        }
        self.last_decoded_pts = -1;
        self.last_decoded_frame = -1;
        self.current_frame = frame;
        Ok(())
    }

    fn seek_indexed(&mut self, frame: i64) -> MediaResult<()> {
        let entry = *self
            .index
            .get(frame as usize)
            .ok_or_else(|| MediaError::InvalidArgument(format!("frame {frame} out of range")))?;

        // Seek policy: rewind, cold start, or a jump into another GOP all
        // require a demuxer seek; stepping forward inside the current GOP
        // just decodes ahead.
        let need_seek = if self.last_decoded_pts < 0 || self.last_decoded_frame < 0 {
            true
        } else if self.last_decoded_pts > entry.frame_pts {
            true
        } else if frame - self.last_decoded_frame != 1 {
            match self.index.get(self.last_decoded_frame as usize) {
                Some(last) => entry.seek_pts != last.seek_pts,
                None => true,
            }
        } else {
            false
        };

        self.last_decoded_pts = -1;
        self.last_decoded_frame = -1;

        if need_seek {
            let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;
            let ret = unsafe {
                if self.byte_seek && entry.seek_pos > 0 {
                    ffmpeg::ffi::av_seek_frame(
                        ictx.as_mut_ptr(),
                        self.stream_index as i32,
                        entry.seek_pos,
                        (ffmpeg::ffi::AVSEEK_FLAG_BACKWARD | ffmpeg::ffi::AVSEEK_FLAG_BYTE) as i32,
                    )
                } else {
                    ffmpeg::ffi::av_seek_frame(
                        ictx.as_mut_ptr(),
                        self.stream_index as i32,
                        entry.seek_pts,
                        ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as i32,
                    )
                }
            };
            if ret < 0 {
                return Err(MediaError::DecodeFatal(format!(
                    "seek to frame {frame} failed ({ret})"
                )));
            }
            if let Some(decoder) = self.decoder.as_mut() {
                decoder.flush();
            }
        }

        self.current_frame = frame;
        Ok(())
    }

    /// Run the decoder until the frame at `target_pts` emerges.
    fn decode_until(&mut self, target_pts: i64) -> MediaResult<frame::Video> {
        let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;
        let decoder = self.decoder.as_mut().ok_or(MediaError::NotReady)?;
        let stream_index = self.stream_index;

        let mut decoded = frame::Video::empty();
        let mut bailout = DECODE_BAILOUT;
        let mut packet = ffmpeg::Packet::empty();

        while bailout > 0 {
            match decoder.receive_frame(&mut decoded) {
                Ok(()) => {
                    let pts = decoded.timestamp().or(decoded.pts()).unwrap_or(-1);
                    if pts < 0 || pts >= target_pts {
                        return Ok(decoded);
                    }
                    // Burn through frames preceding the target (post-seek)
                    continue;
                }
                Err(ffmpeg::Error::Other {
                    errno: ffmpeg::util::error::EAGAIN,
                }) => {}
                Err(ffmpeg::Error::Eof) => {
                    return Err(MediaError::DecodeTransient("decoder drained at EOF".into()));
                }
                Err(e) => {
                    bailout -= 1;
                    log::debug!("FileInput: receive_frame error: {e}");
                    continue;
                }
            }

            // Decoder wants input
            match packet.read(ictx) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => {
                    let _ = decoder.send_eof();
                    bailout -= 1;
                    continue;
                }
                Err(e) => {
                    bailout -= 1;
                    log::debug!("FileInput: packet read error: {e}");
                    continue;
                }
            }

            if packet.stream() != stream_index {
                continue;
            }

            if let Err(e) = decoder.send_packet(&packet) {
                bailout -= 1;
                log::debug!("FileInput: send_packet error: {e}");
            }
        }

        Err(MediaError::DecodeTransient(format!(
            "no frame produced within {DECODE_BAILOUT} attempts"
        )))
    }

    /// Convert `decoded` to BGRA into `buffer`, rebuilding the rescaler
    /// only when the source geometry changed.
    fn convert_to_buffer(
        &mut self,
        decoded: &frame::Video,
        buffer: &mut FrameBuffer,
    ) -> MediaResult<()> {
        let (w, h, fmt) = (decoded.width(), decoded.height(), decoded.format());

        if self.scaler.is_none() || self.scaler_src != (w, h, fmt) {
            self.scaler = Some(
                scaling::Context::get(
                    fmt,
                    w,
                    h,
                    ffmpeg::format::Pixel::BGRA,
                    w,
                    h,
                    scaling::Flags::BICUBIC,
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
}

impl InputSource for FileInput {
    fn open(&mut self, source: &str) -> MediaResult<()> {
        if source.is_empty() {
            return Err(MediaError::InvalidArgument("empty path".into()));
        }
        self.close();
        ensure_ffmpeg();
        self.path = source.to_string();

        let ictx = ffmpeg::format::input(&source)
            .map_err(|e| MediaError::DecodeFatal(format!("open {source} failed: {e}")))?;

        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| MediaError::DecodeFatal(format!("no video stream in {source}")))?;
        let stream_index = stream.index();
        let tb = stream.time_base();
        let parameters = stream.parameters();

        let mut context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| MediaError::DecodeFatal(format!("codec parameters: {e}")))?;
        context.set_threading(ffmpeg::threading::Config {
            kind: ffmpeg::threading::Type::Frame,
            count: 4,
            ..Default::default()
        });
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| MediaError::DecodeFatal(format!("codec open failed: {e}")))?;

        self.codec_kind = Self::codec_kind_of(decoder.id());
        self.time_base = ffmpeg::ffi::AVRational {
            num: tb.numerator(),
            den: tb.denominator(),
        };
        self.info = Self::probe_info(&ictx, stream_index, decoder.width(), decoder.height());
        self.stream_index = stream_index;
        self.ictx = Some(ictx);
        self.decoder = Some(decoder);

        if self.no_index {
            log::info!("FileInput: index disabled, using timestamp seeks for {source}");
        } else {
            self.build_index()?;
            if self.info.total_frames == 0 {
                self.info.total_frames = self.index.len() as i64;
            }
        }

        self.ready = true;
        self.current_frame = -1;
        log::info!(
            "FileInput: opened {} ({}x{} @ {:.3} fps, {} frames)",
            source,
            self.info.width,
            self.info.height,
            self.info.framerate,
            self.info.total_frames
        );
        Ok(())
    }

    fn close(&mut self) {
        self.scaler = None;
        self.decoder = None;
        self.ictx = None;
        self.index.clear();
        self.last_decoded_pts = -1;
        self.last_decoded_frame = -1;
        self.current_frame = -1;
        self.info = FrameInfo::default();
        self.ready = false;
        self.path.clear();
    }

    fn is_ready(&self) -> bool {
        self.ready && self.ictx.is_some()
    }

    fn read_frame(&mut self, frame_index: i64, buffer: &mut FrameBuffer) -> MediaResult<()> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }

        self.seek(frame_index)?;

        let target_pts = self.target_pts(frame_index);
        let decoded = self.decode_until(target_pts)?;
        self.convert_to_buffer(&decoded, buffer)?;

        if let Some(pts) = decoded.timestamp().or(decoded.pts()) {
            self.last_decoded_pts = pts;
            self.last_decoded_frame = frame_index;
        }
        self.current_frame = frame_index;
        Ok(())
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

        if self.no_index || self.index.is_empty() {
            if self.info.total_frames > 0 && frame_index >= self.info.total_frames {
                return Err(MediaError::InvalidArgument(format!(
                    "frame {frame_index} beyond end"
                )));
            }
            return self.seek_by_timestamp(frame_index);
        }

        self.seek_indexed(frame_index)
    }

    fn frame_info(&self) -> FrameInfo {
        self.info
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn detect_codec(&self) -> CodecKind {
        self.codec_kind
    }

    fn optimal_backend(&self) -> DecodeBackend {
        DecodeBackend::CpuSoftware
    }
}

impl Drop for FileInput {
    fn drop(&mut self) {
        self.close();
    }
}
