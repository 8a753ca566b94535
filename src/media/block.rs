//! Hap block-codec input
//!
//! Hap frames are block-compressed textures packaged in the container;
//! decoding a frame means parsing the packet's section header(s) and
//! handing the compressed payload to the GPU unchanged. No pixel work, no
//! color conversion.
//!
//! Packet layout: each section starts with a 4-byte header (24-bit little
//! endian size + one type byte; a zero size is followed by a 32-bit
//! extended size). The type byte's low nibble is the texture format, the
//! high nibble the second-stage compressor. Multi-texture frames (the
//! YCoCg + alpha variant) nest one section per texture.

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::error::{MediaError, MediaResult};
use crate::media::file::{scan_packet_index, FrameIndexEntry};
use crate::media::gpu::{block_coded_size, BlockVariant, GpuContext};
use crate::media::{
    ensure_ffmpeg, CodecKind, DecodeBackend, FrameBuffer, FrameInfo, GpuTextureFrame, InputSource,
    PixelFormat,
};

const DECODE_BAILOUT: i32 = 20;

// Section type byte, low nibble: texture format
const FMT_RGB_DXT1: u8 = 0xB;
const FMT_RGBA_DXT5: u8 = 0xE;
const FMT_YCOCG_DXT5: u8 = 0xF;
const FMT_A_RGTC1: u8 = 0x1;
const FMT_RGBA_BC7: u8 = 0x7;
const FMT_MULTI: u8 = 0xD;

// Section type byte, high nibble: second-stage compressor
const COMP_NONE: u8 = 0xA;
const COMP_SNAPPY: u8 = 0xB;
const COMP_COMPLEX: u8 = 0xC;

/// One parsed texture section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HapSection<'a> {
    pub format: u8,
    pub compressor: u8,
    pub payload: &'a [u8],
}

/// Parse one section header; returns the section and the bytes following
/// it.
fn parse_section(data: &[u8]) -> MediaResult<(HapSection<'_>, &[u8])> {
    if data.len() < 4 {
        return Err(MediaError::DecodeTransient("truncated section header".into()));
    }

    let mut size = u32::from_le_bytes([data[0], data[1], data[2], 0]) as usize;
    let type_byte = data[3];
    let mut offset = 4;

    if size == 0 {
        // Extended 32-bit size follows the type byte
        if data.len() < 8 {
            return Err(MediaError::DecodeTransient("truncated extended header".into()));
        }
        size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
        offset = 8;
    }

    if data.len() < offset + size {
        return Err(MediaError::DecodeTransient(format!(
            "section claims {size} bytes, {} available",
            data.len() - offset
        )));
    }

    Ok((
        HapSection {
            format: type_byte & 0x0F,
            compressor: (type_byte >> 4) & 0x0F,
            payload: &data[offset..offset + size],
        },
        &data[offset + size..],
    ))
}

/// Split a packet into its texture sections (one, or two for the
/// dual-texture variant).
pub(crate) fn parse_packet(data: &[u8]) -> MediaResult<Vec<HapSection<'_>>> {
    let (top, _) = parse_section(data)?;

    if top.format != FMT_MULTI {
        return Ok(vec![top]);
    }

    // Multi-texture: nested sections back to back
    let mut sections = Vec::new();
    let mut rest = top.payload;
    while !rest.is_empty() {
        let (section, tail) = parse_section(rest)?;
        sections.push(section);
        rest = tail;
    }
    if sections.is_empty() {
        return Err(MediaError::DecodeTransient("empty multi-texture frame".into()));
    }
    Ok(sections)
}

fn variant_for_format(format: u8) -> Option<BlockVariant> {
    match format {
        FMT_RGB_DXT1 => Some(BlockVariant::Rgb),
        FMT_RGBA_DXT5 => Some(BlockVariant::Rgba),
        FMT_YCOCG_DXT5 => Some(BlockVariant::Ycocg),
        FMT_RGBA_BC7 => Some(BlockVariant::HighQuality),
        _ => None,
    }
}

fn codec_kind_for(variant: BlockVariant, dual: bool) -> CodecKind {
    if dual {
        return CodecKind::HapQAlpha;
    }
    match variant {
        BlockVariant::Rgb => CodecKind::Hap,
        BlockVariant::Rgba => CodecKind::HapAlpha,
        BlockVariant::Ycocg => CodecKind::HapQ,
        BlockVariant::YcocgAlpha => CodecKind::HapQAlpha,
        BlockVariant::HighQuality => CodecKind::HapR,
        BlockVariant::None => CodecKind::Hap,
    }
}

/// Container fourcc to variant; the container tag beats any payload
/// heuristic when present.
fn variant_from_tag(tag: u32) -> Option<(BlockVariant, bool)> {
    match &tag.to_le_bytes() {
        b"Hap1" => Some((BlockVariant::Rgb, false)),
        b"Hap5" => Some((BlockVariant::Rgba, false)),
        b"HapY" => Some((BlockVariant::Ycocg, false)),
        b"HapM" => Some((BlockVariant::YcocgAlpha, true)),
        _ => None,
    }
}

pub struct HapInput {
    gpu: Option<Arc<GpuContext>>,
    direct_upload: bool,
    ictx: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    index: Vec<FrameIndexEntry>,
    last_decoded_pts: i64,
    last_decoded_frame: i64,
    variant: BlockVariant,
    dual_texture: bool,
    variant_refined: bool,
    info: FrameInfo,
    current_frame: i64,
    ready: bool,
    path: String,
}

// Demux context is only touched by the owning thread.
unsafe impl Send for HapInput {}

impl HapInput {
    pub fn new(gpu: Option<Arc<GpuContext>>, direct_upload: bool) -> Self {
        Self {
            gpu,
            direct_upload,
            ictx: None,
            stream_index: 0,
            index: Vec::new(),
            last_decoded_pts: -1,
            last_decoded_frame: -1,
            variant: BlockVariant::Rgb,
            dual_texture: false,
            variant_refined: false,
            info: FrameInfo::default(),
            current_frame: -1,
            ready: false,
            path: String::new(),
        }
    }

    /// Promote the variant when the first frame's payload size accounts
    /// better for RGBA blocks than RGB blocks. Only runs when the
    /// container carried no usable tag.
    fn refine_variant(&mut self, payload_len: usize) {
        if self.variant_refined || self.variant != BlockVariant::Rgb {
            return;
        }
        self.variant_refined = true;

        let rgb_size = block_coded_size(self.info.width, self.info.height, 8);
        let rgba_size = block_coded_size(self.info.width, self.info.height, 16);
        let rgb_diff = payload_len.abs_diff(rgb_size);
        let rgba_diff = payload_len.abs_diff(rgba_size);

        if rgba_diff < rgb_diff && payload_len * 10 >= rgba_size * 9 {
            log::info!(
                "HapInput: {} payload size {} closer to RGBA-block accounting, promoting variant",
                self.path,
                payload_len
            );
            self.variant = BlockVariant::Rgba;
        }
    }

    fn seek_internal(&mut self, frame_index: i64) -> MediaResult<()> {
        let entry = match self.index.get(frame_index as usize) {
            Some(e) => *e,
            None => {
                if self.info.total_frames > 0 && frame_index >= self.info.total_frames {
                    return Err(MediaError::InvalidArgument(format!(
                        "frame {frame_index} out of range"
                    )));
                }
                return self.seek_by_timestamp(frame_index);
            }
        };

        let need_seek = if self.last_decoded_pts < 0 || self.last_decoded_frame < 0 {
            true
        } else if self.last_decoded_pts > entry.frame_pts {
            true
        } else if frame_index - self.last_decoded_frame != 1 {
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
                if entry.seek_pos > 0 {
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
                    "seek to frame {frame_index} failed ({ret})"
                )));
            }
        }

        self.current_frame = frame_index;
        Ok(())
    }

    fn seek_by_timestamp(&mut self, frame_index: i64) -> MediaResult<()> {
        if self.info.framerate <= 0.0 {
            return Err(MediaError::DecodeFatal("unknown frame rate".into()));
        }
        let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;
        let target = (frame_index as f64 / self.info.framerate
            * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
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
                "timestamp seek to frame {frame_index} failed ({ret})"
            )));
        }
        self.last_decoded_pts = -1;
        self.last_decoded_frame = -1;
        self.current_frame = frame_index;
        Ok(())
    }

    /// Read the next packet of the video stream.
    fn next_video_packet(&mut self) -> MediaResult<ffmpeg::Packet> {
        let ictx = self.ictx.as_mut().ok_or(MediaError::NotReady)?;
        let mut packet = ffmpeg::Packet::empty();
        let mut bailout = DECODE_BAILOUT;

        while bailout > 0 {
            match packet.read(ictx) {
                Ok(()) => {
                    if packet.stream() == self.stream_index {
                        return Ok(packet);
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    return Err(MediaError::DecodeTransient("end of stream".into()))
                }
                Err(e) => {
                    log::debug!("HapInput: packet read error: {e}");
                }
            }
            bailout -= 1;
        }
        Err(MediaError::DecodeTransient(format!(
            "no video packet within {DECODE_BAILOUT} reads"
        )))
    }
}

impl InputSource for HapInput {
    fn open(&mut self, source: &str) -> MediaResult<()> {
        if source.is_empty() {
            return Err(MediaError::InvalidArgument("empty path".into()));
        }
        self.close();
        ensure_ffmpeg();
        self.path = source.to_string();

        let mut ictx = ffmpeg::format::input(&source)
            .map_err(|e| MediaError::DecodeFatal(format!("open {source} failed: {e}")))?;

        let (stream_index, width, height, tag) = {
            let stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| MediaError::DecodeFatal(format!("no video stream in {source}")))?;
            let par = stream.parameters();
            let raw = unsafe { &*par.as_ptr() };
            let codec_id: ffmpeg::codec::Id = raw.codec_id.into();
            if codec_id != ffmpeg::codec::Id::HAP {
                return Err(MediaError::InvalidArgument(format!(
                    "{source} is not a Hap file"
                )));
            }
            (
                stream.index(),
                raw.width as u32,
                raw.height as u32,
                raw.codec_tag,
            )
        };

        match variant_from_tag(tag) {
            Some((variant, dual)) => {
                self.variant = variant;
                self.dual_texture = dual;
                self.variant_refined = true;
            }
            None => {
                // Unknown tag; assume RGB blocks and let the first frame's
                // size refine it
                self.variant = BlockVariant::Rgb;
                self.dual_texture = false;
                self.variant_refined = false;
            }
        }

        self.info = crate::media::file::FileInput::probe_info(&ictx, stream_index, width, height);
        self.info.pixel_format = PixelFormat::HwSurface;

        self.index = match scan_packet_index(&mut ictx, stream_index) {
            Ok(index) => index,
            Err(e) => {
                // Indexing is an optimization; timestamp seeks still work
                log::warn!("HapInput: index scan failed ({e}), using timestamp seeks");
                Vec::new()
            }
        };
        if self.info.total_frames == 0 {
            self.info.total_frames = self.index.len() as i64;
        }

        self.stream_index = stream_index;
        self.ictx = Some(ictx);
        self.ready = true;
        self.current_frame = -1;
        log::info!(
            "HapInput: opened {} ({}x{}, {:?}, {} frames)",
            source,
            self.info.width,
            self.info.height,
            self.variant,
            self.info.total_frames
        );
        Ok(())
    }

    fn close(&mut self) {
        self.ictx = None;
        self.index.clear();
        self.last_decoded_pts = -1;
        self.last_decoded_frame = -1;
        self.info = FrameInfo::default();
        self.current_frame = -1;
        self.ready = false;
        self.path.clear();
    }

    fn is_ready(&self) -> bool {
        self.ready && self.ictx.is_some()
    }

    fn read_frame(&mut self, _frame_index: i64, _buffer: &mut FrameBuffer) -> MediaResult<()> {
        // Block-coded frames go straight to the GPU; there is no host
        // pixel representation to produce.
        Err(MediaError::InvalidArgument(
            "Hap sources decode to GPU textures only".into(),
        ))
    }

    fn read_frame_to_texture(
        &mut self,
        frame_index: i64,
        texture: &mut GpuTextureFrame,
    ) -> MediaResult<()> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }
        let gpu = self
            .gpu
            .clone()
            .ok_or_else(|| MediaError::Gpu("no GPU context attached".into()))?;
        if !self.direct_upload {
            return Err(MediaError::InvalidArgument(
                "direct GPU upload disabled".into(),
            ));
        }

        self.seek(frame_index)?;
        let packet = self.next_video_packet()?;
        let data = packet
            .data()
            .ok_or_else(|| MediaError::DecodeTransient("empty packet".into()))?;

        let sections = parse_packet(data)?;

        for section in &sections {
            match section.compressor {
                COMP_NONE => {}
                COMP_SNAPPY | COMP_COMPLEX => {
                    // TODO: handle snappy-compressed sections (second-stage
                    // decompression before upload)
                    return Err(MediaError::DecodeTransient(
                        "compressed Hap section not supported".into(),
                    ));
                }
                other => {
                    return Err(MediaError::DecodeTransient(format!(
                        "unknown Hap compressor {other:#x}"
                    )));
                }
            }
        }

        if !self.variant_refined {
            self.refine_variant(sections[0].payload.len());
        }

        let (w, h) = (self.info.width, self.info.height);

        if sections.len() >= 2 {
            // Dual texture: YCoCg color + alpha blocks
            if sections[0].format != FMT_YCOCG_DXT5 || sections[1].format != FMT_A_RGTC1 {
                return Err(MediaError::DecodeTransient(format!(
                    "unexpected dual-texture formats {:#x}/{:#x}",
                    sections[0].format, sections[1].format
                )));
            }
            texture.upload_dual_block_coded(
                &gpu,
                sections[0].payload,
                sections[1].payload,
                w,
                h,
            )?;
            self.dual_texture = true;
        } else {
            let variant = variant_for_format(sections[0].format).unwrap_or(self.variant);
            self.variant = variant;
            texture.upload_block_coded(&gpu, sections[0].payload, w, h, variant)?;
        }

        if let Some(pts) = packet.pts().or(packet.dts()) {
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
        self.seek_internal(frame_index)
    }

    fn frame_info(&self) -> FrameInfo {
        self.info
    }

    fn current_frame(&self) -> i64 {
        self.current_frame
    }

    fn detect_codec(&self) -> CodecKind {
        codec_kind_for(self.variant, self.dual_texture)
    }

    fn supports_direct_gpu(&self) -> bool {
        self.direct_upload && self.gpu.is_some()
    }

    fn optimal_backend(&self) -> DecodeBackend {
        DecodeBackend::BlockDirect
    }
}

impl Drop for HapInput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(format: u8, compressor: u8, payload: &[u8]) -> Vec<u8> {
        let size = payload.len() as u32;
        let mut out = vec![
            (size & 0xFF) as u8,
            ((size >> 8) & 0xFF) as u8,
            ((size >> 16) & 0xFF) as u8,
            (compressor << 4) | format,
        ];
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn parses_single_texture_packet() {
        let payload = vec![0xAAu8; 64];
        let packet = section(FMT_RGB_DXT1, COMP_NONE, &payload);

        let sections = parse_packet(&packet).unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].format, FMT_RGB_DXT1);
        assert_eq!(sections[0].compressor, COMP_NONE);
        assert_eq!(sections[0].payload, &payload[..]);
    }

    #[test]
    fn parses_dual_texture_packet() {
        let color = section(FMT_YCOCG_DXT5, COMP_NONE, &[1u8; 32]);
        let alpha = section(FMT_A_RGTC1, COMP_NONE, &[2u8; 16]);
        let mut nested = color;
        nested.extend_from_slice(&alpha);
        let packet = section(FMT_MULTI, COMP_NONE, &nested);

        let sections = parse_packet(&packet).unwrap();
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].format, FMT_YCOCG_DXT5);
        assert_eq!(sections[1].format, FMT_A_RGTC1);
        assert_eq!(sections[0].payload.len(), 32);
        assert_eq!(sections[1].payload.len(), 16);
    }

    #[test]
    fn extended_size_header() {
        let payload = vec![3u8; 16];
        let mut packet = vec![0, 0, 0, (COMP_NONE << 4) | FMT_RGB_DXT1];
        packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        packet.extend_from_slice(&payload);

        let sections = parse_packet(&packet).unwrap();
        assert_eq!(sections[0].payload.len(), 16);
    }

    #[test]
    fn truncated_packets_fail_softly() {
        assert!(parse_packet(&[1, 0]).is_err());
        // Claims 100 bytes, delivers 4
        let bad = vec![100, 0, 0, (COMP_NONE << 4) | FMT_RGB_DXT1, 1, 2, 3, 4];
        assert!(parse_packet(&bad).is_err());
    }

    #[test]
    fn container_tags_map_to_variants() {
        assert_eq!(
            variant_from_tag(u32::from_le_bytes(*b"Hap1")),
            Some((BlockVariant::Rgb, false))
        );
        assert_eq!(
            variant_from_tag(u32::from_le_bytes(*b"Hap5")),
            Some((BlockVariant::Rgba, false))
        );
        assert_eq!(
            variant_from_tag(u32::from_le_bytes(*b"HapY")),
            Some((BlockVariant::Ycocg, false))
        );
        assert_eq!(
            variant_from_tag(u32::from_le_bytes(*b"HapM")),
            Some((BlockVariant::YcocgAlpha, true))
        );
        assert_eq!(variant_from_tag(0), None);
    }

    #[test]
    fn host_reads_are_rejected() {
        let mut input = HapInput::new(None, true);
        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            input.read_frame(0, &mut buffer),
            Err(MediaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn size_heuristic_promotes_to_rgba() {
        let mut input = HapInput::new(None, true);
        input.info.width = 64;
        input.info.height = 64;
        input.variant = BlockVariant::Rgb;

        // 64x64 => 256 blocks; RGBA accounting = 4096 bytes
        input.refine_variant(4096);
        assert_eq!(input.variant, BlockVariant::Rgba);

        // RGB-sized payload stays RGB
        let mut input = HapInput::new(None, true);
        input.info.width = 64;
        input.info.height = 64;
        input.refine_variant(2048);
        assert_eq!(input.variant, BlockVariant::Rgb);
    }
}
