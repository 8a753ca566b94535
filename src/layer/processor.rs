//! Image processors
//!
//! Transform application in fixed order: crop-or-panorama, then scale,
//! then rotation.
//!
//! The CPU processor touches pixels (used when the frame lives in host
//! memory and modifications are required); intermediate results ping-pong
//! between two scratch buffers. The GPU processor never touches pixels:
//! crop and panorama become a texture-coordinate rectangle, scale and
//! rotation ride the compositor's transform matrix.

use crate::error::{MediaError, MediaResult};
use crate::layer::LayerProperties;
use crate::media::{FrameBuffer, FrameInfo};

/// Transforms smaller than this are treated as identity.
pub const TRANSFORM_EPSILON: f32 = 1e-3;

/// True when no transform is active and the frame can pass through to the
/// renderer untouched.
pub fn can_skip_transforms(properties: &LayerProperties) -> bool {
    properties.crop.is_none()
        && !properties.panorama_enabled
        && (properties.scale_x - 1.0).abs() < TRANSFORM_EPSILON
        && (properties.scale_y - 1.0).abs() < TRANSFORM_EPSILON
        && properties.rotation_degrees.abs() < TRANSFORM_EPSILON
}

/// Pixel-level transform pipeline for host frames.
#[derive(Default)]
pub struct CpuImageProcessor {
    scratch_a: FrameBuffer,
    scratch_b: FrameBuffer,
}

impl CpuImageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the active transforms of `properties` to `input`, writing the
    /// final image into `output`.
    pub fn process(
        &mut self,
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        properties: &LayerProperties,
    ) -> MediaResult<()> {
        if !input.is_valid() {
            return Err(MediaError::InvalidArgument("invalid input buffer".into()));
        }

        if can_skip_transforms(properties) {
            if !output.allocate(*input.info()) {
                return Err(MediaError::InvalidArgument("output allocation failed".into()));
            }
            output.data_mut().copy_from_slice(input.data());
            return Ok(());
        }

        let has_scale = (properties.scale_x - 1.0).abs() >= TRANSFORM_EPSILON
            || (properties.scale_y - 1.0).abs() >= TRANSFORM_EPSILON;
        let has_rotation = properties.rotation_degrees.abs() >= TRANSFORM_EPSILON;

        // Stage results alternate between the two scratch buffers; `index`
        // tracks which one holds the newest image (0 = input untouched).
        let mut stage = 0u8;

        if properties.panorama_enabled {
            let (src, dst) = (input, &mut self.scratch_a);
            Self::apply_panorama(src, dst, properties)?;
            stage = 1;
        } else if let Some(crop) = properties.crop {
            let (src, dst) = (input, &mut self.scratch_a);
            Self::apply_crop(src, dst, crop)?;
            stage = 1;
        }

        if has_scale {
            match stage {
                0 => {
                    Self::apply_scale(input, &mut self.scratch_a, properties)?;
                    stage = 1;
                }
                1 => {
                    let (a, b) = (&self.scratch_a, &mut self.scratch_b);
                    Self::apply_scale(a, b, properties)?;
                    stage = 2;
                }
                _ => {
                    let (b, a) = (&self.scratch_b, &mut self.scratch_a);
                    Self::apply_scale(b, a, properties)?;
                    stage = 1;
                }
            }
        }

        if has_rotation {
            match stage {
                0 => {
                    Self::apply_rotation(input, &mut self.scratch_a, properties)?;
                    stage = 1;
                }
                1 => {
                    let (a, b) = (&self.scratch_a, &mut self.scratch_b);
                    Self::apply_rotation(a, b, properties)?;
                    stage = 2;
                }
                _ => {
                    let (b, a) = (&self.scratch_b, &mut self.scratch_a);
                    Self::apply_rotation(b, a, properties)?;
                    stage = 1;
                }
            }
        }

        let result = match stage {
            1 => &self.scratch_a,
            2 => &self.scratch_b,
            _ => input,
        };
        if !output.allocate(*result.info()) {
            return Err(MediaError::InvalidArgument("output allocation failed".into()));
        }
        output.data_mut().copy_from_slice(result.data());
        Ok(())
    }

    fn apply_crop(input: &FrameBuffer, output: &mut FrameBuffer, crop: super::CropRect) -> MediaResult<()> {
        let info = *input.info();
        if crop.width == 0
            || crop.height == 0
            || crop.x + crop.width > info.width
            || crop.y + crop.height > info.height
        {
            return Err(MediaError::InvalidArgument(format!(
                "crop {}x{}+{}+{} outside {}x{}",
                crop.width, crop.height, crop.x, crop.y, info.width, info.height
            )));
        }

        let bpp = info.pixel_format.bytes_per_pixel();
        let mut out_info = info;
        out_info.width = crop.width;
        out_info.height = crop.height;
        if !output.allocate(out_info) {
            return Err(MediaError::InvalidArgument("crop allocation failed".into()));
        }

        let in_stride = input.stride();
        let out_stride = output.stride();
        let row_bytes = crop.width as usize * bpp;
        let src_data = input.data();
        let dst_data = output.data_mut();
        for row in 0..crop.height as usize {
            let s = (crop.y as usize + row) * in_stride + crop.x as usize * bpp;
            let d = row * out_stride;
            dst_data[d..d + row_bytes].copy_from_slice(&src_data[s..s + row_bytes]);
        }
        Ok(())
    }

    fn apply_panorama(
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        properties: &LayerProperties,
    ) -> MediaResult<()> {
        let info = *input.info();
        let crop_width = info.width / 2;
        let max_offset = (info.width - crop_width) as i32;
        let pan = properties.pan_offset.clamp(0, max_offset) as u32;

        Self::apply_crop(
            input,
            output,
            super::CropRect {
                x: pan,
                y: 0,
                width: crop_width,
                height: info.height,
            },
        )
    }

    fn apply_scale(
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        properties: &LayerProperties,
    ) -> MediaResult<()> {
        let info = *input.info();
        let out_width = (info.width as f32 * properties.scale_x).round() as u32;
        let out_height = (info.height as f32 * properties.scale_y).round() as u32;
        if out_width == 0 || out_height == 0 {
            return Err(MediaError::InvalidArgument("scale collapses frame".into()));
        }

        let bpp = info.pixel_format.bytes_per_pixel();
        let mut out_info = info;
        out_info.width = out_width;
        out_info.height = out_height;
        if !output.allocate(out_info) {
            return Err(MediaError::InvalidArgument("scale allocation failed".into()));
        }

        // Nearest neighbor is enough for show playback
        let in_stride = input.stride();
        let out_stride = output.stride();
        let src_data = input.data();
        let dst_data = output.data_mut();
        for y in 0..out_height as usize {
            let src_y = y * info.height as usize / out_height as usize;
            let src_row = src_y * in_stride;
            let dst_row = y * out_stride;
            for x in 0..out_width as usize {
                let src_x = x * info.width as usize / out_width as usize;
                let s = src_row + src_x * bpp;
                let d = dst_row + x * bpp;
                dst_data[d..d + bpp].copy_from_slice(&src_data[s..s + bpp]);
            }
        }
        Ok(())
    }

    fn apply_rotation(
        input: &FrameBuffer,
        output: &mut FrameBuffer,
        properties: &LayerProperties,
    ) -> MediaResult<()> {
        let info = *input.info();

        // Normalize to [0, 360) and snap to the nearest quarter turn
        let mut rotation = properties.rotation_degrees % 360.0;
        if rotation < 0.0 {
            rotation += 360.0;
        }
        let quarter = ((rotation / 90.0).round() as u32) % 4;

        if quarter == 0 {
            if !output.allocate(info) {
                return Err(MediaError::InvalidArgument("rotation allocation failed".into()));
            }
            output.data_mut().copy_from_slice(input.data());
            return Ok(());
        }

        let (out_width, out_height) = if quarter == 1 || quarter == 3 {
            (info.height, info.width)
        } else {
            (info.width, info.height)
        };

        let bpp = info.pixel_format.bytes_per_pixel();
        let mut out_info = info;
        out_info.width = out_width;
        out_info.height = out_height;
        if !output.allocate(out_info) {
            return Err(MediaError::InvalidArgument("rotation allocation failed".into()));
        }

        let in_stride = input.stride();
        let out_stride = output.stride();
        let src_data = input.data();
        let dst_data = output.data_mut();
        let (w, h) = (info.width as usize, info.height as usize);

        for y in 0..out_height as usize {
            for x in 0..out_width as usize {
                let (src_x, src_y) = match quarter {
                    // 90 clockwise: output column x samples source row h-1-x
                    1 => (y, h - 1 - x),
                    2 => (w - 1 - x, h - 1 - y),
                    // 270 clockwise
                    _ => (w - 1 - y, x),
                };
                let s = src_y * in_stride + src_x * bpp;
                let d = y * out_stride + x * bpp;
                dst_data[d..d + bpp].copy_from_slice(&src_data[s..s + bpp]);
            }
        }
        Ok(())
    }
}

/// Coordinate-level transform logic for GPU frames: crop and panorama are
/// expressed as a normalized texture rectangle, scale and rotation are the
/// compositor's business. The frame itself passes through untouched.
#[derive(Debug, Default)]
pub struct GpuImageProcessor;

impl GpuImageProcessor {
    pub fn new() -> Self {
        Self
    }

    /// GPU frames only need processing state when a crop or panorama is
    /// active; everything else is a matrix on the compositor side.
    pub fn can_skip(&self, properties: &LayerProperties) -> bool {
        properties.crop.is_none() && !properties.panorama_enabled
    }

    /// Normalized `[x, y, width, height]` texture rectangle selecting the
    /// visible part of the source.
    pub fn texture_rect(&self, properties: &LayerProperties, info: &FrameInfo) -> [f32; 4] {
        if info.width == 0 || info.height == 0 {
            return [0.0, 0.0, 1.0, 1.0];
        }
        let (fw, fh) = (info.width as f32, info.height as f32);

        if properties.panorama_enabled {
            let crop_width = fw / 2.0;
            let max_offset = fw - crop_width;
            let pan = (properties.pan_offset as f32).clamp(0.0, max_offset);
            return [pan / fw, 0.0, crop_width / fw, 1.0];
        }

        if let Some(crop) = properties.crop {
            let x = (crop.x as f32 / fw).clamp(0.0, 1.0);
            let y = (crop.y as f32 / fh).clamp(0.0, 1.0);
            let w = (crop.width as f32 / fw).min(1.0 - x);
            let h = (crop.height as f32 / fh).min(1.0 - y);
            return [x, y, w, h];
        }

        [0.0, 0.0, 1.0, 1.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::CropRect;
    use crate::media::PixelFormat;

    fn make_frame(width: u32, height: u32) -> FrameBuffer {
        let mut buffer = FrameBuffer::new();
        let info = FrameInfo {
            width,
            height,
            pixel_aspect: 1.0,
            framerate: 25.0,
            framerate_q: (25, 1),
            total_frames: 1,
            duration_seconds: 0.04,
            pixel_format: PixelFormat::Bgra32,
        };
        assert!(buffer.allocate(info));
        // Each pixel encodes its coordinates for easy assertions
        for y in 0..height {
            for x in 0..width {
                let at = (y as usize * buffer.stride()) + x as usize * 4;
                let data = buffer.data_mut();
                data[at] = x as u8;
                data[at + 1] = y as u8;
                data[at + 2] = 0xCC;
                data[at + 3] = 0xFF;
            }
        }
        buffer
    }

    fn pixel(buffer: &FrameBuffer, x: u32, y: u32) -> (u8, u8) {
        let at = y as usize * buffer.stride() + x as usize * 4;
        (buffer.data()[at], buffer.data()[at + 1])
    }

    #[test]
    fn skip_rule_matches_epsilon() {
        let mut props = LayerProperties::default();
        assert!(can_skip_transforms(&props));

        props.scale_x = 1.0005;
        assert!(can_skip_transforms(&props));

        props.scale_x = 1.01;
        assert!(!can_skip_transforms(&props));

        props.scale_x = 1.0;
        props.rotation_degrees = 90.0;
        assert!(!can_skip_transforms(&props));

        props.rotation_degrees = 0.0;
        props.panorama_enabled = true;
        assert!(!can_skip_transforms(&props));
    }

    #[test]
    fn crop_copies_the_selected_rows() {
        let input = make_frame(16, 16);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.crop = Some(CropRect {
            x: 4,
            y: 2,
            width: 8,
            height: 6,
        });
        processor.process(&input, &mut output, &props).unwrap();

        assert_eq!(output.info().width, 8);
        assert_eq!(output.info().height, 6);
        assert_eq!(pixel(&output, 0, 0), (4, 2));
        assert_eq!(pixel(&output, 7, 5), (11, 7));
    }

    #[test]
    fn crop_outside_bounds_is_rejected() {
        let input = make_frame(16, 16);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.crop = Some(CropRect {
            x: 10,
            y: 0,
            width: 8,
            height: 8,
        });
        assert!(matches!(
            processor.process(&input, &mut output, &props),
            Err(MediaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn panorama_crops_half_width_with_clamped_pan() {
        let input = make_frame(16, 8);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.panorama_enabled = true;
        props.pan_offset = 100; // clamps to width/2 = 8
        processor.process(&input, &mut output, &props).unwrap();

        assert_eq!(output.info().width, 8);
        assert_eq!(pixel(&output, 0, 0), (8, 0));
        assert_eq!(pixel(&output, 7, 0), (15, 0));
    }

    #[test]
    fn scale_resamples_nearest_neighbor() {
        let input = make_frame(8, 8);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.scale_x = 2.0;
        props.scale_y = 2.0;
        processor.process(&input, &mut output, &props).unwrap();

        assert_eq!(output.info().width, 16);
        assert_eq!(output.info().height, 16);
        // 2x nearest neighbor doubles each source pixel
        assert_eq!(pixel(&output, 0, 0), (0, 0));
        assert_eq!(pixel(&output, 1, 1), (0, 0));
        assert_eq!(pixel(&output, 2, 2), (1, 1));
        assert_eq!(pixel(&output, 15, 15), (7, 7));
    }

    #[test]
    fn rotation_snaps_and_swaps_dimensions() {
        let input = make_frame(8, 4);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.rotation_degrees = 93.0; // snaps to 90
        processor.process(&input, &mut output, &props).unwrap();

        assert_eq!(output.info().width, 4);
        assert_eq!(output.info().height, 8);
        // 90 degrees clockwise: top-right of the source becomes top-left...
        assert_eq!(pixel(&output, 0, 0), (0, 3));
        assert_eq!(pixel(&output, 3, 0), (0, 0));

        // 180 keeps dimensions
        props.rotation_degrees = 180.0;
        processor.process(&input, &mut output, &props).unwrap();
        assert_eq!(output.info().width, 8);
        assert_eq!(pixel(&output, 0, 0), (7, 3));

        // Negative angles normalize (-90 == 270)
        props.rotation_degrees = -90.0;
        processor.process(&input, &mut output, &props).unwrap();
        assert_eq!(output.info().width, 4);
        assert_eq!(output.info().height, 8);
        assert_eq!(pixel(&output, 0, 0), (7, 0));
    }

    #[test]
    fn crop_then_scale_then_rotate_compose() {
        let input = make_frame(16, 16);
        let mut output = FrameBuffer::new();
        let mut processor = CpuImageProcessor::new();

        let mut props = LayerProperties::default();
        props.crop = Some(CropRect {
            x: 0,
            y: 0,
            width: 8,
            height: 4,
        });
        props.scale_x = 2.0;
        props.scale_y = 2.0;
        props.rotation_degrees = 90.0;
        processor.process(&input, &mut output, &props).unwrap();

        // crop: 8x4, scale: 16x8, rotate 90: 8x16
        assert_eq!(output.info().width, 8);
        assert_eq!(output.info().height, 16);
    }

    #[test]
    fn gpu_processor_texture_rects() {
        let gpu = GpuImageProcessor::new();
        let info = FrameInfo {
            width: 100,
            height: 50,
            ..Default::default()
        };

        let mut props = LayerProperties::default();
        assert!(gpu.can_skip(&props));
        assert_eq!(gpu.texture_rect(&props, &info), [0.0, 0.0, 1.0, 1.0]);

        props.crop = Some(CropRect {
            x: 25,
            y: 10,
            width: 50,
            height: 25,
        });
        assert!(!gpu.can_skip(&props));
        assert_eq!(gpu.texture_rect(&props, &info), [0.25, 0.2, 0.5, 0.5]);

        props.crop = None;
        props.panorama_enabled = true;
        props.pan_offset = 25;
        assert_eq!(gpu.texture_rect(&props, &info), [0.25, 0.0, 0.5, 1.0]);
    }
}
