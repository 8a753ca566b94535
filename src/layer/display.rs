//! Layer display preparation
//!
//! Takes the playback frame (host buffer or GPU texture) and produces the
//! frame handed to the compositor. Host frames with active transforms run
//! through the CPU processor; GPU frames pass through with crop/panorama
//! expressed as a texture-coordinate rectangle. When no transform is
//! active the input is passed through by reference, untouched.

use crate::error::{MediaError, MediaResult};
use crate::layer::processor::{can_skip_transforms, CpuImageProcessor, GpuImageProcessor};
use crate::layer::LayerProperties;
use crate::media::{FrameBuffer, GpuTextureFrame};

/// The frame a layer contributes to composition this tick.
pub enum PreparedFrame<'a> {
    /// Host pixels. `transforms_baked` is true when crop/scale/rotation
    /// are already applied (or were identity); the compositor only places
    /// and blends.
    Cpu {
        buffer: &'a FrameBuffer,
        transforms_baked: bool,
    },
    /// GPU planes, passed through. The compositor samples inside
    /// `texture_rect` and applies scale/rotation on its transform matrix.
    Gpu {
        frame: GpuTextureFrame,
        texture_rect: [f32; 4],
    },
}

impl PreparedFrame<'_> {
    /// Whether the compositor still has transforms to apply.
    pub fn transforms_baked(&self) -> bool {
        match self {
            PreparedFrame::Cpu {
                transforms_baked, ..
            } => *transforms_baked,
            PreparedFrame::Gpu { .. } => false,
        }
    }
}

#[derive(Default)]
pub struct LayerDisplay {
    cpu_processor: CpuImageProcessor,
    gpu_processor: GpuImageProcessor,
    prepared: FrameBuffer,
}

impl LayerDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare the playback frame for composition under `properties`.
    pub fn prepare<'a>(
        &'a mut self,
        cpu_frame: &'a FrameBuffer,
        gpu_frame: &GpuTextureFrame,
        frame_on_gpu: bool,
        properties: &LayerProperties,
    ) -> MediaResult<PreparedFrame<'a>> {
        if frame_on_gpu {
            if !gpu_frame.is_valid() {
                return Err(MediaError::NotReady);
            }
            // No pixel work on the GPU path: crop/panorama ride the
            // texture coordinates, scale/rotation the compositor matrix
            let texture_rect = self.gpu_processor.texture_rect(properties, gpu_frame.info());
            return Ok(PreparedFrame::Gpu {
                frame: gpu_frame.view(),
                texture_rect,
            });
        }

        if !cpu_frame.is_valid() {
            return Err(MediaError::NotReady);
        }

        if can_skip_transforms(properties) {
            // Zero copy: the renderer sees the decoder's own buffer
            return Ok(PreparedFrame::Cpu {
                buffer: cpu_frame,
                transforms_baked: true,
            });
        }

        self.cpu_processor
            .process(cpu_frame, &mut self.prepared, properties)?;
        Ok(PreparedFrame::Cpu {
            buffer: &self.prepared,
            transforms_baked: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::CropRect;
    use crate::media::{FrameInfo, PixelFormat};

    fn frame(width: u32, height: u32) -> FrameBuffer {
        let mut buffer = FrameBuffer::new();
        buffer.allocate(FrameInfo {
            width,
            height,
            pixel_format: PixelFormat::Bgra32,
            ..Default::default()
        });
        buffer
    }

    #[test]
    fn identity_transforms_pass_through_by_reference() {
        let mut display = LayerDisplay::new();
        let input = frame(8, 8);
        let gpu = GpuTextureFrame::new();
        let props = LayerProperties::default();

        match display.prepare(&input, &gpu, false, &props).unwrap() {
            PreparedFrame::Cpu {
                buffer,
                transforms_baked,
            } => {
                assert!(std::ptr::eq(buffer, &input));
                assert!(transforms_baked);
            }
            _ => panic!("expected CPU frame"),
        }
    }

    #[test]
    fn active_crop_processes_into_display_buffer() {
        let mut display = LayerDisplay::new();
        let mut props = LayerProperties::default();
        props.crop = Some(CropRect {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
        });
        let input = frame(8, 8);
        let gpu = GpuTextureFrame::new();

        match display.prepare(&input, &gpu, false, &props).unwrap() {
            PreparedFrame::Cpu {
                buffer,
                transforms_baked,
            } => {
                assert!(!std::ptr::eq(buffer, &input));
                assert_eq!(buffer.info().width, 4);
                assert!(transforms_baked);
            }
            _ => panic!("expected CPU frame"),
        }
    }

    #[test]
    fn missing_frames_are_not_ready() {
        let mut display = LayerDisplay::new();
        let empty = FrameBuffer::new();
        let gpu = GpuTextureFrame::new();
        let props = LayerProperties::default();

        assert!(matches!(
            display.prepare(&empty, &gpu, false, &props),
            Err(MediaError::NotReady)
        ));
        assert!(matches!(
            display.prepare(&empty, &gpu, true, &props),
            Err(MediaError::NotReady)
        ));
    }
}
