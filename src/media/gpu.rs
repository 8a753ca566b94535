//! GPU texture management
//!
//! `GpuTextureFrame` stores a decoded frame as one to three GPU texture
//! planes:
//! - Hap frames as BC-compressed textures (uploaded without any pixel work)
//! - hardware-decoded frames as NV12/YUV420P plane sets
//! - software frames as a single BGRA texture
//!
//! Ownership: exactly one owning instance exists per underlying GPU
//! allocation. `clone()` produces a non-owning view that never releases;
//! moving transfers ownership. All texture creation, upload and destruction
//! happens on the main thread.

use std::sync::Arc;

use crate::error::{MediaError, MediaResult};
use crate::media::FrameInfo;

/// Shared wgpu device/queue for the engine. Created once, main thread only.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
}

impl GpuContext {
    /// Create a headless device suitable for texture upload and zero-copy
    /// import. Requires BC texture compression for the Hap path.
    pub fn new() -> MediaResult<Arc<Self>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| MediaError::Gpu(format!("no suitable GPU adapter: {e}")))?;

        let info = adapter.get_info();
        log::info!("GpuContext: using adapter '{}' ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("stagecomposer"),
            required_features: wgpu::Features::TEXTURE_COMPRESSION_BC,
            ..Default::default()
        }))
        .map_err(|e| MediaError::Gpu(format!("device request failed: {e}")))?;

        // Errors must never abort the tick; they are captured by scopes or
        // logged here.
        device.on_uncaptured_error(Box::new(|e| {
            log::error!("GpuContext: uncaptured GPU error: {e}");
        }));

        Ok(Arc::new(Self {
            device,
            queue,
            adapter_name: info.name,
        }))
    }

    /// Open an error scope. Every GPU operation block is bracketed by
    /// `begin_ops`/`finish_ops` so stale errors from one subsystem cannot
    /// leak into another.
    pub fn begin_ops(&self) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
    }

    /// Close the error scope opened by `begin_ops`.
    pub fn finish_ops(&self, what: &str) -> MediaResult<()> {
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(()),
            Some(e) => Err(MediaError::Gpu(format!("{what}: {e}"))),
        }
    }

    /// Block until all submitted GPU work completed.
    pub fn wait_idle(&self) {
        let _ = self.device.poll(wgpu::PollType::Wait);
    }
}

/// Plane semantics of a `GpuTextureFrame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneLayout {
    /// One RGBA/BGRA or block-compressed texture
    #[default]
    Single,
    /// Y plane (R8) + interleaved UV plane (RG8)
    Nv12,
    /// Y, U, V planes (all R8)
    Yuv420p,
    /// YCoCg DXT5 color plane + RGTC1 alpha plane
    DualBlockYcocgAlpha,
}

impl PlaneLayout {
    pub fn plane_count(self) -> usize {
        match self {
            PlaneLayout::Single => 1,
            PlaneLayout::Nv12 | PlaneLayout::DualBlockYcocgAlpha => 2,
            PlaneLayout::Yuv420p => 3,
        }
    }
}

/// Block-compression variant of a block-coded texture.
///
/// All variants compress 4x4 pixel blocks; they differ in bytes per block
/// and content interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockVariant {
    #[default]
    None,
    /// DXT1 RGB, 8 bytes per block
    Rgb,
    /// DXT5 RGBA, 16 bytes per block
    Rgba,
    /// DXT5 scaled YCoCg, 16 bytes per block
    Ycocg,
    /// Dual texture: DXT5 YCoCg + RGTC1 alpha (8 bytes per block)
    YcocgAlpha,
    /// BC7, 16 bytes per block
    HighQuality,
}

impl BlockVariant {
    /// Bytes per 4x4 block of the color plane.
    pub fn bytes_per_block(self) -> usize {
        match self {
            BlockVariant::None => 0,
            BlockVariant::Rgb => 8,
            BlockVariant::Rgba | BlockVariant::Ycocg | BlockVariant::YcocgAlpha => 16,
            BlockVariant::HighQuality => 16,
        }
    }

    pub fn texture_format(self) -> Option<wgpu::TextureFormat> {
        match self {
            BlockVariant::None => None,
            BlockVariant::Rgb => Some(wgpu::TextureFormat::Bc1RgbaUnorm),
            BlockVariant::Rgba | BlockVariant::Ycocg | BlockVariant::YcocgAlpha => {
                Some(wgpu::TextureFormat::Bc3RgbaUnorm)
            }
            BlockVariant::HighQuality => Some(wgpu::TextureFormat::Bc7RgbaUnorm),
        }
    }
}

/// Bytes per block of the RGTC1 alpha plane.
const ALPHA_BLOCK_BYTES: usize = 8;

/// Compressed payload size for a `width` x `height` plane: dimensions round
/// up to the next multiple of 4 for block accounting.
pub fn block_coded_size(width: u32, height: u32, bytes_per_block: usize) -> usize {
    let bw = (width as usize + 3) / 4;
    let bh = (height as usize + 3) / 4;
    bw * bh * bytes_per_block
}

/// A decoded frame resident on the GPU.
#[derive(Default)]
pub struct GpuTextureFrame {
    planes: [Option<Arc<wgpu::Texture>>; 3],
    layout: PlaneLayout,
    variant: BlockVariant,
    info: FrameInfo,
    owns_texture: bool,
}

impl GpuTextureFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.planes[0].is_some()
    }

    pub fn plane(&self, index: usize) -> Option<&Arc<wgpu::Texture>> {
        self.planes.get(index).and_then(|p| p.as_ref())
    }

    pub fn plane_count(&self) -> usize {
        self.layout.plane_count()
    }

    pub fn layout(&self) -> PlaneLayout {
        self.layout
    }

    pub fn variant(&self) -> BlockVariant {
        self.variant
    }

    pub fn is_block_coded(&self) -> bool {
        self.variant != BlockVariant::None
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn owns_texture(&self) -> bool {
        self.owns_texture
    }

    /// Non-owning copy: shares the plane handles, never releases them.
    pub fn view(&self) -> GpuTextureFrame {
        GpuTextureFrame {
            planes: self.planes.clone(),
            layout: self.layout,
            variant: self.variant,
            info: self.info,
            owns_texture: false,
        }
    }

    /// Release the GPU allocation if owned; views only drop their handles.
    pub fn release(&mut self) {
        if self.owns_texture {
            for plane in self.planes.iter().flatten() {
                plane.destroy();
            }
        }
        self.planes = [None, None, None];
        self.layout = PlaneLayout::Single;
        self.variant = BlockVariant::None;
        self.owns_texture = false;
    }

    fn create_plane(
        gpu: &GpuContext,
        label: &str,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> Arc<wgpu::Texture> {
        Arc::new(gpu.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        }))
    }

    /// Allocate a single-plane texture, owned by this instance.
    ///
    /// Block-coded textures pad dimensions to the 4x4 block grid.
    pub fn allocate(
        &mut self,
        gpu: &GpuContext,
        info: FrameInfo,
        format: wgpu::TextureFormat,
        block_coded: bool,
    ) -> MediaResult<()> {
        self.release();

        let (w, h) = if block_coded {
            ((info.width + 3) & !3, (info.height + 3) & !3)
        } else {
            (info.width, info.height)
        };

        gpu.begin_ops();
        let tex = Self::create_plane(gpu, "layer-frame", w, h, format);
        if let Err(e) = gpu.finish_ops("allocate") {
            tex.destroy();
            return Err(e);
        }

        self.planes[0] = Some(tex);
        self.layout = PlaneLayout::Single;
        self.info = info;
        self.owns_texture = true;
        Ok(())
    }

    /// Allocate an NV12 or YUV420P plane set, owned by this instance.
    pub fn allocate_multiplane(
        &mut self,
        gpu: &GpuContext,
        info: FrameInfo,
        layout: PlaneLayout,
    ) -> MediaResult<()> {
        self.release();

        let (w, h) = (info.width, info.height);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        gpu.begin_ops();
        match layout {
            PlaneLayout::Nv12 => {
                self.planes[0] = Some(Self::create_plane(
                    gpu,
                    "layer-frame-y",
                    w,
                    h,
                    wgpu::TextureFormat::R8Unorm,
                ));
                self.planes[1] = Some(Self::create_plane(
                    gpu,
                    "layer-frame-uv",
                    cw,
                    ch,
                    wgpu::TextureFormat::Rg8Unorm,
                ));
            }
            PlaneLayout::Yuv420p => {
                self.planes[0] = Some(Self::create_plane(
                    gpu,
                    "layer-frame-y",
                    w,
                    h,
                    wgpu::TextureFormat::R8Unorm,
                ));
                self.planes[1] = Some(Self::create_plane(
                    gpu,
                    "layer-frame-u",
                    cw,
                    ch,
                    wgpu::TextureFormat::R8Unorm,
                ));
                self.planes[2] = Some(Self::create_plane(
                    gpu,
                    "layer-frame-v",
                    cw,
                    ch,
                    wgpu::TextureFormat::R8Unorm,
                ));
            }
            _ => {
                let _ = gpu.finish_ops("allocate_multiplane");
                return Err(MediaError::InvalidArgument(
                    "allocate_multiplane expects NV12 or YUV420P".into(),
                ));
            }
        }
        if let Err(e) = gpu.finish_ops("allocate_multiplane") {
            self.owns_texture = true;
            self.release();
            return Err(e);
        }

        self.layout = layout;
        self.info = info;
        self.owns_texture = true;
        Ok(())
    }

    /// Allocate the dual-texture pair for the YCoCg + alpha variant.
    pub fn allocate_dual_block_coded(&mut self, gpu: &GpuContext, info: FrameInfo) -> MediaResult<()> {
        self.release();

        let w = (info.width + 3) & !3;
        let h = (info.height + 3) & !3;

        gpu.begin_ops();
        self.planes[0] = Some(Self::create_plane(
            gpu,
            "layer-frame-ycocg",
            w,
            h,
            wgpu::TextureFormat::Bc3RgbaUnorm,
        ));
        self.planes[1] = Some(Self::create_plane(
            gpu,
            "layer-frame-alpha",
            w,
            h,
            wgpu::TextureFormat::Bc4RUnorm,
        ));
        if let Err(e) = gpu.finish_ops("allocate_dual_block_coded") {
            self.owns_texture = true;
            self.release();
            return Err(e);
        }

        self.layout = PlaneLayout::DualBlockYcocgAlpha;
        self.variant = BlockVariant::YcocgAlpha;
        self.info = info;
        self.owns_texture = true;
        Ok(())
    }

    /// Upload a compressed block payload to the single-plane texture,
    /// (re)allocating it when the variant or geometry changed.
    pub fn upload_block_coded(
        &mut self,
        gpu: &GpuContext,
        data: &[u8],
        width: u32,
        height: u32,
        variant: BlockVariant,
    ) -> MediaResult<()> {
        let format = variant
            .texture_format()
            .ok_or_else(|| MediaError::InvalidArgument("not a block variant".into()))?;

        let needed = block_coded_size(width, height, variant.bytes_per_block());
        if data.len() < needed {
            return Err(MediaError::InvalidArgument(format!(
                "block payload too small: {} < {}",
                data.len(),
                needed
            )));
        }

        if !self.is_valid()
            || self.variant != variant
            || self.info.width != width
            || self.info.height != height
        {
            let mut info = self.info;
            info.width = width;
            info.height = height;
            self.allocate(gpu, info, format, true)?;
            self.variant = variant;
        }

        let tex = self.planes[0].as_ref().ok_or(MediaError::NotReady)?;
        let blocks_w = width.div_ceil(4);
        let blocks_h = height.div_ceil(4);

        gpu.begin_ops();
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data[..needed],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(blocks_w * variant.bytes_per_block() as u32),
                rows_per_image: Some(blocks_h),
            },
            wgpu::Extent3d {
                width: (width + 3) & !3,
                height: (height + 3) & !3,
                depth_or_array_layers: 1,
            },
        );
        if let Err(e) = gpu.finish_ops("upload_block_coded") {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Upload the YCoCg color chunk and the alpha chunk of a dual-texture
    /// frame.
    pub fn upload_dual_block_coded(
        &mut self,
        gpu: &GpuContext,
        color: &[u8],
        alpha: &[u8],
        width: u32,
        height: u32,
    ) -> MediaResult<()> {
        let color_needed = block_coded_size(width, height, BlockVariant::Ycocg.bytes_per_block());
        let alpha_needed = block_coded_size(width, height, ALPHA_BLOCK_BYTES);
        if color.len() < color_needed || alpha.len() < alpha_needed {
            return Err(MediaError::InvalidArgument(
                "dual block payload too small".into(),
            ));
        }

        if !self.is_valid()
            || self.layout != PlaneLayout::DualBlockYcocgAlpha
            || self.info.width != width
            || self.info.height != height
        {
            let mut info = self.info;
            info.width = width;
            info.height = height;
            self.allocate_dual_block_coded(gpu, info)?;
        }

        let blocks_w = width.div_ceil(4);
        let blocks_h = height.div_ceil(4);
        let extent = wgpu::Extent3d {
            width: (width + 3) & !3,
            height: (height + 3) & !3,
            depth_or_array_layers: 1,
        };

        gpu.begin_ops();
        for (plane_index, (payload, needed, bpb)) in [
            (color, color_needed, 16u32),
            (alpha, alpha_needed, ALPHA_BLOCK_BYTES as u32),
        ]
        .iter()
        .enumerate()
        {
            let tex = self.planes[plane_index].as_ref().ok_or(MediaError::NotReady)?;
            gpu.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: tex,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &payload[..*needed],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(blocks_w * bpb),
                    rows_per_image: Some(blocks_h),
                },
                extent,
            );
        }
        if let Err(e) = gpu.finish_ops("upload_dual_block_coded") {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Upload packed host pixels (BGRA/RGBA) to the single-plane texture.
    pub fn upload_uncompressed(
        &mut self,
        gpu: &GpuContext,
        data: &[u8],
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
        stride: u32,
    ) -> MediaResult<()> {
        let stride = if stride == 0 { width * 4 } else { stride };
        if data.len() < (stride * height) as usize {
            return Err(MediaError::InvalidArgument("pixel payload too small".into()));
        }

        if !self.is_valid() || self.info.width != width || self.info.height != height {
            let mut info = self.info;
            info.width = width;
            info.height = height;
            self.allocate(gpu, info, format, false)?;
        }

        let tex = self.planes[0].as_ref().ok_or(MediaError::NotReady)?;
        gpu.begin_ops();
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(stride),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        if let Err(e) = gpu.finish_ops("upload_uncompressed") {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Upload NV12 or YUV420P planes from host memory.
    ///
    /// NV12 passes the interleaved UV data as `u` and leaves `v` empty.
    pub fn upload_multiplane(
        &mut self,
        gpu: &GpuContext,
        y: &[u8],
        u: &[u8],
        v: &[u8],
        strides: [u32; 3],
    ) -> MediaResult<()> {
        if !self.is_valid()
            || (self.layout != PlaneLayout::Nv12 && self.layout != PlaneLayout::Yuv420p)
        {
            return Err(MediaError::NotReady);
        }

        let w = self.info.width;
        let h = self.info.height;
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));

        let plane_jobs: [(usize, &[u8], u32, u32, u32); 3] = match self.layout {
            PlaneLayout::Nv12 => [
                (0, y, strides[0], w, h),
                (1, u, strides[1], cw, ch),
                (2, &[], 0, 0, 0),
            ],
            _ => [
                (0, y, strides[0], w, h),
                (1, u, strides[1], cw, ch),
                (2, v, strides[2], cw, ch),
            ],
        };

        gpu.begin_ops();
        for (index, data, stride, pw, ph) in plane_jobs {
            if pw == 0 || data.is_empty() {
                continue;
            }
            let tex = self.planes[index].as_ref().ok_or(MediaError::NotReady)?;
            gpu.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: tex,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(stride),
                    rows_per_image: Some(ph),
                },
                wgpu::Extent3d {
                    width: pw,
                    height: ph,
                    depth_or_array_layers: 1,
                },
            );
        }
        if let Err(e) = gpu.finish_ops("upload_multiplane") {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    /// Adopt externally created NV12 plane textures without taking
    /// ownership (zero-copy import path). The importer keeps the textures
    /// alive for the frame's display lifetime.
    pub fn set_external_nv12(
        &mut self,
        tex_y: Arc<wgpu::Texture>,
        tex_uv: Arc<wgpu::Texture>,
        info: FrameInfo,
    ) {
        self.release();
        self.planes[0] = Some(tex_y);
        self.planes[1] = Some(tex_uv);
        self.layout = PlaneLayout::Nv12;
        self.variant = BlockVariant::None;
        self.info = info;
        self.owns_texture = false;
    }
}

impl Drop for GpuTextureFrame {
    fn drop(&mut self) {
        self.release();
    }
}

/// Copying is view semantics: handles are shared, ownership is not.
impl Clone for GpuTextureFrame {
    fn clone(&self) -> Self {
        self.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_accounting_rounds_up_to_block_grid() {
        // 1920x1080: 480x270 blocks
        assert_eq!(block_coded_size(1920, 1080, 8), 480 * 270 * 8);
        assert_eq!(block_coded_size(1920, 1080, 16), 480 * 270 * 16);
        // Non multiple of 4 rounds up
        assert_eq!(block_coded_size(6, 6, 8), 2 * 2 * 8);
        assert_eq!(block_coded_size(1, 1, 16), 16);
    }

    #[test]
    fn variant_block_sizes() {
        assert_eq!(BlockVariant::Rgb.bytes_per_block(), 8);
        assert_eq!(BlockVariant::Rgba.bytes_per_block(), 16);
        assert_eq!(BlockVariant::Ycocg.bytes_per_block(), 16);
        assert_eq!(BlockVariant::HighQuality.bytes_per_block(), 16);
        assert_eq!(BlockVariant::None.bytes_per_block(), 0);
    }

    #[test]
    fn views_never_own() {
        // Flag-level check: a default (empty) frame marked as owner hands a
        // non-owning view out, and releasing the view is a no-op on the
        // ownership of the original.
        let mut frame = GpuTextureFrame::new();
        frame.owns_texture = true;

        let mut view = frame.view();
        assert!(!view.owns_texture());
        view.release();
        assert!(frame.owns_texture());
    }

    #[test]
    fn move_transfers_ownership() {
        let mut frame = GpuTextureFrame::new();
        frame.owns_texture = true;

        let moved = std::mem::take(&mut frame);
        assert!(moved.owns_texture());
        assert!(!frame.owns_texture());
        assert!(!frame.is_valid());
    }

    #[test]
    fn clone_is_view() {
        let mut frame = GpuTextureFrame::new();
        frame.owns_texture = true;
        let copy = frame.clone();
        assert!(!copy.owns_texture());
    }
}
