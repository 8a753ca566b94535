//! DMA-BUF zero-copy import (Linux)
//!
//! A hardware-decoded surface is mapped to a DRM-PRIME descriptor and each
//! plane is imported into the GPU as an externally-backed Vulkan image,
//! then wrapped as a wgpu texture. No pixel ever crosses host memory.
//!
//! Import contract per frame:
//! 1. the decoded surface is synchronized before export (the DRM mapping
//!    performs the surface sync)
//! 2. fresh image/texture objects are created for every frame; reusing one
//!    pair of names across imports is what produces the frozen-frame
//!    failure mode
//! 3. dma-buf file descriptors are duplicated for the import (Vulkan
//!    consumes its copy) and the descriptor's own fds are closed before
//!    this call returns
//! 4. the previous frame's textures are retired only after a submit +
//!    blocking poll confirms the GPU finished with them

use std::os::raw::c_int;
use std::sync::Arc;

use ash::vk;
use ffmpeg_next as ffmpeg;
use ffmpeg::util::frame;

use crate::error::{MediaError, MediaResult};
use crate::media::gpu::GpuContext;
use crate::media::FrameInfo;

// Mirrors the layout of libavutil/hwcontext_drm.h; the header is public
// and stable but not covered by the generated bindings.
const AV_DRM_MAX_PLANES: usize = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct AvDrmObjectDescriptor {
    fd: c_int,
    size: usize,
    format_modifier: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AvDrmPlaneDescriptor {
    object_index: c_int,
    offset: isize,
    pitch: isize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AvDrmLayerDescriptor {
    format: u32,
    nb_planes: c_int,
    planes: [AvDrmPlaneDescriptor; AV_DRM_MAX_PLANES],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AvDrmFrameDescriptor {
    nb_objects: c_int,
    objects: [AvDrmObjectDescriptor; AV_DRM_MAX_PLANES],
    nb_layers: c_int,
    layers: [AvDrmLayerDescriptor; AV_DRM_MAX_PLANES],
}

// DRM fourcc codes for the plane formats VAAPI NV12 surfaces export as
const DRM_FORMAT_R8: u32 = 0x2020_3852;
const DRM_FORMAT_GR88: u32 = 0x3838_5247;
const DRM_FORMAT_RG88: u32 = 0x3838_4752;

// AVHWFrameMapFlags::AV_HWFRAME_MAP_READ
const HWFRAME_MAP_READ: i32 = 1;

struct VulkanHandles {
    device: ash::Device,
    external_memory_fd: ash::khr::external_memory_fd::Device,
}

/// One imported plane: the Vulkan objects are owned by the wgpu texture's
/// drop callback once wrapping succeeds.
struct ImportedPlane {
    texture: Arc<wgpu::Texture>,
}

/// Imports DRM-PRIME frames into wgpu textures.
pub struct DmabufImporter {
    gpu: Arc<GpuContext>,
    vk: VulkanHandles,
    /// Textures of the frame currently on screen; retired on the next
    /// import after GPU completion.
    live: Vec<Arc<wgpu::Texture>>,
}

impl DmabufImporter {
    /// Extract the raw Vulkan handles from the wgpu device and verify the
    /// required external-memory extensions are enabled.
    pub fn new(gpu: Arc<GpuContext>) -> MediaResult<Self> {
        let vk = unsafe {
            gpu.device
                .as_hal::<wgpu_hal::api::Vulkan, _, _>(|hal_device| {
                    let hal_device = hal_device.ok_or_else(|| {
                        MediaError::Gpu("device is not running on Vulkan".into())
                    })?;

                    let enabled = hal_device.enabled_device_extensions();
                    for required in [
                        c"VK_KHR_external_memory_fd",
                        c"VK_EXT_external_memory_dma_buf",
                        c"VK_EXT_image_drm_format_modifier",
                    ] {
                        if !enabled.iter().any(|e| *e == required) {
                            return Err(MediaError::Gpu(format!(
                                "missing Vulkan extension {}",
                                required.to_string_lossy()
                            )));
                        }
                    }

                    let raw_device = hal_device.raw_device().clone();
                    let instance = hal_device.shared_instance().raw_instance();
                    let external_memory_fd =
                        ash::khr::external_memory_fd::Device::new(instance, &raw_device);

                    Ok(VulkanHandles {
                        device: raw_device,
                        external_memory_fd,
                    })
                })
        }?;

        Ok(Self {
            gpu,
            vk,
            live: Vec::new(),
        })
    }

    /// Import a decoded hardware frame; returns the Y and UV plane
    /// textures of its NV12 layout.
    pub fn import_frame(
        &mut self,
        decoded: &frame::Video,
        info: &FrameInfo,
    ) -> MediaResult<(Arc<wgpu::Texture>, Arc<wgpu::Texture>)> {
        // Map to DRM-PRIME. FFmpeg synchronizes the surface as part of the
        // export, so the descriptor is safe to import immediately.
        let mut mapped = frame::Video::empty();
        unsafe {
            (*mapped.as_mut_ptr()).format = ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_DRM_PRIME as i32;
            (*mapped.as_mut_ptr()).width = decoded.width() as i32;
            (*mapped.as_mut_ptr()).height = decoded.height() as i32;
            let ret = ffmpeg::ffi::av_hwframe_map(
                mapped.as_mut_ptr(),
                decoded.as_ptr(),
                HWFRAME_MAP_READ,
            );
            if ret < 0 {
                return Err(MediaError::Gpu(format!(
                    "DRM-PRIME export failed ({ret})"
                )));
            }
        }

        let descriptor =
            unsafe { &*((*mapped.as_ptr()).data[0] as *const AvDrmFrameDescriptor) };
        if descriptor.nb_layers < 2 {
            // Single-layer (interleaved NV12) exports would need a
            // multi-planar image; every driver this targets exports
            // per-plane layers.
            return Err(MediaError::Gpu(format!(
                "unsupported DRM layer count {}",
                descriptor.nb_layers
            )));
        }

        self.gpu.begin_ops();

        let planes: MediaResult<Vec<ImportedPlane>> = (0..2)
            .map(|layer_index| {
                let layer = &descriptor.layers[layer_index];
                let (width, height) = if layer_index == 0 {
                    (info.width, info.height)
                } else {
                    (info.width.div_ceil(2), info.height.div_ceil(2))
                };
                self.import_plane(descriptor, layer, width, height, layer_index)
            })
            .collect();

        // The mapped frame owns the descriptor fds; dropping it closes
        // them now that (duplicated) imports exist.
        drop(mapped);

        let planes = match planes {
            Ok(p) => p,
            Err(e) => {
                let _ = self.gpu.finish_ops("dmabuf import");
                return Err(e);
            }
        };
        self.gpu.finish_ops("dmabuf import")?;

        let tex_y = planes[0].texture.clone();
        let tex_uv = planes[1].texture.clone();

        // Make sure the import is visible to the GPU, then retire the
        // previous frame's textures. Dropping our references after the
        // blocking poll keeps last tick's draw intact while guaranteeing
        // this frame shows fresh content.
        self.gpu.queue.submit(std::iter::empty());
        self.gpu.wait_idle();
        self.live.clear();
        self.live.push(tex_y.clone());
        self.live.push(tex_uv.clone());

        Ok((tex_y, tex_uv))
    }

    fn import_plane(
        &self,
        descriptor: &AvDrmFrameDescriptor,
        layer: &AvDrmLayerDescriptor,
        width: u32,
        height: u32,
        layer_index: usize,
    ) -> MediaResult<ImportedPlane> {
        if layer.nb_planes < 1 {
            return Err(MediaError::Gpu("empty DRM layer".into()));
        }
        let plane = &layer.planes[0];
        let object = &descriptor.objects[plane.object_index as usize];

        let (vk_format, wgpu_format) = match layer.format {
            DRM_FORMAT_R8 => (vk::Format::R8_UNORM, wgpu::TextureFormat::R8Unorm),
            DRM_FORMAT_GR88 | DRM_FORMAT_RG88 => {
                (vk::Format::R8G8_UNORM, wgpu::TextureFormat::Rg8Unorm)
            }
            other => {
                return Err(MediaError::Gpu(format!(
                    "unsupported DRM plane format {other:#010x}"
                )))
            }
        };

        let device = &self.vk.device;

        unsafe {
            let plane_layout = vk::SubresourceLayout {
                offset: plane.offset as u64,
                size: 0,
                row_pitch: plane.pitch as u64,
                array_pitch: 0,
                depth_pitch: 0,
            };
            let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
                .drm_format_modifier(object.format_modifier)
                .plane_layouts(std::slice::from_ref(&plane_layout));
            let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
                .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(vk_format)
                .extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
                .usage(vk::ImageUsageFlags::SAMPLED)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .push_next(&mut external_info)
                .push_next(&mut modifier_info);

            let image = device
                .create_image(&image_info, None)
                .map_err(|e| MediaError::Gpu(format!("image creation failed: {e}")))?;

            // Vulkan consumes the fd it imports; hand it a duplicate so
            // the descriptor's own fd can be closed by the mapping.
            let dup_fd = libc::dup(object.fd);
            if dup_fd < 0 {
                device.destroy_image(image, None);
                return Err(MediaError::Gpu("dma-buf fd duplication failed".into()));
            }

            let requirements = device.get_image_memory_requirements(image);
            let fd_props = self
                .vk
                .external_memory_fd
                .get_memory_fd_properties(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT, dup_fd)
                .map_err(|e| {
                    device.destroy_image(image, None);
                    libc::close(dup_fd);
                    MediaError::Gpu(format!("fd property query failed: {e}"))
                })?;

            let type_bits = requirements.memory_type_bits & fd_props.memory_type_bits;
            let memory_type_index = type_bits.trailing_zeros();
            if memory_type_index >= 32 {
                device.destroy_image(image, None);
                libc::close(dup_fd);
                return Err(MediaError::Gpu("no importable memory type".into()));
            }

            let mut import_info = vk::ImportMemoryFdInfoKHR::default()
                .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
                .fd(dup_fd);
            let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().image(image);
            let allocate_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index)
                .push_next(&mut import_info)
                .push_next(&mut dedicated_info);

            let memory = device.allocate_memory(&allocate_info, None).map_err(|e| {
                device.destroy_image(image, None);
                libc::close(dup_fd);
                MediaError::Gpu(format!("memory import failed: {e}"))
            })?;

            if let Err(e) = device.bind_image_memory(image, memory, 0) {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
                return Err(MediaError::Gpu(format!("memory bind failed: {e}")));
            }

            // Wrap as a wgpu texture. The drop callback owns the Vulkan
            // objects; they are destroyed when the last texture reference
            // goes away.
            let drop_device = device.clone();
            let hal_texture = wgpu_hal::vulkan::Device::texture_from_raw(
                image,
                &wgpu_hal::TextureDescriptor {
                    label: Some(if layer_index == 0 {
                        "imported-y"
                    } else {
                        "imported-uv"
                    }),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format,
                    usage: wgpu_hal::TextureUses::RESOURCE,
                    memory_flags: wgpu_hal::MemoryFlags::empty(),
                    view_formats: vec![],
                },
                Some(Box::new(move || {
                    drop_device.destroy_image(image, None);
                    drop_device.free_memory(memory, None);
                })),
            );

            let texture = self.gpu.device.create_texture_from_hal::<wgpu_hal::api::Vulkan>(
                hal_texture,
                &wgpu::TextureDescriptor {
                    label: Some("imported-plane"),
                    size: wgpu::Extent3d {
                        width,
                        height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING,
                    view_formats: &[],
                },
            );

            Ok(ImportedPlane {
                texture: Arc::new(texture),
            })
        }
    }
}
