//! Sampled textures and their uploads
//!
//! Uploads run on the transfer queue, which cannot name fragment shader stages
//! in barriers. The final transition therefore targets `BOTTOM_OF_PIPE`; the
//! loader waits on a fence before the texture is ever sampled.

use crate::render::error::RenderResult;
use crate::render::vulkan::commands::CommandRecorder;
use crate::render::vulkan::device::DeviceContext;
use crate::render::vulkan::memory::{LocalImage, MemoryAllocator};
use ash::vk;
use std::sync::Arc;

/// 2D texture image with a view
pub struct Texture {
    ctx: Arc<DeviceContext>,
    image: LocalImage,
    view: vk::ImageView,
    width: u32,
    height: u32,
}

impl Texture {
    /// Allocate an uninitialized texture readable from the graphics queue
    pub fn new(allocator: &MemoryAllocator, width: u32, height: u32, format: vk::Format) -> RenderResult<Self> {
        let ctx = allocator.context().clone();
        let families = ctx.families();
        let shared = [families.graphics, families.transfer];

        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(&shared)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = allocator.allocate_image(&info)?;
        let view = image.create_view(vk::ImageAspectFlags::COLOR)?;

        Ok(Self { ctx, image, view, width, height })
    }

    /// Record a copy from `staging` at `offset` and the layout transitions around it
    pub fn record_upload(&self, recorder: &mut CommandRecorder<'_>, staging: vk::Buffer, offset: vk::DeviceSize) {
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let to_transfer = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.handle())
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .build();
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            &[],
            &[to_transfer],
        );

        let region = vk::BufferImageCopy {
            buffer_offset: offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D { width: self.width, height: self.height, depth: 1 },
        };
        recorder.copy_buffer_to_image(staging, self.image.handle(), &[region]);

        let to_shader = vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image.handle())
            .subresource_range(range)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .build();
        recorder.pipeline_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[to_shader],
        );
    }

    /// Image view
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_image_view(self.view, None);
        }
    }
}

/// Sampler wrapper
pub struct Sampler {
    ctx: Arc<DeviceContext>,
    sampler: vk::Sampler,
}

impl Sampler {
    /// Linear filtering with repeat addressing
    pub fn new_linear(ctx: Arc<DeviceContext>) -> RenderResult<Self> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(false)
            .max_lod(0.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false);

        let sampler = unsafe { ctx.device().create_sampler(&info, None)? };
        Ok(Self { ctx, sampler })
    }

    /// Sampler handle
    pub fn handle(&self) -> vk::Sampler {
        self.sampler
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_sampler(self.sampler, None);
        }
    }
}
