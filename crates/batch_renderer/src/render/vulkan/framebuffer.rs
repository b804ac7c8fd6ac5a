//! Atlas framebuffer: one color and one depth image covering every tile

use crate::render::error::RenderResult;
use crate::render::vulkan::device::DeviceContext;
use crate::render::vulkan::memory::{LocalImage, MemoryAllocator};
use ash::vk;
use std::sync::Arc;

/// Color and depth images with their views and framebuffer
pub struct AtlasTarget {
    ctx: Arc<DeviceContext>,
    color: LocalImage,
    depth: LocalImage,
    color_view: vk::ImageView,
    depth_view: vk::ImageView,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl AtlasTarget {
    /// Create attachments of `extent` compatible with `render_pass`
    pub fn new(
        allocator: &MemoryAllocator,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> RenderResult<Self> {
        let ctx = allocator.context().clone();
        let image_info = |format: vk::Format, usage: vk::ImageUsageFlags| {
            vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
                .mip_levels(1)
                .array_layers(1)
                .format(format)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(usage | vk::ImageUsageFlags::TRANSFER_SRC)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .samples(vk::SampleCountFlags::TYPE_1)
                .build()
        };

        let color = allocator.allocate_image(&image_info(color_format, vk::ImageUsageFlags::COLOR_ATTACHMENT))?;
        let depth = allocator.allocate_image(&image_info(depth_format, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT))?;

        let device = ctx.device();
        let color_view = color.create_view(vk::ImageAspectFlags::COLOR)?;
        let depth_view = match depth.create_view(vk::ImageAspectFlags::DEPTH) {
            Ok(view) => view,
            Err(e) => {
                unsafe { device.destroy_image_view(color_view, None) };
                return Err(e);
            }
        };

        let attachments = [color_view, depth_view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let framebuffer = match unsafe { device.create_framebuffer(&framebuffer_info, None) } {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                unsafe {
                    device.destroy_image_view(depth_view, None);
                    device.destroy_image_view(color_view, None);
                }
                return Err(e.into());
            }
        };

        log::debug!("Atlas framebuffer created: {}x{}", extent.width, extent.height);

        Ok(Self { ctx, color, depth, color_view, depth_view, framebuffer, extent })
    }

    /// Framebuffer handle
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Color image
    pub fn color_image(&self) -> vk::Image {
        self.color.handle()
    }

    /// Depth image
    pub fn depth_image(&self) -> vk::Image {
        self.depth.handle()
    }

    /// Whole atlas area
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: self.extent }
    }
}

impl Drop for AtlasTarget {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_framebuffer(self.framebuffer, None);
            device.destroy_image_view(self.depth_view, None);
            device.destroy_image_view(self.color_view, None);
        }
    }
}
