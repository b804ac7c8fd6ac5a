//! Command buffer management
//!
//! `CommandRecorder` wraps the handful of commands the batch renderer records.
//! `CommandPool::submit_one_shot` records, submits and waits for a throwaway
//! command buffer, which is how scene uploads run on the transfer queue.

use crate::render::error::RenderResult;
use crate::render::vulkan::device::{DeviceContext, Queue};
use crate::render::vulkan::sync::Fence;
use ash::vk;
use std::sync::Arc;

/// Command pool wrapper with RAII cleanup
pub struct CommandPool {
    ctx: Arc<DeviceContext>,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually
    pub fn new(ctx: Arc<DeviceContext>, queue_family_index: u32) -> RenderResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe { ctx.device().create_command_pool(&pool_create_info, None)? };

        Ok(Self { ctx, command_pool })
    }

    /// Allocate primary command buffers
    pub fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        Ok(unsafe { self.ctx.device().allocate_command_buffers(&alloc_info)? })
    }

    /// Start recording into `command_buffer`, discarding previous contents
    pub fn begin(&self, command_buffer: vk::CommandBuffer) -> RenderResult<CommandRecorder<'_>> {
        let device = self.ctx.device();
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &begin_info)?;
        }

        Ok(CommandRecorder { device, command_buffer })
    }

    /// Record with `record`, submit to `queue` and block until it completes
    pub fn submit_one_shot<F>(&self, queue: &Queue, record: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> RenderResult<()>,
    {
        let command_buffer = self.allocate_command_buffers(1)?[0];
        let result = self.run_one_shot(queue, command_buffer, record);

        unsafe { self.ctx.device().free_command_buffers(self.command_pool, &[command_buffer]) };
        result
    }

    fn run_one_shot<F>(&self, queue: &Queue, command_buffer: vk::CommandBuffer, record: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandRecorder<'_>) -> RenderResult<()>,
    {
        let mut recorder = self.begin(command_buffer)?;
        record(&mut recorder)?;
        let command_buffer = recorder.end()?;

        let fence = Fence::new(self.ctx.clone(), false)?;
        queue.submit(self.ctx.device(), &[command_buffer], fence.handle())?;
        fence.wait(u64::MAX)
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Records into one command buffer between `begin` and `end`
pub struct CommandRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    /// Finish recording
    pub fn end(self) -> RenderResult<vk::CommandBuffer> {
        unsafe { self.device.end_command_buffer(self.command_buffer)? };
        Ok(self.command_buffer)
    }

    /// Begin an inline render pass
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let render_pass_begin = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);

        unsafe {
            self.device
                .cmd_begin_render_pass(self.command_buffer, &render_pass_begin, vk::SubpassContents::INLINE);
        }
    }

    /// End the current render pass
    pub fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
    }

    /// Bind a graphics pipeline
    pub fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device
                .cmd_bind_pipeline(self.command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    /// Bind one descriptor set at `set`
    pub fn bind_descriptor_set(&mut self, layout: vk::PipelineLayout, set: u32, descriptor_set: vk::DescriptorSet) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set,
                &[descriptor_set],
                &[],
            );
        }
    }

    /// Bind a vertex buffer at binding 0
    pub fn bind_vertex_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[buffer], &[offset]);
        }
    }

    /// Bind a 32-bit index buffer
    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.command_buffer, buffer, offset, vk::IndexType::UINT32);
        }
    }

    /// Push constants to the vertex and fragment stages
    pub fn push_constants(&mut self, layout: vk::PipelineLayout, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(
                self.command_buffer,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                0,
                data,
            );
        }
    }

    /// Set viewport 0
    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]) };
    }

    /// Set scissor 0
    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
    }

    /// Indexed instanced draw
    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    /// Copy between buffers
    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.command_buffer, src, dst, regions) };
    }

    /// Copy a buffer into an image in `TRANSFER_DST_OPTIMAL`
    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, regions: &[vk::BufferImageCopy]) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                regions,
            );
        }
    }

    /// Copy an image in `TRANSFER_SRC_OPTIMAL` into a buffer
    pub fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer, regions: &[vk::BufferImageCopy]) {
        if regions.is_empty() {
            return;
        }
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                regions,
            );
        }
    }

    /// Record a pipeline barrier
    pub fn pipeline_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }
}
