//! Descriptor set layouts, pools and writes

use crate::render::error::RenderResult;
use crate::render::vulkan::device::DeviceContext;
use ash::vk;
use std::sync::Arc;

/// One binding of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSpec {
    /// Binding number
    pub binding: u32,
    /// Descriptor type
    pub ty: vk::DescriptorType,
    /// Array length
    pub count: u32,
    /// Stages that read the binding
    pub stages: vk::ShaderStageFlags,
}

impl BindingSpec {
    /// Single storage buffer
    pub fn storage_buffer(binding: u32, stages: vk::ShaderStageFlags) -> Self {
        Self { binding, ty: vk::DescriptorType::STORAGE_BUFFER, count: 1, stages }
    }

    /// Array of combined image samplers
    pub fn sampled_images(binding: u32, count: u32, stages: vk::ShaderStageFlags) -> Self {
        Self { binding, ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER, count, stages }
    }

    fn to_vk(self) -> vk::DescriptorSetLayoutBinding {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(self.binding)
            .descriptor_type(self.ty)
            .descriptor_count(self.count)
            .stage_flags(self.stages)
            .build()
    }
}

/// Descriptor set layout wrapper
pub struct DescriptorSetLayout {
    ctx: Arc<DeviceContext>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<BindingSpec>,
}

impl DescriptorSetLayout {
    /// Create a layout from binding specs
    pub fn new(ctx: Arc<DeviceContext>, bindings: Vec<BindingSpec>) -> RenderResult<Self> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings.iter().map(|b| b.to_vk()).collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        let layout = unsafe { ctx.device().create_descriptor_set_layout(&layout_info, None)? };

        Ok(Self { ctx, layout, bindings })
    }

    /// Layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Bindings of this layout
    pub fn bindings(&self) -> &[BindingSpec] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Descriptor pool sized for `max_sets` sets of one layout
pub struct DescriptorPool {
    ctx: Arc<DeviceContext>,
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a pool that can hold `max_sets` sets of `layout`
    pub fn for_layout(ctx: Arc<DeviceContext>, layout: &DescriptorSetLayout, max_sets: u32) -> RenderResult<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = layout
            .bindings()
            .iter()
            .map(|b| vk::DescriptorPoolSize { ty: b.ty, descriptor_count: b.count * max_sets })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);

        let pool = unsafe { ctx.device().create_descriptor_pool(&pool_info, None)? };

        Ok(Self { ctx, pool })
    }

    /// Allocate `count` sets of `layout`
    pub fn allocate(&self, layout: &DescriptorSetLayout, count: usize) -> RenderResult<Vec<vk::DescriptorSet>> {
        let layouts = vec![layout.handle(); count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        Ok(unsafe { self.ctx.device().allocate_descriptor_sets(&alloc_info)? })
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_descriptor_pool(self.pool, None);
        }
    }
}

enum PendingWrite {
    Buffer { set: vk::DescriptorSet, binding: u32, info: vk::DescriptorBufferInfo },
    Images { set: vk::DescriptorSet, binding: u32, infos: Vec<vk::DescriptorImageInfo> },
}

/// Collects descriptor writes and applies them in one call
#[derive(Default)]
pub struct DescriptorSetWriter {
    pending: Vec<PendingWrite>,
}

impl DescriptorSetWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a storage buffer range
    pub fn storage_buffer(
        mut self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) -> Self {
        let info = vk::DescriptorBufferInfo { buffer, offset, range };
        self.pending.push(PendingWrite::Buffer { set, binding, info });
        self
    }

    /// Bind an array of image views sharing one sampler
    pub fn sampled_images(mut self, set: vk::DescriptorSet, binding: u32, views: &[vk::ImageView], sampler: vk::Sampler) -> Self {
        let infos = views
            .iter()
            .map(|&image_view| vk::DescriptorImageInfo {
                sampler,
                image_view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        self.pending.push(PendingWrite::Images { set, binding, infos });
        self
    }

    /// Apply all writes
    pub fn update(self, ctx: &DeviceContext) {
        let writes: Vec<vk::WriteDescriptorSet> = self
            .pending
            .iter()
            .map(|write| match write {
                PendingWrite::Buffer { set, binding, info } => vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
                PendingWrite::Images { set, binding, infos } => vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(*binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(infos)
                    .build(),
            })
            .collect();

        unsafe { ctx.device().update_descriptor_sets(&writes, &[]) };
    }
}
