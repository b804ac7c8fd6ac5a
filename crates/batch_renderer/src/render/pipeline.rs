//! Pipeline variants
//!
//! [`PipelineDescriptor`] resolves the configured shading model and color
//! source into concrete shader files and descriptor set layouts once, at
//! engine construction. [`PipelineState`] owns the resulting GPU objects.

use crate::render::batch::RenderPushConstant;
use crate::render::config::{ColorSource, RenderFeatures, Shading};
use crate::render::error::RenderResult;
use crate::render::vulkan::{
    BindingSpec, DescriptorSetLayout, DeviceContext, GraphicsPipeline, RenderPass, Sampler, ShaderModule,
};
use ash::vk;
use std::mem;
use std::path::Path;
use std::sync::Arc;

/// Frame set (set 0) binding of the view array
pub const VIEWS_BINDING: u32 = 0;
/// Frame set binding of the instance transforms
pub const TRANSFORMS_BINDING: u32 = 1;
/// Frame set binding of the per-instance material indices
pub const MATERIAL_INDICES_BINDING: u32 = 2;
/// Frame set binding of the light array, lit pipelines only
pub const LIGHTS_BINDING: u32 = 3;
/// Scene set (set 1) binding of the material parameters
pub const MATERIALS_BINDING: u32 = 0;
/// Scene set binding of the texture array, textured pipelines only
pub const TEXTURES_BINDING: u32 = 1;

/// Shader and layout selection for one feature combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDescriptor {
    /// Shading model
    pub shading: Shading,
    /// Color source
    pub color_source: ColorSource,
}

impl PipelineDescriptor {
    /// Resolve from configured features
    pub fn from_features(features: &RenderFeatures) -> Self {
        Self { shading: features.shading, color_source: features.color_source }
    }

    /// Vertex shader file name
    pub fn vertex_shader(&self) -> &'static str {
        "batch.vert.spv"
    }

    /// Fragment shader variant file name
    pub fn fragment_shader(&self) -> &'static str {
        match (self.shading, self.color_source) {
            (Shading::Unlit, ColorSource::Vertex) => "unlit_vertex.frag.spv",
            (Shading::Unlit, ColorSource::Texture) => "unlit_textured.frag.spv",
            (Shading::Lit, ColorSource::Vertex) => "lit_vertex.frag.spv",
            (Shading::Lit, ColorSource::Texture) => "lit_textured.frag.spv",
        }
    }

    /// Whether the fragment shader reads lights
    pub fn uses_lights(&self) -> bool {
        self.shading == Shading::Lit
    }

    /// Whether the fragment shader samples textures
    pub fn uses_textures(&self) -> bool {
        self.color_source == ColorSource::Texture
    }

    /// Bindings of the per-frame set
    pub fn frame_bindings(&self) -> Vec<BindingSpec> {
        let vertex = vk::ShaderStageFlags::VERTEX;
        let mut bindings = vec![
            BindingSpec::storage_buffer(VIEWS_BINDING, vertex),
            BindingSpec::storage_buffer(TRANSFORMS_BINDING, vertex),
            BindingSpec::storage_buffer(MATERIAL_INDICES_BINDING, vertex),
        ];
        if self.uses_lights() {
            bindings.push(BindingSpec::storage_buffer(LIGHTS_BINDING, vk::ShaderStageFlags::FRAGMENT));
        }
        bindings
    }

    /// Bindings of the per-scene set; `texture_slots` includes the default texture
    pub fn scene_bindings(&self, texture_slots: u32) -> Vec<BindingSpec> {
        let fragment = vk::ShaderStageFlags::FRAGMENT;
        let mut bindings = vec![BindingSpec::storage_buffer(MATERIALS_BINDING, fragment)];
        if self.uses_textures() {
            bindings.push(BindingSpec::sampled_images(TEXTURES_BINDING, texture_slots, fragment));
        }
        bindings
    }
}

/// Render pass, layouts and pipeline for one descriptor
pub struct PipelineState {
    ctx: Arc<DeviceContext>,
    descriptor: PipelineDescriptor,
    render_pass: RenderPass,
    frame_layout: DescriptorSetLayout,
    scene_layout: DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: Option<GraphicsPipeline>,
    sampler: Sampler,
    texture_slots: u32,
}

impl PipelineState {
    /// Load shaders from `shader_dir` and build the pipeline
    pub fn new(
        ctx: Arc<DeviceContext>,
        descriptor: PipelineDescriptor,
        shader_dir: &Path,
        color_format: vk::Format,
        depth_format: vk::Format,
        texture_slots: u32,
    ) -> RenderResult<Self> {
        let vertex = ShaderModule::from_file(ctx.clone(), shader_dir.join(descriptor.vertex_shader()))?;
        let fragment = ShaderModule::from_file(ctx.clone(), shader_dir.join(descriptor.fragment_shader()))?;

        let render_pass = RenderPass::new_offscreen(ctx.clone(), color_format, depth_format)?;
        let frame_layout = DescriptorSetLayout::new(ctx.clone(), descriptor.frame_bindings())?;
        let scene_layout = DescriptorSetLayout::new(ctx.clone(), descriptor.scene_bindings(texture_slots))?;
        let sampler = Sampler::new_linear(ctx.clone())?;

        let set_layouts = [frame_layout.handle(), scene_layout.handle()];
        let push_ranges = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: mem::size_of::<RenderPushConstant>() as u32,
        }];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe { ctx.device().create_pipeline_layout(&layout_info, None)? };

        let mut state = Self {
            ctx: ctx.clone(),
            descriptor,
            render_pass,
            frame_layout,
            scene_layout,
            pipeline_layout,
            pipeline: None,
            sampler,
            texture_slots,
        };

        // On failure `state` drops and releases the pipeline layout
        state.pipeline = Some(GraphicsPipeline::new(
            ctx,
            state.render_pass.handle(),
            pipeline_layout,
            &vertex,
            &fragment,
            texture_slots,
        )?);

        log::info!(
            "Pipeline ready: {} + {}",
            descriptor.vertex_shader(),
            descriptor.fragment_shader()
        );
        Ok(state)
    }

    /// Resolved variant
    pub fn descriptor(&self) -> PipelineDescriptor {
        self.descriptor
    }

    /// Render pass handle
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    /// Per-frame set layout
    pub fn frame_layout(&self) -> &DescriptorSetLayout {
        &self.frame_layout
    }

    /// Per-scene set layout
    pub fn scene_layout(&self) -> &DescriptorSetLayout {
        &self.scene_layout
    }

    /// Pipeline layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Pipeline handle
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline.as_ref().map_or(vk::Pipeline::null(), GraphicsPipeline::handle)
    }

    /// Sampler shared by every scene texture
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Texture array length, including the default texture
    pub fn texture_slots(&self) -> u32 {
        self.texture_slots
    }
}

impl Drop for PipelineState {
    fn drop(&mut self) {
        self.pipeline = None;
        unsafe {
            self.ctx.device().destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}
