//! SPIR-V loading and graphics pipeline creation

use crate::render::error::{RenderError, RenderResult};
use crate::render::vulkan::device::DeviceContext;
use crate::scene::Vertex;
use ash::vk;
use std::ffi::CStr;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    ctx: Arc<DeviceContext>,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Load a SPIR-V file
    pub fn from_file(ctx: Arc<DeviceContext>, path: impl AsRef<Path>) -> RenderResult<Self> {
        let path = path.as_ref();
        let load_error = |reason: String| RenderError::ShaderLoad { path: path.display().to_string(), reason };

        let mut file = File::open(path).map_err(|e| load_error(e.to_string()))?;
        let code = ash::util::read_spv(&mut file).map_err(|e| load_error(e.to_string()))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe { ctx.device().create_shader_module(&create_info, None)? };
        log::debug!("Loaded shader {}", path.display());

        Ok(Self { ctx, module })
    }

    /// Shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_shader_module(self.module, None);
        }
    }
}

/// Graphics pipeline wrapper with RAII cleanup
pub struct GraphicsPipeline {
    ctx: Arc<DeviceContext>,
    pipeline: vk::Pipeline,
}

impl GraphicsPipeline {
    /// Build the batch pipeline: dynamic viewport/scissor, no culling, depth test LESS_OR_EQUAL
    ///
    /// `texture_slots` feeds specialization constant 0 of the fragment shader.
    pub fn new(
        ctx: Arc<DeviceContext>,
        render_pass: vk::RenderPass,
        layout: vk::PipelineLayout,
        vertex: &ShaderModule,
        fragment: &ShaderModule,
        texture_slots: u32,
    ) -> RenderResult<Self> {
        let entry = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

        let spec_entries = [vk::SpecializationMapEntry { constant_id: 0, offset: 0, size: 4 }];
        let spec_data = texture_slots.to_ne_bytes();
        let specialization = vk::SpecializationInfo::builder()
            .map_entries(&spec_entries)
            .data(&spec_data);

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.handle())
                .name(entry)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.handle())
                .name(entry)
                .specialization_info(&specialization)
                .build(),
        ];

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            ctx.device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| RenderError::from(e))?
        };
        let pipeline = pipelines.into_iter().next().ok_or(RenderError::Api(vk::Result::ERROR_INITIALIZATION_FAILED))?;

        Ok(Self { ctx, pipeline })
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_pipeline(self.pipeline, None);
        }
    }
}
