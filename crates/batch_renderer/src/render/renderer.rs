//! Engine and command streams
//!
//! [`BatchRenderer`] owns the device, the pipeline and everything sized from
//! the configuration. It hands out [`AssetLoader`]s to build scenes and
//! [`CommandStream`]s to render batches of environments.

use crate::foundation::math::vulkan_perspective;
use crate::render::atlas::AtlasLayout;
use crate::render::batch::{BatchPlan, FrameDataLayout};
use crate::render::capture::FrameCapture;
use crate::render::config::{RenderConfig, RenderOptions};
use crate::render::error::{RenderError, RenderResult};
use crate::render::frame::{FrameState, FrameStatus, ReadbackLayout, SlotTracker};
use crate::render::pipeline::{PipelineDescriptor, PipelineState};
use crate::render::sync::{FrameOutput, RenderSync};
use crate::render::vulkan::{select_format, CommandPool, DescriptorPool, DeviceContext, MemoryAllocator};
use crate::scene::{AssetLoader, Environment, EnvironmentState, Scene};
use ash::vk;
use std::sync::Arc;

const COLOR_FORMATS: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::R8G8B8A8_SRGB];
const DEPTH_FORMATS: [vk::Format; 2] = [vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT];

/// State shared by the engine, its loaders and its streams
pub(crate) struct RendererShared {
    pub pipeline: PipelineState,
    pub allocator: MemoryAllocator,
    pub ctx: Arc<DeviceContext>,
    pub config: RenderConfig,
    pub atlas: AtlasLayout,
    pub formats: (vk::Format, vk::Format),
    pub data_layout: FrameDataLayout,
    pub readback_layout: ReadbackLayout,
}

/// Headless batch rendering engine
///
/// Configuration is fixed at construction. Loaders and streams keep the engine's
/// GPU state alive, so they may outlive the `BatchRenderer` value itself.
pub struct BatchRenderer {
    shared: Arc<RendererShared>,
}

impl BatchRenderer {
    /// Open the configured GPU and build the pipeline
    pub fn new(config: RenderConfig) -> RenderResult<Self> {
        config.validate()?;

        let ctx = Arc::new(DeviceContext::new(config.gpu_index, config.enable_validation)?);
        config.features.check_device_support(ctx.supports_nonuniform_textures())?;

        let color_format = select_format(
            &COLOR_FORMATS,
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::TRANSFER_SRC,
            "color",
            |format| ctx.format_properties(format),
        )?;
        let depth_format = select_format(
            &DEPTH_FORMATS,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT | vk::FormatFeatureFlags::TRANSFER_SRC,
            "depth",
            |format| ctx.format_properties(format),
        )?;

        let atlas = AtlasLayout::new(config.batch_size, config.tile_width, config.tile_height)?;
        let extent = atlas.extent();
        let limits = ctx.limits();
        let max_extent = limits
            .max_framebuffer_width
            .min(limits.max_framebuffer_height)
            .min(limits.max_image_dimension2_d);
        if extent.width > max_extent || extent.height > max_extent {
            return Err(RenderError::AtlasTooLarge { width: extent.width, height: extent.height, limit: max_extent });
        }

        // Slot 0 of the texture array holds the default texture
        let texture_slots = config.limits.max_textures + 1;
        let pipeline = PipelineState::new(
            ctx.clone(),
            PipelineDescriptor::from_features(&config.features),
            &config.shaders.directory,
            color_format,
            depth_format,
            texture_slots,
        )?;

        let alignment = limits.min_storage_buffer_offset_alignment as usize;
        let data_layout = FrameDataLayout::new(config.batch_size, &config.limits, alignment);
        let readback_layout = ReadbackLayout::new(atlas, config.features.outputs);

        log::info!(
            "Batch renderer on '{}': {} tiles of {}x{} in a {}x{} atlas, formats {:?}/{:?}",
            ctx.name(),
            config.batch_size,
            config.tile_width,
            config.tile_height,
            extent.width,
            extent.height,
            color_format,
            depth_format
        );

        Ok(Self {
            shared: Arc::new(RendererShared {
                pipeline,
                allocator: MemoryAllocator::new(ctx.clone()),
                ctx,
                config,
                atlas,
                formats: (color_format, depth_format),
                data_layout,
                readback_layout,
            }),
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &RenderConfig {
        &self.shared.config
    }

    /// Tile grid of the framebuffer
    pub fn atlas(&self) -> &AtlasLayout {
        &self.shared.atlas
    }

    /// Name of the selected GPU
    pub fn device_name(&self) -> &str {
        self.shared.ctx.name()
    }

    /// Create a scene loader using the transfer queue
    pub fn make_loader(&self) -> RenderResult<AssetLoader> {
        AssetLoader::new(self.shared.clone())
    }

    /// Create a command stream with its own frame slots
    pub fn make_command_stream(&self) -> RenderResult<CommandStream> {
        CommandStream::new(self.shared.clone())
    }
}

/// Records and submits batches on the graphics queue
///
/// Each stream owns one frame slot, or two with
/// [`RenderOptions::DOUBLE_BUFFERED`]. Slots are used round-robin.
pub struct CommandStream {
    frames: Vec<FrameState>,
    _descriptor_pool: DescriptorPool,
    pool: CommandPool,
    tracker: SlotTracker,
    shared: Arc<RendererShared>,
}

impl CommandStream {
    fn new(shared: Arc<RendererShared>) -> RenderResult<Self> {
        let ctx = shared.ctx.clone();
        let slot_count = shared.config.features.frame_slots();

        let pool = CommandPool::new(ctx.clone(), ctx.families().graphics)?;
        let command_buffers = pool.allocate_command_buffers(slot_count as u32)?;

        let frame_layout = shared.pipeline.frame_layout();
        let descriptor_pool = DescriptorPool::for_layout(ctx, frame_layout, slot_count as u32)?;
        let descriptor_sets = descriptor_pool.allocate(frame_layout, slot_count)?;

        let frames = command_buffers
            .into_iter()
            .zip(descriptor_sets)
            .enumerate()
            .map(|(slot, (command_buffer, descriptor_set))| {
                FrameState::new(
                    &shared.allocator,
                    &shared.pipeline,
                    &shared.data_layout,
                    shared.readback_layout,
                    slot,
                    command_buffer,
                    descriptor_set,
                    shared.formats,
                )
            })
            .collect::<RenderResult<Vec<_>>>()?;

        log::debug!("Command stream with {} frame slot(s)", slot_count);

        Ok(Self { frames, _descriptor_pool: descriptor_pool, pool, tracker: SlotTracker::new(slot_count), shared })
    }

    /// Number of frame slots
    pub fn slot_count(&self) -> usize {
        self.frames.len()
    }

    /// Create an empty environment for `scene` with the default projection
    pub fn make_environment(&self, scene: &Arc<Scene>) -> Environment {
        let config = &self.shared.config;
        let projection = vulkan_perspective(
            config.projection.hfov,
            config.aspect_ratio(),
            config.projection.near,
            config.projection.far,
        ) * config.coordinate_transform;
        Environment::new(scene.clone(), config.limits, projection)
    }

    /// Render every active camera of `envs` into the next frame slot
    ///
    /// Capacity errors are raised before any frame memory is touched. With
    /// [`RenderOptions::CPU_SYNCHRONIZATION`] the call returns after the GPU
    /// finished.
    pub fn render(&mut self, envs: &[Environment]) -> RenderResult<RenderSync> {
        let states: Vec<&EnvironmentState> = envs.iter().map(Environment::state).collect();
        let config = &self.shared.config;
        let plan = BatchPlan::new(&states, config.batch_size, &config.limits)?;

        let slot = self.tracker.next_slot();
        let in_flight = self.tracker.status(slot) == FrameStatus::Submitted;
        self.frames[slot].prepare(in_flight)?;
        if in_flight {
            self.tracker.completed(slot)?;
        }
        let serial = self.tracker.begin_recording(slot)?;

        if let Err(e) = self.record_and_submit(slot, &plan, envs, &states) {
            self.tracker.abort(slot);
            return Err(e);
        }
        self.tracker.submitted(slot)?;

        let shared = self.frames[slot].shared.clone();
        shared.publish(serial, plan.view_count());

        if self.shared.config.features.options.contains(RenderOptions::CPU_SYNCHRONIZATION) {
            shared.fence().wait(u64::MAX)?;
            self.tracker.completed(slot)?;
        }

        log::trace!(
            "Submitted batch {} in slot {}: {} views, {} instances, {} lights",
            serial,
            slot,
            plan.view_count(),
            plan.instance_count(),
            plan.light_count()
        );
        Ok(RenderSync::new(shared, serial))
    }

    /// Render and wait, bracketed by `capture`
    pub fn render_captured(&mut self, envs: &[Environment], capture: &mut dyn FrameCapture) -> RenderResult<FrameOutput> {
        capture.start_frame(&self.shared.ctx);
        let result = self.render(envs).and_then(RenderSync::wait);
        capture.end_frame(&self.shared.ctx);
        result
    }

    fn record_and_submit(
        &mut self,
        slot: usize,
        plan: &BatchPlan,
        envs: &[Environment],
        states: &[&EnvironmentState],
    ) -> RenderResult<()> {
        let shared = &self.shared;
        let pipeline = &shared.pipeline;
        let atlas = &shared.atlas;
        let frame = &mut self.frames[slot];

        shared.data_layout.write(frame.data.bytes_mut(), plan, states);
        frame.scenes = plan.environments().iter().map(|p| envs[p.environment].scene().clone()).collect();

        let clear_values = [
            vk::ClearValue { color: vk::ClearColorValue { float32: shared.config.clear_color } },
            vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } },
        ];

        let mut recorder = self.pool.begin(frame.command_buffer)?;
        recorder.begin_render_pass(pipeline.render_pass(), frame.target.framebuffer(), frame.target.render_area(), &clear_values);
        recorder.bind_pipeline(pipeline.pipeline());
        recorder.bind_descriptor_set(pipeline.layout(), 0, frame.descriptor_set);

        let mut bound: Option<&Arc<Scene>> = None;
        for env_plan in plan.environments() {
            let scene = envs[env_plan.environment].scene();
            if !bound.is_some_and(|b| Arc::ptr_eq(b, scene)) {
                recorder.bind_vertex_buffer(scene.geometry_buffer(), 0);
                recorder.bind_index_buffer(scene.geometry_buffer(), scene.index_offset());
                recorder.bind_descriptor_set(pipeline.layout(), 1, scene.material_set());
                bound = Some(scene);
            }

            for tile in env_plan.tiles.clone() {
                let push = env_plan.push_constants(tile);
                recorder.push_constants(pipeline.layout(), bytemuck::bytes_of(&push));
                recorder.set_viewport(atlas.tile_viewport(tile));
                recorder.set_scissor(atlas.tile_rect(tile));

                for draw in &env_plan.draws {
                    let Some(mesh) = scene.meshes().get(draw.mesh as usize) else {
                        continue;
                    };
                    recorder.draw_indexed(
                        mesh.index_count,
                        draw.instance_count,
                        mesh.first_index,
                        mesh.vertex_offset,
                        draw.first_instance,
                    );
                }
            }
        }
        recorder.end_render_pass();

        let readback = frame.shared.readback_buffer();
        let (color_regions, depth_regions) = frame.shared.layout().copy_regions(plan.view_count());
        recorder.copy_image_to_buffer(frame.target.color_image(), readback, &color_regions);
        recorder.copy_image_to_buffer(frame.target.depth_image(), readback, &depth_regions);

        let to_host = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(readback)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        recorder.pipeline_barrier(vk::PipelineStageFlags::TRANSFER, vk::PipelineStageFlags::HOST, &[to_host], &[]);

        let command_buffer = recorder.end()?;
        shared
            .ctx
            .graphics_queue()
            .submit(shared.ctx.device(), &[command_buffer], frame.shared.fence().handle())
    }
}

impl Drop for CommandStream {
    fn drop(&mut self) {
        for frame in &self.frames {
            if self.tracker.status(frame.shared.slot()) == FrameStatus::Submitted {
                if let Err(e) = frame.shared.fence().wait(u64::MAX) {
                    log::warn!("Failed waiting for frame slot {} on drop: {}", frame.shared.slot(), e);
                }
            }
        }
    }
}
