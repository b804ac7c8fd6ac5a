//! Renderer configuration
//!
//! `RenderConfig` is fixed for the lifetime of a [`BatchRenderer`](crate::render::BatchRenderer);
//! changing any value requires building a new engine. It can be assembled with the
//! `with_*` builders or loaded from a `.toml`/`.ron` file through [`Config`].

use crate::config::Config;
use crate::foundation::math::Mat4;
use crate::render::atlas::AtlasLayout;
use crate::render::error::{RenderError, RenderResult};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where fragment color comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSource {
    /// Per-vertex color modulated by the material base color
    Vertex,
    /// Material texture modulated by vertex and base color
    Texture,
}

/// Shading model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shading {
    /// No lighting
    Unlit,
    /// Diffuse point lights
    Lit,
}

bitflags! {
    /// Attachments copied back to the host after each render
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Outputs: u32 {
        /// RGBA8 color
        const COLOR = 1 << 0;
        /// 32-bit float depth
        const DEPTH = 1 << 1;
    }
}

bitflags! {
    /// Frame pipeline behavior switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RenderOptions: u32 {
        /// `render()` waits for GPU completion before returning
        const CPU_SYNCHRONIZATION = 1 << 0;
        /// Two frame slots, so frame N+1 can be built while N executes
        const DOUBLE_BUFFERED = 1 << 1;
    }
}

/// Pipeline feature selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderFeatures {
    /// Color source
    pub color_source: ColorSource,
    /// Shading model
    pub shading: Shading,
    /// Attachments read back
    pub outputs: Outputs,
    /// Frame pipeline options
    pub options: RenderOptions,
}

impl Default for RenderFeatures {
    fn default() -> Self {
        Self {
            color_source: ColorSource::Vertex,
            shading: Shading::Unlit,
            outputs: Outputs::COLOR,
            options: RenderOptions::DOUBLE_BUFFERED,
        }
    }
}

impl RenderFeatures {
    /// Number of frame slots implied by the options
    pub fn frame_slots(&self) -> usize {
        if self.options.contains(RenderOptions::DOUBLE_BUFFERED) {
            2
        } else {
            1
        }
    }

    /// Reject features the device cannot execute
    ///
    /// Textured pipelines index the texture array per instance, which needs
    /// non-uniform sampled image indexing.
    pub fn check_device_support(&self, nonuniform_textures: bool) -> RenderResult<()> {
        if self.color_source == ColorSource::Texture && !nonuniform_textures {
            return Err(RenderError::InvalidConfig(
                "texture color source needs shaderSampledImageArrayNonUniformIndexing".to_string(),
            ));
        }
        Ok(())
    }
}

/// Projection applied to every new environment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultProjection {
    /// Horizontal field of view in degrees
    pub hfov: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl Default for DefaultProjection {
    fn default() -> Self {
        Self { hfov: 90.0, near: 0.01, far: 1000.0 }
    }
}

/// Engine-wide capacity limits
///
/// Checked on the host at every mutation point and used to size GPU buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineLimits {
    /// Instances per environment and per batch
    pub max_instances: u32,
    /// Cameras per environment
    pub max_cameras: u32,
    /// Lights per environment and per batch
    pub max_lights: u32,
    /// Materials per scene
    pub max_materials: u32,
    /// Textures per scene
    pub max_textures: u32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_instances: 500_000,
            max_cameras: 256,
            max_lights: 1024,
            max_materials: 1024,
            max_textures: 64,
        }
    }
}

/// Shader location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Directory holding the compiled SPIR-V files
    pub directory: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self { directory: PathBuf::from(env!("BATCH_RENDERER_SHADER_DIR")) }
    }
}

/// Batch renderer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Index into the enumerated physical devices
    pub gpu_index: u32,
    /// Maximum active views per render call
    pub batch_size: u32,
    /// Width of one view in pixels
    pub tile_width: u32,
    /// Height of one view in pixels
    pub tile_height: u32,
    /// Projection for new environments
    pub projection: DefaultProjection,
    /// Applied to geometry before the projection (e.g. Z-up to Y-up)
    pub coordinate_transform: Mat4,
    /// Atlas clear color
    pub clear_color: [f32; 4],
    /// Capacity limits
    pub limits: EngineLimits,
    /// Shader location
    pub shaders: ShaderConfig,
    /// Pipeline features
    pub features: RenderFeatures,
    /// Enable Vulkan validation layers
    pub enable_validation: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            gpu_index: 0,
            batch_size: 1,
            tile_width: 64,
            tile_height: 64,
            projection: DefaultProjection::default(),
            coordinate_transform: Mat4::identity(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            limits: EngineLimits::default(),
            shaders: ShaderConfig::default(),
            features: RenderFeatures::default(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl Config for RenderConfig {}

impl RenderConfig {
    /// Create a configuration for `batch_size` views of `width`x`height`
    pub fn new(batch_size: u32, width: u32, height: u32) -> Self {
        Self {
            batch_size,
            tile_width: width,
            tile_height: height,
            ..Self::default()
        }
    }

    /// Select the GPU by enumeration index
    pub fn with_gpu_index(mut self, gpu_index: u32) -> Self {
        self.gpu_index = gpu_index;
        self
    }

    /// Set the default projection
    pub fn with_projection(mut self, hfov: f32, near: f32, far: f32) -> Self {
        self.projection = DefaultProjection { hfov, near, far };
        self
    }

    /// Set the coordinate transform applied before projection
    pub fn with_coordinate_transform(mut self, transform: Mat4) -> Self {
        self.coordinate_transform = transform;
        self
    }

    /// Set the clear color
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set capacity limits
    pub fn with_limits(mut self, limits: EngineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the compiled shader directory
    pub fn with_shader_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.shaders.directory = directory.into();
        self
    }

    /// Set the color source
    pub fn with_color_source(mut self, source: ColorSource) -> Self {
        self.features.color_source = source;
        self
    }

    /// Set the shading model
    pub fn with_shading(mut self, shading: Shading) -> Self {
        self.features.shading = shading;
        self
    }

    /// Set the read back attachments
    pub fn with_outputs(mut self, outputs: Outputs) -> Self {
        self.features.outputs = outputs;
        self
    }

    /// Set frame pipeline options
    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.features.options = options;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Aspect ratio of one view
    pub fn aspect_ratio(&self) -> f32 {
        self.tile_width as f32 / self.tile_height as f32
    }

    /// Check the configuration for inconsistent values
    pub fn validate(&self) -> RenderResult<()> {
        let invalid = |msg: &str| Err(RenderError::InvalidConfig(msg.to_string()));

        if self.batch_size == 0 {
            return invalid("batch_size must be positive");
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return invalid("tile dimensions must be positive");
        }
        AtlasLayout::new(self.batch_size, self.tile_width, self.tile_height)?;
        if !(self.projection.hfov > 0.0 && self.projection.hfov < 180.0) {
            return invalid("hfov must be between 0 and 180 degrees");
        }
        if self.projection.near <= 0.0 || self.projection.far <= self.projection.near {
            return invalid("projection requires 0 < near < far");
        }
        if self.features.outputs.is_empty() {
            return invalid("at least one output must be enabled");
        }

        let limits = &self.limits;
        if limits.max_instances == 0
            || limits.max_cameras == 0
            || limits.max_lights == 0
            || limits.max_materials == 0
        {
            return invalid("capacity limits must be positive");
        }

        Ok(())
    }
}
