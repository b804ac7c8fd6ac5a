//! # Batch Renderer
//!
//! Headless Vulkan rasterizer for simulation workloads: many environments,
//! each with several cameras, rendered as one batch into a tiled atlas and
//! read back to host memory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batch_renderer::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let renderer = BatchRenderer::new(RenderConfig::new(4, 64, 64))?;
//!
//!     let mut desc = SceneDescription::default();
//!     let mesh = desc.add_mesh(
//!         &[
//!             Vertex::new([-0.5, -0.5, 0.0], [0.0, 0.0], [1.0; 3]),
//!             Vertex::new([0.5, -0.5, 0.0], [1.0, 0.0], [1.0; 3]),
//!             Vertex::new([0.0, 0.5, 0.0], [0.5, 1.0], [1.0; 3]),
//!         ],
//!         &[0, 1, 2],
//!     );
//!     let material = desc.add_material(MaterialDescription::color([1.0, 0.0, 0.0, 1.0]));
//!     let scene = renderer.make_loader()?.build_scene(&desc)?;
//!
//!     let mut stream = renderer.make_command_stream()?;
//!     let mut env = stream.make_environment(&scene);
//!     env.add_instance(mesh, material, Mat4::new_translation(&Vec3::new(0.0, 0.0, -2.0)))?;
//!     env.add_camera(Mat4::identity())?;
//!
//!     let output = stream.render(&[env])?.wait()?;
//!     output.save_color_png(0, "tile0.png")?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::Config,
        foundation::math::{look_at, Mat4, Vec3},
        render::{
            BatchRenderer, ColorSource, CommandStream, EngineLimits, ErrorKind, FrameCapture, FrameOutput, Outputs,
            RenderConfig, RenderError, RenderOptions, RenderResult, RenderSync, Shading,
        },
        scene::{
            AssetLoader, CameraHandle, Environment, InstanceHandle, LightHandle, MaterialDescription, Scene,
            SceneDescription, TextureData, TextureFormat, Vertex,
        },
    };
}
