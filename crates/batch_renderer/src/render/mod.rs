//! # Batch rendering
//!
//! Headless rasterization of many small camera views per GPU submission.
//!
//! ## Architecture
//!
//! - **BatchRenderer**: owns the device, pipeline and configuration
//! - **CommandStream**: records batches into round-robin frame slots
//! - **RenderSync / FrameOutput**: completion handle and the readback it yields
//! - **Vulkan backend**: RAII wrappers in [`vulkan`]
//!
//! Every active camera of a batch renders into its own tile of one atlas
//! framebuffer. Tiles are copied back tightly packed, in batch order.

pub mod atlas;
pub mod batch;
pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod sync;
pub mod vulkan;

#[cfg(test)]
mod tests;

pub use atlas::AtlasLayout;
pub use capture::{FrameCapture, LoggingCapture, NoCapture};
pub use config::{
    ColorSource, DefaultProjection, EngineLimits, Outputs, RenderConfig, RenderFeatures, RenderOptions, ShaderConfig,
    Shading,
};
pub use error::{ErrorKind, RenderError, RenderResult};
pub use frame::{FrameStatus, SlotTracker};
pub use renderer::{BatchRenderer, CommandStream};
pub use sync::{FrameOutput, RenderSync};
