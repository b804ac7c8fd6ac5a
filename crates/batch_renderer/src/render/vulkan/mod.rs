//! Vulkan backend
//!
//! Thin RAII wrappers over the Vulkan objects the batch renderer needs. Every
//! wrapper holds an `Arc<DeviceContext>` and releases its handle on drop.

pub mod commands;
pub mod descriptor_set;
pub mod device;
pub mod framebuffer;
pub mod memory;
pub mod render_pass;
pub mod shader;
pub mod sync;
pub mod texture;

pub use commands::{CommandPool, CommandRecorder};
pub use descriptor_set::{BindingSpec, DescriptorPool, DescriptorSetLayout, DescriptorSetWriter};
pub use device::{select_format, select_queue_families, DeviceContext, Queue, QueueFamilies};
pub use framebuffer::AtlasTarget;
pub use memory::{find_memory_type, HostBuffer, LocalBuffer, LocalImage, MemoryAllocator};
pub use render_pass::RenderPass;
pub use shader::{GraphicsPipeline, ShaderModule};
pub use sync::Fence;
pub use texture::{Sampler, Texture};
