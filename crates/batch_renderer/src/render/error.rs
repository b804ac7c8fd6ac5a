//! Renderer error types
//!
//! Every fallible operation in the crate returns [`RenderResult`]. Errors are
//! grouped by [`ErrorKind`] so callers can tell configuration problems (fix the
//! setup) from capacity problems (resize the configuration) from resource
//! exhaustion and synchronization misuse.

use ash::vk;
use thiserror::Error;

/// Broad classification of a [`RenderError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fatal setup problem raised while constructing the engine
    Configuration,
    /// A fixed engine capacity would be exceeded
    Capacity,
    /// GPU memory or API failure
    Resource,
    /// Invalid input such as an unknown handle or empty geometry
    Usage,
    /// Frame slot or readback used out of order
    Synchronization,
}

/// Renderer errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// The Vulkan loader library could not be loaded
    #[error("Vulkan loader unavailable: {0}")]
    LoaderUnavailable(String),

    /// Requested GPU index does not exist
    #[error("No suitable device: GPU index {requested} requested, {available} available")]
    NoSuitableDevice {
        /// Requested GPU index
        requested: u32,
        /// Number of enumerated physical devices
        available: u32,
    },

    /// Device lacks distinct graphics, compute and transfer queue families
    #[error("No suitable queues on device '{device}': need graphics, dedicated compute and dedicated transfer families")]
    NoSuitableQueues {
        /// Name of the rejected device
        device: String,
    },

    /// None of the candidate formats supports the required features
    #[error("Unsupported format: no {purpose} format supports {required:?}")]
    UnsupportedFormat {
        /// What the format was for ("color", "depth")
        purpose: &'static str,
        /// Required optimal tiling features
        required: vk::FormatFeatureFlags,
    },

    /// Atlas framebuffer exceeds device limits
    #[error("Atlas of {width}x{height} exceeds the device limit of {limit}")]
    AtlasTooLarge {
        /// Atlas width in pixels
        width: u32,
        /// Atlas height in pixels
        height: u32,
        /// Largest supported framebuffer dimension
        limit: u32,
    },

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A SPIR-V shader could not be loaded
    #[error("Failed to load shader '{path}': {reason}")]
    ShaderLoad {
        /// Shader file path
        path: String,
        /// Failure description
        reason: String,
    },

    /// More active cameras than the batch holds
    #[error("Batch overflow: {requested} active views, batch size is {capacity}")]
    BatchOverflow {
        /// Active (environment, camera) pairs in the call
        requested: usize,
        /// Configured batch size
        capacity: usize,
    },

    /// Instance region of a frame (or environment) is full
    #[error("Out of instance space: {requested} instances, capacity is {capacity}")]
    OutOfInstanceSpace {
        /// Instances that would be needed
        requested: usize,
        /// Configured maximum
        capacity: usize,
    },

    /// Too many cameras in one environment
    #[error("Too many cameras: {requested}, capacity is {capacity}")]
    TooManyCameras {
        /// Cameras that would be needed
        requested: usize,
        /// Configured maximum
        capacity: usize,
    },

    /// Too many lights in one environment or batch
    #[error("Too many lights: {requested}, capacity is {capacity}")]
    TooManyLights {
        /// Lights that would be needed
        requested: usize,
        /// Configured maximum
        capacity: usize,
    },

    /// Scene declares more materials than the engine supports
    #[error("Too many materials: {requested}, capacity is {capacity}")]
    TooManyMaterials {
        /// Materials in the scene description
        requested: usize,
        /// Configured maximum
        capacity: usize,
    },

    /// Scene declares more textures than the engine supports
    #[error("Too many textures: {requested}, capacity is {capacity}")]
    TooManyTextures {
        /// Textures in the scene description
        requested: usize,
        /// Configured maximum
        capacity: usize,
    },

    /// No memory type satisfies the allowed mask and property flags
    #[error("No memory type in mask {type_bits:#b} has properties {required:?}")]
    OutOfMemoryType {
        /// Allowed memory type mask from the resource requirements
        type_bits: u32,
        /// Required property flags
        required: vk::MemoryPropertyFlags,
    },

    /// Device or host memory exhausted
    #[error("Out of device memory: {0:?}")]
    OutOfDeviceMemory(vk::Result),

    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Scene has no vertices or no indices
    #[error("Empty geometry: {vertices} vertices, {indices} indices")]
    EmptyGeometry {
        /// Vertex count
        vertices: usize,
        /// Index count
        indices: usize,
    },

    /// Mesh range lies outside the index array
    #[error("Mesh {mesh} range {first_index}+{index_count} exceeds {total_indices} indices")]
    InvalidMeshRange {
        /// Mesh index
        mesh: usize,
        /// First index of the range
        first_index: u32,
        /// Number of indices in the range
        index_count: u32,
        /// Size of the index array
        total_indices: usize,
    },

    /// Mesh range references a vertex outside the vertex array
    #[error("Mesh {mesh} references vertex {vertex}, scene has {vertex_count} vertices")]
    VertexOutOfRange {
        /// Mesh index
        mesh: usize,
        /// Index plus vertex offset
        vertex: i64,
        /// Size of the vertex array
        vertex_count: usize,
    },

    /// Mesh index not present in the scene
    #[error("Mesh {mesh} does not exist (scene has {mesh_count})")]
    InvalidMesh {
        /// Requested mesh index
        mesh: u32,
        /// Number of meshes in the scene
        mesh_count: usize,
    },

    /// Material index not present in the scene
    #[error("Material {material} does not exist (scene has {material_count})")]
    InvalidMaterial {
        /// Requested material index
        material: u32,
        /// Number of materials in the scene
        material_count: usize,
    },

    /// Texture data is malformed or referenced out of range
    #[error("Invalid texture {index}: {reason}")]
    InvalidTexture {
        /// Texture index in the scene description
        index: usize,
        /// Failure description
        reason: String,
    },

    /// Handle does not refer to a live object
    #[error("Invalid {kind} handle")]
    InvalidHandle {
        /// Kind of handle ("instance", "camera", "light")
        kind: &'static str,
    },

    /// Frame slot still has a live readback borrowed from it
    #[error("Frame slot {slot} still has an outstanding readback")]
    ReadbackOutstanding {
        /// Buffering slot index
        slot: usize,
    },

    /// Sync handle refers to a submission whose slot has been reused
    #[error("Render sync for slot {slot} is stale: slot has been reused by a later render")]
    StaleSync {
        /// Buffering slot index
        slot: usize,
    },

    /// Frame slot state machine violated
    #[error("Invalid frame transition: {from} -> {to}")]
    InvalidFrameTransition {
        /// Current state
        from: &'static str,
        /// Requested state
        to: &'static str,
    },

    /// Readback image could not be written
    #[error("Image export failed: {0}")]
    ImageExport(String),
}

impl RenderError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoaderUnavailable(_)
            | Self::NoSuitableDevice { .. }
            | Self::NoSuitableQueues { .. }
            | Self::UnsupportedFormat { .. }
            | Self::AtlasTooLarge { .. }
            | Self::InvalidConfig(_)
            | Self::ShaderLoad { .. } => ErrorKind::Configuration,
            Self::BatchOverflow { .. }
            | Self::OutOfInstanceSpace { .. }
            | Self::TooManyCameras { .. }
            | Self::TooManyLights { .. }
            | Self::TooManyMaterials { .. }
            | Self::TooManyTextures { .. } => ErrorKind::Capacity,
            Self::OutOfMemoryType { .. } | Self::OutOfDeviceMemory(_) | Self::Api(_) => ErrorKind::Resource,
            Self::EmptyGeometry { .. }
            | Self::InvalidMeshRange { .. }
            | Self::VertexOutOfRange { .. }
            | Self::InvalidMesh { .. }
            | Self::InvalidMaterial { .. }
            | Self::InvalidTexture { .. }
            | Self::InvalidHandle { .. }
            | Self::ImageExport(_) => ErrorKind::Usage,
            Self::ReadbackOutstanding { .. }
            | Self::StaleSync { .. }
            | Self::InvalidFrameTransition { .. } => ErrorKind::Synchronization,
        }
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory(result)
            }
            other => Self::Api(other),
        }
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_memory_exhaustion_is_distinguished_from_other_api_errors() {
        assert!(matches!(
            RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderError::OutOfDeviceMemory(_)
        ));
        assert!(matches!(RenderError::from(vk::Result::ERROR_DEVICE_LOST), RenderError::Api(_)));
    }

    #[test]
    fn capacity_errors_are_reported_per_kind() {
        let overflow = RenderError::BatchOverflow { requested: 5, capacity: 4 };
        let instances = RenderError::OutOfInstanceSpace { requested: 11, capacity: 10 };
        let lights = RenderError::TooManyLights { requested: 3, capacity: 2 };

        for err in [&overflow, &instances, &lights] {
            assert_eq!(err.kind(), ErrorKind::Capacity);
        }
        assert_ne!(overflow.to_string(), instances.to_string());
    }

    #[test]
    fn sync_misuse_is_classified() {
        assert_eq!(RenderError::StaleSync { slot: 0 }.kind(), ErrorKind::Synchronization);
        assert_eq!(
            RenderError::NoSuitableQueues { device: "gpu".into() }.kind(),
            ErrorKind::Configuration
        );
    }
}
