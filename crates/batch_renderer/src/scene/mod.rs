//! Scene and asset model
//!
//! A [`SceneDescription`] is the asset-loader boundary: plain CPU-side vertex,
//! index, mesh, material and texture data. [`AssetLoader`] validates it and
//! uploads it into an immutable GPU-resident [`Scene`]. [`Environment`]s then
//! place instances of the scene's meshes and point cameras at them.

pub mod environment;
pub mod loader;

pub use environment::{CameraHandle, Environment, EnvironmentState, InstanceHandle, Light, LightHandle};
pub use loader::{AssetLoader, Scene};

use crate::render::config::EngineLimits;
use crate::render::error::{RenderError, RenderResult};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::mem;

/// Scene vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Texture coordinate
    pub uv: [f32; 2],
    /// Linear RGB color
    pub color: [f32; 3],
}

impl Vertex {
    /// Create a vertex
    pub fn new(position: [f32; 3], uv: [f32; 2], color: [f32; 3]) -> Self {
        Self { position, uv, color }
    }

    /// Vertex buffer binding
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Attributes at locations 0 (position), 1 (uv), 2 (color)
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 20,
            },
        ]
    }
}

/// Index range of one mesh inside the scene's index array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshRange {
    /// First index
    pub first_index: u32,
    /// Number of indices
    pub index_count: u32,
    /// Added to every index before fetching the vertex
    pub vertex_offset: i32,
}

/// Material parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialDescription {
    /// RGBA multiplier
    pub base_color: [f32; 4],
    /// Index into the scene's textures
    pub texture: Option<u32>,
}

impl MaterialDescription {
    /// Untextured material
    pub fn color(base_color: [f32; 4]) -> Self {
        Self { base_color, texture: None }
    }

    /// Textured material with a white base color
    pub fn textured(texture: u32) -> Self {
        Self { base_color: [1.0; 4], texture: Some(texture) }
    }
}

/// Texel format of texture data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit RGBA, linear
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
}

impl TextureFormat {
    /// Bytes per texel
    pub fn bytes_per_pixel(self) -> usize {
        4
    }

    /// Matching Vulkan format
    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        }
    }
}

/// Decoded texture
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    /// Tightly packed texel rows
    pub bytes: Vec<u8>,
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: TextureFormat,
}

/// Everything needed to build a scene
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneDescription {
    /// Shared vertex array
    pub vertices: Vec<Vertex>,
    /// Shared index array
    pub indices: Vec<u32>,
    /// Meshes referencing ranges of `indices`
    pub meshes: Vec<MeshRange>,
    /// Materials, referenced by instance
    pub materials: Vec<MaterialDescription>,
    /// Textures, referenced by material
    pub textures: Vec<TextureData>,
}

impl SceneDescription {
    /// Append a mesh from its own vertices and indices, returning its index
    pub fn add_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> u32 {
        let range = MeshRange {
            first_index: self.indices.len() as u32,
            index_count: indices.len() as u32,
            vertex_offset: self.vertices.len() as i32,
        };
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.meshes.push(range);
        (self.meshes.len() - 1) as u32
    }

    /// Append a material, returning its index
    pub fn add_material(&mut self, material: MaterialDescription) -> u32 {
        self.materials.push(material);
        (self.materials.len() - 1) as u32
    }

    /// Append a texture, returning its index
    pub fn add_texture(&mut self, texture: TextureData) -> u32 {
        self.textures.push(texture);
        (self.textures.len() - 1) as u32
    }

    /// Bytes of the vertex array
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Bytes of the index array
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Check the description against engine limits
    pub fn validate(&self, limits: &EngineLimits) -> RenderResult<SceneLayout> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(RenderError::EmptyGeometry {
                vertices: self.vertices.len(),
                indices: self.indices.len(),
            });
        }

        for (mesh, range) in self.meshes.iter().enumerate() {
            let end = range.first_index as u64 + range.index_count as u64;
            if end > self.indices.len() as u64 {
                return Err(RenderError::InvalidMeshRange {
                    mesh,
                    first_index: range.first_index,
                    index_count: range.index_count,
                    total_indices: self.indices.len(),
                });
            }

            let indices = &self.indices[range.first_index as usize..end as usize];
            if let Some(vertex) = indices
                .iter()
                .map(|&i| i64::from(i) + i64::from(range.vertex_offset))
                .find(|&v| v < 0 || v >= self.vertices.len() as i64)
            {
                return Err(RenderError::VertexOutOfRange { mesh, vertex, vertex_count: self.vertices.len() });
            }
        }

        if self.materials.len() > limits.max_materials as usize {
            return Err(RenderError::TooManyMaterials {
                requested: self.materials.len(),
                capacity: limits.max_materials as usize,
            });
        }
        if self.textures.len() > limits.max_textures as usize {
            return Err(RenderError::TooManyTextures {
                requested: self.textures.len(),
                capacity: limits.max_textures as usize,
            });
        }

        for (index, texture) in self.textures.iter().enumerate() {
            if texture.width == 0 || texture.height == 0 {
                return Err(RenderError::InvalidTexture { index, reason: "zero extent".into() });
            }
            let expected = texture.width as usize * texture.height as usize * texture.format.bytes_per_pixel();
            if texture.bytes.len() != expected {
                return Err(RenderError::InvalidTexture {
                    index,
                    reason: format!("expected {} bytes, got {}", expected, texture.bytes.len()),
                });
            }
        }

        for material in &self.materials {
            if let Some(texture) = material.texture {
                if texture as usize >= self.textures.len() {
                    return Err(RenderError::InvalidTexture {
                        index: texture as usize,
                        reason: format!("scene has {} textures", self.textures.len()),
                    });
                }
            }
        }

        Ok(SceneLayout {
            mesh_count: self.meshes.len(),
            material_count: self.materials.len(),
        })
    }
}

/// Shape of a built scene, used to validate environment mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneLayout {
    /// Number of meshes
    pub mesh_count: usize,
    /// Number of materials
    pub material_count: usize,
}

/// GPU material record, mirrors `MaterialParams` in the fragment shader
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub(crate) struct MaterialParams {
    pub base_color: [f32; 4],
    pub texture_index: u32,
    pub pad: [u32; 3],
}

impl From<&MaterialDescription> for MaterialParams {
    fn from(material: &MaterialDescription) -> Self {
        // Slot 0 is the default white texture
        Self {
            base_color: material.base_color,
            texture_index: material.texture.map_or(0, |t| t + 1),
            pad: [0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> SceneDescription {
        let mut desc = SceneDescription::default();
        desc.add_mesh(
            &[
                Vertex::new([0.0, 0.0, 0.0], [0.0, 0.0], [1.0; 3]),
                Vertex::new([1.0, 0.0, 0.0], [1.0, 0.0], [1.0; 3]),
                Vertex::new([0.0, 1.0, 0.0], [0.0, 1.0], [1.0; 3]),
            ],
            &[0, 1, 2],
        );
        desc.add_material(MaterialDescription::color([1.0, 0.0, 0.0, 1.0]));
        desc
    }

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(mem::size_of::<Vertex>(), 32);
        assert_eq!(Vertex::binding_description().stride, 32);
        let offsets: Vec<u32> = Vertex::attribute_descriptions().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 20]);
        assert_eq!(mem::size_of::<MaterialParams>(), 32);
    }

    #[test]
    fn add_mesh_offsets_ranges() {
        let mut desc = triangle();
        let second = desc.add_mesh(&[Vertex::default(); 4], &[0, 1, 2, 2, 3, 0]);

        assert_eq!(second, 1);
        assert_eq!(desc.meshes[1], MeshRange { first_index: 3, index_count: 6, vertex_offset: 3 });
        assert_eq!(desc.index_bytes().len(), 9 * 4);
    }

    #[test]
    fn empty_geometry_is_rejected() {
        let desc = SceneDescription::default();
        assert!(matches!(
            desc.validate(&EngineLimits::default()),
            Err(RenderError::EmptyGeometry { vertices: 0, indices: 0 })
        ));
    }

    #[test]
    fn mesh_range_past_index_array_is_rejected() {
        let mut desc = triangle();
        desc.meshes.push(MeshRange { first_index: 2, index_count: 3, vertex_offset: 0 });

        assert!(matches!(
            desc.validate(&EngineLimits::default()),
            Err(RenderError::InvalidMeshRange { mesh: 1, .. })
        ));
    }

    #[test]
    fn indices_past_vertex_array_are_rejected() {
        let mut desc = triangle();
        desc.add_mesh(&[Vertex::default(); 3], &[0, 1, 3]);
        assert!(matches!(
            desc.validate(&EngineLimits::default()),
            Err(RenderError::VertexOutOfRange { mesh: 1, vertex: 6, vertex_count: 6 })
        ));

        let mut desc = triangle();
        desc.meshes.push(MeshRange { first_index: 0, index_count: 3, vertex_offset: -1 });
        let err = desc.validate(&EngineLimits::default()).unwrap_err();
        assert!(matches!(err, RenderError::VertexOutOfRange { mesh: 1, vertex: -1, .. }));
        assert_eq!(err.kind(), crate::render::ErrorKind::Usage);
    }

    #[test]
    fn textures_are_checked() {
        let mut desc = triangle();
        desc.add_material(MaterialDescription::textured(0));
        assert!(matches!(desc.validate(&EngineLimits::default()), Err(RenderError::InvalidTexture { .. })));

        desc.add_texture(TextureData { bytes: vec![255; 15], width: 2, height: 2, format: TextureFormat::Rgba8Unorm });
        assert!(matches!(desc.validate(&EngineLimits::default()), Err(RenderError::InvalidTexture { index: 0, .. })));

        desc.textures[0].bytes.push(255);
        let layout = desc.validate(&EngineLimits::default()).expect("valid scene");
        assert_eq!(layout, SceneLayout { mesh_count: 1, material_count: 2 });
    }

    #[test]
    fn material_limit_is_enforced() {
        let mut desc = triangle();
        desc.add_material(MaterialDescription::color([0.0; 4]));
        let limits = EngineLimits { max_materials: 1, ..EngineLimits::default() };

        assert!(matches!(
            desc.validate(&limits),
            Err(RenderError::TooManyMaterials { requested: 2, capacity: 1 })
        ));
    }

    #[test]
    fn material_texture_index_skips_default_slot() {
        assert_eq!(MaterialParams::from(&MaterialDescription::color([1.0; 4])).texture_index, 0);
        assert_eq!(MaterialParams::from(&MaterialDescription::textured(2)).texture_index, 3);
    }
}
