//! Scene upload
//!
//! [`AssetLoader`] turns a validated [`SceneDescription`] into a GPU-resident
//! [`Scene`]. All copies run as one submission on the dedicated transfer queue;
//! the staging buffer is released as soon as that submission completes.

use crate::render::error::RenderResult;
use crate::render::pipeline::{MATERIALS_BINDING, TEXTURES_BINDING};
use crate::render::renderer::RendererShared;
use crate::render::vulkan::{CommandPool, DescriptorPool, DescriptorSetWriter, LocalBuffer, Texture};
use crate::scene::{MaterialParams, MeshRange, SceneDescription, SceneLayout};
use ash::vk;
use std::fmt;
use std::mem;
use std::sync::Arc;

/// Texel of the texture bound where a material has none
const DEFAULT_TEXEL: [u8; 4] = [255, 255, 255, 255];

/// Staging offsets are aligned for texel copies
const STAGING_ALIGNMENT: usize = 16;

/// Immutable GPU-resident geometry, materials and textures
///
/// Shared between environments and in-flight frames through `Arc`; the GPU
/// resources are released when the last reference drops.
pub struct Scene {
    layout: SceneLayout,
    meshes: Vec<MeshRange>,
    material_set: vk::DescriptorSet,
    _descriptor_pool: DescriptorPool,
    geometry: LocalBuffer,
    index_offset: vk::DeviceSize,
    _materials: LocalBuffer,
    _textures: Vec<Texture>,
}

impl Scene {
    /// Mesh and material counts
    pub fn layout(&self) -> SceneLayout {
        self.layout
    }

    /// Index ranges of every mesh
    pub fn meshes(&self) -> &[MeshRange] {
        &self.meshes
    }

    /// Buffer holding vertices followed by indices
    pub fn geometry_buffer(&self) -> vk::Buffer {
        self.geometry.handle()
    }

    /// Byte offset of the first index in the geometry buffer
    pub fn index_offset(&self) -> vk::DeviceSize {
        self.index_offset
    }

    /// Descriptor set with materials and textures
    pub fn material_set(&self) -> vk::DescriptorSet {
        self.material_set
    }
}

impl fmt::Debug for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("meshes", &self.layout.mesh_count)
            .field("materials", &self.layout.material_count)
            .field("textures", &self._textures.len())
            .finish()
    }
}

struct TextureSource<'a> {
    bytes: &'a [u8],
    width: u32,
    height: u32,
    format: vk::Format,
}

/// Builds scenes on the transfer queue
///
/// Obtained from [`BatchRenderer::make_loader`](crate::render::BatchRenderer::make_loader).
pub struct AssetLoader {
    shared: Arc<RendererShared>,
    pool: CommandPool,
}

impl AssetLoader {
    pub(crate) fn new(shared: Arc<RendererShared>) -> RenderResult<Self> {
        let ctx = shared.allocator.context().clone();
        let pool = CommandPool::new(ctx.clone(), ctx.families().transfer)?;
        Ok(Self { shared, pool })
    }

    /// Validate `desc` and upload it
    pub fn build_scene(&mut self, desc: &SceneDescription) -> RenderResult<Arc<Scene>> {
        let shared = &self.shared;
        let allocator = &shared.allocator;
        let ctx = allocator.context();
        let layout = desc.validate(&shared.config.limits)?;

        let vertex_bytes = desc.vertex_bytes();
        let index_bytes = desc.index_bytes();
        let geometry_size = vertex_bytes.len() + index_bytes.len();

        let materials: Vec<MaterialParams> = desc.materials.iter().map(MaterialParams::from).collect();
        let material_bytes: &[u8] = bytemuck::cast_slice(&materials);

        let mut sources = Vec::new();
        if shared.pipeline.descriptor().uses_textures() {
            sources.push(TextureSource { bytes: &DEFAULT_TEXEL, width: 1, height: 1, format: vk::Format::R8G8B8A8_UNORM });
            sources.extend(desc.textures.iter().map(|t| TextureSource {
                bytes: &t.bytes,
                width: t.width,
                height: t.height,
                format: t.format.vk_format(),
            }));
        }

        // Staging: vertices, indices, materials, then each texture
        let material_offset = align_up(geometry_size, STAGING_ALIGNMENT);
        let mut cursor = material_offset + material_bytes.len();
        let texture_offsets: Vec<usize> = sources
            .iter()
            .map(|s| {
                let offset = align_up(cursor, STAGING_ALIGNMENT);
                cursor = offset + s.bytes.len();
                offset
            })
            .collect();

        let mut staging = allocator.allocate_staging(cursor)?;
        {
            let bytes = staging.bytes_mut();
            bytes[..vertex_bytes.len()].copy_from_slice(vertex_bytes);
            bytes[vertex_bytes.len()..geometry_size].copy_from_slice(index_bytes);
            bytes[material_offset..material_offset + material_bytes.len()].copy_from_slice(material_bytes);
            for (source, &offset) in sources.iter().zip(&texture_offsets) {
                bytes[offset..offset + source.bytes.len()].copy_from_slice(source.bytes);
            }
        }

        let geometry = allocator.allocate_device_local(
            geometry_size,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let material_buffer = allocator.allocate_device_local(
            material_bytes.len().max(mem::size_of::<MaterialParams>()),
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )?;
        let textures = sources
            .iter()
            .map(|s| Texture::new(allocator, s.width, s.height, s.format))
            .collect::<RenderResult<Vec<_>>>()?;

        self.pool.submit_one_shot(ctx.transfer_queue(), |recorder| {
            recorder.copy_buffer(
                staging.handle(),
                geometry.handle(),
                &[vk::BufferCopy { src_offset: 0, dst_offset: 0, size: geometry_size as vk::DeviceSize }],
            );
            if !material_bytes.is_empty() {
                recorder.copy_buffer(
                    staging.handle(),
                    material_buffer.handle(),
                    &[vk::BufferCopy {
                        src_offset: material_offset as vk::DeviceSize,
                        dst_offset: 0,
                        size: material_bytes.len() as vk::DeviceSize,
                    }],
                );
            }
            for (texture, &offset) in textures.iter().zip(&texture_offsets) {
                texture.record_upload(recorder, staging.handle(), offset as vk::DeviceSize);
            }
            Ok(())
        })?;
        drop(staging);

        let scene_layout = shared.pipeline.scene_layout();
        let descriptor_pool = DescriptorPool::for_layout(ctx.clone(), scene_layout, 1)?;
        let material_set = descriptor_pool
            .allocate(scene_layout, 1)?
            .pop()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)?;

        let mut writer = DescriptorSetWriter::new().storage_buffer(
            material_set,
            MATERIALS_BINDING,
            material_buffer.handle(),
            0,
            material_buffer.size() as vk::DeviceSize,
        );
        if let Some(default) = textures.first() {
            // Unused slots repeat the default texture so every array element is valid
            let views: Vec<vk::ImageView> = (0..shared.pipeline.texture_slots() as usize)
                .map(|slot| textures.get(slot).unwrap_or(default).view())
                .collect();
            writer = writer.sampled_images(material_set, TEXTURES_BINDING, &views, shared.pipeline.sampler().handle());
        }
        writer.update(ctx);

        log::debug!(
            "Built scene: {} meshes, {} vertices, {} indices, {} materials, {} textures",
            layout.mesh_count,
            desc.vertices.len(),
            desc.indices.len(),
            layout.material_count,
            desc.textures.len()
        );

        Ok(Arc::new(Scene {
            layout,
            meshes: desc.meshes.clone(),
            material_set,
            _descriptor_pool: descriptor_pool,
            geometry,
            index_offset: vertex_bytes.len() as vk::DeviceSize,
            _materials: material_buffer,
            _textures: textures,
        }))
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_offsets_round_up() {
        assert_eq!(align_up(0, STAGING_ALIGNMENT), 0);
        assert_eq!(align_up(36, STAGING_ALIGNMENT), 48);
        assert_eq!(align_up(48, STAGING_ALIGNMENT), 48);
    }
}
