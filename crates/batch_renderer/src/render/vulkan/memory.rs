//! GPU memory allocation
//!
//! Every buffer and image gets its own `vkAllocateMemory` call; images use a
//! dedicated allocation. Host buffers stay persistently mapped for their whole
//! lifetime and are always host coherent, so no explicit flush is needed.

use crate::render::error::{RenderError, RenderResult};
use crate::render::vulkan::device::DeviceContext;
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

/// Lowest memory type index allowed by `type_bits` that has every `required` flag
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    (0..properties.memory_type_count)
        .find(|&i| {
            type_bits & (1 << i) != 0 && properties.memory_types[i as usize].property_flags.contains(required)
        })
        .ok_or(RenderError::OutOfMemoryType { type_bits, required })
}

/// Creates buffers and images on one device
#[derive(Clone)]
pub struct MemoryAllocator {
    ctx: Arc<DeviceContext>,
}

impl MemoryAllocator {
    /// Create an allocator for `ctx`
    pub fn new(ctx: Arc<DeviceContext>) -> Self {
        Self { ctx }
    }

    /// Mapped upload buffer
    pub fn allocate_staging(&self, bytes: usize) -> RenderResult<HostBuffer> {
        self.allocate_host(bytes, vk::BufferUsageFlags::TRANSFER_SRC, false)
    }

    /// Mapped host buffer, optionally preferring cached memory for readback
    pub fn allocate_host(&self, bytes: usize, usage: vk::BufferUsageFlags, prefer_cached: bool) -> RenderResult<HostBuffer> {
        let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let device = self.ctx.device();

        let buffer = create_buffer(device, bytes.max(1) as vk::DeviceSize, usage, &[])?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory_properties = self.ctx.memory_properties();
        let type_index = if prefer_cached {
            find_memory_type(memory_properties, requirements.memory_type_bits, coherent | vk::MemoryPropertyFlags::HOST_CACHED)
                .or_else(|_| find_memory_type(memory_properties, requirements.memory_type_bits, coherent))
        } else {
            find_memory_type(memory_properties, requirements.memory_type_bits, coherent)
        };

        let memory = match type_index.and_then(|index| allocate(device, requirements.size, index, None)) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let mapped = unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|_| device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };

        match mapped.map(|ptr| NonNull::new(ptr.cast::<u8>())) {
            Ok(Some(ptr)) => Ok(HostBuffer { ctx: self.ctx.clone(), buffer, memory, size: bytes, ptr }),
            other => {
                unsafe {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
                Err(match other {
                    Err(result) => result.into(),
                    _ => RenderError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED),
                })
            }
        }
    }

    /// Device-local buffer shared between the graphics and transfer queues
    pub fn allocate_device_local(&self, bytes: usize, usage: vk::BufferUsageFlags) -> RenderResult<LocalBuffer> {
        let device = self.ctx.device();
        let families = self.ctx.families();
        let buffer = create_buffer(device, bytes.max(1) as vk::DeviceSize, usage, &[families.graphics, families.transfer])?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = find_memory_type(
            self.ctx.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .and_then(|index| allocate(device, requirements.size, index, None))
        .and_then(|memory| match unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                Err(e.into())
            }
        });

        match memory {
            Ok(memory) => Ok(LocalBuffer { ctx: self.ctx.clone(), buffer, memory, size: bytes }),
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    /// Device-local image with a dedicated allocation
    pub fn allocate_image(&self, info: &vk::ImageCreateInfo) -> RenderResult<LocalImage> {
        let device = self.ctx.device();
        let image = unsafe { device.create_image(info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let dedicated = vk::MemoryDedicatedAllocateInfo::builder().image(image).build();
        let memory = find_memory_type(
            self.ctx.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .and_then(|index| allocate(device, requirements.size, index, Some(dedicated)))
        .and_then(|memory| match unsafe { device.bind_image_memory(image, memory, 0) } {
            Ok(()) => Ok(memory),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                Err(e.into())
            }
        });

        match memory {
            Ok(memory) => Ok(LocalImage {
                ctx: self.ctx.clone(),
                image,
                memory,
                format: info.format,
            }),
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    /// Device this allocator creates resources on
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }
}

fn create_buffer(
    device: &ash::Device,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    shared_families: &[u32],
) -> RenderResult<vk::Buffer> {
    let mut info = vk::BufferCreateInfo::builder().size(size).usage(usage);
    info = if shared_families.len() > 1 {
        info.sharing_mode(vk::SharingMode::CONCURRENT).queue_family_indices(shared_families)
    } else {
        info.sharing_mode(vk::SharingMode::EXCLUSIVE)
    };

    Ok(unsafe { device.create_buffer(&info, None)? })
}

fn allocate(
    device: &ash::Device,
    size: vk::DeviceSize,
    type_index: u32,
    dedicated: Option<vk::MemoryDedicatedAllocateInfo>,
) -> RenderResult<vk::DeviceMemory> {
    let mut dedicated = dedicated;
    let mut info = vk::MemoryAllocateInfo::builder().allocation_size(size).memory_type_index(type_index);
    if let Some(dedicated) = dedicated.as_mut() {
        info = info.push_next(dedicated);
    }

    Ok(unsafe { device.allocate_memory(&info, None)? })
}

/// Persistently mapped host-visible buffer
pub struct HostBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: usize,
    ptr: NonNull<u8>,
}

// The mapping is owned exclusively by this value; access follows normal borrow rules
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    /// Buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Mapped contents
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mapped contents, writable
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.unmap_memory(self.memory);
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Device-local buffer
pub struct LocalBuffer {
    ctx: Arc<DeviceContext>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: usize,
}

impl LocalBuffer {
    /// Buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for LocalBuffer {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Device-local image with its own memory
pub struct LocalImage {
    ctx: Arc<DeviceContext>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
}

impl LocalImage {
    /// Image handle
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    /// Create a 2D view of the whole image
    pub fn create_view(&self, aspect: vk::ImageAspectFlags) -> RenderResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        Ok(unsafe { self.ctx.device().create_image_view(&info, None)? })
    }
}

impl Drop for LocalImage {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties { memory_type_count: types.len() as u32, ..Default::default() };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType { property_flags: *flags, heap_index: 0 };
        }
        props
    }

    #[test]
    fn picks_lowest_compatible_type() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            host,
            host | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        assert_eq!(find_memory_type(&props, 0b111, host).ok(), Some(1));
        assert_eq!(find_memory_type(&props, 0b100, host).ok(), Some(2));
        assert_eq!(find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).ok(), Some(0));
    }

    #[test]
    fn fails_when_mask_excludes_every_match() {
        let props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::HOST_VISIBLE]);

        assert!(matches!(
            find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Err(RenderError::OutOfMemoryType { type_bits: 0b01, .. })
        ));
    }
}
