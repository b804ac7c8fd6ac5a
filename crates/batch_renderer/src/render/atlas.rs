//! Framebuffer atlas layout
//!
//! One physical framebuffer holds every view of a batch as a square grid of
//! tiles. Tile `k` sits at column `k % tiles_per_row`, row `k / tiles_per_row`,
//! and is read back to `k * tile_bytes` in the linear readback buffer.

use crate::render::error::{RenderError, RenderResult};
use ash::vk;

/// Tile grid for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    batch_size: u32,
    tile_width: u32,
    tile_height: u32,
    tiles_per_row: u32,
}

impl AtlasLayout {
    /// Lay out `batch_size` tiles of `tile_width`x`tile_height`
    ///
    /// Fails with [`RenderError::InvalidConfig`] when the atlas side does not
    /// fit a signed 32-bit pixel offset.
    pub fn new(batch_size: u32, tile_width: u32, tile_height: u32) -> RenderResult<Self> {
        let tiles_per_row = ceil_sqrt(batch_size);
        let side = |tile: u32| tiles_per_row.checked_mul(tile).filter(|&px| i32::try_from(px).is_ok());
        if side(tile_width).is_none() || side(tile_height).is_none() {
            return Err(RenderError::InvalidConfig(format!(
                "atlas of {tiles_per_row}x{tiles_per_row} tiles of {tile_width}x{tile_height} overflows"
            )));
        }

        Ok(Self { batch_size, tile_width, tile_height, tiles_per_row })
    }

    /// Maximum tiles per batch
    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Tiles along each side of the grid
    pub fn tiles_per_row(&self) -> u32 {
        self.tiles_per_row
    }

    /// Size of one tile
    pub fn tile_extent(&self) -> vk::Extent2D {
        vk::Extent2D { width: self.tile_width, height: self.tile_height }
    }

    /// Size of the whole atlas framebuffer
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.tiles_per_row * self.tile_width,
            height: self.tiles_per_row * self.tile_height,
        }
    }

    /// Pixel offset of tile `k`
    pub fn tile_offset(&self, k: u32) -> vk::Offset2D {
        vk::Offset2D {
            x: ((k % self.tiles_per_row) * self.tile_width) as i32,
            y: ((k / self.tiles_per_row) * self.tile_height) as i32,
        }
    }

    /// Rectangle covered by tile `k`
    pub fn tile_rect(&self, k: u32) -> vk::Rect2D {
        vk::Rect2D { offset: self.tile_offset(k), extent: self.tile_extent() }
    }

    /// Viewport rendering into tile `k`
    pub fn tile_viewport(&self, k: u32) -> vk::Viewport {
        let offset = self.tile_offset(k);
        vk::Viewport {
            x: offset.x as f32,
            y: offset.y as f32,
            width: self.tile_width as f32,
            height: self.tile_height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// Pixels per tile
    pub fn tile_pixels(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize
    }

    /// Bytes of one tile in the readback buffer
    pub fn tile_bytes(&self, bytes_per_pixel: usize) -> usize {
        self.tile_pixels() * bytes_per_pixel
    }

    /// Bytes needed to read back a full batch
    pub fn batch_bytes(&self, bytes_per_pixel: usize) -> usize {
        self.tile_bytes(bytes_per_pixel) * self.batch_size as usize
    }

    /// Copy region from tile `k` of `aspect` into a linear buffer at `base_offset`
    pub fn readback_region(
        &self,
        k: u32,
        aspect: vk::ImageAspectFlags,
        bytes_per_pixel: usize,
        base_offset: vk::DeviceSize,
    ) -> vk::BufferImageCopy {
        let offset = self.tile_offset(k);
        vk::BufferImageCopy {
            buffer_offset: base_offset + (k as usize * self.tile_bytes(bytes_per_pixel)) as vk::DeviceSize,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: offset.x, y: offset.y, z: 0 },
            image_extent: vk::Extent3D { width: self.tile_width, height: self.tile_height, depth: 1 },
        }
    }
}

fn ceil_sqrt(n: u32) -> u32 {
    let n = u64::from(n);
    let mut root = (n as f64).sqrt() as u64;
    while root * root < n {
        root += 1;
    }
    root as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_side_is_ceiling_square_root() {
        assert_eq!(AtlasLayout::new(1, 8, 8).unwrap().tiles_per_row(), 1);
        assert_eq!(AtlasLayout::new(4, 8, 8).unwrap().tiles_per_row(), 2);
        assert_eq!(AtlasLayout::new(5, 8, 8).unwrap().tiles_per_row(), 3);
        assert_eq!(AtlasLayout::new(10, 8, 8).unwrap().tiles_per_row(), 4);
    }

    #[test]
    fn extent_covers_the_square_grid() {
        let atlas = AtlasLayout::new(5, 64, 32).unwrap();
        assert_eq!(atlas.extent(), vk::Extent2D { width: 192, height: 96 });
    }

    #[test]
    fn tiles_fill_rows_left_to_right() {
        let atlas = AtlasLayout::new(5, 64, 32).unwrap();

        assert_eq!(atlas.tile_offset(0), vk::Offset2D { x: 0, y: 0 });
        assert_eq!(atlas.tile_offset(2), vk::Offset2D { x: 128, y: 0 });
        assert_eq!(atlas.tile_offset(3), vk::Offset2D { x: 0, y: 32 });
        assert_eq!(atlas.tile_offset(4), vk::Offset2D { x: 64, y: 32 });
    }

    #[test]
    fn readback_regions_are_packed_by_tile_index() {
        let atlas = AtlasLayout::new(4, 16, 8).unwrap();
        let tile_bytes = (16 * 8 * 4) as vk::DeviceSize;

        let region = atlas.readback_region(3, vk::ImageAspectFlags::COLOR, 4, 0);
        assert_eq!(region.buffer_offset, 3 * tile_bytes);
        assert_eq!(region.image_offset, vk::Offset3D { x: 16, y: 8, z: 0 });
        assert_eq!(region.image_extent.width, 16);

        let depth = atlas.readback_region(1, vk::ImageAspectFlags::DEPTH, 4, 1000);
        assert_eq!(depth.buffer_offset, 1000 + tile_bytes);
    }

    #[test]
    fn oversized_atlas_is_rejected() {
        assert!(matches!(AtlasLayout::new(16, 1 << 31, 8), Err(RenderError::InvalidConfig(_))));
        assert!(matches!(AtlasLayout::new(4, 8, 1 << 30), Err(RenderError::InvalidConfig(_))));
        assert_eq!(ceil_sqrt(u32::MAX), 65_536);
        assert!(AtlasLayout::new(u32::MAX, 1, 1).is_ok());
    }
}
