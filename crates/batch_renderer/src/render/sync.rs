//! Render completion handles and readback access

use crate::render::atlas::AtlasLayout;
use crate::render::error::{RenderError, RenderResult};
use crate::render::frame::{FrameShared, COLOR_BYTES_PER_PIXEL, DEPTH_BYTES_PER_PIXEL};
use image::{GrayImage, ImageBuffer, Luma, RgbaImage};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Completion handle for one submitted batch
///
/// Returned by [`CommandStream::render`](crate::render::CommandStream::render).
/// The handle goes stale once its frame slot is reused by a later render, after
/// which [`wait`](Self::wait) fails with [`RenderError::StaleSync`].
pub struct RenderSync {
    shared: Arc<FrameShared>,
    serial: u64,
}

impl RenderSync {
    pub(crate) fn new(shared: Arc<FrameShared>, serial: u64) -> Self {
        Self { shared, serial }
    }

    /// Frame slot the batch was recorded into
    pub fn slot(&self) -> usize {
        self.shared.slot()
    }

    /// Submission serial, increasing across renders of one stream
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the GPU has finished, without blocking
    pub fn poll(&self) -> RenderResult<bool> {
        self.check_current()?;
        self.shared.fence().status()
    }

    /// Block until the GPU has finished and borrow the readback
    ///
    /// The returned output pins the slot: rendering into it again fails with
    /// [`RenderError::ReadbackOutstanding`] until the output is dropped.
    pub fn wait(self) -> RenderResult<FrameOutput> {
        let tiles = {
            let mut state = self.shared.lock();
            if state.serial != self.serial {
                return Err(RenderError::StaleSync { slot: self.shared.slot() });
            }
            state.readers += 1;
            state.tiles
        };

        // Constructed before waiting so the reader count is released on error
        let output = FrameOutput { shared: self.shared, tiles };
        output.shared.fence().wait(u64::MAX)?;
        Ok(output)
    }

    fn check_current(&self) -> RenderResult<()> {
        if self.shared.lock().serial != self.serial {
            return Err(RenderError::StaleSync { slot: self.shared.slot() });
        }
        Ok(())
    }
}

impl fmt::Debug for RenderSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderSync").field("slot", &self.slot()).field("serial", &self.serial).finish()
    }
}

/// Host-visible results of a completed batch
///
/// Tiles are packed in tile order: tile `k` occupies
/// `k * tile_width * tile_height` texels from the start of each output. Only the
/// first [`tile_count`](Self::tile_count) tiles were drawn.
pub struct FrameOutput {
    shared: Arc<FrameShared>,
    tiles: u32,
}

impl FrameOutput {
    /// Tiles drawn by the batch (active cameras)
    pub fn tile_count(&self) -> u32 {
        self.tiles
    }

    /// Tile width and height in pixels
    pub fn tile_extent(&self) -> (u32, u32) {
        let extent = self.atlas().tile_extent();
        (extent.width, extent.height)
    }

    fn atlas(&self) -> &AtlasLayout {
        self.shared.layout().atlas()
    }

    /// RGBA8 texels of every drawn tile, `None` if color is not read back
    pub fn color(&self) -> Option<&[u8]> {
        let offset = self.shared.layout().color_offset()?;
        let len = self.tiles as usize * self.atlas().tile_bytes(COLOR_BYTES_PER_PIXEL);
        self.shared.readback().get(offset..offset + len)
    }

    /// Depth values of every drawn tile, `None` if depth is not read back
    pub fn depth(&self) -> Option<&[f32]> {
        let offset = self.shared.layout().depth_offset()?;
        let len = self.tiles as usize * self.atlas().tile_bytes(DEPTH_BYTES_PER_PIXEL);
        let bytes = self.shared.readback().get(offset..offset + len)?;
        bytemuck::try_cast_slice(bytes).ok()
    }

    /// RGBA8 texels of tile `k`
    pub fn color_tile(&self, k: u32) -> Option<&[u8]> {
        let size = self.atlas().tile_bytes(COLOR_BYTES_PER_PIXEL);
        self.color().and_then(|c| c.get(k as usize * size..(k as usize + 1) * size))
    }

    /// Depth values of tile `k`
    pub fn depth_tile(&self, k: u32) -> Option<&[f32]> {
        let size = self.atlas().tile_pixels();
        self.depth().and_then(|d| d.get(k as usize * size..(k as usize + 1) * size))
    }

    /// Write tile `k`'s color as an RGBA PNG
    pub fn save_color_png(&self, k: u32, path: impl AsRef<Path>) -> RenderResult<()> {
        let tile = self.color_tile(k).ok_or_else(|| self.missing_tile("color", k))?;
        let (width, height) = self.tile_extent();
        let img: RgbaImage = ImageBuffer::from_raw(width, height, tile.to_vec())
            .ok_or_else(|| RenderError::ImageExport("tile size does not match its extent".into()))?;
        img.save(path.as_ref()).map_err(|e| RenderError::ImageExport(e.to_string()))
    }

    /// Write tile `k`'s depth as a grayscale PNG, stretched to the tile's depth range
    pub fn save_depth_png(&self, k: u32, path: impl AsRef<Path>) -> RenderResult<()> {
        let tile = self.depth_tile(k).ok_or_else(|| self.missing_tile("depth", k))?;
        let (width, height) = self.tile_extent();
        depth_to_gray(tile, width, height)
            .save(path.as_ref())
            .map_err(|e| RenderError::ImageExport(e.to_string()))
    }

    fn missing_tile(&self, output: &str, k: u32) -> RenderError {
        RenderError::ImageExport(format!("no {output} tile {k} (batch drew {} tiles)", self.tiles))
    }
}

impl Drop for FrameOutput {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.readers = state.readers.saturating_sub(1);
    }
}

impl fmt::Debug for FrameOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameOutput")
            .field("slot", &self.shared.slot())
            .field("tiles", &self.tiles)
            .finish()
    }
}

/// Map depth linearly onto 0..=255, nearest black
fn depth_to_gray(depth: &[f32], width: u32, height: u32) -> GrayImage {
    let (min, max) = depth
        .iter()
        .filter(|d| d.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &d| (lo.min(d), hi.max(d)));
    let span = if max > min { max - min } else { 1.0 };

    GrayImage::from_fn(width, height, |x, y| {
        let d = depth[(y * width + x) as usize];
        let t = if d.is_finite() { ((d - min) / span).clamp(0.0, 1.0) } else { 1.0 };
        Luma([(t * 255.0).round() as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_stretched_to_full_range() {
        let gray = depth_to_gray(&[0.25, 0.5, 0.75, 1.0], 2, 2);
        assert_eq!(gray.get_pixel(0, 0).0, [0]);
        assert_eq!(gray.get_pixel(1, 1).0, [255]);
        assert_eq!(gray.get_pixel(1, 0).0, [85]);
    }

    #[test]
    fn flat_depth_maps_to_black() {
        let gray = depth_to_gray(&[1.0; 4], 2, 2);
        assert!(gray.pixels().all(|p| p.0 == [0]));
    }
}
