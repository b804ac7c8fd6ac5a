//! Frame slots
//!
//! A command stream owns one [`FrameState`] per buffering slot. Each slot moves
//! through `Idle -> Recording -> Submitted -> Complete -> Recording ...`, which
//! [`SlotTracker`] enforces. State shared with [`RenderSync`](crate::render::RenderSync)
//! and [`FrameOutput`](crate::render::FrameOutput) handles (fence, readback buffer,
//! submission serial, live reader count) lives in [`FrameShared`].

use crate::render::atlas::AtlasLayout;
use crate::render::batch::FrameDataLayout;
use crate::render::config::Outputs;
use crate::render::error::{RenderError, RenderResult};
use crate::render::pipeline::{
    PipelineState, LIGHTS_BINDING, MATERIAL_INDICES_BINDING, TRANSFORMS_BINDING, VIEWS_BINDING,
};
use crate::render::vulkan::{AtlasTarget, DescriptorSetWriter, Fence, HostBuffer, MemoryAllocator};
use crate::scene::Scene;
use ash::vk;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bytes per color texel (RGBA8)
pub const COLOR_BYTES_PER_PIXEL: usize = 4;
/// Bytes per depth texel (f32, depth aspect only)
pub const DEPTH_BYTES_PER_PIXEL: usize = 4;

/// Lifecycle of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Never used
    Idle,
    /// Command buffer being recorded
    Recording,
    /// Submitted to the GPU, completion unknown
    Submitted,
    /// GPU work finished
    Complete,
}

impl FrameStatus {
    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Recording => "Recording",
            Self::Submitted => "Submitted",
            Self::Complete => "Complete",
        }
    }
}

/// Round-robin slot selection and status bookkeeping
#[derive(Debug, Clone)]
pub struct SlotTracker {
    slots: Vec<FrameStatus>,
    next: usize,
    serial: u64,
}

impl SlotTracker {
    /// Track `slot_count` idle slots
    pub fn new(slot_count: usize) -> Self {
        Self { slots: vec![FrameStatus::Idle; slot_count.max(1)], next: 0, serial: 0 }
    }

    /// Number of slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next render will use
    pub fn next_slot(&self) -> usize {
        self.next
    }

    /// Current status of `slot`
    pub fn status(&self, slot: usize) -> FrameStatus {
        self.slots[slot]
    }

    /// Start recording into `slot`, returning the new submission serial
    pub fn begin_recording(&mut self, slot: usize) -> RenderResult<u64> {
        self.transition(slot, &[FrameStatus::Idle, FrameStatus::Complete], FrameStatus::Recording)?;
        self.serial += 1;
        Ok(self.serial)
    }

    /// Mark `slot` submitted and advance to the next slot
    pub fn submitted(&mut self, slot: usize) -> RenderResult<()> {
        self.transition(slot, &[FrameStatus::Recording], FrameStatus::Submitted)?;
        self.next = (slot + 1) % self.slots.len();
        Ok(())
    }

    /// Mark `slot` complete after its fence signalled
    pub fn completed(&mut self, slot: usize) -> RenderResult<()> {
        self.transition(slot, &[FrameStatus::Submitted], FrameStatus::Complete)
    }

    /// Drop a recording that was never submitted
    pub fn abort(&mut self, slot: usize) {
        if self.slots[slot] == FrameStatus::Recording {
            self.slots[slot] = FrameStatus::Idle;
        }
    }

    fn transition(&mut self, slot: usize, from: &[FrameStatus], to: FrameStatus) -> RenderResult<()> {
        let current = self.slots[slot];
        if !from.contains(&current) {
            return Err(RenderError::InvalidFrameTransition { from: current.name(), to: to.name() });
        }
        self.slots[slot] = to;
        Ok(())
    }
}

/// Placement of color and depth tiles in a slot's readback buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackLayout {
    atlas: AtlasLayout,
    color_offset: Option<usize>,
    depth_offset: Option<usize>,
    total: usize,
}

impl ReadbackLayout {
    /// Lay out the enabled outputs back to back: color tiles, then depth tiles
    pub fn new(atlas: AtlasLayout, outputs: Outputs) -> Self {
        let mut total = 0;
        let mut place = |enabled: bool, bytes: usize| {
            enabled.then(|| {
                let offset = total;
                total += bytes;
                offset
            })
        };

        let color_offset = place(outputs.contains(Outputs::COLOR), atlas.batch_bytes(COLOR_BYTES_PER_PIXEL));
        let depth_offset = place(outputs.contains(Outputs::DEPTH), atlas.batch_bytes(DEPTH_BYTES_PER_PIXEL));

        Self { atlas, color_offset, depth_offset, total }
    }

    /// Tile grid
    pub fn atlas(&self) -> &AtlasLayout {
        &self.atlas
    }

    /// Start of the color tiles, if color is read back
    pub fn color_offset(&self) -> Option<usize> {
        self.color_offset
    }

    /// Start of the depth tiles, if depth is read back
    pub fn depth_offset(&self) -> Option<usize> {
        self.depth_offset
    }

    /// Readback buffer size
    pub fn total_size(&self) -> usize {
        self.total
    }

    /// Copy regions for the first `tiles` tiles of each enabled output
    pub fn copy_regions(&self, tiles: u32) -> (Vec<vk::BufferImageCopy>, Vec<vk::BufferImageCopy>) {
        let regions = |offset: Option<usize>, aspect: vk::ImageAspectFlags, bpp: usize| -> Vec<vk::BufferImageCopy> {
            offset.map_or_else(Vec::new, |base| {
                (0..tiles)
                    .map(|k| self.atlas.readback_region(k, aspect, bpp, base as vk::DeviceSize))
                    .collect()
            })
        };

        (
            regions(self.color_offset, vk::ImageAspectFlags::COLOR, COLOR_BYTES_PER_PIXEL),
            regions(self.depth_offset, vk::ImageAspectFlags::DEPTH, DEPTH_BYTES_PER_PIXEL),
        )
    }
}

#[derive(Debug)]
pub(crate) struct SlotShared {
    pub serial: u64,
    pub readers: usize,
    pub tiles: u32,
}

/// Slot state reachable from sync and readback handles
pub(crate) struct FrameShared {
    slot: usize,
    fence: Fence,
    readback: HostBuffer,
    layout: ReadbackLayout,
    state: Mutex<SlotShared>,
}

impl FrameShared {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn readback(&self) -> &[u8] {
        self.readback.bytes()
    }

    pub fn readback_buffer(&self) -> vk::Buffer {
        self.readback.handle()
    }

    pub fn layout(&self) -> &ReadbackLayout {
        &self.layout
    }

    pub fn lock(&self) -> MutexGuard<'_, SlotShared> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invalidate sync handles of the previous submission
    ///
    /// Serial 0 never names a submission, so no handle can start reading
    /// until [`publish`](Self::publish) runs.
    fn release(&self) -> RenderResult<()> {
        let mut state = self.lock();
        if state.readers > 0 {
            return Err(RenderError::ReadbackOutstanding { slot: self.slot });
        }
        state.serial = 0;
        state.tiles = 0;
        Ok(())
    }

    /// Record the submission now owning the slot
    pub fn publish(&self, serial: u64, tiles: u32) {
        let mut state = self.lock();
        state.serial = serial;
        state.tiles = tiles;
    }
}

/// GPU resources of one buffering slot
pub(crate) struct FrameState {
    pub shared: Arc<FrameShared>,
    pub command_buffer: vk::CommandBuffer,
    pub data: HostBuffer,
    pub descriptor_set: vk::DescriptorSet,
    pub target: AtlasTarget,
    /// Scenes referenced by the last submission, kept alive until the slot is reused
    pub scenes: Vec<Arc<Scene>>,
}

impl FrameState {
    pub fn new(
        allocator: &MemoryAllocator,
        pipeline: &PipelineState,
        data_layout: &FrameDataLayout,
        readback_layout: ReadbackLayout,
        slot: usize,
        command_buffer: vk::CommandBuffer,
        descriptor_set: vk::DescriptorSet,
        formats: (vk::Format, vk::Format),
    ) -> RenderResult<Self> {
        let ctx = allocator.context();
        let data = allocator.allocate_host(data_layout.total_size(), vk::BufferUsageFlags::STORAGE_BUFFER, false)?;
        let readback = allocator.allocate_host(readback_layout.total_size(), vk::BufferUsageFlags::TRANSFER_DST, true)?;
        let target = AtlasTarget::new(allocator, pipeline.render_pass(), readback_layout.atlas().extent(), formats.0, formats.1)?;
        let fence = Fence::new(ctx.clone(), false)?;

        let region = |r: crate::render::batch::FrameRegion| (r.offset as vk::DeviceSize, r.size.max(1) as vk::DeviceSize);
        let mut writer = DescriptorSetWriter::new();
        for (binding, (offset, range)) in [
            (VIEWS_BINDING, region(data_layout.views)),
            (TRANSFORMS_BINDING, region(data_layout.transforms)),
            (MATERIAL_INDICES_BINDING, region(data_layout.materials)),
        ] {
            writer = writer.storage_buffer(descriptor_set, binding, data.handle(), offset, range);
        }
        if pipeline.descriptor().uses_lights() {
            let (offset, range) = region(data_layout.lights);
            writer = writer.storage_buffer(descriptor_set, LIGHTS_BINDING, data.handle(), offset, range);
        }
        writer.update(ctx);

        log::debug!(
            "Frame slot {} ready: {} bytes frame data, {} bytes readback",
            slot,
            data_layout.total_size(),
            readback_layout.total_size()
        );

        Ok(Self {
            shared: Arc::new(FrameShared {
                slot,
                fence,
                readback,
                layout: readback_layout,
                state: Mutex::new(SlotShared { serial: 0, readers: 0, tiles: 0 }),
            }),
            command_buffer,
            data,
            descriptor_set,
            target,
            scenes: Vec::new(),
        })
    }

    /// Take the slot for a new submission
    ///
    /// Fails if a readback of the previous submission is still alive. Waits for
    /// the previous submission when `in_flight` is set.
    pub fn prepare(&mut self, in_flight: bool) -> RenderResult<()> {
        self.shared.release()?;
        if in_flight {
            self.shared.fence.wait(u64::MAX)?;
        }
        self.shared.fence.reset()?;
        self.scenes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cycles_through_states() {
        let mut tracker = SlotTracker::new(1);
        assert_eq!(tracker.status(0), FrameStatus::Idle);

        let first = tracker.begin_recording(0).unwrap();
        tracker.submitted(0).unwrap();
        assert_eq!(tracker.status(0), FrameStatus::Submitted);

        tracker.completed(0).unwrap();
        let second = tracker.begin_recording(0).unwrap();
        assert!(second > first);
    }

    #[test]
    fn submitted_slot_cannot_be_recorded_before_completion() {
        let mut tracker = SlotTracker::new(1);
        tracker.begin_recording(0).unwrap();
        tracker.submitted(0).unwrap();

        assert!(matches!(
            tracker.begin_recording(0),
            Err(RenderError::InvalidFrameTransition { from: "Submitted", to: "Recording" })
        ));
        assert!(tracker.completed(0).is_ok());
        assert!(tracker.completed(0).is_err());
    }

    #[test]
    fn double_buffering_alternates_slots() {
        let mut tracker = SlotTracker::new(2);
        let mut used = Vec::new();
        for _ in 0..4 {
            let slot = tracker.next_slot();
            if tracker.status(slot) == FrameStatus::Submitted {
                tracker.completed(slot).unwrap();
            }
            tracker.begin_recording(slot).unwrap();
            tracker.submitted(slot).unwrap();
            used.push(slot);
        }
        assert_eq!(used, vec![0, 1, 0, 1]);
    }

    #[test]
    fn aborted_recording_returns_to_idle_without_advancing() {
        let mut tracker = SlotTracker::new(2);
        tracker.begin_recording(0).unwrap();
        tracker.abort(0);

        assert_eq!(tracker.status(0), FrameStatus::Idle);
        assert_eq!(tracker.next_slot(), 0);
    }

    #[test]
    fn readback_places_depth_after_color() {
        let atlas = AtlasLayout::new(4, 8, 8).unwrap();
        let both = ReadbackLayout::new(atlas, Outputs::COLOR | Outputs::DEPTH);
        assert_eq!(both.color_offset(), Some(0));
        assert_eq!(both.depth_offset(), Some(4 * 8 * 8 * 4));
        assert_eq!(both.total_size(), 2 * 4 * 8 * 8 * 4);

        let depth_only = ReadbackLayout::new(atlas, Outputs::DEPTH);
        assert_eq!(depth_only.color_offset(), None);
        assert_eq!(depth_only.depth_offset(), Some(0));
    }

    #[test]
    fn copy_regions_cover_only_drawn_tiles() {
        let layout = ReadbackLayout::new(AtlasLayout::new(4, 8, 8).unwrap(), Outputs::COLOR | Outputs::DEPTH);
        let (color, depth) = layout.copy_regions(3);

        assert_eq!(color.len(), 3);
        assert_eq!(depth.len(), 3);
        assert_eq!(depth[0].buffer_offset, layout.depth_offset().unwrap() as vk::DeviceSize);
        assert_eq!(depth[0].image_subresource.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(color[2].buffer_offset, 2 * 8 * 8 * 4);
    }
}
