//! Debug capture boundary
//!
//! Frame debuggers need a bracket around the work they record. Implement
//! [`FrameCapture`] over the tool's API and pass it to
//! [`CommandStream::render_captured`](crate::render::CommandStream::render_captured).

use crate::render::vulkan::DeviceContext;

/// Hook bracketing one render and its wait
pub trait FrameCapture {
    /// Called before the batch is recorded
    fn start_frame(&mut self, device: &DeviceContext);

    /// Called after the batch completed or failed
    fn end_frame(&mut self, device: &DeviceContext);
}

/// Capture hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapture;

impl FrameCapture for NoCapture {
    fn start_frame(&mut self, _device: &DeviceContext) {}

    fn end_frame(&mut self, _device: &DeviceContext) {}
}

/// Counts bracketed frames, logging each one
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCapture {
    frames: u64,
    open: bool,
}

impl LoggingCapture {
    /// Frames fully bracketed so far
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameCapture for LoggingCapture {
    fn start_frame(&mut self, device: &DeviceContext) {
        self.open = true;
        log::debug!("Capture start on '{}' (frame {})", device.name(), self.frames);
    }

    fn end_frame(&mut self, device: &DeviceContext) {
        if self.open {
            self.open = false;
            self.frames += 1;
        }
        log::debug!("Capture end on '{}'", device.name());
    }
}
