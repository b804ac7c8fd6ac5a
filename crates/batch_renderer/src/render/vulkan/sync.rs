//! Fences for CPU-GPU synchronization

use crate::render::error::RenderResult;
use crate::render::vulkan::device::DeviceContext;
use ash::vk;
use std::sync::Arc;

/// Fence wrapper with RAII cleanup
pub struct Fence {
    ctx: Arc<DeviceContext>,
    fence: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled
    pub fn new(ctx: Arc<DeviceContext>, signaled: bool) -> RenderResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { ctx.device().create_fence(&create_info, None)? };

        Ok(Self { ctx, fence })
    }

    /// Block until signaled or `timeout` nanoseconds pass
    pub fn wait(&self, timeout: u64) -> RenderResult<()> {
        unsafe { self.ctx.device().wait_for_fences(&[self.fence], true, timeout)? };
        Ok(())
    }

    /// Whether the fence is signaled, without blocking
    pub fn status(&self) -> RenderResult<bool> {
        Ok(unsafe { self.ctx.device().get_fence_status(self.fence)? })
    }

    /// Return to the unsignaled state
    pub fn reset(&self) -> RenderResult<()> {
        unsafe { self.ctx.device().reset_fences(&[self.fence])? };
        Ok(())
    }

    /// Fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().destroy_fence(self.fence, None);
        }
    }
}
