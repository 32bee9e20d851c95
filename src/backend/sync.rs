// Frame slots - per-frame synchronization and command recording state
//
// One slot per frame in flight. The fence gates CPU reuse of the slot's
// command pool and acquire semaphore; acquire and release semaphores are
// deliberately distinct so the presentation engine is never waiting on a
// semaphore about to be re-signaled by the next acquire.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Bound on how far the CPU may run ahead of the GPU (double buffering).
pub const FRAMES_IN_FLIGHT: usize = 2;

pub struct FrameSlot {
    /// Signaled when the GPU retires the slot's last submission. Created
    /// signaled so the first wait on each slot passes immediately.
    pub fence: vk::Fence,
    /// Signaled by the presentation engine when the acquired image is ready.
    pub acquire_semaphore: vk::Semaphore,
    /// Signaled by the submit; presentation waits on it.
    pub release_semaphore: vk::Semaphore,
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // Buffers are re-recorded every frame via pool reset
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        unsafe {
            let fence = device.device.create_fence(&fence_info, None)?;
            let acquire_semaphore = device.device.create_semaphore(&semaphore_info, None)?;
            let release_semaphore = device.device.create_semaphore(&semaphore_info, None)?;

            let command_pool = device.device.create_command_pool(&pool_info, None)?;
            let alloc_info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let command_buffer = device.device.allocate_command_buffers(&alloc_info)?[0];

            Ok(Self {
                fence,
                acquire_semaphore,
                release_semaphore,
                command_pool,
                command_buffer,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_semaphore(self.acquire_semaphore, None);
            device.destroy_semaphore(self.release_semaphore, None);
            device.destroy_fence(self.fence, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_buffered() {
        assert_eq!(FRAMES_IN_FLIGHT, 2);
    }
}
