// Renderer - the owning aggregate behind the frame loop
//
// Owns every presentation-side resource: surface, swapchain, depth/MSAA
// targets, render pass, framebuffers, pipeline cache, and the frame slots.
// One CPU thread drives draw_frame; the slot fences bound it to at most
// FRAMES_IN_FLIGHT frames ahead of the GPU.

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::path::PathBuf;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::buffer::GpuImage;
use crate::backend::pipeline::{load_pipeline_cache, save_pipeline_cache};
use crate::backend::renderpass::{
    create_framebuffers, create_render_pass, plan_attachments, DEPTH_FORMAT,
};
use crate::backend::swapchain::{AcquireOutcome, SurfaceHealth, Swapchain};
use crate::backend::sync::{FrameSlot, FRAMES_IN_FLIGHT};
use crate::backend::{surface, VulkanDevice};
use crate::config::Config;

pub struct Renderer {
    device: Arc<VulkanDevice>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,

    swapchain: Option<Swapchain>,
    swapchain_usage: vk::ImageUsageFlags,

    samples: vk::SampleCountFlags,
    depth_target: Option<GpuImage>,
    msaa_target: Option<GpuImage>,

    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    pipeline_cache: vk::PipelineCache,
    pipeline_cache_path: Option<PathBuf>,

    frame_slots: Vec<FrameSlot>,
    /// Slot cycling counter; deliberately not reset across swapchain
    /// rebuilds, the slot fences already serialize reuse.
    frame_index: usize,
    needs_rebuild: bool,

    clear_color: [f32; 4],
}

impl Renderer {
    pub fn new(window: &Window, config: &Config) -> Result<Self> {
        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        let instance_extensions = surface::required_instance_extensions(display_handle)?;
        let device_extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(
            &config.window.title,
            enable_validation,
            &instance_extensions,
            &device_extensions,
        )?;

        let surface_loader =
            ash::extensions::khr::Surface::new(device.entry(), &device.instance);
        let surface = surface::create_surface(&device, display_handle, window_handle)?;

        let swapchain_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
        let swapchain = Swapchain::new(
            device.clone(),
            &surface_loader,
            surface,
            swapchain_usage,
            None,
        )?;

        let pipeline_cache_path = config.pipeline_cache_path();
        let pipeline_cache = match &pipeline_cache_path {
            Some(path) => load_pipeline_cache(&device, path)?,
            None => vk::PipelineCache::null(),
        };

        let frame_slots = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSlot::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let mut renderer = Self {
            device,
            surface_loader,
            surface,
            swapchain: Some(swapchain),
            swapchain_usage,
            samples: config.sample_count(),
            depth_target: None,
            msaa_target: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            pipeline_cache,
            pipeline_cache_path,
            frame_slots,
            frame_index: 0,
            needs_rebuild: false,
            clear_color: config.graphics.clear_color,
        };
        renderer.create_target_resources()?;

        Ok(renderer)
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    /// Flag the swapchain for rebuild at the next frame (window resize).
    pub fn request_rebuild(&mut self) {
        self.needs_rebuild = true;
    }

    /// Drive one frame: wait for this slot's fence, acquire, record via
    /// `record`, submit, present. Returns false when the frame was skipped
    /// (stale chain or minimized window).
    pub fn draw_frame<F>(&mut self, record: F) -> Result<bool>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer, vk::Extent2D),
    {
        if self.needs_rebuild && !self.rebuild_swapchain()? {
            // Zero-area surface; try again once the window has size
            return Ok(false);
        }

        match self.submit_frame(record)? {
            None => {
                // Out of date at acquire: no submission happened, the fence
                // was not reset, and the frame index stays put so the same
                // slot is retried after the rebuild.
                self.needs_rebuild = true;
                self.rebuild_swapchain()?;
                Ok(false)
            }
            Some(health) => {
                if health.needs_rebuild() {
                    self.needs_rebuild = true;
                    self.rebuild_swapchain()?;
                }
                self.frame_index = (self.frame_index + 1) % FRAMES_IN_FLIGHT;
                Ok(true)
            }
        }
    }

    /// One pass through the per-slot state machine. Returns the present
    /// call's health, or None when acquire reported the chain stale.
    fn submit_frame<F>(&mut self, record: F) -> Result<Option<SurfaceHealth>>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer, vk::Extent2D),
    {
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?;
        let slot = &self.frame_slots[self.frame_index];
        let device = &self.device.device;

        // Wait for the GPU to retire the frame that last used this slot;
        // only then are its command pool and acquire semaphore reusable.
        unsafe {
            device.wait_for_fences(&[slot.fence], true, u64::MAX)?;
        }

        let (image_index, acquire_health) =
            match swapchain.acquire_next_image(slot.acquire_semaphore)? {
                AcquireOutcome::Image(index, health) => (index, health),
                AcquireOutcome::OutOfDate => return Ok(None),
            };

        // Reset only on the success path; a skipped frame keeps the fence
        // signaled so the retry does not deadlock.
        unsafe {
            device.reset_fences(&[slot.fence])?;
        }
        if acquire_health.needs_rebuild() {
            self.needs_rebuild = true;
        }

        let extent = swapchain.extent;
        let cmd = slot.command_buffer;

        unsafe {
            // Pool reset invalidates the buffer wholesale, cheaper than a
            // per-buffer reset
            device.reset_command_pool(slot.command_pool, vk::CommandPoolResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device.begin_command_buffer(cmd, &begin_info)?;

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            // Depth clears to 0.0: reversed-Z, greater-or-equal test
            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 0.0,
                        stencil: 0,
                    },
                },
            ];
            let pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass)
                .framebuffer(self.framebuffers[image_index as usize])
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);
            device.cmd_begin_render_pass(cmd, &pass_begin, vk::SubpassContents::INLINE);

            record(device, cmd, extent);

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)?;
        }

        let wait_semaphores = [slot.acquire_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [cmd];
        let signal_semaphores = [slot.release_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device.queue_submit(self.device.graphics_queue, &[submit_info], slot.fence)?;
        }

        let health = swapchain.present(
            self.device.graphics_queue,
            image_index,
            slot.release_semaphore,
        )?;

        Ok(Some(health))
    }

    /// Replace the swapchain and everything sized by it. Returns false when
    /// the surface currently has zero area (minimized window): recreation is
    /// deferred, not attempted, until the extent is non-zero again.
    fn rebuild_swapchain(&mut self) -> Result<bool> {
        let caps = unsafe {
            self.surface_loader.get_physical_device_surface_capabilities(
                self.device.physical_device,
                self.surface,
            )?
        };
        if caps.current_extent.width == 0 || caps.current_extent.height == 0 {
            return Ok(false);
        }

        self.device.wait_idle()?;

        // Old framebuffers/pass go first, then the chain hand-off, then the
        // rebuilt pass resources at the new extent
        self.destroy_target_resources();

        let old = self.swapchain.take();
        let new = Swapchain::new(
            self.device.clone(),
            &self.surface_loader,
            self.surface,
            self.swapchain_usage,
            old.as_ref(),
        )?;
        drop(old);

        log::info!(
            "Swapchain rebuilt: {}x{}",
            new.extent.width,
            new.extent.height
        );
        self.swapchain = Some(new);
        self.create_target_resources()?;

        self.needs_rebuild = false;
        Ok(true)
    }

    /// Depth/MSAA targets, render pass and framebuffers for the current
    /// swapchain. Framebuffer extent always equals the swapchain extent.
    fn create_target_resources(&mut self) -> Result<()> {
        let swapchain = self
            .swapchain
            .as_ref()
            .context("Swapchain not initialized")?;
        let extent = swapchain.extent;

        let depth = GpuImage::new(
            self.device.clone(),
            extent.width,
            extent.height,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            self.samples,
        )?;

        let msaa = if self.samples != vk::SampleCountFlags::TYPE_1 {
            Some(GpuImage::new(
                self.device.clone(),
                extent.width,
                extent.height,
                swapchain.format,
                vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                self.samples,
            )?)
        } else {
            None
        };

        let plan = plan_attachments(
            swapchain.format,
            self.samples,
            true,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        let render_pass = create_render_pass(&self.device, &plan)?;

        let framebuffers = create_framebuffers(
            &self.device,
            render_pass,
            &swapchain.image_views,
            Some(depth.view),
            msaa.as_ref().map(|image| image.view),
            extent,
        )?;

        self.depth_target = Some(depth);
        self.msaa_target = msaa;
        self.render_pass = render_pass;
        self.framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_target_resources(&mut self) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                self.device.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
        }
        self.depth_target = None;
        self.msaa_target = None;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();

        for slot in &self.frame_slots {
            slot.destroy(&self.device.device);
        }

        self.destroy_target_resources();
        self.swapchain = None;

        if self.pipeline_cache != vk::PipelineCache::null() {
            match &self.pipeline_cache_path {
                Some(path) => {
                    if let Err(e) = save_pipeline_cache(&self.device, self.pipeline_cache, path) {
                        log::warn!("Failed to save pipeline cache: {:#}", e);
                    }
                }
                None => unsafe {
                    self.device
                        .device
                        .destroy_pipeline_cache(self.pipeline_cache, None);
                },
            }
        }

        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_index_wraps_after_all_slots() {
        let mut index = 0usize;
        let visited: Vec<usize> = (0..5)
            .map(|_| {
                let slot = index;
                index = (index + 1) % FRAMES_IN_FLIGHT;
                slot
            })
            .collect();
        // Slot k is only revisited after every other slot ran once
        assert_eq!(visited, vec![0, 1, 0, 1, 0]);
    }
}
