// Swapchain - window presentation
//
// Owns the chain of presentable images tied to a surface. Never mutated in
// place: resize and staleness are handled by building a replacement (with
// the old chain passed as a reuse hint) and dropping the old one.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Images requested from the platform.
const MIN_REQUESTED_IMAGES: u32 = 3;
/// Stand-in upper bound when the platform reports 0, meaning "unbounded".
const UNBOUNDED_IMAGE_CAP: u32 = 8;

/// What an acquire or present call said about the chain's validity,
/// collapsed to the three cases the frame loop cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceHealth {
    Ok,
    /// Still presentable, but the chain should be rebuilt soon.
    Suboptimal,
    /// No longer presentable; the chain must be rebuilt now.
    OutOfDate,
}

impl SurfaceHealth {
    pub fn needs_rebuild(self) -> bool {
        self != SurfaceHealth::Ok
    }
}

/// Outcome of an acquire: either an image index (plus chain health), or
/// nothing at all because the chain is stale.
#[derive(Debug, Clone, Copy)]
pub enum AcquireOutcome {
    Image(u32, SurfaceHealth),
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
        usage: vk::ImageUsageFlags,
        old: Option<&Swapchain>,
    ) -> Result<Self> {
        let supports_present = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        if !supports_present {
            anyhow::bail!("Graphics queue cannot present to this surface");
        }

        let formats = unsafe {
            surface_loader
                .get_physical_device_surface_formats(device.physical_device, surface)?
        };
        // First reported format is a sensible default on every platform
        let surface_format = *formats.first().context("No surface formats available")?;

        let caps = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, surface)?
        };
        let extent = surface_extent(&caps);
        let image_count = clamp_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            image_count,
            surface_format.format,
        );

        let loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old.map(|s| s.swapchain).unwrap_or(vk::SwapchainKHR::null()));

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = unsafe { loader.get_swapchain_images(swapchain)? };
        log::debug!("Platform delivered {} swapchain images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .context("Failed to create swapchain image view")
                }
            })
            .collect();

        Ok(Self {
            swapchain,
            loader,
            images,
            image_views: image_views?,
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Acquire the next presentable image, signaling `semaphore` once it is
    /// actually available.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, false)) => Ok(AcquireOutcome::Image(index, SurfaceHealth::Ok)),
            Ok((index, true)) => Ok(AcquireOutcome::Image(index, SurfaceHealth::Suboptimal)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("vkAcquireNextImageKHR failed"),
        }
    }

    /// Present `image_index`, gated on `wait_semaphore`.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<SurfaceHealth> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(SurfaceHealth::Ok),
            Ok(true) => Ok(SurfaceHealth::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceHealth::OutOfDate),
            Err(e) => Err(e).context("vkQueuePresentKHR failed"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views first, then the chain; callers guarantee the images are idle
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Current extent, with the `0xFFFFFFFF` "undefined" sentinel clamped to the
/// minimum supported extent.
pub fn surface_extent(caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    let mut extent = caps.current_extent;
    if extent.width == u32::MAX {
        extent.width = caps.min_image_extent.width;
    }
    if extent.height == u32::MAX {
        extent.height = caps.min_image_extent.height;
    }
    extent
}

/// At least [`MIN_REQUESTED_IMAGES`], within the platform's bounds. A
/// reported max of 0 means unbounded and is capped at
/// [`UNBOUNDED_IMAGE_CAP`].
pub fn clamp_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let max = if caps.max_image_count == 0 {
        UNBOUNDED_IMAGE_CAP
    } else {
        caps.max_image_count
    };
    MIN_REQUESTED_IMAGES.max(caps.min_image_count).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(
        current: (u32, u32),
        min_extent: (u32, u32),
        min_images: u32,
        max_images: u32,
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min_extent.0,
                height: min_extent.1,
            },
            min_image_count: min_images,
            max_image_count: max_images,
            ..Default::default()
        }
    }

    #[test]
    fn extent_passes_through_when_defined() {
        let caps = caps((800, 600), (1, 1), 1, 0);
        assert_eq!(
            surface_extent(&caps),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn extent_sentinel_clamps_to_minimum() {
        let caps = caps((u32::MAX, u32::MAX), (64, 48), 1, 0);
        assert_eq!(
            surface_extent(&caps),
            vk::Extent2D {
                width: 64,
                height: 48
            }
        );
    }

    #[test]
    fn image_count_reaches_three_on_unbounded_platforms() {
        let caps = caps((800, 600), (1, 1), 2, 0);
        assert_eq!(clamp_image_count(&caps), 3);
    }

    #[test]
    fn image_count_respects_platform_bounds() {
        // Max below the request wins
        let caps_low = caps((800, 600), (1, 1), 1, 2);
        assert_eq!(clamp_image_count(&caps_low), 2);

        // Min above the request wins
        let caps_high = caps((800, 600), (1, 1), 4, 6);
        assert_eq!(clamp_image_count(&caps_high), 4);
    }

    #[test]
    fn only_ok_health_skips_rebuild() {
        assert!(!SurfaceHealth::Ok.needs_rebuild());
        assert!(SurfaceHealth::Suboptimal.needs_rebuild());
        assert!(SurfaceHealth::OutOfDate.needs_rebuild());
    }
}
