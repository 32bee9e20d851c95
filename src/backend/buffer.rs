// GPU buffers and images with exclusively owned memory
//
// Every buffer/image owns exactly one device memory block, allocated at the
// size the driver reports and bound at offset zero. Destruction order is
// handle first, memory second.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use thiserror::Error;

use super::VulkanDevice;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("no suitable memory type for filter {type_filter:#x} with flags {flags:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        flags: vk::MemoryPropertyFlags,
    },
}

/// First memory type whose bit is allowed by `type_filter` and whose
/// property flags are a superset of `flags`. The scan order makes the
/// selection deterministic for a given device.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    flags: vk::MemoryPropertyFlags,
) -> Result<u32, AllocError> {
    for i in 0..memory_properties.memory_type_count {
        let allowed = (type_filter & (1 << i)) != 0;
        let satisfied = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(flags);

        if allowed && satisfied {
            return Ok(i);
        }
    }

    Err(AllocError::NoSuitableMemoryType { type_filter, flags })
}

/// Image aspect implied by the format: depth formats get the depth (and
/// stencil) aspect, everything else is color.
pub fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// A buffer handle plus the memory block it exclusively owns.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_block(&device, &requirements, memory_flags) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.device.destroy_buffer(buffer, None);
                device.device.free_memory(memory, None);
            }
            return Err(e).context("Failed to bind buffer memory");
        }

        Ok(Self {
            buffer,
            memory,
            size,
            device,
        })
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        // Handle before memory, never the reverse
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// An image handle, its exclusively owned memory block, and a view covering
/// the whole image with the format-derived aspect.
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe {
            device
                .device
                .create_image(&image_info, None)
                .context("Failed to create image")?
        };

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let memory = match allocate_block(
            &device,
            &requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.device.destroy_image(image, None);
                device.device.free_memory(memory, None);
            }
            return Err(e).context("Failed to bind image memory");
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask_for_format(format),
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.device.destroy_image(image, None);
                    device.device.free_memory(memory, None);
                }
                return Err(e).context("Failed to create image view");
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            format,
            extent: vk::Extent2D { width, height },
            device,
        })
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        // View and handle before memory
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Allocate exactly the memory the driver asks for, on the first matching
/// memory type. A missing type is a configuration error, not a retry case.
fn allocate_block(
    device: &VulkanDevice,
    requirements: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        flags,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe {
        device
            .device
            .allocate_memory(&alloc_info, None)
            .context("Failed to allocate device memory")?
    };

    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_memory(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = flags;
        }
        props
    }

    #[test]
    fn picks_first_matching_type() {
        let props = mock_memory(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);

        let index = find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(index, Ok(1));

        // Same inputs, same answer
        let again = find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(again, Ok(1));
    }

    #[test]
    fn respects_type_filter_bits() {
        let props = mock_memory(&[
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        // Only the third type is allowed by the filter
        let index = find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(index, Ok(2));
    }

    #[test]
    fn requested_flags_match_as_subset() {
        let props = mock_memory(&[vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED]);

        let index = find_memory_type(
            &props,
            0b1,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(index, Ok(0));
    }

    #[test]
    fn device_local_only_rejects_host_visible_request() {
        let props = mock_memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(
            result,
            Err(AllocError::NoSuitableMemoryType { .. })
        ));
    }

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_mask_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}
