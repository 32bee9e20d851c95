// Staging uploads - host data into device-local buffers and images
//
// Setup-time path only: a transient host-visible staging buffer, a one-shot
// command buffer on the graphics queue, and a blocking queue-idle wait. No
// overlap with rendering, no fence bookkeeping.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{aspect_mask_for_format, GpuBuffer, GpuImage};
use super::VulkanDevice;

/// Copy `data` into a device-local buffer through a staging buffer. Blocks
/// until the GPU has finished the transfer.
pub fn upload_to_buffer(device: &Arc<VulkanDevice>, dst: &GpuBuffer, data: &[u8]) -> Result<()> {
    anyhow::ensure!(
        data.len() as vk::DeviceSize <= dst.size,
        "Upload of {} bytes into a {}-byte buffer",
        data.len(),
        dst.size
    );

    let staging = stage_bytes(device, data)?;

    one_shot_commands(device, |cmd| {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: data.len() as vk::DeviceSize,
        };
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, dst.buffer, &[region]);
        }
    })?;

    log::debug!("Uploaded {} bytes to buffer", data.len());
    Ok(())
}

/// Copy pixel `data` into a device-local image through a staging buffer,
/// transitioning the image from undefined to `final_layout`. Blocks until
/// the GPU has finished the transfer.
pub fn upload_to_image(
    device: &Arc<VulkanDevice>,
    dst: &GpuImage,
    data: &[u8],
    final_layout: vk::ImageLayout,
) -> Result<()> {
    let staging = stage_bytes(device, data)?;

    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: aspect_mask_for_format(dst.format),
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
    let (dst_stage, dst_access) = consumer_masks(final_layout);

    one_shot_commands(device, |cmd| {
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(subresource_range)
            .build();

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: subresource_range.aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: dst.extent.width,
                height: dst.extent.height,
                depth: 1,
            })
            .build();

        let to_final = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(dst_access)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(final_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst.image)
            .subresource_range(subresource_range)
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_buffer_to_image(
                cmd,
                staging.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_final],
            );
        }
    })?;

    log::debug!(
        "Uploaded {} bytes to {}x{} image",
        data.len(),
        dst.extent.width,
        dst.extent.height
    );
    Ok(())
}

/// Stage and access masks of the first consumer implied by the destination
/// layout.
fn consumer_masks(final_layout: vk::ImageLayout) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    match final_layout {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_READ,
        ),
    }
}

/// Host-visible staging buffer holding a copy of `data`.
fn stage_bytes(device: &Arc<VulkanDevice>, data: &[u8]) -> Result<GpuBuffer> {
    let staging = GpuBuffer::new(
        device.clone(),
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )
    .context("Failed to create staging buffer")?;

    unsafe {
        let mapped = device
            .device
            .map_memory(
                staging.memory,
                0,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )
            .context("Failed to map staging buffer")? as *mut u8;

        std::ptr::copy_nonoverlapping(data.as_ptr(), mapped, data.len());
        device.device.unmap_memory(staging.memory);
    }

    Ok(staging)
}

/// Record `record` into a one-time-submit command buffer on a transient
/// pool, submit it, and block until the graphics queue is idle.
fn one_shot_commands<F: FnOnce(vk::CommandBuffer)>(
    device: &Arc<VulkanDevice>,
    record: F,
) -> Result<()> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(device.graphics_queue_family)
        .flags(vk::CommandPoolCreateFlags::TRANSIENT);

    let pool = unsafe {
        device
            .device
            .create_command_pool(&pool_info, None)
            .context("Failed to create transient command pool")?
    };

    let result = (|| -> Result<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.device.allocate_command_buffers(&alloc_info)? }[0];

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(cmd, &begin_info)? };

        record(cmd);

        unsafe {
            device.device.end_command_buffer(cmd)?;

            let cmds = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&cmds).build();
            device
                .device
                .queue_submit(device.graphics_queue, &[submit_info], vk::Fence::null())?;
            device.device.queue_wait_idle(device.graphics_queue)?;
        }

        Ok(())
    })();

    unsafe { device.device.destroy_command_pool(pool, None) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampled_layout_hands_off_to_fragment_shader() {
        let (stage, access) = consumer_masks(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn unknown_layout_falls_back_to_conservative_masks() {
        let (stage, access) = consumer_masks(vk::ImageLayout::GENERAL);
        assert_eq!(stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(access, vk::AccessFlags::MEMORY_READ);
    }
}
