// Render target pass - fixed attachment set and framebuffers
//
// One subpass over a color attachment, an optional depth attachment, and an
// optional single-sample resolve target when multisampling. Framebuffers are
// rebuilt in lockstep with the swapchain so their extent always matches.

use anyhow::{Context, Result};
use ash::vk;

use super::VulkanDevice;

/// Depth attachment format used throughout the runtime.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Attachment descriptions and references for one pass configuration.
/// Built without a device so the layout policy stays testable.
pub struct AttachmentPlan {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color: vk::AttachmentReference,
    pub depth: Option<vk::AttachmentReference>,
    pub resolve: Option<vk::AttachmentReference>,
    pub dependency: Option<vk::SubpassDependency>,
}

pub fn plan_attachments(
    format: vk::Format,
    samples: vk::SampleCountFlags,
    use_depth: bool,
    final_layout: vk::ImageLayout,
) -> AttachmentPlan {
    let multisampled = samples != vk::SampleCountFlags::TYPE_1;
    let mut attachments = Vec::new();

    // Color. When multisampled the resolve target carries the final layout.
    attachments.push(
        vk::AttachmentDescription::builder()
            .format(format)
            .samples(samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(if multisampled {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                final_layout
            })
            .build(),
    );
    let color = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };

    let depth = use_depth.then(|| {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(DEPTH_FORMAT)
                .samples(samples)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
        vk::AttachmentReference {
            attachment: attachments.len() as u32 - 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    });

    let resolve = multisampled.then(|| {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::DONT_CARE)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(final_layout)
                .build(),
        );
        vk::AttachmentReference {
            attachment: attachments.len() as u32 - 1,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    });

    // Downstream sampling needs an explicit hand-off from color writes to
    // fragment reads. Presentation relies on the implicit external
    // dependency instead.
    let dependency = (final_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL).then(|| {
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
            .dst_access_mask(vk::AccessFlags::SHADER_READ)
            .build()
    });

    AttachmentPlan {
        attachments,
        color,
        depth,
        resolve,
        dependency,
    }
}

pub fn create_render_pass(device: &VulkanDevice, plan: &AttachmentPlan) -> Result<vk::RenderPass> {
    let color_refs = [plan.color];
    let resolve_refs = plan.resolve.map(|r| [r]);

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(refs) = resolve_refs.as_ref() {
        subpass = subpass.resolve_attachments(refs);
    }
    if let Some(depth_ref) = plan.depth.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }
    let subpasses = [subpass.build()];

    let mut create_info = vk::RenderPassCreateInfo::builder()
        .attachments(&plan.attachments)
        .subpasses(&subpasses);
    if let Some(dependency) = plan.dependency.as_ref() {
        create_info = create_info.dependencies(std::slice::from_ref(dependency));
    }

    unsafe {
        device
            .device
            .create_render_pass(&create_info, None)
            .context("Failed to create render pass")
    }
}

/// One framebuffer per swapchain image, all at the swapchain extent.
/// Attachment order mirrors [`plan_attachments`]: when multisampling, the
/// swapchain view is the resolve target; otherwise it is the color target.
pub fn create_framebuffers(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    swapchain_views: &[vk::ImageView],
    depth_view: Option<vk::ImageView>,
    msaa_color_view: Option<vk::ImageView>,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    swapchain_views
        .iter()
        .map(|&swapchain_view| {
            let mut attachments = Vec::new();
            match msaa_color_view {
                Some(msaa_view) => {
                    attachments.push(msaa_view);
                    attachments.extend(depth_view);
                    attachments.push(swapchain_view);
                }
                None => {
                    attachments.push(swapchain_view);
                    attachments.extend(depth_view);
                }
            }

            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe {
                device
                    .device
                    .create_framebuffer(&framebuffer_info, None)
                    .context("Failed to create framebuffer")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_present_plan() {
        let plan = plan_attachments(
            vk::Format::B8G8R8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            true,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        assert_eq!(plan.attachments.len(), 2);
        assert_eq!(
            plan.attachments[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(plan.attachments[1].format, DEPTH_FORMAT);
        assert_eq!(plan.depth.map(|d| d.attachment), Some(1));
        assert!(plan.resolve.is_none());
        assert!(plan.dependency.is_none());
    }

    #[test]
    fn multisampled_plan_adds_resolve_target() {
        let plan = plan_attachments(
            vk::Format::B8G8R8A8_UNORM,
            vk::SampleCountFlags::TYPE_4,
            true,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        assert_eq!(plan.attachments.len(), 3);
        // Multisampled color resolves into the final attachment
        assert_eq!(
            plan.attachments[0].final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            plan.attachments[2].samples,
            vk::SampleCountFlags::TYPE_1
        );
        assert_eq!(
            plan.attachments[2].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(plan.resolve.map(|r| r.attachment), Some(2));
    }

    #[test]
    fn sampled_final_layout_declares_dependency() {
        let plan = plan_attachments(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            false,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        assert_eq!(plan.attachments.len(), 1);
        assert!(plan.depth.is_none());
        let dependency = plan.dependency.expect("sampled layout needs a dependency");
        assert_eq!(dependency.dst_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(
            dependency.dst_stage_mask,
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }
}
