// Graphics and compute pipeline creation
//
// Fixed-function policy shared by every pipeline in the runtime: triangle
// lists, dynamic viewport/scissor, standard alpha blending, reversed-Z depth
// (GREATER_OR_EQUAL). Shader modules live only until the pipeline is built.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::shader::create_shader_module;
use super::VulkanDevice;

const SHADER_ENTRY: &CStr = c"main";

/// A compiled pipeline and its layout. Immutable once built; rebuilding
/// means dropping and reconstructing.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Vertex input bindings and attributes for a graphics pipeline.
pub struct VertexLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

pub struct GraphicsPipelineDesc<'a> {
    pub vertex_spirv: &'a [u8],
    pub fragment_spirv: &'a [u8],
    pub render_pass: vk::RenderPass,
    pub vertex_layout: &'a VertexLayout,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub push_constants: Option<vk::PushConstantRange>,
    pub subpass: u32,
    pub samples: vk::SampleCountFlags,
    pub cache: vk::PipelineCache,
}

pub fn create_graphics_pipeline(
    device: &Arc<VulkanDevice>,
    desc: &GraphicsPipelineDesc,
) -> Result<Pipeline> {
    let layout = create_layout(device, desc.set_layouts, desc.push_constants)?;

    let vert_module = match create_shader_module(device, desc.vertex_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(e).context("Vertex shader");
        }
    };
    let frag_module = match create_shader_module(device, desc.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe {
                device.device.destroy_shader_module(vert_module, None);
                device.device.destroy_pipeline_layout(layout, None);
            }
            return Err(e).context("Fragment shader");
        }
    };

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vert_module)
            .name(SHADER_ENTRY)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(frag_module)
            .name(SHADER_ENTRY)
            .build(),
    ];

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_layout.bindings)
        .vertex_attribute_descriptions(&desc.vertex_layout.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    // Viewport and scissor are dynamic; only the counts are baked in
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(desc.samples);

    // Reversed-Z projection: larger depth is closer
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL)
        .min_depth_bounds(0.0)
        .max_depth_bounds(1.0);

    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .build();

    let color_blend_attachments = [color_blend_attachment];
    let color_blending =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(desc.render_pass)
        .subpass(desc.subpass)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(desc.cache, &[pipeline_info], None)
    };

    // Module lifetime ends at pipeline creation, not pipeline destruction
    unsafe {
        device.device.destroy_shader_module(vert_module, None);
        device.device.destroy_shader_module(frag_module, None);
    }

    let pipelines = match pipelines {
        Ok(pipelines) => pipelines,
        Err((_, e)) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(e).context("Failed to create graphics pipeline");
        }
    };

    Ok(Pipeline {
        pipeline: pipelines[0],
        layout,
        device: device.clone(),
    })
}

pub fn create_compute_pipeline(
    device: &Arc<VulkanDevice>,
    spirv: &[u8],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: Option<vk::PushConstantRange>,
    cache: vk::PipelineCache,
) -> Result<Pipeline> {
    let layout = create_layout(device, set_layouts, push_constants)?;

    let module = match create_shader_module(device, spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(e).context("Compute shader");
        }
    };

    let stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(SHADER_ENTRY)
        .build();

    let pipeline_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_compute_pipelines(cache, &[pipeline_info], None)
    };

    unsafe { device.device.destroy_shader_module(module, None) };

    let pipelines = match pipelines {
        Ok(pipelines) => pipelines,
        Err((_, e)) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(e).context("Failed to create compute pipeline");
        }
    };

    Ok(Pipeline {
        pipeline: pipelines[0],
        layout,
        device: device.clone(),
    })
}

fn create_layout(
    device: &VulkanDevice,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: Option<vk::PushConstantRange>,
) -> Result<vk::PipelineLayout> {
    let push_constant_ranges: Vec<_> = push_constants.into_iter().collect();

    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(&push_constant_ranges);

    unsafe {
        device
            .device
            .create_pipeline_layout(&layout_info, None)
            .context("Failed to create pipeline layout")
    }
}

/// Load the pipeline cache blob from `path`. An absent or unreadable file is
/// a cold cache, not an error; a blob the driver rejects falls back to an
/// empty cache.
pub fn load_pipeline_cache(device: &VulkanDevice, path: &Path) -> Result<vk::PipelineCache> {
    let blob = std::fs::read(path).ok();
    match &blob {
        Some(blob) => log::info!("Loaded pipeline cache: {} bytes", blob.len()),
        None => log::info!("No pipeline cache at {:?}, starting cold", path),
    }

    let mut create_info = vk::PipelineCacheCreateInfo::builder();
    if let Some(blob) = blob.as_deref() {
        create_info = create_info.initial_data(blob);
    }

    let cache = unsafe { device.device.create_pipeline_cache(&create_info, None) };
    match cache {
        Ok(cache) => Ok(cache),
        Err(e) => {
            log::warn!("Driver rejected the pipeline cache blob ({}), starting cold", e);
            let empty = vk::PipelineCacheCreateInfo::builder();
            unsafe {
                device
                    .device
                    .create_pipeline_cache(&empty, None)
                    .context("Failed to create pipeline cache")
            }
        }
    }
}

/// Write the cache blob back to `path` verbatim and destroy the cache
/// object.
pub fn save_pipeline_cache(
    device: &VulkanDevice,
    cache: vk::PipelineCache,
    path: &Path,
) -> Result<()> {
    let data = unsafe { device.device.get_pipeline_cache_data(cache) };
    unsafe { device.device.destroy_pipeline_cache(cache, None) };

    let data = data.context("Failed to read pipeline cache data")?;
    std::fs::write(path, &data)
        .with_context(|| format!("Failed to write pipeline cache: {:?}", path))?;
    log::info!("Saved pipeline cache: {} bytes", data.len());
    Ok(())
}
