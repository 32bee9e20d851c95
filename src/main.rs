// =============================================================================
// LANTERN - Minimal Vulkan rendering runtime
// =============================================================================
//
// Frame flow:
// 1. Wait for the frame slot's fence (bounds CPU to 2 frames ahead)
// 2. Acquire a swapchain image (stale chain -> rebuild, skip frame)
// 3. Record the frame's command buffer
// 4. Submit gated on the acquire semaphore
// 5. Present gated on the release semaphore
//
// The demo scene is a rotating textured quad: vertex/index data and a
// generated checkerboard texture are staged into device-local memory at
// startup, then drawn with a push-constant MVP every frame.
//
// =============================================================================

mod backend;
mod config;
mod renderer;

use anyhow::{Context, Result};
use ash::vk;
use backend::buffer::{GpuBuffer, GpuImage};
use backend::pipeline::{create_graphics_pipeline, GraphicsPipelineDesc, Pipeline, VertexLayout};
use backend::shader::load_shader_bytes;
use backend::upload::{upload_to_buffer, upload_to_image};
use backend::VulkanDevice;
use config::Config;
use glam::{Mat4, Vec3};
use renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging();
    log::info!("Starting renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();
}

// =============================================================================
// DEMO SCENE
// =============================================================================

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 3],
    texcoord: [f32; 2],
}

impl Vertex {
    fn layout() -> VertexLayout {
        VertexLayout {
            bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<Vertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            attributes: vec![
                vk::VertexInputAttributeDescription {
                    binding: 0,
                    location: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    binding: 0,
                    location: 1,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 12,
                },
                vk::VertexInputAttributeDescription {
                    binding: 0,
                    location: 2,
                    format: vk::Format::R32G32_SFLOAT,
                    offset: 24,
                },
            ],
        }
    }
}

const QUAD_VERTICES: [Vertex; 4] = [
    Vertex {
        position: [0.5, -0.5, 0.0],
        color: [1.0, 0.0, 0.0],
        texcoord: [1.0, 0.0],
    },
    Vertex {
        position: [0.5, 0.5, 0.0],
        color: [0.0, 1.0, 0.0],
        texcoord: [1.0, 1.0],
    },
    Vertex {
        position: [-0.5, 0.5, 0.0],
        color: [0.0, 0.0, 1.0],
        texcoord: [0.0, 1.0],
    },
    Vertex {
        position: [-0.5, -0.5, 0.0],
        color: [0.0, 1.0, 0.0],
        texcoord: [0.0, 0.0],
    },
];

const QUAD_INDICES: [u32; 6] = [0, 1, 2, 3, 0, 2];

const TEXTURE_SIZE: u32 = 64;

/// Infinite far plane, reversed depth: the near plane maps to depth 1.0 and
/// depth falls off towards 0 with distance. Pairs with the pipeline's
/// GREATER_OR_EQUAL depth test and the 0.0 depth clear.
fn projection_reversed_z(fovy: f32, width: f32, height: f32, z_near: f32) -> Mat4 {
    let f = 1.0 / (fovy / 2.0).tan();
    let aspect = width / height;
    Mat4::from_cols_array(&[
        f / aspect, 0.0, 0.0, 0.0, //
        0.0, -f, 0.0, 0.0, // -f flips the y axis for Vulkan clip space
        0.0, 0.0, 0.0, 1.0, //
        0.0, 0.0, z_near, 0.0,
    ])
}

fn checkerboard_pixels(size: u32) -> Vec<u8> {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / 8) + (y / 8)) % 2 == 0;
            let value = if light { 0xff } else { 0x40 };
            pixels.extend_from_slice(&[value, value, value, 0xff]);
        }
    }
    pixels
}

/// Everything the demo draws with. Uploaded once at startup; the render
/// pass handle it was compiled against may be replaced on resize, which is
/// fine because the rebuilt pass is render-pass compatible.
struct Scene {
    device: Arc<VulkanDevice>,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    index_count: u32,
    _texture: GpuImage,
    sampler: vk::Sampler,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    pipeline: Pipeline,
    started: Instant,
}

impl Scene {
    fn new(renderer: &Renderer, config: &Config) -> Result<Self> {
        let device = renderer.device().clone();

        // Mesh data goes to device-local memory through the staging path
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let vertex_buffer = GpuBuffer::new(
            device.clone(),
            vertex_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_to_buffer(&device, &vertex_buffer, vertex_bytes)?;

        let index_bytes: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);
        let index_buffer = GpuBuffer::new(
            device.clone(),
            index_bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        upload_to_buffer(&device, &index_buffer, index_bytes)?;

        let texture = GpuImage::new(
            device.clone(),
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::SampleCountFlags::TYPE_1,
        )?;
        upload_to_image(
            &device,
            &texture,
            &checkerboard_pixels(TEXTURE_SIZE),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_anisotropy(1.0)
            .max_lod(1.0);
        let sampler = unsafe { device.device.create_sampler(&sampler_info, None)? };

        // One combined image sampler for the quad's texture
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None)? };

        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .device
                .create_descriptor_set_layout(&layout_info, None)?
        };

        let set_layouts = [descriptor_set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&set_layouts);
        let descriptor_set = unsafe { device.device.allocate_descriptor_sets(&alloc_info)? }[0];

        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build()];
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        let vertex_spirv = load_shader_bytes(config.shader_path("mesh.vert.spv"))?;
        let fragment_spirv = load_shader_bytes(config.shader_path("mesh.frag.spv"))?;

        let push_constants = vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<Mat4>() as u32,
        };

        let pipeline = create_graphics_pipeline(
            &device,
            &GraphicsPipelineDesc {
                vertex_spirv: &vertex_spirv,
                fragment_spirv: &fragment_spirv,
                render_pass: renderer.render_pass(),
                vertex_layout: &Vertex::layout(),
                set_layouts: &set_layouts,
                push_constants: Some(push_constants),
                subpass: 0,
                samples: renderer.samples(),
                cache: renderer.pipeline_cache(),
            },
        )?;

        Ok(Self {
            device,
            vertex_buffer,
            index_buffer,
            index_count: QUAD_INDICES.len() as u32,
            _texture: texture,
            sampler,
            descriptor_pool,
            descriptor_set_layout,
            descriptor_set,
            pipeline,
            started: Instant::now(),
        })
    }

    /// Record the quad's draw into the frame's render pass.
    fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        let time = self.started.elapsed().as_secs_f32();
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0)) * Mat4::from_rotation_y(-time);
        let projection = projection_reversed_z(
            80.0_f32.to_radians(),
            extent.width as f32,
            extent.height as f32,
            0.01,
        );
        let mvp = projection * model;

        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&mvp),
            );
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        // Caller guarantees device idleness; buffers/texture/pipeline are
        // RAII and follow
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
            self.device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

// =============================================================================
// APPLICATION
// =============================================================================

/// Field order matters for Drop: the scene's resources go before the
/// renderer that owns the device-side state they were recorded into.
pub struct App {
    config: Config,
    window: Option<Arc<Window>>,
    scene: Option<Scene>,
    renderer: Option<Renderer>,
    is_fullscreen: bool,
    is_minimized: bool,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            scene: None,
            renderer: None,
            is_fullscreen,
            is_minimized: false,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_graphics(&mut self, window: &Window) -> Result<()> {
        let renderer = Renderer::new(window, &self.config)?;
        let scene = Scene::new(&renderer, &self.config).context("Failed to set up the scene")?;

        self.renderer = Some(renderer);
        self.scene = Some(scene);

        log::info!("Renderer initialized");
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }

        let renderer = match self.renderer.as_mut() {
            Some(renderer) => renderer,
            None => return Ok(false),
        };
        let scene = match self.scene.as_ref() {
            Some(scene) => scene,
            None => return Ok(false),
        };

        renderer.draw_frame(|device, cmd, extent| scene.record(device, cmd, extent))
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_rebuild();
            }
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_graphics(&window) {
            log::error!("Failed to initialize the renderer: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.request_rebuild();
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    log::error!("Render error: {:#}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // Nothing on the GPU may still reference scene or renderer state
        if let Some(renderer) = &self.renderer {
            let _ = renderer.device().wait_idle();
        }
        // Scene drops before the renderer (field order), renderer before
        // the device Arc it shares
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);

        let layout = Vertex::layout();
        assert_eq!(layout.bindings[0].stride, 32);
        assert_eq!(layout.attributes[1].offset, 12);
        assert_eq!(layout.attributes[2].offset, 24);
    }

    #[test]
    fn reversed_z_puts_the_near_plane_at_depth_one() {
        let proj = projection_reversed_z(80.0_f32.to_radians(), 1280.0, 720.0, 0.01);

        let near = proj * glam::Vec4::new(0.0, 0.0, 0.01, 1.0);
        assert!((near.z / near.w - 1.0).abs() < 1e-5);

        let far = proj * glam::Vec4::new(0.0, 0.0, 1000.0, 1.0);
        assert!(far.z / far.w < 1e-4);
    }

    #[test]
    fn checkerboard_is_rgba() {
        let pixels = checkerboard_pixels(16);
        assert_eq!(pixels.len(), 16 * 16 * 4);
        // Alpha is opaque everywhere
        assert!(pixels.chunks_exact(4).all(|px| px[3] == 0xff));
    }
}
