//! Lantern viewer
//!
//! Opens a window and drives the frame loop: each frame uploads the slot's
//! uniform block, clears the swapchain image to a slowly cycling color and
//! draws a spinning triangle with the slot's descriptor set bound.
//! Pass a `.toml` or `.ron` config path as the first argument to override
//! the defaults.
//!
//! Shaders are compiled by the build script when `VULKAN_SDK` is set. Set
//! `LANTERN_SHADER_DIR` to load `triangle.{vert,frag}.spv` from elsewhere.
//! Without them the viewer only clears.

use std::path::PathBuf;
use std::time::Instant;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use lantern_gpu::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
enum ViewerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("window: {0}")]
    Window(#[from] lantern_gpu::vulkan::WindowError),

    #[error("vulkan: {0}")]
    Vulkan(#[from] VulkanError),
}

/// Per-frame data written into the slot's uniform region
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct FrameUniform {
    clear_color: [f32; 4],
    extent: [f32; 2],
    time: f32,
    frame: f32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct Vertex {
    position: [f32; 2],
    color: [f32; 3],
}

impl VertexLayout for Vertex {
    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 8,
            },
        ]
    }
}

/// Per-object placement pushed before each draw
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ObjectPush {
    offset: [f32; 2],
    scale: f32,
    _padding: f32,
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [0.0, -0.6], color: [1.0, 0.3, 0.2] },
    Vertex { position: [0.52, 0.3], color: [0.2, 1.0, 0.3] },
    Vertex { position: [-0.52, 0.3], color: [0.2, 0.4, 1.0] },
];

/// One uniform region and descriptor set per frame slot
struct FrameResources<'d> {
    uniforms: Buffer<'d>,
    sets: Vec<vk::DescriptorSet>,
    // Sets are freed with the pool, which must outlive them
    _pool: DescriptorPool<'d>,
    layout: DescriptorSetLayout<'d>,
}

impl<'d> FrameResources<'d> {
    fn new(device: &'d Device) -> VulkanResult<Self> {
        let mut uniforms = Buffer::with_alignment(
            device,
            std::mem::size_of::<FrameUniform>() as vk::DeviceSize,
            MAX_FRAMES_IN_FLIGHT as u32,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            device.min_uniform_buffer_offset_alignment(),
        )?;
        uniforms.map_all()?;

        let layout = DescriptorSetLayoutBuilder::new()
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)?
            .build(device)?;

        let mut pool = DescriptorPoolBuilder::new()
            .set_max_sets(MAX_FRAMES_IN_FLIGHT as u32)
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, MAX_FRAMES_IN_FLIGHT as u32)
            .build(device)?;

        let sets = (0..MAX_FRAMES_IN_FLIGHT as u32)
            .map(|slot| {
                let info = uniforms.descriptor_info_for_index(slot)?;
                let mut writer = DescriptorWriter::new(&layout);
                writer.write_buffer(0, info)?;
                writer.build(&mut pool)
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        Ok(Self {
            uniforms,
            sets,
            _pool: pool,
            layout,
        })
    }

    fn upload(&mut self, slot: usize, uniform: &FrameUniform) -> VulkanResult<()> {
        let index = slot as u32;
        self.uniforms.write_to_index(uniform, index)?;
        self.uniforms.flush_index(index)
    }
}

/// Triangle pipeline and its geometry
struct Scene<'d> {
    system: MeshRenderSystem<'d, ObjectPush>,
    triangle: GeometryBuffers<'d>,
}

impl<'d> Scene<'d> {
    /// Build the scene, or `None` when the compiled shaders are missing
    fn load(
        device: &'d Device,
        render_pass: vk::RenderPass,
        frame_set_layout: &DescriptorSetLayout<'d>,
    ) -> VulkanResult<Option<Self>> {
        let dir = std::env::var_os("LANTERN_SHADER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(concat!(env!("OUT_DIR"), "/shaders")));
        let vertex_path = dir.join("triangle.vert.spv");
        let fragment_path = dir.join("triangle.frag.spv");
        if !vertex_path.exists() || !fragment_path.exists() {
            log::warn!("No compiled shaders in {}, clearing only", dir.display());
            return Ok(None);
        }

        let vertex_shader = ShaderModule::from_file(device, &vertex_path)?;
        let fragment_shader = ShaderModule::from_file(device, &fragment_path)?;
        let config = PipelineConfig::default().with_vertex::<Vertex>();
        let system = MeshRenderSystem::new(
            device,
            render_pass,
            frame_set_layout,
            &vertex_shader,
            &fragment_shader,
            &config,
        )?;
        let triangle = GeometryBuffers::new(device, &TRIANGLE, &[])?;

        Ok(Some(Self { system, triangle }))
    }

    fn draw(&self, command_buffer: vk::CommandBuffer, frame_set: vk::DescriptorSet) -> VulkanResult<()> {
        let push = ObjectPush {
            offset: [0.0, 0.0],
            scale: 1.0,
            _padding: 0.0,
        };
        self.system.render(command_buffer, frame_set, [(&self.triangle, push)])
    }
}

/// Smooth hue cycle kept dim enough to stay easy on the eyes
fn cycle_color(seconds: f32) -> [f32; 4] {
    let phase = seconds * 0.25;
    let channel = |offset: f32| 0.1 + 0.1 * (phase + offset).sin();
    [
        channel(0.0),
        channel(2.094),
        channel(4.189),
        1.0,
    ]
}

fn run(config: RendererConfig) -> Result<(), ViewerError> {
    let mut window = Window::new(&config.window)?;
    let device = Device::new(&mut window, &config)?;
    let mut frame_resources = FrameResources::new(&device)?;
    let mut renderer: Renderer<'_, SwapChain<'_>> = Renderer::new(&device, &mut window, &config)?;
    // Chain formats never change, so the pipeline outlives every recreated render pass
    let scene = Scene::load(&device, renderer.swapchain_render_pass(), &frame_resources.layout)?;

    let start = Instant::now();
    let mut frames: u64 = 0;

    while !window.should_close() {
        window.poll_events();

        let Some(command_buffer) = renderer.begin_frame(&mut window)? else {
            continue;
        };

        let seconds = start.elapsed().as_secs_f32();
        let clear_color = cycle_color(seconds);
        let extent = renderer.extent();
        let slot = renderer.frame_index()?;

        frame_resources.upload(
            slot,
            &FrameUniform {
                clear_color,
                extent: [extent.width as f32, extent.height as f32],
                time: seconds,
                frame: frames as f32,
            },
        )?;

        renderer.set_clear_color(clear_color);
        renderer.begin_render_pass(command_buffer)?;
        if let Some(scene) = &scene {
            scene.draw(command_buffer, frame_resources.sets[slot])?;
        }
        renderer.end_render_pass(command_buffer)?;
        renderer.end_frame(&mut window)?;

        frames += 1;
    }
    // The scene's pipeline may still be referenced by in-flight frames
    device.wait_idle()?;

    let elapsed = start.elapsed().as_secs_f32();
    log::info!(
        "Rendered {} frames in {:.1}s ({:.1} fps)",
        frames,
        elapsed,
        frames as f32 / elapsed.max(f32::EPSILON)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading configuration from {}", path);
            RendererConfig::load(&path)?
        }
        None => RendererConfig::default(),
    };

    log::info!("Starting {}", config.application_name);
    if let Err(e) = run(config) {
        log::error!("Viewer error: {}", e);
        return Err(e.into());
    }
    log::info!("Viewer finished");
    Ok(())
}
