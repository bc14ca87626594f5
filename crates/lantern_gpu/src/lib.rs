//! # Lantern GPU
//!
//! Frame presentation and GPU resource core for a Vulkan renderer.
//!
//! ## Features
//!
//! - **Device bootstrap**: instance, validation messenger, GPU selection and queues
//! - **Resources**: aligned host-mapped buffers, staged device-local geometry
//! - **Descriptors**: layout builder, budgeted pools and batched set writes
//! - **Pipelines**: SPIR-V shader modules, pipeline layouts and a mesh render system
//! - **Presentation**: swapchain with per-image attachments and two frames in flight
//! - **Frame orchestration**: begin/end frame and render pass bracketing with
//!   automatic swapchain recreation on resize
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lantern_gpu::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RendererConfig::default();
//!     let mut window = Window::new(&config.window)?;
//!     let device = Device::new(&mut window, &config)?;
//!     let mut renderer: Renderer<'_, SwapChain<'_>> = Renderer::new(&device, &mut window, &config)?;
//!
//!     while !window.should_close() {
//!         window.poll_events();
//!         if let Some(command_buffer) = renderer.begin_frame(&mut window)? {
//!             renderer.begin_render_pass(command_buffer)?;
//!             renderer.end_render_pass(command_buffer)?;
//!             renderer.end_frame(&mut window)?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod geometry;
pub mod render;
pub mod vulkan;

#[cfg(test)]
mod testing;

/// Common imports for renderer users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError, RendererConfig, WindowConfig},
        geometry::{GeometryBuffers, GeometryKey, GeometryStore},
        render::{
            AcquireOutcome, MeshRenderSystem, PresentOutcome, PresentationChain, Renderer, SurfaceProvider,
            MAX_FRAMES_IN_FLIGHT,
        },
        vulkan::{
            Buffer, DescriptorPool, DescriptorPoolBuilder, DescriptorSetLayout, DescriptorSetLayoutBuilder,
            DescriptorWriter, Device, GpuDevice, PipelineConfig, ShaderModule, SwapChain, VertexLayout, VulkanError,
            VulkanResult, Window,
        },
    };
}
