//! Vulkan backend
//!
//! RAII wrappers over the device, buffers, descriptors, pipelines, swapchain
//! and window,
//! plus the [`GpuDevice`] seam resources are written against.

pub mod buffer;
pub mod commands;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod gpu;
pub mod pipeline;
pub mod render_pass;
pub mod swapchain;
pub mod sync;
pub mod window;

pub use buffer::{aligned_stride, Buffer};
pub use commands::{CommandPool, SingleTimeCommands};
pub use descriptors::{
    DescriptorPool, DescriptorPoolBuilder, DescriptorResource, DescriptorSetLayout, DescriptorSetLayoutBuilder,
    DescriptorWrite, DescriptorWriter, PoolBudget, DEFAULT_MAX_SETS,
};
pub use device::{Device, QueueFamilyIndices, SwapchainSupport};
pub use error::{VulkanError, VulkanResult};
pub use gpu::{BufferAllocation, GpuDevice, RenderPassBegin};
pub use pipeline::{
    GraphicsPipeline, GraphicsPipelineDesc, PipelineConfig, PipelineLayout, ShaderModule, VertexLayout,
};
pub use swapchain::SwapChain;
pub use sync::{FrameSync, ImageSlotTracker};
pub use window::{Window, WindowError, WindowResult};
