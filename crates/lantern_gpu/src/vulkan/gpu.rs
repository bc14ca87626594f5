//! Device operations used by buffers, descriptors and the frame orchestrator
//!
//! [`GpuDevice`] is implemented by [`Device`](super::Device). Every resource type
//! in this crate borrows its device as `&'d D`, so a resource can never outlive
//! the device that created it.

use ash::vk;

use super::descriptors::DescriptorWrite;
use super::pipeline::GraphicsPipelineDesc;
use super::VulkanResult;

/// A buffer handle together with the memory bound to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAllocation {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Dedicated memory backing the buffer
    pub memory: vk::DeviceMemory,
    /// Size in bytes as requested at creation
    pub size: vk::DeviceSize,
    /// Property flags of the memory type actually chosen
    pub memory_properties: vk::MemoryPropertyFlags,
}

/// Parameters for starting the presentation render pass
#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin {
    /// Render pass compatible with the framebuffer
    pub render_pass: vk::RenderPass,
    /// Framebuffer of the acquired image
    pub framebuffer: vk::Framebuffer,
    /// Render area, viewport and scissor extent
    pub extent: vk::Extent2D,
    /// Color attachment clear value (RGBA)
    pub clear_color: [f32; 4],
    /// Depth attachment clear value
    pub clear_depth: f32,
}

impl RenderPassBegin {
    /// Clear values in attachment order: color, then depth/stencil
    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: self.clear_depth, stencil: 0 },
            },
        ]
    }

    /// Viewport covering the whole extent with a 0..1 depth range
    pub fn viewport(&self) -> vk::Viewport {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    /// Scissor covering the whole extent
    pub fn scissor(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

/// Logical-device operations shared by the resource types
pub trait GpuDevice {
    /// `minUniformBufferOffsetAlignment` of the physical device
    fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize;

    /// Create a buffer and bind it to a fresh allocation of a matching memory type
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<BufferAllocation>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, allocation: &BufferAllocation);

    /// Map a range of host-visible memory
    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<*mut u8>;

    /// Unmap previously mapped memory
    fn unmap_memory(&self, memory: vk::DeviceMemory);

    /// Make host writes in the range visible to the device
    fn flush_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// Make device writes in the range visible to the host
    fn invalidate_mapped_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()>;

    /// Copy `size` bytes between buffers and wait for completion
    fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> VulkanResult<()>;

    /// Create a descriptor set layout from sorted bindings
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VulkanResult<vk::DescriptorSetLayout>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    /// Create a descriptor pool
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        flags: vk::DescriptorPoolCreateFlags,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VulkanResult<vk::DescriptorPool>;

    /// Destroy a descriptor pool and every set allocated from it
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set of the given layout
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet>;

    /// Return sets to a pool created with `FREE_DESCRIPTOR_SET`
    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()>;

    /// Return every set of a pool at once
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VulkanResult<()>;

    /// Apply all writes to `set` in one batched update
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, code: &[u32]) -> VulkanResult<vk::ShaderModule>;

    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    /// Create a pipeline layout over `set_layouts` at sets `0..n`
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout>;

    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    /// Build one graphics pipeline with dynamic viewport and scissor
    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VulkanResult<vk::Pipeline>;

    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    /// Allocate primary command buffers from the device command pool
    fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>>;

    /// Free command buffers back to the device command pool
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    /// Begin recording a command buffer
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;

    /// Finish recording a command buffer
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()>;

    /// Begin a render pass, then set viewport and scissor to the full extent
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);

    /// End the current render pass
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);

    /// Bind a graphics pipeline
    fn cmd_bind_pipeline(&self, command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline);

    /// Bind descriptor sets at the graphics bind point, starting at `first_set`
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );

    /// Update push constants
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    );

    /// Bind a vertex buffer at binding 0 and, optionally, a `u32` index buffer
    fn cmd_bind_geometry(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_buffer: vk::Buffer,
        index_buffer: Option<vk::Buffer>,
    );

    /// Record a non-indexed draw
    fn cmd_draw(&self, command_buffer: vk::CommandBuffer, vertex_count: u32);

    /// Record an indexed draw
    fn cmd_draw_indexed(&self, command_buffer: vk::CommandBuffer, index_count: u32);

    /// Block until the device has finished all submitted work
    fn wait_idle(&self) -> VulkanResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_render_pass_begin_covers_extent() {
        let begin = RenderPassBegin {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D { width: 800, height: 600 },
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
        };

        let viewport = begin.viewport();
        assert_relative_eq!(viewport.width, 800.0);
        assert_relative_eq!(viewport.height, 600.0);
        assert_relative_eq!(viewport.max_depth, 1.0);
        assert_eq!(begin.scissor().extent, begin.extent);

        let clear = begin.clear_values();
        unsafe {
            assert_relative_eq!(clear[0].color.float32[3], 1.0);
            assert_relative_eq!(clear[1].depth_stencil.depth, 1.0);
            assert_eq!(clear[1].depth_stencil.stencil, 0);
        }
    }
}
