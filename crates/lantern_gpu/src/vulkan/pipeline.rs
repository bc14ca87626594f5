//! Shader modules, pipeline layouts and graphics pipelines
//!
//! A [`GraphicsPipeline`] is built from a live [`PipelineLayout`], so no
//! pipeline can exist before its layout. Viewport and scissor are dynamic
//! state; the renderer sets both when it begins the render pass, which keeps
//! pipelines valid across swapchain recreation.

use std::collections::HashSet;
use std::ffi::CStr;
use std::io::Cursor;
use std::mem::size_of;
use std::path::Path;

use ash::vk;
use bytemuck::Pod;

use super::descriptors::DescriptorSetLayout;
use super::{Device, GpuDevice, VulkanError, VulkanResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Entry point every shader stage is expected to export
pub const SHADER_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// States supplied at record time instead of baked into the pipeline
pub const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// SPIR-V shader module with RAII cleanup
pub struct ShaderModule<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    module: vk::ShaderModule,
}

impl<'d, D: GpuDevice + ?Sized> ShaderModule<'d, D> {
    /// Create a module from SPIR-V bytes in either byte order
    pub fn from_spirv(device: &'d D, bytes: &[u8]) -> VulkanResult<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid SPIR-V: {}", e)))?;
        if code.first() != Some(&SPIRV_MAGIC) {
            return Err(VulkanError::InitializationFailed(
                "SPIR-V bytecode does not start with the magic number".to_string(),
            ));
        }

        let module = device.create_shader_module(&code)?;
        Ok(Self { device, module })
    }

    /// Load a compiled `.spv` file
    pub fn from_file(device: &'d D, path: impl AsRef<Path>) -> VulkanResult<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            VulkanError::InitializationFailed(format!("Failed to read shader {}: {}", path.display(), e))
        })?;
        log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
        Self::from_spirv(device, &bytes)
    }

    /// Shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl<'d, D: GpuDevice + ?Sized> Drop for ShaderModule<'d, D> {
    fn drop(&mut self) {
        self.device.destroy_shader_module(self.module);
    }
}

/// Descriptor set layouts and push constant ranges a pipeline is built against
pub struct PipelineLayout<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    layout: vk::PipelineLayout,
    set_layout_count: u32,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl<'d, D: GpuDevice + ?Sized> PipelineLayout<'d, D> {
    /// Create a layout with `set_layouts` at sets `0..n`
    ///
    /// Push constant ranges need a non-zero size, and offset and size must
    /// both be multiples of 4.
    pub fn new(
        device: &'d D,
        set_layouts: &[&DescriptorSetLayout<'d, D>],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<Self> {
        for range in push_constant_ranges {
            if range.size == 0 || range.offset % 4 != 0 || range.size % 4 != 0 {
                return Err(VulkanError::invalid(format!(
                    "Push constant range {}+{} must be non-empty and 4-byte aligned",
                    range.offset, range.size
                )));
            }
            if range.stage_flags.is_empty() {
                return Err(VulkanError::invalid("Push constant range names no shader stage"));
            }
        }

        let handles: Vec<_> = set_layouts.iter().map(|layout| layout.handle()).collect();
        let set_layout_count = u32::try_from(handles.len())
            .map_err(|_| VulkanError::invalid("Too many descriptor set layouts"))?;
        let layout = device.create_pipeline_layout(&handles, push_constant_ranges)?;

        Ok(Self {
            device,
            layout,
            set_layout_count,
            push_constant_ranges: push_constant_ranges.to_vec(),
        })
    }

    /// Record a bind of `sets` starting at `first_set`
    pub fn bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> VulkanResult<()> {
        let in_layout = u32::try_from(sets.len())
            .ok()
            .and_then(|count| first_set.checked_add(count))
            .is_some_and(|end| end <= self.set_layout_count);
        if sets.is_empty() || !in_layout {
            return Err(VulkanError::invalid(format!(
                "Cannot bind {} sets at set {}; the layout declares {}",
                sets.len(),
                first_set,
                self.set_layout_count
            )));
        }

        self.device.cmd_bind_descriptor_sets(command_buffer, self.layout, first_set, sets);
        Ok(())
    }

    /// Record a push of `value` at `offset` for `stages`
    ///
    /// One declared range must cover the bytes for all of `stages`, and every
    /// range overlapping them must be updated for all of its own stages.
    pub fn push_constants<T: Pod>(
        &self,
        command_buffer: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> VulkanResult<()> {
        let bytes = bytemuck::bytes_of(value);
        let start = u64::from(offset);
        let end = start + bytes.len() as u64;

        let range_end = |range: &vk::PushConstantRange| u64::from(range.offset) + u64::from(range.size);
        let covered = self
            .push_constant_ranges
            .iter()
            .any(|range| range.stage_flags.contains(stages) && u64::from(range.offset) <= start && end <= range_end(range));
        let overlapping_complete = self
            .push_constant_ranges
            .iter()
            .filter(|range| u64::from(range.offset) < end && start < range_end(range))
            .all(|range| stages.contains(range.stage_flags));

        if bytes.is_empty() || stages.is_empty() || !covered || !overlapping_complete {
            return Err(VulkanError::invalid(format!(
                "Push of {} bytes at offset {} for {:?} does not match the layout's push constant ranges",
                bytes.len(),
                offset,
                stages
            )));
        }

        self.device.cmd_push_constants(command_buffer, self.layout, stages, offset, bytes);
        Ok(())
    }

    /// Pipeline layout handle
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// Number of descriptor set layouts
    pub fn set_layout_count(&self) -> u32 {
        self.set_layout_count
    }
}

impl<'d, D: GpuDevice + ?Sized> Drop for PipelineLayout<'d, D> {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.layout);
    }
}

/// Vertex types that can describe their own input layout
pub trait VertexLayout: Pod {
    /// Attributes read from binding 0
    fn attributes() -> Vec<vk::VertexInputAttributeDescription>;

    /// Per-vertex binding 0 with this type's stride
    fn binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }
}

/// Fixed-function state of a graphics pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Vertex buffer bindings
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    /// Vertex attributes
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Fill, line or point rasterization
    pub polygon_mode: vk::PolygonMode,
    /// Faces culled
    pub cull_mode: vk::CullModeFlags,
    /// Winding treated as front-facing
    pub front_face: vk::FrontFace,
    /// Test fragments against the depth attachment
    pub depth_test: bool,
    /// Write passing fragments' depth
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare_op: vk::CompareOp,
    /// Blend color output by source alpha
    pub alpha_blending: bool,
    /// Subpass of the render pass the pipeline is used in
    pub subpass: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            alpha_blending: false,
            subpass: 0,
        }
    }
}

impl PipelineConfig {
    /// Read vertices of type `V` from binding 0
    pub fn with_vertex<V: VertexLayout>(mut self) -> Self {
        self.vertex_bindings = vec![V::binding()];
        self.vertex_attributes = V::attributes();
        self
    }

    /// Blend with `src.a * src + (1 - src.a) * dst`
    pub fn with_alpha_blending(mut self) -> Self {
        self.alpha_blending = true;
        self
    }

    /// Reject vertex input Vulkan would refuse
    pub fn validate(&self) -> VulkanResult<()> {
        let mut bindings = HashSet::new();
        if let Some(duplicate) = self.vertex_bindings.iter().find(|b| !bindings.insert(b.binding)) {
            return Err(VulkanError::invalid(format!(
                "Vertex binding {} is declared twice",
                duplicate.binding
            )));
        }

        let mut locations = HashSet::new();
        for attribute in &self.vertex_attributes {
            if !bindings.contains(&attribute.binding) {
                return Err(VulkanError::invalid(format!(
                    "Vertex attribute at location {} reads undeclared binding {}",
                    attribute.location, attribute.binding
                )));
            }
            if !locations.insert(attribute.location) {
                return Err(VulkanError::invalid(format!(
                    "Vertex location {} is declared twice",
                    attribute.location
                )));
            }
        }
        Ok(())
    }

    /// Blend state of the single color attachment
    pub fn color_blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        };
        if !self.alpha_blending {
            return state;
        }
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            ..state
        }
    }
}

/// Everything the device needs to build one graphics pipeline
#[derive(Debug, Clone, Copy)]
pub struct GraphicsPipelineDesc<'a> {
    /// Layout the pipeline is built against
    pub layout: vk::PipelineLayout,
    /// Render pass the pipeline must be compatible with
    pub render_pass: vk::RenderPass,
    /// Vertex stage
    pub vertex_shader: vk::ShaderModule,
    /// Fragment stage
    pub fragment_shader: vk::ShaderModule,
    /// Fixed-function state
    pub config: &'a PipelineConfig,
}

/// Graphics pipeline with RAII cleanup
pub struct GraphicsPipeline<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl<'d, D: GpuDevice + ?Sized> GraphicsPipeline<'d, D> {
    /// Build a pipeline for `render_pass` against `layout`
    ///
    /// The shader modules may be dropped once this returns.
    pub fn new(
        device: &'d D,
        layout: &PipelineLayout<'d, D>,
        render_pass: vk::RenderPass,
        vertex_shader: &ShaderModule<'d, D>,
        fragment_shader: &ShaderModule<'d, D>,
        config: &PipelineConfig,
    ) -> VulkanResult<Self> {
        if render_pass == vk::RenderPass::null() {
            return Err(VulkanError::invalid("Cannot create a pipeline without a render pass"));
        }
        config.validate()?;

        let pipeline = device.create_graphics_pipeline(&GraphicsPipelineDesc {
            layout: layout.handle(),
            render_pass,
            vertex_shader: vertex_shader.handle(),
            fragment_shader: fragment_shader.handle(),
            config,
        })?;
        log::debug!(
            "Created graphics pipeline: {} vertex attributes, {:?}",
            config.vertex_attributes.len(),
            config.topology
        );

        Ok(Self {
            device,
            pipeline,
            layout: layout.handle(),
        })
    }

    /// Record a bind at the graphics bind point
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.device.cmd_bind_pipeline(command_buffer, self.pipeline);
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Layout the pipeline was built against
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl<'d, D: GpuDevice + ?Sized> Drop for GraphicsPipeline<'d, D> {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.pipeline);
    }
}
