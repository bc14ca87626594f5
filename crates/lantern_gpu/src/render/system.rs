//! Mesh render system
//!
//! Draws [`GeometryBuffers`] with one pipeline. The frame's descriptor set is
//! bound at set 0 once per call, then each object gets its push constant
//! block of type `P` before its draw. A zero-sized `P` declares no push
//! constant range and pushes nothing.

use std::marker::PhantomData;
use std::mem::size_of;

use ash::vk;
use bytemuck::Pod;

use crate::geometry::GeometryBuffers;
use crate::vulkan::{
    DescriptorSetLayout, Device, GpuDevice, GraphicsPipeline, PipelineConfig, PipelineLayout, ShaderModule,
    VulkanError, VulkanResult,
};

/// Stages that can read the per-object push constants
pub const PUSH_CONSTANT_STAGES: vk::ShaderStageFlags =
    vk::ShaderStageFlags::from_raw(vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw());

/// Pipeline and layout for drawing geometry with a per-frame set at set 0
pub struct MeshRenderSystem<'d, P: Pod, D: GpuDevice + ?Sized = Device> {
    // Declared before the layout so it is destroyed first
    pipeline: GraphicsPipeline<'d, D>,
    layout: PipelineLayout<'d, D>,
    _push: PhantomData<P>,
}

impl<'d, P: Pod, D: GpuDevice + ?Sized> MeshRenderSystem<'d, P, D> {
    /// Build the layout from `frame_set_layout` and `P`, then the pipeline
    ///
    /// The pipeline stays compatible with later render passes of the same
    /// chain formats, which recreation preserves.
    pub fn new(
        device: &'d D,
        render_pass: vk::RenderPass,
        frame_set_layout: &DescriptorSetLayout<'d, D>,
        vertex_shader: &ShaderModule<'d, D>,
        fragment_shader: &ShaderModule<'d, D>,
        config: &PipelineConfig,
    ) -> VulkanResult<Self> {
        let push_constant_ranges = match size_of::<P>() {
            0 => Vec::new(),
            size => vec![vk::PushConstantRange {
                stage_flags: PUSH_CONSTANT_STAGES,
                offset: 0,
                size: u32::try_from(size)
                    .map_err(|_| VulkanError::invalid(format!("Push constant block of {} bytes", size)))?,
            }],
        };

        let layout = PipelineLayout::new(device, &[frame_set_layout], &push_constant_ranges)?;
        let pipeline = GraphicsPipeline::new(device, &layout, render_pass, vertex_shader, fragment_shader, config)?;
        log::info!("Mesh render system ready ({} byte push constants)", size_of::<P>());

        Ok(Self {
            pipeline,
            layout,
            _push: PhantomData,
        })
    }

    /// Record draws of `objects` inside an active render pass
    pub fn render<'g, I>(&self, command_buffer: vk::CommandBuffer, frame_set: vk::DescriptorSet, objects: I) -> VulkanResult<()>
    where
        'd: 'g,
        D: 'g,
        I: IntoIterator<Item = (&'g GeometryBuffers<'d, D>, P)>,
    {
        self.pipeline.bind(command_buffer);
        self.layout.bind_descriptor_sets(command_buffer, 0, &[frame_set])?;

        for (geometry, push) in objects {
            if size_of::<P>() > 0 {
                self.layout.push_constants(command_buffer, PUSH_CONSTANT_STAGES, 0, &push)?;
            }
            geometry.bind(command_buffer);
            geometry.draw(command_buffer);
        }
        Ok(())
    }

    /// The pipeline layout
    pub fn layout(&self) -> &PipelineLayout<'d, D> {
        &self.layout
    }

    /// The graphics pipeline
    pub fn pipeline(&self) -> &GraphicsPipeline<'d, D> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, MockDraw};
    use crate::vulkan::{DescriptorPoolBuilder, DescriptorSetLayoutBuilder, DescriptorWriter};
    use ash::vk::Handle;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    struct Vertex {
        position: [f32; 2],
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Pod, Zeroable)]
    struct ObjectPush {
        offset: [f32; 2],
        scale: f32,
        _padding: f32,
    }

    const TRIANGLE: [Vertex; 3] = [
        Vertex { position: [0.0, -0.5] },
        Vertex { position: [0.5, 0.5] },
        Vertex { position: [-0.5, 0.5] },
    ];

    fn shader(device: &MockDevice) -> ShaderModule<'_, MockDevice> {
        let words = [0x0723_0203u32, 0x0001_0000];
        let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
        ShaderModule::from_spirv(device, &bytes).unwrap()
    }

    fn frame_layout(device: &MockDevice) -> DescriptorSetLayout<'_, MockDevice> {
        let mut builder = DescriptorSetLayoutBuilder::new();
        builder
            .add_uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .unwrap();
        builder.build(device).unwrap()
    }

    #[test]
    fn test_frame_set_is_bound_before_draws() {
        let device = MockDevice::new();
        let set_layout = frame_layout(&device);
        let mut pool = DescriptorPoolBuilder::new()
            .add_pool_size(vk::DescriptorType::UNIFORM_BUFFER, 1)
            .build(&device)
            .unwrap();
        let mut writer = DescriptorWriter::new(&set_layout);
        writer
            .write_buffer(
                0,
                vk::DescriptorBufferInfo {
                    buffer: vk::Buffer::null(),
                    offset: 0,
                    range: 32,
                },
            )
            .unwrap();
        let frame_set = writer.build(&mut pool).unwrap();

        let (vertex, fragment) = (shader(&device), shader(&device));
        let system: MeshRenderSystem<'_, ObjectPush, MockDevice> = MeshRenderSystem::new(
            &device,
            vk::RenderPass::from_raw(9),
            &set_layout,
            &vertex,
            &fragment,
            &PipelineConfig::default(),
        )
        .unwrap();
        let geometry = GeometryBuffers::new(&device, &TRIANGLE, &[]).unwrap();

        let push = ObjectPush {
            offset: [0.25, 0.0],
            scale: 2.0,
            _padding: 0.0,
        };
        system
            .render(vk::CommandBuffer::null(), frame_set, [(&geometry, push), (&geometry, push)])
            .unwrap();

        let push_bytes = bytemuck::bytes_of(&push).to_vec();
        let per_object = [
            MockDraw::PushConstants {
                stages: PUSH_CONSTANT_STAGES,
                offset: 0,
                bytes: push_bytes,
            },
            MockDraw::Bind {
                vertex: geometry.vertex_buffer(),
                index: None,
            },
            MockDraw::Draw(3),
        ];
        let mut expected = vec![
            MockDraw::BindPipeline(system.pipeline().handle()),
            MockDraw::BindDescriptorSets {
                layout: system.layout().handle(),
                first_set: 0,
                sets: vec![frame_set],
            },
        ];
        expected.extend(per_object.iter().cloned());
        expected.extend(per_object.iter().cloned());
        assert_eq!(device.draws(), expected);
    }

    #[test]
    fn test_unit_push_records_no_push_constants() {
        let device = MockDevice::new();
        let set_layout = frame_layout(&device);
        let (vertex, fragment) = (shader(&device), shader(&device));
        let system: MeshRenderSystem<'_, (), MockDevice> = MeshRenderSystem::new(
            &device,
            vk::RenderPass::from_raw(9),
            &set_layout,
            &vertex,
            &fragment,
            &PipelineConfig::default(),
        )
        .unwrap();
        let geometry = GeometryBuffers::new(&device, &TRIANGLE, &[0, 1, 2]).unwrap();

        system
            .render(vk::CommandBuffer::null(), vk::DescriptorSet::null(), [(&geometry, ())])
            .unwrap();
        let draws = device.draws();
        assert!(!draws.iter().any(|draw| matches!(draw, MockDraw::PushConstants { .. })));
        assert_eq!(draws.last(), Some(&MockDraw::DrawIndexed(3)));
    }

    #[test]
    fn test_drop_releases_pipeline_objects() {
        let device = MockDevice::new();
        let set_layout = frame_layout(&device);
        {
            let (vertex, fragment) = (shader(&device), shader(&device));
            let _system: MeshRenderSystem<'_, ObjectPush, MockDevice> = MeshRenderSystem::new(
                &device,
                vk::RenderPass::from_raw(9),
                &set_layout,
                &vertex,
                &fragment,
                &PipelineConfig::default(),
            )
            .unwrap();
            assert_eq!(device.live_pipelines(), 1);
            assert_eq!(device.live_pipeline_layouts(), 1);
        }
        assert_eq!(device.live_pipelines(), 0);
        assert_eq!(device.live_pipeline_layouts(), 0);
        assert_eq!(device.live_shader_modules(), 0);
    }
}
