//! In-memory device, chain and surface used by unit tests

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

use ash::vk::{self, Handle};

use crate::render::{
    is_zero_extent, AcquireOutcome, ChainFormats, ChainSnapshot, PresentOutcome, PresentationChain,
    SurfaceProvider, MAX_FRAMES_IN_FLIGHT,
};
use crate::vulkan::{
    BufferAllocation, DescriptorWrite, GpuDevice, GraphicsPipelineDesc, ImageSlotTracker, RenderPassBegin,
    VulkanError, VulkanResult,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const DEFAULT_FORMATS: ChainFormats = ChainFormats {
    image_format: vk::Format::B8G8R8A8_SRGB,
    depth_format: vk::Format::D32_SFLOAT,
};

struct MockBuffer {
    memory: vk::DeviceMemory,
    bytes: Box<[u8]>,
    properties: vk::MemoryPropertyFlags,
    usage: vk::BufferUsageFlags,
    mapped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockDraw {
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants {
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: Vec<u8>,
    },
    Bind { vertex: vk::Buffer, index: Option<vk::Buffer> },
    Draw(u32),
    DrawIndexed(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSubmission {
    pub image_index: u32,
    pub slot: usize,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub waited_on: Option<usize>,
}

#[derive(Default)]
struct ChainScript {
    acquires: VecDeque<AcquireOutcome>,
    presents: VecDeque<PresentOutcome>,
    next_formats: Option<ChainFormats>,
    unavailable_creates: usize,
    creations: Vec<vk::Extent2D>,
    submissions: Vec<MockSubmission>,
}

#[derive(Default)]
struct MockState {
    next_handle: u64,
    buffers: HashMap<vk::Buffer, MockBuffer>,
    memory_owner: HashMap<vk::DeviceMemory, vk::Buffer>,
    unmap_count: usize,
    flushes: Vec<(vk::DeviceSize, vk::DeviceSize)>,
    invalidations: Vec<(vk::DeviceSize, vk::DeviceSize)>,
    copies: Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)>,
    live_layouts: usize,
    live_pools: usize,
    live_sets: usize,
    descriptor_updates: Vec<(vk::DescriptorSet, Vec<u32>)>,
    live_shader_modules: usize,
    live_pipeline_layouts: usize,
    live_pipelines: usize,
    command_buffers: HashSet<vk::CommandBuffer>,
    recording: HashSet<vk::CommandBuffer>,
    render_pass_begins: Vec<RenderPassBegin>,
    render_pass_ends: usize,
    draws: Vec<MockDraw>,
    wait_idle_count: usize,
    chain: ChainScript,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Device double with host-backed memory and call logs
pub struct MockDevice {
    min_alignment: vk::DeviceSize,
    state: RefCell<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_alignment(256)
    }

    pub fn with_alignment(min_alignment: vk::DeviceSize) -> Self {
        Self {
            min_alignment,
            state: RefCell::new(MockState::default()),
        }
    }

    fn next_handle(&self) -> u64 {
        self.state.borrow_mut().handle()
    }

    pub fn memory_bytes(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.borrow().buffers.get(&buffer).map(|b| b.bytes.to_vec()).unwrap_or_default()
    }

    pub fn buffer_properties(&self, buffer: vk::Buffer) -> Option<(vk::BufferUsageFlags, vk::MemoryPropertyFlags)> {
        self.state.borrow().buffers.get(&buffer).map(|b| (b.usage, b.properties))
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn unmap_count(&self) -> usize {
        self.state.borrow().unmap_count
    }

    pub fn flushed_ranges(&self) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        self.state.borrow().flushes.clone()
    }

    pub fn invalidated_ranges(&self) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        self.state.borrow().invalidations.clone()
    }

    pub fn copies(&self) -> Vec<(vk::Buffer, vk::Buffer, vk::DeviceSize)> {
        self.state.borrow().copies.clone()
    }

    pub fn allocated_descriptor_sets(&self) -> usize {
        self.state.borrow().live_sets
    }

    pub fn live_shader_modules(&self) -> usize {
        self.state.borrow().live_shader_modules
    }

    pub fn live_pipeline_layouts(&self) -> usize {
        self.state.borrow().live_pipeline_layouts
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.borrow().live_pipelines
    }

    pub fn descriptor_updates(&self) -> Vec<(vk::DescriptorSet, Vec<u32>)> {
        self.state.borrow().descriptor_updates.clone()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.borrow().command_buffers.len()
    }

    pub fn render_pass_begins(&self) -> Vec<RenderPassBegin> {
        self.state.borrow().render_pass_begins.clone()
    }

    pub fn draws(&self) -> Vec<MockDraw> {
        self.state.borrow().draws.clone()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state.borrow().wait_idle_count
    }

    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.borrow_mut().chain.acquires.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.borrow_mut().chain.presents.push_back(outcome);
    }

    pub fn script_next_formats(&self, formats: ChainFormats) {
        self.state.borrow_mut().chain.next_formats = Some(formats);
    }

    /// Make the next `count` chain creations find no drawable surface
    pub fn script_unavailable_creates(&self, count: usize) {
        self.state.borrow_mut().chain.unavailable_creates = count;
    }

    pub fn chain_creations(&self) -> Vec<vk::Extent2D> {
        self.state.borrow().chain.creations.clone()
    }

    pub fn submissions(&self) -> Vec<MockSubmission> {
        self.state.borrow().chain.submissions.clone()
    }
}

impl GpuDevice for MockDevice {
    fn min_uniform_buffer_offset_alignment(&self) -> vk::DeviceSize {
        self.min_alignment
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<BufferAllocation> {
        let mut state = self.state.borrow_mut();
        let buffer = vk::Buffer::from_raw(state.handle());
        let memory = vk::DeviceMemory::from_raw(state.handle());
        state.buffers.insert(
            buffer,
            MockBuffer {
                memory,
                bytes: vec![0; size as usize].into_boxed_slice(),
                properties,
                usage,
                mapped: false,
            },
        );
        state.memory_owner.insert(memory, buffer);

        Ok(BufferAllocation {
            buffer,
            memory,
            size,
            memory_properties: properties,
        })
    }

    fn destroy_buffer(&self, allocation: &BufferAllocation) {
        let mut state = self.state.borrow_mut();
        state.buffers.remove(&allocation.buffer);
        state.memory_owner.remove(&allocation.memory);
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<*mut u8> {
        let mut state = self.state.borrow_mut();
        let owner = *state
            .memory_owner
            .get(&memory)
            .ok_or(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let buffer = state
            .buffers
            .get_mut(&owner)
            .ok_or(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        if buffer.mapped || offset + size > buffer.bytes.len() as vk::DeviceSize {
            return Err(VulkanError::Api(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        buffer.mapped = true;
        Ok(unsafe { buffer.bytes.as_mut_ptr().add(offset as usize) })
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = self.state.borrow_mut();
        state.unmap_count += 1;
        if let Some(owner) = state.memory_owner.get(&memory).copied() {
            if let Some(buffer) = state.buffers.get_mut(&owner) {
                buffer.mapped = false;
            }
        }
    }

    fn flush_mapped_range(
        &self,
        _memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        self.state.borrow_mut().flushes.push((offset, size));
        Ok(())
    }

    fn invalidate_mapped_range(
        &self,
        _memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VulkanResult<()> {
        self.state.borrow_mut().invalidations.push((offset, size));
        Ok(())
    }

    fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        let data = state
            .buffers
            .get(&src)
            .map(|b| b.bytes[..size as usize].to_vec())
            .ok_or_else(|| VulkanError::invalid("copy from unknown buffer"))?;
        let target = state
            .buffers
            .get_mut(&dst)
            .ok_or_else(|| VulkanError::invalid("copy to unknown buffer"))?;
        target.bytes[..size as usize].copy_from_slice(&data);
        state.copies.push((src, dst, size));
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VulkanResult<vk::DescriptorSetLayout> {
        let mut state = self.state.borrow_mut();
        state.live_layouts += 1;
        Ok(vk::DescriptorSetLayout::from_raw(state.handle()))
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {
        self.state.borrow_mut().live_layouts -= 1;
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _flags: vk::DescriptorPoolCreateFlags,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VulkanResult<vk::DescriptorPool> {
        let mut state = self.state.borrow_mut();
        state.live_pools += 1;
        Ok(vk::DescriptorPool::from_raw(state.handle()))
    }

    fn destroy_descriptor_pool(&self, _pool: vk::DescriptorPool) {
        self.state.borrow_mut().live_pools -= 1;
    }

    fn allocate_descriptor_set(
        &self,
        _pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> VulkanResult<vk::DescriptorSet> {
        let mut state = self.state.borrow_mut();
        state.live_sets += 1;
        Ok(vk::DescriptorSet::from_raw(state.handle()))
    }

    fn free_descriptor_sets(&self, _pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        state.live_sets = state.live_sets.saturating_sub(sets.len());
        Ok(())
    }

    fn reset_descriptor_pool(&self, _pool: vk::DescriptorPool) -> VulkanResult<()> {
        self.state.borrow_mut().live_sets = 0;
        Ok(())
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let bindings = writes.iter().map(|write| write.binding).collect();
        self.state.borrow_mut().descriptor_updates.push((set, bindings));
    }

    fn create_shader_module(&self, _code: &[u32]) -> VulkanResult<vk::ShaderModule> {
        let mut state = self.state.borrow_mut();
        state.live_shader_modules += 1;
        Ok(vk::ShaderModule::from_raw(state.handle()))
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.state.borrow_mut().live_shader_modules -= 1;
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> VulkanResult<vk::PipelineLayout> {
        let mut state = self.state.borrow_mut();
        state.live_pipeline_layouts += 1;
        Ok(vk::PipelineLayout::from_raw(state.handle()))
    }

    fn destroy_pipeline_layout(&self, _layout: vk::PipelineLayout) {
        self.state.borrow_mut().live_pipeline_layouts -= 1;
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> VulkanResult<vk::Pipeline> {
        if desc.layout == vk::PipelineLayout::null() {
            return Err(VulkanError::invalid("pipeline without a layout"));
        }
        let mut state = self.state.borrow_mut();
        state.live_pipelines += 1;
        Ok(vk::Pipeline::from_raw(state.handle()))
    }

    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {
        self.state.borrow_mut().live_pipelines -= 1;
    }

    fn allocate_command_buffers(&self, count: u32) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        let buffers: Vec<_> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        state.command_buffers.extend(buffers.iter().copied());
        Ok(buffers)
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for command_buffer in command_buffers {
            state.command_buffers.remove(command_buffer);
            state.recording.remove(command_buffer);
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.command_buffers.contains(&command_buffer) {
            return Err(VulkanError::invalid("begin on unknown command buffer"));
        }
        state.recording.insert(command_buffer);
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        if self.state.borrow_mut().recording.remove(&command_buffer) {
            Ok(())
        } else {
            Err(VulkanError::invalid("end on a command buffer that is not recording"))
        }
    }

    fn cmd_begin_render_pass(&self, _command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.state.borrow_mut().render_pass_begins.push(*begin);
    }

    fn cmd_end_render_pass(&self, _command_buffer: vk::CommandBuffer) {
        self.state.borrow_mut().render_pass_ends += 1;
    }

    fn cmd_bind_pipeline(&self, _command_buffer: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.borrow_mut().draws.push(MockDraw::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.borrow_mut().draws.push(MockDraw::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn cmd_push_constants(
        &self,
        _command_buffer: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        bytes: &[u8],
    ) {
        self.state.borrow_mut().draws.push(MockDraw::PushConstants {
            stages,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    fn cmd_bind_geometry(
        &self,
        _command_buffer: vk::CommandBuffer,
        vertex_buffer: vk::Buffer,
        index_buffer: Option<vk::Buffer>,
    ) {
        self.state.borrow_mut().draws.push(MockDraw::Bind {
            vertex: vertex_buffer,
            index: index_buffer,
        });
    }

    fn cmd_draw(&self, _command_buffer: vk::CommandBuffer, vertex_count: u32) {
        self.state.borrow_mut().draws.push(MockDraw::Draw(vertex_count));
    }

    fn cmd_draw_indexed(&self, _command_buffer: vk::CommandBuffer, index_count: u32) {
        self.state.borrow_mut().draws.push(MockDraw::DrawIndexed(index_count));
    }

    fn wait_idle(&self) -> VulkanResult<()> {
        self.state.borrow_mut().wait_idle_count += 1;
        Ok(())
    }
}

/// Scriptable chain that records what the orchestrator asks of it
pub struct MockChain<'d> {
    device: &'d MockDevice,
    formats: ChainFormats,
    extent: vk::Extent2D,
    image_count: u32,
    next_image: u32,
    slot: usize,
    images_in_flight: ImageSlotTracker,
    handle: vk::SwapchainKHR,
}

impl<'d> PresentationChain<'d> for MockChain<'d> {
    type Device = MockDevice;

    fn create(device: &'d MockDevice, extent: vk::Extent2D, previous: Option<&ChainSnapshot>) -> VulkanResult<Self> {
        if is_zero_extent(extent) {
            return Err(VulkanError::surface_unavailable(extent));
        }
        {
            let mut state = device.state.borrow_mut();
            if state.chain.unavailable_creates > 0 {
                state.chain.unavailable_creates -= 1;
                return Err(VulkanError::surface_unavailable(vk::Extent2D { width: 0, height: 0 }));
            }
        }
        let formats = device
            .state
            .borrow_mut()
            .chain
            .next_formats
            .take()
            .unwrap_or(DEFAULT_FORMATS);
        if let Some(previous) = previous {
            previous.formats.ensure_compatible(&formats)?;
        }
        device.state.borrow_mut().chain.creations.push(extent);

        let image_count = 2;
        Ok(Self {
            device,
            formats,
            extent,
            image_count,
            next_image: 0,
            slot: 0,
            images_in_flight: ImageSlotTracker::new(image_count as usize),
            handle: vk::SwapchainKHR::from_raw(device.next_handle()),
        })
    }

    fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            formats: self.formats,
            extent: self.extent,
            handle: self.handle,
        }
    }

    fn formats(&self) -> ChainFormats {
        self.formats
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> usize {
        self.image_count as usize
    }

    fn render_pass(&self) -> vk::RenderPass {
        vk::RenderPass::from_raw(self.handle.as_raw() << 8)
    }

    fn framebuffer(&self, image_index: u32) -> VulkanResult<vk::Framebuffer> {
        if image_index >= self.image_count {
            return Err(VulkanError::invalid("image index out of range"));
        }
        Ok(vk::Framebuffer::from_raw((self.handle.as_raw() << 8) + 1 + u64::from(image_index)))
    }

    fn acquire_next_image(&mut self) -> VulkanResult<AcquireOutcome> {
        let scripted = self.device.state.borrow_mut().chain.acquires.pop_front();
        let outcome = scripted.unwrap_or(AcquireOutcome::Acquired {
            image_index: self.next_image,
            suboptimal: false,
        });
        if let AcquireOutcome::Acquired { image_index, .. } = outcome {
            self.next_image = (image_index + 1) % self.image_count;
        }
        Ok(outcome)
    }

    fn submit_command_buffers(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        image_index: u32,
    ) -> VulkanResult<PresentOutcome> {
        let waited_on = self.images_in_flight.claim(image_index as usize, self.slot)?;
        let mut state = self.device.state.borrow_mut();
        state.chain.submissions.push(MockSubmission {
            image_index,
            slot: self.slot,
            command_buffers: command_buffers.to_vec(),
            waited_on,
        });
        self.slot = (self.slot + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(state.chain.presents.pop_front().unwrap_or(PresentOutcome::Presented))
    }
}

/// Window double with scripted extents
pub struct MockSurface {
    extent: vk::Extent2D,
    resized: bool,
    pending: VecDeque<vk::Extent2D>,
    waits: usize,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            resized: false,
            pending: VecDeque::new(),
            waits: 0,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D { width, height };
        self.resized = true;
    }

    pub fn queue_extents_after_wait(&mut self, extents: &[(u32, u32)]) {
        self.pending
            .extend(extents.iter().map(|&(width, height)| vk::Extent2D { width, height }));
    }

    pub fn wait_count(&self) -> usize {
        self.waits
    }
}

impl SurfaceProvider for MockSurface {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized_flag(&mut self) {
        self.resized = false;
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        if let Some(extent) = self.pending.pop_front() {
            self.extent = extent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(chain: &mut MockChain<'_>) -> u32 {
        match chain.acquire_next_image().unwrap() {
            AcquireOutcome::Acquired { image_index, .. } => image_index,
            AcquireOutcome::OutOfDate => panic!("unexpected out-of-date"),
        }
    }

    #[test]
    fn test_mock_chain_waits_when_image_changes_slot() {
        let device = MockDevice::new();
        let mut chain = MockChain::create(&device, vk::Extent2D { width: 8, height: 8 }, None).unwrap();

        device.script_acquire(AcquireOutcome::Acquired { image_index: 0, suboptimal: false });
        device.script_acquire(AcquireOutcome::Acquired { image_index: 0, suboptimal: false });
        for _ in 0..2 {
            let image_index = acquire(&mut chain);
            chain.submit_command_buffers(&[], image_index).unwrap();
        }

        let submissions = device.submissions();
        assert_eq!(submissions[0].slot, 0);
        assert_eq!(submissions[0].waited_on, None);
        assert_eq!(submissions[1].slot, 1);
        assert_eq!(submissions[1].waited_on, Some(0));
    }
}
