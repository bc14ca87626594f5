//! Frame orchestration over a presentation chain
//!
//! [`Renderer`] brackets each frame: `begin_frame` acquires an image and
//! starts the slot's command buffer, `begin_render_pass`/`end_render_pass`
//! bracket drawing into the acquired image, and `end_frame` submits, presents
//! and rebuilds the chain when the surface no longer matches it.
//!
//! Call order is enforced at runtime; out-of-order calls return
//! [`VulkanError::InvalidOperation`].

use ash::vk;

use super::chain::{
    is_zero_extent, AcquireOutcome, ChainSnapshot, PresentOutcome, PresentationChain, MAX_FRAMES_IN_FLIGHT,
};
use super::surface::SurfaceProvider;
use crate::config::RendererConfig;
use crate::vulkan::{GpuDevice, RenderPassBegin, VulkanError, VulkanResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Recording,
    InRenderPass,
}

/// Frame orchestrator owning the presentation chain and per-slot command buffers
pub struct Renderer<'d, C: PresentationChain<'d>> {
    device: &'d C::Device,
    chain: C,
    command_buffers: Vec<vk::CommandBuffer>,
    state: FrameState,
    frame_index: usize,
    image_index: u32,
    clear_color: [f32; 4],
    clear_depth: f32,
}

impl<'d, C: PresentationChain<'d>> Renderer<'d, C> {
    /// Create the initial chain and one command buffer per frame slot
    ///
    /// Blocks on window events while the drawable area is zero.
    pub fn new<S: SurfaceProvider>(
        device: &'d C::Device,
        surface: &mut S,
        config: &RendererConfig,
    ) -> VulkanResult<Self> {
        let chain: C = create_chain(device, surface, None)?;
        let extent = chain.extent();
        let command_buffers = device.allocate_command_buffers(MAX_FRAMES_IN_FLIGHT as u32)?;

        log::info!(
            "Renderer ready: {}x{}, {} images, {} frames in flight",
            extent.width,
            extent.height,
            chain.image_count(),
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            device,
            chain,
            command_buffers,
            state: FrameState::Idle,
            frame_index: 0,
            image_index: 0,
            clear_color: config.clear_color,
            clear_depth: config.clear_depth,
        })
    }

    /// Acquire the next image and start recording
    ///
    /// Returns `Ok(None)` when the chain was out of date; it has been rebuilt
    /// and the caller should skip this frame.
    pub fn begin_frame<S: SurfaceProvider>(&mut self, surface: &mut S) -> VulkanResult<Option<vk::CommandBuffer>> {
        if self.state != FrameState::Idle {
            return Err(VulkanError::invalid("Can't call begin_frame while already in progress"));
        }

        match self.chain.acquire_next_image()? {
            AcquireOutcome::OutOfDate => {
                log::warn!("Swapchain out of date on acquire, recreating");
                self.recreate_swapchain(surface)?;
                Ok(None)
            }
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", image_index);
                }

                let command_buffer = self.command_buffers[self.frame_index];
                self.device.begin_command_buffer(command_buffer)?;

                self.image_index = image_index;
                self.state = FrameState::Recording;
                Ok(Some(command_buffer))
            }
        }
    }

    /// Finish recording, submit and present, then advance the frame slot
    ///
    /// Rebuilds the chain when presentation reports it out of date or
    /// suboptimal, or when the surface was resized.
    pub fn end_frame<S: SurfaceProvider>(&mut self, surface: &mut S) -> VulkanResult<()> {
        match self.state {
            FrameState::Idle => {
                return Err(VulkanError::invalid("Can't call end_frame while frame is not in progress"));
            }
            FrameState::InRenderPass => {
                return Err(VulkanError::invalid("Can't call end_frame while the render pass is active"));
            }
            FrameState::Recording => {}
        }

        let command_buffer = self.command_buffers[self.frame_index];
        self.device.end_command_buffer(command_buffer)?;
        let outcome = self.chain.submit_command_buffers(&[command_buffer], self.image_index)?;

        self.state = FrameState::Idle;
        self.frame_index = (self.frame_index + 1) % MAX_FRAMES_IN_FLIGHT;

        let resized = surface.was_resized();
        if outcome.needs_recreation() || resized {
            match outcome {
                PresentOutcome::OutOfDate => log::warn!("Swapchain out of date on present, recreating"),
                PresentOutcome::Suboptimal => log::warn!("Swapchain suboptimal on present, recreating"),
                PresentOutcome::Presented => log::debug!("Surface resized, recreating swapchain"),
            }
            surface.reset_resized_flag();
            self.recreate_swapchain(surface)?;
        }

        Ok(())
    }

    /// Begin the chain's render pass on the acquired image
    pub fn begin_render_pass(&mut self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        match self.state {
            FrameState::Idle => {
                return Err(VulkanError::invalid("Can't begin render pass when frame not in progress"));
            }
            FrameState::InRenderPass => {
                return Err(VulkanError::invalid("Render pass already active"));
            }
            FrameState::Recording => {}
        }
        self.check_current(command_buffer, "begin render pass")?;

        let begin = RenderPassBegin {
            render_pass: self.chain.render_pass(),
            framebuffer: self.chain.framebuffer(self.image_index)?,
            extent: self.chain.extent(),
            clear_color: self.clear_color,
            clear_depth: self.clear_depth,
        };
        self.device.cmd_begin_render_pass(command_buffer, &begin);

        self.state = FrameState::InRenderPass;
        Ok(())
    }

    /// End the render pass started by [`Renderer::begin_render_pass`]
    pub fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        if self.state != FrameState::InRenderPass {
            return Err(VulkanError::invalid("Can't end render pass that was not begun"));
        }
        self.check_current(command_buffer, "end render pass")?;

        self.device.cmd_end_render_pass(command_buffer);
        self.state = FrameState::Recording;
        Ok(())
    }

    /// Rebuild the chain for the surface's current extent
    ///
    /// Waits for the device to go idle, then for window events while the
    /// surface has no drawable area, before replacing the chain. Fails if the
    /// image or depth format changes.
    pub fn recreate_swapchain<S: SurfaceProvider>(&mut self, surface: &mut S) -> VulkanResult<()> {
        self.device.wait_idle()?;

        let previous = self.chain.snapshot();
        let chain: C = create_chain(self.device, surface, Some(&previous))?;
        previous.formats.ensure_compatible(&chain.formats())?;
        self.chain = chain;

        let extent = self.chain.extent();
        log::info!(
            "Recreated swapchain: {}x{} -> {}x{}",
            previous.extent.width,
            previous.extent.height,
            extent.width,
            extent.height
        );
        Ok(())
    }

    /// Whether a frame is between `begin_frame` and `end_frame`
    pub fn is_frame_in_progress(&self) -> bool {
        self.state != FrameState::Idle
    }

    /// Command buffer of the frame in progress
    pub fn current_command_buffer(&self) -> VulkanResult<vk::CommandBuffer> {
        if !self.is_frame_in_progress() {
            return Err(VulkanError::invalid("Cannot get command buffer when frame not in progress"));
        }
        Ok(self.command_buffers[self.frame_index])
    }

    /// Slot of the frame in progress, in `0..MAX_FRAMES_IN_FLIGHT`
    pub fn frame_index(&self) -> VulkanResult<usize> {
        if !self.is_frame_in_progress() {
            return Err(VulkanError::invalid("Cannot get frame index when frame not in progress"));
        }
        Ok(self.frame_index)
    }

    /// Render pass pipelines must be compatible with
    pub fn swapchain_render_pass(&self) -> vk::RenderPass {
        self.chain.render_pass()
    }

    /// Current chain extent
    pub fn extent(&self) -> vk::Extent2D {
        self.chain.extent()
    }

    /// Width over height of the current chain
    pub fn aspect_ratio(&self) -> f32 {
        self.chain.extent_aspect_ratio()
    }

    /// The presentation chain
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// Change the color used to clear each frame
    pub fn set_clear_color(&mut self, clear_color: [f32; 4]) {
        self.clear_color = clear_color;
    }

    fn check_current(&self, command_buffer: vk::CommandBuffer, action: &str) -> VulkanResult<()> {
        if command_buffer != self.command_buffers[self.frame_index] {
            return Err(VulkanError::invalid(format!(
                "Can't {} on command buffer from a different frame",
                action
            )));
        }
        Ok(())
    }
}

impl<'d, C: PresentationChain<'d>> Drop for Renderer<'d, C> {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::warn!("Device wait failed while dropping renderer: {}", err);
        }
        self.device.free_command_buffers(&self.command_buffers);
    }
}

/// Create a chain, waiting out a surface that has no drawable area
///
/// The window and the surface are queried separately, so creation can still
/// find a zero extent after the window reported a usable one.
fn create_chain<'d, C, S>(device: &'d C::Device, surface: &mut S, previous: Option<&ChainSnapshot>) -> VulkanResult<C>
where
    C: PresentationChain<'d>,
    S: SurfaceProvider,
{
    loop {
        let extent = wait_for_drawable_extent(surface);
        match C::create(device, extent, previous) {
            Err(VulkanError::SurfaceUnavailable { width, height }) => {
                log::debug!("Surface shrank to {}x{} during chain creation, waiting", width, height);
                surface.wait_events();
            }
            result => return result,
        }
    }
}

fn wait_for_drawable_extent<S: SurfaceProvider>(surface: &mut S) -> vk::Extent2D {
    let mut extent = surface.extent();
    if is_zero_extent(extent) {
        log::debug!("Drawable area is {}x{}, waiting for events", extent.width, extent.height);
    }
    while is_zero_extent(extent) {
        surface.wait_events();
        extent = surface.extent();
    }
    extent
}
