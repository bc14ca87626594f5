//! Vulkan swapchain with per-image attachments and frame-slot synchronization
//!
//! A [`SwapChain`] owns the presentable images, one color view, depth buffer
//! and framebuffer per image, the render pass they share, and
//! [`MAX_FRAMES_IN_FLIGHT`] slots of semaphores and fences. Recreation builds
//! a new chain from the old chain's [`ChainSnapshot`] while the old one is
//! still alive, so the driver can hand resources over through `oldSwapchain`.

use ash::vk;

use super::framebuffer::{DepthBuffer, Framebuffer, ImageView};
use super::render_pass::RenderPass;
use super::sync::{FrameSync, ImageSlotTracker};
use super::{Device, VulkanError, VulkanResult};
use crate::render::{
    is_zero_extent, AcquireOutcome, ChainFormats, ChainSnapshot, PresentOutcome, PresentationChain,
    MAX_FRAMES_IN_FLIGHT,
};

/// Preferred color format, falling back to whatever the surface lists first
pub fn choose_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .find(|sf| sf.format == vk::Format::B8G8R8A8_SRGB && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| available.first())
        .copied()
}

/// Mailbox when offered, otherwise FIFO, which every device supports
pub fn choose_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    available
        .iter()
        .copied()
        .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent, or the window extent clamped to the surface limits
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when the surface has one
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Swapchain images, their attachments and frame slots
pub struct SwapChain<'d> {
    device: &'d Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<ImageView>,
    depth_buffers: Vec<DepthBuffer>,
    framebuffers: Vec<Framebuffer>,
    render_pass: RenderPass,
    frame_sync: Vec<FrameSync>,
    image_slots: ImageSlotTracker,
    formats: ChainFormats,
    extent: vk::Extent2D,
    current_frame: usize,
}

impl<'d> SwapChain<'d> {
    /// Build a chain for `window_extent`, retiring `previous` if given
    pub fn new(device: &'d Device, window_extent: vk::Extent2D, previous: Option<&ChainSnapshot>) -> VulkanResult<Self> {
        if is_zero_extent(window_extent) {
            return Err(VulkanError::surface_unavailable(window_extent));
        }

        let support = device.swapchain_support()?;
        let surface_format = choose_surface_format(&support.formats)
            .ok_or_else(|| VulkanError::InitializationFailed("Surface offers no formats".to_string()))?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, window_extent);
        let image_count = choose_image_count(&support.capabilities);

        // The surface can shrink to nothing between the window query and this one
        if is_zero_extent(extent) {
            return Err(VulkanError::surface_unavailable(extent));
        }

        let formats = ChainFormats {
            image_format: surface_format.format,
            depth_format: device.find_depth_format()?,
        };
        if let Some(previous) = previous {
            previous.formats.ensure_compatible(&formats)?;
        }

        let render_pass = RenderPass::presentation(device.raw().clone(), formats)?;

        let frame_sync = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(device.raw().clone()))
            .collect::<VulkanResult<Vec<_>>>()?;

        let families = device.queue_families();
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, shared_families): (vk::SharingMode, &[u32]) = if families.graphics != families.present {
            (vk::SharingMode::CONCURRENT, &family_indices)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        };

        let old_swapchain = previous.map_or(vk::SwapchainKHR::null(), |snapshot| snapshot.handle);

        let swapchain_create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe {
            device.swapchain_loader()
                .create_swapchain(&swapchain_create_info, None)
                .map_err(VulkanError::Api)?
        };

        // From here on Drop releases whatever has been created
        let mut chain = Self {
            device,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            depth_buffers: Vec::new(),
            framebuffers: Vec::new(),
            render_pass,
            frame_sync,
            image_slots: ImageSlotTracker::new(0),
            formats,
            extent,
            current_frame: 0,
        };
        chain.create_attachments()?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            chain.images.len(),
            formats.image_format,
            present_mode
        );

        Ok(chain)
    }

    fn create_attachments(&mut self) -> VulkanResult<()> {
        let device = self.device;
        self.images = unsafe {
            device.swapchain_loader()
                .get_swapchain_images(self.swapchain)
                .map_err(VulkanError::Api)?
        };
        self.image_slots = ImageSlotTracker::new(self.images.len());

        for &image in &self.images {
            let view = ImageView::new(
                device.raw().clone(),
                image,
                self.formats.image_format,
                vk::ImageAspectFlags::COLOR,
            )?;
            let depth = DepthBuffer::new(device, self.formats.depth_format, self.extent)?;
            let framebuffer = Framebuffer::new(
                device.raw().clone(),
                self.render_pass.handle(),
                &[view.handle(), depth.view()],
                self.extent,
            )?;

            self.image_views.push(view);
            self.depth_buffers.push(depth);
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.extent.width
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.extent.height
    }

    /// Color view of image `image_index`
    pub fn image_view(&self, image_index: usize) -> Option<vk::ImageView> {
        self.image_views.get(image_index).map(ImageView::handle)
    }

    /// Presentable image format
    pub fn image_format(&self) -> vk::Format {
        self.formats.image_format
    }

    /// Depth attachment format
    pub fn depth_format(&self) -> vk::Format {
        self.formats.depth_format
    }

    /// Raw swapchain handle
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    fn present(&self, image_index: u32) -> VulkanResult<PresentOutcome> {
        let wait_semaphores = [self.frame_sync[self.current_frame].render_finished.handle()];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.device.swapchain_loader()
                .queue_present(self.device.present_queue(), &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }
}

impl<'d> PresentationChain<'d> for SwapChain<'d> {
    type Device = Device;

    fn create(device: &'d Device, extent: vk::Extent2D, previous: Option<&ChainSnapshot>) -> VulkanResult<Self> {
        Self::new(device, extent, previous)
    }

    fn snapshot(&self) -> ChainSnapshot {
        ChainSnapshot {
            formats: self.formats,
            extent: self.extent,
            handle: self.swapchain,
        }
    }

    fn formats(&self) -> ChainFormats {
        self.formats
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass.handle()
    }

    fn framebuffer(&self, image_index: u32) -> VulkanResult<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .map(Framebuffer::handle)
            .ok_or_else(|| VulkanError::invalid(format!("No framebuffer for image {}", image_index)))
    }

    fn acquire_next_image(&mut self) -> VulkanResult<AcquireOutcome> {
        let sync = &self.frame_sync[self.current_frame];
        sync.in_flight.wait(u64::MAX)?;

        let result = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available.handle(),
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(VulkanError::Api(e)),
        }
    }

    fn submit_command_buffers(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        image_index: u32,
    ) -> VulkanResult<PresentOutcome> {
        if let Some(previous_slot) = self.image_slots.claim(image_index as usize, self.current_frame)? {
            self.frame_sync[previous_slot].in_flight.wait(u64::MAX)?;
        }

        let sync = &self.frame_sync[self.current_frame];
        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished.handle()];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        sync.in_flight.reset()?;
        unsafe {
            self.device.raw()
                .queue_submit(self.device.graphics_queue(), &[submit_info], sync.in_flight.handle())
                .map_err(VulkanError::Api)?;
        }

        let outcome = self.present(image_index)?;
        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(outcome)
    }
}

impl Drop for SwapChain<'_> {
    fn drop(&mut self) {
        for sync in &self.frame_sync {
            if let Err(e) = sync.in_flight.wait(u64::MAX) {
                log::warn!("Failed to wait for frame fence during swapchain teardown: {}", e);
            }
        }

        // Views of swapchain images go before the swapchain itself
        self.framebuffers.clear();
        self.depth_buffers.clear();
        self.image_views.clear();

        unsafe {
            self.device.swapchain_loader().destroy_swapchain(self.swapchain, None);
        }
        log::debug!("Destroyed swapchain {}x{}", self.extent.width, self.extent.height);
    }
}
