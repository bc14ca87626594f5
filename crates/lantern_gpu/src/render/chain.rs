//! Presentation chain contract consumed by the frame orchestrator

use ash::vk;

use crate::vulkan::{GpuDevice, VulkanError, VulkanResult};

/// Number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Formats a chain committed to at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainFormats {
    /// Format of the presentable color images
    pub image_format: vk::Format,
    /// Format of the per-image depth attachments
    pub depth_format: vk::Format,
}

impl ChainFormats {
    /// Fail unless `current` keeps both formats of `self`
    ///
    /// Pipelines are built against these formats, so a change across
    /// recreation is fatal.
    pub fn ensure_compatible(&self, current: &ChainFormats) -> VulkanResult<()> {
        if self == current {
            Ok(())
        } else {
            Err(VulkanError::IncompatibleSwapchain {
                previous: *self,
                current: *current,
            })
        }
    }
}

/// What a retiring chain hands to its replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSnapshot {
    /// Formats the replacement must keep
    pub formats: ChainFormats,
    /// Extent of the retiring chain
    pub extent: vk::Extent2D,
    /// Raw handle passed as `oldSwapchain`; null when there is none
    pub handle: vk::SwapchainKHR,
}

/// Result of asking the chain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image is ready to be rendered into
    Acquired {
        /// Index of the acquired image
        image_index: u32,
        /// The chain still works but no longer matches the surface exactly
        suboptimal: bool,
    },
    /// The chain no longer matches the surface and must be recreated
    OutOfDate,
}

/// Result of presenting a submitted image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the chain should be recreated
    Suboptimal,
    /// Not presented; the chain must be recreated
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the chain should be rebuilt before the next frame
    pub fn needs_recreation(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Swapchain images with their attachments, render pass and frame-slot sync
///
/// Implementations own [`MAX_FRAMES_IN_FLIGHT`] frame slots and advance their
/// own slot after every submission. Dropping a chain waits for work that
/// still references it.
pub trait PresentationChain<'d>: Sized {
    /// Device the chain is created from
    type Device: GpuDevice + ?Sized + 'd;

    /// Build a chain of `extent`
    ///
    /// Fails with [`VulkanError::SurfaceUnavailable`]
    /// when `extent` or the surface itself has a zero dimension, and when
    /// `previous` declares formats the new chain cannot keep.
    fn create(device: &'d Self::Device, extent: vk::Extent2D, previous: Option<&ChainSnapshot>) -> VulkanResult<Self>;

    /// Capture what a replacement chain needs from this one
    fn snapshot(&self) -> ChainSnapshot;

    /// Image and depth formats
    fn formats(&self) -> ChainFormats;

    /// Image extent
    fn extent(&self) -> vk::Extent2D;

    /// Number of presentable images
    fn image_count(&self) -> usize;

    /// Render pass every framebuffer is compatible with
    fn render_pass(&self) -> vk::RenderPass;

    /// Framebuffer of image `image_index`
    fn framebuffer(&self, image_index: u32) -> VulkanResult<vk::Framebuffer>;

    /// Wait for the current slot's fence, then acquire the next image
    fn acquire_next_image(&mut self) -> VulkanResult<AcquireOutcome>;

    /// Submit recorded work for `image_index`, present it and advance the slot
    fn submit_command_buffers(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
        image_index: u32,
    ) -> VulkanResult<PresentOutcome>;

    /// Width over height
    fn extent_aspect_ratio(&self) -> f32 {
        let extent = self.extent();
        extent.width as f32 / extent.height as f32
    }
}

/// Whether either dimension is zero (e.g. a minimized window)
pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRGB: ChainFormats = ChainFormats {
        image_format: vk::Format::B8G8R8A8_SRGB,
        depth_format: vk::Format::D32_SFLOAT,
    };

    #[test]
    fn test_same_formats_are_compatible() {
        assert!(SRGB.ensure_compatible(&SRGB).is_ok());
    }

    #[test]
    fn test_depth_change_is_incompatible() {
        let changed = ChainFormats {
            depth_format: vk::Format::D24_UNORM_S8_UINT,
            ..SRGB
        };
        assert!(matches!(
            SRGB.ensure_compatible(&changed),
            Err(VulkanError::IncompatibleSwapchain { .. })
        ));
    }

    #[test]
    fn test_present_outcome_recreation() {
        assert!(!PresentOutcome::Presented.needs_recreation());
        assert!(PresentOutcome::Suboptimal.needs_recreation());
        assert!(PresentOutcome::OutOfDate.needs_recreation());
    }

    #[test]
    fn test_zero_extent() {
        assert!(is_zero_extent(vk::Extent2D { width: 0, height: 600 }));
        assert!(is_zero_extent(vk::Extent2D { width: 800, height: 0 }));
        assert!(!is_zero_extent(vk::Extent2D { width: 1, height: 1 }));
    }
}
