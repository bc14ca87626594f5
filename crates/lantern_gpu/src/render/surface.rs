//! What the renderer needs from the window it presents to

use ash::vk;

use crate::vulkan::VulkanResult;

/// Drawable-area queries and event waiting used during chain recreation
pub trait SurfaceProvider {
    /// Current drawable extent in pixels; zero while minimized
    fn extent(&self) -> vk::Extent2D;

    /// Whether the drawable area changed since the flag was last reset
    fn was_resized(&self) -> bool;

    /// Clear the resize flag
    fn reset_resized_flag(&mut self);

    /// Block until at least one window event arrives
    fn wait_events(&mut self);
}

/// Platform hooks needed to create a Vulkan instance and surface
pub trait VulkanSurfaceSource {
    /// Instance extensions the platform surface requires
    fn required_instance_extensions(&self) -> VulkanResult<Vec<String>>;

    /// Create a presentation surface for `instance`
    fn create_surface(&mut self, instance: vk::Instance) -> VulkanResult<vk::SurfaceKHR>;
}
