//! Error types shared by every Vulkan-facing component

use ash::vk;
use thiserror::Error;

use crate::render::ChainFormats;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Vulkan context initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// None of the candidate formats support the requested tiling features
    #[error("No supported format among candidates for {tiling:?} tiling with {features:?}")]
    UnsupportedFormat {
        /// Tiling mode that was queried
        tiling: vk::ImageTiling,
        /// Features every candidate was checked for
        features: vk::FormatFeatureFlags,
    },

    /// Host access requested on memory that is not host visible
    #[error("Memory is not host visible (allocated with {0:?})")]
    NotHostVisible(vk::MemoryPropertyFlags),

    /// A descriptor binding slot was registered twice
    #[error("Descriptor binding {0} is already registered")]
    DuplicateBinding(u32),

    /// A write targeted a binding the layout does not declare
    #[error("Descriptor layout has no binding {0}")]
    UnknownBinding(u32),

    /// A single-descriptor write targeted an array binding
    #[error("Descriptor binding {binding} declares {count} descriptors, expected exactly one")]
    ArrayBinding {
        /// Binding slot
        binding: u32,
        /// Declared descriptor count
        count: u32,
    },

    /// A descriptor pool cannot satisfy an allocation
    #[error("Descriptor pool exhausted: {reason}")]
    PoolExhausted {
        /// Which limit was hit
        reason: String,
    },

    /// The surface has no drawable area right now, e.g. mid-minimize
    ///
    /// Transient; the renderer waits for window events and retries.
    #[error("Surface has no drawable area ({width}x{height})")]
    SurfaceUnavailable {
        /// Reported width
        width: u32,
        /// Reported height
        height: u32,
    },

    /// Image or depth format changed across swapchain recreation
    #[error("Swap chain image (or depth) format has changed: {previous:?} -> {current:?}")]
    IncompatibleSwapchain {
        /// Formats of the retired chain
        previous: ChainFormats,
        /// Formats of the replacement chain
        current: ChainFormats,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

impl VulkanError {
    /// Shorthand for [`VulkanError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }

    /// [`VulkanError::SurfaceUnavailable`] for `extent`
    pub fn surface_unavailable(extent: vk::Extent2D) -> Self {
        Self::SurfaceUnavailable {
            width: extent.width,
            height: extent.height,
        }
    }
}

