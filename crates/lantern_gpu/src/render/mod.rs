//! Frame orchestration
//!
//! The [`Renderer`] drives acquire, record, submit and present against any
//! [`PresentationChain`], recreating the chain when the surface changes.
//! [`MeshRenderSystem`] records pipeline, descriptor and draw commands inside
//! the render pass it brackets.

pub mod chain;
pub mod renderer;
pub mod surface;
pub mod system;

pub use chain::{
    is_zero_extent, AcquireOutcome, ChainFormats, ChainSnapshot, PresentOutcome, PresentationChain,
    MAX_FRAMES_IN_FLIGHT,
};
pub use renderer::Renderer;
pub use surface::{SurfaceProvider, VulkanSurfaceSource};
pub use system::{MeshRenderSystem, PUSH_CONSTANT_STAGES};
