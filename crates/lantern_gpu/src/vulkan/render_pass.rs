//! Presentation render pass
//!
//! A single graphics subpass writes the swapchain image at
//! [`COLOR_ATTACHMENT`] and the depth buffer at [`DEPTH_ATTACHMENT`]. The
//! attachment and dependency state comes from plain functions of the chain's
//! [`ChainFormats`], so two passes built from equal formats are compatible.

use ash::vk;

use super::{VulkanError, VulkanResult};
use crate::render::ChainFormats;

/// Attachment index of the swapchain image
pub const COLOR_ATTACHMENT: u32 = 0;

/// Attachment index of the depth buffer
pub const DEPTH_ATTACHMENT: u32 = 1;

/// Color then depth, both cleared on load
///
/// Color is stored and handed to the presentation engine; depth is discarded.
pub fn presentation_attachments(formats: &ChainFormats) -> [vk::AttachmentDescription; 2] {
    let cleared = |format| vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::DONT_CARE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        ..Default::default()
    };

    [
        vk::AttachmentDescription {
            store_op: vk::AttachmentStoreOp::STORE,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..cleared(formats.image_format)
        },
        vk::AttachmentDescription {
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..cleared(formats.depth_format)
        },
    ]
}

/// External dependency ordering this frame's attachment writes after earlier
/// color output and depth tests on the same images
pub fn presentation_dependency() -> vk::SubpassDependency {
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: stages,
        dst_stage_mask: stages,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ..Default::default()
    }
}

/// Presentation render pass, destroyed on drop
pub struct RenderPass {
    device: ash::Device,
    render_pass: vk::RenderPass,
    formats: ChainFormats,
}

impl RenderPass {
    /// Build the pass for a chain with `formats`
    pub fn presentation(device: ash::Device, formats: ChainFormats) -> VulkanResult<Self> {
        let attachments = presentation_attachments(&formats);

        let color_refs = [vk::AttachmentReference {
            attachment: COLOR_ATTACHMENT,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: DEPTH_ATTACHMENT,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
            .build()];
        let dependencies = [presentation_dependency()];

        let create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            device.create_render_pass(&create_info, None)
                .map_err(VulkanError::Api)?
        };
        log::debug!(
            "Created presentation pass: color {:?}, depth {:?}",
            formats.image_format,
            formats.depth_format
        );

        Ok(Self {
            device,
            render_pass,
            formats,
        })
    }

    /// Render pass handle
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Formats the pass was built for
    pub fn formats(&self) -> ChainFormats {
        self.formats
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMATS: ChainFormats = ChainFormats {
        image_format: vk::Format::B8G8R8A8_SRGB,
        depth_format: vk::Format::D24_UNORM_S8_UINT,
    };

    #[test]
    fn test_color_attachment_ends_presentable() {
        let color = presentation_attachments(&FORMATS)[COLOR_ATTACHMENT as usize];
        assert_eq!(color.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(color.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(color.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(color.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(color.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_depth_attachment_is_discarded() {
        let depth = presentation_attachments(&FORMATS)[DEPTH_ATTACHMENT as usize];
        assert_eq!(depth.format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(depth.stencil_store_op, vk::AttachmentStoreOp::DONT_CARE);
        assert_eq!(depth.final_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn test_only_formats_vary_with_the_chain() {
        let other = ChainFormats {
            image_format: vk::Format::R8G8B8A8_UNORM,
            depth_format: vk::Format::D32_SFLOAT,
        };
        let first = presentation_attachments(&FORMATS);
        let second = presentation_attachments(&other);

        assert_eq!(second[0].format, other.image_format);
        assert_eq!(second[1].format, other.depth_format);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!((a.load_op, a.store_op, a.final_layout), (b.load_op, b.store_op, b.final_layout));
        }
    }

    #[test]
    fn test_dependency_waits_on_attachment_stages() {
        let dependency = presentation_dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert!(dependency.dst_stage_mask.contains(vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS));
        assert!(dependency
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
    }
}
