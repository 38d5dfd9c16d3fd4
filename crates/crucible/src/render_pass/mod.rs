//! Render passes
//!
//! [`RenderPassCreateInfo`] is the mutable builder; [`RenderPass`] is the
//! immutable baked object. A render pass may remember the swapchain it
//! renders to, which lets the pipeline manager size default viewports.

mod builder;

pub use builder::{
    AttachmentId, AttachmentKind, AttachmentProperties, RenderPassCreateInfo, SubpassAttachment,
    SubpassAttachmentKind, SubpassId,
};

use ash::vk;
use std::sync::{Arc, Weak};

use crate::core::error::{api_error, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::RenderPassDesc;
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::resources::impl_debug_named;
use crate::swapchain::Swapchain;

/// Baked render pass
pub struct RenderPass {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::RenderPass,
    info: RenderPassCreateInfo,
    desc: RenderPassDesc,
    swapchain: Option<Weak<Swapchain>>,
    label: DebugLabel,
    _registration: Registration,
}

impl RenderPass {
    /// Bake `info`; the builder stays usable afterwards
    pub fn create(info: &RenderPassCreateInfo, swapchain: Option<&Arc<Swapchain>>) -> CrucibleResult<Arc<Self>> {
        let device = Arc::clone(info.device());
        let desc = info.to_native_desc()?;
        let handle = device
            .native()
            .create_render_pass(&desc)
            .map_err(|e| api_error("create_render_pass", e))?;

        log::debug!(
            "Render pass baked: {} attachment(s), {} subpass(es), {} dependency(ies)",
            desc.attachments.len(),
            desc.subpasses.len(),
            desc.dependencies.len()
        );

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device,
                handle,
                info: info.clone(),
                desc,
                swapchain: swapchain.map(Arc::downgrade),
                label: DebugLabel::for_handle(vk::ObjectType::RENDER_PASS, crate::resources::raw(handle)),
                _registration: Registration::new(ObjectKind::RenderPass, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Device the render pass lives on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Builder state at bake time
    pub fn create_info(&self) -> &RenderPassCreateInfo {
        &self.info
    }

    /// Descriptor handed to the driver
    pub fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    /// Number of subpasses
    pub fn n_subpasses(&self) -> u32 {
        self.desc.subpasses.len() as u32
    }

    /// Swapchain the render pass targets, if it is still alive
    pub fn swapchain(&self) -> Option<Arc<Swapchain>> {
        self.swapchain.as_ref().and_then(Weak::upgrade)
    }

    /// Whether framebuffers and pipelines of `self` may be used with `other`
    ///
    /// Compatibility ignores load/store ops and layouts.
    pub fn is_compatible_with(&self, other: &RenderPass) -> bool {
        let a = &self.desc;
        let b = &other.desc;
        a.attachments.len() == b.attachments.len()
            && a.attachments
                .iter()
                .zip(&b.attachments)
                .all(|(x, y)| x.format == y.format && x.samples == y.samples)
            && a.subpasses.len() == b.subpasses.len()
            && a.subpasses.iter().zip(&b.subpasses).all(|(x, y)| {
                let ids = |refs: &[crate::native::AttachmentRefDesc]| {
                    refs.iter().map(|r| r.attachment).collect::<Vec<_>>()
                };
                ids(&x.color_attachments) == ids(&y.color_attachments)
                    && ids(&x.input_attachments) == ids(&y.input_attachments)
                    && ids(&x.resolve_attachments) == ids(&y.resolve_attachments)
                    && x.depth_stencil_attachment.map(|r| r.attachment)
                        == y.depth_stencil_attachment.map(|r| r.attachment)
                    && x.view_mask == y.view_mask
            })
    }
}

impl_debug_named!(RenderPass);

impl std::fmt::Debug for RenderPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("subpasses", &self.desc.subpasses.len())
            .finish()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.device.native().destroy_render_pass(self.handle);
        log::trace!("Render pass {} destroyed", self.id);
    }
}
