//! Framebuffers
//!
//! A native framebuffer is tied to a render pass, while the same attachment
//! set is usually used with several compatible render passes. The wrapper
//! therefore only stores attachments and dimensions and bakes one native
//! framebuffer per render pass on first request. Cache keys are the render
//! passes' registry IDs with a non-owning back-reference; entries whose
//! render pass died are pruned on the next lookup. Handles replaced by a
//! rebake may still be referenced by recorded command buffers, so they are
//! retired and only destroyed with the framebuffer.

use ash::vk;
use std::sync::{Arc, Mutex, Weak};

use crate::core::error::{api_error, ensure_contract, CrucibleResult};
use crate::core::mt::{lock_state, MtLock, MtSafety};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::FramebufferDesc;
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::render_pass::RenderPass;
use crate::resources::{impl_debug_named, raw, ImageView};

struct CacheEntry {
    render_pass_id: ObjectId,
    render_pass: Weak<RenderPass>,
    handle: vk::Framebuffer,
    dirty: bool,
}

struct FramebufferState {
    attachments: Vec<Arc<ImageView>>,
    cache: Vec<CacheEntry>,
    retired: Vec<vk::Framebuffer>,
}

/// Attachment set plus per-render-pass native framebuffers
pub struct Framebuffer {
    id: ObjectId,
    device: Arc<Device>,
    width: u32,
    height: u32,
    layers: u32,
    lock: MtLock,
    state: Mutex<FramebufferState>,
    label: DebugLabel,
    _registration: Registration,
}

impl Framebuffer {
    /// Create a framebuffer; no native object exists until first use
    pub fn create(
        device: &Arc<Device>,
        attachments: Vec<Arc<ImageView>>,
        width: u32,
        height: u32,
        layers: u32,
        mt_safety: MtSafety,
    ) -> CrucibleResult<Arc<Self>> {
        ensure_contract!(
            width > 0 && height > 0 && layers > 0,
            "framebuffer dimensions {}x{}x{} must be non-zero",
            width,
            height,
            layers
        );
        for view in &attachments {
            let (w, h) = view.image().extent();
            ensure_contract!(
                w >= width && h >= height,
                "attachment {} ({}x{}) is smaller than the framebuffer ({}x{})",
                view.id(),
                w,
                h,
                width,
                height
            );
        }

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                width,
                height,
                layers,
                lock: MtLock::new(device.resolve_mt_safety(mt_safety)),
                state: Mutex::new(FramebufferState {
                    attachments,
                    cache: Vec::new(),
                    retired: Vec::new(),
                }),
                label: DebugLabel::default(),
                _registration: Registration::new(ObjectKind::Framebuffer, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Layer count
    pub fn layers(&self) -> u32 {
        self.layers
    }

    /// Attachments in render pass attachment order
    pub fn attachments(&self) -> Vec<Arc<ImageView>> {
        lock_state(&self.state).attachments.clone()
    }

    /// Number of attachments
    pub fn n_attachments(&self) -> usize {
        lock_state(&self.state).attachments.len()
    }

    /// Number of native framebuffers currently cached
    pub fn n_cached(&self) -> usize {
        lock_state(&self.state).cache.len()
    }

    /// Swap attachment `index`; every cached native framebuffer is rebaked
    /// on its next request
    pub fn replace_attachment(&self, index: usize, view: Arc<ImageView>) -> CrucibleResult<()> {
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);
        ensure_contract!(
            index < state.attachments.len(),
            "attachment {} out of range ({} attachment(s))",
            index,
            state.attachments.len()
        );

        state.attachments[index] = view;
        for entry in &mut state.cache {
            entry.dirty = true;
        }
        Ok(())
    }

    /// Native framebuffer for `render_pass`, baking it if needed
    pub fn get_framebuffer(&self, render_pass: &Arc<RenderPass>) -> CrucibleResult<vk::Framebuffer> {
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);

        self.prune(&mut state);

        let position = state
            .cache
            .iter()
            .position(|entry| entry.render_pass_id == render_pass.id());
        if let Some(position) = position {
            let entry = &state.cache[position];
            if !entry.dirty {
                return Ok(entry.handle);
            }
            let stale = state.cache.remove(position);
            log::trace!("Framebuffer {}: retiring {:#x}", self.id, raw(stale.handle));
            state.retired.push(stale.handle);
        }

        let handle = self.bake(&state.attachments, render_pass)?;
        state.cache.push(CacheEntry {
            render_pass_id: render_pass.id(),
            render_pass: Arc::downgrade(render_pass),
            handle,
            dirty: false,
        });
        Ok(handle)
    }

    fn bake(&self, attachments: &[Arc<ImageView>], render_pass: &RenderPass) -> CrucibleResult<vk::Framebuffer> {
        let expected = &render_pass.desc().attachments;
        ensure_contract!(
            attachments.len() == expected.len(),
            "framebuffer {} has {} attachment(s), render pass {} expects {}",
            self.id,
            attachments.len(),
            render_pass.id(),
            expected.len()
        );
        for (index, (view, attachment)) in attachments.iter().zip(expected).enumerate() {
            let image = view.image();
            ensure_contract!(
                view.desc().format == attachment.format && image.desc().samples == attachment.samples,
                "attachment {} is {:?}/{:?}, render pass expects {:?}/{:?}",
                index,
                view.desc().format,
                image.desc().samples,
                attachment.format,
                attachment.samples
            );
        }

        let desc = FramebufferDesc {
            render_pass: render_pass.handle(),
            attachments: attachments.iter().map(|view| view.handle()).collect(),
            width: self.width,
            height: self.height,
            layers: self.layers,
        };
        let handle = self
            .device
            .native()
            .create_framebuffer(&desc)
            .map_err(|e| api_error("create_framebuffer", e))?;

        self.label.add_handle(vk::ObjectType::FRAMEBUFFER, raw(handle));
        self.label.apply_to(&self.device, vk::ObjectType::FRAMEBUFFER, raw(handle));
        log::debug!(
            "Framebuffer {} baked for render pass {} ({}x{}x{})",
            self.id,
            render_pass.id(),
            self.width,
            self.height,
            self.layers
        );
        Ok(handle)
    }

    fn prune(&self, state: &mut FramebufferState) {
        let (alive, dead): (Vec<_>, Vec<_>) = std::mem::take(&mut state.cache)
            .into_iter()
            .partition(|entry| entry.render_pass.strong_count() > 0);
        state.cache = alive;
        for entry in dead {
            log::trace!("Framebuffer {}: render pass {} gone", self.id, entry.render_pass_id);
            self.destroy_handle(entry.handle);
        }
    }

    fn destroy_handle(&self, handle: vk::Framebuffer) {
        self.label.remove_handle(raw(handle));
        self.device.native().destroy_framebuffer(handle);
    }
}

impl_debug_named!(Framebuffer);

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Framebuffer({}, {}x{}x{})", self.id, self.width, self.height, self.layers)
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        let state = lock_state(&self.state);
        let cached = state.cache.iter().map(|entry| entry.handle);
        for handle in cached.chain(state.retired.iter().copied()) {
            self.device.native().destroy_framebuffer(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;
    use crate::native::{HeadlessDevice, ImageDesc, NativeCall};
    use crate::render_pass::RenderPassCreateInfo;
    use crate::resources::Image;

    fn color_pass(device: &Arc<Device>) -> Arc<RenderPass> {
        let mut info = RenderPassCreateInfo::new(device);
        let color = info.add_color_attachment(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            false,
        );
        let subpass = info.add_subpass();
        info.add_subpass_color_attachment(subpass, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color, 0, None)
            .unwrap();
        RenderPass::create(&info, None).unwrap()
    }

    fn target(device: &Arc<Device>) -> Arc<ImageView> {
        let image = Image::create(
            device,
            ImageDesc::new_2d(
                vk::Format::R8G8B8A8_UNORM,
                64,
                64,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ),
        )
        .unwrap();
        ImageView::create_2d(&image).unwrap()
    }

    fn n_framebuffers_created(headless: &HeadlessDevice) -> usize {
        headless
            .calls()
            .iter()
            .filter(|call| matches!(call, NativeCall::CreateFramebuffer(_)))
            .count()
    }

    #[test]
    fn test_framebuffer_is_baked_once_per_render_pass() {
        let headless = Arc::new(HeadlessDevice::new());
        let device = Device::create(headless.clone(), FrameworkConfig::default()).unwrap();
        let pass = color_pass(&device);
        let framebuffer =
            Framebuffer::create(&device, vec![target(&device)], 64, 64, 1, MtSafety::InheritFromParent).unwrap();

        assert_eq!(n_framebuffers_created(&headless), 0);
        let first = framebuffer.get_framebuffer(&pass).unwrap();
        let second = framebuffer.get_framebuffer(&pass).unwrap();
        assert_eq!(first, second);
        assert_eq!(n_framebuffers_created(&headless), 1);

        let other_pass = color_pass(&device);
        assert_ne!(framebuffer.get_framebuffer(&other_pass).unwrap(), first);
        assert_eq!(framebuffer.n_cached(), 2);
    }

    #[test]
    fn test_replacing_an_attachment_rebakes() {
        let headless = Arc::new(HeadlessDevice::new());
        let device = Device::create(headless.clone(), FrameworkConfig::default()).unwrap();
        let pass = color_pass(&device);
        let framebuffer =
            Framebuffer::create(&device, vec![target(&device)], 64, 64, 1, MtSafety::InheritFromParent).unwrap();

        framebuffer.get_framebuffer(&pass).unwrap();
        framebuffer.replace_attachment(0, target(&device)).unwrap();
        framebuffer.get_framebuffer(&pass).unwrap();
        assert_eq!(n_framebuffers_created(&headless), 2);
        assert_eq!(framebuffer.n_cached(), 1);
    }

    #[test]
    fn test_rebaked_handles_live_until_drop() {
        let headless = Arc::new(HeadlessDevice::new());
        let device = Device::create(headless.clone(), FrameworkConfig::default()).unwrap();
        let pass = color_pass(&device);
        let framebuffer =
            Framebuffer::create(&device, vec![target(&device)], 64, 64, 1, MtSafety::InheritFromParent).unwrap();
        let n_destroyed = || {
            headless
                .calls()
                .iter()
                .filter(|call| matches!(call, NativeCall::DestroyFramebuffer(_)))
                .count()
        };

        let old = framebuffer.get_framebuffer(&pass).unwrap();
        framebuffer.replace_attachment(0, target(&device)).unwrap();
        assert_ne!(framebuffer.get_framebuffer(&pass).unwrap(), old);
        assert_eq!(n_destroyed(), 0);

        drop(framebuffer);
        assert_eq!(n_destroyed(), 2);
    }

    #[test]
    fn test_dead_render_passes_are_pruned() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let framebuffer =
            Framebuffer::create(&device, vec![target(&device)], 64, 64, 1, MtSafety::InheritFromParent).unwrap();

        let pass = color_pass(&device);
        framebuffer.get_framebuffer(&pass).unwrap();
        drop(pass);

        let survivor = color_pass(&device);
        framebuffer.get_framebuffer(&survivor).unwrap();
        assert_eq!(framebuffer.n_cached(), 1);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_attachment_count_mismatch_is_rejected() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let pass = color_pass(&device);
        let framebuffer = Framebuffer::create(
            &device,
            vec![target(&device), target(&device)],
            64,
            64,
            1,
            MtSafety::InheritFromParent,
        )
        .unwrap();
        assert!(framebuffer.get_framebuffer(&pass).unwrap_err().is_contract_violation());
    }
}
