//! Render pass builder
//!
//! Collects attachments, subpasses and dependencies host-side, then lowers
//! them to a [`RenderPassDesc`] at bake time. Subpass attachment slots are
//! sparse (keyed by location) while building and become dense arrays padded
//! with `VK_ATTACHMENT_UNUSED` when lowered.
//!
//! Preserve attachments are never set by hand. They are derived on the first
//! query that needs them after a mutation: an attachment used by subpass S1
//! and a later subpass S2 is preserved by every subpass strictly between them
//! that does not use it. Color, depth-stencil and resolve slots count as uses;
//! input attachments do not.

use ash::vk;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use crate::core::error::{contract_violation, ensure_contract, CrucibleError, CrucibleResult};
use crate::device::Device;
use crate::native::{
    AttachmentDesc, AttachmentRefDesc, DependencyDesc, DepthStencilResolveDesc, RenderPassDesc, SubpassDesc,
};

/// Dense index of an attachment, in add order
pub type AttachmentId = u32;
/// Dense index of a subpass, in add order
pub type SubpassId = u32;

/// Attachment role within the render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// Color render target
    Color,
    /// Depth and/or stencil target
    DepthStencil,
}

/// Slot family of a subpass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubpassAttachmentKind {
    /// Color attachment, keyed by location
    Color,
    /// Depth-stencil attachment (at most one)
    DepthStencil,
    /// Input attachment, keyed by input index
    Input,
    /// Resolve target of a color attachment, keyed by location
    Resolve,
    /// Depth-stencil resolve target (at most one)
    DepthStencilResolve,
    /// Derived preserve attachments
    Preserve,
}

/// Declaration of one render pass attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentProperties {
    /// Format
    pub format: vk::Format,
    /// Samples
    pub samples: vk::SampleCountFlags,
    /// Color or depth load op
    pub load_op: vk::AttachmentLoadOp,
    /// Color or depth store op
    pub store_op: vk::AttachmentStoreOp,
    /// Stencil load op
    pub stencil_load_op: vk::AttachmentLoadOp,
    /// Stencil store op
    pub stencil_store_op: vk::AttachmentStoreOp,
    /// Layout on entry
    pub initial_layout: vk::ImageLayout,
    /// Layout on exit
    pub final_layout: vk::ImageLayout,
    /// Memory may alias another attachment
    pub may_alias: bool,
    /// Color or depth-stencil
    pub kind: AttachmentKind,
}

/// Binding of an attachment to a subpass slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpassAttachment {
    /// Referenced attachment
    pub attachment: AttachmentId,
    /// Layout during the subpass
    pub layout: vk::ImageLayout,
    /// Aspects read (input attachments)
    pub aspects: vk::ImageAspectFlags,
    /// Resolve target, if the slot is resolved
    pub resolve_attachment: Option<AttachmentId>,
    /// Depth resolve mode (depth-stencil slot)
    pub depth_resolve_mode: vk::ResolveModeFlags,
    /// Stencil resolve mode (depth-stencil slot)
    pub stencil_resolve_mode: vk::ResolveModeFlags,
}

impl SubpassAttachment {
    fn new(attachment: AttachmentId, layout: vk::ImageLayout) -> Self {
        Self {
            attachment,
            layout,
            aspects: vk::ImageAspectFlags::empty(),
            resolve_attachment: None,
            depth_resolve_mode: vk::ResolveModeFlags::NONE,
            stencil_resolve_mode: vk::ResolveModeFlags::NONE,
        }
    }

    fn to_ref(self) -> AttachmentRefDesc {
        AttachmentRefDesc {
            attachment: self.attachment,
            layout: self.layout,
            aspect_mask: self.aspects,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Subpass {
    color: BTreeMap<u32, SubpassAttachment>,
    input: BTreeMap<u32, SubpassAttachment>,
    resolved: BTreeMap<u32, SubpassAttachment>,
    depth_stencil: Option<SubpassAttachment>,
    depth_stencil_resolve: Option<SubpassAttachment>,
    view_mask: u32,
}

impl Subpass {
    /// Attachments this subpass uses for preserve purposes
    fn users(&self) -> BTreeSet<AttachmentId> {
        self.color
            .values()
            .chain(self.resolved.values())
            .chain(self.depth_stencil.iter())
            .chain(self.depth_stencil_resolve.iter())
            .map(|a| a.attachment)
            .collect()
    }
}

/// Mutable render pass description
#[derive(Clone)]
pub struct RenderPassCreateInfo {
    device: Arc<Device>,
    attachments: Vec<AttachmentProperties>,
    subpasses: Vec<Subpass>,
    dependencies: Vec<DependencyDesc>,
    correlation_masks: Vec<u32>,
    multiview_enabled: bool,
    preserve: OnceLock<Vec<Vec<AttachmentId>>>,
}

impl RenderPassCreateInfo {
    /// Empty render pass for `device`
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
            attachments: Vec::new(),
            subpasses: Vec::new(),
            dependencies: Vec::new(),
            correlation_masks: Vec::new(),
            multiview_enabled: false,
            preserve: OnceLock::new(),
        }
    }

    /// Device the render pass will be created on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    fn invalidate_preserve(&mut self) {
        self.preserve = OnceLock::new();
    }

    /// Declare a color attachment
    #[allow(clippy::too_many_arguments)]
    pub fn add_color_attachment(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        may_alias: bool,
    ) -> AttachmentId {
        self.push_attachment(AttachmentProperties {
            format,
            samples,
            load_op,
            store_op,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout,
            final_layout,
            may_alias,
            kind: AttachmentKind::Color,
        })
    }

    /// Declare a depth-stencil attachment
    #[allow(clippy::too_many_arguments)]
    pub fn add_depth_stencil_attachment(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        depth_load_op: vk::AttachmentLoadOp,
        depth_store_op: vk::AttachmentStoreOp,
        stencil_load_op: vk::AttachmentLoadOp,
        stencil_store_op: vk::AttachmentStoreOp,
        initial_layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        may_alias: bool,
    ) -> AttachmentId {
        self.push_attachment(AttachmentProperties {
            format,
            samples,
            load_op: depth_load_op,
            store_op: depth_store_op,
            stencil_load_op,
            stencil_store_op,
            initial_layout,
            final_layout,
            may_alias,
            kind: AttachmentKind::DepthStencil,
        })
    }

    fn push_attachment(&mut self, properties: AttachmentProperties) -> AttachmentId {
        let id = self.attachments.len() as AttachmentId;
        self.attachments.push(properties);
        self.invalidate_preserve();
        id
    }

    /// Reserve a new subpass
    pub fn add_subpass(&mut self) -> SubpassId {
        let id = self.subpasses.len() as SubpassId;
        self.subpasses.push(Subpass::default());
        self.invalidate_preserve();
        id
    }

    fn check_attachment(&self, attachment: AttachmentId, kind: AttachmentKind) -> CrucibleResult<()> {
        match self.attachments.get(attachment as usize) {
            Some(props) if props.kind == kind => Ok(()),
            Some(props) => Err(contract_violation(format!(
                "attachment {} is {:?}, expected {:?}",
                attachment, props.kind, kind
            ))),
            None => Err(contract_violation(format!("attachment {attachment} does not exist"))),
        }
    }

    fn subpass_mut(&mut self, subpass: SubpassId) -> CrucibleResult<&mut Subpass> {
        self.subpasses
            .get_mut(subpass as usize)
            .ok_or_else(|| contract_violation(format!("subpass {subpass} does not exist")))
    }

    /// Bind a color attachment at `location`, optionally resolved into `resolve`
    pub fn add_subpass_color_attachment(
        &mut self,
        subpass: SubpassId,
        layout: vk::ImageLayout,
        attachment: AttachmentId,
        location: u32,
        resolve: Option<AttachmentId>,
    ) -> CrucibleResult<()> {
        self.check_attachment(attachment, AttachmentKind::Color)?;
        if let Some(resolve) = resolve {
            self.check_attachment(resolve, AttachmentKind::Color)?;
        }
        let max_color = self.device.capabilities().max_color_attachments;
        ensure_contract!(
            location < max_color,
            "color location {} exceeds the device limit of {}",
            location,
            max_color
        );

        let entry = self.subpass_mut(subpass)?;
        ensure_contract!(
            !entry.color.contains_key(&location),
            "subpass {} already has a color attachment at location {}",
            subpass,
            location
        );

        let mut slot = SubpassAttachment::new(attachment, layout);
        slot.resolve_attachment = resolve;
        entry.color.insert(location, slot);
        if let Some(resolve) = resolve {
            entry.resolved.insert(location, SubpassAttachment::new(resolve, layout));
        }

        self.invalidate_preserve();
        Ok(())
    }

    /// Bind the subpass's depth-stencil attachment
    pub fn add_subpass_depth_stencil_attachment(
        &mut self,
        subpass: SubpassId,
        layout: vk::ImageLayout,
        attachment: AttachmentId,
        resolve: Option<AttachmentId>,
        depth_resolve_mode: vk::ResolveModeFlags,
        stencil_resolve_mode: vk::ResolveModeFlags,
    ) -> CrucibleResult<()> {
        self.check_attachment(attachment, AttachmentKind::DepthStencil)?;
        if let Some(resolve) = resolve {
            self.check_attachment(resolve, AttachmentKind::DepthStencil)?;
            if !self.device.capabilities().supports_depth_stencil_resolve {
                log::error!("Depth-stencil resolve requested without device support");
                return Err(CrucibleError::Unsupported("depth-stencil resolve".to_string()));
            }
        }

        let entry = self.subpass_mut(subpass)?;
        ensure_contract!(
            entry.depth_stencil.is_none(),
            "subpass {} already has a depth-stencil attachment",
            subpass
        );

        let mut slot = SubpassAttachment::new(attachment, layout);
        slot.resolve_attachment = resolve;
        slot.depth_resolve_mode = depth_resolve_mode;
        slot.stencil_resolve_mode = stencil_resolve_mode;
        entry.depth_stencil = Some(slot);
        entry.depth_stencil_resolve = resolve.map(|resolve| SubpassAttachment {
            depth_resolve_mode,
            stencil_resolve_mode,
            ..SubpassAttachment::new(resolve, layout)
        });

        self.invalidate_preserve();
        Ok(())
    }

    /// Bind an input attachment at input index `index`
    pub fn add_subpass_input_attachment(
        &mut self,
        subpass: SubpassId,
        layout: vk::ImageLayout,
        attachment: AttachmentId,
        index: u32,
        aspects: vk::ImageAspectFlags,
    ) -> CrucibleResult<()> {
        ensure_contract!(
            (attachment as usize) < self.attachments.len(),
            "attachment {} does not exist",
            attachment
        );
        ensure_contract!(!aspects.is_empty(), "input attachment needs at least one aspect");
        let max_input = self.device.capabilities().max_input_attachments;
        ensure_contract!(
            index < max_input,
            "input index {} exceeds the device limit of {}",
            index,
            max_input
        );

        let entry = self.subpass_mut(subpass)?;
        ensure_contract!(
            !entry.input.contains_key(&index),
            "subpass {} already has an input attachment at index {}",
            subpass,
            index
        );

        let mut slot = SubpassAttachment::new(attachment, layout);
        slot.aspects = aspects;
        entry.input.insert(index, slot);

        self.invalidate_preserve();
        Ok(())
    }

    // -- dependencies -------------------------------------------------------

    /// Dependency from work before the render pass into `dst_subpass`
    #[allow(clippy::too_many_arguments)]
    pub fn add_external_to_subpass_dependency(
        &mut self,
        dst_subpass: SubpassId,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        flags: vk::DependencyFlags,
    ) -> CrucibleResult<()> {
        self.check_subpass(dst_subpass)?;
        self.push_dependency(DependencyDesc {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass,
            src_stage_mask: src_stages,
            dst_stage_mask: dst_stages,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: flags,
            view_offset: 0,
        })
    }

    /// Dependency from `src_subpass` to work after the render pass
    #[allow(clippy::too_many_arguments)]
    pub fn add_subpass_to_external_dependency(
        &mut self,
        src_subpass: SubpassId,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        flags: vk::DependencyFlags,
    ) -> CrucibleResult<()> {
        self.check_subpass(src_subpass)?;
        self.push_dependency(DependencyDesc {
            src_subpass,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: src_stages,
            dst_stage_mask: dst_stages,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: flags,
            view_offset: 0,
        })
    }

    /// Dependency between two different subpasses; `src` must come first
    #[allow(clippy::too_many_arguments)]
    pub fn add_subpass_to_subpass_dependency(
        &mut self,
        src_subpass: SubpassId,
        dst_subpass: SubpassId,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        flags: vk::DependencyFlags,
    ) -> CrucibleResult<()> {
        self.check_subpass(src_subpass)?;
        self.check_subpass(dst_subpass)?;
        ensure_contract!(
            src_subpass < dst_subpass,
            "subpass dependency {} -> {} must point forward",
            src_subpass,
            dst_subpass
        );
        self.push_dependency(DependencyDesc {
            src_subpass,
            dst_subpass,
            src_stage_mask: src_stages,
            dst_stage_mask: dst_stages,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: flags,
            view_offset: 0,
        })
    }

    /// Self-dependency of `subpass`, needed for barriers inside it
    #[allow(clippy::too_many_arguments)]
    pub fn add_self_dependency(
        &mut self,
        subpass: SubpassId,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        flags: vk::DependencyFlags,
    ) -> CrucibleResult<()> {
        self.check_subpass(subpass)?;
        self.push_dependency(DependencyDesc {
            src_subpass: subpass,
            dst_subpass: subpass,
            src_stage_mask: src_stages,
            dst_stage_mask: dst_stages,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            dependency_flags: flags,
            view_offset: 0,
        })
    }

    fn check_subpass(&self, subpass: SubpassId) -> CrucibleResult<()> {
        ensure_contract!(
            (subpass as usize) < self.subpasses.len(),
            "subpass {} does not exist",
            subpass
        );
        Ok(())
    }

    fn push_dependency(&mut self, dependency: DependencyDesc) -> CrucibleResult<()> {
        if self.dependencies.contains(&dependency) {
            log::trace!("Coalesced duplicate dependency {:?}", dependency);
            return Ok(());
        }
        self.dependencies.push(dependency);
        Ok(())
    }

    // -- multiview ----------------------------------------------------------

    fn require_multiview(&mut self) -> CrucibleResult<()> {
        if !self.device.capabilities().supports_multiview {
            log::error!("Multiview requested without device support");
            return Err(CrucibleError::Unsupported("multiview".to_string()));
        }
        self.multiview_enabled = true;
        Ok(())
    }

    /// Set the views `subpass` renders to
    pub fn set_subpass_view_mask(&mut self, subpass: SubpassId, view_mask: u32) -> CrucibleResult<()> {
        self.check_subpass(subpass)?;
        self.require_multiview()?;
        self.subpass_mut(subpass)?.view_mask = view_mask;
        Ok(())
    }

    /// Set the view correlation masks
    pub fn set_correlation_masks(&mut self, masks: &[u32]) -> CrucibleResult<()> {
        self.require_multiview()?;
        self.correlation_masks = masks.to_vec();
        Ok(())
    }

    /// Make dependency `index` view-local with the given view offset
    pub fn set_dependency_view_local_properties(&mut self, index: usize, view_offset: i32) -> CrucibleResult<()> {
        ensure_contract!(
            index < self.dependencies.len(),
            "dependency {} does not exist",
            index
        );
        self.require_multiview()?;
        let dependency = &mut self.dependencies[index];
        dependency.dependency_flags |= vk::DependencyFlags::VIEW_LOCAL;
        dependency.view_offset = view_offset;
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    /// Number of attachments
    pub fn n_attachments(&self) -> u32 {
        self.attachments.len() as u32
    }

    /// Number of subpasses
    pub fn n_subpasses(&self) -> u32 {
        self.subpasses.len() as u32
    }

    /// Number of dependencies
    pub fn n_dependencies(&self) -> u32 {
        self.dependencies.len() as u32
    }

    /// Declaration of an attachment
    pub fn get_attachment_properties(&self, attachment: AttachmentId) -> Option<&AttachmentProperties> {
        self.attachments.get(attachment as usize)
    }

    /// Dependency at `index`
    pub fn get_dependency_properties(&self, index: usize) -> Option<&DependencyDesc> {
        self.dependencies.get(index)
    }

    /// Whether any multiview setter has been called
    pub fn is_multiview_enabled(&self) -> bool {
        self.multiview_enabled
    }

    /// View correlation masks
    pub fn get_correlation_masks(&self) -> &[u32] {
        &self.correlation_masks
    }

    /// View mask of `subpass`
    pub fn get_subpass_view_mask(&self, subpass: SubpassId) -> Option<u32> {
        self.subpasses.get(subpass as usize).map(|s| s.view_mask)
    }

    /// Highest color location bound in `subpass`
    pub fn get_max_color_location_used_by_subpass(&self, subpass: SubpassId) -> Option<u32> {
        self.subpasses
            .get(subpass as usize)?
            .color
            .keys()
            .next_back()
            .copied()
    }

    /// Highest location or index bound in any slot family of `subpass`
    pub fn get_subpass_highest_location(&self, subpass: SubpassId) -> Option<u32> {
        let entry = self.subpasses.get(subpass as usize)?;
        entry
            .color
            .keys()
            .chain(entry.input.keys())
            .chain(entry.resolved.keys())
            .copied()
            .max()
    }

    /// Number of attachments of `kind` bound in `subpass`
    ///
    /// Asking for [`SubpassAttachmentKind::Preserve`] recomputes preserve
    /// attachments if the builder changed since the last query.
    pub fn get_subpass_n_attachments(&self, subpass: SubpassId, kind: SubpassAttachmentKind) -> Option<u32> {
        let entry = self.subpasses.get(subpass as usize)?;
        let n = match kind {
            SubpassAttachmentKind::Color => entry.color.len(),
            SubpassAttachmentKind::Input => entry.input.len(),
            SubpassAttachmentKind::Resolve => entry.resolved.len(),
            SubpassAttachmentKind::DepthStencil => usize::from(entry.depth_stencil.is_some()),
            SubpassAttachmentKind::DepthStencilResolve => usize::from(entry.depth_stencil_resolve.is_some()),
            SubpassAttachmentKind::Preserve => self.preserve_attachments()[subpass as usize].len(),
        };
        Some(n as u32)
    }

    /// The `n`-th attachment of `kind` in `subpass`, in location order
    pub fn get_subpass_attachment_properties(
        &self,
        subpass: SubpassId,
        kind: SubpassAttachmentKind,
        n: usize,
    ) -> Option<SubpassAttachment> {
        let entry = self.subpasses.get(subpass as usize)?;
        match kind {
            SubpassAttachmentKind::Color => entry.color.values().nth(n).copied(),
            SubpassAttachmentKind::Input => entry.input.values().nth(n).copied(),
            SubpassAttachmentKind::Resolve => entry.resolved.values().nth(n).copied(),
            SubpassAttachmentKind::DepthStencil => entry.depth_stencil.filter(|_| n == 0),
            SubpassAttachmentKind::DepthStencilResolve => entry.depth_stencil_resolve.filter(|_| n == 0),
            SubpassAttachmentKind::Preserve => self.preserve_attachments()[subpass as usize]
                .get(n)
                .map(|&id| SubpassAttachment::new(id, vk::ImageLayout::UNDEFINED)),
        }
    }

    /// Color attachment bound at `location` in `subpass`
    pub fn get_subpass_color_attachment_at(&self, subpass: SubpassId, location: u32) -> Option<SubpassAttachment> {
        self.subpasses.get(subpass as usize)?.color.get(&location).copied()
    }

    /// Derived preserve attachments of `subpass`
    pub fn get_subpass_preserve_attachments(&self, subpass: SubpassId) -> Option<&[AttachmentId]> {
        self.preserve_attachments()
            .get(subpass as usize)
            .map(Vec::as_slice)
    }

    fn preserve_attachments(&self) -> &Vec<Vec<AttachmentId>> {
        self.preserve.get_or_init(|| compute_preserve_attachments(&self.subpasses))
    }

    // -- lowering -----------------------------------------------------------

    /// Lower to the native descriptor
    pub fn to_native_desc(&self) -> CrucibleResult<RenderPassDesc> {
        ensure_contract!(!self.subpasses.is_empty(), "render pass has no subpasses");

        let preserve = self.preserve_attachments();
        let mut subpasses = Vec::new();
        reserve(&mut subpasses, self.subpasses.len())?;

        for (index, subpass) in self.subpasses.iter().enumerate() {
            let n_color = subpass.color.keys().next_back().map_or(0, |&l| l as usize + 1);
            let n_input = subpass.input.keys().next_back().map_or(0, |&i| i as usize + 1);

            let mut color_attachments = unused_slots(n_color)?;
            for (&location, slot) in &subpass.color {
                color_attachments[location as usize] = slot.to_ref();
            }

            let resolve_attachments = if subpass.resolved.is_empty() {
                Vec::new()
            } else {
                let mut slots = unused_slots(n_color)?;
                for (&location, slot) in &subpass.resolved {
                    slots[location as usize] = slot.to_ref();
                }
                slots
            };

            let mut input_attachments = unused_slots(n_input)?;
            for (&index, slot) in &subpass.input {
                input_attachments[index as usize] = slot.to_ref();
            }

            subpasses.push(SubpassDesc {
                view_mask: subpass.view_mask,
                input_attachments,
                color_attachments,
                resolve_attachments,
                depth_stencil_attachment: subpass.depth_stencil.map(SubpassAttachment::to_ref),
                depth_stencil_resolve: subpass.depth_stencil_resolve.map(|slot| DepthStencilResolveDesc {
                    attachment: slot.to_ref(),
                    depth_resolve_mode: slot.depth_resolve_mode,
                    stencil_resolve_mode: slot.stencil_resolve_mode,
                }),
                preserve_attachments: preserve[index].clone(),
            });
        }

        let attachments = self
            .attachments
            .iter()
            .map(|a| AttachmentDesc {
                may_alias: a.may_alias,
                format: a.format,
                samples: a.samples,
                load_op: a.load_op,
                store_op: a.store_op,
                stencil_load_op: a.stencil_load_op,
                stencil_store_op: a.stencil_store_op,
                initial_layout: a.initial_layout,
                final_layout: a.final_layout,
            })
            .collect();

        Ok(RenderPassDesc {
            attachments,
            subpasses,
            dependencies: self.dependencies.clone(),
            correlated_view_masks: if self.multiview_enabled {
                self.correlation_masks.clone()
            } else {
                Vec::new()
            },
        })
    }
}

impl std::fmt::Debug for RenderPassCreateInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPassCreateInfo")
            .field("attachments", &self.attachments)
            .field("subpasses", &self.subpasses)
            .field("dependencies", &self.dependencies)
            .field("multiview", &self.multiview_enabled)
            .finish()
    }
}

fn reserve<T>(vec: &mut Vec<T>, n: usize) -> CrucibleResult<()> {
    vec.try_reserve_exact(n).map_err(|_| {
        log::error!("Out of host memory lowering render pass ({} slots)", n);
        CrucibleError::OutOfMemory {
            what: "render pass".to_string(),
        }
    })
}

fn unused_slots(n: usize) -> CrucibleResult<Vec<AttachmentRefDesc>> {
    let mut slots = Vec::new();
    reserve(&mut slots, n)?;
    slots.resize(n, AttachmentRefDesc::UNUSED);
    Ok(slots)
}

fn compute_preserve_attachments(subpasses: &[Subpass]) -> Vec<Vec<AttachmentId>> {
    let users: Vec<BTreeSet<AttachmentId>> = subpasses.iter().map(Subpass::users).collect();
    let all: BTreeSet<AttachmentId> = users.iter().flatten().copied().collect();
    let mut preserve: Vec<Vec<AttachmentId>> = vec![Vec::new(); subpasses.len()];

    for attachment in all {
        let mut using = users
            .iter()
            .enumerate()
            .filter(|(_, set)| set.contains(&attachment))
            .map(|(index, _)| index);
        let Some(low) = using.next() else { continue };
        let high = using.last().unwrap_or(low);
        if low == high {
            continue;
        }

        for between in (low + 1)..high {
            if !users[between].contains(&attachment) && !preserve[between].contains(&attachment) {
                preserve[between].push(attachment);
            }
        }
    }

    preserve
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    fn device() -> Arc<Device> {
        Device::create_headless(FrameworkConfig::default()).unwrap()
    }

    fn color(info: &mut RenderPassCreateInfo) -> AttachmentId {
        info.add_color_attachment(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            false,
        )
    }

    const COLOR_LAYOUT: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_duplicate_color_location_rejected() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let b = color(&mut info);
        let s = info.add_subpass();
        info.add_subpass_color_attachment(s, COLOR_LAYOUT, a, 0, None).unwrap();
        let err = info
            .add_subpass_color_attachment(s, COLOR_LAYOUT, b, 0, None)
            .unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_input_index_is_bounded_by_the_device() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let s = info.add_subpass();
        let input = |info: &mut RenderPassCreateInfo, index| {
            info.add_subpass_input_attachment(
                s,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                a,
                index,
                vk::ImageAspectFlags::COLOR,
            )
        };
        assert!(input(&mut info, u32::MAX).unwrap_err().is_contract_violation());
        input(&mut info, 7).unwrap();

        let desc = info.to_native_desc().unwrap();
        assert_eq!(desc.subpasses[0].input_attachments.len(), 8);
    }

    #[test]
    fn test_resolve_lands_at_same_location() {
        let mut info = RenderPassCreateInfo::new(&device());
        let msaa = color(&mut info);
        let target = color(&mut info);
        let s = info.add_subpass();
        info.add_subpass_color_attachment(s, COLOR_LAYOUT, msaa, 2, Some(target))
            .unwrap();

        let desc = info.to_native_desc().unwrap();
        let subpass = &desc.subpasses[0];
        assert_eq!(subpass.color_attachments.len(), 3);
        assert_eq!(subpass.resolve_attachments.len(), 3);
        assert!(subpass.color_attachments[0].is_unused());
        assert_eq!(subpass.color_attachments[2].attachment, msaa);
        assert_eq!(subpass.resolve_attachments[2].attachment, target);
        assert!(subpass.resolve_attachments[1].is_unused());
    }

    #[test]
    fn test_no_resolve_array_without_resolves() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let s = info.add_subpass();
        info.add_subpass_color_attachment(s, COLOR_LAYOUT, a, 0, None).unwrap();
        assert!(info.to_native_desc().unwrap().subpasses[0]
            .resolve_attachments
            .is_empty());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_second_depth_stencil_rejected() {
        let mut info = RenderPassCreateInfo::new(&device());
        let d = info.add_depth_stencil_attachment(
            vk::Format::D32_SFLOAT,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            false,
        );
        let s = info.add_subpass();
        let layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        let none = vk::ResolveModeFlags::NONE;
        info.add_subpass_depth_stencil_attachment(s, layout, d, None, none, none)
            .unwrap();
        assert!(info
            .add_subpass_depth_stencil_attachment(s, layout, d, None, none, none)
            .is_err());
    }

    #[test]
    fn test_depth_stencil_resolve_requires_capability() {
        let mut info = RenderPassCreateInfo::new(&device());
        let mut depth = || {
            info.add_depth_stencil_attachment(
                vk::Format::D24_UNORM_S8_UINT,
                vk::SampleCountFlags::TYPE_4,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
                vk::AttachmentLoadOp::CLEAR,
                vk::AttachmentStoreOp::STORE,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                false,
            )
        };
        let d = depth();
        let r = depth();
        let s = info.add_subpass();
        let result = info.add_subpass_depth_stencil_attachment(
            s,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            d,
            Some(r),
            vk::ResolveModeFlags::SAMPLE_ZERO,
            vk::ResolveModeFlags::SAMPLE_ZERO,
        );
        assert!(matches!(result, Err(CrucibleError::Unsupported(_))));
    }

    #[test]
    fn test_duplicate_dependencies_coalesce() {
        let mut info = RenderPassCreateInfo::new(&device());
        let s = info.add_subpass();
        for _ in 0..2 {
            info.add_external_to_subpass_dependency(
                s,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::AccessFlags::empty(),
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                vk::DependencyFlags::empty(),
            )
            .unwrap();
        }
        assert_eq!(info.n_dependencies(), 1);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_backward_subpass_dependency_rejected() {
        let mut info = RenderPassCreateInfo::new(&device());
        let s0 = info.add_subpass();
        let s1 = info.add_subpass();
        let result = info.add_subpass_to_subpass_dependency(
            s1,
            s0,
            vk::PipelineStageFlags::ALL_GRAPHICS,
            vk::PipelineStageFlags::ALL_GRAPHICS,
            vk::AccessFlags::empty(),
            vk::AccessFlags::empty(),
            vk::DependencyFlags::BY_REGION,
        );
        assert!(result.unwrap_err().is_contract_violation());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_zero_subpasses_fail_to_lower() {
        let info = RenderPassCreateInfo::new(&device());
        assert!(info.to_native_desc().unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_preserve_recomputed_after_mutation() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let b = color(&mut info);
        let s0 = info.add_subpass();
        let s1 = info.add_subpass();
        let s2 = info.add_subpass();
        info.add_subpass_color_attachment(s0, COLOR_LAYOUT, a, 0, None).unwrap();
        info.add_subpass_color_attachment(s1, COLOR_LAYOUT, b, 0, None).unwrap();
        assert_eq!(info.get_subpass_n_attachments(s1, SubpassAttachmentKind::Preserve), Some(0));

        info.add_subpass_color_attachment(s2, COLOR_LAYOUT, a, 0, None).unwrap();
        assert_eq!(info.get_subpass_preserve_attachments(s1), Some(&[a][..]));
        assert_eq!(
            info.get_subpass_attachment_properties(s1, SubpassAttachmentKind::Preserve, 0)
                .map(|p| p.attachment),
            Some(a)
        );
    }

    // Input attachments are not counted as uses when deriving preserve sets.
    // An attachment only read as input further down is not preserved across
    // the subpasses in between.
    #[test]
    fn test_input_only_use_does_not_extend_preserve_range() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let b = color(&mut info);
        let c = color(&mut info);
        let s0 = info.add_subpass();
        let s1 = info.add_subpass();
        let s2 = info.add_subpass();
        info.add_subpass_color_attachment(s0, COLOR_LAYOUT, a, 0, None).unwrap();
        info.add_subpass_color_attachment(s1, COLOR_LAYOUT, b, 0, None).unwrap();
        info.add_subpass_color_attachment(s2, COLOR_LAYOUT, c, 0, None).unwrap();
        info.add_subpass_input_attachment(
            s2,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            a,
            0,
            vk::ImageAspectFlags::COLOR,
        )
        .unwrap();

        assert_eq!(info.get_subpass_preserve_attachments(s1), Some(&[][..]));
    }

    #[test]
    fn test_multiview_latch_and_correlation_masks() {
        let mut info = RenderPassCreateInfo::new(&device());
        let s = info.add_subpass();
        assert!(!info.is_multiview_enabled());
        info.set_subpass_view_mask(s, 0b11).unwrap();
        info.set_correlation_masks(&[0b11]).unwrap();
        assert!(info.is_multiview_enabled());

        let desc = info.to_native_desc().unwrap();
        assert_eq!(desc.subpasses[0].view_mask, 0b11);
        assert_eq!(desc.correlated_view_masks, vec![0b11]);
    }

    #[test]
    fn test_highest_location_spans_slot_families() {
        let mut info = RenderPassCreateInfo::new(&device());
        let a = color(&mut info);
        let s = info.add_subpass();
        info.add_subpass_color_attachment(s, COLOR_LAYOUT, a, 1, None).unwrap();
        info.add_subpass_input_attachment(s, vk::ImageLayout::GENERAL, a, 4, vk::ImageAspectFlags::COLOR)
            .unwrap();
        assert_eq!(info.get_max_color_location_used_by_subpass(s), Some(1));
        assert_eq!(info.get_subpass_highest_location(s), Some(4));
        assert_eq!(info.to_native_desc().unwrap().subpasses[0].input_attachments.len(), 5);
    }
}
