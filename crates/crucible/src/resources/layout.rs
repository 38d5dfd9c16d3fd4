use ash::vk;
use std::sync::Arc;

use crate::core::error::{api_error, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::PipelineLayoutDesc;
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

/// Pipeline layout
pub struct PipelineLayout {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::PipelineLayout,
    desc: PipelineLayoutDesc,
    label: DebugLabel,
    _registration: Registration,
}

impl PipelineLayout {
    /// Create a layout from set layouts and push constant ranges
    pub fn create(device: &Arc<Device>, desc: PipelineLayoutDesc) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_pipeline_layout(&desc)
            .map_err(|e| api_error("create_pipeline_layout", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                desc,
                label: DebugLabel::for_handle(vk::ObjectType::PIPELINE_LAYOUT, raw(handle)),
                _registration: Registration::new(ObjectKind::PipelineLayout, id, weak.clone()),
            }
        }))
    }

    /// Layout with no sets and no push constants
    pub fn create_empty(device: &Arc<Device>) -> CrucibleResult<Arc<Self>> {
        Self::create(device, PipelineLayoutDesc::default())
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    /// Create parameters
    pub fn desc(&self) -> &PipelineLayoutDesc {
        &self.desc
    }
}

impl_debug_named!(PipelineLayout);

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PipelineLayout({}, {:?})", self.id, self.handle)
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.device.native().destroy_pipeline_layout(self.handle);
    }
}

/// Descriptor set allocated elsewhere
///
/// Always non-owning: the pool it came from frees it.
pub struct DescriptorSet {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::DescriptorSet,
    label: DebugLabel,
    _registration: Registration,
}

impl DescriptorSet {
    /// Wrap an existing descriptor set
    pub fn wrap(device: &Arc<Device>, handle: vk::DescriptorSet) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                label: DebugLabel::for_handle(vk::ObjectType::DESCRIPTOR_SET, raw(handle)),
                _registration: Registration::new(ObjectKind::DescriptorSet, id, weak.clone()),
            }
        })
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::DescriptorSet {
        self.handle
    }
}

impl_debug_named!(DescriptorSet);

impl std::fmt::Debug for DescriptorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DescriptorSet({}, {:?})", self.id, self.handle)
    }
}
