//! Optional debug name and tag of a wrapper

use ash::vk;
use std::sync::{Arc, Mutex};

use crate::core::error::CrucibleResult;
use crate::core::mt::lock_state;
use crate::device::Device;

/// Debug name/tag of one object, applied to each native handle it owns
#[derive(Debug, Default)]
pub struct DebugLabel {
    name: Mutex<Option<String>>,
    tag: Mutex<Option<(u64, Vec<u8>)>>,
    handles: Mutex<Vec<(vk::ObjectType, u64)>>,
}

impl DebugLabel {
    /// Label covering a single native handle
    pub fn for_handle(object_type: vk::ObjectType, raw_handle: u64) -> Self {
        let label = Self::default();
        label.add_handle(object_type, raw_handle);
        label
    }

    /// Track another native handle; later names and tags apply to it too
    pub fn add_handle(&self, object_type: vk::ObjectType, raw_handle: u64) {
        lock_state(&self.handles).push((object_type, raw_handle));
    }

    /// Stop tracking a native handle that has been destroyed
    pub fn remove_handle(&self, raw_handle: u64) {
        lock_state(&self.handles).retain(|(_, raw)| *raw != raw_handle);
    }

    /// Current debug name
    pub fn name(&self) -> Option<String> {
        lock_state(&self.name).clone()
    }

    /// Current debug tag
    pub fn tag(&self) -> Option<(u64, Vec<u8>)> {
        lock_state(&self.tag).clone()
    }

    /// Set the name and forward it to every tracked handle
    pub fn set_name(&self, device: &Device, name: &str) -> CrucibleResult<()> {
        *lock_state(&self.name) = Some(name.to_string());

        if !device.debug_labels_enabled() {
            return Ok(());
        }

        for (object_type, raw) in lock_state(&self.handles).iter() {
            device
                .native()
                .set_object_name(*object_type, *raw, name)
                .map_err(|e| crate::core::error::api_error("set_object_name", e))?;
        }
        Ok(())
    }

    /// Set the tag and forward it to every tracked handle
    pub fn set_tag(&self, device: &Device, tag_name: u64, data: &[u8]) -> CrucibleResult<()> {
        *lock_state(&self.tag) = Some((tag_name, data.to_vec()));

        if !device.debug_labels_enabled() {
            return Ok(());
        }

        for (object_type, raw) in lock_state(&self.handles).iter() {
            device
                .native()
                .set_object_tag(*object_type, *raw, tag_name, data)
                .map_err(|e| crate::core::error::api_error("set_object_tag", e))?;
        }
        Ok(())
    }

    /// Re-apply the stored name to a newly created handle
    pub(crate) fn apply_to(&self, device: &Device, object_type: vk::ObjectType, raw_handle: u64) {
        if !device.debug_labels_enabled() {
            return;
        }
        if let Some(name) = self.name() {
            if let Err(err) = device.native().set_object_name(object_type, raw_handle, &name) {
                log::warn!("Could not name {:?} {:#x}: {:?}", object_type, raw_handle, err);
            }
        }
    }
}

/// Objects that carry a [`DebugLabel`]
pub trait DebugNamed {
    /// The object's label
    fn debug_label(&self) -> &DebugLabel;

    /// Device the object belongs to
    fn parent_device(&self) -> &Arc<Device>;

    /// Set the object's debug name
    fn set_name(&self, name: &str) -> CrucibleResult<()> {
        self.debug_label().set_name(self.parent_device(), name)
    }

    /// Set the object's debug tag
    fn set_tag(&self, tag_name: u64, data: &[u8]) -> CrucibleResult<()> {
        self.debug_label().set_tag(self.parent_device(), tag_name, data)
    }

    /// The object's debug name
    fn name(&self) -> Option<String> {
        self.debug_label().name()
    }
}
