use ash::vk;
use std::sync::Arc;

use crate::core::error::{api_error, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::BufferDesc;
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

/// Buffer with dedicated memory
pub struct Buffer {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::Buffer,
    desc: BufferDesc,
    label: DebugLabel,
    _registration: Registration,
}

impl Buffer {
    /// Create a buffer of `size` bytes
    pub fn create(
        device: &Arc<Device>,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> CrucibleResult<Arc<Self>> {
        let desc = BufferDesc {
            size,
            usage,
            host_visible,
        };
        let handle = device
            .native()
            .create_buffer(&desc)
            .map_err(|e| api_error("create_buffer", e))?;

        log::trace!("Buffer created: {} bytes, usage {:?}", size, usage);

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                desc,
                label: DebugLabel::for_handle(vk::ObjectType::BUFFER, raw(handle)),
                _registration: Registration::new(ObjectKind::Buffer, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.desc.size
    }

    /// Usage flags
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.desc.usage
    }
}

impl_debug_named!(Buffer);

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("size", &self.desc.size)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.native().destroy_buffer(self.handle);
    }
}
