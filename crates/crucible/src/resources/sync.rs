//! Semaphores, fences and events

use ash::vk;
use std::sync::Arc;

use crate::core::error::{api_error, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

/// Binary semaphore for GPU-GPU ordering
pub struct Semaphore {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::Semaphore,
    label: DebugLabel,
    _registration: Registration,
}

impl Semaphore {
    /// Create an unsignaled semaphore
    pub fn create(device: &Arc<Device>) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_semaphore()
            .map_err(|e| api_error("create_semaphore", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                label: DebugLabel::for_handle(vk::ObjectType::SEMAPHORE, raw(handle)),
                _registration: Registration::new(ObjectKind::Semaphore, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl_debug_named!(Semaphore);

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Semaphore({}, {:?})", self.id, self.handle)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.native().destroy_semaphore(self.handle);
    }
}

/// Fence for CPU-GPU synchronization
pub struct Fence {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::Fence,
    label: DebugLabel,
    _registration: Registration,
}

impl Fence {
    /// Create a fence, optionally already signaled
    pub fn create(device: &Arc<Device>, signaled: bool) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_fence(signaled)
            .map_err(|e| api_error("create_fence", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                label: DebugLabel::for_handle(vk::ObjectType::FENCE, raw(handle)),
                _registration: Registration::new(ObjectKind::Fence, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until signaled or `timeout` nanoseconds elapse
    pub fn wait(&self, timeout: u64) -> CrucibleResult<()> {
        self.device
            .native()
            .wait_for_fences(&[self.handle], true, timeout)
            .map_err(|e| api_error("wait_for_fences", e))
    }

    /// Return to the unsignaled state
    pub fn reset(&self) -> CrucibleResult<()> {
        self.device
            .native()
            .reset_fences(&[self.handle])
            .map_err(|e| api_error("reset_fences", e))
    }

    /// Whether the fence is signaled
    pub fn is_signaled(&self) -> CrucibleResult<bool> {
        self.device
            .native()
            .fence_status(self.handle)
            .map_err(|e| api_error("get_fence_status", e))
    }
}

impl_debug_named!(Fence);

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fence({}, {:?})", self.id, self.handle)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.native().destroy_fence(self.handle);
    }
}

/// Event, set and reset from command buffers
pub struct Event {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::Event,
    label: DebugLabel,
    _registration: Registration,
}

impl Event {
    /// Create an unset event
    pub fn create(device: &Arc<Device>) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_event()
            .map_err(|e| api_error("create_event", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                label: DebugLabel::for_handle(vk::ObjectType::EVENT, raw(handle)),
                _registration: Registration::new(ObjectKind::Event, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Event {
        self.handle
    }
}

impl_debug_named!(Event);

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event({}, {:?})", self.id, self.handle)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.device.native().destroy_event(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    #[test]
    fn test_fence_signal_state() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let fence = Fence::create(&device, true).unwrap();
        assert!(fence.is_signaled().unwrap());
        fence.reset().unwrap();
        assert!(!fence.is_signaled().unwrap());
    }

    #[test]
    fn test_semaphores_get_distinct_handles() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let a = Semaphore::create(&device).unwrap();
        let b = Semaphore::create(&device).unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_ne!(a.id(), b.id());
    }
}
