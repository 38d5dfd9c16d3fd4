//! Command pools
//!
//! A pool owns the native pool and knows every command buffer it handed out.
//! The pool's lock is the outer lock of the pool/command-buffer pair: any
//! operation that touches both takes the pool's first.

use ash::vk;
use std::sync::{Arc, Mutex, Weak};

use crate::core::error::{api_error, ensure_contract, CrucibleResult};
use crate::core::mt::{lock_state, MtLock, MtSafety};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::resources::{impl_debug_named, raw};

use super::buffer::{CommandBuffer, CommandBufferKind};

/// Native command pool plus its children
pub struct CommandPool {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::CommandPool,
    queue_family: u32,
    flags: vk::CommandPoolCreateFlags,
    mt_safe: bool,
    pub(super) lock: MtLock,
    children: Mutex<Vec<Weak<CommandBuffer>>>,
    label: DebugLabel,
    _registration: Registration,
}

impl CommandPool {
    /// Create a pool on the device's universal queue family
    ///
    /// Command buffers can be reset individually only when `flags` contains
    /// `RESET_COMMAND_BUFFER`.
    pub fn create(
        device: &Arc<Device>,
        flags: vk::CommandPoolCreateFlags,
        mt_safety: MtSafety,
    ) -> CrucibleResult<Arc<Self>> {
        let queue_family = device.capabilities().universal_queue_family;
        let handle = device
            .native()
            .create_command_pool(queue_family, flags)
            .map_err(|e| api_error("create_command_pool", e))?;

        let mt_safe = device.resolve_mt_safety(mt_safety);
        log::debug!("Command pool created for family {} (mt-safe: {})", queue_family, mt_safe);

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                queue_family,
                flags,
                mt_safe,
                lock: MtLock::new(mt_safe),
                children: Mutex::new(Vec::new()),
                label: DebugLabel::for_handle(vk::ObjectType::COMMAND_POOL, raw(handle)),
                _registration: Registration::new(ObjectKind::CommandPool, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    /// Device the pool lives on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Queue family command buffers of this pool are submitted to
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Whether command buffers may be reset one by one
    pub fn allows_individual_reset(&self) -> bool {
        self.flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
    }

    /// Allocate a primary command buffer
    pub fn alloc_primary(self: &Arc<Self>, mt_safety: MtSafety) -> CrucibleResult<Arc<CommandBuffer>> {
        self.alloc(CommandBufferKind::Primary, mt_safety)
    }

    /// Allocate a secondary command buffer
    pub fn alloc_secondary(self: &Arc<Self>, mt_safety: MtSafety) -> CrucibleResult<Arc<CommandBuffer>> {
        self.alloc(CommandBufferKind::Secondary, mt_safety)
    }

    fn alloc(self: &Arc<Self>, kind: CommandBufferKind, mt_safety: MtSafety) -> CrucibleResult<Arc<CommandBuffer>> {
        let handle = {
            let _guard = self.lock.lock();
            self.device
                .native()
                .allocate_command_buffer(self.handle, kind.level())
                .map_err(|e| api_error("allocate_command_buffers", e))?
        };

        let buffer = CommandBuffer::new(Arc::clone(self), handle, kind, mt_safety.resolve(self.mt_safe));

        let mut children = lock_state(&self.children);
        children.retain(|child| child.strong_count() > 0);
        children.push(Arc::downgrade(&buffer));

        log::trace!("{:?} command buffer {} allocated from pool {}", kind, buffer.id(), self.id);
        Ok(buffer)
    }

    /// Number of live command buffers allocated from this pool
    pub fn n_live_command_buffers(&self) -> usize {
        lock_state(&self.children)
            .iter()
            .filter(|child| child.strong_count() > 0)
            .count()
    }

    /// Reset every command buffer of the pool
    ///
    /// No child may be recording.
    pub fn reset(&self, release_resources: bool) -> CrucibleResult<()> {
        let _guard = self.lock.lock();
        let children: Vec<Arc<CommandBuffer>> = lock_state(&self.children)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for child in &children {
            ensure_contract!(
                !child.is_recording(),
                "command pool {} reset while command buffer {} is recording",
                self.id,
                child.id()
            );
        }

        self.device
            .native()
            .reset_command_pool(self.handle, release_resources)
            .map_err(|e| api_error("reset_command_pool", e))?;

        for child in &children {
            child.on_pool_reset();
        }

        log::debug!("Command pool {} reset ({} buffer(s))", self.id, children.len());
        Ok(())
    }
}

impl_debug_named!(CommandPool);

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("queue_family", &self.queue_family)
            .finish()
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Children hold a strong reference to their pool, so none is alive here.
        self.device.native().destroy_command_pool(self.handle);
        log::trace!("Command pool {} destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeCall;
    use crate::tests::Harness;

    #[test]
    fn test_live_buffers_are_counted() {
        let harness = Harness::new();
        let pool = harness.pool(vk::CommandPoolCreateFlags::TRANSIENT);
        let first = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        let second = pool.alloc_secondary(MtSafety::Disabled).unwrap();
        assert_eq!(pool.n_live_command_buffers(), 2);
        assert_eq!(second.kind(), CommandBufferKind::Secondary);
        assert!(Arc::ptr_eq(first.pool(), &pool));

        drop(first);
        assert_eq!(pool.n_live_command_buffers(), 1);
        assert!(!pool.allows_individual_reset());
    }

    #[test]
    fn test_reset_returns_children_to_initial() {
        let harness = Harness::new();
        let pool = harness.pool(vk::CommandPoolCreateFlags::empty());
        let cb = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.end_recording().unwrap();
        assert!(cb.is_executable());

        pool.reset(true).unwrap();
        assert!(!cb.is_executable());
        assert_eq!(harness.count_calls(|call| matches!(call, NativeCall::ResetCommandPool(_))), 1);
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_reset_with_recording_child_is_rejected() {
        let harness = Harness::new();
        let pool = harness.pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let idle = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        let busy = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        idle.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        idle.end_recording().unwrap();
        busy.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();

        assert!(pool.reset(false).unwrap_err().is_contract_violation());
        assert!(idle.is_executable());
        assert!(busy.is_recording());
        assert_eq!(harness.count_calls(|call| matches!(call, NativeCall::ResetCommandPool(_))), 0);
    }
}
