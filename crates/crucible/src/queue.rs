//! Queues
//!
//! Queues are created with the device and hold only the native entry points
//! and the device bus, never the device itself. Submission checks that every
//! command buffer is a primary that finished recording. Presentation goes
//! through here so swapchains can count presents and windows can react.

use ash::vk;
use std::sync::Arc;

use crate::command::{CommandBuffer, CommandBufferKind};
use crate::core::error::{api_error, ensure_contract, CrucibleResult};
use crate::core::mt::MtLock;
use crate::events::{CallbackArg, CallbackBus, PresentRequest};
use crate::foundation::collections::ObjectId;
use crate::native::{NativeDevice, PresentDesc, SubmitDesc};
use crate::registry::{ObjectKind, Registration};
use crate::resources::{Fence, Semaphore};
use crate::swapchain::Swapchain;

/// One batch of work for [`Queue::submit`]
#[derive(Debug, Default, Clone)]
pub struct SubmitInfo {
    /// Primaries, executed in order
    pub command_buffers: Vec<Arc<CommandBuffer>>,
    /// Semaphores waited on, each with the stages that wait
    pub wait_semaphores: Vec<(Arc<Semaphore>, vk::PipelineStageFlags)>,
    /// Semaphores signalled once the batch completes
    pub signal_semaphores: Vec<Arc<Semaphore>>,
    /// Fence signalled once the batch completes
    pub fence: Option<Arc<Fence>>,
}

impl SubmitInfo {
    /// Empty submission
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a primary
    pub fn command_buffer(mut self, command_buffer: &Arc<CommandBuffer>) -> Self {
        self.command_buffers.push(Arc::clone(command_buffer));
        self
    }

    /// Wait on `semaphore` at `stages`
    pub fn wait(mut self, semaphore: &Arc<Semaphore>, stages: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push((Arc::clone(semaphore), stages));
        self
    }

    /// Signal `semaphore`
    pub fn signal(mut self, semaphore: &Arc<Semaphore>) -> Self {
        self.signal_semaphores.push(Arc::clone(semaphore));
        self
    }

    /// Signal `fence`
    pub fn fence(mut self, fence: &Arc<Fence>) -> Self {
        self.fence = Some(Arc::clone(fence));
        self
    }
}

/// Device queue
pub struct Queue {
    id: ObjectId,
    native: Arc<dyn NativeDevice>,
    bus: Arc<CallbackBus>,
    family: u32,
    index: u32,
    handle: vk::Queue,
    lock: MtLock,
    _registration: Registration,
}

impl Queue {
    pub(crate) fn new(
        native: Arc<dyn NativeDevice>,
        bus: Arc<CallbackBus>,
        family: u32,
        index: u32,
        mt_safe: bool,
    ) -> Arc<Self> {
        let handle = native.get_queue(family, index);
        Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                native,
                bus,
                family,
                index,
                handle,
                lock: MtLock::new(mt_safe),
                _registration: Registration::new(ObjectKind::Queue, id, weak.clone()),
            }
        })
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Queue {
        self.handle
    }

    /// Queue family
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Index inside the family
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Submit one batch
    pub fn submit(&self, info: SubmitInfo) -> CrucibleResult<()> {
        let mut masks = Vec::with_capacity(info.command_buffers.len());
        for command_buffer in &info.command_buffers {
            let status = command_buffer.submit_status();
            ensure_contract!(
                status.kind == CommandBufferKind::Primary,
                "secondary command buffer {} submitted to a queue",
                command_buffer.id()
            );
            ensure_contract!(
                !status.recording,
                "command buffer {} submitted while recording",
                command_buffer.id()
            );
            ensure_contract!(
                status.executable,
                "command buffer {} submitted without being recorded",
                command_buffer.id()
            );
            masks.push(status.device_mask);
        }

        let multi_gpu = self.native.capabilities().physical_device_count > 1;
        let desc = SubmitDesc {
            wait_semaphores: info.wait_semaphores.iter().map(|(s, _)| s.handle()).collect(),
            wait_stages: info.wait_semaphores.iter().map(|(_, stages)| *stages).collect(),
            command_buffers: info.command_buffers.iter().map(|cb| cb.handle()).collect(),
            signal_semaphores: info.signal_semaphores.iter().map(|s| s.handle()).collect(),
            command_buffer_device_masks: if multi_gpu { masks } else { Vec::new() },
        };
        let fence = info.fence.as_ref().map_or(vk::Fence::null(), |f| f.handle());

        let _guard = self.lock.lock();
        self.native
            .queue_submit(self.handle, std::slice::from_ref(&desc), fence)
            .map_err(|e| api_error("queue_submit", e))?;

        log::trace!(
            "Queue {} submitted {} command buffer(s)",
            self.id,
            desc.command_buffers.len()
        );
        Ok(())
    }

    /// Submission with no work that only signals `semaphore`
    pub fn submit_signal_only(&self, semaphore: &Arc<Semaphore>) -> CrucibleResult<()> {
        self.submit(SubmitInfo::new().signal(semaphore))
    }

    /// Submission with no work that only waits on `semaphores`
    fn submit_wait_only(&self, semaphores: &[Arc<Semaphore>]) -> CrucibleResult<()> {
        let info = semaphores.iter().fold(SubmitInfo::new(), |info, semaphore| {
            info.wait(semaphore, vk::PipelineStageFlags::ALL_COMMANDS)
        });
        self.submit(info)
    }

    /// Present image `image_index` of `swapchain`
    ///
    /// Every present needs a matching earlier acquire. Headless swapchains
    /// have no native present; their wait semaphores are consumed by an
    /// empty submission instead.
    pub fn present(
        &self,
        swapchain: &Arc<Swapchain>,
        image_index: u32,
        wait_semaphores: &[Arc<Semaphore>],
    ) -> CrucibleResult<()> {
        ensure_contract!(
            swapchain.n_presented() < swapchain.n_acquired(),
            "swapchain {} presented more often than acquired ({} acquire(s))",
            swapchain.id(),
            swapchain.n_acquired()
        );
        ensure_contract!(
            image_index < swapchain.n_images(),
            "image index {} out of range ({} image(s))",
            image_index,
            swapchain.n_images()
        );

        ensure_contract!(
            !swapchain.is_torn_down(),
            "present on swapchain {} after it was torn down",
            swapchain.id()
        );

        if swapchain.is_headless() {
            if !wait_semaphores.is_empty() {
                self.submit_wait_only(wait_semaphores)?;
            }
        } else {
            let desc = PresentDesc {
                wait_semaphores: wait_semaphores.iter().map(|s| s.handle()).collect(),
                swapchains: vec![swapchain.handle()?],
                image_indices: vec![image_index],
            };
            let _guard = self.lock.lock();
            let suboptimal = self
                .native
                .queue_present(self.handle, &desc)
                .map_err(|e| api_error("queue_present", e))?;
            if suboptimal {
                log::warn!("Swapchain {} is suboptimal for its surface", swapchain.id());
            }
        }

        self.bus.callback(&CallbackArg::PresentRequestIssued(PresentRequest {
            queue: self.id,
            swapchain: swapchain.id(),
            image_index,
        }));
        swapchain.window().on_present(swapchain, image_index)
    }

    /// Block until the queue is idle
    pub fn wait_idle(&self) -> CrucibleResult<()> {
        let _guard = self.lock.lock();
        self.native
            .queue_wait_idle(self.handle)
            .map_err(|e| api_error("queue_wait_idle", e))
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("index", &self.index)
            .finish()
    }
}
