//! Command buffer recorder
//!
//! Tracks the recording state machine and checks every command against it
//! before the native call:
//! - legality of the command relative to the active render pass
//! - primary/secondary restrictions
//! - device masks on device groups
//! - subpass contents and subpass count
//! - debug label nesting
//!
//! With the `command-stash` feature every successfully recorded command is
//! also kept, with strong references to its arguments, until the next
//! `begin_recording` or reset.

use ash::vk;
use std::sync::{Arc, Mutex};

use crate::core::error::{api_error, contract_violation, ensure_contract, CrucibleError, CrucibleResult};
use crate::core::mt::{lock_state, MtLock};
use crate::device::Device;
use crate::events::CallbackArg;
use crate::foundation::collections::ObjectId;
use crate::framebuffer::Framebuffer;
use crate::native::{CommandBufferBeginDesc, InheritanceDesc, SampleLocationsDesc, ScissorDesc, ViewportDesc};
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::render_pass::RenderPass;
use crate::resources::{
    impl_debug_named, raw, Buffer, DescriptorSet, Event, Image, PipelineLayout, QueryPool,
};

use super::barrier::PipelineBarrier;
use super::commands::{ClearAttachment, ClearColor, ClearValue, Command};
use super::pool::CommandPool;

/// Primary or secondary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferKind {
    /// Submitted to queues; may begin render passes and execute secondaries
    Primary,
    /// Executed from a primary
    Secondary,
}

impl CommandBufferKind {
    pub(crate) fn level(self) -> vk::CommandBufferLevel {
        match self {
            Self::Primary => vk::CommandBufferLevel::PRIMARY,
            Self::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// Inheritance of a secondary command buffer
#[derive(Debug, Clone, Default)]
pub struct Inheritance {
    /// Render pass the secondary executes in; required with
    /// `RENDER_PASS_CONTINUE`
    pub render_pass: Option<Arc<RenderPass>>,
    /// Subpass the secondary executes in
    pub subpass: u32,
    /// Framebuffer, if known up front
    pub framebuffer: Option<Arc<Framebuffer>>,
    /// Occlusion queries may be active in the primary
    pub occlusion_query_enable: bool,
    /// Occlusion query flags
    pub query_flags: vk::QueryControlFlags,
    /// Pipeline statistics that may be active in the primary
    pub pipeline_statistics: vk::QueryPipelineStatisticFlags,
}

impl Inheritance {
    /// Inherit subpass `subpass` of `render_pass`
    pub fn render_pass(render_pass: &Arc<RenderPass>, subpass: u32) -> Self {
        Self {
            render_pass: Some(Arc::clone(render_pass)),
            subpass,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveRenderPass {
    render_pass: Arc<RenderPass>,
    framebuffer: Arc<Framebuffer>,
    subpass: u32,
    contents: vk::SubpassContents,
    device_mask: u32,
    mask_before: u32,
}

#[derive(Debug, Default)]
struct RecorderState {
    recording: bool,
    executable: bool,
    usage: vk::CommandBufferUsageFlags,
    /// Secondary begun with `RENDER_PASS_CONTINUE`
    continues_render_pass: bool,
    inheritance: Option<Inheritance>,
    active: Option<ActiveRenderPass>,
    initial_device_mask: u32,
    device_mask: u32,
    debug_label_depth: u32,
    #[cfg(feature = "command-stash")]
    stash: Vec<Command>,
}

impl RecorderState {
    fn inside_render_pass(&self) -> bool {
        self.continues_render_pass || self.active.is_some()
    }

    fn clear(&mut self) {
        self.recording = false;
        self.executable = false;
        self.continues_render_pass = false;
        self.inheritance = None;
        self.active = None;
        self.debug_label_depth = 0;
        #[cfg(feature = "command-stash")]
        self.stash.clear();
    }
}

/// What the queue needs to know about a command buffer at submit time
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubmitStatus {
    pub kind: CommandBufferKind,
    pub recording: bool,
    pub executable: bool,
    pub device_mask: u32,
}

struct SecondarySnapshot {
    id: ObjectId,
    handle: vk::CommandBuffer,
    kind: CommandBufferKind,
    recording: bool,
    executable: bool,
    continues: Option<(Arc<RenderPass>, u32)>,
}

/// Command buffer wrapper
pub struct CommandBuffer {
    id: ObjectId,
    device: Arc<Device>,
    pool: Arc<CommandPool>,
    handle: vk::CommandBuffer,
    kind: CommandBufferKind,
    lock: MtLock,
    state: Mutex<RecorderState>,
    label: DebugLabel,
    _registration: Registration,
}

impl CommandBuffer {
    pub(super) fn new(
        pool: Arc<CommandPool>,
        handle: vk::CommandBuffer,
        kind: CommandBufferKind,
        mt_safe: bool,
    ) -> Arc<Self> {
        let device = Arc::clone(pool.device());
        let full_mask = device.device_group_mask();
        Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device,
                pool,
                handle,
                kind,
                lock: MtLock::new(mt_safe),
                state: Mutex::new(RecorderState {
                    initial_device_mask: full_mask,
                    device_mask: full_mask,
                    ..RecorderState::default()
                }),
                label: DebugLabel::for_handle(vk::ObjectType::COMMAND_BUFFER, raw(handle)),
                _registration: Registration::new(ObjectKind::CommandBuffer, id, weak.clone()),
            }
        })
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Primary or secondary
    pub fn kind(&self) -> CommandBufferKind {
        self.kind
    }

    /// Pool the buffer was allocated from
    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    /// Whether a recording is in progress
    pub fn is_recording(&self) -> bool {
        lock_state(&self.state).recording
    }

    /// Whether recording finished and the buffer was not reset since
    pub fn is_executable(&self) -> bool {
        lock_state(&self.state).executable
    }

    /// Whether commands currently land inside a render pass instance
    pub fn is_inside_render_pass(&self) -> bool {
        lock_state(&self.state).inside_render_pass()
    }

    /// Current device mask
    pub fn device_mask(&self) -> u32 {
        lock_state(&self.state).device_mask
    }

    /// Commands recorded since the last begin or reset
    #[cfg(feature = "command-stash")]
    pub fn stashed_commands(&self) -> Vec<Command> {
        lock_state(&self.state).stash.clone()
    }

    /// Number of commands recorded since the last begin or reset
    #[cfg(feature = "command-stash")]
    pub fn n_stashed_commands(&self) -> usize {
        lock_state(&self.state).stash.len()
    }

    pub(crate) fn submit_status(&self) -> SubmitStatus {
        let state = lock_state(&self.state);
        SubmitStatus {
            kind: self.kind,
            recording: state.recording,
            executable: state.executable,
            device_mask: state.initial_device_mask,
        }
    }

    pub(super) fn on_pool_reset(&self) {
        let _guard = self.lock.lock();
        lock_state(&self.state).clear();
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    /// Begin recording a primary on every device of the group
    pub fn begin_recording(&self, usage: vk::CommandBufferUsageFlags) -> CrucibleResult<()> {
        self.begin_primary(usage, self.device.device_group_mask())
    }

    /// Begin recording a primary on the devices selected by `device_mask`
    pub fn begin_recording_with_device_mask(
        &self,
        usage: vk::CommandBufferUsageFlags,
        device_mask: u32,
    ) -> CrucibleResult<()> {
        self.begin_primary(usage, device_mask)
    }

    fn begin_primary(&self, usage: vk::CommandBufferUsageFlags, device_mask: u32) -> CrucibleResult<()> {
        ensure_contract!(
            self.kind == CommandBufferKind::Primary,
            "command buffer {} is secondary; use begin_secondary_recording",
            self.id
        );
        ensure_contract!(
            !usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE),
            "RENDER_PASS_CONTINUE is only valid for secondary command buffers"
        );
        let group_mask = self.device.device_group_mask();
        ensure_contract!(
            device_mask != 0 && device_mask & !group_mask == 0,
            "device mask {:#b} is not a non-empty subset of the device group {:#b}",
            device_mask,
            group_mask
        );

        let desc = CommandBufferBeginDesc {
            flags: usage,
            device_mask: (group_mask != 1).then_some(device_mask),
            inheritance: None,
        };
        self.begin(desc, None, device_mask)
    }

    /// Begin recording a secondary
    ///
    /// With `RENDER_PASS_CONTINUE` in `usage` the buffer is inside a render
    /// pass from the outset and `inheritance` must name that render pass.
    pub fn begin_secondary_recording(
        &self,
        usage: vk::CommandBufferUsageFlags,
        inheritance: Inheritance,
    ) -> CrucibleResult<()> {
        ensure_contract!(
            self.kind == CommandBufferKind::Secondary,
            "command buffer {} is primary; use begin_recording",
            self.id
        );

        let continues = usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
        let mut native_inheritance = InheritanceDesc {
            render_pass: vk::RenderPass::null(),
            subpass: inheritance.subpass,
            framebuffer: vk::Framebuffer::null(),
            occlusion_query_enable: inheritance.occlusion_query_enable,
            query_flags: inheritance.query_flags,
            pipeline_statistics: inheritance.pipeline_statistics,
        };

        if continues {
            let Some(render_pass) = inheritance.render_pass.as_ref() else {
                return Err(contract_violation(
                    "render-pass-usage-only secondaries need an inherited render pass",
                ));
            };
            ensure_contract!(
                inheritance.subpass < render_pass.n_subpasses(),
                "inherited subpass {} out of range ({} subpass(es))",
                inheritance.subpass,
                render_pass.n_subpasses()
            );
            native_inheritance.render_pass = render_pass.handle();
            if let Some(framebuffer) = inheritance.framebuffer.as_ref() {
                native_inheritance.framebuffer = framebuffer.get_framebuffer(render_pass)?;
            }
        }

        let desc = CommandBufferBeginDesc {
            flags: usage,
            device_mask: None,
            inheritance: Some(native_inheritance),
        };
        self.begin(desc, Some(inheritance), self.device.device_group_mask())
    }

    fn begin(
        &self,
        desc: CommandBufferBeginDesc,
        inheritance: Option<Inheritance>,
        device_mask: u32,
    ) -> CrucibleResult<()> {
        let _pool_guard = self.pool.lock.lock();
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);

        ensure_contract!(!state.recording, "command buffer {} is already recording", self.id);
        ensure_contract!(
            !state.executable || self.pool.allows_individual_reset(),
            "command buffer {} re-recorded but its pool does not allow individual resets",
            self.id
        );

        self.device
            .native()
            .begin_command_buffer(self.handle, &desc)
            .map_err(|e| api_error("begin_command_buffer", e))?;

        state.clear();
        state.recording = true;
        state.usage = desc.flags;
        state.continues_render_pass = desc.flags.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
        state.inheritance = inheritance;
        state.initial_device_mask = device_mask;
        state.device_mask = device_mask;

        log::trace!("Command buffer {} recording ({:?})", self.id, desc.flags);
        Ok(())
    }

    /// Finish recording
    pub fn end_recording(&self) -> CrucibleResult<()> {
        let _pool_guard = self.pool.lock.lock();
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);

        ensure_contract!(state.recording, "command buffer {} is not recording", self.id);
        ensure_contract!(
            state.active.is_none(),
            "command buffer {} ended inside a render pass",
            self.id
        );
        ensure_contract!(
            state.debug_label_depth == 0,
            "command buffer {} ended with {} open debug label(s)",
            self.id,
            state.debug_label_depth
        );

        self.device
            .native()
            .end_command_buffer(self.handle)
            .map_err(|e| api_error("end_command_buffer", e))?;

        state.recording = false;
        state.executable = true;
        log::trace!("Command buffer {} recorded", self.id);
        Ok(())
    }

    /// Reset to the initial state
    ///
    /// Not allowed while recording; requires a pool created with
    /// `RESET_COMMAND_BUFFER`.
    pub fn reset(&self, release_resources: bool) -> CrucibleResult<()> {
        ensure_contract!(
            self.pool.allows_individual_reset(),
            "pool of command buffer {} was not created with RESET_COMMAND_BUFFER",
            self.id
        );

        let _pool_guard = self.pool.lock.lock();
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);
        ensure_contract!(!state.recording, "command buffer {} reset while recording", self.id);

        self.device
            .native()
            .reset_command_buffer(self.handle, release_resources)
            .map_err(|e| api_error("reset_command_buffer", e))?;

        state.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recording core
    // -----------------------------------------------------------------------

    /// Check `command` against the state, run `apply`, then record it
    ///
    /// `apply` validates command-specific rules and updates the state; the
    /// command is only issued if it succeeds.
    fn record_with<F>(&self, command: Command, apply: F) -> CrucibleResult<()>
    where
        F: FnOnce(&mut RecorderState) -> CrucibleResult<()>,
    {
        let _pool_guard = self.pool.lock.lock();
        let _guard = self.lock.lock();
        let mut state = lock_state(&self.state);

        ensure_contract!(
            state.recording,
            "{} recorded into command buffer {} which is not recording",
            command.name(),
            self.id
        );

        let inside = state.inside_render_pass();
        if !command.legality().allows(inside) {
            return Err(contract_violation(format!(
                "{} recorded {} a render pass in command buffer {}",
                command.name(),
                if inside { "inside" } else { "outside" },
                self.id
            )));
        }

        if let Some(active) = state.active.as_ref() {
            let secondary_contents = active.contents == vk::SubpassContents::SECONDARY_COMMAND_BUFFERS;
            let allowed = match &command {
                Command::ExecuteCommands(_) => secondary_contents,
                Command::NextSubpass { .. } | Command::EndRenderPass => true,
                _ => !secondary_contents,
            };
            ensure_contract!(
                allowed,
                "{} not allowed in subpass {} recorded with {:?}",
                command.name(),
                active.subpass,
                active.contents
            );
        }

        apply(&mut state)?;

        self.device.native().record_command(self.handle, &command);
        log::trace!("{} recorded into {}", command.name(), self.id);

        #[cfg(feature = "command-stash")]
        state.stash.push(command);

        Ok(())
    }

    fn record(&self, command: Command) -> CrucibleResult<()> {
        self.record_with(command, |_| Ok(()))
    }

    fn require_primary(&self, what: &str) -> CrucibleResult<()> {
        ensure_contract!(
            self.kind == CommandBufferKind::Primary,
            "{} is only valid on primary command buffers",
            what
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Render passes
    // -----------------------------------------------------------------------

    /// Begin a render pass instance
    ///
    /// `device_mask` restricts the render pass to a subset of the buffer's
    /// initial device mask.
    pub fn begin_render_pass(
        &self,
        render_pass: &Arc<RenderPass>,
        framebuffer: &Arc<Framebuffer>,
        render_area: vk::Rect2D,
        clear_values: &[ClearValue],
        contents: vk::SubpassContents,
        device_mask: Option<u32>,
    ) -> CrucibleResult<()> {
        self.require_primary("vkCmdBeginRenderPass")?;

        let n_attachments = render_pass.desc().attachments.len();
        ensure_contract!(
            framebuffer.n_attachments() == n_attachments,
            "framebuffer has {} attachment(s), render pass expects {}",
            framebuffer.n_attachments(),
            n_attachments
        );

        let needed_clears = render_pass
            .desc()
            .attachments
            .iter()
            .rposition(|a| {
                a.load_op == vk::AttachmentLoadOp::CLEAR || a.stencil_load_op == vk::AttachmentLoadOp::CLEAR
            })
            .map_or(0, |last| last + 1);
        ensure_contract!(
            clear_values.len() >= needed_clears,
            "render pass clears {} attachment(s) but {} clear value(s) were given",
            needed_clears,
            clear_values.len()
        );

        let framebuffer_handle = framebuffer.get_framebuffer(render_pass)?;

        let command = Command::BeginRenderPass {
            render_pass: Arc::clone(render_pass),
            framebuffer: Arc::clone(framebuffer),
            framebuffer_handle,
            render_area,
            clear_values: clear_values.to_vec(),
            contents,
            device_mask,
        };

        self.record_with(command, |state| {
            let mask = device_mask.unwrap_or(state.device_mask);
            ensure_contract!(
                mask != 0 && mask & !state.initial_device_mask == 0,
                "render pass device mask {:#b} is not a subset of {:#b}",
                mask,
                state.initial_device_mask
            );
            state.active = Some(ActiveRenderPass {
                render_pass: Arc::clone(render_pass),
                framebuffer: Arc::clone(framebuffer),
                subpass: 0,
                contents,
                device_mask: mask,
                mask_before: state.device_mask,
            });
            state.device_mask = mask;
            Ok(())
        })
    }

    /// Advance to the next subpass
    pub fn next_subpass(&self, contents: vk::SubpassContents) -> CrucibleResult<()> {
        self.require_primary("vkCmdNextSubpass")?;
        self.record_with(Command::NextSubpass { contents }, |state| {
            let Some(active) = state.active.as_mut() else {
                return Err(contract_violation("vkCmdNextSubpass without an active render pass"));
            };
            ensure_contract!(
                active.subpass + 1 < active.render_pass.n_subpasses(),
                "render pass has no subpass after {}",
                active.subpass
            );
            active.subpass += 1;
            active.contents = contents;
            Ok(())
        })
    }

    /// End the render pass instance
    ///
    /// Attachment images take the render pass's final layouts.
    pub fn end_render_pass(&self) -> CrucibleResult<()> {
        self.require_primary("vkCmdEndRenderPass")?;
        self.record_with(Command::EndRenderPass, |state| {
            let Some(active) = state.active.as_ref() else {
                return Err(contract_violation("vkCmdEndRenderPass without an active render pass"));
            };
            let last = active.render_pass.n_subpasses() - 1;
            ensure_contract!(
                active.subpass == last,
                "render pass ended in subpass {} of {}",
                active.subpass,
                last + 1
            );

            for (view, attachment) in active
                .framebuffer
                .attachments()
                .iter()
                .zip(&active.render_pass.desc().attachments)
            {
                view.image().set_current_layout(attachment.final_layout);
            }

            state.device_mask = active.mask_before;
            state.active = None;
            Ok(())
        })
    }

    /// Execute secondaries
    ///
    /// Inside a render pass every secondary must continue a compatible
    /// render pass at the current subpass; outside, none may.
    pub fn execute_commands(&self, secondaries: &[Arc<CommandBuffer>]) -> CrucibleResult<()> {
        self.require_primary("vkCmdExecuteCommands")?;
        ensure_contract!(!secondaries.is_empty(), "vkCmdExecuteCommands with no command buffers");

        // Read before taking our own locks; a secondary never locks a primary.
        let snapshots: Vec<SecondarySnapshot> = secondaries
            .iter()
            .map(|secondary| {
                let state = lock_state(&secondary.state);
                SecondarySnapshot {
                    id: secondary.id,
                    handle: secondary.handle,
                    kind: secondary.kind,
                    recording: state.recording,
                    executable: state.executable,
                    continues: state
                        .continues_render_pass
                        .then(|| state.inheritance.as_ref())
                        .flatten()
                        .and_then(|i| i.render_pass.as_ref().map(|rp| (Arc::clone(rp), i.subpass))),
                }
            })
            .collect();

        self.record_with(Command::ExecuteCommands(secondaries.to_vec()), |state| {
            for snapshot in &snapshots {
                ensure_contract!(
                    snapshot.kind == CommandBufferKind::Secondary,
                    "command buffer {} executed from a primary is not secondary",
                    snapshot.id
                );
                ensure_contract!(
                    !snapshot.recording && snapshot.executable,
                    "secondary {} ({:?}) is not in the executable state",
                    snapshot.id,
                    snapshot.handle
                );

                match (state.active.as_ref(), snapshot.continues.as_ref()) {
                    (Some(active), Some((render_pass, subpass))) => {
                        ensure_contract!(
                            active.render_pass.is_compatible_with(render_pass) && *subpass == active.subpass,
                            "secondary {} continues subpass {} of an incompatible render pass (active subpass {})",
                            snapshot.id,
                            subpass,
                            active.subpass
                        );
                    }
                    (Some(_), None) => {
                        return Err(contract_violation(format!(
                            "secondary {} executed inside a render pass was not begun with RENDER_PASS_CONTINUE",
                            snapshot.id
                        )));
                    }
                    (None, Some(_)) => {
                        return Err(contract_violation(format!(
                            "render-pass secondary {} executed outside a render pass",
                            snapshot.id
                        )));
                    }
                    (None, None) => {}
                }
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Barriers and events
    // -----------------------------------------------------------------------

    /// Record a pipeline barrier
    ///
    /// Once the barrier passes validation, listeners of
    /// `PipelineBarrierRecorded` on the device bus are notified before it is
    /// issued. They must not record into this buffer. Image barriers update
    /// the tracked layout of their images.
    pub fn pipeline_barrier(&self, barrier: PipelineBarrier) -> CrucibleResult<()> {
        let barrier = Arc::new(barrier);
        let tracked = Arc::clone(&barrier);
        self.record_with(Command::PipelineBarrier(barrier), move |_| {
            self.device.bus().callback(&CallbackArg::PipelineBarrierRecorded {
                command_buffer: self.id,
                barrier: Arc::clone(&tracked),
            });
            track_layouts(&tracked);
            Ok(())
        })
    }

    /// Wait on events, then apply `barrier`
    pub fn wait_events(&self, events: &[Arc<Event>], barrier: PipelineBarrier) -> CrucibleResult<()> {
        ensure_contract!(!events.is_empty(), "vkCmdWaitEvents with no events");
        let barrier = Arc::new(barrier);
        let tracked = Arc::clone(&barrier);
        self.record_with(
            Command::WaitEvents {
                events: events.to_vec(),
                barrier,
            },
            move |_| {
                track_layouts(&tracked);
                Ok(())
            },
        )
    }

    /// Signal `event` once `stages` complete
    ///
    /// On device groups exactly one device may be active.
    pub fn set_event(&self, event: &Arc<Event>, stages: vk::PipelineStageFlags) -> CrucibleResult<()> {
        self.record_with(
            Command::SetEvent {
                event: Arc::clone(event),
                stages,
            },
            |state| {
                ensure_contract!(
                    state.device_mask.is_power_of_two(),
                    "vkCmdSetEvent needs exactly one active device, mask is {:#b}",
                    state.device_mask
                );
                Ok(())
            },
        )
    }

    /// Unsignal `event` once `stages` complete
    pub fn reset_event(&self, event: &Arc<Event>, stages: vk::PipelineStageFlags) -> CrucibleResult<()> {
        self.record(Command::ResetEvent {
            event: Arc::clone(event),
            stages,
        })
    }

    // -----------------------------------------------------------------------
    // Bindings
    // -----------------------------------------------------------------------

    /// Bind a pipeline
    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) -> CrucibleResult<()> {
        ensure_contract!(pipeline != vk::Pipeline::null(), "binding a null pipeline");
        self.record(Command::BindPipeline { bind_point, pipeline })
    }

    /// Bind descriptor sets
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: &Arc<PipelineLayout>,
        first_set: u32,
        sets: &[Arc<DescriptorSet>],
        dynamic_offsets: &[u32],
    ) -> CrucibleResult<()> {
        self.record(Command::BindDescriptorSets {
            bind_point,
            layout: Arc::clone(layout),
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        })
    }

    /// Bind an index buffer
    pub fn bind_index_buffer(&self, buffer: &Arc<Buffer>, offset: u64, index_type: vk::IndexType) -> CrucibleResult<()> {
        self.record(Command::BindIndexBuffer {
            buffer: Arc::clone(buffer),
            offset,
            index_type,
        })
    }

    /// Bind vertex buffers starting at `first_binding`
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[Arc<Buffer>], offsets: &[u64]) -> CrucibleResult<()> {
        ensure_contract!(
            buffers.len() == offsets.len(),
            "{} vertex buffer(s) but {} offset(s)",
            buffers.len(),
            offsets.len()
        );
        self.record(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        })
    }

    /// Update push constants with the bytes of `value`
    pub fn push_constants<T: bytemuck::Pod>(
        &self,
        layout: &Arc<PipelineLayout>,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> CrucibleResult<()> {
        self.push_constant_bytes(layout, stages, offset, bytemuck::bytes_of(value))
    }

    /// Update push constants with raw bytes
    ///
    /// The range must be 4-byte aligned and covered by a push constant range
    /// of `layout` visible to every stage in `stages`.
    pub fn push_constant_bytes(
        &self,
        layout: &Arc<PipelineLayout>,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> CrucibleResult<()> {
        let size = u32::try_from(data.len()).map_err(|_| contract_violation("push constant data too large"))?;
        ensure_contract!(
            offset % 4 == 0 && size % 4 == 0 && size > 0,
            "push constant range {}+{} must be non-empty and 4-byte aligned",
            offset,
            size
        );
        let covered = layout.desc().push_constant_ranges.iter().any(|range| {
            range.stages.contains(stages)
                && range.offset <= offset
                && u64::from(offset) + u64::from(size) <= u64::from(range.offset) + u64::from(range.size)
        });
        ensure_contract!(
            covered,
            "push constant range {}+{} for {:?} is not declared by the pipeline layout",
            offset,
            size,
            stages
        );

        self.record(Command::PushConstants {
            layout: Arc::clone(layout),
            stages,
            offset,
            data: data.to_vec(),
        })
    }

    // -----------------------------------------------------------------------
    // Dynamic state
    // -----------------------------------------------------------------------

    /// Set viewports starting at `first_viewport`
    pub fn set_viewport(&self, first_viewport: u32, viewports: &[ViewportDesc]) -> CrucibleResult<()> {
        ensure_contract!(!viewports.is_empty(), "vkCmdSetViewport with no viewports");
        ensure_contract!(
            first_viewport as usize + viewports.len() <= self.device.capabilities().max_viewports as usize,
            "viewports {}..{} exceed the device limit",
            first_viewport,
            first_viewport as usize + viewports.len()
        );
        self.record(Command::SetViewport {
            first_viewport,
            viewports: viewports.to_vec(),
        })
    }

    /// Set scissors starting at `first_scissor`
    pub fn set_scissor(&self, first_scissor: u32, scissors: &[ScissorDesc]) -> CrucibleResult<()> {
        ensure_contract!(!scissors.is_empty(), "vkCmdSetScissor with no scissors");
        ensure_contract!(
            scissors.iter().all(|s| s.x >= 0 && s.y >= 0),
            "scissor offsets must not be negative"
        );
        self.record(Command::SetScissor {
            first_scissor,
            scissors: scissors.to_vec(),
        })
    }

    /// Set the line width
    pub fn set_line_width(&self, width: f32) -> CrucibleResult<()> {
        self.record(Command::SetLineWidth(width))
    }

    /// Set blend constants
    pub fn set_blend_constants(&self, constants: [f32; 4]) -> CrucibleResult<()> {
        self.record(Command::SetBlendConstants(constants))
    }

    /// Set depth bias
    pub fn set_depth_bias(&self, constant_factor: f32, clamp: f32, slope_factor: f32) -> CrucibleResult<()> {
        self.record(Command::SetDepthBias {
            constant_factor,
            clamp,
            slope_factor,
        })
    }

    /// Set depth bounds
    pub fn set_depth_bounds(&self, min: f32, max: f32) -> CrucibleResult<()> {
        ensure_contract!(min <= max, "depth bounds {} > {}", min, max);
        self.record(Command::SetDepthBounds { min, max })
    }

    /// Set the stencil compare mask
    pub fn set_stencil_compare_mask(&self, faces: vk::StencilFaceFlags, mask: u32) -> CrucibleResult<()> {
        self.record(Command::SetStencilCompareMask { faces, mask })
    }

    /// Set the stencil write mask
    pub fn set_stencil_write_mask(&self, faces: vk::StencilFaceFlags, mask: u32) -> CrucibleResult<()> {
        self.record(Command::SetStencilWriteMask { faces, mask })
    }

    /// Set the stencil reference
    pub fn set_stencil_reference(&self, faces: vk::StencilFaceFlags, reference: u32) -> CrucibleResult<()> {
        self.record(Command::SetStencilReference { faces, reference })
    }

    /// Narrow the set of devices subsequent commands execute on
    ///
    /// Inside a render pass the mask must be a subset of the render pass's
    /// device mask.
    pub fn set_device_mask(&self, mask: u32) -> CrucibleResult<()> {
        let group_mask = self.device.device_group_mask();
        self.record_with(Command::SetDeviceMask(mask), |state| {
            ensure_contract!(
                mask != 0 && mask & !group_mask == 0,
                "device mask {:#b} is not a non-empty subset of the device group {:#b}",
                mask,
                group_mask
            );
            if let Some(active) = state.active.as_ref() {
                ensure_contract!(
                    mask & !active.device_mask == 0,
                    "device mask {:#b} exceeds the render pass device mask {:#b}",
                    mask,
                    active.device_mask
                );
            }
            state.device_mask = mask;
            Ok(())
        })
    }

    /// Set custom sample locations
    pub fn set_sample_locations(&self, locations: SampleLocationsDesc) -> CrucibleResult<()> {
        if !self.device.capabilities().supports_sample_locations {
            log::error!("vkCmdSetSampleLocationsEXT: device lacks VK_EXT_sample_locations");
            return Err(CrucibleError::Unsupported("sample locations".to_string()));
        }
        self.record(Command::SetSampleLocations(locations))
    }

    // -----------------------------------------------------------------------
    // Draws and dispatches
    // -----------------------------------------------------------------------

    /// Draw non-indexed primitives
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> CrucibleResult<()> {
        self.record(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    /// Draw indexed primitives
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> CrucibleResult<()> {
        self.record(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    /// Draw with parameters read from `buffer`
    pub fn draw_indirect(&self, buffer: &Arc<Buffer>, offset: u64, draw_count: u32, stride: u32) -> CrucibleResult<()> {
        self.record(Command::DrawIndirect {
            buffer: Arc::clone(buffer),
            offset,
            draw_count,
            stride,
        })
    }

    /// Indexed draw with parameters read from `buffer`
    pub fn draw_indexed_indirect(&self, buffer: &Arc<Buffer>, offset: u64, draw_count: u32, stride: u32) -> CrucibleResult<()> {
        self.record(Command::DrawIndexedIndirect {
            buffer: Arc::clone(buffer),
            offset,
            draw_count,
            stride,
        })
    }

    /// Indirect draw whose count is read from `count_buffer`
    pub fn draw_indirect_count(
        &self,
        indexed: bool,
        buffer: &Arc<Buffer>,
        offset: u64,
        count_buffer: &Arc<Buffer>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) -> CrucibleResult<()> {
        ensure_contract!(count_offset % 4 == 0, "count buffer offset {} is not 4-byte aligned", count_offset);
        self.record(Command::DrawIndirectCount {
            indexed,
            buffer: Arc::clone(buffer),
            offset,
            count_buffer: Arc::clone(count_buffer),
            count_offset,
            max_draw_count,
            stride,
        })
    }

    /// Dispatch compute work groups
    pub fn dispatch(&self, x: u32, y: u32, z: u32) -> CrucibleResult<()> {
        self.record(Command::Dispatch { group_count: [x, y, z] })
    }

    /// Dispatch with parameters read from `buffer`
    pub fn dispatch_indirect(&self, buffer: &Arc<Buffer>, offset: u64) -> CrucibleResult<()> {
        self.record(Command::DispatchIndirect {
            buffer: Arc::clone(buffer),
            offset,
        })
    }

    /// Dispatch starting at a non-zero work group
    pub fn dispatch_base(&self, base_group: [u32; 3], group_count: [u32; 3]) -> CrucibleResult<()> {
        self.record(Command::DispatchBase { base_group, group_count })
    }

    // -----------------------------------------------------------------------
    // Transfers and clears
    // -----------------------------------------------------------------------

    /// Copy buffer regions
    pub fn copy_buffer(&self, src: &Arc<Buffer>, dst: &Arc<Buffer>, regions: &[vk::BufferCopy]) -> CrucibleResult<()> {
        ensure_contract!(!regions.is_empty(), "vkCmdCopyBuffer with no regions");
        ensure_contract!(
            regions
                .iter()
                .all(|r| fits(r.src_offset, r.size, src.size()) && fits(r.dst_offset, r.size, dst.size())),
            "vkCmdCopyBuffer region out of bounds"
        );
        self.record(Command::CopyBuffer {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            regions: regions.to_vec(),
        })
    }

    /// Copy image regions
    pub fn copy_image(
        &self,
        src: &Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: &Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) -> CrucibleResult<()> {
        self.record(Command::CopyImage {
            src: Arc::clone(src),
            src_layout,
            dst: Arc::clone(dst),
            dst_layout,
            regions: regions.to_vec(),
        })
    }

    /// Copy buffer contents into an image
    pub fn copy_buffer_to_image(
        &self,
        src: &Arc<Buffer>,
        dst: &Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) -> CrucibleResult<()> {
        self.record(Command::CopyBufferToImage {
            src: Arc::clone(src),
            dst: Arc::clone(dst),
            dst_layout,
            regions: regions.to_vec(),
        })
    }

    /// Copy image contents into a buffer
    pub fn copy_image_to_buffer(
        &self,
        src: &Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: &Arc<Buffer>,
        regions: &[vk::BufferImageCopy],
    ) -> CrucibleResult<()> {
        self.record(Command::CopyImageToBuffer {
            src: Arc::clone(src),
            src_layout,
            dst: Arc::clone(dst),
            regions: regions.to_vec(),
        })
    }

    /// Blit image regions with scaling
    pub fn blit_image(
        &self,
        src: &Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: &Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) -> CrucibleResult<()> {
        self.record(Command::BlitImage {
            src: Arc::clone(src),
            src_layout,
            dst: Arc::clone(dst),
            dst_layout,
            regions: regions.to_vec(),
            filter,
        })
    }

    /// Resolve a multisampled image
    pub fn resolve_image(
        &self,
        src: &Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: &Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) -> CrucibleResult<()> {
        ensure_contract!(
            src.desc().samples != vk::SampleCountFlags::TYPE_1,
            "vkCmdResolveImage source is single-sampled"
        );
        self.record(Command::ResolveImage {
            src: Arc::clone(src),
            src_layout,
            dst: Arc::clone(dst),
            dst_layout,
            regions: regions.to_vec(),
        })
    }

    /// Clear color image subresources
    pub fn clear_color_image(
        &self,
        image: &Arc<Image>,
        layout: vk::ImageLayout,
        color: ClearColor,
        ranges: &[vk::ImageSubresourceRange],
    ) -> CrucibleResult<()> {
        ensure_contract!(
            matches!(
                layout,
                vk::ImageLayout::GENERAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL | vk::ImageLayout::SHARED_PRESENT_KHR
            ),
            "vkCmdClearColorImage with layout {:?}",
            layout
        );
        self.record(Command::ClearColorImage {
            image: Arc::clone(image),
            layout,
            color,
            ranges: ranges.to_vec(),
        })
    }

    /// Clear depth/stencil image subresources
    pub fn clear_depth_stencil_image(
        &self,
        image: &Arc<Image>,
        layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: &[vk::ImageSubresourceRange],
    ) -> CrucibleResult<()> {
        self.record(Command::ClearDepthStencilImage {
            image: Arc::clone(image),
            layout,
            depth,
            stencil,
            ranges: ranges.to_vec(),
        })
    }

    /// Clear regions of the current subpass's attachments
    pub fn clear_attachments(&self, attachments: &[ClearAttachment], rects: &[vk::ClearRect]) -> CrucibleResult<()> {
        ensure_contract!(
            !attachments.is_empty() && !rects.is_empty(),
            "vkCmdClearAttachments needs attachments and rects"
        );
        self.record(Command::ClearAttachments {
            attachments: attachments.to_vec(),
            rects: rects.to_vec(),
        })
    }

    /// Fill a buffer range with a repeated word
    pub fn fill_buffer(&self, buffer: &Arc<Buffer>, offset: u64, size: u64, data: u32) -> CrucibleResult<()> {
        ensure_contract!(offset % 4 == 0, "vkCmdFillBuffer offset {} is not 4-byte aligned", offset);
        self.record(Command::FillBuffer {
            buffer: Arc::clone(buffer),
            offset,
            size,
            data,
        })
    }

    /// Write inline data into a buffer
    pub fn update_buffer(&self, buffer: &Arc<Buffer>, offset: u64, data: &[u8]) -> CrucibleResult<()> {
        ensure_contract!(
            data.len() <= 65536 && data.len() % 4 == 0 && offset % 4 == 0,
            "vkCmdUpdateBuffer takes at most 65536 aligned bytes, got {} at {}",
            data.len(),
            offset
        );
        self.record(Command::UpdateBuffer {
            buffer: Arc::clone(buffer),
            offset,
            data: data.to_vec(),
        })
    }

    // -----------------------------------------------------------------------
    // Transform feedback
    // -----------------------------------------------------------------------

    /// Begin transform feedback
    pub fn begin_transform_feedback(
        &self,
        first_counter_buffer: u32,
        counter_buffers: &[Arc<Buffer>],
        counter_offsets: &[u64],
    ) -> CrucibleResult<()> {
        self.require_transform_feedback()?;
        self.record(Command::BeginTransformFeedback {
            first_counter_buffer,
            counter_buffers: counter_buffers.to_vec(),
            counter_offsets: counter_offsets.to_vec(),
        })
    }

    /// End transform feedback
    pub fn end_transform_feedback(
        &self,
        first_counter_buffer: u32,
        counter_buffers: &[Arc<Buffer>],
        counter_offsets: &[u64],
    ) -> CrucibleResult<()> {
        self.require_transform_feedback()?;
        self.record(Command::EndTransformFeedback {
            first_counter_buffer,
            counter_buffers: counter_buffers.to_vec(),
            counter_offsets: counter_offsets.to_vec(),
        })
    }

    fn require_transform_feedback(&self) -> CrucibleResult<()> {
        if self.device.capabilities().supports_transform_feedback {
            Ok(())
        } else {
            log::error!("Transform feedback requested but VK_EXT_transform_feedback is unavailable");
            Err(CrucibleError::Unsupported("transform feedback".to_string()))
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Begin a query
    pub fn begin_query(&self, pool: &Arc<QueryPool>, query: u32, flags: vk::QueryControlFlags) -> CrucibleResult<()> {
        ensure_contract!(query < pool.query_count(), "query {} out of range", query);
        self.record(Command::BeginQuery {
            pool: Arc::clone(pool),
            query,
            flags,
        })
    }

    /// End a query
    pub fn end_query(&self, pool: &Arc<QueryPool>, query: u32) -> CrucibleResult<()> {
        ensure_contract!(query < pool.query_count(), "query {} out of range", query);
        self.record(Command::EndQuery {
            pool: Arc::clone(pool),
            query,
        })
    }

    /// Write a timestamp once `stage` completes
    pub fn write_timestamp(&self, stage: vk::PipelineStageFlags, pool: &Arc<QueryPool>, query: u32) -> CrucibleResult<()> {
        ensure_contract!(
            pool.query_type() == vk::QueryType::TIMESTAMP,
            "vkCmdWriteTimestamp into a {:?} pool",
            pool.query_type()
        );
        ensure_contract!(query < pool.query_count(), "query {} out of range", query);
        self.record(Command::WriteTimestamp {
            stage,
            pool: Arc::clone(pool),
            query,
        })
    }

    /// Reset a range of queries
    pub fn reset_query_pool(&self, pool: &Arc<QueryPool>, first_query: u32, query_count: u32) -> CrucibleResult<()> {
        ensure_contract!(
            first_query
                .checked_add(query_count)
                .is_some_and(|end| end <= pool.query_count()),
            "{} query(ies) from {} out of range",
            query_count,
            first_query
        );
        self.record(Command::ResetQueryPool {
            pool: Arc::clone(pool),
            first_query,
            query_count,
        })
    }

    // -----------------------------------------------------------------------
    // Debug labels
    // -----------------------------------------------------------------------

    /// Open a debug label region
    pub fn begin_debug_label(&self, name: &str, color: [f32; 4]) -> CrucibleResult<()> {
        self.record_with(
            Command::BeginDebugLabel {
                name: name.to_string(),
                color,
            },
            |state| {
                state.debug_label_depth += 1;
                Ok(())
            },
        )
    }

    /// Close the innermost debug label region
    pub fn end_debug_label(&self) -> CrucibleResult<()> {
        self.record_with(Command::EndDebugLabel, |state| {
            ensure_contract!(state.debug_label_depth > 0, "vkCmdEndDebugUtilsLabelEXT without an open label");
            state.debug_label_depth -= 1;
            Ok(())
        })
    }

    /// Insert a single debug label
    pub fn insert_debug_label(&self, name: &str, color: [f32; 4]) -> CrucibleResult<()> {
        self.record(Command::InsertDebugLabel {
            name: name.to_string(),
            color,
        })
    }
}

/// Whether `[offset, offset + size)` lies within `limit` bytes
fn fits(offset: vk::DeviceSize, size: vk::DeviceSize, limit: vk::DeviceSize) -> bool {
    offset.checked_add(size).is_some_and(|end| end <= limit)
}

fn track_layouts(barrier: &PipelineBarrier) {
    for image_barrier in &barrier.image_barriers {
        image_barrier.image.set_current_layout(image_barrier.new_layout);
    }
}

impl_debug_named!(CommandBuffer);

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let _pool_guard = self.pool.lock.lock();
        self.device.native().free_command_buffer(self.pool.handle(), self.handle);
        log::trace!("Command buffer {} freed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ImageBarrier, PipelineBarrier};
    use crate::core::mt::MtSafety;
    use crate::events::CallbackId;
    use crate::native::{NativeCall, PipelineLayoutDesc, PushConstantRangeDesc};
    use crate::resources::ImageView;
    use crate::tests::{full_area, Harness};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Target {
        render_pass: Arc<RenderPass>,
        image: Arc<Image>,
        framebuffer: Arc<Framebuffer>,
    }

    fn target(harness: &Harness) -> Target {
        let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let image = harness.color_image(64, 64);
        let view = ImageView::create_2d(&image).unwrap();
        let framebuffer = harness.framebuffer(vec![view], 64, 64);
        Target {
            render_pass,
            image,
            framebuffer,
        }
    }

    fn primary(harness: &Harness) -> Arc<CommandBuffer> {
        harness
            .pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .alloc_primary(MtSafety::InheritFromParent)
            .unwrap()
    }

    fn begin_pass(cb: &CommandBuffer, target: &Target, contents: vk::SubpassContents) -> CrucibleResult<()> {
        cb.begin_render_pass(
            &target.render_pass,
            &target.framebuffer,
            full_area(64, 64),
            &[ClearValue::Color(ClearColor::BLACK)],
            contents,
            None,
        )
    }

    fn recorded(harness: &Harness) -> usize {
        harness.count_calls(|call| matches!(call, NativeCall::RecordCommand { .. }))
    }

    #[test]
    fn test_lifecycle() {
        let harness = Harness::new();
        let target = target(&harness);
        let cb = primary(&harness);
        assert!(!cb.is_recording() && !cb.is_executable());

        cb.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        assert!(cb.is_recording());
        begin_pass(&cb, &target, vk::SubpassContents::INLINE).unwrap();
        assert!(cb.is_inside_render_pass());
        cb.draw(3, 1, 0, 0).unwrap();
        cb.end_render_pass().unwrap();
        assert!(!cb.is_inside_render_pass());
        cb.end_recording().unwrap();

        assert!(cb.is_executable());
        assert_eq!(target.image.current_layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(recorded(&harness), 3);
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_render_pass_only_commands_are_rejected_outside() {
        let harness = Harness::new();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();

        assert!(cb.draw(3, 1, 0, 0).unwrap_err().is_contract_violation());
        assert!(cb.next_subpass(vk::SubpassContents::INLINE).unwrap_err().is_contract_violation());
        assert!(cb.end_render_pass().unwrap_err().is_contract_violation());
        assert_eq!(recorded(&harness), 0);

        // The buffer is still usable
        cb.dispatch(1, 1, 1).unwrap();
        cb.end_recording().unwrap();
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_transfer_commands_are_rejected_inside() {
        let harness = Harness::new();
        let target = target(&harness);
        let other = harness.color_image(64, 64);
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        begin_pass(&cb, &target, vk::SubpassContents::INLINE).unwrap();

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let clear = cb.clear_color_image(&other, vk::ImageLayout::TRANSFER_DST_OPTIMAL, ClearColor::BLACK, &[range]);
        assert!(clear.unwrap_err().is_contract_violation());
        assert!(cb.dispatch(1, 1, 1).unwrap_err().is_contract_violation());
        assert!(cb.end_recording().unwrap_err().is_contract_violation());

        cb.end_render_pass().unwrap();
        cb.end_recording().unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_rerecording_needs_individual_reset() {
        let harness = Harness::new();
        let cb = harness
            .pool(vk::CommandPoolCreateFlags::empty())
            .alloc_primary(MtSafety::InheritFromParent)
            .unwrap();
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.end_recording().unwrap();

        assert!(cb
            .begin_recording(vk::CommandBufferUsageFlags::empty())
            .unwrap_err()
            .is_contract_violation());
        assert!(cb.reset(false).unwrap_err().is_contract_violation());

        // A pool reset brings it back to the initial state
        cb.pool().reset(false).unwrap();
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.end_recording().unwrap();
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_reset_while_recording_is_rejected() {
        let harness = Harness::new();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert!(cb.reset(true).unwrap_err().is_contract_violation());
        assert!(cb.is_recording());
        assert_eq!(
            harness.count_calls(|call| matches!(call, NativeCall::ResetCommandBuffer(_))),
            0
        );
    }

    #[cfg(feature = "command-stash")]
    #[test]
    fn test_stash_lasts_until_reset() {
        let harness = Harness::new();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.dispatch(4, 4, 1).unwrap();
        cb.insert_debug_label("marker", [1.0; 4]).unwrap();
        cb.end_recording().unwrap();

        let names: Vec<&str> = cb.stashed_commands().iter().map(Command::name).collect();
        assert_eq!(names, ["vkCmdDispatch", "vkCmdInsertDebugUtilsLabelEXT"]);

        cb.reset(true).unwrap();
        assert_eq!(cb.n_stashed_commands(), 0);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert_eq!(cb.n_stashed_commands(), 0);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_levels_are_enforced() {
        let harness = Harness::new();
        let target = target(&harness);
        let pool = harness.pool(vk::CommandPoolCreateFlags::empty());
        let primary = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        let secondary = pool.alloc_secondary(MtSafety::InheritFromParent).unwrap();

        assert!(secondary
            .begin_recording(vk::CommandBufferUsageFlags::empty())
            .unwrap_err()
            .is_contract_violation());
        assert!(primary
            .begin_secondary_recording(vk::CommandBufferUsageFlags::empty(), Inheritance::default())
            .unwrap_err()
            .is_contract_violation());
        assert!(primary
            .begin_recording(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE)
            .unwrap_err()
            .is_contract_violation());

        secondary
            .begin_secondary_recording(vk::CommandBufferUsageFlags::empty(), Inheritance::default())
            .unwrap();
        assert!(begin_pass(&secondary, &target, vk::SubpassContents::INLINE)
            .unwrap_err()
            .is_contract_violation());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_execute_needs_executable_secondary() {
        let harness = Harness::new();
        let pool = harness.pool(vk::CommandPoolCreateFlags::empty());
        let primary = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        let secondary = pool.alloc_secondary(MtSafety::InheritFromParent).unwrap();

        primary.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        let never_recorded = primary.execute_commands(&[Arc::clone(&secondary)]);
        assert!(never_recorded.unwrap_err().is_contract_violation());

        secondary
            .begin_secondary_recording(vk::CommandBufferUsageFlags::empty(), Inheritance::default())
            .unwrap();
        secondary.dispatch(1, 1, 1).unwrap();
        let still_recording = primary.execute_commands(&[Arc::clone(&secondary)]);
        assert!(still_recording.unwrap_err().is_contract_violation());

        secondary.end_recording().unwrap();
        primary.execute_commands(&[secondary]).unwrap();
        primary.end_recording().unwrap();
        harness.assert_valid();
    }

    #[test]
    fn test_barrier_notifies_bus_and_tracks_layout() {
        let harness = Harness::new();
        let image = harness.color_image(16, 16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        harness.device.bus().register(CallbackId::PipelineBarrierRecorded, move |arg| {
            if let CallbackArg::PipelineBarrierRecorded { barrier, .. } = arg {
                counter.fetch_add(barrier.image_barriers.len(), Ordering::SeqCst);
            }
        });

        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.pipeline_barrier(
            PipelineBarrier::new(vk::PipelineStageFlags::TOP_OF_PIPE, vk::PipelineStageFlags::TRANSFER)
                .with_image_barrier(ImageBarrier::transition(
                    &image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )),
        )
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(image.current_layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_push_constants_must_fit_the_layout() {
        let harness = Harness::new();
        let layout = PipelineLayout::create(
            &harness.device,
            PipelineLayoutDesc {
                set_layouts: Vec::new(),
                push_constant_ranges: vec![PushConstantRangeDesc {
                    stages: vk::ShaderStageFlags::VERTEX,
                    offset: 0,
                    size: 16,
                }],
            },
        )
        .unwrap();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();

        cb.push_constants(&layout, vk::ShaderStageFlags::VERTEX, 0, &[0.5f32; 4])
            .unwrap();
        cb.push_constants(&layout, vk::ShaderStageFlags::VERTEX, 8, &[1u32; 2])
            .unwrap();

        let past_end = cb.push_constants(&layout, vk::ShaderStageFlags::VERTEX, 8, &[0u32; 4]);
        assert!(past_end.unwrap_err().is_contract_violation());
        let wrong_stage = cb.push_constants(&layout, vk::ShaderStageFlags::FRAGMENT, 0, &0u32);
        assert!(wrong_stage.unwrap_err().is_contract_violation());
        let unaligned = cb.push_constant_bytes(&layout, vk::ShaderStageFlags::VERTEX, 2, &[0; 4]);
        assert!(unaligned.unwrap_err().is_contract_violation());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_overflowing_ranges_are_rejected() {
        let harness = Harness::new();
        let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let src = crate::resources::Buffer::create(&harness.device, 64, usage, false).unwrap();
        let dst = crate::resources::Buffer::create(&harness.device, 64, usage, false).unwrap();
        let queries = crate::resources::QueryPool::create(
            &harness.device,
            vk::QueryType::TIMESTAMP,
            4,
            vk::QueryPipelineStatisticFlags::empty(),
        )
        .unwrap();
        let layout = PipelineLayout::create(
            &harness.device,
            PipelineLayoutDesc {
                set_layouts: Vec::new(),
                push_constant_ranges: vec![PushConstantRangeDesc {
                    stages: vk::ShaderStageFlags::VERTEX,
                    offset: 0,
                    size: 16,
                }],
            },
        )
        .unwrap();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();

        let copy = vk::BufferCopy {
            src_offset: u64::MAX - 3,
            dst_offset: 0,
            size: 8,
        };
        assert!(cb.copy_buffer(&src, &dst, &[copy]).unwrap_err().is_contract_violation());
        assert!(cb.reset_query_pool(&queries, u32::MAX, 2).unwrap_err().is_contract_violation());
        let push = cb.push_constant_bytes(&layout, vk::ShaderStageFlags::VERTEX, u32::MAX - 3, &[0; 8]);
        assert!(push.unwrap_err().is_contract_violation());
        cb.reset_query_pool(&queries, 0, 4).unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_secondary_contents_only_allow_execute() {
        let harness = Harness::new();
        let target = target(&harness);
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        begin_pass(&cb, &target, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS).unwrap();

        assert!(cb.draw(3, 1, 0, 0).unwrap_err().is_contract_violation());
        assert!(cb.set_line_width(1.0).unwrap_err().is_contract_violation());
        cb.end_render_pass().unwrap();
        cb.end_recording().unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_rejected_barrier_is_not_announced() {
        let harness = Harness::new();
        let target = target(&harness);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        harness.device.bus().register(CallbackId::PipelineBarrierRecorded, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        begin_pass(&cb, &target, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS).unwrap();
        let barrier = PipelineBarrier::new(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        );
        assert!(cb.pipeline_barrier(barrier).unwrap_err().is_contract_violation());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_subpass_walk_is_bounded() {
        let harness = Harness::new();
        let mut info = crate::render_pass::RenderPassCreateInfo::new(&harness.device);
        let color = info.add_color_attachment(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::GENERAL,
            false,
        );
        for _ in 0..2 {
            let subpass = info.add_subpass();
            info.add_subpass_color_attachment(subpass, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color, 0, None)
                .unwrap();
        }
        let render_pass = RenderPass::create(&info, None).unwrap();
        let image = harness.color_image(32, 32);
        let framebuffer = harness.framebuffer(vec![ImageView::create_2d(&image).unwrap()], 32, 32);

        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        cb.begin_render_pass(
            &render_pass,
            &framebuffer,
            full_area(32, 32),
            &[],
            vk::SubpassContents::INLINE,
            None,
        )
        .unwrap();
        assert!(cb.end_render_pass().unwrap_err().is_contract_violation());
        cb.next_subpass(vk::SubpassContents::INLINE).unwrap();
        assert!(cb
            .next_subpass(vk::SubpassContents::INLINE)
            .unwrap_err()
            .is_contract_violation());
        cb.end_render_pass().unwrap();
        cb.end_recording().unwrap();
        assert_eq!(image.current_layout(), vk::ImageLayout::GENERAL);
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_debug_labels_must_balance() {
        let harness = Harness::new();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert!(cb.end_debug_label().unwrap_err().is_contract_violation());

        cb.begin_debug_label("shadows", [0.2, 0.2, 0.2, 1.0]).unwrap();
        assert!(cb.end_recording().unwrap_err().is_contract_violation());
        cb.end_debug_label().unwrap();
        cb.end_recording().unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_set_event_needs_a_single_device() {
        let harness = Harness::multi_gpu(2);
        let event = Event::create(&harness.device).unwrap();
        let cb = primary(&harness);
        cb.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
        assert_eq!(cb.device_mask(), 0b11);

        let both = cb.set_event(&event, vk::PipelineStageFlags::TRANSFER);
        assert!(both.unwrap_err().is_contract_violation());
        cb.set_device_mask(0b10).unwrap();
        cb.set_event(&event, vk::PipelineStageFlags::TRANSFER).unwrap();
        cb.end_recording().unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_render_pass_device_mask_bounds_later_masks() {
        let harness = Harness::multi_gpu(2);
        let target = target(&harness);
        let cb = primary(&harness);
        cb.begin_recording_with_device_mask(vk::CommandBufferUsageFlags::empty(), 0b11)
            .unwrap();
        cb.begin_render_pass(
            &target.render_pass,
            &target.framebuffer,
            full_area(64, 64),
            &[ClearValue::Color(ClearColor::BLACK)],
            vk::SubpassContents::INLINE,
            Some(0b01),
        )
        .unwrap();
        assert_eq!(cb.device_mask(), 0b01);
        assert!(cb.set_device_mask(0b10).unwrap_err().is_contract_violation());

        cb.end_render_pass().unwrap();
        assert_eq!(cb.device_mask(), 0b11);
        cb.set_device_mask(0b10).unwrap();
        cb.end_recording().unwrap();
    }
}
