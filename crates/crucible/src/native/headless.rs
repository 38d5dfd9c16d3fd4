//! Software driver
//!
//! [`HeadlessDevice`] implements the native entry points on the host. It
//! hands out unique handles, keeps a journal of the calls that matter to
//! the framework, and checks the usage rules a validation layer would:
//! - command buffer states at record, execute and submit time
//! - semaphore and fence signal states
//! - destroys of unknown handles
//!
//! Violations are collected, never fatal, and can be inspected through
//! [`HeadlessDevice::validation_errors`].
//!
//! Submissions execute immediately. Clears (color image clears, render pass
//! load-op clears and color attachment clears) and image copies are applied
//! to RGBA8 backing stores, so read-backs and snapshots show real contents.
//! Draws are accepted but not rasterized.

use ash::vk::{self, Handle};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::command::{ClearValue, Command};
use crate::core::mt::lock_state;

use super::desc::*;
use super::{NativeDevice, SurfaceTarget};

/// One entry of the call journal
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum NativeCall {
    CreateRenderPass(RenderPassDesc),
    CreateGraphicsPipelines {
        cache: vk::PipelineCache,
        descs: Vec<GraphicsPipelineDesc>,
    },
    DestroyPipeline(vk::Pipeline),
    CreateFramebuffer(FramebufferDesc),
    DestroyFramebuffer(vk::Framebuffer),
    BeginCommandBuffer {
        command_buffer: vk::CommandBuffer,
        desc: CommandBufferBeginDesc,
    },
    RecordCommand {
        command_buffer: vk::CommandBuffer,
        name: &'static str,
    },
    EndCommandBuffer(vk::CommandBuffer),
    ResetCommandBuffer(vk::CommandBuffer),
    ResetCommandPool(vk::CommandPool),
    QueueSubmit {
        queue: vk::Queue,
        submits: Vec<SubmitDesc>,
        fence: vk::Fence,
    },
    QueuePresent(PresentDesc),
    AcquireNextImage {
        swapchain: vk::SwapchainKHR,
        index: u32,
    },
    CreateSwapchain(SwapchainDesc),
    DestroySwapchain(vk::SwapchainKHR),
    SetObjectName {
        object_type: vk::ObjectType,
        raw_handle: u64,
        name: String,
    },
    DeviceWaitIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug, Clone)]
enum Op {
    ClearImage { image: vk::Image, rgba: [u8; 4] },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clears: Vec<Option<[u8; 4]>>,
    },
    NextSubpass,
    EndRenderPass,
    ClearColorAttachment { color_attachment: u32, rgba: [u8; 4] },
    CopyImage { src: vk::Image, dst: vk::Image },
    Execute(Vec<vk::CommandBuffer>),
}

#[derive(Debug)]
struct HeadlessCommandBuffer {
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    state: CommandBufferState,
    /// Render pass and subpass a `RENDER_PASS_CONTINUE` secondary executes in
    continues: Option<(vk::RenderPass, u32)>,
    /// Render pass and subpass while a primary records inside one
    active: Option<(vk::RenderPass, u32)>,
    ops: Vec<Op>,
}

#[derive(Debug)]
struct HeadlessImage {
    desc: ImageDesc,
    pixels: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessSwapchain {
    images: Vec<vk::Image>,
    next: u32,
    acquired: HashSet<u32>,
}

/// Render pass instance while executing a submission
#[derive(Debug, Clone, Copy)]
struct ExecutionScope {
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    subpass: u32,
}

#[derive(Debug, Default)]
struct HeadlessState {
    next_handle: u64,
    live: HashMap<u64, vk::ObjectType>,
    calls: Vec<NativeCall>,
    validation_errors: Vec<String>,
    render_passes: HashMap<u64, RenderPassDesc>,
    pipelines: HashSet<u64>,
    pipeline_caches: HashMap<u64, Vec<u8>>,
    fail_next_batch_at: Option<usize>,
    short_next_batch: bool,
    framebuffers: HashMap<u64, FramebufferDesc>,
    images: HashMap<u64, HeadlessImage>,
    views: HashMap<u64, vk::Image>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    command_buffers: HashMap<u64, HeadlessCommandBuffer>,
    swapchains: HashMap<u64, HeadlessSwapchain>,
    object_names: HashMap<u64, String>,
}

impl HeadlessState {
    fn alloc<H: Handle>(&mut self, object_type: vk::ObjectType) -> H {
        self.next_handle += 1;
        let raw = 0x1000 + self.next_handle;
        self.live.insert(raw, object_type);
        H::from_raw(raw)
    }

    fn release<H: Handle>(&mut self, handle: H, object_type: vk::ObjectType) -> bool {
        let raw = handle.as_raw();
        if raw == 0 {
            return false;
        }
        match self.live.remove(&raw) {
            Some(kind) if kind == object_type => true,
            Some(kind) => {
                self.live.insert(raw, kind);
                self.error(format!("destroy of {raw:#x} as {object_type:?}, but it is a {kind:?}"));
                false
            }
            None => {
                self.error(format!("destroy of unknown or already destroyed {object_type:?} {raw:#x}"));
                false
            }
        }
    }

    fn error(&mut self, message: String) {
        log::warn!("[headless validation] {}", message);
        self.validation_errors.push(message);
    }

    fn new_image(&mut self, desc: ImageDesc) -> vk::Image {
        let image: vk::Image = self.alloc(vk::ObjectType::IMAGE);
        let size = desc.width as usize * desc.height as usize * 4;
        self.images.insert(
            image.as_raw(),
            HeadlessImage {
                desc,
                pixels: vec![0; size],
            },
        );
        image
    }

    fn framebuffer_image(&self, framebuffer: vk::Framebuffer, attachment: u32) -> Option<vk::Image> {
        let desc = self.framebuffers.get(&framebuffer.as_raw())?;
        let view = desc.attachments.get(attachment as usize)?;
        self.views.get(&view.as_raw()).copied()
    }

    fn fill(&mut self, image: vk::Image, rgba: [u8; 4]) {
        if let Some(target) = self.images.get_mut(&image.as_raw()) {
            for pixel in target.pixels.chunks_exact_mut(4) {
                pixel.copy_from_slice(&rgba);
            }
        } else {
            self.error(format!("clear of unknown image {:#x}", image.as_raw()));
        }
    }

    fn compatible(&self, a: vk::RenderPass, b: vk::RenderPass) -> bool {
        if a == b {
            return true;
        }
        match (self.render_passes.get(&a.as_raw()), self.render_passes.get(&b.as_raw())) {
            (Some(x), Some(y)) => {
                x.attachments.len() == y.attachments.len()
                    && x.attachments
                        .iter()
                        .zip(&y.attachments)
                        .all(|(p, q)| p.format == q.format && p.samples == q.samples)
                    && x.subpasses.len() == y.subpasses.len()
            }
            _ => false,
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: &Command) {
        let raw = command_buffer.as_raw();
        let Some(cb) = self.command_buffers.get(&raw) else {
            self.error(format!("{} on unknown command buffer {:#x}", command.name(), raw));
            return;
        };
        if cb.state != CommandBufferState::Recording {
            let state = cb.state;
            self.error(format!("{} on command buffer {:#x} in state {:?}", command.name(), raw, state));
            return;
        }
        let level = cb.level;
        let scope = cb.active.or(cb.continues);

        let inside = scope.is_some();
        if !command.legality().allows(inside) {
            self.error(format!(
                "{} recorded {} a render pass",
                command.name(),
                if inside { "inside" } else { "outside" }
            ));
        }

        let op = match command {
            Command::ClearColorImage { image, color, .. } => Some(Op::ClearImage {
                image: image.handle(),
                rgba: color.to_rgba8(),
            }),
            Command::CopyImage { src, dst, .. } => Some(Op::CopyImage {
                src: src.handle(),
                dst: dst.handle(),
            }),
            Command::BeginRenderPass {
                render_pass,
                framebuffer_handle,
                clear_values,
                ..
            } => {
                if level != vk::CommandBufferLevel::PRIMARY {
                    self.error("vkCmdBeginRenderPass on a secondary command buffer".to_string());
                }
                let handle = render_pass.handle();
                let clears = match self.render_passes.get(&handle.as_raw()) {
                    Some(desc) => desc
                        .attachments
                        .iter()
                        .enumerate()
                        .map(|(i, attachment)| match clear_values.get(i) {
                            Some(ClearValue::Color(color)) if attachment.load_op == vk::AttachmentLoadOp::CLEAR => {
                                Some(color.to_rgba8())
                            }
                            _ => None,
                        })
                        .collect(),
                    None => {
                        self.error(format!("vkCmdBeginRenderPass with unknown render pass {:#x}", handle.as_raw()));
                        Vec::new()
                    }
                };
                if !self.framebuffers.contains_key(&framebuffer_handle.as_raw()) {
                    self.error(format!("vkCmdBeginRenderPass with unknown framebuffer {:#x}", framebuffer_handle.as_raw()));
                }
                if let Some(cb) = self.command_buffers.get_mut(&raw) {
                    cb.active = Some((handle, 0));
                }
                Some(Op::BeginRenderPass {
                    render_pass: handle,
                    framebuffer: *framebuffer_handle,
                    clears,
                })
            }
            Command::NextSubpass { .. } => {
                if let Some(cb) = self.command_buffers.get_mut(&raw) {
                    if let Some((_, subpass)) = cb.active.as_mut() {
                        *subpass += 1;
                    }
                }
                Some(Op::NextSubpass)
            }
            Command::EndRenderPass => {
                if let Some(cb) = self.command_buffers.get_mut(&raw) {
                    cb.active = None;
                }
                Some(Op::EndRenderPass)
            }
            Command::ClearAttachments { attachments, .. } => attachments
                .iter()
                .find_map(|a| match a.value {
                    ClearValue::Color(color) if a.aspect_mask.contains(vk::ImageAspectFlags::COLOR) => {
                        Some(Op::ClearColorAttachment {
                            color_attachment: a.color_attachment,
                            rgba: color.to_rgba8(),
                        })
                    }
                    _ => None,
                }),
            Command::ExecuteCommands(secondaries) => {
                if level != vk::CommandBufferLevel::PRIMARY {
                    self.error("vkCmdExecuteCommands on a secondary command buffer".to_string());
                }
                let handles: Vec<vk::CommandBuffer> = secondaries.iter().map(|s| s.handle()).collect();
                for handle in &handles {
                    self.check_executable_secondary(*handle, scope);
                }
                Some(Op::Execute(handles))
            }
            _ => None,
        };

        self.calls.push(NativeCall::RecordCommand {
            command_buffer,
            name: command.name(),
        });
        if let (Some(op), Some(cb)) = (op, self.command_buffers.get_mut(&raw)) {
            cb.ops.push(op);
        }
    }

    fn check_executable_secondary(&mut self, handle: vk::CommandBuffer, scope: Option<(vk::RenderPass, u32)>) {
        let Some(secondary) = self.command_buffers.get(&handle.as_raw()) else {
            self.error(format!("vkCmdExecuteCommands with unknown command buffer {:#x}", handle.as_raw()));
            return;
        };
        let (level, state, continues) = (secondary.level, secondary.state, secondary.continues);

        if level != vk::CommandBufferLevel::SECONDARY {
            self.error(format!("vkCmdExecuteCommands with primary {:#x}", handle.as_raw()));
        }
        if state != CommandBufferState::Executable {
            self.error(format!("secondary {:#x} executed in state {:?}", handle.as_raw(), state));
        }
        match (scope, continues) {
            (Some((active, subpass)), Some((inherited, inherited_subpass))) => {
                if !self.compatible(active, inherited) || subpass != inherited_subpass {
                    self.error(format!(
                        "secondary {:#x} inherits subpass {} of an incompatible render pass",
                        handle.as_raw(),
                        inherited_subpass
                    ));
                }
            }
            (Some(_), None) => self.error(format!(
                "secondary {:#x} executed inside a render pass without RENDER_PASS_CONTINUE",
                handle.as_raw()
            )),
            (None, Some(_)) => self.error(format!(
                "render pass secondary {:#x} executed outside a render pass",
                handle.as_raw()
            )),
            (None, None) => {}
        }
    }

    fn execute(&mut self, command_buffer: vk::CommandBuffer, scope: &mut Option<ExecutionScope>, depth: u32) {
        if depth > 1 {
            self.error("secondary command buffers cannot execute other command buffers".to_string());
            return;
        }
        let ops = match self.command_buffers.get(&command_buffer.as_raw()) {
            Some(cb) => cb.ops.clone(),
            None => return,
        };

        for op in ops {
            match op {
                Op::ClearImage { image, rgba } => self.fill(image, rgba),
                Op::CopyImage { src, dst } => {
                    let pixels = self.images.get(&src.as_raw()).map(|i| i.pixels.clone());
                    match (pixels, self.images.get_mut(&dst.as_raw())) {
                        (Some(pixels), Some(target)) if target.pixels.len() == pixels.len() => {
                            target.pixels = pixels;
                        }
                        _ => log::debug!("[headless] image copy between differently sized images skipped"),
                    }
                }
                Op::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    clears,
                } => {
                    if !self.framebuffers.contains_key(&framebuffer.as_raw()) {
                        self.error(format!("render pass replayed on destroyed framebuffer {:#x}", framebuffer.as_raw()));
                    }
                    for (attachment, rgba) in clears.iter().enumerate() {
                        let Some(rgba) = rgba else { continue };
                        if let Some(image) = self.framebuffer_image(framebuffer, attachment as u32) {
                            self.fill(image, *rgba);
                        }
                    }
                    *scope = Some(ExecutionScope {
                        render_pass,
                        framebuffer,
                        subpass: 0,
                    });
                }
                Op::NextSubpass => {
                    if let Some(scope) = scope.as_mut() {
                        scope.subpass += 1;
                    }
                }
                Op::EndRenderPass => *scope = None,
                Op::ClearColorAttachment { color_attachment, rgba } => {
                    let Some(current) = *scope else { continue };
                    let attachment = self
                        .render_passes
                        .get(&current.render_pass.as_raw())
                        .and_then(|desc| desc.subpasses.get(current.subpass as usize))
                        .and_then(|subpass| subpass.color_attachments.get(color_attachment as usize))
                        .filter(|r| !r.is_unused())
                        .map(|r| r.attachment);
                    if let Some(image) = attachment.and_then(|a| self.framebuffer_image(current.framebuffer, a)) {
                        self.fill(image, rgba);
                    }
                }
                Op::Execute(secondaries) => {
                    for secondary in secondaries {
                        self.execute(secondary, scope, depth + 1);
                    }
                }
            }
        }
    }

    fn wait_semaphore(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.error(format!("wait on semaphore {:#x} with no pending signal", semaphore.as_raw())),
            None => self.error(format!("wait on unknown semaphore {:#x}", semaphore.as_raw())),
        }
    }

    fn signal_semaphore(&mut self, semaphore: vk::Semaphore) {
        match self.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.error(format!("signal of already signaled semaphore {:#x}", semaphore.as_raw())),
            None => self.error(format!("signal of unknown semaphore {:#x}", semaphore.as_raw())),
        }
    }

    fn signal_fence(&mut self, fence: vk::Fence) {
        match self.fences.get_mut(&fence.as_raw()) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.error(format!("fence {:#x} submitted while signaled", fence.as_raw())),
            None => self.error(format!("unknown fence {:#x}", fence.as_raw())),
        }
    }
}

/// Host-side implementation of [`NativeDevice`]
#[derive(Debug)]
pub struct HeadlessDevice {
    capabilities: DeviceCapabilities,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// Software device with [`HeadlessDevice::default_capabilities`]
    pub fn new() -> Self {
        Self::with_capabilities(Self::default_capabilities())
    }

    /// Software device reporting `capabilities`
    pub fn with_capabilities(capabilities: DeviceCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(HeadlessState::default()),
        }
    }

    /// What the software device supports out of the box
    ///
    /// Everything except depth/stencil resolve, conservative rasterization
    /// and rasterization order.
    pub fn default_capabilities() -> DeviceCapabilities {
        DeviceCapabilities {
            device_name: "Crucible headless device".to_string(),
            physical_device_count: 1,
            universal_queue_family: 0,
            n_universal_queues: 2,
            max_color_attachments: 8,
            max_input_attachments: 8,
            max_viewports: 16,
            max_vertex_input_bindings: 32,
            supports_depth_stencil_resolve: false,
            supports_multiview: true,
            supports_rasterization_order: false,
            supports_conservative_rasterization: false,
            supports_transform_feedback: true,
            supports_depth_clip_enable: true,
            supports_sample_locations: true,
            supports_vertex_attribute_divisor: true,
            supports_debug_utils: true,
            supports_geometry_shader: true,
            supports_tessellation_shader: true,
        }
    }

    /// Copy of the call journal
    pub fn calls(&self) -> Vec<NativeCall> {
        lock_state(&self.state).calls.clone()
    }

    /// Usage errors detected so far
    pub fn validation_errors(&self) -> Vec<String> {
        lock_state(&self.state).validation_errors.clone()
    }

    /// Number of created objects not destroyed yet
    pub fn n_live_objects(&self) -> usize {
        lock_state(&self.state).live.len()
    }

    /// Debug name attached to a handle
    pub fn object_name(&self, raw_handle: u64) -> Option<String> {
        lock_state(&self.state).object_names.get(&raw_handle).cloned()
    }

    /// Make item `index` of the next pipeline batch fail
    pub fn fail_pipeline_in_next_batch(&self, index: usize) {
        lock_state(&self.state).fail_next_batch_at = Some(index);
    }

    /// Make the next pipeline batch return one pipeline fewer than requested
    pub fn short_next_pipeline_batch(&self) {
        lock_state(&self.state).short_next_batch = true;
    }

    /// Current RGBA8 contents of an image
    pub fn image_pixels(&self, image: vk::Image) -> Option<Vec<u8>> {
        lock_state(&self.state)
            .images
            .get(&image.as_raw())
            .map(|i| i.pixels.clone())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        lock_state(&self.state)
    }
}

impl NativeDevice for HeadlessDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> NativeResult<vk::RenderPass> {
        let mut state = self.state();
        if desc.subpasses.is_empty() {
            state.error("render pass with no subpasses".to_string());
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        for (index, subpass) in desc.subpasses.iter().enumerate() {
            for preserved in &subpass.preserve_attachments {
                let used = subpass
                    .color_attachments
                    .iter()
                    .chain(&subpass.input_attachments)
                    .chain(&subpass.resolve_attachments)
                    .chain(subpass.depth_stencil_attachment.iter())
                    .any(|r| r.attachment == *preserved);
                if used {
                    state.error(format!("subpass {index} preserves attachment {preserved} it also uses"));
                }
            }
        }
        let handle: vk::RenderPass = state.alloc(vk::ObjectType::RENDER_PASS);
        state.render_passes.insert(handle.as_raw(), desc.clone());
        state.calls.push(NativeCall::CreateRenderPass(desc.clone()));
        Ok(handle)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = self.state();
        if state.release(render_pass, vk::ObjectType::RENDER_PASS) {
            state.render_passes.remove(&render_pass.as_raw());
        }
    }

    fn create_shader_module(&self, spirv: &[u32]) -> NativeResult<vk::ShaderModule> {
        let mut state = self.state();
        if spirv.first() != Some(&0x0723_0203) {
            state.error("shader module without the SPIR-V magic number".to_string());
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        Ok(state.alloc(vk::ObjectType::SHADER_MODULE))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().release(module, vk::ObjectType::SHADER_MODULE);
    }

    fn create_pipeline_layout(&self, _desc: &PipelineLayoutDesc) -> NativeResult<vk::PipelineLayout> {
        Ok(self.state().alloc(vk::ObjectType::PIPELINE_LAYOUT))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state().release(layout, vk::ObjectType::PIPELINE_LAYOUT);
    }

    fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        descs: &[GraphicsPipelineDesc],
    ) -> Result<Vec<vk::Pipeline>, BatchFailure> {
        let mut state = self.state();
        state.calls.push(NativeCall::CreateGraphicsPipelines {
            cache,
            descs: descs.to_vec(),
        });

        for (index, desc) in descs.iter().enumerate() {
            if !desc.stages.iter().any(|s| s.stage == vk::ShaderStageFlags::VERTEX) {
                state.error(format!("pipeline {index} has no vertex stage"));
            }
            for stage in &desc.stages {
                if !state.live.contains_key(&stage.module.as_raw()) {
                    state.error(format!("pipeline {index} uses unknown shader module"));
                }
            }
            if !state.live.contains_key(&desc.layout.as_raw()) {
                state.error(format!("pipeline {index} uses unknown layout"));
            }
            let n_colors = state
                .render_passes
                .get(&desc.render_pass.as_raw())
                .and_then(|rp| rp.subpasses.get(desc.subpass as usize))
                .map(|subpass| subpass.color_attachments.len());
            match n_colors {
                None => state.error(format!("pipeline {index} targets an unknown render pass or subpass")),
                Some(n) if !desc.rasterizer_discard && n != desc.color_blend_attachments.len() => state.error(
                    format!(
                        "pipeline {index} has {} blend attachment(s) for {} color attachment(s)",
                        desc.color_blend_attachments.len(),
                        n
                    ),
                ),
                Some(_) => {}
            }
            let derivative = desc.flags.contains(vk::PipelineCreateFlags::DERIVATIVE);
            match desc.base {
                PipelineBase::None if derivative => state.error(format!("derivative pipeline {index} without a base")),
                PipelineBase::Index(base) if base < 0 || base as usize >= index => {
                    state.error(format!("pipeline {index} derives from later batch item {base}"))
                }
                PipelineBase::Handle(base) if !state.pipelines.contains(&base.as_raw()) => {
                    state.error(format!("pipeline {index} derives from unknown pipeline"))
                }
                PipelineBase::Index(_) | PipelineBase::Handle(_) if !derivative => {
                    state.error(format!("pipeline {index} has a base but no DERIVATIVE flag"))
                }
                _ => {}
            }
        }

        let failing = state.fail_next_batch_at.take().filter(|i| *i < descs.len());
        let n_returned = if std::mem::take(&mut state.short_next_batch) {
            descs.len().saturating_sub(1)
        } else {
            descs.len()
        };
        let pipelines: Vec<vk::Pipeline> = (0..n_returned)
            .map(|index| {
                if Some(index) == failing {
                    vk::Pipeline::null()
                } else {
                    let pipeline: vk::Pipeline = state.alloc(vk::ObjectType::PIPELINE);
                    state.pipelines.insert(pipeline.as_raw());
                    pipeline
                }
            })
            .collect();

        if failing.is_some() {
            return Err(BatchFailure {
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                pipelines,
            });
        }
        Ok(pipelines)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = self.state();
        if state.release(pipeline, vk::ObjectType::PIPELINE) {
            state.pipelines.remove(&pipeline.as_raw());
            state.calls.push(NativeCall::DestroyPipeline(pipeline));
        }
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> NativeResult<vk::PipelineCache> {
        let mut state = self.state();
        let cache: vk::PipelineCache = state.alloc(vk::ObjectType::PIPELINE_CACHE);
        state.pipeline_caches.insert(cache.as_raw(), initial_data.to_vec());
        Ok(cache)
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> NativeResult<Vec<u8>> {
        self.state()
            .pipeline_caches
            .get(&cache.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn merge_pipeline_caches(&self, destination: vk::PipelineCache, sources: &[vk::PipelineCache]) -> NativeResult<()> {
        let mut state = self.state();
        if sources.contains(&destination) {
            state.error("pipeline cache merged into itself".to_string());
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut merged = state
            .pipeline_caches
            .get(&destination.as_raw())
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for source in sources {
            let data = state
                .pipeline_caches
                .get(&source.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            merged.extend_from_slice(data);
        }
        state.pipeline_caches.insert(destination.as_raw(), merged);
        Ok(())
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        let mut state = self.state();
        if state.release(cache, vk::ObjectType::PIPELINE_CACHE) {
            state.pipeline_caches.remove(&cache.as_raw());
        }
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> NativeResult<vk::Framebuffer> {
        let mut state = self.state();
        let expected = state
            .render_passes
            .get(&desc.render_pass.as_raw())
            .map(|rp| rp.attachments.len());
        if expected != Some(desc.attachments.len()) {
            state.error(format!(
                "framebuffer with {} attachment(s) for render pass expecting {:?}",
                desc.attachments.len(),
                expected
            ));
        }
        let framebuffer: vk::Framebuffer = state.alloc(vk::ObjectType::FRAMEBUFFER);
        state.framebuffers.insert(framebuffer.as_raw(), desc.clone());
        state.calls.push(NativeCall::CreateFramebuffer(desc.clone()));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state();
        if state.release(framebuffer, vk::ObjectType::FRAMEBUFFER) {
            state.framebuffers.remove(&framebuffer.as_raw());
            state.calls.push(NativeCall::DestroyFramebuffer(framebuffer));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> NativeResult<vk::Image> {
        if desc.width == 0 || desc.height == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.state().new_image(*desc))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state();
        if state.release(image, vk::ObjectType::IMAGE) {
            state.images.remove(&image.as_raw());
        }
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> NativeResult<vk::ImageView> {
        let mut state = self.state();
        if !state.images.contains_key(&desc.image.as_raw()) {
            state.error(format!("image view of unknown image {:#x}", desc.image.as_raw()));
        }
        let view: vk::ImageView = state.alloc(vk::ObjectType::IMAGE_VIEW);
        state.views.insert(view.as_raw(), desc.image);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state();
        if state.release(view, vk::ObjectType::IMAGE_VIEW) {
            state.views.remove(&view.as_raw());
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> NativeResult<vk::Buffer> {
        if desc.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.state().alloc(vk::ObjectType::BUFFER))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().release(buffer, vk::ObjectType::BUFFER);
    }

    fn create_semaphore(&self) -> NativeResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore: vk::Semaphore = state.alloc(vk::ObjectType::SEMAPHORE);
        state.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state();
        if state.release(semaphore, vk::ObjectType::SEMAPHORE) {
            state.semaphores.remove(&semaphore.as_raw());
        }
    }

    fn create_fence(&self, signaled: bool) -> NativeResult<vk::Fence> {
        let mut state = self.state();
        let fence: vk::Fence = state.alloc(vk::ObjectType::FENCE);
        state.fences.insert(fence.as_raw(), signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state();
        if state.release(fence, vk::ObjectType::FENCE) {
            state.fences.remove(&fence.as_raw());
        }
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, _timeout: u64) -> NativeResult<()> {
        let state = self.state();
        let mut signaled = fences
            .iter()
            .map(|f| state.fences.get(&f.as_raw()).copied().unwrap_or(false));
        let done = if wait_all {
            signaled.all(|s| s)
        } else {
            signaled.any(|s| s)
        };
        // Work completes at submit time, so an unsignaled fence never signals.
        if done {
            Ok(())
        } else {
            Err(vk::Result::TIMEOUT)
        }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> NativeResult<()> {
        let mut state = self.state();
        for fence in fences {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(signaled) => *signaled = false,
                None => state.error(format!("reset of unknown fence {:#x}", fence.as_raw())),
            }
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> NativeResult<bool> {
        self.state()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn create_event(&self) -> NativeResult<vk::Event> {
        Ok(self.state().alloc(vk::ObjectType::EVENT))
    }

    fn destroy_event(&self, event: vk::Event) {
        self.state().release(event, vk::ObjectType::EVENT);
    }

    fn create_query_pool(&self, desc: &QueryPoolDesc) -> NativeResult<vk::QueryPool> {
        if desc.query_count == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.state().alloc(vk::ObjectType::QUERY_POOL))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state().release(pool, vk::ObjectType::QUERY_POOL);
    }

    fn create_command_pool(&self, queue_family: u32, _flags: vk::CommandPoolCreateFlags) -> NativeResult<vk::CommandPool> {
        if queue_family != self.capabilities.universal_queue_family {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.state().alloc(vk::ObjectType::COMMAND_POOL))
    }

    fn reset_command_pool(&self, pool: vk::CommandPool, _release_resources: bool) -> NativeResult<()> {
        let mut state = self.state();
        let mut recording = false;
        for cb in state.command_buffers.values_mut().filter(|cb| cb.pool == pool) {
            recording |= cb.state == CommandBufferState::Recording;
            cb.state = CommandBufferState::Initial;
            cb.active = None;
            cb.continues = None;
            cb.ops.clear();
        }
        if recording {
            state.error(format!("command pool {:#x} reset while a buffer was recording", pool.as_raw()));
        }
        state.calls.push(NativeCall::ResetCommandPool(pool));
        Ok(())
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        if state.release(pool, vk::ObjectType::COMMAND_POOL) {
            let orphans: Vec<u64> = state
                .command_buffers
                .iter()
                .filter(|(_, cb)| cb.pool == pool)
                .map(|(raw, _)| *raw)
                .collect();
            for raw in orphans {
                state.command_buffers.remove(&raw);
                state.live.remove(&raw);
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> NativeResult<vk::CommandBuffer> {
        let mut state = self.state();
        if state.live.get(&pool.as_raw()) != Some(&vk::ObjectType::COMMAND_POOL) {
            state.error(format!("allocation from unknown command pool {:#x}", pool.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let command_buffer: vk::CommandBuffer = state.alloc(vk::ObjectType::COMMAND_BUFFER);
        state.command_buffers.insert(
            command_buffer.as_raw(),
            HeadlessCommandBuffer {
                pool,
                level,
                state: CommandBufferState::Initial,
                continues: None,
                active: None,
                ops: Vec::new(),
            },
        );
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut state = self.state();
        if state.release(command_buffer, vk::ObjectType::COMMAND_BUFFER) {
            state.command_buffers.remove(&command_buffer.as_raw());
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, desc: &CommandBufferBeginDesc) -> NativeResult<()> {
        let mut state = self.state();
        state.calls.push(NativeCall::BeginCommandBuffer {
            command_buffer,
            desc: *desc,
        });

        let continues = desc.flags.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);
        let inherited = desc.inheritance.map(|i| (i.render_pass, i.subpass));
        let inherited_known = inherited.is_some_and(|(rp, _)| state.render_passes.contains_key(&rp.as_raw()));

        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            state.error(format!("begin of unknown command buffer {:#x}", command_buffer.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let was = cb.state;
        let level = cb.level;
        cb.state = CommandBufferState::Recording;
        cb.active = None;
        cb.continues = if continues { inherited } else { None };
        cb.ops.clear();

        if was == CommandBufferState::Recording {
            state.error(format!("command buffer {:#x} begun while recording", command_buffer.as_raw()));
        }
        if level == vk::CommandBufferLevel::SECONDARY && desc.inheritance.is_none() {
            state.error("secondary command buffer begun without inheritance info".to_string());
        }
        if continues && !inherited_known {
            state.error("RENDER_PASS_CONTINUE without a valid inherited render pass".to_string());
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> NativeResult<()> {
        let mut state = self.state();
        state.calls.push(NativeCall::EndCommandBuffer(command_buffer));
        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let problem = match (cb.state, cb.active) {
            (CommandBufferState::Recording, None) => None,
            (CommandBufferState::Recording, Some(_)) => Some("ended inside a render pass"),
            _ => Some("ended while not recording"),
        };
        cb.state = CommandBufferState::Executable;
        if let Some(problem) = problem {
            state.error(format!("command buffer {:#x} {}", command_buffer.as_raw(), problem));
        }
        Ok(())
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer, _release_resources: bool) -> NativeResult<()> {
        let mut state = self.state();
        state.calls.push(NativeCall::ResetCommandBuffer(command_buffer));
        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        cb.state = CommandBufferState::Initial;
        cb.active = None;
        cb.continues = None;
        cb.ops.clear();
        Ok(())
    }

    fn record_command(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        self.state().record(command_buffer, command);
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x10_0000 + (u64::from(family) << 8) + u64::from(index))
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitDesc], fence: vk::Fence) -> NativeResult<()> {
        let mut state = self.state();
        state.calls.push(NativeCall::QueueSubmit {
            queue,
            submits: submits.to_vec(),
            fence,
        });

        for submit in submits {
            if submit.wait_semaphores.len() != submit.wait_stages.len() {
                state.error("submission with mismatched wait semaphore and stage counts".to_string());
            }
            if !submit.command_buffer_device_masks.is_empty()
                && submit.command_buffer_device_masks.len() != submit.command_buffers.len()
            {
                state.error("submission with mismatched device mask count".to_string());
            }
            for semaphore in &submit.wait_semaphores {
                state.wait_semaphore(*semaphore);
            }
            for command_buffer in &submit.command_buffers {
                let status = state
                    .command_buffers
                    .get(&command_buffer.as_raw())
                    .map(|cb| (cb.level, cb.state));
                match status {
                    Some((vk::CommandBufferLevel::PRIMARY, CommandBufferState::Executable)) => {
                        let mut scope = None;
                        state.execute(*command_buffer, &mut scope, 0);
                    }
                    Some((level, cb_state)) => state.error(format!(
                        "submitted command buffer {:#x} is {:?} in state {:?}",
                        command_buffer.as_raw(),
                        level,
                        cb_state
                    )),
                    None => state.error(format!("submitted unknown command buffer {:#x}", command_buffer.as_raw())),
                }
            }
            for semaphore in &submit.signal_semaphores {
                state.signal_semaphore(*semaphore);
            }
        }

        if fence != vk::Fence::null() {
            state.signal_fence(fence);
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> NativeResult<()> {
        Ok(())
    }

    fn queue_present(&self, _queue: vk::Queue, desc: &PresentDesc) -> NativeResult<bool> {
        let mut state = self.state();
        state.calls.push(NativeCall::QueuePresent(desc.clone()));
        for semaphore in &desc.wait_semaphores {
            state.wait_semaphore(*semaphore);
        }
        for (swapchain, index) in desc.swapchains.iter().zip(&desc.image_indices) {
            let acquired = state
                .swapchains
                .get_mut(&swapchain.as_raw())
                .map(|sc| sc.acquired.remove(index));
            match acquired {
                Some(true) => {}
                Some(false) => state.error(format!("present of image {index} that was not acquired")),
                None => return Err(vk::Result::ERROR_SURFACE_LOST_KHR),
            }
        }
        Ok(false)
    }

    fn device_wait_idle(&self) -> NativeResult<()> {
        self.state().calls.push(NativeCall::DeviceWaitIdle);
        Ok(())
    }

    fn create_surface(&self, _target: &SurfaceTarget) -> NativeResult<vk::SurfaceKHR> {
        Ok(self.state().alloc(vk::ObjectType::SURFACE_KHR))
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.state().release(surface, vk::ObjectType::SURFACE_KHR);
    }

    fn surface_properties(&self, surface: vk::SurfaceKHR) -> NativeResult<SurfaceProperties> {
        if !self.state().live.contains_key(&surface.as_raw()) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }
        Ok(SurfaceProperties {
            formats: vec![
                (vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
                (vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            min_image_count: 2,
            max_image_count: 8,
            current_extent: None,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> NativeResult<vk::SwapchainKHR> {
        let mut state = self.state();
        state.calls.push(NativeCall::CreateSwapchain(*desc));
        if !state.live.contains_key(&desc.surface.as_raw()) {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        }

        let image_desc = ImageDesc::new_2d(desc.format, desc.width, desc.height, desc.usage);
        let images = (0..desc.min_image_count).map(|_| state.new_image(image_desc)).collect();
        let swapchain: vk::SwapchainKHR = state.alloc(vk::ObjectType::SWAPCHAIN_KHR);
        state.swapchains.insert(
            swapchain.as_raw(),
            HeadlessSwapchain {
                images,
                next: 0,
                acquired: HashSet::new(),
            },
        );
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.calls.push(NativeCall::DestroySwapchain(swapchain));
        if state.release(swapchain, vk::ObjectType::SWAPCHAIN_KHR) {
            if let Some(sc) = state.swapchains.remove(&swapchain.as_raw()) {
                for image in sc.images {
                    state.live.remove(&image.as_raw());
                    state.images.remove(&image.as_raw());
                }
            }
        }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> NativeResult<Vec<vk::Image>> {
        self.state()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|sc| sc.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> NativeResult<(u32, bool)> {
        let mut state = self.state();
        let index = {
            let Some(sc) = state.swapchains.get_mut(&swapchain.as_raw()) else {
                return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
            };
            if sc.acquired.len() == sc.images.len() {
                return Err(vk::Result::NOT_READY);
            }
            let n_images = sc.images.len() as u32;
            while sc.acquired.contains(&sc.next) {
                sc.next = (sc.next + 1) % n_images;
            }
            let index = sc.next;
            sc.next = (index + 1) % n_images;
            sc.acquired.insert(index);
            index
        };

        if semaphore != vk::Semaphore::null() {
            state.signal_semaphore(semaphore);
        }
        if fence != vk::Fence::null() {
            state.signal_fence(fence);
        }
        state.calls.push(NativeCall::AcquireNextImage { swapchain, index });
        Ok((index, false))
    }

    fn set_object_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) -> NativeResult<()> {
        let mut state = self.state();
        state.object_names.insert(raw_handle, name.to_string());
        state.calls.push(NativeCall::SetObjectName {
            object_type,
            raw_handle,
            name: name.to_string(),
        });
        Ok(())
    }

    fn set_object_tag(&self, _object_type: vk::ObjectType, raw_handle: u64, _tag_name: u64, _data: &[u8]) -> NativeResult<()> {
        if self.state().live.contains_key(&raw_handle) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn read_back_image(&self, desc: &ReadbackDesc) -> NativeResult<Vec<u8>> {
        let state = self.state();
        let image = state.images.get(&desc.image.as_raw()).ok_or(vk::Result::ERROR_UNKNOWN)?;
        if image.desc.width != desc.width || image.desc.height != desc.height {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(image.pixels.clone())
    }
}
