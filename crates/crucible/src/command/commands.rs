//! Recorded command records
//!
//! One variant per `vkCmd*` entry point the recorder exposes. Wrapper
//! arguments are held by `Arc`, POD arguments and pointed-to arrays are
//! copied, so a record stays valid for as long as it is kept around.

use ash::vk;
use std::sync::Arc;

use crate::framebuffer::Framebuffer;
use crate::native::{SampleLocationsDesc, ScissorDesc, ViewportDesc};
use crate::render_pass::RenderPass;
use crate::resources::{Buffer, DescriptorSet, Event, Image, PipelineLayout, QueryPool};

use super::barrier::PipelineBarrier;
use super::buffer::CommandBuffer;

/// Where a command may be recorded relative to a render pass instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Legality {
    /// Only while no render pass is active
    OutsideRenderPass,
    /// Only inside an active render pass
    InsideRenderPass,
    /// Anywhere
    Both,
}

impl Legality {
    /// Whether the command may be recorded with the given render pass state
    pub fn allows(self, inside_render_pass: bool) -> bool {
        match self {
            Self::OutsideRenderPass => !inside_render_pass,
            Self::InsideRenderPass => inside_render_pass,
            Self::Both => true,
        }
    }
}

/// Clear color, typed by the attachment's numeric format
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearColor {
    /// Float and normalized formats
    Float32([f32; 4]),
    /// Signed integer formats
    Int32([i32; 4]),
    /// Unsigned integer formats
    Uint32([u32; 4]),
}

impl ClearColor {
    /// Opaque black
    pub const BLACK: Self = Self::Float32([0.0, 0.0, 0.0, 1.0]);

    /// Native form
    pub fn to_vk(self) -> vk::ClearColorValue {
        match self {
            Self::Float32(float32) => vk::ClearColorValue { float32 },
            Self::Int32(int32) => vk::ClearColorValue { int32 },
            Self::Uint32(uint32) => vk::ClearColorValue { uint32 },
        }
    }

    /// Value encoded as RGBA8, used by software readback
    pub fn to_rgba8(self) -> [u8; 4] {
        match self {
            Self::Float32(c) => c.map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8),
            Self::Int32(c) => c.map(|v| v.clamp(0, 255) as u8),
            Self::Uint32(c) => c.map(|v| v.min(255) as u8),
        }
    }
}

/// Clear value for one render pass attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Color attachment
    Color(ClearColor),
    /// Depth/stencil attachment
    DepthStencil {
        /// Depth
        depth: f32,
        /// Stencil
        stencil: u32,
    },
}

impl ClearValue {
    /// Native form
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(color) => vk::ClearValue { color: color.to_vk() },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One `vkCmdClearAttachments` target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearAttachment {
    /// Aspects to clear
    pub aspect_mask: vk::ImageAspectFlags,
    /// Color attachment index inside the subpass, ignored for depth/stencil
    pub color_attachment: u32,
    /// Value
    pub value: ClearValue,
}

impl ClearAttachment {
    /// Native form
    pub fn to_vk(self) -> vk::ClearAttachment {
        vk::ClearAttachment {
            aspect_mask: self.aspect_mask,
            color_attachment: self.color_attachment,
            clear_value: self.value.to_vk(),
        }
    }
}

/// A recorded command with its captured arguments
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub enum Command {
    // Outside a render pass only
    CopyBuffer {
        src: Arc<Buffer>,
        dst: Arc<Buffer>,
        regions: Vec<vk::BufferCopy>,
    },
    CopyImage {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    CopyBufferToImage {
        src: Arc<Buffer>,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Buffer>,
        regions: Vec<vk::BufferImageCopy>,
    },
    BlitImage {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ResolveImage {
        src: Arc<Image>,
        src_layout: vk::ImageLayout,
        dst: Arc<Image>,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageResolve>,
    },
    ClearColorImage {
        image: Arc<Image>,
        layout: vk::ImageLayout,
        color: ClearColor,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: Arc<Image>,
        layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    FillBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        size: u64,
        data: u32,
    },
    UpdateBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        data: Vec<u8>,
    },
    Dispatch {
        group_count: [u32; 3],
    },
    DispatchIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
    },
    DispatchBase {
        base_group: [u32; 3],
        group_count: [u32; 3],
    },
    SetEvent {
        event: Arc<Event>,
        stages: vk::PipelineStageFlags,
    },
    ResetEvent {
        event: Arc<Event>,
        stages: vk::PipelineStageFlags,
    },
    ResetQueryPool {
        pool: Arc<QueryPool>,
        first_query: u32,
        query_count: u32,
    },
    BeginRenderPass {
        render_pass: Arc<RenderPass>,
        framebuffer: Arc<Framebuffer>,
        framebuffer_handle: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_values: Vec<ClearValue>,
        contents: vk::SubpassContents,
        device_mask: Option<u32>,
    },

    // Inside a render pass only
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    DrawIndirectCount {
        indexed: bool,
        buffer: Arc<Buffer>,
        offset: u64,
        count_buffer: Arc<Buffer>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    },
    ClearAttachments {
        attachments: Vec<ClearAttachment>,
        rects: Vec<vk::ClearRect>,
    },
    BeginTransformFeedback {
        first_counter_buffer: u32,
        counter_buffers: Vec<Arc<Buffer>>,
        counter_offsets: Vec<u64>,
    },
    EndTransformFeedback {
        first_counter_buffer: u32,
        counter_buffers: Vec<Arc<Buffer>>,
        counter_offsets: Vec<u64>,
    },
    NextSubpass {
        contents: vk::SubpassContents,
    },
    EndRenderPass,

    // Anywhere
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: Arc<PipelineLayout>,
        first_set: u32,
        sets: Vec<Arc<DescriptorSet>>,
        dynamic_offsets: Vec<u32>,
    },
    BindIndexBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        index_type: vk::IndexType,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<Arc<Buffer>>,
        offsets: Vec<u64>,
    },
    PushConstants {
        layout: Arc<PipelineLayout>,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    PipelineBarrier(Arc<PipelineBarrier>),
    WaitEvents {
        events: Vec<Arc<Event>>,
        barrier: Arc<PipelineBarrier>,
    },
    SetViewport {
        first_viewport: u32,
        viewports: Vec<ViewportDesc>,
    },
    SetScissor {
        first_scissor: u32,
        scissors: Vec<ScissorDesc>,
    },
    SetLineWidth(f32),
    SetBlendConstants([f32; 4]),
    SetDepthBias {
        constant_factor: f32,
        clamp: f32,
        slope_factor: f32,
    },
    SetDepthBounds {
        min: f32,
        max: f32,
    },
    SetStencilCompareMask {
        faces: vk::StencilFaceFlags,
        mask: u32,
    },
    SetStencilWriteMask {
        faces: vk::StencilFaceFlags,
        mask: u32,
    },
    SetStencilReference {
        faces: vk::StencilFaceFlags,
        reference: u32,
    },
    SetDeviceMask(u32),
    SetSampleLocations(SampleLocationsDesc),
    BeginQuery {
        pool: Arc<QueryPool>,
        query: u32,
        flags: vk::QueryControlFlags,
    },
    EndQuery {
        pool: Arc<QueryPool>,
        query: u32,
    },
    WriteTimestamp {
        stage: vk::PipelineStageFlags,
        pool: Arc<QueryPool>,
        query: u32,
    },
    BeginDebugLabel {
        name: String,
        color: [f32; 4],
    },
    EndDebugLabel,
    InsertDebugLabel {
        name: String,
        color: [f32; 4],
    },
    ExecuteCommands(Vec<Arc<CommandBuffer>>),
}

impl Command {
    /// Render pass state the command may be recorded in
    pub fn legality(&self) -> Legality {
        match self {
            Self::CopyBuffer { .. }
            | Self::CopyImage { .. }
            | Self::CopyBufferToImage { .. }
            | Self::CopyImageToBuffer { .. }
            | Self::BlitImage { .. }
            | Self::ResolveImage { .. }
            | Self::ClearColorImage { .. }
            | Self::ClearDepthStencilImage { .. }
            | Self::FillBuffer { .. }
            | Self::UpdateBuffer { .. }
            | Self::Dispatch { .. }
            | Self::DispatchIndirect { .. }
            | Self::DispatchBase { .. }
            | Self::SetEvent { .. }
            | Self::ResetEvent { .. }
            | Self::ResetQueryPool { .. }
            | Self::BeginRenderPass { .. } => Legality::OutsideRenderPass,

            Self::Draw { .. }
            | Self::DrawIndexed { .. }
            | Self::DrawIndirect { .. }
            | Self::DrawIndexedIndirect { .. }
            | Self::DrawIndirectCount { .. }
            | Self::ClearAttachments { .. }
            | Self::BeginTransformFeedback { .. }
            | Self::EndTransformFeedback { .. }
            | Self::NextSubpass { .. }
            | Self::EndRenderPass => Legality::InsideRenderPass,

            Self::BindPipeline { .. }
            | Self::BindDescriptorSets { .. }
            | Self::BindIndexBuffer { .. }
            | Self::BindVertexBuffers { .. }
            | Self::PushConstants { .. }
            | Self::PipelineBarrier(_)
            | Self::WaitEvents { .. }
            | Self::SetViewport { .. }
            | Self::SetScissor { .. }
            | Self::SetLineWidth(_)
            | Self::SetBlendConstants(_)
            | Self::SetDepthBias { .. }
            | Self::SetDepthBounds { .. }
            | Self::SetStencilCompareMask { .. }
            | Self::SetStencilWriteMask { .. }
            | Self::SetStencilReference { .. }
            | Self::SetDeviceMask(_)
            | Self::SetSampleLocations(_)
            | Self::BeginQuery { .. }
            | Self::EndQuery { .. }
            | Self::WriteTimestamp { .. }
            | Self::BeginDebugLabel { .. }
            | Self::EndDebugLabel
            | Self::InsertDebugLabel { .. }
            | Self::ExecuteCommands(_) => Legality::Both,
        }
    }

    /// Entry point name, for logs and replay tools
    pub fn name(&self) -> &'static str {
        match self {
            Self::CopyBuffer { .. } => "vkCmdCopyBuffer",
            Self::CopyImage { .. } => "vkCmdCopyImage",
            Self::CopyBufferToImage { .. } => "vkCmdCopyBufferToImage",
            Self::CopyImageToBuffer { .. } => "vkCmdCopyImageToBuffer",
            Self::BlitImage { .. } => "vkCmdBlitImage",
            Self::ResolveImage { .. } => "vkCmdResolveImage",
            Self::ClearColorImage { .. } => "vkCmdClearColorImage",
            Self::ClearDepthStencilImage { .. } => "vkCmdClearDepthStencilImage",
            Self::FillBuffer { .. } => "vkCmdFillBuffer",
            Self::UpdateBuffer { .. } => "vkCmdUpdateBuffer",
            Self::Dispatch { .. } => "vkCmdDispatch",
            Self::DispatchIndirect { .. } => "vkCmdDispatchIndirect",
            Self::DispatchBase { .. } => "vkCmdDispatchBase",
            Self::SetEvent { .. } => "vkCmdSetEvent",
            Self::ResetEvent { .. } => "vkCmdResetEvent",
            Self::ResetQueryPool { .. } => "vkCmdResetQueryPool",
            Self::BeginRenderPass { .. } => "vkCmdBeginRenderPass",
            Self::Draw { .. } => "vkCmdDraw",
            Self::DrawIndexed { .. } => "vkCmdDrawIndexed",
            Self::DrawIndirect { .. } => "vkCmdDrawIndirect",
            Self::DrawIndexedIndirect { .. } => "vkCmdDrawIndexedIndirect",
            Self::DrawIndirectCount { indexed: false, .. } => "vkCmdDrawIndirectCount",
            Self::DrawIndirectCount { indexed: true, .. } => "vkCmdDrawIndexedIndirectCount",
            Self::ClearAttachments { .. } => "vkCmdClearAttachments",
            Self::BeginTransformFeedback { .. } => "vkCmdBeginTransformFeedbackEXT",
            Self::EndTransformFeedback { .. } => "vkCmdEndTransformFeedbackEXT",
            Self::NextSubpass { .. } => "vkCmdNextSubpass",
            Self::EndRenderPass => "vkCmdEndRenderPass",
            Self::BindPipeline { .. } => "vkCmdBindPipeline",
            Self::BindDescriptorSets { .. } => "vkCmdBindDescriptorSets",
            Self::BindIndexBuffer { .. } => "vkCmdBindIndexBuffer",
            Self::BindVertexBuffers { .. } => "vkCmdBindVertexBuffers",
            Self::PushConstants { .. } => "vkCmdPushConstants",
            Self::PipelineBarrier(_) => "vkCmdPipelineBarrier",
            Self::WaitEvents { .. } => "vkCmdWaitEvents",
            Self::SetViewport { .. } => "vkCmdSetViewport",
            Self::SetScissor { .. } => "vkCmdSetScissor",
            Self::SetLineWidth(_) => "vkCmdSetLineWidth",
            Self::SetBlendConstants(_) => "vkCmdSetBlendConstants",
            Self::SetDepthBias { .. } => "vkCmdSetDepthBias",
            Self::SetDepthBounds { .. } => "vkCmdSetDepthBounds",
            Self::SetStencilCompareMask { .. } => "vkCmdSetStencilCompareMask",
            Self::SetStencilWriteMask { .. } => "vkCmdSetStencilWriteMask",
            Self::SetStencilReference { .. } => "vkCmdSetStencilReference",
            Self::SetDeviceMask(_) => "vkCmdSetDeviceMask",
            Self::SetSampleLocations(_) => "vkCmdSetSampleLocationsEXT",
            Self::BeginQuery { .. } => "vkCmdBeginQuery",
            Self::EndQuery { .. } => "vkCmdEndQuery",
            Self::WriteTimestamp { .. } => "vkCmdWriteTimestamp",
            Self::BeginDebugLabel { .. } => "vkCmdBeginDebugUtilsLabelEXT",
            Self::EndDebugLabel => "vkCmdEndDebugUtilsLabelEXT",
            Self::InsertDebugLabel { .. } => "vkCmdInsertDebugUtilsLabelEXT",
            Self::ExecuteCommands(_) => "vkCmdExecuteCommands",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legality_profiles() {
        assert_eq!(Command::Dispatch { group_count: [1, 1, 1] }.legality(), Legality::OutsideRenderPass);
        assert_eq!(
            Command::Draw {
                vertex_count: 3,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0
            }
            .legality(),
            Legality::InsideRenderPass
        );
        assert_eq!(Command::SetLineWidth(1.0).legality(), Legality::Both);
        assert_eq!(Command::EndRenderPass.legality(), Legality::InsideRenderPass);
    }

    #[test]
    fn test_legality_allows() {
        assert!(Legality::Both.allows(true));
        assert!(Legality::Both.allows(false));
        assert!(!Legality::OutsideRenderPass.allows(true));
        assert!(!Legality::InsideRenderPass.allows(false));
    }

    #[test]
    fn test_clear_color_rgba8() {
        assert_eq!(ClearColor::Float32([1.0, 0.5, 0.0, 1.0]).to_rgba8(), [255, 128, 0, 255]);
        assert_eq!(ClearColor::Uint32([300, 7, 0, 255]).to_rgba8(), [255, 7, 0, 255]);
        assert_eq!(ClearColor::Int32([-4, 7, 0, 255]).to_rgba8(), [0, 7, 0, 255]);
    }
}
