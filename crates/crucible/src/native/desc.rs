//! Owned descriptors exchanged with the native device
//!
//! Builders translate into these plain values; backends translate them into
//! the driver's pointer chains. Because they own their arrays and compare
//! structurally, two bakes of equal state produce equal descriptors.

use ash::vk;

/// Result of a native call: the driver's code verbatim on failure
pub type NativeResult<T> = Result<T, vk::Result>;

/// What the device can do, queried once at device creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// Human-readable adapter name
    pub device_name: String,
    /// Physical devices linked in the device group (1 for single-GPU)
    pub physical_device_count: u32,
    /// Queue family supporting graphics, compute and transfer
    pub universal_queue_family: u32,
    /// Number of queues created in the universal family
    pub n_universal_queues: u32,
    /// Maximum color attachments per subpass
    pub max_color_attachments: u32,
    /// Maximum input attachments visible to one shader stage
    pub max_input_attachments: u32,
    /// Maximum viewports per pipeline
    pub max_viewports: u32,
    /// Maximum vertex input bindings per pipeline
    pub max_vertex_input_bindings: u32,
    /// Depth/stencil resolve in subpasses
    pub supports_depth_stencil_resolve: bool,
    /// Multiview render passes
    pub supports_multiview: bool,
    /// `VK_AMD_rasterization_order`
    pub supports_rasterization_order: bool,
    /// `VK_EXT_conservative_rasterization`
    pub supports_conservative_rasterization: bool,
    /// `VK_EXT_transform_feedback`
    pub supports_transform_feedback: bool,
    /// `VK_EXT_depth_clip_enable`
    pub supports_depth_clip_enable: bool,
    /// `VK_EXT_sample_locations`
    pub supports_sample_locations: bool,
    /// `VK_EXT_vertex_attribute_divisor`
    pub supports_vertex_attribute_divisor: bool,
    /// `VK_EXT_debug_utils`
    pub supports_debug_utils: bool,
    /// Geometry shader stage
    pub supports_geometry_shader: bool,
    /// Tessellation shader stages
    pub supports_tessellation_shader: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            device_name: String::from("unknown"),
            physical_device_count: 1,
            universal_queue_family: 0,
            n_universal_queues: 1,
            max_color_attachments: 8,
            max_input_attachments: 8,
            max_viewports: 16,
            max_vertex_input_bindings: 32,
            supports_depth_stencil_resolve: false,
            supports_multiview: false,
            supports_rasterization_order: false,
            supports_conservative_rasterization: false,
            supports_transform_feedback: false,
            supports_depth_clip_enable: false,
            supports_sample_locations: false,
            supports_vertex_attribute_divisor: false,
            supports_debug_utils: false,
            supports_geometry_shader: false,
            supports_tessellation_shader: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Render passes
// ---------------------------------------------------------------------------

/// One attachment declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentDesc {
    /// Memory may alias other attachments
    pub may_alias: bool,
    /// Attachment format
    pub format: vk::Format,
    /// Sample count
    pub samples: vk::SampleCountFlags,
    /// Color/depth load op
    pub load_op: vk::AttachmentLoadOp,
    /// Color/depth store op
    pub store_op: vk::AttachmentStoreOp,
    /// Stencil load op
    pub stencil_load_op: vk::AttachmentLoadOp,
    /// Stencil store op
    pub stencil_store_op: vk::AttachmentStoreOp,
    /// Layout on render pass entry
    pub initial_layout: vk::ImageLayout,
    /// Layout on render pass exit
    pub final_layout: vk::ImageLayout,
}

/// Attachment reference inside a subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRefDesc {
    /// Attachment index or `vk::ATTACHMENT_UNUSED`
    pub attachment: u32,
    /// Layout during the subpass
    pub layout: vk::ImageLayout,
    /// Aspects read (input attachments only)
    pub aspect_mask: vk::ImageAspectFlags,
}

impl AttachmentRefDesc {
    /// Slot that is not bound
    pub const UNUSED: Self = Self {
        attachment: vk::ATTACHMENT_UNUSED,
        layout: vk::ImageLayout::UNDEFINED,
        aspect_mask: vk::ImageAspectFlags::empty(),
    };

    /// Whether the slot is unbound
    pub fn is_unused(&self) -> bool {
        self.attachment == vk::ATTACHMENT_UNUSED
    }
}

/// Depth/stencil resolve of a subpass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilResolveDesc {
    /// Resolve target
    pub attachment: AttachmentRefDesc,
    /// Depth resolve mode
    pub depth_resolve_mode: vk::ResolveModeFlags,
    /// Stencil resolve mode
    pub stencil_resolve_mode: vk::ResolveModeFlags,
}

/// One subpass in native (dense array) form
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubpassDesc {
    /// Multiview view mask
    pub view_mask: u32,
    /// Input attachments, indexed by input attachment index
    pub input_attachments: Vec<AttachmentRefDesc>,
    /// Color attachments, indexed by location
    pub color_attachments: Vec<AttachmentRefDesc>,
    /// Empty, or one entry per color attachment
    pub resolve_attachments: Vec<AttachmentRefDesc>,
    /// Depth/stencil attachment
    pub depth_stencil_attachment: Option<AttachmentRefDesc>,
    /// Depth/stencil resolve
    pub depth_stencil_resolve: Option<DepthStencilResolveDesc>,
    /// Attachments whose contents must survive this subpass
    pub preserve_attachments: Vec<u32>,
}

/// Subpass dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyDesc {
    /// Source subpass or `vk::SUBPASS_EXTERNAL`
    pub src_subpass: u32,
    /// Destination subpass or `vk::SUBPASS_EXTERNAL`
    pub dst_subpass: u32,
    /// Source stages
    pub src_stage_mask: vk::PipelineStageFlags,
    /// Destination stages
    pub dst_stage_mask: vk::PipelineStageFlags,
    /// Source access
    pub src_access_mask: vk::AccessFlags,
    /// Destination access
    pub dst_access_mask: vk::AccessFlags,
    /// Dependency flags
    pub dependency_flags: vk::DependencyFlags,
    /// Multiview view offset
    pub view_offset: i32,
}

/// Complete render pass
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderPassDesc {
    /// Attachments in ID order
    pub attachments: Vec<AttachmentDesc>,
    /// Subpasses in ID order
    pub subpasses: Vec<SubpassDesc>,
    /// Dependencies
    pub dependencies: Vec<DependencyDesc>,
    /// Multiview correlation masks
    pub correlated_view_masks: Vec<u32>,
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Specialization constant placement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationEntryDesc {
    /// Constant ID in the shader
    pub constant_id: u32,
    /// Byte offset into the data blob
    pub offset: u32,
    /// Byte size
    pub size: usize,
}

/// Specialization info of one stage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecializationDesc {
    /// Map entries
    pub entries: Vec<SpecializationEntryDesc>,
    /// Packed constant data
    pub data: Vec<u8>,
}

/// One shader stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStageDesc {
    /// Stage bit
    pub stage: vk::ShaderStageFlags,
    /// Shader module
    pub module: vk::ShaderModule,
    /// Entry point name
    pub entry_point: String,
    /// Specialization constants
    pub specialization: Option<SpecializationDesc>,
}

/// Vertex buffer binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBindingDesc {
    /// Binding index
    pub binding: u32,
    /// Stride in bytes
    pub stride: u32,
    /// Per-vertex or per-instance
    pub input_rate: vk::VertexInputRate,
    /// Instance divisor (1 = every instance)
    pub divisor: u32,
}

/// Vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    /// Shader location
    pub location: u32,
    /// Binding the attribute reads from
    pub binding: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Offset inside the binding's element
    pub offset: u32,
}

/// Static viewport
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportDesc {
    /// Origin x
    pub x: f32,
    /// Origin y
    pub y: f32,
    /// Width
    pub width: f32,
    /// Height
    pub height: f32,
    /// Minimum depth
    pub min_depth: f32,
    /// Maximum depth
    pub max_depth: f32,
}

impl ViewportDesc {
    /// Native form
    pub fn to_vk(self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }
}

/// Static scissor box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScissorDesc {
    /// Origin x
    pub x: i32,
    /// Origin y
    pub y: i32,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl ScissorDesc {
    /// Native form
    pub fn to_vk(self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: self.x, y: self.y },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

/// Stencil state of one face
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilOpDesc {
    /// Op when the stencil test fails
    pub fail_op: vk::StencilOp,
    /// Op when both tests pass
    pub pass_op: vk::StencilOp,
    /// Op when the depth test fails
    pub depth_fail_op: vk::StencilOp,
    /// Comparison
    pub compare_op: vk::CompareOp,
    /// Compare mask
    pub compare_mask: u32,
    /// Write mask
    pub write_mask: u32,
    /// Reference value
    pub reference: u32,
}

impl StencilOpDesc {
    /// Native form
    pub fn to_vk(self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.compare_mask,
            write_mask: self.write_mask,
            reference: self.reference,
        }
    }
}

/// Blend state of one color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorBlendAttachmentDesc {
    /// Blending on
    pub blend_enable: bool,
    /// Source color factor
    pub src_color_blend_factor: vk::BlendFactor,
    /// Destination color factor
    pub dst_color_blend_factor: vk::BlendFactor,
    /// Color op
    pub color_blend_op: vk::BlendOp,
    /// Source alpha factor
    pub src_alpha_blend_factor: vk::BlendFactor,
    /// Destination alpha factor
    pub dst_alpha_blend_factor: vk::BlendFactor,
    /// Alpha op
    pub alpha_blend_op: vk::BlendOp,
    /// Channel write mask
    pub color_write_mask: vk::ColorComponentFlags,
}

/// Custom sample locations
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleLocationsDesc {
    /// Samples per pixel the locations describe
    pub per_pixel: vk::SampleCountFlags,
    /// Grid width in pixels
    pub grid_width: u32,
    /// Grid height in pixels
    pub grid_height: u32,
    /// Locations, `[x, y]` in `[0, 1)`
    pub locations: Vec<[f32; 2]>,
}

/// Depth bias constants
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBiasDesc {
    /// Constant factor
    pub constant_factor: f32,
    /// Clamp
    pub clamp: f32,
    /// Slope factor
    pub slope_factor: f32,
}

/// Conservative rasterization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConservativeRasterizationDesc {
    /// Mode
    pub mode: vk::ConservativeRasterizationModeEXT,
    /// Extra overestimation in pixels
    pub extra_primitive_overestimation_size: f32,
}

/// Base pipeline of a derivative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineBase {
    /// Not a derivative
    #[default]
    None,
    /// Derives from an already created pipeline
    Handle(vk::Pipeline),
    /// Derives from an earlier pipeline of the same batch
    Index(i32),
}

/// Complete graphics pipeline descriptor chain
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    /// Create flags
    pub flags: vk::PipelineCreateFlags,
    /// Shader stages
    pub stages: Vec<ShaderStageDesc>,
    /// Vertex bindings
    pub vertex_bindings: Vec<VertexBindingDesc>,
    /// Vertex attributes
    pub vertex_attributes: Vec<VertexAttributeDesc>,
    /// Primitive topology
    pub topology: vk::PrimitiveTopology,
    /// Primitive restart
    pub primitive_restart: bool,
    /// Patch control points, when tessellation stages exist
    pub patch_control_points: Option<u32>,
    /// Tessellation domain origin, when tessellation stages exist
    pub tessellation_domain_origin: Option<vk::TessellationDomainOrigin>,
    /// Viewport count
    pub viewport_count: u32,
    /// Static viewports (empty when dynamic)
    pub viewports: Vec<ViewportDesc>,
    /// Scissor count
    pub scissor_count: u32,
    /// Static scissors (empty when dynamic)
    pub scissors: Vec<ScissorDesc>,
    /// Depth clamp
    pub depth_clamp: bool,
    /// Rasterizer discard
    pub rasterizer_discard: bool,
    /// Polygon mode
    pub polygon_mode: vk::PolygonMode,
    /// Cull mode
    pub cull_mode: vk::CullModeFlags,
    /// Front face
    pub front_face: vk::FrontFace,
    /// Depth bias, when enabled
    pub depth_bias: Option<DepthBiasDesc>,
    /// Line width
    pub line_width: f32,
    /// Rasterization order, when the extension is present
    pub rasterization_order: Option<vk::RasterizationOrderAMD>,
    /// Conservative rasterization, when enabled
    pub conservative_rasterization: Option<ConservativeRasterizationDesc>,
    /// Rasterization stream, when transform feedback is present
    pub rasterization_stream: Option<u32>,
    /// Depth clip, when the extension is present
    pub depth_clip_enable: Option<bool>,
    /// Rasterization samples
    pub rasterization_samples: vk::SampleCountFlags,
    /// Minimum sample shading, when sample shading is on
    pub sample_shading: Option<f32>,
    /// Sample mask words (empty = all samples)
    pub sample_mask: Vec<u32>,
    /// Alpha to coverage
    pub alpha_to_coverage: bool,
    /// Alpha to one
    pub alpha_to_one: bool,
    /// Custom sample locations, when enabled
    pub sample_locations: Option<SampleLocationsDesc>,
    /// Depth test
    pub depth_test: bool,
    /// Depth writes
    pub depth_write: bool,
    /// Depth comparison
    pub depth_compare_op: vk::CompareOp,
    /// Depth bounds test
    pub depth_bounds_test: bool,
    /// Minimum depth bound
    pub min_depth_bounds: f32,
    /// Maximum depth bound
    pub max_depth_bounds: f32,
    /// Stencil test
    pub stencil_test: bool,
    /// Front-face stencil state
    pub stencil_front: StencilOpDesc,
    /// Back-face stencil state
    pub stencil_back: StencilOpDesc,
    /// Logic op, when enabled
    pub logic_op: Option<vk::LogicOp>,
    /// Per-attachment blend state, indexed by color location
    pub color_blend_attachments: Vec<ColorBlendAttachmentDesc>,
    /// Blend constants
    pub blend_constants: [f32; 4],
    /// Dynamic states
    pub dynamic_states: Vec<vk::DynamicState>,
    /// Pipeline layout
    pub layout: vk::PipelineLayout,
    /// Render pass
    pub render_pass: vk::RenderPass,
    /// Subpass index
    pub subpass: u32,
    /// Base pipeline
    pub base: PipelineBase,
}

/// Failure of a batched pipeline creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Driver result for the whole batch
    pub result: vk::Result,
    /// Per-item handles; null where creation failed
    pub pipelines: Vec<vk::Pipeline>,
}

/// Push constant range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRangeDesc {
    /// Stages that read the range
    pub stages: vk::ShaderStageFlags,
    /// Byte offset
    pub offset: u32,
    /// Byte size
    pub size: u32,
}

/// Pipeline layout
#[derive(Debug, Clone, PartialEq, Eq, Default, Hash)]
pub struct PipelineLayoutDesc {
    /// Descriptor set layouts
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    /// Push constant ranges
    pub push_constant_ranges: Vec<PushConstantRangeDesc>,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Framebuffer bound to one render pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    /// Compatible render pass
    pub render_pass: vk::RenderPass,
    /// Attachment views in render pass attachment order
    pub attachments: Vec<vk::ImageView>,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Layer count
    pub layers: u32,
}

/// Image with dedicated memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Create flags
    pub flags: vk::ImageCreateFlags,
    /// Dimensionality
    pub image_type: vk::ImageType,
    /// Format
    pub format: vk::Format,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Depth
    pub depth: u32,
    /// Mip levels
    pub mip_levels: u32,
    /// Array layers
    pub array_layers: u32,
    /// Samples
    pub samples: vk::SampleCountFlags,
    /// Tiling
    pub tiling: vk::ImageTiling,
    /// Usage
    pub usage: vk::ImageUsageFlags,
    /// Initial layout
    pub initial_layout: vk::ImageLayout,
    /// Back the image with host-visible memory
    pub host_visible: bool,
}

/// Image view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    /// Viewed image
    pub image: vk::Image,
    /// View type
    pub view_type: vk::ImageViewType,
    /// View format
    pub format: vk::Format,
    /// Aspects
    pub aspect_mask: vk::ImageAspectFlags,
    /// First mip
    pub base_mip_level: u32,
    /// Mip count
    pub level_count: u32,
    /// First layer
    pub base_array_layer: u32,
    /// Layer count
    pub layer_count: u32,
}

/// Buffer with dedicated memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Usage
    pub usage: vk::BufferUsageFlags,
    /// Back the buffer with host-visible memory
    pub host_visible: bool,
}

/// Query pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPoolDesc {
    /// Query type
    pub query_type: vk::QueryType,
    /// Number of queries
    pub query_count: u32,
    /// Statistics gathered (pipeline statistics pools only)
    pub pipeline_statistics: vk::QueryPipelineStatisticFlags,
}

// ---------------------------------------------------------------------------
// Command buffers and queues
// ---------------------------------------------------------------------------

/// Inheritance of a secondary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InheritanceDesc {
    /// Render pass the buffer executes in
    pub render_pass: vk::RenderPass,
    /// Subpass the buffer executes in
    pub subpass: u32,
    /// Framebuffer, if known
    pub framebuffer: vk::Framebuffer,
    /// Occlusion queries may be active
    pub occlusion_query_enable: bool,
    /// Occlusion query flags
    pub query_flags: vk::QueryControlFlags,
    /// Pipeline statistics that may be active
    pub pipeline_statistics: vk::QueryPipelineStatisticFlags,
}

/// Begin info
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferBeginDesc {
    /// Usage flags
    pub flags: vk::CommandBufferUsageFlags,
    /// Device group mask, for primaries on multi-GPU devices
    pub device_mask: Option<u32>,
    /// Inheritance, for secondaries
    pub inheritance: Option<InheritanceDesc>,
}

/// One queue submission
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitDesc {
    /// Semaphores waited on
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Stage per waited semaphore
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    /// Primaries to execute
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Semaphores signalled
    pub signal_semaphores: Vec<vk::Semaphore>,
    /// Device mask per command buffer (empty = all devices)
    pub command_buffer_device_masks: Vec<u32>,
}

/// One present request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresentDesc {
    /// Semaphores waited on
    pub wait_semaphores: Vec<vk::Semaphore>,
    /// Swapchains to present
    pub swapchains: Vec<vk::SwapchainKHR>,
    /// Image index per swapchain
    pub image_indices: Vec<u32>,
}

/// Swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Target surface
    pub surface: vk::SurfaceKHR,
    /// Minimum image count
    pub min_image_count: u32,
    /// Image format
    pub format: vk::Format,
    /// Color space
    pub color_space: vk::ColorSpaceKHR,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Present mode
    pub present_mode: vk::PresentModeKHR,
    /// Swapchain being replaced
    pub old_swapchain: vk::SwapchainKHR,
}

/// Surface support reported by the driver
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurfaceProperties {
    /// Supported format/color space pairs
    pub formats: Vec<(vk::Format, vk::ColorSpaceKHR)>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Minimum image count
    pub min_image_count: u32,
    /// Maximum image count (0 = unbounded)
    pub max_image_count: u32,
    /// Fixed surface extent, if the surface dictates one
    pub current_extent: Option<(u32, u32)>,
    /// Surface transform
    pub current_transform: vk::SurfaceTransformFlagsKHR,
}

/// RGBA8 read-back of a 2D image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackDesc {
    /// Source image
    pub image: vk::Image,
    /// Source format
    pub format: vk::Format,
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Layout the image is in
    pub layout: vk::ImageLayout,
}
