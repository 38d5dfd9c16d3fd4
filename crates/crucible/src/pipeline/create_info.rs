//! Graphics pipeline create-info
//!
//! A value object holding every piece of fixed-function and programmable
//! state of one graphics pipeline. Setters validate their arguments and
//! leave the object untouched when they fail, so a rejected call never
//! leaves half-applied state behind.
//!
//! A *proxy* create-info has no render pass. It cannot be added to a
//! manager and only exists to seed other create-infos through
//! [`GraphicsPipelineCreateInfo::copy_gfx_state_from`].

use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::error::{contract_violation, ensure_contract, CrucibleError, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::PipelineId;
use crate::native::{
    ColorBlendAttachmentDesc, ConservativeRasterizationDesc, DepthBiasDesc, GraphicsPipelineDesc, PipelineBase,
    SampleLocationsDesc, ScissorDesc, StencilOpDesc, ViewportDesc,
};
use crate::render_pass::{RenderPass, SubpassId};
use crate::resources::{PipelineLayout, ShaderEntryPoint, ShaderStage};

use super::vertex_input::{VertexAttribute, VertexInputLayout};

/// Arc compared by address
struct Shared<T>(Arc<T>);

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> PartialEq for Shared<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Stencil face selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilFace {
    /// Front-facing primitives
    Front,
    /// Back-facing primitives
    Back,
    /// Both faces
    FrontAndBack,
}

/// Pipeline this one derives from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BasePipeline {
    /// Not a derivative
    #[default]
    None,
    /// Another pipeline of the same manager
    Id(PipelineId),
}

/// Default stencil state: KEEP everywhere, compare ALWAYS, full masks
pub const DEFAULT_STENCIL_OP: StencilOpDesc = StencilOpDesc {
    fail_op: vk::StencilOp::KEEP,
    pass_op: vk::StencilOp::KEEP,
    depth_fail_op: vk::StencilOp::KEEP,
    compare_op: vk::CompareOp::ALWAYS,
    compare_mask: u32::MAX,
    write_mask: u32::MAX,
    reference: 0,
};

/// Default blend state: off, ONE/ONE, ADD, RGBA writes
pub const DEFAULT_BLEND_ATTACHMENT: ColorBlendAttachmentDesc = ColorBlendAttachmentDesc {
    blend_enable: false,
    src_color_blend_factor: vk::BlendFactor::ONE,
    dst_color_blend_factor: vk::BlendFactor::ONE,
    color_blend_op: vk::BlendOp::ADD,
    src_alpha_blend_factor: vk::BlendFactor::ONE,
    dst_alpha_blend_factor: vk::BlendFactor::ONE,
    alpha_blend_op: vk::BlendOp::ADD,
    color_write_mask: vk::ColorComponentFlags::RGBA,
};

/// Full state of one graphics pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineCreateInfo {
    device: Shared<Device>,
    render_pass: Option<Shared<RenderPass>>,
    subpass: SubpassId,
    layout: Option<Shared<PipelineLayout>>,
    base: BasePipeline,
    allow_derivatives: bool,
    disable_optimizations: bool,

    stages: BTreeMap<ShaderStage, ShaderEntryPoint>,
    vertex_attributes: Vec<VertexAttribute>,

    topology: vk::PrimitiveTopology,
    primitive_restart: bool,
    patch_control_points: u32,
    tessellation_domain_origin: vk::TessellationDomainOrigin,

    viewports: BTreeMap<u32, ViewportDesc>,
    scissors: BTreeMap<u32, ScissorDesc>,

    depth_clamp: bool,
    depth_clip: bool,
    rasterizer_discard: bool,
    polygon_mode: vk::PolygonMode,
    cull_mode: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_bias_enabled: bool,
    depth_bias: DepthBiasDesc,
    line_width: f32,
    rasterization_order: vk::RasterizationOrderAMD,
    conservative_mode: vk::ConservativeRasterizationModeEXT,
    extra_primitive_overestimation_size: f32,
    rasterization_stream: u32,

    samples: vk::SampleCountFlags,
    sample_shading: bool,
    min_sample_shading: f32,
    sample_mask_enabled: bool,
    sample_mask: u64,
    alpha_to_coverage: bool,
    alpha_to_one: bool,
    sample_locations_enabled: bool,
    sample_locations: SampleLocationsDesc,

    depth_test: bool,
    depth_write: bool,
    depth_compare_op: vk::CompareOp,
    depth_bounds_test: bool,
    min_depth_bounds: f32,
    max_depth_bounds: f32,
    stencil_test: bool,
    stencil_front: StencilOpDesc,
    stencil_back: StencilOpDesc,

    logic_op_enabled: bool,
    logic_op: vk::LogicOp,
    blend_constants: [f32; 4],
    blend_attachments: BTreeMap<u32, ColorBlendAttachmentDesc>,

    dynamic_states: Vec<vk::DynamicState>,
}

impl GraphicsPipelineCreateInfo {
    /// Create-info with default state for `subpass` of `render_pass`
    pub fn new(render_pass: &Arc<RenderPass>, subpass: SubpassId) -> CrucibleResult<Self> {
        ensure_contract!(
            subpass < render_pass.n_subpasses(),
            "subpass {} out of range for render pass with {} subpasses",
            subpass,
            render_pass.n_subpasses()
        );
        let mut info = Self::with_defaults(render_pass.device());
        info.render_pass = Some(Shared(Arc::clone(render_pass)));
        info.subpass = subpass;
        Ok(info)
    }

    /// Proxy create-info: default state, no render pass
    pub fn new_proxy(device: &Arc<Device>) -> Self {
        Self::with_defaults(device)
    }

    fn with_defaults(device: &Arc<Device>) -> Self {
        Self {
            device: Shared(Arc::clone(device)),
            render_pass: None,
            subpass: 0,
            layout: None,
            base: BasePipeline::None,
            allow_derivatives: false,
            disable_optimizations: false,

            stages: BTreeMap::new(),
            vertex_attributes: Vec::new(),

            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
            patch_control_points: 1,
            tessellation_domain_origin: vk::TessellationDomainOrigin::UPPER_LEFT,

            viewports: BTreeMap::new(),
            scissors: BTreeMap::new(),

            depth_clamp: false,
            depth_clip: true,
            rasterizer_discard: false,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_bias_enabled: false,
            depth_bias: DepthBiasDesc::default(),
            line_width: 1.0,
            rasterization_order: vk::RasterizationOrderAMD::STRICT,
            conservative_mode: vk::ConservativeRasterizationModeEXT::DISABLED,
            extra_primitive_overestimation_size: 0.0,
            rasterization_stream: 0,

            samples: vk::SampleCountFlags::TYPE_1,
            sample_shading: false,
            min_sample_shading: 1.0,
            sample_mask_enabled: false,
            sample_mask: u64::MAX,
            alpha_to_coverage: false,
            alpha_to_one: false,
            sample_locations_enabled: false,
            sample_locations: SampleLocationsDesc::default(),

            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::ALWAYS,
            depth_bounds_test: false,
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_test: false,
            stencil_front: DEFAULT_STENCIL_OP,
            stencil_back: DEFAULT_STENCIL_OP,

            logic_op_enabled: false,
            logic_op: vk::LogicOp::NO_OP,
            blend_constants: [0.0; 4],
            blend_attachments: BTreeMap::new(),

            dynamic_states: Vec::new(),
        }
    }

    /// Copy every piece of graphics state from `other`
    ///
    /// The render pass, subpass and device of `self` are kept, so a proxy can
    /// seed a bakeable create-info and vice versa.
    pub fn copy_gfx_state_from(&mut self, other: &Self) {
        let device = self.device.clone();
        let render_pass = self.render_pass.take();
        let subpass = self.subpass;

        *self = other.clone();

        self.device = device;
        self.render_pass = render_pass;
        self.subpass = subpass;
    }

    // -- identity -----------------------------------------------------------

    /// Device the pipeline will be created on
    pub fn device(&self) -> &Arc<Device> {
        &self.device.0
    }

    /// Whether this is a proxy (no render pass)
    pub fn is_proxy(&self) -> bool {
        self.render_pass.is_none()
    }

    /// Render pass, unless this is a proxy
    pub fn render_pass(&self) -> Option<&Arc<RenderPass>> {
        self.render_pass.as_ref().map(|r| &r.0)
    }

    /// Subpass index
    pub fn subpass(&self) -> SubpassId {
        self.subpass
    }

    /// Pipeline layout; the manager supplies an empty one when unset
    pub fn pipeline_layout(&self) -> Option<&Arc<PipelineLayout>> {
        self.layout.as_ref().map(|l| &l.0)
    }

    /// Set the pipeline layout
    pub fn set_pipeline_layout(&mut self, layout: &Arc<PipelineLayout>) {
        self.layout = Some(Shared(Arc::clone(layout)));
    }

    /// Base pipeline
    pub fn base_pipeline(&self) -> BasePipeline {
        self.base
    }

    /// Derive from another pipeline of the same manager
    pub fn set_base_pipeline(&mut self, base: BasePipeline) {
        self.base = base;
    }

    /// Whether other pipelines may derive from this one
    pub fn allows_derivatives(&self) -> bool {
        self.allow_derivatives
    }

    /// Allow other pipelines to derive from this one
    pub fn set_allow_derivatives(&mut self, allow: bool) {
        self.allow_derivatives = allow;
    }

    /// Ask the driver to skip optimisation
    pub fn set_disable_optimizations(&mut self, disable: bool) {
        self.disable_optimizations = disable;
    }

    // -- shaders ------------------------------------------------------------

    /// Attach or detach the entry point of `stage`
    pub fn set_shader_stage(&mut self, stage: ShaderStage, entry_point: Option<ShaderEntryPoint>) -> CrucibleResult<()> {
        let caps = self.device().capabilities();
        let supported = match stage {
            ShaderStage::Geometry => caps.supports_geometry_shader,
            ShaderStage::TessellationControl | ShaderStage::TessellationEvaluation => {
                caps.supports_tessellation_shader
            }
            ShaderStage::Vertex | ShaderStage::Fragment => true,
        };
        if entry_point.is_some() && !supported {
            log::error!("{:?} shaders are not supported by this device", stage);
            return Err(CrucibleError::Unsupported(format!("{stage:?} shader stage")));
        }

        match entry_point {
            Some(entry_point) => {
                self.stages.insert(stage, entry_point);
            }
            None => {
                self.stages.remove(&stage);
            }
        }
        Ok(())
    }

    /// Entry point of `stage`
    pub fn shader_stage(&self, stage: ShaderStage) -> Option<&ShaderEntryPoint> {
        self.stages.get(&stage)
    }

    fn has_tessellation(&self) -> bool {
        self.stages.contains_key(&ShaderStage::TessellationControl)
            || self.stages.contains_key(&ShaderStage::TessellationEvaluation)
    }

    // -- vertex input -------------------------------------------------------

    /// Declare a vertex attribute
    ///
    /// With `explicit_binding`, the attribute gets that binding index to
    /// itself (shared only with other attributes naming the same index, which
    /// must then agree on stride, rate and divisor). Without it, the manager
    /// folds the attribute onto a binding with matching stride, rate and
    /// divisor at bake time.
    #[allow(clippy::too_many_arguments)]
    pub fn add_vertex_attribute(
        &mut self,
        location: u32,
        format: vk::Format,
        offset: u32,
        stride: u32,
        input_rate: vk::VertexInputRate,
        explicit_binding: Option<u32>,
        divisor: u32,
    ) -> CrucibleResult<()> {
        ensure_contract!(
            !self.vertex_attributes.iter().any(|a| a.location == location),
            "vertex attribute location {} already defined",
            location
        );
        if divisor != 1 {
            ensure_contract!(
                input_rate == vk::VertexInputRate::INSTANCE,
                "divisor {} on a per-vertex attribute at location {}",
                divisor,
                location
            );
            if !self.device().capabilities().supports_vertex_attribute_divisor {
                log::error!("Vertex attribute divisor requested without device support");
                return Err(CrucibleError::Unsupported("vertex attribute divisor".to_string()));
            }
        }

        let attribute = VertexAttribute {
            location,
            format,
            offset,
            stride,
            input_rate,
            explicit_binding,
            divisor,
        };

        if let Some(binding) = explicit_binding {
            let conflict = self
                .vertex_attributes
                .iter()
                .filter(|a| a.explicit_binding == Some(binding))
                .any(|a| !a.shares_binding_with(&attribute));
            ensure_contract!(
                !conflict,
                "attribute at location {} disagrees with other attributes on explicit binding {}",
                location,
                binding
            );
        }

        self.vertex_attributes.push(attribute);
        Ok(())
    }

    /// Declared vertex attributes in add order
    pub fn vertex_attributes(&self) -> &[VertexAttribute] {
        &self.vertex_attributes
    }

    // -- input assembly / tessellation -----------------------------------------

    /// Primitive topology
    pub fn set_primitive_topology(&mut self, topology: vk::PrimitiveTopology) {
        self.topology = topology;
    }

    /// Primitive topology
    pub fn primitive_topology(&self) -> vk::PrimitiveTopology {
        self.topology
    }

    /// Primitive restart
    pub fn set_primitive_restart(&mut self, enabled: bool) {
        self.primitive_restart = enabled;
    }

    /// Control points per patch
    pub fn set_patch_control_points(&mut self, n: u32) -> CrucibleResult<()> {
        ensure_contract!((1..=32).contains(&n), "patch control point count {} out of range", n);
        self.patch_control_points = n;
        Ok(())
    }

    /// Control points per patch
    pub fn patch_control_points(&self) -> u32 {
        self.patch_control_points
    }

    /// Tessellation domain origin
    pub fn set_tessellation_domain_origin(&mut self, origin: vk::TessellationDomainOrigin) {
        self.tessellation_domain_origin = origin;
    }

    /// Tessellation domain origin
    pub fn tessellation_domain_origin(&self) -> vk::TessellationDomainOrigin {
        self.tessellation_domain_origin
    }

    // -- viewports ----------------------------------------------------------

    /// Static viewport at `index`
    pub fn set_viewport(&mut self, index: u32, viewport: ViewportDesc) -> CrucibleResult<()> {
        let max = self.device().capabilities().max_viewports;
        ensure_contract!(index < max, "viewport index {} exceeds the device limit of {}", index, max);
        ensure_contract!(
            viewport.width > 0.0 && viewport.min_depth <= viewport.max_depth,
            "degenerate viewport {:?}",
            viewport
        );
        self.viewports.insert(index, viewport);
        Ok(())
    }

    /// Static scissor box at `index`
    pub fn set_scissor(&mut self, index: u32, scissor: ScissorDesc) -> CrucibleResult<()> {
        let max = self.device().capabilities().max_viewports;
        ensure_contract!(index < max, "scissor index {} exceeds the device limit of {}", index, max);
        self.scissors.insert(index, scissor);
        Ok(())
    }

    /// Number of viewports defined
    pub fn n_viewports(&self) -> u32 {
        self.viewports.len() as u32
    }

    /// Number of scissor boxes defined
    pub fn n_scissors(&self) -> u32 {
        self.scissors.len() as u32
    }

    /// Viewport at `index`
    pub fn viewport(&self, index: u32) -> Option<ViewportDesc> {
        self.viewports.get(&index).copied()
    }

    // -- rasterization ------------------------------------------------------

    /// Polygon mode, culling, winding and line width
    pub fn set_rasterization_properties(
        &mut self,
        polygon_mode: vk::PolygonMode,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
        line_width: f32,
    ) -> CrucibleResult<()> {
        ensure_contract!(line_width > 0.0, "line width {} must be positive", line_width);
        self.polygon_mode = polygon_mode;
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self.line_width = line_width;
        Ok(())
    }

    /// Polygon mode
    pub fn polygon_mode(&self) -> vk::PolygonMode {
        self.polygon_mode
    }

    /// Cull mode
    pub fn cull_mode(&self) -> vk::CullModeFlags {
        self.cull_mode
    }

    /// Front face winding
    pub fn front_face(&self) -> vk::FrontFace {
        self.front_face
    }

    /// Line width
    pub fn line_width(&self) -> f32 {
        self.line_width
    }

    /// Depth bias
    pub fn set_depth_bias(&mut self, enabled: bool, constant_factor: f32, clamp: f32, slope_factor: f32) {
        self.depth_bias_enabled = enabled;
        self.depth_bias = DepthBiasDesc {
            constant_factor,
            clamp,
            slope_factor,
        };
    }

    /// Depth bias, if enabled
    pub fn depth_bias(&self) -> Option<DepthBiasDesc> {
        self.depth_bias_enabled.then_some(self.depth_bias)
    }

    /// Depth clamp
    pub fn set_depth_clamp(&mut self, enabled: bool) {
        self.depth_clamp = enabled;
    }

    /// Depth clip; reaches the driver only with `VK_EXT_depth_clip_enable`
    pub fn set_depth_clip(&mut self, enabled: bool) {
        self.depth_clip = enabled;
    }

    /// Rasterizer discard
    pub fn set_rasterizer_discard(&mut self, enabled: bool) {
        self.rasterizer_discard = enabled;
    }

    /// Rasterization order; ignored without `VK_AMD_rasterization_order`
    pub fn set_rasterization_order(&mut self, order: vk::RasterizationOrderAMD) {
        self.rasterization_order = order;
    }

    /// Rasterization order
    pub fn rasterization_order(&self) -> vk::RasterizationOrderAMD {
        self.rasterization_order
    }

    /// Conservative rasterization mode and extra overestimation
    pub fn set_conservative_rasterization(
        &mut self,
        mode: vk::ConservativeRasterizationModeEXT,
        extra_overestimation_size: f32,
    ) -> CrucibleResult<()> {
        ensure_contract!(
            extra_overestimation_size >= 0.0,
            "negative overestimation size {}",
            extra_overestimation_size
        );
        if mode != vk::ConservativeRasterizationModeEXT::DISABLED
            && !self.device().capabilities().supports_conservative_rasterization
        {
            log::error!("Conservative rasterization requested without device support");
            return Err(CrucibleError::Unsupported("conservative rasterization".to_string()));
        }
        self.conservative_mode = mode;
        self.extra_primitive_overestimation_size = extra_overestimation_size;
        Ok(())
    }

    /// Conservative rasterization mode and extra overestimation
    pub fn conservative_rasterization(&self) -> (vk::ConservativeRasterizationModeEXT, f32) {
        (self.conservative_mode, self.extra_primitive_overestimation_size)
    }

    /// Rasterization stream; reaches the driver only with transform feedback
    pub fn set_rasterization_stream(&mut self, stream: u32) {
        self.rasterization_stream = stream;
    }

    /// Rasterization stream index
    pub fn rasterization_stream(&self) -> u32 {
        self.rasterization_stream
    }

    // -- multisampling ------------------------------------------------------

    /// Sample count and sample shading
    pub fn set_multisampling(
        &mut self,
        samples: vk::SampleCountFlags,
        sample_shading: bool,
        min_sample_shading: f32,
    ) -> CrucibleResult<()> {
        ensure_contract!(
            samples.as_raw().is_power_of_two(),
            "sample count {:?} must be a single bit",
            samples
        );
        ensure_contract!(
            (0.0..=1.0).contains(&min_sample_shading),
            "min sample shading {} outside [0, 1]",
            min_sample_shading
        );
        self.samples = samples;
        self.sample_shading = sample_shading;
        self.min_sample_shading = min_sample_shading;
        Ok(())
    }

    /// Sample count
    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    /// Minimum sample shading, if sample shading is on
    pub fn sample_shading(&self) -> Option<f32> {
        self.sample_shading.then_some(self.min_sample_shading)
    }

    /// Sample mask
    pub fn set_sample_mask(&mut self, enabled: bool, mask: u64) {
        self.sample_mask_enabled = enabled;
        self.sample_mask = mask;
    }

    /// Sample mask, if enabled
    pub fn sample_mask(&self) -> Option<u64> {
        self.sample_mask_enabled.then_some(self.sample_mask)
    }

    /// Alpha to coverage
    pub fn set_alpha_to_coverage(&mut self, enabled: bool) {
        self.alpha_to_coverage = enabled;
    }

    /// Alpha to one
    pub fn set_alpha_to_one(&mut self, enabled: bool) {
        self.alpha_to_one = enabled;
    }

    /// Custom sample locations
    ///
    /// Enabling requires a non-empty grid and exactly
    /// `per_pixel * grid_width * grid_height` locations in `[0, 1)`.
    pub fn set_sample_locations(
        &mut self,
        enabled: bool,
        per_pixel: vk::SampleCountFlags,
        grid_size: (u32, u32),
        locations: &[[f32; 2]],
    ) -> CrucibleResult<()> {
        if enabled {
            if !self.device().capabilities().supports_sample_locations {
                log::error!("Sample locations requested without device support");
                return Err(CrucibleError::Unsupported("sample locations".to_string()));
            }
            let (width, height) = grid_size;
            let expected = per_pixel.as_raw() as usize * width as usize * height as usize;
            ensure_contract!(
                width > 0 && height > 0 && expected > 0,
                "sample location grid {}x{} with {:?} samples is empty",
                width,
                height,
                per_pixel
            );
            ensure_contract!(
                locations.len() == expected,
                "expected {} sample locations, got {}",
                expected,
                locations.len()
            );
            ensure_contract!(
                locations
                    .iter()
                    .flatten()
                    .all(|c| (0.0..1.0).contains(c)),
                "sample locations must lie in [0, 1)"
            );
        }

        self.sample_locations_enabled = enabled;
        self.sample_locations = SampleLocationsDesc {
            per_pixel,
            grid_width: grid_size.0,
            grid_height: grid_size.1,
            locations: locations.to_vec(),
        };
        Ok(())
    }

    /// Custom sample locations, if enabled
    pub fn sample_locations(&self) -> Option<&SampleLocationsDesc> {
        self.sample_locations_enabled.then_some(&self.sample_locations)
    }

    // -- depth / stencil ----------------------------------------------------

    /// Depth test and its comparison
    pub fn set_depth_test(&mut self, enabled: bool, compare_op: vk::CompareOp) {
        self.depth_test = enabled;
        self.depth_compare_op = compare_op;
    }

    /// Depth test, if enabled, with its comparison
    pub fn depth_test(&self) -> Option<vk::CompareOp> {
        self.depth_test.then_some(self.depth_compare_op)
    }

    /// Depth writes
    pub fn set_depth_writes(&mut self, enabled: bool) {
        self.depth_write = enabled;
    }

    /// Depth writes
    pub fn depth_writes(&self) -> bool {
        self.depth_write
    }

    /// Depth bounds test
    pub fn set_depth_bounds_test(&mut self, enabled: bool, min: f32, max: f32) -> CrucibleResult<()> {
        ensure_contract!(min <= max, "depth bounds [{}, {}] are inverted", min, max);
        self.depth_bounds_test = enabled;
        self.min_depth_bounds = min;
        self.max_depth_bounds = max;
        Ok(())
    }

    /// Depth bounds `[min, max]`
    pub fn depth_bounds(&self) -> (f32, f32) {
        (self.min_depth_bounds, self.max_depth_bounds)
    }

    /// Stencil test
    pub fn set_stencil_test(&mut self, enabled: bool) {
        self.stencil_test = enabled;
    }

    /// Stencil state of one or both faces
    pub fn set_stencil_op_state(&mut self, face: StencilFace, state: StencilOpDesc) {
        if matches!(face, StencilFace::Front | StencilFace::FrontAndBack) {
            self.stencil_front = state;
        }
        if matches!(face, StencilFace::Back | StencilFace::FrontAndBack) {
            self.stencil_back = state;
        }
    }

    /// Stencil state of `face` (`FrontAndBack` reads the front face)
    pub fn stencil_op_state(&self, face: StencilFace) -> StencilOpDesc {
        match face {
            StencilFace::Back => self.stencil_back,
            StencilFace::Front | StencilFace::FrontAndBack => self.stencil_front,
        }
    }

    // -- blending -----------------------------------------------------------

    /// Logic op
    pub fn set_logic_op(&mut self, enabled: bool, op: vk::LogicOp) {
        self.logic_op_enabled = enabled;
        self.logic_op = op;
    }

    /// Logic op, if enabled
    pub fn logic_op(&self) -> Option<vk::LogicOp> {
        self.logic_op_enabled.then_some(self.logic_op)
    }

    /// Blend constants
    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.blend_constants = constants;
    }

    /// Blend constants
    pub fn blend_constants(&self) -> [f32; 4] {
        self.blend_constants
    }

    /// Blend state of the color attachment at `location`
    pub fn set_color_blend_attachment_properties(
        &mut self,
        location: u32,
        state: ColorBlendAttachmentDesc,
    ) -> CrucibleResult<()> {
        let max = self.device().capabilities().max_color_attachments;
        ensure_contract!(location < max, "blend location {} exceeds the device limit of {}", location, max);
        self.blend_attachments.insert(location, state);
        Ok(())
    }

    /// Blend state at `location` (defaults when never set)
    pub fn color_blend_attachment_properties(&self, location: u32) -> ColorBlendAttachmentDesc {
        self.blend_attachments
            .get(&location)
            .copied()
            .unwrap_or(DEFAULT_BLEND_ATTACHMENT)
    }

    // -- dynamic state ------------------------------------------------------

    /// Enable or disable one dynamic state
    pub fn toggle_dynamic_state(&mut self, enabled: bool, state: vk::DynamicState) {
        let present = self.dynamic_states.contains(&state);
        if enabled && !present {
            self.dynamic_states.push(state);
        } else if !enabled && present {
            self.dynamic_states.retain(|s| *s != state);
        }
    }

    /// Whether `state` is dynamic
    pub fn is_dynamic_state_enabled(&self, state: vk::DynamicState) -> bool {
        self.dynamic_states.contains(&state)
    }

    /// Enabled dynamic states in enable order
    pub fn dynamic_states(&self) -> &[vk::DynamicState] {
        &self.dynamic_states
    }

    // -- lowering -----------------------------------------------------------

    /// Lower to the native descriptor
    ///
    /// `default_extent` sizes the synthesized viewport when none is set.
    pub(crate) fn to_native_desc(
        &self,
        vertex_input: &VertexInputLayout,
        layout: vk::PipelineLayout,
        base: PipelineBase,
        default_extent: Option<(u32, u32)>,
    ) -> CrucibleResult<GraphicsPipelineDesc> {
        let Some(render_pass) = self.render_pass() else {
            return Err(contract_violation("proxy create-infos cannot be baked"));
        };
        ensure_contract!(
            self.stages.contains_key(&ShaderStage::Vertex),
            "graphics pipeline has no vertex shader"
        );

        let caps = self.device().capabilities();
        let (viewport_count, viewports, scissor_count, scissors) = self.lower_viewports(default_extent)?;

        let n_color = render_pass
            .desc()
            .subpasses
            .get(self.subpass as usize)
            .map_or(0, |s| s.color_attachments.len() as u32);

        let mut flags = vk::PipelineCreateFlags::empty();
        if self.allow_derivatives {
            flags |= vk::PipelineCreateFlags::ALLOW_DERIVATIVES;
        }
        if self.disable_optimizations {
            flags |= vk::PipelineCreateFlags::DISABLE_OPTIMIZATION;
        }
        if base != PipelineBase::None {
            flags |= vk::PipelineCreateFlags::DERIVATIVE;
        }

        let tessellation = self.has_tessellation();
        let sample_mask = if self.sample_mask_enabled {
            if self.samples.as_raw() > 32 {
                vec![self.sample_mask as u32, (self.sample_mask >> 32) as u32]
            } else {
                vec![self.sample_mask as u32]
            }
        } else {
            Vec::new()
        };

        Ok(GraphicsPipelineDesc {
            flags,
            stages: self
                .stages
                .iter()
                .map(|(stage, entry)| entry.to_stage_desc(*stage))
                .collect(),
            vertex_bindings: vertex_input.bindings().to_vec(),
            vertex_attributes: vertex_input.attributes().to_vec(),
            topology: self.topology,
            primitive_restart: self.primitive_restart,
            patch_control_points: tessellation.then_some(self.patch_control_points),
            tessellation_domain_origin: tessellation.then_some(self.tessellation_domain_origin),
            viewport_count,
            viewports,
            scissor_count,
            scissors,
            depth_clamp: self.depth_clamp,
            rasterizer_discard: self.rasterizer_discard,
            polygon_mode: self.polygon_mode,
            cull_mode: self.cull_mode,
            front_face: self.front_face,
            depth_bias: self.depth_bias(),
            line_width: self.line_width,
            rasterization_order: caps
                .supports_rasterization_order
                .then_some(self.rasterization_order),
            conservative_rasterization: (self.conservative_mode
                != vk::ConservativeRasterizationModeEXT::DISABLED)
                .then_some(ConservativeRasterizationDesc {
                    mode: self.conservative_mode,
                    extra_primitive_overestimation_size: self.extra_primitive_overestimation_size,
                }),
            rasterization_stream: caps
                .supports_transform_feedback
                .then_some(self.rasterization_stream),
            depth_clip_enable: caps.supports_depth_clip_enable.then_some(self.depth_clip),
            rasterization_samples: self.samples,
            sample_shading: self.sample_shading(),
            sample_mask,
            alpha_to_coverage: self.alpha_to_coverage,
            alpha_to_one: self.alpha_to_one,
            sample_locations: self.sample_locations().cloned(),
            depth_test: self.depth_test,
            depth_write: self.depth_write,
            depth_compare_op: self.depth_compare_op,
            depth_bounds_test: self.depth_bounds_test,
            min_depth_bounds: self.min_depth_bounds,
            max_depth_bounds: self.max_depth_bounds,
            stencil_test: self.stencil_test,
            stencil_front: self.stencil_front,
            stencil_back: self.stencil_back,
            logic_op: self.logic_op(),
            color_blend_attachments: (0..n_color)
                .map(|location| self.color_blend_attachment_properties(location))
                .collect(),
            blend_constants: self.blend_constants,
            dynamic_states: self.dynamic_states.clone(),
            layout,
            render_pass: render_pass.handle(),
            subpass: self.subpass,
            base,
        })
    }

    #[allow(clippy::type_complexity)]
    fn lower_viewports(
        &self,
        default_extent: Option<(u32, u32)>,
    ) -> CrucibleResult<(u32, Vec<ViewportDesc>, u32, Vec<ScissorDesc>)> {
        let dynamic_viewport = self.is_dynamic_state_enabled(vk::DynamicState::VIEWPORT);
        let dynamic_scissor = self.is_dynamic_state_enabled(vk::DynamicState::SCISSOR);

        let mut viewports = dense(&self.viewports, "viewport")?;
        let mut scissors = dense(&self.scissors, "scissor")?;

        if viewports.is_empty() && !dynamic_viewport {
            let Some((width, height)) = default_extent else {
                return Err(contract_violation(
                    "no viewport defined and no swapchain to derive a full-window one from",
                ));
            };
            viewports.push(ViewportDesc {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            });
        }

        if scissors.is_empty() && !dynamic_scissor {
            scissors = viewports
                .iter()
                .map(|v| ScissorDesc {
                    x: v.x as i32,
                    y: v.y as i32,
                    width: v.width as u32,
                    height: v.height as u32,
                })
                .collect();
            if scissors.is_empty() {
                if let Some((width, height)) = default_extent {
                    scissors.push(ScissorDesc {
                        x: 0,
                        y: 0,
                        width,
                        height,
                    });
                }
            }
        }

        let count = viewports.len().max(scissors.len()).max(1) as u32;
        ensure_contract!(
            (dynamic_viewport || viewports.len() as u32 == count)
                && (dynamic_scissor || scissors.len() as u32 == count),
            "{} viewport(s) but {} scissor box(es)",
            viewports.len(),
            scissors.len()
        );

        if dynamic_viewport {
            viewports.clear();
        }
        if dynamic_scissor {
            scissors.clear();
        }
        Ok((count, viewports, count, scissors))
    }
}

/// Indexed entries as a dense array; a gap is a contract violation
fn dense<T: Copy>(map: &BTreeMap<u32, T>, what: &str) -> CrucibleResult<Vec<T>> {
    for (expected, index) in map.keys().enumerate() {
        ensure_contract!(
            *index as usize == expected,
            "{} indices are not dense: index {} is unset",
            what,
            expected
        );
    }
    Ok(map.values().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    fn proxy() -> GraphicsPipelineCreateInfo {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        GraphicsPipelineCreateInfo::new_proxy(&device)
    }

    #[test]
    fn test_defaults() {
        let info = proxy();
        assert_eq!(info.cull_mode(), vk::CullModeFlags::BACK);
        assert_eq!(info.front_face(), vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(info.polygon_mode(), vk::PolygonMode::FILL);
        approx::assert_relative_eq!(info.line_width(), 1.0);
        assert_eq!(info.depth_test(), None);
        assert!(!info.depth_writes());
        assert_eq!(info.depth_compare_op, vk::CompareOp::ALWAYS);
        assert_eq!(info.depth_bounds(), (0.0, 1.0));
        assert!(info.depth_bias().is_none());
        assert_eq!(info.stencil_op_state(StencilFace::Back), DEFAULT_STENCIL_OP);
        assert_eq!(info.blend_constants(), [0.0; 4]);
        assert_eq!(info.color_blend_attachment_properties(3), DEFAULT_BLEND_ATTACHMENT);
        assert_eq!(info.samples(), vk::SampleCountFlags::TYPE_1);
        approx::assert_relative_eq!(info.min_sample_shading, 1.0);
        assert_eq!(info.sample_mask, u64::MAX);
        assert!(info.sample_shading().is_none());
        assert_eq!(info.primitive_topology(), vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(info.patch_control_points(), 1);
        assert_eq!(info.logic_op, vk::LogicOp::NO_OP);
        assert!(info.logic_op().is_none());
        assert!(info.dynamic_states().is_empty());
        assert_eq!(info.rasterization_order(), vk::RasterizationOrderAMD::STRICT);
        assert_eq!(
            info.conservative_rasterization(),
            (vk::ConservativeRasterizationModeEXT::DISABLED, 0.0)
        );
        assert_eq!(info.rasterization_stream(), 0);
        assert_eq!(
            info.tessellation_domain_origin(),
            vk::TessellationDomainOrigin::UPPER_LEFT
        );
        assert!(info.sample_locations().is_none());
        assert!(info.is_proxy());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_rejected_setter_leaves_state_untouched() {
        let mut info = proxy();
        assert!(info
            .set_rasterization_properties(
                vk::PolygonMode::LINE,
                vk::CullModeFlags::NONE,
                vk::FrontFace::CLOCKWISE,
                0.0,
            )
            .is_err());
        assert_eq!(info.polygon_mode(), vk::PolygonMode::FILL);
        assert_eq!(info.cull_mode(), vk::CullModeFlags::BACK);

        assert!(info.set_depth_bounds_test(true, 0.8, 0.2).is_err());
        assert_eq!(info.depth_bounds(), (0.0, 1.0));
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_duplicate_vertex_location_rejected() {
        let mut info = proxy();
        let add = |info: &mut GraphicsPipelineCreateInfo, location| {
            info.add_vertex_attribute(
                location,
                vk::Format::R32G32B32_SFLOAT,
                0,
                12,
                vk::VertexInputRate::VERTEX,
                None,
                1,
            )
        };
        add(&mut info, 0).unwrap();
        assert!(add(&mut info, 0).unwrap_err().is_contract_violation());
        assert_eq!(info.vertex_attributes().len(), 1);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_explicit_binding_must_agree() {
        let mut info = proxy();
        info.add_vertex_attribute(0, vk::Format::R32_SFLOAT, 0, 16, vk::VertexInputRate::VERTEX, Some(3), 1)
            .unwrap();
        assert!(info
            .add_vertex_attribute(1, vk::Format::R32_SFLOAT, 4, 32, vk::VertexInputRate::VERTEX, Some(3), 1)
            .is_err());
        info.add_vertex_attribute(1, vk::Format::R32_SFLOAT, 4, 16, vk::VertexInputRate::VERTEX, Some(3), 1)
            .unwrap();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_sample_locations_need_matching_count() {
        let mut info = proxy();
        let four = [[0.25, 0.25], [0.75, 0.25], [0.25, 0.75], [0.75, 0.75]];
        assert!(info
            .set_sample_locations(true, vk::SampleCountFlags::TYPE_4, (1, 1), &four[..3])
            .is_err());
        info.set_sample_locations(true, vk::SampleCountFlags::TYPE_4, (1, 1), &four)
            .unwrap();
        assert_eq!(info.sample_locations().unwrap().locations.len(), 4);
    }

    #[test]
    fn test_copy_gfx_state_is_idempotent() {
        let mut reference = proxy();
        reference.set_depth_test(true, vk::CompareOp::LESS);
        reference.set_depth_writes(true);
        reference.set_blend_constants([0.1, 0.2, 0.3, 0.4]);
        reference.toggle_dynamic_state(true, vk::DynamicState::VIEWPORT);
        reference
            .add_vertex_attribute(0, vk::Format::R32G32_SFLOAT, 0, 8, vk::VertexInputRate::VERTEX, None, 1)
            .unwrap();

        let mut target = GraphicsPipelineCreateInfo::new_proxy(reference.device());
        target.copy_gfx_state_from(&reference);
        let once = target.clone();
        target.copy_gfx_state_from(&reference);

        assert_eq!(target, once);
        assert_eq!(target, reference);
        assert_eq!(target.depth_test(), Some(vk::CompareOp::LESS));
    }

    #[test]
    fn test_dynamic_state_toggle_is_a_set() {
        let mut info = proxy();
        info.toggle_dynamic_state(true, vk::DynamicState::SCISSOR);
        info.toggle_dynamic_state(true, vk::DynamicState::SCISSOR);
        assert_eq!(info.dynamic_states(), &[vk::DynamicState::SCISSOR]);
        info.toggle_dynamic_state(false, vk::DynamicState::SCISSOR);
        assert!(info.dynamic_states().is_empty());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_sparse_viewports_fail_to_lower() {
        let viewport = ViewportDesc {
            width: 64.0,
            height: 64.0,
            max_depth: 1.0,
            ..ViewportDesc::default()
        };
        let mut info = proxy();
        info.set_viewport(0, viewport).unwrap();
        info.set_viewport(2, viewport).unwrap();
        assert!(info.lower_viewports(None).unwrap_err().is_contract_violation());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_missing_viewport_synthesized_from_extent() {
        let info = proxy();
        let (count, viewports, scissor_count, scissors) = info.lower_viewports(Some((640, 480))).unwrap();
        assert_eq!((count, scissor_count), (1, 1));
        approx::assert_relative_eq!(viewports[0].width, 640.0);
        assert_eq!(scissors[0].height, 480);
        assert!(info.lower_viewports(None).is_err());
    }
}
