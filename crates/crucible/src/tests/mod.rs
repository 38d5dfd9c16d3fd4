//! End-to-end scenarios against the headless driver
//!
//! Module-level unit tests live next to the code they exercise; the files
//! here drive several wrappers together the way a renderer would.

mod command_recording;
mod frames;
mod pipelines;
mod render_passes;

use ash::vk;
use std::sync::Arc;

use crate::command::CommandPool;
use crate::core::config::FrameworkConfig;
use crate::core::mt::MtSafety;
use crate::device::Device;
use crate::framebuffer::Framebuffer;
use crate::native::{DeviceCapabilities, HeadlessDevice, ImageDesc, NativeCall, ViewportDesc};
use crate::pipeline::GraphicsPipelineCreateInfo;
use crate::render_pass::{RenderPass, RenderPassCreateInfo};
use crate::resources::{Image, ImageView, ShaderEntryPoint, ShaderModule, ShaderStage};

/// Smallest word stream the headless driver accepts as SPIR-V
pub(crate) const SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

/// A headless device plus the driver behind it
pub(crate) struct Harness {
    pub headless: Arc<HeadlessDevice>,
    pub device: Arc<Device>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(FrameworkConfig::default())
    }

    pub fn with_config(config: FrameworkConfig) -> Self {
        Self::build(HeadlessDevice::new(), config)
    }

    /// Device group of `n_gpus` linked GPUs
    pub fn multi_gpu(n_gpus: u32) -> Self {
        let capabilities = DeviceCapabilities {
            physical_device_count: n_gpus,
            ..HeadlessDevice::default_capabilities()
        };
        Self::build(HeadlessDevice::with_capabilities(capabilities), FrameworkConfig::default())
    }

    fn build(headless: HeadlessDevice, config: FrameworkConfig) -> Self {
        crate::foundation::logging::init_for_tests();
        let headless = Arc::new(headless);
        let device = Device::create(headless.clone(), config).unwrap();
        Self { headless, device }
    }

    pub fn assert_valid(&self) {
        let errors = self.headless.validation_errors();
        assert!(errors.is_empty(), "validation errors: {errors:#?}");
    }

    pub fn count_calls(&self, filter: impl Fn(&NativeCall) -> bool) -> usize {
        self.headless.calls().iter().filter(|call| filter(call)).count()
    }

    pub fn entry_point(&self) -> ShaderEntryPoint {
        let module = ShaderModule::create(&self.device, &SPIRV).unwrap();
        ShaderEntryPoint::new(&module, "main")
    }

    /// Single RGBA8 color attachment cleared on load, one subpass
    pub fn color_pass(&self, final_layout: vk::ImageLayout) -> Arc<RenderPass> {
        let mut info = RenderPassCreateInfo::new(&self.device);
        let color = info.add_color_attachment(
            vk::Format::R8G8B8A8_UNORM,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            final_layout,
            false,
        );
        let subpass = info.add_subpass();
        info.add_subpass_color_attachment(subpass, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color, 0, None)
            .unwrap();
        RenderPass::create(&info, None).unwrap()
    }

    /// Create-info with vertex and fragment stages and a static viewport
    pub fn pipeline_info(&self, render_pass: &Arc<RenderPass>, subpass: u32) -> GraphicsPipelineCreateInfo {
        let mut info = GraphicsPipelineCreateInfo::new(render_pass, subpass).unwrap();
        info.set_shader_stage(ShaderStage::Vertex, Some(self.entry_point()))
            .unwrap();
        info.set_shader_stage(ShaderStage::Fragment, Some(self.entry_point()))
            .unwrap();
        info.set_viewport(
            0,
            ViewportDesc {
                width: 64.0,
                height: 64.0,
                max_depth: 1.0,
                ..ViewportDesc::default()
            },
        )
        .unwrap();
        info
    }

    pub fn color_image(&self, width: u32, height: u32) -> Arc<Image> {
        Image::create(
            &self.device,
            ImageDesc::new_2d(
                vk::Format::R8G8B8A8_UNORM,
                width,
                height,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            ),
        )
        .unwrap()
    }

    pub fn framebuffer(&self, views: Vec<Arc<ImageView>>, width: u32, height: u32) -> Arc<Framebuffer> {
        Framebuffer::create(&self.device, views, width, height, 1, MtSafety::InheritFromParent).unwrap()
    }

    pub fn pool(&self, flags: vk::CommandPoolCreateFlags) -> Arc<CommandPool> {
        CommandPool::create(&self.device, flags, MtSafety::InheritFromParent).unwrap()
    }
}

/// Full-extent render area
pub(crate) fn full_area(width: u32, height: u32) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    }
}
