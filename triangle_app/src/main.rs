//! Headless triangle demo
//!
//! Renders a fullscreen triangle pass on the headless driver for a number of
//! frames and writes every presented frame to a PNG file.
//!
//! Usage: `headless_triangle [config.toml] [frames]`

use crucible::config::ConfigError;
use crucible::foundation::logging;
use crucible::prelude::*;
use std::sync::Arc;

/// Header-only SPIR-V; the headless driver never executes shaders
const FULLSCREEN_TRIANGLE_SPIRV: [u32; 5] = [0x0723_0203, 0x0001_0000, 0, 1, 0];

const DEFAULT_FRAMES: u32 = 3;

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error(transparent)]
    Framework(#[from] CrucibleError),

    #[error("cannot load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid frame count {0:?}")]
    FrameCount(String),
}

struct Frame {
    command_buffer: Arc<CommandBuffer>,
    framebuffer: Arc<Framebuffer>,
}

struct TriangleApp {
    device: Arc<Device>,
    window: Arc<Window>,
    swapchain: Arc<Swapchain>,
    render_pass: Arc<RenderPass>,
    pipelines: Arc<GraphicsPipelineManager>,
    pipeline: vk::Pipeline,
    pool: Arc<CommandPool>,
    image_ready: Arc<Semaphore>,
    render_done: Arc<Semaphore>,
    frames: Vec<Option<Frame>>,
}

impl TriangleApp {
    fn new(config: FrameworkConfig) -> Result<Self, AppError> {
        log::info!("Creating headless device...");
        let device = Device::create_headless(config.clone())?;

        let window = Window::create_with_png_snapshots_from_config(&config.application_name, 320, 240, &config)?;
        let swapchain = Swapchain::create(&device, &window, SwapchainCreateInfo::default(), MtSafety::InheritFromParent)?;
        log::info!(
            "Snapshots go to {}/{}NNNNNN.png",
            config.snapshot_directory.display(),
            config.snapshot_prefix
        );

        let render_pass = Self::create_render_pass(&device, &swapchain)?;
        let pipelines = GraphicsPipelineManager::create(&device, None, MtSafety::InheritFromParent)?;
        let pipeline = Self::create_pipeline(&device, &render_pass, &pipelines)?;

        let pool = CommandPool::create(
            &device,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            MtSafety::InheritFromParent,
        )?;
        let n_images = swapchain.n_images() as usize;

        Ok(Self {
            image_ready: Semaphore::create(&device)?,
            render_done: Semaphore::create(&device)?,
            device,
            window,
            swapchain,
            render_pass,
            pipelines,
            pipeline,
            pool,
            frames: (0..n_images).map(|_| None).collect(),
        })
    }

    fn create_render_pass(device: &Arc<Device>, swapchain: &Arc<Swapchain>) -> CrucibleResult<Arc<RenderPass>> {
        let mut info = RenderPassCreateInfo::new(device);
        let color = info.add_color_attachment(
            swapchain.format(),
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
            false,
        );
        let subpass = info.add_subpass();
        info.add_subpass_color_attachment(subpass, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color, 0, None)?;
        info.add_external_to_subpass_dependency(
            subpass,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::DependencyFlags::empty(),
        )?;
        RenderPass::create(&info, Some(swapchain))
    }

    fn create_pipeline(
        device: &Arc<Device>,
        render_pass: &Arc<RenderPass>,
        pipelines: &GraphicsPipelineManager,
    ) -> CrucibleResult<vk::Pipeline> {
        let module = ShaderModule::create(device, &FULLSCREEN_TRIANGLE_SPIRV)?;
        let mut info = GraphicsPipelineCreateInfo::new(render_pass, 0)?;
        info.set_shader_stage(ShaderStage::Vertex, Some(ShaderEntryPoint::new(&module, "main")))?;
        info.set_shader_stage(ShaderStage::Fragment, Some(ShaderEntryPoint::new(&module, "main")))?;

        // Viewport follows the swapchain
        let id = pipelines.add_pipeline(&info)?;
        pipelines.bake()?;
        pipelines.get_pipeline(id)
    }

    fn render_frame(&mut self, frame_index: u32) -> CrucibleResult<()> {
        let image_index = self.swapchain.acquire_image(Some(&self.image_ready), true)?;
        let slot = image_index as usize;

        if self.frames[slot].is_none() {
            let view = self.swapchain.image_view(image_index).cloned().ok_or_else(|| {
                CrucibleError::ResourceNotFound {
                    what: format!("swapchain image view {image_index}"),
                }
            })?;
            let (width, height) = self.swapchain.extent();
            self.frames[slot] = Some(Frame {
                command_buffer: self.pool.alloc_primary(MtSafety::InheritFromParent)?,
                framebuffer: Framebuffer::create(&self.device, vec![view], width, height, 1, MtSafety::InheritFromParent)?,
            });
        }
        let Some(frame) = self.frames[slot].as_ref() else {
            return Ok(());
        };

        // Cycle the background so consecutive snapshots differ
        let shade = (frame_index % 4) as f32 / 4.0;
        let clear = ClearValue::Color(ClearColor::Float32([0.1, shade, 0.3, 1.0]));
        let (width, height) = self.swapchain.extent();

        let cb = &frame.command_buffer;
        if cb.is_executable() {
            cb.reset(false)?;
        }
        cb.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cb.begin_debug_label("triangle", [1.0, 0.5, 0.0, 1.0])?;
        cb.begin_render_pass(
            &self.render_pass,
            &frame.framebuffer,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            },
            &[clear],
            vk::SubpassContents::INLINE,
            None,
        )?;
        cb.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, self.pipeline)?;
        cb.draw(3, 1, 0, 0)?;
        cb.end_render_pass()?;
        cb.end_debug_label()?;
        cb.end_recording()?;

        let queue = self.device.universal_queue(0).ok_or_else(|| CrucibleError::ResourceNotFound {
            what: "universal queue 0".to_string(),
        })?;
        queue.submit(
            SubmitInfo::new()
                .command_buffer(cb)
                .wait(&self.image_ready, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .signal(&self.render_done),
        )?;
        queue.present(&self.swapchain, image_index, std::slice::from_ref(&self.render_done))?;
        queue.wait_idle()?;

        log::debug!("Frame {} presented from image {}", frame_index, image_index);
        Ok(())
    }

    fn run(&mut self, n_frames: u32) -> CrucibleResult<()> {
        log::info!("Rendering {} frame(s)...", n_frames);
        for frame_index in 0..n_frames {
            self.render_frame(frame_index)?;
        }
        log::info!("Presented {} frame(s)", self.window.n_presented_frames());
        Ok(())
    }

    fn shutdown(self) -> CrucibleResult<()> {
        log::info!("Shutting down...");
        self.device.wait_idle()?;
        self.swapchain.try_teardown()?;
        log::debug!(
            "Releasing {} pipeline(s) and {} command buffer(s)",
            self.pipelines.n_pipelines(),
            self.pool.n_live_command_buffers()
        );
        self.window.close();
        Ok(())
    }
}

fn parse_args() -> Result<(FrameworkConfig, u32), AppError> {
    let mut config = FrameworkConfig::new("Headless Triangle");
    let mut n_frames = DEFAULT_FRAMES;

    for arg in std::env::args().skip(1) {
        if arg.ends_with(".toml") || arg.ends_with(".ron") {
            config = FrameworkConfig::load_validated(&arg)?;
        } else {
            n_frames = arg.parse().map_err(|_| AppError::FrameCount(arg.clone()))?;
        }
    }
    Ok((config, n_frames))
}

fn main() {
    let (config, n_frames) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };
    logging::init_with_filter(&config.log_level);

    let result = TriangleApp::new(config).and_then(|mut app| {
        app.run(n_frames)?;
        app.shutdown()?;
        Ok(())
    });

    if let Err(e) = result {
        log::error!("Triangle demo failed: {}", e);
        std::process::exit(1);
    }
    log::info!("Done");
}
