//! Native graphics API boundary
//!
//! [`NativeDevice`] is the typed entry-point table every wrapper calls
//! through. It is resolved once, when the [`Device`](crate::device::Device)
//! is created:
//! - [`AshDevice`] drives a real Vulkan implementation through `ash`
//! - [`HeadlessDevice`] is a software driver used for tests, CI and
//!   offscreen tooling
//!
//! Descriptors are owned values (see [`desc`]), so a bake can be inspected
//! and compared without dereferencing driver pointer chains.

mod ash_device;
pub mod desc;
mod headless;

pub use ash_device::AshDevice;
pub use desc::*;
pub use headless::{HeadlessDevice, NativeCall};

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::command::Command;

/// OS window a surface is created for
#[derive(Debug, Clone, Copy)]
pub struct SurfaceTarget {
    /// Display connection
    pub display: RawDisplayHandle,
    /// Window
    pub window: RawWindowHandle,
}

// SAFETY: raw handles are plain identifiers; the window owner guarantees they
// stay valid while a surface exists.
unsafe impl Send for SurfaceTarget {}
unsafe impl Sync for SurfaceTarget {}

/// Entry points of one logical device
///
/// Every `create_*` has a matching `destroy_*`; destroying a null handle is a
/// no-op. Errors are driver result codes returned unchanged.
pub trait NativeDevice: Send + Sync {
    /// What the device supports
    fn capabilities(&self) -> &DeviceCapabilities;

    // Render passes and pipelines

    /// Create a render pass
    fn create_render_pass(&self, desc: &RenderPassDesc) -> NativeResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a shader module from SPIR-V words
    fn create_shader_module(&self, spirv: &[u32]) -> NativeResult<vk::ShaderModule>;
    /// Destroy a shader module
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    /// Create a pipeline layout
    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> NativeResult<vk::PipelineLayout>;
    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    /// Create a batch of graphics pipelines in one driver call
    ///
    /// On failure the per-item handles are returned so the caller can roll
    /// back the ones that did get created.
    fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        descs: &[GraphicsPipelineDesc],
    ) -> Result<Vec<vk::Pipeline>, BatchFailure>;
    /// Destroy a pipeline
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    /// Create a pipeline cache seeded with `initial_data`
    fn create_pipeline_cache(&self, initial_data: &[u8]) -> NativeResult<vk::PipelineCache>;
    /// Serialized cache contents
    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> NativeResult<Vec<u8>>;
    /// Merge `sources` into `destination`
    fn merge_pipeline_caches(
        &self,
        destination: vk::PipelineCache,
        sources: &[vk::PipelineCache],
    ) -> NativeResult<()>;
    /// Destroy a pipeline cache
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);

    // Resources

    /// Create a framebuffer
    fn create_framebuffer(&self, desc: &FramebufferDesc) -> NativeResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    /// Create an image with dedicated memory
    fn create_image(&self, desc: &ImageDesc) -> NativeResult<vk::Image>;
    /// Destroy an image and its memory
    fn destroy_image(&self, image: vk::Image);
    /// Create an image view
    fn create_image_view(&self, desc: &ImageViewDesc) -> NativeResult<vk::ImageView>;
    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a buffer with dedicated memory
    fn create_buffer(&self, desc: &BufferDesc) -> NativeResult<vk::Buffer>;
    /// Destroy a buffer and its memory
    fn destroy_buffer(&self, buffer: vk::Buffer);

    // Synchronization and queries

    /// Create a binary semaphore
    fn create_semaphore(&self) -> NativeResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create a fence
    fn create_fence(&self, signaled: bool) -> NativeResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Wait for fences
    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> NativeResult<()>;
    /// Reset fences to unsignaled
    fn reset_fences(&self, fences: &[vk::Fence]) -> NativeResult<()>;
    /// Whether a fence is signaled
    fn fence_status(&self, fence: vk::Fence) -> NativeResult<bool>;
    /// Create an event
    fn create_event(&self) -> NativeResult<vk::Event>;
    /// Destroy an event
    fn destroy_event(&self, event: vk::Event);
    /// Create a query pool
    fn create_query_pool(&self, desc: &QueryPoolDesc) -> NativeResult<vk::QueryPool>;
    /// Destroy a query pool
    fn destroy_query_pool(&self, pool: vk::QueryPool);

    // Command buffers

    /// Create a command pool
    fn create_command_pool(
        &self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> NativeResult<vk::CommandPool>;
    /// Reset every command buffer of a pool
    fn reset_command_pool(&self, pool: vk::CommandPool, release_resources: bool) -> NativeResult<()>;
    /// Destroy a command pool
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate one command buffer
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> NativeResult<vk::CommandBuffer>;
    /// Return a command buffer to its pool
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    /// Start recording
    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        desc: &CommandBufferBeginDesc,
    ) -> NativeResult<()>;
    /// Finish recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> NativeResult<()>;
    /// Reset a command buffer
    fn reset_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        release_resources: bool,
    ) -> NativeResult<()>;
    /// Record one command
    fn record_command(&self, command_buffer: vk::CommandBuffer, command: &Command);

    // Queues

    /// Retrieve a queue created with the device
    fn get_queue(&self, family: u32, index: u32) -> vk::Queue;
    /// Submit work
    fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitDesc], fence: vk::Fence) -> NativeResult<()>;
    /// Wait until a queue is idle
    fn queue_wait_idle(&self, queue: vk::Queue) -> NativeResult<()>;
    /// Present swapchain images; `Ok(true)` means suboptimal
    fn queue_present(&self, queue: vk::Queue, desc: &PresentDesc) -> NativeResult<bool>;
    /// Wait until the whole device is idle
    fn device_wait_idle(&self) -> NativeResult<()>;

    // Presentation

    /// Create a surface for an OS window
    fn create_surface(&self, target: &SurfaceTarget) -> NativeResult<vk::SurfaceKHR>;
    /// Destroy a surface
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
    /// What a surface supports
    fn surface_properties(&self, surface: vk::SurfaceKHR) -> NativeResult<SurfaceProperties>;
    /// Create a swapchain
    fn create_swapchain(&self, desc: &SwapchainDesc) -> NativeResult<vk::SwapchainKHR>;
    /// Destroy a swapchain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Images owned by a swapchain
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> NativeResult<Vec<vk::Image>>;
    /// Acquire the next image; returns `(index, suboptimal)`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> NativeResult<(u32, bool)>;

    // Debugging

    /// Attach a debug name to a handle
    fn set_object_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) -> NativeResult<()>;
    /// Attach a debug tag to a handle
    fn set_object_tag(
        &self,
        object_type: vk::ObjectType,
        raw_handle: u64,
        tag_name: u64,
        data: &[u8],
    ) -> NativeResult<()>;
    /// Read a 2D image back as tightly packed RGBA8
    fn read_back_image(&self, desc: &ReadbackDesc) -> NativeResult<Vec<u8>>;
}
