//! # Crucible
//!
//! Lifetime-, thread- and state-safe wrappers over the Vulkan objects a
//! renderer touches every frame.
//!
//! ## Features
//!
//! - **Render passes**: builder with automatic preserve-attachment inference
//! - **Graphics pipelines**: clonable create-infos baked in batches by a manager
//! - **Command buffers**: recorders that reject commands illegal in the current state
//! - **Framebuffers**: lazily baked per render pass and cached
//! - **Swapchains**: acquire/present bookkeeping, with an offscreen mode that
//!   writes presented frames to PNG files
//! - **Headless driver**: the whole framework runs without a GPU for tests and CI
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crucible::prelude::*;
//!
//! fn main() -> Result<(), CrucibleError> {
//!     let device = Device::create_headless(FrameworkConfig::default())?;
//!     let window = Window::create_dummy("offscreen", 640, 480);
//!     let swapchain = Swapchain::create(&device, &window, SwapchainCreateInfo::default(), MtSafety::Disabled)?;
//!
//!     let index = swapchain.acquire_image(None, true)?;
//!     device.universal_queue(0).expect("queue").present(&swapchain, index, &[])?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;

pub mod events;
pub mod native;
pub mod registry;

pub mod command;
pub mod device;
pub mod framebuffer;
pub mod pipeline;
pub mod queue;
pub mod render_pass;
pub mod resources;
pub mod swapchain;
pub mod window;

#[cfg(test)]
mod tests;

pub use crate::core::{CrucibleError, CrucibleResult, FrameworkConfig, MtSafety};

/// Common imports for framework users
pub mod prelude {
    pub use crate::{
        command::{
            ClearColor, ClearValue, CommandBuffer, CommandBufferKind, CommandPool, ImageBarrier, Inheritance,
            PipelineBarrier,
        },
        config::Config,
        core::{CrucibleError, CrucibleResult, FrameworkConfig, MtSafety},
        device::Device,
        events::{CallbackArg, CallbackId},
        framebuffer::Framebuffer,
        native::{HeadlessDevice, NativeDevice, ScissorDesc, ViewportDesc},
        pipeline::{GraphicsPipelineCreateInfo, GraphicsPipelineManager, PipelineCache},
        queue::{Queue, SubmitInfo},
        render_pass::{RenderPass, RenderPassCreateInfo},
        resources::{Fence, Image, ImageView, PipelineLayout, Semaphore, ShaderEntryPoint, ShaderModule, ShaderStage},
        swapchain::{Swapchain, SwapchainCreateInfo},
        window::{KeyId, Window, WindowCapabilities, WindowPlatform},
    };
    pub use ash::vk;
}
