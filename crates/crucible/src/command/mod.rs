//! Command recording
//!
//! - [`CommandPool`]: native pool, parent of every command buffer
//! - [`CommandBuffer`]: recorder with the render pass state machine
//! - [`Command`]: captured command records, also used at the native boundary
//! - [`PipelineBarrier`]: barrier arguments shared with bus listeners

mod barrier;
mod buffer;
mod commands;
mod pool;

pub use barrier::{BufferBarrier, ImageBarrier, MemoryBarrier, PipelineBarrier};
pub use buffer::{CommandBuffer, CommandBufferKind, Inheritance};
pub use commands::{ClearAttachment, ClearColor, ClearValue, Command, Legality};
pub use pool::CommandPool;
