//! Graphics pipelines
//!
//! - [`GraphicsPipelineCreateInfo`]: mutable, clonable pipeline state
//! - [`GraphicsPipelineManager`]: batched baking by stable ID
//! - [`PipelineCache`]: driver cache threaded through bakes
//! - [`VertexInputLayout`]: vertex binding assignment

mod cache;
mod create_info;
mod manager;
mod vertex_input;

pub use cache::PipelineCache;
pub use create_info::{
    BasePipeline, GraphicsPipelineCreateInfo, StencilFace, DEFAULT_BLEND_ATTACHMENT, DEFAULT_STENCIL_OP,
};
pub use manager::GraphicsPipelineManager;
pub use vertex_input::{VertexAttribute, VertexInputLayout};
