//! Thin RAII wrappers over native objects
//!
//! Each wrapper owns one native handle (unless created in non-owning mode),
//! carries a [`DebugLabel`](crate::registry::DebugLabel) and registers itself
//! with the object registry for its whole lifetime.

mod buffer;
mod image;
mod layout;
mod query;
mod shader;
mod sync;

pub use buffer::Buffer;
pub use image::{Image, ImageView};
pub use layout::{DescriptorSet, PipelineLayout};
pub use query::QueryPool;
pub use shader::{ShaderEntryPoint, ShaderModule, ShaderStage, SpecializationConstant};
pub use sync::{Event, Fence, Semaphore};

/// Implement [`DebugNamed`](crate::registry::DebugNamed) for a wrapper with
/// `label` and `device` fields
macro_rules! impl_debug_named {
    ($ty:ty) => {
        impl $crate::registry::DebugNamed for $ty {
            fn debug_label(&self) -> &$crate::registry::DebugLabel {
                &self.label
            }

            fn parent_device(&self) -> &std::sync::Arc<$crate::device::Device> {
                &self.device
            }
        }
    };
}

pub(crate) use impl_debug_named;

/// Raw value of a non-dispatchable handle
pub(crate) fn raw<H: ash::vk::Handle>(handle: H) -> u64 {
    handle.as_raw()
}
