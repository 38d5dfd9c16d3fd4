//! Pipeline barrier arguments
//!
//! Barriers hold the wrappers they name, so a captured barrier (and the
//! copy handed to `PipelineBarrierRecorded` listeners) keeps them alive.

use ash::vk;
use std::sync::Arc;

use crate::resources::{Buffer, Image};

/// Global memory barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    /// Source access
    pub src_access: vk::AccessFlags,
    /// Destination access
    pub dst_access: vk::AccessFlags,
}

/// Buffer range barrier
#[derive(Debug, Clone)]
pub struct BufferBarrier {
    /// Source access
    pub src_access: vk::AccessFlags,
    /// Destination access
    pub dst_access: vk::AccessFlags,
    /// Source queue family for ownership transfers
    pub src_queue_family: u32,
    /// Destination queue family for ownership transfers
    pub dst_queue_family: u32,
    /// Buffer
    pub buffer: Arc<Buffer>,
    /// Range offset
    pub offset: u64,
    /// Range size
    pub size: u64,
}

impl BufferBarrier {
    /// Whole-buffer barrier with no ownership transfer
    pub fn whole(buffer: &Arc<Buffer>, src_access: vk::AccessFlags, dst_access: vk::AccessFlags) -> Self {
        Self {
            src_access,
            dst_access,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            buffer: Arc::clone(buffer),
            offset: 0,
            size: vk::WHOLE_SIZE,
        }
    }

    pub(crate) fn to_vk(&self) -> vk::BufferMemoryBarrier {
        vk::BufferMemoryBarrier::builder()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .buffer(self.buffer.handle())
            .offset(self.offset)
            .size(self.size)
            .build()
    }
}

/// Image layout transition and/or access barrier
#[derive(Debug, Clone)]
pub struct ImageBarrier {
    /// Source access
    pub src_access: vk::AccessFlags,
    /// Destination access
    pub dst_access: vk::AccessFlags,
    /// Layout before
    pub old_layout: vk::ImageLayout,
    /// Layout after
    pub new_layout: vk::ImageLayout,
    /// Source queue family for ownership transfers
    pub src_queue_family: u32,
    /// Destination queue family for ownership transfers
    pub dst_queue_family: u32,
    /// Image
    pub image: Arc<Image>,
    /// Affected subresources
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageBarrier {
    /// Layout transition of every mip and layer, no ownership transfer
    pub fn transition(
        image: &Arc<Image>,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
    ) -> Self {
        Self {
            src_access,
            dst_access,
            old_layout,
            new_layout,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            image: Arc::clone(image),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: image.full_aspect_mask(),
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
        }
    }

    pub(crate) fn to_vk(&self) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .image(self.image.handle())
            .subresource_range(self.subresource_range)
            .build()
    }
}

/// Arguments of `vkCmdPipelineBarrier` / `vkCmdWaitEvents`
#[derive(Debug, Clone)]
pub struct PipelineBarrier {
    /// Source stages
    pub src_stage_mask: vk::PipelineStageFlags,
    /// Destination stages
    pub dst_stage_mask: vk::PipelineStageFlags,
    /// Dependency flags (ignored by wait-events)
    pub dependency_flags: vk::DependencyFlags,
    /// Global memory barriers
    pub memory_barriers: Vec<MemoryBarrier>,
    /// Buffer barriers
    pub buffer_barriers: Vec<BufferBarrier>,
    /// Image barriers
    pub image_barriers: Vec<ImageBarrier>,
}

impl PipelineBarrier {
    /// Execution-only barrier between two stage sets
    pub fn new(src_stage_mask: vk::PipelineStageFlags, dst_stage_mask: vk::PipelineStageFlags) -> Self {
        Self {
            src_stage_mask,
            dst_stage_mask,
            dependency_flags: vk::DependencyFlags::empty(),
            memory_barriers: Vec::new(),
            buffer_barriers: Vec::new(),
            image_barriers: Vec::new(),
        }
    }

    /// Add a global memory barrier
    pub fn with_memory_barrier(mut self, barrier: MemoryBarrier) -> Self {
        self.memory_barriers.push(barrier);
        self
    }

    /// Add a buffer barrier
    pub fn with_buffer_barrier(mut self, barrier: BufferBarrier) -> Self {
        self.buffer_barriers.push(barrier);
        self
    }

    /// Add an image barrier
    pub fn with_image_barrier(mut self, barrier: ImageBarrier) -> Self {
        self.image_barriers.push(barrier);
        self
    }

    /// Set dependency flags
    pub fn with_dependency_flags(mut self, flags: vk::DependencyFlags) -> Self {
        self.dependency_flags = flags;
        self
    }

    pub(crate) fn vk_memory_barriers(&self) -> Vec<vk::MemoryBarrier> {
        self.memory_barriers
            .iter()
            .map(|b| {
                vk::MemoryBarrier::builder()
                    .src_access_mask(b.src_access)
                    .dst_access_mask(b.dst_access)
                    .build()
            })
            .collect()
    }

    pub(crate) fn vk_buffer_barriers(&self) -> Vec<vk::BufferMemoryBarrier> {
        self.buffer_barriers.iter().map(BufferBarrier::to_vk).collect()
    }

    pub(crate) fn vk_image_barriers(&self) -> Vec<vk::ImageMemoryBarrier> {
        self.image_barriers.iter().map(ImageBarrier::to_vk).collect()
    }
}
