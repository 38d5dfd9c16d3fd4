//! Images and image views
//!
//! Images remember the layout they were last known to be in. The command
//! recorder updates it when it records a layout transition (barrier or
//! render pass end), so host code can check a layout without a GPU
//! round-trip.

use ash::vk;
use std::sync::{Arc, Mutex};

use crate::core::error::{api_error, CrucibleResult};
use crate::core::mt::lock_state;
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::{ImageDesc, ImageViewDesc};
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

impl ImageDesc {
    /// Single-sampled 2D image with one mip and one layer
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            flags: vk::ImageCreateFlags::empty(),
            image_type: vk::ImageType::TYPE_2D,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
            initial_layout: vk::ImageLayout::UNDEFINED,
            host_visible: false,
        }
    }
}

/// Image wrapper
pub struct Image {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::Image,
    desc: ImageDesc,
    owned: bool,
    layout: Mutex<vk::ImageLayout>,
    label: DebugLabel,
    _registration: Registration,
}

impl Image {
    /// Create an image with dedicated memory
    pub fn create(device: &Arc<Device>, desc: ImageDesc) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_image(&desc)
            .map_err(|e| api_error("create_image", e))?;

        log::trace!(
            "Image created: {}x{} {:?}",
            desc.width,
            desc.height,
            desc.format
        );
        Ok(Self::build(device, handle, desc, true))
    }

    /// Wrap an image owned by someone else, e.g. a swapchain
    pub fn wrap(device: &Arc<Device>, handle: vk::Image, desc: ImageDesc) -> Arc<Self> {
        Self::build(device, handle, desc, false)
    }

    fn build(device: &Arc<Device>, handle: vk::Image, desc: ImageDesc, owned: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                desc,
                owned,
                layout: Mutex::new(desc.initial_layout),
                label: DebugLabel::for_handle(vk::ObjectType::IMAGE, raw(handle)),
                _registration: Registration::new(ObjectKind::Image, id, weak.clone()),
            }
        })
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    /// Create parameters
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Format
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    /// Width and height
    pub fn extent(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    /// Whether the wrapper destroys the native image
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Layout the image was last transitioned to by recorded work
    pub fn current_layout(&self) -> vk::ImageLayout {
        *lock_state(&self.layout)
    }

    pub(crate) fn set_current_layout(&self, layout: vk::ImageLayout) {
        *lock_state(&self.layout) = layout;
    }

    /// Aspect mask covering the whole format
    pub fn full_aspect_mask(&self) -> vk::ImageAspectFlags {
        aspect_mask_for_format(self.desc.format)
    }
}

impl_debug_named!(Image);

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("format", &self.desc.format)
            .field("owned", &self.owned)
            .finish()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if self.owned {
            self.device.native().destroy_image(self.handle);
        }
    }
}

/// Aspects implied by a format
pub fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Image view wrapper; keeps its image alive
pub struct ImageView {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::ImageView,
    image: Arc<Image>,
    desc: ImageViewDesc,
    label: DebugLabel,
    _registration: Registration,
}

impl ImageView {
    /// View over mip 0 / layer 0 of a 2D image, covering all its aspects
    pub fn create_2d(image: &Arc<Image>) -> CrucibleResult<Arc<Self>> {
        let desc = ImageViewDesc {
            image: image.handle(),
            view_type: vk::ImageViewType::TYPE_2D,
            format: image.format(),
            aspect_mask: image.full_aspect_mask(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        Self::create(image, desc)
    }

    /// View with explicit parameters
    pub fn create(image: &Arc<Image>, desc: ImageViewDesc) -> CrucibleResult<Arc<Self>> {
        let device = Arc::clone(&image.device);
        let handle = device
            .native()
            .create_image_view(&desc)
            .map_err(|e| api_error("create_image_view", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device,
                handle,
                image: Arc::clone(image),
                desc,
                label: DebugLabel::for_handle(vk::ObjectType::IMAGE_VIEW, raw(handle)),
                _registration: Registration::new(ObjectKind::ImageView, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    /// Viewed image
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }

    /// View parameters
    pub fn desc(&self) -> &ImageViewDesc {
        &self.desc
    }
}

impl_debug_named!(ImageView);

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("image", &self.image.id())
            .finish()
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        self.device.native().destroy_image_view(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;
    use crate::registry::ObjectRegistry;

    #[test]
    fn test_aspect_mask_for_depth_stencil() {
        assert_eq!(
            aspect_mask_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_image_tracks_layout_from_initial() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let image = Image::create(
            &device,
            ImageDesc::new_2d(
                vk::Format::R8G8B8A8_UNORM,
                4,
                4,
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ),
        )
        .unwrap();
        assert_eq!(image.current_layout(), vk::ImageLayout::UNDEFINED);
        image.set_current_layout(vk::ImageLayout::GENERAL);
        assert_eq!(image.current_layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_view_keeps_image_registered() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let image = Image::create(
            &device,
            ImageDesc::new_2d(vk::Format::B8G8R8A8_UNORM, 2, 2, vk::ImageUsageFlags::SAMPLED),
        )
        .unwrap();
        let image_id = image.id();
        let view = ImageView::create_2d(&image).unwrap();
        drop(image);

        assert!(ObjectRegistry::global().contains(ObjectKind::Image, image_id));
        drop(view);
        assert!(!ObjectRegistry::global().contains(ObjectKind::Image, image_id));
    }
}
