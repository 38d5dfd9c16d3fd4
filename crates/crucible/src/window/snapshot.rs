//! PNG snapshots of presented frames

use ash::vk;
use std::path::Path;

use crate::core::error::{contract_violation, CrucibleError, CrucibleResult};
use crate::native::ReadbackDesc;
use crate::swapchain::Swapchain;

/// Layouts a presented image may be read back from
const READABLE_LAYOUTS: [vk::ImageLayout; 3] = [
    vk::ImageLayout::PRESENT_SRC_KHR,
    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    vk::ImageLayout::GENERAL,
];

/// Read image `image_index` of `swapchain` back as RGBA8 and encode it
pub(super) fn write_png(swapchain: &Swapchain, image_index: u32, path: &Path) -> CrucibleResult<()> {
    let Some(image) = swapchain.image(image_index) else {
        return Err(contract_violation(format!(
            "snapshot of image {} but swapchain {} has {}",
            image_index,
            swapchain.id(),
            swapchain.n_images()
        )));
    };

    let layout = image.current_layout();
    if !READABLE_LAYOUTS.contains(&layout) {
        return Err(contract_violation(format!(
            "snapshot of swapchain image {} in layout {:?}; transition it to PRESENT_SRC_KHR first",
            image_index, layout
        )));
    }

    let (width, height) = image.extent();
    let pixels = swapchain
        .device()
        .native()
        .read_back_image(&ReadbackDesc {
            image: image.handle(),
            format: image.format(),
            width,
            height,
            layout,
        })
        .map_err(|e| crate::core::error::api_error("read_back_image", e))?;

    let Some(frame) = image::RgbaImage::from_raw(width, height, pixels) else {
        return Err(CrucibleError::Snapshot(format!(
            "read-back of {}x{} image returned a short buffer",
            width, height
        )));
    };

    frame
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| {
            log::error!("Writing snapshot {} failed: {}", path.display(), e);
            CrucibleError::Snapshot(format!("{}: {}", path.display(), e))
        })?;

    log::debug!("Snapshot written: {}", path.display());
    Ok(())
}
