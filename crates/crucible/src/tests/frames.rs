use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

use super::{full_area, Harness};
use crate::command::{ClearColor, ClearValue};
use crate::core::mt::MtSafety;
use crate::queue::SubmitInfo;
use crate::resources::Semaphore;
use crate::swapchain::{Swapchain, SwapchainCreateInfo};
use crate::window::Window;

fn swapchain(harness: &Harness, window: &Arc<Window>, n_images: u32) -> Arc<Swapchain> {
    Swapchain::create(
        &harness.device,
        window,
        SwapchainCreateInfo {
            n_images: Some(n_images),
            ..SwapchainCreateInfo::default()
        },
        MtSafety::InheritFromParent,
    )
    .unwrap()
}

fn snapshot_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("crucible-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_teardown_waits_for_every_present() {
    let harness = Harness::new();
    let window = Window::create_dummy("balance", 16, 16);
    let swapchain = swapchain(&harness, &window, 3);
    let queue = harness.device.universal_queue(0).unwrap();

    let acquired: Vec<u32> = (0..3)
        .map(|_| swapchain.acquire_image(None, false).unwrap())
        .collect();
    assert_eq!(acquired, [0, 1, 2]);
    queue.present(&swapchain, acquired[0], &[]).unwrap();
    queue.present(&swapchain, acquired[1], &[]).unwrap();

    assert!(swapchain.try_teardown().unwrap_err().is_contract_violation());
    assert!(!swapchain.is_torn_down());

    queue.present(&swapchain, acquired[2], &[]).unwrap();
    assert_eq!(swapchain.n_acquired(), swapchain.n_presented());
    swapchain.try_teardown().unwrap();
    assert!(swapchain.is_torn_down());
    assert_eq!(window.n_presented_frames(), 3);
    harness.assert_valid();
}

#[test]
fn test_cleared_frames_are_snapshotted() {
    let harness = Harness::new();
    let dir = snapshot_dir("snapshots");
    let window = Window::create_with_png_snapshots("snapshots", 8, 4, &dir, "frame_").unwrap();
    let swapchain = swapchain(&harness, &window, 2);
    let queue = harness.device.universal_queue(0).unwrap();
    let render_pass = harness.color_pass(vk::ImageLayout::PRESENT_SRC_KHR);
    let pool = harness.pool(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    let image_ready = Semaphore::create(&harness.device).unwrap();
    let render_done = Semaphore::create(&harness.device).unwrap();

    let colors = [
        ClearColor::Float32([1.0, 0.0, 0.0, 1.0]),
        ClearColor::Float32([0.0, 0.0, 1.0, 1.0]),
    ];
    for color in colors {
        let index = swapchain.acquire_image(Some(&image_ready), true).unwrap();
        let view = swapchain.image_view(index).unwrap();
        let framebuffer = harness.framebuffer(vec![Arc::clone(view)], 8, 4);

        let cb = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
        cb.begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
            .unwrap();
        cb.begin_render_pass(
            &render_pass,
            &framebuffer,
            full_area(8, 4),
            &[ClearValue::Color(color)],
            vk::SubpassContents::INLINE,
            None,
        )
        .unwrap();
        cb.end_render_pass().unwrap();
        cb.end_recording().unwrap();

        queue
            .submit(
                SubmitInfo::new()
                    .command_buffer(&cb)
                    .wait(&image_ready, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .signal(&render_done),
            )
            .unwrap();
        queue
            .present(&swapchain, index, std::slice::from_ref(&render_done))
            .unwrap();
        harness.device.wait_idle().unwrap();
    }

    for (frame, color) in colors.iter().enumerate() {
        let path = dir.join(format!("frame_{frame:06}.png"));
        let png = image::open(&path).unwrap().to_rgba8();
        assert_eq!(png.dimensions(), (8, 4));
        assert!(png.pixels().all(|px| px.0 == color.to_rgba8()));
    }
    swapchain.try_teardown().unwrap();
    harness.assert_valid();
    let _ = std::fs::remove_dir_all(&dir);
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_snapshot_needs_a_readable_layout() {
    let harness = Harness::new();
    let dir = snapshot_dir("layout");
    let window = Window::create_with_png_snapshots("layout", 4, 4, &dir, "frame_").unwrap();
    let swapchain = swapchain(&harness, &window, 1);
    let queue = harness.device.universal_queue(0).unwrap();

    // Freshly created images are still UNDEFINED
    let index = swapchain.acquire_image(None, false).unwrap();
    let present = queue.present(&swapchain, index, &[]);
    assert!(present.unwrap_err().is_contract_violation());
    assert!(!dir.join("frame_000000.png").exists());
    let _ = std::fs::remove_dir_all(&dir);
}
