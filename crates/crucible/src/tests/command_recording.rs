use ash::vk;
use std::sync::Arc;

use super::{full_area, Harness};
use crate::command::{ClearAttachment, ClearColor, ClearValue, Inheritance};
use crate::core::mt::MtSafety;
use crate::native::NativeCall;
use crate::queue::SubmitInfo;
use crate::resources::{Fence, ImageView};

const GREEN: ClearColor = ClearColor::Float32([0.0, 1.0, 0.0, 1.0]);

fn clear_rect(width: u32, height: u32) -> vk::ClearRect {
    vk::ClearRect {
        rect: full_area(width, height),
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[test]
fn test_secondary_replays_inside_primary_render_pass() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let image = harness.color_image(8, 8);
    let framebuffer = harness.framebuffer(vec![ImageView::create_2d(&image).unwrap()], 8, 8);
    let pool = harness.pool(vk::CommandPoolCreateFlags::empty());

    let secondary = pool.alloc_secondary(MtSafety::InheritFromParent).unwrap();
    secondary
        .begin_secondary_recording(
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Inheritance::render_pass(&render_pass, 0),
        )
        .unwrap();
    assert!(secondary.is_inside_render_pass());
    secondary
        .clear_attachments(
            &[ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                value: ClearValue::Color(GREEN),
            }],
            &[clear_rect(8, 8)],
        )
        .unwrap();
    secondary.end_recording().unwrap();

    let primary = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
    primary
        .begin_recording(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        .unwrap();
    primary
        .begin_render_pass(
            &render_pass,
            &framebuffer,
            full_area(8, 8),
            &[ClearValue::Color(ClearColor::BLACK)],
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            None,
        )
        .unwrap();
    primary.execute_commands(&[Arc::clone(&secondary)]).unwrap();
    primary.end_render_pass().unwrap();
    primary.end_recording().unwrap();

    let fence = Fence::create(&harness.device, false).unwrap();
    let queue = harness.device.universal_queue(0).unwrap();
    queue
        .submit(SubmitInfo::new().command_buffer(&primary).fence(&fence))
        .unwrap();
    fence.wait(u64::MAX).unwrap();

    let pixels = harness.headless.image_pixels(image.handle()).unwrap();
    assert_eq!(pixels.len(), 8 * 8 * 4);
    assert!(pixels.chunks_exact(4).all(|px| px == [0, 255, 0, 255]));
    harness.assert_valid();
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_render_pass_secondary_can_draw_but_not_copy() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let src = harness.color_image(4, 4);
    let dst = harness.color_image(4, 4);
    let secondary = harness
        .pool(vk::CommandPoolCreateFlags::empty())
        .alloc_secondary(MtSafety::InheritFromParent)
        .unwrap();
    secondary
        .begin_secondary_recording(
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Inheritance::render_pass(&render_pass, 0),
        )
        .unwrap();

    secondary.draw(3, 1, 0, 0).unwrap();
    let copy = secondary.copy_image(
        &src,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        &dst,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        &[vk::ImageCopy::default()],
    );
    assert!(copy.unwrap_err().is_contract_violation());
    secondary.end_recording().unwrap();

    let names: Vec<&str> = harness
        .headless
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::RecordCommand { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(names, ["vkCmdDraw"]);
    harness.assert_valid();
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_continuing_secondary_needs_inherited_render_pass() {
    let harness = Harness::new();
    let secondary = harness
        .pool(vk::CommandPoolCreateFlags::empty())
        .alloc_secondary(MtSafety::InheritFromParent)
        .unwrap();
    let begin = secondary.begin_secondary_recording(
        vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
        Inheritance::default(),
    );
    assert!(begin.unwrap_err().is_contract_violation());
    assert!(!secondary.is_recording());
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_incompatible_secondary_is_rejected() {
    let harness = Harness::new();
    let target_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let mut other_info = crate::render_pass::RenderPassCreateInfo::new(&harness.device);
    let depth = other_info.add_depth_stencil_attachment(
        vk::Format::D32_SFLOAT,
        vk::SampleCountFlags::TYPE_1,
        vk::AttachmentLoadOp::CLEAR,
        vk::AttachmentStoreOp::DONT_CARE,
        vk::AttachmentLoadOp::DONT_CARE,
        vk::AttachmentStoreOp::DONT_CARE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        false,
    );
    let subpass = other_info.add_subpass();
    other_info
        .add_subpass_depth_stencil_attachment(
            subpass,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            depth,
            None,
            vk::ResolveModeFlags::NONE,
            vk::ResolveModeFlags::NONE,
        )
        .unwrap();
    let other_pass = crate::render_pass::RenderPass::create(&other_info, None).unwrap();

    let image = harness.color_image(4, 4);
    let framebuffer = harness.framebuffer(vec![ImageView::create_2d(&image).unwrap()], 4, 4);
    let pool = harness.pool(vk::CommandPoolCreateFlags::empty());
    let secondary = pool.alloc_secondary(MtSafety::InheritFromParent).unwrap();
    secondary
        .begin_secondary_recording(
            vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
            Inheritance::render_pass(&other_pass, 0),
        )
        .unwrap();
    secondary.end_recording().unwrap();

    let primary = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
    primary.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
    primary
        .begin_render_pass(
            &target_pass,
            &framebuffer,
            full_area(4, 4),
            &[ClearValue::Color(ClearColor::BLACK)],
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            None,
        )
        .unwrap();
    let execute = primary.execute_commands(&[secondary]);
    assert!(execute.unwrap_err().is_contract_violation());
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_submit_accepts_only_recorded_primaries() {
    let harness = Harness::new();
    let pool = harness.pool(vk::CommandPoolCreateFlags::empty());
    let queue = harness.device.universal_queue(0).unwrap();
    let submits = || harness.count_calls(|call| matches!(call, NativeCall::QueueSubmit { .. }));

    let fresh = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
    let result = queue.submit(SubmitInfo::new().command_buffer(&fresh));
    assert!(result.unwrap_err().is_contract_violation());

    fresh.begin_recording(vk::CommandBufferUsageFlags::empty()).unwrap();
    let result = queue.submit(SubmitInfo::new().command_buffer(&fresh));
    assert!(result.unwrap_err().is_contract_violation());

    let secondary = pool.alloc_secondary(MtSafety::InheritFromParent).unwrap();
    secondary
        .begin_secondary_recording(vk::CommandBufferUsageFlags::empty(), Inheritance::default())
        .unwrap();
    secondary.end_recording().unwrap();
    let result = queue.submit(SubmitInfo::new().command_buffer(&secondary));
    assert!(result.unwrap_err().is_contract_violation());
    assert_eq!(submits(), 0);

    fresh.end_recording().unwrap();
    queue.submit(SubmitInfo::new().command_buffer(&fresh)).unwrap();
    assert_eq!(submits(), 1);
    harness.assert_valid();
}

#[test]
fn test_buffer_recorded_before_attachment_swap_stays_submittable() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let before = harness.color_image(4, 4);
    let after = harness.color_image(4, 4);
    let framebuffer = harness.framebuffer(vec![ImageView::create_2d(&before).unwrap()], 4, 4);
    let pool = harness.pool(vk::CommandPoolCreateFlags::empty());

    let primary = pool.alloc_primary(MtSafety::InheritFromParent).unwrap();
    primary
        .begin_recording(vk::CommandBufferUsageFlags::empty())
        .unwrap();
    primary
        .begin_render_pass(
            &render_pass,
            &framebuffer,
            full_area(4, 4),
            &[ClearValue::Color(GREEN)],
            vk::SubpassContents::INLINE,
            None,
        )
        .unwrap();
    primary.end_render_pass().unwrap();
    primary.end_recording().unwrap();

    framebuffer
        .replace_attachment(0, ImageView::create_2d(&after).unwrap())
        .unwrap();
    framebuffer.get_framebuffer(&render_pass).unwrap();

    let queue = harness.device.universal_queue(0).unwrap();
    queue.submit(SubmitInfo::new().command_buffer(&primary)).unwrap();
    queue.wait_idle().unwrap();

    let pixels = harness.headless.image_pixels(before.handle()).unwrap();
    assert!(pixels.chunks_exact(4).all(|px| px == [0, 255, 0, 255]));
    assert_eq!(
        harness.count_calls(|call| matches!(call, NativeCall::DestroyFramebuffer(_))),
        0
    );
    harness.assert_valid();
}
