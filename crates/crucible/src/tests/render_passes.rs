use ash::vk;

use super::Harness;
use crate::render_pass::{RenderPass, RenderPassCreateInfo};

fn color(info: &mut RenderPassCreateInfo) -> u32 {
    info.add_color_attachment(
        vk::Format::R8G8B8A8_UNORM,
        vk::SampleCountFlags::TYPE_1,
        vk::AttachmentLoadOp::CLEAR,
        vk::AttachmentStoreOp::STORE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        false,
    )
}

fn write(info: &mut RenderPassCreateInfo, subpass: u32, attachment: u32, location: u32) {
    info.add_subpass_color_attachment(
        subpass,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        attachment,
        location,
        None,
    )
    .unwrap();
}

fn read(info: &mut RenderPassCreateInfo, subpass: u32, attachment: u32, index: u32) {
    info.add_subpass_input_attachment(
        subpass,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        attachment,
        index,
        vk::ImageAspectFlags::COLOR,
    )
    .unwrap();
}

#[test]
fn test_fullscreen_triangle_pass() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    let target = info.add_color_attachment(
        vk::Format::R8G8B8A8_UNORM,
        vk::SampleCountFlags::TYPE_1,
        vk::AttachmentLoadOp::CLEAR,
        vk::AttachmentStoreOp::STORE,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::PRESENT_SRC_KHR,
        false,
    );
    let subpass = info.add_subpass();
    write(&mut info, subpass, target, 0);
    info.add_external_to_subpass_dependency(
        subpass,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::AccessFlags::empty(),
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::DependencyFlags::empty(),
    )
    .unwrap();

    let render_pass = RenderPass::create(&info, None).unwrap();
    let desc = render_pass.desc();
    assert_eq!(desc.attachments.len(), 1);
    assert_eq!(desc.subpasses.len(), 1);
    assert_eq!(desc.dependencies.len(), 1);
    assert!(desc.subpasses[0].preserve_attachments.is_empty());
    assert_eq!(info.get_subpass_preserve_attachments(subpass), Some(&[][..]));
    harness.assert_valid();
}

#[test]
fn test_two_subpass_gbuffer() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    let c0 = color(&mut info);
    let c1 = color(&mut info);
    let depth = info.add_depth_stencil_attachment(
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
    let c2 = color(&mut info);

    let geometry = info.add_subpass();
    write(&mut info, geometry, c0, 0);
    write(&mut info, geometry, c1, 1);
    info.add_subpass_depth_stencil_attachment(
        geometry,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        depth,
        None,
        vk::ResolveModeFlags::NONE,
        vk::ResolveModeFlags::NONE,
    )
    .unwrap();

    let lighting = info.add_subpass();
    read(&mut info, lighting, c0, 0);
    read(&mut info, lighting, c1, 1);
    write(&mut info, lighting, c2, 0);

    info.add_subpass_to_subpass_dependency(
        geometry,
        lighting,
        vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::AccessFlags::INPUT_ATTACHMENT_READ,
        vk::DependencyFlags::BY_REGION,
    )
    .unwrap();

    assert_eq!(info.get_subpass_preserve_attachments(geometry), Some(&[][..]));
    assert_eq!(info.get_subpass_preserve_attachments(lighting), Some(&[][..]));

    let render_pass = RenderPass::create(&info, None).unwrap();
    assert_eq!(render_pass.n_subpasses(), 2);
    assert_eq!(
        render_pass.desc().dependencies[0].dependency_flags,
        vk::DependencyFlags::BY_REGION
    );
    harness.assert_valid();
}

#[test]
fn test_three_subpass_preserve_inference() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    let [a, b, c, d] = [(); 4].map(|()| color(&mut info));

    let first = info.add_subpass();
    write(&mut info, first, a, 0);
    write(&mut info, first, b, 1);
    let second = info.add_subpass();
    write(&mut info, second, c, 0);
    let third = info.add_subpass();
    write(&mut info, third, a, 0);
    write(&mut info, third, b, 1);

    assert_eq!(info.get_subpass_preserve_attachments(first), Some(&[][..]));
    assert_eq!(info.get_subpass_preserve_attachments(second), Some(&[a, b][..]));
    assert_eq!(info.get_subpass_preserve_attachments(third), Some(&[][..]));

    // An attachment nobody touches is never preserved
    let render_pass = RenderPass::create(&info, None).unwrap();
    assert!(!render_pass.desc().subpasses[1].preserve_attachments.contains(&d));
    assert_eq!(render_pass.desc().subpasses[1].preserve_attachments, vec![a, b]);
    harness.assert_valid();
}

#[test]
fn test_attachment_used_by_one_subpass_is_never_preserved() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    let only = color(&mut info);
    let other = color(&mut info);

    let first = info.add_subpass();
    write(&mut info, first, only, 0);
    let rest: Vec<u32> = (0..3).map(|_| info.add_subpass()).collect();
    for subpass in &rest {
        write(&mut info, *subpass, other, 0);
    }

    for subpass in std::iter::once(first).chain(rest) {
        assert_eq!(info.get_subpass_preserve_attachments(subpass), Some(&[][..]));
    }
}

#[test]
fn test_preserve_follows_every_later_mutation() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    let shared = color(&mut info);
    let scratch = color(&mut info);

    let first = info.add_subpass();
    write(&mut info, first, shared, 0);
    let middle = info.add_subpass();
    write(&mut info, middle, scratch, 0);
    assert_eq!(info.get_subpass_preserve_attachments(middle), Some(&[][..]));

    let last = info.add_subpass();
    write(&mut info, last, shared, 0);
    assert_eq!(info.get_subpass_preserve_attachments(middle), Some(&[shared][..]));

    let tail = info.add_subpass();
    write(&mut info, tail, shared, 0);
    assert_eq!(info.get_subpass_preserve_attachments(middle), Some(&[shared][..]));
    assert_eq!(info.get_subpass_preserve_attachments(last), Some(&[][..]));
}

#[cfg(not(feature = "assert-contracts"))]
#[test]
fn test_zero_subpasses_fail_to_bake() {
    let harness = Harness::new();
    let mut info = RenderPassCreateInfo::new(&harness.device);
    color(&mut info);
    assert!(RenderPass::create(&info, None)
        .unwrap_err()
        .is_contract_violation());
    assert_eq!(harness.count_calls(|call| matches!(call, crate::native::NativeCall::CreateRenderPass(_))), 0);
}
