use ash::vk;

use super::Harness;
use crate::core::mt::MtSafety;
use crate::native::NativeCall;
use crate::pipeline::{GraphicsPipelineManager, PipelineCache};

#[test]
fn test_matching_attributes_share_one_binding() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let mut info = harness.pipeline_info(&render_pass, 0);
    for (location, offset) in [(0, 0), (1, 12), (2, 24)] {
        info.add_vertex_attribute(
            location,
            vk::Format::R32G32B32_SFLOAT,
            offset,
            32,
            vk::VertexInputRate::VERTEX,
            None,
            1,
        )
        .unwrap();
    }

    let manager = GraphicsPipelineManager::create(&harness.device, None, MtSafety::InheritFromParent).unwrap();
    let id = manager.add_pipeline(&info).unwrap();
    manager.bake().unwrap();

    let layout = manager.get_vertex_input_layout(id).unwrap();
    assert_eq!(layout.bindings().len(), 1);
    assert_eq!(layout.bindings()[0].stride, 32);
    assert_eq!(layout.attributes().len(), 3);
    for location in 0..3 {
        assert_eq!(manager.get_binding_for_location(id, location).unwrap(), Some(0));
    }
    assert_eq!(manager.get_pipeline_desc(id).unwrap().vertex_bindings.len(), 1);
    harness.assert_valid();
}

#[test]
fn test_explicit_binding_is_kept_apart() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let mut info = harness.pipeline_info(&render_pass, 0);
    let rate = vk::VertexInputRate::VERTEX;
    info.add_vertex_attribute(0, vk::Format::R32G32_SFLOAT, 0, 16, rate, None, 1)
        .unwrap();
    info.add_vertex_attribute(1, vk::Format::R32G32_SFLOAT, 8, 16, rate, Some(0), 1)
        .unwrap();
    info.add_vertex_attribute(2, vk::Format::R32G32_SFLOAT, 0, 16, rate, None, 1)
        .unwrap();

    let manager = GraphicsPipelineManager::create(&harness.device, None, MtSafety::InheritFromParent).unwrap();
    let id = manager.add_pipeline(&info).unwrap();

    let explicit = manager.get_binding_for_location(id, 1).unwrap();
    assert_eq!(explicit, Some(0));
    let implicit = [
        manager.get_binding_for_location(id, 0).unwrap(),
        manager.get_binding_for_location(id, 2).unwrap(),
    ];
    assert_eq!(implicit[0], implicit[1]);
    assert_ne!(implicit[0], explicit);
    assert_eq!(manager.get_vertex_input_layout(id).unwrap().bindings().len(), 2);
}

#[test]
fn test_cloned_create_info_lowers_identically() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let mut info = harness.pipeline_info(&render_pass, 0);
    info.set_depth_test(true, vk::CompareOp::LESS_OR_EQUAL);
    info.set_blend_constants([0.25, 0.5, 0.75, 1.0]);
    info.toggle_dynamic_state(true, vk::DynamicState::SCISSOR);
    info.add_vertex_attribute(
        0,
        vk::Format::R32G32B32A32_SFLOAT,
        0,
        16,
        vk::VertexInputRate::INSTANCE,
        None,
        2,
    )
    .unwrap();
    let copy = info.clone();
    assert!(copy == info);

    let manager = GraphicsPipelineManager::create(&harness.device, None, MtSafety::InheritFromParent).unwrap();
    let original = manager.add_pipeline(&info).unwrap();
    let cloned = manager.add_pipeline(&copy).unwrap();
    manager.bake().unwrap();

    assert_eq!(
        manager.get_pipeline_desc(original).unwrap(),
        manager.get_pipeline_desc(cloned).unwrap()
    );
    assert_ne!(
        manager.get_pipeline(original).unwrap(),
        manager.get_pipeline(cloned).unwrap()
    );
}

#[test]
fn test_proxy_seeds_real_create_infos() {
    let harness = Harness::new();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

    let mut template = crate::pipeline::GraphicsPipelineCreateInfo::new_proxy(&harness.device);
    template.copy_gfx_state_from(&harness.pipeline_info(&render_pass, 0));
    assert!(template.is_proxy());
    template.set_depth_test(true, vk::CompareOp::GREATER);
    template.set_blend_constants([1.0; 4]);

    let mut info = crate::pipeline::GraphicsPipelineCreateInfo::new(&render_pass, 0).unwrap();
    info.copy_gfx_state_from(&template);
    assert_eq!(info.depth_test(), Some(vk::CompareOp::GREATER));
    assert!(!info.is_proxy());
    assert!(info.render_pass().is_some_and(|rp| std::sync::Arc::ptr_eq(rp, &render_pass)));

    let manager = GraphicsPipelineManager::create(&harness.device, None, MtSafety::InheritFromParent).unwrap();
    let id = manager.add_pipeline(&info).unwrap();
    let desc = manager.get_pipeline_desc(id).unwrap();
    assert!(desc.depth_test);
    assert_eq!(desc.blend_constants, [1.0; 4]);
}

#[test]
fn test_bakes_are_threaded_through_the_cache() {
    let harness = Harness::new();
    let cache = PipelineCache::create(&harness.device, &[], MtSafety::InheritFromParent).unwrap();
    let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    let info = harness.pipeline_info(&render_pass, 0);

    let manager =
        GraphicsPipelineManager::create(&harness.device, Some(cache.clone()), MtSafety::Enabled).unwrap();
    manager.add_pipeline(&info).unwrap();
    manager.add_pipeline(&info).unwrap();
    manager.bake().unwrap();

    let batches: Vec<(vk::PipelineCache, usize)> = harness
        .headless
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::CreateGraphicsPipelines { cache, descs } => Some((cache, descs.len())),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![(cache.handle(), 2)]);
}
