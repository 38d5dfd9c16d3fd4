//! Graphics pipeline manager
//!
//! Owns pipelines by stable [`PipelineId`]. Adding or updating a pipeline only
//! records its create-info; [`GraphicsPipelineManager::bake`] lowers every
//! outstanding create-info and creates them all with one driver call. A
//! failing batch is rolled back as a whole, so a pipeline is either fully
//! baked or still pending.

use ash::vk;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::error::{api_error, contract_violation, ensure_contract, CrucibleError, CrucibleResult};
use crate::core::mt::{lock_state, MtLock, MtSafety};
use crate::device::Device;
use crate::foundation::collections::{ObjectId, PipelineId, SlotMap};
use crate::native::{GraphicsPipelineDesc, PipelineBase};
use crate::registry::{ObjectKind, Registration};
use crate::resources::PipelineLayout;

use super::cache::PipelineCache;
use super::create_info::{BasePipeline, GraphicsPipelineCreateInfo};
use super::vertex_input::VertexInputLayout;

struct BakedPipeline {
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    vertex_input: VertexInputLayout,
    desc: GraphicsPipelineDesc,
}

struct PipelineEntry {
    info: GraphicsPipelineCreateInfo,
    baked: Option<BakedPipeline>,
    dirty: bool,
}

#[derive(Default)]
struct ManagerState {
    pipelines: SlotMap<PipelineId, PipelineEntry>,
    empty_layout: Option<Arc<PipelineLayout>>,
}

/// Batched graphics pipeline factory
pub struct GraphicsPipelineManager {
    id: ObjectId,
    device: Arc<Device>,
    cache: Option<Arc<PipelineCache>>,
    lock: MtLock,
    state: Mutex<ManagerState>,
    _registration: Registration,
}

impl GraphicsPipelineManager {
    /// Create a manager, optionally threading bakes through `cache`
    pub fn create(
        device: &Arc<Device>,
        cache: Option<Arc<PipelineCache>>,
        mt_safety: MtSafety,
    ) -> CrucibleResult<Arc<Self>> {
        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                cache,
                lock: MtLock::new(device.resolve_mt_safety(mt_safety)),
                state: Mutex::new(ManagerState::default()),
                _registration: Registration::new(ObjectKind::GraphicsPipelineManager, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Pipeline cache used for bakes
    pub fn cache(&self) -> Option<&Arc<PipelineCache>> {
        self.cache.as_ref()
    }

    /// Register a pipeline; it is baked on the next [`Self::bake`]
    pub fn add_pipeline(&self, info: &GraphicsPipelineCreateInfo) -> CrucibleResult<PipelineId> {
        ensure_contract!(!info.is_proxy(), "proxy create-infos cannot be added to a manager");
        ensure_contract!(
            Arc::ptr_eq(info.device(), &self.device),
            "create-info belongs to a different device"
        );

        let mut state = lock_state(&self.state);
        if let BasePipeline::Id(base) = info.base_pipeline() {
            ensure_contract!(
                state.pipelines.contains_key(base),
                "base pipeline {:?} is not owned by this manager",
                base
            );
        }

        let id = state.pipelines.insert(PipelineEntry {
            info: info.clone(),
            baked: None,
            dirty: true,
        });
        log::trace!("Pipeline {:?} added to manager {}", id, self.id);
        Ok(id)
    }

    /// Replace the create-info of an existing pipeline; the ID stays valid
    pub fn update_pipeline(&self, id: PipelineId, info: &GraphicsPipelineCreateInfo) -> CrucibleResult<()> {
        ensure_contract!(!info.is_proxy(), "proxy create-infos cannot be added to a manager");

        let mut state = lock_state(&self.state);
        let Some(entry) = state.pipelines.get_mut(id) else {
            return Err(unknown(id));
        };
        entry.info = info.clone();
        entry.dirty = true;
        Ok(())
    }

    /// Destroy a pipeline and release its ID
    pub fn delete_pipeline(&self, id: PipelineId) -> CrucibleResult<()> {
        let mut state = lock_state(&self.state);
        let derived = state
            .pipelines
            .iter()
            .any(|(other, e)| other != id && e.info.base_pipeline() == BasePipeline::Id(id) && e.dirty);
        ensure_contract!(
            !derived,
            "pipeline {:?} is the base of a pipeline that has not been baked yet",
            id
        );

        let Some(entry) = state.pipelines.remove(id) else {
            return Err(unknown(id));
        };
        if let Some(baked) = entry.baked {
            let _guard = self.lock.lock();
            self.device.native().destroy_pipeline(baked.handle);
        }
        log::trace!("Pipeline {:?} deleted", id);
        Ok(())
    }

    /// Number of pipelines owned by the manager
    pub fn n_pipelines(&self) -> usize {
        lock_state(&self.state).pipelines.len()
    }

    /// Whether any pipeline waits to be baked
    pub fn has_outstanding_bakes(&self) -> bool {
        lock_state(&self.state).pipelines.values().any(|e| e.dirty)
    }

    /// Bake every outstanding pipeline in one batch
    pub fn bake(&self) -> CrucibleResult<()> {
        let mut state = lock_state(&self.state);
        self.bake_locked(&mut state)
    }

    fn bake_locked(&self, state: &mut ManagerState) -> CrucibleResult<()> {
        let order = batch_order(&state.pipelines)?;
        if order.is_empty() {
            return Ok(());
        }

        let position: HashMap<PipelineId, usize> = order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut prepared = Vec::with_capacity(order.len());
        let mut descs = Vec::with_capacity(order.len());
        for id in &order {
            let info = state.pipelines[*id].info.clone();

            let base = match info.base_pipeline() {
                BasePipeline::None => PipelineBase::None,
                BasePipeline::Id(base_id) => {
                    let Some(base_entry) = state.pipelines.get(base_id) else {
                        return Err(unknown(base_id));
                    };
                    ensure_contract!(
                        base_entry.info.allows_derivatives(),
                        "base pipeline {:?} does not allow derivatives",
                        base_id
                    );
                    match (position.get(&base_id), &base_entry.baked) {
                        (Some(index), _) => PipelineBase::Index(*index as i32),
                        (None, Some(baked)) => PipelineBase::Handle(baked.handle),
                        (None, None) => return Err(unknown(base_id)),
                    }
                }
            };

            let layout = match info.pipeline_layout() {
                Some(layout) => Arc::clone(layout),
                None => self.empty_layout(state)?,
            };
            let vertex_input = VertexInputLayout::build(info.vertex_attributes())?;
            let default_extent = info
                .render_pass()
                .and_then(|rp| rp.swapchain())
                .map(|swapchain| swapchain.extent());

            let desc = info.to_native_desc(&vertex_input, layout.handle(), base, default_extent)?;
            descs.push(desc.clone());
            prepared.push((layout, vertex_input, desc));
        }

        let cache = self.cache.as_ref().map_or(vk::PipelineCache::null(), |c| c.handle());
        let result = {
            let _guard = self.lock.lock();
            self.device.native().create_graphics_pipelines(cache, &descs)
        };

        let handles = match result {
            Ok(handles) => handles,
            Err(failure) => {
                let failed_index = failure
                    .pipelines
                    .iter()
                    .position(|p| *p == vk::Pipeline::null())
                    .unwrap_or(0);
                self.discard(&failure.pipelines);
                log::error!(
                    "Pipeline batch of {} failed at index {} with {:?}; batch rolled back",
                    order.len(),
                    failed_index,
                    failure.result
                );
                return Err(CrucibleError::BatchFailed {
                    failed_index,
                    result: failure.result,
                });
            }
        };

        if handles.len() != order.len() {
            log::error!(
                "Pipeline batch of {} returned {} handle(s); batch rolled back",
                order.len(),
                handles.len()
            );
            self.discard(&handles);
            return Err(api_error("create_graphics_pipelines", vk::Result::ERROR_UNKNOWN));
        }

        for ((id, handle), (layout, vertex_input, desc)) in order.iter().zip(handles).zip(prepared) {
            let entry = &mut state.pipelines[*id];
            if let Some(previous) = entry.baked.take() {
                let _guard = self.lock.lock();
                self.device.native().destroy_pipeline(previous.handle);
            }
            entry.baked = Some(BakedPipeline {
                handle,
                layout,
                vertex_input,
                desc,
            });
            entry.dirty = false;
        }

        log::debug!("Baked {} graphics pipeline(s) in one batch", order.len());
        Ok(())
    }

    fn discard(&self, handles: &[vk::Pipeline]) {
        let _guard = self.lock.lock();
        for handle in handles.iter().filter(|p| **p != vk::Pipeline::null()) {
            self.device.native().destroy_pipeline(*handle);
        }
    }

    fn empty_layout(&self, state: &mut ManagerState) -> CrucibleResult<Arc<PipelineLayout>> {
        if let Some(layout) = &state.empty_layout {
            return Ok(Arc::clone(layout));
        }
        let layout = PipelineLayout::create_empty(&self.device)?;
        state.empty_layout = Some(Arc::clone(&layout));
        Ok(layout)
    }

    fn with_baked<T>(&self, id: PipelineId, f: impl FnOnce(&BakedPipeline) -> T) -> CrucibleResult<T> {
        let mut state = lock_state(&self.state);
        let Some(entry) = state.pipelines.get(id) else {
            return Err(unknown(id));
        };
        if entry.dirty {
            self.bake_locked(&mut state)?;
        }
        state
            .pipelines
            .get(id)
            .and_then(|entry| entry.baked.as_ref())
            .map(f)
            .ok_or_else(|| unknown(id))
    }

    /// Native handle of a pipeline, baking outstanding pipelines first
    pub fn get_pipeline(&self, id: PipelineId) -> CrucibleResult<vk::Pipeline> {
        self.with_baked(id, |baked| baked.handle)
    }

    /// Layout the pipeline was baked with
    pub fn get_pipeline_layout(&self, id: PipelineId) -> CrucibleResult<Arc<PipelineLayout>> {
        self.with_baked(id, |baked| Arc::clone(&baked.layout))
    }

    /// Vertex bindings and attributes the pipeline was baked with
    pub fn get_vertex_input_layout(&self, id: PipelineId) -> CrucibleResult<VertexInputLayout> {
        self.with_baked(id, |baked| baked.vertex_input.clone())
    }

    /// Binding index an attribute location reads from
    pub fn get_binding_for_location(&self, id: PipelineId, location: u32) -> CrucibleResult<Option<u32>> {
        self.with_baked(id, |baked| baked.vertex_input.binding_for_location(location))
    }

    /// Descriptor the driver received for the pipeline
    pub fn get_pipeline_desc(&self, id: PipelineId) -> CrucibleResult<GraphicsPipelineDesc> {
        self.with_baked(id, |baked| baked.desc.clone())
    }

    /// Copy of the pipeline's create-info
    pub fn get_pipeline_create_info(&self, id: PipelineId) -> Option<GraphicsPipelineCreateInfo> {
        lock_state(&self.state).pipelines.get(id).map(|e| e.info.clone())
    }
}

/// Dirty pipelines, each base ahead of its derivatives
fn batch_order(pipelines: &SlotMap<PipelineId, PipelineEntry>) -> CrucibleResult<Vec<PipelineId>> {
    let mut pending: Vec<PipelineId> = pipelines
        .iter()
        .filter(|(_, e)| e.dirty)
        .map(|(id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let before = pending.len();
        pending.retain(|id| {
            let ready = match pipelines[*id].info.base_pipeline() {
                BasePipeline::Id(base) => {
                    base == *id
                        || order.contains(&base)
                        || pipelines.get(base).map_or(true, |b| !b.dirty)
                }
                BasePipeline::None => true,
            };
            if ready {
                order.push(*id);
            }
            !ready
        });
        if pending.len() == before {
            return Err(contract_violation("cyclic base pipeline references"));
        }
    }

    for id in &order {
        if pipelines[*id].info.base_pipeline() == BasePipeline::Id(*id) {
            return Err(contract_violation(format!("pipeline {id:?} derives from itself")));
        }
    }
    Ok(order)
}

fn unknown(id: PipelineId) -> CrucibleError {
    log::error!("Unknown pipeline {:?}", id);
    CrucibleError::ResourceNotFound {
        what: format!("pipeline {id:?}"),
    }
}

impl std::fmt::Debug for GraphicsPipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipelineManager")
            .field("id", &self.id)
            .field("pipelines", &self.n_pipelines())
            .finish()
    }
}

impl Drop for GraphicsPipelineManager {
    fn drop(&mut self) {
        let state = lock_state(&self.state);
        for entry in state.pipelines.values() {
            if let Some(baked) = &entry.baked {
                self.device.native().destroy_pipeline(baked.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeCall;
    use crate::render_pass::RenderPass;
    use crate::tests::Harness;

    fn setup() -> (Harness, Arc<RenderPass>, Arc<GraphicsPipelineManager>) {
        let harness = Harness::new();
        let render_pass = harness.color_pass(vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let manager = GraphicsPipelineManager::create(&harness.device, None, MtSafety::InheritFromParent).unwrap();
        (harness, render_pass, manager)
    }

    fn destroyed(harness: &Harness) -> Vec<vk::Pipeline> {
        harness
            .headless
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                NativeCall::DestroyPipeline(pipeline) => Some(pipeline),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_outstanding_pipelines_bake_in_one_batch() {
        let (harness, render_pass, manager) = setup();
        let ids: Vec<PipelineId> = [vk::CompareOp::LESS, vk::CompareOp::EQUAL, vk::CompareOp::GREATER]
            .into_iter()
            .map(|op| {
                let mut info = harness.pipeline_info(&render_pass, 0);
                info.set_depth_test(true, op);
                manager.add_pipeline(&info).unwrap()
            })
            .collect();
        assert!(manager.has_outstanding_bakes());

        manager.bake().unwrap();
        assert!(!manager.has_outstanding_bakes());
        assert_eq!(
            harness.count_calls(|call| matches!(call, NativeCall::CreateGraphicsPipelines { descs, .. } if descs.len() == 3)),
            1
        );

        let handles: Vec<vk::Pipeline> = ids.iter().map(|id| manager.get_pipeline(*id).unwrap()).collect();
        assert!(handles.iter().all(|h| *h != vk::Pipeline::null()));
        assert!(handles[0] != handles[1] && handles[1] != handles[2]);
        harness.assert_valid();
    }

    #[test]
    fn test_get_pipeline_bakes_on_demand() {
        let (harness, render_pass, manager) = setup();
        let id = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        assert_ne!(manager.get_pipeline(id).unwrap(), vk::Pipeline::null());
        assert_eq!(manager.get_pipeline(id).unwrap(), manager.get_pipeline(id).unwrap());
        assert_eq!(
            harness.count_calls(|call| matches!(call, NativeCall::CreateGraphicsPipelines { .. })),
            1
        );
    }

    #[test]
    fn test_failed_batch_is_rolled_back() {
        let (harness, render_pass, manager) = setup();
        let ids: Vec<PipelineId> = (0..3)
            .map(|_| manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap())
            .collect();

        harness.headless.fail_pipeline_in_next_batch(1);
        match manager.bake() {
            Err(CrucibleError::BatchFailed { failed_index, result }) => {
                assert_eq!(failed_index, 1);
                assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            other => panic!("expected a failed batch, got {other:?}"),
        }
        assert_eq!(destroyed(&harness).len(), 2);
        assert!(manager.has_outstanding_bakes());

        manager.bake().unwrap();
        assert!(ids.iter().all(|id| manager.get_pipeline(*id).is_ok()));
        assert_eq!(manager.n_pipelines(), 3);
    }

    #[test]
    fn test_short_batch_releases_returned_pipelines() {
        let (harness, render_pass, manager) = setup();
        for _ in 0..3 {
            manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        }
        let n_live = harness.headless.n_live_objects();

        harness.headless.short_next_pipeline_batch();
        assert!(matches!(manager.bake(), Err(CrucibleError::Api(vk::Result::ERROR_UNKNOWN))));
        assert_eq!(destroyed(&harness).len(), 2);
        assert!(manager.has_outstanding_bakes());

        // Only the shared empty layout outlives the failed batch
        assert!(harness.headless.n_live_objects() <= n_live + 1);
        manager.bake().unwrap();
    }

    #[test]
    fn test_derivative_in_same_batch_links_by_index() {
        let (harness, render_pass, manager) = setup();
        let mut parent = harness.pipeline_info(&render_pass, 0);
        parent.set_allow_derivatives(true);
        let parent_id = manager.add_pipeline(&parent).unwrap();

        let mut child = harness.pipeline_info(&render_pass, 0);
        child.set_base_pipeline(BasePipeline::Id(parent_id));
        let child_id = manager.add_pipeline(&child).unwrap();
        manager.bake().unwrap();

        let desc = manager.get_pipeline_desc(child_id).unwrap();
        assert_eq!(desc.base, PipelineBase::Index(0));
        assert!(desc.flags.contains(vk::PipelineCreateFlags::DERIVATIVE));
        assert!(manager
            .get_pipeline_desc(parent_id)
            .unwrap()
            .flags
            .contains(vk::PipelineCreateFlags::ALLOW_DERIVATIVES));
        harness.assert_valid();
    }

    #[test]
    fn test_derivative_of_baked_pipeline_links_by_handle() {
        let (harness, render_pass, manager) = setup();
        let mut parent = harness.pipeline_info(&render_pass, 0);
        parent.set_allow_derivatives(true);
        let parent_id = manager.add_pipeline(&parent).unwrap();
        let parent_handle = manager.get_pipeline(parent_id).unwrap();

        let mut child = harness.pipeline_info(&render_pass, 0);
        child.set_base_pipeline(BasePipeline::Id(parent_id));
        let child_id = manager.add_pipeline(&child).unwrap();

        assert_eq!(
            manager.get_pipeline_desc(child_id).unwrap().base,
            PipelineBase::Handle(parent_handle)
        );
        harness.assert_valid();
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_base_must_allow_derivatives() {
        let (harness, render_pass, manager) = setup();
        let parent_id = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        let mut child = harness.pipeline_info(&render_pass, 0);
        child.set_base_pipeline(BasePipeline::Id(parent_id));
        manager.add_pipeline(&child).unwrap();

        assert!(manager.bake().unwrap_err().is_contract_violation());
        assert_eq!(
            harness.count_calls(|call| matches!(call, NativeCall::CreateGraphicsPipelines { .. })),
            0
        );
    }

    #[test]
    fn test_update_keeps_id_and_replaces_handle() {
        let (harness, render_pass, manager) = setup();
        let id = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        let before = manager.get_pipeline(id).unwrap();

        let mut changed = harness.pipeline_info(&render_pass, 0);
        changed.set_depth_test(true, vk::CompareOp::LESS);
        manager.update_pipeline(id, &changed).unwrap();
        assert!(manager.has_outstanding_bakes());

        let after = manager.get_pipeline(id).unwrap();
        assert_ne!(before, after);
        assert_eq!(destroyed(&harness), vec![before]);
        assert!(manager.get_pipeline_desc(id).unwrap().depth_test);
        assert!(manager.get_pipeline_create_info(id).is_some_and(|info| info == changed));
    }

    #[test]
    fn test_deleted_id_is_unknown() {
        let (harness, render_pass, manager) = setup();
        let id = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        let handle = manager.get_pipeline(id).unwrap();

        manager.delete_pipeline(id).unwrap();
        assert_eq!(manager.n_pipelines(), 0);
        assert_eq!(destroyed(&harness), vec![handle]);
        assert!(matches!(
            manager.get_pipeline(id),
            Err(CrucibleError::ResourceNotFound { .. })
        ));
        assert!(manager.delete_pipeline(id).is_err());
    }

    #[test]
    fn test_pipelines_without_layout_share_an_empty_one() {
        let (harness, render_pass, manager) = setup();
        let a = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        let b = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();

        let layout_a = manager.get_pipeline_layout(a).unwrap();
        let layout_b = manager.get_pipeline_layout(b).unwrap();
        assert!(Arc::ptr_eq(&layout_a, &layout_b));
        assert!(layout_a.desc().push_constant_ranges.is_empty());
        assert!(layout_a.desc().set_layouts.is_empty());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_proxies_cannot_be_added() {
        let (harness, _render_pass, manager) = setup();
        let proxy = GraphicsPipelineCreateInfo::new_proxy(&harness.device);
        assert!(manager.add_pipeline(&proxy).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_dropping_the_manager_destroys_its_pipelines() {
        let (harness, render_pass, manager) = setup();
        let id = manager.add_pipeline(&harness.pipeline_info(&render_pass, 0)).unwrap();
        let handle = manager.get_pipeline(id).unwrap();
        drop(manager);
        assert_eq!(destroyed(&harness), vec![handle]);
        harness.assert_valid();
    }
}
