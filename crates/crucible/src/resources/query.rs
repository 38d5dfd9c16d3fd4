use ash::vk;
use std::sync::Arc;

use crate::core::error::{api_error, CrucibleResult};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::native::QueryPoolDesc;
use crate::registry::{DebugLabel, ObjectKind, Registration};

use super::{impl_debug_named, raw};

/// Pool of GPU queries
pub struct QueryPool {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::QueryPool,
    desc: QueryPoolDesc,
    label: DebugLabel,
    _registration: Registration,
}

impl QueryPool {
    /// Create a pool of `query_count` queries
    pub fn create(
        device: &Arc<Device>,
        query_type: vk::QueryType,
        query_count: u32,
        pipeline_statistics: vk::QueryPipelineStatisticFlags,
    ) -> CrucibleResult<Arc<Self>> {
        let desc = QueryPoolDesc {
            query_type,
            query_count,
            pipeline_statistics,
        };
        let handle = device
            .native()
            .create_query_pool(&desc)
            .map_err(|e| api_error("create_query_pool", e))?;

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                desc,
                label: DebugLabel::for_handle(vk::ObjectType::QUERY_POOL, raw(handle)),
                _registration: Registration::new(ObjectKind::QueryPool, id, weak.clone()),
            }
        }))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    /// Query type
    pub fn query_type(&self) -> vk::QueryType {
        self.desc.query_type
    }

    /// Number of queries
    pub fn query_count(&self) -> u32 {
        self.desc.query_count
    }
}

impl_debug_named!(QueryPool);

impl std::fmt::Debug for QueryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPool")
            .field("id", &self.id)
            .field("type", &self.desc.query_type)
            .field("count", &self.desc.query_count)
            .finish()
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        self.device.native().destroy_query_pool(self.handle);
    }
}
