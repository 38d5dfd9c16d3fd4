//! Pipeline cache
//!
//! The blob format belongs to the driver; it is stored and loaded verbatim.

use ash::vk;
use std::path::Path;
use std::sync::Arc;

use crate::core::error::{api_error, CrucibleError, CrucibleResult};
use crate::core::mt::{MtLock, MtSafety};
use crate::device::Device;
use crate::foundation::collections::ObjectId;
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::resources::{impl_debug_named, raw};

/// Driver pipeline cache
pub struct PipelineCache {
    id: ObjectId,
    device: Arc<Device>,
    handle: vk::PipelineCache,
    lock: MtLock,
    label: DebugLabel,
    _registration: Registration,
}

impl PipelineCache {
    /// Create a cache seeded with `initial_data` (may be empty)
    pub fn create(device: &Arc<Device>, initial_data: &[u8], mt_safety: MtSafety) -> CrucibleResult<Arc<Self>> {
        let handle = device
            .native()
            .create_pipeline_cache(initial_data)
            .map_err(|e| api_error("create_pipeline_cache", e))?;

        log::debug!("Pipeline cache created ({} bytes of seed data)", initial_data.len());

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                device: Arc::clone(device),
                handle,
                lock: MtLock::new(device.resolve_mt_safety(mt_safety)),
                label: DebugLabel::for_handle(vk::ObjectType::PIPELINE_CACHE, raw(handle)),
                _registration: Registration::new(ObjectKind::PipelineCache, id, weak.clone()),
            }
        }))
    }

    /// Create a cache from a blob on disk; a missing file yields an empty cache
    pub fn load_from_file(device: &Arc<Device>, path: impl AsRef<Path>, mt_safety: MtSafety) -> CrucibleResult<Arc<Self>> {
        let path = path.as_ref();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No pipeline cache at {}, starting empty", path.display());
                Vec::new()
            }
            Err(err) => {
                log::error!("Failed to read pipeline cache {}: {}", path.display(), err);
                return Err(crate::config::ConfigError::Io(err).into());
            }
        };
        Self::create(device, &data, mt_safety)
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native handle
    pub fn handle(&self) -> vk::PipelineCache {
        self.handle
    }

    /// Serialized cache contents
    pub fn data(&self) -> CrucibleResult<Vec<u8>> {
        let _guard = self.lock.lock();
        self.device
            .native()
            .pipeline_cache_data(self.handle)
            .map_err(|e| api_error("get_pipeline_cache_data", e))
    }

    /// Merge other caches into this one
    pub fn merge(&self, sources: &[&Arc<PipelineCache>]) -> CrucibleResult<()> {
        if sources.iter().any(|s| s.id == self.id) {
            log::error!("Pipeline cache {} cannot be merged into itself", self.id);
            return Err(crate::core::error::contract_violation("pipeline cache merged into itself"));
        }
        let handles: Vec<vk::PipelineCache> = sources.iter().map(|s| s.handle).collect();
        let _guard = self.lock.lock();
        self.device
            .native()
            .merge_pipeline_caches(self.handle, &handles)
            .map_err(|e| api_error("merge_pipeline_caches", e))
    }

    /// Write the serialized contents to `path`
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> CrucibleResult<()> {
        let path = path.as_ref();
        let data = self.data()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CrucibleError::Config(e.into()))?;
        }
        std::fs::write(path, &data).map_err(|e| {
            log::error!("Failed to write pipeline cache {}: {}", path.display(), e);
            CrucibleError::Config(e.into())
        })?;
        log::debug!("Pipeline cache saved to {} ({} bytes)", path.display(), data.len());
        Ok(())
    }
}

impl_debug_named!(PipelineCache);

impl std::fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PipelineCache({}, {:?})", self.id, self.handle)
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.device.native().destroy_pipeline_cache(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    #[test]
    fn test_cache_round_trips_through_file() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let cache = PipelineCache::create(&device, b"seed", MtSafety::Enabled).unwrap();
        let path = std::env::temp_dir().join(format!("crucible_cache_{}.bin", std::process::id()));

        cache.save_to_file(&path).unwrap();
        let reloaded = PipelineCache::load_from_file(&device, &path, MtSafety::Disabled).unwrap();
        assert_eq!(reloaded.data().unwrap(), cache.data().unwrap());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file_gives_empty_cache() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let cache = PipelineCache::load_from_file(&device, "/nonexistent/crucible.bin", MtSafety::Disabled).unwrap();
        assert!(cache.data().unwrap().is_empty());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_merge_into_self_rejected() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let cache = PipelineCache::create(&device, &[], MtSafety::Disabled).unwrap();
        assert!(cache.merge(&[&cache]).is_err());
    }
}
