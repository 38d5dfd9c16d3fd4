//! Logical device
//!
//! The shared surface every wrapper hangs off: the native entry-point table,
//! the device-level callback bus, the universal queues and the framework
//! configuration. Single- and multi-GPU devices differ only in
//! [`DeviceKind`]; there is no separate type per variant.

use std::sync::Arc;

use crate::core::config::FrameworkConfig;
use crate::core::error::{api_error, CrucibleError, CrucibleResult};
use crate::core::mt::MtSafety;
use crate::events::CallbackBus;
use crate::foundation::collections::ObjectId;
use crate::native::{AshDevice, DeviceCapabilities, HeadlessDevice, NativeDevice};
use crate::queue::Queue;
use crate::registry::{ObjectKind, Registration};

/// Single GPU or a linked device group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// One physical device
    SingleGpu,
    /// Several physical devices driven as one
    MultiGpu {
        /// Number of physical devices in the group
        physical_device_count: u32,
    },
}

/// Logical device wrapper
pub struct Device {
    id: ObjectId,
    native: Arc<dyn NativeDevice>,
    bus: Arc<CallbackBus>,
    kind: DeviceKind,
    config: FrameworkConfig,
    queues: Vec<Arc<Queue>>,
    _registration: Registration,
}

impl Device {
    /// Wrap an already created native device
    pub fn create(native: Arc<dyn NativeDevice>, config: FrameworkConfig) -> CrucibleResult<Arc<Self>> {
        config.validate().map_err(|reason| {
            log::error!("Invalid framework config: {}", reason);
            CrucibleError::Config(crate::config::ConfigError::Invalid(reason))
        })?;

        let caps = native.capabilities().clone();
        if caps.n_universal_queues == 0 {
            log::error!("Device {} exposes no universal queue", caps.device_name);
            return Err(CrucibleError::Unsupported(
                "device has no graphics+compute+transfer queue".to_string(),
            ));
        }

        let kind = if caps.physical_device_count > 1 {
            DeviceKind::MultiGpu {
                physical_device_count: caps.physical_device_count,
            }
        } else {
            DeviceKind::SingleGpu
        };

        let bus = Arc::new(CallbackBus::new());
        let queues = (0..caps.n_universal_queues)
            .map(|index| {
                Queue::new(
                    Arc::clone(&native),
                    Arc::clone(&bus),
                    caps.universal_queue_family,
                    index,
                    config.mt_safe_by_default,
                )
            })
            .collect();

        log::info!(
            "Device created: {} ({:?}, {} universal queue(s))",
            caps.device_name,
            kind,
            caps.n_universal_queues
        );

        Ok(Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            Self {
                id,
                native,
                bus,
                kind,
                config,
                queues,
                _registration: Registration::new(ObjectKind::Device, id, weak.clone()),
            }
        }))
    }

    /// Device backed by the software driver
    pub fn create_headless(config: FrameworkConfig) -> CrucibleResult<Arc<Self>> {
        Self::create(Arc::new(HeadlessDevice::new()), config)
    }

    /// Device backed by the first suitable Vulkan adapter
    pub fn create_vulkan(config: FrameworkConfig) -> CrucibleResult<Arc<Self>> {
        let native = AshDevice::new(&config)?;
        Self::create(Arc::new(native), config)
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Native entry points
    pub fn native(&self) -> &Arc<dyn NativeDevice> {
        &self.native
    }

    /// Device-level callback bus
    pub fn bus(&self) -> &Arc<CallbackBus> {
        &self.bus
    }

    /// Single or multi GPU
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Capabilities reported at creation
    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.native.capabilities()
    }

    /// Framework configuration the device was created with
    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    /// Whether debug names/tags reach the driver
    pub fn debug_labels_enabled(&self) -> bool {
        self.config.debug_labels && self.capabilities().supports_debug_utils
    }

    /// Default MT-safety for children of this device
    pub fn is_mt_safe_default(&self) -> bool {
        self.config.mt_safe_by_default
    }

    /// Resolve a child's requested MT-safety against the device default
    pub fn resolve_mt_safety(&self, requested: MtSafety) -> bool {
        requested.resolve(self.is_mt_safe_default())
    }

    /// Universal queue `index`
    pub fn universal_queue(&self, index: usize) -> Option<Arc<Queue>> {
        self.queues.get(index).cloned()
    }

    /// Number of universal queues
    pub fn n_universal_queues(&self) -> usize {
        self.queues.len()
    }

    /// Mask selecting every physical device of the group
    pub fn device_group_mask(&self) -> u32 {
        match self.kind {
            DeviceKind::SingleGpu => 1,
            DeviceKind::MultiGpu {
                physical_device_count,
            } => {
                if physical_device_count >= 32 {
                    u32::MAX
                } else {
                    (1u32 << physical_device_count) - 1
                }
            }
        }
    }

    /// Wait until every queue of the device is idle
    pub fn wait_idle(&self) -> CrucibleResult<()> {
        self.native
            .device_wait_idle()
            .map_err(|e| api_error("device_wait_idle", e))
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.capabilities().device_name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.native.device_wait_idle() {
            log::warn!("wait-idle before device teardown failed: {:?}", err);
        }
        log::debug!("Device {} destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::DeviceCapabilities;

    #[test]
    fn test_headless_device_is_single_gpu() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        assert_eq!(device.kind(), DeviceKind::SingleGpu);
        assert_eq!(device.device_group_mask(), 1);
        assert!(device.universal_queue(0).is_some());
        assert!(device.universal_queue(7).is_none());
    }

    #[test]
    fn test_device_group_mask_covers_all_gpus() {
        let caps = DeviceCapabilities {
            physical_device_count: 3,
            ..HeadlessDevice::default_capabilities()
        };
        let device = Device::create(
            Arc::new(HeadlessDevice::with_capabilities(caps)),
            FrameworkConfig::default(),
        )
        .unwrap();
        assert_eq!(
            device.kind(),
            DeviceKind::MultiGpu {
                physical_device_count: 3
            }
        );
        assert_eq!(device.device_group_mask(), 0b111);
    }

    #[test]
    fn test_mt_safety_inherits_config_default() {
        let device =
            Device::create_headless(FrameworkConfig::default().with_mt_safe_by_default(true)).unwrap();
        assert!(device.resolve_mt_safety(MtSafety::InheritFromParent));
        assert!(!device.resolve_mt_safety(MtSafety::Disabled));
    }

    #[test]
    fn test_debug_labels_require_driver_support() {
        let caps = DeviceCapabilities {
            supports_debug_utils: false,
            ..HeadlessDevice::default_capabilities()
        };
        let device = Device::create(
            Arc::new(HeadlessDevice::with_capabilities(caps)),
            FrameworkConfig::default(),
        )
        .unwrap();
        assert!(!device.debug_labels_enabled());
    }
}
