//! Object registry and debug labels
//!
//! Every wrapper registers itself here on construction and unregisters when
//! dropped, owning or not. The registry only keeps weak references, so it
//! never extends an object's lifetime; tooling can use it to enumerate what
//! is alive per [`ObjectKind`].

mod debug_label;

pub use debug_label::{DebugLabel, DebugNamed};

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::core::mt::lock_state;
use crate::foundation::collections::ObjectId;

/// Kind of a registered wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Buffer wrapper
    Buffer,
    /// Command buffer (primary or secondary)
    CommandBuffer,
    /// Command pool
    CommandPool,
    /// Descriptor set (always non-owning)
    DescriptorSet,
    /// Logical device
    Device,
    /// Event
    Event,
    /// Fence
    Fence,
    /// Framebuffer
    Framebuffer,
    /// Graphics pipeline manager
    GraphicsPipelineManager,
    /// Image
    Image,
    /// Image view
    ImageView,
    /// Pipeline cache
    PipelineCache,
    /// Pipeline layout
    PipelineLayout,
    /// Query pool
    QueryPool,
    /// Queue
    Queue,
    /// Render pass
    RenderPass,
    /// Rendering surface
    RenderingSurface,
    /// Semaphore
    Semaphore,
    /// Shader module
    ShaderModule,
    /// Swapchain
    Swapchain,
    /// Window
    Window,
}

type Entry = (ObjectId, Weak<dyn Any + Send + Sync>);

/// Process-wide weak index of live wrappers
#[derive(Default)]
pub struct ObjectRegistry {
    entries: Mutex<HashMap<ObjectKind, Vec<Entry>>>,
}

impl ObjectRegistry {
    /// The process-wide registry
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<ObjectRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::default)
    }

    fn insert(&self, kind: ObjectKind, id: ObjectId, object: Weak<dyn Any + Send + Sync>) {
        lock_state(&self.entries).entry(kind).or_default().push((id, object));
        log::trace!("Registered {:?} {}", kind, id);
    }

    fn remove(&self, kind: ObjectKind, id: ObjectId) {
        let mut entries = lock_state(&self.entries);
        if let Some(list) = entries.get_mut(&kind) {
            list.retain(|(entry_id, _)| *entry_id != id);
        }
        log::trace!("Unregistered {:?} {}", kind, id);
    }

    /// Whether the object with `id` is registered under `kind`
    pub fn contains(&self, kind: ObjectKind, id: ObjectId) -> bool {
        lock_state(&self.entries)
            .get(&kind)
            .is_some_and(|list| list.iter().any(|(entry_id, _)| *entry_id == id))
    }

    /// Number of registered objects of `kind`
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        lock_state(&self.entries).get(&kind).map_or(0, Vec::len)
    }

    /// Strong references to every live object of `kind` whose type is `T`
    pub fn live_objects<T: Any + Send + Sync>(&self, kind: ObjectKind) -> Vec<Arc<T>> {
        let candidates: Vec<Weak<dyn Any + Send + Sync>> = lock_state(&self.entries)
            .get(&kind)
            .map(|list| list.iter().map(|(_, weak)| weak.clone()).collect())
            .unwrap_or_default();

        candidates
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .filter_map(|object| object.downcast::<T>().ok())
            .collect()
    }
}

/// Registry membership of one wrapper; unregisters on drop
pub struct Registration {
    kind: ObjectKind,
    id: ObjectId,
}

impl Registration {
    /// Register `object` under `kind` with the global registry
    pub fn new<T: Any + Send + Sync>(kind: ObjectKind, id: ObjectId, object: Weak<T>) -> Self {
        let object: Weak<dyn Any + Send + Sync> = object;
        ObjectRegistry::global().insert(kind, id, object);
        Self { kind, id }
    }

    /// Kind the object is registered under
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// ID the object is registered under
    pub fn id(&self) -> ObjectId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        ObjectRegistry::global().remove(self.kind, self.id);
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        registration: Registration,
        value: u32,
    }

    fn probe(value: u32) -> Arc<Probe> {
        Arc::new_cyclic(|weak| Probe {
            registration: Registration::new(ObjectKind::Event, ObjectId::next(), weak.clone()),
            value,
        })
    }

    #[test]
    fn test_registration_follows_object_lifetime() {
        let object = probe(7);
        let id = object.registration.id();
        assert!(ObjectRegistry::global().contains(ObjectKind::Event, id));

        drop(object);
        assert!(!ObjectRegistry::global().contains(ObjectKind::Event, id));
    }

    #[test]
    fn test_live_objects_downcast() {
        let object = probe(42);
        let found = ObjectRegistry::global()
            .live_objects::<Probe>(ObjectKind::Event)
            .into_iter()
            .any(|p| Arc::ptr_eq(&p, &object) && p.value == 42);
        assert!(found);
    }

    #[test]
    fn test_registry_holds_no_ownership() {
        let object = probe(1);
        let weak = Arc::downgrade(&object);
        drop(object);
        assert!(weak.upgrade().is_none());
    }
}
