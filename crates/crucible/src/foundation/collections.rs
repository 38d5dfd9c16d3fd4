//! Specialized collection types

pub use slotmap::{SecondaryMap, SlotMap};

slotmap::new_key_type! {
    /// Stable identifier of a pipeline owned by a pipeline manager
    ///
    /// The ID survives re-bakes of the pipeline; only deleting the pipeline
    /// invalidates it.
    pub struct PipelineId;
}

/// Process-unique identifier handed out to every wrapper object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocate the next unused object ID
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value of the ID
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ids_are_unique_and_increasing() {
        let a = ObjectId::next();
        let b = ObjectId::next();
        assert_ne!(a, b);
        assert!(b.raw() > a.raw());
    }

    #[test]
    fn test_pipeline_ids_survive_other_removals() {
        let mut map: SlotMap<PipelineId, u32> = SlotMap::with_key();
        let first = map.insert(1);
        let second = map.insert(2);
        map.remove(first);
        assert_eq!(map.get(second), Some(&2));
        assert!(map.get(first).is_none());
    }
}
