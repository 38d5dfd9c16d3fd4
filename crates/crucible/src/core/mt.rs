//! Per-object opt-in locking
//!
//! Each wrapper decides at construction whether it serialises access to its
//! native handle. When a child operation also touches its parent pool, the
//! parent's lock is always taken first.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Thread-safety requested for a wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MtSafety {
    /// Serialise native calls made through this object
    Enabled,
    /// Caller guarantees the object is never used from two threads at once
    Disabled,
    /// Use the device's default
    #[default]
    InheritFromParent,
}

impl MtSafety {
    /// Resolve against the parent's setting
    pub fn resolve(self, parent_is_mt_safe: bool) -> bool {
        match self {
            Self::Enabled => true,
            Self::Disabled => false,
            Self::InheritFromParent => parent_is_mt_safe,
        }
    }
}

/// A mutex that only exists for MT-safe objects
#[derive(Debug, Default)]
pub struct MtLock {
    inner: Option<Mutex<()>>,
}

impl MtLock {
    /// Create a lock; `enabled == false` makes [`MtLock::lock`] a no-op
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Mutex::new(())),
        }
    }

    /// Whether this object is MT-safe
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Acquire the lock if the object is MT-safe
    pub fn lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.inner
            .as_ref()
            .map(|mutex| mutex.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Lock a state mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_resolve_inherits_from_parent() {
        assert!(MtSafety::InheritFromParent.resolve(true));
        assert!(!MtSafety::InheritFromParent.resolve(false));
        assert!(MtSafety::Enabled.resolve(false));
        assert!(!MtSafety::Disabled.resolve(true));
    }

    #[test]
    fn test_disabled_lock_is_noop() {
        let lock = MtLock::new(false);
        assert!(!lock.is_enabled());
        assert!(lock.lock().is_none());
    }

    #[test]
    fn test_enabled_lock_serialises_threads() {
        let lock = Arc::new(MtLock::new(true));
        let counter = Arc::new(Mutex::new(0u32));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = lock.lock();
                        *lock_state(&counter) += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock_state(&counter), 400);
    }
}
