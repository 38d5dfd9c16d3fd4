//! Callback bus
//!
//! In-process fan-out of named events between wrappers:
//! - Listeners register per topic and get a token back for unregistration
//! - Delivery is synchronous, on the thread that fires the event, in
//!   registration order
//! - The topic table is not locked while listeners run, so a listener may
//!   register further listeners; it must not unregister itself
//!
//! Queues fire [`CallbackId::PresentRequestIssued`] on the device bus,
//! command buffers fire [`CallbackId::PipelineBarrierRecorded`] there too, and
//! every window owns a bus for its close, present and keyboard events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::command::PipelineBarrier;
use crate::core::mt::lock_state;
use crate::foundation::collections::ObjectId;
use crate::window::KeyId;

/// Event topic identification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackId {
    /// A queue is about to present a swapchain image
    PresentRequestIssued,
    /// A window is about to close; swapchains must let go of it
    WindowAboutToClose,
    /// A window has closed
    WindowClosed,
    /// A window received a presented frame
    WindowPresented,
    /// A pipeline barrier is about to be recorded into a command buffer
    PipelineBarrierRecorded,
    /// A key was released while a window had focus
    KeypressReleased,
}

/// Arguments of a present request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentRequest {
    /// Queue issuing the present
    pub queue: ObjectId,
    /// Swapchain being presented
    pub swapchain: ObjectId,
    /// Index of the presented image
    pub image_index: u32,
}

/// Event payload, one variant per topic
#[derive(Debug, Clone)]
pub enum CallbackArg {
    /// See [`CallbackId::PresentRequestIssued`]
    PresentRequestIssued(PresentRequest),
    /// See [`CallbackId::WindowAboutToClose`]
    WindowAboutToClose {
        /// Closing window
        window: ObjectId,
    },
    /// See [`CallbackId::WindowClosed`]
    WindowClosed {
        /// Closed window
        window: ObjectId,
    },
    /// See [`CallbackId::WindowPresented`]
    WindowPresented {
        /// Window that received the frame
        window: ObjectId,
        /// Image index that was shown
        image_index: u32,
    },
    /// See [`CallbackId::PipelineBarrierRecorded`]
    PipelineBarrierRecorded {
        /// Command buffer receiving the barrier
        command_buffer: ObjectId,
        /// Full barrier arguments
        barrier: Arc<PipelineBarrier>,
    },
    /// See [`CallbackId::KeypressReleased`]
    KeypressReleased {
        /// Window with focus
        window: ObjectId,
        /// Released key
        key: KeyId,
    },
}

impl CallbackArg {
    /// Topic this payload belongs to
    pub fn id(&self) -> CallbackId {
        match self {
            Self::PresentRequestIssued(_) => CallbackId::PresentRequestIssued,
            Self::WindowAboutToClose { .. } => CallbackId::WindowAboutToClose,
            Self::WindowClosed { .. } => CallbackId::WindowClosed,
            Self::WindowPresented { .. } => CallbackId::WindowPresented,
            Self::PipelineBarrierRecorded { .. } => CallbackId::PipelineBarrierRecorded,
            Self::KeypressReleased { .. } => CallbackId::KeypressReleased,
        }
    }
}

/// Listener callable
pub type CallbackHandler = Arc<dyn Fn(&CallbackArg) + Send + Sync>;

/// Receipt of a registration, needed to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    id: CallbackId,
    serial: u64,
}

impl SubscriptionToken {
    /// Topic the listener was registered for
    pub fn callback_id(&self) -> CallbackId {
        self.id
    }
}

/// Event bus with per-topic listener lists
#[derive(Default)]
pub struct CallbackBus {
    topics: Mutex<HashMap<CallbackId, Vec<(u64, CallbackHandler)>>>,
    next_serial: AtomicU64,
}

impl CallbackBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for `id`
    pub fn register<F>(&self, id: CallbackId, handler: F) -> SubscriptionToken
    where
        F: Fn(&CallbackArg) + Send + Sync + 'static,
    {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        lock_state(&self.topics)
            .entry(id)
            .or_default()
            .push((serial, Arc::new(handler)));

        log::trace!("Registered listener {} for {:?}", serial, id);
        SubscriptionToken { id, serial }
    }

    /// Remove a listener; returns false if the token was already used
    pub fn unregister(&self, token: SubscriptionToken) -> bool {
        let mut topics = lock_state(&self.topics);
        let Some(listeners) = topics.get_mut(&token.id) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|(serial, _)| *serial != token.serial);
        before != listeners.len()
    }

    /// Deliver `arg` to every listener of its topic
    pub fn callback(&self, arg: &CallbackArg) {
        let listeners: Vec<CallbackHandler> = lock_state(&self.topics)
            .get(&arg.id())
            .map(|listeners| listeners.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(arg);
        }
    }

    /// Number of listeners currently registered for `id`
    pub fn n_subscribers(&self, id: CallbackId) -> usize {
        lock_state(&self.topics).get(&id).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for CallbackBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = lock_state(&self.topics);
        f.debug_struct("CallbackBus")
            .field("topics", &topics.iter().map(|(id, l)| (*id, l.len())).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn present(swapchain: ObjectId) -> CallbackArg {
        CallbackArg::PresentRequestIssued(PresentRequest {
            queue: ObjectId::next(),
            swapchain,
            image_index: 0,
        })
    }

    #[test]
    fn test_immediate_dispatch() {
        let bus = CallbackBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.register(CallbackId::PresentRequestIssued, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.callback(&present(ObjectId::next()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_matching_topic_is_notified() {
        let bus = CallbackBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.register(CallbackId::WindowClosed, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.callback(&present(ObjectId::next()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = CallbackBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let order = Arc::clone(&order);
            bus.register(CallbackId::WindowAboutToClose, move |_| {
                lock_state(&order).push(tag);
            });
        }

        bus.callback(&CallbackArg::WindowAboutToClose { window: ObjectId::next() });
        assert_eq!(*lock_state(&order), vec![0, 1, 2]);
    }

    #[test]
    fn test_unregistration_is_deterministic() {
        let bus = CallbackBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = bus.register(CallbackId::PresentRequestIssued, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unregister(token));
        assert!(!bus.unregister(token));
        assert_eq!(bus.n_subscribers(CallbackId::PresentRequestIssued), 0);

        bus.callback(&present(ObjectId::next()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_register_another_listener() {
        let bus = Arc::new(CallbackBus::new());
        let inner_bus = Arc::clone(&bus);
        bus.register(CallbackId::KeypressReleased, move |_| {
            inner_bus.register(CallbackId::WindowClosed, |_| {});
        });

        bus.callback(&CallbackArg::KeypressReleased {
            window: ObjectId::next(),
            key: KeyId(32),
        });
        assert_eq!(bus.n_subscribers(CallbackId::WindowClosed), 1);
    }
}
