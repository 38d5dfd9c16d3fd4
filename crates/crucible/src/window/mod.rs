//! Windows
//!
//! A [`Window`] is a tagged variant over what the graphics stack can present
//! to, with a capability set in place of a type hierarchy:
//! - [`WindowKind::Dummy`]: nothing is shown, swapchains run headless
//! - [`WindowKind::DummyWithPngSnapshots`]: headless, and every presented
//!   frame is written to a numbered PNG file
//! - [`WindowKind::Platform`]: an OS window created elsewhere (not owned),
//!   reached through `raw-window-handle`
//!
//! Windows own nothing of the graphics stack. Each has its own callback bus
//! for close, present and keyboard events.

mod snapshot;

use bitflags::bitflags;
use raw_window_handle::{
    HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::config::FrameworkConfig;
use crate::core::error::{CrucibleError, CrucibleResult};
use crate::events::{CallbackArg, CallbackBus};
use crate::foundation::collections::ObjectId;
use crate::native::SurfaceTarget;
use crate::registry::{ObjectKind, Registration};
use crate::swapchain::Swapchain;

/// Platform-independent key identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId(pub u32);

impl KeyId {
    /// Escape
    pub const ESCAPE: Self = Self(27);
    /// Space bar
    pub const SPACE: Self = Self(32);
}

/// Window system behind a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlatform {
    /// No window system
    Dummy,
    /// No window system, frames saved as PNG
    DummyWithPngSnapshots,
    /// X11 through XCB
    Xcb,
    /// X11 through Xlib
    Xlib,
    /// Win32
    Win32,
    /// Wayland
    Wayland,
}

bitflags! {
    /// What a window can do
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WindowCapabilities: u32 {
        /// A native swapchain can present to it
        const CAN_PRESENT = 1 << 0;
        /// Swapchains for it are simulated without a surface
        const HEADLESS = 1 << 1;
        /// Presented frames are written to disk
        const SNAPSHOTS = 1 << 2;
    }
}

/// Concrete window variant
#[derive(Debug, Clone)]
pub enum WindowKind {
    /// Invisible window
    Dummy,
    /// Invisible window saving presented frames
    DummyWithPngSnapshots {
        /// Output directory
        directory: PathBuf,
        /// File name prefix
        prefix: String,
    },
    /// Externally created OS window
    Platform {
        /// Window system
        platform: WindowPlatform,
        /// Native handles
        target: SurfaceTarget,
    },
}

/// Window wrapper
pub struct Window {
    id: ObjectId,
    title: String,
    width: u32,
    height: u32,
    kind: WindowKind,
    bus: Arc<CallbackBus>,
    closed: AtomicBool,
    frame_counter: AtomicU64,
    _registration: Registration,
}

impl Window {
    fn build(title: &str, width: u32, height: u32, kind: WindowKind) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let id = ObjectId::next();
            log::debug!("Window {} '{}' created ({}x{}, {:?})", id, title, width, height, kind);
            Self {
                id,
                title: title.to_string(),
                width,
                height,
                kind,
                bus: Arc::new(CallbackBus::new()),
                closed: AtomicBool::new(false),
                frame_counter: AtomicU64::new(0),
                _registration: Registration::new(ObjectKind::Window, id, weak.clone()),
            }
        })
    }

    /// Invisible window
    pub fn create_dummy(title: &str, width: u32, height: u32) -> Arc<Self> {
        Self::build(title, width, height, WindowKind::Dummy)
    }

    /// Invisible window writing each presented frame to
    /// `<directory>/<prefix><frame:06>.png`
    pub fn create_with_png_snapshots(
        title: &str,
        width: u32,
        height: u32,
        directory: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> CrucibleResult<Arc<Self>> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(|e| {
            log::error!("Cannot create snapshot directory {}: {}", directory.display(), e);
            CrucibleError::Snapshot(format!("{}: {}", directory.display(), e))
        })?;

        Ok(Self::build(
            title,
            width,
            height,
            WindowKind::DummyWithPngSnapshots {
                directory,
                prefix: prefix.into(),
            },
        ))
    }

    /// Snapshot window using the framework configuration's output settings
    pub fn create_with_png_snapshots_from_config(
        title: &str,
        width: u32,
        height: u32,
        config: &FrameworkConfig,
    ) -> CrucibleResult<Arc<Self>> {
        Self::create_with_png_snapshots(
            title,
            width,
            height,
            config.snapshot_directory.clone(),
            config.snapshot_prefix.clone(),
        )
    }

    /// Wrap raw handles of a window created elsewhere
    pub fn from_raw_handles(
        title: &str,
        width: u32,
        height: u32,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> CrucibleResult<Arc<Self>> {
        let platform = match window {
            RawWindowHandle::Xcb(_) => WindowPlatform::Xcb,
            RawWindowHandle::Xlib(_) => WindowPlatform::Xlib,
            RawWindowHandle::Win32(_) => WindowPlatform::Win32,
            RawWindowHandle::Wayland(_) => WindowPlatform::Wayland,
            other => {
                log::error!("Unsupported window system: {:?}", other);
                return Err(CrucibleError::Unsupported(format!("window system {other:?}")));
            }
        };

        Ok(Self::build(
            title,
            width,
            height,
            WindowKind::Platform {
                platform,
                target: SurfaceTarget { display, window },
            },
        ))
    }

    /// Wrap a window from any windowing library
    ///
    /// The caller keeps `source` alive for as long as the returned window is
    /// used.
    pub fn from_window<W>(title: &str, width: u32, height: u32, source: &W) -> CrucibleResult<Arc<Self>>
    where
        W: HasRawWindowHandle + HasRawDisplayHandle,
    {
        Self::from_raw_handles(
            title,
            width,
            height,
            source.raw_display_handle(),
            source.raw_window_handle(),
        )
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Client area size
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Variant
    pub fn kind(&self) -> &WindowKind {
        &self.kind
    }

    /// Window system
    pub fn platform(&self) -> WindowPlatform {
        match &self.kind {
            WindowKind::Dummy => WindowPlatform::Dummy,
            WindowKind::DummyWithPngSnapshots { .. } => WindowPlatform::DummyWithPngSnapshots,
            WindowKind::Platform { platform, .. } => *platform,
        }
    }

    /// Capability set
    pub fn capabilities(&self) -> WindowCapabilities {
        match &self.kind {
            WindowKind::Dummy => WindowCapabilities::HEADLESS,
            WindowKind::DummyWithPngSnapshots { .. } => {
                WindowCapabilities::HEADLESS | WindowCapabilities::SNAPSHOTS
            }
            WindowKind::Platform { .. } => WindowCapabilities::CAN_PRESENT,
        }
    }

    /// Native handles for surface creation, for platform windows
    pub fn surface_target(&self) -> Option<SurfaceTarget> {
        match &self.kind {
            WindowKind::Platform { target, .. } => Some(*target),
            _ => None,
        }
    }

    /// Window event bus
    pub fn bus(&self) -> &Arc<CallbackBus> {
        &self.bus
    }

    /// Number of frames presented so far
    pub fn n_presented_frames(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    /// Whether [`Window::close`] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the window
    ///
    /// Fires `WindowAboutToClose`, then `WindowClosed`. Later calls do
    /// nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.callback(&CallbackArg::WindowAboutToClose { window: self.id });
        self.bus.callback(&CallbackArg::WindowClosed { window: self.id });
        log::debug!("Window {} closed", self.id);
    }

    /// Report a key release
    pub fn notify_keypress_released(&self, key: KeyId) {
        self.bus.callback(&CallbackArg::KeypressReleased { window: self.id, key });
    }

    /// Called by the queue after presenting `image_index` of `swapchain`
    pub(crate) fn on_present(&self, swapchain: &Swapchain, image_index: u32) -> CrucibleResult<()> {
        let frame = self.frame_counter.fetch_add(1, Ordering::SeqCst);

        if let WindowKind::DummyWithPngSnapshots { directory, prefix } = &self.kind {
            let path = directory.join(format!("{prefix}{frame:06}.png"));
            snapshot::write_png(swapchain, image_index, &path)?;
        }

        self.bus.callback(&CallbackArg::WindowPresented {
            window: self.id,
            image_index,
        });
        Ok(())
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("extent", &(self.width, self.height))
            .field("platform", &self.platform())
            .finish()
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CallbackId;
    use std::sync::Mutex;

    #[test]
    fn test_dummy_window_is_headless() {
        let window = Window::create_dummy("dummy", 640, 480);
        assert_eq!(window.platform(), WindowPlatform::Dummy);
        assert!(window.capabilities().contains(WindowCapabilities::HEADLESS));
        assert!(!window.capabilities().contains(WindowCapabilities::CAN_PRESENT));
        assert!(window.surface_target().is_none());
        assert_eq!(window.extent(), (640, 480));
    }

    #[test]
    fn test_close_fires_about_to_close_then_closed_once() {
        let window = Window::create_dummy("closing", 8, 8);
        let events = Arc::new(Mutex::new(Vec::new()));
        for id in [CallbackId::WindowClosed, CallbackId::WindowAboutToClose] {
            let events = Arc::clone(&events);
            window.bus().register(id, move |arg| events.lock().unwrap().push(arg.id()));
        }

        window.close();
        window.close();
        assert_eq!(
            *events.lock().unwrap(),
            vec![CallbackId::WindowAboutToClose, CallbackId::WindowClosed]
        );
        assert!(window.is_closed());
    }

    #[test]
    fn test_keypress_reaches_listeners() {
        let window = Window::create_dummy("keys", 8, 8);
        let keys = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&keys);
        window.bus().register(CallbackId::KeypressReleased, move |arg| {
            if let CallbackArg::KeypressReleased { key, .. } = arg {
                sink.lock().unwrap().push(*key);
            }
        });

        window.notify_keypress_released(KeyId::ESCAPE);
        assert_eq!(*keys.lock().unwrap(), vec![KeyId::ESCAPE]);
    }

    #[test]
    fn test_unsupported_window_system_is_rejected() {
        let display = RawDisplayHandle::Android(raw_window_handle::AndroidDisplayHandle::empty());
        let window = RawWindowHandle::AndroidNdk(raw_window_handle::AndroidNdkWindowHandle::empty());
        assert!(matches!(
            Window::from_raw_handles("android", 8, 8, display, window),
            Err(CrucibleError::Unsupported(_))
        ));
    }
}
