//! Swapchains
//!
//! A swapchain counts acquires and presents. Presents are counted through
//! `PresentRequestIssued` on the device bus, which every queue fires before
//! presenting, so the count is right whichever queue presents. Tearing down
//! a swapchain with unpresented acquires is a contract violation.
//!
//! Swapchains of headless windows have no native swapchain: their images are
//! ordinary images and acquisition cycles through them in order.

use ash::vk;
use std::sync::{Arc, Mutex, Weak};

use crate::core::error::{api_error, contract_violation, ensure_contract, CrucibleError, CrucibleResult};
use crate::core::mt::{lock_state, MtLock, MtSafety};
use crate::device::Device;
use crate::events::{CallbackArg, CallbackId, SubscriptionToken};
use crate::foundation::collections::ObjectId;
use crate::native::{ImageDesc, SwapchainDesc};
use crate::registry::{DebugLabel, ObjectKind, Registration};
use crate::resources::{impl_debug_named, raw, Fence, Image, ImageView, Semaphore};
use crate::window::{Window, WindowCapabilities};

/// Swapchain creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainCreateInfo {
    /// Requested image count; the window or surface default when `None`
    pub n_images: Option<u32>,
    /// Preferred image format
    pub format: vk::Format,
    /// Preferred color space
    pub color_space: vk::ColorSpaceKHR,
    /// Image usage
    pub usage: vk::ImageUsageFlags,
    /// Preferred present mode; FIFO is used when unavailable
    pub present_mode: vk::PresentModeKHR,
}

impl Default for SwapchainCreateInfo {
    fn default() -> Self {
        Self {
            n_images: None,
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            present_mode: vk::PresentModeKHR::FIFO,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    n_acquired: u64,
    n_presented: u64,
    last_acquired: Option<u32>,
    next_headless_index: u32,
}

#[derive(Debug, Default)]
struct NativeHandles {
    swapchain: vk::SwapchainKHR,
    surface: vk::SurfaceKHR,
    torn_down: bool,
}

/// Swapchain wrapper
pub struct Swapchain {
    id: ObjectId,
    device: Arc<Device>,
    window: Arc<Window>,
    headless: bool,
    format: vk::Format,
    extent: (u32, u32),
    images: Vec<Arc<Image>>,
    views: Vec<Arc<ImageView>>,
    acquire_fence: Arc<Fence>,
    lock: MtLock,
    counters: Mutex<Counters>,
    native: Mutex<NativeHandles>,
    present_token: SubscriptionToken,
    close_token: SubscriptionToken,
    label: DebugLabel,
    _registration: Registration,
}

impl Swapchain {
    /// Create a swapchain presenting to `window`
    pub fn create(
        device: &Arc<Device>,
        window: &Arc<Window>,
        info: SwapchainCreateInfo,
        mt_safety: MtSafety,
    ) -> CrucibleResult<Arc<Self>> {
        ensure_contract!(!window.is_closed(), "window {} is closed", window.id());

        let headless = window.capabilities().contains(WindowCapabilities::HEADLESS);
        let (native, format, extent, images) = if headless {
            Self::create_headless_images(device, window, &info)?
        } else {
            Self::create_native(device, window, &info)?
        };

        let views = images
            .iter()
            .map(ImageView::create_2d)
            .collect::<CrucibleResult<Vec<_>>>()?;
        let acquire_fence = Fence::create(device, false)?;

        log::info!(
            "Swapchain created: {} image(s) {:?} {}x{}{}",
            images.len(),
            format,
            extent.0,
            extent.1,
            if headless { " (headless)" } else { "" }
        );

        let destroy_before_window = device.config().destroy_swapchain_before_window;
        let label = if native.swapchain == vk::SwapchainKHR::null() {
            DebugLabel::default()
        } else {
            DebugLabel::for_handle(vk::ObjectType::SWAPCHAIN_KHR, raw(native.swapchain))
        };

        Ok(Arc::new_cyclic(|weak: &Weak<Self>| {
            let id = ObjectId::next();

            let presented = weak.clone();
            let present_token = device.bus().register(CallbackId::PresentRequestIssued, move |arg| {
                if let CallbackArg::PresentRequestIssued(request) = arg {
                    if request.swapchain == id {
                        if let Some(swapchain) = presented.upgrade() {
                            swapchain.on_present_request(request.image_index);
                        }
                    }
                }
            });

            let closing = weak.clone();
            let close_token = window.bus().register(CallbackId::WindowAboutToClose, move |_| {
                if !destroy_before_window {
                    return;
                }
                if let Some(swapchain) = closing.upgrade() {
                    log::debug!("Window closing, releasing swapchain {}", id);
                    swapchain.release_native();
                }
            });

            Self {
                id,
                device: Arc::clone(device),
                window: Arc::clone(window),
                headless,
                format,
                extent,
                images,
                views,
                acquire_fence,
                lock: MtLock::new(device.resolve_mt_safety(mt_safety)),
                counters: Mutex::new(Counters::default()),
                native: Mutex::new(native),
                present_token,
                close_token,
                label,
                _registration: Registration::new(ObjectKind::Swapchain, id, weak.clone()),
            }
        }))
    }

    fn create_headless_images(
        device: &Arc<Device>,
        window: &Window,
        info: &SwapchainCreateInfo,
    ) -> CrucibleResult<(NativeHandles, vk::Format, (u32, u32), Vec<Arc<Image>>)> {
        let n_images = info.n_images.unwrap_or(device.config().headless_image_count);
        ensure_contract!(n_images > 0, "a swapchain needs at least one image");

        let extent = window.extent();
        let desc = ImageDesc {
            usage: info.usage | vk::ImageUsageFlags::TRANSFER_SRC,
            ..ImageDesc::new_2d(info.format, extent.0, extent.1, info.usage)
        };
        let images = (0..n_images)
            .map(|_| Image::create(device, desc))
            .collect::<CrucibleResult<Vec<_>>>()?;

        Ok((NativeHandles::default(), info.format, extent, images))
    }

    fn create_native(
        device: &Arc<Device>,
        window: &Window,
        info: &SwapchainCreateInfo,
    ) -> CrucibleResult<(NativeHandles, vk::Format, (u32, u32), Vec<Arc<Image>>)> {
        let Some(target) = window.surface_target() else {
            return Err(CrucibleError::Unsupported(format!(
                "window {} cannot present",
                window.id()
            )));
        };

        let surface = device
            .native()
            .create_surface(&target)
            .map_err(|e| api_error("create_surface", e))?;

        match Self::create_on_surface(device, window, info, surface) {
            Ok((swapchain, format, extent, images)) => Ok((
                NativeHandles {
                    swapchain,
                    surface,
                    torn_down: false,
                },
                format,
                extent,
                images,
            )),
            Err(err) => {
                device.native().destroy_surface(surface);
                Err(err)
            }
        }
    }

    fn create_on_surface(
        device: &Arc<Device>,
        window: &Window,
        info: &SwapchainCreateInfo,
        surface: vk::SurfaceKHR,
    ) -> CrucibleResult<(vk::SwapchainKHR, vk::Format, (u32, u32), Vec<Arc<Image>>)> {
        let native = device.native();
        let props = native
            .surface_properties(surface)
            .map_err(|e| api_error("get_physical_device_surface_capabilities", e))?;

        // Preferred format, else whatever the surface lists first
        let (format, color_space) = props
            .formats
            .iter()
            .copied()
            .find(|&(f, c)| f == info.format && c == info.color_space)
            .or_else(|| props.formats.first().copied())
            .ok_or_else(|| CrucibleError::Unsupported("surface reports no formats".to_string()))?;

        let present_mode = if props.present_modes.contains(&info.present_mode) {
            info.present_mode
        } else {
            vk::PresentModeKHR::FIFO
        };

        let max_images = if props.max_image_count == 0 {
            u32::MAX
        } else {
            props.max_image_count
        };
        let n_images = info
            .n_images
            .unwrap_or(props.min_image_count + 1)
            .clamp(props.min_image_count, max_images);

        let extent = props.current_extent.unwrap_or_else(|| window.extent());
        let desc = SwapchainDesc {
            surface,
            min_image_count: n_images,
            format,
            color_space,
            width: extent.0,
            height: extent.1,
            usage: info.usage,
            present_mode,
            old_swapchain: vk::SwapchainKHR::null(),
        };
        let swapchain = native
            .create_swapchain(&desc)
            .map_err(|e| api_error("create_swapchain", e))?;

        let handles = match native.swapchain_images(swapchain) {
            Ok(handles) => handles,
            Err(e) => {
                native.destroy_swapchain(swapchain);
                return Err(api_error("get_swapchain_images", e));
            }
        };

        let image_desc = ImageDesc::new_2d(format, extent.0, extent.1, info.usage);
        let images = handles
            .into_iter()
            .map(|handle| Image::wrap(device, handle, image_desc))
            .collect();

        Ok((swapchain, format, extent, images))
    }

    /// Registry ID
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Device the swapchain lives on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Window presented to
    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Native handle; fails once the swapchain was torn down
    pub fn handle(&self) -> CrucibleResult<vk::SwapchainKHR> {
        let native = lock_state(&self.native);
        if native.torn_down {
            return Err(CrucibleError::ResourceNotFound {
                what: format!("swapchain {} was torn down", self.id),
            });
        }
        Ok(native.swapchain)
    }

    /// Whether images are presented without a native swapchain
    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Image format
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Image extent
    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Number of images
    pub fn n_images(&self) -> u32 {
        self.images.len() as u32
    }

    /// Image `index`
    pub fn image(&self, index: u32) -> Option<&Arc<Image>> {
        self.images.get(index as usize)
    }

    /// View of image `index`
    pub fn image_view(&self, index: u32) -> Option<&Arc<ImageView>> {
        self.views.get(index as usize)
    }

    /// All images
    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }

    /// Number of acquires so far
    pub fn n_acquired(&self) -> u64 {
        lock_state(&self.counters).n_acquired
    }

    /// Number of presents so far
    pub fn n_presented(&self) -> u64 {
        lock_state(&self.counters).n_presented
    }

    /// Index returned by the last acquire
    pub fn last_acquired_index(&self) -> Option<u32> {
        lock_state(&self.counters).last_acquired
    }

    /// Whether the native swapchain has been released
    pub fn is_torn_down(&self) -> bool {
        lock_state(&self.native).torn_down
    }

    /// Acquire the next image
    ///
    /// `semaphore` is signalled once the image is ready. With `block` the
    /// call also waits on the host until then.
    pub fn acquire_image(&self, semaphore: Option<&Arc<Semaphore>>, block: bool) -> CrucibleResult<u32> {
        ensure_contract!(!self.is_torn_down(), "acquire on swapchain {} after it was torn down", self.id);
        let _guard = self.lock.lock();

        let index = if self.headless {
            if block {
                self.device.wait_idle()?;
            }
            if let Some(semaphore) = semaphore {
                let queue = self.device.universal_queue(0).ok_or_else(|| CrucibleError::ResourceNotFound {
                    what: "universal queue 0".to_string(),
                })?;
                queue.submit_signal_only(semaphore)?;
            }

            let mut counters = lock_state(&self.counters);
            let index = counters.next_headless_index;
            counters.next_headless_index = (index + 1) % self.n_images();
            index
        } else {
            let handle = self.handle()?;
            let fence = if block {
                self.acquire_fence.handle()
            } else {
                vk::Fence::null()
            };
            let (index, suboptimal) = self
                .device
                .native()
                .acquire_next_image(
                    handle,
                    u64::MAX,
                    semaphore.map_or(vk::Semaphore::null(), |s| s.handle()),
                    fence,
                )
                .map_err(|e| api_error("acquire_next_image", e))?;
            if suboptimal {
                log::warn!("Swapchain {} is suboptimal for its surface", self.id);
            }
            if block {
                self.acquire_fence.wait(u64::MAX)?;
                self.acquire_fence.reset()?;
            }
            index
        };

        let mut counters = lock_state(&self.counters);
        counters.n_acquired += 1;
        counters.last_acquired = Some(index);
        log::trace!("Swapchain {} acquired image {}", self.id, index);
        Ok(index)
    }

    fn on_present_request(&self, image_index: u32) {
        let mut counters = lock_state(&self.counters);
        counters.n_presented += 1;
        log::trace!("Swapchain {} presenting image {}", self.id, image_index);
    }

    /// Release the native swapchain
    ///
    /// Every acquired image must have been presented.
    pub fn try_teardown(&self) -> CrucibleResult<()> {
        {
            let counters = lock_state(&self.counters);
            ensure_contract!(
                counters.n_acquired == counters.n_presented,
                "swapchain {} torn down with {} acquire(s) but {} present(s)",
                self.id,
                counters.n_acquired,
                counters.n_presented
            );
        }
        self.release_native();
        Ok(())
    }

    fn release_native(&self) {
        let _guard = self.lock.lock();
        let mut native = lock_state(&self.native);
        if native.torn_down {
            return;
        }

        if let Err(err) = self.device.wait_idle() {
            log::warn!("wait-idle before swapchain teardown failed: {}", err);
        }
        if native.swapchain != vk::SwapchainKHR::null() {
            self.label.remove_handle(raw(native.swapchain));
            self.device.native().destroy_swapchain(native.swapchain);
        }
        if native.surface != vk::SurfaceKHR::null() {
            self.device.native().destroy_surface(native.surface);
        }
        native.torn_down = true;
        log::debug!("Swapchain {} torn down", self.id);
    }
}

impl_debug_named!(Swapchain);

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("id", &self.id)
            .field("n_images", &self.images.len())
            .field("extent", &self.extent)
            .field("headless", &self.headless)
            .finish()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.device.bus().unregister(self.present_token);
        self.window.bus().unregister(self.close_token);

        let (acquired, presented) = {
            let counters = lock_state(&self.counters);
            (counters.n_acquired, counters.n_presented)
        };
        if acquired != presented && !self.is_torn_down() && !std::thread::panicking() {
            // Best-effort destruction follows either way.
            let _ = contract_violation(format!(
                "swapchain {} dropped with {} acquire(s) but {} present(s)",
                self.id, acquired, presented
            ));
        }
        self.release_native();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FrameworkConfig;

    fn headless_swapchain(n_images: u32) -> (Arc<Device>, Arc<Swapchain>) {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let window = Window::create_dummy("test", 32, 32);
        let swapchain = Swapchain::create(
            &device,
            &window,
            SwapchainCreateInfo {
                n_images: Some(n_images),
                ..SwapchainCreateInfo::default()
            },
            MtSafety::InheritFromParent,
        )
        .unwrap();
        (device, swapchain)
    }

    #[test]
    fn test_headless_acquire_cycles_through_images() {
        let (device, swapchain) = headless_swapchain(3);
        let queue = device.universal_queue(0).unwrap();

        let mut indices = Vec::new();
        for _ in 0..4 {
            let index = swapchain.acquire_image(None, false).unwrap();
            queue.present(&swapchain, index, &[]).unwrap();
            indices.push(index);
        }
        assert_eq!(indices, vec![0, 1, 2, 0]);
        assert_eq!(swapchain.last_acquired_index(), Some(0));
    }

    #[test]
    fn test_headless_acquire_signals_semaphore() {
        let (device, swapchain) = headless_swapchain(2);
        let semaphore = Semaphore::create(&device).unwrap();
        let index = swapchain.acquire_image(Some(&semaphore), true).unwrap();
        assert_eq!(swapchain.n_acquired(), 1);
        assert_eq!(swapchain.n_presented(), 0);

        let queue = device.universal_queue(0).unwrap();
        queue.present(&swapchain, index, &[semaphore]).unwrap();
        assert_eq!(swapchain.n_presented(), 1);
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_present_without_acquire_is_rejected() {
        let (device, swapchain) = headless_swapchain(2);
        let queue = device.universal_queue(0).unwrap();
        assert!(queue.present(&swapchain, 0, &[]).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_window_close_releases_swapchain() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let window = Window::create_dummy("closing", 16, 16);
        let swapchain =
            Swapchain::create(&device, &window, SwapchainCreateInfo::default(), MtSafety::InheritFromParent)
                .unwrap();

        window.close();
        assert!(swapchain.is_torn_down());
    }

    #[cfg(not(feature = "assert-contracts"))]
    #[test]
    fn test_torn_down_swapchain_refuses_acquire_and_present() {
        let device = Device::create_headless(FrameworkConfig::default()).unwrap();
        let queue = device.universal_queue(0).unwrap();
        let window = Window::create_dummy("closing", 16, 16);
        let swapchain =
            Swapchain::create(&device, &window, SwapchainCreateInfo::default(), MtSafety::InheritFromParent)
                .unwrap();

        let index = swapchain.acquire_image(None, false).unwrap();
        window.close();

        assert!(queue.present(&swapchain, index, &[]).unwrap_err().is_contract_violation());
        assert!(swapchain.acquire_image(None, false).unwrap_err().is_contract_violation());
        assert_eq!(swapchain.n_acquired(), 1);
        assert_eq!(swapchain.n_presented(), 0);
    }
}
