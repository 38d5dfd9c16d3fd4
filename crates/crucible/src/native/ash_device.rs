//! Vulkan implementation of the native entry points
//!
//! Owns the instance, the debug messenger, the logical device and the
//! extension function tables. Each image and buffer gets its own dedicated
//! memory allocation; the framework never sub-allocates.

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{CreateRenderPass2, DrawIndirectCount, Surface, Swapchain as SwapchainLoader};
use ash::vk::{self, Handle};
use ash::{Device, Entry, Instance};
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Mutex;

use crate::command::Command;
use crate::core::config::FrameworkConfig;
use crate::core::error::{CrucibleError, CrucibleResult};
use crate::core::mt::lock_state;

use super::desc::*;
use super::{NativeDevice, SurfaceTarget};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

const SURFACE_EXTENSIONS: [&str; 7] = [
    "VK_KHR_surface",
    "VK_KHR_xlib_surface",
    "VK_KHR_xcb_surface",
    "VK_KHR_wayland_surface",
    "VK_KHR_win32_surface",
    "VK_KHR_android_surface",
    "VK_EXT_metal_surface",
];

/// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

fn init_error(what: impl Into<String>) -> CrucibleError {
    CrucibleError::Unsupported(what.into())
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
}

/// Optional device extensions that were found and enabled
#[derive(Debug, Default, Clone, Copy)]
struct EnabledExtensions {
    render_pass2: bool,
    depth_stencil_resolve: bool,
    rasterization_order: bool,
    conservative_rasterization: bool,
    transform_feedback: bool,
    depth_clip_enable: bool,
    sample_locations: bool,
    vertex_attribute_divisor: bool,
    draw_indirect_count: bool,
}

/// Command pool used for internal transfers such as image read-back
struct TransferContext {
    pool: vk::CommandPool,
    queue: vk::Queue,
}

/// Vulkan-backed [`NativeDevice`]
pub struct AshDevice {
    entry: Entry,
    instance: Instance,
    debug_utils: Option<DebugUtils>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    physical_device: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: Device,
    capabilities: DeviceCapabilities,
    surface_loader: Surface,
    swapchain_loader: SwapchainLoader,
    render_pass2: Option<CreateRenderPass2>,
    draw_indirect_count: Option<DrawIndirectCount>,
    transform_feedback: Option<vk::ExtTransformFeedbackFn>,
    sample_locations: Option<vk::ExtSampleLocationsFn>,
    allocations: Mutex<HashMap<u64, vk::DeviceMemory>>,
    transfer: Mutex<TransferContext>,
}

impl std::fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AshDevice")
            .field("device", &self.device.handle())
            .field("name", &self.capabilities.device_name)
            .finish_non_exhaustive()
    }
}

impl AshDevice {
    /// Load Vulkan, create an instance and open the first suitable adapter
    pub fn new(config: &FrameworkConfig) -> CrucibleResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| init_error(format!("failed to load Vulkan: {e}")))?;

        let app_name = CString::new(config.application_name.as_str())
            .map_err(|_| init_error("application name contains a NUL byte"))?;
        let engine_name = CString::new("Crucible").map_err(|_| init_error("engine name"))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(CrucibleError::Api)?;
        let mut extension_names: Vec<CString> = SURFACE_EXTENSIONS
            .iter()
            .filter_map(|name| CString::new(*name).ok())
            .filter(|name| has_extension(&available, name))
            .collect();
        let debug_utils_available = has_extension(&available, DebugUtils::name());
        if config.debug_labels && debug_utils_available {
            extension_names.push(DebugUtils::name().to_owned());
        }
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let validation = config.validation_enabled()
            && entry
                .enumerate_instance_layer_properties()
                .map_err(CrucibleError::Api)?
                .iter()
                .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if config.validation_enabled() && !validation {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        let layer_ptrs: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);
        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(CrucibleError::Api)?;

        let debug_utils = (config.debug_labels && debug_utils_available).then(|| DebugUtils::new(&entry, &instance));
        let debug_messenger = match (&debug_utils, validation) {
            (Some(debug_utils), true) => {
                let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                    .message_severity(
                        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                    )
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(debug_callback));
                Some(
                    unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) }
                        .map_err(CrucibleError::Api)?,
                )
            }
            _ => None,
        };

        let (physical_device, family) = match Self::select_physical_device(&instance) {
            Ok(selected) => selected,
            Err(e) => {
                unsafe {
                    if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                        utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(e);
            }
        };

        Self::open(
            entry,
            instance,
            debug_utils,
            debug_messenger,
            physical_device,
            family,
        )
    }

    fn select_physical_device(instance: &Instance) -> CrucibleResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(CrucibleError::Api)?;

        let mut best: Option<(vk::PhysicalDevice, u32, bool)> = None;
        for device in devices {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            if properties.api_version < vk::API_VERSION_1_1 {
                continue;
            }
            let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) }) else {
                continue;
            };
            if !has_extension(&extensions, SwapchainLoader::name()) {
                continue;
            }
            let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
            let universal = families.iter().position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            });
            let Some(family) = universal else { continue };

            let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            if best.map_or(true, |(_, _, best_discrete)| discrete && !best_discrete) {
                best = Some((device, family as u32, discrete));
            }
        }

        best.map(|(device, family, _)| (device, family))
            .ok_or_else(|| init_error("no Vulkan 1.1 adapter with a universal queue family and swapchain support"))
    }

    fn open(
        entry: Entry,
        instance: Instance,
        debug_utils: Option<DebugUtils>,
        debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
        physical_device: vk::PhysicalDevice,
        family: u32,
    ) -> CrucibleResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let available =
            unsafe { instance.enumerate_device_extension_properties(physical_device) }.map_err(CrucibleError::Api)?;

        let mut enabled = EnabledExtensions::default();
        let mut extension_names: Vec<&CStr> = vec![SwapchainLoader::name()];
        let mut enable = |name: &'static CStr, flag: &mut bool| {
            if has_extension(&available, name) {
                extension_names.push(name);
                *flag = true;
            }
        };
        enable(CreateRenderPass2::name(), &mut enabled.render_pass2);
        if enabled.render_pass2 {
            enable(vk::KhrDepthStencilResolveFn::name(), &mut enabled.depth_stencil_resolve);
        }
        enable(vk::AmdRasterizationOrderFn::name(), &mut enabled.rasterization_order);
        enable(vk::ExtConservativeRasterizationFn::name(), &mut enabled.conservative_rasterization);
        enable(vk::ExtTransformFeedbackFn::name(), &mut enabled.transform_feedback);
        enable(vk::ExtDepthClipEnableFn::name(), &mut enabled.depth_clip_enable);
        enable(vk::ExtSampleLocationsFn::name(), &mut enabled.sample_locations);
        enable(vk::ExtVertexAttributeDivisorFn::name(), &mut enabled.vertex_attribute_divisor);
        enable(DrawIndirectCount::name(), &mut enabled.draw_indirect_count);
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|name| name.as_ptr()).collect();

        let mut multiview = vk::PhysicalDeviceMultiviewFeatures::default();
        let mut transform_feedback = vk::PhysicalDeviceTransformFeedbackFeaturesEXT::default();
        let mut depth_clip = vk::PhysicalDeviceDepthClipEnableFeaturesEXT::default();
        let mut divisor = vk::PhysicalDeviceVertexAttributeDivisorFeaturesEXT::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut multiview);
        if enabled.transform_feedback {
            features2 = features2.push_next(&mut transform_feedback);
        }
        if enabled.depth_clip_enable {
            features2 = features2.push_next(&mut depth_clip);
        }
        if enabled.vertex_attribute_divisor {
            features2 = features2.push_next(&mut divisor);
        }
        let mut features2 = features2.build();
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        features2.features.robust_buffer_access = vk::FALSE;

        let n_queues = families[family as usize].queue_count;
        let priorities = vec![1.0_f32; n_queues as usize];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family)
            .queue_priorities(&priorities)
            .build()];
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        let device = match unsafe { instance.create_device(physical_device, &create_info, None) } {
            Ok(device) => device,
            Err(e) => {
                unsafe {
                    if let (Some(utils), Some(messenger)) = (&debug_utils, debug_messenger) {
                        utils.destroy_debug_utils_messenger(messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                return Err(CrucibleError::Api(e));
            }
        };

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!("Selected GPU: {} ({} universal queue(s))", device_name, n_queues);

        let core = features2.features;
        let capabilities = DeviceCapabilities {
            device_name,
            physical_device_count: 1,
            universal_queue_family: family,
            n_universal_queues: n_queues,
            max_color_attachments: properties.limits.max_color_attachments,
            max_input_attachments: properties.limits.max_per_stage_descriptor_input_attachments,
            max_viewports: properties.limits.max_viewports,
            max_vertex_input_bindings: properties.limits.max_vertex_input_bindings,
            supports_depth_stencil_resolve: enabled.depth_stencil_resolve,
            supports_multiview: multiview.multiview == vk::TRUE,
            supports_rasterization_order: enabled.rasterization_order,
            supports_conservative_rasterization: enabled.conservative_rasterization,
            supports_transform_feedback: enabled.transform_feedback && transform_feedback.transform_feedback == vk::TRUE,
            supports_depth_clip_enable: enabled.depth_clip_enable && depth_clip.depth_clip_enable == vk::TRUE,
            supports_sample_locations: enabled.sample_locations,
            supports_vertex_attribute_divisor: enabled.vertex_attribute_divisor
                && divisor.vertex_attribute_instance_rate_divisor == vk::TRUE,
            supports_debug_utils: debug_utils.is_some(),
            supports_geometry_shader: core.geometry_shader == vk::TRUE,
            supports_tessellation_shader: core.tessellation_shader == vk::TRUE,
        };

        let load = |name: &CStr| unsafe {
            std::mem::transmute::<vk::PFN_vkVoidFunction, *const c_void>(
                instance.get_device_proc_addr(device.handle(), name.as_ptr()),
            )
        };
        let transform_feedback_fn = capabilities
            .supports_transform_feedback
            .then(|| vk::ExtTransformFeedbackFn::load(load));
        let sample_locations_fn = enabled.sample_locations.then(|| vk::ExtSampleLocationsFn::load(load));

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let transfer_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(CrucibleError::Api(e));
            }
        };
        let transfer_queue = unsafe { device.get_device_queue(family, 0) };

        Ok(Self {
            surface_loader: Surface::new(&entry, &instance),
            swapchain_loader: SwapchainLoader::new(&instance, &device),
            render_pass2: enabled.render_pass2.then(|| CreateRenderPass2::new(&instance, &device)),
            draw_indirect_count: enabled
                .draw_indirect_count
                .then(|| DrawIndirectCount::new(&instance, &device)),
            transform_feedback: transform_feedback_fn,
            sample_locations: sample_locations_fn,
            allocations: Mutex::new(HashMap::new()),
            transfer: Mutex::new(TransferContext {
                pool: transfer_pool,
                queue: transfer_queue,
            }),
            entry,
            instance,
            debug_utils,
            debug_messenger,
            physical_device,
            memory_properties,
            device,
            capabilities,
        })
    }

    fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> NativeResult<u32> {
        (0..self.memory_properties.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && self.memory_properties.memory_types[i as usize]
                        .property_flags
                        .contains(properties)
            })
            .ok_or(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
    }

    fn allocate(&self, requirements: vk::MemoryRequirements, host_visible: bool) -> NativeResult<vk::DeviceMemory> {
        let properties = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(self.find_memory_type(requirements.memory_type_bits, properties)?);
        unsafe { self.device.allocate_memory(&alloc_info, None) }
    }

    fn release_memory(&self, raw_handle: u64) {
        if let Some(memory) = lock_state(&self.allocations).remove(&raw_handle) {
            unsafe { self.device.free_memory(memory, None) };
        }
    }

    fn create_render_pass_v1(&self, desc: &RenderPassDesc) -> NativeResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription> = desc
            .attachments
            .iter()
            .map(|a| vk::AttachmentDescription {
                flags: if a.may_alias {
                    vk::AttachmentDescriptionFlags::MAY_ALIAS
                } else {
                    vk::AttachmentDescriptionFlags::empty()
                },
                format: a.format,
                samples: a.samples,
                load_op: a.load_op,
                store_op: a.store_op,
                stencil_load_op: a.stencil_load_op,
                stencil_store_op: a.stencil_store_op,
                initial_layout: a.initial_layout,
                final_layout: a.final_layout,
            })
            .collect();

        let to_ref = |r: &AttachmentRefDesc| vk::AttachmentReference {
            attachment: r.attachment,
            layout: r.layout,
        };
        let refs: Vec<SubpassRefs<vk::AttachmentReference>> = desc
            .subpasses
            .iter()
            .map(|s| SubpassRefs {
                input: s.input_attachments.iter().map(to_ref).collect(),
                color: s.color_attachments.iter().map(to_ref).collect(),
                resolve: s.resolve_attachments.iter().map(to_ref).collect(),
                depth_stencil: s.depth_stencil_attachment.as_ref().map(to_ref),
            })
            .collect();
        let subpasses: Vec<vk::SubpassDescription> = desc
            .subpasses
            .iter()
            .zip(&refs)
            .map(|(s, r)| {
                let mut builder = vk::SubpassDescription::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&r.input)
                    .color_attachments(&r.color)
                    .preserve_attachments(&s.preserve_attachments);
                if !r.resolve.is_empty() {
                    builder = builder.resolve_attachments(&r.resolve);
                }
                if let Some(depth_stencil) = r.depth_stencil.as_ref() {
                    builder = builder.depth_stencil_attachment(depth_stencil);
                }
                builder.build()
            })
            .collect();
        let dependencies: Vec<vk::SubpassDependency> = desc
            .dependencies
            .iter()
            .map(|d| vk::SubpassDependency {
                src_subpass: d.src_subpass,
                dst_subpass: d.dst_subpass,
                src_stage_mask: d.src_stage_mask,
                dst_stage_mask: d.dst_stage_mask,
                src_access_mask: d.src_access_mask,
                dst_access_mask: d.dst_access_mask,
                dependency_flags: d.dependency_flags,
            })
            .collect();

        let view_masks: Vec<u32> = desc.subpasses.iter().map(|s| s.view_mask).collect();
        let view_offsets: Vec<i32> = desc.dependencies.iter().map(|d| d.view_offset).collect();
        let mut multiview = vk::RenderPassMultiviewCreateInfo::builder()
            .view_masks(&view_masks)
            .view_offsets(&view_offsets)
            .correlation_masks(&desc.correlated_view_masks);

        let mut create_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        if view_masks.iter().any(|m| *m != 0) {
            create_info = create_info.push_next(&mut multiview);
        }
        unsafe { self.device.create_render_pass(&create_info, None) }
    }

    fn create_render_pass_v2(&self, loader: &CreateRenderPass2, desc: &RenderPassDesc) -> NativeResult<vk::RenderPass> {
        let attachments: Vec<vk::AttachmentDescription2> = desc
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription2::builder()
                    .flags(if a.may_alias {
                        vk::AttachmentDescriptionFlags::MAY_ALIAS
                    } else {
                        vk::AttachmentDescriptionFlags::empty()
                    })
                    .format(a.format)
                    .samples(a.samples)
                    .load_op(a.load_op)
                    .store_op(a.store_op)
                    .stencil_load_op(a.stencil_load_op)
                    .stencil_store_op(a.stencil_store_op)
                    .initial_layout(a.initial_layout)
                    .final_layout(a.final_layout)
                    .build()
            })
            .collect();

        let to_ref = |r: &AttachmentRefDesc| {
            vk::AttachmentReference2::builder()
                .attachment(r.attachment)
                .layout(r.layout)
                .aspect_mask(r.aspect_mask)
                .build()
        };
        let refs: Vec<SubpassRefs<vk::AttachmentReference2>> = desc
            .subpasses
            .iter()
            .map(|s| SubpassRefs {
                input: s.input_attachments.iter().map(to_ref).collect(),
                color: s.color_attachments.iter().map(to_ref).collect(),
                resolve: s.resolve_attachments.iter().map(to_ref).collect(),
                depth_stencil: s.depth_stencil_attachment.as_ref().map(to_ref),
            })
            .collect();
        let ds_resolve_refs: Vec<Option<vk::AttachmentReference2>> = desc
            .subpasses
            .iter()
            .map(|s| s.depth_stencil_resolve.as_ref().map(|r| to_ref(&r.attachment)))
            .collect();
        let mut ds_resolves: Vec<vk::SubpassDescriptionDepthStencilResolve> = desc
            .subpasses
            .iter()
            .zip(&ds_resolve_refs)
            .map(|(s, r)| match (s.depth_stencil_resolve.as_ref(), r.as_ref()) {
                (Some(resolve), Some(reference)) => vk::SubpassDescriptionDepthStencilResolve::builder()
                    .depth_resolve_mode(resolve.depth_resolve_mode)
                    .stencil_resolve_mode(resolve.stencil_resolve_mode)
                    .depth_stencil_resolve_attachment(reference)
                    .build(),
                _ => vk::SubpassDescriptionDepthStencilResolve::default(),
            })
            .collect();

        let subpasses: Vec<vk::SubpassDescription2> = desc
            .subpasses
            .iter()
            .zip(&refs)
            .zip(ds_resolves.iter_mut())
            .map(|((s, r), ds_resolve)| {
                let mut builder = vk::SubpassDescription2::builder()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .view_mask(s.view_mask)
                    .input_attachments(&r.input)
                    .color_attachments(&r.color)
                    .preserve_attachments(&s.preserve_attachments);
                if !r.resolve.is_empty() {
                    builder = builder.resolve_attachments(&r.resolve);
                }
                if let Some(depth_stencil) = r.depth_stencil.as_ref() {
                    builder = builder.depth_stencil_attachment(depth_stencil);
                }
                if s.depth_stencil_resolve.is_some() {
                    builder = builder.push_next(ds_resolve);
                }
                builder.build()
            })
            .collect();
        let dependencies: Vec<vk::SubpassDependency2> = desc
            .dependencies
            .iter()
            .map(|d| {
                vk::SubpassDependency2::builder()
                    .src_subpass(d.src_subpass)
                    .dst_subpass(d.dst_subpass)
                    .src_stage_mask(d.src_stage_mask)
                    .dst_stage_mask(d.dst_stage_mask)
                    .src_access_mask(d.src_access_mask)
                    .dst_access_mask(d.dst_access_mask)
                    .dependency_flags(d.dependency_flags)
                    .view_offset(d.view_offset)
                    .build()
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo2::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies)
            .correlated_view_masks(&desc.correlated_view_masks);
        unsafe { loader.create_render_pass2(&create_info, None) }
    }

    fn debug_label(name: &str, color: [f32; 4]) -> (CString, [f32; 4]) {
        let name = CString::new(name.replace('\0', " ")).unwrap_or_default();
        (name, color)
    }

    fn read_back_locked(&self, transfer: &TransferContext, desc: &ReadbackDesc) -> NativeResult<Vec<u8>> {
        let swizzle = match desc.format {
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => false,
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => true,
            _ => return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED),
        };
        let size = u64::from(desc.width) * u64::from(desc.height) * 4;
        let staging = self.create_buffer(&BufferDesc {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_DST,
            host_visible: true,
        })?;

        let result = self.copy_to_staging(transfer, desc, staging, size).and_then(|()| {
            let memory = lock_state(&self.allocations)
                .get(&staging.as_raw())
                .copied()
                .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
            let mut pixels = vec![0_u8; size as usize];
            unsafe {
                let mapped = self.device.map_memory(memory, 0, size, vk::MemoryMapFlags::empty())?;
                std::ptr::copy_nonoverlapping(mapped.cast::<u8>(), pixels.as_mut_ptr(), pixels.len());
                self.device.unmap_memory(memory);
            }
            if swizzle {
                for pixel in pixels.chunks_exact_mut(4) {
                    pixel.swap(0, 2);
                }
            }
            Ok(pixels)
        });

        self.destroy_buffer(staging);
        result
    }

    fn copy_to_staging(
        &self,
        transfer: &TransferContext,
        desc: &ReadbackDesc,
        staging: vk::Buffer,
        size: u64,
    ) -> NativeResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(transfer.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let fence = self.create_fence(false)?;
        let command_buffers = match unsafe { self.device.allocate_command_buffers(&alloc_info) } {
            Ok(command_buffers) => command_buffers,
            Err(e) => {
                self.destroy_fence(fence);
                return Err(e);
            }
        };

        let result = unsafe { self.record_readback(command_buffers[0], desc, staging, size) }.and_then(|()| {
            let submit = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
            unsafe {
                self.device.queue_submit(transfer.queue, &[submit], fence)?;
                self.device.wait_for_fences(&[fence], true, u64::MAX)
            }
        });

        unsafe { self.device.free_command_buffers(transfer.pool, &command_buffers) };
        self.destroy_fence(fence);
        result
    }

    unsafe fn record_readback(
        &self,
        cb: vk::CommandBuffer,
        desc: &ReadbackDesc,
        staging: vk::Buffer,
        size: u64,
    ) -> NativeResult<()> {
        let subresource = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let transition = |old_layout: vk::ImageLayout,
                          new_layout: vk::ImageLayout,
                          src_access: vk::AccessFlags,
                          dst_access: vk::AccessFlags| {
            vk::ImageMemoryBarrier::builder()
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_access_mask(src_access)
                .dst_access_mask(dst_access)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(desc.image)
                .subresource_range(subresource)
                .build()
        };
        let needs_transition = desc.layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        let copy_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;

        let begin = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device.begin_command_buffer(cb, &begin)?;
        if needs_transition {
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[transition(
                    desc.layout,
                    copy_layout,
                    vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::TRANSFER_READ,
                )],
            );
        }
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            },
        };
        self.device
            .cmd_copy_image_to_buffer(cb, desc.image, copy_layout, staging, &[region]);

        let host_barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::HOST_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(staging)
            .offset(0)
            .size(size)
            .build();
        let restore = [transition(
            copy_layout,
            desc.layout,
            vk::AccessFlags::TRANSFER_READ,
            vk::AccessFlags::MEMORY_READ,
        )];
        let image_barriers: &[vk::ImageMemoryBarrier] = if needs_transition { &restore } else { &[] };
        self.device.cmd_pipeline_barrier(
            cb,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[host_barrier],
            image_barriers,
        );
        self.device.end_command_buffer(cb)
    }
}

/// Attachment references of one subpass, kept alive while a render pass bakes
struct SubpassRefs<R> {
    input: Vec<R>,
    color: Vec<R>,
    resolve: Vec<R>,
    depth_stencil: Option<R>,
}

/// Backing storage for one graphics pipeline's create-info chain
///
/// Lives in a `Box` so the state structs keep their addresses while the
/// create info points at them.
#[derive(Default)]
struct PipelineChain {
    entry_names: Vec<CString>,
    specialization_entries: Vec<Vec<vk::SpecializationMapEntry>>,
    specializations: Vec<vk::SpecializationInfo>,
    stages: Vec<vk::PipelineShaderStageCreateInfo>,
    bindings: Vec<vk::VertexInputBindingDescription>,
    attributes: Vec<vk::VertexInputAttributeDescription>,
    divisors: Vec<vk::VertexInputBindingDivisorDescriptionEXT>,
    viewports: Vec<vk::Viewport>,
    scissors: Vec<vk::Rect2D>,
    sample_locations: Vec<vk::SampleLocationEXT>,
    blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    dynamic_states: Vec<vk::DynamicState>,
    sample_mask: Vec<u32>,

    vertex_input: vk::PipelineVertexInputStateCreateInfo,
    divisor_state: vk::PipelineVertexInputDivisorStateCreateInfoEXT,
    input_assembly: vk::PipelineInputAssemblyStateCreateInfo,
    tessellation: vk::PipelineTessellationStateCreateInfo,
    domain_origin: vk::PipelineTessellationDomainOriginStateCreateInfo,
    viewport: vk::PipelineViewportStateCreateInfo,
    rasterization: vk::PipelineRasterizationStateCreateInfo,
    rasterization_order: vk::PipelineRasterizationStateRasterizationOrderAMD,
    conservative: vk::PipelineRasterizationConservativeStateCreateInfoEXT,
    stream: vk::PipelineRasterizationStateStreamCreateInfoEXT,
    depth_clip: vk::PipelineRasterizationDepthClipStateCreateInfoEXT,
    multisample: vk::PipelineMultisampleStateCreateInfo,
    sample_locations_state: vk::PipelineSampleLocationsStateCreateInfoEXT,
    depth_stencil: vk::PipelineDepthStencilStateCreateInfo,
    color_blend: vk::PipelineColorBlendStateCreateInfo,
    dynamic: vk::PipelineDynamicStateCreateInfo,
}

fn vk_bool(value: bool) -> vk::Bool32 {
    if value {
        vk::TRUE
    } else {
        vk::FALSE
    }
}

impl PipelineChain {
    fn build(desc: &GraphicsPipelineDesc) -> Box<Self> {
        let mut c = Box::<Self>::default();

        c.entry_names = desc
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point.replace('\0', "")).unwrap_or_default())
            .collect();
        c.specialization_entries = desc
            .stages
            .iter()
            .map(|s| {
                s.specialization.as_ref().map_or_else(Vec::new, |spec| {
                    spec.entries
                        .iter()
                        .map(|e| vk::SpecializationMapEntry {
                            constant_id: e.constant_id,
                            offset: e.offset,
                            size: e.size,
                        })
                        .collect()
                })
            })
            .collect();
        c.specializations = desc
            .stages
            .iter()
            .zip(&c.specialization_entries)
            .map(|(s, entries)| match &s.specialization {
                Some(spec) => vk::SpecializationInfo {
                    map_entry_count: entries.len() as u32,
                    p_map_entries: entries.as_ptr(),
                    data_size: spec.data.len(),
                    p_data: spec.data.as_ptr().cast(),
                },
                None => vk::SpecializationInfo::default(),
            })
            .collect();
        c.stages = desc
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| vk::PipelineShaderStageCreateInfo {
                stage: s.stage,
                module: s.module,
                p_name: c.entry_names[i].as_ptr(),
                p_specialization_info: if s.specialization.is_some() {
                    &c.specializations[i]
                } else {
                    std::ptr::null()
                },
                ..Default::default()
            })
            .collect();

        c.bindings = desc
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.input_rate,
            })
            .collect();
        c.divisors = desc
            .vertex_bindings
            .iter()
            .filter(|b| b.input_rate == vk::VertexInputRate::INSTANCE && b.divisor != 1)
            .map(|b| vk::VertexInputBindingDivisorDescriptionEXT {
                binding: b.binding,
                divisor: b.divisor,
            })
            .collect();
        c.attributes = desc
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect();
        c.vertex_input.vertex_binding_description_count = c.bindings.len() as u32;
        c.vertex_input.p_vertex_binding_descriptions = c.bindings.as_ptr();
        c.vertex_input.vertex_attribute_description_count = c.attributes.len() as u32;
        c.vertex_input.p_vertex_attribute_descriptions = c.attributes.as_ptr();
        if !c.divisors.is_empty() {
            c.divisor_state.vertex_binding_divisor_count = c.divisors.len() as u32;
            c.divisor_state.p_vertex_binding_divisors = c.divisors.as_ptr();
            c.divisor_state.p_next = c.vertex_input.p_next;
            c.vertex_input.p_next = std::ptr::addr_of!(c.divisor_state).cast();
        }

        c.input_assembly.topology = desc.topology;
        c.input_assembly.primitive_restart_enable = vk_bool(desc.primitive_restart);

        if let Some(points) = desc.patch_control_points {
            c.tessellation.patch_control_points = points;
            if let Some(origin) = desc.tessellation_domain_origin {
                c.domain_origin.domain_origin = origin;
                c.domain_origin.p_next = c.tessellation.p_next;
                c.tessellation.p_next = std::ptr::addr_of!(c.domain_origin).cast();
            }
        }

        c.viewports = desc.viewports.iter().map(|v| v.to_vk()).collect();
        c.scissors = desc.scissors.iter().map(|s| s.to_vk()).collect();
        c.viewport.viewport_count = desc.viewport_count;
        c.viewport.p_viewports = if c.viewports.is_empty() {
            std::ptr::null()
        } else {
            c.viewports.as_ptr()
        };
        c.viewport.scissor_count = desc.scissor_count;
        c.viewport.p_scissors = if c.scissors.is_empty() {
            std::ptr::null()
        } else {
            c.scissors.as_ptr()
        };

        let r = &mut c.rasterization;
        r.depth_clamp_enable = vk_bool(desc.depth_clamp);
        r.rasterizer_discard_enable = vk_bool(desc.rasterizer_discard);
        r.polygon_mode = desc.polygon_mode;
        r.cull_mode = desc.cull_mode;
        r.front_face = desc.front_face;
        r.line_width = desc.line_width;
        if let Some(bias) = desc.depth_bias {
            r.depth_bias_enable = vk::TRUE;
            r.depth_bias_constant_factor = bias.constant_factor;
            r.depth_bias_clamp = bias.clamp;
            r.depth_bias_slope_factor = bias.slope_factor;
        }
        if let Some(order) = desc.rasterization_order {
            c.rasterization_order.rasterization_order = order;
            c.rasterization_order.p_next = c.rasterization.p_next;
            c.rasterization.p_next = std::ptr::addr_of!(c.rasterization_order).cast();
        }
        if let Some(conservative) = desc.conservative_rasterization {
            c.conservative.conservative_rasterization_mode = conservative.mode;
            c.conservative.extra_primitive_overestimation_size = conservative.extra_primitive_overestimation_size;
            c.conservative.p_next = c.rasterization.p_next;
            c.rasterization.p_next = std::ptr::addr_of!(c.conservative).cast();
        }
        if let Some(stream) = desc.rasterization_stream {
            c.stream.rasterization_stream = stream;
            c.stream.p_next = c.rasterization.p_next;
            c.rasterization.p_next = std::ptr::addr_of!(c.stream).cast();
        }
        if let Some(enable) = desc.depth_clip_enable {
            c.depth_clip.depth_clip_enable = vk_bool(enable);
            c.depth_clip.p_next = c.rasterization.p_next;
            c.rasterization.p_next = std::ptr::addr_of!(c.depth_clip).cast();
        }

        c.sample_mask = desc.sample_mask.clone();
        let m = &mut c.multisample;
        m.rasterization_samples = desc.rasterization_samples;
        if let Some(min) = desc.sample_shading {
            m.sample_shading_enable = vk::TRUE;
            m.min_sample_shading = min;
        }
        m.alpha_to_coverage_enable = vk_bool(desc.alpha_to_coverage);
        m.alpha_to_one_enable = vk_bool(desc.alpha_to_one);
        if !c.sample_mask.is_empty() {
            c.multisample.p_sample_mask = c.sample_mask.as_ptr();
        }
        if let Some(locations) = &desc.sample_locations {
            c.sample_locations = locations
                .locations
                .iter()
                .map(|[x, y]| vk::SampleLocationEXT { x: *x, y: *y })
                .collect();
            let n_locations = c.sample_locations.len() as u32;
            let p_locations = c.sample_locations.as_ptr();
            let s = &mut c.sample_locations_state;
            s.sample_locations_enable = vk::TRUE;
            s.sample_locations_info.sample_locations_per_pixel = locations.per_pixel;
            s.sample_locations_info.sample_location_grid_size = vk::Extent2D {
                width: locations.grid_width,
                height: locations.grid_height,
            };
            s.sample_locations_info.sample_locations_count = n_locations;
            s.sample_locations_info.p_sample_locations = p_locations;
            c.sample_locations_state.p_next = c.multisample.p_next;
            c.multisample.p_next = std::ptr::addr_of!(c.sample_locations_state).cast();
        }

        let d = &mut c.depth_stencil;
        d.depth_test_enable = vk_bool(desc.depth_test);
        d.depth_write_enable = vk_bool(desc.depth_write);
        d.depth_compare_op = desc.depth_compare_op;
        d.depth_bounds_test_enable = vk_bool(desc.depth_bounds_test);
        d.min_depth_bounds = desc.min_depth_bounds;
        d.max_depth_bounds = desc.max_depth_bounds;
        d.stencil_test_enable = vk_bool(desc.stencil_test);
        d.front = desc.stencil_front.to_vk();
        d.back = desc.stencil_back.to_vk();

        c.blend_attachments = desc
            .color_blend_attachments
            .iter()
            .map(|b| vk::PipelineColorBlendAttachmentState {
                blend_enable: vk_bool(b.blend_enable),
                src_color_blend_factor: b.src_color_blend_factor,
                dst_color_blend_factor: b.dst_color_blend_factor,
                color_blend_op: b.color_blend_op,
                src_alpha_blend_factor: b.src_alpha_blend_factor,
                dst_alpha_blend_factor: b.dst_alpha_blend_factor,
                alpha_blend_op: b.alpha_blend_op,
                color_write_mask: b.color_write_mask,
            })
            .collect();
        c.color_blend.attachment_count = c.blend_attachments.len() as u32;
        c.color_blend.p_attachments = c.blend_attachments.as_ptr();
        c.color_blend.blend_constants = desc.blend_constants;
        if let Some(op) = desc.logic_op {
            c.color_blend.logic_op_enable = vk::TRUE;
            c.color_blend.logic_op = op;
        }

        c.dynamic_states = desc.dynamic_states.clone();
        c.dynamic.dynamic_state_count = c.dynamic_states.len() as u32;
        c.dynamic.p_dynamic_states = c.dynamic_states.as_ptr();

        c
    }

    fn create_info(&self, desc: &GraphicsPipelineDesc) -> vk::GraphicsPipelineCreateInfo {
        let (base_pipeline_handle, base_pipeline_index) = match desc.base {
            PipelineBase::None => (vk::Pipeline::null(), -1),
            PipelineBase::Handle(handle) => (handle, -1),
            PipelineBase::Index(index) => (vk::Pipeline::null(), index),
        };
        vk::GraphicsPipelineCreateInfo {
            flags: desc.flags,
            stage_count: self.stages.len() as u32,
            p_stages: self.stages.as_ptr(),
            p_vertex_input_state: &self.vertex_input,
            p_input_assembly_state: &self.input_assembly,
            p_tessellation_state: if desc.patch_control_points.is_some() {
                &self.tessellation
            } else {
                std::ptr::null()
            },
            p_viewport_state: if desc.rasterizer_discard {
                std::ptr::null()
            } else {
                &self.viewport
            },
            p_rasterization_state: &self.rasterization,
            p_multisample_state: &self.multisample,
            p_depth_stencil_state: &self.depth_stencil,
            p_color_blend_state: &self.color_blend,
            p_dynamic_state: if self.dynamic_states.is_empty() {
                std::ptr::null()
            } else {
                &self.dynamic
            },
            layout: desc.layout,
            render_pass: desc.render_pass,
            subpass: desc.subpass,
            base_pipeline_handle,
            base_pipeline_index,
            ..Default::default()
        }
    }
}

impl NativeDevice for AshDevice {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> NativeResult<vk::RenderPass> {
        let needs_v2 = desc.subpasses.iter().any(|s| s.depth_stencil_resolve.is_some());
        match (&self.render_pass2, needs_v2) {
            (Some(loader), true) if self.capabilities.supports_depth_stencil_resolve => {
                self.create_render_pass_v2(loader, desc)
            }
            (_, true) => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
            (_, false) => self.create_render_pass_v1(desc),
        }
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_shader_module(&self, spirv: &[u32]) -> NativeResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(spirv);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> NativeResult<vk::PipelineLayout> {
        let ranges: Vec<vk::PushConstantRange> = desc
            .push_constant_ranges
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: r.stages,
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&desc.set_layouts)
            .push_constant_ranges(&ranges);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_graphics_pipelines(
        &self,
        cache: vk::PipelineCache,
        descs: &[GraphicsPipelineDesc],
    ) -> Result<Vec<vk::Pipeline>, BatchFailure> {
        let chains: Vec<Box<PipelineChain>> = descs.iter().map(PipelineChain::build).collect();
        let create_infos: Vec<vk::GraphicsPipelineCreateInfo> = chains
            .iter()
            .zip(descs)
            .map(|(chain, desc)| chain.create_info(desc))
            .collect();

        unsafe { self.device.create_graphics_pipelines(cache, &create_infos, None) }
            .map_err(|(pipelines, result)| BatchFailure { result, pipelines })
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> NativeResult<vk::PipelineCache> {
        let create_info = vk::PipelineCacheCreateInfo::builder().initial_data(initial_data);
        unsafe { self.device.create_pipeline_cache(&create_info, None) }
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> NativeResult<Vec<u8>> {
        unsafe { self.device.get_pipeline_cache_data(cache) }
    }

    fn merge_pipeline_caches(&self, destination: vk::PipelineCache, sources: &[vk::PipelineCache]) -> NativeResult<()> {
        unsafe { self.device.merge_pipeline_caches(destination, sources) }
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> NativeResult<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(desc.render_pass)
            .attachments(&desc.attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        unsafe { self.device.create_framebuffer(&create_info, None) }
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> NativeResult<vk::Image> {
        let create_info = vk::ImageCreateInfo::builder()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(desc.initial_layout);

        unsafe {
            let image = self.device.create_image(&create_info, None)?;
            let requirements = self.device.get_image_memory_requirements(image);
            let memory = match self.allocate(requirements, desc.host_visible) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_image(image, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.device.bind_image_memory(image, memory, 0) {
                self.device.destroy_image(image, None);
                self.device.free_memory(memory, None);
                return Err(e);
            }
            lock_state(&self.allocations).insert(image.as_raw(), memory);
            Ok(image)
        }
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        self.release_memory(image.as_raw());
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> NativeResult<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect_mask,
                base_mip_level: desc.base_mip_level,
                level_count: desc.level_count,
                base_array_layer: desc.base_array_layer,
                layer_count: desc.layer_count,
            });
        unsafe { self.device.create_image_view(&create_info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_buffer(&self, desc: &BufferDesc) -> NativeResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let buffer = self.device.create_buffer(&create_info, None)?;
            let requirements = self.device.get_buffer_memory_requirements(buffer);
            let memory = match self.allocate(requirements, desc.host_visible) {
                Ok(memory) => memory,
                Err(e) => {
                    self.device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = self.device.bind_buffer_memory(buffer, memory, 0) {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
                return Err(e);
            }
            lock_state(&self.allocations).insert(buffer.as_raw(), memory);
            Ok(buffer)
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        self.release_memory(buffer.as_raw());
    }

    fn create_semaphore(&self) -> NativeResult<vk::Semaphore> {
        unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> NativeResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::builder().flags(flags), None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], wait_all: bool, timeout: u64) -> NativeResult<()> {
        unsafe { self.device.wait_for_fences(fences, wait_all, timeout) }
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> NativeResult<()> {
        unsafe { self.device.reset_fences(fences) }
    }

    fn fence_status(&self, fence: vk::Fence) -> NativeResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_event(&self) -> NativeResult<vk::Event> {
        unsafe { self.device.create_event(&vk::EventCreateInfo::default(), None) }
    }

    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) };
    }

    fn create_query_pool(&self, desc: &QueryPoolDesc) -> NativeResult<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(desc.query_type)
            .query_count(desc.query_count)
            .pipeline_statistics(desc.pipeline_statistics);
        unsafe { self.device.create_query_pool(&create_info, None) }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn create_command_pool(&self, queue_family: u32, flags: vk::CommandPoolCreateFlags) -> NativeResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool, release_resources: bool) -> NativeResult<()> {
        let flags = if release_resources {
            vk::CommandPoolResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandPoolResetFlags::empty()
        };
        unsafe { self.device.reset_command_pool(pool, flags) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool, level: vk::CommandBufferLevel) -> NativeResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&alloc_info) }?
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, desc: &CommandBufferBeginDesc) -> NativeResult<()> {
        let inheritance = desc.inheritance.unwrap_or(InheritanceDesc {
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            framebuffer: vk::Framebuffer::null(),
            occlusion_query_enable: false,
            query_flags: vk::QueryControlFlags::empty(),
            pipeline_statistics: vk::QueryPipelineStatisticFlags::empty(),
        });
        let inheritance_info = vk::CommandBufferInheritanceInfo::builder()
            .render_pass(inheritance.render_pass)
            .subpass(inheritance.subpass)
            .framebuffer(inheritance.framebuffer)
            .occlusion_query_enable(inheritance.occlusion_query_enable)
            .query_flags(inheritance.query_flags)
            .pipeline_statistics(inheritance.pipeline_statistics);
        let mut device_group = vk::DeviceGroupCommandBufferBeginInfo::builder().device_mask(desc.device_mask.unwrap_or(0));

        let mut begin_info = vk::CommandBufferBeginInfo::builder().flags(desc.flags);
        if desc.inheritance.is_some() {
            begin_info = begin_info.inheritance_info(&inheritance_info);
        }
        if desc.device_mask.is_some() {
            begin_info = begin_info.push_next(&mut device_group);
        }
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> NativeResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer, release_resources: bool) -> NativeResult<()> {
        let flags = if release_resources {
            vk::CommandBufferResetFlags::RELEASE_RESOURCES
        } else {
            vk::CommandBufferResetFlags::empty()
        };
        unsafe { self.device.reset_command_buffer(command_buffer, flags) }
    }

    fn record_command(&self, cb: vk::CommandBuffer, command: &Command) {
        let d = &self.device;
        unsafe {
            match command {
                Command::CopyBuffer { src, dst, regions } => d.cmd_copy_buffer(cb, src.handle(), dst.handle(), regions),
                Command::CopyImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => d.cmd_copy_image(cb, src.handle(), *src_layout, dst.handle(), *dst_layout, regions),
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => d.cmd_copy_buffer_to_image(cb, src.handle(), dst.handle(), *dst_layout, regions),
                Command::CopyImageToBuffer {
                    src,
                    src_layout,
                    dst,
                    regions,
                } => d.cmd_copy_image_to_buffer(cb, src.handle(), *src_layout, dst.handle(), regions),
                Command::BlitImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                    filter,
                } => d.cmd_blit_image(cb, src.handle(), *src_layout, dst.handle(), *dst_layout, regions, *filter),
                Command::ResolveImage {
                    src,
                    src_layout,
                    dst,
                    dst_layout,
                    regions,
                } => d.cmd_resolve_image(cb, src.handle(), *src_layout, dst.handle(), *dst_layout, regions),
                Command::ClearColorImage {
                    image,
                    layout,
                    color,
                    ranges,
                } => d.cmd_clear_color_image(cb, image.handle(), *layout, &color.to_vk(), ranges),
                Command::ClearDepthStencilImage {
                    image,
                    layout,
                    depth,
                    stencil,
                    ranges,
                } => d.cmd_clear_depth_stencil_image(
                    cb,
                    image.handle(),
                    *layout,
                    &vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: *stencil,
                    },
                    ranges,
                ),
                Command::FillBuffer {
                    buffer,
                    offset,
                    size,
                    data,
                } => d.cmd_fill_buffer(cb, buffer.handle(), *offset, *size, *data),
                Command::UpdateBuffer { buffer, offset, data } => d.cmd_update_buffer(cb, buffer.handle(), *offset, data),
                Command::Dispatch { group_count: [x, y, z] } => d.cmd_dispatch(cb, *x, *y, *z),
                Command::DispatchIndirect { buffer, offset } => d.cmd_dispatch_indirect(cb, buffer.handle(), *offset),
                Command::DispatchBase {
                    base_group: [bx, by, bz],
                    group_count: [x, y, z],
                } => d.cmd_dispatch_base(cb, *bx, *by, *bz, *x, *y, *z),
                Command::SetEvent { event, stages } => d.cmd_set_event(cb, event.handle(), *stages),
                Command::ResetEvent { event, stages } => d.cmd_reset_event(cb, event.handle(), *stages),
                Command::ResetQueryPool {
                    pool,
                    first_query,
                    query_count,
                } => d.cmd_reset_query_pool(cb, pool.handle(), *first_query, *query_count),
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer_handle,
                    render_area,
                    clear_values,
                    contents,
                    device_mask,
                    ..
                } => {
                    let clears: Vec<vk::ClearValue> = clear_values.iter().map(|c| c.to_vk()).collect();
                    let mut device_group = vk::DeviceGroupRenderPassBeginInfo::builder()
                        .device_mask(device_mask.unwrap_or(0))
                        .device_render_areas(std::slice::from_ref(render_area));
                    let mut begin_info = vk::RenderPassBeginInfo::builder()
                        .render_pass(render_pass.handle())
                        .framebuffer(*framebuffer_handle)
                        .render_area(*render_area)
                        .clear_values(&clears);
                    if device_mask.is_some() {
                        begin_info = begin_info.push_next(&mut device_group);
                    }
                    d.cmd_begin_render_pass(cb, &begin_info, *contents);
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => d.cmd_draw(cb, *vertex_count, *instance_count, *first_vertex, *first_instance),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => d.cmd_draw_indexed(
                    cb,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
                Command::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => d.cmd_draw_indirect(cb, buffer.handle(), *offset, *draw_count, *stride),
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => d.cmd_draw_indexed_indirect(cb, buffer.handle(), *offset, *draw_count, *stride),
                Command::DrawIndirectCount {
                    indexed,
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_draw_count,
                    stride,
                } => match &self.draw_indirect_count {
                    Some(ext) if *indexed => ext.cmd_draw_indexed_indirect_count(
                        cb,
                        buffer.handle(),
                        *offset,
                        count_buffer.handle(),
                        *count_offset,
                        *max_draw_count,
                        *stride,
                    ),
                    Some(ext) => ext.cmd_draw_indirect_count(
                        cb,
                        buffer.handle(),
                        *offset,
                        count_buffer.handle(),
                        *count_offset,
                        *max_draw_count,
                        *stride,
                    ),
                    None => log::error!("vkCmdDrawIndirectCount dropped: VK_KHR_draw_indirect_count is not enabled"),
                },
                Command::ClearAttachments { attachments, rects } => {
                    let attachments: Vec<vk::ClearAttachment> = attachments.iter().map(|a| a.to_vk()).collect();
                    d.cmd_clear_attachments(cb, &attachments, rects);
                }
                Command::BeginTransformFeedback {
                    first_counter_buffer,
                    counter_buffers,
                    counter_offsets,
                } => {
                    if let Some(ext) = &self.transform_feedback {
                        let buffers: Vec<vk::Buffer> = counter_buffers.iter().map(|b| b.handle()).collect();
                        (ext.cmd_begin_transform_feedback_ext)(
                            cb,
                            *first_counter_buffer,
                            buffers.len() as u32,
                            if buffers.is_empty() { std::ptr::null() } else { buffers.as_ptr() },
                            if counter_offsets.is_empty() {
                                std::ptr::null()
                            } else {
                                counter_offsets.as_ptr()
                            },
                        );
                    }
                }
                Command::EndTransformFeedback {
                    first_counter_buffer,
                    counter_buffers,
                    counter_offsets,
                } => {
                    if let Some(ext) = &self.transform_feedback {
                        let buffers: Vec<vk::Buffer> = counter_buffers.iter().map(|b| b.handle()).collect();
                        (ext.cmd_end_transform_feedback_ext)(
                            cb,
                            *first_counter_buffer,
                            buffers.len() as u32,
                            if buffers.is_empty() { std::ptr::null() } else { buffers.as_ptr() },
                            if counter_offsets.is_empty() {
                                std::ptr::null()
                            } else {
                                counter_offsets.as_ptr()
                            },
                        );
                    }
                }
                Command::NextSubpass { contents } => d.cmd_next_subpass(cb, *contents),
                Command::EndRenderPass => d.cmd_end_render_pass(cb),
                Command::BindPipeline { bind_point, pipeline } => d.cmd_bind_pipeline(cb, *bind_point, *pipeline),
                Command::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                    dynamic_offsets,
                } => {
                    let sets: Vec<vk::DescriptorSet> = sets.iter().map(|s| s.handle()).collect();
                    d.cmd_bind_descriptor_sets(cb, *bind_point, layout.handle(), *first_set, &sets, dynamic_offsets);
                }
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => d.cmd_bind_index_buffer(cb, buffer.handle(), *offset, *index_type),
                Command::BindVertexBuffers {
                    first_binding,
                    buffers,
                    offsets,
                } => {
                    let buffers: Vec<vk::Buffer> = buffers.iter().map(|b| b.handle()).collect();
                    d.cmd_bind_vertex_buffers(cb, *first_binding, &buffers, offsets);
                }
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => d.cmd_push_constants(cb, layout.handle(), *stages, *offset, data),
                Command::PipelineBarrier(barrier) => d.cmd_pipeline_barrier(
                    cb,
                    barrier.src_stage_mask,
                    barrier.dst_stage_mask,
                    barrier.dependency_flags,
                    &barrier.vk_memory_barriers(),
                    &barrier.vk_buffer_barriers(),
                    &barrier.vk_image_barriers(),
                ),
                Command::WaitEvents { events, barrier } => {
                    let events: Vec<vk::Event> = events.iter().map(|e| e.handle()).collect();
                    d.cmd_wait_events(
                        cb,
                        &events,
                        barrier.src_stage_mask,
                        barrier.dst_stage_mask,
                        &barrier.vk_memory_barriers(),
                        &barrier.vk_buffer_barriers(),
                        &barrier.vk_image_barriers(),
                    );
                }
                Command::SetViewport {
                    first_viewport,
                    viewports,
                } => {
                    let viewports: Vec<vk::Viewport> = viewports.iter().map(|v| v.to_vk()).collect();
                    d.cmd_set_viewport(cb, *first_viewport, &viewports);
                }
                Command::SetScissor { first_scissor, scissors } => {
                    let scissors: Vec<vk::Rect2D> = scissors.iter().map(|s| s.to_vk()).collect();
                    d.cmd_set_scissor(cb, *first_scissor, &scissors);
                }
                Command::SetLineWidth(width) => d.cmd_set_line_width(cb, *width),
                Command::SetBlendConstants(constants) => d.cmd_set_blend_constants(cb, constants),
                Command::SetDepthBias {
                    constant_factor,
                    clamp,
                    slope_factor,
                } => d.cmd_set_depth_bias(cb, *constant_factor, *clamp, *slope_factor),
                Command::SetDepthBounds { min, max } => d.cmd_set_depth_bounds(cb, *min, *max),
                Command::SetStencilCompareMask { faces, mask } => d.cmd_set_stencil_compare_mask(cb, *faces, *mask),
                Command::SetStencilWriteMask { faces, mask } => d.cmd_set_stencil_write_mask(cb, *faces, *mask),
                Command::SetStencilReference { faces, reference } => {
                    d.cmd_set_stencil_reference(cb, *faces, *reference);
                }
                Command::SetDeviceMask(mask) => d.cmd_set_device_mask(cb, *mask),
                Command::SetSampleLocations(locations) => {
                    if let Some(ext) = &self.sample_locations {
                        let points: Vec<vk::SampleLocationEXT> = locations
                            .locations
                            .iter()
                            .map(|[x, y]| vk::SampleLocationEXT { x: *x, y: *y })
                            .collect();
                        let info = vk::SampleLocationsInfoEXT::builder()
                            .sample_locations_per_pixel(locations.per_pixel)
                            .sample_location_grid_size(vk::Extent2D {
                                width: locations.grid_width,
                                height: locations.grid_height,
                            })
                            .sample_locations(&points);
                        (ext.cmd_set_sample_locations_ext)(cb, &*info);
                    }
                }
                Command::BeginQuery { pool, query, flags } => d.cmd_begin_query(cb, pool.handle(), *query, *flags),
                Command::EndQuery { pool, query } => d.cmd_end_query(cb, pool.handle(), *query),
                Command::WriteTimestamp { stage, pool, query } => d.cmd_write_timestamp(cb, *stage, pool.handle(), *query),
                Command::BeginDebugLabel { name, color } => {
                    if let Some(utils) = &self.debug_utils {
                        let (name, color) = Self::debug_label(name, *color);
                        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
                        utils.cmd_begin_debug_utils_label(cb, &label);
                    }
                }
                Command::EndDebugLabel => {
                    if let Some(utils) = &self.debug_utils {
                        utils.cmd_end_debug_utils_label(cb);
                    }
                }
                Command::InsertDebugLabel { name, color } => {
                    if let Some(utils) = &self.debug_utils {
                        let (name, color) = Self::debug_label(name, *color);
                        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name).color(color);
                        utils.cmd_insert_debug_utils_label(cb, &label);
                    }
                }
                Command::ExecuteCommands(secondaries) => {
                    let handles: Vec<vk::CommandBuffer> = secondaries.iter().map(|s| s.handle()).collect();
                    d.cmd_execute_commands(cb, &handles);
                }
            }
        }
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }

    fn queue_submit(&self, queue: vk::Queue, submits: &[SubmitDesc], fence: vk::Fence) -> NativeResult<()> {
        let mut device_groups: Vec<vk::DeviceGroupSubmitInfo> = submits
            .iter()
            .map(|s| {
                vk::DeviceGroupSubmitInfo::builder()
                    .command_buffer_device_masks(&s.command_buffer_device_masks)
                    .build()
            })
            .collect();
        let infos: Vec<vk::SubmitInfo> = submits
            .iter()
            .zip(device_groups.iter_mut())
            .map(|(s, device_group)| {
                let mut builder = vk::SubmitInfo::builder()
                    .wait_semaphores(&s.wait_semaphores)
                    .wait_dst_stage_mask(&s.wait_stages)
                    .command_buffers(&s.command_buffers)
                    .signal_semaphores(&s.signal_semaphores);
                if !s.command_buffer_device_masks.is_empty() {
                    builder = builder.push_next(device_group);
                }
                builder.build()
            })
            .collect();

        // Queue access is externally synchronized by the framework's queue lock.
        unsafe { self.device.queue_submit(queue, &infos, fence) }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> NativeResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn queue_present(&self, queue: vk::Queue, desc: &PresentDesc) -> NativeResult<bool> {
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&desc.wait_semaphores)
            .swapchains(&desc.swapchains)
            .image_indices(&desc.image_indices);
        unsafe { self.swapchain_loader.queue_present(queue, &present_info) }
    }

    fn device_wait_idle(&self) -> NativeResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_surface(&self, target: &SurfaceTarget) -> NativeResult<vk::SurfaceKHR> {
        let surface = unsafe { ash_window::create_surface(&self.entry, &self.instance, target.display, target.window, None) }?;
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                self.capabilities.universal_queue_family,
                surface,
            )
        };
        match supported {
            Ok(true) => Ok(surface),
            Ok(false) => {
                unsafe { self.surface_loader.destroy_surface(surface, None) };
                Err(vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR)
            }
            Err(e) => {
                unsafe { self.surface_loader.destroy_surface(surface, None) };
                Err(e)
            }
        }
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn surface_properties(&self, surface: vk::SurfaceKHR) -> NativeResult<SurfaceProperties> {
        unsafe {
            let caps = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)?;
            Ok(SurfaceProperties {
                formats: formats.iter().map(|f| (f.format, f.color_space)).collect(),
                present_modes,
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent: (caps.current_extent.width != u32::MAX)
                    .then_some((caps.current_extent.width, caps.current_extent.height)),
                current_transform: caps.current_transform,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> NativeResult<vk::SwapchainKHR> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, desc.surface)
        }?;
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format)
            .image_color_space(desc.color_space)
            .image_extent(vk::Extent2D {
                width: desc.width,
                height: desc.height,
            })
            .image_array_layers(1)
            .image_usage(desc.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(desc.old_swapchain);
        unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> NativeResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> NativeResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout, semaphore, fence)
        }
    }

    fn set_object_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) -> NativeResult<()> {
        let Some(utils) = &self.debug_utils else {
            return Ok(());
        };
        let name = CString::new(name.replace('\0', " ")).map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        let name_info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(raw_handle)
            .object_name(&name);
        unsafe { utils.set_debug_utils_object_name(self.device.handle(), &name_info) }
    }

    fn set_object_tag(&self, object_type: vk::ObjectType, raw_handle: u64, tag_name: u64, data: &[u8]) -> NativeResult<()> {
        let Some(utils) = &self.debug_utils else {
            return Ok(());
        };
        let tag_info = vk::DebugUtilsObjectTagInfoEXT::builder()
            .object_type(object_type)
            .object_handle(raw_handle)
            .tag_name(tag_name)
            .tag(data);
        unsafe { utils.set_debug_utils_object_tag(self.device.handle(), &tag_info) }
    }

    fn read_back_image(&self, desc: &ReadbackDesc) -> NativeResult<Vec<u8>> {
        let transfer = lock_state(&self.transfer);
        self.read_back_locked(&transfer, desc)
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(lock_state(&self.transfer).pool, None);
            for (_, memory) in lock_state(&self.allocations).drain() {
                self.device.free_memory(memory, None);
            }
            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
