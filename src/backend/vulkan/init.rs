// Vulkan init - instance, adapter and logical device
//
// Responsibilities:
// - Instance creation with validation layers and surface extensions
// - Debug messenger routed into `log`
// - Physical device selection (prefer discrete GPU) gated on the 1.3 feature set
// - One queue per distinct family serving graphics, compute and transfer
// - Memory allocator setup

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{CStr, CString};

use super::surface;
use crate::error::{DeviceError, DeviceResult};
use crate::resources::QueueKind;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Teardown steps for objects created so far, run newest first unless
/// initialization completes
pub(super) struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Initialization succeeded, keep everything
    pub fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            log::debug!("Rolling back {} partially created Vulkan objects", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

pub(super) fn load_entry() -> DeviceResult<Entry> {
    let entry = unsafe { Entry::load() }.context("Failed to load Vulkan library. Is Vulkan installed?")?;
    Ok(entry)
}

/// Returns the instance and whether debug utils were enabled
pub(super) fn create_instance(
    entry: &Entry,
    app_name: &str,
    display: RawDisplayHandle,
    enable_validation: bool,
) -> DeviceResult<(ash::Instance, bool)> {
    let app_name_cstr = CString::new(app_name).context("Application name contains a NUL byte")?;
    let engine_name = c"render-device";

    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = surface::required_extensions(display)?;

    // Validation is best effort: skip the layer when it is not installed
    let mut layer_names = Vec::new();
    let mut debug_utils = false;
    if enable_validation {
        let available = entry
            .enumerate_instance_layer_properties()
            .context("Failed to enumerate instance layers")?;
        let found = available
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if found {
            layer_names.push(VALIDATION_LAYER.as_ptr());
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            debug_utils = true;
        } else {
            log::warn!("Validation requested but {:?} is not available", VALIDATION_LAYER);
        }
    }

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }.context("Failed to create Vulkan instance")?;

    Ok((instance, debug_utils))
}

pub(super) fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

/// Adapter chosen for the device, with its queue family layout
pub(super) struct Adapter {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    /// Family per `QueueKind`
    pub families: [u32; QueueKind::COUNT],
    pub timestamps_supported: bool,
}

pub(super) fn pick_adapter(
    instance: &ash::Instance,
    surface_loader: &ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,
) -> DeviceResult<Adapter> {
    let devices = unsafe { instance.enumerate_physical_devices() }.context("Failed to enumerate GPUs")?;

    if devices.is_empty() {
        return Err(DeviceError::NoSuitableAdapter);
    }

    let mut best: Option<(u32, Adapter)> = None;
    let mut missing = None;

    for device in devices {
        let props = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy().into_owned();

        if vk::api_version_minor(props.api_version) < 3 && vk::api_version_major(props.api_version) == 1 {
            log::debug!("Skipping {}: Vulkan 1.3 not supported", name);
            continue;
        }
        if let Err(feature) = check_device_features(instance, device) {
            log::debug!("Skipping {}: missing {}", name, feature);
            missing = Some(feature);
            continue;
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(families) = select_queue_families(&queue_families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .unwrap_or(false)
        }) else {
            log::debug!("Skipping {}: no graphics queue that can present", name);
            continue;
        };

        // Score device (prefer discrete GPU)
        let score = match props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            let graphics = &queue_families[families[QueueKind::Graphics.index()] as usize];
            let timestamps_supported =
                props.limits.timestamp_compute_and_graphics == vk::TRUE && graphics.timestamp_valid_bits > 0;
            best = Some((
                score,
                Adapter {
                    physical_device: device,
                    properties: props,
                    families,
                    timestamps_supported,
                },
            ));
        }
    }

    match (best, missing) {
        (Some((_, adapter)), _) => Ok(adapter),
        (None, Some(feature)) => Err(DeviceError::MissingCapability(feature.to_string())),
        (None, None) => Err(DeviceError::NoSuitableAdapter),
    }
}

/// Graphics must present; compute and transfer prefer dedicated families and
/// fall back to the graphics family
pub(super) fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
) -> Option<[u32; QueueKind::COUNT]> {
    let find = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .enumerate()
            .find(|(_, props)| props.queue_count > 0 && pred(props.queue_flags))
            .map(|(i, _)| i as u32)
    };

    let graphics = families
        .iter()
        .enumerate()
        .find(|&(i, props)| props.queue_flags.contains(vk::QueueFlags::GRAPHICS) && can_present(i as u32))
        .map(|(i, _)| i as u32)?;

    let compute = find(&|flags| flags.contains(vk::QueueFlags::COMPUTE) && !flags.contains(vk::QueueFlags::GRAPHICS))
        .unwrap_or(graphics);
    let transfer = find(&|flags| {
        flags.contains(vk::QueueFlags::TRANSFER)
            && !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .unwrap_or(compute);

    Some([graphics, compute, transfer])
}

fn check_device_features(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> Result<(), &'static str> {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features12)
        .push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(device, &mut features) };
    let core = features.features;

    let required = [
        (core.sampler_anisotropy, "samplerAnisotropy"),
        (features13.synchronization2, "synchronization2"),
        (features13.dynamic_rendering, "dynamicRendering"),
        (features12.timeline_semaphore, "timelineSemaphore"),
        (features12.descriptor_indexing, "descriptorIndexing"),
        (features12.runtime_descriptor_array, "runtimeDescriptorArray"),
        (features12.descriptor_binding_partially_bound, "descriptorBindingPartiallyBound"),
        (
            features12.descriptor_binding_sampled_image_update_after_bind,
            "descriptorBindingSampledImageUpdateAfterBind",
        ),
        (
            features12.shader_sampled_image_array_non_uniform_indexing,
            "shaderSampledImageArrayNonUniformIndexing",
        ),
    ];
    match required.iter().find(|(supported, _)| *supported != vk::TRUE) {
        Some(&(_, name)) => Err(name),
        None => Ok(()),
    }
}

pub(super) fn create_logical_device(
    instance: &ash::Instance,
    adapter: &Adapter,
) -> Result<(ash::Device, [vk::Queue; QueueKind::COUNT])> {
    let mut unique = adapter.families.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let queue_priorities = [1.0];
    let queue_create_infos: Vec<_> = unique
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::builder()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
                .build()
        })
        .collect();

    // Required device extensions; dynamic rendering and sync2 are core in 1.3
    let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

    let enabled = vk::PhysicalDeviceFeatures {
        sampler_anisotropy: vk::TRUE,
        ..Default::default()
    };
    let mut features12 = vk::PhysicalDeviceVulkan12Features::builder()
        .timeline_semaphore(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_sampled_image_update_after_bind(true)
        .shader_sampled_image_array_non_uniform_indexing(true);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::builder()
        .synchronization2(true)
        .dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&enabled)
        .push_next(&mut features12)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(adapter.physical_device, &create_info, None) }
        .context("Failed to create logical device")?;

    let queues = adapter
        .families
        .map(|family| unsafe { device.get_device_queue(family, 0) });

    Ok((device, queues))
}

pub(super) fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> Result<gpu_allocator::vulkan::Allocator> {
    let allocator = gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    })
    .context("Failed to create memory allocator")?;

    Ok(allocator)
}

pub(super) fn create_timeline(device: &ash::Device) -> Result<vk::Semaphore> {
    let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
    let semaphore = unsafe { device.create_semaphore(&info, None) }.context("Failed to create timeline semaphore")?;
    Ok(semaphore)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
