//! Instance, device and allocator setup for a headless Vulkan queue.

use std::ffi::CStr;

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::error::{RhiError, RhiResult};
use crate::rhi::Capabilities;

/// Dynamic rendering, timeline semaphores and extended dynamic state are core in 1.3.
const REQUIRED_API_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

fn init_error(what: &str, err: impl std::fmt::Debug) -> RhiError {
    RhiError::InitializationFailed(format!("{}: {:?}", what, err))
}

pub struct Instance {
    pub instance: ash::Instance,
    pub debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

pub fn create_instance(entry: &ash::Entry, validation: bool) -> RhiResult<Instance> {
    let validation = validation && has_validation_layer(entry);

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"render-rhi")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"render-rhi")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(REQUIRED_API_VERSION);

    let mut extensions = Vec::new();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }
    let layers = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| init_error("Failed to create Vulkan instance", e))?;

    let debug = if validation {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, &instance);
        let messenger = create_debug_messenger(&debug_utils)?;
        Some((debug_utils, messenger))
    } else {
        None
    };

    Ok(Instance { instance, debug })
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|layer| {
        // SAFETY: layer names are null-terminated strings written by the loader
        let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        name == VALIDATION_LAYER_NAME
    })
}

fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> RhiResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| init_error("Failed to create debug messenger", e))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() {
        String::from("(no message)")
    } else {
        // SAFETY: the driver passes valid callback data for the duration of the call
        let data = unsafe { *callback_data };
        if data.p_message.is_null() {
            String::from("(null message)")
        } else {
            // SAFETY: p_message is a null-terminated string owned by the driver
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", message);
    } else {
        log::warn!("[Vulkan] {}", message);
    }
    vk::FALSE
}

/// Physical device chosen for the queue, with the optional features it offers.
pub struct Adapter {
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queue_family: u32,
    pub capabilities: Capabilities,
}

/// Pick the best device with a graphics queue, preferring discrete GPUs.
pub fn select_adapter(instance: &ash::Instance) -> RhiResult<Adapter> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(|e| init_error("Failed to enumerate physical devices", e))?;

    let mut best: Option<(u32, Adapter)> = None;
    for physical_device in devices {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        if properties.api_version < REQUIRED_API_VERSION {
            continue;
        }
        let Some(queue_family) = graphics_queue_family(instance, physical_device) else {
            continue;
        };

        // SAFETY: device_name is a null-terminated string filled in by the driver
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        log::info!(
            "Found GPU: {} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            let capabilities = probe_capabilities(instance, physical_device);
            best = Some((
                score,
                Adapter {
                    physical_device,
                    name,
                    queue_family,
                    capabilities,
                },
            ));
        }
    }

    best.map(|(_, adapter)| adapter).ok_or_else(|| {
        RhiError::InitializationFailed("No Vulkan 1.3 GPU with a graphics queue found".to_string())
    })
}

fn graphics_queue_family(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
}

fn probe_capabilities(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Capabilities {
    let mut features11 = vk::PhysicalDeviceVulkan11Features::default();
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut features11)
        .push_next(&mut features12);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };

    let view_instancing = features11.multiview == vk::TRUE;
    let layered_rendering = features12.shader_output_layer == vk::TRUE;
    Capabilities {
        shader_model_6_1: view_instancing && layered_rendering,
        view_instancing,
        layered_rendering,
    }
}

pub fn create_logical_device(instance: &ash::Instance, adapter: &Adapter) -> RhiResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(adapter.queue_family)
        .queue_priorities(&priorities)];

    let mut features11 =
        vk::PhysicalDeviceVulkan11Features::default().multiview(adapter.capabilities.view_instancing);
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
        .timeline_semaphore(true)
        .shader_output_layer(adapter.capabilities.layered_rendering);
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .push_next(&mut features11)
        .push_next(&mut features12)
        .push_next(&mut features13);

    unsafe { instance.create_device(adapter.physical_device, &create_info, None) }
        .map_err(|e| init_error("Failed to create logical device", e))
}

pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> RhiResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| RhiError::InitializationFailed(format!("Failed to create memory allocator: {}", e)))
}

/// Timeline semaphore backing the queue fence.
pub fn create_timeline(device: &ash::Device) -> RhiResult<vk::Semaphore> {
    let mut type_info = vk::SemaphoreTypeCreateInfo::default()
        .semaphore_type(vk::SemaphoreType::TIMELINE)
        .initial_value(0);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
    unsafe { device.create_semaphore(&create_info, None) }
        .map_err(|e| init_error("Failed to create timeline semaphore", e))
}
