// Vulkan device context - core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (first enumerated)
// - Logical device + graphics queue creation

use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use thiserror::Error;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Failures that leave the process without a usable GPU context.
#[derive(Debug, Error)]
pub enum DeviceInitError {
    #[error("failed to load the Vulkan library: {0}")]
    LibraryLoad(#[from] ash::LoadingError),
    #[error("application name contains an interior nul byte")]
    InvalidAppName,
    #[error("no Vulkan-capable GPU found")]
    NoPhysicalDevice,
    #[error("no queue family with graphics support")]
    NoGraphicsQueue,
    #[error("{call} failed: {result}")]
    Api {
        call: &'static str,
        result: vk::Result,
    },
}

fn api(call: &'static str) -> impl FnOnce(vk::Result) -> DeviceInitError {
    move |result| DeviceInitError::Api { call, result }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    entry: Entry,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    // Debug utils (if validation enabled)
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached, queried once)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    /// Create the Vulkan context.
    ///
    /// `instance_extensions` are the platform surface extensions reported by
    /// the windowing layer; `device_extensions` normally just names the
    /// swapchain extension. Validation/debug extensions are layered on top
    /// when `enable_validation` is set.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        instance_extensions: &[*const c_char],
        device_extensions: &[*const c_char],
    ) -> Result<Arc<Self>, DeviceInitError> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let instance =
            Self::create_instance(&entry, app_name, enable_validation, instance_extensions)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, graphics_queue_family) = Self::pick_physical_device(&instance)?;

        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            device_extensions,
        )?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "API version: {}.{}.{}, timestamp period: {} ns",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version),
            properties.limits.timestamp_period,
        );
        for i in 0..memory_properties.memory_heap_count {
            let heap = memory_properties.memory_heaps[i as usize];
            log::debug!(
                "Memory heap {}: {} bytes, device local: {}",
                i,
                heap.size,
                heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL),
            );
        }

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            entry,
            graphics_queue,
            graphics_queue_family,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        platform_extensions: &[*const c_char],
    ) -> Result<ash::Instance, DeviceInitError> {
        let app_name_cstr = CString::new(app_name).map_err(|_| DeviceInitError::InvalidAppName)?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = platform_extensions.to_vec();

        // Only enable the validation layer when the loader actually has it
        let validation_available = enable_validation
            && entry
                .enumerate_instance_layer_properties()
                .map_err(api("vkEnumerateInstanceLayerProperties"))?
                .iter()
                .any(|layer| {
                    unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER
                });
        if enable_validation && !validation_available {
            log::warn!("Validation layer requested but not installed, continuing without it");
        }

        let layer_names = if validation_available {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(api("vkCreateInstance"))?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT), DeviceInitError>
    {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(api("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((debug_utils, messenger))
    }

    /// First enumerated device wins; the simplest deterministic policy.
    fn pick_physical_device(
        instance: &ash::Instance,
    ) -> Result<(vk::PhysicalDevice, u32), DeviceInitError> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(api("vkEnumeratePhysicalDevices"))?;

        if devices.is_empty() {
            return Err(DeviceInitError::NoPhysicalDevice);
        }

        log::info!("Found {} GPU(s):", devices.len());
        for (i, &device) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(device) };
            log::info!(
                "  GPU {}: {}",
                i,
                unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy()
            );
        }

        let physical_device = devices[0];
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(props.device_name.as_ptr()) }.to_string_lossy()
        );

        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let graphics_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, family)| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .ok_or(DeviceInitError::NoGraphicsQueue)?;

        Ok((physical_device, graphics_family))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        device_extensions: &[*const c_char],
    ) -> Result<(ash::Device, vk::Queue), DeviceInitError> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let enabled_features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(device_extensions)
            .enabled_features(&enabled_features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .map_err(api("vkCreateDevice"))?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        Ok((device, graphics_queue))
    }

    /// Loader entry point, needed to construct surface extension loaders.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Wait for the device to be idle (e.g., before teardown)
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order of creation
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
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
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
