//! Vulkan instance and device bootstrap
//!
//! Headless setup: no surface or swapchain extensions. The selected device must
//! expose three distinct queue families: graphics, a dedicated compute family
//! (no graphics) and a dedicated transfer family (neither compute nor graphics).
//! Scene uploads go through the transfer queue while render streams submit on
//! the graphics queue.

use crate::render::error::{RenderError, RenderResult};
use ash::extensions::ext::DebugUtils;
use ash::{vk, Device, Entry, Instance};
use std::ffi::{CStr, CString};
use std::sync::Mutex;

/// Queue family indices used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// First family with graphics support
    pub graphics: u32,
    /// First family with compute but no graphics
    pub compute: u32,
    /// First family with transfer but neither compute nor graphics
    pub transfer: u32,
}

/// Pick queue families in a single scan; lower indices win
pub fn select_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let mut graphics = None;
    let mut compute = None;
    let mut transfer = None;

    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        let flags = family.queue_flags;
        if family.queue_count == 0 {
            continue;
        }

        if flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics.get_or_insert(index);
        } else if flags.contains(vk::QueueFlags::COMPUTE) {
            compute.get_or_insert(index);
        } else if flags.contains(vk::QueueFlags::TRANSFER) {
            transfer.get_or_insert(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        compute: compute?,
        transfer: transfer?,
    })
}

/// First candidate whose optimal tiling features include `required`
pub fn select_format(
    candidates: &[vk::Format],
    required: vk::FormatFeatureFlags,
    purpose: &'static str,
    query: impl Fn(vk::Format) -> vk::FormatProperties,
) -> RenderResult<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| query(format).optimal_tiling_features.contains(required))
        .ok_or(RenderError::UnsupportedFormat { purpose, required })
}

/// Whether a texture array can be indexed per fragment with `nonuniformEXT`
pub fn nonuniform_texture_indexing(
    api_version: u32,
    core: &vk::PhysicalDeviceFeatures,
    indexing: &vk::PhysicalDeviceDescriptorIndexingFeatures,
) -> bool {
    api_version >= vk::API_VERSION_1_2
        && core.shader_sampled_image_array_dynamic_indexing == vk::TRUE
        && indexing.shader_sampled_image_array_non_uniform_indexing == vk::TRUE
}

/// Device queue guarded for external synchronization
pub struct Queue {
    queue: Mutex<vk::Queue>,
    family: u32,
}

impl Queue {
    fn new(queue: vk::Queue, family: u32) -> Self {
        Self { queue: Mutex::new(queue), family }
    }

    /// Queue family index
    pub fn family(&self) -> u32 {
        self.family
    }

    /// Submit command buffers, signalling `fence` on completion
    pub fn submit(&self, device: &Device, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> RenderResult<()> {
        let submit_info = vk::SubmitInfo::builder().command_buffers(command_buffers).build();
        let queue = self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unsafe { device.queue_submit(*queue, &[submit_info], fence)? };
        Ok(())
    }
}

/// Instance, physical device, logical device and queues
///
/// Every GPU resource in the crate holds an `Arc<DeviceContext>`, so the device
/// is destroyed only after the last resource.
pub struct DeviceContext {
    _entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    device: Device,
    families: QueueFamilies,
    graphics_queue: Queue,
    _compute_queue: Queue,
    transfer_queue: Queue,
    nonuniform_textures: bool,
    name: String,
}

impl DeviceContext {
    /// Load Vulkan and open the device at `gpu_index`
    pub fn new(gpu_index: u32, enable_validation: bool) -> RenderResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| RenderError::LoaderUnavailable(e.to_string()))?;
        let instance = create_instance(&entry, enable_validation)?;

        let debug = if enable_validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    log::warn!("Debug messenger unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // From here on, failures must release the instance
        let context = Self::open_device(&instance, gpu_index);
        match context {
            Ok((physical_device, properties, families, device, nonuniform_textures)) => {
                let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
                let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy().into_owned();
                let (graphics, compute, transfer) = unsafe {
                    (
                        device.get_device_queue(families.graphics, 0),
                        device.get_device_queue(families.compute, 0),
                        device.get_device_queue(families.transfer, 0),
                    )
                };

                log::info!(
                    "Selected GPU {}: {} (graphics family {}, compute family {}, transfer family {})",
                    gpu_index,
                    name,
                    families.graphics,
                    families.compute,
                    families.transfer
                );

                Ok(Self {
                    _entry: entry,
                    instance,
                    debug,
                    physical_device,
                    properties,
                    memory_properties,
                    device,
                    families,
                    graphics_queue: Queue::new(graphics, families.graphics),
                    _compute_queue: Queue::new(compute, families.compute),
                    transfer_queue: Queue::new(transfer, families.transfer),
                    nonuniform_textures,
                    name,
                })
            }
            Err(e) => {
                unsafe {
                    if let Some((debug_utils, messenger)) = &debug {
                        debug_utils.destroy_debug_utils_messenger(*messenger, None);
                    }
                    instance.destroy_instance(None);
                }
                Err(e)
            }
        }
    }

    fn open_device(
        instance: &Instance,
        gpu_index: u32,
    ) -> RenderResult<(vk::PhysicalDevice, vk::PhysicalDeviceProperties, QueueFamilies, Device, bool)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };
        let physical_device = *devices.get(gpu_index as usize).ok_or(RenderError::NoSuitableDevice {
            requested: gpu_index,
            available: devices.len() as u32,
        })?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let queue_properties = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families = select_queue_families(&queue_properties).ok_or_else(|| RenderError::NoSuitableQueues {
            device: unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy().into_owned(),
        })?;

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = [families.graphics, families.compute, families.transfer]
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let supported = unsafe { instance.get_physical_device_features(physical_device) };
        let mut supported_indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::default();
        if properties.api_version >= vk::API_VERSION_1_2 {
            let mut query = vk::PhysicalDeviceFeatures2::builder().push_next(&mut supported_indexing);
            unsafe { instance.get_physical_device_features2(physical_device, &mut query) };
        }
        let nonuniform_textures =
            nonuniform_texture_indexing(properties.api_version, &supported, &supported_indexing);

        let features = vk::PhysicalDeviceFeatures::builder()
            .shader_sampled_image_array_dynamic_indexing(nonuniform_textures);
        let mut indexing = vk::PhysicalDeviceDescriptorIndexingFeatures::builder()
            .shader_sampled_image_array_non_uniform_indexing(true);

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&features);
        if nonuniform_textures {
            create_info = create_info.push_next(&mut indexing);
        }

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };
        log::debug!(
            "Logical device created with {} queue families (non-uniform texture indexing: {})",
            queue_infos.len(),
            nonuniform_textures
        );

        Ok((physical_device, properties, families, device, nonuniform_textures))
    }

    /// Logical device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Memory heaps and types
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    /// Device limits
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Selected queue families
    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    /// Graphics queue
    pub fn graphics_queue(&self) -> &Queue {
        &self.graphics_queue
    }

    /// Dedicated transfer queue
    pub fn transfer_queue(&self) -> &Queue {
        &self.transfer_queue
    }

    /// Whether textured pipelines can index their texture array per instance
    pub fn supports_nonuniform_textures(&self) -> bool {
        self.nonuniform_textures
    }

    /// Format capabilities
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe { self.instance.get_physical_device_format_properties(self.physical_device, format) }
    }

    /// Device name reported by the driver
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);

            if let Some((debug_utils, messenger)) = &self.debug {
                debug_utils.destroy_debug_utils_messenger(*messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &Entry, enable_validation: bool) -> RenderResult<Instance> {
    let app_name = CString::new("batch_renderer").map_err(|e| RenderError::InvalidConfig(e.to_string()))?;
    let app_info = vk::ApplicationInfo::builder()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(&app_name)
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_2);

    let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").map_err(|e| RenderError::InvalidConfig(e.to_string()))?;
    let validation_available = enable_validation && layer_available(entry, &validation_layer);
    if enable_validation && !validation_available {
        log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
    }

    let layers: Vec<*const std::os::raw::c_char> =
        if validation_available { vec![validation_layer.as_ptr()] } else { Vec::new() };
    let extensions: Vec<*const std::os::raw::c_char> =
        if enable_validation { vec![DebugUtils::name().as_ptr()] } else { Vec::new() };

    let create_info = vk::InstanceCreateInfo::builder()
        .application_info(&app_info)
        .enabled_layer_names(&layers)
        .enabled_extension_names(&extensions);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    log::debug!("Vulkan instance created (validation: {})", validation_available);
    Ok(instance)
}

fn layer_available(entry: &Entry, name: &CStr) -> bool {
    entry
        .enumerate_instance_layer_properties()
        .map(|layers| layers.iter().any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == name))
        .unwrap_or(false)
}

fn setup_debug_messenger(debug_utils: &DebugUtils) -> RenderResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    Ok(unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? })
}

/// Routes validation messages to `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties { queue_flags: flags, queue_count: 1, ..Default::default() }
    }

    #[test]
    fn picks_distinct_families_by_first_match() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING),
        ];

        assert_eq!(
            select_queue_families(&families),
            Some(QueueFamilies { graphics: 0, compute: 1, transfer: 2 })
        );
    }

    #[test]
    fn missing_dedicated_transfer_family_fails() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_families(&families), None);
    }

    #[test]
    fn graphics_family_with_compute_does_not_count_as_compute() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];
        assert_eq!(select_queue_families(&families), None);
    }

    #[test]
    fn format_selection_takes_first_supported_candidate() {
        let required = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT | vk::FormatFeatureFlags::TRANSFER_SRC;
        let query = |format: vk::Format| vk::FormatProperties {
            optimal_tiling_features: if format == vk::Format::D32_SFLOAT_S8_UINT { required } else { vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT },
            ..Default::default()
        };

        let chosen = select_format(&[vk::Format::D32_SFLOAT, vk::Format::D32_SFLOAT_S8_UINT], required, "depth", query);
        assert_eq!(chosen.ok(), Some(vk::Format::D32_SFLOAT_S8_UINT));
    }

    #[test]
    fn format_selection_fails_when_nothing_fits() {
        let required = vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::TRANSFER_SRC;
        let result = select_format(&[vk::Format::R8G8B8A8_UNORM], required, "color", |_| vk::FormatProperties::default());

        assert!(matches!(result, Err(RenderError::UnsupportedFormat { purpose: "color", .. })));
    }

    #[test]
    fn nonuniform_textures_need_both_features_on_vulkan_1_2() {
        let core = vk::PhysicalDeviceFeatures { shader_sampled_image_array_dynamic_indexing: vk::TRUE, ..Default::default() };
        let indexing = vk::PhysicalDeviceDescriptorIndexingFeatures {
            shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
            ..Default::default()
        };

        assert!(nonuniform_texture_indexing(vk::API_VERSION_1_2, &core, &indexing));
        assert!(!nonuniform_texture_indexing(vk::API_VERSION_1_1, &core, &indexing));
        assert!(!nonuniform_texture_indexing(vk::API_VERSION_1_2, &core, &Default::default()));
        assert!(!nonuniform_texture_indexing(vk::API_VERSION_1_2, &Default::default(), &indexing));
    }
}
