// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU)
// - Queue family resolution for graphics / transfer / present
// - Logical device + queue creation
// - Surface capability probing

use std::ffi::{CStr, CString};
use std::sync::Arc;

use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::{GlazeError, Result};

/// A resolved queue role: the handle and the family it was created from.
#[derive(Clone, Copy)]
pub struct Queue {
    pub handle: vk::Queue,
    pub family_index: u32,
}

/// One-time surface capability snapshot, re-queried before every
/// swapchain (re)creation since the capabilities track the window size.
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

struct QueueFamilyIndices {
    graphics: u32,
    transfer: u32,
    present: u32,
}

/// Owns the instance / physical device / logical device and the three
/// queues. Immutable for the life of the backend once constructed.
pub struct DeviceContext {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::extensions::khr::Surface,

    pub graphics_queue: Queue,
    pub transfer_queue: Queue,
    pub present_queue: Queue,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl DeviceContext {
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", app_name);

        let entry = unsafe { Entry::load() }?;

        let instance = Self::create_instance(&entry, app_name, enable_validation, display)?;

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        let surface = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }?;

        let (physical_device, families) =
            Self::pick_physical_device(&instance, &surface_loader, surface)?;

        let device = Self::create_logical_device(&instance, physical_device, &families)?;

        let queue = |family_index: u32| Queue {
            handle: unsafe { device.get_device_queue(family_index, 0) },
            family_index,
        };
        let graphics_queue = queue(families.graphics);
        let transfer_queue = queue(families.transfer);
        let present_queue = queue(families.present);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "Queue families: graphics={} transfer={} present={}",
            families.graphics,
            families.transfer,
            families.present
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            transfer_queue,
            present_queue,
            debug_utils,
            properties,
            memory_properties,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_default();
        let engine_name = CString::new("glaze").unwrap_or_default();

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        let mut extensions = ash_window::enumerate_required_extensions(display)?.to_vec();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }?;
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
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

        let messenger =
            unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

        Ok((debug_utils, messenger))
    }

    /// Scores candidates and keeps the best. Ties between equal-score
    /// devices resolve first-found-wins; which device that is varies by
    /// driver enumeration order.
    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }?;

        if devices.is_empty() {
            return Err(GlazeError::NoSuitableGpu);
        }

        let mut best: Option<(vk::PhysicalDevice, QueueFamilyIndices)> = None;
        let mut best_score = 0;

        for device in devices {
            if !Self::supports_swapchain(instance, device) {
                continue;
            }

            let Some(families) =
                Self::resolve_queue_families(instance, device, surface_loader, surface)?
            else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((device, families));
            }
        }

        best.ok_or(GlazeError::NoSuitableGpu)
    }

    fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
        let Ok(extensions) = (unsafe { instance.enumerate_device_extension_properties(device) })
        else {
            return false;
        };
        extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) })
                == ash::extensions::khr::Swapchain::name()
        })
    }

    /// Prefers a transfer family without the graphics bit and a present
    /// family distinct from both; aliases onto the graphics family when
    /// the hardware offers no spare.
    fn resolve_queue_families(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface_loader: &ash::extensions::khr::Surface,
        surface: vk::SurfaceKHR,
    ) -> Result<Option<QueueFamilyIndices>> {
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut graphics = None;
        let mut transfer = None;
        let mut present = None;

        for (index, properties) in families.iter().enumerate() {
            let index = index as u32;
            let mut claimed = false;

            if transfer.is_none()
                && properties.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && (graphics.is_some() || !properties.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            {
                transfer = Some(index);
                claimed = true;
            }
            if !claimed
                && graphics.is_none()
                && properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            {
                graphics = Some(index);
                claimed = true;
            }
            if !claimed && present.is_none() {
                let supported = unsafe {
                    surface_loader.get_physical_device_surface_support(device, index, surface)
                }?;
                if supported {
                    present = Some(index);
                }
            }
            if graphics.is_some() && transfer.is_some() && present.is_some() {
                break;
            }
        }

        let Some(graphics) = graphics else {
            return Ok(None);
        };
        let transfer = transfer.unwrap_or(graphics);
        let present = match present {
            Some(present) => present,
            None => {
                let mut fallback = None;
                for index in 0..families.len() as u32 {
                    let supported = unsafe {
                        surface_loader.get_physical_device_surface_support(device, index, surface)
                    }?;
                    if supported {
                        fallback = Some(index);
                        break;
                    }
                }
                match fallback {
                    Some(present) => present,
                    None => return Ok(None),
                }
            }
        };

        Ok(Some(QueueFamilyIndices {
            graphics,
            transfer,
            present,
        }))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let mut unique_families = vec![families.graphics];
        for index in [families.transfer, families.present] {
            if !unique_families.contains(&index) {
                unique_families.push(index);
            }
        }

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
            .iter()
            .map(|&index| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(index)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = [ash::extensions::khr::Swapchain::name().as_ptr()];

        let mut dynamic_rendering =
            vk::PhysicalDeviceDynamicRenderingFeatures::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut dynamic_rendering);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }?;
        Ok(device)
    }

    /// Re-queries the surface capabilities, formats and present modes.
    pub fn probe_surface(&self) -> Result<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, self.surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, self.surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(
                        self.physical_device,
                        self.surface,
                    )?,
            })
        }
    }

    /// Wait for the device to be idle (e.g., before teardown).
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order of creation
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
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
