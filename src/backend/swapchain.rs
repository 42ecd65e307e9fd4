// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Recreated wholesale on resize or staleness; the per-slot sync objects
// live outside and survive recreation.

use std::sync::Arc;

use ash::vk;

use super::device::DeviceContext;
use super::sync::FRAMES_IN_FLIGHT;
use crate::error::{GlazeError, Result};

/// Outcome of an image acquire.
pub enum AcquireOutcome {
    /// Image acquired; `suboptimal` asks for an opportunistic recreate.
    Acquired { index: u32, suboptimal: bool },
    /// Surface no longer matches; recreate and skip this frame.
    OutOfDate,
}

/// Outcome of a present.
pub enum PresentOutcome {
    Presented,
    /// Out-of-date or suboptimal; recreate. Never fatal after a
    /// successful submit.
    Stale,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    device: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        device: Arc<DeviceContext>,
        preferred_present_mode: vk::PresentModeKHR,
        fallback_size: (u32, u32),
    ) -> Result<Self> {
        let support = device.probe_surface()?;
        let caps = support.capabilities;

        // Choose surface format (prefer SRGB)
        let surface_format = support
            .formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_SRGB
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| support.formats.first())
            .ok_or(GlazeError::NoSurfaceFormat)?;

        // FIFO is always supported
        let present_mode = support
            .present_modes
            .iter()
            .copied()
            .find(|&mode| mode == preferred_present_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        // Use the surface's reported extent when valid, otherwise clamp
        // the framebuffer size into the supported range
        let extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: fallback_size
                    .0
                    .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: fallback_size
                    .1
                    .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        // One presentable image per frame slot
        let image_count = FRAMES_IN_FLIGHT as u32;
        if image_count < caps.min_image_count
            || (caps.max_image_count > 0 && image_count > caps.max_image_count)
        {
            return Err(GlazeError::ImageCountUnsupported {
                requested: image_count,
                min: caps.min_image_count,
                max: caps.max_image_count,
            });
        }

        log::info!(
            "Creating swapchain: {}x{} ({:?}, {:?})",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }?;

        let images = unsafe { loader.get_swapchain_images(swapchain) }?;
        log::info!("Created swapchain with {} images", images.len());

        let image_views: Result<Vec<_>> = images
            .iter()
            .map(|&image| {
                let create_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(surface_format.format)
                    .components(vk::ComponentMapping {
                        r: vk::ComponentSwizzle::IDENTITY,
                        g: vk::ComponentSwizzle::IDENTITY,
                        b: vk::ComponentSwizzle::IDENTITY,
                        a: vk::ComponentSwizzle::IDENTITY,
                    })
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });

                unsafe {
                    device
                        .device
                        .create_image_view(&create_info, None)
                        .map_err(GlazeError::from)
                }
            })
            .collect();

        Ok(Self {
            swapchain,
            loader,
            images,
            image_views: image_views?,
            format: surface_format.format,
            extent,
            device,
        })
    }

    /// Acquire the next presentable image, signaling `semaphore`.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present `image_index`, waiting on `wait_semaphores`.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Stale),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
