// Image resources with dedicated memory
//
// One vkAllocateMemory per image; no sub-allocation. Handles created
// here are owned until `destroy` (or drop), unlike the borrowed handles
// flowing through the draw-scope hierarchy.

use std::sync::Arc;

use ash::vk;

use super::GpuHost;
use crate::error::{GlazeError, Result};

/// Find a memory type index satisfying `properties` among `type_filter`.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    for i in 0..memory_properties.memory_type_count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    Err(GlazeError::NoSuitableMemoryType(properties))
}

/// Parameters for [`Image::create`].
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub image_type: vk::ImageType,
}

impl ImageDesc {
    /// A single-sampled 2D image.
    pub fn new_2d(extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            format,
            usage,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            image_type: vk::ImageType::TYPE_2D,
        }
    }
}

/// A GPU image plus its dedicated device-local allocation.
pub struct Image {
    host: Arc<dyn GpuHost>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    format: vk::Format,
    extent: vk::Extent3D,
    array_layers: u32,
}

impl Image {
    pub fn new(host: Arc<dyn GpuHost>) -> Self {
        Self {
            host,
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D::default(),
            array_layers: 0,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.image == vk::Image::null()
    }

    #[inline]
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    #[inline]
    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    /// Creates the image and binds a dedicated device-local allocation.
    pub fn create(&mut self, desc: &ImageDesc) -> Result<()> {
        if !self.is_null() {
            log::error!("attempting to create an image that is already created");
            return Err(GlazeError::ImageAlreadyCreated);
        }

        let device = self.host.device();

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(desc.image_type)
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(desc.tiling)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&create_info, None) }?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = match find_memory_type(
            self.host.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ) {
            Ok(index) => index,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.destroy_image(image, None);
                device.free_memory(memory, None);
            }
            return Err(e.into());
        }

        self.image = image;
        self.memory = memory;
        self.format = desc.format;
        self.extent = desc.extent;
        self.array_layers = desc.array_layers;
        Ok(())
    }

    /// Creates a view over the image. The caller owns the returned view.
    pub fn create_view(
        &self,
        view_type: vk::ImageViewType,
        subresource_range: vk::ImageSubresourceRange,
    ) -> Result<vk::ImageView> {
        if self.is_null() {
            log::error!("attempting to create a view of a null image");
            return Err(GlazeError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }

        let create_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(self.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range);

        let view = unsafe { self.host.device().create_image_view(&create_info, None) }?;
        Ok(view)
    }

    /// Destroys the image and frees its allocation; the image becomes
    /// null and may be created again.
    pub fn destroy(&mut self) {
        if self.is_null() {
            return;
        }
        unsafe {
            self.host.device().destroy_image(self.image, None);
            self.host.device().free_memory(self.memory, None);
        }
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
        self.format = vk::Format::UNDEFINED;
        self.extent = vk::Extent3D::default();
        self.array_layers = 0;
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        props.memory_types[1].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props
    }

    #[test]
    fn memory_type_selection_honors_filter_and_flags() {
        let props = synthetic_memory_properties();
        let index =
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(index, 1);

        // filter excludes the only device-local type
        assert!(find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::DEVICE_LOCAL).is_err());
    }
}
