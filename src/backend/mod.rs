// Backend module - Vulkan abstraction layer
//
// Shared, thread-safe state of the rendering backend: the device context,
// the thread registry, the per-frame queued command buffers and the
// active-context list. The single-threaded render state (swapchain,
// frame slots, composite buffers) lives in `crate::renderer`.

pub mod commands;
pub mod device;
pub mod image;
pub mod swapchain;
pub mod sync;

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::context::{ActiveContexts, RenderingContext, MAX_ACTIVE_RENDERING_CONTEXTS};
use crate::error::Result;
use commands::{CommandBuffer, SubmitClass, ThreadRegistry, ThreadResources};
use device::DeviceContext;

/// The narrow slice of backend internals that collaborators
/// (`CommandBuffer`, `Image`) are allowed to touch.
pub trait GpuHost: Send + Sync {
    fn device(&self) -> &ash::Device;
    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties;
    /// The calling thread's resource bundle, if registered.
    fn current_thread(&self) -> Option<Arc<ThreadResources>>;
    /// Submit on the graphics queue and wait for it to drain.
    fn submit_graphics_immediate(&self, buffer: vk::CommandBuffer) -> Result<()>;
    /// Enqueue for the current frame's batched graphics submission.
    fn queue_graphics(&self, buffer: vk::CommandBuffer);
    /// Enqueue for the transfer path.
    fn queue_transfer(&self, buffer: vk::CommandBuffer);
}

pub struct Backend {
    device: Arc<DeviceContext>,
    threads: ThreadRegistry,
    queued_graphics: Mutex<Vec<vk::CommandBuffer>>,
    queued_transfer: Mutex<Vec<vk::CommandBuffer>>,
    active_contexts: ActiveContexts,
}

impl Backend {
    pub(crate) fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let threads = ThreadRegistry::new(device.clone())?;
        Ok(Self {
            device,
            threads,
            queued_graphics: Mutex::new(Vec::new()),
            queued_transfer: Mutex::new(Vec::new()),
            active_contexts: ActiveContexts::new(MAX_ACTIVE_RENDERING_CONTEXTS),
        })
    }

    #[inline]
    pub fn device_context(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    #[inline]
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// A graphics-class command buffer bound to the calling thread's
    /// pool, creating the thread's bundle on first use.
    pub fn graphics_command_buffer(&self) -> Result<CommandBuffer<'_>> {
        let bundle = self.threads.get_or_create()?;
        Ok(CommandBuffer::new(
            self,
            SubmitClass::Graphics,
            bundle.graphics_pool(),
        ))
    }

    /// An immediate-class command buffer for one-off setup submissions.
    pub fn immediate_command_buffer(&self) -> Result<CommandBuffer<'_>> {
        let bundle = self.threads.get_or_create()?;
        Ok(CommandBuffer::new(
            self,
            SubmitClass::Immediate,
            bundle.graphics_pool(),
        ))
    }

    /// A transfer-class command buffer bound to the calling thread's
    /// transfer pool.
    pub fn transfer_command_buffer(&self) -> Result<CommandBuffer<'_>> {
        let bundle = self.threads.get_or_create()?;
        Ok(CommandBuffer::new(
            self,
            SubmitClass::Transfer,
            bundle.transfer_pool(),
        ))
    }

    /// Registers a context for the upcoming frame. `false` means the
    /// active list is full and the context is dropped for this frame.
    pub fn push_context(&self, context: &Arc<RenderingContext>) -> bool {
        self.active_contexts.push(context)
    }

    /// Withdraws a registration made with [`Backend::push_context`].
    pub fn pop_context(&self, context: &Arc<RenderingContext>) -> bool {
        self.active_contexts.pop(context)
    }

    pub(crate) fn take_active_contexts(&self) -> Vec<Arc<RenderingContext>> {
        self.active_contexts.take()
    }

    pub(crate) fn drain_queued_graphics(&self) -> Vec<vk::CommandBuffer> {
        std::mem::take(&mut *self.queued_graphics.lock())
    }

    pub(crate) fn drain_queued_transfer(&self) -> Vec<vk::CommandBuffer> {
        std::mem::take(&mut *self.queued_transfer.lock())
    }
}

impl GpuHost for Backend {
    fn device(&self) -> &ash::Device {
        &self.device.device
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.device.memory_properties
    }

    fn current_thread(&self) -> Option<Arc<ThreadResources>> {
        self.threads.current()
    }

    fn submit_graphics_immediate(&self, buffer: vk::CommandBuffer) -> Result<()> {
        let buffers = [buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&buffers).build();
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue.handle,
                &[submit_info],
                vk::Fence::null(),
            )?;
            self.device
                .device
                .queue_wait_idle(self.device.graphics_queue.handle)?;
        }
        Ok(())
    }

    fn queue_graphics(&self, buffer: vk::CommandBuffer) {
        self.queued_graphics.lock().push(buffer);
    }

    fn queue_transfer(&self, buffer: vk::CommandBuffer) {
        self.queued_transfer.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Backend>();
    }
}
