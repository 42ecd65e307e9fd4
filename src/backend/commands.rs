// Per-thread command pools and transient command buffers.
//
// Every thread that records commands owns a bundle of two pools, created
// lazily on first use and kept until backend teardown. Command buffers
// are short-lived: allocate, begin, record, end, submit - consumed
// exactly once.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use ash::vk;
use parking_lot::Mutex;

use super::device::DeviceContext;
use super::GpuHost;
use crate::error::Result;

/// Where a finished command buffer goes on submit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitClass {
    /// Synchronous submit-and-wait on the graphics queue. For one-off
    /// setup work such as image layout transitions.
    Immediate,
    /// Enqueued into the current frame's batched graphics submission.
    /// Such buffers are submitted with no wait semaphores and therefore
    /// must not depend on the frame's acquired image.
    Graphics,
    /// Enqueued for the transfer-queue path.
    Transfer,
}

/// A thread's command pools.
///
/// The graphics pool allows per-buffer reset (the composite frame buffers
/// are re-recorded every frame); the transfer pool does not.
pub struct ThreadResources {
    thread_id: ThreadId,
    graphics_pool: vk::CommandPool,
    transfer_pool: vk::CommandPool,
    join: Mutex<Option<JoinHandle<()>>>,
    device: Arc<DeviceContext>,
}

impl ThreadResources {
    fn create(
        device: Arc<DeviceContext>,
        thread_id: ThreadId,
        join: Option<JoinHandle<()>>,
    ) -> Result<Self> {
        let graphics_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.graphics_queue.family_index);
        let transfer_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.transfer_queue.family_index);

        let (graphics_pool, transfer_pool) = unsafe {
            let graphics_pool = device.device.create_command_pool(&graphics_info, None)?;
            let transfer_pool = match device.device.create_command_pool(&transfer_info, None) {
                Ok(pool) => pool,
                Err(e) => {
                    device.device.destroy_command_pool(graphics_pool, None);
                    return Err(e.into());
                }
            };
            (graphics_pool, transfer_pool)
        };

        log::debug!("Created command pools for thread {:?}", thread_id);

        Ok(Self {
            thread_id,
            graphics_pool,
            transfer_pool,
            join: Mutex::new(join),
            device,
        })
    }

    #[inline]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    #[inline]
    pub fn graphics_pool(&self) -> vk::CommandPool {
        self.graphics_pool
    }

    #[inline]
    pub fn transfer_pool(&self) -> vk::CommandPool {
        self.transfer_pool
    }

    fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().take()
    }
}

impl Drop for ThreadResources {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_command_pool(self.graphics_pool, None);
            self.device
                .device
                .destroy_command_pool(self.transfer_pool, None);
        }
    }
}

/// Thread-safe map from thread identity to its resource bundle.
///
/// The main thread's bundle is fixed at backend construction and read
/// without touching the registry mutex.
pub struct ThreadRegistry {
    device: Arc<DeviceContext>,
    main: (ThreadId, Arc<ThreadResources>),
    threads: Mutex<HashMap<ThreadId, Arc<ThreadResources>>>,
}

impl ThreadRegistry {
    /// Creates the registry and the main-thread bundle. Pool allocation
    /// failure here aborts backend construction.
    pub(crate) fn new(device: Arc<DeviceContext>) -> Result<Self> {
        let main_id = std::thread::current().id();
        let main = Arc::new(ThreadResources::create(device.clone(), main_id, None)?);
        Ok(Self {
            device,
            main: (main_id, main),
            threads: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn main_thread(&self) -> &Arc<ThreadResources> {
        &self.main.1
    }

    /// Returns the calling thread's bundle, creating it on first use.
    pub fn get_or_create(&self) -> Result<Arc<ThreadResources>> {
        let id = std::thread::current().id();
        if id == self.main.0 {
            return Ok(self.main.1.clone());
        }
        let mut threads = self.threads.lock();
        if let Some(bundle) = threads.get(&id) {
            return Ok(bundle.clone());
        }
        let bundle = Arc::new(ThreadResources::create(self.device.clone(), id, None)?);
        threads.insert(id, bundle.clone());
        Ok(bundle)
    }

    /// Registers a spawned worker so it is joined at teardown.
    ///
    /// # Panics
    ///
    /// Double registration of a thread identity is a programming error.
    pub fn adopt(&self, handle: JoinHandle<()>) -> Result<Arc<ThreadResources>> {
        let id = handle.thread().id();
        assert!(
            id != self.main.0,
            "attempting to adopt the main thread into the registry"
        );
        let mut threads = self.threads.lock();
        assert!(
            !threads.contains_key(&id),
            "attempting to register a thread that already exists"
        );
        let bundle = Arc::new(ThreadResources::create(
            self.device.clone(),
            id,
            Some(handle),
        )?);
        threads.insert(id, bundle.clone());
        Ok(bundle)
    }

    /// Returns the calling thread's bundle without creating one.
    pub fn current(&self) -> Option<Arc<ThreadResources>> {
        let id = std::thread::current().id();
        if id == self.main.0 {
            return Some(self.main.1.clone());
        }
        self.threads.lock().get(&id).cloned()
    }

    pub fn lookup(&self, id: ThreadId) -> Option<Arc<ThreadResources>> {
        if id == self.main.0 {
            return Some(self.main.1.clone());
        }
        self.threads.lock().get(&id).cloned()
    }

    pub fn exists(&self, id: ThreadId) -> bool {
        id == self.main.0 || self.threads.lock().contains_key(&id)
    }

    /// Removes a worker's bundle, joining its thread first. The caller
    /// guarantees no command buffer from the bundle is still pending.
    /// The main thread cannot be unregistered.
    pub fn unregister(&self, id: ThreadId) -> bool {
        if id == self.main.0 {
            log::error!("refusing to unregister the main thread");
            return false;
        }
        let Some(bundle) = self.threads.lock().remove(&id) else {
            return false;
        };
        if let Some(handle) = bundle.take_join() {
            let _ = handle.join();
        }
        true
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        // Join adopted workers before their pools are destroyed
        let bundles: Vec<_> = self.threads.lock().drain().collect();
        for (_, bundle) in bundles {
            if let Some(handle) = bundle.take_join() {
                let _ = handle.join();
            }
        }
    }
}

/// A short-lived recording handle bound to a thread's pool and a
/// submission class.
///
/// Lifecycle: allocate -> begin -> record -> end -> submit. `submit`
/// takes the buffer by value, so a buffer cannot be submitted twice.
pub struct CommandBuffer<'a> {
    host: &'a dyn GpuHost,
    class: SubmitClass,
    pool: vk::CommandPool,
    buffer: Option<vk::CommandBuffer>,
}

impl<'a> CommandBuffer<'a> {
    pub(crate) fn new(host: &'a dyn GpuHost, class: SubmitClass, pool: vk::CommandPool) -> Self {
        Self {
            host,
            class,
            pool,
            buffer: None,
        }
    }

    /// Allocates one primary-level buffer from the owning pool.
    ///
    /// # Panics
    ///
    /// Allocating twice is a programming error.
    pub fn allocate(&mut self) -> Result<()> {
        assert!(
            self.buffer.is_none(),
            "attempting to allocate a command buffer that is already allocated"
        );
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.host.device().allocate_command_buffers(&alloc_info) }?;
        self.buffer = Some(buffers[0]);
        Ok(())
    }

    /// Starts one-shot recording and returns the raw handle to record
    /// into.
    ///
    /// # Panics
    ///
    /// Beginning before allocation is a programming error.
    pub fn begin(&mut self) -> Result<vk::CommandBuffer> {
        let buffer = self
            .buffer
            .expect("attempting to begin a command buffer that has not been allocated");
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.host.device().begin_command_buffer(buffer, &begin_info) }?;
        Ok(buffer)
    }

    pub fn end(&mut self) -> Result<()> {
        let buffer = self
            .buffer
            .expect("attempting to end a command buffer that has not been allocated");
        unsafe { self.host.device().end_command_buffer(buffer) }?;
        Ok(())
    }

    /// Routes the finished buffer by its submission class, consuming the
    /// handle.
    pub fn submit(self) -> Result<()> {
        let buffer = self
            .buffer
            .expect("attempting to submit a command buffer that has not been allocated");
        match self.class {
            SubmitClass::Immediate => self.host.submit_graphics_immediate(buffer),
            SubmitClass::Graphics => {
                self.host.queue_graphics(buffer);
                Ok(())
            }
            SubmitClass::Transfer => {
                self.host.queue_transfer(buffer);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn class(&self) -> SubmitClass {
        self.class
    }

    #[inline]
    pub fn handle(&self) -> Option<vk::CommandBuffer> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_types_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ThreadRegistry>();
        assert_send_sync::<ThreadResources>();
    }

    #[test]
    fn command_buffers_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CommandBuffer<'static>>();
    }
}
