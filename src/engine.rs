//! Engine façade: owns the window collaborator, the shared backend and
//! the render-thread state, and exposes the public operations surface.

use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};

use ash::vk;

use crate::backend::commands::{CommandBuffer, ThreadResources};
use crate::backend::Backend;
use crate::config::Config;
use crate::context::RenderingContext;
use crate::error::Result;
use crate::renderer::{FrameStatus, Renderer};
use crate::window::WindowSystem;

pub struct Engine {
    // Field order is drop order: render state, then shared backend (which
    // keeps the device alive through its Arc), then the window.
    renderer: Renderer,
    backend: Arc<Backend>,
    window: WindowSystem,
}

impl Engine {
    /// Creates the window, the device, the backend and the first
    /// swapchain. Any failure here is fatal; there is no degraded mode.
    pub fn new(config: Config) -> Result<Self> {
        let window = WindowSystem::new(
            &config.window.title,
            config.window.width,
            config.window.height,
        )?;
        Self::with_window(window, config)
    }

    /// Like [`Engine::new`] with a caller-constructed window.
    pub fn with_window(window: WindowSystem, config: Config) -> Result<Self> {
        let (display, surface) = window.raw_handles();

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = crate::backend::device::DeviceContext::new(
            &config.window.title,
            enable_validation,
            display,
            surface,
        )?;

        let backend = Arc::new(Backend::new(device)?);
        let renderer = Renderer::new(&backend, &config, window.framebuffer_size())?;

        log::info!("Engine initialized");
        Ok(Self {
            renderer,
            backend,
            window,
        })
    }

    /// The shared backend, cloneable across worker threads.
    #[inline]
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Polls window events and reports whether the user asked to close.
    pub fn quitting(&mut self) -> bool {
        self.window.poll();
        self.apply_window_events();
        self.window.should_close()
    }

    /// Runs one render step on the calling thread.
    pub fn render(&mut self) -> Result<FrameStatus> {
        self.apply_window_events();
        self.renderer.render(&self.backend)
    }

    fn apply_window_events(&mut self) {
        for size in self.window.take_resizes() {
            self.renderer.handle_resize(size.width, size.height);
        }
    }

    /// Registers a context for the upcoming frame; must be re-done every
    /// frame. `false` means the bounded active list is full.
    pub fn push_context(&self, context: &Arc<RenderingContext>) -> bool {
        self.backend.push_context(context)
    }

    pub fn pop_context(&self, context: &Arc<RenderingContext>) -> bool {
        self.backend.pop_context(context)
    }

    /// A graphics-class command buffer for the calling thread.
    pub fn graphics_command_buffer(&self) -> Result<CommandBuffer<'_>> {
        self.backend.graphics_command_buffer()
    }

    /// Registers a spawned worker with the backend so it is joined at
    /// teardown.
    pub fn register_thread(&self, handle: JoinHandle<()>) -> Result<Arc<ThreadResources>> {
        self.backend.threads().adopt(handle)
    }

    pub fn unregister_thread(&self, id: ThreadId) -> bool {
        self.backend.threads().unregister(id)
    }

    pub fn register_recreate_listener<T: Send + Sync + 'static>(
        &mut self,
        owner: &Arc<T>,
        callback: impl FnMut(vk::Extent2D, &[vk::ImageView]) + Send + 'static,
    ) {
        self.renderer.register_recreate_listener(owner, callback);
    }

    /// Current swapchain extent; `(0, 0)` while minimized.
    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.renderer.extent()
    }

    pub fn swapchain_format(&self) -> Option<vk::Format> {
        self.renderer.format()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        log::info!("Shutting down engine");
        let _ = self.backend.device_context().wait_idle();
    }
}
