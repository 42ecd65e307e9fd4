//! Window collaborator.
//!
//! The backend consumes the windowing layer through three things only: a
//! drawable surface handle, the current framebuffer size, and polled
//! events (close request, resizes). Resize events are queued here and
//! drained by the render thread each frame instead of being dispatched
//! through a global callback table.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::{
    HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle, RawWindowHandle,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::EventLoopExtPumpEvents;
use winit::window::{Window, WindowAttributes};

use crate::error::{GlazeError, Result};

struct Shell {
    attributes: WindowAttributes,
    window: Option<Arc<Window>>,
    create_error: Option<winit::error::OsError>,
    close_requested: bool,
    resizes: VecDeque<PhysicalSize<u32>>,
}

impl ApplicationHandler for Shell {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        match event_loop.create_window(self.attributes.clone()) {
            Ok(window) => self.window = Some(Arc::new(window)),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.create_error = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resizes.push_back(size);
            }
            _ => {}
        }
    }
}

/// Owns the event loop and the single presentation window.
///
/// Not `Send`: the event loop is pinned to the thread that created it,
/// which is also the thread expected to run the render step.
pub struct WindowSystem {
    event_loop: EventLoop<()>,
    shell: Shell,
}

impl WindowSystem {
    /// Creates the event loop and pumps it until the window exists.
    pub fn new(title: &str, width: u32, height: u32) -> Result<Self> {
        let event_loop = EventLoop::new()?;
        let attributes = Window::default_attributes()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height));
        let mut system = Self {
            event_loop,
            shell: Shell {
                attributes,
                window: None,
                create_error: None,
                close_requested: false,
                resizes: VecDeque::new(),
            },
        };

        // Some platforms deliver `resumed` only after a round trip.
        for _ in 0..32 {
            if system.shell.window.is_some() {
                break;
            }
            system.pump(Some(Duration::from_millis(10)));
        }
        if system.shell.window.is_none() {
            return Err(match system.shell.create_error.take() {
                Some(e) => e.into(),
                None => GlazeError::WindowUnavailable,
            });
        }

        log::info!("Window created: {}x{}", width, height);
        Ok(system)
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        let _ = self.event_loop.pump_app_events(timeout, &mut self.shell);
    }

    /// Processes pending OS events without blocking.
    pub fn poll(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    /// Drains resize events received since the last call.
    pub fn take_resizes(&mut self) -> Vec<PhysicalSize<u32>> {
        self.shell.resizes.drain(..).collect()
    }

    /// True once the user has asked the window to close.
    pub fn should_close(&self) -> bool {
        self.shell.close_requested
    }

    pub fn window(&self) -> &Arc<Window> {
        self.shell
            .window
            .as_ref()
            .expect("window exists after construction")
    }

    /// Current framebuffer size in pixels; `(0, 0)` while minimized.
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let size = self.window().inner_size();
        (size.width, size.height)
    }

    /// Raw handles for surface creation.
    pub fn raw_handles(&self) -> (RawDisplayHandle, RawWindowHandle) {
        let window = self.window();
        (window.raw_display_handle(), window.raw_window_handle())
    }
}
