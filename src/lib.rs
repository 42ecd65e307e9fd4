//! Vulkan rendering backend.
//!
//! Owns the graphics device, the presentable surface, per-thread command
//! submission resources and the per-frame synchronization that lets the
//! CPU stay [`FRAMES_IN_FLIGHT`] frames ahead of the GPU. Draw work is
//! described through [`RenderingContext`] scopes registered each frame
//! and flattened into a single composite command buffer by the render
//! step.
//!
//! ```no_run
//! use glaze::{Config, Engine};
//!
//! fn main() -> glaze::Result<()> {
//!     let mut engine = Engine::new(Config::load())?;
//!     while !engine.quitting() {
//!         engine.render()?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod renderer;
pub mod uid;
pub mod window;

pub use backend::commands::{CommandBuffer, SubmitClass, ThreadRegistry, ThreadResources};
pub use backend::device::{DeviceContext, Queue, SurfaceSupport};
pub use backend::image::{Image, ImageDesc};
pub use backend::sync::FRAMES_IN_FLIGHT;
pub use backend::{Backend, GpuHost};
pub use config::Config;
pub use context::{
    Attachment, MeshHandle, PipelineHandle, RenderingContext, ShaderObjectHandle,
    MAX_ACTIVE_RENDERING_CONTEXTS,
};
pub use engine::Engine;
pub use error::{GlazeError, Result};
pub use renderer::{FrameStatus, Renderer};
pub use uid::UidStream;
pub use window::WindowSystem;
