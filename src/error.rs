//! Backend error types.
//!
//! Everything here is a *fatal setup* condition: an unusable device, a
//! missing queue family, a surface the driver cannot service. Recoverable
//! per-frame conditions (stale swapchain, dropped context registration,
//! stale removal handles) are reported through return values instead and
//! never surface as `GlazeError`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlazeError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// No GPU passed the hard requirement checks
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface reported an empty format list
    #[error("No supported surface format")]
    NoSurfaceFormat,

    /// The frame-in-flight count falls outside the surface's image range
    #[error("{requested} frames in flight unsupported (surface allows {min}..={max})")]
    ImageCountUnsupported { requested: u32, min: u32, max: u32 },

    /// An image resource was created twice without an intervening destroy
    #[error("Image already created")]
    ImageAlreadyCreated,

    /// No memory type satisfies the requested property flags
    #[error("No suitable memory type for flags {0:?}")]
    NoSuitableMemoryType(ash::vk::MemoryPropertyFlags),

    /// Configuration file unreadable or malformed
    #[error("Config error: {0}")]
    Config(String),

    /// Event loop construction or pumping failed
    #[error("Event loop error: {0}")]
    EventLoop(#[from] winit::error::EventLoopError),

    /// Window creation failed
    #[error("Window error: {0}")]
    Os(#[from] winit::error::OsError),

    /// The event loop never delivered a window
    #[error("Window was not created by the event loop")]
    WindowUnavailable,
}

pub type Result<T> = std::result::Result<T, GlazeError>;
