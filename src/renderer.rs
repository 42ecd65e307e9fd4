//! The per-frame state machine.
//!
//! Owns the swapchain, the frame slots and their composite command
//! buffers, and runs the render step: wait on the slot fence, acquire,
//! record, batch-submit, present, advance. Runs on exactly one thread per
//! frame and is not reentrant; shared state (queued command buffers,
//! active contexts, thread registry) lives in [`crate::backend::Backend`].

use std::any::Any;
use std::sync::{Arc, Weak};

use ash::vk;

use crate::backend::device::DeviceContext;
use crate::backend::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use crate::backend::sync::{FrameCounter, FrameSync, FRAMES_IN_FLIGHT};
use crate::backend::Backend;
use crate::config::Config;
use crate::error::Result;

const IMAGE_TRANSITION_SRC_STAGE: vk::PipelineStageFlags =
    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
const IMAGE_TRANSITION_DST_STAGE: vk::PipelineStageFlags =
    vk::PipelineStageFlags::BOTTOM_OF_PIPE;

/// What a render step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame was recorded, submitted and presented.
    Rendered,
    /// Zero-area surface; nothing was acquired, submitted or presented.
    SkippedMinimized,
    /// Acquire reported out-of-date; the swapchain was recreated and the
    /// frame aborted before any submit.
    SkippedOutOfDate,
}

/// Whether a resize event suspends rendering or rebuilds the swapchain.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResizeAction {
    Minimize,
    Recreate,
}

pub(crate) fn resize_action(width: u32, height: u32) -> ResizeAction {
    if width == 0 || height == 0 {
        ResizeAction::Minimize
    } else {
        ResizeAction::Recreate
    }
}

type ListenerFn = Box<dyn FnMut(vk::Extent2D, &[vk::ImageView]) + Send>;

struct ListenerEntry {
    owner: Weak<dyn Any + Send + Sync>,
    callback: ListenerFn,
}

/// Swapchain-recreate listeners keyed by a weak owner reference; entries
/// whose owner has been dropped are pruned before invocation.
pub(crate) struct RecreateListeners {
    entries: Vec<ListenerEntry>,
}

impl RecreateListeners {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn register<T: Send + Sync + 'static>(
        &mut self,
        owner: &Arc<T>,
        callback: impl FnMut(vk::Extent2D, &[vk::ImageView]) + Send + 'static,
    ) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        self.entries.push(ListenerEntry {
            owner: Arc::downgrade(&owner),
            callback: Box::new(callback),
        });
    }

    fn notify(&mut self, extent: vk::Extent2D, views: &[vk::ImageView]) {
        self.entries.retain_mut(|entry| {
            if entry.owner.upgrade().is_none() {
                return false;
            }
            (entry.callback)(extent, views);
            true
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Swapchain manager + frame synchronizer.
pub struct Renderer {
    device: Arc<DeviceContext>,
    swapchain: Option<Swapchain>,
    frames: Vec<FrameSync>,
    composite: Vec<vk::CommandBuffer>,
    composite_pool: vk::CommandPool,
    counter: FrameCounter,
    listeners: RecreateListeners,
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,
    framebuffer: (u32, u32),
    pending_recreate: bool,
}

impl Renderer {
    pub(crate) fn new(
        backend: &Backend,
        config: &Config,
        framebuffer: (u32, u32),
    ) -> Result<Self> {
        let device = backend.device_context().clone();

        let frames = (0..FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(&device.device))
            .collect::<Result<Vec<_>>>()?;

        // Composite buffers come from the main thread's graphics pool,
        // fixed at backend construction.
        let composite_pool = backend.threads().main_thread().graphics_pool();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(composite_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(FRAMES_IN_FLIGHT as u32);
        let composite = unsafe { device.device.allocate_command_buffers(&alloc_info) }?;

        let mut renderer = Self {
            device,
            swapchain: None,
            frames,
            composite,
            composite_pool,
            counter: FrameCounter::new(FRAMES_IN_FLIGHT),
            listeners: RecreateListeners::new(),
            clear_color: config.graphics.clear_color,
            preferred_present_mode: config.present_mode(),
            framebuffer,
            pending_recreate: false,
        };
        renderer.create_swapchain(backend)?;
        Ok(renderer)
    }

    /// Registers a recreate listener tied to `owner`; the listener is
    /// dropped once `owner` is.
    pub fn register_recreate_listener<T: Send + Sync + 'static>(
        &mut self,
        owner: &Arc<T>,
        callback: impl FnMut(vk::Extent2D, &[vk::ImageView]) + Send + 'static,
    ) {
        self.listeners.register(owner, callback);
    }

    /// Current swapchain extent; `(0, 0)` while minimized.
    pub fn extent(&self) -> vk::Extent2D {
        if self.framebuffer.0 == 0 || self.framebuffer.1 == 0 {
            return vk::Extent2D::default();
        }
        self.swapchain
            .as_ref()
            .map(|sc| sc.extent)
            .unwrap_or_default()
    }

    pub fn format(&self) -> Option<vk::Format> {
        self.swapchain.as_ref().map(|sc| sc.format)
    }

    #[inline]
    pub fn current_frame(&self) -> usize {
        self.counter.current()
    }

    /// Applies a window resize: zero-area suspends rendering, anything
    /// else schedules a recreate for the next render step.
    pub(crate) fn handle_resize(&mut self, width: u32, height: u32) {
        match resize_action(width, height) {
            ResizeAction::Minimize => {
                self.framebuffer = (0, 0);
            }
            ResizeAction::Recreate => {
                self.framebuffer = (width, height);
                self.pending_recreate = true;
            }
        }
    }

    fn create_swapchain(&mut self, backend: &Backend) -> Result<()> {
        if self.framebuffer.0 == 0 || self.framebuffer.1 == 0 {
            self.swapchain = None;
            return Ok(());
        }

        let swapchain = Swapchain::new(
            self.device.clone(),
            self.preferred_present_mode,
            self.framebuffer,
        )?;

        // One-time transition of every image to the presentable layout.
        let mut setup = backend.immediate_command_buffer()?;
        setup.allocate()?;
        let cmd = setup.begin()?;
        for &image in &swapchain.images {
            let barrier = image_barrier(
                image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            unsafe {
                self.device.device.cmd_pipeline_barrier(
                    cmd,
                    IMAGE_TRANSITION_SRC_STAGE,
                    IMAGE_TRANSITION_DST_STAGE,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                );
            }
        }
        setup.end()?;
        setup.submit()?;

        self.swapchain = Some(swapchain);
        Ok(())
    }

    /// Tears the swapchain down and rebuilds it at the current
    /// framebuffer size, then notifies the surviving recreate listeners.
    /// Slot sync objects are reused, not recreated.
    pub fn recreate(&mut self, backend: &Backend) -> Result<()> {
        self.device.wait_idle()?;
        self.swapchain = None;
        self.create_swapchain(backend)?;
        if let Some(swapchain) = &self.swapchain {
            log::info!(
                "Swapchain recreated: {}x{}",
                swapchain.extent.width,
                swapchain.extent.height
            );
            self.listeners
                .notify(swapchain.extent, &swapchain.image_views);
        }
        Ok(())
    }

    /// Runs one render step. Not reentrant; call from one thread only.
    ///
    /// The wait on the slot fence is unbounded: a hung GPU hangs the
    /// render step. Callers cannot cancel an in-flight frame.
    pub fn render(&mut self, backend: &Backend) -> Result<FrameStatus> {
        if self.framebuffer.0 == 0 || self.framebuffer.1 == 0 {
            return Ok(FrameStatus::SkippedMinimized);
        }
        if self.pending_recreate || self.swapchain.is_none() {
            self.recreate(backend)?;
            self.pending_recreate = false;
            if self.swapchain.is_none() {
                return Ok(FrameStatus::SkippedMinimized);
            }
        }

        let slot = self.counter.current();
        let (image_ready, render_finished, in_flight) = {
            let sync = &self.frames[slot];
            (sync.image_ready, sync.render_finished, sync.in_flight)
        };

        // Slot i is reused only once its previous frame's fence signals.
        unsafe {
            self.device
                .device
                .wait_for_fences(&[in_flight], true, u64::MAX)?;
        }

        let outcome = self
            .swapchain
            .as_ref()
            .expect("swapchain exists past the minimized check")
            .acquire(image_ready)?;
        let (image_index, suboptimal) = match outcome {
            AcquireOutcome::Acquired { index, suboptimal } => (index, suboptimal),
            AcquireOutcome::OutOfDate => {
                self.recreate(backend)?;
                return Ok(FrameStatus::SkippedOutOfDate);
            }
        };
        if suboptimal {
            self.pending_recreate = true;
        }

        unsafe {
            self.device.device.reset_fences(&[in_flight])?;
            self.device.device.reset_command_buffer(
                self.composite[slot],
                vk::CommandBufferResetFlags::empty(),
            )?;
        }

        self.record_composite(backend, slot, image_index)?;

        // Transfer-class buffers go straight to the transfer queue with
        // no frame dependency.
        let transfer = backend.drain_queued_transfer();
        if !transfer.is_empty() {
            let transfer_submit = vk::SubmitInfo::builder()
                .command_buffers(&transfer)
                .build();
            unsafe {
                self.device.device.queue_submit(
                    self.device.transfer_queue.handle,
                    &[transfer_submit],
                    vk::Fence::null(),
                )?;
            }
        }

        // The standalone buffers carry no waits: they must not depend on
        // the frame's acquired image.
        let queued = backend.drain_queued_graphics();
        let composite_buffers = [self.composite[slot]];
        let wait_semaphores = [image_ready];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [render_finished];

        let queued_submit = vk::SubmitInfo::builder().command_buffers(&queued).build();
        let composite_submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&composite_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        let submits = [queued_submit, composite_submit];

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue.handle,
                &submits,
                in_flight,
            )?;
        }

        let present_result = self
            .swapchain
            .as_ref()
            .expect("swapchain unchanged during the frame")
            .present(
                self.device.present_queue.handle,
                image_index,
                &[render_finished],
            );

        self.counter.advance();

        match present_result {
            Ok(PresentOutcome::Presented) => {}
            Ok(PresentOutcome::Stale) => self.pending_recreate = true,
            // Never fatal after a successful submit; recreation recovers.
            Err(e) => {
                log::error!("Present failed: {}", e);
                self.pending_recreate = true;
            }
        }

        if self.pending_recreate {
            self.recreate(backend)?;
            self.pending_recreate = false;
        }

        Ok(FrameStatus::Rendered)
    }

    /// Records the frame's composite command buffer: transition the slot
    /// image to color-attachment layout, clear it, flatten every active
    /// context, transition back to the presentable layout.
    fn record_composite(&self, backend: &Backend, slot: usize, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let swapchain = self
            .swapchain
            .as_ref()
            .expect("recording requires a swapchain");
        debug_assert!(
            (image_index as usize) < swapchain.image_views.len(),
            "acquired image index out of range"
        );

        let image = swapchain.images[slot];
        let view = swapchain.image_views[slot];
        let cmd = self.composite[slot];

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            device.begin_command_buffer(cmd, &begin_info)?;
        }

        let to_color = image_barrier(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                IMAGE_TRANSITION_SRC_STAGE,
                IMAGE_TRANSITION_DST_STAGE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_color],
            );
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: swapchain.extent.width as f32,
            height: swapchain.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: swapchain.extent,
        };
        unsafe {
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
        }

        // Clear-only pass over the slot's swapchain image
        let clear_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
            .build();
        let clear_attachments = [clear_attachment];
        let clear_info = vk::RenderingInfo::builder()
            .render_area(scissor)
            .layer_count(1)
            .color_attachments(&clear_attachments);
        unsafe {
            device.cmd_begin_rendering(cmd, &clear_info);
            device.cmd_end_rendering(cmd);
        }

        // Flatten every context registered for this frame; the list is
        // consumed here and registration starts over next frame.
        let contexts = backend.take_active_contexts();
        for context in &contexts {
            context.record(device, cmd);
        }

        let to_present = image_barrier(
            image,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                IMAGE_TRANSITION_SRC_STAGE,
                IMAGE_TRANSITION_DST_STAGE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
            device.end_command_buffer(cmd)?;
        }

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            self.device
                .device
                .free_command_buffers(self.composite_pool, &self.composite);
        }
        for frame in &self.frames {
            frame.destroy(&self.device.device);
        }
        // swapchain dropped by its own Drop
    }
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resize_zero_round_trip_yields_one_recreate() {
        let events = [(0, 0), (0, 0), (800, 600)];
        let recreates = events
            .iter()
            .filter(|&&(w, h)| resize_action(w, h) == ResizeAction::Recreate)
            .count();
        assert_eq!(recreates, 1);
    }

    #[test]
    fn listeners_fire_once_per_notify() {
        let mut listeners = RecreateListeners::new();
        let owner = Arc::new(());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        listeners.register(&owner, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let extent = vk::Extent2D {
            width: 320,
            height: 240,
        };
        listeners.notify(extent, &[]);
        listeners.notify(extent, &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn listeners_with_dead_owners_are_pruned() {
        let mut listeners = RecreateListeners::new();
        let kept = Arc::new(());
        let dropped = Arc::new(());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        listeners.register(&kept, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = calls.clone();
        listeners.register(&dropped, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(listeners.len(), 2);

        drop(dropped);
        listeners.notify(vk::Extent2D::default(), &[]);
        assert_eq!(listeners.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
