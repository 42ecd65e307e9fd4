// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync
// Critical for correct multi-frame rendering

use ash::vk;

use crate::error::Result;

/// How many frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one triple per frame slot.
///
/// A slot's fence starts signaled so the very first wait on it returns
/// immediately; afterwards it is re-armed by each submit and guards the
/// slot's resources until the GPU finishes that frame.
pub struct FrameSync {
    pub image_ready: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_ready: device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.create_semaphore(&semaphore_info, None)?,
                in_flight: device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_ready, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight, None);
        }
    }
}

/// Strict round-robin frame-slot counter.
pub struct FrameCounter {
    current: usize,
    period: usize,
}

impl FrameCounter {
    pub fn new(period: usize) -> Self {
        assert!(period > 0);
        Self { current: 0, period }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    /// Advances to the next slot and returns it.
    pub fn advance(&mut self) -> usize {
        self.current = (self.current + 1) % self.period;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_periodic() {
        let mut counter = FrameCounter::new(FRAMES_IN_FLIGHT);
        let start = counter.current();
        for _ in 0..FRAMES_IN_FLIGHT {
            counter.advance();
        }
        assert_eq!(counter.current(), start);
    }

    #[test]
    fn no_slot_is_skipped() {
        let mut counter = FrameCounter::new(3);
        let mut visited = Vec::new();
        for _ in 0..6 {
            visited.push(counter.current());
            counter.advance();
        }
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2]);
    }
}
