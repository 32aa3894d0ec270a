// Command buffer manager - per frame slot, per queue kind pools
//
// Every frame slot owns one native command pool per queue kind with a fixed
// budget of command buffers, plus an optional timestamp query pool. A slot is
// reset in one go when the device starts reusing it, after its GPU work has
// retired.
//
// The device records some work of its own (upload release on the transfer
// queue, upload acquire and the present transition on the graphics queue).
// Those buffers are allocated past the end of the user budget so that a frame
// using its whole budget never runs out.

use anyhow::Result;
use ash::vk;

use crate::backend::Gpu;
use crate::command_buffer::{CommandBuffer, RecordingState};
use crate::config::CommandConfig;
use crate::resources::QueueKind;

/// Names one command buffer of one frame slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandBufferId {
    pub(crate) frame: u32,
    pub(crate) queue: QueueKind,
    pub(crate) index: u32,
}

impl CommandBufferId {
    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.frame
    }
}

/// Buffers reserved per slice for the device's own recording
const INTERNAL_BUFFERS: [u32; QueueKind::COUNT] = [1, 0, 1];

struct FrameSlice {
    pools: [vk::CommandPool; QueueKind::COUNT],
    /// `budget` user buffers followed by the internal ones
    buffers: [Vec<CommandBuffer>; QueueKind::COUNT],
    used: [u32; QueueKind::COUNT],
    internal_used: [bool; QueueKind::COUNT],
    query_pool: vk::QueryPool,
    queries_reset: bool,
}

impl FrameSlice {
    /// Begin `index` if this is its first use in the frame. The first
    /// graphics buffer begun also resets the timestamp queries.
    fn begin(&mut self, gpu: &dyn Gpu, queue: QueueKind, index: u32, queries: u32) -> Result<()> {
        let cb = &mut self.buffers[queue.index()][index as usize];
        if cb.state != RecordingState::Initial {
            return Ok(());
        }
        cb.begin(gpu)?;
        if queue == QueueKind::Graphics && queries > 0 && !self.queries_reset {
            gpu.cmd_reset_query_pool(cb.native, self.query_pool, 0, queries);
            self.queries_reset = true;
        }
        Ok(())
    }
}

pub struct CommandBufferManager {
    frames: Vec<FrameSlice>,
    budgets: [u32; QueueKind::COUNT],
    queries_per_frame: u32,
}

impl CommandBufferManager {
    /// `queries_per_frame == 0` disables the timestamp query pools
    pub fn new(
        gpu: &mut dyn Gpu,
        frames: u32,
        config: &CommandConfig,
        queries_per_frame: u32,
    ) -> Result<Self> {
        let budgets = [
            config.graphics_buffers.max(1),
            config.compute_buffers.max(1),
            config.transfer_buffers.max(1),
        ];

        let mut slices = Vec::with_capacity(frames as usize);
        for frame in 0..frames {
            let mut pools = [vk::CommandPool::null(); QueueKind::COUNT];
            let mut buffers: [Vec<CommandBuffer>; QueueKind::COUNT] = Default::default();
            for queue in QueueKind::ALL {
                let pool = gpu.create_command_pool(queue)?;
                let count = budgets[queue.index()] + INTERNAL_BUFFERS[queue.index()];
                let natives = gpu.allocate_command_buffers(pool, count)?;
                pools[queue.index()] = pool;
                buffers[queue.index()] = natives
                    .into_iter()
                    .map(|native| CommandBuffer::new(native, queue, frame))
                    .collect();
            }
            let query_pool = if queries_per_frame > 0 {
                gpu.create_query_pool(queries_per_frame)?
            } else {
                vk::QueryPool::null()
            };
            slices.push(FrameSlice {
                pools,
                buffers,
                used: [0; QueueKind::COUNT],
                internal_used: [false; QueueKind::COUNT],
                query_pool,
                queries_reset: false,
            });
        }

        log::info!(
            "Command buffers: {} frames x (graphics {}, compute {}, transfer {})",
            frames,
            budgets[0],
            budgets[1],
            budgets[2]
        );

        Ok(Self {
            frames: slices,
            budgets,
            queries_per_frame,
        })
    }

    /// Reset every pool of `frame`. The slot's GPU work must have retired.
    pub fn free_unused_buffers(&mut self, gpu: &mut dyn Gpu, frame: u32) -> Result<()> {
        let slice = &mut self.frames[frame as usize];
        for queue in QueueKind::ALL {
            gpu.reset_command_pool(slice.pools[queue.index()])?;
            for cb in &mut slice.buffers[queue.index()] {
                cb.reset();
            }
        }
        slice.used = [0; QueueKind::COUNT];
        slice.internal_used = [false; QueueKind::COUNT];
        slice.queries_reset = false;
        Ok(())
    }

    /// Next unused buffer of `queue` for `frame`, already recording.
    ///
    /// # Panics
    /// When the per-frame budget for `queue` is exhausted.
    pub fn get_command_buffer(
        &mut self,
        gpu: &dyn Gpu,
        queue: QueueKind,
        frame: u32,
    ) -> Result<CommandBufferId> {
        let budget = self.budgets[queue.index()];
        let slice = &mut self.frames[frame as usize];
        let index = slice.used[queue.index()];
        ensure_contract!(
            index < budget,
            "{} command buffer budget ({}) exhausted for frame {}",
            queue.name(),
            budget,
            frame
        );
        slice.used[queue.index()] += 1;
        slice.begin(gpu, queue, index, self.queries_per_frame)?;

        Ok(CommandBufferId { frame, queue, index })
    }

    /// The buffer reserved for the device's own work on `queue`, outside the
    /// user budget. Handed out at most once per frame.
    pub(crate) fn get_internal_command_buffer(
        &mut self,
        gpu: &dyn Gpu,
        queue: QueueKind,
        frame: u32,
    ) -> Result<CommandBufferId> {
        ensure_contract!(
            INTERNAL_BUFFERS[queue.index()] > 0,
            "no internal {} command buffer is reserved",
            queue.name()
        );
        let index = self.budgets[queue.index()];
        let slice = &mut self.frames[frame as usize];
        ensure_contract!(
            !slice.internal_used[queue.index()],
            "internal {} command buffer taken twice in frame {}",
            queue.name(),
            frame
        );
        slice.internal_used[queue.index()] = true;
        slice.begin(gpu, queue, index, self.queries_per_frame)?;

        Ok(CommandBufferId { frame, queue, index })
    }

    pub fn get(&self, id: CommandBufferId) -> &CommandBuffer {
        &self.frames[id.frame as usize].buffers[id.queue.index()][id.index as usize]
    }

    pub fn get_mut(&mut self, id: CommandBufferId) -> &mut CommandBuffer {
        &mut self.frames[id.frame as usize].buffers[id.queue.index()][id.index as usize]
    }

    pub fn used(&self, queue: QueueKind, frame: u32) -> u32 {
        self.frames[frame as usize].used[queue.index()]
    }

    /// Null when timestamps are disabled
    pub fn query_pool(&self, frame: u32) -> vk::QueryPool {
        self.frames[frame as usize].query_pool
    }

    pub fn destroy(&mut self, gpu: &mut dyn Gpu) {
        for slice in self.frames.drain(..) {
            for pool in slice.pools {
                gpu.destroy_command_pool(pool);
            }
            if slice.query_pool != vk::QueryPool::null() {
                gpu.destroy_query_pool(slice.query_pool);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockEvent, MockGpu, Progress};

    fn manager(gpu: &mut MockGpu, timestamps: u32) -> CommandBufferManager {
        CommandBufferManager::new(gpu, 2, &CommandConfig::default(), timestamps).unwrap()
    }

    #[test]
    fn buffers_begin_once_per_frame() {
        let (mut gpu, mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);

        let a = manager.get_command_buffer(&gpu, QueueKind::Graphics, 0).unwrap();
        let b = manager.get_command_buffer(&gpu, QueueKind::Graphics, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.get(a).state(), RecordingState::Recording);
        assert_eq!(mock.count(|e| matches!(e, MockEvent::Begin(_))), 2);
        assert_eq!(manager.used(QueueKind::Graphics, 0), 2);
        assert_eq!(manager.used(QueueKind::Graphics, 1), 0);
    }

    #[test]
    #[should_panic(expected = "budget (1) exhausted")]
    fn transfer_budget_is_one() {
        let (mut gpu, _mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);
        manager.get_command_buffer(&gpu, QueueKind::Transfer, 0).unwrap();
        manager.get_command_buffer(&gpu, QueueKind::Transfer, 0).unwrap();
    }

    #[test]
    #[should_panic(expected = "budget (3) exhausted")]
    fn graphics_budget_is_three() {
        let (mut gpu, _mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);
        for _ in 0..4 {
            manager.get_command_buffer(&gpu, QueueKind::Graphics, 1).unwrap();
        }
    }

    #[test]
    fn free_unused_buffers_resets_slice() {
        let (mut gpu, mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);
        let id = manager.get_command_buffer(&gpu, QueueKind::Compute, 1).unwrap();

        manager.free_unused_buffers(&mut gpu, 1).unwrap();
        assert_eq!(manager.get(id).state(), RecordingState::Initial);
        assert_eq!(manager.used(QueueKind::Compute, 1), 0);
        assert_eq!(mock.count(|e| matches!(e, MockEvent::ResetPool(_))), QueueKind::COUNT);

        // Budget is available again and the buffer begins afresh
        let again = manager.get_command_buffer(&gpu, QueueKind::Compute, 1).unwrap();
        assert_eq!(again, id);
        assert_eq!(mock.count(|e| matches!(e, MockEvent::Begin(_))), 2);
    }

    #[test]
    fn query_pool_only_with_timestamps() {
        let (mut gpu, mock) = MockGpu::new(2, Progress::Immediate);
        let without = manager(&mut gpu, 0);
        assert_eq!(without.query_pool(0), vk::QueryPool::null());

        let mut with = manager(&mut gpu, 8);
        assert_ne!(with.query_pool(0), vk::QueryPool::null());
        let resets = |mock: &crate::backend::mock::MockHandle| {
            mock.count(|e| matches!(e, MockEvent::ResetQueries { .. }))
        };
        with.get_command_buffer(&gpu, QueueKind::Transfer, 0).unwrap();
        assert_eq!(resets(&mock), 0);
        with.get_command_buffer(&gpu, QueueKind::Graphics, 0).unwrap();
        with.get_command_buffer(&gpu, QueueKind::Graphics, 0).unwrap();
        assert_eq!(resets(&mock), 1);
    }

    #[test]
    fn internal_buffers_sit_outside_the_budget() {
        let (mut gpu, mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);
        let user: Vec<_> = (0..3)
            .map(|_| manager.get_command_buffer(&gpu, QueueKind::Graphics, 0).unwrap())
            .collect();
        let transfer = manager.get_command_buffer(&gpu, QueueKind::Transfer, 0).unwrap();

        let graphics = manager
            .get_internal_command_buffer(&gpu, QueueKind::Graphics, 0)
            .unwrap();
        let upload = manager
            .get_internal_command_buffer(&gpu, QueueKind::Transfer, 0)
            .unwrap();
        assert!(!user.contains(&graphics));
        assert_ne!(upload, transfer);
        assert_eq!(manager.get(graphics).state(), RecordingState::Recording);
        assert_eq!(manager.used(QueueKind::Graphics, 0), 3);
        assert_eq!(mock.count(|e| matches!(e, MockEvent::Begin(_))), 6);

        // Released with the rest of the slice
        manager.free_unused_buffers(&mut gpu, 0).unwrap();
        let again = manager
            .get_internal_command_buffer(&gpu, QueueKind::Graphics, 0)
            .unwrap();
        assert_eq!(again, graphics);
    }

    #[test]
    #[should_panic(expected = "taken twice")]
    fn internal_buffer_is_handed_out_once_per_frame() {
        let (mut gpu, _mock) = MockGpu::new(2, Progress::Immediate);
        let mut manager = manager(&mut gpu, 0);
        let _ = manager.get_internal_command_buffer(&gpu, QueueKind::Transfer, 1);
        let _ = manager.get_internal_command_buffer(&gpu, QueueKind::Transfer, 1);
    }
}
