// Recording backend for tests
//
// Fabricates native handles, keeps real host memory behind every buffer,
// executes buffer copies at submit time and models GPU progress on the
// timelines. A `MockHandle` shares the event log with the test after the
// device has taken ownership of the `MockGpu`.

use anyhow::{bail, Result};
use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::rc::Rc;

use super::*;

/// How far the fake GPU gets through submitted work
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Progress {
    /// Work retires as soon as it is submitted
    #[default]
    Immediate,
    /// Work retires only when the CPU blocks on it
    Lazy,
    /// Work never retires; waits are recorded and return anyway
    Stalled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    Wait {
        values: Vec<(QueueKind, u64)>,
        blocked: bool,
    },
    Acquire {
        slot: u32,
        index: Option<u32>,
    },
    ResetPool(vk::CommandPool),
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Barrier {
        cb: vk::CommandBuffer,
        images: Vec<NativeImageBarrier>,
        buffers: Vec<NativeBufferBarrier>,
    },
    BeginRendering {
        cb: vk::CommandBuffer,
        extent: (u32, u32),
        colors: usize,
    },
    EndRendering(vk::CommandBuffer),
    BindPipeline(vk::CommandBuffer, vk::Pipeline),
    Draw(vk::CommandBuffer),
    Dispatch(vk::CommandBuffer),
    CopyBuffer {
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
    },
    CopyBufferToImage {
        cb: vk::CommandBuffer,
        image: vk::Image,
    },
    ResetQueries {
        cb: vk::CommandBuffer,
        count: u32,
    },
    Timestamp(vk::CommandBuffer, u32),
    Submit {
        queue: QueueKind,
        command_buffers: Vec<vk::CommandBuffer>,
        wait_acquire: Option<u32>,
        waits: Vec<TimelineWait>,
        signal_present: Option<u32>,
        signal: Option<u64>,
    },
    Present {
        slot: u32,
        image_index: u32,
    },
    RecreateSwapchain(u32, u32),
    Destroy(&'static str, u64),
}

#[derive(Default)]
pub struct MockState {
    pub events: Vec<MockEvent>,
    pub progress: Progress,
    pub submitted: [u64; QueueKind::COUNT],
    pub completed: [u64; QueueKind::COUNT],
    pub bindless_set: vk::DescriptorSet,
    /// Image view currently written at each bindless array element
    pub bindless: HashMap<u32, vk::ImageView>,
    pub acquire_out_of_date: bool,
    pub present_out_of_date: bool,
    pub timestamps_ready: bool,
    pub fail_buffer_creation: bool,
    /// Host-visible buffers come back without a mapping
    pub host_mapping_unavailable: bool,
}

#[derive(Clone)]
pub struct MockHandle(Rc<RefCell<MockState>>);

impl MockHandle {
    pub fn state(&self) -> std::cell::RefMut<'_, MockState> {
        self.0.borrow_mut()
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.0.borrow().events.clone()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().events.clear();
    }

    /// Number of waits that actually had to block
    pub fn blocks(&self) -> usize {
        self.0
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Wait { blocked: true, .. }))
            .count()
    }

    pub fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.0.borrow().events.iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&MockEvent) -> bool) -> Option<usize> {
        self.0.borrow().events.iter().position(|e| pred(e))
    }

    pub fn submits(&self, queue: QueueKind) -> Vec<MockEvent> {
        self.0
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Submit { queue: q, .. } if *q == queue))
            .cloned()
            .collect()
    }

    pub fn bindless_view(&self, index: u32) -> Option<vk::ImageView> {
        self.0.borrow().bindless.get(&index).copied()
    }

    pub fn set_progress(&self, progress: Progress) {
        self.0.borrow_mut().progress = progress;
    }
}

enum Recorded {
    Copy {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
}

pub struct MockGpu {
    state: Rc<RefCell<MockState>>,
    info: GpuInfo,
    frames: u32,
    next_handle: u64,
    swap_images: Vec<(vk::Image, vk::ImageView)>,
    extent: (u32, u32),
    acquire_counter: u32,
    memory: HashMap<vk::Buffer, Box<[u8]>>,
    recorded: RefCell<HashMap<vk::CommandBuffer, Vec<Recorded>>>,
    views: HashMap<vk::ImageView, vk::Image>,
}

impl MockGpu {
    pub fn new(frames: u32, progress: Progress) -> (Self, MockHandle) {
        let state = Rc::new(RefCell::new(MockState {
            progress,
            ..Default::default()
        }));
        let mut gpu = Self {
            state: state.clone(),
            info: GpuInfo {
                name: "mock".into(),
                queue_families: [0, 1, 2],
                timestamp_period: 1.0,
                timestamps_supported: true,
                min_uniform_alignment: 256,
                min_storage_alignment: 64,
            },
            frames,
            next_handle: 0x1000,
            swap_images: Vec::new(),
            extent: (64, 64),
            acquire_counter: 0,
            memory: HashMap::new(),
            recorded: RefCell::new(HashMap::new()),
            views: HashMap::new(),
        };
        let images: Vec<(vk::Image, vk::ImageView)> = (0..frames).map(|_| (gpu.fabricate(), gpu.fabricate())).collect();
        gpu.swap_images = images;
        (gpu, MockHandle(state))
    }

    /// All queue kinds served by one family
    pub fn with_shared_families(mut self) -> Self {
        self.info.queue_families = [0, 0, 0];
        self
    }

    fn fabricate<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn log(&self, event: MockEvent) {
        self.state.borrow_mut().events.push(event);
    }

    fn destroyed(&self, kind: &'static str, raw: u64) {
        self.log(MockEvent::Destroy(kind, raw));
    }
}

impl Gpu for MockGpu {
    fn info(&self) -> &GpuInfo {
        &self.info
    }

    fn frames_in_flight(&self) -> u32 {
        self.frames
    }

    fn swapchain(&self) -> SwapchainInfo {
        SwapchainInfo {
            format: vk::Format::B8G8R8A8_UNORM,
            extent: self.extent,
            images: self.swap_images.clone(),
        }
    }

    fn acquire_next_image(&mut self, slot: u32) -> Result<Acquired> {
        let out_of_date = std::mem::take(&mut self.state.borrow_mut().acquire_out_of_date);
        if out_of_date {
            self.log(MockEvent::Acquire { slot, index: None });
            return Ok(Acquired::OutOfDate);
        }
        let index = self.acquire_counter % self.swap_images.len() as u32;
        self.acquire_counter += 1;
        self.log(MockEvent::Acquire {
            slot,
            index: Some(index),
        });
        Ok(Acquired::Image {
            index,
            suboptimal: false,
        })
    }

    fn present(&mut self, slot: u32, image_index: u32) -> Result<bool> {
        self.log(MockEvent::Present { slot, image_index });
        Ok(std::mem::take(&mut self.state.borrow_mut().present_out_of_date))
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.extent = (width, height);
        let count = self.swap_images.len();
        let images: Vec<(vk::Image, vk::ImageView)> = (0..count).map(|_| (self.fabricate(), self.fabricate())).collect();
        self.swap_images = images;
        self.log(MockEvent::RecreateSwapchain(width, height));
        Ok(())
    }

    fn wait_timelines(&mut self, waits: &[(QueueKind, u64)]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let blocked = waits.iter().any(|(q, v)| state.completed[q.index()] < *v);
        if blocked && state.progress == Progress::Lazy {
            state.completed = state.submitted;
        }
        state.events.push(MockEvent::Wait {
            values: waits.to_vec(),
            blocked,
        });
        Ok(())
    }

    fn completed_value(&self, queue: QueueKind) -> Result<u64> {
        Ok(self.state.borrow().completed[queue.index()])
    }

    fn submit(&mut self, submit: &QueueSubmit<'_>) -> Result<()> {
        for cb in submit.command_buffers {
            let commands = self.recorded.borrow_mut().remove(cb).unwrap_or_default();
            for command in commands {
                match command {
                    Recorded::Copy { src, dst, regions } => {
                        for region in regions {
                            let range = region.src_offset as usize..(region.src_offset + region.size) as usize;
                            let bytes = self.memory[&src][range].to_vec();
                            let dst_mem = self.memory.get_mut(&dst).expect("copy into unknown buffer");
                            let start = region.dst_offset as usize;
                            dst_mem[start..start + bytes.len()].copy_from_slice(&bytes);
                        }
                    }
                }
            }
        }

        let mut state = self.state.borrow_mut();
        if let Some(value) = submit.signal_timeline {
            let q = submit.queue.index();
            state.submitted[q] = state.submitted[q].max(value);
            if state.progress == Progress::Immediate {
                state.completed[q] = state.submitted[q];
            }
        }
        state.events.push(MockEvent::Submit {
            queue: submit.queue,
            command_buffers: submit.command_buffers.to_vec(),
            wait_acquire: submit.wait_acquire,
            waits: submit.wait_timelines.to_vec(),
            signal_present: submit.signal_present,
            signal: submit.signal_timeline,
        });
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.progress != Progress::Stalled {
            state.completed = state.submitted;
        }
        Ok(())
    }

    fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
    ) -> Result<(vk::Buffer, Option<NonNull<u8>>)> {
        if self.state.borrow().fail_buffer_creation {
            bail!("out of device memory");
        }
        let buffer: vk::Buffer = self.fabricate();
        let mut memory = vec![0u8; desc.size as usize].into_boxed_slice();
        let mapped = if desc.host_visible && !self.state.borrow().host_mapping_unavailable {
            NonNull::new(memory.as_mut_ptr())
        } else {
            None
        };
        self.memory.insert(buffer, memory);
        Ok((buffer, mapped))
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        self.memory.remove(&buffer);
        self.destroyed("buffer", buffer.as_raw());
    }

    fn create_image(&mut self, _desc: &ImageDesc<'_>) -> Result<vk::Image> {
        Ok(self.fabricate())
    }

    fn destroy_image(&mut self, image: vk::Image) {
        self.destroyed("image", image.as_raw());
    }

    fn create_image_view(&mut self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let view = self.fabricate();
        self.views.insert(view, desc.image);
        Ok(view)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        self.views.remove(&view);
        self.destroyed("image_view", view.as_raw());
    }

    fn create_sampler(&mut self, _desc: &SamplerDescription) -> Result<vk::Sampler> {
        Ok(self.fabricate())
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        self.destroyed("sampler", sampler.as_raw());
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            bail!("empty SPIR-V");
        }
        Ok(self.fabricate())
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        self.destroyed("shader_module", module.as_raw());
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[DescriptorBinding],
        _bindless: bool,
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(self.fabricate())
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        self.destroyed("descriptor_set_layout", layout.as_raw());
    }

    fn allocate_descriptor_set(
        &mut self,
        _layout: vk::DescriptorSetLayout,
        bindless: bool,
    ) -> Result<vk::DescriptorSet> {
        let set = self.fabricate();
        if bindless {
            self.state.borrow_mut().bindless_set = set;
        }
        Ok(set)
    }

    fn free_descriptor_set(&mut self, set: vk::DescriptorSet) {
        self.destroyed("descriptor_set", set.as_raw());
    }

    fn write_descriptors(&mut self, writes: &[DescriptorWrite]) {
        let mut state = self.state.borrow_mut();
        for write in writes {
            if write.set != state.bindless_set {
                continue;
            }
            if let DescriptorWriteInfo::Image { view, .. } = write.info {
                state.bindless.insert(write.array_element, view);
            }
        }
    }

    fn create_pipeline(&mut self, build: &PipelineBuild<'_>) -> Result<NativePipeline> {
        let compute = build
            .modules
            .iter()
            .any(|(stage, _)| *stage == vk::ShaderStageFlags::COMPUTE);
        Ok(NativePipeline {
            pipeline: self.fabricate(),
            layout: self.fabricate(),
            bind_point: if compute {
                vk::PipelineBindPoint::COMPUTE
            } else {
                vk::PipelineBindPoint::GRAPHICS
            },
            push_constant_stages: if compute {
                vk::ShaderStageFlags::COMPUTE
            } else {
                vk::ShaderStageFlags::ALL_GRAPHICS
            },
        })
    }

    fn destroy_pipeline(&mut self, pipeline: &NativePipeline) {
        self.destroyed("pipeline", pipeline.pipeline.as_raw());
    }

    fn create_command_pool(&mut self, _queue: QueueKind) -> Result<vk::CommandPool> {
        Ok(self.fabricate())
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        self.destroyed("command_pool", pool.as_raw());
    }

    fn allocate_command_buffers(
        &mut self,
        _pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        Ok((0..count).map(|_| self.fabricate()).collect())
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()> {
        self.log(MockEvent::ResetPool(pool));
        Ok(())
    }

    fn create_query_pool(&mut self, _count: u32) -> Result<vk::QueryPool> {
        Ok(self.fabricate())
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        self.destroyed("query_pool", pool.as_raw());
    }

    fn query_results(
        &mut self,
        _pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Option<Vec<u64>>> {
        if !self.state.borrow().timestamps_ready {
            return Ok(None);
        }
        // One tick per query so every pair measures (end - begin) ticks
        Ok(Some((first..first + count).map(|q| q as u64 * 1_000_000).collect()))
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        self.recorded.borrow_mut().remove(&cb);
        self.log(MockEvent::Begin(cb));
        Ok(())
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        self.log(MockEvent::End(cb));
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        images: &[NativeImageBarrier],
        buffers: &[NativeBufferBarrier],
    ) {
        self.log(MockEvent::Barrier {
            cb,
            images: images.to_vec(),
            buffers: buffers.to_vec(),
        });
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        self.log(MockEvent::BeginRendering {
            cb,
            extent: info.extent,
            colors: info.colors.len(),
        });
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        self.log(MockEvent::EndRendering(cb));
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &NativePipeline) {
        self.log(MockEvent::BindPipeline(cb, pipeline.pipeline));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        _cb: vk::CommandBuffer,
        _pipeline: &NativePipeline,
        _first_set: u32,
        _sets: &[vk::DescriptorSet],
    ) {
    }

    fn cmd_bind_vertex_buffer(&self, _cb: vk::CommandBuffer, _binding: u32, _buffer: vk::Buffer, _offset: u64) {}

    fn cmd_bind_index_buffer(&self, _cb: vk::CommandBuffer, _buffer: vk::Buffer, _offset: u64, _ty: vk::IndexType) {}

    fn cmd_set_viewport(&self, _cb: vk::CommandBuffer, _viewport: vk::Viewport) {}

    fn cmd_set_scissor(&self, _cb: vk::CommandBuffer, _scissor: vk::Rect2D) {}

    fn cmd_push_constants(&self, _cb: vk::CommandBuffer, _pipeline: &NativePipeline, _data: &[u8]) {}

    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        _vertices: u32,
        _instances: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.log(MockEvent::Draw(cb));
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        _indices: u32,
        _instances: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.log(MockEvent::Draw(cb));
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, _x: u32, _y: u32, _z: u32) {
        self.log(MockEvent::Dispatch(cb));
    }

    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.recorded.borrow_mut().entry(cb).or_default().push(Recorded::Copy {
            src,
            dst,
            regions: regions.to_vec(),
        });
        self.log(MockEvent::CopyBuffer { cb, src, dst });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        _src: vk::Buffer,
        dst: vk::Image,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.log(MockEvent::CopyBufferToImage { cb, image: dst });
    }

    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        _pool: vk::QueryPool,
        _first: u32,
        count: u32,
    ) {
        self.log(MockEvent::ResetQueries { cb, count });
    }

    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, _pool: vk::QueryPool, query: u32) {
        self.log(MockEvent::Timestamp(cb, query));
    }

    fn cmd_begin_label(&self, _cb: vk::CommandBuffer, _name: &str) {}

    fn cmd_end_label(&self, _cb: vk::CommandBuffer) {}
}
