// Command buffers - per-queue recording with cached resource states
//
// A `CommandBuffer` lives in the manager's per-frame slice. Recording goes
// through a `CommandEncoder`, which borrows the buffer together with the
// backend and the resource pools so barriers can read and update the cached
// `ResourceState` of every texture and buffer they touch.

use anyhow::Result;
use ash::vk;

use crate::backend::{
    Gpu, NativeBufferBarrier, NativeImageBarrier, RenderingAttachment, RenderingInfo,
};
use crate::device::ResourcePools;
use crate::resources::{
    BufferHandle, DescriptorSetHandle, ExecutionBarrier, NativePipeline, PipelineHandle, QueueKind,
    RenderPassDesc, ResourceState, ResourceUsage, TextureDescription,
};
use crate::timestamps::GpuTimestampManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    InsidePass,
    Ended,
}

pub struct CommandBuffer {
    pub(crate) native: vk::CommandBuffer,
    pub(crate) queue: QueueKind,
    pub(crate) frame: u32,
    pub(crate) state: RecordingState,
    bound_pipeline: Option<(PipelineHandle, NativePipeline)>,
    pass_extent: Option<(u32, u32)>,
    // Scratch for the barrier call being assembled
    image_barriers: Vec<NativeImageBarrier>,
    buffer_barriers: Vec<NativeBufferBarrier>,
    // One entry per open marker: did it get a timestamp query?
    markers: Vec<bool>,
}

impl CommandBuffer {
    pub(crate) fn new(native: vk::CommandBuffer, queue: QueueKind, frame: u32) -> Self {
        Self {
            native,
            queue,
            frame,
            state: RecordingState::Initial,
            bound_pipeline: None,
            pass_extent: None,
            image_barriers: Vec::new(),
            buffer_barriers: Vec::new(),
            markers: Vec::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> RecordingState {
        self.state
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn native(&self) -> vk::CommandBuffer {
        self.native
    }

    /// Back to `Initial` after the native pool was reset
    pub(crate) fn reset(&mut self) {
        self.state = RecordingState::Initial;
        self.bound_pipeline = None;
        self.pass_extent = None;
        self.image_barriers.clear();
        self.buffer_barriers.clear();
        self.markers.clear();
    }

    pub(crate) fn begin(&mut self, gpu: &dyn Gpu) -> Result<()> {
        debug_assert_eq!(self.state, RecordingState::Initial);
        gpu.begin_command_buffer(self.native)?;
        self.state = RecordingState::Recording;
        Ok(())
    }
}

/// Recording view of one command buffer
pub struct CommandEncoder<'a> {
    pub(crate) cb: &'a mut CommandBuffer,
    pub(crate) gpu: &'a dyn Gpu,
    pub(crate) pools: &'a mut ResourcePools,
    pub(crate) timestamps: Option<&'a mut GpuTimestampManager>,
    pub(crate) query_pool: vk::QueryPool,
    pub(crate) bindless_set: vk::DescriptorSet,
}

impl<'a> CommandEncoder<'a> {
    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.cb.queue
    }

    #[inline]
    pub fn state(&self) -> RecordingState {
        self.cb.state
    }

    fn require_queue(&self, allowed: &[QueueKind], what: &str) {
        ensure_contract!(
            allowed.contains(&self.cb.queue),
            "{} is not allowed on a {} command buffer",
            what,
            self.cb.queue.name()
        );
    }

    fn require_state(&self, state: RecordingState, what: &str) {
        ensure_contract!(
            self.cb.state == state,
            "{} requires {:?} but command buffer is {:?}",
            what,
            state,
            self.cb.state
        );
    }

    /// Transition resources, skipping entries already in the requested state.
    ///
    /// All surviving transitions go out in a single pipeline barrier; when
    /// nothing survives no native command is recorded.
    pub fn barrier(&mut self, barrier: &ExecutionBarrier) {
        self.require_state(RecordingState::Recording, "barrier");
        let queue = self.cb.queue;
        self.cb.image_barriers.clear();
        self.cb.buffer_barriers.clear();

        for entry in &barrier.images {
            let (hot, cold) = self.pools.textures.get_mut(entry.texture);
            if cold.state == entry.new_state {
                continue;
            }
            self.cb.image_barriers.push(NativeImageBarrier {
                image: hot.image,
                aspect: cold.aspect(),
                range: cold.range,
                old_layout: cold.state.image_layout(),
                new_layout: entry.new_state.image_layout(),
                src_stage: cold.state.stage_mask(queue),
                src_access: cold.state.access_mask(),
                dst_stage: entry.new_state.stage_mask(queue),
                dst_access: entry.new_state.access_mask(),
                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            });
            cold.state = entry.new_state;
        }

        for entry in &barrier.buffers {
            let (hot, cold) = self.pools.buffers.get_mut(entry.buffer);
            if cold.state == entry.new_state {
                continue;
            }
            let old_state = std::mem::replace(&mut cold.state, entry.new_state);
            // Dynamic buffers are host written and visible at submit
            if cold.residency == ResourceUsage::Dynamic {
                continue;
            }
            self.cb.buffer_barriers.push(NativeBufferBarrier {
                buffer: hot.buffer,
                offset: 0,
                size: vk::WHOLE_SIZE,
                src_stage: old_state.stage_mask(queue),
                src_access: old_state.access_mask(),
                dst_stage: entry.new_state.stage_mask(queue),
                dst_access: entry.new_state.access_mask(),
                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            });
        }

        if self.cb.image_barriers.is_empty() && self.cb.buffer_barriers.is_empty() {
            return;
        }
        self.gpu.cmd_pipeline_barrier(
            self.cb.native,
            &self.cb.image_barriers,
            &self.cb.buffer_barriers,
        );
    }

    /// Record prepared ownership/layout barriers verbatim
    pub(crate) fn raw_barrier(
        &mut self,
        images: &[NativeImageBarrier],
        buffers: &[NativeBufferBarrier],
    ) {
        if images.is_empty() && buffers.is_empty() {
            return;
        }
        self.gpu.cmd_pipeline_barrier(self.cb.native, images, buffers);
    }

    pub fn begin_pass(&mut self, desc: &RenderPassDesc) {
        self.require_queue(&[QueueKind::Graphics], "begin_pass");
        self.require_state(RecordingState::Recording, "begin_pass");
        ensure_contract!(
            !desc.color_targets.is_empty() || desc.depth_target.is_some(),
            "begin_pass without any target"
        );

        let mut extent: Option<(u32, u32)> = None;
        let mut colors = Vec::with_capacity(desc.color_targets.len());

        for target in &desc.color_targets {
            let hot = self.pools.textures.get_hot(target.texture);
            let cold = self.pools.textures.get_cold(target.texture);
            ensure_contract!(
                cold.state == ResourceState::RenderTarget,
                "color target '{}' is {:?}, expected RenderTarget",
                cold.name,
                cold.state
            );
            match_extent(&mut extent, cold);
            colors.push(RenderingAttachment {
                view: hot.view,
                layout: ResourceState::RenderTarget.image_layout(),
                load_op: target.load_op.vk(),
                clear: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: target.clear_color,
                    },
                },
            });
        }

        let depth = desc.depth_target.map(|target| {
            let hot = self.pools.textures.get_hot(target.texture);
            let cold = self.pools.textures.get_cold(target.texture);
            ensure_contract!(
                matches!(cold.state, ResourceState::DepthWrite | ResourceState::DepthRead),
                "depth target '{}' is {:?}, expected DepthWrite or DepthRead",
                cold.name,
                cold.state
            );
            match_extent(&mut extent, cold);
            RenderingAttachment {
                view: hot.view,
                layout: cold.state.image_layout(),
                load_op: target.load_op.vk(),
                clear: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: target.clear_depth,
                        stencil: target.clear_stencil,
                    },
                },
            }
        });

        let (width, height) = extent.unwrap_or_default();
        self.gpu.cmd_begin_rendering(
            self.cb.native,
            &RenderingInfo {
                extent: (width, height),
                colors,
                depth,
            },
        );

        // Full-target defaults; pipelines keep viewport and scissor dynamic
        self.gpu.cmd_set_viewport(
            self.cb.native,
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        self.gpu.cmd_set_scissor(
            self.cb.native,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            },
        );

        self.cb.pass_extent = Some((width, height));
        self.cb.state = RecordingState::InsidePass;
    }

    pub fn end_pass(&mut self) {
        self.require_state(RecordingState::InsidePass, "end_pass");
        self.gpu.cmd_end_rendering(self.cb.native);
        self.cb.pass_extent = None;
        self.cb.state = RecordingState::Recording;
    }

    /// Extent of the open pass, if any
    pub fn pass_extent(&self) -> Option<(u32, u32)> {
        self.cb.pass_extent
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        let native = *self.pools.pipelines.get_hot(pipeline);
        if native.bind_point == vk::PipelineBindPoint::GRAPHICS {
            self.require_queue(&[QueueKind::Graphics], "binding a graphics pipeline");
        } else {
            self.require_queue(
                &[QueueKind::Graphics, QueueKind::Compute],
                "binding a compute pipeline",
            );
        }
        if matches!(self.cb.bound_pipeline, Some((bound, _)) if bound == pipeline) {
            return;
        }

        self.gpu.cmd_bind_pipeline(self.cb.native, &native);
        // Set 0 of every pipeline layout is the bindless table
        self.gpu
            .cmd_bind_descriptor_sets(self.cb.native, &native, 0, &[self.bindless_set]);
        self.cb.bound_pipeline = Some((pipeline, native));
    }

    /// Bind user descriptor sets starting at set 1
    pub fn bind_descriptor_sets(&mut self, sets: &[DescriptorSetHandle]) {
        let (_, native) = self.bound_pipeline("bind_descriptor_sets");
        let natives: Vec<vk::DescriptorSet> =
            sets.iter().map(|&set| *self.pools.sets.get_hot(set)).collect();
        self.gpu.cmd_bind_descriptor_sets(self.cb.native, &native, 1, &natives);
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle, binding: u32, offset: u64) {
        self.require_queue(&[QueueKind::Graphics], "bind_vertex_buffer");
        let (native, base) = self.resolve_buffer(buffer);
        self.gpu
            .cmd_bind_vertex_buffer(self.cb.native, binding, native, base + offset);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        self.require_queue(&[QueueKind::Graphics], "bind_index_buffer");
        let (native, base) = self.resolve_buffer(buffer);
        self.gpu
            .cmd_bind_index_buffer(self.cb.native, native, base + offset, index_type);
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) {
        self.require_queue(&[QueueKind::Graphics], "set_viewport");
        self.gpu.cmd_set_viewport(self.cb.native, viewport);
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) {
        self.require_queue(&[QueueKind::Graphics], "set_scissor");
        self.gpu.cmd_set_scissor(self.cb.native, scissor);
    }

    pub fn push_constants(&mut self, data: &[u8]) {
        let (_, native) = self.bound_pipeline("push_constants");
        self.gpu.cmd_push_constants(self.cb.native, &native, data);
    }

    pub fn draw(&mut self, vertices: u32, instances: u32, first_vertex: u32, first_instance: u32) {
        self.require_draw("draw");
        self.gpu
            .cmd_draw(self.cb.native, vertices, instances, first_vertex, first_instance);
    }

    pub fn draw_indexed(
        &mut self,
        indices: u32,
        instances: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.require_draw("draw_indexed");
        self.gpu.cmd_draw_indexed(
            self.cb.native,
            indices,
            instances,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.require_queue(&[QueueKind::Graphics, QueueKind::Compute], "dispatch");
        self.require_state(RecordingState::Recording, "dispatch");
        let (_, native) = self.bound_pipeline("dispatch");
        ensure_contract!(
            native.bind_point == vk::PipelineBindPoint::COMPUTE,
            "dispatch with a graphics pipeline bound"
        );
        self.gpu.cmd_dispatch(self.cb.native, x, y, z);
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.require_state(RecordingState::Recording, "copy_buffer");
        let (src_native, src_base) = self.resolve_buffer(src);
        let (dst_native, dst_base) = self.resolve_buffer(dst);
        let region = vk::BufferCopy {
            src_offset: src_base + src_offset,
            dst_offset: dst_base + dst_offset,
            size,
        };
        self.gpu
            .cmd_copy_buffer(self.cb.native, src_native, dst_native, std::slice::from_ref(&region));
    }

    /// Open a debug label, timed when GPU timestamps are enabled
    pub fn push_marker(&mut self, name: &str) {
        self.gpu.cmd_begin_label(self.cb.native, name);
        let query = match (self.cb.queue, self.timestamps.as_deref_mut()) {
            (QueueKind::Transfer, _) | (_, None) => None,
            (_, Some(manager)) => manager.push(self.cb.frame, name),
        };
        if let Some(query) = query {
            self.gpu.cmd_write_timestamp(self.cb.native, self.query_pool, query);
        }
        self.cb.markers.push(query.is_some());
    }

    pub fn pop_marker(&mut self) {
        let Some(timed) = self.cb.markers.pop() else {
            log::warn!("pop_marker without a matching push_marker");
            return;
        };
        let frame = self.cb.frame;
        if timed {
            if let Some(query) = self.timestamps.as_deref_mut().and_then(|m| m.pop(frame)) {
                self.gpu.cmd_write_timestamp(self.cb.native, self.query_pool, query);
            }
        }
        self.gpu.cmd_end_label(self.cb.native);
    }

    /// Close anything left open and end native recording
    pub(crate) fn finish(mut self) -> Result<()> {
        if self.cb.state == RecordingState::InsidePass {
            log::warn!("Command buffer submitted inside a render pass, closing it");
            self.end_pass();
        }
        while !self.cb.markers.is_empty() {
            self.pop_marker();
        }
        if self.cb.state == RecordingState::Recording {
            self.gpu.end_command_buffer(self.cb.native)?;
            self.cb.state = RecordingState::Ended;
        }
        Ok(())
    }

    fn bound_pipeline(&self, what: &str) -> (PipelineHandle, NativePipeline) {
        match self.cb.bound_pipeline {
            Some(bound) => bound,
            None => {
                log::error!("{} without a bound pipeline", what);
                panic!("{} without a bound pipeline", what);
            }
        }
    }

    fn require_draw(&self, what: &str) {
        self.require_queue(&[QueueKind::Graphics], what);
        self.require_state(RecordingState::InsidePass, what);
        let (_, native) = self.bound_pipeline(what);
        ensure_contract!(
            native.bind_point == vk::PipelineBindPoint::GRAPHICS,
            "{} with a compute pipeline bound",
            what
        );
    }

    /// Native buffer and base offset; dynamic buffers live inside the ring
    fn resolve_buffer(&self, buffer: BufferHandle) -> (vk::Buffer, u64) {
        let cold = self.pools.buffers.get_cold(buffer);
        match cold.parent_buffer {
            Some(parent) => (self.pools.buffers.get_hot(parent).buffer, cold.global_offset),
            None => (self.pools.buffers.get_hot(buffer).buffer, 0),
        }
    }
}

fn mip_extent(texture: &TextureDescription) -> (u32, u32) {
    let mip = texture.range.base_mip;
    ((texture.width >> mip).max(1), (texture.height >> mip).max(1))
}

fn match_extent(extent: &mut Option<(u32, u32)>, texture: &TextureDescription) {
    let size = mip_extent(texture);
    match *extent {
        None => *extent = Some(size),
        Some(expected) => ensure_contract!(
            expected == size,
            "render target '{}' is {:?}, other targets are {:?}",
            texture.name,
            size,
            expected
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockEvent, MockGpu, Progress};
    use crate::config::PoolConfig;
    use crate::resources::{NativeTexture, TextureFlags};
    use ash::vk::Handle as _;

    struct Fixture {
        gpu: MockGpu,
        mock: crate::backend::mock::MockHandle,
        pools: ResourcePools,
        cb: CommandBuffer,
    }

    fn fixture(queue: QueueKind) -> Fixture {
        let (gpu, mock) = MockGpu::new(2, Progress::Immediate);
        let mut cb = CommandBuffer::new(vk::CommandBuffer::from_raw(7), queue, 0);
        cb.begin(&gpu).unwrap();
        Fixture {
            gpu,
            mock,
            pools: ResourcePools::new(&PoolConfig::default()),
            cb,
        }
    }

    fn texture(
        pools: &mut ResourcePools,
        name: &str,
        size: u32,
    ) -> crate::resources::TextureHandle {
        pools
            .textures
            .insert(
                NativeTexture {
                    image: vk::Image::from_raw(size as u64 + 100),
                    view: vk::ImageView::from_raw(size as u64 + 200),
                },
                TextureDescription {
                    name: name.into(),
                    width: size,
                    height: size,
                    depth: 1,
                    mip_levels: 1,
                    array_layers: 1,
                    format: vk::Format::R8G8B8A8_UNORM,
                    flags: TextureFlags::RENDER_TARGET,
                    range: crate::resources::SubresourceRange {
                        base_mip: 0,
                        mip_count: 1,
                        base_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                },
            )
            .unwrap()
    }

    impl Fixture {
        fn encoder(&mut self) -> CommandEncoder<'_> {
            CommandEncoder {
                cb: &mut self.cb,
                gpu: &self.gpu,
                pools: &mut self.pools,
                timestamps: None,
                query_pool: vk::QueryPool::null(),
                bindless_set: vk::DescriptorSet::null(),
            }
        }

        fn barriers(&self) -> Vec<MockEvent> {
            self.mock
                .events()
                .into_iter()
                .filter(|e| matches!(e, MockEvent::Barrier { .. }))
                .collect()
        }
    }

    #[test]
    fn repeated_barrier_is_elided() {
        let mut f = fixture(QueueKind::Graphics);
        let rt = texture(&mut f.pools, "rt", 16);
        let barrier = ExecutionBarrier::new().image(rt, ResourceState::RenderTarget);

        f.encoder().barrier(&barrier);
        f.encoder().barrier(&barrier);

        assert_eq!(f.barriers().len(), 1);
        assert_eq!(f.pools.textures.get_cold(rt).state, ResourceState::RenderTarget);
    }

    #[test]
    fn one_call_is_one_native_barrier() {
        let mut f = fixture(QueueKind::Graphics);
        let a = texture(&mut f.pools, "a", 16);
        let b = texture(&mut f.pools, "b", 16);

        f.encoder().barrier(
            &ExecutionBarrier::new()
                .image(a, ResourceState::RenderTarget)
                .image(b, ResourceState::RenderTarget)
                .image(a, ResourceState::RenderTarget),
        );

        let barriers = f.barriers();
        assert_eq!(barriers.len(), 1);
        let MockEvent::Barrier { images, .. } = &barriers[0] else {
            unreachable!()
        };
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(images[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn pass_requires_render_target_state() {
        let mut f = fixture(QueueKind::Graphics);
        let rt = texture(&mut f.pools, "rt", 32);
        let mut enc = f.encoder();
        enc.barrier(&ExecutionBarrier::new().image(rt, ResourceState::RenderTarget));
        let target = crate::resources::ColorTarget::clear(rt, [0.0; 4]);
        enc.begin_pass(&RenderPassDesc::new().color(target));
        assert_eq!(enc.state(), RecordingState::InsidePass);
        assert_eq!(enc.pass_extent(), Some((32, 32)));
        enc.end_pass();
        assert_eq!(enc.state(), RecordingState::Recording);
    }

    #[test]
    #[should_panic(expected = "expected RenderTarget")]
    fn pass_on_untransitioned_target_panics() {
        let mut f = fixture(QueueKind::Graphics);
        let rt = texture(&mut f.pools, "rt", 32);
        let target = crate::resources::ColorTarget::clear(rt, [0.0; 4]);
        f.encoder().begin_pass(&RenderPassDesc::new().color(target));
    }

    #[test]
    #[should_panic(expected = "other targets are")]
    fn mismatched_target_sizes_panic() {
        let mut f = fixture(QueueKind::Graphics);
        let a = texture(&mut f.pools, "a", 32);
        let b = texture(&mut f.pools, "b", 64);
        let mut enc = f.encoder();
        enc.barrier(
            &ExecutionBarrier::new()
                .image(a, ResourceState::RenderTarget)
                .image(b, ResourceState::RenderTarget),
        );
        enc.begin_pass(
            &RenderPassDesc::new()
                .color(crate::resources::ColorTarget::load(a))
                .color(crate::resources::ColorTarget::load(b)),
        );
    }

    #[test]
    #[should_panic(expected = "requires InsidePass")]
    fn draw_outside_pass_panics() {
        let mut f = fixture(QueueKind::Graphics);
        f.encoder().draw(3, 1, 0, 0);
    }

    #[test]
    #[should_panic(expected = "not allowed on a transfer")]
    fn pass_on_transfer_queue_panics() {
        let mut f = fixture(QueueKind::Transfer);
        let rt = texture(&mut f.pools, "rt", 8);
        f.encoder()
            .begin_pass(&RenderPassDesc::new().color(crate::resources::ColorTarget::load(rt)));
    }

    #[test]
    fn finish_closes_open_pass() {
        let mut f = fixture(QueueKind::Graphics);
        let rt = texture(&mut f.pools, "rt", 8);
        let mut enc = f.encoder();
        enc.barrier(&ExecutionBarrier::new().image(rt, ResourceState::RenderTarget));
        enc.begin_pass(&RenderPassDesc::new().color(crate::resources::ColorTarget::load(rt)));
        enc.push_marker("unbalanced");
        enc.finish().unwrap();

        assert_eq!(f.cb.state(), RecordingState::Ended);
        assert_eq!(f.mock.count(|e| matches!(e, MockEvent::EndRendering(_))), 1);
        assert_eq!(f.mock.count(|e| matches!(e, MockEvent::End(_))), 1);
    }
}
