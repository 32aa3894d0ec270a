// Backend module - the native API seam
//
// `Gpu` is everything the device asks of the native API: object creation,
// command recording, queue submission, timeline waits and presentation.
// `vulkan::VulkanGpu` implements it over ash; tests drive the device through
// a recording mock instead.
//
// Recording entry points take `&self` (like ash's `cmd_*`), everything that
// touches the allocator or queues takes `&mut self`.

use anyhow::Result;
use ash::vk;
use std::ptr::NonNull;

use crate::resources::{
    DescriptorBinding, NativePipeline, PipelineCreation, QueueKind, SamplerDescription, SubresourceRange,
};

pub mod vulkan;

#[cfg(test)]
pub mod mock;

/// Static facts about the selected adapter
#[derive(Clone, Debug)]
pub struct GpuInfo {
    pub name: String,
    /// Family index per `QueueKind`; kinds may share a family
    pub queue_families: [u32; QueueKind::COUNT],
    pub timestamp_period: f32,
    pub timestamps_supported: bool,
    pub min_uniform_alignment: u64,
    pub min_storage_alignment: u64,
}

impl GpuInfo {
    #[inline]
    pub fn family(&self, queue: QueueKind) -> u32 {
        self.queue_families[queue.index()]
    }
}

#[derive(Clone, Debug)]
pub struct SwapchainInfo {
    pub format: vk::Format,
    pub extent: (u32, u32),
    pub images: Vec<(vk::Image, vk::ImageView)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub host_visible: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    /// Bind to the memory of this image instead of allocating
    pub alias: Option<vk::Image>,
}

#[derive(Clone, Copy, Debug)]
pub struct ImageViewDesc {
    pub image: vk::Image,
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub range: SubresourceRange,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub range: SubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeBufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Clone, Copy)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub clear: vk::ClearValue,
}

#[derive(Clone)]
pub struct RenderingInfo {
    pub extent: (u32, u32),
    pub colors: Vec<RenderingAttachment>,
    pub depth: Option<RenderingAttachment>,
}

#[derive(Clone, Copy, Debug)]
pub enum DescriptorWriteInfo {
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
}

#[derive(Clone, Copy, Debug)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub info: DescriptorWriteInfo,
}

/// Creation parameters resolved to native objects
pub struct PipelineBuild<'a> {
    pub creation: &'a PipelineCreation<'a>,
    pub modules: &'a [(vk::ShaderStageFlags, vk::ShaderModule)],
    pub set_layouts: &'a [vk::DescriptorSetLayout],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelineWait {
    pub queue: QueueKind,
    pub value: u64,
    pub stage: vk::PipelineStageFlags2,
}

#[derive(Clone, Debug)]
pub struct QueueSubmit<'a> {
    pub queue: QueueKind,
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Frame slot whose acquire semaphore must be waited on
    pub wait_acquire: Option<u32>,
    pub wait_timelines: &'a [TimelineWait],
    /// Frame slot whose present semaphore gets signalled
    pub signal_present: Option<u32>,
    /// New value of the submitting queue's timeline
    pub signal_timeline: Option<u64>,
}

pub trait Gpu {
    fn info(&self) -> &GpuInfo;

    // --- swapchain -----------------------------------------------------------

    fn frames_in_flight(&self) -> u32;
    fn swapchain(&self) -> SwapchainInfo;
    fn acquire_next_image(&mut self, slot: u32) -> Result<Acquired>;
    /// Returns true when the swapchain should be recreated
    fn present(&mut self, slot: u32, image_index: u32) -> Result<bool>;
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()>;

    // --- synchronization -----------------------------------------------------

    /// Block until every listed timeline reached its value
    fn wait_timelines(&mut self, waits: &[(QueueKind, u64)]) -> Result<()>;
    fn completed_value(&self, queue: QueueKind) -> Result<u64>;
    fn submit(&mut self, submit: &QueueSubmit<'_>) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;

    // --- resources -----------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Result<(vk::Buffer, Option<NonNull<u8>>)>;
    fn destroy_buffer(&mut self, buffer: vk::Buffer);
    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<vk::Image>;
    /// Frees the memory too unless the image is an alias
    fn destroy_image(&mut self, image: vk::Image);
    fn create_image_view(&mut self, desc: &ImageViewDesc) -> Result<vk::ImageView>;
    fn destroy_image_view(&mut self, view: vk::ImageView);
    fn create_sampler(&mut self, desc: &SamplerDescription) -> Result<vk::Sampler>;
    fn destroy_sampler(&mut self, sampler: vk::Sampler);
    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&mut self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
        bindless: bool,
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout);
    fn allocate_descriptor_set(&mut self, layout: vk::DescriptorSetLayout, bindless: bool)
        -> Result<vk::DescriptorSet>;
    fn free_descriptor_set(&mut self, set: vk::DescriptorSet);
    fn write_descriptors(&mut self, writes: &[DescriptorWrite]);
    fn create_pipeline(&mut self, build: &PipelineBuild<'_>) -> Result<NativePipeline>;
    fn destroy_pipeline(&mut self, pipeline: &NativePipeline);

    // --- command pools & queries ---------------------------------------------

    fn create_command_pool(&mut self, queue: QueueKind) -> Result<vk::CommandPool>;
    fn destroy_command_pool(&mut self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()>;
    fn create_query_pool(&mut self, count: u32) -> Result<vk::QueryPool>;
    fn destroy_query_pool(&mut self, pool: vk::QueryPool);
    /// `None` while any of the queries is not available yet
    fn query_results(
        &mut self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Option<Vec<u64>>>;

    // --- recording -----------------------------------------------------------

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()>;
    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()>;
    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        images: &[NativeImageBarrier],
        buffers: &[NativeBufferBarrier],
    );
    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo);
    fn cmd_end_rendering(&self, cb: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &NativePipeline);
    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &NativePipeline,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_bind_vertex_buffer(
        &self,
        cb: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    );
    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    );
    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_push_constants(&self, cb: vk::CommandBuffer, pipeline: &NativePipeline, data: &[u8]);
    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertices: u32,
        instances: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        indices: u32,
        instances: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    );
    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, query: u32);
    fn cmd_begin_label(&self, cb: vk::CommandBuffer, name: &str);
    fn cmd_end_label(&self, cb: vk::CommandBuffer);
}
