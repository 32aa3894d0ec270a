// Device - root object owning the backend, pools and per-frame machinery
//
// Single threaded. Everything the GPU may still read is kept alive through
// frame-tagged deferred destruction, and per-frame memory (command buffers,
// dynamic ring, staging slice) is only reused after the timeline values of
// the frame that last used the slot have been reached.

mod frame;
mod resources;
mod upload;

#[cfg(test)]
mod tests;

use ash::vk;

use crate::backend::vulkan::VulkanGpu;
use crate::backend::{DescriptorWrite, DescriptorWriteInfo, Gpu, GpuInfo};
use crate::bindless::{BindlessTable, BINDLESS_TEXTURE_BINDING};
use crate::command_buffer::{CommandEncoder, RecordingState};
use crate::command_buffer_manager::{CommandBufferId, CommandBufferManager};
use crate::config::Config;
use crate::deletion_queue::DeletionQueue;
use crate::error::DeviceResult;
use crate::pool::Handle;
use crate::resources::*;
use crate::shader::{GlslcCompiler, ShaderCompiler};
use crate::surface::SurfaceProvider;
use crate::timestamps::{GpuTimestamp, GpuTimestampManager};

pub use resources::{DynamicAllocation, ResourcePools};
pub(crate) use resources::free_resource;
use upload::{FrameRing, HostRing, UploadState};

/// Frame counters; `current` and `previous` are slots in `0..count`
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FrameCounters {
    pub current: u32,
    pub previous: u32,
    pub absolute: u64,
    pub count: u32,
}

/// Timeline semaphore values per queue kind
pub(crate) struct TimelineState {
    values: [u64; QueueKind::COUNT],
    submitted_this_frame: [bool; QueueKind::COUNT],
    // Values signalled by the last frame that used each slot
    slots: Vec<[Option<u64>; QueueKind::COUNT]>,
}

impl TimelineState {
    fn new(frames: u32) -> Self {
        Self {
            values: [0; QueueKind::COUNT],
            submitted_this_frame: [false; QueueKind::COUNT],
            slots: vec![[None; QueueKind::COUNT]; frames as usize],
        }
    }

    pub(crate) fn next_value(&self, queue: QueueKind) -> u64 {
        self.values[queue.index()] + 1
    }

    pub(crate) fn record(&mut self, queue: QueueKind, slot: u32, value: u64) {
        let q = queue.index();
        debug_assert!(value > self.values[q], "{} timeline must increase", queue.name());
        self.values[q] = value;
        self.submitted_this_frame[q] = true;
        self.slots[slot as usize][q] = Some(value);
    }

    /// Last value of `queue` if it was signalled during the current frame
    pub(crate) fn submitted_this_frame(&self, queue: QueueKind) -> Option<u64> {
        self.submitted_this_frame[queue.index()].then_some(self.values[queue.index()])
    }

    fn slot_waits(&self, slot: u32) -> Vec<(QueueKind, u64)> {
        QueueKind::ALL
            .into_iter()
            .filter_map(|queue| {
                self.slots[slot as usize][queue.index()].map(|value| (queue, value))
            })
            .collect()
    }

    fn clear_slot(&mut self, slot: u32) {
        self.slots[slot as usize] = [None; QueueKind::COUNT];
    }

    fn end_frame(&mut self) {
        self.submitted_this_frame = [false; QueueKind::COUNT];
    }
}

pub(crate) struct SwapchainState {
    pub textures: Vec<TextureHandle>,
    /// Image acquired for the current frame, `None` when acquisition failed
    pub image_index: Option<u32>,
    pub extent: (u32, u32),
    pub format: vk::Format,
    pub resize_requested: Option<(u32, u32)>,
    pub needs_recreate: bool,
}

pub struct Device {
    pub(crate) gpu: Box<dyn Gpu>,
    pub(crate) pools: ResourcePools,
    pub(crate) commands: CommandBufferManager,
    pub(crate) bindless: BindlessTable,
    pub(crate) deletion_queue: DeletionQueue,
    pub(crate) timestamps: Option<GpuTimestampManager>,
    pub(crate) compiler: Option<Box<dyn ShaderCompiler>>,

    pub(crate) frame: FrameCounters,
    pub(crate) timeline: TimelineState,
    pub(crate) swapchain: SwapchainState,
    pub(crate) uploads: UploadState,
    pub(crate) dynamic: HostRing,
    /// Graphics command buffers waiting for `present`
    pub(crate) queued: Vec<CommandBufferId>,

    pub(crate) dummy_texture: TextureHandle,
    pub(crate) default_sampler: SamplerHandle,
    pub(crate) last_timestamps: Vec<GpuTimestamp>,
    shut_down: bool,
}

impl Device {
    /// Vulkan device presenting to `surface`, compiling GLSL with `glslc`
    pub fn new(config: &Config, surface: &dyn SurfaceProvider) -> DeviceResult<Self> {
        let gpu = VulkanGpu::new(&config.device, surface)?;
        let mut device = Self::with_backend(Box::new(gpu), config)?;
        device.set_shader_compiler(Box::new(GlslcCompiler::default()));
        Ok(device)
    }

    /// Device over an arbitrary backend; GLSL sources need a compiler set
    /// with `set_shader_compiler`.
    pub fn with_backend(mut gpu: Box<dyn Gpu>, config: &Config) -> DeviceResult<Self> {
        let frames = gpu.frames_in_flight();

        let timestamps = if config.device.gpu_timestamps && gpu.info().timestamps_supported {
            Some(GpuTimestampManager::new(frames, config.device.timestamps_per_frame))
        } else {
            if config.device.gpu_timestamps {
                log::warn!("GPU timestamps requested but not supported by {}", gpu.info().name);
            }
            None
        };
        let queries = timestamps.as_ref().map_or(0, |t| t.queries_per_frame());
        let commands = CommandBufferManager::new(gpu.as_mut(), frames, &config.commands, queries)?;

        let capacity = config.pools.textures;
        let layout = gpu.create_descriptor_set_layout(
            &[DescriptorBinding {
                binding: BINDLESS_TEXTURE_BINDING,
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: capacity,
                stages: vk::ShaderStageFlags::ALL,
            }],
            true,
        )?;
        let set = gpu.allocate_descriptor_set(layout, true)?;

        let mut device = Self {
            gpu,
            pools: ResourcePools::new(&config.pools),
            commands,
            bindless: BindlessTable::new(layout, set, capacity),
            deletion_queue: DeletionQueue::new(),
            timestamps,
            compiler: None,
            frame: FrameCounters {
                count: frames,
                ..Default::default()
            },
            timeline: TimelineState::new(frames),
            swapchain: SwapchainState {
                textures: Vec::new(),
                image_index: None,
                extent: (0, 0),
                format: vk::Format::UNDEFINED,
                resize_requested: None,
                needs_recreate: false,
            },
            uploads: UploadState::new(HostRing {
                buffer: Handle::INVALID,
                ring: FrameRing::new(config.memory.staging_per_frame_size),
            }),
            dynamic: HostRing {
                buffer: Handle::INVALID,
                ring: FrameRing::new(config.memory.dynamic_per_frame_size),
            },
            queued: Vec::new(),
            dummy_texture: Handle::INVALID,
            default_sampler: Handle::INVALID,
            last_timestamps: Vec::new(),
            shut_down: false,
        };

        // On error the partially built device is dropped and shuts down
        device.create_defaults()?;

        log::info!(
            "Device ready on {}: {} frames in flight, {} bindless slots, timestamps {}",
            device.gpu.info().name,
            frames,
            capacity,
            if device.timestamps.is_some() { "on" } else { "off" }
        );
        Ok(device)
    }

    fn create_defaults(&mut self) -> DeviceResult<()> {
        self.register_swapchain_textures();

        let frames = self.frame.count as u64;
        self.dynamic.buffer = self.create_buffer(&BufferCreation::new(
            "dynamic_ring",
            vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC,
            ResourceUsage::Stream,
            self.dynamic.ring.per_frame() * frames,
        ))?;
        self.uploads.staging.buffer = self.create_buffer(&BufferCreation::new(
            "staging_ring",
            vk::BufferUsageFlags::TRANSFER_SRC,
            ResourceUsage::Stream,
            self.uploads.staging.ring.per_frame() * frames,
        ))?;

        self.default_sampler = self.create_sampler(&SamplerCreation::new("default_sampler"))?;
        self.dummy_texture = self.create_texture(
            &TextureCreation::new("dummy_texture", 1, 1, vk::Format::R8G8B8A8_UNORM).with_data(&[255, 255, 255, 255]),
        )?;

        // Every array element starts out on the dummy
        let writes: Vec<DescriptorWrite> = (0..self.bindless.capacity())
            .map(|index| self.bindless_write(index, None))
            .collect();
        self.gpu.write_descriptors(&writes);
        Ok(())
    }

    /// Table write for `index`; `None` points it at the dummy texture
    pub(crate) fn bindless_write(
        &self,
        index: u32,
        texture: Option<TextureHandle>,
    ) -> DescriptorWrite {
        let default_sampler = *self.pools.samplers.get_hot(self.default_sampler);
        let (view, sampler) = match texture {
            Some(texture) => {
                let sampler = self
                    .pools
                    .textures
                    .get_cold(texture)
                    .sampler
                    .map_or(default_sampler, |s| *self.pools.samplers.get_hot(s));
                (self.pools.textures.get_hot(texture).view, sampler)
            }
            None => (self.pools.textures.get_hot(self.dummy_texture).view, default_sampler),
        };
        DescriptorWrite {
            set: self.bindless.set(),
            binding: BINDLESS_TEXTURE_BINDING,
            array_element: index,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            info: DescriptorWriteInfo::Image {
                view,
                sampler,
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
        }
    }

    pub(crate) fn register_swapchain_textures(&mut self) {
        let info = self.gpu.swapchain();
        let (width, height) = info.extent;
        let range = SubresourceRange {
            base_mip: 0,
            mip_count: 1,
            base_layer: 0,
            layer_count: 1,
        };
        self.swapchain.textures = info
            .images
            .iter()
            .enumerate()
            .map(|(i, &(image, view))| {
                self.pools
                    .textures
                    .insert(
                        NativeTexture { image, view },
                        TextureDescription {
                            name: format!("swapchain_{}", i),
                            width,
                            height,
                            depth: 1,
                            mip_levels: 1,
                            array_layers: 1,
                            format: info.format,
                            flags: TextureFlags::RENDER_TARGET,
                            range,
                            swapchain: true,
                            ..Default::default()
                        },
                    )
                    .unwrap_or_else(|| {
                        log::error!("Texture pool exhausted registering the swapchain");
                        panic!("Texture pool exhausted registering the swapchain");
                    })
            })
            .collect();
        self.swapchain.extent = info.extent;
        self.swapchain.format = info.format;
        log::debug!(
            "Registered {} swapchain images ({}x{} {:?})",
            self.swapchain.textures.len(),
            width,
            height,
            info.format
        );
    }

    pub fn set_shader_compiler(&mut self, compiler: Box<dyn ShaderCompiler>) {
        self.compiler = Some(compiler);
    }

    // --- command buffers -----------------------------------------------------

    /// Next command buffer of `queue` for the current frame, already recording.
    ///
    /// # Panics
    /// When the per-frame budget of `queue` is exhausted.
    pub fn get_command_buffer(&mut self, queue: QueueKind) -> DeviceResult<CommandBufferId> {
        Ok(self
            .commands
            .get_command_buffer(self.gpu.as_ref(), queue, self.frame.current)?)
    }

    /// This frame's reserved buffer for work the device records itself
    pub(crate) fn internal_command_buffer(
        &mut self,
        queue: QueueKind,
    ) -> DeviceResult<CommandBufferId> {
        Ok(self
            .commands
            .get_internal_command_buffer(self.gpu.as_ref(), queue, self.frame.current)?)
    }

    /// Recording view over one of this frame's command buffers
    pub fn encoder(&mut self, id: CommandBufferId) -> CommandEncoder<'_> {
        ensure_contract!(
            id.frame == self.frame.current,
            "command buffer of frame slot {} used in slot {}",
            id.frame,
            self.frame.current
        );
        let query_pool = self.commands.query_pool(id.frame);
        // Only graphics buffers are ordered after the query pool reset
        let timestamps = match id.queue {
            QueueKind::Graphics => self.timestamps.as_mut(),
            _ => None,
        };
        CommandEncoder {
            cb: self.commands.get_mut(id),
            gpu: self.gpu.as_ref(),
            pools: &mut self.pools,
            timestamps,
            query_pool,
            bindless_set: self.bindless.set(),
        }
    }

    /// Hand a graphics command buffer to the next `present`
    pub fn queue_command_buffer(&mut self, id: CommandBufferId) {
        ensure_contract!(
            id.queue == QueueKind::Graphics,
            "only graphics command buffers are submitted by present, got {}",
            id.queue.name()
        );
        ensure_contract!(!self.queued.contains(&id), "command buffer {:?} queued twice", id);
        self.queued.push(id);
    }

    /// End and submit a compute command buffer now. The frame's graphics
    /// submission waits for it.
    pub fn submit_compute(&mut self, id: CommandBufferId) -> DeviceResult<()> {
        ensure_contract!(
            id.queue == QueueKind::Compute,
            "submit_compute needs a compute command buffer, got {}",
            id.queue.name()
        );
        self.encoder(id).finish()?;
        self.submit_queue(QueueKind::Compute, id, &[])
    }

    pub fn command_buffer_state(&self, id: CommandBufferId) -> RecordingState {
        self.commands.get(id).state()
    }

    // --- frame info ----------------------------------------------------------

    pub fn gpu_info(&self) -> &GpuInfo {
        self.gpu.info()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frame.count
    }

    /// Slot of the frame being recorded
    pub fn current_frame(&self) -> u32 {
        self.frame.current
    }

    pub fn previous_frame(&self) -> u32 {
        self.frame.previous
    }

    pub fn absolute_frame(&self) -> u64 {
        self.frame.absolute
    }

    /// Swapchain image acquired for this frame
    pub fn swapchain_texture(&self) -> Option<TextureHandle> {
        let index = self.swapchain.image_index?;
        self.swapchain.textures.get(index as usize).copied()
    }

    pub fn swapchain_extent(&self) -> (u32, u32) {
        self.swapchain.extent
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn dummy_texture(&self) -> TextureHandle {
        self.dummy_texture
    }

    pub fn default_sampler(&self) -> SamplerHandle {
        self.default_sampler
    }

    /// Timings of the latest frame whose queries were ready
    pub fn gpu_timestamps(&self) -> &[GpuTimestamp] {
        &self.last_timestamps
    }

    pub fn pending_deletions(&self) -> usize {
        self.deletion_queue.len()
    }

    pub fn wait_idle(&mut self) -> DeviceResult<()> {
        Ok(self.gpu.wait_idle()?)
    }

    // --- shutdown ------------------------------------------------------------

    /// Wait for the GPU, then destroy everything still alive
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        log::info!("Shutting down device after {} frames", self.frame.absolute);

        if let Err(e) = self.gpu.wait_idle() {
            log::error!("Wait idle failed during shutdown: {:#}", e);
        }

        self.uploads.pending.clear();
        self.uploads.acquires.clear();
        self.queued.clear();

        // Pending bindless deletes never reached the deletion queue
        for update in self.bindless.take_batch() {
            if update.deleting {
                self.deletion_queue
                    .push(crate::deletion_queue::ResourceRef::Texture(update.texture), 0);
            }
        }

        let gpu = self.gpu.as_mut();
        let pools = &mut self.pools;
        self.deletion_queue.flush_all(|resource| {
            if pools.is_valid(resource) {
                free_resource(gpu, pools, resource);
            }
        });

        for resource in self.pools.live_resources() {
            if self.pools.is_valid(resource) {
                free_resource(self.gpu.as_mut(), &mut self.pools, resource);
            }
        }

        self.commands.destroy(self.gpu.as_mut());
        self.gpu.destroy_descriptor_set_layout(self.bindless.layout());
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}
