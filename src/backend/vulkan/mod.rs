// Vulkan backend - `Gpu` over ash 1.3
//
// Synchronization2, dynamic rendering and one timeline semaphore per queue
// kind. Memory comes from gpu-allocator; allocations are keyed by the native
// handle they back so `destroy_*` can return them.

mod init;
mod pipeline;
mod surface;
mod swapchain;

use anyhow::{bail, Context, Result};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::ptr::NonNull;

use super::{
    Acquired, BufferDesc, DescriptorWrite, DescriptorWriteInfo, Gpu, GpuInfo, ImageDesc, ImageViewDesc,
    NativeBufferBarrier, NativeImageBarrier, PipelineBuild, QueueSubmit, RenderingInfo, SwapchainInfo,
};
use crate::config::DeviceConfig;
use crate::error::DeviceResult;
use crate::resources::{DescriptorBinding, NativePipeline, QueueKind, SamplerDescription};
use crate::surface::SurfaceProvider;
use init::Rollback;
use swapchain::{Swapchain, SwapchainSettings};

/// Descriptors of each type in the shared (non-bindless) pool
const DESCRIPTOR_POOL_SIZE: u32 = 1024;

pub struct VulkanGpu {
    info: GpuInfo,
    frames: u32,
    settings: SwapchainSettings,

    // Vulkan handles (allocator must go before the device)
    allocator: ManuallyDrop<Allocator>,
    buffers: HashMap<vk::Buffer, Allocation>,
    /// `None` for images aliasing another image's memory
    images: HashMap<vk::Image, Option<Allocation>>,
    descriptor_pool: vk::DescriptorPool,
    bindless_pool: Option<vk::DescriptorPool>,
    set_pools: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
    queues: [vk::Queue; QueueKind::COUNT],
    timelines: [vk::Semaphore; QueueKind::COUNT],
    swapchain: Swapchain,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    instance: ash::Instance,
    _entry: ash::Entry,
}

impl VulkanGpu {
    /// Create the instance, device and swapchain presenting to `provider`
    pub fn new(config: &DeviceConfig, provider: &dyn SurfaceProvider) -> DeviceResult<Self> {
        log::info!("Creating Vulkan device");

        let (display, window) = surface::raw_handles(provider)?;
        let entry = init::load_entry()?;
        let mut rollback = Rollback::new();

        let (instance, debug_enabled) = init::create_instance(&entry, "render-device", display, config.validation)?;
        {
            let instance = instance.clone();
            rollback.push(move || unsafe { instance.destroy_instance(None) });
        }

        let debug_utils = if debug_enabled {
            let (loader, messenger) = init::setup_debug_messenger(&entry, &instance)?;
            let cleanup = loader.clone();
            rollback.push(move || unsafe { cleanup.destroy_debug_utils_messenger(messenger, None) });
            Some((loader, messenger))
        } else {
            None
        };

        let surface_loader = ash::extensions::khr::Surface::new(&entry, &instance);
        // SAFETY: the provider's window outlives the device
        let surface = unsafe { surface::create_surface(&entry, &instance, display, window)? };
        {
            let loader = surface_loader.clone();
            rollback.push(move || unsafe { loader.destroy_surface(surface, None) });
        }

        let adapter = init::pick_adapter(&instance, &surface_loader, surface)?;
        let properties = adapter.properties;
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();
        log::info!("Selected GPU: {}", name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, compute {}, transfer {}",
            adapter.families[0],
            adapter.families[1],
            adapter.families[2]
        );

        let (device, queues) = init::create_logical_device(&instance, &adapter)?;
        {
            let device = device.clone();
            rollback.push(move || unsafe { device.destroy_device(None) });
        }

        let allocator = init::create_allocator(&instance, adapter.physical_device, &device)?;

        let mut timelines = [vk::Semaphore::null(); QueueKind::COUNT];
        for timeline in &mut timelines {
            *timeline = init::create_timeline(&device)?;
            let (device, semaphore) = (device.clone(), *timeline);
            rollback.push(move || unsafe { device.destroy_semaphore(semaphore, None) });
        }

        let descriptor_pool = create_descriptor_pool(&device)?;
        {
            let device = device.clone();
            rollback.push(move || unsafe { device.destroy_descriptor_pool(descriptor_pool, None) });
        }

        let settings = SwapchainSettings {
            present_mode: config.present_mode(),
            image_count: config.swapchain_images.max(2),
        };
        let swapchain = Swapchain::new(
            &instance,
            &device,
            adapter.physical_device,
            surface,
            &surface_loader,
            &settings,
            provider.drawable_size(),
        )?;
        let frames = swapchain.images.len() as u32;
        log::info!("{} frames in flight", frames);

        rollback.disarm();

        let limits = properties.limits;
        Ok(Self {
            info: GpuInfo {
                name,
                queue_families: adapter.families,
                timestamp_period: limits.timestamp_period,
                timestamps_supported: adapter.timestamps_supported,
                min_uniform_alignment: limits.min_uniform_buffer_offset_alignment,
                min_storage_alignment: limits.min_storage_buffer_offset_alignment,
            },
            frames,
            settings,
            allocator: ManuallyDrop::new(allocator),
            buffers: HashMap::new(),
            images: HashMap::new(),
            descriptor_pool,
            bindless_pool: None,
            set_pools: HashMap::new(),
            queues,
            timelines,
            swapchain,
            device,
            physical_device: adapter.physical_device,
            surface,
            surface_loader,
            debug_utils,
            instance,
            _entry: entry,
        })
    }

    fn set_name<H: Handle>(&self, handle: H, name: &str) {
        let Some((debug_utils, _)) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(H::TYPE)
            .object_handle(handle.as_raw())
            .object_name(&name);
        if let Err(e) = unsafe { debug_utils.set_debug_utils_object_name(self.device.handle(), &info) } {
            log::debug!("Naming {:?} failed: {}", H::TYPE, e);
        }
    }

    fn queue(&self, queue: QueueKind) -> vk::Queue {
        self.queues[queue.index()]
    }
}

fn create_descriptor_pool(device: &ash::Device) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::SAMPLER,
    ]
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: DESCRIPTOR_POOL_SIZE,
    });

    let info = vk::DescriptorPoolCreateInfo::builder()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(DESCRIPTOR_POOL_SIZE)
        .pool_sizes(&pool_sizes);

    unsafe { device.create_descriptor_pool(&info, None) }.context("Failed to create descriptor pool")
}

fn subresource_range(
    aspect: vk::ImageAspectFlags,
    range: crate::resources::SubresourceRange,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: range.base_mip,
        level_count: range.mip_count,
        base_array_layer: range.base_layer,
        layer_count: range.layer_count,
    }
}

impl Gpu for VulkanGpu {
    fn info(&self) -> &GpuInfo {
        &self.info
    }

    // --- swapchain -----------------------------------------------------------

    fn frames_in_flight(&self) -> u32 {
        self.frames
    }

    fn swapchain(&self) -> SwapchainInfo {
        SwapchainInfo {
            format: self.swapchain.format,
            extent: (self.swapchain.extent.width, self.swapchain.extent.height),
            images: self
                .swapchain
                .images
                .iter()
                .copied()
                .zip(self.swapchain.image_views.iter().copied())
                .collect(),
        }
    }

    fn acquire_next_image(&mut self, slot: u32) -> Result<Acquired> {
        self.swapchain.acquire_next_image(slot)
    }

    fn present(&mut self, slot: u32, image_index: u32) -> Result<bool> {
        self.swapchain.present(self.queue(QueueKind::Graphics), slot, image_index)
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        self.swapchain.recreate(
            &self.device,
            self.physical_device,
            self.surface,
            &self.surface_loader,
            &self.settings,
            (width, height),
        )
    }

    // --- synchronization -----------------------------------------------------

    fn wait_timelines(&mut self, waits: &[(QueueKind, u64)]) -> Result<()> {
        if waits.is_empty() {
            return Ok(());
        }
        let semaphores: Vec<_> = waits.iter().map(|&(queue, _)| self.timelines[queue.index()]).collect();
        let values: Vec<_> = waits.iter().map(|&(_, value)| value).collect();
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&info, u64::MAX) }.context("Failed to wait on timeline semaphores")
    }

    fn completed_value(&self, queue: QueueKind) -> Result<u64> {
        unsafe { self.device.get_semaphore_counter_value(self.timelines[queue.index()]) }
            .context("Failed to read timeline value")
    }

    fn submit(&mut self, submit: &QueueSubmit<'_>) -> Result<()> {
        let mut waits: Vec<_> = submit
            .wait_timelines
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(self.timelines[wait.queue.index()])
                    .value(wait.value)
                    .stage_mask(wait.stage)
                    .build()
            })
            .collect();
        if let Some(slot) = submit.wait_acquire {
            waits.push(
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(self.swapchain.acquire_semaphore(slot))
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build(),
            );
        }

        let mut signals = Vec::with_capacity(2);
        if let Some(value) = submit.signal_timeline {
            signals.push(
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(self.timelines[submit.queue.index()])
                    .value(value)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build(),
            );
        }
        if let Some(slot) = submit.signal_present {
            signals.push(
                vk::SemaphoreSubmitInfo::builder()
                    .semaphore(self.swapchain.present_semaphore(slot))
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .build(),
            );
        }

        let command_buffers: Vec<_> = submit
            .command_buffers
            .iter()
            .map(|&cb| vk::CommandBufferSubmitInfo::builder().command_buffer(cb).build())
            .collect();

        let info = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals)
            .build();

        unsafe {
            self.device
                .queue_submit2(self.queue(submit.queue), &[info], vk::Fence::null())
        }
        .with_context(|| format!("Failed to submit to the {} queue", submit.queue.name()))
    }

    fn wait_idle(&mut self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }

    // --- resources -----------------------------------------------------------

    fn create_buffer(
        &mut self,
        desc: &BufferDesc<'_>,
    ) -> Result<(vk::Buffer, Option<NonNull<u8>>)> {
        if desc.size == 0 {
            bail!("buffer '{}' has zero size", desc.name);
        }
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", desc.name))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = match self.allocator.allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e).with_context(|| format!("Failed to allocate memory for buffer '{}'", desc.name));
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            if let Err(free) = self.allocator.free(allocation) {
                log::error!("Failed to free buffer memory: {}", free);
            }
            return Err(e).context("Failed to bind buffer memory");
        }

        let mapped = allocation.mapped_ptr().map(|ptr| ptr.cast::<u8>());
        if desc.host_visible && mapped.is_none() {
            log::warn!("Host visible buffer '{}' is not persistently mapped", desc.name);
        }
        self.set_name(buffer, desc.name);
        self.buffers.insert(buffer, allocation);
        Ok((buffer, mapped))
    }

    fn destroy_buffer(&mut self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        match self.buffers.remove(&buffer) {
            Some(allocation) => {
                if let Err(e) = self.allocator.free(allocation) {
                    log::error!("Failed to free buffer memory: {}", e);
                }
            }
            None => log::warn!("Destroyed buffer {:?} without an allocation", buffer),
        }
    }

    fn create_image(&mut self, desc: &ImageDesc<'_>) -> Result<vk::Image> {
        let image_info = vk::ImageCreateInfo::builder()
            .flags(desc.flags)
            .image_type(desc.image_type)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", desc.name))?;

        let allocation = match desc.alias {
            Some(target) => {
                let memory = self
                    .images
                    .get(&target)
                    .and_then(|allocation| allocation.as_ref())
                    .map(|allocation| (unsafe { allocation.memory() }, allocation.offset()));
                let Some((memory, offset)) = memory else {
                    unsafe { self.device.destroy_image(image, None) };
                    bail!("image '{}' aliases an image without its own memory", desc.name);
                };
                if let Err(e) = unsafe { self.device.bind_image_memory(image, memory, offset) } {
                    unsafe { self.device.destroy_image(image, None) };
                    return Err(e).context("Failed to bind aliased image memory");
                }
                None
            }
            None => {
                let requirements = unsafe { self.device.get_image_memory_requirements(image) };
                let allocation = match self.allocator.allocate(&AllocationCreateDesc {
                    name: desc.name,
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                }) {
                    Ok(allocation) => allocation,
                    Err(e) => {
                        unsafe { self.device.destroy_image(image, None) };
                        return Err(e).with_context(|| format!("Failed to allocate memory for image '{}'", desc.name));
                    }
                };
                if let Err(e) = unsafe {
                    self.device
                        .bind_image_memory(image, allocation.memory(), allocation.offset())
                } {
                    unsafe { self.device.destroy_image(image, None) };
                    if let Err(free) = self.allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", free);
                    }
                    return Err(e).context("Failed to bind image memory");
                }
                Some(allocation)
            }
        };

        self.set_name(image, desc.name);
        self.images.insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&mut self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        if let Some(Some(allocation)) = self.images.remove(&image) {
            if let Err(e) = self.allocator.free(allocation) {
                log::error!("Failed to free image memory: {}", e);
            }
        }
    }

    fn create_image_view(&mut self, desc: &ImageViewDesc) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(desc.image)
            .view_type(desc.view_type)
            .format(desc.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(subresource_range(desc.aspect, desc.range));

        unsafe { self.device.create_image_view(&view_info, None) }.context("Failed to create image view")
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_sampler(&mut self, desc: &SamplerDescription) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .min_filter(desc.min_filter)
            .mag_filter(desc.mag_filter)
            .mipmap_mode(desc.mip_filter)
            .address_mode_u(desc.address_u)
            .address_mode_v(desc.address_v)
            .address_mode_w(desc.address_w)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .with_context(|| format!("Failed to create sampler '{}'", desc.name))?;
        self.set_name(sampler, &desc.name);
        Ok(sampler)
    }

    fn destroy_sampler(&mut self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_shader_module(&mut self, code: &[u32]) -> Result<vk::ShaderModule> {
        if code.is_empty() {
            bail!("empty SPIR-V");
        }
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }.context("Failed to create shader module")
    }

    fn destroy_shader_module(&mut self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
        bindless: bool,
    ) -> Result<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect();

        let binding_flags =
            vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND; bindings.len()];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);
        if bindless {
            layout_info = layout_info
                .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                .push_next(&mut flags_info);
        }

        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        if bindless && self.bindless_pool.is_none() {
            let pool_sizes: Vec<_> = bindings
                .iter()
                .map(|binding| vk::DescriptorPoolSize {
                    ty: binding.ty,
                    descriptor_count: binding.count,
                })
                .collect();
            let pool_info = vk::DescriptorPoolCreateInfo::builder()
                .flags(
                    vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND
                        | vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
                )
                .max_sets(1)
                .pool_sizes(&pool_sizes);
            match unsafe { self.device.create_descriptor_pool(&pool_info, None) } {
                Ok(pool) => self.bindless_pool = Some(pool),
                Err(e) => {
                    unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
                    return Err(e).context("Failed to create bindless descriptor pool");
                }
            }
        }

        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: vk::DescriptorSetLayout,
        bindless: bool,
    ) -> Result<vk::DescriptorSet> {
        let pool = match (bindless, self.bindless_pool) {
            (true, Some(pool)) => pool,
            (true, None) => bail!("bindless set requested before a bindless layout was created"),
            (false, _) => self.descriptor_pool,
        };
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&info) }.context("Failed to allocate descriptor set")?;
        let set = sets.first().copied().context("No descriptor set returned")?;
        self.set_pools.insert(set, pool);
        Ok(set)
    }

    fn free_descriptor_set(&mut self, set: vk::DescriptorSet) {
        let Some(pool) = self.set_pools.remove(&set) else {
            log::warn!("Freeing unknown descriptor set {:?}", set);
            return;
        };
        if let Err(e) = unsafe { self.device.free_descriptor_sets(pool, &[set]) } {
            log::error!("Failed to free descriptor set: {}", e);
        }
    }

    fn write_descriptors(&mut self, writes: &[DescriptorWrite]) {
        if writes.is_empty() {
            return;
        }
        // One info per write, kept alive until the update call
        let image_infos: Vec<_> = writes
            .iter()
            .map(|write| match write.info {
                DescriptorWriteInfo::Image { view, sampler, layout } => vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                },
                DescriptorWriteInfo::Buffer { .. } => vk::DescriptorImageInfo::default(),
            })
            .collect();
        let buffer_infos: Vec<_> = writes
            .iter()
            .map(|write| match write.info {
                DescriptorWriteInfo::Buffer { buffer, offset, range } => vk::DescriptorBufferInfo { buffer, offset, range },
                DescriptorWriteInfo::Image { .. } => vk::DescriptorBufferInfo::default(),
            })
            .collect();

        let vk_writes: Vec<_> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let builder = vk::WriteDescriptorSet::builder()
                    .dst_set(write.set)
                    .dst_binding(write.binding)
                    .dst_array_element(write.array_element)
                    .descriptor_type(write.ty);
                match write.info {
                    DescriptorWriteInfo::Image { .. } => builder.image_info(std::slice::from_ref(&image_infos[i])),
                    DescriptorWriteInfo::Buffer { .. } => builder.buffer_info(std::slice::from_ref(&buffer_infos[i])),
                }
                .build()
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_pipeline(&mut self, build: &PipelineBuild<'_>) -> Result<NativePipeline> {
        let native = pipeline::create_pipeline(&self.device, build)?;
        self.set_name(native.pipeline, build.creation.name);
        Ok(native)
    }

    fn destroy_pipeline(&mut self, pipeline: &NativePipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    // --- command pools & queries ---------------------------------------------

    fn create_command_pool(&mut self, queue: QueueKind) -> Result<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(self.info.family(queue));
        unsafe { self.device.create_command_pool(&info, None) }.context("Failed to create command pool")
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.allocate_command_buffers(&info) }.context("Failed to allocate command buffers")
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> Result<()> {
        unsafe { self.device.reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
            .context("Failed to reset command pool")
    }

    fn create_query_pool(&mut self, count: u32) -> Result<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::builder()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(count);
        unsafe { self.device.create_query_pool(&info, None) }.context("Failed to create timestamp query pool")
    }

    fn destroy_query_pool(&mut self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn query_results(
        &mut self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) -> Result<Option<Vec<u64>>> {
        let mut data = vec![0u64; count as usize];
        let result = unsafe {
            self.device
                .get_query_pool_results(pool, first, count, &mut data, vk::QueryResultFlags::TYPE_64)
        };
        match result {
            Ok(()) => Ok(Some(data)),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e).context("Failed to read timestamp queries"),
        }
    }

    // --- recording -----------------------------------------------------------

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &info) }.context("Failed to begin command buffer")
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> Result<()> {
        unsafe { self.device.end_command_buffer(cb) }.context("Failed to end command buffer")
    }

    fn cmd_pipeline_barrier(
        &self,
        cb: vk::CommandBuffer,
        images: &[NativeImageBarrier],
        buffers: &[NativeBufferBarrier],
    ) {
        if images.is_empty() && buffers.is_empty() {
            return;
        }
        let image_barriers: Vec<_> = images
            .iter()
            .map(|b| {
                vk::ImageMemoryBarrier2::builder()
                    .image(b.image)
                    .subresource_range(subresource_range(b.aspect, b.range))
                    .old_layout(b.old_layout)
                    .new_layout(b.new_layout)
                    .src_stage_mask(b.src_stage)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(b.dst_stage)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(b.src_queue_family)
                    .dst_queue_family_index(b.dst_queue_family)
                    .build()
            })
            .collect();
        let buffer_barriers: Vec<_> = buffers
            .iter()
            .map(|b| {
                vk::BufferMemoryBarrier2::builder()
                    .buffer(b.buffer)
                    .offset(b.offset)
                    .size(b.size)
                    .src_stage_mask(b.src_stage)
                    .src_access_mask(b.src_access)
                    .dst_stage_mask(b.dst_stage)
                    .dst_access_mask(b.dst_access)
                    .src_queue_family_index(b.src_queue_family)
                    .dst_queue_family_index(b.dst_queue_family)
                    .build()
            })
            .collect();

        let dependency = vk::DependencyInfo::builder()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cb, &dependency) };
    }

    fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        let attachment = |a: &super::RenderingAttachment| {
            vk::RenderingAttachmentInfo::builder()
                .image_view(a.view)
                .image_layout(a.layout)
                .load_op(a.load_op)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(a.clear)
                .build()
        };
        let colors: Vec<_> = info.colors.iter().map(attachment).collect();
        let depth = info.depth.as_ref().map(attachment);

        let (width, height) = info.extent;
        let mut rendering = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D { width, height },
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }

        unsafe { self.device.cmd_begin_rendering(cb, &rendering) };
    }

    fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(cb) };
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: &NativePipeline) {
        unsafe { self.device.cmd_bind_pipeline(cb, pipeline.bind_point, pipeline.pipeline) };
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        pipeline: &NativePipeline,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, pipeline.bind_point, pipeline.layout, first_set, sets, &[])
        };
    }

    fn cmd_bind_vertex_buffer(
        &self,
        cb: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    ) {
        unsafe { self.device.cmd_bind_vertex_buffers(cb, binding, &[buffer], &[offset]) };
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    ) {
        unsafe { self.device.cmd_bind_index_buffer(cb, buffer, offset, index_type) };
    }

    fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(cb, 0, &[viewport]) };
    }

    fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(cb, 0, &[scissor]) };
    }

    fn cmd_push_constants(&self, cb: vk::CommandBuffer, pipeline: &NativePipeline, data: &[u8]) {
        unsafe {
            self.device
                .cmd_push_constants(cb, pipeline.layout, pipeline.push_constant_stages, 0, data)
        };
    }

    fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertices: u32,
        instances: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe { self.device.cmd_draw(cb, vertices, instances, first_vertex, first_instance) };
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        indices: u32,
        instances: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device
                .cmd_draw_indexed(cb, indices, instances, first_index, vertex_offset, first_instance)
        };
    }

    fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
    }

    fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cb, src, dst, regions) };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(cb, src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, regions)
        };
    }

    fn cmd_reset_query_pool(
        &self,
        cb: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        unsafe { self.device.cmd_reset_query_pool(cb, pool, first, count) };
    }

    fn cmd_write_timestamp(&self, cb: vk::CommandBuffer, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device
                .cmd_write_timestamp2(cb, vk::PipelineStageFlags2::ALL_COMMANDS, pool, query)
        };
    }

    fn cmd_begin_label(&self, cb: vk::CommandBuffer, name: &str) {
        let Some((debug_utils, _)) = &self.debug_utils else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::builder().label_name(&name);
        unsafe { debug_utils.cmd_begin_debug_utils_label(cb, &label) };
    }

    fn cmd_end_label(&self, cb: vk::CommandBuffer) {
        if let Some((debug_utils, _)) = &self.debug_utils {
            unsafe { debug_utils.cmd_end_debug_utils_label(cb) };
        }
    }
}

impl Drop for VulkanGpu {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("Failed to wait for device idle: {}", e);
        }

        if !self.buffers.is_empty() || !self.images.is_empty() {
            log::warn!(
                "{} buffers and {} images still alive at teardown",
                self.buffers.len(),
                self.images.len()
            );
        }
        for (buffer, allocation) in std::mem::take(&mut self.buffers) {
            unsafe { self.device.destroy_buffer(buffer, None) };
            let _ = self.allocator.free(allocation);
        }
        for (image, allocation) in std::mem::take(&mut self.images) {
            unsafe { self.device.destroy_image(image, None) };
            if let Some(allocation) = allocation {
                let _ = self.allocator.free(allocation);
            }
        }

        // Cleanup in reverse order
        unsafe {
            self.swapchain.destroy(&self.device);
            for timeline in self.timelines {
                self.device.destroy_semaphore(timeline, None);
            }
            if let Some(pool) = self.bindless_pool.take() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);

            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);

            self.surface_loader.destroy_surface(self.surface, None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}
