// Device resource lifecycle - creation, queries, deferred destruction
//
// Creation is synchronous and returns a handle. Destruction only enqueues:
// sampled textures first leave the bindless table, everything else goes
// straight to the deletion queue tagged with the current frame slot.

use ash::vk;
use std::ptr::NonNull;

use super::Device;
use crate::backend::{
    BufferDesc, DescriptorWrite, DescriptorWriteInfo, Gpu, ImageDesc, ImageViewDesc, PipelineBuild,
};
use crate::config::PoolConfig;
use crate::deletion_queue::ResourceRef;
use crate::error::{DeviceError, DeviceResult};
use crate::pool::ResourcePool;
use crate::resources::*;

/// One pool per resource kind
pub struct ResourcePools {
    pub buffers: ResourcePool<BufferKind, NativeBuffer, BufferDescription>,
    pub textures: ResourcePool<TextureKind, NativeTexture, TextureDescription>,
    pub samplers: ResourcePool<SamplerKind, vk::Sampler, SamplerDescription>,
    pub pipelines: ResourcePool<PipelineKind, NativePipeline, PipelineDescription>,
    pub shader_states: ResourcePool<ShaderStateKind, NativeShaderState, ShaderStateDescription>,
    pub set_layouts:
        ResourcePool<DescriptorSetLayoutKind, vk::DescriptorSetLayout, DescriptorSetLayoutDescription>,
    pub sets: ResourcePool<DescriptorSetKind, vk::DescriptorSet, DescriptorSetDescription>,
}

impl ResourcePools {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            buffers: ResourcePool::new(config.buffers),
            textures: ResourcePool::new(config.textures),
            samplers: ResourcePool::new(config.samplers),
            pipelines: ResourcePool::new(config.pipelines),
            shader_states: ResourcePool::new(config.shader_states),
            set_layouts: ResourcePool::new(config.descriptor_set_layouts),
            sets: ResourcePool::new(config.descriptor_sets),
        }
    }

    pub fn is_valid(&self, resource: ResourceRef) -> bool {
        match resource {
            ResourceRef::Buffer(h) => self.buffers.is_valid(h),
            ResourceRef::Texture(h) => self.textures.is_valid(h),
            ResourceRef::Sampler(h) => self.samplers.is_valid(h),
            ResourceRef::Pipeline(h) => self.pipelines.is_valid(h),
            ResourceRef::ShaderState(h) => self.shader_states.is_valid(h),
            ResourceRef::DescriptorSetLayout(h) => self.set_layouts.is_valid(h),
            ResourceRef::DescriptorSet(h) => self.sets.is_valid(h),
        }
    }

    /// Every live resource, in an order safe for immediate destruction
    pub(crate) fn live_resources(&self) -> Vec<ResourceRef> {
        let mut all = Vec::new();
        all.extend(self.sets.live_handles().into_iter().map(ResourceRef::DescriptorSet));
        all.extend(self.pipelines.live_handles().into_iter().map(ResourceRef::Pipeline));
        all.extend(self.shader_states.live_handles().into_iter().map(ResourceRef::ShaderState));
        all.extend(
            self.set_layouts
                .live_handles()
                .into_iter()
                .map(ResourceRef::DescriptorSetLayout),
        );

        let (views, textures): (Vec<_>, Vec<_>) = self
            .textures
            .live_handles()
            .into_iter()
            .partition(|&h| self.textures.get_cold(h).parent_texture.is_some());
        all.extend(views.into_iter().map(ResourceRef::Texture));
        all.extend(textures.into_iter().map(ResourceRef::Texture));

        all.extend(self.samplers.live_handles().into_iter().map(ResourceRef::Sampler));
        all.extend(self.buffers.live_handles().into_iter().map(ResourceRef::Buffer));
        all
    }
}

fn pool_exhausted(kind: &str) -> ! {
    log::error!("{} pool exhausted", kind);
    panic!("{} pool exhausted", kind);
}

/// Run the native destructor for one resource and release its slot
pub(crate) fn free_resource(gpu: &mut dyn Gpu, pools: &mut ResourcePools, resource: ResourceRef) {
    log::debug!("Destroying {} {:?}", resource.kind_name(), resource);
    match resource {
        ResourceRef::Buffer(h) => {
            let (hot, _) = pools.buffers.destroy(h);
            if hot.buffer != vk::Buffer::null() {
                gpu.destroy_buffer(hot.buffer);
            }
        }
        ResourceRef::Texture(h) => {
            let (hot, cold) = pools.textures.destroy(h);
            if cold.swapchain {
                return;
            }
            gpu.destroy_image_view(hot.view);
            if cold.parent_texture.is_none() {
                gpu.destroy_image(hot.image);
            }
        }
        ResourceRef::Sampler(h) => {
            let (sampler, _) = pools.samplers.destroy(h);
            gpu.destroy_sampler(sampler);
        }
        ResourceRef::Pipeline(h) => {
            let (native, cold) = pools.pipelines.destroy(h);
            gpu.destroy_pipeline(&native);
            if pools.shader_states.is_valid(cold.shader_state) {
                free_resource(gpu, pools, ResourceRef::ShaderState(cold.shader_state));
            }
        }
        ResourceRef::ShaderState(h) => {
            let (native, _) = pools.shader_states.destroy(h);
            for (_, module) in native.modules {
                gpu.destroy_shader_module(module);
            }
        }
        ResourceRef::DescriptorSetLayout(h) => {
            let (layout, _) = pools.set_layouts.destroy(h);
            gpu.destroy_descriptor_set_layout(layout);
        }
        ResourceRef::DescriptorSet(h) => {
            let (set, _) = pools.sets.destroy(h);
            gpu.free_descriptor_set(set);
        }
    }
}

/// Sub-allocation handed out by `Device::dynamic_buffer_allocate`
pub struct DynamicAllocation<'a> {
    pub data: &'a mut [u8],
    /// Offset inside the dynamic ring buffer
    pub offset: u64,
}

impl Device {
    // --- buffers -------------------------------------------------------------

    pub fn create_buffer(&mut self, creation: &BufferCreation<'_>) -> DeviceResult<BufferHandle> {
        let mut cold = BufferDescription {
            name: creation.name.to_owned(),
            size: creation.size,
            usage: creation.usage,
            residency: creation.residency,
            ..Default::default()
        };

        let hot = match creation.residency {
            ResourceUsage::Dynamic => {
                cold.parent_buffer = Some(self.dynamic.buffer);
                NativeBuffer::default()
            }
            ResourceUsage::Stream | ResourceUsage::Immutable => {
                let host_visible = creation.residency == ResourceUsage::Stream;
                let mut usage = creation.usage;
                if !host_visible {
                    usage |= vk::BufferUsageFlags::TRANSFER_DST;
                }
                let (buffer, mapped) = self.gpu.create_buffer(&BufferDesc {
                    name: creation.name,
                    size: creation.size,
                    usage,
                    host_visible,
                })?;
                NativeBuffer { buffer, mapped }
            }
        };

        let handle = self
            .pools
            .buffers
            .insert(hot, cold)
            .unwrap_or_else(|| pool_exhausted("Buffer"));

        if let Some(data) = creation.initial_data {
            match creation.residency {
                ResourceUsage::Stream => {
                    if let Some(mapped) = self.map_buffer(handle, 0, data.len() as u64) {
                        mapped.copy_from_slice(data);
                    }
                }
                ResourceUsage::Immutable => self.queue_buffer_upload(handle, data.to_vec()),
                ResourceUsage::Dynamic => {
                    log::warn!("Initial data ignored for dynamic buffer '{}'", creation.name);
                }
            }
        }

        log::debug!(
            "Created buffer '{}' {:?} ({} bytes, {:?})",
            creation.name,
            handle,
            creation.size,
            creation.residency
        );
        Ok(handle)
    }

    pub fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.enqueue_destroy(ResourceRef::Buffer(buffer));
    }

    /// CPU view of a buffer's memory.
    ///
    /// Stream buffers return their persistent mapping (`size == 0` maps to
    /// the end); dynamic buffers get a fresh slice of this frame's ring.
    /// Device-local buffers cannot be mapped.
    pub fn map_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> Option<&mut [u8]> {
        let (residency, total, parent) = {
            let cold = self.pools.buffers.get_cold(buffer);
            (cold.residency, cold.size, cold.parent_buffer)
        };

        match residency {
            ResourceUsage::Immutable => {
                log::warn!("Buffer {:?} is device local and cannot be mapped", buffer);
                None
            }
            ResourceUsage::Dynamic => {
                let alignment = self.gpu.info().min_uniform_alignment.max(16);
                let size = if size == 0 { total } else { size };
                let global = self.dynamic.ring.allocate(size, alignment).unwrap_or_else(|| {
                    log::error!("Dynamic ring exhausted mapping {} bytes", size);
                    panic!("Dynamic ring exhausted mapping {} bytes", size);
                });
                self.pools.buffers.get_cold_mut(buffer).global_offset = global;
                let ring = parent?;
                let base = self.pools.buffers.get_hot(ring).mapped?;
                Some(host_slice(base, global, size))
            }
            ResourceUsage::Stream => {
                let size = if size == 0 { total.saturating_sub(offset) } else { size };
                ensure_contract!(
                    offset + size <= total,
                    "mapping {}..{} of a {} byte buffer",
                    offset,
                    offset + size,
                    total
                );
                let base = self.pools.buffers.get_hot(buffer).mapped?;
                Some(host_slice(base, offset, size))
            }
        }
    }

    /// Mappings are persistent; this only documents the end of a CPU write
    pub fn unmap_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("Unmapped {:?}", buffer);
    }

    pub fn dynamic_buffer_allocate(&mut self, size: u64, alignment: u64) -> DynamicAllocation<'_> {
        let offset = self.dynamic.ring.allocate(size, alignment.max(1)).unwrap_or_else(|| {
            log::error!("Dynamic ring exhausted allocating {} bytes", size);
            panic!("Dynamic ring exhausted allocating {} bytes", size);
        });
        let Some(base) = self.pools.buffers.get_hot(self.dynamic.buffer).mapped else {
            log::error!("Dynamic ring is not host visible");
            panic!("Dynamic ring is not host visible");
        };
        DynamicAllocation {
            data: host_slice(base, offset, size),
            offset,
        }
    }

    /// The ring buffer backing every dynamic allocation
    pub fn dynamic_buffer(&self) -> BufferHandle {
        self.dynamic.buffer
    }

    // --- textures ------------------------------------------------------------

    pub fn create_texture(
        &mut self,
        creation: &TextureCreation<'_>,
    ) -> DeviceResult<TextureHandle> {
        let alias_image = creation.alias.map(|alias| self.pools.textures.get_hot(alias).image);
        let flags = if creation.texture_type == TextureType::TextureCube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image = self.gpu.create_image(&ImageDesc {
            name: creation.name,
            image_type: creation.texture_type.image_type(),
            format: creation.format,
            extent: vk::Extent3D {
                width: creation.width,
                height: creation.height,
                depth: creation.depth.max(1),
            },
            mip_levels: creation.mip_levels.max(1),
            array_layers: creation.array_layers.max(1),
            usage: creation.image_usage(),
            flags,
            alias: alias_image,
        })?;

        let range = SubresourceRange {
            base_mip: 0,
            mip_count: creation.mip_levels.max(1),
            base_layer: 0,
            layer_count: creation.array_layers.max(1),
        };
        let view = match self.gpu.create_image_view(&ImageViewDesc {
            image,
            view_type: creation.texture_type.view_type(),
            format: creation.format,
            aspect: aspect_for_format(creation.format),
            range,
        }) {
            Ok(view) => view,
            Err(e) => {
                self.gpu.destroy_image(image);
                return Err(e.into());
            }
        };

        let cold = TextureDescription {
            name: creation.name.to_owned(),
            width: creation.width,
            height: creation.height,
            depth: creation.depth.max(1),
            mip_levels: range.mip_count,
            array_layers: range.layer_count,
            format: creation.format,
            texture_type: creation.texture_type,
            flags: creation.flags,
            range,
            sampler: creation.sampler,
            alias_texture: creation.alias,
            ..Default::default()
        };
        let handle = self
            .pools
            .textures
            .insert(NativeTexture { image, view }, cold)
            .unwrap_or_else(|| pool_exhausted("Texture"));

        // Textures with pixel data join the table once their upload landed
        match creation.initial_data {
            Some(data) => self.queue_texture_upload(handle, data.to_vec()),
            None => self.register_bindless(handle),
        }

        log::debug!(
            "Created texture '{}' {:?} ({}x{} {:?})",
            creation.name,
            handle,
            creation.width,
            creation.height,
            creation.format
        );
        Ok(handle)
    }

    pub fn create_texture_view(
        &mut self,
        creation: &TextureViewCreation<'_>,
    ) -> DeviceResult<TextureHandle> {
        let parent_image = self.pools.textures.get_hot(creation.parent).image;
        let parent = self.pools.textures.get_cold(creation.parent).clone();
        ensure_contract!(
            creation.range.base_mip + creation.range.mip_count <= parent.mip_levels
                && creation.range.base_layer + creation.range.layer_count <= parent.array_layers,
            "view '{}' exceeds the subresources of '{}'",
            creation.name,
            parent.name
        );

        let view = self.gpu.create_image_view(&ImageViewDesc {
            image: parent_image,
            view_type: creation.texture_type.view_type(),
            format: parent.format,
            aspect: parent.aspect(),
            range: creation.range,
        })?;

        let cold = TextureDescription {
            name: creation.name.to_owned(),
            texture_type: creation.texture_type,
            range: creation.range,
            parent_texture: Some(creation.parent),
            alias_texture: None,
            bindless: false,
            swapchain: false,
            ..parent
        };
        let handle = self
            .pools
            .textures
            .insert(
                NativeTexture {
                    image: parent_image,
                    view,
                },
                cold,
            )
            .unwrap_or_else(|| pool_exhausted("Texture"));
        self.register_bindless(handle);

        log::debug!("Created texture view '{}' {:?} of {:?}", creation.name, handle, creation.parent);
        Ok(handle)
    }

    /// Queue the first bindless write for a sampled texture
    pub(crate) fn register_bindless(&mut self, texture: TextureHandle) {
        let cold = self.pools.textures.get_cold_mut(texture);
        if !cold.flags.contains(TextureFlags::SAMPLED) || cold.bindless {
            return;
        }
        cold.bindless = true;
        self.bindless.queue(texture, self.frame.absolute, false);
    }

    pub fn destroy_texture(&mut self, texture: TextureHandle) {
        ensure_contract!(
            self.pools.textures.is_valid(texture),
            "destroying stale texture handle {:?}",
            texture
        );
        let cold = self.pools.textures.get_cold(texture);
        ensure_contract!(!cold.swapchain, "swapchain texture '{}' cannot be destroyed", cold.name);

        if cold.bindless {
            ensure_contract!(
                !self.bindless.is_pending_delete(texture),
                "texture {:?} destroyed twice",
                texture
            );
            log::debug!("Texture '{}' {:?} leaves the bindless table", cold.name, texture);
            self.bindless.queue(texture, self.frame.absolute, true);
        } else {
            self.enqueue_destroy(ResourceRef::Texture(texture));
        }
    }

    // --- samplers ------------------------------------------------------------

    pub fn create_sampler(
        &mut self,
        creation: &SamplerCreation<'_>,
    ) -> DeviceResult<SamplerHandle> {
        let cold = SamplerDescription {
            name: creation.name.to_owned(),
            min_filter: creation.min_filter,
            mag_filter: creation.mag_filter,
            mip_filter: creation.mip_filter,
            address_u: creation.address_u,
            address_v: creation.address_v,
            address_w: creation.address_w,
        };
        let sampler = self.gpu.create_sampler(&cold)?;
        let handle = self
            .pools
            .samplers
            .insert(sampler, cold)
            .unwrap_or_else(|| pool_exhausted("Sampler"));
        log::debug!("Created sampler '{}' {:?}", creation.name, handle);
        Ok(handle)
    }

    pub fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.enqueue_destroy(ResourceRef::Sampler(sampler));
    }

    // --- shaders & pipelines -------------------------------------------------

    /// Compile (if needed) and load every stage. A stage that yields no
    /// SPIR-V fails the whole state and releases the modules made so far.
    pub fn create_shader_state(
        &mut self,
        creation: &ShaderStateCreation<'_>,
    ) -> DeviceResult<ShaderStateHandle> {
        let mut modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)> =
            Vec::with_capacity(creation.stages.len());

        let release = |gpu: &mut dyn Gpu, modules: &[(vk::ShaderStageFlags, vk::ShaderModule)]| {
            for &(_, module) in modules {
                gpu.destroy_shader_module(module);
            }
        };

        if creation.stages.is_empty() {
            log::warn!("Shader state '{}' has no stages", creation.name);
            return Err(DeviceError::ShaderCompilation {
                name: creation.name.to_owned(),
            });
        }

        for stage in &creation.stages {
            let words = match &stage.code {
                ShaderCode::Spirv(words) => words.clone(),
                ShaderCode::Glsl { source, options } => match &self.compiler {
                    Some(compiler) => compiler.compile(stage.stage, source, options),
                    None => {
                        log::warn!("No shader compiler configured for '{}'", creation.name);
                        Vec::new()
                    }
                },
            };

            if words.is_empty() {
                log::warn!("Shader state '{}' stage {:?} produced no SPIR-V", creation.name, stage.stage);
                release(self.gpu.as_mut(), &modules);
                return Err(DeviceError::ShaderCompilation {
                    name: creation.name.to_owned(),
                });
            }

            match self.gpu.create_shader_module(&words) {
                Ok(module) => modules.push((stage.stage, module)),
                Err(e) => {
                    release(self.gpu.as_mut(), &modules);
                    return Err(e.into());
                }
            }
        }

        let graphics = !modules
            .iter()
            .any(|(stage, _)| *stage == vk::ShaderStageFlags::COMPUTE);
        let handle = self
            .pools
            .shader_states
            .insert(
                NativeShaderState { modules },
                ShaderStateDescription {
                    name: creation.name.to_owned(),
                    graphics,
                },
            )
            .unwrap_or_else(|| pool_exhausted("ShaderState"));
        log::debug!("Created shader state '{}' {:?}", creation.name, handle);
        Ok(handle)
    }

    pub fn destroy_shader_state(&mut self, shader_state: ShaderStateHandle) {
        self.enqueue_destroy(ResourceRef::ShaderState(shader_state));
    }

    /// The pipeline owns its shader state; both go away together.
    pub fn create_pipeline(
        &mut self,
        creation: &PipelineCreation<'_>,
    ) -> DeviceResult<PipelineHandle> {
        let shader_state = self.create_shader_state(&creation.shaders)?;
        let modules = self.pools.shader_states.get_hot(shader_state).modules.clone();

        let mut set_layouts = Vec::with_capacity(creation.set_layouts.len() + 1);
        set_layouts.push(self.bindless.layout());
        set_layouts.extend(
            creation
                .set_layouts
                .iter()
                .map(|&layout| *self.pools.set_layouts.get_hot(layout)),
        );

        let native = match self.gpu.create_pipeline(&PipelineBuild {
            creation,
            modules: &modules,
            set_layouts: &set_layouts,
        }) {
            Ok(native) => native,
            Err(e) => {
                let state = ResourceRef::ShaderState(shader_state);
                free_resource(self.gpu.as_mut(), &mut self.pools, state);
                return Err(e.into());
            }
        };

        let handle = self
            .pools
            .pipelines
            .insert(
                native,
                PipelineDescription {
                    name: creation.name.to_owned(),
                    shader_state,
                    set_layouts: creation.set_layouts.clone(),
                    graphics: native.bind_point == vk::PipelineBindPoint::GRAPHICS,
                },
            )
            .unwrap_or_else(|| pool_exhausted("Pipeline"));
        log::debug!("Created pipeline '{}' {:?}", creation.name, handle);
        Ok(handle)
    }

    pub fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.enqueue_destroy(ResourceRef::Pipeline(pipeline));
    }

    // --- descriptors ---------------------------------------------------------

    pub fn create_descriptor_set_layout(
        &mut self,
        creation: &DescriptorSetLayoutCreation<'_>,
    ) -> DeviceResult<DescriptorSetLayoutHandle> {
        let layout = self.gpu.create_descriptor_set_layout(&creation.bindings, false)?;
        let handle = self
            .pools
            .set_layouts
            .insert(
                layout,
                DescriptorSetLayoutDescription {
                    name: creation.name.to_owned(),
                    bindings: creation.bindings.clone(),
                },
            )
            .unwrap_or_else(|| pool_exhausted("DescriptorSetLayout"));
        log::debug!("Created descriptor set layout '{}' {:?}", creation.name, handle);
        Ok(handle)
    }

    pub fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        self.enqueue_destroy(ResourceRef::DescriptorSetLayout(layout));
    }

    pub fn create_descriptor_set(
        &mut self,
        creation: &DescriptorSetCreation<'_>,
    ) -> DeviceResult<DescriptorSetHandle> {
        let layout = *self.pools.set_layouts.get_hot(creation.layout);
        let bindings = self.pools.set_layouts.get_cold(creation.layout).bindings.clone();
        let set = self.gpu.allocate_descriptor_set(layout, false)?;

        let default_sampler = *self.pools.samplers.get_hot(self.default_sampler);
        let writes: Vec<DescriptorWrite> = creation
            .resources
            .iter()
            .map(|&(binding, resource)| {
                let ty = bindings
                    .iter()
                    .find(|b| b.binding == binding)
                    .map(|b| b.ty)
                    .unwrap_or_else(|| {
                        log::error!("Binding {} missing from layout of '{}'", binding, creation.name);
                        panic!("Binding {} missing from layout of '{}'", binding, creation.name);
                    });
                let info = match resource {
                    DescriptorResource::Buffer(buffer) => {
                        let cold = self.pools.buffers.get_cold(buffer);
                        let (native, offset) = match cold.parent_buffer {
                            Some(ring) => (self.pools.buffers.get_hot(ring).buffer, cold.global_offset),
                            None => (self.pools.buffers.get_hot(buffer).buffer, 0),
                        };
                        DescriptorWriteInfo::Buffer {
                            buffer: native,
                            offset,
                            range: cold.size,
                        }
                    }
                    DescriptorResource::Texture { texture, sampler } => DescriptorWriteInfo::Image {
                        view: self.pools.textures.get_hot(texture).view,
                        sampler: sampler
                            .or(self.pools.textures.get_cold(texture).sampler)
                            .map(|s| *self.pools.samplers.get_hot(s))
                            .unwrap_or(default_sampler),
                        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    },
                    DescriptorResource::StorageTexture(texture) => DescriptorWriteInfo::Image {
                        view: self.pools.textures.get_hot(texture).view,
                        sampler: vk::Sampler::null(),
                        layout: vk::ImageLayout::GENERAL,
                    },
                };
                DescriptorWrite {
                    set,
                    binding,
                    array_element: 0,
                    ty,
                    info,
                }
            })
            .collect();
        self.gpu.write_descriptors(&writes);

        let handle = self
            .pools
            .sets
            .insert(
                set,
                DescriptorSetDescription {
                    name: creation.name.to_owned(),
                    layout: creation.layout,
                    resources: creation.resources.clone(),
                },
            )
            .unwrap_or_else(|| pool_exhausted("DescriptorSet"));
        log::debug!("Created descriptor set '{}' {:?}", creation.name, handle);
        Ok(handle)
    }

    pub fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.enqueue_destroy(ResourceRef::DescriptorSet(set));
    }

    // --- queries -------------------------------------------------------------

    pub fn query_buffer(&self, buffer: BufferHandle) -> &BufferDescription {
        self.pools.buffers.get_cold(buffer)
    }

    pub fn query_texture(&self, texture: TextureHandle) -> &TextureDescription {
        self.pools.textures.get_cold(texture)
    }

    pub fn query_sampler(&self, sampler: SamplerHandle) -> &SamplerDescription {
        self.pools.samplers.get_cold(sampler)
    }

    pub fn query_pipeline(&self, pipeline: PipelineHandle) -> &PipelineDescription {
        self.pools.pipelines.get_cold(pipeline)
    }

    pub fn query_shader_state(&self, shader_state: ShaderStateHandle) -> &ShaderStateDescription {
        self.pools.shader_states.get_cold(shader_state)
    }

    pub fn query_descriptor_set_layout(
        &self,
        layout: DescriptorSetLayoutHandle,
    ) -> &DescriptorSetLayoutDescription {
        self.pools.set_layouts.get_cold(layout)
    }

    pub fn query_descriptor_set(&self, set: DescriptorSetHandle) -> &DescriptorSetDescription {
        self.pools.sets.get_cold(set)
    }

    pub fn texture_state(&self, texture: TextureHandle) -> ResourceState {
        self.pools.textures.get_cold(texture).state
    }

    pub fn buffer_state(&self, buffer: BufferHandle) -> ResourceState {
        self.pools.buffers.get_cold(buffer).state
    }

    /// Array element of the texture in the bindless table.
    ///
    /// # Panics
    /// When the texture is not sampled: it never enters the table and its
    /// element would resolve to the dummy.
    pub fn bindless_index(&self, texture: TextureHandle) -> u32 {
        let cold = self.pools.textures.get_cold(texture);
        ensure_contract!(
            cold.flags.contains(TextureFlags::SAMPLED),
            "texture '{}' is not sampled and has no bindless element",
            cold.name
        );
        texture.index()
    }

    pub fn is_valid(&self, resource: ResourceRef) -> bool {
        self.pools.is_valid(resource)
    }

    // --- deferred destruction ------------------------------------------------

    pub(crate) fn enqueue_destroy(&mut self, resource: ResourceRef) {
        ensure_contract!(
            self.pools.is_valid(resource),
            "destroying stale {} handle {:?}",
            resource.kind_name(),
            resource
        );
        ensure_contract!(
            !self.deletion_queue.contains(resource),
            "{} {:?} destroyed twice",
            resource.kind_name(),
            resource
        );
        self.deletion_queue.push(resource, self.frame.absolute);
    }

    /// Free every request whose frame has retired. Frame `f` signals graphics
    /// value `f + 1` after waiting on its compute and transfer work, so the
    /// completed graphics value is the number of retired frames.
    pub(crate) fn sweep_deletions(&mut self) {
        if self.deletion_queue.is_empty() {
            return;
        }
        let retired = match self.gpu.completed_value(QueueKind::Graphics) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Reading graphics timeline failed, deletions postponed: {:#}", e);
                return;
            }
        };
        let gpu = self.gpu.as_mut();
        let pools = &mut self.pools;
        let freed = self.deletion_queue.sweep(retired, |resource| {
            // A pipeline may already have taken its shader state with it
            if pools.is_valid(resource) {
                free_resource(gpu, pools, resource);
            }
        });
        if freed > 0 {
            log::trace!("Freed {} resources requested before frame {}", freed, retired);
        }
    }
}

/// Slice over persistently mapped memory
fn host_slice<'a>(base: NonNull<u8>, offset: u64, size: u64) -> &'a mut [u8] {
    // SAFETY: `base` is the start of a live persistent mapping at least
    // `offset + size` bytes long; callers bound-check against the buffer size
    // and hand the slice out under a `&mut Device` borrow.
    unsafe { std::slice::from_raw_parts_mut(base.as_ptr().add(offset as usize), size as usize) }
}
