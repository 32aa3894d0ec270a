// Uploads - per-frame staging ring and transfer queue submission
//
// `create_*` with initial data and `upload_*_data` only queue a request. At
// the start of every frame the queue is drained into the slot's staging
// slice, recorded on the transfer queue and submitted with a timeline
// signal. When transfer and graphics use different families each resource
// is released on the transfer queue and acquired again at the top of the
// frame's graphics submission.

use ash::vk;
use std::collections::VecDeque;

use super::Device;
use crate::backend::{NativeBufferBarrier, NativeImageBarrier, TimelineWait};
use crate::command_buffer::CommandEncoder;
use crate::deletion_queue::ResourceRef;
use crate::error::DeviceResult;
use crate::resources::*;

/// Bump allocator over one slice per frame slot of a host-visible buffer
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameRing {
    per_frame: u64,
    frame_base: u64,
    cursor: u64,
}

impl FrameRing {
    pub(crate) fn new(per_frame: u64) -> Self {
        Self {
            per_frame,
            frame_base: 0,
            cursor: 0,
        }
    }

    pub(crate) fn per_frame(&self) -> u64 {
        self.per_frame
    }

    pub(crate) fn begin_frame(&mut self, slot: u32) {
        self.frame_base = self.per_frame * slot as u64;
        self.cursor = 0;
    }

    /// Offset inside the whole buffer, `None` when the slice is full
    pub(crate) fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let start = align_up(self.cursor, alignment);
        if start + size > self.per_frame {
            return None;
        }
        self.cursor = start + size;
        Some(self.frame_base + start)
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Host-visible buffer split into per-frame rings
pub(crate) struct HostRing {
    pub buffer: BufferHandle,
    pub ring: FrameRing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UploadTarget {
    Texture(TextureHandle),
    Buffer(BufferHandle),
}

pub(crate) struct UploadRequest {
    pub target: UploadTarget,
    pub data: Vec<u8>,
}

pub(crate) struct UploadState {
    pub staging: HostRing,
    pub pending: VecDeque<UploadRequest>,
    /// Released by the transfer queue this frame, acquired in `present`
    pub acquires: Vec<UploadTarget>,
}

impl UploadState {
    pub(crate) fn new(staging: HostRing) -> Self {
        Self {
            staging,
            pending: VecDeque::new(),
            acquires: Vec::new(),
        }
    }
}

// Final state of a buffer after its upload, picked from its usage
fn buffer_read_state(usage: vk::BufferUsageFlags) -> ResourceState {
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) {
        ResourceState::IndexBuffer
    } else if usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER) {
        ResourceState::VertexBuffer
    } else if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
        ResourceState::UniformBuffer
    } else if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) {
        ResourceState::IndirectArgument
    } else {
        ResourceState::ShaderResource
    }
}

fn release_image(
    image: vk::Image,
    cold: &TextureDescription,
    ownership_transfer: bool,
    transfer_family: u32,
    graphics_family: u32,
) -> NativeImageBarrier {
    let read = ResourceState::ShaderResource;
    NativeImageBarrier {
        image,
        aspect: cold.aspect(),
        range: cold.range,
        old_layout: ResourceState::CopyDest.image_layout(),
        new_layout: read.image_layout(),
        src_stage: vk::PipelineStageFlags2::ALL_TRANSFER,
        src_access: vk::AccessFlags2::TRANSFER_WRITE,
        // The acquire on the graphics queue provides the destination scope
        dst_stage: if ownership_transfer {
            vk::PipelineStageFlags2::NONE
        } else {
            read.stage_mask(QueueKind::Graphics)
        },
        dst_access: if ownership_transfer {
            vk::AccessFlags2::NONE
        } else {
            read.access_mask()
        },
        src_queue_family: if ownership_transfer { transfer_family } else { vk::QUEUE_FAMILY_IGNORED },
        dst_queue_family: if ownership_transfer { graphics_family } else { vk::QUEUE_FAMILY_IGNORED },
    }
}

impl Device {
    /// Replace the contents of mip 0 (all layers) of a texture.
    /// The data lands at the start of the next frame.
    pub fn upload_texture_data(&mut self, texture: TextureHandle, data: &[u8]) {
        let cold = self.pools.textures.get_cold(texture);
        if let Some(texel) = texel_size(cold.format) {
            let expected = texel * (cold.width * cold.height * cold.depth * cold.array_layers) as u64;
            ensure_contract!(
                data.len() as u64 == expected,
                "texture '{}' upload is {} bytes, expected {}",
                cold.name,
                data.len(),
                expected
            );
        }
        self.queue_texture_upload(texture, data.to_vec());
    }

    /// Replace the start of a device-local buffer
    pub fn upload_buffer_data(&mut self, buffer: BufferHandle, data: &[u8]) {
        let cold = self.pools.buffers.get_cold(buffer);
        ensure_contract!(
            data.len() as u64 <= cold.size,
            "buffer '{}' upload of {} bytes exceeds its size {}",
            cold.name,
            data.len(),
            cold.size
        );
        ensure_contract!(
            cold.residency == ResourceUsage::Immutable,
            "buffer '{}' is host visible, map it instead",
            cold.name
        );
        self.queue_buffer_upload(buffer, data.to_vec());
    }

    /// Requests still waiting for staging space
    pub fn pending_uploads(&self) -> usize {
        self.uploads.pending.len()
    }

    pub(crate) fn queue_texture_upload(&mut self, texture: TextureHandle, data: Vec<u8>) {
        self.uploads.pending.push_back(UploadRequest {
            target: UploadTarget::Texture(texture),
            data,
        });
    }

    pub(crate) fn queue_buffer_upload(&mut self, buffer: BufferHandle, data: Vec<u8>) {
        self.uploads.pending.push_back(UploadRequest {
            target: UploadTarget::Buffer(buffer),
            data,
        });
    }

    fn upload_target_alive(&self, target: UploadTarget) -> bool {
        match target {
            UploadTarget::Texture(t) => {
                self.pools.textures.is_valid(t)
                    && !self.deletion_queue.contains(ResourceRef::Texture(t))
                    && !self.bindless.is_pending_delete(t)
            }
            UploadTarget::Buffer(b) => {
                self.pools.buffers.is_valid(b) && !self.deletion_queue.contains(ResourceRef::Buffer(b))
            }
        }
    }

    /// Copy queued requests into this frame's staging slice and submit them
    /// on the transfer queue. Requests that do not fit wait for a later frame.
    pub(crate) fn flush_uploads(&mut self) -> DeviceResult<()> {
        if self.uploads.pending.is_empty() {
            return Ok(());
        }

        let staging_buffer = self.uploads.staging.buffer;
        let Some(staging_base) = self.pools.buffers.get_hot(staging_buffer).mapped else {
            log::error!("Staging buffer is not host visible");
            return Ok(());
        };
        let staging_native = self.pools.buffers.get_hot(staging_buffer).buffer;

        // Place as many requests as fit
        let mut batch: Vec<(UploadRequest, u64)> = Vec::new();
        while let Some(request) = self.uploads.pending.pop_front() {
            if !self.upload_target_alive(request.target) {
                log::debug!("Dropping upload for destroyed {:?}", request.target);
                continue;
            }
            let size = request.data.len() as u64;
            if size > self.uploads.staging.ring.per_frame() {
                log::error!(
                    "Upload of {} bytes for {:?} exceeds the staging slice ({} bytes), dropped",
                    size,
                    request.target,
                    self.uploads.staging.ring.per_frame()
                );
                continue;
            }
            let Some(offset) = self.uploads.staging.ring.allocate(size, 16) else {
                self.uploads.pending.push_front(request);
                break;
            };
            // SAFETY: the staging mapping covers every frame slice and this
            // slot's slice is not read by the GPU any more.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    request.data.as_ptr(),
                    staging_base.as_ptr().add(offset as usize),
                    request.data.len(),
                );
            }
            batch.push((request, offset));
        }

        if batch.is_empty() {
            return Ok(());
        }

        let transfer_family = self.gpu.info().family(QueueKind::Transfer);
        let graphics_family = self.gpu.info().family(QueueKind::Graphics);
        let ownership_transfer = transfer_family != graphics_family;

        let id = self.internal_command_buffer(QueueKind::Transfer)?;

        let mut before = Vec::new();
        let mut after_images = Vec::new();
        let mut after_buffers = Vec::new();
        let mut registrations = Vec::new();

        for (request, _) in &batch {
            if let UploadTarget::Texture(texture) = request.target {
                let (hot, cold) = self.pools.textures.get_mut(texture);
                before.push(NativeImageBarrier {
                    image: hot.image,
                    aspect: cold.aspect(),
                    range: cold.range,
                    old_layout: vk::ImageLayout::UNDEFINED,
                    new_layout: ResourceState::CopyDest.image_layout(),
                    src_stage: vk::PipelineStageFlags2::NONE,
                    src_access: vk::AccessFlags2::NONE,
                    dst_stage: vk::PipelineStageFlags2::ALL_TRANSFER,
                    dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                    src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                });
                after_images.push(release_image(
                    hot.image,
                    cold,
                    ownership_transfer,
                    transfer_family,
                    graphics_family,
                ));
                cold.state = ResourceState::ShaderResource;
                cold.queue_owner = if ownership_transfer {
                    QueueKind::Transfer
                } else {
                    QueueKind::Graphics
                };
            }
        }

        for (request, _) in &batch {
            if let UploadTarget::Buffer(buffer) = request.target {
                let (hot, cold) = self.pools.buffers.get_mut(buffer);
                let target = buffer_read_state(cold.usage);
                after_buffers.push(NativeBufferBarrier {
                    buffer: hot.buffer,
                    offset: 0,
                    size: vk::WHOLE_SIZE,
                    src_stage: vk::PipelineStageFlags2::ALL_TRANSFER,
                    src_access: vk::AccessFlags2::TRANSFER_WRITE,
                    dst_stage: if ownership_transfer {
                        vk::PipelineStageFlags2::NONE
                    } else {
                        target.stage_mask(QueueKind::Graphics)
                    },
                    dst_access: if ownership_transfer {
                        vk::AccessFlags2::NONE
                    } else {
                        target.access_mask()
                    },
                    src_queue_family: if ownership_transfer { transfer_family } else { vk::QUEUE_FAMILY_IGNORED },
                    dst_queue_family: if ownership_transfer { graphics_family } else { vk::QUEUE_FAMILY_IGNORED },
                });
                cold.state = target;
                cold.queue_owner = if ownership_transfer {
                    QueueKind::Transfer
                } else {
                    QueueKind::Graphics
                };
            }
        }

        {
            let mut encoder = self.encoder(id);
            encoder.push_marker("uploads");
            encoder.raw_barrier(&before, &[]);
            for (request, offset) in &batch {
                match request.target {
                    UploadTarget::Texture(texture) => encoder.copy_to_texture(staging_native, *offset, texture),
                    UploadTarget::Buffer(buffer) => {
                        encoder.copy_to_buffer(staging_native, *offset, buffer, request.data.len() as u64)
                    }
                }
            }
            encoder.raw_barrier(&after_images, &after_buffers);
            encoder.pop_marker();
            encoder.finish()?;
        }

        for (request, _) in &batch {
            if ownership_transfer {
                self.uploads.acquires.push(request.target);
            } else if let UploadTarget::Texture(texture) = request.target {
                registrations.push(texture);
            }
        }
        for texture in registrations {
            self.register_bindless(texture);
        }

        self.submit_queue(QueueKind::Transfer, id, &[])?;
        log::debug!("Uploaded {} resources in frame {}", batch.len(), self.frame.absolute);
        Ok(())
    }

    /// Acquire everything the transfer queue released this frame. Recorded on
    /// a graphics buffer that runs first in the frame's graphics submission.
    pub(crate) fn record_upload_acquires(&mut self) -> DeviceResult<()> {
        if self.uploads.acquires.is_empty() {
            return Ok(());
        }
        let targets = std::mem::take(&mut self.uploads.acquires);
        let transfer_family = self.gpu.info().family(QueueKind::Transfer);
        let graphics_family = self.gpu.info().family(QueueKind::Graphics);

        let mut images = Vec::new();
        let mut buffers = Vec::new();
        let mut registrations = Vec::new();
        for target in targets {
            match target {
                UploadTarget::Texture(texture) => {
                    if !self.pools.textures.is_valid(texture) {
                        continue;
                    }
                    let (hot, cold) = self.pools.textures.get_mut(texture);
                    let read = ResourceState::ShaderResource;
                    images.push(NativeImageBarrier {
                        image: hot.image,
                        aspect: cold.aspect(),
                        range: cold.range,
                        old_layout: ResourceState::CopyDest.image_layout(),
                        new_layout: read.image_layout(),
                        src_stage: vk::PipelineStageFlags2::NONE,
                        src_access: vk::AccessFlags2::NONE,
                        dst_stage: read.stage_mask(QueueKind::Graphics),
                        dst_access: read.access_mask(),
                        src_queue_family: transfer_family,
                        dst_queue_family: graphics_family,
                    });
                    cold.queue_owner = QueueKind::Graphics;
                    registrations.push(texture);
                }
                UploadTarget::Buffer(buffer) => {
                    if !self.pools.buffers.is_valid(buffer) {
                        continue;
                    }
                    let (hot, cold) = self.pools.buffers.get_mut(buffer);
                    buffers.push(NativeBufferBarrier {
                        buffer: hot.buffer,
                        offset: 0,
                        size: vk::WHOLE_SIZE,
                        src_stage: vk::PipelineStageFlags2::NONE,
                        src_access: vk::AccessFlags2::NONE,
                        dst_stage: cold.state.stage_mask(QueueKind::Graphics),
                        dst_access: cold.state.access_mask(),
                        src_queue_family: transfer_family,
                        dst_queue_family: graphics_family,
                    });
                    cold.queue_owner = QueueKind::Graphics;
                }
            }
        }

        if images.is_empty() && buffers.is_empty() {
            return Ok(());
        }

        let id = self.internal_command_buffer(QueueKind::Graphics)?;
        // Ended together with the rest of the frame's graphics buffers
        self.encoder(id).raw_barrier(&images, &buffers);
        self.queued.insert(0, id);

        for texture in registrations {
            if self.upload_target_alive(UploadTarget::Texture(texture)) {
                self.register_bindless(texture);
            }
        }
        Ok(())
    }

    /// Submit one ended command buffer on `queue` and signal its timeline
    pub(crate) fn submit_queue(
        &mut self,
        queue: QueueKind,
        id: crate::command_buffer_manager::CommandBufferId,
        waits: &[TimelineWait],
    ) -> DeviceResult<()> {
        let native = self.commands.get(id).native();
        let value = self.timeline.next_value(queue);
        self.gpu.submit(&crate::backend::QueueSubmit {
            queue,
            command_buffers: std::slice::from_ref(&native),
            wait_acquire: None,
            wait_timelines: waits,
            signal_present: None,
            signal_timeline: Some(value),
        })?;
        self.timeline.record(queue, self.frame.current, value);
        Ok(())
    }
}

impl CommandEncoder<'_> {
    pub(crate) fn copy_to_texture(&mut self, src: vk::Buffer, offset: u64, texture: TextureHandle) {
        let hot = self.pools.textures.get_hot(texture);
        let cold = self.pools.textures.get_cold(texture);
        let region = vk::BufferImageCopy {
            buffer_offset: offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: cold.aspect(),
                mip_level: 0,
                base_array_layer: 0,
                layer_count: cold.array_layers,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: cold.width,
                height: cold.height,
                depth: cold.depth,
            },
        };
        self.gpu
            .cmd_copy_buffer_to_image(self.cb.native, src, hot.image, std::slice::from_ref(&region));
    }

    pub(crate) fn copy_to_buffer(
        &mut self,
        src: vk::Buffer,
        offset: u64,
        buffer: BufferHandle,
        size: u64,
    ) {
        let dst = self.pools.buffers.get_hot(buffer).buffer;
        let region = vk::BufferCopy {
            src_offset: offset,
            dst_offset: 0,
            size,
        };
        self.gpu
            .cmd_copy_buffer(self.cb.native, src, dst, std::slice::from_ref(&region));
    }
}
