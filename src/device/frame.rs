// Frame orchestration - new_frame / present
//
// N = frames in flight (one per swapchain image), a = absolute frame,
// slot = a mod N. Each frame's graphics submission signals the graphics
// timeline with a + 1, so reusing a slot means waiting for a - N + 1 plus
// any compute/transfer values that frame signalled. The same value counts
// retired frames for the deletion queue sweep at the end of `present`.

use ash::vk;

use super::Device;
use crate::backend::{Acquired, QueueSubmit, TimelineWait};
use crate::bindless::plan_writes;
use crate::command_buffer::RecordingState;
use crate::deletion_queue::ResourceRef;
use crate::error::DeviceResult;
use crate::resources::{ExecutionBarrier, QueueKind, ResourceState};
use crate::surface::SurfaceProvider;

impl Device {
    /// Start recording a frame. Blocks until the GPU is done with the
    /// previous use of this frame slot.
    pub fn new_frame(&mut self) -> DeviceResult<()> {
        let slot = self.frame.current;

        if self.frame.absolute >= self.frame.count as u64 {
            let mut waits = self.timeline.slot_waits(slot);
            waits.retain(|&(queue, value)| {
                self.gpu
                    .completed_value(queue)
                    .map_or(true, |done| done < value)
            });
            if !waits.is_empty() {
                log::trace!("Frame {} waits for {:?}", self.frame.absolute, waits);
                self.gpu.wait_timelines(&waits)?;
            }
        }
        self.timeline.clear_slot(slot);

        if self.swapchain.needs_recreate || self.swapchain.resize_requested.is_some() {
            self.recreate_swapchain()?;
        }
        self.acquire_image(slot)?;

        self.commands.free_unused_buffers(self.gpu.as_mut(), slot)?;
        if let Some(timestamps) = self.timestamps.as_mut() {
            timestamps.reset(slot);
        }
        self.dynamic.ring.begin_frame(slot);
        self.uploads.staging.ring.begin_frame(slot);

        self.flush_uploads()
    }

    fn acquire_image(&mut self, slot: u32) -> DeviceResult<()> {
        if self.swapchain.needs_recreate {
            // Still minimized
            self.swapchain.image_index = None;
            return Ok(());
        }
        self.swapchain.image_index = match self.gpu.acquire_next_image(slot)? {
            Acquired::Image { index, suboptimal } => {
                if suboptimal {
                    log::debug!("Swapchain suboptimal, recreating after this frame");
                    self.swapchain.needs_recreate = true;
                }
                Some(index)
            }
            Acquired::OutOfDate => {
                log::debug!(
                    "Swapchain out of date, skipping presentation of frame {}",
                    self.frame.absolute
                );
                self.swapchain.needs_recreate = true;
                None
            }
        };
        Ok(())
    }

    /// Submit the frame's graphics work and present it
    pub fn present(&mut self) -> DeviceResult<()> {
        let slot = self.frame.current;

        self.record_upload_acquires()?;
        self.apply_bindless_updates();

        let image = self.swapchain.image_index;
        if let Some(index) = image {
            let texture = self.swapchain.textures[index as usize];
            let id = match self.queued.last() {
                Some(&id) => id,
                None => {
                    let id = self.internal_command_buffer(QueueKind::Graphics)?;
                    self.queued.push(id);
                    id
                }
            };
            let mut encoder = self.encoder(id);
            if encoder.state() == RecordingState::InsidePass {
                log::warn!("Render pass left open at present, closing it");
                encoder.end_pass();
            }
            encoder.barrier(&ExecutionBarrier::new().image(texture, ResourceState::Present));
        }

        let queued = std::mem::take(&mut self.queued);
        let mut natives = Vec::with_capacity(queued.len());
        for &id in &queued {
            self.encoder(id).finish()?;
            natives.push(self.commands.get(id).native());
        }

        let mut waits = Vec::with_capacity(QueueKind::COUNT);
        for queue in [QueueKind::Compute, QueueKind::Transfer] {
            if let Some(value) = self.timeline.submitted_this_frame(queue) {
                waits.push(TimelineWait {
                    queue,
                    value,
                    stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                });
            }
        }
        let n = self.frame.count as u64;
        if self.frame.absolute >= n {
            waits.push(TimelineWait {
                queue: QueueKind::Graphics,
                value: self.frame.absolute - n + 1,
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            });
        }

        let graphics_value = self.frame.absolute + 1;
        self.gpu.submit(&QueueSubmit {
            queue: QueueKind::Graphics,
            command_buffers: &natives,
            wait_acquire: image.map(|_| slot),
            wait_timelines: &waits,
            signal_present: image.map(|_| slot),
            signal_timeline: Some(graphics_value),
        })?;
        self.timeline.record(QueueKind::Graphics, slot, graphics_value);

        if let Some(index) = image {
            if self.gpu.present(slot, index)? {
                log::debug!("Swapchain needs recreation after present");
                self.swapchain.needs_recreate = true;
            }
        }
        if self.swapchain.needs_recreate || self.swapchain.resize_requested.is_some() {
            self.recreate_swapchain()?;
        }

        self.resolve_timestamps();

        self.frame.previous = slot;
        self.frame.current = (slot + 1) % self.frame.count;
        self.frame.absolute += 1;
        self.timeline.end_frame();
        log::trace!("Presented frame {}", self.frame.absolute - 1);

        self.sweep_deletions();
        Ok(())
    }

    /// Apply queued table updates newest first, then hand deleted textures
    /// to the deletion queue
    fn apply_bindless_updates(&mut self) {
        let batch = self.bindless.take_batch();
        if batch.is_empty() {
            return;
        }
        let (planned, released) = plan_writes(&batch);
        let writes: Vec<_> = planned
            .iter()
            .map(|&(index, texture)| self.bindless_write(index, texture))
            .collect();
        self.gpu.write_descriptors(&writes);
        log::trace!("Applied {} bindless writes", writes.len());

        for texture in released {
            self.pools.textures.get_cold_mut(texture).bindless = false;
            self.deletion_queue.push(ResourceRef::Texture(texture), self.frame.absolute);
        }
    }

    fn resolve_timestamps(&mut self) {
        if self.frame.absolute == 0 {
            return;
        }
        let previous = self.frame.previous;
        let Some(timestamps) = self.timestamps.as_ref() else {
            return;
        };
        let Some(count) = timestamps.written_queries(previous) else {
            return;
        };
        let pool = self.commands.query_pool(previous);
        match self.gpu.query_results(pool, 0, count) {
            Ok(Some(raw)) => {
                let period = self.gpu.info().timestamp_period;
                let frame = self.frame.absolute - 1;
                self.last_timestamps = timestamps.resolve(previous, &raw, period, frame);
            }
            Ok(None) => log::trace!("GPU timestamps of slot {} not ready", previous),
            Err(e) => log::warn!("Reading GPU timestamps failed: {:#}", e),
        }
    }

    /// Request a swapchain of the given size; applied at the next frame
    /// boundary
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == self.swapchain.extent && !self.swapchain.needs_recreate {
            return;
        }
        log::debug!("Resize requested to {}x{}", width, height);
        self.swapchain.resize_requested = Some((width, height));
    }

    /// Resize when the surface's drawable size no longer matches
    pub fn poll_surface(&mut self, surface: &dyn SurfaceProvider) {
        let (width, height) = surface.drawable_size();
        self.resize(width, height);
    }

    fn recreate_swapchain(&mut self) -> DeviceResult<()> {
        let (width, height) = self
            .swapchain
            .resize_requested
            .take()
            .unwrap_or(self.swapchain.extent);
        if width == 0 || height == 0 {
            log::debug!("Surface minimized, postponing swapchain recreation");
            self.swapchain.needs_recreate = true;
            self.swapchain.resize_requested = Some((width, height));
            return Ok(());
        }

        self.gpu.wait_idle()?;
        for texture in std::mem::take(&mut self.swapchain.textures) {
            self.pools.textures.destroy(texture);
        }
        self.gpu.recreate_swapchain(width, height)?;
        self.register_swapchain_textures();
        self.swapchain.needs_recreate = false;
        let extent = self.swapchain.extent;
        log::info!("Swapchain recreated at {}x{}", extent.0, extent.1);
        Ok(())
    }
}
