use ash::vk;

use super::*;
use crate::backend::mock::{MockEvent, MockGpu, MockHandle, Progress};
use crate::command_buffer::RecordingState;
use crate::config::{Config, MemoryConfig};
use crate::deletion_queue::ResourceRef;
use crate::error::DeviceError;
use crate::resources::*;
use crate::shader::CompileOptions;

const FRAMES: u32 = 3;

fn test_config() -> Config {
    Config {
        memory: MemoryConfig {
            dynamic_per_frame_size: 64 * 1024,
            staging_per_frame_size: 64 * 1024,
        },
        ..Default::default()
    }
}

fn device_with(gpu: MockGpu, mock: MockHandle, config: &Config) -> (Device, MockHandle) {
    let device = Device::with_backend(Box::new(gpu), config).unwrap();
    (device, mock)
}

fn device(progress: Progress) -> (Device, MockHandle) {
    let (gpu, mock) = MockGpu::new(FRAMES, progress);
    device_with(gpu, mock, &test_config())
}

fn render_target(device: &mut Device) -> TextureHandle {
    device
        .create_texture(&TextureCreation::new("rt", 64, 64, vk::Format::R8G8B8A8_UNORM).flags(TextureFlags::RENDER_TARGET))
        .unwrap()
}

fn sampled(device: &mut Device, name: &str) -> TextureHandle {
    device
        .create_texture(&TextureCreation::new(name, 4, 4, vk::Format::R8G8B8A8_UNORM))
        .unwrap()
}

fn clear_frame(device: &mut Device, rt: TextureHandle) {
    device.new_frame().unwrap();
    let cb = device.get_command_buffer(QueueKind::Graphics).unwrap();
    let mut encoder = device.encoder(cb);
    encoder.barrier(&ExecutionBarrier::new().image(rt, ResourceState::RenderTarget));
    encoder.begin_pass(&RenderPassDesc::new().color(ColorTarget::clear(rt, [0.1, 0.2, 0.3, 1.0])));
    encoder.end_pass();
    device.queue_command_buffer(cb);
    device.present().unwrap();
}

fn empty_frame(device: &mut Device) {
    device.new_frame().unwrap();
    device.present().unwrap();
}

fn view_of(device: &Device, texture: TextureHandle) -> vk::ImageView {
    device.pools.textures.get_hot(texture).view
}

fn image_destroyed(mock: &MockHandle, image: vk::Image) -> bool {
    use ash::vk::Handle as _;
    mock.count(|e| *e == MockEvent::Destroy("image", image.as_raw())) > 0
}

fn buffer_destroyed(mock: &MockHandle, buffer: vk::Buffer) -> bool {
    use ash::vk::Handle as _;
    mock.count(|e| *e == MockEvent::Destroy("buffer", buffer.as_raw())) > 0
}

#[test]
fn clear_pass_over_ring_blocks_exactly_once() {
    let (mut device, mock) = device(Progress::Lazy);
    let rt = render_target(&mut device);

    for _ in 0..FRAMES + 2 {
        clear_frame(&mut device, rt);
    }

    assert_eq!(mock.blocks(), 1);
    let blocked = mock
        .events()
        .into_iter()
        .find_map(|e| match e {
            MockEvent::Wait { values, blocked: true } => Some(values),
            _ => None,
        })
        .unwrap();
    // The first slot reuse waits for frame 0's graphics signal
    assert!(blocked.contains(&(QueueKind::Graphics, 1)));

    assert_eq!(device.texture_state(rt), ResourceState::RenderTarget);
    assert_eq!(device.pending_deletions(), 0);
    assert_eq!(device.absolute_frame(), FRAMES as u64 + 2);
    assert_eq!(mock.count(|e| matches!(e, MockEvent::Present { .. })), FRAMES as usize + 2);
}

#[test]
fn graphics_submissions_chain_on_the_timeline() {
    let (mut device, mock) = device(Progress::Immediate);
    let rt = render_target(&mut device);
    for _ in 0..FRAMES + 1 {
        clear_frame(&mut device, rt);
    }

    let submits = mock.submits(QueueKind::Graphics);
    assert_eq!(submits.len(), FRAMES as usize + 1);
    for (a, submit) in submits.iter().enumerate() {
        let MockEvent::Submit {
            waits,
            signal,
            wait_acquire,
            signal_present,
            ..
        } = submit
        else {
            unreachable!()
        };
        assert_eq!(*signal, Some(a as u64 + 1));
        assert_eq!(*wait_acquire, Some(a as u32 % FRAMES));
        assert_eq!(*signal_present, Some(a as u32 % FRAMES));
        let graphics_wait = waits.iter().find(|w| w.queue == QueueKind::Graphics);
        if a as u32 >= FRAMES {
            assert_eq!(graphics_wait.map(|w| w.value), Some(a as u64 - FRAMES as u64 + 1));
        } else {
            assert!(graphics_wait.is_none());
        }
    }
}

#[test]
fn slot_reuse_waits_before_reset() {
    let (mut device, mock) = device(Progress::Stalled);
    for _ in 0..FRAMES {
        empty_frame(&mut device);
    }
    assert_eq!(mock.blocks(), 0);

    mock.clear();
    device.new_frame().unwrap();

    let wait = mock
        .position(|e| matches!(e, MockEvent::Wait { blocked: true, .. }))
        .expect("stalled GPU must block the slot reuse");
    let reset = mock.position(|e| matches!(e, MockEvent::ResetPool(_))).unwrap();
    assert!(wait < reset);
    assert_eq!(mock.blocks(), 1);
}

#[test]
fn destroyed_texture_outlives_its_bindless_slot() {
    let (mut device, mock) = device(Progress::Lazy);
    device.new_frame().unwrap();
    let texture = sampled(&mut device, "albedo");
    device.present().unwrap();

    let index = device.bindless_index(texture);
    let image = device.pools.textures.get_hot(texture).image;
    assert_eq!(mock.bindless_view(index), Some(view_of(&device, texture)));

    device.new_frame().unwrap();
    device.destroy_texture(texture);
    // Still referenced by the table until present rewrites the slot
    assert_eq!(device.pending_deletions(), 0);
    assert!(device.is_valid(ResourceRef::Texture(texture)));
    device.present().unwrap();

    let dummy = view_of(&device, device.dummy_texture());
    assert_eq!(mock.bindless_view(index), Some(dummy));
    assert_eq!(device.pending_deletions(), 1);

    // Frames still in flight may sample the old descriptor
    empty_frame(&mut device);
    assert!(!image_destroyed(&mock, image));

    // Reusing slot 0 retires every submitted frame, the sweep follows in present
    device.new_frame().unwrap();
    assert_eq!(mock.blocks(), 1);
    assert!(!image_destroyed(&mock, image));
    device.present().unwrap();

    assert!(image_destroyed(&mock, image));
    assert!(!device.is_valid(ResourceRef::Texture(texture)));
    assert_eq!(device.pending_deletions(), 0);
}

#[test]
fn dead_slots_resolve_to_the_dummy() {
    let (mut device, mock) = device(Progress::Immediate);
    device.new_frame().unwrap();
    let a = sampled(&mut device, "a");
    let b = sampled(&mut device, "b");
    device.present().unwrap();
    let (index_a, index_b) = (device.bindless_index(a), device.bindless_index(b));

    device.new_frame().unwrap();
    device.destroy_texture(a);
    device.present().unwrap();

    let dummy = view_of(&device, device.dummy_texture());
    assert_eq!(mock.bindless_view(index_a), Some(dummy));
    assert_eq!(mock.bindless_view(index_b), Some(view_of(&device, b)));
    // Never used elements were filled at creation
    assert_eq!(mock.bindless_view(device.bindless.capacity() - 1), Some(dummy));
}

#[test]
fn create_and_destroy_in_one_frame_never_exposes_the_texture() {
    let (mut device, mock) = device(Progress::Lazy);
    device.new_frame().unwrap();
    let texture = sampled(&mut device, "short_lived");
    let index = device.bindless_index(texture);
    device.destroy_texture(texture);
    device.present().unwrap();

    let dummy = view_of(&device, device.dummy_texture());
    assert_eq!(mock.bindless_view(index), Some(dummy));
    assert_eq!(device.pending_deletions(), 1);
}

#[test]
fn destroy_between_frames_waits_for_the_gpu() {
    let (mut device, mock) = device(Progress::Stalled);
    let buffer = device
        .create_buffer(&BufferCreation::new(
            "between_frames",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            ResourceUsage::Stream,
            64,
        ))
        .unwrap();
    let native = device.pools.buffers.get_hot(buffer).buffer;

    device.new_frame().unwrap();
    device.present().unwrap();
    // Frame 0 may still read it, and nothing has retired
    device.destroy_buffer(buffer);
    for _ in 0..FRAMES + 1 {
        empty_frame(&mut device);
        assert!(!buffer_destroyed(&mock, native));
    }
    assert_eq!(device.pending_deletions(), 1);

    mock.set_progress(Progress::Immediate);
    empty_frame(&mut device);
    assert!(buffer_destroyed(&mock, native));
    assert_eq!(device.pending_deletions(), 0);
}

#[test]
fn repeated_barrier_records_once() {
    let (mut device, mock) = device(Progress::Immediate);
    let rt = render_target(&mut device);
    device.new_frame().unwrap();
    let cb = device.get_command_buffer(QueueKind::Graphics).unwrap();
    let native = device.commands.get(cb).native();

    let barrier = ExecutionBarrier::new().image(rt, ResourceState::RenderTarget);
    device.encoder(cb).barrier(&barrier);
    device.encoder(cb).barrier(&barrier);

    let barriers = mock.count(|e| matches!(e, MockEvent::Barrier { cb, .. } if *cb == native));
    assert_eq!(barriers, 1);
    assert_eq!(device.texture_state(rt), ResourceState::RenderTarget);
}

#[test]
fn stream_buffer_round_trip_through_gpu_copy() {
    let (mut device, _mock) = device(Progress::Immediate);
    let payload: Vec<u8> = (0..=255u8).collect();
    let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    let src = device
        .create_buffer(&BufferCreation::new("src", usage, ResourceUsage::Stream, 256).with_data(&payload))
        .unwrap();
    let dst = device
        .create_buffer(&BufferCreation::new("dst", usage, ResourceUsage::Stream, 256))
        .unwrap();

    device.new_frame().unwrap();
    let cb = device.get_command_buffer(QueueKind::Graphics).unwrap();
    {
        let mut encoder = device.encoder(cb);
        encoder.barrier(
            &ExecutionBarrier::new()
                .buffer(src, ResourceState::CopySource)
                .buffer(dst, ResourceState::CopyDest),
        );
        encoder.copy_buffer(src, 0, dst, 0, 256);
    }
    device.queue_command_buffer(cb);
    device.present().unwrap();

    let mapped = device.map_buffer(dst, 0, 0).unwrap();
    assert_eq!(mapped, payload.as_slice());
    device.unmap_buffer(dst);
}

#[test]
fn texture_upload_is_released_then_acquired() {
    let (mut device, mock) = device(Progress::Immediate);
    let pixels = vec![0x80u8; 4 * 4 * 4];
    let texture = device
        .create_texture(&TextureCreation::new("upload", 4, 4, vk::Format::R8G8B8A8_UNORM).with_data(&pixels))
        .unwrap();
    let image = device.pools.textures.get_hot(texture).image;
    assert_eq!(device.pending_uploads(), 2); // dummy texture + this one

    device.new_frame().unwrap();
    assert_eq!(device.pending_uploads(), 0);
    assert_eq!(mock.submits(QueueKind::Transfer).len(), 1);
    assert!(mock.count(|e| matches!(e, MockEvent::CopyBufferToImage { image: i, .. } if *i == image)) == 1);
    assert_eq!(device.query_texture(texture).queue_owner, QueueKind::Transfer);

    // Not visible to shaders before the acquire
    let dummy = view_of(&device, device.dummy_texture());
    assert_eq!(mock.bindless_view(device.bindless_index(texture)), Some(dummy));

    device.present().unwrap();
    let acquire = mock.events().into_iter().find_map(|e| match e {
        MockEvent::Barrier { images, .. } => images
            .into_iter()
            .find(|b| b.image == image && b.src_queue_family == 2 && b.dst_access == vk::AccessFlags2::SHADER_READ),
        _ => None,
    });
    assert!(acquire.is_some());
    assert_eq!(device.query_texture(texture).queue_owner, QueueKind::Graphics);
    assert_eq!(device.texture_state(texture), ResourceState::ShaderResource);
    assert_eq!(mock.bindless_view(device.bindless_index(texture)), Some(view_of(&device, texture)));

    let MockEvent::Submit { waits, .. } = &mock.submits(QueueKind::Graphics)[0] else {
        unreachable!()
    };
    assert!(waits.iter().any(|w| w.queue == QueueKind::Transfer && w.value == 1));
}

#[test]
fn full_user_budget_leaves_room_for_upload_work() {
    let (mut device, mock) = device(Progress::Immediate);
    let pixels = vec![0xffu8; 4 * 4 * 4];
    let texture = device
        .create_texture(&TextureCreation::new("budget", 4, 4, vk::Format::R8G8B8A8_UNORM).with_data(&pixels))
        .unwrap();

    device.new_frame().unwrap();
    assert_eq!(mock.submits(QueueKind::Transfer).len(), 1);
    // The upload went out on a reserved buffer, the caller still owns theirs
    device.get_command_buffer(QueueKind::Transfer).unwrap();

    let user: Vec<_> = (0..3)
        .map(|_| device.get_command_buffer(QueueKind::Graphics).unwrap())
        .collect();
    let natives: Vec<_> = user.iter().map(|&id| device.commands.get(id).native()).collect();
    for &id in &user {
        device.queue_command_buffer(id);
    }
    device.present().unwrap();

    assert_eq!(device.texture_state(texture), ResourceState::ShaderResource);
    let MockEvent::Submit { command_buffers, .. } = &mock.submits(QueueKind::Graphics)[0] else {
        unreachable!()
    };
    // Upload acquire first, then the caller's buffers in queue order
    assert_eq!(command_buffers.len(), 4);
    assert!(!natives.contains(&command_buffers[0]));
    assert_eq!(&command_buffers[1..], natives.as_slice());
}

#[test]
fn shared_family_upload_needs_no_ownership_transfer() {
    let (gpu, mock) = MockGpu::new(FRAMES, Progress::Immediate);
    let (mut device, mock) = device_with(gpu.with_shared_families(), mock, &test_config());
    let pixels = vec![0u8; 2 * 2 * 4];
    let texture = device
        .create_texture(&TextureCreation::new("shared", 2, 2, vk::Format::R8G8B8A8_UNORM).with_data(&pixels))
        .unwrap();

    device.new_frame().unwrap();
    device.present().unwrap();

    let transfers = mock.count(|e| match e {
        MockEvent::Barrier { images, .. } => images.iter().any(|b| b.src_queue_family != vk::QUEUE_FAMILY_IGNORED),
        _ => false,
    });
    assert_eq!(transfers, 0);
    assert_eq!(device.query_texture(texture).queue_owner, QueueKind::Graphics);
    assert_eq!(mock.bindless_view(device.bindless_index(texture)), Some(view_of(&device, texture)));
}

#[test]
fn immutable_buffer_data_lands_through_staging() {
    let (mut device, mock) = device(Progress::Immediate);
    let vertices = [1u8; 96];
    let buffer = device
        .create_buffer(
            &BufferCreation::new("vertices", vk::BufferUsageFlags::VERTEX_BUFFER, ResourceUsage::Immutable, 96)
                .with_data(&vertices),
        )
        .unwrap();
    assert!(device.map_buffer(buffer, 0, 0).is_none());

    device.new_frame().unwrap();
    let native = device.pools.buffers.get_hot(buffer).buffer;
    assert_eq!(mock.count(|e| matches!(e, MockEvent::CopyBuffer { dst, .. } if *dst == native)), 1);
    device.present().unwrap();

    assert_eq!(device.buffer_state(buffer), ResourceState::VertexBuffer);
    assert_eq!(device.query_buffer(buffer).queue_owner, QueueKind::Graphics);
}

#[test]
fn uploads_that_do_not_fit_wait_for_the_next_frame() {
    let (gpu, mock) = MockGpu::new(FRAMES, Progress::Immediate);
    let mut config = test_config();
    config.memory.staging_per_frame_size = 128;
    let (mut device, mock) = device_with(gpu, mock, &config);
    let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
    let a = device
        .create_buffer(&BufferCreation::new("a", usage, ResourceUsage::Immutable, 100).with_data(&[1; 100]))
        .unwrap();
    let b = device
        .create_buffer(&BufferCreation::new("b", usage, ResourceUsage::Immutable, 100).with_data(&[2; 100]))
        .unwrap();

    empty_frame(&mut device);
    assert_eq!(device.pending_uploads(), 1);
    assert_eq!(device.buffer_state(a), ResourceState::ShaderResource);
    assert_eq!(device.buffer_state(b), ResourceState::Undefined);

    empty_frame(&mut device);
    assert_eq!(device.pending_uploads(), 0);
    assert_eq!(device.buffer_state(b), ResourceState::ShaderResource);
    assert_eq!(mock.submits(QueueKind::Transfer).len(), 2);
}

#[test]
fn out_of_date_acquire_skips_presentation() {
    let (mut device, mock) = device(Progress::Immediate);
    mock.state().acquire_out_of_date = true;

    device.new_frame().unwrap();
    assert_eq!(device.swapchain_texture(), None);
    device.present().unwrap();

    assert_eq!(mock.count(|e| matches!(e, MockEvent::Present { .. })), 0);
    let MockEvent::Submit {
        wait_acquire,
        signal_present,
        ..
    } = &mock.submits(QueueKind::Graphics)[0]
    else {
        unreachable!()
    };
    assert_eq!(*wait_acquire, None);
    assert_eq!(*signal_present, None);
    assert_eq!(mock.count(|e| matches!(e, MockEvent::RecreateSwapchain(..))), 1);
    assert_eq!(device.absolute_frame(), 1);

    device.new_frame().unwrap();
    assert!(device.swapchain_texture().is_some());
}

#[test]
fn resize_recreates_at_the_frame_boundary() {
    let (mut device, mock) = device(Progress::Immediate);
    let old = device.swapchain.textures.clone();
    device.resize(128, 96);
    assert_eq!(device.swapchain_extent(), (64, 64));

    device.new_frame().unwrap();
    assert_eq!(mock.count(|e| *e == MockEvent::RecreateSwapchain(128, 96)), 1);
    assert_eq!(device.swapchain_extent(), (128, 96));
    assert!(old.iter().all(|&t| !device.is_valid(ResourceRef::Texture(t))));
    let current = device.swapchain_texture().unwrap();
    assert_eq!(device.query_texture(current).width, 128);
}

#[test]
fn minimized_surface_postpones_recreation() {
    let (mut device, mock) = device(Progress::Immediate);
    device.resize(0, 0);
    empty_frame(&mut device);
    assert_eq!(mock.count(|e| matches!(e, MockEvent::RecreateSwapchain(..))), 0);
    assert_eq!(device.swapchain_texture(), None);

    device.resize(64, 64);
    device.new_frame().unwrap();
    assert_eq!(mock.count(|e| matches!(e, MockEvent::RecreateSwapchain(..))), 1);
    assert!(device.swapchain_texture().is_some());
}

#[test]
fn compute_work_joins_the_graphics_wait_list() {
    let (mut device, mock) = device(Progress::Immediate);
    let pipeline = device
        .create_pipeline(&PipelineCreation::new(
            "cull",
            ShaderStateCreation::new("cull").spirv(vk::ShaderStageFlags::COMPUTE, vec![0x0723_0203, 0, 0, 0, 0]),
        ))
        .unwrap();

    device.new_frame().unwrap();
    let cb = device.get_command_buffer(QueueKind::Compute).unwrap();
    {
        let mut encoder = device.encoder(cb);
        encoder.bind_pipeline(pipeline);
        encoder.dispatch(8, 1, 1);
    }
    device.submit_compute(cb).unwrap();
    assert_eq!(device.command_buffer_state(cb), RecordingState::Ended);
    device.present().unwrap();

    assert_eq!(mock.submits(QueueKind::Compute).len(), 1);
    let MockEvent::Submit { waits, .. } = &mock.submits(QueueKind::Graphics)[0] else {
        unreachable!()
    };
    assert!(waits.iter().any(|w| w.queue == QueueKind::Compute && w.value == 1));
}

#[test]
fn pipeline_takes_its_shader_state_along() {
    let (mut device, mock) = device(Progress::Immediate);
    let pipeline = device
        .create_pipeline(&PipelineCreation::new(
            "triangle",
            ShaderStateCreation::new("triangle")
                .spirv(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203, 1])
                .spirv(vk::ShaderStageFlags::FRAGMENT, vec![0x0723_0203, 2]),
        ))
        .unwrap();
    let shader_state = device.query_pipeline(pipeline).shader_state;
    assert!(device.query_pipeline(pipeline).graphics);

    device.new_frame().unwrap();
    device.destroy_pipeline(pipeline);
    device.present().unwrap();
    for _ in 0..FRAMES {
        empty_frame(&mut device);
    }

    assert!(!device.is_valid(ResourceRef::Pipeline(pipeline)));
    assert!(!device.is_valid(ResourceRef::ShaderState(shader_state)));
    assert_eq!(mock.count(|e| matches!(e, MockEvent::Destroy("shader_module", _))), 2);
}

struct FailingCompiler;

impl crate::shader::ShaderCompiler for FailingCompiler {
    fn compile(
        &self,
        _stage: vk::ShaderStageFlags,
        _source: &str,
        _options: &CompileOptions,
    ) -> Vec<u32> {
        Vec::new()
    }
}

#[test]
fn failed_compilation_is_an_error_and_leaks_nothing() {
    let (mut device, mock) = device(Progress::Immediate);
    device.set_shader_compiler(Box::new(FailingCompiler));
    let creation = ShaderStateCreation::new("broken")
        .spirv(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203])
        .glsl(vk::ShaderStageFlags::FRAGMENT, "void main() {", CompileOptions::default());

    let result = device.create_shader_state(&creation);
    assert!(matches!(result, Err(DeviceError::ShaderCompilation { ref name }) if name == "broken"));
    assert_eq!(mock.count(|e| matches!(e, MockEvent::Destroy("shader_module", _))), 1);
    assert_eq!(device.pools.shader_states.live_count(), 0);
}

#[test]
fn dynamic_allocations_are_per_slot() {
    let (mut device, _mock) = device(Progress::Immediate);
    device.new_frame().unwrap();
    let first = device.dynamic_buffer_allocate(100, 256).offset;
    let second = device.dynamic_buffer_allocate(100, 256).offset;
    assert_eq!(first, 0);
    assert_eq!(second, 256);
    device.present().unwrap();

    device.new_frame().unwrap();
    let slice = device.dynamic.ring.per_frame();
    let alloc = device.dynamic_buffer_allocate(16, 16);
    alloc.data.copy_from_slice(&[7; 16]);
    assert_eq!(alloc.offset, slice);
}

#[test]
fn dynamic_buffer_maps_into_the_ring() {
    let (mut device, _mock) = device(Progress::Immediate);
    let constants = device
        .create_buffer(&BufferCreation::new(
            "constants",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            ResourceUsage::Dynamic,
            64,
        ))
        .unwrap();
    device.new_frame().unwrap();
    let mapped = device.map_buffer(constants, 0, 0).unwrap();
    assert_eq!(mapped.len(), 64);
    mapped.fill(3);

    let description = device.query_buffer(constants);
    assert_eq!(description.parent_buffer, Some(device.dynamic_buffer()));
    let offset = description.global_offset;
    let ring = device.dynamic_buffer();
    let all = device.map_buffer(ring, offset, 64).unwrap();
    assert!(all.iter().all(|&b| b == 3));
}

#[test]
fn gpu_timestamps_resolve_for_the_previous_frame() {
    let (gpu, mock) = MockGpu::new(FRAMES, Progress::Immediate);
    let mut config = test_config();
    config.device.gpu_timestamps = true;
    let (mut device, mock) = device_with(gpu, mock, &config);
    mock.state().timestamps_ready = true;

    device.new_frame().unwrap();
    let cb = device.get_command_buffer(QueueKind::Graphics).unwrap();
    {
        let mut encoder = device.encoder(cb);
        encoder.push_marker("frame");
        encoder.pop_marker();
    }
    device.queue_command_buffer(cb);
    device.present().unwrap();
    assert!(device.gpu_timestamps().is_empty());

    empty_frame(&mut device);
    let timestamps = device.gpu_timestamps();
    assert_eq!(timestamps.len(), 1);
    assert_eq!(timestamps[0].name, "frame");
    assert_eq!(timestamps[0].frame, 0);
    assert!((timestamps[0].elapsed_ms - 1.0).abs() < 1e-9);
}

#[test]
fn texture_view_covers_one_mip() {
    let (mut device, _mock) = device(Progress::Immediate);
    let parent = device
        .create_texture(&TextureCreation::new("mipped", 64, 64, vk::Format::R8G8B8A8_UNORM).mips(4))
        .unwrap();
    let view = device
        .create_texture_view(&TextureViewCreation {
            name: "mip2",
            parent,
            texture_type: TextureType::Texture2D,
            range: SubresourceRange {
                base_mip: 2,
                mip_count: 1,
                base_layer: 0,
                layer_count: 1,
            },
        })
        .unwrap();

    let description = device.query_texture(view);
    assert_eq!(description.parent_texture, Some(parent));
    assert_eq!(description.range.base_mip, 2);
    assert_eq!(device.pools.textures.get_hot(view).image, device.pools.textures.get_hot(parent).image);
    assert_ne!(view_of(&device, view), view_of(&device, parent));
}

#[test]
#[should_panic(expected = "has no bindless element")]
fn render_target_has_no_bindless_element() {
    let (mut device, _mock) = device(Progress::Immediate);
    let rt = render_target(&mut device);
    device.bindless_index(rt);
}

#[test]
#[should_panic(expected = "Dynamic ring is not host visible")]
fn dynamic_allocation_needs_a_mapped_ring() {
    let (gpu, mock) = MockGpu::new(FRAMES, Progress::Immediate);
    mock.state().host_mapping_unavailable = true;
    let (mut device, _mock) = device_with(gpu, mock, &test_config());
    device.new_frame().unwrap();
    device.dynamic_buffer_allocate(16, 16);
}

#[test]
#[should_panic(expected = "destroying stale")]
fn destroying_a_stale_handle_panics() {
    let (mut device, _mock) = device(Progress::Immediate);
    let buffer = device
        .create_buffer(&BufferCreation::new(
            "once",
            vk::BufferUsageFlags::STORAGE_BUFFER,
            ResourceUsage::Stream,
            16,
        ))
        .unwrap();
    device.new_frame().unwrap();
    device.destroy_buffer(buffer);
    device.present().unwrap();
    for _ in 0..FRAMES {
        empty_frame(&mut device);
    }
    device.destroy_buffer(buffer);
}

#[test]
#[should_panic(expected = "destroyed twice")]
fn double_destroy_before_the_sweep_panics() {
    let (mut device, _mock) = device(Progress::Immediate);
    let sampler = device.create_sampler(&SamplerCreation::new("nearest")).unwrap();
    device.destroy_sampler(sampler);
    device.destroy_sampler(sampler);
}

#[test]
fn buffer_creation_failure_is_reported() {
    let (mut device, mock) = device(Progress::Immediate);
    mock.state().fail_buffer_creation = true;
    let result = device.create_buffer(&BufferCreation::new(
        "huge",
        vk::BufferUsageFlags::STORAGE_BUFFER,
        ResourceUsage::Immutable,
        1 << 40,
    ));
    assert!(matches!(result, Err(DeviceError::Backend(_))));
}

#[test]
fn shutdown_releases_every_native_object() {
    let (mut device, mock) = device(Progress::Immediate);
    let texture = sampled(&mut device, "leftover");
    let image = device.pools.textures.get_hot(texture).image;
    device.create_sampler(&SamplerCreation::new("leftover")).unwrap();
    empty_frame(&mut device);
    drop(device);

    assert!(image_destroyed(&mock, image));
    assert_eq!(
        mock.count(|e| matches!(e, MockEvent::Destroy("command_pool", _))),
        FRAMES as usize * QueueKind::COUNT
    );
    // Two samplers: the default one and the leftover
    assert_eq!(mock.count(|e| matches!(e, MockEvent::Destroy("sampler", _))), 2);
    assert_eq!(mock.count(|e| matches!(e, MockEvent::Destroy("descriptor_set_layout", _))), 1);
}
