// =============================================================================
// RENDER DEVICE - GPU resource and command layer over Vulkan 1.3
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Device (frames in flight, uploads, dynamic ring)               │
// │    ├── Resource pools (generation-checked handles)              │
// │    ├── Command buffer manager (per-slot, per-queue budgets)     │
// │    ├── Bindless texture table (deferred updates)                │
// │    ├── Deletion queue (frame-tagged destruction)                │
// │    └── Gpu backend (ash + gpu-allocator, or a test mock)        │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. new_frame: wait for the slot's timeline values, acquire a swapchain
//    image, flush pending uploads
// 2. record work through command encoders
// 3. present: apply bindless updates, submit graphics, present, resolve
//    GPU timestamps of the previous frame, free retired deletions
//
// =============================================================================

/// Violations of the device's usage contract (stale handles, recording in
/// the wrong state) are programming errors: log them, then panic.
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            log::error!($($arg)+);
            panic!($($arg)+);
        }
    };
}

pub mod backend;
pub mod bindless;
pub mod command_buffer;
pub mod command_buffer_manager;
pub mod config;
pub mod deletion_queue;
pub mod device;
pub mod error;
pub mod pool;
pub mod resources;
pub mod shader;
pub mod surface;
pub mod timestamps;

pub use command_buffer::{CommandEncoder, RecordingState};
pub use command_buffer_manager::CommandBufferId;
pub use config::Config;
pub use device::{Device, DynamicAllocation};
pub use error::{DeviceError, DeviceResult};
pub use pool::Handle;
pub use resources::*;
pub use shader::{CompileOptions, GlslcCompiler, ShaderCompiler};
pub use surface::SurfaceProvider;
pub use timestamps::GpuTimestamp;

pub use ash::vk;
