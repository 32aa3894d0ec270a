// =============================================================================
// RENDER DEVICE DEMO - clear pass, texture upload, bindless triangle
// =============================================================================
//
// FRAME FLOW:
// 1. Poll the window size (swapchain recreation happens at frame boundaries)
// 2. new_frame: wait for the frame slot, acquire a swapchain image
// 3. Record: transition the swapchain image, clear it, draw a triangle that
//    samples an uploaded texture through the bindless table
// 4. present
//
// The triangle needs `glslc` (Vulkan SDK). Without it the demo only clears.
//
// =============================================================================

use anyhow::Result;
use render_device::{
    vk, BlendState, ColorTarget, CompileOptions, Config, Device, ExecutionBarrier, PipelineCreation, PipelineHandle,
    QueueKind, RenderPassDesc, ResourceState, ShaderStateCreation, TextureCreation, TextureFlags, TextureHandle,
};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const TRIANGLE_VERT: &str = r#"
#version 450

layout(location = 0) out vec2 out_uv;

const vec2 POSITIONS[3] = vec2[](vec2(0.0, -0.6), vec2(0.6, 0.6), vec2(-0.6, 0.6));

void main() {
    vec2 pos = POSITIONS[gl_VertexIndex];
    out_uv = pos + 0.5;
    gl_Position = vec4(pos, 0.0, 1.0);
}
"#;

const TRIANGLE_FRAG: &str = r#"
#version 450
#extension GL_EXT_nonuniform_qualifier : require

layout(set = 0, binding = 0) uniform sampler2D textures[];

layout(push_constant) uniform Push {
    uint texture_index;
} push;

layout(location = 0) in vec2 in_uv;
layout(location = 0) out vec4 out_color;

void main() {
    out_color = texture(textures[nonuniformEXT(push.texture_index)], in_uv * 4.0);
}
"#;

const CHECKER_SIZE: u32 = 8;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging();
    log::info!("Starting render-device demo");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.device.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    // RUST_LOG overrides the default level
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    window: Option<Arc<Window>>,

    // Torn down in `shutdown`, before the window closes
    device: Option<Device>,
    checker: Option<TextureHandle>,
    triangle: Option<PipelineHandle>,

    start: Instant,
    frame_count: u32,
    last_report: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            window: None,
            device: None,
            checker: None,
            triangle: None,
            start: now,
            frame_count: 0,
            last_report: now,
        }
    }

    fn init_device(&mut self, window: &Window) -> Result<()> {
        let mut device = Device::new(&self.config, window)?;
        log::info!("Device ready on {}", device.gpu_info().name);

        let checker = create_checker(&mut device)?;
        let pipeline = PipelineCreation::new(
            "triangle",
            ShaderStateCreation::new("triangle")
                .glsl(vk::ShaderStageFlags::VERTEX, TRIANGLE_VERT, CompileOptions::default())
                .glsl(vk::ShaderStageFlags::FRAGMENT, TRIANGLE_FRAG, CompileOptions::default()),
        )
        .color_format(device.swapchain_format(), BlendState::default())
        .push_constants(4);

        self.triangle = match device.create_pipeline(&pipeline) {
            Ok(pipeline) => Some(pipeline),
            Err(e) => {
                log::warn!("Triangle disabled: {}", e);
                None
            }
        };
        self.checker = Some(checker);
        self.device = Some(device);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<()> {
        let (Some(device), Some(window)) = (self.device.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        device.poll_surface(window.as_ref());
        device.new_frame()?;

        let cb = device.get_command_buffer(QueueKind::Graphics)?;
        if let Some(target) = device.swapchain_texture() {
            let texture_index = self.checker.map(|checker| device.bindless_index(checker));
            let clear = clear_color(self.start.elapsed().as_secs_f32());

            let mut encoder = device.encoder(cb);
            encoder.push_marker("demo");
            encoder.barrier(&ExecutionBarrier::new().image(target, ResourceState::RenderTarget));
            encoder.begin_pass(&RenderPassDesc::new().color(ColorTarget::clear(target, clear)));
            if let (Some(pipeline), Some(index)) = (self.triangle, texture_index) {
                encoder.bind_pipeline(pipeline);
                encoder.push_constants(&index.to_le_bytes());
                encoder.draw(3, 1, 0, 0);
            }
            encoder.end_pass();
            encoder.pop_marker();
        }
        device.queue_command_buffer(cb);
        device.present()?;

        self.frame_count += 1;
        self.report();
        Ok(())
    }

    fn report(&mut self) {
        let elapsed = self.last_report.elapsed().as_secs_f32();
        if elapsed < 1.0 {
            return;
        }
        let fps = self.frame_count as f32 / elapsed;
        if let Some(window) = self.window.as_ref() {
            window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
        }
        if let Some(device) = self.device.as_ref() {
            for timestamp in device.gpu_timestamps() {
                log::info!(
                    "{:indent$}{}: {:.3} ms",
                    "",
                    timestamp.name,
                    timestamp.elapsed_ms,
                    indent = timestamp.depth as usize * 2
                );
            }
        }
        self.frame_count = 0;
        self.last_report = Instant::now();
    }
}

fn create_checker(device: &mut Device) -> Result<TextureHandle> {
    let mut pixels = Vec::with_capacity((CHECKER_SIZE * CHECKER_SIZE * 4) as usize);
    for y in 0..CHECKER_SIZE {
        for x in 0..CHECKER_SIZE {
            let value = if (x + y) % 2 == 0 { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    let texture = device.create_texture(
        &TextureCreation::new("checker", CHECKER_SIZE, CHECKER_SIZE, vk::Format::R8G8B8A8_UNORM)
            .flags(TextureFlags::SAMPLED)
            .with_data(&pixels),
    )?;
    Ok(texture)
}

fn clear_color(seconds: f32) -> [f32; 4] {
    let dusk = glam::Vec3::new(0.05, 0.06, 0.12);
    let dawn = glam::Vec3::new(0.35, 0.18, 0.25);
    let t = (seconds * 0.5).sin() * 0.5 + 0.5;
    dusk.lerp(dawn, t).extend(1.0).to_array()
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_device(&window) {
            log::error!("Failed to initialize device: {:#}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(device) = self.device.as_mut() {
                    device.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.render_frame() {
                    log::error!("Render error: {:#}", e);
                    self.shutdown();
                    event_loop.exit();
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl App {
    fn shutdown(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        if let Some(pipeline) = self.triangle.take() {
            device.destroy_pipeline(pipeline);
        }
        if let Some(checker) = self.checker.take() {
            device.destroy_texture(checker);
        }
        device.shutdown();
        log::info!("Cleanup complete");
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
