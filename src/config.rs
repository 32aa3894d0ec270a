// =============================================================================
// CONFIGURATION - Load device settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys fall back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub device: DeviceConfig,
    pub pools: PoolConfig,
    pub memory: MemoryConfig,
    pub commands: CommandConfig,
}

/// Window settings (demo only)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "render-device".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

/// Instance, swapchain and profiling settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub validation: bool,
    pub present_mode: String,
    /// Preferred swapchain image count; also the number of frames in flight
    pub swapchain_images: u32,
    pub gpu_timestamps: bool,
    pub timestamps_per_frame: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            present_mode: "fifo".to_string(),
            swapchain_images: 3,
            gpu_timestamps: false,
            timestamps_per_frame: 32,
        }
    }
}

/// Slot counts of the per-kind resource pools
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub buffers: u32,
    pub textures: u32,
    pub samplers: u32,
    pub pipelines: u32,
    pub shader_states: u32,
    pub descriptor_set_layouts: u32,
    pub descriptor_sets: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffers: 512,
            textures: 512,
            samplers: 32,
            pipelines: 128,
            shader_states: 128,
            descriptor_set_layouts: 128,
            descriptor_sets: 256,
        }
    }
}

/// Per-frame ring sizes, in bytes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub dynamic_per_frame_size: u64,
    pub staging_per_frame_size: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dynamic_per_frame_size: 1024 * 1024,
            staging_per_frame_size: 16 * 1024 * 1024,
        }
    }
}

/// Command buffers available per queue kind and frame slot
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub graphics_buffers: u32,
    pub compute_buffers: u32,
    pub transfer_buffers: u32,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            graphics_buffers: 3,
            compute_buffers: 1,
            transfer_buffers: 1,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        self.device.present_mode()
    }
}

impl DeviceConfig {
    pub fn present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!("Unknown present mode '{}', defaulting to FIFO", self.present_mode);
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}
