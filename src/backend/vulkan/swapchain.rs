// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Acquire and present semaphores are binary and owned per frame slot; the
// device never reuses a slot before its previous frame completed.

use anyhow::{Context, Result};
use ash::vk;

use crate::backend::Acquired;

pub(super) struct SwapchainSettings {
    pub present_mode: vk::PresentModeKHR,
    pub image_count: u32,
}

pub(super) struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    acquire_semaphores: Vec<vk::Semaphore>,
    present_semaphores: Vec<vk::Semaphore>,
}

struct Chain {
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        settings: &SwapchainSettings,
        (width, height): (u32, u32),
    ) -> Result<Self> {
        let loader = ash::extensions::khr::Swapchain::new(instance, device);
        let chain = create_chain(
            device,
            &loader,
            physical_device,
            surface,
            surface_loader,
            settings,
            (width, height),
            vk::SwapchainKHR::null(),
        )?;

        let mut swapchain = Self {
            swapchain: chain.swapchain,
            loader,
            images: chain.images,
            image_views: chain.image_views,
            format: chain.format,
            extent: chain.extent,
            acquire_semaphores: Vec::new(),
            present_semaphores: Vec::new(),
        };

        // One pair per frame in flight
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let created: Result<(), vk::Result> = (0..swapchain.images.len()).try_for_each(|_| unsafe {
            swapchain
                .acquire_semaphores
                .push(device.create_semaphore(&semaphore_info, None)?);
            swapchain
                .present_semaphores
                .push(device.create_semaphore(&semaphore_info, None)?);
            Ok(())
        });
        if let Err(e) = created {
            swapchain.destroy(device);
            return Err(e).context("Failed to create swapchain semaphores");
        }

        Ok(swapchain)
    }

    /// Replace the chain at a new size; the caller has waited for the GPU
    pub fn recreate(
        &mut self,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        settings: &SwapchainSettings,
        size: (u32, u32),
    ) -> Result<()> {
        let chain = create_chain(
            device,
            &self.loader,
            physical_device,
            surface,
            surface_loader,
            settings,
            size,
            self.swapchain,
        )?;
        if chain.images.len() != self.images.len() {
            log::warn!(
                "Swapchain image count changed from {} to {}",
                self.images.len(),
                chain.images.len()
            );
        }

        self.destroy_chain(device);
        self.swapchain = chain.swapchain;
        self.images = chain.images;
        self.image_views = chain.image_views;
        self.format = chain.format;
        self.extent = chain.extent;
        Ok(())
    }

    /// Acquire next image for rendering, signalling the slot's semaphore
    pub fn acquire_next_image(&self, slot: u32) -> Result<Acquired> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.acquire_semaphores[slot as usize],
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present rendered image to screen; true when the chain should be
    /// recreated
    pub fn present(&self, queue: vk::Queue, slot: u32, image_index: u32) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [self.present_semaphores[slot as usize]];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present"),
        }
    }

    pub fn acquire_semaphore(&self, slot: u32) -> vk::Semaphore {
        self.acquire_semaphores[slot as usize]
    }

    pub fn present_semaphore(&self, slot: u32) -> vk::Semaphore {
        self.present_semaphores[slot as usize]
    }

    fn destroy_chain(&mut self, device: &ash::Device) {
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.swapchain, None);
            }
        }
        self.swapchain = vk::SwapchainKHR::null();
        self.images.clear();
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.destroy_chain(device);
        unsafe {
            for semaphore in self.acquire_semaphores.drain(..).chain(self.present_semaphores.drain(..)) {
                device.destroy_semaphore(semaphore, None);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_chain(
    device: &ash::Device,
    loader: &ash::extensions::khr::Swapchain,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    surface_loader: &ash::extensions::khr::Surface,
    settings: &SwapchainSettings,
    (width, height): (u32, u32),
    old_swapchain: vk::SwapchainKHR,
) -> Result<Chain> {
    log::info!("Creating swapchain: {}x{}", width, height);

    let surface_caps =
        unsafe { surface_loader.get_physical_device_surface_capabilities(physical_device, surface) }?;
    let formats = unsafe { surface_loader.get_physical_device_surface_formats(physical_device, surface) }?;
    let present_modes =
        unsafe { surface_loader.get_physical_device_surface_present_modes(physical_device, surface) }?;

    // Choose surface format (prefer SRGB)
    let surface_format = formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .context("No suitable surface format")?;

    // FIFO is always supported
    let present_mode = if present_modes.contains(&settings.present_mode) {
        settings.present_mode
    } else {
        log::warn!("Present mode {:?} unsupported, using FIFO", settings.present_mode);
        vk::PresentModeKHR::FIFO
    };
    log::info!("Present mode: {:?}", present_mode);

    let extent = choose_extent(&surface_caps, width, height);
    let image_count = clamp_image_count(&surface_caps, settings.image_count);

    let create_info = vk::SwapchainCreateInfoKHR::builder()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(surface_caps.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);

    let swapchain = unsafe { loader.create_swapchain(&create_info, None) }.context("Failed to create swapchain")?;
    let images = match unsafe { loader.get_swapchain_images(swapchain) } {
        Ok(images) => images,
        Err(e) => {
            unsafe { loader.destroy_swapchain(swapchain, None) };
            return Err(e).context("Failed to get swapchain images");
        }
    };

    log::info!("Created swapchain with {} images", images.len());

    let mut image_views = Vec::with_capacity(images.len());
    for &image in &images {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(surface_format.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.create_image_view(&create_info, None) } {
            Ok(view) => image_views.push(view),
            Err(e) => unsafe {
                for view in image_views {
                    device.destroy_image_view(view, None);
                }
                loader.destroy_swapchain(swapchain, None);
                return Err(e).context("Failed to create image view");
            },
        }
    }

    Ok(Chain {
        swapchain,
        images,
        image_views,
        format: surface_format.format,
        extent,
    })
}

fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

fn clamp_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let count = requested.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}
