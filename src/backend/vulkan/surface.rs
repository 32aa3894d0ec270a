// Surface - platform window connection
//
// Surfaces are created straight from raw-window-handle 0.6 handles for
// Win32, Xlib, Xcb and Wayland windows.

use anyhow::Context;
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::ffi::c_char;

use crate::error::{DeviceError, DeviceResult};
use crate::surface::SurfaceProvider;

/// Instance extensions needed to create a surface on this display
pub(super) fn required_extensions(display: RawDisplayHandle) -> DeviceResult<Vec<*const c_char>> {
    use ash::extensions::khr;

    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => return Err(DeviceError::Surface(format!("unsupported display {:?}", other))),
    };
    Ok(vec![khr::Surface::name().as_ptr(), platform.as_ptr()])
}

pub(super) fn raw_handles(
    provider: &dyn SurfaceProvider,
) -> DeviceResult<(RawDisplayHandle, RawWindowHandle)> {
    let display = provider
        .display_handle()
        .map_err(|e| DeviceError::Surface(format!("no display handle: {}", e)))?
        .as_raw();
    let window = provider
        .window_handle()
        .map_err(|e| DeviceError::Surface(format!("no window handle: {}", e)))?
        .as_raw();
    Ok((display, window))
}

/// # Safety
/// The handles must refer to a live window that outlives the surface.
pub(super) unsafe fn create_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> DeviceResult<vk::SurfaceKHR> {
    use ash::extensions::khr;

    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance = handle.hinstance.map_or(0, |h| h.get()) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder().hinstance(hinstance).hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display.display.map_or(std::ptr::null_mut(), |d| d.as_ptr());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display.connection.map_or(std::ptr::null_mut(), |c| c.as_ptr());
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.cast())
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr().cast())
                .surface(handle.surface.as_ptr().cast());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        (display, window) => {
            return Err(DeviceError::Surface(format!(
                "unsupported window handle pair {:?} / {:?}",
                display, window
            )))
        }
    };

    Ok(surface.context("Failed to create window surface")?)
}
