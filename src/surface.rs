// Surface provider - the window the device presents into
//
// The device only needs raw window/display handles to create a surface and
// the current drawable size to size the swapchain.

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle {
    /// Drawable size in physical pixels. (0, 0) while minimized.
    fn drawable_size(&self) -> (u32, u32);
}

impl SurfaceProvider for winit::window::Window {
    fn drawable_size(&self) -> (u32, u32) {
        let size = self.inner_size();
        (size.width, size.height)
    }
}
