// Platform surface glue
//
// Builds the instance-extension list for the running display system and
// creates the VkSurfaceKHR from raw window/display handles.

use anyhow::Result;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::os::raw::c_char;

use super::VulkanDevice;

/// Surface extensions the instance must be created with for this display
/// system, to be passed into [`VulkanDevice::new`].
pub fn required_instance_extensions(display: RawDisplayHandle) -> Result<Vec<*const c_char>> {
    let mut extensions = vec![ash::extensions::khr::Surface::name().as_ptr()];

    match display {
        RawDisplayHandle::Windows(_) => {
            extensions.push(ash::extensions::khr::Win32Surface::name().as_ptr());
        }
        RawDisplayHandle::Xlib(_) => {
            extensions.push(ash::extensions::khr::XlibSurface::name().as_ptr());
        }
        RawDisplayHandle::Xcb(_) => {
            extensions.push(ash::extensions::khr::XcbSurface::name().as_ptr());
        }
        RawDisplayHandle::Wayland(_) => {
            extensions.push(ash::extensions::khr::WaylandSurface::name().as_ptr());
        }
        other => anyhow::bail!("Unsupported display system: {:?}", other),
    }

    Ok(extensions)
}

/// Create a presentation surface for the window behind the raw handles.
pub fn create_surface(
    device: &VulkanDevice,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let entry = device.entry();
    let instance = &device.instance;

    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            let loader = ash::extensions::khr::Win32Surface::new(entry, instance);
            unsafe { loader.create_win32_surface(&create_info, None)? }
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .map(|d| d.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy as *mut _)
                .window(handle.window);
            let loader = ash::extensions::khr::XlibSurface::new(entry, instance);
            unsafe { loader.create_xlib_surface(&create_info, None)? }
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .map(|c| c.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection as *mut _)
                .window(handle.window.get());
            let loader = ash::extensions::khr::XcbSurface::new(entry, instance);
            unsafe { loader.create_xcb_surface(&create_info, None)? }
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr() as *mut _)
                .surface(handle.surface.as_ptr() as *mut _);
            let loader = ash::extensions::khr::WaylandSurface::new(entry, instance);
            unsafe { loader.create_wayland_surface(&create_info, None)? }
        }
        (display, window) => {
            anyhow::bail!(
                "Mismatched or unsupported handle pair: {:?} / {:?}",
                display,
                window
            )
        }
    };

    Ok(surface)
}
