//! Platform backends and transfer strategies.
//!
//! One backend module exists per OS, selected at build time with `cfg`.
//! Each produces the same normalized [`DeviceInfo`](crate::DeviceInfo)
//! shape from its native device tree and supplies the matching
//! [`RawPort`](crate::port::RawPort) strategies.

use crate::device::{Device, DeviceType};
use crate::error::Result;
use crate::monitor::Backend;
use crate::port::{PortMode, RawPort};

#[cfg(unix)]
pub(crate) mod posix;

#[cfg(target_os = "linux")]
pub(crate) mod linux;

#[cfg(target_os = "macos")]
pub(crate) mod macos;

#[cfg(windows)]
pub(crate) mod windows;

/// OS-level waitable object usable in an external readiness-wait loop:
/// a file descriptor on Unix, an event handle on Windows.
#[cfg(unix)]
pub type PollHandle = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type PollHandle = std::os::windows::io::RawHandle;

/// The device-tree backend for the running platform.
pub(crate) fn default_backend() -> Result<Box<dyn Backend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::UdevBackend::new()?))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::IoKitBackend::new()?))
    }

    #[cfg(windows)]
    {
        Ok(Box::new(windows::SetupApiBackend::new()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        compile_error!("device enumeration is not implemented for this platform");
    }
}

/// Select and initialize the transfer strategy for `device`. The choice is
/// fixed for the lifetime of the returned port.
pub(crate) fn open_port(device: &Device, mode: PortMode) -> Result<Box<dyn RawPort>> {
    match device.device_type() {
        DeviceType::Serial => {
            #[cfg(unix)]
            {
                Ok(Box::new(posix::FilePort::open(device, mode)?))
            }
            #[cfg(windows)]
            {
                Ok(Box::new(windows::OverlappedPort::open(device, mode)?))
            }
        }
        DeviceType::Hid => {
            #[cfg(target_os = "linux")]
            {
                Ok(Box::new(posix::FilePort::open(device, mode)?))
            }
            #[cfg(target_os = "macos")]
            {
                Ok(Box::new(macos::IoKitHidPort::open(device, mode)?))
            }
            #[cfg(windows)]
            {
                Ok(Box::new(windows::OverlappedPort::open(device, mode)?))
            }
        }
    }
}
