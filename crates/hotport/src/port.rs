//! Port handles: open communication channels bound to one device.
//!
//! A [`Port`] dispatches open/close/read/write/poll through a strategy
//! selected once, at open time, from the device type and the platform
//! (POSIX fd, Windows overlapped handle, or IOKit-backed HID). The port
//! holds a shared reference to its device for its own lifetime, so the
//! entity stays queryable even if the device is unplugged while open.
//!
//! A port's native resource and transfer state are not synchronized:
//! exactly one thread may drive a given port's I/O at a time. On Windows
//! the strategy additionally requires that reads are finalized and
//! cancelled on the thread that armed them.

use crate::device::{Device, DeviceStatus};
use crate::error::{Error, Result};
use crate::platform::{self, PollHandle};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Transfer direction(s) a port is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    Read,
    Write,
    ReadWrite,
}

impl PortMode {
    pub fn readable(&self) -> bool {
        matches!(self, PortMode::Read | PortMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, PortMode::Write | PortMode::ReadWrite)
    }
}

/// Number of data bits per serial character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Serial parity checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Number of serial stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopBits {
    One,
    Two,
}

/// Serial line parameters applied with [`Port::set_serial_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialConfig {
    /// 115200 8N1, the de facto default of the boards this crate serves.
    fn default() -> Self {
        SerialConfig {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

/// Platform transfer strategy behind a [`Port`].
///
/// Implementations translate native failures into the crate error taxonomy;
/// the `Port` wrapper takes care of propagating discovered disconnections
/// into the device entity.
pub(crate) trait RawPort: Send {
    /// Read up to `buf.len()` bytes. Returns `Ok(0)` when `timeout` elapsed
    /// with no data (`None` waits indefinitely).
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted
    /// before `timeout` elapsed.
    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize>;

    /// Waitable object signaled when data is available to read. `None` when
    /// the strategy has no OS-level handle to offer (IOKit report queues).
    fn poll_handle(&self) -> Option<PollHandle>;

    /// Apply serial line parameters. Strategies for non-serial devices
    /// reject this with `InvalidState`.
    fn set_serial_config(&mut self, _config: &SerialConfig) -> Result<()> {
        Err(Error::InvalidState("not a serial port"))
    }
}

/// An open communication channel bound to one device.
///
/// Dropping the port closes it: any in-flight read is cancelled and fully
/// resolved before the native resource is released. A port covers exactly
/// one open/close cycle; reopen the device to get a fresh one.
pub struct Port {
    device: Arc<Device>,
    mode: PortMode,
    raw: Box<dyn RawPort>,
}

impl Port {
    /// Open a port on `device`.
    ///
    /// Fails with `NotFound` if the device is not online. On success the
    /// port keeps the device entity alive for its own lifetime, even if the
    /// device is disconnected while open.
    pub fn open(device: &Arc<Device>, mode: PortMode) -> Result<Port> {
        if device.status() != DeviceStatus::Online {
            return Err(Error::NotFound(device.path().to_string()));
        }

        let raw = platform::open_port(device, mode)?;
        debug!("{}", device.describe("open"));
        Ok(Port {
            device: Arc::clone(device),
            mode,
            raw,
        })
    }

    /// The device this port is bound to.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn mode(&self) -> PortMode {
        self.mode
    }

    /// Waitable object signaled when data is available to read; integrate it
    /// into an external wait loop, then call [`Port::read`].
    pub fn poll_handle(&self) -> Option<PollHandle> {
        self.raw.poll_handle()
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when `timeout` elapsed without data; `NotFound` when
    /// the underlying resource reports disconnection, in which case the
    /// device entity is marked disconnected before returning.
    pub fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.mode.readable() {
            return Err(Error::InvalidState("port is not open for reading"));
        }
        let result = self.raw.read(buf, timeout);
        self.propagate_gone(result)
    }

    /// Write up to `buf.len()` bytes, returning how many were accepted
    /// before `timeout` elapsed. Disconnection reporting matches
    /// [`Port::read`].
    pub fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.mode.writable() {
            return Err(Error::InvalidState("port is not open for writing"));
        }
        let result = self.raw.write(buf, timeout);
        self.propagate_gone(result)
    }

    /// Apply serial line parameters to an open serial port.
    pub fn set_serial_config(&mut self, config: &SerialConfig) -> Result<()> {
        self.raw.set_serial_config(config)
    }

    /// Close the port, releasing the native resource. Equivalent to
    /// dropping it.
    pub fn close(self) {}

    fn propagate_gone(&self, result: Result<usize>) -> Result<usize> {
        if let Err(Error::NotFound(_)) = &result {
            // Let registry observers see the disconnect without waiting for
            // the next hotplug notification.
            self.device.mark_disconnected();
        }
        result
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        debug!("{}", self.device.describe("close"));
    }
}
