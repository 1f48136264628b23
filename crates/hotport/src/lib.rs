//! Hotplug-aware discovery and port I/O for USB serial and HID devices.
//!
//! This crate is the foundation layer beneath board-management and
//! firmware-flashing tooling: it answers "what devices exist right now and
//! when does that change", then hands out a readable/writable channel to a
//! specific device. Three native device models (Windows overlapped I/O,
//! POSIX file descriptors, IOKit HID) sit behind one lifecycle-safe,
//! reference-counted abstraction.
//!
//! No threads are spawned: enumeration, reconciliation, and transfers run
//! on the calling thread, and asynchrony is expressed through OS-level
//! waitable handles the caller plugs into its own event loop.
//!
//! # Example
//!
//! ```no_run
//! use hotport::{Monitor, Port, PortMode, TypeFilter};
//! use std::time::Duration;
//!
//! # fn main() -> hotport::Result<()> {
//! let mut monitor = Monitor::new(TypeFilter::Any)?;
//! monitor.start_watch()?;
//!
//! for device in monitor.devices() {
//!     println!("{}", device.describe("found"));
//! }
//!
//! // Wait on monitor.poll_handle() in your own event loop, then:
//! monitor.refresh()?;
//! while let Some(event) = monitor.next_event() {
//!     println!("{}", event.device().describe("changed"));
//! }
//!
//! if let Some(device) = monitor.devices().next() {
//!     let mut port = Port::open(device, PortMode::ReadWrite)?;
//!     let mut buf = [0u8; 64];
//!     let n = port.read(&mut buf, Some(Duration::from_millis(500)))?;
//!     println!("read {n} bytes");
//! }
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod monitor;
pub mod port;
pub(crate) mod platform;

pub use device::{Device, DeviceInfo, DeviceKey, DeviceStatus, DeviceType, HidInfo};
pub use error::{Error, Result};
pub use monitor::{Backend, Monitor, MonitorEvent, TypeFilter, enumerate, enumerate_with};
pub use platform::PollHandle;
pub use port::{DataBits, Parity, Port, PortMode, SerialConfig, StopBits};
