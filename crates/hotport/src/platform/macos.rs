//! macOS backend: IOKit-backed HID access via hidapi, POSIX serial ports.
//!
//! HID enumeration and transfers go through `hidapi`, whose Darwin backend
//! registers an IOKit input-report callback at open time and queues reports
//! internally; `read` with a timeout blocks on that queue becoming
//! non-empty. Serial devices appear as `/dev/cu.*` call-out nodes and share
//! the POSIX fd strategy with Linux.
//!
//! There is no native hotplug socket to hand out without spawning an IOKit
//! run-loop thread, so the registry backend reports no poll handle and the
//! monitor falls back to re-enumerating on every refresh.

use crate::device::{Device, DeviceInfo, DeviceKey, DeviceType, HidInfo};
use crate::error::{Error, Result};
use crate::monitor::{Backend, TypeFilter};
use crate::platform::PollHandle;
use crate::port::{PortMode, RawPort};
use std::ffi::CString;
use std::time::Duration;
use tracing::warn;

pub(crate) struct IoKitBackend;

impl IoKitBackend {
    pub(crate) fn new() -> Result<IoKitBackend> {
        Ok(IoKitBackend)
    }
}

impl Backend for IoKitBackend {
    fn snapshot(&mut self, filter: TypeFilter) -> Result<Vec<DeviceInfo>> {
        let mut out = Vec::new();
        if filter.matches(DeviceType::Serial) {
            scan_serial_nodes(&mut out)?;
        }
        if filter.matches(DeviceType::Hid) {
            scan_hid_devices(&mut out)?;
        }
        Ok(out)
    }
}

/// Call-out serial nodes under /dev. The `cu.*` flavor is used because it
/// does not wait for carrier detect on open.
fn scan_serial_nodes(out: &mut Vec<DeviceInfo>) -> Result<()> {
    let entries = std::fs::read_dir("/dev").map_err(|err| Error::from_io("/dev", err))?;
    let mut nodes: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("cu."))
        .collect();
    nodes.sort();

    for name in nodes {
        out.push(DeviceInfo {
            key: DeviceKey::new(format!("serial-{name}")),
            device_type: DeviceType::Serial,
            location: name.clone(),
            path: format!("/dev/{name}"),
            // The IOKit registry walk that would recover USB identity for
            // call-out nodes is not wired up; vendor identity stays blank.
            vid: 0,
            pid: 0,
            manufacturer: None,
            product: None,
            serial_number: None,
            iface_number: 0,
            hid: None,
        });
    }
    Ok(())
}

fn scan_hid_devices(out: &mut Vec<DeviceInfo>) -> Result<()> {
    let api = hid_api()?;

    for dev in api.device_list() {
        let Some(path) = dev.path().to_str().ok().map(str::to_string) else {
            continue;
        };

        out.push(DeviceInfo {
            key: DeviceKey::new(format!("hid-{path}")),
            device_type: DeviceType::Hid,
            location: path.clone(),
            path,
            vid: dev.vendor_id(),
            pid: dev.product_id(),
            manufacturer: dev.manufacturer_string().map(str::to_string),
            product: dev.product_string().map(str::to_string),
            serial_number: dev.serial_number().map(str::to_string),
            iface_number: dev.interface_number().max(0) as u8,
            hid: Some(HidInfo {
                usage_page: dev.usage_page(),
                usage: dev.usage(),
                numbered_reports: false,
                max_report_len: 4096,
            }),
        });
    }
    Ok(())
}

fn hid_api() -> Result<hidapi::HidApi> {
    hidapi::HidApi::new().map_err(|err| Error::Io {
        path: "hidapi".to_string(),
        source: std::io::Error::other(err.to_string()),
    })
}

/// HID transfer strategy backed by hidapi's IOKit report queue.
pub(crate) struct IoKitHidPort {
    device: hidapi::HidDevice,
    path: String,
}

impl IoKitHidPort {
    pub(crate) fn open(device: &Device, _mode: PortMode) -> Result<IoKitHidPort> {
        let api = hid_api()?;
        let path = CString::new(device.path()).map_err(|_| {
            Error::InvalidState("device path contains an interior NUL")
        })?;
        let hid_device = api.open_path(&path).map_err(|err| {
            warn!("hidapi open failed for '{}': {err}", device.path());
            Error::NotFound(device.path().to_string())
        })?;
        Ok(IoKitHidPort {
            device: hid_device,
            path: device.path().to_string(),
        })
    }
}

impl RawPort for IoKitHidPort {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let ms = match timeout {
            None => -1,
            Some(duration) => duration.as_millis().min(i32::MAX as u128) as i32,
        };
        self.device
            .read_timeout(buf, ms)
            // hidapi reports a removed device as a plain error; disconnect
            // is by far the dominant failure once a report queue exists.
            .map_err(|_| Error::NotFound(self.path.clone()))
    }

    fn write(&mut self, buf: &[u8], _timeout: Option<Duration>) -> Result<usize> {
        self.device
            .write(buf)
            .map_err(|_| Error::NotFound(self.path.clone()))
    }

    fn poll_handle(&self) -> Option<PollHandle> {
        // The report queue lives inside hidapi; there is no fd to wait on.
        None
    }
}
