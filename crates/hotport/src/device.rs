//! Device descriptors and the shared device entity.
//!
//! A [`DeviceInfo`] is the normalized record every platform backend produces
//! when it walks the native device tree. The registry wraps it into a
//! [`Device`] entity that adds the connectivity status and is shared as
//! `Arc<Device>`: the registry keeps the canonical strong reference, open
//! ports and external consumers hold clones. All descriptor fields are
//! immutable after creation; only the status moves, and only through the
//! registry or a port that discovered the disconnection first-hand.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Kind of communication endpoint a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// USB CDC-ACM or vendor serial interface, exposed as a tty/COM node.
    Serial,
    /// USB HID interface, exposed as a raw HID node.
    Hid,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Serial => write!(f, "serial"),
            DeviceType::Hid => write!(f, "HID"),
        }
    }
}

/// Connectivity state of a tracked device.
///
/// `Disconnected` entities stay valid to query for as long as anyone holds a
/// reference; all I/O against them fails with `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum DeviceStatus {
    Online = 0,
    Disconnected = 1,
}

/// Stable device identity derived from bus topology.
///
/// The key survives a disconnect/reconnect of the same physical port, which
/// is what lets the registry recognize "the same device came back". It is
/// never derived from transient OS names like `ttyACM0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        DeviceKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HID-specific descriptor data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HidInfo {
    /// Top-level HID usage page.
    pub usage_page: u16,
    /// Top-level HID usage.
    pub usage: u16,
    /// Whether the device uses numbered reports. Needed to work around a
    /// report-framing bug in old Linux kernels (see the Linux backend).
    pub numbered_reports: bool,
    /// Largest input report in bytes, excluding the report ID prefix.
    pub max_report_len: usize,
}

/// Normalized descriptor of one discovered device.
///
/// Every platform backend returns the same shape regardless of how the
/// native device tree encodes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stable identity key (see [`DeviceKey`]).
    pub key: DeviceKey,
    /// Serial or HID.
    pub device_type: DeviceType,
    /// Physical bus location, e.g. `usb-1-1.2`.
    pub location: String,
    /// Node used to open the device, e.g. `/dev/ttyACM0` or a Win32 device
    /// interface path.
    pub path: String,
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// USB manufacturer string, if the device reports one.
    pub manufacturer: Option<String>,
    /// USB product string, if the device reports one.
    pub product: Option<String>,
    /// USB serial number string, if the device reports one.
    pub serial_number: Option<String>,
    /// USB interface number this endpoint belongs to.
    pub iface_number: u8,
    /// Present for HID devices only.
    pub hid: Option<HidInfo>,
}

/// A tracked device entity.
///
/// Created by the registry (or by one-shot enumeration) and handed out as
/// `Arc<Device>`. The entity outlives physical disconnection for as long as
/// references exist; it is deallocated exactly once, when the last reference
/// drops.
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    status: AtomicU8,
}

impl Device {
    pub(crate) fn new(info: DeviceInfo, status: DeviceStatus) -> Arc<Device> {
        Arc::new(Device {
            info,
            status: AtomicU8::new(status as u8),
        })
    }

    pub fn key(&self) -> &DeviceKey {
        &self.info.key
    }

    pub fn device_type(&self) -> DeviceType {
        self.info.device_type
    }

    pub fn status(&self) -> DeviceStatus {
        match self.status.load(Ordering::Acquire) {
            0 => DeviceStatus::Online,
            _ => DeviceStatus::Disconnected,
        }
    }

    pub fn location(&self) -> &str {
        &self.info.location
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn vid(&self) -> u16 {
        self.info.vid
    }

    pub fn pid(&self) -> u16 {
        self.info.pid
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.info.manufacturer.as_deref()
    }

    pub fn product(&self) -> Option<&str> {
        self.info.product.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.info.serial_number.as_deref()
    }

    pub fn iface_number(&self) -> u8 {
        self.info.iface_number
    }

    pub fn hid(&self) -> Option<&HidInfo> {
        self.info.hid.as_ref()
    }

    /// Full descriptor record, e.g. for serialization.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Whether this entity's observable fields match a fresh backend record.
    ///
    /// Used during reconciliation to decide between "unchanged", "revive in
    /// place" and "replace under the same key".
    pub(crate) fn info_matches(&self, other: &DeviceInfo) -> bool {
        self.info == *other
    }

    pub(crate) fn set_status(&self, status: DeviceStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Record that I/O or reconciliation found the device gone.
    pub(crate) fn mark_disconnected(&self) {
        self.set_status(DeviceStatus::Disconnected);
    }

    /// One diagnostic line summarizing the device, prefixed with `verb`
    /// ("add", "remove", "open", ...). Emitted through `tracing` by the
    /// registry on every transition.
    pub fn describe(&self, verb: &str) -> String {
        fn or_none(s: Option<&str>) -> &str {
            s.unwrap_or("(none)")
        }

        let mut line = format!(
            "{} {} device '{}' on iface {}: vid:pid {:04x}:{:04x} at {}, node {}, \
             manufacturer={}, product={}, serial={}",
            verb,
            self.device_type(),
            self.key(),
            self.iface_number(),
            self.vid(),
            self.pid(),
            self.location(),
            self.path(),
            or_none(self.manufacturer()),
            or_none(self.product()),
            or_none(self.serial_number()),
        );
        if let Some(hid) = self.hid() {
            line.push_str(&format!(
                ", usage page {:#06x}, usage {:#06x}",
                hid.usage_page, hid.usage
            ));
        }
        line
    }
}
