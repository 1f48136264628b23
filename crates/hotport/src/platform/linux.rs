//! Linux backend: udev device-tree walking and hotplug monitoring.
//!
//! Serial interfaces are discovered through the `tty` subsystem and HID
//! interfaces through `hidraw`; both are resolved to their parent USB
//! device and interface for identity, location, and descriptor strings.
//! Hotplug notifications come from a udev netlink monitor socket whose fd
//! is handed to the registry as its poll handle — draining it never blocks.
//!
//! HID usage metadata is not exported as sysfs attributes, so the report
//! descriptor is read from sysfs and scanned directly. The same scan feeds
//! the workaround for kernels before 2.6.34, whose hidraw reads mis-frame
//! the leading report-ID byte (see [`ReportShim`]).

use crate::device::{Device, DeviceInfo, DeviceKey, DeviceType, HidInfo};
use crate::error::{Error, Result};
use crate::monitor::{Backend, TypeFilter};
use crate::platform::PollHandle;
use std::os::fd::AsRawFd;
use tracing::{debug, warn};

/// Kernels older than this mis-frame hidraw reads for devices with
/// numbered reports.
const HIDRAW_FIX: (u32, u32, u32) = (2, 6, 34);

/// Scratch size used when the report descriptor does not pin down a
/// maximum input report length (hidraw caps reports at 4 KiB).
const DEFAULT_REPORT_LEN: usize = 4096;

pub(crate) struct UdevBackend {
    socket: Option<udev::MonitorSocket>,
}

impl UdevBackend {
    pub(crate) fn new() -> Result<Self> {
        Ok(UdevBackend { socket: None })
    }

    fn scan_subsystem(
        &self,
        subsystem: &str,
        device_type: DeviceType,
        out: &mut Vec<DeviceInfo>,
    ) -> Result<()> {
        let mut enumerator = udev::Enumerator::new().map_err(udev_err)?;
        enumerator.match_subsystem(subsystem).map_err(udev_err)?;

        for dev in enumerator.scan_devices().map_err(udev_err)? {
            match read_device(&dev, device_type) {
                Some(info) => out.push(info),
                // Non-USB nodes (virtual consoles, platform ttys) and nodes
                // that vanished mid-walk are simply skipped.
                None => continue,
            }
        }
        Ok(())
    }
}

impl Backend for UdevBackend {
    fn snapshot(&mut self, filter: TypeFilter) -> Result<Vec<DeviceInfo>> {
        let mut out = Vec::new();
        if filter.matches(DeviceType::Serial) {
            self.scan_subsystem("tty", DeviceType::Serial, &mut out)?;
        }
        if filter.matches(DeviceType::Hid) {
            self.scan_subsystem("hidraw", DeviceType::Hid, &mut out)?;
        }
        Ok(out)
    }

    fn watch(&mut self) -> Result<()> {
        let socket = udev::MonitorBuilder::new()
            .and_then(|builder| builder.match_subsystem("tty"))
            .and_then(|builder| builder.match_subsystem("hidraw"))
            .and_then(|builder| builder.listen())
            .map_err(udev_err)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn unwatch(&mut self) {
        self.socket = None;
    }

    fn poll_handle(&self) -> Option<PollHandle> {
        self.socket.as_ref().map(|socket| socket.as_raw_fd())
    }

    fn drain_notifications(&mut self) -> Result<bool> {
        let Some(socket) = self.socket.as_ref() else {
            // No subscription: assume the tree may have changed.
            return Ok(true);
        };

        let mut changed = false;
        for event in socket.iter() {
            debug!(
                "udev {:?} event for {}",
                event.event_type(),
                event.syspath().display()
            );
            changed = true;
        }
        Ok(changed)
    }
}

fn udev_err(err: std::io::Error) -> Error {
    Error::from_io("udev", err)
}

/// Resolve one tty/hidraw node to a normalized descriptor record.
///
/// Returns `None` for nodes that are not backed by a USB device.
fn read_device(dev: &udev::Device, device_type: DeviceType) -> Option<DeviceInfo> {
    let node = dev.devnode()?.to_str()?.to_string();

    let usb_dev = dev.parent_with_subsystem_devtype("usb", "usb_device").ok()??;
    let iface = dev.parent_with_subsystem_devtype("usb", "usb_interface").ok()??;

    // The usb_device sysname is the stable port chain, e.g. "1-1.2".
    let port_chain = usb_dev.sysname().to_str()?.to_string();
    let location = format!("usb-{port_chain}");

    let vid = attr_hex16(&usb_dev, "idVendor")?;
    let pid = attr_hex16(&usb_dev, "idProduct")?;
    let iface_number = attr_hex16(&iface, "bInterfaceNumber").unwrap_or(0) as u8;

    let hid = match device_type {
        DeviceType::Serial => None,
        DeviceType::Hid => Some(read_hid_info(dev)),
    };

    Some(DeviceInfo {
        key: DeviceKey::new(format!("{location}:{iface_number}")),
        device_type,
        location,
        path: node,
        vid,
        pid,
        manufacturer: attr_string(&usb_dev, "manufacturer"),
        product: attr_string(&usb_dev, "product"),
        serial_number: attr_string(&usb_dev, "serial"),
        iface_number,
        hid,
    })
}

fn attr_string(dev: &udev::Device, name: &str) -> Option<String> {
    dev.attribute_value(name)
        .and_then(|value| value.to_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn attr_hex16(dev: &udev::Device, name: &str) -> Option<u16> {
    let value = dev.attribute_value(name)?.to_str()?;
    u16::from_str_radix(value.trim(), 16).ok()
}

/// HID usage metadata, scanned from the sysfs report descriptor.
fn read_hid_info(dev: &udev::Device) -> HidInfo {
    let descriptor = dev
        .parent()
        .map(|hid| hid.syspath().join("report_descriptor"))
        .and_then(|path| std::fs::read(path).ok());

    match descriptor {
        Some(bytes) => {
            let scan = scan_report_descriptor(&bytes);
            HidInfo {
                usage_page: scan.usage_page,
                usage: scan.usage,
                numbered_reports: scan.has_report_ids,
                max_report_len: if scan.max_input_len > 0 {
                    scan.max_input_len
                } else {
                    DEFAULT_REPORT_LEN
                },
            }
        }
        None => {
            warn!(
                "cannot read report descriptor for {}",
                dev.syspath().display()
            );
            HidInfo {
                usage_page: 0,
                usage: 0,
                numbered_reports: false,
                max_report_len: DEFAULT_REPORT_LEN,
            }
        }
    }
}

/// Summary of a HID report descriptor scan.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct DescriptorScan {
    /// First top-level usage page.
    pub usage_page: u16,
    /// First top-level usage.
    pub usage: u16,
    /// Whether any Report ID item is present.
    pub has_report_ids: bool,
    /// Largest input report in bytes, excluding the report-ID prefix.
    pub max_input_len: usize,
}

/// Walk the short items of a HID report descriptor.
///
/// Only the pieces the crate needs are extracted: the first usage
/// page/usage pair (the top-level application usage), whether reports are
/// numbered, and the widest input report.
pub(crate) fn scan_report_descriptor(desc: &[u8]) -> DescriptorScan {
    let mut scan = DescriptorScan::default();

    let mut report_size: u32 = 0;
    let mut report_count: u32 = 0;
    let mut input_bits: u32 = 0;
    let mut max_input_bits: u32 = 0;
    let mut top_usage_seen = false;

    let mut pos = 0;
    while pos < desc.len() {
        let prefix = desc[pos];
        pos += 1;

        // Long items (0xfe) carry their size in the next byte; none of the
        // fields we care about use them.
        if prefix == 0xfe {
            if pos >= desc.len() {
                break;
            }
            let size = desc[pos] as usize;
            pos += 2 + size;
            continue;
        }

        let size = match prefix & 0x03 {
            3 => 4,
            s => s as usize,
        };
        if pos + size > desc.len() {
            break;
        }
        let mut value: u32 = 0;
        for (i, byte) in desc[pos..pos + size].iter().enumerate() {
            value |= (*byte as u32) << (8 * i);
        }
        pos += size;

        match prefix & 0xfc {
            // Global: Usage Page
            0x04 => {
                if !top_usage_seen {
                    scan.usage_page = value as u16;
                }
            }
            // Local: Usage
            0x08 => {
                if !top_usage_seen {
                    scan.usage = value as u16;
                }
            }
            // Main: Collection — the first one closes the top-level pair
            0xa0 => top_usage_seen = true,
            // Global: Report Size
            0x74 => report_size = value,
            // Global: Report Count
            0x94 => report_count = value,
            // Global: Report ID
            0x84 => {
                scan.has_report_ids = true;
                // A new report starts; bank the previous one.
                max_input_bits = max_input_bits.max(input_bits);
                input_bits = 0;
            }
            // Main: Input
            0x80 => input_bits += report_size * report_count,
            _ => {}
        }
    }
    max_input_bits = max_input_bits.max(input_bits);

    scan.max_input_len = max_input_bits.div_ceil(8) as usize;
    scan
}

/// Parse "major.minor.patch" out of a kernel release string.
fn parse_kernel_release(release: &str) -> Option<(u32, u32, u32)> {
    let numeric: String = release
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor, patch))
}

fn kernel_older_than(release: &str, target: (u32, u32, u32)) -> bool {
    match parse_kernel_release(release) {
        Some(version) => version < target,
        None => false,
    }
}

/// Whether the running kernel needs the hidraw report-framing workaround.
fn hidraw_quirk_active() -> bool {
    static ACTIVE: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *ACTIVE.get_or_init(|| {
        let release = std::fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
        kernel_older_than(release.trim(), HIDRAW_FIX)
    })
}

/// Compatibility shim for pre-2.6.34 hidraw reads.
///
/// Those kernels deliver every input report with a leading report-ID byte,
/// even for devices that do not number their reports — where that byte is a
/// bogus zero that must be stripped before the caller sees the data. Reads
/// land in a scratch buffer sized to the device's maximum report plus the
/// prefix byte; each fill is consumed by exactly one read call.
pub(crate) struct ReportShim {
    numbered: bool,
    scratch: Vec<u8>,
}

impl ReportShim {
    /// Arm a shim for `device` when the kernel quirk applies.
    pub(crate) fn for_device(device: &Device) -> Option<ReportShim> {
        let hid = device.hid()?;
        if !hidraw_quirk_active() {
            return None;
        }
        debug!(
            "arming legacy hidraw framing workaround for '{}'",
            device.key()
        );
        Some(ReportShim::new(hid.numbered_reports, hid.max_report_len))
    }

    fn new(numbered: bool, max_report_len: usize) -> ReportShim {
        ReportShim {
            numbered,
            scratch: vec![0u8; max_report_len.max(1) + 1],
        }
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut [u8] {
        &mut self.scratch
    }

    /// Copy the `filled` bytes of the last raw read into `out`, fixing the
    /// framing. Returns the number of bytes produced.
    pub(crate) fn normalize(&self, filled: usize, out: &mut [u8]) -> usize {
        let filled = filled.min(self.scratch.len());
        let report = if self.numbered {
            // Numbered devices: the prefix byte is the real report ID.
            &self.scratch[..filled]
        } else {
            // Unnumbered devices: strip the bogus zero prefix.
            &self.scratch[1..filled.max(1)]
        };
        let n = report.len().min(out.len());
        out[..n].copy_from_slice(&report[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Abridged descriptor of a vendor-defined device with one numbered
    /// 64-byte input report (Report ID 1).
    const NUMBERED_DESC: &[u8] = &[
        0x06, 0x9c, 0xff, // Usage Page (0xff9c)
        0x09, 0x24, //       Usage (0x24)
        0xa1, 0x01, //       Collection (Application)
        0x85, 0x01, //         Report ID (1)
        0x75, 0x08, //         Report Size (8)
        0x95, 0x40, //         Report Count (64)
        0x09, 0x01, //         Usage (1)
        0x81, 0x02, //         Input (Data, Var, Abs)
        0xc0, //             End Collection
    ];

    /// Boot-keyboard style descriptor without report IDs: one 8-byte
    /// modifier/key input report.
    const UNNUMBERED_DESC: &[u8] = &[
        0x05, 0x01, // Usage Page (Generic Desktop)
        0x09, 0x06, // Usage (Keyboard)
        0xa1, 0x01, // Collection (Application)
        0x75, 0x08, //   Report Size (8)
        0x95, 0x08, //   Report Count (8)
        0x81, 0x00, //   Input (Data, Array)
        0xc0, //       End Collection
    ];

    #[test]
    fn test_scan_numbered_descriptor() {
        let scan = scan_report_descriptor(NUMBERED_DESC);
        assert_eq!(scan.usage_page, 0xff9c);
        assert_eq!(scan.usage, 0x24);
        assert!(scan.has_report_ids);
        assert_eq!(scan.max_input_len, 64);
    }

    #[test]
    fn test_scan_unnumbered_descriptor() {
        let scan = scan_report_descriptor(UNNUMBERED_DESC);
        assert_eq!(scan.usage_page, 0x01);
        assert_eq!(scan.usage, 0x06);
        assert!(!scan.has_report_ids);
        assert_eq!(scan.max_input_len, 8);
    }

    #[test]
    fn test_scan_ignores_nested_usages() {
        // The usage pair must come from the top level, not from items
        // inside the collection.
        let scan = scan_report_descriptor(NUMBERED_DESC);
        assert_eq!(scan.usage, 0x24);
    }

    #[test]
    fn test_scan_truncated_descriptor() {
        // A descriptor cut mid-item must not panic or loop.
        let scan = scan_report_descriptor(&NUMBERED_DESC[..5]);
        assert_eq!(scan.usage_page, 0xff9c);
    }

    #[test]
    fn test_kernel_release_parsing() {
        assert_eq!(parse_kernel_release("6.8.0-41-generic"), Some((6, 8, 0)));
        assert_eq!(parse_kernel_release("2.6.33"), Some((2, 6, 33)));
        assert_eq!(parse_kernel_release("4.4.0"), Some((4, 4, 0)));
        assert_eq!(parse_kernel_release("garbage"), None);
    }

    #[test]
    fn test_kernel_quirk_gate() {
        assert!(kernel_older_than("2.6.33-rc1", HIDRAW_FIX));
        assert!(kernel_older_than("2.5.99", HIDRAW_FIX));
        assert!(!kernel_older_than("2.6.34", HIDRAW_FIX));
        assert!(!kernel_older_than("6.8.0-41-generic", HIDRAW_FIX));
        // Unparseable release: assume a modern kernel.
        assert!(!kernel_older_than("", HIDRAW_FIX));
    }

    #[test]
    fn test_shim_strips_bogus_prefix_for_unnumbered() {
        let mut shim = ReportShim::new(false, 8);
        let raw = [0x00, 0xaa, 0xbb, 0xcc];
        shim.scratch_mut()[..raw.len()].copy_from_slice(&raw);

        let mut out = [0u8; 8];
        let n = shim.normalize(raw.len(), &mut out);
        assert_eq!(&out[..n], &[0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_shim_passes_through_numbered() {
        let mut shim = ReportShim::new(true, 8);
        let raw = [0x01, 0xaa, 0xbb];
        shim.scratch_mut()[..raw.len()].copy_from_slice(&raw);

        let mut out = [0u8; 8];
        let n = shim.normalize(raw.len(), &mut out);
        assert_eq!(&out[..n], &[0x01, 0xaa, 0xbb]);
    }

    #[test]
    fn test_shim_truncates_to_caller_buffer() {
        let mut shim = ReportShim::new(true, 8);
        let raw = [0x01, 0xaa, 0xbb, 0xcc];
        shim.scratch_mut()[..raw.len()].copy_from_slice(&raw);

        let mut out = [0u8; 2];
        let n = shim.normalize(raw.len(), &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out, &[0x01, 0xaa]);
    }
}
