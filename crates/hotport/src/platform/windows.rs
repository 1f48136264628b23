//! Windows backend: SetupAPI enumeration and overlapped-I/O ports.
//!
//! Devices are discovered by walking the COM-port and HID device-interface
//! classes; identity comes from the device instance ID, which Windows keeps
//! stable across replugs of the same physical port. There is no hotplug
//! notification source here — a message pump would need an internal thread,
//! which this subsystem does not spawn — so the registry backend reports no
//! poll handle and relies on the periodic re-enumeration fallback.
//!
//! Transfers use a single outstanding overlapped read per port, armed at
//! open time so the read event doubles as the data-available poll handle.
//! Finalizing or cancelling that read must happen on the thread that armed
//! it; the state machine enforces this instead of hanging.

use crate::device::{Device, DeviceInfo, DeviceKey, DeviceType, HidInfo};
use crate::error::{Error, Result};
use crate::monitor::{Backend, TypeFilter};
use crate::platform::PollHandle;
use crate::port::{DataBits, Parity, PortMode, RawPort, SerialConfig, StopBits};
use std::ptr::{null, null_mut};
use std::time::Duration;
use tracing::{debug, warn};
use windows_sys::Win32::Devices::Communication::{
    COMMTIMEOUTS, DCB, EVENPARITY, GetCommState, NOPARITY, ODDPARITY, ONESTOPBIT, SetCommState,
    SetCommTimeouts, TWOSTOPBITS,
};
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO, SP_DEVICE_INTERFACE_DATA,
    SP_DEVICE_INTERFACE_DETAIL_DATA_W, SP_DEVINFO_DATA, SetupDiDestroyDeviceInfoList,
    SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW, SetupDiGetDeviceInstanceIdW,
    SetupDiGetDeviceInterfaceDetailW,
};
use windows_sys::Win32::Devices::HumanInterfaceDevice::{
    HIDD_ATTRIBUTES, HIDP_CAPS, HidD_FreePreparsedData, HidD_GetAttributes, HidD_GetHidGuid,
    HidD_GetManufacturerString, HidD_GetPreparsedData, HidD_GetProductString,
    HidD_GetSerialNumberString, HidP_GetCaps,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_DEVICE_NOT_CONNECTED, ERROR_FILE_NOT_FOUND,
    ERROR_GEN_FAILURE, ERROR_IO_PENDING, ERROR_OPERATION_ABORTED, GENERIC_READ, GENERIC_WRITE,
    GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, ReadFile,
    WriteFile,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{
    CreateEventW, GetCurrentThreadId, INFINITE, ResetEvent, WaitForSingleObject,
};
use windows_sys::core::GUID;

/// {86E0D1E0-8089-11D0-9CE4-08003E301F73}, the serial-port interface class.
const GUID_DEVINTERFACE_COMPORT: GUID = GUID {
    data1: 0x86e0_d1e0,
    data2: 0x8089,
    data3: 0x11d0,
    data4: [0x9c, 0xe4, 0x08, 0x00, 0x3e, 0x30, 0x1f, 0x73],
};

const HIDP_STATUS_SUCCESS: i32 = 0x0011_0000;

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn from_wide(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

fn win_error(path: &str, code: u32) -> Error {
    match code {
        ERROR_FILE_NOT_FOUND | ERROR_DEVICE_NOT_CONNECTED | ERROR_GEN_FAILURE => {
            Error::NotFound(path.to_string())
        }
        ERROR_ACCESS_DENIED => Error::AccessDenied(path.to_string()),
        _ => Error::Io {
            path: path.to_string(),
            source: std::io::Error::from_raw_os_error(code as i32),
        },
    }
}

fn last_error(path: &str) -> Error {
    win_error(path, unsafe { GetLastError() })
}

pub(crate) struct SetupApiBackend;

impl SetupApiBackend {
    pub(crate) fn new() -> SetupApiBackend {
        SetupApiBackend
    }
}

impl Backend for SetupApiBackend {
    fn snapshot(&mut self, filter: TypeFilter) -> Result<Vec<DeviceInfo>> {
        let mut out = Vec::new();
        if filter.matches(DeviceType::Serial) {
            scan_interface_class(&GUID_DEVINTERFACE_COMPORT, DeviceType::Serial, &mut out)?;
        }
        if filter.matches(DeviceType::Hid) {
            let mut hid_guid: GUID = unsafe { std::mem::zeroed() };
            unsafe { HidD_GetHidGuid(&mut hid_guid) };
            scan_interface_class(&hid_guid, DeviceType::Hid, &mut out)?;
        }
        Ok(out)
    }

    // Default watch/drain/poll_handle: no native notification source, the
    // monitor re-enumerates on every refresh.
}

/// Walk one device-interface class and append a record per USB member.
fn scan_interface_class(
    guid: &GUID,
    device_type: DeviceType,
    out: &mut Vec<DeviceInfo>,
) -> Result<()> {
    unsafe {
        let devinfo: HDEVINFO =
            SetupDiGetClassDevsW(guid, null(), null_mut(), DIGCF_PRESENT | DIGCF_DEVICEINTERFACE);
        if devinfo == INVALID_HANDLE_VALUE {
            return Err(last_error("SetupDiGetClassDevs"));
        }

        let mut index = 0;
        loop {
            let mut iface_data: SP_DEVICE_INTERFACE_DATA = std::mem::zeroed();
            iface_data.cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
            if SetupDiEnumDeviceInterfaces(devinfo, null(), guid, index, &mut iface_data) == 0 {
                break;
            }
            index += 1;

            // First call sizes the detail buffer, second fills it.
            let mut required = 0u32;
            SetupDiGetDeviceInterfaceDetailW(
                devinfo,
                &iface_data,
                null_mut(),
                0,
                &mut required,
                null_mut(),
            );
            if required < std::mem::size_of::<u32>() as u32 {
                continue;
            }
            let mut detail = vec![0u8; required as usize];
            let detail_ptr = detail.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
            (*detail_ptr).cbSize =
                std::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            let mut devinfo_data: SP_DEVINFO_DATA = std::mem::zeroed();
            devinfo_data.cbSize = std::mem::size_of::<SP_DEVINFO_DATA>() as u32;
            if SetupDiGetDeviceInterfaceDetailW(
                devinfo,
                &iface_data,
                detail_ptr,
                required,
                null_mut(),
                &mut devinfo_data,
            ) == 0
            {
                continue;
            }

            let path_ptr = std::ptr::addr_of!((*detail_ptr).DevicePath) as *const u16;
            let path_len = (required as usize - std::mem::size_of::<u32>()) / 2;
            let path = from_wide(std::slice::from_raw_parts(path_ptr, path_len));

            let mut id_buf = [0u16; 512];
            if SetupDiGetDeviceInstanceIdW(
                devinfo,
                &devinfo_data,
                id_buf.as_mut_ptr(),
                id_buf.len() as u32,
                null_mut(),
            ) == 0
            {
                continue;
            }
            let instance_id = from_wide(&id_buf);

            match read_device(&path, &instance_id, device_type) {
                Some(info) => out.push(info),
                None => debug!("skipping non-USB interface '{instance_id}'"),
            }
        }

        SetupDiDestroyDeviceInfoList(devinfo);
    }
    Ok(())
}

/// Build a normalized record from the interface path and instance ID.
fn read_device(path: &str, instance_id: &str, device_type: DeviceType) -> Option<DeviceInfo> {
    let parsed = parse_instance_id(instance_id)?;

    let mut info = DeviceInfo {
        key: DeviceKey::new(instance_id.to_ascii_uppercase()),
        device_type,
        location: parsed.location,
        path: path.to_string(),
        vid: parsed.vid,
        pid: parsed.pid,
        manufacturer: None,
        product: None,
        serial_number: parsed.serial_number,
        iface_number: parsed.iface_number,
        hid: None,
    };

    if device_type == DeviceType::Hid {
        // Attributes, strings, and caps come from the node itself.
        if let Err(code) = fill_hid_details(&mut info) {
            warn!("cannot query HID details for '{instance_id}': error {code}");
            info.hid = Some(HidInfo {
                usage_page: 0,
                usage: 0,
                numbered_reports: false,
                max_report_len: 4096,
            });
        }
    }

    Some(info)
}

struct ParsedInstanceId {
    vid: u16,
    pid: u16,
    iface_number: u8,
    serial_number: Option<String>,
    location: String,
}

/// Parse `USB\VID_16C0&PID_0486&MI_00\SERIAL-OR-PORT-ID` style instance IDs.
///
/// The trailing segment is the device serial number when the device reports
/// one; otherwise Windows synthesizes a hub/port identifier containing `&`,
/// which is exactly what makes the whole ID stable per physical port.
fn parse_instance_id(instance_id: &str) -> Option<ParsedInstanceId> {
    let mut segments = instance_id.split('\\');
    let bus = segments.next()?;
    if !bus.eq_ignore_ascii_case("usb") && !bus.eq_ignore_ascii_case("hid") {
        return None;
    }
    let hardware = segments.next()?;
    let tail = segments.next().unwrap_or("");

    let mut vid = None;
    let mut pid = None;
    let mut iface_number = 0u8;
    for part in hardware.split('&') {
        let upper = part.to_ascii_uppercase();
        if let Some(value) = upper.strip_prefix("VID_") {
            vid = u16::from_str_radix(value, 16).ok();
        } else if let Some(value) = upper.strip_prefix("PID_") {
            pid = u16::from_str_radix(value, 16).ok();
        } else if let Some(value) = upper.strip_prefix("MI_") {
            iface_number = u8::from_str_radix(value, 16).ok().unwrap_or(0);
        }
    }

    let serial_number = if !tail.is_empty() && !tail.contains('&') {
        Some(tail.to_string())
    } else {
        None
    };

    Some(ParsedInstanceId {
        vid: vid?,
        pid: pid?,
        iface_number,
        serial_number,
        location: format!("usb-{}", tail.to_ascii_lowercase()),
    })
}

/// Query vid/pid, strings, usage, and report sizes from an open HID node.
fn fill_hid_details(info: &mut DeviceInfo) -> std::result::Result<(), u32> {
    unsafe {
        let path_w = to_wide(&info.path);
        // Access 0: query device metadata without claiming the interface.
        let handle = CreateFileW(
            path_w.as_ptr(),
            0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            null(),
            OPEN_EXISTING,
            0,
            null_mut(),
        );
        if handle == INVALID_HANDLE_VALUE {
            return Err(GetLastError());
        }

        let mut attributes: HIDD_ATTRIBUTES = std::mem::zeroed();
        attributes.Size = std::mem::size_of::<HIDD_ATTRIBUTES>() as u32;
        if HidD_GetAttributes(handle, &mut attributes) != 0 {
            info.vid = attributes.VendorID;
            info.pid = attributes.ProductID;
        }

        let mut buf = [0u16; 256];
        if HidD_GetManufacturerString(handle, buf.as_mut_ptr() as _, (buf.len() * 2) as u32) != 0 {
            let s = from_wide(&buf);
            if !s.is_empty() {
                info.manufacturer = Some(s);
            }
        }
        if HidD_GetProductString(handle, buf.as_mut_ptr() as _, (buf.len() * 2) as u32) != 0 {
            let s = from_wide(&buf);
            if !s.is_empty() {
                info.product = Some(s);
            }
        }
        if HidD_GetSerialNumberString(handle, buf.as_mut_ptr() as _, (buf.len() * 2) as u32) != 0 {
            let s = from_wide(&buf);
            if !s.is_empty() {
                info.serial_number = Some(s);
            }
        }

        let mut hid = HidInfo {
            usage_page: 0,
            usage: 0,
            numbered_reports: false,
            max_report_len: 4096,
        };
        let mut preparsed: isize = 0;
        if HidD_GetPreparsedData(handle, &mut preparsed) != 0 {
            let mut caps: HIDP_CAPS = std::mem::zeroed();
            if HidP_GetCaps(preparsed, &mut caps) == HIDP_STATUS_SUCCESS {
                hid.usage_page = caps.UsagePage;
                hid.usage = caps.Usage;
                // InputReportByteLength includes the report-ID prefix byte.
                hid.max_report_len = (caps.InputReportByteLength as usize).saturating_sub(1).max(1);
            }
            HidD_FreePreparsedData(preparsed);
        }
        info.hid = Some(hid);

        CloseHandle(handle);
        Ok(())
    }
}

/// Overlapped-I/O transfer strategy for serial and HID nodes.
///
/// At most one read is in flight at a time. The pending read is armed at
/// open (and re-armed whenever its buffer drains), so the read event is
/// signaled exactly when data is available — which is what makes it usable
/// as the port's poll handle. A read that times out stays pending; the
/// bytes the kernel has already placed in the buffer are picked up by the
/// next call.
pub(crate) struct OverlappedPort {
    handle: HANDLE,
    path: String,
    hid: bool,
    readable: bool,
    read_ov: Box<OVERLAPPED>,
    read_buf: Box<[u8]>,
    read_start: usize,
    read_len: usize,
    read_pending: bool,
    /// Thread that armed the pending read. Finalization and cancellation
    /// must happen there; this is a native overlapped-I/O contract, not a
    /// choice.
    read_thread: u32,
    write_ov: Box<OVERLAPPED>,
}

// HANDLEs are plain kernel object references; the raw pointers in OVERLAPPED
// are owned by this struct and only dereferenced by its own methods.
unsafe impl Send for OverlappedPort {}

impl OverlappedPort {
    pub(crate) fn open(device: &Device, mode: PortMode) -> Result<OverlappedPort> {
        let path_w = to_wide(device.path());
        let mut access = 0u32;
        if mode.readable() {
            access |= GENERIC_READ;
        }
        if mode.writable() {
            access |= GENERIC_WRITE;
        }

        let handle = unsafe {
            CreateFileW(
                path_w.as_ptr(),
                access,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(last_error(device.path()));
        }

        let hid = device.device_type() == DeviceType::Hid;
        if !hid {
            // Make a pending overlapped read complete as soon as at least
            // one byte is buffered; our own waits bound the time.
            let timeouts = COMMTIMEOUTS {
                ReadIntervalTimeout: u32::MAX,
                ReadTotalTimeoutMultiplier: u32::MAX,
                ReadTotalTimeoutConstant: u32::MAX - 1,
                WriteTotalTimeoutMultiplier: 0,
                WriteTotalTimeoutConstant: 0,
            };
            unsafe { SetCommTimeouts(handle, &timeouts) };
        }

        let buf_len = device
            .hid()
            .map(|h| h.max_report_len + 1)
            .unwrap_or(4096)
            .max(64);

        let mut port = OverlappedPort {
            handle,
            path: device.path().to_string(),
            hid,
            readable: mode.readable(),
            read_ov: new_overlapped(device.path())?,
            read_buf: vec![0u8; buf_len].into_boxed_slice(),
            read_start: 0,
            read_len: 0,
            read_pending: false,
            read_thread: 0,
            write_ov: new_overlapped(device.path())?,
        };

        if port.readable {
            port.start_read()?;
        }
        Ok(port)
    }

    /// Arm the single outstanding read. Rejects reentry while one is
    /// already in flight instead of corrupting the pending buffer.
    fn start_read(&mut self) -> Result<()> {
        if self.read_pending {
            return Err(Error::InvalidState("a read is already in flight"));
        }

        self.read_start = 0;
        self.read_len = 0;
        unsafe {
            ResetEvent(self.read_ov.hEvent);
            let ok = ReadFile(
                self.handle,
                self.read_buf.as_mut_ptr(),
                self.read_buf.len() as u32,
                null_mut(),
                self.read_ov.as_mut(),
            );
            if ok == 0 {
                let code = GetLastError();
                if code != ERROR_IO_PENDING {
                    return Err(win_error(&self.path, code));
                }
            }
            // Synchronous completion still signals the event; both cases
            // resolve through finalize_read.
        }
        self.read_pending = true;
        self.read_thread = unsafe { GetCurrentThreadId() };
        Ok(())
    }

    /// Wait up to `timeout` for the pending read. Returns false if it is
    /// still in flight (no buffered byte is lost; the operation keeps
    /// running until a later call or close resolves it).
    fn finalize_read(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if unsafe { GetCurrentThreadId() } != self.read_thread {
            return Err(Error::InvalidState(
                "overlapped read must be finalized by the thread that armed it",
            ));
        }

        let ms = match timeout {
            None => INFINITE,
            Some(duration) => duration.as_millis().min((u32::MAX - 1) as u128) as u32,
        };

        match unsafe { WaitForSingleObject(self.read_ov.hEvent, ms) } {
            WAIT_TIMEOUT => Ok(false),
            WAIT_OBJECT_0 => {
                let mut transferred = 0u32;
                let ok = unsafe {
                    GetOverlappedResult(self.handle, self.read_ov.as_ref(), &mut transferred, 0)
                };
                self.read_pending = false;
                if ok == 0 {
                    let code = unsafe { GetLastError() };
                    if code == ERROR_OPERATION_ABORTED {
                        self.read_len = 0;
                        Ok(true)
                    } else {
                        Err(win_error(&self.path, code))
                    }
                } else {
                    self.read_start = 0;
                    self.read_len = transferred as usize;
                    // HID reads always carry a leading report-ID byte; a
                    // zero there means the device does not number its
                    // reports, and the byte is stripped like the POSIX
                    // strategies do.
                    if self.hid && self.read_len > 0 && self.read_buf[0] == 0 {
                        self.read_start = 1;
                    }
                    Ok(true)
                }
            }
            _ => Err(last_error(&self.path)),
        }
    }
}

impl RawPort for OverlappedPort {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if !self.read_pending && self.read_start >= self.read_len {
            self.start_read()?;
        }
        if self.read_pending && !self.finalize_read(timeout)? {
            return Ok(0);
        }

        let available = &self.read_buf[self.read_start..self.read_len];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_start += n;

        if self.read_start >= self.read_len {
            // Buffer drained: re-arm so callers see a plain synchronous
            // read and the poll handle goes back to watching the device.
            self.start_read()?;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        unsafe {
            ResetEvent(self.write_ov.hEvent);
            let ok = WriteFile(
                self.handle,
                buf.as_ptr(),
                buf.len() as u32,
                null_mut(),
                self.write_ov.as_mut(),
            );
            if ok == 0 {
                let code = GetLastError();
                if code != ERROR_IO_PENDING {
                    return Err(win_error(&self.path, code));
                }
            }

            let ms = match timeout {
                None => INFINITE,
                Some(duration) => duration.as_millis().min((u32::MAX - 1) as u128) as u32,
            };
            if WaitForSingleObject(self.write_ov.hEvent, ms) == WAIT_TIMEOUT {
                // Give back whatever the device accepted before the
                // deadline; the blocking GetOverlappedResult below resolves
                // the cancellation first.
                CancelIoEx(self.handle, self.write_ov.as_ref());
            }

            let mut transferred = 0u32;
            let ok =
                GetOverlappedResult(self.handle, self.write_ov.as_ref(), &mut transferred, 1);
            if ok == 0 {
                let code = GetLastError();
                if code != ERROR_OPERATION_ABORTED {
                    return Err(win_error(&self.path, code));
                }
            }
            Ok(transferred as usize)
        }
    }

    fn poll_handle(&self) -> Option<PollHandle> {
        if self.readable {
            Some(self.read_ov.hEvent as PollHandle)
        } else {
            None
        }
    }

    fn set_serial_config(&mut self, config: &SerialConfig) -> Result<()> {
        if self.hid {
            return Err(Error::InvalidState("not a serial port"));
        }

        unsafe {
            let mut dcb: DCB = std::mem::zeroed();
            dcb.DCBlength = std::mem::size_of::<DCB>() as u32;
            if GetCommState(self.handle, &mut dcb) == 0 {
                return Err(last_error(&self.path));
            }

            dcb.BaudRate = config.baud_rate;
            dcb.ByteSize = match config.data_bits {
                DataBits::Five => 5,
                DataBits::Six => 6,
                DataBits::Seven => 7,
                DataBits::Eight => 8,
            };
            dcb.Parity = match config.parity {
                Parity::None => NOPARITY,
                Parity::Odd => ODDPARITY,
                Parity::Even => EVENPARITY,
            } as u8;
            dcb.StopBits = match config.stop_bits {
                StopBits::One => ONESTOPBIT,
                StopBits::Two => TWOSTOPBITS,
            } as u8;
            // fBinary is bit 0 of the DCB flag word and must stay set.
            dcb._bitfield |= 1;

            if SetCommState(self.handle, &dcb) == 0 {
                return Err(last_error(&self.path));
            }
        }
        Ok(())
    }
}

impl Drop for OverlappedPort {
    fn drop(&mut self) {
        unsafe {
            if self.read_pending {
                // The cancellation must fully resolve before the handle is
                // closed, or the OS could reuse the handle value while the
                // kernel still references the read buffer.
                CancelIoEx(self.handle, self.read_ov.as_ref());
                let mut transferred = 0u32;
                GetOverlappedResult(self.handle, self.read_ov.as_ref(), &mut transferred, 1);
            }
            CloseHandle(self.read_ov.hEvent);
            CloseHandle(self.write_ov.hEvent);
            CloseHandle(self.handle);
        }
    }
}

/// Allocate an OVERLAPPED with its own manual-reset event.
fn new_overlapped(path: &str) -> Result<Box<OVERLAPPED>> {
    let event = unsafe { CreateEventW(null(), 1, 0, null()) };
    if event.is_null() {
        return Err(last_error(path));
    }
    let mut ov: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
    ov.hEvent = event;
    Ok(ov)
}
