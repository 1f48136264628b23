//! POSIX file-descriptor transfer strategy.
//!
//! Serves serial ports on every Unix platform and raw HID nodes on Linux.
//! The node is opened non-blocking; bounded waits go through `poll(2)`, so
//! reads and writes never busy-wait and never overshoot their timeout by
//! more than a scheduling quantum. The fd doubles as the port's poll
//! handle.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::platform::PollHandle;
use crate::port::{DataBits, Parity, PortMode, RawPort, SerialConfig, StopBits};
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::termios::{self, BaudRate, ControlFlags, SetArg, SpecialCharacterIndices};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::{Duration, Instant};

pub(crate) struct FilePort {
    file: File,
    path: String,
    /// Armed on Linux for HID devices affected by the legacy report-framing
    /// kernel bug; all reads are then routed through its scratch buffer.
    #[cfg(target_os = "linux")]
    shim: Option<super::linux::ReportShim>,
}

impl FilePort {
    pub(crate) fn open(device: &Device, mode: PortMode) -> Result<FilePort> {
        let mut options = OpenOptions::new();
        options
            .read(mode.readable())
            .write(mode.writable())
            .custom_flags(libc::O_NONBLOCK | libc::O_NOCTTY | libc::O_CLOEXEC);
        let file = options
            .open(device.path())
            .map_err(|err| Error::from_io(device.path(), err))?;

        Ok(FilePort {
            file,
            path: device.path().to_string(),
            #[cfg(target_os = "linux")]
            shim: super::linux::ReportShim::for_device(device),
        })
    }

    #[cfg(test)]
    fn from_file(file: File, path: &str) -> FilePort {
        FilePort {
            file,
            path: path.to_string(),
            #[cfg(target_os = "linux")]
            shim: None,
        }
    }

    /// Wait for `events` on the fd, up to `timeout` (`None` waits forever).
    /// Returns false on timeout.
    fn wait_ready(&self, events: PollFlags, timeout: Option<Duration>) -> Result<bool> {
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(duration) => {
                let ms = duration.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
            }
        };

        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        match poll(&mut fds, poll_timeout) {
            Ok(0) => Ok(false),
            // Error conditions (POLLERR/POLLHUP) also count as ready, and so
            // does EINTR: the following read or write classifies what
            // happened, and the caller's loop re-checks the deadline.
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(true),
            Err(errno) => Err(Error::from_io(
                &self.path,
                std::io::Error::from_raw_os_error(errno as i32),
            )),
        }
    }

    fn remaining(deadline: Option<Instant>) -> Option<Duration> {
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn read_raw(&mut self, dst: &mut [u8]) -> std::io::Result<usize> {
        (&self.file).read(dst)
    }
}

impl RawPort for FilePort {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.wait_ready(PollFlags::POLLIN, Self::remaining(deadline))? {
                return Ok(0);
            }

            #[cfg(target_os = "linux")]
            if let Some(mut shim) = self.shim.take() {
                let result = match self.read_raw(shim.scratch_mut()) {
                    Ok(0) => Err(Error::NotFound(self.path.clone())),
                    Ok(n) => Ok(Some(shim.normalize(n, buf))),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(None),
                    Err(err) => Err(Error::from_io(&self.path, err)),
                };
                self.shim = Some(shim);
                match result? {
                    Some(n) => return Ok(n),
                    None => continue,
                }
            }

            match self.read_raw(buf) {
                // EOF from a character device node means it was revoked.
                Ok(0) => return Err(Error::NotFound(self.path.clone())),
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&self.path, err)),
            }
        }
    }

    fn write(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut written = 0;

        while written < buf.len() {
            if !self.wait_ready(PollFlags::POLLOUT, Self::remaining(deadline))? {
                break;
            }

            match (&self.file).write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::from_io(&self.path, err)),
            }
        }

        Ok(written)
    }

    fn poll_handle(&self) -> Option<PollHandle> {
        Some(self.file.as_raw_fd())
    }

    fn set_serial_config(&mut self, config: &SerialConfig) -> Result<()> {
        let mut tio = termios::tcgetattr(&self.file)
            .map_err(|errno| Error::from_io(&self.path, std::io::Error::from_raw_os_error(errno as i32)))?;

        termios::cfmakeraw(&mut tio);
        tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tio.control_flags &= !(ControlFlags::CSIZE
            | ControlFlags::PARENB
            | ControlFlags::PARODD
            | ControlFlags::CSTOPB);

        tio.control_flags |= match config.data_bits {
            DataBits::Five => ControlFlags::CS5,
            DataBits::Six => ControlFlags::CS6,
            DataBits::Seven => ControlFlags::CS7,
            DataBits::Eight => ControlFlags::CS8,
        };
        match config.parity {
            Parity::None => {}
            Parity::Odd => tio.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD,
            Parity::Even => tio.control_flags |= ControlFlags::PARENB,
        }
        if config.stop_bits == StopBits::Two {
            tio.control_flags |= ControlFlags::CSTOPB;
        }

        // Timeouts are handled by poll(2), not by the line discipline.
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        let rate = baud_rate(config.baud_rate, &self.path)?;
        termios::cfsetspeed(&mut tio, rate)
            .map_err(|errno| Error::from_io(&self.path, std::io::Error::from_raw_os_error(errno as i32)))?;
        termios::tcsetattr(&self.file, SetArg::TCSANOW, &tio)
            .map_err(|errno| Error::from_io(&self.path, std::io::Error::from_raw_os_error(errno as i32)))
    }
}

fn baud_rate(rate: u32, path: &str) -> Result<BaudRate> {
    let baud = match rate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460_800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        921_600 => BaudRate::B921600,
        _ => {
            return Err(Error::Io {
                path: path.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unsupported baud rate {rate}"),
                ),
            });
        }
    };
    Ok(baud)
}
