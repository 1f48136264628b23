//! hotport CLI
//!
//! Lists USB serial/HID devices, streams hotplug transitions, and dumps
//! traffic from a single port. This is the same consumer view the library
//! offers to board-management tooling: one-shot enumeration, a monitor
//! driven by its poll handle, and bounded-timeout port reads.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use hotport::{Monitor, MonitorEvent, Port, PortMode, SerialConfig, TypeFilter};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "hotport")]
#[command(author, version, about = "List, watch, and read USB serial/HID devices")]
#[command(long_about = "
Device discovery and port I/O front end for the hotport library.

EXAMPLES:
    # List every serial and HID device
    hotport list

    # Machine-readable listing of HID devices only
    hotport list --type hid --json

    # Stream hotplug transitions until interrupted
    hotport watch

    # Dump incoming data from a device (key as shown by `hotport list`)
    hotport read usb-1-1.2:0 --baud 115200
")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate devices once and print them
    List {
        /// Restrict to one device type
        #[arg(short = 't', long = "type", value_enum, default_value_t = TypeArg::Any)]
        device_type: TypeArg,

        /// Emit JSON records instead of text blocks
        #[arg(long)]
        json: bool,
    },
    /// Track devices continuously and print add/remove transitions
    Watch {
        /// Restrict to one device type
        #[arg(short = 't', long = "type", value_enum, default_value_t = TypeArg::Any)]
        device_type: TypeArg,
    },
    /// Open one device and hex-dump everything it sends
    Read {
        /// Device key, as printed by `hotport list`
        key: String,

        /// Per-read timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout: u64,

        /// Apply this baud rate before reading (serial devices only)
        #[arg(long)]
        baud: Option<u32>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TypeArg {
    Any,
    Serial,
    Hid,
}

impl std::fmt::Display for TypeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TypeArg::Any => "any",
            TypeArg::Serial => "serial",
            TypeArg::Hid => "hid",
        };
        f.write_str(name)
    }
}

impl From<TypeArg> for TypeFilter {
    fn from(arg: TypeArg) -> TypeFilter {
        match arg {
            TypeArg::Any => TypeFilter::Any,
            TypeArg::Serial => TypeFilter::Serial,
            TypeArg::Hid => TypeFilter::Hid,
        }
    }
}

fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    match args.command {
        Command::List { device_type, json } => list(device_type.into(), json),
        Command::Watch { device_type } => watch(device_type.into()),
        Command::Read { key, timeout, baud } => read(&key, Duration::from_millis(timeout), baud),
    }
}

fn list(filter: TypeFilter, json: bool) -> Result<()> {
    if json {
        let mut records = Vec::new();
        hotport::enumerate(filter, |dev| {
            records.push(dev.info().clone());
            ControlFlow::<()>::Continue(())
        })?;
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let mut count = 0usize;
    hotport::enumerate(filter, |dev| {
        print_device("+", dev);
        count += 1;
        ControlFlow::<()>::Continue(())
    })?;
    if count == 0 {
        println!("no devices found");
    }
    Ok(())
}

fn print_device(prefix: &str, dev: &Arc<hotport::Device>) {
    println!(
        "{} {}@{} {:04x}:{:04x} ({})",
        prefix,
        dev.location(),
        dev.iface_number(),
        dev.vid(),
        dev.pid(),
        dev.device_type(),
    );
    println!("  - key:           {}", dev.key());
    println!("  - device node:   {}", dev.path());
    if let Some(manufacturer) = dev.manufacturer() {
        println!("  - manufacturer:  {manufacturer}");
    }
    if let Some(product) = dev.product() {
        println!("  - product:       {product}");
    }
    if let Some(serial) = dev.serial_number() {
        println!("  - serial number: {serial}");
    }
    if let Some(hid) = dev.hid() {
        println!(
            "  - HID usage:     {:#06x}/{:#06x}",
            hid.usage_page, hid.usage
        );
    }
}

fn drain_events(monitor: &mut Monitor) {
    while let Some(event) = monitor.next_event() {
        match event {
            MonitorEvent::Added(dev) => print_device("+", &dev),
            MonitorEvent::Removed(dev) => print_device("-", &dev),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn watch(filter: TypeFilter) -> Result<()> {
    let mut monitor = Monitor::new(filter)?;
    monitor.start_watch()?;

    for dev in monitor.devices() {
        print_device("+", dev);
    }
    println!("watching for hotplug events, press Ctrl-C to stop");

    #[cfg(unix)]
    if let Some(fd) = monitor.poll_handle() {
        return watch_poll_handle(monitor, fd).await;
    }

    // No native notification source on this platform: re-enumerate on a
    // modest interval instead.
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tick.tick() => {
                monitor.refresh().context("device refresh failed")?;
                drain_events(&mut monitor);
            }
        }
    }
    Ok(())
}

/// Drive the monitor from its poll handle: sleep until the handle signals,
/// then refresh and print whatever changed.
#[cfg(unix)]
async fn watch_poll_handle(mut monitor: Monitor, fd: std::os::unix::io::RawFd) -> Result<()> {
    use tokio::io::Interest;
    use tokio::io::unix::AsyncFd;

    struct Fd(std::os::unix::io::RawFd);
    impl std::os::unix::io::AsRawFd for Fd {
        fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
            self.0
        }
    }

    let async_fd = AsyncFd::with_interest(Fd(fd), Interest::READABLE)
        .context("cannot register monitor poll handle")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            guard = async_fd.readable() => {
                let mut guard = guard.context("monitor poll handle failed")?;
                monitor.refresh().context("device refresh failed")?;
                drain_events(&mut monitor);
                // refresh() drained the notification socket.
                guard.clear_ready();
            }
        }
    }
    Ok(())
}

fn read(key: &str, timeout: Duration, baud: Option<u32>) -> Result<()> {
    let found = hotport::enumerate(TypeFilter::Any, |dev| {
        if dev.key().as_str() == key || dev.path() == key {
            ControlFlow::Break(Arc::clone(dev))
        } else {
            ControlFlow::Continue(())
        }
    })?;
    let Some(device) = found else {
        bail!("no device matches '{key}' (try `hotport list`)");
    };

    let mut port = Port::open(&device, PortMode::Read)
        .with_context(|| format!("cannot open '{}'", device.path()))?;
    if let Some(baud_rate) = baud {
        let config = SerialConfig {
            baud_rate,
            ..SerialConfig::default()
        };
        port.set_serial_config(&config)
            .context("cannot apply serial configuration")?;
    }

    eprintln!("reading from {}, press Ctrl-C to stop", device.path());
    let mut offset = 0usize;
    let mut buf = [0u8; 256];
    loop {
        let n = port.read(&mut buf, Some(timeout))?;
        if n > 0 {
            hexdump(offset, &buf[..n]);
            offset += n;
        }
    }
}

fn hexdump(mut offset: usize, data: &[u8]) {
    for chunk in data.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        println!("{offset:08x}  {:<47}  |{ascii}|", hex.join(" "));
        offset += chunk.len();
    }
}
