//! Device registry with hotplug tracking.
//!
//! The [`Monitor`] owns the deduplicated set of tracked devices, keyed by
//! their stable [`DeviceKey`]. It pulls snapshots from a platform
//! [`Backend`], reconciles them into add/remove events, and exposes a
//! pollable handle so a caller can integrate hotplug readiness into its own
//! wait loop. The monitor spawns no threads: all progress happens on the
//! thread that calls [`Monitor::refresh`].

use crate::device::{Device, DeviceInfo, DeviceKey, DeviceStatus, DeviceType};
use crate::error::{Error, Result};
use crate::platform::{self, PollHandle};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, warn};

/// Restricts enumeration and tracking to one device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeFilter {
    #[default]
    Any,
    Serial,
    Hid,
}

impl TypeFilter {
    pub fn matches(&self, device_type: DeviceType) -> bool {
        match self {
            TypeFilter::Any => true,
            TypeFilter::Serial => device_type == DeviceType::Serial,
            TypeFilter::Hid => device_type == DeviceType::Hid,
        }
    }
}

/// Connectivity transition reported by [`Monitor::refresh`].
///
/// Events carry the entity itself; a `Removed` event is the last chance to
/// grab a reference before the registry forgets an unreferenced device.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Added(Arc<Device>),
    Removed(Arc<Device>),
}

impl MonitorEvent {
    pub fn device(&self) -> &Arc<Device> {
        match self {
            MonitorEvent::Added(dev) | MonitorEvent::Removed(dev) => dev,
        }
    }
}

/// Platform device-tree access.
///
/// One implementation exists per OS, selected at build time; tests drive the
/// monitor with scripted implementations instead. Like the monitor itself,
/// a backend lives on the single thread that drives `refresh`.
pub trait Backend {
    /// Walk the native device tree and return the current set of devices
    /// matching `filter`, in discovery order.
    fn snapshot(&mut self, filter: TypeFilter) -> Result<Vec<DeviceInfo>>;

    /// Subscribe to native hotplug notifications, if the platform has any.
    fn watch(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop the hotplug subscription.
    fn unwatch(&mut self) {}

    /// Waitable object that signals pending hotplug notifications, or `None`
    /// when the platform has no native mechanism and the caller must fall
    /// back to periodic [`Monitor::refresh`] calls.
    fn poll_handle(&self) -> Option<PollHandle> {
        None
    }

    /// Consume pending hotplug notifications without blocking. Returns true
    /// if the device tree may have changed since the last snapshot.
    fn drain_notifications(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Hotplug-aware device registry.
pub struct Monitor {
    backend: Box<dyn Backend>,
    filter: TypeFilter,
    devices: HashMap<DeviceKey, Arc<Device>>,
    events: VecDeque<MonitorEvent>,
    watching: bool,
}

impl Monitor {
    /// Create a monitor over the platform backend.
    pub fn new(filter: TypeFilter) -> Result<Self> {
        Ok(Self::with_backend(platform::default_backend()?, filter))
    }

    /// Create a monitor over an explicit backend. Used by tests and by
    /// consumers that bring their own device source.
    pub fn with_backend(backend: Box<dyn Backend>, filter: TypeFilter) -> Self {
        Monitor {
            backend,
            filter,
            devices: HashMap::new(),
            events: VecDeque::new(),
            watching: false,
        }
    }

    /// Begin continuous tracking: subscribe to hotplug notifications and
    /// seed the registry with an initial enumeration.
    ///
    /// Seeding emits no events; list the devices afterwards instead. Fails
    /// with `InvalidState` if already watching.
    pub fn start_watch(&mut self) -> Result<()> {
        if self.watching {
            return Err(Error::InvalidState("monitor is already watching"));
        }

        self.backend.watch()?;
        let snapshot = match self.backend.snapshot(self.filter) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.backend.unwatch();
                return Err(err);
            }
        };
        for info in snapshot {
            let dev = Device::new(info, DeviceStatus::Online);
            debug!("{}", dev.describe("track"));
            self.devices.insert(dev.key().clone(), dev);
        }

        self.watching = true;
        Ok(())
    }

    /// Stop tracking and forget all devices and queued events. Outstanding
    /// `Arc<Device>` references stay valid; their entities simply stop being
    /// updated.
    pub fn stop_watch(&mut self) {
        if !self.watching {
            return;
        }
        self.backend.unwatch();
        self.devices.clear();
        self.events.clear();
        self.watching = false;
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    /// Waitable handle that signals when [`Monitor::refresh`] would produce
    /// new events. `None` means the platform has no native notification
    /// mechanism; call `refresh` periodically instead.
    pub fn poll_handle(&self) -> Option<PollHandle> {
        if !self.watching {
            return None;
        }
        self.backend.poll_handle()
    }

    /// Drain pending hotplug notifications and reconcile the registry,
    /// queueing add/remove events. Never blocks.
    ///
    /// A backend failure aborts the refresh and leaves previously tracked
    /// devices untouched; it never fabricates a mass disconnect.
    pub fn refresh(&mut self) -> Result<()> {
        if !self.watching {
            return Err(Error::InvalidState("monitor is not watching"));
        }

        let changed = self.backend.drain_notifications()?;
        if changed {
            let snapshot = self.backend.snapshot(self.filter)?;
            self.reconcile(snapshot);
        }
        self.sweep();
        Ok(())
    }

    /// Pop the next queued hotplug event, oldest first.
    pub fn next_event(&mut self) -> Option<MonitorEvent> {
        self.events.pop_front()
    }

    /// Currently tracked devices, including disconnected entities that are
    /// still referenced elsewhere.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&Arc<Device>> {
        self.devices.get(key)
    }

    /// Fold a fresh backend snapshot into the tracked set.
    ///
    /// New keys become Online entries with an Added event. Known keys are
    /// revived in place when they come back unchanged (preserving entity
    /// identity for outstanding holders), or replaced under the same key
    /// when their observable fields moved. Keys missing from the snapshot
    /// transition to Disconnected with a Removed event; the entry itself is
    /// only retained while someone outside the registry still references it.
    fn reconcile(&mut self, snapshot: Vec<DeviceInfo>) {
        let mut seen: HashSet<DeviceKey> = HashSet::with_capacity(snapshot.len());

        for info in snapshot {
            if !seen.insert(info.key.clone()) {
                warn!("backend reported duplicate device key '{}'", info.key);
                continue;
            }

            match self.devices.get(&info.key) {
                None => {
                    let dev = Device::new(info, DeviceStatus::Online);
                    debug!("{}", dev.describe("add"));
                    self.devices.insert(dev.key().clone(), Arc::clone(&dev));
                    self.events.push_back(MonitorEvent::Added(dev));
                }
                Some(existing) if existing.status() == DeviceStatus::Disconnected => {
                    if existing.info_matches(&info) && Arc::strong_count(existing) > 1 {
                        // The same physical device came back while someone
                        // still holds the old entity: revive it in place.
                        let dev = Arc::clone(existing);
                        dev.set_status(DeviceStatus::Online);
                        debug!("{}", dev.describe("add"));
                        self.events.push_back(MonitorEvent::Added(dev));
                    } else {
                        let dev = Device::new(info, DeviceStatus::Online);
                        debug!("{}", dev.describe("add"));
                        self.devices.insert(dev.key().clone(), Arc::clone(&dev));
                        self.events.push_back(MonitorEvent::Added(dev));
                    }
                }
                Some(existing) => {
                    if !existing.info_matches(&info) {
                        // Same port, different device node: the replug went
                        // unobserved. Report it as a remove/add pair.
                        existing.mark_disconnected();
                        debug!("{}", existing.describe("remove"));
                        self.events
                            .push_back(MonitorEvent::Removed(Arc::clone(existing)));

                        let dev = Device::new(info, DeviceStatus::Online);
                        debug!("{}", dev.describe("add"));
                        self.devices.insert(dev.key().clone(), Arc::clone(&dev));
                        self.events.push_back(MonitorEvent::Added(dev));
                    }
                }
            }
        }

        // Devices missing from the snapshot go offline.
        let gone: Vec<DeviceKey> = self
            .devices
            .iter()
            .filter(|(key, dev)| !seen.contains(*key) && dev.status() == DeviceStatus::Online)
            .map(|(key, _)| DeviceKey::clone(key))
            .collect();
        for key in gone {
            let dev = Arc::clone(&self.devices[&key]);
            dev.mark_disconnected();
            debug!("{}", dev.describe("remove"));
            self.events.push_back(MonitorEvent::Removed(dev));
        }
    }

    /// Delayed collection: drop disconnected entries nobody references
    /// anymore. The registry's own reference is the one being released; any
    /// queued event still holding the entity keeps it alive until consumed.
    fn sweep(&mut self) {
        self.devices.retain(|_, dev| {
            dev.status() == DeviceStatus::Online || Arc::strong_count(dev) > 1
        });
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

/// One-shot enumeration over the platform backend.
///
/// Builds a transient entity per discovered device and invokes `callback`
/// for each, in backend discovery order. The callback can abort the walk
/// with `ControlFlow::Break(value)`; the value is handed back as
/// `Ok(Some(value))`.
pub fn enumerate<B>(
    filter: TypeFilter,
    mut callback: impl FnMut(&Arc<Device>) -> ControlFlow<B>,
) -> Result<Option<B>> {
    let mut backend = platform::default_backend()?;
    enumerate_with(backend.as_mut(), filter, &mut callback)
}

/// [`enumerate`] over an explicit backend.
pub fn enumerate_with<B>(
    backend: &mut dyn Backend,
    filter: TypeFilter,
    callback: &mut dyn FnMut(&Arc<Device>) -> ControlFlow<B>,
) -> Result<Option<B>> {
    let snapshot = backend.snapshot(filter)?;
    for info in snapshot {
        let dev = Device::new(info, DeviceStatus::Online);
        if let ControlFlow::Break(value) = callback(&dev) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_filter() {
        assert!(TypeFilter::Any.matches(DeviceType::Serial));
        assert!(TypeFilter::Any.matches(DeviceType::Hid));
        assert!(TypeFilter::Serial.matches(DeviceType::Serial));
        assert!(!TypeFilter::Serial.matches(DeviceType::Hid));
        assert!(TypeFilter::Hid.matches(DeviceType::Hid));
        assert!(!TypeFilter::Hid.matches(DeviceType::Serial));
    }

    #[test]
    fn test_refresh_requires_watching() {
        struct Empty;
        impl Backend for Empty {
            fn snapshot(&mut self, _filter: TypeFilter) -> Result<Vec<DeviceInfo>> {
                Ok(Vec::new())
            }
        }

        let mut monitor = Monitor::with_backend(Box::new(Empty), TypeFilter::Any);
        assert!(matches!(
            monitor.refresh(),
            Err(Error::InvalidState(_))
        ));
        assert!(monitor.poll_handle().is_none());
    }
}
