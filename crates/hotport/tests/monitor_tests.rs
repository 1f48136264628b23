//! Integration tests for the device registry.
//!
//! The monitor is driven with a scripted backend so every reconciliation
//! path can be exercised deterministically: add/remove event exactness,
//! disconnect/replug identity preservation, delayed collection of
//! referenced entities, and failure semantics.

use hotport::{
    Backend, DeviceInfo, DeviceKey, DeviceStatus, DeviceType, Error, HidInfo, Monitor,
    MonitorEvent, TypeFilter, enumerate_with,
};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

/// Backend whose snapshots are scripted in advance; each `refresh` (and the
/// `start_watch` seed) consumes one entry.
struct ScriptedBackend {
    snapshots: VecDeque<Result<Vec<DeviceInfo>, ()>>,
}

impl ScriptedBackend {
    fn new(snapshots: Vec<Result<Vec<DeviceInfo>, ()>>) -> ScriptedBackend {
        ScriptedBackend {
            snapshots: snapshots.into(),
        }
    }
}

impl Backend for ScriptedBackend {
    fn snapshot(&mut self, filter: TypeFilter) -> hotport::Result<Vec<DeviceInfo>> {
        match self.snapshots.pop_front() {
            Some(Ok(infos)) => Ok(infos
                .into_iter()
                .filter(|info| filter.matches(info.device_type))
                .collect()),
            Some(Err(())) => Err(Error::Io {
                path: "scripted".to_string(),
                source: std::io::Error::other("enumeration failed"),
            }),
            None => panic!("test consumed more snapshots than scripted"),
        }
    }
}

fn serial(key: &str, path: &str) -> DeviceInfo {
    DeviceInfo {
        key: DeviceKey::new(key),
        device_type: DeviceType::Serial,
        location: format!("usb-{key}"),
        path: path.to_string(),
        vid: 0x0403,
        pid: 0x6015,
        manufacturer: None,
        product: Some("USB Serial".to_string()),
        serial_number: None,
        iface_number: 0,
        hid: None,
    }
}

fn hid(key: &str, path: &str) -> DeviceInfo {
    DeviceInfo {
        key: DeviceKey::new(key),
        device_type: DeviceType::Hid,
        location: format!("usb-{key}"),
        path: path.to_string(),
        vid: 0x16c0,
        pid: 0x0486,
        manufacturer: Some("PJRC".to_string()),
        product: Some("Teensyduino RawHID".to_string()),
        serial_number: Some("1234567".to_string()),
        iface_number: 0,
        hid: Some(HidInfo {
            usage_page: 0xffab,
            usage: 0x0200,
            numbered_reports: false,
            max_report_len: 64,
        }),
    }
}

fn watching(snapshots: Vec<Result<Vec<DeviceInfo>, ()>>) -> Monitor {
    let mut monitor = Monitor::with_backend(Box::new(ScriptedBackend::new(snapshots)), TypeFilter::Any);
    monitor.start_watch().unwrap();
    monitor
}

fn drain(monitor: &mut Monitor) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Some(event) = monitor.next_event() {
        events.push(event);
    }
    events
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_seed_emits_no_events() {
        let mut monitor = watching(vec![Ok(vec![serial("k1", "/dev/ttyACM0")])]);
        assert!(monitor.next_event().is_none());
        assert_eq!(monitor.devices().count(), 1);
    }

    #[test]
    fn test_start_watch_twice_is_invalid() {
        let mut monitor = watching(vec![Ok(vec![])]);
        assert!(matches!(
            monitor.start_watch(),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_refresh_without_watch_is_invalid() {
        let mut monitor =
            Monitor::with_backend(Box::new(ScriptedBackend::new(vec![])), TypeFilter::Any);
        assert!(matches!(monitor.refresh(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_stop_watch_forgets_devices_but_not_references() {
        let mut monitor = watching(vec![Ok(vec![serial("k1", "/dev/ttyACM0")])]);
        let held = Arc::clone(monitor.devices().next().unwrap());

        monitor.stop_watch();
        assert_eq!(monitor.devices().count(), 0);
        assert!(matches!(monitor.refresh(), Err(Error::InvalidState(_))));

        // The externally held entity is still valid to query.
        assert_eq!(held.vid(), 0x0403);
    }

    #[test]
    fn test_type_filter_applies_to_tracking() {
        let snapshot = vec![serial("s1", "/dev/ttyACM0"), hid("h1", "/dev/hidraw0")];
        let mut monitor = Monitor::with_backend(
            Box::new(ScriptedBackend::new(vec![Ok(snapshot)])),
            TypeFilter::Hid,
        );
        monitor.start_watch().unwrap();

        let tracked: Vec<_> = monitor.devices().collect();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].device_type(), DeviceType::Hid);
    }
}

mod reconciliation {
    use super::*;

    #[test]
    fn test_add_and_remove_events_are_exact() {
        let mut monitor = watching(vec![
            Ok(vec![]),
            // k1 and k2 appear
            Ok(vec![serial("k1", "/dev/ttyACM0"), serial("k2", "/dev/ttyACM1")]),
            // k2 disappears
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            // nothing changes
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
        ]);

        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, MonitorEvent::Added(_))));

        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MonitorEvent::Removed(dev) => assert_eq!(dev.key().as_str(), "k2"),
            other => panic!("expected a remove event, got {other:?}"),
        }

        // An unchanged snapshot must not produce spurious events.
        monitor.refresh().unwrap();
        assert!(drain(&mut monitor).is_empty());
    }

    #[test]
    fn test_events_follow_backend_discovery_order() {
        let mut monitor = watching(vec![
            Ok(vec![]),
            Ok(vec![
                serial("k3", "/dev/ttyACM2"),
                serial("k1", "/dev/ttyACM0"),
                serial("k2", "/dev/ttyACM1"),
            ]),
        ]);

        monitor.refresh().unwrap();
        let keys: Vec<String> = drain(&mut monitor)
            .iter()
            .map(|event| event.device().key().as_str().to_string())
            .collect();
        assert_eq!(keys, ["k3", "k1", "k2"]);
    }

    #[test]
    fn test_changed_fields_replace_entity_under_same_key() {
        let mut monitor = watching(vec![
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            Ok(vec![serial("k1", "/dev/ttyACM5")]),
        ]);
        let original = Arc::clone(monitor.get(&DeviceKey::new("k1")).unwrap());

        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], MonitorEvent::Removed(_)));
        assert!(matches!(events[1], MonitorEvent::Added(_)));

        // The stale entity went offline; a fresh one took over the key.
        assert_eq!(original.status(), DeviceStatus::Disconnected);
        let current = monitor.get(&DeviceKey::new("k1")).unwrap();
        assert_eq!(current.path(), "/dev/ttyACM5");
        assert!(!Arc::ptr_eq(&original, current));
    }

    #[test]
    fn test_enumeration_failure_leaves_registry_untouched() {
        let mut monitor = watching(vec![
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            Err(()),
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
        ]);

        assert!(matches!(monitor.refresh(), Err(Error::Io { .. })));

        // No forced mass-disconnect: the device is still online.
        let dev = monitor.get(&DeviceKey::new("k1")).unwrap();
        assert_eq!(dev.status(), DeviceStatus::Online);
        assert!(monitor.next_event().is_none());

        // And the next successful refresh is a no-op.
        monitor.refresh().unwrap();
        assert!(drain(&mut monitor).is_empty());
    }
}

mod references {
    use super::*;

    #[test]
    fn test_unreferenced_disconnected_device_is_collected() {
        let mut monitor = watching(vec![
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            Ok(vec![]),
            Ok(vec![]),
        ]);

        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 1);
        drop(events);

        // With the event consumed and no external holder, the next refresh
        // sweeps the entry.
        monitor.refresh().unwrap();
        assert!(monitor.get(&DeviceKey::new("k1")).is_none());
    }

    #[test]
    fn test_referenced_disconnected_device_survives_until_released() {
        let mut monitor = watching(vec![
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![]),
        ]);
        let held = Arc::clone(monitor.get(&DeviceKey::new("k1")).unwrap());
        let weak = Arc::downgrade(&held);

        monitor.refresh().unwrap();
        drain(&mut monitor);

        // Still tracked: an external reference exists.
        monitor.refresh().unwrap();
        let tracked = monitor.get(&DeviceKey::new("k1")).unwrap();
        assert_eq!(tracked.status(), DeviceStatus::Disconnected);
        assert_eq!(held.path(), "/dev/ttyACM0");

        // Releasing the external reference lets the registry collect it.
        drop(held);
        monitor.refresh().unwrap();
        assert!(monitor.get(&DeviceKey::new("k1")).is_none());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_replug_revives_the_same_entity() {
        let mut monitor = watching(vec![
            Ok(vec![hid("k1", "/dev/hidraw0")]),
            Ok(vec![]),
            Ok(vec![hid("k1", "/dev/hidraw0")]),
        ]);
        let held = Arc::clone(monitor.get(&DeviceKey::new("k1")).unwrap());

        // Unplug: remove event for k1, entity stays valid for inspection.
        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], MonitorEvent::Removed(dev) if dev.key().as_str() == "k1"));
        drop(events);
        assert_eq!(held.status(), DeviceStatus::Disconnected);
        assert_eq!(held.vid(), 0x16c0);

        // Replug with the same physical identity: the add event reuses the
        // entity instead of allocating a new one.
        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 1);
        match &events[0] {
            MonitorEvent::Added(dev) => assert!(Arc::ptr_eq(dev, &held)),
            other => panic!("expected an add event, got {other:?}"),
        }
        assert_eq!(held.status(), DeviceStatus::Online);
    }

    #[test]
    fn test_replug_without_references_allocates_fresh_entity() {
        let mut monitor = watching(vec![
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![serial("k1", "/dev/ttyACM0")]),
        ]);

        monitor.refresh().unwrap();
        drain(&mut monitor);
        monitor.refresh().unwrap(); // sweep

        monitor.refresh().unwrap();
        let events = drain(&mut monitor);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], MonitorEvent::Added(_)));
        assert_eq!(
            monitor.get(&DeviceKey::new("k1")).unwrap().status(),
            DeviceStatus::Online
        );
    }
}

mod one_shot {
    use super::*;

    #[test]
    fn test_enumerate_reports_descriptor_fields() {
        let mut backend = ScriptedBackend::new(vec![Ok(vec![hid("K1", "/dev/hidraw0")])]);

        let mut calls = 0;
        enumerate_with(&mut backend, TypeFilter::Any, &mut |dev| {
            calls += 1;
            assert_eq!(dev.key().as_str(), "K1");
            assert_eq!(dev.vid(), 0x16c0);
            assert_eq!(dev.pid(), 0x0486);
            assert_eq!(dev.status(), DeviceStatus::Online);
            assert_eq!(dev.hid().unwrap().usage_page, 0xffab);
            ControlFlow::<()>::Continue(())
        })
        .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_enumerate_callback_can_abort_the_walk() {
        let snapshot = vec![
            serial("k1", "/dev/ttyACM0"),
            serial("k2", "/dev/ttyACM1"),
            serial("k3", "/dev/ttyACM2"),
        ];
        let mut backend = ScriptedBackend::new(vec![Ok(snapshot)]);

        let mut seen = Vec::new();
        let result = enumerate_with(&mut backend, TypeFilter::Any, &mut |dev| {
            seen.push(dev.key().as_str().to_string());
            if dev.key().as_str() == "k2" {
                ControlFlow::Break(42)
            } else {
                ControlFlow::Continue(())
            }
        })
        .unwrap();

        assert_eq!(result, Some(42));
        assert_eq!(seen, ["k1", "k2"]);
    }

    #[test]
    fn test_enumerate_filter() {
        let snapshot = vec![serial("s1", "/dev/ttyACM0"), hid("h1", "/dev/hidraw0")];
        let mut backend = ScriptedBackend::new(vec![Ok(snapshot)]);

        let mut seen = Vec::new();
        enumerate_with(&mut backend, TypeFilter::Serial, &mut |dev| {
            seen.push(dev.key().as_str().to_string());
            ControlFlow::<()>::Continue(())
        })
        .unwrap();
        assert_eq!(seen, ["s1"]);
    }
}
