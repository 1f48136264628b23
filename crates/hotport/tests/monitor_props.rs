//! Property test for snapshot reconciliation.
//!
//! For any sequence of backend snapshots, the registry must emit exactly
//! one add event per key entering the snapshot and one remove event per
//! key leaving it, with no duplicates for unchanged keys, and its online
//! set must always mirror the latest snapshot.

use hotport::{
    Backend, DeviceInfo, DeviceKey, DeviceStatus, DeviceType, Monitor, MonitorEvent, TypeFilter,
};
use proptest::prelude::*;
use std::collections::{BTreeSet, VecDeque};

struct ScriptedBackend {
    snapshots: VecDeque<Vec<DeviceInfo>>,
}

impl Backend for ScriptedBackend {
    fn snapshot(&mut self, _filter: TypeFilter) -> hotport::Result<Vec<DeviceInfo>> {
        Ok(self.snapshots.pop_front().expect("script exhausted"))
    }
}

fn device(index: u8) -> DeviceInfo {
    DeviceInfo {
        key: DeviceKey::new(format!("usb-1-1.{index}:0")),
        device_type: DeviceType::Serial,
        location: format!("usb-1-1.{index}"),
        path: format!("/dev/ttyACM{index}"),
        vid: 0x16c0,
        pid: 0x0483,
        manufacturer: None,
        product: None,
        serial_number: None,
        iface_number: 0,
        hid: None,
    }
}

proptest! {
    #[test]
    fn prop_reconciliation_emits_exact_event_sets(
        script in prop::collection::vec(prop::collection::btree_set(0u8..6, 0..5), 1..10)
    ) {
        let snapshots: Vec<Vec<DeviceInfo>> = script
            .iter()
            .map(|set| set.iter().map(|&i| device(i)).collect())
            .collect();

        // One extra empty snapshot seeds the watch.
        let mut all = vec![Vec::new()];
        all.extend(snapshots);
        let backend = ScriptedBackend { snapshots: all.into() };

        let mut monitor = Monitor::with_backend(Box::new(backend), TypeFilter::Any);
        monitor.start_watch().unwrap();

        let mut model: BTreeSet<u8> = BTreeSet::new();
        for set in &script {
            monitor.refresh().unwrap();

            let mut added = BTreeSet::new();
            let mut removed = BTreeSet::new();
            while let Some(event) = monitor.next_event() {
                let key = event.device().key().as_str().to_string();
                let index: u8 = key
                    .trim_start_matches("usb-1-1.")
                    .trim_end_matches(":0")
                    .parse()
                    .unwrap();
                match event {
                    MonitorEvent::Added(_) => prop_assert!(added.insert(index), "duplicate add"),
                    MonitorEvent::Removed(_) => {
                        prop_assert!(removed.insert(index), "duplicate remove")
                    }
                }
            }

            let expected_added: BTreeSet<u8> = set.difference(&model).copied().collect();
            let expected_removed: BTreeSet<u8> = model.difference(set).copied().collect();
            prop_assert_eq!(&added, &expected_added);
            prop_assert_eq!(&removed, &expected_removed);

            // Online entries mirror the snapshot exactly.
            let online: BTreeSet<u8> = monitor
                .devices()
                .filter(|dev| dev.status() == DeviceStatus::Online)
                .map(|dev| {
                    dev.key()
                        .as_str()
                        .trim_start_matches("usb-1-1.")
                        .trim_end_matches(":0")
                        .parse()
                        .unwrap()
                })
                .collect();
            prop_assert_eq!(&online, set);

            model = set.clone();
        }
    }
}
