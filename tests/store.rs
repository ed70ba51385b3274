//! Persistence-layer round trips, torn-write tolerance, and wear limiting.

mod common;

use common::*;
use moclink::hal::FlashError;
use moclink::math::{Quat, Vec3};
use moclink::store::{self, Binding, FusionSnapshot, PairingRecord, SnapshotWriter};
use moclink::{MacAddr, NetworkKey, TrackerId};

fn id(v: u8) -> TrackerId {
    TrackerId::try_from(v).unwrap()
}

#[test]
fn network_key_round_trip_and_torn_write() {
    let mut flash = MockFlash::new(4096);
    assert_eq!(store::load_network_key(&mut flash).unwrap(), None);

    let key = NetworkKey(0xCAFE_BABE);
    store::save_network_key(&mut flash, key).unwrap();
    assert_eq!(store::load_network_key(&mut flash).unwrap(), Some(key));

    // a torn write shows up as a CRC mismatch and reads back as absent
    flash.corrupt_byte(5);
    assert_eq!(store::load_network_key(&mut flash).unwrap(), None);
}

#[test]
fn generated_key_is_never_reserved_and_is_stable() {
    let flash = MockFlash::new(4096);
    let mac = MacAddr([1, 2, 3, 4, 5, 6]);

    let key = store::load_or_create_network_key(
        &mut flash.clone(),
        None::<&mut NoEntropy>,
        mac,
        1234,
    )
    .unwrap();
    assert!(key.is_valid());

    // second boot, different boot time: same key comes back from flash
    let again = store::load_or_create_network_key(
        &mut flash.clone(),
        None::<&mut NoEntropy>,
        mac,
        99_999,
    )
    .unwrap();
    assert_eq!(again, key);
}

#[test]
fn entropy_source_that_yields_reserved_words_falls_back() {
    let mut flash = MockFlash::new(4096);
    let key = store::load_or_create_network_key(
        &mut flash,
        Some(&mut FixedEntropy(0xFFFF_FFFF)),
        MacAddr([9; 6]),
        7,
    )
    .unwrap();
    assert!(key.is_valid());
}

#[test]
fn binding_table_round_trip_and_clear() {
    let mut flash = MockFlash::new(4096);
    let slot = id(3);
    assert_eq!(store::load_binding(&mut flash, slot).unwrap(), None);

    let binding = Binding {
        mac: MacAddr([0xB0, 0xB1, 0xB2, 0xB3, 0xB4, 0x33]),
        paired_time_ms: 123_456,
    };
    store::save_binding(&mut flash, slot, &binding).unwrap();
    assert_eq!(store::load_binding(&mut flash, slot).unwrap(), Some(binding));

    // neighbors are untouched by the page read-modify-write
    assert_eq!(store::load_binding(&mut flash, id(2)).unwrap(), None);
    assert_eq!(store::load_binding(&mut flash, id(4)).unwrap(), None);

    store::clear_binding(&mut flash, slot).unwrap();
    assert_eq!(store::load_binding(&mut flash, slot).unwrap(), None);
    // clearing twice is the same as clearing once
    store::clear_binding(&mut flash, slot).unwrap();
    assert_eq!(store::load_binding(&mut flash, slot).unwrap(), None);
}

#[test]
fn pairing_record_round_trip() {
    let mut flash = MockFlash::new(4096);
    let rec = PairingRecord {
        tracker_id: id(5),
        own_mac: MacAddr([1, 1, 2, 2, 3, 3]),
        receiver_mac: MacAddr([4, 4, 5, 5, 6, 6]),
        network_key: NetworkKey(0x1234_5678),
    };
    store::save_pairing(&mut flash, &rec).unwrap();
    assert_eq!(store::load_pairing(&mut flash).unwrap(), Some(rec));

    store::clear_pairing(&mut flash).unwrap();
    assert_eq!(store::load_pairing(&mut flash).unwrap(), None);
}

#[test]
fn snapshot_round_trip() {
    let mut flash = MockFlash::new(4096);
    let snap = FusionSnapshot {
        save_time_ms: 42_000,
        quat: Quat::new(0.7, 0.1, -0.1, 0.7),
        gyro_bias: Vec3::new(0.01, -0.02, 0.003),
        sleep_count: 7,
        wake_count: 6,
        total_runtime_ms: 1_000_000,
    };
    store::save_snapshot(&mut flash, &snap).unwrap();
    assert_eq!(store::load_snapshot(&mut flash).unwrap(), Some(snap));
}

#[test]
fn snapshot_writes_are_wear_limited() {
    let mut flash = MockFlash::new(4096);
    let mut writer = SnapshotWriter::new(5_000);
    let snap = FusionSnapshot {
        save_time_ms: 0,
        quat: Quat::IDENTITY,
        gyro_bias: Vec3::ZERO,
        sleep_count: 0,
        wake_count: 0,
        total_runtime_ms: 0,
    };

    assert!(writer.maybe_save(&mut flash, &snap, 1_000, false).unwrap());
    assert!(!writer.maybe_save(&mut flash, &snap, 3_000, false).unwrap());
    // the pre-sleep save ignores the throttle
    assert!(writer.maybe_save(&mut flash, &snap, 3_100, true).unwrap());
    assert!(writer.maybe_save(&mut flash, &snap, 9_000, false).unwrap());
}

#[test]
fn write_faults_surface_to_the_caller() {
    let mut flash = MockFlash::new(4096);
    flash.fail_writes.set(true);
    let err = store::save_network_key(&mut flash, NetworkKey(0x1111_1111));
    assert_eq!(err, Err(FlashError::HardwareFault));
}

#[test]
fn factory_reset_erases_key_and_bindings() {
    let mut flash = MockFlash::new(4096);
    store::save_network_key(&mut flash, NetworkKey(0x2222_3333)).unwrap();
    store::save_binding(
        &mut flash,
        id(0),
        &Binding { mac: MacAddr([1; 6]), paired_time_ms: 1 },
    )
    .unwrap();

    store::factory_reset(&mut flash).unwrap();
    assert_eq!(store::load_network_key(&mut flash).unwrap(), None);
    assert_eq!(store::load_binding(&mut flash, id(0)).unwrap(), None);
}
