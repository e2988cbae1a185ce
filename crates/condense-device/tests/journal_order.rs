#![allow(unused_crate_dependencies, reason = "These are tests, not the main crate.")]

//! Recovery-journal ordering: increments before the mappings that depend
//! on them, decrements strictly after.

use oorandom::Rand32;

use condense_device::{
    BLOCK_SIZE, Device, DeviceConfig, JournalEntry, JournalEntryKind, Pbn,
};


fn byte_offset(lbn: u64) -> u64 {
    lbn * BLOCK_SIZE as u64
}

fn random_block(seed: u64) -> Vec<u8> {
    let mut rng = Rand32::new(seed);
    (0..BLOCK_SIZE).map(|_| (rng.rand_u32() >> 24) as u8).collect()
}

fn first_increment_of(entries: &[JournalEntry], pbn: Pbn) -> Option<u64> {
    entries.iter().find_map(|entry| match entry.kind {
        JournalEntryKind::Increment { pbn: incremented } if incremented == pbn => {
            Some(entry.sequence)
        }
        _ => None,
    })
}


#[test]
fn a_cold_write_journals_increment_then_mapping() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    device.write_at(byte_offset(5), &random_block(1)).unwrap();
    let (pbn, _) = device.mapping_of(5).unwrap().unwrap();

    let entries = device.journal_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, JournalEntryKind::Increment { pbn });
    assert!(matches!(
        entries[1].kind,
        JournalEntryKind::Mapping { lbn: 5, old_pbn: 0, new_pbn, .. } if new_pbn == pbn,
    ));
}

#[test]
fn an_overwrite_decrements_only_after_the_new_mapping() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    device.write_at(byte_offset(5), &random_block(1)).unwrap();
    let (old_pbn, _) = device.mapping_of(5).unwrap().unwrap();
    device.write_at(byte_offset(5), &random_block(2)).unwrap();
    let (new_pbn, _) = device.mapping_of(5).unwrap().unwrap();

    let entries = device.journal_entries();
    // Increment of the replacement, the remapping, then the decrement of
    // the replaced block, in that order.
    let increment_at = first_increment_of(&entries, new_pbn).unwrap();
    let mapping_at = entries
        .iter()
        .find_map(|entry| match entry.kind {
            JournalEntryKind::Mapping { lbn: 5, new_pbn: mapped, .. } if mapped == new_pbn => {
                Some(entry.sequence)
            }
            _ => None,
        })
        .unwrap();
    let decrement_at = entries
        .iter()
        .find_map(|entry| match entry.kind {
            JournalEntryKind::Decrement { pbn } if pbn == old_pbn => Some(entry.sequence),
            _ => None,
        })
        .unwrap();

    assert!(increment_at < mapping_at);
    assert!(mapping_at < decrement_at);
}

#[test]
fn every_mapping_has_an_earlier_increment() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();

    // A mixed workload: unique writes, duplicates, overwrites, a discard.
    let duplicate = random_block(100);
    for lbn in 0..4 {
        device.write_at(byte_offset(lbn), &random_block(lbn)).unwrap();
    }
    device.write_at(byte_offset(10), &duplicate).unwrap();
    device.write_at(byte_offset(11), &duplicate).unwrap();
    device.write_at(byte_offset(1), &random_block(50)).unwrap();
    device.discard_at(byte_offset(2), BLOCK_SIZE as u64).unwrap();

    let entries = device.journal_entries();
    for entry in &entries {
        let JournalEntryKind::Mapping { new_pbn, .. } = entry.kind else {
            continue;
        };
        if new_pbn == 0 {
            continue;
        }
        let increment_at = first_increment_of(&entries, new_pbn)
            .expect("every mapped block was incremented");
        assert!(
            increment_at < entry.sequence,
            "mapping to {new_pbn} journaled before its reference",
        );
    }

    // Entry checksums commit to the entry bodies.
    for entry in &entries {
        assert_ne!(entry.checksum, 0);
    }
}

#[test]
fn journal_flush_is_a_barrier() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    device.write_at(byte_offset(3), &random_block(9)).unwrap();
    let before = device.journal_entries().len();

    device.flush().unwrap();
    assert_eq!(device.statistics().flushes, 1);
    assert_eq!(device.journal_entries().len(), before);
}
