#![allow(unused_crate_dependencies, reason = "These are tests, not the main crate.")]

//! Failure semantics: space exhaustion, read-only mode, and I/O errors.

use std::sync::Arc;

use oorandom::Rand32;

use condense_device::{
    BLOCK_SIZE, Device, DeviceConfig, MemoryIndex, MemoryStore, Status,
};


fn byte_offset(lbn: u64) -> u64 {
    lbn * BLOCK_SIZE as u64
}

fn random_block(seed: u64) -> Vec<u8> {
    let mut rng = Rand32::new(seed);
    (0..BLOCK_SIZE).map(|_| (rng.rand_u32() >> 24) as u8).collect()
}


#[test]
fn exhaustion_fails_with_no_space() {
    // One zero block plus two allocatable blocks.
    let device = Device::open(DeviceConfig::new(64, 3)).unwrap();

    device.write_at(byte_offset(0), &random_block(1)).unwrap();
    device.write_at(byte_offset(1), &random_block(2)).unwrap();
    assert_eq!(
        device.write_at(byte_offset(2), &random_block(3)),
        Err(Status::NoSpace),
    );
    assert_eq!(device.statistics().no_space_errors, 1);

    // The failed write held nothing: freeing one block makes room again.
    device.discard_at(byte_offset(0), BLOCK_SIZE as u64).unwrap();
    device.write_at(byte_offset(2), &random_block(3)).unwrap();

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(2), &mut read_back).unwrap();
    assert_eq!(read_back, random_block(3));
}

#[test]
fn no_space_does_not_disturb_existing_data() {
    let device = Device::open(DeviceConfig::new(64, 2)).unwrap();

    device.write_at(byte_offset(0), &random_block(7)).unwrap();
    assert_eq!(
        device.write_at(byte_offset(1), &random_block(8)),
        Err(Status::NoSpace),
    );

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(0), &mut read_back).unwrap();
    assert_eq!(read_back, random_block(7));
    assert_eq!(device.mapping_of(1).unwrap(), None);
}

#[test]
fn zero_writes_need_no_space() {
    let device = Device::open(DeviceConfig::new(64, 2)).unwrap();
    device.write_at(byte_offset(0), &random_block(9)).unwrap();

    // The device is full, but all-zero writes allocate nothing.
    device.write_at(byte_offset(1), &vec![0_u8; BLOCK_SIZE]).unwrap();
    let mut read_back = vec![0xFF_u8; BLOCK_SIZE];
    device.read_at(byte_offset(1), &mut read_back).unwrap();
    assert!(read_back.iter().all(|&byte| byte == 0));
}

#[test]
fn read_only_mode_rejects_writes_and_serves_reads() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let data = random_block(21);
    device.write_at(byte_offset(4), &data).unwrap();

    device.enter_read_only_mode();

    assert_eq!(device.write_at(byte_offset(5), &data), Err(Status::ReadOnly));
    assert_eq!(
        device.discard_at(byte_offset(4), BLOCK_SIZE as u64),
        Err(Status::ReadOnly),
    );
    assert_eq!(device.statistics().read_only_rejections, 2);

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(4), &mut read_back).unwrap();
    assert_eq!(read_back, data);
}

#[test]
fn backing_store_read_errors_are_surfaced() {
    let config = DeviceConfig::new(64, 64);
    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(MemoryStore::new(64));
    let device = Device::open_with(config, index, store.clone()).unwrap();

    let data = random_block(33);
    device.write_at(byte_offset(6), &data).unwrap();

    store.set_read_fault(true);
    let mut read_back = vec![0_u8; BLOCK_SIZE];
    assert_eq!(device.read_at(byte_offset(6), &mut read_back), Err(Status::Io));

    // Writes of fresh content never read and still succeed.
    device.write_at(byte_offset(7), &random_block(34)).unwrap();

    store.set_read_fault(false);
    device.read_at(byte_offset(6), &mut read_back).unwrap();
    assert_eq!(read_back, data);
}

#[test]
fn verify_read_errors_fall_back_to_allocation() {
    let config = DeviceConfig::new(64, 64);
    let index = Arc::new(MemoryIndex::new());
    let store = Arc::new(MemoryStore::new(64));
    let device = Device::open_with(config, index, store.clone()).unwrap();

    let data = random_block(55);
    device.write_at(byte_offset(8), &data).unwrap();
    let (first_pbn, _) = device.mapping_of(8).unwrap().unwrap();

    // The duplicate write probes, then fails to read the candidate back;
    // the error is swallowed and a fresh block is written instead.
    store.set_read_fault(true);
    device.write_at(byte_offset(9), &data).unwrap();
    store.set_read_fault(false);

    let (second_pbn, _) = device.mapping_of(9).unwrap().unwrap();
    assert_ne!(second_pbn, first_pbn);
    assert_eq!(device.reference_count(first_pbn), 1);
    assert_eq!(device.reference_count(second_pbn), 1);

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(9), &mut read_back).unwrap();
    assert_eq!(read_back, data);
}
