#![allow(unused_crate_dependencies, reason = "These are tests, not the main crate.")]

//! Discards: full blocks unmap, partial blocks zero a subrange.

use oorandom::Rand32;

use condense_device::{BLOCK_SIZE, Device, DeviceConfig};


fn byte_offset(lbn: u64) -> u64 {
    lbn * BLOCK_SIZE as u64
}

fn random_block(seed: u64) -> Vec<u8> {
    let mut rng = Rand32::new(seed);
    (0..BLOCK_SIZE).map(|_| (rng.rand_u32() >> 24) as u8).collect()
}


#[test]
fn discarding_a_full_block_unmaps_it() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let data = random_block(1);

    device.write_at(byte_offset(9), &data).unwrap();
    let (pbn, _) = device.mapping_of(9).unwrap().unwrap();
    assert_eq!(device.reference_count(pbn), 1);

    device.discard_at(byte_offset(9), BLOCK_SIZE as u64).unwrap();

    assert_eq!(device.mapping_of(9).unwrap(), None);
    assert_eq!(device.reference_count(pbn), 0);

    let mut read_back = vec![0xFF_u8; BLOCK_SIZE];
    device.read_at(byte_offset(9), &mut read_back).unwrap();
    assert!(read_back.iter().all(|&byte| byte == 0));
}

#[test]
fn discarding_an_unmapped_block_is_a_quiet_no_op() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    device.discard_at(byte_offset(12), BLOCK_SIZE as u64).unwrap();
    assert_eq!(device.mapping_of(12).unwrap(), None);
}

#[test]
fn partial_discard_zeroes_a_subrange() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let data = random_block(2);

    device.write_at(byte_offset(5), &data).unwrap();
    // Discard one sector in the middle.
    device.discard_at(byte_offset(5) + 1024, 512).unwrap();

    let mut expected = data;
    expected[1024..1536].fill(0);
    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(5), &mut read_back).unwrap();
    assert_eq!(read_back, expected);

    // The block is still mapped; only a full-block discard unmaps.
    assert!(device.mapping_of(5).unwrap().is_some());
}

#[test]
fn a_discard_train_spans_blocks() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    for lbn in 20..23 {
        device.write_at(byte_offset(lbn), &random_block(lbn)).unwrap();
    }

    // From half way into block 20 through the end of block 22.
    let start = byte_offset(20) + (BLOCK_SIZE / 2) as u64;
    let len = (BLOCK_SIZE / 2 + 2 * BLOCK_SIZE) as u64;
    device.discard_at(start, len).unwrap();

    // Block 20 is half-zeroed but mapped; 21 and 22 are gone.
    assert!(device.mapping_of(20).unwrap().is_some());
    assert_eq!(device.mapping_of(21).unwrap(), None);
    assert_eq!(device.mapping_of(22).unwrap(), None);

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(20), &mut read_back).unwrap();
    assert!(read_back[BLOCK_SIZE / 2..].iter().all(|&byte| byte == 0));
    assert!(read_back[..BLOCK_SIZE / 2].iter().any(|&byte| byte != 0));
}

#[test]
fn discarded_space_can_be_reallocated() {
    // A device with two usable data blocks.
    let device = Device::open(DeviceConfig::new(64, 3).with_physical_zones(1)).unwrap();

    device.write_at(byte_offset(0), &random_block(10)).unwrap();
    device.write_at(byte_offset(1), &random_block(11)).unwrap();

    device.discard_at(byte_offset(0), BLOCK_SIZE as u64).unwrap();
    device.write_at(byte_offset(2), &random_block(12)).unwrap();

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(2), &mut read_back).unwrap();
    assert_eq!(read_back, random_block(12));
}
