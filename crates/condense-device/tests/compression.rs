#![allow(unused_crate_dependencies, reason = "These are tests, not the main crate.")]

//! The packer: compressible fragments sharing one physical block.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use condense_device::{BLOCK_SIZE, Device, DeviceConfig, MappingState};


fn byte_offset(lbn: u64) -> u64 {
    lbn * BLOCK_SIZE as u64
}

/// Highly compressible data, distinct per tag.
fn compressible_block(tag: u8) -> Vec<u8> {
    let phrase: Vec<u8> = (0..64_u8).map(|i| i.wrapping_mul(3) ^ tag).collect();
    phrase.iter().copied().cycle().take(BLOCK_SIZE).collect()
}

fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}


#[test]
fn three_fragments_pack_into_one_block() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let blocks: Vec<Vec<u8>> = (0..3).map(|tag| compressible_block(tag + 1)).collect();

    let pending: Vec<_> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            device
                .submit_write(byte_offset(10 + i as u64), block)
                .unwrap()
        })
        .collect();

    // Let all three land in packer bins, then close the bin.
    wait_for(
        || device.statistics().fragments_in_packer == 3,
        "three fragments to reach the packer",
    );
    device.flush_packer();
    for io in pending {
        io.wait().unwrap();
    }

    // One compressed block, three slots, one reference per slot.
    let mappings: Vec<_> = (10..13)
        .map(|lbn| device.mapping_of(lbn).unwrap().unwrap())
        .collect();
    let shared_pbn = mappings[0].0;
    assert!(mappings.iter().all(|&(pbn, _)| pbn == shared_pbn));

    let slots: BTreeSet<u8> = mappings
        .iter()
        .map(|&(_, state)| match state {
            MappingState::Compressed(slot) => slot,
            other => panic!("expected a compressed mapping, got {other:?}"),
        })
        .collect();
    assert_eq!(slots, BTreeSet::from([0, 1, 2]));

    assert_eq!(device.reference_count(shared_pbn), 3);
    let stats = device.statistics();
    assert_eq!(stats.compressed_blocks_written, 1);
    assert_eq!(stats.compressed_fragments_written, 3);
    assert_eq!(stats.fragments_in_packer, 0);

    // Every fragment decompresses back to its original block.
    for (i, block) in blocks.iter().enumerate() {
        let mut read_back = vec![0_u8; BLOCK_SIZE];
        device.read_at(byte_offset(10 + i as u64), &mut read_back).unwrap();
        assert_eq!(&read_back, block, "fragment {i} did not round trip");
    }
}

#[test]
fn a_lone_compressible_write_degrades_to_uncompressed() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let block = compressible_block(9);

    // The blocking wrapper flushes the packer while it waits; a bin with a
    // single fragment cannot save anything and writes the block as is.
    device.write_at(byte_offset(5), &block).unwrap();

    let (_, state) = device.mapping_of(5).unwrap().unwrap();
    assert_eq!(state, MappingState::Uncompressed);
    assert_eq!(device.statistics().compressed_blocks_written, 0);

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(5), &mut read_back).unwrap();
    assert_eq!(read_back, block);
}

#[test]
fn a_full_bin_closes_without_a_flush() {
    // Enough distinct compressible writes to fill one 14-slot bin.
    let device = Device::open(DeviceConfig::new(64, 64).with_packer_bins(1)).unwrap();
    let blocks: Vec<Vec<u8>> = (0..14).map(|tag| compressible_block(tag + 100)).collect();

    let pending: Vec<_> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            device
                .submit_write(byte_offset(20 + i as u64), block)
                .unwrap()
        })
        .collect();

    // The fourteenth fragment should close the bin by itself; the backstop
    // flusher only guards the test against fragment-size drift in the
    // compressor.
    let done = std::sync::atomic::AtomicBool::new(false);
    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(std::sync::atomic::Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(100));
                device.flush_packer();
            }
        });
        for io in pending {
            io.wait().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::Relaxed);
    });
    assert!(device.statistics().compressed_blocks_written >= 1);

    for (i, block) in blocks.iter().enumerate() {
        let mut read_back = vec![0_u8; BLOCK_SIZE];
        device.read_at(byte_offset(20 + i as u64), &mut read_back).unwrap();
        assert_eq!(&read_back, block, "fragment {i} did not round trip");
    }
}

#[test]
fn duplicates_of_a_packed_fragment_share_its_slot() {
    let device = Device::open(DeviceConfig::new(64, 64)).unwrap();
    let blocks: Vec<Vec<u8>> = (0..2).map(|tag| compressible_block(tag + 50)).collect();

    let pending: Vec<_> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            device
                .submit_write(byte_offset(30 + i as u64), block)
                .unwrap()
        })
        .collect();
    wait_for(
        || device.statistics().fragments_in_packer == 2,
        "two fragments to reach the packer",
    );
    device.flush_packer();
    for io in pending {
        io.wait().unwrap();
    }

    // A later write of the same content dedupes against the fragment.
    device.write_at(byte_offset(40), &blocks[0]).unwrap();
    let original = device.mapping_of(30).unwrap().unwrap();
    let duplicate = device.mapping_of(40).unwrap().unwrap();
    assert_eq!(duplicate, original);
    assert_eq!(device.reference_count(original.0), 3);

    let mut read_back = vec![0_u8; BLOCK_SIZE];
    device.read_at(byte_offset(40), &mut read_back).unwrap();
    assert_eq!(read_back, blocks[0]);
}

#[test]
fn compression_disabled_writes_whole_blocks() {
    let device =
        Device::open(DeviceConfig::new(64, 64).with_compression(false)).unwrap();
    let block = compressible_block(7);

    device.write_at(byte_offset(3), &block).unwrap();
    let (_, state) = device.mapping_of(3).unwrap().unwrap();
    assert_eq!(state, MappingState::Uncompressed);
    assert_eq!(device.statistics().compressed_blocks_written, 0);
}
