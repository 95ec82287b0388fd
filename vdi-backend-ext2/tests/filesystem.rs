use std::fs;

use vdi::{fixtures::ImageBuilder, Options, PartitionEntry, PartitionType, UnallocatedPolicy};
use vdi_backend_ext2::{
    superblock::{RoCompatFeatures, SIGNATURE},
    BlockGroupDescriptor, Filesystem, OpenError, Selector,
};

const PAGE_SIZE: u32 = 4096;
const PARTITION_LBA: u32 = 8;
const BLOCK_COUNT: u32 = 100;
const BLOCKS_PER_GROUP: u32 = 32;
const GROUP_COUNT: u32 = 4;

struct Fixture {
    file: tempfile::NamedTempFile,
    partition: Vec<u8>,
    block_size: usize,
}

fn first_data_block(log_block_size: u32) -> u32 {
    if log_block_size == 0 {
        1
    } else {
        0
    }
}

fn superblock_bytes(log_block_size: u32, group: u16) -> Vec<u8> {
    let mut bytes = vec![0u8; 1024];
    vdi::write_u32(&mut bytes, 0, GROUP_COUNT * 8);
    vdi::write_u32(&mut bytes, 4, BLOCK_COUNT);
    vdi::write_u32(&mut bytes, 12, 60);
    vdi::write_u32(&mut bytes, 16, 20);
    vdi::write_u32(&mut bytes, 20, first_data_block(log_block_size));
    vdi::write_u32(&mut bytes, 24, log_block_size);
    vdi::write_u32(&mut bytes, 28, log_block_size);
    vdi::write_u32(&mut bytes, 32, BLOCKS_PER_GROUP);
    vdi::write_u32(&mut bytes, 36, BLOCKS_PER_GROUP);
    vdi::write_u32(&mut bytes, 40, 8);
    vdi::write_u16(&mut bytes, 56, SIGNATURE);
    vdi::write_u16(&mut bytes, 58, 1);
    vdi::write_u16(&mut bytes, 60, 1);
    vdi::write_u32(&mut bytes, 76, 1);
    vdi::write_u32(&mut bytes, 84, 11);
    vdi::write_u16(&mut bytes, 88, 128);
    vdi::write_u16(&mut bytes, 90, group);
    vdi::write_u32(&mut bytes, 100, RoCompatFeatures::SPARSE_SUPER.bits());
    bytes[104..120].copy_from_slice(&[0x42; 16]);
    bytes[120..127].copy_from_slice(b"fixture");
    bytes
}

fn descriptor(log_block_size: u32, group: u32) -> BlockGroupDescriptor {
    let group_start = first_data_block(log_block_size) + group * BLOCKS_PER_GROUP;

    BlockGroupDescriptor {
        block_bm_baddr: group_start + 3,
        inode_bm_baddr: group_start + 4,
        inode_table_baddr: group_start + 5,
        unalloc_block_count: 20 + group as u16,
        unalloc_inode_count: 8,
        dir_count: group as u16,
        ..BlockGroupDescriptor::default()
    }
}

/// An image whose Linux partition holds a sparse_super ext2 filesystem of 100 blocks in 4 groups.
/// A swap partition comes first in the table.
fn fixture(log_block_size: u32) -> Fixture {
    fixture_with_hole(log_block_size, None)
}

/// Like `fixture`, but stored as a normal (sparse) image with logical page `hole` left unallocated.
fn sparse_fixture(log_block_size: u32, hole: usize) -> Fixture {
    fixture_with_hole(log_block_size, Some(hole))
}

fn fixture_with_hole(log_block_size: u32, hole: Option<usize>) -> Fixture {
    let block_size = 1024usize << log_block_size;
    let first_data_block = first_data_block(log_block_size) as usize;

    let mut partition: Vec<u8> = (0..BLOCK_COUNT as usize * block_size)
        .map(|i| (i % 251) as u8)
        .collect();

    partition[1024..2048].copy_from_slice(&superblock_bytes(log_block_size, 0));
    for &group in &[1usize, 3] {
        let offset = (first_data_block + group * BLOCKS_PER_GROUP as usize) * block_size;
        partition[offset..offset + 1024].copy_from_slice(&superblock_bytes(log_block_size, group as u16));
    }
    let group_2 = (first_data_block + 2 * BLOCKS_PER_GROUP as usize) * block_size;
    for byte in &mut partition[group_2..group_2 + 1024] {
        *byte = 0;
    }

    let bgdt_offset = (first_data_block + 1) * block_size;
    for group in 0..GROUP_COUNT {
        let bytes = &mut partition[bgdt_offset + group as usize * BlockGroupDescriptor::SIZE..];
        let descriptor = descriptor(log_block_size, group);
        vdi::write_u32(bytes, 0, descriptor.block_bm_baddr);
        vdi::write_u32(bytes, 4, descriptor.inode_bm_baddr);
        vdi::write_u32(bytes, 8, descriptor.inode_table_baddr);
        vdi::write_u16(bytes, 12, descriptor.unalloc_block_count);
        vdi::write_u16(bytes, 14, descriptor.unalloc_inode_count);
        vdi::write_u16(bytes, 16, descriptor.dir_count);
        for byte in &mut bytes[18..32] {
            *byte = 0;
        }
    }

    let disk_size = u64::from(PARTITION_LBA) * 512 + partition.len() as u64;
    let mut builder = ImageBuilder::new(disk_size, PAGE_SIZE);
    builder
        .write(u64::from(PARTITION_LBA) * 512, &partition)
        .partition(
            0,
            PartitionEntry {
                partition_type: 0x82,
                first_lba: 1,
                sector_count: PARTITION_LBA - 1,
                ..PartitionEntry::default()
            },
        )
        .partition(
            1,
            PartitionEntry {
                status: 0x80,
                partition_type: PartitionType::LINUX,
                first_lba: PARTITION_LBA,
                sector_count: (partition.len() / 512) as u32,
                ..PartitionEntry::default()
            },
        );
    match hole {
        Some(page) => builder.unallocate(page),
        None => builder.fixed(),
    };

    Fixture {
        file: builder.write_temp().unwrap(),
        partition,
        block_size,
    }
}

#[test]
fn first_block_matches_the_partition() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    assert_eq!(filesystem.partition().index(), 1);
    assert_eq!(filesystem.block_size(), 1024);

    let mut block = vec![0u8; 1024];
    assert!(filesystem.fetch_block(0, &mut block));
    assert_eq!(&block[..], &fixture.partition[..1024]);

    let expected: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(block, expected);

    assert_eq!(&*filesystem.read_block(57).unwrap(), &fixture.partition[57 * 1024..58 * 1024]);
}

#[test]
fn geometry_and_descriptor_table() {
    let fixture = fixture(0);
    let filesystem = Filesystem::open(fixture.file.path()).unwrap();

    assert_eq!(filesystem.superblock.block_count, 100);
    assert_eq!(filesystem.superblock.blocks_per_group, 32);
    assert_eq!(filesystem.group_count(), 4);
    assert_eq!(filesystem.bgdt_block(), 2);
    assert_eq!(filesystem.superblock.volume_name(), "fixture");
    assert_eq!(filesystem.superblock.uuid().as_bytes(), &[0x42; 16]);

    let expected: Vec<_> = (0..GROUP_COUNT).map(|group| descriptor(0, group)).collect();
    assert_eq!(filesystem.bgdt(), &expected[..]);
}

#[test]
fn backup_superblocks_with_small_blocks() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
    let primary = filesystem.superblock.clone();

    assert_eq!(primary.superblock_groups(), vec![0, 1, 3]);
    assert_eq!(filesystem.superblock_offset(32), Some(33 * 1024));

    for group in primary.superblock_groups() {
        let mut superblock = primary.clone();
        assert!(filesystem.fetch_superblock(primary.backup_superblock_block(group), &mut superblock));
        assert_eq!(
            superblock.extended.as_ref().unwrap().superblock_block_group,
            group as u16
        );
        assert_eq!(superblock.block_count, primary.block_count);
    }
}

#[test]
fn backup_superblocks_with_large_blocks() {
    let fixture = fixture(2);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
    let primary = filesystem.superblock.clone();

    assert_eq!(filesystem.block_size(), 4096);
    assert_eq!(filesystem.bgdt_block(), 1);
    assert_eq!(filesystem.superblock_offset(0), Some(1024));
    assert_eq!(filesystem.superblock_offset(96), Some(96 * 4096));

    let mut superblock = primary.clone();
    assert!(filesystem.fetch_superblock(primary.backup_superblock_block(3), &mut superblock));
    assert_eq!(superblock.extended.as_ref().unwrap().superblock_block_group, 3);

    let expected: Vec<_> = (0..GROUP_COUNT).map(|group| descriptor(2, group)).collect();
    assert_eq!(filesystem.bgdt(), &expected[..]);

    let mut block = vec![0u8; fixture.block_size];
    assert!(filesystem.fetch_block(0, &mut block));
    assert_eq!(block, &fixture.partition[..fixture.block_size]);
}

#[test]
fn missing_signatures_are_rejected() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    let mut superblock = filesystem.superblock.clone();
    superblock.mounts_since_fsck = 99;

    // Group 2 has no superblock copy, and its first bytes were zeroed.
    assert!(!filesystem.fetch_superblock(64, &mut superblock));
    assert_eq!(superblock.mounts_since_fsck, 99);
}

#[test]
fn partitions_without_ext2_are_refused() {
    let fixture = fixture(0);

    match Filesystem::open_with(fixture.file.path(), Selector::Index(0), Options::default()) {
        Err(OpenError::BadMagic(Some(0))) => (),
        other => panic!("expected a bad signature, got {:?}", other),
    }
    assert!(matches!(
        Filesystem::open_with(fixture.file.path(), Selector::Type(0x07), Options::default()),
        Err(OpenError::PartitionOpenFailed(_))
    ));
    assert!(Filesystem::open_with(fixture.file.path(), Selector::Index(1), Options::default()).is_ok());
}

#[test]
fn zeroed_primary_superblocks_fail_to_open() {
    let fixture = fixture(0);
    {
        let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
        let mut block = filesystem.read_block(1).unwrap();
        vdi::write_u16(&mut block, 56, 0);
        assert!(filesystem.write_block(1, &block));
        filesystem.close();
    }
    assert!(matches!(
        Filesystem::open(fixture.file.path()),
        Err(OpenError::BadMagic(Some(0)))
    ));
}

#[test]
fn written_blocks_read_back() {
    let fixture = fixture(0);
    let data: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();

    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
    assert!(filesystem.write_block(70, &data));

    let mut block = vec![0u8; 1024];
    assert!(filesystem.fetch_block(70, &mut block));
    assert_eq!(block, data);
    assert!(filesystem.fetch_block(71, &mut block));
    assert_eq!(&block[..], &fixture.partition[71 * 1024..72 * 1024]);
    filesystem.close();

    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
    assert_eq!(&*filesystem.read_block(70).unwrap(), &data[..]);
}

#[test]
fn blocks_past_the_partition_are_not_read() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    let mut block = vec![0u8; 1024];
    assert!(filesystem.fetch_block(99, &mut block));
    assert!(!filesystem.fetch_block(100, &mut block));
    assert!(!filesystem.write_block(100, &block));
    assert!(filesystem.read_block(100).is_err());

    let mut small = vec![0u8; 512];
    assert!(!filesystem.fetch_block(0, &mut small));
}

#[test]
fn huge_block_numbers_are_refused() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();
    let mut block = vec![0u8; 1024];

    assert!(!filesystem.fetch_block(u64::max_value() / 512, &mut block));
    assert!(!filesystem.fetch_block(u64::max_value(), &mut block));
    assert!(!filesystem.write_block(u64::max_value() / 512, &block));
    assert!(filesystem.read_block(u64::max_value()).is_err());

    assert_eq!(filesystem.superblock_offset(u64::max_value()), None);
    assert_eq!(filesystem.superblock_offset(u64::max_value() / 1024), None);

    let mut superblock = filesystem.superblock.clone();
    assert!(!filesystem.fetch_superblock(u64::max_value(), &mut superblock));
    assert!(!filesystem.write_superblock(u64::max_value(), &superblock));

    let mut table = filesystem.bgdt().to_vec();
    assert!(!filesystem.fetch_bgdt(u64::max_value(), &mut table));
    assert!(!filesystem.write_bgdt(u64::max_value(), &table));

    // Nothing was disturbed.
    assert!(filesystem.fetch_block(0, &mut block));
    assert_eq!(&block[..], &fixture.partition[..1024]);
}

// Logical page 10 covers disk bytes 40960..45056, which is partition blocks 36..40 with 1 KiB
// blocks, since the partition starts at 4096.
const HOLE_PAGE: usize = 10;
const BLOCK_IN_HOLE: u64 = 37;

#[test]
fn holes_read_as_zeroes_when_zero_filling() {
    let fixture = sparse_fixture(0, HOLE_PAGE);
    let options = Options {
        unallocated: UnallocatedPolicy::ZeroFill,
        ..Options::default()
    };
    let mut filesystem = Filesystem::open_with(fixture.file.path(), Selector::default(), options).unwrap();

    let mut block = vec![0xAAu8; 1024];
    assert!(filesystem.fetch_block(BLOCK_IN_HOLE, &mut block));
    assert_eq!(block, vec![0u8; 1024]);

    assert!(filesystem.fetch_block(20, &mut block));
    assert_eq!(&block[..], &fixture.partition[20 * 1024..21 * 1024]);
    assert_eq!(filesystem.group_count(), GROUP_COUNT);
}

#[test]
fn holes_are_not_read_by_default() {
    let fixture = sparse_fixture(0, HOLE_PAGE);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    let mut block = vec![0u8; 1024];
    assert!(!filesystem.fetch_block(BLOCK_IN_HOLE, &mut block));
    assert!(filesystem.read_block(36).is_err());
    assert!(filesystem.read_block(39).is_err());

    assert!(filesystem.fetch_block(35, &mut block));
    assert_eq!(&block[..], &fixture.partition[35 * 1024..36 * 1024]);
    assert!(filesystem.fetch_block(40, &mut block));
    assert_eq!(&block[..], &fixture.partition[40 * 1024..41 * 1024]);
}

#[test]
fn descriptor_tables_are_rewritten_in_place() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    let mut table = filesystem.bgdt().to_vec();
    table[3].unalloc_block_count = 1;
    table[3].dir_count = 5;
    assert!(filesystem.write_bgdt(2, &table));

    let mut fetched = vec![BlockGroupDescriptor::default(); 4];
    assert!(filesystem.fetch_bgdt(2, &mut fetched));
    assert_eq!(fetched, table);

    // The table covers the first 128 bytes of block 2; the rest of the block is untouched.
    let block = filesystem.read_block(2).unwrap();
    assert_eq!(&block[128..], &fixture.partition[2 * 1024 + 128..3 * 1024]);

    assert!(!filesystem.fetch_bgdt(2, &mut fetched[..3]));
    assert!(!filesystem.write_bgdt(2, &table[..3]));
}

#[test]
fn superblocks_are_written_losslessly() {
    let fixture = fixture(0);
    let mut filesystem = Filesystem::open(fixture.file.path()).unwrap();

    let mut superblock = filesystem.superblock.clone();
    superblock.mounts_since_fsck = 3;
    assert!(filesystem.write_superblock(0, &superblock));

    let block = filesystem.read_block(1).unwrap();
    let mut expected = fixture.partition[1024..2048].to_vec();
    vdi::write_u16(&mut expected, 52, 3);
    assert_eq!(&block[..], &expected[..]);

    let mut fetched = filesystem.superblock.clone();
    assert!(filesystem.fetch_superblock(0, &mut fetched));
    assert_eq!(fetched.mounts_since_fsck, 3);
}

#[test]
fn immutable_images_are_not_written() {
    let fixture = fixture(0);
    let before = fs::read(fixture.file.path()).unwrap();

    let options = Options {
        immutable: true,
        ..Options::default()
    };
    let mut filesystem = Filesystem::open_with(fixture.file.path(), Selector::default(), options).unwrap();

    assert!(!filesystem.write_block(70, &vec![0xFF; 1024]));
    let superblock = filesystem.superblock.clone();
    assert!(!filesystem.write_superblock(0, &superblock));
    filesystem.close();

    assert_eq!(fs::read(fixture.file.path()).unwrap(), before);
}

#[test]
fn open_and_close_leave_the_image_untouched() {
    let fixture = fixture(0);
    let before = fs::read(fixture.file.path()).unwrap();

    Filesystem::open(fixture.file.path()).unwrap().close();

    assert_eq!(fs::read(fixture.file.path()).unwrap(), before);
}
