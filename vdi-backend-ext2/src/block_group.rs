use scroll::{Pread, Pwrite};

use crate::superblock::{self, Superblock};

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Pread, Pwrite)]
pub struct BlockGroupDescriptor {
    pub block_bm_baddr: u32,
    pub inode_bm_baddr: u32,
    pub inode_table_baddr: u32,
    pub unalloc_block_count: u16,
    pub unalloc_inode_count: u16,
    pub dir_count: u16,
    pub padding: u16,
    pub reserved: [u8; 12],
}

impl BlockGroupDescriptor {
    pub const SIZE: usize = 32;

    pub fn block_usage_bm_start_baddr(&self) -> u64 {
        u64::from(self.block_bm_baddr)
    }
    pub fn inode_usage_bm_start_baddr(&self) -> u64 {
        u64::from(self.inode_bm_baddr)
    }
    pub fn inode_table_start_baddr(&self) -> u64 {
        u64::from(self.inode_table_baddr)
    }

    /// Decode consecutive descriptors, filling all of `table`.
    pub fn parse_table(bytes: &[u8], table: &mut [Self]) -> Result<(), scroll::Error> {
        for (index, descriptor) in table.iter_mut().enumerate() {
            *descriptor = bytes.pread_with(index * Self::SIZE, scroll::LE)?;
        }
        Ok(())
    }
    pub fn serialize_table(table: &[Self], bytes: &mut [u8]) -> Result<(), scroll::Error> {
        for (index, descriptor) in table.iter().enumerate() {
            bytes.pwrite_with(descriptor, index * Self::SIZE, scroll::LE)?;
        }
        Ok(())
    }
}

/// The block holding the start of the primary descriptor table: the one after the block containing
/// the primary superblock.
pub fn bgdt_first_block(superblock: &Superblock) -> u64 {
    block_group_address(
        superblock,
        superblock::SUPERBLOCK_OFFSET + superblock::SUPERBLOCK_LEN - 1,
    ) + 1
}
pub fn block_group_address(superblock: &Superblock, offset: u64) -> u64 {
    offset / u64::from(superblock.block_size())
}
/// The number of whole blocks needed to hold a table of `count` descriptors.
pub fn bgdt_block_count(superblock: &Superblock, count: usize) -> u64 {
    vdi::div_round_up(
        (count * BlockGroupDescriptor::SIZE) as u64,
        u64::from(superblock.block_size()),
    )
}
