//! Metadata access for an ext2 filesystem living in a partition of a VDI image.
//!
//! Only the structures needed to locate everything else are handled: blocks, the superblock (and
//! its backups), and the block group descriptor table.

use std::{
    collections::TryReserveError,
    io::{self, prelude::*, SeekFrom},
    path::Path,
};

use quick_error::quick_error;

pub mod block_group;
pub mod superblock;

pub use block_group::BlockGroupDescriptor;
pub use superblock::Superblock;

use vdi::{Options, Partition, PartitionError, PartitionType};

/// How the partition holding the filesystem is chosen.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Selector {
    /// The entry at this index of the partition table.
    Index(usize),

    /// The first entry with this type byte.
    Type(u8),
}

impl Default for Selector {
    fn default() -> Self {
        Selector::Type(PartitionType::LINUX)
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum OpenError {
        PartitionOpenFailed(err: PartitionError) {
            from()
            description("the partition could not be opened")
            display("the partition could not be opened: {}", err)
            cause(err)
        }
        BadMagic(found: Option<u16>) {
            description("no ext2 superblock at the start of the partition")
            display("no ext2 superblock at the start of the partition (signature: {:x?})", found)
        }
        BadGeometry(reason: String) {
            description("unusable filesystem geometry")
            display("unusable filesystem geometry: {}", reason)
        }
        Unsupported(features: superblock::IncompatFeatures) {
            description("unsupported incompatible features")
            display("unsupported incompatible features: {:?}", features)
        }
        AllocFailed(err: TryReserveError) {
            from()
            description("the block group descriptor table could not be allocated")
            display("the block group descriptor table could not be allocated: {}", err)
        }
        BgdtUnreadable(block: u64) {
            description("the block group descriptor table could not be read")
            display("the block group descriptor table at block {} could not be read", block)
        }
        ParseError(err: scroll::Error) {
            from()
            description("superblock parsing error")
            display("superblock parsing error: {}", err)
            cause(err)
        }
    }
}

pub struct Filesystem {
    pub superblock: Superblock,
    partition: Partition,
    bgdt: Vec<BlockGroupDescriptor>,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("partition", &self.partition)
            .field("block_size", &self.block_size())
            .field("group_count", &self.group_count())
            .finish()
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
fn allocate_bytes(len: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(len)?;
    bytes.resize(len, 0);
    Ok(bytes)
}

fn read_at(partition: &mut Partition, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
    partition.seek(SeekFrom::Start(offset))?;
    partition.read_exact(buffer)
}
fn write_at(partition: &mut Partition, offset: u64, buffer: &[u8]) -> io::Result<()> {
    partition.seek(SeekFrom::Start(offset))?;
    partition.write_all(buffer)
}

impl Filesystem {
    /// Open the first Linux partition of an image.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        Self::open_with(path, Selector::default(), Options::default())
    }
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        selector: Selector,
        options: Options,
    ) -> Result<Self, OpenError> {
        let partition = match selector {
            Selector::Index(index) => Partition::open_with(path, index, options)?,
            Selector::Type(partition_type) => Partition::discover_with(path, partition_type, options)?,
        };
        Self::from_partition(partition)
    }

    /// Read the superblock and the descriptor table of the filesystem in an open partition.
    pub fn from_partition(mut partition: Partition) -> Result<Self, OpenError> {
        let mut block_bytes = [0u8; superblock::SUPERBLOCK_LEN as usize];

        if let Err(error) = read_at(&mut partition, superblock::SUPERBLOCK_OFFSET, &mut block_bytes) {
            log::debug!("Reading the primary superblock failed: {}", error);
            return Err(OpenError::BadMagic(None));
        }
        let superblock = Superblock::parse(&block_bytes)?;

        if !superblock.has_valid_signature() {
            return Err(OpenError::BadMagic(Some(superblock.signature)));
        }
        if let Some(reason) = superblock.geometry_error() {
            return Err(OpenError::BadGeometry(reason));
        }
        if superblock.is_64bit() {
            return Err(OpenError::Unsupported(superblock::IncompatFeatures::_64_BIT));
        }

        let (compat, incompat, ro_compat) = superblock.unknown_features();
        if compat | incompat | ro_compat != 0 {
            log::warn!(
                "Unknown feature bits: compat {:#x}, incompat {:#x}, ro_compat {:#x}",
                compat,
                incompat,
                ro_compat
            );
        }

        let group_count = superblock.block_group_count() as usize;

        let mut bgdt = Vec::new();
        bgdt.try_reserve_exact(group_count)?;
        bgdt.resize(group_count, BlockGroupDescriptor::default());

        let mut this = Self {
            superblock,
            partition,
            bgdt: Vec::new(),
        };

        let bgdt_block = this.bgdt_block();
        if !this.fetch_bgdt(bgdt_block, &mut bgdt) {
            return Err(OpenError::BgdtUnreadable(bgdt_block));
        }
        this.bgdt = bgdt;

        log::debug!(
            "Opened an ext2 filesystem with {} blocks of {} bytes, in {} groups (volume name {:?})",
            this.superblock.block_count,
            this.block_size(),
            group_count,
            this.superblock.volume_name()
        );

        Ok(this)
    }

    /// Close the filesystem, the partition and the container beneath it.
    pub fn close(self) {
        self.partition.close()
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size()
    }
    pub fn group_count(&self) -> u32 {
        self.superblock.block_group_count()
    }
    /// The block where the primary descriptor table starts.
    pub fn bgdt_block(&self) -> u64 {
        block_group::bgdt_first_block(&self.superblock)
    }
    /// The descriptor table as loaded when the filesystem was opened.
    pub fn bgdt(&self) -> &[BlockGroupDescriptor] {
        &self.bgdt
    }
    pub fn partition(&self) -> &Partition {
        &self.partition
    }
    pub fn partition_mut(&mut self) -> &mut Partition {
        &mut self.partition
    }

    fn block_offset(&self, block_address: u64) -> Option<u64> {
        let offset = block_address.checked_mul(u64::from(self.block_size()));

        if offset.is_none() {
            log::debug!("Block {} lies beyond any addressable offset", block_address);
        }
        offset
    }
    /// Read block `block_address` into the first `block_size` bytes of `buffer`.
    ///
    /// Block addresses count from the start of the partition.
    pub fn fetch_block(&mut self, block_address: u64, buffer: &mut [u8]) -> bool {
        let block_size = self.block_size() as usize;

        if buffer.len() < block_size {
            log::debug!("Buffer of {} bytes can't hold a block of {}", buffer.len(), block_size);
            return false;
        }
        let offset = match self.block_offset(block_address) {
            Some(offset) => offset,
            None => return false,
        };
        match read_at(&mut self.partition, offset, &mut buffer[..block_size]) {
            Ok(()) => true,
            Err(error) => {
                log::debug!("Reading block {} failed: {}", block_address, error);
                false
            }
        }
    }
    /// Write the first `block_size` bytes of `buffer` to block `block_address`.
    pub fn write_block(&mut self, block_address: u64, buffer: &[u8]) -> bool {
        let block_size = self.block_size() as usize;

        if buffer.len() < block_size {
            log::debug!("Buffer of {} bytes can't hold a block of {}", buffer.len(), block_size);
            return false;
        }
        let offset = match self.block_offset(block_address) {
            Some(offset) => offset,
            None => return false,
        };
        match write_at(&mut self.partition, offset, &buffer[..block_size]) {
            Ok(()) => true,
            Err(error) => {
                log::debug!("Writing block {} failed: {}", block_address, error);
                false
            }
        }
    }
    /// Read a block into a fresh buffer.
    pub fn read_block(&mut self, block_address: u64) -> io::Result<Box<[u8]>> {
        let mut block_bytes = allocate_bytes(self.block_size() as usize)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        if self.fetch_block(block_address, &mut block_bytes) {
            Ok(block_bytes.into_boxed_slice())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("block {} could not be read", block_address),
            ))
        }
    }

    /// The partition offset of the superblock copy for `block_address`: the primary superblock for
    /// block 0, otherwise the copy at the start of the group beginning at that block. With 1 KiB
    /// blocks, groups start at block 1 rather than 0, which puts the copy one block further.
    ///
    /// `None` if the offset doesn't fit in 64 bits.
    pub fn superblock_offset(&self, block_address: u64) -> Option<u64> {
        if block_address == 0 {
            Some(superblock::SUPERBLOCK_OFFSET)
        } else if self.block_size() == 1024 {
            block_address.checked_add(1)?.checked_mul(1024)
        } else {
            block_address.checked_mul(u64::from(self.block_size()))
        }
    }
    /// Read and decode the superblock copy for `block_address` into `superblock`, which is only
    /// replaced if the copy carries the ext2 signature.
    pub fn fetch_superblock(&mut self, block_address: u64, superblock: &mut Superblock) -> bool {
        let offset = match self.superblock_offset(block_address) {
            Some(offset) => offset,
            None => {
                log::debug!("No superblock copy can follow block {}", block_address);
                return false;
            }
        };
        let mut block_bytes = [0u8; superblock::SUPERBLOCK_LEN as usize];

        if let Err(error) = read_at(&mut self.partition, offset, &mut block_bytes) {
            log::debug!("Reading the superblock at {} failed: {}", offset, error);
            return false;
        }
        let fetched = match Superblock::parse(&block_bytes) {
            Ok(fetched) => fetched,
            Err(error) => {
                log::debug!("Decoding the superblock at {} failed: {}", offset, error);
                return false;
            }
        };
        if !fetched.has_valid_signature() {
            log::debug!(
                "The superblock at {} has signature {:#06x}",
                offset,
                fetched.signature
            );
            return false;
        }
        *superblock = fetched;
        true
    }
    /// Encode `superblock` and write it where `fetch_superblock` would read it from.
    pub fn write_superblock(&mut self, block_address: u64, superblock: &Superblock) -> bool {
        let offset = match self.superblock_offset(block_address) {
            Some(offset) => offset,
            None => {
                log::debug!("No superblock copy can follow block {}", block_address);
                return false;
            }
        };
        let mut block_bytes = [0u8; superblock::SUPERBLOCK_LEN as usize];

        if let Err(error) = superblock.serialize(&mut block_bytes) {
            log::debug!("Encoding the superblock failed: {}", error);
            return false;
        }
        match write_at(&mut self.partition, offset, &block_bytes) {
            Ok(()) => true,
            Err(error) => {
                log::debug!("Writing the superblock at {} failed: {}", offset, error);
                false
            }
        }
    }

    fn check_table_len(&self, len: usize) -> bool {
        let group_count = self.group_count() as usize;

        if len != group_count {
            log::warn!("A descriptor table of {} entries was given, but there are {} groups", len, group_count);
            return false;
        }
        true
    }
    /// Read the blocks starting at `block_address` that cover a table of `count` descriptors.
    fn fetch_bgdt_blocks(&mut self, block_address: u64, count: usize) -> Option<Vec<u8>> {
        let block_size = self.block_size() as usize;
        let block_count = block_group::bgdt_block_count(&self.superblock, count);

        let mut table_bytes = match allocate_bytes(block_count as usize * block_size) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::warn!("Allocating {} descriptor table blocks failed: {}", block_count, error);
                return None;
            }
        };
        for (index, block_bytes) in table_bytes.chunks_mut(block_size).enumerate() {
            let fetched = block_address
                .checked_add(index as u64)
                .map_or(false, |address| self.fetch_block(address, block_bytes));
            if !fetched {
                return None;
            }
        }
        Some(table_bytes)
    }
    /// Read the descriptor table stored at `block_address`, one entry per block group.
    pub fn fetch_bgdt(&mut self, block_address: u64, table: &mut [BlockGroupDescriptor]) -> bool {
        if !self.check_table_len(table.len()) {
            return false;
        }
        let table_bytes = match self.fetch_bgdt_blocks(block_address, table.len()) {
            Some(bytes) => bytes,
            None => return false,
        };
        match BlockGroupDescriptor::parse_table(&table_bytes, table) {
            Ok(()) => true,
            Err(error) => {
                log::debug!("Decoding the descriptor table failed: {}", error);
                false
            }
        }
    }
    /// Write a descriptor table at `block_address`. The rest of its last block is left as it was.
    pub fn write_bgdt(&mut self, block_address: u64, table: &[BlockGroupDescriptor]) -> bool {
        if !self.check_table_len(table.len()) {
            return false;
        }
        let mut table_bytes = match self.fetch_bgdt_blocks(block_address, table.len()) {
            Some(bytes) => bytes,
            None => return false,
        };
        if let Err(error) = BlockGroupDescriptor::serialize_table(table, &mut table_bytes) {
            log::debug!("Encoding the descriptor table failed: {}", error);
            return false;
        }

        let block_size = self.block_size() as usize;
        for (index, block_bytes) in table_bytes.chunks(block_size).enumerate() {
            let written = block_address
                .checked_add(index as u64)
                .map_or(false, |address| self.write_block(address, block_bytes));
            if !written {
                return false;
            }
        }
        true
    }
}
