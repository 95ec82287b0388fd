//! The boot-sector (MBR) partition table, and a window onto one of its partitions.

use std::{
    cmp, fmt,
    io::{self, prelude::*, SeekFrom},
    path::Path,
};

use quick_error::quick_error;
use scroll::{Pread, Pwrite};

use crate::container::{Container, ContainerError};
use crate::Options;

pub const BOOT_SECTOR_LEN: usize = 512;
pub const TABLE_OFFSET: usize = 446;
pub const TABLE_LEN: usize = 64;
pub const BOOT_SIGNATURE_OFFSET: usize = 510;
pub const BOOT_SIGNATURE: u16 = 0xAA55;

/// Number of entries in the table; extended partitions aren't followed.
pub const ENTRY_COUNT: usize = 4;

#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Pread, Pwrite)]
pub struct PartitionEntry {
    pub status: u8,
    pub first_chs: [u8; 3],
    pub partition_type: u8,
    pub last_chs: [u8; 3],
    pub first_lba: u32,
    pub sector_count: u32,
}

impl PartitionEntry {
    pub const SIZE: usize = 16;

    pub fn is_bootable(&self) -> bool {
        self.status & 0x80 != 0
    }
    pub fn is_used(&self) -> bool {
        self.partition_type != 0 && self.sector_count != 0
    }
    pub fn kind(&self) -> PartitionType {
        PartitionType::from_mbr_type(self.partition_type)
    }
}

/// The partition types worth telling apart when looking for a filesystem.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum PartitionType {
    Empty,
    Fat,
    Extended,
    Ntfs,
    LinuxSwap,
    Linux,
    LinuxLvm,
    LinuxRaid,
    GptProtective,
    EfiSystem,
    Unknown(u8),
}

impl PartitionType {
    pub const LINUX: u8 = 0x83;

    pub fn from_mbr_type(type_byte: u8) -> Self {
        match type_byte {
            0x00 => Self::Empty,
            0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E => Self::Fat,
            0x05 | 0x0F | 0x85 => Self::Extended,
            0x07 => Self::Ntfs,
            0x82 => Self::LinuxSwap,
            0x83 => Self::Linux,
            0x8E => Self::LinuxLvm,
            0xFD => Self::LinuxRaid,
            0xEE => Self::GptProtective,
            0xEF => Self::EfiSystem,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Fat => write!(f, "FAT"),
            Self::Extended => write!(f, "extended"),
            Self::Ntfs => write!(f, "NTFS/exFAT"),
            Self::LinuxSwap => write!(f, "Linux swap"),
            Self::Linux => write!(f, "Linux"),
            Self::LinuxLvm => write!(f, "Linux LVM"),
            Self::LinuxRaid => write!(f, "Linux RAID"),
            Self::GptProtective => write!(f, "GPT protective"),
            Self::EfiSystem => write!(f, "EFI system"),
            Self::Unknown(byte) => write!(f, "unknown ({:#04x})", byte),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    pub entries: [PartitionEntry; ENTRY_COUNT],
    pub boot_signature: u16,
}

impl PartitionTable {
    /// Parse the table out of a complete boot sector.
    pub fn parse(boot_sector: &[u8]) -> Result<Self, scroll::Error> {
        let mut entries = [PartitionEntry::default(); ENTRY_COUNT];

        for (index, entry) in entries.iter_mut().enumerate() {
            *entry = boot_sector.pread_with(TABLE_OFFSET + index * PartitionEntry::SIZE, scroll::LE)?;
        }

        Ok(Self {
            entries,
            boot_signature: boot_sector.pread_with(BOOT_SIGNATURE_OFFSET, scroll::LE)?,
        })
    }

    /// Read the boot sector of the virtual disk, through the page map.
    pub fn load(container: &mut Container) -> Result<Self, PartitionError> {
        let mut boot_sector = [0u8; BOOT_SECTOR_LEN];

        container.seek(SeekFrom::Start(0))?;
        let read = container.read(&mut boot_sector)?;
        container.seek(SeekFrom::Start(0))?;

        if read != BOOT_SECTOR_LEN {
            return Err(PartitionError::TableUnreadable(read));
        }

        let this = Self::parse(&boot_sector)?;

        if !this.has_boot_signature() {
            log::warn!(
                "The boot sector ends with {:#06x} instead of {:#06x}; the partition table may be garbage",
                this.boot_signature,
                BOOT_SIGNATURE
            );
        }
        Ok(this)
    }

    pub fn has_boot_signature(&self) -> bool {
        self.boot_signature == BOOT_SIGNATURE
    }

    /// The index of the first used entry of the given type.
    pub fn find(&self, partition_type: u8) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.partition_type == partition_type && entry.sector_count != 0)
    }
}

quick_error! {
    #[derive(Debug)]
    pub enum PartitionError {
        ContainerOpenFailed(err: ContainerError) {
            from()
            description("the container could not be opened")
            display("the container could not be opened: {}", err)
            cause(err)
        }
        InvalidIndex(index: usize) {
            description("partition index out of range")
            display("partition index {} is out of range, there are only {} entries", index, ENTRY_COUNT)
        }
        TableUnreadable(read: usize) {
            description("the boot sector could not be read")
            display("only {} of the {} bytes of the boot sector could be read", read, BOOT_SECTOR_LEN)
        }
        NoMatchingPartition(partition_type: u8) {
            description("no partition of the requested type")
            display("no partition has the type {:#04x}", partition_type)
        }
        ParseError(err: scroll::Error) {
            from()
            description("partition table parsing error")
            display("partition table parsing error: {}", err)
            cause(err)
        }
        IoError(err: io::Error) {
            from()
            description("i/o error")
            display("i/o error: {}", err)
            cause(err)
        }
    }
}

/// A single partition of a container, addressed from its first sector.
#[derive(Debug)]
pub struct Partition {
    container: Container,
    table: PartitionTable,
    index: usize,
    sector_size: u64,
    cursor: u64,
}

impl Partition {
    /// Open an image and select the partition at `index` (0 to 3).
    pub fn open<P: AsRef<Path>>(path: P, index: usize) -> Result<Self, PartitionError> {
        Self::open_with(path, index, Options::default())
    }
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        index: usize,
        options: Options,
    ) -> Result<Self, PartitionError> {
        Self::new(Container::open_with(path, options)?, index)
    }

    /// Open an image and select the first partition with a matching type byte.
    pub fn discover<P: AsRef<Path>>(path: P, partition_type: u8) -> Result<Self, PartitionError> {
        Self::discover_with(path, partition_type, Options::default())
    }
    pub fn discover_with<P: AsRef<Path>>(
        path: P,
        partition_type: u8,
        options: Options,
    ) -> Result<Self, PartitionError> {
        Self::discover_in(Container::open_with(path, options)?, partition_type)
    }

    /// Take ownership of an open container, and select the partition at `index`.
    pub fn new(mut container: Container, index: usize) -> Result<Self, PartitionError> {
        if index >= ENTRY_COUNT {
            return Err(PartitionError::InvalidIndex(index));
        }
        let table = PartitionTable::load(&mut container)?;

        Ok(Self::with_table(container, table, index))
    }
    pub fn discover_in(mut container: Container, partition_type: u8) -> Result<Self, PartitionError> {
        let table = PartitionTable::load(&mut container)?;

        match table.find(partition_type) {
            Some(index) => Ok(Self::with_table(container, table, index)),
            None => Err(PartitionError::NoMatchingPartition(partition_type)),
        }
    }

    fn with_table(container: Container, table: PartitionTable, index: usize) -> Self {
        let sector_size = u64::from(container.sector_size());
        let entry = table.entries[index];

        let end = (u64::from(entry.first_lba) + u64::from(entry.sector_count)) * sector_size;
        if end > container.disk_size() {
            log::warn!(
                "Partition {} ends at byte {}, past the end of the {} byte disk",
                index,
                end,
                container.disk_size()
            );
        }
        log::debug!(
            "Selected partition {} ({}): {} sectors from LBA {}",
            index,
            entry.kind(),
            entry.sector_count,
            entry.first_lba
        );

        Self {
            container,
            table,
            index,
            sector_size,
            cursor: 0,
        }
    }

    /// Close the partition, and the container with it.
    pub fn close(self) {
        self.container.close()
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }
    pub fn entry(&self) -> &PartitionEntry {
        &self.table.entries[self.index]
    }
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }
    /// Offset of the first byte of the partition, on the virtual disk.
    pub fn start_offset(&self) -> u64 {
        u64::from(self.entry().first_lba) * self.sector_size
    }
    pub fn size(&self) -> u64 {
        u64::from(self.entry().sector_count) * self.sector_size
    }
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
    pub fn container(&self) -> &Container {
        &self.container
    }
    pub fn container_mut(&mut self) -> &mut Container {
        &mut self.container
    }

    /// The number of bytes the next transfer unit may span: at most one sector, and never past the
    /// end of the partition.
    fn chunk_limit(&self, wanted: usize) -> usize {
        cmp::min(
            wanted as u64,
            cmp::min(self.sector_size, self.size() - self.cursor),
        ) as usize
    }
}

impl Read for Partition {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut transferred = 0;

        while transferred < buffer.len() {
            let chunk_len = self.chunk_limit(buffer.len() - transferred);
            if chunk_len == 0 {
                break;
            }
            let logical = self.start_offset() + self.cursor;

            if let Err(error) = self.container.seek(SeekFrom::Start(logical)) {
                log::debug!("Partition read stopped at {}: {}", self.cursor, error);
                break;
            }
            let n = match self
                .container
                .read(&mut buffer[transferred..transferred + chunk_len])
            {
                Ok(n) => n,
                Err(error) => {
                    log::debug!("Partition read stopped at {}: {}", self.cursor, error);
                    break;
                }
            };

            transferred += n;
            self.cursor += n as u64;

            if n < chunk_len {
                break;
            }
        }
        Ok(transferred)
    }
}

impl Write for Partition {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        let mut transferred = 0;

        while transferred < buffer.len() {
            let chunk_len = self.chunk_limit(buffer.len() - transferred);
            if chunk_len == 0 {
                break;
            }
            let logical = self.start_offset() + self.cursor;

            if let Err(error) = self.container.seek(SeekFrom::Start(logical)) {
                log::debug!("Partition write stopped at {}: {}", self.cursor, error);
                break;
            }
            let n = match self
                .container
                .write(&buffer[transferred..transferred + chunk_len])
            {
                Ok(n) => n,
                Err(error) => {
                    log::debug!("Partition write stopped at {}: {}", self.cursor, error);
                    break;
                }
            };

            transferred += n;
            self.cursor += n as u64;

            if n < chunk_len {
                break;
            }
        }
        Ok(transferred)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.container.flush()
    }
}

impl Seek for Partition {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor = crate::seek_target(pos, self.cursor, self.size())?;
        Ok(self.cursor)
    }
}
