use std::{fmt, ops};

use bitflags::bitflags;
use scroll::{Pread, Pwrite};

use vdi::Uuid;

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_LEN: u64 = 1024;

pub const SIGNATURE: u16 = 0xEF53;

/// Offset of the revision 1 fields, right after the fields every revision has.
pub const EXTENSION_OFFSET: usize = 84;

/// Blocks larger than 64 KiB are refused.
pub const MAX_LOG_BLOCK_SIZE: u32 = 6;

#[derive(Clone, Debug, Pread, Pwrite)]
pub struct SuperblockBase {
    pub inode_count: u32,
    pub block_count: u32,
    pub reserved_block_count: u32,
    pub unalloc_block_count: u32,
    pub unalloc_inode_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_fragment_size: u32,
    pub blocks_per_group: u32,
    pub fragments_per_group: u32,
    pub inodes_per_group: u32,
    pub last_mount_time: u32,
    pub last_write_time: u32,
    pub mounts_since_fsck: u16,
    pub mounts_left_before_fsck: u16,
    pub signature: u16,
    pub fs_state: u16,
    pub error_handling: u16,
    pub minor_version: u16,
    pub last_fsck_time: u32,
    pub interval_between_forced_fscks: u32,
    pub os_id: u32,
    pub major_version: u32,
    pub reserver_uid: u16,
    pub reserver_gid: u16,
}

/// The fields added by revision 1 (dynamic inode sizes). Everything past `first_meta_bg` belongs
/// to ext3 and ext4, and is carried along untouched in the raw bytes of the superblock.
#[derive(Clone, Debug, Pread, Pwrite)]
pub struct SuperblockExtension {
    pub first_nonreserved_inode: u32,
    pub inode_struct_size: u16,
    pub superblock_block_group: u16,
    pub opt_features_present: u32,
    pub req_features_present: u32,
    pub req_features_for_rw: u32,
    pub fs_id: [u8; 16],
    pub vol_name: [u8; 16],
    pub last_mount_path: [u8; 64],
    pub compression_algorithms: u32,
    pub file_prealloc_block_count: u8,
    pub dir_prealloc_block_count: u8,
    pub reserved_gdt_blocks: u16,
    pub journal_id: [u8; 16],
    pub journal_inode: u32,
    pub journal_device: u32,
    pub orphan_inode_head_list: u32,
    pub hash_seed: [u32; 4],
    pub default_hash_version: u8,
    pub jnl_backup_type: u8,
    pub bgdesc_size: u16,
    pub default_mounts_ops: u32,
    pub first_meta_bg: u32,
}

#[derive(Clone)]
pub struct Superblock {
    pub base: SuperblockBase,
    pub extended: Option<SuperblockExtension>,

    // The complete record as it was read, so that serializing doesn't zero whatever comes after the
    // decoded fields.
    raw: Box<[u8]>,
}

impl ops::Deref for Superblock {
    type Target = SuperblockBase;

    fn deref(&self) -> &SuperblockBase {
        &self.base
    }
}
impl ops::DerefMut for Superblock {
    fn deref_mut(&mut self) -> &mut SuperblockBase {
        &mut self.base
    }
}

impl fmt::Debug for Superblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Superblock")
            .field("base", &self.base)
            .field("extended", &self.extended)
            .finish()
    }
}

bitflags! {
    pub struct CompatFeatures: u32 {
        const DIR_PREALLOC = 0x0001;
        const IMAGIC_INODES = 0x0002;
        const HAS_JOURNAL = 0x0004;
        const EXT_ATTR = 0x0008;
        const RESIZE_INODE = 0x0010;
        const DIR_INDEX = 0x0020;
    }
}

bitflags! {
    pub struct IncompatFeatures: u32 {
        const COMPRESSION = 0x0001;
        const FILETYPE = 0x0002;
        const RECOVER = 0x0004;
        const JOURNAL_DEV = 0x0008;
        const META_BG = 0x0010;

        // ext4
        const EXTENTS = 0x0040;
        const _64_BIT = 0x0080;
        const FLEX_BG = 0x0200;
    }
}

bitflags! {
    pub struct RoCompatFeatures: u32 {
        const SPARSE_SUPER = 0x0001;
        const LARGE_FILE = 0x0002;
        const BTREE_DIR = 0x0004;
    }
}

impl Superblock {
    /// Decode a superblock from its 1024 bytes. The signature isn't checked here.
    pub fn parse(block_bytes: &[u8]) -> Result<Self, scroll::Error> {
        if block_bytes.len() < SUPERBLOCK_LEN as usize {
            return Err(scroll::Error::TooBig {
                size: SUPERBLOCK_LEN as usize,
                len: block_bytes.len(),
            });
        }
        let raw: Box<[u8]> = block_bytes[..SUPERBLOCK_LEN as usize].into();

        let base: SuperblockBase = raw.pread_with(0, scroll::LE)?;
        let extended = if base.major_version >= 1 {
            Some(raw.pread_with(EXTENSION_OFFSET, scroll::LE)?)
        } else {
            None
        };

        Ok(Self {
            base,
            extended,
            raw,
        })
    }
    /// Encode the superblock into 1024 bytes. Bytes that were never decoded are written back as
    /// they were read.
    pub fn serialize(&self, buffer: &mut [u8]) -> Result<(), scroll::Error> {
        if buffer.len() < self.raw.len() {
            return Err(scroll::Error::TooBig {
                size: self.raw.len(),
                len: buffer.len(),
            });
        }
        buffer[..self.raw.len()].copy_from_slice(&self.raw);
        buffer.pwrite_with(&self.base, 0, scroll::LE)?;

        if let Some(ref extended) = self.extended {
            buffer.pwrite_with(extended, EXTENSION_OFFSET, scroll::LE)?;
        }
        Ok(())
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == SIGNATURE
    }

    /// Describe what makes the block and group sizes unusable, if anything.
    pub fn geometry_error(&self) -> Option<String> {
        if self.log_block_size > MAX_LOG_BLOCK_SIZE {
            Some(format!("block size shift {} is too large", self.log_block_size))
        } else if self.blocks_per_group == 0 {
            Some("zero blocks per group".into())
        } else if self.inodes_per_group == 0 {
            Some("zero inodes per group".into())
        } else if self.first_data_block >= self.block_count {
            Some(format!(
                "the first data block {} is past the {} blocks of the filesystem",
                self.first_data_block, self.block_count
            ))
        } else {
            None
        }
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }
    pub fn block_group_count(&self) -> u32 {
        vdi::div_round_up(self.block_count, self.blocks_per_group)
    }
    pub fn inode_size(&self) -> u16 {
        self.extended
            .as_ref()
            .map(|extended| extended.inode_struct_size)
            .unwrap_or(128)
    }

    pub fn compat_features(&self) -> CompatFeatures {
        self.extended
            .as_ref()
            .map(|ext| CompatFeatures::from_bits_truncate(ext.opt_features_present))
            .unwrap_or_else(CompatFeatures::empty)
    }
    pub fn incompat_features(&self) -> IncompatFeatures {
        self.extended
            .as_ref()
            .map(|ext| IncompatFeatures::from_bits_truncate(ext.req_features_present))
            .unwrap_or_else(IncompatFeatures::empty)
    }
    pub fn ro_compat_features(&self) -> RoCompatFeatures {
        self.extended
            .as_ref()
            .map(|ext| RoCompatFeatures::from_bits_truncate(ext.req_features_for_rw))
            .unwrap_or_else(RoCompatFeatures::empty)
    }
    /// Feature bits that are set, but that none of the flag types know about, as (compat,
    /// incompat, ro_compat).
    pub fn unknown_features(&self) -> (u32, u32, u32) {
        match self.extended {
            Some(ref ext) => (
                ext.opt_features_present & !CompatFeatures::all().bits(),
                ext.req_features_present & !IncompatFeatures::all().bits(),
                ext.req_features_for_rw & !RoCompatFeatures::all().bits(),
            ),
            None => (0, 0, 0),
        }
    }
    pub fn is_64bit(&self) -> bool {
        self.incompat_features().contains(IncompatFeatures::_64_BIT)
    }
    pub fn has_sparse_super(&self) -> bool {
        self.ro_compat_features().contains(RoCompatFeatures::SPARSE_SUPER)
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.extended.as_ref().map(|ext| ext.fs_id).unwrap_or([0u8; 16]))
    }
    pub fn volume_name(&self) -> String {
        self.extended
            .as_ref()
            .map(|ext| nul_terminated(&ext.vol_name))
            .unwrap_or_default()
    }
    pub fn last_mounted(&self) -> String {
        self.extended
            .as_ref()
            .map(|ext| nul_terminated(&ext.last_mount_path))
            .unwrap_or_default()
    }

    pub fn fs_state(&self) -> Option<FilesystemState> {
        FilesystemState::try_parse(self.fs_state)
    }
    pub fn error_handling(&self) -> Option<ErrorHandlingMethod> {
        ErrorHandlingMethod::try_parse(self.error_handling)
    }
    pub fn os_id(&self) -> Option<OsId> {
        OsId::try_parse(self.os_id)
    }

    /// Whether a group carries a copy of the superblock (and of the descriptor table).
    pub fn has_superblock_backup(&self, group: u32) -> bool {
        !self.has_sparse_super() || group <= 1 || is_power_of(group, 3) || is_power_of(group, 5) || is_power_of(group, 7)
    }
    /// The groups holding a superblock, the primary one included.
    pub fn superblock_groups(&self) -> Vec<u32> {
        (0..self.block_group_count())
            .filter(|&group| self.has_superblock_backup(group))
            .collect()
    }
    /// The block number that locates the superblock copy of a group, in the numbering
    /// `Filesystem::fetch_superblock` takes. This is the first block of the group; for 1 KiB blocks
    /// the copy itself sits one block later.
    pub fn backup_superblock_block(&self, group: u32) -> u64 {
        u64::from(group) * u64::from(self.blocks_per_group)
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn is_power_of(mut number: u32, base: u32) -> bool {
    if number == 0 {
        return false;
    }
    while number % base == 0 {
        number /= base;
    }
    number == 1
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum FilesystemState {
    Clean = 1,
    HasErrors = 2,
}
impl FilesystemState {
    pub fn try_parse(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(FilesystemState::Clean),
            2 => Some(FilesystemState::HasErrors),
            _ => None,
        }
    }
}
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ErrorHandlingMethod {
    IgnoreError = 1,
    RemountAsRo = 2,
    KernelPanic = 3,
}
impl ErrorHandlingMethod {
    pub fn try_parse(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(ErrorHandlingMethod::IgnoreError),
            2 => Some(ErrorHandlingMethod::RemountAsRo),
            3 => Some(ErrorHandlingMethod::KernelPanic),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum OsId {
    Linux = 0,
    Hurd = 1,
    Masix = 2,
    FreeBsd = 3,
    OtherBsds = 4,
}
impl OsId {
    pub fn try_parse(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(OsId::Linux),
            1 => Some(OsId::Hurd),
            2 => Some(OsId::Masix),
            3 => Some(OsId::FreeBsd),
            4 => Some(OsId::OtherBsds),
            _ => None,
        }
    }
}
