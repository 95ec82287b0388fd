//! Access to the virtual disk stored inside a VirtualBox disk image (VDI), and to the MBR
//! partitions on that disk.
//!
//! The crate is split in two layers. [`Container`] translates logical offsets of the virtual disk
//! into offsets of the image file, using the page map stored in the image. [`Partition`] narrows a
//! container down to a single entry of the boot-sector partition table. Both implement
//! [`std::io::Read`], [`std::io::Write`] and [`std::io::Seek`], so that filesystem backends can
//! treat them like any other device.

use std::{mem, ops};

pub use uuid::Uuid;

pub mod container;
pub mod partition;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use container::{Container, ContainerError, Header, ImageType, TranslateError, Translation};
pub use partition::{Partition, PartitionEntry, PartitionError, PartitionTable, PartitionType};

pub fn read_u32(block: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; mem::size_of::<u32>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u32>()]);
    u32::from_le_bytes(bytes)
}
pub fn read_u16(block: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; mem::size_of::<u16>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u16>()]);
    u16::from_le_bytes(bytes)
}
pub fn write_u32(block: &mut [u8], offset: usize, number: u32) {
    let bytes = number.to_le_bytes();
    block[offset..offset + bytes.len()].copy_from_slice(&bytes)
}
pub fn write_u16(block: &mut [u8], offset: usize, number: u16) {
    let bytes = number.to_le_bytes();
    block[offset..offset + bytes.len()].copy_from_slice(&bytes)
}

/// What a read should do when it reaches a page that has no backing storage in the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnallocatedPolicy {
    /// Stop the transfer at the start of the unallocated page, returning a short count.
    Fail,

    /// Pretend the page is filled with zeroes, which is what VirtualBox itself shows the guest.
    ZeroFill,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Options {
    /// The image file is opened read-only and every write transfers zero bytes. Use this for
    /// evidence that must not be touched.
    pub immutable: bool,

    /// How reads of unallocated pages are handled. Writes never allocate pages, regardless of
    /// this setting.
    pub unallocated: UnallocatedPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            immutable: false,
            unallocated: UnallocatedPolicy::Fail,
        }
    }
}

pub fn div_round_up<T>(numer: T, denom: T) -> T
where
    T: ops::Add<Output = T> + Copy + ops::Div<Output = T> + ops::Rem<Output = T> + From<u8> + PartialEq,
{
    if numer % denom != T::from(0u8) {
        numer / denom + T::from(1u8)
    } else {
        numer / denom
    }
}

/// Compute the cursor a `SeekFrom` would result in, for a stream of `len` bytes. Seeking before
/// the start or past the end is refused.
pub(crate) fn seek_target(pos: std::io::SeekFrom, cursor: u64, len: u64) -> std::io::Result<u64> {
    use std::io::{self, SeekFrom};

    let (base, delta) = match pos {
        SeekFrom::Start(offset) => (0i128, i128::from(offset)),
        SeekFrom::Current(delta) => (i128::from(cursor), i128::from(delta)),
        SeekFrom::End(delta) => (i128::from(len), i128::from(delta)),
    };
    let target = base + delta;

    if target < 0 || target > i128::from(len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("seek target {} is outside of 0..={}", target, len),
        ));
    }
    Ok(target as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn div_round_up_groups() {
        assert_eq!(div_round_up(100u32, 32), 4);
        assert_eq!(div_round_up(96u32, 32), 3);
        assert_eq!(div_round_up(1u32, 8192), 1);
    }

    #[test]
    fn seek_bounds() {
        assert_eq!(seek_target(SeekFrom::Start(10), 0, 100).unwrap(), 10);
        assert_eq!(seek_target(SeekFrom::Current(-5), 10, 100).unwrap(), 5);
        assert_eq!(seek_target(SeekFrom::End(0), 3, 100).unwrap(), 100);
        assert_eq!(seek_target(SeekFrom::End(-100), 3, 100).unwrap(), 0);

        assert!(seek_target(SeekFrom::Current(-11), 10, 100).is_err());
        assert!(seek_target(SeekFrom::End(1), 0, 100).is_err());
        assert!(seek_target(SeekFrom::Start(101), 0, 100).is_err());
    }

    #[test]
    fn little_endian_helpers() {
        let mut block = [0u8; 16];
        write_u32(&mut block, 2, 0xBEDA_107F);
        write_u16(&mut block, 8, 0xEF53);

        assert_eq!(&block[2..6], &[0x7F, 0x10, 0xDA, 0xBE]);
        assert_eq!(read_u32(&block, 2), 0xBEDA_107F);
        assert_eq!(read_u16(&block, 8), 0xEF53);
    }
}
