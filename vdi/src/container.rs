//! The VDI container: header, page map, and logical-to-physical translation.
//!
//! A VDI file stores the virtual disk in fixed-size pages (VirtualBox calls them blocks). The page
//! map holds one 32-bit entry per logical page, naming the physical page inside the data region
//! of the file, or one of two sentinels for pages without storage. Consecutive logical pages can
//! live anywhere in the file, which is why no physical transfer here ever crosses a page
//! boundary.

use std::{
    cmp,
    convert::TryFrom,
    fmt,
    fs::{File, OpenOptions},
    io::{self, prelude::*, SeekFrom},
    ops,
    path::Path,
};

use quick_error::quick_error;
use scroll::{Pread, Pwrite};
use uuid::Uuid;

use crate::{Options, UnallocatedPolicy};

/// The signature following the informational text at the start of every VDI image.
pub const SIGNATURE: u32 = 0xBEDA_107F;

/// Version 1.1, the only header layout written by VirtualBox since 2.0.
pub const VERSION_1_1: u32 = 0x0001_0001;

pub const PRE_HEADER_LEN: usize = 72;
pub const HEADER_V1_LEN: usize = 400;
pub const HEADER_REGION_LEN: usize = PRE_HEADER_LEN + HEADER_V1_LEN;

/// Page map entry of a page that has never been written.
pub const PAGE_UNALLOCATED: u32 = 0xFFFF_FFFF;
/// Page map entry of a page that was discarded, and which reads as zeroes in VirtualBox.
pub const PAGE_ZEROED: u32 = 0xFFFF_FFFE;

#[derive(Clone, Copy, Debug, Pread, Pwrite)]
pub struct PreHeader {
    pub text: [u8; 64],
    pub signature: u32,
    pub version: u32,
}

#[derive(Clone, Copy, Debug, Pread, Pwrite)]
pub struct Geometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
    pub sector_size: u32,
}

#[derive(Clone, Copy, Debug, Pread, Pwrite)]
pub struct HeaderV1 {
    pub header_size: u32,
    pub image_type: u32,
    pub flags: u32,
    pub comment: [u8; 256],
    pub page_map_offset: u32,
    pub frame_offset: u32,
    pub legacy_geometry: Geometry,
    pub unused: u32,
    pub disk_size: u64,
    pub page_size: u32,
    pub extra_page_size: u32,
    pub total_pages: u32,
    pub allocated_pages: u32,
    pub uuid_create: [u8; 16],
    pub uuid_modify: [u8; 16],
    pub uuid_link: [u8; 16],
    pub uuid_parent_modify: [u8; 16],
    pub logical_geometry: Geometry,
}

#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub pre: PreHeader,
    pub base: HeaderV1,
}

impl ops::Deref for Header {
    type Target = HeaderV1;

    fn deref(&self) -> &HeaderV1 {
        &self.base
    }
}
impl ops::DerefMut for Header {
    fn deref_mut(&mut self) -> &mut HeaderV1 {
        &mut self.base
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ImageType {
    /// Dynamically allocated ("sparse"), the VirtualBox default.
    Normal = 1,
    Fixed = 2,
    Undo = 3,
    Diff = 4,
}
impl ImageType {
    pub fn try_parse(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(ImageType::Normal),
            2 => Some(ImageType::Fixed),
            3 => Some(ImageType::Undo),
            4 => Some(ImageType::Diff),
            _ => None,
        }
    }
    pub fn serialize(this: Self) -> u32 {
        match this {
            Self::Normal => 1,
            Self::Fixed => 2,
            Self::Undo => 3,
            Self::Diff => 4,
        }
    }
}

fn nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&byte| byte == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Header {
    pub fn parse(bytes: &[u8]) -> Result<Self, scroll::Error> {
        Ok(Self {
            pre: bytes.pread_with(0, scroll::LE)?,
            base: bytes.pread_with(PRE_HEADER_LEN, scroll::LE)?,
        })
    }
    pub fn serialize(&self, bytes: &mut [u8]) -> Result<(), scroll::Error> {
        bytes.pwrite_with(&self.pre, 0, scroll::LE)?;
        bytes.pwrite_with(&self.base, PRE_HEADER_LEN, scroll::LE)?;
        Ok(())
    }

    /// Check the fields every later computation depends on.
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.pre.signature != SIGNATURE {
            return Err(ContainerError::BadHeader(format!(
                "signature {:#010x} does not match {:#010x}",
                self.pre.signature, SIGNATURE
            )));
        }
        if self.major_version() != 1 {
            return Err(ContainerError::BadHeader(format!(
                "unsupported version {}.{}",
                self.major_version(),
                self.minor_version()
            )));
        }
        if self.header_size as usize != HEADER_V1_LEN {
            return Err(ContainerError::BadHeader(format!(
                "declared header size {} is not {}",
                self.header_size, HEADER_V1_LEN
            )));
        }
        if self.image_type().is_none() {
            return Err(ContainerError::BadHeader(format!(
                "unknown image type {}",
                self.base.image_type
            )));
        }
        if self.sector_size() == 0 {
            return Err(ContainerError::BadHeader("sector size is zero".into()));
        }
        if self.page_size == 0 || self.page_size % self.sector_size() != 0 {
            return Err(ContainerError::BadHeader(format!(
                "page size {} is not a multiple of the sector size {}",
                self.page_size,
                self.sector_size()
            )));
        }
        if u64::from(self.total_pages) * u64::from(self.page_size) < self.disk_size {
            return Err(ContainerError::BadHeader(format!(
                "{} pages of {} bytes cannot hold a disk of {} bytes",
                self.total_pages, self.page_size, self.disk_size
            )));
        }
        Ok(())
    }

    pub fn major_version(&self) -> u16 {
        (self.pre.version >> 16) as u16
    }
    pub fn minor_version(&self) -> u16 {
        self.pre.version as u16
    }
    pub fn image_type(&self) -> Option<ImageType> {
        ImageType::try_parse(self.base.image_type)
    }
    pub fn sector_size(&self) -> u32 {
        self.legacy_geometry.sector_size
    }
    /// The informational text before the signature, usually naming VirtualBox.
    pub fn text(&self) -> String {
        nul_terminated(&self.pre.text).trim_end().to_owned()
    }
    pub fn comment(&self) -> String {
        nul_terminated(&self.comment)
    }
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid_create)
    }
    pub fn modification_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid_modify)
    }
    pub fn parent_uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid_parent_modify)
    }
}

/// The result of translating a logical offset that lies within the page map.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Translation {
    /// The byte lives at this offset of the image file.
    Mapped(u64),

    /// The page holding the byte has no storage in the image.
    Unallocated,
}

quick_error! {
    #[derive(Debug)]
    pub enum ContainerError {
        NotFound(err: io::Error) {
            description("the image file could not be opened")
            display("the image file could not be opened: {}", err)
            cause(err)
        }
        BadHeader(reason: String) {
            description("invalid VDI header")
            display("invalid VDI header: {}", reason)
        }
        ParseError(err: scroll::Error) {
            from()
            description("VDI header parsing error")
            display("VDI header parsing error: {}", err)
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

quick_error! {
    #[derive(Debug, PartialEq, Eq)]
    pub enum TranslateError {
        OutOfRange(offset: u64, total_pages: u32) {
            description("logical offset outside of the page map")
            display("logical offset {} lies past the last of {} pages", offset, total_pages)
        }
    }
}

/// An open VDI image.
pub struct Container {
    file: File,
    header: Header,
    page_map: Vec<u32>,
    options: Options,
    cursor: u64,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("header", &self.header)
            .field("page_map_len", &self.page_map.len())
            .field("options", &self.options)
            .field("cursor", &self.cursor)
            .finish()
    }
}

fn read_fully(file: &mut File, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;

    let mut done = 0;
    while done < buffer.len() {
        match file.read(&mut buffer[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}
fn write_fully(file: &mut File, offset: u64, buffer: &[u8]) -> io::Result<usize> {
    file.seek(SeekFrom::Start(offset))?;

    let mut done = 0;
    while done < buffer.len() {
        match file.write(&buffer[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        }
    }
    Ok(done)
}

impl Container {
    /// Open an image with the default [`Options`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ContainerError> {
        Self::open_with(path, Options::default())
    }

    /// Open an image, parse and validate its header, and load the page map.
    pub fn open_with<P: AsRef<Path>>(path: P, options: Options) -> Result<Self, ContainerError> {
        let path = path.as_ref();

        let mut file = OpenOptions::new()
            .read(true)
            .write(!options.immutable)
            .open(path)
            .map_err(ContainerError::NotFound)?;

        let mut header_bytes = [0u8; HEADER_REGION_LEN];
        if read_fully(&mut file, 0, &mut header_bytes)? != HEADER_REGION_LEN {
            return Err(ContainerError::BadHeader(
                "the file is too short to hold a header".into(),
            ));
        }
        let header = Header::parse(&header_bytes)?;
        header.validate()?;

        let page_map = Self::load_page_map(&mut file, &header)?;

        let mapped = page_map.iter().filter(|&&entry| entry < PAGE_ZEROED).count();
        if mapped != header.allocated_pages as usize {
            log::warn!(
                "The header of {} claims {} allocated pages, but the page map has {}",
                path.display(),
                header.allocated_pages,
                mapped
            );
        }
        log::debug!(
            "Opened {}: {:?} image, {} bytes in {} pages of {} bytes ({} mapped)",
            path.display(),
            header.image_type(),
            header.disk_size,
            header.total_pages,
            header.page_size,
            mapped
        );

        Ok(Self {
            file,
            header,
            page_map,
            options,
            cursor: 0,
        })
    }

    fn load_page_map(file: &mut File, header: &Header) -> Result<Vec<u32>, ContainerError> {
        let map_len = u64::from(header.total_pages) * 4;
        let map_end = u64::from(header.page_map_offset) + map_len;

        if map_end > file.metadata()?.len() {
            return Err(ContainerError::BadHeader(format!(
                "page map ending at {} extends past the end of the file",
                map_end
            )));
        }

        let mut bytes = vec![0u8; map_len as usize];
        if read_fully(file, header.page_map_offset.into(), &mut bytes)? != bytes.len() {
            return Err(ContainerError::BadHeader("truncated page map".into()));
        }

        Ok(bytes
            .chunks_exact(4)
            .map(|entry| crate::read_u32(entry, 0))
            .collect())
    }

    /// Release the page map and the file. Dropping the container has the same effect.
    pub fn close(self) {
        log::trace!("Closing container at logical offset {}", self.cursor);
    }

    pub fn header(&self) -> &Header {
        &self.header
    }
    pub fn page_map(&self) -> &[u32] {
        &self.page_map
    }
    pub fn options(&self) -> &Options {
        &self.options
    }
    pub fn disk_size(&self) -> u64 {
        self.header.disk_size
    }
    pub fn page_size(&self) -> u32 {
        self.header.page_size
    }
    pub fn sector_size(&self) -> u32 {
        self.header.sector_size()
    }
    pub fn cursor(&self) -> u64 {
        self.cursor
    }
    /// The number of pages that have storage in the image.
    pub fn allocated_pages(&self) -> usize {
        self.page_map
            .iter()
            .filter(|&&entry| entry < PAGE_ZEROED)
            .count()
    }

    /// Translate an offset of the virtual disk into an offset of the image file.
    pub fn translate(&self, logical: u64) -> Result<Translation, TranslateError> {
        let page_size = u64::from(self.header.page_size);
        let page = logical / page_size;

        let entry = match usize::try_from(page).ok().and_then(|page| self.page_map.get(page)) {
            Some(&entry) => entry,
            None => {
                return Err(TranslateError::OutOfRange(
                    logical,
                    self.header.total_pages,
                ))
            }
        };
        if entry >= PAGE_ZEROED {
            return Ok(Translation::Unallocated);
        }

        // Every physical page is preceded by `extra_page_size` bytes of per-page metadata, which
        // is zero for every image VirtualBox creates today.
        let extra = u64::from(self.header.extra_page_size);
        let stride = page_size + extra;

        Ok(Translation::Mapped(
            u64::from(self.header.frame_offset)
                + u64::from(entry) * stride
                + extra
                + logical % page_size,
        ))
    }

    /// Bytes from the cursor until whichever comes first of the next page boundary and the end of
    /// the disk.
    fn chunk_limit(&self) -> u64 {
        let page_size = u64::from(self.header.page_size);
        let left_in_page = page_size - self.cursor % page_size;
        cmp::min(left_in_page, self.header.disk_size - self.cursor)
    }
}

impl Read for Container {
    /// Read from the cursor, one page at a time. The transfer stops early at the first page that
    /// cannot be translated, or when the image file returns fewer bytes than requested; the
    /// returned count then tells how far it got.
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut transferred = 0;

        while transferred < buffer.len() {
            let chunk_len = cmp::min((buffer.len() - transferred) as u64, self.chunk_limit()) as usize;
            if chunk_len == 0 {
                break;
            }
            let chunk = &mut buffer[transferred..transferred + chunk_len];

            let result = match self.translate(self.cursor) {
                Ok(Translation::Mapped(physical)) => read_fully(&mut self.file, physical, chunk),
                Ok(Translation::Unallocated) => match self.options.unallocated {
                    UnallocatedPolicy::ZeroFill => {
                        chunk.iter_mut().for_each(|byte| *byte = 0);
                        Ok(chunk_len)
                    }
                    UnallocatedPolicy::Fail => {
                        log::debug!("Read stopped at unallocated logical offset {}", self.cursor);
                        break;
                    }
                },
                Err(error) => {
                    log::debug!("Read stopped: {}", error);
                    break;
                }
            };

            let n = match result {
                Ok(n) => n,
                Err(error) => {
                    log::debug!("Read stopped at logical offset {}: {}", self.cursor, error);
                    break;
                }
            };
            log::trace!("Read {} bytes at logical offset {}", n, self.cursor);

            transferred += n;
            self.cursor += n as u64;

            if n < chunk_len {
                break;
            }
        }
        Ok(transferred)
    }
}

impl Write for Container {
    /// Write at the cursor, one page at a time. Pages without storage are never allocated, so a
    /// write reaching one stops there, as does a write to an immutable container.
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        if self.options.immutable {
            log::debug!("Refusing to write {} bytes to an immutable container", buffer.len());
            return Ok(0);
        }

        let mut transferred = 0;

        while transferred < buffer.len() {
            let chunk_len = cmp::min((buffer.len() - transferred) as u64, self.chunk_limit()) as usize;
            if chunk_len == 0 {
                break;
            }
            let chunk = &buffer[transferred..transferred + chunk_len];

            let physical = match self.translate(self.cursor) {
                Ok(Translation::Mapped(physical)) => physical,
                Ok(Translation::Unallocated) => {
                    log::debug!("Write stopped at unallocated logical offset {}", self.cursor);
                    break;
                }
                Err(error) => {
                    log::debug!("Write stopped: {}", error);
                    break;
                }
            };

            let n = match write_fully(&mut self.file, physical, chunk) {
                Ok(n) => n,
                Err(error) => {
                    log::debug!("Write stopped at logical offset {}: {}", self.cursor, error);
                    break;
                }
            };
            log::trace!("Wrote {} bytes at logical offset {}", n, self.cursor);

            transferred += n;
            self.cursor += n as u64;

            if n < chunk_len {
                break;
            }
        }
        Ok(transferred)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for Container {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor = crate::seek_target(pos, self.cursor, self.header.disk_size)?;
        Ok(self.cursor)
    }
}
