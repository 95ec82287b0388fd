//! In-memory construction of small VDI images, for tests.

use std::{cmp, fs, io};

use scroll::Pwrite;

use crate::container::{
    Geometry, Header, HeaderV1, ImageType, PreHeader, HEADER_REGION_LEN, HEADER_V1_LEN,
    PAGE_UNALLOCATED, SIGNATURE, VERSION_1_1,
};
use crate::partition::{PartitionEntry, BOOT_SIGNATURE, BOOT_SIGNATURE_OFFSET, TABLE_OFFSET};

const TEXT: &[u8] = b"<<< Oracle VM VirtualBox Disk Image >>>\n";
const PAGE_MAP_OFFSET: u32 = 512;

/// Builds a VDI image around the contents of a virtual disk.
#[derive(Clone, Debug)]
pub struct ImageBuilder {
    disk: Vec<u8>,
    page_size: u32,
    image_type: ImageType,
    unallocated: Vec<usize>,
    reversed: bool,
}

impl ImageBuilder {
    pub fn new(disk_size: u64, page_size: u32) -> Self {
        Self {
            disk: vec![0u8; disk_size as usize],
            page_size,
            image_type: ImageType::Normal,
            unallocated: Vec::new(),
            reversed: false,
        }
    }

    /// Store bytes at a logical offset of the virtual disk.
    pub fn write(&mut self, offset: u64, bytes: &[u8]) -> &mut Self {
        let offset = offset as usize;
        self.disk[offset..offset + bytes.len()].copy_from_slice(bytes);
        self
    }
    /// Leave a logical page without storage. Ignored for fixed images.
    pub fn unallocate(&mut self, page: usize) -> &mut Self {
        self.unallocated.push(page);
        self
    }
    /// Store the pages in the file in the opposite order of the disk, so that no two
    /// consecutive logical pages are physically adjacent.
    pub fn reversed(&mut self) -> &mut Self {
        self.reversed = true;
        self
    }
    pub fn fixed(&mut self) -> &mut Self {
        self.image_type = ImageType::Fixed;
        self
    }
    /// Fill in one entry of the boot-sector partition table, and mark the sector as bootable.
    pub fn partition(&mut self, index: usize, entry: PartitionEntry) -> &mut Self {
        let offset = TABLE_OFFSET + index * PartitionEntry::SIZE;
        self.disk
            .pwrite_with(&entry, offset, scroll::LE)
            .expect("the partition table fits in the boot sector");
        crate::write_u16(&mut self.disk, BOOT_SIGNATURE_OFFSET, BOOT_SIGNATURE);
        self
    }

    pub fn disk(&self) -> &[u8] {
        &self.disk
    }

    fn total_pages(&self) -> usize {
        crate::div_round_up(self.disk.len(), self.page_size as usize)
    }
    fn allocated_pages(&self) -> Vec<usize> {
        (0..self.total_pages())
            .filter(|page| self.image_type == ImageType::Fixed || !self.unallocated.contains(page))
            .collect()
    }
    fn header(&self, frame_offset: u32, allocated: usize) -> Header {
        let mut text = [0u8; 64];
        text[..TEXT.len()].copy_from_slice(TEXT);

        let geometry = Geometry {
            cylinders: 0,
            heads: 0,
            sectors: 0,
            sector_size: 512,
        };

        Header {
            pre: PreHeader {
                text,
                signature: SIGNATURE,
                version: VERSION_1_1,
            },
            base: HeaderV1 {
                header_size: HEADER_V1_LEN as u32,
                image_type: ImageType::serialize(self.image_type),
                flags: 0,
                comment: [0u8; 256],
                page_map_offset: PAGE_MAP_OFFSET,
                frame_offset,
                legacy_geometry: geometry,
                unused: 0,
                disk_size: self.disk.len() as u64,
                page_size: self.page_size,
                extra_page_size: 0,
                total_pages: self.total_pages() as u32,
                allocated_pages: allocated as u32,
                uuid_create: [0x11; 16],
                uuid_modify: [0x22; 16],
                uuid_link: [0u8; 16],
                uuid_parent_modify: [0u8; 16],
                logical_geometry: geometry,
            },
        }
    }

    /// Produce the bytes of the image file.
    pub fn build(&self) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let total_pages = self.total_pages();
        let allocated = self.allocated_pages();

        let map_end = PAGE_MAP_OFFSET as usize + total_pages * 4;
        let frame_offset = crate::div_round_up(map_end, page_size) * page_size;

        let mut image = vec![0u8; frame_offset + allocated.len() * page_size];
        self.header(frame_offset as u32, allocated.len())
            .serialize(&mut image[..HEADER_REGION_LEN])
            .expect("the header fits in its region");

        for page in 0..total_pages {
            crate::write_u32(&mut image, PAGE_MAP_OFFSET as usize + page * 4, PAGE_UNALLOCATED);
        }
        for (i, &page) in allocated.iter().enumerate() {
            let physical = if self.reversed { allocated.len() - 1 - i } else { i };
            crate::write_u32(&mut image, PAGE_MAP_OFFSET as usize + page * 4, physical as u32);

            let start = page * page_size;
            let end = cmp::min(start + page_size, self.disk.len());
            let destination = frame_offset + physical * page_size;
            image[destination..destination + end - start].copy_from_slice(&self.disk[start..end]);
        }
        image
    }

    /// Write the image to a fresh temporary file.
    pub fn write_temp(&self) -> io::Result<tempfile::NamedTempFile> {
        let file = tempfile::NamedTempFile::new()?;
        fs::write(file.path(), self.build())?;
        Ok(file)
    }
}
