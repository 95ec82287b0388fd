//! Human-readable descriptions of the on-disk structures.

use std::fmt::{self, Write};

use vdi::{Container, PartitionTable};
use vdi_backend_ext2::{BlockGroupDescriptor, Superblock};

pub fn container(out: &mut impl Write, container: &Container) -> fmt::Result {
    let header = container.header();

    writeln!(out, "Text:              {}", header.text())?;
    writeln!(
        out,
        "Version:           {}.{}",
        header.major_version(),
        header.minor_version()
    )?;
    match header.image_type() {
        Some(image_type) => writeln!(out, "Image type:        {:?}", image_type)?,
        None => writeln!(out, "Image type:        unknown ({})", header.base.image_type)?,
    }
    writeln!(out, "Comment:           {:?}", header.comment())?;
    writeln!(out, "UUID:              {}", header.uuid())?;
    writeln!(out, "Modification UUID: {}", header.modification_uuid())?;
    writeln!(out, "Parent UUID:       {}", header.parent_uuid())?;
    writeln!(out, "Disk size:         {} bytes", header.disk_size)?;
    writeln!(out, "Sector size:       {} bytes", header.sector_size())?;
    writeln!(out, "Page size:         {} bytes (+{} extra)", header.page_size, header.extra_page_size)?;
    writeln!(out, "Page map offset:   {:#x}", header.page_map_offset)?;
    writeln!(out, "Frame offset:      {:#x}", header.frame_offset)?;
    writeln!(
        out,
        "Pages:             {} total, {} allocated ({} in the header)",
        header.total_pages,
        container.allocated_pages(),
        header.allocated_pages
    )?;
    Ok(())
}

pub fn partition_table(out: &mut impl Write, table: &PartitionTable) -> fmt::Result {
    if !table.has_boot_signature() {
        writeln!(
            out,
            "Warning: boot signature is {:#06x}, the table may be meaningless",
            table.boot_signature
        )?;
    }
    writeln!(out, "#  Boot  Type                  First LBA    Sectors")?;

    for (index, entry) in table.entries.iter().enumerate() {
        if !entry.is_used() {
            writeln!(out, "{}  -", index)?;
            continue;
        }
        writeln!(
            out,
            "{}  {}     {:<4} {:<16} {:>10} {:>10}",
            index,
            if entry.is_bootable() { '*' } else { ' ' },
            format!("{:02x}", entry.partition_type),
            entry.kind().to_string(),
            entry.first_lba,
            entry.sector_count
        )?;
    }
    Ok(())
}

pub fn superblock(out: &mut impl Write, superblock: &Superblock) -> fmt::Result {
    writeln!(out, "Volume name:        {:?}", superblock.volume_name())?;
    writeln!(out, "Last mounted on:    {:?}", superblock.last_mounted())?;
    writeln!(out, "UUID:               {}", superblock.uuid())?;
    writeln!(
        out,
        "Revision:           {}.{}",
        superblock.major_version, superblock.minor_version
    )?;
    writeln!(out, "Block size:         {}", superblock.block_size())?;
    writeln!(
        out,
        "Blocks:             {} ({} free, {} reserved), first data block {}",
        superblock.block_count,
        superblock.unalloc_block_count,
        superblock.reserved_block_count,
        superblock.first_data_block
    )?;
    writeln!(
        out,
        "Inodes:             {} ({} free), {} bytes each",
        superblock.inode_count,
        superblock.unalloc_inode_count,
        superblock.inode_size()
    )?;
    writeln!(
        out,
        "Groups:             {} ({} blocks, {} inodes each)",
        superblock.block_group_count(),
        superblock.blocks_per_group,
        superblock.inodes_per_group
    )?;
    writeln!(out, "State:              {:?}", superblock.fs_state())?;
    writeln!(out, "Errors behaviour:   {:?}", superblock.error_handling())?;
    writeln!(out, "Creator OS:         {:?}", superblock.os_id())?;
    writeln!(out, "Compat features:    {:?}", superblock.compat_features())?;
    writeln!(out, "Incompat features:  {:?}", superblock.incompat_features())?;
    writeln!(out, "RO compat features: {:?}", superblock.ro_compat_features())?;
    writeln!(out, "Superblock copies:  {:?}", superblock.superblock_groups())?;
    Ok(())
}

pub fn bgdt(out: &mut impl Write, table: &[BlockGroupDescriptor]) -> fmt::Result {
    writeln!(out, "Group  Block bitmap  Inode bitmap  Inode table  Free blocks  Free inodes  Directories")?;

    for (index, descriptor) in table.iter().enumerate() {
        writeln!(
            out,
            "{:>5}  {:>12}  {:>12}  {:>11}  {:>11}  {:>11}  {:>11}",
            index,
            descriptor.block_usage_bm_start_baddr(),
            descriptor.inode_usage_bm_start_baddr(),
            descriptor.inode_table_start_baddr(),
            descriptor.unalloc_block_count,
            descriptor.unalloc_inode_count,
            descriptor.dir_count
        )?;
    }
    Ok(())
}
