//! Inspection of VDI images, down to the metadata of the ext2 filesystem inside them.

pub mod dump;
pub mod report;

/// Build the container options from the command-line switches.
pub fn options(immutable: bool, zero_fill: bool) -> vdi::Options {
    vdi::Options {
        immutable,
        unallocated: if zero_fill {
            vdi::UnallocatedPolicy::ZeroFill
        } else {
            vdi::UnallocatedPolicy::Fail
        },
    }
}

/// Parse a partition index given on the command line.
pub fn parse_index(string: &str) -> Result<usize, String> {
    match string.parse::<usize>() {
        Ok(index) if index < vdi::partition::ENTRY_COUNT => Ok(index),
        Ok(index) => Err(format!("partition index {} is out of range (0 to 3)", index)),
        Err(err) => Err(format!("invalid partition index `{}`: {}", string, err)),
    }
}
