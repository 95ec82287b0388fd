use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use std::{error::Error, process};

use vdi::{Container, PartitionTable};
use vdi_backend_ext2::{Filesystem, Selector};
use vdi_frontend_cli::{dump, options, parse_index, report};

fn partition_arg() -> Arg<'static, 'static> {
    Arg::with_name("PARTITION")
        .short("p")
        .long("partition")
        .takes_value(true)
        .validator(|string| parse_index(&string).map(|_| ()))
        .help("Index of the partition holding the filesystem. Defaults to the first Linux partition.")
}

fn open_filesystem(matches: &ArgMatches, vdi_options: vdi::Options) -> Result<Filesystem, Box<dyn Error>> {
    let image = matches.value_of("IMAGE").unwrap();

    let selector = match matches.value_of("PARTITION") {
        Some(index) => Selector::Index(parse_index(index)?),
        None => Selector::default(),
    };
    log::debug!("Opening {} with {:?}", image, selector);

    Ok(Filesystem::open_with(image, selector, vdi_options)?)
}

fn run(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let vdi_options = options(matches.is_present("IMMUTABLE"), matches.is_present("ZERO_FILL"));
    let mut out = String::new();

    match matches.subcommand() {
        ("header", Some(matches)) => {
            let container = Container::open_with(matches.value_of("IMAGE").unwrap(), vdi_options)?;
            report::container(&mut out, &container)?;
            container.close();
        }
        ("mbr", Some(matches)) => {
            let mut container = Container::open_with(matches.value_of("IMAGE").unwrap(), vdi_options)?;
            let table = PartitionTable::load(&mut container)?;
            report::partition_table(&mut out, &table)?;
            container.close();
        }
        ("superblock", Some(matches)) => {
            let mut filesystem = open_filesystem(matches, vdi_options)?;
            let primary = filesystem.superblock.clone();

            report::superblock(&mut out, &primary)?;
            out.push('\n');
            report::bgdt(&mut out, filesystem.bgdt())?;
            out.push('\n');

            for group in primary.superblock_groups().into_iter().skip(1) {
                let block = primary.backup_superblock_block(group);
                let mut backup = primary.clone();

                match filesystem.superblock_offset(block) {
                    Some(offset) if filesystem.fetch_superblock(block, &mut backup) => {
                        out.push_str(&format!(
                            "Backup superblock of group {} at {:#x}: {} free blocks, {} free inodes\n",
                            group, offset, backup.unalloc_block_count, backup.unalloc_inode_count
                        ));
                    }
                    _ => {
                        out.push_str(&format!("Backup superblock of group {} is unreadable\n", group));
                    }
                }
            }
            filesystem.close();
        }
        ("block", Some(matches)) => {
            let number = matches.value_of("NUMBER").unwrap().parse::<u64>()?;
            let mut filesystem = open_filesystem(matches, vdi_options)?;
            let block_bytes = filesystem.read_block(number)?;

            // `read_block` succeeding means the offset fit.
            let base_offset = number.saturating_mul(u64::from(filesystem.block_size()));
            out.push_str(&dump::hex_dump(&block_bytes, base_offset));
            filesystem.close();
        }
        _ => {
            eprintln!("{}", matches.usage());
            return Ok(());
        }
    }

    print!("{}", out);
    Ok(())
}

fn main() {
    env_logger::init();
    let app = App::new("VDI inspector")
        .author(crate_authors!())
        .version(crate_version!())
        .about("Inspect VirtualBox disk images and the ext2 filesystems inside them")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("IMMUTABLE")
                .long("immutable")
                .help("Open the image read-only; nothing will ever be written to it"),
        )
        .arg(
            Arg::with_name("ZERO_FILL")
                .long("zero-fill")
                .help("Read unallocated pages as zeroes instead of stopping at them"),
        )
        .subcommand(
            SubCommand::with_name("header")
                .about("Show the container header and page map summary")
                .arg(Arg::with_name("IMAGE").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("mbr")
                .about("Show the partition table of the virtual disk")
                .arg(Arg::with_name("IMAGE").required(true).index(1)),
        )
        .subcommand(
            SubCommand::with_name("superblock")
                .about("Show the ext2 superblock, the block group descriptors and the backup superblocks")
                .arg(Arg::with_name("IMAGE").required(true).index(1))
                .arg(partition_arg()),
        )
        .subcommand(
            SubCommand::with_name("block")
                .about("Dump an ext2 block")
                .arg(Arg::with_name("IMAGE").required(true).index(1))
                .arg(Arg::with_name("NUMBER").required(true).index(2))
                .arg(partition_arg()),
        );

    let matches = app.get_matches();

    if let Err(error) = run(&matches) {
        eprintln!("error: {}", error);
        process::exit(1);
    }
}
