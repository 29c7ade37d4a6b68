use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use wnfs::disk_format::block::BLOCK_SIZE;
use wnfs::layout::DEFAULT_INODE_RATIO;
use wnfs::storage::FileBackedStorage;
use wnfs::FormatOptions;

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about = "format a device with an empty WNFS volume")]
struct Args {
    /// block device or image file to format
    device: PathBuf,
    /// bytes of capacity per inode
    #[arg(long, default_value_t = DEFAULT_INODE_RATIO)]
    inode_ratio: u64,
    /// create or resize the image file to this many blocks first
    #[arg(long)]
    blocks: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let file = File::options()
        .read(true)
        .write(true)
        .create(args.blocks.is_some())
        .open(&args.device)
        .with_context(|| format!("unable to open {} in read-write mode", args.device.display()))?;

    if let Some(blocks) = args.blocks {
        file.set_len(image_len(blocks)?)
            .context("unable to size the image file")?;
    }

    let options = FormatOptions {
        inode_ratio: args.inode_ratio,
    };
    let superblock = wnfs::format(FileBackedStorage::new(file), &options)
        .with_context(|| format!("unable to format {}", args.device.display()))?;

    println!(
        "{}: {} blocks, {} inodes, data region from block {}",
        args.device.display(),
        superblock.num_blocks,
        superblock.num_inodes,
        superblock.data_region_start
    );

    Ok(())
}

/// The byte length of an image of `blocks` blocks.
fn image_len(blocks: u64) -> Result<u64> {
    blocks
        .checked_mul(BLOCK_SIZE as u64)
        .with_context(|| format!("{blocks} blocks is too large for an image file"))
}
