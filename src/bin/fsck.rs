use std::{fs::File, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use wnfs::storage::FileBackedStorage;
use wnfs::Volume;

#[derive(Parser)]
#[command(author, version, about = "check a WNFS volume for consistency")]
struct Args {
    /// WNFS device or image file
    device: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let disk_file = File::options()
        .read(true)
        .open(&args.device)
        .with_context(|| format!("unable to open {}", args.device.display()))?;
    let storage = FileBackedStorage::new(disk_file);

    let volume = Volume::mount(storage).context("unable to mount volume")?;
    let findings = volume.check()?;

    for finding in &findings {
        println!("{finding}");
    }

    if !findings.is_empty() {
        bail!("{} inconsistencies found", findings.len());
    }

    let stats = volume.stat()?;
    println!(
        "clean: {}/{} inodes, {}/{} blocks in use",
        stats.inodes - stats.free_inodes,
        stats.inodes,
        stats.blocks - stats.free_blocks,
        stats.blocks
    );

    Ok(())
}
