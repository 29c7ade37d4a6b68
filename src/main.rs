use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use wnfs::disk_format::directory::DirectoryEntry;
use wnfs::disk_format::inode::{InodeType, ROOT_INODE};
use wnfs::storage::{BlockStorage, FileBackedStorage};
use wnfs::{FsError, InodeNumber, Volume};

#[derive(Parser, Debug, PartialEq)]
#[command(author, version, about = "inspect and modify a WNFS volume")]
struct Args {
    /// WNFS device or image file
    device: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// list a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// show the inode behind a path
    Stat { path: String },
    /// print a file
    Cat { path: String },
    /// copy a host file into the volume, replacing any existing file
    Put { source: PathBuf, path: String },
    /// create a directory
    Mkdir { path: String },
    /// remove a file
    Rm { path: String },
    /// remove an empty directory
    Rmdir { path: String },
    /// move or rename an entry
    Mv { from: String, to: String },
    /// set the size of a file
    Truncate { path: String, size: u64 },
    /// show block and inode usage
    Df,
    /// retire a data block
    MarkBad { block: usize },
}

/// Path-level operations over a mounted volume. Paths are slash-separated and always start from
/// the root.
struct Shell<S: BlockStorage> {
    volume: Volume<S>,
}

impl<S: BlockStorage> Shell<S> {
    fn new(volume: Volume<S>) -> Self {
        Shell { volume }
    }

    fn resolve(&self, path: &str) -> Result<InodeNumber> {
        components(path).try_fold(ROOT_INODE, |inum, name| {
            self.volume
                .lookup(inum, name)
                .with_context(|| format!("unable to resolve {path}"))
        })
    }

    /// The directory that holds the last component of `path`, and that component.
    fn resolve_parent<'p>(&self, path: &'p str) -> Result<(InodeNumber, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));

        if name.is_empty() {
            return Err(anyhow!("{path} has no final component"));
        }

        Ok((self.resolve(parent)?, name))
    }

    fn list(&self, path: &str) -> Result<Vec<(DirectoryEntry, InodeType, u64)>> {
        let inum = self.resolve(path)?;

        let mut listing = vec![];
        for entry in self.volume.read_directory(inum)? {
            let inode = self.volume.read_inode(entry.inum)?;
            listing.push((entry, inode.type_, inode.size));
        }

        Ok(listing)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let inum = self.resolve(path)?;
        let size = self.volume.read_inode(inum)?.size;

        Ok(self.volume.read_file(inum, 0, size as usize)?)
    }

    fn put(&self, path: &str, data: &[u8]) -> Result<InodeNumber> {
        let (parent, name) = self.resolve_parent(path)?;

        let inum = match self.volume.lookup(parent, name) {
            Ok(inum) => {
                self.volume.truncate(inum, 0)?;
                inum
            }
            Err(FsError::NotFound(_)) => self.volume.create_file(parent, name)?,
            Err(err) => return Err(err.into()),
        };

        self.volume.write_file(inum, 0, data)?;

        Ok(inum)
    }

    fn make_directory(&self, path: &str) -> Result<InodeNumber> {
        let (parent, name) = self.resolve_parent(path)?;
        Ok(self.volume.create_directory(parent, name)?)
    }

    fn remove_file(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.volume.unlink(parent, name)?;

        Ok(())
    }

    fn remove_directory(&self, path: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(path)?;
        self.volume.remove_directory(parent, name)?;

        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (parent, name) = self.resolve_parent(from)?;
        let (new_parent, new_name) = self.resolve_parent(to)?;

        Ok(self.volume.rename(parent, name, new_parent, new_name)?)
    }

    fn run(&self, command: Command, out: &mut impl Write) -> Result<()> {
        match command {
            Command::Ls { path } => {
                for (entry, type_, size) in self.list(&path)? {
                    let kind = match type_ {
                        InodeType::Directory => 'd',
                        InodeType::File => '-',
                    };
                    writeln!(out, "{kind} {:>6} {size:>12} {}", entry.inum, entry.name)?;
                }
            }
            Command::Stat { path } => {
                let inum = self.resolve(&path)?;
                let inode = self.volume.read_inode(inum)?;
                writeln!(out, "inode {inum}: {inode:#?}")?;
            }
            Command::Cat { path } => out.write_all(&self.read(&path)?)?,
            Command::Put { source, path } => {
                let data = std::fs::read(&source)
                    .with_context(|| format!("unable to read {}", source.display()))?;
                let inum = self.put(&path, &data)?;
                writeln!(out, "wrote {} bytes to inode {inum}", data.len())?;
            }
            Command::Mkdir { path } => {
                self.make_directory(&path)?;
            }
            Command::Rm { path } => self.remove_file(&path)?,
            Command::Rmdir { path } => self.remove_directory(&path)?,
            Command::Mv { from, to } => self.rename(&from, &to)?,
            Command::Truncate { path, size } => {
                let inum = self.resolve(&path)?;
                self.volume.truncate(inum, size)?;
            }
            Command::Df => {
                let stats = self.volume.stat()?;
                writeln!(
                    out,
                    "blocks: {} total, {} free, {} bad",
                    stats.blocks, stats.free_blocks, stats.bad_blocks
                )?;
                writeln!(out, "inodes: {} total, {} free", stats.inodes, stats.free_inodes)?;
            }
            Command::MarkBad { block } => self.volume.mark_bad_block(block)?,
        }

        Ok(())
    }

    fn close(self) -> Result<()> {
        self.volume.unmount()?;
        Ok(())
    }
}

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|component| !component.is_empty())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let disk_file = File::options()
        .read(true)
        .write(true)
        .open(&args.device)
        .context("unable to open disk file in read-write mode")?;

    let volume =
        Volume::mount(FileBackedStorage::new(disk_file)).context("unable to mount volume")?;
    let shell = Shell::new(volume);

    let result = shell.run(args.command, &mut io::stdout().lock());
    shell.close()?;

    result
}
