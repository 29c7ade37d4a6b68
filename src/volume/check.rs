use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::disk_format::block::BLOCK_SIZE;
use crate::disk_format::directory::{DirectoryBlock, DirectoryEntryName};
use crate::disk_format::inode::{Inode, MAX_FILE_SIZE, ROOT_INODE};
use crate::error::{FsError, Result};
use crate::storage::BlockStorage;

use super::{BlockNumber, InodeNumber, Volume};

impl<S: BlockStorage> Volume<S> {
    /// Checks the volume for consistency with a depth-first traversal of the directory tree,
    /// then compares what the tree references against both bitmaps.
    ///
    /// Returns one message per inconsistency; an empty list means the volume is clean. Only
    /// device errors abort the check.
    pub fn check(&self) -> Result<Vec<String>> {
        let mut findings = vec![];
        let mut owners = HashMap::<BlockNumber, InodeNumber>::new();
        let mut seen = HashSet::<InodeNumber>::new();
        let mut queue = vec![ROOT_INODE];

        while let Some(inum) = queue.pop() {
            if !seen.insert(inum) {
                findings.push(format!("inode {inum} is reachable more than once"));
                continue;
            }

            if !self.inodes.is_allocated(&self.cache, inum)? {
                findings.push(format!("directory tree includes free inode {inum}"));
            }

            let inode = match self.read_inode(inum) {
                Ok(inode) => inode,
                Err(FsError::Corruption(reason)) => {
                    findings.push(reason);
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(data_blocks) = self.check_blocks(inum, &inode, &mut owners, &mut findings)?
            else {
                continue;
            };

            if inode.is_directory() {
                queue.extend(self.check_directory(inum, &inode, &data_blocks, &mut findings)?);
            }
        }

        self.check_bitmaps(&seen, &owners, &mut findings)?;

        if findings.is_empty() {
            info!("volume is consistent ({} inodes in use)", seen.len());
        } else {
            warn!("{} inconsistencies found", findings.len());
        }

        Ok(findings)
    }

    /// Claims every block of `inode` in `owners` and returns its data blocks, or `None` if its
    /// pointer tree can't be walked.
    fn check_blocks(
        &self,
        inum: InodeNumber,
        inode: &Inode,
        owners: &mut HashMap<BlockNumber, InodeNumber>,
        findings: &mut Vec<String>,
    ) -> Result<Option<Vec<BlockNumber>>> {
        if inode.size > MAX_FILE_SIZE {
            findings.push(format!(
                "inode {inum}: size {} exceeds the maximum file size",
                inode.size
            ));
            return Ok(None);
        }

        let tree = match self.resolver().block_tree(inode) {
            Ok(tree) => tree,
            Err(FsError::Corruption(reason)) => {
                findings.push(format!("inode {inum}: {reason}"));
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if tree.data.len() as u64 != inode.block_count() {
            findings.push(format!(
                "inode {inum} has {} data blocks for {} bytes",
                tree.data.len(),
                inode.size
            ));
        }

        for &block in tree.data.iter().chain(&tree.indirect) {
            if let Some(owner) = owners.insert(block, inum) {
                findings.push(format!(
                    "block {block} is referenced by inodes {owner} and {inum}"
                ));
            }

            if !self.blocks.is_set(&self.cache, block)? {
                findings.push(format!(
                    "block {block} is used by inode {inum} but free in the block bitmap"
                ));
            }

            if self.bad_blocks.is_set(&self.cache, block)? {
                findings.push(format!("inode {inum} uses bad block {block}"));
            }
        }

        Ok(Some(tree.data))
    }

    /// Checks the entries of a directory and returns the inode numbers they name.
    fn check_directory(
        &self,
        inum: InodeNumber,
        inode: &Inode,
        data_blocks: &[BlockNumber],
        findings: &mut Vec<String>,
    ) -> Result<Vec<InodeNumber>> {
        if inode.size % BLOCK_SIZE as u64 != 0 {
            findings.push(format!(
                "directory {inum}: size {} is not a multiple of the block size",
                inode.size
            ));
        }

        let mut names = HashSet::<DirectoryEntryName>::new();
        let mut children = vec![];

        for &block in data_blocks {
            let buffer = self.cache.get(block)?;
            let guard = buffer.lock();

            for entry in DirectoryBlock::new(guard.data()).entries() {
                if entry.inum >= self.inodes.num_inodes() {
                    findings.push(format!(
                        "directory {inum}: entry {} names invalid inode {}",
                        entry.name, entry.inum
                    ));
                    continue;
                }

                if !names.insert(entry.name.clone()) {
                    findings.push(format!(
                        "directory {inum} contains duplicate entry: {}",
                        entry.name
                    ));
                }

                match self.read_inode(entry.inum) {
                    Ok(child)
                        if child.dir_block as BlockNumber != block
                            || child.dir_block_off as usize != entry.slot =>
                    {
                        findings.push(format!(
                            "inode {}: back-pointer ({}, {}) doesn't match its entry ({block}, {})",
                            entry.inum, child.dir_block, child.dir_block_off, entry.slot
                        ));
                    }
                    Ok(_) => {}
                    // reported when the child itself is visited
                    Err(FsError::Corruption(_)) => {}
                    Err(err) => return Err(err),
                }

                children.push(entry.inum);
            }
        }

        if children.len() != inode.entry_count as usize {
            findings.push(format!(
                "directory {inum} records {} entries but holds {}",
                inode.entry_count,
                children.len()
            ));
        }

        Ok(children)
    }

    /// Compares the bitmaps against what the tree walk found in use.
    fn check_bitmaps(
        &self,
        reachable: &HashSet<InodeNumber>,
        owners: &HashMap<BlockNumber, InodeNumber>,
        findings: &mut Vec<String>,
    ) -> Result<()> {
        for unit in self.inodes.bitmap().set_units(&self.cache)? {
            let inum = unit as InodeNumber;

            if inum != 0 && !reachable.contains(&inum) {
                findings.push(format!("inode {inum} is allocated but unreachable"));
            }
        }

        if !self.inodes.bitmap().is_set(&self.cache, 0)? {
            findings.push("inode 0 is not reserved".to_string());
        }

        let data_start = self.layout.data_region_start as BlockNumber;
        let used: HashSet<BlockNumber> = self.blocks.set_units(&self.cache)?.into_iter().collect();

        for block in 0..data_start {
            if !used.contains(&block) {
                findings.push(format!("metadata block {block} is free in the block bitmap"));
            }
        }

        let mut leaked: Vec<BlockNumber> = used
            .into_iter()
            .filter(|block| *block >= data_start && !owners.contains_key(block))
            .collect();
        leaked.sort_unstable();

        for block in leaked {
            if !self.bad_blocks.is_set(&self.cache, block)? {
                findings.push(format!("block {block} is allocated but unreferenced"));
            }
        }

        Ok(())
    }
}
