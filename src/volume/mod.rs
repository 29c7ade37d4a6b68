//! A mounted volume: the context every filesystem operation runs against.

use log::{error, info, warn};

use crate::bitmap::BitmapAllocator;
use crate::disk_format::inode::{Inode, InodeType, ROOT_INODE};
use crate::disk_format::superblock::{Superblock, SUPERBLOCK_BLOCK_NUMBER};
use crate::error::{FsError, Result, Resource};
use crate::format::{self, FormatOptions};
use crate::inode_store::InodeStore;
use crate::layout::Layout;
use crate::resolver::BlockAddressResolver;
use crate::storage::{BlockStorage, BufferCache};

mod check;
mod directory;
mod file;
mod node;

pub use node::{Node, OpenInode};

/// Inode numbers are `u32`s on disk.
pub type InodeNumber = u32;

// block numbers are `u32`s on disk, but we use `usize`s to avoid littering the code with casts
pub type BlockNumber = usize;

/// Usage counters, as reported by `df`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub inodes: usize,
    pub free_inodes: usize,
    pub bad_blocks: usize,
}

/// A formatted device together with its block cache and allocators.
///
/// All operations take `&self`. Each block is locked for the duration of a read-modify-write on
/// it, but operations spanning several blocks are not atomic, and concurrent writers to the same
/// inode must be serialized by the caller. Changes reach the device on [`Volume::sync`] or
/// [`Volume::unmount`].
pub struct Volume<S: BlockStorage> {
    cache: BufferCache<S>,
    superblock: Superblock,
    layout: Layout,
    inodes: InodeStore,
    blocks: BitmapAllocator,
    bad_blocks: BitmapAllocator,
}

impl<S: BlockStorage> Volume<S> {
    pub fn mount(storage: S) -> Result<Self> {
        let device_blocks = storage.num_blocks()?;
        if device_blocks == 0 {
            return Err(FsError::InvalidGeometry("zero-size device".into()));
        }

        let superblock = Superblock::decode(&storage.read_block(SUPERBLOCK_BLOCK_NUMBER)?)?;
        let layout = superblock.layout()?;

        if layout.block_count as usize > device_blocks {
            return Err(FsError::InvalidGeometry(format!(
                "superblock claims {} blocks but the device has {device_blocks}",
                layout.block_count
            )));
        }

        if (layout.block_count as usize) < device_blocks {
            warn!(
                "device has {device_blocks} blocks, volume uses only {}",
                layout.block_count
            );
        }

        let volume = Self {
            cache: BufferCache::with_limit(storage, layout.block_count as BlockNumber),
            superblock,
            layout,
            inodes: InodeStore::new(&layout),
            blocks: BitmapAllocator::new(
                Resource::Blocks,
                layout.block_bitmap_start as BlockNumber,
                layout.block_count as usize,
            ),
            bad_blocks: BitmapAllocator::new(
                Resource::BadBlocks,
                layout.bad_block_bitmap_start as BlockNumber,
                layout.block_count as usize,
            ),
        };

        if !volume.inodes.is_allocated(&volume.cache, ROOT_INODE)? {
            return Err(FsError::Corruption("root inode is free".into()));
        }

        if volume.read_inode(ROOT_INODE)?.type_ != InodeType::Directory {
            return Err(FsError::Corruption(
                "root inode does not represent a directory".into(),
            ));
        }

        info!("{} total blocks", layout.block_count);
        info!("{} total inodes", layout.inode_count);

        Ok(volume)
    }

    /// Formats `storage` and mounts the result.
    pub fn format(storage: S, options: &FormatOptions) -> Result<Self> {
        format::format(&storage, options)?;
        Self::mount(storage)
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn stat(&self) -> Result<VolumeStats> {
        let blocks = self.layout.block_count as usize;
        let inodes = self.layout.inode_count as usize;

        Ok(VolumeStats {
            blocks,
            free_blocks: blocks - self.blocks.count_set(&self.cache)?,
            inodes,
            free_inodes: inodes - self.inodes.bitmap().count_set(&self.cache)?,
            bad_blocks: self.bad_blocks.count_set(&self.cache)?,
        })
    }

    pub fn read_inode(&self, inum: InodeNumber) -> Result<Inode> {
        self.inodes.load(&self.cache, inum)
    }

    pub fn write_inode(&self, inum: InodeNumber, inode: &Inode) -> Result<()> {
        self.inodes.store(&self.cache, inum, inode)
    }

    /// Loads `inum` as a [`Node`] of the right kind.
    pub fn open(&self, inum: InodeNumber) -> Result<Node<'_, S>> {
        if !self.inodes.is_allocated(&self.cache, inum)? {
            return Err(FsError::NotFound(format!("inode {inum}")));
        }

        let inode = self.read_inode(inum)?;
        Ok(Node::new(self, inum, inode))
    }

    /// Retires block `block_number`: records it in the bad-block bitmap and claims it in the
    /// block bitmap so it's never handed out. A block already in use stays with its owner, and
    /// stays claimed once the owner releases it.
    pub fn mark_bad_block(&self, block_number: BlockNumber) -> Result<()> {
        let data_start = self.layout.data_region_start as BlockNumber;
        if block_number < data_start || block_number >= self.layout.block_count as BlockNumber {
            return Err(FsError::InvalidIndex {
                what: "data block",
                index: block_number as u64,
                limit: self.layout.block_count as u64,
            });
        }

        if !self.bad_blocks.reserve(&self.cache, block_number)? {
            return Ok(());
        }

        if self.blocks.reserve(&self.cache, block_number)? {
            info!("retired block {block_number}");
        } else {
            warn!("bad block {block_number} is in use");
        }

        Ok(())
    }

    pub fn is_bad_block(&self, block_number: BlockNumber) -> Result<bool> {
        self.bad_blocks.is_set(&self.cache, block_number)
    }

    /// Writes every modified block back to the device.
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    /// Syncs and hands back the storage.
    pub fn unmount(self) -> Result<S> {
        self.cache.sync()?;
        info!("unmounted");

        Ok(self.cache.into_storage())
    }

    fn resolver(&self) -> BlockAddressResolver<'_, S> {
        BlockAddressResolver::new(
            &self.cache,
            &self.blocks,
            self.layout.data_region_start as BlockNumber,
        )
        .retiring(&self.bad_blocks)
    }

    /// Read-modify-writes the stored record of `inum` under its table block's lock.
    fn update_inode<T>(&self, inum: InodeNumber, f: impl FnOnce(&mut Inode) -> T) -> Result<T> {
        self.inodes.update(&self.cache, inum, f)
    }

    /// Persists `inode` after a failed operation that may have changed it in memory, then
    /// passes the failure on.
    fn store_after_error<T>(&self, inum: InodeNumber, inode: &Inode, err: FsError) -> Result<T> {
        if let Err(store_err) = self.write_inode(inum, inode) {
            error!("inode {inum} could not be stored after error: {err}");
            return Err(store_err);
        }

        Err(err)
    }

    /// Frees `inum` and every block it references.
    fn release_inode(&self, inum: InodeNumber) -> Result<()> {
        let mut inode = self.read_inode(inum)?;

        if let Err(err) = self.resolver().shrink(&mut inode, 0) {
            return self.store_after_error(inum, &inode, err);
        }

        inode.dir_block = 0;
        inode.dir_block_off = 0;
        self.write_inode(inum, &inode)?;

        self.inodes.free(&self.cache, inum)
    }
}

#[cfg(test)]
mod tests {
    use crate::disk_format::block::BLOCK_SIZE;
    use crate::disk_format::superblock::MAGIC;
    use crate::storage::MemoryStorage;

    use super::*;

    pub(crate) fn new_volume() -> Volume<MemoryStorage> {
        Volume::format(MemoryStorage::new(4096), &FormatOptions::default()).unwrap()
    }

    mod mount {
        use super::*;

        #[test]
        fn test_fresh_volume() {
            let volume = new_volume();

            let root = volume.read_inode(ROOT_INODE).unwrap();
            assert!(root.is_directory());
            assert_eq!(root.block_count(), 1);
            assert_eq!(volume.superblock().magic, MAGIC);
        }

        #[test]
        fn test_unformatted_device() {
            let storage = MemoryStorage::new(4096);

            assert!(matches!(
                Volume::mount(storage),
                Err(FsError::Corruption(_))
            ));
        }

        #[test]
        fn test_bad_magic() {
            let storage = new_volume().unmount().unwrap();
            let mut block = storage.read_block(0).unwrap();
            block[0] = b'X';
            storage.write_block(0, &block).unwrap();

            assert!(matches!(
                Volume::mount(storage),
                Err(FsError::Corruption(_))
            ));
        }

        #[test]
        fn test_inconsistent_regions() {
            let storage = new_volume().unmount().unwrap();
            let mut superblock = Superblock::decode(&storage.read_block(0).unwrap()).unwrap();
            superblock.data_region_start += 1;
            storage.write_block(0, &superblock.encode().unwrap()).unwrap();

            assert!(matches!(
                Volume::mount(storage),
                Err(FsError::Corruption(_))
            ));
        }

        #[test]
        fn test_device_smaller_than_volume() {
            let storage = new_volume().unmount().unwrap();
            let small = MemoryStorage::new(2048);
            for block_number in 0..2048 {
                small
                    .write_block(block_number, &storage.read_block(block_number).unwrap())
                    .unwrap();
            }

            assert!(matches!(
                Volume::mount(small),
                Err(FsError::InvalidGeometry(_))
            ));
        }

        #[test]
        fn test_root_not_a_directory() {
            let volume = new_volume();
            let mut root = volume.read_inode(ROOT_INODE).unwrap();
            root.type_ = InodeType::File;
            volume.write_inode(ROOT_INODE, &root).unwrap();
            let storage = volume.unmount().unwrap();

            assert!(matches!(
                Volume::mount(storage),
                Err(FsError::Corruption(_))
            ));
        }

        #[test]
        fn test_unknown_root_type_tag() {
            let storage = new_volume().unmount().unwrap();
            let mut table = storage.read_block(1).unwrap();
            // the type tag follows the 8-byte size
            table[8] = 7;
            storage.write_block(1, &table).unwrap();

            assert!(matches!(
                Volume::mount(storage),
                Err(FsError::Corruption(_))
            ));
        }

        #[test]
        fn test_remount_keeps_changes() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "a.txt").unwrap();
            volume.write_file(inum, 0, b"persisted").unwrap();

            let volume = Volume::mount(volume.unmount().unwrap()).unwrap();

            assert_eq!(volume.lookup(ROOT_INODE, "a.txt").unwrap(), inum);
            assert_eq!(volume.read_file(inum, 0, 100).unwrap(), b"persisted");
        }
    }

    mod stat {
        use super::*;

        #[test]
        fn test_fresh_volume() {
            let stats = new_volume().stat().unwrap();

            assert_eq!(
                stats,
                VolumeStats {
                    blocks: 4096,
                    // metadata blocks 0..20 and the root directory's block
                    free_blocks: 4096 - 21,
                    inodes: 512,
                    free_inodes: 510,
                    bad_blocks: 0,
                }
            );
        }

        #[test]
        fn test_after_write() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            volume.write_file(inum, 0, &[1; 3 * BLOCK_SIZE]).unwrap();

            let stats = volume.stat().unwrap();
            assert_eq!(stats.free_blocks, 4096 - 21 - 3);
            assert_eq!(stats.free_inodes, 509);
        }
    }

    mod store_after_error {
        use crate::disk_format::inode::NULL_INODE;

        use super::*;

        #[test]
        fn test_passes_original_error_on() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            let mut inode = volume.read_inode(inum).unwrap();
            inode.size = 1;

            let result: Result<()> =
                volume.store_after_error(inum, &inode, FsError::OutOfSpace(Resource::Blocks));

            assert!(matches!(result, Err(FsError::OutOfSpace(Resource::Blocks))));
            assert_eq!(volume.read_inode(inum).unwrap().size, 1);
        }

        #[test]
        fn test_failed_store_is_reported() {
            let volume = new_volume();
            let inode = volume.read_inode(ROOT_INODE).unwrap();

            let result: Result<()> =
                volume.store_after_error(NULL_INODE, &inode, FsError::OutOfSpace(Resource::Blocks));

            assert!(matches!(result, Err(FsError::InvalidIndex { .. })));
        }
    }

    mod bad_blocks {
        use super::*;

        #[test]
        fn test_bad_block_is_never_allocated() {
            let volume = new_volume();
            volume.mark_bad_block(21).unwrap();

            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            volume.write_file(inum, 0, b"x").unwrap();

            assert_eq!(volume.open(inum).unwrap().resolve_block(0).unwrap(), 22);
            assert!(volume.is_bad_block(21).unwrap());
            assert_eq!(volume.stat().unwrap().bad_blocks, 1);
        }

        #[test]
        fn test_block_in_use_stays_retired_after_release() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            volume.write_file(inum, 0, b"x").unwrap();
            let block = volume.open(inum).unwrap().resolve_block(0).unwrap();
            assert_eq!(block, 21);

            volume.mark_bad_block(block).unwrap();
            volume.unlink(ROOT_INODE, "f").unwrap();

            let inum = volume.create_file(ROOT_INODE, "g").unwrap();
            volume.write_file(inum, 0, b"y").unwrap();

            assert_eq!(volume.open(inum).unwrap().resolve_block(0).unwrap(), 22);
            assert!(volume.blocks.is_set(&volume.cache, block).unwrap());
            assert!(volume.check().unwrap().is_empty());
        }

        #[test]
        fn test_marking_twice() {
            let volume = new_volume();
            volume.mark_bad_block(100).unwrap();
            volume.mark_bad_block(100).unwrap();

            let stats = volume.stat().unwrap();
            assert_eq!(stats.bad_blocks, 1);
            assert_eq!(stats.free_blocks, 4096 - 22);
        }

        #[test]
        fn test_metadata_block() {
            let volume = new_volume();

            assert!(matches!(
                volume.mark_bad_block(18),
                Err(FsError::InvalidIndex { .. })
            ));
            assert!(matches!(
                volume.mark_bad_block(4096),
                Err(FsError::InvalidIndex { .. })
            ));
        }
    }
}
