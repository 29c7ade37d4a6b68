//! Inode records in the inode table.

use log::debug;

use crate::bitmap::BitmapAllocator;
use crate::disk_format::block::BLOCK_SIZE;
use crate::disk_format::inode::{Inode, InodeType, INODE_SIZE, NULL_INODE};
use crate::error::{FsError, Result, Resource};
use crate::layout::Layout;
use crate::storage::{BlockStorage, BufferCache};
use crate::volume::{BlockNumber, InodeNumber};

/// Reads and writes fixed-size inode records, and hands out inode numbers from the inode
/// bitmap. Inode `n` occupies slot `n - 1` of the table and bit `n` of the bitmap.
#[derive(Clone, Debug)]
pub struct InodeStore {
    table_start: BlockNumber,
    num_inodes: u32,
    bitmap: BitmapAllocator,
}

impl InodeStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            table_start: layout.inode_table_start as BlockNumber,
            num_inodes: layout.inode_count,
            bitmap: BitmapAllocator::new(
                Resource::Inodes,
                layout.inode_bitmap_start as BlockNumber,
                layout.inode_count as usize,
            ),
        }
    }

    pub fn bitmap(&self) -> &BitmapAllocator {
        &self.bitmap
    }

    pub fn num_inodes(&self) -> u32 {
        self.num_inodes
    }

    pub fn load<S: BlockStorage>(
        &self,
        cache: &BufferCache<S>,
        inum: InodeNumber,
    ) -> Result<Inode> {
        let (block_number, offset) = self.position(inum)?;

        let buffer = cache.get(block_number)?;
        let guard = buffer.lock();

        decode_at(&guard.data()[offset..offset + INODE_SIZE], inum)
    }

    /// Writes `inode` back, leaving the other records of its block untouched.
    pub fn store<S: BlockStorage>(
        &self,
        cache: &BufferCache<S>,
        inum: InodeNumber,
        inode: &Inode,
    ) -> Result<()> {
        let (block_number, offset) = self.position(inum)?;
        let encoded = inode.encode()?;

        let buffer = cache.get(block_number)?;
        let mut guard = buffer.lock();
        guard.data_mut()[offset..offset + INODE_SIZE].copy_from_slice(&encoded);

        Ok(())
    }

    /// Applies `f` to the stored record of `inum` while holding its table block, so concurrent
    /// updates of other fields in the same record aren't lost.
    pub fn update<S: BlockStorage, T>(
        &self,
        cache: &BufferCache<S>,
        inum: InodeNumber,
        f: impl FnOnce(&mut Inode) -> T,
    ) -> Result<T> {
        let (block_number, offset) = self.position(inum)?;

        let buffer = cache.get(block_number)?;
        let mut guard = buffer.lock();

        let mut inode = decode_at(&guard.data()[offset..offset + INODE_SIZE], inum)?;
        let result = f(&mut inode);
        let encoded = inode.encode()?;
        guard.data_mut()[offset..offset + INODE_SIZE].copy_from_slice(&encoded);

        Ok(result)
    }

    /// Claims the lowest free inode number and writes a fresh record of type `type_` to it.
    pub fn allocate_new<S: BlockStorage>(
        &self,
        cache: &BufferCache<S>,
        type_: InodeType,
    ) -> Result<(InodeNumber, Inode)> {
        let inum = self.bitmap.allocate(cache)? as InodeNumber;
        let inode = Inode::new(type_);

        self.store(cache, inum, &inode)?;
        debug!("allocated inode {inum} ({type_:?})");

        Ok((inum, inode))
    }

    /// Returns `inum` to the free pool. The record itself is left as it is.
    pub fn free<S: BlockStorage>(&self, cache: &BufferCache<S>, inum: InodeNumber) -> Result<()> {
        self.check_bounds(inum)?;
        self.bitmap.release(cache, inum as usize)
    }

    pub fn is_allocated<S: BlockStorage>(
        &self,
        cache: &BufferCache<S>,
        inum: InodeNumber,
    ) -> Result<bool> {
        self.check_bounds(inum)?;
        self.bitmap.is_set(cache, inum as usize)
    }

    /// The block holding `inum` and the record's byte offset within it.
    fn position(&self, inum: InodeNumber) -> Result<(BlockNumber, usize)> {
        self.check_bounds(inum)?;

        let position = (inum as usize - 1) * INODE_SIZE;
        Ok((self.table_start + position / BLOCK_SIZE, position % BLOCK_SIZE))
    }

    fn check_bounds(&self, inum: InodeNumber) -> Result<()> {
        if inum == NULL_INODE || inum >= self.num_inodes {
            return Err(FsError::InvalidIndex {
                what: "inode",
                index: inum as u64,
                limit: self.num_inodes as u64,
            });
        }

        Ok(())
    }
}

fn decode_at(bytes: &[u8], inum: InodeNumber) -> Result<Inode> {
    Inode::decode(bytes).map_err(|err| match err {
        FsError::Corruption(reason) => FsError::Corruption(format!("inode {inum}: {reason}")),
        err => err,
    })
}
