//! Translation of file-relative block indices to device blocks.
//!
//! Logical blocks are addressed, in ascending order, through the inode's direct pointers, then
//! through the single-, double- and triple-indirect blocks. With `N` pointers per indirect
//! block:
//!
//! ```text
//! [0, 8)                   direct_blocks[i]
//! [8, 8+N)                 indirect_primary -> i
//! [8+N, 8+N+N²)            indirect_secondary -> i / N -> i % N
//! [8+N+N², 8+N+N²+N³)      indirect_tertiary -> i / N² -> (i / N) % N -> i % N
//! ```

use std::mem;

use log::debug;

use crate::bitmap::BitmapAllocator;
use crate::disk_format::block::BLOCK_SIZE;
use crate::disk_format::indirect::IndirectBlock;
use crate::disk_format::inode::{Inode, MAX_FILE_BLOCKS, NUM_DIRECT, POINTERS_PER_BLOCK};
use crate::error::{FsError, Result};
use crate::storage::{BlockStorage, BufferCache};
use crate::volume::BlockNumber;

const N: u64 = POINTERS_PER_BLOCK as u64;

/// Where the pointer to a logical block lives: which inode pointer to start from, and the
/// index to follow in each indirect block on the way down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockPath {
    Direct(usize),
    Single([usize; 1]),
    Double([usize; 2]),
    Triple([usize; 3]),
}

impl BlockPath {
    pub fn of(logical: u64) -> Result<BlockPath> {
        if logical >= MAX_FILE_BLOCKS {
            return Err(FsError::FileTooLarge { index: logical });
        }

        let mut index = logical;
        if index < NUM_DIRECT as u64 {
            return Ok(BlockPath::Direct(index as usize));
        }

        index -= NUM_DIRECT as u64;
        if index < N {
            return Ok(BlockPath::Single([index as usize]));
        }

        index -= N;
        if index < N * N {
            return Ok(BlockPath::Double([(index / N) as usize, (index % N) as usize]));
        }

        index -= N * N;
        Ok(BlockPath::Triple([
            (index / (N * N)) as usize,
            ((index / N) % N) as usize,
            (index % N) as usize,
        ]))
    }

    fn indices(&self) -> &[usize] {
        match self {
            BlockPath::Direct(_) => &[],
            BlockPath::Single(indices) => indices,
            BlockPath::Double(indices) => indices,
            BlockPath::Triple(indices) => indices,
        }
    }

    fn root(&self, inode: &Inode) -> u32 {
        match self {
            BlockPath::Direct(i) => inode.direct_blocks[*i],
            BlockPath::Single(_) => inode.indirect_primary,
            BlockPath::Double(_) => inode.indirect_secondary,
            BlockPath::Triple(_) => inode.indirect_tertiary,
        }
    }

    fn root_mut<'a>(&self, inode: &'a mut Inode) -> &'a mut u32 {
        match self {
            BlockPath::Direct(i) => &mut inode.direct_blocks[*i],
            BlockPath::Single(_) => &mut inode.indirect_primary,
            BlockPath::Double(_) => &mut inode.indirect_secondary,
            BlockPath::Triple(_) => &mut inode.indirect_tertiary,
        }
    }
}

/// Every block an inode references.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BlockTree {
    /// Data blocks, in logical order.
    pub data: Vec<BlockNumber>,
    /// Indirect blocks, parents before children.
    pub indirect: Vec<BlockNumber>,
}

/// Resolves and grows inode pointer trees. Inodes are passed in and mutated in memory;
/// persisting them is up to the caller.
pub struct BlockAddressResolver<'a, S: BlockStorage> {
    cache: &'a BufferCache<S>,
    blocks: &'a BitmapAllocator,
    retired: Option<&'a BitmapAllocator>,
    data_start: BlockNumber,
}

impl<'a, S: BlockStorage> BlockAddressResolver<'a, S> {
    /// `blocks` hands out data blocks; valid pointers are in `[data_start, cache.num_blocks())`.
    pub fn new(
        cache: &'a BufferCache<S>,
        blocks: &'a BitmapAllocator,
        data_start: BlockNumber,
    ) -> Self {
        Self {
            cache,
            blocks,
            retired: None,
            data_start,
        }
    }

    /// Blocks set in `retired` keep their claim in the block bitmap when an inode lets go of
    /// them.
    pub fn retiring(mut self, retired: &'a BitmapAllocator) -> Self {
        self.retired = Some(retired);
        self
    }

    /// The device block holding logical block `logical` of `inode`.
    pub fn resolve(&self, inode: &Inode, logical: u64) -> Result<BlockNumber> {
        let path = BlockPath::of(logical)?;

        if logical >= inode.block_count() {
            return Err(FsError::InvalidIndex {
                what: "logical block",
                index: logical,
                limit: inode.block_count(),
            });
        }

        let mut pointer = self.check_pointer(path.root(inode))?;
        for &index in path.indices() {
            pointer = self.check_pointer(self.pointer_at(pointer, index)?)?;
        }

        Ok(pointer)
    }

    /// Allocates data blocks (and the indirect blocks leading to them) for every logical index
    /// from the inode's current block count up to and including `target`. Each new data block
    /// adds `BLOCK_SIZE` to the inode's size. Returns the number of data blocks allocated.
    ///
    /// Blocks allocated before a failure stay linked into the inode.
    pub fn grow(&self, inode: &mut Inode, target: u64) -> Result<u64> {
        BlockPath::of(target)?;

        let current = inode.block_count();
        if target < current {
            return Ok(0);
        }

        for logical in current..=target {
            let block = self.install(inode, BlockPath::of(logical)?)?;
            inode.size += BLOCK_SIZE as u64;

            debug!("mapped logical block {logical} to block {block}");
        }

        Ok(target + 1 - current)
    }

    /// Releases the data blocks from `new_count` onwards, along with any indirect block left
    /// empty. The size is clamped to the blocks that remain as each one is released, so it
    /// stays consistent with the pointer tree if a release fails.
    pub fn shrink(&self, inode: &mut Inode, new_count: u64) -> Result<()> {
        let current = inode.block_count();

        for logical in (new_count..current).rev() {
            self.remove(inode, BlockPath::of(logical)?)?;
            inode.size = inode.size.min(logical * BLOCK_SIZE as u64);
        }

        Ok(())
    }

    /// Walks the whole pointer tree of `inode`.
    pub fn block_tree(&self, inode: &Inode) -> Result<BlockTree> {
        let mut tree = BlockTree::default();

        for pointer in inode.direct_blocks.iter().filter(|pointer| **pointer != 0) {
            tree.data.push(self.check_pointer(*pointer)?);
        }

        let roots = [
            (inode.indirect_primary, 1),
            (inode.indirect_secondary, 2),
            (inode.indirect_tertiary, 3),
        ];
        for (root, depth) in roots {
            if root != 0 {
                self.collect(self.check_pointer(root)?, depth, &mut tree)?;
            }
        }

        Ok(tree)
    }

    fn collect(&self, block: BlockNumber, depth: usize, tree: &mut BlockTree) -> Result<()> {
        tree.indirect.push(block);

        let pointers = IndirectBlock::new(self.cache.read(block)?).pointers();
        for pointer in pointers {
            let pointer = self.check_pointer(pointer)?;

            if depth == 1 {
                tree.data.push(pointer);
            } else {
                self.collect(pointer, depth - 1, tree)?;
            }
        }

        Ok(())
    }

    fn install(&self, inode: &mut Inode, path: BlockPath) -> Result<BlockNumber> {
        let indices = path.indices();
        let root = path.root_mut(inode);

        let Some((&last, parents)) = indices.split_last() else {
            let block = self.allocate_block()?;
            *root = block as u32;
            return Ok(block);
        };

        let mut chain = Vec::with_capacity(indices.len());
        let mut fresh = 0;

        let leaf = self.link_leaf(root, parents, last, &mut chain, &mut fresh);
        if leaf.is_err() && fresh > 0 {
            self.discard_fresh(root, &chain, indices, fresh)?;
        }

        leaf
    }

    /// Walks down to the leaf pointer, allocating missing indirect blocks on the way, then
    /// allocates the data block. `chain` collects the indirect blocks visited; the last `fresh`
    /// of them were allocated here.
    fn link_leaf(
        &self,
        root: &mut u32,
        parents: &[usize],
        last: usize,
        chain: &mut Vec<BlockNumber>,
        fresh: &mut usize,
    ) -> Result<BlockNumber> {
        // indirect blocks are linked in before the data block
        if *root == 0 {
            *root = self.allocate_block()? as u32;
            *fresh += 1;
        }
        let mut parent = self.check_pointer(*root)?;
        chain.push(parent);

        for &index in parents {
            let child = match self.pointer_at(parent, index)? {
                0 => {
                    let child = self.allocate_block()?;
                    self.set_pointer(parent, index, child)?;
                    *fresh += 1;
                    child
                }
                child => self.check_pointer(child)?,
            };

            chain.push(child);
            parent = child;
        }

        let block = self.allocate_block()?;
        self.set_pointer(parent, last, block)?;

        Ok(block)
    }

    /// Unlinks and releases the indirect blocks a failed [`Self::link_leaf`] allocated, so no
    /// indirect block is left without pointers.
    fn discard_fresh(
        &self,
        root: &mut u32,
        chain: &[BlockNumber],
        indices: &[usize],
        fresh: usize,
    ) -> Result<()> {
        let first = chain.len() - fresh;

        if first == 0 {
            *root = 0;
        } else {
            self.set_pointer(chain[first - 1], indices[first - 1], 0)?;
        }

        for &block in &chain[first..] {
            self.release_block(block)?;
        }

        Ok(())
    }

    fn remove(&self, inode: &mut Inode, path: BlockPath) -> Result<()> {
        let indices = path.indices();
        let root = path.root_mut(inode);

        if indices.is_empty() {
            let block = mem::take(root);
            if block != 0 {
                self.release_block(block as usize)?;
            }
            return Ok(());
        }

        let mut chain = Vec::with_capacity(indices.len());
        let mut pointer = *root;
        for &index in indices {
            let block = self.check_pointer(pointer)?;
            chain.push((block, index));
            pointer = self.pointer_at(block, index)?;
        }

        if pointer != 0 {
            self.release_block(pointer as usize)?;
        }

        // blocks fill from index 0 and empty from the end, so clearing index 0 empties the block
        for (depth, &(block, index)) in chain.iter().enumerate().rev() {
            self.set_pointer(block, index, 0)?;

            if index != 0 {
                break;
            }

            self.release_block(block)?;
            if depth == 0 {
                *root = 0;
            }
        }

        Ok(())
    }

    /// Claims a data block and zeroes it.
    fn allocate_block(&self) -> Result<BlockNumber> {
        let block = self.blocks.allocate(self.cache)?;
        self.cache.zeroed(block)?;

        Ok(block)
    }

    fn release_block(&self, block: BlockNumber) -> Result<()> {
        if let Some(retired) = self.retired {
            if retired.is_set(self.cache, block)? {
                debug!("block {block} is retired, keeping it claimed");
                return Ok(());
            }
        }

        self.blocks.release(self.cache, block)
    }

    fn pointer_at(&self, block: BlockNumber, index: usize) -> Result<u32> {
        let buffer = self.cache.get(block)?;
        let guard = buffer.lock();

        Ok(IndirectBlock::new(guard.data()).get(index))
    }

    fn set_pointer(&self, block: BlockNumber, index: usize, pointer: BlockNumber) -> Result<()> {
        let buffer = self.cache.get(block)?;
        let mut guard = buffer.lock();
        IndirectBlock::new(guard.data_mut()).set(index, pointer as u32);

        Ok(())
    }

    fn check_pointer(&self, pointer: u32) -> Result<BlockNumber> {
        let block = pointer as BlockNumber;

        if block < self.data_start || block >= self.cache.num_blocks() {
            return Err(FsError::Corruption(format!(
                "block pointer {pointer} outside the data region"
            )));
        }

        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use crate::disk_format::block::BITS_PER_BLOCK;
    use crate::disk_format::inode::InodeType;
    use crate::error::Resource;
    use crate::storage::MemoryStorage;

    use super::*;

    const DATA_START: BlockNumber = 2;

    /// A device whose block 1 is the block bitmap and whose data region starts at block 2.
    fn setup(num_blocks: usize) -> (BufferCache<MemoryStorage>, BitmapAllocator) {
        let cache = BufferCache::new(MemoryStorage::new(num_blocks)).unwrap();
        let blocks = BitmapAllocator::new(Resource::Blocks, 1, num_blocks.min(BITS_PER_BLOCK));
        blocks.reserve(&cache, 0).unwrap();
        blocks.reserve(&cache, 1).unwrap();

        (cache, blocks)
    }

    #[test]
    fn test_path_boundaries() {
        assert_eq!(BlockPath::of(0).unwrap(), BlockPath::Direct(0));
        assert_eq!(BlockPath::of(7).unwrap(), BlockPath::Direct(7));
        assert_eq!(BlockPath::of(8).unwrap(), BlockPath::Single([0]));
        assert_eq!(BlockPath::of(1031).unwrap(), BlockPath::Single([1023]));
        assert_eq!(BlockPath::of(1032).unwrap(), BlockPath::Double([0, 0]));
        assert_eq!(BlockPath::of(1032 + 1025).unwrap(), BlockPath::Double([1, 1]));

        let triple_start = 8 + N + N * N;
        assert_eq!(
            BlockPath::of(triple_start - 1).unwrap(),
            BlockPath::Double([1023, 1023])
        );
        assert_eq!(BlockPath::of(triple_start).unwrap(), BlockPath::Triple([0, 0, 0]));
        assert_eq!(
            BlockPath::of(triple_start + N * N + N + 1).unwrap(),
            BlockPath::Triple([1, 1, 1])
        );
        assert_eq!(
            BlockPath::of(MAX_FILE_BLOCKS - 1).unwrap(),
            BlockPath::Triple([1023, 1023, 1023])
        );
    }

    #[test]
    fn test_path_beyond_maximum() {
        assert!(matches!(
            BlockPath::of(MAX_FILE_BLOCKS),
            Err(FsError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_direct_growth() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);

        assert_eq!(resolver.grow(&mut inode, 7).unwrap(), 8);

        assert_eq!(inode.size, 8 * BLOCK_SIZE as u64);
        assert_eq!(inode.direct_blocks, [2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(inode.indirect_primary, 0);
        assert_eq!(resolver.resolve(&inode, 7).unwrap(), 9);
    }

    #[test]
    fn test_single_indirect_growth() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);

        resolver.grow(&mut inode, 9).unwrap();

        // the indirect block is allocated before the first data block it maps
        assert_eq!(inode.indirect_primary, 10);
        assert_eq!(resolver.resolve(&inode, 8).unwrap(), 11);
        assert_eq!(resolver.resolve(&inode, 9).unwrap(), 12);
        assert_eq!(inode.size, 10 * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_double_indirect_growth() {
        let (cache, blocks) = setup(1100);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);

        resolver.grow(&mut inode, 1032).unwrap();

        // 8 direct + (1 + 1024) single + (2 + 1) double
        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 8 + 1025 + 3);
        assert_ne!(inode.indirect_secondary, 0);

        let outer = cache.read(inode.indirect_secondary as BlockNumber).unwrap();
        let inner_block = IndirectBlock::new(&outer).get(0) as BlockNumber;
        let inner = cache.read(inner_block).unwrap();
        let leaf = IndirectBlock::new(&inner).get(0) as BlockNumber;

        assert_eq!(resolver.resolve(&inode, 1032).unwrap(), leaf);
    }

    #[test]
    fn test_triple_indirect_resolution() {
        let (cache, blocks) = setup(16);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);

        // hand-build a tree that maps the first triple-indirect block to block 13
        let mut inode = Inode::new(InodeType::File);
        let logical = 8 + N + N * N;
        inode.size = (logical + 1) * BLOCK_SIZE as u64;
        inode.indirect_tertiary = 10;
        resolver.set_pointer(10, 0, 11).unwrap();
        resolver.set_pointer(11, 0, 12).unwrap();
        resolver.set_pointer(12, 0, 13).unwrap();

        assert_eq!(resolver.resolve(&inode, logical).unwrap(), 13);
    }

    #[test]
    fn test_triple_indirect_growth_and_shrink() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);

        // a sparse file that ends right where the triple-indirect range begins
        let mut inode = Inode::new(InodeType::File);
        let start = 8 + N + N * N;
        inode.size = start * BLOCK_SIZE as u64;

        assert_eq!(resolver.grow(&mut inode, start + 1).unwrap(), 2);

        // three indirect levels, then two data blocks
        assert_eq!(inode.indirect_tertiary, 2);
        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 3 + 2);
        assert_eq!(resolver.resolve(&inode, start).unwrap(), 5);
        assert_eq!(resolver.resolve(&inode, start + 1).unwrap(), 6);

        resolver.shrink(&mut inode, start).unwrap();

        assert_eq!(inode.indirect_tertiary, 0);
        assert_eq!(blocks.count_set(&cache).unwrap(), 2);
        assert_eq!(inode.size, start * BLOCK_SIZE as u64);
    }

    #[test]
    fn test_growth_is_monotonic() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 2).unwrap();
        let used = blocks.count_set(&cache).unwrap();

        assert_eq!(resolver.grow(&mut inode, 5).unwrap(), 3);

        assert_eq!(inode.size, 6 * BLOCK_SIZE as u64);
        assert_eq!(blocks.count_set(&cache).unwrap(), used + 3);
        assert_eq!(resolver.grow(&mut inode, 4).unwrap(), 0);
    }

    #[test]
    fn test_growth_keeps_partial_size() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        inode.size = 10;
        inode.direct_blocks[0] = blocks.allocate(&cache).unwrap() as u32;

        resolver.grow(&mut inode, 1).unwrap();

        assert_eq!(inode.size, 10 + BLOCK_SIZE as u64);
        assert_eq!(inode.block_count(), 2);
    }

    #[test]
    fn test_resolve_beyond_end() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 1).unwrap();

        assert!(matches!(
            resolver.resolve(&inode, 2),
            Err(FsError::InvalidIndex { .. })
        ));
        assert!(matches!(
            resolver.resolve(&inode, MAX_FILE_BLOCKS),
            Err(FsError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn test_growth_out_of_space() {
        let (cache, blocks) = setup(8);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);

        assert!(matches!(
            resolver.grow(&mut inode, 10),
            Err(FsError::OutOfSpace(Resource::Blocks))
        ));

        // what was allocated before running out stays allocated
        assert_eq!(inode.block_count(), 6);
        assert_eq!(inode.direct_blocks[..6], [2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_growth_out_of_space_under_new_indirect_block() {
        // room for the eight direct blocks and one more
        let (cache, blocks) = setup(11);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);

        assert!(matches!(
            resolver.grow(&mut inode, 8),
            Err(FsError::OutOfSpace(Resource::Blocks))
        ));

        // the single-indirect block had nothing to point at, so it was given back
        assert_eq!(inode.indirect_primary, 0);
        assert_eq!(inode.block_count(), 8);
        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 8);
    }

    #[test]
    fn test_shrink_releases_blocks() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 11).unwrap();
        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 12 + 1);

        resolver.shrink(&mut inode, 9).unwrap();
        assert_eq!(inode.size, 9 * BLOCK_SIZE as u64);

        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 9 + 1);
        assert_ne!(inode.indirect_primary, 0);

        resolver.shrink(&mut inode, 8).unwrap();

        assert_eq!(blocks.count_set(&cache).unwrap(), 2 + 8);
        assert_eq!(inode.indirect_primary, 0);

        resolver.shrink(&mut inode, 0).unwrap();
        assert_eq!(inode.size, 0);

        assert_eq!(blocks.count_set(&cache).unwrap(), 2);
        assert_eq!(inode.direct_blocks, [0; NUM_DIRECT]);
    }

    #[test]
    fn test_shrink_keeps_retired_blocks() {
        let (cache, blocks) = setup(64);
        let retired = BitmapAllocator::new(Resource::BadBlocks, 63, 64);
        blocks.reserve(&cache, 63).unwrap();
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START).retiring(&retired);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 1).unwrap();
        retired.reserve(&cache, 3).unwrap();

        resolver.shrink(&mut inode, 0).unwrap();

        assert!(!blocks.is_set(&cache, 2).unwrap());
        assert!(blocks.is_set(&cache, 3).unwrap());
        assert_eq!(blocks.allocate(&cache).unwrap(), 2);
        assert_eq!(blocks.allocate(&cache).unwrap(), 4);
    }

    #[test]
    fn test_shrink_then_regrow_reuses_blocks() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 3).unwrap();

        resolver.shrink(&mut inode, 2).unwrap();
        resolver.grow(&mut inode, 2).unwrap();

        assert_eq!(resolver.resolve(&inode, 2).unwrap(), 4);
    }

    #[test]
    fn test_block_tree() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        resolver.grow(&mut inode, 9).unwrap();

        let tree = resolver.block_tree(&inode).unwrap();

        assert_eq!(tree.data, vec![2, 3, 4, 5, 6, 7, 8, 9, 11, 12]);
        assert_eq!(tree.indirect, vec![10]);
    }

    #[test]
    fn test_pointer_outside_data_region() {
        let (cache, blocks) = setup(64);
        let resolver = BlockAddressResolver::new(&cache, &blocks, DATA_START);
        let mut inode = Inode::new(InodeType::File);
        inode.size = 1;
        inode.direct_blocks[0] = 1;

        assert!(matches!(
            resolver.resolve(&inode, 0),
            Err(FsError::Corruption(_))
        ));
    }
}
