use log::{debug, warn};

use crate::disk_format::directory::{
    DirectoryBlock, DirectoryEntry, DirectoryEntryName, DIRECTORY_SLOTS_PER_BLOCK,
};
use crate::disk_format::inode::{Inode, InodeType, ROOT_INODE};
use crate::error::{FsError, Result};
use crate::storage::BlockStorage;

use super::{BlockNumber, InodeNumber, Volume};

/// Where a directory entry lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryLocation {
    block: BlockNumber,
    slot: usize,
    inum: InodeNumber,
}

impl<S: BlockStorage> Volume<S> {
    pub fn lookup(&self, parent: InodeNumber, name: impl AsRef<[u8]>) -> Result<InodeNumber> {
        let name = DirectoryEntryName::try_from(name.as_ref())?;
        let directory = self.directory_inode(parent)?;

        self.find_entry(&directory, &name)?
            .map(|location| location.inum)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// The occupied entries of a directory, in block and slot order.
    pub fn read_directory(&self, inum: InodeNumber) -> Result<Vec<DirectoryEntry>> {
        let directory = self.directory_inode(inum)?;

        let mut entries = vec![];
        for block in self.directory_blocks(&directory)? {
            let buffer = self.cache.get(block)?;
            let guard = buffer.lock();
            entries.extend(DirectoryBlock::new(guard.data()).entries());
        }

        Ok(entries)
    }

    pub fn create_file(&self, parent: InodeNumber, name: impl AsRef<[u8]>) -> Result<InodeNumber> {
        self.create(parent, name.as_ref(), InodeType::File)
    }

    /// Creates an empty directory owning one zeroed directory block.
    pub fn create_directory(
        &self,
        parent: InodeNumber,
        name: impl AsRef<[u8]>,
    ) -> Result<InodeNumber> {
        self.create(parent, name.as_ref(), InodeType::Directory)
    }

    /// Adds an entry for `inum` to `parent`. An inode has a single parent, so `inum` must not be
    /// linked anywhere yet.
    pub fn link(
        &self,
        parent: InodeNumber,
        name: impl AsRef<[u8]>,
        inum: InodeNumber,
    ) -> Result<()> {
        let name = DirectoryEntryName::try_from(name.as_ref())?;

        let child = self.open(inum)?;
        if inum == ROOT_INODE || child.inode().dir_block != 0 {
            return Err(FsError::AlreadyExists(format!("inode {inum} is already linked")));
        }

        self.link_entry(parent, &name, inum).map(|_| ())
    }

    /// Removes the entry `name` from `parent` and frees the file it names, along with its blocks.
    pub fn unlink(&self, parent: InodeNumber, name: impl AsRef<[u8]>) -> Result<InodeNumber> {
        let inum = self.lookup(parent, name)?;

        let child = self.read_inode(inum)?;
        if child.is_directory() {
            return Err(FsError::IsADirectory(inum));
        }

        self.detach(parent, inum, &child)?;
        self.release_inode(inum)?;

        debug!("unlinked inode {inum} from directory {parent}");
        Ok(inum)
    }

    /// Removes the empty directory `name` from `parent`.
    pub fn remove_directory(
        &self,
        parent: InodeNumber,
        name: impl AsRef<[u8]>,
    ) -> Result<InodeNumber> {
        let inum = self.lookup(parent, name)?;

        let child = self.directory_inode(inum)?;
        if child.entry_count != 0 {
            return Err(FsError::DirectoryNotEmpty(inum));
        }

        self.detach(parent, inum, &child)?;
        self.release_inode(inum)?;

        debug!("removed directory {inum} from directory {parent}");
        Ok(inum)
    }

    /// Moves the entry `name` of `parent` to `new_name` in `new_parent`. The target must not
    /// exist, and a directory can't move into its own subtree.
    pub fn rename(
        &self,
        parent: InodeNumber,
        name: impl AsRef<[u8]>,
        new_parent: InodeNumber,
        new_name: impl AsRef<[u8]>,
    ) -> Result<()> {
        let name = DirectoryEntryName::try_from(name.as_ref())?;
        let new_name = DirectoryEntryName::try_from(new_name.as_ref())?;

        let directory = self.directory_inode(parent)?;
        let old = self
            .find_entry(&directory, &name)?
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;

        let target = self.directory_inode(new_parent)?;
        if self.find_entry(&target, &new_name)?.is_some() {
            return Err(FsError::AlreadyExists(new_name.to_string()));
        }

        if self.read_inode(old.inum)?.is_directory() && self.in_subtree(old.inum, new_parent)? {
            return Err(FsError::MoveIntoSubtree(old.inum));
        }

        // the new entry goes in first so a failure leaves the old one in place
        self.link_entry(new_parent, &new_name, old.inum)?;
        self.clear_entry(parent, old)?;

        debug!("renamed {name} in {parent} to {new_name} in {new_parent}");
        Ok(())
    }

    fn create(&self, parent: InodeNumber, name: &[u8], type_: InodeType) -> Result<InodeNumber> {
        let name = DirectoryEntryName::try_from(name)?;

        let directory = self.directory_inode(parent)?;
        if self.find_entry(&directory, &name)?.is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let (inum, inode) = self.inodes.allocate_new(&self.cache, type_)?;

        let linked = match type_ {
            // an empty directory still owns one block of free slots
            InodeType::Directory => self.open(inum)?.grow(0).map(|_| ()),
            InodeType::File => Ok(()),
        }
        .and_then(|_| self.link_entry(parent, &name, inum));

        if let Err(err) = linked {
            self.release_inode(inum)?;
            return Err(err);
        }

        debug!("created {:?} {name} as inode {inum} in {parent}", inode.type_);
        Ok(inum)
    }

    /// Puts `name -> inum` in the first free slot of `parent`, growing the directory by a block
    /// when every slot is taken, and points the child's back-pointer at the new entry.
    fn link_entry(
        &self,
        parent: InodeNumber,
        name: &DirectoryEntryName,
        inum: InodeNumber,
    ) -> Result<EntryLocation> {
        let mut directory = self.directory_inode(parent)?;

        let mut placed = None;
        for block in self.directory_blocks(&directory)? {
            let buffer = self.cache.get(block)?;
            let mut guard = buffer.lock();

            if DirectoryBlock::new(guard.data()).free_slot().is_none() {
                continue;
            }

            let slot = DirectoryBlock::new(guard.data_mut()).insert(name, inum)?;
            placed = Some(EntryLocation { block, slot, inum });
            break;
        }

        let location = match placed {
            Some(location) => location,
            None => {
                let logical = directory.block_count();
                if let Err(err) = self.resolver().grow(&mut directory, logical) {
                    return self.store_after_error(parent, &directory, err);
                }

                self.update_inode(parent, |stored| stored.copy_block_map(&directory))?;

                let block = self.resolver().resolve(&directory, logical)?;
                let buffer = self.cache.get(block)?;
                let slot = DirectoryBlock::new(buffer.lock().data_mut()).insert(name, inum)?;
                debug!("directory {parent} grew to {} blocks", logical + 1);

                EntryLocation { block, slot, inum }
            }
        };

        self.update_inode(parent, |directory| {
            directory.entry_count += 1;
            directory.touch_modified();
        })?;

        self.update_inode(inum, |child| {
            child.dir_block = location.block as u32;
            child.dir_block_off = location.slot as u32;
        })?;

        Ok(location)
    }

    /// Removes the entry of `inum` from `parent`, going straight to the slot recorded in the
    /// child's back-pointer and scanning only if that slot doesn't hold it.
    fn detach(&self, parent: InodeNumber, inum: InodeNumber, child: &Inode) -> Result<()> {
        let recorded = EntryLocation {
            block: child.dir_block as BlockNumber,
            slot: child.dir_block_off as usize,
            inum,
        };

        let location = if self.holds_entry(recorded)? {
            recorded
        } else {
            warn!("stale directory back-pointer on inode {inum}");

            let directory = self.directory_inode(parent)?;
            self.find_inode(&directory, inum)?
                .ok_or_else(|| FsError::NotFound(format!("inode {inum} in directory {parent}")))?
        };

        self.clear_entry(parent, location)
    }

    fn clear_entry(&self, parent: InodeNumber, location: EntryLocation) -> Result<()> {
        let buffer = self.cache.get(location.block)?;
        DirectoryBlock::new(buffer.lock().data_mut()).remove(location.slot)?;

        self.update_inode(parent, |directory| {
            directory.entry_count = directory.entry_count.saturating_sub(1);
            directory.touch_modified();
        })
    }

    fn holds_entry(&self, location: EntryLocation) -> Result<bool> {
        if location.slot >= DIRECTORY_SLOTS_PER_BLOCK
            || location.block < self.layout.data_region_start as BlockNumber
            || location.block >= self.layout.block_count as BlockNumber
        {
            return Ok(false);
        }

        let buffer = self.cache.get(location.block)?;
        let guard = buffer.lock();

        Ok(DirectoryBlock::new(guard.data()).inode_at(location.slot) == location.inum)
    }

    fn find_entry(
        &self,
        directory: &Inode,
        name: &DirectoryEntryName,
    ) -> Result<Option<EntryLocation>> {
        for block in self.directory_blocks(directory)? {
            let buffer = self.cache.get(block)?;
            let guard = buffer.lock();

            if let Some((slot, inum)) = DirectoryBlock::new(guard.data()).find(name) {
                return Ok(Some(EntryLocation { block, slot, inum }));
            }
        }

        Ok(None)
    }

    fn find_inode(&self, directory: &Inode, inum: InodeNumber) -> Result<Option<EntryLocation>> {
        for block in self.directory_blocks(directory)? {
            let buffer = self.cache.get(block)?;
            let guard = buffer.lock();
            let directory_block = DirectoryBlock::new(guard.data());

            if let Some(slot) =
                (0..DIRECTORY_SLOTS_PER_BLOCK).find(|slot| directory_block.inode_at(*slot) == inum)
            {
                return Ok(Some(EntryLocation { block, slot, inum }));
            }
        }

        Ok(None)
    }

    /// Whether `target` is `root` or one of the directories below it.
    fn in_subtree(&self, root: InodeNumber, target: InodeNumber) -> Result<bool> {
        let mut queue = vec![root];

        while let Some(inum) = queue.pop() {
            if inum == target {
                return Ok(true);
            }

            for entry in self.read_directory(inum)? {
                if self.read_inode(entry.inum)?.is_directory() {
                    queue.push(entry.inum);
                }
            }
        }

        Ok(false)
    }

    fn directory_inode(&self, inum: InodeNumber) -> Result<Inode> {
        Ok(self.open(inum)?.into_directory()?.into_inode())
    }

    /// The device blocks holding a directory's slots, in order.
    fn directory_blocks(&self, directory: &Inode) -> Result<Vec<BlockNumber>> {
        let resolver = self.resolver();

        (0..directory.block_count())
            .map(|logical| resolver.resolve(directory, logical))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::disk_format::block::BLOCK_SIZE;
    use crate::disk_format::directory::MAX_NAME_LEN;
    use crate::error::Resource;
    use crate::volume::tests::new_volume;

    use super::*;

    fn names(entries: &[DirectoryEntry]) -> Vec<String> {
        entries.iter().map(|entry| entry.name.to_string()).collect()
    }

    mod lookup {
        use super::*;

        #[test]
        fn test_found() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "a.txt").unwrap();

            assert_ne!(inum, 0);
            assert_eq!(volume.lookup(ROOT_INODE, "a.txt").unwrap(), inum);
        }

        #[test]
        fn test_missing() {
            let volume = new_volume();

            assert!(matches!(
                volume.lookup(ROOT_INODE, "missing"),
                Err(FsError::NotFound(_))
            ));
        }

        #[test]
        fn test_in_file() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();

            assert!(matches!(
                volume.lookup(inum, "x"),
                Err(FsError::NotADirectory(n)) if n == inum
            ));
        }

        #[test]
        fn test_invalid_names() {
            let volume = new_volume();

            for name in ["", "a/b", "nul\0"] {
                assert!(matches!(
                    volume.lookup(ROOT_INODE, name),
                    Err(FsError::InvalidName(_))
                ));
            }
            assert!(matches!(
                volume.lookup(ROOT_INODE, [b'x'; MAX_NAME_LEN + 1]),
                Err(FsError::InvalidName(_))
            ));
        }
    }

    mod create {
        use super::*;

        #[test]
        fn test_file() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();

            let inode = volume.read_inode(inum).unwrap();
            assert_eq!(inode.type_, InodeType::File);
            assert_eq!(inode.size, 0);
            assert_eq!(volume.read_inode(ROOT_INODE).unwrap().entry_count, 1);
        }

        #[test]
        fn test_directory() {
            let volume = new_volume();
            let inum = volume.create_directory(ROOT_INODE, "d").unwrap();

            let inode = volume.read_inode(inum).unwrap();
            assert!(inode.is_directory());
            assert_eq!(inode.block_count(), 1);
            assert_eq!(inode.entry_count, 0);
            assert!(volume.read_directory(inum).unwrap().is_empty());
        }

        #[test]
        fn test_nested() {
            let volume = new_volume();
            let dir = volume.create_directory(ROOT_INODE, "d").unwrap();
            let inum = volume.create_file(dir, "f").unwrap();

            assert_eq!(volume.lookup(dir, "f").unwrap(), inum);
            assert!(matches!(
                volume.lookup(ROOT_INODE, "f"),
                Err(FsError::NotFound(_))
            ));
        }

        #[test]
        fn test_duplicate_name() {
            let volume = new_volume();
            volume.create_file(ROOT_INODE, "f").unwrap();
            let free_inodes = volume.stat().unwrap().free_inodes;

            assert!(matches!(
                volume.create_directory(ROOT_INODE, "f"),
                Err(FsError::AlreadyExists(_))
            ));
            assert_eq!(volume.stat().unwrap().free_inodes, free_inodes);
        }

        #[test]
        fn test_back_pointer() {
            let volume = new_volume();
            let first = volume.create_file(ROOT_INODE, "first").unwrap();
            let second = volume.create_file(ROOT_INODE, "second").unwrap();

            let inode = volume.read_inode(second).unwrap();
            assert_eq!(inode.dir_block, 20);
            assert_eq!(inode.dir_block_off, 1);
            assert_eq!(volume.read_inode(first).unwrap().dir_block_off, 0);
        }

        #[test]
        fn test_directory_grows_past_one_block() {
            let volume = new_volume();

            for i in 0..DIRECTORY_SLOTS_PER_BLOCK + 1 {
                volume.create_file(ROOT_INODE, format!("f{i}")).unwrap();
            }

            let root = volume.read_inode(ROOT_INODE).unwrap();
            assert_eq!(root.size, 2 * BLOCK_SIZE as u64);
            assert_eq!(root.entry_count, 16);

            let last = volume.lookup(ROOT_INODE, "f15").unwrap();
            let inode = volume.read_inode(last).unwrap();
            assert_eq!(inode.dir_block, root.direct_blocks[1]);
            assert_eq!(inode.dir_block_off, 0);
        }

        #[test]
        fn test_freed_slot_is_reused() {
            let volume = new_volume();
            for name in ["a", "b", "c"] {
                volume.create_file(ROOT_INODE, name).unwrap();
            }
            volume.unlink(ROOT_INODE, "b").unwrap();

            let inum = volume.create_file(ROOT_INODE, "d").unwrap();

            assert_eq!(volume.read_inode(inum).unwrap().dir_block_off, 1);
            assert_eq!(
                names(&volume.read_directory(ROOT_INODE).unwrap()),
                ["a", "d", "c"]
            );
        }

        #[test]
        fn test_out_of_inodes() {
            let volume = new_volume();
            let dir = volume.create_directory(ROOT_INODE, "d").unwrap();
            let free = volume.stat().unwrap().free_inodes;
            for i in 0..free {
                volume.create_file(dir, format!("{i}")).unwrap();
            }

            assert!(matches!(
                volume.create_file(ROOT_INODE, "one too many"),
                Err(FsError::OutOfSpace(Resource::Inodes))
            ));
            assert!(matches!(
                volume.lookup(ROOT_INODE, "one too many"),
                Err(FsError::NotFound(_))
            ));
        }
    }

    mod link {
        use super::*;

        #[test]
        fn test_unlinked_inode() {
            let volume = new_volume();
            let (inum, _) = volume.inodes.allocate_new(&volume.cache, InodeType::File).unwrap();

            volume.link(ROOT_INODE, "found", inum).unwrap();

            assert_eq!(volume.lookup(ROOT_INODE, "found").unwrap(), inum);
            assert_eq!(volume.read_inode(inum).unwrap().dir_block, 20);
        }

        #[test]
        fn test_already_linked() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();

            assert!(matches!(
                volume.link(ROOT_INODE, "g", inum),
                Err(FsError::AlreadyExists(_))
            ));
            assert!(matches!(
                volume.link(ROOT_INODE, "root", ROOT_INODE),
                Err(FsError::AlreadyExists(_))
            ));
        }

        #[test]
        fn test_free_inode() {
            let volume = new_volume();

            assert!(matches!(
                volume.link(ROOT_INODE, "ghost", 9),
                Err(FsError::NotFound(_))
            ));
        }
    }

    mod unlink {
        use super::*;

        #[test]
        fn test_frees_inode_and_blocks() {
            let volume = new_volume();
            let before = volume.stat().unwrap();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            volume.write_file(inum, 0, &vec![1; 20 * BLOCK_SIZE]).unwrap();

            assert_eq!(volume.unlink(ROOT_INODE, "f").unwrap(), inum);

            assert_eq!(volume.stat().unwrap(), before);
            assert_eq!(volume.read_inode(ROOT_INODE).unwrap().entry_count, 0);
            assert!(matches!(
                volume.lookup(ROOT_INODE, "f"),
                Err(FsError::NotFound(_))
            ));
        }

        #[test]
        fn test_directory() {
            let volume = new_volume();
            let inum = volume.create_directory(ROOT_INODE, "d").unwrap();

            assert!(matches!(
                volume.unlink(ROOT_INODE, "d"),
                Err(FsError::IsADirectory(n)) if n == inum
            ));
        }

        #[test]
        fn test_missing() {
            let volume = new_volume();

            assert!(matches!(
                volume.unlink(ROOT_INODE, "f"),
                Err(FsError::NotFound(_))
            ));
        }

        #[test]
        fn test_stale_back_pointer() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();
            let mut inode = volume.read_inode(inum).unwrap();
            inode.dir_block_off = 7;
            volume.write_inode(inum, &inode).unwrap();

            volume.unlink(ROOT_INODE, "f").unwrap();

            assert!(volume.read_directory(ROOT_INODE).unwrap().is_empty());
        }
    }

    mod remove_directory {
        use super::*;

        #[test]
        fn test_empty() {
            let volume = new_volume();
            let before = volume.stat().unwrap();
            volume.create_directory(ROOT_INODE, "d").unwrap();

            volume.remove_directory(ROOT_INODE, "d").unwrap();

            assert_eq!(volume.stat().unwrap(), before);
        }

        #[test]
        fn test_not_empty() {
            let volume = new_volume();
            let dir = volume.create_directory(ROOT_INODE, "d").unwrap();
            volume.create_file(dir, "f").unwrap();

            assert!(matches!(
                volume.remove_directory(ROOT_INODE, "d"),
                Err(FsError::DirectoryNotEmpty(n)) if n == dir
            ));
        }

        #[test]
        fn test_file() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();

            assert!(matches!(
                volume.remove_directory(ROOT_INODE, "f"),
                Err(FsError::NotADirectory(n)) if n == inum
            ));
        }
    }

    mod rename {
        use super::*;

        #[test]
        fn test_same_directory() {
            let volume = new_volume();
            let inum = volume.create_file(ROOT_INODE, "old").unwrap();

            volume.rename(ROOT_INODE, "old", ROOT_INODE, "new").unwrap();

            assert_eq!(volume.lookup(ROOT_INODE, "new").unwrap(), inum);
            assert!(matches!(
                volume.lookup(ROOT_INODE, "old"),
                Err(FsError::NotFound(_))
            ));
            assert_eq!(volume.read_inode(ROOT_INODE).unwrap().entry_count, 1);
        }

        #[test]
        fn test_across_directories() {
            let volume = new_volume();
            let dir = volume.create_directory(ROOT_INODE, "d").unwrap();
            let inum = volume.create_file(ROOT_INODE, "f").unwrap();

            volume.rename(ROOT_INODE, "f", dir, "g").unwrap();

            assert_eq!(volume.lookup(dir, "g").unwrap(), inum);
            assert_eq!(volume.read_inode(dir).unwrap().entry_count, 1);
            assert_eq!(volume.read_inode(ROOT_INODE).unwrap().entry_count, 1);

            // the back-pointer follows the entry
            let dir_block = volume.open(dir).unwrap().resolve_block(0).unwrap();
            assert_eq!(volume.read_inode(inum).unwrap().dir_block as usize, dir_block);
            volume.unlink(dir, "g").unwrap();
        }

        #[test]
        fn test_existing_target() {
            let volume = new_volume();
            volume.create_file(ROOT_INODE, "a").unwrap();
            volume.create_file(ROOT_INODE, "b").unwrap();

            assert!(matches!(
                volume.rename(ROOT_INODE, "a", ROOT_INODE, "b"),
                Err(FsError::AlreadyExists(_))
            ));
        }

        #[test]
        fn test_into_own_subtree() {
            let volume = new_volume();
            let outer = volume.create_directory(ROOT_INODE, "outer").unwrap();
            let inner = volume.create_directory(outer, "inner").unwrap();

            assert!(matches!(
                volume.rename(ROOT_INODE, "outer", inner, "outer"),
                Err(FsError::MoveIntoSubtree(n)) if n == outer
            ));
            assert!(matches!(
                volume.rename(ROOT_INODE, "outer", outer, "self"),
                Err(FsError::MoveIntoSubtree(n)) if n == outer
            ));
        }

        #[test]
        fn test_directory() {
            let volume = new_volume();
            let a = volume.create_directory(ROOT_INODE, "a").unwrap();
            let b = volume.create_directory(ROOT_INODE, "b").unwrap();
            volume.create_file(a, "f").unwrap();

            volume.rename(ROOT_INODE, "a", b, "a").unwrap();

            let moved = volume.lookup(b, "a").unwrap();
            assert_eq!(moved, a);
            assert_eq!(names(&volume.read_directory(moved).unwrap()), ["f"]);
            assert_eq!(names(&volume.read_directory(ROOT_INODE).unwrap()), ["b"]);
        }
    }
}
