use log::debug;

use crate::disk_format::block::BLOCK_SIZE;
use crate::disk_format::inode::{Inode, MAX_FILE_SIZE};
use crate::error::{FsError, Result};
use crate::storage::BlockStorage;

use super::{InodeNumber, Volume};

const BS: u64 = BLOCK_SIZE as u64;

impl<S: BlockStorage> Volume<S> {
    /// Reads up to `len` bytes starting at `offset`. Reads stop at the end of the file.
    pub fn read_file(&self, inum: InodeNumber, offset: u64, len: usize) -> Result<Vec<u8>> {
        debug!("[inode #{inum}] reading file (offset = {offset}; len = {len})");

        let file = self.open(inum)?.into_file()?;
        let inode = file.into_inode();

        let end = offset.saturating_add(len as u64).min(inode.size);
        let resolver = self.resolver();

        let mut data = Vec::with_capacity(end.saturating_sub(offset) as usize);
        let mut position = offset;
        while position < end {
            let start_offset = (position % BS) as usize;
            let chunk = (BS - start_offset as u64).min(end - position) as usize;

            let buffer = self.cache.get(resolver.resolve(&inode, position / BS)?)?;
            let guard = buffer.lock();
            data.extend_from_slice(&guard.data()[start_offset..start_offset + chunk]);

            position += chunk as u64;
        }

        // a concurrent writer may have grown the file since it was read
        self.update_inode(inum, Inode::touch_accessed)?;

        Ok(data)
    }

    /// Writes `data` at `offset`, growing the file as needed. Any gap between the old end of the
    /// file and `offset` reads back as zeroes.
    pub fn write_file(&self, inum: InodeNumber, offset: u64, data: &[u8]) -> Result<usize> {
        debug!(
            "[inode #{inum}] writing file (offset = {offset}; data.len() = {})",
            data.len()
        );

        let file = self.open(inum)?.into_file()?;
        let mut inode = file.into_inode();

        if data.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MAX_FILE_SIZE)
            .ok_or(FsError::FileTooLarge {
                index: offset.saturating_add(data.len() as u64 - 1) / BS,
            })?;

        let old_size = inode.size;
        let resolver = self.resolver();

        // grows the file only if necessary
        if let Err(err) = resolver.grow(&mut inode, (end - 1) / BS) {
            return self.store_after_error(inum, &inode, err);
        }

        let mut position = offset;
        while position < end {
            let start_offset = (position % BS) as usize;
            let chunk = (BS - start_offset as u64).min(end - position) as usize;
            let source = (position - offset) as usize;

            let buffer = self.cache.get(resolver.resolve(&inode, position / BS)?)?;
            let mut guard = buffer.lock();
            guard.data_mut()[start_offset..start_offset + chunk]
                .copy_from_slice(&data[source..source + chunk]);

            position += chunk as u64;
        }

        inode.size = old_size.max(end);
        inode.touch_modified();
        self.write_inode(inum, &inode)?;

        debug!("[inode #{inum}] wrote {} bytes", data.len());
        Ok(data.len())
    }

    /// Sets the size of a file. Shrinking releases the data blocks past the new end along with
    /// any indirect block left empty; extending allocates zeroed blocks.
    pub fn truncate(&self, inum: InodeNumber, new_size: u64) -> Result<()> {
        debug!("[inode #{inum}] truncating to {new_size} bytes");

        let file = self.open(inum)?.into_file()?;
        let mut inode = file.into_inode();

        if new_size > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge {
                index: (new_size - 1) / BS,
            });
        }

        let resolver = self.resolver();
        let new_blocks = new_size.div_ceil(BS);

        if new_size < inode.size {
            if let Err(err) = resolver.shrink(&mut inode, new_blocks) {
                return self.store_after_error(inum, &inode, err);
            }

            // later growth must not expose the bytes past the new end
            let tail = (new_size % BS) as usize;
            if tail != 0 {
                let buffer = self.cache.get(resolver.resolve(&inode, new_size / BS)?)?;
                buffer.lock().data_mut()[tail..].fill(0);
            }
        } else if new_blocks > inode.block_count() {
            if let Err(err) = resolver.grow(&mut inode, new_blocks - 1) {
                return self.store_after_error(inum, &inode, err);
            }
        }

        inode.size = new_size;
        inode.touch_modified();
        self.write_inode(inum, &inode)
    }
}
