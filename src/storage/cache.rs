use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::disk_format::block::{Block, EMPTY_BLOCK};
use crate::error::{FsError, Result};
use crate::volume::BlockNumber;

use super::block_storage::BlockStorage;

/// In-memory copies of device blocks, each with its own lock.
///
/// A block is the unit of mutual exclusion: a read-modify-write sequence holds the block's
/// [`BufferGuard`] throughout. Modified blocks stay dirty until [`BufferCache::sync`].
///
/// Lock order is buffer before map: nothing locks a buffer while holding the map lock, except
/// with `try_lock`.
pub struct BufferCache<S: BlockStorage> {
    storage: S,
    num_blocks: usize,
    buffers: Mutex<HashMap<BlockNumber, Arc<Buffer>>>,
}

/// A cached block. Hold the `Arc` for as long as the block is in use.
pub struct Buffer {
    block_number: BlockNumber,
    state: Mutex<BufferState>,
}

struct BufferState {
    data: Box<Block>,
    dirty: bool,
}

/// Exclusive access to a cached block, released when dropped.
pub struct BufferGuard<'a> {
    state: MutexGuard<'a, BufferState>,
}

impl<S: BlockStorage> BufferCache<S> {
    /// Caches the whole device.
    pub fn new(storage: S) -> Result<Self> {
        let num_blocks = storage.num_blocks()?;
        Ok(Self::with_limit(storage, num_blocks))
    }

    /// Caches the first `num_blocks` blocks of the device. Anything past them is out of range.
    pub fn with_limit(storage: S, num_blocks: usize) -> Self {
        Self {
            storage,
            num_blocks,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Returns the buffer for `block_number`, reading it from the device on first use.
    pub fn get(&self, block_number: BlockNumber) -> Result<Arc<Buffer>> {
        self.check_bounds(block_number)?;

        let mut buffers = self.lock_buffers();
        if let Some(buffer) = buffers.get(&block_number) {
            return Ok(Arc::clone(buffer));
        }

        let data = self.storage.read_block(block_number)?;
        let buffer = Arc::new(Buffer::new(block_number, data, false));
        buffers.insert(block_number, Arc::clone(&buffer));

        Ok(buffer)
    }

    /// Replaces the contents of `block_number` with zeroes without reading the device. Used for
    /// freshly allocated blocks.
    pub fn zeroed(&self, block_number: BlockNumber) -> Result<Arc<Buffer>> {
        self.install(block_number, &EMPTY_BLOCK)
    }

    /// Copies out the contents of `block_number`.
    pub fn read(&self, block_number: BlockNumber) -> Result<Block> {
        let buffer = self.get(block_number)?;
        let guard = buffer.lock();

        Ok(*guard.data())
    }

    /// Overwrites the whole of `block_number`.
    pub fn write(&self, block_number: BlockNumber, block: &Block) -> Result<()> {
        self.install(block_number, block).map(|_| ())
    }

    /// Writes every dirty buffer back to the device, then drops clean buffers nobody else holds.
    pub fn sync(&self) -> Result<()> {
        let mut buffers: Vec<Arc<Buffer>> = self.lock_buffers().values().cloned().collect();
        buffers.sort_by_key(|buffer| buffer.block_number);

        let mut written = 0;
        for buffer in &buffers {
            let mut state = buffer.lock_state();

            if state.dirty {
                self.storage.write_block(buffer.block_number, &state.data)?;
                state.dirty = false;
                written += 1;
            }
        }
        drop(buffers);

        self.storage.flush()?;

        let mut buffers = self.lock_buffers();
        let cached = buffers.len();
        buffers.retain(|_, buffer| {
            // a buffer locked by someone else is in use
            Arc::strong_count(buffer) > 1
                || buffer.state.try_lock().map(|state| state.dirty).unwrap_or(true)
        });

        debug!(
            "synced {written} blocks, evicted {} buffers",
            cached - buffers.len()
        );

        Ok(())
    }

    /// The number of buffers waiting to be written back.
    pub fn dirty_count(&self) -> usize {
        let buffers: Vec<Arc<Buffer>> = self.lock_buffers().values().cloned().collect();

        buffers
            .iter()
            .filter(|buffer| buffer.lock_state().dirty)
            .count()
    }

    /// Gives back the storage. Unsynced changes are lost.
    pub fn into_storage(self) -> S {
        self.storage
    }

    fn install(&self, block_number: BlockNumber, block: &Block) -> Result<Arc<Buffer>> {
        self.check_bounds(block_number)?;

        let buffer = {
            let mut buffers = self.lock_buffers();
            match buffers.get(&block_number) {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    let buffer = Arc::new(Buffer::new(block_number, *block, true));
                    buffers.insert(block_number, Arc::clone(&buffer));
                    return Ok(buffer);
                }
            }
        };

        // the map lock is released before the buffer is locked
        buffer.lock().data_mut().copy_from_slice(block);

        Ok(buffer)
    }

    fn check_bounds(&self, block_number: BlockNumber) -> Result<()> {
        if block_number >= self.num_blocks {
            return Err(FsError::InvalidIndex {
                what: "block",
                index: block_number as u64,
                limit: self.num_blocks as u64,
            });
        }

        Ok(())
    }

    fn lock_buffers(&self) -> MutexGuard<'_, HashMap<BlockNumber, Arc<Buffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Buffer {
    fn new(block_number: BlockNumber, data: Block, dirty: bool) -> Self {
        Self {
            block_number,
            state: Mutex::new(BufferState {
                data: Box::new(data),
                dirty,
            }),
        }
    }

    /// Blocks until this thread has exclusive access to the block.
    pub fn lock(&self) -> BufferGuard<'_> {
        BufferGuard { state: self.lock_state() }
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferGuard<'_> {
    pub fn data(&self) -> &Block {
        &self.state.data
    }

    /// Mutable access to the block. Marks it dirty.
    pub fn data_mut(&mut self) -> &mut Block {
        self.state.dirty = true;
        &mut self.state.data
    }
}
