//! First-fit allocation over on-disk bitmaps.

use bitvec::{order::Lsb0, slice::BitSlice};
use log::{debug, warn};

use crate::disk_format::block::{bitmap_blocks, BITS_PER_BLOCK};
use crate::error::{FsError, Result, Resource};
use crate::storage::{BlockStorage, BufferCache};
use crate::volume::BlockNumber;

/// Tracks the free/used state of one kind of unit with one bit per unit, packed eight per byte
/// (bit 0 is the least significant) across a run of blocks.
///
/// The bits live directly in cached device blocks, so allocating dirties exactly the block
/// holding the bit. A set bit means "used".
#[derive(Clone, Debug)]
pub struct BitmapAllocator {
    resource: Resource,
    start: BlockNumber,
    bits: usize,
}

impl BitmapAllocator {
    /// A bitmap of `bits` units starting at block `start`.
    pub fn new(resource: Resource, start: BlockNumber, bits: usize) -> Self {
        Self {
            resource,
            start,
            bits,
        }
    }

    pub fn num_blocks(&self) -> usize {
        bitmap_blocks(self.bits)
    }

    /// Claims the lowest free unit.
    pub fn allocate<S: BlockStorage>(&self, cache: &BufferCache<S>) -> Result<usize> {
        for i in 0..self.num_blocks() {
            let valid = self.valid_bits(i);

            let buffer = cache.get(self.start + i)?;
            let mut guard = buffer.lock();

            let Some(bit) = BitSlice::<u8, Lsb0>::from_slice(guard.data())[..valid].first_zero()
            else {
                continue;
            };

            BitSlice::<u8, Lsb0>::from_slice_mut(guard.data_mut()).set(bit, true);

            let unit = i * BITS_PER_BLOCK + bit;
            debug!("allocated {} unit {unit}", self.resource);

            return Ok(unit);
        }

        Err(FsError::OutOfSpace(self.resource))
    }

    /// Frees `unit`. Freeing a unit that is already free changes nothing and is only logged.
    pub fn release<S: BlockStorage>(&self, cache: &BufferCache<S>, unit: usize) -> Result<()> {
        self.check_bounds(unit)?;

        let (block, bit) = self.position(unit);
        let buffer = cache.get(block)?;
        let mut guard = buffer.lock();

        if !BitSlice::<u8, Lsb0>::from_slice(guard.data())[bit] {
            warn!("releasing {} unit {unit}, which is already free", self.resource);
            return Ok(());
        }

        BitSlice::<u8, Lsb0>::from_slice_mut(guard.data_mut()).set(bit, false);
        debug!("released {} unit {unit}", self.resource);

        Ok(())
    }

    /// Marks `unit` used regardless of the allocation order. Returns whether it was free.
    pub fn reserve<S: BlockStorage>(&self, cache: &BufferCache<S>, unit: usize) -> Result<bool> {
        self.check_bounds(unit)?;

        let (block, bit) = self.position(unit);
        let buffer = cache.get(block)?;
        let mut guard = buffer.lock();

        if BitSlice::<u8, Lsb0>::from_slice(guard.data())[bit] {
            return Ok(false);
        }

        BitSlice::<u8, Lsb0>::from_slice_mut(guard.data_mut()).set(bit, true);

        Ok(true)
    }

    pub fn is_set<S: BlockStorage>(&self, cache: &BufferCache<S>, unit: usize) -> Result<bool> {
        self.check_bounds(unit)?;

        let (block, bit) = self.position(unit);
        let buffer = cache.get(block)?;
        let guard = buffer.lock();

        Ok(BitSlice::<u8, Lsb0>::from_slice(guard.data())[bit])
    }

    /// The number of used units.
    pub fn count_set<S: BlockStorage>(&self, cache: &BufferCache<S>) -> Result<usize> {
        let mut count = 0;

        for i in 0..self.num_blocks() {
            let buffer = cache.get(self.start + i)?;
            let guard = buffer.lock();

            let bits = &BitSlice::<u8, Lsb0>::from_slice(guard.data())[..self.valid_bits(i)];
            count += bits.count_ones();
        }

        Ok(count)
    }

    /// The used units, in ascending order.
    pub fn set_units<S: BlockStorage>(&self, cache: &BufferCache<S>) -> Result<Vec<usize>> {
        let mut units = vec![];

        for i in 0..self.num_blocks() {
            let buffer = cache.get(self.start + i)?;
            let guard = buffer.lock();

            let bits = &BitSlice::<u8, Lsb0>::from_slice(guard.data())[..self.valid_bits(i)];
            units.extend(bits.iter_ones().map(|bit| i * BITS_PER_BLOCK + bit));
        }

        Ok(units)
    }

    /// The number of meaningful bits in the `i`th block of the region.
    fn valid_bits(&self, i: usize) -> usize {
        (self.bits - i * BITS_PER_BLOCK).min(BITS_PER_BLOCK)
    }

    fn position(&self, unit: usize) -> (BlockNumber, usize) {
        (self.start + unit / BITS_PER_BLOCK, unit % BITS_PER_BLOCK)
    }

    fn check_bounds(&self, unit: usize) -> Result<()> {
        if unit >= self.bits {
            return Err(FsError::InvalidIndex {
                what: "bitmap unit",
                index: unit as u64,
                limit: self.bits as u64,
            });
        }

        Ok(())
    }
}
