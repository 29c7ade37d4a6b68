use std::fmt::{self, Debug};

use crate::error::{FsError, Result};
use crate::volume::InodeNumber;

use super::block::BLOCK_SIZE;
use super::inode::NULL_INODE;

/// The maximum supported size of a file or directory name. Names that long carry no terminator.
pub const MAX_NAME_LEN: usize = 256;

/// The number of entries that fit in a directory block. The first name-sized area of the block
/// holds the inode numbers instead of a name.
pub const DIRECTORY_SLOTS_PER_BLOCK: usize = BLOCK_SIZE / MAX_NAME_LEN - 1;

/// The offset of the first name within a directory block.
const NAMES_OFFSET: usize = MAX_NAME_LEN;

const INODE_NUMBER_SIZE: usize = 4;

const_assert!(DIRECTORY_SLOTS_PER_BLOCK * INODE_NUMBER_SIZE <= NAMES_OFFSET);
const_assert!(NAMES_OFFSET + DIRECTORY_SLOTS_PER_BLOCK * MAX_NAME_LEN == BLOCK_SIZE);

/// A name, as stored in a directory slot.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DirectoryEntryName([u8; MAX_NAME_LEN]);

impl DirectoryEntryName {
    /// The name's bytes, up to the first nul or the full slot width.
    pub fn as_bytes(&self) -> &[u8] {
        trim_name(&self.0)
    }
}

impl Debug for DirectoryEntryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DirectoryEntryName")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

impl fmt::Display for DirectoryEntryName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl TryFrom<&[u8]> for DirectoryEntryName {
    type Error = FsError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let invalid = |reason: &str| {
            FsError::InvalidName(format!("{}: {reason}", String::from_utf8_lossy(value)))
        };

        if value.is_empty() {
            return Err(invalid("empty name"));
        }

        if value.len() > MAX_NAME_LEN {
            return Err(invalid("more than 256 bytes long"));
        }

        if value.contains(&b'/') || value.contains(&0) {
            return Err(invalid("contains '/' or a nul byte"));
        }

        let mut converted = [0; MAX_NAME_LEN];
        converted[..value.len()].copy_from_slice(value);

        Ok(DirectoryEntryName(converted))
    }
}

impl TryFrom<&str> for DirectoryEntryName {
    type Error = FsError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.as_bytes().try_into()
    }
}

/// An occupied directory slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// The inode number.
    pub inum: InodeNumber,
    /// The name of the entry.
    pub name: DirectoryEntryName,
    /// The slot the entry occupies.
    pub slot: usize,
}

/// A view of one block of a directory's contents as a fixed array of slots.
///
/// ```text
/// | inode numbers [u32; 15] | padding | name 0 [u8; 256] | ... | name 14 [u8; 256] |
/// ```
///
/// A slot holding inode number 0 is free; its name bytes are meaningless.
pub struct DirectoryBlock<B>(B);

impl<B: AsRef<[u8]>> DirectoryBlock<B> {
    pub fn new(block: B) -> Self {
        DirectoryBlock(block)
    }

    pub fn inode_at(&self, slot: usize) -> InodeNumber {
        let start = slot * INODE_NUMBER_SIZE;
        let mut bytes = [0; INODE_NUMBER_SIZE];
        bytes.copy_from_slice(&self.0.as_ref()[start..start + INODE_NUMBER_SIZE]);

        u32::from_le_bytes(bytes)
    }

    pub fn name_at(&self, slot: usize) -> &[u8] {
        let start = NAMES_OFFSET + slot * MAX_NAME_LEN;
        trim_name(&self.0.as_ref()[start..start + MAX_NAME_LEN])
    }

    /// Scans the occupied slots for `name`, returning the slot and inode number of the first
    /// match.
    pub fn find(&self, name: &DirectoryEntryName) -> Option<(usize, InodeNumber)> {
        (0..DIRECTORY_SLOTS_PER_BLOCK)
            .filter(|slot| self.inode_at(*slot) != NULL_INODE)
            .find(|slot| self.name_at(*slot) == name.as_bytes())
            .map(|slot| (slot, self.inode_at(slot)))
    }

    pub fn lookup(&self, name: &DirectoryEntryName) -> Result<InodeNumber> {
        self.find(name)
            .map(|(_, inum)| inum)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    pub fn free_slot(&self) -> Option<usize> {
        (0..DIRECTORY_SLOTS_PER_BLOCK).find(|slot| self.inode_at(*slot) == NULL_INODE)
    }

    pub fn entries(&self) -> Vec<DirectoryEntry> {
        (0..DIRECTORY_SLOTS_PER_BLOCK)
            .filter(|slot| self.inode_at(*slot) != NULL_INODE)
            .map(|slot| DirectoryEntry {
                inum: self.inode_at(slot),
                name: self
                    .name_at(slot)
                    .try_into()
                    .unwrap_or_else(|_| stale_name(self.name_at(slot))),
                slot,
            })
            .collect()
    }

    /// The number of occupied slots.
    pub fn occupied(&self) -> usize {
        (0..DIRECTORY_SLOTS_PER_BLOCK)
            .filter(|slot| self.inode_at(*slot) != NULL_INODE)
            .count()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> DirectoryBlock<B> {
    /// Writes `name` and `inum` into the first free slot and returns that slot.
    pub fn insert(&mut self, name: &DirectoryEntryName, inum: InodeNumber) -> Result<usize> {
        let slot = self.free_slot().ok_or(FsError::DirectoryFull)?;

        let name_start = NAMES_OFFSET + slot * MAX_NAME_LEN;
        self.0.as_mut()[name_start..name_start + MAX_NAME_LEN].copy_from_slice(&name.0);
        self.set_inode(slot, inum);

        Ok(slot)
    }

    /// Frees `slot`, returning the inode number it held. The name bytes are left behind.
    pub fn remove(&mut self, slot: usize) -> Result<InodeNumber> {
        if slot >= DIRECTORY_SLOTS_PER_BLOCK {
            return Err(FsError::InvalidIndex {
                what: "directory slot",
                index: slot as u64,
                limit: DIRECTORY_SLOTS_PER_BLOCK as u64,
            });
        }

        let inum = self.inode_at(slot);
        self.set_inode(slot, NULL_INODE);

        Ok(inum)
    }

    fn set_inode(&mut self, slot: usize, inum: InodeNumber) {
        let start = slot * INODE_NUMBER_SIZE;
        self.0.as_mut()[start..start + INODE_NUMBER_SIZE].copy_from_slice(&inum.to_le_bytes());
    }
}

fn trim_name(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Keeps a name that no longer validates (e.g. it contains a '/') listable.
fn stale_name(bytes: &[u8]) -> DirectoryEntryName {
    let mut converted = [0; MAX_NAME_LEN];
    converted[..bytes.len()].copy_from_slice(bytes);

    DirectoryEntryName(converted)
}
