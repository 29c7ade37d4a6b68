use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{FsError, Result};
use crate::volume::InodeNumber;

use super::block::BLOCK_SIZE;

pub const INODE_SIZE: usize = 128;
const_assert!(size_of::<Inode>() == INODE_SIZE);

const_assert!(BLOCK_SIZE % INODE_SIZE == 0);
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

pub const NUM_DIRECT: usize = 8;

/// size of an on-disk block pointer in bytes
pub const POINTER_SIZE: usize = size_of::<u32>();

const_assert!(BLOCK_SIZE % POINTER_SIZE == 0);
/// The number of pointers held by an indirect block.
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / POINTER_SIZE;

const N: u64 = POINTERS_PER_BLOCK as u64;

/// The number of data blocks addressable through the direct pointers and the three levels of
/// indirection.
pub const MAX_FILE_BLOCKS: u64 = NUM_DIRECT as u64 + N + N * N + N * N * N;

pub const MAX_FILE_SIZE: u64 = MAX_FILE_BLOCKS * BLOCK_SIZE as u64;

/// Inode number zero doesn't refer to any inode.
pub const NULL_INODE: InodeNumber = 0;

pub const ROOT_INODE: InodeNumber = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct Inode {
    /// file size in bytes
    pub size: u64,
    /// file type
    pub type_: InodeType,
    pub padding: [u8; 7],
    /// creation time, seconds since the epoch
    pub create_time: u64,
    /// last modification time, seconds since the epoch
    pub modify_time: u64,
    /// last access time, seconds since the epoch
    pub access_time: u64,
    /// block number of the directory block holding this inode's entry
    pub dir_block: u32,
    /// slot of this inode's entry within `dir_block`
    pub dir_block_off: u32,
    /// block #s for the first NUM_DIRECT blocks
    pub direct_blocks: [u32; NUM_DIRECT],
    /// block number of the single-indirect block
    pub indirect_primary: u32,
    /// block number of the double-indirect block
    pub indirect_secondary: u32,
    /// block number of the triple-indirect block
    pub indirect_tertiary: u32,
    /// number of occupied entries, for directories
    pub entry_count: u32,
    pub reserved: [u32; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum InodeType {
    /// This inode describes a regular data file.
    File = 0,
    /// This inode describes a directory.
    Directory = 1,
}

impl Inode {
    /// A zeroed inode of type `type_`, stamped with the current time.
    pub fn new(type_: InodeType) -> Self {
        let now = timestamp_now();

        Self {
            size: 0,
            type_,
            padding: [0; 7],
            create_time: now,
            modify_time: now,
            access_time: now,
            dir_block: 0,
            dir_block_off: 0,
            direct_blocks: [0; NUM_DIRECT],
            indirect_primary: 0,
            indirect_secondary: 0,
            indirect_tertiary: 0,
            entry_count: 0,
            reserved: [0; 8],
        }
    }

    pub fn is_directory(&self) -> bool {
        self.type_ == InodeType::Directory
    }

    /// The number of data blocks backing the file.
    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(BLOCK_SIZE as u64)
    }

    pub fn touch_modified(&mut self) {
        self.modify_time = timestamp_now();
    }

    pub fn touch_accessed(&mut self) {
        self.access_time = timestamp_now();
    }

    /// Takes the size and block pointers of `other`, leaving every other field alone.
    pub fn copy_block_map(&mut self, other: &Inode) {
        self.size = other.size;
        self.direct_blocks = other.direct_blocks;
        self.indirect_primary = other.indirect_primary;
        self.indirect_secondary = other.indirect_secondary;
        self.indirect_tertiary = other.indirect_tertiary;
    }

    pub fn encode(&self) -> Result<[u8; INODE_SIZE]> {
        let serialized = bincode::serialize(self)?;

        serialized.try_into().map_err(|bytes: Vec<u8>| {
            FsError::Corruption(format!("inode encoded to {} bytes", bytes.len()))
        })
    }

    /// Decodes a record. An unknown type tag is corruption rather than a default type.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(&bytes[..INODE_SIZE])
            .map_err(|err| FsError::Corruption(format!("undecodable inode: {err}")))
    }
}

pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
