//! Errors surfaced by the filesystem engine.

use std::fmt;

use thiserror::Error;

use crate::volume::InodeNumber;

/// The kind of unit a bitmap tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    Inodes,
    Blocks,
    BadBlocks,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inodes => write!(f, "inodes"),
            Resource::Blocks => write!(f, "blocks"),
            Resource::BadBlocks => write!(f, "bad blocks"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FsError {
    /// The underlying device failed a read or write.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left: out of {0}")]
    OutOfSpace(Resource),

    /// An inode number, block number or slot outside its valid range.
    #[error("invalid {what} index {index} (limit {limit})")]
    InvalidIndex {
        what: &'static str,
        index: u64,
        limit: u64,
    },

    /// On-disk state that cannot be interpreted. Fatal for the affected volume or inode.
    #[error("filesystem corrupted: {0}")]
    Corruption(String),

    #[error("invalid volume geometry: {0}")]
    InvalidGeometry(String),

    #[error("directory block has no free slot")]
    DirectoryFull,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("logical block {index} exceeds the maximum file size")]
    FileTooLarge { index: u64 },

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("inode {0} is not a directory")]
    NotADirectory(InodeNumber),

    #[error("inode {0} is a directory")]
    IsADirectory(InodeNumber),

    #[error("directory {0} is not empty")]
    DirectoryNotEmpty(InodeNumber),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("cannot move directory {0} into its own subtree")]
    MoveIntoSubtree(InodeNumber),
}

impl From<bincode::Error> for FsError {
    fn from(err: bincode::Error) -> Self {
        FsError::Corruption(format!("undecodable record: {err}"))
    }
}

pub type Result<T, E = FsError> = std::result::Result<T, E>;
