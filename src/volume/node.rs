use crate::disk_format::inode::Inode;
use crate::error::{FsError, Result};
use crate::storage::BlockStorage;

use super::{BlockNumber, InodeNumber, Volume};

/// An inode loaded from a volume, tagged by type.
pub enum Node<'v, S: BlockStorage> {
    File(OpenInode<'v, S>),
    Directory(OpenInode<'v, S>),
}

/// A snapshot of an inode record, with access to the blocks it owns.
pub struct OpenInode<'v, S: BlockStorage> {
    volume: &'v Volume<S>,
    inum: InodeNumber,
    inode: Inode,
}

impl<'v, S: BlockStorage> Node<'v, S> {
    pub(super) fn new(volume: &'v Volume<S>, inum: InodeNumber, inode: Inode) -> Self {
        let open = OpenInode {
            volume,
            inum,
            inode,
        };

        if inode.is_directory() {
            Node::Directory(open)
        } else {
            Node::File(open)
        }
    }

    pub fn inum(&self) -> InodeNumber {
        self.open_inode().inum
    }

    pub fn inode(&self) -> &Inode {
        &self.open_inode().inode
    }

    /// The device block holding logical block `logical`.
    pub fn resolve_block(&self, logical: u64) -> Result<BlockNumber> {
        self.open_inode().resolve_block(logical)
    }

    /// Grows the inode so that logical block `target` exists.
    pub fn grow(&mut self, target: u64) -> Result<u64> {
        match self {
            Node::File(open) | Node::Directory(open) => open.grow(target),
        }
    }

    pub fn as_directory(&self) -> Result<&OpenInode<'v, S>> {
        match self {
            Node::Directory(open) => Ok(open),
            Node::File(open) => Err(FsError::NotADirectory(open.inum)),
        }
    }

    pub fn into_directory(self) -> Result<OpenInode<'v, S>> {
        match self {
            Node::Directory(open) => Ok(open),
            Node::File(open) => Err(FsError::NotADirectory(open.inum)),
        }
    }

    pub fn into_file(self) -> Result<OpenInode<'v, S>> {
        match self {
            Node::File(open) => Ok(open),
            Node::Directory(open) => Err(FsError::IsADirectory(open.inum)),
        }
    }

    fn open_inode(&self) -> &OpenInode<'v, S> {
        match self {
            Node::File(open) | Node::Directory(open) => open,
        }
    }
}

impl<S: BlockStorage> OpenInode<'_, S> {
    pub fn inum(&self) -> InodeNumber {
        self.inum
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }

    pub fn into_inode(self) -> Inode {
        self.inode
    }

    pub fn resolve_block(&self, logical: u64) -> Result<BlockNumber> {
        self.volume.resolver().resolve(&self.inode, logical)
    }

    /// Allocates blocks up to and including logical block `target` and writes the record back,
    /// also when growth stops partway.
    pub fn grow(&mut self, target: u64) -> Result<u64> {
        let grown = self.volume.resolver().grow(&mut self.inode, target);
        self.volume.write_inode(self.inum, &self.inode)?;

        grown
    }
}
