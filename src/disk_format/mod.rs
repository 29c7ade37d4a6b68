/// Perform a const assertion.
macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

/// Blocks, the unit of device I/O.
pub mod block;
/// Directory blocks, entries and entry names.
pub mod directory;
/// Indirect blocks of block pointers.
pub mod indirect;
/// Inode records.
pub mod inode;
/// The volume superblock.
pub mod superblock;
