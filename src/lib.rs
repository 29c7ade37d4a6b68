pub mod bitmap;
pub mod disk_format;
pub mod error;
pub mod format;
pub mod inode_store;
pub mod layout;
pub mod resolver;
pub mod storage;
pub mod volume;

pub use error::{FsError, Result};
pub use format::{format, FormatOptions};
pub use volume::{InodeNumber, Volume, VolumeStats};
