/// The block storage abstraction.
mod block_storage;
/// Cached, individually locked block buffers.
mod cache;
/// File-backed storage.
mod file;
/// Memory-backed storage.
mod memory;

pub use block_storage::*;
pub use cache::*;
pub use file::*;
pub use memory::*;
