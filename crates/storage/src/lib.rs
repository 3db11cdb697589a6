// MODULE DECLARATIONS
// These files exist internally but we decide what to expose below.
mod buffer;
mod file;
mod frame;
mod replacer;

// PUBLIC API EXPORTS
// Layers above this crate (the heap file layer in particular) use these.
pub use buffer::{BufferError, BufferManager, BufferResult, FrameGuard};
pub use file::{FileHandle, FileId, FileStore, FileStoreError, FileStoreResult, PAGE_SIZE, PageNo};
pub use frame::{Frame, PageKey};
pub use replacer::{FrameId, LruReplacer, Replacer};
