use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use thiserror::Error;

use crate::file::{FileHandle, FileId, FileStoreError, PageNo};
use crate::frame::{Frame, PageKey};
use crate::replacer::{FrameId, LruReplacer, Replacer};

/// Errors returned by the buffer manager.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The pool lock was poisoned.
    #[error("buffer pool lock poisoned")]
    LockPoisoned,
    /// Every frame is pinned; nothing can be evicted.
    #[error("all buffer frames are pinned")]
    PoolExhausted,
    /// The page is not resident with a positive pin count.
    #[error("page {page_no} of file {file} is not pinned")]
    PageNotPinned { file: FileId, page_no: PageNo },
    /// The operation requires the page to be unpinned first.
    #[error("page {page_no} of file {file} is still pinned")]
    PagePinned { file: FileId, page_no: PageNo },
    /// The underlying file store failed.
    #[error(transparent)]
    Store(#[from] FileStoreError),
}

/// Convenience alias for buffer manager results.
pub type BufferResult<T> = Result<T, BufferError>;

struct PoolState {
    frames: Vec<Frame>,
    page_table: HashMap<PageKey, FrameId>,
    free_list: Vec<FrameId>,
    replacer: LruReplacer,
}

/// Short-lived view of a pinned frame; holds the pool lock while alive.
///
/// Dropping the guard releases only the lock. The pin, and with it the
/// frame's residency, persists until [`BufferManager::unpin_page`].
pub struct FrameGuard<'a> {
    state: MutexGuard<'a, PoolState>,
    frame_id: FrameId,
}

impl FrameGuard<'_> {
    /// Returns the frame id backing this guard.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for FrameGuard<'_> {
    type Target = Frame;

    fn deref(&self) -> &Self::Target {
        &self.state.frames[self.frame_id]
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state.frames[self.frame_id]
    }
}

/// Buffer manager caching pages of open files in a fixed frame pool.
///
/// Pages are addressed by `(file, page_no)`. A page stays resident while
/// pinned; unpinned frames are evicted least-recently-unpinned first, with
/// dirty contents written back to their file.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<Mutex<PoolState>>,
}

impl BufferManager {
    /// Creates a buffer manager with a fixed number of frames.
    pub fn new(pool_size: usize) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size).rev().collect();
        let state = PoolState {
            frames,
            page_table: HashMap::new(),
            free_list,
            replacer: LruReplacer::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock_state(&self) -> BufferResult<MutexGuard<'_, PoolState>> {
        self.inner.lock().map_err(|_| BufferError::LockPoisoned)
    }

    /// Writes back a frame if dirty and detaches it from its page.
    fn evict(state: &mut PoolState, frame_id: FrameId) -> BufferResult<()> {
        let frame = &mut state.frames[frame_id];
        if frame.is_dirty {
            if let Some((file, page_no)) = frame.home().cloned() {
                debug!("evicting dirty page {} of file {}", page_no, file.id());
                file.write_page(page_no, frame.data())?;
            }
            frame.is_dirty = false;
        }
        if let Some(key) = frame.key() {
            state.page_table.remove(&key);
        }
        frame.reset();
        Ok(())
    }

    /// Claims a free frame, evicting an unpinned one if necessary.
    fn take_frame(state: &mut PoolState) -> BufferResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop() {
            return Ok(frame_id);
        }
        let Some(frame_id) = state.replacer.victim() else {
            return Err(BufferError::PoolExhausted);
        };
        if let Err(err) = Self::evict(state, frame_id) {
            state.replacer.insert(frame_id);
            return Err(err);
        }
        Ok(frame_id)
    }

    /// Allocates a fresh page in `file` and pins it zero-filled.
    pub fn alloc_page(&self, file: &FileHandle) -> BufferResult<(PageNo, FrameGuard<'_>)> {
        let mut state = self.lock_state()?;
        let frame_id = Self::take_frame(&mut state)?;
        let page_no = match file.allocate_page() {
            Ok(page_no) => page_no,
            Err(err) => {
                state.free_list.push(frame_id);
                return Err(err.into());
            }
        };
        let frame = &mut state.frames[frame_id];
        frame.set_home(file.clone(), page_no);
        frame.pin_count = 1;
        state.page_table.insert(
            PageKey {
                file: file.id(),
                page_no,
            },
            frame_id,
        );
        Ok((page_no, FrameGuard { state, frame_id }))
    }

    /// Pins an existing page, reading it from the file on a pool miss.
    pub fn read_page(&self, file: &FileHandle, page_no: PageNo) -> BufferResult<FrameGuard<'_>> {
        let key = PageKey {
            file: file.id(),
            page_no,
        };
        let mut state = self.lock_state()?;
        if let Some(&frame_id) = state.page_table.get(&key) {
            let frame = &mut state.frames[frame_id];
            frame.pin_count += 1;
            state.replacer.remove(frame_id);
            return Ok(FrameGuard { state, frame_id });
        }

        let frame_id = Self::take_frame(&mut state)?;
        let frame = &mut state.frames[frame_id];
        if let Err(err) = file.read_page(page_no, frame.data_mut()) {
            frame.reset();
            state.free_list.push(frame_id);
            return Err(err.into());
        }
        frame.set_home(file.clone(), page_no);
        frame.pin_count = 1;
        state.page_table.insert(key, frame_id);
        Ok(FrameGuard { state, frame_id })
    }

    /// Re-acquires a view of a page that is already pinned.
    ///
    /// Unlike [`read_page`](Self::read_page) this takes no new pin; it is the
    /// access path between a pin and its matching unpin.
    pub fn pinned_page(&self, file: &FileHandle, page_no: PageNo) -> BufferResult<FrameGuard<'_>> {
        let key = PageKey {
            file: file.id(),
            page_no,
        };
        let state = self.lock_state()?;
        let frame_id = match state.page_table.get(&key) {
            Some(&frame_id) if state.frames[frame_id].pin_count > 0 => frame_id,
            _ => {
                return Err(BufferError::PageNotPinned {
                    file: file.id(),
                    page_no,
                });
            }
        };
        Ok(FrameGuard { state, frame_id })
    }

    /// Drops one pin from a page; `dirty` records whether it was mutated.
    pub fn unpin_page(&self, file: &FileHandle, page_no: PageNo, dirty: bool) -> BufferResult<()> {
        let key = PageKey {
            file: file.id(),
            page_no,
        };
        let mut state = self.lock_state()?;
        let not_pinned = BufferError::PageNotPinned {
            file: file.id(),
            page_no,
        };
        let Some(&frame_id) = state.page_table.get(&key) else {
            return Err(not_pinned);
        };
        let frame = &mut state.frames[frame_id];
        if frame.pin_count == 0 {
            return Err(not_pinned);
        }
        if dirty {
            frame.is_dirty = true;
        }
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            state.replacer.insert(frame_id);
        }
        Ok(())
    }

    /// Writes back every dirty page of `file` and drops its frames.
    ///
    /// Fails with [`BufferError::PagePinned`] if any page of the file is
    /// still pinned; nothing is written in that case.
    pub fn flush_file(&self, file: &FileHandle) -> BufferResult<()> {
        let mut state = self.lock_state()?;
        let resident: Vec<FrameId> = state
            .page_table
            .iter()
            .filter(|(key, _)| key.file == file.id())
            .map(|(_, &frame_id)| frame_id)
            .collect();

        for &frame_id in &resident {
            let frame = &state.frames[frame_id];
            if frame.pin_count > 0 {
                return Err(BufferError::PagePinned {
                    file: file.id(),
                    page_no: frame.page_no().unwrap_or_default(),
                });
            }
        }

        debug!(
            "flushing {} resident pages of file {}",
            resident.len(),
            file.id()
        );
        for frame_id in resident {
            Self::evict(&mut state, frame_id)?;
            state.replacer.remove(frame_id);
            state.free_list.push(frame_id);
        }
        Ok(())
    }

    /// Number of frames currently pinned, across all files.
    pub fn pinned_frames(&self) -> usize {
        match self.lock_state() {
            Ok(state) => state
                .frames
                .iter()
                .filter(|frame| frame.pin_count > 0)
                .count(),
            Err(_) => 0,
        }
    }

    /// Total number of frames in the pool.
    pub fn pool_size(&self) -> usize {
        match self.lock_state() {
            Ok(state) => state.frames.len(),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileStore, PAGE_SIZE};
    use std::path::PathBuf;

    struct TestContext {
        root: PathBuf,
    }

    impl TestContext {
        fn new(test_name: &str) -> Self {
            let root = std::env::temp_dir().join(format!("bufmgr_test_{}", test_name));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(&root).expect("create test root");
            Self { root }
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn setup(test_name: &str, pool_size: usize) -> (TestContext, FileStore, BufferManager) {
        let ctx = TestContext::new(test_name);
        let store = FileStore::new(&ctx.root);
        store.create_file("data").unwrap();
        (ctx, store, BufferManager::new(pool_size))
    }

    #[test]
    fn test_alloc_page_pins_zeroed_frame() {
        let (_ctx, store, pool) = setup("alloc", 4);
        let file = store.open_file("data").unwrap();

        let (page_no, guard) = pool.alloc_page(&file).unwrap();
        assert_eq!(page_no, 0);
        assert_eq!(guard.pin_count(), 1);
        assert_eq!(guard.data()[0], 0);
        drop(guard);

        assert_eq!(pool.pinned_frames(), 1);
        pool.unpin_page(&file, page_no, false).unwrap();
        assert_eq!(pool.pinned_frames(), 0);
    }

    #[test]
    fn test_dirty_page_survives_flush() {
        let (_ctx, store, pool) = setup("flush", 4);
        let file = store.open_file("data").unwrap();

        let (page_no, mut guard) = pool.alloc_page(&file).unwrap();
        assert!(guard.write_bytes(100, b"persist me"));
        drop(guard);
        pool.unpin_page(&file, page_no, true).unwrap();
        pool.flush_file(&file).unwrap();

        // The flush dropped the frame, so this read comes from disk.
        let guard = pool.read_page(&file, page_no).unwrap();
        assert_eq!(guard.read_bytes(100, 10).unwrap(), b"persist me");
        drop(guard);
        pool.unpin_page(&file, page_no, false).unwrap();
    }

    #[test]
    fn test_pin_counting_and_pinned_page() {
        let (_ctx, store, pool) = setup("pins", 4);
        let file = store.open_file("data").unwrap();

        let (page_no, guard) = pool.alloc_page(&file).unwrap();
        drop(guard);
        drop(pool.read_page(&file, page_no).unwrap());

        // Two pins outstanding; the access path works after one unpin.
        pool.unpin_page(&file, page_no, false).unwrap();
        assert!(pool.pinned_page(&file, page_no).is_ok());

        pool.unpin_page(&file, page_no, false).unwrap();
        assert!(matches!(
            pool.pinned_page(&file, page_no),
            Err(BufferError::PageNotPinned { .. })
        ));
        assert!(matches!(
            pool.unpin_page(&file, page_no, false),
            Err(BufferError::PageNotPinned { .. })
        ));
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let (_ctx, store, pool) = setup("evict", 2);
        let file = store.open_file("data").unwrap();

        let mut pages = Vec::new();
        for fill in 0u8..5 {
            let (page_no, mut guard) = pool.alloc_page(&file).unwrap();
            guard.data_mut().fill(fill);
            drop(guard);
            pool.unpin_page(&file, page_no, true).unwrap();
            pages.push(page_no);
        }

        // Only two frames exist, so reading the early pages goes to disk.
        for (fill, page_no) in pages.iter().enumerate() {
            let guard = pool.read_page(&file, *page_no).unwrap();
            assert_eq!(guard.data()[PAGE_SIZE - 1], fill as u8);
            drop(guard);
            pool.unpin_page(&file, *page_no, false).unwrap();
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let (_ctx, store, pool) = setup("exhausted", 1);
        let file = store.open_file("data").unwrap();

        let (first, guard) = pool.alloc_page(&file).unwrap();
        drop(guard);
        assert!(matches!(
            pool.alloc_page(&file),
            Err(BufferError::PoolExhausted)
        ));

        pool.unpin_page(&file, first, false).unwrap();
        let (_, guard) = pool.alloc_page(&file).unwrap();
        drop(guard);
    }

    #[test]
    fn test_flush_refuses_pinned_pages() {
        let (_ctx, store, pool) = setup("flush_pinned", 4);
        let file = store.open_file("data").unwrap();

        let (page_no, guard) = pool.alloc_page(&file).unwrap();
        drop(guard);
        assert!(matches!(
            pool.flush_file(&file),
            Err(BufferError::PagePinned { .. })
        ));

        pool.unpin_page(&file, page_no, true).unwrap();
        pool.flush_file(&file).unwrap();
    }
}
