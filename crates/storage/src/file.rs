//! File store: named page files plus the registry of currently open files.
//!
//! Invariants:
//! - A file is a dense sequence of PAGE_SIZE pages; page 0 sits at offset 0
//! - Pages are allocated monotonically from the file length, zero-filled
//! - A name appears at most once in the registry; destroy refuses open files
//! - A `FileHandle` unregisters its name when the last clone is dropped

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

/// Index of a page within its file.
pub type PageNo = u32;

/// Registry-assigned identity of one open file.
pub type FileId = u64;

/// Size of every page, on disk and in buffer frames.
pub const PAGE_SIZE: usize = 4096;

/// Errors returned by the file store.
#[derive(Debug, Error)]
pub enum FileStoreError {
    /// Create was called for a name that already exists on disk.
    #[error("file {0:?} already exists")]
    AlreadyExists(String),
    /// The named file does not exist on disk.
    #[error("file {0:?} does not exist")]
    NotFound(String),
    /// The named file is currently open.
    #[error("file {0:?} is open")]
    FileOpen(String),
    /// A page access landed beyond the allocated range of the file.
    #[error("page {page_no} is out of bounds for file {name:?} ({pages} pages)")]
    PageOutOfBounds {
        name: String,
        page_no: PageNo,
        pages: PageNo,
    },
    /// The underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for file store results.
pub type FileStoreResult<T> = Result<T, FileStoreError>;

#[derive(Default)]
struct Registry {
    open: HashMap<String, FileId>,
    next_id: FileId,
}

/// Store of page files under one root directory.
///
/// Heap files, and any other paged structures layered on top, address their
/// backing file through the handles this store hands out.
pub struct FileStore {
    root: PathBuf,
    registry: Arc<Mutex<Registry>>,
}

struct FileInner {
    id: FileId,
    name: String,
    file: File,
    registry: Weak<Mutex<Registry>>,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                if registry.open.get(&self.name) == Some(&self.id) {
                    registry.open.remove(&self.name);
                }
            }
        }
    }
}

/// Cheaply cloneable handle to one open file.
///
/// The handle's [`FileId`] keys buffer frames; all clones share it. The file
/// counts as open until every clone is gone.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<FileInner>,
}

impl FileStore {
    /// Creates a store rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        // A poisoned registry only happens if a panic unwound mid-update;
        // the map itself stays structurally valid.
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Creates an empty file; the name must not exist yet.
    pub fn create_file(&self, name: &str) -> FileStoreResult<()> {
        let result = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_of(name));
        match result {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(FileStoreError::AlreadyExists(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Removes the file from disk. The file must not be open.
    pub fn destroy_file(&self, name: &str) -> FileStoreResult<()> {
        if self.registry().open.contains_key(name) {
            return Err(FileStoreError::FileOpen(name.to_string()));
        }
        match std::fs::remove_file(self.path_of(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Opens an existing file and registers it as open.
    pub fn open_file(&self, name: &str) -> FileStoreResult<FileHandle> {
        let mut registry = self.registry();
        if registry.open.contains_key(name) {
            return Err(FileStoreError::FileOpen(name.to_string()));
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path_of(name))
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FileStoreError::NotFound(name.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let id = registry.next_id;
        registry.next_id += 1;
        registry.open.insert(name.to_string(), id);
        Ok(FileHandle {
            inner: Arc::new(FileInner {
                id,
                name: name.to_string(),
                file,
                registry: Arc::downgrade(&self.registry),
            }),
        })
    }

    /// Closes a handle, syncing file contents first.
    ///
    /// The name stays registered as open until every clone of the handle
    /// (including ones held by buffer frames) has been dropped.
    pub fn close_file(&self, file: FileHandle) -> FileStoreResult<()> {
        file.sync()?;
        drop(file);
        Ok(())
    }
}

impl FileHandle {
    /// Identity of this open file; keys buffer frames.
    pub fn id(&self) -> FileId {
        self.inner.id
    }

    /// Name the file was opened under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of the page at offset 0. For a heap file this is the header.
    pub fn first_page(&self) -> PageNo {
        0
    }

    /// Number of allocated pages.
    pub fn num_pages(&self) -> FileStoreResult<PageNo> {
        let len = self.inner.file.metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as PageNo)
    }

    fn check_bounds(&self, page_no: PageNo) -> FileStoreResult<()> {
        let pages = self.num_pages()?;
        if page_no >= pages {
            return Err(FileStoreError::PageOutOfBounds {
                name: self.inner.name.clone(),
                page_no,
                pages,
            });
        }
        Ok(())
    }

    /// Reads the page at `page_no` into `buf`.
    pub fn read_page(&self, page_no: PageNo, buf: &mut [u8; PAGE_SIZE]) -> FileStoreResult<()> {
        self.check_bounds(page_no)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.inner.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Writes `buf` over the page at `page_no`.
    pub fn write_page(&self, page_no: PageNo, buf: &[u8; PAGE_SIZE]) -> FileStoreResult<()> {
        self.check_bounds(page_no)?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.inner.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Extends the file by one zero-filled page and returns its number.
    pub fn allocate_page(&self) -> FileStoreResult<PageNo> {
        let page_no = self.num_pages()?;
        let offset = page_no as u64 * PAGE_SIZE as u64;
        let zero = [0u8; PAGE_SIZE];
        self.inner.file.write_all_at(&zero, offset)?;
        Ok(page_no)
    }

    /// Forces buffered file data to disk.
    pub fn sync(&self) -> FileStoreResult<()> {
        self.inner.file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    // RAII root directory for one test; removed on exit, pass or fail.
    struct TestContext {
        root: PathBuf,
    }

    impl TestContext {
        fn new(test_name: &str) -> Self {
            let root = std::env::temp_dir().join(format!("filestore_test_{}", test_name));
            let _ = std::fs::remove_dir_all(&root);
            std::fs::create_dir_all(&root).expect("create test root");
            Self { root }
        }

        fn store(&self) -> FileStore {
            FileStore::new(&self.root)
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn test_create_open_destroy() {
        let ctx = TestContext::new("create_open_destroy");
        let store = ctx.store();

        store.create_file("a").unwrap();
        assert!(matches!(
            store.create_file("a"),
            Err(FileStoreError::AlreadyExists(_))
        ));

        let file = store.open_file("a").unwrap();
        assert_eq!(file.name(), "a");
        assert_eq!(file.num_pages().unwrap(), 0);

        // Open files cannot be destroyed or re-opened.
        assert!(matches!(
            store.destroy_file("a"),
            Err(FileStoreError::FileOpen(_))
        ));
        assert!(matches!(
            store.open_file("a"),
            Err(FileStoreError::FileOpen(_))
        ));

        store.close_file(file).unwrap();
        store.destroy_file("a").unwrap();
        assert!(matches!(
            store.open_file("a"),
            Err(FileStoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_clone_keeps_file_open() {
        let ctx = TestContext::new("clone_keeps_open");
        let store = ctx.store();

        store.create_file("a").unwrap();
        let file = store.open_file("a").unwrap();
        let clone = file.clone();
        store.close_file(file).unwrap();

        // The clone still holds the registration.
        assert!(matches!(
            store.destroy_file("a"),
            Err(FileStoreError::FileOpen(_))
        ));
        drop(clone);
        store.destroy_file("a").unwrap();
    }

    #[test]
    fn test_allocation_is_monotonic_and_persistent() {
        let ctx = TestContext::new("alloc_monotonic");
        let store = ctx.store();

        store.create_file("a").unwrap();
        {
            let file = store.open_file("a").unwrap();
            for expected in 0..5 {
                assert_eq!(file.allocate_page().unwrap(), expected);
            }
            store.close_file(file).unwrap();
        }

        let file = store.open_file("a").unwrap();
        assert_eq!(file.num_pages().unwrap(), 5);
        assert_eq!(file.allocate_page().unwrap(), 5);
    }

    #[test]
    fn test_page_io_round_trip() {
        let ctx = TestContext::new("page_io");
        let store = ctx.store();

        store.create_file("a").unwrap();
        let file = store.open_file("a").unwrap();
        let p0 = file.allocate_page().unwrap();
        let p1 = file.allocate_page().unwrap();

        let mut buf = [0xABu8; PAGE_SIZE];
        file.write_page(p1, &buf).unwrap();
        buf.fill(0xCD);
        file.write_page(p0, &buf).unwrap();

        let mut back = [0u8; PAGE_SIZE];
        file.read_page(p1, &mut back).unwrap();
        assert_eq!(back, [0xABu8; PAGE_SIZE]);
        file.read_page(p0, &mut back).unwrap();
        assert_eq!(back, [0xCDu8; PAGE_SIZE]);

        // Fresh pages come back zeroed.
        let p2 = file.allocate_page().unwrap();
        file.read_page(p2, &mut back).unwrap();
        assert_eq!(back, [0u8; PAGE_SIZE]);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let ctx = TestContext::new("bounds");
        let store = ctx.store();

        store.create_file("a").unwrap();
        let file = store.open_file("a").unwrap();
        file.allocate_page().unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        assert!(matches!(
            file.read_page(1, &mut buf),
            Err(FileStoreError::PageOutOfBounds { page_no: 1, .. })
        ));
        assert!(matches!(
            file.write_page(7, &buf),
            Err(FileStoreError::PageOutOfBounds { page_no: 7, .. })
        ));
    }
}
