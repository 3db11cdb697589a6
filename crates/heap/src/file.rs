//! Heap file lifecycle and the shared page cursor.
//!
//! While a heap file is open its header page stays pinned, and at most one
//! data page (the cursor) is pinned alongside it. Scans and inserters wrap
//! a [`HeapFile`] and drive the cursor through the helpers here.

use log::{debug, error};
use storage::{BufferManager, FileHandle, FileStore, FileStoreError, PageNo};

use crate::Rid;
use crate::data_page;
use crate::error::{HeapError, HeapResult};
use crate::header::FileHeader;
use crate::insert::HeapInserter;
use crate::scan::HeapScan;

/// Creates a heap file: a header page plus one empty data page.
pub fn create(store: &FileStore, pool: &BufferManager, name: &str) -> HeapResult<()> {
    // Validate the name before touching the filesystem.
    FileHeader::new(name, 0)?;

    match store.open_file(name) {
        Ok(file) => {
            store.close_file(file)?;
            return Err(HeapError::FileExists(name.to_string()));
        }
        Err(FileStoreError::FileOpen(_)) => return Err(HeapError::FileExists(name.to_string())),
        Err(FileStoreError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }

    debug!("creating heap file {name:?}");
    store.create_file(name)?;
    let file = store.open_file(name)?;

    let header_page_no = {
        let (page_no, _guard) = pool.alloc_page(&file)?;
        page_no
    };

    // From here on the header pin must not leak on failure.
    let data_page_no = match pool.alloc_page(&file) {
        Ok((page_no, mut guard)) => {
            data_page::init(&mut guard);
            page_no
        }
        Err(err) => {
            let _ = pool.unpin_page(&file, header_page_no, false);
            return Err(err.into());
        }
    };

    let header = FileHeader::new(name, data_page_no)?;
    {
        let mut guard = pool.pinned_page(&file, header_page_no)?;
        header.write_to(&mut guard);
    }

    pool.unpin_page(&file, header_page_no, true)?;
    pool.unpin_page(&file, data_page_no, true)?;
    pool.flush_file(&file)?;
    store.close_file(file)?;
    Ok(())
}

/// Removes a heap file from disk. The file must not be open.
pub fn destroy(store: &FileStore, name: &str) -> HeapResult<()> {
    debug!("destroying heap file {name:?}");
    store.destroy_file(name)?;
    Ok(())
}

/// An open heap file.
///
/// Offers random access by RID; sequential access goes through
/// [`HeapScan`] and appends through [`HeapInserter`].
pub struct HeapFile {
    pub(crate) pool: BufferManager,
    pub(crate) file: FileHandle,
    pub(crate) header: FileHeader,
    pub(crate) header_page_no: PageNo,
    pub(crate) hdr_dirty: bool,
    pub(crate) cur_page_no: Option<PageNo>,
    pub(crate) cur_dirty: bool,
    pub(crate) cur_rec: Option<Rid>,
    released: bool,
}

impl HeapFile {
    /// Opens an existing heap file, pinning its header and first data page.
    pub fn open(store: &FileStore, pool: &BufferManager, name: &str) -> HeapResult<Self> {
        debug!("opening heap file {name:?}");
        let file = store.open_file(name)?;
        let header_page_no = file.first_page();

        let header = {
            let guard = pool.read_page(&file, header_page_no)?;
            FileHeader::read_from(&guard)
        };

        let first_page = header.first_page;
        match pool.read_page(&file, first_page) {
            Ok(_guard) => {}
            Err(err) => {
                // Do not leak the header pin on a failed open.
                let _ = pool.unpin_page(&file, header_page_no, false);
                return Err(err.into());
            }
        }

        Ok(Self {
            pool: pool.clone(),
            file,
            header,
            header_page_no,
            hdr_dirty: false,
            cur_page_no: Some(first_page),
            cur_dirty: false,
            cur_rec: None,
            released: false,
        })
    }

    /// Opens `name` for sequential scanning.
    pub fn open_for_scan(
        store: &FileStore,
        pool: &BufferManager,
        name: &str,
    ) -> HeapResult<HeapScan> {
        HeapScan::open(store, pool, name)
    }

    /// Opens `name` for appending records.
    pub fn open_for_insert(
        store: &FileStore,
        pool: &BufferManager,
        name: &str,
    ) -> HeapResult<HeapInserter> {
        HeapInserter::open(store, pool, name)
    }

    /// Number of live records.
    pub fn record_count(&self) -> u32 {
        self.header.rec_cnt
    }

    /// Number of data pages in the chain.
    pub fn page_count(&self) -> u32 {
        self.header.page_cnt
    }

    /// Name recorded in the header page.
    pub fn file_name(&self) -> &str {
        self.header.file_name()
    }

    /// Fetches the record at `rid`, moving the cursor to its page if needed.
    pub fn get_record(&mut self, rid: Rid) -> HeapResult<Vec<u8>> {
        if self.cur_page_no != Some(rid.page_no) {
            self.move_to_page(rid.page_no)?;
        }
        let guard = self.pool.pinned_page(&self.file, rid.page_no)?;
        Ok(data_page::record(&guard, rid)?.to_vec())
    }

    /// Closes the file, releasing both pins and flushing its pages.
    ///
    /// Teardown runs to completion even if individual steps fail; the first
    /// failure is returned.
    pub fn close(mut self) -> HeapResult<()> {
        self.release()
    }

    /// Unpins the current data page, if any, with its accumulated dirty flag.
    pub(crate) fn unpin_current(&mut self) -> HeapResult<()> {
        if let Some(page_no) = self.cur_page_no.take() {
            let dirty = std::mem::replace(&mut self.cur_dirty, false);
            self.pool.unpin_page(&self.file, page_no, dirty)?;
        }
        Ok(())
    }

    /// Moves the cursor: unpin the current page, pin `page_no` clean.
    pub(crate) fn move_to_page(&mut self, page_no: PageNo) -> HeapResult<()> {
        self.unpin_current()?;
        self.pool.read_page(&self.file, page_no)?;
        self.cur_page_no = Some(page_no);
        self.cur_dirty = false;
        Ok(())
    }

    /// Writes the cached header through to its pinned frame.
    pub(crate) fn write_header(&mut self) -> HeapResult<()> {
        let mut guard = self.pool.pinned_page(&self.file, self.header_page_no)?;
        self.header.write_to(&mut guard);
        drop(guard);
        self.hdr_dirty = true;
        Ok(())
    }

    fn release(&mut self) -> HeapResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        debug!("closing heap file {:?}", self.header.file_name());
        let mut first_err: Option<HeapError> = None;

        if let Some(page_no) = self.cur_page_no.take() {
            let dirty = std::mem::replace(&mut self.cur_dirty, false);
            if let Err(err) = self.pool.unpin_page(&self.file, page_no, dirty) {
                error!("unpin of data page {page_no} failed: {err}");
                first_err.get_or_insert(err.into());
            }
        }
        if let Err(err) = self
            .pool
            .unpin_page(&self.file, self.header_page_no, self.hdr_dirty)
        {
            error!("unpin of header page failed: {err}");
            first_err.get_or_insert(err.into());
        }
        if let Err(err) = self.pool.flush_file(&self.file) {
            error!(
                "flush of heap file {:?} failed: {err}",
                self.header.file_name()
            );
            first_err.get_or_insert(err.into());
        }
        if let Err(err) = self.file.sync() {
            error!(
                "sync of heap file {:?} failed: {err}",
                self.header.file_name()
            );
            first_err.get_or_insert(err.into());
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for HeapFile {
    fn drop(&mut self) {
        // Failures are already logged inside release().
        let _ = self.release();
    }
}
