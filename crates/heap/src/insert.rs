//! Append-only record insertion at the tail of the page chain.

use storage::{BufferError, BufferManager, FileStore};

use crate::Rid;
use crate::data_page::{self, MAX_RECORD_SIZE};
use crate::error::{HeapError, HeapResult};
use crate::file::HeapFile;

/// Inserter for a heap file; keeps the tail page pinned between inserts.
pub struct HeapInserter {
    file: HeapFile,
}

impl HeapInserter {
    /// Opens `name` for appending, with the cursor on the tail page.
    pub fn open(store: &FileStore, pool: &BufferManager, name: &str) -> HeapResult<Self> {
        let mut file = HeapFile::open(store, pool, name)?;
        if file.cur_page_no != Some(file.header.last_page) {
            file.move_to_page(file.header.last_page)?;
        }
        Ok(Self { file })
    }

    /// The underlying heap file.
    pub fn file(&self) -> &HeapFile {
        &self.file
    }

    /// Number of live records in the file.
    pub fn record_count(&self) -> u32 {
        self.file.record_count()
    }

    /// Appends a record, extending the chain when the tail page is full.
    ///
    /// Returns the RID of the stored record.
    pub fn insert_record(&mut self, record: &[u8]) -> HeapResult<Rid> {
        if record.is_empty() || record.len() > MAX_RECORD_SIZE {
            return Err(HeapError::InvalidRecordLength {
                len: record.len(),
                max: MAX_RECORD_SIZE,
            });
        }
        self.ensure_tail()?;
        let tail = self.file.header.last_page;

        let inserted = {
            let mut guard = self.file.pool.pinned_page(&self.file.file, tail)?;
            data_page::insert_record(&mut guard, record)
        };

        let rid = match inserted {
            Some(slot_no) => Rid {
                page_no: tail,
                slot_no,
            },
            None => self.extend_chain(record)?,
        };

        self.file.cur_dirty = true;
        self.file.header.rec_cnt += 1;
        self.file.write_header()?;
        self.file.cur_rec = Some(rid);
        Ok(rid)
    }

    /// Ends inserting and closes the file.
    pub fn close(self) -> HeapResult<()> {
        self.file.close()
    }

    /// Moves the cursor back onto the tail after an error or a random read.
    ///
    /// A stale cursor may have lost its pin already; that unpin failure is
    /// tolerated.
    fn ensure_tail(&mut self) -> HeapResult<()> {
        let tail = self.file.header.last_page;
        if self.file.cur_page_no == Some(tail) {
            return Ok(());
        }
        if let Some(page_no) = self.file.cur_page_no.take() {
            let dirty = std::mem::replace(&mut self.file.cur_dirty, false);
            match self.file.pool.unpin_page(&self.file.file, page_no, dirty) {
                Ok(()) | Err(BufferError::PageNotPinned { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.file.pool.read_page(&self.file.file, tail)?;
        self.file.cur_page_no = Some(tail);
        self.file.cur_dirty = false;
        Ok(())
    }

    /// Allocates a new tail page, links it in, and inserts `record` there.
    fn extend_chain(&mut self, record: &[u8]) -> HeapResult<Rid> {
        let old_tail = self.file.header.last_page;
        let new_tail = {
            let (page_no, mut guard) = self.file.pool.alloc_page(&self.file.file)?;
            data_page::init(&mut guard);
            page_no
        };

        // The link must reach the old tail before that page is unpinned,
        // so every non-tail page on disk has a valid successor.
        {
            let mut guard = self.file.pool.pinned_page(&self.file.file, old_tail)?;
            data_page::set_next_page(&mut guard, Some(new_tail));
        }
        self.file.cur_dirty = true;
        self.file.unpin_current()?;
        self.file.cur_page_no = Some(new_tail);
        self.file.cur_dirty = false;

        let slot_no = {
            let mut guard = self.file.pool.pinned_page(&self.file.file, new_tail)?;
            data_page::insert_record(&mut guard, record)
                .expect("fresh page holds any record within the size limit")
        };

        self.file.header.page_cnt += 1;
        self.file.header.last_page = new_tail;
        self.file.write_header()?;
        Ok(Rid {
            page_no: new_tail,
            slot_no,
        })
    }
}
