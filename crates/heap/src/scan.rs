//! Sequential scans with an optional single-attribute predicate.

use storage::{BufferManager, FileStore, PageNo};

use crate::Rid;
use crate::data_page;
use crate::error::{HeapError, HeapResult};
use crate::file::HeapFile;
use crate::predicate::{AttrType, CompOp, Predicate};

/// Scan over a heap file, yielding RIDs in chain-then-slot order.
///
/// The scan owns the file's page cursor: the page holding the current
/// record stays pinned between calls, and moving to the next page swaps
/// the pin.
pub struct HeapScan {
    file: HeapFile,
    predicate: Option<Predicate>,
    marked_page_no: Option<PageNo>,
    marked_rec: Option<Rid>,
}

impl HeapScan {
    /// Opens `name` for scanning, positioned before the first record.
    pub fn open(store: &FileStore, pool: &BufferManager, name: &str) -> HeapResult<Self> {
        Ok(Self {
            file: HeapFile::open(store, pool, name)?,
            predicate: None,
            marked_page_no: None,
            marked_rec: None,
        })
    }

    /// The underlying heap file.
    pub fn file(&self) -> &HeapFile {
        &self.file
    }

    /// Number of live records in the file.
    pub fn record_count(&self) -> u32 {
        self.file.record_count()
    }

    /// Installs or clears the scan predicate.
    ///
    /// `filter = None` makes the scan unfiltered. The position is not
    /// rewound; the predicate applies from the next [`scan_next`] on.
    ///
    /// [`scan_next`]: Self::scan_next
    pub fn start_scan(
        &mut self,
        offset: usize,
        length: usize,
        ty: AttrType,
        filter: Option<&[u8]>,
        op: CompOp,
    ) -> HeapResult<()> {
        self.predicate = match filter {
            None => None,
            Some(filter) => Some(Predicate::new(offset, length, ty, filter, op)?),
        };
        Ok(())
    }

    /// Releases the scan's data page pin. Idempotent.
    pub fn end_scan(&mut self) -> HeapResult<()> {
        self.file.unpin_current()
    }

    /// Snapshots the scan position for a later [`reset_scan`].
    ///
    /// [`reset_scan`]: Self::reset_scan
    pub fn mark_scan(&mut self) {
        self.marked_page_no = self.file.cur_page_no;
        self.marked_rec = self.file.cur_rec;
    }

    /// Returns the scan to the last mark.
    ///
    /// Rewinding within the current page is free; rewinding to another page
    /// swaps the pin onto the marked page.
    pub fn reset_scan(&mut self) -> HeapResult<()> {
        if self.marked_page_no != self.file.cur_page_no {
            match self.marked_page_no {
                Some(page_no) => self.file.move_to_page(page_no)?,
                None => self.file.unpin_current()?,
            }
        }
        self.file.cur_rec = self.marked_rec;
        Ok(())
    }

    /// Advances to the next record accepted by the predicate.
    ///
    /// `Ok(None)` is end of file; once reached, further calls keep
    /// returning it. Every candidate inspected becomes the current record,
    /// so a rejected candidate is never revisited by the next call.
    pub fn scan_next(&mut self) -> HeapResult<Option<Rid>> {
        loop {
            let Some(page_no) = self.file.cur_page_no else {
                return Ok(None);
            };

            let candidate = {
                let guard = self.file.pool.pinned_page(&self.file.file, page_no)?;
                // A current record from another page (after a page switch)
                // does not anchor slot iteration here.
                match self.file.cur_rec.filter(|rec| rec.page_no == page_no) {
                    Some(rec) => data_page::next_slot(&guard, rec.slot_no),
                    None => data_page::first_slot(&guard),
                }
            };

            let Some(slot_no) = candidate else {
                // Page exhausted: stop at the tail, otherwise follow the chain.
                if page_no == self.file.header.last_page {
                    return Ok(None);
                }
                let next = {
                    let guard = self.file.pool.pinned_page(&self.file.file, page_no)?;
                    data_page::next_page(&guard)
                };
                let next = next.ok_or(HeapError::BrokenChain(page_no))?;
                self.file.move_to_page(next)?;
                continue;
            };

            let rid = Rid { page_no, slot_no };
            let accepted = {
                let guard = self.file.pool.pinned_page(&self.file.file, page_no)?;
                let record = data_page::record(&guard, rid)?;
                match &self.predicate {
                    Some(predicate) => predicate.matches(record),
                    None => true,
                }
            };
            self.file.cur_rec = Some(rid);
            if accepted {
                return Ok(Some(rid));
            }
        }
    }

    /// Bytes of the record the scan is positioned on.
    pub fn get_current(&self) -> HeapResult<Vec<u8>> {
        let rid = self.file.cur_rec.ok_or(HeapError::NoCurrentRecord)?;
        let guard = self.file.pool.pinned_page(&self.file.file, rid.page_no)?;
        Ok(data_page::record(&guard, rid)?.to_vec())
    }

    /// Deletes the record the scan is positioned on.
    ///
    /// The position keeps the deleted RID, so the next [`scan_next`]
    /// advances past the gap without skipping a neighbor. The freed bytes
    /// are not reclaimed.
    ///
    /// [`scan_next`]: Self::scan_next
    pub fn delete_current(&mut self) -> HeapResult<()> {
        let rid = self.file.cur_rec.ok_or(HeapError::NoCurrentRecord)?;
        {
            let mut guard = self.file.pool.pinned_page(&self.file.file, rid.page_no)?;
            data_page::delete_record(&mut guard, rid)?;
        }
        self.file.cur_dirty = true;
        self.file.header.rec_cnt -= 1;
        self.file.write_header()?;
        Ok(())
    }

    /// Flags the current page as mutated, for callers writing in place.
    pub fn mark_dirty(&mut self) {
        self.file.cur_dirty = true;
    }

    /// Ends the scan and closes the file.
    pub fn close(self) -> HeapResult<()> {
        self.file.close()
    }
}
