//! Paged log output stream.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use keel_common::types::PageId;

use super::page::PageHeader;
use crate::error::TxnLogResult;
use crate::record::LogPosition;

/// Append-only paged byte stream over a file.
///
/// Bytes accumulate in the current page's buffer; a full page is written out
/// automatically when more bytes arrive. In eager-sync mode (the shared
/// log), every automatic page write is synced, so a reader observing a page
/// address past a record knows that record is durable; group commit's flush
/// detection relies on this.
///
/// A page written by `hard_page_break` is final: the stream moves on to the
/// next page. A page written by `flush_buffered` may be rewritten later with
/// more data, which is how a transaction's private log stays readable for
/// online rollback while it is still being appended to.
pub struct PagedLogWriter {
    file: File,
    path: PathBuf,
    uuid: Uuid,
    page_size: usize,
    /// The page currently being filled.
    page_no: u64,
    /// Payload bytes of the current page.
    buf: Vec<u8>,
    /// Cumulative logical bytes written.
    cb_offset: u64,
    /// First page not yet reclaimed by checkpoint truncation.
    first_live_page: u64,
    eager_sync: bool,
}

impl PagedLogWriter {
    /// Creates a new log stream, truncating any existing file.
    pub fn create(
        path: impl AsRef<Path>,
        uuid: Uuid,
        page_size: usize,
        eager_sync: bool,
    ) -> TxnLogResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let capacity = page_size - PageHeader::SIZE;
        Ok(Self {
            file,
            path,
            uuid,
            page_size,
            page_no: 0,
            buf: Vec::with_capacity(capacity),
            cb_offset: 0,
            first_live_page: 0,
            eager_sync,
        })
    }

    /// Payload capacity of one page.
    fn capacity(&self) -> usize {
        self.page_size - PageHeader::SIZE
    }

    /// Appends bytes to the stream.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> TxnLogResult<()> {
        while !bytes.is_empty() {
            let room = self.capacity() - self.buf.len();
            if room == 0 {
                self.advance_page()?;
                continue;
            }
            let n = room.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..n]);
            self.cb_offset += n as u64;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Writes the current page image at its file offset.
    fn write_page(&mut self) -> TxnLogResult<()> {
        let header = PageHeader::seal(self.uuid, self.page_no, &self.buf);
        let mut image = Vec::with_capacity(self.page_size);
        image.extend_from_slice(&header.to_bytes());
        image.extend_from_slice(&self.buf);
        image.resize(self.page_size, 0);
        self.file
            .seek(SeekFrom::Start(self.page_no * self.page_size as u64))?;
        self.file.write_all(&image)?;
        Ok(())
    }

    /// Writes out the full current page and moves to the next one.
    fn advance_page(&mut self) -> TxnLogResult<()> {
        self.write_page()?;
        if self.eager_sync {
            self.file.sync_data()?;
        }
        self.page_no += 1;
        self.buf.clear();
        Ok(())
    }

    /// Forces the current partial page out, syncs, and starts a new page.
    ///
    /// A no-op (except for the sync) when the current page holds no bytes:
    /// the stream is already at a page boundary.
    pub fn hard_page_break(&mut self) -> TxnLogResult<()> {
        if !self.buf.is_empty() {
            self.write_page()?;
            self.page_no += 1;
            self.buf.clear();
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Writes the current partial page without finishing it.
    ///
    /// The page stays current and will be rewritten as more bytes arrive;
    /// this just makes everything logged so far visible to a reader.
    pub fn flush_buffered(&mut self) -> TxnLogResult<()> {
        if !self.buf.is_empty() {
            self.write_page()?;
        }
        Ok(())
    }

    /// Syncs the file to durable storage.
    pub fn sync(&mut self) -> TxnLogResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Returns the current write position.
    pub fn position(&self) -> LogPosition {
        LogPosition {
            page: PageId::new(self.page_no),
            offset: self.buf.len() as u32,
            cb_offset: self.cb_offset,
        }
    }

    /// Returns the cumulative logical bytes written.
    pub fn cb_offset(&self) -> u64 {
        self.cb_offset
    }

    /// Returns the stream's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reclaims every page strictly before `page` by zeroing it.
    ///
    /// A zeroed page fails validation, so a reader can never mistake
    /// reclaimed space for live data. Pages already reclaimed are skipped.
    pub fn deallocate_before(&mut self, page: PageId) -> TxnLogResult<()> {
        let end = page.as_u64().min(self.page_no);
        if self.first_live_page >= end {
            return Ok(());
        }
        let zeros = vec![0u8; self.page_size];
        for page_no in self.first_live_page..end {
            self.file
                .seek(SeekFrom::Start(page_no * self.page_size as u64))?;
            self.file.write_all(&zeros)?;
        }
        self.file.sync_data()?;
        self.first_live_page = end;
        Ok(())
    }
}

impl std::fmt::Debug for PagedLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedLogWriter")
            .field("path", &self.path)
            .field("page_no", &self.page_no)
            .field("cb_offset", &self.cb_offset)
            .field("eager_sync", &self.eager_sync)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::reader::PagedLogReader;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_position() {
        let tmp = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let mut writer =
            PagedLogWriter::create(tmp.path().join("t.log"), uuid, 128, false).unwrap();

        writer.write_bytes(&[7u8; 10]).unwrap();
        let pos = writer.position();
        assert_eq!(pos.page, PageId::new(0));
        assert_eq!(pos.offset, 10);
        assert_eq!(pos.cb_offset, 10);
    }

    #[test]
    fn test_page_break_advances_page() {
        let tmp = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let mut writer =
            PagedLogWriter::create(tmp.path().join("t.log"), uuid, 128, false).unwrap();

        writer.write_bytes(b"hello").unwrap();
        writer.hard_page_break().unwrap();
        let pos = writer.position();
        assert_eq!(pos.page, PageId::new(1));
        assert_eq!(pos.offset, 0);
        assert_eq!(pos.cb_offset, 5);

        // breaking at a page boundary changes nothing
        writer.hard_page_break().unwrap();
        assert_eq!(writer.position().page, PageId::new(1));
    }

    #[test]
    fn test_roundtrip_across_pages() {
        let tmp = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let path = tmp.path().join("t.log");
        let mut writer = PagedLogWriter::create(&path, uuid, 128, false).unwrap();

        let data: Vec<u8> = (0..=255u8).cycle().take(500).collect();
        writer.write_bytes(&data).unwrap();
        writer.hard_page_break().unwrap();

        let mut reader = PagedLogReader::open(&path, uuid, 128).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_deallocated_pages_read_as_end_of_stream() {
        let tmp = TempDir::new().unwrap();
        let uuid = Uuid::new_v4();
        let path = tmp.path().join("t.log");
        let mut writer = PagedLogWriter::create(&path, uuid, 128, false).unwrap();

        writer.write_bytes(&[1u8; 200]).unwrap();
        writer.hard_page_break().unwrap();
        writer.deallocate_before(PageId::new(2)).unwrap();

        let mut reader = PagedLogReader::open(&path, uuid, 128).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
