//! Paged log input streams.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use keel_common::types::PageId;

use super::page::PageHeader;
use super::LogInputStream;
use crate::error::{TxnLogError, TxnLogResult};
use crate::record::LogPosition;

/// Sequential reader over a paged log stream.
///
/// Reading past the last valid page yields end-of-stream (a zero-byte read),
/// which is the normal recovery boundary. Seeks to positions that must be
/// valid report corruption instead.
pub struct PagedLogReader {
    file: File,
    path: PathBuf,
    uuid: Uuid,
    page_size: usize,
    /// The page the cursor is on.
    page_no: u64,
    /// Payload of the loaded page (empty when not loaded).
    page: Vec<u8>,
    /// Whether `page` holds the current page's payload.
    loaded: bool,
    /// Read position within the loaded page.
    pos: usize,
    /// Cumulative byte offset of the current page's first payload byte.
    page_start_cb: u64,
}

impl PagedLogReader {
    /// Opens a paged log stream for reading from its first page.
    pub fn open(path: impl AsRef<Path>, uuid: Uuid, page_size: usize) -> TxnLogResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            file,
            path,
            uuid,
            page_size,
            page_no: 0,
            page: Vec::new(),
            loaded: false,
            pos: 0,
            page_start_cb: 0,
        })
    }

    /// Reads and validates one page, returning its payload.
    ///
    /// `None` means the page is not (validly) part of the stream: short
    /// read, bad checksum, foreign UUID, or mismatched page number.
    fn load(&mut self, page_no: u64) -> TxnLogResult<Option<Vec<u8>>> {
        self.file
            .seek(SeekFrom::Start(page_no * self.page_size as u64))?;
        let mut image = vec![0u8; self.page_size];
        let mut filled = 0;
        while filled < image.len() {
            match self.file.read(&mut image[filled..]) {
                Ok(0) => return Ok(None),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let header_bytes: [u8; PageHeader::SIZE] = image[..PageHeader::SIZE].try_into().unwrap();
        let header = PageHeader::from_bytes(&header_bytes);
        let payload = &image[PageHeader::SIZE..];
        if !header.is_valid(self.uuid, page_no, payload) {
            return Ok(None);
        }
        Ok(Some(payload[..header.data_len as usize].to_vec()))
    }

    /// Makes `page_no`/`page` current, positioned at `pos` within it.
    fn install(&mut self, page_no: u64, page: Vec<u8>, pos: usize, page_start_cb: u64) {
        self.page_no = page_no;
        self.page = page;
        self.loaded = true;
        self.pos = pos;
        self.page_start_cb = page_start_cb;
    }

    /// Returns the stream's file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for PagedLogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.loaded && self.pos < self.page.len() {
                let n = buf.len().min(self.page.len() - self.pos);
                buf[..n].copy_from_slice(&self.page[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            // page exhausted (or never loaded): move to / load the next one
            if self.loaded {
                self.page_start_cb += self.page.len() as u64;
                self.page_no += 1;
                self.loaded = false;
                self.pos = 0;
            }
            match self
                .load(self.page_no)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
            {
                Some(page) => {
                    self.page = page;
                    self.loaded = true;
                    self.pos = 0;
                }
                None => return Ok(0), // end of stream
            }
        }
    }
}

impl LogInputStream for PagedLogReader {
    fn offset(&self) -> u64 {
        self.page_start_cb + self.pos as u64
    }

    fn seek_offset(&mut self, target: u64) -> TxnLogResult<()> {
        // walk backward page by page while the target precedes the current page
        while target < self.page_start_cb {
            let prev = self.page_no.checked_sub(1).ok_or_else(|| {
                TxnLogError::page_corrupted(PageId::new(self.page_no), "seek before first page")
            })?;
            let page = self.load(prev)?.ok_or_else(|| {
                TxnLogError::page_corrupted(PageId::new(prev), "invalid page on backward seek")
            })?;
            let start = self.page_start_cb - page.len() as u64;
            self.install(prev, page, 0, start);
        }
        // then forward until the target falls on the current page
        loop {
            if !self.loaded {
                match self.load(self.page_no)? {
                    Some(page) => {
                        self.page = page;
                        self.loaded = true;
                        self.pos = 0;
                    }
                    None if target == self.page_start_cb => {
                        // seeking to the exact end of the written stream
                        self.pos = 0;
                        return Ok(());
                    }
                    None => {
                        return Err(TxnLogError::page_corrupted(
                            PageId::new(self.page_no),
                            "invalid page on forward seek",
                        ))
                    }
                }
            }
            let page_end = self.page_start_cb + self.page.len() as u64;
            if target <= page_end {
                self.pos = (target - self.page_start_cb) as usize;
                return Ok(());
            }
            self.page_start_cb = page_end;
            self.page_no += 1;
            self.loaded = false;
            self.pos = 0;
        }
    }

    fn seek(&mut self, position: &LogPosition) -> TxnLogResult<()> {
        let page_no = position.page.as_u64();
        match self.load(page_no)? {
            Some(page) => {
                let pos = position.offset as usize;
                if pos > page.len() {
                    return Err(TxnLogError::page_corrupted(
                        position.page,
                        format!("offset {} beyond page data length {}", pos, page.len()),
                    ));
                }
                let start = position
                    .cb_offset
                    .checked_sub(position.offset as u64)
                    .ok_or_else(|| {
                        TxnLogError::page_corrupted(position.page, "position offsets disagree")
                    })?;
                self.install(page_no, page, pos, start);
                Ok(())
            }
            // A position at offset zero may name the page the writer had not
            // started yet (a break with nothing logged after it); the cursor
            // parks there and reads end-of-stream.
            None if position.offset == 0 => {
                self.page_no = page_no;
                self.page.clear();
                self.loaded = false;
                self.pos = 0;
                self.page_start_cb = position.cb_offset;
                Ok(())
            }
            None => Err(TxnLogError::page_corrupted(
                position.page,
                "seek to invalid page",
            )),
        }
    }
}

impl std::fmt::Debug for PagedLogReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedLogReader")
            .field("path", &self.path)
            .field("page_no", &self.page_no)
            .field("offset", &self.offset())
            .finish()
    }
}

/// Reader over an in-memory private log.
#[derive(Debug)]
pub struct MemReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MemReader<'a> {
    /// Creates a reader over the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl Read for MemReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl LogInputStream for MemReader<'_> {
    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn seek_offset(&mut self, target: u64) -> TxnLogResult<()> {
        if target > self.data.len() as u64 {
            return Err(TxnLogError::SeekOutOfBounds {
                offset: target,
                len: self.data.len() as u64,
            });
        }
        self.pos = target as usize;
        Ok(())
    }

    fn seek(&mut self, position: &LogPosition) -> TxnLogResult<()> {
        self.seek_offset(position.cb_offset)
    }
}
