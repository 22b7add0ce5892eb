//! Transaction-private output stream with long-log spilling.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::trace;
use uuid::Uuid;

use super::reader::{MemReader, PagedLogReader};
use super::writer::PagedLogWriter;
use super::LogInputStream;
use crate::error::TxnLogResult;
use crate::record::LogPosition;

/// A transaction's private log stream.
///
/// Content stays in memory until it crosses the spill threshold, at which
/// point everything moves to a long-log segment file. Promotion is one-way:
/// once spilled, all further activity, including rollback replay, addresses
/// the segment.
pub struct SpillStream {
    path: PathBuf,
    uuid: Uuid,
    page_size: usize,
    threshold: usize,
    buf: Vec<u8>,
    writer: Option<PagedLogWriter>,
}

impl SpillStream {
    /// Creates a new private stream spilling to `path` on overflow.
    ///
    /// No file is created until the stream actually spills.
    pub fn new(path: impl Into<PathBuf>, uuid: Uuid, page_size: usize, threshold: usize) -> Self {
        Self {
            path: path.into(),
            uuid,
            page_size,
            threshold,
            buf: Vec::new(),
            writer: None,
        }
    }

    /// Returns the cumulative bytes logged.
    pub fn cb_logged(&self) -> u64 {
        match &self.writer {
            Some(writer) => writer.cb_offset(),
            None => self.buf.len() as u64,
        }
    }

    /// Returns true if content has spilled to the long-log segment.
    pub fn is_spilled(&self) -> bool {
        self.writer.is_some()
    }

    /// Appends bytes to the stream.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> TxnLogResult<()> {
        if self.writer.is_none() && self.buf.len() + bytes.len() > self.threshold {
            self.promote()?;
        }
        match &mut self.writer {
            Some(writer) => writer.write_bytes(bytes),
            None => {
                self.buf.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Moves the in-memory content into a long-log segment.
    fn promote(&mut self) -> TxnLogResult<()> {
        trace!(path = %self.path.display(), bytes = self.buf.len(), "private log spilling to long-log segment");
        let mut writer = PagedLogWriter::create(&self.path, self.uuid, self.page_size, false)?;
        writer.write_bytes(&self.buf)?;
        self.buf = Vec::new();
        self.writer = Some(writer);
        Ok(())
    }

    /// Promotes to long-log form (if not already) and forces a page break.
    pub fn hard_page_break(&mut self) -> TxnLogResult<()> {
        if self.writer.is_none() {
            self.promote()?;
        }
        self.writer
            .as_mut()
            .expect("promoted above")
            .hard_page_break()
    }

    /// Returns the long-log position of the stream.
    ///
    /// Only meaningful after promotion.
    pub fn position(&self) -> LogPosition {
        match &self.writer {
            Some(writer) => writer.position(),
            None => unreachable!("position of an unspilled private log"),
        }
    }

    /// Returns the in-memory content of an unspilled stream.
    pub fn buffered(&self) -> &[u8] {
        debug_assert!(self.writer.is_none());
        &self.buf
    }

    /// Closes out a spilled stream for retention, returning its path.
    ///
    /// The caller is expected to have forced a final page break; this drops
    /// the write handle so the segment can be reclaimed independently later.
    pub fn finish(&mut self) -> PathBuf {
        self.writer = None;
        self.buf = Vec::new();
        self.path.clone()
    }

    /// Discards the stream, removing any spilled segment file.
    pub fn discard(&mut self) -> TxnLogResult<()> {
        let spilled = self.writer.take().is_some();
        self.buf = Vec::new();
        if spilled {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Opens a reader over everything logged so far.
    pub fn reader(&mut self) -> TxnLogResult<SpillReader<'_>> {
        match &mut self.writer {
            Some(writer) => {
                writer.flush_buffered()?;
                let reader = PagedLogReader::open(&self.path, self.uuid, self.page_size)?;
                Ok(SpillReader::Paged(reader))
            }
            None => Ok(SpillReader::Mem(MemReader::new(&self.buf))),
        }
    }

    /// Returns the long-log segment path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Write for SpillStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for SpillStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillStream")
            .field("path", &self.path)
            .field("cb_logged", &self.cb_logged())
            .field("spilled", &self.is_spilled())
            .finish()
    }
}

/// Reader over a private log, in-memory or spilled.
#[derive(Debug)]
pub enum SpillReader<'a> {
    /// Reading the in-memory buffer.
    Mem(MemReader<'a>),
    /// Reading the long-log segment.
    Paged(PagedLogReader),
}

impl Read for SpillReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Mem(reader) => reader.read(buf),
            Self::Paged(reader) => reader.read(buf),
        }
    }
}

impl LogInputStream for SpillReader<'_> {
    fn offset(&self) -> u64 {
        match self {
            Self::Mem(reader) => reader.offset(),
            Self::Paged(reader) => reader.offset(),
        }
    }

    fn seek_offset(&mut self, offset: u64) -> TxnLogResult<()> {
        match self {
            Self::Mem(reader) => reader.seek_offset(offset),
            Self::Paged(reader) => reader.seek_offset(offset),
        }
    }

    fn seek(&mut self, position: &LogPosition) -> TxnLogResult<()> {
        match self {
            Self::Mem(reader) => reader.seek(position),
            Self::Paged(reader) => reader.seek(position),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stays_in_memory_below_threshold() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn1.dat");
        let mut stream = SpillStream::new(&path, Uuid::new_v4(), 128, 64);

        stream.write_bytes(&[1u8; 40]).unwrap();
        assert!(!stream.is_spilled());
        assert_eq!(stream.cb_logged(), 40);
        assert!(!path.exists());
    }

    #[test]
    fn test_spills_past_threshold() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn2.dat");
        let mut stream = SpillStream::new(&path, Uuid::new_v4(), 128, 64);

        stream.write_bytes(&[1u8; 40]).unwrap();
        stream.write_bytes(&[2u8; 40]).unwrap();
        assert!(stream.is_spilled());
        assert_eq!(stream.cb_logged(), 80);
        assert!(path.exists());

        // spilled content reads back in order
        let mut reader = stream.reader().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(&out[..40], &[1u8; 40][..]);
        assert_eq!(&out[40..], &[2u8; 40][..]);
    }

    #[test]
    fn test_page_break_promotes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn3.dat");
        let mut stream = SpillStream::new(&path, Uuid::new_v4(), 128, 1024);

        stream.write_bytes(&[7u8; 10]).unwrap();
        assert!(!stream.is_spilled());
        stream.hard_page_break().unwrap();
        assert!(stream.is_spilled());
        assert_eq!(stream.position().cb_offset, 10);
    }

    #[test]
    fn test_reader_sees_unspilled_content() {
        let tmp = TempDir::new().unwrap();
        let mut stream = SpillStream::new(tmp.path().join("txn4.dat"), Uuid::new_v4(), 128, 64);
        stream.write_bytes(b"abc").unwrap();

        let mut reader = stream.reader().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_discard_removes_segment() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn5.dat");
        let mut stream = SpillStream::new(&path, Uuid::new_v4(), 128, 8);
        stream.write_bytes(&[0u8; 32]).unwrap();
        assert!(path.exists());

        stream.discard().unwrap();
        assert!(!path.exists());
        assert_eq!(stream.cb_logged(), 0);
    }

    #[test]
    fn test_reads_through_unfinished_page() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("txn6.dat");
        let mut stream = SpillStream::new(&path, Uuid::new_v4(), 128, 8);

        // spill, then leave a partial page pending
        stream.write_bytes(&[5u8; 100]).unwrap();
        stream.write_bytes(&[6u8; 30]).unwrap();
        let mut reader = stream.reader().unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 130);
        assert_eq!(out[129], 6);
        drop(reader);

        // and the stream keeps accepting writes afterward
        stream.write_bytes(&[7u8; 10]).unwrap();
        assert_eq!(stream.cb_logged(), 140);
    }
}
