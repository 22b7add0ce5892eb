//! Log page header.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use keel_common::constants::LOG_PAGE_HEADER_SIZE;

/// Header stamped onto every log page.
///
/// Layout (32 bytes):
/// - checksum: 4 bytes (CRC32 of uuid + page_no + data_len + payload)
/// - uuid: 16 bytes (instance that wrote the page)
/// - page_no: 8 bytes (the page's own number)
/// - data_len: 4 bytes (valid payload bytes on this page)
///
/// Validation failure is how end-of-stream is detected: an unwritten page is
/// all zeros, a torn page fails the checksum, and a stale page from an
/// earlier instance carries the wrong UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    /// CRC32 over the rest of the header and the payload.
    pub checksum: u32,
    /// Instance UUID stamped at write time.
    pub uuid: Uuid,
    /// The page's own number within its stream.
    pub page_no: u64,
    /// Number of valid payload bytes on the page.
    pub data_len: u32,
}

impl PageHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = LOG_PAGE_HEADER_SIZE;

    /// Builds a sealed header for a page about to be written.
    pub fn seal(uuid: Uuid, page_no: u64, data: &[u8]) -> Self {
        let mut header = Self {
            checksum: 0,
            uuid,
            page_no,
            data_len: data.len() as u32,
        };
        header.checksum = header.compute_checksum(data);
        header
    }

    /// Serializes the header to a byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u32_le(self.checksum);
        cursor.put_slice(self.uuid.as_bytes());
        cursor.put_u64_le(self.page_no);
        cursor.put_u32_le(self.data_len);
        buf
    }

    /// Deserializes a header from a byte slice.
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut buf = &bytes[..];
        let checksum = buf.get_u32_le();
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let page_no = buf.get_u64_le();
        let data_len = buf.get_u32_le();
        Self {
            checksum,
            uuid: Uuid::from_bytes(uuid_bytes),
            page_no,
            data_len,
        }
    }

    /// Computes the checksum for this header over the given payload.
    pub fn compute_checksum(&self, data: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(self.uuid.as_bytes());
        hasher.update(&self.page_no.to_le_bytes());
        hasher.update(&self.data_len.to_le_bytes());
        hasher.update(data);
        hasher.finalize()
    }

    /// Checks that the page belongs to the expected stream and position and
    /// that its payload is intact.
    pub fn is_valid(&self, expected_uuid: Uuid, expected_page_no: u64, data: &[u8]) -> bool {
        self.uuid == expected_uuid
            && self.page_no == expected_page_no
            && (self.data_len as usize) <= data.len()
            && self.checksum == self.compute_checksum(&data[..self.data_len as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let uuid = Uuid::new_v4();
        let header = PageHeader::seal(uuid, 7, b"payload bytes");
        let decoded = PageHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert!(decoded.is_valid(uuid, 7, b"payload bytes"));
    }

    #[test]
    fn test_validation_rejects_wrong_instance() {
        let header = PageHeader::seal(Uuid::new_v4(), 3, b"data");
        assert!(!header.is_valid(Uuid::new_v4(), 3, b"data"));
    }

    #[test]
    fn test_validation_rejects_wrong_page_no() {
        let uuid = Uuid::new_v4();
        let header = PageHeader::seal(uuid, 3, b"data");
        assert!(!header.is_valid(uuid, 4, b"data"));
    }

    #[test]
    fn test_validation_rejects_torn_payload() {
        let uuid = Uuid::new_v4();
        let header = PageHeader::seal(uuid, 0, b"data");
        assert!(!header.is_valid(uuid, 0, b"dXta"));
    }

    #[test]
    fn test_zeroed_header_is_invalid() {
        let uuid = Uuid::new_v4();
        let header = PageHeader::from_bytes(&[0u8; PageHeader::SIZE]);
        assert!(!header.is_valid(uuid, 0, &[]));
    }
}
