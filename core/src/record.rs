//! Record/Page/Tag data model.

use std::fmt;
use std::str::FromStr;

use crc::{Crc, CRC_32_AIXM};
use serde::{Deserialize, Serialize};

use crate::error::SdrError;
use crate::work_mode::WorkModeKind;

/// CRC-32Q: polynomial Q, seed 0, no reflection. The "CRC_32_AIXM"
/// parameterization is the standard name for this in aviation literature.
pub const CRC32Q: Crc<u32> = Crc::<u32>::new(&CRC_32_AIXM);

/// Size in bytes of one page, the atomic data unit.
pub const PAGE_SIZE: usize = 256;
/// Bytes of `PAGE_SIZE` reserved for the CRC.
pub const PAGE_CRC_SIZE: usize = 4;
/// Bytes of `PAGE_SIZE` available to the mode-specific payload.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_CRC_SIZE;

/// 128-bit opaque record identifier, rendered on disk as a dashed hex GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u128);

impl RecordId {
    pub fn from_u128(value: u128) -> Self {
        RecordId(value)
    }

    /// Uppercase hex with no dashes, the form tag-id derivation hashes.
    pub fn to_hex_upper_no_dashes(&self) -> String {
        format!("{:032X}", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = format!("{:032x}", self.0);
        write!(
            f,
            "{}-{}-{}-{}-{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32]
        )
    }
}

impl FromStr for RecordId {
    type Err = SdrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != '-').collect();
        u128::from_str_radix(&cleaned, 16)
            .map(RecordId)
            .map_err(|e| SdrError::Failed(format!("invalid record id {s}: {e}")))
    }
}

/// One 256-byte slot: a CRC-32Q checksum followed by a mode-specific payload.
#[derive(Debug, Clone)]
pub struct Page {
    pub payload: [u8; PAGE_PAYLOAD_SIZE],
}

impl Page {
    pub fn zeroed() -> Self {
        Page {
            payload: [0u8; PAGE_PAYLOAD_SIZE],
        }
    }

    pub fn from_payload(payload: [u8; PAGE_PAYLOAD_SIZE]) -> Self {
        Page { payload }
    }

    fn crc(&self) -> u32 {
        CRC32Q.checksum(&self.payload)
    }

    /// Encode into the on-disk 256-byte representation.
    pub fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0..PAGE_CRC_SIZE].copy_from_slice(&self.crc().to_le_bytes());
        buf[PAGE_CRC_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a 256-byte slot, verifying the stored CRC against the payload.
    pub fn decode(buf: &[u8; PAGE_SIZE], index: u32) -> Result<Self, SdrError> {
        let stored = u32::from_le_bytes(buf[0..PAGE_CRC_SIZE].try_into().unwrap());
        let mut payload = [0u8; PAGE_PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[PAGE_CRC_SIZE..]);
        let page = Page { payload };
        if page.crc() != stored {
            return Err(SdrError::Corrupt { index });
        }
        Ok(page)
    }
}

/// Attribute value kind of a [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Int64,
    Real64,
    ByteString,
    String,
}

/// Maximum size, in bytes, of a tag's value buffer.
pub const TAG_VALUE_LEN: usize = 64;
/// Maximum length of a tag name.
pub const TAG_NAME_MAX_LEN: usize = 64;

/// 128-bit tag identifier, deterministically derived as
/// `MD5(name ‖ uppercase-hex-no-dashes(record_id))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagId(pub u128);

impl TagId {
    pub fn derive(name: &str, record_id: RecordId) -> Self {
        let mut input = String::with_capacity(name.len() + 32);
        input.push_str(name);
        input.push_str(&record_id.to_hex_upper_no_dashes());
        let digest = md5::compute(input.as_bytes());
        TagId(u128::from_be_bytes(digest.0))
    }
}

/// A named annotation attached to a record at a specific sample time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub kind: TagKind,
    pub name: String,
    /// Fixed-width value buffer; only `value_len` leading bytes are significant.
    pub value: [u8; TAG_VALUE_LEN],
    pub value_len: u8,
}

impl Tag {
    pub fn new(name: &str, kind: TagKind, bytes: &[u8], record_id: RecordId) -> Result<Self, SdrError> {
        if name.is_empty() || name.len() > TAG_NAME_MAX_LEN || !name.is_ascii() {
            return Err(SdrError::Failed(format!("invalid tag name {name:?}")));
        }
        if bytes.len() > TAG_VALUE_LEN {
            return Err(SdrError::Failed(format!(
                "tag value too large: {} > {}",
                bytes.len(),
                TAG_VALUE_LEN
            )));
        }
        let mut value = [0u8; TAG_VALUE_LEN];
        value[..bytes.len()].copy_from_slice(bytes);
        Ok(Tag {
            id: TagId::derive(name, record_id),
            kind,
            name: name.to_string(),
            value,
            value_len: bytes.len() as u8,
        })
    }

    pub fn value_bytes(&self) -> &[u8] {
        &self.value[..self.value_len as usize]
    }
}

/// In-memory representation of one record's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub name: String,
    pub mode: WorkModeKind,
    pub frequency_hz: u64,
    /// Creation timestamp, microseconds since Unix epoch.
    pub created_at_us: u64,
    pub duration_sec: f64,
    pub page_count: u32,
    pub tags: Vec<Tag>,
}

impl Record {
    pub fn new(id: RecordId, name: String, mode: WorkModeKind, frequency_hz: u64, created_at_us: u64) -> Self {
        Record {
            id,
            name,
            mode,
            frequency_hz,
            created_at_us,
            duration_sec: 0.0,
            page_count: 0,
            tags: Vec::new(),
        }
    }

    /// Invariant: `page_count * PAGE_SIZE == data_file_len`.
    pub fn validate_page_count(&self, data_file_len: u64) -> Result<(), SdrError> {
        let expected = self.page_count as u64 * PAGE_SIZE as u64;
        if expected != data_file_len {
            return Err(SdrError::Failed(format!(
                "page count mismatch: {} pages implies {expected} bytes, file has {data_file_len}",
                self.page_count
            )));
        }
        Ok(())
    }

    pub fn add_tag(&mut self, tag: Tag) -> Result<(), SdrError> {
        if self.tags.iter().any(|t| t.id == tag.id) {
            return Err(SdrError::Denied(format!(
                "tag name {:?} already present on record",
                tag.name
            )));
        }
        self.tags.push(tag);
        Ok(())
    }

    pub fn delete_tag(&mut self, id: TagId) -> Result<(), SdrError> {
        let before = self.tags.len();
        self.tags.retain(|t| t.id != id);
        if self.tags.len() == before {
            return Err(SdrError::NotFound(format!("tag {id:?}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_round_trips_through_display() {
        let id = RecordId(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let rendered = id.to_string();
        assert_eq!(rendered.matches('-').count(), 4);
        let parsed: RecordId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn page_round_trips_and_detects_corruption() {
        let mut payload = [0u8; PAGE_PAYLOAD_SIZE];
        payload[0] = 0xAB;
        payload[10] = 0xCD;
        let page = Page::from_payload(payload);
        let mut encoded = page.encode();
        let decoded = Page::decode(&encoded, 0).unwrap();
        assert_eq!(decoded.payload, page.payload);

        encoded[PAGE_CRC_SIZE] ^= 0xFF;
        let err = Page::decode(&encoded, 3).unwrap_err();
        assert_eq!(err, SdrError::Corrupt { index: 3 });
    }

    #[test]
    fn tag_id_matches_worked_example() {
        let record_id = RecordId::from_u128(0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);
        let tag = Tag::new("note", TagKind::String, b"glide-check", record_id).unwrap();
        let expected = TagId::derive("note", record_id);
        assert_eq!(tag.id, expected);
    }

    #[test]
    fn record_rejects_duplicate_tag_name() {
        let record_id = RecordId::from_u128(42);
        let mut record = Record::new(record_id, "flight-01".into(), WorkModeKind::Llz, 109_500_000, 0);
        let tag1 = Tag::new("note", TagKind::String, b"a", record_id).unwrap();
        let tag2 = Tag::new("note", TagKind::String, b"b", record_id).unwrap();
        record.add_tag(tag1).unwrap();
        assert!(record.add_tag(tag2).is_err());
    }
}
