//! SuperBlob container: the on-disk framing for signature components.
//!
//! A SuperBlob is a header followed by an index of (slot, offset) entries,
//! each pointing at an embedded blob:
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Header (12 bytes)                  │
//! │  - magic (4 bytes)                 │
//! │  - length: total size (4 bytes)    │
//! │  - count: number of blobs (4 bytes)│
//! ├────────────────────────────────────┤
//! │ Index Entry 0 (8 bytes)            │
//! │  - slot (4 bytes)                  │
//! │  - offset (4 bytes)                │
//! ├────────────────────────────────────┤
//! │ ... more index entries             │
//! ├────────────────────────────────────┤
//! │ Blob data, back to back            │
//! └────────────────────────────────────┘
//! ```
//!
//! All fields are big-endian. The same container carries embedded
//! signatures (`CSMAGIC_EMBEDDED_SIGNATURE`), detached signatures
//! (`CSMAGIC_DETACHED_SIGNATURE`), and sidecar component stores.

use std::ops::Range;

use super::constants::*;
use super::slot::SpecialSlot;
use crate::{Error, Result};

/// Size of the SuperBlob header in bytes (magic + length + count)
const SUPERBLOB_HEADER_SIZE: u32 = 12;

/// Size of each index entry in bytes (slot + offset)
const INDEX_ENTRY_SIZE: u32 = 8;

/// A component entry for inclusion in a SuperBlob.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    /// The slot number identifying this blob's purpose.
    pub slot: u32,
    /// The raw component bytes. Opaque to this layer.
    pub data: Vec<u8>,
}

impl BlobEntry {
    pub fn new(slot: u32, data: Vec<u8>) -> Self {
        Self { slot, data }
    }
}

/// Serialize a SuperBlob with the given magic and entries.
///
/// Entries are written in the order given; callers wanting canonical output
/// should pass entries sorted by slot number.
pub fn build_superblob(magic: u32, entries: &[BlobEntry]) -> Vec<u8> {
    let count = entries.len() as u32;
    let header_size = SUPERBLOB_HEADER_SIZE + count * INDEX_ENTRY_SIZE;

    let mut offsets = Vec::with_capacity(entries.len());
    let mut current_offset = header_size;
    for entry in entries {
        offsets.push(current_offset);
        current_offset += entry.data.len() as u32;
    }
    let total_length = current_offset;

    let mut buf = Vec::with_capacity(total_length as usize);
    buf.extend(&magic.to_be_bytes());
    buf.extend(&total_length.to_be_bytes());
    buf.extend(&count.to_be_bytes());
    for (entry, offset) in entries.iter().zip(&offsets) {
        buf.extend(&entry.slot.to_be_bytes());
        buf.extend(&offset.to_be_bytes());
    }
    for entry in entries {
        buf.extend(&entry.data);
    }
    buf
}

/// Build a minimal empty requirements blob (header only, count = 0).
pub fn empty_requirements_blob() -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend(&CSMAGIC_REQUIREMENTS.to_be_bytes());
    buf.extend(&12u32.to_be_bytes());
    buf.extend(&0u32.to_be_bytes());
    buf
}

/// A parsed SuperBlob, holding the container bytes and a validated index.
///
/// Component payloads are arbitrary byte strings; each entry's extent runs
/// from its offset to the next-higher offset (or the container's end), so
/// payloads need not carry their own length headers.
#[derive(Debug, Clone)]
pub struct SuperBlob {
    magic: u32,
    data: Vec<u8>,
    index: Vec<(u32, Range<usize>)>,
}

impl SuperBlob {
    /// Parse a SuperBlob, validating the header and every index entry.
    ///
    /// Accepts embedded and detached signature magics.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOB_HEADER_SIZE as usize {
            return Err(Error::SignatureInvalid("truncated header".into()));
        }
        let magic = be32(data, 0);
        if magic != CSMAGIC_EMBEDDED_SIGNATURE && magic != CSMAGIC_DETACHED_SIGNATURE {
            return Err(Error::SignatureInvalid(format!(
                "unexpected container magic 0x{magic:08x}"
            )));
        }
        let length = be32(data, 4) as usize;
        let count = be32(data, 8) as usize;
        if length > data.len() || length < SUPERBLOB_HEADER_SIZE as usize {
            return Err(Error::SignatureInvalid("bad container length".into()));
        }
        let index_end = SUPERBLOB_HEADER_SIZE as usize + count * INDEX_ENTRY_SIZE as usize;
        if index_end > length {
            return Err(Error::SignatureInvalid("index exceeds container".into()));
        }

        let mut raw: Vec<(u32, usize)> = Vec::with_capacity(count);
        for i in 0..count {
            let at = SUPERBLOB_HEADER_SIZE as usize + i * INDEX_ENTRY_SIZE as usize;
            let slot = be32(data, at);
            let offset = be32(data, at + 4) as usize;
            if offset < index_end || offset > length {
                return Err(Error::SignatureInvalid(format!(
                    "blob offset {offset} out of bounds"
                )));
            }
            raw.push((slot, offset));
        }

        // each blob runs to the next-higher offset, or the container's end
        let mut ends: Vec<usize> = raw.iter().map(|&(_, o)| o).collect();
        ends.sort_unstable();
        let index = raw
            .into_iter()
            .map(|(slot, offset)| {
                let end = ends
                    .iter()
                    .copied()
                    .find(|&e| e > offset)
                    .unwrap_or(length);
                (slot, offset..end)
            })
            .collect();

        Ok(Self {
            magic,
            data: data[..length].to_vec(),
            index,
        })
    }

    pub fn magic(&self) -> u32 {
        self.magic
    }

    pub fn count(&self) -> usize {
        self.index.len()
    }

    /// Look up a component by raw slot number.
    pub fn find(&self, slot: u32) -> Option<&[u8]> {
        self.index
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, range)| &self.data[range.clone()])
    }

    /// Look up a component by special slot.
    pub fn component(&self, slot: SpecialSlot) -> Option<&[u8]> {
        self.find(slot.raw())
    }

    /// Iterate over (slot, payload) pairs in index order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.index
            .iter()
            .map(|(slot, range)| (*slot, &self.data[range.clone()]))
    }
}

fn be32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblob_structure() {
        let entries = vec![
            BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![0xab; 100]),
            BlobEntry::new(CSSLOT_REQUIREMENTS, vec![0xcd; 12]),
        ];
        let blob = build_superblob(CSMAGIC_EMBEDDED_SIGNATURE, &entries);

        assert_eq!(&blob[0..4], &CSMAGIC_EMBEDDED_SIGNATURE.to_be_bytes());
        assert_eq!(&blob[8..12], &2u32.to_be_bytes());

        // header 12 + index 2*8 + data 100+12
        let expected_len = 12 + 16 + 100 + 12;
        let actual_len = u32::from_be_bytes([blob[4], blob[5], blob[6], blob[7]]);
        assert_eq!(actual_len, expected_len);
    }

    #[test]
    fn test_parse_round_trip() {
        let entries = vec![
            BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![1, 2, 3, 4, 5]),
            BlobEntry::new(CSSLOT_REQUIREMENTS, empty_requirements_blob()),
            BlobEntry::new(CSSLOT_SIGNATURESLOT, vec![9; 33]),
        ];
        let bytes = build_superblob(CSMAGIC_EMBEDDED_SIGNATURE, &entries);
        let parsed = SuperBlob::parse(&bytes).unwrap();

        assert_eq!(parsed.count(), 3);
        assert_eq!(parsed.find(CSSLOT_CODEDIRECTORY), Some(&[1, 2, 3, 4, 5][..]));
        assert_eq!(
            parsed.component(SpecialSlot::Requirements),
            Some(empty_requirements_blob().as_slice())
        );
        assert_eq!(parsed.component(SpecialSlot::Signature), Some(&[9u8; 33][..]));
        assert_eq!(parsed.component(SpecialSlot::Entitlements), None);
    }

    #[test]
    fn test_parse_detached_magic() {
        let bytes = build_superblob(
            CSMAGIC_DETACHED_SIGNATURE,
            &[BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![7; 8])],
        );
        let parsed = SuperBlob::parse(&bytes).unwrap();
        assert_eq!(parsed.magic(), CSMAGIC_DETACHED_SIGNATURE);
        assert_eq!(parsed.component(SpecialSlot::CodeDirectory), Some(&[7u8; 8][..]));
    }

    #[test]
    fn test_parse_rejects_wrong_magic() {
        let bytes = build_superblob(CSMAGIC_CODEDIRECTORY, &[]);
        assert!(matches!(
            SuperBlob::parse(&bytes),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = build_superblob(
            CSMAGIC_EMBEDDED_SIGNATURE,
            &[BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![0; 64])],
        );
        assert!(SuperBlob::parse(&bytes[..10]).is_err());
        assert!(SuperBlob::parse(&bytes[..20]).is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_bounds_offset() {
        let mut bytes = build_superblob(
            CSMAGIC_EMBEDDED_SIGNATURE,
            &[BlobEntry::new(CSSLOT_CODEDIRECTORY, vec![0; 16])],
        );
        // corrupt the entry offset to point past the container
        bytes[16..20].copy_from_slice(&0xffff_ffffu32.to_be_bytes());
        assert!(matches!(
            SuperBlob::parse(&bytes),
            Err(Error::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_empty_container() {
        let bytes = build_superblob(CSMAGIC_EMBEDDED_SIGNATURE, &[]);
        let parsed = SuperBlob::parse(&bytes).unwrap();
        assert_eq!(parsed.count(), 0);
        assert_eq!(parsed.find(CSSLOT_CODEDIRECTORY), None);
    }

    #[test]
    fn test_empty_requirements_blob() {
        let req = empty_requirements_blob();
        assert_eq!(&req[0..4], &CSMAGIC_REQUIREMENTS.to_be_bytes());
        assert_eq!(req.len(), 12);
    }

    #[test]
    fn test_arbitrary_payloads_survive() {
        // payloads without their own length headers must round-trip intact
        let payload = vec![0u8, 255, 1, 254, 2, 253];
        let bytes = build_superblob(
            CSMAGIC_EMBEDDED_SIGNATURE,
            &[
                BlobEntry::new(CSSLOT_RESOURCEDIR, payload.clone()),
                BlobEntry::new(CSSLOT_TICKETSLOT, vec![]),
            ],
        );
        let parsed = SuperBlob::parse(&bytes).unwrap();
        assert_eq!(parsed.find(CSSLOT_RESOURCEDIR), Some(payload.as_slice()));
        assert_eq!(parsed.find(CSSLOT_TICKETSLOT), Some(&[][..]));
    }
}
