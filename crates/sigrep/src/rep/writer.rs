//! Write-access objects for disk representations.
//!
//! A writer is transient: obtained from a representation just before a
//! signing operation stores its components, used for one atomic write
//! sequence, flushed, and dropped. The representation's caches must be
//! flushed before it is read again.

use crate::codesign::SpecialSlot;
use crate::{Error, Result};

/// Writer prefers not to store attributes itself; use it as a fallback of
/// last resort.
pub const WRITER_LAST_RESORT: u32 = 0x0001;

/// Writer has only per-architecture storage, no shared/global storage.
pub const WRITER_NO_GLOBAL: u32 = 0x0002;

/// The write-side counterpart to a representation: accepts signing
/// components and commits them to storage.
pub trait Writer {
    /// Buffer component bytes for the given slot. Committed by `flush()`.
    fn component(&mut self, slot: SpecialSlot, data: &[u8]) -> Result<()>;

    /// Attribute bit-set describing this writer's storage behavior.
    fn attributes(&self) -> u32 {
        0
    }

    fn attribute(&self, attr: u32) -> bool {
        self.attributes() & attr != 0
    }

    /// Strip existing signing data instead of writing new components.
    fn remove(&mut self) -> Result<()> {
        Err(Error::Unsupported("signature removal"))
    }

    /// Commit buffered writes to storage.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    // shorthands for the fixed well-known slots

    fn code_directory(&mut self, data: &[u8]) -> Result<()> {
        self.component(SpecialSlot::CodeDirectory, data)
    }

    fn signature(&mut self, data: &[u8]) -> Result<()> {
        self.component(SpecialSlot::Signature, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct BufferWriter {
        components: BTreeMap<SpecialSlot, Vec<u8>>,
    }

    impl Writer for BufferWriter {
        fn component(&mut self, slot: SpecialSlot, data: &[u8]) -> Result<()> {
            self.components.insert(slot, data.to_vec());
            Ok(())
        }

        fn attributes(&self) -> u32 {
            WRITER_LAST_RESORT
        }
    }

    #[test]
    fn test_shorthands_route_to_component() {
        let mut w = BufferWriter {
            components: BTreeMap::new(),
        };
        w.code_directory(&[1, 2]).unwrap();
        w.signature(&[3, 4]).unwrap();
        assert_eq!(w.components[&SpecialSlot::CodeDirectory], vec![1, 2]);
        assert_eq!(w.components[&SpecialSlot::Signature], vec![3, 4]);
    }

    #[test]
    fn test_attribute_bits() {
        let w = BufferWriter {
            components: BTreeMap::new(),
        };
        assert!(w.attribute(WRITER_LAST_RESORT));
        assert!(!w.attribute(WRITER_NO_GLOBAL));
    }

    #[test]
    fn test_default_remove_unsupported() {
        let mut w = BufferWriter {
            components: BTreeMap::new(),
        };
        assert!(matches!(w.remove(), Err(Error::Unsupported(_))));
    }
}
