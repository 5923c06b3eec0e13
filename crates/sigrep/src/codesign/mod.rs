//! Signature component framing: slots, constants, and the SuperBlob container.

pub mod constants;
pub mod slot;
pub mod superblob;

pub use slot::SpecialSlot;
pub use superblob::{build_superblob, BlobEntry, SuperBlob};
