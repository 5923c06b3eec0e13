//! Disk representations of code.
//!
//! A [`DiskRep`] is an abstract interface to code located by a filesystem
//! path. It presents the ability to read and write signing-related
//! information about that code without exposing the storage location or
//! format: a thin Mach-O file, a slice of a universal binary, a bundle
//! directory, or a flat file with no native structure all answer the same
//! contract.
//!
//! Representations are constructed by the [`best_guess`] family of
//! dispatchers and shared via `Arc`; their file and image caches are
//! populated lazily and invalidated only by [`DiskRep::flush`].

pub mod bundle;
pub mod file;
pub mod filter;
pub mod guess;
pub mod macho;
pub mod writer;

pub use bundle::BundleRep;
pub use file::FileRep;
pub use filter::DetachedRep;
pub use guess::{best_file_guess, best_guess, best_guess_at_offset, best_guess_with, Context};
pub use macho::MachORep;
pub use writer::{Writer, WRITER_LAST_RESORT, WRITER_NO_GLOBAL};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::codesign::SpecialSlot;
use crate::macho::{Architecture, Universal};
use crate::requirement::Requirements;
use crate::resources::{ResourceBuilder, ResourceRules};
use crate::{Error, Result};

/// Default page size for system-paged signatures.
pub const SEGMENTED_PAGE_SIZE: usize = 4096;

/// Page size marking monolithic hashing: the whole signed region is one
/// hash unit.
pub const MONOLITHIC_PAGE_SIZE: usize = 0;

/// Capability contract every concrete representation implements.
///
/// Defaults model the common case; richer storage shapes override them.
/// Component absence is a normal outcome (`Ok(None)`), never an error.
pub trait DiskRep: Send + Sync {
    /// Fetch the bytes of a signing component, or `None` if absent.
    fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>>;

    /// A stable binary lookup key derived from the code's on-disk identity,
    /// used to correlate running code back to its static representation.
    fn identification(&self) -> Result<Vec<u8>>;

    /// Path to the main executable.
    fn main_executable_path(&self) -> &Path;

    /// Path to the whole code (for a bundle, its root directory).
    fn canonical_path(&self) -> &Path;

    /// Best-effort default signing identifier derived from the storage
    /// shape. Always usable, never empty.
    fn recommended_identifier(&self) -> String;

    /// Resource directory, if this shape carries sealable resources.
    fn resources_root_path(&self) -> Option<PathBuf> {
        None
    }

    /// Default resource-sealing rules, if this shape carries resources.
    fn default_resource_rules(&self) -> Option<ResourceRules> {
        None
    }

    /// Adjust the resource-sealing inputs (add exclusions and the like).
    fn adjust_resources(&self, _builder: &mut ResourceBuilder) -> Result<()> {
        Ok(())
    }

    /// Baked-in requirement set for the given architecture, if any.
    fn default_requirements(&self, _arch: &Architecture) -> Option<Requirements> {
        None
    }

    /// The parsed image handle, non-`None` only if the main executable is a
    /// recognized Mach-O or universal binary.
    fn main_executable_image(&self) -> Result<Option<Arc<Universal>>> {
        Ok(None)
    }

    /// Whether the main executable is Mach-O; driven solely by
    /// [`DiskRep::main_executable_image`].
    fn main_executable_is_macho(&self) -> Result<bool> {
        Ok(self.main_executable_image()?.is_some())
    }

    /// Hash page size: [`SEGMENTED_PAGE_SIZE`] for paged formats, or
    /// [`MONOLITHIC_PAGE_SIZE`] (0) for one hash over the whole region.
    fn page_size(&self) -> usize {
        MONOLITHIC_PAGE_SIZE
    }

    /// Start offset of the signed region within the main executable.
    fn signing_base(&self) -> u64 {
        0
    }

    /// Size of the region covered by the signature.
    fn signing_limit(&self) -> Result<u64>;

    /// Human-readable type label. Diagnostic use only, never parsed.
    fn format(&self) -> String;

    /// Auxiliary files written by a signing pass, beyond the main
    /// executable itself.
    fn modified_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// A cached open handle to the main executable, reused across calls
    /// until [`DiskRep::flush`].
    fn fd(&self) -> Result<Arc<File>>;

    /// Invalidate cached handles; they are re-fetched lazily on next use.
    fn flush(&self) {}

    /// Obtain write access. Fails with [`Error::Unsupported`] for
    /// representations that cannot be signed in place.
    fn writer(&self) -> Result<Box<dyn Writer>> {
        Err(Error::Unsupported("writing to this representation"))
    }

    /// The immediately wrapped representation, for filter decorators.
    /// Terminal representations return `None`.
    fn base(&self) -> Option<&Arc<dyn DiskRep>> {
        None
    }

    // shorthands for the fixed well-known slots

    fn code_directory(&self) -> Result<Option<Vec<u8>>> {
        self.component(SpecialSlot::CodeDirectory)
    }

    fn signature(&self) -> Result<Option<Vec<u8>>> {
        self.component(SpecialSlot::Signature)
    }
}

/// Standard identification token: the code directory hash when the code is
/// signed, else a digest of the storage location and file identity.
pub(crate) fn identification_for(rep: &dyn DiskRep) -> Result<Vec<u8>> {
    if let Some(cd) = rep.code_directory()? {
        let mut hasher = Sha256::new();
        hasher.update(&cd);
        return Ok(hasher.finalize().to_vec());
    }
    file_identification(rep.canonical_path())
}

/// Digest over path and file identity, deterministic for a given storage
/// location and content generation.
pub(crate) fn file_identification(path: &Path) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(path)?;
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    if let Ok(mtime) = meta.modified() {
        if let Ok(age) = mtime.duration_since(std::time::UNIX_EPOCH) {
            hasher.update(age.as_secs().to_le_bytes());
            hasher.update(age.subsec_nanos().to_le_bytes());
        }
    }
    Ok(hasher.finalize().to_vec())
}
