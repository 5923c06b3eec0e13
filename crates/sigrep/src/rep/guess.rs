//! The canonical "best guess" heuristic: classify a filesystem path and
//! construct the matching disk representation.
//!
//! Classification is read-only and deterministic. A path that does not
//! exist or cannot be read fails; a path that exists but matches no richer
//! shape falls back to the flat-file representation rather than guessing.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use goblin::mach::fat::FAT_MAGIC;
use goblin::mach::header::{MH_MAGIC, MH_MAGIC_64};
use tracing::debug;

use crate::macho::Architecture;
use crate::rep::bundle::BundleRep;
use crate::rep::file::FileRep;
use crate::rep::macho::MachORep;
use crate::rep::DiskRep;
use crate::{Error, Result};

/// Optional constraints on representation choice.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Explicit architecture for universal binaries.
    pub arch: Option<Architecture>,
    /// Explicit file offset; forces single-slice Mach-O treatment.
    pub offset: Option<u64>,
    /// Only consider single-file representations, even for directories
    /// that would qualify as bundles.
    pub file_only: bool,
}

/// Classify a path with default context.
pub fn best_guess(path: impl AsRef<Path>) -> Result<Arc<dyn DiskRep>> {
    best_guess_with(path, &Context::default())
}

/// Classify a path under the given context.
pub fn best_guess_with(path: impl AsRef<Path>, ctx: &Context) -> Result<Arc<dyn DiskRep>> {
    let path = path.as_ref();

    // an explicit offset overrides all detection
    if let Some(offset) = ctx.offset {
        debug!(path = %path.display(), offset, "explicit offset, Mach-O slice");
        return Ok(Arc::new(MachORep::at_offset(path, offset)?));
    }

    let meta = std::fs::metadata(path)?;

    if meta.is_dir() {
        if !ctx.file_only {
            match BundleRep::new(path) {
                Ok(bundle) => {
                    debug!(path = %path.display(), "recognized bundle layout");
                    return Ok(Arc::new(bundle));
                }
                // unmarked directories fall through to flat treatment;
                // a marked-but-broken bundle is a hard error
                Err(Error::BadBundleFormat(reason)) => {
                    debug!(path = %path.display(), %reason, "not a bundle, treating as flat");
                }
                Err(e) => return Err(e),
            }
        }
        return Ok(Arc::new(FileRep::new(path)?));
    }

    if probe_macho_magic(path)? {
        debug!(path = %path.display(), "Mach-O magic found");
        let rep = match ctx.arch {
            Some(arch) => MachORep::with_architecture(path, arch)?,
            None => MachORep::new(path)?,
        };
        return Ok(Arc::new(rep));
    }

    debug!(path = %path.display(), "no known format, flat file");
    Ok(Arc::new(FileRep::new(path)?))
}

/// Classify with bundle detection suppressed (context's `file_only` forced).
pub fn best_file_guess(path: impl AsRef<Path>, ctx: &Context) -> Result<Arc<dyn DiskRep>> {
    let ctx = Context {
        file_only: true,
        ..ctx.clone()
    };
    best_guess_with(path, &ctx)
}

/// Classify a Mach-O slice at the given file offset only.
pub fn best_guess_at_offset(path: impl AsRef<Path>, offset: u64) -> Result<Arc<dyn DiskRep>> {
    Ok(Arc::new(MachORep::at_offset(path.as_ref(), offset)?))
}

/// Whether the file leads with a Mach-O or universal-binary magic, in
/// either byte order.
fn probe_macho_magic(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 4];
    let mut read = 0;
    while read < 4 {
        match file.read(&mut magic[read..])? {
            0 => return Ok(false), // too short to carry any magic
            n => read += n,
        }
    }
    let le = u32::from_le_bytes(magic);
    let be = u32::from_be_bytes(magic);
    const KNOWN: [u32; 3] = [MH_MAGIC, MH_MAGIC_64, FAT_MAGIC];
    Ok(KNOWN.contains(&le) || KNOWN.contains(&be))
}
