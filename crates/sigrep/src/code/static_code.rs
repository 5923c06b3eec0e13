//! Static code: code at rest on disk, addressed through a representation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::codesign::SpecialSlot;
use crate::rep::{best_guess, DetachedRep, DiskRep};
use crate::{Error, Result};

use super::{Flags, Validator};

/// Code as it exists on disk, exposed as validated, addressable code:
/// code directory, signature, identification token, recommended identifier.
///
/// Many running-code nodes may share one static code; static code itself
/// has no notion of host or guest. The underlying representation can be
/// re-stacked under a detached-signature filter without altering the code's
/// identity, which is why it sits behind a lock.
pub struct StaticCode {
    rep: RwLock<Arc<dyn DiskRep>>,
}

impl StaticCode {
    pub fn new(rep: Arc<dyn DiskRep>) -> Self {
        Self {
            rep: RwLock::new(rep),
        }
    }

    /// Identify the code at a path through the format dispatcher.
    pub fn at_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(best_guess(path)?))
    }

    /// The current representation (possibly a detached-signature filter).
    pub fn rep(&self) -> Arc<dyn DiskRep> {
        self.rep.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>> {
        self.rep().component(slot)
    }

    pub fn code_directory(&self) -> Result<Option<Vec<u8>>> {
        self.rep().code_directory()
    }

    pub fn signature(&self) -> Result<Option<Vec<u8>>> {
        self.rep().signature()
    }

    /// Stable binary lookup token correlating running code to this static
    /// code.
    pub fn identification(&self) -> Result<Vec<u8>> {
        self.rep().identification()
    }

    /// Recommended signing identifier.
    pub fn identifier(&self) -> String {
        self.rep().recommended_identifier()
    }

    pub fn canonical_path(&self) -> PathBuf {
        self.rep().canonical_path().to_path_buf()
    }

    pub fn is_signed(&self) -> Result<bool> {
        Ok(self.code_directory()?.is_some())
    }

    /// Whether a detached signature is currently attached.
    pub fn is_detached(&self) -> bool {
        self.rep().base().is_some()
    }

    /// Substitute signature data from a detached store, leaving code
    /// identity untouched. Replaces any previously attached signature.
    pub fn attach_detached_signature(&self, detached: &[u8]) -> Result<()> {
        // stack on the terminal representation, never on another filter
        let mut terminal = self.rep();
        while let Some(base) = terminal.base() {
            let base = base.clone();
            terminal = base;
        }
        let filtered: Arc<dyn DiskRep> = Arc::new(DetachedRep::new(terminal, detached)?);
        *self.rep.write().unwrap_or_else(|e| e.into_inner()) = filtered;
        Ok(())
    }

    /// Drop any attached detached signature, back to the terminal
    /// representation.
    pub fn detach_signature(&self) {
        let mut terminal = self.rep();
        while let Some(base) = terminal.base() {
            let base = base.clone();
            terminal = base;
        }
        *self.rep.write().unwrap_or_else(|e| e.into_inner()) = terminal;
    }

    /// Run validation through the external evaluator. Unsigned code fails
    /// before the evaluator is consulted.
    pub fn validate(&self, validator: &dyn Validator, flags: Flags) -> Result<()> {
        if !self.is_signed()? {
            return Err(Error::Unsigned);
        }
        validator.validate(self, flags)
    }
}

impl std::fmt::Debug for StaticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCode")
            .field("path", &self.canonical_path())
            .field("format", &self.rep().format())
            .finish()
    }
}
