//! Filter representation for detached signatures.
//!
//! A [`DetachedRep`] is stacked on top of another representation and used in
//! its place: component fetches are served exclusively from a detached
//! signature container, while every code-dependent operation devolves on the
//! underlying representation. The decorator retains its base, so the base
//! lives at least as long as the filter stacked on it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codesign::{SpecialSlot, SuperBlob};
use crate::macho::{Architecture, Universal};
use crate::rep::DiskRep;
use crate::requirement::Requirements;
use crate::resources::{ResourceBuilder, ResourceRules};
use crate::Result;

pub struct DetachedRep {
    base: Arc<dyn DiskRep>,
    blob: SuperBlob,
}

impl DetachedRep {
    /// Stack a detached signature container on top of `base`.
    pub fn new(base: Arc<dyn DiskRep>, detached: &[u8]) -> Result<Self> {
        let blob = SuperBlob::parse(detached)?;
        Ok(Self { base, blob })
    }
}

impl DiskRep for DetachedRep {
    // signature-bearing lookups come only from the detached container
    fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.component(slot).map(|b| b.to_vec()))
    }

    fn base(&self) -> Option<&Arc<dyn DiskRep>> {
        Some(&self.base)
    }

    // the rest devolves on the underlying representation

    fn identification(&self) -> Result<Vec<u8>> {
        self.base.identification()
    }

    fn main_executable_path(&self) -> &Path {
        self.base.main_executable_path()
    }

    fn canonical_path(&self) -> &Path {
        self.base.canonical_path()
    }

    fn recommended_identifier(&self) -> String {
        self.base.recommended_identifier()
    }

    fn resources_root_path(&self) -> Option<PathBuf> {
        self.base.resources_root_path()
    }

    fn default_resource_rules(&self) -> Option<ResourceRules> {
        self.base.default_resource_rules()
    }

    fn adjust_resources(&self, builder: &mut ResourceBuilder) -> Result<()> {
        self.base.adjust_resources(builder)
    }

    fn default_requirements(&self, arch: &Architecture) -> Option<Requirements> {
        self.base.default_requirements(arch)
    }

    fn main_executable_image(&self) -> Result<Option<Arc<Universal>>> {
        self.base.main_executable_image()
    }

    fn page_size(&self) -> usize {
        self.base.page_size()
    }

    fn signing_base(&self) -> u64 {
        self.base.signing_base()
    }

    fn signing_limit(&self) -> Result<u64> {
        self.base.signing_limit()
    }

    fn format(&self) -> String {
        self.base.format()
    }

    fn modified_files(&self) -> Vec<PathBuf> {
        self.base.modified_files()
    }

    fn fd(&self) -> Result<Arc<File>> {
        self.base.fd()
    }

    fn flush(&self) {
        self.base.flush()
    }

    // writer() deliberately not forwarded: a detached store cannot be
    // signed in place, so the default unsupported error stands
}
