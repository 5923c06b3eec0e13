//! Mach-O representation: a thin binary, or one architecture slice of a
//! universal binary selected by architecture or explicit file offset.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use goblin::mach::Mach;

use crate::codesign::constants::CSMAGIC_EMBEDDED_SIGNATURE;
use crate::codesign::superblob::{build_superblob, BlobEntry, SuperBlob};
use crate::codesign::SpecialSlot;
use crate::macho::image::{Architecture, Slice, Universal};
use crate::macho::writer as embedder;
use crate::rep::writer::{Writer, WRITER_NO_GLOBAL};
use crate::rep::{DiskRep, SEGMENTED_PAGE_SIZE};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum Selector {
    /// Preference-ordered slice choice.
    Auto,
    /// Explicit architecture.
    Arch(Architecture),
    /// Explicit file offset; the file is unconditionally treated as a
    /// single slice at that offset.
    Offset(u64),
}

pub struct MachORep {
    path: PathBuf,
    selector: Selector,
    fd: Mutex<Option<Arc<File>>>,
    image: Mutex<Option<Arc<Universal>>>,
}

impl MachORep {
    /// Represent a Mach-O file, choosing a slice by preference order if it
    /// is universal.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_selector(path.as_ref(), Selector::Auto)
    }

    /// Represent the slice for an explicit architecture.
    pub fn with_architecture(path: impl AsRef<Path>, arch: Architecture) -> Result<Self> {
        Self::with_selector(path.as_ref(), Selector::Arch(arch))
    }

    /// Represent the single slice at an explicit file offset.
    pub fn at_offset(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        Self::with_selector(path.as_ref(), Selector::Offset(offset))
    }

    fn with_selector(path: &Path, selector: Selector) -> Result<Self> {
        let rep = Self {
            path: path.to_path_buf(),
            selector,
            fd: Mutex::new(None),
            image: Mutex::new(None),
        };
        // construction must fail if the image cannot be loaded or the
        // requested slice is missing
        let image = rep.image()?;
        rep.selected(&image)?;
        Ok(rep)
    }

    fn image(&self) -> Result<Arc<Universal>> {
        let mut cache = self.image.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(image) = cache.as_ref() {
            return Ok(image.clone());
        }
        let image = Arc::new(match self.selector {
            Selector::Offset(offset) => Universal::at_offset(&self.path, offset)?,
            _ => Universal::open(&self.path)?,
        });
        *cache = Some(image.clone());
        Ok(image)
    }

    fn selected<'a>(&self, image: &'a Universal) -> Result<&'a Slice> {
        match self.selector {
            Selector::Offset(_) => image
                .slices()
                .first()
                .ok_or_else(|| Error::MachO("image has no slices".into())),
            Selector::Arch(arch) => image.preferred_slice(Some(&arch)),
            Selector::Auto => image.preferred_slice(None),
        }
    }

    fn embedded_signature(&self) -> Result<Option<SuperBlob>> {
        let image = self.image()?;
        let slice = self.selected(&image)?;
        match image.signature_blob(slice)? {
            Some(bytes) => Ok(Some(SuperBlob::parse(bytes)?)),
            None => Ok(None),
        }
    }
}

impl DiskRep for MachORep {
    fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>> {
        match self.embedded_signature()? {
            Some(blob) => Ok(blob.component(slot).map(|b| b.to_vec())),
            None => Ok(None),
        }
    }

    fn identification(&self) -> Result<Vec<u8>> {
        super::identification_for(self)
    }

    fn main_executable_path(&self) -> &Path {
        &self.path
    }

    fn canonical_path(&self) -> &Path {
        &self.path
    }

    fn recommended_identifier(&self) -> String {
        self.path
            .file_stem()
            .or_else(|| self.path.file_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "code".to_string())
    }

    fn main_executable_image(&self) -> Result<Option<Arc<Universal>>> {
        Ok(Some(self.image()?))
    }

    fn page_size(&self) -> usize {
        SEGMENTED_PAGE_SIZE
    }

    fn signing_base(&self) -> u64 {
        let Ok(image) = self.image() else { return 0 };
        self.selected(&image).map(|s| s.offset).unwrap_or(0)
    }

    fn signing_limit(&self) -> Result<u64> {
        let image = self.image()?;
        Ok(self.selected(&image)?.signed_length)
    }

    fn format(&self) -> String {
        match self.image() {
            Ok(image) => {
                let arch = self
                    .selected(&image)
                    .map(|s| s.arch.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                if image.is_fat() {
                    format!("Mach-O universal ({arch})")
                } else {
                    format!("Mach-O thin ({arch})")
                }
            }
            Err(_) => "Mach-O".to_string(),
        }
    }

    fn fd(&self) -> Result<Arc<File>> {
        let mut cache = self.fd.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(fd) = cache.as_ref() {
            return Ok(fd.clone());
        }
        let fd = Arc::new(File::open(&self.path)?);
        *cache = Some(fd.clone());
        Ok(fd)
    }

    fn flush(&self) {
        *self.fd.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.image.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn writer(&self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(MachORepWriter {
            path: self.path.clone(),
            selector: self.selector,
            components: BTreeMap::new(),
        }))
    }
}

/// Embeds the buffered components as a signature SuperBlob in the selected
/// slice. Per-architecture storage only.
struct MachORepWriter {
    path: PathBuf,
    selector: Selector,
    components: BTreeMap<SpecialSlot, Vec<u8>>,
}

impl MachORepWriter {
    /// Which fat slice receives the signature; `None` for thin binaries.
    fn resolve_slice_index(&self, data: &[u8]) -> Result<Option<usize>> {
        let mach = Mach::parse(data).map_err(|e| Error::MachO(format!("{e}")))?;
        let fat = match mach {
            Mach::Binary(_) => return Ok(None),
            Mach::Fat(fat) => fat,
        };
        let arches: Vec<_> = fat
            .iter_arches()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::MachO(format!("{e}")))?;

        let found = match self.selector {
            Selector::Offset(offset) => arches
                .iter()
                .position(|a| a.offset as u64 == offset)
                .ok_or_else(|| Error::MachO(format!("no slice at offset {offset}")))?,
            Selector::Arch(arch) => arches
                .iter()
                .position(|a| {
                    arch.matches(&Architecture::new(
                        a.cputype as u32,
                        a.cpusubtype as u32 & 0x00ff_ffff,
                    ))
                })
                .ok_or_else(|| Error::MachO(format!("no slice for architecture {arch}")))?,
            Selector::Auto => {
                let slice_archs: Vec<Architecture> = arches
                    .iter()
                    .map(|a| Architecture::new(a.cputype as u32, a.cpusubtype as u32 & 0x00ff_ffff))
                    .collect();
                Architecture::preference_order()
                    .iter()
                    .find_map(|pref| slice_archs.iter().position(|s| pref.matches(s)))
                    .unwrap_or(0)
            }
        };
        Ok(Some(found))
    }
}

impl Writer for MachORepWriter {
    fn component(&mut self, slot: SpecialSlot, data: &[u8]) -> Result<()> {
        self.components.insert(slot, data.to_vec());
        Ok(())
    }

    fn attributes(&self) -> u32 {
        WRITER_NO_GLOBAL
    }

    fn remove(&mut self) -> Result<()> {
        let data = std::fs::read(&self.path)?;
        let stripped = embedder::strip(&data)?;
        std::fs::write(&self.path, stripped)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let entries: Vec<BlobEntry> = self
            .components
            .iter()
            .map(|(slot, data)| BlobEntry::new(slot.raw(), data.clone()))
            .collect();
        let blob = build_superblob(CSMAGIC_EMBEDDED_SIGNATURE, &entries);

        let data = std::fs::read(&self.path)?;
        let index = self.resolve_slice_index(&data)?;
        let signed = embedder::embed(&data, index, &blob)?;
        std::fs::write(&self.path, signed)?;
        Ok(())
    }
}
