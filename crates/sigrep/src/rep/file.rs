//! Flat-file representation: code with no recognized native format.
//!
//! The whole file is the signed region, hashed monolithically. Signing
//! components live in a sidecar SuperBlob next to the file, since the file
//! itself has nowhere to embed them.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::codesign::constants::CSMAGIC_EMBEDDED_SIGNATURE;
use crate::codesign::superblob::{build_superblob, BlobEntry, SuperBlob};
use crate::codesign::SpecialSlot;
use crate::rep::writer::{Writer, WRITER_LAST_RESORT};
use crate::rep::{DiskRep, MONOLITHIC_PAGE_SIZE};
use crate::Result;

/// Extension appended to the code file's name for the component sidecar.
const SIDECAR_SUFFIX: &str = ".csig";

pub struct FileRep {
    path: PathBuf,
    fd: Mutex<Option<Arc<File>>>,
}

impl FileRep {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::metadata(&path)?;
        Ok(Self {
            path,
            fd: Mutex::new(None),
        })
    }

    /// Where this file's signing components are stored.
    pub fn sidecar_path(&self) -> PathBuf {
        let mut name = OsString::from(
            self.path
                .file_name()
                .unwrap_or(self.path.as_os_str()),
        );
        name.push(SIDECAR_SUFFIX);
        self.path.with_file_name(name)
    }

    fn read_sidecar(&self) -> Result<Option<SuperBlob>> {
        match std::fs::read(self.sidecar_path()) {
            Ok(bytes) => Ok(Some(SuperBlob::parse(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl DiskRep for FileRep {
    fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>> {
        match self.read_sidecar()? {
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

    fn page_size(&self) -> usize {
        MONOLITHIC_PAGE_SIZE
    }

    fn signing_limit(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn format(&self) -> String {
        "flat file".to_string()
    }

    fn modified_files(&self) -> Vec<PathBuf> {
        vec![self.sidecar_path()]
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
    }

    fn writer(&self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(FileRepWriter {
            sidecar: self.sidecar_path(),
            components: BTreeMap::new(),
        }))
    }
}

/// Writer of last resort: stores everything in the sidecar, replacing any
/// previous component set on flush.
struct FileRepWriter {
    sidecar: PathBuf,
    components: BTreeMap<SpecialSlot, Vec<u8>>,
}

impl Writer for FileRepWriter {
    fn component(&mut self, slot: SpecialSlot, data: &[u8]) -> Result<()> {
        self.components.insert(slot, data.to_vec());
        Ok(())
    }

    fn attributes(&self) -> u32 {
        WRITER_LAST_RESORT
    }

    fn remove(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.sidecar) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        // BTreeMap iteration gives canonical slot order
        let entries: Vec<BlobEntry> = self
            .components
            .iter()
            .map(|(slot, data)| BlobEntry::new(slot.raw(), data.clone()))
            .collect();
        let bytes = build_superblob(CSMAGIC_EMBEDDED_SIGNATURE, &entries);

        // write-then-rename so readers never see a torn sidecar
        let tmp = self.sidecar.with_extension("csig.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.sidecar)?;
        Ok(())
    }
}
