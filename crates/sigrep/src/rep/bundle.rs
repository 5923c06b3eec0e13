//! Bundle representation: a directory with an information property list,
//! a main executable located by it, and sealable resources around them.
//!
//! Recognizes the nested layout (`Contents/Info.plist`, executable under
//! `Contents/MacOS/`) and the flat layout (`Info.plist` and the executable
//! at the bundle root). Everything bound to the executable delegates to a
//! nested representation of the executable file.

use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use plist::{Dictionary, Value};

use crate::codesign::SpecialSlot;
use crate::macho::{Architecture, Universal};
use crate::rep::guess::{best_file_guess, Context};
use crate::rep::writer::Writer;
use crate::rep::DiskRep;
use crate::requirement::Requirements;
use crate::resources::{ResourceBuilder, ResourceRules};
use crate::{Error, Result};

const SIGNATURE_DIR: &str = "_CodeSignature";
const CODE_RESOURCES: &str = "CodeResources";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// `Contents/Info.plist`, executable in `Contents/MacOS/`.
    Nested,
    /// `Info.plist` and executable at the bundle root.
    Flat,
}

pub struct BundleRep {
    root: PathBuf,
    layout: Layout,
    info: Dictionary,
    exec_path: PathBuf,
    exec_rep: Arc<dyn DiskRep>,
}

impl BundleRep {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let layout = if root.join("Contents/Info.plist").is_file() {
            Layout::Nested
        } else if root.join("Info.plist").is_file() {
            Layout::Flat
        } else {
            return Err(Error::BadBundleFormat(format!(
                "{}: no Info.plist found",
                root.display()
            )));
        };

        let info_path = match layout {
            Layout::Nested => root.join("Contents/Info.plist"),
            Layout::Flat => root.join("Info.plist"),
        };
        let info = Value::from_file(&info_path)?
            .into_dictionary()
            .ok_or_else(|| {
                Error::BadBundleFormat(format!("{}: Info.plist is not a dictionary", root.display()))
            })?;

        let exec_name = info
            .get("CFBundleExecutable")
            .and_then(Value::as_string)
            .ok_or_else(|| {
                Error::NoMainExecutable(format!("{}: no CFBundleExecutable", root.display()))
            })?;
        let exec_path = match layout {
            Layout::Nested => root.join("Contents/MacOS").join(exec_name),
            Layout::Flat => root.join(exec_name),
        };
        if !exec_path.is_file() {
            return Err(Error::NoMainExecutable(format!(
                "{}: {exec_name} does not exist",
                root.display()
            )));
        }

        let exec_rep = best_file_guess(&exec_path, &Context::default())?;

        Ok(Self {
            root,
            layout,
            info,
            exec_path,
            exec_rep,
        })
    }

    /// The directory holding bundle-level files: `Contents/` for nested
    /// bundles, the bundle root for flat ones.
    pub fn support_directory(&self) -> PathBuf {
        match self.layout {
            Layout::Nested => self.root.join("Contents"),
            Layout::Flat => self.root.clone(),
        }
    }

    pub fn signature_directory(&self) -> PathBuf {
        self.support_directory().join(SIGNATURE_DIR)
    }

    pub fn code_resources_path(&self) -> PathBuf {
        self.signature_directory().join(CODE_RESOURCES)
    }

    pub fn info(&self) -> &Dictionary {
        &self.info
    }

    fn info_path(&self) -> PathBuf {
        self.support_directory().join("Info.plist")
    }

    fn exec_relative(&self) -> String {
        self.exec_path
            .strip_prefix(self.support_directory())
            .unwrap_or(&self.exec_path)
            .to_string_lossy()
            .into_owned()
    }

    fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl DiskRep for BundleRep {
    fn component(&self, slot: SpecialSlot) -> Result<Option<Vec<u8>>> {
        match slot {
            SpecialSlot::ResourceDir => Self::read_optional(&self.code_resources_path()),
            SpecialSlot::Info => Self::read_optional(&self.info_path()),
            _ => self.exec_rep.component(slot),
        }
    }

    fn identification(&self) -> Result<Vec<u8>> {
        self.exec_rep.identification()
    }

    fn main_executable_path(&self) -> &Path {
        &self.exec_path
    }

    fn canonical_path(&self) -> &Path {
        &self.root
    }

    fn recommended_identifier(&self) -> String {
        self.info
            .get("CFBundleIdentifier")
            .and_then(Value::as_string)
            .map(str::to_owned)
            .unwrap_or_else(|| self.exec_rep.recommended_identifier())
    }

    fn resources_root_path(&self) -> Option<PathBuf> {
        Some(self.support_directory())
    }

    fn default_resource_rules(&self) -> Option<ResourceRules> {
        Some(ResourceRules::standard())
    }

    fn adjust_resources(&self, builder: &mut ResourceBuilder) -> Result<()> {
        // the seal must not cover the signature itself, the executable
        // (sealed through the code directory), or re-signable profiles
        builder.exclude(SIGNATURE_DIR);
        builder.exclude(self.exec_relative());
        builder.exclude("embedded.mobileprovision");
        Ok(())
    }

    fn default_requirements(&self, arch: &Architecture) -> Option<Requirements> {
        self.exec_rep.default_requirements(arch)
    }

    fn main_executable_image(&self) -> Result<Option<Arc<Universal>>> {
        self.exec_rep.main_executable_image()
    }

    fn page_size(&self) -> usize {
        self.exec_rep.page_size()
    }

    fn signing_base(&self) -> u64 {
        self.exec_rep.signing_base()
    }

    fn signing_limit(&self) -> Result<u64> {
        self.exec_rep.signing_limit()
    }

    fn format(&self) -> String {
        format!("bundle with {}", self.exec_rep.format())
    }

    fn modified_files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.code_resources_path()];
        files.extend(self.exec_rep.modified_files());
        files
    }

    fn fd(&self) -> Result<Arc<File>> {
        self.exec_rep.fd()
    }

    fn flush(&self) {
        self.exec_rep.flush();
    }

    fn writer(&self) -> Result<Box<dyn Writer>> {
        Ok(Box::new(BundleRepWriter {
            signature_dir: self.signature_directory(),
            code_resources: self.code_resources_path(),
            resource_seal: None,
            exec_writer: self.exec_rep.writer()?,
        }))
    }
}

/// Routes the resource seal to the bundle's signature directory and every
/// other component to the executable's own writer.
struct BundleRepWriter {
    signature_dir: PathBuf,
    code_resources: PathBuf,
    resource_seal: Option<Vec<u8>>,
    exec_writer: Box<dyn Writer>,
}

impl Writer for BundleRepWriter {
    fn component(&mut self, slot: SpecialSlot, data: &[u8]) -> Result<()> {
        match slot {
            SpecialSlot::ResourceDir => {
                self.resource_seal = Some(data.to_vec());
                Ok(())
            }
            _ => self.exec_writer.component(slot, data),
        }
    }

    fn attributes(&self) -> u32 {
        self.exec_writer.attributes()
    }

    fn remove(&mut self) -> Result<()> {
        match std::fs::remove_dir_all(&self.signature_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.exec_writer.remove()
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(seal) = self.resource_seal.take() {
            std::fs::create_dir_all(&self.signature_dir)?;
            std::fs::write(&self.code_resources, seal)?;
        }
        self.exec_writer.flush()
    }
}
