//! Mach-O and universal (fat) binary image handles, parsed with goblin.

use std::fmt;
use std::fs::File;
use std::path::Path;

use goblin::mach::constants::cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86_64};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::{Mach, MachO};
use memmap2::Mmap;

use crate::{Error, Result};

/// Capability bits in the cpusubtype field, not part of the architecture proper.
const CPU_SUBTYPE_MASK: u32 = 0xff00_0000;

/// A processor architecture, as identified in Mach-O headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Architecture {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
}

impl Architecture {
    pub const ARM64: Architecture = Architecture::new(CPU_TYPE_ARM64, 0);
    pub const ARM64E: Architecture = Architecture::new(CPU_TYPE_ARM64, 2);
    pub const X86_64: Architecture = Architecture::new(CPU_TYPE_X86_64, 0);
    pub const ARM: Architecture = Architecture::new(CPU_TYPE_ARM, 0);

    pub const fn new(cpu_type: u32, cpu_subtype: u32) -> Self {
        Self {
            cpu_type,
            cpu_subtype,
        }
    }

    /// The architecture this program was built for, if it is one we model.
    pub fn native() -> Option<Architecture> {
        if cfg!(target_arch = "aarch64") {
            Some(Architecture::ARM64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "arm") {
            Some(Architecture::ARM)
        } else {
            None
        }
    }

    /// Slice selection order: native architecture first, then a fixed
    /// fallback order. Deterministic on any given build.
    pub fn preference_order() -> Vec<Architecture> {
        const FALLBACK: [Architecture; 3] = [
            Architecture::ARM64,
            Architecture::X86_64,
            Architecture::ARM,
        ];
        let mut order = Vec::with_capacity(4);
        if let Some(native) = Architecture::native() {
            order.push(native);
        }
        for arch in FALLBACK {
            if !order.contains(&arch) {
                order.push(arch);
            }
        }
        order
    }

    /// Whether a slice of architecture `other` satisfies this selector.
    /// A zero subtype selects any subtype of the same CPU type.
    pub fn matches(&self, other: &Architecture) -> bool {
        self.cpu_type == other.cpu_type
            && (self.cpu_subtype == 0 || self.cpu_subtype == other.cpu_subtype)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.cpu_type, self.cpu_subtype) {
            (CPU_TYPE_ARM64, 2) => write!(f, "arm64e"),
            (CPU_TYPE_ARM64, _) => write!(f, "arm64"),
            (CPU_TYPE_X86_64, _) => write!(f, "x86_64"),
            (CPU_TYPE_ARM, _) => write!(f, "arm"),
            (t, s) => write!(f, "cpu({t},{s})"),
        }
    }
}

/// One architecture slice of an image.
#[derive(Debug, Clone)]
pub struct Slice {
    /// Absolute file offset of the slice.
    pub offset: u64,
    /// Length of the slice in the file.
    pub size: u64,
    pub arch: Architecture,
    /// Embedded signature location within the slice, if present.
    pub code_signature: Option<(u32, u32)>,
    /// Length of the signed region: up to the embedded signature, else the
    /// whole slice.
    pub signed_length: u64,
}

/// A loaded Mach-O or universal binary image.
///
/// The file is memory-mapped and kept alive for the lifetime of the handle;
/// representations cache one of these and drop it on `flush()`.
pub struct Universal {
    data: Mmap,
    is_fat: bool,
    slices: Vec<Slice>,
}

impl Universal {
    /// Load and parse an image, enumerating every architecture slice.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = Self::map(path.as_ref())?;
        let mach = Mach::parse(&data).map_err(|e| Error::MachO(format!("{e}")))?;

        let (is_fat, slices) = match mach {
            Mach::Binary(macho) => {
                let slice = parse_slice(&macho, 0, data.len() as u64)?;
                (false, vec![slice])
            }
            Mach::Fat(fat) => {
                let mut slices = Vec::new();
                for (i, arch) in fat.iter_arches().enumerate() {
                    let arch = arch.map_err(|e| Error::MachO(format!("fat arch {i}: {e}")))?;
                    let offset = arch.offset as u64;
                    let size = arch.size as u64;
                    let end = offset
                        .checked_add(size)
                        .filter(|&e| e <= data.len() as u64)
                        .ok_or_else(|| {
                            Error::MachO(format!("fat arch {i} exceeds file bounds"))
                        })?;
                    let macho = MachO::parse(&data[offset as usize..end as usize], 0)
                        .map_err(|e| Error::MachO(format!("fat slice {i}: {e}")))?;
                    slices.push(parse_slice(&macho, offset, size)?);
                }
                if slices.is_empty() {
                    return Err(Error::MachO("empty universal binary".into()));
                }
                (true, slices)
            }
        };

        Ok(Self {
            data,
            is_fat,
            slices,
        })
    }

    /// Load an image restricted to the single slice at the given file
    /// offset. The resulting image reports only that architecture.
    pub fn at_offset(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let data = Self::map(path.as_ref())?;
        if offset >= data.len() as u64 {
            return Err(Error::MachO(format!(
                "slice offset {offset} beyond end of file"
            )));
        }
        let macho = MachO::parse(&data[offset as usize..], 0)
            .map_err(|e| Error::MachO(format!("at offset {offset}: {e}")))?;
        let remaining = data.len() as u64 - offset;
        let size = segment_extent(&macho).unwrap_or(remaining).min(remaining);
        let slice = parse_slice(&macho, offset, size)?;
        Ok(Self {
            data,
            is_fat: false,
            slices: vec![slice],
        })
    }

    fn map(path: &Path) -> Result<Mmap> {
        let file = File::open(path)?;
        // read-only mapping; the file is never mutated through it
        let data = unsafe { Mmap::map(&file)? };
        Ok(data)
    }

    pub fn is_fat(&self) -> bool {
        self.is_fat
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn architectures(&self) -> Vec<Architecture> {
        self.slices.iter().map(|s| s.arch).collect()
    }

    /// Find the slice matching an architecture selector.
    pub fn find(&self, arch: &Architecture) -> Option<&Slice> {
        self.slices.iter().find(|s| arch.matches(&s.arch))
    }

    /// Select a slice: the explicit architecture if given, otherwise the
    /// first hit in the preference order, otherwise the first slice.
    pub fn preferred_slice(&self, explicit: Option<&Architecture>) -> Result<&Slice> {
        if let Some(arch) = explicit {
            return self
                .find(arch)
                .ok_or_else(|| Error::MachO(format!("no slice for architecture {arch}")));
        }
        for arch in Architecture::preference_order() {
            if let Some(slice) = self.find(&arch) {
                return Ok(slice);
            }
        }
        self.slices
            .first()
            .ok_or_else(|| Error::MachO("image has no slices".into()))
    }

    /// The embedded signature SuperBlob bytes of a slice, if any.
    pub fn signature_blob(&self, slice: &Slice) -> Result<Option<&[u8]>> {
        let Some((dataoff, datasize)) = slice.code_signature else {
            return Ok(None);
        };
        let start = slice.offset + dataoff as u64;
        let end = start + datasize as u64;
        if end > self.data.len() as u64 {
            return Err(Error::MachO("embedded signature exceeds file bounds".into()));
        }
        Ok(Some(&self.data[start as usize..end as usize]))
    }
}

impl fmt::Debug for Universal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Universal")
            .field("is_fat", &self.is_fat)
            .field("slices", &self.slices)
            .finish()
    }
}

fn parse_slice(macho: &MachO, offset: u64, size: u64) -> Result<Slice> {
    let arch = Architecture::new(
        macho.header.cputype as u32,
        macho.header.cpusubtype as u32 & !CPU_SUBTYPE_MASK,
    );

    let mut code_signature = None;
    for lc in &macho.load_commands {
        if let CommandVariant::CodeSignature(cs) = lc.command {
            code_signature = Some((cs.dataoff, cs.datasize));
        }
    }

    let signed_length = match code_signature {
        Some((dataoff, _)) => (dataoff as u64).min(size),
        None => size,
    };

    Ok(Slice {
        offset,
        size,
        arch,
        code_signature,
        signed_length,
    })
}

/// Highest file extent covered by any segment, used to bound a slice parsed
/// at an explicit offset.
fn segment_extent(macho: &MachO) -> Option<u64> {
    macho
        .load_commands
        .iter()
        .filter_map(|lc| match &lc.command {
            CommandVariant::Segment64(seg) => Some(seg.fileoff + seg.filesize),
            CommandVariant::Segment32(seg) => Some(seg.fileoff as u64 + seg.filesize as u64),
            _ => None,
        })
        .max()
}
