//! Embedding and stripping signature blobs in Mach-O binaries.
//!
//! Handles the storage side of signing a Mach-O image:
//! - finding or creating the LC_CODE_SIGNATURE load command
//! - growing or shrinking the __LINKEDIT segment around the signature
//! - appending the SuperBlob at a 16-byte-aligned offset
//! - rebuilding universal (fat) headers when one slice changes size

use goblin::mach::fat::FatArch;
use goblin::mach::header::{MH_CIGAM_64, MH_MAGIC_64};
use goblin::mach::load_command::{CommandVariant, LinkeditDataCommand, SegmentCommand64};
use goblin::mach::{Mach, MachO, MultiArch};

use crate::{Error, Result};

const LC_CODE_SIGNATURE: u32 = 0x1d;
const LINKEDIT_DATA_COMMAND_SIZE: u32 = 16;

/// Embed a signature SuperBlob into a binary.
///
/// For a thin binary `slice_index` must be `None`. For a universal binary it
/// names the slice receiving the signature; the other slices are carried
/// over unchanged and the fat header is rebuilt with recalculated offsets.
pub fn embed(data: &[u8], slice_index: Option<usize>, signature: &[u8]) -> Result<Vec<u8>> {
    let mach = Mach::parse(data).map_err(|e| Error::MachO(format!("{e}")))?;
    match mach {
        Mach::Binary(macho) => {
            if slice_index.unwrap_or(0) != 0 {
                return Err(Error::MachO("thin binary has a single slice".into()));
            }
            embed_single(data, &macho, signature)
        }
        Mach::Fat(fat) => {
            let index = slice_index
                .ok_or_else(|| Error::MachO("universal binary needs a slice selection".into()))?;
            embed_in_fat(data, &fat, index, signature)
        }
    }
}

/// Remove the embedded signature from a thin binary: drop the
/// LC_CODE_SIGNATURE command, shrink __LINKEDIT, truncate the file.
/// A binary without a signature is returned unchanged.
pub fn strip(data: &[u8]) -> Result<Vec<u8>> {
    let mach = Mach::parse(data).map_err(|e| Error::MachO(format!("{e}")))?;
    let macho = match mach {
        Mach::Binary(m) => m,
        Mach::Fat(_) => {
            return Err(Error::Unsupported(
                "signature removal from universal binaries",
            ))
        }
    };
    require_64bit(&macho)?;

    let mut code_sig: Option<(usize, LinkeditDataCommand)> = None;
    let mut linkedit: Option<(usize, SegmentCommand64)> = None;
    let mut load_cmds_end = 0usize;
    for lc in &macho.load_commands {
        load_cmds_end = load_cmds_end.max(lc.offset + lc.command.cmdsize());
        match &lc.command {
            CommandVariant::CodeSignature(cs) => code_sig = Some((lc.offset, *cs)),
            CommandVariant::Segment64(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                linkedit = Some((lc.offset, *seg));
            }
            _ => {}
        }
    }

    let Some((cmd_offset, cs)) = code_sig else {
        return Ok(data.to_vec());
    };
    let truncate_at = (cs.dataoff as usize).min(data.len());

    let mut out = data[..truncate_at].to_vec();
    let be = is_big_endian(&out);

    // shift the remaining load commands over the removed one
    let removed = LINKEDIT_DATA_COMMAND_SIZE as usize;
    out.copy_within(cmd_offset + removed..load_cmds_end, cmd_offset);
    out[load_cmds_end - removed..load_cmds_end].fill(0);

    let ncmds = read_u32(&out, 16, be);
    let sizeofcmds = read_u32(&out, 20, be);
    write_u32(&mut out, 16, ncmds - 1, be);
    write_u32(&mut out, 20, sizeofcmds - LINKEDIT_DATA_COMMAND_SIZE, be);

    if let Some((seg_offset, seg)) = linkedit {
        // the segment command may itself have moved
        let seg_offset = if seg_offset > cmd_offset {
            seg_offset - removed
        } else {
            seg_offset
        };
        let new_filesize = (truncate_at as u64).saturating_sub(seg.fileoff);
        update_linkedit_segment(&mut out, seg_offset, new_filesize);
    }

    Ok(out)
}

fn embed_in_fat(
    data: &[u8],
    fat: &MultiArch,
    target: usize,
    signature: &[u8],
) -> Result<Vec<u8>> {
    let arches: Vec<FatArch> = fat
        .iter_arches()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::MachO(format!("{e}")))?;
    if arches.is_empty() {
        return Err(Error::MachO("empty universal binary".into()));
    }
    if target >= arches.len() {
        return Err(Error::MachO(format!(
            "slice index {target} out of range ({} slices)",
            arches.len()
        )));
    }

    let mut slices: Vec<Vec<u8>> = Vec::with_capacity(arches.len());
    for (i, arch) in arches.iter().enumerate() {
        let offset = arch.offset as usize;
        let size = arch.size as usize;
        if offset + size > data.len() {
            return Err(Error::MachO(format!("fat arch {i} exceeds file bounds")));
        }
        let slice_data = &data[offset..offset + size];
        if i == target {
            let macho = MachO::parse(slice_data, 0)
                .map_err(|e| Error::MachO(format!("fat slice {i}: {e}")))?;
            slices.push(embed_single(slice_data, &macho, signature)?);
        } else {
            slices.push(slice_data.to_vec());
        }
    }

    // recompute offsets: header, then slices at their declared alignment
    let fat_header_size = 8 + arches.len() * 20;
    let mut current = align_to(fat_header_size, 0x4000);
    let mut placements: Vec<(u32, u32)> = Vec::with_capacity(arches.len());
    for (i, slice) in slices.iter().enumerate() {
        let alignment = 1usize << arches[i].align;
        current = align_to(current, alignment);
        placements.push((current as u32, slice.len() as u32));
        current += slice.len();
    }

    let mut out = vec![0u8; current];
    out[0..4].copy_from_slice(&0xCAFE_BABEu32.to_be_bytes());
    out[4..8].copy_from_slice(&(arches.len() as u32).to_be_bytes());
    for (i, arch) in arches.iter().enumerate() {
        let entry = 8 + i * 20;
        let (offset, size) = placements[i];
        out[entry..entry + 4].copy_from_slice(&(arch.cputype as u32).to_be_bytes());
        out[entry + 4..entry + 8].copy_from_slice(&(arch.cpusubtype as u32).to_be_bytes());
        out[entry + 8..entry + 12].copy_from_slice(&offset.to_be_bytes());
        out[entry + 12..entry + 16].copy_from_slice(&size.to_be_bytes());
        out[entry + 16..entry + 20].copy_from_slice(&arch.align.to_be_bytes());
    }
    for (i, slice) in slices.iter().enumerate() {
        let (offset, _) = placements[i];
        out[offset as usize..offset as usize + slice.len()].copy_from_slice(slice);
    }

    Ok(out)
}

fn embed_single(data: &[u8], macho: &MachO, signature: &[u8]) -> Result<Vec<u8>> {
    require_64bit(macho)?;

    let mut code_sig: Option<(usize, LinkeditDataCommand)> = None;
    let mut linkedit: Option<(usize, SegmentCommand64)> = None;
    let mut load_cmds_end = 0usize;
    for lc in &macho.load_commands {
        load_cmds_end = load_cmds_end.max(lc.offset + lc.command.cmdsize());
        match &lc.command {
            CommandVariant::CodeSignature(cs) => code_sig = Some((lc.offset, *cs)),
            CommandVariant::Segment64(seg) if seg.segname.starts_with(b"__LINKEDIT") => {
                linkedit = Some((lc.offset, *seg));
            }
            _ => {}
        }
    }

    let code_length = match code_sig {
        Some((_, cs)) => cs.dataoff as usize,
        None => segment_end(macho, data.len()),
    };

    let sig_offset = align_to(code_length, 16);
    let mut out = Vec::with_capacity(sig_offset + signature.len());
    out.extend_from_slice(&data[..code_length.min(data.len())]);
    out.resize(sig_offset, 0);
    out.extend_from_slice(signature);

    if let Some((offset, _)) = code_sig {
        update_linkedit_data_command(&mut out, offset, sig_offset as u32, signature.len() as u32);
    } else {
        add_code_signature_command(
            macho,
            &mut out,
            load_cmds_end,
            sig_offset as u32,
            signature.len() as u32,
        )?;
    }

    if let Some((offset, seg)) = linkedit {
        let end = (sig_offset + signature.len()) as u64;
        if end > seg.fileoff + seg.filesize {
            update_linkedit_segment(&mut out, offset, end - seg.fileoff);
        }
    }

    Ok(out)
}

fn require_64bit(macho: &MachO) -> Result<()> {
    if macho.header.magic == MH_MAGIC_64 || macho.header.magic == MH_CIGAM_64 {
        Ok(())
    } else {
        Err(Error::MachO("32-bit Mach-O binaries not supported".into()))
    }
}

/// End of the last segment: where the signature goes when none exists yet.
fn segment_end(macho: &MachO, file_size: usize) -> usize {
    let max_end = macho
        .load_commands
        .iter()
        .filter_map(|lc| match &lc.command {
            CommandVariant::Segment64(seg) => Some(seg.fileoff + seg.filesize),
            CommandVariant::Segment32(seg) => Some(seg.fileoff as u64 + seg.filesize as u64),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    if max_end == 0 {
        file_size
    } else {
        max_end as usize
    }
}

fn update_linkedit_data_command(data: &mut [u8], offset: usize, dataoff: u32, datasize: u32) {
    let be = is_big_endian(data);
    write_u32(data, offset + 8, dataoff, be);
    write_u32(data, offset + 12, datasize, be);
}

fn add_code_signature_command(
    macho: &MachO,
    data: &mut [u8],
    load_cmds_end: usize,
    dataoff: u32,
    datasize: u32,
) -> Result<()> {
    // the new command must fit before the first segment's file content
    let first_segment = macho
        .load_commands
        .iter()
        .filter_map(|lc| match &lc.command {
            CommandVariant::Segment64(seg) if seg.fileoff > 0 => Some(seg.fileoff as usize),
            _ => None,
        })
        .min()
        .unwrap_or(4096);
    if load_cmds_end + LINKEDIT_DATA_COMMAND_SIZE as usize > first_segment {
        return Err(Error::MachO(
            "no room for LC_CODE_SIGNATURE in load commands area".into(),
        ));
    }

    let be = is_big_endian(data);
    write_u32(data, load_cmds_end, LC_CODE_SIGNATURE, be);
    write_u32(data, load_cmds_end + 4, LINKEDIT_DATA_COMMAND_SIZE, be);
    write_u32(data, load_cmds_end + 8, dataoff, be);
    write_u32(data, load_cmds_end + 12, datasize, be);

    let ncmds = read_u32(data, 16, be);
    let sizeofcmds = read_u32(data, 20, be);
    write_u32(data, 16, ncmds + 1, be);
    write_u32(data, 20, sizeofcmds + LINKEDIT_DATA_COMMAND_SIZE, be);
    Ok(())
}

fn update_linkedit_segment(data: &mut [u8], offset: usize, new_filesize: u64) {
    // SegmentCommand64 layout: vmsize at +32, filesize at +48
    let be = is_big_endian(data);
    write_u64(data, offset + 48, new_filesize, be);
    write_u64(data, offset + 32, align_to(new_filesize as usize, 0x4000) as u64, be);
}

fn is_big_endian(data: &[u8]) -> bool {
    data.len() >= 4
        && (data[0..4] == [0xfe, 0xed, 0xfa, 0xce]
            || data[0..4] == [0xfe, 0xed, 0xfa, 0xcf]
            || data[0..4] == [0xca, 0xfe, 0xba, 0xbe])
}

fn align_to(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

fn read_u32(data: &[u8], offset: usize, big_endian: bool) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    if big_endian {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    }
}

fn write_u32(data: &mut [u8], offset: usize, value: u32, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 4].copy_from_slice(&bytes);
}

fn write_u64(data: &mut [u8], offset: usize, value: u64, big_endian: bool) {
    let bytes = if big_endian {
        value.to_be_bytes()
    } else {
        value.to_le_bytes()
    };
    data[offset..offset + 8].copy_from_slice(&bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(1, 16), 16);
        assert_eq!(align_to(16, 16), 16);
        assert_eq!(align_to(17, 16), 32);
        assert_eq!(align_to(100, 0x4000), 0x4000);
    }

    #[test]
    fn test_read_write_round_trip() {
        let mut data = vec![0u8; 8];
        write_u32(&mut data, 0, 0x1234_5678, false);
        assert_eq!(read_u32(&data, 0, false), 0x1234_5678);
        assert_eq!(&data[0..4], &[0x78, 0x56, 0x34, 0x12]);

        write_u32(&mut data, 0, 0x1234_5678, true);
        assert_eq!(read_u32(&data, 0, true), 0x1234_5678);
        assert_eq!(&data[0..4], &[0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_embed_rejects_garbage() {
        let data = vec![0u8; 100];
        assert!(embed(&data, None, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_strip_rejects_garbage() {
        let data = vec![0u8; 100];
        assert!(strip(&data).is_err());
    }
}
