//! Integration tests for format classification and the Mach-O
//! representation, using synthesized minimal binaries.

use std::fs;
use std::path::{Path, PathBuf};

use sigrep::{
    best_file_guess, best_guess, best_guess_at_offset, best_guess_with, Architecture, Context,
    DiskRep, Error, SpecialSlot, Writer, MONOLITHIC_PAGE_SIZE, SEGMENTED_PAGE_SIZE,
    WRITER_NO_GLOBAL,
};
use tempfile::TempDir;

const MH_MAGIC_64: u32 = 0xfeedfacf;
const MH_EXECUTE: u32 = 2;
const LC_SEGMENT_64: u32 = 0x19;

const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;

/// Build a minimal 64-bit little-endian Mach-O executable with a __TEXT and
/// a __LINKEDIT segment. 0x400 bytes of text, 0x100 of linkedit.
fn minimal_macho(cputype: u32, cpusubtype: u32) -> Vec<u8> {
    const TEXT_SIZE: u64 = 0x400;
    const LINKEDIT_SIZE: u64 = 0x100;

    let mut buf = Vec::new();

    // mach_header_64
    buf.extend(&MH_MAGIC_64.to_le_bytes());
    buf.extend(&cputype.to_le_bytes());
    buf.extend(&cpusubtype.to_le_bytes());
    buf.extend(&MH_EXECUTE.to_le_bytes());
    buf.extend(&2u32.to_le_bytes()); // ncmds
    buf.extend(&(2 * 72u32).to_le_bytes()); // sizeofcmds
    buf.extend(&0u32.to_le_bytes()); // flags
    buf.extend(&0u32.to_le_bytes()); // reserved

    // __TEXT segment covering the file head
    buf.extend(&segment_command_64(b"__TEXT", 0, 0x4000, 0, TEXT_SIZE));
    // __LINKEDIT segment at the tail
    buf.extend(&segment_command_64(
        b"__LINKEDIT",
        0x4000,
        0x4000,
        TEXT_SIZE,
        LINKEDIT_SIZE,
    ));

    buf.resize((TEXT_SIZE + LINKEDIT_SIZE) as usize, 0);
    buf
}

fn segment_command_64(
    name: &[u8],
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(72);
    cmd.extend(&LC_SEGMENT_64.to_le_bytes());
    cmd.extend(&72u32.to_le_bytes());
    let mut segname = [0u8; 16];
    segname[..name.len()].copy_from_slice(name);
    cmd.extend(&segname);
    cmd.extend(&vmaddr.to_le_bytes());
    cmd.extend(&vmsize.to_le_bytes());
    cmd.extend(&fileoff.to_le_bytes());
    cmd.extend(&filesize.to_le_bytes());
    cmd.extend(&7i32.to_le_bytes()); // maxprot
    cmd.extend(&5i32.to_le_bytes()); // initprot
    cmd.extend(&0u32.to_le_bytes()); // nsects
    cmd.extend(&0u32.to_le_bytes()); // flags
    cmd
}

const SLICE_A_OFFSET: u32 = 0x1000;
const SLICE_B_OFFSET: u32 = 0x2000;

/// Build a universal binary: arm64 slice at 0x1000, x86_64 slice at 0x2000.
fn fat_binary() -> Vec<u8> {
    let slice_a = minimal_macho(CPU_TYPE_ARM64, 0);
    let slice_b = minimal_macho(CPU_TYPE_X86_64, 3);

    let mut buf = Vec::new();
    buf.extend(&0xCAFE_BABEu32.to_be_bytes());
    buf.extend(&2u32.to_be_bytes());

    for (cputype, cpusubtype, offset, slice) in [
        (CPU_TYPE_ARM64, 0u32, SLICE_A_OFFSET, &slice_a),
        (CPU_TYPE_X86_64, 3u32, SLICE_B_OFFSET, &slice_b),
    ] {
        buf.extend(&cputype.to_be_bytes());
        buf.extend(&cpusubtype.to_be_bytes());
        buf.extend(&offset.to_be_bytes());
        buf.extend(&(slice.len() as u32).to_be_bytes());
        buf.extend(&12u32.to_be_bytes()); // 2^12 alignment
    }

    buf.resize(SLICE_A_OFFSET as usize, 0);
    buf.extend(&slice_a);
    buf.resize(SLICE_B_OFFSET as usize, 0);
    buf.extend(&slice_b);
    buf
}

fn write_fixture(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, bytes).unwrap();
    path
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

#[test]
fn macho_file_is_paged_and_recognized() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "tool", &minimal_macho(CPU_TYPE_ARM64, 0));

    let rep = best_guess(&path).unwrap();
    assert!(rep.main_executable_is_macho().unwrap());
    assert_eq!(rep.page_size(), SEGMENTED_PAGE_SIZE);
    assert_eq!(rep.signing_base(), 0);
    assert!(rep.format().starts_with("Mach-O thin"));

    let image = rep.main_executable_image().unwrap().unwrap();
    assert!(!image.is_fat());
    assert_eq!(image.architectures(), vec![Architecture::ARM64]);
}

#[test]
fn flat_file_is_monolithic() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "blob.dat", b"just bytes, no structure");

    let rep = best_guess(&path).unwrap();
    assert_eq!(rep.page_size(), MONOLITHIC_PAGE_SIZE);
    assert_eq!(rep.signing_base(), 0);
    assert_eq!(rep.signing_limit().unwrap(), file_len(&path));
    assert!(!rep.main_executable_is_macho().unwrap());
}

#[test]
fn signing_region_never_exceeds_file() {
    let dir = TempDir::new().unwrap();
    let thin = write_fixture(&dir, "thin", &minimal_macho(CPU_TYPE_ARM64, 0));
    let fat = write_fixture(&dir, "fat", &fat_binary());
    let flat = write_fixture(&dir, "flat", b"loose bytes");

    for rep in [
        best_guess(&thin).unwrap(),
        best_guess(&fat).unwrap(),
        best_guess_with(
            &fat,
            &Context {
                arch: Some(Architecture::X86_64),
                ..Context::default()
            },
        )
        .unwrap(),
        best_guess_at_offset(&fat, SLICE_B_OFFSET as u64).unwrap(),
        best_guess(&flat).unwrap(),
    ] {
        let size = file_len(rep.main_executable_path());
        assert!(
            rep.signing_base() + rep.signing_limit().unwrap() <= size,
            "signed region exceeds file for {}",
            rep.format()
        );
    }
}

#[test]
fn fat_binary_selects_by_architecture() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "fat", &fat_binary());

    let rep = best_guess_with(
        &path,
        &Context {
            arch: Some(Architecture::X86_64),
            ..Context::default()
        },
    )
    .unwrap();
    assert_eq!(rep.signing_base(), SLICE_B_OFFSET as u64);
    assert!(rep.format().contains("x86_64"));

    let rep = best_guess_with(
        &path,
        &Context {
            arch: Some(Architecture::ARM64),
            ..Context::default()
        },
    )
    .unwrap();
    assert_eq!(rep.signing_base(), SLICE_A_OFFSET as u64);

    // an architecture the file does not carry is a construction failure
    assert!(best_guess_with(
        &path,
        &Context {
            arch: Some(Architecture::ARM),
            ..Context::default()
        },
    )
    .is_err());
}

#[test]
fn explicit_offset_pins_one_slice() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "fat", &fat_binary());

    let rep = best_guess_at_offset(&path, SLICE_B_OFFSET as u64).unwrap();
    let image = rep.main_executable_image().unwrap().unwrap();
    assert_eq!(image.architectures(), vec![Architecture::new(CPU_TYPE_X86_64, 3)]);
    assert_eq!(rep.signing_base(), SLICE_B_OFFSET as u64);

    // fileOnly is irrelevant on the explicit-offset path
    let via_ctx = best_guess_with(
        &path,
        &Context {
            offset: Some(SLICE_B_OFFSET as u64),
            file_only: true,
            ..Context::default()
        },
    )
    .unwrap();
    assert_eq!(via_ctx.signing_base(), rep.signing_base());
    assert_eq!(
        via_ctx.main_executable_image().unwrap().unwrap().architectures(),
        image.architectures()
    );
}

#[test]
fn macho_component_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "tool", &minimal_macho(CPU_TYPE_ARM64, 0));

    let rep = best_guess(&path).unwrap();
    assert!(rep.code_directory().unwrap().is_none());

    let mut writer = rep.writer().unwrap();
    assert!(writer.attribute(WRITER_NO_GLOBAL));
    writer.code_directory(&[0xaa; 64]).unwrap();
    writer.signature(&[0xbb; 32]).unwrap();
    writer
        .component(SpecialSlot::Requirements, &[0xcc; 12])
        .unwrap();
    writer.flush().unwrap();

    // the stale image cache still answers until flushed
    assert!(rep.code_directory().unwrap().is_none());
    rep.flush();

    assert_eq!(rep.code_directory().unwrap().unwrap(), vec![0xaa; 64]);
    assert_eq!(rep.signature().unwrap().unwrap(), vec![0xbb; 32]);
    assert_eq!(
        rep.component(SpecialSlot::Requirements).unwrap().unwrap(),
        vec![0xcc; 12]
    );
    assert!(rep.component(SpecialSlot::Entitlements).unwrap().is_none());

    // the signed region now stops at the embedded signature
    let size = file_len(&path);
    assert!(rep.signing_limit().unwrap() < size);
    assert!(rep.signing_base() + rep.signing_limit().unwrap() <= size);
}

#[test]
fn macho_resign_replaces_signature() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "tool", &minimal_macho(CPU_TYPE_ARM64, 0));
    let rep = best_guess(&path).unwrap();

    let mut writer = rep.writer().unwrap();
    writer.code_directory(&[1; 16]).unwrap();
    writer.flush().unwrap();
    rep.flush();
    assert_eq!(rep.code_directory().unwrap().unwrap(), vec![1; 16]);

    let mut writer = rep.writer().unwrap();
    writer.code_directory(&[2; 16]).unwrap();
    writer.flush().unwrap();
    rep.flush();
    assert_eq!(rep.code_directory().unwrap().unwrap(), vec![2; 16]);
}

#[test]
fn macho_writer_remove_strips_signature() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "tool", &minimal_macho(CPU_TYPE_ARM64, 0));
    let rep = best_guess(&path).unwrap();

    let mut writer = rep.writer().unwrap();
    writer.code_directory(&[9; 24]).unwrap();
    writer.flush().unwrap();
    rep.flush();
    assert!(rep.code_directory().unwrap().is_some());

    let mut writer = rep.writer().unwrap();
    writer.remove().unwrap();
    rep.flush();
    assert!(rep.code_directory().unwrap().is_none());
    // still a loadable binary after stripping
    assert!(rep.main_executable_is_macho().unwrap());
}

#[test]
fn fat_slice_component_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "fat", &fat_binary());

    let ctx = Context {
        arch: Some(Architecture::X86_64),
        ..Context::default()
    };
    let rep = best_guess_with(&path, &ctx).unwrap();
    let mut writer = rep.writer().unwrap();
    writer.code_directory(&[0xd1; 20]).unwrap();
    writer.flush().unwrap();

    // re-classify the rewritten container
    let rep = best_guess_with(&path, &ctx).unwrap();
    assert_eq!(rep.code_directory().unwrap().unwrap(), vec![0xd1; 20]);

    // the other slice stays unsigned
    let other = best_guess_with(
        &path,
        &Context {
            arch: Some(Architecture::ARM64),
            ..Context::default()
        },
    )
    .unwrap();
    assert!(other.code_directory().unwrap().is_none());
}

#[test]
fn flush_reflects_file_replacement() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, "swap", b"first generation");
    let rep = best_guess(&path).unwrap();

    let before = rep.fd().unwrap();
    let before_len = before.metadata().unwrap().len();

    // replace the file wholesale (new inode)
    let replacement = write_fixture(&dir, "swap.new", b"second, rather longer generation");
    fs::rename(&replacement, &path).unwrap();

    // cached handle still sees the old file until flushed
    assert_eq!(rep.fd().unwrap().metadata().unwrap().len(), before_len);
    rep.flush();
    assert_eq!(
        rep.fd().unwrap().metadata().unwrap().len(),
        file_len(&path)
    );
}

#[test]
fn nonexistent_and_unreadable_paths_fail() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        best_guess(dir.path().join("no-such-thing")),
        Err(Error::Io(_))
    ));
    assert!(best_guess_at_offset(dir.path().join("no-such-thing"), 0).is_err());
}

#[test]
fn file_only_forces_flat_for_bundle_directory() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("Thing.app");
    fs::create_dir_all(&root).unwrap();
    let mut info = plist::Dictionary::new();
    info.insert(
        "CFBundleExecutable".to_string(),
        plist::Value::String("thing".to_string()),
    );
    plist::Value::Dictionary(info)
        .to_file_xml(root.join("Info.plist"))
        .unwrap();
    fs::write(root.join("thing"), b"executable").unwrap();

    assert!(best_guess(&root).unwrap().format().starts_with("bundle"));
    assert_eq!(
        best_file_guess(&root, &Context::default()).unwrap().format(),
        "flat file"
    );
}
