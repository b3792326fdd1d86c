//! External-link signing: take a Mach-O binary that carries no
//! `LC_CODE_SIGNATURE`, inject one, and confirm the written CodeDirectory
//! hashes every page of the final file.

use std::str::FromStr;

use scroll::{Pwrite, LE};
use sha2::{Digest, Sha256};

use macho_linker::macho_format::*;
use macho_linker::{Image, LinkError, LinkOptions, OutputMode};

fn options() -> LinkOptions {
    let triple = target_lexicon::Triple::from_str("x86_64-apple-darwin").expect("triple");
    LinkOptions::new(triple, OutputMode::Exe)
}

/// Builds a minimal executable the way an external linker would lay it
/// out: __TEXT mapping the whole file head, a __text section, __LINKEDIT,
/// and a symtab — but no code signature.
fn unsigned_fixture(text_offset: u32) -> Vec<u8> {
    let sizeofcmds = (2 * SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64 + 24) as u32;
    let header = MachHeader64 {
        magic: MH_MAGIC_64,
        cputype: CPU_TYPE_X86_64,
        cpusubtype: CPU_SUBTYPE_X86_64_ALL,
        filetype: MH_EXECUTE,
        ncmds: 3,
        sizeofcmds,
        flags: MH_NOUNDEFS | MH_DYLDLINK | MH_PIE,
        reserved: 0,
    };
    let text_segment = SegmentCommand64 {
        cmd: LC_SEGMENT_64,
        cmdsize: (SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64) as u32,
        segname: name16(SEG_TEXT),
        vmaddr: PAGEZERO_VMSIZE,
        vmsize: 0x2000,
        fileoff: 0,
        filesize: 0x2000,
        maxprot: (VmProt::READ | VmProt::EXECUTE).bits(),
        initprot: (VmProt::READ | VmProt::EXECUTE).bits(),
        nsects: 1,
        flags: 0,
    };
    let text_section = Section64 {
        sectname: name16(SECT_TEXT),
        segname: name16(SEG_TEXT),
        addr: PAGEZERO_VMSIZE + u64::from(text_offset),
        size: 8,
        offset: text_offset,
        flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
        ..Default::default()
    };
    let linkedit_segment = SegmentCommand64 {
        cmd: LC_SEGMENT_64,
        cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
        segname: name16(SEG_LINKEDIT),
        vmaddr: PAGEZERO_VMSIZE + 0x2000,
        vmsize: 0x1000,
        fileoff: 0x2000,
        filesize: 0x10,
        maxprot: VmProt::READ.bits(),
        initprot: VmProt::READ.bits(),
        nsects: 0,
        flags: 0,
    };
    let symtab = SymtabCommand {
        cmd: LC_SYMTAB,
        cmdsize: 24,
        ..Default::default()
    };

    let mut data = vec![0u8; 0x2010];
    let mut offset = 0;
    data.gwrite_with(header, &mut offset, LE).expect("header");
    data.gwrite_with(text_segment, &mut offset, LE).expect("__TEXT");
    data.gwrite_with(text_section, &mut offset, LE).expect("__text");
    data.gwrite_with(linkedit_segment, &mut offset, LE)
        .expect("__LINKEDIT");
    data.gwrite_with(symtab, &mut offset, LE).expect("symtab");

    // ret at the entry, some noise afterwards so page hashes are nontrivial.
    data[text_offset as usize] = 0xc3;
    for (i, byte) in data[0x1100..0x2000].iter_mut().enumerate() {
        *byte = i as u8;
    }
    data
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().expect("be u32"))
}

#[test]
fn injects_and_verifies_a_code_signature() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("externally-linked");
    std::fs::write(&path, unsigned_fixture(0x1000)).expect("write fixture");

    let mut image = Image::parse_from_file(&path, options()).expect("parse");
    assert_eq!(image.code_signature_cmd_index, None);
    image
        .write_code_signature_after_external_link()
        .expect("sign");

    // Re-parsing must now discover the signature command.
    let reparsed = Image::parse_from_file(&path, options()).expect("re-parse");
    assert!(reparsed.code_signature_cmd_index.is_some());

    let data = std::fs::read(&path).expect("read signed");
    let macho = goblin::mach::MachO::parse(&data, 0).expect("goblin parse");
    let mut signature = None;
    for command in &macho.load_commands {
        if let goblin::mach::load_command::CommandVariant::CodeSignature(cs) = &command.command {
            signature = Some(*cs);
        }
    }
    let signature = signature.expect("LC_CODE_SIGNATURE present");
    let dataoff = signature.dataoff as usize;
    assert_eq!(dataoff % 16, 0);
    assert!(dataoff >= 0x2010);

    // SuperBlob → CodeDirectory → page hashes.
    let blob = &data[dataoff..dataoff + signature.datasize as usize];
    assert_eq!(be_u32(blob, 0), 0xfade0cc0);
    let cd = be_u32(blob, 16) as usize;
    assert_eq!(be_u32(blob, cd), 0xfade0c02);
    let hash_offset = be_u32(blob, cd + 16) as usize;
    let n_code_slots = be_u32(blob, cd + 28) as usize;
    let code_limit = be_u32(blob, cd + 32) as usize;
    assert_eq!(code_limit, dataoff);
    assert_eq!(n_code_slots, dataoff.div_ceil(0x1000));

    for slot in 0..n_code_slots {
        let page_start = slot * 0x1000;
        let page_end = (page_start + 0x1000).min(code_limit);
        let expected: [u8; 32] = Sha256::digest(&data[page_start..page_end]).into();
        let written = &blob[cd + hash_offset + slot * 32..cd + hash_offset + (slot + 1) * 32];
        assert_eq!(written, expected, "hash of page {slot}");
    }
}

#[test]
fn refuses_to_grow_commands_into_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tight");
    // __text starts right at the end of the current command table; there is
    // no room for one more command.
    let fixture = unsigned_fixture(SIZEOF_MACH_HEADER_64 as u32 + 248);
    std::fs::write(&path, fixture).expect("write fixture");

    let mut image = Image::parse_from_file(&path, options()).expect("parse");
    assert!(matches!(
        image.write_code_signature_after_external_link(),
        Err(LinkError::NotEnoughPadding)
    ));
}

#[test]
fn rejects_non_macho_input() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("not-macho");
    std::fs::write(&path, b"\x7fELF_but_not_really_padding_padding_padding").expect("write");

    assert!(matches!(
        Image::parse_from_file(&path, options()),
        Err(LinkError::InvalidMachHeader)
    ));
}
