//! End-to-end scenarios for the incremental linker: images are built decl
//! by decl, flushed, and the resulting binaries re-parsed with goblin to
//! make sure an independent reader agrees with what we think we wrote.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;

use goblin::mach::MachO;
use macho_linker::{
    CodeGen, Decl, Export, GeneratedCode, Image, LinkOptions, Linkage, Module, OutputMode,
    PieFixup,
};

const X86_64: &str = "x86_64-apple-darwin";
const AARCH64: &str = "aarch64-apple-darwin";

/// Code generator backed by a shared name → code map, so tests can swap a
/// decl's code between `update_decl` calls.
#[derive(Clone, Default)]
struct MapGen(Rc<RefCell<HashMap<String, GeneratedCode>>>);

impl MapGen {
    fn set(&self, name: &str, code: Vec<u8>) {
        self.set_with_fixups(name, code, Vec::new());
    }

    fn set_with_fixups(&self, name: &str, code: Vec<u8>, fixups: Vec<PieFixup>) {
        self.0
            .borrow_mut()
            .insert(name.to_owned(), GeneratedCode { code, fixups });
    }
}

impl CodeGen for MapGen {
    fn generate(&mut self, decl: &Decl) -> Result<GeneratedCode, String> {
        self.0
            .borrow()
            .get(&decl.name)
            .cloned()
            .ok_or_else(|| format!("no machine code for {}", decl.name))
    }
}

fn options(triple: &str) -> LinkOptions {
    let triple = target_lexicon::Triple::from_str(triple).expect("triple");
    let mut options = LinkOptions::new(triple, OutputMode::Exe);
    options.program_code_size_hint = 0x1000;
    options.symbol_count_hint = 16;
    options
}

fn open(path: &Path, triple: &str) -> Image {
    Image::open_path(path, options(triple)).expect("open image")
}

fn parse(data: &[u8]) -> MachO<'_> {
    MachO::parse(data, 0).expect("goblin parse")
}

fn section(macho: &MachO<'_>, name: &str) -> goblin::mach::segment::Section {
    for segment in macho.segments.iter() {
        for (section, _) in segment.sections().expect("segment sections") {
            if section.name().expect("section name") == name {
                return section;
            }
        }
    }
    panic!("no section {name}");
}

fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn empty_executable_has_canonical_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "empty");
    let mut image = open(&path, X86_64);

    image.flush_module().expect("flush");
    assert!(image.error_flags().no_entry_point_found);

    let data = std::fs::read(&path).expect("read output");
    let macho = parse(&data);
    assert_eq!(macho.header.ncmds, 13);
    assert_eq!(macho.header.filetype, goblin::mach::header::MH_EXECUTE);
    let expected_flags = goblin::mach::header::MH_NOUNDEFS
        | goblin::mach::header::MH_DYLDLINK
        | goblin::mach::header::MH_PIE;
    assert_eq!(macho.header.flags & expected_flags, expected_flags);
    assert_eq!(macho.entry, 0);

    // __PAGEZERO spans the low 4 GiB and __TEXT starts right above it.
    let pagezero = &macho.segments[0];
    assert_eq!(pagezero.vmaddr, 0);
    assert_eq!(pagezero.vmsize, 0x1_0000_0000);
    let text = &macho.segments[1];
    assert_eq!(text.vmaddr, 0x1_0000_0000);
}

#[test]
fn start_export_sets_entry_point_and_got() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "start");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("_start", vec![0xc3, 0x00, 0x00]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let start = module.add_decl("_start", 1);

    image.allocate_decl_indexes(module.decl_mut(start));
    image.update_decl(&mut module, start).expect("update decl");
    module
        .decl_exports
        .insert(start, vec![Export::new("_start", Linkage::Strong)]);
    image
        .update_decl_exports(&mut module, start)
        .expect("update exports");
    image.flush_module().expect("flush");
    assert!(!image.error_flags().no_entry_point_found);
    assert!(module.failed_decls.is_empty());
    assert!(module.failed_exports.is_empty());

    let data = std::fs::read(&path).expect("read output");
    let macho = parse(&data);
    let text = section(&macho, "__text");
    let got = section(&macho, "__got");

    // The first decl lands at the very start of __text.
    let start_vaddr = image.get_decl_vaddr(module.decl(start));
    assert_eq!(start_vaddr, text.addr);
    assert_eq!(macho.entry, start_vaddr - 0x1_0000_0000);
    assert_eq!(data[text.offset as usize], 0xc3);

    // GOT slot 0 holds the decl's address, and its stub is the
    // lea-rip-relative / ret pair.
    assert_eq!(image.offset_table[0], start_vaddr);
    let stub = &data[got.offset as usize..got.offset as usize + 8];
    assert_eq!(&stub[..3], [0x48, 0x8d, 0x05]);
    let displacement = i32::from_le_bytes(stub[3..7].try_into().expect("disp"));
    assert_eq!(i64::from(displacement), start_vaddr as i64 - (got.addr as i64 + 7));
    assert_eq!(stub[7], 0xc3);

    // The export trie resolves _start to the entry offset.
    let exports = macho.exports().expect("exports");
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].name, "_start");
    assert_eq!(exports[0].offset, macho.entry);
}

#[test]
fn symbol_table_partition_matches_dysymtab() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "partition");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("_start", vec![0xc3]);
    codegen.set("helper", vec![0x90, 0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let start = module.add_decl("_start", 1);
    let helper = module.add_decl("helper", 1);

    for decl in [start, helper] {
        image.allocate_decl_indexes(module.decl_mut(decl));
        image.update_decl(&mut module, decl).expect("update decl");
    }
    module
        .decl_exports
        .insert(start, vec![Export::new("_start", Linkage::Strong)]);
    image
        .update_decl_exports(&mut module, start)
        .expect("update exports");
    image.flush_module().expect("flush");

    let data = std::fs::read(&path).expect("read output");
    let macho = parse(&data);

    let mut checked = false;
    for command in &macho.load_commands {
        if let goblin::mach::load_command::CommandVariant::Dysymtab(dysymtab) = &command.command {
            // null + _start + helper locals, one global, dyld_stub_binder.
            assert_eq!(dysymtab.ilocalsym, 0);
            assert_eq!(dysymtab.nlocalsym, 3);
            assert_eq!(dysymtab.iextdefsym, 3);
            assert_eq!(dysymtab.nextdefsym, 1);
            assert_eq!(dysymtab.iundefsym, 4);
            assert_eq!(dysymtab.nundefsym, 1);
            checked = true;
        }
    }
    assert!(checked, "no LC_DYSYMTAB in output");

    let names: Vec<_> = macho
        .symbols()
        .map(|symbol| symbol.expect("symbol").0)
        .collect();
    assert!(names.contains(&"_start"));
    assert!(names.contains(&"helper"));
    assert!(names.contains(&"dyld_stub_binder"));
}

#[test]
fn growing_a_decl_relocates_it_and_rewrites_its_got_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "grow");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("a", vec![0x90; 16]);
    codegen.set("b", vec![0x90; 16]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let a = module.add_decl("a", 1);
    let b = module.add_decl("b", 1);

    for decl in [a, b] {
        image.allocate_decl_indexes(module.decl_mut(decl));
        image.update_decl(&mut module, decl).expect("update decl");
    }
    let a_vaddr = image.get_decl_vaddr(module.decl(a));
    let b_vaddr = image.get_decl_vaddr(module.decl(b));
    assert!(a_vaddr < b_vaddr);

    // a outgrows the gap in front of b and must move.
    codegen.set("a", vec![0x90; 64]);
    image.update_decl(&mut module, a).expect("grow a");

    let a_new_vaddr = image.get_decl_vaddr(module.decl(a));
    assert_ne!(a_new_vaddr, a_vaddr);
    assert!(a_new_vaddr >= b_vaddr + 16, "a must land past b");
    assert_eq!(image.get_decl_vaddr(module.decl(b)), b_vaddr);

    // The GOT slot follows the move, on disk as well as in memory.
    let data = std::fs::read(&path).expect("read output");
    let macho = parse(&data);
    let got = section(&macho, "__got");
    let a_slot = i32::from_le_bytes(
        data[got.offset as usize + 3..got.offset as usize + 7]
            .try_into()
            .expect("disp"),
    );
    assert_eq!(
        i64::from(a_slot),
        a_new_vaddr as i64 - (got.addr as i64 + 7)
    );
}

#[test]
fn freed_decl_indexes_are_recycled_lifo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "recycle");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("a", vec![0xc3]);
    codegen.set("c", vec![0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let a = module.add_decl("a", 1);

    image.allocate_decl_indexes(module.decl_mut(a));
    image.update_decl(&mut module, a).expect("update a");
    let a_sym = image.decl_sym_index(module.decl(a)).expect("a symbol");

    image.free_decl(module.decl_mut(a));
    assert_eq!(image.local_symbols[a_sym as usize].n_type, 0);

    let c = module.add_decl("c", 1);
    image.allocate_decl_indexes(module.decl_mut(c));
    image.update_decl(&mut module, c).expect("update c");

    let c_sym = image.decl_sym_index(module.decl(c)).expect("c symbol");
    assert_eq!(c_sym, a_sym, "free list must be LIFO");
    assert_eq!(
        image.local_symbols[c_sym as usize].n_type,
        0x0e, // N_SECT
    );
}

#[test]
fn aarch64_branch_fixup_encodes_b_instruction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "branch");
    let mut image = open(&path, AARCH64);

    let codegen = MapGen::default();
    // ret
    codegen.set("callee", vec![0xc0, 0x03, 0x5f, 0xd6]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let callee = module.add_decl("callee", 4);
    image.allocate_decl_indexes(module.decl_mut(callee));
    image.update_decl(&mut module, callee).expect("update callee");
    let callee_vaddr = image.get_decl_vaddr(module.decl(callee));

    // caller is a single branch to callee, emitted as a fixup over a
    // placeholder word.
    codegen.set_with_fixups(
        "caller",
        vec![0x00; 4],
        vec![PieFixup {
            address: callee_vaddr,
            start: 0,
            len: 4,
        }],
    );
    let caller = module.add_decl("caller", 4);
    image.allocate_decl_indexes(module.decl_mut(caller));
    image.update_decl(&mut module, caller).expect("update caller");
    let caller_vaddr = image.get_decl_vaddr(module.decl(caller));

    image.flush_module().expect("flush");
    let data = std::fs::read(&path).expect("read output");
    let macho = parse(&data);
    let text = section(&macho, "__text");

    let caller_off = (text.offset as u64 + (caller_vaddr - text.addr)) as usize;
    let word = u32::from_le_bytes(data[caller_off..caller_off + 4].try_into().expect("word"));
    assert_eq!(word >> 26, 0b000101, "must be an unconditional branch");
    let imm26 = word & 0x03ff_ffff;
    // Sign-extend and scale the immediate back to a byte offset.
    let displacement = ((imm26 << 6) as i32 >> 6) as i64 * 4;
    assert_eq!(displacement, callee_vaddr as i64 - caller_vaddr as i64);

    // The aarch64 GOT stub is adr x0 / ret x28.
    let got = section(&macho, "__got");
    let stub = &data[got.offset as usize..got.offset as usize + 8];
    let adr = u32::from_le_bytes(stub[..4].try_into().expect("adr"));
    assert_eq!(adr & 0x9f00_001f, 0x1000_0000, "adr into x0");
    let ret = u32::from_le_bytes(stub[4..].try_into().expect("ret"));
    assert_eq!(ret, 0xd65f_0000 | (28 << 5), "ret x28");
}

#[test]
fn unchanged_update_is_idempotent_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "idempotent");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("stable", vec![0x90, 0x90, 0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let stable = module.add_decl("stable", 1);
    image.allocate_decl_indexes(module.decl_mut(stable));

    image.update_decl(&mut module, stable).expect("first update");
    let before = std::fs::read(&path).expect("read output");
    image.update_decl(&mut module, stable).expect("second update");
    let after = std::fs::read(&path).expect("read output");
    assert_eq!(before, after);
}

#[test]
fn flushed_image_round_trips_through_the_parser() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "roundtrip");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("_start", vec![0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let start = module.add_decl("_start", 1);
    image.allocate_decl_indexes(module.decl_mut(start));
    image.update_decl(&mut module, start).expect("update");
    module
        .decl_exports
        .insert(start, vec![Export::new("_start", Linkage::Strong)]);
    image
        .update_decl_exports(&mut module, start)
        .expect("exports");
    image.flush_module().expect("flush");

    let reparsed = Image::parse_from_file(&path, options(X86_64)).expect("re-parse");
    assert_eq!(
        reparsed.text_segment_cmd_index,
        image.text_segment_cmd_index
    );
    assert_eq!(reparsed.text_section_index, image.text_section_index);
    assert_eq!(
        reparsed.linkedit_segment_cmd_index,
        image.linkedit_segment_cmd_index
    );
    assert_eq!(reparsed.symtab_cmd_index, image.symtab_cmd_index);
    assert_eq!(
        reparsed.code_signature_cmd_index,
        image.code_signature_cmd_index
    );
}

#[test]
fn per_decl_failures_are_soft() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "soft");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    // No code registered for "broken": codegen fails.
    let mut module = Module::new(Box::new(codegen.clone()));
    let broken = module.add_decl("broken", 1);
    image.allocate_decl_indexes(module.decl_mut(broken));
    image.update_decl(&mut module, broken).expect("soft failure");
    assert!(module.failed_decls.contains_key(&broken));

    // Unsupported export shapes fail per-export, not per-link.
    codegen.set("exported", vec![0xc3]);
    let exported = module.add_decl("exported", 1);
    image.allocate_decl_indexes(module.decl_mut(exported));
    image.update_decl(&mut module, exported).expect("update");
    let mut bad_section = Export::new("in_data", Linkage::Strong);
    bad_section.section = Some("__data".to_owned());
    module.decl_exports.insert(
        exported,
        vec![bad_section, Export::new("once", Linkage::LinkOnce)],
    );
    image
        .update_decl_exports(&mut module, exported)
        .expect("exports");
    assert!(module.failed_exports.contains_key(&(exported, 0)));
    assert!(module.failed_exports.contains_key(&(exported, 1)));

    // The image still flushes.
    image.flush_module().expect("flush");
}

#[test]
fn deleted_exports_leave_recyclable_debris() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = temp_path(&dir, "delete-export");
    let mut image = open(&path, X86_64);

    let codegen = MapGen::default();
    codegen.set("f", vec![0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let f = module.add_decl("f", 1);
    image.allocate_decl_indexes(module.decl_mut(f));
    image.update_decl(&mut module, f).expect("update");
    module
        .decl_exports
        .insert(f, vec![Export::new("_f", Linkage::Strong)]);
    image.update_decl_exports(&mut module, f).expect("exports");

    let mut exports = module.decl_exports.remove(&f).expect("exports recorded");
    let index = exports[0].global_sym_index.expect("assigned slot");
    image.delete_export(&mut exports[0]);

    assert_eq!(exports[0].global_sym_index, None);
    assert_eq!(image.global_symbols[index as usize].n_type, 0);
    assert_eq!(image.global_symbol_free_list, vec![index]);
}

#[test]
fn object_and_library_modes_are_unimplemented() {
    let dir = tempfile::tempdir().expect("tempdir");

    let triple = target_lexicon::Triple::from_str(X86_64).expect("triple");
    let lib = Image::open_path(
        &temp_path(&dir, "lib"),
        LinkOptions::new(triple.clone(), OutputMode::Lib),
    );
    assert!(matches!(
        lib,
        Err(macho_linker::LinkError::TodoImplementWritingLibFiles)
    ));

    let mut obj = Image::open_path(
        &temp_path(&dir, "obj"),
        LinkOptions::new(triple, OutputMode::Obj),
    )
    .expect("open object image");
    let codegen = MapGen::default();
    codegen.set("f", vec![0xc3]);
    let mut module = Module::new(Box::new(codegen.clone()));
    let f = module.add_decl("f", 1);
    obj.allocate_decl_indexes(module.decl_mut(f));
    assert!(matches!(
        obj.update_decl(&mut module, f),
        Err(macho_linker::LinkError::TodoImplementWritingObjFiles)
    ));
    // Only the header/command path is written for objects.
    obj.flush_module().expect("flush object");
}
