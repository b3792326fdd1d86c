//! Raw Mach-O records and constants, as laid out in
//! `usr/include/mach-o/loader.h` and `usr/include/mach-o/nlist.h`.
//!
//! Everything here is a plain `#[repr(C)]` struct with `scroll` derives so
//! the records can be read and written at arbitrary file offsets. All
//! multi-byte fields are little-endian on both supported architectures.

use scroll::{Pread, Pwrite, SizeWith};

// usr/include/mach-o/loader.h, magic number for a 64-bit image
pub const MH_MAGIC_64: u32 = 0xfeedfacf;

// usr/include/mach-o/loader.h, file types
pub const MH_OBJECT: u32 = 0x1;
pub const MH_EXECUTE: u32 = 0x2;

// usr/include/mach-o/loader.h, header flags
pub const MH_NOUNDEFS: u32 = 0x1;
pub const MH_DYLDLINK: u32 = 0x4;
pub const MH_PIE: u32 = 0x200000;

// usr/include/mach/machine.h
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;
pub const CPU_TYPE_X86_64: u32 = 7 | CPU_ARCH_ABI64;
pub const CPU_TYPE_ARM64: u32 = 12 | CPU_ARCH_ABI64;
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;

// usr/include/mach-o/loader.h, load command kinds. Commands that must be
// understood by dyld for the binary to load carry LC_REQ_DYLD.
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;

bitflags::bitflags! {
    /// usr/include/mach/vm_prot.h
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: i32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXECUTE = 0x4;
    }
}

// usr/include/mach-o/loader.h, section type and attributes
pub const S_REGULAR: u32 = 0;
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x80000000;
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x00000400;

// usr/include/mach-o/nlist.h, n_type bits
pub const N_UNDF: u8 = 0x0;
pub const N_EXT: u8 = 0x01;
pub const N_SECT: u8 = 0x0e;

// usr/include/mach-o/nlist.h, n_desc reference flags
pub const REFERENCE_FLAG_UNDEFINED_NON_LAZY: u16 = 0x0;
pub const REFERENCE_FLAG_DEFINED: u16 = 0x2;
pub const REFERENCE_FLAG_PRIVATE_DEFINED: u16 = 0x3;
pub const N_WEAK_REF: u16 = 0x0040;

pub const SEG_PAGEZERO: &[u8] = b"__PAGEZERO";
pub const SEG_TEXT: &[u8] = b"__TEXT";
pub const SEG_LINKEDIT: &[u8] = b"__LINKEDIT";
pub const SECT_TEXT: &[u8] = b"__text";
pub const SECT_GOT: &[u8] = b"__got";

pub const DYLD_PATH: &str = "/usr/lib/dyld";
pub const LIB_SYSTEM_PATH: &str = "/usr/lib/libSystem.B.dylib";

/// `__PAGEZERO` spans the low 4 GiB so 32-bit pointer truncations fault.
pub const PAGEZERO_VMSIZE: u64 = 0x1_0000_0000;

pub const SIZEOF_MACH_HEADER_64: usize = 32;
pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;
pub const SIZEOF_SECTION_64: usize = 80;
pub const SIZEOF_NLIST_64: usize = 16;
pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct MachHeader64 {
    pub magic: u32,      // mach magic number identifier
    pub cputype: u32,    // cpu_type_t cpu specifier
    pub cpusubtype: u32, // cpu_subtype_t machine specifier
    pub filetype: u32,   // type of file
    pub ncmds: u32,      // number of load commands
    pub sizeofcmds: u32, // size of all the load commands
    pub flags: u32,
    pub reserved: u32,
}

/*
 * The 64-bit segment load command indicates that a part of this file is to
 * be mapped into a 64-bit task's address space. If the segment has sections
 * then section_64 structures directly follow the command and their size is
 * reflected in cmdsize.
 */
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,   // memory address the segment is mapped to
    pub vmsize: u64,   // total size of the segment
    pub fileoff: u64,  // file offset of the segment
    pub filesize: u64, // amount mapped from the file
    pub maxprot: i32,  // maximum VM protection
    pub initprot: i32, // initial VM protection
    pub nsects: u32,   // number of sections in the segment
    pub flags: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32, // as a power of two
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,  // file offset of the symbol table
    pub nsyms: u32,   // number of nlist_64 entries
    pub stroff: u32,  // file offset of the string table
    pub strsize: u32, // string table size in bytes
}

/*
 * The dysymtab command partitions the symbol table into three contiguous
 * ranges: local symbols, externally defined symbols, and undefined
 * symbols. The table-of-contents and relocation fields are unused here.
 */
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

// usr/include/mach-o/loader.h, a variable length pathname follows
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct DylinkerCommand {
    pub cmd: u32,
    pub cmdsize: u32, // includes the pathname string
    pub name: u32,    // offset from the command start to the pathname
}

/*
 * Dynamically linked shared libraries are identified by the pathname (the
 * name of the library as found for execution) and a compatibility version
 * number. The time stamp records when the library was built.
 */
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Dylib {
    pub name: u32, // offset from the load command start to the pathname
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    pub cmd: u32,
    pub cmdsize: u32, // includes the pathname string
    pub dylib: Dylib,
}

// usr/include/mach-o/loader.h, LC_DYLD_INFO_ONLY
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

// usr/include/mach-o/loader.h, LC_MAIN. entryoff is relative to __TEXT.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct EntryPointCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub entryoff: u64,
    pub stacksize: u64,
}

// usr/include/mach-o/loader.h, version numbers packed as nibbles of
// (major << 16) | (minor << 8) | patch
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u32,
    pub sdk: u32,
}

// usr/include/mach-o/loader.h, A.B.C.D.E packed as a24.b10.c10.d10.e10
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct SourceVersionCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub version: u64,
}

// usr/include/mach-o/loader.h, 128-bit identifier for the image
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub uuid: [u8; 16],
}

// usr/include/mach-o/loader.h, LC_CODE_SIGNATURE and friends point at an
// opaque blob inside __LINKEDIT
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

// usr/include/mach-o/nlist.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    pub n_strx: u32, // index into the string table
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

/// Fixed-width segment/section name field.
pub fn name16(name: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name);
    out
}
