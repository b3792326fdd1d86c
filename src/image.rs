//! The mutable Mach-O image on disk and all state needed to patch it
//! incrementally: the load-command table, the three symbol arrays, the
//! string table, the offset (GOT) table and the text-block list.
//!
//! The inherent impl of [`Image`] is split across the submodules by
//! concern: metadata creation, file-space allocation, text-block
//! management, the per-decl update pipeline, the flush writers and the
//! re-parser for externally linked binaries.

pub mod blocks;
mod metadata;
mod parse;
mod space;
mod update;
mod write;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use target_lexicon::{Architecture, Triple};

use crate::commands::LoadCommand;
use crate::errors::{ErrorFlags, LinkError};
use crate::macho_format::{MachHeader64, Nlist64};
use crate::module::Decl;
use crate::target;
use blocks::{BlockId, Blocks};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Exe,
    Obj,
    Lib,
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub target: Triple,
    pub output_mode: OutputMode,
    /// Expected total size of `__text`, used to reserve file space up
    /// front so the section can grow without moving.
    pub program_code_size_hint: u64,
    /// Expected symbol count, used to size the `__got` section.
    pub symbol_count_hint: u64,
    /// Full-link tool for [`Image::flush_with_external_linker`]; `ld` when
    /// unset.
    pub system_linker: Option<PathBuf>,
    pub extra_linker_args: Vec<String>,
}

impl LinkOptions {
    pub fn new(target: Triple, output_mode: OutputMode) -> Self {
        Self {
            target,
            output_mode,
            program_code_size_hint: 256 * 1024,
            symbol_count_hint: 240,
            system_linker: None,
            extra_linker_args: Vec::new(),
        }
    }
}

pub struct Image {
    file: File,
    path: PathBuf,
    pub options: LinkOptions,
    page_size: u64,

    pub header: Option<MachHeader64>,
    /// All load commands, in file order.
    pub commands: Vec<LoadCommand>,

    // Positions of the canonical commands within `commands`, and of the
    // canonical sections within `__TEXT`.
    pub pagezero_segment_cmd_index: Option<usize>,
    pub text_segment_cmd_index: Option<usize>,
    pub linkedit_segment_cmd_index: Option<usize>,
    pub dyld_info_cmd_index: Option<usize>,
    pub symtab_cmd_index: Option<usize>,
    pub dysymtab_cmd_index: Option<usize>,
    pub dylinker_cmd_index: Option<usize>,
    pub libsystem_cmd_index: Option<usize>,
    pub main_cmd_index: Option<usize>,
    pub version_min_cmd_index: Option<usize>,
    pub source_version_cmd_index: Option<usize>,
    pub uuid_cmd_index: Option<usize>,
    pub code_signature_cmd_index: Option<usize>,
    pub text_section_index: Option<usize>,
    pub got_section_index: Option<usize>,

    /// Index 0 is permanently the null symbol.
    pub local_symbols: Vec<Nlist64>,
    pub global_symbols: Vec<Nlist64>,
    pub undef_symbols: Vec<Nlist64>,
    pub local_symbol_free_list: Vec<u32>,
    pub global_symbol_free_list: Vec<u32>,
    pub offset_table_free_list: Vec<u32>,

    /// Offset 0 is permanently the empty string.
    pub string_table: Vec<u8>,
    /// Target virtual address held by each GOT slot.
    pub offset_table: Vec<u64>,

    pub(crate) blocks: Blocks,
    pub(crate) text_block_free_list: Vec<BlockId>,
    pub(crate) last_text_block: Option<BlockId>,

    pub entry_addr: Option<u64>,
    /// Next free file offset inside `__LINKEDIT`.
    pub(crate) linkedit_segment_next_offset: Option<u64>,
    /// Set whenever a load command may have changed; cleared once the
    /// command table and header have been rewritten.
    pub cmd_table_dirty: bool,
    pub(crate) error_flags: ErrorFlags,
}

impl Image {
    /// Opens (or creates) the output file and materializes the canonical
    /// metadata. The file is never truncated so a previous image can be
    /// patched in place.
    pub fn open_path(path: &Path, options: LinkOptions) -> Result<Image, LinkError> {
        target::validate(&options.target)?;
        if options.output_mode == OutputMode::Lib {
            return Err(LinkError::TodoImplementWritingLibFiles);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = match options.output_mode {
                OutputMode::Exe => 0o755,
                _ => 0o644,
            };
            file.set_permissions(std::fs::Permissions::from_mode(mode))?;
        }

        let mut image = Image::new(file, path.to_owned(), options);
        // The null symbol; local index 0 is never handed to a decl.
        image.local_symbols.push(Nlist64::default());
        image.populate_missing_metadata()?;
        Ok(image)
    }

    pub(crate) fn new(file: File, path: PathBuf, options: LinkOptions) -> Image {
        let page_size = target::page_size(&options.target);
        Image {
            file,
            path,
            options,
            page_size,
            header: None,
            commands: Vec::new(),
            pagezero_segment_cmd_index: None,
            text_segment_cmd_index: None,
            linkedit_segment_cmd_index: None,
            dyld_info_cmd_index: None,
            symtab_cmd_index: None,
            dysymtab_cmd_index: None,
            dylinker_cmd_index: None,
            libsystem_cmd_index: None,
            main_cmd_index: None,
            version_min_cmd_index: None,
            source_version_cmd_index: None,
            uuid_cmd_index: None,
            code_signature_cmd_index: None,
            text_section_index: None,
            got_section_index: None,
            local_symbols: Vec::new(),
            global_symbols: Vec::new(),
            undef_symbols: Vec::new(),
            local_symbol_free_list: Vec::new(),
            global_symbol_free_list: Vec::new(),
            offset_table_free_list: Vec::new(),
            string_table: vec![0],
            offset_table: Vec::new(),
            blocks: Blocks::default(),
            text_block_free_list: Vec::new(),
            last_text_block: None,
            entry_addr: None,
            linkedit_segment_next_offset: None,
            cmd_table_dirty: false,
            error_flags: ErrorFlags::default(),
        }
    }

    pub fn error_flags(&self) -> ErrorFlags {
        self.error_flags
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn arch(&self) -> Architecture {
        self.options.target.architecture
    }

    /// Virtual address of the decl's code, or 0 if it has none yet.
    pub fn get_decl_vaddr(&self, decl: &Decl) -> u64 {
        match decl.block {
            Some(id) => self.block_vaddr(id),
            None => 0,
        }
    }

    /// Index of the decl's local symbol, if one has been assigned.
    pub fn decl_sym_index(&self, decl: &Decl) -> Option<u32> {
        let id = decl.block?;
        let index = self.blk(id).local_sym_index;
        if index == 0 { None } else { Some(index) }
    }

    /// The decl's local symbol, if one has been assigned.
    pub fn decl_symbol(&self, decl: &Decl) -> Option<Nlist64> {
        let index = self.decl_sym_index(decl)?;
        Some(self.local_symbols[index as usize])
    }

    // --- string table -----------------------------------------------------

    pub(crate) fn make_string(&mut self, s: &str) -> u32 {
        let offset = self.string_table.len() as u32;
        self.string_table.extend_from_slice(s.as_bytes());
        self.string_table.push(0);
        offset
    }

    pub(crate) fn get_string(&self, offset: u32) -> &str {
        let bytes = &self.string_table[offset as usize..];
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).unwrap_or("")
    }

    /// Reuses `old` when it already spells `s`, otherwise appends a fresh
    /// string. Old bytes are never reclaimed.
    pub(crate) fn update_string(&mut self, old: u32, s: &str) -> u32 {
        if self.get_string(old) == s {
            old
        } else {
            self.make_string(s)
        }
    }

    // --- command accessors ------------------------------------------------

    pub(crate) fn size_of_cmds(&self) -> u32 {
        self.commands.iter().map(LoadCommand::cmdsize).sum()
    }

    fn segment(&self, index: Option<usize>) -> &crate::macho_format::SegmentCommand64 {
        let Some(index) = index else {
            unreachable!("segment command not initialized");
        };
        let LoadCommand::Segment { seg, .. } = &self.commands[index] else {
            unreachable!("command {index} is not a segment");
        };
        seg
    }

    fn segment_mut(&mut self, index: Option<usize>) -> &mut crate::macho_format::SegmentCommand64 {
        let Some(index) = index else {
            unreachable!("segment command not initialized");
        };
        let LoadCommand::Segment { seg, .. } = &mut self.commands[index] else {
            unreachable!("command {index} is not a segment");
        };
        seg
    }

    fn section(&self, sect_index: Option<usize>) -> &crate::macho_format::Section64 {
        let Some(index) = self.text_segment_cmd_index else {
            unreachable!("__TEXT segment not initialized");
        };
        let LoadCommand::Segment { sections, .. } = &self.commands[index] else {
            unreachable!("command {index} is not a segment");
        };
        let Some(section) = sect_index.and_then(|i| sections.get(i)) else {
            unreachable!("__TEXT section not initialized");
        };
        section
    }

    fn section_mut(&mut self, sect_index: Option<usize>) -> &mut crate::macho_format::Section64 {
        let Some(index) = self.text_segment_cmd_index else {
            unreachable!("__TEXT segment not initialized");
        };
        let LoadCommand::Segment { sections, .. } = &mut self.commands[index] else {
            unreachable!("command {index} is not a segment");
        };
        let Some(section) = sect_index.and_then(|i| sections.get_mut(i)) else {
            unreachable!("__TEXT section not initialized");
        };
        section
    }

    pub(crate) fn text_segment(&self) -> &crate::macho_format::SegmentCommand64 {
        self.segment(self.text_segment_cmd_index)
    }

    pub(crate) fn text_segment_mut(&mut self) -> &mut crate::macho_format::SegmentCommand64 {
        self.segment_mut(self.text_segment_cmd_index)
    }

    pub(crate) fn linkedit_segment(&self) -> &crate::macho_format::SegmentCommand64 {
        self.segment(self.linkedit_segment_cmd_index)
    }

    pub(crate) fn linkedit_segment_mut(&mut self) -> &mut crate::macho_format::SegmentCommand64 {
        self.segment_mut(self.linkedit_segment_cmd_index)
    }

    pub(crate) fn text_section(&self) -> &crate::macho_format::Section64 {
        self.section(self.text_section_index)
    }

    pub(crate) fn text_section_mut(&mut self) -> &mut crate::macho_format::Section64 {
        self.section_mut(self.text_section_index)
    }

    pub(crate) fn got_section(&self) -> &crate::macho_format::Section64 {
        self.section(self.got_section_index)
    }

    pub(crate) fn symtab_cmd_mut(&mut self) -> &mut crate::macho_format::SymtabCommand {
        let Some(index) = self.symtab_cmd_index else {
            unreachable!("LC_SYMTAB not initialized");
        };
        let LoadCommand::Symtab(cmd) = &mut self.commands[index] else {
            unreachable!("command {index} is not LC_SYMTAB");
        };
        cmd
    }

    pub(crate) fn dysymtab_cmd_mut(&mut self) -> &mut crate::macho_format::DysymtabCommand {
        let Some(index) = self.dysymtab_cmd_index else {
            unreachable!("LC_DYSYMTAB not initialized");
        };
        let LoadCommand::Dysymtab(cmd) = &mut self.commands[index] else {
            unreachable!("command {index} is not LC_DYSYMTAB");
        };
        cmd
    }

    pub(crate) fn dyld_info_cmd_mut(&mut self) -> &mut crate::macho_format::DyldInfoCommand {
        let Some(index) = self.dyld_info_cmd_index else {
            unreachable!("LC_DYLD_INFO_ONLY not initialized");
        };
        let LoadCommand::DyldInfoOnly(cmd) = &mut self.commands[index] else {
            unreachable!("command {index} is not LC_DYLD_INFO_ONLY");
        };
        cmd
    }

    pub(crate) fn main_cmd(&self) -> &crate::macho_format::EntryPointCommand {
        let Some(index) = self.main_cmd_index else {
            unreachable!("LC_MAIN not initialized");
        };
        let LoadCommand::Main(cmd) = &self.commands[index] else {
            unreachable!("command {index} is not LC_MAIN");
        };
        cmd
    }

    pub(crate) fn main_cmd_mut(&mut self) -> &mut crate::macho_format::EntryPointCommand {
        let Some(index) = self.main_cmd_index else {
            unreachable!("LC_MAIN not initialized");
        };
        let LoadCommand::Main(cmd) = &mut self.commands[index] else {
            unreachable!("command {index} is not LC_MAIN");
        };
        cmd
    }

    pub(crate) fn code_signature_cmd(&self) -> &crate::macho_format::LinkeditDataCommand {
        let Some(index) = self.code_signature_cmd_index else {
            unreachable!("LC_CODE_SIGNATURE not initialized");
        };
        let LoadCommand::CodeSignature(cmd) = &self.commands[index] else {
            unreachable!("command {index} is not LC_CODE_SIGNATURE");
        };
        cmd
    }

    pub(crate) fn code_signature_cmd_mut(&mut self) -> &mut crate::macho_format::LinkeditDataCommand {
        let Some(index) = self.code_signature_cmd_index else {
            unreachable!("LC_CODE_SIGNATURE not initialized");
        };
        let LoadCommand::CodeSignature(cmd) = &mut self.commands[index] else {
            unreachable!("command {index} is not LC_CODE_SIGNATURE");
        };
        cmd
    }

    // --- positioned file I/O ----------------------------------------------

    pub(crate) fn pwrite_all(&self, buf: &[u8], offset: u64) -> Result<(), LinkError> {
        pwrite_all(&self.file, buf, offset).map_err(Into::into)
    }

    pub(crate) fn pread_exact(&self, buf: &mut [u8], offset: u64) -> Result<(), LinkError> {
        pread_exact(&self.file, buf, offset).map_err(Into::into)
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn pwrite_all(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
            use std::os::unix::fs::FileExt;
            file.write_all_at(buf, offset)
        }

        fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
            use std::os::unix::fs::FileExt;
            file.read_exact_at(buf, offset)
        }
    } else {
        fn pwrite_all(mut file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
            use std::io::{Seek, SeekFrom, Write};
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)
        }

        fn pread_exact(mut file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
            use std::io::{Read, Seek, SeekFrom};
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(buf)
        }
    }
}

pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value.div_ceil(alignment) * alignment
}

pub(crate) fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    value / alignment * alignment
}

/// Capacity a block of `size` bytes should ideally own, leaving a third of
/// headroom for growth. Saturating so inflation near `u64::MAX` cannot wrap.
pub(crate) const fn ideal_capacity(size: u64) -> u64 {
    size.saturating_mul(4) / 3
}

const MIN_TEXT_BLOCK_SIZE: u64 = 64;
/// Smallest surplus worth remembering on the text-block free list.
pub(crate) const MIN_TEXT_CAPACITY: u64 = ideal_capacity(MIN_TEXT_BLOCK_SIZE);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn ideal_capacity_saturates() {
        assert_eq!(ideal_capacity(3), 4);
        assert_eq!(ideal_capacity(64), 85);
        assert_eq!(ideal_capacity(u64::MAX), u64::MAX / 3);
    }
}
