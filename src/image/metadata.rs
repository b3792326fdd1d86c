//! Lazily materializes the canonical command set on first open: the three
//! segments, the `__text` and `__got` sections, the link-edit commands, the
//! dylinker/libSystem references, `LC_MAIN` and the versioning commands,
//! plus the `dyld_stub_binder` import every dynamically linked executable
//! carries.

use super::{align_up, Image, OutputMode};
use crate::commands::LoadCommand;
use crate::errors::LinkError;
use crate::macho_format::*;
use crate::target;
use target_lexicon::Architecture;

impl Image {
    /// Idempotent: every command slot that is already set is left alone.
    pub(crate) fn populate_missing_metadata(&mut self) -> Result<(), LinkError> {
        if self.header.is_none() {
            let (cputype, cpusubtype) = target::cpu_type(&self.options.target)?;
            let filetype = match self.options.output_mode {
                OutputMode::Exe => MH_EXECUTE,
                OutputMode::Obj => MH_OBJECT,
                // Rejected in open_path.
                OutputMode::Lib => return Err(LinkError::TodoImplementWritingLibFiles),
            };
            self.header = Some(MachHeader64 {
                magic: MH_MAGIC_64,
                cputype,
                cpusubtype,
                filetype,
                ncmds: 0,
                sizeofcmds: 0,
                flags: MH_NOUNDEFS | MH_DYLDLINK | MH_PIE,
                reserved: 0,
            });
            self.cmd_table_dirty = true;
        }

        if self.pagezero_segment_cmd_index.is_none() {
            self.pagezero_segment_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Segment {
                seg: SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
                    segname: name16(SEG_PAGEZERO),
                    vmaddr: 0,
                    vmsize: PAGEZERO_VMSIZE,
                    fileoff: 0,
                    filesize: 0,
                    maxprot: VmProt::empty().bits(),
                    initprot: VmProt::empty().bits(),
                    nsects: 0,
                    flags: 0,
                },
                sections: Vec::new(),
            });
            self.cmd_table_dirty = true;
        }

        if self.text_segment_cmd_index.is_none() {
            self.text_segment_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Segment {
                seg: SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
                    segname: name16(SEG_TEXT),
                    vmaddr: PAGEZERO_VMSIZE,
                    vmsize: 0,
                    fileoff: 0,
                    filesize: 0,
                    maxprot: (VmProt::READ | VmProt::WRITE | VmProt::EXECUTE).bits(),
                    initprot: (VmProt::READ | VmProt::EXECUTE).bits(),
                    nsects: 0,
                    flags: 0,
                },
                sections: Vec::new(),
            });
            self.cmd_table_dirty = true;
        }

        if self.text_section_index.is_none() {
            let file_size = align_up(self.options.program_code_size_hint, self.page_size);
            let offset = self.find_free_space(file_size, self.page_size);
            log::debug!("found __text section free space 0x{offset:x} to 0x{:x}", offset + file_size);

            let section_align = match self.arch() {
                Architecture::Aarch64(_) => 2,
                _ => 0,
            };
            let text_segment = self.text_segment_mut();
            let section = Section64 {
                sectname: name16(SECT_TEXT),
                segname: name16(SEG_TEXT),
                addr: text_segment.vmaddr + offset,
                size: file_size,
                offset: offset as u32,
                align: section_align,
                reloff: 0,
                nreloc: 0,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                reserved1: 0,
                reserved2: 0,
                reserved3: 0,
            };
            // The segment maps from offset zero, so the header and command
            // table in front of __text are part of it.
            text_segment.vmsize = offset + file_size;
            text_segment.filesize = offset + file_size;
            text_segment.cmdsize += SIZEOF_SECTION_64 as u32;
            text_segment.nsects += 1;

            let Some(segment_index) = self.text_segment_cmd_index else {
                unreachable!("__TEXT created above");
            };
            let LoadCommand::Segment { sections, .. } = &mut self.commands[segment_index] else {
                unreachable!("__TEXT created above");
            };
            self.text_section_index = Some(sections.len());
            sections.push(section);
            self.cmd_table_dirty = true;
        }

        if self.got_section_index.is_none() {
            let got_size = self.options.symbol_count_hint * 8;
            let growth = align_up(got_size, self.page_size);
            let text_section = *self.text_section();

            let text_segment = self.text_segment_mut();
            let section = Section64 {
                sectname: name16(SECT_GOT),
                segname: name16(SEG_TEXT),
                addr: text_section.addr + text_section.size,
                size: got_size,
                offset: text_section.offset + text_section.size as u32,
                align: 3,
                reloff: 0,
                nreloc: 0,
                flags: S_REGULAR | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                reserved1: 0,
                reserved2: 0,
                reserved3: 0,
            };
            text_segment.vmsize += growth;
            text_segment.filesize += growth;
            text_segment.cmdsize += SIZEOF_SECTION_64 as u32;
            text_segment.nsects += 1;

            let Some(segment_index) = self.text_segment_cmd_index else {
                unreachable!("__TEXT created above");
            };
            let LoadCommand::Segment { sections, .. } = &mut self.commands[segment_index] else {
                unreachable!("__TEXT created above");
            };
            self.got_section_index = Some(sections.len());
            sections.push(section);
            self.cmd_table_dirty = true;
        }

        if self.linkedit_segment_cmd_index.is_none() {
            let text_segment = *self.text_segment();
            self.linkedit_segment_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Segment {
                seg: SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
                    segname: name16(SEG_LINKEDIT),
                    vmaddr: text_segment.vmaddr + text_segment.vmsize,
                    vmsize: 0,
                    fileoff: text_segment.fileoff + text_segment.filesize,
                    filesize: 0,
                    maxprot: (VmProt::READ | VmProt::WRITE | VmProt::EXECUTE).bits(),
                    initprot: VmProt::READ.bits(),
                    nsects: 0,
                    flags: 0,
                },
                sections: Vec::new(),
            });
            self.linkedit_segment_next_offset =
                Some(text_segment.fileoff + text_segment.filesize);
            self.cmd_table_dirty = true;
        }

        if self.dyld_info_cmd_index.is_none() {
            self.dyld_info_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::DyldInfoOnly(DyldInfoCommand {
                cmd: LC_DYLD_INFO_ONLY,
                cmdsize: std::mem::size_of::<DyldInfoCommand>() as u32,
                ..Default::default()
            }));
            self.cmd_table_dirty = true;
        }

        if self.symtab_cmd_index.is_none() {
            self.symtab_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Symtab(SymtabCommand {
                cmd: LC_SYMTAB,
                cmdsize: std::mem::size_of::<SymtabCommand>() as u32,
                ..Default::default()
            }));
            self.cmd_table_dirty = true;
        }

        if self.dysymtab_cmd_index.is_none() {
            self.dysymtab_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Dysymtab(DysymtabCommand {
                cmd: LC_DYSYMTAB,
                cmdsize: std::mem::size_of::<DysymtabCommand>() as u32,
                ..Default::default()
            }));
            self.cmd_table_dirty = true;
        }

        if self.dylinker_cmd_index.is_none() {
            let name_offset = std::mem::size_of::<DylinkerCommand>() as u32;
            let cmdsize = align_up(u64::from(name_offset) + DYLD_PATH.len() as u64, 8) as u32;
            let mut name = DYLD_PATH.as_bytes().to_vec();
            name.resize((cmdsize - name_offset) as usize, 0);
            self.dylinker_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Dylinker {
                cmd: DylinkerCommand {
                    cmd: LC_LOAD_DYLINKER,
                    cmdsize,
                    name: name_offset,
                },
                name,
            });
            self.cmd_table_dirty = true;
        }

        if self.libsystem_cmd_index.is_none() {
            let name_offset = std::mem::size_of::<DylibCommand>() as u32;
            let cmdsize = align_up(u64::from(name_offset) + LIB_SYSTEM_PATH.len() as u64, 8) as u32;
            let mut name = LIB_SYSTEM_PATH.as_bytes().to_vec();
            name.resize((cmdsize - name_offset) as usize, 0);
            self.libsystem_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Dylib {
                cmd: DylibCommand {
                    cmd: LC_LOAD_DYLIB,
                    cmdsize,
                    dylib: Dylib {
                        name: name_offset,
                        timestamp: 2,
                        current_version: 0,
                        compatibility_version: 0,
                    },
                },
                name,
            });
            self.cmd_table_dirty = true;
        }

        if self.main_cmd_index.is_none() {
            self.main_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Main(EntryPointCommand {
                cmd: LC_MAIN,
                cmdsize: std::mem::size_of::<EntryPointCommand>() as u32,
                entryoff: 0,
                stacksize: 0,
            }));
            self.cmd_table_dirty = true;
        }

        if self.version_min_cmd_index.is_none() {
            let (cmd, version) = target::version_min(&self.options.target)?;
            self.version_min_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::VersionMin(VersionMinCommand {
                cmd,
                cmdsize: std::mem::size_of::<VersionMinCommand>() as u32,
                version,
                sdk: version,
            }));
            self.cmd_table_dirty = true;
        }

        if self.source_version_cmd_index.is_none() {
            self.source_version_cmd_index = Some(self.commands.len());
            self.commands
                .push(LoadCommand::SourceVersion(SourceVersionCommand {
                    cmd: LC_SOURCE_VERSION,
                    cmdsize: std::mem::size_of::<SourceVersionCommand>() as u32,
                    version: 0,
                }));
            self.cmd_table_dirty = true;
        }

        if self.uuid_cmd_index.is_none() {
            // Deterministic output: the UUID stays zero rather than random.
            self.uuid_cmd_index = Some(self.commands.len());
            self.commands.push(LoadCommand::Uuid(UuidCommand {
                cmd: LC_UUID,
                cmdsize: std::mem::size_of::<UuidCommand>() as u32,
                uuid: [0; 16],
            }));
            self.cmd_table_dirty = true;
        }

        if self.code_signature_cmd_index.is_none() {
            self.code_signature_cmd_index = Some(self.commands.len());
            self.commands
                .push(LoadCommand::CodeSignature(LinkeditDataCommand {
                    cmd: LC_CODE_SIGNATURE,
                    cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                    dataoff: 0,
                    datasize: 0,
                }));
            self.cmd_table_dirty = true;
        }

        if self.undef_symbols.is_empty() {
            // dyld resolves GOT-style bindings through this import.
            let n_strx = self.make_string("dyld_stub_binder");
            self.undef_symbols.push(Nlist64 {
                n_strx,
                n_type: N_UNDF | N_EXT,
                n_sect: 0,
                n_desc: REFERENCE_FLAG_UNDEFINED_NON_LAZY,
                n_value: 0,
            });
        }

        Ok(())
    }
}
