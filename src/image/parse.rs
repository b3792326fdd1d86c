//! Re-reading an existing binary — typically one produced by the external
//! system linker — far enough to locate `__TEXT`, `__LINKEDIT`, the symtab
//! and any existing signature, so an ad-hoc code signature can be injected
//! or refreshed in place.

use scroll::{Pread, LE};

use super::{align_up, Image, LinkOptions};
use crate::commands::LoadCommand;
use crate::errors::LinkError;
use crate::macho_format::*;

impl Image {
    /// Opens `path` and rebuilds the command table and canonical indices
    /// from its on-disk header.
    pub fn parse_from_file(path: &std::path::Path, options: LinkOptions) -> Result<Image, LinkError> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let mut image = Image::new(file, path.to_owned(), options);
        image.parse_from_disk()?;
        Ok(image)
    }

    fn parse_from_disk(&mut self) -> Result<(), LinkError> {
        let mut header_buf = [0u8; SIZEOF_MACH_HEADER_64];
        self.pread_exact(&mut header_buf, 0)?;
        let header: MachHeader64 = header_buf.pread_with(0, LE)?;
        if header.magic != MH_MAGIC_64 {
            return Err(LinkError::InvalidMachHeader);
        }

        let mut commands_buf = vec![0u8; header.sizeofcmds as usize];
        self.pread_exact(&mut commands_buf, SIZEOF_MACH_HEADER_64 as u64)?;

        let mut offset = 0usize;
        for _ in 0..header.ncmds {
            if offset >= commands_buf.len() {
                return Err(LinkError::InvalidMachHeader);
            }
            let command = LoadCommand::parse(&commands_buf[offset..])?;
            let index = self.commands.len();
            match &command {
                LoadCommand::Segment { seg, sections } => {
                    if seg.segname == name16(SEG_PAGEZERO) {
                        self.pagezero_segment_cmd_index = Some(index);
                    } else if seg.segname == name16(SEG_LINKEDIT) {
                        self.linkedit_segment_cmd_index = Some(index);
                    } else if seg.segname == name16(SEG_TEXT) {
                        self.text_segment_cmd_index = Some(index);
                        for (section_index, section) in sections.iter().enumerate() {
                            if section.sectname == name16(SECT_GOT) {
                                self.got_section_index = Some(section_index);
                            } else if section.sectname == name16(SECT_TEXT) {
                                self.text_section_index = Some(section_index);
                            }
                        }
                    }
                }
                LoadCommand::Symtab(_) => self.symtab_cmd_index = Some(index),
                LoadCommand::Dysymtab(_) => self.dysymtab_cmd_index = Some(index),
                LoadCommand::DyldInfoOnly(_) => self.dyld_info_cmd_index = Some(index),
                LoadCommand::Main(_) => self.main_cmd_index = Some(index),
                LoadCommand::CodeSignature(_) => self.code_signature_cmd_index = Some(index),
                _ => {}
            }
            offset += command.cmdsize() as usize;
            self.commands.push(command);
        }

        log::debug!(
            "parsed {} load commands from {}",
            self.commands.len(),
            self.path().display()
        );
        self.header = Some(header);
        Ok(())
    }

    /// Appends an `LC_CODE_SIGNATURE` command if the binary has none, then
    /// reserves padding at the end of `__LINKEDIT`, rewrites the command
    /// table and header, and signs the file.
    pub fn write_code_signature_after_external_link(&mut self) -> Result<(), LinkError> {
        if self.text_segment_cmd_index.is_none()
            || self.text_section_index.is_none()
            || self.linkedit_segment_cmd_index.is_none()
        {
            return Err(LinkError::InvalidMachHeader);
        }

        if self.code_signature_cmd_index.is_none() {
            // The command table grows in front of __text; make sure it
            // still fits.
            let command_table_end = SIZEOF_MACH_HEADER_64 as u64
                + u64::from(self.size_of_cmds())
                + SIZEOF_LINKEDIT_DATA_COMMAND as u64;
            if command_table_end > u64::from(self.text_section().offset) {
                return Err(LinkError::NotEnoughPadding);
            }
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

        let linkedit = *self.linkedit_segment();
        let existing = *self.code_signature_cmd();
        let dataoff = if existing.dataoff != 0 {
            // Re-signing: the old blob's spot is reused.
            u64::from(existing.dataoff)
        } else {
            align_up(linkedit.fileoff + linkedit.filesize, 16)
        };
        let ident = self
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_owned());
        let datasize = crate::codesig::signature_size(&ident, dataoff, self.page_size());
        self.pwrite_all(&[0], dataoff + datasize - 1)?;

        {
            let code_signature = self.code_signature_cmd_mut();
            code_signature.dataoff = dataoff as u32;
            code_signature.datasize = datasize as u32;
        }
        {
            let page_size = self.page_size();
            let linkedit = self.linkedit_segment_mut();
            let filesize = dataoff + datasize - linkedit.fileoff;
            if filesize > linkedit.filesize {
                linkedit.filesize = filesize;
            }
            let vmsize = align_up(linkedit.filesize, page_size);
            if vmsize > linkedit.vmsize {
                linkedit.vmsize = vmsize;
            }
        }

        self.write_load_commands()?;
        self.write_header()?;
        self.cmd_table_dirty = false;
        self.write_code_signature()
    }
}
