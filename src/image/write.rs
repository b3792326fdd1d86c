//! Flush-time serialization: export trie, symbol and string tables,
//! code-signature padding, the load-command table and header, and finally
//! the ad-hoc signature itself.
//!
//! The steps run in a fixed order because each link-edit write claims the
//! next free offset inside `__LINKEDIT`, and the signature must hash every
//! byte that precedes it.

use scroll::{Pwrite, LE};

use super::{align_up, Image, OutputMode};
use crate::codesig::{self, AdHocSignature};
use crate::errors::LinkError;
use crate::macho_format::*;
use crate::trie::Trie;

impl Image {
    /// Writes all dirty metadata for the current module state and signs
    /// the result.
    pub fn flush_module(&mut self) -> Result<(), LinkError> {
        match self.options.output_mode {
            OutputMode::Lib => return Err(LinkError::TodoImplementWritingLibFiles),
            OutputMode::Obj => {
                // No link-edit content is maintained for object files yet;
                // only the header and command table hit the disk.
                if self.cmd_table_dirty {
                    self.write_load_commands()?;
                    self.write_header()?;
                    self.cmd_table_dirty = false;
                }
                return Ok(());
            }
            OutputMode::Exe => {}
        }

        if let Some(entry_addr) = self.entry_addr {
            let text_vmaddr = self.text_segment().vmaddr;
            let entryoff = entry_addr - text_vmaddr;
            if self.main_cmd().entryoff != entryoff {
                self.main_cmd_mut().entryoff = entryoff;
                self.cmd_table_dirty = true;
            }
        }

        self.write_export_trie()?;
        self.write_symbol_table()?;
        self.write_string_table()?;
        self.write_code_signature_padding()?;

        self.error_flags.no_entry_point_found = self.entry_addr.is_none();

        if self.cmd_table_dirty {
            self.write_load_commands()?;
            self.write_header()?;
            self.cmd_table_dirty = false;
        }

        // Must come last: it hashes everything written above.
        self.write_code_signature()?;
        Ok(())
    }

    /// Incremental flush entry point; external-link mode goes through
    /// [`Image::flush_with_external_linker`] instead.
    pub fn flush(&mut self) -> Result<(), LinkError> {
        self.flush_module()
    }

    /// Full-link mode: spawns the system linker over `objects`, replacing
    /// this image's file, then re-reads the result and signs it.
    pub fn flush_with_external_linker(
        &mut self,
        objects: &[std::path::PathBuf],
    ) -> Result<(), LinkError> {
        let linker = self
            .options
            .system_linker
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("ld"));
        log::debug!("spawning {} for {}", linker.display(), self.path().display());

        let output = std::process::Command::new(&linker)
            .args(&self.options.extra_linker_args)
            .args(objects)
            .arg("-o")
            .arg(self.path())
            .output()?;
        if !output.status.success() {
            return Err(LinkError::ExternalLinkerFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let mut linked = Image::parse_from_file(&self.path().to_owned(), self.options.clone())?;
        linked.write_code_signature_after_external_link()
    }

    fn linkedit_next_offset(&self) -> u64 {
        self.linkedit_segment_next_offset
            .unwrap_or_else(|| self.linkedit_segment().fileoff)
    }

    /// Claims `[old next offset, new_end)` inside `__LINKEDIT`, growing the
    /// segment's file size and (page-aligned) vm size.
    fn advance_linkedit(&mut self, new_end: u64) {
        self.linkedit_segment_next_offset = Some(new_end);
        let page_size = self.page_size;
        let linkedit = self.linkedit_segment_mut();
        let filesize = new_end - linkedit.fileoff;
        if filesize > linkedit.filesize {
            linkedit.filesize = filesize;
        }
        let vmsize = align_up(linkedit.filesize, page_size);
        if vmsize > linkedit.vmsize {
            linkedit.vmsize = vmsize;
        }
    }

    /// Serializes the export trie from the live global symbols. Skipped
    /// while nothing is exported.
    fn write_export_trie(&mut self) -> Result<(), LinkError> {
        let text_vmaddr = self.text_segment().vmaddr;
        let mut trie = Trie::new();
        for symbol in &self.global_symbols {
            if symbol.n_type == 0 {
                // Freed slot debris.
                continue;
            }
            trie.put(self.get_string(symbol.n_strx), symbol.n_value - text_vmaddr);
        }
        if trie.is_empty() {
            return Ok(());
        }

        let mut bytes = trie.to_bytes();
        bytes.resize(align_up(bytes.len() as u64, 8) as usize, 0);
        let offset = self.linkedit_next_offset();
        log::debug!("writing export trie at 0x{offset:x} ({} bytes)", bytes.len());
        self.pwrite_all(&bytes, offset)?;

        let dyld_info = self.dyld_info_cmd_mut();
        dyld_info.export_off = offset as u32;
        dyld_info.export_size = bytes.len() as u32;
        self.advance_linkedit(offset + bytes.len() as u64);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Writes locals, globals and undefs contiguously and points the
    /// symtab/dysymtab commands at the three ranges.
    fn write_symbol_table(&mut self) -> Result<(), LinkError> {
        let nlocals = self.local_symbols.len();
        let nglobals = self.global_symbols.len();
        let nundefs = self.undef_symbols.len();
        let nsyms = nlocals + nglobals + nundefs;

        let mut buf = vec![0u8; nsyms * SIZEOF_NLIST_64];
        let mut cursor = 0;
        for symbol in self
            .local_symbols
            .iter()
            .chain(self.global_symbols.iter())
            .chain(self.undef_symbols.iter())
        {
            buf.gwrite_with(*symbol, &mut cursor, LE)?;
        }

        let offset = self.linkedit_next_offset();
        log::debug!("writing {nsyms} symbols at 0x{offset:x}");
        self.pwrite_all(&buf, offset)?;

        let symtab = self.symtab_cmd_mut();
        symtab.symoff = offset as u32;
        symtab.nsyms = nsyms as u32;

        let dysymtab = self.dysymtab_cmd_mut();
        dysymtab.ilocalsym = 0;
        dysymtab.nlocalsym = nlocals as u32;
        dysymtab.iextdefsym = nlocals as u32;
        dysymtab.nextdefsym = nglobals as u32;
        dysymtab.iundefsym = (nlocals + nglobals) as u32;
        dysymtab.nundefsym = nundefs as u32;

        self.advance_linkedit(offset + buf.len() as u64);
        self.cmd_table_dirty = true;
        Ok(())
    }

    fn write_string_table(&mut self) -> Result<(), LinkError> {
        let offset = self.linkedit_next_offset();
        let strsize = align_up(self.string_table.len() as u64, 8);
        log::debug!("writing string table at 0x{offset:x} ({strsize} bytes)");
        self.pwrite_all(&self.string_table, offset)?;
        if strsize > self.string_table.len() as u64 {
            // Make the padding file-backed.
            self.pwrite_all(&[0], offset + strsize - 1)?;
        }

        let symtab = self.symtab_cmd_mut();
        symtab.stroff = offset as u32;
        symtab.strsize = strsize as u32;
        self.advance_linkedit(offset + strsize);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Reserves the signature's range at the end of `__LINKEDIT` so the
    /// command table can be finalized before the hashes are computed.
    fn write_code_signature_padding(&mut self) -> Result<(), LinkError> {
        // The blob must start 16-byte aligned.
        let dataoff = align_up(self.linkedit_next_offset(), 16);
        let ident = self.signature_ident();
        let datasize = codesig::signature_size(&ident, dataoff, self.page_size);
        log::debug!("reserving code signature padding at 0x{dataoff:x} ({datasize} bytes)");
        // Back the whole reserved range with file content.
        self.pwrite_all(&[0], dataoff + datasize - 1)?;

        let code_signature = self.code_signature_cmd_mut();
        code_signature.dataoff = dataoff as u32;
        code_signature.datasize = datasize as u32;
        self.advance_linkedit(dataoff + datasize);
        self.cmd_table_dirty = true;
        Ok(())
    }

    /// Hashes the file up to the signature and writes the SuperBlob into
    /// the reserved range.
    pub(crate) fn write_code_signature(&mut self) -> Result<(), LinkError> {
        let code_signature = *self.code_signature_cmd();
        let code_limit = u64::from(code_signature.dataoff);
        let ident = self.signature_ident();

        let mut signature = AdHocSignature::new(&ident, code_limit, self.page_size);
        let text_segment = *self.text_segment();
        signature.set_exec_segment(
            text_segment.fileoff,
            text_segment.filesize,
            self.options.output_mode == OutputMode::Exe,
        );

        let mut page = vec![0u8; self.page_size as usize];
        let mut offset = 0;
        while offset < code_limit {
            let len = (code_limit - offset).min(self.page_size) as usize;
            self.pread_exact(&mut page[..len], offset)?;
            signature.add_page(&page[..len]);
            offset += len as u64;
        }

        let blob = signature.to_bytes();
        debug_assert_eq!(blob.len() as u64, u64::from(code_signature.datasize));
        log::debug!(
            "writing code signature at 0x{:x} ({} bytes)",
            code_signature.dataoff,
            blob.len()
        );
        self.pwrite_all(&blob, u64::from(code_signature.dataoff))
    }

    /// Identifier embedded in the CodeDirectory: the output file name.
    fn signature_ident(&self) -> String {
        self.path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "a.out".to_owned())
    }

    /// Serializes every load command right behind the header.
    pub(crate) fn write_load_commands(&mut self) -> Result<(), LinkError> {
        let size = self.size_of_cmds() as usize;
        let mut buf = vec![0u8; size];
        let mut offset = 0;
        for command in &self.commands {
            command.write_into(&mut buf, &mut offset)?;
        }
        log::debug!("writing {} load commands ({size} bytes)", self.commands.len());
        self.pwrite_all(&buf, SIZEOF_MACH_HEADER_64 as u64)
    }

    pub(crate) fn write_header(&mut self) -> Result<(), LinkError> {
        let Some(header) = self.header.as_mut() else {
            return Err(LinkError::InvalidMachHeader);
        };
        header.ncmds = self.commands.len() as u32;
        header.sizeofcmds = self.commands.iter().map(|c| c.cmdsize()).sum();
        let header = *header;

        let mut buf = [0u8; SIZEOF_MACH_HEADER_64];
        buf.pwrite_with(header, 0, LE)?;
        self.pwrite_all(&buf, 0)
    }
}
