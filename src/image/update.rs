//! The per-decl update pipeline: reserving symbol and GOT slots, applying
//! freshly generated code and its PIE fixups to the image, maintaining the
//! export (global) symbols, and releasing everything when a decl dies.

use super::{blocks::BlockId, Image, OutputMode};
use crate::errors::LinkError;
use crate::macho_format::*;
use crate::module::{DeclIndex, GeneratedCode, Linkage, Module, PieFixup};
use target_lexicon::Architecture;

impl Image {
    /// Reserves a local symbol and a GOT slot for the decl, preferring
    /// recycled ones. Idempotent once the decl has its indexes.
    pub fn allocate_decl_indexes(&mut self, decl: &mut crate::module::Decl) -> BlockId {
        if let Some(block_id) = decl.block {
            if self.blk(block_id).local_sym_index != 0 {
                return block_id;
            }
        }
        let block_id = match decl.block {
            Some(id) => id,
            None => {
                let id = self.blocks.insert();
                decl.block = Some(id);
                id
            }
        };

        let local_sym_index = match self.local_symbol_free_list.pop() {
            Some(index) => {
                log::debug!("reusing local symbol index {local_sym_index}", local_sym_index = index);
                index
            }
            None => {
                let index = self.local_symbols.len() as u32;
                self.local_symbols.push(Nlist64::default());
                index
            }
        };
        let offset_table_index = match self.offset_table_free_list.pop() {
            Some(index) => index,
            None => {
                let index = self.offset_table.len() as u32;
                self.offset_table.push(0);
                index
            }
        };
        self.local_symbols[local_sym_index as usize] = Nlist64::default();
        self.offset_table[offset_table_index as usize] = 0;

        let block = self.blk_mut(block_id);
        block.local_sym_index = local_sym_index;
        block.offset_table_index = offset_table_index;
        block_id
    }

    /// Regenerates the decl's code and patches it into the file, growing,
    /// shrinking or relocating its text block as needed. Code generation
    /// failures are recorded on the module, not returned.
    pub fn update_decl(&mut self, module: &mut Module, decl_index: DeclIndex) -> Result<(), LinkError> {
        if self.options.output_mode == OutputMode::Obj {
            return Err(LinkError::TodoImplementWritingObjFiles);
        }

        let generated = {
            let Module { codegen, decls, .. } = module;
            codegen.generate(&decls[decl_index.as_usize()])
        };
        let GeneratedCode { mut code, fixups } = match generated {
            Ok(generated) => generated,
            Err(message) => {
                module.failed_decls.insert(decl_index, message);
                return Ok(());
            }
        };

        let (block_id, name, required_alignment) = {
            let decl = &mut module.decls[decl_index.as_usize()];
            let block_id = self.allocate_decl_indexes(decl);
            (block_id, decl.name.clone(), decl.alignment.max(1))
        };
        let local_sym_index = self.blk(block_id).local_sym_index as usize;
        let code_len = code.len() as u64;

        if self.blk(block_id).size != 0 {
            let capacity = self.block_capacity(block_id);
            let old_vaddr = self.local_symbols[local_sym_index].n_value;
            let need_realloc = code_len > capacity
                || super::align_down(old_vaddr, required_alignment) != old_vaddr;
            if need_realloc {
                let vaddr = self.grow_text_block(block_id, code_len, required_alignment)?;
                if vaddr != old_vaddr {
                    log::debug!("growing {name} from 0x{old_vaddr:x} to 0x{vaddr:x}");
                    self.local_symbols[local_sym_index].n_value = vaddr;
                    let offset_table_index = self.blk(block_id).offset_table_index as usize;
                    self.offset_table[offset_table_index] = vaddr;
                    self.write_offset_table_entry(offset_table_index)?;
                }
            } else if code_len < self.blk(block_id).size {
                self.shrink_text_block(block_id, code_len);
            }
            self.blk_mut(block_id).size = code_len;

            let n_sect = self.n_sect_ordinal();
            let symbol = &mut self.local_symbols[local_sym_index];
            let n_strx = symbol.n_strx;
            symbol.n_type = N_SECT;
            symbol.n_sect = n_sect;
            symbol.n_desc = 0;
            let n_strx = self.update_string(n_strx, &name);
            self.local_symbols[local_sym_index].n_strx = n_strx;
        } else {
            let n_strx = self.make_string(&name);
            let vaddr = self.allocate_text_block(block_id, code_len, required_alignment)?;
            log::debug!("allocated text block for {name} at 0x{vaddr:x}");

            self.local_symbols[local_sym_index] = Nlist64 {
                n_strx,
                n_type: N_SECT,
                n_sect: self.n_sect_ordinal(),
                n_desc: 0,
                n_value: vaddr,
            };
            let offset_table_index = self.blk(block_id).offset_table_index as usize;
            self.offset_table[offset_table_index] = vaddr;
            self.write_offset_table_entry(offset_table_index)?;
        }

        let vaddr = self.local_symbols[local_sym_index].n_value;
        self.apply_pie_fixups(&mut code, vaddr, &fixups);

        let text_section = *self.text_section();
        let file_offset = u64::from(text_section.offset) + (vaddr - text_section.addr);
        self.pwrite_all(&code, file_offset)?;

        self.update_decl_exports(module, decl_index)
    }

    /// Patches PC-relative references into the generated code before it
    /// hits the file.
    fn apply_pie_fixups(&self, code: &mut [u8], vaddr: u64, fixups: &[PieFixup]) {
        for fixup in fixups {
            let this_addr = vaddr + fixup.start as u64;
            let target_addr = fixup.address;
            match self.arch() {
                Architecture::X86_64 => {
                    // 32-bit displacement relative to the end of the fixup.
                    let displacement =
                        target_addr.wrapping_sub(this_addr).wrapping_sub(fixup.len as u64) as u32;
                    let end = fixup.start + fixup.len;
                    code[end - 4..end].copy_from_slice(&displacement.to_le_bytes());
                }
                Architecture::Aarch64(_) => {
                    debug_assert_eq!(fixup.len, 4);
                    // Unconditional branch; the offset must fit 27 bits.
                    let displacement = target_addr.wrapping_sub(this_addr) as i64;
                    debug_assert!((-(1i64 << 27)..(1i64 << 27)).contains(&displacement));
                    let imm26 = ((displacement >> 2) as u32) & 0x03ff_ffff;
                    let instruction = 0x1400_0000 | imm26;
                    code[fixup.start..fixup.start + 4]
                        .copy_from_slice(&instruction.to_le_bytes());
                }
                _ => unreachable!("unsupported architecture is rejected at open"),
            }
        }
    }

    /// Writes one GOT slot: an 8-byte stub that loads the slot's target
    /// address into a scratch register and returns, computing the target
    /// relative to its own address.
    pub(crate) fn write_offset_table_entry(&mut self, index: usize) -> Result<(), LinkError> {
        let got_section = *self.got_section();
        let slot_vaddr = got_section.addr + index as u64 * 8;
        let file_offset = u64::from(got_section.offset) + index as u64 * 8;
        let target_addr = self.offset_table[index];

        let mut stub = [0u8; 8];
        match self.arch() {
            Architecture::X86_64 => {
                // lea rax, [rip - disp]; ret
                stub[0] = 0x48;
                stub[1] = 0x8d;
                stub[2] = 0x05;
                let displacement = ((slot_vaddr + 7) - target_addr) as u32;
                stub[3..7].copy_from_slice(&displacement.wrapping_neg().to_le_bytes());
                stub[7] = 0xc3;
            }
            Architecture::Aarch64(_) => {
                // adr x0, #-disp; ret x28
                let displacement = slot_vaddr.wrapping_sub(target_addr) as i64;
                debug_assert!(displacement.unsigned_abs() < (1u64 << 20));
                let imm21 = ((-displacement) as u32) & 0x1f_ffff;
                let adr = 0x1000_0000 | ((imm21 & 0x3) << 29) | ((imm21 >> 2) << 5);
                stub[0..4].copy_from_slice(&adr.to_le_bytes());
                let ret: u32 = 0xd65f_0000 | (28 << 5);
                stub[4..8].copy_from_slice(&ret.to_le_bytes());
            }
            _ => unreachable!("unsupported architecture is rejected at open"),
        }
        self.pwrite_all(&stub, file_offset)
    }

    /// Refreshes the global symbols for the decl's exports (read from
    /// `module.decl_exports`). Unsupported linkages and sections become
    /// per-export failures on the module.
    pub fn update_decl_exports(
        &mut self,
        module: &mut Module,
        decl_index: DeclIndex,
    ) -> Result<(), LinkError> {
        let Module {
            decls,
            decl_exports,
            failed_exports,
            ..
        } = module;

        let decl = &decls[decl_index.as_usize()];
        let Some(block_id) = decl.block else {
            return Ok(());
        };
        let local_sym_index = self.blk(block_id).local_sym_index;
        if local_sym_index == 0 {
            return Ok(());
        }
        let decl_sym = self.local_symbols[local_sym_index as usize];

        let Some(exports) = decl_exports.get_mut(&decl_index) else {
            return Ok(());
        };
        for (position, export) in exports.iter_mut().enumerate() {
            if let Some(section) = &export.section {
                if section != "__text" {
                    failed_exports.insert(
                        (decl_index, position),
                        "Unimplemented: exports in sections other than __text".to_owned(),
                    );
                    continue;
                }
            }
            let n_desc = match export.linkage {
                Linkage::Internal => REFERENCE_FLAG_PRIVATE_DEFINED,
                Linkage::Strong => {
                    if export.name == "_start" {
                        self.entry_addr = Some(decl_sym.n_value);
                        self.cmd_table_dirty = true;
                    }
                    REFERENCE_FLAG_DEFINED
                }
                Linkage::Weak => N_WEAK_REF,
                Linkage::LinkOnce => {
                    failed_exports.insert(
                        (decl_index, position),
                        "Unimplemented: GlobalLinkage.LinkOnce".to_owned(),
                    );
                    continue;
                }
            };
            let n_type = decl_sym.n_type | N_EXT;
            let n_sect = self.n_sect_ordinal();

            match export.global_sym_index {
                Some(index) => {
                    let n_strx = self.global_symbols[index as usize].n_strx;
                    let n_strx = self.update_string(n_strx, &export.name);
                    self.global_symbols[index as usize] = Nlist64 {
                        n_strx,
                        n_type,
                        n_sect,
                        n_desc,
                        n_value: decl_sym.n_value,
                    };
                }
                None => {
                    let n_strx = self.make_string(&export.name);
                    let symbol = Nlist64 {
                        n_strx,
                        n_type,
                        n_sect,
                        n_desc,
                        n_value: decl_sym.n_value,
                    };
                    let index = match self.global_symbol_free_list.pop() {
                        Some(index) => {
                            self.global_symbols[index as usize] = symbol;
                            index
                        }
                        None => {
                            self.global_symbols.push(symbol);
                            (self.global_symbols.len() - 1) as u32
                        }
                    };
                    export.global_sym_index = Some(index);
                }
            }
        }
        Ok(())
    }

    /// Retires an export's global symbol. The slot's name and value stay
    /// behind as debris; a zeroed `n_type` marks it dead.
    pub fn delete_export(&mut self, export: &mut crate::module::Export) {
        let Some(index) = export.global_sym_index.take() else {
            return;
        };
        self.global_symbol_free_list.push(index);
        self.global_symbols[index as usize].n_type = 0;
    }

    /// Releases the decl's block, symbol and GOT slot back to their free
    /// lists.
    pub fn free_decl(&mut self, decl: &mut crate::module::Decl) {
        let Some(block_id) = decl.block.take() else {
            return;
        };
        let (local_sym_index, offset_table_index) = {
            let block = self.blk(block_id);
            (block.local_sym_index, block.offset_table_index)
        };
        self.free_text_block(block_id);
        if local_sym_index != 0 {
            self.local_symbol_free_list.push(local_sym_index);
            self.offset_table_free_list.push(offset_table_index);
            self.local_symbols[local_sym_index as usize].n_type = 0;
        }
    }

    /// 1-based ordinal of `__text` for `n_sect`; section ordinals count
    /// across all segments and `__text` is always the first section.
    fn n_sect_ordinal(&self) -> u8 {
        self.text_section_index.map_or(0, |index| index as u8 + 1)
    }
}
