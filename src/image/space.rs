//! File-offset allocation. Every occupant of the file (header, command
//! table, sections, export trie, symbol and string tables) is treated as
//! owning a third more space than it currently uses, so in-place growth
//! stays cheap; candidate ranges are inflated the same way.

use super::{ideal_capacity, align_up, Image};
use crate::commands::LoadCommand;
use crate::macho_format::{SIZEOF_MACH_HEADER_64, SIZEOF_NLIST_64};

impl Image {
    /// Checks a proposed file range `[start, start + size * 4/3)` against
    /// every live region, returning the offset just past the first
    /// conflicting one.
    pub(crate) fn detect_alloc_collision(&self, start: u64, size: u64) -> Option<u64> {
        let header_size = SIZEOF_MACH_HEADER_64 as u64;
        if start < header_size {
            return Some(header_size);
        }

        let end = start.saturating_add(ideal_capacity(size));

        let cmds_start = header_size;
        let cmds_end = cmds_start + ideal_capacity(u64::from(self.size_of_cmds()));
        if end > cmds_start && start < cmds_end {
            return Some(cmds_end);
        }

        for command in &self.commands {
            let LoadCommand::Segment { sections, .. } = command else {
                continue;
            };
            for section in sections {
                let section_start = u64::from(section.offset);
                let section_end = section_start + ideal_capacity(section.size);
                if end > section_start && start < section_end {
                    return Some(section_end);
                }
            }
        }

        if let Some(i) = self.dyld_info_cmd_index {
            if let LoadCommand::DyldInfoOnly(dyld_info) = &self.commands[i] {
                if dyld_info.export_off != 0 {
                    let trie_start = u64::from(dyld_info.export_off);
                    let trie_end = trie_start + ideal_capacity(u64::from(dyld_info.export_size));
                    if end > trie_start && start < trie_end {
                        return Some(trie_end);
                    }
                }
            }
        }

        if let Some(i) = self.symtab_cmd_index {
            if let LoadCommand::Symtab(symtab) = &self.commands[i] {
                if symtab.symoff != 0 {
                    let symtab_start = u64::from(symtab.symoff);
                    let symtab_size = u64::from(symtab.nsyms) * SIZEOF_NLIST_64 as u64;
                    let symtab_end = symtab_start + ideal_capacity(symtab_size);
                    if end > symtab_start && start < symtab_end {
                        return Some(symtab_end);
                    }
                }
                if symtab.stroff != 0 {
                    let strtab_start = u64::from(symtab.stroff);
                    let strtab_end = strtab_start + ideal_capacity(u64::from(symtab.strsize));
                    if end > strtab_start && start < strtab_end {
                        return Some(strtab_end);
                    }
                }
            }
        }

        None
    }

    /// Distance from `start` to the next occupied file offset above it.
    pub(crate) fn allocated_size(&self, start: u64) -> u64 {
        if start == 0 {
            return 0;
        }
        let mut min_pos = u64::MAX;
        for command in &self.commands {
            match command {
                LoadCommand::Segment { sections, .. } => {
                    for section in sections {
                        let offset = u64::from(section.offset);
                        if offset > start && offset < min_pos {
                            min_pos = offset;
                        }
                    }
                }
                LoadCommand::DyldInfoOnly(dyld_info) => {
                    let offset = u64::from(dyld_info.export_off);
                    if offset > start && offset < min_pos {
                        min_pos = offset;
                    }
                }
                LoadCommand::Symtab(symtab) => {
                    let symoff = u64::from(symtab.symoff);
                    if symoff > start && symoff < min_pos {
                        min_pos = symoff;
                    }
                    let stroff = u64::from(symtab.stroff);
                    if stroff > start && stroff < min_pos {
                        min_pos = stroff;
                    }
                }
                _ => {}
            }
        }
        min_pos - start
    }

    /// First file offset at which `size` bytes (plus slack) fit without
    /// disturbing any occupant.
    pub(crate) fn find_free_space(&self, size: u64, alignment: u64) -> u64 {
        let mut start = 0;
        while let Some(collision_end) = self.detect_alloc_collision(start, size) {
            start = align_up(collision_end, alignment);
        }
        start
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::image::{LinkOptions, OutputMode};
    use std::str::FromStr;

    fn test_image(dir: &tempfile::TempDir) -> Image {
        let triple = target_lexicon::Triple::from_str("x86_64-apple-darwin").expect("triple");
        let mut options = LinkOptions::new(triple, OutputMode::Exe);
        options.program_code_size_hint = 0x1000;
        options.symbol_count_hint = 16;
        Image::open_path(&dir.path().join("space.bin"), options).expect("open image")
    }

    #[test]
    fn header_is_always_occupied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = test_image(&dir);
        assert_eq!(
            image.detect_alloc_collision(0, 8),
            Some(SIZEOF_MACH_HEADER_64 as u64)
        );
        assert_eq!(image.allocated_size(0), 0);
    }

    #[test]
    fn sections_collide_with_slack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = test_image(&dir);
        let text = *image.text_section();

        // A candidate inside the section's inflated range bounces to its end.
        let collision = image
            .detect_alloc_collision(u64::from(text.offset), 8)
            .expect("collision with __text");
        assert_eq!(collision, u64::from(text.offset) + ideal_capacity(text.size));

        // The reserved range between __text and __got is exactly what the
        // free-space probe reports as allocated.
        let got = *image.got_section();
        assert_eq!(
            image.allocated_size(u64::from(text.offset)),
            u64::from(got.offset) - u64::from(text.offset)
        );
    }

    #[test]
    fn find_free_space_skips_all_occupants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = test_image(&dir);
        let free = image.find_free_space(0x100, 0x1000);

        assert_eq!(free % 0x1000, 0);
        assert_eq!(image.detect_alloc_collision(free, 0x100), None);
    }
}
