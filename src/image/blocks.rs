//! Text-block management: every decl's machine code lives in a block inside
//! `__text`, threaded into a doubly-linked list in ascending virtual-address
//! order. Blocks keep a third of slack beyond their current size; blocks
//! whose surplus crosses [`MIN_TEXT_CAPACITY`](crate::image::MIN_TEXT_CAPACITY)
//! are remembered on a free list so relocated or new neighbours can reuse
//! the space.
//!
//! The list is backed by an arena of stable [`BlockId`]s rather than
//! pointers; decls hold ids, neighbour links are ids, and moving a decl
//! record never invalidates a sibling reference.

use super::{align_down, align_up, ideal_capacity, Image, MIN_TEXT_CAPACITY};
use crate::errors::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(u32);

/// State of one decl's code block. The block's virtual address lives in its
/// local symbol (`n_value`), not here.
#[derive(Debug, Default, Clone)]
pub struct TextBlock {
    /// Index into the image's local symbols; 0 means the block is an empty
    /// placeholder.
    pub local_sym_index: u32,
    /// The decl's slot in the offset (GOT) table.
    pub offset_table_index: u32,
    /// Size of the most recently generated code, in bytes.
    pub size: u64,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

#[derive(Debug, Default)]
pub(crate) struct Blocks {
    slots: Vec<TextBlock>,
    free: Vec<BlockId>,
}

impl Blocks {
    pub(crate) fn insert(&mut self) -> BlockId {
        match self.free.pop() {
            Some(id) => {
                self.slots[id.0 as usize] = TextBlock::default();
                id
            }
            None => {
                let id = BlockId(self.slots.len() as u32);
                self.slots.push(TextBlock::default());
                id
            }
        }
    }

    pub(crate) fn release(&mut self, id: BlockId) {
        self.slots[id.0 as usize] = TextBlock::default();
        self.free.push(id);
    }

    pub(crate) fn get(&self, id: BlockId) -> &TextBlock {
        &self.slots[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: BlockId) -> &mut TextBlock {
        &mut self.slots[id.0 as usize]
    }
}

impl Image {
    pub(crate) fn blk(&self, id: BlockId) -> &TextBlock {
        self.blocks.get(id)
    }

    pub(crate) fn blk_mut(&mut self, id: BlockId) -> &mut TextBlock {
        self.blocks.get_mut(id)
    }

    pub(crate) fn block_vaddr(&self, id: BlockId) -> u64 {
        self.local_symbols[self.blk(id).local_sym_index as usize].n_value
    }

    /// Address space owned by the block: up to its successor, or the rest
    /// of the address space for the tail block.
    pub(crate) fn block_capacity(&self, id: BlockId) -> u64 {
        let block = self.blk(id);
        let vaddr = self.block_vaddr(id);
        match block.next {
            Some(next) => self.block_vaddr(next) - vaddr,
            None => u64::MAX - vaddr,
        }
    }

    /// A block is worth keeping on the free list when something could still
    /// be placed in its surplus. The tail never qualifies; its capacity is
    /// unbounded.
    pub(crate) fn is_free_list_eligible(&self, id: BlockId) -> bool {
        let block = self.blk(id);
        if block.next.is_none() {
            return false;
        }
        let capacity = self.block_capacity(id);
        let ideal = ideal_capacity(block.size);
        if capacity <= ideal {
            return false;
        }
        capacity - ideal >= MIN_TEXT_CAPACITY
    }

    /// Finds a virtual address inside `__text` where `new_size` bytes plus
    /// ideal slack can live, links the block in at that position, and
    /// extends the section if the placement appends. Also used to relocate
    /// a live block that outgrew its spot.
    pub(crate) fn allocate_text_block(
        &mut self,
        block_id: BlockId,
        new_size: u64,
        alignment: u64,
    ) -> Result<u64, LinkError> {
        let text_section = *self.text_section();
        let new_block_ideal_capacity = ideal_capacity(new_size);

        // The predecessor the block will be linked after; None means the
        // block becomes the head of an empty list.
        let mut block_placement: Option<BlockId> = None;
        let mut free_list_removal: Option<usize> = None;

        let vaddr = {
            let mut picked: Option<u64> = None;
            let mut i = 0;
            while i < self.text_block_free_list.len() {
                let big_id = self.text_block_free_list[i];
                if big_id == block_id {
                    i += 1;
                    continue;
                }
                if self.blk(big_id).next.is_none() {
                    // Stale entry: the block became the tail after its
                    // successor was freed.
                    self.text_block_free_list.swap_remove(i);
                    continue;
                }
                let big_vaddr = self.block_vaddr(big_id);
                let capacity = self.block_capacity(big_id);
                let ideal_capacity_end = big_vaddr + ideal_capacity(self.blk(big_id).size);
                let capacity_end = big_vaddr + capacity;
                let new_start = align_down(
                    capacity_end.saturating_sub(new_block_ideal_capacity),
                    alignment,
                );
                if new_start < ideal_capacity_end {
                    // The free-list block grew into its surplus. Evict it
                    // once nothing can ever fit there again.
                    if !self.is_free_list_eligible(big_id) {
                        self.text_block_free_list.swap_remove(i);
                    } else {
                        i += 1;
                    }
                    continue;
                }
                if new_start - ideal_capacity_end < MIN_TEXT_CAPACITY {
                    // Taking this spot consumes the whole surplus.
                    free_list_removal = Some(i);
                }
                block_placement = Some(big_id);
                picked = Some(new_start);
                break;
            }

            if let Some(vaddr) = picked {
                vaddr
            } else if let Some(last_id) = self.last_text_block {
                if last_id == block_id {
                    // Re-aligning the tail: it keeps its position in the
                    // list and just moves forward to the new alignment.
                    block_placement = self.blk(block_id).prev;
                    align_up(self.block_vaddr(block_id), alignment)
                } else {
                    let ideal_end =
                        self.block_vaddr(last_id) + ideal_capacity(self.blk(last_id).size);
                    block_placement = Some(last_id);
                    align_up(ideal_end, alignment)
                }
            } else {
                text_section.addr
            }
        };

        let expand_section = match block_placement {
            Some(placement) => {
                let placement_next = self.blk(placement).next;
                // Appending at the tail, including when the block being
                // placed currently is the tail.
                placement_next.is_none()
                    || (placement_next == Some(block_id) && self.blk(block_id).next.is_none())
            }
            None => true,
        };
        if expand_section {
            let needed_size = (vaddr + new_size) - text_section.addr;
            let text_capacity = self.allocated_size(text_section.offset as u64);
            if needed_size > text_capacity {
                log::error!(
                    "__text needs 0x{needed_size:x} bytes but only 0x{text_capacity:x} are free \
                     at its file offset"
                );
                return Err(LinkError::TextSectionFull);
            }
            self.text_section_mut().size = needed_size;
            self.cmd_table_dirty = true;
        }
        self.blk_mut(block_id).size = new_size;

        // A relocated block must be unplugged from its old spot before
        // being linked in at the new one.
        let (old_prev, old_next) = {
            let block = self.blk(block_id);
            (block.prev, block.next)
        };
        if let Some(prev) = old_prev {
            self.blk_mut(prev).next = old_next;
        }
        if let Some(next) = old_next {
            self.blk_mut(next).prev = old_prev;
        }
        if self.last_text_block == Some(block_id) {
            self.last_text_block = old_prev;
        }

        match block_placement {
            Some(pred) => {
                let pred_next = self.blk(pred).next;
                self.blk_mut(block_id).prev = Some(pred);
                self.blk_mut(block_id).next = pred_next;
                self.blk_mut(pred).next = Some(block_id);
                if let Some(next) = pred_next {
                    self.blk_mut(next).prev = Some(block_id);
                }
            }
            None => {
                let block = self.blk_mut(block_id);
                block.prev = None;
                block.next = None;
            }
        }
        if self.blk(block_id).next.is_none() {
            self.last_text_block = Some(block_id);
        }

        if let Some(i) = free_list_removal {
            self.text_block_free_list.swap_remove(i);
        }
        Ok(vaddr)
    }

    /// Returns the block's address unchanged when the new size still fits
    /// its capacity at a valid alignment; otherwise relocates it. The
    /// caller must rewrite the block's GOT slot if the address changed.
    pub(crate) fn grow_text_block(
        &mut self,
        block_id: BlockId,
        new_size: u64,
        alignment: u64,
    ) -> Result<u64, LinkError> {
        let vaddr = self.block_vaddr(block_id);
        let aligned = align_down(vaddr, alignment) == vaddr;
        if aligned && new_size <= self.block_capacity(block_id) {
            return Ok(vaddr);
        }
        self.allocate_text_block(block_id, new_size, alignment)
    }

    // TODO: when the shrink drops the block below the free-list threshold,
    // push a free-list node for it here so the space can be reused.
    pub(crate) fn shrink_text_block(&mut self, _block_id: BlockId, _new_size: u64) {}

    /// Unlinks the block and releases its arena slot. The predecessor
    /// inherits the freed capacity and is remembered on the free list when
    /// it qualifies.
    pub(crate) fn free_text_block(&mut self, block_id: BlockId) {
        let mut already_have_free_list_node = false;
        {
            let mut i = 0;
            while i < self.text_block_free_list.len() {
                let entry = self.text_block_free_list[i];
                if entry == block_id {
                    self.text_block_free_list.swap_remove(i);
                    continue;
                }
                if Some(entry) == self.blk(block_id).prev {
                    already_have_free_list_node = true;
                }
                i += 1;
            }
        }

        if self.last_text_block == Some(block_id) {
            self.last_text_block = self.blk(block_id).prev;
        }

        let (prev, next) = {
            let block = self.blk(block_id);
            (block.prev, block.next)
        };
        if let Some(prev) = prev {
            self.blk_mut(prev).next = next;
            if !already_have_free_list_node && self.is_free_list_eligible(prev) {
                // Best effort only; a forgotten node just loses a reclaim
                // opportunity.
                self.text_block_free_list.push(prev);
            }
        }
        if let Some(next) = next {
            self.blk_mut(next).prev = prev;
        }

        self.blocks.release(block_id);
    }
}
