// Block cache: hash table for lookup, LRU chain for eviction, page index for
// invalidation. Blocks live in an arena addressed by stable index; the hash
// chains, LRU list and page index all store indices rather than pointers.
// Mutating operations are serialized by the compiler's lock.

use super::block::{CompiledBlock, NONE};
use super::CodeArena;
use crate::memory::PAGE_SHIFT;
use log::{debug, trace};
use std::collections::HashMap;

const HASH_SIZE: u32 = 32768;
const HASH_MASK: u32 = HASH_SIZE - 1;

pub const DEFAULT_MAX_BLOCKS: usize = 16384;

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub block_count: u32,
    pub lookup_hits: u64,
    pub lookup_misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

pub struct BlockCache {
    arena: Vec<Option<CompiledBlock>>,
    free: Vec<u32>,
    hash: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    pages: HashMap<u32, Vec<u32>>,
    max_blocks: usize,
    stats: CacheStats,
    trace_blocks: bool,
}

fn compute_hash(addr: u32) -> u32 {
    let h = addr >> 2;
    (h ^ (h >> 16)) & HASH_MASK
}

impl BlockCache {
    pub fn new(max_blocks: usize) -> Self {
        BlockCache {
            arena: Vec::new(),
            free: Vec::new(),
            hash: vec![NONE; HASH_SIZE as usize],
            lru_head: NONE,
            lru_tail: NONE,
            pages: HashMap::new(),
            max_blocks: max_blocks.max(1),
            stats: CacheStats::default(),
            trace_blocks: false,
        }
    }

    pub fn set_tracing(&mut self, on: bool) {
        self.trace_blocks = on;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.stats.block_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: u32) -> &CompiledBlock {
        self.arena[idx as usize].as_ref().expect("live block index")
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut CompiledBlock {
        self.arena[idx as usize].as_mut().expect("live block index")
    }

    /// Look up the block starting at `addr`, promoting it to the LRU head.
    pub fn lookup(&mut self, addr: u32) -> Option<u32> {
        let mut idx = self.hash[compute_hash(addr) as usize];
        while idx != NONE {
            let block = self.get(idx);
            if block.start_addr == addr {
                self.stats.lookup_hits += 1;
                self.promote(idx);
                return Some(idx);
            }
            idx = block.hash_next;
        }
        self.stats.lookup_misses += 1;
        None
    }

    /// Non-promoting lookup for link resolution.
    pub fn peek(&self, addr: u32) -> Option<u32> {
        let mut idx = self.hash[compute_hash(addr) as usize];
        while idx != NONE {
            let block = self.get(idx);
            if block.start_addr == addr {
                return Some(idx);
            }
            idx = block.hash_next;
        }
        None
    }

    /// Insert a freshly compiled block; evicts the LRU tail at capacity.
    pub fn insert(&mut self, block: CompiledBlock, arena: &CodeArena) -> u32 {
        if self.len() >= self.max_blocks {
            self.evict_lru(arena);
        }
        let idx = match self.free.pop() {
            Some(slot) => {
                self.arena[slot as usize] = Some(block);
                slot
            }
            None => {
                self.arena.push(Some(block));
                (self.arena.len() - 1) as u32
            }
        };
        let addr = self.get(idx).start_addr;
        let bucket = compute_hash(addr) as usize;
        let head = self.hash[bucket];
        {
            let b = self.get_mut(idx);
            b.hash_next = head;
            b.hash_prev = NONE;
        }
        if head != NONE {
            self.get_mut(head).hash_prev = idx;
        }
        self.hash[bucket] = idx;
        self.lru_push_front(idx);
        self.register_pages(idx);
        self.stats.block_count += 1;
        if self.trace_blocks {
            trace!("block {:#010x} inserted as #{}", addr, idx);
        }
        idx
    }

    /// Remove every block whose instruction span intersects the range.
    pub fn invalidate(&mut self, addr: u32, size: u64, arena: &CodeArena) {
        if size == 0 || self.is_empty() {
            return;
        }
        let start_page = addr >> PAGE_SHIFT;
        let end_page = ((addr as u64 + size - 1) >> PAGE_SHIFT) as u32;
        for page in start_page..=end_page {
            let candidates = match self.pages.get(&page) {
                Some(list) => list.clone(),
                None => continue,
            };
            for idx in candidates {
                // The clone may hold indices already removed via another page.
                if self.arena.get(idx as usize).map_or(true, |slot| slot.is_none()) {
                    continue;
                }
                if self.get(idx).overlaps(addr, size) {
                    self.remove(idx, arena);
                    self.stats.invalidations += 1;
                }
            }
        }
    }

    /// Resolve the block's outgoing links whose targets are present and in
    /// branch range, patching the exit words in place.
    pub fn link(&mut self, idx: u32, arena: &CodeArena) {
        let link_count = self.get(idx).links.len();
        for li in 0..link_count {
            let (target_addr, patch_offset, linked) = {
                let l = &self.get(idx).links[li];
                (l.target, l.patch_offset, l.linked)
            };
            if linked {
                continue;
            }
            let target_idx = match self.peek(target_addr) {
                Some(t) => t,
                None => continue,
            };
            let target = self.get(target_idx);
            let target_entry = target.code_offset + target.body_offset as usize;
            let site = self.get(idx).code_offset + patch_offset as usize;
            let disp = target_entry as i64 - site as i64;
            if let Some(word) = super::emitter::encode_b(disp) {
                arena.patch_word(site, word);
                self.get_mut(idx).links[li].linked = true;
                if self.trace_blocks {
                    trace!(
                        "linked {:#010x} -> {:#010x}",
                        self.get(idx).start_addr,
                        target_addr
                    );
                }
            }
        }
    }

    /// Undo a block's resolved outgoing links, restoring its exit words.
    pub fn unlink(&mut self, idx: u32, arena: &CodeArena) {
        let code_offset = self.get(idx).code_offset;
        let resolved: Vec<(usize, u32, u32)> = self
            .get(idx)
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.linked)
            .map(|(i, l)| (i, l.patch_offset, l.orig_word))
            .collect();
        for (li, patch_offset, orig_word) in resolved {
            arena.patch_word(code_offset + patch_offset as usize, orig_word);
            self.get_mut(idx).links[li].linked = false;
        }
    }

    pub fn clear(&mut self) {
        self.arena.clear();
        self.free.clear();
        self.hash.iter_mut().for_each(|h| *h = NONE);
        self.lru_head = NONE;
        self.lru_tail = NONE;
        self.pages.clear();
        self.stats.block_count = 0;
        debug!("block cache cleared");
    }

    // ----- internals -----

    fn promote(&mut self, idx: u32) {
        if self.lru_head == idx {
            return;
        }
        self.lru_unlink(idx);
        self.lru_push_front(idx);
    }

    fn lru_push_front(&mut self, idx: u32) {
        {
            let b = self.get_mut(idx);
            b.lru_prev = NONE;
            b.lru_next = NONE;
        }
        self.get_mut(idx).lru_next = self.lru_head;
        if self.lru_head != NONE {
            self.get_mut(self.lru_head).lru_prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NONE {
            self.lru_tail = idx;
        }
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let b = self.get(idx);
            (b.lru_prev, b.lru_next)
        };
        if prev != NONE {
            self.get_mut(prev).lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NONE {
            self.get_mut(next).lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn evict_lru(&mut self, arena: &CodeArena) {
        let victim = self.lru_tail;
        if victim != NONE {
            if self.trace_blocks {
                trace!("evicting block {:#010x}", self.get(victim).start_addr);
            }
            self.remove(victim, arena);
            self.stats.evictions += 1;
        }
    }

    fn remove(&mut self, idx: u32, arena: &CodeArena) {
        let addr = self.get(idx).start_addr;
        // Hash chain
        let (hprev, hnext) = {
            let b = self.get(idx);
            (b.hash_prev, b.hash_next)
        };
        if hprev != NONE {
            self.get_mut(hprev).hash_next = hnext;
        } else {
            self.hash[compute_hash(addr) as usize] = hnext;
        }
        if hnext != NONE {
            self.get_mut(hnext).hash_prev = hprev;
        }
        self.lru_unlink(idx);
        self.unregister_pages(idx);
        self.unlink_callers(addr, arena);
        self.arena[idx as usize] = None;
        self.free.push(idx);
        self.stats.block_count -= 1;
    }

    // Walk every live block and restore any patched jump that named the
    // removed address. Eviction is rare enough that the scan is acceptable.
    fn unlink_callers(&mut self, addr: u32, arena: &CodeArena) {
        let mut idx = self.lru_head;
        while idx != NONE {
            let next = self.get(idx).lru_next;
            let code_offset = self.get(idx).code_offset;
            let links: Vec<(usize, u32, u32)> = self
                .get(idx)
                .links
                .iter()
                .enumerate()
                .filter(|(_, l)| l.linked && l.target == addr)
                .map(|(i, l)| (i, l.patch_offset, l.orig_word))
                .collect();
            for (li, patch_offset, orig_word) in links {
                arena.patch_word(code_offset + patch_offset as usize, orig_word);
                self.get_mut(idx).links[li].linked = false;
            }
            idx = next;
        }
    }

    fn page_range(&self, idx: u32) -> (u32, u32) {
        let b = self.get(idx);
        (b.start_addr >> PAGE_SHIFT, (b.end_addr() - 1) >> PAGE_SHIFT)
    }

    fn register_pages(&mut self, idx: u32) {
        let (start, end) = self.page_range(idx);
        for page in start..=end {
            self.pages.entry(page).or_default().push(idx);
        }
    }

    fn unregister_pages(&mut self, idx: u32) {
        let (start, end) = self.page_range(idx);
        for page in start..=end {
            if let Some(list) = self.pages.get_mut(&page) {
                list.retain(|&i| i != idx);
                if list.is_empty() {
                    self.pages.remove(&page);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::block::BlockLink;
    use super::*;

    fn test_arena() -> CodeArena {
        CodeArena::plain(64 * 1024)
    }

    fn block_at(addr: u32, insts: u32) -> CompiledBlock {
        CompiledBlock::new(addr, insts, 0, 32)
    }

    #[test]
    fn insert_lookup_round_trip() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);
        cache.insert(block_at(0x8200_0000, 4), &arena);
        assert!(cache.lookup(0x8200_0000).is_some());
        assert!(cache.lookup(0x8200_0004).is_none());
        assert_eq!(cache.stats().lookup_hits, 1);
        assert_eq!(cache.stats().lookup_misses, 1);
    }

    #[test]
    fn one_block_per_start_addr_after_invalidate() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);
        let b = block_at(0x8200_0000, 4);
        cache.insert(b, &arena);
        cache.invalidate(0x8200_0000, 16, &arena);
        assert!(cache.lookup(0x8200_0000).is_none());
        assert_eq!(cache.len(), 0);
        // Reinsert works after removal.
        cache.insert(block_at(0x8200_0000, 4), &arena);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_only_touches_overlapping_spans() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);
        cache.insert(block_at(0x8200_0000, 4), &arena); // 0x00..0x10
        cache.insert(block_at(0x8200_0100, 4), &arena);
        cache.invalidate(0x8200_0010, 4, &arena); // same page, no overlap
        assert_eq!(cache.len(), 2);
        cache.invalidate(0x8200_000C, 4, &arena); // last instruction
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(0x8200_0100).is_some());
    }

    #[test]
    fn invalidate_across_page_boundary() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);
        // Block straddles the page edge at 0x82001000.
        cache.insert(block_at(0x8200_0FF8, 8), &arena);
        cache.invalidate(0x8200_1004, 4, &arena);
        assert!(cache.lookup(0x8200_0FF8).is_none());
    }

    #[test]
    fn lru_eviction_fires_exactly_at_cap() {
        let arena = test_arena();
        let mut cache = BlockCache::new(4);
        for i in 0..4u32 {
            cache.insert(block_at(0x8200_0000 + i * 0x100, 4), &arena);
        }
        assert_eq!(cache.stats().evictions, 0);
        // Touch the oldest so the second-oldest becomes the tail.
        assert!(cache.lookup(0x8200_0000).is_some());
        cache.insert(block_at(0x8300_0000, 4), &arena);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.len(), 4);
        assert!(cache.peek(0x8200_0000).is_some());
        assert!(cache.peek(0x8200_0100).is_none());
    }

    #[test]
    fn linking_patches_and_unlinking_restores() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);

        let mut caller = block_at(0x8200_0000, 2);
        caller.code_offset = 0;
        caller.body_offset = 8;
        caller.links.push(BlockLink {
            target: 0x8200_0100,
            patch_offset: 16,
            orig_word: 0xD503_201F,
            linked: false,
            conditional: false,
        });
        arena.patch_word(16, 0xD503_201F);
        let caller_idx = cache.insert(caller, &arena);

        let mut target = block_at(0x8200_0100, 2);
        target.code_offset = 128;
        target.body_offset = 8;
        cache.insert(target, &arena);

        cache.link(caller_idx, &arena);
        assert!(cache.get(caller_idx).links[0].linked);
        // B from site 16 to 136: displacement 120 bytes = 30 words.
        assert_eq!(arena.read_word(16), 0x1400_0000 | 30);

        // Invalidating the target restores the original word.
        cache.invalidate(0x8200_0100, 4, &arena);
        assert!(!cache.get(caller_idx).links[0].linked);
        assert_eq!(arena.read_word(16), 0xD503_201F);
    }

    #[test]
    fn clear_empties_everything() {
        let arena = test_arena();
        let mut cache = BlockCache::new(16);
        for i in 0..8u32 {
            cache.insert(block_at(0x8000_0000 + i * 0x40, 4), &arena);
        }
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.lookup(0x8000_0000).is_none());
    }
}
