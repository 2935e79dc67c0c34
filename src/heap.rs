//! The heap proper: a contiguous region of boundary-tagged blocks, the
//! segregated index over its free blocks, and the placement, coalescing and
//! reallocation policy.
//!
//! A [`Heap`] packages what a C allocator would keep in globals: the first
//! block position (`base`, also the zero point for compressed links), the
//! epilogue position (`end`), the high-water mark of extender memory (`brk`),
//! and the last block before the epilogue (`last`). Memory enters through a
//! [`HeapExtender`] and never leaves; blocks are recycled through the index.

use core::ptr::{self, NonNull};

use log::{debug, trace};

use crate::allocators::HeapExtender;
use crate::blocks::{round_up, BlockPtr, ALIGNMENT, MIN_BLOCK, USED, WORD};
use crate::seglist::{bin_index, SegregatedList, BIN_COUNT};

/// Adjusted block size for a request of `size` payload bytes: header added,
/// rounded to alignment, guarded against overflow and the 32-bit header
/// limit.
fn adjust_size(size: usize) -> Option<usize> {
    let with_header = size.checked_add(WORD)?;
    let asize = with_header.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    if asize > u32::MAX as usize {
        return None;
    }
    Some(asize)
}

/// A growable heap of boundary-tagged blocks with a segregated free index.
pub struct Heap {
    /// Position of the first block; link offsets are measured from here.
    base: BlockPtr,
    /// The epilogue header: a zero-size used block terminating traversal.
    end: BlockPtr,
    /// One past the last byte obtained from the extender.
    brk: *mut u8,
    /// The block immediately before the epilogue, once one exists.
    last: Option<BlockPtr>,
    bins: SegregatedList,
}

// The heap owns its region outright; the raw pointers inside never alias
// another heap's memory.
unsafe impl Send for Heap {}

impl Heap {
    /// Set up an empty heap on fresh extender memory.
    ///
    /// Reserves two alignment units and lays out a dead pad, a used prologue
    /// (header and footer words), and the epilogue. The first block position
    /// is chosen so that every payload address is aligned no matter where the
    /// extender's region starts.
    ///
    /// # Safety
    ///
    /// `extender` must behave as documented on [`HeapExtender`]; the heap
    /// assumes sole ownership of everything it returns.
    pub unsafe fn init<E: HeapExtender>(extender: &mut E) -> Result<Heap, E::Err> {
        let raw = extender.extend(2 * ALIGNMENT)?;
        let raw_addr = raw.as_ptr() as usize;

        // The first block must start one word below an alignment boundary so
        // its payload lands on one, with at least two words below it for the
        // prologue.
        let base_addr = round_up(raw_addr + 3 * WORD, ALIGNMENT) - WORD;
        let prologue = (base_addr - 2 * WORD) as *mut u32;
        let packed = (2 * WORD) as u32 | USED;
        prologue.write(packed);
        prologue.add(1).write(packed);

        let base = BlockPtr::from_raw(NonNull::new_unchecked(base_addr as *mut u32));
        base.word_ptr().write(USED); // epilogue: size 0, used

        debug!("heap initialized, base {:p}", base.addr());
        Ok(Heap {
            base,
            end: base,
            brk: (raw_addr + 2 * ALIGNMENT) as *mut u8,
            last: None,
            bins: SegregatedList::default(),
        })
    }

    /// Position of the first block.
    pub fn base(&self) -> BlockPtr {
        self.base
    }

    /// Position of the epilogue.
    pub fn end(&self) -> BlockPtr {
        self.end
    }

    /// The block immediately before the epilogue, if any block exists.
    pub fn last(&self) -> Option<BlockPtr> {
        self.last
    }

    /// Iterate every block in address order, sentinels excluded.
    pub fn blocks(&self) -> HeapIter {
        HeapIter { next: self.base }
    }

    /// Allocate a block for `size` payload bytes.
    ///
    /// Returns null for zero-size requests and on exhaustion.
    ///
    /// # Safety
    ///
    /// `extender` must be the one this heap was initialized with.
    pub unsafe fn malloc<E: HeapExtender>(&mut self, extender: &mut E, size: usize) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let asize = match adjust_size(size) {
            Some(asize) => asize,
            None => return ptr::null_mut(),
        };

        if let Some(block) = self.bins.find_fit(self.base, asize) {
            self.place(block, asize);
            return block.payload();
        }

        // No fit anywhere. Grow the heap, by less if a trailing free block
        // will be absorbed into the new block.
        let mut growth = asize;
        if let Some(last) = self.last {
            if last.is_free() {
                growth -= last.size();
            }
        }
        match self.extend(extender, growth) {
            Some(block) => block.payload(),
            None => ptr::null_mut(),
        }
    }

    /// Release an allocated block. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `payload` must be null or a live pointer previously returned by this
    /// heap; freeing anything else, or freeing twice, corrupts the heap.
    pub unsafe fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        let block = BlockPtr::from_payload(payload);
        // Flip to free, keeping the bit describing the predecessor.
        block.make(block.size(), block.prevfree_bit());

        if block.prevfree() || block.next().is_free() {
            self.coalesce(block);
        } else {
            self.bins.insert(self.base, block);
        }
    }

    /// Resize an allocation, in place when the block itself, an absorbed
    /// free right neighbor, or a heap extension at the tail can cover the
    /// new size; otherwise by allocate-copy-free.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for `payload`; `extender` must
    /// be the heap's own.
    pub unsafe fn realloc<E: HeapExtender>(
        &mut self,
        extender: &mut E,
        payload: *mut u8,
        size: usize,
    ) -> *mut u8 {
        if payload.is_null() {
            return self.malloc(extender, size);
        }
        if size == 0 {
            self.free(payload);
            return ptr::null_mut();
        }
        let asize = match adjust_size(size) {
            Some(asize) => asize,
            None => return ptr::null_mut(),
        };

        let block = BlockPtr::from_payload(payload);
        let next = block.next();
        let next_free = next.is_free();
        let mut avail = block.size();
        if next_free {
            avail += next.size();
        }
        let at_tail = self.last == Some(block) || (next_free && self.last == Some(next));

        if avail < asize {
            if at_tail {
                // The allocation ends the heap: extend and grow in place.
                if self.extend(extender, asize - avail).is_none() {
                    return ptr::null_mut();
                }
                block.make(asize, USED | block.prevfree_bit());
                self.last = Some(block);
                return payload;
            }
            // Somewhere in the middle: move the allocation.
            let new_payload = self.malloc(extender, size);
            if new_payload.is_null() {
                // Original block left untouched.
                return ptr::null_mut();
            }
            ptr::copy_nonoverlapping(payload, new_payload, block.size() - WORD);
            self.free(payload);
            return new_payload;
        }

        // Enough room in place, counting a free right neighbor.
        if next_free {
            self.bins.remove(self.base, next);
        }
        let mut tail_block = block;
        if avail - asize >= MIN_BLOCK {
            block.make(asize, USED | block.prevfree_bit());
            let tail = block.next();
            tail.make(avail - asize, 0);
            self.bins.insert(self.base, tail);
            tail_block = tail;
        } else {
            block.make(avail, USED | block.prevfree_bit());
        }
        if at_tail {
            self.last = Some(tail_block);
        }
        payload
    }

    /// Allocate `nmemb * size` zeroed bytes. Null on overflow or exhaustion.
    ///
    /// # Safety
    ///
    /// `extender` must be the heap's own.
    pub unsafe fn calloc<E: HeapExtender>(
        &mut self,
        extender: &mut E,
        nmemb: usize,
        size: usize,
    ) -> *mut u8 {
        let bytes = match nmemb.checked_mul(size) {
            Some(bytes) => bytes,
            None => return ptr::null_mut(),
        };
        let payload = self.malloc(extender, bytes);
        if !payload.is_null() {
            ptr::write_bytes(payload, 0, bytes);
        }
        payload
    }

    /// Carve an `asize`-byte used block out of the free block `block`,
    /// splitting off the remainder when it can stand as a block of its own.
    unsafe fn place(&mut self, block: BlockPtr, asize: usize) {
        let base = self.base;
        let fsize = block.size();
        self.bins.remove(base, block);

        if fsize - asize >= MIN_BLOCK {
            block.make(asize, USED | block.prevfree_bit());
            let tail = block.next();
            tail.make(fsize - asize, 0);
            self.bins.insert(base, tail);
            if self.last.map_or(true, |last| last < tail) {
                self.last = Some(tail);
            }
        } else {
            // Remainder too small to carry tags; keep it as slack.
            block.make(fsize, USED | block.prevfree_bit());
        }
    }

    /// Merge `block` (already marked free) with free neighbors on either
    /// side and put the result on its list.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let base = self.base;
        let next = block.next();
        let next_free = next.is_free();
        let at_tail = self.last == Some(block) || (next_free && self.last == Some(next));

        let mut merged = block;
        let mut size = block.size();
        if next_free {
            size += next.size();
            self.bins.remove(base, next);
        }
        if block.prevfree() {
            let prev = block.prev();
            size += prev.size();
            self.bins.remove(base, prev);
            merged = prev;
        }
        merged.make(size, 0);
        self.bins.insert(base, merged);
        if at_tail {
            self.last = Some(merged);
        }
        merged
    }

    /// Grow the heap by `bytes` and lay a used block over the new range,
    /// absorbing a trailing free block if there is one. The epilogue moves
    /// to the new end. On extender failure nothing changes.
    unsafe fn extend<E: HeapExtender>(&mut self, extender: &mut E, bytes: usize) -> Option<BlockPtr> {
        let appended = match extender.extend(bytes) {
            Ok(appended) => appended,
            Err(_) => return None,
        };
        debug_assert_eq!(
            appended.as_ptr(),
            self.brk,
            "extender must grow the region contiguously"
        );
        self.brk = self.brk.add(bytes);

        let mut block = self.end;
        let mut size = bytes;
        if let Some(last) = self.last {
            if last.is_free() {
                self.bins.remove(self.base, last);
                size += last.size();
                block = last;
            }
        }

        let end = BlockPtr::from_raw(NonNull::new_unchecked(block.addr().add(size) as *mut u32));
        end.word_ptr().write(USED); // new epilogue
        block.make(size, USED);

        self.end = end;
        self.last = Some(block);
        trace!("extended by {} bytes, tail block now {} bytes", bytes, size);
        Some(block)
    }

    /// Walk the whole heap and every free list, counting invariant
    /// violations and sizing up the blocks. Read-only.
    pub fn check(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        let base = self.base;

        // A corrupted list could cycle; no traversal may take more steps
        // than the heap has room for minimum-size blocks.
        let span = self.end.addr() as usize - self.base.addr() as usize;
        let cap = span / MIN_BLOCK + 1;

        let mut prev_free = false;
        let mut last_seen: Option<BlockPtr> = None;
        for block in self.blocks() {
            let size = block.size();
            if size % ALIGNMENT != 0 || block.addr() as usize + size > self.end.addr() as usize {
                validity.bad_blocks += 1;
                // Nothing after a mangled header can be trusted.
                break;
            }
            if block.prevfree() != prev_free {
                validity.prevfree_mismatches += 1;
            }
            if block.is_free() {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if prev_free {
                    validity.adjacent_frees += 1;
                }
                if block.footer() != block.raw_header() {
                    validity.footer_mismatches += 1;
                }
                let listed = self
                    .bins
                    .iter_bin(base, bin_index(size))
                    .take(cap)
                    .any(|candidate| candidate == block);
                if !listed {
                    validity.misbinned += 1;
                }
            } else {
                stats.used_bytes += size;
            }
            prev_free = block.is_free();
            last_seen = Some(block);
            stats.blocks += 1;
        }

        // The walk must stop exactly at the epilogue, whose prevfree bit
        // describes the final block like any other successor's.
        let walk_end = match last_seen {
            Some(block) => block.next(),
            None => self.base,
        };
        if walk_end != self.end {
            validity.bad_blocks += 1;
        }
        if self.end.prevfree() != prev_free {
            validity.prevfree_mismatches += 1;
        }
        if self.last != last_seen {
            validity.last_mismatches += 1;
        }

        // Every list node must be free, classed correctly, and doubly
        // linked to its neighbors; list membership totals must agree with
        // the address-order walk.
        let mut listed_total = 0;
        for index in 0..BIN_COUNT {
            let mut steps = 0;
            let mut prev: Option<BlockPtr> = None;
            let mut cursor = self.bins.bin(index);
            while let Some(block) = cursor {
                steps += 1;
                if steps > cap {
                    validity.bad_links += 1;
                    break;
                }
                if block.is_used() {
                    validity.bad_links += 1;
                    break;
                }
                if bin_index(block.size()) != index || block.prev_free(base) != prev {
                    validity.bad_links += 1;
                }
                listed_total += 1;
                prev = Some(block);
                cursor = block.next_free(base);
            }
        }
        if listed_total != stats.free_blocks {
            validity.bad_links += 1;
        }

        (validity, stats)
    }

    /// Log every block in address order, then every free list.
    pub fn dump(&self) {
        debug!(
            "heap base {:p} end {:p} last {:?}",
            self.base.addr(),
            self.end.addr(),
            self.last.map(|block| block.addr()),
        );
        for block in self.blocks() {
            debug!(
                "  {:p}: size {} used {} prevfree {}",
                block.addr(),
                block.size(),
                block.is_used(),
                block.prevfree(),
            );
        }
        for index in 0..BIN_COUNT {
            for block in self.bins.iter_bin(self.base, index) {
                trace!("  bin {}: {:p} size {}", index, block.addr(), block.size());
            }
        }
    }
}

/// Address-order iterator over the heap's blocks, ending at the epilogue.
pub struct HeapIter {
    next: BlockPtr,
}

impl Iterator for HeapIter {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<BlockPtr> {
        let block = self.next;
        if block.size() == 0 {
            return None;
        }
        self.next = block.next();
        Some(block)
    }
}

/// Counts of invariant violations found by [`Heap::check`]. A healthy heap
/// is all zeros.
#[derive(Default, Debug)]
pub struct Validity {
    /// Headers with impossible sizes, or a walk that misses the epilogue.
    pub bad_blocks: usize,
    /// Blocks whose prevfree bit disagrees with their predecessor's state.
    pub prevfree_mismatches: usize,
    /// Free blocks whose footer is not a copy of their header.
    pub footer_mismatches: usize,
    /// Pairs of address-adjacent free blocks, which should have coalesced.
    pub adjacent_frees: usize,
    /// Free blocks missing from the list of their size class.
    pub misbinned: usize,
    /// Free-list structure errors: cycles, used nodes, wrong class,
    /// inconsistent back links, or a node count that disagrees with the
    /// heap walk.
    pub bad_links: usize,
    /// The last-block reference not naming the block before the epilogue.
    pub last_mismatches: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.bad_blocks == 0
            && self.prevfree_mismatches == 0
            && self.footer_mismatches == 0
            && self.adjacent_frees == 0
            && self.misbinned == 0
            && self.bad_links == 0
            && self.last_mismatches == 0
    }
}

impl From<Validity> for bool {
    fn from(validity: Validity) -> bool {
        validity.is_valid()
    }
}

/// Aggregate block accounting from [`Heap::check`].
#[derive(Default, Debug)]
pub struct Stats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::ToyHeap;
    use crate::seglist::bin_index;

    use test_log::test;

    fn fresh(toy: &mut ToyHeap) -> Heap {
        unsafe { Heap::init(toy).ok().expect("toy heap init cannot fail") }
    }

    fn assert_valid(heap: &Heap) -> Stats {
        let (validity, stats) = heap.check();
        assert!(validity.is_valid(), "invalid heap: {:?}", validity);
        stats
    }

    #[test]
    fn init_lays_out_empty_heap() {
        let mut toy = ToyHeap::default();
        let heap = fresh(&mut toy);

        assert_eq!(heap.base(), heap.end());
        assert_eq!(heap.last(), None);
        assert_eq!(heap.base().payload() as usize % ALIGNMENT, 0);
        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 0);
    }

    #[test]
    fn malloc_zero_is_null_without_side_effects() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 0) };
        assert!(p.is_null());
        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 0);
    }

    #[test]
    fn one_byte_request_takes_minimum_block() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 1) };
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);

        let block = unsafe { BlockPtr::from_payload(p) };
        assert_eq!(block.size(), 16);
        assert_eq!(bin_index(block.size()), 0);
        assert!(block.is_used());

        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.used_bytes, 16);
    }

    #[test]
    fn free_null_is_a_noop() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 8) };
        unsafe { heap.free(ptr::null_mut()) };

        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 0);
        unsafe { heap.free(p) };
        assert_valid(&heap);
    }

    #[test]
    fn same_size_reallocation_reuses_the_freed_block() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 40) };
        unsafe { heap.free(p) };
        let q = unsafe { heap.malloc(&mut toy, 40) };
        assert_eq!(p, q);
        assert_valid(&heap);
    }

    #[test]
    fn adjacent_freed_blocks_coalesce() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 24) };
        let q = unsafe { heap.malloc(&mut toy, 24) };
        unsafe {
            heap.free(p);
            heap.free(q);
        }

        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 64);

        let merged = heap.bins.bin(2).expect("64-byte block belongs in class 2");
        assert_eq!(merged.size(), 64);
        assert_eq!(merged.addr(), unsafe { BlockPtr::from_payload(p) }.addr());
    }

    #[test]
    fn placement_splits_when_the_remainder_can_stand_alone() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        // A free 48-byte block; a minimum-size request carves 16 off the
        // front and leaves a 32-byte free tail.
        let p = unsafe { heap.malloc(&mut toy, 40) };
        unsafe { heap.free(p) };
        let q = unsafe { heap.malloc(&mut toy, 8) };

        assert_eq!(q, p);
        assert_eq!(unsafe { BlockPtr::from_payload(q) }.size(), 16);

        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 32);
        assert!(heap.bins.bin(1).is_some());
    }

    #[test]
    fn placement_keeps_slack_below_the_minimum_block() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        // A free 32-byte block; a 17-byte request adjusts to 32, so there is
        // no remainder to split. A smaller request (adjusted 16) would leave
        // 16 and split; anything between leaves less than one block.
        let p = unsafe { heap.malloc(&mut toy, 24) };
        unsafe { heap.free(p) };
        let q = unsafe { heap.malloc(&mut toy, 17) };

        assert_eq!(q, p);
        assert_eq!(unsafe { BlockPtr::from_payload(q) }.size(), 32);
        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 0);
    }

    #[test]
    fn malloc_absorbs_a_trailing_free_block_when_extending() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 24) };
        unsafe { heap.free(p) };
        let grown_before = toy.size;

        // Nothing on the lists fits 112 bytes; the heap extends by only the
        // difference and the new block starts where the free one did.
        let q = unsafe { heap.malloc(&mut toy, 100) };
        assert_eq!(q, p);
        assert_eq!(unsafe { BlockPtr::from_payload(q) }.size(), 112);
        assert_eq!(toy.size - grown_before, 112 - 32);

        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 0);
    }

    #[test]
    fn realloc_null_allocates_and_zero_frees() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.realloc(&mut toy, ptr::null_mut(), 8) };
        assert!(!p.is_null());
        assert_eq!(unsafe { BlockPtr::from_payload(p) }.size(), 16);

        let q = unsafe { heap.realloc(&mut toy, p, 0) };
        assert!(q.is_null());
        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn realloc_grows_the_tail_block_in_place() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 100) };
        let q = unsafe { heap.realloc(&mut toy, p, 200) };

        assert_eq!(q, p);
        assert_eq!(unsafe { BlockPtr::from_payload(q) }.size(), 208);
        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 0);
    }

    #[test]
    fn realloc_moves_and_copies_when_boxed_in() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 100) };
        let old_payload = unsafe { BlockPtr::from_payload(p) }.size() - WORD;
        for i in 0..old_payload {
            unsafe { p.add(i).write((i % 251) as u8) };
        }
        let q = unsafe { heap.malloc(&mut toy, 8) };
        assert!(!q.is_null());

        let r = unsafe { heap.realloc(&mut toy, p, 200) };
        assert_ne!(r, p);
        for i in 0..old_payload {
            assert_eq!(unsafe { r.add(i).read() }, (i % 251) as u8);
        }

        // The old block is free again.
        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 112);
    }

    #[test]
    fn realloc_shrinks_in_place_and_splits_the_rest() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 100) }; // 112-byte block
        let q = unsafe { heap.realloc(&mut toy, p, 8) };

        assert_eq!(q, p);
        assert_eq!(unsafe { BlockPtr::from_payload(q) }.size(), 16);
        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 96);
    }

    #[test]
    fn realloc_absorbs_the_free_right_neighbor() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.malloc(&mut toy, 24) }; // 32 bytes
        let q = unsafe { heap.malloc(&mut toy, 24) }; // 32 bytes
        let fence = unsafe { heap.malloc(&mut toy, 8) };
        unsafe { heap.free(q) };

        // 32 + 32 = 64 available in place; asize for 40 bytes is 48, so the
        // block grows and a 16-byte tail returns to the index.
        let r = unsafe { heap.realloc(&mut toy, p, 40) };
        assert_eq!(r, p);
        assert_eq!(unsafe { BlockPtr::from_payload(r) }.size(), 48);

        let stats = assert_valid(&heap);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, 16);
        unsafe { heap.free(fence) };
        assert_valid(&heap);
    }

    #[test]
    fn calloc_zeroes_the_whole_region() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        // Dirty the heap first so the zeroing is observable.
        let p = unsafe { heap.malloc(&mut toy, 63) };
        unsafe { ptr::write_bytes(p, 0xAB, 63) };
        unsafe { heap.free(p) };

        let q = unsafe { heap.calloc(&mut toy, 7, 9) };
        assert_eq!(q, p);
        for i in 0..63 {
            assert_eq!(unsafe { q.add(i).read() }, 0);
        }
        assert_valid(&heap);
    }

    #[test]
    fn calloc_rejects_overflowing_products() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let p = unsafe { heap.calloc(&mut toy, usize::MAX, 2) };
        assert!(p.is_null());
        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 0);
    }

    #[test]
    fn reverse_frees_collapse_to_one_spanning_block() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        const COUNT: usize = 512;
        let mut pointers = [ptr::null_mut(); COUNT];
        for slot in pointers.iter_mut() {
            *slot = unsafe { heap.malloc(&mut toy, 28) }; // 32-byte blocks
            assert!(!slot.is_null());
        }
        for slot in pointers.iter().rev() {
            unsafe { heap.free(*slot) };
        }

        let stats = assert_valid(&heap);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, COUNT * 32);
        let span = heap.bins.bin(8).expect("a 16 KiB block belongs in the top class");
        assert_eq!(span.size(), COUNT * 32);
    }

    #[test]
    fn exhaustion_returns_null_and_leaves_the_heap_intact() {
        let mut toy = ToyHeap::default();
        let mut heap = fresh(&mut toy);

        let mut allocated = 0;
        loop {
            let p = unsafe { heap.malloc(&mut toy, 4096 - WORD) };
            if p.is_null() {
                break;
            }
            allocated += 1;
        }
        assert!(allocated > 0);

        let (validity, stats) = heap.check();
        assert!(validity.is_valid(), "invalid after exhaustion: {:?}", validity);
        assert_eq!(stats.blocks, allocated);
        assert_eq!(stats.used_bytes, allocated * 4096);

        // A second failure changes nothing either.
        let p = unsafe { heap.malloc(&mut toy, 1 << 20) };
        assert!(p.is_null());
        let (_, stats_after) = heap.check();
        assert_eq!(stats_after.blocks, stats.blocks);
    }
}
