//! Segregated-size-class block heap.
//!
//! Small allocations are bucketed into power-of-two size classes and
//! served from 64 KiB data slabs: one occupancy bitmap plus a packed
//! array of same-size blocks, the slab allocated at alignment equal to
//! its size so that masking any interior pointer recovers the slab
//! header. Index slabs (page-size chunks laid out by [`ChunkSchema`])
//! track per-slab free counts and slab pointers for each class. Requests
//! larger than the largest class get a dedicated page run carrying a
//! "fake slab" header, so the canary-dispatch rule holds for every live
//! pointer: the 8 bytes at the recovered header address are either the
//! live-slab canary (a real slab), the fake canary (a direct run), or
//! evidence of memory corruption, which aborts.
//!
//! The heap is single-threaded (`&mut self` throughout); callers that
//! share it across threads wrap it in a lock, as the scheduler does for
//! external job parameters.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use keel_core::{align_down, align_up, is_aligned, round_up_pow2, AllocError};

use crate::config::{ConfigError, HeapConfig};
use crate::layout::{ChunkSchema, FieldLayout};
use crate::pages::{self, dangling, PageRun, PAGE_SIZE};

/// Largest block size class in bytes; anything above goes direct.
pub(crate) const MAX_BLOCK_SIZE: usize = 16384;

/// Canary identifying a live data slab header.
const LIVE_SLAB: u64 = u64::from_le_bytes(*b"KEELLIVE");
/// Canary identifying a direct allocation's header.
const FAKE_SLAB: u64 = u64::from_le_bytes(*b"KEELFAKE");

/// Header at the base of every data slab.
#[repr(C)]
struct SlabHeader {
    canary: u64,
    /// Back-pointer to this slab's free-count entry in its index slab.
    free_count: *mut u16,
    /// Block size of this slab's class, bytes.
    block_size: u32,
    /// Number of 64-bit bitmap words following the header.
    bitmap_words: u32,
    /// Identity of the owning heap, for debug ownership checks.
    owner: u64,
}

/// Header at the base of every direct allocation's page run.
#[repr(C)]
struct DirectHeader {
    canary: u64,
    /// Base of the page run (differs from the header address only for
    /// alignments at or above the slab size).
    base: *mut u8,
    /// Mapped length of the run.
    mapped: usize,
    /// Alignment the run was obtained with.
    align: usize,
}

const _: () = assert!(std::mem::size_of::<SlabHeader>() == 32);
const _: () = assert!(std::mem::size_of::<DirectHeader>() == 32);

/// Header at the base of every index slab.
#[repr(C)]
struct IndexHeader {
    /// Next index slab of the same size class; null terminates the list.
    next: *mut u8,
    /// Number of initialised entries in the parallel arrays.
    in_use: u32,
}

/// Per-class derived layout constants.
#[derive(Clone, Copy, Debug)]
struct Geometry {
    block_size: usize,
    bitmap_words: usize,
    /// Offset of the block array from the slab base, block-size aligned.
    blocks_offset: usize,
    /// Usable block count; tail bitmap bits beyond it are pre-set.
    slot_count: usize,
}

/// Head of one size class's index-slab list.
#[derive(Clone, Copy, Debug)]
struct ClassList {
    head: *mut u8,
}

/// Allocation counters, in the style of the scheduler's metrics.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStats {
    /// Blocks handed out from data slabs.
    pub pooled_allocs: u64,
    /// Blocks returned to data slabs.
    pub pooled_frees: u64,
    /// Dedicated page runs handed out.
    pub direct_allocs: u64,
    /// Dedicated page runs released.
    pub direct_frees: u64,
    /// Data slabs created (never released before the heap drops).
    pub slabs_created: u64,
    /// Index slabs created.
    pub index_slabs_created: u64,
    /// Shrinks that kept a direct run under a fake-slab header because
    /// the pooled target could not be allocated.
    pub fake_conversions: u64,
}

static HEAP_ID: AtomicU64 = AtomicU64::new(1);

/// The segregated-size-class allocator.
pub struct BlockHeap {
    config: HeapConfig,
    id: u64,
    classes: Vec<ClassList>,
    index_schema: ChunkSchema,
    stats: HeapStats,
    #[cfg(test)]
    fail_pooled: bool,
}

// SAFETY: the heap exclusively owns every slab and index slab reachable
// from `classes`; moving it between threads moves that ownership
// wholesale. It is not Sync; all operations take &mut self.
unsafe impl Send for BlockHeap {}

/// Where a block request will be satisfied.
enum Spot {
    /// An existing data slab with at least one free slot.
    Slab(*mut u8),
    /// A free entry in an existing index slab.
    Install { index: *mut u8, entry: usize },
    /// Every index slab is full; append after `prev` (null: empty list).
    Append { prev: *mut u8 },
}

impl BlockHeap {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default()).expect("default heap config is valid")
    }

    /// Create a heap with an explicit configuration.
    pub fn with_config(config: HeapConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let num_classes = (MAX_BLOCK_SIZE.trailing_zeros()
            - config.min_block_size.trailing_zeros()
            + 1) as usize;
        // Index slabs pair a free-count array with a slab-pointer array
        // behind a link header, in one page-size chunk.
        let index_schema = ChunkSchema::new(
            FieldLayout::of::<IndexHeader>(),
            &[FieldLayout::of::<u16>(), FieldLayout::of::<*mut u8>()],
            PAGE_SIZE,
        );
        Ok(Self {
            config,
            id: HEAP_ID.fetch_add(1, Ordering::Relaxed),
            classes: vec![ClassList { head: ptr::null_mut() }; num_classes],
            index_schema,
            stats: HeapStats::default(),
            #[cfg(test)]
            fail_pooled: false,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocation counters.
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Allocate `size` bytes at `align`.
    ///
    /// A zero-sized request returns the canonical empty result (a
    /// dangling, aligned pointer). `align` must be a non-zero power of
    /// two; violating that is a programmer error.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        if size == 0 {
            return Ok(dangling(align));
        }
        let need = size.max(align);
        match self.class_index(need) {
            Some(class) => self.alloc_block(class),
            None => self.alloc_direct(size, align),
        }
    }

    /// Free an allocation made by this heap.
    ///
    /// `len` and `align` are the extent and alignment witnessed at
    /// allocation time (after any realloc/shrink, the most recent ones).
    /// Freeing the canonical empty result is a no-op. A pointer this heap
    /// never returned, or a double free, is memory corruption and aborts.
    pub fn free(&mut self, ptr: NonNull<u8>, len: usize, align: usize) {
        debug_assert!(align.is_power_of_two());
        debug_assert!(is_aligned(ptr.as_ptr() as usize, align), "freed pointer lost its alignment");
        if len == 0 {
            return;
        }
        let header = self.header_addr(ptr.as_ptr());
        // SAFETY: every live non-empty allocation has a readable canary at
        // its recovered header address; anything else is corruption and
        // aborts before further harm.
        let canary = unsafe { *(header as *const u64) };
        if canary == LIVE_SLAB {
            self.free_block(header, ptr.as_ptr());
        } else if canary == FAKE_SLAB {
            self.free_direct(header);
        } else {
            corruption("unrecognised canary on free");
        }
    }

    /// Resize an allocation, possibly moving it between size classes or
    /// between the pooled and direct regimes. Contents up to
    /// `min(old_len, new_size)` are preserved. On error the old
    /// allocation is untouched.
    pub fn realloc(
        &mut self,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        assert!(new_align.is_power_of_two());
        if old_len == 0 {
            return self.alloc(new_size, new_align);
        }
        if new_size == 0 {
            self.free(old, old_len, old_align);
            return Ok(dangling(new_align));
        }
        let header = self.header_addr(old.as_ptr());
        // SAFETY: as in free, a live allocation's header is readable.
        let canary = unsafe { *(header as *const u64) };
        if canary == LIVE_SLAB {
            self.realloc_pooled(header, old, old_len, old_align, new_size, new_align)
        } else if canary == FAKE_SLAB {
            self.realloc_direct(header, old, old_len, old_align, new_size, new_align)
        } else {
            corruption("unrecognised canary on realloc");
        }
    }

    /// Shrink an allocation. Infallible: if a better-fitting home cannot
    /// be allocated, the old storage is kept (for a direct run, under a
    /// fake-slab header with the pointer repositioned).
    ///
    /// `new_size` must not exceed `old_len`, and for pooled blocks
    /// `max(new_size, new_align)` must not exceed the current block size
    /// (a shrink cannot strengthen a block's alignment).
    pub fn shrink(
        &mut self,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> NonNull<u8> {
        assert!(new_align.is_power_of_two());
        debug_assert!(new_size <= old_len, "shrink cannot grow an allocation");
        if old_len == 0 {
            return dangling(new_align);
        }
        if new_size == 0 {
            self.free(old, old_len, old_align);
            return dangling(new_align);
        }
        let header = self.header_addr(old.as_ptr());
        // SAFETY: as in free.
        let canary = unsafe { *(header as *const u64) };
        if canary == LIVE_SLAB {
            self.shrink_pooled(header, old, old_len, old_align, new_size, new_align)
        } else if canary == FAKE_SLAB {
            self.shrink_direct(header, old, old_len, old_align, new_size, new_align)
        } else {
            corruption("unrecognised canary on shrink");
        }
    }

    // ── Classification ───────────────────────────────────────────────

    /// The size class serving `need = max(size, align)` bytes, or `None`
    /// for the direct regime.
    fn class_index(&self, need: usize) -> Option<usize> {
        if need > MAX_BLOCK_SIZE {
            return None;
        }
        let block = round_up_pow2(need).max(self.config.min_block_size);
        Some((block.trailing_zeros() - self.config.min_block_size.trailing_zeros()) as usize)
    }

    fn block_size_of(&self, class: usize) -> usize {
        self.config.min_block_size << class
    }

    fn geometry(&self, block_size: usize) -> Geometry {
        let max_slots = self.config.slab_size / block_size;
        let bitmap_words = max_slots.div_ceil(64);
        let blocks_offset =
            align_up(std::mem::size_of::<SlabHeader>() + bitmap_words * 8, block_size);
        let slot_count = (self.config.slab_size - blocks_offset) / block_size;
        Geometry { block_size, bitmap_words, blocks_offset, slot_count }
    }

    /// Recover the header address for a live user pointer. Pointers at
    /// slab alignment can only be direct allocations with alignment at or
    /// above the slab size; their header sits exactly one slab below.
    fn header_addr(&self, ptr: *mut u8) -> usize {
        let addr = ptr as usize;
        if is_aligned(addr, self.config.slab_size) {
            addr - self.config.slab_size
        } else {
            align_down(addr, self.config.slab_size)
        }
    }

    // ── Pooled allocation ────────────────────────────────────────────

    fn alloc_block(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
        #[cfg(test)]
        if self.fail_pooled {
            return Err(AllocError::OutOfMemory {
                requested: self.block_size_of(class),
                align: self.block_size_of(class),
            });
        }
        let geo = self.geometry(self.block_size_of(class));
        match self.find_spot(class) {
            Spot::Slab(slab) => Ok(self.alloc_in_slab(slab, geo)),
            Spot::Install { index, entry } => self.install_data_slab(index, entry, geo),
            Spot::Append { prev } => {
                let run = pages::obtain(PAGE_SIZE, PAGE_SIZE)?;
                let base = run.base().as_ptr();
                std::mem::forget(run);
                // SAFETY: base is a fresh page-aligned chunk large enough
                // for the index header.
                unsafe {
                    (base as *mut IndexHeader)
                        .write(IndexHeader { next: ptr::null_mut(), in_use: 0 });
                }
                self.stats.index_slabs_created += 1;
                if prev.is_null() {
                    self.classes[class].head = base;
                } else {
                    // SAFETY: prev is the last index slab of this class's
                    // live list.
                    unsafe { (*(prev as *mut IndexHeader)).next = base };
                }
                self.install_data_slab(base, 0, geo)
            }
        }
    }

    /// Walk the class's index-slab list for the first place a block can
    /// come from.
    fn find_spot(&self, class: usize) -> Spot {
        let capacity = self.index_schema.capacity();
        let mut cur = self.classes[class].head;
        let mut prev = ptr::null_mut();
        while !cur.is_null() {
            // SAFETY: cur is a live index slab owned by this heap; its
            // header and the in_use prefix of its arrays are initialised.
            unsafe {
                let hdr = cur as *mut IndexHeader;
                let in_use = (*hdr).in_use as usize;
                let counts = cur.add(self.index_schema.offset(0)) as *mut u16;
                let slabs = cur.add(self.index_schema.offset(1)) as *mut *mut u8;
                for i in 0..in_use {
                    if *counts.add(i) > 0 {
                        return Spot::Slab(*slabs.add(i));
                    }
                }
                if in_use < capacity {
                    return Spot::Install { index: cur, entry: in_use };
                }
                prev = cur;
                cur = (*hdr).next;
            }
        }
        Spot::Append { prev }
    }

    /// Create a data slab, record it in `index`'s `entry`, and allocate
    /// the first block from it.
    fn install_data_slab(
        &mut self,
        index: *mut u8,
        entry: usize,
        geo: Geometry,
    ) -> Result<NonNull<u8>, AllocError> {
        let slab = self.new_data_slab(geo)?;
        // SAFETY: index is a live index slab with entry < capacity; slab
        // is the freshly initialised data slab.
        unsafe {
            let counts = index.add(self.index_schema.offset(0)) as *mut u16;
            let slabs = index.add(self.index_schema.offset(1)) as *mut *mut u8;
            let count_entry = counts.add(entry);
            count_entry.write(geo.slot_count as u16);
            slabs.add(entry).write(slab);
            (*(slab as *mut SlabHeader)).free_count = count_entry;
            (*(index as *mut IndexHeader)).in_use += 1;
        }
        Ok(self.alloc_in_slab(slab, geo))
    }

    fn new_data_slab(&mut self, geo: Geometry) -> Result<*mut u8, AllocError> {
        let run = pages::obtain(self.config.slab_size, self.config.slab_size)?;
        let base = run.base().as_ptr();
        std::mem::forget(run);
        // SAFETY: base is a fresh slab-aligned run of slab_size bytes;
        // header and bitmap fit ahead of blocks_offset by construction.
        unsafe {
            (base as *mut SlabHeader).write(SlabHeader {
                canary: LIVE_SLAB,
                free_count: ptr::null_mut(),
                block_size: geo.block_size as u32,
                bitmap_words: geo.bitmap_words as u32,
                owner: self.id,
            });
            let words = base.add(std::mem::size_of::<SlabHeader>()) as *mut u64;
            for w in 0..geo.bitmap_words {
                words.add(w).write(0);
            }
            // Bits past the real slot count are permanently in-use so the
            // scan below can never hand them out.
            for slot in geo.slot_count..geo.bitmap_words * 64 {
                let w = slot / 64;
                *words.add(w) |= 1u64 << (63 - slot % 64);
            }
        }
        self.stats.slabs_created += 1;
        Ok(base)
    }

    /// Take the first free slot of a slab known to have one.
    fn alloc_in_slab(&mut self, slab: *mut u8, geo: Geometry) -> NonNull<u8> {
        // SAFETY: slab is a live data slab of this heap with a positive
        // free count; its bitmap therefore has a zero bit.
        unsafe {
            let hdr = slab as *mut SlabHeader;
            let words = slab.add(std::mem::size_of::<SlabHeader>()) as *mut u64;
            for w in 0..geo.bitmap_words {
                let word = *words.add(w);
                if word != u64::MAX {
                    // Bit k of a word is mask 1 << (63 - k), so the first
                    // free slot is the complement's leading-zero count.
                    let k = (!word).leading_zeros() as usize;
                    words.add(w).write(word | 1u64 << (63 - k));
                    let slot = w * 64 + k;
                    debug_assert!(slot < geo.slot_count);
                    *(*hdr).free_count -= 1;
                    self.stats.pooled_allocs += 1;
                    return NonNull::new_unchecked(
                        slab.add(geo.blocks_offset + slot * geo.block_size),
                    );
                }
            }
        }
        corruption("free count positive but bitmap full");
    }

    fn free_block(&mut self, header: usize, ptr: *mut u8) {
        // SAFETY: header was recovered by masking a pointer this heap
        // returned and its canary read LIVE_SLAB; the slab layout below is
        // the one new_data_slab wrote.
        unsafe {
            let hdr = header as *mut SlabHeader;
            debug_assert_eq!((*hdr).owner, self.id, "block freed on a foreign heap");
            let geo = self.geometry((*hdr).block_size as usize);
            debug_assert_eq!(geo.bitmap_words, (*hdr).bitmap_words as usize);
            let byte_off = ptr as usize - header;
            if byte_off < geo.blocks_offset
                || (byte_off - geo.blocks_offset) % geo.block_size != 0
            {
                corruption("freed pointer is not at a block boundary");
            }
            let slot = (byte_off - geo.blocks_offset) / geo.block_size;
            if slot >= geo.slot_count {
                corruption("freed block index out of range");
            }
            let words = (header as *mut u8).add(std::mem::size_of::<SlabHeader>()) as *mut u64;
            let word = words.add(slot / 64);
            let mask = 1u64 << (63 - slot % 64);
            if *word & mask == 0 {
                corruption("double free");
            }
            *word &= !mask;
            // Empty slabs are retained for reuse; only the free count
            // moves.
            *(*hdr).free_count += 1;
        }
        self.stats.pooled_frees += 1;
    }

    // ── Direct allocation ────────────────────────────────────────────

    fn alloc_direct(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        let slab_size = self.config.slab_size;
        let header = std::mem::size_of::<DirectHeader>();
        let (run, user_off) = if align < slab_size {
            // Header at the run base, user data at the first aligned
            // offset past it; masking the user pointer recovers the base.
            let user_off = align_up(header, align);
            let run = pages::obtain(align_up(user_off + size, PAGE_SIZE), slab_size)?;
            (run, user_off)
        } else {
            // The user pointer must itself be slab-aligned, so masking is
            // the identity; the header goes exactly one slab below it.
            let run = pages::obtain(align + align_up(size, PAGE_SIZE), align)?;
            (run, align)
        };
        let base = run.base().as_ptr();
        let head_at = if align < slab_size { base as usize } else { base as usize + align - slab_size };
        // SAFETY: head_at is within the run and below user_off; the run
        // was freshly obtained.
        unsafe {
            (head_at as *mut DirectHeader).write(DirectHeader {
                canary: FAKE_SLAB,
                base,
                mapped: run.mapped(),
                align: run.align(),
            });
        }
        self.stats.direct_allocs += 1;
        // SAFETY: user_off + size fits the run by construction.
        let user = unsafe { NonNull::new_unchecked(base.add(user_off)) };
        std::mem::forget(run);
        Ok(user)
    }

    fn free_direct(&mut self, header: usize) {
        // SAFETY: header's canary read FAKE_SLAB, so it is a DirectHeader
        // this heap wrote; base/mapped/align describe the live run.
        let run = unsafe {
            let dh = (header as *const DirectHeader).read();
            PageRun::from_raw(NonNull::new_unchecked(dh.base), dh.mapped, dh.align)
        };
        pages::release(run);
        self.stats.direct_frees += 1;
    }

    // ── Realloc / shrink ─────────────────────────────────────────────

    fn realloc_pooled(
        &mut self,
        header: usize,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: header holds a live SlabHeader (canary checked by the
        // caller).
        let block_size = unsafe { (*(header as *const SlabHeader)).block_size } as usize;
        let new_need = new_size.max(new_align);
        match self.class_index(new_need) {
            // Same class: block addresses are block-size aligned, which
            // covers any alignment the class can serve. No bitmap change.
            Some(class) if self.block_size_of(class) == block_size => Ok(old),
            // Smaller class: best-effort move; on failure keep the larger
            // block rather than failing a shrink-shaped request.
            Some(class) if self.block_size_of(class) < block_size => {
                match self.alloc(new_size, new_align) {
                    Ok(fresh) => {
                        let keep = old_len.min(new_size);
                        // SAFETY: both allocations are live with >= keep
                        // bytes and cannot overlap.
                        unsafe {
                            ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), keep);
                        }
                        self.free(old, old_len, old_align);
                        Ok(fresh)
                    }
                    Err(_) => Ok(old),
                }
            }
            // Larger class or the direct regime: fresh, copy, free.
            _ => {
                let fresh = self.alloc(new_size, new_align)?;
                let keep = old_len.min(new_size);
                // SAFETY: as above.
                unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), keep) };
                self.free(old, old_len, old_align);
                Ok(fresh)
            }
        }
    }

    fn realloc_direct(
        &mut self,
        header: usize,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let slab_size = self.config.slab_size;
        let new_need = new_size.max(new_align);
        if new_need > MAX_BLOCK_SIZE && new_align < slab_size {
            // Direct stays direct: delegate to the page layer when the
            // header-to-user geometry is unchanged.
            // SAFETY: header holds a live DirectHeader.
            unsafe {
                let dh = header as *mut DirectHeader;
                let base = (*dh).base;
                let old_off = old.as_ptr() as usize - base as usize;
                let new_off = align_up(std::mem::size_of::<DirectHeader>(), new_align);
                if new_off == old_off {
                    let want = align_up(new_off + new_size, PAGE_SIZE);
                    if want <= (*dh).mapped {
                        return Ok(old);
                    }
                    let run_align = (*dh).align;
                    let mut run = PageRun::from_raw(
                        NonNull::new_unchecked(base),
                        (*dh).mapped,
                        run_align,
                    );
                    match pages::realloc(&mut run, want, run_align) {
                        Ok(()) => {
                            // The header moved with the run's contents;
                            // refresh its self-describing fields.
                            let nbase = run.base().as_ptr();
                            (nbase as *mut DirectHeader).write(DirectHeader {
                                canary: FAKE_SLAB,
                                base: nbase,
                                mapped: run.mapped(),
                                align: run.align(),
                            });
                            std::mem::forget(run);
                            return Ok(NonNull::new_unchecked(nbase.add(new_off)));
                        }
                        Err(e) => {
                            // Old run untouched; drop the temporary handle
                            // without releasing it.
                            std::mem::forget(run);
                            return Err(e);
                        }
                    }
                }
            }
        }
        // Regime or geometry change: fresh, copy, free.
        let fresh = self.alloc(new_size, new_align)?;
        let keep = old_len.min(new_size);
        // SAFETY: both allocations live, disjoint, >= keep bytes.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), keep) };
        self.free(old, old_len, old_align);
        Ok(fresh)
    }

    fn shrink_pooled(
        &mut self,
        header: usize,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> NonNull<u8> {
        // SAFETY: header holds a live SlabHeader.
        let block_size = unsafe { (*(header as *const SlabHeader)).block_size } as usize;
        let new_need = new_size.max(new_align);
        debug_assert!(
            new_need <= block_size,
            "shrink cannot strengthen a {block_size}-byte block to {new_need}"
        );
        let class = self.class_index(new_need).expect("shrink target fits a size class");
        if self.block_size_of(class) == block_size {
            return old;
        }
        match self.alloc(new_size, new_align) {
            Ok(fresh) => {
                // SAFETY: both allocations live, disjoint, >= new_size.
                unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), new_size) };
                self.free(old, old_len, old_align);
                fresh
            }
            Err(_) => old,
        }
    }

    fn shrink_direct(
        &mut self,
        header: usize,
        old: NonNull<u8>,
        old_len: usize,
        old_align: usize,
        new_size: usize,
        new_align: usize,
    ) -> NonNull<u8> {
        let new_need = new_size.max(new_align);
        if new_need <= MAX_BLOCK_SIZE {
            // Direct to pooled. If the pool cannot take it, keep the run
            // but reshape it: fake-slab header at the base, user pointer
            // repositioned to the new alignment.
            match self.alloc(new_size, new_align) {
                Ok(fresh) => {
                    // SAFETY: both allocations live, disjoint, >= new_size.
                    unsafe {
                        ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), new_size);
                    }
                    self.free(old, old_len, old_align);
                    return fresh;
                }
                Err(_) => {
                    self.stats.fake_conversions += 1;
                    return self.refit_direct(header, old, new_size, new_align);
                }
            }
        }
        // Stays direct: cap in place (the page layer cannot partially
        // unmap), repositioning only if the alignment demands it.
        if new_align >= self.config.slab_size {
            debug_assert!(is_aligned(old.as_ptr() as usize, new_align));
            return old;
        }
        self.refit_direct(header, old, new_size, new_align)
    }

    /// Move a direct allocation's user region to
    /// `align_up(header, new_align)` within its run and rewrite the
    /// header at the run base. Infallible; the mapped extent is
    /// unchanged.
    fn refit_direct(
        &mut self,
        header: usize,
        old: NonNull<u8>,
        new_size: usize,
        new_align: usize,
    ) -> NonNull<u8> {
        debug_assert!(new_align < self.config.slab_size);
        // SAFETY: header holds a live DirectHeader; the run spans
        // base..base+mapped and contains both the old and new user
        // regions.
        unsafe {
            let dh = (header as *const DirectHeader).read();
            let base = dh.base;
            let new_off = align_up(std::mem::size_of::<DirectHeader>(), new_align);
            debug_assert!(new_off + new_size <= dh.mapped);
            let user = base.add(new_off);
            if user != old.as_ptr() {
                // Regions may overlap when sliding left within the run.
                ptr::copy(old.as_ptr(), user, new_size);
            }
            // The header may previously have lived one slab below a
            // slab-aligned user pointer; after repositioning, masking
            // finds the run base, so the header must live there.
            (base as *mut DirectHeader).write(DirectHeader {
                canary: FAKE_SLAB,
                base,
                mapped: dh.mapped,
                align: dh.align,
            });
            NonNull::new_unchecked(user)
        }
    }

    // ── Test support ─────────────────────────────────────────────────

    /// Force every pooled allocation to report out-of-memory.
    #[cfg(test)]
    fn set_fail_pooled(&mut self, fail: bool) {
        self.fail_pooled = fail;
    }

    /// Total free slots recorded across a class's index slabs.
    #[cfg(test)]
    fn class_free_slots(&self, class: usize) -> usize {
        let mut total = 0usize;
        let mut cur = self.classes[class].head;
        while !cur.is_null() {
            // SAFETY: live index slab of this heap.
            unsafe {
                let hdr = cur as *mut IndexHeader;
                let counts = cur.add(self.index_schema.offset(0)) as *const u16;
                for i in 0..(*hdr).in_use as usize {
                    total += *counts.add(i) as usize;
                }
                cur = (*hdr).next;
            }
        }
        total
    }

    /// Number of zero bits in the valid range of every slab of a class.
    #[cfg(test)]
    fn class_bitmap_free_slots(&self, class: usize) -> usize {
        let geo = self.geometry(self.block_size_of(class));
        let mut total = 0usize;
        let mut cur = self.classes[class].head;
        while !cur.is_null() {
            // SAFETY: live index slab; slab pointers in the in_use prefix
            // point at live data slabs.
            unsafe {
                let hdr = cur as *mut IndexHeader;
                let slabs = cur.add(self.index_schema.offset(1)) as *const *mut u8;
                for i in 0..(*hdr).in_use as usize {
                    let slab = *slabs.add(i);
                    let words = slab.add(std::mem::size_of::<SlabHeader>()) as *const u64;
                    for w in 0..geo.bitmap_words {
                        total += (!*words.add(w)).count_ones() as usize;
                    }
                }
                cur = (*hdr).next;
            }
        }
        total
    }
}

impl Default for BlockHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockHeap {
    fn drop(&mut self) {
        // Slabs and index slabs go back to the page layer wholesale;
        // outstanding direct allocations are untracked and stay with
        // their owners.
        let slab_size = self.config.slab_size;
        for class in &self.classes {
            let mut cur = class.head;
            while !cur.is_null() {
                // SAFETY: live index slab; its in_use prefix points at
                // live data slabs obtained at slab_size alignment.
                unsafe {
                    let hdr = cur as *mut IndexHeader;
                    let slabs = cur.add(self.index_schema.offset(1)) as *const *mut u8;
                    for i in 0..(*hdr).in_use as usize {
                        let slab = *slabs.add(i);
                        let run = PageRun::from_raw(
                            NonNull::new_unchecked(slab),
                            slab_size,
                            slab_size,
                        );
                        pages::release(run);
                    }
                    let next = (*hdr).next;
                    let run = PageRun::from_raw(
                        NonNull::new_unchecked(cur),
                        PAGE_SIZE,
                        PAGE_SIZE,
                    );
                    pages::release(run);
                    cur = next;
                }
            }
        }
    }
}

/// Metadata is in a state the allocator can neither trust nor repair.
fn corruption(msg: &str) -> ! {
    eprintln!("keel-alloc: heap corruption: {msg}");
    std::process::abort();
}
