//! Facade over the OS allocation layer, dealing in aligned page runs.
//!
//! A [`PageRun`] is a contiguous byte range whose base address carries at
//! least the requested alignment and whose mapped length is a multiple of
//! [`PAGE_SIZE`]. Runs are obtained from the global allocator with an
//! explicit [`Layout`], which guarantees the base alignment exactly,
//! including alignments far above the page size, which the block heap
//! relies on to recover slab headers by masking interior pointers.
//!
//! Because the global allocator cannot partially unmap, [`shrink`] only
//! caps the usable length; the run remembers its mapped extent so that
//! [`release`] can hand back the original layout.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use keel_core::{is_aligned, AllocError};

/// Granularity of page runs, in bytes.
///
/// Fixed at 4 KiB, the host page size on every platform this crate
/// targets. All run lengths are multiples of this and all run alignments
/// are at least this.
pub const PAGE_SIZE: usize = 4096;

/// A contiguous, aligned byte range obtained from the OS allocation layer.
///
/// `len` is the usable length visible to the owner; `mapped` is the
/// length actually obtained (they diverge only after [`shrink`]).
#[derive(Debug)]
pub struct PageRun {
    base: NonNull<u8>,
    len: usize,
    mapped: usize,
    align: usize,
}

// SAFETY: a PageRun exclusively owns its mapped range; nothing in it is
// tied to the creating thread.
unsafe impl Send for PageRun {}

impl PageRun {
    /// Base address of the run.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the usable length is zero (never true for an obtained run).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mapped length in bytes (what [`release`] will hand back).
    pub fn mapped(&self) -> usize {
        self.mapped
    }

    /// Alignment the run was obtained with.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Reconstruct a run from raw parts, with `mapped == len`.
    ///
    /// # Safety
    ///
    /// `base` must be the base of a run previously obtained with exactly
    /// this `len` and `align` and not yet released, and the caller must be
    /// its unique owner from this point on.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize, align: usize) -> Self {
        Self { base, len, mapped: len, align }
    }
}

/// The canonical zero-length allocation: a dangling pointer carrying the
/// requested alignment.
pub(crate) fn dangling(align: usize) -> NonNull<u8> {
    debug_assert!(align.is_power_of_two());
    // SAFETY: align is a non-zero power of two, hence a valid non-null
    // address for a zero-length view.
    unsafe { NonNull::new_unchecked(align as *mut u8) }
}

fn run_layout(len: usize, align: usize) -> Layout {
    debug_assert!(len > 0, "page run length must be non-zero");
    debug_assert!(is_aligned(len, PAGE_SIZE), "page run length {len} is not page-granular");
    debug_assert!(
        align.is_power_of_two() && align >= PAGE_SIZE,
        "page run alignment {align} must be a power of two >= PAGE_SIZE"
    );
    // The asserts above are the real contract; from_size_align only
    // rejects sizes that overflow when rounded up to the alignment.
    Layout::from_size_align(len, align).expect("page run layout overflows")
}

/// Obtain a run of `len` bytes at the given alignment.
///
/// `len` must be a non-zero multiple of [`PAGE_SIZE`]; `align` must be a
/// power of two at least [`PAGE_SIZE`].
pub fn obtain(len: usize, align: usize) -> Result<PageRun, AllocError> {
    let layout = run_layout(len, align);
    // SAFETY: layout has non-zero size (asserted in run_layout).
    let ptr = unsafe { alloc::alloc(layout) };
    match NonNull::new(ptr) {
        Some(base) => Ok(PageRun { base, len, mapped: len, align }),
        None => Err(AllocError::OutOfMemory { requested: len, align }),
    }
}

/// Resize a run, possibly relocating it. Contents up to
/// `min(old_len, new_len)` are preserved.
///
/// On error the run is left untouched.
pub fn realloc(run: &mut PageRun, new_len: usize, new_align: usize) -> Result<(), AllocError> {
    let _ = run_layout(new_len, new_align);
    if new_align == run.align {
        let old_layout = run_layout(run.mapped, run.align);
        // SAFETY: base/old_layout describe the live allocation; new_len is
        // non-zero (asserted above).
        let ptr = unsafe { alloc::realloc(run.base.as_ptr(), old_layout, new_len) };
        let base = NonNull::new(ptr)
            .ok_or(AllocError::OutOfMemory { requested: new_len, align: new_align })?;
        run.base = base;
        run.len = new_len;
        run.mapped = new_len;
        return Ok(());
    }
    // Alignment change: obtain a fresh run and copy.
    let fresh = obtain(new_len, new_align)?;
    let keep = run.len.min(new_len);
    // SAFETY: both runs are live and disjoint; keep fits in both.
    unsafe {
        std::ptr::copy_nonoverlapping(run.base.as_ptr(), fresh.base.as_ptr(), keep);
    }
    let old = std::mem::replace(run, fresh);
    release(old);
    Ok(())
}

/// Cap a run's usable length. Never fails and never relocates; the mapped
/// extent is retained for [`release`].
///
/// `new_len` must be a non-zero page-granular length not exceeding the
/// current usable length, and `new_align` must not exceed the run's
/// alignment (a shrink cannot strengthen alignment).
pub fn shrink(run: &mut PageRun, new_len: usize, new_align: usize) {
    debug_assert!(new_len <= run.len, "shrink cannot grow a run");
    debug_assert!(
        new_align <= run.align,
        "shrink cannot raise alignment ({new_align} > {})",
        run.align
    );
    debug_assert!(is_aligned(new_len, PAGE_SIZE) && new_len > 0);
    run.len = new_len;
}

/// Return a run to the OS allocation layer.
pub fn release(run: PageRun) {
    let layout = run_layout(run.mapped, run.align);
    // SAFETY: base/layout describe the live allocation obtained in
    // obtain/realloc; ownership of the run is consumed here.
    unsafe { alloc::dealloc(run.base.as_ptr(), layout) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obtain_is_aligned_and_release_roundtrips() {
        let run = obtain(PAGE_SIZE * 4, PAGE_SIZE).unwrap();
        assert_eq!(run.len(), PAGE_SIZE * 4);
        assert_eq!(run.mapped(), PAGE_SIZE * 4);
        assert!(is_aligned(run.base().as_ptr() as usize, PAGE_SIZE));
        release(run);
    }

    #[test]
    fn obtain_honours_large_alignment() {
        // Alignment well above the page size: the slab-masking trick
        // depends on this being exact.
        let run = obtain(65536, 65536).unwrap();
        assert!(is_aligned(run.base().as_ptr() as usize, 65536));
        release(run);
    }

    #[test]
    fn realloc_preserves_prefix() {
        let mut run = obtain(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: writing within the run's usable length.
        unsafe {
            run.base().as_ptr().write_bytes(0xAB, PAGE_SIZE);
        }
        realloc(&mut run, PAGE_SIZE * 2, PAGE_SIZE).unwrap();
        assert_eq!(run.len(), PAGE_SIZE * 2);
        // SAFETY: reading the preserved prefix.
        let first = unsafe { *run.base().as_ptr() };
        let last = unsafe { *run.base().as_ptr().add(PAGE_SIZE - 1) };
        assert_eq!(first, 0xAB);
        assert_eq!(last, 0xAB);
        release(run);
    }

    #[test]
    fn realloc_with_new_alignment_relocates() {
        let mut run = obtain(PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: writing within the run's usable length.
        unsafe { run.base().as_ptr().write_bytes(0x5C, PAGE_SIZE) };
        realloc(&mut run, PAGE_SIZE * 4, PAGE_SIZE * 4).unwrap();
        assert!(is_aligned(run.base().as_ptr() as usize, PAGE_SIZE * 4));
        // SAFETY: reading the preserved prefix.
        assert_eq!(unsafe { *run.base().as_ptr().add(100) }, 0x5C);
        release(run);
    }

    #[test]
    fn shrink_caps_len_but_keeps_mapped() {
        let mut run = obtain(PAGE_SIZE * 8, PAGE_SIZE).unwrap();
        shrink(&mut run, PAGE_SIZE * 2, PAGE_SIZE);
        assert_eq!(run.len(), PAGE_SIZE * 2);
        assert_eq!(run.mapped(), PAGE_SIZE * 8);
        release(run);
    }
}
