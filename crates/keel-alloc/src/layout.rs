//! Structure-of-arrays layout calculation for fixed-size aligned chunks.
//!
//! A [`ChunkSchema`] packs a header plus N parallel arrays into a chunk of
//! a given power-of-two size, maximising N under the alignment
//! constraints of each array's element type. Chunks are always allocated
//! at alignment equal to their size, so the chunk base (and with it the
//! header) is recoverable from any interior pointer by masking.

use smallvec::SmallVec;

use keel_core::{align_down, align_up};

/// Size and alignment of one array's element type (or of the header).
///
/// The schema works on these triples rather than on type parameters so a
/// single computed schema can serve layouts assembled at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    /// Element size in bytes.
    pub size: usize,
    /// Element alignment in bytes (a power of two).
    pub align: usize,
}

impl FieldLayout {
    /// The layout of `T`.
    pub fn of<T>() -> Self {
        Self { size: std::mem::size_of::<T>(), align: std::mem::align_of::<T>() }
    }
}

/// Computed layout of a header plus parallel arrays within one chunk.
#[derive(Clone, Debug)]
pub struct ChunkSchema {
    chunk_size: usize,
    capacity: usize,
    offsets: SmallVec<[usize; 8]>,
}

impl ChunkSchema {
    /// Compute the schema for `fields` parallel arrays following `header`
    /// in a chunk of `chunk_size` bytes.
    ///
    /// Starts from the upper-bound capacity
    /// `(chunk_size − header.size) / Σ field sizes` and decrements until
    /// the aligned arrays fit.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is not a power of two, if any alignment
    /// exceeds `chunk_size`, or if not even a single item fits. All are
    /// programmer errors in the layout being described.
    pub fn new(header: FieldLayout, fields: &[FieldLayout], chunk_size: usize) -> Self {
        assert!(chunk_size.is_power_of_two(), "chunk size {chunk_size} is not a power of two");
        assert!(header.align <= chunk_size, "header alignment exceeds chunk size");
        assert!(!fields.is_empty(), "schema needs at least one array");
        let per_item: usize = fields.iter().map(|f| f.size).sum();
        assert!(per_item > 0, "schema arrays are all zero-sized");
        assert!(header.size < chunk_size, "header alone overflows the chunk");
        for f in fields {
            assert!(f.align.is_power_of_two() && f.align <= chunk_size);
        }

        let mut capacity = (chunk_size - header.size) / per_item;
        loop {
            assert!(capacity > 0, "chunk of {chunk_size} bytes holds no items");
            if let Some(offsets) = Self::try_fit(header.size, fields, chunk_size, capacity) {
                return Self { chunk_size, capacity, offsets };
            }
            capacity -= 1;
        }
    }

    fn try_fit(
        header_size: usize,
        fields: &[FieldLayout],
        chunk_size: usize,
        capacity: usize,
    ) -> Option<SmallVec<[usize; 8]>> {
        let mut offsets = SmallVec::new();
        let mut cursor = header_size;
        for f in fields {
            let pos = align_up(cursor, f.align);
            offsets.push(pos);
            cursor = pos + capacity * f.size;
            if cursor > chunk_size {
                return None;
            }
        }
        Some(offsets)
    }

    /// Number of items each parallel array holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunk size (and therefore chunk alignment) in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Byte offset of the `i`-th array from the chunk base.
    pub fn offset(&self, i: usize) -> usize {
        self.offsets[i]
    }

    /// Number of arrays in the schema.
    pub fn num_arrays(&self) -> usize {
        self.offsets.len()
    }

    /// Recover the chunk base from a pointer anywhere inside the chunk.
    ///
    /// Valid because chunks are allocated at alignment equal to their
    /// size: the base is the address with the low `log2(chunk_size)` bits
    /// cleared.
    pub fn chunk_from_interior(&self, ptr: *mut u8) -> *mut u8 {
        align_down(ptr as usize, self.chunk_size) as *mut u8
    }

    /// Recover the chunk base from a pointer to its header.
    ///
    /// The header is placed at offset zero, so this is the identity; it
    /// exists so call sites read as intent rather than as a cast.
    pub fn chunk_from_header(&self, header: *mut u8) -> *mut u8 {
        debug_assert_eq!(self.chunk_from_interior(header), header, "header is not chunk-aligned");
        header
    }
}
