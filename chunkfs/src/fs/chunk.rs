//! Chunk naming and byte-interval arithmetic.
//!
//! Chunk k covers file bytes [k*CS, (k+1)*CS). Chunk 0 is the inode
//! object itself; higher chunks append a dot-decimal suffix. Reader
//! and writer share this scheme.

/// Object name backing chunk `index` of `inode`.
pub fn chunk_name(inode: &str, index: u64) -> String {
    if index == 0 {
        inode.to_string()
    } else {
        format!("{}.{}", inode, index)
    }
}

pub fn chunk_index_for(offset: u64, chunk_size: u64) -> u64 {
    offset / chunk_size
}

/// Last chunk index of a file of `size` bytes (0 for an empty file).
pub fn last_chunk_index(size: u64, chunk_size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        (size - 1) / chunk_size
    }
}

/// On aligned pools the per-file chunk size is aligned down so every
/// full chunk object can be stored at an aligned length.
pub fn align_chunk_size(chunk_size: u64, alignment: u64) -> u64 {
    if alignment == 0 || chunk_size % alignment == 0 {
        return chunk_size;
    }
    let aligned = chunk_size - chunk_size % alignment;
    aligned.max(alignment)
}

/// Rounds a length up to the pool alignment.
pub fn align_up(len: u64, alignment: u64) -> u64 {
    if alignment == 0 || len % alignment == 0 {
        len
    } else {
        len + alignment - len % alignment
    }
}

/// A sub-interval of one caller range that fits a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: u64,
    /// Offset inside the chunk object.
    pub local_offset: u64,
    pub len: usize,
    /// Offset of this slice inside the caller range it was split from.
    pub buf_offset: usize,
}

/// Splits the file interval [offset, offset + len) by chunk boundary.
pub fn chunk_slices(offset: u64, len: usize, chunk_size: u64) -> Vec<ChunkSlice> {
    let mut slices = Vec::new();
    let mut index = chunk_index_for(offset, chunk_size);
    let mut local_offset = offset % chunk_size;
    let mut remaining = len;

    while remaining > 0 {
        let slice_len = ((chunk_size - local_offset) as usize).min(remaining);
        slices.push(ChunkSlice {
            index,
            local_offset,
            len: slice_len,
            buf_offset: len - remaining,
        });
        remaining -= slice_len;
        local_offset = 0;
        index += 1;
    }

    slices
}

/// An interval split against the inline-buffer capacity: the prefix
/// below the capacity is served by the inline entry, the rest by
/// chunks. Offsets stay in file-address space on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineSplit {
    pub inline: Option<(u64, usize)>,
    pub inode: Option<(u64, usize)>,
}

pub fn split_at_inline_capacity(offset: u64, len: usize, capacity: u64) -> InlineSplit {
    if len == 0 {
        return InlineSplit::default();
    }
    let end = offset + len as u64;

    if offset >= capacity {
        return InlineSplit {
            inline: None,
            inode: Some((offset, len)),
        };
    }

    if end <= capacity {
        return InlineSplit {
            inline: Some((offset, len)),
            inode: None,
        };
    }

    let inline_len = (capacity - offset) as usize;
    InlineSplit {
        inline: Some((offset, inline_len)),
        inode: Some((capacity, len - inline_len)),
    }
}
