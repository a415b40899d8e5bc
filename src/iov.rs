//! Scatter/gather primitives shared by the I/O and zero-copy paths.

/// A single I/O vector: an owned buffer plus the number of bytes filled.
///
/// On the fetch path the engine fills the buffer and advances `len`; on the
/// update path the caller provides the payload with `len` already set.
#[derive(Debug, Default, Clone)]
pub struct Iov {
    data: Box<[u8]>,
    len: usize,
}

impl Iov {
    /// An empty sink buffer of `cap` bytes.
    pub fn with_capacity(cap: usize) -> Self {
        Iov {
            data: vec![0u8; cap].into_boxed_slice(),
            len: 0,
        }
    }

    /// A fully populated source buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Iov {
            len: bytes.len(),
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled prefix.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole buffer, filled or not.
    pub(crate) fn raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len;
    }
}

/// A scatter/gather list. `nr_out` counts the iovs the engine touched, the
/// same way the populated-vector count travels back to RPC handlers.
#[derive(Debug, Default, Clone)]
pub struct SgList {
    pub iovs: Vec<Iov>,
    pub nr_out: usize,
}

impl SgList {
    pub fn new(iovs: Vec<Iov>) -> Self {
        SgList { iovs, nr_out: 0 }
    }

    /// Sink of `n` buffers with `cap` bytes each.
    pub fn sink(n: usize, cap: usize) -> Self {
        SgList {
            iovs: (0..n).map(|_| Iov::with_capacity(cap)).collect(),
            nr_out: 0,
        }
    }

    /// A nonexistent key empties the list: filled lengths drop to zero, the
    /// buffers themselves stay with the caller.
    pub fn clear_filled(&mut self) {
        for iov in &mut self.iovs {
            iov.set_len(0);
        }
        self.nr_out = 0;
    }

    /// Total bytes filled across all iovs.
    pub fn filled(&self) -> usize {
        self.iovs.iter().map(|iov| iov.len()).sum()
    }

    /// Concatenated filled bytes, test and resync helper.
    pub fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.filled());
        for iov in &self.iovs {
            out.extend_from_slice(iov.as_slice());
        }
        out
    }
}
