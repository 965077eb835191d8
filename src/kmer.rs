//! Two-bit kmer codec and de Bruijn neighbour arithmetic
//!
//! Kmers are DNA words of fixed length `k` packed two bits per base into a
//! `u64` (`A=00, C=01, G=10, T=11`), first base in the most significant
//! position. Codes are dense in `[0, 4^k)`, so integer order doubles as the
//! deterministic tie-break order used throughout the pipeline.
//!
//! Ambiguous bases (`N` or anything else outside ACGT, either case) have no
//! code: [`KmerCodec::encode`] returns `None` and the caller skips that read
//! offset entirely.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

/// Largest kmer size that fits a two-bit packing in 64 bits.
pub const MAX_K: usize = 31;

/// Errors surfaced by the kmer codec.
#[derive(Debug, thiserror::Error)]
pub enum KmerError {
    #[error("kmer size {0} out of range (4 ..= {MAX_K})")]
    BadK(usize),
}

/// Encoder/decoder for one fixed kmer size.
///
/// Cheap to copy; every stage holds its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KmerCodec {
    k: usize,
    mask: u64,
}

impl KmerCodec {
    /// Build a codec for `k`. Odd `k` avoids reverse-complement palindromes,
    /// but the codec itself only requires the two-bit packing to fit.
    pub fn new(k: usize) -> Result<Self, KmerError> {
        if !(4..=MAX_K).contains(&k) {
            return Err(KmerError::BadK(k));
        }
        Ok(Self { k, mask: (1u64 << (2 * k)) - 1 })
    }

    /// The kmer size this codec was built for.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Two-bit code for a single base, `None` for ambiguous bases.
    #[inline]
    pub fn base_code(base: u8) -> Option<u64> {
        match base {
            b'A' | b'a' => Some(0),
            b'C' | b'c' => Some(1),
            b'G' | b'g' => Some(2),
            b'T' | b't' => Some(3),
            _ => None,
        }
    }

    /// The base character for the low two bits of `code`.
    #[inline]
    pub fn code_base(code: u64) -> u8 {
        match code & 3 {
            0 => b'A',
            1 => b'C',
            2 => b'G',
            _ => b'T',
        }
    }

    /// Pack `bases` (length exactly `k`) into a code, or `None` if any base
    /// is ambiguous.
    pub fn encode(&self, bases: &[u8]) -> Option<u64> {
        debug_assert_eq!(bases.len(), self.k, "encode window must be k bases");
        let mut code = 0u64;
        for &b in bases {
            code = (code << 2) | Self::base_code(b)?;
        }
        Some(code)
    }

    /// Unpack a code back into its `k` bases.
    pub fn decode(&self, kmer: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.k];
        for (i, slot) in out.iter_mut().enumerate() {
            let shift = 2 * (self.k - 1 - i);
            *slot = Self::code_base(kmer >> shift);
        }
        out
    }

    /// Last base of the kmer, i.e. the base that completes it.
    #[inline]
    pub fn last_base(&self, kmer: u64) -> u8 {
        Self::code_base(kmer)
    }

    /// Shift `base_code` in from the right, dropping the leftmost base.
    #[inline]
    pub fn shift_in(&self, kmer: u64, base_code: u64) -> u64 {
        ((kmer << 2) | (base_code & 3)) & self.mask
    }

    /// The four kmers reachable by shifting one base in from the right.
    #[inline]
    pub fn successors(&self, kmer: u64) -> [u64; 4] {
        core::array::from_fn(|c| self.shift_in(kmer, c as u64))
    }

    /// The four kmers from which `kmer` is reachable by a right shift-in.
    #[inline]
    pub fn predecessors(&self, kmer: u64) -> [u64; 4] {
        let tail = kmer >> 2;
        core::array::from_fn(|c| tail | ((c as u64) << (2 * (self.k - 1))))
    }

    /// True iff `next` follows `prev`: the last `k-1` bases of `prev` are the
    /// first `k-1` bases of `next`.
    #[inline]
    pub fn is_successor(&self, prev: u64, next: u64) -> bool {
        (next >> 2) == (prev & (self.mask >> 2))
    }
}

// ============================================================================
// Tests
// ============================================================================
