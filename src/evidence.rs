//! Directed structural-variant evidence records
//!
//! One [`Evidence`] is a read (bases and qualities) plus the positional
//! uncertainty of where its kmers may sit on the reference. `[start, end]`
//! is the interval of possible genomic start positions of the *offset-0*
//! kmer; every later offset shifts that interval by one base. Soft clips are
//! exact (`start == end`); discordant pair anchors carry the fragment-size
//! uncertainty window.
//!
//! Evidence for both breakend directions is assembled in natural
//! left-to-right position order. Direction decides where the reference
//! anchor sits in the read: a prefix of `anchor_len` bases for forward
//! breakends, a suffix for backward ones.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::{PipelineError, Pos};

/// Opaque evidence identity, unique within one input stream.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EvidenceId(pub u64);

impl EvidenceId {
    /// Access the underlying id.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Which side of the breakend junction the novel sequence continues on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakendDirection {
    /// Sequence continues to the right of the anchor.
    Forward,
    /// Sequence continues to the left of the anchor.
    Backward,
}

impl std::fmt::Display for BreakendDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

/// How the evidence was derived by the upstream extractor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceKind {
    /// A soft-clipped read tail; positionally exact.
    SoftClip,
    /// A discordant read-pair anchor; positionally bounded by fragment size.
    PairAnchor,
}

/// A single piece of directed breakend evidence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    pub reference_index: usize,
    /// Lowest possible genomic start position of the offset-0 kmer.
    pub start: Pos,
    /// Highest possible genomic start position of the offset-0 kmer.
    pub end: Pos,
    pub direction: BreakendDirection,
    pub kind: EvidenceKind,
    pub read_bases: Vec<u8>,
    pub base_quals: Vec<u8>,
    /// Count of reference-aligned bases: a read prefix for forward
    /// evidence, a suffix for backward evidence.
    pub anchor_len: usize,
}

impl Evidence {
    /// Read length in bases.
    #[inline]
    pub fn read_len(&self) -> usize {
        self.read_bases.len()
    }

    /// Width of the kmer support interval in positions.
    #[inline]
    pub fn support_width(&self) -> Pos {
        self.end - self.start + 1
    }

    /// Whether the kmer at read offset `i` lies entirely within the
    /// anchored bases. Only such kmers are reference-flagged.
    #[inline]
    pub fn is_reference_kmer(&self, offset: usize, k: usize) -> bool {
        match self.direction {
            BreakendDirection::Forward => offset + k <= self.anchor_len,
            BreakendDirection::Backward => {
                offset >= self.read_len().saturating_sub(self.anchor_len)
            }
        }
    }

    /// Whether the kmer at read offset `i` must be skipped under the
    /// pair-anchor end-base mismatch rule: the window intersects the first
    /// or last `ignore_end_bases` bases of the read.
    #[inline]
    pub fn skips_pair_anchor_kmer(
        &self,
        offset: usize,
        k: usize,
        ignore_end_bases: usize,
    ) -> bool {
        self.kind == EvidenceKind::PairAnchor
            && (offset < ignore_end_bases
                || offset + k > self.read_len().saturating_sub(ignore_end_bases))
    }

    /// Structural checks applied at pipeline intake. Violations are fatal
    /// to the current pipeline.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.read_bases.len() != self.base_quals.len() {
            return Err(PipelineError::MalformedInput(format!(
                "evidence {}: {} bases but {} qualities",
                self.id.0,
                self.read_bases.len(),
                self.base_quals.len()
            )));
        }
        if self.read_bases.is_empty() {
            return Err(PipelineError::MalformedInput(format!(
                "evidence {}: empty read",
                self.id.0
            )));
        }
        if self.end < self.start {
            return Err(PipelineError::MalformedInput(format!(
                "evidence {}: support interval [{}, {}] is empty",
                self.id.0, self.start, self.end
            )));
        }
        if self.anchor_len > self.read_len() {
            return Err(PipelineError::MalformedInput(format!(
                "evidence {}: anchor length {} exceeds read length {}",
                self.id.0,
                self.anchor_len,
                self.read_len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
