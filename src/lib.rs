//! Crate root: public surface, shared aliases, and pipeline-wide invariants
//!
//! `breva` performs positional de Bruijn graph assembly of non-reference
//! breakend contigs from a position-sorted stream of directed
//! structural-variant evidence (soft-clipped read tails and discordant
//! read-pair anchors). For each reference contig and breakend direction it
//! reconstructs the novel sequence that best explains the supporting
//! evidence, one assembled contig per breakend region, without ever
//! materialising the full graph: every stage is a pull-based lazy iterator
//! over a position-bounded window.
//!
//! ## Invariants
//!
//! - **Streaming discipline.** Each stage buffers only what the sliding
//!   window requires; a node whose start interval falls behind the input
//!   frontier by more than the evidence support width is evicted. Peak
//!   memory is a function of the window, not the contig.
//! - **Determinism.** Every buffer is an ordered structure and every
//!   tie-break is total, so a rerun over the same evidence stream and
//!   configuration produces a byte-identical record stream.
//! - **Evidence conservation.** The [`tracker::EvidenceTracker`] holds the
//!   exact per-kmer weight each evidence contributed to each node; debug
//!   builds audit the relation at every stage boundary, and emitting a
//!   contig releases its supporting evidence from the whole window.
//! - **Isolation.** Pipelines for different `(contig, direction)` pairs
//!   share no mutable state; a failing contig cannot corrupt the next one.
//!
//! If any invariant is violated at runtime the failure mode is a precise
//! [`PipelineError`], never silent corruption.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Two-bit kmer codec and de Bruijn neighbour arithmetic.
pub mod kmer;

/// Directed structural-variant evidence records.
pub mod evidence;

/// Evidence fan-out into weighted positional kmer occurrences.
pub mod support;

/// Aggregation of coincident support into maximal kmer nodes.
pub mod aggregate;

/// The id-based evidence ↔ node relation shared by all stages.
pub mod tracker;

/// Unbranched path node construction over the positional kmer graph.
pub mod path_node;

/// Error correction: sibling path collapse within a Hamming budget.
pub mod collapse;

/// Post-collapse re-merging of unbranched neighbours.
pub mod simplify;

/// Windowed assembly of best-scoring non-reference contigs.
pub mod assembler;

/// Per-pipeline stage counters and optional CSV export.
pub mod export;

/// Pipeline wiring: per-contig gate, stage chain, outer driver.
pub mod pipeline;

use serde::{Deserialize, Serialize};

/// Genomic position. Signed so interval arithmetic near a contig start
/// never wraps.
pub type Pos = i64;

pub use crate::assembler::AssemblyRecord;
pub use crate::evidence::{BreakendDirection, Evidence, EvidenceId, EvidenceKind};
pub use crate::kmer::{KmerCodec, KmerError};
pub use crate::pipeline::{PositionalAssembler, RecoveryPolicy};
pub use crate::tracker::{EvidenceTracker, NodeId};

/// Fatal pipeline errors. Export write failures are deliberately absent:
/// they are logged at debug level and the pipeline continues without its
/// side output.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Evidence missing required structure or out of sort order. Fatal to
    /// the current pipeline.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// A tracker or stage consistency audit failed (debug builds). Fatal.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Any other failure while assembling a contig.
    #[error("assembly failure")]
    Assembly(#[from] anyhow::Error),
}

/// Configuration errors surfaced before a pipeline is built.
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    /// Kmer size outside the 64-bit two-bit packing range.
    #[error("kmer size {0} out of range (4 ..= 31)")]
    KmerSize(usize),
    /// A window or length parameter that must be positive was zero.
    #[error("{0} must be positive")]
    ZeroParameter(&'static str),
    /// Concordant fragment sizes empty or inverted.
    #[error("concordant fragment sizes [{min}, {max}] are not a valid range")]
    FragmentSizes {
        /// Configured minimum concordant fragment size.
        min: usize,
        /// Configured maximum concordant fragment size.
        max: usize,
    },
    /// Reads shorter than the kmer size can never produce support.
    #[error("max read length {len} is shorter than kmer size {k}")]
    ReadLength {
        /// Configured maximum read length.
        len: usize,
        /// Configured kmer size.
        k: usize,
    },
}

/// Assembly configuration record.
///
/// Validated once by the driver; beyond the raw fields, the stages consume
/// only the derived window widths below.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyParams {
    /// Kmer size, `4 ..= 31`. Odd sizes avoid reverse-complement
    /// palindromes; even sizes are accepted with a warning.
    pub k: usize,
    /// Reference anchor length to attach to each contig, in kmers.
    pub anchor_length: usize,
    /// Maximum kmers per path node.
    pub max_path_length: usize,
    /// Maximum kmers per arm considered by full path collapse.
    pub max_path_collapse_length: usize,
    /// Base mismatch budget for collapsing sibling paths; `0` disables
    /// error correction.
    pub max_base_mismatch_for_collapse: usize,
    /// Restrict collapse to terminal leaves and simple bubbles.
    pub collapse_bubbles_only: bool,
    /// Whether discordant read-pair anchors contribute support at all.
    pub include_pair_anchors: bool,
    /// Bases to ignore at each end of a pair-anchor read.
    pub pair_anchor_mismatch_ignore_end_bases: usize,
    /// Smallest fragment size considered concordant.
    pub min_concordant_fragment_size: usize,
    /// Largest fragment size considered concordant.
    pub max_concordant_fragment_size: usize,
    /// Longest read the evidence extractor can produce.
    pub max_read_length: usize,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        Self {
            k: 25,
            anchor_length: 4,
            max_path_length: 1024,
            max_path_collapse_length: 64,
            max_base_mismatch_for_collapse: 2,
            collapse_bubbles_only: false,
            include_pair_anchors: true,
            pair_anchor_mismatch_ignore_end_bases: 2,
            min_concordant_fragment_size: 300,
            max_concordant_fragment_size: 600,
            max_read_length: 150,
        }
    }
}

impl AssemblyParams {
    /// Structural validation. Emits warnings for configurations that are
    /// legal but easy to regret.
    pub fn validate(&self) -> Result<(), ParamsError> {
        if !(4..=kmer::MAX_K).contains(&self.k) {
            return Err(ParamsError::KmerSize(self.k));
        }
        if self.k % 2 == 0 {
            tracing::warn!(
                k = self.k,
                "even kmer size: reverse-complement palindromic kmers possible"
            );
        }
        if self.anchor_length == 0 {
            return Err(ParamsError::ZeroParameter("anchor_length"));
        }
        if self.max_path_length == 0 {
            return Err(ParamsError::ZeroParameter("max_path_length"));
        }
        if self.min_concordant_fragment_size == 0
            || self.min_concordant_fragment_size > self.max_concordant_fragment_size
        {
            return Err(ParamsError::FragmentSizes {
                min: self.min_concordant_fragment_size,
                max: self.max_concordant_fragment_size,
            });
        }
        if self.max_read_length < self.k {
            return Err(ParamsError::ReadLength { len: self.max_read_length, k: self.k });
        }
        if self.max_base_mismatch_for_collapse > 0 && !self.collapse_bubbles_only {
            tracing::warn!(
                max_path_collapse_length = self.max_path_collapse_length,
                "full path collapse enabled: worst case exponential on repetitive sequence"
            );
        }
        Ok(())
    }

    /// Width of a single kmer's support interval:
    /// `max_fragment - min_fragment + 1`.
    pub fn max_kmer_support_interval_width(&self) -> Pos {
        (self.max_concordant_fragment_size - self.min_concordant_fragment_size + 1) as Pos
    }

    /// Width of a whole evidence's support:
    /// `max_kmer_support_interval_width + max_read_length - k + 2`.
    pub fn max_evidence_support_interval_width(&self) -> Pos {
        self.max_kmer_support_interval_width() + (self.max_read_length - self.k + 2) as Pos
    }

    /// Load and validate a parameter record from a JSON file. Embedder
    /// convenience; the library itself never reads configuration.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        use anyhow::Context as _;
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let params: Self =
            serde_json::from_str(&text).context("parsing assembly parameters")?;
        params.validate()?;
        Ok(params)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        AssemblyParams::default().validate().unwrap();
    }

    #[test]
    fn derived_widths_match_definitions() {
        let p = AssemblyParams::default();
        assert_eq!(p.max_kmer_support_interval_width(), 301);
        assert_eq!(p.max_evidence_support_interval_width(), 301 + 150 - 25 + 2);
    }

    #[test]
    fn bad_params_are_rejected() {
        let mut p = AssemblyParams::default();
        p.k = 32;
        assert!(matches!(p.validate(), Err(ParamsError::KmerSize(32))));

        let mut p = AssemblyParams::default();
        p.min_concordant_fragment_size = 700;
        assert!(matches!(p.validate(), Err(ParamsError::FragmentSizes { .. })));

        let mut p = AssemblyParams::default();
        p.max_read_length = 10;
        assert!(matches!(p.validate(), Err(ParamsError::ReadLength { .. })));

        let mut p = AssemblyParams::default();
        p.anchor_length = 0;
        assert!(matches!(p.validate(), Err(ParamsError::ZeroParameter(_))));
    }

    #[test]
    fn params_round_trip_through_json() {
        let p = AssemblyParams::default();
        let text = serde_json::to_string(&p).unwrap();
        let back: AssemblyParams = serde_json::from_str(&text).unwrap();
        assert_eq!(p, back);
    }
}
