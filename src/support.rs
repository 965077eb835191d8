//! Support node generation: evidence fan-out into weighted kmer occurrences
//!
//! For each evidence, one [`SupportNode`] is emitted per read offset whose
//! kmer window is clean: ambiguous bases and (for pair anchors) windows
//! touching the configured ignore region at either read end are skipped.
//! The node inherits the evidence's positional interval shifted by its
//! offset, and a weight of `Σ max(1, qual − ε)` over the window's bases
//! with `ε` = [`BASE_QUAL_EPSILON`].
//!
//! Emission is globally ordered by `(start, kmer, evidence)`. A bounded
//! heap holds each evidence's fan-out until the input frontier has passed
//! a node's start, at which point no future evidence can sort before it.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;

use crate::evidence::{Evidence, EvidenceId, EvidenceKind};
use crate::export::PipelineMetrics;
use crate::kmer::KmerCodec;
use crate::tracker::{EvidenceAnchor, EvidenceTracker};
use crate::{PipelineError, Pos};

/// Quality rescale offset `ε` in the per-base support weight
/// `max(1, qual − ε)`. Base qualities reach this pipeline unrescaled, so
/// the offset is zero; the `max(1, ..)` floor keeps every clean kmer
/// contributing support either way.
pub const BASE_QUAL_EPSILON: u8 = 0;

/// One weighted, positionally bounded kmer occurrence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportNode {
    pub kmer: u64,
    /// Lowest possible genomic start position of this kmer.
    pub start: Pos,
    /// Highest possible genomic start position of this kmer.
    pub end: Pos,
    pub weight: u32,
    pub is_reference: bool,
    pub evidence: EvidenceId,
}

/// Heap ordering for pending nodes: `(start, kmer, evidence, flag)`.
#[derive(PartialEq, Eq)]
struct Pending(SupportNode);

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a = &self.0;
        let b = &other.0;
        (a.start, a.kmer, a.evidence, a.is_reference, a.end, a.weight).cmp(&(
            b.start,
            b.kmer,
            b.evidence,
            b.is_reference,
            b.end,
            b.weight,
        ))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Lazy stage turning a position-sorted evidence stream into a
/// position-sorted [`SupportNode`] stream.
pub struct SupportNodeStage<I> {
    source: I,
    codec: KmerCodec,
    include_pair_anchors: bool,
    ignore_end_bases: usize,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    pending: BinaryHeap<Reverse<Pending>>,
    /// Start of the most recently ingested evidence.
    frontier: Option<Pos>,
    done: bool,
    failed: bool,
}

impl<I> SupportNodeStage<I>
where
    I: Iterator<Item = Result<Evidence, PipelineError>>,
{
    pub fn new(
        source: I,
        codec: KmerCodec,
        include_pair_anchors: bool,
        ignore_end_bases: usize,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        Self {
            source,
            codec,
            include_pair_anchors,
            ignore_end_bases,
            tracker,
            metrics,
            pending: BinaryHeap::new(),
            frontier: None,
            done: false,
            failed: false,
        }
    }

    fn ingest(&mut self, ev: Evidence) -> Result<(), PipelineError> {
        ev.validate()?;
        if let Some(prev) = self.frontier {
            if ev.start < prev {
                return Err(PipelineError::MalformedInput(format!(
                    "evidence {} at position {} after position {} (input not sorted)",
                    ev.id.0, ev.start, prev
                )));
            }
        }
        self.frontier = Some(ev.start);
        self.metrics.borrow_mut().evidence_in += 1;

        if ev.kind == EvidenceKind::PairAnchor && !self.include_pair_anchors {
            self.metrics.borrow_mut().evidence_filtered += 1;
            return Ok(());
        }

        let k = self.codec.k();
        let len = ev.read_len();
        let mut produced = 0usize;
        if len >= k {
            for i in 0..=len - k {
                if ev.skips_pair_anchor_kmer(i, k, self.ignore_end_bases) {
                    continue;
                }
                let Some(kmer) = self.codec.encode(&ev.read_bases[i..i + k]) else {
                    continue;
                };
                let weight: u32 = ev.base_quals[i..i + k]
                    .iter()
                    .map(|&q| u32::max(1, q.saturating_sub(BASE_QUAL_EPSILON) as u32))
                    .sum();
                self.pending.push(Reverse(Pending(SupportNode {
                    kmer,
                    start: ev.start + i as Pos,
                    end: ev.end + i as Pos,
                    weight,
                    is_reference: ev.is_reference_kmer(i, k),
                    evidence: ev.id,
                })));
                produced += 1;
            }
        }
        if produced > 0 {
            self.tracker.borrow_mut().register_evidence(
                ev.id,
                EvidenceAnchor { start: ev.start, read_len: len, anchor_len: ev.anchor_len },
            );
        }
        Ok(())
    }
}

impl<I> Iterator for SupportNodeStage<I>
where
    I: Iterator<Item = Result<Evidence, PipelineError>>,
{
    type Item = Result<SupportNode, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(Reverse(front)) = self.pending.peek() {
                // Future evidence starts at or after the frontier, so any
                // pending node strictly behind it can no longer be preceded.
                let safe =
                    self.done || self.frontier.is_some_and(|f| front.0.start < f);
                if safe {
                    let node = self.pending.pop().map(|Reverse(p)| p.0)?;
                    self.metrics.borrow_mut().support_nodes += 1;
                    return Some(Ok(node));
                }
            } else if self.done {
                return None;
            }
            match self.source.next() {
                None => self.done = true,
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Some(Ok(ev)) => {
                    if let Err(e) = self.ingest(ev) {
                        self.failed = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::BreakendDirection;

    fn stage(
        evs: Vec<Evidence>,
    ) -> SupportNodeStage<std::vec::IntoIter<Result<Evidence, PipelineError>>> {
        let src: Vec<Result<Evidence, PipelineError>> = evs.into_iter().map(Ok).collect();
        SupportNodeStage::new(
            src.into_iter(),
            KmerCodec::new(5).unwrap(),
            true,
            0,
            Rc::new(RefCell::new(EvidenceTracker::new())),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        )
    }

    fn softclip(id: u64, start: Pos, bases: &[u8], anchor_len: usize) -> Evidence {
        Evidence {
            id: EvidenceId(id),
            reference_index: 0,
            start,
            end: start,
            direction: BreakendDirection::Forward,
            kind: EvidenceKind::SoftClip,
            read_bases: bases.to_vec(),
            base_quals: vec![20; bases.len()],
            anchor_len,
        }
    }

    #[test]
    fn one_node_per_offset_with_shifted_interval() {
        let out: Vec<_> = stage(vec![softclip(1, 100, b"ACGTACGTA", 5)])
            .map(Result::unwrap)
            .collect();
        assert_eq!(out.len(), 5); // 9 - 5 + 1
        for (i, n) in out.iter().enumerate() {
            assert_eq!(n.start, 100 + i as Pos);
            assert_eq!(n.end, n.start);
            assert_eq!(n.weight, 5 * 20);
        }
        // only offset 0 fits inside the 5-base anchor
        assert!(out[0].is_reference);
        assert!(out[1..].iter().all(|n| !n.is_reference));
    }

    #[test]
    fn ambiguous_bases_skip_offsets() {
        let out: Vec<_> = stage(vec![softclip(1, 10, b"ACGTNACGTA", 0)])
            .map(Result::unwrap)
            .collect();
        // every window covering the N (offsets 0..=4) is dropped
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, 15);
    }

    #[test]
    fn pair_anchor_ignore_end_bases() {
        let mut ev = softclip(1, 10, b"ACGTACGTAC", 0);
        ev.kind = EvidenceKind::PairAnchor;
        ev.end = ev.start + 3; // fragment-size uncertainty
        let src: Vec<Result<Evidence, PipelineError>> = vec![Ok(ev)];
        let out: Vec<_> = SupportNodeStage::new(
            src.into_iter(),
            KmerCodec::new(5).unwrap(),
            true,
            2,
            Rc::new(RefCell::new(EvidenceTracker::new())),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        )
        .map(Result::unwrap)
        .collect();
        // len 10, k 5, ignore 2: offsets 2 and 3 survive
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].start, 12);
        assert_eq!(out[0].end, 15);
    }

    #[test]
    fn emission_is_sorted_across_evidence() {
        let out: Vec<_> = stage(vec![
            softclip(1, 100, b"ACGTACGTA", 0),
            softclip(2, 102, b"ACGTACGTA", 0),
        ])
        .map(Result::unwrap)
        .collect();
        let mut sorted = out.clone();
        sorted.sort_by_key(|n| (n.start, n.kmer, n.evidence));
        assert_eq!(out, sorted);
    }

    #[test]
    fn unsorted_input_is_fatal() {
        let mut s = stage(vec![
            softclip(1, 100, b"ACGTACGTA", 0),
            softclip(2, 99, b"ACGTACGTA", 0),
        ]);
        let err = s
            .by_ref()
            .find_map(|r| r.err())
            .expect("sort violation must surface");
        assert!(matches!(err, PipelineError::MalformedInput(_)));
        // the stage is dead afterwards
        assert!(s.next().is_none());
    }
}
