//! Windowed assembly of best-scoring non-reference contigs
//!
//! The assembler keeps a sliding window of settled path nodes. Each call to
//! `next()` pulls upstream until the best-scoring chain of non-reference
//! nodes is safely inside the stable region, attaches a reference anchor on
//! the direction-appropriate end when one is reachable, reconstructs bases
//! and per-base qualities, then releases every supporting evidence: the
//! released weight is subtracted kmer-by-kmer from every node in the
//! window, zero-weight nodes are deleted, and nodes behind the eviction
//! horizon are dropped. Repeats until the upstream is exhausted and no
//! non-reference node remains.
//!
//! Scores are summed weights of non-reference nodes; all tie-breaks are
//! deterministic (larger weight, then smaller kmer, then window order), so
//! reruns produce byte-identical contig streams.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::evidence::{BreakendDirection, EvidenceId};
use crate::export::PipelineMetrics;
use crate::kmer::KmerCodec;
use crate::path_node::{path_key, KmerPathNode, PathWindow};
use crate::tracker::{EvidenceTracker, NodeId};
use crate::{PipelineError, Pos};

/// One assembled breakend contig.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyRecord {
    pub reference_index: usize,
    /// Genomic position of the anchored base closest to the breakend, or
    /// `None` for an unanchored contig.
    pub anchor_position: Option<Pos>,
    pub direction: BreakendDirection,
    pub base_calls: Vec<u8>,
    pub base_quals: Vec<u8>,
    /// Leading (forward) or trailing (backward) bases that align to the
    /// reference.
    pub anchored_base_count: usize,
    /// Ids of the evidence consumed by this contig, ascending.
    pub supporting_evidence: Vec<EvidenceId>,
}

struct Candidate {
    chain: Vec<NodeId>,
    max_end: Pos,
}

/// The terminal stage: windowed best-contig caller.
pub struct ContigAssembler<I> {
    source: I,
    codec: KmerCodec,
    direction: BreakendDirection,
    reference_index: usize,
    /// Reference anchor length to attach, in kmers.
    anchor_kmers: usize,
    max_evidence_width: Pos,
    window: PathWindow,
    frontier: Pos,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    done: bool,
    failed: bool,
}

impl<I> ContigAssembler<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: I,
        codec: KmerCodec,
        direction: BreakendDirection,
        reference_index: usize,
        anchor_kmers: usize,
        max_evidence_width: Pos,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        Self {
            source,
            codec,
            direction,
            reference_index,
            anchor_kmers,
            max_evidence_width,
            window: PathWindow::new(),
            frontier: Pos::MIN,
            tracker,
            metrics,
            done: false,
            failed: false,
        }
    }

    /// Current input frontier, for export rows.
    pub fn frontier(&self) -> Pos {
        self.frontier
    }

    /// Stability margin: evidence reach plus the anchor assembly region.
    #[inline]
    fn margin(&self) -> Pos {
        self.max_evidence_width + (self.anchor_kmers + self.codec.k()) as Pos
    }

    /// Best-scoring chain of non-reference nodes, by forward dynamic
    /// programming in window order.
    fn best_candidate(&self) -> Option<Candidate> {
        let mut dp: BTreeMap<NodeId, (u64, Option<NodeId>)> = BTreeMap::new();
        let mut best: Option<(u64, NodeId)> = None;

        for key in self.window.keys().collect::<Vec<_>>() {
            let node = self.window.get(key.2).expect("window key");
            if node.is_reference {
                continue;
            }
            let mut best_pred: Option<(u64, u64, NodeId)> = None; // (score, kmer, id)
            for pid in self.window.predecessors(&self.codec, node) {
                let pred = self.window.get(pid).expect("window member");
                if pred.is_reference || path_key(pred) >= key {
                    continue;
                }
                let Some(&(pscore, _)) = dp.get(&pid) else {
                    continue;
                };
                let cand = (pscore, pred.first_kmer(), pid);
                let better = match best_pred {
                    None => true,
                    Some((s, k, id)) => {
                        (cand.0, Reverse(cand.1), Reverse(cand.2 .0))
                            > (s, Reverse(k), Reverse(id.0))
                    }
                };
                if better {
                    best_pred = Some(cand);
                }
            }
            let score =
                node.total_weight() + best_pred.map_or(0, |(s, _, _)| s);
            dp.insert(node.id, (score, best_pred.map(|(_, _, id)| id)));
            let better = match best {
                None => true,
                Some((s, _)) => score > s,
            };
            if better {
                best = Some((score, node.id));
            }
        }

        let (_, end_id) = best?;
        let mut chain = vec![end_id];
        let mut cur = end_id;
        while let Some(&(_, Some(pred))) = dp.get(&cur) {
            chain.push(pred);
            cur = pred;
        }
        chain.reverse();
        let max_end = chain
            .iter()
            .map(|&id| self.window.get(id).expect("chain member").last_end())
            .max()
            .expect("non-empty chain");
        Some(Candidate { chain, max_end })
    }

    /// Walk reference neighbours from the anchor-side end of `chain`,
    /// collecting up to `anchor_kmers` kmers. Forward breakends anchor at
    /// the head, backward at the tail.
    fn attach_anchor(&self, chain: &[NodeId]) -> Vec<NodeId> {
        let mut full: Vec<NodeId> = chain.to_vec();
        let mut acc = 0usize;
        match self.direction {
            BreakendDirection::Forward => {
                let mut cur = full[0];
                while acc < self.anchor_kmers {
                    let node = self.window.get(cur).expect("chain member");
                    let pick = self
                        .window
                        .predecessors(&self.codec, node)
                        .into_iter()
                        .filter(|&id| {
                            !full.contains(&id)
                                && self.window.get(id).expect("window member").is_reference
                        })
                        .max_by_key(|&id| {
                            let n = self.window.get(id).expect("window member");
                            (n.total_weight(), Reverse(n.first_kmer()), Reverse(id.0))
                        });
                    let Some(pid) = pick else {
                        break;
                    };
                    acc += self.window.get(pid).expect("window member").len();
                    full.insert(0, pid);
                    cur = pid;
                }
            }
            BreakendDirection::Backward => {
                let mut cur = *full.last().expect("non-empty chain");
                while acc < self.anchor_kmers {
                    let node = self.window.get(cur).expect("chain member");
                    let pick = self
                        .window
                        .successors(&self.codec, node)
                        .into_iter()
                        .filter(|&id| {
                            !full.contains(&id)
                                && self.window.get(id).expect("window member").is_reference
                        })
                        .max_by_key(|&id| {
                            let n = self.window.get(id).expect("window member");
                            (n.total_weight(), Reverse(n.first_kmer()), Reverse(id.0))
                        });
                    let Some(sid) = pick else {
                        break;
                    };
                    acc += self.window.get(sid).expect("window member").len();
                    full.push(sid);
                    cur = sid;
                }
            }
        }
        full
    }

    /// Anchor position and anchored base count for the full chain. Falls
    /// back to the supporting evidence's own anchor geometry when the chain
    /// carries no reference kmers (anchors shorter than `k`).
    fn anchor_info(
        &self,
        full: &[NodeId],
        c0: Pos,
        c_end: Pos,
        total_bases: usize,
        support: &BTreeSet<EvidenceId>,
    ) -> (Option<Pos>, usize) {
        let k = self.codec.k();
        let ref_kmers = |ids: &mut dyn Iterator<Item = &NodeId>| {
            let mut r = 0usize;
            for &id in ids {
                let n = self.window.get(id).expect("chain member");
                if !n.is_reference {
                    break;
                }
                r += n.len();
            }
            r
        };
        match self.direction {
            BreakendDirection::Forward => {
                let r = ref_kmers(&mut full.iter());
                if r > 0 {
                    let anchored = (r + k - 1).min(total_bases);
                    return (Some(c0 + anchored as Pos - 1), anchored);
                }
                let tracker = self.tracker.borrow();
                let mut anchored = 0usize;
                for &ev in support {
                    let Some(a) = tracker.anchor_of(ev) else {
                        continue;
                    };
                    if a.anchor_len > 0 && a.start <= c0 {
                        let n = (a.start + a.anchor_len as Pos - c0).max(0) as usize;
                        anchored = anchored.max(n.min(total_bases));
                    }
                }
                if anchored > 0 {
                    (Some(c0 + anchored as Pos - 1), anchored)
                } else {
                    (None, 0)
                }
            }
            BreakendDirection::Backward => {
                let r = ref_kmers(&mut full.iter().rev());
                if r > 0 {
                    let anchored = (r + k - 1).min(total_bases);
                    return (Some(c_end - anchored as Pos + 1), anchored);
                }
                let tracker = self.tracker.borrow();
                let mut anchored = 0usize;
                for &ev in support {
                    let Some(a) = tracker.anchor_of(ev) else {
                        continue;
                    };
                    let a_start = a.start + (a.read_len - a.anchor_len) as Pos;
                    let a_end = a.start + a.read_len as Pos - 1;
                    if a.anchor_len > 0 && a_end >= c_end {
                        let n = (c_end - a_start + 1).max(0) as usize;
                        anchored = anchored.max(n.min(total_bases));
                    }
                }
                if anchored > 0 {
                    (Some(c_end - anchored as Pos + 1), anchored)
                } else {
                    (None, 0)
                }
            }
        }
    }

    fn emit(&mut self, chain: Vec<NodeId>) -> AssemblyRecord {
        let full = self.attach_anchor(&chain);
        let k = self.codec.k();

        let mut kmers: Vec<u64> = Vec::new();
        let mut weights: Vec<u32> = Vec::new();
        for &id in &full {
            let n = self.window.get(id).expect("chain member");
            kmers.extend_from_slice(&n.kmers);
            weights.extend_from_slice(&n.weights);
        }
        let m = kmers.len();
        let total_bases = m + k - 1;

        let mut bases = self.codec.decode(kmers[0]);
        for &kmer in &kmers[1..] {
            bases.push(self.codec.last_base(kmer));
        }

        // per-kmer weight to a byte quality, padded k-1 on the anchor side
        let qual = |w: u32| u8::try_from((w as usize / k).min(u8::MAX as usize)).unwrap_or(u8::MAX);
        let mut quals = Vec::with_capacity(total_bases);
        match self.direction {
            BreakendDirection::Forward => {
                quals.extend(std::iter::repeat(qual(weights[0])).take(k - 1));
                quals.extend(weights.iter().map(|&w| qual(w)));
            }
            BreakendDirection::Backward => {
                quals.extend(weights.iter().map(|&w| qual(w)));
                quals.extend(std::iter::repeat(qual(weights[m - 1])).take(k - 1));
            }
        }

        let mut support: BTreeSet<EvidenceId> = BTreeSet::new();
        {
            let tracker = self.tracker.borrow();
            for &id in &full {
                if !self.window.get(id).expect("chain member").is_reference {
                    support.extend(tracker.evidence_of(id));
                }
            }
        }

        let c0 = self.window.get(full[0]).expect("chain member").start;
        let c_end = c0 + total_bases as Pos - 1;
        let (anchor_position, anchored_base_count) =
            self.anchor_info(&full, c0, c_end, total_bases, &support);

        let record = AssemblyRecord {
            reference_index: self.reference_index,
            anchor_position,
            direction: self.direction,
            base_calls: bases,
            base_quals: quals,
            anchored_base_count,
            supporting_evidence: support.iter().copied().collect(),
        };

        if support.is_empty() {
            // Nothing to release would mean no progress; drop the chain's
            // non-reference nodes directly.
            for &id in &full {
                if self.window.get(id).is_some_and(|n| !n.is_reference) {
                    self.window.remove(id);
                    self.tracker.borrow_mut().release_node(id);
                }
            }
        } else {
            self.release(&support);
        }
        self.metrics.borrow_mut().contigs_emitted += 1;
        record
    }

    /// Remove each supporting evidence from the tracker and subtract its
    /// contributions from every node in the window; delete drained nodes.
    fn release(&mut self, support: &BTreeSet<EvidenceId>) {
        for &ev in support {
            let lost = self.tracker.borrow_mut().remove(ev);
            self.metrics.borrow_mut().evidence_released += 1;
            for (nid, contribs) in lost {
                let Some(weights) = self.window.get_weights_mut(nid) else {
                    continue;
                };
                for (offset, w) in contribs {
                    let slot = &mut weights[offset as usize];
                    *slot = slot.saturating_sub(w);
                }
                if weights.iter().all(|&w| w == 0) {
                    self.window.remove(nid);
                    self.tracker.borrow_mut().release_node(nid);
                }
            }
        }
    }

    /// Drop nodes whose start interval is strictly behind the eviction
    /// horizon, releasing their tracker state.
    fn evict(&mut self) {
        let horizon = self.frontier - self.max_evidence_width;
        let stale: Vec<NodeId> = self
            .window
            .iter()
            .filter(|n| n.end < horizon)
            .map(|n| n.id)
            .collect();
        for id in stale {
            self.window.remove(id);
            self.tracker.borrow_mut().release_node(id);
        }
    }
}

impl<I> Iterator for ContigAssembler<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    type Item = Result<AssemblyRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(c) = self.best_candidate() {
                if self.done || c.max_end + self.margin() <= self.frontier {
                    let record = self.emit(c.chain);
                    if !self.done {
                        self.evict();
                    }
                    return Some(Ok(record));
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
                Some(Ok(node)) => {
                    if node.start > self.frontier {
                        self.frontier = node.start;
                    }
                    self.window.insert(node);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
