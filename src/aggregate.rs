//! Aggregation of coincident support into maximal kmer nodes
//!
//! Open aggregates are keyed by `(kmer, reference flag)`; an incoming
//! support node with the same key whose interval overlaps or touches the
//! open one extends it (weights add, intervals union). Anything else opens
//! a new aggregate. An aggregate is final once the input frontier strictly
//! exceeds its `end + 1`: no future support can reach back to extend it.
//!
//! Reference and non-reference support never share an aggregate. Emission
//! is ordered by `(start, kmer)` with reference winning a full tie, and
//! every emitted node is maximal under the union rule. Contributions are
//! handed to the tracker at emission, under the node's freshly allocated id.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::rc::Rc;

use crate::evidence::EvidenceId;
use crate::export::PipelineMetrics;
use crate::support::SupportNode;
use crate::tracker::{EvidenceTracker, NodeId};
use crate::{PipelineError, Pos};

/// A maximal aggregate of coincident kmer support.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KmerNode {
    pub id: NodeId,
    pub kmer: u64,
    /// Lowest start position of any contributing support.
    pub start: Pos,
    /// Highest start position of any contributing support.
    pub end: Pos,
    pub weight: u32,
    pub is_reference: bool,
}

/// Reference sorts ahead of non-reference on full position/kmer ties.
#[inline]
fn flag_ord(is_reference: bool) -> u8 {
    if is_reference {
        0
    } else {
        1
    }
}

#[derive(Debug)]
struct OpenAggregate {
    start: Pos,
    end: Pos,
    weight: u32,
    contribs: Vec<(EvidenceId, u32)>,
}

/// Lazy stage merging a sorted [`SupportNode`] stream into [`KmerNode`]s.
pub struct AggregateStage<I> {
    source: I,
    /// At most one open aggregate per key; a non-touching newcomer closes
    /// the old one first.
    open: BTreeMap<(u64, u8), OpenAggregate>,
    open_order: BTreeSet<(Pos, u64, u8)>,
    /// Lazy-deletion expiry queue over `(end, kmer, flag)`.
    expiry: BinaryHeap<Reverse<(Pos, u64, u8)>>,
    /// Closed aggregates awaiting ordered emission.
    ready: BTreeMap<(Pos, u64, u8), OpenAggregate>,
    frontier: Pos,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    done: bool,
    failed: bool,
}

impl<I> AggregateStage<I>
where
    I: Iterator<Item = Result<SupportNode, PipelineError>>,
{
    pub fn new(
        source: I,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        Self {
            source,
            open: BTreeMap::new(),
            open_order: BTreeSet::new(),
            expiry: BinaryHeap::new(),
            ready: BTreeMap::new(),
            frontier: Pos::MIN,
            tracker,
            metrics,
            done: false,
            failed: false,
        }
    }

    fn close(&mut self, key: (u64, u8), agg: OpenAggregate) {
        self.open_order.remove(&(agg.start, key.0, key.1));
        let prev = self.ready.insert((agg.start, key.0, key.1), agg);
        debug_assert!(prev.is_none(), "same-key aggregates with one start must have merged");
    }

    /// Close every open aggregate the frontier has passed.
    fn expire(&mut self) {
        while let Some(&Reverse((end, kmer, flag))) = self.expiry.peek() {
            if end + 1 >= self.frontier {
                break;
            }
            self.expiry.pop();
            // Stale entries (the aggregate was extended) are skipped; the
            // extension pushed its own entry.
            if self.open.get(&(kmer, flag)).is_some_and(|a| a.end == end) {
                let agg = self.open.remove(&(kmer, flag)).expect("checked above");
                self.close((kmer, flag), agg);
            }
        }
    }

    fn insert(&mut self, n: SupportNode) {
        debug_assert!(n.start >= self.frontier || self.frontier == Pos::MIN);
        let key = (n.kmer, flag_ord(n.is_reference));
        let extends = self.open.get(&key).is_some_and(|a| n.start <= a.end + 1);
        if extends {
            let agg = self.open.get_mut(&key).expect("checked above");
            agg.end = agg.end.max(n.end);
            agg.weight += n.weight;
            agg.contribs.push((n.evidence, n.weight));
            self.expiry.push(Reverse((agg.end, key.0, key.1)));
        } else {
            if let Some(old) = self.open.remove(&key) {
                self.close(key, old);
            }
            self.open_order.insert((n.start, key.0, key.1));
            self.expiry.push(Reverse((n.end, key.0, key.1)));
            self.open.insert(
                key,
                OpenAggregate {
                    start: n.start,
                    end: n.end,
                    weight: n.weight,
                    contribs: vec![(n.evidence, n.weight)],
                },
            );
        }
    }

    /// Emit the smallest closed aggregate, provided no open aggregate could
    /// still sort ahead of it.
    fn pop_ready(&mut self) -> Option<KmerNode> {
        let min_ready = *self.ready.first_key_value()?.0;
        if let Some(&min_open) = self.open_order.first() {
            if min_open < min_ready {
                return None;
            }
        }
        let ((start, kmer, flag), agg) = self.ready.pop_first()?;
        let id = self.tracker.borrow_mut().new_node();
        {
            let mut tracker = self.tracker.borrow_mut();
            for (ev, weight) in &agg.contribs {
                tracker.register(*ev, id, 0, *weight);
            }
        }
        self.metrics.borrow_mut().aggregate_nodes += 1;
        Some(KmerNode {
            id,
            kmer,
            start,
            end: agg.end,
            weight: agg.weight,
            is_reference: flag == 0,
        })
    }
}

impl<I> Iterator for AggregateStage<I>
where
    I: Iterator<Item = Result<SupportNode, PipelineError>>,
{
    type Item = Result<KmerNode, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(node) = self.pop_ready() {
                return Some(Ok(node));
            }
            if self.done {
                if self.open.is_empty() {
                    return None;
                }
                let drained: Vec<_> = std::mem::take(&mut self.open).into_iter().collect();
                for (key, agg) in drained {
                    self.close(key, agg);
                }
                continue;
            }
            match self.source.next() {
                None => self.done = true,
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Some(Ok(n)) => {
                    if n.start > self.frontier {
                        self.frontier = n.start;
                        self.expire();
                    }
                    self.insert(n);
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
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sn(kmer: u64, start: Pos, end: Pos, weight: u32, is_reference: bool, ev: u64) -> SupportNode {
        SupportNode { kmer, start, end, weight, is_reference, evidence: EvidenceId(ev) }
    }

    fn run(nodes: Vec<SupportNode>) -> (Vec<KmerNode>, Rc<RefCell<EvidenceTracker>>) {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let src: Vec<Result<SupportNode, PipelineError>> = nodes.into_iter().map(Ok).collect();
        let stage = AggregateStage::new(
            src.into_iter(),
            Rc::clone(&tracker),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        );
        (stage.map(Result::unwrap).collect(), tracker)
    }

    #[test]
    fn overlapping_support_merges() {
        let (out, tracker) = run(vec![
            sn(7, 10, 12, 5, false, 1),
            sn(7, 11, 14, 3, false, 2),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].start, out[0].end, out[0].weight), (10, 14, 8));
        assert_eq!(tracker.borrow().node_weight(out[0].id), 8);
    }

    #[test]
    fn touching_intervals_merge_disjoint_do_not() {
        let (out, _) = run(vec![
            sn(7, 10, 10, 5, false, 1),
            sn(7, 11, 11, 3, false, 2), // touches 10..=10
            sn(7, 20, 20, 2, false, 3), // disjoint
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].start, out[0].end, out[0].weight), (10, 11, 8));
        assert_eq!((out[1].start, out[1].end, out[1].weight), (20, 20, 2));
    }

    #[test]
    fn reference_flag_separates_aggregates() {
        let (out, _) = run(vec![
            sn(7, 10, 10, 5, true, 1),
            sn(7, 10, 10, 3, false, 2),
        ]);
        assert_eq!(out.len(), 2);
        // reference sorts first on the full tie
        assert!(out[0].is_reference);
        assert!(!out[1].is_reference);
    }

    #[test]
    fn emission_ordered_by_start_then_kmer() {
        let (out, _) = run(vec![
            sn(9, 10, 10, 1, false, 1),
            sn(3, 10, 10, 1, false, 2),
            sn(5, 12, 12, 1, false, 3),
        ]);
        let keys: Vec<_> = out.iter().map(|n| (n.start, n.kmer)).collect();
        assert_eq!(keys, vec![(10, 3), (10, 9), (12, 5)]);
    }

    #[test]
    fn randomized_output_is_maximal_and_conserves_weight() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut input = Vec::new();
        let mut pos = 0i64;
        for ev in 0..300u64 {
            pos += rng.gen_range(0..3);
            let width = rng.gen_range(0..4);
            input.push(sn(
                rng.gen_range(0..6),
                pos,
                pos + width,
                rng.gen_range(1..20),
                rng.gen_bool(0.3),
                ev,
            ));
        }
        let in_weight: u64 = input.iter().map(|n| n.weight as u64).sum();
        let (out, _) = run(input);
        let out_weight: u64 = out.iter().map(|n| n.weight as u64).sum();
        assert_eq!(in_weight, out_weight);

        // no two nodes share (kmer, flag) with overlapping-or-touching intervals
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                if a.kmer == b.kmer && a.is_reference == b.is_reference {
                    assert!(
                        a.end + 1 < b.start || b.end + 1 < a.start,
                        "non-maximal aggregates: {a:?} vs {b:?}"
                    );
                }
            }
        }
        // sorted emission
        let keys: Vec<_> = out
            .iter()
            .map(|n| (n.start, n.kmer, flag_ord(n.is_reference)))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
