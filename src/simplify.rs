//! Post-collapse re-merging of unbranched neighbour path nodes
//!
//! Collapse deletes branches, so two adjacent path nodes may afterwards
//! satisfy the non-branching condition again. This stage concatenates a
//! node with its unique, exactly-shifted, same-flag successor whenever the
//! successor's only predecessor is that node and the merged chain stays
//! within the maximum path length. The successor's tracker contributions
//! are rewritten onto the surviving node with the offset shift.
//!
//! Processing runs in window order; a processed node can never become a
//! merge target again, so it is yielded immediately.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::export::PipelineMetrics;
use crate::kmer::KmerCodec;
use crate::path_node::{path_key, KmerPathNode, PathKey, PathWindow};
use crate::tracker::EvidenceTracker;
use crate::{PipelineError, Pos};

/// Lazy re-merging stage over a sorted [`KmerPathNode`] stream.
pub struct SimplifyStage<I> {
    source: I,
    codec: KmerCodec,
    max_path_length: usize,
    max_support_width: Pos,
    window: PathWindow,
    unprocessed: BTreeSet<PathKey>,
    frontier: Pos,
    hold: Pos,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    done: bool,
    failed: bool,
}

impl<I> SimplifyStage<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    pub fn new(
        source: I,
        codec: KmerCodec,
        max_path_length: usize,
        max_support_width: Pos,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        Self {
            source,
            codec,
            max_path_length,
            max_support_width,
            window: PathWindow::new(),
            unprocessed: BTreeSet::new(),
            frontier: Pos::MIN,
            hold: max_path_length as Pos + max_support_width + 2,
            tracker,
            metrics,
            done: false,
            failed: false,
        }
    }

    fn insert(&mut self, node: KmerPathNode) {
        if node.start > self.frontier {
            self.frontier = node.start;
        }
        self.unprocessed.insert(path_key(&node));
        self.window.insert(node);
    }

    #[inline]
    fn ripe(&self, node: &KmerPathNode) -> bool {
        self.done || self.frontier > node.last_end() + self.hold
    }

    /// Extend the front node with unique successors while the merge
    /// conditions hold. Returns the settled node, or `None` when more
    /// input is needed before its tail is decided.
    fn settle_front(&mut self) -> Option<KmerPathNode> {
        let key = *self.unprocessed.first()?;
        loop {
            let node = self.window.get(key.2).expect("unprocessed in window");
            if !self.ripe(node) {
                return None;
            }
            let succs = self.window.successors(&self.codec, node);
            if succs.len() != 1 {
                break;
            }
            let next = self.window.get(succs[0]).expect("successor in window");
            let exact = next.start == node.start + node.len() as Pos
                && next.end == node.end + node.len() as Pos;
            if !exact
                || next.is_reference != node.is_reference
                || node.len() + next.len() > self.max_path_length
                || node.width() > self.max_support_width
                || self.window.predecessors(&self.codec, next) != vec![node.id]
            {
                break;
            }
            if !self.ripe(next) {
                return None;
            }
            // merge: take both out, concatenate, re-insert under the same key
            let next = self.window.remove(succs[0]).expect("successor in window");
            self.unprocessed.remove(&path_key(&next));
            let mut node = self.window.remove(key.2).expect("front in window");
            let shift = node.len() as u32;
            node.kmers.extend(next.kmers.iter().copied());
            node.weights.extend(next.weights.iter().copied());
            self.tracker.borrow_mut().rewrite_node(next.id, node.id, shift);
            self.metrics.borrow_mut().nodes_simplified += 1;
            self.window.insert(node);
        }
        self.unprocessed.remove(&key);
        self.window.remove(key.2)
    }
}

impl<I> Iterator for SimplifyStage<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    type Item = Result<KmerPathNode, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if !self.unprocessed.is_empty() {
                if let Some(node) = self.settle_front() {
                    return Some(Ok(node));
                }
            }
            if self.done {
                if self.unprocessed.is_empty() {
                    debug_assert!(self.window.is_empty());
                    return None;
                }
                continue;
            }
            match self.source.next() {
                None => self.done = true,
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(Err(e));
                }
                Some(Ok(node)) => self.insert(node),
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
    use crate::evidence::EvidenceId;

    const K: usize = 5;

    fn codec() -> KmerCodec {
        KmerCodec::new(K).unwrap()
    }

    fn make_node(
        tracker: &Rc<RefCell<EvidenceTracker>>,
        seq: &[u8],
        start: Pos,
        weight: u32,
        is_reference: bool,
    ) -> KmerPathNode {
        let c = codec();
        let kmers: Vec<u64> =
            (0..=seq.len() - K).map(|i| c.encode(&seq[i..i + K]).unwrap()).collect();
        let id = tracker.borrow_mut().new_node();
        for o in 0..kmers.len() {
            tracker.borrow_mut().register(EvidenceId(99), id, o as u32, weight);
        }
        KmerPathNode {
            id,
            kmers: kmers.clone(),
            start,
            end: start,
            weights: vec![weight; kmers.len()],
            is_reference,
        }
    }

    fn run(
        tracker: &Rc<RefCell<EvidenceTracker>>,
        nodes: Vec<KmerPathNode>,
        max_path_length: usize,
    ) -> Vec<KmerPathNode> {
        let mut nodes = nodes;
        nodes.sort_by_key(path_key);
        let src: Vec<Result<KmerPathNode, PipelineError>> = nodes.into_iter().map(Ok).collect();
        SimplifyStage::new(
            src.into_iter(),
            codec(),
            max_path_length,
            8,
            Rc::clone(tracker),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        )
        .map(Result::unwrap)
        .collect()
    }

    #[test]
    fn adjacent_unbranched_nodes_merge() {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let a = make_node(&tracker, b"ACGTAC", 10, 3, false); // 2 kmers
        let b = make_node(&tracker, b"GTACG", 12, 5, false); // 1 kmer, exact shift
        let a_id = a.id;
        let out = run(&tracker, vec![a, b], 64);
        assert_eq!(out.len(), 1);
        let merged = &out[0];
        assert_eq!(merged.id, a_id);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.bases(&codec()), b"ACGTACG".to_vec());
        assert_eq!(merged.weights, vec![3, 3, 5]);
        tracker.borrow().audit_node(a_id, &merged.weights).unwrap();
    }

    #[test]
    fn chain_of_three_merges_into_one() {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let a = make_node(&tracker, b"ACGTA", 10, 1, false);
        let b = make_node(&tracker, b"CGTAC", 11, 2, false);
        let c = make_node(&tracker, b"GTACG", 12, 3, false);
        let out = run(&tracker, vec![a, b, c], 64);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].weights, vec![1, 2, 3]);
    }

    #[test]
    fn max_path_length_caps_merging() {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let a = make_node(&tracker, b"ACGTA", 10, 1, false);
        let b = make_node(&tracker, b"CGTAC", 11, 2, false);
        let c = make_node(&tracker, b"GTACG", 12, 3, false);
        let out = run(&tracker, vec![a, b, c], 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[1].len(), 1);
    }

    #[test]
    fn flag_mismatch_blocks_merging() {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let a = make_node(&tracker, b"ACGTA", 10, 1, true);
        let b = make_node(&tracker, b"CGTAC", 11, 2, false);
        let out = run(&tracker, vec![a, b], 64);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn branching_blocks_merging() {
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let a = make_node(&tracker, b"ACGTA", 10, 1, false);
        let b = make_node(&tracker, b"CGTAC", 11, 2, false);
        let c = make_node(&tracker, b"CGTAT", 11, 2, false); // second successor of a
        let out = run(&tracker, vec![a, b, c], 64);
        assert_eq!(out.len(), 3);
    }
}
