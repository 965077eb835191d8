//! Unbranched path node construction over the positional kmer graph
//!
//! Aggregated kmer nodes chain greedily: a node extends the current tail
//! only when its interval is the tail's shifted by exactly one base, the
//! reference flags match, the tail has a single successor candidate in the
//! window and that candidate a single predecessor. Chains stop at branches,
//! flag changes, the maximum path length, or end of stream.
//!
//! Graph edges use the positional overlap rule: `b` follows `a` when
//! `b.kmer` is a de Bruijn successor of `a.kmer` and `b`'s start interval
//! intersects `a`'s shifted by one. Consumed aggregates stay in the window
//! as tombstones until the frontier passes them, so branch detection keeps
//! seeing edges into already-emitted chains.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::aggregate::KmerNode;
use crate::export::PipelineMetrics;
use crate::kmer::KmerCodec;
use crate::tracker::{EvidenceTracker, NodeId};
use crate::{PipelineError, Pos};

/// An unbranched chain of kmers with a common, per-step-shifted start
/// interval. Kmer `i` occupies start positions `[start + i, end + i]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KmerPathNode {
    pub id: NodeId,
    pub kmers: Vec<u64>,
    /// Lowest start position of the first kmer.
    pub start: Pos,
    /// Highest start position of the first kmer.
    pub end: Pos,
    /// Per-kmer aggregate weights, parallel to `kmers`.
    pub weights: Vec<u32>,
    pub is_reference: bool,
}

impl KmerPathNode {
    /// Number of kmers in the chain.
    #[inline]
    pub fn len(&self) -> usize {
        self.kmers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.kmers.is_empty()
    }

    #[inline]
    pub fn first_kmer(&self) -> u64 {
        self.kmers[0]
    }

    #[inline]
    pub fn last_kmer(&self) -> u64 {
        *self.kmers.last().expect("path nodes are never empty")
    }

    /// Lowest start position of the last kmer.
    #[inline]
    pub fn last_start(&self) -> Pos {
        self.start + (self.len() as Pos - 1)
    }

    /// Highest start position of the last kmer.
    #[inline]
    pub fn last_end(&self) -> Pos {
        self.end + (self.len() as Pos - 1)
    }

    /// Width of the start interval in positions.
    #[inline]
    pub fn width(&self) -> Pos {
        self.end - self.start + 1
    }

    /// Summed weight over all kmers.
    pub fn total_weight(&self) -> u64 {
        self.weights.iter().map(|&w| w as u64).sum()
    }

    /// Reconstruct the base sequence spelled by the kmer chain.
    pub fn bases(&self, codec: &KmerCodec) -> Vec<u8> {
        let mut out = codec.decode(self.first_kmer());
        out.reserve(self.len() - 1);
        for &kmer in &self.kmers[1..] {
            out.push(codec.last_base(kmer));
        }
        out
    }
}

/// Window key for path nodes: `(first start, first kmer, id)`. Unique and
/// totally ordered, so every window iteration is deterministic.
pub(crate) type PathKey = (Pos, u64, NodeId);

#[inline]
pub(crate) fn path_key(node: &KmerPathNode) -> PathKey {
    (node.start, node.first_kmer(), node.id)
}

/// A windowed, positionally indexed collection of path nodes shared by the
/// collapse, simplify and assembly stages. Neighbour sets are derived from
/// the indexes on demand; nothing stores edges across rewrites.
///
/// Scans are exact over the same-kmer entries of the window rather than
/// bounded by a nominal interval width: touching-support chains can make an
/// aggregate interval arbitrarily wide, and a width-bounded scan would
/// silently miss such a neighbour.
#[derive(Debug, Default)]
pub(crate) struct PathWindow {
    nodes: BTreeMap<PathKey, KmerPathNode>,
    by_first: BTreeSet<(u64, Pos, NodeId)>,
    by_last: BTreeSet<(u64, Pos, NodeId)>,
    by_id: BTreeMap<NodeId, PathKey>,
}

impl PathWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: KmerPathNode) {
        let key = path_key(&node);
        self.by_first.insert((node.first_kmer(), node.start, node.id));
        self.by_last.insert((node.last_kmer(), node.last_start(), node.id));
        self.by_id.insert(node.id, key);
        let prev = self.nodes.insert(key, node);
        debug_assert!(prev.is_none(), "duplicate path node key");
    }

    pub fn remove(&mut self, id: NodeId) -> Option<KmerPathNode> {
        let key = self.by_id.remove(&id)?;
        let node = self.nodes.remove(&key)?;
        self.by_first.remove(&(node.first_kmer(), node.start, node.id));
        self.by_last.remove(&(node.last_kmer(), node.last_start(), node.id));
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&KmerPathNode> {
        self.nodes.get(self.by_id.get(&id)?)
    }

    /// Mutable access for weight updates only; callers must not change the
    /// kmer chain or interval through this (indexes would go stale).
    pub fn get_weights_mut(&mut self, id: NodeId) -> Option<&mut Vec<u32>> {
        let key = self.by_id.get(&id)?;
        self.nodes.get_mut(key).map(|n| &mut n.weights)
    }

    pub fn first_key(&self) -> Option<PathKey> {
        self.nodes.first_key_value().map(|(k, _)| *k)
    }

    pub fn keys(&self) -> impl Iterator<Item = PathKey> + '_ {
        self.nodes.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KmerPathNode> {
        self.nodes.values()
    }

    /// Ids of nodes reachable from `node` by one de Bruijn step with
    /// positional overlap, in `(kmer, start, id)` order. Excludes `node`.
    pub fn successors(&self, codec: &KmerCodec, node: &KmerPathNode) -> Vec<NodeId> {
        let lo = node.last_start() + 1;
        let hi = node.last_end() + 1;
        let mut out = Vec::new();
        for next in codec.successors(node.last_kmer()) {
            let scan_lo = (next, Pos::MIN, NodeId(0));
            let scan_hi = (next, hi, NodeId(u32::MAX));
            for &(_, _, id) in self.by_first.range(scan_lo..=scan_hi) {
                if id == node.id {
                    continue;
                }
                let cand = self.get(id).expect("indexed node present");
                if cand.end >= lo && cand.start <= hi {
                    out.push(id);
                }
            }
        }
        out
    }

    /// Ids of nodes from which `node` is reachable by one step, in
    /// `(kmer, last start, id)` order. Excludes `node`.
    pub fn predecessors(&self, codec: &KmerCodec, node: &KmerPathNode) -> Vec<NodeId> {
        let mut out = Vec::new();
        for prev in codec.predecessors(node.first_kmer()) {
            let scan_lo = (prev, Pos::MIN, NodeId(0));
            let scan_hi = (prev, node.end - 1, NodeId(u32::MAX));
            for &(_, _, id) in self.by_last.range(scan_lo..=scan_hi) {
                if id == node.id {
                    continue;
                }
                let cand = self.get(id).expect("indexed node present");
                if cand.last_end() + 1 >= node.start && cand.last_start() + 1 <= node.end {
                    out.push(id);
                }
            }
        }
        out
    }
}

type Key = (Pos, u64, u8); // (start, kmer, flag)

#[derive(Debug)]
struct Slot {
    node: KmerNode,
    consumed: bool,
}

#[inline]
fn flag_ord(is_reference: bool) -> u8 {
    if is_reference {
        0
    } else {
        1
    }
}

/// Lazy stage chaining [`KmerNode`]s into [`KmerPathNode`]s.
pub struct PathNodeStage<I> {
    source: I,
    codec: KmerCodec,
    max_path_length: usize,
    slots: BTreeMap<Key, Slot>,
    /// Secondary index for neighbour scans, keyed kmer-first.
    by_kmer: BTreeSet<(u64, Pos, u8)>,
    /// Keys of unconsumed aggregates, in emission order.
    live: BTreeSet<Key>,
    /// Widest interval seen so far; bounds the tombstone purge.
    max_seen_width: Pos,
    frontier: Pos,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    done: bool,
    failed: bool,
}

impl<I> PathNodeStage<I>
where
    I: Iterator<Item = Result<KmerNode, PipelineError>>,
{
    pub fn new(
        source: I,
        codec: KmerCodec,
        max_path_length: usize,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        debug_assert!(max_path_length >= 1);
        Self {
            source,
            codec,
            max_path_length,
            slots: BTreeMap::new(),
            by_kmer: BTreeSet::new(),
            live: BTreeSet::new(),
            max_seen_width: 1,
            frontier: Pos::MIN,
            tracker,
            metrics,
            done: false,
            failed: false,
        }
    }

    #[inline]
    fn ripe(&self, node: &KmerNode) -> bool {
        self.done || self.frontier > node.end + 1
    }

    /// Keys of aggregates reachable from `node` by one de Bruijn step with
    /// positional overlap, either flag, ascending key order. The scan is
    /// exact over same-kmer entries; interval widths are not assumed
    /// bounded (touching-support chains can widen them arbitrarily).
    fn successor_keys(&self, node: &KmerNode) -> Vec<Key> {
        let mut out = Vec::new();
        let lo = node.start + 1;
        let hi = node.end + 1;
        for next in self.codec.successors(node.kmer) {
            let scan_lo = (next, Pos::MIN, 0u8);
            let scan_hi = (next, hi, u8::MAX);
            for &(kmer, start, flag) in self.by_kmer.range(scan_lo..=scan_hi) {
                let key = (start, kmer, flag);
                let slot = &self.slots[&key];
                if slot.node.end >= lo && slot.node.start <= hi {
                    out.push(key);
                }
            }
        }
        out
    }

    /// Keys of aggregates from which `node` is reachable, either flag.
    fn predecessor_keys(&self, node: &KmerNode) -> Vec<Key> {
        let mut out = Vec::new();
        for prev in self.codec.predecessors(node.kmer) {
            let scan_lo = (prev, Pos::MIN, 0u8);
            let scan_hi = (prev, node.end - 1, u8::MAX);
            for &(kmer, start, flag) in self.by_kmer.range(scan_lo..=scan_hi) {
                let key = (start, kmer, flag);
                let slot = &self.slots[&key];
                if slot.node.end + 1 >= node.start && slot.node.start + 1 <= node.end {
                    out.push(key);
                }
            }
        }
        out
    }

    fn insert(&mut self, node: KmerNode) {
        let key = (node.start, node.kmer, flag_ord(node.is_reference));
        if node.start > self.frontier {
            self.frontier = node.start;
        }
        let width = node.end - node.start + 1;
        if width > self.max_seen_width {
            self.max_seen_width = width;
        }
        self.by_kmer.insert((node.kmer, node.start, key.2));
        self.live.insert(key);
        let prev = self.slots.insert(key, Slot { node, consumed: false });
        debug_assert!(prev.is_none(), "duplicate aggregate key");
    }

    /// Try to build the chain rooted at the smallest live aggregate.
    /// `None` means more input must arrive before the chain is decided.
    fn build_chain(&mut self) -> Option<Vec<Key>> {
        let head_key = *self.live.first()?;
        let head = &self.slots[&head_key].node;
        if !self.ripe(head) {
            return None;
        }
        let mut chain = vec![head_key];
        let mut cur_key = head_key;
        loop {
            if chain.len() == self.max_path_length {
                break;
            }
            let cur = &self.slots[&cur_key].node;
            let succs = self.successor_keys(cur);
            if succs.len() != 1 {
                break;
            }
            let next_key = succs[0];
            let next_slot = &self.slots[&next_key];
            if next_slot.consumed {
                break;
            }
            let next = &next_slot.node;
            let cur = &self.slots[&cur_key].node;
            let exact_shift = next.start == cur.start + 1 && next.end == cur.end + 1;
            if !exact_shift || next.is_reference != cur.is_reference {
                break;
            }
            if self.predecessor_keys(next).len() != 1 {
                break;
            }
            if !self.ripe(next) {
                // The successor's own extension is still undecided.
                return None;
            }
            chain.push(next_key);
            cur_key = next_key;
        }
        Some(chain)
    }

    fn emit(&mut self, chain: Vec<Key>) -> KmerPathNode {
        let path_id = self.tracker.borrow_mut().new_node();
        let mut kmers = Vec::with_capacity(chain.len());
        let mut weights = Vec::with_capacity(chain.len());
        let (start, end, is_reference) = {
            let head = &self.slots[&chain[0]].node;
            (head.start, head.end, head.is_reference)
        };
        for (i, key) in chain.iter().enumerate() {
            let slot = self.slots.get_mut(key).expect("chain member present");
            debug_assert!(!slot.consumed);
            slot.consumed = true;
            self.live.remove(key);
            kmers.push(slot.node.kmer);
            weights.push(slot.node.weight);
            let agg_id = slot.node.id;
            self.tracker.borrow_mut().rewrite_node(agg_id, path_id, i as u32);
        }
        self.purge();
        self.metrics.borrow_mut().path_nodes += 1;
        KmerPathNode { id: path_id, kmers, start, end, weights, is_reference }
    }

    /// Drop consumed tombstones no future neighbour scan can reach.
    fn purge(&mut self) {
        let floor = match self.live.first() {
            Some(&(start, _, _)) => start,
            None => self.frontier,
        };
        let horizon = floor.saturating_sub(self.max_seen_width + 2);
        let stale: Vec<Key> = self
            .slots
            .range(..(horizon, 0u64, 0u8))
            .filter(|(_, s)| s.consumed)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            self.slots.remove(&key);
            self.by_kmer.remove(&(key.1, key.0, key.2));
        }
    }
}

impl<I> Iterator for PathNodeStage<I>
where
    I: Iterator<Item = Result<KmerNode, PipelineError>>,
{
    type Item = Result<KmerPathNode, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if self.done || !self.live.is_empty() {
                if let Some(chain) = self.build_chain() {
                    return Some(Ok(self.emit(chain)));
                }
                if self.done {
                    debug_assert!(self.live.is_empty(), "ripe chains must drain at end");
                    return None;
                }
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

    const K: usize = 5;

    fn codec() -> KmerCodec {
        KmerCodec::new(K).unwrap()
    }

    /// Aggregates for every kmer of `seq`, offset-0 starting at `start`.
    fn aggs_for(seq: &[u8], start: Pos, weight: u32, is_reference: bool, id0: u32) -> Vec<KmerNode> {
        let c = codec();
        (0..=seq.len() - K)
            .map(|i| KmerNode {
                id: NodeId(id0 + i as u32),
                kmer: c.encode(&seq[i..i + K]).unwrap(),
                start: start + i as Pos,
                end: start + i as Pos,
                weight,
                is_reference,
            })
            .collect()
    }

    fn run(nodes: Vec<KmerNode>, max_path_length: usize) -> Vec<KmerPathNode> {
        let mut sorted = nodes;
        sorted.sort_by_key(|n| (n.start, n.kmer, flag_ord(n.is_reference)));
        let src: Vec<Result<KmerNode, PipelineError>> = sorted.into_iter().map(Ok).collect();
        PathNodeStage::new(
            src.into_iter(),
            codec(),
            max_path_length,
            Rc::new(RefCell::new(EvidenceTracker::new())),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        )
        .map(Result::unwrap)
        .collect()
    }

    #[test]
    fn linear_chain_becomes_one_path_node() {
        let out = run(aggs_for(b"ACGTACGTT", 100, 3, false, 0), 64);
        assert_eq!(out.len(), 1);
        let p = &out[0];
        assert_eq!(p.len(), 5);
        assert_eq!(p.start, 100);
        assert_eq!(p.bases(&codec()), b"ACGTACGTT".to_vec());
        assert_eq!(p.total_weight(), 15);
    }

    #[test]
    fn max_path_length_splits_chains() {
        let out = run(aggs_for(b"ACGTACGTT", 100, 3, false, 0), 2);
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(KmerPathNode::len).sum::<usize>(), 5);
        assert!(out.iter().all(|p| p.len() <= 2));
        // contiguous coverage in order
        assert_eq!(out[0].start, 100);
        assert_eq!(out[1].start, out[0].last_start() + 1);
    }

    #[test]
    fn branch_terminates_chain() {
        // shared prefix AACCG, then diverging bases A and T
        let mut nodes = aggs_for(b"AACCGA", 100, 3, false, 0);
        nodes.extend(aggs_for(b"AACCGT", 100, 2, false, 10).into_iter().skip(1));
        let out = run(nodes, 64);
        // prefix node stops before the branch; two single-kmer branch nodes
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].bases(&codec()), b"AACCG".to_vec());
        assert_eq!(out[0].len(), 1);
    }

    #[test]
    fn reference_flag_change_terminates_chain() {
        let seq = b"ACGTACGTT";
        let mut nodes = aggs_for(&seq[..K], 100, 3, true, 0); // first kmer reference
        nodes.extend(aggs_for(seq, 100, 3, false, 10).into_iter().skip(1));
        let out = run(nodes, 64);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_reference);
        assert_eq!(out[0].len(), 1);
        assert!(!out[1].is_reference);
        assert_eq!(out[1].len(), 4);
    }

    #[test]
    fn inexact_interval_shift_terminates_chain() {
        let c = codec();
        let a = KmerNode {
            id: NodeId(0),
            kmer: c.encode(b"ACGTA").unwrap(),
            start: 100,
            end: 100,
            weight: 1,
            is_reference: false,
        };
        // de Bruijn successor but with a widened interval
        let b = KmerNode {
            id: NodeId(1),
            kmer: c.encode(b"CGTAC").unwrap(),
            start: 101,
            end: 103,
            weight: 1,
            is_reference: false,
        };
        let out = run(vec![a, b], 64);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn emitted_paths_never_contain_interior_branches() {
        // bubble: AACCG then A/T variants then common GACGT suffix
        let mut nodes = aggs_for(b"AACCGAACGT", 100, 3, false, 0);
        let extra: Vec<KmerNode> = aggs_for(b"AACCGTACGT", 100, 2, false, 20)
            .into_iter()
            .filter(|n| !nodes.iter().any(|m| (m.start, m.kmer) == (n.start, n.kmer)))
            .collect();
        nodes.extend(extra);
        let out = run(nodes, 64);
        for p in &out {
            assert!(p.len() <= 64);
        }
        // total kmers conserved
        let total: usize = out.iter().map(KmerPathNode::len).sum();
        assert_eq!(total, 6 + 5);
    }

    #[test]
    fn tracker_relation_lifts_to_path_nodes() {
        use crate::evidence::EvidenceId;
        let tracker = Rc::new(RefCell::new(EvidenceTracker::new()));
        let mut nodes = Vec::new();
        {
            let mut t = tracker.borrow_mut();
            for n in aggs_for(b"ACGTACGTT", 100, 3, false, 0) {
                let id = t.new_node();
                t.register(EvidenceId(7), id, 0, 3);
                nodes.push(KmerNode { id, ..n });
            }
        }
        let src: Vec<Result<KmerNode, PipelineError>> = nodes.into_iter().map(Ok).collect();
        let out: Vec<KmerPathNode> = PathNodeStage::new(
            src.into_iter(),
            codec(),
            64,
            Rc::clone(&tracker),
            Rc::new(RefCell::new(PipelineMetrics::default())),
        )
        .map(Result::unwrap)
        .collect();
        assert_eq!(out.len(), 1);
        let p = &out[0];
        tracker.borrow().audit_node(p.id, &p.weights).unwrap();
        assert_eq!(
            tracker.borrow().evidence_of(p.id).collect::<Vec<_>>(),
            vec![EvidenceId(7)]
        );
    }
}
