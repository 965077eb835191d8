//! Error correction: sibling path collapse within a Hamming budget
//!
//! Sequencing errors show up as low-weight paths shadowing a high-weight
//! sibling: a bubble (diverge, reconverge at the same positions), a leaf
//! (diverge and dead-end), or in the general case an arbitrary
//! divergent-then-convergent pair. Collapse folds the lighter path into the
//! heavier one when their base strings differ by at most the configured
//! mismatch budget: per-kmer weights add at aligned offsets, the tracker
//! reattributes the losing path's evidence, and the losing nodes are
//! deleted.
//!
//! Nodes are processed in window order once the frontier has passed their
//! whole collapse neighbourhood, and yielded once nothing behind the
//! processing cursor can still merge into them, so downstream stages see a
//! sorted, settled stream. The full mode's pairwise search is worst-case
//! exponential on repetitive sequence; the stage itself is oblivious to
//! that, the parameter validator surfaces the warning.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use crate::export::PipelineMetrics;
use crate::kmer::KmerCodec;
use crate::path_node::{path_key, KmerPathNode, PathKey, PathWindow};
use crate::tracker::{EvidenceTracker, NodeId};
use crate::{PipelineError, Pos};

/// Which sibling-path shapes the stage folds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollapseMode {
    /// Error correction disabled; the stage is a pass-through.
    Off,
    /// Terminal leaves and simple bubbles only. Linear per window.
    LeafBubble,
    /// Arbitrary divergent-then-convergent pairs up to the configured
    /// path-collapse length.
    Full,
}

impl CollapseMode {
    /// Derive the mode from the configuration record.
    pub fn from_params(max_base_mismatch: usize, bubbles_only: bool) -> Self {
        match (max_base_mismatch, bubbles_only) {
            (0, _) => Self::Off,
            (_, true) => Self::LeafBubble,
            (_, false) => Self::Full,
        }
    }
}

/// Count of differing bases between two equal-length sequences.
fn hamming(a: &[u8], b: &[u8]) -> usize {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).filter(|(x, y)| x != y).count()
}

/// Winner-ordering key: heavier wins, then reference, then the smaller
/// kmer-sum, then the older id.
fn merge_rank(node: &KmerPathNode) -> (u64, bool, std::cmp::Reverse<u128>, std::cmp::Reverse<u32>) {
    let kmer_sum: u128 = node.kmers.iter().map(|&k| k as u128).sum();
    (
        node.total_weight(),
        node.is_reference,
        std::cmp::Reverse(kmer_sum),
        std::cmp::Reverse(node.id.0),
    )
}

/// Lazy error-correction stage over a sorted [`KmerPathNode`] stream.
pub struct CollapseStage<I> {
    source: I,
    codec: KmerCodec,
    mode: CollapseMode,
    budget: usize,
    max_collapse_len: usize,
    window: PathWindow,
    unprocessed: BTreeSet<PathKey>,
    frontier: Pos,
    /// Forward margin a node's neighbourhood must clear before processing.
    hold: Pos,
    /// Backward reach of any later processing step; yielded nodes are past it.
    back: Pos,
    tracker: Rc<RefCell<EvidenceTracker>>,
    metrics: Rc<RefCell<PipelineMetrics>>,
    done: bool,
    failed: bool,
}

impl<I> CollapseStage<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: I,
        codec: KmerCodec,
        mode: CollapseMode,
        budget: usize,
        max_collapse_len: usize,
        max_path_length: usize,
        max_support_width: Pos,
        tracker: Rc<RefCell<EvidenceTracker>>,
        metrics: Rc<RefCell<PipelineMetrics>>,
    ) -> Self {
        let reach = max_path_length.max(max_collapse_len) as Pos;
        Self {
            source,
            codec,
            mode,
            budget,
            max_collapse_len,
            window: PathWindow::new(),
            unprocessed: BTreeSet::new(),
            frontier: Pos::MIN,
            hold: 2 * reach + max_support_width + 2,
            back: max_path_length as Pos + max_support_width + 2,
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

    /// Yield the front node once it is processed and out of reach of every
    /// later processing step.
    fn pop_yieldable(&mut self) -> Option<KmerPathNode> {
        let first = self.window.first_key()?;
        if self.unprocessed.contains(&first) {
            return None;
        }
        let bound = match self.unprocessed.first() {
            Some(&(start, _, _)) => start,
            None => self.frontier,
        };
        if self.done || first.0 + self.back < bound {
            return self.window.remove(first.2);
        }
        None
    }

    fn node(&self, id: NodeId) -> KmerPathNode {
        self.window.get(id).expect("window member").clone()
    }

    /// Fold `loser` into `winner`, aligned so loser offset `o` lands at
    /// winner offset `o + delta`.
    fn merge_single(&mut self, loser: NodeId, winner: NodeId, delta: usize) {
        let lost = self.window.remove(loser).expect("loser in window");
        self.unprocessed.remove(&path_key(&lost));
        {
            let weights = self.window.get_weights_mut(winner).expect("winner in window");
            for (o, w) in lost.weights.iter().enumerate() {
                weights[o + delta] += w;
            }
        }
        self.tracker
            .borrow_mut()
            .remap(loser, |o| (winner, o + delta as u32));
        self.metrics.borrow_mut().nodes_collapsed += 1;
    }

    /// Simple bubbles among the successors of `rid`: same single
    /// predecessor and successor, identical span, bases within budget.
    fn try_bubble(&mut self, rid: NodeId) -> bool {
        let r = self.node(rid);
        let succs = self.window.successors(&self.codec, &r);
        for i in 0..succs.len() {
            for j in i + 1..succs.len() {
                let x = self.node(succs[i]);
                let y = self.node(succs[j]);
                if x.len() != y.len() || x.start != y.start || x.end != y.end {
                    continue;
                }
                if self.window.predecessors(&self.codec, &x) != vec![rid]
                    || self.window.predecessors(&self.codec, &y) != vec![rid]
                {
                    continue;
                }
                let sx = self.window.successors(&self.codec, &x);
                let sy = self.window.successors(&self.codec, &y);
                if sx.len() != 1 || sx != sy {
                    continue;
                }
                if hamming(&x.bases(&self.codec), &y.bases(&self.codec)) > self.budget {
                    continue;
                }
                let (loser, winner) = if merge_rank(&x) < merge_rank(&y) {
                    (x.id, y.id)
                } else {
                    (y.id, x.id)
                };
                self.merge_single(loser, winner, 0);
                return true;
            }
        }
        false
    }

    /// Terminal leaves: a dead-end successor of `rid` folded into a longer
    /// sibling (head-aligned), or a root predecessor folded into a longer
    /// sibling (tail-aligned).
    fn try_leaf(&mut self, rid: NodeId) -> bool {
        let r = self.node(rid);
        let k = self.codec.k();

        let succs = self.window.successors(&self.codec, &r);
        for &x_id in &succs {
            let x = self.node(x_id);
            if !self.window.successors(&self.codec, &x).is_empty() {
                continue;
            }
            for &y_id in &succs {
                if y_id == x_id {
                    continue;
                }
                let y = self.node(y_id);
                if y.len() < x.len() || x.start != y.start || x.end != y.end {
                    continue;
                }
                if merge_rank(&x) >= merge_rank(&y) {
                    continue;
                }
                let xb = x.bases(&self.codec);
                let yb = y.bases(&self.codec);
                if hamming(&xb, &yb[..x.len() + k - 1]) > self.budget {
                    continue;
                }
                self.merge_single(x_id, y_id, 0);
                return true;
            }
        }

        let preds = self.window.predecessors(&self.codec, &r);
        for &x_id in &preds {
            let x = self.node(x_id);
            if !self.window.predecessors(&self.codec, &x).is_empty() {
                continue;
            }
            for &y_id in &preds {
                if y_id == x_id {
                    continue;
                }
                let y = self.node(y_id);
                if y.len() < x.len()
                    || x.last_start() != y.last_start()
                    || x.last_end() != y.last_end()
                {
                    continue;
                }
                if merge_rank(&x) >= merge_rank(&y) {
                    continue;
                }
                let delta = y.len() - x.len();
                let xb = x.bases(&self.codec);
                let yb = y.bases(&self.codec);
                if hamming(&xb, &yb[delta..]) > self.budget {
                    continue;
                }
                self.merge_single(x_id, y_id, delta);
                return true;
            }
        }
        false
    }

    /// Extensions of `chain` by one exactly-adjacent node, search order.
    fn extensions(&self, chain: &[NodeId]) -> Vec<NodeId> {
        let tail = self.node(chain[chain.len() - 1]);
        self.window
            .successors(&self.codec, &tail)
            .into_iter()
            .filter(|&id| {
                let n = self.node(id);
                n.start == tail.last_start() + 1 && n.end == tail.last_end() + 1
            })
            .collect()
    }

    /// Depth-bounded search for an equal-length reconvergent pair extending
    /// `a` and `b`. Chains stay exactly adjacent and node-disjoint.
    fn search_convergent(
        &self,
        a: Vec<NodeId>,
        a_len: usize,
        b: Vec<NodeId>,
        b_len: usize,
    ) -> Option<(Vec<NodeId>, Vec<NodeId>)> {
        if a_len > self.max_collapse_len || b_len > self.max_collapse_len {
            return None;
        }
        if a_len == b_len {
            let sa = self.extensions(&a);
            let sb = self.extensions(&b);
            if sa.iter().any(|id| sb.contains(id)) {
                let ab = self.chain_bases(&a);
                let bb = self.chain_bases(&b);
                if ab.len() == bb.len() && hamming(&ab, &bb) <= self.budget {
                    return Some((a, b));
                }
                return None;
            }
            for &na in &sa {
                for &nb in &sb {
                    if na == nb
                        || a.contains(&na)
                        || b.contains(&na)
                        || a.contains(&nb)
                        || b.contains(&nb)
                    {
                        continue;
                    }
                    let (la, lb) = (self.node(na).len(), self.node(nb).len());
                    let mut a2 = a.clone();
                    a2.push(na);
                    let mut b2 = b.clone();
                    b2.push(nb);
                    if let Some(found) =
                        self.search_convergent(a2, a_len + la, b2, b_len + lb)
                    {
                        return Some(found);
                    }
                }
            }
            None
        } else if a_len < b_len {
            for &na in &self.extensions(&a) {
                if a.contains(&na) || b.contains(&na) {
                    continue;
                }
                let la = self.node(na).len();
                let mut a2 = a.clone();
                a2.push(na);
                if let Some(found) = self.search_convergent(a2, a_len + la, b.clone(), b_len)
                {
                    return Some(found);
                }
            }
            None
        } else {
            for &nb in &self.extensions(&b) {
                if a.contains(&nb) || b.contains(&nb) {
                    continue;
                }
                let lb = self.node(nb).len();
                let mut b2 = b.clone();
                b2.push(nb);
                if let Some(found) = self.search_convergent(a.clone(), a_len, b2, b_len + lb)
                {
                    return Some(found);
                }
            }
            None
        }
    }

    fn chain_bases(&self, chain: &[NodeId]) -> Vec<u8> {
        let mut out = self.node(chain[0]).bases(&self.codec);
        for &id in &chain[1..] {
            let n = self.node(id);
            for &kmer in &n.kmers {
                out.push(self.codec.last_base(kmer));
            }
        }
        out
    }

    /// General divergent-then-convergent pairs starting at `rid`.
    fn try_full(&mut self, rid: NodeId) -> bool {
        let r = self.node(rid);
        let succs = self.window.successors(&self.codec, &r);
        if succs.len() < 2 {
            return false;
        }
        for i in 0..succs.len() {
            for j in i + 1..succs.len() {
                let a0 = self.node(succs[i]);
                let b0 = self.node(succs[j]);
                if a0.start != b0.start || a0.end != b0.end {
                    continue;
                }
                let (a0_len, b0_len) = (a0.len(), b0.len());
                if let Some((a, b)) = self.search_convergent(
                    vec![succs[i]],
                    a0_len,
                    vec![succs[j]],
                    b0_len,
                ) {
                    self.merge_chains(a, b);
                    return true;
                }
            }
        }
        false
    }

    /// Fold the lighter chain into the heavier, kmer-aligned end to end.
    fn merge_chains(&mut self, a: Vec<NodeId>, b: Vec<NodeId>) {
        let rank = |chain: &[NodeId]| {
            let weight: u64 = chain.iter().map(|&id| self.node(id).total_weight()).sum();
            let ref_kmers: usize = chain
                .iter()
                .map(|&id| {
                    let n = self.node(id);
                    if n.is_reference {
                        n.len()
                    } else {
                        0
                    }
                })
                .sum();
            let kmer_sum: u128 = chain
                .iter()
                .flat_map(|&id| self.node(id).kmers.clone())
                .map(|k| k as u128)
                .sum();
            (weight, ref_kmers, std::cmp::Reverse(kmer_sum))
        };
        let (winner, loser) = if rank(&a) >= rank(&b) { (a, b) } else { (b, a) };

        // Prefix map of the winner chain for global-offset lookups.
        let mut map: Vec<(NodeId, usize)> = Vec::with_capacity(winner.len());
        let mut acc = 0usize;
        for &id in &winner {
            map.push((id, acc));
            acc += self.node(id).len();
        }
        let locate = move |global: usize| {
            let idx = map.partition_point(|&(_, base)| base <= global) - 1;
            (map[idx].0, global - map[idx].1)
        };

        let mut global = 0usize;
        for lid in loser {
            let lost = self.window.remove(lid).expect("loser in window");
            self.unprocessed.remove(&path_key(&lost));
            for (o, &w) in lost.weights.iter().enumerate() {
                let (wid, local) = locate(global + o);
                let weights = self.window.get_weights_mut(wid).expect("winner in window");
                weights[local] += w;
            }
            self.tracker.borrow_mut().remap(lid, |o| {
                let (wid, local) = locate(global + o as usize);
                (wid, local as u32)
            });
            global += lost.len();
            self.metrics.borrow_mut().nodes_collapsed += 1;
        }
    }

    /// Run every collapse pattern rooted at `key` to a fixed point.
    fn process(&mut self, key: PathKey) {
        self.unprocessed.remove(&key);
        if self.mode == CollapseMode::Off {
            return;
        }
        let rid = key.2;
        while self.window.get(rid).is_some() {
            let merged = self.try_bubble(rid)
                || self.try_leaf(rid)
                || (self.mode == CollapseMode::Full && self.try_full(rid));
            if !merged {
                break;
            }
        }
    }
}

impl<I> Iterator for CollapseStage<I>
where
    I: Iterator<Item = Result<KmerPathNode, PipelineError>>,
{
    type Item = Result<KmerPathNode, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(node) = self.pop_yieldable() {
                return Some(Ok(node));
            }
            if let Some(&key) = self.unprocessed.first() {
                let node = self.window.get(key.2).expect("unprocessed in window");
                if self.done || self.frontier > node.last_end() + self.hold {
                    self.process(key);
                    continue;
                }
            } else if self.done {
                debug_assert!(self.window.is_empty());
                return None;
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
