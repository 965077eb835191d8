//! Evidence tracker: the id-based evidence ↔ node relation
//!
//! The pipeline's graph is cyclic (evidence ↔ node, node ↔ node), so no
//! stage holds object references across stage boundaries. Instead the
//! tracker allocates stable [`NodeId`]s and stores, per `(evidence, node)`
//! pair, the exact `(kmer offset, weight)` contributions the evidence made
//! to that node. Stages rewrite ids as aggregates fold into path nodes and
//! path nodes merge; the contig assembler uses the reverse relation to
//! attribute support to emitted contigs and to subtract released evidence
//! kmer-by-kmer.
//!
//! Destruction is explicit id invalidation. There is no reference counting.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use crate::evidence::EvidenceId;
use crate::Pos;

/// Stable identity of a kmer node or kmer path node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Access the underlying id.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Anchor geometry of one evidence, kept for contig anchor attribution
/// after the evidence record itself has been dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EvidenceAnchor {
    /// Lowest genomic start position of the offset-0 kmer.
    pub start: Pos,
    /// Read length in bases.
    pub read_len: usize,
    /// Anchored base count (prefix for forward, suffix for backward).
    pub anchor_len: usize,
}

type Contribution = (u32, u32); // (kmer offset within node, weight)

/// Bidirectional evidence ↔ node relation with per-kmer weight detail.
#[derive(Debug, Default)]
pub struct EvidenceTracker {
    next_id: u32,
    by_evidence: BTreeMap<EvidenceId, BTreeMap<NodeId, Vec<Contribution>>>,
    by_node: BTreeMap<NodeId, BTreeSet<EvidenceId>>,
    meta: BTreeMap<EvidenceId, EvidenceAnchor>,
}

impl EvidenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh node id. Ids are never reused within a pipeline.
    #[inline]
    pub fn new_node(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Record anchor geometry for an evidence entering the pipeline.
    pub fn register_evidence(&mut self, ev: EvidenceId, anchor: EvidenceAnchor) {
        self.meta.insert(ev, anchor);
    }

    /// Anchor geometry of a still-live evidence.
    pub fn anchor_of(&self, ev: EvidenceId) -> Option<EvidenceAnchor> {
        self.meta.get(&ev).copied()
    }

    /// Record that `ev` contributed `weight` to `node` at kmer `offset`.
    pub fn register(&mut self, ev: EvidenceId, node: NodeId, offset: u32, weight: u32) {
        debug_assert!(weight > 0, "zero-weight contribution");
        self.by_evidence
            .entry(ev)
            .or_default()
            .entry(node)
            .or_default()
            .push((offset, weight));
        self.by_node.entry(node).or_default().insert(ev);
    }

    /// Fold `old` into `new`, shifting every contribution offset by
    /// `offset_shift`. Used when aggregates concatenate into a path node
    /// and when path nodes merge end-to-end.
    pub fn rewrite_node(&mut self, old: NodeId, new: NodeId, offset_shift: u32) {
        let Some(evs) = self.by_node.remove(&old) else {
            return;
        };
        for ev in evs {
            let Some(nodes) = self.by_evidence.get_mut(&ev) else {
                continue;
            };
            if let Some(contribs) = nodes.remove(&old) {
                let slot = nodes.entry(new).or_default();
                slot.extend(contribs.into_iter().map(|(o, w)| (o + offset_shift, w)));
            }
            self.by_node.entry(new).or_default().insert(ev);
        }
    }

    /// Fold `src` into `dst` without an offset shift, summing the evidence
    /// sets. Collapse uses this for aligned same-shape merges.
    pub fn merge_node(&mut self, src: NodeId, dst: NodeId) {
        self.rewrite_node(src, dst, 0);
    }

    /// General re-attribution: every contribution of `src` is moved to the
    /// node and offset chosen by `map(offset)`. Collapse uses this when a
    /// losing path's kmers land across several winning nodes.
    pub fn remap(&mut self, src: NodeId, mut map: impl FnMut(u32) -> (NodeId, u32)) {
        let Some(evs) = self.by_node.remove(&src) else {
            return;
        };
        for ev in evs {
            let Some(nodes) = self.by_evidence.get_mut(&ev) else {
                continue;
            };
            let Some(contribs) = nodes.remove(&src) else {
                continue;
            };
            for (offset, weight) in contribs {
                let (dst, dst_offset) = map(offset);
                nodes.entry(dst).or_default().push((dst_offset, weight));
                self.by_node.entry(dst).or_default().insert(ev);
            }
        }
    }

    /// Evidence ids supporting `node`, in id order.
    pub fn evidence_of(&self, node: NodeId) -> impl Iterator<Item = EvidenceId> + '_ {
        self.by_node.get(&node).into_iter().flatten().copied()
    }

    /// Remove `ev` from the relation entirely. Returns, per node and in
    /// node-id order, the contributions that node just lost.
    pub fn remove(&mut self, ev: EvidenceId) -> Vec<(NodeId, Vec<Contribution>)> {
        self.meta.remove(&ev);
        let Some(nodes) = self.by_evidence.remove(&ev) else {
            return Vec::new();
        };
        let mut lost = Vec::with_capacity(nodes.len());
        for (node, contribs) in nodes {
            if let Some(set) = self.by_node.get_mut(&node) {
                set.remove(&ev);
                if set.is_empty() {
                    self.by_node.remove(&node);
                }
            }
            lost.push((node, contribs));
        }
        lost
    }

    /// Drop a node from the relation (window eviction or zero-weight
    /// deletion). Evidence left with no nodes disappears with its anchor
    /// geometry.
    pub fn release_node(&mut self, node: NodeId) {
        let Some(evs) = self.by_node.remove(&node) else {
            return;
        };
        for ev in evs {
            if let Some(nodes) = self.by_evidence.get_mut(&ev) {
                nodes.remove(&node);
                if nodes.is_empty() {
                    self.by_evidence.remove(&ev);
                    self.meta.remove(&ev);
                }
            }
        }
    }

    /// Total tracked weight of `node` across all evidence.
    pub fn node_weight(&self, node: NodeId) -> u64 {
        let Some(evs) = self.by_node.get(&node) else {
            return 0;
        };
        evs.iter()
            .filter_map(|ev| self.by_evidence.get(ev)?.get(&node))
            .flatten()
            .map(|&(_, w)| w as u64)
            .sum()
    }

    /// Debug audit: the tracker's per-offset contribution sums must equal
    /// the node's weight vector exactly.
    pub fn audit_node(&self, node: NodeId, weights: &[u32]) -> Result<(), String> {
        let mut sums = vec![0u64; weights.len()];
        if let Some(evs) = self.by_node.get(&node) {
            for ev in evs {
                let Some(contribs) = self.by_evidence.get(ev).and_then(|n| n.get(&node))
                else {
                    return Err(format!(
                        "node {} lists evidence {} with no contributions",
                        node.0, ev.0
                    ));
                };
                for &(offset, weight) in contribs {
                    let Some(slot) = sums.get_mut(offset as usize) else {
                        return Err(format!(
                            "node {} contribution offset {} out of range {}",
                            node.0,
                            offset,
                            weights.len()
                        ));
                    };
                    *slot += weight as u64;
                }
            }
        }
        for (i, (&got, &want)) in sums.iter().zip(weights).enumerate() {
            if got != want as u64 {
                return Err(format!(
                    "node {} offset {}: tracker weight {} != node weight {}",
                    node.0, i, got, want
                ));
            }
        }
        Ok(())
    }

    /// Number of live evidence entries (test support).
    pub fn live_evidence(&self) -> usize {
        self.by_evidence.len()
    }

    /// Number of live node entries (test support).
    pub fn live_nodes(&self) -> usize {
        self.by_node.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(n: u64) -> EvidenceId {
        EvidenceId(n)
    }

    #[test]
    fn register_and_remove_round_trip() {
        let mut t = EvidenceTracker::new();
        let a = t.new_node();
        let b = t.new_node();
        t.register(ev(1), a, 0, 10);
        t.register(ev(1), b, 0, 20);
        t.register(ev(2), a, 1, 5);

        assert_eq!(t.evidence_of(a).collect::<Vec<_>>(), vec![ev(1), ev(2)]);
        let lost = t.remove(ev(1));
        assert_eq!(lost, vec![(a, vec![(0, 10)]), (b, vec![(0, 20)])]);
        // b lost its only evidence, a still has ev(2)
        assert_eq!(t.evidence_of(b).count(), 0);
        assert_eq!(t.evidence_of(a).collect::<Vec<_>>(), vec![ev(2)]);
    }

    #[test]
    fn rewrite_shifts_offsets() {
        let mut t = EvidenceTracker::new();
        let agg0 = t.new_node();
        let agg1 = t.new_node();
        let path = t.new_node();
        t.register(ev(1), agg0, 0, 7);
        t.register(ev(1), agg1, 0, 9);
        t.rewrite_node(agg0, path, 0);
        t.rewrite_node(agg1, path, 1);

        assert_eq!(t.node_weight(path), 16);
        t.audit_node(path, &[7, 9]).unwrap();
        assert!(t.audit_node(path, &[7, 8]).is_err());
    }

    #[test]
    fn merge_sums_evidence_sets() {
        let mut t = EvidenceTracker::new();
        let src = t.new_node();
        let dst = t.new_node();
        t.register(ev(1), src, 0, 4);
        t.register(ev(2), dst, 0, 6);
        t.merge_node(src, dst);

        assert_eq!(t.evidence_of(dst).collect::<Vec<_>>(), vec![ev(1), ev(2)]);
        assert_eq!(t.node_weight(src), 0);
        t.audit_node(dst, &[10]).unwrap();
    }

    #[test]
    fn remap_distributes_across_targets() {
        let mut t = EvidenceTracker::new();
        let src = t.new_node();
        let d0 = t.new_node();
        let d1 = t.new_node();
        t.register(ev(3), src, 0, 1);
        t.register(ev(3), src, 1, 2);
        t.register(ev(3), src, 2, 3);
        t.remap(src, |o| if o < 2 { (d0, o) } else { (d1, o - 2) });

        t.audit_node(d0, &[1, 2]).unwrap();
        t.audit_node(d1, &[3]).unwrap();
        assert_eq!(t.node_weight(src), 0);
    }

    #[test]
    fn release_node_drops_orphaned_evidence() {
        let mut t = EvidenceTracker::new();
        let a = t.new_node();
        t.register_evidence(ev(9), EvidenceAnchor { start: 5, read_len: 8, anchor_len: 4 });
        t.register(ev(9), a, 0, 4);
        assert_eq!(t.live_evidence(), 1);
        t.release_node(a);
        assert_eq!(t.live_evidence(), 0);
        assert_eq!(t.anchor_of(ev(9)), None);
    }
}
