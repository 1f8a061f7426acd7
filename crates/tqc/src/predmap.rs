use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::predtree::{CtxId, PredTree};

/// Partial function from predicate context to a value: one case-split fact,
/// such as the packet-history bound of an identifier per branch.
///
/// Invariant: the domain is a set of mutually disjoint contexts. Operations
/// that merge maps keep it that way by splitting coarser entries along the
/// hierarchy's sibling structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredMap<V> {
    entries: BTreeMap<CtxId, V>,
}

impl<V: Clone> PredMap<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn singleton(ctx: CtxId, value: V) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(ctx, value);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<CtxId, V> {
        &self.entries
    }

    /// Restrict to the part of the map that intersects `ambient`, returning
    /// a map whose domain partitions `ambient` exactly. Gaps are filled with
    /// `default`; a gap with no default available is a logic error in the
    /// caller.
    pub fn relevant_slice(
        &self,
        ambient: CtxId,
        tree: &PredTree,
        default: Option<&V>,
    ) -> Result<PredMap<V>> {
        let mut out = BTreeMap::new();
        let mut cover: BTreeSet<CtxId> = [ambient].into_iter().collect();
        for (&ctx, value) in &self.entries {
            if let Some(inter) = tree.intersect(ctx, ambient) {
                out.insert(inter, value.clone());
                tree.adjust_cover_set(&mut cover, inter)?;
            }
        }
        if !cover.is_empty() {
            let default = default.ok_or_else(|| {
                Error::internal(format!(
                    "predicated map leaves context {ambient} uncovered and no default exists"
                ))
            })?;
            for ctx in cover {
                out.insert(ctx, default.clone());
            }
        }
        Ok(PredMap { entries: out })
    }

    /// Combine with `other` on the finest common refinement of both
    /// domains. Where only one map speaks, its value is taken as is; where
    /// both do, `f(self_value, other_value)` decides.
    pub fn pointwise_combine(
        &self,
        other: &PredMap<V>,
        tree: &PredTree,
        f: impl Fn(&V, &V) -> V,
    ) -> Result<PredMap<V>> {
        let mut out = self.entries.clone();
        for (&np, nv) in &other.entries {
            let mut cover_new: BTreeSet<CtxId> = [np].into_iter().collect();
            let old_keys: Vec<CtxId> = out.keys().copied().collect();
            for op in old_keys {
                let Some(ov) = out.get(&op).cloned() else {
                    continue;
                };
                if op == np {
                    out.insert(op, f(&ov, nv));
                    cover_new.clear();
                } else if tree.is_ancestor(np, op) {
                    // The old entry is the more specific one; it absorbs the
                    // new value and claims its part of the new context.
                    out.insert(op, f(&ov, nv));
                    tree.adjust_cover_set(&mut cover_new, op)?;
                } else if tree.is_ancestor(op, np) {
                    // The new entry refines the old one: split the old entry
                    // around it and keep the old value on the remainder.
                    let mut cover_old: BTreeSet<CtxId> = [op].into_iter().collect();
                    tree.adjust_cover_set(&mut cover_old, np)?;
                    for ctx in cover_old {
                        out.insert(ctx, ov.clone());
                    }
                    out.remove(&op);
                    out.insert(np, f(&ov, nv));
                    cover_new.clear();
                    break;
                }
                // Disjoint contexts do not interact.
            }
            for ctx in cover_new {
                out.insert(ctx, nv.clone());
            }
        }
        Ok(PredMap { entries: out })
    }

    /// Merge `new` into the receiver in place, the newer value winning on
    /// the more specific context.
    pub fn overwrite(&mut self, new: &PredMap<V>, tree: &PredTree) -> Result<()> {
        *self = self.pointwise_combine(new, tree, |_, b| b.clone())?;
        Ok(())
    }

    /// Collapse the map to a single value via `f`, or `None` when empty.
    pub fn squash(&self, f: impl Fn(&V, &V) -> V) -> Option<V> {
        let mut values = self.entries.values();
        let first = values.next()?.clone();
        Some(values.fold(first, |acc, v| f(&acc, v)))
    }
}

impl<V: Clone> Default for PredMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Packet-history bounds per predicate context.
pub type PredHist = PredMap<i32>;

impl PredHist {
    /// Merge to one bound: the maximum across all contexts.
    pub fn squash_max(&self) -> i32 {
        self.squash(|a, b| (*a).max(*b)).unwrap_or(0)
    }

    pub fn max_with(&self, other: &PredHist, tree: &PredTree) -> Result<PredHist> {
        self.pointwise_combine(other, tree, |a, b| (*a).max(*b))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{PredHist, PredMap};
    use crate::predtree::PredTree;

    /// Root with one if/else split (a | b), and a nested split under a.
    fn two_level_tree() -> (PredTree, u32, u32, u32, u32) {
        let mut t = PredTree::new();
        let a = t.add_child(t.root()).expect("child");
        let b = t.add_child(t.root()).expect("child");
        let aa = t.add_child(a).expect("child");
        let ab = t.add_child(a).expect("child");
        (t, a, b, aa, ab)
    }

    fn domain(m: &PredHist) -> BTreeSet<u32> {
        m.entries().keys().copied().collect()
    }

    #[test]
    fn slice_fills_gaps_with_default() {
        let (t, a, b, ..) = two_level_tree();
        let m = PredMap::singleton(a, 3);
        let sliced = m.relevant_slice(t.root(), &t, Some(&0)).expect("slice");
        assert_eq!(domain(&sliced), [a, b].into_iter().collect());
        assert_eq!(sliced.entries()[&a], 3);
        assert_eq!(sliced.entries()[&b], 0);
    }

    #[test]
    fn slice_without_default_on_full_cover_is_ok() {
        let (t, a, b, ..) = two_level_tree();
        let mut m = PredHist::new();
        m.overwrite(&PredMap::singleton(a, 1), &t).expect("set");
        m.overwrite(&PredMap::singleton(b, 2), &t).expect("set");
        let sliced = m.relevant_slice(t.root(), &t, None).expect("slice");
        assert_eq!(domain(&sliced), [a, b].into_iter().collect());
    }

    #[test]
    fn slice_regression_gap_without_default_errors() {
        let (t, a, ..) = two_level_tree();
        let m = PredMap::singleton(a, 3);
        assert!(m.relevant_slice(t.root(), &t, None).is_err());
    }

    #[test]
    fn combine_refines_to_common_partition() {
        // One map speaks about the whole `a` context, the other about the
        // nested `aa` only; combining must split `a` into {aa, ab}.
        let (t, a, _b, aa, ab) = two_level_tree();
        let coarse = PredMap::singleton(a, 2);
        let fine = PredMap::singleton(aa, 5);
        let out = coarse.max_with(&fine, &t).expect("combine");
        assert_eq!(domain(&out), [aa, ab].into_iter().collect());
        assert_eq!(out.entries()[&aa], 5);
        assert_eq!(out.entries()[&ab], 2);
    }

    #[test]
    fn combine_same_partition_is_pointwise() {
        let (t, a, b, ..) = two_level_tree();
        let mut m1 = PredHist::new();
        m1.overwrite(&PredMap::singleton(a, 1), &t).expect("set");
        m1.overwrite(&PredMap::singleton(b, 7), &t).expect("set");
        let mut m2 = PredHist::new();
        m2.overwrite(&PredMap::singleton(a, 4), &t).expect("set");
        m2.overwrite(&PredMap::singleton(b, 2), &t).expect("set");
        let out = m1.max_with(&m2, &t).expect("combine");
        assert_eq!(domain(&out), [a, b].into_iter().collect());
        assert_eq!(out.entries()[&a], 4);
        assert_eq!(out.entries()[&b], 7);
    }

    #[test]
    fn overwrite_propagates_the_more_specific_value() {
        let (t, a, _b, aa, ab) = two_level_tree();
        let mut m = PredMap::singleton(a, 1);
        m.overwrite(&PredMap::singleton(aa, 9), &t).expect("set");
        assert_eq!(domain(&m), [aa, ab].into_iter().collect());
        assert_eq!(m.entries()[&aa], 9);
        assert_eq!(m.entries()[&ab], 1);

        // A coarser overwrite updates the finer entries it covers.
        let coarse = PredMap::singleton(a, 0);
        m.overwrite(&coarse, &t).expect("set");
        assert_eq!(m.entries()[&aa], 0);
        assert_eq!(m.entries()[&ab], 0);
    }

    #[test]
    fn squash_takes_the_maximum() {
        let (t, a, b, ..) = two_level_tree();
        let mut m = PredHist::new();
        m.overwrite(&PredMap::singleton(a, 3), &t).expect("set");
        m.overwrite(&PredMap::singleton(b, 11), &t).expect("set");
        assert_eq!(m.squash_max(), 11);
    }
}
