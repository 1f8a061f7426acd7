use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Identity of one predicate context (one branch-side scope) in a hierarchy.
pub type CtxId = u32;

/// Tree of mutually exclusive predicate contexts for one aggregation
/// function.
///
/// Each node stands for the condition space of one branch side; siblings
/// partition their parent's space, and an if/else pair is exhaustive over
/// it. The root is the function's "always true" context. Because contexts
/// only ever refine their parent, two contexts either nest or are disjoint;
/// arbitrary overlap cannot be expressed, which is what makes `intersect`
/// total.
#[derive(Debug, Clone)]
pub struct PredTree {
    root: CtxId,
    next_id: CtxId,
    parent: BTreeMap<CtxId, CtxId>,
    children: BTreeMap<CtxId, Vec<CtxId>>,
    /// Strict ancestors, precomputed on insertion.
    ancestors: BTreeMap<CtxId, BTreeSet<CtxId>>,
}

impl PredTree {
    pub fn new() -> Self {
        let root = 0;
        let mut children = BTreeMap::new();
        children.insert(root, Vec::new());
        let mut ancestors = BTreeMap::new();
        ancestors.insert(root, BTreeSet::new());
        Self {
            root,
            next_id: 1,
            parent: BTreeMap::new(),
            children,
            ancestors,
        }
    }

    pub fn root(&self) -> CtxId {
        self.root
    }

    pub fn contains(&self, id: CtxId) -> bool {
        self.children.contains_key(&id)
    }

    /// Allocate a fresh context refining `parent`.
    pub fn add_child(&mut self, parent: CtxId) -> Result<CtxId> {
        if !self.contains(parent) {
            return Err(Error::internal(format!(
                "predicate context {parent} is not registered"
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.parent.insert(id, parent);
        self.children.insert(id, Vec::new());
        self.children
            .get_mut(&parent)
            .ok_or_else(|| Error::internal("parent child list missing"))?
            .push(id);
        let mut anc = self.ancestors[&parent].clone();
        anc.insert(parent);
        self.ancestors.insert(id, anc);
        Ok(id)
    }

    /// Whether `a` is a strict ancestor of `b`.
    pub fn is_ancestor(&self, a: CtxId, b: CtxId) -> bool {
        self.ancestors
            .get(&b)
            .map(|anc| anc.contains(&a))
            .unwrap_or(false)
    }

    /// The more specific of two contexts when one contains the other (or
    /// they are equal); `None` when their spaces are disjoint.
    pub fn intersect(&self, a: CtxId, b: CtxId) -> Option<CtxId> {
        if a == b {
            Some(a)
        } else if self.is_ancestor(a, b) {
            Some(b)
        } else if self.is_ancestor(b, a) {
            Some(a)
        } else {
            None
        }
    }

    /// Remove `node`'s share of the space from `cover`.
    ///
    /// `cover` must contain `node` itself or an ancestor of it. That element
    /// is replaced by the sibling subtrees passed on the way down, so that
    /// `cover` afterwards tiles the same space minus `node`. Finding no such
    /// element means the mutation discipline of the analyses was broken.
    pub fn adjust_cover_set(&self, cover: &mut BTreeSet<CtxId>, node: CtxId) -> Result<()> {
        if cover.remove(&node) {
            return Ok(());
        }
        let anc = self
            .ancestors
            .get(&node)
            .ok_or_else(|| Error::internal(format!("predicate context {node} is not registered")))?
            .iter()
            .find(|a| cover.contains(a))
            .copied()
            .ok_or_else(|| {
                Error::internal(format!(
                    "cover set {cover:?} holds no ancestor of context {node}"
                ))
            })?;
        cover.remove(&anc);
        // Walk up from node to the removed ancestor, keeping every sibling
        // branch passed along the way.
        let mut cur = node;
        while cur != anc {
            let parent = self.parent[&cur];
            for &sib in &self.children[&parent] {
                if sib != cur {
                    cover.insert(sib);
                }
            }
            cur = parent;
        }
        Ok(())
    }
}

impl Default for PredTree {
    fn default() -> Self {
        Self::new()
    }
}
