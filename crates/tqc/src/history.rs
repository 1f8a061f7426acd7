//! Bounded fixed-point analysis of how many packets back each identifier
//! in an aggregation function may depend on.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::ast::AggFunDef;
use crate::error::{Error, ErrorKind, Result};
use crate::flatten::{ThreeOpCode, ThreeOpStmt};
use crate::predmap::PredHist;
use crate::predtree::{CtxId, PredTree};

/// Iteration cap for the fixed point, and the bound meaning "needs the
/// whole packet log".
pub const MAX_PKT_HISTORY: i32 = 100;

/// Squashed bound for a state parameter no statement reassigned.
pub const NEVER_ASSIGNED: i32 = -1;

/// Converged per-identifier bounds for one aggregation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunHistory {
    pub bounds: BTreeMap<String, i32>,
    pub iterations: u32,
}

impl FunHistory {
    /// Whether `ident` converged to a bound strictly below the cap.
    pub fn is_bounded(&self, ident: &str) -> bool {
        matches!(self.bounds.get(ident), Some(&b) if b < MAX_PKT_HISTORY && b != NEVER_ASSIGNED)
    }
}

/// The branch structure of flattened code, recovered from its predicate
/// assignments: one context per branch side, rooted at the function-wide
/// "always" context.
struct CtxLayout {
    tree: PredTree,
    stmt_ctx: Vec<CtxId>,
}

/// Rebuild the context hierarchy. Each predicate assignment names the
/// variable of its enclosing predicate inside its own predicate expression,
/// so the parent context is the context of that variable; the root
/// predicate assignment (literally true, no variables) maps to the root.
fn build_contexts(name: &str, code: &ThreeOpCode) -> Result<CtxLayout> {
    let mut tree = PredTree::new();
    let mut ctx_of_var: BTreeMap<String, CtxId> = BTreeMap::new();
    let mut stmt_ctx = Vec::with_capacity(code.stmts.len());
    for stmt in &code.stmts {
        let ctx = match stmt {
            ThreeOpStmt::PredAssign { result, pred } => {
                let parent = pred
                    .used_idents()
                    .iter()
                    .find_map(|id| ctx_of_var.get(id))
                    .copied();
                match parent {
                    Some(parent) => {
                        let child = tree.add_child(parent)?;
                        ctx_of_var.insert(result.clone(), child);
                        parent
                    }
                    None => {
                        ctx_of_var.insert(result.clone(), tree.root());
                        tree.root()
                    }
                }
            }
            ThreeOpStmt::Ternary { pred_var, .. } | ThreeOpStmt::Emit { pred_var } => {
                *ctx_of_var.get(pred_var).ok_or_else(|| {
                    Error::new(
                        ErrorKind::UseBeforeDefine,
                        format!("predicate {pred_var} used before definition in {name}"),
                    )
                })?
            }
            ThreeOpStmt::ExprAssign { .. } => tree.root(),
        };
        stmt_ctx.push(ctx);
    }
    Ok(CtxLayout { tree, stmt_ctx })
}

pub struct HistoryAnalyzer<'a> {
    name: &'a str,
    fun: &'a AggFunDef,
    code: &'a ThreeOpCode,
}

impl<'a> HistoryAnalyzer<'a> {
    pub fn new(name: &'a str, fun: &'a AggFunDef, code: &'a ThreeOpCode) -> Self {
        Self { name, fun, code }
    }

    /// Run the fixed point to convergence. Non-convergence within the
    /// iteration cap is reported as an error rather than silently using
    /// the last snapshot.
    pub fn analyze(&self) -> Result<FunHistory> {
        let layout = build_contexts(self.name, self.code)?;
        let mut prev: BTreeMap<String, i32> = BTreeMap::new();
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            let squashed = self.one_pass(&layout, &prev)?;
            if squashed == prev {
                return Ok(FunHistory {
                    bounds: squashed,
                    iterations,
                });
            }
            if iterations as i32 >= MAX_PKT_HISTORY {
                return Err(Error::new(
                    ErrorKind::NonConvergent,
                    format!(
                        "history analysis of {} did not converge within {} iterations",
                        self.name, MAX_PKT_HISTORY
                    ),
                ));
            }
            prev = squashed;
        }
    }

    /// One walk over the statements, carrying a predicated bound per
    /// identifier, then squash each to a single number.
    fn one_pass(
        &self,
        layout: &CtxLayout,
        prev: &BTreeMap<String, i32>,
    ) -> Result<BTreeMap<String, i32>> {
        let tree = &layout.tree;
        let mut curr: BTreeMap<String, PredHist> = BTreeMap::new();
        for (stmt, &ctx) in self.code.stmts.iter().zip(&layout.stmt_ctx) {
            let Some(defined) = stmt.defined_ident() else {
                continue;
            };
            // A ternary's else arm keeps the old value on the untaken
            // side; only the taken arm and the guard are charged to the
            // branch context.
            let used = match stmt {
                ThreeOpStmt::Ternary {
                    pred_var, if_expr, ..
                } => {
                    let mut used = if_expr.used_idents();
                    used.insert(pred_var.clone());
                    used
                }
                _ => stmt.used_idents(),
            };
            let mut bound = PredHist::singleton(ctx, 0);
            for ident in used {
                let slice = self.ident_bound(&ident, ctx, tree, &curr, prev)?;
                bound = bound.max_with(&slice, tree)?;
            }
            match curr.entry(defined.to_string()) {
                Entry::Occupied(mut e) => e.get_mut().overwrite(&bound, tree)?,
                Entry::Vacant(e) => {
                    e.insert(bound);
                }
            }
        }
        let mut squashed: BTreeMap<String, i32> = curr
            .iter()
            .map(|(id, hist)| (id.clone(), hist.squash_max()))
            .collect();
        for state in &self.fun.states {
            squashed
                .entry(state.clone())
                .or_insert(NEVER_ASSIGNED);
        }
        Ok(squashed)
    }

    /// The bound of one read identifier, restricted to the reading
    /// statement's context. Identifiers not yet recorded this iteration
    /// fall back, in order: their previous-iteration bound aged by one
    /// packet, zero for field parameters, the cap for state parameters.
    fn ident_bound(
        &self,
        ident: &str,
        ctx: CtxId,
        tree: &PredTree,
        curr: &BTreeMap<String, PredHist>,
        prev: &BTreeMap<String, i32>,
    ) -> Result<PredHist> {
        let default = match prev.get(ident) {
            Some(&b) if b != NEVER_ASSIGNED => Some((b + 1).min(MAX_PKT_HISTORY)),
            _ if self.fun.fields.iter().any(|f| f == ident) => Some(0),
            _ if self.fun.states.iter().any(|s| s == ident) => Some(MAX_PKT_HISTORY),
            _ => None,
        };
        match (curr.get(ident), default) {
            (Some(hist), default) => hist.relevant_slice(ctx, tree, default.as_ref()),
            (None, Some(d)) => Ok(PredHist::singleton(ctx, d)),
            (None, None) => Err(Error::new(
                ErrorKind::UseBeforeDefine,
                format!("{ident} used before definition in {}", self.name),
            )),
        }
    }
}
