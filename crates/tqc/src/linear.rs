//! Rewrites unbounded-history state updates of the affine form
//! `s <- A*s + B` into a pair of bounded accumulators, so the state itself
//! no longer needs per-packet history.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::AggFunDef;
use crate::expr::{Expr, INT_WIDTH};
use crate::flatten::{ThreeOpCode, ThreeOpDecl, ThreeOpStmt};
use crate::history::{FunHistory, MAX_PKT_HISTORY};

/// The accumulator pair standing in for one rewritten state: after any run
/// of packets, `state_final = mul * state_initial + add`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accumulators {
    pub mul: String,
    pub add: String,
}

/// Result of the rewrite over one function. When no state qualifies (or
/// the all-or-nothing policy vetoes the function), `code` is the input
/// unchanged and `rewritten` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinearResult {
    pub code: ThreeOpCode,
    /// State parameter list with introduced accumulators appended.
    pub states: Vec<String>,
    /// Initial values for the introduced accumulators.
    pub inits: BTreeMap<String, i64>,
    pub rewritten: BTreeMap<String, Accumulators>,
}

/// Whether every update of `state` in `code` is affine in `state`, with
/// guard predicates and affine coefficients of bounded history, and the
/// state is never read except to update itself.
pub fn detect_linear_in_state(code: &ThreeOpCode, state: &str, hist: &FunHistory) -> bool {
    for stmt in &code.stmts {
        let defines_state = stmt.defined_ident() == Some(state);
        if stmt.used_idents().contains(state) && !defines_state {
            return false;
        }
        if !defines_state {
            continue;
        }
        if let ThreeOpStmt::Ternary { pred_var, .. } = stmt {
            if is_unbounded(pred_var, hist) {
                return false;
            }
        }
        let exprs = stmt.used_exprs();
        if exprs.is_empty() {
            return false;
        }
        for expr in exprs {
            let Some((a, b)) = expr.affine_coefficients(state) else {
                return false;
            };
            let coeff_idents: BTreeSet<String> = a
                .used_idents()
                .into_iter()
                .chain(b.used_idents())
                .collect();
            if coeff_idents.iter().any(|v| is_unbounded(v, hist)) {
                return false;
            }
        }
    }
    true
}

fn is_unbounded(ident: &str, hist: &FunHistory) -> bool {
    hist.bounds.get(ident) == Some(&MAX_PKT_HISTORY)
}

/// Apply the rewrite to one function. States whose converged bound is
/// below the cap (or that are never assigned) are left alone; if any
/// unbounded state fails the affine test, no state in the function is
/// rewritten.
pub fn rewrite_fun(fun: &AggFunDef, code: &ThreeOpCode, hist: &FunHistory) -> LinearResult {
    let unchanged = || LinearResult {
        code: code.clone(),
        states: fun.states.clone(),
        inits: BTreeMap::new(),
        rewritten: BTreeMap::new(),
    };
    let unbounded: Vec<&String> = fun
        .states
        .iter()
        .filter(|s| is_unbounded(s, hist))
        .collect();
    if unbounded.is_empty() {
        return unchanged();
    }
    if unbounded
        .iter()
        .any(|s| !detect_linear_in_state(code, s, hist))
    {
        return unchanged();
    }

    let mut used: BTreeSet<String> = fun.states.iter().cloned().collect();
    used.extend(fun.fields.iter().cloned());
    used.extend(code.decls.iter().map(|d| d.id.clone()));

    let mut result = unchanged();
    for state in unbounded {
        let acc = Accumulators {
            mul: fresh_name(&mut used, &format!("{state}_mul")),
            add: fresh_name(&mut used, &format!("{state}_add")),
        };
        rewrite_state(&mut result.code, state, &acc);
        result.states.push(acc.mul.clone());
        result.states.push(acc.add.clone());
        result.inits.insert(acc.mul.clone(), 1);
        result.inits.insert(acc.add.clone(), 0);
        result.rewritten.insert(state.clone(), acc);
    }
    result
}

/// Replace each update of `state` with the matching accumulator updates,
/// and append the reconstruction of the state from its accumulators. The
/// reconstruction runs once after the packet loop, not per packet.
fn rewrite_state(code: &mut ThreeOpCode, state: &str, acc: &Accumulators) {
    let mut stmts = Vec::with_capacity(code.stmts.len() + 1);
    for stmt in code.stmts.drain(..) {
        if stmt.defined_ident() != Some(state) {
            stmts.push(stmt);
            continue;
        }
        match stmt {
            ThreeOpStmt::ExprAssign { expr, .. } => {
                let (a, b) = affine_parts(&expr, state);
                stmts.push(ThreeOpStmt::ExprAssign {
                    result: acc.mul.clone(),
                    expr: Expr::mul(a.clone(), Expr::ident(&acc.mul)),
                });
                stmts.push(ThreeOpStmt::ExprAssign {
                    result: acc.add.clone(),
                    expr: Expr::add(Expr::mul(a, Expr::ident(&acc.add)), b),
                });
            }
            ThreeOpStmt::Ternary {
                pred_var,
                if_expr,
                else_expr,
                ..
            } => {
                let (ta, tb) = affine_parts(&if_expr, state);
                let (ea, eb) = affine_parts(&else_expr, state);
                stmts.push(ThreeOpStmt::Ternary {
                    result: acc.mul.clone(),
                    pred_var: pred_var.clone(),
                    if_expr: Expr::mul(ta.clone(), Expr::ident(&acc.mul)),
                    else_expr: Expr::mul(ea.clone(), Expr::ident(&acc.mul)),
                });
                stmts.push(ThreeOpStmt::Ternary {
                    result: acc.add.clone(),
                    pred_var,
                    if_expr: Expr::add(Expr::mul(ta, Expr::ident(&acc.add)), tb),
                    else_expr: Expr::add(Expr::mul(ea, Expr::ident(&acc.add)), eb),
                });
            }
            other => stmts.push(other),
        }
    }
    stmts.push(ThreeOpStmt::ExprAssign {
        result: state.to_string(),
        expr: Expr::add(
            Expr::mul(Expr::ident(&acc.mul), Expr::ident(state)),
            Expr::ident(&acc.add),
        ),
    });
    code.stmts = stmts;
    code.decls.push(ThreeOpDecl {
        width: INT_WIDTH,
        id: acc.mul.clone(),
    });
    code.decls.push(ThreeOpDecl {
        width: INT_WIDTH,
        id: acc.add.clone(),
    });
}

fn affine_parts(expr: &Expr, state: &str) -> (Expr, Expr) {
    expr.affine_coefficients(state)
        .unwrap_or_else(|| (Expr::value(1), Expr::value(0)))
}

fn fresh_name(used: &mut BTreeSet<String>, base: &str) -> String {
    let mut name = base.to_string();
    let mut n = 0u32;
    while used.contains(&name) {
        n += 1;
        name = format!("{base}_{n}");
    }
    used.insert(name.clone());
    name
}
