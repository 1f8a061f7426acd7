use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::ast::{AggFunDef, FunStmt};
use crate::error::Result;
use crate::expr::{Expr, Pred, BOOL_WIDTH, INT_WIDTH};

/// Generator for unique predicate-variable names, owned by the compile
/// context and threaded through each flattening.
#[derive(Debug, Default)]
pub struct IdGen {
    next: u32,
}

impl IdGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn fresh(&mut self) -> u32 {
        self.next += 1;
        self.next
    }

    pub fn fresh_pred_var(&mut self) -> String {
        format!("pred_{}", self.fresh())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreeOpDecl {
    pub width: u32,
    pub id: String,
}

/// One statement of flattened, branch-free code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreeOpStmt {
    /// `result = pred_var ? if_expr : else_expr`
    Ternary {
        result: String,
        pred_var: String,
        if_expr: Expr,
        else_expr: Expr,
    },
    /// `result = pred`
    PredAssign { result: String, pred: Pred },
    /// `result = expr`
    ExprAssign { result: String, expr: Expr },
    /// `emit() when pred_var`
    Emit { pred_var: String },
}

impl ThreeOpStmt {
    /// The identifier this statement defines, if any.
    pub fn defined_ident(&self) -> Option<&str> {
        match self {
            ThreeOpStmt::Ternary { result, .. }
            | ThreeOpStmt::PredAssign { result, .. }
            | ThreeOpStmt::ExprAssign { result, .. } => Some(result),
            ThreeOpStmt::Emit { .. } => None,
        }
    }

    /// All identifiers read by this statement, guard variables included.
    pub fn used_idents(&self) -> BTreeSet<String> {
        match self {
            ThreeOpStmt::Ternary {
                pred_var,
                if_expr,
                else_expr,
                ..
            } => {
                let mut out = if_expr.used_idents();
                out.extend(else_expr.used_idents());
                out.insert(pred_var.clone());
                out
            }
            ThreeOpStmt::PredAssign { pred, .. } => pred.used_idents(),
            ThreeOpStmt::ExprAssign { expr, .. } => expr.used_idents(),
            ThreeOpStmt::Emit { pred_var } => [pred_var.clone()].into_iter().collect(),
        }
    }

    /// The expressions this statement evaluates.
    pub fn used_exprs(&self) -> Vec<&Expr> {
        match self {
            ThreeOpStmt::Ternary {
                if_expr, else_expr, ..
            } => vec![if_expr, else_expr],
            ThreeOpStmt::ExprAssign { expr, .. } => vec![expr],
            ThreeOpStmt::PredAssign { .. } | ThreeOpStmt::Emit { .. } => Vec::new(),
        }
    }

    pub fn is_pred_assign(&self) -> bool {
        matches!(self, ThreeOpStmt::PredAssign { .. })
    }
}

impl fmt::Display for ThreeOpStmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreeOpStmt::Ternary {
                result,
                pred_var,
                if_expr,
                else_expr,
            } => write!(f, "{result} = {pred_var} ? {if_expr} : {else_expr};"),
            ThreeOpStmt::PredAssign { result, pred } => write!(f, "{result} = {pred};"),
            ThreeOpStmt::ExprAssign { result, expr } => write!(f, "{result} = {expr};"),
            ThreeOpStmt::Emit { pred_var } => write!(f, "emit() when {pred_var};"),
        }
    }
}

/// Flattened function body: declarations (all at entry) plus statements in
/// program order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ThreeOpCode {
    pub decls: Vec<ThreeOpDecl>,
    pub stmts: Vec<ThreeOpStmt>,
}

impl ThreeOpCode {
    pub fn ordered_merge(mut self, other: ThreeOpCode) -> ThreeOpCode {
        self.decls.extend(other.decls);
        self.stmts.extend(other.stmts);
        self
    }
}

/// Convert an aggregation-function body into predicate-guarded
/// three-operand code.
///
/// The walk keeps the current outer predicate both as a logical predicate
/// (for the identically-true/false special cases) and as the name of the
/// variable holding it. Branch predicates reference the outer predicate's
/// variable rather than re-expanding its tree, so the nesting structure
/// stays recoverable from the flat statement list.
pub fn flatten_fun(fun: &AggFunDef, idgen: &mut IdGen) -> Result<ThreeOpCode> {
    let mut code = ThreeOpCode::default();
    let root_var = idgen.fresh_pred_var();
    code.decls.push(ThreeOpDecl {
        width: BOOL_WIDTH,
        id: root_var.clone(),
    });
    code.stmts.push(ThreeOpStmt::PredAssign {
        result: root_var.clone(),
        pred: Pred::True,
    });
    let mut declared: BTreeSet<String> = fun
        .states
        .iter()
        .chain(fun.fields.iter())
        .cloned()
        .collect();
    walk(
        &fun.body,
        &Pred::True,
        &root_var,
        idgen,
        &mut declared,
        &mut code,
    );
    Ok(code)
}

fn walk(
    stmts: &[FunStmt],
    outer: &Pred,
    outer_var: &str,
    idgen: &mut IdGen,
    declared: &mut BTreeSet<String>,
    code: &mut ThreeOpCode,
) {
    for stmt in stmts {
        match stmt {
            FunStmt::Assign { id, expr } => {
                if declared.insert(id.clone()) {
                    code.decls.push(ThreeOpDecl {
                        width: INT_WIDTH,
                        id: id.clone(),
                    });
                }
                let out = match outer {
                    Pred::True => ThreeOpStmt::ExprAssign {
                        result: id.clone(),
                        expr: expr.clone(),
                    },
                    // A statically dead branch: keep a self-assignment for
                    // uniformity of the generated code.
                    Pred::False => ThreeOpStmt::ExprAssign {
                        result: id.clone(),
                        expr: Expr::ident(id.clone()),
                    },
                    _ => ThreeOpStmt::Ternary {
                        result: id.clone(),
                        pred_var: outer_var.to_string(),
                        if_expr: expr.clone(),
                        else_expr: Expr::ident(id.clone()),
                    },
                };
                code.stmts.push(out);
            }
            FunStmt::Emit => {
                code.stmts.push(ThreeOpStmt::Emit {
                    pred_var: outer_var.to_string(),
                });
            }
            FunStmt::If {
                pred,
                then_branch,
                else_branch,
            } => {
                let then_var = idgen.fresh_pred_var();
                code.decls.push(ThreeOpDecl {
                    width: BOOL_WIDTH,
                    id: then_var.clone(),
                });
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: then_var.clone(),
                    pred: Pred::var(outer_var).and(pred.clone()),
                });
                let then_outer = outer.clone().and(pred.clone());
                walk(then_branch, &then_outer, &then_var, idgen, declared, code);
                // The complement side is materialized even for an empty
                // else, keeping each if/else split exhaustive over its
                // parent context.
                let else_var = idgen.fresh_pred_var();
                code.decls.push(ThreeOpDecl {
                    width: BOOL_WIDTH,
                    id: else_var.clone(),
                });
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: else_var.clone(),
                    pred: Pred::var(outer_var).and(pred.clone().not()),
                });
                let else_outer = outer.clone().and(pred.clone().not());
                walk(else_branch, &else_outer, &else_var, idgen, declared, code);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{flatten_fun, IdGen, ThreeOpStmt};
    use crate::ast::{AggFunDef, FunStmt};
    use crate::expr::{BinOp, CmpOp, Expr, Pred};

    fn counting_fun() -> AggFunDef {
        // def f(acc | field): x = field; if (x > 0) { acc = acc + x; } emit()
        AggFunDef {
            states: vec!["acc".into()],
            fields: vec!["field".into()],
            associative: false,
            body: vec![
                FunStmt::Assign {
                    id: "x".into(),
                    expr: Expr::ident("field"),
                },
                FunStmt::If {
                    pred: Pred::cmp(CmpOp::Gt, Expr::ident("x"), Expr::value(0)),
                    then_branch: vec![FunStmt::Assign {
                        id: "acc".into(),
                        expr: Expr::binary(BinOp::Add, Expr::ident("acc"), Expr::ident("x")),
                    }],
                    else_branch: vec![],
                },
                FunStmt::Emit,
            ],
        }
    }

    #[test]
    fn flatten_produces_guarded_three_operand_code() {
        let mut idgen = IdGen::new();
        let code = flatten_fun(&counting_fun(), &mut idgen).expect("flatten");

        // Root predicate, direct assignment, branch predicate, guarded
        // ternary, complement predicate, guarded emit.
        assert_eq!(code.stmts.len(), 6);
        let ThreeOpStmt::PredAssign { result: root, pred } = &code.stmts[0] else {
            panic!("expected root predicate assignment");
        };
        assert_eq!(*pred, Pred::True);

        let ThreeOpStmt::ExprAssign { result, expr } = &code.stmts[1] else {
            panic!("expected direct assignment under true outer predicate");
        };
        assert_eq!(result, "x");
        assert_eq!(*expr, Expr::ident("field"));

        let ThreeOpStmt::PredAssign {
            result: branch,
            pred,
        } = &code.stmts[2]
        else {
            panic!("expected branch predicate assignment");
        };
        assert!(pred.used_idents().contains(root), "references outer var");

        let ThreeOpStmt::Ternary {
            result,
            pred_var,
            else_expr,
            ..
        } = &code.stmts[3]
        else {
            panic!("expected guarded ternary");
        };
        assert_eq!(result, "acc");
        assert_eq!(pred_var, branch);
        assert_eq!(*else_expr, Expr::ident("acc"), "false arm keeps old value");

        // The empty else still gets its complement predicate, so the
        // then/else pair tiles the outer context.
        let ThreeOpStmt::PredAssign {
            result: complement,
            pred,
        } = &code.stmts[4]
        else {
            panic!("expected complement predicate assignment");
        };
        assert_ne!(complement, branch);
        assert!(pred.used_idents().contains(root), "references outer var");

        let ThreeOpStmt::Emit { pred_var } = &code.stmts[5] else {
            panic!("expected guarded emit");
        };
        assert_eq!(pred_var, root);
    }

    #[test]
    fn temporaries_are_declared_once_at_entry() {
        let mut idgen = IdGen::new();
        let code = flatten_fun(&counting_fun(), &mut idgen).expect("flatten");
        let decl_ids: Vec<&str> = code.decls.iter().map(|d| d.id.as_str()).collect();
        // x is declared; acc/field are parameters and are not.
        assert!(decl_ids.contains(&"x"));
        assert!(!decl_ids.contains(&"acc"));
        assert!(!decl_ids.contains(&"field"));
        // One decl per identifier.
        let mut sorted = decl_ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), decl_ids.len());
    }

    #[test]
    fn statically_false_branch_becomes_self_assignment() {
        let fun = AggFunDef {
            states: vec!["acc".into()],
            fields: vec![],
            associative: false,
            body: vec![FunStmt::If {
                pred: Pred::False,
                then_branch: vec![FunStmt::Assign {
                    id: "acc".into(),
                    expr: Expr::value(1),
                }],
                else_branch: vec![],
            }],
        };
        let mut idgen = IdGen::new();
        let code = flatten_fun(&fun, &mut idgen).expect("flatten");
        assert!(code.stmts.iter().any(|s| matches!(
            s,
            ThreeOpStmt::ExprAssign { result, expr }
                if result == "acc" && *expr == Expr::ident("acc")
        )));
    }
}
