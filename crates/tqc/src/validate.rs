//! Input validation: stream operand discipline, the identifier kind
//! lattice, and per-function lexical checks, all before any analysis pass
//! runs.

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{packet_log_fields, AggFunDef, FunStmt, IdentKind, Program, QueryOp, PKT_LOG};
use crate::error::{Error, ErrorKind, Result};

/// Merge a newly inferred kind into an identifier's recorded kind.
///
/// Allowed moves: STATE read as COLUMN becomes STATE_OR_COLUMN (an emit
/// exposes state as columns), STATE_OR_COLUMN may keep being used as a
/// COLUMN, and a STREAM may become a RELATION. Every other change is a
/// type conflict, including STATE_OR_COLUMN going back to STATE.
pub fn merge_kind(name: &str, old: IdentKind, new: IdentKind) -> Result<IdentKind> {
    if old == new {
        return Ok(old);
    }
    match (old, new) {
        (IdentKind::State, IdentKind::Column) => Ok(IdentKind::StateOrColumn),
        (IdentKind::StateOrColumn, IdentKind::Column) => Ok(IdentKind::StateOrColumn),
        (IdentKind::Stream, IdentKind::Relation) => Ok(IdentKind::Relation),
        (old, new) => Err(Error::new(
            ErrorKind::TypeConflict,
            format!("cannot change type of {name} from {old} to {new}"),
        )),
    }
}

/// Validate the program and return the completed identifier classification:
/// the frontend's table folded together with what the queries themselves
/// imply.
pub fn validate(program: &Program) -> Result<BTreeMap<String, IdentKind>> {
    let mut symbols = program.symbols.clone();
    let mut record = |symbols: &mut BTreeMap<String, IdentKind>,
                      name: &str,
                      kind: IdentKind|
     -> Result<()> {
        let merged = match symbols.get(name) {
            Some(&old) => merge_kind(name, old, kind)?,
            None => kind,
        };
        symbols.insert(name.to_string(), merged);
        Ok(())
    };

    for field in packet_log_fields() {
        record(&mut symbols, &field, IdentKind::Column)?;
    }
    for (name, fun) in &program.agg_funs {
        record(&mut symbols, name, IdentKind::AggFunc)?;
        for state in &fun.states {
            record(&mut symbols, state, IdentKind::State)?;
        }
        if fun.emits() {
            // An emit makes all of the function's state readable as columns.
            for state in &fun.states {
                record(&mut symbols, state, IdentKind::Column)?;
            }
        }
        check_fun_body(name, fun)?;
    }

    let mut defined: BTreeSet<&str> = BTreeSet::new();
    for query in &program.queries {
        for operand in query.op.operands() {
            if operand != PKT_LOG && !defined.contains(operand) {
                return Err(Error::new(
                    ErrorKind::UseBeforeDefine,
                    format!("stream {operand} used without prior definition in {query}"),
                ));
            }
        }
        let kind = match &query.op {
            QueryOp::Groupby { keys, agg_func, .. } => {
                for key in keys {
                    record(&mut symbols, key, IdentKind::Column)?;
                }
                let fun = program.agg_funs.get(agg_func).ok_or_else(|| {
                    Error::new(
                        ErrorKind::UseBeforeDefine,
                        format!("aggregation function {agg_func} is not defined, in {query}"),
                    )
                })?;
                // A fold with no emit produces a relation, not a stream.
                if fun.emits() {
                    IdentKind::Stream
                } else {
                    IdentKind::Relation
                }
            }
            QueryOp::Map { cols, exprs, .. } => {
                if cols.len() != exprs.len() {
                    return Err(Error::new(
                        ErrorKind::Schema,
                        format!("column and expression lists differ in length in {query}"),
                    ));
                }
                for col in cols {
                    record(&mut symbols, col, IdentKind::Column)?;
                }
                IdentKind::Stream
            }
            QueryOp::Filter { .. } | QueryOp::Zip { .. } => IdentKind::Stream,
        };
        record(&mut symbols, &query.name, kind)?;
        defined.insert(&query.name);
    }
    Ok(symbols)
}

/// Lexical checks on one aggregation-function body: every read identifier
/// is a parameter or was assigned earlier, and packet fields are never
/// assigned.
fn check_fun_body(name: &str, fun: &AggFunDef) -> Result<()> {
    let mut defined: BTreeSet<String> = fun
        .states
        .iter()
        .chain(fun.fields.iter())
        .cloned()
        .collect();
    check_stmts(name, fun, &fun.body, &mut defined)
}

fn check_stmts(
    name: &str,
    fun: &AggFunDef,
    stmts: &[FunStmt],
    defined: &mut BTreeSet<String>,
) -> Result<()> {
    for stmt in stmts {
        match stmt {
            FunStmt::Assign { id, expr } => {
                for used in expr.used_idents() {
                    if !defined.contains(&used) {
                        return Err(Error::new(
                            ErrorKind::UseBeforeDefine,
                            format!("{used} used before definition in {name}"),
                        ));
                    }
                }
                if fun.fields.iter().any(|f| f == id) {
                    return Err(Error::new(
                        ErrorKind::TypeConflict,
                        format!("cannot assign packet field {id} in {name}"),
                    ));
                }
                defined.insert(id.clone());
            }
            FunStmt::If {
                pred,
                then_branch,
                else_branch,
            } => {
                for used in pred.used_idents() {
                    if !defined.contains(&used) {
                        return Err(Error::new(
                            ErrorKind::UseBeforeDefine,
                            format!("{used} used before definition in {name}"),
                        ));
                    }
                }
                let mut then_defined = defined.clone();
                check_stmts(name, fun, then_branch, &mut then_defined)?;
                let mut else_defined = defined.clone();
                check_stmts(name, fun, else_branch, &mut else_defined)?;
                // Variables are declared at function entry once flattened,
                // so an assignment on either side counts afterwards.
                defined.extend(then_defined);
                defined.extend(else_defined);
            }
            FunStmt::Emit => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{merge_kind, validate};
    use crate::ast::{AggFunDef, FunStmt, IdentKind, Program, Query, QueryOp, PKT_LOG};
    use crate::error::ErrorKind;
    use crate::expr::{Expr, Pred};

    #[test]
    fn state_read_as_column_becomes_state_or_column() {
        let merged = merge_kind("acc", IdentKind::State, IdentKind::Column).expect("merge");
        assert_eq!(merged, IdentKind::StateOrColumn);
        let merged =
            merge_kind("acc", IdentKind::StateOrColumn, IdentKind::Column).expect("merge");
        assert_eq!(merged, IdentKind::StateOrColumn);
    }

    #[test]
    fn state_or_column_cannot_go_back_to_state() {
        let err = merge_kind("acc", IdentKind::StateOrColumn, IdentKind::State)
            .expect_err("must conflict");
        assert_eq!(err.kind, ErrorKind::TypeConflict);
        assert!(err.message.contains("acc"));
    }

    #[test]
    fn emitting_function_exposes_state_as_columns() {
        let mut prog = Program {
            queries: vec![],
            symbols: Default::default(),
            agg_funs: Default::default(),
        };
        prog.agg_funs.insert(
            "count".to_string(),
            AggFunDef {
                states: vec!["n".to_string()],
                fields: vec![],
                associative: true,
                body: vec![
                    FunStmt::Assign {
                        id: "n".to_string(),
                        expr: Expr::add(Expr::ident("n"), Expr::value(1)),
                    },
                    FunStmt::Emit,
                ],
            },
        );
        let symbols = validate(&prog).expect("validate");
        assert_eq!(symbols.get("n"), Some(&IdentKind::StateOrColumn));
        assert_eq!(symbols.get("count"), Some(&IdentKind::AggFunc));
    }

    #[test]
    fn out_of_order_stream_use_is_rejected() {
        let prog = Program {
            queries: vec![Query {
                name: "r".to_string(),
                op: QueryOp::Filter {
                    input: "later".to_string(),
                    pred: Pred::True,
                },
            }],
            symbols: Default::default(),
            agg_funs: Default::default(),
        };
        let err = validate(&prog).expect_err("validate");
        assert_eq!(err.kind, ErrorKind::UseBeforeDefine);
        assert!(err.message.contains("later"));
    }

    #[test]
    fn assigning_a_packet_field_is_a_type_conflict() {
        let mut prog = Program {
            queries: vec![],
            symbols: Default::default(),
            agg_funs: Default::default(),
        };
        prog.agg_funs.insert(
            "f".to_string(),
            AggFunDef {
                states: vec![],
                fields: vec!["len".to_string()],
                associative: false,
                body: vec![FunStmt::Assign {
                    id: "len".to_string(),
                    expr: Expr::value(0),
                }],
            },
        );
        let err = validate(&prog).expect_err("validate");
        assert_eq!(err.kind, ErrorKind::TypeConflict);
        assert!(err.message.contains("len"));
    }

    #[test]
    fn packet_log_can_feed_the_first_query() {
        let prog = Program {
            queries: vec![Query {
                name: "r".to_string(),
                op: QueryOp::Filter {
                    input: PKT_LOG.to_string(),
                    pred: Pred::True,
                },
            }],
            symbols: Default::default(),
            agg_funs: Default::default(),
        };
        let symbols = validate(&prog).expect("validate");
        assert_eq!(symbols.get("r"), Some(&IdentKind::Stream));
    }
}
