use serde_json::json;
use tqc::ast::{packet_log_fields, Program};
use tqc::compile::{compile, CompileOptions};
use tqc::error::ErrorKind;
use tqc::expr::{BinOp, Expr, Pred};
use tqc::flatten::ThreeOpStmt;
use tqc::history::MAX_PKT_HISTORY;
use tqc::pipeline::{valid_var, StageConfig};
use tqc::placement::Granularity;

fn program(doc: serde_json::Value) -> Program {
    serde_json::from_value(doc).expect("program document must parse")
}

fn byte_total_chain() -> Program {
    program(json!({
        "queries": [
            {
                "name": "heavy",
                "op": "filter",
                "input": "T",
                "pred": {
                    "kind": "cmp",
                    "op": "gt",
                    "left": {"kind": "ident", "name": "len"},
                    "right": {"kind": "value", "value": 100, "width": 32}
                }
            },
            {
                "name": "scaled",
                "op": "map",
                "input": "heavy",
                "cols": ["half_len"],
                "exprs": [{
                    "kind": "binary",
                    "op": "div",
                    "left": {"kind": "ident", "name": "len"},
                    "right": {"kind": "value", "value": 2, "width": 32}
                }]
            },
            {
                "name": "per_flow",
                "op": "groupby",
                "input": "scaled",
                "keys": ["switch", "srcip"],
                "agg_func": "total"
            }
        ],
        "agg_funs": {
            "total": {
                "states": ["bytes"],
                "fields": ["half_len"],
                "body": [
                    {
                        "kind": "assign",
                        "id": "bytes",
                        "expr": {
                            "kind": "binary",
                            "op": "add",
                            "left": {"kind": "ident", "name": "bytes"},
                            "right": {"kind": "ident", "name": "half_len"}
                        }
                    },
                    {"kind": "emit"}
                ]
            }
        }
    }))
}

#[test]
fn filter_map_fold_chain_assembles_ordered_stages() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");

    let names: Vec<&str> = out.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["heavy", "scaled", "per_flow"]);

    // Filter passes the packet schema through, map extends it, fold narrows
    // it to keys plus state.
    assert_eq!(out.stages[0].schema, packet_log_fields());
    let mut mapped = packet_log_fields();
    mapped.insert("half_len".to_string());
    assert_eq!(out.stages[1].schema, mapped);
    let fold_schema: Vec<&str> =
        out.stages[2].schema.iter().map(String::as_str).collect();
    assert_eq!(fold_schema, ["bytes", "srcip", "switch"]);
}

#[test]
fn map_division_by_two_is_compiled_to_a_shift() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");
    match &out.stages[1].config {
        StageConfig::Map { cols, exprs } => {
            assert_eq!(cols, &["half_len".to_string()]);
            assert!(
                matches!(&exprs[0], Expr::Binary { op: BinOp::Shl, .. }),
                "expected a shift, got {:?}",
                exprs[0]
            );
        }
        other => panic!("expected a map stage, got {other:?}"),
    }
}

#[test]
fn linear_fold_state_gains_accumulators_and_inits() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");
    match &out.stages[2].config {
        StageConfig::Fold { agg_fun, states, inits, .. } => {
            assert_eq!(agg_fun, "total");
            assert!(states.contains(&"bytes_mul".to_string()));
            assert!(states.contains(&"bytes_add".to_string()));
            assert_eq!(inits.get("bytes_mul"), Some(&1));
            assert_eq!(inits.get("bytes_add"), Some(&0));
        }
        other => panic!("expected a fold stage, got {other:?}"),
    }
}

#[test]
fn history_report_marks_the_running_sum_unbounded() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");
    let total = &out.history.funs["total"];
    assert_eq!(total.bounds.get("bytes"), Some(&MAX_PKT_HISTORY));
    assert!(total.iterations >= 2, "must run to a confirmed fixed point");
}

#[test]
fn validity_variables_chain_through_the_stages() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");

    // The filter reads the raw log, so its validity is the predicate alone.
    let heavy_pred = out.stages[0].code.stmts.iter().find_map(|s| match s {
        ThreeOpStmt::PredAssign { result, pred } if *result == valid_var("heavy") => {
            Some(pred.clone())
        }
        _ => None,
    });
    assert!(
        matches!(heavy_pred, Some(Pred::Cmp { .. })),
        "expected the bare filter predicate, got {heavy_pred:?}"
    );

    // Each later stage is valid exactly where its operand was.
    let scaled_pred = out.stages[1].code.stmts.iter().find_map(|s| match s {
        ThreeOpStmt::PredAssign { result, pred } if *result == valid_var("scaled") => {
            Some(pred.clone())
        }
        _ => None,
    });
    assert_eq!(scaled_pred, Some(Pred::var(valid_var("heavy"))));
}

#[test]
fn keyed_fold_over_switch_is_single_switch() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");
    assert_eq!(out.placement.location.granularity, Granularity::SingleSwitch);
}

#[test]
fn switch_filter_narrows_placement_to_one_switch() {
    let prog = program(json!({
        "queries": [{
            "name": "edge",
            "op": "filter",
            "input": "T",
            "pred": {
                "kind": "cmp",
                "op": "eq",
                "left": {"kind": "ident", "name": "switch"},
                "right": {"kind": "value", "value": 3, "width": 32}
            }
        }]
    }));
    let out = compile(&prog, &CompileOptions { switch_count: 8 }).expect("must compile");
    assert_eq!(
        out.placement.location.switches,
        [3].into_iter().collect()
    );
    assert_eq!(out.placement.location.granularity, Granularity::SingleSwitch);
    // The raw log below it still spans the whole universe.
    assert_eq!(out.placement.operands[0].location.switches.len(), 8);
}

#[test]
fn reading_an_absent_column_is_a_schema_error() {
    let prog = program(json!({
        "queries": [{
            "name": "bad",
            "op": "map",
            "input": "T",
            "cols": ["doubled"],
            "exprs": [{
                "kind": "binary",
                "op": "mul",
                "left": {"kind": "ident", "name": "ghost_col"},
                "right": {"kind": "value", "value": 2, "width": 32}
            }]
        }]
    }));
    let err = compile(&prog, &CompileOptions::default())
        .expect_err("must reject the unknown column");
    assert!(
        err.message.contains("ghost_col") && err.message.contains("bad"),
        "unexpected error message: {}",
        err.message
    );
}

#[test]
fn undefined_operand_stream_is_rejected() {
    let prog = program(json!({
        "queries": [{
            "name": "orphan",
            "op": "filter",
            "input": "nowhere",
            "pred": {"kind": "true"}
        }]
    }));
    let err = compile(&prog, &CompileOptions::default())
        .expect_err("must reject the undefined stream");
    assert_eq!(err.kind, ErrorKind::UseBeforeDefine);
    assert!(
        err.message.contains("nowhere"),
        "unexpected error message: {}",
        err.message
    );
}

#[test]
fn compile_output_serializes_to_json() {
    let out = compile(&byte_total_chain(), &CompileOptions::default())
        .expect("chain must compile");
    let doc = serde_json::to_value(&out).expect("output must serialize");
    let stages = doc["stages"].as_array().expect("stages array");
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[2]["name"], "per_flow");
    assert_eq!(doc["history"]["funs"]["total"]["bounds"]["bytes"], 100);
    assert_eq!(doc["deps"]["per_flow"]["opcode"], "groupby");
    assert_eq!(doc["deps"]["scaled"]["operands"][0], "heavy");
}
