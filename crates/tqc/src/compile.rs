//! The compile driver: runs every pass in order over one program and
//! produces the assembled pipeline plus the analysis reports.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::ast::{dep_table, AggFunDef, FunStmt, IdentKind, Operation, Program, QueryOp};
use crate::error::Result;
use crate::flatten::{flatten_fun, IdGen};
use crate::history::{FunHistory, HistoryAnalyzer};
use crate::linear::rewrite_fun;
use crate::pipeline::{PipeAssembler, PipeStage};
use crate::placement::{LocatedOp, PlacementAnalyzer, NUM_SWITCHES};
use crate::validate::validate;

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Size of the switch universe, ids `0..switch_count`.
    pub switch_count: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            switch_count: NUM_SWITCHES,
        }
    }
}

/// Converged history bounds and iteration counts, per aggregation
/// function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryReport {
    pub funs: BTreeMap<String, FunHistory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompileOutput {
    pub stages: Vec<PipeStage>,
    pub placement: LocatedOp,
    pub history: HistoryReport,
    pub symbols: BTreeMap<String, IdentKind>,
    /// Stream dependency graph the stages were ordered by.
    pub deps: BTreeMap<String, Operation>,
}

/// Compile one program end to end: validate, place, flatten, analyze
/// history, rewrite linear state, and assemble the pipeline.
pub fn compile(program: &Program, options: &CompileOptions) -> Result<CompileOutput> {
    let symbols = validate(program)?;
    let program = transform_divisions(program)?;
    let placement =
        PlacementAnalyzer::with_switches(&program, options.switch_count).analyze()?;

    let mut idgen = IdGen::new();
    let mut folds = BTreeMap::new();
    let mut history = BTreeMap::new();
    for (name, fun) in &program.agg_funs {
        let code = flatten_fun(fun, &mut idgen)?;
        let bounds = HistoryAnalyzer::new(name, fun, &code).analyze()?;
        folds.insert(name.clone(), rewrite_fun(fun, &code, &bounds));
        history.insert(name.clone(), bounds);
    }

    let stages = PipeAssembler::new(&program, &folds).assemble()?;
    Ok(CompileOutput {
        stages,
        placement,
        history: HistoryReport { funs: history },
        symbols,
        deps: dep_table(&program),
    })
}

/// Rewrite every division by a constant power of two into a shift, across
/// query operators and aggregation-function bodies. Any other divisor is
/// fatal.
fn transform_divisions(program: &Program) -> Result<Program> {
    let mut out = program.clone();
    for query in &mut out.queries {
        match &mut query.op {
            QueryOp::Filter { pred, .. } => *pred = pred.transform_division()?,
            QueryOp::Map { exprs, .. } => {
                for expr in exprs.iter_mut() {
                    *expr = expr.transform_division()?;
                }
            }
            QueryOp::Groupby { .. } | QueryOp::Zip { .. } => {}
        }
    }
    for fun in out.agg_funs.values_mut() {
        transform_fun_divisions(fun)?;
    }
    Ok(out)
}

fn transform_fun_divisions(fun: &mut AggFunDef) -> Result<()> {
    fn walk(stmts: &mut [FunStmt]) -> Result<()> {
        for stmt in stmts {
            match stmt {
                FunStmt::Assign { expr, .. } => *expr = expr.transform_division()?,
                FunStmt::If {
                    pred,
                    then_branch,
                    else_branch,
                } => {
                    *pred = pred.transform_division()?;
                    walk(then_branch)?;
                    walk(else_branch)?;
                }
                FunStmt::Emit => {}
            }
        }
        Ok(())
    }
    walk(&mut fun.body)
}
