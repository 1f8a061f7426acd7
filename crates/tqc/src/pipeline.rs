//! Stitches per-query stages into an ordered pipeline: schema checking,
//! stage code generation, and result-validity injection.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::{packet_log_fields, OpKind, Program, Query, QueryOp, PKT_LOG};
use crate::error::{Error, ErrorKind, Result};
use crate::expr::{Expr, Pred, BOOL_WIDTH};
use crate::flatten::{ThreeOpCode, ThreeOpDecl, ThreeOpStmt};
use crate::linear::LinearResult;

/// Role of one identifier inside a stage, for renderers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Field,
    State,
    FnVar,
    PredVar,
}

/// Declarative part of a stage's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Filter {
        pred: Pred,
    },
    Map {
        cols: Vec<String>,
        exprs: Vec<Expr>,
    },
    Fold {
        agg_fun: String,
        keys: Vec<String>,
        states: Vec<String>,
        fields: Vec<String>,
        inits: BTreeMap<String, i64>,
    },
    Zip,
}

/// One fully configured pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipeStage {
    pub name: String,
    pub op: OpKind,
    pub config: StageConfig,
    pub code: ThreeOpCode,
    /// Input fields the stage reads.
    pub reads: BTreeSet<String>,
    /// Fields the stage itself sets.
    pub sets: BTreeSet<String>,
    /// Output schema visible to downstream stages.
    pub schema: BTreeSet<String>,
    pub symtab: BTreeMap<String, VarKind>,
}

/// The variable carrying a stage's result validity, readable downstream.
pub fn valid_var(stream: &str) -> String {
    format!("{stream}_valid")
}

pub struct PipeAssembler<'a> {
    program: &'a Program,
    /// Rewritten aggregation-function code, keyed by function name.
    folds: &'a BTreeMap<String, LinearResult>,
    stages: Vec<PipeStage>,
    schemas: BTreeMap<String, BTreeSet<String>>,
}

impl<'a> PipeAssembler<'a> {
    pub fn new(program: &'a Program, folds: &'a BTreeMap<String, LinearResult>) -> Self {
        PipeAssembler {
            program,
            folds,
            stages: Vec::new(),
            schemas: BTreeMap::new(),
        }
    }

    /// Assemble the ordered stage list, operands before their consumers.
    pub fn assemble(mut self) -> Result<Vec<PipeStage>> {
        let last = self.program.last_assigned()?.to_string();
        self.visit(&last)?;
        Ok(self.stages)
    }

    fn visit(&mut self, stream: &str) -> Result<BTreeSet<String>> {
        if stream == PKT_LOG {
            return Ok(packet_log_fields());
        }
        if let Some(schema) = self.schemas.get(stream) {
            return Ok(schema.clone());
        }
        let program = self.program;
        let query = program.query(stream).ok_or_else(|| {
            Error::new(
                ErrorKind::UseBeforeDefine,
                format!("stream {stream} used without prior definition"),
            )
        })?;
        let mut available = BTreeSet::new();
        let mut operand_valids = Vec::new();
        for operand in query.op.operands() {
            available.extend(self.visit(operand)?);
            if operand != PKT_LOG {
                operand_valids.push(valid_var(operand));
            }
        }
        let stage = self.build_stage(query, &available, &operand_valids)?;
        self.schemas
            .insert(stream.to_string(), stage.schema.clone());
        self.stages.push(stage);
        Ok(self.schemas[stream].clone())
    }

    /// Conjunction of the operand validity variables; true when every
    /// operand is the packet log.
    fn operands_valid(operand_valids: &[String]) -> Pred {
        operand_valids
            .iter()
            .fold(Pred::True, |acc, v| acc.and(Pred::var(v)))
    }

    fn check_schema(
        query: &Query,
        reads: &BTreeSet<String>,
        available: &BTreeSet<String>,
    ) -> Result<()> {
        let missing: Vec<&str> = reads
            .difference(available)
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::Schema,
                format!(
                    "fields [{}] not available to query {}: {query}",
                    missing.join(", "),
                    query.name
                ),
            ))
        }
    }

    fn build_stage(
        &self,
        query: &Query,
        available: &BTreeSet<String>,
        operand_valids: &[String],
    ) -> Result<PipeStage> {
        let self_valid = valid_var(&query.name);
        let operands_valid = Self::operands_valid(operand_valids);
        let mut symtab: BTreeMap<String, VarKind> = BTreeMap::new();
        for v in operand_valids {
            symtab.insert(v.clone(), VarKind::PredVar);
        }
        symtab.insert(self_valid.clone(), VarKind::PredVar);
        let mut code = ThreeOpCode::default();
        code.decls.push(ThreeOpDecl {
            width: BOOL_WIDTH,
            id: self_valid.clone(),
        });

        match &query.op {
            QueryOp::Filter { pred, .. } => {
                let reads = pred.used_idents();
                Self::check_schema(query, &reads, available)?;
                for f in &reads {
                    symtab.insert(f.clone(), VarKind::Field);
                }
                // The result is valid where the predicate holds on a valid
                // operand row.
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: self_valid,
                    pred: operands_valid.and(pred.clone()),
                });
                Ok(PipeStage {
                    name: query.name.clone(),
                    op: OpKind::Filter,
                    config: StageConfig::Filter { pred: pred.clone() },
                    code,
                    reads,
                    sets: BTreeSet::new(),
                    schema: available.clone(),
                    symtab,
                })
            }
            QueryOp::Map { cols, exprs, .. } => {
                let mut reads = BTreeSet::new();
                for expr in exprs {
                    reads.extend(expr.used_idents());
                }
                Self::check_schema(query, &reads, available)?;
                for f in reads.iter().chain(cols.iter()) {
                    symtab.insert(f.clone(), VarKind::Field);
                }
                for (col, expr) in cols.iter().zip(exprs.iter()) {
                    code.stmts.push(ThreeOpStmt::ExprAssign {
                        result: col.clone(),
                        expr: expr.clone(),
                    });
                }
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: self_valid,
                    pred: operands_valid,
                });
                let sets: BTreeSet<String> = cols.iter().cloned().collect();
                let schema: BTreeSet<String> =
                    available.union(&sets).cloned().collect();
                Ok(PipeStage {
                    name: query.name.clone(),
                    op: OpKind::Project,
                    config: StageConfig::Map {
                        cols: cols.clone(),
                        exprs: exprs.clone(),
                    },
                    code,
                    reads,
                    sets,
                    schema,
                    symtab,
                })
            }
            QueryOp::Groupby { keys, agg_func, .. } => {
                let fun = self.program.agg_funs.get(agg_func).ok_or_else(|| {
                    Error::internal(format!(
                        "aggregation function {agg_func} missing at assembly"
                    ))
                })?;
                let fold = self.folds.get(agg_func).ok_or_else(|| {
                    Error::internal(format!(
                        "aggregation function {agg_func} has no generated code"
                    ))
                })?;
                let reads: BTreeSet<String> =
                    keys.iter().chain(fun.fields.iter()).cloned().collect();
                Self::check_schema(query, &reads, available)?;
                for f in &reads {
                    symtab.insert(f.clone(), VarKind::Field);
                }
                for s in &fold.states {
                    symtab.insert(s.clone(), VarKind::State);
                }
                let fold_code = fold.code.clone();
                for decl in &fold_code.decls {
                    let kind = if decl.width == BOOL_WIDTH {
                        VarKind::PredVar
                    } else {
                        VarKind::FnVar
                    };
                    symtab.entry(decl.id.clone()).or_insert(kind);
                }
                code = fold_code.ordered_merge(code);
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: self_valid,
                    pred: operands_valid,
                });
                // Downstream sees the grouping keys and the fold's state.
                let sets: BTreeSet<String> = keys
                    .iter()
                    .chain(fun.states.iter())
                    .cloned()
                    .collect();
                Ok(PipeStage {
                    name: query.name.clone(),
                    op: OpKind::Groupby,
                    config: StageConfig::Fold {
                        agg_fun: agg_func.clone(),
                        keys: keys.clone(),
                        states: fold.states.clone(),
                        fields: fun.fields.clone(),
                        inits: fold.inits.clone(),
                    },
                    code,
                    reads,
                    sets: sets.clone(),
                    schema: sets,
                    symtab,
                })
            }
            QueryOp::Zip { .. } => {
                code.stmts.push(ThreeOpStmt::PredAssign {
                    result: self_valid,
                    pred: operands_valid,
                });
                Ok(PipeStage {
                    name: query.name.clone(),
                    op: OpKind::Join,
                    config: StageConfig::Zip,
                    code,
                    reads: BTreeSet::new(),
                    sets: BTreeSet::new(),
                    schema: available.clone(),
                    symtab,
                })
            }
        }
    }
}
