use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::expr::{Expr, Pred};

/// Name of the raw packet log, the base stream every query chain bottoms
/// out in.
pub const PKT_LOG: &str = "T";

/// Fixed tuple of the packet log.
pub mod fields {
    pub const SWITCH: &str = "switch";
    pub const UID: &str = "uid";

    pub const ALL: &[&str] = &[
        SWITCH, UID, "srcip", "dstip", "srcport", "dstport", "proto", "inport", "outport", "len",
        "qid",
    ];
}

/// Output field set of the packet log.
pub fn packet_log_fields() -> BTreeSet<String> {
    fields::ALL.iter().map(|f| (*f).to_string()).collect()
}

/// Classification of every identifier in the program, as produced by the
/// external frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentKind {
    Stream,
    Column,
    State,
    StateOrColumn,
    AggFunc,
    Relation,
}

impl fmt::Display for IdentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentKind::Stream => "STREAM",
            IdentKind::Column => "COLUMN",
            IdentKind::State => "STATE",
            IdentKind::StateOrColumn => "STATE_OR_COLUMN",
            IdentKind::AggFunc => "AGG_FUNC",
            IdentKind::Relation => "RELATION",
        };
        f.write_str(s)
    }
}

/// One statement of an aggregation-function body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunStmt {
    Assign {
        id: String,
        expr: Expr,
    },
    If {
        pred: Pred,
        then_branch: Vec<FunStmt>,
        #[serde(default)]
        else_branch: Vec<FunStmt>,
    },
    Emit,
}

/// A user-defined fold: ordered state parameters, ordered per-packet field
/// parameters, an associativity annotation, and the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggFunDef {
    pub states: Vec<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub associative: bool,
    pub body: Vec<FunStmt>,
}

impl AggFunDef {
    /// Whether the body contains an emit anywhere, making the function a
    /// streaming fold whose states are readable as columns downstream.
    pub fn emits(&self) -> bool {
        fn any_emit(stmts: &[FunStmt]) -> bool {
            stmts.iter().any(|s| match s {
                FunStmt::Emit => true,
                FunStmt::If {
                    then_branch,
                    else_branch,
                    ..
                } => any_emit(then_branch) || any_emit(else_branch),
                FunStmt::Assign { .. } => false,
            })
        }
        any_emit(&self.body)
    }
}

/// One operator application binding a derived stream name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueryOp {
    Filter {
        input: String,
        pred: Pred,
    },
    Map {
        input: String,
        cols: Vec<String>,
        exprs: Vec<Expr>,
    },
    Groupby {
        input: String,
        keys: Vec<String>,
        agg_func: String,
    },
    Zip {
        first: String,
        second: String,
    },
}

impl QueryOp {
    pub fn operands(&self) -> Vec<&str> {
        match self {
            QueryOp::Filter { input, .. }
            | QueryOp::Map { input, .. }
            | QueryOp::Groupby { input, .. } => vec![input],
            QueryOp::Zip { first, second } => vec![first, second],
        }
    }

    pub fn opcode(&self) -> OpKind {
        match self {
            QueryOp::Filter { .. } => OpKind::Filter,
            QueryOp::Map { .. } => OpKind::Project,
            QueryOp::Groupby { .. } => OpKind::Groupby,
            QueryOp::Zip { .. } => OpKind::Join,
        }
    }
}

// Rendering of query text for error messages; kept close to the source
// syntax so diagnostics read like the program.
impl fmt::Display for QueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryOp::Filter { input, pred } => write!(f, "filter({input}, {pred})"),
            QueryOp::Map { input, cols, exprs } => {
                let pairs: Vec<String> = cols
                    .iter()
                    .zip(exprs.iter())
                    .map(|(c, e)| format!("{c} <- {e}"))
                    .collect();
                write!(f, "map({input}, [{}])", pairs.join(", "))
            }
            QueryOp::Groupby {
                input,
                keys,
                agg_func,
            } => write!(f, "groupby({input}, [{}], {agg_func})", keys.join(", ")),
            QueryOp::Zip { first, second } => write!(f, "zip({first}, {second})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: String,
    #[serde(flatten)]
    pub op: QueryOp,
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {};", self.name, self.op)
    }
}

/// The parsed program: queries in source order, the frontend's identifier
/// classification, and aggregation-function metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub queries: Vec<Query>,
    #[serde(default)]
    pub symbols: BTreeMap<String, IdentKind>,
    #[serde(default)]
    pub agg_funs: BTreeMap<String, AggFunDef>,
}

impl Program {
    /// Name of the stream bound last; the program's result.
    pub fn last_assigned(&self) -> Result<&str> {
        self.queries
            .last()
            .map(|q| q.name.as_str())
            .ok_or_else(|| Error::new(ErrorKind::Schema, "program defines no queries"))
    }

    pub fn query(&self, name: &str) -> Option<&Query> {
        self.queries.iter().find(|q| q.name == name)
    }
}

/// Operator kind in the stream dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Pktlog,
    Filter,
    Project,
    Groupby,
    Join,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Pktlog => "PKTLOG",
            OpKind::Filter => "FILTER",
            OpKind::Project => "PROJECT",
            OpKind::Groupby => "GROUPBY",
            OpKind::Join => "JOIN",
        };
        f.write_str(s)
    }
}

/// Dependency-table entry: which operator computes a stream, from which
/// operand streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    pub opcode: OpKind,
    pub operands: Vec<String>,
}

/// Build the stream-name to operation dependency table from the query list.
pub fn dep_table(program: &Program) -> BTreeMap<String, Operation> {
    let mut table = BTreeMap::new();
    for query in &program.queries {
        table.insert(
            query.name.clone(),
            Operation {
                opcode: query.op.opcode(),
                operands: query.op.operands().iter().map(|s| (*s).to_string()).collect(),
            },
        );
    }
    table
}
