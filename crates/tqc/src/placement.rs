//! Decides where in the network each query stage can run: the set of
//! switches serving it and whether its stream is confined to one switch.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::ast::{fields, OpKind, Program, Query, QueryOp, PKT_LOG};
use crate::error::{Error, ErrorKind, Result};
use crate::expr::{CmpOp, Expr, Pred};

/// Size of the configured switch universe, ids `0..NUM_SWITCHES`.
pub const NUM_SWITCHES: u32 = 20;

pub fn all_switches() -> BTreeSet<u32> {
    (0..NUM_SWITCHES).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    SingleSwitch,
    MultiSwitch,
}

/// Where a stream lives: the switches that can serve it, and whether each
/// tuple is confined to a single switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpLocation {
    pub switches: BTreeSet<u32>,
    pub granularity: Granularity,
}

impl Default for OpLocation {
    fn default() -> Self {
        OpLocation {
            switches: all_switches(),
            granularity: Granularity::MultiSwitch,
        }
    }
}

/// Annotated operator tree mirroring the query dependency structure, used
/// for placement reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedOp {
    pub opcode: OpKind,
    pub location: OpLocation,
    pub operands: Vec<LocatedOp>,
}

impl LocatedOp {
    fn edge_label(&self) -> String {
        let kind = match self.location.granularity {
            Granularity::SingleSwitch => "single-switch",
            Granularity::MultiSwitch => "multi-switch",
        };
        format!("{} switches; {kind}", self.location.switches.len())
    }

    /// Graphviz rendering of the placement tree, edges labelled with each
    /// operand's location.
    pub fn dot(&self) -> String {
        let mut next_id = 0u32;
        let mut out = String::from("digraph placement {\n");
        let root = self.dot_node(&mut next_id, &mut out);
        out.push_str(&format!(
            "  {root} -> OUTPUT [label=\"{}\"];\n}}\n",
            self.edge_label()
        ));
        out
    }

    fn dot_node(&self, next_id: &mut u32, out: &mut String) -> String {
        let label = format!("{}{}", self.opcode, *next_id);
        *next_id += 1;
        for operand in &self.operands {
            let child = operand.dot_node(next_id, out);
            out.push_str(&format!(
                "  {child} -> {label} [label=\"{}\"];\n",
                operand.edge_label()
            ));
        }
        label
    }
}

/// The switch set a filter predicate confines its stream to, considered in
/// isolation from the operand stream.
///
/// Only equality and inequality comparisons between the switch field and a
/// constant-valued expression are recognized. Anything else (ordering
/// comparisons, comparisons on other fields, predicate variables) defaults
/// to the full universe, which is sound: the stream is merely not confined.
pub fn pred_switch_set(pred: &Pred, universe: &BTreeSet<u32>) -> BTreeSet<u32> {
    match pred {
        Pred::True | Pred::Var { .. } => universe.clone(),
        Pred::False => BTreeSet::new(),
        Pred::Cmp { op, left, right } => match (op, switch_cmp_value(left, right)) {
            (CmpOp::Eq, Some(k)) => [k].into_iter().collect(),
            (CmpOp::Ne, Some(k)) => {
                let mut out = universe.clone();
                out.remove(&k);
                out
            }
            _ => universe.clone(),
        },
        Pred::And { left, right } => {
            let l = pred_switch_set(left, universe);
            let r = pred_switch_set(right, universe);
            l.intersection(&r).copied().collect()
        }
        Pred::Or { left, right } => {
            let l = pred_switch_set(left, universe);
            let r = pred_switch_set(right, universe);
            l.union(&r).copied().collect()
        }
        Pred::Not { inner } => {
            let inner_set = pred_switch_set(inner, universe);
            universe.difference(&inner_set).copied().collect()
        }
    }
}

/// For a comparison with the switch field on one side and a constant-valued
/// expression on the other (in either order), the constant's value.
fn switch_cmp_value(left: &Expr, right: &Expr) -> Option<u32> {
    let is_switch = |e: &Expr| e.as_ident() == Some(fields::SWITCH);
    let value = if is_switch(left) {
        right.const_value()
    } else if is_switch(right) {
        left.const_value()
    } else {
        None
    }?;
    u32::try_from(value).ok()
}

pub struct PlacementAnalyzer<'a> {
    program: &'a Program,
    universe: BTreeSet<u32>,
    memo: BTreeMap<String, LocatedOp>,
}

impl<'a> PlacementAnalyzer<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self::with_switches(program, NUM_SWITCHES)
    }

    pub fn with_switches(program: &'a Program, count: u32) -> Self {
        PlacementAnalyzer {
            program,
            universe: (0..count).collect(),
            memo: BTreeMap::new(),
        }
    }

    /// Analyze the program starting from its final result stream.
    pub fn analyze(mut self) -> Result<LocatedOp> {
        let last = self.program.last_assigned()?.to_string();
        self.visit_stream(&last, true)
    }

    fn visit_stream(&mut self, stream: &str, top_level: bool) -> Result<LocatedOp> {
        if stream == PKT_LOG {
            return Ok(LocatedOp {
                opcode: OpKind::Pktlog,
                location: OpLocation {
                    switches: self.universe.clone(),
                    granularity: Granularity::MultiSwitch,
                },
                operands: Vec::new(),
            });
        }
        if let Some(done) = self.memo.get(stream) {
            return Ok(done.clone());
        }
        let query = self.program.query(stream).ok_or_else(|| {
            Error::new(
                ErrorKind::UseBeforeDefine,
                format!("stream {stream} used without prior definition"),
            )
        })?;
        let located = self.visit_query(query, top_level)?;
        self.memo.insert(stream.to_string(), located.clone());
        Ok(located)
    }

    fn visit_query(&mut self, query: &Query, top_level: bool) -> Result<LocatedOp> {
        match &query.op {
            QueryOp::Filter { input, pred } => {
                let operand = self.visit_stream(input, false)?;
                let mut switches = pred_switch_set(pred, &self.universe);
                switches = switches
                    .intersection(&operand.location.switches)
                    .copied()
                    .collect();
                let granularity =
                    if operand.location.granularity == Granularity::SingleSwitch
                        || switches.len() <= 1
                    {
                        Granularity::SingleSwitch
                    } else {
                        Granularity::MultiSwitch
                    };
                Ok(LocatedOp {
                    opcode: OpKind::Filter,
                    location: OpLocation {
                        switches,
                        granularity,
                    },
                    operands: vec![operand],
                })
            }
            QueryOp::Map { input, .. } => {
                let operand = self.visit_stream(input, false)?;
                let location = operand.location.clone();
                Ok(LocatedOp {
                    opcode: OpKind::Project,
                    location,
                    operands: vec![operand],
                })
            }
            QueryOp::Groupby {
                input,
                keys,
                agg_func,
            } => {
                let operand = self.visit_stream(input, false)?;
                let per_switch = keys.iter().any(|k| k == fields::SWITCH);
                let per_packet = keys.iter().any(|k| k == fields::UID);
                let associative = self
                    .program
                    .agg_funs
                    .get(agg_func)
                    .map(|f| f.associative)
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "aggregation function {agg_func} has no recorded metadata"
                        ))
                    })?;
                let location = if per_switch
                    || operand.location.granularity == Granularity::SingleSwitch
                {
                    OpLocation {
                        switches: operand.location.switches.clone(),
                        granularity: Granularity::SingleSwitch,
                    }
                } else if per_packet || (associative && top_level) {
                    operand.location.clone()
                } else {
                    return Err(Error::new(
                        ErrorKind::Placement,
                        format!(
                            "cannot fold over multiple switches and multiple packets in query {query}"
                        ),
                    ));
                };
                Ok(LocatedOp {
                    opcode: OpKind::Groupby,
                    location,
                    operands: vec![operand],
                })
            }
            QueryOp::Zip { first, second } => {
                let left = self.visit_stream(first, false)?;
                let right = self.visit_stream(second, false)?;
                let switches = left
                    .location
                    .switches
                    .intersection(&right.location.switches)
                    .copied()
                    .collect();
                let granularity = if left.location.granularity == right.location.granularity {
                    left.location.granularity
                } else {
                    Granularity::SingleSwitch
                };
                Ok(LocatedOp {
                    opcode: OpKind::Join,
                    location: OpLocation {
                        switches,
                        granularity,
                    },
                    operands: vec![left, right],
                })
            }
        }
    }
}
