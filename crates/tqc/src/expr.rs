use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Default bit width for integer values and variables in generated code.
pub const INT_WIDTH: u32 = 32;
/// Bit width for predicate variables.
pub const BOOL_WIDTH: u32 = 1;

/// Sentinel magnitude standing for the `infinity` literal of the query
/// language.
pub const INFINITY: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
}

impl BinOp {
    fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Shl => "<<",
        }
    }
}

/// Arithmetic expression over packet fields, states and function variables.
///
/// Identifiers carry an optional version number so that substitution passes
/// can distinguish successive definitions of the same name; `None` means the
/// identifier is unversioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Expr {
    Ident {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
    },
    Value {
        value: i64,
        width: u32,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    pub fn ident(name: impl Into<String>) -> Expr {
        Expr::Ident {
            name: name.into(),
            version: None,
        }
    }

    pub fn value(value: i64) -> Expr {
        Expr::Value {
            value,
            width: INT_WIDTH,
        }
    }

    pub fn infinity() -> Expr {
        Expr::value(INFINITY)
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Addition that folds constant operands.
    pub fn add(left: Expr, right: Expr) -> Expr {
        match (&left, &right) {
            (Expr::Value { value: a, .. }, Expr::Value { value: b, .. }) => {
                Expr::value(a.wrapping_add(*b))
            }
            (Expr::Value { value: 0, .. }, _) => right,
            (_, Expr::Value { value: 0, .. }) => left,
            _ => Expr::binary(BinOp::Add, left, right),
        }
    }

    /// Multiplication that folds constants and the 0/1 identities.
    pub fn mul(left: Expr, right: Expr) -> Expr {
        match (&left, &right) {
            (Expr::Value { value: a, .. }, Expr::Value { value: b, .. }) => {
                Expr::value(a.wrapping_mul(*b))
            }
            (Expr::Value { value: 1, .. }, _) => right,
            (_, Expr::Value { value: 1, .. }) => left,
            (Expr::Value { value: 0, .. }, _) | (_, Expr::Value { value: 0, .. }) => {
                Expr::value(0)
            }
            _ => Expr::binary(BinOp::Mul, left, right),
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Ident { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Set of identifier names used anywhere in the expression.
    pub fn used_idents(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Ident { name, .. } => {
                out.insert(name.clone());
            }
            Expr::Value { .. } => {}
            Expr::Binary { left, right, .. } => {
                left.collect_idents(out);
                right.collect_idents(out);
            }
        }
    }

    pub fn uses(&self, name: &str) -> bool {
        match self {
            Expr::Ident { name: n, .. } => n == name,
            Expr::Value { .. } => false,
            Expr::Binary { left, right, .. } => left.uses(name) || right.uses(name),
        }
    }

    /// Evaluate a constant expression. Returns `None` as soon as an
    /// identifier appears anywhere in the tree.
    pub fn const_value(&self) -> Option<i64> {
        match self {
            Expr::Ident { .. } => None,
            Expr::Value { value, .. } => Some(*value),
            Expr::Binary { op, left, right } => {
                let a = left.const_value()?;
                let b = right.const_value()?;
                match op {
                    BinOp::Add => Some(a.wrapping_add(b)),
                    BinOp::Sub => Some(a.wrapping_sub(b)),
                    BinOp::Mul => Some(a.wrapping_mul(b)),
                    BinOp::Div => (b != 0).then(|| a.wrapping_div(b)),
                    BinOp::Shl => Some(a.wrapping_shl(b as u32)),
                }
            }
        }
    }

    /// Whether the expression is affine in `v`, i.e. equivalent to
    /// `A*v + B` with `A` and `B` free of `v`.
    ///
    /// Deliberately incomplete: a multiplication contributes only when the
    /// side using `v` is `v` itself, so nested forms like `(c*v)*2` are not
    /// recognized. The linear-state rewriter depends on this bound staying
    /// where it is.
    pub fn is_affine(&self, v: &str) -> bool {
        self.affine_coefficients(v).is_some()
    }

    /// The `(A, B)` pair such that `self == A*v + B`, when the expression is
    /// recognized as affine in `v`.
    pub fn affine_coefficients(&self, v: &str) -> Option<(Expr, Expr)> {
        if !self.uses(v) {
            return Some((Expr::value(0), self.clone()));
        }
        match self {
            Expr::Ident { name, .. } if name == v => Some((Expr::value(1), Expr::value(0))),
            Expr::Binary { op, left, right } => match op {
                BinOp::Add => {
                    let (la, lb) = left.affine_coefficients(v)?;
                    let (ra, rb) = right.affine_coefficients(v)?;
                    Some((Expr::add(la, ra), Expr::add(lb, rb)))
                }
                BinOp::Sub => {
                    let (la, lb) = left.affine_coefficients(v)?;
                    let (ra, rb) = right.affine_coefficients(v)?;
                    Some((
                        Expr::binary(BinOp::Sub, la, ra),
                        Expr::binary(BinOp::Sub, lb, rb),
                    ))
                }
                BinOp::Mul => {
                    // One side must be the bare variable; the other must not
                    // use it at all.
                    if left.as_ident() == Some(v) && !right.uses(v) {
                        Some(((**right).clone(), Expr::value(0)))
                    } else if right.as_ident() == Some(v) && !left.uses(v) {
                        Some(((**left).clone(), Expr::value(0)))
                    } else {
                        None
                    }
                }
                BinOp::Div | BinOp::Shl => None,
            },
            _ => None,
        }
    }

    /// Rewrite every division by a constant power of two into a left-shift
    /// of the corresponding exponent. Any other divisor is fatal.
    pub fn transform_division(&self) -> Result<Expr> {
        match self {
            Expr::Ident { .. } | Expr::Value { .. } => Ok(self.clone()),
            Expr::Binary { op, left, right } => {
                let left = left.transform_division()?;
                let right = right.transform_division()?;
                if *op != BinOp::Div {
                    return Ok(Expr::binary(*op, left, right));
                }
                let divisor = right.const_value().ok_or_else(|| {
                    Error::new(
                        ErrorKind::Divisor,
                        format!("divisor must be a constant power of two, found {right}"),
                    )
                })?;
                match power_of_two_exponent(divisor) {
                    Some(k) => Ok(Expr::binary(BinOp::Shl, left, Expr::value(i64::from(k)))),
                    None => Err(Error::new(
                        ErrorKind::Divisor,
                        format!("divisor must be a constant power of two, found {divisor}"),
                    )),
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ident {
                name,
                version: Some(v),
            } => write!(f, "{name}_{v}"),
            Expr::Ident { name, .. } => write!(f, "{name}"),
            Expr::Value {
                value: INFINITY, ..
            } => write!(f, "infinity"),
            Expr::Value { value, .. } => write!(f, "{value}"),
            Expr::Binary { op, left, right } => {
                write!(f, "({left}){}({right})", op.as_str())
            }
        }
    }
}

fn power_of_two_exponent(v: i64) -> Option<u32> {
    let u = u64::try_from(v).ok()?;
    if u == 0 || (u & (u - 1)) != 0 {
        return None;
    }
    Some(u.trailing_zeros())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
}

impl CmpOp {
    fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
        }
    }
}

/// Boolean predicate over expressions. `Var` names a predicate bound to an
/// identifier defined elsewhere (a predicate variable in three-operand code,
/// or an operand stage's validity bit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Pred {
    True,
    False,
    Var { name: String },
    Cmp { op: CmpOp, left: Expr, right: Expr },
    And { left: Box<Pred>, right: Box<Pred> },
    Or { left: Box<Pred>, right: Box<Pred> },
    Not { inner: Box<Pred> },
}

impl Pred {
    pub fn var(name: impl Into<String>) -> Pred {
        Pred::Var { name: name.into() }
    }

    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Pred {
        Pred::Cmp { op, left, right }
    }

    /// Conjunction, simplified against the True/False identities so that
    /// trivial predicates never grow the tree.
    pub fn and(self, other: Pred) -> Pred {
        match (self, other) {
            (Pred::True, p) | (p, Pred::True) => p,
            (Pred::False, _) | (_, Pred::False) => Pred::False,
            (a, b) => Pred::And {
                left: Box::new(a),
                right: Box::new(b),
            },
        }
    }

    pub fn or(self, other: Pred) -> Pred {
        match (self, other) {
            (Pred::False, p) | (p, Pred::False) => p,
            (Pred::True, _) | (_, Pred::True) => Pred::True,
            (a, b) => Pred::Or {
                left: Box::new(a),
                right: Box::new(b),
            },
        }
    }

    pub fn not(self) -> Pred {
        match self {
            Pred::True => Pred::False,
            Pred::False => Pred::True,
            Pred::Not { inner } => *inner,
            p => Pred::Not { inner: Box::new(p) },
        }
    }

    pub fn used_idents(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents(&self, out: &mut BTreeSet<String>) {
        match self {
            Pred::True | Pred::False => {}
            Pred::Var { name } => {
                out.insert(name.clone());
            }
            Pred::Cmp { left, right, .. } => {
                left.collect_idents(out);
                right.collect_idents(out);
            }
            Pred::And { left, right } | Pred::Or { left, right } => {
                left.collect_idents(out);
                right.collect_idents(out);
            }
            Pred::Not { inner } => inner.collect_idents(out),
        }
    }

    pub fn transform_division(&self) -> Result<Pred> {
        Ok(match self {
            Pred::True | Pred::False | Pred::Var { .. } => self.clone(),
            Pred::Cmp { op, left, right } => Pred::Cmp {
                op: *op,
                left: left.transform_division()?,
                right: right.transform_division()?,
            },
            Pred::And { left, right } => Pred::And {
                left: Box::new(left.transform_division()?),
                right: Box::new(right.transform_division()?),
            },
            Pred::Or { left, right } => Pred::Or {
                left: Box::new(left.transform_division()?),
                right: Box::new(right.transform_division()?),
            },
            Pred::Not { inner } => Pred::Not {
                inner: Box::new(inner.transform_division()?),
            },
        })
    }
}

impl fmt::Display for Pred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pred::True => write!(f, "true"),
            Pred::False => write!(f, "false"),
            Pred::Var { name } => write!(f, "{name}"),
            Pred::Cmp { op, left, right } => {
                write!(f, "({left}) {} ({right})", op.as_str())
            }
            Pred::And { left, right } => write!(f, "({left}) && ({right})"),
            Pred::Or { left, right } => write!(f, "({left}) || ({right})"),
            Pred::Not { inner } => write!(f, "!({inner})"),
        }
    }
}
