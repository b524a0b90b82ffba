//! Symbolic expression trees for right-hand sides, parameter values, observers and
//! switch conditions.
//!
//! A [`Formula`] is a strict tree: every non-leaf node owns its children, so
//! `clone()` is a deep copy and [`Formula::simplify`] consumes the node and hands back
//! its replacement. Operations are spread over submodules, one per concern:
//!
//! - `evaluate`: numeric value, constness, `is_zero`
//! - `jacobian`: in-place forward-mode Jacobian accumulation
//! - `derivative`: closed-form partial derivatives
//! - `simplify`: constant folding and algebraic identities
//! - `dependencies`: reference binding, dependency extraction, index refresh, switch/restart times
//! - `emit`: text emission for the two code exporters

mod dependencies;
mod derivative;
pub mod emit;
mod evaluate;
mod jacobian;
pub mod parser;
mod simplify;
pub mod table;

use serde::{Deserialize, Serialize};

use crate::quantity::{QuantityId, QuantityReference};

pub use table::{TableFormula, ValuePoint};

/// Diagnostic identity of a formula; nodes created by transforms inherit it from their source.
pub type FormulaId = i64;

/// Whether terminal state reads apply the species scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleFactorMode {
    Use,
    Ignore,
}

/// Independent quantity of a symbolic derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerivativeTarget {
    /// State variable by ODE index.
    Variable(usize),
    /// Parameter by quantity id.
    Parameter(QuantityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryFunction {
    Neg,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
}

impl UnaryFunction {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryFunction::Neg => -x,
            UnaryFunction::Exp => x.exp(),
            UnaryFunction::Ln => x.ln(),
            UnaryFunction::Log10 => x.log10(),
            UnaryFunction::Sqrt => x.sqrt(),
            UnaryFunction::Abs => x.abs(),
            UnaryFunction::Sin => x.sin(),
            UnaryFunction::Cos => x.cos(),
            UnaryFunction::Tan => x.tan(),
            UnaryFunction::Asin => x.asin(),
            UnaryFunction::Acos => x.acos(),
            UnaryFunction::Atan => x.atan(),
            UnaryFunction::Sinh => x.sinh(),
            UnaryFunction::Cosh => x.cosh(),
            UnaryFunction::Tanh => x.tanh(),
        }
    }

    /// d/dx of the function at `x`.
    pub fn derivative_at(self, x: f64) -> f64 {
        match self {
            UnaryFunction::Neg => -1.0,
            UnaryFunction::Exp => x.exp(),
            UnaryFunction::Ln => 1.0 / x,
            UnaryFunction::Log10 => 1.0 / (x * std::f64::consts::LN_10),
            UnaryFunction::Sqrt => 0.5 / x.sqrt(),
            UnaryFunction::Abs => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryFunction::Sin => x.cos(),
            UnaryFunction::Cos => -x.sin(),
            UnaryFunction::Tan => 1.0 / (x.cos() * x.cos()),
            UnaryFunction::Asin => 1.0 / (1.0 - x * x).sqrt(),
            UnaryFunction::Acos => -1.0 / (1.0 - x * x).sqrt(),
            UnaryFunction::Atan => 1.0 / (1.0 + x * x),
            UnaryFunction::Sinh => x.cosh(),
            UnaryFunction::Cosh => x.sinh(),
            UnaryFunction::Tanh => 1.0 - x.tanh() * x.tanh(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryFunction::Neg => "-",
            UnaryFunction::Exp => "exp",
            UnaryFunction::Ln => "ln",
            UnaryFunction::Log10 => "log10",
            UnaryFunction::Sqrt => "sqrt",
            UnaryFunction::Abs => "abs",
            UnaryFunction::Sin => "sin",
            UnaryFunction::Cos => "cos",
            UnaryFunction::Tan => "tan",
            UnaryFunction::Asin => "asin",
            UnaryFunction::Acos => "acos",
            UnaryFunction::Atan => "atan",
            UnaryFunction::Sinh => "sinh",
            UnaryFunction::Cosh => "cosh",
            UnaryFunction::Tanh => "tanh",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let function = match name.to_ascii_lowercase().as_str() {
            "exp" => UnaryFunction::Exp,
            "ln" | "log" => UnaryFunction::Ln,
            "log10" => UnaryFunction::Log10,
            "sqrt" => UnaryFunction::Sqrt,
            "abs" => UnaryFunction::Abs,
            "sin" => UnaryFunction::Sin,
            "cos" => UnaryFunction::Cos,
            "tan" => UnaryFunction::Tan,
            "asin" => UnaryFunction::Asin,
            "acos" => UnaryFunction::Acos,
            "atan" => UnaryFunction::Atan,
            "sinh" => UnaryFunction::Sinh,
            "cosh" => UnaryFunction::Cosh,
            "tanh" => UnaryFunction::Tanh,
            _ => return None,
        };
        Some(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationalOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RelationalOp {
    pub fn compare(self, a: f64, b: f64) -> bool {
        match self {
            RelationalOp::Eq => a == b,
            RelationalOp::Neq => a != b,
            RelationalOp::Lt => a < b,
            RelationalOp::Le => a <= b,
            RelationalOp::Gt => a > b,
            RelationalOp::Ge => a >= b,
        }
    }
}

/// Direct read of a state-vector entry, `y[ode_index] * scale_factor`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRef {
    pub alias: String,
    /// Species slot in the quantity tables, once bound.
    pub(crate) species: Option<usize>,
    pub(crate) ode_index: Option<usize>,
    pub(crate) scale_factor: f64,
}

impl VariableRef {
    pub fn unresolved(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            species: None,
            ode_index: None,
            scale_factor: 1.0,
        }
    }

    /// A reference already bound to a state index, for systems assembled without a quantity table.
    pub fn bound(alias: impl Into<String>, ode_index: usize, scale_factor: f64) -> Self {
        Self {
            alias: alias.into(),
            species: None,
            ode_index: Some(ode_index),
            scale_factor,
        }
    }

    pub fn ode_index(&self) -> Option<usize> {
        self.ode_index
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Constant(f64),
    Time,
    /// Reference to any quantity, read through the quantity tables.
    Parameter(QuantityReference),
    Variable(VariableRef),
    Sum(Vec<Formula>),
    Diff(Box<Formula>, Box<Formula>),
    Product(Vec<Formula>),
    Div(Box<Formula>, Box<Formula>),
    Power(Box<Formula>, Box<Formula>),
    If {
        condition: Box<Formula>,
        then: Box<Formula>,
        otherwise: Box<Formula>,
    },
    Min(Box<Formula>, Box<Formula>),
    Max(Box<Formula>, Box<Formula>),
    Unary(UnaryFunction, Box<Formula>),
    Logical(LogicalOp, Vec<Formula>),
    Relational(RelationalOp, Box<Formula>, Box<Formula>),
    /// `factor * Π y[i] * sf_i`, the flattened mass-action term.
    SimpleProduct {
        factor: f64,
        variables: Vec<VariableRef>,
    },
    Table(TableFormula),
    /// Table read at `Time - offset`.
    TableWithOffset {
        table: TableFormula,
        offset: Box<Formula>,
    },
    /// Table read at the value of `argument` instead of time.
    TableWithArgument {
        table: TableFormula,
        argument: Box<Formula>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    id: FormulaId,
    node: Node,
}

impl Formula {
    pub fn new(node: Node) -> Self {
        Self { id: 0, node }
    }

    pub fn with_id(id: FormulaId, node: Node) -> Self {
        Self { id, node }
    }

    pub fn id(&self) -> FormulaId {
        self.id
    }

    /// Assigns `id` to this node and every descendant.
    pub fn set_id(&mut self, id: FormulaId) {
        self.id = id;
        self.for_each_child_mut(&mut |child| child.set_id(id));
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    pub fn constant(value: f64) -> Self {
        Formula::new(Node::Constant(value))
    }

    pub fn time() -> Self {
        Formula::new(Node::Time)
    }

    pub fn parameter(alias: impl Into<String>) -> Self {
        Formula::new(Node::Parameter(QuantityReference::unresolved(alias)))
    }

    pub fn variable(reference: VariableRef) -> Self {
        Formula::new(Node::Variable(reference))
    }

    pub fn sum(terms: Vec<Formula>) -> Self {
        Formula::new(Node::Sum(terms))
    }

    pub fn diff(a: Formula, b: Formula) -> Self {
        Formula::new(Node::Diff(Box::new(a), Box::new(b)))
    }

    pub fn product(factors: Vec<Formula>) -> Self {
        Formula::new(Node::Product(factors))
    }

    pub fn div(numerator: Formula, denominator: Formula) -> Self {
        Formula::new(Node::Div(Box::new(numerator), Box::new(denominator)))
    }

    pub fn power(base: Formula, exponent: Formula) -> Self {
        Formula::new(Node::Power(Box::new(base), Box::new(exponent)))
    }

    pub fn if_then_else(condition: Formula, then: Formula, otherwise: Formula) -> Self {
        Formula::new(Node::If {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    pub fn min(a: Formula, b: Formula) -> Self {
        Formula::new(Node::Min(Box::new(a), Box::new(b)))
    }

    pub fn max(a: Formula, b: Formula) -> Self {
        Formula::new(Node::Max(Box::new(a), Box::new(b)))
    }

    pub fn unary(function: UnaryFunction, arg: Formula) -> Self {
        Formula::new(Node::Unary(function, Box::new(arg)))
    }

    pub fn logical(op: LogicalOp, operands: Vec<Formula>) -> Self {
        Formula::new(Node::Logical(op, operands))
    }

    pub fn relational(op: RelationalOp, a: Formula, b: Formula) -> Self {
        Formula::new(Node::Relational(op, Box::new(a), Box::new(b)))
    }

    pub fn simple_product(factor: f64, variables: Vec<VariableRef>) -> Self {
        Formula::new(Node::SimpleProduct { factor, variables })
    }

    pub fn table(table: TableFormula) -> Self {
        Formula::new(Node::Table(table))
    }

    pub fn table_with_offset(table: TableFormula, offset: Formula) -> Self {
        Formula::new(Node::TableWithOffset {
            table,
            offset: Box::new(offset),
        })
    }

    pub fn table_with_argument(table: TableFormula, argument: Formula) -> Self {
        Formula::new(Node::TableWithArgument {
            table,
            argument: Box::new(argument),
        })
    }

    pub fn as_constant(&self) -> Option<f64> {
        match self.node {
            Node::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self.node, Node::Table(_))
    }

    /// Wraps a freshly built node with this formula's id.
    pub(crate) fn derived(&self, node: Node) -> Formula {
        Formula::with_id(self.id, node)
    }

    pub(crate) fn for_each_child(&self, visit: &mut dyn FnMut(&Formula)) {
        match &self.node {
            Node::Constant(_)
            | Node::Time
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::SimpleProduct { .. }
            | Node::Table(_) => {}
            Node::Sum(children) | Node::Product(children) | Node::Logical(_, children) => {
                children.iter().for_each(|c| visit(c));
            }
            Node::Diff(a, b)
            | Node::Div(a, b)
            | Node::Power(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b)
            | Node::Relational(_, a, b) => {
                visit(a);
                visit(b);
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                visit(condition);
                visit(then);
                visit(otherwise);
            }
            Node::Unary(_, arg) => visit(arg),
            Node::TableWithOffset { offset: child, .. }
            | Node::TableWithArgument { argument: child, .. } => visit(child),
        }
    }

    pub(crate) fn for_each_child_mut(&mut self, visit: &mut dyn FnMut(&mut Formula)) {
        match &mut self.node {
            Node::Constant(_)
            | Node::Time
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::SimpleProduct { .. }
            | Node::Table(_) => {}
            Node::Sum(children) | Node::Product(children) | Node::Logical(_, children) => {
                children.iter_mut().for_each(|c| visit(c));
            }
            Node::Diff(a, b)
            | Node::Div(a, b)
            | Node::Power(a, b)
            | Node::Min(a, b)
            | Node::Max(a, b)
            | Node::Relational(_, a, b) => {
                visit(a);
                visit(b);
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                visit(condition);
                visit(then);
                visit(otherwise);
            }
            Node::Unary(_, arg) => visit(arg),
            Node::TableWithOffset { offset: child, .. }
            | Node::TableWithArgument { argument: child, .. } => visit(child),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::quantity::Quantities;

    /// `y[index]` with unit scale factor.
    pub fn var(index: usize) -> Formula {
        Formula::variable(VariableRef::bound(format!("y{index}"), index, 1.0))
    }

    pub fn scaled_var(index: usize, scale_factor: f64) -> Formula {
        Formula::variable(VariableRef::bound(format!("y{index}"), index, scale_factor))
    }

    pub fn c(value: f64) -> Formula {
        Formula::constant(value)
    }

    pub fn empty() -> Quantities {
        Quantities::default()
    }
}
