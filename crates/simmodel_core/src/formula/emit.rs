//! Text emission of formulas for the Matlab and C++ code exporters.
//!
//! State reads become `y(i+1)` (Matlab, 1-based) or `y[i]` (C++); quantity references
//! are written by alias, time as `Time`. Compound nodes are parenthesized so that the
//! emitted text never depends on operator precedence of the target language.

use std::fmt::{self, Write};

use super::{Formula, LogicalOp, Node, RelationalOp, TableFormula, UnaryFunction, VariableRef};
use crate::quantity::RefTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeDialect {
    Matlab,
    Cpp,
}

impl CodeDialect {
    fn number(self, out: &mut dyn Write, value: f64) -> fmt::Result {
        match (self, value) {
            (CodeDialect::Matlab, v) if v.is_nan() => out.write_str("NaN"),
            (CodeDialect::Cpp, v) if v.is_nan() => out.write_str("NAN"),
            (CodeDialect::Matlab, v) if v.is_infinite() => {
                out.write_str(if v > 0.0 { "Inf" } else { "(-Inf)" })
            }
            (CodeDialect::Cpp, v) if v.is_infinite() => {
                out.write_str(if v > 0.0 { "INFINITY" } else { "(-INFINITY)" })
            }
            (_, v) if v < 0.0 => write!(out, "({v:?})"),
            (_, v) => write!(out, "{v:?}"),
        }
    }

    fn state(self, out: &mut dyn Write, variable: &VariableRef) -> fmt::Result {
        let Some(index) = variable.ode_index else {
            return out.write_str(&variable.alias);
        };
        let scaled = variable.scale_factor != 1.0;
        if scaled {
            out.write_char('(')?;
        }
        match self {
            CodeDialect::Matlab => write!(out, "y({})", index + 1)?,
            CodeDialect::Cpp => write!(out, "y[{index}]")?,
        }
        if scaled {
            out.write_char('*')?;
            self.number(out, variable.scale_factor)?;
            out.write_char(')')?;
        }
        Ok(())
    }

    fn relational(self, op: RelationalOp) -> &'static str {
        match (self, op) {
            (_, RelationalOp::Eq) => " == ",
            (CodeDialect::Matlab, RelationalOp::Neq) => " ~= ",
            (CodeDialect::Cpp, RelationalOp::Neq) => " != ",
            (_, RelationalOp::Lt) => " < ",
            (_, RelationalOp::Le) => " <= ",
            (_, RelationalOp::Gt) => " > ",
            (_, RelationalOp::Ge) => " >= ",
        }
    }

    fn logical(self, op: LogicalOp) -> &'static str {
        match (self, op) {
            (CodeDialect::Matlab, LogicalOp::And) => " & ",
            (CodeDialect::Matlab, LogicalOp::Or) => " | ",
            (CodeDialect::Matlab, LogicalOp::Not) => "~",
            (CodeDialect::Cpp, LogicalOp::And) => " && ",
            (CodeDialect::Cpp, LogicalOp::Or) => " || ",
            (CodeDialect::Cpp, LogicalOp::Not) => "!",
        }
    }
}

impl Formula {
    pub fn write_matlab_code(&self, out: &mut dyn Write) -> fmt::Result {
        self.write_code(out, CodeDialect::Matlab)
    }

    pub fn write_cpp_code(&self, out: &mut dyn Write) -> fmt::Result {
        self.write_code(out, CodeDialect::Cpp)
    }

    pub fn to_code(&self, dialect: CodeDialect) -> String {
        let mut text = String::new();
        // writing into a String cannot fail
        let _ = self.write_code(&mut text, dialect);
        text
    }

    pub fn write_code(&self, out: &mut dyn Write, dialect: CodeDialect) -> fmt::Result {
        let list = |out: &mut dyn Write, items: &[Formula], separator: &str| -> fmt::Result {
            out.write_char('(')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_str(separator)?;
                }
                item.write_code(out, dialect)?;
            }
            out.write_char(')')
        };
        let call = |out: &mut dyn Write, name: &str, args: &[&Formula]| -> fmt::Result {
            write!(out, "{name}(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                arg.write_code(out, dialect)?;
            }
            out.write_char(')')
        };
        let binary = |out: &mut dyn Write, a: &Formula, op: &str, b: &Formula| -> fmt::Result {
            out.write_char('(')?;
            a.write_code(out, dialect)?;
            out.write_str(op)?;
            b.write_code(out, dialect)?;
            out.write_char(')')
        };

        match &self.node {
            Node::Constant(value) => dialect.number(out, *value),
            Node::Time => out.write_str("Time"),
            Node::Parameter(reference) => match reference.target {
                RefTarget::Time => out.write_str("Time"),
                _ => out.write_str(&reference.alias),
            },
            Node::Variable(variable) => dialect.state(out, variable),
            Node::Sum(terms) if terms.is_empty() => out.write_char('0'),
            Node::Sum(terms) => list(out, terms, " + "),
            Node::Diff(a, b) => binary(out, &**a, " - ", &**b),
            Node::Product(factors) if factors.is_empty() => out.write_char('1'),
            Node::Product(factors) => list(out, factors, "*"),
            Node::Div(a, b) => binary(out, &**a, " / ", &**b),
            Node::Power(base, exponent) => match dialect {
                CodeDialect::Matlab => binary(out, &**base, "^", &**exponent),
                CodeDialect::Cpp => call(out, "pow", &[&**base, &**exponent]),
            },
            Node::If {
                condition,
                then,
                otherwise,
            } => match dialect {
                CodeDialect::Matlab => call(out, "IIf", &[&**condition, &**then, &**otherwise]),
                CodeDialect::Cpp => {
                    out.write_str("( ")?;
                    condition.write_code(out, dialect)?;
                    out.write_str(" ? ")?;
                    then.write_code(out, dialect)?;
                    out.write_str(" : ")?;
                    otherwise.write_code(out, dialect)?;
                    out.write_str(" )")
                }
            },
            Node::Min(a, b) => call(out, "min", &[&**a, &**b]),
            Node::Max(a, b) => call(out, "max", &[&**a, &**b]),
            Node::Unary(UnaryFunction::Neg, arg) => {
                out.write_str("(-")?;
                arg.write_code(out, dialect)?;
                out.write_char(')')
            }
            Node::Unary(function, arg) => {
                let name = match (dialect, function) {
                    (_, UnaryFunction::Ln) => "log",
                    (CodeDialect::Cpp, UnaryFunction::Abs) => "fabs",
                    (_, f) => f.name(),
                };
                call(out, name, &[&**arg])
            }
            Node::Logical(LogicalOp::Not, operands) => {
                out.write_char('(')?;
                out.write_str(dialect.logical(LogicalOp::Not))?;
                list(out, operands, "")?;
                out.write_char(')')
            }
            Node::Logical(op, operands) => list(out, operands, dialect.logical(*op)),
            Node::Relational(op, a, b) => binary(out, &**a, dialect.relational(*op), &**b),
            Node::SimpleProduct { factor, variables } => {
                out.write_char('(')?;
                dialect.number(out, *factor)?;
                for variable in variables {
                    out.write_char('*')?;
                    dialect.state(out, variable)?;
                }
                out.write_char(')')
            }
            Node::Table(table) => {
                write_table(out, dialect, table, &mut |out: &mut dyn Write| out.write_str("Time"))
            }
            Node::TableWithOffset { table, offset } => {
                write_table(out, dialect, table, &mut |out: &mut dyn Write| {
                    out.write_str("(Time - ")?;
                    offset.write_code(out, dialect)?;
                    out.write_char(')')
                })
            }
            Node::TableWithArgument { table, argument } => {
                write_table(out, dialect, table, &mut |out: &mut dyn Write| {
                    argument.write_code(out, dialect)
                })
            }
        }
    }
}

fn write_table(
    out: &mut dyn Write,
    dialect: CodeDialect,
    table: &TableFormula,
    x: &mut dyn FnMut(&mut dyn Write) -> fmt::Result,
) -> fmt::Result {
    let function = if table.use_derived_values() {
        "TableDerivative"
    } else {
        "Table"
    };
    write!(out, "{function}(")?;
    x(out)?;
    out.write_str(",[")?;
    for (i, point) in table.points().iter().enumerate() {
        if i > 0 {
            out.write_char(';')?;
        }
        dialect.number(out, point.x)?;
        out.write_char(',')?;
        dialect.number(out, point.y)?;
    }
    out.write_str("])")
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ValuePoint;
    use super::*;

    #[test]
    fn state_reads_follow_dialect_indexing() {
        let f = Formula::sum(vec![var(0), scaled_var(2, 10.0)]);
        assert_eq!(f.to_code(CodeDialect::Matlab), "(y(1) + (y(3)*10.0))");
        assert_eq!(f.to_code(CodeDialect::Cpp), "(y[0] + (y[2]*10.0))");
    }

    #[test]
    fn powers_conditions_and_comparisons() {
        let f = Formula::if_then_else(
            Formula::relational(RelationalOp::Neq, Formula::time(), c(2.0)),
            Formula::power(var(0), c(2.0)),
            c(-1.5),
        );
        assert_eq!(
            f.to_code(CodeDialect::Matlab),
            "IIf((Time ~= 2.0),(y(1)^2.0),(-1.5))"
        );
        assert_eq!(
            f.to_code(CodeDialect::Cpp),
            "( (Time != 2.0) ? pow(y[0],2.0) : (-1.5) )"
        );
    }

    #[test]
    fn logical_operators_and_functions() {
        let f = Formula::logical(
            LogicalOp::And,
            vec![
                Formula::logical(LogicalOp::Not, vec![var(0)]),
                Formula::relational(
                    RelationalOp::Lt,
                    Formula::unary(UnaryFunction::Abs, var(1)),
                    Formula::parameter("k"),
                ),
            ],
        );
        assert_eq!(f.to_code(CodeDialect::Matlab), "((~(y(1))) & (abs(y(2)) < k))");
        assert_eq!(f.to_code(CodeDialect::Cpp), "((!(y[0])) && (fabs(y[1]) < k))");
    }

    #[test]
    fn tables_write_the_position_they_read_at() {
        let table = TableFormula::new(
            vec![ValuePoint::new(0.0, 0.0), ValuePoint::new(1.0, 2.0)],
            false,
        )
        .unwrap();
        assert_eq!(
            Formula::table_with_offset(table.clone(), c(0.5)).to_code(CodeDialect::Matlab),
            "Table((Time - 0.5),[0.0,0.0;1.0,2.0])"
        );
        assert_eq!(
            Formula::table_with_argument(table, var(0)).to_code(CodeDialect::Cpp),
            "Table(y[0],[0.0,0.0;1.0,2.0])"
        );
    }
}
