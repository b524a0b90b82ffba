use super::{Formula, LogicalOp, Node, ScaleFactorMode, VariableRef};
use crate::error::{Result, SimulationError};
use crate::quantity::{read_state, Quantities};

fn truth(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

impl VariableRef {
    pub(crate) fn read(&self, y: &[f64], mode: ScaleFactorMode, formula_id: i64) -> Result<f64> {
        let index = self.ode_index.ok_or_else(|| {
            SimulationError::configuration(
                formula_id,
                format!("Variable '{}' has no ODE index", self.alias),
            )
        })?;
        let value = read_state(y, index, formula_id)?;
        Ok(match mode {
            ScaleFactorMode::Use => value * self.scale_factor,
            ScaleFactorMode::Ignore => value,
        })
    }
}

impl Formula {
    /// Evaluates the tree at state `y` and time `time`.
    ///
    /// Relational and logical nodes yield 1.0 or 0.0, and NaN as soon as any operand is NaN.
    pub fn evaluate(
        &self,
        quantities: &Quantities,
        y: &[f64],
        time: f64,
        mode: ScaleFactorMode,
    ) -> Result<f64> {
        let eval = |f: &Formula| f.evaluate(quantities, y, time, mode);
        let value = match &self.node {
            Node::Constant(value) => *value,
            Node::Time => time,
            Node::Parameter(reference) => quantities.value_of(reference, self.id, y, time, mode)?,
            Node::Variable(variable) => variable.read(y, mode, self.id)?,
            Node::Sum(terms) => {
                let mut sum = 0.0;
                for term in terms {
                    sum += eval(term)?;
                }
                sum
            }
            Node::Diff(a, b) => eval(a)? - eval(b)?,
            Node::Product(factors) => {
                let mut product = 1.0;
                for factor in factors {
                    product *= eval(factor)?;
                }
                product
            }
            Node::Div(numerator, denominator) => eval(numerator)? / eval(denominator)?,
            Node::Power(base, exponent) => eval(base)?.powf(eval(exponent)?),
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                let c = eval(condition)?;
                if c.is_nan() {
                    f64::NAN
                } else if c == 1.0 {
                    eval(then)?
                } else {
                    eval(otherwise)?
                }
            }
            Node::Min(a, b) => {
                let (a, b) = (eval(a)?, eval(b)?);
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.min(b)
                }
            }
            Node::Max(a, b) => {
                let (a, b) = (eval(a)?, eval(b)?);
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    a.max(b)
                }
            }
            Node::Unary(function, arg) => function.apply(eval(arg)?),
            Node::Logical(op, operands) => {
                let mut values = Vec::with_capacity(operands.len());
                for operand in operands {
                    values.push(eval(operand)?);
                }
                if values.iter().any(|v| v.is_nan()) {
                    f64::NAN
                } else {
                    match op {
                        LogicalOp::And => truth(values.iter().all(|v| *v != 0.0)),
                        LogicalOp::Or => truth(values.iter().any(|v| *v != 0.0)),
                        LogicalOp::Not => match values.as_slice() {
                            [single] => truth(*single == 0.0),
                            _ => {
                                return Err(SimulationError::configuration(
                                    self.id,
                                    "Not expects exactly one operand",
                                ))
                            }
                        },
                    }
                }
            }
            Node::Relational(op, a, b) => {
                let (a, b) = (eval(a)?, eval(b)?);
                if a.is_nan() || b.is_nan() {
                    f64::NAN
                } else {
                    truth(op.compare(a, b))
                }
            }
            Node::SimpleProduct { factor, variables } => {
                let mut product = *factor;
                for variable in variables {
                    product *= variable.read(y, mode, self.id)?;
                }
                product
            }
            Node::Table(table) => table.value(time),
            Node::TableWithOffset { table, offset } => table.value(time - eval(offset)?),
            Node::TableWithArgument { table, argument } => table.value(eval(argument)?),
        };
        Ok(value)
    }

    /// Whether the value cannot change, globally or within the current run.
    pub fn is_constant(&self, quantities: &Quantities, for_current_run_only: bool) -> bool {
        match &self.node {
            Node::Constant(_) => true,
            Node::Time | Node::Variable(_) => false,
            Node::Parameter(reference) => quantities.is_constant(reference, for_current_run_only),
            Node::SimpleProduct { factor, variables } => variables.is_empty() || *factor == 0.0,
            Node::Table(table) | Node::TableWithOffset { table, .. } => table.is_constant(),
            Node::TableWithArgument { table, argument } => {
                table.is_constant() || argument.is_constant(quantities, for_current_run_only)
            }
            _ => {
                let mut constant = true;
                self.for_each_child(&mut |child| {
                    constant = constant && child.is_constant(quantities, for_current_run_only);
                });
                constant
            }
        }
    }

    /// Conservative: true only if the value is provably always exactly zero.
    pub fn is_zero(&self, quantities: &Quantities) -> bool {
        match &self.node {
            Node::Constant(value) => *value == 0.0,
            Node::Time | Node::Variable(_) => false,
            Node::Product(factors) => factors.iter().any(|f| f.is_zero(quantities)),
            Node::SimpleProduct { factor, .. } => *factor == 0.0,
            Node::Sum(terms) => terms.iter().all(|t| t.is_zero(quantities)),
            Node::Diff(a, b) => a.is_zero(quantities) && b.is_zero(quantities),
            Node::Div(numerator, _) => numerator.is_zero(quantities),
            Node::Logical(LogicalOp::And, operands) => operands.iter().any(|o| o.is_zero(quantities)),
            _ => {
                self.is_constant(quantities, false)
                    && matches!(self.evaluate(quantities, &[], 0.0, ScaleFactorMode::Use), Ok(v) if v == 0.0)
            }
        }
    }

    /// True for the independent variable itself.
    pub fn is_time(&self) -> bool {
        match &self.node {
            Node::Time => true,
            Node::Parameter(reference) => reference.is_time(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{RelationalOp, UnaryFunction, VariableRef};
    use super::*;
    use crate::formula::TableFormula;
    use crate::formula::ValuePoint;

    fn eval(f: &Formula, y: &[f64], t: f64) -> f64 {
        f.evaluate(&empty(), y, t, ScaleFactorMode::Use).unwrap()
    }

    #[test]
    fn arithmetic_nodes_evaluate() {
        let y = [2.0, 3.0];
        let f = Formula::sum(vec![
            Formula::product(vec![var(0), var(1)]),
            Formula::div(var(1), var(0)),
            Formula::diff(c(1.0), Formula::power(var(0), c(3.0))),
        ]);
        assert_eq!(eval(&f, &y, 0.0), 6.0 + 1.5 + (1.0 - 8.0));
        assert_eq!(eval(&Formula::time(), &y, 4.5), 4.5);
        assert_eq!(eval(&Formula::unary(UnaryFunction::Neg, var(1)), &y, 0.0), -3.0);
    }

    #[test]
    fn scale_factor_mode_controls_state_reads() {
        let f = scaled_var(0, 10.0);
        let y = [0.25];
        assert_eq!(eval(&f, &y, 0.0), 2.5);
        assert_eq!(
            f.evaluate(&empty(), &y, 0.0, ScaleFactorMode::Ignore).unwrap(),
            0.25
        );
        let product = Formula::simple_product(
            2.0,
            vec![
                VariableRef::bound("a", 0, 10.0),
                VariableRef::bound("b", 1, 0.5),
            ],
        );
        assert_eq!(eval(&product, &[1.0, 4.0], 0.0), 2.0 * 10.0 * 2.0);
    }

    #[test]
    fn relational_and_logical_nodes_propagate_nan() {
        let nan = c(f64::NAN);
        let lt = Formula::relational(RelationalOp::Lt, nan.clone(), c(1.0));
        assert!(eval(&lt, &[], 0.0).is_nan());
        let and = Formula::logical(LogicalOp::And, vec![c(0.0), nan.clone()]);
        assert!(eval(&and, &[], 0.0).is_nan());
        let not = Formula::logical(LogicalOp::Not, vec![nan.clone()]);
        assert!(eval(&not, &[], 0.0).is_nan());
        let branch = Formula::if_then_else(nan.clone(), c(1.0), c(2.0));
        assert!(eval(&branch, &[], 0.0).is_nan());
        assert!(eval(&Formula::min(nan.clone(), c(0.0)), &[], 0.0).is_nan());
        assert!(eval(&Formula::max(c(0.0), nan), &[], 0.0).is_nan());
    }

    #[test]
    fn relational_and_logical_nodes_yield_truth_values() {
        let t_ge_5 = Formula::relational(RelationalOp::Ge, Formula::time(), c(5.0));
        assert_eq!(eval(&t_ge_5, &[], 4.0), 0.0);
        assert_eq!(eval(&t_ge_5, &[], 5.0), 1.0);
        let or = Formula::logical(LogicalOp::Or, vec![c(0.0), t_ge_5.clone()]);
        assert_eq!(eval(&or, &[], 6.0), 1.0);
        let not = Formula::logical(LogicalOp::Not, vec![t_ge_5]);
        assert_eq!(eval(&not, &[], 6.0), 0.0);
        let neq = Formula::relational(RelationalOp::Neq, c(1.0), c(2.0));
        assert_eq!(eval(&neq, &[], 0.0), 1.0);
    }

    #[test]
    fn if_min_max_select_operands() {
        let f = Formula::if_then_else(
            Formula::relational(RelationalOp::Gt, var(0), c(1.0)),
            Formula::min(var(0), c(3.0)),
            Formula::max(var(0), c(-1.0)),
        );
        assert_eq!(eval(&f, &[5.0], 0.0), 3.0);
        assert_eq!(eval(&f, &[-4.0], 0.0), -1.0);
    }

    #[test]
    fn missing_ode_index_is_configuration_error() {
        let mut f = Formula::variable(VariableRef::unresolved("A"));
        f.set_id(12);
        let err = f
            .evaluate(&empty(), &[1.0], 0.0, ScaleFactorMode::Use)
            .expect_err("unbound variable");
        assert!(err.to_string().contains("Formula 12"));
        assert!(err.to_string().contains("'A'"));
    }

    #[test]
    fn is_zero_is_conservative() {
        assert!(c(0.0).is_zero(&empty()));
        assert!(Formula::product(vec![var(0), c(0.0)]).is_zero(&empty()));
        assert!(Formula::div(c(0.0), var(0)).is_zero(&empty()));
        assert!(!Formula::sum(vec![var(0), c(0.0)]).is_zero(&empty()));
        assert!(!Formula::diff(c(2.0), c(2.0)).is_zero(&empty()));
        assert!(Formula::power(c(0.0), c(2.0)).is_zero(&empty()));
        assert!(!var(0).is_zero(&empty()));
    }

    #[test]
    fn constness_follows_children() {
        assert!(Formula::sum(vec![c(1.0), c(2.0)]).is_constant(&empty(), false));
        assert!(!Formula::sum(vec![c(1.0), var(0)]).is_constant(&empty(), false));
        assert!(!Formula::time().is_constant(&empty(), true));
        let flat = TableFormula::new(
            vec![ValuePoint::new(0.0, 2.0), ValuePoint::new(1.0, 2.0)],
            false,
        )
        .unwrap();
        assert!(Formula::table(flat).is_constant(&empty(), false));
    }

    #[test]
    fn if_takes_then_branch_only_for_exact_truth() {
        assert_eq!(eval(&Formula::if_then_else(c(1.0), c(10.0), c(20.0)), &[], 0.0), 10.0);
        assert_eq!(eval(&Formula::if_then_else(c(2.0), c(10.0), c(20.0)), &[], 0.0), 20.0);
        assert_eq!(eval(&Formula::if_then_else(c(0.5), c(10.0), c(20.0)), &[], 0.0), 20.0);
        assert_eq!(eval(&Formula::if_then_else(var(0), c(10.0), c(20.0)), &[-1.0], 0.0), 20.0);
    }

    #[test]
    fn shifted_and_argument_tables_evaluate() {
        let table = TableFormula::new(
            vec![
                ValuePoint::new(0.0, 0.0),
                ValuePoint::new(2.0, 4.0),
                ValuePoint::new(4.0, 0.0),
            ],
            false,
        )
        .unwrap();
        let shifted = Formula::table_with_offset(table.clone(), c(1.0));
        assert_eq!(eval(&shifted, &[], 3.0), 4.0);
        assert_eq!(eval(&shifted, &[], 0.0), 0.0);

        let by_state = Formula::table_with_argument(table.clone(), var(0));
        assert_eq!(eval(&by_state, &[1.0], 100.0), 2.0);
        assert_eq!(eval(&by_state, &[3.0], 0.0), 2.0);
        assert!(!by_state.is_constant(&empty(), false));
        assert!(Formula::table_with_argument(table.clone(), c(1.0)).is_constant(&empty(), false));
        assert!(!shifted.is_constant(&empty(), false));
    }
}
