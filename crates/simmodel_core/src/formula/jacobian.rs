use super::{Formula, Node, ScaleFactorMode};
use crate::error::{Result, SimulationError};
use crate::linalg::JacobianMatrix;
use crate::quantity::{Quantities, QuantityReference, RefTarget};

impl Formula {
    /// Adds `multiplier * d(self)/dy` into row `row` of `jac` by forward chain rule.
    ///
    /// Entries are with respect to the scaled state the integrator sees, so a variable
    /// contributes `multiplier * scale_factor`.
    #[allow(clippy::too_many_arguments)]
    pub fn accumulate_jacobian(
        &self,
        quantities: &Quantities,
        jac: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
        row: usize,
        multiplier: f64,
    ) -> Result<()> {
        if multiplier == 0.0 {
            return Ok(());
        }
        let eval = |f: &Formula| f.evaluate(quantities, y, time, ScaleFactorMode::Use);

        match &self.node {
            Node::Constant(_)
            | Node::Time
            | Node::Logical(..)
            | Node::Relational(..)
            | Node::Table(_) => Ok(()),
            Node::TableWithOffset { table, offset } => {
                let slope = table.slope_at(time - eval(offset)?);
                offset.accumulate_jacobian(quantities, jac, y, time, row, -multiplier * slope)
            }
            Node::TableWithArgument { table, argument } => {
                let slope = table.slope_at(eval(argument)?);
                argument.accumulate_jacobian(quantities, jac, y, time, row, multiplier * slope)
            }
            Node::Variable(variable) => {
                let index = variable.ode_index.ok_or_else(|| {
                    SimulationError::configuration(
                        self.id,
                        format!("Variable '{}' has no ODE index", variable.alias),
                    )
                })?;
                jac.add(row, index, multiplier * variable.scale_factor);
                Ok(())
            }
            Node::Parameter(reference) => {
                self.reference_jacobian(reference, quantities, jac, y, time, row, multiplier)
            }
            Node::Sum(terms) => {
                for term in terms {
                    term.accumulate_jacobian(quantities, jac, y, time, row, multiplier)?;
                }
                Ok(())
            }
            Node::Diff(a, b) => {
                a.accumulate_jacobian(quantities, jac, y, time, row, multiplier)?;
                b.accumulate_jacobian(quantities, jac, y, time, row, -multiplier)
            }
            Node::Product(factors) => {
                let mut values = Vec::with_capacity(factors.len());
                for factor in factors {
                    values.push(eval(factor)?);
                }
                for (i, factor) in factors.iter().enumerate() {
                    let co_product: f64 = values
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .map(|(_, v)| *v)
                        .product();
                    if co_product == 0.0 {
                        continue;
                    }
                    factor.accumulate_jacobian(
                        quantities,
                        jac,
                        y,
                        time,
                        row,
                        multiplier * co_product,
                    )?;
                }
                Ok(())
            }
            Node::Div(numerator, denominator) => {
                let num = eval(numerator)?;
                let den = eval(denominator)?;
                numerator.accumulate_jacobian(quantities, jac, y, time, row, multiplier / den)?;
                denominator.accumulate_jacobian(
                    quantities,
                    jac,
                    y,
                    time,
                    row,
                    multiplier * (-num / (den * den)),
                )
            }
            Node::Power(base, exponent) => {
                let b = eval(base)?;
                if b == 0.0 {
                    return Ok(());
                }
                let e = eval(exponent)?;
                base.accumulate_jacobian(
                    quantities,
                    jac,
                    y,
                    time,
                    row,
                    multiplier * e * b.powf(e - 1.0),
                )?;
                if exponent.as_constant().is_none() {
                    exponent.accumulate_jacobian(
                        quantities,
                        jac,
                        y,
                        time,
                        row,
                        multiplier * b.ln() * b.powf(e),
                    )?;
                }
                Ok(())
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                let c = eval(condition)?;
                if c.is_nan() {
                    Ok(())
                } else if c == 1.0 {
                    then.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
                } else {
                    otherwise.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
                }
            }
            Node::Min(a, b) => {
                let active = if eval(a)? <= eval(b)? { a } else { b };
                active.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
            }
            Node::Max(a, b) => {
                let active = if eval(a)? >= eval(b)? { a } else { b };
                active.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
            }
            Node::Unary(function, arg) => {
                let x = eval(arg)?;
                arg.accumulate_jacobian(
                    quantities,
                    jac,
                    y,
                    time,
                    row,
                    multiplier * function.derivative_at(x),
                )
            }
            Node::SimpleProduct { factor, variables } => {
                let mut values = Vec::with_capacity(variables.len());
                for variable in variables {
                    values.push(variable.read(y, ScaleFactorMode::Use, self.id)?);
                }
                for (i, variable) in variables.iter().enumerate() {
                    let co_product: f64 = factor
                        * values
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, v)| *v)
                            .product::<f64>();
                    if co_product == 0.0 {
                        continue;
                    }
                    if let Some(index) = variable.ode_index {
                        jac.add(row, index, multiplier * co_product * variable.scale_factor);
                    }
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reference_jacobian(
        &self,
        reference: &QuantityReference,
        quantities: &Quantities,
        jac: &mut dyn JacobianMatrix,
        y: &[f64],
        time: f64,
        row: usize,
        multiplier: f64,
    ) -> Result<()> {
        match reference.target {
            RefTarget::Unresolved => Err(SimulationError::configuration(
                self.id,
                format!("Reference '{}' is not resolved", reference.alias),
            )),
            RefTarget::Time => Ok(()),
            RefTarget::Parameter(slot) => match quantities.parameter(slot, self.id)?.core.formula() {
                Some(formula) => {
                    formula.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
                }
                None => Ok(()),
            },
            RefTarget::Species {
                slot,
                ode_index,
                scale_factor,
            } => {
                let dynamic = quantities
                    .species
                    .get(slot)
                    .map(|s| !s.is_constant_during_calculation())
                    .unwrap_or(false);
                if let (Some(index), true) = (ode_index, dynamic) {
                    jac.add(row, index, multiplier * scale_factor);
                }
                Ok(())
            }
            RefTarget::Observer(slot) => {
                match quantities.observers.get(slot).and_then(|o| o.core.formula()) {
                    Some(formula) => {
                        formula.accumulate_jacobian(quantities, jac, y, time, row, multiplier)
                    }
                    None => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{RelationalOp, UnaryFunction, VariableRef};
    use super::*;
    use crate::formula::{TableFormula, ValuePoint};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn jacobian_row(f: &Formula, y: &[f64]) -> Vec<f64> {
        let mut jac = DMatrix::<f64>::zeros(y.len(), y.len());
        f.accumulate_jacobian(&empty(), &mut jac, y, 0.0, 0, 1.0)
            .unwrap();
        jac.row(0).iter().copied().collect()
    }

    fn finite_difference_row(f: &Formula, y: &[f64]) -> Vec<f64> {
        let h = 1e-7;
        (0..y.len())
            .map(|j| {
                let mut plus = y.to_vec();
                let mut minus = y.to_vec();
                plus[j] += h;
                minus[j] -= h;
                let fp = f.evaluate(&empty(), &plus, 0.0, ScaleFactorMode::Use).unwrap();
                let fm = f.evaluate(&empty(), &minus, 0.0, ScaleFactorMode::Use).unwrap();
                (fp - fm) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn matches_finite_differences_for_smooth_formula() {
        let f = Formula::sum(vec![
            Formula::product(vec![c(3.0), var(0), var(1)]),
            Formula::div(var(0), Formula::sum(vec![c(1.0), var(2)])),
            Formula::power(var(1), var(2)),
            Formula::unary(UnaryFunction::Sin, var(2)),
            Formula::diff(c(0.0), Formula::unary(UnaryFunction::Exp, var(0))),
        ]);
        let y = [0.7, 1.3, 0.4];
        let exact = jacobian_row(&f, &y);
        let approx = finite_difference_row(&f, &y);
        for (e, a) in exact.iter().zip(approx.iter()) {
            assert_relative_eq!(*e, *a, epsilon = 1e-6, max_relative = 1e-6);
        }
    }

    #[test]
    fn entries_include_scale_factors() {
        let f = Formula::simple_product(
            2.0,
            vec![VariableRef::bound("a", 0, 10.0), VariableRef::bound("b", 1, 0.5)],
        );
        let row = jacobian_row(&f, &[1.0, 4.0]);
        // d/dy0 = 2 * (4 * 0.5) * 10, d/dy1 = 2 * (1 * 10) * 0.5
        assert_eq!(row, vec![40.0, 10.0]);
        assert_eq!(jacobian_row(&scaled_var(1, 3.0), &[0.0, 0.0]), vec![0.0, 3.0]);
    }

    #[test]
    fn branches_route_to_active_operand() {
        let f = Formula::if_then_else(
            Formula::relational(RelationalOp::Gt, var(0), c(0.0)),
            Formula::product(vec![c(2.0), var(1)]),
            var(0),
        );
        assert_eq!(jacobian_row(&f, &[1.0, 5.0]), vec![0.0, 2.0]);
        assert_eq!(jacobian_row(&f, &[-1.0, 5.0]), vec![1.0, 0.0]);

        let m = Formula::max(var(0), var(1));
        assert_eq!(jacobian_row(&m, &[1.0, 5.0]), vec![0.0, 1.0]);
        let m = Formula::min(var(0), var(1));
        assert_eq!(jacobian_row(&m, &[1.0, 5.0]), vec![1.0, 0.0]);
    }

    #[test]
    fn zero_base_power_contributes_nothing() {
        let f = Formula::power(var(0), c(2.0));
        assert_eq!(jacobian_row(&f, &[0.0]), vec![0.0]);
    }

    #[test]
    fn multiplier_scales_contributions() {
        let mut jac = DMatrix::<f64>::zeros(2, 2);
        var(1)
            .accumulate_jacobian(&empty(), &mut jac, &[0.0, 0.0], 0.0, 1, -2.5)
            .unwrap();
        assert_eq!(jac[(1, 1)], -2.5);
        assert_eq!(jac[(0, 1)], 0.0);
    }

    #[test]
    fn if_routing_follows_evaluation() {
        let f = Formula::if_then_else(var(0), var(1), Formula::product(vec![c(3.0), var(1)]));
        assert_eq!(jacobian_row(&f, &[1.0, 2.0]), vec![0.0, 1.0]);
        assert_eq!(jacobian_row(&f, &[2.0, 2.0]), vec![0.0, 3.0]);
        assert_eq!(jacobian_row(&f, &[0.5, 2.0]), vec![0.0, 3.0]);
        // an undefined branch contributes nothing
        assert_eq!(jacobian_row(&f, &[f64::NAN, 2.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn table_nodes_chain_through_the_slope() {
        let table = TableFormula::new(
            vec![
                ValuePoint::new(0.0, 0.0),
                ValuePoint::new(2.0, 4.0),
                ValuePoint::new(4.0, 0.0),
            ],
            false,
        )
        .unwrap();
        // at time 0: argument 2*y0 = 1 and shifted position 0 - y1 = 1, both on slope 2
        let f = Formula::sum(vec![
            Formula::table_with_argument(table.clone(), Formula::product(vec![c(2.0), var(0)])),
            Formula::table_with_offset(table, var(1)),
        ]);
        let y = [0.5, -1.0];
        let row = jacobian_row(&f, &y);
        assert_relative_eq!(row[0], 4.0);
        assert_relative_eq!(row[1], -2.0);
        for (analytic, numeric) in row.iter().zip(finite_difference_row(&f, &y)) {
            assert_relative_eq!(*analytic, numeric, epsilon = 1e-6);
        }
    }
}
