use super::{DerivativeTarget, Formula, Node, RelationalOp, UnaryFunction};
use crate::error::{Result, SimulationError};
use crate::quantity::{Quantities, QuantityReference, RefTarget};

impl Formula {
    /// Closed-form partial derivative of `self` with respect to `target`.
    ///
    /// The result is a fresh tree that borrows nothing from `self`; subexpressions it
    /// needs are cloned. It is not simplified.
    pub fn symbolic_derivative(
        &self,
        target: DerivativeTarget,
        quantities: &Quantities,
    ) -> Result<Formula> {
        let d = |f: &Formula| f.symbolic_derivative(target, quantities);
        let zero = || self.derived(Node::Constant(0.0));
        let is_zero = |f: &Formula| f.is_zero(quantities);

        let derivative = match &self.node {
            Node::Constant(_) | Node::Time | Node::Table(_) => zero(),
            Node::Variable(variable) => match target {
                DerivativeTarget::Variable(index) if variable.ode_index == Some(index) => {
                    self.derived(Node::Constant(variable.scale_factor))
                }
                _ => zero(),
            },
            Node::Parameter(reference) => self.reference_derivative(reference, target, quantities)?,
            Node::Sum(terms) => {
                let mut derivatives = Vec::with_capacity(terms.len());
                for term in terms {
                    let dt = d(term)?;
                    if !is_zero(&dt) {
                        derivatives.push(dt);
                    }
                }
                self.derived(Node::Sum(derivatives))
            }
            Node::Diff(a, b) => self.derived(Node::Diff(Box::new(d(a)?), Box::new(d(b)?))),
            Node::Product(factors) => {
                let mut terms = Vec::new();
                for (i, factor) in factors.iter().enumerate() {
                    let df = d(factor)?;
                    if is_zero(&df) {
                        continue;
                    }
                    let mut term = Vec::with_capacity(factors.len());
                    term.push(df);
                    term.extend(
                        factors
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, f)| f.clone()),
                    );
                    terms.push(self.derived(Node::Product(term)));
                }
                self.derived(Node::Sum(terms))
            }
            Node::Div(numerator, denominator) => {
                let du = d(numerator)?;
                let dv = d(denominator)?;
                if is_zero(&dv) {
                    self.derived(Node::Div(Box::new(du), denominator.clone()))
                } else {
                    // (du v - u dv) / v^2
                    let top = self.derived(Node::Diff(
                        Box::new(self.derived(Node::Product(vec![du, (**denominator).clone()]))),
                        Box::new(self.derived(Node::Product(vec![(**numerator).clone(), dv]))),
                    ));
                    let bottom = self.derived(Node::Power(
                        denominator.clone(),
                        Box::new(self.derived(Node::Constant(2.0))),
                    ));
                    self.derived(Node::Div(Box::new(top), Box::new(bottom)))
                }
            }
            Node::Power(base, exponent) => {
                let db = d(base)?;
                let de = d(exponent)?;
                let mut terms = Vec::new();
                if !is_zero(&db) {
                    // e * b^(e-1) * db
                    let reduced = self.derived(Node::Diff(
                        exponent.clone(),
                        Box::new(self.derived(Node::Constant(1.0))),
                    ));
                    terms.push(self.derived(Node::Product(vec![
                        (**exponent).clone(),
                        self.derived(Node::Power(base.clone(), Box::new(reduced))),
                        db,
                    ])));
                }
                if !is_zero(&de) {
                    // ln(b) * b^e * de
                    terms.push(self.derived(Node::Product(vec![
                        self.derived(Node::Unary(UnaryFunction::Ln, base.clone())),
                        self.clone(),
                        de,
                    ])));
                }
                self.derived(Node::Sum(terms))
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => self.derived(Node::If {
                condition: condition.clone(),
                then: Box::new(d(then)?),
                otherwise: Box::new(d(otherwise)?),
            }),
            Node::Min(a, b) => self.derived(Node::If {
                condition: Box::new(self.derived(Node::Relational(RelationalOp::Gt, a.clone(), b.clone()))),
                then: Box::new(d(b)?),
                otherwise: Box::new(d(a)?),
            }),
            Node::Max(a, b) => self.derived(Node::If {
                condition: Box::new(self.derived(Node::Relational(RelationalOp::Gt, a.clone(), b.clone()))),
                then: Box::new(d(a)?),
                otherwise: Box::new(d(b)?),
            }),
            Node::Unary(function, arg) => {
                let dx = d(arg)?;
                if is_zero(&dx) {
                    zero()
                } else {
                    self.unary_derivative(*function, arg, dx)
                }
            }
            // chain rule through the slope table, which reads at the same position
            Node::TableWithOffset { table, offset } => {
                let d_offset = d(offset)?;
                match table.slope_table() {
                    Some(slopes) if !is_zero(&d_offset) => self.derived(Node::Product(vec![
                        self.derived(Node::Constant(-1.0)),
                        self.derived(Node::TableWithOffset {
                            table: slopes,
                            offset: offset.clone(),
                        }),
                        d_offset,
                    ])),
                    _ => zero(),
                }
            }
            Node::TableWithArgument { table, argument } => {
                let d_argument = d(argument)?;
                match table.slope_table() {
                    Some(slopes) if !is_zero(&d_argument) => self.derived(Node::Product(vec![
                        self.derived(Node::TableWithArgument {
                            table: slopes,
                            argument: argument.clone(),
                        }),
                        d_argument,
                    ])),
                    _ => zero(),
                }
            }
            Node::Logical(..) | Node::Relational(..) => {
                return Err(SimulationError::configuration(
                    self.id,
                    "Cannot differentiate a logical or relational expression",
                ))
            }
            Node::SimpleProduct { factor, variables } => {
                let index = match target {
                    DerivativeTarget::Variable(index) => index,
                    DerivativeTarget::Parameter(_) => return Ok(zero()),
                };
                let mut terms = Vec::new();
                for (k, variable) in variables.iter().enumerate() {
                    if variable.ode_index != Some(index) {
                        continue;
                    }
                    let mut rest = variables.clone();
                    rest.remove(k);
                    terms.push(self.derived(Node::SimpleProduct {
                        factor: factor * variable.scale_factor,
                        variables: rest,
                    }));
                }
                match terms.len() {
                    0 => zero(),
                    1 => terms.remove(0),
                    _ => self.derived(Node::Sum(terms)),
                }
            }
        };
        Ok(derivative)
    }

    fn reference_derivative(
        &self,
        reference: &QuantityReference,
        target: DerivativeTarget,
        quantities: &Quantities,
    ) -> Result<Formula> {
        let zero = self.derived(Node::Constant(0.0));
        match reference.target {
            RefTarget::Unresolved => Err(SimulationError::configuration(
                self.id,
                format!("Reference '{}' is not resolved", reference.alias),
            )),
            RefTarget::Time => Ok(zero),
            RefTarget::Parameter(slot) => {
                let parameter = quantities.parameter(slot, self.id)?;
                if target == DerivativeTarget::Parameter(parameter.core.id) {
                    return Ok(self.derived(Node::Constant(1.0)));
                }
                match parameter.core.formula() {
                    Some(formula) => formula.symbolic_derivative(target, quantities),
                    None => Ok(zero),
                }
            }
            RefTarget::Species {
                slot,
                ode_index,
                scale_factor,
            } => {
                let species = quantities.species.get(slot).ok_or_else(|| {
                    SimulationError::configuration(self.id, "Species slot out of range")
                })?;
                if !species.is_constant_during_calculation() {
                    return Ok(match (target, ode_index) {
                        (DerivativeTarget::Variable(index), Some(own)) if index == own => {
                            self.derived(Node::Constant(scale_factor))
                        }
                        _ => zero,
                    });
                }
                match species.core.formula() {
                    Some(formula) => formula.symbolic_derivative(target, quantities),
                    None => Ok(zero),
                }
            }
            RefTarget::Observer(slot) => {
                match quantities.observers.get(slot).and_then(|o| o.core.formula()) {
                    Some(formula) => formula.symbolic_derivative(target, quantities),
                    None => Ok(zero),
                }
            }
        }
    }

    fn unary_derivative(&self, function: UnaryFunction, arg: &Formula, dx: Formula) -> Formula {
        let node = |n: Node| self.derived(n);
        let boxed = |f: Formula| Box::new(f);
        let x = || Box::new(arg.clone());
        let apply = |f: UnaryFunction| node(Node::Unary(f, x()));
        let constant = |v: f64| node(Node::Constant(v));
        let one_minus_x_squared = || {
            node(Node::Diff(
                boxed(constant(1.0)),
                boxed(node(Node::Power(x(), boxed(constant(2.0))))),
            ))
        };

        match function {
            UnaryFunction::Neg => node(Node::Unary(UnaryFunction::Neg, boxed(dx))),
            UnaryFunction::Exp => node(Node::Product(vec![apply(UnaryFunction::Exp), dx])),
            UnaryFunction::Ln => node(Node::Div(boxed(dx), x())),
            UnaryFunction::Log10 => node(Node::Div(
                boxed(dx),
                boxed(node(Node::Product(vec![
                    arg.clone(),
                    constant(std::f64::consts::LN_10),
                ]))),
            )),
            UnaryFunction::Sqrt => node(Node::Div(
                boxed(dx),
                boxed(node(Node::Product(vec![
                    constant(2.0),
                    apply(UnaryFunction::Sqrt),
                ]))),
            )),
            UnaryFunction::Abs => node(Node::If {
                condition: boxed(node(Node::Relational(
                    RelationalOp::Gt,
                    x(),
                    boxed(constant(0.0)),
                ))),
                then: boxed(dx.clone()),
                otherwise: boxed(node(Node::Unary(UnaryFunction::Neg, boxed(dx)))),
            }),
            UnaryFunction::Sin => node(Node::Product(vec![apply(UnaryFunction::Cos), dx])),
            UnaryFunction::Cos => node(Node::Unary(
                UnaryFunction::Neg,
                boxed(node(Node::Product(vec![apply(UnaryFunction::Sin), dx]))),
            )),
            UnaryFunction::Tan => node(Node::Div(
                boxed(dx),
                boxed(node(Node::Power(
                    boxed(apply(UnaryFunction::Cos)),
                    boxed(constant(2.0)),
                ))),
            )),
            UnaryFunction::Asin => node(Node::Div(
                boxed(dx),
                boxed(node(Node::Unary(
                    UnaryFunction::Sqrt,
                    boxed(one_minus_x_squared()),
                ))),
            )),
            UnaryFunction::Acos => node(Node::Unary(
                UnaryFunction::Neg,
                boxed(node(Node::Div(
                    boxed(dx),
                    boxed(node(Node::Unary(
                        UnaryFunction::Sqrt,
                        boxed(one_minus_x_squared()),
                    ))),
                ))),
            )),
            UnaryFunction::Atan => node(Node::Div(
                boxed(dx),
                boxed(node(Node::Sum(vec![
                    constant(1.0),
                    node(Node::Power(x(), boxed(constant(2.0)))),
                ]))),
            )),
            UnaryFunction::Sinh => node(Node::Product(vec![apply(UnaryFunction::Cosh), dx])),
            UnaryFunction::Cosh => node(Node::Product(vec![apply(UnaryFunction::Sinh), dx])),
            UnaryFunction::Tanh => node(Node::Product(vec![
                node(Node::Diff(
                    boxed(constant(1.0)),
                    boxed(node(Node::Power(
                        boxed(apply(UnaryFunction::Tanh)),
                        boxed(constant(2.0)),
                    ))),
                )),
                dx,
            ])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{LogicalOp, ScaleFactorMode, VariableRef};
    use super::*;
    use crate::formula::{TableFormula, ValuePoint};
    use crate::quantity::Parameter;
    use approx::assert_relative_eq;

    fn eval_at(f: &Formula, quantities: &Quantities, y: &[f64]) -> f64 {
        f.evaluate(quantities, y, 0.0, ScaleFactorMode::Use).unwrap()
    }

    fn central_difference(f: &Formula, y: &[f64], index: usize) -> f64 {
        let h = 1e-6;
        let mut plus = y.to_vec();
        let mut minus = y.to_vec();
        plus[index] += h;
        minus[index] -= h;
        (eval_at(f, &empty(), &plus) - eval_at(f, &empty(), &minus)) / (2.0 * h)
    }

    fn parameter_ref(slot: usize, id: i64) -> Formula {
        Formula::new(Node::Parameter(QuantityReference {
            alias: format!("p{id}"),
            quantity_id: Some(id),
            target: RefTarget::Parameter(slot),
        }))
    }

    #[test]
    fn quotient_derivative_matches_finite_difference() {
        let f = Formula::div(var(0), var(1));
        let y = [1.7, 0.6];
        for index in 0..2 {
            let derivative = f
                .symbolic_derivative(DerivativeTarget::Variable(index), &empty())
                .unwrap();
            assert_relative_eq!(
                eval_at(&derivative, &empty(), &y),
                central_difference(&f, &y, index),
                max_relative = 1e-6
            );
        }
    }

    #[test]
    fn unary_and_power_derivatives_match_finite_differences() {
        let formulas = vec![
            Formula::power(var(0), var(1)),
            Formula::unary(UnaryFunction::Tanh, Formula::product(vec![var(0), var(1)])),
            Formula::unary(UnaryFunction::Asin, Formula::div(var(0), c(4.0))),
            Formula::unary(UnaryFunction::Sqrt, Formula::sum(vec![var(0), var(1)])),
            Formula::unary(UnaryFunction::Log10, var(1)),
            Formula::unary(UnaryFunction::Abs, Formula::diff(var(1), var(0))),
            Formula::max(var(0), Formula::product(vec![c(2.0), var(1)])),
        ];
        let y = [1.2, 0.8];
        for f in &formulas {
            for index in 0..2 {
                let derivative = f
                    .symbolic_derivative(DerivativeTarget::Variable(index), &empty())
                    .unwrap();
                assert_relative_eq!(
                    eval_at(&derivative, &empty(), &y),
                    central_difference(f, &y, index),
                    epsilon = 1e-7,
                    max_relative = 1e-5
                );
            }
        }
    }

    #[test]
    fn derivative_leaves_source_untouched() {
        let f = Formula::product(vec![var(0), Formula::unary(UnaryFunction::Exp, var(0))]);
        let before = f.clone();
        let _ = f
            .symbolic_derivative(DerivativeTarget::Variable(0), &empty())
            .unwrap();
        assert_eq!(f, before);
    }

    #[test]
    fn mass_action_term_differentiates_per_variable() {
        let f = Formula::simple_product(
            3.0,
            vec![
                VariableRef::bound("a", 0, 2.0),
                VariableRef::bound("a", 0, 2.0),
                VariableRef::bound("b", 1, 1.0),
            ],
        );
        let y = [1.5, 4.0];
        let derivative = f
            .symbolic_derivative(DerivativeTarget::Variable(0), &empty())
            .unwrap();
        assert_relative_eq!(
            eval_at(&derivative, &empty(), &y),
            central_difference(&f, &y, 0),
            max_relative = 1e-6
        );
    }

    #[test]
    fn parameter_references_differentiate_through_formulas() {
        let mut quantities = Quantities::default();
        quantities.parameters.push(Parameter::new(5, "k", 2.0));
        // q = k^2 + y0
        quantities.parameters.push(Parameter::with_formula(
            6,
            "q",
            Formula::sum(vec![Formula::power(parameter_ref(0, 5), c(2.0)), var(0)]),
        ));
        let f = Formula::product(vec![parameter_ref(1, 6), var(0)]);

        let dk = f
            .symbolic_derivative(DerivativeTarget::Parameter(5), &quantities)
            .unwrap();
        // d/dk (k^2 + y0) y0 = 2 k y0
        assert_relative_eq!(eval_at(&dk, &quantities, &[3.0]), 12.0);

        let dy = f
            .symbolic_derivative(DerivativeTarget::Variable(0), &quantities)
            .unwrap();
        // d/dy0 (k^2 + y0) y0 = k^2 + 2 y0
        assert_relative_eq!(eval_at(&dy, &quantities, &[3.0]), 10.0);

        let unrelated = f
            .symbolic_derivative(DerivativeTarget::Parameter(99), &quantities)
            .unwrap();
        assert!(unrelated.is_zero(&quantities));
    }

    #[test]
    fn logical_nodes_cannot_be_differentiated() {
        let mut f = Formula::logical(LogicalOp::And, vec![var(0), c(1.0)]);
        f.set_id(31);
        let err = f
            .symbolic_derivative(DerivativeTarget::Variable(0), &empty())
            .expect_err("logical");
        assert!(err.to_string().contains("Formula 31"));
    }

    #[test]
    fn table_nodes_differentiate_through_their_slope_table() {
        let points = vec![
            ValuePoint::new(0.0, 0.0),
            ValuePoint::new(2.0, 4.0),
            ValuePoint::new(4.0, 0.0),
        ];
        let table = TableFormula::new(points.clone(), false).unwrap();
        let target = DerivativeTarget::Variable(0);

        let by_state =
            Formula::table_with_argument(table.clone(), Formula::product(vec![c(2.0), var(0)]));
        let d = by_state.symbolic_derivative(target, &empty()).unwrap();
        for y in [[0.5], [1.5]] {
            let numeric = central_difference(&by_state, &y, 0);
            assert_relative_eq!(eval_at(&d, &empty(), &y), numeric, epsilon = 1e-6);
        }
        assert_relative_eq!(eval_at(&d, &empty(), &[0.5]), 4.0);
        assert_relative_eq!(eval_at(&d, &empty(), &[1.5]), -4.0);

        // read at time 0, so the position is -y0
        let shifted = Formula::table_with_offset(table, var(0));
        let d = shifted.symbolic_derivative(target, &empty()).unwrap();
        assert_relative_eq!(eval_at(&d, &empty(), &[-1.0]), -2.0);
        assert_relative_eq!(eval_at(&d, &empty(), &[-3.0]), 2.0);

        let derived = Formula::table_with_argument(TableFormula::new(points, true).unwrap(), var(0));
        let d = derived.symbolic_derivative(target, &empty()).unwrap();
        assert!(d.is_zero(&empty()));
    }
}
