use super::{Formula, Node, ScaleFactorMode};
use crate::quantity::Quantities;

impl Formula {
    /// Folds constant subtrees and applies algebraic identities.
    ///
    /// Consumes `self` and returns the replacement tree. With `for_current_run_only` the
    /// folding may use values that are only fixed for the current run (non-fixed
    /// parameters); otherwise only permanently constant quantities fold.
    pub fn simplify(self, for_current_run_only: bool, quantities: &Quantities) -> Formula {
        let id = self.id;
        let s = |f: Formula| f.simplify(for_current_run_only, quantities);
        let sb = |f: Box<Formula>| Box::new(f.simplify(for_current_run_only, quantities));
        let is_zero = |f: &Formula| f.is_zero(quantities);

        let simplified = match self.node {
            Node::Sum(terms) => {
                let mut terms: Vec<Formula> = terms
                    .into_iter()
                    .map(s)
                    .filter(|t| !is_zero(t))
                    .collect();
                match terms.len() {
                    0 => Formula::with_id(id, Node::Constant(0.0)),
                    1 => terms.remove(0),
                    _ => Formula::with_id(id, Node::Sum(terms)),
                }
            }
            Node::Diff(a, b) => {
                let (a, b) = (s(*a), s(*b));
                if is_zero(&b) {
                    a
                } else {
                    Formula::with_id(id, Node::Diff(Box::new(a), Box::new(b)))
                }
            }
            Node::Product(factors) => {
                let factors: Vec<Formula> = factors.into_iter().map(s).collect();
                if factors.iter().any(|f| is_zero(f)) {
                    Formula::with_id(id, Node::Constant(0.0))
                } else {
                    let mut factors: Vec<Formula> = factors
                        .into_iter()
                        .filter(|f| f.as_constant() != Some(1.0))
                        .collect();
                    match factors.len() {
                        0 => Formula::with_id(id, Node::Constant(1.0)),
                        1 => factors.remove(0),
                        _ => Formula::with_id(id, Node::Product(factors)),
                    }
                }
            }
            Node::Div(numerator, denominator) => {
                let (numerator, denominator) = (s(*numerator), s(*denominator));
                if is_zero(&numerator) {
                    Formula::with_id(id, Node::Constant(0.0))
                } else if denominator.as_constant() == Some(1.0) {
                    numerator
                } else {
                    Formula::with_id(id, Node::Div(Box::new(numerator), Box::new(denominator)))
                }
            }
            Node::Power(base, exponent) => {
                let (base, exponent) = (s(*base), s(*exponent));
                match exponent.as_constant() {
                    Some(e) if e == 0.0 => Formula::with_id(id, Node::Constant(1.0)),
                    Some(e) if e == 1.0 => base,
                    _ => Formula::with_id(id, Node::Power(Box::new(base), Box::new(exponent))),
                }
            }
            Node::If {
                condition,
                then,
                otherwise,
            } => {
                let condition = s(*condition);
                match condition.as_constant() {
                    Some(c) if c.is_nan() => Formula::with_id(id, Node::Constant(f64::NAN)),
                    Some(c) if c == 1.0 => s(*then),
                    Some(_) => s(*otherwise),
                    None => {
                        let (then, otherwise) = (s(*then), s(*otherwise));
                        match (then.as_constant(), otherwise.as_constant()) {
                            (Some(a), Some(b)) if a == b => then,
                            _ => Formula::with_id(
                                id,
                                Node::If {
                                    condition: Box::new(condition),
                                    then: Box::new(then),
                                    otherwise: Box::new(otherwise),
                                },
                            ),
                        }
                    }
                }
            }
            Node::Min(a, b) => Formula::with_id(id, Node::Min(sb(a), sb(b))),
            Node::Max(a, b) => Formula::with_id(id, Node::Max(sb(a), sb(b))),
            Node::Unary(function, arg) => Formula::with_id(id, Node::Unary(function, sb(arg))),
            Node::Logical(op, operands) => {
                Formula::with_id(id, Node::Logical(op, operands.into_iter().map(s).collect()))
            }
            Node::Relational(op, a, b) => Formula::with_id(id, Node::Relational(op, sb(a), sb(b))),
            Node::SimpleProduct { factor, variables } => {
                if factor == 0.0 {
                    Formula::with_id(id, Node::Constant(0.0))
                } else if variables.is_empty() {
                    Formula::with_id(id, Node::Constant(factor))
                } else {
                    Formula::with_id(id, Node::SimpleProduct { factor, variables })
                }
            }
            Node::TableWithOffset { table, offset } => {
                Formula::with_id(id, Node::TableWithOffset { table, offset: sb(offset) })
            }
            Node::TableWithArgument { table, argument } => {
                let argument = s(*argument);
                match argument.as_constant() {
                    Some(x) => Formula::with_id(id, Node::Constant(table.value(x))),
                    None => Formula::with_id(
                        id,
                        Node::TableWithArgument {
                            table,
                            argument: Box::new(argument),
                        },
                    ),
                }
            }
            node @ (Node::Constant(_)
            | Node::Time
            | Node::Parameter(_)
            | Node::Variable(_)
            | Node::Table(_)) => Formula::with_id(id, node),
        };

        simplified.fold_if_constant(for_current_run_only, quantities)
    }

    fn fold_if_constant(self, for_current_run_only: bool, quantities: &Quantities) -> Formula {
        if matches!(self.node, Node::Constant(_))
            || !self.is_constant(quantities, for_current_run_only)
        {
            return self;
        }
        match self.evaluate(quantities, &[], 0.0, ScaleFactorMode::Use) {
            Ok(value) => Formula::with_id(self.id, Node::Constant(value)),
            Err(_) => self,
        }
    }
}
