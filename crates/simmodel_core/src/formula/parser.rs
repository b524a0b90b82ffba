//! Text syntax for formulas.
//!
//! Grammar, lowest precedence first: `or`, `and`, comparisons (`== = != <> < <= > >=`),
//! `+ -`, `* /`, unary `-` and `not`, `^` (right associative), primaries. Identifiers
//! become unresolved quantity references, except `Time`.

use anyhow::{anyhow, bail, Context, Result};

use super::{Formula, FormulaId, LogicalOp, RelationalOp, UnaryFunction};

/// Parses `input` and stamps every node with `id`.
pub fn parse_formula(id: FormulaId, input: &str) -> Result<Formula> {
    let tokens = tokenize(input).with_context(|| format!("Formula {id}: cannot tokenize '{input}'"))?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut formula = parser
        .parse_expression()
        .with_context(|| format!("Formula {id}: cannot parse '{input}'"))?;
    if let Some(token) = parser.peek() {
        bail!("Formula {id}: unexpected {token:?} after end of expression in '{input}'");
    }
    formula.set_id(id);
    Ok(formula)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
    Compare(RelationalOp),
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| anyhow!("Invalid number '{num_str}'"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let next_is_eq = chars.peek() == Some(&'=');
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                '=' => {
                    if next_is_eq {
                        chars.next();
                    }
                    Token::Compare(RelationalOp::Eq)
                }
                '!' if next_is_eq => {
                    chars.next();
                    Token::Compare(RelationalOp::Neq)
                }
                '<' if next_is_eq => {
                    chars.next();
                    Token::Compare(RelationalOp::Le)
                }
                '<' if chars.peek() == Some(&'>') => {
                    chars.next();
                    Token::Compare(RelationalOp::Neq)
                }
                '<' => Token::Compare(RelationalOp::Lt),
                '>' if next_is_eq => {
                    chars.next();
                    Token::Compare(RelationalOp::Ge)
                }
                '>' => Token::Compare(RelationalOp::Gt),
                other => bail!("Unexpected character '{other}'"),
            };
            tokens.push(token);
        }
    }
    Ok(tokens)
}

fn is_keyword(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Identifier(name) if name.eq_ignore_ascii_case(keyword))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.consume() {
            Some(token) if token == expected => Ok(()),
            Some(token) => bail!("Expected {expected:?}, found {token:?}"),
            None => bail!("Expected {expected:?}, found end of input"),
        }
    }

    fn parse_expression(&mut self) -> Result<Formula> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Formula> {
        let mut operands = vec![self.parse_and()?];
        while self.peek().is_some_and(|t| is_keyword(t, "or")) {
            self.consume();
            operands.push(self.parse_and()?);
        }
        Ok(collapse(operands, |ops| Formula::logical(LogicalOp::Or, ops)))
    }

    fn parse_and(&mut self) -> Result<Formula> {
        let mut operands = vec![self.parse_comparison()?];
        while self.peek().is_some_and(|t| is_keyword(t, "and")) {
            self.consume();
            operands.push(self.parse_comparison()?);
        }
        Ok(collapse(operands, |ops| Formula::logical(LogicalOp::And, ops)))
    }

    fn parse_comparison(&mut self) -> Result<Formula> {
        let left = self.parse_term()?;
        if let Some(Token::Compare(op)) = self.peek() {
            let op = *op;
            self.consume();
            let right = self.parse_term()?;
            return Ok(Formula::relational(op, left, right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Formula> {
        let mut terms = vec![self.parse_factor()?];

        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.consume();
                    terms.push(self.parse_factor()?);
                }
                Token::Minus => {
                    self.consume();
                    let right = self.parse_factor()?;
                    let left = collapse(std::mem::take(&mut terms), Formula::sum);
                    terms.push(Formula::diff(left, right));
                }
                _ => break,
            }
        }
        Ok(collapse(terms, Formula::sum))
    }

    fn parse_factor(&mut self) -> Result<Formula> {
        let mut factors = vec![self.parse_unary()?];

        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.consume();
                    factors.push(self.parse_unary()?);
                }
                Token::Slash => {
                    self.consume();
                    let right = self.parse_unary()?;
                    let left = collapse(std::mem::take(&mut factors), Formula::product);
                    factors.push(Formula::div(left, right));
                }
                _ => break,
            }
        }
        Ok(collapse(factors, Formula::product))
    }

    fn parse_unary(&mut self) -> Result<Formula> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(match expr.as_constant() {
                    Some(value) => Formula::constant(-value),
                    None => Formula::unary(UnaryFunction::Neg, expr),
                })
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            Some(token) if is_keyword(token, "not") => {
                self.consume();
                let expr = self.parse_unary()?;
                Ok(Formula::logical(LogicalOp::Not, vec![expr]))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Formula> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Formula::power(base, exponent));
        }
        Ok(base)
    }

    fn parse_arguments(&mut self) -> Result<Vec<Formula>> {
        self.expect(Token::LParen)?;
        let mut args = vec![self.parse_expression()?];
        while let Some(Token::Comma) = self.peek() {
            self.consume();
            args.push(self.parse_expression()?);
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Formula> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Formula::constant(n)),
            Some(Token::Identifier(name)) => {
                if !matches!(self.peek(), Some(Token::LParen)) {
                    return Ok(if name == "Time" {
                        Formula::time()
                    } else {
                        Formula::parameter(name)
                    });
                }
                let mut args = self.parse_arguments()?;
                let arity = args.len();
                let lower = name.to_ascii_lowercase();
                match (lower.as_str(), arity) {
                    ("if", 3) => {
                        let otherwise = args.remove(2);
                        let then = args.remove(1);
                        Ok(Formula::if_then_else(args.remove(0), then, otherwise))
                    }
                    ("min", 2) => {
                        let b = args.remove(1);
                        Ok(Formula::min(args.remove(0), b))
                    }
                    ("max", 2) => {
                        let b = args.remove(1);
                        Ok(Formula::max(args.remove(0), b))
                    }
                    (_, 1) if UnaryFunction::from_name(&lower).is_some() => {
                        let function = UnaryFunction::from_name(&lower)
                            .ok_or_else(|| anyhow!("Unknown function '{name}'"))?;
                        Ok(Formula::unary(function, args.remove(0)))
                    }
                    ("if" | "min" | "max", _) => {
                        bail!("Function '{name}' does not take {arity} argument(s)")
                    }
                    _ if UnaryFunction::from_name(&lower).is_some() => {
                        bail!("Function '{name}' does not take {arity} argument(s)")
                    }
                    _ => bail!("Unknown function '{name}'"),
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(token) => bail!("Unexpected token {token:?}"),
            None => bail!("Unexpected end of input"),
        }
    }
}

fn collapse(mut items: Vec<Formula>, build: impl FnOnce(Vec<Formula>) -> Formula) -> Formula {
    if items.len() == 1 {
        items.remove(0)
    } else {
        build(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{Node, ScaleFactorMode};
    use crate::quantity::Quantities;

    fn value(input: &str, time: f64) -> f64 {
        parse_formula(1, input)
            .unwrap()
            .evaluate(&Quantities::default(), &[], time, ScaleFactorMode::Use)
            .unwrap()
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err:#}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn respects_precedence_and_associativity() {
        assert_eq!(value("1 + 2 * 3", 0.0), 7.0);
        assert_eq!(value("(1 + 2) * 3", 0.0), 9.0);
        assert_eq!(value("2 ^ 3 ^ 2", 0.0), 512.0);
        assert_eq!(value("-2 ^ 2", 0.0), -4.0);
        assert_eq!(value("8 / 4 / 2", 0.0), 1.0);
        assert_eq!(value("10 - 4 - 3", 0.0), 3.0);
        assert_eq!(value("2 ^ -1", 0.0), 0.5);
        assert_eq!(value("1.5e2 + 5E-1", 0.0), 150.5);
    }

    #[test]
    fn functions_conditions_and_time() {
        assert_eq!(value("if(Time >= 5, 1, 2)", 6.0), 1.0);
        assert_eq!(value("if(Time >= 5 and Time < 6, 1, 2)", 7.0), 2.0);
        assert_eq!(value("max(1, min(Time, 3))", 2.0), 2.0);
        assert_eq!(value("exp(0) + sqrt(4) + abs(-3)", 0.0), 6.0);
        assert_eq!(value("not (1 <> 1) or 0", 0.0), 1.0);
    }

    #[test]
    fn identifiers_become_references_and_chains_flatten() {
        let f = parse_formula(3, "k1 * A * B + C").unwrap();
        assert_eq!(f.id(), 3);
        match f.node() {
            Node::Sum(terms) => {
                assert_eq!(terms.len(), 2);
                match terms[0].node() {
                    Node::Product(factors) => {
                        assert_eq!(factors.len(), 3);
                        assert!(matches!(factors[0].node(), Node::Parameter(r) if r.alias == "k1"));
                    }
                    other => panic!("unexpected node {other:?}"),
                }
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn reports_malformed_input() {
        assert_err_contains(parse_formula(1, "1 +"), "Unexpected end of input");
        assert_err_contains(parse_formula(1, "(1 + 2"), "found end of input");
        assert_err_contains(parse_formula(1, "foo(1)"), "Unknown function 'foo'");
        assert_err_contains(parse_formula(1, "min(1)"), "does not take 1 argument");
        assert_err_contains(parse_formula(1, "1 $ 2"), "Unexpected character '$'");
        assert_err_contains(parse_formula(1, "1 2"), "after end of expression");
    }
}
