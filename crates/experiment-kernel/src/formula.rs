//! Restricted arithmetic expressions for derived variables.
//!
//! A formula is tokenized, parsed into an expression tree and evaluated
//! against the values resolved so far. The language has numbers, variable
//! references, `+ - * /`, unary signs, parentheses and a fixed function
//! allowlist (`abs`, `min`, `max`, `round`). There is no attribute access,
//! no name lookup outside the supplied mapping and nothing else callable.
//!
//! Integer operands stay integers for `+`, `-` and `*`; `/` always yields a
//! real number.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::FormulaError;
use crate::variables::ConditionValue;

/// A numeric value produced by formula evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Real(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Real(r) => r,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
        }
    }
}

impl From<Number> for ConditionValue {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => ConditionValue::Int(i),
            Number::Real(r) => ConditionValue::Real(r),
        }
    }
}

/// Functions callable from a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Abs,
    Min,
    Max,
    Round,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Self::Abs),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "round" => Some(Self::Round),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::Min => "min",
            Self::Max => "max",
            Self::Round => "round",
        }
    }

    fn check_arity(self, found: usize) -> Result<(), FormulaError> {
        let (ok, expected) = match self {
            Self::Abs => (found == 1, "1"),
            Self::Min | Self::Max => (found >= 2, "at least 2"),
            Self::Round => ((1..=2).contains(&found), "1 or 2"),
        };
        if ok {
            Ok(())
        } else {
            Err(FormulaError::Arity {
                function: self.name().to_string(),
                expected: expected.to_string(),
                found,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(Number),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(Number),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn syntax(position: usize, message: impl Into<String>) -> FormulaError {
    FormulaError::Syntax {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens: Vec<Token> = Vec::new();
    let mut i = 0;

    while let Some(&(position, c)) = chars.get(i) {
        let next_is_digit = chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit());

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next_is_digit) {
            let start = i;
            let mut seen_dot = false;
            let mut seen_exp = false;
            while let Some(&(_, d)) = chars.get(i) {
                if d.is_ascii_digit() {
                    i += 1;
                } else if d == '.' && !seen_dot && !seen_exp {
                    seen_dot = true;
                    i += 1;
                } else if (d == 'e' || d == 'E') && !seen_exp {
                    let sign = chars.get(i + 1).map(|(_, s)| *s);
                    let digit_at = if matches!(sign, Some('+') | Some('-')) { i + 2 } else { i + 1 };
                    if !chars.get(digit_at).is_some_and(|(_, n)| n.is_ascii_digit()) {
                        break;
                    }
                    seen_exp = true;
                    i = digit_at;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            let number = if seen_dot || seen_exp {
                text.parse::<f64>()
                    .map(Number::Real)
                    .map_err(|_| syntax(position, format!("invalid number '{text}'")))?
            } else {
                match text.parse::<i64>() {
                    Ok(n) => Number::Int(n),
                    Err(_) => return Err(FormulaError::Overflow),
                }
            };
            tokens.push(Token {
                kind: TokenKind::Number(number),
                position,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|(_, ch)| ch.is_alphanumeric() || *ch == '_')
            {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(ident),
                position,
            });
            continue;
        }

        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '.' => {
                return Err(match tokens.last() {
                    Some(Token {
                        kind: TokenKind::Ident(name),
                        ..
                    }) => FormulaError::AttributeAccess(name.clone()),
                    _ => syntax(position, "unexpected '.'"),
                });
            }
            other => return Err(syntax(position, format!("unexpected character '{other}'"))),
        };
        tokens.push(Token { kind, position });
        i += 1;
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |t| t.position)
    }

    fn advance(&mut self) -> Option<TokenKind> {
        let token = self.tokens.get(self.pos).map(|t| t.kind.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), FormulaError> {
        if self.peek() == Some(&kind) {
            self.pos += 1;
            Ok(())
        } else {
            Err(syntax(self.position(), format!("expected {what}")))
        }
    }

    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Plus) => BinaryOp::Add,
                Some(TokenKind::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(TokenKind::Star) => BinaryOp::Mul,
                Some(TokenKind::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(TokenKind::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(TokenKind::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let position = self.position();
        match self.advance() {
            Some(TokenKind::Number(n)) => Ok(Expr::Number(n)),
            Some(TokenKind::Ident(name)) => {
                if self.peek() != Some(&TokenKind::LParen) {
                    return Ok(Expr::Var(name));
                }
                let function =
                    Function::lookup(&name).ok_or(FormulaError::DisallowedFunction(name))?;
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&TokenKind::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.peek() == Some(&TokenKind::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen, "')'")?;
                function.check_arity(args.len())?;
                Ok(Expr::Call { function, args })
            }
            Some(TokenKind::LParen) => {
                let inner = self.expression()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            Some(_) => Err(syntax(position, "unexpected token")),
            None => Err(syntax(position, "unexpected end of formula")),
        }
    }
}

/// A parsed derived-variable formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Parse a formula, rejecting anything outside the restricted grammar.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
        };
        let expr = parser.expression()?;
        if parser.peek().is_some() {
            return Err(syntax(parser.position(), "unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Names of the variables this formula reads. Function names are not included.
    pub fn references(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        collect_refs(&self.expr, &mut names);
        names
    }

    /// Evaluate against the values resolved so far.
    pub fn evaluate(&self, values: &BTreeMap<String, ConditionValue>) -> Result<Number, FormulaError> {
        let result = eval(&self.expr, values)?;
        match result {
            Number::Real(r) if !r.is_finite() => Err(FormulaError::NonFinite),
            other => Ok(other),
        }
    }
}

fn collect_refs<'a>(expr: &'a Expr, names: &mut BTreeSet<&'a str>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Var(name) => {
            names.insert(name.as_str());
        }
        Expr::Neg(inner) => collect_refs(inner, names),
        Expr::Binary { lhs, rhs, .. } => {
            collect_refs(lhs, names);
            collect_refs(rhs, names);
        }
        Expr::Call { args, .. } => args.iter().for_each(|a| collect_refs(a, names)),
    }
}

fn lookup(name: &str, values: &BTreeMap<String, ConditionValue>) -> Result<Number, FormulaError> {
    match values.get(name) {
        None => Err(FormulaError::UndefinedName(name.to_string())),
        Some(ConditionValue::Int(i)) => Ok(Number::Int(*i)),
        Some(ConditionValue::Real(r)) => Ok(Number::Real(*r)),
        Some(ConditionValue::Bool(b)) => Ok(Number::Int(i64::from(*b))),
        Some(ConditionValue::Text(_)) => Err(FormulaError::NonNumeric(name.to_string())),
    }
}

fn eval(expr: &Expr, values: &BTreeMap<String, ConditionValue>) -> Result<Number, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(name) => lookup(name, values),
        Expr::Neg(inner) => match eval(inner, values)? {
            Number::Int(i) => i.checked_neg().map(Number::Int).ok_or(FormulaError::Overflow),
            Number::Real(r) => Ok(Number::Real(-r)),
        },
        Expr::Binary { op, lhs, rhs } => {
            let a = eval(lhs, values)?;
            let b = eval(rhs, values)?;
            binary(*op, a, b)
        }
        Expr::Call { function, args } => {
            let args = args
                .iter()
                .map(|a| eval(a, values))
                .collect::<Result<Vec<_>, _>>()?;
            call(*function, &args)
        }
    }
}

fn binary(op: BinaryOp, a: Number, b: Number) -> Result<Number, FormulaError> {
    if op == BinaryOp::Div {
        let divisor = b.as_f64();
        if divisor == 0.0 {
            return Err(FormulaError::DivisionByZero);
        }
        return Ok(Number::Real(a.as_f64() / divisor));
    }
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => {
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div => unreachable!("division handled above"),
            };
            result.map(Number::Int).ok_or(FormulaError::Overflow)
        }
        _ => {
            let (x, y) = (a.as_f64(), b.as_f64());
            Ok(Number::Real(match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => unreachable!("division handled above"),
            }))
        }
    }
}

fn real_to_int(r: f64) -> Result<i64, FormulaError> {
    if !r.is_finite() {
        return Err(FormulaError::NonFinite);
    }
    if r < i64::MIN as f64 || r >= i64::MAX as f64 {
        return Err(FormulaError::Overflow);
    }
    Ok(r as i64)
}

fn call(function: Function, args: &[Number]) -> Result<Number, FormulaError> {
    match (function, args) {
        (Function::Abs, [Number::Int(i)]) => {
            i.checked_abs().map(Number::Int).ok_or(FormulaError::Overflow)
        }
        (Function::Abs, [Number::Real(r)]) => Ok(Number::Real(r.abs())),
        (Function::Min | Function::Max, [first, rest @ ..]) => {
            let mut best = *first;
            for candidate in rest {
                let better = if function == Function::Min {
                    candidate.as_f64() < best.as_f64()
                } else {
                    candidate.as_f64() > best.as_f64()
                };
                if better {
                    best = *candidate;
                }
            }
            Ok(best)
        }
        (Function::Round, [Number::Int(i)]) => Ok(Number::Int(*i)),
        (Function::Round, [Number::Real(r)]) => real_to_int(r.round_ties_even()).map(Number::Int),
        (Function::Round, [value, Number::Int(digits)]) => match value {
            Number::Int(i) => Ok(Number::Int(*i)),
            Number::Real(r) => {
                let digits = i32::try_from(*digits).map_err(|_| FormulaError::Overflow)?;
                let scale = 10f64.powi(digits);
                Ok(Number::Real((r * scale).round_ties_even() / scale))
            }
        },
        (Function::Round, [_, Number::Real(_)]) => {
            Err(FormulaError::NonNumeric("round() digits".to_string()))
        }
        (f, args) => Err(FormulaError::Arity {
            function: f.name().to_string(),
            expected: "a valid number of".to_string(),
            found: args.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, ConditionValue)]) -> BTreeMap<String, ConditionValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_str(src: &str, vals: &BTreeMap<String, ConditionValue>) -> Result<Number, FormulaError> {
        Formula::parse(src)?.evaluate(vals)
    }

    #[test]
    fn test_precedence_and_parentheses() {
        let empty = BTreeMap::new();
        assert_eq!(eval_str("2 + 3 * 4", &empty), Ok(Number::Int(14)));
        assert_eq!(eval_str("(2 + 3) * 4", &empty), Ok(Number::Int(20)));
        assert_eq!(eval_str("10 - 4 - 3", &empty), Ok(Number::Int(3)));
        assert_eq!(eval_str("-2 * -3", &empty), Ok(Number::Int(6)));
    }

    #[test]
    fn test_division_is_real() {
        let empty = BTreeMap::new();
        assert_eq!(eval_str("7 / 2", &empty), Ok(Number::Real(3.5)));
        assert_eq!(eval_str("4 / 2", &empty), Ok(Number::Real(2.0)));
        assert_eq!(eval_str("1 / 0", &empty), Err(FormulaError::DivisionByZero));
    }

    #[test]
    fn test_variables_and_mixed_types() {
        let vals = values(&[
            ("x", ConditionValue::Int(10)),
            ("price", ConditionValue::Real(6.5)),
            ("flag", ConditionValue::Bool(true)),
        ]);
        assert_eq!(eval_str("x * 2", &vals), Ok(Number::Int(20)));
        assert_eq!(eval_str("price + x", &vals), Ok(Number::Real(16.5)));
        assert_eq!(eval_str("flag + 1", &vals), Ok(Number::Int(2)));
    }

    #[test]
    fn test_allowed_functions() {
        let vals = values(&[("v", ConditionValue::Real(-2.5))]);
        assert_eq!(eval_str("abs(v)", &vals), Ok(Number::Real(2.5)));
        assert_eq!(eval_str("min(3, 1.5, 2)", &vals), Ok(Number::Real(1.5)));
        assert_eq!(eval_str("max(3, 1.5, 2)", &vals), Ok(Number::Int(3)));
        assert_eq!(eval_str("round(2.5)", &vals), Ok(Number::Int(2)));
        assert_eq!(eval_str("round(3.5)", &vals), Ok(Number::Int(4)));
        assert_eq!(eval_str("round(1.2345, 2)", &vals), Ok(Number::Real(1.23)));
    }

    #[test]
    fn test_rejects_disallowed_constructs() {
        let vals = values(&[("x", ConditionValue::Int(1))]);
        assert_eq!(
            Formula::parse("pow(x, 2)"),
            Err(FormulaError::DisallowedFunction("pow".to_string()))
        );
        assert_eq!(
            Formula::parse("x.real"),
            Err(FormulaError::AttributeAccess("x".to_string()))
        );
        assert!(matches!(
            Formula::parse("__import__('os')"),
            Err(FormulaError::DisallowedFunction(_)) | Err(FormulaError::Syntax { .. })
        ));
        assert!(matches!(Formula::parse("x ** 2"), Err(FormulaError::Syntax { .. })));
        assert!(matches!(Formula::parse("x +"), Err(FormulaError::Syntax { .. })));
        assert_eq!(
            eval_str("y + 1", &vals),
            Err(FormulaError::UndefinedName("y".to_string()))
        );
    }

    #[test]
    fn test_arity_checked_at_parse() {
        assert!(matches!(Formula::parse("abs(1, 2)"), Err(FormulaError::Arity { .. })));
        assert!(matches!(Formula::parse("min(1)"), Err(FormulaError::Arity { .. })));
    }

    #[test]
    fn test_text_is_not_numeric() {
        let vals = values(&[("color", ConditionValue::Text("red".to_string()))]);
        assert_eq!(
            eval_str("color * 2", &vals),
            Err(FormulaError::NonNumeric("color".to_string()))
        );
    }

    #[test]
    fn test_references_exclude_function_names() {
        let formula = Formula::parse("max(valuation - cost, 0) + round(bonus)").unwrap();
        let refs: Vec<&str> = formula.references().into_iter().collect();
        assert_eq!(refs, vec!["bonus", "cost", "valuation"]);
    }

    #[test]
    fn test_number_literals() {
        let empty = BTreeMap::new();
        assert_eq!(eval_str(".5 + 1", &empty), Ok(Number::Real(1.5)));
        assert_eq!(eval_str("1e2", &empty), Ok(Number::Real(100.0)));
        assert_eq!(eval_str("99999999999999999999", &empty), Err(FormulaError::Overflow));
    }
}
