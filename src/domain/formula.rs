//! Restricted arithmetic formulas.
//!
//! A formula is checked for unsafe content, parsed once into an [`Expr`]
//! tree at authoring time and then evaluated against a
//! [`ConfigurationContext`] as often as needed.
//!
//! Grammar:
//! ```text
//! comparison := additive (("<" | ">" | "<=" | ">=" | "==" | "<>") additive)?
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/") unary)*
//! unary      := ("-" | "+") unary | primary
//! primary    := number | name | name "(" comparison ")" | "(" comparison ")"
//! ```
//! Comparisons evaluate to 1 or 0.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::context::{as_number, ConfigurationContext};
use crate::domain::error::{DomainError, DomainResult};

/// Call-like fragments rejected wherever they appear.
const FORBIDDEN_SUBSTRINGS: &[&str] = &["exec(", "eval("];

/// Words matched as whole identifiers.
const FORBIDDEN_IDENTIFIERS: &[&str] = &[
    "import",
    "exec",
    "eval",
    "open",
    "file",
    "compile",
    "globals",
    "locals",
    "getattr",
    "setattr",
    "delattr",
    "lambda",
    "subprocess",
    "os",
    "sys",
    "builtins",
];

const ALLOWED_PUNCTUATION: &[char] = &['+', '-', '*', '/', '(', ')', '.', '<', '>', '=', '_'];

const DIVISION_EPSILON: f64 = 1e-12;

/// Deepest nesting of parentheses, calls and unary signs.
const MAX_DEPTH: usize = 128;

/// Longest accepted formula in tokens; bounds the height of the parsed tree.
const MAX_TOKENS: usize = 1024;

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

/// Single-argument functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Ceil,
    Floor,
    Round,
    Sqrt,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "ceil" => Some(Function::Ceil),
            "floor" => Some(Function::Floor),
            "round" => Some(Function::Round),
            "sqrt" => Some(Function::Sqrt),
            _ => None,
        }
    }

    fn apply(self, value: f64) -> f64 {
        match self {
            Function::Abs => value.abs(),
            Function::Ceil => value.ceil(),
            Function::Floor => value.floor(),
            Function::Round => value.round(),
            Function::Sqrt => value.sqrt(),
        }
    }
}

/// Parsed formula tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Negate(Box<Expr>),
    Call(Function, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// A validated formula: the original text plus its parsed tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Validate and parse a formula.
    ///
    /// Unsafe content is rejected before any parsing is attempted.
    pub fn parse(source: &str) -> DomainResult<Self> {
        check_safety(source)?;
        let tokens = tokenize(source)?;
        if let Some(token) = tokens.get(MAX_TOKENS) {
            return Err(DomainError::MalformedFormula {
                position: token.position,
                message: format!("formula is longer than {MAX_TOKENS} tokens"),
            });
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expr = parser.comparison()?;
        if let Some(token) = parser.peek() {
            return Err(DomainError::MalformedFormula {
                position: token.position,
                message: format!("unexpected {}", token.kind),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the context at full precision.
    ///
    /// Every variable must resolve to a number; nothing defaults to 0.
    pub fn evaluate(&self, ctx: &ConfigurationContext) -> DomainResult<f64> {
        let value = eval(&self.expr, ctx)?;
        if !value.is_finite() {
            return Err(DomainError::NonFiniteResult(self.source.clone()));
        }
        Ok(value)
    }

    /// Evaluate and round to `decimals` places (price and weight formulas).
    pub fn evaluate_rounded(&self, ctx: &ConfigurationContext, decimals: u32) -> DomainResult<f64> {
        self.evaluate(ctx).map(|v| round_to(v, decimals))
    }
}

impl TryFrom<String> for Formula {
    type Error = DomainError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Formula::parse(&source)
    }
}

impl From<Formula> for String {
    fn from(formula: Formula) -> Self {
        formula.source
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

// ============================================================================
// SAFETY CHECK
// ============================================================================

/// Reject dunder access, dangerous keywords, foreign characters and
/// unbalanced parentheses. The error names the offending token.
pub fn check_safety(source: &str) -> DomainResult<()> {
    if source.contains("__") {
        return Err(unsafe_token("__"));
    }

    let lowered = source.to_ascii_lowercase();
    if let Some(word) = FORBIDDEN_SUBSTRINGS.iter().find(|w| lowered.contains(*w)) {
        return Err(unsafe_token(word));
    }
    for word in lowered.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if FORBIDDEN_IDENTIFIERS.contains(&word) {
            return Err(unsafe_token(word));
        }
    }

    if let Some(c) = source
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || c.is_whitespace() || ALLOWED_PUNCTUATION.contains(c)))
    {
        return Err(unsafe_token(&c.to_string()));
    }

    let mut depth = 0i32;
    for c in source.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(unsafe_token(")"));
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        return Err(unsafe_token("("));
    }
    Ok(())
}

fn unsafe_token(token: &str) -> DomainError {
    DomainError::UnsafeFormula {
        token: token.to_string(),
    }
}

// ============================================================================
// TOKENIZER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Name(String),
    Op(BinaryOp),
    LParen,
    RParen,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Name(name) => write!(f, "name {name:?}"),
            TokenKind::Op(op) => write!(f, "operator {op:?}"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> DomainResult<Vec<Token>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(|b| b.is_ascii_digit())) {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &source[start..i];
            let value = text.parse::<f64>().map_err(|_| DomainError::MalformedFormula {
                position: start,
                message: format!("invalid number {text:?}"),
            })?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                position: start,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            while i < bytes.len() {
                let b = bytes[i];
                let continues_name = b.is_ascii_alphanumeric()
                    || b == b'_'
                    || (b == b'.'
                        && bytes
                            .get(i + 1)
                            .is_some_and(|n| n.is_ascii_alphabetic() || *n == b'_'));
                if !continues_name {
                    break;
                }
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Name(source[start..i].to_string()),
                position: start,
            });
            continue;
        }

        let next = bytes.get(i + 1).map(|b| *b as char);
        let (kind, width) = match (c, next) {
            ('+', _) => (TokenKind::Op(BinaryOp::Add), 1),
            ('-', _) => (TokenKind::Op(BinaryOp::Sub), 1),
            ('*', _) => (TokenKind::Op(BinaryOp::Mul), 1),
            ('/', _) => (TokenKind::Op(BinaryOp::Div), 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            ('<', Some('=')) => (TokenKind::Op(BinaryOp::Le), 2),
            ('<', Some('>')) => (TokenKind::Op(BinaryOp::Ne), 2),
            ('<', _) => (TokenKind::Op(BinaryOp::Lt), 1),
            ('>', Some('=')) => (TokenKind::Op(BinaryOp::Ge), 2),
            ('>', _) => (TokenKind::Op(BinaryOp::Gt), 1),
            ('=', Some('=')) => (TokenKind::Op(BinaryOp::Eq), 2),
            _ => {
                return Err(DomainError::MalformedFormula {
                    position: start,
                    message: format!("unexpected character {c:?}"),
                })
            }
        };
        tokens.push(Token {
            kind,
            position: start,
        });
        i += width;
    }

    Ok(tokens)
}

// ============================================================================
// PARSER
// ============================================================================

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    end: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn peek_op(&self, ops: &[BinaryOp]) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Op(op),
                ..
            }) if ops.contains(op) => Some(*op),
            _ => None,
        }
    }

    fn error_here(&self, message: impl Into<String>) -> DomainError {
        DomainError::MalformedFormula {
            position: self.peek().map(|t| t.position).unwrap_or(self.end),
            message: message.into(),
        }
    }

    /// Enter one nesting level; paired with `self.depth -= 1` on success.
    fn descend(&mut self) -> DomainResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error_here(format!("formula nests deeper than {MAX_DEPTH} levels")));
        }
        Ok(())
    }

    fn comparison(&mut self) -> DomainResult<Expr> {
        use BinaryOp::*;
        let left = self.additive()?;
        if let Some(op) = self.peek_op(&[Lt, Gt, Le, Ge, Eq, Ne]) {
            self.pos += 1;
            let right = self.additive()?;
            if self.peek_op(&[Lt, Gt, Le, Ge, Eq, Ne]).is_some() {
                return Err(self.error_here("comparisons cannot be chained"));
            }
            return Ok(Expr::Binary(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn additive(&mut self) -> DomainResult<Expr> {
        let mut left = self.term()?;
        while let Some(op) = self.peek_op(&[BinaryOp::Add, BinaryOp::Sub]) {
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> DomainResult<Expr> {
        let mut left = self.unary()?;
        while let Some(op) = self.peek_op(&[BinaryOp::Mul, BinaryOp::Div]) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> DomainResult<Expr> {
        match self.peek_op(&[BinaryOp::Sub, BinaryOp::Add]) {
            Some(op) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(match op {
                    BinaryOp::Sub => Expr::Negate(Box::new(inner)),
                    _ => inner,
                })
            }
            None => self.primary(),
        }
    }

    fn primary(&mut self) -> DomainResult<Expr> {
        let Some(token) = self.next() else {
            return Err(DomainError::MalformedFormula {
                position: self.end,
                message: "unexpected end of formula".into(),
            });
        };
        match &token.kind {
            TokenKind::Number(n) => Ok(Expr::Number(*n)),
            TokenKind::Name(name) => {
                if matches!(self.peek(), Some(Token { kind: TokenKind::LParen, .. })) {
                    let function = Function::lookup(name).ok_or_else(|| DomainError::MalformedFormula {
                        position: token.position,
                        message: format!("unknown function {name:?}"),
                    })?;
                    self.pos += 1;
                    self.descend()?;
                    let arg = self.comparison()?;
                    self.expect_rparen()?;
                    self.depth -= 1;
                    Ok(Expr::Call(function, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name.clone()))
                }
            }
            TokenKind::LParen => {
                self.descend()?;
                let inner = self.comparison()?;
                self.expect_rparen()?;
                self.depth -= 1;
                Ok(inner)
            }
            other => Err(DomainError::MalformedFormula {
                position: token.position,
                message: format!("unexpected {other}"),
            }),
        }
    }

    fn expect_rparen(&mut self) -> DomainResult<()> {
        match self.next() {
            Some(Token {
                kind: TokenKind::RParen,
                ..
            }) => Ok(()),
            _ => {
                self.pos -= 1;
                Err(self.error_here("expected ')'"))
            }
        }
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

fn eval(expr: &Expr, ctx: &ConfigurationContext) -> DomainResult<f64> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(name) => resolve_variable(name, ctx),
        Expr::Negate(inner) => Ok(-eval(inner, ctx)?),
        Expr::Call(function, arg) => Ok(function.apply(eval(arg, ctx)?)),
        Expr::Binary(op, left, right) => {
            let l = eval(left, ctx)?;
            let r = eval(right, ctx)?;
            let truth = |b: bool| if b { 1.0 } else { 0.0 };
            Ok(match op {
                BinaryOp::Add => l + r,
                BinaryOp::Sub => l - r,
                BinaryOp::Mul => l * r,
                BinaryOp::Div => {
                    if r.abs() < DIVISION_EPSILON {
                        return Err(DomainError::DivisionByZero);
                    }
                    l / r
                }
                BinaryOp::Lt => truth(l < r),
                BinaryOp::Gt => truth(l > r),
                BinaryOp::Le => truth(l <= r),
                BinaryOp::Ge => truth(l >= r),
                BinaryOp::Eq => truth((l - r).abs() < f64::EPSILON),
                BinaryOp::Ne => truth((l - r).abs() >= f64::EPSILON),
            })
        }
    }
}

fn resolve_variable(name: &str, ctx: &ConfigurationContext) -> DomainResult<f64> {
    match ctx.get(name) {
        None | Some(Value::Null) => Err(DomainError::MissingVariable(name.to_string())),
        Some(value) => as_number(value).ok_or_else(|| DomainError::NonNumericVariable {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
