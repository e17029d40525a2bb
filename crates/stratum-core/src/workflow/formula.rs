//! Arithmetic formulas for `data_transformation` steps.
//!
//! Grammar (standard precedence, left-associative):
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := unary (('*' | '/') unary)*
//! unary  := ('-' | '+') unary | atom
//! atom   := NUMBER | '{' path '}' | '{{' path '}}' | '(' expr ')'
//! ```
//!
//! Positions in errors are 1-based character columns. Formulas are capped
//! at [`MAX_FORMULA_LEN`] characters and [`MAX_NESTING`] levels of
//! parentheses and signs.

use super::template::{ResolutionError, lookup};
use super::variables::{VariableStore, value_as_f64, value_to_text};

/// Longest accepted formula, in characters.
pub const MAX_FORMULA_LEN: usize = 4096;

/// Deepest accepted nesting of parentheses and unary signs.
pub const MAX_NESTING: usize = 64;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Variable(String),
    Negate(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        position: usize,
    },
}

/// A parsed formula, ready to evaluate against any store.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, ResolutionError> {
        let len = source.chars().count();
        if len > MAX_FORMULA_LEN {
            return Err(syntax(
                MAX_FORMULA_LEN + 1,
                format!("formula longer than {MAX_FORMULA_LEN} characters"),
            ));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            end: len + 1,
        };
        let expr = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(syntax(tok.position, format!("unexpected {}", tok.kind.describe())));
        }
        Ok(Self { expr })
    }

    /// Variable paths the formula reads, in order of appearance.
    pub fn references(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_refs(&self.expr, &mut out);
        out
    }

    pub fn evaluate(&self, store: &VariableStore) -> Result<f64, ResolutionError> {
        let result = eval(&self.expr, store)?;
        if result.is_finite() {
            Ok(result)
        } else {
            Err(ResolutionError::NonFinite)
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(source: &str, store: &VariableStore) -> Result<f64, ResolutionError> {
    Formula::parse(source)?.evaluate(store)
}

fn collect_refs(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Variable(path) => out.push(path.clone()),
        Expr::Negate(inner) => collect_refs(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            collect_refs(lhs, out);
            collect_refs(rhs, out);
        }
    }
}

fn eval(expr: &Expr, store: &VariableStore) -> Result<f64, ResolutionError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Variable(path) => {
            let value = lookup(path, store)?;
            value_as_f64(value).ok_or_else(|| ResolutionError::NotANumber {
                field: format!("formula variable '{path}'"),
                value: value_to_text(value),
            })
        }
        Expr::Negate(inner) => Ok(-eval(inner, store)?),
        Expr::Binary {
            op,
            lhs,
            rhs,
            position,
        } => {
            let a = eval(lhs, store)?;
            let b = eval(rhs, store)?;
            match op {
                BinaryOp::Add => Ok(a + b),
                BinaryOp::Sub => Ok(a - b),
                BinaryOp::Mul => Ok(a * b),
                BinaryOp::Div if b == 0.0 => Err(ResolutionError::DivisionByZero {
                    position: *position,
                }),
                BinaryOp::Div => Ok(a / b),
            }
        }
    }
}

fn syntax(position: usize, message: impl Into<String>) -> ResolutionError {
    ResolutionError::FormulaSyntax {
        position,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Variable(String),
    Op(BinaryOp),
    LParen,
    RParen,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Variable(p) => format!("variable '{p}'"),
            TokenKind::Op(op) => format!(
                "operator '{}'",
                match op {
                    BinaryOp::Add => '+',
                    BinaryOp::Sub => '-',
                    BinaryOp::Mul => '*',
                    BinaryOp::Div => '/',
                }
            ),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    position: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ResolutionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let position = i + 1;
        let kind = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' => TokenKind::Op(BinaryOp::Add),
            '-' => TokenKind::Op(BinaryOp::Sub),
            '*' => TokenKind::Op(BinaryOp::Mul),
            '/' => TokenKind::Op(BinaryOp::Div),
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => {
                let double = chars.get(i + 1) == Some(&'{');
                let start = if double { i + 2 } else { i + 1 };
                let close = if double { "}}" } else { "}" };
                let rest: String = chars[start..].iter().collect();
                let Some(end) = rest.find(close) else {
                    return Err(syntax(position, "unclosed variable reference"));
                };
                let path = rest[..end].trim();
                if path.is_empty() {
                    return Err(syntax(position, "empty variable reference"));
                }
                let consumed = rest[..end].chars().count() + close.len();
                tokens.push(Token {
                    kind: TokenKind::Variable(path.to_string()),
                    position,
                });
                i = start + consumed;
                continue;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| syntax(position, format!("invalid number '{text}'")))?;
                tokens.push(Token {
                    kind: TokenKind::Number(n),
                    position,
                });
                continue;
            }
            other => return Err(syntax(position, format!("unexpected character '{other}'"))),
        };
        tokens.push(Token { kind, position });
        i += 1;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    /// Position reported for "unexpected end of formula".
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_op(&self, ops: &[BinaryOp]) -> Option<(BinaryOp, usize)> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Op(op),
                position,
            }) if ops.contains(op) => Some((*op, *position)),
            _ => None,
        }
    }

    fn expr(&mut self) -> Result<Expr, ResolutionError> {
        let mut lhs = self.term()?;
        while let Some((op, position)) = self.peek_op(&[BinaryOp::Add, BinaryOp::Sub]) {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                position,
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ResolutionError> {
        let mut lhs = self.unary()?;
        while let Some((op, position)) = self.peek_op(&[BinaryOp::Mul, BinaryOp::Div]) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                position,
            };
        }
        Ok(lhs)
    }

    fn descend(&mut self, position: usize) -> Result<(), ResolutionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(syntax(position, "formula nested too deeply"));
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<Expr, ResolutionError> {
        match self.peek_op(&[BinaryOp::Sub, BinaryOp::Add]) {
            Some((op, position)) => {
                self.pos += 1;
                self.descend(position)?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(match op {
                    BinaryOp::Sub => Expr::Negate(Box::new(inner)),
                    _ => inner,
                })
            }
            None => self.atom(),
        }
    }

    fn atom(&mut self) -> Result<Expr, ResolutionError> {
        let Some(tok) = self.next() else {
            return Err(syntax(self.end, "unexpected end of formula"));
        };
        match tok.kind {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Variable(path) => Ok(Expr::Variable(path)),
            TokenKind::LParen => {
                self.descend(tok.position)?;
                let inner = self.expr()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(other) => Err(syntax(
                        other.position,
                        format!("expected ')' but found {}", other.kind.describe()),
                    )),
                    None => Err(syntax(self.end, "missing ')'")),
                }
            }
            other => Err(syntax(tok.position, format!("unexpected {}", other.describe()))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
