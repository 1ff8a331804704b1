//! Lexer and recursive-descent parser for matcher/extractor expressions

use crate::error::EvaluationError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Match,
    NotMatch,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Call {
        name: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Question,
    Colon,
    Eof,
}

const OPERATORS: &[&str] = &[
    "==", "!=", "=~", "!~", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!",
];

fn syntax(position: usize, reason: impl Into<String>) -> EvaluationError {
    EvaluationError::Syntax {
        position,
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, EvaluationError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => tokens.push((Token::LParen, offset)),
            ')' => tokens.push((Token::RParen, offset)),
            '[' => tokens.push((Token::LBracket, offset)),
            ']' => tokens.push((Token::RBracket, offset)),
            ',' => tokens.push((Token::Comma, offset)),
            '?' => tokens.push((Token::Question, offset)),
            ':' => tokens.push((Token::Colon, offset)),
            '"' | '\'' | '`' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let (_, ch) = chars[i];
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    if ch == '\\' && quote != '`' && i + 1 < chars.len() {
                        i += 1;
                        let (_, escaped) = chars[i];
                        match escaped {
                            'n' => text.push('\n'),
                            'r' => text.push('\r'),
                            't' => text.push('\t'),
                            '0' => text.push('\0'),
                            other => text.push(other),
                        }
                    } else {
                        text.push(ch);
                    }
                    i += 1;
                }
                if !closed {
                    return Err(syntax(offset, "unterminated string literal"));
                }
                tokens.push((Token::Str(text), offset));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let is_hex = c == '0'
                    && i + 1 < chars.len()
                    && matches!(chars[i + 1].1, 'x' | 'X');
                if is_hex {
                    i += 2;
                    while i < chars.len() && chars[i].1.is_ascii_hexdigit() {
                        i += 1;
                    }
                    let text: String = chars[start + 2..i].iter().map(|(_, ch)| ch).collect();
                    let value = i64::from_str_radix(&text, 16)
                        .map_err(|_| syntax(offset, "invalid hex literal"))?;
                    tokens.push((Token::Int(value), offset));
                    continue;
                }
                let mut is_float = false;
                while i < chars.len()
                    && (chars[i].1.is_ascii_digit() || (chars[i].1 == '.' && !is_float))
                {
                    if chars[i].1 == '.' {
                        is_float = true;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| syntax(offset, "invalid number"))?)
                } else {
                    match text.parse() {
                        Ok(n) => Token::Int(n),
                        Err(_) => Token::Float(
                            text.parse().map_err(|_| syntax(offset, "invalid number"))?,
                        ),
                    }
                };
                tokens.push((token, offset));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                tokens.push((Token::Ident(text), offset));
                continue;
            }
            _ => {
                let rest = &input[offset..];
                let Some(&op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) else {
                    return Err(syntax(offset, format!("unexpected character {:?}", c)));
                };
                tokens.push((Token::Op(op), offset));
                i += op.chars().count();
                continue;
            }
        }
        i += 1;
    }
    tokens.push((Token::Eof, input.len()));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        if let Token::Op(op) = self.peek() {
            if let Some(found) = ops.iter().find(|candidate| *candidate == op) {
                let found = *found;
                self.pos += 1;
                return Some(found);
            }
        }
        None
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvaluationError> {
        if *self.peek() == expected {
            self.bump();
            Ok(())
        } else {
            Err(syntax(
                self.offset(),
                format!("expected {:?}, found {:?}", expected, self.peek()),
            ))
        }
    }

    fn ternary(&mut self) -> Result<Expr, EvaluationError> {
        let condition = self.binary(0)?;
        if *self.peek() != Token::Question {
            return Ok(condition);
        }
        self.bump();
        let then = self.ternary()?;
        self.expect(Token::Colon)?;
        let otherwise = self.ternary()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    /// Precedence levels, loosest first
    fn binary(&mut self, level: usize) -> Result<Expr, EvaluationError> {
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["==", "!=", "=~", "!~"],
            &["<=", ">=", "<", ">"],
            &["+", "-"],
            &["*", "/", "%"],
        ];
        if level == LEVELS.len() {
            return self.unary();
        }
        let mut left = self.binary(level + 1)?;
        while let Some(op) = self.eat_op(LEVELS[level]) {
            let right = self.binary(level + 1)?;
            left = Expr::Binary {
                op: binary_op(op),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, EvaluationError> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.unary()?),
            }),
            Some(_) => Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            }),
            None => self.primary(),
        }
    }

    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, EvaluationError> {
        let mut args = Vec::new();
        if *self.peek() == close {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            match self.bump() {
                Token::Comma => continue,
                token if token == close => return Ok(args),
                other => {
                    return Err(syntax(
                        self.offset(),
                        format!("expected ',' or {:?}, found {:?}", close, other),
                    ))
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvaluationError> {
        let offset = self.offset();
        match self.bump() {
            Token::Int(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Float(f) => Ok(Expr::Literal(
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "nil" | "null" => Ok(Expr::Literal(Value::Null)),
                _ if *self.peek() == Token::LParen => {
                    self.bump();
                    let args = self.arguments(Token::RParen)?;
                    Ok(Expr::Call { name, args })
                }
                _ => Ok(Expr::Ident(name)),
            },
            Token::LParen => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::List(self.arguments(Token::RBracket)?)),
            other => Err(syntax(offset, format!("unexpected token {:?}", other))),
        }
    }
}

fn binary_op(op: &str) -> BinaryOp {
    match op {
        "||" => BinaryOp::Or,
        "&&" => BinaryOp::And,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "=~" => BinaryOp::Match,
        "!~" => BinaryOp::NotMatch,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        _ => BinaryOp::Rem,
    }
}

/// Parse one expression
pub fn parse(input: &str) -> Result<Expr, EvaluationError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if *parser.peek() != Token::Eof {
        return Err(syntax(
            parser.offset(),
            format!("unexpected trailing {:?}", parser.peek()),
        ));
    }
    Ok(expr)
}

/// Names an expression reads, in order of first appearance
pub fn identifiers(expr: &Expr) -> Vec<String> {
    fn walk(expr: &Expr, out: &mut Vec<String>) {
        match expr {
            Expr::Literal(_) => {}
            Expr::Ident(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Call { args, .. } | Expr::List(args) => {
                args.iter().for_each(|arg| walk(arg, out));
            }
            Expr::Unary { expr, .. } => walk(expr, out),
            Expr::Binary { left, right, .. } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                walk(condition, out);
                walk(then, out);
                walk(otherwise, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(expr, &mut out);
    out
}
