//! Recursive-descent parser for attribute expressions.
//!
//! Precedence, loosest first: `?:`, `||`, `&&`, equality (`== != =?= =!=`,
//! plus the `is`/`isnt` keywords), relational, additive, multiplicative,
//! unary.

use super::expr::{BinaryOp, Expr, Scope, UnaryOp};
use super::value::Value;
use crate::error::CollectorError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Real(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 24] = [
    "=?=", "=!=", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "!", "+", "-", "*", "/", "%",
    "(", ")", "{", "}", ",", "?", ":", ".",
];

fn parse_error(reason: impl Into<String>) -> CollectorError {
    CollectorError::Parse {
        reason: reason.into(),
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, CollectorError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut real = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                real = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    real = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            if real {
                let r = text
                    .parse::<f64>()
                    .map_err(|e| parse_error(format!("bad real {}: {}", text, e)))?;
                tokens.push(Token::Real(r));
            } else {
                let n = text
                    .parse::<i64>()
                    .map_err(|e| parse_error(format!("bad integer {}: {}", text, e)))?;
                tokens.push(Token::Int(n));
            }
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        if c == '"' {
            i += 1;
            let mut s = String::new();
            loop {
                match chars.get(i) {
                    None => return Err(parse_error("unterminated string literal")),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let esc = chars
                            .get(i + 1)
                            .ok_or_else(|| parse_error("dangling escape"))?;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 3)].iter().collect();
        match OPERATORS.iter().copied().find(|op| rest.starts_with(*op)) {
            Some(op) => {
                tokens.push(Token::Op(op));
                i += op.len();
            }
            None => return Err(parse_error(format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

/// Deepest expression tree the parser will build. Parenthesised groups,
/// lists, call arguments, unary operators and each link of a binary chain
/// all count.
pub const MAX_NESTING: usize = 256;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), CollectorError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(parse_error(format!("expected '{}'", op)))
        }
    }

    fn descend(&mut self) -> Result<(), CollectorError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(parse_error(format!(
                "expression nested deeper than {}",
                MAX_NESTING
            )));
        }
        Ok(())
    }

    fn ternary(&mut self) -> Result<Expr, CollectorError> {
        self.descend()?;
        let cond = self.binary(1)?;
        let expr = if self.eat_op("?") {
            let a = self.ternary()?;
            self.expect_op(":")?;
            let b = self.ternary()?;
            Expr::Cond(Box::new(cond), Box::new(a), Box::new(b))
        } else {
            cond
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        match self.peek()? {
            Token::Op(op) => Some(match *op {
                "||" => BinaryOp::Or,
                "&&" => BinaryOp::And,
                "==" => BinaryOp::Eq,
                "!=" => BinaryOp::Ne,
                "=?=" => BinaryOp::Is,
                "=!=" => BinaryOp::Isnt,
                "<" => BinaryOp::Lt,
                "<=" => BinaryOp::Le,
                ">" => BinaryOp::Gt,
                ">=" => BinaryOp::Ge,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Sub,
                "*" => BinaryOp::Mul,
                "/" => BinaryOp::Div,
                "%" => BinaryOp::Mod,
                _ => return None,
            }),
            Token::Ident(word) if word.eq_ignore_ascii_case("is") => Some(BinaryOp::Is),
            Token::Ident(word) if word.eq_ignore_ascii_case("isnt") => Some(BinaryOp::Isnt),
            _ => None,
        }
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, CollectorError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        while let Some(op) = self.binary_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            // a left-leaning chain grows the tree without recursing here
            self.descend()?;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CollectorError> {
        if self.eat_op("!") {
            self.descend()?;
            let e = Expr::Unary(UnaryOp::Not, Box::new(self.unary()?));
            self.depth -= 1;
            return Ok(e);
        }
        if self.eat_op("-") {
            self.descend()?;
            let e = match self.unary()? {
                Expr::Literal(Value::Int(i)) => Expr::Literal(Value::Int(-i)),
                Expr::Literal(Value::Real(r)) => Expr::Literal(Value::Real(-r)),
                other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
            };
            self.depth -= 1;
            return Ok(e);
        }
        if self.eat_op("+") {
            self.descend()?;
            let e = self.unary()?;
            self.depth -= 1;
            return Ok(e);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, CollectorError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Real(r)) => Ok(Expr::Literal(Value::Real(r))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Op("(")) => {
                let e = self.ternary()?;
                self.expect_op(")")?;
                Ok(e)
            }
            Some(Token::Op("{")) => {
                let items = self.comma_list("}")?;
                Ok(Expr::List(items))
            }
            Some(Token::Ident(word)) => self.identifier(word),
            Some(other) => Err(parse_error(format!("unexpected token {:?}", other))),
            None => Err(parse_error("unexpected end of expression")),
        }
    }

    fn identifier(&mut self, word: String) -> Result<Expr, CollectorError> {
        match word.to_lowercase().as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "undefined" => return Ok(Expr::Literal(Value::Undefined)),
            "error" => return Ok(Expr::Literal(Value::Error)),
            _ => {}
        }
        if self.eat_op("(") {
            let args = self.comma_list(")")?;
            return Ok(Expr::Call(word, args));
        }
        let scope = if word.eq_ignore_ascii_case("my") {
            Some(Scope::My)
        } else if word.eq_ignore_ascii_case("target") {
            Some(Scope::Target)
        } else {
            None
        };
        if let Some(scope) = scope {
            if self.eat_op(".") {
                return match self.next() {
                    Some(Token::Ident(name)) => Ok(Expr::Attr { scope, name }),
                    _ => Err(parse_error(format!("expected attribute name after {}.", word))),
                };
            }
        }
        Ok(Expr::Attr {
            scope: Scope::Bare,
            name: word,
        })
    }

    fn comma_list(&mut self, close: &str) -> Result<Vec<Expr>, CollectorError> {
        let mut items = Vec::new();
        if self.eat_op(close) {
            return Ok(items);
        }
        loop {
            items.push(self.ternary()?);
            if self.eat_op(close) {
                return Ok(items);
            }
            self.expect_op(",")?;
        }
    }
}

/// Parses a complete expression; trailing input is an error.
pub fn parse_expr(src: &str) -> Result<Expr, CollectorError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(parse_error("empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.ternary()?;
    if parser.pos < parser.tokens.len() {
        return Err(parse_error(format!(
            "trailing input after expression: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}
