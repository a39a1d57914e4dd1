use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use super::value::Value;
use super::Ad;

/// Evaluation nested deeper than this evaluates to `error`. Every tree
/// level and every attribute lookup counts, so self-referential
/// advertisements and long reference chains both stop here.
const MAX_EVAL_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Resolved in MY first, then TARGET.
    Bare,
    My,
    Target,
}

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
    Is,
    Isnt,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub(crate) fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Is | BinaryOp::Isnt => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Is => "=?=",
            BinaryOp::Isnt => "=!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// Expression tree of an attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Attr { scope: Scope, name: String },
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Cond(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn literal(v: impl Into<Value>) -> Self {
        Expr::Literal(v.into())
    }

    /// Evaluates against `my`, with `target` as the optional second record.
    pub fn eval(&self, my: &Ad, target: Option<&Ad>) -> Value {
        Evaluator { my, target, depth: 0 }.eval(self)
    }

    /// `Some(b)` only when the expression evaluates to something boolean.
    pub fn eval_bool(&self, my: &Ad, target: Option<&Ad>) -> Option<bool> {
        self.eval(my, target).as_bool()
    }

    /// Collects the internal (bare and `MY.`) attribute references,
    /// lowercased. `TARGET.` references point outside the record and are
    /// skipped.
    pub fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Attr { scope, name } => {
                if *scope != Scope::Target {
                    out.insert(name.to_lowercase());
                }
            }
            Expr::List(items) | Expr::Call(_, items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Expr::Unary(_, e) => e.collect_references(out),
            Expr::Binary(_, l, r) => {
                l.collect_references(out);
                r.collect_references(out);
            }
            Expr::Cond(c, a, b) => {
                c.collect_references(out);
                a.collect_references(out);
                b.collect_references(out);
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Cond(..) => 0,
            Expr::Binary(op, ..) => op.precedence(),
            _ => 7,
        }
    }
}

struct Evaluator<'a> {
    my: &'a Ad,
    target: Option<&'a Ad>,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    fn swapped(&self) -> Option<Evaluator<'a>> {
        self.target.map(|t| Evaluator {
            my: t,
            target: Some(self.my),
            depth: self.depth + 1,
        })
    }

    fn nested(&self) -> Evaluator<'a> {
        Evaluator {
            my: self.my,
            target: self.target,
            depth: self.depth + 1,
        }
    }

    fn eval(&self, expr: &Expr) -> Value {
        if self.depth > MAX_EVAL_DEPTH {
            return Value::Error;
        }
        self.nested().step(expr)
    }

    fn step(&self, expr: &Expr) -> Value {
        match expr {
            Expr::Literal(v) => v.clone(),
            Expr::Attr { scope, name } => self.lookup(*scope, name),
            Expr::List(items) => Value::List(items.iter().map(|e| self.eval(e)).collect()),
            Expr::Unary(op, e) => unary(*op, self.eval(e)),
            Expr::Binary(BinaryOp::And, l, r) => self.and(l, r),
            Expr::Binary(BinaryOp::Or, l, r) => self.or(l, r),
            Expr::Binary(op, l, r) => binary(*op, self.eval(l), self.eval(r)),
            Expr::Cond(c, a, b) => match self.eval(c) {
                Value::Undefined => Value::Undefined,
                v => match v.as_bool() {
                    Some(true) => self.eval(a),
                    Some(false) => self.eval(b),
                    None => Value::Error,
                },
            },
            Expr::Call(name, args) => self.call(name, args),
        }
    }

    fn lookup(&self, scope: Scope, name: &str) -> Value {
        match scope {
            Scope::My => match self.my.lookup(name) {
                Some(e) => self.nested().eval(e),
                None => Value::Undefined,
            },
            Scope::Target => match self.swapped() {
                Some(ev) => match ev.my.lookup(name) {
                    Some(e) => ev.eval(e),
                    None => Value::Undefined,
                },
                None => Value::Undefined,
            },
            Scope::Bare => match self.my.lookup(name) {
                Some(e) => self.nested().eval(e),
                None => self.lookup(Scope::Target, name),
            },
        }
    }

    fn and(&self, l: &Expr, r: &Expr) -> Value {
        let lv = self.eval(l);
        if lv.is_error() {
            return Value::Error;
        }
        if lv.as_bool() == Some(false) {
            return Value::Bool(false);
        }
        let rv = self.eval(r);
        match (lv.as_bool(), rv.as_bool()) {
            (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ if rv.is_error() => Value::Error,
            _ if lv.is_undefined() || rv.is_undefined() => Value::Undefined,
            _ => Value::Error,
        }
    }

    fn or(&self, l: &Expr, r: &Expr) -> Value {
        let lv = self.eval(l);
        if lv.is_error() {
            return Value::Error;
        }
        if lv.as_bool() == Some(true) {
            return Value::Bool(true);
        }
        let rv = self.eval(r);
        match (lv.as_bool(), rv.as_bool()) {
            (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ if rv.is_error() => Value::Error,
            _ if lv.is_undefined() || rv.is_undefined() => Value::Undefined,
            _ => Value::Error,
        }
    }

    fn call(&self, name: &str, args: &[Expr]) -> Value {
        let name = name.to_lowercase();
        if name == "ifthenelse" {
            return match args {
                [c, a, b] => self.eval(&Expr::Cond(
                    Box::new(c.clone()),
                    Box::new(a.clone()),
                    Box::new(b.clone()),
                )),
                _ => Value::Error,
            };
        }
        let vals: Vec<Value> = args.iter().map(|a| self.eval(a)).collect();
        match (name.as_str(), vals.as_slice()) {
            ("isundefined", [v]) => Value::Bool(v.is_undefined()),
            ("iserror", [v]) => Value::Bool(v.is_error()),
            ("strcat", vs) => {
                let mut out = String::new();
                for v in vs {
                    match v {
                        Value::Undefined => return Value::Undefined,
                        Value::Error | Value::List(_) => return Value::Error,
                        Value::Str(s) => out.push_str(s),
                        other => out.push_str(&other.to_string()),
                    }
                }
                Value::Str(out)
            }
            ("tolower", [Value::Str(s)]) => Value::Str(s.to_lowercase()),
            ("toupper", [Value::Str(s)]) => Value::Str(s.to_uppercase()),
            ("size", [Value::Str(s)]) => Value::Int(s.chars().count() as i64),
            ("size", [Value::List(l)]) => Value::Int(l.len() as i64),
            ("member", [x, Value::List(l)]) => {
                if x.is_undefined() {
                    return Value::Undefined;
                }
                Value::Bool(l.iter().any(|item| {
                    binary(BinaryOp::Eq, x.clone(), item.clone()) == Value::Bool(true)
                }))
            }
            (_, vs) if vs.iter().any(Value::is_undefined) => Value::Undefined,
            _ => Value::Error,
        }
    }
}

fn unary(op: UnaryOp, v: Value) -> Value {
    match (op, v) {
        (_, Value::Undefined) => Value::Undefined,
        (UnaryOp::Not, v) => match v.as_bool() {
            Some(b) => Value::Bool(!b),
            None => Value::Error,
        },
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).unwrap_or(Value::Error),
        (UnaryOp::Neg, Value::Real(r)) => Value::Real(-r),
        _ => Value::Error,
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Value {
    match op {
        BinaryOp::Is => return Value::Bool(l.identical(&r)),
        BinaryOp::Isnt => return Value::Bool(!l.identical(&r)),
        _ => {}
    }
    if l.is_error() || r.is_error() {
        return Value::Error;
    }
    if l.is_undefined() || r.is_undefined() {
        return Value::Undefined;
    }
    match op {
        BinaryOp::Eq | BinaryOp::Ne => match l.loose_cmp(&r) {
            Some(ord) => Value::Bool((ord == Ordering::Equal) == (op == BinaryOp::Eq)),
            None => Value::Error,
        },
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => match l.loose_cmp(&r) {
            Some(ord) => Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
            None => Value::Error,
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, l, r)
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Is | BinaryOp::Isnt => Value::Error,
    }
}

fn arithmetic(op: BinaryOp, l: Value, r: Value) -> Value {
    if let (Value::Int(a), Value::Int(b)) = (&l, &r) {
        let (a, b) = (*a, *b);
        let out = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return out.map(Value::Int).unwrap_or(Value::Error);
    }
    match (l.as_real(), r.as_real()) {
        (Some(a), Some(b)) if l.is_number() && r.is_number() => match op {
            BinaryOp::Add => Value::Real(a + b),
            BinaryOp::Sub => Value::Real(a - b),
            BinaryOp::Mul => Value::Real(a * b),
            BinaryOp::Div if b != 0.0 => Value::Real(a / b),
            BinaryOp::Mod if b != 0.0 => Value::Real(a % b),
            _ => Value::Error,
        },
        _ => Value::Error,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Attr { scope, name } => match scope {
                Scope::Bare => f.write_str(name),
                Scope::My => write!(f, "MY.{}", name),
                Scope::Target => write!(f, "TARGET.{}", name),
            },
            Expr::List(items) => {
                f.write_str("{")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("}")
            }
            Expr::Unary(op, e) => {
                f.write_str(match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                })?;
                if e.precedence() < 7 {
                    write!(f, "({})", e)
                } else {
                    write!(f, "{}", e)
                }
            }
            Expr::Binary(op, l, r) => {
                let p = op.precedence();
                if l.precedence() < p {
                    write!(f, "({})", l)?;
                } else {
                    write!(f, "{}", l)?;
                }
                write!(f, " {} ", op.symbol())?;
                if r.precedence() <= p {
                    write!(f, "({})", r)
                } else {
                    write!(f, "{}", r)
                }
            }
            Expr::Cond(c, a, b) => {
                if c.precedence() == 0 {
                    write!(f, "({})", c)?;
                } else {
                    write!(f, "{}", c)?;
                }
                write!(f, " ? {} : {}", a, b)
            }
            Expr::Call(name, args) => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                f.write_str(")")
            }
        }
    }
}
