//! Advertisement records and their expression language.
//!
//! An [`Ad`] maps case-insensitive attribute names to [`Expr`] trees. On the
//! wire an ad is a JSON object whose values are expression source text;
//! plain JSON numbers, booleans and `null` are accepted as literals.

mod expr;
mod parse;
mod value;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use expr::{BinaryOp, Expr, Scope, UnaryOp};
pub use parse::parse_expr;
pub use value::Value;

use crate::error::CollectorError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ad {
    /// lowercased name -> (name as first written, expression)
    attrs: BTreeMap<String, (String, Expr)>,
}

impl Ad {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Ad::insert`].
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.insert_expr(name, Expr::literal(value));
    }

    /// Replaces any attribute of the same name regardless of case. The
    /// spelling of the first insert is kept for display.
    pub fn insert_expr(&mut self, name: &str, expr: Expr) {
        let key = name.to_lowercase();
        match self.attrs.get_mut(&key) {
            Some(slot) => slot.1 = expr,
            None => {
                self.attrs.insert(key, (name.to_string(), expr));
            }
        }
    }

    pub fn parse_insert(&mut self, name: &str, src: &str) -> Result<(), CollectorError> {
        let expr = parse_expr(src)?;
        self.insert_expr(name, expr);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Expr> {
        self.attrs.get(&name.to_lowercase()).map(|(_, e)| e)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.contains_key(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Expr> {
        self.attrs.remove(&name.to_lowercase()).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.attrs.values().map(|(n, e)| (n.as_str(), e))
    }

    /// Evaluates an attribute with this ad as MY and no TARGET.
    /// A missing attribute is `undefined`.
    pub fn eval_attr(&self, name: &str) -> Value {
        match self.lookup(name) {
            Some(e) => e.eval(self, None),
            None => Value::Undefined,
        }
    }

    pub fn lookup_string(&self, name: &str) -> Option<String> {
        match self.eval_attr(name) {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn lookup_int(&self, name: &str) -> Option<i64> {
        match self.eval_attr(name) {
            Value::Int(i) => Some(i),
            Value::Real(r) if r.is_finite() => Some(r as i64),
            _ => None,
        }
    }

    pub fn lookup_bool(&self, name: &str) -> Option<bool> {
        self.eval_attr(name).as_bool()
    }

    pub fn my_type(&self) -> Option<String> {
        self.lookup_string("MyType")
    }

    /// Copies every attribute of `other` over this ad.
    pub fn merge_from(&mut self, other: Ad) {
        for (_, (name, expr)) in other.attrs {
            self.insert_expr(&name, expr);
        }
    }

    /// Returns `false` when `other` has no such attribute.
    pub fn copy_attr_from(&mut self, other: &Ad, name: &str) -> bool {
        match other.attrs.get(&name.to_lowercase()) {
            Some((display, expr)) => {
                self.insert_expr(display, expr.clone());
                true
            }
            None => false,
        }
    }

    /// Internal references of one attribute's expression, lowercased.
    pub fn references(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        if let Some(e) = self.lookup(name) {
            e.collect_references(&mut out);
        }
        out
    }

    /// Keeps the listed attributes plus everything they transitively
    /// reference. Names absent from the ad are ignored.
    pub fn project<'a, I>(&self, names: I) -> Ad
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut keep = BTreeSet::new();
        let mut pending: Vec<String> = names.into_iter().map(str::to_lowercase).collect();
        while let Some(name) = pending.pop() {
            if !self.attrs.contains_key(&name) || !keep.insert(name.clone()) {
                continue;
            }
            pending.extend(self.references(&name));
        }
        Ad {
            attrs: self
                .attrs
                .iter()
                .filter(|(k, _)| keep.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CollectorError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Ad, CollectorError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Serialize for Ad {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.attrs.values().map(|(n, e)| (n, e.to_string())))
    }
}

impl<'de> Deserialize<'de> for Ad {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut ad = Ad::new();
        for (name, v) in raw {
            let expr = match v {
                serde_json::Value::String(src) => {
                    parse_expr(&src).map_err(|e| D::Error::custom(format!("{}: {}", name, e)))?
                }
                serde_json::Value::Bool(b) => Expr::literal(b),
                serde_json::Value::Null => Expr::Literal(Value::Undefined),
                serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => Expr::literal(i),
                    (None, Some(r)) => Expr::literal(r),
                    _ => return Err(D::Error::custom(format!("{}: number out of range", name))),
                },
                other => {
                    return Err(D::Error::custom(format!(
                        "{}: unsupported attribute value {}",
                        name, other
                    )))
                }
            };
            ad.insert_expr(&name, expr);
        }
        Ok(ad)
    }
}

impl fmt::Display for Ad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[ ")?;
        for (name, expr) in self.iter() {
            write!(f, "{} = {}; ", name, expr)?;
        }
        f.write_str("]")
    }
}
