//! Weight expressions as products of opaque factors.
//!
//! Factors are kept as a sorted set, so joining weights is associative and
//! commutative and repeated factors collapse. The canonical string is the
//! `*`-joined factor list; evaluation is left to the expression engine.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Product of weight factors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeightExpr {
    factors: BTreeSet<String>,
}

impl WeightExpr {
    /// The unit weight.
    pub fn one() -> Self {
        Self::default()
    }

    /// Parse `a*b*(c+d)` into its top-level factors. Empty and `1` factors are dropped.
    pub fn parse(expr: &str) -> Self {
        let mut w = Self::default();
        w.insert(expr);
        w
    }

    fn insert(&mut self, factor: &str) {
        let f = strip_outer_parens(factor.trim());
        if f.is_empty() || f == "1" || f == "1.0" {
            return;
        }
        let parts = split_top_level(f);
        if parts.len() > 1 && !needs_parens(f) {
            for sub in parts {
                self.insert(sub);
            }
        } else {
            self.factors.insert(f.to_string());
        }
    }

    /// Product of two weights.
    pub fn join(&self, other: &WeightExpr) -> WeightExpr {
        let mut out = self.clone();
        out.factors.extend(other.factors.iter().cloned());
        out
    }

    /// Multiply by an expression string.
    pub fn with(&self, expr: &str) -> WeightExpr {
        self.join(&WeightExpr::parse(expr))
    }

    /// Replace factor `nominal` by `alternative`. An empty `nominal` only multiplies.
    pub fn replace(&self, nominal: &str, alternative: &str) -> WeightExpr {
        let mut out = self.clone();
        let nominal = WeightExpr::parse(nominal);
        for f in &nominal.factors {
            out.factors.remove(f);
        }
        out.join(&WeightExpr::parse(alternative))
    }

    /// Whether this is the unit weight.
    pub fn is_one(&self) -> bool {
        self.factors.is_empty()
    }

    /// Factors in canonical order.
    pub fn factors(&self) -> impl Iterator<Item = &str> {
        self.factors.iter().map(String::as_str)
    }

    /// Canonical expression; empty for the unit weight.
    pub fn to_expr(&self) -> String {
        self.factors
            .iter()
            .map(|f| if needs_parens(f) { format!("({f})") } else { f.clone() })
            .collect::<Vec<_>>()
            .join("*")
    }
}

impl fmt::Display for WeightExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_one() { f.write_str("1") } else { f.write_str(&self.to_expr()) }
    }
}

fn split_top_level(expr: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in expr.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '*' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&expr[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn strip_outer_parens(s: &str) -> &str {
    let mut s = s;
    while s.starts_with('(') && s.ends_with(')') && encloses(s) {
        s = s[1..s.len() - 1].trim();
    }
    s
}

fn encloses(s: &str) -> bool {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && i != s.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}

fn needs_parens(f: &str) -> bool {
    let mut depth = 0i32;
    for c in f.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            '+' | '-' | '/' | '?' | ':' | '<' | '>' | '=' | '&' | '|' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}
