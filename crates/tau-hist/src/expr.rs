//! Selection and weight expressions over event branches.
//!
//! Grammar (lowest precedence first): ternary `c ? a : b`, `||`, `&&`,
//! comparisons, `+ -`, `* /`, unary `- !`, atoms (numbers, branch names,
//! parenthesised expressions, calls to `abs fabs sqrt log exp cos sin pow min max`).
//! Booleans are 1.0 / 0.0; any value `> 0` is true.

use std::fmt;

use tau_core::{Error, Result};

use crate::source::ColumnTable;

#[derive(Debug, Clone)]
enum Node {
    Number(f64),
    Var(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(Op, Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Cos,
    Sin,
    Pow,
    Min,
    Max,
}

impl Func {
    fn lookup(name: &str) -> Option<(Func, usize)> {
        let f = match name {
            "abs" | "fabs" => (Func::Abs, 1),
            "sqrt" => (Func::Sqrt, 1),
            "log" => (Func::Log, 1),
            "exp" => (Func::Exp, 1),
            "cos" => (Func::Cos, 1),
            "sin" => (Func::Sin, 1),
            "pow" => (Func::Pow, 2),
            "min" => (Func::Min, 2),
            "max" => (Func::Max, 2),
            _ => return None,
        };
        Some(f)
    }
}

/// A compiled expression ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Node,
    /// Branch names referenced by this expression (ordered by first occurrence).
    pub required_branches: Vec<String>,
}

impl CompiledExpr {
    /// Parse and compile an expression string.
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens: &tokens, pos: 0, branches: Vec::new() };
        let ast = parser.ternary()?;
        if let Some(t) = parser.peek() {
            return Err(expr_error(input, format!("unexpected token {t:?} after expression")));
        }
        Ok(CompiledExpr { source: input.trim().to_string(), ast, required_branches: parser.branches })
    }

    /// The expression text this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression references no branches.
    pub fn is_constant(&self) -> bool {
        self.required_branches.is_empty()
    }

    /// Evaluate for a single row; `values` follows `required_branches`.
    pub fn eval_row(&self, values: &[f64]) -> f64 {
        eval(&self.ast, values)
    }

    /// Evaluate for every row of `table`.
    ///
    /// A missing branch is an input error naming the branch.
    pub fn eval_table(&self, table: &ColumnTable) -> Result<Vec<f64>> {
        let n = table.n_rows();
        let cols: Vec<&[f64]> = self
            .required_branches
            .iter()
            .map(|b| {
                table.column(b).ok_or_else(|| {
                    Error::input("fill", table.name(), format!("missing branch '{b}' in '{}'", self.source))
                })
            })
            .collect::<Result<_>>()?;
        if cols.is_empty() {
            return Ok(vec![eval(&self.ast, &[]); n]);
        }
        let mut row = vec![0.0f64; cols.len()];
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            for (j, col) in cols.iter().enumerate() {
                row[j] = col[i];
            }
            out.push(eval(&self.ast, &row));
        }
        Ok(out)
    }
}

impl fmt::Display for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn expr_error(input: &str, msg: impl fmt::Display) -> Error {
    Error::Config(format!("invalid expression '{input}': {msg}"))
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn binary(op: Op, l: f64, r: f64) -> f64 {
    match op {
        Op::Add => l + r,
        Op::Sub => l - r,
        Op::Mul => l * r,
        Op::Div => l / r,
        Op::Eq => truth((l - r).abs() < f64::EPSILON),
        Op::Ne => truth((l - r).abs() >= f64::EPSILON),
        Op::Lt => truth(l < r),
        Op::Le => truth(l <= r),
        Op::Gt => truth(l > r),
        Op::Ge => truth(l >= r),
        Op::And => truth(l > 0.0 && r > 0.0),
        Op::Or => truth(l > 0.0 || r > 0.0),
    }
}

fn eval(node: &Node, vals: &[f64]) -> f64 {
    match node {
        Node::Number(n) => *n,
        Node::Var(i) => vals[*i],
        Node::Neg(a) => -eval(a, vals),
        Node::Not(a) => truth(eval(a, vals) <= 0.0),
        Node::Ternary(c, a, b) => {
            if eval(c, vals) > 0.0 {
                eval(a, vals)
            } else {
                eval(b, vals)
            }
        }
        Node::Binary(Op::And, a, b) => truth(eval(a, vals) > 0.0 && eval(b, vals) > 0.0),
        Node::Binary(Op::Or, a, b) => truth(eval(a, vals) > 0.0 || eval(b, vals) > 0.0),
        Node::Binary(op, a, b) => binary(*op, eval(a, vals), eval(b, vals)),
        Node::Call(f, args) => {
            let a = eval(&args[0], vals);
            match f {
                Func::Abs => a.abs(),
                Func::Sqrt => a.sqrt(),
                Func::Log => a.ln(),
                Func::Exp => a.exp(),
                Func::Cos => a.cos(),
                Func::Sin => a.sin(),
                Func::Pow => a.powf(eval(&args[1], vals)),
                Func::Min => a.min(eval(&args[1], vals)),
                Func::Max => a.max(eval(&args[1], vals)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Sym(&'static str),
}

const SYMBOLS: [&str; 19] = [
    "&&", "||", "==", "!=", "<=", ">=", "+", "-", "*", "/", "(", ")", ",", "<", ">", "!", "?", ":", "=",
];

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < bytes.len() {
                let d = bytes[i] as char;
                let exp_sign = (d == '+' || d == '-') && matches!(bytes[i - 1], b'e' | b'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let s = &input[start..i];
            let n = s.parse::<f64>().map_err(|_| expr_error(input, format!("invalid number '{s}'")))?;
            tokens.push(Token::Num(n));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            match &input[start..i] {
                "true" => tokens.push(Token::Num(1.0)),
                "false" => tokens.push(Token::Num(0.0)),
                ident => tokens.push(Token::Ident(ident.to_string())),
            }
            continue;
        }
        let rest = &input[i..];
        match SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
            // a lone '=' is accepted as equality, as in ROOT selection strings
            Some(&"=") => tokens.push(Token::Sym("==")),
            Some(&s) => tokens.push(Token::Sym(s)),
            None => return Err(expr_error(input, format!("unexpected character '{c}'"))),
        }
        i += match tokens.last() {
            Some(Token::Sym("==")) if !rest.starts_with("==") => 1,
            Some(Token::Sym(s)) => s.len(),
            _ => 1,
        };
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    branches: Vec<String>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Some(Token::Sym(s)) if *s == sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: &str) -> Result<()> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(Error::Config(format!("invalid expression: expected '{sym}', got {:?}", self.peek())))
        }
    }

    fn var(&mut self, name: &str) -> usize {
        match self.branches.iter().position(|b| b == name) {
            Some(i) => i,
            None => {
                self.branches.push(name.to_string());
                self.branches.len() - 1
            }
        }
    }

    fn ternary(&mut self) -> Result<Node> {
        let cond = self.or()?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let a = self.ternary()?;
        self.expect(":")?;
        let b = self.ternary()?;
        Ok(Node::Ternary(Box::new(cond), Box::new(a), Box::new(b)))
    }

    fn or(&mut self) -> Result<Node> {
        let mut lhs = self.and()?;
        while self.eat("||") {
            lhs = Node::Binary(Op::Or, Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Node> {
        let mut lhs = self.cmp()?;
        while self.eat("&&") {
            lhs = Node::Binary(Op::And, Box::new(lhs), Box::new(self.cmp()?));
        }
        Ok(lhs)
    }

    fn cmp(&mut self) -> Result<Node> {
        let lhs = self.add()?;
        let op = match self.peek() {
            Some(Token::Sym("==")) => Op::Eq,
            Some(Token::Sym("!=")) => Op::Ne,
            Some(Token::Sym("<")) => Op::Lt,
            Some(Token::Sym("<=")) => Op::Le,
            Some(Token::Sym(">")) => Op::Gt,
            Some(Token::Sym(">=")) => Op::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn add(&mut self) -> Result<Node> {
        let mut lhs = self.mul()?;
        loop {
            let op = if self.eat("+") {
                Op::Add
            } else if self.eat("-") {
                Op::Sub
            } else {
                return Ok(lhs);
            };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.mul()?));
        }
    }

    fn mul(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                Op::Mul
            } else if self.eat("/") {
                Op::Div
            } else {
                return Ok(lhs);
            };
            lhs = Node::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Node> {
        if self.eat("-") {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if self.eat("+") {
            return self.unary();
        }
        if self.eat("!") {
            return Ok(Node::Not(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Node> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match tok {
            Some(Token::Num(n)) => Ok(Node::Number(n)),
            Some(Token::Sym("(")) => {
                let e = self.ternary()?;
                self.expect(")")?;
                Ok(e)
            }
            Some(Token::Ident(name)) if self.eat("(") => {
                let (func, arity) = Func::lookup(&name)
                    .ok_or_else(|| Error::Config(format!("invalid expression: unknown function '{name}'")))?;
                let mut args = vec![self.ternary()?];
                while self.eat(",") {
                    args.push(self.ternary()?);
                }
                self.expect(")")?;
                if args.len() != arity {
                    return Err(Error::Config(format!(
                        "invalid expression: '{name}' takes {arity} argument(s), got {}",
                        args.len()
                    )));
                }
                Ok(Node::Call(func, args))
            }
            Some(Token::Ident(name)) => Ok(Node::Var(self.var(&name))),
            other => Err(Error::Config(format!(
                "invalid expression: expected number, branch or '(', got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval_str(s: &str, vals: &[f64]) -> f64 {
        CompiledExpr::compile(s).unwrap().eval_row(vals)
    }

    #[test]
    fn arithmetic_precedence() {
        assert_relative_eq!(eval_str("2 + 3 * 4", &[]), 14.0);
        assert_relative_eq!(eval_str("(1 + 2) * (3 + 4)", &[]), 21.0);
        assert_relative_eq!(eval_str("1.5e2 + 3.0E-1", &[]), 150.3);
        assert_relative_eq!(eval_str("-x + 1", &[5.0]), -4.0);
    }

    #[test]
    fn branches_in_first_occurrence_order() {
        let e = CompiledExpr::compile("genweight*puweight*genweight").unwrap();
        assert_eq!(e.required_branches, vec!["genweight", "puweight"]);
        assert_relative_eq!(e.eval_row(&[2.0, 0.5]), 2.0);
    }

    #[test]
    fn selection_strings() {
        let e = CompiledExpr::compile("q_1*q_2<0 && iso_1<0.15 && dm_2==0 && !(pt_2<20)").unwrap();
        assert_eq!(e.required_branches, vec!["q_1", "q_2", "iso_1", "dm_2", "pt_2"]);
        assert_relative_eq!(e.eval_row(&[1.0, -1.0, 0.1, 0.0, 25.0]), 1.0);
        assert_relative_eq!(e.eval_row(&[1.0, 1.0, 0.1, 0.0, 25.0]), 0.0);
        assert_relative_eq!(e.eval_row(&[1.0, -1.0, 0.1, 0.0, 15.0]), 0.0);
    }

    #[test]
    fn ternary_scale_factor() {
        let s = "(q_1*q_2<0 ? (genmatch_2==5 ? 0.95 : (genmatch_2==2 ? 1.1 : 1.0)) : 1.0)";
        let e = CompiledExpr::compile(s).unwrap();
        assert_relative_eq!(e.eval_row(&[1.0, -1.0, 5.0]), 0.95);
        assert_relative_eq!(e.eval_row(&[1.0, -1.0, 2.0]), 1.1);
        assert_relative_eq!(e.eval_row(&[1.0, -1.0, 6.0]), 1.0);
        assert_relative_eq!(e.eval_row(&[1.0, 1.0, 5.0]), 1.0);
    }

    #[test]
    fn functions_and_arity() {
        assert_relative_eq!(eval_str("sqrt(x)", &[9.0]), 3.0);
        assert_relative_eq!(eval_str("pow(x, 2)", &[3.0]), 9.0);
        assert_relative_eq!(eval_str("fabs(eta_2)<2.3", &[-2.0]), 1.0);
        assert!(CompiledExpr::compile("pow(x)").is_err());
        assert!(CompiledExpr::compile("foo(x)").is_err());
    }

    #[test]
    fn single_equals_and_literals() {
        assert_relative_eq!(eval_str("dm_2=1", &[1.0]), 1.0);
        assert_relative_eq!(eval_str("true && !false", &[]), 1.0);
    }

    #[test]
    fn malformed_expressions_are_config_errors() {
        for bad in ["1 +", "(x", "x ? 1", "x $ y", "x y"] {
            let err = CompiledExpr::compile(bad).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{bad}: {err}");
        }
    }

    #[test]
    fn eval_table_missing_branch() {
        let t = ColumnTable::from_columns("DY", vec![("x".into(), vec![1.0, 2.0])]).unwrap();
        let e = CompiledExpr::compile("x*2").unwrap();
        assert_eq!(e.eval_table(&t).unwrap(), vec![2.0, 4.0]);
        let e = CompiledExpr::compile("y").unwrap();
        assert!(matches!(e.eval_table(&t), Err(Error::Input { .. })));
        let e = CompiledExpr::compile("3").unwrap();
        assert_eq!(e.eval_table(&t).unwrap(), vec![3.0, 3.0]);
    }
}
