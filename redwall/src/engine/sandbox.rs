// redwall/src/engine/sandbox.rs
//
// Restricted condition evaluator for policy rules.
//
// A purpose-built expression interpreter rather than an embedded scripting
// VM: the grammar has literals, context identifiers, member access, a fixed
// set of string/array/regex methods, arithmetic, comparison, logic, and a
// ternary. No loops, no assignment, no function definitions, no host access
// of any kind. Evaluation carries an operation budget and a wall-clock
// deadline; any parse error, type fault, or overrun surfaces as a
// SandboxFault and the caller treats the rule as non-matching.
//
// Condition examples:
//   cost > 0.50
//   tools.includes("file_read") && cost > 0.01
//   model.startsWith("gpt-4") || /sonnet/i.test(model)
//   event.promptTokens + event.completionTokens > 20000

use std::collections::HashMap;
use std::time::{Duration, Instant};

use regex::RegexBuilder;

pub const MAX_CONDITION_CHARS: usize = 4_096;
pub const MAX_PARSE_DEPTH: usize = 64;
pub const EVAL_FUEL: u32 = 100_000;
const DEADLINE_CHECK_MASK: u32 = 0xFF;
const REGEX_SIZE_LIMIT: usize = 1 << 16;

// ── Values ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
    Obj(HashMap<String, Value>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::List(_) | Value::Obj(_) => true,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "array",
            Value::Obj(_) => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxFault {
    Parse(String),
    Type(String),
    Budget,
    Deadline,
}

impl std::fmt::Display for SandboxFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(m) => write!(f, "parse error: {}", m),
            Self::Type(m) => write!(f, "type error: {}", m),
            Self::Budget => write!(f, "operation budget exhausted"),
            Self::Deadline => write!(f, "deadline exceeded"),
        }
    }
}

// ── Tokens ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Regex { src: String, ci: bool },
    Ident(String),
    True,
    False,
    Null,
    LParen, RParen, LBracket, RBracket,
    Dot, Comma, Question, Colon,
    Plus, Minus, Star, Slash, Percent,
    Not, Lt, Gt, Le, Ge, EqEq, NotEq,
    AndAnd, OrOr,
}

fn lex(src: &str) -> Result<Vec<Tok>, SandboxFault> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;

    // True when a `/` here starts a regex literal (operand position).
    fn regex_position(toks: &[Tok]) -> bool {
        !matches!(
            toks.last(),
            Some(Tok::Num(_))
                | Some(Tok::Str(_))
                | Some(Tok::Regex { .. })
                | Some(Tok::Ident(_))
                | Some(Tok::True)
                | Some(Tok::False)
                | Some(Tok::Null)
                | Some(Tok::RParen)
                | Some(Tok::RBracket)
        )
    }

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => { toks.push(Tok::LParen); i += 1 }
            ')' => { toks.push(Tok::RParen); i += 1 }
            '[' => { toks.push(Tok::LBracket); i += 1 }
            ']' => { toks.push(Tok::RBracket); i += 1 }
            '.' if !chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                toks.push(Tok::Dot);
                i += 1
            }
            ',' => { toks.push(Tok::Comma); i += 1 }
            '?' => { toks.push(Tok::Question); i += 1 }
            ':' => { toks.push(Tok::Colon); i += 1 }
            '+' => { toks.push(Tok::Plus); i += 1 }
            '-' => { toks.push(Tok::Minus); i += 1 }
            '*' => { toks.push(Tok::Star); i += 1 }
            '%' => { toks.push(Tok::Percent); i += 1 }
            '/' if regex_position(&toks) => {
                // Regex literal: /pattern/flags
                let mut pat = String::new();
                let mut j = i + 1;
                let mut escaped = false;
                loop {
                    let Some(&ch) = chars.get(j) else {
                        return Err(SandboxFault::Parse("unterminated regex literal".into()));
                    };
                    if escaped {
                        pat.push('\\');
                        pat.push(ch);
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '/' {
                        break;
                    } else {
                        pat.push(ch);
                    }
                    j += 1;
                }
                j += 1; // closing slash
                let mut ci = false;
                while let Some(&fc) = chars.get(j) {
                    if fc.is_ascii_alphabetic() {
                        if fc == 'i' {
                            ci = true;
                        }
                        j += 1;
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Regex { src: pat, ci });
                i = j;
            }
            '/' => { toks.push(Tok::Slash); i += 1 }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    // != and !==
                    i += 2;
                    if chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                    toks.push(Tok::NotEq);
                } else {
                    toks.push(Tok::Not);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    if chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                    toks.push(Tok::EqEq);
                } else {
                    return Err(SandboxFault::Parse("assignment is not allowed".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    toks.push(Tok::AndAnd);
                    i += 2;
                } else {
                    return Err(SandboxFault::Parse("bitwise operators are not allowed".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    toks.push(Tok::OrOr);
                    i += 2;
                } else {
                    return Err(SandboxFault::Parse("bitwise operators are not allowed".into()));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                let mut j = i + 1;
                loop {
                    let Some(&ch) = chars.get(j) else {
                        return Err(SandboxFault::Parse("unterminated string literal".into()));
                    };
                    if ch == '\\' {
                        let Some(&next) = chars.get(j + 1) else {
                            return Err(SandboxFault::Parse("unterminated string escape".into()));
                        };
                        s.push(match next {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                        j += 2;
                    } else if ch == quote {
                        break;
                    } else {
                        s.push(ch);
                        j += 1;
                    }
                }
                toks.push(Tok::Str(s));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut j = i;
                while chars
                    .get(j)
                    .map(|c| c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E')
                    .unwrap_or(false)
                {
                    j += 1;
                }
                let text: String = chars[i..j].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| SandboxFault::Parse(format!("bad number `{}`", text)))?;
                toks.push(Tok::Num(n));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
                let mut j = i;
                while chars
                    .get(j)
                    .map(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '$')
                    .unwrap_or(false)
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                toks.push(match word.as_str() {
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" | "undefined" => Tok::Null,
                    _ => Tok::Ident(word),
                });
                i = j;
            }
            other => {
                return Err(SandboxFault::Parse(format!("unexpected character `{}`", other)));
            }
        }
    }
    Ok(toks)
}

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    RegexLit { src: String, ci: bool },
    Var(String),
    ListLit(Vec<Expr>),
    Member(Box<Expr>, String),
    Call(Box<Expr>, String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnOp { Not, Neg }

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add, Sub, Mul, Div, Mod,
    Lt, Gt, Le, Ge, Eq, Ne,
    And, Or,
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: Tok) -> Result<(), SandboxFault> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            other => Err(SandboxFault::Parse(format!(
                "expected {:?}, found {:?}",
                tok, other
            ))),
        }
    }

    fn enter(&mut self) -> Result<(), SandboxFault> {
        self.depth += 1;
        if self.depth > MAX_PARSE_DEPTH {
            return Err(SandboxFault::Parse("expression nests too deeply".into()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn expr(&mut self) -> Result<Expr, SandboxFault> {
        self.enter()?;
        let cond = self.or()?;
        let out = if matches!(self.peek(), Some(Tok::Question)) {
            self.next();
            let then = self.expr()?;
            self.expect(Tok::Colon)?;
            let alt = self.expr()?;
            Expr::Ternary(Box::new(cond), Box::new(then), Box::new(alt))
        } else {
            cond
        };
        self.leave();
        Ok(out)
    }

    fn or(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.and()?;
        while matches!(self.peek(), Some(Tok::OrOr)) {
            self.next();
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.equality()?;
        while matches!(self.peek(), Some(Tok::AndAnd)) {
            self.next();
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.peek() {
                Some(Tok::EqEq) => BinOp::Eq,
                Some(Tok::NotEq) => BinOp::Ne,
                _ => break,
            };
            self.next();
            let rhs = self.relational()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Lt) => BinOp::Lt,
                Some(Tok::Gt) => BinOp::Gt,
                Some(Tok::Le) => BinOp::Le,
                Some(Tok::Ge) => BinOp::Ge,
                _ => break,
            };
            self.next();
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxFault> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                Some(Tok::Percent) => BinOp::Mod,
                _ => break,
            };
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, SandboxFault> {
        self.enter()?;
        let out = match self.peek() {
            Some(Tok::Not) => {
                self.next();
                Expr::Unary(UnOp::Not, Box::new(self.unary()?))
            }
            Some(Tok::Minus) => {
                self.next();
                Expr::Unary(UnOp::Neg, Box::new(self.unary()?))
            }
            _ => self.postfix()?,
        };
        self.leave();
        Ok(out)
    }

    fn postfix(&mut self) -> Result<Expr, SandboxFault> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.next();
                    let name = match self.next() {
                        Some(Tok::Ident(name)) => name,
                        other => {
                            return Err(SandboxFault::Parse(format!(
                                "expected member name, found {:?}",
                                other
                            )))
                        }
                    };
                    if matches!(self.peek(), Some(Tok::LParen)) {
                        self.next();
                        let mut args = Vec::new();
                        if !matches!(self.peek(), Some(Tok::RParen)) {
                            loop {
                                args.push(self.expr()?);
                                if matches!(self.peek(), Some(Tok::Comma)) {
                                    self.next();
                                } else {
                                    break;
                                }
                            }
                        }
                        self.expect(Tok::RParen)?;
                        expr = Expr::Call(Box::new(expr), name, args);
                    } else {
                        expr = Expr::Member(Box::new(expr), name);
                    }
                }
                Some(Tok::LBracket) => {
                    self.next();
                    let idx = self.expr()?;
                    self.expect(Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, SandboxFault> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Lit(Value::Num(n))),
            Some(Tok::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Tok::Regex { src, ci }) => Ok(Expr::RegexLit { src, ci }),
            Some(Tok::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Tok::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Tok::Null) => Ok(Expr::Lit(Value::Null)),
            Some(Tok::Ident(name)) => Ok(Expr::Var(name)),
            Some(Tok::LParen) => {
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Tok::RBracket)) {
                    loop {
                        items.push(self.expr()?);
                        if matches!(self.peek(), Some(Tok::Comma)) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Tok::RBracket)?;
                Ok(Expr::ListLit(items))
            }
            other => Err(SandboxFault::Parse(format!(
                "unexpected token {:?}",
                other
            ))),
        }
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

pub struct Context {
    vars: HashMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self { vars: HashMap::new() }
    }

    pub fn bind(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

struct Eval<'a> {
    ctx: &'a Context,
    fuel: u32,
    deadline: Instant,
    ops: u32,
}

impl<'a> Eval<'a> {
    fn tick(&mut self) -> Result<(), SandboxFault> {
        if self.fuel == 0 {
            return Err(SandboxFault::Budget);
        }
        self.fuel -= 1;
        self.ops = self.ops.wrapping_add(1);
        if self.ops & DEADLINE_CHECK_MASK == 0 && Instant::now() >= self.deadline {
            return Err(SandboxFault::Deadline);
        }
        Ok(())
    }

    fn check_deadline(&self) -> Result<(), SandboxFault> {
        if Instant::now() >= self.deadline {
            return Err(SandboxFault::Deadline);
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxFault> {
        self.tick()?;
        match expr {
            Expr::Lit(v) => Ok(v.clone()),
            Expr::RegexLit { .. } => Err(SandboxFault::Type(
                "a regex literal can only be used via .test() or .match()".into(),
            )),
            Expr::Var(name) => Ok(self.ctx.vars.get(name).cloned().unwrap_or(Value::Null)),
            Expr::ListLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::List(out))
            }
            Expr::Member(base, name) => {
                let base = self.eval(base)?;
                self.member(&base, name)
            }
            Expr::Index(base, idx) => {
                let base = self.eval(base)?;
                let idx = self.eval(idx)?;
                match (&base, &idx) {
                    (Value::List(items), Value::Num(n)) => {
                        let i = *n as usize;
                        Ok(items.get(i).cloned().unwrap_or(Value::Null))
                    }
                    (Value::Obj(map), Value::Str(k)) => {
                        Ok(map.get(k).cloned().unwrap_or(Value::Null))
                    }
                    _ => Err(SandboxFault::Type(format!(
                        "cannot index {} with {}",
                        base.type_name(),
                        idx.type_name()
                    ))),
                }
            }
            Expr::Call(base, name, args) => self.call(base, name, args),
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnOp::Neg => match v {
                        Value::Num(n) => Ok(Value::Num(-n)),
                        other => Err(SandboxFault::Type(format!(
                            "cannot negate {}",
                            other.type_name()
                        ))),
                    },
                }
            }
            Expr::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Expr::Ternary(cond, then, alt) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(alt)
                }
            }
        }
    }

    fn binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value, SandboxFault> {
        // Short-circuit logic first.
        match op {
            BinOp::And => {
                let l = self.eval(lhs)?;
                if !l.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(rhs)?.truthy()));
            }
            BinOp::Or => {
                let l = self.eval(lhs)?;
                if l.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(rhs)?.truthy()));
            }
            _ => {}
        }

        let l = self.eval(lhs)?;
        let r = self.eval(rhs)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
            BinOp::Add => match (&l, &r) {
                (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
                (Value::Str(a), b) => Ok(Value::Str(format!("{}{}", a, display(b)))),
                (a, Value::Str(b)) => Ok(Value::Str(format!("{}{}", display(a), b))),
                _ => Err(SandboxFault::Type(format!(
                    "cannot add {} and {}",
                    l.type_name(),
                    r.type_name()
                ))),
            },
            BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let (Value::Num(a), Value::Num(b)) = (&l, &r) else {
                    return Err(SandboxFault::Type(format!(
                        "arithmetic needs numbers, got {} and {}",
                        l.type_name(),
                        r.type_name()
                    )));
                };
                Ok(Value::Num(match op {
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    _ => a % b,
                }))
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let ord = match (&l, &r) {
                    (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => None,
                };
                let Some(ord) = ord else {
                    return Err(SandboxFault::Type(format!(
                        "cannot compare {} and {}",
                        l.type_name(),
                        r.type_name()
                    )));
                };
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Le => ord.is_le(),
                    _ => ord.is_ge(),
                }))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn member(&mut self, base: &Value, name: &str) -> Result<Value, SandboxFault> {
        match (base, name) {
            (Value::Str(s), "length") => Ok(Value::Num(s.chars().count() as f64)),
            (Value::List(items), "length") => Ok(Value::Num(items.len() as f64)),
            (Value::Obj(map), _) => Ok(map.get(name).cloned().unwrap_or(Value::Null)),
            (Value::Null, _) => Ok(Value::Null),
            _ => Err(SandboxFault::Type(format!(
                "{} has no property `{}`",
                base.type_name(),
                name
            ))),
        }
    }

    fn call(&mut self, base: &Expr, name: &str, args: &[Expr]) -> Result<Value, SandboxFault> {
        // Regex methods evaluate the receiver specially: the literal itself
        // is not a first-class value.
        if let Expr::RegexLit { src, ci } = base {
            let arg = self.eval_single_arg(args)?;
            let Value::Str(text) = arg else {
                return Err(SandboxFault::Type("regex methods take a string".into()));
            };
            return match name {
                "test" => Ok(Value::Bool(self.regex_match(src, *ci, &text)?)),
                other => Err(SandboxFault::Type(format!(
                    "regex has no method `{}`",
                    other
                ))),
            };
        }

        let recv = self.eval(base)?;
        match (&recv, name) {
            (Value::Str(s), "includes") => {
                let needle = self.str_arg(args)?;
                self.charge(s.len())?;
                Ok(Value::Bool(s.contains(&needle)))
            }
            (Value::Str(s), "startsWith") => {
                let needle = self.str_arg(args)?;
                Ok(Value::Bool(s.starts_with(&needle)))
            }
            (Value::Str(s), "endsWith") => {
                let needle = self.str_arg(args)?;
                Ok(Value::Bool(s.ends_with(&needle)))
            }
            (Value::Str(s), "toLowerCase") => {
                self.charge(s.len())?;
                Ok(Value::Str(s.to_lowercase()))
            }
            (Value::Str(s), "toUpperCase") => {
                self.charge(s.len())?;
                Ok(Value::Str(s.to_uppercase()))
            }
            (Value::Str(s), "match") => {
                let Some(Expr::RegexLit { src, ci }) = args.first() else {
                    return Err(SandboxFault::Type(".match() takes a regex literal".into()));
                };
                Ok(Value::Bool(self.regex_match(src, *ci, s)?))
            }
            (Value::List(items), "includes") => {
                let needle = self.eval_single_arg(args)?;
                self.charge(items.len())?;
                Ok(Value::Bool(items.iter().any(|v| values_equal(v, &needle))))
            }
            _ => Err(SandboxFault::Type(format!(
                "{} has no method `{}`",
                recv.type_name(),
                name
            ))),
        }
    }

    fn regex_match(&mut self, src: &str, ci: bool, text: &str) -> Result<bool, SandboxFault> {
        self.charge(src.len() + text.len())?;
        self.check_deadline()?;
        let re = RegexBuilder::new(src)
            .case_insensitive(ci)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| SandboxFault::Parse(format!("bad regex: {}", e)))?;
        Ok(re.is_match(text))
    }

    fn eval_single_arg(&mut self, args: &[Expr]) -> Result<Value, SandboxFault> {
        let [arg] = args else {
            return Err(SandboxFault::Type("expected exactly one argument".into()));
        };
        self.eval(arg)
    }

    fn str_arg(&mut self, args: &[Expr]) -> Result<String, SandboxFault> {
        match self.eval_single_arg(args)? {
            Value::Str(s) => Ok(s),
            other => Err(SandboxFault::Type(format!(
                "expected a string argument, got {}",
                other.type_name()
            ))),
        }
    }

    /// Charge fuel proportional to the size of a scan-style operation.
    fn charge(&mut self, units: usize) -> Result<(), SandboxFault> {
        let units = (units / 64) as u32;
        if units >= self.fuel {
            return Err(SandboxFault::Budget);
        }
        self.fuel -= units;
        Ok(())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => false,
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Num(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                format!("{}", *n as i64)
            } else {
                format!("{}", n)
            }
        }
        Value::Str(s) => s.clone(),
        Value::List(_) => "[array]".to_string(),
        Value::Obj(_) => "[object]".to_string(),
    }
}

/// Evaluate a condition against a context under a wall-clock budget.
pub fn evaluate(condition: &str, ctx: &Context, budget: Duration) -> Result<Value, SandboxFault> {
    if condition.chars().count() > MAX_CONDITION_CHARS {
        return Err(SandboxFault::Parse("condition too long".into()));
    }
    let toks = lex(condition)?;
    if toks.is_empty() {
        return Err(SandboxFault::Parse("empty condition".into()));
    }
    let mut parser = Parser { toks, pos: 0, depth: 0 };
    let ast = parser.expr()?;
    if parser.pos != parser.toks.len() {
        return Err(SandboxFault::Parse(format!(
            "trailing input at token {}",
            parser.pos
        )));
    }

    let mut eval = Eval {
        ctx,
        fuel: EVAL_FUEL,
        deadline: Instant::now() + budget,
        ops: 0,
    };
    eval.eval(&ast)
}

/// True iff the condition evaluated to boolean true within budget.
pub fn matches(condition: &str, ctx: &Context, budget: Duration) -> Result<bool, SandboxFault> {
    Ok(matches!(evaluate(condition, ctx, budget)?, Value::Bool(true)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUDGET: Duration = Duration::from_millis(10);

    fn ctx() -> Context {
        let mut event = HashMap::new();
        event.insert("model".to_string(), Value::Str("gpt-4o".into()));
        event.insert("promptTokens".to_string(), Value::Num(1200.0));
        event.insert("completionTokens".to_string(), Value::Num(300.0));
        Context::new()
            .bind("cost", Value::Num(0.75))
            .bind("model", Value::Str("gpt-4o".into()))
            .bind("agentId", Value::Str("agent-7".into()))
            .bind(
                "tools",
                Value::List(vec![
                    Value::Str("file_read".into()),
                    Value::Str("web_fetch".into()),
                ]),
            )
            .bind("event", Value::Obj(event))
    }

    #[test]
    fn numeric_comparison() {
        assert!(matches("cost > 0.50", &ctx(), BUDGET).unwrap());
        assert!(!matches("cost > 1.00", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn string_methods() {
        assert!(matches("model.startsWith(\"gpt-4\")", &ctx(), BUDGET).unwrap());
        assert!(matches("model.includes(\"4o\")", &ctx(), BUDGET).unwrap());
        assert!(matches("model.toUpperCase() == \"GPT-4O\"", &ctx(), BUDGET).unwrap());
        assert!(matches("agentId.length == 7", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn array_methods_and_index() {
        assert!(matches("tools.includes(\"file_read\")", &ctx(), BUDGET).unwrap());
        assert!(matches("tools.length == 2", &ctx(), BUDGET).unwrap());
        assert!(matches("tools[1] == \"web_fetch\"", &ctx(), BUDGET).unwrap());
        assert!(matches("tools[9] == null", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn object_members() {
        assert!(matches("event.promptTokens + event.completionTokens > 1000", &ctx(), BUDGET).unwrap());
        assert!(matches("event.missing == null", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn regex_literals() {
        assert!(matches("/GPT-4/i.test(model)", &ctx(), BUDGET).unwrap());
        assert!(matches("model.match(/^gpt-4o$/)", &ctx(), BUDGET).unwrap());
        assert!(!matches("/claude/.test(model)", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn logic_and_ternary() {
        assert!(matches("cost > 0.5 && tools.includes(\"file_read\")", &ctx(), BUDGET).unwrap());
        assert!(matches("cost > 9 || model == \"gpt-4o\"", &ctx(), BUDGET).unwrap());
        assert!(matches("cost > 0.5 ? true : false", &ctx(), BUDGET).unwrap());
        assert!(matches("!(cost < 0.5)", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn unknown_identifiers_resolve_null() {
        assert!(!matches("nonsense", &ctx(), BUDGET).unwrap());
        assert!(matches("nonsense == null", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn loops_and_statements_do_not_parse() {
        assert!(matches!(
            evaluate("while(true){}", &ctx(), BUDGET),
            Err(SandboxFault::Parse(_)) | Err(SandboxFault::Type(_))
        ));
        assert!(matches!(
            evaluate("cost = 0", &ctx(), BUDGET),
            Err(SandboxFault::Parse(_))
        ));
        assert!(matches!(
            evaluate("for(;;){}", &ctx(), BUDGET),
            Err(SandboxFault::Parse(_)) | Err(SandboxFault::Type(_))
        ));
    }

    #[test]
    fn non_boolean_result_is_not_a_match() {
        assert!(!matches("cost", &ctx(), BUDGET).unwrap());
        assert!(!matches("model", &ctx(), BUDGET).unwrap());
    }

    #[test]
    fn type_faults_are_reported() {
        assert!(matches!(
            evaluate("cost.includes(\"x\")", &ctx(), BUDGET),
            Err(SandboxFault::Type(_))
        ));
        assert!(matches!(
            evaluate("tools - 1", &ctx(), BUDGET),
            Err(SandboxFault::Type(_))
        ));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let condition = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(
            evaluate(&condition, &ctx(), BUDGET),
            Err(SandboxFault::Parse(_))
        ));
    }

    #[test]
    fn oversized_condition_is_rejected() {
        let condition = format!("cost > {}", "0".repeat(5_000));
        assert!(matches!(
            evaluate(&condition, &ctx(), BUDGET),
            Err(SandboxFault::Parse(_))
        ));
    }

    #[test]
    fn evaluation_is_isolated_between_rules() {
        // A faulting rule leaves no residue for the next evaluation.
        let c = ctx();
        let _ = evaluate("while(true){}", &c, BUDGET);
        assert!(matches("cost > 0.50", &c, BUDGET).unwrap());
    }

    #[test]
    fn stays_within_the_time_budget() {
        let started = Instant::now();
        let _ = matches(
            "tools.includes(\"a\") || tools.includes(\"b\") || model.toLowerCase().includes(\"zzz\")",
            &ctx(),
            BUDGET,
        );
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
