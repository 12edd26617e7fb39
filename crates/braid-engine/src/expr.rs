//! Paths, guard expressions and input templates evaluated against a run.
//!
//! Paths: `vars.<name>`, `input.<path>`, `loop.index|iteration|results`,
//! `blocks.<id>.status|output|error|attempts`, or a bare `<name>` that
//! resolves to a variable first and a block view second. Any segment may
//! carry `[n]` indexes.
//!
//! Guards: `||` over `&&` over `!` over a comparison (`==`, `!=`, `<`, `<=`,
//! `>`, `>=`, `contains`) or a truthy operand, with parentheses.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

use braid_core::json;
use braid_core::types::BlockId;

use crate::graph::InputExpr;

/// Read access to the values a path can reach.
pub trait Scope {
    fn variable(&self, name: &str) -> Option<&Value>;
    fn variables(&self) -> Value;
    fn input(&self) -> &Value;
    /// `{index, iteration, results}` of the innermost loop frame.
    fn loop_frame(&self) -> Option<Value>;
    /// `{status, output, error, attempts}` of a block.
    fn block_view(&self, id: &str) -> Option<Value>;
}

#[derive(Debug, Clone, PartialEq)]
enum PathRoot {
    Vars,
    Input,
    Loop,
    Block(BlockId),
    Bare(String),
}

/// A parsed reference path.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    root: PathRoot,
    rest: String,
}

fn split_head(path: &str) -> (&str, &str) {
    match path.find(['.', '[']) {
        Some(pos) => {
            let (head, tail) = path.split_at(pos);
            (head, tail.strip_prefix('.').unwrap_or(tail))
        }
        None => (path, ""),
    }
}

fn is_path_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']')
}

impl Path {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let first = raw.chars().next().ok_or("empty path")?;
        if !(first.is_alphabetic() || first == '_') {
            return Err(format!("path '{}' must start with a letter", raw));
        }
        if let Some(bad) = raw.chars().find(|c| !is_path_char(*c)) {
            return Err(format!("unexpected '{}' in path '{}'", bad, raw));
        }
        if raw.ends_with('.') || raw.contains("..") {
            return Err(format!("empty segment in path '{}'", raw));
        }

        let (head, rest) = split_head(raw);
        let root = match head {
            "vars" => PathRoot::Vars,
            "input" => PathRoot::Input,
            "loop" => PathRoot::Loop,
            "blocks" => {
                let (id, rest) = split_head(rest);
                if id.is_empty() {
                    return Err(format!("path '{}' is missing a block id", raw));
                }
                return Ok(Self {
                    root: PathRoot::Block(id.to_string()),
                    rest: rest.to_string(),
                });
            }
            name => PathRoot::Bare(name.to_string()),
        };
        Ok(Self {
            root,
            rest: rest.to_string(),
        })
    }

    /// The block id named by a `blocks.<id>` path.
    pub fn block_reference(&self) -> Option<&str> {
        match &self.root {
            PathRoot::Block(id) => Some(id),
            _ => None,
        }
    }

    /// Resolve against a scope. `None` when any segment is missing.
    pub fn resolve(&self, scope: &dyn Scope) -> Option<Value> {
        match &self.root {
            PathRoot::Vars => {
                if self.rest.is_empty() {
                    return Some(scope.variables());
                }
                let (name, tail) = split_head(&self.rest);
                scope
                    .variable(name)
                    .and_then(|v| json::lookup(v, tail))
                    .cloned()
            }
            PathRoot::Input => json::lookup(scope.input(), &self.rest).cloned(),
            PathRoot::Loop => {
                let frame = scope.loop_frame()?;
                json::lookup(&frame, &self.rest).cloned()
            }
            PathRoot::Block(id) => {
                let view = scope.block_view(id)?;
                json::lookup(&view, &self.rest).cloned()
            }
            PathRoot::Bare(name) => {
                if let Some(v) = scope.variable(name) {
                    return json::lookup(v, &self.rest).cloned();
                }
                let view = scope.block_view(name)?;
                json::lookup(&view, &self.rest).cloned()
            }
        }
    }
}

// ── Guards ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(Path),
}

impl Operand {
    fn resolve(&self, scope: &dyn Scope) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v.clone()),
            Self::Path(p) => p.resolve(scope),
        }
    }
}

/// A parsed boolean guard.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Or(Box<Guard>, Box<Guard>),
    And(Box<Guard>, Box<Guard>),
    Not(Box<Guard>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

impl Guard {
    pub fn parse(src: &str) -> Result<Self, String> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err("empty expression".into());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let guard = parser.or()?;
        if let Some(tok) = parser.peek() {
            return Err(format!("unexpected {:?}", tok));
        }
        Ok(guard)
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> bool {
        match self {
            Self::Or(a, b) => a.evaluate(scope) || b.evaluate(scope),
            Self::And(a, b) => a.evaluate(scope) && b.evaluate(scope),
            Self::Not(g) => !g.evaluate(scope),
            Self::Compare(lhs, op, rhs) => match (lhs.resolve(scope), rhs.resolve(scope)) {
                (Some(l), Some(r)) => compare(&l, *op, &r),
                _ => false,
            },
            Self::Truthy(operand) => operand.resolve(scope).is_some_and(|v| truthy(&v)),
        }
    }

    /// Block ids named through `blocks.<id>` paths.
    pub fn block_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Or(a, b) | Self::And(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Self::Not(g) => g.collect_references(out),
            Self::Compare(l, _, r) => {
                out.extend(l.block_reference());
                out.extend(r.block_reference());
            }
            Self::Truthy(o) => out.extend(o.block_reference()),
        }
    }
}

impl Operand {
    fn block_reference(&self) -> Option<&str> {
        match self {
            Self::Path(p) => p.block_reference(),
            Self::Literal(_) => None,
        }
    }
}

pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn ordering(l: &Value, r: &Value) -> Option<Ordering> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => ordering(l, r) == Some(Ordering::Equal),
        _ => l == r,
    }
}

fn compare(l: &Value, op: CmpOp, r: &Value) -> bool {
    match op {
        CmpOp::Eq => equal(l, r),
        CmpOp::Ne => !equal(l, r),
        CmpOp::Lt => ordering(l, r) == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(l, r), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(l, r) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering(l, r), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Contains => match (l, r) {
            (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| equal(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Value),
    Ident(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if or_equal { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars.get(i + 1).ok_or("unterminated escape")?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal(Value::String(s)));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E'))
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value: Value = serde_json::from_str(&text)
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Literal(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_path_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    "contains" => Token::Op(CmpOp::Contains),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn or(&mut self) -> Result<Guard, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and()?;
            lhs = Guard::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Guard, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Guard::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Guard, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Guard::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Guard, String> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                _ => Err("expected ')'".into()),
            };
        }
        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.operand()?;
            return Ok(Guard::Compare(lhs, op, rhs));
        }
        Ok(Guard::Truthy(lhs))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(Operand::Literal(v)),
            Some(Token::Ident(word)) => Ok(Operand::Path(Path::parse(&word)?)),
            Some(tok) => Err(format!("expected a value, found {:?}", tok)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ── Templates and inputs ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum TemplatePart {
    Text(String),
    Path(Path),
}

/// A string with `{{ path }}` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut rest = src;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                parts.push(TemplatePart::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after
                .find("}}")
                .ok_or_else(|| format!("unclosed placeholder in template '{}'", src))?;
            parts.push(TemplatePart::Path(Path::parse(&after[..close])?));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Text(rest.to_string()));
        }
        Ok(Self { parts })
    }

    /// Render with missing paths as empty strings.
    pub fn render(&self, scope: &dyn Scope) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(t) => out.push_str(t),
                TemplatePart::Path(p) => {
                    if let Some(v) = p.resolve(scope) {
                        out.push_str(&json::display(&v));
                    }
                }
            }
        }
        out
    }

    fn block_references(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Path(path) => path.block_reference(),
            TemplatePart::Text(_) => None,
        })
    }
}

/// An input expression parsed once at validation time.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledInput {
    Literal(Value),
    Ref(Path),
    Template(Template),
}

impl CompiledInput {
    pub fn compile(expr: &InputExpr) -> Result<Self, String> {
        Ok(match expr {
            InputExpr::Literal { value } => Self::Literal(value.clone()),
            InputExpr::Ref { path } => Self::Ref(Path::parse(path)?),
            InputExpr::Template { template } => Self::Template(Template::parse(template)?),
        })
    }

    pub fn evaluate(&self, scope: &dyn Scope) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Ref(p) => p.resolve(scope).unwrap_or(Value::Null),
            Self::Template(t) => Value::String(t.render(scope)),
        }
    }

    pub fn block_references(&self) -> Vec<&str> {
        match self {
            Self::Literal(_) => vec![],
            Self::Ref(p) => p.block_reference().into_iter().collect(),
            Self::Template(t) => t.block_references().collect(),
        }
    }
}

/// Resolve a block's compiled inputs into the object handed to its capability.
pub fn resolve_inputs(inputs: &BTreeMap<String, CompiledInput>, scope: &dyn Scope) -> Value {
    Value::Object(
        inputs
            .iter()
            .map(|(name, expr)| (name.clone(), expr.evaluate(scope)))
            .collect(),
    )
}
