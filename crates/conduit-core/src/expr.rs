//! Typed condition expressions.
//!
//! Job conditions and `${{ }}` templates are parsed once into an [`Expr`]
//! tree and evaluated against a read-only [`ExprContext`]. Nothing is ever
//! spliced back into source text, so values cannot change the meaning of an
//! expression.
//!
//! Supported syntax:
//! - literals: `true`, `false`, `null`, numbers, `'single quoted'` strings
//! - paths: `event.ref`, `github.actor`, `needs.build.result`,
//!   `needs.build.outputs.version`, `matrix.os`, `env.NAME`, `inputs.name`,
//!   `secrets.NAME`, `steps.<id>.outputs.<name>`, `needs['build-linux'].result`
//! - operators, loosest first: `||`, `&&`, `== != < <= > >=`, `!`
//! - functions: `success()`, `failure()`, `always()`, `cancelled()`,
//!   `contains(a, b)`, `startsWith(a, b)`, `endsWith(a, b)`, `approved('gate')`

use crate::run::JobStatus;
use crate::secrets::SecretValue;
use crate::trigger::RepoEvent;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static TEMPLATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").expect("template regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset}")]
pub struct ExprError {
    pub message: String,
    pub offset: usize,
}

impl ExprError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Null => Some(0.0),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Some(*n),
            Value::String(s) if s.trim().is_empty() => Some(0.0),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    /// String comparisons ignore ASCII case.
    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn loose_cmp(&self, other: &Value) -> Option<std::cmp::Ordering> {
        if let (Value::String(a), Value::String(b)) = (self, other) {
            if a.parse::<f64>().is_err() || b.parse::<f64>().is_err() {
                return Some(a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase()));
            }
        }
        self.as_number()?.partial_cmp(&other.as_number()?)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Success,
    Failure,
    Always,
    Cancelled,
    Contains,
    StartsWith,
    EndsWith,
    Approved,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "success" => Some(Function::Success),
            "failure" => Some(Function::Failure),
            "always" => Some(Function::Always),
            "cancelled" => Some(Function::Cancelled),
            "contains" => Some(Function::Contains),
            "startswith" => Some(Function::StartsWith),
            "endswith" => Some(Function::EndsWith),
            "approved" => Some(Function::Approved),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Function::Success | Function::Failure | Function::Always | Function::Cancelled => 0,
            Function::Approved => 1,
            Function::Contains | Function::StartsWith | Function::EndsWith => 2,
        }
    }

    /// Status functions opt a condition out of the implicit `success()`.
    pub fn is_status_check(&self) -> bool {
        matches!(
            self,
            Function::Success | Function::Failure | Function::Always | Function::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

impl Expr {
    /// Parse an expression, with or without the `${{ }}` wrapper.
    pub fn parse(source: &str) -> Result<Expr, ExprError> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);
        let tokens = tokenize(inner)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some((token, offset)) = parser.tokens.get(parser.pos) {
            return Err(ExprError::new(format!("unexpected token {:?}", token), *offset));
        }
        Ok(expr)
    }

    pub fn eval(&self, ctx: &ExprContext<'_>) -> Value {
        match self {
            Expr::Literal(v) => v.clone(),
            Expr::Path(segments) => ctx.lookup(segments),
            Expr::Not(inner) => Value::Bool(!inner.eval(ctx).is_truthy()),
            Expr::And(l, r) => {
                let left = l.eval(ctx);
                if left.is_truthy() { r.eval(ctx) } else { left }
            }
            Expr::Or(l, r) => {
                let left = l.eval(ctx);
                if left.is_truthy() { left } else { r.eval(ctx) }
            }
            Expr::Compare(op, l, r) => {
                let (left, right) = (l.eval(ctx), r.eval(ctx));
                let result = match op {
                    CmpOp::Eq => left.loose_eq(&right),
                    CmpOp::Ne => !left.loose_eq(&right),
                    CmpOp::Lt => left.loose_cmp(&right).is_some_and(|o| o.is_lt()),
                    CmpOp::Le => left.loose_cmp(&right).is_some_and(|o| o.is_le()),
                    CmpOp::Gt => left.loose_cmp(&right).is_some_and(|o| o.is_gt()),
                    CmpOp::Ge => left.loose_cmp(&right).is_some_and(|o| o.is_ge()),
                };
                Value::Bool(result)
            }
            Expr::Call(function, args) => Value::Bool(call(*function, args, ctx)),
        }
    }

    pub fn uses_status_check(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Path(_) => false,
            Expr::Not(inner) => inner.uses_status_check(),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
                l.uses_status_check() || r.uses_status_check()
            }
            Expr::Call(function, args) => {
                function.is_status_check() || args.iter().any(Expr::uses_status_check)
            }
        }
    }

    /// Approval gates referenced through `approved('gate')`.
    pub fn approval_gates(&self) -> Vec<String> {
        let mut gates = Vec::new();
        self.collect_gates(&mut gates);
        gates
    }

    fn collect_gates(&self, gates: &mut Vec<String>) {
        match self {
            Expr::Literal(_) | Expr::Path(_) => {}
            Expr::Not(inner) => inner.collect_gates(gates),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
                l.collect_gates(gates);
                r.collect_gates(gates);
            }
            Expr::Call(Function::Approved, args) => {
                if let Some(Expr::Literal(Value::String(gate))) = args.first() {
                    gates.push(gate.clone());
                }
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.collect_gates(gates)),
        }
    }
}

fn call(function: Function, args: &[Expr], ctx: &ExprContext<'_>) -> bool {
    let text = |i: usize| args[i].eval(ctx).to_string().to_ascii_lowercase();
    match function {
        Function::Success => ctx.needs_satisfied() && !ctx.cancelled,
        Function::Failure => ctx.any_need_failed(),
        Function::Always => true,
        Function::Cancelled => ctx.cancelled,
        Function::Contains => text(0).contains(&text(1)),
        Function::StartsWith => text(0).starts_with(&text(1)),
        Function::EndsWith => text(0).ends_with(&text(1)),
        Function::Approved => ctx.approvals.is_some_and(|a| a.contains(&args[0].eval(ctx).to_string())),
    }
}

/// A job's `if:`. Without a status function the condition is implicitly
/// `success() && <expr>`; an absent condition is just `success()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    expr: Option<Expr>,
}

impl Condition {
    pub fn parse(source: Option<&str>) -> Result<Self, ExprError> {
        let expr = source.map(Expr::parse).transpose()?;
        Ok(Self { expr })
    }

    pub fn always() -> Self {
        Self {
            expr: Some(Expr::Call(Function::Always, vec![])),
        }
    }

    pub fn evaluate(&self, ctx: &ExprContext<'_>) -> bool {
        match &self.expr {
            None => ctx.needs_satisfied() && !ctx.cancelled,
            Some(expr) if expr.uses_status_check() => expr.eval(ctx).is_truthy(),
            Some(expr) => ctx.needs_satisfied() && !ctx.cancelled && expr.eval(ctx).is_truthy(),
        }
    }

    /// Whether this condition can pass with unsatisfied dependencies.
    pub fn tolerates_failure(&self) -> bool {
        self.expr.as_ref().is_some_and(Expr::uses_status_check)
    }

    pub fn approval_gates(&self) -> Vec<String> {
        self.expr.as_ref().map(Expr::approval_gates).unwrap_or_default()
    }
}

/// Outcome of a dependency as seen from a dependent job.
#[derive(Debug, Clone, PartialEq)]
pub struct NeedResult {
    pub status: JobStatus,
    /// A failed optional dependency still counts as satisfied.
    pub tolerated: bool,
    pub outputs: BTreeMap<String, String>,
}

impl NeedResult {
    pub fn satisfied(&self) -> bool {
        self.status == JobStatus::Succeeded || (self.status == JobStatus::Failed && self.tolerated)
    }
}

/// Read-only evaluation context.
pub struct ExprContext<'a> {
    event: &'a RepoEvent,
    needs: BTreeMap<String, NeedResult>,
    matrix: Option<&'a BTreeMap<String, String>>,
    env: Vec<&'a BTreeMap<String, String>>,
    secrets: Option<&'a BTreeMap<String, SecretValue>>,
    steps: Option<&'a BTreeMap<String, BTreeMap<String, String>>>,
    approvals: Option<&'a BTreeSet<String>>,
    cancelled: bool,
}

impl<'a> ExprContext<'a> {
    pub fn new(event: &'a RepoEvent) -> Self {
        Self {
            event,
            needs: BTreeMap::new(),
            matrix: None,
            env: Vec::new(),
            secrets: None,
            steps: None,
            approvals: None,
            cancelled: false,
        }
    }

    pub fn with_need(mut self, job_id: impl Into<String>, result: NeedResult) -> Self {
        self.needs.insert(job_id.into(), result);
        self
    }

    pub fn with_matrix(mut self, matrix: &'a BTreeMap<String, String>) -> Self {
        self.matrix = Some(matrix);
        self
    }

    /// Layer an env map; later layers shadow earlier ones.
    pub fn with_env(mut self, env: &'a BTreeMap<String, String>) -> Self {
        self.env.push(env);
        self
    }

    pub fn with_secrets(mut self, secrets: &'a BTreeMap<String, SecretValue>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Outputs of finished steps keyed by step id.
    pub fn with_steps(mut self, steps: &'a BTreeMap<String, BTreeMap<String, String>>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_approvals(mut self, approvals: &'a BTreeSet<String>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn needs_satisfied(&self) -> bool {
        self.needs.values().all(NeedResult::satisfied)
    }

    pub fn any_need_failed(&self) -> bool {
        self.needs
            .values()
            .any(|n| matches!(n.status, JobStatus::Failed | JobStatus::Cancelled))
    }

    fn lookup(&self, path: &[String]) -> Value {
        let string = |s: Option<String>| s.map(Value::String).unwrap_or(Value::Null);
        match path {
            [root, field] if root == "event" || root == "github" => {
                string(self.event.field(field))
            }
            [root, name] if root == "inputs" => string(self.event.inputs.get(name).cloned()),
            [root, job, field] if root == "needs" && field == "result" => self
                .needs
                .get(job)
                .map(|n| Value::String(n.status.as_str().to_string()))
                .unwrap_or(Value::Null),
            [root, job, field, key] if root == "needs" && field == "outputs" => string(
                self.needs
                    .get(job)
                    .and_then(|n| n.outputs.get(key).cloned()),
            ),
            [root, step, field, key] if root == "steps" && field == "outputs" => string(
                self.steps
                    .and_then(|s| s.get(step))
                    .and_then(|o| o.get(key).cloned()),
            ),
            [root, key] if root == "matrix" => {
                string(self.matrix.and_then(|m| m.get(key).cloned()))
            }
            [root, key] if root == "env" => string(
                self.env
                    .iter()
                    .rev()
                    .find_map(|layer| layer.get(key).cloned()),
            ),
            [root, key] if root == "secrets" => string(
                self.secrets
                    .and_then(|s| s.get(key))
                    .map(|s| s.expose().to_string()),
            ),
            _ => Value::Null,
        }
    }
}

/// Check every `${{ }}` in a template parses.
pub fn validate_template(template: &str) -> Result<(), ExprError> {
    for caps in TEMPLATE.captures_iter(template) {
        Expr::parse(caps.get(1).map_or("", |m| m.as_str()))?;
    }
    Ok(())
}

/// Replace every `${{ expr }}` with the evaluated value.
pub fn interpolate(template: &str, ctx: &ExprContext<'_>) -> Result<String, ExprError> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TEMPLATE.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let expr = Expr::parse(caps.get(1).map_or("", |m| m.as_str()))?;
        output.push_str(&template[last..whole.start()]);
        output.push_str(&expr.eval(ctx).to_string());
        last = whole.end();
    }
    output.push_str(&template[last..]);
    Ok(output)
}

// === Tokenizer ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((Token::LParen, offset)),
            ')' => tokens.push((Token::RParen, offset)),
            '[' => tokens.push((Token::LBracket, offset)),
            ']' => tokens.push((Token::RBracket, offset)),
            ',' => tokens.push((Token::Comma, offset)),
            '.' => tokens.push((Token::Dot, offset)),
            '&' if next == Some('&') => {
                tokens.push((Token::And, offset));
                i += 1;
            }
            '|' if next == Some('|') => {
                tokens.push((Token::Or, offset));
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push((Token::Cmp(CmpOp::Eq), offset));
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push((Token::Cmp(CmpOp::Ne), offset));
                i += 1;
            }
            '!' => tokens.push((Token::Not, offset)),
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                if next == Some('=') {
                    i += 1;
                }
                tokens.push((Token::Cmp(op), offset));
            }
            '\'' => {
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j) {
                        None => return Err(ExprError::new("unterminated string", offset)),
                        Some((_, '\'')) if chars.get(j + 1).map(|(_, c)| *c) == Some('\'') => {
                            value.push('\'');
                            j += 2;
                        }
                        Some((_, '\'')) => break,
                        Some((_, ch)) => {
                            value.push(*ch);
                            j += 1;
                        }
                    }
                }
                tokens.push((Token::Str(value), offset));
                i = j;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while chars
                    .get(j)
                    .is_some_and(|(_, ch)| ch.is_ascii_digit() || *ch == '.')
                {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |(o, _)| *o);
                let number = input[offset..end]
                    .parse()
                    .map_err(|_| ExprError::new("invalid number", offset))?;
                tokens.push((Token::Number(number), offset));
                i = j;
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while chars
                    .get(j)
                    .is_some_and(|(_, ch)| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
                {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |(o, _)| *o);
                tokens.push((Token::Ident(input[offset..end].to_string()), offset));
                i = j;
                continue;
            }
            other => {
                return Err(ExprError::new(format!("unexpected character {:?}", other), offset));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// === Parser ===

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map_or(0, |(_, o)| *o)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExprError> {
        let offset = self.offset();
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::new(
                format!("expected {:?}, found {:?}", expected, token),
                offset,
            )),
            None => Err(ExprError::new(
                format!("expected {:?}, found end of input", expected),
                offset,
            )),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_unary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.advance();
            let right = self.parse_unary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.parse_call(&name, offset),
                _ => self.parse_path(name),
            },
            Some(token) => Err(ExprError::new(format!("unexpected token {:?}", token), offset)),
            None => Err(ExprError::new("unexpected end of expression", offset)),
        }
    }

    fn parse_call(&mut self, name: &str, offset: usize) -> Result<Expr, ExprError> {
        let function = Function::lookup(name)
            .ok_or_else(|| ExprError::new(format!("unknown function {}", name), offset))?;
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != function.arity() {
            return Err(ExprError::new(
                format!(
                    "{} expects {} argument(s), got {}",
                    name,
                    function.arity(),
                    args.len()
                ),
                offset,
            ));
        }
        Ok(Expr::Call(function, args))
    }

    fn parse_path(&mut self, root: String) -> Result<Expr, ExprError> {
        let mut segments = vec![root];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Ident(segment)) => segments.push(segment),
                        _ => return Err(ExprError::new("expected property name", offset)),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Some(Token::Str(segment)) => segments.push(segment),
                        _ => return Err(ExprError::new("expected quoted property name", offset)),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}
