//! A small expression language evaluated against run state.
//!
//! Supported:
//! - literals: `"str"`, `'str'`, `42`, `1.5`, `true`, `false`, `null`
//! - dotted paths into state: `input`, `doc.tags.0`, `state.score`
//! - `== != < <= > >=`, `&& || !` (also `and or not`), `+ - * /`
//! - calls: `contains(a, b)`, `len(x)`, `lower(s)`, `default(x, y)`, ...
//!
//! A missing path evaluates to `null`; type errors and unknown functions
//! are `StrandError::Expression`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Number, Value};

use strand_core::error::{Result, StrandError};
use strand_core::GraphState;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(String),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Contains,
    Len,
    Lower,
    Upper,
    Trim,
    StartsWith,
    EndsWith,
    Exists,
    Default,
    Concat,
    Str,
    Number,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "contains" => Self::Contains,
            "len" => Self::Len,
            "lower" => Self::Lower,
            "upper" => Self::Upper,
            "trim" => Self::Trim,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "exists" => Self::Exists,
            "default" => Self::Default,
            "concat" => Self::Concat,
            "str" => Self::Str,
            "number" => Self::Number,
            _ => return None,
        })
    }

    /// Accepted argument count (min, max).
    fn arity(&self) -> (usize, usize) {
        match self {
            Self::Contains | Self::StartsWith | Self::EndsWith | Self::Default => (2, 2),
            Self::Concat => (1, usize::MAX),
            _ => (1, 1),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::Len => "len",
            Self::Lower => "lower",
            Self::Upper => "upper",
            Self::Trim => "trim",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Exists => "exists",
            Self::Default => "default",
            Self::Concat => "concat",
            Self::Str => "str",
            Self::Number => "number",
        }
    }
}

/// Parse an expression, reporting syntax errors, unknown functions and
/// arity mismatches.
pub fn parse(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(StrandError::Expression("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(StrandError::Expression(format!(
            "unexpected token {:?} in '{}'",
            tok, source
        )));
    }
    Ok(expr)
}

/// Parse and evaluate in one step.
pub fn evaluate(source: &str, state: &GraphState) -> Result<Value> {
    parse(source)?.eval(state)
}

/// Evaluate as a condition.
pub fn evaluate_bool(source: &str, state: &GraphState) -> Result<bool> {
    Ok(is_truthy(&evaluate(source, state)?))
}

/// `null`, `false`, `0`, `""`, `[]` and `{}` are false; everything else is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Interpolate `{{ expr }}` placeholders.
pub fn render_template(template: &str, state: &GraphState) -> Result<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER
        .get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("static template pattern"));

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in re.captures_iter(template) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&to_display(&evaluate(inner.as_str(), state)?));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Validate every placeholder in a template without evaluating it.
pub fn check_template(template: &str) -> Result<()> {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| StrandError::Expression("unclosed '{{' in template".into()))?;
        parse(after[..end].trim())?;
        rest = &after[end + 2..];
    }
    Ok(())
}

/// String form used by templates and `str()`.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Expr {
    pub fn eval(&self, state: &GraphState) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(state.get_path(path).cloned().unwrap_or(Value::Null)),
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&inner.eval(state)?))),
            Expr::Neg(inner) => {
                let v = inner.eval(state)?;
                Ok(number_value(-as_number(&v, "-")?))
            }
            Expr::Binary(BinOp::And, l, r) => {
                Ok(Value::Bool(is_truthy(&l.eval(state)?) && is_truthy(&r.eval(state)?)))
            }
            Expr::Binary(BinOp::Or, l, r) => {
                Ok(Value::Bool(is_truthy(&l.eval(state)?) || is_truthy(&r.eval(state)?)))
            }
            Expr::Binary(op, l, r) => binary(*op, l.eval(state)?, r.eval(state)?),
            Expr::Call(func, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(state))
                    .collect::<Result<Vec<_>>>()?;
                call(*func, values)
            }
        }
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (a, b) = (as_number(&l, "comparison")?, as_number(&r, "comparison")?);
                    a.partial_cmp(&b).ok_or_else(|| {
                        StrandError::Expression("cannot compare NaN".into())
                    })?
                }
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::Add => match (&l, &r) {
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", to_display(&l), to_display(&r))))
            }
            _ => Ok(number_value(as_number(&l, "+")? + as_number(&r, "+")?)),
        },
        BinOp::Sub => Ok(number_value(as_number(&l, "-")? - as_number(&r, "-")?)),
        BinOp::Mul => Ok(number_value(as_number(&l, "*")? * as_number(&r, "*")?)),
        BinOp::Div => {
            let divisor = as_number(&r, "/")?;
            if divisor == 0.0 {
                return Err(StrandError::Expression("division by zero".into()));
            }
            Ok(number_value(as_number(&l, "/")? / divisor))
        }
        BinOp::And => Ok(Value::Bool(is_truthy(&l) && is_truthy(&r))),
        BinOp::Or => Ok(Value::Bool(is_truthy(&l) || is_truthy(&r))),
    }
}

fn call(func: Func, mut args: Vec<Value>) -> Result<Value> {
    let name = func.name();
    match func {
        Func::Contains => {
            let needle = args.pop().unwrap_or(Value::Null);
            let haystack = args.pop().unwrap_or(Value::Null);
            Ok(Value::Bool(match &haystack {
                Value::Null => false,
                Value::String(s) => s.contains(&to_display(&needle)),
                Value::Array(items) => items.iter().any(|i| loose_eq(i, &needle)),
                Value::Object(map) => map.contains_key(&to_display(&needle)),
                other => {
                    return Err(type_error(name, "a string, array or object", other));
                }
            }))
        }
        Func::Len => Ok(Value::from(match &args[0] {
            Value::Null => 0,
            Value::String(s) => s.chars().count(),
            Value::Array(a) => a.len(),
            Value::Object(o) => o.len(),
            other => return Err(type_error(name, "a string, array or object", other)),
        })),
        Func::Lower => Ok(Value::String(as_str(&args[0], name)?.to_lowercase())),
        Func::Upper => Ok(Value::String(as_str(&args[0], name)?.to_uppercase())),
        Func::Trim => Ok(Value::String(as_str(&args[0], name)?.trim().to_string())),
        Func::StartsWith => {
            let s = as_str(&args[0], name)?;
            Ok(Value::Bool(s.starts_with(as_str(&args[1], name)?)))
        }
        Func::EndsWith => {
            let s = as_str(&args[0], name)?;
            Ok(Value::Bool(s.ends_with(as_str(&args[1], name)?)))
        }
        Func::Exists => Ok(Value::Bool(!args[0].is_null())),
        Func::Default => {
            let fallback = args.pop().unwrap_or(Value::Null);
            let value = args.pop().unwrap_or(Value::Null);
            Ok(if value.is_null() { fallback } else { value })
        }
        Func::Concat => Ok(Value::String(args.iter().map(to_display).collect())),
        Func::Str => Ok(Value::String(to_display(&args[0]))),
        Func::Number => match &args[0] {
            Value::Number(_) => Ok(args[0].clone()),
            Value::Bool(b) => Ok(Value::from(u8::from(*b))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number_value)
                .map_err(|_| StrandError::Expression(format!("number(): '{}' is not numeric", s))),
            other => Err(type_error(name, "a number, bool or string", other)),
        },
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn as_number(v: &Value, what: &str) -> Result<f64> {
    v.as_f64().ok_or_else(|| type_error(what, "a number", v))
}

fn as_str<'a>(v: &'a Value, what: &str) -> Result<&'a str> {
    v.as_str().ok_or_else(|| type_error(what, "a string", v))
}

fn type_error(what: &str, expected: &str, got: &Value) -> StrandError {
    StrandError::Expression(format!("{} expects {}, got {}", what, expected, got))
}

/// Integral results stay integers so `1 + 1 == 2` prints as `2`.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

// ── Lexer ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(StrandError::Expression(format!(
                                "unterminated string in '{}'",
                                source
                            )))
                        }
                        Some('\\') => {
                            if let Some(&next) = chars.get(i + 1) {
                                s.push(match next {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    StrandError::Expression(format!("invalid number '{}'", text))
                })?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::Op("&&"),
                    "or" => Token::Op("||"),
                    "not" => Token::Op("!"),
                    _ => Token::Ident(word),
                });
            }
            _ => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                let op = match two.as_str() {
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = op {
                    tokens.push(Token::Op(op));
                    i += 2;
                    continue;
                }
                let op = match c {
                    '<' => "<",
                    '>' => ">",
                    '!' => "!",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    '/' => "/",
                    other => {
                        return Err(StrandError::Expression(format!(
                            "unexpected character '{}' in '{}'",
                            other, source
                        )))
                    }
                };
                tokens.push(Token::Op(op));
                i += 1;
            }
        }
    }
    Ok(tokens)
}

// ── Parser ──────────────────────────────────────────────────

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

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.eat_op(ops) {
            let right = next(self)?;
            left = Expr::Binary(bin_op(op), Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.binary_level(&["||"], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.binary_level(&["&&"], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.binary_level(&["==", "!="], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.binary_level(&["<", "<=", ">", ">="], Self::parse_additive)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.binary_level(&["+", "-"], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(&["*", "/"], Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.eat_op(&["!", "-"]) {
            Some("!") => Ok(Expr::Not(Box::new(self.parse_unary()?))),
            Some(_) => Ok(Expr::Neg(Box::new(self.parse_unary()?))),
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(StrandError::Expression("expected ')'".into())),
                }
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.parse_call(word),
                _ => Ok(Expr::Path(word)),
            },
            Some(tok) => Err(StrandError::Expression(format!("unexpected token {:?}", tok))),
            None => Err(StrandError::Expression("unexpected end of expression".into())),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        let func = Func::lookup(&name)
            .ok_or_else(|| StrandError::Expression(format!("unknown function '{}'", name)))?;
        self.pos += 1; // (
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.parse_or()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => {
                        return Err(StrandError::Expression(format!(
                            "expected ',' or ')' in call to {}",
                            name
                        )))
                    }
                }
            }
        }
        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(StrandError::Expression(format!(
                "{}() takes {} argument(s), got {}",
                name,
                if min == max { min.to_string() } else { format!("at least {}", min) },
                args.len()
            )));
        }
        Ok(Expr::Call(func, args))
    }
}

fn bin_op(op: &str) -> BinOp {
    match op {
        "||" => BinOp::Or,
        "&&" => BinOp::And,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        _ => BinOp::Div,
    }
}
