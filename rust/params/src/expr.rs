//! Restricted expression evaluator for parameter values and directives.
//!
//! Only literal construction is supported: numbers, quoted strings, lists,
//! tuples, names bound by earlier directives, and calls into a fixed set of
//! sequence helpers. There is no general execution.

use std::collections::HashMap;

use crate::value::Value;

/// Upper bound on the length of a generated sequence.
pub const MAX_SEQUENCE_LEN: usize = 1_000_000;

/// Upper bound on nesting of brackets, parentheses and unary signs.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Minus,
    Plus,
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '[' | ']' | '(' | ')' | ',' | '-' | '+' => {
                tokens.push(match c {
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    '-' => Token::Minus,
                    _ => Token::Plus,
                });
                i += 1;
            }
            '\'' | '"' => {
                let (s, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            c if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) =>
            {
                let start = i;
                let hex = c == '0' && matches!(chars.get(i + 1), Some('x' | 'X'));
                while i < chars.len() {
                    let ch = chars[i];
                    let exponent_sign = matches!(ch, '+' | '-')
                        && !hex
                        && i > start
                        && matches!(chars[i - 1], 'e' | 'E');
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || exponent_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(parse_number(&text)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(ExprError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or(ExprError::UnterminatedString)?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ExprError::UnterminatedString)
}

fn parse_number(text: &str) -> Result<Token, ExprError> {
    let invalid = || ExprError::InvalidNumber(text.to_string());
    let cleaned: String = text
        .chars()
        .filter(|&c| c != '_')
        .collect::<String>()
        .to_ascii_lowercase();

    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(digits) = cleaned.strip_prefix(prefix) {
            return i64::from_str_radix(digits, radix)
                .map(Token::Int)
                .map_err(|_| invalid());
        }
    }

    if cleaned.contains(['.', 'e']) {
        cleaned.parse().map(Token::Float).map_err(|_| invalid())
    } else {
        cleaned.parse().map(Token::Int).map_err(|_| invalid())
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    bindings: &'a HashMap<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Top level: a bare comma-separated list is a tuple.
    fn toplevel(&mut self) -> Result<Value, ExprError> {
        let first = self.expr()?;
        if !self.eat(&Token::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.peek().is_some() {
            items.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(Value::Seq(items))
    }

    fn expr(&mut self) -> Result<Value, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        self.depth += 1;
        let value = self.unary();
        self.depth -= 1;
        value
    }

    fn unary(&mut self) -> Result<Value, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                match self.expr()? {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| ExprError::InvalidNumber(format!("-{i}"))),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    other => Err(ExprError::BadOperand(other.kind())),
                }
            }
            Some(Token::Plus) => {
                self.pos += 1;
                match self.expr()? {
                    v @ (Value::Int(_) | Value::Float(_)) => Ok(v),
                    other => Err(ExprError::BadOperand(other.kind())),
                }
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Value, ExprError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::LBracket) => {
                let (items, _) = self.items(&Token::RBracket)?;
                Ok(Value::Seq(items))
            }
            Some(Token::LParen) => {
                let (mut items, trailing_comma) = self.items(&Token::RParen)?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.remove(0))
                } else {
                    Ok(Value::Seq(items))
                }
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let (args, _) = self.items(&Token::RParen)?;
                    call(&name, args)
                } else {
                    self.bindings
                        .get(&name)
                        .cloned()
                        .ok_or(ExprError::UnknownName(name))
                }
            }
            Some(other) => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    /// Comma-separated items up to `close`. Also reports a trailing comma.
    fn items(&mut self, close: &Token) -> Result<(Vec<Value>, bool), ExprError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            if self.eat(close) {
                return Ok((items, trailing_comma));
            }
            items.push(self.expr()?);
            trailing_comma = self.eat(&Token::Comma);
            if !trailing_comma {
                return if self.eat(close) {
                    Ok((items, false))
                } else {
                    match self.peek() {
                        Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
                        None => Err(ExprError::UnexpectedEnd),
                    }
                };
            }
        }
    }
}

fn bad_args(function: &str, reason: impl Into<String>) -> ExprError {
    ExprError::BadArguments {
        function: function.to_string(),
        reason: reason.into(),
    }
}

fn integer(function: &str, v: &Value) -> Result<i64, ExprError> {
    v.as_i64()
        .ok_or_else(|| bad_args(function, format!("expected int, got {}", v.kind())))
}

fn number(function: &str, v: &Value) -> Result<f64, ExprError> {
    v.as_f64()
        .ok_or_else(|| bad_args(function, format!("expected number, got {}", v.kind())))
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    let function = match name.rsplit_once('.') {
        Some(("np" | "numpy", f)) => f,
        Some(_) => return Err(ExprError::UnknownFunction(name.to_string())),
        None => name,
    };

    match function {
        "range" => int_range(function, &args),
        "arange" if args.iter().all(|a| matches!(a, Value::Int(_))) => int_range(function, &args),
        "arange" => float_range(&args),
        "linspace" => spaced(function, &args, false),
        "logspace" => spaced(function, &args, true),
        "list" => match <[Value; 1]>::try_from(args) {
            Ok([Value::Seq(items)]) => Ok(Value::Seq(items)),
            Ok([Value::Str(s)]) => Ok(Value::Seq(
                s.chars().map(|c| Value::Str(c.to_string())).collect(),
            )),
            Ok([other]) => Err(bad_args(function, format!("cannot list a {}", other.kind()))),
            Err(_) => Err(bad_args(function, "takes exactly one argument")),
        },
        "repeat" => match <[Value; 2]>::try_from(args) {
            Ok([value, count]) => {
                let count = usize::try_from(integer(function, &count)?)
                    .map_err(|_| bad_args(function, "count must be non-negative"))?;
                if count > MAX_SEQUENCE_LEN {
                    return Err(ExprError::TooLong);
                }
                Ok(Value::Seq(vec![value; count]))
            }
            Err(_) => Err(bad_args(function, "takes exactly two arguments")),
        },
        _ => Err(ExprError::UnknownFunction(name.to_string())),
    }
}

fn int_range(function: &str, args: &[Value]) -> Result<Value, ExprError> {
    let (start, stop, step) = match args {
        [stop] => (0, integer(function, stop)?, 1),
        [start, stop] => (integer(function, start)?, integer(function, stop)?, 1),
        [start, stop, step] => (
            integer(function, start)?,
            integer(function, stop)?,
            integer(function, step)?,
        ),
        _ => return Err(bad_args(function, "takes one to three arguments")),
    };
    if step == 0 {
        return Err(bad_args(function, "step must not be zero"));
    }

    let mut out = Vec::new();
    let mut x = start;
    while (step > 0 && x < stop) || (step < 0 && x > stop) {
        if out.len() >= MAX_SEQUENCE_LEN {
            return Err(ExprError::TooLong);
        }
        out.push(Value::Int(x));
        let Some(next) = x.checked_add(step) else {
            break;
        };
        x = next;
    }
    Ok(Value::Seq(out))
}

fn float_range(args: &[Value]) -> Result<Value, ExprError> {
    let function = "arange";
    let (start, stop, step) = match args {
        [start, stop] => (number(function, start)?, number(function, stop)?, 1.0),
        [start, stop, step] => (
            number(function, start)?,
            number(function, stop)?,
            number(function, step)?,
        ),
        [stop] => (0.0, number(function, stop)?, 1.0),
        _ => return Err(bad_args(function, "takes one to three arguments")),
    };
    if step == 0.0 || !step.is_finite() {
        return Err(bad_args(function, "step must be finite and non-zero"));
    }

    let count = ((stop - start) / step).ceil();
    if !count.is_finite() {
        return Err(bad_args(function, "bounds must be finite"));
    }
    if count > MAX_SEQUENCE_LEN as f64 {
        return Err(ExprError::TooLong);
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = count.max(0.0) as usize;
    Ok(Value::Seq(
        (0..count)
            .map(|i| Value::Float(start + i as f64 * step))
            .collect(),
    ))
}

fn spaced(function: &str, args: &[Value], log: bool) -> Result<Value, ExprError> {
    let [start, stop, num] = args else {
        return Err(bad_args(function, "takes exactly three arguments"));
    };
    let start = number(function, start)?;
    let stop = number(function, stop)?;
    let num = usize::try_from(integer(function, num)?)
        .map_err(|_| bad_args(function, "number of samples must be non-negative"))?;
    if num > MAX_SEQUENCE_LEN {
        return Err(ExprError::TooLong);
    }

    let point = |x: f64| Value::Float(if log { 10f64.powf(x) } else { x });
    let values = match num {
        0 => Vec::new(),
        1 => vec![point(start)],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i == n - 1 {
                        point(stop)
                    } else {
                        point(start + i as f64 * step)
                    }
                })
                .collect()
        }
    };
    Ok(Value::Seq(values))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Evaluates expressions against names bound by directives.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    bindings: HashMap<String, Value>,
}

impl Evaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Evaluate a single expression.
    pub fn eval(&self, src: &str) -> Result<Value, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ExprError::Empty);
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
            bindings: &self.bindings,
        };
        let value = parser.toplevel()?;
        match parser.peek() {
            None => Ok(value),
            Some(t) => Err(ExprError::UnexpectedToken(format!("{t:?}"))),
        }
    }

    /// Execute a directive.
    ///
    /// `name = expression` binds `name` and returns it. Import statements are
    /// accepted and ignored, returning `None`.
    pub fn execute(&mut self, directive: &str) -> Result<Option<String>, ExprError> {
        let directive = directive.trim();
        if directive.starts_with("import ") || directive.starts_with("from ") {
            tracing::debug!("Ignoring import directive: {directive}");
            return Ok(None);
        }

        let Some((lhs, rhs)) = directive.split_once('=') else {
            return Err(ExprError::UnsupportedDirective(directive.to_string()));
        };
        let name = lhs.trim();
        if !is_identifier(name) || rhs.starts_with('=') {
            return Err(ExprError::UnsupportedDirective(directive.to_string()));
        }

        let value = self.eval(rhs)?;
        tracing::debug!("Directive bound {name} = {value}");
        self.bind(name, value);
        Ok(Some(name.to_string()))
    }
}

/// Errors raised while evaluating an expression or directive.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("empty expression")]
    Empty,
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("function '{0}' is not allowed")]
    UnknownFunction(String),
    #[error("{function}: {reason}")]
    BadArguments { function: String, reason: String },
    #[error("cannot apply a sign to a {0}")]
    BadOperand(&'static str),
    #[error("sequence exceeds the maximum supported length")]
    TooLong,
    #[error("expression nested too deeply")]
    TooDeep,
    #[error("unsupported directive '{0}': expected `name = expression` or an import")]
    UnsupportedDirective(String),
}

impl ExprError {
    /// Whether evaluation hit a size or nesting limit, as opposed to the
    /// input not being an expression at all.
    #[must_use]
    pub fn is_limit(&self) -> bool {
        matches!(self, Self::TooLong | Self::TooDeep)
    }
}
