//! Condition expressions.
//!
//! A closed grammar over literals and scalar context references:
//!
//! ```text
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)*
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := ("-" | "+") unary | atom
//! atom    := number | string | true | false | null | $key | "(" or ")"
//! ```
//!
//! Comparisons chain (`1 < $x <= 5` means `1 < $x and $x <= 5`).
//! `$key` inside a quoted string is replaced by the value's text.
//! There are no identifiers, calls or member access.

use serde_json::Value;

use super::types::Context;
use crate::error::{Error, Result};

/// Evaluate `expr` against `context` and return its truthiness.
pub fn evaluate_condition(expr: &str, context: &Context) -> Result<bool> {
    Ok(evaluate(expr, context)?.truthy())
}

/// Evaluate `expr` against `context`.
pub fn evaluate(expr: &str, context: &Context) -> Result<Scalar> {
    parse(expr, Some(context))?.eval()
}

/// Check that `expr` parses, without resolving any context reference.
pub fn check_syntax(expr: &str) -> Result<()> {
    parse(expr, None).map(|_| ())
}

/// Longest expression text accepted, in bytes.
const MAX_EXPRESSION_LEN: usize = 4096;

/// Deepest tree the parser builds; counts parentheses, prefix operators and
/// each link of an operator chain.
const MAX_DEPTH: usize = 64;

fn parse(expr: &str, context: Option<&Context>) -> Result<Expr> {
    if expr.len() > MAX_EXPRESSION_LEN {
        return Err(Error::Expression(format!(
            "Expression is too long ({} bytes, at most {})",
            expr.len(),
            MAX_EXPRESSION_LEN
        )));
    }
    let tokens = tokenize(expr, context)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let ast = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(Error::Expression(format!(
            "Unexpected {} in '{}'",
            tok.describe(),
            expr
        )));
    }
    Ok(ast)
}

/// Value an expression evaluates to.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl Scalar {
    pub fn truthy(&self) -> bool {
        match self {
            Scalar::Null => false,
            Scalar::Bool(b) => *b,
            Scalar::Number(n) => *n != 0.0,
            Scalar::Str(s) => !s.is_empty(),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "boolean",
            Scalar::Number(_) => "number",
            Scalar::Str(_) => "string",
        }
    }

    fn from_context(key: &str, context: &Context) -> Result<Self> {
        match context.get(key) {
            None => Err(Error::Expression(format!("Unknown context key '${}'", key))),
            Some(Value::Null) => Ok(Scalar::Null),
            Some(Value::Bool(b)) => Ok(Scalar::Bool(*b)),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Scalar::Number)
                .ok_or_else(|| Error::Expression(format!("'${}' is not a finite number", key))),
            Some(Value::String(s)) => Ok(Scalar::Str(s.clone())),
            Some(_) => Err(Error::Expression(format!(
                "'${}' is not a scalar value",
                key
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Scalar),
    Op(&'static str),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Literal(v) => format!("{} literal", v.type_name()),
            Token::Op(op) => format!("'{}'", op),
            Token::And => "'and'".to_string(),
            Token::Or => "'or'".to_string(),
            Token::Not => "'not'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
        }
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn read_key(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && is_key_char(chars[end]) {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

/// Replace `$key` in a string literal with the text of scalar context values.
/// References to missing or non-scalar values are left untouched.
fn interpolate(raw: &str, context: &Context) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            let (key, end) = read_key(&chars, i + 1);
            let text = match context.get(&key) {
                Some(Value::String(s)) if !key.is_empty() => Some(s.clone()),
                Some(v @ (Value::Number(_) | Value::Bool(_))) if !key.is_empty() => {
                    Some(v.to_string())
                }
                _ => None,
            };
            if let Some(text) = text {
                out.push_str(&text);
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Without a context, references resolve to null and strings stay raw.
fn tokenize(expr: &str, context: Option<&Context>) -> Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '$' => {
                let (key, end) = read_key(&chars, i + 1);
                if key.is_empty() {
                    return Err(Error::Expression(format!(
                        "Expected a key after '$' at position {}",
                        i
                    )));
                }
                let value = match context {
                    Some(context) => Scalar::from_context(&key, context)?,
                    None => Scalar::Null,
                };
                tokens.push(Token::Literal(value));
                i = end;
            }
            '"' | '\'' => {
                let quote = c;
                let mut raw = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j] {
                        '\\' if j + 1 < chars.len() => {
                            raw.push(chars[j + 1]);
                            j += 2;
                        }
                        ch if ch == quote => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        ch => {
                            raw.push(ch);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(Error::Expression("Unterminated string literal".into()));
                }
                let text = match context {
                    Some(context) => interpolate(&raw, context),
                    None => raw,
                };
                tokens.push(Token::Literal(Scalar::Str(text)));
                i = j;
            }
            _ if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| Error::Expression(format!("Invalid number '{}'", text)))?;
                tokens.push(Token::Literal(Scalar::Number(n)));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let (word, end) = read_key(&chars, i);
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" | "True" => Token::Literal(Scalar::Bool(true)),
                    "false" | "False" => Token::Literal(Scalar::Bool(false)),
                    "null" | "None" => Token::Literal(Scalar::Null),
                    _ => {
                        return Err(Error::Expression(format!(
                            "Unknown identifier '{}' (context values are referenced as ${})",
                            word, word
                        )))
                    }
                };
                tokens.push(token);
                i = end;
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Op("=="), 2),
                    ('!', Some('=')) => (Token::Op("!="), 2),
                    ('<', Some('=')) => (Token::Op("<="), 2),
                    ('>', Some('=')) => (Token::Op(">="), 2),
                    ('&', Some('&')) => (Token::And, 2),
                    ('|', Some('|')) => (Token::Or, 2),
                    ('<', _) => (Token::Op("<"), 1),
                    ('>', _) => (Token::Op(">"), 1),
                    ('!', _) => (Token::Not, 1),
                    ('+', _) => (Token::Op("+"), 1),
                    ('-', _) => (Token::Op("-"), 1),
                    ('*', _) => (Token::Op("*"), 1),
                    ('/', _) => (Token::Op("/"), 1),
                    ('%', _) => (Token::Op("%"), 1),
                    _ => {
                        return Err(Error::Expression(format!(
                            "Unexpected character '{}' at position {}",
                            c, i
                        )))
                    }
                };
                tokens.push(token);
                i += width;
            }
        }
    }

    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Literal(Scalar),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Binary(&'static str, Box<Expr>, Box<Expr>),
    /// `a op1 b op2 c ...`
    Compare(Box<Expr>, Vec<(&'static str, Expr)>),
}

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
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn peek_op(&self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => Some(op),
            _ => None,
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::Expression("Expression nested too deeply".into()));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr> {
        let first = self.parse_sum()?;
        let mut rest = Vec::new();
        while let Some(op) = self.peek_op(&["==", "!=", "<", "<=", ">", ">="]) {
            self.pos += 1;
            rest.push((op, self.parse_sum()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare(Box::new(first), rest))
        }
    }

    fn parse_sum(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut left = self.parse_product()?;
        while let Some(op) = self.peek_op(&["+", "-"]) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_product()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr> {
        let base = self.depth;
        let mut left = self.parse_unary()?;
        while let Some(op) = self.peek_op(&["*", "/", "%"]) {
            self.pos += 1;
            self.descend()?;
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth = base;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let Some(op) = self.peek_op(&["-", "+"]) else {
            return self.parse_atom();
        };
        self.pos += 1;
        self.descend()?;
        let inner = self.parse_unary()?;
        self.depth -= 1;
        if op == "-" {
            Ok(Expr::Neg(Box::new(inner)))
        } else {
            Ok(inner)
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Expression("Expected ')'".into())),
                }
            }
            Some(tok) => Err(Error::Expression(format!(
                "Unexpected {}",
                tok.describe()
            ))),
            None => Err(Error::Expression("Unexpected end of expression".into())),
        }
    }
}

impl Expr {
    fn eval(&self) -> Result<Scalar> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Neg(inner) => match inner.eval()? {
                Scalar::Number(n) => Ok(Scalar::Number(-n)),
                other => Err(Error::Expression(format!(
                    "Cannot negate a {}",
                    other.type_name()
                ))),
            },
            Expr::Not(inner) => Ok(Scalar::Bool(!inner.eval()?.truthy())),
            Expr::And(left, right) => {
                if !left.eval()?.truthy() {
                    return Ok(Scalar::Bool(false));
                }
                Ok(Scalar::Bool(right.eval()?.truthy()))
            }
            Expr::Or(left, right) => {
                if left.eval()?.truthy() {
                    return Ok(Scalar::Bool(true));
                }
                Ok(Scalar::Bool(right.eval()?.truthy()))
            }
            Expr::Binary(op, left, right) => arithmetic(op, left.eval()?, right.eval()?),
            Expr::Compare(first, rest) => {
                let mut left = first.eval()?;
                for (op, expr) in rest {
                    let right = expr.eval()?;
                    if !compare(op, &left, &right)? {
                        return Ok(Scalar::Bool(false));
                    }
                    left = right;
                }
                Ok(Scalar::Bool(true))
            }
        }
    }
}

fn arithmetic(op: &str, left: Scalar, right: Scalar) -> Result<Scalar> {
    match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => {
            let value = match op {
                "+" => a + b,
                "-" => a - b,
                "*" => a * b,
                "/" | "%" if b == 0.0 => {
                    return Err(Error::Expression("Division by zero".into()))
                }
                "/" => a / b,
                // Sign follows the divisor
                "%" => ((a % b) + b) % b,
                _ => return Err(Error::Expression(format!("Unknown operator '{}'", op))),
            };
            Ok(Scalar::Number(value))
        }
        (Scalar::Str(a), Scalar::Str(b)) if op == "+" => Ok(Scalar::Str(a + &b)),
        (a, b) => Err(Error::Expression(format!(
            "Cannot apply '{}' to {} and {}",
            op,
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn compare(op: &str, left: &Scalar, right: &Scalar) -> Result<bool> {
    match op {
        "==" => return Ok(left == right),
        "!=" => return Ok(left != right),
        _ => {}
    }

    let ordering = match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        _ => None,
    }
    .ok_or_else(|| {
        Error::Expression(format!(
            "Cannot compare {} and {} with '{}'",
            left.type_name(),
            right.type_name(),
            op
        ))
    })?;

    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => return Err(Error::Expression(format!("Unknown operator '{}'", op))),
    })
}
