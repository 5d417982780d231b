//! Configuration macro expansion.
//!
//! String values are treated as templates over a macro dictionary using
//! `$name` / `${name}` references with `$$` as the escape; unknown or
//! malformed references are left intact. A string of the shape
//! `eval(<expr>)` has the inner expression evaluated after substitution
//! and the result substituted as the value; the expression language is a
//! deliberately small whitelist — literals, `int(..)` / `float(..)` /
//! `str(..)` and arithmetic — not a general interpreter.

use faststr::FastStr;

use crate::{
    error::{Error, Result},
    value::{Value, ValueMap},
};

/// Recursively expands macros through a value: strings are substituted
/// (and evaluated when wrapped in `eval(...)`), sequences and mappings
/// recurse through their values, everything else passes through.
pub fn expand(value: &Value, vars: &ValueMap) -> Result<Value> {
    Ok(match value {
        Value::Str(s) => {
            if let Some(inner) = s.strip_prefix("eval(").and_then(|r| r.strip_suffix(')')) {
                eval(&substitute(inner, vars))?
            } else {
                Value::Str(substitute(s, vars).into())
            }
        }
        Value::Seq(items) => Value::Seq(
            items
                .iter()
                .map(|item| expand(item, vars))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => {
            let mut expanded = ValueMap::new();
            for (key, item) in map.iter() {
                expanded.insert(key.clone(), expand(item, vars)?);
            }
            Value::Map(expanded)
        }
        other => other.clone(),
    })
}

/// `$name` / `${name}` substitution with safe semantics: `$$` escapes a
/// dollar, references to unknown macros and malformed references are
/// copied through unchanged.
pub fn substitute(template: &str, vars: &ValueMap) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }
        if let Some(braced) = after.strip_prefix('{') {
            if let Some((ident, tail)) = take_ident(braced) {
                if let Some(tail) = tail.strip_prefix('}') {
                    match macro_text(vars, ident) {
                        Some(text) => out.push_str(&text),
                        None => {
                            out.push_str("${");
                            out.push_str(ident);
                            out.push('}');
                        }
                    }
                    rest = tail;
                    continue;
                }
            }
            // malformed braced reference: keep the dollar and move on
            out.push('$');
            rest = after;
            continue;
        }
        if let Some((ident, tail)) = take_ident(after) {
            match macro_text(vars, ident) {
                Some(text) => out.push_str(&text),
                None => {
                    out.push('$');
                    out.push_str(ident);
                }
            }
            rest = tail;
            continue;
        }
        out.push('$');
        rest = after;
    }
    out.push_str(rest);
    out
}

fn take_ident(s: &str) -> Option<(&str, &str)> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return None,
    }
    let end = chars
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// Only scalar macros have a textual form; a reference to anything else
/// is treated as unknown and left intact.
fn macro_text(vars: &ValueMap, name: &str) -> Option<String> {
    match vars.get(name)? {
        Value::Str(s) => Some(s.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Evaluates the whitelisted expression subset.
pub fn eval(expr: &str) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::config(format!(
            "trailing input in eval expression '{expr}'"
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '\'' | '"' => {
                chars.next();
                let quote = c;
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == quote => break,
                        Some((_, '\\')) => match chars.next() {
                            Some((_, 'n')) => text.push('\n'),
                            Some((_, 't')) => text.push('\t'),
                            Some((_, '0')) => text.push('\0'),
                            Some((_, escaped)) => text.push(escaped),
                            None => {
                                return Err(Error::config(format!(
                                    "unterminated string in eval expression '{expr}'"
                                )))
                            }
                        },
                        Some((_, ch)) => text.push(ch),
                        None => {
                            return Err(Error::config(format!(
                                "unterminated string in eval expression '{expr}'"
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() => {
                let mut end = start;
                let mut float = false;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_ascii_digit() {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else if ch == '.' && !float {
                        float = true;
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &expr[start..end];
                if float {
                    tokens.push(Token::Float(text.parse().map_err(|_| {
                        Error::config(format!("invalid number '{text}'"))
                    })?));
                } else {
                    tokens.push(Token::Int(text.parse().map_err(|_| {
                        Error::config(format!("invalid number '{text}'"))
                    })?));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        end = i + ch.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(expr[start..end].to_string()));
            }
            other => {
                return Err(Error::config(format!(
                    "unexpected character '{other}' in eval expression '{expr}'"
                )))
            }
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(Error::config(format!(
                "expected {token:?}, found {other:?}"
            ))),
        }
    }

    fn expr(&mut self) -> Result<Value> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = add(left, right)?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let right = self.term()?;
                    left = numeric(left, right, "-", |a, b| a - b, |a, b| a.checked_sub(b))?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> Result<Value> {
        let mut left = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = numeric(left, right, "*", |a, b| a * b, |a, b| a.checked_mul(b))?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    let (a, b) = floats(left, right, "/")?;
                    if b == 0.0 {
                        return Err(Error::config("division by zero in eval expression"));
                    }
                    left = Value::Float(a / b);
                }
                Some(Token::Percent) => {
                    self.pos += 1;
                    let right = self.unary()?;
                    left = match (left, right) {
                        (Value::Int(a), Value::Int(b)) => {
                            if b == 0 {
                                return Err(Error::config("modulo by zero in eval expression"));
                            }
                            Value::Int(a.rem_euclid(b))
                        }
                        (a, b) => {
                            let (a, b) = floats(a, b, "%")?;
                            if b == 0.0 {
                                return Err(Error::config("modulo by zero in eval expression"));
                            }
                            Value::Float(a.rem_euclid(b))
                        }
                    };
                }
                _ => return Ok(left),
            }
        }
    }

    fn unary(&mut self) -> Result<Value> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return match self.unary()? {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(Error::config(format!("cannot negate a {}", other.kind()))),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Value::Int(i)),
            Some(Token::Float(f)) => Ok(Value::Float(f)),
            Some(Token::Str(s)) => Ok(Value::Str(s.into())),
            Some(Token::LParen) => {
                let value = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let argument = self.expr()?;
                self.expect(Token::RParen)?;
                call(&name, argument)
            }
            other => Err(Error::config(format!(
                "unexpected token {other:?} in eval expression"
            ))),
        }
    }
}

fn call(name: &str, argument: Value) -> Result<Value> {
    match name {
        "int" => match argument {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::config(format!("int() cannot parse '{s}'"))),
            other => Err(Error::config(format!("int() cannot take a {}", other.kind()))),
        },
        "float" => match argument {
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| Error::config(format!("float() cannot parse '{s}'"))),
            other => Err(Error::config(format!(
                "float() cannot take a {}",
                other.kind()
            ))),
        },
        "str" => match argument {
            Value::Str(s) => Ok(Value::Str(s)),
            Value::Int(i) => Ok(Value::Str(i.to_string().into())),
            Value::Float(f) => Ok(Value::Str(f.to_string().into())),
            Value::Bool(b) => Ok(Value::Str(FastStr::from(b.to_string()))),
            other => Err(Error::config(format!("str() cannot take a {}", other.kind()))),
        },
        other => Err(Error::config(format!(
            "function '{other}' is not allowed in eval expressions"
        ))),
    }
}

fn add(left: Value, right: Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(b)
            .map(Value::Int)
            .ok_or_else(|| Error::config("integer overflow in eval expression")),
        (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}").into())),
        (a, b) => {
            let (a, b) = floats(a, b, "+")?;
            Ok(Value::Float(a + b))
        }
    }
}

fn numeric(
    left: Value,
    right: Value,
    op: &str,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_op(a, b)
            .map(Value::Int)
            .ok_or_else(|| Error::config("integer overflow in eval expression")),
        (a, b) => {
            let (a, b) = floats(a, b, op)?;
            Ok(Value::Float(float_op(a, b)))
        }
    }
}

fn floats(left: Value, right: Value, op: &str) -> Result<(f64, f64)> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Error::config(format!(
            "operator '{op}' needs numeric operands, got {} and {}",
            left.kind(),
            right.kind()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_map;

    fn vars() -> ValueMap {
        value_map! {
            "key" => "value",
            "number" => "123",
            "bar" => "biz",
        }
    }

    #[test]
    fn plain_substitution() {
        assert_eq!(substitute("here: ${bar}", &vars()), "here: biz");
        assert_eq!(substitute("here: $bar!", &vars()), "here: biz!");
        assert_eq!(substitute("no macros", &vars()), "no macros");
    }

    #[test]
    fn escape_rules_match_safe_substitution() {
        // the canonical torture template: escapes, malformed braces and
        // unknown references all survive exactly
        let template = "${key}${{key}}$$key{$}key$keykey{key$}{{$key{{${key$key}";
        assert_eq!(
            substitute(template, &vars()),
            "value${{key}}$key{$}key$keykey{key$}{{value{{${keyvalue}"
        );
    }

    #[test]
    fn unknown_references_stay_intact() {
        assert_eq!(substitute("$missing and ${gone}", &vars()), "$missing and ${gone}");
        assert_eq!(substitute("trailing $", &vars()), "trailing $");
    }

    #[test]
    fn expansion_is_idempotent_on_stable_values() {
        let vars = vars();
        let value = Value::from("here: ${bar}");
        let once = expand(&value, &vars).unwrap();
        assert_eq!(once, Value::from("here: biz"));
        let twice = expand(&once, &vars).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn expansion_recurses_through_containers() {
        let vars = vars();
        let value = Value::Map(value_map! {
            "plain" => 7,
            "deep" => Value::Seq(vec![
                Value::from("$key"),
                Value::Map(value_map! { "$key" => "$key" }),
            ]),
        });
        let expanded = expand(&value, &vars).unwrap();
        assert_eq!(expanded.get("plain"), Some(&Value::Int(7)));
        let deep = expanded.get("deep").and_then(Value::as_seq).unwrap();
        assert_eq!(deep[0], Value::from("value"));
        // mapping keys are not expanded, values are
        assert_eq!(deep[1].get("$key"), Some(&Value::from("value")));
    }

    #[test]
    fn bytes_pass_through_unexpanded() {
        let value = Value::bytes(&b"\x00"[..]);
        assert_eq!(expand(&value, &vars()).unwrap(), value);
    }

    #[test]
    fn eval_after_substitution() {
        let expanded = expand(&Value::from("eval(int($number))"), &vars()).unwrap();
        assert_eq!(expanded, Value::Int(123));
    }

    #[test]
    fn eval_arithmetic_subset() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::Int(9));
        assert_eq!(eval("7 % 3").unwrap(), Value::Int(1));
        assert_eq!(eval("-4 + 1").unwrap(), Value::Int(-3));
        assert_eq!(eval("1 / 2").unwrap(), Value::Float(0.5));
        assert_eq!(eval("float('1.5')").unwrap(), Value::Float(1.5));
        assert_eq!(eval("str(42)").unwrap(), Value::from("42"));
        assert_eq!(eval("'a' + 'b'").unwrap(), Value::from("ab"));
    }

    #[test]
    fn eval_rejects_everything_else() {
        assert!(eval("exec('rm')").is_err());
        assert!(eval("__import__('os')").is_err());
        assert!(eval("1; 2").is_err());
        assert!(eval("1 / 0").is_err());
        assert!(eval("int('abc')").is_err());
    }
}
