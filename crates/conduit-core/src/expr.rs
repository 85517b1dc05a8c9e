//! C2: sandboxed expression evaluator over `{input, len, any, all, min, max,
//! abs}`. Used by `Filter.condition`, `GroupBy.key`, `Sort.key`,
//! `Eval.expression`.
//!
//! A small hand-rolled recursive-descent parser and tree-walking evaluator —
//! deliberately far narrower than a general scripting language (no
//! statements, no imports, no attribute access beyond `input`'s own fields,
//! as required by spec §4.2 and §9's sandboxing note). The AST shape takes
//! its cue from `ouros`'s `Expr`/`Operator` split, trimmed to the handful of
//! node kinds this grammar actually needs.

use serde_json::{json, Value};

use crate::error::{ConduitError, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Input,
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

const ALLOWED_CALLS: &[&str] = &["len", "any", "all", "min", "max", "abs"];

/// A compiled expression, safe to evaluate repeatedly against different
/// `input` contexts.
#[derive(Debug, Clone)]
pub struct Expression {
    root: Expr,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Expression> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ConduitError::new(
                ErrorKind::ExpressionError,
                format!("unexpected trailing input in expression: {source}"),
            ));
        }
        Ok(Expression { root })
    }

    pub fn eval(&self, input: &Value) -> Result<Value> {
        eval_expr(&self.root, input)
    }

    /// Evaluates and coerces the result to a boolean via truthiness, for
    /// `Filter.condition`-style callers.
    pub fn eval_bool(&self, input: &Value) -> Result<bool> {
        Ok(truthy(&self.eval(input)?))
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_f64(v: &Value) -> Result<f64> {
    match v {
        Value::Number(n) => n.as_f64().ok_or_else(|| expr_err("not a finite number")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        _ => Err(expr_err(&format!("expected a number, got {v}"))),
    }
}

fn num_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn expr_err(message: &str) -> ConduitError {
    ConduitError::new(ErrorKind::ExpressionError, message.to_string())
}

fn eval_expr(expr: &Expr, input: &Value) -> Result<Value> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Number(n) => Ok(num_value(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Input => Ok(input.clone()),
        Expr::Field(base, name) => {
            let base_val = eval_expr(base, input)?;
            Ok(base_val.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Index(base, idx) => {
            let base_val = eval_expr(base, input)?;
            let idx_val = eval_expr(idx, input)?;
            let result = match (&base_val, &idx_val) {
                (Value::Array(arr), Value::Number(n)) => {
                    let i = n.as_u64().ok_or_else(|| expr_err("array index must be a non-negative integer"))? as usize;
                    arr.get(i).cloned()
                }
                (Value::Object(map), Value::String(key)) => map.get(key).cloned(),
                _ => None,
            };
            Ok(result.unwrap_or(Value::Null))
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval_expr(inner, input)?))),
        Expr::Neg(inner) => Ok(num_value(-to_f64(&eval_expr(inner, input)?)?)),
        Expr::BinOp(op, lhs, rhs) => eval_binop(*op, lhs, rhs, input),
        Expr::Call(name, args) => eval_call(name, args, input),
    }
}

fn eval_binop(op: BinOp, lhs: &Expr, rhs: &Expr, input: &Value) -> Result<Value> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = truthy(&eval_expr(lhs, input)?);
        return Ok(Value::Bool(match op {
            BinOp::And => l && truthy(&eval_expr(rhs, input)?),
            BinOp::Or => l || truthy(&eval_expr(rhs, input)?),
            _ => unreachable!(),
        }));
    }
    let l = eval_expr(lhs, input)?;
    let r = eval_expr(rhs, input)?;
    match op {
        BinOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Ok(num_value(to_f64(&l)? + to_f64(&r)?)),
        },
        BinOp::Sub => Ok(num_value(to_f64(&l)? - to_f64(&r)?)),
        BinOp::Mul => Ok(num_value(to_f64(&l)? * to_f64(&r)?)),
        BinOp::Div => {
            let divisor = to_f64(&r)?;
            if divisor == 0.0 {
                return Err(expr_err("division by zero"));
            }
            Ok(num_value(to_f64(&l)? / divisor))
        }
        BinOp::Mod => {
            let divisor = to_f64(&r)?;
            if divisor == 0.0 {
                return Err(expr_err("division by zero"));
            }
            Ok(num_value(to_f64(&l)? % divisor))
        }
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => to_f64(&l)?.partial_cmp(&to_f64(&r)?).ok_or_else(|| expr_err("incomparable values"))?,
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            }))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn eval_call(name: &str, args: &[Expr], input: &Value) -> Result<Value> {
    let values: Vec<Value> = args.iter().map(|a| eval_expr(a, input)).collect::<Result<_>>()?;
    // `len`/`any`/`all`/`min`/`max` accept a single collection argument or a
    // variadic scalar list; `abs` is strictly unary.
    let elements: Vec<Value> = if values.len() == 1 {
        match &values[0] {
            Value::Array(arr) => arr.clone(),
            other => vec![other.clone()],
        }
    } else {
        values.clone()
    };
    match name {
        "len" => {
            if values.len() != 1 {
                return Err(expr_err("len() takes exactly one argument"));
            }
            match &values[0] {
                Value::Array(a) => Ok(json!(a.len())),
                Value::String(s) => Ok(json!(s.chars().count())),
                Value::Object(o) => Ok(json!(o.len())),
                _ => Err(expr_err("len() requires an array, string, or object")),
            }
        }
        "any" => Ok(Value::Bool(elements.iter().any(truthy))),
        "all" => Ok(Value::Bool(elements.iter().all(truthy))),
        "min" => {
            let mut best: Option<f64> = None;
            for v in &elements {
                let f = to_f64(v)?;
                best = Some(best.map_or(f, |b| b.min(f)));
            }
            best.map(num_value).ok_or_else(|| expr_err("min() requires at least one value"))
        }
        "max" => {
            let mut best: Option<f64> = None;
            for v in &elements {
                let f = to_f64(v)?;
                best = Some(best.map_or(f, |b| b.max(f)));
            }
            best.map(num_value).ok_or_else(|| expr_err("max() requires at least one value"))
        }
        "abs" => {
            if values.len() != 1 {
                return Err(expr_err("abs() takes exactly one argument"));
            }
            Ok(num_value(to_f64(&values[0])?.abs()))
        }
        other => Err(expr_err(&format!("unknown function: {other}"))),
    }
}

// --- lexer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn lex(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(expr_err("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| expr_err(&format!("invalid number literal: {text}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(expr_err(&format!("unexpected character: {other}"))),
        }
    }
    Ok(tokens)
}

// --- recursive-descent parser ---

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, tok: &Token) -> Result<()> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(expr_err(&format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinOp::Eq),
            Some(Token::Ne) => Some(BinOp::Ne),
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let rhs = self.parse_add()?;
            return Ok(Expr::BinOp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) if name.starts_with('_') => {
                            return Err(expr_err(&format!("reserved-prefix field name not allowed: {name}")));
                        }
                        Some(Token::Ident(name)) => expr = Expr::Field(Box::new(expr), name),
                        other => return Err(expr_err(&format!("expected field name after `.`, found {other:?}"))),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let idx = self.parse_or()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(idx));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if name == "input" {
                    return Ok(Expr::Input);
                }
                if name == "true" {
                    return Ok(Expr::Bool(true));
                }
                if name == "false" {
                    return Ok(Expr::Bool(false));
                }
                if name == "null" {
                    return Ok(Expr::Null);
                }
                if name.starts_with('_') {
                    return Err(expr_err(&format!("reserved-prefix identifier not allowed: {name}")));
                }
                if self.peek() == Some(&Token::LParen) {
                    if !ALLOWED_CALLS.contains(&name.as_str()) {
                        return Err(expr_err(&format!("unknown function: {name}")));
                    }
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        args.push(self.parse_or()?);
                        while self.peek() == Some(&Token::Comma) {
                            self.advance();
                            args.push(self.parse_or()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Call(name, args));
                }
                Err(expr_err(&format!(
                    "unknown identifier: {name} (only `input` and the builtin functions are allowed)"
                )))
            }
            other => Err(expr_err(&format!("unexpected token: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_predicate_s3() {
        let expr = Expression::compile("input.a >= 2").unwrap();
        assert!(!expr.eval_bool(&json!({"a": 1})).unwrap());
        assert!(expr.eval_bool(&json!({"a": 2})).unwrap());
        assert!(expr.eval_bool(&json!({"a": 3})).unwrap());
    }

    #[test]
    fn eval_arithmetic_s4() {
        let doubled = Expression::compile("input.x * 2").unwrap();
        let squared = Expression::compile("input.x * input.x").unwrap();
        let ctx = json!({"x": 10});
        assert_eq!(doubled.eval(&ctx).unwrap(), json!(20));
        assert_eq!(squared.eval(&ctx).unwrap(), json!(100));
    }

    #[test]
    fn bracket_index_key() {
        let expr = Expression::compile("input['c']").unwrap();
        assert_eq!(expr.eval(&json!({"c": "a"})).unwrap(), json!("a"));
    }

    #[test]
    fn builtin_functions() {
        assert_eq!(Expression::compile("len(input.xs)").unwrap().eval(&json!({"xs": [1, 2, 3]})).unwrap(), json!(3));
        assert!(Expression::compile("any(input.xs)").unwrap().eval_bool(&json!({"xs": [false, true]})).unwrap());
        assert!(!Expression::compile("all(input.xs)").unwrap().eval_bool(&json!({"xs": [false, true]})).unwrap());
        assert_eq!(Expression::compile("abs(input.x)").unwrap().eval(&json!({"x": -5})).unwrap(), json!(5));
        assert_eq!(Expression::compile("min(1, 2, 3)").unwrap().eval(&Value::Null).unwrap(), json!(1));
        assert_eq!(Expression::compile("max(1, 2, 3)").unwrap().eval(&Value::Null).unwrap(), json!(3));
    }

    #[test]
    fn logical_operators() {
        let expr = Expression::compile("input.a > 0 and input.b > 0").unwrap();
        assert!(expr.eval_bool(&json!({"a": 1, "b": 1})).unwrap());
        assert!(!expr.eval_bool(&json!({"a": 1, "b": -1})).unwrap());
    }

    #[test]
    fn reserved_prefix_identifiers_rejected() {
        let err = Expression::compile("_secret").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
    }

    #[test]
    fn reserved_prefix_field_access_rejected() {
        let err = Expression::compile("input._x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
    }

    #[test]
    fn len_with_wrong_arity_is_an_expression_error_not_a_panic() {
        let err = Expression::compile("len()").unwrap().eval(&Value::Null).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
        let err = Expression::compile("len(input.xs, input.ys)").unwrap().eval(&json!({"xs": [1], "ys": [2]})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
    }

    #[test]
    fn unknown_identifier_rejected() {
        let err = Expression::compile("os").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExpressionError);
    }
}
