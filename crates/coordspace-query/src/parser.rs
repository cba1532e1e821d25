//! Filter expression parser
//!
//! ```text
//! query   := [cond (AND cond)*] [LIMIT n]
//! cond    := path op literal | path BETWEEN literal AND literal
//! op      := = | != | < | <= | > | >=
//! literal := integer | float | 'string' | true | false | null
//! ```
//!
//! Keywords are case-insensitive, paths are dotted identifiers, and `''`
//! inside a string literal is an escaped quote.

use crate::error::{QueryParseError, QueryParseResult};
use crate::matchmaker::{CompareOp, Matchmaker, Query};
use crate::property::PropertyPath;
use coordspace_common::Value;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(CompareOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Word(w) => w.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => format!("'{s}'"),
            Self::Op(op) => op.symbol().to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(w) if w.eq_ignore_ascii_case(keyword))
    }
}

fn tokenize(input: &str) -> QueryParseResult<Vec<(usize, Token)>> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        let start = pos;
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => pos += 1,
            b'=' => {
                tokens.push((start, Token::Op(CompareOp::Eq)));
                pos += 1;
            }
            b'!' if bytes.get(pos + 1) == Some(&b'=') => {
                tokens.push((start, Token::Op(CompareOp::Ne)));
                pos += 2;
            }
            b'<' | b'>' => {
                let with_eq = bytes.get(pos + 1) == Some(&b'=');
                let op = match (c, with_eq) {
                    (b'<', false) => CompareOp::Lt,
                    (b'<', true) => CompareOp::Le,
                    (_, false) => CompareOp::Gt,
                    (_, true) => CompareOp::Ge,
                };
                tokens.push((start, Token::Op(op)));
                pos += if with_eq { 2 } else { 1 };
            }
            b'\'' => {
                let mut text = String::new();
                pos += 1;
                loop {
                    let Some(rest) = input.get(pos..) else {
                        return Err(QueryParseError::UnterminatedString { offset: start });
                    };
                    let Some(quote) = rest.find('\'') else {
                        return Err(QueryParseError::UnterminatedString { offset: start });
                    };
                    text.push_str(&rest[..quote]);
                    pos += quote + 1;
                    if bytes.get(pos) == Some(&b'\'') {
                        text.push('\'');
                        pos += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((start, Token::Str(text)));
            }
            b'0'..=b'9' | b'-' => {
                pos += 1;
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric()
                        || bytes[pos] == b'.'
                        || (matches!(bytes[pos], b'+' | b'-')
                            && matches!(bytes[pos - 1], b'e' | b'E')))
                {
                    pos += 1;
                }
                let text = &input[start..pos];
                tokens.push((start, parse_number(start, text)?));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                while pos < bytes.len()
                    && (bytes[pos].is_ascii_alphanumeric() || matches!(bytes[pos], b'_' | b'.'))
                {
                    pos += 1;
                }
                tokens.push((start, Token::Word(input[start..pos].to_string())));
            }
            _ => {
                let ch = input[start..].chars().next().unwrap_or('?');
                return Err(QueryParseError::InvalidCharacter { offset: start, ch });
            }
        }
    }
    Ok(tokens)
}

fn parse_number(offset: usize, text: &str) -> QueryParseResult<Token> {
    let invalid = || QueryParseError::InvalidNumber {
        offset,
        text: text.to_string(),
    };
    if text.contains(['.', 'e', 'E']) {
        let value: f64 = text.parse().map_err(|_| invalid())?;
        if !value.is_finite() {
            return Err(invalid());
        }
        Ok(Token::Float(value))
    } else {
        text.parse().map(Token::Int).map_err(|_| invalid())
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self, expected: &'static str) -> QueryParseResult<(usize, Token)> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(QueryParseError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(offset: usize, token: &Token, expected: &'static str) -> QueryParseError {
        QueryParseError::UnexpectedToken {
            offset,
            found: token.describe(),
            expected,
        }
    }

    fn expect_keyword(&mut self, keyword: &'static str) -> QueryParseResult<()> {
        let (offset, token) = self.next(keyword)?;
        if token.is_keyword(keyword) {
            Ok(())
        } else {
            Err(Self::unexpected(offset, &token, keyword))
        }
    }

    fn path(&mut self) -> QueryParseResult<PropertyPath> {
        const EXPECTED: &str = "property path";
        let (offset, token) = self.next(EXPECTED)?;
        let Token::Word(word) = &token else {
            return Err(Self::unexpected(offset, &token, EXPECTED));
        };
        let reserved = ["and", "limit", "between", "true", "false", "null"]
            .iter()
            .any(|k| word.eq_ignore_ascii_case(k));
        if reserved || word.split('.').any(str::is_empty) {
            return Err(Self::unexpected(offset, &token, EXPECTED));
        }
        Ok(PropertyPath::parse(word))
    }

    fn literal(&mut self) -> QueryParseResult<Value> {
        const EXPECTED: &str = "literal";
        let (offset, token) = self.next(EXPECTED)?;
        match token {
            Token::Int(i) => Ok(Value::Int(i)),
            Token::Float(f) => Ok(Value::from(f)),
            Token::Str(s) => Ok(Value::Str(s)),
            ref t if t.is_keyword("true") => Ok(Value::Bool(true)),
            ref t if t.is_keyword("false") => Ok(Value::Bool(false)),
            ref t if t.is_keyword("null") => Ok(Value::Null),
            t => Err(Self::unexpected(offset, &t, EXPECTED)),
        }
    }

    fn condition(&mut self) -> QueryParseResult<Matchmaker> {
        let path = self.path()?;
        let (offset, token) = self.next("operator")?;
        match token {
            Token::Op(op) => Ok(Matchmaker::Compare {
                path,
                op,
                value: self.literal()?,
            }),
            ref t if t.is_keyword("between") => {
                let low = self.literal()?;
                self.expect_keyword("AND")?;
                let high = self.literal()?;
                Ok(Matchmaker::Between { path, low, high })
            }
            t => Err(Self::unexpected(offset, &t, "operator")),
        }
    }

    fn limit(&mut self) -> QueryParseResult<usize> {
        let (offset, token) = self.next("limit")?;
        match token {
            Token::Int(n) => usize::try_from(n).map_err(|_| QueryParseError::InvalidNumber {
                offset,
                text: n.to_string(),
            }),
            t => Err(Self::unexpected(offset, &t, "non-negative integer")),
        }
    }

    fn query(&mut self) -> QueryParseResult<Query> {
        let mut conditions = Vec::new();
        let mut limit = None;

        if self.peek().is_some_and(|t| !t.is_keyword("limit")) {
            conditions.push(self.condition()?);
            while self.peek().is_some_and(|t| t.is_keyword("and")) {
                self.pos += 1;
                conditions.push(self.condition()?);
            }
        }
        if self.peek().is_some_and(|t| t.is_keyword("limit")) {
            self.pos += 1;
            limit = Some(self.limit()?);
        }
        if let Some((offset, token)) = self.tokens.get(self.pos) {
            return Err(Self::unexpected(*offset, token, "AND, LIMIT or end of input"));
        }

        let matchmaker = match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(Matchmaker::And(conditions)),
        };
        Ok(Query {
            matchmaker,
            kind: None,
            limit,
        })
    }
}

/// Parse a filter expression into a query
pub fn parse_query(input: &str) -> QueryParseResult<Query> {
    let tokens = tokenize(input)?;
    Parser { tokens, pos: 0 }.query()
}
