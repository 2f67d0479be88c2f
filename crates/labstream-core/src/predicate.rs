//! Structured queries over stream descriptors.
//!
//! The textual form accepts a small XPath-like language:
//!
//! ```text
//! type='EEG' and starts-with(name,'BioSemi') and not(desc/manufacturer='Acme')
//! ```
//!
//! Supported are `prop='v'`, `prop!='v'`, `starts-with(prop,'v')`,
//! `contains(prop,'v')`, `and`, `or`, `not(...)` and parentheses. A
//! property is either a core field (`name`, `type`, `source_id`, ...) or
//! a `desc/...` path into the extended metadata.

use crate::{
    error::{Error, Result},
    info::StreamInfo,
};
use serde::{Deserialize, Serialize};
use std::{fmt, iter::Peekable, str::Chars, str::FromStr};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every stream.
    All,
    Eq { prop: String, value: String },
    Ne { prop: String, value: String },
    StartsWith { prop: String, value: String },
    Contains { prop: String, value: String },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { inner: Box<Predicate> },
}

impl Predicate {
    /// Exact match of one property.
    pub fn property(prop: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Eq {
            prop: prop.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::All => other,
            Self::And { mut all } => {
                all.push(other);
                Self::And { all }
            }
            lhs => Self::And {
                all: vec![lhs, other],
            },
        }
    }

    pub fn matches(&self, info: &StreamInfo) -> bool {
        match self {
            Self::All => true,
            Self::Eq { prop, value } => info.property(prop).is_some_and(|v| v == *value),
            Self::Ne { prop, value } => info.property(prop).is_some_and(|v| v != *value),
            Self::StartsWith { prop, value } => {
                info.property(prop).is_some_and(|v| v.starts_with(value.as_str()))
            }
            Self::Contains { prop, value } => {
                info.property(prop).is_some_and(|v| v.contains(value.as_str()))
            }
            Self::And { all } => all.iter().all(|p| p.matches(info)),
            Self::Or { any } => any.iter().any(|p| p.matches(info)),
            Self::Not { inner } => !inner.matches(info),
        }
    }

    /// Whether evaluation needs the extended metadata, which compact
    /// announcements do not carry.
    pub fn uses_metadata(&self) -> bool {
        match self {
            Self::All => false,
            Self::Eq { prop, .. }
            | Self::Ne { prop, .. }
            | Self::StartsWith { prop, .. }
            | Self::Contains { prop, .. } => prop.starts_with("desc/"),
            Self::And { all } => all.iter().any(Predicate::uses_metadata),
            Self::Or { any } => any.iter().any(Predicate::uses_metadata),
            Self::Not { inner } => inner.uses_metadata(),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => Ok(()),
            Self::Eq { prop, value } => write!(f, "{prop}='{value}'"),
            Self::Ne { prop, value } => write!(f, "{prop}!='{value}'"),
            Self::StartsWith { prop, value } => write!(f, "starts-with({prop},'{value}')"),
            Self::Contains { prop, value } => write!(f, "contains({prop},'{value}')"),
            Self::And { all } => join(f, all, " and "),
            Self::Or { any } => join(f, any, " or "),
            Self::Not { inner } => write!(f, "not({inner})"),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Predicate], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "({item})")?;
    }
    Ok(())
}

impl FromStr for Predicate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Ok(Self::All);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let predicate = parser.expr()?;
        match parser.peek() {
            None => Ok(predicate),
            Some(tok) => Err(Error::invalid(format!("unexpected {tok:?} in predicate '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
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
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(Error::invalid("expected '=' after '!'"));
                }
                tokens.push(Token::Ne);
            }
            '\'' | '"' => tokens.push(Token::Str(quoted(&mut chars)?)),
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || matches!(c, '_' | '-' | '/' | '.' | ':') {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if ident.is_empty() {
                    return Err(Error::invalid(format!("unexpected character '{c}'")));
                }
                tokens.push(Token::Ident(ident));
            }
        }
    }

    Ok(tokens)
}

fn quoted(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let Some(quote) = chars.next() else {
        return Err(Error::invalid("unterminated string"));
    };
    let mut value = String::new();
    for c in chars.by_ref() {
        if c == quote {
            return Ok(value);
        }
        value.push(c);
    }
    Err(Error::invalid("unterminated string"))
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

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(Error::invalid(format!("expected {expected:?}, found {other:?}"))),
        }
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id == word)
    }

    fn expr(&mut self) -> Result<Predicate> {
        let mut any = vec![self.and_expr()?];
        while self.keyword("or") {
            self.pos += 1;
            any.push(self.and_expr()?);
        }
        Ok(if any.len() == 1 {
            any.remove(0)
        } else {
            Predicate::Or { any }
        })
    }

    fn and_expr(&mut self) -> Result<Predicate> {
        let mut all = vec![self.unary()?];
        while self.keyword("and") {
            self.pos += 1;
            all.push(self.unary()?);
        }
        Ok(if all.len() == 1 {
            all.remove(0)
        } else {
            Predicate::And { all }
        })
    }

    fn unary(&mut self) -> Result<Predicate> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(id)) if matches!(self.peek(), Some(Token::LParen)) => {
                self.pos += 1;
                self.call(&id)
            }
            Some(Token::Ident(prop)) => {
                let negate = match self.next() {
                    Some(Token::Eq) => false,
                    Some(Token::Ne) => true,
                    other => {
                        return Err(Error::invalid(format!(
                            "expected comparison after '{prop}', found {other:?}"
                        )));
                    }
                };
                let value = self.value()?;
                Ok(if negate {
                    Predicate::Ne { prop, value }
                } else {
                    Predicate::Eq { prop, value }
                })
            }
            other => Err(Error::invalid(format!("unexpected {other:?} in predicate"))),
        }
    }

    fn call(&mut self, func: &str) -> Result<Predicate> {
        if func == "not" {
            let inner = self.expr()?;
            self.expect(Token::RParen)?;
            return Ok(Predicate::Not {
                inner: Box::new(inner),
            });
        }

        let prop = match self.next() {
            Some(Token::Ident(prop)) => prop,
            other => return Err(Error::invalid(format!("expected property, found {other:?}"))),
        };
        self.expect(Token::Comma)?;
        let value = self.value()?;
        self.expect(Token::RParen)?;

        match func {
            "starts-with" => Ok(Predicate::StartsWith { prop, value }),
            "contains" => Ok(Predicate::Contains { prop, value }),
            other => Err(Error::invalid(format!("unknown function '{other}'"))),
        }
    }

    fn value(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Str(value) | Token::Ident(value)) => Ok(value),
            other => Err(Error::invalid(format!("expected a value, found {other:?}"))),
        }
    }
}
