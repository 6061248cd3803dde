//! Rule conditions
//!
//! Conditions are a closed vocabulary, parsed once into a typed predicate:
//!
//! ```text
//! action == "delete"
//! resource.type == "user" && actor.id != "admin"
//! time.hour >= 18
//! rate_limit(100, 60)
//! true
//! ```
//!
//! Supported fields are `action`, `resource.type`, `resource.id`,
//! `actor.id` and `actor.type` (string equality), `time.hour` (numeric
//! comparison, UTC), and the `rate_limit(limit, window_secs)` predicate
//! backed by the external cache. Clauses combine with `&&` only.

use crate::cache::Cache;
use crate::error::{validation_error, Result};
use crate::models::{Actor, ResourceRef};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Action,
    ResourceType,
    ResourceId,
    ActorId,
    ActorType,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "action" => Some(Field::Action),
            "resource.type" => Some(Field::ResourceType),
            "resource.id" => Some(Field::ResourceId),
            "actor.id" => Some(Field::ActorId),
            "actor.type" => Some(Field::ActorType),
            _ => None,
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

impl CmpOp {
    fn compare(self, left: u32, right: u32) -> bool {
        match self {
            CmpOp::Eq => left == right,
            CmpOp::Ne => left != right,
            CmpOp::Lt => left < right,
            CmpOp::Le => left <= right,
            CmpOp::Gt => left > right,
            CmpOp::Ge => left >= right,
        }
    }
}

/// A single predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Literal(bool),
    Equals {
        field: Field,
        value: String,
        negated: bool,
    },
    HourOfDay {
        op: CmpOp,
        hour: u32,
    },
    /// Matches once the actor exceeds `limit` evaluations in the window
    RateLimit {
        limit: u64,
        window_secs: u64,
    },
}

/// Conjunction of predicates
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    All(Vec<Predicate>),
    /// Loaded from storage but no longer parses; never matches
    Unrecognized(String),
}

/// What a condition is evaluated against
pub struct ConditionInput<'a> {
    pub actor: &'a Actor,
    pub action: &'a str,
    pub resource: &'a ResourceRef,
    pub hour: u32,
    /// Namespaces rate-limit counters, e.g. `policy:{id}:{rule}`
    pub counter_scope: String,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(validation_error("Condition is empty"));
        }

        let mut predicates = Vec::new();
        for clause in tokens.split(|t| *t == Token::And) {
            predicates.push(parse_predicate(clause, source)?);
        }
        Ok(Condition::All(predicates))
    }

    /// Parse, degrading malformed input to a condition that never matches
    pub fn parse_lenient(source: &str) -> Self {
        Self::parse(source).unwrap_or_else(|e| {
            warn!("Unrecognized condition '{}': {}", source, e);
            Condition::Unrecognized(source.to_string())
        })
    }

    pub async fn matches(&self, input: &ConditionInput<'_>, cache: Option<&dyn Cache>) -> bool {
        let predicates = match self {
            Condition::All(predicates) => predicates,
            Condition::Unrecognized(_) => return false,
        };

        for predicate in predicates {
            if !predicate.matches(input, cache).await {
                return false;
            }
        }
        true
    }
}

impl Predicate {
    async fn matches(&self, input: &ConditionInput<'_>, cache: Option<&dyn Cache>) -> bool {
        match self {
            Predicate::Literal(value) => *value,
            Predicate::Equals {
                field,
                value,
                negated,
            } => {
                let actual = match field {
                    Field::Action => Some(input.action),
                    Field::ResourceType => Some(input.resource.resource_type.as_str()),
                    Field::ResourceId => input.resource.id.as_deref(),
                    Field::ActorId => Some(input.actor.id.as_str()),
                    Field::ActorType => Some(input.actor.actor_type.as_str()),
                };
                (actual == Some(value.as_str())) != *negated
            }
            Predicate::HourOfDay { op, hour } => op.compare(input.hour, *hour),
            Predicate::RateLimit { limit, window_secs } => {
                let Some(cache) = cache else {
                    return false;
                };
                let key = format!("ratelimit:{}:{}", input.counter_scope, input.actor.id);
                match cache
                    .incr_with_ttl(&key, Duration::from_secs(*window_secs))
                    .await
                {
                    Ok(count) => count > *limit,
                    Err(e) => {
                        // Cache outage means no signal, not a denial.
                        warn!("Rate-limit counter unavailable for '{}': {}", key, e);
                        false
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(u64),
    Op(CmpOp),
    And,
    LParen,
    RParen,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => literal.push(ch),
                        None => return Err(validation_error("Unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let n = digits
                    .parse()
                    .map_err(|_| validation_error(format!("Number out of range: {}", digits)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_' || d == '.') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
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
            '&' | '=' | '!' | '<' | '>' => {
                chars.next();
                let next_eq = chars.peek() == Some(&'=');
                let token = match (c, next_eq) {
                    ('&', _) if chars.peek() == Some(&'&') => Token::And,
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    _ => return Err(validation_error(format!("Unexpected operator '{}'", c))),
                };
                // Two-character operators consume their second char.
                if matches!(token, Token::And) || next_eq {
                    chars.next();
                }
                tokens.push(token);
            }
            other => {
                return Err(validation_error(format!(
                    "Unexpected character '{}'",
                    other
                )))
            }
        }
    }

    Ok(tokens)
}

fn parse_predicate(clause: &[Token], source: &str) -> Result<Predicate> {
    let malformed = || validation_error(format!("Malformed condition: '{}'", source));

    match clause {
        [Token::Ident(word)] if word == "true" => Ok(Predicate::Literal(true)),
        [Token::Ident(word)] if word == "false" => Ok(Predicate::Literal(false)),
        [Token::Ident(func), Token::LParen, Token::Num(limit), Token::Comma, Token::Num(window), Token::RParen]
            if func == "rate_limit" =>
        {
            if *window == 0 {
                return Err(validation_error("rate_limit window must be positive"));
            }
            Ok(Predicate::RateLimit {
                limit: *limit,
                window_secs: *window,
            })
        }
        [Token::Ident(field), Token::Op(op), Token::Num(hour)] if field == "time.hour" => {
            let hour = u32::try_from(*hour).ok().filter(|h| *h < 24).ok_or_else(|| {
                validation_error(format!("time.hour must be between 0 and 23, got {}", hour))
            })?;
            Ok(Predicate::HourOfDay { op: *op, hour })
        }
        [Token::Ident(field), Token::Op(op), Token::Str(value)] => {
            let field = Field::parse(field)
                .ok_or_else(|| validation_error(format!("Unknown condition field '{}'", field)))?;
            let negated = match op {
                CmpOp::Eq => false,
                CmpOp::Ne => true,
                _ => {
                    return Err(validation_error(
                        "String fields only support == and != comparisons",
                    ))
                }
            };
            Ok(Predicate::Equals {
                field,
                value: value.clone(),
                negated,
            })
        }
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use pretty_assertions::assert_eq;

    fn input<'a>(actor: &'a Actor, action: &'a str, resource: &'a ResourceRef) -> ConditionInput<'a> {
        ConditionInput {
            actor,
            action,
            resource,
            hour: 14,
            counter_scope: "policy:test:r1".to_string(),
        }
    }

    #[test]
    fn test_parse_conjunction() {
        let condition = Condition::parse(r#"resource.type == "user" && actor.id != 'admin'"#).unwrap();
        assert_eq!(
            condition,
            Condition::All(vec![
                Predicate::Equals {
                    field: Field::ResourceType,
                    value: "user".to_string(),
                    negated: false,
                },
                Predicate::Equals {
                    field: Field::ActorId,
                    value: "admin".to_string(),
                    negated: true,
                },
            ])
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for source in [
            "",
            "action ==",
            "action = \"x\"",
            "resource.owner == \"x\"",
            "time.hour >= 25",
            "action > \"a\"",
            "rate_limit(10)",
            "eval(\"rm -rf\")",
            "action == \"unterminated",
        ] {
            assert!(Condition::parse(source).is_err(), "should reject: {}", source);
        }
    }

    #[test]
    fn test_lenient_parse_never_matches() {
        let condition = Condition::parse_lenient("user.role in ['admin']");
        assert!(matches!(condition, Condition::Unrecognized(_)));
    }

    #[tokio::test]
    async fn test_equality_and_time() {
        let actor = Actor::user("alice");
        let resource = ResourceRef::new("user", Some("u-9".to_string()));
        let input = input(&actor, "delete", &resource);

        let cases = [
            ("action == \"delete\"", true),
            ("action == \"read\"", false),
            ("resource.id == \"u-9\" && actor.type == \"user\"", true),
            ("time.hour >= 9 && time.hour < 17", true),
            ("time.hour > 17", false),
            ("true && false", false),
        ];
        for (source, expected) in cases {
            let condition = Condition::parse(source).unwrap();
            assert_eq!(condition.matches(&input, None).await, expected, "{}", source);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_predicate() {
        let cache = MemoryCache::new();
        let actor = Actor::user("alice");
        let resource = ResourceRef::new("api", None);
        let input = input(&actor, "call", &resource);
        let condition = Condition::parse("rate_limit(2, 60)").unwrap();

        assert!(!condition.matches(&input, Some(&cache)).await);
        assert!(!condition.matches(&input, Some(&cache)).await);
        assert!(condition.matches(&input, Some(&cache)).await);
    }

    #[tokio::test]
    async fn test_rate_limit_without_cache_is_no_match() {
        let actor = Actor::user("alice");
        let resource = ResourceRef::new("api", None);
        let condition = Condition::parse("rate_limit(0, 60)").unwrap();
        assert!(!condition.matches(&input(&actor, "call", &resource), None).await);
    }
}
