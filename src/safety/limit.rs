//! Row-limit enforcement.
//!
//! Guarantees every accepted statement carries a top-level `LIMIT` no larger
//! than the configured maximum. Only LIMIT clauses at parenthesis depth zero
//! belong to the outermost statement; limits inside subqueries and CTE
//! bodies are left alone.

use sqlparser::tokenizer::{Token, Whitespace};

use super::classifier::DenyCategory;
use super::normalizer::{bare_word, is_space, render, CandidateStatement};
use super::{RejectionReason, RewrittenStatement};

/// Default and maximum row limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub default_limit: u64,
    pub max_limit: u64,
}

/// What the enforcer did to the statement's LIMIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAction {
    /// No top-level LIMIT was present; the default was appended.
    Appended,
    /// A LIMIT above the maximum was lowered.
    Clamped { requested: u64 },
    /// The existing LIMIT was within bounds.
    Unchanged,
}

/// Appends or clamps the top-level LIMIT of accepted statements.
#[derive(Debug, Clone, Copy)]
pub struct LimitEnforcer {
    policy: LimitPolicy,
}

impl LimitEnforcer {
    pub fn new(policy: LimitPolicy) -> Self {
        Self { policy }
    }

    /// Produces the statement that will actually be executed.
    pub fn enforce(&self, stmt: &CandidateStatement) -> Result<RewrittenStatement, RejectionReason> {
        let mut tokens = without_terminator(stmt.tokens());

        let limits: Vec<usize> = top_level_limits(&tokens);
        let (applied, action) = if limits.is_empty() {
            tokens.push(Token::Whitespace(Whitespace::Space));
            tokens.push(Token::make_keyword("LIMIT"));
            tokens.push(Token::Whitespace(Whitespace::Space));
            tokens.push(number(self.policy.default_limit));
            (self.policy.default_limit, LimitAction::Appended)
        } else {
            let mut applied = 0;
            let mut action = LimitAction::Unchanged;
            for at in limits {
                let (count_at, requested) = locate_row_count(&tokens, at)?;
                if requested > self.policy.max_limit {
                    tokens[count_at] = number(self.policy.max_limit);
                    applied = self.policy.max_limit;
                    action = LimitAction::Clamped { requested };
                } else {
                    applied = requested;
                }
            }
            (applied, action)
        };

        Ok(RewrittenStatement::new(
            stmt.raw().to_string(),
            render(&tokens),
            applied,
            action,
        ))
    }
}

fn number(value: u64) -> Token {
    Token::Number(value.to_string(), false)
}

/// Drops a single trailing `;` and any whitespace around it.
fn without_terminator(tokens: &[Token]) -> Vec<Token> {
    let mut out = tokens.to_vec();
    while out.last().is_some_and(|t| is_space(t) || matches!(t, Token::SemiColon)) {
        out.pop();
    }
    out
}

/// Indices of LIMIT keywords at parenthesis depth zero.
fn top_level_limits(tokens: &[Token]) -> Vec<usize> {
    let mut depth: usize = 0;
    let mut found = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            _ if depth == 0 && bare_word(token).as_deref() == Some("LIMIT") => found.push(i),
            _ => {}
        }
    }
    found
}

/// Finds the token holding the row count of the LIMIT at `limit_at`.
///
/// Accepts `LIMIT n`, `LIMIT n OFFSET m` and SQLite's `LIMIT m, n`.
/// Anything else (parameters, expressions, negative values) cannot be
/// bounded and is refused.
fn locate_row_count(tokens: &[Token], limit_at: usize) -> Result<(usize, u64), RejectionReason> {
    let unbounded = || RejectionReason::DisallowedOperation(DenyCategory::UnboundedLimit);

    let mut rest = tokens
        .iter()
        .enumerate()
        .skip(limit_at + 1)
        .filter(|(_, t)| !is_space(t));

    let (first_at, first) = rest.next().ok_or_else(unbounded)?;
    let first_value = integer(first).ok_or_else(unbounded)?;

    match rest.next() {
        None => Ok((first_at, first_value)),
        Some((_, Token::Comma)) => {
            let (count_at, count) = rest.next().ok_or_else(unbounded)?;
            let count_value = integer(count).ok_or_else(unbounded)?;
            if rest.next().is_some() {
                return Err(unbounded());
            }
            Ok((count_at, count_value))
        }
        Some((_, next)) if bare_word(next).as_deref() == Some("OFFSET") => {
            Ok((first_at, first_value))
        }
        Some(_) => Err(unbounded()),
    }
}

fn integer(token: &Token) -> Option<u64> {
    match token {
        Token::Number(text, false) => text.parse().ok(),
        _ => None,
    }
}
