//! Statement counting.
//!
//! Splits the canonical token stream on `;`. The tokenizer has already
//! folded quoted strings and identifiers into single tokens, so separators
//! inside literals never show up here.

use sqlparser::tokenizer::Token;

use super::normalizer::{is_space, CandidateStatement};
use super::RejectionReason;

/// Splits tokens into statement segments on every separator token.
pub fn segments(tokens: &[Token]) -> Vec<&[Token]> {
    tokens
        .split(|t| matches!(t, Token::SemiColon))
        .collect()
}

/// Number of segments that contain anything other than whitespace.
pub fn count_statements(stmt: &CandidateStatement) -> usize {
    segments(stmt.tokens())
        .into_iter()
        .filter(|segment| segment.iter().any(|t| !is_space(t)))
        .count()
}

/// Rejects input that chains more than one statement.
pub fn check_single_statement(stmt: &CandidateStatement) -> Result<(), RejectionReason> {
    if count_statements(stmt) > 1 {
        return Err(RejectionReason::MultipleStatements);
    }
    Ok(())
}
