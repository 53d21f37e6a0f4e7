//! Keyword and operation classification.
//!
//! Three independent gates, all evaluated on every statement: the
//! leading-verb whitelist, the keyword denylist scan, and the separator
//! placement check. A pass from one gate never skips another.

use sqlparser::tokenizer::Token;
use std::fmt;

use super::normalizer::{bare_word, CandidateStatement};
use super::{GuardrailPolicy, RejectionReason};

/// Verbs that can open the main statement of a `WITH` query.
const STATEMENT_VERBS: &[&str] = &["SELECT", "VALUES", "INSERT", "UPDATE", "DELETE", "REPLACE"];

/// Why a statement was refused as a disallowed operation.
///
/// Recorded in logs only; callers see the generic kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyCategory {
    /// First token is not a whitelisted verb.
    LeadingVerb,
    /// `WITH` prefix whose main statement is not a SELECT.
    CteBody,
    /// Data modification (INSERT, UPDATE, DELETE, ...).
    Mutation,
    /// Schema change (CREATE, DROP, ALTER, ...).
    Schema,
    /// Database administration (PRAGMA, ATTACH, VACUUM, GRANT, ...).
    Administrative,
    /// Transaction control (BEGIN, COMMIT, ROLLBACK, ...).
    TransactionControl,
    /// Procedure invocation (EXEC, CALL, sp_/xp_ names).
    Procedure,
    /// Extension loading.
    Extension,
    /// Operator-configured keyword without a built-in category.
    Custom,
    /// Separator somewhere other than a single trailing terminator.
    Separator,
    /// Input longer than the configured maximum.
    Oversized,
    /// Top-level LIMIT that is not a plain integer literal.
    UnboundedLimit,
}

impl DenyCategory {
    /// Maps a denylisted keyword to its category.
    pub fn for_keyword(keyword: &str) -> Self {
        match keyword {
            "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" | "UPSERT" | "COPY"
            | "TRUNCATE" => Self::Mutation,
            "DROP" | "ALTER" | "CREATE" | "REINDEX" => Self::Schema,
            "ATTACH" | "DETACH" | "PRAGMA" | "VACUUM" | "GRANT" | "REVOKE" | "ANALYZE" => {
                Self::Administrative
            }
            "BEGIN" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" => Self::TransactionControl,
            "EXEC" | "EXECUTE" | "CALL" => Self::Procedure,
            "LOAD_EXTENSION" => Self::Extension,
            _ => Self::Custom,
        }
    }
}

impl fmt::Display for DenyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LeadingVerb => "leading verb",
            Self::CteBody => "CTE body",
            Self::Mutation => "mutation",
            Self::Schema => "schema change",
            Self::Administrative => "administrative",
            Self::TransactionControl => "transaction control",
            Self::Procedure => "procedure call",
            Self::Extension => "extension loading",
            Self::Custom => "custom denylist",
            Self::Separator => "statement separator",
            Self::Oversized => "oversized input",
            Self::UnboundedLimit => "unbounded limit",
        };
        f.write_str(name)
    }
}

/// Classifies statements against a frozen policy.
#[derive(Debug, Clone, Copy)]
pub struct KeywordClassifier<'a> {
    policy: &'a GuardrailPolicy,
}

impl<'a> KeywordClassifier<'a> {
    pub fn new(policy: &'a GuardrailPolicy) -> Self {
        Self { policy }
    }

    /// Runs every gate and reports the first failure.
    ///
    /// Denylist findings take precedence so logs name the most specific
    /// category.
    pub fn classify(&self, stmt: &CandidateStatement) -> Result<(), RejectionReason> {
        if stmt.is_blank() {
            return Err(RejectionReason::EmptyOrUnparseable);
        }

        let denylist = self.scan_denylist(stmt);
        let leading = self.check_leading_verb(stmt);
        let separators = check_separators(stmt);

        denylist.and(leading).and(separators)
    }

    /// Leading token must be a whitelisted verb; a `WITH` lead must resolve
    /// to a SELECT main statement.
    fn check_leading_verb(&self, stmt: &CandidateStatement) -> Result<(), RejectionReason> {
        let disallowed = |category| Err(RejectionReason::DisallowedOperation(category));

        let Some(first) = stmt.significant().next().and_then(bare_word) else {
            return disallowed(DenyCategory::LeadingVerb);
        };
        if !self.policy.is_leading_verb(&first) {
            return disallowed(DenyCategory::LeadingVerb);
        }
        if first == "WITH" && main_verb_after_with(stmt.tokens()).as_deref() != Some("SELECT") {
            return disallowed(DenyCategory::CteBody);
        }
        Ok(())
    }

    /// Every bare word is checked, inside subqueries and CTEs included.
    fn scan_denylist(&self, stmt: &CandidateStatement) -> Result<(), RejectionReason> {
        for word in stmt.words() {
            if self.policy.is_denied(&word) {
                return Err(RejectionReason::DisallowedOperation(
                    DenyCategory::for_keyword(&word),
                ));
            }
            if self.policy.has_denied_prefix(&word) {
                return Err(RejectionReason::DisallowedOperation(DenyCategory::Procedure));
            }
        }
        Ok(())
    }
}

/// Allows at most one separator, and only as the final token.
fn check_separators(stmt: &CandidateStatement) -> Result<(), RejectionReason> {
    let significant: Vec<&Token> = stmt.significant().collect();
    let separators = significant
        .iter()
        .filter(|t| matches!(t, Token::SemiColon))
        .count();

    let trailing = matches!(significant.last(), Some(Token::SemiColon));
    if separators == 0 || (separators == 1 && trailing) {
        Ok(())
    } else {
        Err(RejectionReason::DisallowedOperation(DenyCategory::Separator))
    }
}

/// Finds the first statement verb at parenthesis depth zero after the
/// leading `WITH`. CTE bodies are always parenthesized, so this skips them.
fn main_verb_after_with(tokens: &[Token]) -> Option<String> {
    let mut depth: usize = 0;
    let mut seen_with = false;
    for token in tokens {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth = depth.saturating_sub(1),
            _ if depth == 0 => {
                if let Some(word) = bare_word(token) {
                    if !seen_with {
                        seen_with = true;
                        continue;
                    }
                    if STATEMENT_VERBS.contains(&word.as_str()) {
                        return Some(word);
                    }
                }
            }
            _ => {}
        }
    }
    None
}
