//! Statement guardrails.
//!
//! Validates candidate SQL before it may reach the database:
//! normalization, statement counting, keyword classification and row-limit
//! enforcement. Everything here is pure and lock-free; the policy is frozen
//! at startup and shared by reference.

pub mod classifier;
pub mod counter;
pub mod limit;
pub mod normalizer;

pub use classifier::{DenyCategory, KeywordClassifier};
pub use limit::{LimitAction, LimitEnforcer, LimitPolicy};
pub use normalizer::CandidateStatement;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::config::GuardrailConfig;
use crate::error::{ClassifiedError, ErrorKind};

/// Immutable whitelist/denylist vocabulary and limits.
#[derive(Debug, Clone)]
pub struct GuardrailPolicy {
    leading_verbs: HashSet<String>,
    denylist: HashSet<String>,
    denied_prefixes: Vec<String>,
    max_statement_length: usize,
    limits: LimitPolicy,
}

impl GuardrailPolicy {
    /// Builds the policy from configuration. All vocabulary is upper-cased.
    pub fn from_config(config: &GuardrailConfig) -> Self {
        let upper = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let mut leading_verbs: HashSet<String> =
            upper(&config.allowed_leading_verbs).into_iter().collect();
        if config.allow_cte {
            leading_verbs.insert("WITH".to_string());
        } else {
            leading_verbs.remove("WITH");
        }

        Self {
            leading_verbs,
            denylist: upper(&config.denylist_keywords).into_iter().collect(),
            denied_prefixes: upper(&config.denied_prefixes),
            max_statement_length: config.max_statement_length,
            limits: LimitPolicy {
                default_limit: config.default_row_limit,
                max_limit: config.max_row_limit,
            },
        }
    }

    pub fn is_leading_verb(&self, word: &str) -> bool {
        self.leading_verbs.contains(word)
    }

    pub fn is_denied(&self, word: &str) -> bool {
        self.denylist.contains(word)
    }

    pub fn has_denied_prefix(&self, word: &str) -> bool {
        self.denied_prefixes.iter().any(|p| word.starts_with(p.as_str()))
    }

    pub fn max_statement_length(&self) -> usize {
        self.max_statement_length
    }

    pub fn limits(&self) -> LimitPolicy {
        self.limits
    }
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self::from_config(&GuardrailConfig::default())
    }
}

/// Why a statement was rejected before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    EmptyOrUnparseable,
    MultipleStatements,
    /// The category is for internal logging only.
    DisallowedOperation(DenyCategory),
}

impl RejectionReason {
    /// The caller-facing kind for this rejection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyOrUnparseable => ErrorKind::EmptyOrUnparseable,
            Self::MultipleStatements => ErrorKind::MultipleStatements,
            Self::DisallowedOperation(_) => ErrorKind::DisallowedOperation,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOrUnparseable => write!(f, "empty or unparseable"),
            Self::MultipleStatements => write!(f, "multiple statements"),
            Self::DisallowedOperation(category) => write!(f, "disallowed operation ({category})"),
        }
    }
}

impl From<RejectionReason> for ClassifiedError {
    fn from(reason: RejectionReason) -> Self {
        ClassifiedError::new(reason.kind())
    }
}

/// A statement that passed every guardrail, with its enforced LIMIT.
///
/// Only the validation pipeline can construct one, so holding a value is
/// proof the statement was accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenStatement {
    original: String,
    sql: String,
    applied_limit: u64,
    limit_action: LimitAction,
}

impl RewrittenStatement {
    pub(crate) fn new(
        original: String,
        sql: String,
        applied_limit: u64,
        limit_action: LimitAction,
    ) -> Self {
        Self {
            original,
            sql,
            applied_limit,
            limit_action,
        }
    }

    /// Input text as received.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Canonical text sent to the database.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Row limit carried by the executed statement.
    pub fn applied_limit(&self) -> u64 {
        self.applied_limit
    }

    pub fn limit_action(&self) -> LimitAction {
        self.limit_action
    }
}

/// Outcome of validating one candidate statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Accepted(RewrittenStatement),
    Rejected(RejectionReason),
}

impl ValidationVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn into_result(self) -> Result<RewrittenStatement, RejectionReason> {
        match self {
            Self::Accepted(stmt) => Ok(stmt),
            Self::Rejected(reason) => Err(reason),
        }
    }
}

impl From<Result<RewrittenStatement, RejectionReason>> for ValidationVerdict {
    fn from(result: Result<RewrittenStatement, RejectionReason>) -> Self {
        match result {
            Ok(stmt) => Self::Accepted(stmt),
            Err(reason) => Self::Rejected(reason),
        }
    }
}

/// The validation pipeline: normalize, count, classify, bound.
#[derive(Debug, Clone)]
pub struct Guardrail {
    policy: Arc<GuardrailPolicy>,
}

impl Default for Guardrail {
    fn default() -> Self {
        Self::new(Arc::new(GuardrailPolicy::default()))
    }
}

impl Guardrail {
    pub fn new(policy: Arc<GuardrailPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GuardrailPolicy {
        &self.policy
    }

    /// Validates raw SQL and produces the statement to execute.
    pub fn validate(&self, raw_sql: &str) -> ValidationVerdict {
        self.run(raw_sql).into()
    }

    fn run(&self, raw_sql: &str) -> Result<RewrittenStatement, RejectionReason> {
        if raw_sql.chars().count() > self.policy.max_statement_length() {
            return Err(RejectionReason::DisallowedOperation(DenyCategory::Oversized));
        }

        let stmt = CandidateStatement::new(raw_sql);
        if stmt.is_blank() {
            return Err(RejectionReason::EmptyOrUnparseable);
        }

        counter::check_single_statement(&stmt)?;
        KeywordClassifier::new(&self.policy).classify(&stmt)?;
        let rewritten = LimitEnforcer::new(self.policy.limits()).enforce(&stmt)?;

        // The executed text must lex back to itself; anything else means the
        // rendering changed meaning and the statement is not trusted.
        let relexed = CandidateStatement::new(rewritten.sql());
        if relexed.canonical() != rewritten.sql() {
            return Err(RejectionReason::EmptyOrUnparseable);
        }

        Ok(rewritten)
    }
}

/// Validates SQL with the default policy.
pub fn validate_sql(raw_sql: &str) -> ValidationVerdict {
    Guardrail::default().validate(raw_sql)
}
