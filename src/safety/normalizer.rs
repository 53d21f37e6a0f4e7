//! Statement normalization.
//!
//! Lexes raw SQL with sqlparser's tokenizer and produces the canonical token
//! stream every later check works on: comments removed, whitespace collapsed,
//! original casing kept. The canonical text is also what gets executed, so
//! anything the lexer saw as a comment can never reach the database.

use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

/// A candidate statement and its canonical form.
///
/// Immutable once constructed; built per request and dropped after
/// validation.
#[derive(Debug, Clone)]
pub struct CandidateStatement {
    raw: String,
    tokens: Vec<Token>,
    canonical: String,
    folded: String,
    lexed: bool,
}

impl CandidateStatement {
    /// Normalizes raw input. Never fails: input the lexer cannot handle
    /// produces an empty canonical form.
    pub fn new(raw: &str) -> Self {
        let dialect = SQLiteDialect {};
        let lexed = Tokenizer::new(&dialect, raw).with_unescape(false).tokenize();

        let (tokens, lexed) = match lexed {
            Ok(tokens) => (collapse(tokens), true),
            Err(e) => {
                debug!("Tokenizer rejected input: {}", e);
                (Vec::new(), false)
            }
        };

        let canonical = render(&tokens);
        let folded = canonical.to_lowercase();

        Self {
            raw: raw.to_string(),
            tokens,
            canonical,
            folded,
            lexed,
        }
    }

    /// The input exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Comment-free, whitespace-collapsed text in original casing.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Case-folded copy of the canonical text.
    pub fn folded(&self) -> &str {
        &self.folded
    }

    /// Canonical token stream. Whitespace appears only as single spaces.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Returns false if the lexer could not make sense of the input
    /// (unterminated literal, identifier or block comment).
    pub fn is_lexed(&self) -> bool {
        self.lexed
    }

    /// True when nothing but whitespace, comments or separators remain.
    pub fn is_blank(&self) -> bool {
        !self.lexed
            || self
                .significant()
                .all(|t| matches!(t, Token::SemiColon | Token::EOF))
    }

    /// Tokens that are not whitespace.
    pub fn significant(&self) -> impl Iterator<Item = &Token> + '_ {
        self.tokens.iter().filter(|t| !is_space(t))
    }

    /// Upper-cased bare words, in order. Quoted identifiers and literals
    /// are never keywords and are skipped.
    pub fn words(&self) -> impl Iterator<Item = String> + '_ {
        self.tokens.iter().filter_map(bare_word)
    }
}

/// Returns the upper-cased value of an unquoted word token.
pub(crate) fn bare_word(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_ascii_uppercase()),
        _ => None,
    }
}

pub(crate) fn is_space(token: &Token) -> bool {
    matches!(token, Token::Whitespace(_))
}

/// Replaces every whitespace or comment run with one space and trims both ends.
fn collapse(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Whitespace(_) => {
                if out.last().is_some_and(|t| !is_space(t)) {
                    out.push(Token::Whitespace(sqlparser::tokenizer::Whitespace::Space));
                }
            }
            Token::EOF => {}
            other => out.push(other),
        }
    }
    while out.last().is_some_and(is_space) {
        out.pop();
    }
    out
}

/// Renders tokens back to SQL text.
///
/// Quoted identifiers are re-escaped by hand: the tokenizer folds doubled
/// closing quotes, and writing them back unescaped would let an identifier
/// close early.
pub(crate) fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Word(w) => match w.quote_style {
                Some(open) => {
                    let close = closing_quote(open);
                    out.push(open);
                    for c in w.value.chars() {
                        if c == close {
                            out.push(close);
                        }
                        out.push(c);
                    }
                    out.push(close);
                }
                None => out.push_str(&w.value),
            },
            other => out.push_str(&other.to_string()),
        }
    }
    out
}

fn closing_quote(open: char) -> char {
    match open {
        '[' => ']',
        other => other,
    }
}
