//! Character-level scanning of patterns.
//!
//! Two passes run before any parsing happens:
//!
//! 1. [`check_balanced`] rejects unmatched brackets and unterminated strings.
//! 2. [`tokenize`] splits the pattern into grouping, connective and word
//!    tokens. Inside a quoted literal none of `[()]=<>` or whitespace act as
//!    delimiters.

use crate::error::{PatternError, Result};

/// Characters that delimit words outside of string literals.
const SPECIAL_CHARS: &[char] = &['[', '(', ')', ']', '=', '<', '>'];
const STRING_CHARS: &[char] = &['\'', '"'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `[` or `(`
    Open,
    /// `]` or `)`
    Close,
    And,
    Or,
    /// Field path, operator fragment or literal.
    Word(String),
}

/// Tracks whether the scanner is inside a quoted literal.
#[derive(Debug, Default)]
struct StringState {
    quote: Option<char>,
    escaped: bool,
}

impl StringState {
    /// Feeds one character; returns true while the character belongs to a
    /// string literal (including its quotes).
    fn step(&mut self, c: char) -> bool {
        match self.quote {
            Some(q) => {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.quote = None;
                }
                true
            }
            None if STRING_CHARS.contains(&c) => {
                self.quote = Some(c);
                true
            }
            None => false,
        }
    }

    fn is_open(&self) -> bool {
        self.quote.is_some()
    }
}

/// Validates bracket and quote balance.
///
/// `[` must be closed by `]` and `(` by `)`; brackets inside string literals
/// are ignored.
pub fn check_balanced(pattern: &str) -> Result<()> {
    let mut strings = StringState::default();
    let mut stack: Vec<char> = Vec::new();

    for (offset, c) in pattern.char_indices() {
        if strings.step(c) {
            continue;
        }
        match c {
            '[' | '(' => stack.push(c),
            ']' | ')' => {
                let expected = if c == ']' { '[' } else { '(' };
                match stack.pop() {
                    Some(open) if open == expected => {}
                    _ => {
                        return Err(PatternError::malformed(format!(
                            "unmatched `{c}` at offset {offset}"
                        )))
                    }
                }
            }
            _ => {}
        }
    }

    if strings.is_open() {
        return Err(PatternError::malformed("unterminated string literal"));
    }
    if let Some(open) = stack.last() {
        return Err(PatternError::malformed(format!("unclosed `{open}`")));
    }
    Ok(())
}

/// Splits a pattern into tokens.
///
/// `=`, `<` and `>` are emitted as standalone words so that `<=` arrives as
/// two words; the parser joins them back.
pub fn tokenize(pattern: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut strings = StringState::default();

    fn flush(word: &mut String, tokens: &mut Vec<Token>) {
        if word.is_empty() {
            return;
        }
        let token = match word.as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            _ => Token::Word(word.clone()),
        };
        tokens.push(token);
        word.clear();
    }

    for c in pattern.chars() {
        if strings.step(c) {
            word.push(c);
            continue;
        }
        if c.is_whitespace() {
            flush(&mut word, &mut tokens);
        } else if SPECIAL_CHARS.contains(&c) {
            flush(&mut word, &mut tokens);
            tokens.push(match c {
                '[' | '(' => Token::Open,
                ']' | ')' => Token::Close,
                _ => Token::Word(c.to_string()),
            });
        } else {
            word.push(c);
        }
    }
    flush(&mut word, &mut tokens);
    tokens
}

/// Returns true when a word is a field path (`type:field...`).
pub(crate) fn is_field_word(word: &str) -> bool {
    word.contains(':') && !word.starts_with(STRING_CHARS)
}

/// Infers the single object type referenced by the pattern's field paths.
pub fn infer_type(tokens: &[Token]) -> Result<String> {
    let mut found: Option<String> = None;
    for token in tokens {
        let Token::Word(word) = token else { continue };
        if !is_field_word(word) {
            continue;
        }
        let stix_type = word.split(':').next().unwrap_or_default();
        if stix_type.is_empty() {
            return Err(PatternError::malformed(format!(
                "field path `{word}` has no type"
            )));
        }
        match &found {
            None => found = Some(stix_type.to_string()),
            Some(first) if first != stix_type => {
                return Err(PatternError::PatternAlreadyContainsType {
                    first: first.clone(),
                    second: stix_type.to_string(),
                })
            }
            Some(_) => {}
        }
    }
    found.ok_or(PatternError::UntypedPattern)
}
