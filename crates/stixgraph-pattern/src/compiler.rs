//! Pattern parsing and compilation.
//!
//! ```text
//! pattern ──► check_balanced ──► tokenize ──► infer_type
//!                                    │
//!                                    ▼
//!                            ParsedPattern (Expr tree of Clauses)
//!                                    │  resolver ─► modifier ─► generic
//!                                    ▼
//!                            CompiledPattern (Filter + type conjunct)
//! ```
//!
//! Parsing and compiling are separate steps so that a caller can look at
//! the clauses first (to answer some of them from a mirror) and hand the
//! answers back through a [`ClauseResolver`].

use crate::ast::{Clause, CompareOp, Filter, Literal};
use crate::cosmetic;
use crate::error::{PatternError, Result};
use crate::lexer::{self, Token};
use crate::modifier::ModifierRegistry;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{char as nom_char, one_of};
use nom::combinator::{all_consuming, value};
use nom::multi::separated_list1;
use nom::number::complete::recognize_float;
use nom::sequence::separated_pair;
use nom::IResult;

// ============================================================================
// Expression tree
// ============================================================================

/// Boolean structure of a parsed pattern, before clause compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Clause(Clause),
    Group(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn group(inner: Expr) -> Self {
        match inner {
            Expr::Group(_) => inner,
            other => Expr::Group(Box::new(other)),
        }
    }

    fn and(mut terms: Vec<Expr>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        }
    }

    fn or(mut terms: Vec<Expr>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        }
    }

    fn collect_clauses<'a>(&'a self, out: &mut Vec<&'a Clause>) {
        match self {
            Expr::Clause(clause) => out.push(clause),
            Expr::Group(inner) => inner.collect_clauses(out),
            Expr::And(terms) | Expr::Or(terms) => {
                for term in terms {
                    term.collect_clauses(out);
                }
            }
        }
    }
}

// ============================================================================
// Resolution seam
// ============================================================================

/// Supplies a precomputed filter for a clause, bypassing modifiers and the
/// generic translation.
pub trait ClauseResolver {
    fn resolve(&self, clause: &Clause) -> Option<Filter>;
}

/// Resolves nothing.
pub struct NoResolver;

impl ClauseResolver for NoResolver {
    fn resolve(&self, _clause: &Clause) -> Option<Filter> {
        None
    }
}

// ============================================================================
// Parsed and compiled patterns
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPattern {
    stix_type: String,
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPattern {
    pub stix_type: String,
    /// User filter with the trailing type restriction.
    pub filter: Filter,
}

impl CompiledPattern {
    /// AQL filter expression over `var`.
    pub fn to_aql(&self, var: &str) -> String {
        cosmetic::tidy(&self.filter.to_aql(var))
    }
}

/// Type-only compilation: the single object type the pattern selects.
pub fn compile_type(pattern: &str) -> Result<String> {
    lexer::check_balanced(pattern)?;
    lexer::infer_type(&lexer::tokenize(pattern))
}

/// Parses and compiles in one step, with no resolver.
pub fn compile(pattern: &str, modifiers: &ModifierRegistry) -> Result<CompiledPattern> {
    ParsedPattern::parse(pattern)?.compile(modifiers, &NoResolver)
}

impl ParsedPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        lexer::check_balanced(pattern)?;
        let tokens = lexer::tokenize(pattern);
        let stix_type = lexer::infer_type(&tokens)?;

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(PatternError::malformed("unexpected closing bracket"));
        }
        Ok(Self { stix_type, root })
    }

    pub fn stix_type(&self) -> &str {
        &self.stix_type
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Every clause, in pattern order.
    pub fn clauses(&self) -> Vec<&Clause> {
        let mut out = Vec::new();
        self.root.collect_clauses(&mut out);
        out
    }

    pub fn compile(
        &self,
        modifiers: &ModifierRegistry,
        resolver: &dyn ClauseResolver,
    ) -> Result<CompiledPattern> {
        let user = compile_expr(&self.root, modifiers, resolver)?;
        let user = match user {
            Filter::Or(_) => Filter::group(user),
            other => other,
        };
        let restriction = Filter::comparison(
            &["type"],
            CompareOp::Eq,
            Literal::string(&self.stix_type),
        );
        let compiled = CompiledPattern {
            stix_type: self.stix_type.clone(),
            filter: Filter::And(vec![user, restriction]),
        };
        tracing::trace!(stix_type = %compiled.stix_type, aql = %compiled.to_aql("record"), "compiled pattern");
        Ok(compiled)
    }
}

/// One clause through its type's modifier, or the generic translation.
pub fn compile_clause(clause: &Clause, modifiers: &ModifierRegistry) -> Result<Filter> {
    if let Some(modifier) = modifiers.lookup(&clause.stix_type) {
        if let Some(filter) = modifier.compile(clause)? {
            return Ok(filter);
        }
    }
    Ok(Filter::Comparison(clause.to_comparison()))
}

fn compile_expr(
    expr: &Expr,
    modifiers: &ModifierRegistry,
    resolver: &dyn ClauseResolver,
) -> Result<Filter> {
    match expr {
        Expr::Clause(clause) => match resolver.resolve(clause) {
            Some(filter) => Ok(filter),
            None => compile_clause(clause, modifiers),
        },
        Expr::Group(inner) => Ok(Filter::group(compile_expr(inner, modifiers, resolver)?)),
        Expr::And(terms) => Ok(Filter::and(
            terms
                .iter()
                .map(|t| compile_expr(t, modifiers, resolver))
                .collect::<Result<_>>()?,
        )),
        Expr::Or(terms) => Ok(Filter::or(
            terms
                .iter()
                .map(|t| compile_expr(t, modifiers, resolver))
                .collect::<Result<_>>()?,
        )),
    }
}

// ============================================================================
// Token parser
// ============================================================================

/// `AND` binds tighter than `OR`, as in AQL.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut alternatives = Vec::new();
        let mut conjuncts = vec![self.term()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    conjuncts.push(self.term()?);
                }
                Some(Token::Or) => {
                    self.pos += 1;
                    alternatives.push(Expr::and(std::mem::take(&mut conjuncts)));
                    conjuncts.push(self.term()?);
                }
                Some(Token::Close) | None => break,
                Some(Token::Open) | Some(Token::Word(_)) => {
                    return Err(PatternError::malformed(
                        "expected AND or OR between comparisons",
                    ))
                }
            }
        }
        alternatives.push(Expr::and(conjuncts));
        Ok(Expr::or(alternatives))
    }

    fn term(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.expression()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(Expr::group(inner))
                    }
                    _ => Err(PatternError::malformed("unclosed group")),
                }
            }
            Some(Token::Word(_)) => {
                let mut words = Vec::new();
                while let Some(Token::Word(word)) = self.peek() {
                    words.push(word.clone());
                    self.pos += 1;
                }
                Ok(Expr::Clause(parse_clause(&words)?))
            }
            Some(Token::And) | Some(Token::Or) => Err(PatternError::malformed(
                "connective without a left-hand comparison",
            )),
            Some(Token::Close) => Err(PatternError::malformed("empty group")),
            None => Err(PatternError::malformed("empty expression")),
        }
    }
}

// ============================================================================
// Clause parsing
// ============================================================================

fn parse_clause(words: &[String]) -> Result<Clause> {
    let (left, operator, right) = match words {
        [left, op, right] => (left, op.clone(), right),
        [left, first, second, right] if first == "NOT" => (left, format!("{first} {second}"), right),
        [left, first, second, right] => (left, format!("{first}{second}"), right),
        _ => {
            return Err(PatternError::malformed(format!(
                "`{}` is not a comparison",
                words.join(" ")
            )))
        }
    };

    let op = parse_operator(&operator)?;
    let (field, op, literal) = match (lexer::is_field_word(left), lexer::is_field_word(right)) {
        (true, false) => (left, op, right),
        (false, true) => (right, op.mirrored(), left),
        _ => {
            return Err(PatternError::malformed(format!(
                "`{}` needs exactly one field path",
                words.join(" ")
            )))
        }
    };

    let (stix_type, path) = parse_field_path(field)?;
    Ok(Clause {
        stix_type,
        path,
        op,
        literal: parse_literal(literal)?,
    })
}

fn operator(input: &str) -> IResult<&str, CompareOp> {
    alt((
        value(CompareOp::Ne, tag("!=")),
        value(CompareOp::Le, tag("<=")),
        value(CompareOp::Ge, tag(">=")),
        value(CompareOp::Eq, tag("=")),
        value(CompareOp::Lt, tag("<")),
        value(CompareOp::Gt, tag(">")),
        value(CompareOp::NotLike, tag("NOT LIKE")),
        value(CompareOp::Like, tag("LIKE")),
    ))(input)
}

fn parse_operator(text: &str) -> Result<CompareOp> {
    all_consuming(operator)(text)
        .map(|(_, op)| op)
        .map_err(|_| PatternError::malformed(format!("unknown operator `{text}`")))
}

fn segment(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

fn field_path(input: &str) -> IResult<&str, (&str, Vec<&str>)> {
    separated_pair(segment, nom_char(':'), separated_list1(one_of(":."), segment))(input)
}

fn parse_field_path(text: &str) -> Result<(String, Vec<String>)> {
    let (_, (stix_type, path)) = all_consuming(field_path)(text)
        .map_err(|_| PatternError::malformed(format!("invalid field path `{text}`")))?;
    Ok((
        stix_type.to_string(),
        path.into_iter().map(str::to_string).collect(),
    ))
}

fn parse_literal(text: &str) -> Result<Literal> {
    let mut chars = text.chars();
    if let Some(quote @ ('\'' | '"')) = chars.next() {
        let body = &text[1..];
        let mut escaped = false;
        for (i, c) in body.char_indices() {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                if i + c.len_utf8() != body.len() {
                    break;
                }
                return Ok(Literal::Str {
                    quote,
                    raw: body[..i].to_string(),
                });
            }
        }
        return Err(PatternError::malformed(format!("invalid string literal {text}")));
    }

    match text {
        "true" => return Ok(Literal::Bool(true)),
        "false" => return Ok(Literal::Bool(false)),
        "null" => return Ok(Literal::Null),
        _ => {}
    }
    all_consuming(recognize_float::<&str, nom::error::Error<&str>>)(text)
        .map(|_| Literal::Number(text.to_string()))
        .map_err(|_| PatternError::malformed(format!("`{text}` is not a literal")))
}
