//! Script lexer using logos derive macros.
//!
//! Keywords are not separate tokens: they lex as [`Token::Name`] and the
//! parser matches them case-insensitively, the way the language treats them.

use logos::Logos;

use super::ast::Span;
use crate::error::{Error, Result};

/// Lex `source` into (token, span) pairs, skipping whitespace, comments and
/// open/close tags. The first unrecognised byte sequence is a syntax error.
pub fn lex(source: &str) -> Result<Vec<(Token<'_>, Span)>> {
    let mut out = Vec::new();
    for (result, span) in Token::lexer(source).spanned() {
        let span = Span {
            start: span.start,
            end: span.end,
        };
        match result {
            Ok(tok) => out.push((tok, span)),
            Err(()) => {
                return Err(Error::Syntax {
                    line: span.line(source),
                    message: format!(
                        "unexpected {:?}",
                        &source[span.start..span.end.min(source.len())]
                    ),
                });
            }
        }
    }
    Ok(out)
}

fn line_comment<'s>(_lex: &mut logos::Lexer<'s, Token<'s>>) -> logos::Skip {
    logos::Skip
}

fn block_comment<'s>(lex: &mut logos::Lexer<'s, Token<'s>>) -> logos::FilterResult<(), ()> {
    match lex.remainder().find("*/") {
        Some(end) => {
            lex.bump(end + 2);
            logos::FilterResult::Skip
        }
        None => {
            lex.bump(lex.remainder().len());
            logos::FilterResult::Error(())
        }
    }
}

/// A single token.
#[derive(Logos, Debug, Clone, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
pub enum Token<'src> {
    #[token("<?php", line_comment)]
    _OpenTag,
    #[token("?>", line_comment)]
    _CloseTag,

    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
    #[token("=>")]
    FatArrow,
    #[token("->")]
    Arrow,
    #[token("::")]
    DoubleColon,
    #[token("...")]
    Ellipsis,

    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token("===")]
    Identical,
    #[token("!=")]
    #[token("<>")]
    NotEqual,
    #[token("!==")]
    NotIdentical,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("<=")]
    LessEqual,
    #[token(">=")]
    GreaterEqual,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token(".")]
    Dot,
    #[token("!")]
    Bang,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("?")]
    Question,
    #[token("??")]
    Coalesce,
    #[token(":")]
    Colon,
    #[token("&")]
    Ampersand,
    #[token("|")]
    Pipe,
    #[token("@")]
    At,
    #[token("+=")]
    PlusEqual,
    #[token("-=")]
    MinusEqual,
    #[token("*=")]
    StarEqual,
    #[token("/=")]
    SlashEqual,
    #[token(".=")]
    DotEqual,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,

    /// Variable, without the leading `$`.
    #[regex(r"\$[a-zA-Z_][a-zA-Z0-9_]*", |lex| &lex.slice()[1..])]
    Variable(&'src str),

    /// Identifier or (possibly qualified) name, including keywords.
    #[regex(r"\\?[a-zA-Z_][a-zA-Z0-9_]*(\\[a-zA-Z_][a-zA-Z0-9_]*)*")]
    Name(&'src str),

    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", priority = 4)]
    Float(&'src str),

    #[regex(r"[0-9]+", priority = 3)]
    Integer(&'src str),

    /// Single-quoted string, quotes included.
    #[regex(r"'([^'\\]|\\.)*'")]
    SingleQuoted(&'src str),

    /// Double-quoted string, quotes included.
    #[regex(r#""([^"\\]|\\.)*""#)]
    DoubleQuoted(&'src str),

    #[regex(r"/\*", block_comment)]
    _BlockComment,

    #[regex(r"//[^\n]*", line_comment, priority = 1, allow_greedy = true)]
    #[regex(r"#[^\n]*", line_comment, priority = 1, allow_greedy = true)]
    _LineComment,
}

impl Token<'_> {
    /// Whether this token is the (case-insensitive) keyword `kw`.
    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(self, Token::Name(name) if name.eq_ignore_ascii_case(kw))
    }

    /// Human-readable token description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Token::Variable(name) => format!("${}", name),
            Token::Name(name) => format!("'{}'", name),
            Token::Integer(s) | Token::Float(s) => s.to_string(),
            Token::SingleQuoted(s) | Token::DoubleQuoted(s) => s.to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// Decode the body of a single-quoted string literal.
pub fn unescape_single(raw: &str) -> String {
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('\'') | Some('\\') => {
                    out.push(chars.next().unwrap_or('\\'));
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

/// Decode the body of a double-quoted string literal. `$` interpolation is
/// left in place; the parser splits interpolated parts afterwards.
pub fn unescape_double(raw: &str) -> String {
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('e') => out.push('\x1b'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            // Escaped dollar survives as a marker the interpolator skips.
            Some('$') => out.push('\u{0}'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token<'_>> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_tags_and_comments_skipped() {
        assert_eq!(
            tokens("<?php\n// note\n# other\n/* block */ $x = 1; ?>"),
            vec![
                Token::Variable("x"),
                Token::Equal,
                Token::Integer("1"),
                Token::Semicolon
            ]
        );
    }

    #[test]
    fn test_keywords_are_names() {
        let toks = tokens("function Greet() {}");
        assert!(toks[0].is_keyword("FUNCTION"));
        assert_eq!(toks[1], Token::Name("Greet"));
    }

    #[test]
    fn test_qualified_names() {
        assert_eq!(
            tokens(r"\App\Models\User::find"),
            vec![
                Token::Name(r"\App\Models\User"),
                Token::DoubleColon,
                Token::Name("find")
            ]
        );
    }

    #[test]
    fn test_numbers_and_operators() {
        assert_eq!(
            tokens("1.5 === 2 ?? 3"),
            vec![
                Token::Float("1.5"),
                Token::Identical,
                Token::Integer("2"),
                Token::Coalesce,
                Token::Integer("3")
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = lex("$a = 1;\n$b = \"oops").unwrap_err();
        match err {
            Error::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape_single(r"'it\'s'"), "it's");
        assert_eq!(unescape_double(r#""a\tb\n""#), "a\tb\n");
    }
}
