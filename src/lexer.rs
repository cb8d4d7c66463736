//! Lexer for schedule scripts using logos
//!
//! Supports tokens like:
//! - Identifiers: s_gemm, A, i
//! - Integers: 4, -1
//! - Strings: "const5"
//! - Punctuation: (, ), [, ], ,, =, ., ;
//! - Comments: `#` to end of line

use std::ops::Range;

use logos::Logos;

use crate::error::{CompileError, CompileResult};

/// Token types for the schedule-script language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Number(i64),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r#""[^"\n]*""#, |lex| { let s = lex.slice(); s[1..s.len() - 1].to_string() })]
    Str(String),

    #[token("=")]
    Equals,

    #[token(".")]
    Dot,

    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[token("[")]
    LBracket,

    #[token("]")]
    RBracket,

    #[token(",")]
    Comma,

    #[token(";")]
    Semicolon,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Equals => write!(f, "="),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semicolon => write!(f, ";"),
        }
    }
}

/// Token stream with byte spans; characters no token matches become a
/// [`CompileError::LexerError`] at their offset
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = CompileResult<(Token, Range<usize>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.inner.next()?;
        let span = self.inner.span();
        Some(match token {
            Ok(token) => Ok((token, span)),
            Err(()) => Err(CompileError::LexerError {
                position: span.start,
                message: format!("unexpected `{}`", self.inner.slice()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        Lexer::new(source).filter_map(Result::ok).map(|(token, _)| token).collect()
    }

    #[test]
    fn test_method_call() {
        assert_eq!(
            tokens("s.split(i, factor=4)"),
            vec![
                Token::Ident("s".to_string()),
                Token::Dot,
                Token::Ident("split".to_string()),
                Token::LParen,
                Token::Ident("i".to_string()),
                Token::Comma,
                Token::Ident("factor".to_string()),
                Token::Equals,
                Token::Number(4),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_comments_and_strings() {
        assert_eq!(
            tokens("# set up\ns = customize(add_const, [-5], tag=\"const5\") # trailing"),
            vec![
                Token::Ident("s".to_string()),
                Token::Equals,
                Token::Ident("customize".to_string()),
                Token::LParen,
                Token::Ident("add_const".to_string()),
                Token::Comma,
                Token::LBracket,
                Token::Number(-5),
                Token::RBracket,
                Token::Comma,
                Token::Ident("tag".to_string()),
                Token::Equals,
                Token::Str("const5".to_string()),
                Token::RParen,
            ]
        );
    }

    #[test]
    fn test_invalid_character() {
        let err = Lexer::new("s.split(i, @)").find_map(Result::err).unwrap();
        assert!(matches!(err, CompileError::LexerError { position: 11, .. }));
    }
}
