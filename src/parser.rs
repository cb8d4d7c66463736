//! Parser for schedule scripts
//!
//! Parses statements like:
//! - `s = customize(gemm)`
//! - `s5 = customize(add_const, [5], tag="const5")`
//! - `s.split(i, factor=4)`
//! - `top.compose([s0, s1], id=const7)`
//! - `opt = optimize(top, kind=graph, debug_point=mark_regions)`

use crate::ast::{Argument, Invocation, Script, Statement, Value};
use crate::error::{CompileError, CompileResult};
use crate::lexer::{Lexer, Token};

/// Parser for schedule scripts
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    current: Option<Token>,
    error: Option<CompileError>,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        let mut parser = Self {
            lexer: Lexer::new(source),
            current: None,
            error: None,
        };
        parser.advance();
        parser
    }

    /// Move to the next token; a lexer error ends the stream and is kept
    /// until the parser reports
    fn advance(&mut self) -> Option<Token> {
        let prev = self.current.take();
        self.current = match self.lexer.next() {
            Some(Ok((tok, _))) => Some(tok),
            Some(Err(err)) => {
                self.error.get_or_insert(err);
                None
            }
            None => None,
        };
        prev
    }

    /// Check if current token matches expected
    fn check(&self, expected: &Token) -> bool {
        match &self.current {
            Some(tok) => std::mem::discriminant(tok) == std::mem::discriminant(expected),
            None => false,
        }
    }

    /// Consume token if it matches, otherwise error
    fn expect(&mut self, expected: Token) -> CompileResult<Token> {
        if self.check(&expected) {
            self.advance()
                .ok_or_else(|| CompileError::parse_error(format!("Expected {}, got end of input", expected)))
        } else {
            Err(self.unexpected(&expected.to_string()))
        }
    }

    fn unexpected(&mut self, what: &str) -> CompileError {
        if let Some(err) = self.error.take() {
            return err;
        }
        match &self.current {
            Some(tok) => CompileError::parse_error(format!("Expected {}, got `{}`", what, tok)),
            None => CompileError::parse_error(format!("Expected {}, got end of input", what)),
        }
    }

    fn ident(&mut self) -> CompileResult<String> {
        match self.current.clone() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    /// Parse a complete script
    pub fn parse_script(&mut self) -> CompileResult<Script> {
        let mut statements = Vec::new();

        while self.current.is_some() {
            statements.push(self.parse_statement()?);

            // Optional semicolon between statements
            if self.check(&Token::Semicolon) {
                self.advance();
            }
        }
        if let Some(err) = self.error.take() {
            return Err(err);
        }

        Ok(Script { statements })
    }

    /// `[target =] [receiver.]method(args)`
    fn parse_statement(&mut self) -> CompileResult<Statement> {
        let first = self.ident()?;
        let (target, head) = if self.check(&Token::Equals) {
            self.advance();
            (Some(first), self.ident()?)
        } else {
            (None, first)
        };
        let (receiver, method) = if self.check(&Token::Dot) {
            self.advance();
            (Some(head), self.ident()?)
        } else {
            (None, head)
        };
        self.expect(Token::LParen)?;
        let args = self.parse_args()?;
        self.expect(Token::RParen)?;
        Ok(Statement {
            target,
            call: Invocation { receiver, method, args },
        })
    }

    fn parse_args(&mut self) -> CompileResult<Vec<Argument>> {
        let mut args = Vec::new();
        let mut seen_keyword = false;
        while !self.check(&Token::RParen) {
            let arg = self.parse_argument()?;
            match (&arg.name, seen_keyword) {
                (Some(_), _) => seen_keyword = true,
                (None, true) => {
                    return Err(CompileError::parse_error(format!(
                        "positional argument `{}` follows a keyword argument",
                        arg.value
                    )))
                }
                (None, false) => {}
            }
            args.push(arg);
            if !self.check(&Token::Comma) {
                break;
            }
            self.advance();
        }
        Ok(args)
    }

    fn parse_argument(&mut self) -> CompileResult<Argument> {
        let value = self.parse_value()?;
        if let (Value::Path(name), true) = (&value, self.check(&Token::Equals)) {
            if !name.contains('.') {
                let name = name.clone();
                self.advance();
                return Ok(Argument {
                    name: Some(name),
                    value: self.parse_value()?,
                });
            }
        }
        Ok(Argument { name: None, value })
    }

    fn parse_value(&mut self) -> CompileResult<Value> {
        match self.current.clone() {
            Some(Token::Number(n)) => {
                self.advance();
                Ok(Value::Int(n))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Value::Str(s))
            }
            Some(Token::Ident(_)) => {
                let mut path = self.ident()?;
                while self.check(&Token::Dot) {
                    self.advance();
                    path.push('.');
                    path.push_str(&self.ident()?);
                }
                Ok(Value::Path(path))
            }
            Some(Token::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                while !self.check(&Token::RBracket) {
                    items.push(self.parse_value()?);
                    if !self.check(&Token::Comma) {
                        break;
                    }
                    self.advance();
                }
                self.expect(Token::RBracket)?;
                Ok(Value::List(items))
            }
            _ => Err(self.unexpected("a value")),
        }
    }
}

/// Parse a whole script
pub fn parse_script(source: &str) -> CompileResult<Script> {
    Parser::new(source).parse_script()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_customize() {
        let script = parse_script("s5 = customize(add_const, [5], tag=\"const5\")").unwrap();
        let stmt = &script.statements[0];
        assert_eq!(stmt.target.as_deref(), Some("s5"));
        assert_eq!(stmt.call.receiver, None);
        assert_eq!(stmt.call.method, "customize");
        let positional: Vec<&Value> = stmt.call.positional().collect();
        assert_eq!(positional, vec![&Value::Path("add_const".into()), &Value::List(vec![Value::Int(5)])]);
        assert_eq!(stmt.call.keyword("tag"), Some(&Value::Str("const5".into())));
    }

    #[test]
    fn test_parse_method_with_dotted_path() {
        let script = parse_script("s.split(i, factor=2); s.pipeline(i.inner)").unwrap();
        assert_eq!(script.statements.len(), 2);
        let pipeline = &script.statements[1].call;
        assert_eq!(pipeline.receiver.as_deref(), Some("s"));
        assert_eq!(pipeline.positional().next(), Some(&Value::Path("i.inner".into())));
    }

    #[test]
    fn test_parse_compose_list() {
        let script = parse_script("top.compose([s0, s1], id=const7)").unwrap();
        let call = &script.statements[0].call;
        assert_eq!(
            call.positional().next(),
            Some(&Value::List(vec![Value::Path("s0".into()), Value::Path("s1".into())]))
        );
        assert_eq!(call.keyword("id"), Some(&Value::Path("const7".into())));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_script("s.split(i"), Err(CompileError::ParseError { .. })));
        assert!(matches!(parse_script("s.split(factor=2, i)"), Err(CompileError::ParseError { .. })));
        assert!(matches!(parse_script("s.split(i, $)"), Err(CompileError::LexerError { .. })));
    }
}
