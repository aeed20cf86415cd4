//! Tokenizer for the expression grammar.

use crate::errors::ExpressionError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Integer literal.
    Integer(i64),
    /// Float literal.
    Float(f64),
    /// Quoted string literal.
    String(String),
    /// Bare identifier or keyword, possibly dotted (`t.col`).
    Ident(String),
    /// Backtick-quoted identifier; never treated as a keyword.
    QuotedIdent(String),
    /// Parameter reference (`$name` or `${name}`).
    Param(String),
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%`
    Percent,
    /// `=` or `==`
    Eq,
    /// `!=` or `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `&&`
    AndAnd,
    /// `||`
    OrOr,
    /// `!`
    Bang,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `,`
    Comma,
    /// End of input.
    Eof,
}

impl Token {
    /// Returns true if the token is the given keyword (case-insensitive).
    #[must_use]
    pub fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Ident(name) if name.eq_ignore_ascii_case(keyword))
    }
}

/// A token with the character offset it started at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    /// The token.
    pub token: Token,
    /// Character offset into the source.
    pub position: usize,
}

/// Converts expression text into tokens.
pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    /// Creates a lexer over the given text.
    #[must_use]
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    fn current_char(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while self.current_char().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut result = String::new();
        while let Some(ch) = self.current_char() {
            let continues = ch.is_alphanumeric()
                || ch == '_'
                || (ch == '.'
                    && self
                        .peek_char(1)
                        .is_some_and(|c| c.is_alphabetic() || c == '_'));
            if !continues {
                break;
            }
            result.push(ch);
            self.advance();
        }
        result
    }

    fn read_string(&mut self, quote: char) -> Result<String, ExpressionError> {
        let start = self.position;
        let mut result = String::new();
        self.advance();

        while let Some(ch) = self.current_char() {
            match ch {
                c if c == quote => {
                    // SQL style doubled quote
                    if self.peek_char(1) == Some(quote) {
                        result.push(quote);
                        self.advance();
                        self.advance();
                        continue;
                    }
                    self.advance();
                    return Ok(result);
                }
                '\\' => {
                    self.advance();
                    match self.current_char() {
                        Some('n') => result.push('\n'),
                        Some('t') => result.push('\t'),
                        Some('r') => result.push('\r'),
                        Some(c @ ('\\' | '\'' | '"')) => result.push(c),
                        Some(c) => {
                            return Err(ExpressionError::syntax(
                                self.position,
                                format!("invalid escape sequence \\{c}"),
                            ))
                        }
                        None => break,
                    }
                    self.advance();
                }
                _ => {
                    result.push(ch);
                    self.advance();
                }
            }
        }

        Err(ExpressionError::syntax(start, "unterminated string literal"))
    }

    fn read_number(&mut self) -> Result<Token, ExpressionError> {
        let start = self.position;
        let mut number = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current_char() {
            if ch.is_ascii_digit() {
                number.push(ch);
                self.advance();
            } else if ch == '.' && !is_float && self.peek_char(1).is_some_and(|c| c.is_ascii_digit())
            {
                is_float = true;
                number.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if is_float {
            number
                .parse::<f64>()
                .map(Token::Float)
                .map_err(|_| ExpressionError::syntax(start, format!("invalid number '{number}'")))
        } else {
            match number.parse::<i64>() {
                Ok(i) => Ok(Token::Integer(i)),
                Err(_) => number
                    .parse::<f64>()
                    .map(Token::Float)
                    .map_err(|_| ExpressionError::syntax(start, format!("invalid number '{number}'"))),
            }
        }
    }

    fn read_param(&mut self) -> Result<Token, ExpressionError> {
        let start = self.position;
        self.advance();

        if self.current_char() == Some('{') {
            self.advance();
            let name = self.read_identifier();
            if name.is_empty() || self.current_char() != Some('}') {
                return Err(ExpressionError::syntax(start, "malformed ${...} parameter"));
            }
            self.advance();
            return Ok(Token::Param(name));
        }

        let name = self.read_identifier();
        if name.is_empty() {
            return Err(ExpressionError::syntax(start, "expected parameter name after '$'"));
        }
        Ok(Token::Param(name))
    }

    fn read_quoted_identifier(&mut self) -> Result<Token, ExpressionError> {
        let start = self.position;
        self.advance();
        let mut name = String::new();
        while let Some(ch) = self.current_char() {
            self.advance();
            if ch == '`' {
                return Ok(Token::QuotedIdent(name));
            }
            name.push(ch);
        }
        Err(ExpressionError::syntax(start, "unterminated quoted identifier"))
    }

    fn two_char(&mut self, token: Token) -> Token {
        self.advance();
        self.advance();
        token
    }

    fn one_char(&mut self, token: Token) -> Token {
        self.advance();
        token
    }

    /// Reads the next token.
    ///
    /// # Errors
    ///
    /// Returns a syntax error for characters outside the grammar.
    pub fn next_token(&mut self) -> Result<Spanned, ExpressionError> {
        self.skip_whitespace();
        let position = self.position;

        let token = match self.current_char() {
            None => Token::Eof,
            Some('$') => self.read_param()?,
            Some(q @ ('\'' | '"')) => Token::String(self.read_string(q)?),
            Some('`') => self.read_quoted_identifier()?,
            Some(c) if c.is_ascii_digit() => self.read_number()?,
            Some(c) if c.is_alphabetic() || c == '_' => Token::Ident(self.read_identifier()),
            Some('+') => self.one_char(Token::Plus),
            Some('-') => self.one_char(Token::Minus),
            Some('*') => self.one_char(Token::Star),
            Some('/') => self.one_char(Token::Slash),
            Some('%') => self.one_char(Token::Percent),
            Some('(') => self.one_char(Token::LParen),
            Some(')') => self.one_char(Token::RParen),
            Some(',') => self.one_char(Token::Comma),
            Some('=') => {
                if self.peek_char(1) == Some('=') {
                    self.two_char(Token::Eq)
                } else {
                    self.one_char(Token::Eq)
                }
            }
            Some('!') => {
                if self.peek_char(1) == Some('=') {
                    self.two_char(Token::NotEq)
                } else {
                    self.one_char(Token::Bang)
                }
            }
            Some('<') => match self.peek_char(1) {
                Some('=') => self.two_char(Token::LtEq),
                Some('>') => self.two_char(Token::NotEq),
                _ => self.one_char(Token::Lt),
            },
            Some('>') => {
                if self.peek_char(1) == Some('=') {
                    self.two_char(Token::GtEq)
                } else {
                    self.one_char(Token::Gt)
                }
            }
            Some('&') if self.peek_char(1) == Some('&') => self.two_char(Token::AndAnd),
            Some('|') if self.peek_char(1) == Some('|') => self.two_char(Token::OrOr),
            Some(c) => {
                return Err(ExpressionError::syntax(
                    position,
                    format!("unexpected character '{c}'"),
                ))
            }
        };

        Ok(Spanned { token, position })
    }

    /// Tokenizes the whole input, ending with `Token::Eof`.
    ///
    /// # Errors
    ///
    /// Returns the first syntax error encountered.
    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ExpressionError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            tokens("a >= 1 && b <> 'x' || !c"),
            vec![
                Token::Ident("a".into()),
                Token::GtEq,
                Token::Integer(1),
                Token::AndAnd,
                Token::Ident("b".into()),
                Token::NotEq,
                Token::String("x".into()),
                Token::OrOr,
                Token::Bang,
                Token::Ident("c".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_params_and_dotted_identifiers() {
        assert_eq!(
            tokens("orders.amount * ${rate} + $bonus"),
            vec![
                Token::Ident("orders.amount".into()),
                Token::Star,
                Token::Param("rate".into()),
                Token::Plus,
                Token::Param("bonus".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("3 2.5"),
            vec![Token::Integer(3), Token::Float(2.5), Token::Eof]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r"'it''s' 'a\nb'"),
            vec![
                Token::String("it's".into()),
                Token::String("a\nb".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_errors() {
        assert!(Lexer::new("'open").tokenize().is_err());
        assert!(Lexer::new("a ; b").tokenize().is_err());
        assert!(Lexer::new("${x").tokenize().is_err());
        assert!(Lexer::new("a & b").tokenize().is_err());
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            tokens("`order`"),
            vec![Token::QuotedIdent("order".into()), Token::Eof]
        );
    }
}
