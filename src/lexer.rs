use std::fmt;
use std::str::FromStr;

mod error;
#[cfg(test)]
mod tests;

pub use error::*;

use crate::common::{Span, Spanned};

/// Lexer wrapper that can hold back one token, which is all the lookahead the
/// single-pass compiler ever needs.
pub struct PeekableLexer<'a> {
    lexer: Lexer<'a>,
    peeked: Option<Result<Option<Spanned<Token<'a>>>, LexerError<'a>>>,
    line: usize,
}

impl<'a> PeekableLexer<'a> {
    pub fn new(lexer: Lexer<'a>) -> Self {
        Self {
            lexer,
            peeked: None,
            line: 0,
        }
    }

    pub fn peek(&mut self) -> Result<&Option<Spanned<Token<'a>>>, LexerError<'a>> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next_token());
        }
        match self.peeked {
            Some(Ok(ref res)) => Ok(res),
            Some(Err(ref e)) => Err(e.clone()),
            None => unreachable!("peeked should be set"),
        }
    }

    pub fn next_if<F>(&mut self, f: F) -> Result<Option<Spanned<Token<'a>>>, LexerError<'a>>
    where
        F: Fn(&Token<'a>) -> bool,
    {
        match self.next()? {
            Some(t) if f(&t) => Ok(Some(t)),
            Some(t) => {
                self.peeked = Some(Ok(Some(t)));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn is_next<F>(&mut self, f: F) -> Result<bool, LexerError<'a>>
    where
        F: Fn(&Token<'a>) -> bool,
    {
        match self.peek() {
            Ok(Some(t)) => Ok(f(t)),
            Ok(None) => Ok(false),
            Err(e) => Err(e.clone()),
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Spanned<Token<'a>>>, LexerError<'a>> {
        let result = if self.peeked.is_some() {
            self.peeked.take().unwrap()
        } else {
            self.lexer.next_token()
        };
        self.line = self.lexer.line();

        result
    }
}

#[derive(Debug, Clone)]
struct Chars<'a> {
    inner: std::iter::Peekable<std::str::Chars<'a>>,
    byte_index: usize,
}

impl<'a> Chars<'a> {
    fn new(input: &'a str) -> Self {
        Chars {
            inner: input.chars().peekable(),
            byte_index: 0,
        }
    }

    #[inline]
    fn next_if_eq(&mut self, c: char) -> Option<(usize, char)> {
        self.next_if(|next| c == next)
    }

    #[inline]
    fn next_if_not_eq(&mut self, c: char) -> Option<(usize, char)> {
        self.next_if(|next| c != next)
    }

    #[inline]
    fn peek(&mut self) -> Option<(usize, &char)> {
        let index = self.byte_index;
        self.inner.peek().map(|c| (index, c))
    }

    #[inline]
    fn peek_if_eq(&mut self, c: char) -> Option<(usize, &char)> {
        self.peek().filter(|(_, next)| c == **next)
    }

    #[inline]
    fn next_if<F>(&mut self, f: F) -> Option<(usize, char)>
    where
        F: Fn(char) -> bool,
    {
        self.inner.next_if(|next| f(*next)).map(|c| {
            let result = (self.byte_index, c);
            self.byte_index += c.len_utf8();
            result
        })
    }
}

impl<'a> Iterator for Chars<'a> {
    type Item = (usize, char);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|c| {
            let result = (self.byte_index, c);
            self.byte_index += c.len_utf8();
            result
        })
    }
}

/// On-demand tokenizer. Produces one token per call, never looks further
/// ahead than a single character pair.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    input: &'a str,
    chars: Chars<'a>,
    line: usize,
    eof: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            chars: Chars::new(input),
            line: 1,
            eof: false,
        }
    }

    pub fn line(&self) -> usize {
        self.line
    }

    fn next_token(&mut self) -> Result<Option<Spanned<Token<'a>>>, LexerError<'a>> {
        loop {
            let Some((i, c)) = self.chars.next() else {
                if self.eof {
                    return Ok(None);
                } else {
                    self.eof = true;
                    let span = Span::from_len(self.line, self.input.len(), 1);
                    return Ok(Some(Spanned::new(Token::Eof, span)));
                }
            };

            let start = i;
            let token = match c {
                '(' => Token::LParen,
                ')' => Token::RParen,
                '{' => Token::LBrace,
                '}' => Token::RBrace,
                '[' => Token::LBracket,
                ']' => Token::RBracket,
                ',' => Token::Comma,
                '.' => Token::Dot,
                '-' => Token::Minus,
                '+' => Token::Plus,
                ';' => Token::Semicolon,
                ':' => Token::Colon,
                '*' => Token::Star,
                '%' => Token::Percent,
                '!' if self.chars.next_if_eq('=').is_some() => Token::BangEq,
                '!' => Token::Bang,
                '=' if self.chars.next_if_eq('=').is_some() => Token::EqEq,
                '=' => Token::Eq,
                '<' if self.chars.next_if_eq('=').is_some() => Token::LtEq,
                '<' => Token::Lt,
                '>' if self.chars.next_if_eq('=').is_some() => Token::GtEq,
                '>' => Token::Gt,
                '/' if self.chars.next_if_eq('/').is_some() => {
                    // comment, ignore until end of line
                    while self.chars.next_if_not_eq('\n').is_some() {}
                    continue;
                }
                '/' => Token::Slash,
                '"' => {
                    let start = i;
                    let mut end = i;
                    while let Some((i, c)) = self.chars.next_if_not_eq('"') {
                        // `end` is the index of the last byte of `c`
                        end = i + c.len_utf8() - 1;
                        if c == '\n' {
                            self.line += 1;
                        }
                    }

                    if self.chars.peek().is_none() {
                        let err = UnterminatedStringError::new(
                            self.input,
                            self.line,
                            (i..end + 1).into(),
                        );
                        return Err(LexerError::UnterminatedString(err));
                    }

                    assert!(self.chars.next_if_eq('"').is_some());

                    let lexeme = &self.input[start..=end + 1];
                    let value = &self.input[start + 1..=end];

                    Token::String { lexeme, value }
                }
                '\n' => {
                    self.line += 1;
                    continue;
                }
                ' ' | '\r' | '\t' => continue,
                c if c.is_ascii_digit() => {
                    let start = i;
                    let mut end = i;
                    while let Some((i, _)) = self.chars.next_if(|c| c.is_ascii_digit()) {
                        end = i;
                    }

                    'decimal: {
                        let Some((i, _)) = self.chars.peek_if_eq('.') else {
                            break 'decimal;
                        };

                        let Some(c) = self.input.get(i + 1..).and_then(|s| s.chars().next()) else {
                            break 'decimal;
                        };

                        if !c.is_ascii_digit() {
                            break 'decimal;
                        }

                        self.chars.next(); // consume .
                        while let Some((i, _)) = self.chars.next_if(|c| c.is_ascii_digit()) {
                            end = i;
                        }
                    }

                    let lexeme = &self.input[start..=end];

                    Token::Number {
                        lexeme,
                        value: lexeme.parse().unwrap(),
                    }
                }
                c if c.is_ascii_alphabetic() || c == '_' => {
                    let start = i;
                    let mut end = i;
                    while let Some((i, _)) = self
                        .chars
                        .next_if(|c| c.is_ascii_alphanumeric() || c == '_')
                    {
                        end = i;
                    }

                    let ident = &self.input[start..=end];
                    if let Ok(kw) = Keyword::from_str(ident) {
                        Token::Keyword(kw)
                    } else {
                        Token::Ident(ident)
                    }
                }
                _ => {
                    let err =
                        UnexpectedCharacterError::new(self.input, self.line, c, (i, 1).into());
                    return Err(LexerError::UnknownToken(err));
                }
            };

            let span = if token.is_eof() {
                Span::from_len(self.line, start.saturating_sub(2), 1)
            } else {
                Span::from_len(self.line, start, token.lexeme().len())
            };
            return Ok(Some(Spanned::new(token, span)));
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Spanned<Token<'a>>, LexerError<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_token() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token<'a> {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Colon,
    Star,
    Slash,
    Percent,
    Eq,
    EqEq,
    Bang,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Literals
    String { lexeme: &'a str, value: &'a str },
    Number { lexeme: &'a str, value: f64 },
    Ident(&'a str),
    Keyword(Keyword),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Colon,
    Star,
    Slash,
    Percent,
    Eq,
    EqEq,
    Bang,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    String,
    Number,
    Ident,
    Keyword(Keyword),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rep = match self {
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
            TokenKind::Minus => "-",
            TokenKind::Plus => "+",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Eq => "=",
            TokenKind::EqEq => "==",
            TokenKind::Bang => "!",
            TokenKind::BangEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::String => "string",
            TokenKind::Number => "number",
            TokenKind::Ident => "ident",
            TokenKind::Keyword(kw) => kw.lexeme(),
            TokenKind::Eof => "eof",
        };

        write!(f, "{}", rep)
    }
}

impl<'a> Token<'a> {
    pub const fn as_kind(&self) -> TokenKind {
        match self {
            Token::LParen => TokenKind::LParen,
            Token::RParen => TokenKind::RParen,
            Token::LBrace => TokenKind::LBrace,
            Token::RBrace => TokenKind::RBrace,
            Token::LBracket => TokenKind::LBracket,
            Token::RBracket => TokenKind::RBracket,
            Token::Comma => TokenKind::Comma,
            Token::Dot => TokenKind::Dot,
            Token::Minus => TokenKind::Minus,
            Token::Plus => TokenKind::Plus,
            Token::Semicolon => TokenKind::Semicolon,
            Token::Colon => TokenKind::Colon,
            Token::Star => TokenKind::Star,
            Token::Slash => TokenKind::Slash,
            Token::Percent => TokenKind::Percent,
            Token::Eq => TokenKind::Eq,
            Token::EqEq => TokenKind::EqEq,
            Token::Bang => TokenKind::Bang,
            Token::BangEq => TokenKind::BangEq,
            Token::Lt => TokenKind::Lt,
            Token::LtEq => TokenKind::LtEq,
            Token::Gt => TokenKind::Gt,
            Token::GtEq => TokenKind::GtEq,
            Token::String { .. } => TokenKind::String,
            Token::Number { .. } => TokenKind::Number,
            Token::Ident(_) => TokenKind::Ident,
            Token::Keyword(kw) => TokenKind::Keyword(*kw),
            Token::Eof => TokenKind::Eof,
        }
    }

    pub fn lexeme(&self) -> &'_ str {
        match self {
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Dot => ".",
            Token::Minus => "-",
            Token::Plus => "+",
            Token::Semicolon => ";",
            Token::Colon => ":",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Eq => "=",
            Token::EqEq => "==",
            Token::Bang => "!",
            Token::BangEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
            Token::String { lexeme, .. } | Token::Number { lexeme, .. } | Token::Ident(lexeme) => {
                lexeme
            }
            Token::Keyword(keyword) => keyword.lexeme(),

            Token::Eof => "",
        }
    }

    #[must_use]
    pub fn is_lparen(&self) -> bool {
        matches!(self, Self::LParen)
    }

    #[must_use]
    pub fn is_rparen(&self) -> bool {
        matches!(self, Self::RParen)
    }

    #[must_use]
    pub fn is_lbrace(&self) -> bool {
        matches!(self, Self::LBrace)
    }

    #[must_use]
    pub fn is_rbrace(&self) -> bool {
        matches!(self, Self::RBrace)
    }

    #[must_use]
    pub fn is_rbracket(&self) -> bool {
        matches!(self, Self::RBracket)
    }

    #[must_use]
    pub fn is_comma(&self) -> bool {
        matches!(self, Self::Comma)
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        matches!(self, Self::Dot)
    }

    #[must_use]
    pub fn is_semicolon(&self) -> bool {
        matches!(self, Self::Semicolon)
    }

    #[must_use]
    pub fn is_eq(&self) -> bool {
        matches!(self, Self::Eq)
    }

    #[must_use]
    pub fn is_lt(&self) -> bool {
        matches!(self, Self::Lt)
    }

    #[must_use]
    pub fn is_ident(&self) -> bool {
        matches!(self, Self::Ident(..))
    }

    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    #[must_use]
    pub fn is_else(&self) -> bool {
        matches!(self, Self::Keyword(Keyword::Else))
    }

    #[must_use]
    pub fn try_into_ident(self) -> Result<&'a str, Self> {
        if let Self::Ident(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Keyword {
    And,
    Async,
    Await,
    Class,
    Else,
    False,
    Finish,
    For,
    Fun,
    Future,
    If,
    Lambda,
    Nil,
    Or,
    Print,
    Reduce,
    Return,
    Super,
    This,
    True,
    Var,
    While,
}

impl Keyword {
    pub fn lexeme(&self) -> &'static str {
        match self {
            Keyword::And => "and",
            Keyword::Async => "async",
            Keyword::Await => "await",
            Keyword::Class => "class",
            Keyword::Else => "else",
            Keyword::False => "false",
            Keyword::Finish => "finish",
            Keyword::For => "for",
            Keyword::Fun => "fun",
            Keyword::Future => "future",
            Keyword::If => "if",
            Keyword::Lambda => "lambda",
            Keyword::Nil => "nil",
            Keyword::Or => "or",
            Keyword::Print => "print",
            Keyword::Reduce => "reduce",
            Keyword::Return => "return",
            Keyword::Super => "super",
            Keyword::This => "this",
            Keyword::True => "true",
            Keyword::Var => "var",
            Keyword::While => "while",
        }
    }
}

impl FromStr for Keyword {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(Keyword::And),
            "async" => Ok(Keyword::Async),
            "await" => Ok(Keyword::Await),
            "class" => Ok(Keyword::Class),
            "else" => Ok(Keyword::Else),
            "false" => Ok(Keyword::False),
            "finish" => Ok(Keyword::Finish),
            "for" => Ok(Keyword::For),
            "fun" => Ok(Keyword::Fun),
            "future" => Ok(Keyword::Future),
            "if" => Ok(Keyword::If),
            "lambda" => Ok(Keyword::Lambda),
            "nil" => Ok(Keyword::Nil),
            "or" => Ok(Keyword::Or),
            "print" => Ok(Keyword::Print),
            "reduce" => Ok(Keyword::Reduce),
            "return" => Ok(Keyword::Return),
            "super" => Ok(Keyword::Super),
            "this" => Ok(Keyword::This),
            "true" => Ok(Keyword::True),
            "var" => Ok(Keyword::Var),
            "while" => Ok(Keyword::While),
            _ => Err(()),
        }
    }
}
