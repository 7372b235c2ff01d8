use std::borrow::Cow;

/// A token stream error. Carries the full source line so the report can
/// point at the offending character without re-reading the input.
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
pub enum LexerError<'a> {
    #[error(transparent)]
    #[diagnostic(transparent)]
    UnknownToken(UnexpectedCharacterError<'a>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    UnterminatedString(UnterminatedStringError<'a>),
}

#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
#[error("[line {line_number}] Error: Unexpected character: {token}")]
pub struct UnexpectedCharacterError<'a> {
    #[source_code]
    line: Cow<'a, str>,
    line_number: usize,
    token: char,
    #[label("here")]
    span: miette::SourceSpan,
}

impl<'a> UnexpectedCharacterError<'a> {
    pub fn new(line: &'a str, line_number: usize, token: char, span: miette::SourceSpan) -> Self {
        Self {
            line: line.into(),
            line_number,
            token,
            span,
        }
    }

    pub fn token(&self) -> char {
        self.token
    }
}

#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic)]
#[error("[line {line_number}] Error: Unterminated string.")]
pub struct UnterminatedStringError<'a> {
    #[source_code]
    line: Cow<'a, str>,
    line_number: usize,
    #[label("here")]
    span: miette::SourceSpan,
}

impl<'a> UnterminatedStringError<'a> {
    pub fn new(line: &'a str, line_number: usize, span: miette::SourceSpan) -> Self {
        Self {
            line: line.into(),
            line_number,
            span,
        }
    }
}
