use core::fmt;
use std::cell::RefCell;

use crate::common::Span;
use crate::lexer::{LexerError, TokenKind};

/// Everything that went wrong before the program could run. The compiler
/// keeps collecting after the first error (panic mode synchronizes at
/// statement boundaries), so this is a list.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("Static errors")]
pub struct StaticErrors<'b> {
    #[source_code]
    src: &'b str,
    #[related]
    errors: Vec<StaticError<'b>>,
}

impl<'b> StaticErrors<'b> {
    pub fn new(src: &'b str) -> Self {
        Self {
            src,
            errors: Vec::new(),
        }
    }

    pub fn push(&mut self, error: StaticError<'b>) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticError<'b>> {
        self.errors.iter()
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
pub enum StaticError<'a> {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Lexer(LexerError<'a>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Compile(CompileError),
}

impl<'a> From<CompileError> for StaticError<'a> {
    fn from(err: CompileError) -> Self {
        Self::Compile(err)
    }
}

impl<'a> From<LexerError<'a>> for StaticError<'a> {
    fn from(err: LexerError<'a>) -> Self {
        Self::Lexer(err)
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
#[error("{kind}")]
pub struct CompileError {
    #[label("here")]
    pub span: Span,
    pub kind: CompileErrorKind,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, span: Span) -> Self {
        Self { span, kind }
    }
}

#[derive(Debug, Clone)]
pub enum CompileErrorKind {
    UnexpectedToken {
        expected: &'static [TokenKind],
        found: TokenKind,
    },
    InvalidAssignmentTarget,
    UseOfLocalInItsOwnInitializer,
    DuplicateLocal {
        ident: String,
    },
    TooManyConstants,
    TooManyLocals,
    TooManyUpvalues,
    TooManyParameters,
    TooManyArguments,
    ListTooLong,
    ReturnFromTopLevel,
    ReturnFromInitializer,
    ReturnFromConcurrentBlock {
        block: &'static str,
    },
    ThisOutsideClass,
    SuperOutsideClass,
    SuperWithoutSuperclass,
    SelfInheritance {
        ident: String,
    },
    UnsupportedExpression {
        keyword: &'static str,
    },
    JumpTooLarge,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileErrorKind::UnexpectedToken { expected, found } => {
                assert!(!expected.is_empty(), "expected at least one expected token");
                match expected.len() {
                    1 => write!(f, "expected '{}', found '{}'", expected[0], found),
                    _ => write!(
                        f,
                        "expected one of the following: '{}', found '{}'",
                        DisplayIterAsSeparatedList::new(expected.iter(), ", "),
                        found
                    ),
                }
            }
            CompileErrorKind::InvalidAssignmentTarget => write!(f, "invalid assignment target"),
            CompileErrorKind::UseOfLocalInItsOwnInitializer => {
                write!(f, "can't read local variable in its own initializer")
            }
            CompileErrorKind::DuplicateLocal { ident } => {
                write!(f, "already a variable named `{}` in this scope", ident)
            }
            CompileErrorKind::TooManyConstants => write!(f, "too many constants in one chunk"),
            CompileErrorKind::TooManyLocals => {
                write!(f, "too many local variables in function")
            }
            CompileErrorKind::TooManyUpvalues => {
                write!(f, "too many closure variables in function")
            }
            CompileErrorKind::TooManyParameters => {
                write!(f, "can't have more than 255 parameters")
            }
            CompileErrorKind::TooManyArguments => {
                write!(f, "can't have more than 255 arguments")
            }
            CompileErrorKind::ListTooLong => {
                write!(f, "can't have more than 255 items in a list literal")
            }
            CompileErrorKind::ReturnFromTopLevel => {
                write!(f, "can't return from top-level code")
            }
            CompileErrorKind::ReturnFromInitializer => {
                write!(f, "can't return a value from an initializer")
            }
            CompileErrorKind::ReturnFromConcurrentBlock { block } => {
                write!(f, "can't return from inside a '{}' block", block)
            }
            CompileErrorKind::ThisOutsideClass => {
                write!(f, "can't use 'this' outside of a class")
            }
            CompileErrorKind::SuperOutsideClass => {
                write!(f, "can't use 'super' outside of a class")
            }
            CompileErrorKind::SuperWithoutSuperclass => {
                write!(f, "can't use 'super' in a class with no superclass")
            }
            CompileErrorKind::SelfInheritance { ident } => {
                write!(f, "class `{}` can't inherit from itself", ident)
            }
            CompileErrorKind::UnsupportedExpression { keyword } => {
                write!(f, "'{}' expressions are not supported yet", keyword)
            }
            CompileErrorKind::JumpTooLarge => write!(f, "too much code to jump over"),
        }
    }
}

struct DisplayIterAsSeparatedList<T> {
    iter: RefCell<T>,
    sep: &'static str,
}

impl<T> DisplayIterAsSeparatedList<T> {
    fn new(iter: T, sep: &'static str) -> Self {
        Self {
            iter: RefCell::new(iter),
            sep,
        }
    }
}

impl<T> fmt::Display for DisplayIterAsSeparatedList<T>
where
    T: Iterator,
    T::Item: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter.borrow_mut();

        let first = iter.next();
        if let Some(first) = first {
            write!(f, "{}", first)?;
            for item in &mut *iter {
                write!(f, "{}{}", self.sep, item)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_token_message() {
        let kind = CompileErrorKind::UnexpectedToken {
            expected: &[TokenKind::Semicolon],
            found: TokenKind::Eof,
        };
        assert_eq!(kind.to_string(), "expected ';', found 'eof'");

        let kind = CompileErrorKind::UnexpectedToken {
            expected: &[TokenKind::Ident, TokenKind::Number],
            found: TokenKind::RBrace,
        };
        assert_eq!(
            kind.to_string(),
            "expected one of the following: 'ident, number', found '}'"
        );
    }

    #[test]
    fn spans_point_into_source() {
        let err = CompileError::new(
            CompileErrorKind::InvalidAssignmentTarget,
            Span::from_len(1, 4, 1),
        );
        let span = miette::SourceSpan::from(err.span.clone());
        assert_eq!(span.offset(), 4);
        assert_eq!(span.len(), 1);
    }
}
