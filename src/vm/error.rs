use core::fmt;
use std::borrow::Cow;

use crate::compiler::error::StaticErrors;

/// What `Vm::interpret` can fail with; the driver maps the variants to the
/// conventional exit codes (65 for static, 70 for runtime).
#[derive(thiserror::Error, miette::Diagnostic, Debug)]
pub enum InterpretError<'a> {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Static(StaticErrors<'a>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(RuntimeError),
}

impl<'a> From<StaticErrors<'a>> for InterpretError<'a> {
    fn from(err: StaticErrors<'a>) -> Self {
        Self::Static(err)
    }
}

impl<'a> From<RuntimeError> for InterpretError<'a> {
    fn from(err: RuntimeError) -> Self {
        Self::Runtime(err)
    }
}

/// Runtime failure, carrying the offending span and the formatted call
/// stack. Owns its source text so it can cross thread boundaries intact.
#[derive(Debug, thiserror::Error, miette::Diagnostic, Clone)]
#[error("{kind}")]
pub struct RuntimeError {
    #[source_code]
    pub src: String,
    #[label("here")]
    pub span: Option<miette::SourceSpan>,
    pub kind: RuntimeErrorKind,
    /// One `[line N] in <fn>` row per live frame, innermost first.
    #[help]
    pub trace: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RuntimeErrorKind {
    InvalidOperand {
        expected: &'static str,
        found: &'static str,
    },
    InvalidOperands {
        expected: &'static str,
    },
    UndefinedVariable {
        name: String,
    },
    UndefinedProperty {
        name: String,
    },
    PropertyOnNonInstance {
        found: &'static str,
    },
    NotCallable {
        found: &'static str,
    },
    SuperclassNotClass {
        found: &'static str,
    },
    WrongNumberOfArguments {
        expected: usize,
        got: usize,
    },
    StackOverflow,
    NotIndexable {
        found: &'static str,
    },
    IndexNotNumber {
        found: &'static str,
    },
    IndexOutOfBounds {
        index: f64,
        len: usize,
    },
    StringIndexAssignment,
    Native(Cow<'static, str>),
    /// A sibling VM hit a runtime error and the dispatcher cancelled us.
    Terminated,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::InvalidOperand { expected, found } => {
                write!(f, "invalid operand, expected a {}, found a {}", expected, found)
            }
            RuntimeErrorKind::InvalidOperands { expected } => {
                write!(f, "invalid operands, expected {}", expected)
            }
            RuntimeErrorKind::UndefinedVariable { name } => {
                write!(f, "undefined variable `{}`", name)
            }
            RuntimeErrorKind::UndefinedProperty { name } => {
                write!(f, "undefined property `{}`", name)
            }
            RuntimeErrorKind::PropertyOnNonInstance { found } => {
                write!(f, "only instances have properties, found a {}", found)
            }
            RuntimeErrorKind::NotCallable { found } => {
                write!(
                    f,
                    "can only call functions and classes, found a {}",
                    found
                )
            }
            RuntimeErrorKind::SuperclassNotClass { found } => {
                write!(f, "superclass must be a class, found a {}", found)
            }
            RuntimeErrorKind::WrongNumberOfArguments { expected, got } => {
                write!(
                    f,
                    "wrong number of arguments, expected {}, got {}",
                    expected, got
                )
            }
            RuntimeErrorKind::StackOverflow => write!(f, "stack overflow"),
            RuntimeErrorKind::NotIndexable { found } => {
                write!(f, "can only index lists and strings, found a {}", found)
            }
            RuntimeErrorKind::IndexNotNumber { found } => {
                write!(f, "index must be a number, found a {}", found)
            }
            RuntimeErrorKind::IndexOutOfBounds { index, len } => {
                write!(f, "index {} out of bounds for length {}", index, len)
            }
            RuntimeErrorKind::StringIndexAssignment => {
                write!(f, "strings are immutable, can't assign to an index")
            }
            RuntimeErrorKind::Native(msg) => write!(f, "{}", msg),
            RuntimeErrorKind::Terminated => {
                write!(f, "interpreter terminated by a failing sibling thread")
            }
        }
    }
}
