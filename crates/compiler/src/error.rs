//! Diagnostics.
//!
//! Every fallible pass returns a location-bearing [`Error`]. Errors form a
//! tree: an outer traversal wraps the errors of an inner one without
//! flattening their locations, and the whole tree renders with two spaces of
//! indentation per nesting level. No diagnostic is silently dropped and no
//! partial result is returned on failure.

use std::fmt;

/// A source position (1-based line and column as produced by the lexer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLoc {
    pub line: u32,
    pub column: u32,
}

impl SourceLoc {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLoc { line, column }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The closed set of diagnostics the mid-end can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// A wrapped lexer/parser message.
    Parser(String),

    // Name resolution
    UndefinedIdentifier { name: String },
    AlreadyDeclared { name: String },
    NestedFunctionsNotSupported,

    // Typing
    MismatchedTypes { from: String, to: String },
    NotAFunction { name: String },
    WrongArgCount { expected: usize, got: usize },
    ReferenceRequiresIdentifier,
    ReadOfOutParameter { name: String },
    AssignmentToConst { name: String },
    UntypedExpression { what: String },
    WrongIndexCount { expected: usize, got: usize },

    // Control flow
    BreakNotInLoop,
    ContinueNotInLoop,

    // Lowering
    NotImplemented { what: String },
    CannotLowerArrayIndices { name: String },
    FunctionCallNonIdentifier,
    ArgRefMustBeIdentifier,
    MissingBinding { name: String },

    // Module structure
    VariableDeclsBeforeFunctions,
    UnexpectedTopLevelStatement { what: String },
    RootExprMustBeBlock,
    UnknownModule { name: String },
    TooManyTransformIterations,

    /// An IR invariant was violated; indicates a compiler bug.
    InvalidIr { what: String },

    /// A node with no message of its own, grouping child errors.
    Aggregate,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;
        match self {
            Parser(msg) => write!(f, "{}", msg),
            UndefinedIdentifier { name } => write!(f, "undefined identifier `{}`", name),
            AlreadyDeclared { name } => {
                write!(f, "`{}` is already declared in this scope", name)
            }
            NestedFunctionsNotSupported => {
                write!(f, "nested function declarations are not supported")
            }
            MismatchedTypes { from, to } => {
                write!(f, "cannot implicitly convert `{}` to `{}`", from, to)
            }
            NotAFunction { name } => write!(f, "`{}` is not a function", name),
            WrongArgCount { expected, got } => {
                write!(f, "wrong argument count: expected {}, got {}", expected, got)
            }
            ReferenceRequiresIdentifier => {
                write!(f, "argument for a reference parameter must be an identifier")
            }
            ReadOfOutParameter { name } => {
                write!(f, "cannot read output-only parameter `{}`", name)
            }
            AssignmentToConst { name } => {
                write!(f, "cannot assign to non-mutable `{}`", name)
            }
            UntypedExpression { what } => {
                write!(f, "could not determine the type of `{}`", what)
            }
            WrongIndexCount { expected, got } => {
                write!(f, "wrong index count: expected {}, got {}", expected, got)
            }
            BreakNotInLoop => write!(f, "break outside of a loop"),
            ContinueNotInLoop => write!(f, "continue outside of a loop"),
            NotImplemented { what } => write!(f, "not implemented: lowering for {}", what),
            CannotLowerArrayIndices { name } => {
                write!(f, "failed to lower array indices of `{}`", name)
            }
            FunctionCallNonIdentifier => {
                write!(f, "function call through a non-identifier is not supported")
            }
            ArgRefMustBeIdentifier => {
                write!(f, "argument for a reference parameter must be an identifier")
            }
            MissingBinding { name } => write!(f, "`{}` has no binding", name),
            VariableDeclsBeforeFunctions => {
                write!(f, "variable declarations must appear before function declarations")
            }
            UnexpectedTopLevelStatement { what } => {
                write!(f, "unexpected top-level statement: {}", what)
            }
            RootExprMustBeBlock => write!(f, "root expression must be a block"),
            UnknownModule { name } => write!(f, "unknown module `{}`", name),
            TooManyTransformIterations => {
                write!(f, "transform pipeline did not reach a fixpoint")
            }
            InvalidIr { what } => write!(f, "invalid IR: {}", what),
            Aggregate => Ok(()),
        }
    }
}

/// A diagnostic with an optional location and nested child errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub loc: Option<SourceLoc>,
    pub kind: ErrorKind,
    pub children: Vec<Error>,
}

impl Error {
    pub fn new(loc: SourceLoc, kind: ErrorKind) -> Self {
        Error {
            loc: Some(loc),
            kind,
            children: Vec::new(),
        }
    }

    /// A diagnostic with no source position (e.g. a missing runtime symbol).
    pub fn bare(kind: ErrorKind) -> Self {
        Error {
            loc: None,
            kind,
            children: Vec::new(),
        }
    }

    /// Group several child errors under a parent location.
    pub fn group(loc: SourceLoc, children: Vec<Error>) -> Self {
        Error {
            loc: Some(loc),
            kind: ErrorKind::Aggregate,
            children,
        }
    }

    /// Wrap a child error with an enclosing location. When the child sits at
    /// the same location and carries no message of its own, it is flattened
    /// to avoid duplicate empty frames.
    pub fn wrap(loc: SourceLoc, child: Error) -> Self {
        if child.loc == Some(loc) && child.kind == ErrorKind::Aggregate {
            return Error {
                loc: Some(loc),
                kind: ErrorKind::Aggregate,
                children: child.children,
            };
        }
        Error {
            loc: Some(loc),
            kind: ErrorKind::Aggregate,
            children: vec![child],
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        for _ in 0..indent {
            write!(f, "  ")?;
        }
        if let Some(loc) = self.loc {
            write!(f, "{}: ", loc)?;
        }
        writeln!(f, "{}", self.kind)?;
        for child in &self.children {
            child.render(f, indent + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_location_and_message() {
        let e = Error::new(
            SourceLoc::new(3, 7),
            ErrorKind::UndefinedIdentifier {
                name: "x".to_string(),
            },
        );
        assert_eq!(e.to_string(), "3:7: undefined identifier `x`\n");
    }

    #[test]
    fn renders_children_with_two_space_indent() {
        let inner = Error::new(SourceLoc::new(2, 1), ErrorKind::BreakNotInLoop);
        let outer = Error::wrap(SourceLoc::new(1, 1), inner);
        let text = outer.to_string();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "1:1: ");
        assert_eq!(lines.next().unwrap(), "  2:1: break outside of a loop");
    }

    #[test]
    fn wrap_flattens_empty_frames_at_same_location() {
        let loc = SourceLoc::new(5, 5);
        let child = Error::group(loc, vec![Error::new(loc, ErrorKind::ContinueNotInLoop)]);
        let wrapped = Error::wrap(loc, child);
        assert_eq!(wrapped.children.len(), 1);
        assert_eq!(wrapped.children[0].kind, ErrorKind::ContinueNotInLoop);
    }

    #[test]
    fn wrap_nests_distinct_locations() {
        let child = Error::new(SourceLoc::new(2, 2), ErrorKind::BreakNotInLoop);
        let wrapped = Error::wrap(SourceLoc::new(1, 1), child.clone());
        assert_eq!(wrapped.children, vec![child]);
    }
}
