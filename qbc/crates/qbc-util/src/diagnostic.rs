//! Compile-time diagnostic reporting.
//!
//! Diagnostics are collected, never thrown: each phase pushes into a shared
//! [`Handler`] and the driver decides afterwards whether the pipeline may
//! continue. The set of diagnostic kinds is closed: every error the
//! front end can produce is a [`DiagnosticKind`] variant, and the variant
//! name is the stable identifier printed to users.

use std::cell::RefCell;
use std::fmt;

use crate::Span;

/// Diagnostic severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Prevents compilation from proceeding past the current phase.
    Error,
    /// Reported but does not stop compilation.
    Warning,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Error => write!(f, "error"),
            Level::Warning => write!(f, "warning"),
        }
    }
}

/// The closed set of compile-time diagnostics.
///
/// Lexer kinds come first, then parser, then semantic analysis. The
/// emitter reuses the semantic kinds (it only ever reports what the
/// analyzer let through).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    // Lexer
    UnterminatedString,
    InvalidNumber,
    IllegalCharacter,
    // Parser
    UnexpectedToken,
    ExpectedEndOfLine,
    // Semantic analysis
    TypeMismatch,
    Undeclared,
    Redeclared,
    ArityMismatch,
    NotAnLValue,
    ConstAssign,
    BadCaseRange,
    DuplicateLabel,
    UnknownLabel,
    NonConstInConst,
    InvalidForStep,
    RecordFieldUnknown,
}

impl DiagnosticKind {
    /// The stable name shown in diagnostic output.
    pub const fn name(self) -> &'static str {
        match self {
            DiagnosticKind::UnterminatedString => "UnterminatedString",
            DiagnosticKind::InvalidNumber => "InvalidNumber",
            DiagnosticKind::IllegalCharacter => "IllegalCharacter",
            DiagnosticKind::UnexpectedToken => "UnexpectedToken",
            DiagnosticKind::ExpectedEndOfLine => "ExpectedEndOfLine",
            DiagnosticKind::TypeMismatch => "TypeMismatch",
            DiagnosticKind::Undeclared => "Undeclared",
            DiagnosticKind::Redeclared => "Redeclared",
            DiagnosticKind::ArityMismatch => "ArityMismatch",
            DiagnosticKind::NotAnLValue => "NotAnLValue",
            DiagnosticKind::ConstAssign => "ConstAssign",
            DiagnosticKind::BadCaseRange => "BadCaseRange",
            DiagnosticKind::DuplicateLabel => "DuplicateLabel",
            DiagnosticKind::UnknownLabel => "UnknownLabel",
            DiagnosticKind::NonConstInConst => "NonConstInConst",
            DiagnosticKind::InvalidForStep => "InvalidForStep",
            DiagnosticKind::RecordFieldUnknown => "RecordFieldUnknown",
        }
    }

    /// The default severity for this kind.
    ///
    /// Everything is an error except `InvalidForStep`, which the language
    /// defines as a warning (the loop still terminates at runtime).
    pub const fn default_level(self) -> Level {
        match self {
            DiagnosticKind::InvalidForStep => Level::Warning,
            _ => Level::Error,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single diagnostic message with severity, kind and location.
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub level: Level,
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Span,
    /// Additional context lines, printed after the main message.
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            level: kind.default_level(),
            kind,
            message: message.into(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Collects diagnostics across all pipeline phases.
///
/// Phases hold a shared reference; interior mutability keeps reporting
/// ergonomic from deep inside recursive walks.
///
/// # Examples
///
/// ```
/// use qbc_util::{Handler, DiagnosticKind, Span};
///
/// let handler = Handler::new();
/// handler.report(DiagnosticKind::Undeclared, "unknown variable X%", Span::DUMMY);
/// assert!(handler.has_errors());
/// assert_eq!(handler.error_count(), 1);
/// ```
#[derive(Default)]
pub struct Handler {
    diagnostics: RefCell<Vec<Diagnostic>>,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a diagnostic of `kind` at its default severity.
    pub fn report(&self, kind: DiagnosticKind, message: impl Into<String>, span: Span) {
        self.emit(Diagnostic::new(kind, message, span));
    }

    /// Emit a pre-built diagnostic.
    pub fn emit(&self, diagnostic: Diagnostic) {
        self.diagnostics.borrow_mut().push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .borrow()
            .iter()
            .any(|d| d.level == Level::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level == Level::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.diagnostics
            .borrow()
            .iter()
            .filter(|d| d.level == Level::Warning)
            .count()
    }

    /// Drain every collected diagnostic, leaving the handler empty.
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics.borrow_mut())
    }

    /// Snapshot of all diagnostics collected so far.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_and_count() {
        let handler = Handler::new();
        assert!(!handler.has_errors());

        handler.report(DiagnosticKind::TypeMismatch, "INTEGER vs STRING", Span::DUMMY);
        handler.report(DiagnosticKind::InvalidForStep, "STEP is zero", Span::DUMMY);

        assert!(handler.has_errors());
        assert_eq!(handler.error_count(), 1);
        assert_eq!(handler.warning_count(), 1);
    }

    #[test]
    fn test_invalid_for_step_is_warning() {
        assert_eq!(DiagnosticKind::InvalidForStep.default_level(), Level::Warning);
        assert_eq!(DiagnosticKind::TypeMismatch.default_level(), Level::Error);
    }

    #[test]
    fn test_take_drains() {
        let handler = Handler::new();
        handler.report(DiagnosticKind::Undeclared, "X", Span::DUMMY);
        let taken = handler.take();
        assert_eq!(taken.len(), 1);
        assert!(!handler.has_errors());
    }

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(DiagnosticKind::UnterminatedString.name(), "UnterminatedString");
        assert_eq!(DiagnosticKind::RecordFieldUnknown.name(), "RecordFieldUnknown");
        assert_eq!(format!("{}", DiagnosticKind::UnknownLabel), "UnknownLabel");
    }

    #[test]
    fn test_notes_attach() {
        let diag = Diagnostic::new(DiagnosticKind::ArityMismatch, "expected 2 arguments", Span::DUMMY)
            .with_note("SUB declared here");
        assert_eq!(diag.notes.len(), 1);
    }
}
