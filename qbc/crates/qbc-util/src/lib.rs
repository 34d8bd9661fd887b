//! qbc-util - Shared infrastructure for the QBasic compiler pipeline.
//!
//! This crate hosts everything the phase crates have in common:
//!
//! - [`Span`] / [`FileId`] / [`SourceMap`] for source location tracking,
//! - [`Diagnostic`] / [`Handler`] for collecting compile-time diagnostics,
//! - [`Symbol`] for interned, case-folded identifier names.
//!
//! The dialect is case-insensitive, so symbols intern the upper-cased
//! spelling while tokens elsewhere retain the exact source slice.

pub mod diagnostic;
pub mod span;
pub mod symbol;

pub use diagnostic::{Diagnostic, DiagnosticKind, Handler, Level};
pub use span::{FileId, SourceFile, SourceMap, Span};
pub use symbol::Symbol;
