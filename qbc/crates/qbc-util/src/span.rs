//! Source location tracking.
//!
//! Byte offsets index into the original UTF-8 buffer; line and column are
//! 1-based and kept alongside so diagnostics never need to re-scan the
//! source. A [`SourceMap`] owns every file fed to the pipeline (the main
//! module plus any `$INCLUDE`d files) and renders snippets for reporting.

use std::fmt;

/// A unique identifier for a source file registered in a [`SourceMap`].
///
/// Ids are assigned sequentially as files are added.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    /// A dummy id for spans that do not belong to a real file.
    pub const DUMMY: FileId = FileId(0);

    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A range in source code.
///
/// # Examples
///
/// ```
/// use qbc_util::Span;
///
/// let a = Span::new(0, 5, 1, 1);
/// let b = Span::new(6, 9, 1, 7);
/// let merged = a.merge(b);
/// assert_eq!(merged.start, 0);
/// assert_eq!(merged.end, 9);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    /// Start byte offset in source.
    pub start: usize,
    /// End byte offset in source (exclusive).
    pub end: usize,
    /// Line number (1-based).
    pub line: u32,
    /// Column number (1-based).
    pub column: u32,
    /// File the span belongs to.
    pub file_id: FileId,
}

impl Span {
    pub const DUMMY: Span = Span {
        start: 0,
        end: 0,
        line: 0,
        column: 0,
        file_id: FileId::DUMMY,
    };

    #[inline]
    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
            file_id: FileId::DUMMY,
        }
    }

    #[inline]
    pub fn with_file(start: usize, end: usize, file_id: FileId, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
            file_id,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Merge two spans into a single span covering both.
    ///
    /// Spans from different files keep `self`'s file id.
    #[inline]
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line: self.line.min(other.line),
            column: if other.line < self.line { other.column } else { self.column },
            file_id: self.file_id,
        }
    }

    #[inline]
    pub fn with_file_id(mut self, file_id: FileId) -> Self {
        self.file_id = file_id;
        self
    }
}

/// A single source file held by the [`SourceMap`].
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Display name (usually the path as given on the command line).
    pub name: String,
    /// Full file contents.
    pub src: String,
    /// Byte offsets of line starts, for offset → line lookups.
    line_starts: Vec<usize>,
}

impl SourceFile {
    fn new(name: String, src: String) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            name,
            src,
            line_starts,
        }
    }

    /// The 1-based line number containing `offset`.
    pub fn line_of(&self, offset: usize) -> u32 {
        match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx as u32 + 1,
            Err(idx) => idx as u32,
        }
    }

    /// The text of a 1-based line, without its terminator.
    pub fn line_text(&self, line: u32) -> Option<&str> {
        let idx = line.checked_sub(1)? as usize;
        let start = *self.line_starts.get(idx)?;
        let end = self
            .line_starts
            .get(idx + 1)
            .map(|&e| e.saturating_sub(1))
            .unwrap_or(self.src.len());
        let text = self.src.get(start..end)?;
        Some(text.strip_suffix('\r').unwrap_or(text))
    }
}

/// Registry of all source files in a compilation.
#[derive(Debug, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file and return its id.
    pub fn add_file(&mut self, name: impl Into<String>, src: impl Into<String>) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile::new(name.into(), src.into()));
        id
    }

    pub fn file(&self, id: FileId) -> Option<&SourceFile> {
        self.files.get(id.index())
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Render a `name:line:col` location for a span.
    pub fn location(&self, span: Span) -> String {
        match self.file(span.file_id) {
            Some(f) => format!("{}:{}:{}", f.name, span.line, span.column),
            None => format!("<unknown>:{}:{}", span.line, span.column),
        }
    }

    /// Render the source line a span points at, with a caret underline.
    pub fn snippet(&self, span: Span) -> Option<String> {
        let file = self.file(span.file_id)?;
        let text = file.line_text(span.line)?;
        let col = span.column.max(1) as usize;
        let width = span.len().max(1).min(text.len().saturating_sub(col - 1).max(1));
        let mut out = String::new();
        out.push_str(&format!("{:>5} | {}\n", span.line, text));
        out.push_str(&format!("      | {}{}", " ".repeat(col - 1), "^".repeat(width)));
        Some(out)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_merge() {
        let a = Span::new(10, 20, 1, 5);
        let b = Span::new(25, 35, 2, 1);
        let merged = a.merge(b);
        assert_eq!(merged.start, 10);
        assert_eq!(merged.end, 35);
        assert_eq!(merged.line, 1);
    }

    #[test]
    fn test_span_len() {
        let span = Span::new(10, 20, 1, 5);
        assert_eq!(span.len(), 10);
        assert!(!span.is_empty());
        assert!(Span::DUMMY.is_empty());
    }

    #[test]
    fn test_source_map_add_and_lookup() {
        let mut map = SourceMap::new();
        let id = map.add_file("prog.bas", "PRINT 1\nPRINT 2\n");
        assert_eq!(id, FileId(0));
        let file = map.file(id).unwrap();
        assert_eq!(file.line_text(1), Some("PRINT 1"));
        assert_eq!(file.line_text(2), Some("PRINT 2"));
        assert_eq!(file.line_text(4), None);
    }

    #[test]
    fn test_line_of_offset() {
        let mut map = SourceMap::new();
        let id = map.add_file("prog.bas", "AB\nCD\nEF");
        let file = map.file(id).unwrap();
        assert_eq!(file.line_of(0), 1);
        assert_eq!(file.line_of(2), 1);
        assert_eq!(file.line_of(3), 2);
        assert_eq!(file.line_of(7), 3);
    }

    #[test]
    fn test_location_rendering() {
        let mut map = SourceMap::new();
        let id = map.add_file("prog.bas", "PRINT 1");
        let span = Span::with_file(0, 5, id, 1, 1);
        assert_eq!(map.location(span), "prog.bas:1:1");
    }

    #[test]
    fn test_snippet_caret() {
        let mut map = SourceMap::new();
        let id = map.add_file("prog.bas", "PRINT \"x\"");
        let span = Span::with_file(6, 9, id, 1, 7);
        let snip = map.snippet(span).unwrap();
        assert!(snip.contains("PRINT \"x\""));
        assert!(snip.contains("^^^"));
    }

    #[test]
    fn test_crlf_line_text() {
        let mut map = SourceMap::new();
        let id = map.add_file("prog.bas", "A\r\nB\r\n");
        let file = map.file(id).unwrap();
        assert_eq!(file.line_text(1), Some("A"));
        assert_eq!(file.line_text(2), Some("B"));
    }
}
