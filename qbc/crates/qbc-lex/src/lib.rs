//! qbc-lex - Lexical analysis for the QBasic dialect.
//!
//! The lexer turns a source buffer into a flat token sequence with spans.
//! Dialect-specific rules handled here:
//!
//! - keywords are case-insensitive; the token span preserves the original
//!   spelling so the stream round-trips to the source,
//! - a type sigil (`%` `&` `&&` `!` `#` `$`) after an identifier is part
//!   of the name; a sigiled word is never a keyword (`STRING$` is the
//!   intrinsic, `STRING` the type name),
//! - end-of-line is a token; `:` is ordinary punctuation the parser
//!   treats as a statement separator,
//! - comments start with `'` or `REM` and run to end of line,
//! - a lone `_` before end-of-line continues the logical line,
//! - numeric literals come in decimal, `&H` hex and `&O` octal forms
//!   with optional suffix sigils,
//! - string literals have no escapes; `""` inside a literal is one `"`,
//! - `$WORD` at the start of a logical line is a metacommand.
//!
//! Lexical errors are reported through the shared diagnostic handler and
//! the offending input is skipped, so one bad character does not hide
//! later diagnostics.

pub mod cursor;
mod token;

pub use token::{Kw, Meta, NumLit, Punct, Token, TokenKind};

use qbc_util::{DiagnosticKind, FileId, Handler, Span, Symbol};

use cursor::Cursor;

/// The lexer. Produces the whole token stream in one call.
pub struct Lexer<'a> {
    cursor: Cursor<'a>,
    source: &'a str,
    file_id: FileId,
    handler: &'a Handler,
    tokens: Vec<Token>,
    /// True until the first token of the current logical line is produced.
    at_line_start: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str, file_id: FileId, handler: &'a Handler) -> Self {
        Self {
            cursor: Cursor::new(source),
            source,
            file_id,
            handler,
            tokens: Vec::new(),
            at_line_start: true,
        }
    }

    /// Tokenize the whole buffer. The stream always ends with `Eof`.
    pub fn tokenize(mut self) -> Vec<Token> {
        loop {
            self.cursor.skip_blanks();
            let start = self.mark();
            let Some(b) = self.cursor.current() else {
                self.push(TokenKind::Eof, start);
                break;
            };
            match b {
                b'\n' | b'\r' => self.lex_eol(start),
                b'\'' => self.skip_comment(),
                b'"' => self.lex_string(start),
                b'$' if self.at_line_start => self.lex_metacommand(start),
                b'&' if matches!(self.cursor.peek(1), Some(b) if b.eq_ignore_ascii_case(&b'H') || b.eq_ignore_ascii_case(&b'O')) => {
                    self.lex_radix_number(start)
                }
                b'0'..=b'9' => self.lex_number(start),
                b'.' if matches!(self.cursor.peek(1), Some(b'0'..=b'9')) => self.lex_number(start),
                b'_' if !matches!(self.cursor.peek(1), Some(c) if c.is_ascii_alphanumeric()) => {
                    self.lex_continuation()
                }
                b if b.is_ascii_alphabetic() || b == b'_' => self.lex_word(start),
                _ => self.lex_punct(start),
            }
        }
        self.tokens
    }

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    fn mark(&self) -> (usize, u32, u32) {
        (self.cursor.position(), self.cursor.line(), self.cursor.column())
    }

    fn span_from(&self, start: (usize, u32, u32)) -> Span {
        Span::with_file(start.0, self.cursor.position(), self.file_id, start.1, start.2)
    }

    fn push(&mut self, kind: TokenKind, start: (usize, u32, u32)) {
        let span = self.span_from(start);
        self.at_line_start = matches!(kind, TokenKind::Eol);
        self.tokens.push(Token::new(kind, span));
    }

    fn error(&self, kind: DiagnosticKind, message: impl Into<String>, start: (usize, u32, u32)) {
        self.handler.report(kind, message, self.span_from(start));
    }

    // -------------------------------------------------------------------
    // Scanners
    // -------------------------------------------------------------------

    fn lex_eol(&mut self, start: (usize, u32, u32)) {
        // CRLF and lone CR both collapse to one Eol token.
        if self.cursor.current() == Some(b'\r') {
            self.cursor.advance();
            self.cursor.eat(b'\n');
        } else {
            self.cursor.advance();
        }
        self.push(TokenKind::Eol, start);
    }

    fn skip_comment(&mut self) {
        while !matches!(self.cursor.current(), None | Some(b'\n') | Some(b'\r')) {
            self.cursor.advance();
        }
    }

    /// `_` before end-of-line glues the next physical line on.
    fn lex_continuation(&mut self) {
        let start = self.mark();
        self.cursor.advance();
        self.cursor.skip_blanks();
        match self.cursor.current() {
            Some(b'\r') => {
                self.cursor.advance();
                self.cursor.eat(b'\n');
            }
            Some(b'\n') => self.cursor.advance(),
            None => {}
            _ => self.error(
                DiagnosticKind::IllegalCharacter,
                "`_` line continuation must end the line",
                start,
            ),
        }
    }

    fn lex_word(&mut self, start: (usize, u32, u32)) {
        while matches!(self.cursor.current(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.cursor.advance();
        }
        let word = self.cursor.slice_from(start.0);
        let upper = word.to_ascii_uppercase();

        if upper == "REM" {
            self.skip_comment();
            return;
        }

        let sigil = self.eat_sigil();
        if sigil.is_empty() {
            if let Some(kw) = Kw::from_upper(&upper) {
                self.push(TokenKind::Kw(kw), start);
                return;
            }
            self.push(TokenKind::Ident(Symbol::intern(word)), start);
        } else {
            // Sigil is part of the name; a sigiled word is never a keyword.
            let name = format!("{word}{sigil}");
            self.push(TokenKind::Ident(Symbol::intern(&name)), start);
        }
    }

    /// Consume a trailing type sigil, longest match first (`&&` over `&`).
    fn eat_sigil(&mut self) -> &'static str {
        match self.cursor.current() {
            Some(b'%') => {
                self.cursor.advance();
                "%"
            }
            Some(b'&') => {
                self.cursor.advance();
                if self.cursor.eat(b'&') {
                    "&&"
                } else {
                    "&"
                }
            }
            Some(b'!') => {
                self.cursor.advance();
                "!"
            }
            Some(b'#') => {
                self.cursor.advance();
                "#"
            }
            Some(b'$') => {
                self.cursor.advance();
                "$"
            }
            _ => "",
        }
    }

    fn lex_number(&mut self, start: (usize, u32, u32)) {
        let mut is_float = false;
        let mut is_double_exp = false;
        let mut text = String::new();

        while matches!(self.cursor.current(), Some(b'0'..=b'9')) {
            text.push(self.cursor.current().unwrap() as char);
            self.cursor.advance();
        }
        if self.cursor.current() == Some(b'.') {
            is_float = true;
            text.push('.');
            self.cursor.advance();
            while matches!(self.cursor.current(), Some(b'0'..=b'9')) {
                text.push(self.cursor.current().unwrap() as char);
                self.cursor.advance();
            }
        }
        if matches!(self.cursor.current(), Some(b) if b.eq_ignore_ascii_case(&b'E') || b.eq_ignore_ascii_case(&b'D')) {
            // Only an exponent when a digit (or signed digit) follows;
            // otherwise `E` starts the next identifier, e.g. `10 END`.
            let next = self.cursor.peek(1);
            let next2 = self.cursor.peek(2);
            let exp_follows = matches!(next, Some(b'0'..=b'9'))
                || (matches!(next, Some(b'+') | Some(b'-')) && matches!(next2, Some(b'0'..=b'9')));
            if exp_follows {
                is_float = true;
                is_double_exp = self.cursor.current().unwrap().eq_ignore_ascii_case(&b'D');
                text.push('E');
                self.cursor.advance();
                if matches!(self.cursor.current(), Some(b'+') | Some(b'-')) {
                    text.push(self.cursor.current().unwrap() as char);
                    self.cursor.advance();
                }
                while matches!(self.cursor.current(), Some(b'0'..=b'9')) {
                    text.push(self.cursor.current().unwrap() as char);
                    self.cursor.advance();
                }
            }
        }

        let sigil = self.eat_sigil();
        let lit = if is_float || matches!(sigil, "!" | "#") {
            self.classify_float(&text, sigil, is_double_exp, start)
        } else {
            self.classify_int(&text, sigil, start)
        };
        match lit {
            Some(lit) => self.push(TokenKind::Number(lit), start),
            None => self.push(TokenKind::Number(NumLit::Int16(0)), start),
        }
    }

    fn classify_float(
        &self,
        text: &str,
        sigil: &str,
        double_exp: bool,
        start: (usize, u32, u32),
    ) -> Option<NumLit> {
        let value: f64 = match text.parse() {
            Ok(v) => v,
            Err(_) => {
                self.error(DiagnosticKind::InvalidNumber, format!("malformed number `{text}`"), start);
                return None;
            }
        };
        Some(match sigil {
            "#" => NumLit::Double(value),
            "!" => NumLit::Single(value as f32),
            "%" => NumLit::Int16(self.rounded_int(value, i16::MIN as f64, i16::MAX as f64, start)? as i16),
            "&" => NumLit::Int32(self.rounded_int(value, i32::MIN as f64, i32::MAX as f64, start)? as i32),
            "&&" => NumLit::Int64(self.rounded_int(value, i64::MIN as f64, i64::MAX as f64, start)?),
            _ if double_exp => NumLit::Double(value),
            _ => NumLit::Single(value as f32),
        })
    }

    fn rounded_int(&self, value: f64, min: f64, max: f64, start: (usize, u32, u32)) -> Option<i64> {
        let rounded = value.round();
        if rounded < min || rounded > max {
            self.error(DiagnosticKind::InvalidNumber, "numeric literal out of range", start);
            return None;
        }
        Some(rounded as i64)
    }

    fn classify_int(&self, text: &str, sigil: &str, start: (usize, u32, u32)) -> Option<NumLit> {
        let value: u64 = match text.parse() {
            Ok(v) => v,
            Err(_) => {
                self.error(DiagnosticKind::InvalidNumber, format!("malformed number `{text}`"), start);
                return None;
            }
        };
        self.fit_int(value, sigil, start)
    }

    fn fit_int(&self, value: u64, sigil: &str, start: (usize, u32, u32)) -> Option<NumLit> {
        let out_of_range = || {
            self.error(DiagnosticKind::InvalidNumber, "numeric literal out of range", start);
            None
        };
        match sigil {
            "%" => {
                if value > i16::MAX as u64 {
                    return out_of_range();
                }
                Some(NumLit::Int16(value as i16))
            }
            "&" => {
                if value > i32::MAX as u64 {
                    return out_of_range();
                }
                Some(NumLit::Int32(value as i32))
            }
            "&&" => {
                if value > i64::MAX as u64 {
                    return out_of_range();
                }
                Some(NumLit::Int64(value as i64))
            }
            _ => {
                if value <= i16::MAX as u64 {
                    Some(NumLit::Int16(value as i16))
                } else if value <= i32::MAX as u64 {
                    Some(NumLit::Int32(value as i32))
                } else if value <= i64::MAX as u64 {
                    Some(NumLit::Int64(value as i64))
                } else {
                    out_of_range()
                }
            }
        }
    }

    /// `&H..` / `&O..` literals. The digits are a bit pattern: `&HFFFF`
    /// is INTEGER -1, matching the classic width-by-magnitude rule.
    fn lex_radix_number(&mut self, start: (usize, u32, u32)) {
        self.cursor.advance(); // '&'
        let radix = if self.cursor.eat_ignore_case(b'H') { 16 } else {
            self.cursor.advance(); // 'O'
            8
        };
        let digits_start = self.cursor.position();
        while matches!(self.cursor.current(), Some(b) if (b as char).is_digit(radix)) {
            self.cursor.advance();
        }
        let digits = self.cursor.slice_from(digits_start);
        let sigil = match self.cursor.current() {
            Some(b'&') => {
                self.cursor.advance();
                if self.cursor.eat(b'&') { "&&" } else { "&" }
            }
            Some(b'%') => {
                self.cursor.advance();
                "%"
            }
            _ => "",
        };
        if digits.is_empty() {
            self.error(DiagnosticKind::InvalidNumber, "missing digits after radix prefix", start);
            self.push(TokenKind::Number(NumLit::Int16(0)), start);
            return;
        }
        let value = match u64::from_str_radix(digits, radix) {
            Ok(v) => v,
            Err(_) => {
                self.error(DiagnosticKind::InvalidNumber, "radix literal out of range", start);
                self.push(TokenKind::Number(NumLit::Int16(0)), start);
                return;
            }
        };
        let lit = match sigil {
            "%" => {
                if value <= u16::MAX as u64 {
                    Some(NumLit::Int16(value as u16 as i16))
                } else {
                    self.error(DiagnosticKind::InvalidNumber, "radix literal out of range", start);
                    None
                }
            }
            "&" => {
                if value <= u32::MAX as u64 {
                    Some(NumLit::Int32(value as u32 as i32))
                } else {
                    self.error(DiagnosticKind::InvalidNumber, "radix literal out of range", start);
                    None
                }
            }
            "&&" => Some(NumLit::Int64(value as i64)),
            _ => {
                if value <= u16::MAX as u64 {
                    Some(NumLit::Int16(value as u16 as i16))
                } else if value <= u32::MAX as u64 {
                    Some(NumLit::Int32(value as u32 as i32))
                } else {
                    Some(NumLit::Int64(value as i64))
                }
            }
        };
        self.push(TokenKind::Number(lit.unwrap_or(NumLit::Int16(0))), start);
    }

    fn lex_string(&mut self, start: (usize, u32, u32)) {
        self.cursor.advance(); // opening quote
        let mut bytes = Vec::new();
        let mut seg_start = self.cursor.position();
        loop {
            match self.cursor.current() {
                None | Some(b'\n') | Some(b'\r') => {
                    bytes.extend_from_slice(self.source[seg_start..self.cursor.position()].as_bytes());
                    self.error(DiagnosticKind::UnterminatedString, "unterminated string literal", start);
                    break;
                }
                Some(b'"') => {
                    bytes.extend_from_slice(self.source[seg_start..self.cursor.position()].as_bytes());
                    self.cursor.advance();
                    if self.cursor.current() == Some(b'"') {
                        // Doubled quote: one literal quote character.
                        bytes.push(b'"');
                        self.cursor.advance();
                        seg_start = self.cursor.position();
                        continue;
                    }
                    break;
                }
                Some(_) => self.cursor.advance(),
            }
        }
        self.push(TokenKind::StringLit(bytes), start);
    }

    fn lex_metacommand(&mut self, start: (usize, u32, u32)) {
        self.cursor.advance(); // '$'
        let word_start = self.cursor.position();
        while matches!(self.cursor.current(), Some(b) if b.is_ascii_alphanumeric()) {
            self.cursor.advance();
        }
        let word = self.cursor.slice_from(word_start).to_ascii_uppercase();
        match word.as_str() {
            "CONSOLE" => self.push(TokenKind::MetaCommand(Meta::Console), start),
            "INCLUDE" => {
                self.cursor.skip_blanks();
                if !self.cursor.eat(b':') {
                    self.error(DiagnosticKind::IllegalCharacter, "expected `:` after $INCLUDE", start);
                    return;
                }
                self.cursor.skip_blanks();
                let quote = match self.cursor.current() {
                    Some(q @ (b'\'' | b'"')) => q,
                    _ => {
                        self.error(DiagnosticKind::IllegalCharacter, "expected quoted path after $INCLUDE:", start);
                        return;
                    }
                };
                self.cursor.advance();
                let path_start = self.cursor.position();
                while !matches!(self.cursor.current(), None | Some(b'\n') | Some(b'\r')) && self.cursor.current() != Some(quote) {
                    self.cursor.advance();
                }
                let path = self.cursor.slice_from(path_start).to_string();
                if !self.cursor.eat(quote) {
                    self.error(DiagnosticKind::UnterminatedString, "unterminated $INCLUDE path", start);
                }
                self.push(TokenKind::MetaCommand(Meta::Include(path)), start);
            }
            _ => {
                self.error(
                    DiagnosticKind::IllegalCharacter,
                    format!("unknown metacommand `${word}`"),
                    start,
                );
            }
        }
    }

    fn lex_punct(&mut self, start: (usize, u32, u32)) {
        let b = self.cursor.current().unwrap();
        let punct = match b {
            b'(' => Some(Punct::LParen),
            b')' => Some(Punct::RParen),
            b',' => Some(Punct::Comma),
            b';' => Some(Punct::Semicolon),
            b':' => Some(Punct::Colon),
            b'#' => Some(Punct::Hash),
            b'.' => Some(Punct::Period),
            b'+' => Some(Punct::Plus),
            b'-' => Some(Punct::Minus),
            b'*' => Some(Punct::Star),
            b'/' => Some(Punct::Slash),
            b'\\' => Some(Punct::Backslash),
            b'^' => Some(Punct::Caret),
            b'=' => Some(Punct::Eq),
            b'<' => {
                self.cursor.advance();
                let p = if self.cursor.eat(b'=') {
                    Punct::Le
                } else if self.cursor.eat(b'>') {
                    Punct::Ne
                } else {
                    Punct::Lt
                };
                self.push(TokenKind::Punct(p), start);
                return;
            }
            b'>' => {
                self.cursor.advance();
                let p = if self.cursor.eat(b'=') { Punct::Ge } else { Punct::Gt };
                self.push(TokenKind::Punct(p), start);
                return;
            }
            _ => None,
        };
        match punct {
            Some(p) => {
                self.cursor.advance();
                self.push(TokenKind::Punct(p), start);
            }
            None => {
                self.error(
                    DiagnosticKind::IllegalCharacter,
                    format!("illegal character `{}`", b as char),
                    start,
                );
                self.cursor.advance();
            }
        }
    }
}

/// Convenience: tokenize a buffer in one call.
pub fn tokenize(source: &str, file_id: FileId, handler: &Handler) -> Vec<Token> {
    Lexer::new(source, file_id, handler).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lex(src: &str) -> (Vec<Token>, Handler) {
        let handler = Handler::new();
        let tokens = tokenize(src, FileId::DUMMY, &handler);
        (tokens, handler)
    }

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src).0.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            kinds("print Print PRINT"),
            vec![
                TokenKind::Kw(Kw::Print),
                TokenKind::Kw(Kw::Print),
                TokenKind::Kw(Kw::Print),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_sigiled_word_is_ident_not_keyword() {
        let k = kinds("STRING$");
        assert_eq!(k[0], TokenKind::Ident(Symbol::intern("STRING$")));
    }

    #[test]
    fn test_ident_sigils_distinguish() {
        let k = kinds("A% A! A");
        assert_eq!(k[0], TokenKind::Ident(Symbol::intern("A%")));
        assert_eq!(k[1], TokenKind::Ident(Symbol::intern("A!")));
        assert_eq!(k[2], TokenKind::Ident(Symbol::intern("A")));
    }

    #[test]
    fn test_integer_width_selection() {
        assert_eq!(kinds("5")[0], TokenKind::Number(NumLit::Int16(5)));
        assert_eq!(kinds("40000")[0], TokenKind::Number(NumLit::Int32(40000)));
        assert_eq!(
            kinds("9223372036854775807&&")[0],
            TokenKind::Number(NumLit::Int64(i64::MAX))
        );
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(kinds("1.5")[0], TokenKind::Number(NumLit::Single(1.5)));
        assert_eq!(kinds("1.5#")[0], TokenKind::Number(NumLit::Double(1.5)));
        assert_eq!(kinds("2E3")[0], TokenKind::Number(NumLit::Single(2000.0)));
        assert_eq!(kinds("2D3")[0], TokenKind::Number(NumLit::Double(2000.0)));
        assert_eq!(kinds(".5")[0], TokenKind::Number(NumLit::Single(0.5)));
    }

    #[test]
    fn test_exponent_needs_digits() {
        // `10 END` must not swallow the E of END as an exponent.
        let k = kinds("10 END");
        assert_eq!(k[0], TokenKind::Number(NumLit::Int16(10)));
        assert_eq!(k[1], TokenKind::Kw(Kw::End));
    }

    #[test]
    fn test_hex_and_octal() {
        assert_eq!(kinds("&HFF")[0], TokenKind::Number(NumLit::Int16(255)));
        assert_eq!(kinds("&HFFFF")[0], TokenKind::Number(NumLit::Int16(-1)));
        assert_eq!(kinds("&H10000")[0], TokenKind::Number(NumLit::Int32(0x10000)));
        assert_eq!(kinds("&O777")[0], TokenKind::Number(NumLit::Int16(0o777)));
    }

    #[test]
    fn test_string_literal_doubled_quote() {
        let k = kinds(r#""say ""hi""""#);
        assert_eq!(k[0], TokenKind::StringLit(b"say \"hi\"".to_vec()));
    }

    #[test]
    fn test_unterminated_string_reports() {
        let (_, handler) = lex("\"abc\nPRINT");
        assert!(handler.has_errors());
        let diags = handler.diagnostics();
        assert_eq!(diags[0].kind, DiagnosticKind::UnterminatedString);
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("PRINT 1 ' trailing\nREM whole line\nPRINT 2"),
            vec![
                TokenKind::Kw(Kw::Print),
                TokenKind::Number(NumLit::Int16(1)),
                TokenKind::Eol,
                TokenKind::Eol,
                TokenKind::Kw(Kw::Print),
                TokenKind::Number(NumLit::Int16(2)),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_eol_variants() {
        let k = kinds("A\nB\r\nC\rD");
        let eols = k.iter().filter(|k| matches!(k, TokenKind::Eol)).count();
        assert_eq!(eols, 3);
    }

    #[test]
    fn test_line_continuation() {
        let k = kinds("PRINT _\n 1");
        assert_eq!(
            k,
            vec![
                TokenKind::Kw(Kw::Print),
                TokenKind::Number(NumLit::Int16(1)),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_metacommand_console() {
        let k = kinds("$CONSOLE\nPRINT 1");
        assert_eq!(k[0], TokenKind::MetaCommand(Meta::Console));
    }

    #[test]
    fn test_metacommand_include() {
        let k = kinds("$INCLUDE:'defs.bi'");
        assert_eq!(k[0], TokenKind::MetaCommand(Meta::Include("defs.bi".into())));
    }

    #[test]
    fn test_dollar_mid_line_is_error() {
        let (_, handler) = lex("PRINT $CONSOLE");
        assert!(handler.has_errors());
    }

    #[test]
    fn test_relational_operators() {
        assert_eq!(
            kinds("< <= > >= <> ="),
            vec![
                TokenKind::Punct(Punct::Lt),
                TokenKind::Punct(Punct::Le),
                TokenKind::Punct(Punct::Gt),
                TokenKind::Punct(Punct::Ge),
                TokenKind::Punct(Punct::Ne),
                TokenKind::Punct(Punct::Eq),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_illegal_character() {
        let (_, handler) = lex("PRINT @");
        let diags = handler.diagnostics();
        assert_eq!(diags[0].kind, DiagnosticKind::IllegalCharacter);
    }

    /// Reconstruct the source from token spans plus the gaps between them.
    fn round_trip(src: &str) -> String {
        let handler = Handler::new();
        let tokens = tokenize(src, FileId::DUMMY, &handler);
        let mut out = String::new();
        let mut prev_end = 0;
        for tok in &tokens {
            if tok.is_eof() {
                break;
            }
            out.push_str(&src[prev_end..tok.span.start]);
            out.push_str(&src[tok.span.start..tok.span.end]);
            prev_end = tok.span.end;
        }
        out.push_str(&src[prev_end..]);
        out
    }

    #[test]
    fn test_round_trip_simple() {
        let src = "PRINT \"Hello\"  ' greet\nFOR i = 1 TO 10: PRINT i;: NEXT i\n";
        assert_eq!(round_trip(src), src);
    }

    proptest! {
        #[test]
        fn prop_round_trip_ascii(src in "[ -~\n]{0,200}") {
            // Spans must tile the source in order regardless of content.
            prop_assert_eq!(round_trip(&src), src);
        }

        #[test]
        fn prop_round_trip_programs(
            name in "[A-Za-z][A-Za-z0-9]{0,5}",
            n in 0i64..100000,
        ) {
            let src = format!("DIM {name} AS LONG\n{name} = {n}\nPRINT {name}\n");
            prop_assert_eq!(round_trip(&src), src.clone());
        }
    }
}
