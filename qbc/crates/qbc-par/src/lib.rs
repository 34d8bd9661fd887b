//! qbc-par - Recursive-descent parser for the QBasic dialect.
//!
//! Statements are parsed by one `parse_*` function per form; expressions
//! go through a Pratt sub-parser (see [`expr`]). The grammar is
//! line-oriented: `Eol` tokens are significant, `:` separates statements
//! within a line, and a handful of forms (single-line `IF`, `DATA`)
//! change how far a statement reaches.
//!
//! Ambiguities resolved by lookahead:
//!
//! - single-line vs block `IF` is decided by whether a token follows
//!   `THEN` on the same line,
//! - `ident:` in statement position is a label, a bare integer at the
//!   start of a logical line is a line-number label,
//! - a statement starting with an identifier is an assignment when `=`
//!   follows the l-value shape, otherwise an implicit `CALL`.
//!
//! The parser recovers from errors by skipping to the next statement
//! boundary, so several syntax errors can be reported in one run.

pub mod ast;
mod expr;

pub use ast::*;

use qbc_lex::{Kw, Meta, NumLit, Punct, Token, TokenKind};
use qbc_util::{DiagnosticKind, Handler, Span, Symbol};

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    handler: &'a Handler,
    next_expr_id: u32,
    console: bool,
    in_proc: bool,
}

/// Which block construct a statement list belongs to; decides the
/// terminating tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockCtx {
    If,
    Select,
    For,
    While,
    Do,
    Proc,
    TopLevel,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, handler: &'a Handler) -> Self {
        Self {
            tokens,
            pos: 0,
            handler,
            next_expr_id: 0,
            console: false,
            in_proc: false,
        }
    }

    /// Parse a whole module.
    pub fn parse(mut self) -> Program {
        let stmts = self.parse_stmt_list(BlockCtx::TopLevel);
        Program {
            stmts,
            console: self.console,
        }
    }

    // -------------------------------------------------------------------
    // Token access
    // -------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn nth_kind(&self, n: usize) -> &TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn span(&self) -> Span {
        self.peek().span
    }

    fn check_kw(&self, kw: Kw) -> bool {
        matches!(self.peek_kind(), TokenKind::Kw(k) if *k == kw)
    }

    fn check_punct(&self, p: Punct) -> bool {
        matches!(self.peek_kind(), TokenKind::Punct(q) if *q == p)
    }

    fn eat_kw(&mut self, kw: Kw) -> bool {
        if self.check_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, p: Punct) -> bool {
        if self.check_punct(p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: Kw, what: &str) -> bool {
        if self.eat_kw(kw) {
            true
        } else {
            self.unexpected(what);
            false
        }
    }

    fn expect_punct(&mut self, p: Punct, what: &str) -> bool {
        if self.eat_punct(p) {
            true
        } else {
            self.unexpected(what);
            false
        }
    }

    fn expect_ident(&mut self, what: &str) -> Option<Symbol> {
        match self.peek_kind() {
            TokenKind::Ident(sym) => {
                let sym = *sym;
                self.bump();
                Some(sym)
            }
            _ => {
                self.unexpected(what);
                None
            }
        }
    }

    fn unexpected(&self, what: &str) {
        self.handler.report(
            DiagnosticKind::UnexpectedToken,
            format!("expected {what}, found {}", describe(self.peek_kind())),
            self.span(),
        );
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eof)
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek_kind(), TokenKind::Eol | TokenKind::Eof)
    }

    fn at_stmt_end(&self) -> bool {
        self.at_line_end() || self.check_punct(Punct::Colon)
    }

    /// True when the current token opens a logical line (nothing before
    /// it on the line but possibly a label).
    fn at_line_start(&self) -> bool {
        self.pos == 0 || matches!(self.tokens[self.pos - 1].kind, TokenKind::Eol)
    }

    fn skip_to_stmt_end(&mut self) {
        while !self.at_stmt_end() {
            self.bump();
        }
    }

    fn eat_separators(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Eol)
            || self.check_punct(Punct::Colon)
        {
            self.bump();
        }
    }

    /// Consume the end of a simple statement, complaining if anything
    /// trails it. `ELSE` is tolerated so single-line IF branches can end
    /// a statement without a separator.
    fn finish_stmt(&mut self) {
        if !self.at_stmt_end() && !self.check_kw(Kw::Else) {
            self.handler.report(
                DiagnosticKind::ExpectedEndOfLine,
                format!("expected end of statement, found {}", describe(self.peek_kind())),
                self.span(),
            );
            self.skip_to_stmt_end();
        }
    }

    fn mk_expr(&mut self, kind: ExprKind, span: Span) -> Expr {
        let id = ExprId(self.next_expr_id);
        self.next_expr_id += 1;
        Expr { id, kind, span }
    }

    // -------------------------------------------------------------------
    // Statement lists and blocks
    // -------------------------------------------------------------------

    fn parse_stmt_list(&mut self, ctx: BlockCtx) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        loop {
            self.eat_separators();
            if self.at_eof() || self.block_ends(ctx) {
                break;
            }
            if let Some(stmt) = self.parse_stmt() {
                stmts.push(stmt);
            }
        }
        stmts
    }

    /// Does the current token terminate a `ctx` block? Never consumes.
    fn block_ends(&self, ctx: BlockCtx) -> bool {
        match ctx {
            BlockCtx::TopLevel => false,
            BlockCtx::If => {
                self.check_kw(Kw::ElseIf)
                    || self.check_kw(Kw::Else)
                    || (self.check_kw(Kw::End) && matches!(self.nth_kind(1), TokenKind::Kw(Kw::If)))
            }
            BlockCtx::Select => {
                self.check_kw(Kw::Case)
                    || (self.check_kw(Kw::End)
                        && matches!(self.nth_kind(1), TokenKind::Kw(Kw::Select)))
            }
            BlockCtx::For => self.check_kw(Kw::Next),
            BlockCtx::While => self.check_kw(Kw::Wend),
            BlockCtx::Do => self.check_kw(Kw::Loop),
            BlockCtx::Proc => {
                self.check_kw(Kw::End)
                    && matches!(
                        self.nth_kind(1),
                        TokenKind::Kw(Kw::Sub) | TokenKind::Kw(Kw::Function)
                    )
            }
        }
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn parse_stmt(&mut self) -> Option<Stmt> {
        let start = self.span();

        // Line-number label.
        if self.at_line_start() {
            if let TokenKind::Number(lit) = self.peek_kind() {
                let name = match line_number_symbol(*lit) {
                    Some(sym) => sym,
                    None => {
                        self.unexpected("a statement");
                        self.skip_to_stmt_end();
                        return None;
                    }
                };
                self.bump();
                return Some(Stmt {
                    kind: StmtKind::Label(name),
                    span: start,
                });
            }
        }

        // `ident:` label.
        if let TokenKind::Ident(sym) = self.peek_kind() {
            if matches!(self.nth_kind(1), TokenKind::Punct(Punct::Colon)) {
                let sym = *sym;
                self.bump();
                self.bump();
                return Some(Stmt {
                    kind: StmtKind::Label(sym),
                    span: start,
                });
            }
        }

        let kind = match self.peek_kind().clone() {
            TokenKind::MetaCommand(meta) => {
                self.bump();
                match meta {
                    Meta::Console => {
                        self.console = true;
                        return None;
                    }
                    Meta::Include(path) => StmtKind::Include(path),
                }
            }
            TokenKind::Kw(kw) => match kw {
                Kw::Dim => self.parse_dim(false)?,
                Kw::Redim => self.parse_dim(true)?,
                Kw::Let => {
                    self.bump();
                    self.parse_assign_or_call(true)?
                }
                Kw::Print => self.parse_print()?,
                Kw::Input => self.parse_input(false)?,
                Kw::Line => self.parse_input(true)?,
                Kw::If => return self.parse_if(start),
                Kw::Select => return self.parse_select(start),
                Kw::For => return self.parse_for(start),
                Kw::While => return self.parse_while(start),
                Kw::Do => return self.parse_do(start),
                Kw::Exit => self.parse_exit()?,
                Kw::Goto => {
                    self.bump();
                    StmtKind::Goto(self.parse_label_ref()?)
                }
                Kw::Gosub => {
                    self.bump();
                    StmtKind::Gosub(self.parse_label_ref()?)
                }
                Kw::Return => {
                    self.bump();
                    if self.at_stmt_end() {
                        StmtKind::Return(None)
                    } else {
                        StmtKind::Return(Some(self.parse_label_ref()?))
                    }
                }
                Kw::Const => self.parse_const()?,
                Kw::Type => return self.parse_type_def(start),
                Kw::Sub => return self.parse_proc(ProcKind::Sub, start),
                Kw::Function => return self.parse_proc(ProcKind::Function, start),
                Kw::Declare => self.parse_declare()?,
                Kw::Call => {
                    self.bump();
                    self.parse_assign_or_call(false)?
                }
                Kw::Open => self.parse_open()?,
                Kw::Close => self.parse_close()?,
                Kw::Data => self.parse_data()?,
                Kw::Read => self.parse_read()?,
                Kw::Restore => {
                    self.bump();
                    if self.at_stmt_end() {
                        StmtKind::Restore(None)
                    } else {
                        StmtKind::Restore(Some(self.parse_label_ref()?))
                    }
                }
                Kw::Randomize => {
                    self.bump();
                    if self.at_stmt_end() {
                        StmtKind::Randomize(None)
                    } else {
                        StmtKind::Randomize(Some(self.parse_expr()?))
                    }
                }
                Kw::Swap => {
                    self.bump();
                    let a = self.parse_expr()?;
                    self.expect_punct(Punct::Comma, "`,` between SWAP operands");
                    let b = self.parse_expr()?;
                    StmtKind::Swap(a, b)
                }
                Kw::Option => self.parse_option()?,
                Kw::Cls => {
                    self.bump();
                    StmtKind::Cls
                }
                Kw::Beep => {
                    self.bump();
                    StmtKind::Beep
                }
                Kw::Sleep => {
                    self.bump();
                    if self.at_stmt_end() {
                        StmtKind::Sleep(None)
                    } else {
                        StmtKind::Sleep(Some(self.parse_expr()?))
                    }
                }
                Kw::End => {
                    self.bump();
                    match self.peek_kind() {
                        TokenKind::Kw(Kw::If | Kw::Select | Kw::Sub | Kw::Function | Kw::Type) => {
                            self.unexpected("a statement (stray block END)");
                            self.bump();
                            return None;
                        }
                        _ => StmtKind::End,
                    }
                }
                _ => {
                    self.unexpected("a statement");
                    self.skip_to_stmt_end();
                    return None;
                }
            },
            TokenKind::Ident(_) => self.parse_assign_or_call(false)?,
            _ => {
                self.unexpected("a statement");
                self.skip_to_stmt_end();
                return None;
            }
        };

        let span = start.merge(self.prev_span());
        self.finish_stmt();
        Some(Stmt { kind, span })
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            self.span()
        } else {
            self.tokens[self.pos - 1].span
        }
    }

    fn parse_label_ref(&mut self) -> Option<LabelRef> {
        let span = self.span();
        match self.peek_kind() {
            TokenKind::Ident(sym) => {
                let name = *sym;
                self.bump();
                Some(LabelRef { name, span })
            }
            TokenKind::Number(lit) => {
                let name = line_number_symbol(*lit)?;
                self.bump();
                Some(LabelRef { name, span })
            }
            _ => {
                self.unexpected("a label or line number");
                None
            }
        }
    }

    // -------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------

    fn parse_dim(&mut self, redim: bool) -> Option<StmtKind> {
        self.bump(); // DIM / REDIM
        let shared = self.eat_kw(Kw::Shared);
        let mut decls = Vec::new();
        loop {
            let span = self.span();
            let name = self.expect_ident("a variable name")?;
            let dims = if self.eat_punct(Punct::LParen) {
                let mut bounds = Vec::new();
                if !self.check_punct(Punct::RParen) {
                    loop {
                        let first = self.parse_expr()?;
                        let bound = if self.eat_kw(Kw::To) {
                            let upper = self.parse_expr()?;
                            DimBound { lower: Some(first), upper }
                        } else {
                            DimBound { lower: None, upper: first }
                        };
                        bounds.push(bound);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                self.expect_punct(Punct::RParen, "`)` after array bounds");
                Some(bounds)
            } else {
                None
            };
            let ty = if self.eat_kw(Kw::As) {
                Some(self.parse_type_name()?)
            } else {
                None
            };
            decls.push(VarDecl { name, dims, ty, span });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Some(if redim {
            StmtKind::Redim { shared, decls }
        } else {
            StmtKind::Dim { shared, decls }
        })
    }

    fn parse_type_name(&mut self) -> Option<TypeName> {
        let tn = match self.peek_kind().clone() {
            TokenKind::Kw(Kw::Integer) => {
                self.bump();
                TypeName::Integer
            }
            TokenKind::Kw(Kw::Long) => {
                self.bump();
                TypeName::Long
            }
            TokenKind::Kw(Kw::Integer64) => {
                self.bump();
                TypeName::Integer64
            }
            TokenKind::Kw(Kw::Unsigned) => {
                self.bump();
                self.expect_kw(Kw::Long, "`LONG` after `_UNSIGNED`");
                TypeName::UnsignedLong
            }
            TokenKind::Kw(Kw::Single) => {
                self.bump();
                TypeName::Single
            }
            TokenKind::Kw(Kw::Double) => {
                self.bump();
                TypeName::Double
            }
            TokenKind::Kw(Kw::String_) => {
                self.bump();
                let fixed_len = if self.eat_punct(Punct::Star) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                TypeName::String { fixed_len }
            }
            TokenKind::Ident(sym) => {
                self.bump();
                TypeName::User(sym)
            }
            _ => {
                self.unexpected("a type name");
                return None;
            }
        };
        Some(tn)
    }

    fn parse_const(&mut self) -> Option<StmtKind> {
        self.bump(); // CONST
        let mut decls = Vec::new();
        loop {
            let span = self.span();
            let name = self.expect_ident("a constant name")?;
            self.expect_punct(Punct::Eq, "`=` in CONST");
            let value = self.parse_expr()?;
            decls.push(ConstDecl { name, value, span });
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Some(StmtKind::Const { decls })
    }

    fn parse_type_def(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // TYPE
        let name = self.expect_ident("a type name")?;
        self.finish_stmt();
        let mut fields = Vec::new();
        loop {
            self.eat_separators();
            if self.at_eof() {
                self.unexpected("`END TYPE`");
                break;
            }
            if self.check_kw(Kw::End) && matches!(self.nth_kind(1), TokenKind::Kw(Kw::Type)) {
                self.bump();
                self.bump();
                break;
            }
            let span = self.span();
            let Some(fname) = self.expect_ident("a field name") else {
                self.skip_to_stmt_end();
                continue;
            };
            if !self.expect_kw(Kw::As, "`AS` in TYPE field") {
                self.skip_to_stmt_end();
                continue;
            }
            let Some(ty) = self.parse_type_name() else {
                self.skip_to_stmt_end();
                continue;
            };
            fields.push(FieldDecl { name: fname, ty, span });
            self.finish_stmt();
        }
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::TypeDef { name, fields },
            span,
        })
    }

    fn parse_proc(&mut self, kind: ProcKind, start: Span) -> Option<Stmt> {
        self.bump(); // SUB / FUNCTION
        if self.in_proc {
            self.unexpected("no nested SUB/FUNCTION");
        }
        let name = self.expect_ident("a procedure name")?;
        let params = self.parse_param_list()?;
        self.finish_stmt();
        self.in_proc = true;
        let body = self.parse_stmt_list(BlockCtx::Proc);
        self.in_proc = false;
        // END SUB / END FUNCTION
        if self.check_kw(Kw::End) {
            self.bump();
            self.bump();
        } else {
            self.unexpected(match kind {
                ProcKind::Sub => "`END SUB`",
                ProcKind::Function => "`END FUNCTION`",
            });
        }
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::Proc(ProcDef { kind, name, params, body }),
            span,
        })
    }

    fn parse_declare(&mut self) -> Option<StmtKind> {
        self.bump(); // DECLARE
        let kind = if self.eat_kw(Kw::Sub) {
            ProcKind::Sub
        } else if self.eat_kw(Kw::Function) {
            ProcKind::Function
        } else {
            self.unexpected("`SUB` or `FUNCTION` after DECLARE");
            return None;
        };
        let name = self.expect_ident("a procedure name")?;
        let params = self.parse_param_list()?;
        Some(StmtKind::Declare { kind, name, params })
    }

    fn parse_param_list(&mut self) -> Option<Vec<Param>> {
        let mut params = Vec::new();
        if self.eat_punct(Punct::LParen) {
            if !self.check_punct(Punct::RParen) {
                loop {
                    let span = self.span();
                    let by_val = self.eat_kw(Kw::ByVal);
                    let name = self.expect_ident("a parameter name")?;
                    let is_array = if self.eat_punct(Punct::LParen) {
                        self.expect_punct(Punct::RParen, "`)` in array parameter");
                        true
                    } else {
                        false
                    };
                    let ty = if self.eat_kw(Kw::As) {
                        Some(self.parse_type_name()?)
                    } else {
                        None
                    };
                    params.push(Param { name, ty, by_val, is_array, span });
                    if !self.eat_punct(Punct::Comma) {
                        break;
                    }
                }
            }
            self.expect_punct(Punct::RParen, "`)` after parameters");
        }
        Some(params)
    }

    // -------------------------------------------------------------------
    // Simple statements
    // -------------------------------------------------------------------

    /// Statement starting with an identifier (after optional `LET` or
    /// `CALL`): an assignment when `=` follows the l-value shape,
    /// otherwise an implicit procedure call.
    fn parse_assign_or_call(&mut self, require_assign: bool) -> Option<StmtKind> {
        let target = self.parse_lvalue()?;
        if self.eat_punct(Punct::Eq) {
            let value = self.parse_expr()?;
            return Some(StmtKind::Assign { target, value });
        }
        if require_assign {
            self.unexpected("`=` in assignment");
            self.skip_to_stmt_end();
            return None;
        }
        match target.kind {
            ExprKind::Var(name) => {
                // `MySub a, b`: arguments without parentheses.
                let mut args = Vec::new();
                if !self.at_stmt_end() {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat_punct(Punct::Comma) {
                            break;
                        }
                    }
                }
                Some(StmtKind::Call { name, args })
            }
            ExprKind::Call { name, args } => Some(StmtKind::Call { name, args }),
            _ => {
                self.handler.report(
                    DiagnosticKind::UnexpectedToken,
                    "expected assignment or procedure call",
                    target.span,
                );
                self.skip_to_stmt_end();
                None
            }
        }
    }

    fn parse_print(&mut self) -> Option<StmtKind> {
        self.bump(); // PRINT
        let channel = self.parse_channel_prefix()?;
        let mut items = Vec::new();
        while !self.at_stmt_end() && !self.check_kw(Kw::Else) {
            if self.eat_punct(Punct::Semicolon) {
                items.push(PrintPiece::Semi);
            } else if self.eat_punct(Punct::Comma) {
                items.push(PrintPiece::Comma);
            } else {
                items.push(PrintPiece::Expr(self.parse_expr()?));
            }
        }
        Some(StmtKind::Print { channel, items })
    }

    /// `#n,` after PRINT/INPUT selects a file channel.
    fn parse_channel_prefix(&mut self) -> Option<Option<Expr>> {
        if self.eat_punct(Punct::Hash) {
            let chan = self.parse_expr()?;
            self.expect_punct(Punct::Comma, "`,` after channel number");
            Some(Some(chan))
        } else {
            Some(None)
        }
    }

    fn parse_input(&mut self, line: bool) -> Option<StmtKind> {
        if line {
            self.bump(); // LINE
            if !self.expect_kw(Kw::Input, "`INPUT` after `LINE`") {
                self.skip_to_stmt_end();
                return None;
            }
        } else {
            self.bump(); // INPUT
        }
        let channel = self.parse_channel_prefix()?;

        let mut prompt = None;
        let mut no_question = false;
        if channel.is_none() {
            // `INPUT ;` keeps the cursor on the line; accepted and folded
            // into the prompt handling.
            self.eat_punct(Punct::Semicolon);
            if let TokenKind::StringLit(text) = self.peek_kind().clone() {
                // Only a prompt when followed by `;` or `,`.
                if matches!(
                    self.nth_kind(1),
                    TokenKind::Punct(Punct::Semicolon) | TokenKind::Punct(Punct::Comma)
                ) {
                    self.bump();
                    prompt = Some(text);
                    no_question = self.eat_punct(Punct::Comma);
                    if !no_question {
                        self.eat_punct(Punct::Semicolon);
                    }
                }
            }
        }

        if line {
            let target = self.parse_lvalue()?;
            Some(StmtKind::LineInput {
                channel,
                prompt,
                no_question,
                target,
            })
        } else {
            let mut targets = Vec::new();
            loop {
                targets.push(self.parse_lvalue()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            Some(StmtKind::Input {
                channel,
                prompt,
                no_question,
                targets,
            })
        }
    }

    fn parse_exit(&mut self) -> Option<StmtKind> {
        self.bump(); // EXIT
        let kind = if self.eat_kw(Kw::For) {
            ExitKind::For
        } else if self.eat_kw(Kw::Do) {
            ExitKind::Do
        } else if self.eat_kw(Kw::Sub) {
            ExitKind::Sub
        } else if self.eat_kw(Kw::Function) {
            ExitKind::Function
        } else {
            self.unexpected("`FOR`, `DO`, `SUB` or `FUNCTION` after EXIT");
            return None;
        };
        Some(StmtKind::Exit(kind))
    }

    fn parse_open(&mut self) -> Option<StmtKind> {
        self.bump(); // OPEN
        let path = self.parse_expr()?;
        self.expect_kw(Kw::For, "`FOR` in OPEN");
        let mode = if self.eat_kw(Kw::Input) {
            OpenMode::Input
        } else {
            match self.peek_kind() {
                TokenKind::Ident(sym) => {
                    let mode = match sym.as_str().as_str() {
                        "OUTPUT" => Some(OpenMode::Output),
                        "APPEND" => Some(OpenMode::Append),
                        "BINARY" => Some(OpenMode::Binary),
                        "RANDOM" => Some(OpenMode::Random),
                        _ => None,
                    };
                    match mode {
                        Some(m) => {
                            self.bump();
                            m
                        }
                        None => {
                            self.unexpected("a file mode");
                            return None;
                        }
                    }
                }
                _ => {
                    self.unexpected("a file mode");
                    return None;
                }
            }
        };
        self.expect_kw(Kw::As, "`AS` in OPEN");
        self.eat_punct(Punct::Hash);
        let channel = self.parse_expr()?;
        Some(StmtKind::Open { path, mode, channel })
    }

    fn parse_close(&mut self) -> Option<StmtKind> {
        self.bump(); // CLOSE
        let mut channels = Vec::new();
        if !self.at_stmt_end() {
            loop {
                self.eat_punct(Punct::Hash);
                channels.push(self.parse_expr()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        }
        Some(StmtKind::Close { channels })
    }

    fn parse_data(&mut self) -> Option<StmtKind> {
        self.bump(); // DATA
        let mut items = Vec::new();
        loop {
            let span = self.span();
            match self.peek_kind().clone() {
                TokenKind::Number(lit) => {
                    self.bump();
                    items.push(DataItem::Number(lit, span));
                }
                TokenKind::Punct(Punct::Minus) => {
                    self.bump();
                    match self.peek_kind().clone() {
                        TokenKind::Number(lit) => {
                            self.bump();
                            items.push(DataItem::Number(negate_lit(lit), span));
                        }
                        _ => {
                            self.unexpected("a number after `-` in DATA");
                            self.skip_to_stmt_end();
                            break;
                        }
                    }
                }
                TokenKind::StringLit(bytes) => {
                    self.bump();
                    items.push(DataItem::Str(bytes, span));
                }
                _ => {
                    self.unexpected("a numeric or string DATA item");
                    self.skip_to_stmt_end();
                    break;
                }
            }
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Some(StmtKind::Data { items })
    }

    fn parse_read(&mut self) -> Option<StmtKind> {
        self.bump(); // READ
        let mut targets = Vec::new();
        loop {
            targets.push(self.parse_lvalue()?);
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Some(StmtKind::Read { targets })
    }

    fn parse_option(&mut self) -> Option<StmtKind> {
        self.bump(); // OPTION
        self.expect_kw(Kw::Base, "`BASE` after OPTION");
        match self.peek_kind() {
            TokenKind::Number(NumLit::Int16(b @ (0 | 1))) => {
                let base = *b as u8;
                self.bump();
                Some(StmtKind::OptionBase(base))
            }
            _ => {
                self.unexpected("`0` or `1` after OPTION BASE");
                None
            }
        }
    }

    // -------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------

    fn parse_if(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // IF
        let cond = self.parse_expr()?;
        self.expect_kw(Kw::Then, "`THEN` after IF condition");

        if self.at_line_end() {
            // Block form.
            let mut arms = vec![IfArm {
                cond,
                body: self.parse_stmt_list(BlockCtx::If),
            }];
            let mut else_body = Vec::new();
            loop {
                if self.eat_kw(Kw::ElseIf) {
                    let cond = self.parse_expr()?;
                    self.expect_kw(Kw::Then, "`THEN` after ELSEIF condition");
                    arms.push(IfArm {
                        cond,
                        body: self.parse_stmt_list(BlockCtx::If),
                    });
                } else if self.eat_kw(Kw::Else) {
                    else_body = self.parse_stmt_list(BlockCtx::If);
                    if self.check_kw(Kw::ElseIf) || self.check_kw(Kw::Else) {
                        self.unexpected("`END IF` after ELSE body");
                        self.bump();
                        continue;
                    }
                    break;
                } else {
                    break;
                }
            }
            if self.check_kw(Kw::End) {
                self.bump();
                self.expect_kw(Kw::If, "`IF` after END");
            } else {
                self.unexpected("`END IF`");
            }
            let span = start.merge(self.prev_span());
            return Some(Stmt {
                kind: StmtKind::If { arms, else_body },
                span,
            });
        }

        // Single-line form. `IF c THEN 100` is an implicit GOTO.
        let body = self.parse_inline_branch()?;
        let else_body = if self.eat_kw(Kw::Else) {
            self.parse_inline_branch()?
        } else {
            Vec::new()
        };
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::If {
                arms: vec![IfArm { cond, body }],
                else_body,
            },
            span,
        })
    }

    /// The statements of one branch of a single-line IF: up to `ELSE`
    /// or end of line, `:`-separated.
    fn parse_inline_branch(&mut self) -> Option<Vec<Stmt>> {
        let mut body = Vec::new();
        if let TokenKind::Number(lit) = self.peek_kind() {
            // Implicit GOTO line-number.
            let span = self.span();
            if let Some(name) = line_number_symbol(*lit) {
                self.bump();
                body.push(Stmt {
                    kind: StmtKind::Goto(LabelRef { name, span }),
                    span,
                });
                return Some(body);
            }
        }
        loop {
            if self.at_line_end() || self.check_kw(Kw::Else) {
                break;
            }
            if let Some(stmt) = self.parse_stmt() {
                body.push(stmt);
            }
            while self.eat_punct(Punct::Colon) {}
        }
        Some(body)
    }

    fn parse_select(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // SELECT
        self.expect_kw(Kw::Case, "`CASE` after SELECT");
        let subject = self.parse_expr()?;
        self.finish_stmt();
        self.eat_separators();

        let mut arms = Vec::new();
        let mut else_body = None;
        loop {
            if self.at_eof() {
                self.unexpected("`END SELECT`");
                break;
            }
            if self.check_kw(Kw::End) && matches!(self.nth_kind(1), TokenKind::Kw(Kw::Select)) {
                self.bump();
                self.bump();
                break;
            }
            let arm_span = self.span();
            if !self.expect_kw(Kw::Case, "`CASE`") {
                self.skip_to_stmt_end();
                self.eat_separators();
                continue;
            }
            if self.eat_kw(Kw::Else) {
                let body = self.parse_stmt_list(BlockCtx::Select);
                if else_body.replace(body).is_some() {
                    self.handler.report(
                        DiagnosticKind::UnexpectedToken,
                        "duplicate CASE ELSE",
                        arm_span,
                    );
                }
                continue;
            }
            let mut guards = Vec::new();
            loop {
                guards.push(self.parse_case_guard()?);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
            let body = self.parse_stmt_list(BlockCtx::Select);
            arms.push(CaseArm {
                guards,
                body,
                span: arm_span,
            });
        }
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::Select {
                subject,
                arms,
                else_body,
            },
            span,
        })
    }

    fn parse_case_guard(&mut self) -> Option<CaseGuard> {
        if self.eat_kw(Kw::Is) {
            let op = match self.peek_kind() {
                TokenKind::Punct(Punct::Eq) => BinOp::Eq,
                TokenKind::Punct(Punct::Ne) => BinOp::Ne,
                TokenKind::Punct(Punct::Lt) => BinOp::Lt,
                TokenKind::Punct(Punct::Le) => BinOp::Le,
                TokenKind::Punct(Punct::Gt) => BinOp::Gt,
                TokenKind::Punct(Punct::Ge) => BinOp::Ge,
                _ => {
                    self.unexpected("a relational operator after `IS`");
                    return None;
                }
            };
            self.bump();
            let value = self.parse_expr()?;
            return Some(CaseGuard::Is(op, value));
        }
        let first = self.parse_expr()?;
        if self.eat_kw(Kw::To) {
            let second = self.parse_expr()?;
            Some(CaseGuard::Range(first, second))
        } else {
            Some(CaseGuard::Value(first))
        }
    }

    fn parse_for(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // FOR
        let counter = self.parse_lvalue()?;
        self.expect_punct(Punct::Eq, "`=` after FOR counter");
        let from = self.parse_expr()?;
        self.expect_kw(Kw::To, "`TO` in FOR");
        let to = self.parse_expr()?;
        let step = if self.eat_kw(Kw::Step) {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.finish_stmt();
        let body = self.parse_stmt_list(BlockCtx::For);
        if self.expect_kw(Kw::Next, "`NEXT`") {
            // Optional counter name after NEXT must match.
            if let TokenKind::Ident(sym) = self.peek_kind() {
                let sym = *sym;
                let span = self.span();
                self.bump();
                if let ExprKind::Var(counter_name) = counter.kind {
                    if sym != counter_name {
                        self.handler.report(
                            DiagnosticKind::UnexpectedToken,
                            format!("NEXT {} does not match FOR {}", sym, counter_name),
                            span,
                        );
                    }
                }
            }
        }
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::For {
                counter,
                from,
                to,
                step,
                body,
            },
            span,
        })
    }

    fn parse_while(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // WHILE
        let cond = self.parse_expr()?;
        self.finish_stmt();
        let body = self.parse_stmt_list(BlockCtx::While);
        self.expect_kw(Kw::Wend, "`WEND`");
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::While { cond, body },
            span,
        })
    }

    fn parse_do(&mut self, start: Span) -> Option<Stmt> {
        self.bump(); // DO
        let pre = self.parse_loop_cond()?;
        self.finish_stmt();
        let body = self.parse_stmt_list(BlockCtx::Do);
        self.expect_kw(Kw::Loop, "`LOOP`");
        let post = self.parse_loop_cond()?;
        if pre.is_some() && post.is_some() {
            self.handler.report(
                DiagnosticKind::UnexpectedToken,
                "DO and LOOP cannot both carry a condition",
                self.prev_span(),
            );
        }
        let span = start.merge(self.prev_span());
        Some(Stmt {
            kind: StmtKind::DoLoop { pre, post, body },
            span,
        })
    }

    fn parse_loop_cond(&mut self) -> Option<Option<LoopCond>> {
        if self.eat_kw(Kw::While) {
            Some(Some(LoopCond::While(self.parse_expr()?)))
        } else if self.eat_kw(Kw::Until) {
            Some(Some(LoopCond::Until(self.parse_expr()?)))
        } else {
            Some(None)
        }
    }
}

/// Canonical label symbol for a line-number literal.
fn line_number_symbol(lit: NumLit) -> Option<Symbol> {
    let value = match lit {
        NumLit::Int16(v) => v as i64,
        NumLit::Int32(v) => v as i64,
        NumLit::Int64(v) => v,
        _ => return None,
    };
    if value < 0 {
        return None;
    }
    Some(Symbol::intern(&value.to_string()))
}

fn negate_lit(lit: NumLit) -> NumLit {
    match lit {
        NumLit::Int16(v) => NumLit::Int16(-v),
        NumLit::Int32(v) => NumLit::Int32(-v),
        NumLit::Int64(v) => NumLit::Int64(v.wrapping_neg()),
        NumLit::Single(v) => NumLit::Single(-v),
        NumLit::Double(v) => NumLit::Double(-v),
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Kw(kw) => format!("`{kw:?}`").to_uppercase(),
        TokenKind::Ident(sym) => format!("identifier `{sym}`"),
        TokenKind::Number(_) => "a number".into(),
        TokenKind::StringLit(_) => "a string literal".into(),
        TokenKind::MetaCommand(_) => "a metacommand".into(),
        TokenKind::Punct(p) => format!("`{}`", punct_str(*p)),
        TokenKind::Eol => "end of line".into(),
        TokenKind::Eof => "end of file".into(),
    }
}

fn punct_str(p: Punct) -> &'static str {
    match p {
        Punct::LParen => "(",
        Punct::RParen => ")",
        Punct::Comma => ",",
        Punct::Semicolon => ";",
        Punct::Colon => ":",
        Punct::Hash => "#",
        Punct::Period => ".",
        Punct::Plus => "+",
        Punct::Minus => "-",
        Punct::Star => "*",
        Punct::Slash => "/",
        Punct::Backslash => "\\",
        Punct::Caret => "^",
        Punct::Eq => "=",
        Punct::Lt => "<",
        Punct::Le => "<=",
        Punct::Gt => ">",
        Punct::Ge => ">=",
        Punct::Ne => "<>",
    }
}

/// Parse a token stream into a [`Program`].
pub fn parse(tokens: Vec<Token>, handler: &Handler) -> Program {
    Parser::new(tokens, handler).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbc_util::FileId;

    fn parse_src(src: &str) -> (Program, Handler) {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize(src, FileId::DUMMY, &handler);
        let program = Parser::new(tokens, &handler).parse();
        (program, handler)
    }

    fn parse_ok(src: &str) -> Program {
        let (program, handler) = parse_src(src);
        assert!(
            !handler.has_errors(),
            "unexpected diagnostics: {:?}",
            handler.diagnostics()
        );
        program
    }

    #[test]
    fn test_parse_print_hello() {
        let program = parse_ok("PRINT \"Hello, World!\"\nEND");
        assert_eq!(program.stmts.len(), 2);
        assert!(matches!(program.stmts[0].kind, StmtKind::Print { .. }));
        assert!(matches!(program.stmts[1].kind, StmtKind::End));
    }

    #[test]
    fn test_parse_assignment_and_let() {
        let program = parse_ok("A = 1\nLET B% = 2");
        assert!(matches!(program.stmts[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(program.stmts[1].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn test_parse_dim_forms() {
        let program = parse_ok("DIM A(10)\nDIM SHARED B AS LONG, C(1 TO 5) AS STRING * 8");
        match &program.stmts[0].kind {
            StmtKind::Dim { shared, decls } => {
                assert!(!shared);
                assert!(decls[0].dims.is_some());
            }
            other => panic!("expected Dim, got {other:?}"),
        }
        match &program.stmts[1].kind {
            StmtKind::Dim { shared, decls } => {
                assert!(*shared);
                assert_eq!(decls.len(), 2);
                assert!(matches!(decls[1].ty, Some(TypeName::String { fixed_len: Some(_) })));
            }
            other => panic!("expected Dim, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_labels() {
        let program = parse_ok("Start:\n100 PRINT 1\nGOTO Start\nGOTO 100");
        assert!(matches!(program.stmts[0].kind, StmtKind::Label(_)));
        assert!(matches!(program.stmts[1].kind, StmtKind::Label(_)));
        match &program.stmts[3].kind {
            StmtKind::Goto(l) => assert_eq!(l.name, Symbol::intern("Start")),
            other => panic!("expected Goto, got {other:?}"),
        }
        match &program.stmts[4].kind {
            StmtKind::Goto(l) => assert_eq!(l.name, Symbol::intern("100")),
            other => panic!("expected Goto, got {other:?}"),
        }
    }

    #[test]
    fn test_single_line_if_vs_block_if() {
        let program = parse_ok("IF A > 1 THEN PRINT 1 ELSE PRINT 2");
        match &program.stmts[0].kind {
            StmtKind::If { arms, else_body } => {
                assert_eq!(arms.len(), 1);
                assert_eq!(arms[0].body.len(), 1);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected If, got {other:?}"),
        }

        let program = parse_ok("IF A > 1 THEN\nPRINT 1\nELSEIF A > 0 THEN\nPRINT 2\nELSE\nPRINT 3\nEND IF");
        match &program.stmts[0].kind {
            StmtKind::If { arms, else_body } => {
                assert_eq!(arms.len(), 2);
                assert_eq!(else_body.len(), 1);
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn test_single_line_if_goto_number() {
        let program = parse_ok("IF A THEN 100\n100 END");
        match &program.stmts[0].kind {
            StmtKind::If { arms, .. } => {
                assert!(matches!(arms[0].body[0].kind, StmtKind::Goto(_)));
            }
            other => panic!("expected If, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_statements_per_line() {
        let program = parse_ok("A = 1: B = 2: PRINT A + B");
        assert_eq!(program.stmts.len(), 3);
    }

    #[test]
    fn test_parse_select_case() {
        let program = parse_ok(
            "SELECT CASE s\n  CASE IS >= 90: PRINT \"A\"\n  CASE 80 TO 89: PRINT \"B\"\n  CASE 1, 2: PRINT \"low\"\n  CASE ELSE: PRINT \"?\"\nEND SELECT",
        );
        match &program.stmts[0].kind {
            StmtKind::Select { arms, else_body, .. } => {
                assert_eq!(arms.len(), 3);
                assert!(matches!(arms[0].guards[0], CaseGuard::Is(BinOp::Ge, _)));
                assert!(matches!(arms[1].guards[0], CaseGuard::Range(_, _)));
                assert_eq!(arms[2].guards.len(), 2);
                assert!(else_body.is_some());
            }
            other => panic!("expected Select, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_for_next() {
        let program = parse_ok("FOR i = 10 TO 0 STEP -2\n  PRINT i;\nNEXT i");
        match &program.stmts[0].kind {
            StmtKind::For { step, body, .. } => {
                assert!(step.is_some());
                assert_eq!(body.len(), 1);
            }
            other => panic!("expected For, got {other:?}"),
        }
    }

    #[test]
    fn test_next_counter_mismatch_reports() {
        let (_, handler) = parse_src("FOR i = 1 TO 3\nNEXT j");
        assert!(handler.has_errors());
    }

    #[test]
    fn test_parse_while_and_do() {
        let program = parse_ok("WHILE A < 10\nA = A + 1\nWEND\nDO UNTIL B\nB = 1\nLOOP\nDO\nLOOP WHILE C");
        assert!(matches!(program.stmts[0].kind, StmtKind::While { .. }));
        match &program.stmts[1].kind {
            StmtKind::DoLoop { pre, post, .. } => {
                assert!(matches!(pre, Some(LoopCond::Until(_))));
                assert!(post.is_none());
            }
            other => panic!("expected DoLoop, got {other:?}"),
        }
        match &program.stmts[2].kind {
            StmtKind::DoLoop { pre, post, .. } => {
                assert!(pre.is_none());
                assert!(matches!(post, Some(LoopCond::While(_))));
            }
            other => panic!("expected DoLoop, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_data_read_restore() {
        let program = parse_ok("READ a, b\nRESTORE L2\nDATA 10, -20, \"x\"\nL2: DATA 100");
        assert!(matches!(program.stmts[0].kind, StmtKind::Read { .. }));
        assert!(matches!(program.stmts[1].kind, StmtKind::Restore(Some(_))));
        match &program.stmts[2].kind {
            StmtKind::Data { items } => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[1], DataItem::Number(NumLit::Int16(-20), _)));
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_sub_function_declare() {
        let program = parse_ok(
            "DECLARE SUB Greet (name$)\nSUB Greet (name$)\nPRINT name$\nEND SUB\nFUNCTION Add% (a%, BYVAL b%)\nAdd% = a% + b%\nEND FUNCTION",
        );
        assert!(matches!(program.stmts[0].kind, StmtKind::Declare { .. }));
        match &program.stmts[1].kind {
            StmtKind::Proc(def) => {
                assert_eq!(def.kind, ProcKind::Sub);
                assert_eq!(def.params.len(), 1);
            }
            other => panic!("expected Proc, got {other:?}"),
        }
        match &program.stmts[2].kind {
            StmtKind::Proc(def) => {
                assert_eq!(def.kind, ProcKind::Function);
                assert!(def.params[1].by_val);
            }
            other => panic!("expected Proc, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_implicit_call() {
        let program = parse_ok("Greet \"world\", 2\nGreet2(3)\nGreet3");
        assert!(matches!(program.stmts[0].kind, StmtKind::Call { .. }));
        assert!(matches!(program.stmts[1].kind, StmtKind::Call { .. }));
        assert!(matches!(program.stmts[2].kind, StmtKind::Call { .. }));
    }

    #[test]
    fn test_parse_type_block() {
        let program = parse_ok("TYPE Point\n  x AS SINGLE\n  y AS SINGLE\nEND TYPE");
        match &program.stmts[0].kind {
            StmtKind::TypeDef { fields, .. } => assert_eq!(fields.len(), 2),
            other => panic!("expected TypeDef, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_open_close() {
        let program = parse_ok("OPEN \"out.txt\" FOR OUTPUT AS #1\nPRINT #1, \"hi\"\nCLOSE #1\nCLOSE");
        assert!(matches!(
            program.stmts[0].kind,
            StmtKind::Open { mode: OpenMode::Output, .. }
        ));
        match &program.stmts[1].kind {
            StmtKind::Print { channel, .. } => assert!(channel.is_some()),
            other => panic!("expected Print, got {other:?}"),
        }
        match &program.stmts[3].kind {
            StmtKind::Close { channels } => assert!(channels.is_empty()),
            other => panic!("expected Close, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_metacommands() {
        let (program, handler) = parse_src("$CONSOLE\n$INCLUDE:'defs.bi'\nPRINT 1");
        assert!(!handler.has_errors());
        assert!(program.console);
        assert!(matches!(program.stmts[0].kind, StmtKind::Include(_)));
    }

    #[test]
    fn test_parser_determinism() {
        let src = "FOR i = 1 TO 3\nPRINT i\nNEXT i\nIF A THEN PRINT 1 ELSE PRINT 2\n";
        let a = format!("{:?}", parse_ok(src).stmts);
        let b = format!("{:?}", parse_ok(src).stmts);
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_recovery_continues() {
        let (program, handler) = parse_src("PRINT )\nPRINT 2");
        assert!(handler.has_errors());
        // The second statement still parses.
        assert!(program
            .stmts
            .iter()
            .any(|s| matches!(s.kind, StmtKind::Print { .. })));
    }

    #[test]
    fn test_exit_forms() {
        let program = parse_ok("DO\nEXIT DO\nLOOP\nFOR i = 1 TO 2\nEXIT FOR\nNEXT");
        match &program.stmts[0].kind {
            StmtKind::DoLoop { body, .. } => {
                assert!(matches!(body[0].kind, StmtKind::Exit(ExitKind::Do)))
            }
            other => panic!("expected DoLoop, got {other:?}"),
        }
    }

    #[test]
    fn test_swap_and_option_base() {
        let program = parse_ok("OPTION BASE 1\nSWAP a, b");
        assert!(matches!(program.stmts[0].kind, StmtKind::OptionBase(1)));
        assert!(matches!(program.stmts[1].kind, StmtKind::Swap(_, _)));
    }
}
