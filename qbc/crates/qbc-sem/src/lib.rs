//! qbc-sem - Semantic analysis for the QBasic dialect.
//!
//! Two passes over the parsed tree:
//!
//! **Pass A (collection)** walks every statement list gathering the
//! module-level facts that may be referenced before their definition:
//! `CONST` bindings (folded at compile time), `TYPE` layouts,
//! `SUB`/`FUNCTION` signatures, every label, and the flat `DATA` pool
//! with its label-to-index mapping.
//!
//! **Pass B (resolution)** types every expression, resolves every name
//! to a storage slot / constant / procedure / intrinsic, inserts
//! implicit numeric coercion markers, checks assignability, argument
//! arity, array index arity, record fields, and label references.
//!
//! Results land in side tables keyed by [`ExprId`]; the tree itself is
//! never mutated, and the emitter consumes [`Analysis`] together with
//! the AST.
//!
//! Scoping is flat: one module scope plus one scope per procedure.
//! Module variables are only visible inside procedures when declared
//! `SHARED`; a `DIM SHARED` inside a procedure declares into module
//! scope. Scalars spring into existence on first use with their sigil
//! type (or `SINGLE`); arrays must be declared with `DIM`.

pub mod consteval;
mod intrinsics;
pub mod types;

pub use consteval::{eval_const, ConstVal};
pub use intrinsics::{ArgKind, Intrinsic};
pub use qbc_par::ProcKind;
pub use types::{sigil_ty, FieldInfo, RecordLayout, Ty, TypeId, TypeTable};

use qbc_lex::NumLit;
use qbc_par::{
    BinOp, CaseGuard, DataItem, DimBound, Expr, ExprId, ExprKind, ExitKind, LabelRef, LoopCond,
    PrintPiece, Program, Stmt, StmtKind, TypeName, UnOp, VarDecl,
};
use qbc_util::{DiagnosticKind, Handler, Span, Symbol};
use rustc_hash::FxHashMap;

/// A declared (or auto-declared) variable and its storage slot.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: Symbol,
    pub ty: Ty,
    pub is_array: bool,
    /// Number of dimensions for arrays, 0 for scalars.
    pub dims: u8,
    pub shared: bool,
    pub span: Span,
}

/// A procedure parameter as the signature records it.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: Symbol,
    pub ty: Ty,
    pub by_val: bool,
    pub is_array: bool,
}

/// Dense procedure id; indexes [`Analysis::procs`].
pub type ProcId = u32;

#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub kind: ProcKind,
    pub name: Symbol,
    pub params: Vec<ParamInfo>,
    /// `Some` for functions.
    pub ret_ty: Option<Ty>,
    /// All local slots in order: parameters, then (for functions) the
    /// return slot, then declared and auto-declared locals.
    pub locals: Vec<VarInfo>,
    pub span: Span,
    /// Known only from `DECLARE`; no body seen yet.
    pub declared_only: bool,
}

impl ProcInfo {
    /// The local slot holding a function's return value.
    pub fn ret_slot(&self) -> Option<u32> {
        self.ret_ty.map(|_| self.params.len() as u32)
    }
}

/// One item of the flat `DATA` pool.
#[derive(Debug, Clone, PartialEq)]
pub enum DataVal {
    Num(NumLit),
    Str(Vec<u8>),
}

/// What a name in an expression resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Global(u32),
    Local(u32),
    Const(Symbol),
    FuncCall(ProcId),
    /// Array element access through a global / local slot.
    ArrayGlobal(u32),
    ArrayLocal(u32),
    /// Whole-array reference (`A()` as a procedure argument).
    ArrayWholeGlobal(u32),
    ArrayWholeLocal(u32),
    Intrinsic(Intrinsic),
    /// The function name used as assignment target inside its own body.
    FuncRet,
}

/// Everything later phases need to know about an analyzed module.
#[derive(Debug, Default)]
pub struct Analysis {
    pub types: TypeTable,
    pub globals: Vec<VarInfo>,
    pub procs: Vec<ProcInfo>,
    pub proc_by_name: FxHashMap<Symbol, ProcId>,
    pub consts: FxHashMap<Symbol, ConstVal>,
    pub data_pool: Vec<DataVal>,
    pub data_labels: FxHashMap<Symbol, u32>,
    /// Load type of every expression (fixed strings already decayed).
    pub expr_tys: FxHashMap<ExprId, Ty>,
    /// Coerce the value of this expression to the given type after
    /// evaluating it.
    pub coercions: FxHashMap<ExprId, Ty>,
    pub resolutions: FxHashMap<ExprId, Resolution>,
    /// Field index for every record field access expression.
    pub field_index: FxHashMap<ExprId, u16>,
    /// Hidden scratch slot per `SELECT CASE`, keyed by the subject
    /// expression. Allocated here so slot assignment stays first-seen
    /// ordered, which the REPL relies on.
    pub select_temps: FxHashMap<ExprId, Resolution>,
    /// Default array lower bound (`OPTION BASE`).
    pub option_base: u8,
}

/// Run both passes. Errors go to `handler`; the returned tables are
/// complete for whatever analyzed cleanly.
pub fn analyze(program: &Program, handler: &Handler) -> Analysis {
    let mut analyzer = Analyzer::new(handler);
    analyzer.collect(&program.stmts, MODULE_SCOPE);
    analyzer.resolve_stmts(&program.stmts);
    analyzer.finish()
}

const MODULE_SCOPE: u32 = 0;

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    For,
    Do,
    While,
}

struct Analyzer<'a> {
    handler: &'a Handler,
    out: Analysis,
    global_map: FxHashMap<(Symbol, bool), u32>,
    local_maps: Vec<FxHashMap<(Symbol, bool), u32>>,
    /// (scope, label) → definition span. Scope 0 is the module; a
    /// procedure's scope is its id + 1.
    labels: FxHashMap<(u32, Symbol), Span>,
    current_proc: Option<ProcId>,
    loop_stack: Vec<LoopKind>,
}

impl<'a> Analyzer<'a> {
    fn new(handler: &'a Handler) -> Self {
        Self {
            handler,
            out: Analysis::default(),
            global_map: FxHashMap::default(),
            local_maps: Vec::new(),
            labels: FxHashMap::default(),
            current_proc: None,
            loop_stack: Vec::new(),
        }
    }

    fn finish(self) -> Analysis {
        self.out
    }

    fn error(&self, kind: DiagnosticKind, message: impl Into<String>, span: Span) {
        self.handler.report(kind, message, span);
    }

    // ===================================================================
    // Pass A: collection
    // ===================================================================

    fn collect(&mut self, stmts: &[Stmt], scope: u32) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Label(name) => {
                    if self.labels.insert((scope, *name), stmt.span).is_some() {
                        self.error(
                            DiagnosticKind::DuplicateLabel,
                            format!("duplicate label `{name}`"),
                            stmt.span,
                        );
                    }
                    // First DATA item lexically at-or-after this label.
                    self.out
                        .data_labels
                        .entry(*name)
                        .or_insert(self.out.data_pool.len() as u32);
                }
                StmtKind::Data { items } => {
                    for item in items {
                        self.out.data_pool.push(match item {
                            DataItem::Number(lit, _) => DataVal::Num(*lit),
                            DataItem::Str(bytes, _) => DataVal::Str(bytes.clone()),
                        });
                    }
                }
                StmtKind::Const { decls } => {
                    for decl in decls {
                        if self.out.consts.contains_key(&decl.name) {
                            self.error(
                                DiagnosticKind::Redeclared,
                                format!("constant `{}` already declared", decl.name),
                                decl.span,
                            );
                            continue;
                        }
                        match eval_const(&decl.value, &self.out.consts) {
                            Some(value) => {
                                self.out.consts.insert(decl.name, value);
                            }
                            None => self.error(
                                DiagnosticKind::NonConstInConst,
                                format!("CONST `{}` requires a constant expression", decl.name),
                                decl.value.span,
                            ),
                        }
                    }
                }
                StmtKind::TypeDef { name, fields } => self.collect_type(*name, fields, stmt.span),
                StmtKind::Proc(def) => {
                    let id = self.declare_proc(def.kind, def.name, &def.params, stmt.span, false);
                    if let Some(id) = id {
                        self.collect(&def.body, id + 1);
                    }
                }
                StmtKind::Declare { kind, name, params } => {
                    self.declare_proc(*kind, *name, params, stmt.span, true);
                }
                StmtKind::OptionBase(base) => self.out.option_base = *base,
                // Recurse into nested statement lists so labels and DATA
                // inside control flow are found too.
                StmtKind::If { arms, else_body } => {
                    for arm in arms {
                        self.collect(&arm.body, scope);
                    }
                    self.collect(else_body, scope);
                }
                StmtKind::Select { arms, else_body, .. } => {
                    for arm in arms {
                        self.collect(&arm.body, scope);
                    }
                    if let Some(body) = else_body {
                        self.collect(body, scope);
                    }
                }
                StmtKind::For { body, .. }
                | StmtKind::While { body, .. }
                | StmtKind::DoLoop { body, .. } => self.collect(body, scope),
                _ => {}
            }
        }
    }

    fn collect_type(&mut self, name: Symbol, fields: &[qbc_par::FieldDecl], span: Span) {
        let mut infos: Vec<FieldInfo> = Vec::new();
        let mut byte_offset = 0u32;
        for field in fields {
            if infos.iter().any(|f| f.name == field.name) {
                self.error(
                    DiagnosticKind::Redeclared,
                    format!("duplicate field `{}` in TYPE {}", field.name, name),
                    field.span,
                );
                continue;
            }
            let ty = self.resolve_type_name(&field.ty, field.span);
            if matches!(ty, Ty::String) {
                // Records hold fixed-size payloads only; a bare STRING
                // field has no fixed length.
                self.error(
                    DiagnosticKind::TypeMismatch,
                    format!("field `{}` needs a fixed length (STRING * n)", field.name),
                    field.span,
                );
            }
            let size = ty.size_bytes(&self.out.types);
            infos.push(FieldInfo {
                name: field.name,
                ty,
                index: infos.len() as u16,
                byte_offset,
            });
            byte_offset += size;
        }
        let layout = RecordLayout {
            name,
            fields: infos,
            size_bytes: byte_offset,
            span,
        };
        if self.out.types.define(layout).is_none() {
            self.error(
                DiagnosticKind::Redeclared,
                format!("TYPE `{name}` already defined"),
                span,
            );
        }
    }

    fn declare_proc(
        &mut self,
        kind: ProcKind,
        name: Symbol,
        params: &[qbc_par::Param],
        span: Span,
        declared_only: bool,
    ) -> Option<u32> {
        if let Some(&existing) = self.out.proc_by_name.get(&name) {
            let existing_decl_only = self.out.procs[existing as usize].declared_only;
            if declared_only || !existing_decl_only {
                if !declared_only {
                    self.error(
                        DiagnosticKind::Redeclared,
                        format!("procedure `{name}` already defined"),
                        span,
                    );
                }
                return if declared_only { None } else { Some(existing) };
            }
            // A definition completing an earlier DECLARE replaces it.
            let info = self.make_proc_info(kind, name, params, span, false);
            self.out.procs[existing as usize] = info;
            self.rebuild_local_map(existing);
            return Some(existing);
        }
        let id = self.out.procs.len() as ProcId;
        let info = self.make_proc_info(kind, name, params, span, declared_only);
        self.out.procs.push(info);
        self.out.proc_by_name.insert(name, id);
        self.local_maps.push(FxHashMap::default());
        self.rebuild_local_map(id);
        Some(id)
    }

    fn make_proc_info(
        &mut self,
        kind: ProcKind,
        name: Symbol,
        params: &[qbc_par::Param],
        span: Span,
        declared_only: bool,
    ) -> ProcInfo {
        let params: Vec<ParamInfo> = params
            .iter()
            .map(|p| {
                let ty = match &p.ty {
                    Some(tn) => self.resolve_type_name(tn, p.span),
                    None => sigil_ty(p.name).unwrap_or(Ty::Single),
                };
                ParamInfo {
                    name: p.name,
                    ty,
                    by_val: p.by_val,
                    is_array: p.is_array,
                }
            })
            .collect();
        let ret_ty = match kind {
            ProcKind::Function => Some(sigil_ty(name).unwrap_or(Ty::Single)),
            ProcKind::Sub => None,
        };
        let mut locals: Vec<VarInfo> = params
            .iter()
            .map(|p| VarInfo {
                name: p.name,
                ty: p.ty,
                is_array: p.is_array,
                dims: if p.is_array { 1 } else { 0 },
                shared: false,
                span,
            })
            .collect();
        if ret_ty.is_some() {
            locals.push(VarInfo {
                name,
                ty: ret_ty.unwrap(),
                is_array: false,
                dims: 0,
                shared: false,
                span,
            });
        }
        ProcInfo {
            kind,
            name,
            params,
            ret_ty,
            locals,
            span,
            declared_only,
        }
    }

    fn rebuild_local_map(&mut self, id: ProcId) {
        let map = &mut self.local_maps[id as usize];
        map.clear();
        for (slot, local) in self.out.procs[id as usize].locals.iter().enumerate() {
            map.insert((local.name, local.is_array), slot as u32);
        }
    }

    // ===================================================================
    // Pass B: resolution
    // ===================================================================

    fn resolve_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.resolve_stmt(stmt);
        }
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Label(_)
            | StmtKind::Const { .. }
            | StmtKind::TypeDef { .. }
            | StmtKind::Declare { .. }
            | StmtKind::Data { .. }
            | StmtKind::OptionBase(_)
            | StmtKind::Cls
            | StmtKind::Beep
            | StmtKind::End => {}
            StmtKind::Include(_) => {
                // The driver splices includes before analysis; one that
                // survives means the file could not be resolved there.
                self.error(
                    DiagnosticKind::UnexpectedToken,
                    "unresolved $INCLUDE",
                    stmt.span,
                );
            }
            StmtKind::Dim { shared, decls } | StmtKind::Redim { shared, decls } => {
                let redim = matches!(stmt.kind, StmtKind::Redim { .. });
                for decl in decls {
                    self.resolve_dim(decl, *shared, redim);
                }
            }
            StmtKind::Assign { target, value } => {
                let target_ty = self.resolve_lvalue(target);
                let value_ty = self.resolve_expr(value);
                self.check_assign(target_ty, value_ty, value, target.span);
            }
            StmtKind::Print { channel, items } => {
                if let Some(chan) = channel {
                    self.resolve_numeric(chan);
                }
                for piece in items {
                    if let PrintPiece::Expr(expr) = piece {
                        let ty = self.resolve_expr(expr);
                        if matches!(ty, Ty::Record(_)) {
                            self.error(
                                DiagnosticKind::TypeMismatch,
                                "cannot PRINT a record",
                                expr.span,
                            );
                        }
                    }
                }
            }
            StmtKind::Input { channel, targets, .. } => {
                if let Some(chan) = channel {
                    self.resolve_numeric(chan);
                }
                for target in targets {
                    let ty = self.resolve_lvalue(target);
                    if matches!(ty, Ty::Record(_)) {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            "cannot INPUT into a record",
                            target.span,
                        );
                    }
                }
            }
            StmtKind::LineInput { channel, target, .. } => {
                if let Some(chan) = channel {
                    self.resolve_numeric(chan);
                }
                let ty = self.resolve_lvalue(target);
                if !ty.is_string() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "LINE INPUT needs a string variable",
                        target.span,
                    );
                }
            }
            StmtKind::If { arms, else_body } => {
                for arm in arms {
                    self.resolve_condition(&arm.cond);
                    self.resolve_stmts(&arm.body);
                }
                self.resolve_stmts(else_body);
            }
            StmtKind::Select { subject, arms, else_body } => {
                let subject_ty = self.resolve_expr(subject);
                if !subject_ty.is_numeric() && !subject_ty.is_string() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "SELECT CASE subject must be numeric or a string",
                        subject.span,
                    );
                }
                // Hidden slot holding the evaluated subject while the
                // arms test against it.
                let temp_name = Symbol::intern(&format!("SELECT~{}", subject.id.0));
                let (temp_res, _) =
                    self.declare_hidden(temp_name, subject_ty.decay(), subject.span);
                self.out.select_temps.insert(subject.id, temp_res);
                for arm in arms {
                    for guard in &arm.guards {
                        self.resolve_case_guard(guard, subject_ty, arm.span);
                    }
                    self.resolve_stmts(&arm.body);
                }
                if let Some(body) = else_body {
                    self.resolve_stmts(body);
                }
            }
            StmtKind::For { counter, from, to, step, body } => {
                let counter_ty = self.resolve_lvalue(counter);
                if !matches!(counter.kind, ExprKind::Var(_)) || !counter_ty.is_numeric() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "FOR counter must be a numeric scalar",
                        counter.span,
                    );
                }
                for bound in [from, to].into_iter().chain(step.as_ref()) {
                    let ty = self.resolve_expr(bound);
                    if !ty.is_numeric() {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            "FOR bounds must be numeric",
                            bound.span,
                        );
                    } else if counter_ty.is_numeric() && ty != counter_ty {
                        self.out.coercions.insert(bound.id, counter_ty);
                    }
                }
                if let Some(step) = step {
                    if let Some(value) = eval_const(step, &self.out.consts) {
                        if value.as_f64() == Some(0.0) {
                            self.error(
                                DiagnosticKind::InvalidForStep,
                                "STEP 0 loops execute zero iterations",
                                step.span,
                            );
                        }
                    }
                }
                self.loop_stack.push(LoopKind::For);
                self.resolve_stmts(body);
                self.loop_stack.pop();
            }
            StmtKind::While { cond, body } => {
                self.resolve_condition(cond);
                self.loop_stack.push(LoopKind::While);
                self.resolve_stmts(body);
                self.loop_stack.pop();
            }
            StmtKind::DoLoop { pre, post, body } => {
                for cond in [pre, post].into_iter().flatten() {
                    match cond {
                        LoopCond::While(e) | LoopCond::Until(e) => self.resolve_condition(e),
                    }
                }
                self.loop_stack.push(LoopKind::Do);
                self.resolve_stmts(body);
                self.loop_stack.pop();
            }
            StmtKind::Exit(kind) => self.check_exit(*kind, stmt.span),
            StmtKind::Goto(label) | StmtKind::Gosub(label) => self.check_label(label),
            StmtKind::Return(target) => {
                if let Some(label) = target {
                    self.check_label(label);
                }
            }
            StmtKind::Proc(def) => {
                let id = self.out.proc_by_name[&def.name];
                let saved = self.current_proc.replace(id);
                self.resolve_stmts(&def.body);
                self.current_proc = saved;
            }
            StmtKind::Call { name, args } => self.resolve_call_stmt(*name, args, stmt.span),
            StmtKind::Open { path, channel, .. } => {
                let path_ty = self.resolve_expr(path);
                if !path_ty.is_string() {
                    self.error(DiagnosticKind::TypeMismatch, "OPEN path must be a string", path.span);
                }
                self.resolve_numeric(channel);
            }
            StmtKind::Close { channels } => {
                for chan in channels {
                    self.resolve_numeric(chan);
                }
            }
            StmtKind::Read { targets } => {
                for target in targets {
                    let ty = self.resolve_lvalue(target);
                    if matches!(ty, Ty::Record(_)) {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            "cannot READ into a record",
                            target.span,
                        );
                    }
                }
            }
            StmtKind::Restore(target) => {
                if let Some(label) = target {
                    if !self.out.data_labels.contains_key(&label.name) {
                        self.error(
                            DiagnosticKind::UnknownLabel,
                            format!("unknown label `{}` in RESTORE", label.name),
                            label.span,
                        );
                    }
                }
            }
            StmtKind::Randomize(seed) => {
                if let Some(seed) = seed {
                    self.resolve_numeric(seed);
                }
            }
            StmtKind::Sleep(duration) => {
                if let Some(duration) = duration {
                    self.resolve_numeric(duration);
                }
            }
            StmtKind::Swap(a, b) => {
                let ta = self.resolve_lvalue(a);
                let tb = self.resolve_lvalue(b);
                if ta != tb {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        format!(
                            "SWAP operands must have the same type ({} vs {})",
                            ta.name(&self.out.types),
                            tb.name(&self.out.types)
                        ),
                        a.span.merge(b.span),
                    );
                }
            }
        }
    }

    fn resolve_dim(&mut self, decl: &VarDecl, shared: bool, redim: bool) {
        let ty = match &decl.ty {
            Some(tn) => self.resolve_type_name(tn, decl.span),
            None => sigil_ty(decl.name).unwrap_or(Ty::Single),
        };
        let is_array = decl.dims.is_some();
        let dims = decl.dims.as_ref().map(|d| d.len() as u8).unwrap_or(0);
        if let Some(bounds) = &decl.dims {
            for DimBound { lower, upper } in bounds {
                for bound in lower.iter().chain(std::iter::once(upper)) {
                    self.resolve_numeric(bound);
                    self.coerce_to(bound, Ty::Int32);
                }
            }
        }
        if self.out.consts.contains_key(&decl.name) {
            self.error(
                DiagnosticKind::Redeclared,
                format!("`{}` is a constant", decl.name),
                decl.span,
            );
            return;
        }

        let info = VarInfo {
            name: decl.name,
            ty,
            is_array,
            dims,
            shared,
            span: decl.span,
        };

        let into_module = self.current_proc.is_none() || shared;
        if into_module {
            if let Some(&slot) = self.global_map.get(&(decl.name, is_array)) {
                let existing = &self.out.globals[slot as usize];
                if redim && is_array {
                    if existing.ty != ty || existing.dims != dims {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            format!("REDIM cannot change the type or rank of `{}`", decl.name),
                            decl.span,
                        );
                    }
                } else {
                    self.error(
                        DiagnosticKind::Redeclared,
                        format!("`{}` already declared", decl.name),
                        decl.span,
                    );
                }
                return;
            }
            let slot = self.out.globals.len() as u32;
            self.global_map.insert((decl.name, is_array), slot);
            self.out.globals.push(info);
        } else {
            let proc = self.current_proc.unwrap() as usize;
            if let Some(&slot) = self.local_maps[proc].get(&(decl.name, is_array)) {
                let existing = &self.out.procs[proc].locals[slot as usize];
                if redim && is_array {
                    if existing.ty != ty || existing.dims != dims {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            format!("REDIM cannot change the type or rank of `{}`", decl.name),
                            decl.span,
                        );
                    }
                } else {
                    self.error(
                        DiagnosticKind::Redeclared,
                        format!("`{}` already declared", decl.name),
                        decl.span,
                    );
                }
                return;
            }
            let slot = self.out.procs[proc].locals.len() as u32;
            self.local_maps[proc].insert((decl.name, is_array), slot);
            self.out.procs[proc].locals.push(info);
        }
    }

    fn resolve_type_name(&mut self, tn: &TypeName, span: Span) -> Ty {
        match tn {
            TypeName::Integer => Ty::Int16,
            TypeName::Long => Ty::Int32,
            TypeName::Integer64 => Ty::Int64,
            TypeName::UnsignedLong => Ty::UInt32,
            TypeName::Single => Ty::Single,
            TypeName::Double => Ty::Double,
            TypeName::String { fixed_len: None } => Ty::String,
            TypeName::String { fixed_len: Some(len) } => {
                match eval_const(len, &self.out.consts).and_then(|v| v.as_i64()) {
                    Some(n) if (1..=u16::MAX as i64).contains(&n) => Ty::FixedString(n as u16),
                    Some(_) => {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            "fixed string length out of range",
                            span,
                        );
                        Ty::String
                    }
                    None => {
                        self.error(
                            DiagnosticKind::NonConstInConst,
                            "fixed string length must be constant",
                            span,
                        );
                        Ty::String
                    }
                }
            }
            TypeName::User(name) => match self.out.types.lookup(*name) {
                Some(id) => Ty::Record(id),
                None => {
                    self.error(
                        DiagnosticKind::Undeclared,
                        format!("unknown TYPE `{name}`"),
                        span,
                    );
                    Ty::Single
                }
            },
        }
    }

    fn scope_id(&self) -> u32 {
        self.current_proc.map(|p| p + 1).unwrap_or(MODULE_SCOPE)
    }

    fn check_label(&mut self, label: &LabelRef) {
        if !self.labels.contains_key(&(self.scope_id(), label.name)) {
            self.error(
                DiagnosticKind::UnknownLabel,
                format!("unknown label `{}`", label.name),
                label.span,
            );
        }
    }

    fn check_exit(&self, kind: ExitKind, span: Span) {
        let ok = match kind {
            ExitKind::For => self.loop_stack.contains(&LoopKind::For),
            ExitKind::Do => self.loop_stack.contains(&LoopKind::Do),
            ExitKind::Sub => matches!(
                self.current_proc.map(|p| self.out.procs[p as usize].kind),
                Some(ProcKind::Sub)
            ),
            ExitKind::Function => matches!(
                self.current_proc.map(|p| self.out.procs[p as usize].kind),
                Some(ProcKind::Function)
            ),
        };
        if !ok {
            let what = match kind {
                ExitKind::For => "EXIT FOR outside a FOR loop",
                ExitKind::Do => "EXIT DO outside a DO loop",
                ExitKind::Sub => "EXIT SUB outside a SUB",
                ExitKind::Function => "EXIT FUNCTION outside a FUNCTION",
            };
            self.error(DiagnosticKind::UnexpectedToken, what, span);
        }
    }

    fn resolve_condition(&mut self, cond: &Expr) {
        let ty = self.resolve_expr(cond);
        if !ty.is_numeric() {
            self.error(
                DiagnosticKind::TypeMismatch,
                "condition must be numeric",
                cond.span,
            );
        }
    }

    fn resolve_numeric(&mut self, expr: &Expr) -> Ty {
        let ty = self.resolve_expr(expr);
        if !ty.is_numeric() {
            self.error(
                DiagnosticKind::TypeMismatch,
                "expected a numeric expression",
                expr.span,
            );
        }
        ty
    }

    fn coerce_to(&mut self, expr: &Expr, target: Ty) {
        if let Some(&ty) = self.out.expr_tys.get(&expr.id) {
            if ty.is_numeric() && ty != target {
                self.out.coercions.insert(expr.id, target);
            }
        }
    }

    fn resolve_case_guard(&mut self, guard: &CaseGuard, subject_ty: Ty, span: Span) {
        let subject_ty = subject_ty.decay();
        let mut check_one = |this: &mut Self, expr: &Expr| {
            let ty = this.resolve_expr(expr);
            match (subject_ty.is_string(), ty.is_string()) {
                (true, true) => {}
                (false, false) if ty.is_numeric() && subject_ty.is_numeric() => {
                    if ty != subject_ty {
                        this.out.coercions.insert(expr.id, subject_ty);
                    }
                }
                _ => this.error(
                    DiagnosticKind::TypeMismatch,
                    "CASE guard type does not match SELECT subject",
                    expr.span,
                ),
            }
        };
        match guard {
            CaseGuard::Value(v) | CaseGuard::Is(_, v) => check_one(self, v),
            CaseGuard::Range(lo, hi) => {
                check_one(self, lo);
                check_one(self, hi);
                if let (Some(a), Some(b)) = (
                    eval_const(lo, &self.out.consts).and_then(|v| v.as_f64()),
                    eval_const(hi, &self.out.consts).and_then(|v| v.as_f64()),
                ) {
                    if a > b {
                        self.error(
                            DiagnosticKind::BadCaseRange,
                            "empty CASE range (lower bound above upper)",
                            span,
                        );
                    }
                }
            }
        }
    }

    fn resolve_call_stmt(&mut self, name: Symbol, args: &[Expr], span: Span) {
        match self.out.proc_by_name.get(&name).copied() {
            Some(id) => {
                if self.out.procs[id as usize].kind == ProcKind::Function {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        format!("`{name}` is a FUNCTION; call it in an expression"),
                        span,
                    );
                    return;
                }
                self.check_proc_args(id, args, span);
            }
            None => self.error(
                DiagnosticKind::Undeclared,
                format!("unknown SUB `{name}`"),
                span,
            ),
        }
    }

    fn check_proc_args(&mut self, id: ProcId, args: &[Expr], span: Span) {
        let params: Vec<ParamInfo> = self.out.procs[id as usize].params.clone();
        if args.len() != params.len() {
            self.error(
                DiagnosticKind::ArityMismatch,
                format!(
                    "`{}` takes {} argument(s), {} given",
                    self.out.procs[id as usize].name,
                    params.len(),
                    args.len()
                ),
                span,
            );
        }
        for (arg, param) in args.iter().zip(&params) {
            if param.is_array {
                self.resolve_whole_array_arg(arg, param);
                continue;
            }
            let arg_ty = self.resolve_expr(arg);
            let param_ty = param.ty;
            let by_ref_lvalue = !param.by_val
                && arg.is_lvalue_shaped()
                && !matches!(
                    self.out.resolutions.get(&arg.id),
                    Some(Resolution::Const(_)) | Some(Resolution::FuncCall(_)) | Some(Resolution::Intrinsic(_))
                );
            if by_ref_lvalue {
                // True by-reference needs matching storage types.
                if arg_ty != param_ty.decay() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        format!(
                            "by-reference argument must be {} exactly",
                            param_ty.name(&self.out.types)
                        ),
                        arg.span,
                    );
                }
            } else {
                match (param_ty.is_numeric(), arg_ty.is_numeric()) {
                    (true, true) => {
                        if arg_ty != param_ty {
                            self.out.coercions.insert(arg.id, param_ty);
                        }
                    }
                    _ if param_ty.decay() == arg_ty.decay() => {}
                    _ => self.error(
                        DiagnosticKind::TypeMismatch,
                        format!("argument must be {}", param_ty.name(&self.out.types)),
                        arg.span,
                    ),
                }
            }
        }
    }

    fn resolve_whole_array_arg(&mut self, arg: &Expr, param: &ParamInfo) {
        let ExprKind::Call { name, args } = &arg.kind else {
            self.error(
                DiagnosticKind::TypeMismatch,
                "expected a whole-array argument like `A()`",
                arg.span,
            );
            return;
        };
        if !args.is_empty() {
            self.error(
                DiagnosticKind::TypeMismatch,
                "whole-array arguments take no subscript",
                arg.span,
            );
            return;
        }
        let resolution = self.lookup_array(*name);
        match resolution {
            Some((res, elem_ty)) => {
                let whole = match res {
                    Resolution::ArrayGlobal(slot) => Resolution::ArrayWholeGlobal(slot),
                    Resolution::ArrayLocal(slot) => Resolution::ArrayWholeLocal(slot),
                    _ => unreachable!(),
                };
                self.out.resolutions.insert(arg.id, whole);
                self.out.expr_tys.insert(arg.id, elem_ty);
                if elem_ty.decay() != param.ty.decay() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "array element type does not match the parameter",
                        arg.span,
                    );
                }
            }
            None => self.error(
                DiagnosticKind::Undeclared,
                format!("unknown array `{name}`"),
                arg.span,
            ),
        }
    }

    /// Array lookup by name following scope rules; element resolution.
    fn lookup_array(&self, name: Symbol) -> Option<(Resolution, Ty)> {
        if let Some(proc) = self.current_proc {
            if let Some(&slot) = self.local_maps[proc as usize].get(&(name, true)) {
                let ty = self.out.procs[proc as usize].locals[slot as usize].ty;
                return Some((Resolution::ArrayLocal(slot), ty));
            }
            if let Some(&slot) = self.global_map.get(&(name, true)) {
                let info = &self.out.globals[slot as usize];
                if info.shared {
                    return Some((Resolution::ArrayGlobal(slot), info.ty));
                }
                return None;
            }
            None
        } else {
            self.global_map
                .get(&(name, true))
                .map(|&slot| (Resolution::ArrayGlobal(slot), self.out.globals[slot as usize].ty))
        }
    }

    fn lookup_scalar(&self, name: Symbol) -> Option<(Resolution, Ty)> {
        if let Some(proc) = self.current_proc {
            if let Some(&slot) = self.local_maps[proc as usize].get(&(name, false)) {
                let ty = self.out.procs[proc as usize].locals[slot as usize].ty;
                return Some((Resolution::Local(slot), ty));
            }
            if let Some(&slot) = self.global_map.get(&(name, false)) {
                let info = &self.out.globals[slot as usize];
                if info.shared {
                    return Some((Resolution::Global(slot), info.ty));
                }
            }
            None
        } else {
            self.global_map
                .get(&(name, false))
                .map(|&slot| (Resolution::Global(slot), self.out.globals[slot as usize].ty))
        }
    }

    /// Auto-declare a scalar on first use, QBasic-style.
    fn auto_declare(&mut self, name: Symbol, span: Span) -> (Resolution, Ty) {
        let ty = sigil_ty(name).unwrap_or(Ty::Single);
        self.declare_hidden(name, ty, span)
    }

    /// Declare a scalar of a known type in the current scope.
    fn declare_hidden(&mut self, name: Symbol, ty: Ty, span: Span) -> (Resolution, Ty) {
        let info = VarInfo {
            name,
            ty,
            is_array: false,
            dims: 0,
            shared: false,
            span,
        };
        match self.current_proc {
            Some(proc) => {
                let slot = self.out.procs[proc as usize].locals.len() as u32;
                self.local_maps[proc as usize].insert((name, false), slot);
                self.out.procs[proc as usize].locals.push(info);
                (Resolution::Local(slot), ty)
            }
            None => {
                let slot = self.out.globals.len() as u32;
                self.global_map.insert((name, false), slot);
                self.out.globals.push(info);
                (Resolution::Global(slot), ty)
            }
        }
    }

    /// Resolve an l-value and return its *storage* type (fixed strings
    /// not decayed). Also fills the side tables for the expression.
    fn resolve_lvalue(&mut self, expr: &Expr) -> Ty {
        match &expr.kind {
            ExprKind::Var(name) => {
                if self.out.consts.contains_key(name) {
                    self.error(
                        DiagnosticKind::ConstAssign,
                        format!("cannot assign to constant `{name}`"),
                        expr.span,
                    );
                    self.out.resolutions.insert(expr.id, Resolution::Const(*name));
                    let ty = self.out.consts[name].ty();
                    self.out.expr_tys.insert(expr.id, ty);
                    return ty;
                }
                // Function-name return slot inside the function's body.
                if let Some(proc) = self.current_proc {
                    let info = &self.out.procs[proc as usize];
                    if info.name == *name && info.ret_ty.is_some() {
                        let ty = info.ret_ty.unwrap();
                        self.out.resolutions.insert(expr.id, Resolution::FuncRet);
                        self.out.expr_tys.insert(expr.id, ty.decay());
                        return ty;
                    }
                }
                let (res, ty) = self
                    .lookup_scalar(*name)
                    .unwrap_or_else(|| self.auto_declare(*name, expr.span));
                self.out.resolutions.insert(expr.id, res);
                self.out.expr_tys.insert(expr.id, ty.decay());
                ty
            }
            ExprKind::Call { name, args } => {
                match self.lookup_array(*name) {
                    Some((res, elem_ty)) => {
                        let dims = self.array_dims(res);
                        if args.len() != dims as usize {
                            self.error(
                                DiagnosticKind::ArityMismatch,
                                format!(
                                    "array `{name}` has {dims} dimension(s), {} index(es) given",
                                    args.len()
                                ),
                                expr.span,
                            );
                        }
                        for index in args {
                            self.resolve_numeric(index);
                            self.coerce_to(index, Ty::Int32);
                        }
                        self.out.resolutions.insert(expr.id, res);
                        self.out.expr_tys.insert(expr.id, elem_ty.decay());
                        elem_ty
                    }
                    None => {
                        self.error(
                            DiagnosticKind::Undeclared,
                            format!("array `{name}` has not been DIMmed"),
                            expr.span,
                        );
                        self.out.expr_tys.insert(expr.id, Ty::Single);
                        Ty::Single
                    }
                }
            }
            ExprKind::Field { base, field } => {
                let base_ty = self.resolve_lvalue(base);
                match base_ty {
                    Ty::Record(type_id) => {
                        match self.out.types.layout(type_id).field(*field) {
                            Some(info) => {
                                let (index, ty) = (info.index, info.ty);
                                self.out.field_index.insert(expr.id, index);
                                self.out.expr_tys.insert(expr.id, ty.decay());
                                ty
                            }
                            None => {
                                self.error(
                                    DiagnosticKind::RecordFieldUnknown,
                                    format!(
                                        "no field `{field}` in TYPE {}",
                                        self.out.types.layout(type_id).name
                                    ),
                                    expr.span,
                                );
                                self.out.expr_tys.insert(expr.id, Ty::Single);
                                Ty::Single
                            }
                        }
                    }
                    _ => {
                        self.error(
                            DiagnosticKind::TypeMismatch,
                            "field access on a non-record value",
                            base.span,
                        );
                        self.out.expr_tys.insert(expr.id, Ty::Single);
                        Ty::Single
                    }
                }
            }
            _ => {
                self.error(
                    DiagnosticKind::NotAnLValue,
                    "expected a variable, array element or record field",
                    expr.span,
                );
                self.resolve_expr(expr)
            }
        }
    }

    fn array_dims(&self, res: Resolution) -> u8 {
        match res {
            Resolution::ArrayGlobal(slot) => self.out.globals[slot as usize].dims,
            Resolution::ArrayLocal(slot) => {
                let proc = self.current_proc.unwrap() as usize;
                self.out.procs[proc].locals[slot as usize].dims
            }
            _ => 0,
        }
    }

    fn check_assign(&mut self, target_ty: Ty, value_ty: Ty, value: &Expr, span: Span) {
        match target_ty {
            t if t.is_numeric() => {
                if !value_ty.is_numeric() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        format!("cannot assign a string to {}", t.name(&self.out.types)),
                        span,
                    );
                } else if value_ty != t {
                    self.out.coercions.insert(value.id, t);
                }
            }
            Ty::String => {
                if !value_ty.is_string() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "cannot assign a number to a string",
                        span,
                    );
                }
            }
            Ty::FixedString(len) => {
                if !value_ty.is_string() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "cannot assign a number to a string",
                        span,
                    );
                } else {
                    // Pad or truncate to the fixed length at store time.
                    self.out.coercions.insert(value.id, Ty::FixedString(len));
                }
            }
            Ty::Record(target_id) => match value_ty {
                Ty::Record(source_id) if source_id == target_id => {}
                _ => self.error(
                    DiagnosticKind::TypeMismatch,
                    "record assignment needs the same TYPE on both sides",
                    span,
                ),
            },
            _ => unreachable!("all non-numeric, non-string, non-record Ty variants are covered above"),
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn resolve_expr(&mut self, expr: &Expr) -> Ty {
        let ty = self.resolve_expr_inner(expr);
        self.out.expr_tys.insert(expr.id, ty);
        ty
    }

    fn resolve_expr_inner(&mut self, expr: &Expr) -> Ty {
        match &expr.kind {
            ExprKind::Number(lit) => match lit {
                NumLit::Int16(_) => Ty::Int16,
                NumLit::Int32(_) => Ty::Int32,
                NumLit::Int64(_) => Ty::Int64,
                NumLit::Single(_) => Ty::Single,
                NumLit::Double(_) => Ty::Double,
            },
            ExprKind::StringLit(_) => Ty::String,
            ExprKind::Var(name) => {
                if let Some(value) = self.out.consts.get(name) {
                    let ty = value.ty();
                    self.out.resolutions.insert(expr.id, Resolution::Const(*name));
                    return ty;
                }
                if let Some(proc) = self.current_proc {
                    let info = &self.out.procs[proc as usize];
                    if info.name == *name && info.ret_ty.is_some() {
                        self.out.resolutions.insert(expr.id, Resolution::FuncRet);
                        return info.ret_ty.unwrap().decay();
                    }
                }
                if let Some((res, ty)) = self.lookup_scalar(*name) {
                    self.out.resolutions.insert(expr.id, res);
                    return ty.decay();
                }
                // Bare function call (no parentheses) or bare intrinsic.
                if let Some(&id) = self.out.proc_by_name.get(name) {
                    if self.out.procs[id as usize].kind == ProcKind::Function {
                        if !self.out.procs[id as usize].params.is_empty() {
                            self.error(
                                DiagnosticKind::ArityMismatch,
                                format!("`{name}` needs arguments"),
                                expr.span,
                            );
                        }
                        self.out.resolutions.insert(expr.id, Resolution::FuncCall(id));
                        return self.out.procs[id as usize].ret_ty.unwrap().decay();
                    }
                }
                if let Some(intrinsic) = Intrinsic::lookup(*name) {
                    if intrinsic.arg_range().0 == 0 {
                        self.out
                            .resolutions
                            .insert(expr.id, Resolution::Intrinsic(intrinsic));
                        return intrinsic.result_ty(&[]);
                    }
                }
                let (res, ty) = self.auto_declare(*name, expr.span);
                self.out.resolutions.insert(expr.id, res);
                ty.decay()
            }
            ExprKind::Call { name, args } => {
                // Array element access wins over calls.
                if self.lookup_array(*name).is_some() && !args.is_empty() {
                    return self.resolve_lvalue(expr).decay();
                }
                if self.lookup_array(*name).is_some() && args.is_empty() {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        format!("array `{name}` used without a subscript"),
                        expr.span,
                    );
                    return Ty::Single;
                }
                if let Some(&id) = self.out.proc_by_name.get(name) {
                    let info = &self.out.procs[id as usize];
                    match info.ret_ty {
                        Some(ret) => {
                            self.out.resolutions.insert(expr.id, Resolution::FuncCall(id));
                            self.check_proc_args(id, args, expr.span);
                            return ret.decay();
                        }
                        None => {
                            self.error(
                                DiagnosticKind::TypeMismatch,
                                format!("SUB `{name}` has no value"),
                                expr.span,
                            );
                            return Ty::Single;
                        }
                    }
                }
                if let Some(intrinsic) = Intrinsic::lookup(*name) {
                    return self.resolve_intrinsic(intrinsic, expr, args);
                }
                self.error(
                    DiagnosticKind::Undeclared,
                    format!("unknown function or array `{name}`"),
                    expr.span,
                );
                Ty::Single
            }
            ExprKind::Field { .. } => self.resolve_lvalue(expr).decay(),
            ExprKind::Unary { op, operand } => {
                let ty = self.resolve_expr(operand);
                match op {
                    UnOp::Neg => {
                        if !ty.is_numeric() {
                            self.error(
                                DiagnosticKind::TypeMismatch,
                                "unary `-` needs a number",
                                expr.span,
                            );
                            return Ty::Single;
                        }
                        if ty == Ty::UInt32 {
                            self.out.coercions.insert(operand.id, Ty::Int64);
                            Ty::Int64
                        } else {
                            ty
                        }
                    }
                    UnOp::Not => {
                        if !ty.is_numeric() {
                            self.error(
                                DiagnosticKind::TypeMismatch,
                                "NOT needs a number",
                                expr.span,
                            );
                            return Ty::Int32;
                        }
                        let target = ty.integer_join(ty);
                        if ty != target {
                            self.out.coercions.insert(operand.id, target);
                        }
                        target
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => self.resolve_binary(*op, lhs, rhs, expr.span),
        }
    }

    fn resolve_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, span: Span) -> Ty {
        let lt = self.resolve_expr(lhs);
        let rt = self.resolve_expr(rhs);

        // String operands: concatenation and comparison only.
        if lt.is_string() || rt.is_string() {
            if !(lt.is_string() && rt.is_string()) {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    "cannot mix strings and numbers",
                    span,
                );
                return Ty::Single;
            }
            return match op {
                BinOp::Add => Ty::String,
                _ if op.is_relational() => Ty::Int16,
                _ => {
                    self.error(
                        DiagnosticKind::TypeMismatch,
                        "operator not defined for strings",
                        span,
                    );
                    Ty::Single
                }
            };
        }

        if !lt.is_numeric() || !rt.is_numeric() {
            self.error(DiagnosticKind::TypeMismatch, "operands must be numeric", span);
            return Ty::Single;
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul => {
                let join = lt.join(rt);
                self.coerce_to(lhs, join);
                self.coerce_to(rhs, join);
                join
            }
            BinOp::Div => {
                let join = lt.join(rt);
                let target = if join == Ty::Double { Ty::Double } else { Ty::Single };
                self.coerce_to(lhs, target);
                self.coerce_to(rhs, target);
                target
            }
            BinOp::IntDiv | BinOp::Mod => {
                let target = lt.integer_join(rt);
                self.coerce_to(lhs, target);
                self.coerce_to(rhs, target);
                target
            }
            BinOp::Pow => {
                self.coerce_to(lhs, Ty::Double);
                self.coerce_to(rhs, Ty::Double);
                Ty::Double
            }
            BinOp::And | BinOp::Or => {
                let target = lt.integer_join(rt);
                self.coerce_to(lhs, target);
                self.coerce_to(rhs, target);
                target
            }
            _ => {
                // Relational.
                let join = lt.join(rt);
                self.coerce_to(lhs, join);
                self.coerce_to(rhs, join);
                Ty::Int16
            }
        }
    }

    fn resolve_intrinsic(&mut self, intrinsic: Intrinsic, expr: &Expr, args: &[Expr]) -> Ty {
        let (min, max) = intrinsic.arg_range();
        if args.len() < min as usize || args.len() > max as usize {
            self.error(
                DiagnosticKind::ArityMismatch,
                format!(
                    "{} takes {} argument(s), {} given",
                    intrinsic.name(),
                    if min == max {
                        min.to_string()
                    } else {
                        format!("{min} to {max}")
                    },
                    args.len()
                ),
                expr.span,
            );
        }
        let mut arg_tys = Vec::with_capacity(args.len());
        for (idx, arg) in args.iter().enumerate() {
            let ty = self.resolve_expr(arg);
            arg_tys.push(ty);
            if intrinsic.arg_is_lenient(idx) {
                continue;
            }
            let expected = intrinsic.arg_kind(idx, args.len());
            let ok = match expected {
                ArgKind::Num => ty.is_numeric(),
                ArgKind::Str => ty.is_string(),
            };
            if !ok {
                self.error(
                    DiagnosticKind::TypeMismatch,
                    format!(
                        "argument {} of {} must be {}",
                        idx + 1,
                        intrinsic.name(),
                        match expected {
                            ArgKind::Num => "numeric",
                            ArgKind::Str => "a string",
                        }
                    ),
                    arg.span,
                );
            }
        }
        self.out
            .resolutions
            .insert(expr.id, Resolution::Intrinsic(intrinsic));
        intrinsic.result_ty(&arg_tys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbc_util::FileId;

    fn analyze_src(src: &str) -> (Analysis, Handler) {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize(src, FileId::DUMMY, &handler);
        let program = qbc_par::parse(tokens, &handler);
        assert!(!handler.has_errors(), "parse failed: {:?}", handler.diagnostics());
        let analysis = analyze(&program, &handler);
        (analysis, handler)
    }

    fn analyze_ok(src: &str) -> Analysis {
        let (analysis, handler) = analyze_src(src);
        assert!(
            !handler.has_errors(),
            "unexpected diagnostics: {:?}",
            handler.diagnostics()
        );
        analysis
    }

    fn kinds(handler: &Handler) -> Vec<DiagnosticKind> {
        handler.diagnostics().iter().map(|d| d.kind).collect()
    }

    #[test]
    fn test_auto_declare_defaults_to_single() {
        let analysis = analyze_ok("x = 1\ny% = 2\ns$ = \"hi\"");
        assert_eq!(analysis.globals.len(), 3);
        assert_eq!(analysis.globals[0].ty, Ty::Single);
        assert_eq!(analysis.globals[1].ty, Ty::Int16);
        assert_eq!(analysis.globals[2].ty, Ty::String);
    }

    #[test]
    fn test_sigils_make_distinct_variables() {
        let analysis = analyze_ok("A% = 1\nA! = 2\nA = 3");
        assert_eq!(analysis.globals.len(), 3);
    }

    #[test]
    fn test_dim_as_type() {
        let analysis = analyze_ok("DIM n AS LONG\nn = 5");
        assert_eq!(analysis.globals[0].ty, Ty::Int32);
        // The INTEGER literal is coerced up to LONG on assignment.
        assert!(analysis.coercions.values().any(|&t| t == Ty::Int32));
    }

    #[test]
    fn test_redeclared_dim_reports() {
        let (_, handler) = analyze_src("DIM n AS LONG\nDIM n AS LONG");
        assert!(kinds(&handler).contains(&DiagnosticKind::Redeclared));
    }

    #[test]
    fn test_const_folding_and_assignment() {
        let (_, handler) = analyze_src("CONST Pi = 3.14159\nPi = 1");
        assert!(kinds(&handler).contains(&DiagnosticKind::ConstAssign));
    }

    #[test]
    fn test_non_const_in_const() {
        let (_, handler) = analyze_src("x = 5\nCONST C = x + 1");
        assert!(kinds(&handler).contains(&DiagnosticKind::NonConstInConst));
    }

    #[test]
    fn test_type_def_and_field_access() {
        let analysis = analyze_ok(
            "TYPE Point\n x AS SINGLE\n y AS SINGLE\nEND TYPE\nDIM p AS Point\np.x = 1.5\nPRINT p.y",
        );
        assert_eq!(analysis.types.len(), 1);
        assert!(!analysis.field_index.is_empty());
    }

    #[test]
    fn test_unknown_field_reports() {
        let (_, handler) = analyze_src(
            "TYPE Point\n x AS SINGLE\nEND TYPE\nDIM p AS Point\np.z = 1",
        );
        assert!(kinds(&handler).contains(&DiagnosticKind::RecordFieldUnknown));
    }

    #[test]
    fn test_array_arity_checked() {
        let (_, handler) = analyze_src("DIM a(10, 10)\na(1) = 2");
        assert!(kinds(&handler).contains(&DiagnosticKind::ArityMismatch));
    }

    #[test]
    fn test_array_requires_dim() {
        let (_, handler) = analyze_src("a(1) = 2");
        assert!(kinds(&handler).contains(&DiagnosticKind::Undeclared));
    }

    #[test]
    fn test_mixed_arithmetic_widen() {
        let analysis = analyze_ok("DIM a AS INTEGER\nDIM d AS DOUBLE\nx = a + d");
        // `a` widens to DOUBLE for the addition.
        assert!(analysis.coercions.values().any(|&t| t == Ty::Double));
    }

    #[test]
    fn test_string_number_mix_reports() {
        let (_, handler) = analyze_src("x = \"a\" + 1");
        assert!(kinds(&handler).contains(&DiagnosticKind::TypeMismatch));
    }

    #[test]
    fn test_division_always_floats() {
        let analysis = analyze_ok("DIM a AS INTEGER\nx = a / 2");
        let div_ty = analysis
            .expr_tys
            .values()
            .filter(|t| **t == Ty::Single)
            .count();
        assert!(div_ty >= 1);
    }

    #[test]
    fn test_labels_resolve_per_scope() {
        let (_, handler) = analyze_src("GOTO Missing");
        assert!(kinds(&handler).contains(&DiagnosticKind::UnknownLabel));

        let analysis = analyze_ok("Start:\nGOTO Start\nGOSUB Start");
        assert!(!analysis.data_labels.is_empty());
    }

    #[test]
    fn test_label_in_other_scope_is_unknown() {
        let (_, handler) = analyze_src("SUB S\nGOTO Outside\nEND SUB\nOutside:");
        assert!(kinds(&handler).contains(&DiagnosticKind::UnknownLabel));
    }

    #[test]
    fn test_duplicate_label_reports() {
        let (_, handler) = analyze_src("L1:\nL1:");
        assert!(kinds(&handler).contains(&DiagnosticKind::DuplicateLabel));
    }

    #[test]
    fn test_data_pool_and_restore_labels() {
        let analysis = analyze_ok("READ a, b\nDATA 1, 2\nL2: DATA 3, 4\nRESTORE L2");
        assert_eq!(analysis.data_pool.len(), 4);
        assert_eq!(analysis.data_labels[&Symbol::intern("L2")], 2);
    }

    #[test]
    fn test_proc_signatures_and_calls() {
        let analysis = analyze_ok(
            "DECLARE SUB Show (n%)\nShow 42\nSUB Show (n%)\nPRINT n%\nEND SUB",
        );
        assert_eq!(analysis.procs.len(), 1);
        assert_eq!(analysis.procs[0].params.len(), 1);
        assert!(!analysis.procs[0].declared_only);
    }

    #[test]
    fn test_call_arity_mismatch() {
        let (_, handler) = analyze_src("SUB S (a%, b%)\nEND SUB\nS 1");
        assert!(kinds(&handler).contains(&DiagnosticKind::ArityMismatch));
    }

    #[test]
    fn test_function_return_assignment() {
        let analysis = analyze_ok("FUNCTION F% (n%)\nF% = n% * 2\nEND FUNCTION\nx = F%(21)");
        assert!(analysis
            .resolutions
            .values()
            .any(|r| matches!(r, Resolution::FuncRet)));
        assert!(analysis
            .resolutions
            .values()
            .any(|r| matches!(r, Resolution::FuncCall(_))));
    }

    #[test]
    fn test_calling_sub_in_expression_reports() {
        let (_, handler) = analyze_src("SUB S\nEND SUB\nx = S(1)");
        assert!(kinds(&handler).contains(&DiagnosticKind::TypeMismatch));
    }

    #[test]
    fn test_intrinsic_resolution_and_types() {
        let analysis = analyze_ok("x$ = CHR$(65)\nn = LEN(\"abc\")\nr = RND");
        assert!(analysis
            .resolutions
            .values()
            .any(|r| matches!(r, Resolution::Intrinsic(Intrinsic::Chr))));
        assert!(analysis
            .resolutions
            .values()
            .any(|r| matches!(r, Resolution::Intrinsic(Intrinsic::Rnd))));
    }

    #[test]
    fn test_intrinsic_arg_type_checked() {
        let (_, handler) = analyze_src("x = LEN(5)");
        assert!(kinds(&handler).contains(&DiagnosticKind::TypeMismatch));
    }

    #[test]
    fn test_step_zero_warns() {
        let (_, handler) = analyze_src("FOR i = 1 TO 10 STEP 0\nNEXT i");
        let diags = handler.diagnostics();
        assert!(diags
            .iter()
            .any(|d| d.kind == DiagnosticKind::InvalidForStep));
        assert!(!handler.has_errors());
    }

    #[test]
    fn test_case_range_sanity() {
        let (_, handler) = analyze_src("SELECT CASE x\nCASE 10 TO 1\nEND SELECT");
        assert!(kinds(&handler).contains(&DiagnosticKind::BadCaseRange));
    }

    #[test]
    fn test_shared_visibility() {
        // Non-shared module variables are invisible inside procedures.
        let analysis = analyze_ok("DIM SHARED g AS LONG\nDIM m AS LONG\nSUB S\ng = 1\nm = 2\nEND SUB");
        // `m` inside S auto-declares a fresh local, so there are two
        // variables named M: the module one and the SUB-local one.
        assert_eq!(analysis.globals.len(), 2);
        assert_eq!(analysis.procs[0].locals.len(), 1);
    }

    #[test]
    fn test_exit_outside_loop_reports() {
        let (_, handler) = analyze_src("EXIT FOR");
        assert!(handler.has_errors());
    }

    #[test]
    fn test_fixed_string_assignment_coerces() {
        let analysis = analyze_ok("DIM s AS STRING * 4\ns = \"toolong\"");
        assert!(analysis
            .coercions
            .values()
            .any(|t| matches!(t, Ty::FixedString(4))));
    }

    #[test]
    fn test_swap_type_mismatch() {
        let (_, handler) = analyze_src("a% = 1\nb$ = \"x\"\nSWAP a%, b$");
        assert!(kinds(&handler).contains(&DiagnosticKind::TypeMismatch));
    }

    #[test]
    fn test_record_assignment_same_type_only() {
        let (_, handler) = analyze_src(
            "TYPE A\n x AS INTEGER\nEND TYPE\nTYPE B\n x AS INTEGER\nEND TYPE\nDIM a AS A\nDIM b AS B\na = b",
        );
        assert!(kinds(&handler).contains(&DiagnosticKind::TypeMismatch));
    }
}
