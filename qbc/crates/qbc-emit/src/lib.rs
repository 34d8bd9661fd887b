//! qbc-emit - Lowering the analyzed tree to stack-machine bytecode.
//!
//! The emitter walks the AST a second time with the semantic side
//! tables in hand and produces an [`Image`]: a linear instruction
//! stream plus the constant pool, record table, procedure table, DATA
//! pool, label table and source map.
//!
//! Lowering notes:
//!
//! - Module code comes first and ends in `HALT`; procedure bodies
//!   follow. `CALLPROC` goes through the procedure table, so no call
//!   fix-ups are needed.
//! - Label jumps (`GOTO`/`GOSUB`/`RETURN label`) use a fix-up list:
//!   placeholder targets are patched once every label's pc is known.
//! - `FOR` compiles to `FOR_INIT body FOR_STEP FOR_END`; the init
//!   instruction jumps straight to `FOR_END` when the loop runs zero
//!   iterations, and `EXIT FOR` jumps there too so the loop frame is
//!   always popped exactly once.
//! - `SELECT CASE` stores its subject in a hidden slot and compiles the
//!   arms into a source-ordered dispatch chain.
//! - `AND`/`OR` evaluate both operands; no short-circuiting exists at
//!   this level.
//! - Assignment evaluates the value, then drives it into the target
//!   with the read-modify-write sequence for record fields and
//!   `SWAP`-style stack shuffling for array elements, keeping every
//!   statement stack-neutral.

pub mod image;
pub mod op;

pub use image::{
    read_image, write_image, ConstEntry, Image, ImageError, LabelEntry, ParamEntry, ProcEntry,
    RecordEntry, SourceMapEntry, FLAG_CONSOLE, FLAG_RNG_V1, FLAG_SOURCE_MAP, MAGIC, VERSION,
};
pub use op::{CmpKind, CmpOp, FileOp, HalOp, NumKind, Op, OpenMode, PrintKind, SlotRef, TyTag};

use qbc_lex::NumLit;
use qbc_par::{
    BinOp, CaseGuard, DimBound, Expr, ExprKind, ExitKind, LoopCond, PrintPiece, Program, Stmt,
    StmtKind, UnOp,
};
use qbc_sem::{Analysis, ConstVal, Intrinsic, Resolution, Ty};
use qbc_util::{Span, Symbol};
use rustc_hash::FxHashMap;

/// Emit bytecode for an analyzed module. Call only after analysis
/// reported no errors; the emitter trusts the side tables.
pub fn emit(program: &Program, analysis: &Analysis) -> Image {
    Emitter::new(analysis, program.console).emit(program)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    I16(i16),
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    Str(u64, usize),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    For,
    Do,
    While,
}

struct LoopCtx {
    kind: LoopKind,
    exit_fixups: Vec<usize>,
}

struct Emitter<'a> {
    analysis: &'a Analysis,
    image: Image,
    const_map: FxHashMap<ConstKey, u32>,
    str_consts: FxHashMap<Vec<u8>, u32>,
    /// (name, is_array) → global slot.
    global_slots: FxHashMap<(Symbol, bool), u16>,
    /// Per-procedure (name, is_array) → local slot.
    local_slots: Vec<FxHashMap<(Symbol, bool), u16>>,
    /// (scope, label) → pc. Scope 0 is module code, proc p is p + 1.
    label_pcs: FxHashMap<(u32, Symbol), u32>,
    label_fixups: Vec<(usize, u32, Symbol)>,
    current_proc: Option<u32>,
    loop_stack: Vec<LoopCtx>,
    exit_proc_fixups: Vec<usize>,
    last_mapped_span: Option<Span>,
}

impl<'a> Emitter<'a> {
    fn new(analysis: &'a Analysis, console: bool) -> Self {
        let mut image = Image {
            flags: FLAG_RNG_V1 | if console { FLAG_CONSOLE } else { 0 },
            ..Image::default()
        };

        for layout in analysis.types.layouts() {
            image.records.push(RecordEntry {
                name: layout.name.to_string(),
                fields: layout
                    .fields
                    .iter()
                    .map(|f| (f.name.to_string(), op::ty_tag(f.ty)))
                    .collect(),
            });
        }

        let mut global_slots = FxHashMap::default();
        for (slot, info) in analysis.globals.iter().enumerate() {
            global_slots.insert((info.name, info.is_array), slot as u16);
            image.globals.push(op::ty_tag(info.ty));
        }

        let mut local_slots = Vec::new();
        for proc in &analysis.procs {
            let mut map = FxHashMap::default();
            for (slot, local) in proc.locals.iter().enumerate() {
                map.insert((local.name, local.is_array), slot as u16);
            }
            local_slots.push(map);
        }

        Self {
            analysis,
            image,
            const_map: FxHashMap::default(),
            str_consts: FxHashMap::default(),
            global_slots,
            local_slots,
            label_pcs: FxHashMap::default(),
            label_fixups: Vec::new(),
            current_proc: None,
            loop_stack: Vec::new(),
            exit_proc_fixups: Vec::new(),
            last_mapped_span: None,
        }
    }

    fn emit(mut self, program: &Program) -> Image {
        // Module code.
        for stmt in &program.stmts {
            self.image.stmt_pcs.push(self.pc());
            self.emit_stmt(stmt);
        }
        self.push_op(Op::Halt);

        // Procedure bodies.
        for stmt in &program.stmts {
            if let StmtKind::Proc(def) = &stmt.kind {
                self.emit_proc(def);
            }
        }
        // Stubs for DECLAREd procedures that never got a body keep the
        // table's entry pcs valid.
        for (id, info) in self.analysis.procs.iter().enumerate() {
            if info.declared_only {
                let entry_pc = self.pc();
                self.push_op(Op::Ret);
                self.push_proc_entry(id as u32, entry_pc);
            }
        }

        self.patch_labels();
        self.image
    }

    fn emit_proc(&mut self, def: &qbc_par::ProcDef) {
        let id = self.analysis.proc_by_name[&def.name];
        let entry_pc = self.pc();
        self.current_proc = Some(id);
        self.exit_proc_fixups.clear();

        for stmt in &def.body {
            self.emit_stmt(stmt);
        }

        let ret_pc = self.pc();
        let fixups = std::mem::take(&mut self.exit_proc_fixups);
        for idx in fixups {
            self.patch_jump(idx, ret_pc);
        }
        self.push_op(Op::Ret);

        self.push_proc_entry(id, entry_pc);
        self.current_proc = None;
    }

    fn push_proc_entry(&mut self, id: u32, entry_pc: u32) {
        let info = &self.analysis.procs[id as usize];
        let locals: Vec<TyTag> = info.locals.iter().map(|l| op::ty_tag(l.ty)).collect();
        // The table is indexed by proc id; bodies may be emitted out of
        // declaration order, so grow and place.
        if self.image.procs.len() <= id as usize {
            self.image.procs.resize(
                id as usize + 1,
                ProcEntry {
                    name: String::new(),
                    entry_pc: 0,
                    is_function: false,
                    params: Vec::new(),
                    locals: Vec::new(),
                },
            );
        }
        self.image.procs[id as usize] = ProcEntry {
            name: info.name.to_string(),
            entry_pc,
            is_function: info.ret_ty.is_some(),
            params: info
                .params
                .iter()
                .map(|p| ParamEntry {
                    by_val: p.by_val,
                    is_array: p.is_array,
                    tag: op::ty_tag(p.ty),
                })
                .collect(),
            locals,
        };
    }

    // -------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------

    fn pc(&self) -> u32 {
        self.image.code.len() as u32
    }

    fn push_op(&mut self, op: Op) -> usize {
        self.image.code.push(op);
        self.image.code.len() - 1
    }

    fn map_span(&mut self, span: Span) {
        if span == Span::DUMMY || self.last_mapped_span == Some(span) {
            return;
        }
        self.last_mapped_span = Some(span);
        self.image.source_map.push(SourceMapEntry {
            pc: self.pc(),
            file: span.file_id.0,
            start: span.start as u32,
            end: span.end as u32,
            line: span.line,
            column: span.column,
        });
    }

    fn scope_id(&self) -> u32 {
        self.current_proc.map(|p| p + 1).unwrap_or(0)
    }

    fn patch_jump(&mut self, idx: usize, target: u32) {
        let op = &mut self.image.code[idx];
        *op = match *op {
            Op::Jmp(_) => Op::Jmp(target),
            Op::JmpIfFalse(_) => Op::JmpIfFalse(target),
            Op::JmpIfTrue(_) => Op::JmpIfTrue(target),
            Op::Gosub(_) => Op::Gosub(target),
            Op::RetSubTo(_) => Op::RetSubTo(target),
            Op::ForInit { slot, .. } => Op::ForInit { slot, exit: target },
            Op::ForStep { .. } => Op::ForStep { body: target },
            other => other,
        };
    }

    fn patch_labels(&mut self) {
        let fixups = std::mem::take(&mut self.label_fixups);
        for (idx, scope, name) in fixups {
            let target = *self
                .label_pcs
                .get(&(scope, name))
                .expect("analysis resolved every label");
            self.patch_jump(idx, target);
        }
        let mut labels: Vec<LabelEntry> = self
            .label_pcs
            .iter()
            .map(|((_, name), pc)| LabelEntry {
                name: name.to_string(),
                pc: *pc,
            })
            .collect();
        labels.sort_by(|a, b| a.pc.cmp(&b.pc).then_with(|| a.name.cmp(&b.name)));
        self.image.labels = labels;
    }

    fn jump_to_label(&mut self, op: Op, name: Symbol) {
        let idx = self.push_op(op);
        self.label_fixups.push((idx, self.scope_id(), name));
    }

    fn const_idx(&mut self, entry: ConstEntry) -> u32 {
        let key = match &entry {
            ConstEntry::I16(v) => ConstKey::I16(*v),
            ConstEntry::I32(v) => ConstKey::I32(*v),
            ConstEntry::I64(v) => ConstKey::I64(*v),
            ConstEntry::F32(v) => ConstKey::F32(v.to_bits()),
            ConstEntry::F64(v) => ConstKey::F64(v.to_bits()),
            ConstEntry::Str(bytes) => {
                if let Some(&idx) = self.str_consts.get(bytes) {
                    return idx;
                }
                let idx = self.image.consts.len() as u32;
                self.str_consts.insert(bytes.clone(), idx);
                self.image.consts.push(entry);
                return idx;
            }
        };
        if let Some(&idx) = self.const_map.get(&key) {
            return idx;
        }
        let idx = self.image.consts.len() as u32;
        self.const_map.insert(key, idx);
        self.image.consts.push(entry);
        idx
    }

    fn push_lit(&mut self, lit: NumLit) {
        let entry = match lit {
            NumLit::Int16(v) => ConstEntry::I16(v),
            NumLit::Int32(v) => ConstEntry::I32(v),
            NumLit::Int64(v) => ConstEntry::I64(v),
            NumLit::Single(v) => ConstEntry::F32(v),
            NumLit::Double(v) => ConstEntry::F64(v),
        };
        let idx = self.const_idx(entry);
        self.push_op(Op::PushConst(idx));
    }

    fn push_const_val(&mut self, value: &ConstVal) {
        let entry = match value {
            ConstVal::Int16(v) => ConstEntry::I16(*v),
            ConstVal::Int32(v) => ConstEntry::I32(*v),
            ConstVal::Int64(v) => ConstEntry::I64(*v),
            ConstVal::Single(v) => ConstEntry::F32(*v),
            ConstVal::Double(v) => ConstEntry::F64(*v),
            ConstVal::Str(bytes) => ConstEntry::Str(bytes.clone()),
        };
        let idx = self.const_idx(entry);
        self.push_op(Op::PushConst(idx));
    }

    fn push_i32(&mut self, v: i32) {
        let idx = self.const_idx(ConstEntry::I32(v));
        self.push_op(Op::PushConst(idx));
    }

    fn resolution(&self, expr: &Expr) -> Resolution {
        *self
            .analysis
            .resolutions
            .get(&expr.id)
            .expect("analysis resolved every name")
    }

    fn expr_ty(&self, expr: &Expr) -> Ty {
        *self
            .analysis
            .expr_tys
            .get(&expr.id)
            .expect("analysis typed every expression")
    }

    /// The type an expression's value has once the pending coercion (if
    /// any) is applied.
    fn effective_ty(&self, expr: &Expr) -> Ty {
        self.analysis
            .coercions
            .get(&expr.id)
            .copied()
            .unwrap_or_else(|| self.expr_ty(expr))
    }

    fn num_kind(&self, ty: Ty) -> NumKind {
        op::ty_tag(ty).num_kind().expect("numeric operand")
    }

    fn load_slot(&mut self, slot: SlotRef) {
        match slot {
            SlotRef::Global(s) => self.push_op(Op::LoadGlobal(s)),
            SlotRef::Local(s) => self.push_op(Op::LoadLocal(s)),
        };
    }

    fn store_slot(&mut self, slot: SlotRef) {
        match slot {
            SlotRef::Global(s) => self.push_op(Op::StoreGlobal(s)),
            SlotRef::Local(s) => self.push_op(Op::StoreLocal(s)),
        };
    }

    fn ret_slot(&self) -> u16 {
        let id = self.current_proc.expect("function body");
        self.analysis.procs[id as usize]
            .ret_slot()
            .expect("function return slot") as u16
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn emit_stmt(&mut self, stmt: &Stmt) {
        self.map_span(stmt.span);
        match &stmt.kind {
            StmtKind::Label(name) => {
                let pc = self.pc();
                self.label_pcs.insert((self.scope_id(), *name), pc);
            }
            StmtKind::Const { .. }
            | StmtKind::TypeDef { .. }
            | StmtKind::Declare { .. }
            | StmtKind::Data { .. }
            | StmtKind::OptionBase(_)
            | StmtKind::Include(_)
            | StmtKind::Proc(_) => {}
            StmtKind::Dim { shared, decls } | StmtKind::Redim { shared, decls } => {
                for decl in decls {
                    self.emit_dim(decl, *shared);
                }
            }
            StmtKind::Assign { target, value } => {
                self.emit_expr(value);
                self.emit_store(target);
            }
            StmtKind::Print { channel, items } => self.emit_print(channel.as_ref(), items),
            StmtKind::Input { channel, prompt, no_question, targets } => {
                self.emit_input(channel.as_ref(), prompt.as_deref(), *no_question, targets)
            }
            StmtKind::LineInput { channel, prompt, no_question, target } => {
                match channel {
                    Some(chan) => {
                        self.emit_expr(chan);
                        self.push_op(Op::FileIo(FileOp::LineInput));
                    }
                    None => {
                        self.emit_prompt(prompt.as_deref(), *no_question);
                        self.push_op(Op::LineInput);
                    }
                }
                self.emit_store(target);
            }
            StmtKind::If { arms, else_body } => {
                let mut end_fixups = Vec::new();
                for arm in arms {
                    self.emit_expr(&arm.cond);
                    let next = self.push_op(Op::JmpIfFalse(u32::MAX));
                    for s in &arm.body {
                        self.emit_stmt(s);
                    }
                    end_fixups.push(self.push_op(Op::Jmp(u32::MAX)));
                    let pc = self.pc();
                    self.patch_jump(next, pc);
                }
                for s in else_body {
                    self.emit_stmt(s);
                }
                let end = self.pc();
                for idx in end_fixups {
                    self.patch_jump(idx, end);
                }
            }
            StmtKind::Select { subject, arms, else_body } => {
                self.emit_select(subject, arms, else_body.as_deref())
            }
            StmtKind::For { counter, from, to, step, body } => {
                self.emit_for(counter, from, to, step.as_ref(), body)
            }
            StmtKind::While { cond, body } => {
                let top = self.pc();
                self.emit_expr(cond);
                let exit = self.push_op(Op::JmpIfFalse(u32::MAX));
                self.loop_stack.push(LoopCtx {
                    kind: LoopKind::While,
                    exit_fixups: Vec::new(),
                });
                for s in body {
                    self.emit_stmt(s);
                }
                self.push_op(Op::Jmp(top));
                let end = self.pc();
                self.patch_jump(exit, end);
                let ctx = self.loop_stack.pop().unwrap();
                for idx in ctx.exit_fixups {
                    self.patch_jump(idx, end);
                }
            }
            StmtKind::DoLoop { pre, post, body } => {
                let top = self.pc();
                let mut exit_fixup = None;
                if let Some(cond) = pre {
                    let (expr, negate) = match cond {
                        LoopCond::While(e) => (e, false),
                        LoopCond::Until(e) => (e, true),
                    };
                    self.emit_expr(expr);
                    exit_fixup = Some(if negate {
                        self.push_op(Op::JmpIfTrue(u32::MAX))
                    } else {
                        self.push_op(Op::JmpIfFalse(u32::MAX))
                    });
                }
                self.loop_stack.push(LoopCtx {
                    kind: LoopKind::Do,
                    exit_fixups: Vec::new(),
                });
                for s in body {
                    self.emit_stmt(s);
                }
                match post {
                    Some(LoopCond::While(e)) => {
                        self.emit_expr(e);
                        self.push_op(Op::JmpIfTrue(top));
                    }
                    Some(LoopCond::Until(e)) => {
                        self.emit_expr(e);
                        self.push_op(Op::JmpIfFalse(top));
                    }
                    None => {
                        self.push_op(Op::Jmp(top));
                    }
                }
                let end = self.pc();
                if let Some(idx) = exit_fixup {
                    self.patch_jump(idx, end);
                }
                let ctx = self.loop_stack.pop().unwrap();
                for idx in ctx.exit_fixups {
                    self.patch_jump(idx, end);
                }
            }
            StmtKind::Exit(kind) => match kind {
                ExitKind::For => self.emit_loop_exit(LoopKind::For),
                ExitKind::Do => self.emit_loop_exit(LoopKind::Do),
                ExitKind::Sub | ExitKind::Function => {
                    let idx = self.push_op(Op::Jmp(u32::MAX));
                    self.exit_proc_fixups.push(idx);
                }
            },
            StmtKind::Goto(label) => self.jump_to_label(Op::Jmp(u32::MAX), label.name),
            StmtKind::Gosub(label) => self.jump_to_label(Op::Gosub(u32::MAX), label.name),
            StmtKind::Return(target) => match target {
                None => {
                    self.push_op(Op::RetSub);
                }
                Some(label) => self.jump_to_label(Op::RetSubTo(u32::MAX), label.name),
            },
            StmtKind::Call { name, args } => {
                let id = self.analysis.proc_by_name[name];
                self.emit_call_args(id, args);
                self.push_op(Op::CallProc {
                    proc: id as u16,
                    argc: args.len() as u8,
                });
            }
            StmtKind::Open { path, mode, channel } => {
                self.emit_expr(path);
                self.emit_expr(channel);
                let mode = match mode {
                    qbc_par::OpenMode::Input => OpenMode::Input,
                    qbc_par::OpenMode::Output => OpenMode::Output,
                    qbc_par::OpenMode::Append => OpenMode::Append,
                    qbc_par::OpenMode::Binary => OpenMode::Binary,
                    qbc_par::OpenMode::Random => OpenMode::Random,
                };
                self.push_op(Op::Open(mode));
            }
            StmtKind::Close { channels } => {
                if channels.is_empty() {
                    self.push_op(Op::CloseAll);
                } else {
                    for chan in channels {
                        self.emit_expr(chan);
                        self.push_op(Op::Close);
                    }
                }
            }
            StmtKind::Read { targets } => {
                for target in targets {
                    let tag = op::ty_tag(self.expr_ty(target));
                    self.push_op(Op::ReadData(tag));
                    self.emit_store(target);
                }
            }
            StmtKind::Restore(target) => {
                let idx = match target {
                    None => 0,
                    Some(label) => self.analysis.data_labels[&label.name],
                };
                self.push_op(Op::RestoreData(idx));
            }
            StmtKind::Randomize(seed) => {
                match seed {
                    Some(expr) => {
                        self.emit_expr(expr);
                        let ty = self.effective_ty(expr);
                        if ty != Ty::Double {
                            self.push_op(Op::Coerce(op::ty_tag(ty), TyTag::F64));
                        }
                    }
                    None => {
                        self.push_op(Op::Timer);
                        self.push_op(Op::Coerce(TyTag::F32, TyTag::F64));
                    }
                }
                self.push_op(Op::Randomize);
            }
            StmtKind::Swap(a, b) => {
                self.emit_load_lvalue(a);
                self.emit_load_lvalue(b);
                self.emit_store(a);
                self.emit_store(b);
            }
            StmtKind::Cls => {
                self.push_op(Op::Hal(HalOp::Cls));
            }
            StmtKind::Beep => {
                self.push_op(Op::Hal(HalOp::Beep));
            }
            StmtKind::Sleep(duration) => {
                match duration {
                    Some(expr) => self.emit_expr(expr),
                    None => self.push_i32(0),
                }
                self.push_op(Op::Hal(HalOp::Sleep));
            }
            StmtKind::End => {
                self.push_op(Op::Halt);
            }
        }
    }

    fn emit_loop_exit(&mut self, kind: LoopKind) {
        let idx = self.push_op(Op::Jmp(u32::MAX));
        for ctx in self.loop_stack.iter_mut().rev() {
            if ctx.kind == kind {
                ctx.exit_fixups.push(idx);
                return;
            }
        }
        // Analysis rejects EXIT outside a matching loop.
        unreachable!("EXIT checked by analysis");
    }

    fn emit_dim(&mut self, decl: &qbc_par::VarDecl, shared: bool) {
        let Some(bounds) = &decl.dims else { return };
        let slot = self.var_slot(decl.name, true, shared);
        let elem = match slot {
            SlotRef::Global(s) => self.image.globals[s as usize],
            SlotRef::Local(s) => {
                let id = self.current_proc.unwrap() as usize;
                op::ty_tag(self.analysis.procs[id].locals[s as usize].ty)
            }
        };
        for DimBound { lower, upper } in bounds {
            match lower {
                Some(expr) => self.emit_expr(expr),
                None => self.push_i32(self.analysis.option_base as i32),
            }
            self.emit_expr(upper);
        }
        self.push_op(Op::NewArray {
            slot,
            dims: bounds.len() as u8,
            elem,
        });
    }

    fn var_slot(&self, name: Symbol, is_array: bool, shared: bool) -> SlotRef {
        if let Some(id) = self.current_proc {
            if !shared {
                if let Some(&slot) = self.local_slots[id as usize].get(&(name, is_array)) {
                    return SlotRef::Local(slot);
                }
            }
        }
        SlotRef::Global(self.global_slots[&(name, is_array)])
    }

    // -------------------------------------------------------------------
    // Assignment targets
    // -------------------------------------------------------------------

    /// Store the value on top of the stack into `target`.
    fn emit_store(&mut self, target: &Expr) {
        match &target.kind {
            ExprKind::Var(_) => match self.resolution(target) {
                Resolution::Global(slot) => {
                    self.push_op(Op::StoreGlobal(slot as u16));
                }
                Resolution::Local(slot) => {
                    self.push_op(Op::StoreLocal(slot as u16));
                }
                Resolution::FuncRet => {
                    let slot = self.ret_slot();
                    self.push_op(Op::StoreLocal(slot));
                }
                _ => {
                    // Assignment to a constant was already reported;
                    // keep the stack balanced.
                    self.push_op(Op::Pop);
                }
            },
            ExprKind::Call { args, .. } => {
                let slot = match self.resolution(target) {
                    Resolution::ArrayGlobal(slot) => SlotRef::Global(slot as u16),
                    Resolution::ArrayLocal(slot) => SlotRef::Local(slot as u16),
                    _ => {
                        self.push_op(Op::Pop);
                        return;
                    }
                };
                self.load_slot(slot);
                self.push_op(Op::Swap);
                for index in args {
                    self.emit_expr(index);
                }
                self.push_op(Op::IndexSet(args.len() as u8));
            }
            ExprKind::Field { base, .. } => {
                let field = self.analysis.field_index[&target.id];
                self.emit_load_lvalue(base);
                self.push_op(Op::Swap);
                self.push_op(Op::FieldSet(field));
                self.emit_store(base);
            }
            _ => {
                self.push_op(Op::Pop);
            }
        }
    }

    /// Push a copy of an l-value's current value.
    fn emit_load_lvalue(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Var(_) => match self.resolution(expr) {
                Resolution::Global(slot) => {
                    self.push_op(Op::LoadGlobal(slot as u16));
                }
                Resolution::Local(slot) => {
                    self.push_op(Op::LoadLocal(slot as u16));
                }
                Resolution::FuncRet => {
                    let slot = self.ret_slot();
                    self.push_op(Op::LoadLocal(slot));
                }
                _ => {
                    self.emit_expr(expr);
                }
            },
            ExprKind::Call { args, .. } => {
                let slot = match self.resolution(expr) {
                    Resolution::ArrayGlobal(slot) => SlotRef::Global(slot as u16),
                    Resolution::ArrayLocal(slot) => SlotRef::Local(slot as u16),
                    _ => {
                        self.emit_expr(expr);
                        return;
                    }
                };
                self.load_slot(slot);
                for index in args {
                    self.emit_expr(index);
                }
                self.push_op(Op::BoundCheck(args.len() as u8));
                self.push_op(Op::IndexGet(args.len() as u8));
            }
            ExprKind::Field { base, .. } => {
                let field = self.analysis.field_index[&expr.id];
                self.emit_load_lvalue(base);
                self.push_op(Op::FieldGet(field));
            }
            _ => self.emit_expr(expr),
        }
    }

    // -------------------------------------------------------------------
    // Expressions
    // -------------------------------------------------------------------

    fn emit_expr(&mut self, expr: &Expr) {
        self.emit_expr_uncoerced(expr);
        if let Some(&target) = self.analysis.coercions.get(&expr.id) {
            let from = self.expr_ty(expr);
            self.push_op(Op::Coerce(op::ty_tag(from), op::ty_tag(target)));
        }
    }

    fn emit_expr_uncoerced(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Number(lit) => self.push_lit(*lit),
            ExprKind::StringLit(bytes) => {
                let idx = self.const_idx(ConstEntry::Str(bytes.clone()));
                self.push_op(Op::PushConst(idx));
            }
            ExprKind::Var(_) => match self.resolution(expr) {
                Resolution::Const(name) => {
                    let value = self.analysis.consts[&name].clone();
                    self.push_const_val(&value);
                }
                Resolution::FuncCall(id) => {
                    self.push_op(Op::CallProc {
                        proc: id as u16,
                        argc: 0,
                    });
                }
                Resolution::Intrinsic(intrinsic) => self.emit_intrinsic(intrinsic, &[]),
                _ => self.emit_load_lvalue(expr),
            },
            ExprKind::Call { args, .. } => match self.resolution(expr) {
                Resolution::ArrayGlobal(_) | Resolution::ArrayLocal(_) => {
                    self.emit_load_lvalue(expr)
                }
                Resolution::ArrayWholeGlobal(slot) => {
                    self.push_op(Op::LoadGlobal(slot as u16));
                }
                Resolution::ArrayWholeLocal(slot) => {
                    self.push_op(Op::LoadLocal(slot as u16));
                }
                Resolution::FuncCall(id) => {
                    self.emit_call_args(id, args);
                    self.push_op(Op::CallProc {
                        proc: id as u16,
                        argc: args.len() as u8,
                    });
                }
                Resolution::Intrinsic(intrinsic) => self.emit_intrinsic(intrinsic, args),
                _ => unreachable!("call resolution"),
            },
            ExprKind::Field { .. } => self.emit_load_lvalue(expr),
            ExprKind::Unary { op: unop, operand } => {
                self.emit_expr(operand);
                let kind = self.num_kind(self.effective_ty(operand));
                match unop {
                    UnOp::Neg => self.push_op(Op::Neg(kind)),
                    UnOp::Not => self.push_op(Op::Not(kind)),
                };
            }
            ExprKind::Binary { op: binop, lhs, rhs } => {
                self.emit_expr(lhs);
                self.emit_expr(rhs);
                let operand_ty = self.effective_ty(lhs);
                if operand_ty.is_string() {
                    match binop {
                        BinOp::Add => {
                            self.push_op(Op::Concat);
                        }
                        _ => {
                            let op = cmp_op(*binop);
                            self.push_op(Op::Cmp(op, CmpKind::Str));
                        }
                    }
                    return;
                }
                let kind = self.num_kind(operand_ty);
                match binop {
                    BinOp::Add => self.push_op(Op::Add(kind)),
                    BinOp::Sub => self.push_op(Op::Sub(kind)),
                    BinOp::Mul => self.push_op(Op::Mul(kind)),
                    BinOp::Div => self.push_op(Op::Div(kind)),
                    BinOp::IntDiv => self.push_op(Op::IntDiv(kind)),
                    BinOp::Mod => self.push_op(Op::Mod(kind)),
                    BinOp::Pow => self.push_op(Op::Pow),
                    BinOp::And => self.push_op(Op::And(kind)),
                    BinOp::Or => self.push_op(Op::Or(kind)),
                    _ => self.push_op(Op::Cmp(cmp_op(*binop), CmpKind::Num(kind))),
                };
            }
        }
    }

    fn emit_intrinsic(&mut self, intrinsic: Intrinsic, args: &[Expr]) {
        match intrinsic {
            Intrinsic::Rnd => {
                self.push_op(Op::Rnd);
            }
            Intrinsic::Timer => {
                self.push_op(Op::Timer);
            }
            Intrinsic::Eof => {
                for arg in args {
                    self.emit_expr(arg);
                }
                self.push_op(Op::FileIo(FileOp::Eof));
            }
            _ => {
                for arg in args {
                    self.emit_expr(arg);
                }
                self.push_op(Op::Intrinsic {
                    id: intrinsic.id(),
                    argc: args.len() as u8,
                });
            }
        }
    }

    fn emit_call_args(&mut self, id: u32, args: &[Expr]) {
        let params = &self.analysis.procs[id as usize].params;
        for (arg, param) in args.iter().zip(params.iter()) {
            if param.is_array {
                match self.resolution(arg) {
                    Resolution::ArrayWholeGlobal(slot) => {
                        self.push_op(Op::LoadGlobal(slot as u16));
                    }
                    Resolution::ArrayWholeLocal(slot) => {
                        self.push_op(Op::LoadLocal(slot as u16));
                    }
                    _ => {
                        self.emit_expr(arg);
                    }
                }
                continue;
            }
            if !param.by_val {
                if let Some(done) = self.try_emit_ref_arg(arg) {
                    if done {
                        continue;
                    }
                }
            }
            self.emit_expr(arg);
        }
    }

    /// Emit a by-reference argument when the expression is a plain slot
    /// or array element; record fields and r-values pass by value.
    fn try_emit_ref_arg(&mut self, arg: &Expr) -> Option<bool> {
        let res = self.analysis.resolutions.get(&arg.id)?;
        match (&arg.kind, res) {
            (ExprKind::Var(_), Resolution::Global(slot)) => {
                self.push_op(Op::RefGlobal(*slot as u16));
                Some(true)
            }
            (ExprKind::Var(_), Resolution::Local(slot)) => {
                self.push_op(Op::RefLocal(*slot as u16));
                Some(true)
            }
            (ExprKind::Var(_), Resolution::FuncRet) => {
                let slot = self.ret_slot();
                self.push_op(Op::RefLocal(slot));
                Some(true)
            }
            (ExprKind::Call { args, .. }, Resolution::ArrayGlobal(slot)) => {
                self.push_op(Op::LoadGlobal(*slot as u16));
                let args = args.clone();
                for index in &args {
                    self.emit_expr(index);
                }
                self.push_op(Op::RefIndex(args.len() as u8));
                Some(true)
            }
            (ExprKind::Call { args, .. }, Resolution::ArrayLocal(slot)) => {
                self.push_op(Op::LoadLocal(*slot as u16));
                let args = args.clone();
                for index in &args {
                    self.emit_expr(index);
                }
                self.push_op(Op::RefIndex(args.len() as u8));
                Some(true)
            }
            _ => Some(false),
        }
    }

    // -------------------------------------------------------------------
    // PRINT / INPUT / SELECT / FOR
    // -------------------------------------------------------------------

    fn emit_print(&mut self, channel: Option<&Expr>, items: &[PrintPiece]) {
        for piece in items {
            match (piece, channel) {
                (PrintPiece::Expr(expr), None) => {
                    self.emit_expr(expr);
                    self.push_op(Op::PrintItem(PrintKind::Value));
                }
                (PrintPiece::Expr(expr), Some(chan)) => {
                    self.emit_expr(chan);
                    self.emit_expr(expr);
                    self.push_op(Op::FileIo(FileOp::PrintValue));
                }
                (PrintPiece::Comma, None) => {
                    self.push_op(Op::PrintItem(PrintKind::Zone));
                }
                (PrintPiece::Comma, Some(chan)) => {
                    self.emit_expr(chan);
                    self.push_op(Op::FileIo(FileOp::PrintZone));
                }
                (PrintPiece::Semi, _) => {}
            }
        }
        let suppress_newline = matches!(items.last(), Some(PrintPiece::Semi | PrintPiece::Comma));
        if !suppress_newline {
            match channel {
                None => {
                    self.push_op(Op::PrintEol);
                }
                Some(chan) => {
                    self.emit_expr(chan);
                    self.push_op(Op::FileIo(FileOp::PrintEol));
                }
            }
        }
    }

    fn emit_prompt(&mut self, prompt: Option<&[u8]>, no_question: bool) {
        let text = prompt.unwrap_or(b"");
        let idx = self.const_idx(ConstEntry::Str(text.to_vec()));
        self.push_op(Op::PushConst(idx));
        self.push_op(Op::InputPrompt {
            question: !no_question,
        });
    }

    fn emit_input(
        &mut self,
        channel: Option<&Expr>,
        prompt: Option<&[u8]>,
        no_question: bool,
        targets: &[Expr],
    ) {
        if channel.is_none() {
            self.emit_prompt(prompt, no_question);
        }
        for target in targets {
            let tag = op::ty_tag(self.expr_ty(target));
            match channel {
                None => {
                    self.push_op(Op::InputItem(tag));
                }
                Some(chan) => {
                    self.emit_expr(chan);
                    self.push_op(Op::FileIo(FileOp::InputItem(tag)));
                }
            }
            self.emit_store(target);
        }
    }

    fn emit_select(
        &mut self,
        subject: &Expr,
        arms: &[qbc_par::CaseArm],
        else_body: Option<&[Stmt]>,
    ) {
        let subject_ty = self.expr_ty(subject);
        let temp = match self.analysis.select_temps[&subject.id] {
            Resolution::Global(slot) => SlotRef::Global(slot as u16),
            Resolution::Local(slot) => SlotRef::Local(slot as u16),
            _ => unreachable!("select scratch is a scalar slot"),
        };
        self.emit_expr(subject);
        self.store_slot(temp);

        let cmp_kind = if subject_ty.is_string() {
            CmpKind::Str
        } else {
            CmpKind::Num(self.num_kind(subject_ty))
        };

        let mut end_fixups = Vec::new();
        for arm in arms {
            let mut body_fixups = Vec::new();
            for guard in &arm.guards {
                match guard {
                    CaseGuard::Value(v) => {
                        self.load_slot(temp);
                        self.emit_expr(v);
                        self.push_op(Op::Cmp(CmpOp::Eq, cmp_kind));
                    }
                    CaseGuard::Is(op, v) => {
                        self.load_slot(temp);
                        self.emit_expr(v);
                        self.push_op(Op::Cmp(cmp_op(*op), cmp_kind));
                    }
                    CaseGuard::Range(lo, hi) => {
                        self.load_slot(temp);
                        self.emit_expr(lo);
                        self.push_op(Op::Cmp(CmpOp::Ge, cmp_kind));
                        self.load_slot(temp);
                        self.emit_expr(hi);
                        self.push_op(Op::Cmp(CmpOp::Le, cmp_kind));
                        self.push_op(Op::And(NumKind::I16));
                    }
                }
                body_fixups.push(self.push_op(Op::JmpIfTrue(u32::MAX)));
            }
            let next_arm = self.push_op(Op::Jmp(u32::MAX));
            let body_pc = self.pc();
            for idx in body_fixups {
                self.patch_jump(idx, body_pc);
            }
            for s in &arm.body {
                self.emit_stmt(s);
            }
            end_fixups.push(self.push_op(Op::Jmp(u32::MAX)));
            let pc = self.pc();
            self.patch_jump(next_arm, pc);
        }
        if let Some(body) = else_body {
            for s in body {
                self.emit_stmt(s);
            }
        }
        let end = self.pc();
        for idx in end_fixups {
            self.patch_jump(idx, end);
        }
    }

    fn emit_for(
        &mut self,
        counter: &Expr,
        from: &Expr,
        to: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
    ) {
        let counter_ty = self.expr_ty(counter);
        let slot = match self.resolution(counter) {
            Resolution::Global(s) => SlotRef::Global(s as u16),
            Resolution::Local(s) => SlotRef::Local(s as u16),
            Resolution::FuncRet => SlotRef::Local(self.ret_slot()),
            _ => SlotRef::Global(0),
        };

        self.emit_expr(from);
        self.emit_expr(to);
        match step {
            Some(expr) => self.emit_expr(expr),
            None => {
                // Implicit STEP 1 in the counter's own kind.
                let entry = match counter_ty {
                    Ty::Int16 => ConstEntry::I16(1),
                    Ty::Int32 | Ty::UInt32 => ConstEntry::I32(1),
                    Ty::Int64 => ConstEntry::I64(1),
                    Ty::Single => ConstEntry::F32(1.0),
                    _ => ConstEntry::F64(1.0),
                };
                let idx = self.const_idx(entry);
                self.push_op(Op::PushConst(idx));
            }
        }

        let init = self.push_op(Op::ForInit {
            slot,
            exit: u32::MAX,
        });
        let body_pc = self.pc();
        self.loop_stack.push(LoopCtx {
            kind: LoopKind::For,
            exit_fixups: Vec::new(),
        });
        for s in body {
            self.emit_stmt(s);
        }
        self.push_op(Op::ForStep { body: body_pc });
        let end = self.pc();
        self.push_op(Op::ForEnd);
        self.patch_jump(init, end);
        let ctx = self.loop_stack.pop().unwrap();
        for idx in ctx.exit_fixups {
            self.patch_jump(idx, end);
        }
    }
}

fn cmp_op(op: BinOp) -> CmpOp {
    match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        _ => unreachable!("relational operator"),
    }
}

// ---------------------------------------------------------------------------
// Bytecode verification
// ---------------------------------------------------------------------------

/// Statically verify stack discipline and jump closure of an image:
/// every reachable pc has one consistent stack depth, the depth never
/// goes negative, and every jump target is inside the code.
pub fn verify_image(image: &Image) -> Result<(), String> {
    let len = image.code.len();
    let mut depths: Vec<Option<i32>> = vec![None; len];
    let mut work: Vec<(u32, i32)> = vec![(0, 0)];
    for proc in &image.procs {
        work.push((proc.entry_pc, 0));
    }

    let pushes_value = |proc: u16| {
        image
            .procs
            .get(proc as usize)
            .map(|p| p.is_function)
            .unwrap_or(false)
    };

    while let Some((pc, depth)) = work.pop() {
        if pc as usize >= len {
            return Err(format!("pc {pc} outside code ({len} instructions)"));
        }
        match depths[pc as usize] {
            Some(existing) => {
                if existing != depth {
                    return Err(format!(
                        "inconsistent stack depth at pc {pc}: {existing} vs {depth}"
                    ));
                }
                continue;
            }
            None => depths[pc as usize] = Some(depth),
        }
        let op = image.code[pc as usize];
        let next_depth = depth + op.stack_delta(pushes_value);
        if next_depth < 0 {
            return Err(format!("stack underflow at pc {pc} ({op:?})"));
        }
        if let Some(target) = op.jump_target() {
            if target as usize >= len {
                return Err(format!("jump target {target} outside code at pc {pc}"));
            }
            let target_depth = match op {
                // The conditional was popped on both paths.
                Op::JmpIfFalse(_) | Op::JmpIfTrue(_) => next_depth,
                Op::Jmp(_) | Op::Gosub(_) | Op::RetSubTo(_) => next_depth,
                Op::ForInit { .. } => next_depth,
                Op::ForStep { .. } => next_depth,
                _ => next_depth,
            };
            work.push((target, target_depth));
        }
        let falls_through = !matches!(op, Op::Jmp(_) | Op::Halt | Op::Ret | Op::RetSub | Op::RetSubTo(_));
        if falls_through {
            work.push((pc + 1, next_depth));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbc_util::{FileId, Handler};

    fn compile(src: &str) -> Image {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize(src, FileId::DUMMY, &handler);
        let program = qbc_par::parse(tokens, &handler);
        let analysis = qbc_sem::analyze(&program, &handler);
        assert!(
            !handler.has_errors(),
            "unexpected diagnostics: {:?}",
            handler.diagnostics()
        );
        emit(&program, &analysis)
    }

    #[test]
    fn test_hello_world_shape() {
        let image = compile("PRINT \"Hello, World!\"\nEND");
        assert!(matches!(image.code[0], Op::PushConst(_)));
        assert!(matches!(image.code[1], Op::PrintItem(PrintKind::Value)));
        assert!(matches!(image.code[2], Op::PrintEol));
        assert!(matches!(image.code[3], Op::Halt));
        assert_eq!(image.consts, vec![ConstEntry::Str(b"Hello, World!".to_vec())]);
    }

    #[test]
    fn test_constant_pool_dedup() {
        let image = compile("PRINT 42\nPRINT 42\nPRINT 42");
        let count = image
            .consts
            .iter()
            .filter(|c| matches!(c, ConstEntry::I16(42)))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_int64_literal_round_trips_pool() {
        let image = compile("x&& = 9223372036854775807&&");
        assert!(image.consts.contains(&ConstEntry::I64(i64::MAX)));
        let bytes = write_image(&image);
        let back = read_image(&bytes).unwrap();
        assert!(back.consts.contains(&ConstEntry::I64(i64::MAX)));
    }

    #[test]
    fn test_for_loop_shape() {
        let image = compile("FOR i = 10 TO 0 STEP -2\nPRINT i;\nNEXT i");
        let init = image
            .code
            .iter()
            .position(|op| matches!(op, Op::ForInit { .. }))
            .expect("ForInit");
        let step = image
            .code
            .iter()
            .position(|op| matches!(op, Op::ForStep { .. }))
            .expect("ForStep");
        let end = image
            .code
            .iter()
            .position(|op| matches!(op, Op::ForEnd))
            .expect("ForEnd");
        assert!(init < step && step < end);
        // ForInit's exit lands on ForEnd, so the frame always pops.
        if let Op::ForInit { exit, .. } = image.code[init] {
            assert_eq!(exit as usize, end);
        }
        if let Op::ForStep { body } = image.code[step] {
            assert_eq!(body as usize, init + 1);
        }
    }

    #[test]
    fn test_goto_forward_reference_patched() {
        let image = compile("GOTO Done\nPRINT \"skipped\"\nDone:\nEND");
        if let Op::Jmp(target) = image.code[0] {
            // The label table must agree with the patched target.
            let label = image.labels.iter().find(|l| l.name == "DONE").unwrap();
            assert_eq!(label.pc, target);
        } else {
            panic!("expected Jmp, got {:?}", image.code[0]);
        }
    }

    #[test]
    fn test_gosub_and_return() {
        let image = compile("GOSUB S\nEND\nS: PRINT \"B\"\nRETURN");
        assert!(matches!(image.code[0], Op::Gosub(_)));
        assert!(image.code.iter().any(|op| matches!(op, Op::RetSub)));
    }

    #[test]
    fn test_select_case_dispatch_chain_in_order() {
        let image = compile(
            "DIM s AS INTEGER\ns = 85\nSELECT CASE s\nCASE IS >= 90: PRINT \"A\"\nCASE 80 TO 89: PRINT \"B\"\nCASE ELSE: PRINT \"?\"\nEND SELECT",
        );
        // Range guard compiles to Ge + Le + And.
        assert!(image
            .code
            .iter()
            .any(|op| matches!(op, Op::Cmp(CmpOp::Ge, _))));
        assert!(image
            .code
            .iter()
            .any(|op| matches!(op, Op::And(NumKind::I16))));
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_data_read_restore_lowering() {
        let image = compile("READ a, b\nRESTORE L2\nREAD a, b\nDATA 10,20\nL2: DATA 100,200");
        assert_eq!(image.data.len(), 4);
        assert!(matches!(image.code[0], Op::ReadData(_)));
        let restore = image
            .code
            .iter()
            .find_map(|op| match op {
                Op::RestoreData(idx) => Some(*idx),
                _ => None,
            })
            .unwrap();
        assert_eq!(restore, 2);
    }

    #[test]
    fn test_print_semicolon_suppresses_newline() {
        let with_nl = compile("PRINT 1");
        assert!(with_nl.code.iter().any(|op| matches!(op, Op::PrintEol)));
        let without_nl = compile("PRINT 1;");
        assert!(!without_nl.code.iter().any(|op| matches!(op, Op::PrintEol)));
    }

    #[test]
    fn test_procedures_emitted_after_halt() {
        let image = compile("Greet\nSUB Greet\nPRINT \"hi\"\nEND SUB");
        let halt = image
            .code
            .iter()
            .position(|op| matches!(op, Op::Halt))
            .unwrap();
        assert_eq!(image.procs.len(), 1);
        assert!(image.procs[0].entry_pc as usize > halt);
        assert!(matches!(image.code[0], Op::CallProc { proc: 0, argc: 0 }));
    }

    #[test]
    fn test_by_ref_scalar_argument() {
        let image = compile("SUB Bump (n%)\nn% = n% + 1\nEND SUB\nx% = 1\nBump x%");
        assert!(image
            .code
            .iter()
            .any(|op| matches!(op, Op::RefGlobal(_))));
    }

    #[test]
    fn test_by_val_argument_is_a_copy() {
        let image = compile("SUB Show (BYVAL n%)\nPRINT n%\nEND SUB\nx% = 1\nShow x%");
        assert!(!image.code.iter().any(|op| matches!(op, Op::RefGlobal(_))));
    }

    #[test]
    fn test_record_field_store_round_trips_record() {
        let image = compile(
            "TYPE Point\n x AS SINGLE\n y AS SINGLE\nEND TYPE\nDIM p AS Point\np.y = 2.5",
        );
        assert!(image.code.iter().any(|op| matches!(op, Op::FieldSet(1))));
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_stack_discipline_on_assorted_programs() {
        for src in [
            "PRINT \"Hello\"",
            "x = 1 + 2 * 3",
            "DIM a(10)\na(3) = 7\nPRINT a(3)",
            "FOR i = 1 TO 3\nPRINT i\nNEXT\nPRINT \"done\"",
            "IF x > 1 THEN PRINT 1 ELSE PRINT 2",
            "WHILE x < 3\nx = x + 1\nWEND",
            "DO\nx = x + 1\nLOOP UNTIL x > 2",
            "READ a\nDATA 5",
            "GOSUB S\nEND\nS: RETURN",
            "FUNCTION F% (a%)\nF% = a%\nEND FUNCTION\nPRINT F%(3)",
            "SELECT CASE x\nCASE 1\nPRINT 1\nCASE ELSE\nPRINT 2\nEND SELECT",
            "OPEN \"f.txt\" FOR OUTPUT AS #1\nPRINT #1, \"x\"\nCLOSE #1",
        ] {
            let image = compile(src);
            verify_image(&image).unwrap_or_else(|e| panic!("{src}: {e}"));
        }
    }

    #[test]
    fn test_statement_boundaries_recorded() {
        let image = compile("x = 1\ny = 2\nPRINT x + y");
        assert_eq!(image.stmt_pcs.len(), 3);
        assert_eq!(image.stmt_pcs[0], 0);
        assert!(image.stmt_pcs[1] > 0);
    }

    #[test]
    fn test_source_map_tracks_lines() {
        let image = compile("x = 1\ny = 2");
        assert!(image.source_map.len() >= 2);
        assert_eq!(image.source_map[0].line, 1);
        assert!(image.source_map.iter().any(|e| e.line == 2));
    }

    #[test]
    fn test_exit_for_jumps_to_for_end() {
        let image = compile("FOR i = 1 TO 10\nEXIT FOR\nNEXT");
        let end = image
            .code
            .iter()
            .position(|op| matches!(op, Op::ForEnd))
            .unwrap();
        let exit_jmp = image
            .code
            .iter()
            .find_map(|op| match op {
                Op::Jmp(t) => Some(*t as usize),
                _ => None,
            })
            .unwrap();
        assert_eq!(exit_jmp, end);
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_swap_lowering_is_balanced() {
        let image = compile("a% = 1\nb% = 2\nSWAP a%, b%");
        verify_image(&image).unwrap();
    }

    #[test]
    fn test_dim_array_emits_new_array_with_base() {
        let image = compile("OPTION BASE 1\nDIM a(10)");
        assert!(image
            .code
            .iter()
            .any(|op| matches!(op, Op::NewArray { dims: 1, .. })));
        // OPTION BASE 1 becomes the implicit lower bound constant.
        assert!(image.consts.contains(&ConstEntry::I32(1)));
    }
}
