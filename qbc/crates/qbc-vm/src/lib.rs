//! qbc-vm - The stack-based bytecode executor.
//!
//! A single-threaded, cooperative interpreter over an [`Image`]. All
//! state is private to one [`Vm`] instance; distinct instances share
//! nothing and may run on distinct host threads.
//!
//! Two return mechanisms coexist, modeled as two stacks: call frames
//! for `SUB`/`FUNCTION`, and a separate return-address stack for
//! `GOSUB`. Each frame records the GOSUB depth at entry so a `RETURN`
//! can never unwind through a procedure boundary.
//!
//! Side effects happen strictly in program order. The only blocking
//! points are console input and file I/O through the [`Host`]. A
//! cancellation flag is polled between instructions; on cancellation
//! the VM closes every open channel and fails with `Interrupted`.
//! Channels are likewise closed on `END`, on normal fall-through and
//! on any runtime failure.

pub mod error;
pub mod host;
pub mod rng;
pub mod value;

pub use error::{RuntimeError, VmFailure};
pub use host::{Hal, Host, ScriptedHost, StdHost};
pub use value::{Location, Value};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qbc_emit::{
    CmpKind, CmpOp, ConstEntry, FileOp, HalOp, Image, NumKind, Op, OpenMode, PrintKind, SlotRef,
    TyTag,
};
use qbc_sem::Intrinsic;
use rustc_hash::FxHashMap;

use rng::Rng;
use value::{coerce, default_value, fix_trunc};

/// Width of one `PRINT` comma zone.
const ZONE_WIDTH: usize = 14;

/// Execution limits.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub max_stack: usize,
    pub max_frames: usize,
    pub max_gosub: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack: 1 << 16,
            max_frames: 1 << 10,
            max_gosub: 1 << 14,
        }
    }
}

/// Shared cancellation flag; cancel from any thread.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Clear the flag so the token can be reused for another run (the
    /// REPL keeps one token across entries).
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An allocated array.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayObj {
    pub elem: TyTag,
    /// Inclusive (lower, upper) bounds per dimension.
    pub dims: Vec<(i64, i64)>,
    pub data: Vec<Value>,
}

/// Persistent machine state, used by the REPL to keep variables alive
/// across recompilations.
#[derive(Debug, Clone, Default)]
pub struct VmState {
    pub globals: Vec<Value>,
    pub arrays: Vec<ArrayObj>,
    pub rng: Option<Rng>,
    pub data_cursor: usize,
}

struct Frame {
    proc: u16,
    ret_pc: u32,
    locals: Vec<Value>,
    gosub_base: usize,
}

struct ForFrame {
    counter: Location,
    end: Value,
    step: Value,
    kind: NumKind,
    ascending: bool,
}

struct Channel {
    kind: OpenMode,
    handle: u64,
    col: usize,
    /// Slurped content for INPUT-mode channels.
    content: Vec<u8>,
    pos: usize,
}

pub struct Vm<'a> {
    image: &'a Image,
    host: &'a mut dyn Host,
    opts: VmOptions,
    cancel: CancelToken,

    pc: u32,
    stack: Vec<Value>,
    globals: Vec<Value>,
    arrays: Vec<ArrayObj>,
    frames: Vec<Frame>,
    for_frames: Vec<ForFrame>,
    gosub_stack: Vec<u32>,
    data_cursor: usize,
    rng: Rng,
    channels: FxHashMap<i64, Channel>,
    /// Console column for zone printing.
    col: usize,
    /// Pending comma-separated console input fields.
    input_fields: VecDeque<Vec<u8>>,
}

impl<'a> Vm<'a> {
    pub fn new(image: &'a Image, host: &'a mut dyn Host) -> Self {
        let globals = image
            .globals
            .iter()
            .map(|&tag| default_value(tag, &image.records))
            .collect();
        Self {
            image,
            host,
            opts: VmOptions::default(),
            cancel: CancelToken::new(),
            pc: 0,
            stack: Vec::new(),
            globals,
            arrays: Vec::new(),
            frames: Vec::new(),
            for_frames: Vec::new(),
            gosub_stack: Vec::new(),
            data_cursor: 0,
            rng: Rng::new(),
            channels: FxHashMap::default(),
            col: 0,
            input_fields: VecDeque::new(),
        }
    }

    pub fn with_options(mut self, opts: VmOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Use an externally owned cancellation token instead of the VM's
    /// own (one interrupt handler can then serve many VM instances).
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Restore machine state from an earlier run (REPL continuation).
    /// New global slots get their default values.
    pub fn restore_state(&mut self, state: VmState) {
        for (slot, value) in state.globals.into_iter().enumerate() {
            if slot < self.globals.len() {
                self.globals[slot] = value;
            }
        }
        self.arrays = state.arrays;
        if let Some(rng) = state.rng {
            self.rng = rng;
        }
        self.data_cursor = state.data_cursor;
    }

    /// Capture machine state for a later continuation.
    pub fn take_state(&mut self) -> VmState {
        VmState {
            globals: std::mem::take(&mut self.globals),
            arrays: std::mem::take(&mut self.arrays),
            rng: Some(self.rng.clone()),
            data_cursor: self.data_cursor,
        }
    }

    /// Run from the start of the module.
    pub fn run(&mut self) -> Result<(), VmFailure> {
        self.run_from(0)
    }

    /// Run from an instruction index (the REPL enters at a statement
    /// boundary).
    pub fn run_from(&mut self, pc: u32) -> Result<(), VmFailure> {
        self.pc = pc;
        let result = self.dispatch_loop();
        self.close_all_channels();
        result.map_err(|error| VmFailure { error, pc: self.pc })
    }

    fn dispatch_loop(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Interrupted);
            }
            let Some(&op) = self.image.code.get(self.pc as usize) else {
                return Ok(());
            };
            let mut next_pc = self.pc + 1;
            match op {
                Op::PushConst(idx) => {
                    let entry = self
                        .image
                        .consts
                        .get(idx as usize)
                        .ok_or(RuntimeError::UnsupportedImage)?;
                    let value = const_value(entry);
                    self.push(value)?;
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Dup => {
                    let top = self.peek()?.clone();
                    self.push(top)?;
                }
                Op::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(RuntimeError::StackOverflow);
                    }
                    self.stack.swap(len - 1, len - 2);
                }

                Op::LoadLocal(slot) => {
                    let value = self.load_local(slot)?;
                    self.push(value)?;
                }
                Op::StoreLocal(slot) => {
                    let value = self.pop()?;
                    self.store_local(slot, value)?;
                }
                Op::LoadGlobal(slot) => {
                    let value = self.load_global(slot)?;
                    self.push(value)?;
                }
                Op::StoreGlobal(slot) => {
                    let value = self.pop()?;
                    self.store_global(slot, value)?;
                }
                Op::RefLocal(slot) => {
                    // Forwarding an already-by-reference parameter
                    // passes the original location on.
                    let frame = self
                        .frames
                        .len()
                        .checked_sub(1)
                        .ok_or(RuntimeError::StackOverflow)? as u32;
                    let value = match self.frames.last().and_then(|f| f.locals.get(slot as usize)) {
                        Some(Value::Ref(loc)) => Value::Ref(*loc),
                        _ => Value::Ref(Location::Frame { frame, slot }),
                    };
                    self.push(value)?;
                }
                Op::RefGlobal(slot) => {
                    self.push(Value::Ref(Location::Global(slot)))?;
                }

                Op::FieldGet(index) => {
                    let record = self.pop()?;
                    match record {
                        Value::Record { fields, .. } => {
                            let value = fields
                                .get(index as usize)
                                .cloned()
                                .ok_or(RuntimeError::BoundsViolation)?;
                            self.push(value)?;
                        }
                        other => {
                            return Err(RuntimeError::TypeMismatch(format!(
                                "field access on {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Op::FieldSet(index) => {
                    let value = self.pop()?;
                    let record = self.pop()?;
                    match record {
                        Value::Record { type_id, mut fields } => {
                            let tag = self
                                .image
                                .records
                                .get(type_id as usize)
                                .and_then(|r| r.fields.get(index as usize))
                                .map(|(_, tag)| *tag)
                                .ok_or(RuntimeError::BoundsViolation)?;
                            let slot = fields
                                .get_mut(index as usize)
                                .ok_or(RuntimeError::BoundsViolation)?;
                            *slot = coerce(value, tag)?;
                            self.push(Value::Record { type_id, fields })?;
                        }
                        other => {
                            return Err(RuntimeError::TypeMismatch(format!(
                                "field store on {}",
                                other.type_name()
                            )))
                        }
                    }
                }
                Op::IndexGet(dims) => {
                    let offset = self.pop_index_offset(dims)?;
                    let array = self.pop_array_ref()?;
                    let value = self.arrays[array as usize].data[offset].clone();
                    self.push(value)?;
                }
                Op::IndexSet(dims) => {
                    let offset = self.pop_index_offset_with(dims, 1)?;
                    let value = self.pop()?;
                    let array = self.pop_array_ref()?;
                    let elem = self.arrays[array as usize].elem;
                    self.arrays[array as usize].data[offset] = coerce(value, elem)?;
                }
                Op::BoundCheck(dims) => {
                    // Peek indices and the array below them without
                    // disturbing the stack.
                    self.peek_bound_check(dims)?;
                }
                Op::NewArray { slot, dims, elem } => {
                    let array = self.new_array(dims, elem)?;
                    match slot {
                        SlotRef::Global(s) => self.store_raw_global(s, Value::ArrayRef(array))?,
                        SlotRef::Local(s) => self.store_raw_local(s, Value::ArrayRef(array))?,
                    }
                }
                Op::RefIndex(dims) => {
                    let offset = self.pop_index_offset(dims)?;
                    let array = self.pop_array_ref()?;
                    self.push(Value::Ref(Location::ArrayElem {
                        array,
                        offset: offset as u32,
                    }))?;
                }

                Op::Add(kind) => self.binary_num(kind, BinNum::Add)?,
                Op::Sub(kind) => self.binary_num(kind, BinNum::Sub)?,
                Op::Mul(kind) => self.binary_num(kind, BinNum::Mul)?,
                Op::Div(kind) => self.binary_num(kind, BinNum::Div)?,
                Op::IntDiv(kind) => self.binary_num(kind, BinNum::IntDiv)?,
                Op::Mod(kind) => self.binary_num(kind, BinNum::Mod)?,
                Op::Pow => {
                    let b = self.pop()?.as_f64()?;
                    let a = self.pop()?.as_f64()?;
                    self.push(Value::F64(a.powf(b)))?;
                }
                Op::Neg(kind) => {
                    let v = self.pop()?;
                    let v = coerce(v, num_tag(kind))?;
                    let out = match v {
                        Value::I16(x) => Value::I16(x.checked_neg().ok_or(RuntimeError::Overflow)?),
                        Value::I32(x) => Value::I32(x.checked_neg().ok_or(RuntimeError::Overflow)?),
                        Value::I64(x) => Value::I64(x.checked_neg().ok_or(RuntimeError::Overflow)?),
                        Value::U32(x) => {
                            if x == 0 {
                                Value::U32(0)
                            } else {
                                return Err(RuntimeError::Overflow);
                            }
                        }
                        Value::F32(x) => Value::F32(-x),
                        Value::F64(x) => Value::F64(-x),
                        _ => unreachable!(),
                    };
                    self.push(out)?;
                }
                Op::Cmp(cmp, kind) => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let truth = compare(cmp, kind, a, b)?;
                    self.push(Value::I16(if truth { -1 } else { 0 }))?;
                }
                Op::And(kind) => self.bitwise(kind, |a, b| a & b)?,
                Op::Or(kind) => self.bitwise(kind, |a, b| a | b)?,
                Op::Not(kind) => {
                    let v = self.pop()?;
                    let bits = coerce(v, num_tag(kind))?.as_i64()?;
                    self.push(int_value(kind, !bits)?)?;
                }
                Op::Concat => {
                    let b = self.pop()?.into_bytes()?;
                    let mut a = self.pop()?.into_bytes()?;
                    a.extend_from_slice(&b);
                    self.push(Value::Str(a))?;
                }
                Op::Coerce(_, to) => {
                    let v = self.pop()?;
                    let v = coerce(v, to)?;
                    self.push(v)?;
                }

                Op::Jmp(target) => next_pc = target,
                Op::JmpIfFalse(target) => {
                    if !self.pop()?.is_true()? {
                        next_pc = target;
                    }
                }
                Op::JmpIfTrue(target) => {
                    if self.pop()?.is_true()? {
                        next_pc = target;
                    }
                }
                Op::ForInit { slot, exit } => {
                    next_pc = self.for_init(slot, exit)?;
                }
                Op::ForStep { body } => {
                    if self.for_step()? {
                        next_pc = body;
                    }
                }
                Op::ForEnd => {
                    self.for_frames.pop();
                }
                Op::Gosub(target) => {
                    if self.gosub_stack.len() >= self.opts.max_gosub {
                        return Err(RuntimeError::StackOverflow);
                    }
                    self.gosub_stack.push(self.pc + 1);
                    next_pc = target;
                }
                Op::RetSub => {
                    next_pc = self.gosub_return()?;
                }
                Op::RetSubTo(target) => {
                    self.gosub_return()?;
                    next_pc = target;
                }
                Op::CallProc { proc, argc } => {
                    next_pc = self.call_proc(proc, argc)?;
                }
                Op::Ret => match self.ret_from_proc()? {
                    Some(pc) => next_pc = pc,
                    None => return Ok(()),
                },

                Op::PrintItem(PrintKind::Value) => {
                    let value = self.pop()?;
                    let text = format_print_value(&value)?;
                    self.console_write(&text)?;
                }
                Op::PrintItem(PrintKind::Zone) => {
                    let pad = zone_padding(self.col);
                    self.console_write(&vec![b' '; pad])?;
                }
                Op::PrintEol => {
                    self.console_write(b"\n")?;
                }
                Op::InputItem(tag) => {
                    let field = self.next_input_field()?;
                    let value = parse_input_field(&field, tag)?;
                    self.push(value)?;
                }
                Op::LineInput => {
                    let line = self
                        .host
                        .stdin_readline()
                        .map_err(io_error)?
                        .ok_or_else(|| RuntimeError::IoError("input past end of file".into()))?;
                    self.push(Value::Str(line.into_bytes()))?;
                }
                Op::InputPrompt { question } => {
                    let prompt = self.pop()?.into_bytes()?;
                    self.console_write(&prompt)?;
                    if question {
                        self.console_write(b"? ")?;
                    }
                }
                Op::Open(mode) => {
                    let chan = self.pop()?.as_i64()?;
                    let path = self.pop()?.into_bytes()?;
                    self.open_channel(chan, &path, mode)?;
                }
                Op::Close => {
                    let chan = self.pop()?.as_i64()?;
                    self.close_channel(chan);
                }
                Op::CloseAll => self.close_all_channels(),
                Op::FileIo(file_op) => self.file_io(file_op)?,
                Op::ReadData(tag) => {
                    let value = self.read_data(tag)?;
                    self.push(value)?;
                }
                Op::RestoreData(idx) => {
                    self.data_cursor = idx as usize;
                }
                Op::Rnd => {
                    let v = self.rng.next();
                    self.push(Value::F32(v))?;
                }
                Op::Randomize => {
                    let seed = self.pop()?.as_f64()?;
                    self.rng.randomize(seed);
                }
                Op::Timer => {
                    let t = self.host.now_ticks() as f32;
                    self.push(Value::F32(t))?;
                }
                Op::Intrinsic { id, argc } => {
                    let mut args = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        args.push(self.pop()?);
                    }
                    args.reverse();
                    let intrinsic = Intrinsic::from_id(id)
                        .ok_or(RuntimeError::UnsupportedImage)?;
                    let result = self.call_intrinsic(intrinsic, args)?;
                    self.push(result)?;
                }
                Op::Hal(hal_op) => self.hal_op(hal_op)?,
                Op::Halt => return Ok(()),
            }
            self.pc = next_pc;
        }
    }

    // -------------------------------------------------------------------
    // Stack and slots
    // -------------------------------------------------------------------

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.opts.max_stack {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::StackOverflow)
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or(RuntimeError::StackOverflow)
    }

    fn load_global(&mut self, slot: u16) -> Result<Value, RuntimeError> {
        match self.globals.get(slot as usize) {
            Some(Value::Ref(loc)) => {
                let loc = *loc;
                self.load_loc(loc)
            }
            Some(v) => Ok(v.clone()),
            None => Err(RuntimeError::BoundsViolation),
        }
    }

    fn load_local(&mut self, slot: u16) -> Result<Value, RuntimeError> {
        let frame = self.frames.last().ok_or(RuntimeError::StackOverflow)?;
        match frame.locals.get(slot as usize) {
            Some(Value::Ref(loc)) => {
                let loc = *loc;
                self.load_loc(loc)
            }
            Some(v) => Ok(v.clone()),
            None => Err(RuntimeError::BoundsViolation),
        }
    }

    fn load_loc(&mut self, loc: Location) -> Result<Value, RuntimeError> {
        match loc {
            Location::Global(slot) => self.load_global(slot),
            Location::Frame { frame, slot } => {
                let value = self
                    .frames
                    .get(frame as usize)
                    .and_then(|f| f.locals.get(slot as usize))
                    .cloned()
                    .ok_or(RuntimeError::BoundsViolation)?;
                match value {
                    Value::Ref(inner) => self.load_loc(inner),
                    v => Ok(v),
                }
            }
            Location::ArrayElem { array, offset } => self
                .arrays
                .get(array as usize)
                .and_then(|a| a.data.get(offset as usize))
                .cloned()
                .ok_or(RuntimeError::BoundsViolation),
        }
    }

    fn store_global(&mut self, slot: u16, value: Value) -> Result<(), RuntimeError> {
        if let Some(Value::Ref(loc)) = self.globals.get(slot as usize) {
            let loc = *loc;
            return self.store_loc(loc, value);
        }
        let tag = *self
            .image
            .globals
            .get(slot as usize)
            .ok_or(RuntimeError::BoundsViolation)?;
        let value = tag_for_store(value, tag)?;
        self.globals[slot as usize] = value;
        Ok(())
    }

    fn store_local(&mut self, slot: u16, value: Value) -> Result<(), RuntimeError> {
        let frame = self.frames.last().ok_or(RuntimeError::StackOverflow)?;
        if let Some(Value::Ref(loc)) = frame.locals.get(slot as usize) {
            let loc = *loc;
            return self.store_loc(loc, value);
        }
        let tag = *self
            .image
            .procs
            .get(frame.proc as usize)
            .and_then(|p| p.locals.get(slot as usize))
            .ok_or(RuntimeError::BoundsViolation)?;
        let value = tag_for_store(value, tag)?;
        self.frames.last_mut().unwrap().locals[slot as usize] = value;
        Ok(())
    }

    /// Store bypassing ref chasing (array allocation writes the slot
    /// itself).
    fn store_raw_global(&mut self, slot: u16, value: Value) -> Result<(), RuntimeError> {
        *self
            .globals
            .get_mut(slot as usize)
            .ok_or(RuntimeError::BoundsViolation)? = value;
        Ok(())
    }

    fn store_raw_local(&mut self, slot: u16, value: Value) -> Result<(), RuntimeError> {
        let frame = self.frames.last_mut().ok_or(RuntimeError::StackOverflow)?;
        *frame
            .locals
            .get_mut(slot as usize)
            .ok_or(RuntimeError::BoundsViolation)? = value;
        Ok(())
    }

    fn store_loc(&mut self, loc: Location, value: Value) -> Result<(), RuntimeError> {
        match loc {
            Location::Global(slot) => self.store_global(slot, value),
            Location::Frame { frame, slot } => {
                let proc = self
                    .frames
                    .get(frame as usize)
                    .map(|f| f.proc)
                    .ok_or(RuntimeError::BoundsViolation)?;
                let tag = *self
                    .image
                    .procs
                    .get(proc as usize)
                    .and_then(|p| p.locals.get(slot as usize))
                    .ok_or(RuntimeError::BoundsViolation)?;
                let value = tag_for_store(value, tag)?;
                self.frames[frame as usize].locals[slot as usize] = value;
                Ok(())
            }
            Location::ArrayElem { array, offset } => {
                let elem = self
                    .arrays
                    .get(array as usize)
                    .map(|a| a.elem)
                    .ok_or(RuntimeError::BoundsViolation)?;
                let value = coerce(value, elem)?;
                *self.arrays[array as usize]
                    .data
                    .get_mut(offset as usize)
                    .ok_or(RuntimeError::BoundsViolation)? = value;
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------
    // Arrays
    // -------------------------------------------------------------------

    fn pop_array_ref(&mut self) -> Result<u32, RuntimeError> {
        match self.pop()? {
            Value::ArrayRef(id) => Ok(id),
            Value::Empty => Err(RuntimeError::TypeMismatch(
                "array used before DIM executed".into(),
            )),
            other => Err(RuntimeError::TypeMismatch(format!(
                "subscript on {}",
                other.type_name()
            ))),
        }
    }

    /// Pop `dims` indices, resolve them against the array that sits
    /// `extra` values deeper in the stack, and return the flat offset.
    fn pop_index_offset(&mut self, dims: u8) -> Result<usize, RuntimeError> {
        self.pop_index_offset_with(dims, 0)
    }

    fn pop_index_offset_with(&mut self, dims: u8, extra: usize) -> Result<usize, RuntimeError> {
        let mut indices = Vec::with_capacity(dims as usize);
        for _ in 0..dims {
            indices.push(self.pop()?.as_i64()?);
        }
        indices.reverse();
        let depth = self.stack.len();
        let array_pos = depth
            .checked_sub(extra + 1)
            .ok_or(RuntimeError::StackOverflow)?;
        let array = match &self.stack[array_pos] {
            Value::ArrayRef(id) => *id,
            Value::Empty => {
                return Err(RuntimeError::TypeMismatch(
                    "array used before DIM executed".into(),
                ))
            }
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "subscript on {}",
                    other.type_name()
                )))
            }
        };
        self.flat_offset(array, &indices)
    }

    fn flat_offset(&self, array: u32, indices: &[i64]) -> Result<usize, RuntimeError> {
        let obj = self
            .arrays
            .get(array as usize)
            .ok_or(RuntimeError::BoundsViolation)?;
        if indices.len() != obj.dims.len() {
            return Err(RuntimeError::BoundsViolation);
        }
        let mut offset: usize = 0;
        for (&idx, &(lo, hi)) in indices.iter().zip(&obj.dims) {
            if idx < lo || idx > hi {
                return Err(RuntimeError::BoundsViolation);
            }
            offset = offset * ((hi - lo + 1) as usize) + (idx - lo) as usize;
        }
        Ok(offset)
    }

    fn peek_bound_check(&mut self, dims: u8) -> Result<(), RuntimeError> {
        let depth = self.stack.len();
        if depth < dims as usize + 1 {
            return Err(RuntimeError::StackOverflow);
        }
        let array = match &self.stack[depth - dims as usize - 1] {
            Value::ArrayRef(id) => *id,
            Value::Empty => {
                return Err(RuntimeError::TypeMismatch(
                    "array used before DIM executed".into(),
                ))
            }
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "subscript on {}",
                    other.type_name()
                )))
            }
        };
        let mut indices = Vec::with_capacity(dims as usize);
        for i in 0..dims as usize {
            indices.push(self.stack[depth - dims as usize + i].as_i64()?);
        }
        self.flat_offset(array, &indices).map(|_| ())
    }

    fn new_array(&mut self, dims: u8, elem: TyTag) -> Result<u32, RuntimeError> {
        let mut bounds = Vec::with_capacity(dims as usize * 2);
        for _ in 0..dims * 2 {
            bounds.push(self.pop()?.as_i64()?);
        }
        bounds.reverse();
        let mut dim_pairs = Vec::with_capacity(dims as usize);
        let mut total: usize = 1;
        for pair in bounds.chunks(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if lo > hi {
                return Err(RuntimeError::BoundsViolation);
            }
            let extent = (hi - lo + 1) as usize;
            total = total
                .checked_mul(extent)
                .filter(|&t| t <= (1 << 24))
                .ok_or(RuntimeError::Overflow)?;
            dim_pairs.push((lo, hi));
        }
        let default = default_value(elem, &self.image.records);
        let id = self.arrays.len() as u32;
        self.arrays.push(ArrayObj {
            elem,
            dims: dim_pairs,
            data: vec![default; total],
        });
        Ok(id)
    }

    // -------------------------------------------------------------------
    // Arithmetic helpers
    // -------------------------------------------------------------------

    fn binary_num(&mut self, kind: NumKind, op: BinNum) -> Result<(), RuntimeError> {
        let b = coerce(self.pop()?, num_tag(kind))?;
        let a = coerce(self.pop()?, num_tag(kind))?;
        let out = arith(kind, op, a, b)?;
        self.push(out)
    }

    fn bitwise(&mut self, kind: NumKind, f: impl Fn(i64, i64) -> i64) -> Result<(), RuntimeError> {
        let b = coerce(self.pop()?, num_tag(kind))?.as_i64()?;
        let a = coerce(self.pop()?, num_tag(kind))?.as_i64()?;
        self.push(int_value(kind, f(a, b))?)
    }

    // -------------------------------------------------------------------
    // FOR loops
    // -------------------------------------------------------------------

    fn for_init(&mut self, slot: SlotRef, exit: u32) -> Result<u32, RuntimeError> {
        let (counter, tag) = match slot {
            SlotRef::Global(s) => (
                Location::Global(s),
                *self
                    .image
                    .globals
                    .get(s as usize)
                    .ok_or(RuntimeError::BoundsViolation)?,
            ),
            SlotRef::Local(s) => {
                let frame_idx = self
                    .frames
                    .len()
                    .checked_sub(1)
                    .ok_or(RuntimeError::StackOverflow)? as u32;
                let frame = self.frames.last().ok_or(RuntimeError::StackOverflow)?;
                let tag = *self
                    .image
                    .procs
                    .get(frame.proc as usize)
                    .and_then(|p| p.locals.get(s as usize))
                    .ok_or(RuntimeError::BoundsViolation)?;
                (
                    Location::Frame {
                        frame: frame_idx,
                        slot: s,
                    },
                    tag,
                )
            }
        };
        let kind = tag.num_kind().ok_or_else(|| {
            RuntimeError::TypeMismatch("FOR counter must be numeric".into())
        })?;
        let step = coerce(self.pop()?, tag)?;
        let end = coerce(self.pop()?, tag)?;
        let start = coerce(self.pop()?, tag)?;

        self.store_loc(counter, start.clone())?;
        let step_sign = step.as_f64()?;
        let ascending = step_sign > 0.0;
        self.for_frames.push(ForFrame {
            counter,
            end: end.clone(),
            step,
            kind,
            ascending,
        });

        let enter = if step_sign == 0.0 {
            false
        } else if ascending {
            !num_gt(kind, &start, &end)?
        } else {
            !num_gt(kind, &end, &start)?
        };
        Ok(if enter { self.pc + 1 } else { exit })
    }

    /// Advance the innermost loop; true means continue with the body.
    fn for_step(&mut self) -> Result<bool, RuntimeError> {
        let frame = self
            .for_frames
            .last()
            .ok_or(RuntimeError::StackOverflow)?;
        let (counter, end, step, kind, ascending) = (
            frame.counter,
            frame.end.clone(),
            frame.step.clone(),
            frame.kind,
            frame.ascending,
        );
        let current = self.load_loc(counter)?;
        let next = arith(kind, BinNum::Add, current, step)?;
        self.store_loc(counter, next.clone())?;
        let cont = if ascending {
            !num_gt(kind, &next, &end)?
        } else {
            !num_gt(kind, &end, &next)?
        };
        Ok(cont)
    }

    // -------------------------------------------------------------------
    // GOSUB and procedures
    // -------------------------------------------------------------------

    fn gosub_base(&self) -> usize {
        self.frames.last().map(|f| f.gosub_base).unwrap_or(0)
    }

    fn gosub_return(&mut self) -> Result<u32, RuntimeError> {
        if self.gosub_stack.len() <= self.gosub_base() {
            return Err(RuntimeError::ReturnWithoutGosub);
        }
        Ok(self.gosub_stack.pop().unwrap())
    }

    fn call_proc(&mut self, proc: u16, argc: u8) -> Result<u32, RuntimeError> {
        if self.frames.len() >= self.opts.max_frames {
            return Err(RuntimeError::StackOverflow);
        }
        let entry = self
            .image
            .procs
            .get(proc as usize)
            .ok_or(RuntimeError::UnsupportedImage)?;
        let mut locals: Vec<Value> = entry
            .locals
            .iter()
            .map(|&tag| default_value(tag, &self.image.records))
            .collect();
        for i in (0..argc as usize).rev() {
            let arg = self.pop()?;
            let value = match arg {
                refv @ Value::Ref(_) => refv,
                arr @ Value::ArrayRef(_) => arr,
                plain => {
                    let tag = entry
                        .locals
                        .get(i)
                        .copied()
                        .ok_or(RuntimeError::UnsupportedImage)?;
                    coerce(plain, tag)?
                }
            };
            if i < locals.len() {
                locals[i] = value;
            }
        }
        self.frames.push(Frame {
            proc,
            ret_pc: self.pc + 1,
            locals,
            gosub_base: self.gosub_stack.len(),
        });
        Ok(entry.entry_pc)
    }

    fn ret_from_proc(&mut self) -> Result<Option<u32>, RuntimeError> {
        let frame = match self.frames.pop() {
            Some(f) => f,
            None => return Ok(None),
        };
        self.gosub_stack.truncate(frame.gosub_base);
        let entry = &self.image.procs[frame.proc as usize];
        if entry.is_function {
            let ret_slot = entry.params.len();
            let value = frame
                .locals
                .get(ret_slot)
                .cloned()
                .unwrap_or(Value::Empty);
            self.push(value)?;
        }
        Ok(Some(frame.ret_pc))
    }

    // -------------------------------------------------------------------
    // Console I/O
    // -------------------------------------------------------------------

    fn console_write(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.host.stdout_write(bytes).map_err(io_error)?;
        for &b in bytes {
            if b == b'\n' {
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        Ok(())
    }

    fn next_input_field(&mut self) -> Result<Vec<u8>, RuntimeError> {
        loop {
            if let Some(field) = self.input_fields.pop_front() {
                return Ok(field);
            }
            let line = self
                .host
                .stdin_readline()
                .map_err(io_error)?
                .ok_or_else(|| RuntimeError::IoError("input past end of file".into()))?;
            self.col = 0;
            for field in split_input_line(line.as_bytes()) {
                self.input_fields.push_back(field);
            }
        }
    }

    // -------------------------------------------------------------------
    // File channels
    // -------------------------------------------------------------------

    fn open_channel(&mut self, chan: i64, path: &[u8], mode: OpenMode) -> Result<(), RuntimeError> {
        if !(1..=255).contains(&chan) || self.channels.contains_key(&chan) {
            return Err(RuntimeError::BadChannel);
        }
        let path = String::from_utf8_lossy(path).into_owned();
        let handle = self.host.open(&path, mode).map_err(io_error)?;
        let mut content = Vec::new();
        if mode == OpenMode::Input {
            let mut buf = [0u8; 4096];
            loop {
                let n = self.host.read(handle, &mut buf).map_err(io_error)?;
                if n == 0 {
                    break;
                }
                content.extend_from_slice(&buf[..n]);
            }
        }
        self.channels.insert(
            chan,
            Channel {
                kind: mode,
                handle,
                col: 0,
                content,
                pos: 0,
            },
        );
        Ok(())
    }

    fn close_channel(&mut self, chan: i64) {
        // Closing a channel that is not open is a no-op, as the
        // original interpreter has it.
        if let Some(channel) = self.channels.remove(&chan) {
            let _ = self.host.close(channel.handle);
        }
    }

    fn close_all_channels(&mut self) {
        let channels: Vec<i64> = self.channels.keys().copied().collect();
        for chan in channels {
            self.close_channel(chan);
        }
    }

    fn file_io(&mut self, op: FileOp) -> Result<(), RuntimeError> {
        match op {
            FileOp::PrintValue => {
                let value = self.pop()?;
                let chan = self.pop()?.as_i64()?;
                let text = format_print_value(&value)?;
                self.channel_write(chan, &text)
            }
            FileOp::PrintZone => {
                let chan = self.pop()?.as_i64()?;
                let col = self.writable_channel(chan)?.col;
                let pad = zone_padding(col);
                self.channel_write(chan, &vec![b' '; pad])
            }
            FileOp::PrintEol => {
                let chan = self.pop()?.as_i64()?;
                self.channel_write(chan, b"\n")
            }
            FileOp::InputItem(tag) => {
                let chan = self.pop()?.as_i64()?;
                let field = self.channel_read_field(chan)?;
                let value = parse_input_field(&field, tag)?;
                self.push(value)
            }
            FileOp::LineInput => {
                let chan = self.pop()?.as_i64()?;
                let line = self.channel_read_line(chan)?;
                self.push(Value::Str(line))
            }
            FileOp::Eof => {
                let chan = self.pop()?.as_i64()?;
                let channel = self.channels.get(&chan).ok_or(RuntimeError::BadChannel)?;
                let at_end = channel.pos >= channel.content.len();
                self.push(Value::I16(if at_end { -1 } else { 0 }))
            }
        }
    }

    fn writable_channel(&mut self, chan: i64) -> Result<&mut Channel, RuntimeError> {
        let channel = self.channels.get_mut(&chan).ok_or(RuntimeError::BadChannel)?;
        match channel.kind {
            OpenMode::Output | OpenMode::Append => Ok(channel),
            _ => Err(RuntimeError::IoError("file not open for output".into())),
        }
    }

    fn channel_write(&mut self, chan: i64, bytes: &[u8]) -> Result<(), RuntimeError> {
        let handle = {
            let channel = self.writable_channel(chan)?;
            for &b in bytes {
                if b == b'\n' {
                    channel.col = 0;
                } else {
                    channel.col += 1;
                }
            }
            channel.handle
        };
        let mut written = 0;
        while written < bytes.len() {
            let n = self
                .host
                .write(handle, &bytes[written..])
                .map_err(io_error)?;
            if n == 0 {
                return Err(RuntimeError::IoError("write failed".into()));
            }
            written += n;
        }
        Ok(())
    }

    fn readable_channel(&mut self, chan: i64) -> Result<&mut Channel, RuntimeError> {
        let channel = self.channels.get_mut(&chan).ok_or(RuntimeError::BadChannel)?;
        match channel.kind {
            OpenMode::Input => Ok(channel),
            _ => Err(RuntimeError::IoError("file not open for input".into())),
        }
    }

    fn channel_read_line(&mut self, chan: i64) -> Result<Vec<u8>, RuntimeError> {
        let channel = self.readable_channel(chan)?;
        if channel.pos >= channel.content.len() {
            return Err(RuntimeError::IoError("input past end of file".into()));
        }
        let rest = &channel.content[channel.pos..];
        let (line, advance) = match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => (&rest[..nl], nl + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line).to_vec();
        channel.pos += advance;
        Ok(line)
    }

    fn channel_read_field(&mut self, chan: i64) -> Result<Vec<u8>, RuntimeError> {
        let channel = self.readable_channel(chan)?;
        // Skip whitespace and line terminators between fields.
        while channel.pos < channel.content.len()
            && matches!(channel.content[channel.pos], b' ' | b'\t' | b'\r' | b'\n')
        {
            channel.pos += 1;
        }
        if channel.pos >= channel.content.len() {
            return Err(RuntimeError::IoError("input past end of file".into()));
        }
        let content = &channel.content;
        let mut pos = channel.pos;
        let field = if content[pos] == b'"' {
            pos += 1;
            let start = pos;
            while pos < content.len() && content[pos] != b'"' {
                pos += 1;
            }
            let field = content[start..pos].to_vec();
            if pos < content.len() {
                pos += 1;
            }
            field
        } else {
            let start = pos;
            while pos < content.len() && !matches!(content[pos], b',' | b'\r' | b'\n') {
                pos += 1;
            }
            let mut field = content[start..pos].to_vec();
            while field.last() == Some(&b' ') {
                field.pop();
            }
            field
        };
        // Consume one trailing separator: a comma, or the line break
        // so EOF goes true right after the last item on the last line.
        if pos < content.len() && content[pos] == b',' {
            pos += 1;
        } else {
            if pos < content.len() && content[pos] == b'\r' {
                pos += 1;
            }
            if pos < content.len() && content[pos] == b'\n' {
                pos += 1;
            }
        }
        channel.pos = pos;
        Ok(field)
    }

    // -------------------------------------------------------------------
    // DATA
    // -------------------------------------------------------------------

    fn read_data(&mut self, tag: TyTag) -> Result<Value, RuntimeError> {
        let entry = self
            .image
            .data
            .get(self.data_cursor)
            .ok_or(RuntimeError::OutOfData)?;
        self.data_cursor += 1;
        let value = const_value(entry);
        match (&value, tag) {
            (Value::Str(_), TyTag::Str | TyTag::FixedStr(_)) => coerce(value, tag),
            (Value::Str(_), _) => Err(RuntimeError::TypeMismatch(
                "numeric READ from a string DATA item".into(),
            )),
            (_, TyTag::Str | TyTag::FixedStr(_)) => {
                // Numeric DATA read into a string target keeps the
                // canonical digits.
                let digits = if value.is_negative() {
                    format!("-{}", value.display_digits()?)
                } else {
                    value.display_digits()?
                };
                coerce(Value::Str(digits.into_bytes()), tag)
            }
            _ => coerce(value, tag),
        }
    }

    // -------------------------------------------------------------------
    // Intrinsics
    // -------------------------------------------------------------------

    fn call_intrinsic(
        &mut self,
        intrinsic: Intrinsic,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let arg = |i: usize| -> &Value { &args[i] };
        Ok(match intrinsic {
            Intrinsic::Abs => match arg(0) {
                Value::I16(v) => Value::I16(v.checked_abs().ok_or(RuntimeError::Overflow)?),
                Value::I32(v) => Value::I32(v.checked_abs().ok_or(RuntimeError::Overflow)?),
                Value::I64(v) => Value::I64(v.checked_abs().ok_or(RuntimeError::Overflow)?),
                Value::U32(v) => Value::U32(*v),
                Value::F32(v) => Value::F32(v.abs()),
                Value::F64(v) => Value::F64(v.abs()),
                other => {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "ABS of {}",
                        other.type_name()
                    )))
                }
            },
            Intrinsic::Sgn => {
                let v = arg(0).as_f64()?;
                Value::I16(if v > 0.0 {
                    1
                } else if v < 0.0 {
                    -1
                } else {
                    0
                })
            }
            Intrinsic::Int => match arg(0) {
                Value::F32(v) => Value::F32(v.floor()),
                Value::F64(v) => Value::F64(v.floor()),
                v if v.is_numeric() => v.clone(),
                other => {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "INT of {}",
                        other.type_name()
                    )))
                }
            },
            Intrinsic::Fix => fix_trunc(arg(0))?,
            Intrinsic::Sqr => {
                let v = arg(0).as_f64()?;
                if v < 0.0 {
                    return Err(RuntimeError::TypeMismatch(
                        "SQR of a negative number".into(),
                    ));
                }
                Value::F64(v.sqrt())
            }
            Intrinsic::Len => Value::I32(arg(0).as_bytes()?.len() as i32),
            Intrinsic::Chr => {
                let code = arg(0).as_i64()?;
                if !(0..=255).contains(&code) {
                    return Err(RuntimeError::TypeMismatch(
                        "CHR$ code out of range".into(),
                    ));
                }
                Value::Str(vec![code as u8])
            }
            Intrinsic::Asc => {
                let bytes = arg(0).as_bytes()?;
                match bytes.first() {
                    Some(&b) => Value::I32(b as i32),
                    None => {
                        return Err(RuntimeError::TypeMismatch(
                            "ASC of an empty string".into(),
                        ))
                    }
                }
            }
            Intrinsic::Str => {
                let digits = arg(0).display_digits()?;
                let text = if arg(0).is_negative() {
                    format!("-{digits}")
                } else {
                    format!(" {digits}")
                };
                Value::Str(text.into_bytes())
            }
            Intrinsic::Val => Value::F64(parse_val(arg(0).as_bytes()?)),
            Intrinsic::Left => {
                let n = arg(1).as_i64()?.max(0) as usize;
                let bytes = arg(0).as_bytes()?;
                Value::Str(bytes[..n.min(bytes.len())].to_vec())
            }
            Intrinsic::Right => {
                let n = arg(1).as_i64()?.max(0) as usize;
                let bytes = arg(0).as_bytes()?;
                let start = bytes.len().saturating_sub(n);
                Value::Str(bytes[start..].to_vec())
            }
            Intrinsic::Mid => {
                let bytes = arg(0).as_bytes()?;
                let start = arg(1).as_i64()?;
                if start < 1 {
                    return Err(RuntimeError::TypeMismatch(
                        "MID$ start below 1".into(),
                    ));
                }
                let start = (start - 1) as usize;
                let len = if args.len() > 2 {
                    arg(2).as_i64()?.max(0) as usize
                } else {
                    usize::MAX
                };
                let slice = if start >= bytes.len() {
                    &[][..]
                } else {
                    let end = bytes.len().min(start.saturating_add(len));
                    &bytes[start..end]
                };
                Value::Str(slice.to_vec())
            }
            Intrinsic::Instr => {
                let (start, hay, needle) = if args.len() == 3 {
                    (arg(0).as_i64()?, arg(1).as_bytes()?, arg(2).as_bytes()?)
                } else {
                    (1, arg(0).as_bytes()?, arg(1).as_bytes()?)
                };
                if start < 1 {
                    return Err(RuntimeError::TypeMismatch(
                        "INSTR start below 1".into(),
                    ));
                }
                let from = (start - 1) as usize;
                let found = if from > hay.len() {
                    None
                } else if needle.is_empty() {
                    Some(from)
                } else {
                    hay[from..]
                        .windows(needle.len())
                        .position(|w| w == needle)
                        .map(|p| p + from)
                };
                Value::I32(found.map(|p| p as i32 + 1).unwrap_or(0))
            }
            Intrinsic::Space => {
                let n = arg(0).as_i64()?.max(0) as usize;
                Value::Str(vec![b' '; n])
            }
            Intrinsic::StringRep => {
                let n = arg(0).as_i64()?.max(0) as usize;
                let byte = match arg(1) {
                    Value::Str(bytes) => *bytes.first().ok_or_else(|| {
                        RuntimeError::TypeMismatch("STRING$ of an empty string".into())
                    })?,
                    v => {
                        let code = v.as_i64()?;
                        if !(0..=255).contains(&code) {
                            return Err(RuntimeError::TypeMismatch(
                                "STRING$ code out of range".into(),
                            ));
                        }
                        code as u8
                    }
                };
                Value::Str(vec![byte; n])
            }
            Intrinsic::Ucase => Value::Str(
                arg(0)
                    .as_bytes()?
                    .iter()
                    .map(|b| b.to_ascii_uppercase())
                    .collect(),
            ),
            Intrinsic::Lcase => Value::Str(
                arg(0)
                    .as_bytes()?
                    .iter()
                    .map(|b| b.to_ascii_lowercase())
                    .collect(),
            ),
            Intrinsic::Ltrim => {
                let bytes = arg(0).as_bytes()?;
                let start = bytes.iter().position(|&b| b != b' ').unwrap_or(bytes.len());
                Value::Str(bytes[start..].to_vec())
            }
            Intrinsic::Rtrim => {
                let bytes = arg(0).as_bytes()?;
                let end = bytes
                    .iter()
                    .rposition(|&b| b != b' ')
                    .map(|p| p + 1)
                    .unwrap_or(0);
                Value::Str(bytes[..end].to_vec())
            }
            // RND, TIMER and EOF lower to dedicated instructions.
            Intrinsic::Rnd | Intrinsic::Timer | Intrinsic::Eof => {
                return Err(RuntimeError::UnsupportedImage)
            }
        })
    }

    fn hal_op(&mut self, op: HalOp) -> Result<(), RuntimeError> {
        match op {
            // Screen and sound degrade to no-ops without a HAL.
            HalOp::Cls => {
                if let Some(hal) = self.host.hal() {
                    hal.cls();
                }
                Ok(())
            }
            HalOp::Beep => {
                if let Some(hal) = self.host.hal() {
                    hal.beep();
                }
                Ok(())
            }
            HalOp::Sleep => {
                let seconds = self.pop()?.as_f64()?;
                match self.host.hal() {
                    Some(hal) => {
                        hal.sleep(seconds);
                        Ok(())
                    }
                    None => Err(RuntimeError::FeatureUnavailable),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum BinNum {
    Add,
    Sub,
    Mul,
    Div,
    IntDiv,
    Mod,
}

fn num_tag(kind: NumKind) -> TyTag {
    match kind {
        NumKind::I16 => TyTag::I16,
        NumKind::I32 => TyTag::I32,
        NumKind::I64 => TyTag::I64,
        NumKind::U32 => TyTag::U32,
        NumKind::F32 => TyTag::F32,
        NumKind::F64 => TyTag::F64,
    }
}

fn int_value(kind: NumKind, bits: i64) -> Result<Value, RuntimeError> {
    Ok(match kind {
        NumKind::I16 => Value::I16(bits as i16),
        NumKind::I32 => Value::I32(bits as i32),
        NumKind::U32 => Value::U32(bits as u32),
        _ => Value::I64(bits),
    })
}

fn arith(kind: NumKind, op: BinNum, a: Value, b: Value) -> Result<Value, RuntimeError> {
    macro_rules! int_case {
        ($variant:ident, $ty:ty, $av:expr, $bv:expr) => {{
            let (x, y): ($ty, $ty) = ($av, $bv);
            match op {
                BinNum::Add => Value::$variant(x.checked_add(y).ok_or(RuntimeError::Overflow)?),
                BinNum::Sub => Value::$variant(x.checked_sub(y).ok_or(RuntimeError::Overflow)?),
                BinNum::Mul => Value::$variant(x.checked_mul(y).ok_or(RuntimeError::Overflow)?),
                BinNum::IntDiv => {
                    if y == 0 {
                        return Err(RuntimeError::DivideByZero);
                    }
                    Value::$variant(x.checked_div(y).ok_or(RuntimeError::Overflow)?)
                }
                BinNum::Mod => {
                    if y == 0 {
                        return Err(RuntimeError::DivideByZero);
                    }
                    Value::$variant(x.checked_rem(y).ok_or(RuntimeError::Overflow)?)
                }
                BinNum::Div => unreachable!("float division on integer kind"),
            }
        }};
    }
    Ok(match (kind, a, b) {
        (NumKind::I16, Value::I16(x), Value::I16(y)) => int_case!(I16, i16, x, y),
        (NumKind::I32, Value::I32(x), Value::I32(y)) => int_case!(I32, i32, x, y),
        (NumKind::I64, Value::I64(x), Value::I64(y)) => int_case!(I64, i64, x, y),
        (NumKind::U32, Value::U32(x), Value::U32(y)) => int_case!(U32, u32, x, y),
        (NumKind::F32, Value::F32(x), Value::F32(y)) => match op {
            BinNum::Add => Value::F32(x + y),
            BinNum::Sub => Value::F32(x - y),
            BinNum::Mul => Value::F32(x * y),
            BinNum::Div => {
                if y == 0.0 {
                    return Err(RuntimeError::DivideByZero);
                }
                Value::F32(x / y)
            }
            _ => unreachable!("integer op on float kind"),
        },
        (NumKind::F64, Value::F64(x), Value::F64(y)) => match op {
            BinNum::Add => Value::F64(x + y),
            BinNum::Sub => Value::F64(x - y),
            BinNum::Mul => Value::F64(x * y),
            BinNum::Div => {
                if y == 0.0 {
                    return Err(RuntimeError::DivideByZero);
                }
                Value::F64(x / y)
            }
            _ => unreachable!("integer op on float kind"),
        },
        (_, a, _) => {
            return Err(RuntimeError::TypeMismatch(format!(
                "arithmetic on {}",
                a.type_name()
            )))
        }
    })
}

/// `a > b` in the given numeric kind; exact for 64-bit integers.
fn num_gt(kind: NumKind, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
    Ok(match kind {
        NumKind::I64 => a.as_i64()? > b.as_i64()?,
        _ => a.as_f64()? > b.as_f64()?,
    })
}

fn compare(op: CmpOp, kind: CmpKind, a: Value, b: Value) -> Result<bool, RuntimeError> {
    use std::cmp::Ordering;
    let ord = match kind {
        CmpKind::Str => a.as_bytes()?.cmp(b.as_bytes()?),
        CmpKind::Num(NumKind::I64) => a.as_i64()?.cmp(&b.as_i64()?),
        CmpKind::Num(_) => a
            .as_f64()?
            .partial_cmp(&b.as_f64()?)
            .unwrap_or(Ordering::Equal),
    };
    Ok(match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Ne => ord != Ordering::Equal,
        CmpOp::Lt => ord == Ordering::Less,
        CmpOp::Le => ord != Ordering::Greater,
        CmpOp::Gt => ord == Ordering::Greater,
        CmpOp::Ge => ord != Ordering::Less,
    })
}

fn const_value(entry: &ConstEntry) -> Value {
    match entry {
        ConstEntry::I16(v) => Value::I16(*v),
        ConstEntry::I32(v) => Value::I32(*v),
        ConstEntry::I64(v) => Value::I64(*v),
        ConstEntry::F32(v) => Value::F32(*v),
        ConstEntry::F64(v) => Value::F64(*v),
        ConstEntry::Str(bytes) => Value::Str(bytes.clone()),
    }
}

/// Stores skip coercion for reference-like values.
fn tag_for_store(value: Value, tag: TyTag) -> Result<Value, RuntimeError> {
    match value {
        v @ (Value::Ref(_) | Value::ArrayRef(_) | Value::Empty) => Ok(v),
        v => coerce(v, tag),
    }
}

fn io_error(e: std::io::Error) -> RuntimeError {
    RuntimeError::IoError(e.to_string())
}

/// Columns of padding to reach the next print zone.
fn zone_padding(col: usize) -> usize {
    ZONE_WIDTH - (col % ZONE_WIDTH)
}

/// The canonical `PRINT` form: numbers get a sign-or-space prefix and a
/// trailing space; strings print verbatim.
fn format_print_value(value: &Value) -> Result<Vec<u8>, RuntimeError> {
    match value {
        Value::Str(bytes) => Ok(bytes.clone()),
        v if v.is_numeric() => {
            let mut out = Vec::new();
            out.push(if v.is_negative() { b'-' } else { b' ' });
            out.extend_from_slice(v.display_digits()?.as_bytes());
            out.push(b' ');
            Ok(out)
        }
        other => Err(RuntimeError::TypeMismatch(format!(
            "cannot PRINT {}",
            other.type_name()
        ))),
    }
}

/// Split a console input line into comma-separated fields, honoring
/// quoted strings.
fn split_input_line(line: &[u8]) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    let mut pos = 0;
    loop {
        while pos < line.len() && line[pos] == b' ' {
            pos += 1;
        }
        if pos >= line.len() {
            if fields.is_empty() {
                fields.push(Vec::new());
            }
            return fields;
        }
        if line[pos] == b'"' {
            pos += 1;
            let start = pos;
            while pos < line.len() && line[pos] != b'"' {
                pos += 1;
            }
            fields.push(line[start..pos].to_vec());
            if pos < line.len() {
                pos += 1;
            }
        } else {
            let start = pos;
            while pos < line.len() && line[pos] != b',' {
                pos += 1;
            }
            let mut field = line[start..pos].to_vec();
            while field.last() == Some(&b' ') {
                field.pop();
            }
            fields.push(field);
        }
        if pos < line.len() && line[pos] == b',' {
            pos += 1;
        } else {
            return fields;
        }
    }
}

fn parse_input_field(field: &[u8], tag: TyTag) -> Result<Value, RuntimeError> {
    match tag {
        TyTag::Str | TyTag::FixedStr(_) => coerce(Value::Str(field.to_vec()), tag),
        _ => {
            // Unparsable numeric input reads as zero.
            let text = String::from_utf8_lossy(field);
            let number: f64 = text.trim().parse().unwrap_or(0.0);
            coerce(Value::F64(number), tag)
        }
    }
}

/// `VAL`: parse the longest numeric prefix; 0 when there is none.
fn parse_val(bytes: &[u8]) -> f64 {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start();
    let mut end = 0;
    let chars: Vec<char> = trimmed.chars().collect();
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '+' | '-' if i == 0 => {}
            '+' | '-' if i > 0 && matches!(chars[i - 1], 'e' | 'E' | 'd' | 'D') => {}
            '0'..='9' => seen_digit = true,
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'e' | 'E' | 'D' | 'd' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        i += 1;
        if seen_digit {
            end = i;
        }
    }
    let candidate: String = chars[..end]
        .iter()
        .map(|&c| if matches!(c, 'd' | 'D') { 'E' } else { c })
        .collect();
    candidate.parse().unwrap_or(0.0)
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
        qbc_emit::emit(&program, &analysis)
    }

    fn run_with_input(src: &str, input: &[&str]) -> Result<String, VmFailure> {
        let image = compile(src);
        let mut host = ScriptedHost::new(input);
        let mut vm = Vm::new(&image, &mut host);
        vm.run()?;
        Ok(host.output_str())
    }

    fn run_ok(src: &str) -> String {
        run_with_input(src, &[]).expect("program runs")
    }

    fn run_err(src: &str) -> RuntimeError {
        let image = compile(src);
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&image, &mut host);
        vm.run().expect_err("program fails").error
    }

    // --- Scenarios ----------------------------------------------------

    #[test]
    fn test_s1_hello_world() {
        assert_eq!(run_ok("PRINT \"Hello, World!\"\nEND"), "Hello, World!\n");
    }

    #[test]
    fn test_s3_for_loop_with_negative_step() {
        let out = run_ok("FOR i = 10 TO 0 STEP -2\n  PRINT i;\nNEXT i");
        assert_eq!(out, " 10  8  6  4  2  0 ");
    }

    #[test]
    fn test_s4_select_case_range_and_is() {
        let out = run_ok(
            "DIM s AS INTEGER : s = 85\nSELECT CASE s\n  CASE IS >= 90: PRINT \"A\"\n  CASE 80 TO 89: PRINT \"B\"\n  CASE ELSE:     PRINT \"?\"\nEND SELECT",
        );
        assert_eq!(out, "B\n");
    }

    #[test]
    fn test_s5_data_read_restore_to_label() {
        let out = run_ok(
            "READ a,b : PRINT a;b\nRESTORE L2\nREAD a,b : PRINT a;b\nDATA 10,20\nL2: DATA 100,200",
        );
        assert_eq!(out, " 10  20 \n 100  200 \n");
    }

    #[test]
    fn test_s6_gosub_return_ordering() {
        let out = run_ok("PRINT \"A\" : GOSUB S : PRINT \"C\" : END\nS: PRINT \"B\" : RETURN");
        assert_eq!(out, "A\nB\nC\n");
    }

    #[test]
    fn test_s2_style_sieve() {
        let src = r#"
INPUT "Limit"; n
PRINT "Prime numbers up to"; n; ":"
FOR i = 2 TO n
  isPrime = 1
  FOR j = 2 TO i - 1
    IF i MOD j = 0 THEN isPrime = 0
  NEXT j
  IF isPrime = 1 THEN PRINT i;
NEXT i
PRINT
PRINT "Done!"
"#;
        let out = run_with_input(src, &["10"]).unwrap();
        assert!(out.contains("Prime numbers up to 10 :"));
        assert!(out.contains(" 2  3  5  7 "));
        assert!(out.contains("Done!"));
    }

    // --- Boundary behavior --------------------------------------------

    #[test]
    fn test_divide_by_zero() {
        assert_eq!(run_err("x = 1 \\ 0"), RuntimeError::DivideByZero);
        assert_eq!(run_err("x = 1 / 0"), RuntimeError::DivideByZero);
        assert_eq!(run_err("x = 1 MOD 0"), RuntimeError::DivideByZero);
    }

    #[test]
    fn test_bounds_violation_one_past_upper() {
        assert_eq!(run_err("DIM a(10)\na(11) = 1"), RuntimeError::BoundsViolation);
        assert_eq!(run_err("DIM a(10)\nPRINT a(-1)"), RuntimeError::BoundsViolation);
    }

    #[test]
    fn test_return_without_gosub() {
        assert_eq!(run_err("RETURN"), RuntimeError::ReturnWithoutGosub);
    }

    #[test]
    fn test_overflow_on_narrowing() {
        assert_eq!(run_err("a% = 32767\na% = a% + 1"), RuntimeError::Overflow);
    }

    #[test]
    fn test_out_of_data() {
        assert_eq!(run_err("READ a\nREAD b\nDATA 1"), RuntimeError::OutOfData);
    }

    #[test]
    fn test_for_zero_iterations() {
        assert_eq!(run_ok("FOR i = 1 TO 0\nPRINT \"never\"\nNEXT\nPRINT \"after\""), "after\n");
        assert_eq!(
            run_ok("FOR i = 1 TO 10 STEP 0\nPRINT \"never\"\nNEXT\nPRINT \"after\""),
            "after\n"
        );
    }

    #[test]
    fn test_int64_boundary_arithmetic() {
        let out = run_ok("x&& = 9223372036854775807&&\nPRINT x&&");
        assert_eq!(out, " 9223372036854775807 \n");
    }

    // --- Semantics ----------------------------------------------------

    #[test]
    fn test_integer_division_truncates_toward_zero() {
        assert_eq!(run_ok("PRINT -7 \\ 2"), "-3 \n");
        assert_eq!(run_ok("PRINT 7 \\ 2"), " 3 \n");
    }

    #[test]
    fn test_mod_takes_sign_of_dividend() {
        assert_eq!(run_ok("PRINT -7 MOD 3"), "-1 \n");
        assert_eq!(run_ok("PRINT 7 MOD -3"), " 1 \n");
    }

    #[test]
    fn test_relational_yields_minus_one() {
        assert_eq!(run_ok("PRINT 2 > 1"), "-1 \n");
        assert_eq!(run_ok("PRINT 1 > 2"), " 0 \n");
    }

    #[test]
    fn test_eager_and_or_are_bitwise() {
        assert_eq!(run_ok("PRINT 6 AND 3"), " 2 \n");
        assert_eq!(run_ok("PRINT 6 OR 3"), " 7 \n");
        assert_eq!(run_ok("PRINT NOT 0"), "-1 \n");
    }

    #[test]
    fn test_print_zones() {
        let out = run_ok("PRINT \"a\", \"b\"");
        assert_eq!(out, format!("a{}b\n", " ".repeat(13)));
    }

    #[test]
    fn test_print_zone_past_boundary_advances_to_next() {
        // 15 characters reach into the second zone; the comma advances
        // to column 28.
        let out = run_ok("PRINT \"123456789012345\", \"x\"");
        assert_eq!(out, format!("123456789012345{}x\n", " ".repeat(13)));
    }

    #[test]
    fn test_while_and_do_loops() {
        assert_eq!(run_ok("x = 0\nWHILE x < 3\nx = x + 1\nWEND\nPRINT x"), " 3 \n");
        assert_eq!(run_ok("x = 0\nDO\nx = x + 1\nLOOP UNTIL x >= 3\nPRINT x"), " 3 \n");
        assert_eq!(run_ok("x = 5\nDO WHILE x < 3\nx = x + 1\nLOOP\nPRINT x"), " 5 \n");
    }

    #[test]
    fn test_exit_for_and_do() {
        assert_eq!(
            run_ok("FOR i = 1 TO 10\nIF i = 3 THEN EXIT FOR\nNEXT\nPRINT i"),
            " 3 \n"
        );
    }

    #[test]
    fn test_procedures_by_ref_and_by_val() {
        let out = run_ok(
            "SUB Bump (n%)\nn% = n% + 1\nEND SUB\nSUB Keep (BYVAL n%)\nn% = n% + 1\nEND SUB\nx% = 1\nBump x%\nKeep x%\nPRINT x%",
        );
        assert_eq!(out, " 2 \n");
    }

    #[test]
    fn test_function_returns_value() {
        let out = run_ok("FUNCTION Add% (a%, b%)\nAdd% = a% + b%\nEND FUNCTION\nPRINT Add%(20, 22)");
        assert_eq!(out, " 42 \n");
    }

    #[test]
    fn test_recursive_function() {
        let out = run_ok(
            "FUNCTION Fact& (n%)\nIF n% <= 1 THEN\nFact& = 1\nELSE\nFact& = Fact&(n% - 1) * n%\nEND IF\nEND FUNCTION\nPRINT Fact&(10)",
        );
        assert_eq!(out, " 3628800 \n");
    }

    #[test]
    fn test_records_copy_on_assignment() {
        let out = run_ok(
            "TYPE Point\n x AS INTEGER\n y AS INTEGER\nEND TYPE\nDIM a AS Point\nDIM b AS Point\na.x = 1\nb = a\nb.x = 2\nPRINT a.x; b.x",
        );
        assert_eq!(out, " 1  2 \n");
    }

    #[test]
    fn test_string_value_semantics() {
        let out = run_ok("a$ = \"one\"\nb$ = a$\nb$ = \"two\"\nPRINT a$; b$");
        assert_eq!(out, "onetwo\n");
    }

    #[test]
    fn test_fixed_string_padding() {
        let out = run_ok("DIM s AS STRING * 4\ns = \"ab\"\nPRINT LEN(s)");
        assert_eq!(out, " 4 \n");
    }

    #[test]
    fn test_arrays_are_shared_into_procs() {
        let out = run_ok(
            "SUB Fill (a%())\na%(1) = 99\nEND SUB\nDIM v%(5)\nFill v%()\nPRINT v%(1)",
        );
        assert_eq!(out, " 99 \n");
    }

    #[test]
    fn test_intrinsics() {
        assert_eq!(run_ok("PRINT CHR$(65)"), "A\n");
        assert_eq!(run_ok("PRINT ASC(\"A\")"), " 65 \n");
        assert_eq!(run_ok("PRINT LEN(\"hello\")"), " 5 \n");
        assert_eq!(run_ok("PRINT LEFT$(\"hello\", 2)"), "he\n");
        assert_eq!(run_ok("PRINT RIGHT$(\"hello\", 2)"), "lo\n");
        assert_eq!(run_ok("PRINT MID$(\"hello\", 2, 3)"), "ell\n");
        assert_eq!(run_ok("PRINT INSTR(\"hello\", \"ll\")"), " 3 \n");
        assert_eq!(run_ok("PRINT UCASE$(\"MiXeD\")"), "MIXED\n");
        assert_eq!(run_ok("PRINT STR$(5)"), " 5\n");
        assert_eq!(run_ok("PRINT VAL(\"12.5abc\")"), " 12.5 \n");
        assert_eq!(run_ok("PRINT ABS(-3)"), " 3 \n");
        assert_eq!(run_ok("PRINT SGN(-9)"), "-1 \n");
        assert_eq!(run_ok("PRINT INT(-2.5)"), "-3 \n");
        assert_eq!(run_ok("PRINT FIX(-2.5)"), "-2 \n");
    }

    #[test]
    fn test_rnd_deterministic_per_seed() {
        let a = run_ok("RANDOMIZE 7\nFOR i = 1 TO 3\nPRINT RND\nNEXT");
        let b = run_ok("RANDOMIZE 7\nFOR i = 1 TO 3\nPRINT RND\nNEXT");
        assert_eq!(a, b);
        let c = run_ok("RANDOMIZE 8\nFOR i = 1 TO 3\nPRINT RND\nNEXT");
        assert_ne!(a, c);
    }

    #[test]
    fn test_input_parses_fields() {
        let out = run_with_input("INPUT a, b$\nPRINT a; b$", &["42, hello"]).unwrap();
        assert_eq!(out, "?  42 hello\n");
    }

    #[test]
    fn test_line_input_takes_whole_line() {
        let out = run_with_input("LINE INPUT s$\nPRINT s$", &["a, b, c"]).unwrap();
        assert_eq!(out, "a, b, c\n");
    }

    #[test]
    fn test_file_write_then_read() {
        let src = r#"
OPEN "out.txt" FOR OUTPUT AS #1
PRINT #1, "hello"
PRINT #1, 42
CLOSE #1
OPEN "out.txt" FOR INPUT AS #1
LINE INPUT #1, a$
INPUT #1, n
CLOSE #1
PRINT a$; n
"#;
        let out = run_with_input(src, &[]).unwrap();
        assert_eq!(out, "hello 42 \n");
    }

    #[test]
    fn test_eof_intrinsic() {
        let src = r#"
OPEN "d.txt" FOR OUTPUT AS #1
PRINT #1, 1
PRINT #1, 2
CLOSE #1
OPEN "d.txt" FOR INPUT AS #1
total = 0
DO WHILE EOF(1) = 0
  INPUT #1, v
  total = total + v
LOOP
CLOSE #1
PRINT total
"#;
        assert_eq!(run_with_input(src, &[]).unwrap(), " 3 \n");
    }

    #[test]
    fn test_bad_channel() {
        assert_eq!(run_err("PRINT #3, \"x\""), RuntimeError::BadChannel);
    }

    #[test]
    fn test_channel_reuse_rejected() {
        let src = "OPEN \"a.txt\" FOR OUTPUT AS #1\nOPEN \"b.txt\" FOR OUTPUT AS #1";
        assert_eq!(run_err(src), RuntimeError::BadChannel);
    }

    #[test]
    fn test_goto_and_labels() {
        let out = run_ok("GOTO Skip\nPRINT \"no\"\nSkip:\nPRINT \"yes\"");
        assert_eq!(out, "yes\n");
    }

    #[test]
    fn test_line_number_labels() {
        let out = run_ok("GOTO 100\nPRINT \"no\"\n100 PRINT \"yes\"");
        assert_eq!(out, "yes\n");
    }

    #[test]
    fn test_swap() {
        let out = run_ok("a% = 1\nb% = 2\nSWAP a%, b%\nPRINT a%; b%");
        assert_eq!(out, " 2  1 \n");
    }

    #[test]
    fn test_cancellation() {
        let image = compile("Loop1:\nGOTO Loop1");
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&image, &mut host);
        vm.cancel_token().cancel();
        let err = vm.run().unwrap_err();
        assert_eq!(err.error, RuntimeError::Interrupted);
    }

    #[test]
    fn test_shared_cancel_token_resets_for_reuse() {
        let image = compile("PRINT 1");
        let token = CancelToken::new();
        token.cancel();

        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&image, &mut host).with_cancel_token(token.clone());
        let err = vm.run().unwrap_err();
        assert_eq!(err.error, RuntimeError::Interrupted);

        // After a reset the same token drives a clean second run.
        token.reset();
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&image, &mut host).with_cancel_token(token.clone());
        vm.run().unwrap();
        assert_eq!(host.output_str(), " 1 \n");
    }

    #[test]
    fn test_sleep_without_hal_fails() {
        assert_eq!(run_err("SLEEP 1"), RuntimeError::FeatureUnavailable);
    }

    #[test]
    fn test_cls_and_beep_are_noops_without_hal() {
        assert_eq!(run_ok("CLS\nBEEP\nPRINT \"ok\""), "ok\n");
    }

    #[test]
    fn test_determinism_full_transcript() {
        let src = "RANDOMIZE 3\nFOR i = 1 TO 5\nPRINT RND; i\nNEXT\nINPUT x\nPRINT x * 2";
        let a = run_with_input(src, &["21"]).unwrap();
        let b = run_with_input(src, &["21"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_repl_state_survives_recompilation() {
        // Simulates the REPL: run a prefix, keep the state, extend the
        // module, run only the new statement.
        let image1 = compile("x% = 41");
        let mut host = ScriptedHost::new(&[]);
        let mut vm = Vm::new(&image1, &mut host);
        vm.run().unwrap();
        let state = vm.take_state();

        let src2 = "x% = 41\nPRINT x% + 1";
        let image2 = compile(src2);
        let mut host2 = ScriptedHost::new(&[]);
        let mut vm2 = Vm::new(&image2, &mut host2);
        vm2.restore_state(state);
        vm2.run_from(image2.stmt_pcs[1]).unwrap();
        assert_eq!(host2.output_str(), " 42 \n");
    }

    #[test]
    fn test_pow_computed_in_double() {
        assert_eq!(run_ok("PRINT 2 ^ 10"), " 1024 \n");
        assert_eq!(run_ok("PRINT 2 ^ 0.5"), format!(" {} \n", (2f64).sqrt()));
    }

    #[test]
    fn test_implicit_coercion_on_assignment_rounds_ties_even() {
        assert_eq!(run_ok("a% = 2.5\nPRINT a%"), " 2 \n");
        assert_eq!(run_ok("a% = 3.5\nPRINT a%"), " 4 \n");
    }

    #[test]
    fn test_restore_without_label_resets() {
        let out = run_ok("READ a\nRESTORE\nREAD b\nPRINT a; b\nDATA 7");
        assert_eq!(out, " 7  7 \n");
    }
}
