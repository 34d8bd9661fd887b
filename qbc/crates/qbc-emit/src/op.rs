//! The bytecode instruction set.
//!
//! A compact stack machine. Every instruction has a fixed operand shape;
//! jump targets are absolute instruction indices patched in by the
//! emitter's fix-up pass. Monomorphic arithmetic carries its numeric
//! kind so the dispatch loop never guesses; the only tagged dispatch
//! left at runtime is inside `COERCE` and the intrinsics.

use qbc_sem::Intrinsic;

/// Numeric kind selector for monomorphic arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NumKind {
    I16 = 0,
    I32 = 1,
    I64 = 2,
    U32 = 3,
    F32 = 4,
    F64 = 5,
}

/// Compact value-type tag used by coercions, slot layouts and typed
/// reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TyTag {
    I16,
    I32,
    I64,
    U32,
    F32,
    F64,
    Str,
    /// Fixed-length string; stores pad or truncate to the length.
    FixedStr(u16),
    /// Record type by index into the image's record table.
    Record(u16),
}

impl TyTag {
    pub fn num_kind(self) -> Option<NumKind> {
        Some(match self {
            TyTag::I16 => NumKind::I16,
            TyTag::I32 => NumKind::I32,
            TyTag::I64 => NumKind::I64,
            TyTag::U32 => NumKind::U32,
            TyTag::F32 => NumKind::F32,
            TyTag::F64 => NumKind::F64,
            _ => return None,
        })
    }
}

/// Comparison operator for `Cmp`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CmpOp {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
}

/// Operand kind for `Cmp`: a numeric kind or byte strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpKind {
    Num(NumKind),
    Str,
}

/// Storage slot reference: module global or current-frame local.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRef {
    Global(u16),
    Local(u16),
}

/// Console print actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PrintKind {
    /// Pop and print one value with canonical numeric spacing.
    Value = 0,
    /// Advance to the next 14-column print zone.
    Zone = 1,
}

/// File-channel operations; the channel number is popped from the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOp {
    /// Pop value, then channel; write the item.
    PrintValue,
    /// Pop channel; advance that channel's print zone.
    PrintZone,
    /// Pop channel; terminate the line.
    PrintEol,
    /// Pop channel; push the next comma-separated field, coerced.
    InputItem(TyTag),
    /// Pop channel; push the rest of the current line as a string.
    LineInput,
    /// Pop channel; push -1 if at end of file, else 0.
    Eof,
}

/// `OPEN` modes, matching the source-level keywords.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenMode {
    Input = 0,
    Output = 1,
    Append = 2,
    Binary = 3,
    Random = 4,
}

/// Host-abstraction operations that are no-ops or unavailable without a
/// HAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HalOp {
    Cls = 0,
    Beep = 1,
    /// Pops a duration in seconds.
    Sleep = 2,
}

/// One bytecode instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    // --- Stack ---
    PushConst(u32),
    Pop,
    Dup,
    Swap,

    // --- Locals / globals ---
    LoadLocal(u16),
    StoreLocal(u16),
    LoadGlobal(u16),
    StoreGlobal(u16),
    /// Push a reference to a slot (by-reference argument passing).
    RefLocal(u16),
    RefGlobal(u16),

    // --- Records / arrays ---
    /// Pop record, push a copy of field `n`.
    FieldGet(u16),
    /// Pop value, pop record, push the record with field `n` replaced.
    FieldSet(u16),
    /// Pop `dims` indices and an array ref, push the element.
    IndexGet(u8),
    /// Pop `dims` indices, a value and an array ref; store the element.
    IndexSet(u8),
    /// Verify `dims` indices on top of an array ref without popping.
    BoundCheck(u8),
    /// Pop `2 * dims` bounds (lower, upper per dimension), allocate an
    /// array of `elem` and store its ref in the slot.
    NewArray { slot: SlotRef, dims: u8, elem: TyTag },
    /// Push a reference to one array element (pops indices + array ref).
    RefIndex(u8),

    // --- Arithmetic / logic ---
    Add(NumKind),
    Sub(NumKind),
    Mul(NumKind),
    Div(NumKind),
    IntDiv(NumKind),
    Mod(NumKind),
    /// Computed in DOUBLE regardless of operand kinds.
    Pow,
    Neg(NumKind),
    Cmp(CmpOp, CmpKind),
    And(NumKind),
    Or(NumKind),
    Not(NumKind),
    Concat,
    Coerce(TyTag, TyTag),

    // --- Control ---
    Jmp(u32),
    JmpIfFalse(u32),
    JmpIfTrue(u32),
    /// Pop step, end and start; store start in the counter slot, push a
    /// loop frame, and jump to `exit` when zero iterations remain.
    ForInit { slot: SlotRef, exit: u32 },
    /// Advance the innermost loop frame; jump to `body` to continue.
    ForStep { body: u32 },
    /// Pop the loop frame.
    ForEnd,
    Gosub(u32),
    RetSub,
    /// `RETURN label`: discard the return address and jump.
    RetSubTo(u32),
    /// Call procedure `proc` with `argc` arguments on the stack.
    CallProc { proc: u16, argc: u8 },
    Ret,

    // --- I/O and intrinsics ---
    PrintItem(PrintKind),
    PrintEol,
    /// Push one console-input field, coerced to the tag.
    InputItem(TyTag),
    /// Push a whole console line as a string.
    LineInput,
    /// Show an INPUT prompt: pop the prompt string; the flag says
    /// whether to append `? `.
    InputPrompt { question: bool },
    /// Pop channel, pop path; open the file in `mode`.
    Open(OpenMode),
    /// Pop a channel number and close it.
    Close,
    /// Close every open channel.
    CloseAll,
    FileIo(FileOp),
    /// Push the next DATA item coerced to the tag.
    ReadData(TyTag),
    /// Reset the DATA cursor to a fixed index.
    RestoreData(u32),
    Rnd,
    /// Pop a DOUBLE seed and reseed the generator.
    Randomize,
    /// Push seconds since midnight as SINGLE.
    Timer,
    Intrinsic { id: u16, argc: u8 },
    Hal(HalOp),

    // --- Terminal ---
    Halt,
}

impl Op {
    /// Net operand-stack delta of the instruction (pushes minus pops).
    ///
    /// `CallProc` and `Ret` are cross-frame and handled by the caller of
    /// this function; within a frame, `CallProc` nets `1 - argc` for
    /// functions and `-argc` for subs, which the emitter accounts for
    /// when verifying statement-level stack discipline.
    pub fn stack_delta(self, call_pushes_value: impl Fn(u16) -> bool) -> i32 {
        match self {
            Op::PushConst(_) => 1,
            Op::Pop => -1,
            Op::Dup => 1,
            Op::Swap => 0,
            Op::LoadLocal(_) | Op::LoadGlobal(_) | Op::RefLocal(_) | Op::RefGlobal(_) => 1,
            Op::StoreLocal(_) | Op::StoreGlobal(_) => -1,
            Op::FieldGet(_) => 0,
            Op::FieldSet(_) => -1,
            Op::IndexGet(dims) => -(dims as i32),
            Op::IndexSet(dims) => -(dims as i32) - 2,
            Op::BoundCheck(_) => 0,
            Op::NewArray { dims, .. } => -2 * dims as i32,
            Op::RefIndex(dims) => -(dims as i32),
            Op::Add(_)
            | Op::Sub(_)
            | Op::Mul(_)
            | Op::Div(_)
            | Op::IntDiv(_)
            | Op::Mod(_)
            | Op::Pow
            | Op::Cmp(..)
            | Op::And(_)
            | Op::Or(_)
            | Op::Concat => -1,
            Op::Neg(_) | Op::Not(_) | Op::Coerce(..) => 0,
            Op::Jmp(_) | Op::ForEnd | Op::Gosub(_) | Op::RetSub | Op::RetSubTo(_) => 0,
            Op::JmpIfFalse(_) | Op::JmpIfTrue(_) => -1,
            Op::ForInit { .. } => -3,
            Op::ForStep { .. } => 0,
            Op::CallProc { proc, argc } => {
                let ret = if call_pushes_value(proc) { 1 } else { 0 };
                ret - argc as i32
            }
            Op::Ret => 0,
            Op::PrintItem(PrintKind::Value) => -1,
            Op::PrintItem(PrintKind::Zone) => 0,
            Op::PrintEol => 0,
            Op::InputItem(_) | Op::LineInput => 1,
            Op::InputPrompt { .. } => -1,
            Op::Open(_) => -2,
            Op::Close => -1,
            Op::CloseAll => 0,
            Op::FileIo(op) => match op {
                FileOp::PrintValue => -2,
                FileOp::PrintZone | FileOp::PrintEol => -1,
                FileOp::InputItem(_) | FileOp::LineInput | FileOp::Eof => 0,
            },
            Op::ReadData(_) => 1,
            Op::RestoreData(_) => 0,
            Op::Rnd | Op::Timer => 1,
            Op::Randomize => -1,
            Op::Intrinsic { argc, .. } => 1 - argc as i32,
            Op::Hal(HalOp::Sleep) => -1,
            Op::Hal(_) => 0,
            Op::Halt => 0,
        }
    }

    /// The jump target carried by this instruction, if any.
    pub fn jump_target(self) -> Option<u32> {
        match self {
            Op::Jmp(t)
            | Op::JmpIfFalse(t)
            | Op::JmpIfTrue(t)
            | Op::Gosub(t)
            | Op::RetSubTo(t)
            | Op::ForStep { body: t }
            | Op::ForInit { exit: t, .. } => Some(t),
            _ => None,
        }
    }
}

/// Map a semantic type to its compact tag.
pub fn ty_tag(ty: qbc_sem::Ty) -> TyTag {
    match ty {
        qbc_sem::Ty::Int16 => TyTag::I16,
        qbc_sem::Ty::Int32 => TyTag::I32,
        qbc_sem::Ty::Int64 => TyTag::I64,
        qbc_sem::Ty::UInt32 => TyTag::U32,
        qbc_sem::Ty::Single => TyTag::F32,
        qbc_sem::Ty::Double => TyTag::F64,
        qbc_sem::Ty::String => TyTag::Str,
        qbc_sem::Ty::FixedString(n) => TyTag::FixedStr(n),
        qbc_sem::Ty::Record(id) => TyTag::Record(id.0 as u16),
    }
}

/// The intrinsic id an [`Op::Intrinsic`] dispatches on.
pub fn intrinsic_id(i: Intrinsic) -> u16 {
    i.id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_deltas_balance_simple_sequences() {
        // x = 1 + 2  →  push, push, add, store: net 0.
        let seq = [
            Op::PushConst(0),
            Op::PushConst(1),
            Op::Add(NumKind::I16),
            Op::StoreGlobal(0),
        ];
        let delta: i32 = seq.iter().map(|op| op.stack_delta(|_| false)).sum();
        assert_eq!(delta, 0);
    }

    #[test]
    fn test_index_set_sequence_is_balanced() {
        // a(i) = v  →  load arr, push v, push i, index_set: net 0.
        let seq = [
            Op::LoadGlobal(0),
            Op::PushConst(0),
            Op::PushConst(1),
            Op::IndexSet(1),
        ];
        let delta: i32 = seq.iter().map(|op| op.stack_delta(|_| false)).sum();
        assert_eq!(delta, 0);
    }

    #[test]
    fn test_for_frame_sequence_is_balanced() {
        let seq = [
            Op::PushConst(0),
            Op::PushConst(1),
            Op::PushConst(2),
            Op::ForInit { slot: SlotRef::Global(0), exit: 5 },
            Op::ForStep { body: 4 },
            Op::ForEnd,
        ];
        let delta: i32 = seq.iter().map(|op| op.stack_delta(|_| false)).sum();
        assert_eq!(delta, 0);
    }

    #[test]
    fn test_call_delta_depends_on_proc_kind() {
        let call = Op::CallProc { proc: 0, argc: 2 };
        assert_eq!(call.stack_delta(|_| true), -1);
        assert_eq!(call.stack_delta(|_| false), -2);
    }

    #[test]
    fn test_jump_targets() {
        assert_eq!(Op::Jmp(7).jump_target(), Some(7));
        assert_eq!(Op::ForInit { slot: SlotRef::Local(0), exit: 9 }.jump_target(), Some(9));
        assert_eq!(Op::Halt.jump_target(), None);
    }
}
