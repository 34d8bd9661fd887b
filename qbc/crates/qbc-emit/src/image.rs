//! The bytecode image: in-memory tables and the on-disk binary format.
//!
//! A single little-endian blob:
//!
//! ```text
//! magic "QBCI" | version u16 | flags u16
//! section: constant pool
//! section: record-type table
//! section: procedure table (module frame first, then procedures)
//! section: DATA pool
//! section: instruction stream
//! section: source map (present when flag bit 2 is set; also carries
//!          the label table and top-level statement boundaries)
//! ```
//!
//! Every section is prefixed with its byte length (`u32`), so readers
//! can skip sections they do not understand within a version. A reader
//! seeing an unknown version refuses with [`ImageError::UnsupportedImage`].
//!
//! Flags: bit 0, `$CONSOLE` was present; bit 1, RNG mixing function
//! v1 (see the VM's `rng` module), set so a given seed reproduces the
//! same `RND` sequence across builds; bit 2, source map present.

use thiserror::Error;

use crate::op::{CmpKind, CmpOp, FileOp, HalOp, NumKind, Op, OpenMode, PrintKind, SlotRef, TyTag};

pub const MAGIC: [u8; 4] = *b"QBCI";
pub const VERSION: u16 = 1;

pub const FLAG_CONSOLE: u16 = 1 << 0;
pub const FLAG_RNG_V1: u16 = 1 << 1;
pub const FLAG_SOURCE_MAP: u16 = 1 << 2;

/// Errors reading an image blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("not a bytecode image (bad magic)")]
    BadMagic,
    #[error("unsupported image version {0}")]
    UnsupportedImage(u16),
    #[error("truncated image")]
    Truncated,
    #[error("corrupt image: {0}")]
    Corrupt(&'static str),
}

/// A pooled literal. Doubles as the `DATA` pool entry type.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstEntry {
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Vec<u8>),
}

/// Record type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordEntry {
    pub name: String,
    pub fields: Vec<(String, TyTag)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamEntry {
    pub by_val: bool,
    pub is_array: bool,
    pub tag: TyTag,
}

/// Procedure descriptor: entry pc plus the frame layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcEntry {
    pub name: String,
    pub entry_pc: u32,
    pub is_function: bool,
    pub params: Vec<ParamEntry>,
    /// Every local slot's type, parameters (and return slot) included.
    pub locals: Vec<TyTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub pc: u32,
    pub file: u32,
    pub start: u32,
    pub end: u32,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelEntry {
    pub name: String,
    pub pc: u32,
}

/// A compiled module, ready to run or to serialize.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    pub flags: u16,
    pub consts: Vec<ConstEntry>,
    pub records: Vec<RecordEntry>,
    /// Module global slot layout.
    pub globals: Vec<TyTag>,
    pub procs: Vec<ProcEntry>,
    pub data: Vec<ConstEntry>,
    pub code: Vec<Op>,
    pub source_map: Vec<SourceMapEntry>,
    pub labels: Vec<LabelEntry>,
    /// Instruction index of each top-level statement, in order.
    pub stmt_pcs: Vec<u32>,
}

impl Image {
    /// The source span active at `pc`, from the (sorted) source map.
    pub fn span_at(&self, pc: u32) -> Option<SourceMapEntry> {
        if self.source_map.is_empty() {
            return None;
        }
        let idx = match self.source_map.binary_search_by_key(&pc, |e| e.pc) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(self.source_map[idx])
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn f32(&mut self, v: f32) {
        self.u32(v.to_bits());
    }
    fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }
    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }
    fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }
    fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    fn tag(&mut self, t: TyTag) {
        match t {
            TyTag::I16 => self.u8(0),
            TyTag::I32 => self.u8(1),
            TyTag::I64 => self.u8(2),
            TyTag::U32 => self.u8(3),
            TyTag::F32 => self.u8(4),
            TyTag::F64 => self.u8(5),
            TyTag::Str => self.u8(6),
            TyTag::FixedStr(n) => {
                self.u8(7);
                self.u16(n);
            }
            TyTag::Record(id) => {
                self.u8(8);
                self.u16(id);
            }
        }
    }

    fn const_entry(&mut self, c: &ConstEntry) {
        match c {
            ConstEntry::I16(v) => {
                self.u8(0);
                self.i16(*v);
            }
            ConstEntry::I32(v) => {
                self.u8(1);
                self.i32(*v);
            }
            ConstEntry::I64(v) => {
                self.u8(2);
                self.i64(*v);
            }
            ConstEntry::F32(v) => {
                self.u8(3);
                self.f32(*v);
            }
            ConstEntry::F64(v) => {
                self.u8(4);
                self.f64(*v);
            }
            ConstEntry::Str(v) => {
                self.u8(5);
                self.bytes(v);
            }
        }
    }
}

/// Serialize an image to its binary form.
pub fn write_image(image: &Image) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    let has_map = !image.source_map.is_empty() || !image.labels.is_empty();
    let flags = if has_map {
        image.flags | FLAG_SOURCE_MAP
    } else {
        image.flags & !FLAG_SOURCE_MAP
    };
    out.extend_from_slice(&flags.to_le_bytes());

    let mut section = |body: &[u8], out: &mut Vec<u8>| {
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
    };

    // Constant pool.
    let mut w = Writer::new();
    w.u32(image.consts.len() as u32);
    for c in &image.consts {
        w.const_entry(c);
    }
    section(&w.buf, &mut out);

    // Record-type table.
    let mut w = Writer::new();
    w.u32(image.records.len() as u32);
    for rec in &image.records {
        w.string(&rec.name);
        w.u32(rec.fields.len() as u32);
        for (name, tag) in &rec.fields {
            w.string(name);
            w.tag(*tag);
        }
    }
    section(&w.buf, &mut out);

    // Procedure table; the module frame (global slots) comes first.
    let mut w = Writer::new();
    w.u32(image.globals.len() as u32);
    for tag in &image.globals {
        w.tag(*tag);
    }
    w.u32(image.procs.len() as u32);
    for proc in &image.procs {
        w.string(&proc.name);
        w.u32(proc.entry_pc);
        w.bool(proc.is_function);
        w.u32(proc.params.len() as u32);
        for param in &proc.params {
            w.bool(param.by_val);
            w.bool(param.is_array);
            w.tag(param.tag);
        }
        w.u32(proc.locals.len() as u32);
        for tag in &proc.locals {
            w.tag(*tag);
        }
    }
    section(&w.buf, &mut out);

    // DATA pool.
    let mut w = Writer::new();
    w.u32(image.data.len() as u32);
    for item in &image.data {
        w.const_entry(item);
    }
    section(&w.buf, &mut out);

    // Instruction stream.
    let mut w = Writer::new();
    w.u32(image.code.len() as u32);
    for op in &image.code {
        encode_op(*op, &mut w);
    }
    section(&w.buf, &mut out);

    // Source map (optional).
    if has_map {
        let mut w = Writer::new();
        w.u32(image.source_map.len() as u32);
        for e in &image.source_map {
            w.u32(e.pc);
            w.u32(e.file);
            w.u32(e.start);
            w.u32(e.end);
            w.u32(e.line);
            w.u32(e.column);
        }
        w.u32(image.labels.len() as u32);
        for l in &image.labels {
            w.string(&l.name);
            w.u32(l.pc);
        }
        w.u32(image.stmt_pcs.len() as u32);
        for pc in &image.stmt_pcs {
            w.u32(*pc);
        }
        section(&w.buf, &mut out);
    }

    out
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ImageError> {
        if self.pos + n > self.buf.len() {
            return Err(ImageError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ImageError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, ImageError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32, ImageError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn u64(&mut self) -> Result<u64, ImageError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn i16(&mut self) -> Result<i16, ImageError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32, ImageError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64, ImageError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
    fn f32(&mut self) -> Result<f32, ImageError> {
        Ok(f32::from_bits(self.u32()?))
    }
    fn f64(&mut self) -> Result<f64, ImageError> {
        Ok(f64::from_bits(self.u64()?))
    }
    fn bytes(&mut self) -> Result<Vec<u8>, ImageError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn string(&mut self) -> Result<String, ImageError> {
        String::from_utf8(self.bytes()?).map_err(|_| ImageError::Corrupt("bad utf-8 in name"))
    }
    fn bool(&mut self) -> Result<bool, ImageError> {
        Ok(self.u8()? != 0)
    }

    fn tag(&mut self) -> Result<TyTag, ImageError> {
        Ok(match self.u8()? {
            0 => TyTag::I16,
            1 => TyTag::I32,
            2 => TyTag::I64,
            3 => TyTag::U32,
            4 => TyTag::F32,
            5 => TyTag::F64,
            6 => TyTag::Str,
            7 => TyTag::FixedStr(self.u16()?),
            8 => TyTag::Record(self.u16()?),
            _ => return Err(ImageError::Corrupt("bad type tag")),
        })
    }

    fn const_entry(&mut self) -> Result<ConstEntry, ImageError> {
        Ok(match self.u8()? {
            0 => ConstEntry::I16(self.i16()?),
            1 => ConstEntry::I32(self.i32()?),
            2 => ConstEntry::I64(self.i64()?),
            3 => ConstEntry::F32(self.f32()?),
            4 => ConstEntry::F64(self.f64()?),
            5 => ConstEntry::Str(self.bytes()?),
            _ => return Err(ImageError::Corrupt("bad constant tag")),
        })
    }
}

/// Deserialize an image. Refuses unknown versions.
pub fn read_image(bytes: &[u8]) -> Result<Image, ImageError> {
    let mut r = Reader::new(bytes);
    if r.take(4)? != MAGIC {
        return Err(ImageError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(ImageError::UnsupportedImage(version));
    }
    let flags = r.u16()?;

    let mut image = Image {
        flags,
        ..Image::default()
    };

    // Constant pool.
    let _len = r.u32()?;
    let count = r.u32()?;
    for _ in 0..count {
        let entry = r.const_entry()?;
        image.consts.push(entry);
    }

    // Record-type table.
    let _len = r.u32()?;
    let count = r.u32()?;
    for _ in 0..count {
        let name = r.string()?;
        let field_count = r.u32()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let fname = r.string()?;
            let tag = r.tag()?;
            fields.push((fname, tag));
        }
        image.records.push(RecordEntry { name, fields });
    }

    // Procedure table.
    let _len = r.u32()?;
    let global_count = r.u32()?;
    for _ in 0..global_count {
        let tag = r.tag()?;
        image.globals.push(tag);
    }
    let count = r.u32()?;
    for _ in 0..count {
        let name = r.string()?;
        let entry_pc = r.u32()?;
        let is_function = r.bool()?;
        let param_count = r.u32()?;
        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            let by_val = r.bool()?;
            let is_array = r.bool()?;
            let tag = r.tag()?;
            params.push(ParamEntry { by_val, is_array, tag });
        }
        let local_count = r.u32()?;
        let mut locals = Vec::with_capacity(local_count as usize);
        for _ in 0..local_count {
            locals.push(r.tag()?);
        }
        image.procs.push(ProcEntry {
            name,
            entry_pc,
            is_function,
            params,
            locals,
        });
    }

    // DATA pool.
    let _len = r.u32()?;
    let count = r.u32()?;
    for _ in 0..count {
        let entry = r.const_entry()?;
        image.data.push(entry);
    }

    // Instruction stream.
    let _len = r.u32()?;
    let count = r.u32()?;
    for _ in 0..count {
        let op = decode_op(&mut r)?;
        image.code.push(op);
    }

    // Source map, when flagged.
    if flags & FLAG_SOURCE_MAP != 0 {
        let _len = r.u32()?;
        let count = r.u32()?;
        for _ in 0..count {
            image.source_map.push(SourceMapEntry {
                pc: r.u32()?,
                file: r.u32()?,
                start: r.u32()?,
                end: r.u32()?,
                line: r.u32()?,
                column: r.u32()?,
            });
        }
        let count = r.u32()?;
        for _ in 0..count {
            let name = r.string()?;
            let pc = r.u32()?;
            image.labels.push(LabelEntry { name, pc });
        }
        let count = r.u32()?;
        for _ in 0..count {
            image.stmt_pcs.push(r.u32()?);
        }
    }

    Ok(image)
}

// ---------------------------------------------------------------------------
// Instruction encoding
// ---------------------------------------------------------------------------

fn num_kind_byte(k: NumKind) -> u8 {
    k as u8
}

fn num_kind_from(b: u8) -> Result<NumKind, ImageError> {
    Ok(match b {
        0 => NumKind::I16,
        1 => NumKind::I32,
        2 => NumKind::I64,
        3 => NumKind::U32,
        4 => NumKind::F32,
        5 => NumKind::F64,
        _ => return Err(ImageError::Corrupt("bad numeric kind")),
    })
}

fn encode_op(op: Op, w: &mut Writer) {
    match op {
        Op::PushConst(k) => {
            w.u8(0x00);
            w.u32(k);
        }
        Op::Pop => w.u8(0x01),
        Op::Dup => w.u8(0x02),
        Op::Swap => w.u8(0x03),
        Op::LoadLocal(s) => {
            w.u8(0x04);
            w.u16(s);
        }
        Op::StoreLocal(s) => {
            w.u8(0x05);
            w.u16(s);
        }
        Op::LoadGlobal(s) => {
            w.u8(0x06);
            w.u16(s);
        }
        Op::StoreGlobal(s) => {
            w.u8(0x07);
            w.u16(s);
        }
        Op::RefLocal(s) => {
            w.u8(0x08);
            w.u16(s);
        }
        Op::RefGlobal(s) => {
            w.u8(0x09);
            w.u16(s);
        }
        Op::FieldGet(i) => {
            w.u8(0x0A);
            w.u16(i);
        }
        Op::FieldSet(i) => {
            w.u8(0x0B);
            w.u16(i);
        }
        Op::IndexGet(d) => {
            w.u8(0x0C);
            w.u8(d);
        }
        Op::IndexSet(d) => {
            w.u8(0x0D);
            w.u8(d);
        }
        Op::BoundCheck(d) => {
            w.u8(0x0E);
            w.u8(d);
        }
        Op::NewArray { slot, dims, elem } => {
            w.u8(0x0F);
            match slot {
                SlotRef::Global(s) => {
                    w.u8(0);
                    w.u16(s);
                }
                SlotRef::Local(s) => {
                    w.u8(1);
                    w.u16(s);
                }
            }
            w.u8(dims);
            w.tag(elem);
        }
        Op::RefIndex(d) => {
            w.u8(0x10);
            w.u8(d);
        }
        Op::Add(k) => {
            w.u8(0x11);
            w.u8(num_kind_byte(k));
        }
        Op::Sub(k) => {
            w.u8(0x12);
            w.u8(num_kind_byte(k));
        }
        Op::Mul(k) => {
            w.u8(0x13);
            w.u8(num_kind_byte(k));
        }
        Op::Div(k) => {
            w.u8(0x14);
            w.u8(num_kind_byte(k));
        }
        Op::IntDiv(k) => {
            w.u8(0x15);
            w.u8(num_kind_byte(k));
        }
        Op::Mod(k) => {
            w.u8(0x16);
            w.u8(num_kind_byte(k));
        }
        Op::Pow => w.u8(0x17),
        Op::Neg(k) => {
            w.u8(0x18);
            w.u8(num_kind_byte(k));
        }
        Op::Cmp(op, kind) => {
            w.u8(0x19);
            w.u8(op as u8);
            match kind {
                CmpKind::Num(k) => {
                    w.u8(0);
                    w.u8(num_kind_byte(k));
                }
                CmpKind::Str => w.u8(1),
            }
        }
        Op::And(k) => {
            w.u8(0x1A);
            w.u8(num_kind_byte(k));
        }
        Op::Or(k) => {
            w.u8(0x1B);
            w.u8(num_kind_byte(k));
        }
        Op::Not(k) => {
            w.u8(0x1C);
            w.u8(num_kind_byte(k));
        }
        Op::Concat => w.u8(0x1D),
        Op::Coerce(from, to) => {
            w.u8(0x1E);
            w.tag(from);
            w.tag(to);
        }
        Op::Jmp(t) => {
            w.u8(0x1F);
            w.u32(t);
        }
        Op::JmpIfFalse(t) => {
            w.u8(0x20);
            w.u32(t);
        }
        Op::JmpIfTrue(t) => {
            w.u8(0x21);
            w.u32(t);
        }
        Op::ForInit { slot, exit } => {
            w.u8(0x22);
            match slot {
                SlotRef::Global(s) => {
                    w.u8(0);
                    w.u16(s);
                }
                SlotRef::Local(s) => {
                    w.u8(1);
                    w.u16(s);
                }
            }
            w.u32(exit);
        }
        Op::ForStep { body } => {
            w.u8(0x23);
            w.u32(body);
        }
        Op::ForEnd => w.u8(0x24),
        Op::Gosub(t) => {
            w.u8(0x25);
            w.u32(t);
        }
        Op::RetSub => w.u8(0x26),
        Op::RetSubTo(t) => {
            w.u8(0x27);
            w.u32(t);
        }
        Op::CallProc { proc, argc } => {
            w.u8(0x28);
            w.u16(proc);
            w.u8(argc);
        }
        Op::Ret => w.u8(0x29),
        Op::PrintItem(kind) => {
            w.u8(0x2A);
            w.u8(kind as u8);
        }
        Op::PrintEol => w.u8(0x2B),
        Op::InputItem(tag) => {
            w.u8(0x2C);
            w.tag(tag);
        }
        Op::LineInput => w.u8(0x2D),
        Op::InputPrompt { question } => {
            w.u8(0x2E);
            w.bool(question);
        }
        Op::Open(mode) => {
            w.u8(0x2F);
            w.u8(mode as u8);
        }
        Op::Close => w.u8(0x30),
        Op::CloseAll => w.u8(0x31),
        Op::FileIo(op) => {
            w.u8(0x32);
            match op {
                FileOp::PrintValue => w.u8(0),
                FileOp::PrintZone => w.u8(1),
                FileOp::PrintEol => w.u8(2),
                FileOp::InputItem(tag) => {
                    w.u8(3);
                    w.tag(tag);
                }
                FileOp::LineInput => w.u8(4),
                FileOp::Eof => w.u8(5),
            }
        }
        Op::ReadData(tag) => {
            w.u8(0x33);
            w.tag(tag);
        }
        Op::RestoreData(idx) => {
            w.u8(0x34);
            w.u32(idx);
        }
        Op::Rnd => w.u8(0x35),
        Op::Randomize => w.u8(0x36),
        Op::Timer => w.u8(0x37),
        Op::Intrinsic { id, argc } => {
            w.u8(0x38);
            w.u16(id);
            w.u8(argc);
        }
        Op::Hal(op) => {
            w.u8(0x39);
            w.u8(op as u8);
        }
        Op::Halt => w.u8(0x3A),
    }
}

fn decode_op(r: &mut Reader<'_>) -> Result<Op, ImageError> {
    let slot_ref = |r: &mut Reader<'_>| -> Result<SlotRef, ImageError> {
        Ok(match r.u8()? {
            0 => SlotRef::Global(r.u16()?),
            1 => SlotRef::Local(r.u16()?),
            _ => return Err(ImageError::Corrupt("bad slot reference")),
        })
    };
    Ok(match r.u8()? {
        0x00 => Op::PushConst(r.u32()?),
        0x01 => Op::Pop,
        0x02 => Op::Dup,
        0x03 => Op::Swap,
        0x04 => Op::LoadLocal(r.u16()?),
        0x05 => Op::StoreLocal(r.u16()?),
        0x06 => Op::LoadGlobal(r.u16()?),
        0x07 => Op::StoreGlobal(r.u16()?),
        0x08 => Op::RefLocal(r.u16()?),
        0x09 => Op::RefGlobal(r.u16()?),
        0x0A => Op::FieldGet(r.u16()?),
        0x0B => Op::FieldSet(r.u16()?),
        0x0C => Op::IndexGet(r.u8()?),
        0x0D => Op::IndexSet(r.u8()?),
        0x0E => Op::BoundCheck(r.u8()?),
        0x0F => {
            let slot = slot_ref(r)?;
            let dims = r.u8()?;
            let elem = r.tag()?;
            Op::NewArray { slot, dims, elem }
        }
        0x10 => Op::RefIndex(r.u8()?),
        0x11 => Op::Add(num_kind_from(r.u8()?)?),
        0x12 => Op::Sub(num_kind_from(r.u8()?)?),
        0x13 => Op::Mul(num_kind_from(r.u8()?)?),
        0x14 => Op::Div(num_kind_from(r.u8()?)?),
        0x15 => Op::IntDiv(num_kind_from(r.u8()?)?),
        0x16 => Op::Mod(num_kind_from(r.u8()?)?),
        0x17 => Op::Pow,
        0x18 => Op::Neg(num_kind_from(r.u8()?)?),
        0x19 => {
            let op = match r.u8()? {
                0 => CmpOp::Eq,
                1 => CmpOp::Ne,
                2 => CmpOp::Lt,
                3 => CmpOp::Le,
                4 => CmpOp::Gt,
                5 => CmpOp::Ge,
                _ => return Err(ImageError::Corrupt("bad comparison")),
            };
            let kind = match r.u8()? {
                0 => CmpKind::Num(num_kind_from(r.u8()?)?),
                1 => CmpKind::Str,
                _ => return Err(ImageError::Corrupt("bad comparison kind")),
            };
            Op::Cmp(op, kind)
        }
        0x1A => Op::And(num_kind_from(r.u8()?)?),
        0x1B => Op::Or(num_kind_from(r.u8()?)?),
        0x1C => Op::Not(num_kind_from(r.u8()?)?),
        0x1D => Op::Concat,
        0x1E => Op::Coerce(r.tag()?, r.tag()?),
        0x1F => Op::Jmp(r.u32()?),
        0x20 => Op::JmpIfFalse(r.u32()?),
        0x21 => Op::JmpIfTrue(r.u32()?),
        0x22 => {
            let slot = slot_ref(r)?;
            let exit = r.u32()?;
            Op::ForInit { slot, exit }
        }
        0x23 => Op::ForStep { body: r.u32()? },
        0x24 => Op::ForEnd,
        0x25 => Op::Gosub(r.u32()?),
        0x26 => Op::RetSub,
        0x27 => Op::RetSubTo(r.u32()?),
        0x28 => {
            let proc = r.u16()?;
            let argc = r.u8()?;
            Op::CallProc { proc, argc }
        }
        0x29 => Op::Ret,
        0x2A => Op::PrintItem(match r.u8()? {
            0 => PrintKind::Value,
            1 => PrintKind::Zone,
            _ => return Err(ImageError::Corrupt("bad print kind")),
        }),
        0x2B => Op::PrintEol,
        0x2C => Op::InputItem(r.tag()?),
        0x2D => Op::LineInput,
        0x2E => Op::InputPrompt { question: r.bool()? },
        0x2F => Op::Open(match r.u8()? {
            0 => OpenMode::Input,
            1 => OpenMode::Output,
            2 => OpenMode::Append,
            3 => OpenMode::Binary,
            4 => OpenMode::Random,
            _ => return Err(ImageError::Corrupt("bad open mode")),
        }),
        0x30 => Op::Close,
        0x31 => Op::CloseAll,
        0x32 => Op::FileIo(match r.u8()? {
            0 => FileOp::PrintValue,
            1 => FileOp::PrintZone,
            2 => FileOp::PrintEol,
            3 => FileOp::InputItem(r.tag()?),
            4 => FileOp::LineInput,
            5 => FileOp::Eof,
            _ => return Err(ImageError::Corrupt("bad file operation")),
        }),
        0x33 => Op::ReadData(r.tag()?),
        0x34 => Op::RestoreData(r.u32()?),
        0x35 => Op::Rnd,
        0x36 => Op::Randomize,
        0x37 => Op::Timer,
        0x38 => {
            let id = r.u16()?;
            let argc = r.u8()?;
            Op::Intrinsic { id, argc }
        }
        0x39 => Op::Hal(match r.u8()? {
            0 => HalOp::Cls,
            1 => HalOp::Beep,
            2 => HalOp::Sleep,
            _ => return Err(ImageError::Corrupt("bad hal operation")),
        }),
        0x3A => Op::Halt,
        _ => return Err(ImageError::Corrupt("unknown opcode")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::NumKind;

    fn sample_image() -> Image {
        Image {
            flags: FLAG_RNG_V1,
            consts: vec![
                ConstEntry::I16(42),
                ConstEntry::I64(i64::MAX),
                ConstEntry::F32(1.5),
                ConstEntry::F64(-0.25),
                ConstEntry::Str(b"Hello, World!".to_vec()),
            ],
            records: vec![RecordEntry {
                name: "POINT".into(),
                fields: vec![("X".into(), TyTag::F32), ("Y".into(), TyTag::F32)],
            }],
            globals: vec![TyTag::I16, TyTag::Str, TyTag::Record(0)],
            procs: vec![ProcEntry {
                name: "ADD%".into(),
                entry_pc: 10,
                is_function: true,
                params: vec![ParamEntry {
                    by_val: false,
                    is_array: false,
                    tag: TyTag::I16,
                }],
                locals: vec![TyTag::I16, TyTag::I16],
            }],
            data: vec![ConstEntry::I16(10), ConstEntry::Str(b"x".to_vec())],
            code: vec![
                Op::PushConst(0),
                Op::StoreGlobal(0),
                Op::ForInit { slot: SlotRef::Global(0), exit: 5 },
                Op::Add(NumKind::F64),
                Op::Cmp(CmpOp::Le, CmpKind::Str),
                Op::Coerce(TyTag::I16, TyTag::FixedStr(8)),
                Op::Intrinsic { id: 6, argc: 1 },
                Op::Halt,
            ],
            source_map: vec![SourceMapEntry {
                pc: 0,
                file: 0,
                start: 0,
                end: 7,
                line: 1,
                column: 1,
            }],
            labels: vec![LabelEntry { name: "L2".into(), pc: 4 }],
            stmt_pcs: vec![0, 2],
        }
    }

    #[test]
    fn test_image_round_trip() {
        let image = sample_image();
        let bytes = write_image(&image);
        let back = read_image(&bytes).expect("read back");
        // The writer sets the source-map flag.
        assert_eq!(back.flags & FLAG_RNG_V1, FLAG_RNG_V1);
        assert_eq!(back.consts, image.consts);
        assert_eq!(back.records, image.records);
        assert_eq!(back.globals, image.globals);
        assert_eq!(back.procs, image.procs);
        assert_eq!(back.data, image.data);
        assert_eq!(back.code, image.code);
        assert_eq!(back.source_map, image.source_map);
        assert_eq!(back.labels, image.labels);
        assert_eq!(back.stmt_pcs, image.stmt_pcs);
    }

    #[test]
    fn test_bad_magic_refused() {
        let mut bytes = write_image(&sample_image());
        bytes[0] = b'X';
        assert_eq!(read_image(&bytes), Err(ImageError::BadMagic));
    }

    #[test]
    fn test_unknown_version_refused() {
        let mut bytes = write_image(&sample_image());
        bytes[4] = 0xFF;
        bytes[5] = 0x00;
        assert!(matches!(
            read_image(&bytes),
            Err(ImageError::UnsupportedImage(0xFF))
        ));
    }

    #[test]
    fn test_truncated_image_refused() {
        let bytes = write_image(&sample_image());
        assert_eq!(read_image(&bytes[..12]), Err(ImageError::Truncated));
    }

    #[test]
    fn test_span_lookup_is_floor() {
        let mut image = sample_image();
        image.source_map = vec![
            SourceMapEntry { pc: 0, file: 0, start: 0, end: 1, line: 1, column: 1 },
            SourceMapEntry { pc: 4, file: 0, start: 2, end: 3, line: 2, column: 1 },
        ];
        assert_eq!(image.span_at(0).unwrap().line, 1);
        assert_eq!(image.span_at(3).unwrap().line, 1);
        assert_eq!(image.span_at(4).unwrap().line, 2);
        assert_eq!(image.span_at(100).unwrap().line, 2);
    }
}
