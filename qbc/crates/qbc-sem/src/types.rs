//! The dialect's type system: numeric kinds, strings and records.
//!
//! Numeric widening follows the lattice
//! `Int16 < Int32 < Int64 <= Single < Double`, with `UInt32` feeding
//! into `Int64` and `Double`. Fixed-length strings decay to `String` in
//! every r-value position; the fixed length only matters when storing.

use indexmap::IndexMap;
use qbc_util::{Span, Symbol};

/// Index into the record-type table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// A value type as the analyzer sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ty {
    Int16,
    Int32,
    Int64,
    UInt32,
    Single,
    Double,
    String,
    FixedString(u16),
    Record(TypeId),
}

impl Ty {
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Ty::Int16 | Ty::Int32 | Ty::Int64 | Ty::UInt32 | Ty::Single | Ty::Double
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Ty::Int16 | Ty::Int32 | Ty::Int64 | Ty::UInt32)
    }

    pub fn is_string(self) -> bool {
        matches!(self, Ty::String | Ty::FixedString(_))
    }

    /// The type a value of this type has after loading: fixed strings
    /// decay to plain strings.
    pub fn decay(self) -> Ty {
        match self {
            Ty::FixedString(_) => Ty::String,
            other => other,
        }
    }

    /// Rank in the widening lattice; higher widens.
    fn rank(self) -> u8 {
        match self {
            Ty::Int16 => 0,
            Ty::UInt32 => 1,
            Ty::Int32 => 2,
            Ty::Int64 => 3,
            Ty::Single => 4,
            Ty::Double => 5,
            _ => u8::MAX,
        }
    }

    /// The common type two numeric operands widen to.
    ///
    /// `UInt32` does not fit in `Int32`, so mixing them widens to
    /// `Int64`; every integer kind fits in `Double`, and `Int64` mixed
    /// with `Single` also goes through `Double` to keep magnitude.
    pub fn join(self, other: Ty) -> Ty {
        debug_assert!(self.is_numeric() && other.is_numeric());
        if self == other {
            return self;
        }
        let (lo, hi) = if self.rank() <= other.rank() {
            (self, other)
        } else {
            (other, self)
        };
        match (lo, hi) {
            (Ty::UInt32, Ty::Int32) | (Ty::Int32, Ty::UInt32) => Ty::Int64,
            (Ty::Int64, Ty::Single) | (Ty::UInt32, Ty::Single) => Ty::Double,
            _ => hi,
        }
    }

    /// The integer type both operands of `\`, `MOD` and the logical
    /// operators coerce to.
    pub fn integer_join(self, other: Ty) -> Ty {
        let int_of = |t: Ty| match t {
            Ty::Int16 => Ty::Int16,
            Ty::Int32 => Ty::Int32,
            Ty::Int64 => Ty::Int64,
            Ty::UInt32 => Ty::UInt32,
            Ty::Single => Ty::Int32,
            Ty::Double => Ty::Int32,
            _ => Ty::Int32,
        };
        let a = int_of(self);
        let b = int_of(other);
        if a == b {
            a
        } else {
            a.join(b)
        }
    }

    /// Size of one value of this type in bytes, as the original data
    /// layout defines it. Records sum their fields.
    pub fn size_bytes(self, types: &TypeTable) -> u32 {
        match self {
            Ty::Int16 => 2,
            Ty::Int32 | Ty::UInt32 | Ty::Single => 4,
            Ty::Int64 | Ty::Double => 8,
            // Variable strings have descriptor size; reported as 4.
            Ty::String => 4,
            Ty::FixedString(len) => len as u32,
            Ty::Record(id) => types.layout(id).size_bytes,
        }
    }

    /// The user-facing type name.
    pub fn name(self, types: &TypeTable) -> String {
        match self {
            Ty::Int16 => "INTEGER".into(),
            Ty::Int32 => "LONG".into(),
            Ty::Int64 => "_INTEGER64".into(),
            Ty::UInt32 => "_UNSIGNED LONG".into(),
            Ty::Single => "SINGLE".into(),
            Ty::Double => "DOUBLE".into(),
            Ty::String => "STRING".into(),
            Ty::FixedString(n) => format!("STRING * {n}"),
            Ty::Record(id) => types.layout(id).name.to_string(),
        }
    }
}

/// The type a sigil on an identifier implies, if any.
pub fn sigil_ty(name: Symbol) -> Option<Ty> {
    let text = name.as_str();
    if text.ends_with("&&") {
        Some(Ty::Int64)
    } else if text.ends_with('%') {
        Some(Ty::Int16)
    } else if text.ends_with('&') {
        Some(Ty::Int32)
    } else if text.ends_with('!') {
        Some(Ty::Single)
    } else if text.ends_with('#') {
        Some(Ty::Double)
    } else if text.ends_with('$') {
        Some(Ty::String)
    } else {
        None
    }
}

/// One field of a record layout.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: Symbol,
    pub ty: Ty,
    /// Field position, used by the field access instructions.
    pub index: u16,
    /// Byte offset within the record's on-disk form.
    pub byte_offset: u32,
}

/// Layout of a `TYPE ... END TYPE` record.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    pub name: Symbol,
    pub fields: Vec<FieldInfo>,
    pub size_bytes: u32,
    pub span: Span,
}

impl RecordLayout {
    pub fn field(&self, name: Symbol) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// All record types declared in a module, in declaration order.
#[derive(Debug, Default)]
pub struct TypeTable {
    layouts: Vec<RecordLayout>,
    by_name: IndexMap<Symbol, TypeId>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: Symbol) -> Option<TypeId> {
        self.by_name.get(&name).copied()
    }

    pub fn layout(&self, id: TypeId) -> &RecordLayout {
        &self.layouts[id.0 as usize]
    }

    pub fn layouts(&self) -> &[RecordLayout] {
        &self.layouts
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Register a layout. Returns `None` if the name is taken.
    pub fn define(&mut self, layout: RecordLayout) -> Option<TypeId> {
        if self.by_name.contains_key(&layout.name) {
            return None;
        }
        let id = TypeId(self.layouts.len() as u32);
        self.by_name.insert(layout.name, id);
        self.layouts.push(layout);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_lattice() {
        assert_eq!(Ty::Int16.join(Ty::Int32), Ty::Int32);
        assert_eq!(Ty::Int32.join(Ty::Single), Ty::Single);
        assert_eq!(Ty::Single.join(Ty::Double), Ty::Double);
        assert_eq!(Ty::Int16.join(Ty::Int16), Ty::Int16);
    }

    #[test]
    fn test_uint32_mixes_wide() {
        assert_eq!(Ty::UInt32.join(Ty::Int32), Ty::Int64);
        assert_eq!(Ty::UInt32.join(Ty::Int64), Ty::Int64);
        assert_eq!(Ty::UInt32.join(Ty::Double), Ty::Double);
        assert_eq!(Ty::UInt32.join(Ty::Single), Ty::Double);
    }

    #[test]
    fn test_int64_single_goes_double() {
        assert_eq!(Ty::Int64.join(Ty::Single), Ty::Double);
    }

    #[test]
    fn test_integer_join_for_div_and_mod() {
        assert_eq!(Ty::Single.integer_join(Ty::Single), Ty::Int32);
        assert_eq!(Ty::Int16.integer_join(Ty::Int16), Ty::Int16);
        assert_eq!(Ty::Int16.integer_join(Ty::Int64), Ty::Int64);
    }

    #[test]
    fn test_sigils() {
        assert_eq!(sigil_ty(Symbol::intern("A%")), Some(Ty::Int16));
        assert_eq!(sigil_ty(Symbol::intern("A&")), Some(Ty::Int32));
        assert_eq!(sigil_ty(Symbol::intern("A&&")), Some(Ty::Int64));
        assert_eq!(sigil_ty(Symbol::intern("A!")), Some(Ty::Single));
        assert_eq!(sigil_ty(Symbol::intern("A#")), Some(Ty::Double));
        assert_eq!(sigil_ty(Symbol::intern("A$")), Some(Ty::String));
        assert_eq!(sigil_ty(Symbol::intern("A")), None);
    }

    #[test]
    fn test_fixed_string_decays() {
        assert_eq!(Ty::FixedString(8).decay(), Ty::String);
        assert_eq!(Ty::Int16.decay(), Ty::Int16);
    }

    #[test]
    fn test_type_table_define_and_lookup() {
        let mut table = TypeTable::new();
        let name = Symbol::intern("POINT");
        let id = table
            .define(RecordLayout {
                name,
                fields: vec![
                    FieldInfo {
                        name: Symbol::intern("X"),
                        ty: Ty::Single,
                        index: 0,
                        byte_offset: 0,
                    },
                    FieldInfo {
                        name: Symbol::intern("Y"),
                        ty: Ty::Single,
                        index: 1,
                        byte_offset: 4,
                    },
                ],
                size_bytes: 8,
                span: Span::DUMMY,
            })
            .unwrap();
        assert_eq!(table.lookup(name), Some(id));
        assert!(table.layout(id).field(Symbol::intern("x")).is_some());
        // Redefinition is refused.
        assert!(table
            .define(RecordLayout {
                name,
                fields: Vec::new(),
                size_bytes: 0,
                span: Span::DUMMY,
            })
            .is_none());
    }

    #[test]
    fn test_record_size() {
        let mut table = TypeTable::new();
        let id = table
            .define(RecordLayout {
                name: Symbol::intern("REC"),
                fields: Vec::new(),
                size_bytes: 12,
                span: Span::DUMMY,
            })
            .unwrap();
        assert_eq!(Ty::Record(id).size_bytes(&table), 12);
        assert_eq!(Ty::FixedString(20).size_bytes(&table), 20);
    }
}
