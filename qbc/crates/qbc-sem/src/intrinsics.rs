//! Built-in function table.
//!
//! Intrinsics resolve like procedures but dispatch through a single VM
//! instruction with a stable numeric id, so the set here is also the
//! image-format contract. `RND` and `TIMER` sit in the table for name
//! resolution even though the emitter lowers them to dedicated
//! instructions.

use qbc_util::Symbol;

use crate::types::Ty;

/// What an intrinsic expects in one argument position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Num,
    Str,
}

macro_rules! intrinsics {
    ($($variant:ident = $id:literal, $name:literal;)*) => {
        /// Every built-in function, with its stable dispatch id.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum Intrinsic {
            $($variant = $id,)*
        }

        impl Intrinsic {
            /// Resolve a (case-folded) name to an intrinsic.
            pub fn lookup(name: Symbol) -> Option<Intrinsic> {
                let text = name.as_str();
                Some(match text.as_str() {
                    $($name => Intrinsic::$variant,)*
                    _ => return None,
                })
            }

            pub const fn id(self) -> u16 {
                self as u16
            }

            pub fn from_id(id: u16) -> Option<Intrinsic> {
                Some(match id {
                    $($id => Intrinsic::$variant,)*
                    _ => return None,
                })
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Intrinsic::$variant => $name,)*
                }
            }
        }
    };
}

intrinsics! {
    Abs = 0, "ABS";
    Sgn = 1, "SGN";
    Int = 2, "INT";
    Fix = 3, "FIX";
    Sqr = 4, "SQR";
    Len = 5, "LEN";
    Chr = 6, "CHR$";
    Asc = 7, "ASC";
    Str = 8, "STR$";
    Val = 9, "VAL";
    Left = 10, "LEFT$";
    Right = 11, "RIGHT$";
    Mid = 12, "MID$";
    Instr = 13, "INSTR";
    Space = 14, "SPACE$";
    StringRep = 15, "STRING$";
    Ucase = 16, "UCASE$";
    Lcase = 17, "LCASE$";
    Ltrim = 18, "LTRIM$";
    Rtrim = 19, "RTRIM$";
    Rnd = 20, "RND";
    Timer = 21, "TIMER";
    Eof = 22, "EOF";
}

impl Intrinsic {
    /// Minimum and maximum argument counts.
    pub fn arg_range(self) -> (u8, u8) {
        match self {
            Intrinsic::Rnd | Intrinsic::Timer => (0, 0),
            Intrinsic::Mid => (2, 3),
            Intrinsic::Instr => (2, 3),
            Intrinsic::Left | Intrinsic::Right | Intrinsic::StringRep => (2, 2),
            _ => (1, 1),
        }
    }

    /// Expected kind of argument `idx`, given how many were supplied.
    pub fn arg_kind(self, idx: usize, argc: usize) -> ArgKind {
        match self {
            Intrinsic::Abs
            | Intrinsic::Sgn
            | Intrinsic::Int
            | Intrinsic::Fix
            | Intrinsic::Sqr
            | Intrinsic::Chr
            | Intrinsic::Space
            | Intrinsic::Str
            | Intrinsic::Eof => ArgKind::Num,
            Intrinsic::Asc
            | Intrinsic::Val
            | Intrinsic::Ucase
            | Intrinsic::Lcase
            | Intrinsic::Ltrim
            | Intrinsic::Rtrim
            | Intrinsic::Len => ArgKind::Str,
            Intrinsic::Left | Intrinsic::Right => {
                if idx == 0 {
                    ArgKind::Str
                } else {
                    ArgKind::Num
                }
            }
            Intrinsic::Mid => {
                if idx == 0 {
                    ArgKind::Str
                } else {
                    ArgKind::Num
                }
            }
            Intrinsic::Instr => {
                // INSTR([start,] haystack$, needle$)
                if argc == 3 && idx == 0 {
                    ArgKind::Num
                } else {
                    ArgKind::Str
                }
            }
            Intrinsic::StringRep => {
                // STRING$(n, code | str$); second argument may be either.
                if idx == 0 {
                    ArgKind::Num
                } else {
                    ArgKind::Num
                }
            }
            Intrinsic::Rnd | Intrinsic::Timer => ArgKind::Num,
        }
    }

    /// Whether an argument position accepts both kinds.
    pub fn arg_is_lenient(self, idx: usize) -> bool {
        matches!(self, Intrinsic::StringRep if idx == 1)
    }

    /// Result type, possibly depending on argument types.
    pub fn result_ty(self, arg_tys: &[Ty]) -> Ty {
        match self {
            Intrinsic::Abs | Intrinsic::Int | Intrinsic::Fix => {
                arg_tys.first().copied().filter(|t| t.is_numeric()).unwrap_or(Ty::Double)
            }
            Intrinsic::Sgn => Ty::Int16,
            Intrinsic::Sqr => Ty::Double,
            Intrinsic::Len | Intrinsic::Asc | Intrinsic::Instr => Ty::Int32,
            Intrinsic::Val => Ty::Double,
            Intrinsic::Chr
            | Intrinsic::Str
            | Intrinsic::Left
            | Intrinsic::Right
            | Intrinsic::Mid
            | Intrinsic::Space
            | Intrinsic::StringRep
            | Intrinsic::Ucase
            | Intrinsic::Lcase
            | Intrinsic::Ltrim
            | Intrinsic::Rtrim => Ty::String,
            Intrinsic::Rnd | Intrinsic::Timer => Ty::Single,
            Intrinsic::Eof => Ty::Int16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive_via_symbol() {
        assert_eq!(Intrinsic::lookup(Symbol::intern("chr$")), Some(Intrinsic::Chr));
        assert_eq!(Intrinsic::lookup(Symbol::intern("LEN")), Some(Intrinsic::Len));
        assert_eq!(Intrinsic::lookup(Symbol::intern("NOPE")), None);
    }

    #[test]
    fn test_id_round_trip() {
        for id in 0..=22u16 {
            let i = Intrinsic::from_id(id).expect("dense ids");
            assert_eq!(i.id(), id);
        }
        assert_eq!(Intrinsic::from_id(999), None);
    }

    #[test]
    fn test_arg_ranges() {
        assert_eq!(Intrinsic::Mid.arg_range(), (2, 3));
        assert_eq!(Intrinsic::Rnd.arg_range(), (0, 0));
        assert_eq!(Intrinsic::Len.arg_range(), (1, 1));
    }

    #[test]
    fn test_result_types() {
        assert_eq!(Intrinsic::Abs.result_ty(&[Ty::Int16]), Ty::Int16);
        assert_eq!(Intrinsic::Chr.result_ty(&[Ty::Int16]), Ty::String);
        assert_eq!(Intrinsic::Instr.result_ty(&[Ty::String, Ty::String]), Ty::Int32);
    }

    #[test]
    fn test_instr_optional_start() {
        assert_eq!(Intrinsic::Instr.arg_kind(0, 3), ArgKind::Num);
        assert_eq!(Intrinsic::Instr.arg_kind(0, 2), ArgKind::Str);
        assert_eq!(Intrinsic::Instr.arg_kind(2, 3), ArgKind::Str);
    }
}
