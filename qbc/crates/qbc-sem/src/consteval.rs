//! Compile-time evaluation of constant expressions.
//!
//! `CONST` initializers, fixed-string lengths, `CASE` range sanity and
//! the `STEP 0` warning all need expression values before any bytecode
//! exists. Only literals, previously declared constants and the operator
//! set are constant; calls and variable references are not.

use qbc_lex::NumLit;
use qbc_par::{BinOp, Expr, ExprKind, UnOp};
use qbc_util::Symbol;
use rustc_hash::FxHashMap;

use crate::types::Ty;

/// A compile-time value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstVal {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Single(f32),
    Double(f64),
    Str(Vec<u8>),
}

impl ConstVal {
    pub fn ty(&self) -> Ty {
        match self {
            ConstVal::Int16(_) => Ty::Int16,
            ConstVal::Int32(_) => Ty::Int32,
            ConstVal::Int64(_) => Ty::Int64,
            ConstVal::Single(_) => Ty::Single,
            ConstVal::Double(_) => Ty::Double,
            ConstVal::Str(_) => Ty::String,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, ConstVal::Str(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        Some(match self {
            ConstVal::Int16(v) => *v as f64,
            ConstVal::Int32(v) => *v as f64,
            ConstVal::Int64(v) => *v as f64,
            ConstVal::Single(v) => *v as f64,
            ConstVal::Double(v) => *v,
            ConstVal::Str(_) => return None,
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        Some(match self {
            ConstVal::Int16(v) => *v as i64,
            ConstVal::Int32(v) => *v as i64,
            ConstVal::Int64(v) => *v,
            ConstVal::Single(v) => *v as i64,
            ConstVal::Double(v) => *v as i64,
            ConstVal::Str(_) => return None,
        })
    }

    pub fn from_lit(lit: NumLit) -> ConstVal {
        match lit {
            NumLit::Int16(v) => ConstVal::Int16(v),
            NumLit::Int32(v) => ConstVal::Int32(v),
            NumLit::Int64(v) => ConstVal::Int64(v),
            NumLit::Single(v) => ConstVal::Single(v),
            NumLit::Double(v) => ConstVal::Double(v),
        }
    }

    fn from_f64(value: f64, ty: Ty) -> Option<ConstVal> {
        Some(match ty {
            Ty::Int16 => ConstVal::Int16(in_range(value, i16::MIN as f64, i16::MAX as f64)? as i16),
            Ty::Int32 => ConstVal::Int32(in_range(value, i32::MIN as f64, i32::MAX as f64)? as i32),
            Ty::Int64 => ConstVal::Int64(in_range(value, i64::MIN as f64, i64::MAX as f64)? as i64),
            Ty::UInt32 => ConstVal::Int64(in_range(value, 0.0, u32::MAX as f64)? as i64),
            Ty::Single => ConstVal::Single(value as f32),
            Ty::Double => ConstVal::Double(value),
            _ => return None,
        })
    }
}

fn in_range(value: f64, min: f64, max: f64) -> Option<f64> {
    if value < min || value > max || value.is_nan() {
        None
    } else {
        Some(value)
    }
}

/// Evaluate `expr` as a constant. `None` means the expression is not
/// constant (or overflowed); the caller decides how loudly to complain.
pub fn eval_const(expr: &Expr, consts: &FxHashMap<Symbol, ConstVal>) -> Option<ConstVal> {
    match &expr.kind {
        ExprKind::Number(lit) => Some(ConstVal::from_lit(*lit)),
        ExprKind::StringLit(bytes) => Some(ConstVal::Str(bytes.clone())),
        ExprKind::Var(name) => consts.get(name).cloned(),
        ExprKind::Unary { op, operand } => {
            let value = eval_const(operand, consts)?;
            match op {
                UnOp::Neg => {
                    let ty = value.ty();
                    if !value.is_numeric() {
                        return None;
                    }
                    ConstVal::from_f64(-value.as_f64()?, ty)
                }
                UnOp::Not => {
                    let bits = value.as_i64()?;
                    narrow_logical(!bits, value.ty())
                }
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let a = eval_const(lhs, consts)?;
            let b = eval_const(rhs, consts)?;
            eval_binary(*op, &a, &b)
        }
        _ => None,
    }
}

fn eval_binary(op: BinOp, a: &ConstVal, b: &ConstVal) -> Option<ConstVal> {
    // String cases first: concatenation and comparison.
    if let (ConstVal::Str(sa), ConstVal::Str(sb)) = (a, b) {
        return match op {
            BinOp::Add => {
                let mut out = sa.clone();
                out.extend_from_slice(sb);
                Some(ConstVal::Str(out))
            }
            _ if op.is_relational() => Some(bool_val(compare(op, sa.cmp(sb)))),
            _ => None,
        };
    }
    if !a.is_numeric() || !b.is_numeric() {
        return None;
    }

    let join = a.ty().join(b.ty());
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            let value = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                _ => x * y,
            };
            ConstVal::from_f64(value, join)
        }
        BinOp::Div => {
            let y = b.as_f64()?;
            if y == 0.0 {
                return None;
            }
            let target = if join == Ty::Double { Ty::Double } else { Ty::Single };
            ConstVal::from_f64(a.as_f64()? / y, target)
        }
        BinOp::IntDiv => {
            let ty = a.ty().integer_join(b.ty());
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            if y == 0 {
                return None;
            }
            ConstVal::from_f64((x.wrapping_div(y)) as f64, ty)
        }
        BinOp::Mod => {
            let ty = a.ty().integer_join(b.ty());
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            if y == 0 {
                return None;
            }
            ConstVal::from_f64((x.wrapping_rem(y)) as f64, ty)
        }
        BinOp::Pow => ConstVal::from_f64(a.as_f64()?.powf(b.as_f64()?), Ty::Double),
        BinOp::And | BinOp::Or => {
            let ty = a.ty().integer_join(b.ty());
            let (x, y) = (a.as_i64()?, b.as_i64()?);
            let bits = if op == BinOp::And { x & y } else { x | y };
            narrow_logical(bits, ty)
        }
        _ if op.is_relational() => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            Some(bool_val(compare(op, x.partial_cmp(&y)?)))
        }
        _ => None,
    }
}

fn compare(op: BinOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinOp::Eq => ord == Equal,
        BinOp::Ne => ord != Equal,
        BinOp::Lt => ord == Less,
        BinOp::Le => ord != Greater,
        BinOp::Gt => ord == Greater,
        BinOp::Ge => ord != Less,
        _ => unreachable!(),
    }
}

/// Relational results are INTEGER: -1 for true, 0 for false.
fn bool_val(b: bool) -> ConstVal {
    ConstVal::Int16(if b { -1 } else { 0 })
}

fn narrow_logical(bits: i64, ty: Ty) -> Option<ConstVal> {
    Some(match ty {
        Ty::Int16 => ConstVal::Int16(bits as i16),
        Ty::Int32 | Ty::UInt32 => ConstVal::Int32(bits as i32),
        _ => ConstVal::Int64(bits),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbc_util::{FileId, Handler};

    fn eval_src(src: &str) -> Option<ConstVal> {
        let handler = Handler::new();
        let tokens = qbc_lex::tokenize(src, FileId::DUMMY, &handler);
        let program = qbc_par::parse(tokens, &handler);
        assert!(!handler.has_errors());
        match &program.stmts[0].kind {
            qbc_par::StmtKind::Assign { value, .. } => eval_const(value, &FxHashMap::default()),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_folding() {
        assert_eq!(eval_src("x = 2 + 3 * 4"), Some(ConstVal::Int16(14)));
        assert_eq!(eval_src("x = 10 \\ 3"), Some(ConstVal::Int16(3)));
        assert_eq!(eval_src("x = 10 MOD 3"), Some(ConstVal::Int16(1)));
        assert_eq!(eval_src("x = -7 MOD 3"), Some(ConstVal::Int16(-1)));
    }

    #[test]
    fn test_division_is_float() {
        assert_eq!(eval_src("x = 1 / 2"), Some(ConstVal::Single(0.5)));
        assert_eq!(eval_src("x = 1# / 2"), Some(ConstVal::Double(0.5)));
    }

    #[test]
    fn test_pow_is_double() {
        assert_eq!(eval_src("x = 2 ^ 10"), Some(ConstVal::Double(1024.0)));
    }

    #[test]
    fn test_string_concat_and_compare() {
        assert_eq!(
            eval_src("x = \"AB\" + \"CD\""),
            Some(ConstVal::Str(b"ABCD".to_vec()))
        );
        assert_eq!(eval_src("x = \"A\" < \"B\""), Some(ConstVal::Int16(-1)));
        assert_eq!(eval_src("x = \"A\" = \"B\""), Some(ConstVal::Int16(0)));
    }

    #[test]
    fn test_logical_ops_are_bitwise() {
        assert_eq!(eval_src("x = 6 AND 3"), Some(ConstVal::Int16(2)));
        assert_eq!(eval_src("x = 6 OR 3"), Some(ConstVal::Int16(7)));
        assert_eq!(eval_src("x = NOT 0"), Some(ConstVal::Int16(-1)));
    }

    #[test]
    fn test_relational_yields_minus_one() {
        assert_eq!(eval_src("x = 2 > 1"), Some(ConstVal::Int16(-1)));
        assert_eq!(eval_src("x = 1 > 2"), Some(ConstVal::Int16(0)));
    }

    #[test]
    fn test_non_const_is_none() {
        assert_eq!(eval_src("x = y + 1"), None);
        assert_eq!(eval_src("x = LEN(\"abc\")"), None);
    }

    #[test]
    fn test_division_by_zero_is_not_const() {
        assert_eq!(eval_src("x = 1 \\ 0"), None);
        assert_eq!(eval_src("x = 1 / 0"), None);
    }

    #[test]
    fn test_overflow_is_not_const() {
        assert_eq!(eval_src("x = 32767% + 1%"), None);
    }
}
