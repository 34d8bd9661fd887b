//! Runtime values and the numeric conversion rules.
//!
//! A value is a tagged union over the six numeric kinds, owned byte
//! strings, records, array references and slot references. Strings are
//! 8-bit clean; `CHR$(0)` is an ordinary character. Assignment copies:
//! cloning a record or string clones its payload, so no aliasing is
//! observable. Arrays are the exception by design: an `ArrayRef` is an
//! index into the VM's array arena and is shared.
//!
//! Conversion rules:
//!
//! - widening between numeric kinds is exact,
//! - narrowing to an integer kind rounds to nearest, ties to even, and
//!   fails with `Overflow` outside the target range,
//! - `FIX`-style truncation toward zero is a separate entry point,
//! - fixed-length string stores pad with spaces or truncate.

use qbc_emit::TyTag;

use crate::error::RuntimeError;

/// Where a by-reference value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Global(u16),
    /// A local slot of a specific frame on the call stack.
    Frame { frame: u32, slot: u16 },
    /// One element of an arena array.
    ArrayElem { array: u32, offset: u32 },
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Uninitialized slot sentinel; arithmetic on it is a type error.
    Empty,
    I16(i16),
    I32(i32),
    I64(i64),
    U32(u32),
    F32(f32),
    F64(f64),
    Str(Vec<u8>),
    Record { type_id: u16, fields: Vec<Value> },
    /// Index into the VM's array arena.
    ArrayRef(u32),
    /// A by-reference argument.
    Ref(Location),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "EMPTY",
            Value::I16(_) => "INTEGER",
            Value::I32(_) => "LONG",
            Value::I64(_) => "_INTEGER64",
            Value::U32(_) => "_UNSIGNED LONG",
            Value::F32(_) => "SINGLE",
            Value::F64(_) => "DOUBLE",
            Value::Str(_) => "STRING",
            Value::Record { .. } => "TYPE",
            Value::ArrayRef(_) => "ARRAY",
            Value::Ref(_) => "REFERENCE",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Value::I16(_) | Value::I32(_) | Value::I64(_) | Value::U32(_) | Value::F32(_) | Value::F64(_)
        )
    }

    pub fn as_f64(&self) -> Result<f64, RuntimeError> {
        Ok(match self {
            Value::I16(v) => *v as f64,
            Value::I32(v) => *v as f64,
            Value::I64(v) => *v as f64,
            Value::U32(v) => *v as f64,
            Value::F32(v) => *v as f64,
            Value::F64(v) => *v,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "expected a number, found {}",
                    other.type_name()
                )))
            }
        })
    }

    pub fn as_i64(&self) -> Result<i64, RuntimeError> {
        Ok(match self {
            Value::I16(v) => *v as i64,
            Value::I32(v) => *v as i64,
            Value::I64(v) => *v,
            Value::U32(v) => *v as i64,
            Value::F32(v) => narrow_to_i64(*v as f64)?,
            Value::F64(v) => narrow_to_i64(*v)?,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "expected a number, found {}",
                    other.type_name()
                )))
            }
        })
    }

    pub fn as_bytes(&self) -> Result<&[u8], RuntimeError> {
        match self {
            Value::Str(bytes) => Ok(bytes),
            other => Err(RuntimeError::TypeMismatch(format!(
                "expected a string, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, RuntimeError> {
        match self {
            Value::Str(bytes) => Ok(bytes),
            other => Err(RuntimeError::TypeMismatch(format!(
                "expected a string, found {}",
                other.type_name()
            ))),
        }
    }

    /// Truthiness: any non-zero number.
    pub fn is_true(&self) -> Result<bool, RuntimeError> {
        Ok(self.as_f64()? != 0.0)
    }

    /// The canonical text rendering, as `PRINT` and `STR$` produce it
    /// (without the leading sign column).
    pub fn display_digits(&self) -> Result<String, RuntimeError> {
        Ok(match self {
            Value::I16(v) => v.unsigned_abs().to_string(),
            Value::I32(v) => v.unsigned_abs().to_string(),
            Value::I64(v) => v.unsigned_abs().to_string(),
            Value::U32(v) => v.to_string(),
            Value::F32(v) => format_float(v.abs() as f64),
            Value::F64(v) => format_float(v.abs()),
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "expected a number, found {}",
                    other.type_name()
                )))
            }
        })
    }

    pub fn is_negative(&self) -> bool {
        match self {
            Value::I16(v) => *v < 0,
            Value::I32(v) => *v < 0,
            Value::I64(v) => *v < 0,
            Value::F32(v) => *v < 0.0,
            Value::F64(v) => *v < 0.0,
            _ => false,
        }
    }
}

/// Classic float rendering: integral values print without a decimal
/// point, fractions below one drop the leading zero (`.5`, not `0.5`).
fn format_float(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e16 {
        format!("{}", v as i64)
    } else {
        let text = format!("{v}");
        match text.strip_prefix("0.") {
            Some(rest) => format!(".{rest}"),
            None => text,
        }
    }
}

/// Default value for a slot of the given type.
pub fn default_value(tag: TyTag, records: &[qbc_emit::RecordEntry]) -> Value {
    match tag {
        TyTag::I16 => Value::I16(0),
        TyTag::I32 => Value::I32(0),
        TyTag::I64 => Value::I64(0),
        TyTag::U32 => Value::U32(0),
        TyTag::F32 => Value::F32(0.0),
        TyTag::F64 => Value::F64(0.0),
        TyTag::Str => Value::Str(Vec::new()),
        TyTag::FixedStr(len) => Value::Str(vec![0u8; len as usize]),
        TyTag::Record(id) => {
            let fields = records
                .get(id as usize)
                .map(|rec| {
                    rec.fields
                        .iter()
                        .map(|(_, tag)| default_value(*tag, records))
                        .collect()
                })
                .unwrap_or_default();
            Value::Record {
                type_id: id,
                fields,
            }
        }
    }
}

/// Round to nearest, ties to even.
fn round_half_even(x: f64) -> f64 {
    let rounded = x.round();
    if (x - x.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - x.signum()
    } else {
        rounded
    }
}

fn narrow_to_i64(x: f64) -> Result<i64, RuntimeError> {
    let rounded = round_half_even(x);
    if rounded < i64::MIN as f64 || rounded > i64::MAX as f64 || rounded.is_nan() {
        return Err(RuntimeError::Overflow);
    }
    Ok(rounded as i64)
}

fn check_range(x: f64, min: f64, max: f64) -> Result<f64, RuntimeError> {
    if x < min || x > max || x.is_nan() {
        Err(RuntimeError::Overflow)
    } else {
        Ok(x)
    }
}

/// Coerce a value to the target tag, applying the numeric conversion
/// rules and fixed-string padding.
pub fn coerce(value: Value, to: TyTag) -> Result<Value, RuntimeError> {
    Ok(match to {
        TyTag::I16 => {
            let x = round_half_even(value.as_f64()?);
            Value::I16(check_range(x, i16::MIN as f64, i16::MAX as f64)? as i16)
        }
        TyTag::I32 => {
            let x = round_half_even(value.as_f64()?);
            Value::I32(check_range(x, i32::MIN as f64, i32::MAX as f64)? as i32)
        }
        TyTag::I64 => {
            // Going through f64 would lose 64-bit precision; integers
            // convert exactly.
            match value {
                Value::I16(v) => Value::I64(v as i64),
                Value::I32(v) => Value::I64(v as i64),
                Value::I64(v) => Value::I64(v),
                Value::U32(v) => Value::I64(v as i64),
                other => Value::I64(narrow_to_i64(other.as_f64()?)?),
            }
        }
        TyTag::U32 => {
            let x = round_half_even(value.as_f64()?);
            Value::U32(check_range(x, 0.0, u32::MAX as f64)? as u32)
        }
        TyTag::F32 => Value::F32(value.as_f64()? as f32),
        TyTag::F64 => Value::F64(value.as_f64()?),
        TyTag::Str => Value::Str(value.into_bytes()?),
        TyTag::FixedStr(len) => {
            let mut bytes = value.into_bytes()?;
            bytes.resize(len as usize, b' ');
            Value::Str(bytes)
        }
        TyTag::Record(_) => match value {
            rec @ Value::Record { .. } => rec,
            other => {
                return Err(RuntimeError::TypeMismatch(format!(
                    "expected a record, found {}",
                    other.type_name()
                )))
            }
        },
    })
}

/// Truncate toward zero (`FIX`).
pub fn fix_trunc(value: &Value) -> Result<Value, RuntimeError> {
    Ok(match value {
        Value::F32(v) => Value::F32(v.trunc()),
        Value::F64(v) => Value::F64(v.trunc()),
        v if v.is_numeric() => v.clone(),
        other => {
            return Err(RuntimeError::TypeMismatch(format!(
                "expected a number, found {}",
                other.type_name()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrowing_rounds_ties_to_even() {
        assert_eq!(coerce(Value::F64(2.5), TyTag::I16), Ok(Value::I16(2)));
        assert_eq!(coerce(Value::F64(3.5), TyTag::I16), Ok(Value::I16(4)));
        assert_eq!(coerce(Value::F64(-2.5), TyTag::I16), Ok(Value::I16(-2)));
        assert_eq!(coerce(Value::F64(2.4), TyTag::I16), Ok(Value::I16(2)));
        assert_eq!(coerce(Value::F64(2.6), TyTag::I16), Ok(Value::I16(3)));
    }

    #[test]
    fn test_narrowing_overflow() {
        assert_eq!(coerce(Value::I32(40000), TyTag::I16), Err(RuntimeError::Overflow));
        assert_eq!(coerce(Value::F64(-1.0), TyTag::U32), Err(RuntimeError::Overflow));
        assert_eq!(coerce(Value::I16(-1), TyTag::U32), Err(RuntimeError::Overflow));
    }

    #[test]
    fn test_widening_is_exact() {
        assert_eq!(coerce(Value::I16(-5), TyTag::I64), Ok(Value::I64(-5)));
        assert_eq!(coerce(Value::I64(i64::MAX), TyTag::I64), Ok(Value::I64(i64::MAX)));
        assert_eq!(coerce(Value::U32(u32::MAX), TyTag::I64), Ok(Value::I64(u32::MAX as i64)));
    }

    #[test]
    fn test_fixed_string_pads_and_truncates() {
        assert_eq!(
            coerce(Value::Str(b"ab".to_vec()), TyTag::FixedStr(4)),
            Ok(Value::Str(b"ab  ".to_vec()))
        );
        assert_eq!(
            coerce(Value::Str(b"toolong".to_vec()), TyTag::FixedStr(4)),
            Ok(Value::Str(b"tool".to_vec()))
        );
    }

    #[test]
    fn test_string_number_mix_is_type_error() {
        assert!(matches!(
            coerce(Value::Str(b"x".to_vec()), TyTag::I16),
            Err(RuntimeError::TypeMismatch(_))
        ));
        assert!(matches!(
            coerce(Value::I16(1), TyTag::Str),
            Err(RuntimeError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_fix_truncates_toward_zero() {
        assert_eq!(fix_trunc(&Value::F64(2.9)), Ok(Value::F64(2.0)));
        assert_eq!(fix_trunc(&Value::F64(-2.9)), Ok(Value::F64(-2.0)));
        assert_eq!(fix_trunc(&Value::I16(7)), Ok(Value::I16(7)));
    }

    #[test]
    fn test_display_digits() {
        assert_eq!(Value::I16(42).display_digits().unwrap(), "42");
        assert_eq!(Value::I16(-42).display_digits().unwrap(), "42");
        assert_eq!(Value::F32(1.5).display_digits().unwrap(), "1.5");
        assert_eq!(Value::F32(2.0).display_digits().unwrap(), "2");
        assert_eq!(Value::F64(0.5).display_digits().unwrap(), ".5");
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_value(TyTag::I32, &[]), Value::I32(0));
        assert_eq!(default_value(TyTag::Str, &[]), Value::Str(Vec::new()));
        assert_eq!(
            default_value(TyTag::FixedStr(3), &[]),
            Value::Str(vec![0, 0, 0])
        );
        let records = vec![qbc_emit::RecordEntry {
            name: "P".into(),
            fields: vec![("X".into(), TyTag::F32), ("S".into(), TyTag::FixedStr(2))],
        }];
        let rec = default_value(TyTag::Record(0), &records);
        match rec {
            Value::Record { type_id: 0, fields } => {
                assert_eq!(fields[0], Value::F32(0.0));
                assert_eq!(fields[1], Value::Str(vec![0, 0]));
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn test_is_true() {
        assert!(Value::I16(-1).is_true().unwrap());
        assert!(!Value::I16(0).is_true().unwrap());
        assert!(Value::F64(0.25).is_true().unwrap());
    }

    #[test]
    fn test_i64_precision_preserved() {
        let big = i64::MAX - 1;
        assert_eq!(coerce(Value::I64(big), TyTag::I64), Ok(Value::I64(big)));
    }
}
