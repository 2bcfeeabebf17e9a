use std::os::raw::c_int;
use std::slice::from_raw_parts;

use super::{FromSqlError, FromSqlResult, Type, Value};
use crate::ffi;

/// A non-owning [dynamic type value](http://sqlite.org/datatype3.html).
/// Typically the memory backing this value is owned by SQLite and is only
/// valid for the duration of one callback or one row step.
///
/// Text is kept as raw bytes; [`ValueRef::as_str`] validates UTF-8 lazily so a
/// malformed string never aborts a callback.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ValueRef<'a> {
    Null,
    Integer(i64),
    Real(f64),
    Text(&'a [u8]),
    Blob(&'a [u8]),
}

impl<'a> ValueRef<'a> {
    /// Returns SQLite fundamental datatype.
    #[inline]
    #[must_use]
    pub fn data_type(&self) -> Type {
        match *self {
            ValueRef::Null => Type::Null,
            ValueRef::Integer(_) => Type::Integer,
            ValueRef::Real(_) => Type::Real,
            ValueRef::Text(_) => Type::Text,
            ValueRef::Blob(_) => Type::Blob,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> FromSqlResult<i64> {
        match *self {
            ValueRef::Integer(i) => Ok(i),
            _ => Err(FromSqlError::InvalidType),
        }
    }

    /// Integers are widened to `f64`, everything else is a type error.
    #[inline]
    pub fn as_f64(&self) -> FromSqlResult<f64> {
        match *self {
            ValueRef::Real(f) => Ok(f),
            ValueRef::Integer(i) => Ok(i as f64),
            _ => Err(FromSqlError::InvalidType),
        }
    }

    #[inline]
    pub fn as_str(&self) -> FromSqlResult<&'a str> {
        match *self {
            ValueRef::Text(t) => {
                std::str::from_utf8(t).map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }

    #[inline]
    pub fn as_blob(&self) -> FromSqlResult<&'a [u8]> {
        match *self {
            ValueRef::Blob(b) => Ok(b),
            _ => Err(FromSqlError::InvalidType),
        }
    }

    /// Copies the value out of SQLite-owned memory.
    pub fn to_owned_value(&self) -> FromSqlResult<Value> {
        Ok(match *self {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(_) => Value::Text(self.as_str()?.to_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }

    /// Decodes a `sqlite3_value` handed to a function callback.
    pub(crate) unsafe fn from_value(value: *mut ffi::sqlite3_value) -> ValueRef<'a> {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_value_int64(value)),
            ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_value_double(value)),
            ffi::SQLITE_TEXT => {
                let text = ffi::sqlite3_value_text(value);
                let len = ffi::sqlite3_value_bytes(value);
                ValueRef::Text(bytes(text, len))
            }
            ffi::SQLITE_BLOB => {
                let blob = ffi::sqlite3_value_blob(value);
                let len = ffi::sqlite3_value_bytes(value);
                ValueRef::Blob(bytes(blob.cast(), len))
            }
            _ => ValueRef::Null,
        }
    }

    /// Decodes column `col` of the current row of `stmt`.
    pub(crate) unsafe fn from_column(stmt: *mut ffi::sqlite3_stmt, col: c_int) -> ValueRef<'a> {
        match ffi::sqlite3_column_type(stmt, col) {
            ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_column_int64(stmt, col)),
            ffi::SQLITE_FLOAT => ValueRef::Real(ffi::sqlite3_column_double(stmt, col)),
            ffi::SQLITE_TEXT => {
                let text = ffi::sqlite3_column_text(stmt, col);
                let len = ffi::sqlite3_column_bytes(stmt, col);
                ValueRef::Text(bytes(text, len))
            }
            ffi::SQLITE_BLOB => {
                let blob = ffi::sqlite3_column_blob(stmt, col);
                let len = ffi::sqlite3_column_bytes(stmt, col);
                ValueRef::Blob(bytes(blob.cast(), len))
            }
            _ => ValueRef::Null,
        }
    }
}

// A zero-length text or blob may come back as a NULL pointer.
unsafe fn bytes<'a>(data: *const u8, len: c_int) -> &'a [u8] {
    if data.is_null() || len <= 0 {
        &[]
    } else {
        from_raw_parts(data, len as usize)
    }
}

impl<'a> From<&'a str> for ValueRef<'a> {
    #[inline]
    fn from(s: &str) -> ValueRef<'_> {
        ValueRef::Text(s.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for ValueRef<'a> {
    #[inline]
    fn from(s: &[u8]) -> ValueRef<'_> {
        ValueRef::Blob(s)
    }
}

impl<'a> From<&'a Value> for ValueRef<'a> {
    #[inline]
    fn from(value: &'a Value) -> ValueRef<'a> {
        match *value {
            Value::Null => ValueRef::Null,
            Value::Integer(i) => ValueRef::Integer(i),
            Value::Real(r) => ValueRef::Real(r),
            Value::Text(ref s) => ValueRef::Text(s.as_bytes()),
            Value::Blob(ref b) => ValueRef::Blob(b),
        }
    }
}
