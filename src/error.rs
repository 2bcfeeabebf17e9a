use std::error;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::str;

use crate::registry::HookKind;
use crate::types::{FromSqlError, Type};
use crate::{errmsg_to_string, ffi};

/// Errors produced while opening connections, running statements, or
/// registering and invoking callbacks.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error from an underlying SQLite call. The status code is the one
    /// SQLite returned, unmodified.
    #[error("{}", describe_failure(.0, .1))]
    SqliteFailure(ffi::Error, Option<String>),

    /// SQLite was compiled or configured for single-threaded use only.
    #[error("SQLite was compiled or configured for single-threaded use only")]
    SqliteSingleThreadedMode,

    /// A function name was rejected before reaching SQLite.
    #[error("Invalid function name: {0:?}")]
    InvalidFunctionName(String),

    /// A function arity outside `-1..` was rejected before reaching SQLite.
    #[error("Invalid function argument count: {0}")]
    InvalidArity(i32),

    /// A collation name was rejected before reaching SQLite.
    #[error("Invalid collation name: {0:?}")]
    InvalidCollationName(String),

    /// A tokenizer module or tokenizer name was rejected before reaching
    /// SQLite.
    #[error("Invalid tokenizer name: {0:?}")]
    InvalidTokenizerName(String),

    /// A registered closure panicked. The panic was contained at the callback
    /// boundary and the hook's neutral result was handed back to SQLite.
    #[error("{hook} callback panicked")]
    UnwindingPanic { hook: HookKind },

    /// A registered closure was re-entered on the same thread while it was
    /// already running.
    #[error("{hook} callback re-entered while already running")]
    ReentrantCallback { hook: HookKind },

    /// A tokenizer closure reported a token outside of the text it was given.
    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },

    /// An error returned by a user-defined function.
    #[error(transparent)]
    UserFunctionError(Box<dyn error::Error + Send + Sync + 'static>),

    /// Error returned by `functions::Context::get` when the function argument
    /// cannot be converted to the requested type.
    #[error("Invalid function parameter type {1} at index {0}")]
    InvalidFunctionParameterType(usize, Type),

    /// SQLite gave us an integral value outside the range of the requested
    /// type.
    #[error("Integer {1} out of range at index {0}")]
    IntegralValueOutOfRange(usize, i64),

    /// Error converting a string to UTF-8.
    #[error(transparent)]
    Utf8Error(#[from] str::Utf8Error),

    /// Error converting a string to a C-compatible string because it contained
    /// an embedded nul.
    #[error(transparent)]
    NulError(#[from] std::ffi::NulError),

    /// Error converting a file path to a string.
    #[error("Invalid path: {}", .0.to_string_lossy())]
    InvalidPath(PathBuf),

    /// An `execute` call returned rows.
    #[error("Execute returned results - did you mean to call query?")]
    ExecuteReturnedResults,

    /// A query that was expected to return at least one row did not return
    /// any.
    #[error("Query returned no rows")]
    QueryReturnedNoRows,

    /// A column index is out of range for the statement.
    #[error("Invalid column index: {0}")]
    InvalidColumnIndex(usize),

    /// The value of a column cannot be converted to the requested Rust type.
    #[error("Invalid column type {1} at index: {0}")]
    InvalidColumnType(usize, Type),

    /// The number of bound parameters does not match the number of
    /// parameters in the query. Given first, expected second.
    #[error("Wrong number of parameters passed to query. Got {0}, needed {1}")]
    InvalidParameterCount(usize, usize),

    /// A value could not be converted for use as a parameter or result.
    #[error(transparent)]
    ToSqlConversionFailure(Box<dyn error::Error + Send + Sync + 'static>),

    /// A column value of type `Type` could not be converted by a
    /// [`FromSql`](crate::types::FromSql) implementation.
    #[error("Conversion error from type {1} at index: {0}, {2}")]
    FromSqlConversionFailure(usize, Type, #[source] Box<dyn error::Error + Send + Sync + 'static>),
}

fn describe_failure(err: &ffi::Error, message: &Option<String>) -> String {
    match message {
        Some(s) => s.clone(),
        None => err.to_string(),
    }
}

impl Error {
    /// The primary SQLite error code, if this is a SQLite failure.
    #[inline]
    #[must_use]
    pub fn sqlite_error_code(&self) -> Option<ffi::ErrorCode> {
        match self {
            Error::SqliteFailure(err, _) => Some(err.code),
            _ => None,
        }
    }

    /// The (extended) status code SQLite returned, if this is a SQLite
    /// failure.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> Option<c_int> {
        match self {
            Error::SqliteFailure(err, _) => Some(err.extended_code),
            _ => None,
        }
    }
}

const UNKNOWN_COLUMN: usize = usize::MAX;

impl From<FromSqlError> for Error {
    fn from(err: FromSqlError) -> Error {
        match err {
            FromSqlError::OutOfRange(val) => Error::IntegralValueOutOfRange(UNKNOWN_COLUMN, val),
            FromSqlError::InvalidType => Error::InvalidColumnType(UNKNOWN_COLUMN, Type::Null),
            FromSqlError::Other(source) => {
                Error::FromSqlConversionFailure(UNKNOWN_COLUMN, Type::Null, source)
            }
        }
    }
}

// These are public but not re-exported by lib.rs, so only visible within crate.

#[cold]
pub fn error_from_sqlite_code(code: c_int, message: Option<String>) -> Error {
    Error::SqliteFailure(ffi::Error::new(code), message)
}

#[cold]
pub unsafe fn error_from_handle(db: *mut ffi::sqlite3, code: c_int) -> Error {
    let message = if db.is_null() {
        None
    } else {
        Some(errmsg_to_string(ffi::sqlite3_errmsg(db)))
    };
    error_from_sqlite_code(code, message)
}

macro_rules! check {
    ($funcall:expr) => {{
        let rc = $funcall;
        if rc != crate::ffi::SQLITE_OK {
            return Err(crate::error::error_from_sqlite_code(rc, None).into());
        }
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_code_is_passed_through() {
        let err = error_from_sqlite_code(ffi::SQLITE_BUSY, None);
        assert_eq!(err.status_code(), Some(ffi::SQLITE_BUSY));
        assert_eq!(err.sqlite_error_code(), Some(ffi::ErrorCode::DatabaseBusy));

        let extended = ffi::SQLITE_CONSTRAINT | (2 << 8);
        let err = error_from_sqlite_code(extended, Some("vetoed".to_owned()));
        assert_eq!(err.status_code(), Some(extended));
        assert_eq!(err.to_string(), "vetoed");
    }

    #[test]
    fn callback_errors_have_no_status_code() {
        let err = Error::UnwindingPanic {
            hook: HookKind::Commit,
        };
        assert_eq!(err.status_code(), None);
        assert_eq!(err.to_string(), "commit callback panicked");
    }
}
