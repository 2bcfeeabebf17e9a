//! Create or redefine SQL scalar functions.
//!
//! # Example
//!
//! Adding a `regexp` function to a connection in which compiled regular
//! expressions are cached in a `HashMap`.
//!
//! ```rust
//! use regex::Regex;
//! use sqlhooks::functions::FunctionFlags;
//! use sqlhooks::{params, Connection, Error, Result};
//! use std::collections::HashMap;
//!
//! fn add_regexp_function(db: &Connection) -> Result<()> {
//!     let mut cached_regexes = HashMap::new();
//!     db.create_scalar_function(
//!         "regexp",
//!         2,
//!         FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
//!         move |ctx| {
//!             let regex_s = ctx.get::<String>(0)?;
//!             let entry = cached_regexes.entry(regex_s.clone());
//!             let regex = {
//!                 use std::collections::hash_map::Entry::{Occupied, Vacant};
//!                 match entry {
//!                     Occupied(occ) => occ.into_mut(),
//!                     Vacant(vac) => match Regex::new(&regex_s) {
//!                         Ok(r) => vac.insert(r),
//!                         Err(err) => return Err(Error::UserFunctionError(Box::new(err))),
//!                     },
//!                 }
//!             };
//!
//!             let text = ctx.get::<String>(1)?;
//!             Ok(regex.is_match(&text))
//!         },
//!     )
//! }
//!
//! fn main() -> Result<()> {
//!     let db = Connection::open_in_memory()?;
//!     add_regexp_function(&db)?;
//!
//!     let is_match: bool = db.query_row(
//!         "SELECT regexp('[aeiou]*', 'aaaaeeeiii')",
//!         params![],
//!         |row| row.get(0),
//!     )?;
//!
//!     assert!(is_match);
//!     Ok(())
//! }
//! ```
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::ffi;
use crate::ffi::sqlite3_context;
use crate::ffi::sqlite3_value;
use crate::inner_connection::InnerConnection;
use crate::registry::{self, release_context, Hook, HookKind, Outcome, SlotKey};
use crate::types::{FromSql, FromSqlError, ToSql, ToSqlOutput, Type, Value, ValueRef};
use crate::{len_as_c_int, str_to_cstring, Connection, Error, Result};

/// Longest function name SQLite accepts, in bytes.
const MAX_FUNCTION_NAME_LEN: usize = 255;

unsafe fn set_result(ctx: *mut sqlite3_context, value: ValueRef<'_>) {
    match value {
        ValueRef::Null => ffi::sqlite3_result_null(ctx),
        ValueRef::Integer(i) => ffi::sqlite3_result_int64(ctx, i),
        ValueRef::Real(r) => ffi::sqlite3_result_double(ctx, r),
        ValueRef::Text(s) => match len_as_c_int(s.len()) {
            Ok(length) => ffi::sqlite3_result_text(
                ctx,
                s.as_ptr().cast(),
                length,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        },
        ValueRef::Blob(b) => match len_as_c_int(b.len()) {
            Ok(0) => ffi::sqlite3_result_zeroblob(ctx, 0),
            Ok(length) => ffi::sqlite3_result_blob(
                ctx,
                b.as_ptr().cast::<c_void>(),
                length,
                ffi::SQLITE_TRANSIENT(),
            ),
            Err(_) => ffi::sqlite3_result_error_toobig(ctx),
        },
    }
}

unsafe fn report_error(ctx: *mut sqlite3_context, message: &str) {
    match len_as_c_int(message.len()) {
        Ok(len) => ffi::sqlite3_result_error(ctx, message.as_ptr().cast(), len),
        Err(_) => ffi::sqlite3_result_error_toobig(ctx),
    }
}

/// Context is a wrapper for the SQLite function evaluation context.
///
/// Arguments borrow SQLite's memory and are only valid during the call.
pub struct Context<'a> {
    args: SmallVec<[ValueRef<'a>; 8]>,
}

impl Context<'_> {
    /// Returns the number of arguments to the function.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns `true` when there is no argument.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns the `idx`th argument as a `T`.
    ///
    /// # Failure
    ///
    /// Will return Err if `idx` is out of range or if the underlying SQLite
    /// type cannot be converted to a `T`.
    pub fn get<T: FromSql>(&self, idx: usize) -> Result<T> {
        let Some(&value) = self.args.get(idx) else {
            return Err(Error::InvalidFunctionParameterType(idx, Type::Null));
        };
        FromSql::column_result(value).map_err(|err| match err {
            FromSqlError::InvalidType => {
                Error::InvalidFunctionParameterType(idx, value.data_type())
            }
            FromSqlError::OutOfRange(i) => Error::IntegralValueOutOfRange(idx, i),
            FromSqlError::Other(err) => {
                Error::FromSqlConversionFailure(idx, value.data_type(), err)
            }
        })
    }

    /// Returns the `idx`th argument as a `ValueRef`.
    ///
    /// # Failure
    ///
    /// Will panic if `idx` is greater than or equal to
    /// [`self.len()`](Context::len).
    #[inline]
    #[must_use]
    pub fn get_raw(&self, idx: usize) -> ValueRef<'_> {
        self.args[idx]
    }
}

bitflags! {
    /// Function Flags.
    /// See [sqlite3_create_function](https://sqlite.org/c3ref/create_function.html)
    /// and [Function Flags](https://sqlite.org/c3ref/c_deterministic.html) for details.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FunctionFlags: c_int {
        /// Specifies UTF-8 as the text encoding this SQL function prefers for its parameters.
        const SQLITE_UTF8 = ffi::SQLITE_UTF8;
        /// Specifies UTF-16 using little-endian byte order as the text encoding this SQL function prefers for its parameters.
        const SQLITE_UTF16LE = ffi::SQLITE_UTF16LE;
        /// Specifies UTF-16 using big-endian byte order as the text encoding this SQL function prefers for its parameters.
        const SQLITE_UTF16BE = ffi::SQLITE_UTF16BE;
        /// Specifies UTF-16 using native byte order as the text encoding this SQL function prefers for its parameters.
        const SQLITE_UTF16 = ffi::SQLITE_UTF16;
        /// Means that the function always gives the same output when the input parameters are the same.
        const SQLITE_DETERMINISTIC = ffi::SQLITE_DETERMINISTIC;
        /// Means that the function may only be invoked from top-level SQL.
        const SQLITE_DIRECTONLY = 0x0000_0008_0000;
        /// Indicates to SQLite that a function is unlikely to cause problems even if misused.
        const SQLITE_INNOCUOUS = 0x0000_0020_0000;
    }
}

impl Default for FunctionFlags {
    #[inline]
    fn default() -> FunctionFlags {
        FunctionFlags::SQLITE_UTF8
    }
}

impl Connection {
    /// Attach a user-defined scalar function to
    /// this database connection.
    ///
    /// `fn_name` is the name the function will be accessible from SQL.
    /// `n_arg` is the number of arguments to the function. Use `-1` for a
    /// variable number. If the function always returns the same value
    /// given the same input, `flags` should include
    /// [`FunctionFlags::SQLITE_DETERMINISTIC`].
    ///
    /// Registering a function with the same name (ignoring ASCII case) and
    /// arity as an existing one replaces it and releases the old closure.
    /// The function will remain available until the connection is closed or
    /// until it is explicitly removed via
    /// [`remove_function`](Connection::remove_function).
    ///
    /// An `Err` or a panic from `x_func` makes the SQL statement fail with
    /// the error's message; the error itself is kept for
    /// [`take_callback_error`](Connection::take_callback_error).
    ///
    /// # Failure
    ///
    /// Will return `Err` if the name or arity is invalid, or with SQLite's
    /// own status code if the function could not be attached to the
    /// connection.
    pub fn create_scalar_function<F, T>(
        &self,
        fn_name: &str,
        n_arg: c_int,
        flags: FunctionFlags,
        x_func: F,
    ) -> Result<()>
    where
        F: FnMut(&Context<'_>) -> Result<T> + Send + 'static,
        T: ToSql,
    {
        self.db
            .borrow_mut()
            .create_scalar_function(fn_name, n_arg, flags, x_func)
    }

    /// Removes a user-defined function from this database connection.
    ///
    /// `fn_name` and `n_arg` should match the name and number of arguments
    /// given to [`create_scalar_function`](Connection::create_scalar_function).
    /// Every text encoding variant registered under that name and arity is
    /// removed.
    ///
    /// # Failure
    ///
    /// Will return Err if the function could not be removed.
    pub fn remove_function(&self, fn_name: &str, n_arg: c_int) -> Result<()> {
        self.db.borrow_mut().remove_function(fn_name, n_arg)
    }
}

fn validate_function(fn_name: &str, n_arg: c_int) -> Result<()> {
    if fn_name.is_empty() || fn_name.len() > MAX_FUNCTION_NAME_LEN || fn_name.contains('\0') {
        return Err(Error::InvalidFunctionName(fn_name.to_owned()));
    }
    if n_arg < -1 {
        return Err(Error::InvalidArity(n_arg));
    }
    Ok(())
}

fn into_value(output: ToSqlOutput<'_>) -> Result<Value> {
    match output {
        ToSqlOutput::Owned(value) => Ok(value),
        ToSqlOutput::Borrowed(value) => Ok(value.to_owned_value()?),
    }
}

impl InnerConnection {
    fn create_scalar_function<F, T>(
        &mut self,
        fn_name: &str,
        n_arg: c_int,
        flags: FunctionFlags,
        mut x_func: F,
    ) -> Result<()>
    where
        F: FnMut(&Context<'_>) -> Result<T> + Send + 'static,
        T: ToSql,
    {
        validate_function(fn_name, n_arg)?;
        let c_name = str_to_cstring(fn_name)?;
        let hook = Hook::Function(Box::new(move |ctx: &Context<'_>| {
            let t = x_func(ctx)?;
            into_value(t.to_sql()?)
        }));
        self.install_hook(
            SlotKey::function(fn_name, n_arg),
            Some(hook),
            |db, token| unsafe {
                ffi::sqlite3_create_function_v2(
                    db,
                    c_name.as_ptr(),
                    n_arg,
                    flags.bits(),
                    token.map_or(ptr::null_mut(), |t| t.as_ptr()),
                    Some(call_scalar),
                    None,
                    None,
                    Some(release_context),
                )
            },
        )
    }

    fn remove_function(&mut self, fn_name: &str, n_arg: c_int) -> Result<()> {
        validate_function(fn_name, n_arg)?;
        let c_name = str_to_cstring(fn_name)?;
        self.install_hook(SlotKey::function(fn_name, n_arg), None, |db, _| unsafe {
            ffi::sqlite3_create_function_v2(
                db,
                c_name.as_ptr(),
                n_arg,
                // Deletes the UTF-8, UTF-16LE and UTF-16BE variants.
                ffi::SQLITE_ANY,
                ptr::null_mut(),
                None,
                None,
                None,
                None,
            )
        })
    }
}

unsafe extern "C" fn call_scalar(
    ctx: *mut sqlite3_context,
    argc: c_int,
    argv: *mut *mut sqlite3_value,
) {
    let args: &[*mut sqlite3_value] = if argv.is_null() || argc <= 0 {
        &[]
    } else {
        slice::from_raw_parts(argv, argc as usize)
    };
    let context = Context {
        args: args.iter().map(|&v| ValueRef::from_value(v)).collect(),
    };
    let outcome = registry::call(
        ffi::sqlite3_user_data(ctx),
        HookKind::Function,
        |hook| match hook {
            Hook::Function(f) => f(&context),
            _ => Ok(Value::Null),
        },
    );
    match outcome {
        Outcome::Returned(value) => set_result(ctx, ValueRef::from(&value)),
        Outcome::Absent => report_error(ctx, "function is no longer registered"),
        Outcome::Failed(message) => report_error(ctx, &message),
    }
}
