use std::os::raw::c_int;

use super::ffi;
use super::{len_as_c_int, str_for_sqlite};
use super::{Connection, Error, Result};
use crate::raw_statement::RawStatement;
use crate::row::{Row, Rows};
use crate::types::{ToSql, ValueRef};

/// A prepared statement.
pub struct Statement<'conn> {
    conn: &'conn Connection,
    pub(crate) stmt: RawStatement,
}

impl Statement<'_> {
    pub(crate) fn new(conn: &Connection, stmt: RawStatement) -> Statement<'_> {
        Statement { conn, stmt }
    }

    /// Executes the prepared statement and returns the number of rows that
    /// were changed, inserted or deleted.
    ///
    /// ## Failure
    ///
    /// Will return `Err` if binding parameters fails, the executed statement
    /// returns rows (in which case `query` should be used instead), or the
    /// underlying SQLite call fails.
    pub fn execute(&mut self, params: &[&dyn ToSql]) -> Result<usize> {
        self.bind_parameters(params)?;
        match self.step()? {
            false => Ok(self.conn.changes()),
            true => {
                self.reset();
                Err(Error::ExecuteReturnedResults)
            }
        }
    }

    /// Executes the prepared statement, returning a handle to the resulting
    /// rows.
    pub fn query(&mut self, params: &[&dyn ToSql]) -> Result<Rows<'_>> {
        self.bind_parameters(params)?;
        Ok(Rows::new(self))
    }

    /// Executes the prepared statement and passes the first row to `f`.
    ///
    /// Returns `Err(QueryReturnedNoRows)` if no results are returned.
    pub fn query_row<T, F>(&mut self, params: &[&dyn ToSql], f: F) -> Result<T>
    where
        F: FnOnce(&Row<'_>) -> Result<T>,
    {
        let mut rows = self.query(params)?;
        rows.get_expected_row().and_then(f)
    }

    /// Number of columns in the result set.
    pub fn column_count(&self) -> usize {
        self.stmt.column_count()
    }

    /// Steps once. `Ok(true)` means a row is available; `Ok(false)` means the
    /// statement ran to completion and was reset.
    pub(crate) fn step(&self) -> Result<bool> {
        if self.stmt.is_null() {
            return Ok(false);
        }
        match self.stmt.step() {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => {
                self.reset();
                Ok(false)
            }
            code => {
                let err = unsafe { crate::error::error_from_handle(self.conn.handle(), code) };
                self.reset();
                Err(err)
            }
        }
    }

    pub(crate) fn reset(&self) {
        if !self.stmt.is_null() {
            self.stmt.reset();
        }
    }

    fn bind_parameters(&mut self, params: &[&dyn ToSql]) -> Result<()> {
        let expected = if self.stmt.is_null() {
            0
        } else {
            self.stmt.bind_parameter_count()
        };
        if params.len() != expected {
            return Err(Error::InvalidParameterCount(params.len(), expected));
        }
        if expected > 0 {
            self.stmt.clear_bindings();
        }
        for (i, p) in params.iter().enumerate() {
            self.bind_parameter(*p, (i + 1) as c_int)?;
        }
        Ok(())
    }

    fn bind_parameter(&self, param: &dyn ToSql, col: c_int) -> Result<()> {
        let value = param.to_sql()?;
        let value = value.as_value_ref();
        let ptr = unsafe { self.stmt.ptr() };

        let rc = unsafe {
            match value {
                ValueRef::Null => ffi::sqlite3_bind_null(ptr, col),
                ValueRef::Integer(i) => ffi::sqlite3_bind_int64(ptr, col, i),
                ValueRef::Real(r) => ffi::sqlite3_bind_double(ptr, col, r),
                ValueRef::Text(s) => {
                    let (c_str, len, destructor) = str_for_sqlite(s)?;
                    ffi::sqlite3_bind_text(ptr, col, c_str, len, destructor)
                }
                ValueRef::Blob(b) => {
                    let length = len_as_c_int(b.len())?;
                    if length == 0 {
                        ffi::sqlite3_bind_zeroblob(ptr, col, 0)
                    } else {
                        ffi::sqlite3_bind_blob(
                            ptr,
                            col,
                            b.as_ptr().cast(),
                            length,
                            ffi::SQLITE_TRANSIENT(),
                        )
                    }
                }
            }
        };
        self.conn.decode_result(rc)
    }
}
