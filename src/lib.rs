//! Register Rust closures as SQLite's native callbacks.
//!
//! SQLite lets an application install a busy handler, a trace callback,
//! update/commit/rollback hooks, scalar SQL functions, collations and FTS3
//! tokenizers, each as a C function pointer plus an opaque `void*`. This crate
//! fills those slots with fixed `extern "C"` trampolines and keeps the Rust
//! closures in a process-wide registry, so the library only ever holds an
//! integer token.
//!
//! ```rust,no_run
//! use sqlhooks::{params, Action, Connection, Result};
//!
//! fn main() -> Result<()> {
//!     let conn = Connection::open_in_memory()?;
//!     conn.update_hook(Some(|action: Action, _db: &str, table: &str, rowid: i64| {
//!         println!("{action:?} {table} {rowid}");
//!     }))?;
//!     conn.execute_batch("CREATE TABLE foo(x)")?;
//!     conn.execute("INSERT INTO foo VALUES (?1)", params![42])?;
//!     Ok(())
//! }
//! ```

pub use libsqlite3_sys as ffi;

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::{c_char, c_int};
use std::path::Path;
use std::result;

use bitflags::bitflags;

use crate::inner_connection::InnerConnection;
use crate::types::ToSql;

pub use crate::error::Error;
pub use crate::ffi::ErrorCode;
pub use crate::fts::{fts4_table_sql, Tokenizer};
pub use crate::functions::{Context, FunctionFlags};
pub use crate::hooks::Action;
pub use crate::registry::HookKind;
pub use crate::row::{MappedRows, Row, Rows};
pub use crate::statement::Statement;
pub use crate::transaction::{DropBehavior, Savepoint, Transaction, TransactionBehavior};

#[macro_use]
mod error;

mod busy;
mod collation;
pub mod fts;
pub mod functions;
mod hooks;
mod inner_connection;
mod raw_statement;
mod registry;
mod row;
mod statement;
mod tokenizer;
mod trace;
mod transaction;
pub mod types;

/// A macro making it more convenient to pass heterogeneous or long lists of
/// parameters as a `&[&dyn ToSql]`.
///
/// # Example
///
/// ```rust,no_run
/// # use sqlhooks::{Result, Connection, params};
/// fn add_person(conn: &Connection, name: &str, age: u8) -> Result<()> {
///     conn.execute(
///         "INSERT INTO person (name, age_in_years) VALUES (?1, ?2)",
///         params![name, age],
///     )?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! params {
    () => {
        &[] as &[&dyn $crate::types::ToSql]
    };
    ($($param:expr),+ $(,)?) => {
        &[$(&$param as &dyn $crate::types::ToSql),+] as &[&dyn $crate::types::ToSql]
    };
}

/// A typedef of the result returned by many methods.
pub type Result<T, E = Error> = result::Result<T, E>;

unsafe fn errmsg_to_string(errmsg: *const c_char) -> String {
    let c_slice = CStr::from_ptr(errmsg).to_bytes();
    String::from_utf8_lossy(c_slice).into_owned()
}

fn str_to_cstring(s: &str) -> Result<CString> {
    Ok(CString::new(s)?)
}

/// Returns `Ok((string ptr, len as c_int, SQLITE_STATIC | SQLITE_TRANSIENT))`
/// normally.
/// Returns error if the string is too large for sqlite.
/// The `sqlite3_destructor_type` item is always `SQLITE_TRANSIENT` unless
/// the string was empty (in which case it's `SQLITE_STATIC`, and the ptr is
/// static).
fn str_for_sqlite(s: &[u8]) -> Result<(*const c_char, c_int, ffi::sqlite3_destructor_type)> {
    let len = len_as_c_int(s.len())?;
    let (ptr, dtor_info) = if len != 0 {
        (s.as_ptr().cast::<c_char>(), ffi::SQLITE_TRANSIENT())
    } else {
        // Return a pointer guaranteed to live forever
        ("".as_ptr().cast::<c_char>(), ffi::SQLITE_STATIC())
    };
    Ok((ptr, len, dtor_info))
}

// Helper to cast to c_int safely, returning the correct error type if the cast
// failed.
fn len_as_c_int(len: usize) -> Result<c_int> {
    if len >= (c_int::MAX as usize) {
        Err(Error::SqliteFailure(
            ffi::Error::new(ffi::SQLITE_TOOBIG),
            None,
        ))
    } else {
        Ok(len as c_int)
    }
}

#[cfg(unix)]
fn path_to_cstring(p: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    Ok(CString::new(p.as_os_str().as_bytes())?)
}

#[cfg(not(unix))]
fn path_to_cstring(p: &Path) -> Result<CString> {
    let s = p.to_str().ok_or_else(|| Error::InvalidPath(p.to_owned()))?;
    Ok(CString::new(s)?)
}

/// Where a database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    /// A private, temporary in-memory database, freed when the connection
    /// closes.
    InMemory,
    /// A private, temporary on-disk database, deleted when the connection
    /// closes.
    Temporary,
    /// A database located at the given URI filename (or path).
    ///
    /// See <https://www.sqlite.org/uri.html>.
    Uri(String),
}

impl Location {
    fn as_str(&self) -> &str {
        match self {
            Location::InMemory => ":memory:",
            Location::Temporary => "",
            Location::Uri(uri) => uri,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection to a SQLite database.
///
/// Every callback registered through a connection is owned by it: replacing
/// a callback releases the old closure, and closing or dropping the
/// connection releases all of them before the native handle goes away.
pub struct Connection {
    db: RefCell<InnerConnection>,
}

unsafe impl Send for Connection {}

impl Connection {
    /// Open a new connection to a SQLite database. If a database does not
    /// exist at the path, one is created.
    ///
    /// `Connection::open(path)` is equivalent to
    /// `Connection::open_with_flags(path, OpenFlags::default())`.
    ///
    /// # Failure
    ///
    /// Will return `Err` if `path` cannot be converted to a C-compatible string
    /// or if the underlying SQLite open call fails.
    #[inline]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
        Connection::open_with_flags(path, OpenFlags::default())
    }

    /// Open a new connection to an in-memory SQLite database.
    #[inline]
    pub fn open_in_memory() -> Result<Connection> {
        Connection::open_location(Location::InMemory)
    }

    /// Open a new connection to the database at `location` with the default
    /// flags.
    #[inline]
    pub fn open_location(location: Location) -> Result<Connection> {
        Connection::open_location_with_flags(location, OpenFlags::default())
    }

    /// Open a read-only connection to an existing database.
    #[inline]
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Open a new connection to a SQLite database.
    ///
    /// [Database Connection](http://www.sqlite.org/c3ref/open.html) for a
    /// description of valid flag combinations.
    pub fn open_with_flags<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<Connection> {
        let c_path = path_to_cstring(path.as_ref())?;
        InnerConnection::open_with_flags(&c_path, flags).map(|db| Connection {
            db: RefCell::new(db),
        })
    }

    /// Open a new connection to the database at `location`.
    pub fn open_location_with_flags(location: Location, flags: OpenFlags) -> Result<Connection> {
        let c_path = str_to_cstring(location.as_str())?;
        InnerConnection::open_with_flags(&c_path, flags).map(|db| Connection {
            db: RefCell::new(db),
        })
    }

    /// Create a `Connection` from a raw handle.
    ///
    /// The handle is not closed when the `Connection` is dropped, but every
    /// callback registered through it is released.
    ///
    /// # Safety
    ///
    /// This function is unsafe because improper use may impact the Connection.
    /// The handle must stay open for as long as the returned `Connection`
    /// lives.
    pub unsafe fn from_handle(db: *mut ffi::sqlite3) -> Result<Connection> {
        if db.is_null() {
            return Err(error::error_from_sqlite_code(ffi::SQLITE_MISUSE, None));
        }
        Ok(Connection {
            db: RefCell::new(InnerConnection::new(db, false)),
        })
    }

    /// Get access to the underlying SQLite database connection handle.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it gives you raw access
    /// to the SQLite connection, and what you do with it could impact the
    /// safety of this `Connection`.
    #[inline]
    pub unsafe fn handle(&self) -> *mut ffi::sqlite3 {
        self.db.borrow().db()
    }

    /// Close the SQLite connection.
    ///
    /// This is functionally equivalent to the `Drop` implementation for
    /// `Connection` except that on failure, it returns an error and the
    /// connection itself (presumably so closing can be attempted again).
    /// Callbacks are released even when closing fails.
    #[inline]
    pub fn close(self) -> result::Result<(), (Connection, Error)> {
        let r = self.db.borrow_mut().close();
        r.map_err(move |err| (self, err))
    }

    /// Convenience method to run multiple SQL statements (that cannot take any
    /// parameters).
    ///
    /// # Failure
    ///
    /// Will return `Err` if `sql` cannot be converted to a C-compatible string
    /// or if the underlying SQLite call fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.borrow().execute_batch(sql)
    }

    /// Convenience method to prepare and execute a single SQL statement.
    ///
    /// On success, returns the number of rows that were changed or inserted
    /// or deleted.
    #[inline]
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        self.prepare(sql)
            .and_then(|mut stmt| stmt.execute(params))
    }

    /// Convenience method to execute a query that is expected to return a
    /// single row.
    ///
    /// Returns `Err(QueryReturnedNoRows)` if no results are returned. If the
    /// query truly is optional, you can call `.optional()` on the result of
    /// this to get a `Result<Option<T>>`.
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], f: F) -> Result<T>
    where
        F: FnOnce(&Row<'_>) -> Result<T>,
    {
        let mut stmt = self.prepare(sql)?;
        stmt.query_row(params, f)
    }

    /// Prepare a SQL statement for execution.
    #[inline]
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        self.db.borrow().prepare(self, sql)
    }

    /// Whether the main database was opened read-only.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.db.borrow().is_readonly()
    }

    /// Get the SQLite rowid of the most recent successful INSERT, or `None`
    /// if no row has been inserted yet.
    #[inline]
    pub fn last_insert_rowid(&self) -> Option<i64> {
        let rowid = self.db.borrow().last_insert_rowid();
        if rowid > 0 {
            Some(rowid)
        } else {
            None
        }
    }

    /// Number of rows modified by the most recently completed statement.
    #[inline]
    pub fn changes(&self) -> usize {
        self.db.borrow().changes()
    }

    /// Number of rows modified since the connection was opened.
    #[inline]
    pub fn total_changes(&self) -> usize {
        self.db.borrow().total_changes()
    }

    /// Test for auto-commit mode.
    #[inline]
    pub fn is_autocommit(&self) -> bool {
        self.db.borrow().is_autocommit()
    }

    /// Returns the path to the database file, if one exists and is known.
    /// In-memory and temporary databases have none.
    #[inline]
    pub fn path(&self) -> Option<String> {
        self.db.borrow().path()
    }

    /// Takes the first failure contained at a callback boundary since the
    /// last call: a closure that panicked, returned an error, was re-entered
    /// or produced an invalid token.
    #[inline]
    pub fn take_callback_error(&self) -> Option<Error> {
        registry::take_error(self.db.borrow().id)
    }

    /// Number of closures currently registered through this connection.
    #[inline]
    pub fn registered_hooks(&self) -> usize {
        registry::count(self.db.borrow().id)
    }

    #[inline]
    fn decode_result(&self, code: c_int) -> Result<()> {
        self.db.borrow().decode_result(code)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path())
            .finish()
    }
}

bitflags! {
    /// Flags for opening SQLite database connections.
    /// See [sqlite3_open_v2](http://www.sqlite.org/c3ref/open.html) for details.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: c_int {
        /// The database is opened in read-only mode.
        const SQLITE_OPEN_READ_ONLY = ffi::SQLITE_OPEN_READONLY;
        /// The database is opened for reading and writing if possible.
        const SQLITE_OPEN_READ_WRITE = ffi::SQLITE_OPEN_READWRITE;
        /// The database is created if it does not already exist.
        const SQLITE_OPEN_CREATE = ffi::SQLITE_OPEN_CREATE;
        /// The filename can be interpreted as a URI.
        const SQLITE_OPEN_URI = ffi::SQLITE_OPEN_URI;
        /// The database will be opened as an in-memory database.
        const SQLITE_OPEN_MEMORY = ffi::SQLITE_OPEN_MEMORY;
        /// The connection opens in the multi-thread threading mode.
        const SQLITE_OPEN_NO_MUTEX = ffi::SQLITE_OPEN_NOMUTEX;
        /// The connection opens in the serialized threading mode.
        const SQLITE_OPEN_FULL_MUTEX = ffi::SQLITE_OPEN_FULLMUTEX;
    }
}

impl Default for OpenFlags {
    #[inline]
    fn default() -> OpenFlags {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // this function is never called, but is still type checked; in
    // particular, calls with specific instantiations will require
    // that those types are `Send`.
    #[allow(dead_code, unconditional_recursion)]
    fn ensure_send<T: Send>() {
        ensure_send::<Connection>();
    }

    pub fn checked_memory_handle() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_open_locations() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("test.db3");

        let db = Connection::open(&path)?;
        db.execute_batch("CREATE TABLE foo(x INTEGER)")?;
        assert_eq!(db.path().map(|p| p.ends_with("test.db3")), Some(true));
        assert!(!db.is_readonly());
        db.close().map_err(|(_, e)| e)?;

        let ro = Connection::open_readonly(&path)?;
        assert!(ro.is_readonly());
        assert!(ro.execute_batch("INSERT INTO foo VALUES (1)").is_err());

        let tmp = Connection::open_location(Location::Temporary)?;
        assert_eq!(tmp.path(), None);
        let mem = Connection::open_location(Location::InMemory)?;
        assert_eq!(mem.path(), None);
        Ok(())
    }

    #[test]
    fn test_open_failure() {
        let filename = "no_such_file.db";
        let result = Connection::open_with_flags(filename, OpenFlags::SQLITE_OPEN_READ_ONLY);
        let err = result.unwrap_err();
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::CannotOpen));
        assert!(err.to_string().contains(filename));
    }

    #[test]
    fn test_rowid_and_changes() -> Result<()> {
        let db = checked_memory_handle();
        db.execute_batch("CREATE TABLE foo(x INTEGER PRIMARY KEY, y)")?;
        assert_eq!(db.last_insert_rowid(), None);

        db.execute("INSERT INTO foo(y) VALUES (?1)", params!["a"])?;
        db.execute("INSERT INTO foo(y) VALUES (?1)", params!["b"])?;
        assert_eq!(db.last_insert_rowid(), Some(2));
        assert_eq!(db.execute("UPDATE foo SET y = 'c'", params![])?, 2);
        assert_eq!(db.changes(), 2);
        assert_eq!(db.total_changes(), 4);

        let y: String = db.query_row("SELECT y FROM foo WHERE x = ?1", params![1], |r| r.get(0))?;
        assert_eq!(y, "c");
        assert!(matches!(
            db.query_row("SELECT y FROM foo WHERE x = 99", params![], |r| r.get::<String>(0)),
            Err(Error::QueryReturnedNoRows)
        ));
        Ok(())
    }

    #[test]
    fn test_is_autocommit() -> Result<()> {
        let db = checked_memory_handle();
        assert!(db.is_autocommit());
        db.execute_batch("BEGIN")?;
        assert!(!db.is_autocommit());
        db.execute_batch("ROLLBACK")?;
        Ok(())
    }

    #[test]
    fn test_drop_releases_callbacks() -> Result<()> {
        let db = checked_memory_handle();
        db.commit_hook(Some(|| true))?;
        db.trace(Some(|_: &str| {}))?;
        db.create_scalar_function("one", 0, FunctionFlags::default(), |_| Ok(1))?;
        assert_eq!(db.registered_hooks(), 3);
        let id = db.db.borrow().id;
        drop(db);
        assert_eq!(registry::count(id), 0);
        Ok(())
    }

    #[test]
    fn test_from_handle_leaves_handle_open() -> Result<()> {
        let db = checked_memory_handle();
        let handle = unsafe { db.handle() };
        {
            let borrowed = unsafe { Connection::from_handle(handle)? };
            borrowed.update_hook(Some(|_: Action, _: &str, _: &str, _: i64| {}))?;
            assert_eq!(borrowed.registered_hooks(), 1);
        }
        db.execute_batch("CREATE TABLE foo(x); INSERT INTO foo VALUES (1)")?;
        assert_eq!(db.registered_hooks(), 0);
        Ok(())
    }

    #[test]
    fn test_dropping_borrowed_handle_keeps_owner_hooks() -> Result<()> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let db = checked_memory_handle();
        db.execute_batch("CREATE TABLE foo(x)")?;
        let commits = Arc::new(AtomicUsize::new(0));
        let c = commits.clone();
        db.commit_hook(Some(move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        }))?;
        db.execute("INSERT INTO foo VALUES (?1)", params![1])?;
        assert_eq!(commits.load(Ordering::SeqCst), 1);

        {
            let _borrowed = unsafe { Connection::from_handle(db.handle())? };
        }
        db.execute("INSERT INTO foo VALUES (?1)", params![2])?;
        assert_eq!(commits.load(Ordering::SeqCst), 2);
        assert_eq!(db.registered_hooks(), 1);
        Ok(())
    }
}
