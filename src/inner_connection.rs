use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_char, c_int};
use std::ptr;

use tracing::{debug, error};

use super::ffi;
use super::str_for_sqlite;
use super::{Connection, OpenFlags, Result};
use crate::error::{error_from_handle, error_from_sqlite_code, Error};
use crate::raw_statement::RawStatement;
use crate::registry::{self, ConnectionId, Hook, SlotKey, Token};
use crate::statement::Statement;
use crate::tokenizer::ModuleDescriptor;

pub struct InnerConnection {
    pub db: *mut ffi::sqlite3,
    pub(crate) id: ConnectionId,
    // Module structs handed to `fts3_tokenizer()`, keyed by module name. SQLite
    // keeps raw pointers to them until the handle is closed.
    pub(crate) tokenizer_modules: HashMap<String, Box<ModuleDescriptor>>,
    owned: bool,
}

impl InnerConnection {
    pub unsafe fn new(db: *mut ffi::sqlite3, owned: bool) -> InnerConnection {
        InnerConnection {
            db,
            id: ConnectionId::next(),
            tokenizer_modules: HashMap::new(),
            owned,
        }
    }

    pub fn open_with_flags(c_path: &CString, flags: OpenFlags) -> Result<InnerConnection> {
        ensure_safe_sqlite_threading_mode()?;

        unsafe {
            let mut db: *mut ffi::sqlite3 = ptr::null_mut();
            let r = ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags.bits(), ptr::null());
            if r != ffi::SQLITE_OK {
                let e = if db.is_null() {
                    error_from_sqlite_code(r, Some(c_path.to_string_lossy().to_string()))
                } else {
                    let mut e = error_from_handle(db, r);
                    if let Error::SqliteFailure(
                        ffi::Error {
                            code: ffi::ErrorCode::CannotOpen,
                            ..
                        },
                        Some(msg),
                    ) = e
                    {
                        e = Error::SqliteFailure(
                            ffi::Error::new(r),
                            Some(format!("{}: {}", msg, c_path.to_string_lossy())),
                        );
                    }
                    ffi::sqlite3_close(db);
                    e
                };

                return Err(e);
            }

            // attempt to turn on extended results code; don't fail if we can't.
            ffi::sqlite3_extended_result_codes(db, 1);

            let conn = InnerConnection::new(db, true);
            debug!(conn = %conn.id, path = %c_path.to_string_lossy(), "opened connection");
            Ok(conn)
        }
    }

    pub fn db(&self) -> *mut ffi::sqlite3 {
        self.db
    }

    pub fn decode_result(&self, code: c_int) -> Result<()> {
        unsafe { InnerConnection::decode_result_raw(self.db(), code) }
    }

    unsafe fn decode_result_raw(db: *mut ffi::sqlite3, code: c_int) -> Result<()> {
        if code == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(error_from_handle(db, code))
        }
    }

    /// Registers `hook` (or clears the slot for `None`) and releases whatever
    /// closure the slot held before.
    ///
    /// `attach` points SQLite at the trampoline with the new token, or
    /// detaches it when given `None`. It must return SQLite's status code.
    /// On failure the new closure is released and the slot is left as it was.
    pub(crate) fn install_hook<F>(&mut self, key: SlotKey, hook: Option<Hook>, attach: F) -> Result<()>
    where
        F: FnOnce(*mut ffi::sqlite3, Option<Token>) -> c_int,
    {
        let token = hook.map(|hook| registry::reserve(self.id, key.clone(), hook));
        let rc = attach(self.db(), token);
        if rc != ffi::SQLITE_OK {
            if let Some(token) = token {
                registry::release(token);
            }
            return self.decode_result(rc);
        }
        let previous = registry::swap_current(self.id, key.clone(), token);
        debug!(
            conn = %self.id,
            ?key,
            registered = token.is_some(),
            replaced = previous.is_some(),
            "installed callback"
        );
        if let Some(previous) = previous {
            registry::release(previous);
        }
        Ok(())
    }

    /// Drops the slot's closure without touching SQLite, for calls that
    /// replace the native hook themselves.
    pub(crate) fn forget_hook(&mut self, key: SlotKey) {
        if let Some(previous) = registry::swap_current(self.id, key, None) {
            registry::release(previous);
        }
    }

    pub fn close(&mut self) -> Result<()> {
        if self.db.is_null() {
            return Ok(());
        }
        self.remove_hooks();
        if !self.owned {
            // The handle outlives us, so do its references to our modules.
            for (_, module) in self.tokenizer_modules.drain() {
                let _ = Box::leak(module);
            }
            self.db = ptr::null_mut();
            return Ok(());
        }
        unsafe {
            let r = ffi::sqlite3_close(self.db);
            let r = InnerConnection::decode_result_raw(self.db, r);
            if r.is_ok() {
                debug!(conn = %self.id, "closed connection");
                self.db = ptr::null_mut();
                self.tokenizer_modules.clear();
            }
            r
        }
    }

    /// Detaches the hooks this connection set at the library and releases
    /// all of its closures. Functions and collations stay registered in
    /// SQLite until the handle closes, but their tokens no longer resolve.
    ///
    /// Hook slots another `Connection` over the same handle installed are
    /// left attached.
    fn remove_hooks(&mut self) {
        let db = self.db();
        let id = self.id;
        let installed = |key: SlotKey| registry::current(id, &key).is_some();
        unsafe {
            if installed(SlotKey::Busy) {
                ffi::sqlite3_busy_handler(db, None, ptr::null_mut());
            }
            if installed(SlotKey::Trace) {
                ffi::sqlite3_trace(db, None, ptr::null_mut());
            }
            if installed(SlotKey::Update) {
                ffi::sqlite3_update_hook(db, None, ptr::null_mut());
            }
            if installed(SlotKey::Commit) {
                ffi::sqlite3_commit_hook(db, None, ptr::null_mut());
            }
            if installed(SlotKey::Rollback) {
                ffi::sqlite3_rollback_hook(db, None, ptr::null_mut());
            }
        }
        registry::release_connection(id);
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let c_sql = super::str_to_cstring(sql)?;
        unsafe {
            let r = ffi::sqlite3_exec(
                self.db(),
                c_sql.as_ptr(),
                None,
                ptr::null_mut(),
                ptr::null_mut(),
            );
            self.decode_result(r)
        }
    }

    pub fn prepare<'a>(&self, conn: &'a Connection, sql: &str) -> Result<Statement<'a>> {
        let mut c_stmt = ptr::null_mut();
        let (c_sql, len, _) = str_for_sqlite(sql.as_bytes())?;
        let mut c_tail = ptr::null();
        let r = unsafe {
            ffi::sqlite3_prepare_v2(
                self.db(),
                c_sql,
                len,
                &mut c_stmt as *mut *mut ffi::sqlite3_stmt,
                &mut c_tail as *mut *const c_char,
            )
        };
        // If there is an error, *ppStmt is set to NULL.
        self.decode_result(r)?;
        Ok(Statement::new(conn, unsafe { RawStatement::new(c_stmt) }))
    }

    pub fn last_insert_rowid(&self) -> i64 {
        unsafe { ffi::sqlite3_last_insert_rowid(self.db()) }
    }

    pub fn changes(&self) -> usize {
        unsafe { ffi::sqlite3_changes(self.db()) as usize }
    }

    pub fn total_changes(&self) -> usize {
        unsafe { ffi::sqlite3_total_changes(self.db()) as usize }
    }

    pub fn is_autocommit(&self) -> bool {
        unsafe { ffi::sqlite3_get_autocommit(self.db()) != 0 }
    }

    pub fn is_readonly(&self) -> bool {
        unsafe { ffi::sqlite3_db_readonly(self.db(), ptr::null()) == 1 }
    }

    pub fn path(&self) -> Option<String> {
        unsafe {
            let db_name = b"main\0";
            let path = ffi::sqlite3_db_filename(self.db(), db_name.as_ptr().cast());
            if path.is_null() {
                return None;
            }
            let path = super::errmsg_to_string(path);
            if path.is_empty() {
                None
            } else {
                Some(path)
            }
        }
    }
}

impl Drop for InnerConnection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(conn = %self.id, error = %e, "error while closing SQLite connection");
        }
    }
}

fn ensure_safe_sqlite_threading_mode() -> Result<()> {
    // Ensure SQLite was compiled in thredsafe mode.
    if unsafe { ffi::sqlite3_threadsafe() == 0 } {
        return Err(Error::SqliteSingleThreadedMode);
    }

    // SQLite hands out this magic value as its mutex when it was configured
    // for Single-thread mode at runtime.
    const SQLITE_SINGLETHREADED_MUTEX_MAGIC: usize = 8;
    let is_singlethreaded = unsafe {
        let mutex_ptr = ffi::sqlite3_mutex_alloc(0);
        let is_singlethreaded = mutex_ptr as usize == SQLITE_SINGLETHREADED_MUTEX_MAGIC;
        ffi::sqlite3_mutex_free(mutex_ptr);
        is_singlethreaded
    };
    if is_singlethreaded {
        Err(Error::SqliteSingleThreadedMode)
    } else {
        Ok(())
    }
}
