//! Tracing of executed SQL
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr;

use crate::ffi;
use crate::registry::{self, Hook, HookKind, SlotKey};
use crate::{Connection, Result};

impl Connection {
    /// Register or clear a callback function that can be used for tracing the
    /// execution of SQL statements.
    ///
    /// The callback receives the text of each statement as it starts running,
    /// with bound parameters expanded in place.
    ///
    /// There can only be a single tracer defined for each database connection.
    /// Setting a new tracer clears the old one.
    pub fn trace<F>(&self, trace_fn: Option<F>) -> Result<()>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let hook = trace_fn.map(|f| Hook::Trace(Box::new(f)));
        self.db
            .borrow_mut()
            .install_hook(SlotKey::Trace, hook, |db, token| unsafe {
                match token {
                    Some(token) => ffi::sqlite3_trace(db, Some(trace_callback), token.as_ptr()),
                    None => ffi::sqlite3_trace(db, None, ptr::null_mut()),
                };
                ffi::SQLITE_OK
            })
    }
}

unsafe extern "C" fn trace_callback(p_arg: *mut c_void, z_sql: *const c_char) {
    if z_sql.is_null() {
        return;
    }
    let s = CStr::from_ptr(z_sql).to_string_lossy();
    let _ = registry::call(p_arg, HookKind::Trace, |hook| {
        if let Hook::Trace(f) = hook {
            f(&s);
        }
        Ok(())
    });
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use crate::{params, Connection, Result};

    #[test]
    fn test_trace() -> Result<()> {
        let traced = Arc::new(Mutex::new(Vec::new()));
        let db = Connection::open_in_memory()?;

        let t = traced.clone();
        db.trace(Some(move |s: &str| t.lock().unwrap().push(s.to_owned())))?;
        let one: i32 = db.query_row("SELECT 1", params![], |r| r.get(0))?;
        assert_eq!(one, 1);
        db.query_row("SELECT ?1", params![42], |r| r.get::<i64>(0))?;

        db.trace(None::<fn(&str)>)?;
        db.query_row("SELECT 2", params![], |r| r.get::<i64>(0))?;

        let traced = traced.lock().unwrap();
        assert_eq!(*traced, vec!["SELECT 1".to_owned(), "SELECT 42".to_owned()]);
        Ok(())
    }
}
