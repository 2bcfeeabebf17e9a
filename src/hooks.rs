//! Commit, Data Change and Rollback Notification Callbacks
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use crate::ffi;
use crate::registry::{self, Hook, HookKind, Outcome, SlotKey};
use crate::{Connection, Result};

/// Action Codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
#[non_exhaustive]
pub enum Action {
    /// Unsupported / unexpected action
    Unknown = -1,
    /// DELETE command
    Delete = ffi::SQLITE_DELETE,
    /// INSERT command
    Insert = ffi::SQLITE_INSERT,
    /// UPDATE command
    Update = ffi::SQLITE_UPDATE,
}

impl From<i32> for Action {
    #[inline]
    fn from(code: i32) -> Action {
        match code {
            ffi::SQLITE_DELETE => Action::Delete,
            ffi::SQLITE_INSERT => Action::Insert,
            ffi::SQLITE_UPDATE => Action::Update,
            _ => Action::Unknown,
        }
    }
}

impl Connection {
    /// Register a callback function to be invoked whenever a transaction is
    /// committed.
    ///
    /// The callback returns `true` to let the commit proceed and `false` to
    /// turn it into a rollback, in which case the `COMMIT` fails with
    /// `SQLITE_CONSTRAINT_COMMITHOOK`. A callback that panics also causes a
    /// rollback.
    pub fn commit_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let hook = hook.map(|f| Hook::Commit(Box::new(f)));
        self.db
            .borrow_mut()
            .install_hook(SlotKey::Commit, hook, |db, token| unsafe {
                match token {
                    Some(token) => ffi::sqlite3_commit_hook(db, Some(commit_hook_callback), token.as_ptr()),
                    None => ffi::sqlite3_commit_hook(db, None, ptr::null_mut()),
                };
                ffi::SQLITE_OK
            })
    }

    /// Register a callback function to be invoked whenever a transaction is
    /// rolled back, explicitly or because a commit hook vetoed the commit.
    pub fn rollback_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let hook = hook.map(|f| Hook::Rollback(Box::new(f)));
        self.db
            .borrow_mut()
            .install_hook(SlotKey::Rollback, hook, |db, token| unsafe {
                match token {
                    Some(token) => {
                        ffi::sqlite3_rollback_hook(db, Some(rollback_hook_callback), token.as_ptr())
                    }
                    None => ffi::sqlite3_rollback_hook(db, None, ptr::null_mut()),
                };
                ffi::SQLITE_OK
            })
    }

    /// Register a callback function to be invoked whenever a row is updated,
    /// inserted or deleted in a rowid table.
    ///
    /// The callback parameters are:
    ///
    /// - the type of database update (`Action::Insert`, `Action::Update` or
    ///   `Action::Delete`),
    /// - the name of the database ("main", "temp", ...),
    /// - the name of the table that is updated,
    /// - the ROWID of the row that is updated.
    pub fn update_hook<F>(&self, hook: Option<F>) -> Result<()>
    where
        F: FnMut(Action, &str, &str, i64) + Send + 'static,
    {
        let hook = hook.map(|f| Hook::Update(Box::new(f)));
        self.db
            .borrow_mut()
            .install_hook(SlotKey::Update, hook, |db, token| unsafe {
                match token {
                    Some(token) => {
                        ffi::sqlite3_update_hook(db, Some(update_hook_callback), token.as_ptr())
                    }
                    None => ffi::sqlite3_update_hook(db, None, ptr::null_mut()),
                };
                ffi::SQLITE_OK
            })
    }
}

unsafe extern "C" fn commit_hook_callback(p_arg: *mut c_void) -> c_int {
    let outcome = registry::call(p_arg, HookKind::Commit, |hook| match hook {
        Hook::Commit(f) => Ok(f()),
        _ => Ok(true),
    });
    match outcome {
        Outcome::Returned(true) | Outcome::Absent => 0,
        Outcome::Returned(false) | Outcome::Failed(_) => 1,
    }
}

unsafe extern "C" fn rollback_hook_callback(p_arg: *mut c_void) {
    let _ = registry::call(p_arg, HookKind::Rollback, |hook| {
        if let Hook::Rollback(f) = hook {
            f();
        }
        Ok(())
    });
}

unsafe extern "C" fn update_hook_callback(
    p_arg: *mut c_void,
    action_code: c_int,
    p_db_name: *const c_char,
    p_table_name: *const c_char,
    row_id: ffi::sqlite3_int64,
) {
    let action = Action::from(action_code);
    let db_name = lossy_cstr(p_db_name);
    let tbl_name = lossy_cstr(p_table_name);
    let _ = registry::call(p_arg, HookKind::Update, |hook| {
        if let Hook::Update(f) = hook {
            f(action, &db_name, &tbl_name, row_id);
        }
        Ok(())
    });
}

unsafe fn lossy_cstr<'a>(p: *const c_char) -> std::borrow::Cow<'a, str> {
    if p.is_null() {
        "".into()
    } else {
        CStr::from_ptr(p).to_string_lossy()
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::Action;
    use crate::{params, Connection, Error, ErrorCode, HookKind, Result};

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count_rows(db: &Connection) -> Result<i64> {
        db.query_row("SELECT COUNT(*) FROM foo", params![], |r| r.get(0))
    }

    #[test]
    fn test_commit_hook() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo(t)")?;

        let called = Arc::new(AtomicBool::new(false));
        let c = called.clone();
        db.commit_hook(Some(move || {
            c.store(true, Ordering::SeqCst);
            true
        }))?;
        db.execute_batch("BEGIN; INSERT INTO foo VALUES ('lisa'); COMMIT;")?;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(count_rows(&db)?, 1);
        Ok(())
    }

    #[test]
    fn test_commit_hook_veto_rolls_back() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo(t)")?;

        let rolled_back = Arc::new(AtomicBool::new(false));
        let r = rolled_back.clone();
        db.rollback_hook(Some(move || r.store(true, Ordering::SeqCst)))?;
        db.commit_hook(Some(|| false))?;

        let err = db
            .execute_batch("BEGIN; INSERT INTO foo VALUES ('lisa'); COMMIT;")
            .unwrap_err();
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation));
        assert!(rolled_back.load(Ordering::SeqCst));
        assert!(db.is_autocommit());

        db.commit_hook(None::<fn() -> bool>)?;
        assert_eq!(count_rows(&db)?, 0);
        Ok(())
    }

    #[test]
    fn test_panicking_commit_hook_rolls_back() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo(t)")?;
        db.commit_hook(Some(|| -> bool { panic!("commit hook exploded") }))?;

        let err = db.execute("INSERT INTO foo VALUES (?1)", params!["x"]).unwrap_err();
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation));
        assert!(matches!(
            db.take_callback_error(),
            Some(Error::UnwindingPanic {
                hook: HookKind::Commit
            })
        ));

        // Still usable once the hook is gone.
        db.commit_hook(None::<fn() -> bool>)?;
        db.execute("INSERT INTO foo VALUES (?1)", params!["y"])?;
        assert_eq!(count_rows(&db)?, 1);
        Ok(())
    }

    #[test]
    fn test_update_hook_order() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo(t)")?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        db.update_hook(Some(move |action: Action, db: &str, tbl: &str, row_id: i64| {
            assert_eq!("main", db);
            assert_eq!("foo", tbl);
            s.lock().unwrap().push((action, row_id));
        }))?;
        let commits = Arc::new(Mutex::new(0));
        let c = commits.clone();
        db.commit_hook(Some(move || {
            *c.lock().unwrap() += 1;
            true
        }))?;
        db.execute_batch(
            "BEGIN;
             INSERT INTO foo VALUES ('a');
             INSERT INTO foo VALUES ('b');
             UPDATE foo SET t = 'c' WHERE rowid = 1;
             DELETE FROM foo WHERE rowid = 2;
             COMMIT;",
        )?;
        assert_eq!(*commits.lock().unwrap(), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Action::Insert, 1),
                (Action::Insert, 2),
                (Action::Update, 1),
                (Action::Delete, 2)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_replacing_hook_releases_previous_closure() -> Result<()> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo(t)")?;
        let drops = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let (guard, c) = (DropCounter(drops.clone()), calls.clone());
        db.rollback_hook(Some(move || {
            let _ = &guard;
            c.fetch_add(1, Ordering::SeqCst);
        }))?;
        db.execute_batch("BEGIN; ROLLBACK;")?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let guard = DropCounter(drops.clone());
        db.rollback_hook(Some(move || {
            let _ = &guard;
        }))?;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(db.registered_hooks(), 1);

        db.rollback_hook(None::<fn()>)?;
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        db.execute_batch("BEGIN; ROLLBACK;")?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(db.registered_hooks(), 0);
        Ok(())
    }

    #[test]
    fn test_clearing_is_per_connection() -> Result<()> {
        let a = Connection::open_in_memory()?;
        let b = Connection::open_in_memory()?;
        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));

        let h = hits_a.clone();
        a.commit_hook(Some(move || {
            h.fetch_add(1, Ordering::SeqCst);
            true
        }))?;
        let h = hits_b.clone();
        b.commit_hook(Some(move || {
            h.fetch_add(1, Ordering::SeqCst);
            true
        }))?;

        a.commit_hook(None::<fn() -> bool>)?;
        a.execute_batch("CREATE TABLE foo(t)")?;
        b.execute_batch("CREATE TABLE foo(t)")?;
        assert_eq!(hits_a.load(Ordering::SeqCst), 0);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
        assert_eq!(b.registered_hooks(), 1);
        Ok(())
    }
}
