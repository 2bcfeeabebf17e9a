//! Busy handler (when the database is locked)
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::time::Duration;

use crate::ffi;
use crate::inner_connection::InnerConnection;
use crate::registry::{self, Hook, HookKind, Outcome, SlotKey};
use crate::{Connection, Result};

impl Connection {
    /// Set a busy handler that sleeps for a specified amount of time when a
    /// table is locked. The handler will sleep multiple times until at
    /// least "ms" milliseconds of sleeping have accumulated.
    ///
    /// Calling this routine with an argument equal to zero turns off all busy
    /// handlers.
    ///
    /// There can only be a single busy handler for a particular database
    /// connection at any given moment. If another busy handler was defined
    /// (using [`busy_handler`](Connection::busy_handler)) prior to calling
    /// this routine, that other busy handler is cleared and its closure
    /// released.
    pub fn busy_timeout(&self, timeout: Duration) -> Result<()> {
        let ms: i32 = timeout
            .as_secs()
            .checked_mul(1000)
            .and_then(|t| t.checked_add(timeout.subsec_millis().into()))
            .and_then(|t| t.try_into().ok())
            .unwrap_or(i32::MAX);
        self.db.borrow_mut().busy_timeout(ms)
    }

    /// Register a callback to handle `SQLITE_BUSY` errors.
    ///
    /// If the busy callback is `None`, then `SQLITE_BUSY` is returned
    /// immediately upon encountering the lock. The argument to the busy
    /// handler callback is the number of times that the busy handler has
    /// been invoked previously for the same locking event. If the busy
    /// callback returns `false`, then no additional attempts are made to
    /// access the database and `SQLITE_BUSY` is returned to the
    /// application. If the callback returns `true`, then another attempt
    /// is made to access the database and the cycle repeats.
    ///
    /// A callback that panics is treated as if it returned `false`; the
    /// panic is reported through [`Connection::take_callback_error`].
    ///
    /// There can only be a single busy handler defined for each database
    /// connection. Setting a new busy handler clears any previously set
    /// handler. Note that calling `busy_timeout()` or evaluating `PRAGMA
    /// busy_timeout=N` will change the busy handler and thus
    /// clear any previously set busy handler.
    pub fn busy_handler<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: FnMut(i32) -> bool + Send + 'static,
    {
        let hook = callback.map(|f| Hook::Busy(Box::new(f)));
        self.db
            .borrow_mut()
            .install_hook(SlotKey::Busy, hook, |db, token| unsafe {
                match token {
                    Some(token) => {
                        ffi::sqlite3_busy_handler(db, Some(busy_handler_callback), token.as_ptr())
                    }
                    None => ffi::sqlite3_busy_handler(db, None, ptr::null_mut()),
                }
            })
    }
}

impl InnerConnection {
    fn busy_timeout(&mut self, timeout: c_int) -> Result<()> {
        let r = unsafe { ffi::sqlite3_busy_timeout(self.db, timeout) };
        self.decode_result(r)?;
        self.forget_hook(SlotKey::Busy);
        Ok(())
    }
}

unsafe extern "C" fn busy_handler_callback(p_arg: *mut c_void, count: c_int) -> c_int {
    let outcome = registry::call(p_arg, HookKind::Busy, |hook| match hook {
        Hook::Busy(f) => Ok(f(count)),
        _ => Ok(false),
    });
    match outcome {
        Outcome::Returned(true) => 1,
        _ => 0,
    }
}
