//! Add, remove, or modify a collation
use std::cmp::Ordering;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;

use crate::ffi;
use crate::inner_connection::InnerConnection;
use crate::registry::{self, release_context, Hook, HookKind, Outcome, SlotKey};
use crate::{str_to_cstring, Connection, Error, Result};

impl Connection {
    /// Add or modify a collation.
    ///
    /// If `x_compare` panics, or SQLite hands it text that is not valid
    /// UTF-8, the two strings are compared byte by byte instead.
    pub fn create_collation<C>(&self, collation_name: &str, x_compare: C) -> Result<()>
    where
        C: Fn(&str, &str) -> Ordering + Send + 'static,
    {
        self.db
            .borrow_mut()
            .create_collation(collation_name, x_compare)
    }

    /// Remove collation.
    pub fn remove_collation(&self, collation_name: &str) -> Result<()> {
        self.db.borrow_mut().remove_collation(collation_name)
    }
}

fn validate_collation(collation_name: &str) -> Result<()> {
    if collation_name.is_empty() || collation_name.contains('\0') {
        Err(Error::InvalidCollationName(collation_name.to_owned()))
    } else {
        Ok(())
    }
}

impl InnerConnection {
    fn create_collation<C>(&mut self, collation_name: &str, x_compare: C) -> Result<()>
    where
        C: Fn(&str, &str) -> Ordering + Send + 'static,
    {
        validate_collation(collation_name)?;
        let c_name = str_to_cstring(collation_name)?;
        let hook = Hook::Collation(Box::new(x_compare));
        self.install_hook(
            SlotKey::collation(collation_name),
            Some(hook),
            |db, token| unsafe {
                ffi::sqlite3_create_collation_v2(
                    db,
                    c_name.as_ptr(),
                    ffi::SQLITE_UTF8,
                    token.map_or(ptr::null_mut(), |t| t.as_ptr()),
                    Some(compare),
                    Some(release_context),
                )
            },
        )
    }

    fn remove_collation(&mut self, collation_name: &str) -> Result<()> {
        validate_collation(collation_name)?;
        let c_name = str_to_cstring(collation_name)?;
        self.install_hook(SlotKey::collation(collation_name), None, |db, _| unsafe {
            ffi::sqlite3_create_collation_v2(
                db,
                c_name.as_ptr(),
                ffi::SQLITE_UTF8,
                ptr::null_mut(),
                None,
                None,
            )
        })
    }
}

unsafe fn bytes<'a>(p: *const c_void, len: c_int) -> &'a [u8] {
    if p.is_null() || len <= 0 {
        &[]
    } else {
        slice::from_raw_parts(p.cast::<u8>(), len as usize)
    }
}

unsafe extern "C" fn compare(
    p_arg: *mut c_void,
    len1: c_int,
    p1: *const c_void,
    len2: c_int,
    p2: *const c_void,
) -> c_int {
    let (b1, b2) = (bytes(p1, len1), bytes(p2, len2));
    let ordering = match (std::str::from_utf8(b1), std::str::from_utf8(b2)) {
        (Ok(s1), Ok(s2)) => {
            match registry::call(p_arg, HookKind::Collation, |hook| match hook {
                Hook::Collation(f) => Ok(f(s1, s2)),
                _ => Ok(b1.cmp(b2)),
            }) {
                Outcome::Returned(ordering) => ordering,
                Outcome::Absent | Outcome::Failed(_) => b1.cmp(b2),
            }
        }
        _ => b1.cmp(b2),
    };
    match ordering {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use fallible_streaming_iterator::FallibleStreamingIterator;
    use unicase::UniCase;

    use crate::{params, Connection, Error, HookKind, Result};

    fn unicase_compare(s1: &str, s2: &str) -> Ordering {
        UniCase::new(s1).cmp(&UniCase::new(s2))
    }

    fn distinct(db: &Connection, collation: &str) -> Result<usize> {
        let mut stmt = db.prepare(&format!(
            "SELECT DISTINCT bar COLLATE {collation} FROM foo ORDER BY 1"
        ))?;
        let rows = stmt.query(params![])?;
        rows.count()
    }

    fn setup() -> Result<Connection> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(
            "CREATE TABLE foo (bar);
             INSERT INTO foo (bar) VALUES ('Maße');
             INSERT INTO foo (bar) VALUES ('MASSE');",
        )?;
        Ok(db)
    }

    #[test]
    fn test_unicase() -> Result<()> {
        let db = setup()?;
        db.create_collation("unicase", unicase_compare)?;
        assert_eq!(distinct(&db, "unicase")?, 1);
        Ok(())
    }

    #[test]
    fn test_replace_and_remove_collation() -> Result<()> {
        let db = setup()?;
        db.create_collation("fold", unicase_compare)?;
        db.create_collation("FOLD", |a: &str, b: &str| a.cmp(b))?;
        assert_eq!(db.registered_hooks(), 1);
        assert_eq!(distinct(&db, "fold")?, 2);

        db.remove_collation("fold")?;
        assert_eq!(db.registered_hooks(), 0);
        assert!(distinct(&db, "fold").is_err());
        Ok(())
    }

    #[test]
    fn test_panicking_collation_compares_bytes() -> Result<()> {
        let db = setup()?;
        db.create_collation("broken", |_: &str, _: &str| -> Ordering {
            panic!("cannot compare")
        })?;
        assert_eq!(distinct(&db, "broken")?, 2);
        assert!(matches!(
            db.take_callback_error(),
            Some(Error::UnwindingPanic {
                hook: HookKind::Collation
            })
        ));
        Ok(())
    }

    #[test]
    fn test_invalid_collation_name() -> Result<()> {
        let db = Connection::open_in_memory()?;
        assert!(matches!(
            db.create_collation("", unicase_compare),
            Err(Error::InvalidCollationName(_))
        ));
        assert!(matches!(
            db.remove_collation("a\0b"),
            Err(Error::InvalidCollationName(_))
        ));
        Ok(())
    }
}
