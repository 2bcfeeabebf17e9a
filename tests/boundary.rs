//! End-to-end checks of closures crossing into SQLite and back.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use sqlhooks::{
    ffi, fts4_table_sql, params, Action, Connection, Error, FunctionFlags, HookKind, Result, Tokenizer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn words(input: &str) -> Option<(String, Range<usize>)> {
    let start = input.find(|c: char| c.is_alphanumeric())?;
    let len = input[start..]
        .find(|c: char| !c.is_alphanumeric())
        .unwrap_or(input.len() - start);
    Some((input[start..start + len].to_lowercase(), start..start + len))
}

#[test]
fn same_name_resolves_per_connection() -> Result<()> {
    init_tracing();
    let a = Connection::open_in_memory()?;
    let b = Connection::open_in_memory()?;
    a.create_scalar_function("tag", 0, FunctionFlags::default(), |_| Ok("a"))?;
    b.create_scalar_function("tag", 0, FunctionFlags::default(), |_| Ok("b"))?;

    let tag = |db: &Connection| db.query_row("SELECT tag()", params![], |r| r.get::<String>(0));
    assert_eq!(tag(&a)?, "a");
    assert_eq!(tag(&b)?, "b");

    a.remove_function("tag", 0)?;
    assert!(tag(&a).is_err());
    assert_eq!(tag(&b)?, "b");
    Ok(())
}

#[test]
fn closing_releases_every_closure_once() -> Result<()> {
    init_tracing();
    let drops = Arc::new(AtomicUsize::new(0));
    let db = Connection::open_in_memory()?;

    let guard = DropCounter(drops.clone());
    db.commit_hook(Some(move || {
        let _ = &guard;
        true
    }))?;
    let guard = DropCounter(drops.clone());
    db.update_hook(Some(move |_: Action, _: &str, _: &str, _: i64| {
        let _ = &guard;
    }))?;
    let guard = DropCounter(drops.clone());
    db.create_collation("nocase_rs", move |x: &str, y: &str| {
        let _ = &guard;
        x.to_lowercase().cmp(&y.to_lowercase())
    })?;
    let guard = DropCounter(drops.clone());
    db.create_scalar_function("twice", 1, FunctionFlags::SQLITE_DETERMINISTIC, move |ctx| {
        let _ = &guard;
        Ok(ctx.get::<i64>(0)? * 2)
    })?;
    let guard = DropCounter(drops.clone());
    db.register_tokenizer("sqlhooks", "words", Some(move |input: &str| {
        let _ = &guard;
        words(input)
    }))?;
    assert_eq!(db.registered_hooks(), 5);

    db.close().map_err(|(_, e)| e)?;
    assert_eq!(drops.load(Ordering::SeqCst), 5);
    Ok(())
}

#[test]
fn hooks_follow_the_connection_across_threads() -> Result<()> {
    init_tracing();
    let db = Connection::open_in_memory()?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    db.update_hook(Some(move |action: Action, _: &str, table: &str, rowid: i64| {
        s.lock().unwrap().push((action, table.to_owned(), rowid));
    }))?;

    let handle = thread::spawn(move || -> Result<Connection> {
        db.execute_batch("CREATE TABLE items(name)")?;
        db.execute("INSERT INTO items VALUES (?1)", params!["pen"])?;
        Ok(db)
    });
    let db = handle.join().unwrap()?;
    db.execute("DELETE FROM items WHERE rowid = ?1", params![1])?;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Action::Insert, "items".to_owned(), 1),
            (Action::Delete, "items".to_owned(), 1)
        ]
    );
    Ok(())
}

#[test]
fn custom_tokenizer_drives_fts4() -> Result<()> {
    init_tracing();
    let db = Connection::open_in_memory()?;
    db.register_tokenizer("sqlhooks", "words", Some(words))?;
    let tokenizer = Tokenizer::custom("sqlhooks", "words");
    db.execute_batch(&fts4_table_sql("notes", &["body"], Some(&tokenizer)))?;

    db.execute("INSERT INTO notes(body) VALUES (?1)", params!["Hello, World!"])?;
    db.execute("INSERT INTO notes(body) VALUES (?1)", params!["ab cd"])?;

    let offsets: String = db.query_row(
        "SELECT offsets(notes) FROM notes WHERE notes MATCH 'cd'",
        params![],
        |r| r.get(0),
    )?;
    assert_eq!(offsets, "0 0 3 2");

    let mut stmt = db.prepare("SELECT body FROM notes WHERE notes MATCH 'world'")?;
    let bodies: Vec<String> = stmt
        .query(params![])?
        .mapped(|r| r.get(0))
        .collect::<Result<_>>()?;
    assert_eq!(bodies, vec!["Hello, World!".to_owned()]);
    Ok(())
}

#[test]
fn tokenizers_are_scoped_to_their_connection() -> Result<()> {
    init_tracing();
    let a = Connection::open_in_memory()?;
    let b = Connection::open_in_memory()?;
    a.register_tokenizer("sqlhooks", "words", Some(words))?;

    let sql = fts4_table_sql("notes", &["body"], Some(&Tokenizer::custom("sqlhooks", "words")));
    a.execute_batch(&sql)?;
    // `b` never installed the module.
    assert!(b.execute_batch(&sql).is_err());
    Ok(())
}

#[test]
fn failures_surface_through_the_statement_and_the_stash() -> Result<()> {
    init_tracing();
    let db = Connection::open_in_memory()?;
    db.create_scalar_function("checked_div", 2, FunctionFlags::default(), |ctx| {
        let (a, b) = (ctx.get::<i64>(0)?, ctx.get::<i64>(1)?);
        if b == 0 {
            return Err(Error::UserFunctionError("division by zero".into()));
        }
        Ok(a / b)
    })?;

    let quotient: i64 = db.query_row("SELECT checked_div(9, 3)", params![], |r| r.get(0))?;
    assert_eq!(quotient, 3);

    let err = db
        .query_row("SELECT checked_div(1, 0)", params![], |r| r.get::<i64>(0))
        .unwrap_err();
    assert!(err.to_string().contains("division by zero"), "{err}");
    assert!(matches!(
        db.take_callback_error(),
        Some(Error::UserFunctionError(_))
    ));
    assert!(db.take_callback_error().is_none());
    Ok(())
}

#[test]
fn reentering_a_running_closure_is_refused() -> Result<()> {
    init_tracing();
    let db = Connection::open_in_memory()?;
    // Raw pointers are not Send; carry the handle as an address.
    let handle = unsafe { db.handle() } as usize;
    db.create_scalar_function("recurse", 0, FunctionFlags::default(), move |_| {
        // A second connection object over the same handle, to re-enter SQLite
        // from inside the function.
        let inner = unsafe { Connection::from_handle(handle as *mut ffi::sqlite3)? };
        let nested = inner.query_row("SELECT recurse()", params![], |r| r.get::<i64>(0));
        Ok(i64::from(nested.is_err()))
    })?;

    let refused: i64 = db.query_row("SELECT recurse()", params![], |r| r.get(0))?;
    assert_eq!(refused, 1);
    assert!(matches!(
        db.take_callback_error(),
        Some(Error::ReentrantCallback {
            hook: HookKind::Function
        })
    ));
    Ok(())
}
