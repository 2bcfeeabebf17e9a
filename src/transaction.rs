use std::ops::Deref;

use tracing::warn;

use crate::{Connection, Result};

/// How `BEGIN` acquires locks. See [BEGIN
/// TRANSACTION](http://www.sqlite.org/lang_transaction.html).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionBehavior {
    /// No lock until the database is first accessed.
    Deferred,
    /// Start a write transaction immediately.
    Immediate,
    /// Start a write transaction and keep other connections from reading.
    Exclusive,
}

/// What a [`Transaction`] or [`Savepoint`] does when dropped while still
/// open.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DropBehavior {
    /// Roll back the changes. This is the default.
    Rollback,
    /// Commit the changes, falling back to a rollback if that fails.
    Commit,
    /// Leave the transaction or savepoint open.
    Ignore,
    /// Panic.
    Panic,
}

/// An open transaction, rolled back on drop unless committed.
///
/// Commit and rollback hooks registered on the connection fire as the
/// transaction ends:
///
/// ```rust,no_run
/// # use sqlhooks::{Connection, Result};
/// fn audited(conn: &mut Connection) -> Result<()> {
///     conn.commit_hook(Some(|| {
///         println!("committing");
///         true
///     }))?;
///     let tx = conn.transaction()?;
///     tx.execute_batch("INSERT INTO log VALUES ('entry')")?;
///     tx.commit()
/// }
/// ```
#[derive(Debug)]
pub struct Transaction<'conn> {
    conn: &'conn Connection,
    drop_behavior: DropBehavior,
}

/// A (possibly nested) savepoint, rolled back on drop unless released.
#[derive(Debug)]
pub struct Savepoint<'conn> {
    conn: &'conn Connection,
    name: String,
    depth: u32,
    drop_behavior: DropBehavior,
    committed: bool,
}

impl Transaction<'_> {
    /// Begin a new transaction. Taking `&mut Connection` rules out nesting;
    /// use [`savepoint`](Transaction::savepoint) for that.
    pub fn new(conn: &mut Connection, behavior: TransactionBehavior) -> Result<Transaction<'_>> {
        let query = match behavior {
            TransactionBehavior::Deferred => "BEGIN DEFERRED",
            TransactionBehavior::Immediate => "BEGIN IMMEDIATE",
            TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE",
        };
        let conn: &Connection = conn;
        conn.execute_batch(query).map(move |_| Transaction {
            conn,
            drop_behavior: DropBehavior::Rollback,
        })
    }

    /// Start a savepoint nested in this transaction.
    pub fn savepoint(&mut self) -> Result<Savepoint<'_>> {
        Savepoint::with_depth(self.conn, 1)
    }

    /// Start a savepoint with a custom name nested in this transaction.
    pub fn savepoint_with_name<T: Into<String>>(&mut self, name: T) -> Result<Savepoint<'_>> {
        Savepoint::with_depth_and_name(self.conn, 1, name)
    }

    pub fn drop_behavior(&self) -> DropBehavior {
        self.drop_behavior
    }

    pub fn set_drop_behavior(&mut self, drop_behavior: DropBehavior) {
        self.drop_behavior = drop_behavior
    }

    /// Commit. Fails with `SQLITE_CONSTRAINT_COMMITHOOK` if a commit hook
    /// vetoes it, in which case the transaction has been rolled back.
    pub fn commit(mut self) -> Result<()> {
        self.commit_()
    }

    fn commit_(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")
    }

    pub fn rollback(mut self) -> Result<()> {
        self.rollback_()
    }

    fn rollback_(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")
    }

    /// Consume the transaction, applying its [`DropBehavior`] and reporting
    /// any error.
    pub fn finish(mut self) -> Result<()> {
        self.finish_()
    }

    fn finish_(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            return Ok(());
        }
        match self.drop_behavior {
            DropBehavior::Commit => self.commit_().or_else(|_| self.rollback_()),
            DropBehavior::Rollback => self.rollback_(),
            DropBehavior::Ignore => Ok(()),
            DropBehavior::Panic => panic!("Transaction dropped unexpectedly."),
        }
    }
}

impl Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_() {
            warn!(error = %e, "failed to finish transaction on drop");
        }
    }
}

impl Savepoint<'_> {
    fn with_depth_and_name<T: Into<String>>(
        conn: &Connection,
        depth: u32,
        name: T,
    ) -> Result<Savepoint<'_>> {
        let name = name.into();
        conn.execute_batch(&format!("SAVEPOINT {name}"))
            .map(|_| Savepoint {
                conn,
                name,
                depth,
                drop_behavior: DropBehavior::Rollback,
                committed: false,
            })
    }

    fn with_depth(conn: &Connection, depth: u32) -> Result<Savepoint<'_>> {
        let name = format!("_sqlhooks_sp_{depth}");
        Savepoint::with_depth_and_name(conn, depth, name)
    }

    /// Begin a savepoint outside of any [`Transaction`].
    pub fn new(conn: &mut Connection) -> Result<Savepoint<'_>> {
        Savepoint::with_depth(conn, 0)
    }

    pub fn with_name<T: Into<String>>(conn: &mut Connection, name: T) -> Result<Savepoint<'_>> {
        Savepoint::with_depth_and_name(conn, 0, name)
    }

    pub fn savepoint(&mut self) -> Result<Savepoint<'_>> {
        Savepoint::with_depth(self.conn, self.depth + 1)
    }

    pub fn savepoint_with_name<T: Into<String>>(&mut self, name: T) -> Result<Savepoint<'_>> {
        Savepoint::with_depth_and_name(self.conn, self.depth + 1, name)
    }

    pub fn drop_behavior(&self) -> DropBehavior {
        self.drop_behavior
    }

    pub fn set_drop_behavior(&mut self, drop_behavior: DropBehavior) {
        self.drop_behavior = drop_behavior
    }

    /// Release the savepoint. Releasing the outermost savepoint commits,
    /// which runs the commit hook.
    pub fn commit(mut self) -> Result<()> {
        self.commit_()
    }

    fn commit_(&mut self) -> Result<()> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.committed = true;
        Ok(())
    }

    /// Roll back to the savepoint. The savepoint stays open and can be
    /// rolled back again or committed.
    pub fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch(&format!("ROLLBACK TO {}", self.name))
    }

    pub fn finish(mut self) -> Result<()> {
        self.finish_()
    }

    fn finish_(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        match self.drop_behavior {
            DropBehavior::Commit => self.commit_().or_else(|_| self.rollback()),
            DropBehavior::Rollback => self.rollback(),
            DropBehavior::Ignore => Ok(()),
            DropBehavior::Panic => panic!("Savepoint dropped unexpectedly."),
        }
    }
}

impl Deref for Savepoint<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_() {
            warn!(name = %self.name, error = %e, "failed to finish savepoint on drop");
        }
    }
}

impl Connection {
    /// Begin a `DEFERRED` transaction that rolls back when dropped.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Transaction::new(self, TransactionBehavior::Deferred)
    }

    pub fn transaction_with_behavior(
        &mut self,
        behavior: TransactionBehavior,
    ) -> Result<Transaction<'_>> {
        Transaction::new(self, behavior)
    }

    /// Begin a savepoint that rolls back when dropped.
    pub fn savepoint(&mut self) -> Result<Savepoint<'_>> {
        Savepoint::new(self)
    }

    pub fn savepoint_with_name<T: Into<String>>(&mut self, name: T) -> Result<Savepoint<'_>> {
        Savepoint::with_name(self, name)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::{DropBehavior, TransactionBehavior};
    use crate::{params, Connection, ErrorCode, Result};

    fn checked_memory_handle() -> Result<Connection> {
        let db = Connection::open_in_memory()?;
        db.execute_batch("CREATE TABLE foo (x INTEGER)")?;
        Ok(db)
    }

    fn sum(db: &Connection) -> Result<i64> {
        db.query_row("SELECT COALESCE(SUM(x), 0) FROM foo", params![], |r| r.get(0))
    }

    #[test]
    fn test_drop() -> Result<()> {
        let mut db = checked_memory_handle()?;
        {
            let tx = db.transaction()?;
            tx.execute_batch("INSERT INTO foo VALUES(1)")?;
            // default: rollback
        }
        {
            let mut tx = db.transaction()?;
            tx.execute_batch("INSERT INTO foo VALUES(2)")?;
            tx.set_drop_behavior(DropBehavior::Commit)
        }
        {
            let tx = db.transaction()?;
            assert_eq!(2, sum(&tx)?);
        }
        Ok(())
    }

    #[test]
    fn test_savepoint() -> Result<()> {
        let mut db = checked_memory_handle()?;
        {
            let mut tx = db.transaction()?;
            tx.execute_batch("INSERT INTO foo VALUES(1)")?;
            assert_eq!(1, sum(&tx)?);
            {
                let mut sp1 = tx.savepoint()?;
                sp1.execute_batch("INSERT INTO foo VALUES(2)")?;
                assert_eq!(3, sum(&sp1)?);
                // will rollback sp1
                {
                    let sp2 = sp1.savepoint()?;
                    sp2.execute_batch("INSERT INTO foo VALUES(4)")?;
                    assert_eq!(7, sum(&sp2)?);
                    // will rollback sp2
                }
                assert_eq!(3, sum(&sp1)?);
            }
            assert_eq!(1, sum(&tx)?);
            tx.commit()?;
        }
        assert_eq!(1, sum(&db)?);
        Ok(())
    }

    #[test]
    fn test_named_savepoint_commit_runs_commit_hook() -> Result<()> {
        let mut db = checked_memory_handle()?;
        let commits = Arc::new(AtomicUsize::new(0));
        let c = commits.clone();
        db.commit_hook(Some(move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        }))?;

        let sp = db.savepoint_with_name("outer")?;
        sp.execute_batch("INSERT INTO foo VALUES(5)")?;
        sp.commit()?;
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(5, sum(&db)?);
        Ok(())
    }

    #[test]
    fn test_vetoed_commit_rolls_back() -> Result<()> {
        let mut db = checked_memory_handle()?;
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let r = rollbacks.clone();
        db.rollback_hook(Some(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }))?;
        db.commit_hook(Some(|| false))?;

        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch("INSERT INTO foo VALUES(1)")?;
        let err = tx.commit().unwrap_err();
        assert_eq!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation));
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        assert!(db.is_autocommit());

        db.commit_hook(None::<fn() -> bool>)?;
        assert_eq!(0, sum(&db)?);
        Ok(())
    }
}
