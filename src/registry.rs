//! Process-wide ownership of every closure handed to SQLite.
//!
//! SQLite only ever sees a [`Token`]: a non-zero integer smuggled through its
//! `void*` context argument. The closure itself lives in an [`Entry`] owned by
//! this registry, so a stale token coming back from the library resolves to
//! nothing instead of to freed memory.
//!
//! Locking: the registry map sits behind one `parking_lot::Mutex` that is never
//! held while user code or SQLite runs. Each entry guards its closure with a
//! `ReentrantMutex<RefCell<_>>`; invocation holds it for the duration of the
//! call, release takes it to drop the closure, and a same-thread reentry finds
//! the `RefCell` already borrowed.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use crate::functions::Context;
use crate::hooks::Action;
use crate::types::Value;
use crate::{Error, Result};

/// Identifies one [`Connection`](crate::Connection) for the lifetime of the
/// process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, atomic::Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// The opaque context value handed to SQLite in place of a closure pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token(NonZeroUsize);

impl Token {
    fn next() -> Token {
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        let raw = NEXT.fetch_add(1, atomic::Ordering::Relaxed);
        // Wrapping past usize::MAX registrations is not a practical concern;
        // zero stays reserved for "no context".
        Token(NonZeroUsize::new(raw).unwrap_or(NonZeroUsize::MIN))
    }

    pub(crate) fn as_ptr(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    pub(crate) fn from_ptr(p: *mut c_void) -> Option<Token> {
        NonZeroUsize::new(p as usize).map(Token)
    }
}

/// The kind of native hook a callback is registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum HookKind {
    Busy,
    Trace,
    Update,
    Commit,
    Rollback,
    Function,
    Collation,
    Tokenizer,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            HookKind::Busy => "busy",
            HookKind::Trace => "trace",
            HookKind::Update => "update",
            HookKind::Commit => "commit",
            HookKind::Rollback => "rollback",
            HookKind::Function => "function",
            HookKind::Collation => "collation",
            HookKind::Tokenizer => "tokenizer",
        })
    }
}

/// One registration point on one connection.
///
/// Function and collation names compare case-insensitively in SQLite, so they
/// are folded to ASCII lowercase here.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SlotKey {
    Busy,
    Trace,
    Update,
    Commit,
    Rollback,
    Function { name: String, n_arg: i32 },
    Collation { name: String },
    Tokenizer { module: String, name: String },
}

impl SlotKey {
    pub(crate) fn function(name: &str, n_arg: i32) -> SlotKey {
        SlotKey::Function {
            name: name.to_ascii_lowercase(),
            n_arg,
        }
    }

    pub(crate) fn collation(name: &str) -> SlotKey {
        SlotKey::Collation {
            name: name.to_ascii_lowercase(),
        }
    }

    pub(crate) fn tokenizer(module: &str, name: &str) -> SlotKey {
        SlotKey::Tokenizer {
            module: module.to_owned(),
            name: name.to_owned(),
        }
    }

    pub(crate) fn kind(&self) -> HookKind {
        match *self {
            SlotKey::Busy => HookKind::Busy,
            SlotKey::Trace => HookKind::Trace,
            SlotKey::Update => HookKind::Update,
            SlotKey::Commit => HookKind::Commit,
            SlotKey::Rollback => HookKind::Rollback,
            SlotKey::Function { .. } => HookKind::Function,
            SlotKey::Collation { .. } => HookKind::Collation,
            SlotKey::Tokenizer { .. } => HookKind::Tokenizer,
        }
    }
}

pub(crate) type TokenizerFn = dyn Fn(&str) -> Option<(String, Range<usize>)> + Send;

/// A boxed closure of one of the fixed hook signatures.
pub(crate) enum Hook {
    Busy(Box<dyn FnMut(i32) -> bool + Send>),
    Trace(Box<dyn FnMut(&str) + Send>),
    Update(Box<dyn FnMut(Action, &str, &str, i64) + Send>),
    Commit(Box<dyn FnMut() -> bool + Send>),
    Rollback(Box<dyn FnMut() + Send>),
    Function(Box<dyn FnMut(&Context<'_>) -> Result<Value> + Send>),
    Collation(Box<dyn Fn(&str, &str) -> Ordering + Send>),
    Tokenizer(Box<TokenizerFn>),
}

impl Hook {
    pub(crate) fn kind(&self) -> HookKind {
        match *self {
            Hook::Busy(_) => HookKind::Busy,
            Hook::Trace(_) => HookKind::Trace,
            Hook::Update(_) => HookKind::Update,
            Hook::Commit(_) => HookKind::Commit,
            Hook::Rollback(_) => HookKind::Rollback,
            Hook::Function(_) => HookKind::Function,
            Hook::Collation(_) => HookKind::Collation,
            Hook::Tokenizer(_) => HookKind::Tokenizer,
        }
    }
}

struct Entry {
    owner: ConnectionId,
    key: SlotKey,
    hook: ReentrantMutex<RefCell<Option<Hook>>>,
    // Set when a release happened from inside this entry's own invocation; the
    // invocation drops the closure once it unwinds back out.
    retired: AtomicBool,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<Token, Arc<Entry>>,
    current: HashMap<(ConnectionId, SlotKey), Token>,
    errors: HashMap<ConnectionId, Error>,
}

static REGISTRY: Lazy<Mutex<Slots>> = Lazy::new(|| Mutex::new(Slots::default()));

/// Takes ownership of `hook` and returns the token SQLite will hand back.
/// The entry is live but not yet current for its slot; see [`swap_current`].
pub(crate) fn reserve(owner: ConnectionId, key: SlotKey, hook: Hook) -> Token {
    debug_assert_eq!(key.kind(), hook.kind());
    let token = Token::next();
    trace!(%owner, ?key, ?token, "allocated callback token");
    let entry = Arc::new(Entry {
        owner,
        key,
        hook: ReentrantMutex::new(RefCell::new(Some(hook))),
        retired: AtomicBool::new(false),
    });
    REGISTRY.lock().entries.insert(token, entry);
    token
}

/// Makes `token` the current registration of `key`, returning the one it
/// supersedes. The previous token is still live; the caller releases it.
pub(crate) fn swap_current(
    owner: ConnectionId,
    key: SlotKey,
    token: Option<Token>,
) -> Option<Token> {
    let mut slots = REGISTRY.lock();
    match token {
        Some(token) => slots.current.insert((owner, key), token),
        None => slots.current.remove(&(owner, key)),
    }
}

/// The token currently registered for `key`, if any.
pub(crate) fn current(owner: ConnectionId, key: &SlotKey) -> Option<Token> {
    // The tuple key needs an owned SlotKey; slots are small.
    REGISTRY.lock().current.get(&(owner, key.clone())).copied()
}

/// Releases the closure behind `token`. Returns once no invocation of it is
/// running on another thread; later invocations resolve to nothing.
/// Releasing an unknown or already released token does nothing.
pub(crate) fn release(token: Token) {
    let entry = {
        let mut slots = REGISTRY.lock();
        let Some(entry) = slots.entries.remove(&token) else {
            return;
        };
        let slot = (entry.owner, entry.key.clone());
        if slots.current.get(&slot) == Some(&token) {
            slots.current.remove(&slot);
        }
        entry
    };
    debug!(owner = %entry.owner, key = ?entry.key, ?token, "releasing callback");
    retire(&entry);
}

/// Releases every closure `owner` registered and forgets its pending error.
pub(crate) fn release_connection(owner: ConnectionId) {
    let entries: Vec<Arc<Entry>> = {
        let mut slots = REGISTRY.lock();
        slots.current.retain(|(id, _), _| *id != owner);
        slots.errors.remove(&owner);
        let tokens: Vec<Token> = slots
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(token, _)| *token)
            .collect();
        tokens
            .into_iter()
            .filter_map(|token| slots.entries.remove(&token))
            .collect()
    };
    if !entries.is_empty() {
        debug!(%owner, count = entries.len(), "releasing connection callbacks");
    }
    for entry in entries {
        retire(&entry);
    }
}

fn retire(entry: &Entry) {
    let guard = entry.hook.lock();
    let dropped = match guard.try_borrow_mut() {
        Ok(mut hook) => hook.take(),
        Err(_) => {
            // Released from inside its own invocation on this thread.
            entry.retired.store(true, atomic::Ordering::Release);
            None
        }
    };
    drop(guard);
    drop(dropped);
}

/// Number of live registrations owned by `owner`.
pub(crate) fn count(owner: ConnectionId) -> usize {
    REGISTRY
        .lock()
        .entries
        .values()
        .filter(|entry| entry.owner == owner)
        .count()
}

/// Records a failure contained at a callback boundary. The first unreported
/// failure is kept; later ones are only logged.
pub(crate) fn stash_error(owner: ConnectionId, err: Error) {
    REGISTRY.lock().errors.entry(owner).or_insert(err);
}

pub(crate) fn take_error(owner: ConnectionId) -> Option<Error> {
    REGISTRY.lock().errors.remove(&owner)
}

/// `xDestroy` for registrations SQLite tracks itself (functions, collations).
pub(crate) unsafe extern "C" fn release_context(p_arg: *mut c_void) {
    if let Some(token) = Token::from_ptr(p_arg) {
        // A closure's Drop must not unwind into SQLite.
        if catch_unwind(|| release(token)).is_err() {
            warn!(?token, "panic while dropping a released callback");
        }
    }
}

fn lookup(token: Token) -> Option<Arc<Entry>> {
    REGISTRY.lock().entries.get(&token).cloned()
}

/// Result of routing a native callback to its closure.
pub(crate) enum Outcome<R> {
    /// The closure ran and returned normally.
    Returned(R),
    /// No closure is registered behind the context value.
    Absent,
    /// The closure failed, panicked or was re-entered. The error is stashed
    /// on the owning connection; its message is carried for hooks that can
    /// report one to SQLite.
    Failed(String),
}

/// Resolves `p_arg` and runs `f` against the registered closure, containing
/// panics and errors. Must be called from an `extern "C"` trampoline.
pub(crate) fn call<R, F>(p_arg: *mut c_void, kind: HookKind, f: F) -> Outcome<R>
where
    F: FnOnce(&mut Hook) -> Result<R>,
{
    let Some(entry) = Token::from_ptr(p_arg).and_then(lookup) else {
        return Outcome::Absent;
    };
    invoke(&entry, kind, f)
}

fn invoke<R, F>(entry: &Entry, kind: HookKind, f: F) -> Outcome<R>
where
    F: FnOnce(&mut Hook) -> Result<R>,
{
    let guard = entry.hook.lock();
    let result = {
        let Ok(mut slot) = guard.try_borrow_mut() else {
            return fail(entry, Error::ReentrantCallback { hook: kind });
        };
        match slot.as_mut() {
            Some(hook) if hook.kind() == kind => catch_unwind(AssertUnwindSafe(|| f(hook))),
            _ => return Outcome::Absent,
        }
    };
    let dropped = if entry.retired.load(atomic::Ordering::Acquire) {
        guard.borrow_mut().take()
    } else {
        None
    };
    drop(guard);
    drop(dropped);

    match result {
        Ok(Ok(value)) => Outcome::Returned(value),
        Ok(Err(err)) => fail(entry, err),
        Err(_) => fail(entry, Error::UnwindingPanic { hook: kind }),
    }
}

fn fail<R>(entry: &Entry, err: Error) -> Outcome<R> {
    let message = err.to_string();
    warn!(owner = %entry.owner, key = ?entry.key, error = %message, "callback failure contained");
    stash_error(entry.owner, err);
    Outcome::Failed(message)
}
