//! Custom FTS3/FTS4 tokenizers backed by Rust closures.
//!
//! SQLite has no C API for registering a full-text tokenizer; instead the
//! `fts3_tokenizer(name, pointer)` SQL function accepts the address of a
//! `sqlite3_tokenizer_module` struct (see `fts3_tokenizer.h`). One such module
//! is installed per connection and module name. Every FTS table declared with
//! `tokenize=<module> <tokenizer>` then routes through the fixed callbacks
//! below, which look up the closure registered for `(module, tokenizer)`
//! whenever a cursor opens.
use std::ffi::CStr;
use std::ops::Range;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::slice;

use tracing::debug;

use crate::error::error_from_handle;
use crate::ffi;
use crate::inner_connection::InnerConnection;
use crate::raw_statement::RawStatement;
use crate::registry::{self, ConnectionId, Hook, HookKind, Outcome, SlotKey, Token};
use crate::{str_for_sqlite, str_to_cstring, Connection, Error, Result};

/// `struct sqlite3_tokenizer_module`, version 0.
#[repr(C)]
struct TokenizerModule {
    i_version: c_int,
    x_create: Option<
        unsafe extern "C" fn(c_int, *const *const c_char, *mut *mut RawTokenizer) -> c_int,
    >,
    x_destroy: Option<unsafe extern "C" fn(*mut RawTokenizer) -> c_int>,
    x_open: Option<
        unsafe extern "C" fn(*mut RawTokenizer, *const c_char, c_int, *mut *mut RawCursor) -> c_int,
    >,
    x_close: Option<unsafe extern "C" fn(*mut RawCursor) -> c_int>,
    x_next: Option<
        unsafe extern "C" fn(
            *mut RawCursor,
            *mut *const c_char,
            *mut c_int,
            *mut c_int,
            *mut c_int,
            *mut c_int,
        ) -> c_int,
    >,
}

/// `struct sqlite3_tokenizer`. FTS sets `p_module` after `xCreate` returns.
#[repr(C)]
struct RawTokenizer {
    p_module: *const TokenizerModule,
}

/// `struct sqlite3_tokenizer_cursor`.
#[repr(C)]
struct RawCursor {
    p_tokenizer: *mut RawTokenizer,
}

/// The module struct handed to `fts3_tokenizer()`, extended with the
/// connection and module name it was installed for.
#[repr(C)]
pub(crate) struct ModuleDescriptor {
    base: TokenizerModule,
    owner: ConnectionId,
    module: String,
}

#[repr(C)]
struct BoundTokenizer {
    base: RawTokenizer,
    name: String,
}

#[repr(C)]
struct BoundCursor {
    base: RawCursor,
    token: Token,
    stream: TokenStream,
}

/// Where one token lies in the text being tokenized, in bytes, and its
/// ordinal position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TokenSpan {
    pub start: usize,
    pub end: usize,
    pub position: usize,
}

/// Walks a text with a tokenizer closure that only ever sees the part not
/// consumed yet.
pub(crate) struct TokenStream {
    input: String,
    offset: usize,
    position: usize,
    current: String,
}

impl TokenStream {
    pub(crate) fn new(input: String) -> TokenStream {
        TokenStream {
            input,
            offset: 0,
            position: 0,
            current: String::new(),
        }
    }

    /// Text of the token most recently returned by [`advance`](Self::advance).
    pub(crate) fn current(&self) -> &str {
        &self.current
    }

    /// Asks `next` for the token following the consumed prefix. The range it
    /// returns is relative to the remaining text and must end past its start
    /// on character boundaries.
    pub(crate) fn advance<F>(&mut self, next: F) -> Result<Option<TokenSpan>>
    where
        F: FnOnce(&str) -> Option<(String, Range<usize>)>,
    {
        let rest = &self.input[self.offset..];
        let Some((token, range)) = next(rest) else {
            return Ok(None);
        };
        if range.start > range.end || range.end > rest.len() {
            return Err(Error::InvalidToken {
                reason: format!("range {range:?} is outside of {} bytes", rest.len()),
            });
        }
        if range.end == 0 {
            return Err(Error::InvalidToken {
                reason: "range does not consume any input".to_owned(),
            });
        }
        if !rest.is_char_boundary(range.start) || !rest.is_char_boundary(range.end) {
            return Err(Error::InvalidToken {
                reason: format!("range {range:?} splits a character"),
            });
        }
        let span = TokenSpan {
            start: self.offset + range.start,
            end: self.offset + range.end,
            position: self.position,
        };
        self.offset = span.end;
        self.position += 1;
        self.current = token;
        Ok(Some(span))
    }
}

impl Connection {
    /// Register, replace or clear (`None`) the tokenizer named `tokenizer`
    /// within the FTS tokenizer module `module`.
    ///
    /// FTS3/FTS4 tables select it with `tokenize=<module> <tokenizer>` (see
    /// [`Tokenizer::custom`](crate::Tokenizer::custom)). `next` receives the
    /// text not yet tokenized and returns the next token together with its
    /// byte range within that text, or `None` when there are no more tokens.
    ///
    /// A closure that panics or returns a range outside of its input makes
    /// the FTS operation fail; the cause is kept for
    /// [`take_callback_error`](Connection::take_callback_error).
    pub fn register_tokenizer<F>(&self, module: &str, tokenizer: &str, next: Option<F>) -> Result<()>
    where
        F: Fn(&str) -> Option<(String, Range<usize>)> + Send + 'static,
    {
        self.db
            .borrow_mut()
            .register_tokenizer(module, tokenizer, next)
    }
}

fn validate_tokenizer_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        Err(Error::InvalidTokenizerName(name.to_owned()))
    } else {
        Ok(())
    }
}

impl InnerConnection {
    fn register_tokenizer<F>(&mut self, module: &str, tokenizer: &str, next: Option<F>) -> Result<()>
    where
        F: Fn(&str) -> Option<(String, Range<usize>)> + Send + 'static,
    {
        validate_tokenizer_name(module)?;
        validate_tokenizer_name(tokenizer)?;
        if next.is_some() {
            self.install_tokenizer_module(module)?;
        }
        let hook = next.map(|f| Hook::Tokenizer(Box::new(f)));
        // Cursors resolve the slot themselves; nothing to attach.
        self.install_hook(SlotKey::tokenizer(module, tokenizer), hook, |_, _| {
            ffi::SQLITE_OK
        })
    }

    fn install_tokenizer_module(&mut self, module: &str) -> Result<()> {
        if self.tokenizer_modules.contains_key(module) {
            return Ok(());
        }
        let descriptor = Box::new(ModuleDescriptor {
            base: TokenizerModule {
                i_version: 0,
                x_create: Some(create_tokenizer),
                x_destroy: Some(destroy_tokenizer),
                x_open: Some(open_cursor),
                x_close: Some(close_cursor),
                x_next: Some(next_token),
            },
            owner: self.id,
            module: module.to_owned(),
        });

        // The pointer-taking form of fts3_tokenizer() is only switched on for
        // the duration of the installation.
        let db = self.db();
        let mut previous: c_int = 0;
        unsafe {
            check!(ffi::sqlite3_db_config(
                db,
                ffi::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER,
                -1 as c_int,
                &mut previous as *mut c_int
            ));
            check!(ffi::sqlite3_db_config(
                db,
                ffi::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER,
                1 as c_int,
                ptr::null_mut::<c_int>()
            ));
        }
        let installed = self.bind_tokenizer_module(module, &descriptor);
        let restored = unsafe {
            ffi::sqlite3_db_config(
                db,
                ffi::SQLITE_DBCONFIG_ENABLE_FTS3_TOKENIZER,
                previous,
                ptr::null_mut::<c_int>(),
            )
        };
        installed?;

        debug!(conn = %self.id, module, "installed tokenizer module");
        // SQLite holds the address from here on, even if restoring the flag
        // fails.
        self.tokenizer_modules.insert(module.to_owned(), descriptor);
        self.decode_result(restored)
    }

    fn bind_tokenizer_module(&self, module: &str, descriptor: &ModuleDescriptor) -> Result<()> {
        let db = self.db();
        let address = (descriptor as *const ModuleDescriptor as usize).to_ne_bytes();
        let c_sql = str_to_cstring("SELECT fts3_tokenizer(?1, ?2)")?;
        let (c_module, module_len, destructor) = str_for_sqlite(module.as_bytes())?;
        unsafe {
            let mut c_stmt = ptr::null_mut();
            let r = ffi::sqlite3_prepare_v2(db, c_sql.as_ptr(), -1, &mut c_stmt, ptr::null_mut());
            self.decode_result(r)?;
            let stmt = RawStatement::new(c_stmt);
            let r = ffi::sqlite3_bind_text(stmt.ptr(), 1, c_module, module_len, destructor);
            self.decode_result(r)?;
            let r = ffi::sqlite3_bind_blob(
                stmt.ptr(),
                2,
                address.as_ptr().cast::<c_void>(),
                address.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            );
            self.decode_result(r)?;
            match stmt.step() {
                ffi::SQLITE_ROW | ffi::SQLITE_DONE => Ok(()),
                rc => Err(error_from_handle(db, rc)),
            }
        }
    }
}

unsafe extern "C" fn create_tokenizer(
    argc: c_int,
    argv: *const *const c_char,
    pp_tokenizer: *mut *mut RawTokenizer,
) -> c_int {
    if argc < 1 || argv.is_null() || (*argv).is_null() {
        return ffi::SQLITE_ERROR;
    }
    let name = CStr::from_ptr(*argv).to_string_lossy().into_owned();
    let tokenizer = Box::new(BoundTokenizer {
        base: RawTokenizer {
            p_module: ptr::null(),
        },
        name,
    });
    *pp_tokenizer = Box::into_raw(tokenizer).cast::<RawTokenizer>();
    ffi::SQLITE_OK
}

unsafe extern "C" fn destroy_tokenizer(p_tokenizer: *mut RawTokenizer) -> c_int {
    if !p_tokenizer.is_null() {
        drop(Box::from_raw(p_tokenizer.cast::<BoundTokenizer>()));
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn open_cursor(
    p_tokenizer: *mut RawTokenizer,
    p_input: *const c_char,
    n_bytes: c_int,
    pp_cursor: *mut *mut RawCursor,
) -> c_int {
    let bound = &*p_tokenizer.cast::<BoundTokenizer>();
    let descriptor = bound.base.p_module.cast::<ModuleDescriptor>();
    if descriptor.is_null() {
        return ffi::SQLITE_ERROR;
    }
    let descriptor = &*descriptor;

    let key = SlotKey::tokenizer(&descriptor.module, &bound.name);
    let Some(token) = registry::current(descriptor.owner, &key) else {
        return ffi::SQLITE_ERROR;
    };

    let bytes: &[u8] = if p_input.is_null() {
        &[]
    } else if n_bytes < 0 {
        CStr::from_ptr(p_input).to_bytes()
    } else {
        slice::from_raw_parts(p_input.cast::<u8>(), n_bytes as usize)
    };
    let Ok(input) = std::str::from_utf8(bytes) else {
        return ffi::SQLITE_ERROR;
    };

    let cursor = Box::new(BoundCursor {
        base: RawCursor { p_tokenizer },
        token,
        stream: TokenStream::new(input.to_owned()),
    });
    *pp_cursor = Box::into_raw(cursor).cast::<RawCursor>();
    ffi::SQLITE_OK
}

unsafe extern "C" fn close_cursor(p_cursor: *mut RawCursor) -> c_int {
    if !p_cursor.is_null() {
        drop(Box::from_raw(p_cursor.cast::<BoundCursor>()));
    }
    ffi::SQLITE_OK
}

unsafe extern "C" fn next_token(
    p_cursor: *mut RawCursor,
    pp_token: *mut *const c_char,
    pn_bytes: *mut c_int,
    pi_start: *mut c_int,
    pi_end: *mut c_int,
    pi_position: *mut c_int,
) -> c_int {
    let cursor = &mut *p_cursor.cast::<BoundCursor>();
    let stream = &mut cursor.stream;
    let outcome = registry::call(cursor.token.as_ptr(), HookKind::Tokenizer, |hook| match hook {
        Hook::Tokenizer(f) => stream.advance(|rest| f(rest)),
        _ => Ok(None),
    });
    let span = match outcome {
        Outcome::Returned(Some(span)) => span,
        Outcome::Returned(None) => return ffi::SQLITE_DONE,
        // Ending early would index a truncated token stream.
        Outcome::Absent | Outcome::Failed(_) => return ffi::SQLITE_ERROR,
    };
    let (Ok(n_bytes), Ok(start), Ok(end), Ok(position)) = (
        c_int::try_from(stream.current().len()),
        c_int::try_from(span.start),
        c_int::try_from(span.end),
        c_int::try_from(span.position),
    ) else {
        return ffi::SQLITE_TOOBIG;
    };
    *pp_token = stream.current().as_ptr().cast::<c_char>();
    *pn_bytes = n_bytes;
    *pi_start = start;
    *pi_end = end;
    *pi_position = position;
    ffi::SQLITE_OK
}
