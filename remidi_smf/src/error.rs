//! Error kinds, the thin error wrapper and the thread-local status registry.

use core::fmt;
use std::{cell::Cell, io, panic::Location};

/// The broad classification of a failure while reading or writing.
///
/// As a library consumer, detailed errors about what specific part of the
/// format was violated are rarely actionable, so errors fall into a small
/// closed set of kinds. The message string narrows the cause for humans and
/// is not part of the stable interface.
#[derive(Copy, Clone, Debug)]
pub enum ErrorKind {
    /// A structural violation that no recovery heuristic covers.
    Format(&'static str),
    /// The input ended before data it announced.
    Eof(&'static str),
    /// The input exceeds the size cap of its reader.
    TooLarge(&'static str),
}
impl ErrorKind {
    /// The informative message on what exactly was not respected.
    #[inline]
    pub fn message(&self) -> &'static str {
        match *self {
            ErrorKind::Format(msg) | ErrorKind::Eof(msg) | ErrorKind::TooLarge(msg) => msg,
        }
    }

    /// The coarse status code mirrored into the registry.
    #[inline]
    pub fn status(&self) -> Status {
        match self {
            ErrorKind::Format(_) => Status::Format,
            ErrorKind::Eof(_) => Status::Eof,
            ErrorKind::TooLarge(_) => Status::TooLarge,
        }
    }
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Format(msg) => write!(f, "invalid midi: {}", msg),
            ErrorKind::Eof(msg) => write!(f, "truncated midi: {}", msg),
            ErrorKind::TooLarge(msg) => write!(f, "oversized input: {}", msg),
        }
    }
}

/// An error origin: the kind plus the raise site, baked into the binary as
/// a static so raising an error is a pointer copy.
#[derive(Debug)]
pub struct ErrorSite {
    pub kind: ErrorKind,
    pub file: &'static str,
    pub line: u32,
}

macro_rules! err_format {
    ($msg:expr) => {{
        const SITE: &'static $crate::error::ErrorSite = &$crate::error::ErrorSite {
            kind: $crate::error::ErrorKind::Format($msg),
            file: file!(),
            line: line!(),
        };
        SITE
    }};
}
macro_rules! err_eof {
    ($msg:expr) => {{
        const SITE: &'static $crate::error::ErrorSite = &$crate::error::ErrorSite {
            kind: $crate::error::ErrorKind::Eof($msg),
            file: file!(),
            line: line!(),
        };
        SITE
    }};
}
macro_rules! err_too_large {
    ($msg:expr) => {{
        const SITE: &'static $crate::error::ErrorSite = &$crate::error::ErrorSite {
            kind: $crate::error::ErrorKind::TooLarge($msg),
            file: file!(),
            line: line!(),
        };
        SITE
    }};
}

macro_rules! bail {
    ($err:expr) => {
        return Err(::core::convert::Into::into($err))
    };
}
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            bail!($err);
        }
    };
}

#[cfg(debug_assertions)]
mod error_impl {
    use super::{Error, ErrorExt, ErrorSite};

    pub type ErrorInner = Box<Chained>;

    #[derive(Clone, Debug)]
    pub struct Chained {
        this: &'static ErrorSite,
        src: Option<Error>,
    }
    impl ErrorExt for Error {
        #[inline]
        fn site(&self) -> &'static ErrorSite {
            self.inner.this
        }
        #[inline]
        fn source(&self) -> Option<&Error> {
            self.inner.src.as_ref()
        }
        #[inline]
        fn chain_ctx(self, ctx: &'static ErrorSite) -> Error {
            Error {
                inner: Chained {
                    this: ctx,
                    src: Some(self),
                }
                .into(),
            }
        }
    }
    impl From<&'static ErrorSite> for Error {
        #[inline]
        fn from(site: &'static ErrorSite) -> Error {
            Error {
                inner: Chained {
                    this: site,
                    src: None,
                }
                .into(),
            }
        }
    }
}

#[cfg(not(debug_assertions))]
mod error_impl {
    use super::{Error, ErrorExt, ErrorSite};

    /// In release mode errors are just a thin pointer.
    pub type ErrorInner = &'static ErrorSite;
    impl ErrorExt for Error {
        #[inline]
        fn site(&self) -> &'static ErrorSite {
            self.inner
        }
        #[inline]
        fn source(&self) -> Option<&Error> {
            None
        }
        #[inline]
        fn chain_ctx(self, ctx: &'static ErrorSite) -> Error {
            Error { inner: ctx }
        }
    }
    impl From<&'static ErrorSite> for Error {
        #[inline]
        fn from(inner: &'static ErrorSite) -> Error {
            Error { inner }
        }
    }
}

/// An error while reading an SMF or MUS file.
///
/// This type wraps a static error site and includes an error chain in debug
/// mode. In release mode it is a thin pointer, so `source` always returns
/// `None` there.
#[derive(Clone)]
pub struct Error {
    inner: self::error_impl::ErrorInner,
}
impl Error {
    /// More information about the error itself.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.site().kind
    }

    /// Where the error was raised.
    #[inline]
    pub fn site(&self) -> &'static ErrorSite {
        ErrorExt::site(self)
    }

    /// The underlying cause, tracked in debug builds only.
    #[inline]
    pub fn source(&self) -> Option<&Error> {
        ErrorExt::source(self)
    }
}
impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind())?;
        let mut maybe_src = self.source();
        while let Some(src) = maybe_src {
            writeln!(f)?;
            write!(f, "  caused by: {}", src.kind())?;
            maybe_src = src.source();
        }
        Ok(())
    }
}
impl std::error::Error for Error {
    #[inline]
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Error::source(self).map(|err| err as &(dyn std::error::Error + 'static))
    }
}

trait ErrorExt {
    fn site(&self) -> &'static ErrorSite;
    fn source(&self) -> Option<&Error>;
    fn chain_ctx(self, ctx: &'static ErrorSite) -> Error;
}

pub(crate) trait ResultExt<T> {
    fn context(self, ctx: &'static ErrorSite) -> StdResult<T, Error>;
}
impl<T> ResultExt<T> for StdResult<T, Error> {
    #[inline]
    fn context(self, ctx: &'static ErrorSite) -> StdResult<T, Error> {
        self.map_err(|err| ErrorExt::chain_ctx(err, ctx))
    }
}
impl<T> ResultExt<T> for StdResult<T, &'static ErrorSite> {
    #[inline]
    fn context(self, ctx: &'static ErrorSite) -> StdResult<T, Error> {
        self.map_err(|site| ErrorExt::chain_ctx(Error::from(site), ctx))
    }
}

/// An error from a path-level helper: either the file could not be read or
/// written, or its contents could not be parsed.
#[derive(Debug)]
pub enum FileError {
    Io(io::Error),
    Parse(Error),
}
impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileError::Io(err) => write!(f, "error accessing midi file: {}", err),
            FileError::Parse(err) => fmt::Display::fmt(err, f),
        }
    }
}
impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FileError::Io(err) => Some(err),
            FileError::Parse(err) => Some(err),
        }
    }
}
impl From<io::Error> for FileError {
    fn from(err: io::Error) -> FileError {
        record_io();
        FileError::Io(err)
    }
}
impl From<Error> for FileError {
    fn from(err: Error) -> FileError {
        FileError::Parse(err)
    }
}

/// Coarse status codes for the thread-local registry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    Format,
    Eof,
    InputIo,
    TooLarge,
}

/// The last failure recorded on the current thread.
#[derive(Copy, Clone, Debug)]
pub struct LastError {
    pub status: Status,
    pub file: &'static str,
    pub line: u32,
}

thread_local! {
    static LAST_ERROR: Cell<LastError> = Cell::new(LastError {
        status: Status::Ok,
        file: "",
        line: 0,
    });
}

/// The last error recorded by a fallible operation on the current thread.
///
/// This is a compatibility shim for callers that cannot thread `Result`
/// values around; the values returned by the public API are the primary
/// error channel. Successful operations leave the record untouched.
pub fn last_error() -> LastError {
    LAST_ERROR.with(Cell::get)
}

pub(crate) fn record(err: &Error) {
    let site = err.site();
    LAST_ERROR.with(|last| {
        last.set(LastError {
            status: site.kind.status(),
            file: site.file,
            line: site.line,
        })
    });
}

#[track_caller]
pub(crate) fn record_io() {
    let loc = Location::caller();
    LAST_ERROR.with(|last| {
        last.set(LastError {
            status: Status::InputIo,
            file: loc.file(),
            line: loc.line(),
        })
    });
}

pub(crate) trait Recorded {
    /// Mirror a failure into the thread-local registry.
    fn recorded(self) -> Self;
}
impl<T> Recorded for StdResult<T, Error> {
    fn recorded(self) -> Self {
        if let Err(err) = &self {
            record(err);
        }
        self
    }
}

/// The result type used by the parsers.
pub type Result<T> = StdResult<T, Error>;
pub(crate) use core::result::Result as StdResult;
