//! Crate-wide error type.
//!
//! Modeled on the way `hyper::Error` is built: an opaque struct wrapping a
//! private `Kind`, so callers test error *category* through `is_*` predicates
//! instead of matching on a public enum. Every fallible operation in the core
//! engine returns `Result<_, Error>`; per the connection/cache/HTTP state
//! machines, no `Error` is ever allowed to propagate past the connection
//! driver — it is always folded back into a state transition.

use std::error::Error as StdError;
use std::fmt;
use std::io;

type Cause = Box<dyn StdError + Send + Sync>;

/// The crate's error type.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    Io,
    Cache(CacheErrorKind),
    BackPressure,
    Shutdown,
    Timeout,
    Config,
    Rpc,
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Url,
    Header,
    TooLarge,
    Status,
}

/// The reasons a cache-handle operation can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorKind {
    ObjectNotPresent,
    ObjectInUse,
    AlreadyOpen,
    OperationAborted,
    Disk,
    CorruptedMeta,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    pub(crate) fn new_parse(p: Parse) -> Error {
        Error::new(Kind::Parse(p))
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub fn new_cache(kind: CacheErrorKind) -> Error {
        Error::new(Kind::Cache(kind))
    }

    pub(crate) fn new_backpressure<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::BackPressure).with(cause)
    }

    pub(crate) fn new_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(crate) fn new_rpc<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Rpc).with(cause)
    }

    /// True if this is any kind of HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// True if the message was rejected for exceeding a size limit
    /// (oversized URL, header value, or key).
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// True if this was a local or peer I/O error.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// True if this came from the cache-handle collaborator.
    pub fn is_cache(&self) -> bool {
        matches!(self.inner.kind, Kind::Cache(_))
    }

    /// The specific cache failure, if this is a cache error.
    pub fn cache_kind(&self) -> Option<CacheErrorKind> {
        match self.inner.kind {
            Kind::Cache(k) => Some(k),
            _ => None,
        }
    }

    /// True if the cache operation was cancelled rather than failed — the
    /// FSM treats this identically to a hard error except that it never
    /// logs a user-visible failure.
    pub fn is_cache_aborted(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Cache(CacheErrorKind::OperationAborted)
        )
    }

    /// True if this is a back-pressure-control transport error.
    pub fn is_backpressure(&self) -> bool {
        matches!(self.inner.kind, Kind::BackPressure)
    }

    pub(crate) fn find_source<E: StdError + 'static>(&self) -> Option<&E> {
        let mut cause = self.source();
        while let Some(err) = cause {
            if let Some(typed) = err.downcast_ref() {
                return Some(typed);
            }
            cause = err.source();
        }
        None
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("cacherelay::Error");
        builder.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            builder.field("cause", cause);
        }
        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => f.write_str("invalid method"),
            Kind::Parse(Parse::Version) => f.write_str("invalid or unsupported HTTP version"),
            Kind::Parse(Parse::Url) => f.write_str("invalid request target"),
            Kind::Parse(Parse::Header) => f.write_str("invalid header"),
            Kind::Parse(Parse::TooLarge) => f.write_str("message component too large"),
            Kind::Parse(Parse::Status) => f.write_str("invalid status line"),
            Kind::Io => f.write_str("connection error"),
            Kind::Cache(CacheErrorKind::ObjectNotPresent) => f.write_str("object not present"),
            Kind::Cache(CacheErrorKind::ObjectInUse) => f.write_str("object in use"),
            Kind::Cache(CacheErrorKind::AlreadyOpen) => f.write_str("handle already open"),
            Kind::Cache(CacheErrorKind::OperationAborted) => f.write_str("operation aborted"),
            Kind::Cache(CacheErrorKind::Disk) => f.write_str("cache disk error"),
            Kind::Cache(CacheErrorKind::CorruptedMeta) => f.write_str("corrupted cache metadata"),
            Kind::BackPressure => f.write_str("back-pressure control error"),
            Kind::Shutdown => f.write_str("shutdown error"),
            Kind::Timeout => f.write_str("timed out"),
            Kind::Config => f.write_str("configuration error"),
            Kind::Rpc => f.write_str("management RPC error"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new_io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Error {
        Error::new_parse(Parse::Header).with(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
