//! Switchable origin read stream (component C2).
//!
//! The origin leg starts life as a plain TCP socket. Exactly once per
//! connection, after a successful checksum compare, it may be replaced
//! in-place by a cache-handle-backed reader. Kept as a
//! tagged enum rather than `Box<dyn AsyncRead>` so the common TCP path never
//! pays for a vtable indirection, keeping the variant inline instead.
//!
//! C2's contract is read-only (`async_read_some`, `shutdown`, `close`,
//! `is_open`) — writing request bytes to origin is a separate concern the
//! handler (C7) owns directly over the TCP stream's write half, which is
//! why this type only ever wraps the *read* half of the origin connection.

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;

use crate::cache::client::{CacheClient, ReadHandle};
use crate::error::Result;

/// Outcome of a single `read_some` call.
pub enum ReadOutcome {
    /// `n` bytes were placed into the caller's buffer.
    Data(usize),
    /// The underlying source reached end-of-file.
    Eof,
}

/// The origin byte source: either the real TCP connection to the origin
/// server, or — after a cache hit switch — a reader over the cache handle.
pub enum OriginStream {
    Tcp(OwnedReadHalf),
    Cache(ReadHandle),
}

impl OriginStream {
    pub fn tcp(read_half: OwnedReadHalf) -> OriginStream {
        OriginStream::Tcp(read_half)
    }

    /// True once this stream has been switched to the cache-backed form.
    pub fn is_switched(&self) -> bool {
        matches!(self, OriginStream::Cache(_))
    }

    /// Replaces the stream in place with a cache-backed reader. Only valid
    /// to call once per connection, and only while origin receive is
    /// paused — the cache FSM is the sole caller. Returns the
    /// dropped TCP read half so the caller can tear down the origin
    /// connection (we no longer need it: the whole object is in the cache).
    pub fn switch_to_cache(&mut self, handle: ReadHandle) {
        *self = OriginStream::Cache(handle);
    }

    /// Reads into `buf`, reporting `Eof` distinctly from a zero-length data
    /// read so callers can distinguish "nothing available yet" (which
    /// cannot happen here — this call always awaits readiness) from a true
    /// end of stream. For the cache-backed form, EOF is the signal the
    /// handler dispatches through `on_switched_stream_eof` rather than a
    /// plain receive-EOF.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let n = match self {
            OriginStream::Tcp(s) => s.read(buf).await?,
            OriginStream::Cache(h) => match h.read(buf).await {
                Ok(n) => n,
                Err(e) if e.is_cache() && e.cache_kind() == Some(crate::error::CacheErrorKind::ObjectNotPresent) => 0,
                Err(e) => return Err(e),
            },
        };
        if n == 0 {
            Ok(ReadOutcome::Eof)
        } else {
            Ok(ReadOutcome::Data(n))
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        if let OriginStream::Cache(h) = self {
            h.close().await?;
        }
        Ok(())
    }
}

/// Placeholder used so `cache::client` doesn't need a circular import on
/// `CacheClient` here; kept for doc-linking only.
#[allow(dead_code)]
fn _assert_cache_client_object_safe(_c: &dyn CacheClient) {}
