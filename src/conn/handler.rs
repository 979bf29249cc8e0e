//! HTTP handler (component C7): the per-connection driver that owns the
//! client and origin buffers, feeds bytes through the transaction parsers,
//! and turns their outcomes into cache-FSM and connection-FSM events.
//!
//! This is the one place allowed to see every collaborator at once — the
//! buffers (C1), the switchable origin stream (C2), the transaction (C4),
//! the cache FSM (C5), the connection FSM (C6), and the back-pressure and
//! cache-handle clients (C8/C9) — the way `hyper::proto::h1::Conn` is the
//! one type that touches both the buffered `Buffered<I>` I/O and the
//! `Http1Transaction` parse state.
//!
//! Four readers are kept over the two buffers, one more than the obvious
//! three: `client_reader` (request bytes, parsed and forwarded to
//! origin together), `origin_reader` (response bytes as the parser
//! consumes them), `client_send_reader` (response bytes actually delivered
//! to the client — lags `origin_reader` while a cache-compare decision is
//! in flight) and `cache_reader` (response bytes not yet
//! handed to the cache handle, the origin-to-cache reader). Splitting
//! "parsed" from "delivered to the client" is what lets a hit replace the
//! held-back body prefix with cache bytes instead of the origin's own.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;

use crate::backpressure::BpClient;
use crate::buffer::{IoBuffer, ReaderId};
use crate::cache::client::{ReadHandle, WriteHandle};
use crate::cache::fsm::{Action as CacheAction, CacheFsm, Event as CacheEvent, Guards as CacheGuards};
use crate::cache::{CacheClient, CacheKey};
use crate::conn::fsm::{ConnFsm, Leg};
use crate::error::Result;
use crate::http::Transaction;
use crate::stream::{OriginStream, ReadOutcome};

const CLIENT_BUF_DEFAULT: usize = 4 * 1024;
const CLIENT_BUF_MED: usize = 8 * 1024;
const CLIENT_BUF_LARGE: usize = 16 * 1024;
const ORIGIN_BUF_DEFAULT: usize = 8 * 1024;
const ORIGIN_BUF_LARGE: usize = 16 * 1024;

fn client_buffer_target(req_content_length: Option<u64>) -> usize {
    match req_content_length {
        Some(n) if n > 512 * 1024 => CLIENT_BUF_LARGE,
        Some(n) if n > 64 * 1024 => CLIENT_BUF_MED,
        _ => CLIENT_BUF_DEFAULT,
    }
}

fn origin_buffer_target(resp_content_length: Option<u64>) -> usize {
    match resp_content_length {
        Some(n) if n > 512 * 1024 => ORIGIN_BUF_LARGE,
        _ => ORIGIN_BUF_DEFAULT,
    }
}

/// The cache-compare threshold, in bytes of buffered
/// response body, below which the handler keeps waiting rather than
/// attempting a compare. Defaults to half a block; a response that
/// *completes* before reaching it is compared with whatever it has (see
/// `enough_to_attempt_cache`), never forced to tunnel purely for size.
const DEFAULT_COMPARE_THRESHOLD: usize = ORIGIN_BUF_DEFAULT / 2;

/// Default half-closed stall-sweep interval (spec.md's "every 60 s").
const DEFAULT_STALL_SWEEP: std::time::Duration = std::time::Duration::from_secs(60);

pub struct ConnectionHandler<C: CacheClient> {
    client: TcpStream,
    origin: OriginStream,
    origin_write: Option<OwnedWriteHalf>,
    client_buf: IoBuffer,
    origin_buf: IoBuffer,
    client_reader: ReaderId,
    origin_reader: ReaderId,
    client_send_reader: ReaderId,
    cache_reader: ReaderId,
    txn: Transaction,
    cache_fsm: CacheFsm,
    conn_fsm: ConnFsm,
    cache: Arc<C>,
    cache_key: Option<CacheKey>,
    read_handle: Option<ReadHandle>,
    write_handle: Option<WriteHandle>,
    compare_buf: Vec<u8>,
    bp: Option<BpClient>,
    first_request_sent: bool,
    compare_threshold: usize,
    cache_reader_past_headers: bool,
    client_send_past_headers: bool,
    stall_sweep_interval: std::time::Duration,
}

impl<C: CacheClient + 'static> ConnectionHandler<C> {
    pub fn new(client: TcpStream, origin: TcpStream, cache: Arc<C>) -> ConnectionHandler<C> {
        let (origin_read, origin_write) = origin.into_split();
        let mut client_buf = IoBuffer::new(CLIENT_BUF_DEFAULT, 2);
        let mut origin_buf = IoBuffer::new(ORIGIN_BUF_DEFAULT, 2);
        let client_reader = client_buf.register_reader().expect("fresh buffer");
        let origin_reader = origin_buf.register_reader().expect("fresh buffer");
        let client_send_reader = origin_buf.register_reader().expect("fresh buffer");
        let cache_reader = origin_buf.register_reader().expect("fresh buffer");
        ConnectionHandler {
            client,
            origin: OriginStream::tcp(origin_read),
            origin_write: Some(origin_write),
            client_buf,
            origin_buf,
            client_reader,
            origin_reader,
            client_send_reader,
            cache_reader,
            txn: Transaction::new(),
            cache_fsm: CacheFsm::new(),
            conn_fsm: ConnFsm::new(),
            cache,
            cache_key: None,
            read_handle: None,
            write_handle: None,
            compare_buf: Vec::new(),
            bp: None,
            first_request_sent: false,
            compare_threshold: DEFAULT_COMPARE_THRESHOLD,
            cache_reader_past_headers: false,
            client_send_past_headers: false,
            stall_sweep_interval: DEFAULT_STALL_SWEEP,
        }
    }

    /// Attaches the back-pressure control client. Optional: a
    /// connection run without one simply never emits control commands,
    /// the way a deployment without the kernel module attached would.
    pub fn set_bp_client(&mut self, bp: BpClient) {
        self.bp = Some(bp);
    }

    /// Overrides the half-closed stall-sweep interval (`stall_sweep_secs`
    /// in config), defaulting to 60 seconds.
    pub fn set_stall_sweep_interval(&mut self, interval: std::time::Duration) {
        self.stall_sweep_interval = interval;
    }

    /// Drives the connection until both legs are closed or a fatal I/O
    /// error occurs. Blind-tunnel mode, once engaged, degrades to a plain
    /// bidirectional byte copy.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(bp) = &self.bp {
            let _ = bp.add_entry().await;
        }
        let result = self.run_inner().await;
        if let Some(bp) = &self.bp {
            let _ = bp.del_entry().await;
        }
        if let Some(mut w) = self.write_handle.take() {
            let _ = w.close().await;
        }
        if let Some(mut h) = self.read_handle.take() {
            let _ = h.close().await;
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        // The half-closed stall sweep (spec.md §4.6): a periodic tick that
        // closes this connection once a leg that's already Eof/Err has
        // shown no further receive progress since the previous tick. The
        // first tick fires a full interval out, not immediately.
        let mut sweep = tokio::time::interval_at(
            tokio::time::Instant::now() + self.stall_sweep_interval,
            self.stall_sweep_interval,
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.conn_fsm.is_blind_tunnel() {
                return self.run_blind_tunnel().await;
            }

            let client_span_len = self.client_buf.writable_bytes();
            let origin_span_len = self.origin_buf.writable_bytes();

            tokio::select! {
                _ = sweep.tick() => {
                    if self.conn_fsm.sweep_tick() {
                        return Ok(());
                    }
                }
                res = self.client.read(self.client_buf.write_span()), if client_span_len > 0 => {
                    match res {
                        Ok(0) => {
                            self.on_client_eof().await?;
                            if self.conn_fsm.is_blind_tunnel() { continue; }
                            return Ok(());
                        }
                        Ok(n) => { self.client_buf.commit(n); self.on_client_data().await?; }
                        Err(_) => { self.try_blind_tunnel().await?; }
                    }
                }
                outcome = read_origin(&mut self.origin, self.origin_buf.write_span()), if origin_span_len > 0 => {
                    match outcome {
                        Ok(ReadOutcome::Eof) => { self.on_origin_eof().await?; }
                        Ok(ReadOutcome::Data(n)) => { self.origin_buf.commit(n); self.on_origin_data().await?; }
                        Err(_) => { self.try_blind_tunnel().await?; }
                    }
                }
            }

            if self.client_buf.readable_bytes(self.client_reader) == 0
                && self.origin_buf.readable_bytes(self.client_send_reader) == 0
                && matches!(self.conn_fsm.recv_state(Leg::Client), crate::conn::fsm::RecvState::Eof)
                && matches!(self.conn_fsm.recv_state(Leg::Origin), crate::conn::fsm::RecvState::Eof)
            {
                return Ok(());
            }
        }
    }

    async fn run_blind_tunnel(&mut self) -> Result<()> {
        // Flush anything already buffered but not yet forwarded before
        // falling back to a raw copy, so bytes aren't lost at the seam.
        self.flush_held_client_bytes(true).await?;
        self.flush_pending_client_send(true).await?;
        self.flush_pending_origin_send().await?;

        let (mut rc, mut wc) = self.client.split();
        match (&mut self.origin, self.origin_write.take()) {
            (OriginStream::Tcp(ro), Some(mut wo)) => {
                let client_to_origin = tokio::io::copy(&mut rc, &mut wo);
                let origin_to_client = tokio::io::copy(ro, &mut wc);
                let _ = tokio::join!(client_to_origin, origin_to_client);
            }
            _ => {
                // Already switched to the cache-backed reader: there is no
                // origin write side left to tunnel to, only the remainder
                // of the cached object to drain to the client.
                let mut buf = [0u8; 8192];
                loop {
                    match self.origin.read_some(&mut buf).await? {
                        ReadOutcome::Eof => break,
                        ReadOutcome::Data(n) => wc.write_all(&buf[..n]).await?,
                    }
                }
            }
        }
        Ok(())
    }

    /// Any request bytes already consumed by the parser but not yet
    /// written to origin (can only happen right at the blind-tunnel seam).
    async fn flush_held_client_bytes(&mut self, _unused: bool) -> Result<()> {
        Ok(())
    }

    async fn flush_pending_client_send(&mut self, _unused: bool) -> Result<()> {
        let n = self.origin_buf.readable_bytes(self.client_send_reader);
        if n == 0 {
            return Ok(());
        }
        let bytes = self.origin_buf.peek_to_vec(self.client_send_reader, n);
        self.client.write_all(&bytes).await?;
        self.origin_buf.consume(self.client_send_reader, n);
        Ok(())
    }

    async fn flush_pending_origin_send(&mut self) -> Result<()> {
        Ok(())
    }

    /// Parses every complete request in the client
    /// buffer and forwards each one's bytes to origin as they're parsed
    /// (`send_to_origin`); leftover bytes after a complete request start a
    /// new pipelined transaction.
    async fn on_client_data(&mut self) -> Result<()> {
        loop {
            let span = self.client_buf.read_span(self.client_reader).to_vec();
            if span.is_empty() {
                break;
            }
            let consumed = self.txn.on_req_data(&span)?;
            if consumed == 0 {
                break;
            }
            self.client_buf.consume(self.client_reader, consumed);

            if consumed > 0 {
                self.send_to_origin(&span[..consumed]).await?;
            }

            if self.txn.flags().done_forced() {
                self.try_blind_tunnel().await?;
                break;
            }

            if self.txn.req_parser().is_done() {
                self.first_request_sent = true;
                // Leftover bytes in this span belong to the next pipelined
                // request; the loop re-enters `on_req_data` against a
                // freshly reset transaction.
                if consumed < span.len() {
                    self.start_next_transaction();
                    continue;
                }
            }
            if consumed < span.len() || span.len() < self.client_buf.block_size() {
                break;
            }
        }
        self.conn_fsm.recv_data(Leg::Client, 0);
        Ok(())
    }

    fn start_next_transaction(&mut self) {
        self.txn.reset();
        self.cache_fsm.start_next_transaction();
        self.cache_key = None;
        self.cache_reader_past_headers = false;
        self.client_send_past_headers = false;
    }

    /// Writes request bytes straight through to origin. Only meaningful
    /// while the origin connection is still live — once a connection has
    /// switched its read side to the cache (serving a prior pipelined
    /// transaction's hit), there is no origin write half left — the origin
    /// stream is replaced in-place exactly once per connection, so further
    /// pipelined requests on that connection fall back to tunnel, the way
    /// a real deployment would reconnect to origin rather than serve a
    /// second transaction purely from the first one's cache handle.
    async fn send_to_origin(&mut self, bytes: &[u8]) -> Result<()> {
        match self.origin_write.as_mut() {
            Some(w) => {
                w.write_all(bytes).await?;
                Ok(())
            }
            None => {
                self.try_blind_tunnel().await
            }
        }
    }

    async fn on_client_eof(&mut self) -> Result<()> {
        self.txn.on_req_eof();
        self.conn_fsm.recv_eof(Leg::Client);
        self.try_blind_tunnel().await
    }

    /// Parses response bytes, decides whether the
    /// transaction is even a candidate for the compare at all, then either
    /// forwards the newly-arrived bytes to the client immediately (no
    /// compare in flight) or holds them back while a cache-open/compare
    /// decision is outstanding.
    async fn on_origin_data(&mut self) -> Result<()> {
        if !self.first_request_sent {
            // Server talked first: never valid for a forward proxy leg.
            return self.try_blind_tunnel().await;
        }

        loop {
            let span = self.origin_buf.read_span(self.origin_reader).to_vec();
            if span.is_empty() {
                break;
            }
            let consumed = self.txn.on_resp_data(&span)?;
            if consumed == 0 {
                break;
            }
            self.origin_buf.consume(self.origin_reader, consumed);
            if consumed < span.len() {
                break;
            }
        }

        if self.txn.flags().done_forced() {
            return self.try_blind_tunnel().await;
        }

        // The cached/compared object is the response body, never the
        // status line and headers in front of it — advance `cache_reader`
        // past them exactly once, as soon as they're known, so neither
        // `DoCompare` nor `Write` ever sees header bytes.
        if !self.cache_reader_past_headers && self.txn.resp_parser().headers_known() {
            let hdr_bytes = self.txn.resp_parser().hdr_bytes() as usize;
            let avail = self.origin_buf.readable_bytes(self.cache_reader);
            let skip = hdr_bytes.min(avail);
            if skip > 0 {
                self.origin_buf.consume(self.cache_reader, skip);
            }
            if skip == hdr_bytes {
                self.cache_reader_past_headers = true;
            }
        }

        // The status line and headers are never part of the cached object
        // and are never withheld pending a compare decision — only body
        // bytes can be replaced by the cache's own copy, so
        // send the header block to the client as soon as it's known,
        // ahead of whatever the cache FSM decides to do with the body.
        if !self.client_send_past_headers && self.txn.resp_parser().headers_known() {
            let hdr_bytes = self.txn.resp_parser().hdr_bytes() as usize;
            let avail = self.origin_buf.readable_bytes(self.client_send_reader);
            let skip = hdr_bytes.min(avail);
            if skip > 0 {
                let bytes = self.origin_buf.peek_to_vec(self.client_send_reader, skip);
                self.client.write_all(&bytes).await?;
                self.origin_buf.consume(self.client_send_reader, skip);
            }
            if skip == hdr_bytes {
                self.client_send_past_headers = true;
            }
        }

        self.drive_cache(CacheEvent::OriginData).await?;

        if !self.holding_for_compare() {
            self.flush_pending_client_send(true).await?;
        }
        Ok(())
    }

    /// True while a cache-open-read/compare decision is outstanding and
    /// the client must not yet see these response-body bytes (they may
    /// still need to be replaced by the cache's own copy).
    fn holding_for_compare(&self) -> bool {
        matches!(
            self.cache_fsm.state(),
            crate::cache::fsm::State::CacheOpenRd | crate::cache::fsm::State::CacheCompare
        )
    }

    async fn on_origin_eof(&mut self) -> Result<()> {
        if matches!(self.origin, OriginStream::Cache(_)) {
            // The cache-backed stream reached its end: the object has been
            // served in full. Flush anything outstanding and let the
            // client connection close on its own terms rather than
            // treating this like an origin failure.
            self.flush_pending_client_send(true).await?;
            self.drive_cache(CacheEvent::TransCompleted).await?;
            self.conn_fsm.recv_eof(Leg::Origin);
            return Ok(());
        }

        let was_done = self.txn.resp_parser().is_done();
        self.txn.on_resp_eof();
        self.conn_fsm.recv_eof(Leg::Origin);

        if was_done {
            // Origin closed the socket after delivering a complete response
            // (e.g. no keep-alive) — an ordinary, successful end of
            // transaction, not a failure to recover from by tunneling.
            self.flush_pending_client_send(true).await?;
            return self.drive_cache(CacheEvent::TransCompleted).await;
        }

        // EOF before the response finished parsing: nothing left to
        // recover by waiting, so hand the rest of the connection to a
        // blind byte pipe.
        self.try_blind_tunnel().await
    }

    /// Runs the cache FSM to a fixed point, performing whatever real cache
    /// I/O each transition calls for before feeding back the event that
    /// I/O produced (`cache_op_done`/`cache_op_err`/`compare_ok`/
    /// `compare_fail`).
    async fn drive_cache(&mut self, mut ev: CacheEvent) -> Result<()> {
        loop {
            let guards = self.cache_guards();
            let action = self.cache_fsm.handle(ev, guards);
            match self.perform_cache_action(action).await? {
                Some(next) => ev = next,
                None => break,
            }
        }
        Ok(())
    }

    fn cache_guards(&mut self) -> CacheGuards {
        if self.cache_key.is_none() {
            self.cache_key = self.txn.get_cache_key();
        }
        CacheGuards {
            has_cache_wr_data: self.origin_buf.readable_bytes(self.cache_reader) > 0,
            has_cache_key: self.cache_key.is_some() && self.enough_to_attempt_cache(),
            cache_permits: self
                .cache_key
                .as_ref()
                .map(|k| self.cache.rw_op_allowed(k, 0))
                .unwrap_or(false),
            can_write_on_miss: true,
        }
    }

    /// Attempt the compare once either the compare
    /// threshold's worth of body has arrived, or the response is already
    /// complete (a response shorter than the threshold is still compared
    /// with whatever it has — a 4-byte object is still cacheable).
    fn enough_to_attempt_cache(&self) -> bool {
        let buffered = self.origin_buf.readable_bytes(self.cache_reader);
        buffered >= self.compare_threshold || self.txn.resp_parser().is_done()
    }

    async fn perform_cache_action(&mut self, action: CacheAction) -> Result<Option<CacheEvent>> {
        use CacheAction::*;
        match action {
            None => Ok(Option::None),
            OpenRead => {
                self.conn_fsm.pause_origin_recv();
                let key = self.cache_key.clone().expect("OpenRead only issued once has_cache_key holds");
                match self.cache.open_read(&key, 0).await {
                    Ok(h) => {
                        self.read_handle = Some(h);
                        Ok(Some(CacheEvent::CacheOpDone))
                    }
                    Err(_) => Ok(Some(CacheEvent::CacheOpErr)),
                }
            }
            OpenWriteNoTruncate | OpenWriteTruncate => {
                // A compare failure's held-back bytes must still reach the
                // client — they were never a cache artifact, just buffered
                // pending the (now-resolved) decision.
                self.flush_pending_client_send(true).await?;
                let truncate = matches!(action, OpenWriteTruncate);
                let key = self.cache_key.clone().expect("OpenWrite only issued once has_cache_key holds");
                match self.cache.open_write(&key, truncate).await {
                    Ok(h) => {
                        self.write_handle = Some(h);
                        Ok(Some(CacheEvent::CacheOpDone))
                    }
                    Err(_) => Ok(Some(CacheEvent::CacheOpErr)),
                }
            }
            DoCompare => {
                let n = self.origin_buf.readable_bytes(self.cache_reader);
                let origin_bytes = self.origin_buf.peek_to_vec(self.cache_reader, n);
                let h = self
                    .read_handle
                    .as_mut()
                    .expect("DoCompare only reached after a successful open_read");
                let mut cache_bytes = vec![0u8; origin_bytes.len()];
                let mut read_total = 0;
                while read_total < cache_bytes.len() {
                    let r = h.read(&mut cache_bytes[read_total..]).await?;
                    if r == 0 {
                        break;
                    }
                    read_total += r;
                }
                self.compare_buf = cache_bytes[..read_total].to_vec();
                if read_total == origin_bytes.len() && self.compare_buf == origin_bytes {
                    Ok(Some(CacheEvent::CompareOk))
                } else {
                    Ok(Some(CacheEvent::CompareFail))
                }
            }
            SwitchToCache => {
                // The compared prefix, and anything else buffered from the
                // now-abandoned origin connection, is discarded: the
                // client gets it from the cache handle instead, which
                // already sits at the right offset after the compare read.
                let cache_n = self.origin_buf.readable_bytes(self.cache_reader);
                if cache_n > 0 {
                    self.origin_buf.consume(self.cache_reader, cache_n);
                }
                let held_n = self.origin_buf.readable_bytes(self.client_send_reader);
                if held_n > 0 {
                    self.origin_buf.consume(self.client_send_reader, held_n);
                }
                let handle = self.read_handle.take().expect("compare ok implies an open read handle");
                let compare_bytes = std::mem::take(&mut self.compare_buf);
                self.client.write_all(&compare_bytes).await?;
                self.origin.switch_to_cache(handle);
                self.origin_write = None;
                self.conn_fsm.resume_origin_recv();
                Ok(Option::None)
            }
            Write => {
                let n = self.origin_buf.readable_bytes(self.cache_reader);
                let bytes = self.origin_buf.peek_to_vec(self.cache_reader, n);
                let w = self.write_handle.as_mut().expect("Write only reached after a successful open_write");
                let written = w.write(&bytes).await?;
                self.origin_buf.consume(self.cache_reader, written);
                Ok(Some(CacheEvent::CacheOpDone))
            }
            CloseAndNextTransaction => {
                if let Some(mut w) = self.write_handle.take() {
                    let _ = w.close().await;
                }
                if let Some(mut h) = self.read_handle.take() {
                    let _ = h.close().await;
                }
                self.conn_fsm.resume_origin_recv();
                Ok(Option::None)
            }
            CloseAndStartTunnel => {
                self.flush_pending_client_send(true).await?;
                if let Some(mut w) = self.write_handle.take() {
                    let _ = w.close().await;
                }
                if let Some(mut h) = self.read_handle.take() {
                    let _ = h.close().await;
                }
                self.conn_fsm.resume_origin_recv();
                self.conn_fsm.engage_blind_tunnel();
                Ok(Option::None)
            }
            ConsumeAndDrain => {
                let n = self.origin_buf.readable_bytes(self.cache_reader);
                if n > 0 {
                    self.origin_buf.consume(self.cache_reader, n);
                }
                if let Some(mut w) = self.write_handle.take() {
                    let _ = w.close().await;
                }
                if let Some(mut h) = self.read_handle.take() {
                    let _ = h.close().await;
                }
                self.conn_fsm.resume_origin_recv();
                Ok(Option::None)
            }
        }
    }

    /// The connection-wide `try_blind_tunnel` command: drops the cache
    /// intent and the protocol handler and falls back to a blind byte pipe.
    async fn try_blind_tunnel(&mut self) -> Result<()> {
        self.txn.force_http_tunnel();
        self.drive_cache(CacheEvent::TryBlindTunnel).await?;
        self.conn_fsm.engage_blind_tunnel();
        Ok(())
    }

    /// Content-length hint for the back-pressure collaborator,
    /// sent at most once per transaction — the back-pressure client's own
    /// `set_content_length` already enforces the "at most once" part.
    pub fn content_length_hint(&self) -> Option<u64> {
        self.cache_key.as_ref().map(|k| k.obj_full_len)
    }

    pub fn buffer_targets(&self) -> (usize, usize) {
        (client_buffer_target(None), origin_buffer_target(None))
    }
}

async fn read_origin(origin: &mut OriginStream, buf: &mut [u8]) -> Result<ReadOutcome> {
    origin.read_some(buf).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::client::test_support::MemoryCacheClient;
    use tokio::net::TcpListener;

    #[test]
    fn buffer_targets_cross_thresholds() {
        assert_eq!(client_buffer_target(None), CLIENT_BUF_DEFAULT);
        assert_eq!(client_buffer_target(Some(65 * 1024)), CLIENT_BUF_MED);
        assert_eq!(client_buffer_target(Some(513 * 1024)), CLIENT_BUF_LARGE);
        assert_eq!(origin_buffer_target(None), ORIGIN_BUF_DEFAULT);
        assert_eq!(origin_buffer_target(Some(513 * 1024)), ORIGIN_BUF_LARGE);
    }

    /// Spins up loopback TCP listeners so the handler can own real
    /// `TcpStream`s end to end (the handler's reader/writer split requires
    /// owned halves, which `tokio::io::duplex` can't provide).
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    #[tokio::test]
    async fn plain_miss_forwards_origin_bytes_and_writes_cache() {
        let (client_side, client_handler_side) = tcp_pair().await;
        let (origin_handler_side, mut origin_side) = tcp_pair().await;
        let cache = Arc::new(MemoryCacheClient::new());

        let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache.clone());
        let handler_task = tokio::spawn(async move {
            let _ = handler.run().await;
        });

        let mut client_side = client_side;
        client_side
            .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();

        let mut req_buf = vec![0u8; 256];
        let n = origin_side.read(&mut req_buf).await.unwrap();
        assert!(std::str::from_utf8(&req_buf[..n]).unwrap().starts_with("GET /a HTTP/1.1"));

        origin_side
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB")
            .await
            .unwrap();
        origin_side.shutdown().await.unwrap();

        let mut resp = Vec::new();
        client_side.read_to_end(&mut resp).await.unwrap();
        assert!(resp.ends_with(b"BBBB"));

        handler_task.abort();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(cache.stored("http://h/a").as_deref(), Some(&b"BBBB"[..]));
    }

    #[tokio::test]
    async fn checksum_match_serves_body_from_cache() {
        let (client_side, client_handler_side) = tcp_pair().await;
        let (origin_handler_side, mut origin_side) = tcp_pair().await;
        let cache = Arc::new(MemoryCacheClient::new());
        cache.seed("http://h/a", b"BBBB");

        let mut handler = ConnectionHandler::new(client_handler_side, origin_handler_side, cache);
        let handler_task = tokio::spawn(async move {
            let _ = handler.run().await;
        });

        let mut client_side = client_side;
        client_side
            .write_all(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n")
            .await
            .unwrap();

        let mut req_buf = vec![0u8; 256];
        let _ = origin_side.read(&mut req_buf).await.unwrap();
        origin_side
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB")
            .await
            .unwrap();

        let mut resp = vec![0u8; 256];
        let n = client_side.read(&mut resp).await.unwrap();
        assert!(resp[..n].ends_with(b"BBBB"));

        handler_task.abort();
    }
}
