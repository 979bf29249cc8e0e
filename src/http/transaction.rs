//! HTTP transaction (component C4): the sparse, per-message state the
//! connection driver and cache FSM consult — method/URL/version,
//! interesting request and response headers, the state-flag bitmap, and
//! the derived cache key.
//!
//! A request and a response parser (C3) are driven independently; this
//! module supplies each with a [`ParserEvents`] adapter that updates the
//! shared transaction state and decides, header by header, whether the
//! transaction stays cache-eligible or falls back to a blind byte tunnel.

use crate::cache::key::{CacheKey, LastModified, Range};
use crate::http::parser::{Action, MessageParser, ParserEvents, ParserKind};

/// A URL longer than this is truncated (with a trailing `"..."`) and
/// forced to tunnel rather than rejected outright.
const MAX_URL_LEN: usize = 1024;

/// A header value this long or longer never fails the connection, only
/// drops the transaction to tunnel mode.
const MAX_HEADER_VALUE_LEN: usize = 1024;

/// A header key this long or longer is also a tunnel signal, not a
/// parse failure — spec.md's "key-length capped" rule (§4.4).
const MAX_HEADER_KEY_LEN: usize = 256;

/// State-flag bitmap, hand-rolled the way `hyper::proto::h1::role`
/// keeps its own small `Flags` wrapper rather than pulling in `bitflags`
/// for one struct.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxnFlags(u32);

impl TxnFlags {
    pub const REQ_HDRS_COMPLETE: u32 = 1 << 0;
    pub const REQ_COMPLETE_OK: u32 = 1 << 1;
    pub const REQ_COMPLETE_EOF: u32 = 1 << 2;
    pub const RESP_HDRS_COMPLETE: u32 = 1 << 3;
    pub const RESP_COMPLETE_OK: u32 = 1 << 4;
    pub const RESP_COMPLETE_EOF: u32 = 1 << 5;
    pub const HTTP_TUNNEL: u32 = 1 << 6;
    pub const CHUNKED: u32 = 1 << 7;
    pub const HEAD_REQUEST: u32 = 1 << 8;
    pub const REQ_WITH_HOST: u32 = 1 << 9;
    pub const CACHE_HIT: u32 = 1 << 10;
    pub const CACHE_MISS: u32 = 1 << 11;
    pub const CACHE_CSUM_MISS: u32 = 1 << 12;
    pub const DONE_ERROR: u32 = 1 << 13;
    pub const DONE_UNSUPPORTED: u32 = 1 << 14;

    fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    /// `http_tunnel` is monotonic: once set, never cleared.
    pub fn is_tunnel(&self) -> bool {
        self.has(Self::HTTP_TUNNEL)
    }

    /// `done_error | done_unsupported` — absorbing: once either is set the
    /// transaction accepts no further progress.
    pub fn done_forced(&self) -> bool {
        self.has(Self::DONE_ERROR) || self.has(Self::DONE_UNSUPPORTED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    NotPresent,
    Public,
    Private,
    NoCache,
    Other,
}

impl Default for CacheControl {
    fn default() -> CacheControl {
        CacheControl::NotPresent
    }
}

#[derive(Default)]
pub struct Transaction {
    req_parser: MessageParser,
    resp_parser: MessageParser,
    flags: TxnFlags,

    method: Vec<u8>,
    raw_url: Vec<u8>,
    url: Option<String>,
    req_version_minor: Option<u8>,
    resp_version_minor: Option<u8>,
    host: Option<String>,
    req_content_length: Option<u64>,

    status_code: Option<u16>,
    resp_content_length: Option<u64>,
    content_range: Option<Range>,
    /// The object's full length (`LEN` in `Content-Range: bytes BEG-END/LEN`),
    /// distinct from the range span — this is what `get_cache_key()` reports
    /// as `obj_full_len` for a ranged response.
    range_object_full_len: Option<u64>,
    last_modified: Option<LastModified>,
    content_encoding: Option<String>,
    content_md5: Option<String>,
    digest_sha1: Option<String>,
    digest_md5: Option<String>,
    etag: Option<String>,
    cache_control: CacheControl,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            req_parser: MessageParser::new(ParserKind::Request),
            resp_parser: MessageParser::new(ParserKind::Response),
            ..Default::default()
        }
    }

    /// Resets everything for the next pipelined request on the same
    /// connection (`trans_completed`).
    pub fn reset(&mut self) {
        *self = Transaction::new();
    }

    pub fn flags(&self) -> TxnFlags {
        self.flags
    }

    /// External command: force this transaction into tunnel mode
    /// regardless of what the parsers have seen so far.
    pub fn force_http_tunnel(&mut self) {
        self.flags.set(TxnFlags::HTTP_TUNNEL);
    }

    /// Keep-alive requires both legs to agree; this transaction
    /// tracks only the HTTP version (the interesting-header table carries
    /// no `Connection` entry), so HTTP/1.0 is always treated as close and
    /// HTTP/1.1 as keep-alive on both sides.
    pub fn is_keep_alive(&self) -> bool {
        self.req_version_minor == Some(1) && self.resp_version_minor == Some(1)
    }

    pub fn method(&self) -> &[u8] {
        &self.method
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Only defined once response headers are complete, the
    /// transaction hasn't been forced done, and it isn't tunneling.
    pub fn get_cache_key(&self) -> Option<CacheKey> {
        if !self.flags.has(TxnFlags::RESP_HDRS_COMPLETE) || self.flags.done_forced() || self.flags.is_tunnel() {
            return None;
        }
        let url = self.url.clone()?;
        let obj_full_len = match self.content_range {
            Some(_) => self.range_object_full_len?,
            None => self.resp_content_length?,
        };
        if obj_full_len == 0 {
            return None;
        }
        let key = CacheKey {
            url,
            cache_url: None,
            obj_full_len,
            last_modified: self.last_modified.unwrap_or(LastModified::Crc32(0)),
            range: self.content_range,
            content_encoding: self.content_encoding.clone(),
            content_md5: self.content_md5.clone(),
            digest_sha1: self.digest_sha1.clone(),
            digest_md5: self.digest_md5.clone(),
            etag: self.etag.clone(),
        };
        if key.is_well_formed() {
            Some(key)
        } else {
            None
        }
    }

    pub fn req_parser(&self) -> &MessageParser {
        &self.req_parser
    }

    pub fn resp_parser(&self) -> &MessageParser {
        &self.resp_parser
    }

    /// Feeds request-leg bytes to the request parser. The parser is
    /// temporarily taken out of `self` so the event adapter can borrow the
    /// rest of the transaction mutably — `MessageParser` never borrows back
    /// into `Transaction`, so this is a plain ownership shuffle, not a
    /// workaround for a real aliasing problem.
    pub fn on_req_data(&mut self, data: &[u8]) -> crate::error::Result<usize> {
        let mut parser = std::mem::replace(&mut self.req_parser, MessageParser::new(ParserKind::Request));
        let mut events = ReqEvents { txn: self };
        let result = parser.execute(data, &mut events);
        self.req_parser = parser;
        result
    }

    pub fn on_resp_data(&mut self, data: &[u8]) -> crate::error::Result<usize> {
        let mut parser = std::mem::replace(&mut self.resp_parser, MessageParser::new(ParserKind::Response));
        let mut events = RespEvents { txn: self };
        let result = parser.execute(data, &mut events);
        self.resp_parser = parser;
        result
    }

    /// EOF arriving before a leg's parser reached completion forces
    /// tunnel and records the appropriate `*_complete_eof` flag.
    pub fn on_req_eof(&mut self) {
        if !self.flags.has(TxnFlags::REQ_COMPLETE_OK) {
            self.flags.set(TxnFlags::REQ_COMPLETE_EOF);
            self.flags.set(TxnFlags::HTTP_TUNNEL);
        }
    }

    pub fn on_resp_eof(&mut self) {
        if !self.flags.has(TxnFlags::RESP_COMPLETE_OK) {
            self.flags.set(TxnFlags::RESP_COMPLETE_EOF);
            self.flags.set(TxnFlags::HTTP_TUNNEL);
        }
    }

    fn finalize_url(&mut self) {
        let raw = std::mem::take(&mut self.raw_url);
        let (body, truncated) = if raw.len() > MAX_URL_LEN {
            (raw[..MAX_URL_LEN].to_vec(), true)
        } else {
            (raw, false)
        };
        if truncated {
            self.flags.set(TxnFlags::HTTP_TUNNEL);
        }
        let body = String::from_utf8_lossy(&body).into_owned();
        let mut full = if let Some(path) = body.strip_prefix('/') {
            let host = self.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
            format!("http://{host}/{path}")
        } else if body.starts_with("http://") || body.starts_with("https://") {
            body
        } else {
            format!("http://{body}")
        };
        if truncated {
            full.push_str("...");
        }
        self.url = Some(full);
    }
}

struct ReqEvents<'a> {
    txn: &'a mut Transaction,
}

impl<'a> ParserEvents for ReqEvents<'a> {
    fn on_http_version(&mut self, _major: u8, minor: u8) -> Action {
        self.txn.req_version_minor = Some(minor);
        if minor > 1 {
            self.txn.flags.set(TxnFlags::DONE_UNSUPPORTED);
            return Action::Error;
        }
        Action::Continue
    }

    fn on_method(&mut self, method: &[u8]) -> Action {
        self.txn.method = method.to_vec();
        match method {
            b"CONNECT" => {
                self.txn.flags.set(TxnFlags::DONE_UNSUPPORTED);
                Action::Error
            }
            b"HEAD" => {
                self.txn.flags.set(TxnFlags::HEAD_REQUEST);
                self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
                Action::Continue
            }
            b"GET" => Action::Continue,
            _ => {
                self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
                Action::Continue
            }
        }
    }

    fn on_url(&mut self, url: &[u8]) -> Action {
        self.txn.raw_url = url.to_vec();
        Action::Continue
    }

    fn on_header(&mut self, key: &[u8], value: &[u8]) -> Action {
        if key.len() > MAX_HEADER_KEY_LEN || value.len() > MAX_HEADER_VALUE_LEN {
            self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
            return Action::Continue;
        }
        if key.eq_ignore_ascii_case(b"host") {
            if self.txn.host.is_none() {
                self.txn.host = std::str::from_utf8(value).ok().map(|s| s.to_string());
                self.txn.flags.set(TxnFlags::REQ_WITH_HOST);
            }
        } else if key.eq_ignore_ascii_case(b"content-length") {
            match std::str::from_utf8(value).ok().and_then(|s| s.trim().parse::<u64>().ok()) {
                Some(0) => self.txn.req_content_length = Some(0),
                _ => {
                    self.txn.req_content_length = None;
                    self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
                }
            }
        } else if key.eq_ignore_ascii_case(b"upgrade") || key.eq_ignore_ascii_case(b"authorization") {
            self.txn.flags.set(TxnFlags::DONE_UNSUPPORTED);
            return Action::Error;
        }
        Action::Continue
    }

    fn on_hdrs_end(&mut self) -> Action {
        self.txn.flags.set(TxnFlags::REQ_HDRS_COMPLETE);
        self.txn.finalize_url();
        // Every non-tunnel request has already been confirmed to carry a
        // zero (or absent) Content-Length, so the request body — if any —
        // is never inspected; tunnel mode forwards it byte-for-byte at the
        // connection level instead.
        Action::SkipBody
    }

    fn on_msg_end(&mut self) {
        self.txn.flags.set(TxnFlags::REQ_COMPLETE_OK);
    }
}

struct RespEvents<'a> {
    txn: &'a mut Transaction,
}

impl<'a> ParserEvents for RespEvents<'a> {
    fn on_http_version(&mut self, _major: u8, minor: u8) -> Action {
        self.txn.resp_version_minor = Some(minor);
        Action::Continue
    }

    fn on_status_code(&mut self, code: u16) -> Action {
        self.txn.status_code = Some(code);
        if code != 200 && code != 206 {
            self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
        }
        Action::Continue
    }

    fn on_header(&mut self, key: &[u8], value: &[u8]) -> Action {
        if key.len() > MAX_HEADER_KEY_LEN {
            self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
            return Action::Continue;
        }
        // Transfer-Encoding and Content-Length are always inspected, even
        // once a transaction has already fallen to tunnel; every
        // other interesting header is skipped once tunneling.
        if key.eq_ignore_ascii_case(b"transfer-encoding") {
            if value.eq_ignore_ascii_case(b"chunked") {
                self.txn.flags.set(TxnFlags::CHUNKED);
                self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
            }
            return Action::Continue;
        }
        if key.eq_ignore_ascii_case(b"content-length") {
            let parsed = std::str::from_utf8(value).ok().and_then(|s| s.trim().parse::<u64>().ok());
            match parsed {
                Some(n) => {
                    if let Some(range) = self.txn.content_range {
                        if range.end.saturating_sub(range.begin) + 1 != n {
                            self.txn.flags.set(TxnFlags::DONE_ERROR);
                            return Action::Error;
                        }
                    }
                    self.txn.resp_content_length = Some(n);
                }
                None => {
                    self.txn.flags.set(TxnFlags::DONE_ERROR);
                    return Action::Error;
                }
            }
            return Action::Continue;
        }

        if self.txn.flags.is_tunnel() {
            return Action::Continue;
        }
        if value.len() > MAX_HEADER_VALUE_LEN {
            self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
            return Action::Continue;
        }

        if key.eq_ignore_ascii_case(b"content-range") {
            if self.txn.content_range.is_none() {
                match parse_content_range(value) {
                    Some((range, len)) => {
                        if let Some(cl) = self.txn.resp_content_length {
                            if range.end.saturating_sub(range.begin) + 1 != cl {
                                self.txn.flags.set(TxnFlags::DONE_ERROR);
                                return Action::Error;
                            }
                        }
                        self.txn.content_range = Some(range);
                        self.txn.range_object_full_len = Some(len);
                    }
                    None => {
                        self.txn.flags.set(TxnFlags::DONE_ERROR);
                        return Action::Error;
                    }
                }
            }
        } else if key.eq_ignore_ascii_case(b"last-modified") {
            if self.txn.last_modified.is_none() {
                self.txn.last_modified = Some(LastModified::from_header_value(value));
            }
        } else if key.eq_ignore_ascii_case(b"content-encoding") {
            if self.txn.status_code == Some(206) {
                self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
            } else if self.txn.content_encoding.is_none() {
                self.txn.content_encoding = std::str::from_utf8(value).ok().map(|s| s.to_string());
            }
        } else if key.eq_ignore_ascii_case(b"content-md5") {
            if self.txn.content_md5.is_none() {
                self.txn.content_md5 = std::str::from_utf8(value).ok().map(|s| s.to_string());
            }
        } else if key.eq_ignore_ascii_case(b"etag") {
            if self.txn.etag.is_none() {
                self.txn.etag = std::str::from_utf8(value).ok().map(|s| s.to_string());
            }
        } else if key.eq_ignore_ascii_case(b"digest") {
            if self.txn.digest_sha1.is_none() && self.txn.digest_md5.is_none() {
                if let Some(s) = std::str::from_utf8(value).ok() {
                    let mut tokens = s.split(',').map(|t| t.trim());
                    let first = tokens.next();
                    if tokens.next().is_some() {
                        // More than one digest token: not a single sha=/md5=.
                        self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
                    } else if let Some(tok) = first {
                        if let Some(v) = tok.strip_prefix("sha=") {
                            self.txn.digest_sha1 = Some(v.to_string());
                        } else if let Some(v) = tok.strip_prefix("md5=") {
                            self.txn.digest_md5 = Some(v.to_string());
                        } else {
                            self.txn.flags.set(TxnFlags::HTTP_TUNNEL);
                        }
                    }
                }
            }
        } else if key.eq_ignore_ascii_case(b"cache-control") {
            let lower = String::from_utf8_lossy(value).to_ascii_lowercase();
            let category = if lower.contains("no-store") || lower.contains("no-cache") {
                CacheControl::NoCache
            } else if lower.contains("public") {
                CacheControl::Public
            } else if lower.contains("private") {
                CacheControl::Private
            } else {
                CacheControl::Other
            };
            self.txn.cache_control = category;
        } else if key.eq_ignore_ascii_case(b"pragma") {
            let lower = String::from_utf8_lossy(value).to_ascii_lowercase();
            if lower.contains("no-cache") {
                self.txn.cache_control = CacheControl::NoCache;
            }
        } else if key.eq_ignore_ascii_case(b"www-authenticate") {
            self.txn.flags.set(TxnFlags::DONE_UNSUPPORTED);
            return Action::Error;
        }
        Action::Continue
    }

    fn on_hdrs_end(&mut self) -> Action {
        self.txn.flags.set(TxnFlags::RESP_HDRS_COMPLETE);
        if self.txn.flags.has(TxnFlags::HEAD_REQUEST) {
            return Action::SkipBody;
        }
        match (self.txn.resp_content_length, self.txn.flags.has(TxnFlags::CHUNKED)) {
            (_, true) => Action::SkipBody,
            (None, false) => Action::SkipBody,
            (Some(len), false) => {
                self.txn.resp_parser_set_length(len);
                Action::Continue
            }
        }
    }

    fn on_msg_end(&mut self) {
        self.txn.flags.set(TxnFlags::RESP_COMPLETE_OK);
    }
}

impl Transaction {
    fn resp_parser_set_length(&mut self, len: u64) {
        self.resp_parser.set_content_length(len);
    }
}

/// Parses a `Content-Range: bytes BEG-END/LEN` value. Any other
/// unit, or a malformed range, is rejected. Returns the range together
/// with the object's full length (`LEN`) so the caller can validate
/// `end < len` and carry the real object length into the cache key —
/// `obj_full_len` is the object's total size, not the range span.
fn parse_content_range(value: &[u8]) -> Option<(Range, u64)> {
    let s = std::str::from_utf8(value).ok()?.trim();
    let rest = s.strip_prefix("bytes ")?;
    let (range_part, len_part) = rest.split_once('/')?;
    let (begin_s, end_s) = range_part.split_once('-')?;
    let begin: u64 = begin_s.trim().parse().ok()?;
    let end: u64 = end_s.trim().parse().ok()?;
    let len: u64 = len_part.trim().parse().ok()?;
    if end < begin || end >= len {
        return None;
    }
    Some((Range { begin, end }, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_with_host_builds_absolute_url() {
        let mut txn = Transaction::new();
        let req = b"GET /a/b HTTP/1.1\r\nHost: example.invalid\r\n\r\n";
        txn.on_req_data(req).unwrap();
        assert!(!txn.flags().is_tunnel());
        assert_eq!(txn.url(), Some("http://example.invalid/a/b"));
    }

    #[test]
    fn oversized_header_key_forces_tunnel() {
        let mut txn = Transaction::new();
        let long_key = "X-".to_string() + &"a".repeat(MAX_HEADER_KEY_LEN);
        let req = format!("GET /a HTTP/1.1\r\nHost: h\r\n{long_key}: v\r\n\r\n");
        txn.on_req_data(req.as_bytes()).unwrap();
        assert!(txn.flags().is_tunnel());
    }

    #[test]
    fn head_request_forces_tunnel() {
        let mut txn = Transaction::new();
        let req = b"HEAD /a HTTP/1.1\r\nHost: h\r\n\r\n";
        txn.on_req_data(req).unwrap();
        assert!(txn.flags().is_tunnel());
        assert!(txn.flags().has(TxnFlags::HEAD_REQUEST));
    }

    #[test]
    fn connect_method_is_unsupported() {
        let mut txn = Transaction::new();
        let req = b"CONNECT example.invalid:443 HTTP/1.1\r\nHost: h\r\n\r\n";
        let _ = txn.on_req_data(req);
        assert!(txn.flags().has(TxnFlags::DONE_UNSUPPORTED));
    }

    #[test]
    fn chunked_response_forces_tunnel_and_no_cache_key() {
        let mut txn = Transaction::new();
        txn.on_req_data(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let resp = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let _ = txn.on_resp_data(resp);
        assert!(txn.flags().has(TxnFlags::CHUNKED));
        assert!(txn.flags().is_tunnel());
        assert!(txn.get_cache_key().is_none());
    }

    #[test]
    fn plain_200_response_yields_cache_key() {
        let mut txn = Transaction::new();
        txn.on_req_data(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nLast-Modified: Tue, 01 Jan 2030 00:00:00 GMT\r\n\r\n";
        txn.on_resp_data(resp).unwrap();
        let key = txn.get_cache_key().expect("should have a cache key");
        assert_eq!(key.obj_full_len, 5);
        assert!(matches!(key.last_modified, LastModified::UnixTime(_)));
    }

    #[test]
    fn content_range_mismatch_with_length_is_done_error() {
        let mut txn = Transaction::new();
        txn.on_req_data(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let resp = b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\nContent-Range: bytes 0-99/200\r\n\r\n";
        let _ = txn.on_resp_data(resp);
        assert!(txn.flags().has(TxnFlags::DONE_ERROR));
    }

    #[test]
    fn content_range_end_past_len_is_done_error() {
        let mut txn = Transaction::new();
        txn.on_req_data(b"GET /v HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let resp = b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 90-109/100\r\n\r\n";
        let _ = txn.on_resp_data(resp);
        assert!(txn.flags().has(TxnFlags::DONE_ERROR));
    }

    #[test]
    fn range_response_cache_key_uses_object_full_length_not_range_span() {
        let mut txn = Transaction::new();
        txn.on_req_data(b"GET /v HTTP/1.1\r\nHost: h\r\nRange: bytes=10-19\r\n\r\n").unwrap();
        let resp =
            b"HTTP/1.1 206 Partial Content\r\nContent-Length: 10\r\nContent-Range: bytes 10-19/100\r\n\r\n";
        txn.on_resp_data(resp).unwrap();
        let key = txn.get_cache_key().expect("should have a cache key");
        assert_eq!(key.obj_full_len, 100);
        assert_eq!(key.range, Some(Range { begin: 10, end: 19 }));
    }
}
