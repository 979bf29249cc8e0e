//! HTTP message parser wrapper (component C3).
//!
//! Wraps `httparse`, which parses a complete header block in one call, into
//! a streaming, event-raising contract: bytes arrive in
//! arbitrary-sized chunks (IO-buffer spans), and the wrapper must raise
//! semantic events as soon as it has enough data, then keep accepting more
//! chunks for the body.
//!
//! Unlike a hand-rolled byte-at-a-time tokeniser, `httparse::{Request,
//! Response}::parse` already reports the exact number of bytes it consumed
//! (including the blank line terminating the header block), so this wrapper
//! doesn't need the "pause before the trailing LF, then resume" dance a
//! custom tokeniser would — `hdr_bytes()` is simply the `used` count
//! `httparse` returns.

use crate::error::{Error, Parse, Result};

const MAX_HEADERS: usize = 64;

/// Upper bound on the buffered header block before giving up (oversized
/// headers are a `http_tunnel` signal at the transaction level, not a hard
/// parse failure, but the parser still needs a ceiling to avoid unbounded
/// accumulation from a pathological peer).
const MAX_HEADER_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

/// What a notification tells the wrapper to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    /// Treat the message as complete immediately after headers (HEAD
    /// responses; responses with neither Content-Length nor
    /// Transfer-Encoding; chunked responses, since this crate tunnels them
    /// rather than parsing chunk framing).
    SkipBody,
    Error,
}

/// Callback surface the transaction (C4) implements and the wrapper drives.
pub trait ParserEvents {
    fn on_msg_begin(&mut self) {}
    fn on_http_version(&mut self, major: u8, minor: u8) -> Action {
        let _ = (major, minor);
        Action::Continue
    }
    fn on_method(&mut self, _method: &[u8]) -> Action {
        Action::Continue
    }
    fn on_url(&mut self, _url: &[u8]) -> Action {
        Action::Continue
    }
    fn on_status_code(&mut self, _code: u16) -> Action {
        Action::Continue
    }
    fn on_header(&mut self, _key: &[u8], _value: &[u8]) -> Action {
        Action::Continue
    }
    /// Headers are fully parsed; `hdr_bytes` is available. Return
    /// `SkipBody` to treat the message as complete right here, or call
    /// [`MessageParser::set_content_length`] beforehand to frame a body.
    fn on_hdrs_end(&mut self) -> Action {
        Action::Continue
    }
    fn on_msg_end(&mut self) {}
}

enum State {
    Headers,
    Body { remaining: Option<u64> },
    Done,
    Error,
}

pub struct MessageParser {
    kind: ParserKind,
    state: State,
    accum: Vec<u8>,
    hdr_bytes: Option<u64>,
    msg_bytes: u64,
    pending_length: Option<u64>,
}

impl Default for MessageParser {
    fn default() -> MessageParser {
        MessageParser::new(ParserKind::Request)
    }
}

impl MessageParser {
    pub fn new(kind: ParserKind) -> MessageParser {
        MessageParser {
            kind,
            state: State::Headers,
            accum: Vec::with_capacity(512),
            hdr_bytes: None,
            msg_bytes: 0,
            pending_length: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::Headers;
        self.accum.clear();
        self.hdr_bytes = None;
        self.msg_bytes = 0;
        self.pending_length = None;
    }

    /// Set once, at `on_hdrs_end`; equals `msg_bytes()` if headers haven't
    /// completed yet.
    pub fn hdr_bytes(&self) -> u64 {
        self.hdr_bytes.unwrap_or(self.msg_bytes)
    }

    /// True once `hdr_bytes()` reflects the real header length rather than
    /// falling back to `msg_bytes()`.
    pub fn headers_known(&self) -> bool {
        self.hdr_bytes.is_some()
    }

    pub fn msg_bytes(&self) -> u64 {
        self.msg_bytes
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, State::Error)
    }

    /// Declares the body length for framing, to be called from within
    /// `on_hdrs_end` before it returns `Continue`.
    pub fn set_content_length(&mut self, len: u64) {
        self.pending_length = Some(len);
    }

    /// Feeds `data` to the parser, invoking `events` as semantic progress
    /// is made. Returns the number of bytes consumed from `data` (always
    /// `data.len()` unless the message completed partway through it).
    pub fn execute<E: ParserEvents>(&mut self, data: &[u8], events: &mut E) -> Result<usize> {
        match self.state {
            State::Done => Ok(0),
            State::Error => Err(Error::new_parse(Parse::Header)),
            State::Headers => self.execute_headers(data, events),
            State::Body { .. } => self.execute_body(data, events),
        }
    }

    fn execute_headers<E: ParserEvents>(&mut self, data: &[u8], events: &mut E) -> Result<usize> {
        self.accum.extend_from_slice(data);
        let consumed_from_chunk = data.len();
        if self.accum.len() > MAX_HEADER_BYTES {
            self.state = State::Error;
            return Err(Error::new_parse(Parse::TooLarge));
        }

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (status, method, path, version, code) = match self.kind {
            ParserKind::Request => {
                let mut req = httparse::Request::new(&mut raw_headers);
                match req.parse(&self.accum) {
                    Ok(status) => (
                        status,
                        req.method.map(|m| m.as_bytes().to_vec()),
                        req.path.map(|p| p.as_bytes().to_vec()),
                        req.version,
                        None::<u16>,
                    ),
                    Err(e) => {
                        self.state = State::Error;
                        return Err(Error::from(e));
                    }
                }
            }
            ParserKind::Response => {
                let mut resp = httparse::Response::new(&mut raw_headers);
                match resp.parse(&self.accum) {
                    Ok(status) => (status, None, None, resp.version, resp.code),
                    Err(e) => {
                        self.state = State::Error;
                        return Err(Error::from(e));
                    }
                }
            }
        };

        let used = match status {
            httparse::Status::Partial => return Ok(consumed_from_chunk),
            httparse::Status::Complete(used) => used,
        };

        events.on_msg_begin();
        if let Some(v) = version {
            if events.on_http_version(1, v) == Action::Error {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Version));
            }
        }
        if let Some(m) = &method {
            if events.on_method(m) == Action::Error {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Method));
            }
        }
        if let Some(p) = &path {
            if events.on_url(p) == Action::Error {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Url));
            }
        }
        if let Some(c) = code {
            if events.on_status_code(c) == Action::Error {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Status));
            }
        }
        for h in raw_headers.iter().take_while(|h| !h.name.is_empty()) {
            if events.on_header(h.name.as_bytes(), h.value) == Action::Error {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Header));
            }
        }

        self.hdr_bytes = Some(used as u64);
        self.msg_bytes = used as u64;

        let action = events.on_hdrs_end();
        match action {
            Action::Error => {
                self.state = State::Error;
                return Err(Error::new_parse(Parse::Header));
            }
            Action::SkipBody => {
                events.on_msg_end();
                self.state = State::Done;
            }
            Action::Continue => {
                self.state = State::Body {
                    remaining: self.pending_length.take(),
                };
            }
        }

        // Any bytes in `accum` beyond `used` belong to the body; since
        // `accum` only ever holds this call's leftover-from-a-prior-partial
        // plus the freshly appended `data`, that leftover is exactly the
        // tail of `data`.
        let leftover = self.accum.len() - used;
        self.accum.clear();
        if leftover == 0 {
            return Ok(consumed_from_chunk);
        }
        if matches!(self.state, State::Done | State::Error) {
            return Ok(consumed_from_chunk - leftover);
        }
        let tail = &data[data.len() - leftover..];
        let sub_consumed = self.execute_body(tail, events)?;
        Ok(consumed_from_chunk - leftover + sub_consumed)
    }

    fn execute_body<E: ParserEvents>(&mut self, data: &[u8], events: &mut E) -> Result<usize> {
        let remaining = match &mut self.state {
            State::Body { remaining } => remaining,
            State::Done | State::Error => return Ok(0),
            State::Headers => unreachable!("execute_body called before headers completed"),
        };

        match remaining {
            None => {
                // No declared length and not chunked: treat all available
                // bytes as body until peer EOF (handler reports EOF
                // separately).
                self.msg_bytes += data.len() as u64;
                Ok(data.len())
            }
            Some(rem) => {
                let take = (*rem).min(data.len() as u64) as usize;
                self.msg_bytes += take as u64;
                *rem -= take as u64;
                if *rem == 0 {
                    events.on_msg_end();
                    self.state = State::Done;
                }
                Ok(take)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        headers: Vec<(Vec<u8>, Vec<u8>)>,
        hdrs_end_seen: bool,
        msg_end_seen: bool,
        content_length: Option<u64>,
    }

    impl Recorder {
        fn new() -> Recorder {
            Recorder {
                headers: Vec::new(),
                hdrs_end_seen: false,
                msg_end_seen: false,
                content_length: None,
            }
        }
    }

    impl ParserEvents for Recorder {
        fn on_header(&mut self, key: &[u8], value: &[u8]) -> Action {
            if key.eq_ignore_ascii_case(b"content-length") {
                self.content_length = std::str::from_utf8(value).ok().and_then(|s| s.parse().ok());
            }
            self.headers.push((key.to_vec(), value.to_vec()));
            Action::Continue
        }
        fn on_hdrs_end(&mut self) -> Action {
            self.hdrs_end_seen = true;
            Action::Continue
        }
        fn on_msg_end(&mut self) {
            self.msg_end_seen = true;
        }
    }

    #[test]
    fn parses_request_in_one_shot() {
        let mut p = MessageParser::new(ParserKind::Request);
        let mut r = Recorder::new();
        let data = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n";
        let n = p.execute(data, &mut r).unwrap();
        assert_eq!(n, data.len());
        assert!(r.hdrs_end_seen);
        assert_eq!(p.hdr_bytes(), data.len() as u64);
    }

    #[test]
    fn handles_split_across_chunks() {
        let mut p = MessageParser::new(ParserKind::Response);
        let mut r = Recorder::new();
        let full = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBBBB";
        let (a, b) = full.split_at(20);
        let n1 = p.execute(a, &mut r).unwrap();
        assert_eq!(n1, a.len());
        assert!(!p.is_done());
        let n2 = p.execute(b, &mut r).unwrap();
        assert_eq!(n2, b.len());
    }
}
