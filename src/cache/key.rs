//! Cache key: identifies a stored object well enough to validate a
//! checksum-compare against freshly-arrived origin bytes.

/// Last-Modified, either a parsed unix timestamp or, when none of the
/// accepted date formats match, a CRC-32 fallback over the raw header
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastModified {
    UnixTime(i64),
    Crc32(u32),
}

impl LastModified {
    pub fn from_header_value(raw: &[u8]) -> LastModified {
        if let Some(ts) = parse_http_date(raw) {
            LastModified::UnixTime(ts)
        } else {
            LastModified::Crc32(crc32fast::hash(raw))
        }
    }
}

/// Accepts RFC 1123, RFC 850, and asctime date formats (the formats
/// `httpdate` parses), tolerating the NNTP-style variants and optional
/// trailing " GMT"/" UTC"/" +0000" by trimming them first.
fn parse_http_date(raw: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(raw).ok()?.trim();
    for suffix in [" GMT", " UTC", " +0000"] {
        if let Some(trimmed) = s.strip_suffix(suffix) {
            if let Ok(t) = httpdate::parse_http_date(&format!("{trimmed} GMT")) {
                return t.duration_since(std::time::UNIX_EPOCH).ok().map(|d| d.as_secs() as i64);
            }
        }
    }
    httpdate::parse_http_date(s)
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

/// Inclusive byte range, as recorded from a `Content-Range` response
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub url: String,
    pub cache_url: Option<String>,
    pub obj_full_len: u64,
    pub last_modified: LastModified,
    pub range: Option<Range>,
    pub content_encoding: Option<String>,
    pub content_md5: Option<String>,
    pub digest_sha1: Option<String>,
    pub digest_md5: Option<String>,
    pub etag: Option<String>,
}

impl CacheKey {
    /// A key is well-formed only with a non-empty URL and a positive
    /// object length.
    pub fn is_well_formed(&self) -> bool {
        !self.url.is_empty() && self.obj_full_len > 0
    }
}
