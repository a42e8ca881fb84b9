//! Streaming recognizer for an HTTP/1.x request head. Invoked on every
//! client read against the buffered prefix; cheap enough to re-run until
//! the terminating CRLFCRLF shows up.

pub const MAX_HEADERS: usize = 64;
pub const MAX_HEADER_NAME: usize = 128;
pub const MAX_HEADER_VALUE: usize = 8192;
pub const MAX_PATH: usize = 8192;
pub const MAX_HOST: usize = 256;
/// Declared bodies above this are refused outright.
pub const MAX_BODY_SIZE: i64 = 100 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";

pub static RESPONSE_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
    Content-Type: text/plain\r\nContent-Length: 12\r\nConnection: close\r\n\r\nBad Request\n";
pub static RESPONSE_413: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\n\
    Content-Type: text/plain\r\nContent-Length: 25\r\nConnection: close\r\n\r\nRequest Entity Too Large\n";
pub static RESPONSE_502: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\
    Content-Type: text/plain\r\nContent-Length: 12\r\nConnection: close\r\n\r\nBad Gateway\n";
pub static RESPONSE_503: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
    Content-Type: text/plain\r\nContent-Length: 20\r\nConnection: close\r\n\r\nService Unavailable\n";

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    /// Sentinel for anything unrecognized; fails validation.
    Unknown,
}

impl Method {
    fn parse(bytes: &[u8]) -> Self {
        match bytes {
            b"GET" => Self::Get,
            b"HEAD" => Self::Head,
            b"POST" => Self::Post,
            b"PUT" => Self::Put,
            b"DELETE" => Self::Delete,
            b"OPTIONS" => Self::Options,
            b"PATCH" => Self::Patch,
            _ => Self::Unknown,
        }
    }

    /// Methods whose requests carry no body unless a length says otherwise.
    #[inline]
    fn body_optional(self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Delete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Unknown,
}

/// Tri-state parse result, checked by the readable handler after every
/// successful read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// No CRLFCRLF (or declared body bytes still missing); read more.
    NeedMore,
    /// Head accepted. Any remaining body bytes stream opaquely.
    Complete,
    /// Malformed head; the connection gets a 400 and closes.
    Invalid,
}

/// Parsed request head plus the cached semantics the engine dispatches on.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub method_raw: String,
    pub path: String,
    pub version: Version,
    pub host: String,
    /// Ordered as received; duplicates preserved, never coalesced.
    pub headers: Vec<(String, String)>,
    /// -1 while unspecified.
    pub content_length: i64,
    pub chunked: bool,
    pub keep_alive: bool,
    pub is_complete: bool,
    /// Byte offset of the first byte after CRLFCRLF.
    pub head_end: usize,
    /// `head_end` plus the body length when known, else `head_end`.
    pub total_len: usize,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Unknown,
            method_raw: String::new(),
            path: String::new(),
            version: Version::Unknown,
            host: String::new(),
            headers: Vec::new(),
            content_length: -1,
            chunked: false,
            keep_alive: false,
            is_complete: false,
            head_end: 0,
            total_len: 0,
        }
    }
}

impl Request {
    pub fn reset(&mut self) {
        self.method = Method::Unknown;
        self.method_raw.clear();
        self.path.clear();
        self.version = Version::Unknown;
        self.host.clear();
        self.headers.clear();
        self.content_length = -1;
        self.chunked = false;
        self.keep_alive = false;
        self.is_complete = false;
        self.head_end = 0;
        self.total_len = 0;
    }

    /// Parses the buffered prefix `buf`; `cap` is the buffer capacity, used
    /// to decide when a declared body can never be buffered whole and must
    /// stream instead. Re-parses from scratch on every call.
    pub fn parse(&mut self, buf: &[u8], cap: usize) -> ParseStatus {
        self.reset();
        let Some(head_len) = find(buf, HEAD_END) else {
            return ParseStatus::NeedMore;
        };
        self.head_end = head_len + HEAD_END.len();

        let head = &buf[..head_len];
        let (request_line, mut rest) = match find(head, CRLF) {
            Some(at) => (&head[..at], &head[at + CRLF.len()..]),
            None => (head, &[][..]),
        };
        if !self.parse_request_line(request_line) {
            return ParseStatus::Invalid;
        }

        while !rest.is_empty() {
            let (line, tail) = match find(rest, CRLF) {
                Some(at) => (&rest[..at], &rest[at + CRLF.len()..]),
                None => (rest, &[][..]),
            };
            rest = tail;
            if !self.parse_header_line(line) {
                return ParseStatus::Invalid;
            }
        }

        self.keep_alive = self.keep_alive_decision();
        self.completeness(buf.len(), cap)
    }

    /// True when the accepted head may be dispatched upstream.
    pub fn is_valid(&self) -> bool {
        self.method != Method::Unknown
            && !self.path.is_empty()
            && self.version != Version::Unknown
            && self.content_length <= MAX_BODY_SIZE
    }

    fn parse_request_line(&mut self, line: &[u8]) -> bool {
        let Some(method_end) = find(line, b" ") else {
            return false;
        };
        let target_and_version = &line[method_end + 1..];
        let Some(target_end) = find(target_and_version, b" ") else {
            return false;
        };
        let target = &target_and_version[..target_end];
        let version = &target_and_version[target_end + 1..];

        if target.len() > MAX_PATH {
            return false;
        }
        let Ok(method_str) = std::str::from_utf8(&line[..method_end]) else {
            return false;
        };
        let Ok(target_str) = std::str::from_utf8(target) else {
            return false;
        };

        self.method = Method::parse(&line[..method_end]);
        self.method_raw.push_str(method_str);
        self.path.push_str(target_str);
        self.version = if version.eq_ignore_ascii_case(b"HTTP/1.1") {
            Version::Http11
        } else if version.eq_ignore_ascii_case(b"HTTP/1.0") {
            Version::Http10
        } else {
            return false;
        };
        true
    }

    fn parse_header_line(&mut self, line: &[u8]) -> bool {
        if self.headers.len() == MAX_HEADERS {
            return false;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return false;
        };
        let name = &line[..colon];
        let value = trim_ows(&line[colon + 1..]);
        if name.is_empty() || name.len() > MAX_HEADER_NAME || value.len() > MAX_HEADER_VALUE {
            return false;
        }
        let (Ok(name), Ok(value)) = (std::str::from_utf8(name), std::str::from_utf8(value)) else {
            return false;
        };

        if name.eq_ignore_ascii_case("host") {
            if value.len() > MAX_HOST {
                return false;
            }
            self.host.clear();
            self.host.push_str(value);
        } else if name.eq_ignore_ascii_case("content-length") {
            match value.parse::<i64>() {
                Ok(n) if n >= 0 => self.content_length = n,
                _ => return false,
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if has_token(value, "chunked") {
                self.chunked = true;
            }
        }

        self.headers.push((name.to_owned(), value.to_owned()));
        true
    }

    fn keep_alive_decision(&self) -> bool {
        let connection = self
            .headers
            .iter()
            .rev()
            .find(|(name, _)| name.eq_ignore_ascii_case("connection"))
            .map(|(_, value)| value.as_str());
        match self.version {
            Version::Http11 => !connection.is_some_and(|v| has_token(v, "close")),
            Version::Http10 => connection.is_some_and(|v| has_token(v, "keep-alive")),
            Version::Unknown => false,
        }
    }

    fn completeness(&mut self, buffered: usize, cap: usize) -> ParseStatus {
        if self.chunked {
            // The head is dispatched now; chunk framing is not interpreted
            // here, the body streams through untouched.
            self.total_len = self.head_end;
            self.is_complete = true;
            return ParseStatus::Complete;
        }
        if self.content_length >= 0 {
            let total = self.head_end.saturating_add(self.content_length as usize);
            self.total_len = total;
            // Bodies that can never fit the buffer stream past the head
            // instead of waiting for space that will not come.
            if buffered >= total || total > cap {
                self.is_complete = true;
                return ParseStatus::Complete;
            }
            return ParseStatus::NeedMore;
        }
        if self.method.body_optional() {
            self.total_len = self.head_end;
            self.is_complete = true;
            return ParseStatus::Complete;
        }
        // A body-bearing method with no framing at all.
        ParseStatus::Invalid
    }
}

#[inline]
fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Case-insensitive token search in a comma-separated header value.
fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}
