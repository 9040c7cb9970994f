//! Minimal HTTP/1.x request parsing and response assembly.
//!
//! Only what the RPC front door needs: `GET`/`POST` request lines, a header
//! block, CGI-style arguments, and `Content-Length` delimited responses.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use http::StatusCode;
use rpcserve_core::HeaderMap;

use super::framing;

/// Longest POST body echoed into request summaries.
const SUMMARY_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A parsed HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Request path up to `?`, starting with `/`.
    pub path: String,
    /// Raw query string (without `?`).
    pub query: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Parses a complete request. Returns `None` for incomplete or
    /// unparseable input.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let info = framing::is_complete(buf)?;
        let header_len = framing::header_end(buf)?;
        let head = std::str::from_utf8(&buf[..header_len]).ok()?;
        let mut lines = head.lines();

        let mut parts = lines.next()?.split_whitespace();
        let method = match parts.next()? {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            _ => return None,
        };
        let target = parts.next()?;
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let mut headers = HeaderMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim(), value.trim());
            }
        }

        let body = match method {
            HttpMethod::Post => buf[header_len..info.len].to_vec(),
            HttpMethod::Get => Vec::new(),
        };

        Some(Self {
            method,
            path: path.to_string(),
            query: query.to_string(),
            headers,
            body,
        })
    }

    /// Path without the leading slash.
    #[must_use]
    pub fn opname(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// The CGI argument string: the query for GET, the body for POST.
    #[must_use]
    pub fn cgi_arguments(&self) -> Cow<'_, str> {
        match self.method {
            HttpMethod::Get => Cow::Borrowed(self.query.as_str()),
            HttpMethod::Post => String::from_utf8_lossy(&self.body),
        }
    }

    #[must_use]
    pub fn cookie(&self) -> &str {
        self.headers.get("cookie").unwrap_or_default()
    }

    #[must_use]
    pub fn referrer(&self) -> &str {
        self.headers.get("referer").unwrap_or_default()
    }

    #[must_use]
    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").unwrap_or_default()
    }

    /// Whether the client asked to keep the connection open.
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        self.headers
            .get("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("keep-alive"))
    }

    /// One-line description for request logs.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.method {
            HttpMethod::Get if self.query.is_empty() => format!("GET {}", self.path),
            HttpMethod::Get => format!("GET {}?{}", self.path, self.query),
            HttpMethod::Post => {
                let args = self.cgi_arguments();
                let shown: String = args.chars().take(SUMMARY_BODY_LIMIT).collect();
                let more = if args.chars().count() > SUMMARY_BODY_LIMIT {
                    "..."
                } else {
                    ""
                };
                format!("POST {} {shown}{more}", self.path)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CGI arguments and escaping
// ---------------------------------------------------------------------------

/// Parses `k=v&k2=v2` into a map. `None` on a malformed percent escape.
///
/// Later duplicates overwrite earlier ones. A key without `=` maps to "".
#[must_use]
pub fn parse_cgi_arguments(args: &str) -> Option<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for pair in args.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(url_decode(key)?, url_decode(value)?);
    }
    Some(map)
}

/// Decodes `%XX` escapes and `+` as space. `None` on a bad escape.
#[must_use]
pub fn url_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_val(*bytes.get(i + 1)?)?;
                let lo = hex_val(*bytes.get(i + 2)?)?;
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Some(String::from_utf8_lossy(&out).into_owned())
}

/// Percent-encodes everything but unreserved characters.
#[must_use]
pub fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Escapes HTML special characters.
#[must_use]
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Maps a request path onto a file under `root`, percent-decoding it first.
///
/// Only plain name segments are accepted. A leading root, a drive prefix,
/// a `..` segment (split on either slash) or a NUL byte gives `None`.
#[must_use]
pub fn webroot_path(root: &Path, path: &str) -> Option<PathBuf> {
    let decoded = url_decode(path)?;
    if decoded.contains('\0') || decoded.split(['/', '\\']).any(|seg| seg == "..") {
        return None;
    }
    let mut resolved = root.to_path_buf();
    let mut named = false;
    for component in Path::new(&decoded).components() {
        match component {
            Component::Normal(name) => {
                resolved.push(name);
                named = true;
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) | Component::ParentDir => return None,
        }
    }
    named.then_some(resolved)
}

/// Content type for a static file, from its extension.
#[must_use]
pub fn guess_content_type(filename: &str) -> &'static str {
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return "text/plain";
    };
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "js" => "application/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "ico" => "image/vnd.microsoft.icon",
        "svg" => "image/svg+xml",
        _ => "text/plain",
    }
}

// ---------------------------------------------------------------------------
// HttpResponse
// ---------------------------------------------------------------------------

const NOT_FOUND_PAGE: &str = "<html><head><title>404 Not Found</title></head>\n\
<body><h1>Not Found</h1>\n\
The requested URL was not found on this server.<p><hr></body>\n</html>\n";

const BUSY_PAGE: &str = "<html><head><title>Server Busy</title></head>\n\
<body><h1>Server Busy</h1>\n\
The server is busy at this moment.  Please try again later.<p><hr></body>\n</html>\n";

const SERVER_ERROR_PAGE: &str = "<html><head><title>Internal Server Error</title></head>\n\
<body><h1>Internal Server Error</h1>\n\
The server has encountered an error.  Please try again later.<p><hr></body>\n</html>\n";

/// An HTTP response ready to be serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Full `Set-Cookie` values.
    pub cookies: Vec<String>,
    pub max_age_secs: u32,
    pub keep_alive: bool,
}

impl HttpResponse {
    /// A 200 response with a `charset=utf-8` content type.
    #[must_use]
    pub fn ok(body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: format!("{content_type}; charset=utf-8"),
            body: body.into(),
            cookies: Vec::new(),
            max_age_secs: 0,
            keep_alive: false,
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self::canned(StatusCode::NOT_FOUND, NOT_FOUND_PAGE)
    }

    #[must_use]
    pub fn busy() -> Self {
        Self::canned(StatusCode::SERVICE_UNAVAILABLE, BUSY_PAGE)
    }

    #[must_use]
    pub fn server_error() -> Self {
        Self::canned(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_PAGE)
    }

    fn canned(status: StatusCode, page: &str) -> Self {
        Self {
            status,
            content_type: "text/html".to_string(),
            body: page.as_bytes().to_vec(),
            cookies: Vec::new(),
            max_age_secs: 0,
            keep_alive: false,
        }
    }

    /// Replaces the content type verbatim.
    #[must_use]
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, cookies: Vec<String>) -> Self {
        self.cookies = cookies;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, secs: u32) -> Self {
        self.max_age_secs = secs;
        self
    }

    #[must_use]
    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Serializes status line, headers, and body.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown"),
            self.content_type,
        );
        if self.status == StatusCode::OK {
            let _ = write!(head, "Cache-Control: private, max-age={}\r\n", self.max_age_secs);
            for cookie in &self.cookies {
                let _ = write!(head, "Set-Cookie: {cookie}\r\n");
            }
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        let _ = write!(
            head,
            "Connection: {connection}\r\nContent-Length: {}\r\n\r\n",
            self.body.len()
        );
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}
