// Byte-range helpers for HTTP requests and responses

/// Parsed `Content-Range: bytes start-end/total` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// Whole resource length; `None` when the server sent `*`
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(header: &str) -> Option<Self> {
        let value = header.trim().strip_prefix("bytes")?.trim_start();
        let (span, total) = value.split_once('/')?;
        let (start, end) = span.trim().split_once('-')?;

        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        let total = match total.trim() {
            "*" => None,
            value => Some(value.parse::<u64>().ok()?),
        };

        Some(Self { start, end, total })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// `Range` header value for an inclusive span
pub fn range_header(start: u64, end: u64) -> String {
    format!("bytes={}-{}", start, end)
}

/// TLS is not available; secure URLs are fetched over plain HTTP.
pub fn plain_http(url: &str) -> String {
    let scheme_len = "https://".len();
    match url.get(..scheme_len) {
        Some(scheme) if scheme.eq_ignore_ascii_case("https://") => {
            format!("http://{}", &url[scheme_len..])
        }
        _ => url.to_string(),
    }
}
