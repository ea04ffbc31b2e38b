// HTTP client collaborator and its ureq implementation

use crate::range::{range_header, ContentRange};
use std::io::{ErrorKind, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Longest silence tolerated inside an announced body
const BODY_STALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("response timed out")]
    Timeout,
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("no request in flight")]
    NoResponse,
}

impl HttpError {
    /// The peer dropped the connection; not counted as a receive failure.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, HttpError::ConnectionLost(_))
    }

    /// The request never reached the server.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, HttpError::Connect(_) | HttpError::Send(_))
    }
}

/// A GET request, optionally restricted to an inclusive byte span
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub range: Option<(u64, u64)>,
    /// Validator sent as `If-Range` with a ranged request
    pub if_range: Option<String>,
}

/// Status line and the headers the download state machine cares about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub content_range: Option<ContentRange>,
    /// `ETag`, or `Last-Modified` when there is no tag
    pub validator: Option<String>,
    pub location: Option<String>,
}

impl ResponseHead {
    pub fn redirect_target(&self) -> Option<&str> {
        if (300..400).contains(&self.status) {
            self.location.as_deref()
        } else {
            None
        }
    }
}

/// One body chunk read into the caller's buffer
#[derive(Debug, Clone)]
pub struct Response {
    pub head: Arc<ResponseHead>,
    pub len: usize,
    /// More body bytes remain after this chunk
    pub more: bool,
}

/// Blocking HTTP client used by the download worker.
///
/// `connect` on an already connected client is a no-op. A request sent after
/// the previous response was fully or partly read replaces it. Connect and
/// send failures may surface from `receive_response` when the client sends
/// in the background.
pub trait HttpClient: Send {
    fn connect(&mut self, url: &str) -> Result<(), HttpError>;

    fn send_request(&mut self, request: &Request) -> Result<(), HttpError>;

    /// Read the next body chunk, waiting at most `header_timeout` for the
    /// response headers of a fresh request.
    fn receive_response(
        &mut self,
        buf: &mut [u8],
        header_timeout: Duration,
    ) -> Result<Response, HttpError>;

    fn close(&mut self);
}

/// Create a configured HTTP agent.
///
/// Redirects are disabled: the download worker follows them itself so it
/// can bound how many it accepts. The read timeout covers every socket read,
/// body included, so it only bounds a stalled body; the header wait is
/// bounded per request in `UreqClient::receive_response`.
pub fn create_http_agent(read_timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(10))
        .timeout_read(read_timeout)
        .timeout_write(Duration::from_secs(30))
        .user_agent(concat!("chime/", env!("CARGO_PKG_VERSION")))
        .redirects(0)
        .build()
}

type HeadResult = Result<ureq::Response, HttpError>;

/// ureq-backed client; the agent pools the underlying connections.
///
/// ureq reads the response headers inside `call()`, so each request runs on
/// a short-lived thread and `receive_response` waits for its headers with
/// the caller's timeout. A request that times out keeps waiting in the
/// background until the next `send_request` or `close` drops it.
pub struct UreqClient {
    agent: ureq::Agent,
    url: Option<String>,
    pending: Option<Receiver<HeadResult>>,
    head: Option<Arc<ResponseHead>>,
    reader: Option<Box<dyn Read + Send + Sync>>,
}

impl UreqClient {
    pub fn new() -> Self {
        Self::with_stall_timeout(BODY_STALL_TIMEOUT)
    }

    /// Client that gives up on a body after `stall` without a byte.
    pub fn with_stall_timeout(stall: Duration) -> Self {
        Self {
            agent: create_http_agent(stall),
            url: None,
            pending: None,
            head: None,
            reader: None,
        }
    }

    fn parse_head(response: &ureq::Response) -> ResponseHead {
        let header = |name: &str| response.header(name).map(str::to_string);

        ResponseHead {
            status: response.status(),
            content_length: response
                .header("Content-Length")
                .and_then(|s| s.trim().parse::<u64>().ok()),
            chunked: response
                .header("Transfer-Encoding")
                .map_or(false, |s| s.to_ascii_lowercase().contains("chunked")),
            content_range: response.header("Content-Range").and_then(ContentRange::parse),
            validator: header("ETag").or_else(|| header("Last-Modified")),
            location: header("Location"),
        }
    }

    /// Block until the in-flight request has its headers, at most `timeout`.
    fn await_head(&mut self, timeout: Duration) -> Result<(), HttpError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        let result = match pending.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending = Some(pending);
                return Err(HttpError::Timeout);
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(HttpError::Send("request thread ended".to_string()))
            }
        };
        let response = result?;

        let head = Self::parse_head(&response);
        log::debug!(
            "[http] {} -> {} len={:?} range={:?}",
            self.url.as_deref().unwrap_or_default(),
            head.status,
            head.content_length,
            head.content_range
        );
        self.head = Some(Arc::new(head));
        self.reader = Some(response.into_reader());
        Ok(())
    }
}

impl Default for UreqClient {
    fn default() -> Self {
        Self::new()
    }
}

fn call(request: ureq::Request) -> HeadResult {
    match request.call() {
        Ok(response) => Ok(response),
        // Error statuses still carry headers the state machine inspects
        Err(ureq::Error::Status(_, response)) => Ok(response),
        Err(ureq::Error::Transport(err)) => Err(map_transport_error(&err)),
    }
}

fn map_transport_error(err: &ureq::Transport) -> HttpError {
    match err.kind() {
        ureq::ErrorKind::Dns | ureq::ErrorKind::ConnectionFailed => {
            HttpError::Connect(err.to_string())
        }
        ureq::ErrorKind::InvalidUrl | ureq::ErrorKind::UnknownScheme => {
            HttpError::InvalidUrl(err.to_string())
        }
        _ => HttpError::Send(err.to_string()),
    }
}

fn map_read_error(err: std::io::Error) -> HttpError {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => HttpError::Timeout,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => HttpError::ConnectionLost(err.to_string()),
        _ => HttpError::Receive(err.to_string()),
    }
}

impl HttpClient for UreqClient {
    fn connect(&mut self, url: &str) -> Result<(), HttpError> {
        if self.url.is_some() {
            return Ok(());
        }
        let has_host = url
            .strip_prefix("http://")
            .map_or(false, |rest| !rest.is_empty() && !rest.starts_with('/'));
        if !has_host {
            return Err(HttpError::InvalidUrl(url.to_string()));
        }
        self.url = Some(url.to_string());
        Ok(())
    }

    fn send_request(&mut self, request: &Request) -> Result<(), HttpError> {
        let url = self.url.as_deref().ok_or(HttpError::NoResponse)?;
        self.pending = None;
        self.head = None;
        self.reader = None;

        let mut builder = self.agent.get(url);
        if let Some((start, end)) = request.range {
            builder = builder.set("Range", &range_header(start, end));
            if let Some(validator) = &request.if_range {
                builder = builder.set("If-Range", validator);
            }
        }
        log::debug!("[http] GET {} {:?}", url, request.range);

        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("chime-http".into())
            .spawn(move || {
                // The receiver is gone when the request was superseded
                let _ = tx.send(call(builder));
            })
            .map_err(|err| HttpError::Send(err.to_string()))?;
        self.pending = Some(rx);
        Ok(())
    }

    fn receive_response(
        &mut self,
        buf: &mut [u8],
        header_timeout: Duration,
    ) -> Result<Response, HttpError> {
        self.await_head(header_timeout)?;
        let head = self.head.clone().ok_or(HttpError::NoResponse)?;
        let reader = self.reader.as_mut().ok_or(HttpError::NoResponse)?;

        let mut filled = 0;
        let mut eof = false;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_read_error(err)),
            }
        }

        if eof {
            self.reader = None;
        }

        Ok(Response {
            head,
            len: filled,
            more: !eof,
        })
    }

    fn close(&mut self) {
        self.url = None;
        self.pending = None;
        self.head = None;
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    /// Accept one connection, swallow the request head and run `reply`.
    fn serve_once(reply: impl FnOnce(&mut TcpStream) + Send + 'static) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/clip.mp3", listener.local_addr().unwrap());
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                if stream.read(&mut byte).unwrap() == 0 {
                    break;
                }
                head.push(byte[0]);
            }
            reply(&mut stream);
        });
        (url, server)
    }

    #[test]
    fn test_body_stall_outlasts_header_timeout() {
        let (url, server) = serve_once(|stream| {
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 20\r\n\r\n0123456789")
                .unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(800));
            stream.write_all(b"abcdefghij").unwrap();
        });

        let mut client = UreqClient::default();
        client.connect(&url).unwrap();
        client.send_request(&Request::default()).unwrap();

        let mut buf = [0u8; 32];
        let response = client
            .receive_response(&mut buf, Duration::from_millis(200))
            .unwrap();
        assert_eq!(response.head.status, 200);
        assert_eq!(response.head.content_length, Some(20));
        assert_eq!(&buf[..response.len], b"0123456789abcdefghij");
        assert!(!response.more);
        server.join().unwrap();
    }

    #[test]
    fn test_header_wait_bounded_by_caller() {
        let (url, server) = serve_once(|stream| {
            thread::sleep(Duration::from_millis(600));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc")
                .unwrap();
        });

        let mut client = UreqClient::default();
        client.connect(&url).unwrap();
        client.send_request(&Request::default()).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            client
                .receive_response(&mut buf, Duration::from_millis(100))
                .unwrap_err(),
            HttpError::Timeout
        );
        // the request is still in flight and its headers arrive later
        let response = client
            .receive_response(&mut buf, Duration::from_secs(5))
            .unwrap();
        assert_eq!(&buf[..response.len], b"abc");
        server.join().unwrap();
    }

    #[test]
    fn test_refused_connection_is_connect_failure() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut client = UreqClient::default();
        client.connect(&format!("http://127.0.0.1:{}/a.mp3", port)).unwrap();
        client.send_request(&Request::default()).unwrap();

        let mut buf = [0u8; 8];
        let err = client
            .receive_response(&mut buf, Duration::from_secs(5))
            .unwrap_err();
        assert!(err.is_connect_failure(), "{:?}", err);
    }

    #[test]
    fn test_connect_validates_url() {
        let mut client = UreqClient::default();
        assert!(matches!(client.connect("ftp://x"), Err(HttpError::InvalidUrl(_))));
        assert!(matches!(client.connect("http:///a"), Err(HttpError::InvalidUrl(_))));
        assert!(client.connect("http://127.0.0.1:9/a.mp3").is_ok());
        // already connected
        assert!(client.connect("ftp://ignored").is_ok());
    }

    #[test]
    fn test_receive_without_request() {
        let mut client = UreqClient::default();
        let mut buf = [0u8; 16];
        assert_eq!(
            client
                .receive_response(&mut buf, Duration::from_millis(10))
                .unwrap_err(),
            HttpError::NoResponse
        );
    }

    #[test]
    fn test_redirect_target_requires_3xx() {
        let head = ResponseHead {
            status: 302,
            location: Some("http://b/x".into()),
            ..Default::default()
        };
        assert_eq!(head.redirect_target(), Some("http://b/x"));

        let head = ResponseHead {
            status: 200,
            location: Some("http://b/x".into()),
            ..Default::default()
        };
        assert_eq!(head.redirect_target(), None);
    }

    #[test]
    fn test_connection_lost_classification() {
        let err = map_read_error(std::io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert!(err.is_connection_lost());
        assert_eq!(
            map_read_error(std::io::Error::new(ErrorKind::TimedOut, "slow")),
            HttpError::Timeout
        );
    }
}
