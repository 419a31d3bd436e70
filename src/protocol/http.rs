//! JPIP over HTTP with `reqwest`
//!
//! Every query is its own GET. It is handed to the runtime as soon as it is
//! sent, so a rate update or a new window reaches the server while the body of
//! the previous response is still streaming in; responses are read back in the
//! order their requests were sent. Bodies are pulled with
//! [`reqwest::Response::bytes_stream`] and cut into JPP-stream messages by the
//! [`MessageParser`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::CACHE_CONTROL;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::message::MessageParser;
use super::transport::{Connector, Transport};
use super::{DataSegment, JpipRequest};
use crate::config::Endpoint;
use crate::{Result, StreamError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: u16,
    pub reason: String,
    /// Header names are stored lowercase
    pub headers: HashMap<String, String>,
}

impl ResponseHeader {
    fn from_response(response: &reqwest::Response) -> Self {
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect();
        Self {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Channel id granted by a `cnew` request, from `JPIP-cnew: cid=...,path=...`.
    pub fn channel_id(&self) -> Option<&str> {
        self.header("jpip-cnew")?
            .split(',')
            .filter_map(|kv| kv.trim().split_once('='))
            .find(|(k, _)| *k == "cid")
            .map(|(_, v)| v)
    }
}

/// Map a `reqwest` failure onto the error the reader knows how to handle.
///
/// Refused or unreachable servers are connection errors. Everything else is a
/// transport error carrying the kind of the innermost I/O error, so a peer
/// reset still reads as a reset.
fn request_error(operation: &'static str, err: reqwest::Error) -> StreamError {
    if err.is_connect() {
        return StreamError::connection_failed_with_source(operation, Box::new(err));
    }
    if err.is_builder() {
        return StreamError::protocol("http", format!("{}: {}", operation, err));
    }
    let kind = {
        let mut source = std::error::Error::source(&err);
        let mut kind = None;
        while let Some(inner) = source {
            if let Some(io) = inner.downcast_ref::<std::io::Error>() {
                kind = Some(io.kind());
                break;
            }
            source = inner.source();
        }
        kind.unwrap_or(if err.is_timeout() {
            std::io::ErrorKind::TimedOut
        } else {
            std::io::ErrorKind::ConnectionAborted
        })
    };
    StreamError::transport(operation, std::io::Error::new(kind, err))
}

/// Opens [`HttpTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    direct: bool,
}

impl HttpConnector {
    /// Connector that ignores proxy settings from the environment.
    pub fn direct() -> Self {
        Self { direct: true }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    type Transport = HttpTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<HttpTransport> {
        debug!("Opening HTTP client for {}", endpoint.authority());
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("jpipflow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10));
        if self.direct {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| StreamError::connection_failed_with_source("building HTTP client", Box::new(e)))?;
        Ok(HttpTransport::new(client))
    }
}

/// JPP-stream responses over a pooled `reqwest` client.
pub struct HttpTransport {
    client: reqwest::Client,
    /// Requests in the order they were sent
    in_flight: VecDeque<JoinHandle<reqwest::Result<reqwest::Response>>>,
    body: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MessageParser,
    pending: Vec<u8>,
    /// Set once the end-of-response message was seen or the body ended
    response_done: bool,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            in_flight: VecDeque::new(),
            body: None,
            parser: MessageParser::new(),
            pending: Vec::new(),
            response_done: false,
        }
    }

    fn abort_in_flight(&mut self) {
        for request in self.in_flight.drain(..) {
            request.abort();
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, request: &JpipRequest) -> Result<()> {
        let url = request.url();
        trace!("GET {}", url);
        let pending = self.client.get(url).header(CACHE_CONTROL, "no-cache").send();
        self.in_flight.push_back(tokio::spawn(pending));
        Ok(())
    }

    async fn read_header(&mut self) -> Result<ResponseHeader> {
        self.body = None;
        self.pending.clear();
        self.response_done = false;

        let request = self
            .in_flight
            .pop_front()
            .ok_or_else(|| StreamError::protocol("http", "no request is awaiting a response"))?;
        let response = request
            .await
            .map_err(|e| StreamError::transport("awaiting response", std::io::Error::other(e)))?
            .map_err(|e| request_error("sending request", e))?;

        let header = ResponseHeader::from_response(&response);
        if !header.is_success() {
            return Err(StreamError::protocol(
                "http",
                format!("server answered {} {}", header.status, header.reason),
            ));
        }
        self.parser.begin_response();
        self.body = Some(response.bytes_stream().boxed());
        Ok(header)
    }

    async fn read_segment(&mut self) -> Result<Option<DataSegment>> {
        if self.response_done {
            return Ok(None);
        }
        let Some(body) = self.body.as_mut() else { return Ok(None) };

        loop {
            if let Some((segment, used)) = self.parser.parse(&self.pending)? {
                self.pending.drain(..used);
                if segment.is_end() {
                    self.response_done = true;
                }
                return Ok(Some(segment));
            }
            match body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| request_error("reading response body", e))?;
                    self.pending.extend_from_slice(&chunk);
                }
                None => {
                    self.response_done = true;
                    if self.pending.is_empty() {
                        return Ok(None);
                    }
                    return Err(StreamError::protocol(
                        "jpp-stream",
                        format!("response ended inside a message ({} bytes left)", self.pending.len()),
                    ));
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.body = None;
        self.abort_in_flight();
        Ok(())
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort_in_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{BinClass, DataBinId, EorReason, encode_eor, encode_message};
    use crate::protocol::{JpipQuery, RequestField, SegmentHeader};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn chunked(headers: &str, body: &[u8], split: usize) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 200 OK\r\n{}Transfer-Encoding: chunked\r\n\r\n", headers).into_bytes();
        for part in body.chunks(split) {
            out.extend_from_slice(format!("{:x}\r\n", part.len()).as_bytes());
            out.extend_from_slice(part);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    fn sized(body: &[u8], declared: usize) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", declared).into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Serve every connection with `respond`; returns the request lines seen.
    async fn server(respond: fn(&str) -> Vec<u8>) -> (Endpoint, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = log.clone();
                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(request)) = lines.next_line().await {
                        while let Ok(Some(line)) = lines.next_line().await {
                            if line.is_empty() {
                                break;
                            }
                        }
                        let response = respond(&request);
                        log.lock().unwrap().push(request);
                        if write.write_all(&response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let endpoint = Endpoint::parse(&format!("jpip://127.0.0.1:{}/jpip?m.jpx", port)).unwrap();
        (endpoint, seen)
    }

    fn handshake_body() -> Vec<u8> {
        let mut body = encode_message(DataBinId::new(BinClass::MainHeader, 0, 0), 0, b"header", true);
        body.extend(encode_message(DataBinId::new(BinClass::Precinct, 0, 3), 0, &[9; 40], false));
        body.extend(encode_eor(EorReason::WindowDone));
        body
    }

    fn channel_server(request: &str) -> Vec<u8> {
        if request.contains("cnew=http") {
            chunked("JPIP-cnew: cid=JPH_7,path=jpip,transport=http\r\n", &handshake_body(), 7)
        } else {
            sized(&encode_eor(EorReason::ByteLimit), encode_eor(EorReason::ByteLimit).len())
        }
    }

    #[test]
    fn channel_id_comes_from_cnew_header() {
        let mut headers = HashMap::new();
        headers.insert("jpip-cnew".to_string(), "cid=JPH_0042, path=jpip,transport=http".to_string());
        let header = ResponseHeader { status: 200, reason: "OK".to_string(), headers };
        assert!(header.is_success());
        assert_eq!(header.channel_id(), Some("JPH_0042"));
        assert_eq!(header.header("JPIP-cnew").map(|v| v.starts_with("cid=")), Some(true));

        let header = ResponseHeader { status: 503, reason: String::new(), headers: HashMap::new() };
        assert!(!header.is_success());
        assert_eq!(header.channel_id(), None);
    }

    #[tokio::test]
    async fn reads_chunked_and_sized_responses_in_request_order() {
        let (endpoint, seen) = server(channel_server).await;
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();

        let query = JpipQuery::new().with(RequestField::Target, "m.jpx").with(RequestField::ChannelNew, "http");
        transport.send(&JpipRequest::get(&endpoint, query)).await.unwrap();
        // Sent before the first body is read, answered after it
        transport.send(&JpipRequest::get(&endpoint, JpipQuery::rate_update(1e6, 20))).await.unwrap();

        let header = transport.read_header().await.unwrap();
        assert_eq!(header.channel_id(), Some("JPH_7"));
        let mut segments = Vec::new();
        while let Some(segment) = transport.read_segment().await.unwrap() {
            segments.push(segment);
        }
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].payload.len(), 40);
        assert_eq!(segments[2].header, SegmentHeader::End(EorReason::WindowDone));
        assert_eq!(segments[2].response_size, handshake_body().len() as u64);

        transport.read_header().await.unwrap();
        let end = transport.read_segment().await.unwrap().unwrap();
        assert_eq!(end.header, SegmentHeader::End(EorReason::ByteLimit));
        assert!(transport.read_segment().await.unwrap().is_none());

        let mut requests = seen.lock().unwrap().clone();
        requests.sort();
        assert!(requests[0].starts_with("GET /jpip?mbw=1000000&srate=20&drate=1 HTTP/1.1"));
        assert!(requests[1].starts_with("GET /jpip?target=m.jpx&cnew=http HTTP/1.1"));
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::parse(&format!("http://127.0.0.1:{}/jpip?target=x", port)).unwrap();
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();
        transport.send(&JpipRequest::get(&endpoint, JpipQuery::new())).await.unwrap();
        let err = transport.read_header().await.unwrap_err();
        assert!(matches!(err, StreamError::Connection { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn header_without_request_is_protocol_error() {
        let endpoint = Endpoint::parse("jpip://127.0.0.1:9/jpip?m.jpx").unwrap();
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();
        let err = transport.read_header().await.unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
    }

    #[tokio::test]
    async fn truncated_message_is_protocol_error() {
        let (endpoint, _) = server(|_| {
            let message = encode_message(DataBinId::new(BinClass::Precinct, 0, 0), 0, &[1; 10], false);
            sized(&message[..6], 6)
        })
        .await;
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();
        transport.send(&JpipRequest::get(&endpoint, JpipQuery::new())).await.unwrap();
        transport.read_header().await.unwrap();
        let err = transport.read_segment().await.unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
    }

    #[tokio::test]
    async fn peer_closing_inside_body_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    break;
                }
            }
            let message = encode_message(DataBinId::new(BinClass::Precinct, 0, 0), 0, &[1; 40], false);
            write.write_all(&sized(&message[..10], 400)).await.unwrap();
        });

        let endpoint = Endpoint::parse(&format!("jpip://127.0.0.1:{}/jpip?m.jpx", port)).unwrap();
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();
        transport.send(&JpipRequest::get(&endpoint, JpipQuery::new())).await.unwrap();
        transport.read_header().await.unwrap();
        let err = transport.read_segment().await.unwrap_err();
        assert!(matches!(err, StreamError::TransportIo { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn error_status_is_protocol_error() {
        let (endpoint, _) = server(|_| b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec()).await;
        let mut transport = HttpConnector::direct().connect(&endpoint).await.unwrap();
        transport.send(&JpipRequest::get(&endpoint, JpipQuery::new())).await.unwrap();
        let err = transport.read_header().await.unwrap_err();
        assert!(matches!(err, StreamError::Protocol { .. }));
        assert!(err.to_string().contains("404"));
    }
}
