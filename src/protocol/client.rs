//! Connection state machine of the protocol client

use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::{Connector, Transport};
use super::{DataSegment, JpipQuery, JpipRequest, RequestField, ResponseHeader};
use crate::config::Endpoint;
use crate::{Result, StreamError};

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
    /// A request was sent and its response has not been read to the end
    AwaitingResponse,
    /// Closed for good; never reconnects
    Closed,
}

/// Closes a [`ProtocolClient`] from another task.
///
/// A read blocked inside the client fails promptly once this fires.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Something that can be shut down once its owner is finished with it.
#[async_trait]
pub trait Shutdown: Send {
    async fn shutdown(&mut self);
}

/// JPIP client for one target.
pub struct ProtocolClient<C: Connector> {
    connector: C,
    endpoint: Endpoint,
    transport: Option<C::Transport>,
    channel_id: Option<String>,
    state: ClientState,
    close: CancellationToken,
}

impl<C: Connector> ProtocolClient<C> {
    pub fn new(connector: C, endpoint: Endpoint) -> Self {
        Self {
            connector,
            endpoint,
            transport: None,
            channel_id: None,
            state: ClientState::Disconnected,
            close: CancellationToken::new(),
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle { token: self.close.clone() }
    }

    pub fn state(&self) -> ClientState {
        if self.close.is_cancelled() { ClientState::Closed } else { self.state }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ClientState::Connected | ClientState::AwaitingResponse)
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.as_deref()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open a connection and a JPIP channel.
    ///
    /// Returns the messages of the handshake response (main header and
    /// metadata) so they can go into the cache. With `model` set, the server's
    /// cache model is primed with that descriptor afterwards and the messages of
    /// that exchange are returned as well.
    pub async fn connect(&mut self, model: Option<&str>) -> Result<Vec<DataSegment>> {
        if self.close.is_cancelled() {
            return Err(StreamError::Closed);
        }
        self.disconnect();

        let close = self.close.clone();
        let transport = guarded(&close, "connecting", self.connector.connect(&self.endpoint))
            .await
            .map_err(|e| match e {
                StreamError::Connection { .. } => e,
                other => StreamError::connection_failed_with_source("connect", Box::new(other)),
            })?;
        self.transport = Some(transport);
        self.state = ClientState::Connected;

        let handshake = JpipQuery::new()
            .with(RequestField::Target, self.endpoint.target.clone())
            .with(RequestField::ChannelNew, "http")
            .with(RequestField::Type, "jpp-stream");
        let mut segments = match self.exchange(handshake).await {
            Ok((header, segments)) => {
                let Some(cid) = header.channel_id() else {
                    self.disconnect();
                    return Err(StreamError::connection_failed("server granted no JPIP channel"));
                };
                self.channel_id = Some(cid.to_string());
                segments
            }
            Err(e) => {
                self.disconnect();
                return Err(StreamError::connection_failed_with_source(
                    "channel handshake",
                    Box::new(e),
                ));
            }
        };
        info!(
            "Connected to {} (channel {})",
            self.endpoint.authority(),
            self.channel_id.as_deref().unwrap_or("?")
        );

        if let Some(model) = model.filter(|m| !m.is_empty()) {
            debug!("Priming server cache model ({} bytes)", model.len());
            let (_, primed) = self.exchange(JpipQuery::new().with(RequestField::Model, model)).await?;
            segments.extend(primed);
        }
        Ok(segments)
    }

    /// Send a query on the open channel.
    pub async fn send_query(&mut self, mut query: JpipQuery) -> Result<()> {
        match &self.channel_id {
            Some(cid) => query.set(RequestField::ChannelId, cid.clone()),
            None => query.set(RequestField::Target, self.endpoint.target.clone()),
        };
        let request = JpipRequest::get(&self.endpoint, query);
        trace!("Query: {}", request.query);

        let close = self.close.clone();
        let transport = self.open_transport()?;
        let result = guarded(&close, "sending query", transport.send(&request)).await;
        self.settle(result)?;
        self.state = ClientState::AwaitingResponse;
        Ok(())
    }

    /// Read the header of the next pending response.
    pub async fn read_header(&mut self) -> Result<ResponseHeader> {
        let close = self.close.clone();
        let transport = self.open_transport()?;
        let result = guarded(&close, "reading response header", transport.read_header()).await;
        self.settle(result)
    }

    /// Next message of the response being read, `None` at its end.
    pub async fn next_segment(&mut self) -> Result<Option<DataSegment>> {
        let close = self.close.clone();
        let transport = self.open_transport()?;
        let result = guarded(&close, "reading segment", transport.read_segment()).await;
        let segment = self.settle(result)?;
        if segment.is_none() {
            self.state = ClientState::Connected;
        }
        Ok(segment)
    }

    /// Close permanently. Idempotent.
    pub async fn close(&mut self) {
        self.close.cancel();
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.shutdown().await {
                debug!("Transport shutdown failed: {}", e);
            }
        }
        self.state = ClientState::Closed;
    }

    /// Drop the transport after a failure; the next `connect` opens a fresh one.
    pub fn disconnect(&mut self) {
        if self.transport.take().is_some() {
            debug!("Dropping connection to {}", self.endpoint.authority());
        }
        self.channel_id = None;
        if self.state != ClientState::Closed {
            self.state = ClientState::Disconnected;
        }
    }

    async fn exchange(&mut self, query: JpipQuery) -> Result<(ResponseHeader, Vec<DataSegment>)> {
        self.send_query(query).await?;
        let header = self.read_header().await?;
        let mut segments = Vec::new();
        while let Some(segment) = self.next_segment().await? {
            segments.push(segment);
        }
        Ok((header, segments))
    }

    fn open_transport(&mut self) -> Result<&mut C::Transport> {
        if self.close.is_cancelled() {
            return Err(StreamError::Closed);
        }
        self.transport.as_mut().ok_or_else(|| {
            StreamError::transport("using connection", std::io::ErrorKind::NotConnected.into())
        })
    }

    /// Drop the connection when an I/O step failed.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("Connection to {} failed: {}", self.endpoint.authority(), e);
            self.disconnect();
        }
        result
    }
}

#[async_trait]
impl<C: Connector> Shutdown for ProtocolClient<C> {
    async fn shutdown(&mut self) {
        self.close().await;
    }
}

/// Run `fut` unless the client is closed first.
async fn guarded<T>(
    close: &CancellationToken,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = close.cancelled() => Err(StreamError::transport(
            operation,
            std::io::Error::new(std::io::ErrorKind::Interrupted, "connection closed"),
        )),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EorReason, SegmentHeader};
    use crate::test_utils::{ScriptedConnector, ScriptedResponse, main_header};
    use std::time::Duration;

    fn endpoint() -> Endpoint {
        Endpoint::parse("jpip://server.test/jpip?movie.jpx").unwrap()
    }

    #[tokio::test]
    async fn handshake_captures_channel_and_header_bins() {
        let connector = ScriptedConnector::new();
        connector.push_response(ScriptedResponse::handshake("JPH_5", vec![main_header(0)]));
        let mut client = ProtocolClient::new(connector.clone(), endpoint());
        assert_eq!(client.state(), ClientState::Disconnected);

        let segments = client.connect(None).await.unwrap();
        assert_eq!(client.channel_id(), Some("JPH_5"));
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(segments.len(), 2);

        let requests = connector.requests();
        assert_eq!(requests[0], "target=movie.jpx&cnew=http&type=jpp-stream");
    }

    #[tokio::test]
    async fn queries_carry_channel_id_and_model_primes() {
        let connector = ScriptedConnector::new();
        connector.push_response(ScriptedResponse::handshake("JPH_1", vec![]));
        connector.push_response(ScriptedResponse::data(vec![], EorReason::WindowDone));
        connector.push_response(ScriptedResponse::data(vec![], EorReason::WindowDone));
        let mut client = ProtocolClient::new(connector.clone(), endpoint());

        client.connect(Some("Hm,H0")).await.unwrap();
        client.send_query(JpipQuery::rate_update(1000.0, 10)).await.unwrap();
        assert_eq!(client.state(), ClientState::AwaitingResponse);
        client.read_header().await.unwrap();
        let end = client.next_segment().await.unwrap().unwrap();
        assert_eq!(end.header, SegmentHeader::End(EorReason::WindowDone));
        assert!(client.next_segment().await.unwrap().is_none());
        assert_eq!(client.state(), ClientState::Connected);

        let requests = connector.requests();
        assert_eq!(requests[1], "model=Hm,H0&cid=JPH_1");
        assert_eq!(requests[2], "mbw=1000&srate=10&drate=1&cid=JPH_1");
    }

    #[tokio::test]
    async fn missing_channel_grant_is_connection_error() {
        let connector = ScriptedConnector::new();
        connector.push_response(ScriptedResponse::data(vec![], EorReason::WindowDone));
        let mut client = ProtocolClient::new(connector, endpoint());
        let err = client.connect(None).await.unwrap_err();
        assert!(matches!(err, StreamError::Connection { .. }));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn close_handle_unblocks_pending_read() {
        let connector = ScriptedConnector::new();
        connector.push_response(ScriptedResponse::handshake("JPH_2", vec![]));
        connector.push_response(ScriptedResponse::stall(vec![]));
        let mut client = ProtocolClient::new(connector, endpoint());
        client.connect(None).await.unwrap();
        client.send_query(JpipQuery::new()).await.unwrap();
        client.read_header().await.unwrap();

        let handle = client.close_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close();
        });
        let result = tokio::time::timeout(Duration::from_secs(2), client.next_segment()).await.unwrap();
        assert!(matches!(result, Err(StreamError::TransportIo { .. })));
        assert_eq!(client.state(), ClientState::Closed);

        client.close().await;
        client.close().await;
        assert!(matches!(client.connect(None).await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn io_failure_disconnects() {
        let connector = ScriptedConnector::new();
        connector.push_response(ScriptedResponse::handshake("JPH_3", vec![]));
        connector.push_response(ScriptedResponse::reset(vec![]));
        let mut client = ProtocolClient::new(connector, endpoint());
        client.connect(None).await.unwrap();
        client.send_query(JpipQuery::new()).await.unwrap();
        client.read_header().await.unwrap();

        let err = client.next_segment().await.unwrap_err();
        assert!(err.is_connection_reset());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.is_connected());
        assert!(client.send_query(JpipQuery::new()).await.is_err());
    }
}
