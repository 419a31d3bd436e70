//! Transport seam between the protocol client and the network
//!
//! The client only needs four things from a connection: write a request, read
//! the header of the next response, pull the next message of that response and
//! shut down. Production code uses [`HttpConnector`](super::HttpConnector); tests
//! script responses in memory.

use async_trait::async_trait;

use super::{DataSegment, JpipRequest, ResponseHeader};
use crate::Result;
use crate::config::Endpoint;

/// An open, request/response oriented connection.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn send(&mut self, request: &JpipRequest) -> Result<()>;

    /// Read the header of the next response.
    ///
    /// Any unread remainder of the previous response is discarded first.
    async fn read_header(&mut self) -> Result<ResponseHeader>;

    /// Next message of the current response, `None` once it has ended.
    async fn read_segment(&mut self) -> Result<Option<DataSegment>>;

    async fn shutdown(&mut self) -> Result<()>;
}

/// Factory for transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Transport>;
}
