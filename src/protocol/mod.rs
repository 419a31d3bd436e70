//! JPIP over HTTP: request serialisation, the `reqwest` transport, JPP-stream
//! messages and the connection state machine.

pub mod client;
pub mod http;
pub mod message;
pub mod query;
pub mod transport;

pub use client::{ClientState, CloseHandle, ProtocolClient, Shutdown};
pub use http::{HttpConnector, HttpTransport, ResponseHeader};
pub use message::{BinClass, DataBinId, DataSegment, EorReason, MessageParser, SegmentHeader};
pub use query::{JpipQuery, JpipRequest, RequestField};
pub use transport::{Connector, Transport};
