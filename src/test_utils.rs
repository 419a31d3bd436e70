//! Test doubles for the transport, codec and sink seams
//!
//! [`ScriptedConnector`] hands out in-memory transports that answer each
//! request with the next [`ScriptedResponse`]; every query string sent is
//! recorded. [`MockCodec`] "decodes" a frame into samples that encode the
//! frame number and logs every decode it starts. [`RecordingSink`] keeps every
//! published frame.

#![cfg(any(test, feature = "benchmark"))]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};

use crate::cache::CompletenessTracker;
use crate::codec::{CodecEngine, DecodeSession, DecodedChunk};
use crate::config::Endpoint;
use crate::protocol::{
    BinClass, Connector, DataBinId, DataSegment, EorReason, JpipRequest, ResponseHeader,
    Transport,
};
use crate::sink::FrameSink;
use crate::types::{DecodedFrame, ImageParameter, SubRegion};
use crate::{Result, StreamError};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Main header data-bin of `frame`.
pub fn main_header(frame: u64) -> DataSegment {
    DataSegment::data(DataBinId::new(BinClass::MainHeader, frame, 0), 0, vec![0xFF, 0x4F], true)
}

/// A precinct data-bin fragment of `frame`.
pub fn precinct(frame: u64, id: u64, bytes: usize) -> DataSegment {
    DataSegment::data(DataBinId::new(BinClass::Precinct, frame, id), 0, vec![0xA5; bytes], false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Finish,
    Stall,
    Reset,
    /// The peer closed the connection before answering
    Closed,
}

/// Canned answer to one request.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    channel_id: Option<String>,
    segments: VecDeque<DataSegment>,
    ending: Ending,
    /// Hold the rest of the body back after this many messages until notified
    gate: Option<(usize, Arc<Notify>)>,
    delivered: usize,
}

impl ScriptedResponse {
    /// Channel grant carrying `segments` and a window-done end-of-response.
    pub fn handshake(channel_id: &str, segments: Vec<DataSegment>) -> Self {
        let mut response = Self::data(segments, EorReason::WindowDone);
        response.channel_id = Some(channel_id.to_string());
        response
    }

    /// `segments` followed by an end-of-response with `reason`.
    pub fn data(segments: Vec<DataSegment>, reason: EorReason) -> Self {
        let mut segments: VecDeque<DataSegment> = segments.into();
        segments.push_back(DataSegment::end(reason));
        Self::new(segments, Ending::Finish)
    }

    fn new(segments: VecDeque<DataSegment>, ending: Ending) -> Self {
        Self { channel_id: None, segments, ending, gate: None, delivered: 0 }
    }

    /// Delivers `segments`, then never sends anything again.
    pub fn stall(segments: Vec<DataSegment>) -> Self {
        Self::new(segments.into(), Ending::Stall)
    }

    /// Delivers `segments`, then the peer resets the connection.
    pub fn reset(segments: Vec<DataSegment>) -> Self {
        Self::new(segments.into(), Ending::Reset)
    }

    /// The connection is closed instead of answering.
    pub fn closed() -> Self {
        Self::new(VecDeque::new(), Ending::Closed)
    }

    /// Deliver `after` messages, then wait for `gate` before the rest.
    pub fn gated(mut self, after: usize, gate: Arc<Notify>) -> Self {
        self.gate = Some((after, gate));
        self
    }

    fn header(&self) -> ResponseHeader {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "image/jpp-stream".to_string());
        if let Some(cid) = &self.channel_id {
            headers.insert("jpip-cnew".to_string(), format!("cid={},path=jpip,transport=http", cid));
        }
        ResponseHeader { status: 200, reason: "OK".to_string(), headers }
    }
}

#[derive(Debug, Default)]
struct Script {
    responses: VecDeque<ScriptedResponse>,
    requests: Vec<String>,
    connect_failures: u32,
    connects: u32,
}

/// Connector whose transports replay scripted responses.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: ScriptedResponse) {
        lock(&self.script).responses.push_back(response);
    }

    /// Query strings of every request sent so far, across connections.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.script).requests.clone()
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.script).connect_failures = count;
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        lock(&self.script).connects
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self, endpoint: &Endpoint) -> Result<ScriptedTransport> {
        let mut script = lock(&self.script);
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(StreamError::connection_failed(format!("{} refused", endpoint.authority())));
        }
        script.connects += 1;
        Ok(ScriptedTransport { script: self.script.clone(), queued: VecDeque::new(), current: None })
    }
}

/// In-memory transport produced by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Arc<Mutex<Script>>,
    queued: VecDeque<ScriptedResponse>,
    current: Option<ScriptedResponse>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, request: &JpipRequest) -> Result<()> {
        let response = {
            let mut script = lock(&self.script);
            script.requests.push(request.query.to_string());
            script.responses.pop_front()
        };
        self.queued.push_back(response.unwrap_or_else(|| ScriptedResponse::stall(Vec::new())));
        Ok(())
    }

    async fn read_header(&mut self) -> Result<ResponseHeader> {
        match self.queued.pop_front() {
            Some(response) if response.ending == Ending::Closed => {
                self.queued.clear();
                Err(StreamError::Closed)
            }
            Some(response) => {
                let header = response.header();
                self.current = Some(response);
                Ok(header)
            }
            None => std::future::pending().await,
        }
    }

    async fn read_segment(&mut self) -> Result<Option<DataSegment>> {
        let Some(response) = self.current.as_mut() else {
            return Ok(None);
        };
        let held = match &response.gate {
            Some((after, gate)) if response.delivered == *after => Some(gate.clone()),
            _ => None,
        };
        if let Some(gate) = held {
            gate.notified().await;
            response.gate = None;
        }
        if let Some(segment) = response.segments.pop_front() {
            response.delivered += 1;
            return Ok(Some(segment));
        }
        match response.ending {
            Ending::Finish => {
                self.current = None;
                Ok(None)
            }
            Ending::Stall | Ending::Closed => std::future::pending().await,
            Ending::Reset => Err(StreamError::transport(
                "reading segment",
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer"),
            )),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.current = None;
        self.queued.clear();
        Ok(())
    }
}

/// One decode started by [`MockCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeRecord {
    pub frame: u32,
    pub level: u8,
}

/// Shared view of the decodes a [`MockCodec`] performed.
#[derive(Debug, Clone, Default)]
pub struct DecodeLog {
    records: Arc<Mutex<Vec<DecodeRecord>>>,
}

impl DecodeLog {
    pub fn records(&self) -> Vec<DecodeRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Codec producing samples `(frame << 8) | level` for every pixel.
#[derive(Debug)]
pub struct MockCodec {
    channels: u32,
    log: DecodeLog,
    failing: HashSet<u32>,
    /// Report regions this many pixels wider than requested
    widen: u32,
}

impl MockCodec {
    pub fn new(channels: u32) -> Self {
        Self { channels, log: DecodeLog::default(), failing: HashSet::new(), widen: 0 }
    }

    pub fn log(&self) -> DecodeLog {
        self.log.clone()
    }

    /// Make decoding `frame` fail with a codec error.
    pub fn fail_on(mut self, frame: u32) -> Self {
        self.failing.insert(frame);
        self
    }

    /// Produce chunks that no longer fit the requested region.
    pub fn out_of_sync(mut self) -> Self {
        self.widen = 1;
        self
    }
}

impl CodecEngine for MockCodec {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn open<'a>(
        &'a mut self,
        param: &ImageParameter,
        _cache: &CompletenessTracker,
    ) -> Result<Box<dyn DecodeSession + Send + 'a>> {
        lock(&self.log.records).push(DecodeRecord { frame: param.frame, level: param.resolution.level });
        if self.failing.contains(&param.frame) {
            return Err(StreamError::codec(param.frame, "scripted failure"));
        }
        let region = SubRegion { width: param.region.width + self.widen, ..param.region };
        Ok(Box::new(MockSession {
            region,
            next_row: 0,
            sample: (param.frame << 8) | u32::from(param.resolution.level),
        }))
    }
}

struct MockSession {
    region: SubRegion,
    next_row: u32,
    sample: u32,
}

impl DecodeSession for MockSession {
    fn process(&mut self, max_samples: usize) -> Result<Option<DecodedChunk>> {
        if self.next_row >= self.region.height || self.region.width == 0 {
            return Ok(None);
        }
        let rows = (max_samples / self.region.width as usize).max(1) as u32;
        let rows = rows.min(self.region.height - self.next_row);
        let chunk = SubRegion::new(self.region.x, self.region.y + self.next_row, self.region.width, rows);
        self.next_row += rows;
        Ok(Some(DecodedChunk { samples: vec![self.sample; chunk.pixel_count()], region: chunk }))
    }
}

/// Sink that keeps every published frame.
#[derive(Debug)]
pub struct RecordingSink {
    frames: Mutex<Vec<DecodedFrame>>,
    count: watch::Sender<usize>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self { frames: Mutex::new(Vec::new()), count })
    }

    pub fn frames(&self) -> Vec<DecodedFrame> {
        lock(&self.frames).clone()
    }

    pub fn frame_numbers(&self) -> Vec<u32> {
        lock(&self.frames).iter().map(|f| f.frame).collect()
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` frames were published; false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n >= count)).await.is_ok_and(|r| r.is_ok())
    }
}

impl FrameSink for RecordingSink {
    fn publish(&self, frame: DecodedFrame) {
        lock(&self.frames).push(frame);
        self.count.send_modify(|n| *n += 1);
    }
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
