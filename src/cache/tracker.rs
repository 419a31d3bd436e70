//! Per-frame completeness tracking

use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::trace;

use super::databin::ByteCache;
use crate::protocol::{BinClass, DataSegment, SegmentHeader};
use crate::types::{FrameRange, ImageParameter, RequestKey};

/// How much of a frame is cached for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CacheStatus {
    #[default]
    None,
    /// Some data arrived; enough to start a progressive decode
    Header,
    /// The server reported the request satisfied
    Complete,
}

#[derive(Debug, Clone, Copy, Default)]
struct FrameEntry {
    status: CacheStatus,
    /// Request the status refers to
    key: Option<RequestKey>,
    /// Image data arrived since `key` was set
    fresh: bool,
}

impl FrameEntry {
    fn downgrade(&mut self) {
        if self.status == CacheStatus::Complete {
            self.status = CacheStatus::Header;
        }
    }

    fn status_for(&self, key: &RequestKey) -> CacheStatus {
        if self.key.as_ref() != Some(key) {
            return CacheStatus::None;
        }
        match self.status {
            CacheStatus::Complete => CacheStatus::Complete,
            CacheStatus::Header if self.fresh => CacheStatus::Header,
            _ => CacheStatus::None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    range: FrameRange,
    frames: Vec<FrameEntry>,
    bytes: ByteCache,
    /// Local resources are always renderable
    local: bool,
}

impl Inner {
    fn entry_mut(&mut self, frame: u32) -> Option<&mut FrameEntry> {
        if !self.range.contains(frame) {
            return None;
        }
        self.frames.get_mut((frame - self.range.start) as usize)
    }

    fn entry(&self, frame: u32) -> Option<&FrameEntry> {
        if !self.range.contains(frame) {
            return None;
        }
        self.frames.get((frame - self.range.start) as usize)
    }

    fn accessible_until(&self) -> Option<u32> {
        if self.local {
            return Some(self.range.end);
        }
        let ready = self.frames.iter().take_while(|f| f.status >= CacheStatus::Header).count() as u32;
        ready.checked_sub(1).map(|n| self.range.start + n)
    }
}

/// Tracks which frames can be decoded for which request, and owns the byte cache.
///
/// Shared between the reader (writer side) and the render worker (reader
/// side). Status transitions are `None -> Header` on first data,
/// `Header -> Complete` when the server reports the request satisfied and
/// `Complete -> Header` on downgrade. Nothing ever moves back to `None`.
#[derive(Debug)]
pub struct CompletenessTracker {
    inner: Mutex<Inner>,
    accessible: watch::Sender<Option<u32>>,
}

impl CompletenessTracker {
    pub fn new(range: FrameRange) -> Self {
        Self::build(range, false)
    }

    /// Tracker for a resource that is fully available without a server.
    pub fn local(range: FrameRange) -> Self {
        Self::build(range, true)
    }

    fn build(range: FrameRange, local: bool) -> Self {
        let status = if local { CacheStatus::Complete } else { CacheStatus::None };
        let frames = vec![FrameEntry { status, key: None, fresh: local }; range.len() as usize];
        let inner = Inner { range, frames, bytes: ByteCache::new(), local };
        let (accessible, _) = watch::channel(inner.accessible_until());
        Self { inner: Mutex::new(inner), accessible }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        let until = inner.accessible_until();
        self.accessible.send_if_modified(|current| {
            if *current == until {
                false
            } else {
                *current = until;
                true
            }
        });
    }

    pub fn is_local(&self) -> bool {
        self.lock().local
    }

    pub fn range(&self) -> FrameRange {
        self.lock().range
    }

    /// Change the tracked frame range, keeping the state of frames in both ranges.
    pub fn set_range(&self, range: FrameRange) {
        let mut inner = self.lock();
        if inner.range == range {
            return;
        }
        let local = inner.local;
        let frames = range
            .iter()
            .map(|f| {
                inner.entry(f).copied().unwrap_or(FrameEntry {
                    status: if local { CacheStatus::Complete } else { CacheStatus::None },
                    key: None,
                    fresh: local,
                })
            })
            .collect();
        inner.frames = frames;
        inner.range = range;
        self.publish(&inner);
    }

    /// Prepare `range` for a new request with `key`.
    ///
    /// Complete frames drop to `Header` and stop counting as renderable for the
    /// new key until data for it arrives.
    pub fn begin_request(&self, range: FrameRange, key: RequestKey) {
        let mut inner = self.lock();
        if inner.local {
            return;
        }
        for frame in range.iter() {
            if let Some(entry) = inner.entry_mut(frame) {
                entry.downgrade();
                entry.key = Some(key);
                entry.fresh = false;
            }
        }
        trace!("Began request over frames {}", range);
        self.publish(&inner);
    }

    /// Downgrade `Complete` frames in `range` to `Header`. Idempotent.
    pub fn downgrade(&self, range: FrameRange) {
        let mut inner = self.lock();
        if inner.local {
            return;
        }
        for frame in range.iter() {
            if let Some(entry) = inner.entry_mut(frame) {
                entry.downgrade();
            }
        }
        self.publish(&inner);
    }

    /// Store one received message that belongs to no particular request.
    ///
    /// Returns true for an end-of-response message that reports the pending
    /// request as satisfied.
    pub fn record_segment(&self, segment: &DataSegment) -> bool {
        self.record(segment, None)
    }

    /// Store one message of the response to the request keyed `key`.
    ///
    /// Image data only counts for frames whose current request is `key`; data
    /// of a superseded request is cached but never makes a frame renderable
    /// for the request that replaced it.
    pub fn record_response_segment(&self, segment: &DataSegment, key: &RequestKey) -> bool {
        self.record(segment, Some(key))
    }

    fn record(&self, segment: &DataSegment, key: Option<&RequestKey>) -> bool {
        let mut inner = self.lock();
        match segment.header {
            SegmentHeader::End(reason) => reason.satisfies_request(),
            SegmentHeader::Data { bin, offset, complete, .. } => {
                inner.bytes.insert(bin, offset, &segment.payload, complete);
                if bin.class == BinClass::Metadata {
                    return false;
                }
                let frame = u32::try_from(bin.codestream).ok();
                if let Some(entry) = frame.and_then(|f| inner.entry_mut(f)) {
                    if entry.status == CacheStatus::None {
                        entry.status = CacheStatus::Header;
                    }
                    let answers = key.is_none_or(|k| entry.key.as_ref() == Some(k));
                    if answers && bin.class != BinClass::MainHeader && !segment.payload.is_empty() {
                        entry.fresh = true;
                    }
                }
                self.publish(&inner);
                false
            }
        }
    }

    /// Mark every frame of `range` complete for its current request.
    pub fn mark_complete(&self, range: FrameRange) {
        self.complete(range, None);
    }

    /// Mark the frames of `range` complete whose current request is `key`.
    /// Frames that moved on to another request keep their status.
    pub fn mark_complete_for(&self, range: FrameRange, key: &RequestKey) {
        self.complete(range, Some(key));
    }

    fn complete(&self, range: FrameRange, key: Option<&RequestKey>) {
        let mut inner = self.lock();
        for frame in range.iter() {
            if let Some(entry) = inner.entry_mut(frame) {
                if key.is_none_or(|k| entry.key.as_ref() == Some(k)) {
                    entry.status = CacheStatus::Complete;
                }
            }
        }
        self.publish(&inner);
    }

    /// Status of `frame` regardless of the request it belongs to.
    pub fn status(&self, frame: u32) -> CacheStatus {
        self.lock().entry(frame).map(|e| e.status).unwrap_or_default()
    }

    /// Status of `frame` for the view described by `param`.
    pub fn status_for(&self, frame: u32, param: &ImageParameter) -> CacheStatus {
        let inner = self.lock();
        match inner.entry(frame) {
            Some(entry) if inner.local => entry.status,
            Some(entry) => entry.status_for(&param.request_key()),
            None => CacheStatus::None,
        }
    }

    /// Whether `frame` holds at least header-level data for `param`.
    pub fn can_render(&self, frame: u32, param: &ImageParameter) -> bool {
        self.status_for(frame, param) >= CacheStatus::Header
    }

    /// Highest frame such that every frame from the range start up to it has data.
    pub fn accessible_until(&self) -> Option<u32> {
        self.lock().accessible_until()
    }

    pub fn subscribe_accessible(&self) -> watch::Receiver<Option<u32>> {
        self.accessible.subscribe()
    }

    /// Run `f` with the byte cache locked.
    pub fn with_bytes<T>(&self, f: impl FnOnce(&ByteCache) -> T) -> T {
        f(&self.lock().bytes)
    }

    /// Server cache model of everything received so far.
    pub fn model_descriptor(&self) -> String {
        self.lock().bytes.model_descriptor()
    }

    pub fn bytes_held(&self) -> usize {
        self.lock().bytes.bytes_held()
    }
}
