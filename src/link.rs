//! Linked playback of several movies
//!
//! One session of a link group is the master: while it plays, every frame it
//! shows is published here. Follower sessions pick the frame of their own
//! movie that best matches the master position, by timestamp when both sides
//! have timestamps and by frame number otherwise.

use std::sync::Arc;
use tokio::sync::watch;

use crate::scheduler::FrameTimestamps;
use crate::types::FrameRange;

/// Part a session plays in a link group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Master,
    Follower,
}

/// Frame most recently shown by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPosition {
    pub frame: u32,
    pub timestamp_ms: Option<i64>,
}

/// Shared position of a link group.
#[derive(Debug)]
pub struct MovieLink {
    position: watch::Sender<Option<LinkPosition>>,
}

impl MovieLink {
    pub fn new() -> Arc<Self> {
        let (position, _) = watch::channel(None);
        Arc::new(Self { position })
    }

    pub fn publish(&self, position: LinkPosition) {
        self.position.send_if_modified(|current| {
            if *current == Some(position) {
                false
            } else {
                *current = Some(position);
                true
            }
        });
    }

    pub fn position(&self) -> Option<LinkPosition> {
        *self.position.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LinkPosition>> {
        self.position.subscribe()
    }
}

/// Membership of one session in a link group.
#[derive(Debug, Clone)]
pub struct LinkMembership {
    pub link: Arc<MovieLink>,
    pub role: LinkRole,
}

impl LinkMembership {
    pub fn master(link: Arc<MovieLink>) -> Self {
        Self { link, role: LinkRole::Master }
    }

    pub fn follower(link: Arc<MovieLink>) -> Self {
        Self { link, role: LinkRole::Follower }
    }

    pub fn is_master(&self) -> bool {
        self.role == LinkRole::Master
    }
}

/// Frame of `range` a follower shows for the master `position`.
pub fn follow(position: LinkPosition, range: FrameRange, timestamps: Option<&dyn FrameTimestamps>) -> u32 {
    if let (Some(target), Some(ts)) = (position.timestamp_ms, timestamps) {
        let closest = range
            .iter()
            .filter_map(|frame| ts.timestamp_ms(frame).map(|t| (frame, (t - target).abs())))
            .min_by_key(|&(_, distance)| distance);
        if let Some((frame, _)) = closest {
            return frame;
        }
    }
    range.clamp(position.frame)
}
