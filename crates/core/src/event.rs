//! Upload lifecycle events.

use crate::info::UploadInfo;
use serde::{Deserialize, Serialize};

/// Kind of lifecycle transition an event reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new upload was created.
    PostCreate,
    /// A chunk was appended (progress).
    PostReceive,
    /// The upload reached its declared size and was promoted.
    PostFinish,
    /// The upload was terminated.
    PostTerminate,
}

impl EventKind {
    /// Stable string form used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostCreate => "post_create",
            Self::PostReceive => "post_receive",
            Self::PostFinish => "post_finish",
            Self::PostTerminate => "post_terminate",
        }
    }
}

/// An event published on the bus, carrying the upload's current descriptor.
#[derive(Clone, Debug)]
pub struct UploadEvent {
    pub kind: EventKind,
    pub info: UploadInfo,
}
