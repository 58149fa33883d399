//! Core types shared across the pipeline
//!
//! # Main Types
//!
//! - [`BufferTimingInfo`] - Per-buffer timing metadata; its `offset` field is
//!   the correspondence key that re-associates output buffers with the
//!   metadata recorded at ingress
//! - [`FrameEnvelope`] - A processed buffer paired with the caller-supplied
//!   user data, the unit exchanged through the output queue
//! - [`PipelineState`] - Observable lifecycle state of a pipeline
//! - [`OverflowPolicy`] - Which side of the pipeline sheds load

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::buffer::OwnedBuffer;

/// Timing metadata attached to a buffer at ingress
///
/// The `offset` field carries the correspondence id and is required to be
/// monotonically non-decreasing across ingress calls. All other fields are
/// restored verbatim onto the matching output buffer, regardless of what
/// timing the backend computed internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferTimingInfo {
    /// Presentation timestamp, relative to pipeline start
    pub pts: Option<Duration>,
    /// Decode timestamp (unset for streams without decode reordering)
    pub dts: Option<Duration>,
    /// Duration of the buffer
    pub duration: Option<Duration>,
    /// Sequence offset, the monotonically increasing correspondence key
    pub offset: u64,
    /// End of the sequence range covered by this buffer, if known
    pub offset_end: Option<u64>,
}

impl BufferTimingInfo {
    /// Create timing info carrying only a correspondence offset
    pub fn with_offset(offset: u64) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }
}

/// A processed buffer together with the user data supplied at ingress
///
/// The timing metadata is the one recorded at ingress for this buffer's
/// correspondence id, re-stamped over whatever the backend computed.
#[derive(Debug)]
pub struct FrameEnvelope<T> {
    /// The transformed buffer, owned by the consumer once popped
    pub buffer: OwnedBuffer,
    /// Timing metadata as submitted at ingress
    pub timing: BufferTimingInfo,
    /// Caller-supplied data recorded at the matching `push_input` call
    pub user_data: T,
}

/// Observable lifecycle state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// `initialize()` has not been called
    Uninitialized,
    /// Backend graph is built, pipeline can be started
    Ready,
    /// Pipeline is processing buffers
    Running,
    /// Pipeline was stopped; `start()` re-transitions to Running
    Stopped,
}

impl PipelineState {
    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Uninitialized => "Uninitialized",
            PipelineState::Ready => "Ready",
            PipelineState::Running => "Running",
            PipelineState::Stopped => "Stopped",
        }
    }

    /// Check if the pipeline is running
    pub fn is_running(&self) -> bool {
        matches!(self, PipelineState::Running)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Overflow policy selecting which side of the pipeline drops under load
///
/// - `DiscardInput`: ingress rejects new buffers once the pending-metadata
///   queue reaches its limit; the output queue blocks the egress path.
/// - `DiscardOutput`: ingress always accepts (up to the hard ceiling); the
///   output queue drops the newest frame when full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Reject input buffers under load, block on output
    DiscardInput,
    /// Accept input, drop output frames under load
    DiscardOutput,
}
