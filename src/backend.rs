//! External media backend contract
//!
//! The backend is an opaque processing pipeline that transforms buffers. It
//! is treated purely as a collaborator: this module specifies the interface
//! the core requires from it and nothing about how it processes media.
//!
//! # Contract
//!
//! - An ingress port ([`MediaBackend::push_buffer`]) accepting an owned
//!   buffer, externally attachable timing metadata, and a per-buffer
//!   correspondence id
//! - An egress callback boundary ([`DeliverySink`]) the backend invokes from
//!   its own thread(s), with no guarantee of calling-thread identity or call
//!   frequency; delivered buffers expose the previously attached
//!   correspondence id
//! - A state/event channel pollable with a timeout
//!   ([`MediaBackend::poll_event`]) yielding fatal errors, end-of-stream, and
//!   state transitions
//! - Running-state transitions ([`MediaBackend::set_running`]) with a failure
//!   signal
//! - Negotiated capability descriptors readable once running

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::OwnedBuffer;
use crate::error::Result;
use crate::types::{BufferTimingInfo, PipelineState};

/// Negotiated capability/format descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaCaps {
    /// Backend-specific format description string
    pub description: String,
}

impl MediaCaps {
    /// Create caps from a description string
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

impl std::fmt::Display for MediaCaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// Event reported on the backend's state/event channel
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// Fatal backend error with diagnostic text
    Error {
        message: String,
        debug: Option<String>,
    },
    /// The backend reached end of stream
    EndOfStream,
    /// The backend transitioned between states
    StateChanged {
        old: PipelineState,
        new: PipelineState,
    },
}

/// A buffer delivered on the backend's egress port
///
/// The buffer is a borrowed view into backend-owned storage; the receiver
/// must deep-copy it promptly so the backend's slot frees as soon as
/// possible.
#[derive(Debug)]
pub struct DeliveredBuffer {
    /// Borrowed view of the delivered data
    pub buffer: OwnedBuffer,
    /// Correspondence id attached at ingress, if the backend preserved it
    pub correspondence_id: Option<u64>,
    /// Timing metadata as computed by the backend (replaced on output with
    /// the metadata recorded at ingress)
    pub timing: BufferTimingInfo,
}

/// Asynchronous egress delivery from the backend
#[derive(Debug)]
pub enum BackendDelivery {
    /// Output buffer ready
    Buffer(DeliveredBuffer),
    /// End of stream, no buffer
    EndOfStream,
}

/// Cloneable handle the backend invokes whenever output is ready
///
/// This is the egress-callback boundary. The sink may be called from any
/// backend thread; it never blocks beyond bounded lock durations except when
/// the configured output overflow policy is blocking. A fatal correspondence
/// violation is returned to the backend as an error.
#[derive(Clone)]
pub struct DeliverySink {
    inner: Arc<dyn Fn(BackendDelivery) -> Result<()> + Send + Sync>,
}

impl DeliverySink {
    /// Wrap a delivery handler
    pub fn new(handler: impl Fn(BackendDelivery) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    /// Deliver backend output
    pub fn deliver(&self, delivery: BackendDelivery) -> Result<()> {
        (self.inner)(delivery)
    }
}

impl std::fmt::Debug for DeliverySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverySink").finish_non_exhaustive()
    }
}

/// Contract required from the external media backend
///
/// Implementations are internally synchronized; every method takes `&self`
/// so a backend can be shared between the producer thread and the
/// controller's event loop.
pub trait MediaBackend: Send + Sync {
    /// Build the backend's internal processing graph and wire the egress
    /// callback. Called exactly once, from `PipelineController::initialize`.
    fn build_graph(&self, sink: DeliverySink) -> Result<()>;

    /// Push an owned buffer into the ingress port with its timing metadata
    /// and correspondence id. The backend takes ownership.
    ///
    /// `Ok(false)` signals flow refusal (buffer dropped by the backend, not
    /// fatal); errors signal resource-lifecycle bugs.
    fn push_buffer(
        &self,
        buffer: OwnedBuffer,
        timing: &BufferTimingInfo,
        correspondence_id: u64,
    ) -> Result<bool>;

    /// Transition the backend to or from its running state
    fn set_running(&self, running: bool) -> Result<()>;

    /// Poll the backend's state/event channel, waiting up to `timeout`
    fn poll_event(&self, timeout: Duration) -> Option<BackendEvent>;

    /// Set the negotiated input capabilities
    fn set_input_caps(&self, caps: &MediaCaps) -> Result<()>;

    /// Read the negotiated output capabilities, available once the backend
    /// reaches a running state
    fn output_caps(&self) -> Option<MediaCaps>;
}
