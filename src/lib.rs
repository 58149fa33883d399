//! # framelink
//!
//! Buffer-correspondence pipeline core: a safe harness around an opaque,
//! asynchronous media backend that buffers internally and drops frames
//! without notice.
//!
//! The crate solves three problems that show up whenever caller-side
//! metadata has to survive a round trip through such a backend:
//!
//! - **Scoped buffer ownership** ([`buffer`]): buffers wrap reference-counted
//!   backend memory with exactly-once map/unmap/release semantics
//! - **Correspondence tracking** ([`tracker`]): a monotonically increasing id
//!   is stamped on each ingress buffer and matched FIFO at egress, tolerating
//!   silent backend drops while failing fast on protocol violations
//! - **Lifecycle and recovery** ([`pipeline`]): initialize/start/stop state
//!   machine, synthetic timestamping, and a watchdog that restarts a wedged
//!   backend in place
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framelink::{MockBackend, OwnedBuffer, PipelineConfig, PipelineController};
//!
//! # fn main() -> framelink::Result<()> {
//! let backend = Arc::new(MockBackend::new());
//! let pipeline: PipelineController<u64> =
//!     PipelineController::new(backend, PipelineConfig::default());
//!
//! pipeline.initialize()?;
//! pipeline.start()?;
//!
//! pipeline.push_input(OwnedBuffer::from_bytes(b"frame".to_vec()), 42)?;
//! if let Some(frame) = pipeline.pop_output() {
//!     assert_eq!(frame.user_data, 42);
//! }
//!
//! pipeline.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
#[cfg(feature = "mock-backend")]
pub mod mock_backend;
pub mod pipeline;
pub mod queue;
pub mod stats;
pub mod tracker;
pub mod types;

pub use backend::{
    BackendDelivery, BackendEvent, DeliveredBuffer, DeliverySink, MediaBackend, MediaCaps,
};
pub use buffer::{BufferMemory, HeapMemory, OwnedBuffer};
pub use config::PipelineConfig;
pub use error::{FramelinkError, Result, ResultExt};
#[cfg(feature = "mock-backend")]
pub use mock_backend::{MockBackend, MockBehavior};
pub use pipeline::PipelineController;
pub use queue::BoundedFrameQueue;
pub use tracker::{CorrespondenceTracker, TrackerCounters};
pub use types::{BufferTimingInfo, FrameEnvelope, OverflowPolicy, PipelineState};
