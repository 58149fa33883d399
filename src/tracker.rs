//! Correspondence tracking between ingress metadata and backend output
//!
//! The backend buffers internally, may reorder within a bounded window, and
//! may silently drop frames. The caller nevertheless needs exact metadata
//! fidelity on output. The tracker resolves this with a monotonically
//! increasing correspondence id embedded in each buffer at ingress, matched
//! FIFO against an internal pending-metadata queue at egress: entries with
//! ids below a delivered id were silently dropped by the backend and are
//! discarded; a delivered id below the queue front is an unrepairable
//! protocol violation and fails fatally.
//!
//! The pending queue has its own lock, independent of the output queue's, so
//! the ingress and egress paths never contend on a shared exclusive lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::backend::{BackendDelivery, MediaBackend};
use crate::config::PipelineConfig;
use crate::error::{FramelinkError, Result};
use crate::queue::BoundedFrameQueue;
use crate::stats::{RateCounter, WarnLimiter};
use crate::types::{BufferTimingInfo, FrameEnvelope, OverflowPolicy};

/// Overflow and correspondence-failure warnings fire once per this many
/// dropped frames
const FRAME_DROP_REPORT_RATE: u64 = 10;
/// Correspondence-failure warnings fire once per this many failures
const CORRESPONDENCE_FAIL_REPORT_RATE: u64 = 5;

/// Metadata recorded at ingress, consumed FIFO at egress
#[derive(Debug)]
struct PendingEntry<T> {
    timing: BufferTimingInfo,
    user_data: T,
}

/// Snapshot of the tracker's recoverable-condition counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerCounters {
    /// Pending-metadata entries evicted past the hard ceiling
    pub input_overflow: u64,
    /// Output frames dropped on a full output queue
    pub output_overflow: u64,
    /// Deliveries dropped because the backend withheld the correspondence id
    pub correspondence_fail: u64,
}

/// Matches caller metadata submitted at ingress with buffers returned
/// asynchronously at egress
pub struct CorrespondenceTracker<T> {
    output: BoundedFrameQueue<FrameEnvelope<T>>,
    pending: Mutex<VecDeque<PendingEntry<T>>>,
    policy: OverflowPolicy,
    max_input_queue_size: usize,
    max_pending_entries: usize,
    input_overflow: WarnLimiter,
    output_overflow: WarnLimiter,
    correspondence_fail: WarnLimiter,
    ingress_rate: RateCounter,
    egress_rate: RateCounter,
    end_of_stream: AtomicBool,
}

impl<T> CorrespondenceTracker<T> {
    /// Create a tracker configured from a [`PipelineConfig`]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            output: BoundedFrameQueue::with_poll_interval(
                config.max_output_queue_size,
                config.queue_poll_interval(),
            ),
            pending: Mutex::new(VecDeque::new()),
            policy: config.overflow_policy,
            max_input_queue_size: config.max_input_queue_size,
            max_pending_entries: config.max_pending_entries,
            input_overflow: WarnLimiter::new(FRAME_DROP_REPORT_RATE),
            output_overflow: WarnLimiter::new(FRAME_DROP_REPORT_RATE),
            correspondence_fail: WarnLimiter::new(CORRESPONDENCE_FAIL_REPORT_RATE),
            ingress_rate: RateCounter::default(),
            egress_rate: RateCounter::default(),
            end_of_stream: AtomicBool::new(false),
        }
    }

    /// Submit a buffer and its user data to the backend
    ///
    /// Returns `Ok(false)` without side effects when the pending queue is at
    /// the input limit in `DiscardInput` mode, or when the backend refused
    /// the buffer. On acceptance the timing and user data are recorded for
    /// later correspondence matching.
    pub fn submit_for_processing(
        &self,
        backend: &dyn MediaBackend,
        buffer: crate::buffer::OwnedBuffer,
        timing: BufferTimingInfo,
        user_data: T,
    ) -> Result<bool> {
        if self.policy == OverflowPolicy::DiscardInput {
            let pending = self.pending.lock().expect("pending lock poisoned");
            if pending.len() >= self.max_input_queue_size {
                return Ok(false);
            }
        }

        let size = buffer.len();
        let accepted = backend.push_buffer(buffer, &timing, timing.offset)?;
        if !accepted {
            return Ok(false);
        }

        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.push_back(PendingEntry { timing, user_data });
            // Evicting the oldest entry keeps a runaway backend from pinning
            // ingress; tolerated and counted, never fatal.
            if pending.len() > self.max_pending_entries {
                pending.pop_front();
                drop(pending);
                if let Some(n) = self.input_overflow.tick() {
                    tracing::warn!(
                        dropped = n,
                        "pending-metadata queue is full, evicted oldest entries"
                    );
                }
            }
        }

        if let Some(report) = self.ingress_rate.count(size) {
            tracing::debug!(
                rate_hz = report.rate_hz,
                bandwidth_kbps = report.bandwidth_kbps,
                "pushing buffers into backend"
            );
        }

        Ok(true)
    }

    /// Handle an asynchronous delivery from the backend's egress port
    ///
    /// Invoked through the [`DeliverySink`](crate::backend::DeliverySink)
    /// wired at initialization, from whatever thread the backend uses.
    pub fn on_backend_output_ready(&self, delivery: BackendDelivery) -> Result<()> {
        let mut delivered = match delivery {
            BackendDelivery::EndOfStream => {
                self.end_of_stream.store(true, Ordering::SeqCst);
                tracing::info!("received end-of-stream from backend");
                return Ok(());
            }
            BackendDelivery::Buffer(delivered) => delivered,
        };

        let id = match delivered.correspondence_id {
            Some(id) => id,
            None => {
                if let Some(n) = self.correspondence_fail.tick() {
                    tracing::warn!(
                        dropped = n,
                        "could not establish correspondence of frame and user data"
                    );
                }
                return Ok(());
            }
        };

        // Copy out of the backend-owned slot before any queue work so the
        // backend regains the slot as soon as possible.
        let buffer = delivered.buffer.deep_copy()?;
        let size = buffer.len();

        let entry = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            loop {
                let front_offset = match pending.front() {
                    Some(front) => front.timing.offset,
                    None => return Err(FramelinkError::PendingQueueEmpty { id }),
                };
                if id < front_offset {
                    return Err(FramelinkError::CorrespondenceOrder {
                        id,
                        front: front_offset,
                    });
                }
                let entry = pending.pop_front().expect("front checked above");
                if id == front_offset {
                    break entry;
                }
                // Entries below the delivered id are frames the backend
                // silently dropped.
            }
        };

        if let Some(report) = self.egress_rate.count(size) {
            tracing::debug!(
                rate_hz = report.rate_hz,
                bandwidth_kbps = report.bandwidth_kbps,
                "outputting buffers from backend"
            );
        }

        let envelope = FrameEnvelope {
            buffer,
            timing: entry.timing,
            user_data: entry.user_data,
        };

        match self.policy {
            OverflowPolicy::DiscardOutput => {
                if self.output.try_push(envelope).is_err() {
                    if let Some(n) = self.output_overflow.tick() {
                        tracing::warn!(dropped = n, "output queue is full, dropped frames");
                    }
                }
            }
            OverflowPolicy::DiscardInput => {
                if self.output.push_blocking(envelope).is_err() {
                    // Draining: shutdown in progress, not an overload.
                    tracing::debug!("discarded output frame while draining");
                }
            }
        }

        Ok(())
    }

    /// Blocking pop from the output queue; `None` once empty and draining
    pub fn pop_output(&self) -> Option<FrameEnvelope<T>> {
        self.output.pop()
    }

    /// Non-blocking pop from the output queue
    pub fn try_pop_output(&self) -> Option<FrameEnvelope<T>> {
        self.output.try_pop()
    }

    /// Whether output is available
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Number of frames currently queued for the consumer
    pub fn output_len(&self) -> usize {
        self.output.len()
    }

    /// Number of pending-metadata entries awaiting egress
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Set the output queue's draining flag (shutdown path)
    pub fn set_draining(&self, draining: bool) {
        self.output.set_draining(draining);
    }

    /// Clear both queues and the end-of-stream flag (start-of-run reset)
    pub fn reset(&self) {
        self.output.clear();
        self.output.set_draining(false);
        self.pending.lock().expect("pending lock poisoned").clear();
        self.end_of_stream.store(false, Ordering::SeqCst);
    }

    /// Whether the backend signalled end of stream since the last reset
    pub fn saw_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::SeqCst)
    }

    /// Snapshot the recoverable-condition counters
    pub fn counters(&self) -> TrackerCounters {
        TrackerCounters {
            input_overflow: self.input_overflow.total(),
            output_overflow: self.output_overflow.total(),
            correspondence_fail: self.correspondence_fail.total(),
        }
    }
}
