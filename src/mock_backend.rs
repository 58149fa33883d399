//! Mock media backend for testing without a real media stack
//!
//! Simulates the collaborator contract end to end: buffers pushed into the
//! ingress port are handed to an internal worker thread and delivered back
//! through the [`DeliverySink`] asynchronously, from a thread that is never
//! the caller's. The simulation is configurable:
//!
//! - **Batched delivery**: hold up to `batch_window` buffers before flushing,
//!   so output arrives late and out-of-band relative to ingress
//! - **Silent drops**: configured offsets are consumed and never delivered
//! - **Id withholding**: configured offsets are delivered without a
//!   correspondence id
//! - **Stalling**: swallow all buffers to exercise the watchdog
//! - **End-of-stream and fatal-error injection**
//!
//! Delivered buffers are borrowed views, as with a real backend, so the
//! receiving side must deep-copy them.
//!
//! Only compiled with the `mock-backend` feature (enabled by default).

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::{
    BackendDelivery, BackendEvent, DeliveredBuffer, DeliverySink, MediaBackend, MediaCaps,
};
use crate::buffer::{HeapMemory, OwnedBuffer};
use crate::error::{FramelinkError, Result};
use crate::types::{BufferTimingInfo, PipelineState};

/// Behavior knobs for the mock backend
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Number of buffers held before a delivery flush (1 = immediate)
    pub batch_window: usize,
    /// Offsets consumed without ever being delivered
    pub drop_offsets: HashSet<u64>,
    /// Offsets delivered without a correspondence id
    pub withhold_id_offsets: HashSet<u64>,
    /// Refuse every ingress push (flow refusal, not an error)
    pub refuse_flow: bool,
    /// Fail `set_running` transitions
    pub fail_transitions: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            batch_window: 1,
            drop_offsets: HashSet::new(),
            withhold_id_offsets: HashSet::new(),
            refuse_flow: false,
            fail_transitions: false,
        }
    }
}

struct WorkItem {
    payload: Vec<u8>,
    timing: BufferTimingInfo,
    correspondence_id: u64,
}

/// In-process simulated media backend
pub struct MockBackend {
    behavior: MockBehavior,
    stalled: Arc<AtomicBool>,
    running: AtomicBool,
    state: Mutex<PipelineState>,
    ingress_tx: Mutex<Option<Sender<WorkItem>>>,
    event_tx: Sender<BackendEvent>,
    event_rx: Receiver<BackendEvent>,
    sink: Mutex<Option<DeliverySink>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    input_caps: Mutex<Option<MediaCaps>>,
}

impl MockBackend {
    /// Create a mock backend with default (immediate passthrough) behavior
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// Create a mock backend with explicit behavior
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let (event_tx, event_rx) = unbounded();
        Self {
            behavior,
            stalled: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            state: Mutex::new(PipelineState::Ready),
            ingress_tx: Mutex::new(None),
            event_tx,
            event_rx,
            sink: Mutex::new(None),
            worker: Mutex::new(None),
            input_caps: Mutex::new(None),
        }
    }

    /// Swallow all subsequent ingress buffers (wedged backend)
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Deliver an end-of-stream signal and emit the matching event
    pub fn end_stream(&self) {
        if let Some(sink) = self.sink.lock().expect("sink lock poisoned").as_ref() {
            let _ = sink.deliver(BackendDelivery::EndOfStream);
        }
        let _ = self.event_tx.send(BackendEvent::EndOfStream);
    }

    /// Emit a fatal backend error event
    pub fn inject_error(&self, message: impl Into<String>) {
        let _ = self.event_tx.send(BackendEvent::Error {
            message: message.into(),
            debug: None,
        });
    }

    fn spawn_worker(&self, sink: DeliverySink, rx: Receiver<WorkItem>) -> JoinHandle<()> {
        let behavior = self.behavior.clone();
        let stalled = self.stalled.clone();
        let event_tx = self.event_tx.clone();
        std::thread::spawn(move || {
            let mut window: Vec<WorkItem> = Vec::with_capacity(behavior.batch_window);
            loop {
                match rx.recv() {
                    Ok(item) => {
                        if stalled.load(Ordering::SeqCst) {
                            continue;
                        }
                        window.push(item);
                        if window.len() >= behavior.batch_window {
                            if !flush(&sink, &behavior, &event_tx, &mut window) {
                                return;
                            }
                        }
                    }
                    Err(_) => {
                        flush(&sink, &behavior, &event_tx, &mut window);
                        return;
                    }
                }
            }
        })
    }
}

/// Deliver every held item in ingress order; returns false after a fatal
/// sink error
fn flush(
    sink: &DeliverySink,
    behavior: &MockBehavior,
    event_tx: &Sender<BackendEvent>,
    window: &mut Vec<WorkItem>,
) -> bool {
    for item in window.drain(..) {
        if behavior.drop_offsets.contains(&item.correspondence_id) {
            continue;
        }
        let correspondence_id = if behavior.withhold_id_offsets.contains(&item.correspondence_id) {
            None
        } else {
            Some(item.correspondence_id)
        };
        let delivered = DeliveredBuffer {
            buffer: OwnedBuffer::borrowed(Box::new(HeapMemory::new(item.payload))),
            correspondence_id,
            timing: item.timing,
        };
        if let Err(e) = sink.deliver(BackendDelivery::Buffer(delivered)) {
            let _ = event_tx.send(BackendEvent::Error {
                message: format!("delivery rejected: {e}"),
                debug: None,
            });
            return false;
        }
    }
    true
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for MockBackend {
    fn build_graph(&self, sink: DeliverySink) -> Result<()> {
        let mut sink_slot = self.sink.lock().expect("sink lock poisoned");
        if sink_slot.is_some() {
            return Err(FramelinkError::Backend("graph already built".into()));
        }
        let (tx, rx) = unbounded();
        let handle = self.spawn_worker(sink.clone(), rx);
        *sink_slot = Some(sink);
        *self.ingress_tx.lock().expect("ingress lock poisoned") = Some(tx);
        *self.worker.lock().expect("worker lock poisoned") = Some(handle);
        Ok(())
    }

    fn push_buffer(
        &self,
        mut buffer: OwnedBuffer,
        timing: &BufferTimingInfo,
        correspondence_id: u64,
    ) -> Result<bool> {
        if self.behavior.refuse_flow {
            return Ok(false);
        }
        let payload = buffer.map_read()?.to_vec();
        let ingress = self.ingress_tx.lock().expect("ingress lock poisoned");
        let tx = ingress
            .as_ref()
            .ok_or_else(|| FramelinkError::Backend("ingress port not built".into()))?;
        let accepted = tx
            .send(WorkItem {
                payload,
                timing: *timing,
                correspondence_id,
            })
            .is_ok();
        Ok(accepted)
    }

    fn set_running(&self, running: bool) -> Result<()> {
        if self.behavior.fail_transitions {
            return Err(FramelinkError::StateTransition(
                "mock backend refused transition".into(),
            ));
        }
        let old = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let old = *state;
            *state = if running {
                PipelineState::Running
            } else {
                PipelineState::Stopped
            };
            old
        };
        self.running.store(running, Ordering::SeqCst);
        let new = if running {
            PipelineState::Running
        } else {
            PipelineState::Stopped
        };
        if old != new {
            let _ = self.event_tx.send(BackendEvent::StateChanged { old, new });
        }
        Ok(())
    }

    fn poll_event(&self, timeout: Duration) -> Option<BackendEvent> {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn set_input_caps(&self, caps: &MediaCaps) -> Result<()> {
        *self.input_caps.lock().expect("caps lock poisoned") = Some(caps.clone());
        Ok(())
    }

    fn output_caps(&self) -> Option<MediaCaps> {
        if self.running.load(Ordering::SeqCst) {
            self.input_caps
                .lock()
                .expect("caps lock poisoned")
                .clone()
                .or_else(|| Some(MediaCaps::new("mock/processed")))
        } else {
            None
        }
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        // Closing the ingress channel lets the worker flush and exit.
        self.ingress_tx.lock().expect("ingress lock poisoned").take();
        if let Some(handle) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded as channel;

    fn collecting_sink() -> (DeliverySink, Receiver<Option<u64>>) {
        let (tx, rx) = channel();
        let sink = DeliverySink::new(move |delivery| {
            match delivery {
                BackendDelivery::Buffer(buf) => {
                    let _ = tx.send(buf.correspondence_id);
                }
                BackendDelivery::EndOfStream => {
                    let _ = tx.send(Some(u64::MAX));
                }
            }
            Ok(())
        });
        (sink, rx)
    }

    fn push(backend: &MockBackend, offset: u64) {
        let accepted = backend
            .push_buffer(
                OwnedBuffer::from_bytes(vec![offset as u8; 8]),
                &BufferTimingInfo::with_offset(offset),
                offset,
            )
            .unwrap();
        assert!(accepted);
    }

    #[test]
    fn test_passthrough_delivers_in_order() {
        let backend = MockBackend::new();
        let (sink, rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        push(&backend, 0);
        push(&backend, 1);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(1));
    }

    #[test]
    fn test_batched_delivery_flushes_at_window() {
        let backend = MockBackend::with_behavior(MockBehavior {
            batch_window: 3,
            ..MockBehavior::default()
        });
        let (sink, rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        push(&backend, 0);
        push(&backend, 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        push(&backend, 2);
        for expected in 0..3 {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(1)).unwrap(),
                Some(expected)
            );
        }
    }

    #[test]
    fn test_drop_offsets_never_delivered() {
        let backend = MockBackend::with_behavior(MockBehavior {
            drop_offsets: [1].into_iter().collect(),
            ..MockBehavior::default()
        });
        let (sink, rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        push(&backend, 0);
        push(&backend, 1);
        push(&backend, 2);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(0));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some(2));
    }

    #[test]
    fn test_withheld_id_delivers_none() {
        let backend = MockBackend::with_behavior(MockBehavior {
            withhold_id_offsets: [0].into_iter().collect(),
            ..MockBehavior::default()
        });
        let (sink, rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        push(&backend, 0);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), None);
    }

    #[test]
    fn test_stall_swallows_buffers() {
        let backend = MockBackend::new();
        let (sink, rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        backend.set_stalled(true);
        push(&backend, 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_state_transition_events() {
        let backend = MockBackend::new();
        let (sink, _rx) = collecting_sink();
        backend.build_graph(sink).unwrap();

        backend.set_running(true).unwrap();
        let event = backend.poll_event(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            event,
            BackendEvent::StateChanged {
                new: PipelineState::Running,
                ..
            }
        ));
        assert!(backend.output_caps().is_some());
    }

    #[test]
    fn test_failed_transition() {
        let backend = MockBackend::with_behavior(MockBehavior {
            fail_transitions: true,
            ..MockBehavior::default()
        });
        assert!(matches!(
            backend.set_running(true),
            Err(FramelinkError::StateTransition(_))
        ));
    }
}
