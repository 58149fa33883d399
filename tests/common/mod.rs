//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

use framelink::{
    FrameEnvelope, MockBackend, MockBehavior, OwnedBuffer, PipelineConfig, PipelineController,
};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing once for the whole test binary; honors RUST_LOG
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Default timeout for waiting on asynchronous deliveries
pub fn delivery_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Build an initialized, started pipeline over a mock backend
pub fn started_pipeline(
    behavior: MockBehavior,
    config: PipelineConfig,
) -> (Arc<MockBackend>, PipelineController<u64>) {
    init_tracing();
    let backend = Arc::new(MockBackend::with_behavior(behavior));
    let pipeline: PipelineController<u64> = PipelineController::new(backend.clone(), config);
    pipeline.initialize().expect("initialize failed");
    pipeline.start().expect("start failed");
    (backend, pipeline)
}

/// A config with a roomy output queue so tests can push bursts without a
/// concurrent consumer
pub fn roomy_config() -> PipelineConfig {
    PipelineConfig {
        max_output_queue_size: 64,
        ..PipelineConfig::default()
    }
}

/// Push a payload with user data, asserting acceptance
pub fn push(pipeline: &PipelineController<u64>, payload: &[u8], user_data: u64) {
    let accepted = pipeline
        .push_input(OwnedBuffer::from_bytes(payload.to_vec()), user_data)
        .expect("push_input failed");
    assert!(accepted, "buffer was not accepted");
}

/// Collect `n` output frames, polling until the timeout elapses
pub fn collect_outputs(pipeline: &PipelineController<u64>, n: usize) -> Vec<FrameEnvelope<u64>> {
    let deadline = Instant::now() + delivery_timeout();
    let mut frames = Vec::with_capacity(n);
    while frames.len() < n {
        if let Some(frame) = pipeline.try_pop_output() {
            frames.push(frame);
            continue;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for output frame {} of {}",
            frames.len() + 1,
            n
        );
        std::thread::sleep(Duration::from_millis(5));
    }
    frames
}

/// Wait until `predicate` holds, panicking after the delivery timeout
pub fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    let deadline = Instant::now() + delivery_timeout();
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}
