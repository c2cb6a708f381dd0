//! Test helpers and utilities for integration tests

use smartlight::config::HistorySection;
use smartlight::control::{CommandDispatcher, FeedbackIngestor};
use smartlight::http::auth::StaticTokenAuthenticator;
use smartlight::http::AppState;
use smartlight::store::{MemoryStore, StateStore};
use smartlight::testing::MockTransport;
use std::sync::Arc;

/// Token accepted by [`authenticated_state`]
#[allow(dead_code)]
pub const TEST_TOKEN: &str = "integration-token";

/// Store, transport, dispatcher and ingestor sharing one in-memory store
#[allow(dead_code)]
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub transport: Arc<MockTransport>,
    pub dispatcher: CommandDispatcher<MockTransport>,
    pub ingestor: FeedbackIngestor<MockTransport>,
}

#[allow(dead_code)]
pub fn harness_with(transport: MockTransport) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(transport);
    let shared: Arc<dyn StateStore> = store.clone();
    Harness {
        dispatcher: CommandDispatcher::new(shared.clone(), transport.clone()),
        ingestor: FeedbackIngestor::new(shared, transport.clone()),
        store,
        transport,
    }
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with(MockTransport::new())
}

/// HTTP state with authentication on and one `tester` user
#[allow(dead_code)]
pub fn authenticated_state() -> (AppState<MockTransport>, Arc<MemoryStore>, Arc<MockTransport>) {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MockTransport::new());
    let auth = StaticTokenAuthenticator::new([("tester".to_string(), TEST_TOKEN.to_string())]);
    let state = AppState::new(
        store.clone(),
        transport.clone(),
        Arc::new(auth),
        HistorySection::default(),
    );
    (state, store, transport)
}

#[allow(dead_code)]
pub fn bearer() -> String {
    format!("Bearer {TEST_TOKEN}")
}

/// Telemetry payload as the lamp would publish it
#[allow(dead_code)]
pub fn telemetry(json: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&json).expect("telemetry json serializes")
}
