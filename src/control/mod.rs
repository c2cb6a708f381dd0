//! Device-state synchronisation and automatic control
//!
//! Two writers share the store: the dispatcher applies user intent
//! optimistically, the ingestor applies device feedback, which always wins.
//! The policy is pure and only proposes commands.

pub mod dispatcher;
pub mod ingestor;
pub mod policy;

pub use dispatcher::{CommandDispatcher, ControlAction, FALLBACK_BRIGHTNESS};
pub use ingestor::{resolve_timestamp, FeedbackIngestor, IngestOutcome};
pub use policy::{evaluate, PolicyInput};
