//! Message processing pipeline.
//!
//! Every message, whichever source it came from, flows through:
//! 1. `ProcessedLedger::try_claim()`: redelivery dedup
//! 2. `BaselineClassifier` + `ContextualJudge`: the two signals
//! 3. `DecisionEngine::evaluate()`: policy-driven verdict
//! 4. `ActionExecutor::execute()`: delete or route
//! 5. `NotificationComposer::notify()`: reviewer alert
//!
//! `ingest` feeds it from a queue or by polling channels.

pub mod actions;
pub mod ingest;
pub mod ledger;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod types;

pub use actions::{ActionExecutor, ActionOutcome, ActionTaken};
pub use ingest::{DeliveryOutcome, IngestSettings, PollSummary, PollingMonitor, QueueIngestor};
pub use ledger::{Outcome, ProcessedLedger, ProcessingRecord};
pub use processor::{ModerationPipeline, PipelineSettings};
pub use queue::{DeadLetter, Delivery, InMemoryQueue, MessageQueue, QueueEnvelope};
pub use retry::RetryPolicy;
pub use types::{MessageStage, ProcessedMessage, ShortCircuit};
