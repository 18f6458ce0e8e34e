pub mod domain;
pub mod engine;
pub mod events;
pub mod store;

pub use domain::{AgentRequest, RequestState};
pub use engine::{AgentEngine, EngineError, RequestStatus};
pub use events::{transcript_text, EventPayload, ExecutionEvent};
pub use store::{RequestStore, RequestStoreError};
