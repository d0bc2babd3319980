pub mod cache;
pub mod context;
pub mod delegate;
pub(crate) mod engine;
pub mod job;
pub mod registry;
pub mod request;
pub mod task;

// Re-exports for convenience
pub use cache::{CachePolicy, MemoryResponseCache, ResponseCache};
pub use context::{Session, SessionConfig};
pub use delegate::{RedirectDecision, ResponseDecision, TaskDelegate};
pub use job::{CompletionAction, Lifecycle};
pub use registry::TaskRegistry;
pub use request::Request;
pub use task::{Task, TaskId, TaskState};
