pub mod bodysource;
pub mod drain;
pub mod headers;
pub mod requestbody;
pub mod response;
pub mod transferstate;
pub mod wire;

// Re-exports for convenience
pub use bodysource::{BodyChunk, BodySource, BodyStreamSender, RequestBodySource};
pub use drain::{DataDrain, DrainKind, DrainResult};
pub use headers::ParsedResponseHeader;
pub use requestbody::RequestBody;
pub use response::HttpResponse;
pub use transferstate::TransferState;
