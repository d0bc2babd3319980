//! # muxnet
//!
//! An asynchronous HTTP client engine that drives many concurrent transfers
//! over one event loop per session.
//!
//! `muxnet` keeps the socket work behind a small transport boundary and runs
//! every request through an explicit protocol state machine: header lines and
//! body bytes are folded into immutable transfer snapshots, redirects and
//! final responses are offered to a delegate for a decision, and every task
//! ends with exactly one terminal event.
//!
//! ## Features
//!
//! - **Multiplexing**: one readiness loop and one shared deadline timer per session
//! - **Task API**: resume, suspend, cancel, wait; atomic byte counters
//! - **Delegates**: redirect and response decisions answered asynchronously
//! - **Bodies**: memory, file and streamed uploads; memory, file and discard drains
//! - **Built-in HTTP/1.1 transport**: per-host connection limits, chunked
//!   uploads, plain HTTP proxies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use muxnet::urlrequest::{Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = Session::new(SessionConfig::default());
//!     let task = session.data_task_with_url("http://example.com/").unwrap();
//!     task.resume();
//!     task.wait().await.unwrap();
//!     println!("Status: {}", task.response().unwrap().status());
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Error taxonomy and load states
//! - [`http`] - Header parsing, responses, body sources and drains, wire codec
//! - [`socket`] - Transport boundary, transfer handles, multiplexer, TCP transport
//! - [`urlrequest`] - Sessions, tasks, delegates and the protocol state machine

pub mod base;
pub mod http;
pub mod socket;
pub mod urlrequest;

pub use base::neterror::NetError;
pub use urlrequest::{Request, Session, SessionConfig, Task, TaskDelegate};
