//! Shared foundations for every layer.
//!
//! - [`NetError`](neterror::NetError): error codes with a classification
//! - [`LoadState`](loadstate::LoadState): coarse progress of a task
//! - [`context`]: attaching file paths and URLs to I/O failures

pub mod context;
pub mod loadstate;
pub mod neterror;

#[cfg(test)]
mod tests;
