//! Ergonomic error context helpers.
//!
//! Provides extension traits for adding context to `Result` types,
//! converting IO errors into the stable `NetError` taxonomy.

use crate::base::neterror::NetError;
use std::io;

/// Map an IO error onto the closest `NetError`.
pub fn net_error_from_io(err: &io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
        io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
        io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        io::ErrorKind::AddrInUse => NetError::AddressInUse,
        io::ErrorKind::AddrNotAvailable => NetError::AddressUnreachable,
        io::ErrorKind::NotFound => NetError::FileNotFound,
        io::ErrorKind::PermissionDenied => NetError::AccessDenied,
        _ => NetError::Failed,
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use muxnet::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 80)?;
    /// // Error: NetError::ConnectionRefused, with host/port logged
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Add file context to an IO error (body sources and drains).
    fn file_context(self, path: &std::path::Path) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(host = %host, port, error = %e, "connection failed");
            net_error_from_io(&e)
        })
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(domain = %domain, error = %e, "DNS resolution failed");
            NetError::NameNotResolved
        })
    }

    fn file_context(self, path: &std::path::Path) -> Result<T, NetError> {
        self.map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "file operation failed");
            net_error_from_io(&e)
        })
    }
}
