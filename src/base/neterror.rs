use thiserror::Error;

/// Which layer an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connect, DNS, TLS, timeout and socket failures reported by the transport.
    Transport,
    /// The peer spoke something that is not valid HTTP/1.x, or a redirect
    /// could not be carried out.
    Protocol,
    /// The caller stopped the task (cancel, declined response).
    Application,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Generic Errors
    #[error("Operation failed")]
    Failed,
    #[error("Request cancelled")]
    Cancelled,
    #[error("File not found")]
    FileNotFound,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Access denied")]
    AccessDenied,
    #[error("Upload stream rewind not supported")]
    UploadStreamRewindNotSupported,
    #[error("Session is shutting down")]
    ContextShutDown,

    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("Address in use")]
    AddressInUse,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Unsafe redirect")]
    UnsafeRedirect,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Method not supported")]
    MethodNotSupported,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,

    // Cache Errors
    #[error("Cache miss")]
    CacheMiss,

    // Crate-specific errors
    #[error("Malformed response header line")]
    MalformedHeader,
    #[error("Transfer multiplexer failed")]
    MultiplexerFailed,
    #[error("Invalid request header")]
    InvalidHeader,
    #[error("Response body is not valid UTF-8")]
    InvalidUtf8,
    #[error("Response body is not valid JSON")]
    JsonParseError,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::Cancelled => -3,
            NetError::FileNotFound => -6,
            NetError::TimedOut => -7,
            NetError::AccessDenied => -10,
            NetError::UploadStreamRewindNotSupported => -25,
            NetError::ContextShutDown => -26,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::SslProtocolError => -107,
            NetError::AddressInvalid => -108,
            NetError::AddressUnreachable => -109,
            NetError::TunnelConnectionFailed => -111,
            NetError::ConnectionTimedOut => -118,
            NetError::ProxyConnectionFailed => -130,
            NetError::AddressInUse => -147,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::UnsafeRedirect => -311,
            NetError::InvalidResponse => -320,
            NetError::InvalidChunkedEncoding => -321,
            NetError::MethodNotSupported => -322,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ContentLengthMismatch => -354,
            NetError::IncompleteChunkedEncoding => -355,
            NetError::InvalidHttpResponse => -370,

            NetError::CacheMiss => -400,

            // Custom codes start at -10000, clear of every Chromium range
            NetError::MalformedHeader => -10001,
            NetError::MultiplexerFailed => -10002,
            NetError::InvalidHeader => -10003,
            NetError::InvalidUtf8 => -10004,
            NetError::JsonParseError => -10005,
            NetError::Unknown(code) => *code,
        }
    }

    /// Classify the error by the layer that produced it.
    pub fn class(&self) -> ErrorClass {
        match self {
            NetError::Cancelled | NetError::ContextShutDown => ErrorClass::Application,
            NetError::InvalidRedirect
            | NetError::TooManyRedirects
            | NetError::UnsafeRedirect
            | NetError::InvalidResponse
            | NetError::InvalidChunkedEncoding
            | NetError::EmptyResponse
            | NetError::ResponseHeadersTooBig
            | NetError::ContentLengthMismatch
            | NetError::IncompleteChunkedEncoding
            | NetError::InvalidHttpResponse
            | NetError::MalformedHeader
            | NetError::UploadStreamRewindNotSupported
            | NetError::InvalidUtf8
            | NetError::JsonParseError => ErrorClass::Protocol,
            _ => ErrorClass::Transport,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NetError::Cancelled)
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -3 => NetError::Cancelled,
            -6 => NetError::FileNotFound,
            -7 => NetError::TimedOut,
            -10 => NetError::AccessDenied,
            -25 => NetError::UploadStreamRewindNotSupported,
            -26 => NetError::ContextShutDown,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -107 => NetError::SslProtocolError,
            -108 => NetError::AddressInvalid,
            -109 => NetError::AddressUnreachable,
            -111 => NetError::TunnelConnectionFailed,
            -118 => NetError::ConnectionTimedOut,
            -130 => NetError::ProxyConnectionFailed,
            -147 => NetError::AddressInUse,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -302 => NetError::UnknownUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -311 => NetError::UnsafeRedirect,
            -320 => NetError::InvalidResponse,
            -321 => NetError::InvalidChunkedEncoding,
            -322 => NetError::MethodNotSupported,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -354 => NetError::ContentLengthMismatch,
            -355 => NetError::IncompleteChunkedEncoding,
            -370 => NetError::InvalidHttpResponse,

            -400 => NetError::CacheMiss,

            -10001 => NetError::MalformedHeader,
            -10002 => NetError::MultiplexerFailed,
            -10003 => NetError::InvalidHeader,
            -10004 => NetError::InvalidUtf8,
            -10005 => NetError::JsonParseError,
            _ => NetError::Unknown(code),
        }
    }
}
