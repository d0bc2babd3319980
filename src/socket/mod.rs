//! Transfer plumbing: the transport boundary, per-transfer handles, the
//! shared multiplexer and its timer, and the built-in TCP transport.

pub mod handle;
pub mod multiplexer;
pub mod proxy;
pub mod tcp;
pub mod timeout;
pub mod transport;

pub use handle::{BodyLength, TlsVersion, TransferConfig, TransferHandle};
pub use multiplexer::Multiplexer;
pub use proxy::ProxySettings;
pub use tcp::TcpTransport;
pub use timeout::TimeoutSource;
pub use transport::{
    HandleAction, PauseState, Readiness, SocketId, SocketInterest, SocketUpdate, TransferEvents,
    TransferId, Transport, Trigger,
};
