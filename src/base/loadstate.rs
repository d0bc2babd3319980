/// The current load state of a task.
/// This roughly matches net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LoadState {
    /// The task is idle (not started, finished, or fulfilled from cache).
    #[default]
    Idle = 0,

    /// Waiting for the delegate to decide on a redirect or a response.
    WaitingForDelegate = 1,

    /// Resolving and connecting to the host.
    Connecting = 2,

    /// Sending the request body.
    SendingRequest = 3,

    /// Waiting for the server response (TTFB).
    WaitingForResponse = 4,

    /// Reading the response body.
    ReadingResponse = 5,
}

impl LoadState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadState::WaitingForDelegate,
            2 => LoadState::Connecting,
            3 => LoadState::SendingRequest,
            4 => LoadState::WaitingForResponse,
            5 => LoadState::ReadingResponse,
            _ => LoadState::Idle,
        }
    }
}
