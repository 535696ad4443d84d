//! The per-stream lifecycle state machine (RFC 7540 §5.1), reduced to the
//! transitions a client-initiated request stream actually exercises.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

#[derive(Debug)]
pub struct StreamMachine {
    state: StreamState,
}

impl StreamMachine {
    pub fn new() -> Self {
        Self { state: StreamState::Idle }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The client sent HEADERS (request headers, optionally with END_STREAM
    /// when there is no body).
    pub fn send_headers(&mut self, end_stream: bool) {
        self.state = if end_stream {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        };
    }

    /// The peer sent HEADERS or DATA carrying END_STREAM.
    pub fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn recv_rst(&mut self) {
        self.state = StreamState::Reset;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Reset)
    }
}

impl Default for StreamMachine {
    fn default() -> Self {
        Self::new()
    }
}
