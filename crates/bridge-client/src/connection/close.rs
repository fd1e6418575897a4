//! Close code classification.

/// WebSocket close codes the client acts on
pub mod close_codes {
    /// Host initiated, orderly shutdown
    pub const NORMAL: u16 = 1000;
    /// Close frame carried no status code
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame
    pub const ABNORMAL: u16 = 1006;
    /// Server rejected the presented identity
    pub const POLICY_VIOLATION: u16 = 1008;
}

/// What the connection manager does after a channel closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Orderly shutdown; settle in `disconnected`
    Settle,
    /// Identity rejected; settle in `disconnected` and report a resettable error
    Rejected,
    /// Transient failure; apply the reconnection policy
    Retry,
}

impl CloseDisposition {
    /// Classify a close code
    pub fn from_code(code: u16) -> Self {
        match code {
            close_codes::NORMAL => Self::Settle,
            close_codes::POLICY_VIOLATION => Self::Rejected,
            _ => Self::Retry,
        }
    }
}
