//! Session state: the resume checkpoint and connection status.

use std::fmt;

use crate::model::Ready;

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Disconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// The resumable part of a gateway session. Owned by the gateway task,
/// never shared.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    pub sequence: Option<u64>,
}

impl SessionState {
    /// Track a DISPATCH sequence number. Sequences are non-decreasing
    /// within a session; a stale replay never lowers the checkpoint.
    pub fn observe_sequence(&mut self, s: u64) {
        self.sequence = Some(self.sequence.map_or(s, |current| current.max(s)));
    }

    pub fn on_ready(&mut self, ready: &Ready) {
        self.session_id = Some(ready.session_id.clone());
        self.resume_url = Some(ready.resume_gateway_url.clone());
    }

    /// Both a session ID and a checkpoint are needed to RESUME.
    #[must_use]
    pub const fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    /// Forget everything; the next connect must IDENTIFY.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
    }
}
