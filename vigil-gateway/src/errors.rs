//! Session-terminating conditions and their close frames.

use axum::extract::ws::{CloseFrame, close_code};
use vigil_types::ws_close_codes;

/// Why a session ended.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    /// The peer closed (gracefully or not); `code` is the peer's close code.
    #[error("connection closed by peer")]
    PeerClosed(Option<u16>),
    /// No frame arrived within the configured read timeout.
    #[error("read timeout")]
    Timeout,
    /// The client is administratively blocked.
    #[error("client is blocked")]
    Blocked,
    /// The client has no enrolment.
    #[error("client is not available")]
    NotAvailable,
    /// The rate limiter denied the current frame.
    #[error("rate limit exceeded")]
    RateLimited,
    /// The frame could not be persisted or the envelope not published.
    #[error("storage failure")]
    Storage,
    /// The outbound sender side was replaced by a reconnect.
    #[error("session superseded")]
    Superseded,
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] axum::Error),
}

impl SessionError {
    /// Transforms the error into a close frame, if one should be sent.
    pub(crate) fn into_close_frame(self) -> Option<CloseFrame> {
        tracing::debug!("session ended: {self:?}");
        match self {
            SessionError::PeerClosed(_) => None,
            SessionError::Timeout => Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "timeout".into(),
            }),
            SessionError::Blocked => Some(CloseFrame {
                code: ws_close_codes::POLICY,
                reason: "blocked".into(),
            }),
            SessionError::NotAvailable => Some(CloseFrame {
                code: ws_close_codes::POLICY,
                reason: "not available".into(),
            }),
            SessionError::RateLimited => Some(CloseFrame {
                code: ws_close_codes::RATE_LIMITED,
                reason: "rate limit exceeded".into(),
            }),
            SessionError::Storage => Some(CloseFrame {
                code: ws_close_codes::STORAGE_FAILURE,
                reason: "storage failure".into(),
            }),
            SessionError::Superseded => None,
            SessionError::Transport(err) => {
                tracing::trace!("transport error: {err:?}");
                None
            }
        }
    }
}
