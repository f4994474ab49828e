//! The enforcement vocabulary shared with end-user clients.
//!
//! Both enums travel as raw integer codes on every wire surface (WebSocket
//! and broker), so they (de)serialize through `u8` instead of their variant
//! names. Unknown codes are rejected at the deserialization boundary.

use serde::{Deserialize, Serialize};

/// What the client is told to do in response to a verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    /// Nothing to enforce.
    NoAction,
    /// Lock the client's screen.
    LockScreen,
    /// Sign the user out.
    SignOut,
    /// A non-enforcing warning.
    Warning,
    /// A server-side error condition.
    Error,
}

/// Why an [`Action`] was taken.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Reason {
    /// No particular reason (paired with [`Action::NoAction`]).
    Empty,
    /// A phone was detected in the frame.
    PhoneDetection,
    /// The client's cable was removed.
    CableRemoved,
    /// The client's camera is no longer attached.
    CameraDetached,
    /// The client lost connectivity.
    Connectivity,
    /// The presented face was classified as a spoof.
    SpoofImage,
    /// The presented face does not match the enrolled user.
    WrongUser,
    /// No face was found in the frame.
    NoFace,
    /// The client is administratively blocked.
    Blocked,
    /// The client is administratively paused.
    Paused,
    /// The client was resumed after a pause.
    Resumed,
    /// No enrolment exists for this client.
    NotAvailable,
    /// The client was denied by the rate limiter.
    RateLimitExceeded,
}

impl From<Action> for u8 {
    fn from(value: Action) -> Self {
        match value {
            Action::NoAction => 0,
            Action::LockScreen => 1,
            Action::SignOut => 2,
            Action::Warning => 3,
            Action::Error => 4,
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(Action::NoAction),
            1 => Ok(Action::LockScreen),
            2 => Ok(Action::SignOut),
            3 => Ok(Action::Warning),
            4 => Ok(Action::Error),
            other => Err(UnknownCode("action", other)),
        }
    }
}

impl From<Reason> for u8 {
    fn from(value: Reason) -> Self {
        match value {
            Reason::Empty => 0,
            Reason::PhoneDetection => 1,
            Reason::CableRemoved => 2,
            Reason::CameraDetached => 3,
            Reason::Connectivity => 4,
            Reason::SpoofImage => 5,
            Reason::WrongUser => 6,
            Reason::NoFace => 7,
            Reason::Blocked => 8,
            Reason::Paused => 9,
            Reason::Resumed => 10,
            Reason::NotAvailable => 11,
            Reason::RateLimitExceeded => 12,
        }
    }
}

impl TryFrom<u8> for Reason {
    type Error = UnknownCode;

    fn try_from(value: u8) -> Result<Self, UnknownCode> {
        match value {
            0 => Ok(Reason::Empty),
            1 => Ok(Reason::PhoneDetection),
            2 => Ok(Reason::CableRemoved),
            3 => Ok(Reason::CameraDetached),
            4 => Ok(Reason::Connectivity),
            5 => Ok(Reason::SpoofImage),
            6 => Ok(Reason::WrongUser),
            7 => Ok(Reason::NoFace),
            8 => Ok(Reason::Blocked),
            9 => Ok(Reason::Paused),
            10 => Ok(Reason::Resumed),
            11 => Ok(Reason::NotAvailable),
            12 => Ok(Reason::RateLimitExceeded),
            other => Err(UnknownCode("reason", other)),
        }
    }
}

/// A code on the wire that is not part of the vocabulary.
#[derive(Debug, thiserror::Error)]
#[error("unknown {0} code: {1}")]
pub struct UnknownCode(&'static str, u8);

impl Action {
    /// Path segment used in saved-action keys, e.g. `Lock_screen`.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Action::NoAction => "No_action",
            Action::LockScreen => "Lock_screen",
            Action::SignOut => "Sign_out",
            Action::Warning => "Warning",
            Action::Error => "Error",
        }
    }
}

impl Reason {
    /// Path segment used in saved-action keys, e.g. `Wrong_user`.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Reason::Empty => "Empty_reason",
            Reason::PhoneDetection => "Phone_detection",
            Reason::CableRemoved => "Cable_removed",
            Reason::CameraDetached => "Camera_detached",
            Reason::Connectivity => "Connectivity",
            Reason::SpoofImage => "Spoof_image",
            Reason::WrongUser => "Wrong_user",
            Reason::NoFace => "No_face",
            Reason::Blocked => "Blocked",
            Reason::Paused => "Paused",
            Reason::Resumed => "Resumed",
            Reason::NotAvailable => "Not_available",
            Reason::RateLimitExceeded => "Rate_limit_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 0u8..=4 {
            assert_eq!(u8::from(Action::try_from(code).unwrap()), code);
        }
        for code in 0u8..=12 {
            assert_eq!(u8::from(Reason::try_from(code).unwrap()), code);
        }
        assert!(Action::try_from(5).is_err());
        assert!(Reason::try_from(13).is_err());
    }

    #[test]
    fn serializes_as_integers() {
        assert_eq!(serde_json::to_string(&Action::SignOut).unwrap(), "2");
        assert_eq!(
            serde_json::from_str::<Reason>("12").unwrap(),
            Reason::RateLimitExceeded
        );
    }
}
