//! Protocol error codes and the mesh error type.
//!
//! Every failure that can cross the wire is a [`NetError`]: a stable numeric
//! [`ErrCode`], a human-readable text, and an `issue` tag naming the layer
//! that raised it. The same type doubles as the library's error currency so
//! that a remote failure and a local one look identical to callers.

use thiserror::Error;

/// Issue tag for errors raised by the transport and routing layers.
pub const ISSUE_INFRA: &str = "Infra";

/// Stable numeric error codes carried in `Accept` and `Response` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrCode {
    /// Healthy response; reserved for code zero.
    Success,
    /// Inbound JSON or framing data was malformed.
    Parsing,
    /// First byte of a frame was outside the recognised set.
    UnknownMsgType,
    /// Frame exceeded the wire size cap.
    TooLargeSize,
    /// No session is available for the target service provider.
    NoRoute,
    /// The underlying TCP read or write failed.
    Transport,
    /// No response arrived within the request deadline.
    Timeout,
    /// No handler is registered for the Api on this node.
    UnknownApi,
    /// A federated request was missing the declared key field.
    NoKey,
    /// A programming invariant was violated.
    Internal,
}

impl ErrCode {
    /// Numeric wire value of this code.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Parsing => 1,
            Self::UnknownMsgType => 2,
            Self::TooLargeSize => 3,
            Self::NoRoute => 4,
            Self::Transport => 5,
            Self::Timeout => 6,
            Self::UnknownApi => 7,
            Self::NoKey => 8,
            Self::Internal => 9,
        }
    }

    /// Map a wire value back onto a code.
    ///
    /// Values outside the known set fold into [`ErrCode::Internal`] so a
    /// newer peer cannot smuggle an unclassifiable failure past callers.
    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        match v {
            0 => Self::Success,
            1 => Self::Parsing,
            2 => Self::UnknownMsgType,
            3 => Self::TooLargeSize,
            4 => Self::NoRoute,
            5 => Self::Transport,
            6 => Self::Timeout,
            7 => Self::UnknownApi,
            8 => Self::NoKey,
            _ => Self::Internal,
        }
    }
}

/// A mesh-level failure, carried verbatim in error headers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{text} (code {})", .code.as_u32())]
pub struct NetError {
    /// Stable error code.
    pub code: ErrCode,
    /// Human-readable description.
    pub text: String,
    /// Layer that raised the error.
    pub issue: String,
}

impl NetError {
    /// Build an error raised by the transport/routing infrastructure.
    #[must_use]
    pub fn new(code: ErrCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            issue: ISSUE_INFRA.to_owned(),
        }
    }

    /// Build an application-level error with an explicit issue tag.
    #[must_use]
    pub fn with_issue(code: ErrCode, text: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            issue: issue.into(),
        }
    }

    /// True when this value represents a healthy response.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == ErrCode::Success
    }

    pub(crate) fn parsing(text: impl Into<String>) -> Self {
        Self::new(ErrCode::Parsing, text)
    }

    pub(crate) fn transport(text: impl Into<String>) -> Self {
        Self::new(ErrCode::Transport, text)
    }

    pub(crate) fn internal(text: impl Into<String>) -> Self {
        Self::new(ErrCode::Internal, text)
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> Self {
        Self::transport(e.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        Self::parsing(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in [
            ErrCode::Success,
            ErrCode::Parsing,
            ErrCode::UnknownMsgType,
            ErrCode::TooLargeSize,
            ErrCode::NoRoute,
            ErrCode::Transport,
            ErrCode::Timeout,
            ErrCode::UnknownApi,
            ErrCode::NoKey,
            ErrCode::Internal,
        ] {
            assert_eq!(ErrCode::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn unknown_wire_value_folds_to_internal() {
        assert_eq!(ErrCode::from_u32(4096), ErrCode::Internal);
    }

    #[test]
    fn display_includes_code() {
        let err = NetError::new(ErrCode::NoRoute, "no session for Spn");
        assert_eq!(err.to_string(), "no session for Spn (code 4)");
    }
}
