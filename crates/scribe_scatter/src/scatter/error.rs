//! Typed error surface shared by the dispatcher and its collaborators.

use std::error::Error;
use std::fmt;

use super::types::Document;

/// Error codes the dispatcher distinguishes.
///
/// The set is closed: remotes may report richer errors, but routing-side
/// decisions (retry classification, interrupt promotion) only depend on
/// these. Anything unrecognized maps to `UnknownError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    HostUnreachable,
    NetworkTimeout,
    ExceededTimeLimit,
    CallbackCanceled,
    ShardNotFound,
    FailedToSatisfyReadPreference,
    NotWritablePrimary,
    PrimarySteppedDown,
    InterruptedAtShutdown,
    ShutdownInProgress,
    Interrupted,
    CursorNotFound,
    QueryPlanKilled,
    Unauthorized,
    InvalidOptions,
    CommandFailed,
    UnknownError,
}

impl ErrorCode {
    /// Connection-level failures a fresh attempt may avoid.
    pub fn is_network_error(self) -> bool {
        matches!(self, Self::HostUnreachable | Self::NetworkTimeout)
    }

    /// The remote is not (or no longer) a writable primary.
    pub fn is_not_primary_error(self) -> bool {
        matches!(self, Self::NotWritablePrimary | Self::PrimarySteppedDown)
    }

    /// The remote is going down; a replacement member may take over.
    pub fn is_shutdown_error(self) -> bool {
        matches!(self, Self::InterruptedAtShutdown | Self::ShutdownInProgress)
    }

    /// A server-side cursor the operation depends on is gone.
    pub fn is_cursor_invalidated_error(self) -> bool {
        matches!(self, Self::CursorNotFound | Self::QueryPlanKilled)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::HostUnreachable => "HostUnreachable",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::ExceededTimeLimit => "ExceededTimeLimit",
            Self::CallbackCanceled => "CallbackCanceled",
            Self::ShardNotFound => "ShardNotFound",
            Self::FailedToSatisfyReadPreference => "FailedToSatisfyReadPreference",
            Self::NotWritablePrimary => "NotWritablePrimary",
            Self::PrimarySteppedDown => "PrimarySteppedDown",
            Self::InterruptedAtShutdown => "InterruptedAtShutdown",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::Interrupted => "Interrupted",
            Self::CursorNotFound => "CursorNotFound",
            Self::QueryPlanKilled => "QueryPlanKilled",
            Self::Unauthorized => "Unauthorized",
            Self::InvalidOptions => "InvalidOptions",
            Self::CommandFailed => "CommandFailed",
            Self::UnknownError => "UnknownError",
        }
    }

    /// Parse a wire-level code name. Unrecognized names yield `None` so the
    /// caller can pick its own fallback.
    pub fn from_name(name: &str) -> Option<Self> {
        let code = match name {
            "HostUnreachable" => Self::HostUnreachable,
            "NetworkTimeout" => Self::NetworkTimeout,
            "ExceededTimeLimit" => Self::ExceededTimeLimit,
            "CallbackCanceled" => Self::CallbackCanceled,
            "ShardNotFound" => Self::ShardNotFound,
            "FailedToSatisfyReadPreference" => Self::FailedToSatisfyReadPreference,
            "NotWritablePrimary" => Self::NotWritablePrimary,
            "PrimarySteppedDown" => Self::PrimarySteppedDown,
            "InterruptedAtShutdown" => Self::InterruptedAtShutdown,
            "ShutdownInProgress" => Self::ShutdownInProgress,
            "Interrupted" => Self::Interrupted,
            "CursorNotFound" => Self::CursorNotFound,
            "QueryPlanKilled" => Self::QueryPlanKilled,
            "Unauthorized" => Self::Unauthorized,
            "InvalidOptions" => Self::InvalidOptions,
            "CommandFailed" => Self::CommandFailed,
            "UnknownError" => Self::UnknownError,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error code plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: ErrorCode,
    pub message: String,
}

impl Status {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for Status {}

/// Extract the command-level status embedded in a response body.
///
/// A remote can answer the transport successfully while reporting a command
/// failure in the body (`{ok: 0, codeName, errmsg}`). `ok: 1` is success; a
/// missing or non-numeric `ok` field is a malformed reply.
pub fn command_result_status(body: &Document) -> Result<(), Status> {
    let Some(ok) = body.get("ok").and_then(Document::as_f64) else {
        return Err(Status::new(
            ErrorCode::CommandFailed,
            "command reply has no numeric 'ok' field",
        ));
    };
    if ok != 0.0 {
        return Ok(());
    }

    let code = body
        .get("codeName")
        .and_then(Document::as_str)
        .and_then(ErrorCode::from_name)
        .unwrap_or(ErrorCode::UnknownError);
    let message = body
        .get("errmsg")
        .and_then(Document::as_str)
        .unwrap_or("command failed")
        .to_string();
    Err(Status::new(code, message))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ok_reply_is_success() {
        assert!(command_result_status(&json!({"ok": 1})).is_ok());
        assert!(command_result_status(&json!({"ok": 1.0, "n": 3})).is_ok());
    }

    #[test]
    fn embedded_error_carries_code_and_message() {
        let body = json!({"ok": 0, "codeName": "Unauthorized", "errmsg": "not allowed"});
        let status = command_result_status(&body).unwrap_err();
        assert_eq!(status.code, ErrorCode::Unauthorized);
        assert_eq!(status.message, "not allowed");
    }

    #[test]
    fn unknown_code_name_falls_back_to_unknown_error() {
        let body = json!({"ok": 0, "codeName": "SomethingNew"});
        let status = command_result_status(&body).unwrap_err();
        assert_eq!(status.code, ErrorCode::UnknownError);
    }

    #[test]
    fn malformed_reply_is_a_command_failure() {
        let status = command_result_status(&json!({"n": 1})).unwrap_err();
        assert_eq!(status.code, ErrorCode::CommandFailed);

        let status = command_result_status(&json!("nope")).unwrap_err();
        assert_eq!(status.code, ErrorCode::CommandFailed);
    }
}
