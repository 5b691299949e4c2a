//! Retry classification for per-remote failures.

use super::error::ErrorCode;

/// Selects which error codes justify rescheduling a remote.
///
/// The policy is a pure predicate over `ErrorCode`; the retry budget lives in
/// the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Never reschedule; every error is terminal.
    NoRetry,
    /// Reschedule errors that cannot have applied the command twice:
    /// network, not-primary, and shutdown failures.
    Idempotent,
    /// Like `Idempotent`, additionally covering invalidated server-side
    /// cursors.
    IdempotentOrCursorInvalidated,
}

impl RetryPolicy {
    pub fn is_retriable(self, code: ErrorCode) -> bool {
        match self {
            Self::NoRetry => false,
            Self::Idempotent => {
                code.is_network_error() || code.is_not_primary_error() || code.is_shutdown_error()
            }
            Self::IdempotentOrCursorInvalidated => {
                Self::Idempotent.is_retriable(code) || code.is_cursor_invalidated_error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_retry_rejects_everything() {
        assert!(!RetryPolicy::NoRetry.is_retriable(ErrorCode::HostUnreachable));
        assert!(!RetryPolicy::NoRetry.is_retriable(ErrorCode::NotWritablePrimary));
    }

    #[test]
    fn idempotent_covers_network_and_not_primary() {
        let policy = RetryPolicy::Idempotent;
        assert!(policy.is_retriable(ErrorCode::HostUnreachable));
        assert!(policy.is_retriable(ErrorCode::NetworkTimeout));
        assert!(policy.is_retriable(ErrorCode::NotWritablePrimary));
        assert!(policy.is_retriable(ErrorCode::PrimarySteppedDown));
        assert!(policy.is_retriable(ErrorCode::ShutdownInProgress));

        assert!(!policy.is_retriable(ErrorCode::Unauthorized));
        assert!(!policy.is_retriable(ErrorCode::ShardNotFound));
        assert!(!policy.is_retriable(ErrorCode::CursorNotFound));
        assert!(!policy.is_retriable(ErrorCode::CallbackCanceled));
    }

    #[test]
    fn cursor_invalidation_only_widens_the_idempotent_set() {
        let policy = RetryPolicy::IdempotentOrCursorInvalidated;
        assert!(policy.is_retriable(ErrorCode::CursorNotFound));
        assert!(policy.is_retriable(ErrorCode::QueryPlanKilled));
        assert!(policy.is_retriable(ErrorCode::HostUnreachable));
        assert!(!policy.is_retriable(ErrorCode::InvalidOptions));
    }
}
