//! Public error taxonomy and the underlying error-kind inputs that feed
//! the classification table.

use thiserror::Error;

/// What a `KvStore`/`QueryEngine` implementation reports back for a failed
/// operation; the input to `txn_concurrency::classify`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvErrorKind {
    #[error("document not found")]
    DocumentNotFound,
    #[error("document already exists")]
    DocumentExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("value too large")]
    ValueTooLarge,
    #[error("unambiguous timeout")]
    UnambiguousTimeout,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("durable write in progress")]
    DurableWriteInProgress,
    #[error("durability ambiguous")]
    DurabilityAmbiguous,
    #[error("ambiguous timeout")]
    AmbiguousTimeout,
    #[error("request canceled")]
    RequestCanceled,
    #[error("path not found")]
    PathNotFound,
    #[error("path exists")]
    PathExists,
    #[error("feature not available")]
    FeatureNotAvailable,
    #[error("durability impossible")]
    DurabilityImpossible,
    #[error("other: {0}")]
    Other(String),
}

/// The closed set of error classes an operation's underlying failure
/// resolves to, in their canonical declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorClass {
    #[error("FAIL_HARD")]
    FailHard,
    #[error("FAIL_OTHER")]
    FailOther,
    #[error("FAIL_TRANSIENT")]
    FailTransient,
    #[error("FAIL_AMBIGUOUS")]
    FailAmbiguous,
    #[error("FAIL_DOC_ALREADY_EXISTS")]
    FailDocAlreadyExists,
    #[error("FAIL_DOC_NOT_FOUND")]
    FailDocNotFound,
    #[error("FAIL_PATH_NOT_FOUND")]
    FailPathNotFound,
    #[error("FAIL_CAS_MISMATCH")]
    FailCasMismatch,
    #[error("FAIL_WRITE_WRITE_CONFLICT")]
    FailWriteWriteConflict,
    #[error("FAIL_ATR_FULL")]
    FailAtrFull,
    #[error("FAIL_PATH_ALREADY_EXISTS")]
    FailPathAlreadyExists,
    #[error("FAIL_EXPIRY")]
    FailExpiry,
}

/// The retry/abort policy attached to an `ErrorClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Retry the op within the attempt.
    RetryOp,
    /// Treat as transient unless the attempt has expired.
    RetryUnlessExpired,
    /// Abort the attempt with `EXPIRED`.
    AbortExpired,
    /// Abort the attempt with `FAILED`; retried at the transaction level.
    AbortFailed,
    /// Abort the whole transaction without rollback.
    AbortHard,
    /// No special policy; surfaces as a generic op failure.
    None,
}

impl ErrorClass {
    pub fn policy(self) -> ErrorPolicy {
        match self {
            ErrorClass::FailTransient => ErrorPolicy::RetryOp,
            ErrorClass::FailAmbiguous => ErrorPolicy::RetryUnlessExpired,
            ErrorClass::FailExpiry => ErrorPolicy::AbortExpired,
            ErrorClass::FailCasMismatch => ErrorPolicy::AbortFailed,
            ErrorClass::FailHard => ErrorPolicy::AbortHard,
            ErrorClass::FailWriteWriteConflict => ErrorPolicy::RetryOp,
            _ => ErrorPolicy::None,
        }
    }
}

/// Diagnostic chaining cause, attached to a `FAILED`/`EXPIRED` outcome for
/// the application to inspect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorCause {
    #[error("document not found")]
    DocumentNotFoundException,
    #[error("document already exists")]
    DocumentExistsException,
    #[error("document already in transaction")]
    DocumentAlreadyInTransaction,
    #[error("active transaction record not found")]
    ActiveTransactionRecordNotFound,
    #[error("active transaction record entry not found")]
    ActiveTransactionRecordEntryNotFound,
    #[error("active transaction record full")]
    ActiveTransactionRecordFull,
    #[error("transaction aborted externally")]
    TransactionAbortedExternally,
    #[error("previous operation failed")]
    PreviousOperationFailed,
    #[error("forward compatibility failure")]
    ForwardCompatibilityFailure,
    #[error("parsing failure")]
    ParsingFailure,
    #[error("illegal state")]
    IllegalStateException,
    #[error("feature not available")]
    FeatureNotAvailableException,
    #[error("request canceled")]
    RequestCanceledException,
    #[error("concurrent operations detected on same document")]
    ConcurrentOperationsDetectedOnSameDocument,
    #[error("commit not permitted")]
    CommitNotPermitted,
    #[error("rollback not permitted")]
    RollbackNotPermitted,
    #[error("transaction already committed")]
    TransactionAlreadyCommitted,
    #[error("transaction already aborted")]
    TransactionAlreadyAborted,
}

/// The outcome of a whole transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionResult {
    Success { unstaging_complete: bool },
    Failed { cause: Option<ErrorCause> },
    Expired,
    CommitAmbiguous { unstaging_complete: bool },
}

impl TransactionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionResult::Success { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_matches_spec() {
        assert_eq!(ErrorClass::FailTransient.policy(), ErrorPolicy::RetryOp);
        assert_eq!(
            ErrorClass::FailAmbiguous.policy(),
            ErrorPolicy::RetryUnlessExpired
        );
        assert_eq!(ErrorClass::FailExpiry.policy(), ErrorPolicy::AbortExpired);
        assert_eq!(
            ErrorClass::FailCasMismatch.policy(),
            ErrorPolicy::AbortFailed
        );
        assert_eq!(ErrorClass::FailHard.policy(), ErrorPolicy::AbortHard);
    }
}
