//! Error classification: maps an underlying `KvErrorKind` into an
//! `ErrorClass`, taking into account the ATR-context special case for
//! `ValueTooLarge`.

use txn_types::{ErrorClass, KvErrorKind};

/// Extra context classification needs beyond the bare error kind: whether
/// the failing operation was a write to the ATR document itself
/// (`value_too_large` there means the ATR document is full).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorContext {
    pub in_atr: bool,
}

/// Classify an underlying KV error kind into its `ErrorClass`.
pub fn classify(kind: &KvErrorKind, ctx: ErrorContext) -> ErrorClass {
    match kind {
        KvErrorKind::DocumentNotFound => ErrorClass::FailDocNotFound,
        KvErrorKind::DocumentExists => ErrorClass::FailDocAlreadyExists,
        KvErrorKind::CasMismatch => ErrorClass::FailCasMismatch,
        KvErrorKind::ValueTooLarge if ctx.in_atr => ErrorClass::FailAtrFull,
        KvErrorKind::UnambiguousTimeout
        | KvErrorKind::TemporaryFailure
        | KvErrorKind::DurableWriteInProgress => ErrorClass::FailTransient,
        KvErrorKind::DurabilityAmbiguous
        | KvErrorKind::AmbiguousTimeout
        | KvErrorKind::RequestCanceled => ErrorClass::FailAmbiguous,
        KvErrorKind::PathNotFound => ErrorClass::FailPathNotFound,
        KvErrorKind::PathExists => ErrorClass::FailPathAlreadyExists,
        _ => ErrorClass::FailOther,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_each_row_of_the_table() {
        assert_eq!(
            classify(&KvErrorKind::DocumentNotFound, ErrorContext::default()),
            ErrorClass::FailDocNotFound
        );
        assert_eq!(
            classify(&KvErrorKind::DocumentExists, ErrorContext::default()),
            ErrorClass::FailDocAlreadyExists
        );
        assert_eq!(
            classify(&KvErrorKind::CasMismatch, ErrorContext::default()),
            ErrorClass::FailCasMismatch
        );
        assert_eq!(
            classify(&KvErrorKind::UnambiguousTimeout, ErrorContext::default()),
            ErrorClass::FailTransient
        );
        assert_eq!(
            classify(&KvErrorKind::DurabilityAmbiguous, ErrorContext::default()),
            ErrorClass::FailAmbiguous
        );
        assert_eq!(
            classify(&KvErrorKind::PathNotFound, ErrorContext::default()),
            ErrorClass::FailPathNotFound
        );
        assert_eq!(
            classify(&KvErrorKind::PathExists, ErrorContext::default()),
            ErrorClass::FailPathAlreadyExists
        );
        assert_eq!(
            classify(&KvErrorKind::Other("x".into()), ErrorContext::default()),
            ErrorClass::FailOther
        );
    }

    #[test]
    fn value_too_large_depends_on_atr_context() {
        assert_eq!(
            classify(&KvErrorKind::ValueTooLarge, ErrorContext { in_atr: true }),
            ErrorClass::FailAtrFull
        );
        assert_eq!(
            classify(&KvErrorKind::ValueTooLarge, ErrorContext { in_atr: false }),
            ErrorClass::FailOther
        );
    }
}
