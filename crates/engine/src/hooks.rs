//! Named injection points an attempt and the cleaner consult at every
//! externally-observable state transition. Production code gets the
//! default no-op implementation; tests override individual points.

use txn_types::ErrorClass;

/// What a hook wants to happen instead of the default behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    /// Proceed as normal.
    Continue,
    /// Fail the operation as if the underlying call returned this class.
    Err(ErrorClass),
    /// Substitute this value for whatever the operation would have produced.
    Override(serde_json::Value),
}

/// One function per named decision point in the attempt/cleaner lifecycle.
/// All methods default to [`HookAction::Continue`].
pub trait TransactionHooks: Send + Sync {
    fn before_atr_commit(&self) -> HookAction {
        HookAction::Continue
    }

    fn before_staged_insert(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn before_staged_replace(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn before_staged_remove(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn before_doc_committed(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn after_doc_committed(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn before_rollback_delete_inserted(&self, _id: &str) -> HookAction {
        HookAction::Continue
    }

    fn before_atr_rolled_back(&self) -> HookAction {
        HookAction::Continue
    }

    fn has_expired_client_side(&self, _place: &str) -> Option<bool> {
        None
    }

    /// Override the 1..=1024 hash used to pick the first write's ATR id.
    fn random_atr_id_for_vbucket(&self) -> Option<u16> {
        None
    }

    fn client_record_before_update(&self) -> HookAction {
        HookAction::Continue
    }

    fn before_query(&self, _statement: &str) -> HookAction {
        HookAction::Continue
    }
}

/// The hook set production code runs with: every point returns `Continue`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl TransactionHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailInsert;
    impl TransactionHooks for FailInsert {
        fn before_staged_insert(&self, _id: &str) -> HookAction {
            HookAction::Err(ErrorClass::FailOther)
        }
    }

    #[test]
    fn noop_hooks_always_continue() {
        let hooks = NoopHooks;
        assert_eq!(hooks.before_atr_commit(), HookAction::Continue);
        assert_eq!(hooks.before_staged_insert("doc-1"), HookAction::Continue);
    }

    #[test]
    fn override_hook_is_observed() {
        let hooks = FailInsert;
        assert_eq!(
            hooks.before_staged_insert("doc-1"),
            HookAction::Err(ErrorClass::FailOther)
        );
    }
}
