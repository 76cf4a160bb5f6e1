//! Audit event emission.
//!
//! Events are structured tracing records under the `audit` target; the
//! surrounding deployment ships them wherever audit trails live. Handlers
//! are responsible for not emitting on idempotent repeats.

use crate::auth::UserIdentity;

#[derive(Debug, Clone, Copy)]
pub enum AuditAction {
    PushManifest,
    DeleteManifest,
    PushTag,
    DeleteTag,
}

impl AuditAction {
    fn as_str(&self) -> &'static str {
        match self {
            AuditAction::PushManifest => "push_manifest",
            AuditAction::DeleteManifest => "delete_manifest",
            AuditAction::PushTag => "push_tag",
            AuditAction::DeleteTag => "delete_tag",
        }
    }
}

pub fn record(
    action: AuditAction,
    user: &UserIdentity,
    account_name: &str,
    repo_name: &str,
    target: &str,
) {
    tracing::info!(
        target: "audit",
        action = action.as_str(),
        user = %user.name(),
        account = account_name,
        repository = repo_name,
        target = target,
        "audit event"
    );
}
