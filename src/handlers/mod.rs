use axum::http::StatusCode;

use crate::{
    database::{queries, Database},
    error::{RegistryError, Result},
    models::Account,
};

pub mod blobs;
pub mod catalog;
pub mod manifests;
pub mod referrers;
pub mod uploads;

/// Rejects with 409 `DENIED` once the tenant's manifest usage has reached
/// its quota. Tenants without a quota row are unlimited. Runs before new
/// upload sessions and before manifest PUTs.
pub(crate) async fn ensure_quota(db: &Database, account: &Account) -> Result<()> {
    let quota = match queries::get_quota(db, &account.auth_tenant_id).await? {
        Some(quota) => quota,
        None => return Ok(()),
    };
    let usage = queries::manifest_usage(db, &account.auth_tenant_id).await?;
    if usage >= quota.manifests_max {
        return Err(RegistryError::denied(format!(
            "manifest quota exceeded (quota = {}, usage = {})",
            quota.manifests_max, usage
        ))
        .with_status(StatusCode::CONFLICT)
        .into());
    }
    Ok(())
}
