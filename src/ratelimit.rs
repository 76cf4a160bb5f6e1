//! Rate limiting contract.
//!
//! Accounting lives outside this process; handlers only declare which
//! action a request performs and how much of it. The exceeded signal
//! carries the `Retry-After` hint verbatim into the 429 response.

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    BlobPull,
    BlobPush,
    ManifestPull,
    ManifestPush,
    /// Charged per response byte on blob GETs carrying
    /// `X-Keppel-Forwarded-By`.
    AnycastBlobBytePull,
}

#[derive(Debug)]
pub struct RateLimitExceeded {
    pub retry_after_secs: u32,
}

impl From<RateLimitExceeded> for RegistryError {
    fn from(e: RateLimitExceeded) -> Self {
        RegistryError::too_many_requests(e.retry_after_secs)
    }
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        account_name: &str,
        action: RateLimitAction,
        amount: u64,
    ) -> Result<(), RateLimitExceeded>;
}

/// Accepts everything; the default when no rate limit service is wired up.
pub struct NoRateLimiter;

#[async_trait::async_trait]
impl RateLimiter for NoRateLimiter {
    async fn check(
        &self,
        _account_name: &str,
        _action: RateLimitAction,
        _amount: u64,
    ) -> Result<(), RateLimitExceeded> {
        Ok(())
    }
}
