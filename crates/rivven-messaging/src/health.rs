use crate::error::Result;
use async_trait::async_trait;

/// Contract expected by a health-check registry
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Stable component name used as the registry key
    fn name(&self) -> &str;

    /// Current statistics. Succeeds unless the broker client itself panics.
    async fn status_check(&self) -> Result<serde_json::Value>;
}
