//! Reconciler that logs each key it receives.

use async_trait::async_trait;
use podwatch_queue::{ReconcileError, Reconciler, split_meta_namespace_key};
use tracing::info;

/// Logs every key handed to it and always succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReconciler;

#[async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, key: &str) -> Result<(), ReconcileError> {
        let (namespace, name) = split_meta_namespace_key(key)
            .map_err(|e| ReconcileError::Permanent(e.to_string()))?;
        info!(key, namespace = namespace.unwrap_or(""), name, "Received key");
        Ok(())
    }
}
