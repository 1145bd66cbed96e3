use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::traits::{AuditRecord, AuditStore};

/// Write handle over an [`AuditStore`] for the supervision paths.
///
/// A failed append is logged, never propagated to the caller.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub async fn record(&self, at: DateTime<Utc>, record: AuditRecord) {
        let kind = record.kind().to_string();
        if let Err(e) = self.store.append(at, record).await {
            log::error!("Failed to append {} audit record: {:#}", kind, e);
        }
    }
}
