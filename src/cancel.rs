use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::IngestError;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self, context: &str) -> Result<(), IngestError> {
        if self.is_cancelled() {
            return Err(IngestError::Cancelled(context.to_string()));
        }
        Ok(())
    }
}
