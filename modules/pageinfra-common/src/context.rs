use uuid::Uuid;

/// Correlation fields passed explicitly into every engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContext {
    pub marketplace: String,
    pub run_id: Uuid,
}

impl LogContext {
    pub fn new(marketplace: impl Into<String>) -> Self {
        Self {
            marketplace: marketplace.into(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    /// Span carrying the correlation fields; enter it around an operation.
    pub fn span(&self, operation: &'static str) -> tracing::Span {
        tracing::info_span!(
            "pageinfra",
            operation,
            marketplace = %self.marketplace,
            run_id = %self.run_id,
        )
    }
}
