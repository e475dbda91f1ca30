use crate::config::ConfigError;
use crate::reading::DecodeError;
use crate::store::StoreError;

/// Failure taxonomy shared by the ingest path and the ETL cycle. None of
/// these terminate the process once the pipeline is running; they surface as
/// counters in the health report.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    MalformedReading(#[from] DecodeError),
    #[error("ingestion queue full ({capacity} readings); reading dropped")]
    QueueOverflow { capacity: usize },
    #[error("store failure after {attempts} attempt(s): {source}")]
    Store {
        attempts: u32,
        #[source]
        source: StoreError,
    },
    #[error("quality gate rejected window of {window_len} records: {failed_checks}")]
    QualityRejected {
        window_len: usize,
        failed_checks: String,
    },
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl PipelineError {
    pub fn is_transient_store_failure(&self) -> bool {
        matches!(self, PipelineError::Store { source, .. } if source.is_transient())
    }
}
